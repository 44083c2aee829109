//! Request orchestration (spec.md §4.6): the only component that talks to
//! every other subsystem. Structured as a single `handle` entry point
//! that always runs the transparency commit as its last act, however the
//! pipeline above it concluded — mirroring the teacher's `dispatch`
//! (`serverless::sql_over_http`) shape of "resolve, dispatch, always
//! record", just generalized across four gating stages instead of one.

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use chrono::Utc;

use crate::bot::BotClassifier;
use crate::config::AppConfig;
use crate::error::{GatewayError, ReportableError};
use crate::ids::ServiceId;
use crate::key_directory::KeyDirectory;
use crate::limiter::Limiter;
use crate::metrics;
use crate::model::{ApiKey, BotAction, Service};
use crate::store::Store;
use crate::transparency::TransparencyLog;
use crate::watermark::{BodyKind, WatermarkTuple, Watermarker};

/// Request headers the gateway strips before forwarding upstream, or
/// before forwarding the upstream's response back to the caller
/// (spec.md §4.6 steps 7 and 10 share the same exclusion style, applied
/// to opposite directions).
const HOP_BY_HOP_REQUEST_HEADERS: &[&str] = &["host", "content-length", "x-api-key", "connection", "transfer-encoding"];
const STRIPPED_RESPONSE_HEADERS: &[&str] = &["content-length", "connection", "transfer-encoding", "content-encoding"];

pub struct ProxyRequest {
    pub service_id: ServiceId,
    pub method: Method,
    pub path_suffix: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub api_key_secret: Option<String>,
}

pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct ProxyEngine {
    store: Arc<dyn Store>,
    key_directory: Arc<KeyDirectory>,
    limiter: Arc<Limiter>,
    bot_classifier: Arc<BotClassifier>,
    transparency: Arc<TransparencyLog>,
    http_client: reqwest::Client,
}

impl ProxyEngine {
    pub fn new(
        store: Arc<dyn Store>,
        key_directory: Arc<KeyDirectory>,
        limiter: Arc<Limiter>,
        bot_classifier: Arc<BotClassifier>,
        transparency: Arc<TransparencyLog>,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(AppConfig::UPSTREAM_TOTAL_TIMEOUT)
            .connect_timeout(AppConfig::UPSTREAM_CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .expect("failed to build upstream http client");
        Self::with_client(store, key_directory, limiter, bot_classifier, transparency, http_client)
    }

    /// Same as `new`, but with an explicit upstream client — used by tests
    /// to exercise a short timeout without a 30-second sleep.
    pub fn with_client(
        store: Arc<dyn Store>,
        key_directory: Arc<KeyDirectory>,
        limiter: Arc<Limiter>,
        bot_classifier: Arc<BotClassifier>,
        transparency: Arc<TransparencyLog>,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            store,
            key_directory,
            limiter,
            bot_classifier,
            transparency,
            http_client,
        }
    }

    pub async fn handle(&self, req: ProxyRequest) -> Result<ProxyResponse, GatewayError> {
        let request_path = format!("/proxy/{}/{}", req.service_id, req.path_suffix);
        let started_at = Utc::now();

        let service = self
            .store
            .get_service(req.service_id)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?
            .ok_or(GatewayError::ServiceNotFound(req.service_id.0))?;

        let secret = req.api_key_secret.as_deref().ok_or(GatewayError::Unauthenticated)?;
        let (key, _owning_service) = self.key_directory.resolve(secret).await?;

        // From here on the key has resolved: spec.md §4.5 commits a hash
        // for every outcome, success or failure, so the rest of the
        // pipeline runs to completion and is always recorded below.
        let outcome = self.run_pipeline(&service, &key, &req, &request_path).await;

        let status = match &outcome {
            Ok(resp) => resp.status.as_u16(),
            Err(e) => e.http_status(),
        };
        let error_kind = match &outcome {
            Ok(_) => "none",
            Err(e) => e.get_error_kind().to_metric_label(),
        };
        metrics::record_request(status, error_kind, (Utc::now() - started_at).num_milliseconds() as f64 / 1000.0);

        // A `RequestHash` is committed only for requests that actually
        // reached upstream dispatch (spec.md §3: "Exactly one row per
        // proxied request"; §4.6 places the commit at step 11, after
        // dispatch). Scope/bot/rate-limit rejections never proxy, so they
        // never enter the transparency chain.
        let reached_upstream = match &outcome {
            Ok(_) => true,
            Err(GatewayError::UpstreamMisconfigured(_))
            | Err(GatewayError::UpstreamUnreachable(_))
            | Err(GatewayError::UpstreamTimeout) => true,
            Err(_) => false,
        };
        if reached_upstream {
            self.transparency
                .commit_and_maybe_batch(service.id, key.id, started_at, &request_path, status)
                .await;
        }

        if outcome.is_ok() && (200..300).contains(&status) {
            if let Err(e) = self
                .store
                .record_usage_and_bill(service.id, key.id, &key.secret, Utc::now())
                .await
            {
                tracing::warn!(error = %e, "failed to record usage/billing");
                metrics::record_commit_failure("usage_billing");
            }
        }

        outcome
    }

    async fn run_pipeline(
        &self,
        service: &Service,
        key: &ApiKey,
        req: &ProxyRequest,
        request_path: &str,
    ) -> Result<ProxyResponse, GatewayError> {
        self.key_directory.check_scope(key, service.id)?;

        let user_agent = req
            .headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok());
        let verdict = self
            .bot_classifier
            .classify(service, key, user_agent, &req.headers)
            .await;
        if verdict.action == BotAction::Blocked {
            metrics::record_bot_blocked();
            return Err(GatewayError::ForbiddenBot);
        }

        if !self.limiter.check(&key.secret, key.rate_limit_override()) {
            metrics::record_rate_limited();
            return Err(GatewayError::RateLimited);
        }

        let upstream_url = build_upstream_url(&service.target_url, &req.path_suffix, req.query.as_deref())?;
        let upstream_response = self.dispatch(req, &upstream_url).await?;

        let content_type = upstream_response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let status = StatusCode::from_u16(upstream_response.status().as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut headers = convert_response_headers(upstream_response.headers());
        let body = upstream_response
            .bytes()
            .await
            .map_err(|e| GatewayError::UpstreamUnreachable(e.to_string()))?;

        let body = if service.watermarking_enabled {
            let watermark = Watermarker::encode(&WatermarkTuple {
                service_id: service.id,
                api_key_id: key.id,
                request_id: Watermarker::generate_request_id(),
                timestamp_iso: Utc::now().to_rfc3339(),
            });
            let kind = BodyKind::from_content_type(content_type.as_deref());
            Bytes::from(Watermarker::inject(kind, &body, &watermark))
        } else {
            body
        };

        for name in STRIPPED_RESPONSE_HEADERS {
            headers.remove(*name);
        }

        tracing::debug!(path = %request_path, status = status.as_u16(), "proxied request");

        Ok(ProxyResponse { status, headers, body })
    }

    async fn dispatch(&self, req: &ProxyRequest, url: &str) -> Result<reqwest::Response, GatewayError> {
        let method = reqwest::Method::from_bytes(req.method.as_str().as_bytes())
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        let mut builder = self.http_client.request(method, url);
        builder = builder.headers(convert_request_headers(&req.headers));
        if !req.body.is_empty() {
            builder = builder.body(req.body.clone());
        }

        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::UpstreamTimeout
            } else if e.is_connect() {
                GatewayError::UpstreamUnreachable(e.to_string())
            } else {
                GatewayError::UpstreamUnreachable(e.to_string())
            }
        })
    }
}

fn build_upstream_url(target_url: &str, path_suffix: &str, query: Option<&str>) -> Result<String, GatewayError> {
    if !target_url.starts_with("http://") && !target_url.starts_with("https://") {
        return Err(GatewayError::UpstreamMisconfigured(format!(
            "target_url {target_url} has no http(s) scheme"
        )));
    }
    let base = target_url.trim_end_matches('/');
    let suffix = path_suffix.trim_start_matches('/');
    let mut url = if suffix.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{suffix}")
    };
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(q);
    }
    Ok(url)
}

fn convert_request_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        if HOP_BY_HOP_REQUEST_HEADERS.contains(&name.as_str().to_ascii_lowercase().as_str()) {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(n, v);
        }
    }
    out
}

fn convert_response_headers(headers: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(n, v);
        }
    }
    out
}

#[cfg(test)]
mod integration;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_url_joins_base_and_suffix_stripping_slashes() {
        let url = build_upstream_url("https://weather.example.com/", "forecast/today", None).unwrap();
        assert_eq!(url, "https://weather.example.com/forecast/today");
    }

    #[test]
    fn upstream_url_forwards_query_string() {
        let url = build_upstream_url("https://weather.example.com", "forecast", Some("city=nyc")).unwrap();
        assert_eq!(url, "https://weather.example.com/forecast?city=nyc");
    }

    #[test]
    fn upstream_url_with_empty_suffix_is_just_the_base() {
        let url = build_upstream_url("https://weather.example.com", "", None).unwrap();
        assert_eq!(url, "https://weather.example.com");
    }

    #[test]
    fn misconfigured_target_url_is_rejected() {
        let err = build_upstream_url("weather.example.com", "forecast", None).unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamMisconfigured(_)));
    }
}
