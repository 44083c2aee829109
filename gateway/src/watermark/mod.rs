//! Response watermarking (spec.md §4.4).
//!
//! JSON is handled as a tagged `serde_json::Value` and recursed explicitly
//! rather than through structural reflection, per the Design Notes in
//! spec.md §9. Marker syntax for text/HTML is a fixed, greppable string so
//! `extract` can recover a watermark from a body the gateway never parsed
//! in the first place (e.g. content pasted into a leak report).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use once_cell::sync::Lazy;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use serde_json::Value;

use crate::ids::{ApiKeyId, ServiceId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkTuple {
    pub service_id: ServiceId,
    pub api_key_id: ApiKeyId,
    pub request_id: String,
    pub timestamp_iso: String,
}

#[derive(Debug, thiserror::Error)]
pub enum WatermarkError {
    #[error("watermark is not valid base64")]
    BadEncoding,
    #[error("watermark is not valid utf-8")]
    BadUtf8,
    #[error("watermark must have exactly 4 fields, found {0}")]
    WrongFieldCount(usize),
    #[error("watermark field is not a valid integer id")]
    BadId,
}

/// Content classification that drives how a body is watermarked
/// (spec.md §4.4 dispatch by Content-Type).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Json,
    Html,
    Text,
    Binary,
}

impl BodyKind {
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let Some(ct) = content_type else { return BodyKind::Binary };
        let ct = ct.to_ascii_lowercase();
        if ct.contains("application/json") || ct.contains("+json") {
            BodyKind::Json
        } else if ct.contains("html") {
            BodyKind::Html
        } else if ct.starts_with("text/") {
            BodyKind::Text
        } else {
            BodyKind::Binary
        }
    }
}

const JSON_WATERMARK_KEY: &str = "_gaas_watermark";

static HTML_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<!--\s*GAAS_WM:([A-Za-z0-9+/=]+)\s*-->").unwrap());
static TEXT_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\[GAAS_WM:([A-Za-z0-9+/=]+)\]").unwrap());

pub struct Watermarker;

impl Watermarker {
    /// A short, high-entropy per-response token (spec.md §4.4: "an opaque
    /// short token, >=6 characters of high-entropy base-36 or hex").
    pub fn generate_request_id() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect::<String>()
            .to_ascii_lowercase()
    }

    pub fn encode(tuple: &WatermarkTuple) -> String {
        let raw = format!(
            "{}|{}|{}|{}",
            tuple.service_id, tuple.api_key_id, tuple.request_id, tuple.timestamp_iso
        );
        BASE64.encode(raw)
    }

    pub fn decode(watermark: &str) -> Result<WatermarkTuple, WatermarkError> {
        let raw = BASE64
            .decode(watermark)
            .map_err(|_| WatermarkError::BadEncoding)?;
        let raw = String::from_utf8(raw).map_err(|_| WatermarkError::BadUtf8)?;
        let fields: Vec<&str> = raw.split('|').collect();
        if fields.len() != 4 {
            return Err(WatermarkError::WrongFieldCount(fields.len()));
        }
        let service_id: i64 = fields[0].parse().map_err(|_| WatermarkError::BadId)?;
        let api_key_id: i64 = fields[1].parse().map_err(|_| WatermarkError::BadId)?;
        Ok(WatermarkTuple {
            service_id: ServiceId(service_id),
            api_key_id: ApiKeyId(api_key_id),
            request_id: fields[2].to_string(),
            timestamp_iso: fields[3].to_string(),
        })
    }

    /// Injects `watermark` into `body`, dispatching on `kind`
    /// (spec.md §4.4). Returns the body unchanged for binary content.
    pub fn inject(kind: BodyKind, body: &[u8], watermark: &str) -> Vec<u8> {
        match kind {
            BodyKind::Json => match serde_json::from_slice::<Value>(body) {
                Ok(value) => inject_json(value, watermark).into_bytes(),
                // Parse failure falls through to plain-text injection
                // (spec.md §4.4).
                Err(_) => inject_text(body, watermark, false),
            },
            BodyKind::Html => inject_text(body, watermark, true),
            BodyKind::Text => inject_text(body, watermark, false),
            BodyKind::Binary => body.to_vec(),
        }
    }

    /// Recovers the base64 watermark string embedded in a (possibly
    /// leaked) response body, trying JSON first, then the HTML marker,
    /// then the plain-text marker (spec.md §4.4 extraction order).
    pub fn extract(body: &str) -> Option<String> {
        if let Ok(value) = serde_json::from_str::<Value>(body) {
            if let Some(found) = find_json_watermark(&value) {
                return Some(found);
            }
        }
        if let Some(caps) = HTML_MARKER_RE.captures(body) {
            return Some(caps[1].to_string());
        }
        if let Some(caps) = TEXT_MARKER_RE.captures(body) {
            return Some(caps[1].to_string());
        }
        None
    }
}

fn inject_json(value: Value, watermark: &str) -> String {
    let watermarked = match value {
        Value::Object(mut map) => {
            map.insert(JSON_WATERMARK_KEY.to_string(), Value::String(watermark.to_string()));
            Value::Object(map)
        }
        Value::Array(items) => {
            let mut wrapper = serde_json::Map::new();
            wrapper.insert("data".to_string(), Value::Array(items));
            wrapper.insert(JSON_WATERMARK_KEY.to_string(), Value::String(watermark.to_string()));
            Value::Object(wrapper)
        }
        // A bare scalar JSON root has no place to carry a member; wrap it
        // the same way an array is wrapped so the watermark always has a
        // home.
        scalar => {
            let mut wrapper = serde_json::Map::new();
            wrapper.insert("data".to_string(), scalar);
            wrapper.insert(JSON_WATERMARK_KEY.to_string(), Value::String(watermark.to_string()));
            Value::Object(wrapper)
        }
    };
    watermarked.to_string()
}

fn inject_text(body: &[u8], watermark: &str, html: bool) -> Vec<u8> {
    let mut out = body.to_vec();
    out.push(b'\n');
    let marker = if html {
        format!("<!-- GAAS_WM:{watermark} -->")
    } else {
        format!("[GAAS_WM:{watermark}]")
    };
    out.extend_from_slice(marker.as_bytes());
    out
}

fn find_json_watermark(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(wm)) = map.get(JSON_WATERMARK_KEY) {
                return Some(wm.clone());
            }
            map.values().find_map(find_json_watermark)
        }
        Value::Array(items) => items.iter().find_map(find_json_watermark),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn tuple() -> WatermarkTuple {
        WatermarkTuple {
            service_id: ServiceId(1),
            api_key_id: ApiKeyId(2),
            request_id: "abc123xyz0".into(),
            timestamp_iso: Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn decode_of_encode_round_trips() {
        let t = tuple();
        let decoded = Watermarker::decode(&Watermarker::encode(&t)).unwrap();
        assert_eq!(decoded, t);
    }

    #[test]
    fn decode_rejects_wrong_field_count() {
        let bad = BASE64.encode("1|2|3");
        let err = Watermarker::decode(&bad).unwrap_err();
        assert!(matches!(err, WatermarkError::WrongFieldCount(3)));
    }

    #[test]
    fn decode_rejects_non_integer_ids() {
        let bad = BASE64.encode("not-a-number|2|abc|2024-01-01T00:00:00Z");
        let err = Watermarker::decode(&bad).unwrap_err();
        assert!(matches!(err, WatermarkError::BadId));
    }

    #[test]
    fn json_object_gets_watermark_member() {
        let t = tuple();
        let wm = Watermarker::encode(&t);
        let out = Watermarker::inject(BodyKind::Json, br#"{"temp":72}"#, &wm);
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["_gaas_watermark"], Value::String(wm.clone()));
        assert_eq!(parsed["temp"], 72);
    }

    #[test]
    fn json_array_root_gets_wrapped() {
        // spec.md §8 scenario 6.
        let t = tuple();
        let wm = Watermarker::encode(&t);
        let out = Watermarker::inject(BodyKind::Json, b"[1,2,3]", &wm);
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["data"], serde_json::json!([1, 2, 3]));
        assert_eq!(parsed["_gaas_watermark"], Value::String(wm.clone()));
        assert_eq!(Watermarker::extract(std::str::from_utf8(&out).unwrap()).unwrap(), wm);
    }

    #[test]
    fn html_body_gets_comment_marker() {
        let t = tuple();
        let wm = Watermarker::encode(&t);
        let out = Watermarker::inject(BodyKind::Html, b"<html><body>hi</body></html>", &wm);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(&format!("<!-- GAAS_WM:{wm} -->")));
        assert_eq!(Watermarker::extract(&text).unwrap(), wm);
    }

    #[test]
    fn plain_text_gets_bracket_marker() {
        let t = tuple();
        let wm = Watermarker::encode(&t);
        let out = Watermarker::inject(BodyKind::Text, b"hello world", &wm);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(&format!("[GAAS_WM:{wm}]")));
        assert_eq!(Watermarker::extract(&text).unwrap(), wm);
    }

    #[test]
    fn binary_body_is_untouched() {
        let bytes = vec![0u8, 159, 146, 150];
        let out = Watermarker::inject(BodyKind::Binary, &bytes, "anything");
        assert_eq!(out, bytes);
    }

    #[test]
    fn malformed_json_falls_through_to_text_injection() {
        let t = tuple();
        let wm = Watermarker::encode(&t);
        let out = Watermarker::inject(BodyKind::Json, b"{not valid json", &wm);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(&format!("[GAAS_WM:{wm}]")));
    }
}
