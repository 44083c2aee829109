//! Authentication and scope enforcement (spec.md §4.1).
//!
//! Mirrors the teacher's `auth::credentials` split between "find the
//! credential" and "is it allowed here": `resolve` answers the first,
//! `check_scope` the second, so callers can tell a bad key apart from a
//! key that's fine but pointed at the wrong service.

use std::sync::Arc;

use crate::error::GatewayError;
use crate::ids::ServiceId;
use crate::model::{ApiKey, Service};
use crate::store::Store;

pub struct KeyDirectory {
    store: Arc<dyn Store>,
}

impl KeyDirectory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Resolves a bearer secret to its key and owning service. Returns
    /// `Unauthenticated` for a missing, inactive, or orphaned key —
    /// callers must not be able to distinguish "wrong secret" from
    /// "revoked key" from the error alone (spec.md §4.1 edge cases).
    pub async fn resolve(&self, secret: &str) -> Result<(ApiKey, Service), GatewayError> {
        self.store
            .resolve_key(secret)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?
            .ok_or(GatewayError::Unauthenticated)
    }

    /// Confirms a resolved key belongs to `service_id`. A key is always
    /// scoped to the single service it was minted for (spec.md §3); there
    /// is no cross-service key today.
    pub fn check_scope(&self, key: &ApiKey, service_id: ServiceId) -> Result<(), GatewayError> {
        if key.service_id == service_id {
            Ok(())
        } else {
            Err(GatewayError::ForbiddenScope)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use chrono::Utc;

    fn seeded() -> (Arc<MemStore>, ApiKey, Service) {
        let store = Arc::new(MemStore::new());
        let service = Service {
            id: ServiceId(1),
            name: "weather-api".into(),
            target_url: "https://weather.example.com".into(),
            owner_id: 1,
            watermarking_enabled: false,
            bot_blocking_enabled: false,
            bot_threshold: Service::DEFAULT_BOT_THRESHOLD,
        };
        let other_service = Service {
            id: ServiceId(2),
            name: "news-api".into(),
            target_url: "https://news.example.com".into(),
            owner_id: 1,
            watermarking_enabled: false,
            bot_blocking_enabled: false,
            bot_threshold: Service::DEFAULT_BOT_THRESHOLD,
        };
        store.seed_service(service.clone());
        store.seed_service(other_service);
        let key = ApiKey {
            id: crate::ids::ApiKeyId(1),
            secret: "sk_live_abcdef0123456789".into(),
            service_id: ServiceId(1),
            is_active: true,
            created_at: Utc::now(),
            rate_limit_requests: None,
            rate_limit_window_seconds: None,
            price_per_request: 0.0,
            total_cost: 0.0,
        };
        store.seed_api_key(key.clone());
        (store, key, service)
    }

    #[tokio::test]
    async fn resolve_rejects_unknown_secret() {
        let (store, _, _) = seeded();
        let directory = KeyDirectory::new(store);
        let err = directory.resolve("sk_live_does_not_exist").await.unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated));
    }

    #[tokio::test]
    async fn resolve_rejects_revoked_key() {
        let (store, key, _) = seeded();
        store.revoke_api_key(key.id).await.unwrap();
        let directory = KeyDirectory::new(store);
        let err = directory.resolve(&key.secret).await.unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated));
    }

    #[tokio::test]
    async fn resolve_succeeds_for_active_key() {
        let (store, key, service) = seeded();
        let directory = KeyDirectory::new(store);
        let (resolved_key, resolved_service) = directory.resolve(&key.secret).await.unwrap();
        assert_eq!(resolved_key.id, key.id);
        assert_eq!(resolved_service.id, service.id);
    }

    #[tokio::test]
    async fn check_scope_rejects_key_for_another_service() {
        let (store, key, _) = seeded();
        let directory = KeyDirectory::new(store);
        let err = directory
            .check_scope(&key, ServiceId(2))
            .unwrap_err();
        assert!(matches!(err, GatewayError::ForbiddenScope));
    }

    #[tokio::test]
    async fn check_scope_allows_matching_service() {
        let (store, key, service) = seeded();
        let directory = KeyDirectory::new(store);
        directory.check_scope(&key, service.id).unwrap();
    }
}
