//! Per-request hash commitments (spec.md §4.5), grounded on
//! `original_source/app/routes.py`'s `compute_request_hash`: a fixed,
//! pipe-joined ASCII tuple, SHA-256'd.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::ids::{ApiKeyId, ServiceId};

/// `SHA-256(service_id "|" api_key_id "|" timestamp_iso "|" request_path "|" response_status)`.
pub fn compute_request_hash(
    service_id: ServiceId,
    api_key_id: ApiKeyId,
    timestamp: DateTime<Utc>,
    request_path: &str,
    response_status: u16,
) -> [u8; 32] {
    let input = format!(
        "{}|{}|{}|{}|{}",
        service_id,
        api_key_id,
        timestamp.to_rfc3339(),
        request_path,
        response_status
    );
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn hash_is_deterministic_for_identical_inputs() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let a = compute_request_hash(ServiceId(1), ApiKeyId(2), ts, "/proxy/1/foo", 200);
        let b = compute_request_hash(ServiceId(1), ApiKeyId(2), ts, "/proxy/1/foo", 200);
        assert_eq!(a, b);
    }

    #[test]
    fn hash_changes_with_response_status() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let ok = compute_request_hash(ServiceId(1), ApiKeyId(2), ts, "/proxy/1/foo", 200);
        let timeout = compute_request_hash(ServiceId(1), ApiKeyId(2), ts, "/proxy/1/foo", 504);
        assert_ne!(ok, timeout);
    }
}
