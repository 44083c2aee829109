//! Durable data model (spec.md §3).
//!
//! These are plain records; all invariants around them (secret uniqueness,
//! `merkle_batch_id` monotonicity, batch/hash membership) are enforced by
//! the `Store` implementation, not by these types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::{ApiKeyId, MerkleRootId, ServiceId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub target_url: String,
    pub owner_id: i64,
    pub watermarking_enabled: bool,
    pub bot_blocking_enabled: bool,
    pub bot_threshold: f64,
}

impl Service {
    pub const DEFAULT_BOT_THRESHOLD: f64 = 0.7;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: ApiKeyId,
    /// Opaque secret, >=32 bytes of entropy. Globally unique across active
    /// and revoked keys (spec.md §3).
    pub secret: String,
    pub service_id: ServiceId,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub rate_limit_requests: Option<u32>,
    pub rate_limit_window_seconds: Option<u32>,
    pub price_per_request: f64,
    pub total_cost: f64,
}

impl ApiKey {
    /// The override is only meaningful when both fields are present
    /// (spec.md §3 invariant).
    pub fn rate_limit_override(&self) -> Option<(u32, u32)> {
        match (self.rate_limit_requests, self.rate_limit_window_seconds) {
            (Some(r), Some(w)) if r > 0 && w > 0 => Some((r, w)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLog {
    pub id: i64,
    pub service_id: ServiceId,
    pub api_key_secret: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHash {
    pub id: i64,
    pub service_id: ServiceId,
    pub api_key_id: ApiKeyId,
    pub timestamp: DateTime<Utc>,
    pub request_path: String,
    pub response_status: u16,
    pub hash: [u8; 32],
    pub merkle_batch_id: Option<MerkleRootId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleRoot {
    pub id: MerkleRootId,
    pub root: [u8; 32],
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub request_count: u32,
    pub created_at: DateTime<Utc>,
    pub is_anchored: bool,
    pub tx_hash: Option<String>,
    pub block_number: Option<u64>,
    pub anchored_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotClassification {
    Human,
    Suspicious,
    Bot,
}

impl fmt::Display for BotClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BotClassification::Human => "human",
            BotClassification::Suspicious => "suspicious",
            BotClassification::Bot => "bot",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotAction {
    Allowed,
    Flagged,
    Blocked,
}

impl fmt::Display for BotAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BotAction::Allowed => "allowed",
            BotAction::Flagged => "flagged",
            BotAction::Blocked => "blocked",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotDetectionLog {
    pub id: i64,
    pub service_id: ServiceId,
    pub api_key_secret: String,
    pub bot_score: f64,
    pub classification: BotClassification,
    pub user_agent: Option<String>,
    pub action: BotAction,
    pub timestamp: DateTime<Utc>,
}
