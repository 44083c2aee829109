//! Process configuration, parsed with `clap` the way the teacher's
//! `ParquetUploadArgs` accepts either a CLI flag or its env-var fallback
//! (spec.md §6 "Environment configuration").

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Clone, Debug)]
#[command(name = "gateway", about = "API gateway with cryptographic transparency")]
pub struct AppConfig {
    /// Postgres connection string for the durable store.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Address to bind the HTTP listener on.
    #[arg(long, env = "GATEWAY_BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: SocketAddr,

    /// Free-form region label attached to log spans and metrics.
    #[arg(long, env = "GATEWAY_REGION", default_value = "local")]
    pub region: String,

    /// Number of request hashes per Merkle batch.
    #[arg(long, env = "MERKLE_BATCH_SIZE", default_value_t = 10)]
    pub merkle_batch_size: usize,

    /// Enables submitting closed batches to the blockchain registry.
    #[arg(long, env = "ENABLE_BLOCKCHAIN_ANCHORING", default_value_t = false)]
    pub enable_blockchain_anchoring: bool,

    /// Alchemy (or compatible) Sepolia JSON-RPC endpoint.
    #[arg(long, env = "ALCHEMY_SEPOLIA_URL")]
    pub alchemy_sepolia_url: Option<String>,

    /// Hex-encoded secp256k1 private key for the anchoring signer, with or
    /// without a `0x` prefix.
    #[arg(long, env = "BLOCKCHAIN_PRIVATE_KEY")]
    pub blockchain_private_key: Option<String>,

    /// Address of the `MerkleRootRegistry` contract.
    #[arg(long, env = "CONTRACT_ADDRESS")]
    pub contract_address: Option<String>,

    /// Default requests-per-window applied when a key has no override.
    #[arg(long, env = "GATEWAY_DEFAULT_RATE_LIMIT_REQUESTS", default_value_t = 10)]
    pub default_rate_limit_requests: u32,

    /// Default window (seconds) applied when a key has no override.
    #[arg(long, env = "GATEWAY_DEFAULT_RATE_LIMIT_WINDOW_SECONDS", default_value_t = 60)]
    pub default_rate_limit_window_seconds: u32,
}

impl AppConfig {
    pub const UPSTREAM_TOTAL_TIMEOUT: Duration = Duration::from_secs(30);
    pub const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const ANCHOR_RECEIPT_TIMEOUT: Duration = Duration::from_secs(120);
    /// Buckets untouched for this multiple of their window are eligible
    /// for eviction (spec.md §4.2 "a safe policy is to evict only buckets
    /// untouched for >= window * 2").
    pub const BUCKET_IDLE_EVICTION_FACTOR: u32 = 2;

    pub fn chain_anchoring_enabled(&self) -> bool {
        self.enable_blockchain_anchoring
            && self.alchemy_sepolia_url.is_some()
            && self.blockchain_private_key.is_some()
            && self.contract_address.is_some()
    }
}
