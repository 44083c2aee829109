//! Blockchain anchoring (spec.md §4.5, §6 contract ABI), modeled directly
//! on `context::parquet::worker`'s single-consumer background task and
//! `redis::publisher::RedisPublisherClient`'s single owned outbound
//! connection with reconnect-on-failure: one task owns the signer, reads
//! jobs off a bounded mpsc channel, and so naturally serializes every
//! outbound transaction (spec.md §5: "Blockchain signer state (nonce):
//! SERIALIZED").
//!
//! `alloy` is an enrichment from the pack (see `DESIGN.md`): none of the
//! five teacher repos talk to a blockchain directly.

use std::str::FromStr;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::AppConfig;
use crate::ids::MerkleRootId;
use crate::metrics;
use crate::store::Store;
use std::sync::Arc;

sol! {
    #[sol(rpc)]
    interface MerkleRootRegistry {
        function anchorMerkleRoot(bytes32 root, uint256 batchId, uint256 requestCount) external;
        function getMerkleRootByBatchId(uint256 batchId) external view returns (bytes32 root, uint256 outBatchId, uint256 requestCount, uint256 timestamp, address anchoredBy);
        function isBatchAnchored(uint256 batchId) external view returns (bool);
        function getTotalAnchors() external view returns (uint256);
        event MerkleRootAnchored(bytes32 indexed root, uint256 indexed batchId, uint256 requestCount, uint256 timestamp, address indexed anchoredBy);
    }
}

/// Sepolia, per spec.md §6.
pub const CHAIN_ID: u64 = 11155111;
const MAX_PRIORITY_FEE_PER_GAS: u128 = 2_000_000_000; // 2 gwei

pub struct AnchorJob {
    pub batch_id: MerkleRootId,
    pub root: [u8; 32],
    pub request_count: u32,
}

/// Handle held by the request path (via `TransparencyLog`) to hand off a
/// freshly closed batch to the anchoring worker without waiting for it.
#[derive(Clone)]
pub struct AnchorHandle {
    tx: Option<mpsc::Sender<AnchorJob>>,
}

impl AnchorHandle {
    /// A handle with no worker behind it: anchoring is disabled
    /// (spec.md §4.5 "the system MUST be functional with anchoring
    /// permanently disabled").
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Best-effort, non-blocking. Never propagates backpressure into the
    /// originating request (spec.md §5 Backpressure).
    pub fn submit(&self, job: AnchorJob) {
        if let Some(tx) = &self.tx {
            if tx.try_send(job).is_err() {
                tracing::warn!("anchor worker mailbox full or closed; dropping batch anchor request");
            }
        }
    }
}

/// Spawns the anchoring worker if `config.chain_anchoring_enabled()`,
/// returning a handle and (if started) its join handle. Returns a
/// disabled handle otherwise, so callers never need to branch on
/// whether anchoring is configured.
pub fn spawn(
    config: &AppConfig,
    store: Arc<dyn Store>,
) -> (AnchorHandle, Option<tokio::task::JoinHandle<()>>) {
    if !config.chain_anchoring_enabled() {
        tracing::info!("blockchain anchoring disabled; batches will remain unanchored");
        return (AnchorHandle::disabled(), None);
    }

    let (tx, rx) = mpsc::channel(256);
    let rpc_url = config.alchemy_sepolia_url.clone().unwrap();
    let private_key = config.blockchain_private_key.clone().unwrap();
    let contract_address = config.contract_address.clone().unwrap();

    let handle = tokio::spawn(async move {
        run_worker(rx, rpc_url, private_key, contract_address, store).await;
    });

    (AnchorHandle { tx: Some(tx) }, Some(handle))
}

async fn run_worker(
    mut rx: mpsc::Receiver<AnchorJob>,
    rpc_url: String,
    private_key: String,
    contract_address: String,
    store: Arc<dyn Store>,
) {
    let signer = match PrivateKeySigner::from_str(private_key.trim_start_matches("0x")) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "invalid blockchain private key; anchoring worker exiting");
            return;
        }
    };
    let wallet = EthereumWallet::from(signer);
    let url = match rpc_url.parse() {
        Ok(u) => u,
        Err(e) => {
            tracing::error!(error = %e, "invalid ALCHEMY_SEPOLIA_URL; anchoring worker exiting");
            return;
        }
    };
    let provider = ProviderBuilder::new().wallet(wallet).on_http(url);

    let address: Address = match contract_address.parse() {
        Ok(a) => a,
        Err(e) => {
            tracing::error!(error = %e, "invalid CONTRACT_ADDRESS; anchoring worker exiting");
            return;
        }
    };
    let registry = MerkleRootRegistry::new(address, &provider);

    while let Some(job) = rx.recv().await {
        if let Err(e) = anchor_one(&registry, &provider, &store, &job).await {
            tracing::warn!(batch_id = %job.batch_id, error = %e, "batch anchor attempt failed");
            metrics::record_anchor_attempt(false);
        }
    }
}

async fn anchor_one<P: Provider>(
    registry: &MerkleRootRegistry::MerkleRootRegistryInstance<(), &P>,
    provider: &P,
    store: &Arc<dyn Store>,
    job: &AnchorJob,
) -> anyhow::Result<()> {
    let batch_id = U256::from(job.batch_id.0 as u64);

    // Survives a restart after a submitted-but-not-recorded transaction
    // (spec.md §4.5): check before sending rather than trusting our own
    // durable state, which may be stale or never got written.
    if registry.isBatchAnchored(batch_id).call().await?._0 {
        tracing::info!(batch_id = %job.batch_id, "batch already anchored on-chain; skipping");
        return Ok(());
    }

    let base_fee = provider
        .get_gas_price()
        .await
        .unwrap_or(20_000_000_000u128);
    let max_fee_per_gas = 2 * base_fee + MAX_PRIORITY_FEE_PER_GAS;

    let root = B256::from(job.root);
    let pending = registry
        .anchorMerkleRoot(root, batch_id, U256::from(job.request_count))
        .max_priority_fee_per_gas(MAX_PRIORITY_FEE_PER_GAS)
        .max_fee_per_gas(max_fee_per_gas)
        .send()
        .await?;

    // Bounded wait; anchoring must never hold the originating request
    // hostage, and this call runs off the request path entirely
    // (spec.md §4.5 "MUST NOT block the originating request for more
    // than a bounded budget").
    let receipt = timeout(AppConfig::ANCHOR_RECEIPT_TIMEOUT, pending.get_receipt()).await??;

    let tx_hash = format!("{:#x}", receipt.transaction_hash);
    let block_number = receipt.block_number.unwrap_or_default();
    store
        .mark_batch_anchored(job.batch_id, tx_hash, block_number, Utc::now())
        .await?;
    metrics::record_anchor_attempt(true);
    tracing::info!(batch_id = %job.batch_id, block_number, "batch anchored");
    Ok(())
}
