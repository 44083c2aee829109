//! The composition root (spec.md §9 Design Notes): every piece of
//! process-wide mutable state lives here once, behind `Arc`, and is
//! passed by reference into every handler. No hidden singletons.

use std::sync::Arc;

use crate::bot::BotClassifier;
use crate::config::AppConfig;
use crate::key_directory::KeyDirectory;
use crate::limiter::Limiter;
use crate::proxy::ProxyEngine;
use crate::store::Store;
use crate::transparency::TransparencyLog;

pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn Store>,
    pub key_directory: Arc<KeyDirectory>,
    pub limiter: Arc<Limiter>,
    pub bot_classifier: Arc<BotClassifier>,
    pub transparency: Arc<TransparencyLog>,
    pub proxy_engine: Arc<ProxyEngine>,
}
