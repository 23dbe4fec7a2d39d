//! Application state

use std::sync::Arc;

use vendera_billing::BillingEngine;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<BillingEngine>,
    pub config: Config,
}

impl AppState {
    pub fn new(engine: Arc<BillingEngine>, config: Config) -> Self {
        Self { engine, config }
    }
}
