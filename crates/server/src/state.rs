//! Application state shared across handlers.

use std::sync::Arc;
use stevedore_metadata::MetadataStore;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Metadata store.
    pub store: Arc<dyn MetadataStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Chain epoch of the last committed reconcile snapshot, when present.
    pub async fn state_epoch(&self) -> Option<i64> {
        self.store
            .market_snapshot()
            .await
            .ok()
            .flatten()
            .map(|s| s.epoch)
    }
}
