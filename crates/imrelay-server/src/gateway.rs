use imrelay::protocol::status;
use imrelay_store::{PresenceStore, StoreError, StoreResult};
use std::sync::Arc;

/// Async front for the synchronous presence store.
#[derive(Clone)]
pub struct Gateway {
    store: Arc<dyn PresenceStore>,
}

impl Gateway {
    pub fn new(store: Arc<dyn PresenceStore>) -> Self {
        Self { store }
    }

    /// Run a store call on the blocking pool and wait for it.
    pub async fn call<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn PresenceStore) -> StoreResult<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| StoreError::Blocking(e.to_string()))?
    }
}

/// Mark `user_id` offline once it holds no connection records.
/// Returns whether the user went offline.
pub fn release_user(store: &dyn PresenceStore, user_id: &str) -> StoreResult<bool> {
    if store.count_conns_by_user(user_id)? > 0 {
        return Ok(false);
    }
    store.update_user_status(user_id, status::OFFLINE)
}
