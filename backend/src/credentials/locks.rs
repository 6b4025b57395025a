use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// Async mutex per (logical credential key, environment).
///
/// Held while a logical credential and its mapping are created so that
/// concurrent promotions into one environment agree on a single row.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<(String, Uuid), Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, logical_key: &str, environment_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // Drop entries nobody holds or waits on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry((logical_key.to_string(), environment_id))
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }
}
