use std::{sync::Arc, time::Duration};

use async_channel::{Receiver, Sender};
use papaya::HashMap;
use tracing::debug;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Clone, Debug)]
enum KeyStatus {
    InFlight,
    Pending,
}

/// Deduplicating, rate-limited queue of object ids.
///
/// An id is handed to at most one worker at a time: `add` while the id is
/// in flight marks it pending and `done` re-queues it.
#[derive(Clone)]
pub struct WorkQueue {
    keys: Arc<HashMap<String, KeyStatus>>,
    failures: Arc<HashMap<String, u32>>,
    tx: Sender<String>,
}

impl WorkQueue {
    pub fn new() -> (Self, Receiver<String>) {
        let (tx, rx) = async_channel::unbounded();

        (
            Self {
                keys: Arc::new(HashMap::new()),
                failures: Arc::new(HashMap::new()),
                tx,
            },
            rx,
        )
    }

    pub async fn add(&self, key: &str) {
        let keys = self.keys.pin_owned();

        match keys.get(key) {
            Some(KeyStatus::InFlight) => {
                keys.insert(key.to_string(), KeyStatus::Pending);
            }
            Some(KeyStatus::Pending) => {
                debug!("key {key} is already pending");
            }
            None => {
                keys.insert(key.to_string(), KeyStatus::InFlight);
                self.tx.send(key.to_string()).await.ok();
            }
        }
    }

    pub fn add_after(&self, key: &str, delay: Duration) {
        let this = self.clone();
        let key = key.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.add(&key).await;
        });
    }

    /// Re-queues with exponential per-id backoff; `forget` resets it.
    pub async fn add_rate_limited(&self, key: &str) {
        let failures = {
            let map = self.failures.pin_owned();
            let failures = map.get(key).copied().unwrap_or(0);
            map.insert(key.to_string(), failures + 1);
            failures
        };

        let exp = BASE_DELAY.saturating_mul(2u32.saturating_pow(failures));
        let delay = exp.min(MAX_DELAY);
        debug!("requeue {key} after {delay:?} (failures: {failures})");
        self.add_after(key, delay);
    }

    pub fn forget(&self, key: &str) {
        self.failures.pin_owned().remove(key);
    }

    pub async fn done(&self, key: &str) {
        let was_pending = {
            let keys = self.keys.pin_owned();
            matches!(keys.remove(key), Some(KeyStatus::Pending))
        };

        if was_pending {
            self.add(key).await;
        }
    }

    /// Closes the queue; workers observe the closed channel and exit.
    pub fn shutdown(&self) {
        self.tx.close();
    }
}
