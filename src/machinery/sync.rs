use std::sync::Arc;

use papaya::HashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Keyed mutex map. All hypervisor REST traffic for one control socket is
/// serialized through the lock for that socket path.
pub struct MutexMap {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl MutexMap {
    pub fn new() -> Self {
        Self {
            locks: HashMap::new(),
        }
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let locks = self.locks.pin_owned();
            locks
                .get_or_insert_with(key.to_string(), || Arc::new(Mutex::new(())))
                .clone()
        };

        lock.lock_owned().await
    }
}

impl Default for MutexMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_serializes_per_key() {
        let map = Arc::new(MutexMap::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let map = map.clone();
            let active = active.clone();
            let max_active = max_active.clone();

            handles.push(tokio::spawn(async move {
                let _guard = map.lock("sock-a").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.expect("task panicked");
        }

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let map = MutexMap::new();
        let _a = map.lock("sock-a").await;
        // a second key must not deadlock while the first is held
        let _b = map.lock("sock-b").await;
    }
}
