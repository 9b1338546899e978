use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use tracing::warn;

use crate::{
    api::Object,
    machinery::store::{Store, WatchEvent, WatchEventType},
};

pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(60);

#[async_trait]
pub trait EventHandler<T>: Send + Sync {
    async fn handle(&self, event: &WatchEvent<T>);
}

/// Fans store events out to registered handlers. A periodic relist backs the
/// watch channel so every object visible in the store is eventually seen by
/// every handler, even after watch-queue drops.
pub struct EventSource<T> {
    store: Arc<Store<T>>,
    handlers: StdMutex<Vec<Arc<dyn EventHandler<T>>>>,
    resync_interval: Duration,
}

impl<T> EventSource<T>
where
    T: Object + Serialize + DeserializeOwned,
{
    pub fn new(store: Arc<Store<T>>, resync_interval: Duration) -> Self {
        Self {
            store,
            handlers: StdMutex::new(Vec::new()),
            resync_interval,
        }
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler<T>>) {
        self.handlers
            .lock()
            .expect("handlers lock poisoned")
            .push(handler);
    }

    fn handlers(&self) -> Vec<Arc<dyn EventHandler<T>>> {
        self.handlers
            .lock()
            .expect("handlers lock poisoned")
            .clone()
    }

    async fn dispatch(&self, event: &WatchEvent<T>) {
        for handler in self.handlers() {
            handler.handle(event).await;
        }
    }

    /// Pumps watch events and periodic relists until the caller aborts the
    /// task or the store side closes the watch.
    pub async fn start(&self) -> Result<()> {
        let watch = self.store.watch();
        let mut resync = tokio::time::interval(self.resync_interval);
        // the first tick fires immediately and replays current state
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = watch.recv() => {
                    match event {
                        Ok(event) => self.dispatch(&event).await,
                        Err(_) => return Ok(()),
                    }
                }
                _ = resync.tick() => {
                    match self.store.list().await {
                        Ok(objects) => {
                            for object in objects {
                                self.dispatch(&WatchEvent {
                                    event_type: WatchEventType::Updated,
                                    object,
                                })
                                .await;
                            }
                        }
                        Err(err) => warn!("resync list failed: {err:#}"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        Metadata,
        machine::{Machine, MachineSpec, MachineStatus},
    };

    struct Collect {
        seen: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl EventHandler<Machine> for Collect {
        async fn handle(&self, event: &WatchEvent<Machine>) {
            self.seen
                .lock()
                .expect("seen lock poisoned")
                .push(event.object.metadata.id.clone());
        }
    }

    fn machine(id: &str) -> Machine {
        Machine {
            metadata: Metadata::new(id),
            spec: MachineSpec::default(),
            status: MachineStatus::default(),
        }
    }

    #[tokio::test]
    async fn test_watch_and_relist_reach_handlers() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let store = Arc::new(
            Store::<Machine>::new(dir.path(), None)
                .await
                .expect("failed to create store"),
        );

        // object created before the source starts is only visible via relist
        store
            .create(machine("m-existing"))
            .await
            .expect("failed to create");

        let source = Arc::new(EventSource::new(store.clone(), Duration::from_millis(20)));
        let handler = Arc::new(Collect {
            seen: StdMutex::new(Vec::new()),
        });
        source.add_handler(handler.clone());

        let pump = {
            let source = source.clone();
            tokio::spawn(async move { source.start().await })
        };

        store.create(machine("m-live")).await.expect("failed to create");

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let seen = handler.seen.lock().expect("seen lock poisoned");
                    if seen.iter().any(|id| id == "m-existing")
                        && seen.iter().any(|id| id == "m-live")
                    {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handlers did not observe both machines");

        pump.abort();
    }
}
