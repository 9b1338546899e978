// File backed object store, one <id>.json per record under a kind directory.

use std::{
    path::{Path, PathBuf},
    sync::Mutex as StdMutex,
};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::{fs, sync::Mutex};

use crate::api::Object;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("resource version conflict")]
    VersionConflict,
}

/// Returns true when the error chain bottoms out in [`StoreError::NotFound`].
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<StoreError>(), Some(StoreError::NotFound))
}

pub fn is_version_conflict(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::VersionConflict)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct WatchEvent<T> {
    pub event_type: WatchEventType,
    pub object: T,
}

const WATCH_QUEUE_SIZE: usize = 128;

struct Watcher<T> {
    tx: async_channel::Sender<WatchEvent<T>>,
    // kept so a slow consumer can be drained from the producer side
    rx: async_channel::Receiver<WatchEvent<T>>,
}

/// Hook applied to records on create, before the first write.
pub type CreateStrategy<T> = fn(&mut T);

pub struct Store<T> {
    dir: PathBuf,
    create_strategy: Option<CreateStrategy<T>>,

    // writes are serialized; reads go straight to disk
    write_mu: Mutex<()>,
    watchers: StdMutex<Vec<Watcher<T>>>,
}

impl<T> Store<T>
where
    T: Object + Serialize + DeserializeOwned,
{
    pub async fn new(dir: impl AsRef<Path>, create_strategy: Option<CreateStrategy<T>>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            fs::create_dir_all(&dir).await?;
        }

        Ok(Self {
            dir,
            create_strategy,
            write_mu: Mutex::new(()),
            watchers: StdMutex::new(Vec::new()),
        })
    }

    fn record_path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains('/') || id.contains("..") {
            bail!("invalid object id: {id:?}");
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    pub async fn get(&self, id: &str) -> Result<T> {
        let path = self.record_path(id)?;
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound.into());
            }
            Err(err) => return Err(err).context(format!("failed to read {}", path.display())),
        };

        let object = serde_json::from_slice(&data)
            .with_context(|| format!("failed to decode {}", path.display()))?;
        Ok(object)
    }

    pub async fn list(&self) -> Result<Vec<T>> {
        let mut objects = Vec::new();

        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let data = match fs::read(&path).await {
                Ok(data) => data,
                // deleted between listing and reading
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err).context(format!("failed to read {}", path.display())),
            };

            let object: T = serde_json::from_slice(&data)
                .with_context(|| format!("failed to decode {}", path.display()))?;
            objects.push(object);
        }

        Ok(objects)
    }

    pub async fn create(&self, mut object: T) -> Result<T> {
        let _guard = self.write_mu.lock().await;

        let path = self.record_path(object.id())?;
        if fs::try_exists(&path).await? {
            return Err(StoreError::AlreadyExists.into());
        }

        {
            let metadata = object.metadata_mut();
            metadata.created_at = Utc::now();
            metadata.generation = 1;
            metadata.resource_version = 1;
        }
        if let Some(strategy) = self.create_strategy {
            strategy(&mut object);
        }

        self.write_record(&path, &object).await?;
        self.notify(WatchEventType::Created, object.clone());
        Ok(object)
    }

    /// Fails with [`StoreError::VersionConflict`] when the caller's copy is
    /// stale; callers retry by re-reading.
    pub async fn update(&self, mut object: T) -> Result<T> {
        let _guard = self.write_mu.lock().await;

        let path = self.record_path(object.id())?;
        let current = match fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound.into());
            }
            Err(err) => return Err(err).context(format!("failed to read {}", path.display())),
        };
        let current: T = serde_json::from_slice(&current)
            .with_context(|| format!("failed to decode {}", path.display()))?;

        if current.metadata().resource_version != object.metadata().resource_version {
            return Err(StoreError::VersionConflict.into());
        }

        object.metadata_mut().resource_version += 1;
        self.write_record(&path, &object).await?;
        self.notify(WatchEventType::Updated, object.clone());
        Ok(object)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.write_mu.lock().await;

        let object = self.get(id).await?;
        let path = self.record_path(id)?;
        fs::remove_file(&path).await?;
        self.notify(WatchEventType::Deleted, object);
        Ok(())
    }

    /// Watch delivers create/update/delete events with the full object. The
    /// per-consumer queue is bounded and drops the oldest event when full;
    /// consumers compensate through the event source relist.
    pub fn watch(&self) -> async_channel::Receiver<WatchEvent<T>> {
        let (tx, rx) = async_channel::bounded(WATCH_QUEUE_SIZE);
        let consumer = rx.clone();
        self.watchers
            .lock()
            .expect("watchers lock poisoned")
            .push(Watcher { tx, rx });
        consumer
    }

    async fn write_record(&self, path: &Path, object: &T) -> Result<()> {
        let data = serde_json::to_vec_pretty(object)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    fn notify(&self, event_type: WatchEventType, object: T) {
        let mut watchers = self.watchers.lock().expect("watchers lock poisoned");
        watchers.retain(|watcher| !watcher.tx.is_closed());

        for watcher in watchers.iter() {
            let event = WatchEvent {
                event_type,
                object: object.clone(),
            };
            if let Err(async_channel::TrySendError::Full(event)) = watcher.tx.try_send(event) {
                // slow consumer: drop the oldest event instead of blocking
                let _ = watcher.rx.try_recv();
                let _ = watcher.tx.try_send(event);
            }
        }
    }
}
