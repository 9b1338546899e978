use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

/// The requested image is not local yet; the caller is notified through the
/// pull-done listener once it lands.
#[derive(Debug, Error)]
#[error("image is being pulled")]
pub struct Pulling;

pub fn is_pulling(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Pulling>().is_some()
}

#[derive(Debug, Clone)]
pub struct Image {
    pub reference: String,
    pub root_fs_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PullDoneEvent {
    pub reference: String,
}

pub type PullDoneListener = Box<dyn Fn(PullDoneEvent) + Send + Sync>;

#[async_trait]
pub trait ImageCache: Send + Sync {
    /// Resolves a reference to a locally cached image or fails with
    /// [`Pulling`] while the blob is still on its way.
    async fn get(&self, reference: &str) -> Result<Image>;

    fn add_pull_done_listener(&self, listener: PullDoneListener);
}

/// Directory-backed cache. Each reference maps to
/// `<base>/<sanitized-ref>/rootfs.raw`; a poll loop watches outstanding
/// references and fires the pull-done listeners when a blob appears.
pub struct LocalImageCache {
    base_dir: PathBuf,
    pending: Arc<StdMutex<HashSet<String>>>,
    listeners: Arc<StdMutex<Vec<PullDoneListener>>>,
}

fn sanitize_reference(reference: &str) -> String {
    reference
        .chars()
        .map(|c| match c {
            '/' | ':' | '@' => '_',
            c => c,
        })
        .collect()
}

impl LocalImageCache {
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        if !base_dir.exists() {
            tokio::fs::create_dir_all(&base_dir).await?;
        }

        Ok(Self {
            base_dir,
            pending: Arc::new(StdMutex::new(HashSet::new())),
            listeners: Arc::new(StdMutex::new(Vec::new())),
        })
    }

    pub fn root_fs_path(&self, reference: &str) -> PathBuf {
        self.base_dir
            .join(sanitize_reference(reference))
            .join("rootfs.raw")
    }

    /// Watches outstanding references until the task is aborted.
    pub async fn start(&self) {
        loop {
            let outstanding: Vec<String> = {
                let pending = self.pending.lock().expect("pending lock poisoned");
                pending.iter().cloned().collect()
            };

            for reference in outstanding {
                if !self.root_fs_path(&reference).is_file() {
                    continue;
                }

                info!("image pulled: {reference}");
                self.pending
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(&reference);

                let listeners = self.listeners.lock().expect("listeners lock poisoned");
                for listener in listeners.iter() {
                    listener(PullDoneEvent {
                        reference: reference.clone(),
                    });
                }
            }

            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

#[async_trait]
impl ImageCache for LocalImageCache {
    async fn get(&self, reference: &str) -> Result<Image> {
        let root_fs_path = self.root_fs_path(reference);
        if root_fs_path.is_file() {
            return Ok(Image {
                reference: reference.to_string(),
                root_fs_path,
            });
        }

        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(reference.to_string());
        Err(Pulling.into())
    }

    fn add_pull_done_listener(&self, listener: PullDoneListener) {
        self.listeners
            .lock()
            .expect("listeners lock poisoned")
            .push(listener);
    }
}
