use std::path::Path;

use anyhow::{Context, Result};
use tokio::fs::{self, OpenOptions};

/// How to materialize a raw disk image.
#[derive(Debug, Clone)]
pub enum CreateOption {
    /// Sparse-allocate the given number of bytes.
    WithSize(i64),
    /// Copy the content of an existing image file.
    WithSourceFile(String),
}

/// Creates raw disk images, either sparse or cloned from a source image.
#[derive(Debug, Clone, Default)]
pub struct Raw;

impl Raw {
    pub fn new() -> Self {
        Self
    }

    pub async fn create(&self, path: impl AsRef<Path>, option: CreateOption) -> Result<()> {
        let path = path.as_ref();

        match option {
            CreateOption::WithSize(size) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)
                    .await
                    .with_context(|| format!("failed to open {}", path.display()))?;
                file.set_len(size as u64).await?;
            }
            CreateOption::WithSourceFile(source) => {
                fs::copy(&source, path)
                    .await
                    .with_context(|| format!("failed to copy {source} to {}", path.display()))?;
            }
        }

        Ok(())
    }
}
