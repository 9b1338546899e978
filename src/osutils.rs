use std::{os::unix::fs::FileTypeExt, path::Path, time::Duration};

use anyhow::{Result, bail};
use tokio::net::UnixStream;

pub async fn regular_file_exists(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    match tokio::fs::metadata(path).await {
        Ok(metadata) => {
            if !metadata.is_file() {
                bail!("no regular file at {}", path.display());
            }
            Ok(true)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

pub async fn is_socket_present(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    match tokio::fs::metadata(path).await {
        Ok(metadata) => {
            if !metadata.file_type().is_socket() {
                bail!("file at {} is not a socket", path.display());
            }
            Ok(true)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// A socket file may outlive its listener; only a successful connect counts.
pub async fn is_socket_active(path: impl AsRef<Path>) -> Result<bool> {
    match UnixStream::connect(path.as_ref()).await {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => Ok(false),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

pub async fn remove_socket_if_exists(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if is_socket_present(path).await? {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}

pub async fn wait_for_socket(path: impl AsRef<Path>, timeout: Duration) -> Result<()> {
    let path = path.as_ref();

    let wait = async {
        loop {
            if let Ok(true) = is_socket_present(path).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    };

    if tokio::time::timeout(timeout, wait).await.is_err() {
        bail!("socket {} is not available", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_regular_file_exists() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join("file");

        assert!(!regular_file_exists(&path).await.expect("stat failed"));
        std::fs::write(&path, b"x").expect("failed to write file");
        assert!(regular_file_exists(&path).await.expect("stat failed"));

        assert!(regular_file_exists(dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_socket_probes() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join("probe.sock");

        assert!(!is_socket_present(&path).await.expect("stat failed"));

        let listener = UnixListener::bind(&path).expect("failed to bind socket");
        assert!(is_socket_present(&path).await.expect("stat failed"));
        assert!(is_socket_active(&path).await.expect("connect failed"));

        drop(listener);
        assert!(!is_socket_active(&path).await.expect("connect failed"));

        remove_socket_if_exists(&path)
            .await
            .expect("failed to remove socket");
        assert!(!is_socket_present(&path).await.expect("stat failed"));
    }

    #[tokio::test]
    async fn test_wait_for_socket_appears_late() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join("late.sock");

        let bind_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _listener = UnixListener::bind(&bind_path).expect("failed to bind socket");
            // keep listener alive long enough for the waiter
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        wait_for_socket(&path, Duration::from_secs(5))
            .await
            .expect("socket never appeared");
    }
}
