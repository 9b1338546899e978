// HTTP/1.1 client for one cloud-hypervisor control socket.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
};

use crate::vmm::types::{
    DeviceConfig, DiskConfig, VmConfig, VmInfo, VmRemoveDevice, VmmPingResponse,
};

const BASE_PATH: &str = "/api/v1";

/// The body cloud-hypervisor returns from `vm.info` before `vm.create`.
const VM_NOT_CREATED_BODY: &str =
    "Error from API: The VM info is not available: VM is not created";

#[derive(Debug, Error)]
pub enum VmmError {
    #[error("vm is not created")]
    VmNotCreated,
    #[error("invalid status: {status}: {body}")]
    Protocol { status: u16, body: String },
}

pub fn is_vm_not_created(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<VmmError>(), Some(VmmError::VmNotCreated))
}

pub fn protocol_error(err: &anyhow::Error) -> Option<(u16, &str)> {
    match err.downcast_ref::<VmmError>() {
        Some(VmmError::Protocol { status, body }) => Some((*status, body.as_str())),
        _ => None,
    }
}

#[derive(Debug)]
pub struct VmmClient {
    socket_path: PathBuf,
}

impl VmmClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn ping(&self) -> Result<VmmPingResponse> {
        let (status, body) = self.request("GET", "/vmm.ping", None).await?;
        validate_status(status, &body)?;
        parse_body(&body)
    }

    pub async fn vm_info(&self) -> Result<VmInfo> {
        let (status, body) = self.request("GET", "/vm.info", None).await?;
        if body.trim() == VM_NOT_CREATED_BODY {
            return Err(VmmError::VmNotCreated.into());
        }
        validate_status(status, &body)?;
        parse_body(&body)
    }

    pub async fn create_vm(&self, config: &VmConfig) -> Result<()> {
        let body = serde_json::to_string(config)?;
        let (status, body) = self.request("PUT", "/vm.create", Some(body)).await?;
        validate_status(status, &body)
    }

    pub async fn boot_vm(&self) -> Result<()> {
        let (status, body) = self.request("PUT", "/vm.boot", None).await?;
        validate_status(status, &body)
    }

    pub async fn shutdown_vm(&self) -> Result<()> {
        let (status, body) = self.request("PUT", "/vm.shutdown", None).await?;
        validate_status(status, &body)
    }

    pub async fn delete_vm(&self) -> Result<()> {
        let (status, body) = self.request("PUT", "/vm.delete", None).await?;
        validate_status(status, &body)
    }

    pub async fn add_disk(&self, disk: &DiskConfig) -> Result<()> {
        let body = serde_json::to_string(disk)?;
        let (status, body) = self.request("PUT", "/vm.add-disk", Some(body)).await?;
        validate_status(status, &body)
    }

    pub async fn add_device(&self, device: &DeviceConfig) -> Result<()> {
        let body = serde_json::to_string(device)?;
        let (status, body) = self.request("PUT", "/vm.add-device", Some(body)).await?;
        validate_status(status, &body)
    }

    pub async fn remove_device(&self, id: &str) -> Result<()> {
        let body = serde_json::to_string(&VmRemoveDevice { id: id.to_string() })?;
        let (status, body) = self.request("PUT", "/vm.remove-device", Some(body)).await?;
        validate_status(status, &body)
    }

    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<String>,
    ) -> Result<(u16, String)> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("failed to connect to {}", self.socket_path.display()))?;

        let body = body.unwrap_or_default();
        let request = format!(
            "{method} {BASE_PATH}{path} HTTP/1.1\r\n\
             Host: localhost\r\n\
             Accept: application/json\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {body}",
            body.len(),
        );

        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await?;

        parse_response(&raw)
    }
}

fn validate_status(status: u16, body: &str) -> Result<()> {
    if (200..300).contains(&status) {
        return Ok(());
    }
    Err(VmmError::Protocol {
        status,
        body: body.to_string(),
    }
    .into())
}

fn parse_body<T: DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body).with_context(|| format!("failed to decode response body: {body}"))
}

fn parse_response(raw: &[u8]) -> Result<(u16, String)> {
    let text = String::from_utf8_lossy(raw);
    let Some((head, body)) = text.split_once("\r\n\r\n") else {
        bail!("malformed http response: missing header terminator");
    };

    let mut lines = head.lines();
    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        bail!("malformed http response: {status_line:?}");
    }
    let status: u16 = parts
        .next()
        .unwrap_or_default()
        .parse()
        .with_context(|| format!("malformed http status line: {status_line:?}"))?;

    // honor content-length when present, the body may be followed by noise
    let mut content_length = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse::<usize>().ok();
            }
        }
    }

    let body = match content_length {
        Some(len) if len <= body.len() => body[..len].to_string(),
        _ => body.to_string(),
    };

    Ok((status, body))
}
