// NIC plugin backed by an external apinet network fabric. The fabric plugs a
// PCI function for the interface; this plugin creates the remote record and
// waits for the host device to show up.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::{
    api::machine::{
        NetworkInterfaceSpec, NetworkInterfaceState, NetworkInterfaceStatus, NetworkInterfaceType,
    },
    errors::Invalid,
    host::Paths,
    plugins::nic::NetworkInterfacePlugin,
};

const PLUGIN_NAME: &str = "apinet";

const CONFIG_FILE: &str = "api-net.json";

const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);
const READY_POLL_TIMEOUT: Duration = Duration::from_secs(5);
const GONE_POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// The fabric reported a TAP device; that path is reserved upstream.
#[derive(Debug, Error)]
#[error("tap devices are not implemented")]
pub struct TapNotImplemented;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApinetNicState {
    Pending,
    Ready,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApinetNic {
    pub state: ApinetNicState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pci_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap_device: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApinetNicSpec {
    pub namespace: String,
    pub name: String,
    pub network_name: String,
    pub node_name: String,
    pub ips: Vec<String>,
}

/// Client against the remote apinet API.
#[async_trait]
pub trait ApinetClient: Send + Sync {
    /// Creates or patches the remote record and returns its current state.
    async fn apply_nic(&self, spec: &ApinetNicSpec) -> Result<ApinetNic>;
    async fn get_nic(&self, namespace: &str, name: &str) -> Result<Option<ApinetNic>>;
    /// Returns false when the record was already gone.
    async fn delete_nic(&self, namespace: &str, name: &str) -> Result<bool>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ApinetNicConfig {
    namespace: String,
}

/// REST client against an apinet endpoint.
pub struct HttpApinetClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpApinetClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn nic_url(&self, namespace: &str, name: &str) -> String {
        format!(
            "{}/namespaces/{namespace}/networkinterfaces/{name}",
            self.base_url
        )
    }
}

#[async_trait]
impl ApinetClient for HttpApinetClient {
    async fn apply_nic(&self, spec: &ApinetNicSpec) -> Result<ApinetNic> {
        let response = self
            .client
            .put(self.nic_url(&spec.namespace, &spec.name))
            .json(spec)
            .send()
            .await
            .context("failed to apply apinet network interface")?;

        if !response.status().is_success() {
            bail!("apinet apply failed with status {}", response.status());
        }
        Ok(response.json().await?)
    }

    async fn get_nic(&self, namespace: &str, name: &str) -> Result<Option<ApinetNic>> {
        let response = self
            .client
            .get(self.nic_url(namespace, name))
            .send()
            .await
            .context("failed to get apinet network interface")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            bail!("apinet get failed with status {}", response.status());
        }
        Ok(Some(response.json().await?))
    }

    async fn delete_nic(&self, namespace: &str, name: &str) -> Result<bool> {
        let response = self
            .client
            .delete(self.nic_url(namespace, name))
            .send()
            .await
            .context("failed to delete apinet network interface")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            bail!("apinet delete failed with status {}", response.status());
        }
        Ok(true)
    }
}

pub struct ApinetPlugin {
    node_name: String,
    client: Arc<dyn ApinetClient>,
    paths: Option<Paths>,
}

impl ApinetPlugin {
    pub fn new(node_name: impl Into<String>, client: Arc<dyn ApinetClient>) -> Self {
        Self {
            node_name: node_name.into(),
            client,
            paths: None,
        }
    }

    fn paths(&self) -> Result<&Paths> {
        match &self.paths {
            Some(paths) => Ok(paths),
            None => bail!("apinet plugin is not initialized"),
        }
    }

    /// Stable remote name derived from machine id and NIC name.
    pub fn apinet_nic_name(machine_id: &str, nic_name: &str) -> String {
        Uuid::new_v5(&Uuid::nil(), format!("{machine_id}/{nic_name}").as_bytes()).to_string()
    }

    fn config_file(&self, machine_id: &str, nic_name: &str) -> Result<std::path::PathBuf> {
        Ok(self
            .paths()?
            .machine_nic_dir(machine_id, nic_name)
            .join(CONFIG_FILE))
    }

    async fn write_config(&self, machine_id: &str, nic_name: &str, namespace: &str) -> Result<()> {
        let config = ApinetNicConfig {
            namespace: namespace.to_string(),
        };
        let data = serde_json::to_vec(&config)?;
        fs::write(self.config_file(machine_id, nic_name)?, data).await?;
        Ok(())
    }

    async fn read_config(&self, machine_id: &str, nic_name: &str) -> Result<Option<String>> {
        match fs::read(self.config_file(machine_id, nic_name)?).await {
            Ok(data) => {
                let config: ApinetNicConfig =
                    serde_json::from_slice(&data).context("malformed api-net.json")?;
                Ok(Some(config.namespace))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn status_from_nic(
        &self,
        spec: &NetworkInterfaceSpec,
        namespace: &str,
        remote_name: &str,
        nic: &ApinetNic,
    ) -> Result<Option<NetworkInterfaceStatus>> {
        match nic.state {
            ApinetNicState::Ready => match (&nic.pci_address, &nic.tap_device) {
                (Some(pci), None) => Ok(Some(NetworkInterfaceStatus {
                    name: spec.name.clone(),
                    handle: format!("{namespace}/{remote_name}/{}", self.node_name),
                    state: NetworkInterfaceState::Prepared,
                    kind: Some(NetworkInterfaceType::Pci),
                    path: format!("/sys/bus/pci/devices/{pci}"),
                })),
                (None, Some(_)) => Err(TapNotImplemented.into()),
                (None, None) => bail!("apinet nic is ready without a host device"),
                (Some(_), Some(_)) => {
                    bail!("apinet nic reports both a pci address and a tap device")
                }
            },
            ApinetNicState::Error => bail!("apinet nic is in state error"),
            ApinetNicState::Pending => Ok(None),
        }
    }
}

fn parse_network_id(network_id: &str) -> Result<(String, String)> {
    match network_id.split_once('/') {
        Some((namespace, network)) if !namespace.is_empty() && !network.is_empty() => {
            Ok((namespace.to_string(), network.to_string()))
        }
        _ => Err(Invalid(format!("invalid apinet network id: {network_id}")).into()),
    }
}

#[async_trait]
impl NetworkInterfacePlugin for ApinetPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn init(&mut self, paths: Paths) -> Result<()> {
        self.paths = Some(paths);
        Ok(())
    }

    async fn apply(
        &self,
        spec: &NetworkInterfaceSpec,
        machine_id: &str,
    ) -> Result<NetworkInterfaceStatus> {
        fs::create_dir_all(self.paths()?.machine_nic_dir(machine_id, &spec.name)).await?;

        let (namespace, network_name) = parse_network_id(&spec.network_id)?;
        // persisted so delete stays idempotent across provider restarts
        self.write_config(machine_id, &spec.name, &namespace).await?;

        let remote_name = Self::apinet_nic_name(machine_id, &spec.name);
        let remote_spec = ApinetNicSpec {
            namespace: namespace.clone(),
            name: remote_name.clone(),
            network_name,
            node_name: self.node_name.clone(),
            ips: spec.ips.clone(),
        };

        let nic = self.client.apply_nic(&remote_spec).await?;
        if let Some(status) = self.status_from_nic(spec, &namespace, &remote_name, &nic)? {
            return Ok(status);
        }

        debug!("waiting for apinet nic {remote_name} to become ready");
        let wait = async {
            loop {
                tokio::time::sleep(READY_POLL_INTERVAL).await;
                let Some(nic) = self.client.get_nic(&namespace, &remote_name).await? else {
                    bail!("apinet nic {remote_name} disappeared while waiting");
                };
                if let Some(status) = self.status_from_nic(spec, &namespace, &remote_name, &nic)? {
                    return Ok(status);
                }
            }
        };

        match tokio::time::timeout(READY_POLL_TIMEOUT, wait).await {
            Ok(result) => result,
            Err(_) => bail!("timed out waiting for apinet nic {remote_name} to become ready"),
        }
    }

    async fn delete(&self, nic_name: &str, machine_id: &str) -> Result<()> {
        let nic_dir = self.paths()?.machine_nic_dir(machine_id, nic_name);

        let Some(namespace) = self.read_config(machine_id, nic_name).await? else {
            debug!("no apinet config for nic {nic_name}, removing nic dir");
            if nic_dir.exists() {
                fs::remove_dir_all(&nic_dir).await?;
            }
            return Ok(());
        };

        let remote_name = Self::apinet_nic_name(machine_id, nic_name);
        let existed = self.client.delete_nic(&namespace, &remote_name).await?;

        if existed {
            debug!("waiting for apinet nic {remote_name} to be gone");
            let wait = async {
                loop {
                    if self
                        .client
                        .get_nic(&namespace, &remote_name)
                        .await?
                        .is_none()
                    {
                        return anyhow::Ok(());
                    }
                    tokio::time::sleep(READY_POLL_INTERVAL).await;
                }
            };
            match tokio::time::timeout(GONE_POLL_TIMEOUT, wait).await {
                Ok(result) => result?,
                Err(_) => bail!("timed out waiting for apinet nic {remote_name} to be gone"),
            }
        }

        if nic_dir.exists() {
            fs::remove_dir_all(&nic_dir).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::Mutex as StdMutex,
    };

    use super::*;

    #[derive(Default)]
    struct FakeApinet {
        nics: StdMutex<HashMap<String, ApinetNic>>,
        /// how many get_nic calls until a pending nic flips to ready
        ready_after: StdMutex<u32>,
    }

    impl FakeApinet {
        fn key(namespace: &str, name: &str) -> String {
            format!("{namespace}/{name}")
        }
    }

    #[async_trait]
    impl ApinetClient for FakeApinet {
        async fn apply_nic(&self, spec: &ApinetNicSpec) -> Result<ApinetNic> {
            let mut nics = self.nics.lock().expect("nics lock poisoned");
            let nic = nics
                .entry(Self::key(&spec.namespace, &spec.name))
                .or_insert_with(|| ApinetNic {
                    state: ApinetNicState::Pending,
                    pci_address: None,
                    tap_device: None,
                });
            Ok(nic.clone())
        }

        async fn get_nic(&self, namespace: &str, name: &str) -> Result<Option<ApinetNic>> {
            let mut nics = self.nics.lock().expect("nics lock poisoned");
            let Some(nic) = nics.get_mut(&Self::key(namespace, name)) else {
                return Ok(None);
            };

            if nic.state == ApinetNicState::Pending {
                let mut ready_after = self.ready_after.lock().expect("counter poisoned");
                if *ready_after == 0 {
                    nic.state = ApinetNicState::Ready;
                    nic.pci_address = Some("0000:3b:00.2".to_string());
                } else {
                    *ready_after -= 1;
                }
            }

            Ok(Some(nic.clone()))
        }

        async fn delete_nic(&self, namespace: &str, name: &str) -> Result<bool> {
            let mut nics = self.nics.lock().expect("nics lock poisoned");
            Ok(nics.remove(&Self::key(namespace, name)).is_some())
        }
    }

    fn spec() -> NetworkInterfaceSpec {
        NetworkInterfaceSpec {
            name: "my-nic".into(),
            network_id: "ns-a/net-1".into(),
            ips: vec!["10.0.0.1".into()],
            attributes: Default::default(),
            deleted_at: None,
        }
    }

    async fn plugin_at(paths: &Paths, client: Arc<FakeApinet>) -> ApinetPlugin {
        let mut plugin = ApinetPlugin::new("node-1", client);
        plugin.init(paths.clone()).expect("failed to init plugin");
        plugin
    }

    #[tokio::test]
    async fn test_apply_waits_for_pci_address() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let paths = Paths::at(dir.path()).await.expect("failed to create paths");

        let client = Arc::new(FakeApinet::default());
        *client.ready_after.lock().unwrap() = 2;
        let plugin = plugin_at(&paths, client).await;

        let status = plugin.apply(&spec(), "m-1").await.expect("failed to apply");
        assert_eq!(status.state, NetworkInterfaceState::Prepared);
        assert_eq!(status.kind, Some(NetworkInterfaceType::Pci));
        assert_eq!(status.path, "/sys/bus/pci/devices/0000:3b:00.2");
        assert!(!status.handle.is_empty());

        // namespace sidecar written for idempotent delete
        let sidecar = paths.machine_nic_dir("m-1", "my-nic").join(CONFIG_FILE);
        assert!(sidecar.is_file());
    }

    #[tokio::test]
    async fn test_apply_rejects_tap_device() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let paths = Paths::at(dir.path()).await.expect("failed to create paths");

        let client = Arc::new(FakeApinet::default());
        {
            let mut nics = client.nics.lock().unwrap();
            nics.insert(
                FakeApinet::key("ns-a", &ApinetPlugin::apinet_nic_name("m-1", "my-nic")),
                ApinetNic {
                    state: ApinetNicState::Ready,
                    pci_address: None,
                    tap_device: Some("tap0".into()),
                },
            );
        }
        let plugin = plugin_at(&paths, client).await;

        let err = plugin.apply(&spec(), "m-1").await.expect_err("expected tap error");
        assert!(err.downcast_ref::<TapNotImplemented>().is_some());
    }

    #[tokio::test]
    async fn test_apply_rejects_bad_network_id() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let paths = Paths::at(dir.path()).await.expect("failed to create paths");
        let plugin = plugin_at(&paths, Arc::new(FakeApinet::default())).await;

        let mut bad = spec();
        bad.network_id = "no-namespace".into();
        let err = plugin.apply(&bad, "m-1").await.expect_err("expected invalid");
        assert!(crate::errors::is_invalid(&err));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let paths = Paths::at(dir.path()).await.expect("failed to create paths");

        let client = Arc::new(FakeApinet::default());
        let plugin = plugin_at(&paths, client.clone()).await;

        plugin.apply(&spec(), "m-1").await.expect("failed to apply");
        plugin.delete("my-nic", "m-1").await.expect("failed to delete");
        assert!(client.nics.lock().unwrap().is_empty());
        assert!(!paths.machine_nic_dir("m-1", "my-nic").exists());

        // second delete: sidecar gone, remote gone, still succeeds
        plugin.delete("my-nic", "m-1").await.expect("failed to re-delete");
    }
}
