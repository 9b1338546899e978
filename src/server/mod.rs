pub mod api;
pub mod machine;

use std::{os::unix::fs::PermissionsExt, path::Path, sync::Arc};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
};
use tracing::{debug, info, warn};

use crate::{
    api::machine::Machine,
    errors::is_invalid,
    machinery::store::{Store, is_not_found},
    mcr::MachineClassRegistry,
    osutils,
    recorder::EventRecorder,
    server::api::{ErrorCode, RpcCall, RpcError, RpcRequest, RpcResponse},
};

/// Machine-runtime endpoint over a Unix stream socket. Frames are
/// newline-delimited JSON request/response pairs; every handler is a store
/// mutation or read, never hypervisor work.
pub struct Server {
    machines: Arc<Store<Machine>>,
    machine_classes: Arc<MachineClassRegistry>,
    recorder: Arc<EventRecorder>,
}

impl Server {
    pub fn new(
        machines: Arc<Store<Machine>>,
        machine_classes: Arc<MachineClassRegistry>,
        recorder: Arc<EventRecorder>,
    ) -> Arc<Self> {
        Arc::new(Self {
            machines,
            machine_classes,
            recorder,
        })
    }

    /// Binds the listener, replacing a stale socket file; the socket is open
    /// to local clients (mode 0666), access control is directory permissions.
    pub async fn bind(address: impl AsRef<Path>) -> Result<UnixListener> {
        let address = address.as_ref();
        osutils::remove_socket_if_exists(address).await?;

        let listener = UnixListener::bind(address)
            .with_context(|| format!("failed to listen on {}", address.display()))?;
        tokio::fs::set_permissions(address, std::fs::Permissions::from_mode(0o666)).await?;

        info!("listening on {}", address.display());
        Ok(listener)
    }

    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> Result<()> {
        loop {
            let (stream, _) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(err) = server.serve_connection(stream).await {
                    debug!("connection closed: {err:#}");
                }
            });
        }
    }

    async fn serve_connection(&self, stream: UnixStream) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<RpcRequest>(&line) {
                Ok(request) => {
                    let id = request.id;
                    self.dispatch(id, request.call).await
                }
                Err(err) => RpcResponse {
                    id: 0,
                    result: None,
                    error: Some(RpcError {
                        code: ErrorCode::Invalid,
                        message: format!("malformed request: {err}"),
                    }),
                },
            };

            let mut frame = serde_json::to_vec(&response)?;
            frame.push(b'\n');
            write_half.write_all(&frame).await?;
            write_half.flush().await?;
        }

        Ok(())
    }

    pub async fn dispatch(&self, id: u64, call: RpcCall) -> RpcResponse {
        match call {
            RpcCall::CreateMachine(request) => {
                respond(id, self.create_machine(request).await)
            }
            RpcCall::DeleteMachine(request) => respond(id, self.delete_machine(request).await),
            RpcCall::ListMachines(request) => respond(id, self.list_machines(request).await),
            RpcCall::UpdateMachinePower(request) => {
                respond(id, self.update_machine_power(request).await)
            }
            RpcCall::AttachVolume(request) => respond(id, self.attach_volume(request).await),
            RpcCall::DetachVolume(request) => respond(id, self.detach_volume(request).await),
            RpcCall::AttachNetworkInterface(request) => {
                respond(id, self.attach_network_interface(request).await)
            }
            RpcCall::DetachNetworkInterface(request) => {
                respond(id, self.detach_network_interface(request).await)
            }
            RpcCall::Status(request) => respond(id, Ok(self.status(request))),
            RpcCall::ListEvents(request) => respond(id, Ok(self.list_events(request))),
            RpcCall::Exec(request) => respond(id, Ok(self.exec(request))),
        }
    }
}

fn respond<T: Serialize>(id: u64, result: Result<T>) -> RpcResponse {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => RpcResponse {
                id,
                result: Some(value),
                error: None,
            },
            Err(err) => RpcResponse {
                id,
                result: None,
                error: Some(RpcError {
                    code: ErrorCode::Unavailable,
                    message: format!("failed to encode response: {err}"),
                }),
            },
        },
        Err(err) => {
            let code = if is_invalid(&err) {
                ErrorCode::Invalid
            } else if is_not_found(&err) {
                ErrorCode::NotFound
            } else {
                // transient from the caller's point of view
                warn!("request failed: {err:#}");
                ErrorCode::Unavailable
            };

            RpcResponse {
                id,
                result: None,
                error: Some(RpcError {
                    code,
                    message: format!("{err:#}"),
                }),
            }
        }
    }
}

/// Unit responses serialize as an empty object.
impl RpcResponse {
    pub fn into_result<T: serde::de::DeserializeOwned>(self) -> Result<T> {
        if let Some(error) = self.error {
            anyhow::bail!("rpc error {:?}: {}", error.code, error.message);
        }
        let value = self.result.unwrap_or(Value::Object(Default::default()));
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        api::machine::{
            EmptyDiskSpec, MachineState, NetworkInterfaceSpec, PowerState, VolumeSpec,
        },
        mcr::MachineClass,
        server::api::{
            AttachNetworkInterfaceRequest, AttachVolumeRequest, CreateMachineRequest,
            CreateMachineResponse, DetachNetworkInterfaceRequest, DetachVolumeRequest,
            ListMachinesRequest, ListMachinesResponse, MachineFilter, StatusRequest,
        },
    };

    const GIB: i64 = 1024 * 1024 * 1024;

    use crate::api::machine::machine_create_strategy;

    async fn test_server(dir: &Path) -> Arc<Server> {
        let machines = Arc::new(
            Store::<Machine>::new(dir.join("machines"), Some(machine_create_strategy))
                .await
                .expect("failed to create store"),
        );
        let classes = Arc::new(
            MachineClassRegistry::new(vec![MachineClass {
                name: "sample-machine-class".into(),
                cpu: 1,
                memory_bytes: 2 * GIB,
            }])
            .expect("failed to create registry"),
        );

        Server::new(machines, classes, Arc::new(EventRecorder::new()))
    }

    fn create_request() -> CreateMachineRequest {
        CreateMachineRequest {
            labels: HashMap::from([("MachineUID".to_string(), "foobar".to_string())]),
            annotations: HashMap::new(),
            class: "sample-machine-class".into(),
            power: PowerState::PowerOn,
            image: None,
            ignition: None,
            volumes: vec![],
            network_interfaces: vec![],
        }
    }

    fn empty_disk(name: &str, device: &str, size: i64) -> VolumeSpec {
        VolumeSpec {
            name: name.to_string(),
            device: device.to_string(),
            empty_disk: Some(EmptyDiskSpec { size }),
            local_disk: None,
            connection: None,
            deleted_at: None,
        }
    }

    fn nic(name: &str) -> NetworkInterfaceSpec {
        NetworkInterfaceSpec {
            name: name.to_string(),
            network_id: "network-id".into(),
            ips: vec!["10.0.0.1".into()],
            attributes: Default::default(),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn test_create_minimal_machine() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let server = test_server(dir.path()).await;

        let response = server
            .create_machine(create_request())
            .await
            .expect("failed to create machine");

        let machine = response.machine;
        assert!(!machine.id.is_empty());
        assert_eq!(machine.state, MachineState::Pending);
        assert_eq!(machine.power, PowerState::PowerOn);
        assert_eq!(machine.class, "sample-machine-class");
        assert_eq!(machine.labels.get("MachineUID").map(String::as_str), Some("foobar"));
        assert!(machine.image.is_none());
        assert!(machine.volumes.is_empty());
        assert!(machine.network_interfaces.is_empty());
        assert!(machine.volume_status.is_empty());
        assert!(machine.image_ref.is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_class() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let server = test_server(dir.path()).await;

        let mut request = create_request();
        request.class = "nonexistent".into();
        let err = server
            .create_machine(request)
            .await
            .expect_err("expected invalid class");
        assert!(is_invalid(&err));
    }

    #[tokio::test]
    async fn test_attach_empty_disk_shows_up_in_list() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let server = test_server(dir.path()).await;

        let created = server
            .create_machine(create_request())
            .await
            .expect("failed to create machine");

        server
            .attach_volume(AttachVolumeRequest {
                machine_id: created.machine.id.clone(),
                volume: empty_disk("disk-1", "oda", GIB),
            })
            .await
            .expect("failed to attach volume");

        let listed = server
            .list_machines(ListMachinesRequest::default())
            .await
            .expect("failed to list machines");
        assert_eq!(listed.machines.len(), 1);

        let machine = &listed.machines[0];
        assert_eq!(machine.volumes.len(), 1);
        assert_eq!(machine.volumes[0].name, "disk-1");
        assert_eq!(machine.volumes[0].device, "oda");
        assert_eq!(machine.volumes[0].empty_disk.as_ref().unwrap().size, GIB);
    }

    #[tokio::test]
    async fn test_detach_one_of_two_volumes() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let server = test_server(dir.path()).await;

        let mut request = create_request();
        request.volumes = vec![
            empty_disk("disk-1", "oda", GIB),
            empty_disk("disk-2", "odb", GIB),
        ];
        let created = server
            .create_machine(request)
            .await
            .expect("failed to create machine");

        server
            .detach_volume(DetachVolumeRequest {
                machine_id: created.machine.id.clone(),
                name: "disk-2".into(),
            })
            .await
            .expect("failed to detach volume");

        let machine = server
            .machines
            .get(&created.machine.id)
            .await
            .expect("failed to get machine");

        let disk_1 = machine
            .spec
            .volumes
            .iter()
            .find(|volume| volume.name == "disk-1")
            .expect("missing disk-1");
        assert!(disk_1.deleted_at.is_none());

        let disk_2 = machine
            .spec
            .volumes
            .iter()
            .find(|volume| volume.name == "disk-2")
            .expect("missing disk-2");
        assert!(disk_2.deleted_at.is_some());

        // detaching an unknown volume is a client error
        let err = server
            .detach_volume(DetachVolumeRequest {
                machine_id: created.machine.id.clone(),
                name: "disk-9".into(),
            })
            .await
            .expect_err("expected invalid");
        assert!(is_invalid(&err));
    }

    #[tokio::test]
    async fn test_attach_and_detach_network_interface() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let server = test_server(dir.path()).await;

        let created = server
            .create_machine(create_request())
            .await
            .expect("failed to create machine");

        server
            .attach_network_interface(AttachNetworkInterfaceRequest {
                machine_id: created.machine.id.clone(),
                network_interface: nic("my-nic"),
            })
            .await
            .expect("failed to attach nic");

        let listed = server
            .list_machines(ListMachinesRequest {
                filter: Some(MachineFilter {
                    id: Some(created.machine.id.clone()),
                    label_selector: HashMap::new(),
                }),
            })
            .await
            .expect("failed to list machines");
        assert_eq!(listed.machines.len(), 1);
        assert_eq!(listed.machines[0].network_interfaces.len(), 1);
        assert_eq!(listed.machines[0].network_interfaces[0].name, "my-nic");
        assert_eq!(
            listed.machines[0].network_interfaces[0].ips,
            vec!["10.0.0.1".to_string()]
        );

        server
            .detach_network_interface(DetachNetworkInterfaceRequest {
                machine_id: created.machine.id.clone(),
                name: "my-nic".into(),
            })
            .await
            .expect("failed to detach nic");

        let machine = server
            .machines
            .get(&created.machine.id)
            .await
            .expect("failed to get machine");
        assert!(machine.spec.network_interfaces[0].deleted_at.is_some());
    }

    #[tokio::test]
    async fn test_status_lists_classes_with_stub_quantity() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let server = test_server(dir.path()).await;

        let status = server.status(StatusRequest::default());
        assert_eq!(status.machine_class_status.len(), 1);

        let class = &status.machine_class_status[0];
        assert_eq!(class.name, "sample-machine-class");
        assert_eq!(class.capabilities.cpu, 1);
        assert_eq!(class.capabilities.memory, 2 * GIB);
        assert_eq!(class.quantity, 1000);
    }

    #[tokio::test]
    async fn test_delete_machine_sets_deletion_timestamp() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let server = test_server(dir.path()).await;

        let created = server
            .create_machine(create_request())
            .await
            .expect("failed to create machine");

        server
            .delete_machine(crate::server::api::DeleteMachineRequest {
                machine_id: created.machine.id.clone(),
            })
            .await
            .expect("failed to delete machine");

        let machine = server
            .machines
            .get(&created.machine.id)
            .await
            .expect("failed to get machine");
        assert!(machine.metadata.deleted_at.is_some());
    }

    #[tokio::test]
    async fn test_wire_roundtrip_over_unix_socket() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let server = test_server(dir.path()).await;

        let address = dir.path().join("provider.sock");
        let listener = Server::bind(&address).await.expect("failed to bind");
        assert_eq!(
            std::fs::metadata(&address)
                .expect("failed to stat socket")
                .permissions()
                .mode()
                & 0o777,
            0o666
        );

        let serve = tokio::spawn(server.clone().serve(listener));

        let stream = UnixStream::connect(&address)
            .await
            .expect("failed to connect");
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let request = serde_json::json!({
            "id": 1,
            "method": "CreateMachine",
            "params": {
                "labels": {"MachineUID": "foobar"},
                "class": "sample-machine-class",
                "power": "PowerOn",
            },
        });
        write_half
            .write_all(format!("{request}\n").as_bytes())
            .await
            .expect("failed to write request");

        let line = lines
            .next_line()
            .await
            .expect("failed to read response")
            .expect("connection closed");
        let response: RpcResponse = serde_json::from_str(&line).expect("malformed response");
        assert_eq!(response.id, 1);
        let created: CreateMachineResponse =
            response.into_result().expect("rpc returned an error");
        assert!(!created.machine.id.is_empty());
        assert_eq!(created.machine.state, MachineState::Pending);

        let request = serde_json::json!({"id": 2, "method": "ListMachines", "params": {}});
        write_half
            .write_all(format!("{request}\n").as_bytes())
            .await
            .expect("failed to write request");
        let line = lines
            .next_line()
            .await
            .expect("failed to read response")
            .expect("connection closed");
        let response: RpcResponse = serde_json::from_str(&line).expect("malformed response");
        let listed: ListMachinesResponse = response.into_result().expect("rpc returned an error");
        assert_eq!(listed.machines.len(), 1);

        serve.abort();
    }
}
