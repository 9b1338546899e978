// In-process stand-in for a cloud-hypervisor control socket, used by unit
// tests across the crate.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
    task::JoinHandle,
};

use crate::vmm::types::{
    DeviceConfig, DiskConfig, PlatformConfig, VmConfig, VmInfo, VmRemoveDevice, VmState,
};

const VM_NOT_CREATED_BODY: &str =
    "Error from API: The VM info is not available: VM is not created";

#[derive(Default)]
struct FakeVm {
    config: Option<VmConfig>,
    state: Option<VmState>,
}

pub struct FakeHypervisor {
    socket_path: PathBuf,
    vm: Arc<StdMutex<FakeVm>>,
    requests: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Drop for FakeHypervisor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl FakeHypervisor {
    pub async fn start(socket_path: impl AsRef<Path>) -> Self {
        let socket_path = socket_path.as_ref().to_path_buf();
        let listener = UnixListener::bind(&socket_path).expect("failed to bind fake hypervisor");

        let vm = Arc::new(StdMutex::new(FakeVm::default()));
        let requests = Arc::new(AtomicUsize::new(0));

        let task = {
            let vm = vm.clone();
            let requests = requests.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    let vm = vm.clone();
                    let requests = requests.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, vm, requests).await;
                    });
                }
            })
        };

        Self {
            socket_path,
            vm,
            requests,
            task,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Seeds a pre-existing VM, as found after a provider restart.
    pub fn set_vm_created(&self, uuid: &str) {
        let mut vm = self.vm.lock().expect("fake vm lock poisoned");
        vm.config = Some(VmConfig {
            cpus: None,
            memory: None,
            payload: Default::default(),
            platform: Some(PlatformConfig {
                uuid: Some(uuid.to_string()),
                oem_strings: None,
            }),
            console: None,
            serial: None,
            disks: None,
            devices: None,
        });
        vm.state = Some(VmState::Created);
    }

    pub fn vm_state(&self) -> Option<VmState> {
        self.vm.lock().expect("fake vm lock poisoned").state
    }

    pub fn disk_ids(&self) -> Vec<String> {
        let vm = self.vm.lock().expect("fake vm lock poisoned");
        vm.config
            .as_ref()
            .and_then(|config| config.disks.clone())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|disk| disk.id)
            .collect()
    }

    pub fn device_ids(&self) -> Vec<String> {
        let vm = self.vm.lock().expect("fake vm lock poisoned");
        vm.config
            .as_ref()
            .and_then(|config| config.devices.clone())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|device| device.id)
            .collect()
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    vm: Arc<StdMutex<FakeVm>>,
    requests: Arc<AtomicUsize>,
) {
    let Some((method, path, body)) = read_request(&mut stream).await else {
        return;
    };
    requests.fetch_add(1, Ordering::SeqCst);

    let (status, response_body) = route(&method, &path, &body, &vm);
    let response = format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{response_body}",
        reason(status),
        response_body.len(),
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Internal Server Error",
    }
}

async fn read_request(stream: &mut UnixStream) -> Option<(String, String, String)> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);

        if let Some(split) = find_header_end(&raw) {
            let head = String::from_utf8_lossy(&raw[..split]).to_string();
            let content_length = head
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);

            while raw.len() < split + 4 + content_length {
                let n = stream.read(&mut buf).await.ok()?;
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
            }

            let body =
                String::from_utf8_lossy(&raw[split + 4..split + 4 + content_length]).to_string();
            let mut parts = head.lines().next()?.split_whitespace();
            let method = parts.next()?.to_string();
            let path = parts.next()?.to_string();
            return Some((method, path, body));
        }
    }

    None
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn route(method: &str, path: &str, body: &str, vm: &Arc<StdMutex<FakeVm>>) -> (u16, String) {
    let mut state = vm.lock().expect("fake vm lock poisoned");

    match (method, path) {
        ("GET", "/api/v1/vmm.ping") => (
            200,
            r#"{"version":"fake-hypervisor","pid":4242,"features":[]}"#.to_string(),
        ),
        ("GET", "/api/v1/vm.info") => match (&state.config, state.state) {
            (Some(config), Some(vm_state)) => {
                let info = VmInfo {
                    config: config.clone(),
                    state: vm_state,
                    memory_actual_size: None,
                };
                (200, serde_json::to_string(&info).expect("encode vm info"))
            }
            _ => (500, VM_NOT_CREATED_BODY.to_string()),
        },
        ("PUT", "/api/v1/vm.create") => match serde_json::from_str::<VmConfig>(body) {
            Ok(config) => {
                state.config = Some(config);
                state.state = Some(VmState::Created);
                (204, String::new())
            }
            Err(err) => (400, format!("invalid vm config: {err}")),
        },
        ("PUT", "/api/v1/vm.boot") => {
            if state.config.is_none() {
                return (500, VM_NOT_CREATED_BODY.to_string());
            }
            state.state = Some(VmState::Running);
            (204, String::new())
        }
        ("PUT", "/api/v1/vm.shutdown") => match state.state {
            Some(VmState::Running) => {
                state.state = Some(VmState::Shutdown);
                (204, String::new())
            }
            Some(_) => (500, "Error from API: The VM is not booted".to_string()),
            None => (500, VM_NOT_CREATED_BODY.to_string()),
        },
        ("PUT", "/api/v1/vm.delete") => {
            state.config = None;
            state.state = None;
            (204, String::new())
        }
        ("PUT", "/api/v1/vm.add-disk") => {
            let Ok(disk) = serde_json::from_str::<DiskConfig>(body) else {
                return (400, "invalid disk config".to_string());
            };
            let Some(config) = state.config.as_mut() else {
                return (500, VM_NOT_CREATED_BODY.to_string());
            };
            let disks = config.disks.get_or_insert_with(Vec::new);
            if disks.iter().any(|d| d.id == disk.id) {
                return (400, "device already exists".to_string());
            }
            let id = disk.id.clone().unwrap_or_default();
            disks.push(disk);
            (200, format!(r#"{{"id":"{id}","bdf":"0000:00:06.0"}}"#))
        }
        ("PUT", "/api/v1/vm.add-device") => {
            let Ok(device) = serde_json::from_str::<DeviceConfig>(body) else {
                return (400, "invalid device config".to_string());
            };
            let Some(config) = state.config.as_mut() else {
                return (500, VM_NOT_CREATED_BODY.to_string());
            };
            let devices = config.devices.get_or_insert_with(Vec::new);
            if devices.iter().any(|d| d.id == device.id) {
                return (400, "device already exists".to_string());
            }
            let id = device.id.clone().unwrap_or_default();
            devices.push(device);
            (200, format!(r#"{{"id":"{id}","bdf":"0000:00:07.0"}}"#))
        }
        ("PUT", "/api/v1/vm.remove-device") => {
            let Ok(remove) = serde_json::from_str::<VmRemoveDevice>(body) else {
                return (400, "invalid remove request".to_string());
            };
            let Some(config) = state.config.as_mut() else {
                return (500, VM_NOT_CREATED_BODY.to_string());
            };
            if let Some(disks) = config.disks.as_mut() {
                disks.retain(|d| d.id.as_deref() != Some(remove.id.as_str()));
            }
            if let Some(devices) = config.devices.as_mut() {
                devices.retain(|d| d.id.as_deref() != Some(remove.id.as_str()));
            }
            (204, String::new())
        }
        _ => (404, format!("no route for {method} {path}")),
    }
}
