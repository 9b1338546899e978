mod cmd;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;

use chv_provider::{
    api::{
        machine::{Machine, machine_create_strategy},
        nic::{NetworkInterface, nic_create_strategy},
    },
    controllers::{
        machine::{MachineReconciler, MachineReconcilerOptions},
        nic::NetworkInterfaceReconciler,
    },
    host::Paths,
    machinery::{
        event::{DEFAULT_RESYNC_INTERVAL, EventSource},
        store::Store,
    },
    mcr::MachineClassRegistry,
    oci::LocalImageCache,
    plugins::{
        nic::{NetworkInterfacePlugin, apinet::{ApinetPlugin, HttpApinetClient}, isolated::IsolatedPlugin},
        volume::{
            VolumePluginManager,
            ceph::{CephPlugin, QmpProvider, qmp::QmpMonitor},
            empty_disk::EmptyDiskPlugin,
            local_disk::LocalDiskPlugin,
        },
    },
    raw::Raw,
    recorder::EventRecorder,
    server::Server,
    utils::tracing::init_tracing,
    vmm::{Manager, ManagerOptions},
};

use crate::cmd::{Cli, NicPluginKind};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    let machine_classes = Arc::new(
        MachineClassRegistry::new(cli.machine_classes)
            .context("failed to build machine class registry")?,
    );

    let paths = Paths::at(&cli.provider_root_dir)
        .await
        .context("failed to initialize provider root")?;

    let image_cache = Arc::new(
        LocalImageCache::new(paths.images_dir())
            .await
            .context("failed to initialize image cache")?,
    );
    let raw = Raw::new();

    // the storage daemon may still be coming up, ceph volumes retry anyway
    if let Err(err) =
        chv_provider::osutils::wait_for_socket(&cli.qmp_socket_path, std::time::Duration::from_secs(2))
            .await
    {
        tracing::warn!("qmp socket is not available yet: {err:#}");
    }
    let qmp_monitor = Arc::new(QmpMonitor::new(&cli.qmp_socket_path));
    let ceph_provider = Arc::new(QmpProvider::new(paths.clone(), qmp_monitor));

    let mut volume_plugins = VolumePluginManager::new();
    volume_plugins
        .init_plugins(
            &paths,
            vec![
                Box::new(CephPlugin::new(ceph_provider)),
                Box::new(LocalDiskPlugin::new(raw.clone(), image_cache.clone())),
                Box::new(EmptyDiskPlugin::new(raw.clone())),
            ],
        )
        .context("failed to initialize volume plugins")?;
    let volume_plugins = Arc::new(volume_plugins);

    let nic_plugin: Arc<dyn NetworkInterfacePlugin> = match cli.nic_plugin {
        NicPluginKind::Isolated => {
            let mut plugin = IsolatedPlugin::new();
            plugin.init(paths.clone())?;
            Arc::new(plugin)
        }
        NicPluginKind::Apinet => {
            let Some(node_name) = cli.apinet_node_name else {
                bail!("--apinet-node-name is required with --nic-plugin apinet");
            };
            let Some(url) = cli.apinet_url else {
                bail!("--apinet-url is required with --nic-plugin apinet");
            };

            let mut plugin = ApinetPlugin::new(node_name, Arc::new(HttpApinetClient::new(url)));
            plugin.init(paths.clone())?;
            Arc::new(plugin)
        }
    };
    info!("using nic plugin {}", nic_plugin.name());

    let machine_store_dir = cli
        .provider_machine_store_dir
        .unwrap_or_else(|| paths.machine_store_dir());
    let machines = Arc::new(
        Store::<Machine>::new(&machine_store_dir, Some(machine_create_strategy))
            .await
            .context("failed to open machine store")?,
    );
    let nics = Arc::new(
        Store::<NetworkInterface>::new(paths.nic_store_dir(), Some(nic_create_strategy))
            .await
            .context("failed to open nic store")?,
    );

    let machine_events = Arc::new(EventSource::new(machines.clone(), DEFAULT_RESYNC_INTERVAL));
    let nic_events = Arc::new(EventSource::new(nics.clone(), DEFAULT_RESYNC_INTERVAL));

    // sockets referenced by stored machines stay reserved across restarts
    let reserved_sockets: Vec<String> = machines
        .list()
        .await
        .context("failed to list machines")?
        .into_iter()
        .filter_map(|machine| machine.spec.api_socket_path)
        .collect();

    let vmm = Arc::new(
        Manager::discover(
            paths.clone(),
            ManagerOptions {
                sockets_dir: cli.cloud_hypervisor_sockets_path,
                firmware_path: cli.cloud_hypervisor_firmware_path,
                reserved_sockets,
            },
        )
        .await
        .context("failed to discover hypervisor sockets")?,
    );
    info!("managing {} hypervisor sockets", vmm.instance_count());

    let recorder = Arc::new(EventRecorder::new());

    let machine_reconciler = MachineReconciler::new(
        machines.clone(),
        nics.clone(),
        recorder.clone(),
        vmm,
        volume_plugins,
        nic_plugin.clone(),
        MachineReconcilerOptions {
            image_cache: image_cache.clone(),
            raw,
            paths: paths.clone(),
            worker_count: cli.worker_count,
        },
    );
    let nic_reconciler =
        NetworkInterfaceReconciler::new(nics.clone(), nic_plugin, cli.worker_count);

    let server = Server::new(machines, machine_classes, recorder);
    let listener = Server::bind(&cli.address).await?;

    // handlers must be registered before the event pumps start
    let mut workers = machine_reconciler.start(&machine_events);
    workers.extend(nic_reconciler.start(&nic_events));

    let mut tasks = Vec::new();

    tasks.push(tokio::spawn({
        let image_cache = image_cache.clone();
        async move { image_cache.start().await }
    }));
    tasks.push(tokio::spawn({
        let machine_events = machine_events.clone();
        async move {
            if let Err(err) = machine_events.start().await {
                tracing::error!("machine event source stopped: {err:#}");
            }
        }
    }));
    tasks.push(tokio::spawn({
        let nic_events = nic_events.clone();
        async move {
            if let Err(err) = nic_events.start().await {
                tracing::error!("nic event source stopped: {err:#}");
            }
        }
    }));

    tasks.push(tokio::spawn({
        let server = server.clone();
        async move {
            if let Err(err) = server.serve(listener).await {
                tracing::error!("rpc server stopped: {err:#}");
            }
        }
    }));

    info!("provider is up");
    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    info!("shutting down");

    machine_reconciler.shutdown();
    nic_reconciler.shutdown();
    for worker in workers {
        let _ = worker.await;
    }
    for task in tasks {
        task.abort();
    }

    Ok(())
}
