use std::sync::Arc;

use anyhow::{Context, Result};
use async_channel::Receiver;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    api::{
        Object,
        nic::{NetworkInterface, machine_id_from_nic_record_id},
    },
    constants::{DEFAULT_WORKER_COUNT, NETWORK_INTERFACE_FINALIZER},
    errors::{Invalid, is_invalid},
    machinery::{
        event::{EventHandler, EventSource},
        store::{Store, WatchEvent, is_not_found},
        workqueue::WorkQueue,
    },
    plugins::nic::NetworkInterfacePlugin,
};

pub struct NetworkInterfaceReconciler {
    nics: Arc<Store<NetworkInterface>>,
    nic_plugin: Arc<dyn NetworkInterfacePlugin>,

    queue: WorkQueue,
    queue_rx: Receiver<String>,
    worker_count: usize,
}

struct EnqueueNic {
    queue: WorkQueue,
}

#[async_trait]
impl EventHandler<NetworkInterface> for EnqueueNic {
    async fn handle(&self, event: &WatchEvent<NetworkInterface>) {
        self.queue.add(event.object.id()).await;
    }
}

impl NetworkInterfaceReconciler {
    pub fn new(
        nics: Arc<Store<NetworkInterface>>,
        nic_plugin: Arc<dyn NetworkInterfacePlugin>,
        worker_count: usize,
    ) -> Arc<Self> {
        let (queue, queue_rx) = WorkQueue::new();
        let worker_count = if worker_count == 0 {
            DEFAULT_WORKER_COUNT
        } else {
            worker_count
        };

        Arc::new(Self {
            nics,
            nic_plugin,
            queue,
            queue_rx,
            worker_count,
        })
    }

    pub fn start(
        self: &Arc<Self>,
        nic_events: &EventSource<NetworkInterface>,
    ) -> Vec<JoinHandle<()>> {
        nic_events.add_handler(Arc::new(EnqueueNic {
            queue: self.queue.clone(),
        }));

        info!("starting {} nic workers", self.worker_count);
        (0..self.worker_count)
            .map(|_| {
                let this = self.clone();
                tokio::spawn(async move { this.worker().await })
            })
            .collect()
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    async fn worker(self: Arc<Self>) {
        while let Ok(id) = self.queue_rx.recv().await {
            self.process(&id).await;
            self.queue.done(&id).await;
        }
    }

    pub async fn process(&self, id: &str) {
        match self.reconcile(id).await {
            Ok(()) => self.queue.forget(id),
            Err(err) if is_invalid(&err) => {
                warn!("nic {id} has an invalid id or spec: {err:#}");
            }
            Err(err) => {
                warn!("failed to reconcile nic {id}: {err:#}");
                self.queue.add_rate_limited(id).await;
            }
        }
    }

    pub async fn reconcile(&self, id: &str) -> Result<()> {
        debug!("reconciling nic {id}");

        let nic = match self.nics.get(id).await {
            Ok(nic) => nic,
            Err(err) if is_not_found(&err) => return Ok(()),
            Err(err) => return Err(err).context("failed to fetch nic from store"),
        };

        if nic.metadata.deleted_at.is_some() {
            if nic.metadata.finalizers.len() > 1 {
                debug!("nic {id} still has finalizers from dependents");
                return Ok(());
            }

            self.delete_nic(nic).await?;
            info!("successfully deleted nic {id}");
            return Ok(());
        }

        if !nic.metadata.has_finalizer(NETWORK_INTERFACE_FINALIZER) {
            let mut nic = nic;
            nic.metadata.add_finalizer(NETWORK_INTERFACE_FINALIZER);
            self.nics
                .update(nic)
                .await
                .context("failed to set finalizer")?;
            return Ok(());
        }

        let Some(machine_id) = machine_id_from_nic_record_id(id).map(str::to_string) else {
            return Err(Invalid(format!("malformed nic record id: {id}")).into());
        };

        let status = self
            .nic_plugin
            .apply(&nic.spec, &machine_id)
            .await
            .context("failed to apply network interface")?;

        let mut nic = nic;
        nic.status = Some(status);
        self.nics
            .update(nic)
            .await
            .context("failed to update network interface")?;

        Ok(())
    }

    async fn delete_nic(&self, nic: NetworkInterface) -> Result<()> {
        let id = nic.id().to_string();

        if !nic.metadata.has_finalizer(NETWORK_INTERFACE_FINALIZER) {
            if !nic.metadata.finalizers.is_empty() {
                debug!("nic {id} is still pinned by other finalizers");
                return Ok(());
            }
            debug!("nic {id} has no finalizer, removing record");
            return match self.nics.delete(&id).await {
                Ok(()) => Ok(()),
                Err(err) if is_not_found(&err) => Ok(()),
                Err(err) => Err(err),
            };
        }

        let Some(machine_id) = machine_id_from_nic_record_id(&id).map(str::to_string) else {
            return Err(Invalid(format!("malformed nic record id: {id}")).into());
        };

        self.nic_plugin
            .delete(&nic.spec.name, &machine_id)
            .await
            .context("failed to delete network interface")?;

        let mut nic = nic;
        nic.metadata.remove_finalizer(NETWORK_INTERFACE_FINALIZER);
        match self.nics.update(nic).await {
            Ok(_) => {}
            Err(err) if is_not_found(&err) => return Ok(()),
            Err(err) => return Err(err).context("failed to update nic metadata"),
        }

        match self.nics.delete(&id).await {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
