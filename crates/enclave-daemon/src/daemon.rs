//! Daemon supervisor: one listener task per allowed group, one shutdown
//! channel for all of them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use enclave_core::audit;
use enclave_core::{Enclave, EnclaveSettings};

use crate::listener::GroupListener;
use crate::pipeline::Pipeline;
use crate::relay::TransportFactory;
use crate::status::StatusEvent;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub backoff: Duration,
}

impl DaemonConfig {
    pub fn from_settings(settings: &EnclaveSettings) -> Self {
        Self {
            backoff: settings.relays.reconnect_backoff(),
        }
    }
}

pub struct DaemonHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl DaemonHandle {
    /// Groups being served.
    pub fn groups(&self) -> Vec<&str> {
        self.tasks.iter().map(|(g, _)| g.as_str()).collect()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for every listener to stop.
    pub async fn join(self) {
        for (group, task) in self.tasks {
            if let Err(e) = task.await {
                warn!(group = %group, error = %e, "listener task failed");
            }
        }
    }
}

/// Spawn listeners for every stored group the policy allows. Groups outside
/// the allowed set are skipped and audited; the check happens once, here.
pub fn start(
    enclave: &Enclave,
    factory: Arc<dyn TransportFactory>,
    config: DaemonConfig,
    status: mpsc::UnboundedSender<StatusEvent>,
) -> Result<DaemonHandle> {
    let owner = enclave
        .access()
        .owner()
        .ok_or_else(|| anyhow!("access control policy has no owner"))?;
    info!(owner = %owner.short(), "access control policy loaded");

    let pipeline = Arc::new(Pipeline::new(enclave));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    for record in enclave.groups()? {
        let group_id = record.mls_group_id;
        if !enclave.access().is_group_allowed(&group_id) {
            info!(group = %group_id, "group not allowed; not serving");
            enclave
                .audit()
                .record(audit::GROUP_SKIPPED, false, None, Some(&group_id), "group not in allowed set")?;
            let _ = status.send(StatusEvent::Skipped {
                group: group_id,
            });
            continue;
        }
        let listener = GroupListener {
            group_id: group_id.clone(),
            store: enclave.store().clone(),
            pipeline: pipeline.clone(),
            factory: factory.clone(),
            default_relays: enclave.settings().relays.default_relays.clone(),
            backoff: config.backoff,
            status: status.clone(),
        };
        let task = tokio::spawn(listener.run(shutdown_rx.clone()));
        tasks.push((group_id, task));
    }

    info!(groups = tasks.len(), "daemon started");
    Ok(DaemonHandle { shutdown_tx, tasks })
}
