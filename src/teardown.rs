//! The Teardown Sequencer: ordered destruction of one runtime.
//!
//! Five stages: cache eviction, worker destruction, port release, master
//! destruction, final cleanup. Stage 1 is best-effort with a bounded retry
//! budget — once the budget is exhausted teardown proceeds unconditionally,
//! so a wedged cache never blocks deletion forever. Stages 2-5 propagate
//! errors; the caller retries the whole call.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use once_cell::sync::Lazy;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::edition::Edition;
use crate::engine::Engine;
use crate::retry::retry_on_conflict;
use crate::transform::RuntimeValue;
use crate::{Error, Result, FUSE_CONTAINER_NAME, WORKER_CONTAINER_NAME};

/// Serializes node-label bookkeeping across concurrently-tearing-down
/// runtimes that may share nodes.
static SCHEDULER_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

impl Engine {
    /// Tear the runtime down.
    ///
    /// Cache-eviction failures are swallowed and retried on subsequent calls
    /// up to the graceful-shutdown limit; afterwards eviction is skipped and
    /// the remaining stages always run.
    #[instrument(skip_all, fields(runtime = %self.name, namespace = %self.namespace))]
    pub async fn shutdown(&self) -> Result<()> {
        if self.retry_shutdown.load(Ordering::SeqCst) < self.graceful_shutdown_limits {
            if let Err(e) = self.invalidate_cache().await {
                let attempts = self.retry_shutdown.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    runtime = %self.name,
                    error = %e,
                    attempts,
                    limit = self.graceful_shutdown_limits,
                    "Cache eviction failed, deferring teardown"
                );
                return Ok(());
            }
        } else {
            info!(
                runtime = %self.name,
                "Cache eviction budget exhausted, proceeding without eviction"
            );
        }

        self.destroy_workers().await?;
        self.release_metrics_ports().await?;
        self.destroy_master().await?;
        self.clean_all().await?;
        info!(runtime = %self.name, namespace = %self.namespace, "Runtime torn down");
        Ok(())
    }

    /// Stage 1: delete the cached chunks of this filesystem from every live
    /// worker and fuse pod.
    async fn invalidate_cache(&self) -> Result<()> {
        let Some(value) = self.load_runtime_value().await? else {
            debug!(runtime = %self.name, "No value file recorded, nothing cached to evict");
            return Ok(());
        };
        let uuid = self.discover_uuid(&value).await?;
        let cache_dirs: Vec<&str> = value.cache_dirs.values().map(|d| d.path.as_str()).collect();

        let worker_pods = self
            .store
            .list_ready_pods(&self.namespace, &self.worker_selector())
            .await?;
        let fuse_pods = self
            .store
            .list_ready_pods(&self.namespace, &self.fuse_selector())
            .await?;

        for (pods, container) in [
            (&worker_pods, WORKER_CONTAINER_NAME),
            (&fuse_pods, FUSE_CONTAINER_NAME),
        ] {
            for pod in pods.iter() {
                let Some(pod_name) = pod.metadata.name.as_deref() else {
                    continue;
                };
                for dir in &cache_dirs {
                    let command = vec![
                        "rm".to_string(),
                        "-rf".to_string(),
                        format!("{dir}/{uuid}/raw/chunks"),
                    ];
                    self.exec
                        .exec(&self.namespace, pod_name, container, &command)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// The on-disk cache is keyed by filesystem UUID. The enterprise client
    /// uses the filesystem name; the community client assigns one at format
    /// time, readable only from a live worker's status output.
    async fn discover_uuid(&self, value: &RuntimeValue) -> Result<String> {
        if value.edition == Edition::Enterprise {
            return Ok(value.source.clone());
        }

        let pods = self
            .store
            .list_ready_pods(&self.namespace, &self.worker_selector())
            .await?;
        let pod = pods
            .first()
            .and_then(|p| p.metadata.name.as_deref())
            .ok_or_else(|| {
                Error::pod_exec("no ready worker pod to discover the filesystem UUID")
            })?;
        let command = vec![
            value.edition.cli_path().to_string(),
            "status".to_string(),
            value.source.clone(),
        ];
        let (stdout, _) = self
            .exec
            .exec(&self.namespace, pod, WORKER_CONTAINER_NAME, &command)
            .await?;
        parse_uuid(&stdout)
            .ok_or_else(|| Error::parse(format!("no UUID in client status output: {stdout}")))
    }

    /// Stage 2: release the node labels this runtime's workers held, under
    /// the scheduler lock.
    async fn destroy_workers(&self) -> Result<()> {
        let _guard = SCHEDULER_LOCK.lock().await;

        let selector = format!("{}=true", self.common_label_name());
        let nodes = self.store.list_nodes(&selector).await?;
        for node in nodes {
            let Some(node_name) = node.metadata.name.clone() else {
                continue;
            };
            retry_on_conflict("release worker node labels", || async {
                let mut node = self.store.get_node(&node_name).await?;
                let Some(labels) = node.metadata.labels.as_mut() else {
                    return Ok(());
                };
                let mut touched = false;
                for label in self.worker_node_labels() {
                    touched |= labels.remove(&label).is_some();
                }
                if labels.get(self.exclusive_label_key())
                    == Some(&self.exclusive_label_value())
                {
                    labels.remove(self.exclusive_label_key());
                    touched = true;
                }
                if touched {
                    self.store.update_node(&node).await?;
                }
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    fn worker_node_labels(&self) -> Vec<String> {
        let mut labels = vec![self.runtime_label_name(), self.common_label_name()];
        labels.extend(self.storage_label_names());
        labels
    }

    /// Stage 3: return reserved metrics ports to the allocator. A missing
    /// values ConfigMap is tolerated — the ports may already be gone.
    async fn release_metrics_ports(&self) -> Result<()> {
        let Some(value) = self.load_runtime_value().await? else {
            debug!(runtime = %self.name, "Values ConfigMap already gone, skipping port release");
            return Ok(());
        };
        if value.edition != Edition::Community {
            return Ok(());
        }

        let mut ports = Vec::new();
        if value.worker.host_network {
            ports.extend(value.worker.metrics_port);
        }
        if value.fuse.component.host_network {
            ports.extend(value.fuse.component.metrics_port);
        }
        if !ports.is_empty() {
            self.ports.release_ports(ports).await?;
        }
        Ok(())
    }

    /// Stage 4: uninstall the release, or fall back to deleting the known
    /// residual objects when no release exists.
    async fn destroy_master(&self) -> Result<()> {
        if self.helm.check_release(&self.name, &self.namespace).await? {
            self.helm.delete_release(&self.name, &self.namespace).await?;
            return Ok(());
        }

        debug!(runtime = %self.name, "No release found, deleting residual objects");
        self.store
            .delete_configmap(&self.namespace, &self.worker_script_name())
            .await?;
        self.store
            .delete_configmap(&self.namespace, &self.fuse_script_name())
            .await?;
        let loader = format!("{}-loader", self.name);
        self.store
            .delete_service_account(&self.namespace, &loader)
            .await?;
        self.store.delete_role(&self.namespace, &loader).await?;
        self.store
            .delete_role_binding(&self.namespace, &loader)
            .await?;
        Ok(())
    }

    /// Stage 5: release fuse node labels and delete the two well-known
    /// ConfigMaps.
    async fn clean_all(&self) -> Result<()> {
        let fuse_label = self.fuse_label_name();
        let selector = format!("{fuse_label}=true");
        let nodes = self.store.list_nodes(&selector).await?;
        for node in nodes {
            let Some(node_name) = node.metadata.name.clone() else {
                continue;
            };
            retry_on_conflict("release fuse node label", || async {
                let mut node = self.store.get_node(&node_name).await?;
                let removed = node
                    .metadata
                    .labels
                    .as_mut()
                    .map(|labels| labels.remove(&fuse_label).is_some())
                    .unwrap_or(false);
                if removed {
                    self.store.update_node(&node).await?;
                }
                Ok(())
            })
            .await?;
        }

        self.store
            .delete_configmap(&self.namespace, &self.values_configmap_name())
            .await?;
        self.store
            .delete_configmap(&self.namespace, &self.config_configmap_name())
            .await?;
        Ok(())
    }
}

/// Extract the filesystem UUID from community client status output
/// (JSON containing `"UUID": "<uuid>"`).
fn parse_uuid(stdout: &str) -> Option<String> {
    let start = stdout.find("\"UUID\": \"")? + "\"UUID\": \"".len();
    let end = stdout[start..].find('"')?;
    Some(stdout[start..start + end].to_string())
}
