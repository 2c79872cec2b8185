//! The Metadata Coordinator: single-flight background sizing of the dataset.
//!
//! Measuring the backing store (total bytes plus file count) can take
//! minutes, so it never runs on the reconciliation path. At most one
//! background task per runtime is in flight; its result comes back through a
//! one-shot channel held in the engine. Each reconciliation pass polls that
//! channel with a short timeout and otherwise returns immediately, so loop
//! liveness is never tied to task duration.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use crate::crd::{Dataset, METADATA_SYNC_NOT_DONE_MSG};
use crate::engine::Engine;
use crate::quantity::format_bytes;
use crate::retry::retry_on_conflict;
use crate::store::{PodExecutor, ResourceStore};
use crate::{Error, Result, METADATA_SYNC_POLL_TIMEOUT, WORKER_CONTAINER_NAME};

/// Terminal result published exactly once by the background sizing task
#[derive(Clone, Debug)]
pub struct MetadataSyncResult {
    /// Whether the computation succeeded
    pub done: bool,
    /// When the computation started
    pub start_time: DateTime<Utc>,
    /// Human-readable total size of the backing store
    pub ufs_total: String,
    /// Number of files in the backing store
    pub file_num: String,
    /// Failure detail when `done` is false
    pub err: Option<String>,
}

/// Whether the dataset still needs a sizing pass: no recorded total yet, or
/// a stale in-flight marker left by an earlier operator instance.
fn should_sync(dataset: &Dataset) -> bool {
    match dataset.status.as_ref().and_then(|s| s.ufs_total.as_deref()) {
        None | Some("") | Some(METADATA_SYNC_NOT_DONE_MSG) => true,
        Some(_) => false,
    }
}

impl Engine {
    /// Drive the metadata state machine one step.
    ///
    /// Idle with a dataset lacking size facts: mark it calculating and start
    /// the background task. Running: poll the held channel briefly; timeout
    /// leaves it held for the next pass. A received failure surfaces once,
    /// then the coordinator is Idle again.
    #[instrument(skip_all, fields(runtime = %self.name, namespace = %self.namespace))]
    pub async fn sync_metadata(&self) -> Result<()> {
        let mut slot = self.metadata_sync_rx.lock().await;

        if let Some(rx) = slot.as_mut() {
            return match tokio::time::timeout(METADATA_SYNC_POLL_TIMEOUT, rx).await {
                Err(_) => {
                    debug!(runtime = %self.name, "Metadata sync still running");
                    Ok(())
                }
                Ok(Ok(result)) => {
                    *slot = None;
                    if result.done {
                        self.persist_metadata_result(&result).await?;
                        crate::telemetry::record_metadata_sync(&self.name, &result);
                        Ok(())
                    } else {
                        Err(Error::metadata_sync(
                            result.err.unwrap_or_else(|| "unknown failure".to_string()),
                        ))
                    }
                }
                Ok(Err(_)) => {
                    *slot = None;
                    warn!(runtime = %self.name, "Metadata sync task dropped without a result");
                    Ok(())
                }
            };
        }

        // Idle: re-check the source of truth before starting anything, so a
        // deleted dataset fails fast instead of launching wasted work.
        let dataset = self.store.get_dataset(&self.namespace, &self.name).await?;
        if !should_sync(&dataset) {
            return Ok(());
        }

        self.mark_dataset_calculating().await?;

        let (tx, rx) = oneshot::channel();
        *slot = Some(rx);

        let store = Arc::clone(&self.store);
        let exec = Arc::clone(&self.exec);
        let namespace = self.namespace.clone();
        let name = self.name.clone();
        let selector = self.worker_selector();
        let mount_path = self.mount_point();
        tokio::spawn(async move {
            let start_time = Utc::now();
            let result =
                match compute_dataset_size(store, exec, &namespace, &name, &selector, &mount_path)
                    .await
                {
                    Ok((ufs_total, file_num)) => MetadataSyncResult {
                        done: true,
                        start_time,
                        ufs_total,
                        file_num,
                        err: None,
                    },
                    Err(e) => MetadataSyncResult {
                        done: false,
                        start_time,
                        ufs_total: String::new(),
                        file_num: String::new(),
                        err: Some(e.to_string()),
                    },
                };
            // receiver abandonment is recoverable, not a crash
            if tx.send(result).is_err() {
                warn!(runtime = %name, "Metadata sync result dropped, receiver gone");
            }
        });
        Ok(())
    }

    async fn mark_dataset_calculating(&self) -> Result<()> {
        retry_on_conflict("mark dataset calculating", || async {
            let mut dataset = self.store.get_dataset(&self.namespace, &self.name).await?;
            let status = dataset.status.get_or_insert_with(Default::default);
            if status.ufs_total.as_deref() == Some(METADATA_SYNC_NOT_DONE_MSG) {
                return Ok(());
            }
            status.ufs_total = Some(METADATA_SYNC_NOT_DONE_MSG.to_string());
            self.store.update_dataset_status(&dataset).await
        })
        .await
    }

    async fn persist_metadata_result(&self, result: &MetadataSyncResult) -> Result<()> {
        retry_on_conflict("persist metadata sync result", || async {
            let mut dataset = self.store.get_dataset(&self.namespace, &self.name).await?;
            let status = dataset.status.get_or_insert_with(Default::default);
            status.ufs_total = Some(result.ufs_total.clone());
            status.file_num = Some(result.file_num.clone());
            self.store.update_dataset_status(&dataset).await
        })
        .await
    }
}

/// Measure the mounted dataset from inside a ready worker pod: total bytes
/// via `du`, file count via `find`.
async fn compute_dataset_size(
    store: Arc<dyn ResourceStore>,
    exec: Arc<dyn PodExecutor>,
    namespace: &str,
    name: &str,
    selector: &std::collections::BTreeMap<String, String>,
    mount_path: &str,
) -> Result<(String, String)> {
    // fail fast when the dataset vanished while we were queued
    store.get_dataset(namespace, name).await?;

    let pods = store.list_ready_pods(namespace, selector).await?;
    let pod = pods
        .first()
        .and_then(|p| p.metadata.name.as_deref())
        .ok_or_else(|| Error::metadata_sync("no ready worker pod to measure the dataset"))?;

    let du = vec!["du".to_string(), "-sb".to_string(), mount_path.to_string()];
    let (stdout, _) = exec.exec(namespace, pod, WORKER_CONTAINER_NAME, &du).await?;
    let bytes = stdout
        .split_whitespace()
        .next()
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| Error::metadata_sync(format!("unexpected du output: {stdout}")))?;

    let find = vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("find {mount_path} -type f | wc -l"),
    ];
    let (stdout, _) = exec
        .exec(namespace, pod, WORKER_CONTAINER_NAME, &find)
        .await?;
    let file_num = stdout.trim().to_string();
    if file_num.parse::<u64>().is_err() {
        return Err(Error::metadata_sync(format!(
            "unexpected file count output: {stdout}"
        )));
    }

    Ok((format_bytes(bytes as f64), file_num))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DatasetSpec, DatasetStatus};
    use crate::engine::test_support::{bare_engine, engine_with};
    use crate::store::{MockHelmDriver, MockPodExecutor, MockPortAllocator, MockResourceStore};
    use k8s_openapi::api::core::v1::Pod;
    use kube::api::ObjectMeta;

    fn dataset_with_total(total: Option<&str>) -> Dataset {
        let mut dataset = Dataset::new("demo", DatasetSpec::default());
        dataset.status = Some(DatasetStatus {
            ufs_total: total.map(|t| t.to_string()),
            ..Default::default()
        });
        dataset
    }

    fn worker_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("demo-worker-0".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn should_sync_only_without_recorded_totals() {
        assert!(should_sync(&Dataset::new("demo", DatasetSpec::default())));
        assert!(should_sync(&dataset_with_total(None)));
        assert!(should_sync(&dataset_with_total(Some(""))));
        assert!(should_sync(&dataset_with_total(Some("[Calculating]"))));
        assert!(!should_sync(&dataset_with_total(Some("387.17KiB"))));
    }

    #[tokio::test]
    async fn running_sync_returns_promptly_without_a_second_task() {
        // scenario: a computation is in flight and has produced nothing yet
        let engine = bare_engine();
        let (_tx, rx) = oneshot::channel::<MetadataSyncResult>();
        *engine.metadata_sync_rx.lock().await = Some(rx);

        // the bare engine's store panics on use, so reaching Ok proves the
        // idle path (and any second task) was never entered
        engine.sync_metadata().await.unwrap();
        assert!(engine.metadata_sync_rx.lock().await.is_some());
    }

    #[tokio::test]
    async fn received_success_is_persisted_and_clears_the_slot() {
        let mut store = MockResourceStore::new();
        store
            .expect_get_dataset()
            .returning(|_, _| Ok(dataset_with_total(Some("[Calculating]"))));
        store
            .expect_update_dataset_status()
            .withf(|d| {
                let status = d.status.as_ref().unwrap();
                status.ufs_total.as_deref() == Some("387.17KiB")
                    && status.file_num.as_deref() == Some("42")
            })
            .times(1)
            .returning(|_| Ok(()));

        let engine = engine_with(
            store,
            MockPodExecutor::new(),
            MockHelmDriver::new(),
            MockPortAllocator::new(),
        );
        let (tx, rx) = oneshot::channel();
        *engine.metadata_sync_rx.lock().await = Some(rx);
        tx.send(MetadataSyncResult {
            done: true,
            start_time: Utc::now(),
            ufs_total: "387.17KiB".to_string(),
            file_num: "42".to_string(),
            err: None,
        })
        .unwrap();

        engine.sync_metadata().await.unwrap();
        assert!(engine.metadata_sync_rx.lock().await.is_none());
    }

    #[tokio::test]
    async fn received_failure_surfaces_once_then_resets_to_idle() {
        let engine = bare_engine();
        let (tx, rx) = oneshot::channel();
        *engine.metadata_sync_rx.lock().await = Some(rx);
        tx.send(MetadataSyncResult {
            done: false,
            start_time: Utc::now(),
            ufs_total: String::new(),
            file_num: String::new(),
            err: Some("du failed".to_string()),
        })
        .unwrap();

        let err = engine.sync_metadata().await.unwrap_err();
        assert!(err.to_string().contains("du failed"));
        assert!(engine.metadata_sync_rx.lock().await.is_none());
    }

    #[tokio::test]
    async fn idle_engine_marks_calculating_and_starts_one_task() {
        let mut store = MockResourceStore::new();
        store
            .expect_get_dataset()
            .returning(|_, _| Ok(dataset_with_total(None)));
        store
            .expect_update_dataset_status()
            .withf(|d| {
                d.status.as_ref().unwrap().ufs_total.as_deref() == Some("[Calculating]")
            })
            .times(1)
            .returning(|_| Ok(()));
        // the background task finds no ready pods and reports failure
        store.expect_list_ready_pods().returning(|_, _| Ok(vec![]));

        let engine = engine_with(
            store,
            MockPodExecutor::new(),
            MockHelmDriver::new(),
            MockPortAllocator::new(),
        );
        engine.sync_metadata().await.unwrap();
        assert!(engine.metadata_sync_rx.lock().await.is_some());

        // next pass receives the task's failure and resets to idle
        let err = engine.sync_metadata().await.unwrap_err();
        assert!(err.to_string().contains("no ready worker pod"));
        assert!(engine.metadata_sync_rx.lock().await.is_none());
    }

    #[tokio::test]
    async fn full_cycle_measures_through_a_worker_pod() {
        let mut store = MockResourceStore::new();
        store
            .expect_get_dataset()
            .returning(|_, _| Ok(dataset_with_total(None)));
        store
            .expect_list_ready_pods()
            .returning(|_, _| Ok(vec![worker_pod()]));
        store
            .expect_update_dataset_status()
            .times(2)
            .returning(|_| Ok(()));

        let mut exec = MockPodExecutor::new();
        exec.expect_exec().returning(|_, pod, container, command| {
            assert_eq!(pod, "demo-worker-0");
            assert_eq!(container, "cachefs-worker");
            match command[0].as_str() {
                "du" => Ok(("396462\t/runtime-mnt/cachefs/big-data/demo".to_string(), String::new())),
                _ => Ok(("42\n".to_string(), String::new())),
            }
        });

        let engine = engine_with(
            store,
            exec,
            MockHelmDriver::new(),
            MockPortAllocator::new(),
        );
        engine.sync_metadata().await.unwrap();
        // second pass collects and persists the published result
        engine.sync_metadata().await.unwrap();
        assert!(engine.metadata_sync_rx.lock().await.is_none());
    }
}
