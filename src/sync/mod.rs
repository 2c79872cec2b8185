//! The Spec Syncer: field-level reconciliation of the live worker
//! StatefulSet and fuse DaemonSet against freshly transformed desired state.
//!
//! Sync never fails on "no drift" and is idempotent: two consecutive passes
//! with unchanged inputs both report `false`. All merges are unions; an
//! unrelated live entry is never deleted. The mount command is special: pods
//! read it from a script ConfigMap only at (re)start, so a command-only
//! change updates the script and forces a rollout annotation bump instead of
//! a silent no-op.

mod diff;

pub(crate) use diff::command_option_map;

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use tracing::{info, instrument, warn};

use crate::crd::CacheFsRuntime;
use crate::engine::Engine;
use crate::retry::retry_on_conflict;
use crate::transform::RuntimeValue;
use crate::{Result, FUSE_GENERATION_LABEL, RESTARTED_AT_ANNOTATION, SCRIPT_CHECK_KEY,
    SCRIPT_MOUNT_KEY, VALUES_CONFIGMAP_KEY};

use diff::{commands_equal_ignoring_metrics, merge_pod_template};

impl Engine {
    /// Reconcile live objects against the runtime's desired state.
    ///
    /// Returns whether anything was written. Legacy runtimes (missing values
    /// ConfigMap, or a worker StatefulSet that predates the OnDelete rollout
    /// strategy) degrade to `Ok(false)` without structural updates.
    #[instrument(skip_all, fields(runtime = %self.name, namespace = %self.namespace))]
    pub async fn sync_runtime(&self, runtime: &CacheFsRuntime) -> Result<bool> {
        let desired = self.transform(runtime).await?;

        let values_name = self.values_configmap_name();
        let Some(values_cm) = self
            .store
            .get_configmap(&self.namespace, &values_name)
            .await?
        else {
            warn!(
                runtime = %self.name,
                namespace = %self.namespace,
                "Values ConfigMap missing, skipping sync for legacy runtime"
            );
            return Ok(false);
        };
        let old_yaml = values_cm
            .data
            .as_ref()
            .and_then(|d| d.get(VALUES_CONFIGMAP_KEY).cloned());

        let sts = self
            .store
            .get_statefulset(&self.namespace, &self.worker_name())
            .await?;
        if !worker_uses_on_delete(&sts) {
            warn!(
                runtime = %self.name,
                "Worker StatefulSet predates the OnDelete rollout strategy, \
                 skipping structural sync"
            );
            return Ok(false);
        }

        let mut changed = false;
        changed |= self.sync_worker_spec(&desired).await?;
        changed |= self.sync_fuse_spec(&desired).await?;

        let desired_yaml = desired.to_yaml()?;
        if old_yaml.as_deref() != Some(desired_yaml.as_str()) {
            self.save_runtime_value(&desired_yaml).await?;
            changed = true;
        }

        if changed {
            info!(runtime = %self.name, namespace = %self.namespace, "Runtime spec synced");
        }
        Ok(changed)
    }

    async fn sync_worker_spec(&self, desired: &RuntimeValue) -> Result<bool> {
        let command_changed = self
            .sync_mount_script(
                &self.worker_script_name(),
                &desired.worker.command,
                &desired.worker.stat_cmd,
            )
            .await?;
        let image = desired.component_image(&desired.worker);

        retry_on_conflict("sync worker spec", || async {
            let mut sts = self
                .store
                .get_statefulset(&self.namespace, &self.worker_name())
                .await?;
            let spec = sts.spec.get_or_insert_with(Default::default);
            let mut changed = merge_pod_template(&mut spec.template, &desired.worker, &image);
            if command_changed {
                annotate_restart(&mut spec.template);
                changed = true;
            }
            if changed {
                self.store.update_statefulset(&sts).await?;
            }
            Ok(changed)
        })
        .await
    }

    async fn sync_fuse_spec(&self, desired: &RuntimeValue) -> Result<bool> {
        let command_changed = self
            .sync_mount_script(
                &self.fuse_script_name(),
                &desired.fuse.component.command,
                &desired.fuse.component.stat_cmd,
            )
            .await?;
        let image = desired.component_image(&desired.fuse.component);

        let (changed, generation) = retry_on_conflict("sync fuse spec", || async {
            let mut ds = self
                .store
                .get_daemonset(&self.namespace, &self.fuse_name())
                .await?;
            let spec = ds.spec.get_or_insert_with(Default::default);
            let mut changed =
                merge_pod_template(&mut spec.template, &desired.fuse.component, &image);
            let mut generation = None;
            if command_changed {
                generation = Some(bump_fuse_generation(&mut spec.template));
                annotate_restart(&mut spec.template);
                changed = true;
            }
            if changed {
                self.store.update_daemonset(&ds).await?;
            }
            Ok((changed, generation))
        })
        .await?;

        // dependent consumers watch the claim for fuse refreshes
        if let Some(generation) = generation {
            retry_on_conflict("propagate fuse generation", || async {
                let mut pvc = self
                    .store
                    .get_persistent_volume_claim(&self.namespace, &self.name)
                    .await?;
                let labels = pvc.metadata.labels.get_or_insert_with(BTreeMap::new);
                let value = generation.to_string();
                if labels.get(FUSE_GENERATION_LABEL) == Some(&value) {
                    return Ok(());
                }
                labels.insert(FUSE_GENERATION_LABEL.to_string(), value);
                self.store.update_persistent_volume_claim(&pvc).await
            })
            .await?;
        }

        Ok(changed)
    }

    /// Bring one component's script ConfigMap up to date with the desired
    /// mount and probe commands. Returns whether the script changed; the
    /// metrics endpoint option is ignored when comparing mount commands.
    async fn sync_mount_script(
        &self,
        script_name: &str,
        command: &str,
        stat_cmd: &str,
    ) -> Result<bool> {
        retry_on_conflict("sync mount script", || async {
            let Some(mut cm) = self.store.get_configmap(&self.namespace, script_name).await?
            else {
                warn!(
                    configmap = script_name,
                    "Script ConfigMap missing, skipping command sync for legacy runtime"
                );
                return Ok(false);
            };
            let data = cm.data.get_or_insert_with(BTreeMap::new);
            let live_command = data.get(SCRIPT_MOUNT_KEY).map(String::as_str).unwrap_or("");
            let live_check = data.get(SCRIPT_CHECK_KEY).map(String::as_str).unwrap_or("");
            if commands_equal_ignoring_metrics(live_command, command) && live_check == stat_cmd {
                return Ok(false);
            }

            info!(configmap = script_name, "Mount command changed, updating script");
            data.insert(SCRIPT_MOUNT_KEY.to_string(), command.to_string());
            data.insert(SCRIPT_CHECK_KEY.to_string(), stat_cmd.to_string());
            self.store.update_configmap(&cm).await?;
            Ok(true)
        })
        .await
    }

    /// Persist the freshly transformed value file as the new baseline.
    async fn save_runtime_value(&self, yaml: &str) -> Result<()> {
        retry_on_conflict("save runtime value", || async {
            let Some(mut cm) = self
                .store
                .get_configmap(&self.namespace, &self.values_configmap_name())
                .await?
            else {
                return Ok(());
            };
            cm.data
                .get_or_insert_with(BTreeMap::new)
                .insert(VALUES_CONFIGMAP_KEY.to_string(), yaml.to_string());
            self.store.update_configmap(&cm).await
        })
        .await
    }
}

fn worker_uses_on_delete(sts: &StatefulSet) -> bool {
    sts.spec
        .as_ref()
        .and_then(|s| s.update_strategy.as_ref())
        .and_then(|s| s.type_.as_deref())
        == Some("OnDelete")
}

fn annotate_restart(template: &mut PodTemplateSpec) {
    template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(
            RESTARTED_AT_ANNOTATION.to_string(),
            chrono::Utc::now().to_rfc3339(),
        );
}

/// Increment the fuse generation label, starting from zero when absent.
fn bump_fuse_generation(template: &mut PodTemplateSpec) -> u64 {
    let labels = template
        .metadata
        .get_or_insert_with(Default::default)
        .labels
        .get_or_insert_with(BTreeMap::new);
    let next = labels
        .get(FUSE_GENERATION_LABEL)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    labels.insert(FUSE_GENERATION_LABEL.to_string(), next.to_string());
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        CacheFsRuntimeSpec, Dataset, DatasetSpec, EncryptOption, EncryptOptionSource, Level,
        MediumType, Mount, SecretKeySelector, TieredStore,
    };
    use crate::engine::test_support::engine_with;
    use crate::store::{MockHelmDriver, MockPodExecutor, MockPortAllocator, MockResourceStore};
    use crate::transform::ComponentValue;
    use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, StatefulSetSpec, StatefulSetUpdateStrategy};
    use k8s_openapi::api::core::v1::{
        ConfigMap, Container, PersistentVolumeClaim, PodSpec, ResourceRequirements, Secret,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::ByteString;

    fn community_dataset() -> Dataset {
        Dataset::new(
            "demo",
            DatasetSpec {
                mounts: vec![Mount {
                    name: "demo".to_string(),
                    mount_point: "cachefs:///demo".to_string(),
                    encrypt_options: vec![EncryptOption {
                        name: "metaurl".to_string(),
                        value_from: EncryptOptionSource {
                            secret_key_ref: SecretKeySelector {
                                name: "cfs-secret".to_string(),
                                key: "metaurl".to_string(),
                            },
                        },
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
    }

    fn runtime() -> CacheFsRuntime {
        let mut runtime = CacheFsRuntime::new(
            "demo",
            CacheFsRuntimeSpec {
                tiered_store: TieredStore {
                    levels: vec![Level {
                        medium_type: MediumType::Mem,
                        quota: Some(Quantity("2Gi".to_string())),
                        ..Default::default()
                    }],
                },
                ..Default::default()
            },
        );
        let generous = ResourceRequirements {
            requests: Some(BTreeMap::from([(
                "memory".to_string(),
                Quantity("4Gi".to_string()),
            )])),
            ..Default::default()
        };
        runtime.spec.worker.resources = Some(generous.clone());
        runtime.spec.fuse.resources = Some(generous);
        runtime
    }

    fn secret() -> Secret {
        Secret {
            data: Some(BTreeMap::from([(
                "metaurl".to_string(),
                ByteString(b"redis://cfs:6379/1".to_vec()),
            )])),
            ..Default::default()
        }
    }

    async fn desired_value() -> RuntimeValue {
        let mut store = MockResourceStore::new();
        let dataset = community_dataset();
        store
            .expect_get_dataset()
            .returning(move |_, _| Ok(dataset.clone()));
        store
            .expect_get_secret()
            .returning(|_, _| Ok(Some(secret())));
        let engine = engine_with(
            store,
            MockPodExecutor::new(),
            MockHelmDriver::new(),
            MockPortAllocator::new(),
        );
        engine.transform(&runtime()).await.unwrap()
    }

    fn matching_template(component: &ComponentValue, image: &str, container: &str) -> PodTemplateSpec {
        let mut template = PodTemplateSpec {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: container.to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        merge_pod_template(&mut template, component, image);
        template
    }

    fn live_statefulset(value: &RuntimeValue) -> StatefulSet {
        StatefulSet {
            spec: Some(StatefulSetSpec {
                update_strategy: Some(StatefulSetUpdateStrategy {
                    type_: Some("OnDelete".to_string()),
                    ..Default::default()
                }),
                template: matching_template(
                    &value.worker,
                    &value.component_image(&value.worker),
                    "cachefs-worker",
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn live_daemonset(value: &RuntimeValue) -> DaemonSet {
        DaemonSet {
            spec: Some(DaemonSetSpec {
                template: matching_template(
                    &value.fuse.component,
                    &value.component_image(&value.fuse.component),
                    "cachefs-fuse",
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn script_cm(command: &str, stat_cmd: &str) -> ConfigMap {
        ConfigMap {
            data: Some(BTreeMap::from([
                (SCRIPT_MOUNT_KEY.to_string(), command.to_string()),
                (SCRIPT_CHECK_KEY.to_string(), stat_cmd.to_string()),
            ])),
            ..Default::default()
        }
    }

    fn values_cm(yaml: &str) -> ConfigMap {
        ConfigMap {
            data: Some(BTreeMap::from([(
                VALUES_CONFIGMAP_KEY.to_string(),
                yaml.to_string(),
            )])),
            ..Default::default()
        }
    }

    /// Store wired with explicit live objects; reads repeat freely, writes
    /// are left for the test to expect.
    fn store_with(
        value: &RuntimeValue,
        sts: StatefulSet,
        worker_script: ConfigMap,
        fuse_script: ConfigMap,
    ) -> MockResourceStore {
        let mut store = MockResourceStore::new();
        let dataset = community_dataset();
        store
            .expect_get_dataset()
            .returning(move |_, _| Ok(dataset.clone()));
        store
            .expect_get_secret()
            .returning(|_, _| Ok(Some(secret())));

        let yaml = value.to_yaml().unwrap();
        store.expect_get_configmap().returning(move |_, name| {
            Ok(match name {
                "demo-cachefs-values" => Some(values_cm(&yaml)),
                "demo-worker-script" => Some(worker_script.clone()),
                "demo-fuse-script" => Some(fuse_script.clone()),
                _ => None,
            })
        });

        store
            .expect_get_statefulset()
            .returning(move |_, _| Ok(sts.clone()));
        let ds = live_daemonset(value);
        store
            .expect_get_daemonset()
            .returning(move |_, _| Ok(ds.clone()));
        store
    }

    /// Store where every live object already matches `value`.
    fn settled_store(value: &RuntimeValue) -> MockResourceStore {
        store_with(
            value,
            live_statefulset(value),
            script_cm(&value.worker.command, &value.worker.stat_cmd),
            script_cm(&value.fuse.component.command, &value.fuse.component.stat_cmd),
        )
    }

    fn engine(store: MockResourceStore) -> Engine {
        engine_with(
            store,
            MockPodExecutor::new(),
            MockHelmDriver::new(),
            MockPortAllocator::new(),
        )
    }

    #[tokio::test]
    async fn sync_is_idempotent_when_live_matches_desired() {
        let value = desired_value().await;
        let e = engine(settled_store(&value));

        assert!(!e.sync_runtime(&runtime()).await.unwrap());
        assert!(!e.sync_runtime(&runtime()).await.unwrap());
    }

    #[tokio::test]
    async fn host_network_sync_settles_without_reallocating_ports() {
        let mut rt = runtime();
        rt.spec.worker.network_mode = crate::crd::NetworkMode::HostNetwork;

        // first transform allocates the port that the values ConfigMap records
        let mut store = MockResourceStore::new();
        let dataset = community_dataset();
        store
            .expect_get_dataset()
            .returning(move |_, _| Ok(dataset.clone()));
        store
            .expect_get_secret()
            .returning(|_, _| Ok(Some(secret())));
        store.expect_get_configmap().returning(|_, _| Ok(None));
        let mut ports = MockPortAllocator::new();
        ports
            .expect_reserve_ports()
            .times(1)
            .returning(|_| Ok(vec![14001]));
        let seed = engine_with(store, MockPodExecutor::new(), MockHelmDriver::new(), ports);
        let value = seed.transform(&rt).await.unwrap();
        assert_eq!(value.worker.metrics_port, Some(14001));

        // settled cluster: both syncs must report no drift, and the port
        // allocator must never be consulted again (the mock panics if it is)
        let e = engine(settled_store(&value));
        assert!(!e.sync_runtime(&rt).await.unwrap());
        assert!(!e.sync_runtime(&rt).await.unwrap());
    }

    #[tokio::test]
    async fn image_drift_updates_the_worker_statefulset() {
        let value = desired_value().await;

        let mut stale = live_statefulset(&value);
        stale
            .spec
            .as_mut()
            .unwrap()
            .template
            .spec
            .as_mut()
            .unwrap()
            .containers[0]
            .image = Some("cachefs/cachefs-fuse:v1.1.0".to_string());

        let mut store = store_with(
            &value,
            stale,
            script_cm(&value.worker.command, &value.worker.stat_cmd),
            script_cm(&value.fuse.component.command, &value.fuse.component.stat_cmd),
        );
        store
            .expect_update_statefulset()
            .withf(|sts| {
                sts.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
                    .image
                    .as_deref()
                    == Some("cachefs/cachefs-fuse:v1.2.0")
            })
            .times(1)
            .returning(|_| Ok(()));

        assert!(engine(store).sync_runtime(&runtime()).await.unwrap());
    }

    #[tokio::test]
    async fn command_drift_rewrites_the_script_and_bumps_the_rollout() {
        let value = desired_value().await;

        // stale worker script with a different cache size
        let stale_command = value.worker.command.replace("cache-size=2048", "cache-size=1024");
        let mut store = store_with(
            &value,
            live_statefulset(&value),
            script_cm(&stale_command, &value.worker.stat_cmd),
            script_cm(&value.fuse.component.command, &value.fuse.component.stat_cmd),
        );

        let expected = value.worker.command.clone();
        store
            .expect_update_configmap()
            .withf(move |cm| {
                cm.data.as_ref().unwrap().get(SCRIPT_MOUNT_KEY) == Some(&expected)
            })
            .times(1)
            .returning(|_| Ok(()));
        store
            .expect_update_statefulset()
            .withf(|sts| {
                sts.spec
                    .as_ref()
                    .unwrap()
                    .template
                    .metadata
                    .as_ref()
                    .and_then(|m| m.annotations.as_ref())
                    .map(|a| a.contains_key(RESTARTED_AT_ANNOTATION))
                    .unwrap_or(false)
            })
            .times(1)
            .returning(|_| Ok(()));

        assert!(engine(store).sync_runtime(&runtime()).await.unwrap());
    }

    #[tokio::test]
    async fn fuse_command_drift_increments_generation_and_labels_the_claim() {
        let value = desired_value().await;
        let stale_fuse = value
            .fuse
            .component
            .command
            .replace("cache-size=2048", "cache-size=512");
        let mut store = store_with(
            &value,
            live_statefulset(&value),
            script_cm(&value.worker.command, &value.worker.stat_cmd),
            script_cm(&stale_fuse, &value.fuse.component.stat_cmd),
        );

        store.expect_update_configmap().times(1).returning(|_| Ok(()));
        store
            .expect_update_daemonset()
            .withf(|ds| {
                ds.spec
                    .as_ref()
                    .unwrap()
                    .template
                    .metadata
                    .as_ref()
                    .and_then(|m| m.labels.as_ref())
                    .and_then(|l| l.get(FUSE_GENERATION_LABEL))
                    == Some(&"1".to_string())
            })
            .times(1)
            .returning(|_| Ok(()));
        store
            .expect_get_persistent_volume_claim()
            .returning(|_, _| Ok(PersistentVolumeClaim::default()));
        store
            .expect_update_persistent_volume_claim()
            .withf(|pvc| {
                pvc.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(FUSE_GENERATION_LABEL))
                    == Some(&"1".to_string())
            })
            .times(1)
            .returning(|_| Ok(()));

        assert!(engine(store).sync_runtime(&runtime()).await.unwrap());
    }

    #[tokio::test]
    async fn legacy_worker_strategy_degrades_to_no_change() {
        let value = desired_value().await;
        let yaml = value.to_yaml().unwrap();

        let mut store = MockResourceStore::new();
        let dataset = community_dataset();
        store
            .expect_get_dataset()
            .returning(move |_, _| Ok(dataset.clone()));
        store
            .expect_get_secret()
            .returning(|_, _| Ok(Some(secret())));
        store.expect_get_configmap().returning(move |_, name| {
            Ok(match name {
                "demo-cachefs-values" => Some(values_cm(&yaml)),
                _ => None,
            })
        });
        // RollingUpdate predates the managed rollout scheme
        store.expect_get_statefulset().returning(|_, _| {
            Ok(StatefulSet {
                spec: Some(StatefulSetSpec {
                    update_strategy: Some(StatefulSetUpdateStrategy {
                        type_: Some("RollingUpdate".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            })
        });

        assert!(!engine(store).sync_runtime(&runtime()).await.unwrap());
    }

    #[tokio::test]
    async fn missing_values_configmap_degrades_to_no_change() {
        let mut store = MockResourceStore::new();
        let dataset = community_dataset();
        store
            .expect_get_dataset()
            .returning(move |_, _| Ok(dataset.clone()));
        store
            .expect_get_secret()
            .returning(|_, _| Ok(Some(secret())));
        store.expect_get_configmap().returning(|_, _| Ok(None));

        assert!(!engine(store).sync_runtime(&runtime()).await.unwrap());
    }
}
