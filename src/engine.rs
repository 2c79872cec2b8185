//! The per-runtime reconciliation engine.
//!
//! One [`Engine`] exists per CacheFsRuntime instance. The orchestration
//! platform drives it through four entry points, each implemented in its own
//! module:
//!
//! - [`Engine::transform`] — desired-state computation (`transform`)
//! - [`Engine::sync_runtime`] — live-object diff and patch (`sync`)
//! - [`Engine::sync_metadata`] — background dataset sizing (`metadata`)
//! - [`Engine::shutdown`] — ordered teardown (`teardown`)
//!
//! The reconciliation loop for one runtime never overlaps itself; the only
//! concurrency inside the engine is the metadata coordinator's single
//! background task.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};

use crate::metadata::MetadataSyncResult;
use crate::store::{HelmDriver, PodExecutor, PortAllocator, ResourceStore};
use crate::transform::RuntimeValue;
use crate::{
    Result, DEFAULT_GRACEFUL_SHUTDOWN_LIMITS, FUSE_POD_ROLE, MOUNT_ROOT, POD_APP_LABEL,
    POD_ROLE_LABEL, RUNTIME_TYPE, VALUES_CONFIGMAP_KEY, WORKER_POD_ROLE,
};

/// Reconciliation engine for one CacheFsRuntime/Dataset pair
pub struct Engine {
    pub(crate) name: String,
    pub(crate) namespace: String,
    pub(crate) runtime_type: String,
    pub(crate) store: Arc<dyn ResourceStore>,
    pub(crate) exec: Arc<dyn PodExecutor>,
    pub(crate) helm: Arc<dyn HelmDriver>,
    pub(crate) ports: Arc<dyn PortAllocator>,

    /// Cache-eviction retry budget before teardown proceeds unconditionally
    pub(crate) graceful_shutdown_limits: u32,
    /// Failed cache-eviction attempts so far
    pub(crate) retry_shutdown: AtomicU32,

    /// Held receiver for an in-flight metadata sync, at most one per runtime
    pub(crate) metadata_sync_rx: Mutex<Option<oneshot::Receiver<MetadataSyncResult>>>,
}

impl Engine {
    /// Create an engine bound to the runtime identified by namespace/name
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        store: Arc<dyn ResourceStore>,
        exec: Arc<dyn PodExecutor>,
        helm: Arc<dyn HelmDriver>,
        ports: Arc<dyn PortAllocator>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            runtime_type: RUNTIME_TYPE.to_string(),
            store,
            exec,
            helm,
            ports,
            graceful_shutdown_limits: DEFAULT_GRACEFUL_SHUTDOWN_LIMITS,
            retry_shutdown: AtomicU32::new(0),
            metadata_sync_rx: Mutex::new(None),
        }
    }

    /// Override the cache-eviction retry cap
    pub fn with_graceful_shutdown_limits(mut self, limits: u32) -> Self {
        self.graceful_shutdown_limits = limits;
        self
    }

    /// Runtime name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runtime namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Worker StatefulSet name
    pub(crate) fn worker_name(&self) -> String {
        format!("{}-worker", self.name)
    }

    /// Fuse DaemonSet name
    pub(crate) fn fuse_name(&self) -> String {
        format!("{}-fuse", self.name)
    }

    /// ConfigMap holding the serialized desired-state value file
    pub(crate) fn values_configmap_name(&self) -> String {
        format!("{}-{}-values", self.name, self.runtime_type)
    }

    /// ConfigMap holding general runtime configuration
    pub(crate) fn config_configmap_name(&self) -> String {
        format!("{}-config", self.name)
    }

    /// ConfigMap holding the worker mount script
    pub(crate) fn worker_script_name(&self) -> String {
        format!("{}-worker-script", self.name)
    }

    /// ConfigMap holding the fuse mount script
    pub(crate) fn fuse_script_name(&self) -> String {
        format!("{}-fuse-script", self.name)
    }

    /// In-container mount path for both components
    pub(crate) fn mount_point(&self) -> String {
        format!(
            "{}/{}/{}/cachefs-fuse",
            MOUNT_ROOT, self.namespace, self.name
        )
    }

    /// Host-side bind path exposed to application pods
    pub(crate) fn host_mount_point(&self) -> String {
        format!("{}/{}/{}", MOUNT_ROOT, self.namespace, self.name)
    }

    /// Node label set by the CSI plugin where fuse must run
    pub(crate) fn fuse_label_name(&self) -> String {
        format!("cachefs.io/f-{}-{}", self.namespace, self.name)
    }

    /// Node label marking cache placement for this dataset
    pub(crate) fn common_label_name(&self) -> String {
        format!("cachefs.io/s-{}-{}", self.namespace, self.name)
    }

    /// Node label marking this specific runtime's workers
    pub(crate) fn runtime_label_name(&self) -> String {
        format!(
            "cachefs.io/s-{}-{}-{}",
            self.runtime_type, self.namespace, self.name
        )
    }

    /// Per-medium cache byte-count bookkeeping labels
    pub(crate) fn storage_label_names(&self) -> Vec<String> {
        ["m", "d", "t"]
            .iter()
            .map(|kind| {
                format!(
                    "cachefs.io/s-{}-{}-{}-{}",
                    kind, self.runtime_type, self.namespace, self.name
                )
            })
            .collect()
    }

    /// Key of the node label claiming exclusive placement
    pub(crate) fn exclusive_label_key(&self) -> &'static str {
        "cachefs.io/exclusive"
    }

    /// Value of the exclusive placement label owned by this runtime
    pub(crate) fn exclusive_label_value(&self) -> String {
        format!("{}-{}", self.namespace, self.name)
    }

    /// Label selector matching this runtime's worker pods
    pub(crate) fn worker_selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (POD_APP_LABEL.to_string(), self.name.clone()),
            (POD_ROLE_LABEL.to_string(), WORKER_POD_ROLE.to_string()),
        ])
    }

    /// Label selector matching this runtime's fuse pods
    pub(crate) fn fuse_selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (POD_APP_LABEL.to_string(), self.name.clone()),
            (POD_ROLE_LABEL.to_string(), FUSE_POD_ROLE.to_string()),
        ])
    }

    /// Load the last-saved value file from the values ConfigMap. Absence of
    /// the ConfigMap or its payload key is `Ok(None)`.
    pub(crate) async fn load_runtime_value(&self) -> Result<Option<RuntimeValue>> {
        let Some(cm) = self
            .store
            .get_configmap(&self.namespace, &self.values_configmap_name())
            .await?
        else {
            return Ok(None);
        };
        match cm.data.as_ref().and_then(|d| d.get(VALUES_CONFIGMAP_KEY)) {
            Some(yaml) => Ok(Some(RuntimeValue::from_yaml(yaml)?)),
            None => Ok(None),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::bare_engine;

    #[test]
    fn object_names_follow_the_naming_convention() {
        let engine = bare_engine();
        assert_eq!(engine.worker_name(), "demo-worker");
        assert_eq!(engine.fuse_name(), "demo-fuse");
        assert_eq!(engine.values_configmap_name(), "demo-cachefs-values");
        assert_eq!(engine.config_configmap_name(), "demo-config");
        assert_eq!(engine.worker_script_name(), "demo-worker-script");
        assert_eq!(engine.fuse_script_name(), "demo-fuse-script");
    }

    #[test]
    fn mount_points_nest_namespace_and_name() {
        let engine = bare_engine();
        assert_eq!(
            engine.mount_point(),
            "/runtime-mnt/cachefs/big-data/demo/cachefs-fuse"
        );
        assert_eq!(engine.host_mount_point(), "/runtime-mnt/cachefs/big-data/demo");
    }

    #[test]
    fn node_labels_embed_runtime_identity() {
        let engine = bare_engine();
        assert_eq!(engine.common_label_name(), "cachefs.io/s-big-data-demo");
        assert_eq!(
            engine.runtime_label_name(),
            "cachefs.io/s-cachefs-big-data-demo"
        );
        assert_eq!(engine.exclusive_label_value(), "big-data-demo");
        assert_eq!(engine.storage_label_names().len(), 3);
    }
}
