//! Collaborator interfaces: cluster resource store, exec-in-pod, release
//! management and port allocation.
//!
//! The reconciliation engine only ever talks to the cluster through these
//! traits. The real implementations are thin wrappers over `kube`; tests
//! substitute mocks. Watch-driven re-invocation, chart templating and
//! volume-provisioning glue live outside this crate.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Node, PersistentVolumeClaim, Pod, Secret};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::Resource;
use kube::Client;

#[cfg(test)]
use mockall::automock;

use crate::crd::{CacheFsRuntime, Dataset};
use crate::{Error, Result};

/// Typed access to the cluster objects this engine reads and mutates.
///
/// Mutating methods perform a single conditional write; conflict retries are
/// the caller's job (see [`crate::retry::retry_on_conflict`]).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Get a CacheFsRuntime by namespace/name
    async fn get_runtime(&self, namespace: &str, name: &str) -> Result<CacheFsRuntime>;

    /// Conditionally write a runtime's spec (resource-version checked)
    async fn update_runtime(&self, runtime: &CacheFsRuntime) -> Result<()>;

    /// Conditionally write a runtime's status sub-resource
    async fn update_runtime_status(&self, runtime: &CacheFsRuntime) -> Result<()>;

    /// Get a Dataset by namespace/name
    async fn get_dataset(&self, namespace: &str, name: &str) -> Result<Dataset>;

    /// Conditionally write a dataset's status sub-resource
    async fn update_dataset_status(&self, dataset: &Dataset) -> Result<()>;

    /// Get the worker StatefulSet
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<StatefulSet>;

    /// Conditionally write the worker StatefulSet
    async fn update_statefulset(&self, sts: &StatefulSet) -> Result<()>;

    /// Get the fuse DaemonSet
    async fn get_daemonset(&self, namespace: &str, name: &str) -> Result<DaemonSet>;

    /// Conditionally write the fuse DaemonSet
    async fn update_daemonset(&self, ds: &DaemonSet) -> Result<()>;

    /// Get a ConfigMap; absence is `Ok(None)`, never an error
    async fn get_configmap(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// Conditionally write a ConfigMap
    async fn update_configmap(&self, cm: &ConfigMap) -> Result<()>;

    /// Delete a ConfigMap, tolerating absence
    async fn delete_configmap(&self, namespace: &str, name: &str) -> Result<()>;

    /// Get the runtime's PersistentVolumeClaim
    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim>;

    /// Conditionally write the runtime's PersistentVolumeClaim
    async fn update_persistent_volume_claim(&self, pvc: &PersistentVolumeClaim) -> Result<()>;

    /// Get a Secret; absence is `Ok(None)`
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// List ready pods matching the given label selector
    async fn list_ready_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>>;

    /// List nodes matching a label selector expression (`key=value`)
    async fn list_nodes(&self, selector: &str) -> Result<Vec<Node>>;

    /// Get a node by name
    async fn get_node(&self, name: &str) -> Result<Node>;

    /// Conditionally write a node (label bookkeeping)
    async fn update_node(&self, node: &Node) -> Result<()>;

    /// Delete a ServiceAccount, tolerating absence
    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<()>;

    /// Delete a Role, tolerating absence
    async fn delete_role(&self, namespace: &str, name: &str) -> Result<()>;

    /// Delete a RoleBinding, tolerating absence
    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Exec-in-pod primitive returning (stdout, stderr)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodExecutor: Send + Sync {
    /// Run a command vector inside the given container
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<(String, String)>;
}

/// Release install/uninstall primitive keyed by (name, namespace)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HelmDriver: Send + Sync {
    /// Whether a release with this name exists in the namespace
    async fn check_release(&self, name: &str, namespace: &str) -> Result<bool>;

    /// Uninstall the release
    async fn delete_release(&self, name: &str, namespace: &str) -> Result<()>;
}

/// Reserve/release over the operator's configured node-port range
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PortAllocator: Send + Sync {
    /// Reserve `count` ports for host-network metrics endpoints
    async fn reserve_ports(&self, count: usize) -> Result<Vec<i32>>;

    /// Return previously reserved ports to the pool
    async fn release_ports(&self, ports: Vec<i32>) -> Result<()>;
}

/// [`ResourceStore`] backed by a live `kube` client
#[derive(Clone)]
pub struct KubeResourceStore {
    client: Client,
}

impl KubeResourceStore {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = kube::core::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn name_of<K: Resource>(obj: &K) -> Result<String> {
        obj.meta()
            .name
            .clone()
            .ok_or_else(|| Error::validation("object has no name"))
    }

    fn namespace_of<K: Resource>(obj: &K) -> Result<String> {
        obj.meta()
            .namespace
            .clone()
            .ok_or_else(|| Error::validation("object has no namespace"))
    }

    async fn replace<K>(&self, obj: &K) -> Result<()>
    where
        K: Resource<Scope = kube::core::NamespaceResourceScope>
            + Clone
            + serde::Serialize
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.api(&Self::namespace_of(obj)?);
        api.replace(&Self::name_of(obj)?, &PostParams::default(), obj)
            .await?;
        Ok(())
    }

    async fn replace_status<K>(&self, obj: &K) -> Result<()>
    where
        K: Resource<Scope = kube::core::NamespaceResourceScope>
            + Clone
            + serde::Serialize
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.api(&Self::namespace_of(obj)?);
        let data = serde_json::to_vec(obj).map_err(|e| Error::serialization(e.to_string()))?;
        api.replace_status(&Self::name_of(obj)?, &PostParams::default(), data)
            .await?;
        Ok(())
    }

    async fn get_optional<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = kube::core::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.api(namespace);
        match api.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_tolerant<K>(&self, namespace: &str, name: &str) -> Result<()>
    where
        K: Resource<Scope = kube::core::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.api(namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn get_runtime(&self, namespace: &str, name: &str) -> Result<CacheFsRuntime> {
        Ok(self.api::<CacheFsRuntime>(namespace).get(name).await?)
    }

    async fn update_runtime(&self, runtime: &CacheFsRuntime) -> Result<()> {
        self.replace(runtime).await
    }

    async fn update_runtime_status(&self, runtime: &CacheFsRuntime) -> Result<()> {
        self.replace_status(runtime).await
    }

    async fn get_dataset(&self, namespace: &str, name: &str) -> Result<Dataset> {
        Ok(self.api::<Dataset>(namespace).get(name).await?)
    }

    async fn update_dataset_status(&self, dataset: &Dataset) -> Result<()> {
        self.replace_status(dataset).await
    }

    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<StatefulSet> {
        Ok(self.api::<StatefulSet>(namespace).get(name).await?)
    }

    async fn update_statefulset(&self, sts: &StatefulSet) -> Result<()> {
        self.replace(sts).await
    }

    async fn get_daemonset(&self, namespace: &str, name: &str) -> Result<DaemonSet> {
        Ok(self.api::<DaemonSet>(namespace).get(name).await?)
    }

    async fn update_daemonset(&self, ds: &DaemonSet) -> Result<()> {
        self.replace(ds).await
    }

    async fn get_configmap(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        self.get_optional(namespace, name).await
    }

    async fn update_configmap(&self, cm: &ConfigMap) -> Result<()> {
        self.replace(cm).await
    }

    async fn delete_configmap(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_tolerant::<ConfigMap>(namespace, name).await
    }

    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim> {
        Ok(self
            .api::<PersistentVolumeClaim>(namespace)
            .get(name)
            .await?)
    }

    async fn update_persistent_volume_claim(&self, pvc: &PersistentVolumeClaim) -> Result<()> {
        self.replace(pvc).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.get_optional(namespace, name).await
    }

    async fn list_ready_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        let label_selector = selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let api: Api<Pod> = self.api(namespace);
        let pods = api
            .list(&ListParams::default().labels(&label_selector))
            .await?;
        Ok(pods.items.into_iter().filter(pod_is_ready).collect())
    }

    async fn list_nodes(&self, selector: &str) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default().labels(selector)).await?;
        Ok(nodes.items)
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    async fn update_node(&self, node: &Node) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.replace(&Self::name_of(node)?, &PostParams::default(), node)
            .await?;
        Ok(())
    }

    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_tolerant::<k8s_openapi::api::core::v1::ServiceAccount>(namespace, name)
            .await
    }

    async fn delete_role(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_tolerant::<k8s_openapi::api::rbac::v1::Role>(namespace, name)
            .await
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_tolerant::<k8s_openapi::api::rbac::v1::RoleBinding>(namespace, name)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};

    fn pod_with_ready(status: &str) -> Pod {
        Pod {
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: status.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn readiness_requires_ready_condition_true() {
        assert!(pod_is_ready(&pod_with_ready("True")));
        assert!(!pod_is_ready(&pod_with_ready("False")));
        assert!(!pod_is_ready(&Pod::default()));
    }
}
