//! Memory-tier resource derivation.
//!
//! A RAM-backed cache tier consumes the component's own memory. When the
//! declared memory request cannot hold the configured quota, the request is
//! raised to the quota and written back to the runtime spec, so subsequent
//! passes observe a stable value and the derivation converges.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::info;

use crate::crd::{CacheFsRuntime, ComponentSpec, MediumType};
use crate::engine::Engine;
use crate::quantity::quantity_bytes;
use crate::retry::retry_on_conflict;
use crate::{Error, Result};

/// Which runtime component resources are being derived for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RuntimeComponent {
    Worker,
    Fuse,
}

impl RuntimeComponent {
    fn spec<'a>(&self, runtime: &'a CacheFsRuntime) -> &'a ComponentSpec {
        match self {
            Self::Worker => &runtime.spec.worker,
            Self::Fuse => &runtime.spec.fuse,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Fuse => "fuse",
        }
    }
}

impl Engine {
    /// Resolve one component's compute resources, raising the memory request
    /// to the memory-tier quota when the declared request is too small.
    ///
    /// Fails when a declared memory limit is below the quota: the cache would
    /// OOM the component before filling.
    pub(crate) async fn transform_component_resources(
        &self,
        runtime: &CacheFsRuntime,
        component: RuntimeComponent,
    ) -> Result<Option<ResourceRequirements>> {
        let spec = component.spec(runtime);

        let memory_quota = runtime
            .spec
            .tiered_store
            .levels
            .first()
            .filter(|level| level.medium_type == MediumType::Mem)
            .and_then(|level| level.quota.clone());
        let Some(quota) = memory_quota else {
            return Ok(spec.resources.clone());
        };
        if spec.options.contains_key("cache-size") {
            // explicit cache-size overrides quota-derived sizing
            return Ok(spec.resources.clone());
        }

        let quota_bytes = quantity_bytes(&quota)?;
        let mut resources = spec.resources.clone().unwrap_or_default();

        let request_bytes = resources
            .requests
            .as_ref()
            .and_then(|r| r.get("memory"))
            .map(quantity_bytes)
            .transpose()?
            .unwrap_or(0);
        if request_bytes >= quota_bytes {
            return Ok(Some(resources));
        }

        if let Some(limit) = resources.limits.as_ref().and_then(|l| l.get("memory")) {
            if quantity_bytes(limit)? < quota_bytes {
                return Err(Error::validation(format!(
                    "{} memory limit {} is smaller than the memory tier quota {}",
                    component.as_str(),
                    limit.0,
                    quota.0
                )));
            }
        }

        info!(
            component = component.as_str(),
            quota = %quota.0,
            "Raising memory request to the memory tier quota"
        );
        resources
            .requests
            .get_or_insert_with(BTreeMap::new)
            .insert("memory".to_string(), quota.clone());
        self.persist_memory_request(component, &quota).await?;
        Ok(Some(resources))
    }

    /// Write the raised memory request back to the runtime spec. Only the
    /// single memory-request key is touched.
    async fn persist_memory_request(
        &self,
        component: RuntimeComponent,
        quota: &Quantity,
    ) -> Result<()> {
        retry_on_conflict("raise component memory request", || async {
            let mut runtime = self.store.get_runtime(&self.namespace, &self.name).await?;
            let spec = match component {
                RuntimeComponent::Worker => &mut runtime.spec.worker,
                RuntimeComponent::Fuse => &mut runtime.spec.fuse,
            };
            spec.resources
                .get_or_insert_with(Default::default)
                .requests
                .get_or_insert_with(BTreeMap::new)
                .insert("memory".to_string(), quota.clone());
            self.store.update_runtime(&runtime).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CacheFsRuntimeSpec, Level, TieredStore};
    use crate::engine::test_support::engine_with;
    use crate::store::{MockHelmDriver, MockPodExecutor, MockPortAllocator, MockResourceStore};

    fn mem_runtime(quota: &str) -> CacheFsRuntime {
        CacheFsRuntime::new(
            "demo",
            CacheFsRuntimeSpec {
                tiered_store: TieredStore {
                    levels: vec![Level {
                        medium_type: MediumType::Mem,
                        quota: Some(Quantity(quota.to_string())),
                        ..Default::default()
                    }],
                },
                ..Default::default()
            },
        )
    }

    fn requirements(requests: &[(&str, &str)], limits: &[(&str, &str)]) -> ResourceRequirements {
        let to_map = |pairs: &[(&str, &str)]| {
            if pairs.is_empty() {
                None
            } else {
                Some(
                    pairs
                        .iter()
                        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
                        .collect::<BTreeMap<_, _>>(),
                )
            }
        };
        ResourceRequirements {
            requests: to_map(requests),
            limits: to_map(limits),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn memory_request_is_raised_to_the_quota_and_written_back() {
        let runtime = mem_runtime("2Gi");
        let fetched = runtime.clone();

        let mut store = MockResourceStore::new();
        store
            .expect_get_runtime()
            .returning(move |_, _| Ok(fetched.clone()));
        store
            .expect_update_runtime()
            .withf(|r| {
                r.spec
                    .worker
                    .resources
                    .as_ref()
                    .and_then(|res| res.requests.as_ref())
                    .and_then(|req| req.get("memory"))
                    .map(|q| q.0 == "2Gi")
                    .unwrap_or(false)
            })
            .times(1)
            .returning(|_| Ok(()));

        let engine = engine_with(
            store,
            MockPodExecutor::new(),
            MockHelmDriver::new(),
            MockPortAllocator::new(),
        );
        let resolved = engine
            .transform_component_resources(&runtime, RuntimeComponent::Worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.requests.unwrap().get("memory").unwrap().0, "2Gi");
    }

    #[tokio::test]
    async fn sufficient_request_skips_the_write_back() {
        let mut runtime = mem_runtime("2Gi");
        runtime.spec.worker.resources = Some(requirements(&[("memory", "4Gi")], &[]));

        // no store expectations: any call panics
        let engine = engine_with(
            MockResourceStore::new(),
            MockPodExecutor::new(),
            MockHelmDriver::new(),
            MockPortAllocator::new(),
        );
        let resolved = engine
            .transform_component_resources(&runtime, RuntimeComponent::Worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.requests.unwrap().get("memory").unwrap().0, "4Gi");
    }

    #[tokio::test]
    async fn too_small_memory_limit_fails_the_transform() {
        let mut runtime = mem_runtime("2Gi");
        runtime.spec.worker.resources = Some(requirements(&[], &[("memory", "1Gi")]));

        let engine = engine_with(
            MockResourceStore::new(),
            MockPodExecutor::new(),
            MockHelmDriver::new(),
            MockPortAllocator::new(),
        );
        let err = engine
            .transform_component_resources(&runtime, RuntimeComponent::Worker)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("memory tier quota"));
    }

    #[tokio::test]
    async fn explicit_cache_size_disables_the_derivation() {
        let mut runtime = mem_runtime("2Gi");
        runtime
            .spec
            .worker
            .options
            .insert("cache-size".to_string(), "512".to_string());

        let engine = engine_with(
            MockResourceStore::new(),
            MockPodExecutor::new(),
            MockHelmDriver::new(),
            MockPortAllocator::new(),
        );
        let resolved = engine
            .transform_component_resources(&runtime, RuntimeComponent::Worker)
            .await
            .unwrap();
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn non_memory_tier_passes_resources_through() {
        let mut runtime = mem_runtime("2Gi");
        runtime.spec.tiered_store.levels[0].medium_type = MediumType::Ssd;
        runtime.spec.fuse.resources = Some(requirements(&[("cpu", "1")], &[]));

        let engine = engine_with(
            MockResourceStore::new(),
            MockPodExecutor::new(),
            MockHelmDriver::new(),
            MockPortAllocator::new(),
        );
        let resolved = engine
            .transform_component_resources(&runtime, RuntimeComponent::Fuse)
            .await
            .unwrap()
            .unwrap();
        assert!(resolved.requests.unwrap().contains_key("cpu"));
    }
}
