//! CacheFsRuntime Custom Resource Definition
//!
//! A CacheFsRuntime describes the deployed shape of one cache runtime:
//! tiered storage levels, worker and fuse pod templates, and extra
//! first-time-format flags. It always pairs with a Dataset of the same
//! namespace/name.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ComponentSpec, PodMetadata, TieredStore, VersionSpec};

/// Specification for a CacheFsRuntime
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "data.cachefs.io",
    version = "v1alpha1",
    kind = "CacheFsRuntime",
    plural = "cachefsruntimes",
    shortname = "cfsr",
    status = "CacheFsRuntimeStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CacheFsRuntimeSpec {
    /// Runtime client image; applies to workers unless overridden per
    /// component
    #[serde(default)]
    pub version: VersionSpec,

    /// Tiered cache storage
    #[serde(default)]
    pub tiered_store: TieredStore,

    /// Worker (per-replica caching) component
    #[serde(default)]
    pub worker: ComponentSpec,

    /// Fuse (per-node mount exposure) component
    #[serde(default)]
    pub fuse: ComponentSpec,

    /// Extra flags passed verbatim (as `--flag` or `--flag=value`) to the
    /// first-time format/auth invocation, subject to the edition's option
    /// filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configs: Option<Vec<String>>,

    /// Labels/annotations applied to all generated pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_metadata: Option<PodMetadata>,
}

/// Observed state of a CacheFsRuntime
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheFsRuntimeStatus {
    /// Coarse lifecycle phase for display
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Aggregated cache counters (capacity, cached, ratios), recomputed
    /// wholesale each reconciliation pass
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cache_states: BTreeMap<String, String>,

    /// Human-readable conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<RuntimeCondition>,
}

/// One observed condition on the runtime
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeCondition {
    /// Condition type (e.g. `Ready`)
    #[serde(rename = "type")]
    pub type_: String,
    /// `True` / `False` / `Unknown`
    pub status: String,
    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Well-known keys of [`CacheFsRuntimeStatus::cache_states`]
pub mod cache_state_keys {
    /// Total configured cache capacity
    pub const CACHE_CAPACITY: &str = "cacheCapacity";
    /// Bytes currently cached
    pub const CACHED: &str = "cached";
    /// Cached bytes as a percentage of the dataset size
    pub const CACHED_PERCENTAGE: &str = "cachedPercentage";
    /// Block-level cache hit ratio
    pub const CACHE_HIT_RATIO: &str = "cacheHitRatio";
    /// Byte-level (throughput) cache hit ratio
    pub const CACHE_THROUGHPUT_RATIO: &str = "cacheThroughputRatio";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Level, MediumType};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    #[test]
    fn spec_parses_from_yaml() {
        let yaml = r#"
version:
  image: cachefs/cachefs-fuse
  imageTag: v1.2.0
tieredStore:
  levels:
    - mediumType: MEM
      quota: 2Gi
worker:
  replicas: 3
  networkMode: HostNetwork
"#;
        let spec: CacheFsRuntimeSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.version.image.as_deref(), Some("cachefs/cachefs-fuse"));
        assert_eq!(spec.tiered_store.levels.len(), 1);
        assert_eq!(spec.tiered_store.levels[0].medium_type, MediumType::Mem);
        assert_eq!(spec.worker.replicas, Some(3));
        assert!(spec.worker.network_mode.is_host_network());
    }

    #[test]
    fn default_spec_has_no_tiers() {
        let spec = CacheFsRuntimeSpec::default();
        assert!(spec.tiered_store.levels.is_empty());
        assert!(spec.configs.is_none());
    }

    #[test]
    fn quota_survives_serde() {
        let level = Level {
            medium_type: MediumType::Mem,
            quota: Some(Quantity("2Gi".to_string())),
            ..Default::default()
        };
        let spec = CacheFsRuntimeSpec {
            tiered_store: crate::crd::TieredStore {
                levels: vec![level],
            },
            ..Default::default()
        };
        let json = serde_json::to_string(&spec).unwrap();
        let back: CacheFsRuntimeSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tiered_store.levels[0].quota.as_ref().unwrap().0, "2Gi");
    }
}
