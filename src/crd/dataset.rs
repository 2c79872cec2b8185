//! Dataset Custom Resource Definition
//!
//! A Dataset declares what a cache runtime serves: mount entries with
//! per-mount and shared options, placement policy and access modes. The
//! engine reads it as input and only ever writes its status sub-resource
//! (dataset size facts and cache states).

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{EncryptOption, Mount, PlacementMode};

/// Specification for a Dataset
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "data.cachefs.io",
    version = "v1alpha1",
    kind = "Dataset",
    plural = "datasets",
    status = "DatasetStatus",
    namespaced,
    printcolumn = r#"{"name":"UfsTotal","type":"string","jsonPath":".status.ufsTotal"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatasetSpec {
    /// Mount entries; the first entry drives the runtime's command set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,

    /// Options applied to every mount; mount-level options win per key
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub shared_options: BTreeMap<String, String>,

    /// Secret-referenced options applied to every mount; mount-level
    /// references win per key
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shared_encrypt_options: Vec<EncryptOption>,

    /// Node placement policy
    #[serde(default)]
    pub placement: PlacementMode,

    /// Access modes exposed by the serving volume (e.g. `ReadOnlyMany`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
}

/// Observed state of a Dataset
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatasetStatus {
    /// Total size of the backing store, human readable; `[Calculating]`
    /// while the metadata coordinator is measuring
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ufs_total: Option<String>,

    /// Number of files in the backing store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_num: Option<String>,

    /// Mirror of the runtime's aggregated cache counters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cache_states: BTreeMap<String, String>,
}

/// Status marker while the background size computation is in flight
pub const METADATA_SYNC_NOT_DONE_MSG: &str = "[Calculating]";

/// Access mode string marking a read-only dataset
pub const READ_ONLY_MANY: &str = "ReadOnlyMany";

impl DatasetSpec {
    /// Whether any declared access mode makes the dataset read-only
    pub fn is_read_only(&self) -> bool {
        self.access_modes.iter().any(|m| m == READ_ONLY_MANY)
    }
}
