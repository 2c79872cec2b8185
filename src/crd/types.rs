//! Supporting types shared by the CacheFsRuntime and Dataset CRDs

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Storage medium of a tiered-store level
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MediumType {
    /// RAM-backed cache
    #[default]
    #[serde(rename = "MEM")]
    Mem,
    /// SSD-backed cache
    #[serde(rename = "SSD")]
    Ssd,
    /// HDD-backed cache
    #[serde(rename = "HDD")]
    Hdd,
}

/// How a cache directory is provisioned on the node
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum VolumeType {
    /// Bind a host directory
    #[default]
    HostPath,
    /// Pod-lifetime scratch space
    EmptyDir,
}

impl std::fmt::Display for VolumeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HostPath => write!(f, "hostPath"),
            Self::EmptyDir => write!(f, "emptyDir"),
        }
    }
}

/// One configured cache level: medium, path(s), quota and volume type.
///
/// `path` may contain several colon-separated directories; each becomes its
/// own indexed cache-directory entry at transform time.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Level {
    /// Cache medium
    #[serde(default)]
    pub medium_type: MediumType,

    /// Directory (or `:`-separated directories) backing this level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Byte quota for this level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<Quantity>,

    /// Low watermark: minimum free space ratio kept on the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<String>,

    /// Volume provisioning for the cache directories
    #[serde(default)]
    pub volume_type: VolumeType,
}

/// Tiered cache storage configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct TieredStore {
    /// Cache levels, fastest first. Only the first level drives the cache
    /// directory topology.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub levels: Vec<Level>,
}

/// Container image coordinates with optional pull policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VersionSpec {
    /// Image repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Image tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,

    /// Image pull policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
}

/// Pod network mode for a runtime component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum NetworkMode {
    /// Pod network namespace (default)
    #[default]
    ContainerNetwork,
    /// Share the host network namespace
    HostNetwork,
}

impl NetworkMode {
    /// Whether this mode shares the host network namespace
    pub fn is_host_network(&self) -> bool {
        matches!(self, Self::HostNetwork)
    }
}

/// Extra labels and annotations stamped onto generated pods
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct PodMetadata {
    /// Labels merged into pod templates
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations merged into pod templates
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Per-component (worker / fuse) runtime configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// Desired replica count (workers only; the fuse component is per-node)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Image override for this component
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionSpec>,

    /// Compute resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Mount options specific to this component; these win over options
    /// derived from the dataset
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,

    /// Extra environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Node selector for component pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Pod network mode
    #[serde(default)]
    pub network_mode: NetworkMode,

    /// Extra pod labels/annotations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_metadata: Option<PodMetadata>,
}

/// Reference into a Secret for one credential value
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct SecretKeySelector {
    /// Secret name in the runtime's namespace
    pub name: String,
    /// Key within the secret
    pub key: String,
}

/// Source of an encrypted option value
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptOptionSource {
    /// Secret reference carrying the value
    pub secret_key_ref: SecretKeySelector,
}

/// An option whose value is supplied by secret reference instead of inline
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptOption {
    /// Logical option key (e.g. `metaurl`, `access-key`)
    pub name: String,
    /// Where the value comes from
    pub value_from: EncryptOptionSource,
}

/// One mount entry of a dataset
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    /// Logical name; doubles as the filesystem name on first-time format
    pub name: String,

    /// Mount source in `cachefs://<subpath>` form
    pub mount_point: String,

    /// Plain options for this mount
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,

    /// Secret-referenced options for this mount
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub encrypt_options: Vec<EncryptOption>,
}

/// Dataset placement policy across nodes
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlacementMode {
    /// One dataset per node
    #[default]
    Exclusive,
    /// Multiple datasets may share a node
    Share,
}

impl std::fmt::Display for PlacementMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exclusive => write!(f, "exclusive"),
            Self::Share => write!(f, "share"),
        }
    }
}
