//! The desired-state descriptor produced by the Value Transformer.
//!
//! A [`RuntimeValue`] is serialized to YAML into the values ConfigMap, where
//! it is consumed by the templating layer to render pod specs, by the Spec
//! Syncer as the last-synced baseline, and by the Teardown Sequencer to
//! recover reserved ports and the worker-instance UUID.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements, Volume, VolumeMount};
use serde::{Deserialize, Serialize};

use crate::edition::Edition;
use crate::crd::VolumeType;

/// One resolved cache directory
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheDir {
    /// Absolute path on the node / in the container
    pub path: String,
    /// How the directory is provisioned
    #[serde(rename = "type")]
    pub volume_type: VolumeType,
}

/// An unrecognized encrypted option injected as a named environment variable
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptEnvOption {
    /// Original option key
    pub name: String,
    /// Derived environment-variable name substituted into the command
    pub env_name: String,
    /// Secret carrying the value
    pub secret_key_ref_name: String,
    /// Key within the secret
    pub secret_key_ref_key: String,
}

/// Credential references and generated one-shot commands
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigValues {
    /// Filesystem name (first mount's name)
    pub name: String,

    /// Secondary-storage scheme (`s3`, `oss`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,

    /// Secondary-storage bucket endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,

    /// Secret holding the metadata-engine URL (Community only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metaurl_secret: Option<String>,

    /// Secret holding the access key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_secret: Option<String>,

    /// Secret holding the secret key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_secret: Option<String>,

    /// Secret holding the auth token (Enterprise only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_secret: Option<String>,

    /// Unrecognized encrypted options, injected as individual env vars
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub encrypt_env_options: Vec<EncryptEnvOption>,

    /// First-time registration command, when credentials imply one is needed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format_cmd: Option<String>,

    /// Directory quota command, when a `quota` option was configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_cmd: Option<String>,
}

/// Desired state of one runtime component (worker or fuse)
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentValue {
    /// Image override for this component, empty = runtime-level image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Image tag override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,

    /// Mount command handed to the client binary at pod start
    pub command: String,

    /// Liveness probe command against the mount point
    pub stat_cmd: String,

    /// In-container mount path
    pub mount_path: String,

    /// Node selector
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Compute resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Extra environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub envs: Vec<EnvVar>,

    /// Pod volumes (cache directories)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    /// Container volume mounts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,

    /// Pod labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Pod annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Reserved metrics port (Community, host networking)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<i32>,

    /// Whether the pod shares the host network namespace
    #[serde(default)]
    pub host_network: bool,
}

/// Fuse-specific desired state
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FuseValue {
    /// Shared component fields
    #[serde(flatten)]
    pub component: ComponentValue,

    /// Sub-path within the backing filesystem, when not mounting the root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,

    /// Host-side bind path exposed to application pods
    pub host_mount_path: String,
}

/// The full desired-state descriptor for one runtime
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeValue {
    /// Release / object-name prefix
    pub fullname_override: String,

    /// Runtime namespace
    pub namespace: String,

    /// Runtime name
    pub name: String,

    /// Client flavor driving command syntax and metrics namespace
    pub edition: Edition,

    /// Mount source: the metadata URL placeholder (Community) or the
    /// filesystem name (Enterprise)
    pub source: String,

    /// Runtime-level image
    pub image: String,

    /// Runtime-level image tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,

    /// Image pull policy
    pub image_pull_policy: String,

    /// Indexed cache directory table; keys are stable 1-based strings,
    /// entries deduplicated by resolved path
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cache_dirs: BTreeMap<String, CacheDir>,

    /// Worker desired state
    pub worker: ComponentValue,

    /// Fuse desired state
    pub fuse: FuseValue,

    /// Credentials and generated commands
    pub configs: ConfigValues,

    /// Dataset placement policy
    pub placement_mode: String,
}

impl RuntimeValue {
    /// Full image reference with the tag concatenated when present
    pub fn full_image(&self) -> String {
        match &self.image_tag {
            Some(tag) if !tag.is_empty() => format!("{}:{}", self.image, tag),
            _ => self.image.clone(),
        }
    }

    /// Image reference for one component: component override when present,
    /// otherwise the runtime-level image
    pub fn component_image(&self, component: &ComponentValue) -> String {
        match &component.image {
            Some(image) => match &component.image_tag {
                Some(tag) if !tag.is_empty() => format!("{image}:{tag}"),
                _ => image.clone(),
            },
            None => self.full_image(),
        }
    }

    /// Serialize to the YAML document stored in the values ConfigMap
    pub fn to_yaml(&self) -> crate::Result<String> {
        serde_yaml::to_string(self).map_err(|e| crate::Error::serialization(e.to_string()))
    }

    /// Parse back from the values ConfigMap payload
    pub fn from_yaml(data: &str) -> crate::Result<Self> {
        serde_yaml::from_str(data).map_err(|e| crate::Error::serialization(e.to_string()))
    }
}
