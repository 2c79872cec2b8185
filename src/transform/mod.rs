//! The Value Transformer: CacheFsRuntime + Dataset in, [`RuntimeValue`] out.
//!
//! Transformation is a pure derivation except for three reads (dataset,
//! metaurl secret, previously recorded value file) and two narrowly scoped
//! writes: metrics-port reservation for host-network Community components
//! that have no recorded port yet, and the memory-request write-back of the
//! memory-tier derivation. Everything else is computed from the two specs,
//! deterministically: identical inputs produce byte-identical commands.

mod commands;
mod resources;
pub mod value;

pub use value::{CacheDir, ComponentValue, ConfigValues, EncryptEnvOption, FuseValue, RuntimeValue};

pub(crate) use commands::parse_metrics_port;
pub(crate) use resources::RuntimeComponent;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    EmptyDirVolumeSource, HostPathVolumeSource, Volume, VolumeMount,
};
use tracing::{debug, instrument, warn};

use crate::crd::{
    CacheFsRuntime, DatasetSpec, EncryptOption, PodMetadata, TieredStore, VolumeType,
};
use crate::edition::Edition;
use crate::engine::Engine;
use crate::quantity::quantity_bytes;
use crate::{Error, Result, DEFAULT_CACHE_DIR, DEFAULT_IMAGE, DEFAULT_IMAGE_PULL_POLICY,
    DEFAULT_IMAGE_TAG};

use commands::{
    build_format_command, build_mount_command, build_quota_command, cache_group_name,
    derive_env_name, stat_command, READ_ONLY_CACHE_TTL,
};

impl Engine {
    /// Compute the full desired state for this runtime.
    #[instrument(skip_all, fields(runtime = %self.name, namespace = %self.namespace))]
    pub async fn transform(&self, runtime: &CacheFsRuntime) -> Result<RuntimeValue> {
        let dataset = self.store.get_dataset(&self.namespace, &self.name).await?;
        let mount = dataset.spec.mounts.first().ok_or_else(|| {
            Error::validation(format!(
                "dataset {}/{} has no mount entries",
                self.namespace, self.name
            ))
        })?;
        if mount.name.is_empty() {
            return Err(Error::validation("mount name must not be empty"));
        }

        let edition = detect_edition(&dataset.spec);
        debug!(
            runtime = %self.name,
            namespace = %self.namespace,
            edition = %edition,
            "Transforming runtime"
        );

        let mut value = RuntimeValue {
            fullname_override: self.name.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            edition,
            source: match edition {
                Edition::Community => "${METAURL}".to_string(),
                Edition::Enterprise => mount.name.clone(),
            },
            image: runtime
                .spec
                .version
                .image
                .clone()
                .unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
            image_tag: Some(
                runtime
                    .spec
                    .version
                    .image_tag
                    .clone()
                    .unwrap_or_else(|| DEFAULT_IMAGE_TAG.to_string()),
            ),
            image_pull_policy: runtime
                .spec
                .version
                .image_pull_policy
                .clone()
                .unwrap_or_else(|| DEFAULT_IMAGE_PULL_POLICY.to_string()),
            placement_mode: dataset.spec.placement.to_string(),
            ..Default::default()
        };

        let mut configs = ConfigValues {
            name: mount.name.clone(),
            ..Default::default()
        };

        // Plain option merge: shared first, mount-level wins per key.
        let mut options = dataset.spec.shared_options.clone();
        options.extend(mount.options.clone());
        configs.storage = options.remove("storage");
        configs.bucket = options.remove("bucket");
        let quota_request = options.remove("quota");

        // Encrypted options: recognized keys become secret references, the
        // rest become validated environment-variable placeholders.
        let encrypts = merge_encrypt_options(&dataset.spec.shared_encrypt_options, &mount.encrypt_options);
        for opt in &encrypts {
            let secret_ref = &opt.value_from.secret_key_ref;
            match opt.name.as_str() {
                "metaurl" => {
                    self.verify_secret_key(&secret_ref.name, &secret_ref.key).await?;
                    configs.metaurl_secret = Some(secret_ref.name.clone());
                }
                "access-key" => configs.access_key_secret = Some(secret_ref.name.clone()),
                "secret-key" => configs.secret_key_secret = Some(secret_ref.name.clone()),
                "token" => configs.token_secret = Some(secret_ref.name.clone()),
                other => {
                    let env_name = derive_env_name(other)?;
                    options.insert(other.to_string(), format!("${{{env_name}}}"));
                    configs.encrypt_env_options.push(EncryptEnvOption {
                        name: other.to_string(),
                        env_name,
                        secret_key_ref_name: secret_ref.name.clone(),
                        secret_key_ref_key: secret_ref.key.clone(),
                    });
                }
            }
        }

        // Sub-path from the mount point scheme.
        let sub_path = parse_sub_path(&mount.mount_point)?;
        if let Some(p) = &sub_path {
            options.insert("subdir".to_string(), p.clone());
            value.fuse.sub_path = Some(p.clone());
        }

        if dataset.spec.is_read_only() {
            options.insert("ro".to_string(), String::new());
            options
                .entry(edition.attr_cache_option().to_string())
                .or_insert_with(|| READ_ONLY_CACHE_TTL.to_string());
            options
                .entry(edition.entry_cache_option().to_string())
                .or_insert_with(|| READ_ONLY_CACHE_TTL.to_string());
        }

        // Tiered store: cache directory table plus derived sizing options.
        let (cache_dirs, cache_paths) = resolve_cache_dirs(&runtime.spec.tiered_store);
        options.insert("cache-dir".to_string(), cache_paths.join(":"));
        if let Some(level) = runtime.spec.tiered_store.levels.first() {
            if let Some(quota) = &level.quota {
                let mib = quantity_bytes(quota)? >> 20;
                options.insert("cache-size".to_string(), mib.to_string());
            }
            if let Some(low) = &level.low {
                options.insert("free-space-ratio".to_string(), low.clone());
            }
        }
        value.cache_dirs = cache_dirs;

        for key in ["cache-size", "cache-dir"] {
            if runtime.spec.worker.options.contains_key(key) {
                warn!(
                    runtime = %self.name,
                    option = key,
                    "Worker option is deprecated, configure the tiered store instead"
                );
            }
        }

        // Metrics ports. Only the community client exposes Prometheus
        // metrics; host-network pods need cluster-unique reserved ports.
        // A port already recorded in the values ConfigMap is reused, so
        // repeated transforms of an unchanged runtime stay byte-identical
        // and the allocator is charged once per component, not per pass.
        let worker_host = runtime.spec.worker.network_mode.is_host_network();
        let fuse_host = runtime.spec.fuse.network_mode.is_host_network();
        if edition == Edition::Community {
            let mut worker_port = None;
            let mut fuse_port = None;
            if worker_host || fuse_host {
                let prior = self.load_runtime_value().await?;
                if worker_host {
                    worker_port = prior
                        .as_ref()
                        .filter(|v| v.worker.host_network)
                        .and_then(|v| v.worker.metrics_port);
                }
                if fuse_host {
                    fuse_port = prior
                        .as_ref()
                        .filter(|v| v.fuse.component.host_network)
                        .and_then(|v| v.fuse.component.metrics_port);
                }

                let needed = usize::from(worker_host && worker_port.is_none())
                    + usize::from(fuse_host && fuse_port.is_none());
                if needed > 0 {
                    let reserved = self.ports.reserve_ports(needed).await?;
                    if reserved.len() < needed {
                        return Err(Error::validation(format!(
                            "port allocator returned {} of {needed} requested ports",
                            reserved.len()
                        )));
                    }
                    let mut reserved = reserved.into_iter();
                    if worker_host && worker_port.is_none() {
                        worker_port = reserved.next();
                    }
                    if fuse_host && fuse_port.is_none() {
                        fuse_port = reserved.next();
                    }
                }
            }
            value.worker.metrics_port = Some(match worker_port {
                Some(port) => port,
                None => parse_metrics_port(&runtime.spec.worker.options)?,
            });
            value.fuse.component.metrics_port = Some(match fuse_port {
                Some(port) => port,
                None => parse_metrics_port(&runtime.spec.fuse.options)?,
            });
        }

        // Per-component option maps; explicit component options win.
        let mut worker_options = options.clone();
        worker_options.extend(runtime.spec.worker.options.clone());
        let mut fuse_options = options.clone();
        fuse_options.extend(runtime.spec.fuse.options.clone());

        let mount_path = self.mount_point();
        let cache_group = cache_group_name(&value);
        value.worker.command = build_mount_command(
            edition,
            &value.source,
            &mount_path,
            &mut worker_options,
            &cache_group,
            value.worker.metrics_port,
            false,
        );
        value.fuse.component.command = build_mount_command(
            edition,
            &value.source,
            &mount_path,
            &mut fuse_options,
            &cache_group,
            value.fuse.component.metrics_port,
            true,
        );
        value.worker.stat_cmd = stat_command(&mount_path);
        value.fuse.component.stat_cmd = stat_command(&mount_path);
        value.worker.mount_path = mount_path.clone();
        value.fuse.component.mount_path = mount_path;
        value.fuse.host_mount_path = self.host_mount_point();

        configs.format_cmd = build_format_command(
            edition,
            &value.source,
            &configs,
            runtime.spec.configs.as_ref(),
            &options,
            &encrypts,
        );
        if let Some(quota) = &quota_request {
            configs.quota_cmd = Some(build_quota_command(
                edition,
                &value.source,
                value.fuse.sub_path.as_deref(),
                quota,
            )?);
        }
        value.configs = configs;

        value.worker.resources = self
            .transform_component_resources(runtime, RuntimeComponent::Worker)
            .await?;
        value.fuse.component.resources = self
            .transform_component_resources(runtime, RuntimeComponent::Fuse)
            .await?;

        let (volumes, volume_mounts) = cache_volumes(&value.cache_dirs);
        value.worker.volumes = volumes.clone();
        value.worker.volume_mounts = volume_mounts.clone();
        value.fuse.component.volumes = volumes;
        value.fuse.component.volume_mounts = volume_mounts;

        value.worker.node_selector = runtime.spec.worker.node_selector.clone();
        value.fuse.component.node_selector = runtime.spec.fuse.node_selector.clone();
        value
            .fuse
            .component
            .node_selector
            .insert(self.fuse_label_name(), "true".to_string());

        let (labels, annotations) = merged_pod_metadata(
            runtime.spec.pod_metadata.as_ref(),
            runtime.spec.worker.pod_metadata.as_ref(),
        );
        value.worker.labels = labels;
        value.worker.annotations = annotations;
        let (labels, annotations) = merged_pod_metadata(
            runtime.spec.pod_metadata.as_ref(),
            runtime.spec.fuse.pod_metadata.as_ref(),
        );
        value.fuse.component.labels = labels;
        value.fuse.component.annotations = annotations;

        value.worker.envs = runtime.spec.worker.env.clone();
        value.fuse.component.envs = runtime.spec.fuse.env.clone();
        value.worker.host_network = worker_host;
        value.fuse.component.host_network = fuse_host;

        if let Some(version) = &runtime.spec.worker.version {
            value.worker.image = version.image.clone();
            value.worker.image_tag = version.image_tag.clone();
        }
        if let Some(version) = &runtime.spec.fuse.version {
            value.fuse.component.image = version.image.clone();
            value.fuse.component.image_tag = version.image_tag.clone();
        }

        Ok(value)
    }

    /// Fail fast when a referenced secret or its key is missing.
    async fn verify_secret_key(&self, name: &str, key: &str) -> Result<()> {
        let secret = self
            .store
            .get_secret(&self.namespace, name)
            .await?
            .ok_or_else(|| {
                Error::validation(format!("secret {}/{} not found", self.namespace, name))
            })?;
        let present = secret
            .data
            .as_ref()
            .map(|d| d.contains_key(key))
            .unwrap_or(false)
            || secret
                .string_data
                .as_ref()
                .map(|d| d.contains_key(key))
                .unwrap_or(false);
        if !present {
            return Err(Error::validation(format!(
                "secret {}/{} has no key {}",
                self.namespace, name, key
            )));
        }
        Ok(())
    }
}

/// A metaurl reference anywhere on the dataset selects the community client;
/// its absence selects the enterprise client.
pub(crate) fn detect_edition(spec: &DatasetSpec) -> Edition {
    let has_metaurl = spec
        .shared_encrypt_options
        .iter()
        .chain(spec.mounts.first().map(|m| m.encrypt_options.iter()).into_iter().flatten())
        .any(|o| o.name == "metaurl");
    if has_metaurl {
        Edition::Community
    } else {
        Edition::Enterprise
    }
}

/// Merge shared and mount-level encrypted options; mount-level wins per key.
/// Output order is deterministic (sorted by option name).
fn merge_encrypt_options(shared: &[EncryptOption], mount: &[EncryptOption]) -> Vec<EncryptOption> {
    let mut by_name: BTreeMap<String, EncryptOption> = BTreeMap::new();
    for opt in shared.iter().chain(mount.iter()) {
        by_name.insert(opt.name.clone(), opt.clone());
    }
    by_name.into_values().collect()
}

/// Extract the sub-path from a `cachefs://<subpath>` mount point. The bare
/// root (`cachefs://` or `cachefs:///`) yields no sub-path.
fn parse_sub_path(mount_point: &str) -> Result<Option<String>> {
    let rest = mount_point.strip_prefix("cachefs://").ok_or_else(|| {
        Error::validation(format!(
            "mount point {mount_point} must use the cachefs:// scheme"
        ))
    })?;
    match rest {
        "" | "/" => Ok(None),
        path => Ok(Some(path.to_string())),
    }
}

/// Resolve the first tiered level into the indexed cache-directory table.
/// Multiple colon-separated paths each get an entry; duplicates collapse.
fn resolve_cache_dirs(tiered: &TieredStore) -> (BTreeMap<String, CacheDir>, Vec<String>) {
    let level = tiered.levels.first();
    let volume_type = level.map(|l| l.volume_type.clone()).unwrap_or_default();
    let raw = level
        .and_then(|l| l.path.clone())
        .unwrap_or_else(|| DEFAULT_CACHE_DIR.to_string());

    let mut dirs = BTreeMap::new();
    let mut paths: Vec<String> = Vec::new();
    for part in raw.split(':') {
        let path = part.trim();
        let path = if path.len() > 1 {
            path.trim_end_matches('/')
        } else {
            path
        };
        if path.is_empty() || paths.iter().any(|p| p == path) {
            continue;
        }
        paths.push(path.to_string());
        dirs.insert(
            paths.len().to_string(),
            CacheDir {
                path: path.to_string(),
                volume_type: volume_type.clone(),
            },
        );
    }
    (dirs, paths)
}

/// Build the pod volume and container mount for every cache directory.
fn cache_volumes(cache_dirs: &BTreeMap<String, CacheDir>) -> (Vec<Volume>, Vec<VolumeMount>) {
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    for (index, dir) in cache_dirs {
        let name = format!("cache-dir-{index}");
        let volume = match dir.volume_type {
            VolumeType::HostPath => Volume {
                name: name.clone(),
                host_path: Some(HostPathVolumeSource {
                    path: dir.path.clone(),
                    type_: Some("DirectoryOrCreate".to_string()),
                }),
                ..Default::default()
            },
            VolumeType::EmptyDir => Volume {
                name: name.clone(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
        };
        volumes.push(volume);
        mounts.push(VolumeMount {
            name,
            mount_path: dir.path.clone(),
            ..Default::default()
        });
    }
    (volumes, mounts)
}

/// Merge runtime-wide and component pod metadata; component entries win.
fn merged_pod_metadata(
    common: Option<&PodMetadata>,
    component: Option<&PodMetadata>,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut labels = common.map(|m| m.labels.clone()).unwrap_or_default();
    let mut annotations = common.map(|m| m.annotations.clone()).unwrap_or_default();
    if let Some(component) = component {
        labels.extend(component.labels.clone());
        annotations.extend(component.annotations.clone());
    }
    (labels, annotations)
}
