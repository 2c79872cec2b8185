//! Field-level diff-and-merge helpers shared by the worker and fuse sync
//! paths.
//!
//! Every merge is a union: a present-but-different entry is replaced, a new
//! entry is appended, and existing unrelated entries are never deleted. Each
//! helper returns whether it changed anything; the caller unions the flags
//! into one `changed` result.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, EnvVar, PodTemplateSpec, ResourceRequirements, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::quantity::quantities_equal;
use crate::transform::ComponentValue;

/// Merge `desired` into `current` by key. Returns true when any entry was
/// added or replaced. Unrelated existing keys are preserved.
pub(crate) fn union_map(
    current: &mut BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
) -> bool {
    let mut changed = false;
    for (k, v) in desired {
        if current.get(k) != Some(v) {
            current.insert(k.clone(), v.clone());
            changed = true;
        }
    }
    changed
}

/// Merge `desired` into `current` by a name accessor. A present-but-different
/// entry is replaced in place, a new entry is appended.
pub(crate) fn union_by_name<T, F>(current: &mut Vec<T>, desired: &[T], name: F) -> bool
where
    T: Clone + PartialEq,
    F: Fn(&T) -> &str,
{
    let mut changed = false;
    for wanted in desired {
        match current.iter_mut().find(|c| name(c) == name(wanted)) {
            Some(existing) if *existing != *wanted => {
                *existing = wanted.clone();
                changed = true;
            }
            Some(_) => {}
            None => {
                current.push(wanted.clone());
                changed = true;
            }
        }
    }
    changed
}

fn quantity_maps_equal(
    a: Option<&BTreeMap<String, Quantity>>,
    b: Option<&BTreeMap<String, Quantity>>,
) -> bool {
    let empty = BTreeMap::new();
    let a = a.unwrap_or(&empty);
    let b = b.unwrap_or(&empty);
    a.len() == b.len()
        && a.iter()
            .all(|(k, v)| b.get(k).map(|o| quantities_equal(v, o)).unwrap_or(false))
}

/// Semantic equality for resource requirements: `1Gi` equals `1024Mi`.
pub(crate) fn resource_requirements_equal(
    a: Option<&ResourceRequirements>,
    b: Option<&ResourceRequirements>,
) -> bool {
    let default = ResourceRequirements::default();
    let a = a.unwrap_or(&default);
    let b = b.unwrap_or(&default);
    quantity_maps_equal(a.requests.as_ref(), b.requests.as_ref())
        && quantity_maps_equal(a.limits.as_ref(), b.limits.as_ref())
}

/// Re-derive the option map of a rendered mount command: everything after
/// `-o`, comma-split, `key=value` or bare-key entries.
pub(crate) fn command_option_map(command: &str) -> BTreeMap<String, String> {
    let Some((_, opts)) = command.split_once(" -o ") else {
        return BTreeMap::new();
    };
    opts.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
            None => (entry.trim().to_string(), String::new()),
        })
        .collect()
}

/// Whether two mount commands agree, ignoring the metrics endpoint option
/// (which legitimately varies with host networking).
pub(crate) fn commands_equal_ignoring_metrics(live: &str, desired: &str) -> bool {
    let prefix = |cmd: &str| cmd.split(" -o ").next().unwrap_or("").trim().to_string();
    if prefix(live) != prefix(desired) {
        return false;
    }
    let mut live_opts = command_option_map(live);
    let mut desired_opts = command_option_map(desired);
    live_opts.remove("metrics");
    desired_opts.remove("metrics");
    live_opts == desired_opts
}

/// Merge one component's desired state into a live pod template. Covers
/// every per-field diff rule except the command itself, which lives in a
/// script ConfigMap and is handled separately.
pub(crate) fn merge_pod_template(
    template: &mut PodTemplateSpec,
    desired: &ComponentValue,
    image: &str,
) -> bool {
    let mut changed = false;

    let metadata = template.metadata.get_or_insert_with(Default::default);
    changed |= union_map(
        metadata.labels.get_or_insert_with(BTreeMap::new),
        &desired.labels,
    );
    changed |= union_map(
        metadata.annotations.get_or_insert_with(BTreeMap::new),
        &desired.annotations,
    );

    let spec = template.spec.get_or_insert_with(Default::default);

    // node selector: exact map equality
    let live_selector = spec.node_selector.clone().unwrap_or_default();
    if live_selector != desired.node_selector {
        spec.node_selector = Some(desired.node_selector.clone());
        changed = true;
    }

    changed |= union_by_name(
        spec.volumes.get_or_insert_with(Vec::new),
        &desired.volumes,
        |v: &Volume| &v.name,
    );

    if let Some(container) = spec.containers.first_mut() {
        changed |= merge_container(container, desired, image);
    }

    changed
}

fn merge_container(container: &mut Container, desired: &ComponentValue, image: &str) -> bool {
    let mut changed = false;

    if container.image.as_deref() != Some(image) {
        container.image = Some(image.to_string());
        changed = true;
    }

    changed |= union_by_name(
        container.env.get_or_insert_with(Vec::new),
        &desired.envs,
        |e: &EnvVar| &e.name,
    );

    changed |= union_by_name(
        container.volume_mounts.get_or_insert_with(Vec::new),
        &desired.volume_mounts,
        |m: &VolumeMount| &m.name,
    );

    if !resource_requirements_equal(container.resources.as_ref(), desired.resources.as_ref()) {
        container.resources = desired.resources.clone();
        changed = true;
    }

    changed
}
