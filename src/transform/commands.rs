//! Mount, format and quota command generation.
//!
//! The rendered strings are the literal arguments handed to the CacheFS
//! client at pod start. The `-o k=v,k2,...` option syntax (comma-joined, no
//! spaces inside values) is a binding contract with that binary.

use std::collections::BTreeMap;

use crate::crd::EncryptOption;
use crate::edition::Edition;
use crate::{Error, Result};

use super::value::{ConfigValues, RuntimeValue};

/// Seconds of attribute/entry caching granted to read-only datasets
pub(crate) const READ_ONLY_CACHE_TTL: &str = "7200";

/// Render an option map as the comma-joined `-o` payload. Keys iterate in
/// sorted order, so identical inputs produce byte-identical commands.
pub(crate) fn render_options(options: &BTreeMap<String, String>) -> String {
    options
        .iter()
        .map(|(k, v)| {
            if v.is_empty() {
                k.clone()
            } else {
                format!("{k}={v}")
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Assemble one component's mount command and apply the edition's fixed
/// option suffixes. `is_fuse` controls the `no-sharing` flag on shared-cache
/// editions: the fuse client must not contend for the worker cache group.
pub(crate) fn build_mount_command(
    edition: Edition,
    source: &str,
    mount_path: &str,
    options: &mut BTreeMap<String, String>,
    cache_group: &str,
    metrics_port: Option<i32>,
    is_fuse: bool,
) -> String {
    match edition {
        Edition::Community => {
            if !options.contains_key("metrics") {
                let port = metrics_port.unwrap_or(crate::DEFAULT_METRICS_PORT);
                options.insert("metrics".to_string(), format!("0.0.0.0:{port}"));
            }
        }
        Edition::Enterprise => {
            options.insert("foreground".to_string(), String::new());
            options.insert("no-update".to_string(), String::new());
            options
                .entry("cache-group".to_string())
                .or_insert_with(|| cache_group.to_string());
            if is_fuse {
                options.insert("no-sharing".to_string(), String::new());
            } else {
                options.remove("no-sharing");
            }
        }
    }

    format!(
        "{} {} {} -o {}",
        edition.mount_binary(),
        source,
        mount_path,
        render_options(options)
    )
}

/// Mount-point liveness probe command
pub(crate) fn stat_command(mount_path: &str) -> String {
    format!("stat -c %i {mount_path}")
}

/// Generate the first-time registration command when credentials imply one
/// is needed. Extra `configs` flags and generic options pass through the
/// edition's format-option filter so only the edition-appropriate subset
/// ever reaches the invocation.
pub(crate) fn build_format_command(
    edition: Edition,
    source: &str,
    configs: &ConfigValues,
    extra_flags: Option<&Vec<String>>,
    options: &BTreeMap<String, String>,
    encrypt_options: &[EncryptOption],
) -> Option<String> {
    let filter = edition.format_option_filter();
    let mut args: Vec<String> = Vec::new();

    if let Some(flags) = extra_flags {
        for flag in flags {
            let flag = flag.trim();
            if !flag.is_empty() {
                args.push(format!("--{flag}"));
            }
        }
    }

    for (k, v) in filter.filter_options(options) {
        if v.is_empty() {
            args.push(format!("--{k}"));
        } else {
            args.push(format!("--{k}={v}"));
        }
    }

    match edition {
        Edition::Community => {
            let allowed: Vec<&str> = filter
                .filter_encrypt_options(encrypt_options)
                .iter()
                .map(|o| o.name.as_str())
                .map(|n| match n {
                    "access-key" => "--access-key=${ACCESS_KEY}",
                    _ => "--secret-key=${SECRET_KEY}",
                })
                .collect();
            args.extend(allowed.iter().map(|s| s.to_string()));

            if configs.storage.is_none() || configs.bucket.is_none() {
                args.push("--no-update".to_string());
            }
            if let Some(storage) = &configs.storage {
                args.push(format!("--storage={storage}"));
            }
            if let Some(bucket) = &configs.bucket {
                args.push(format!("--bucket={bucket}"));
            }

            let mut cmd = vec![
                edition.cli_path().to_string(),
                edition.format_subcommand().to_string(),
            ];
            cmd.extend(args);
            cmd.push(source.to_string());
            cmd.push(configs.name.clone());
            Some(cmd.join(" "))
        }
        Edition::Enterprise => {
            // no token, no auth
            configs.token_secret.as_ref()?;

            let mut cmd = vec![
                edition.cli_path().to_string(),
                edition.format_subcommand().to_string(),
            ];
            cmd.extend(args);
            cmd.push("--token=${TOKEN}".to_string());
            if configs.access_key_secret.is_some() {
                cmd.push("--accesskey=${ACCESS_KEY}".to_string());
            }
            if configs.secret_key_secret.is_some() {
                cmd.push("--secretkey=${SECRET_KEY}".to_string());
            }
            if let Some(bucket) = &configs.bucket {
                cmd.push(format!("--bucket={bucket}"));
            }
            cmd.push(source.to_string());
            Some(cmd.join(" "))
        }
    }
}

/// Generate the directory quota command when a `quota` option is present.
///
/// The quota is converted to whole gibibytes; anything below 1 GiB is a
/// configuration error, as is a quota without a resolved sub-path.
pub(crate) fn build_quota_command(
    edition: Edition,
    source: &str,
    sub_path: Option<&str>,
    quota: &str,
) -> Result<String> {
    let bytes = crate::quantity::parse_bytes(quota)?;
    let gib = bytes >> 30;
    if gib < 1 {
        return Err(Error::validation(format!(
            "quota {quota} is less than 1GiB"
        )));
    }
    let sub_path = sub_path.ok_or_else(|| {
        Error::validation("a mount sub-path must be configured when quota is enabled")
    })?;
    Ok(format!(
        "{} quota set {} --path {} --capacity {}",
        edition.cli_path(),
        source,
        sub_path,
        gib
    ))
}

/// Derive the environment-variable name for an unrecognized encrypted option
/// key and validate it. Dashes and dots map to underscores; the result must
/// be a legal POSIX environment-variable name.
pub(crate) fn derive_env_name(key: &str) -> Result<String> {
    let env_name: String = key
        .chars()
        .map(|c| if c == '-' || c == '.' { '_' } else { c })
        .collect();

    let mut chars = env_name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::validation(format!(
            "encrypted option key {key} cannot be converted to a valid environment variable name"
        )));
    }
    Ok(env_name)
}

/// Extract the port from a `metrics=host:port` option value
pub(crate) fn parse_metrics_port(options: &BTreeMap<String, String>) -> Result<i32> {
    match options.get("metrics") {
        None => Ok(crate::DEFAULT_METRICS_PORT),
        Some(value) => {
            let port = value
                .rsplit(':')
                .next()
                .and_then(|p| p.parse::<i32>().ok())
                .filter(|p| (1..=65535).contains(p));
            port.ok_or_else(|| Error::validation(format!("invalid metrics port: {value}")))
        }
    }
}

/// The deterministic cache-group name shared by one runtime's workers
pub(crate) fn cache_group_name(value: &RuntimeValue) -> String {
    format!("{}-{}", value.namespace, value.fullname_override)
}
