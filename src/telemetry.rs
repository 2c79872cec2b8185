//! The Telemetry Aggregator: raw client metric text in, aggregated cache
//! states on the runtime and dataset status out.
//!
//! Parsing is pure and edition-keyed. The community client exposes a
//! Prometheus endpoint (`key{labels} value`); the enterprise client prints
//! `key: value` lines. Both reduce to the same five cache counters plus used
//! space.

use std::collections::BTreeMap;

use tracing::{debug, info, instrument, warn};

use crate::crd::cache_state_keys;
use crate::edition::Edition;
use crate::engine::Engine;
use crate::metadata::MetadataSyncResult;
use crate::quantity::{format_bytes, parse_human_bytes};
use crate::retry::retry_on_conflict;
use crate::sync::command_option_map;
use crate::transform::RuntimeValue;
use crate::{Result, WORKER_CONTAINER_NAME};

/// Cache counters collected from one pod (or aggregated across a fleet)
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CacheMetrics {
    /// Bytes held in the block cache
    pub cache_bytes: i64,
    /// Block reads served from cache
    pub cache_hits: i64,
    /// Block reads missing the cache
    pub cache_miss: i64,
    /// Bytes read from cache
    pub cache_hit_bytes: i64,
    /// Bytes read past the cache
    pub cache_miss_bytes: i64,
    /// Total used space of the filesystem
    pub used_space: i64,
}

/// Parse raw metric text into counters using the edition's key table.
/// Unrecognized lines are ignored.
pub fn parse_metrics(raw: &str, edition: Edition) -> CacheMetrics {
    let keys = edition.metric_keys();
    let mut metrics = CacheMetrics::default();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        // strip Prometheus labels and the enterprise `:` suffix
        let key = key.split('{').next().unwrap_or(key).trim_end_matches(':');
        let Ok(value) = value.parse::<f64>() else {
            continue;
        };
        let value = value as i64;

        if key == keys.cache_bytes {
            metrics.cache_bytes = value;
        } else if key == keys.cache_hits {
            metrics.cache_hits = value;
        } else if key == keys.cache_miss {
            metrics.cache_miss = value;
        } else if key == keys.cache_hit_bytes {
            metrics.cache_hit_bytes = value;
        } else if key == keys.cache_miss_bytes {
            metrics.cache_miss_bytes = value;
        } else if key == keys.used_space {
            metrics.used_space = value;
        }
    }
    metrics
}

/// Combine per-pod counters across a fleet. Exclusive caches sum directly;
/// shared caches report the fleet-wide total on every pod, so the summed
/// cache bytes are divided back by the pod count.
pub fn aggregate_metrics(per_pod: &[CacheMetrics], edition: Edition) -> CacheMetrics {
    let mut total = CacheMetrics::default();
    for m in per_pod {
        total.cache_bytes += m.cache_bytes;
        total.cache_hits += m.cache_hits;
        total.cache_miss += m.cache_miss;
        total.cache_hit_bytes += m.cache_hit_bytes;
        total.cache_miss_bytes += m.cache_miss_bytes;
        total.used_space += m.used_space;
    }
    if edition.has_shared_cache() && !per_pod.is_empty() {
        total.cache_bytes /= per_pod.len() as i64;
    }
    total
}

/// Ratio as a percentage string; zero denominators yield `"0.0%"`.
pub fn ratio_percentage(numerator: i64, denominator: i64) -> String {
    if denominator <= 0 {
        return "0.0%".to_string();
    }
    format!("{:.1}%", 100.0 * numerator as f64 / denominator as f64)
}

impl CacheMetrics {
    /// Block-level hit ratio
    pub fn hit_ratio(&self) -> String {
        ratio_percentage(self.cache_hits, self.cache_hits + self.cache_miss)
    }

    /// Byte-level (throughput) hit ratio
    pub fn throughput_ratio(&self) -> String {
        ratio_percentage(
            self.cache_hit_bytes,
            self.cache_hit_bytes + self.cache_miss_bytes,
        )
    }
}

/// The command run inside a worker pod to obtain raw metric text
fn metrics_command(edition: Edition, metrics_port: Option<i32>, mount_path: &str) -> Vec<String> {
    match edition {
        Edition::Community => {
            let port = metrics_port.unwrap_or(crate::DEFAULT_METRICS_PORT);
            vec![
                "curl".to_string(),
                "-s".to_string(),
                format!("http://127.0.0.1:{port}/metrics"),
            ]
        }
        Edition::Enterprise => vec![
            edition.cli_path().to_string(),
            "metrics".to_string(),
            mount_path.to_string(),
        ],
    }
}

/// Record a completed metadata sync in the telemetry stream, returning the
/// measured duration.
pub(crate) fn record_metadata_sync(runtime: &str, result: &MetadataSyncResult) -> chrono::Duration {
    let elapsed = chrono::Utc::now() - result.start_time;
    info!(
        runtime,
        ufs_total = %result.ufs_total,
        file_num = %result.file_num,
        elapsed_ms = elapsed.num_milliseconds(),
        "Metadata sync completed"
    );
    elapsed
}

/// Total configured cache capacity: per-worker cache size times the ready
/// worker count. The cache size is read back from the worker mount command.
fn fleet_cache_capacity(value: &RuntimeValue, worker_count: usize) -> Option<f64> {
    let options = command_option_map(&value.worker.command);
    let mib = options.get("cache-size")?.parse::<f64>().ok()?;
    Some(mib * 1024.0 * 1024.0 * worker_count as f64)
}

impl Engine {
    /// Collect metrics from every ready worker pod, aggregate them, and
    /// rewrite the cache states on the runtime and dataset status
    /// sub-resources wholesale.
    #[instrument(skip_all, fields(runtime = %self.name, namespace = %self.namespace))]
    pub async fn report_cache_status(&self) -> Result<()> {
        let Some(value) = self.load_runtime_value().await? else {
            debug!(runtime = %self.name, "No value file yet, skipping cache status report");
            return Ok(());
        };

        let pods = self
            .store
            .list_ready_pods(&self.namespace, &self.worker_selector())
            .await?;
        if pods.is_empty() {
            debug!(runtime = %self.name, "No ready workers, skipping cache status report");
            return Ok(());
        }

        let command = metrics_command(
            value.edition,
            value.worker.metrics_port,
            &value.worker.mount_path,
        );
        let mut per_pod = Vec::with_capacity(pods.len());
        for pod in &pods {
            let Some(pod_name) = pod.metadata.name.as_deref() else {
                continue;
            };
            match self
                .exec
                .exec(&self.namespace, pod_name, WORKER_CONTAINER_NAME, &command)
                .await
            {
                Ok((stdout, _)) => per_pod.push(parse_metrics(&stdout, value.edition)),
                Err(e) => {
                    warn!(pod = pod_name, error = %e, "Failed to collect metrics from pod")
                }
            }
        }
        let total = aggregate_metrics(&per_pod, value.edition);

        let mut cache_states = BTreeMap::new();
        if let Some(capacity) = fleet_cache_capacity(&value, per_pod.len()) {
            cache_states.insert(
                cache_state_keys::CACHE_CAPACITY.to_string(),
                format_bytes(capacity),
            );
        }
        cache_states.insert(
            cache_state_keys::CACHED.to_string(),
            format_bytes(total.cache_bytes as f64),
        );
        cache_states.insert(
            cache_state_keys::CACHE_HIT_RATIO.to_string(),
            total.hit_ratio(),
        );
        cache_states.insert(
            cache_state_keys::CACHE_THROUGHPUT_RATIO.to_string(),
            total.throughput_ratio(),
        );

        let dataset = self.store.get_dataset(&self.namespace, &self.name).await?;
        if let Some(total_bytes) = dataset
            .status
            .as_ref()
            .and_then(|s| s.ufs_total.as_deref())
            .and_then(parse_human_bytes)
        {
            if total_bytes > 0.0 {
                cache_states.insert(
                    cache_state_keys::CACHED_PERCENTAGE.to_string(),
                    format!(
                        "{:.1}%",
                        (100.0 * total.cache_bytes as f64 / total_bytes).min(100.0)
                    ),
                );
            }
        }

        self.persist_cache_states(cache_states).await
    }

    async fn persist_cache_states(&self, cache_states: BTreeMap<String, String>) -> Result<()> {
        retry_on_conflict("update runtime cache states", || {
            let cache_states = cache_states.clone();
            async move {
                let mut runtime = self.store.get_runtime(&self.namespace, &self.name).await?;
                let status = runtime.status.get_or_insert_with(Default::default);
                if status.cache_states == cache_states {
                    return Ok(());
                }
                status.cache_states = cache_states;
                self.store.update_runtime_status(&runtime).await
            }
        })
        .await?;

        retry_on_conflict("update dataset cache states", || {
            let cache_states = cache_states.clone();
            async move {
                let mut dataset = self.store.get_dataset(&self.namespace, &self.name).await?;
                let status = dataset.status.get_or_insert_with(Default::default);
                if status.cache_states == cache_states {
                    return Ok(());
                }
                status.cache_states = cache_states;
                self.store.update_dataset_status(&dataset).await
            }
        })
        .await
    }
}
