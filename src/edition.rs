//! Runtime edition: the two mutually exclusive CacheFS client flavors.
//!
//! The edition is decided once per transform and then passed as a parameter
//! to every component that needs to branch on it: command syntax, metrics key
//! namespace, cache-sharing semantics and format-option filtering all hang
//! off this tag.

use serde::{Deserialize, Serialize};

use crate::filter::{KeyFilter, OptionFilter};

/// The two CacheFS client flavors
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Edition {
    /// Open-source client: Prometheus metrics, per-pod exclusive cache
    Community,
    /// Commercial client: shared cache groups, `key: value` metrics
    #[default]
    Enterprise,
}

/// Metric key table selecting the five cache counters plus used space
#[derive(Clone, Copy, Debug)]
pub struct MetricKeys {
    /// Bytes held in the block cache
    pub cache_bytes: &'static str,
    /// Block reads served from cache
    pub cache_hits: &'static str,
    /// Block reads missing the cache
    pub cache_miss: &'static str,
    /// Bytes read from cache
    pub cache_hit_bytes: &'static str,
    /// Bytes read past the cache
    pub cache_miss_bytes: &'static str,
    /// Total used space of the filesystem
    pub used_space: &'static str,
}

const COMMUNITY_METRIC_KEYS: MetricKeys = MetricKeys {
    cache_bytes: "cachefs_blockcache_bytes",
    cache_hits: "cachefs_blockcache_hits",
    cache_miss: "cachefs_blockcache_miss",
    cache_hit_bytes: "cachefs_blockcache_hit_bytes",
    cache_miss_bytes: "cachefs_blockcache_miss_bytes",
    used_space: "cachefs_used_space",
};

const ENTERPRISE_METRIC_KEYS: MetricKeys = MetricKeys {
    cache_bytes: "blockcache.bytes",
    cache_hits: "blockcache.hits",
    cache_miss: "blockcache.miss",
    cache_hit_bytes: "blockcache.hitBytes",
    cache_miss_bytes: "blockcache.missBytes",
    used_space: "usedSpace",
};

impl Edition {
    /// Mount helper binary invoked by the generated mount command
    pub fn mount_binary(&self) -> &'static str {
        match self {
            Self::Community => "/bin/mount.cachefs",
            Self::Enterprise => "/sbin/mount.cachefs",
        }
    }

    /// Admin CLI used for format/auth and quota commands
    pub fn cli_path(&self) -> &'static str {
        match self {
            Self::Community => "/usr/local/bin/cachefs",
            Self::Enterprise => "/usr/bin/cachefs",
        }
    }

    /// Subcommand registering a filesystem with its backing store
    pub fn format_subcommand(&self) -> &'static str {
        match self {
            Self::Community => "format",
            Self::Enterprise => "auth",
        }
    }

    /// Attribute-cache TTL option injected on read-only datasets
    pub fn attr_cache_option(&self) -> &'static str {
        match self {
            Self::Community => "attr-cache",
            Self::Enterprise => "attrcacheto",
        }
    }

    /// Entry-cache TTL option injected on read-only datasets
    pub fn entry_cache_option(&self) -> &'static str {
        match self {
            Self::Community => "entry-cache",
            Self::Enterprise => "entrycacheto",
        }
    }

    /// Metric key table for [`crate::telemetry::parse_metrics`]
    pub fn metric_keys(&self) -> MetricKeys {
        match self {
            Self::Community => COMMUNITY_METRIC_KEYS,
            Self::Enterprise => ENTERPRISE_METRIC_KEYS,
        }
    }

    /// Whether the block cache is shared across the worker fleet.
    ///
    /// Shared-cache pods each report the fleet-wide total, so aggregation
    /// must average instead of sum.
    pub fn has_shared_cache(&self) -> bool {
        matches!(self, Self::Enterprise)
    }

    /// Filter scoping which extra options may appear on the format/auth
    /// command. Community allows the secondary-storage subset and its
    /// credentials; Enterprise allows none.
    pub fn format_option_filter(&self) -> OptionFilter {
        match self {
            Self::Community => OptionFilter::new(
                KeyFilter::allowing(["storage", "bucket", "block-size", "compress", "trash-days"]),
                KeyFilter::allowing(["access-key", "secret-key"]),
            ),
            Self::Enterprise => OptionFilter::new(KeyFilter::deny_all(), KeyFilter::deny_all()),
        }
    }
}

impl std::fmt::Display for Edition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Community => write!(f, "community"),
            Self::Enterprise => write!(f, "enterprise"),
        }
    }
}
