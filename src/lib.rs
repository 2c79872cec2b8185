//! Per-runtime reconciliation engine for CacheFS tiered-cache runtimes.
//!
//! A CacheFsRuntime custom resource describes a cache fleet (a worker
//! StatefulSet plus a fuse DaemonSet) serving one Dataset. This crate owns
//! the per-resource reconciliation logic behind that pair:
//!
//! - desired-state computation ([`transform`])
//! - live-object drift detection and repair ([`sync`])
//! - background dataset sizing ([`metadata`])
//! - cache telemetry aggregation ([`telemetry`])
//! - ordered teardown ([`teardown`])
//!
//! All of it hangs off [`engine::Engine`], one instance per runtime, driven
//! by the surrounding controller loop. The engine talks to the cluster only
//! through the traits in [`store`], which keeps every code path testable
//! against mocks.

pub mod crd;
pub mod edition;
pub mod engine;
pub mod error;
pub mod filter;
pub mod metadata;
pub mod quantity;
pub mod retry;
pub mod store;
pub mod sync;
pub mod teardown;
pub mod telemetry;
pub mod transform;

pub use error::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Runtime type discriminator used in object names and node labels
pub const RUNTIME_TYPE: &str = "cachefs";

/// Root of all per-runtime mount points on the host
pub const MOUNT_ROOT: &str = "/runtime-mnt/cachefs";

/// Cache directory used when a memory/disk tier specifies no path
pub const DEFAULT_CACHE_DIR: &str = "/var/lib/cachefs/cache";

/// Metrics port assumed when no explicit `metrics` option is given
pub const DEFAULT_METRICS_PORT: i32 = 9567;

/// Default client image
pub const DEFAULT_IMAGE: &str = "cachefs/cachefs-fuse";

/// Default client image tag
pub const DEFAULT_IMAGE_TAG: &str = "v1.2.0";

/// Default image pull policy
pub const DEFAULT_IMAGE_PULL_POLICY: &str = "IfNotPresent";

/// Failed cache-eviction attempts tolerated before teardown proceeds anyway
pub const DEFAULT_GRACEFUL_SHUTDOWN_LIMITS: u32 = 3;

/// How long one reconciliation pass waits on an in-flight metadata sync
/// before yielding
pub const METADATA_SYNC_POLL_TIMEOUT: std::time::Duration =
    std::time::Duration::from_millis(500);

/// Worker container name inside the worker StatefulSet pods
pub const WORKER_CONTAINER_NAME: &str = "cachefs-worker";

/// Fuse container name inside the fuse DaemonSet pods
pub const FUSE_CONTAINER_NAME: &str = "cachefs-fuse";

/// `role` label value on worker pods
pub const WORKER_POD_ROLE: &str = "cachefs-worker";

/// `role` label value on fuse pods
pub const FUSE_POD_ROLE: &str = "cachefs-fuse";

/// Pod label keying the component role
pub const POD_ROLE_LABEL: &str = "role";

/// Pod label keying the owning runtime's name
pub const POD_APP_LABEL: &str = "app";

/// Label carrying the fuse restart generation, mirrored onto the PVC
pub const FUSE_GENERATION_LABEL: &str = "runtime.cachefs.io/fuse-generation";

/// Pod-template annotation bumped to force a rolling restart
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Key holding the serialized value file inside the values ConfigMap
pub const VALUES_CONFIGMAP_KEY: &str = "data";

/// Key holding the mount command inside the per-component script ConfigMap
pub const SCRIPT_MOUNT_KEY: &str = "mount.sh";

/// Key holding the liveness check inside the per-component script ConfigMap
pub const SCRIPT_CHECK_KEY: &str = "check.sh";
