//! Custom Resource Definitions for the CacheFS operator

mod dataset;
mod runtime;
mod types;

pub use dataset::{
    Dataset, DatasetSpec, DatasetStatus, METADATA_SYNC_NOT_DONE_MSG, READ_ONLY_MANY,
};
pub use runtime::{
    cache_state_keys, CacheFsRuntime, CacheFsRuntimeSpec, CacheFsRuntimeStatus, RuntimeCondition,
};
pub use types::{
    ComponentSpec, EncryptOption, EncryptOptionSource, Level, MediumType, Mount, NetworkMode,
    PlacementMode, PodMetadata, SecretKeySelector, TieredStore, VersionSpec, VolumeType,
};
