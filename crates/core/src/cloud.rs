//! Contracts for the cloud collaborators. The wire encoding lives in the
//! adapter crate; the lifecycle manager and bucket orchestrator only see
//! these traits.

use std::io::Read;
use std::ops::Range;

use crate::error::CloudError;
use crate::model::{ObjectPage, SnapshotRecord, VolumeRecord, VolumePage};

pub type CloudResult<T> = Result<T, CloudError>;

pub trait BlockStorage: Send + Sync {
    /// Starts a snapshot of `volume_id` and returns the snapshot id.
    fn create_snapshot(&self, volume_id: &str, description: &str) -> CloudResult<String>;

    /// `None` when the provider returns no description for the id.
    fn describe_snapshot(&self, snapshot_id: &str) -> CloudResult<Option<SnapshotRecord>>;

    /// Materializes a volume from a completed snapshot in `zone`.
    fn create_volume(&self, snapshot_id: &str, zone: &str) -> CloudResult<String>;

    /// `None` when the provider returns an empty description list.
    fn describe_volume(&self, volume_id: &str) -> CloudResult<Option<VolumeRecord>>;

    fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> CloudResult<()>;

    fn detach_volume(&self, volume_id: &str, instance_id: &str) -> CloudResult<()>;

    fn delete_volume(&self, volume_id: &str) -> CloudResult<()>;

    /// One page of volumes, restricted to `volume_ids` unless it is empty.
    fn list_volumes(&self, volume_ids: &[String], next_token: Option<&str>)
        -> CloudResult<VolumePage>;
}

pub trait ObjectStorage: Send + Sync {
    fn list_buckets(&self) -> CloudResult<Vec<String>>;

    fn list_objects(&self, bucket: &str, continuation_token: Option<&str>)
        -> CloudResult<ObjectPage>;

    /// Streams exactly the bytes in `range` (end exclusive).
    fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        range: Range<u64>,
    ) -> CloudResult<Box<dyn Read + Send>>;
}
