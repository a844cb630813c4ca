use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::cloud::{BlockStorage, ObjectStorage};
use crate::dispatch::{DispatchOptions, DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS};
use crate::engine::ScanEngine;
use crate::host::HostOps;
use crate::model::{HostIdentity, MAX_CHUNK_SIZE};
use crate::poll::PollPolicy;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollSettings {
    pub snapshot: PollPolicy,
    pub volume: PollPolicy,
    pub attach: PollPolicy,
    pub detach: PollPolicy,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            snapshot: PollPolicy::new(Duration::from_secs(10), Some(2160)),
            volume: PollPolicy::new(Duration::from_secs(10), Some(180)),
            attach: PollPolicy::new(Duration::from_secs(5), Some(120)),
            detach: PollPolicy::new(Duration::from_secs(10), Some(180)),
        }
    }
}

impl PollSettings {
    /// Zero delay everywhere; used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        let policy = PollPolicy::immediate(max_attempts);
        Self {
            snapshot: policy,
            volume: policy,
            attach: policy,
            detach: policy,
        }
    }

    /// Drops every attempt ceiling and waits on cloud state indefinitely.
    pub fn without_ceiling(mut self) -> Self {
        for policy in [
            &mut self.snapshot,
            &mut self.volume,
            &mut self.attach,
            &mut self.detach,
        ] {
            policy.max_attempts = None;
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScanSettings {
    pub signatures_dir: PathBuf,
    pub mount_dir: PathBuf,
    pub device_dir: PathBuf,
    /// Device slot requested when attaching the ephemeral volume.
    pub device_slot: String,
    pub filesystem: String,
    pub workers: usize,
    pub queue_capacity: usize,
    pub chunk_size: u64,
    pub engine_overlap: usize,
    #[serde(with = "crate::poll::millis")]
    pub unmount_settle: Duration,
    pub snapshot_description: String,
    pub volume_type: String,
    pub volume_iops: Option<i32>,
    pub excludes: Vec<String>,
    pub record_digests: bool,
    pub poll: PollSettings,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            signatures_dir: PathBuf::from("./rules"),
            mount_dir: PathBuf::from("./snapshot"),
            device_dir: PathBuf::from("/dev"),
            device_slot: "/dev/sda2".to_string(),
            filesystem: "ext4".to_string(),
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            chunk_size: MAX_CHUNK_SIZE,
            engine_overlap: crate::signatures::DEFAULT_OVERLAP,
            unmount_settle: Duration::from_secs(1),
            snapshot_description: "coldscan temporary snapshot of".to_string(),
            volume_type: "gp3".to_string(),
            volume_iops: Some(6000),
            excludes: Vec::new(),
            record_digests: true,
            poll: PollSettings::default(),
        }
    }
}

impl ScanSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let settings: ScanSettings = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(anyhow!("workers must be greater than zero"));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow!("queue_capacity must be greater than zero"));
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(anyhow!(
                "chunk_size must be between 1 and {MAX_CHUNK_SIZE} bytes"
            ));
        }
        for (phase, policy) in [
            ("snapshot", &self.poll.snapshot),
            ("volume", &self.poll.volume),
            ("attach", &self.poll.attach),
            ("detach", &self.poll.detach),
        ] {
            if policy.max_attempts == Some(0) {
                return Err(anyhow!("{phase} poll max_attempts must be greater than zero"));
            }
        }
        Ok(())
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            record_digests: self.record_digests,
        }
    }

    pub fn snapshot_description_for(&self, volume_id: &str) -> String {
        format!("{} {}", self.snapshot_description, volume_id)
    }
}

/// Everything a run needs, built once at startup and passed by reference.
#[derive(Clone)]
pub struct ScanContext {
    pub block_storage: Arc<dyn BlockStorage>,
    pub object_storage: Arc<dyn ObjectStorage>,
    pub host: Arc<dyn HostOps>,
    pub engine: Arc<dyn ScanEngine>,
    pub identity: HostIdentity,
    pub settings: ScanSettings,
}
