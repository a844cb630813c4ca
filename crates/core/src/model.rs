use std::fmt;

use serde::{Deserialize, Serialize};

pub const REPORT_VERSION: &str = "1.0.0";

/// Largest byte range fetched from object storage in one request.
pub const MAX_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ScanTarget {
    Volume(String),
    Bucket(String),
}

impl ScanTarget {
    pub fn id(&self) -> &str {
        match self {
            ScanTarget::Volume(id) | ScanTarget::Bucket(id) => id,
        }
    }
}

impl fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanTarget::Volume(id) => write!(f, "volume {id}"),
            ScanTarget::Bucket(id) => write!(f, "bucket {id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    Pending,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotRecord {
    pub id: String,
    pub source_volume_id: String,
    pub state: SnapshotState,
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VolumeState {
    Creating,
    Available,
    InUse,
    Deleting,
    Deleted,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentState {
    Attaching,
    Attached,
    Detaching,
    Detached,
    Busy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttachmentRecord {
    pub instance_id: String,
    pub volume_id: String,
    pub state: AttachmentState,
}

/// Describe-volume view of a block volume, used both for the ephemeral
/// volume materialized from a snapshot and for source volumes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeRecord {
    pub id: String,
    #[serde(default)]
    pub availability_zone: Option<String>,
    pub state: VolumeState,
    #[serde(default)]
    pub attachments: Vec<AttachmentRecord>,
}

impl VolumeRecord {
    pub fn attachment_for(&self, instance_id: &str) -> Option<&AttachmentRecord> {
        self.attachments
            .iter()
            .find(|attachment| attachment.instance_id == instance_id)
    }
}

/// A source volume selected for scanning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeInfo {
    pub volume_id: String,
    #[serde(default)]
    pub attached_to: Vec<String>,
}

impl VolumeInfo {
    pub fn new(volume_id: impl Into<String>) -> Self {
        Self {
            volume_id: volume_id.into(),
            attached_to: Vec::new(),
        }
    }
}

impl fmt::Display for VolumeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attached_to.is_empty() {
            write!(f, "{}", self.volume_id)
        } else {
            write!(
                f,
                "{} (attached to {})",
                self.volume_id,
                self.attached_to.join(", ")
            )
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumePage {
    pub volumes: Vec<VolumeInfo>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectPage {
    pub objects: Vec<ObjectEntry>,
    pub next_token: Option<String>,
}

/// One byte range of a remote object: `[base, base + length)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkRequest {
    pub base: u64,
    pub length: u64,
}

impl ChunkRequest {
    pub fn end(&self) -> u64 {
        self.base + self.length
    }
}

/// A rule that fired, as reported by the scan engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleMatch {
    pub rule: String,
    pub namespace: String,
}

impl RuleMatch {
    pub fn new(rule: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            namespace: namespace.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchResult {
    pub rule_name: String,
    pub rule_namespace: String,
    pub target: ScanTarget,
    /// Path inside the volume (mount prefix stripped) or object key.
    pub subject_label: String,
    #[serde(default)]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostIdentity {
    pub instance_id: String,
    pub availability_zone: String,
}

impl HostIdentity {
    /// Region derived from the zone by dropping its trailing letter, as in
    /// `us-east-1a` -> `us-east-1`.
    pub fn region(&self) -> &str {
        let zone = self.availability_zone.as_str();
        match zone.char_indices().last() {
            Some((index, ch)) if ch.is_ascii_alphabetic() => &zone[..index],
            _ => zone,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetReport {
    pub target: ScanTarget,
    pub status: TargetStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub ephemeral_volume_id: Option<String>,
    #[serde(default)]
    pub subjects_scanned: u64,
    #[serde(default)]
    pub subjects_skipped: u64,
    #[serde(default)]
    pub scan_errors: u64,
    #[serde(default)]
    pub suppressed_errors: u64,
    #[serde(default)]
    pub matches: Vec<MatchResult>,
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl TargetReport {
    pub fn new(target: ScanTarget) -> Self {
        Self {
            target,
            status: TargetStatus::Succeeded,
            error: None,
            snapshot_id: None,
            ephemeral_volume_id: None,
            subjects_scanned: 0,
            subjects_skipped: 0,
            scan_errors: 0,
            suppressed_errors: 0,
            matches: Vec::new(),
            elapsed_ms: 0,
        }
    }

    pub fn fail(&mut self, error: impl fmt::Display) {
        self.status = TargetStatus::Failed;
        self.error = Some(error.to_string());
    }

    pub fn succeeded(&self) -> bool {
        self.status == TargetStatus::Succeeded
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub report_version: String,
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub availability_zone: Option<String>,
    pub targets: Vec<TargetReport>,
}

impl RunReport {
    pub fn failed_targets(&self) -> usize {
        self.targets.iter().filter(|target| !target.succeeded()).count()
    }

    pub fn total_matches(&self) -> usize {
        self.targets.iter().map(|target| target.matches.len()).sum()
    }

    /// 0 when every target scanned without a reported error, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.failed_targets() == 0 {
            0
        } else {
            1
        }
    }
}
