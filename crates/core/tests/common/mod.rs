#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{self, Cursor, Read};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use coldscan_core::{
    AttachmentRecord, AttachmentState, BlockStorage, CloudError, CloudResult, HostIdentity,
    HostOps, ObjectEntry, ObjectPage, ObjectStorage, PollSettings, ScanContext, ScanSettings,
    SignatureEngine, SnapshotRecord, SnapshotState, VolumeInfo, VolumePage, VolumeRecord,
    VolumeState,
};
use tempfile::TempDir;

pub const INSTANCE_ID: &str = "i-0123456789abcdef0";
pub const ZONE: &str = "us-east-1a";
pub const EICAR: &str = r"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!";

pub fn eicar_engine() -> Arc<SignatureEngine> {
    let rules = format!("[[rule]]\nname = \"EICAR\"\nstrings = ['{EICAR}']\n");
    Arc::new(SignatureEngine::from_sources([("test", rules.as_str())]).expect("rules compile"))
}

/// Where the emulated volume is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Creating(u32),
    Settled,
    Attaching(u32),
    Detaching(u32),
    Deleted,
}

#[derive(Debug)]
struct Volume {
    id: String,
    phase: Phase,
    state: VolumeState,
    attachment: Option<AttachmentState>,
}

/// Block storage emulating one ephemeral volume. Each knob says how many
/// describe polls a transition takes and where it ends up.
pub struct BlockScript {
    pub snapshot_states: Vec<SnapshotState>,
    pub snapshot_message: Option<String>,
    pub creating_polls: u32,
    pub settled_state: VolumeState,
    pub attaching_polls: u32,
    pub attach_outcome: AttachmentState,
    pub detaching_polls: u32,
    pub detach_outcome: VolumeState,
    /// Detach requests are rejected with this message and change nothing.
    pub detach_error: Option<String>,
    pub delete_error: Option<String>,
    pub volumes: Vec<VolumeInfo>,
    pub volumes_per_page: usize,
}

impl Default for BlockScript {
    fn default() -> Self {
        Self {
            snapshot_states: vec![SnapshotState::Pending, SnapshotState::Completed],
            snapshot_message: None,
            creating_polls: 0,
            settled_state: VolumeState::Available,
            attaching_polls: 0,
            attach_outcome: AttachmentState::Attached,
            detaching_polls: 0,
            detach_outcome: VolumeState::Available,
            detach_error: None,
            delete_error: None,
            volumes: Vec::new(),
            volumes_per_page: 2,
        }
    }
}

struct BlockState {
    script: BlockScript,
    snapshot_states: VecDeque<SnapshotState>,
    volume: Option<Volume>,
    calls: Vec<String>,
}

pub struct FakeBlockStorage {
    state: Mutex<BlockState>,
}

impl FakeBlockStorage {
    pub fn new(script: BlockScript) -> Arc<Self> {
        let snapshot_states = script.snapshot_states.iter().copied().collect();
        Arc::new(Self {
            state: Mutex::new(BlockState {
                script,
                snapshot_states,
                volume: None,
                calls: Vec::new(),
            }),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().expect("state lock").calls.clone()
    }

    /// Calls other than describes, in order.
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| !call.starts_with("describe"))
            .collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }
}

impl BlockStorage for FakeBlockStorage {
    fn create_snapshot(&self, volume_id: &str, description: &str) -> CloudResult<String> {
        let mut state = self.state.lock().expect("state lock");
        assert!(description.ends_with(volume_id));
        state.calls.push(format!("create_snapshot {volume_id}"));
        Ok("snap-1".to_string())
    }

    fn describe_snapshot(&self, snapshot_id: &str) -> CloudResult<Option<SnapshotRecord>> {
        let mut state = self.state.lock().expect("state lock");
        state.calls.push(format!("describe_snapshot {snapshot_id}"));
        let current = if state.snapshot_states.len() > 1 {
            state.snapshot_states.pop_front()
        } else {
            state.snapshot_states.front().copied()
        };
        Ok(current.map(|snapshot_state| SnapshotRecord {
            id: snapshot_id.to_string(),
            source_volume_id: "vol-1".to_string(),
            state: snapshot_state,
            progress: Some("42%".to_string()),
            error_message: state.script.snapshot_message.clone(),
        }))
    }

    fn create_volume(&self, snapshot_id: &str, zone: &str) -> CloudResult<String> {
        let mut state = self.state.lock().expect("state lock");
        assert_eq!(zone, ZONE);
        state.calls.push(format!("create_volume {snapshot_id}"));
        let polls = state.script.creating_polls;
        state.volume = Some(Volume {
            id: "vol-ephemeral".to_string(),
            phase: Phase::Creating(polls),
            state: VolumeState::Creating,
            attachment: None,
        });
        Ok("vol-ephemeral".to_string())
    }

    fn describe_volume(&self, volume_id: &str) -> CloudResult<Option<VolumeRecord>> {
        let mut guard = self.state.lock().expect("state lock");
        let state = &mut *guard;
        state.calls.push(format!("describe_volume {volume_id}"));
        let script = &state.script;
        let Some(volume) = state.volume.as_mut().filter(|volume| volume.id == volume_id) else {
            return Ok(None);
        };

        match volume.phase {
            Phase::Creating(0) => {
                volume.phase = Phase::Settled;
                volume.state = script.settled_state;
                if script.settled_state == VolumeState::InUse {
                    volume.attachment = Some(AttachmentState::Attached);
                }
            }
            Phase::Creating(left) => volume.phase = Phase::Creating(left - 1),
            Phase::Attaching(0) => {
                volume.phase = Phase::Settled;
                volume.attachment = Some(script.attach_outcome);
                if script.attach_outcome != AttachmentState::Attached {
                    volume.state = VolumeState::Available;
                }
            }
            Phase::Attaching(left) => volume.phase = Phase::Attaching(left - 1),
            Phase::Detaching(0) => {
                volume.phase = Phase::Settled;
                volume.state = script.detach_outcome;
                volume.attachment = None;
            }
            Phase::Detaching(left) => volume.phase = Phase::Detaching(left - 1),
            Phase::Settled | Phase::Deleted => {}
        }

        let attachments = volume
            .attachment
            .map(|attachment| AttachmentRecord {
                instance_id: INSTANCE_ID.to_string(),
                volume_id: volume.id.clone(),
                state: attachment,
            })
            .into_iter()
            .collect();
        Ok(Some(VolumeRecord {
            id: volume.id.clone(),
            availability_zone: Some(ZONE.to_string()),
            state: volume.state,
            attachments,
        }))
    }

    fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> CloudResult<()> {
        let mut state = self.state.lock().expect("state lock");
        assert_eq!(instance_id, INSTANCE_ID);
        state.calls.push(format!("attach_volume {volume_id} {device}"));
        let polls = state.script.attaching_polls;
        if let Some(volume) = state.volume.as_mut() {
            volume.phase = Phase::Attaching(polls);
            volume.state = VolumeState::InUse;
            volume.attachment = Some(AttachmentState::Attaching);
        }
        Ok(())
    }

    fn detach_volume(&self, volume_id: &str, instance_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().expect("state lock");
        assert_eq!(instance_id, INSTANCE_ID);
        state.calls.push(format!("detach_volume {volume_id}"));
        if let Some(message) = &state.script.detach_error {
            return Err(CloudError::new("DetachVolume", message.clone()));
        }
        let polls = state.script.detaching_polls;
        if let Some(volume) = state.volume.as_mut() {
            volume.phase = Phase::Detaching(polls);
            volume.attachment = volume.attachment.map(|_| AttachmentState::Detaching);
        }
        Ok(())
    }

    fn delete_volume(&self, volume_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().expect("state lock");
        state.calls.push(format!("delete_volume {volume_id}"));
        if let Some(message) = &state.script.delete_error {
            return Err(CloudError::new("DeleteVolume", message.clone()));
        }
        if let Some(volume) = state.volume.as_mut() {
            volume.phase = Phase::Deleted;
            volume.state = VolumeState::Deleted;
            volume.attachment = None;
        }
        Ok(())
    }

    fn list_volumes(
        &self,
        volume_ids: &[String],
        next_token: Option<&str>,
    ) -> CloudResult<VolumePage> {
        let mut state = self.state.lock().expect("state lock");
        state
            .calls
            .push(format!("list_volumes {:?} {:?}", volume_ids, next_token));
        let matching: Vec<VolumeInfo> = state
            .script
            .volumes
            .iter()
            .filter(|volume| volume_ids.is_empty() || volume_ids.contains(&volume.volume_id))
            .cloned()
            .collect();
        page_of(&matching, state.script.volumes_per_page, next_token).map(|(volumes, next)| {
            VolumePage {
                volumes,
                next_token: next,
            }
        })
    }
}

fn page_of<T: Clone>(
    items: &[T],
    per_page: usize,
    token: Option<&str>,
) -> CloudResult<(Vec<T>, Option<String>)> {
    let start = match token {
        None => 0,
        Some(token) => token
            .strip_prefix("page-")
            .and_then(|index| index.parse::<usize>().ok())
            .map(|index| index * per_page)
            .ok_or_else(|| CloudError::new("List", format!("bad token {token}")))?,
    };
    let end = (start + per_page).min(items.len());
    let next = (end < items.len()).then(|| format!("page-{}", end / per_page));
    Ok((items[start.min(end)..end].to_vec(), next))
}

/// Object storage serving synthetic objects. Objects without explicit
/// content read as zeros.
#[derive(Default)]
pub struct FakeObjectStorage {
    pub buckets: HashMap<String, Vec<ObjectEntry>>,
    pub contents: HashMap<String, Vec<u8>>,
    pub per_page: usize,
    /// Listing this page number of any bucket fails.
    pub failing_page: Option<usize>,
    pub list_calls: Mutex<Vec<(String, Option<String>)>>,
    pub ranges: Mutex<HashMap<String, Vec<Range<u64>>>>,
}

impl FakeObjectStorage {
    pub fn with_bucket(name: &str, objects: Vec<ObjectEntry>, per_page: usize) -> Self {
        let mut buckets = HashMap::new();
        buckets.insert(name.to_string(), objects);
        Self {
            buckets,
            per_page,
            ..Self::default()
        }
    }

    pub fn ranges_for(&self, key: &str) -> Vec<Range<u64>> {
        self.ranges
            .lock()
            .expect("ranges lock")
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

impl ObjectStorage for FakeObjectStorage {
    fn list_buckets(&self) -> CloudResult<Vec<String>> {
        let mut names: Vec<String> = self.buckets.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn list_objects(&self, bucket: &str, token: Option<&str>) -> CloudResult<ObjectPage> {
        self.list_calls
            .lock()
            .expect("list lock")
            .push((bucket.to_string(), token.map(str::to_string)));
        let objects = self
            .buckets
            .get(bucket)
            .ok_or_else(|| CloudError::new("ListObjectsV2", "NoSuchBucket"))?;
        let page_number = token
            .and_then(|token| token.strip_prefix("page-"))
            .and_then(|index| index.parse::<usize>().ok())
            .unwrap_or(0);
        if self.failing_page == Some(page_number) {
            return Err(CloudError::new("ListObjectsV2", "throttled"));
        }
        let (objects, next_token) = page_of(objects, self.per_page.max(1), token)?;
        Ok(ObjectPage {
            objects,
            next_token,
        })
    }

    fn get_object_range(
        &self,
        _bucket: &str,
        key: &str,
        range: Range<u64>,
    ) -> CloudResult<Box<dyn Read + Send>> {
        self.ranges
            .lock()
            .expect("ranges lock")
            .entry(key.to_string())
            .or_default()
            .push(range.clone());
        let bytes = match self.contents.get(key) {
            Some(content) => content[range.start as usize..range.end as usize].to_vec(),
            None => vec![0_u8; (range.end - range.start) as usize],
        };
        Ok(Box::new(Cursor::new(bytes)))
    }
}

#[derive(Default)]
pub struct FakeHost {
    pub fail_mount: bool,
    pub mounts: Mutex<Vec<(PathBuf, PathBuf, String)>>,
    pub unmounts: Mutex<Vec<PathBuf>>,
}

impl FakeHost {
    pub fn mount_count(&self) -> usize {
        self.mounts.lock().expect("mounts lock").len()
    }

    pub fn unmount_count(&self) -> usize {
        self.unmounts.lock().expect("unmounts lock").len()
    }
}

impl HostOps for FakeHost {
    fn mount_read_only(&self, device: &Path, target: &Path, fs_type: &str) -> io::Result<()> {
        if self.fail_mount {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "wrong fs type, bad option, bad superblock",
            ));
        }
        self.mounts.lock().expect("mounts lock").push((
            device.to_path_buf(),
            target.to_path_buf(),
            fs_type.to_string(),
        ));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        self.unmounts
            .lock()
            .expect("unmounts lock")
            .push(target.to_path_buf());
        Ok(())
    }
}

/// Device and mount directories standing in for `/dev` and the mount
/// point. The mount directory already holds the volume's files since the
/// fake host does not really mount anything.
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("dev")).expect("mkdir dev");
        for name in ["nvme0", "nvme0n1", "nvme0n1p1", "nvme1n1", "sda"] {
            fs::write(dir.path().join("dev").join(name), b"").expect("device node");
        }
        Self { dir }
    }

    pub fn dev_dir(&self) -> PathBuf {
        self.dir.path().join("dev")
    }

    pub fn mount_dir(&self) -> PathBuf {
        self.dir.path().join("snapshot")
    }

    /// Three regular files (one carrying EICAR), a symlink and an empty file.
    pub fn populate_volume(&self) {
        let root = self.mount_dir();
        fs::create_dir_all(root.join("etc")).expect("mkdir");
        fs::create_dir_all(root.join("tmp")).expect("mkdir");
        fs::write(root.join("etc/passwd"), b"root:x:0:0:root:/root:/bin/bash\n").expect("write");
        fs::write(root.join("etc/hostname"), b"builder\n").expect("write");
        fs::write(root.join("tmp/eicar.com"), EICAR.as_bytes()).expect("write");
        fs::write(root.join("tmp/empty"), b"").expect("write");
        std::os::unix::fs::symlink("/etc/passwd", root.join("tmp/link")).expect("symlink");
    }

    pub fn settings(&self) -> ScanSettings {
        ScanSettings {
            mount_dir: self.mount_dir(),
            device_dir: self.dev_dir(),
            workers: 4,
            unmount_settle: std::time::Duration::ZERO,
            poll: PollSettings::immediate(20),
            ..ScanSettings::default()
        }
    }
}

pub fn identity() -> HostIdentity {
    HostIdentity {
        instance_id: INSTANCE_ID.to_string(),
        availability_zone: ZONE.to_string(),
    }
}

pub fn context(
    block: Arc<FakeBlockStorage>,
    objects: Arc<FakeObjectStorage>,
    host: Arc<FakeHost>,
    settings: ScanSettings,
) -> ScanContext {
    ScanContext {
        block_storage: block,
        object_storage: objects,
        host,
        engine: eicar_engine(),
        identity: identity(),
        settings,
    }
}
