pub mod bucket;
pub mod chunked;
pub mod cloud;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod doctor;
pub mod engine;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod markdown;
pub mod model;
pub mod poll;
pub mod runner;
pub mod signatures;
pub mod walk;
pub mod yara;

pub use bucket::scan_bucket;
pub use chunked::RemoteChunkedReader;
pub use cloud::{BlockStorage, CloudResult, ObjectStorage};
pub use config::{PollSettings, ScanContext, ScanSettings};
pub use device::{DeviceResolver, NvmeSlot};
pub use dispatch::{DispatchOptions, DispatchSummary, ScanDispatcher, ScanJob};
pub use doctor::{collect_doctor_info, DoctorInfo};
pub use engine::{load_engine, ChunkSource, ScanEngine};
pub use error::{
    CloudError, DeviceError, DispatchError, FetchError, LifecycleError, ScanError, ScanErrorKind,
};
pub use host::{HostOps, LinuxHost};
pub use lifecycle::{PhaseOutcome, VolumeLifecycleManager};
pub use markdown::render_markdown_summary;
pub use model::{
    AttachmentRecord, AttachmentState, ChunkRequest, HostIdentity, MatchResult, ObjectEntry,
    ObjectPage, RuleMatch, RunReport, ScanTarget, SnapshotRecord, SnapshotState, TargetReport,
    TargetStatus, VolumeInfo, VolumePage, VolumeRecord, VolumeState, MAX_CHUNK_SIZE,
    REPORT_VERSION,
};
pub use poll::{poll_until, Poll, PollPolicy};
pub use runner::{RunController, TargetSelection};
pub use signatures::{rule_files, CompiledRule, SignatureEngine};
pub use walk::{subject_label, walk_regular_files, ExcludeMatcher, WalkStats};
pub use yara::YaraEngine;
