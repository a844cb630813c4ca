use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::{AttachmentState, VolumeState};

/// A failed call into a cloud collaborator.
#[derive(Debug, Error)]
#[error("{operation} request failed: {message}")]
pub struct CloudError {
    pub operation: &'static str,
    pub message: String,
}

impl CloudError {
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("unable to find any nvme devices under {}", dir.display())]
    NoDeviceFound { dir: PathBuf },
    #[error("unable to read local devices under {}: {source}", dir.display())]
    Io {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Why a volume lifecycle stopped short.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error("creating snapshot failed: {0}")]
    SnapshotFailed(String),
    #[error("invalid volume id: {0}")]
    VolumeNotFound(String),
    #[error("volume {volume_id} is in unexpected state {state:?}")]
    UnexpectedVolumeState {
        volume_id: String,
        state: VolumeState,
    },
    #[error("volume {volume_id} is {state:?}, but expected it to be in another state")]
    UnexpectedAttachmentState {
        volume_id: String,
        state: AttachmentState,
    },
    #[error("timed out waiting for {phase} after {attempts} polls")]
    Timeout { phase: &'static str, attempts: u32 },
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("failed to mount {} at {}: {source}", device.display(), target.display())]
    Mount {
        device: PathBuf,
        target: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to prepare mount directory {}: {source}", path.display())]
    MountDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Aborted before the snapshot volume was usable; nothing deletes it.
    #[error("{source}; snapshot volume {volume_id} left behind")]
    LeftBehind {
        volume_id: String,
        #[source]
        source: Box<LifecycleError>,
    },
}

/// Structured classification of a single scan failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanErrorKind {
    /// The file disappeared between the walk and the scan.
    Vanished,
    /// The path no longer names something that can be read as a regular file.
    Unmappable,
    Io,
    Fetch,
    Engine,
}

impl ScanErrorKind {
    /// Benign races during a live filesystem walk are neither logged nor
    /// counted as failures.
    pub fn is_benign(self) -> bool {
        matches!(self, ScanErrorKind::Vanished | ScanErrorKind::Unmappable)
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ScanError {
    pub kind: ScanErrorKind,
    pub message: String,
}

impl ScanError {
    pub fn new(kind: ScanErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_benign(&self) -> bool {
        self.kind.is_benign()
    }

    /// Maps an I/O failure on a local file into the benign/real taxonomy.
    pub fn from_local_io(err: &io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => ScanErrorKind::Vanished,
            _ if err.raw_os_error() == Some(libc::ELOOP) => ScanErrorKind::Unmappable,
            _ => ScanErrorKind::Io,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<FetchError> for ScanError {
    fn from(err: FetchError) -> Self {
        ScanError::new(ScanErrorKind::Fetch, err.to_string())
    }
}

/// Failure recorded by a chunked reader while the engine pulls ranges.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error("range read failed: {0}")]
    Io(#[from] io::Error),
    #[error("stream ended after {received} of {expected} bytes")]
    ShortRead { expected: u64, received: u64 },
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("scan dispatcher is no longer accepting jobs")]
    Closed,
}
