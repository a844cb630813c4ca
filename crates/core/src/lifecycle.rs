//! Ephemeral-volume scanning: snapshot, materialize, attach, mount, scan,
//! unmount, detach, delete.
//!
//! Each phase is a function that either lets the sequence proceed, reports
//! that its goal was already met, or aborts with a [`LifecycleError`]. Once
//! the ephemeral volume exists, teardown runs on every exit path; once the
//! device is mounted, unmount runs on every exit path ([`MountGuard`]).

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::ScanContext;
use crate::device::DeviceResolver;
use crate::dispatch::{ScanDispatcher, ScanJob};
use crate::error::LifecycleError;
use crate::host::HostOps;
use crate::model::{
    AttachmentState, ScanTarget, SnapshotState, TargetReport, VolumeInfo, VolumeRecord,
    VolumeState,
};
use crate::poll::{poll_until, Poll};
use crate::walk::{subject_label, walk_regular_files, ExcludeMatcher};

const SNAPSHOT_FAILED_WITHOUT_MESSAGE: &str = "snapshot failed without message";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    Proceed,
    AlreadySatisfied,
}

pub struct VolumeLifecycleManager<'a> {
    context: &'a ScanContext,
    resolver: DeviceResolver,
    excludes: ExcludeMatcher,
}

impl<'a> VolumeLifecycleManager<'a> {
    pub fn new(context: &'a ScanContext) -> Self {
        Self {
            context,
            resolver: DeviceResolver::new(&context.settings.device_dir),
            excludes: ExcludeMatcher::new(&context.settings.excludes),
        }
    }

    /// Scans one source volume end to end. Never panics on cloud failures;
    /// the outcome is recorded in the returned report.
    pub fn scan_volume(&self, volume: &VolumeInfo) -> TargetReport {
        self.scan(volume, None)
    }

    /// Like [`scan_volume`](Self::scan_volume), starting from a snapshot that
    /// was created outside this run.
    pub fn scan_snapshot(&self, volume: &VolumeInfo, snapshot_id: &str) -> TargetReport {
        self.scan(volume, Some(snapshot_id))
    }

    fn scan(&self, volume: &VolumeInfo, snapshot_id: Option<&str>) -> TargetReport {
        let started = Instant::now();
        let mut report = TargetReport::new(ScanTarget::Volume(volume.volume_id.clone()));
        if let Err(err) = self.run_lifecycle(volume, snapshot_id, &mut report) {
            error!("scan of volume {} failed: {}", volume, err);
            report.fail(err);
        }
        report.elapsed_ms = started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
        info!("finished scanning {}", volume);
        report
    }

    fn run_lifecycle(
        &self,
        volume: &VolumeInfo,
        snapshot_id: Option<&str>,
        report: &mut TargetReport,
    ) -> Result<(), LifecycleError> {
        let snapshot_id = match snapshot_id {
            Some(existing) => {
                info!("using existing snapshot {} for {}", existing, volume);
                self.await_snapshot(existing)?;
                existing.to_string()
            }
            None => self.create_snapshot(volume)?,
        };
        report.snapshot_id = Some(snapshot_id.clone());

        let volume_id = self
            .context
            .block_storage
            .create_volume(&snapshot_id, &self.context.identity.availability_zone)?;
        info!("created snapshot volume: {}", volume_id);
        report.ephemeral_volume_id = Some(volume_id.clone());

        let placement = self.await_volume(&volume_id).map_err(|err| {
            warn!(
                "snapshot volume {} never became usable and is left for the provider to settle",
                volume_id
            );
            LifecycleError::LeftBehind {
                volume_id: volume_id.clone(),
                source: Box::new(err),
            }
        })?;

        // The volume exists from here on: teardown is unconditional.
        let scanned = self
            .attach(&volume_id, placement)
            .and_then(|_| self.mount_and_scan(volume, report));
        if let Err(err) = &scanned {
            info!("scan of {} stopped early ({}), detaching", volume, err);
        }
        let torn_down = self.teardown(&volume_id);

        match (scanned, torn_down) {
            (Err(scan_err), Err(teardown_err)) => {
                error!("teardown of snapshot volume {} failed: {}", volume_id, teardown_err);
                Err(scan_err)
            }
            (Err(err), Ok(_)) | (Ok(()), Err(err)) => Err(err),
            (Ok(()), Ok(_)) => Ok(()),
        }
    }

    fn create_snapshot(&self, volume: &VolumeInfo) -> Result<String, LifecycleError> {
        info!("creating new snapshot for {}", volume);
        let description = self
            .context
            .settings
            .snapshot_description_for(&volume.volume_id);
        let snapshot_id = self
            .context
            .block_storage
            .create_snapshot(&volume.volume_id, &description)?;
        info!("created snapshot: {}", snapshot_id);
        self.await_snapshot(&snapshot_id)?;
        Ok(snapshot_id)
    }

    /// Phase 1: wait for `Completed`; `Error` aborts with the provider's
    /// message or a generic one.
    pub fn await_snapshot(&self, snapshot_id: &str) -> Result<(), LifecycleError> {
        let storage = &self.context.block_storage;
        poll_until(
            "snapshot completion",
            &self.context.settings.poll.snapshot,
            |_| {
                debug!("describing snapshot {:?}", snapshot_id);
                let Some(snapshot) = storage.describe_snapshot(snapshot_id)? else {
                    return Ok(Poll::Pending);
                };
                match snapshot.state {
                    SnapshotState::Error => Err(LifecycleError::SnapshotFailed(
                        snapshot
                            .error_message
                            .filter(|message| !message.trim().is_empty())
                            .unwrap_or_else(|| SNAPSHOT_FAILED_WITHOUT_MESSAGE.to_string()),
                    )),
                    SnapshotState::Completed => {
                        info!("snapshot completed");
                        Ok(Poll::Ready(()))
                    }
                    SnapshotState::Pending => {
                        if let Some(progress) = snapshot.progress {
                            info!("snapshot progress: {}", progress);
                        }
                        Ok(Poll::Pending)
                    }
                }
            },
        )
    }

    /// Phase 2: wait until the new volume is usable. `InUse` means it is
    /// already attached and the attach phase is skipped.
    pub fn await_volume(&self, volume_id: &str) -> Result<PhaseOutcome, LifecycleError> {
        poll_until("volume creation", &self.context.settings.poll.volume, |_| {
            let volume = self.describe(volume_id)?;
            match volume.state {
                VolumeState::Creating => {
                    info!("still creating volume");
                    Ok(Poll::Pending)
                }
                VolumeState::Available => {
                    info!("volume available");
                    Ok(Poll::Ready(PhaseOutcome::Proceed))
                }
                VolumeState::InUse => {
                    info!("volume is in use, assuming it was just attached");
                    Ok(Poll::Ready(PhaseOutcome::AlreadySatisfied))
                }
                state @ (VolumeState::Deleting | VolumeState::Deleted | VolumeState::Error) => {
                    Err(LifecycleError::UnexpectedVolumeState {
                        volume_id: volume_id.to_string(),
                        state,
                    })
                }
            }
        })
    }

    /// Phase 3: attach to this host unless the volume is already in use.
    pub fn attach(
        &self,
        volume_id: &str,
        placement: PhaseOutcome,
    ) -> Result<PhaseOutcome, LifecycleError> {
        if placement == PhaseOutcome::AlreadySatisfied {
            return Ok(PhaseOutcome::AlreadySatisfied);
        }

        let instance_id = &self.context.identity.instance_id;
        self.context.block_storage.attach_volume(
            volume_id,
            instance_id,
            &self.context.settings.device_slot,
        )?;

        poll_until("volume attachment", &self.context.settings.poll.attach, |_| {
            debug!("describing volume {:?}", volume_id);
            let volume = self.describe(volume_id)?;
            match volume.attachment_for(instance_id).map(|attachment| attachment.state) {
                None => Ok(Poll::Pending),
                Some(AttachmentState::Attaching) => {
                    info!("volume is attaching");
                    Ok(Poll::Pending)
                }
                Some(AttachmentState::Attached) => {
                    info!("volume is attached");
                    Ok(Poll::Ready(PhaseOutcome::Proceed))
                }
                Some(AttachmentState::Detaching) => {
                    info!("volume is detaching");
                    Ok(Poll::Pending)
                }
                Some(state @ (AttachmentState::Detached | AttachmentState::Busy)) => {
                    Err(LifecycleError::UnexpectedAttachmentState {
                        volume_id: volume_id.to_string(),
                        state,
                    })
                }
            }
        })
    }

    /// Phase 4: mount the newest device read-only and scan every regular file.
    /// A mount failure skips the scan; the caller still tears down.
    fn mount_and_scan(
        &self,
        volume: &VolumeInfo,
        report: &mut TargetReport,
    ) -> Result<(), LifecycleError> {
        let settings = &self.context.settings;
        let device = self.resolver.newest_device()?;
        info!("latest device is {}", device.display());

        let mount_dir = settings.mount_dir.as_path();
        fs::create_dir_all(mount_dir).map_err(|source| LifecycleError::MountDir {
            path: mount_dir.to_path_buf(),
            source,
        })?;
        self.context
            .host
            .mount_read_only(&device, mount_dir, &settings.filesystem)
            .map_err(|source| {
                info!("failed to mount, detaching");
                LifecycleError::Mount {
                    device: device.clone(),
                    target: mount_dir.to_path_buf(),
                    source,
                }
            })?;
        let guard = MountGuard::new(
            Arc::clone(&self.context.host),
            mount_dir.to_path_buf(),
            settings.unmount_settle,
        );
        info!("mounted successfully, scanning");

        let target = ScanTarget::Volume(volume.volume_id.clone());
        let dispatcher = ScanDispatcher::start(
            Arc::clone(&self.context.engine),
            target,
            &settings.dispatch_options(),
        );
        let walk = walk_regular_files(mount_dir, &self.excludes, |path| {
            let label = subject_label(mount_dir, &path);
            match dispatcher.submit(ScanJob::File { path, label }) {
                Ok(()) => true,
                Err(err) => {
                    error!("error scanning: {}", err);
                    false
                }
            }
        });
        let summary = dispatcher.drain();
        info!("finished scanning, unmounting");
        drop(guard);
        info!("finished unmounting, detaching");

        report.subjects_scanned = summary.jobs;
        report.subjects_skipped = walk.skipped;
        report.scan_errors = summary.scan_errors;
        report.suppressed_errors = summary.suppressed;
        report.matches = summary.matches;
        Ok(())
    }

    /// Phase 5: detach and delete. A volume that is already gone is a
    /// success, so running teardown twice is harmless.
    pub fn teardown(&self, volume_id: &str) -> Result<PhaseOutcome, LifecycleError> {
        let storage = &self.context.block_storage;
        let Some(volume) = storage.describe_volume(volume_id)? else {
            info!("snapshot volume {} is already gone", volume_id);
            return Ok(PhaseOutcome::AlreadySatisfied);
        };

        // A `Detached` record is history, not an attachment to undo.
        let attached = volume
            .attachments
            .iter()
            .any(|attachment| attachment.state != AttachmentState::Detached);
        match volume.state {
            VolumeState::Deleted | VolumeState::Deleting => {
                info!("snapshot volume {} is already deleted", volume_id);
                return Ok(PhaseOutcome::AlreadySatisfied);
            }
            VolumeState::Available | VolumeState::Error if !attached => {}
            _ => match storage.detach_volume(volume_id, &self.context.identity.instance_id) {
                Ok(()) => {
                    if self.await_detach(volume_id)? == PhaseOutcome::AlreadySatisfied {
                        return Ok(PhaseOutcome::AlreadySatisfied);
                    }
                }
                Err(err) => {
                    warn!("detach of {} failed: {}, checking its state", volume_id, err);
                    match storage.describe_volume(volume_id)?.map(|volume| volume.state) {
                        None | Some(VolumeState::Deleted | VolumeState::Deleting) => {
                            return Ok(PhaseOutcome::AlreadySatisfied)
                        }
                        Some(VolumeState::Available) => {}
                        Some(_) => return Err(err.into()),
                    }
                }
            },
        }

        info!("finished detaching, deleting volume");
        storage.delete_volume(volume_id)?;
        Ok(PhaseOutcome::Proceed)
    }

    fn await_detach(&self, volume_id: &str) -> Result<PhaseOutcome, LifecycleError> {
        poll_until("volume detachment", &self.context.settings.poll.detach, |_| {
            debug!("describing volume {:?}", volume_id);
            let Some(volume) = self.context.block_storage.describe_volume(volume_id)? else {
                return Ok(Poll::Ready(PhaseOutcome::AlreadySatisfied));
            };
            match volume.state {
                VolumeState::Creating => {
                    info!("still creating volume");
                    Ok(Poll::Pending)
                }
                VolumeState::Available => {
                    info!("volume available");
                    Ok(Poll::Ready(PhaseOutcome::Proceed))
                }
                VolumeState::InUse => {
                    info!("volume is in use, waiting for detachment");
                    Ok(Poll::Pending)
                }
                VolumeState::Deleting => {
                    info!("volume is being deleted");
                    Ok(Poll::Pending)
                }
                VolumeState::Deleted => Ok(Poll::Ready(PhaseOutcome::AlreadySatisfied)),
                VolumeState::Error => Err(LifecycleError::UnexpectedVolumeState {
                    volume_id: volume_id.to_string(),
                    state: VolumeState::Error,
                }),
            }
        })
    }

    fn describe(&self, volume_id: &str) -> Result<VolumeRecord, LifecycleError> {
        self.context
            .block_storage
            .describe_volume(volume_id)?
            .ok_or_else(|| LifecycleError::VolumeNotFound(volume_id.to_string()))
    }
}

/// Unmounts on drop, ignoring errors, then waits for the kernel to let go of
/// the device before detach is requested.
struct MountGuard {
    host: Arc<dyn HostOps>,
    path: PathBuf,
    settle: Duration,
}

impl MountGuard {
    fn new(host: Arc<dyn HostOps>, path: PathBuf, settle: Duration) -> Self {
        Self { host, path, settle }
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if let Err(err) = self.host.unmount(&self.path) {
            debug!("unmount of {} failed: {}", self.path.display(), err);
        }
        if !self.settle.is_zero() {
            thread::sleep(self.settle);
        }
    }
}
