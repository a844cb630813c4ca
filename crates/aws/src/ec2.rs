use std::sync::Arc;

use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_ec2::types::{
    Snapshot, SnapshotState as Ec2SnapshotState, Volume, VolumeAttachment,
    VolumeAttachmentState, VolumeState as Ec2VolumeState, VolumeType,
};
use aws_sdk_ec2::Client;
use coldscan_core::{
    AttachmentRecord, AttachmentState, BlockStorage, CloudError, CloudResult, SnapshotRecord,
    SnapshotState, VolumeInfo, VolumePage, VolumeRecord, VolumeState,
};
use tokio::runtime::Runtime;
use tracing::debug;

const VOLUME_NOT_FOUND: &str = "InvalidVolume.NotFound";
const SNAPSHOT_NOT_FOUND: &str = "InvalidSnapshot.NotFound";

pub struct Ec2BlockStorage {
    runtime: Arc<Runtime>,
    client: Client,
    volume_type: VolumeType,
    iops: Option<i32>,
}

impl Ec2BlockStorage {
    pub(crate) fn new(
        runtime: Arc<Runtime>,
        client: Client,
        volume_type: &str,
        iops: Option<i32>,
    ) -> Self {
        Self {
            runtime,
            client,
            volume_type: VolumeType::from(volume_type),
            iops,
        }
    }
}

fn failure<E>(operation: &'static str, err: E) -> CloudError
where
    E: std::error::Error,
{
    CloudError::new(operation, DisplayErrorContext(err).to_string())
}

impl BlockStorage for Ec2BlockStorage {
    fn create_snapshot(&self, volume_id: &str, description: &str) -> CloudResult<String> {
        let output = self
            .runtime
            .block_on(
                self.client
                    .create_snapshot()
                    .volume_id(volume_id)
                    .description(description)
                    .send(),
            )
            .map_err(|err| failure("CreateSnapshot", err))?;
        output
            .snapshot_id()
            .map(str::to_string)
            .ok_or_else(|| CloudError::new("CreateSnapshot", "response carried no snapshot id"))
    }

    fn describe_snapshot(&self, snapshot_id: &str) -> CloudResult<Option<SnapshotRecord>> {
        let result = self.runtime.block_on(
            self.client
                .describe_snapshots()
                .snapshot_ids(snapshot_id)
                .send(),
        );
        let output = match result {
            Ok(output) => output,
            Err(err) if err.code() == Some(SNAPSHOT_NOT_FOUND) => return Ok(None),
            Err(err) => return Err(failure("DescribeSnapshots", err)),
        };
        Ok(output.snapshots().first().map(snapshot_record))
    }

    fn create_volume(&self, snapshot_id: &str, zone: &str) -> CloudResult<String> {
        let output = self
            .runtime
            .block_on(
                self.client
                    .create_volume()
                    .snapshot_id(snapshot_id)
                    .availability_zone(zone)
                    .volume_type(self.volume_type.clone())
                    .set_iops(self.iops)
                    .send(),
            )
            .map_err(|err| failure("CreateVolume", err))?;
        output
            .volume_id()
            .map(str::to_string)
            .ok_or_else(|| CloudError::new("CreateVolume", "response carried no volume id"))
    }

    fn describe_volume(&self, volume_id: &str) -> CloudResult<Option<VolumeRecord>> {
        let result = self
            .runtime
            .block_on(self.client.describe_volumes().volume_ids(volume_id).send());
        let output = match result {
            Ok(output) => output,
            Err(err) if err.code() == Some(VOLUME_NOT_FOUND) => return Ok(None),
            Err(err) => return Err(failure("DescribeVolumes", err)),
        };
        Ok(output.volumes().first().map(volume_record))
    }

    fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> CloudResult<()> {
        self.runtime
            .block_on(
                self.client
                    .attach_volume()
                    .volume_id(volume_id)
                    .instance_id(instance_id)
                    .device(device)
                    .send(),
            )
            .map_err(|err| failure("AttachVolume", err))?;
        Ok(())
    }

    fn detach_volume(&self, volume_id: &str, instance_id: &str) -> CloudResult<()> {
        self.runtime
            .block_on(
                self.client
                    .detach_volume()
                    .volume_id(volume_id)
                    .instance_id(instance_id)
                    .send(),
            )
            .map_err(|err| failure("DetachVolume", err))?;
        Ok(())
    }

    fn delete_volume(&self, volume_id: &str) -> CloudResult<()> {
        self.runtime
            .block_on(self.client.delete_volume().volume_id(volume_id).send())
            .map_err(|err| failure("DeleteVolume", err))?;
        Ok(())
    }

    fn list_volumes(
        &self,
        volume_ids: &[String],
        next_token: Option<&str>,
    ) -> CloudResult<VolumePage> {
        let ids = (!volume_ids.is_empty()).then(|| volume_ids.to_vec());
        let output = self
            .runtime
            .block_on(
                self.client
                    .describe_volumes()
                    .set_volume_ids(ids)
                    .set_next_token(next_token.map(str::to_string))
                    .send(),
            )
            .map_err(|err| failure("DescribeVolumes", err))?;

        let volumes = output
            .volumes()
            .iter()
            .filter_map(|volume| {
                let volume_id = volume.volume_id()?.to_string();
                let attached_to = volume
                    .attachments()
                    .iter()
                    .filter_map(|attachment| attachment.instance_id().map(str::to_string))
                    .collect();
                Some(VolumeInfo {
                    volume_id,
                    attached_to,
                })
            })
            .collect();
        Ok(VolumePage {
            volumes,
            next_token: output.next_token().map(str::to_string),
        })
    }
}

fn snapshot_record(snapshot: &Snapshot) -> SnapshotRecord {
    SnapshotRecord {
        id: snapshot.snapshot_id().unwrap_or_default().to_string(),
        source_volume_id: snapshot.volume_id().unwrap_or_default().to_string(),
        state: snapshot_state(snapshot.state()),
        progress: snapshot.progress().map(str::to_string),
        error_message: snapshot.state_message().map(str::to_string),
    }
}

fn snapshot_state(state: Option<&Ec2SnapshotState>) -> SnapshotState {
    match state {
        Some(Ec2SnapshotState::Completed) => SnapshotState::Completed,
        Some(Ec2SnapshotState::Error) => SnapshotState::Error,
        _ => SnapshotState::Pending,
    }
}

fn volume_record(volume: &Volume) -> VolumeRecord {
    let id = volume.volume_id().unwrap_or_default().to_string();
    VolumeRecord {
        attachments: volume
            .attachments()
            .iter()
            .filter_map(|attachment| attachment_record(&id, attachment))
            .collect(),
        availability_zone: volume.availability_zone().map(str::to_string),
        state: volume_state(volume.state()),
        id,
    }
}

fn volume_state(state: Option<&Ec2VolumeState>) -> VolumeState {
    match state {
        None | Some(Ec2VolumeState::Creating) => VolumeState::Creating,
        Some(Ec2VolumeState::Available) => VolumeState::Available,
        Some(Ec2VolumeState::InUse) => VolumeState::InUse,
        Some(Ec2VolumeState::Deleting) => VolumeState::Deleting,
        Some(Ec2VolumeState::Deleted) => VolumeState::Deleted,
        Some(Ec2VolumeState::Error) => VolumeState::Error,
        Some(other) => {
            debug!("unrecognised volume state {:?}", other);
            VolumeState::Error
        }
    }
}

fn attachment_record(volume_id: &str, attachment: &VolumeAttachment) -> Option<AttachmentRecord> {
    let state = match attachment.state()? {
        VolumeAttachmentState::Attaching => AttachmentState::Attaching,
        VolumeAttachmentState::Attached => AttachmentState::Attached,
        VolumeAttachmentState::Detaching => AttachmentState::Detaching,
        VolumeAttachmentState::Detached => AttachmentState::Detached,
        VolumeAttachmentState::Busy => AttachmentState::Busy,
        other => {
            debug!("unrecognised attachment state {:?}", other);
            AttachmentState::Busy
        }
    };
    Some(AttachmentRecord {
        instance_id: attachment.instance_id()?.to_string(),
        volume_id: volume_id.to_string(),
        state,
    })
}
