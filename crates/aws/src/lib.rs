//! EC2, S3 and instance-metadata adapters for the coldscan core.
//!
//! The core is synchronous; every adapter call blocks on a shared tokio
//! runtime owned by [`AwsContext`].

mod ec2;
mod s3;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use aws_config::imds;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use coldscan_core::HostIdentity;
use tokio::runtime::Runtime;
use tracing::{debug, info};

pub use ec2::Ec2BlockStorage;
pub use s3::S3ObjectStorage;

const ZONE_PATH: &str = "/latest/meta-data/placement/availability-zone";
const INSTANCE_ID_PATH: &str = "/latest/meta-data/instance-id";

/// Runtime, SDK configuration and host identity, resolved once at startup.
#[derive(Clone)]
pub struct AwsContext {
    runtime: Arc<Runtime>,
    config: SdkConfig,
    identity: HostIdentity,
}

impl AwsContext {
    /// Resolves the host identity (from instance metadata unless both parts
    /// are given) and loads SDK configuration for the host's region.
    pub fn load(instance_id: Option<String>, availability_zone: Option<String>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;

        let identity = runtime.block_on(resolve_identity(instance_id, availability_zone))?;
        let region = identity.region().to_string();
        info!("running on {} in {}", identity.instance_id, identity.availability_zone);

        let config = runtime.block_on(
            aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(region))
                .load(),
        );

        Ok(Self {
            runtime: Arc::new(runtime),
            config,
            identity,
        })
    }

    pub fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    pub fn block_storage(&self, volume_type: &str, iops: Option<i32>) -> Ec2BlockStorage {
        Ec2BlockStorage::new(
            Arc::clone(&self.runtime),
            aws_sdk_ec2::Client::new(&self.config),
            volume_type,
            iops,
        )
    }

    pub fn object_storage(&self) -> S3ObjectStorage {
        S3ObjectStorage::new(
            Arc::clone(&self.runtime),
            aws_sdk_s3::Client::new(&self.config),
        )
    }
}

async fn resolve_identity(
    instance_id: Option<String>,
    availability_zone: Option<String>,
) -> Result<HostIdentity> {
    if let (Some(instance_id), Some(availability_zone)) = (&instance_id, &availability_zone) {
        return Ok(HostIdentity {
            instance_id: instance_id.clone(),
            availability_zone: availability_zone.clone(),
        });
    }

    let client = imds::Client::builder().build();
    let availability_zone = match availability_zone {
        Some(zone) => zone,
        None => {
            debug!("reading availability zone from instance metadata");
            client
                .get(ZONE_PATH)
                .await
                .map_err(|err| anyhow!("failed to get availability zone: {err}"))?
                .as_ref()
                .to_string()
        }
    };
    let instance_id = match instance_id {
        Some(id) => id,
        None => {
            debug!("reading instance id from instance metadata");
            client
                .get(INSTANCE_ID_PATH)
                .await
                .map_err(|err| anyhow!("failed to get instance id: {err}"))?
                .as_ref()
                .to_string()
        }
    };

    if availability_zone.trim().is_empty() || instance_id.trim().is_empty() {
        return Err(anyhow!("instance metadata returned an empty host identity"));
    }
    Ok(HostIdentity {
        instance_id,
        availability_zone,
    })
}

