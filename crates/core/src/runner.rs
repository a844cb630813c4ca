use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::bucket::scan_bucket;
use crate::config::ScanContext;
use crate::lifecycle::VolumeLifecycleManager;
use crate::model::{RunReport, TargetReport, VolumeInfo, REPORT_VERSION};

/// Which targets of one kind a run covers, parsed from a comma-separated
/// flag value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelection {
    Skip,
    All,
    Ids(Vec<String>),
}

impl TargetSelection {
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() {
            return TargetSelection::Skip;
        }
        if value == "all" {
            return TargetSelection::All;
        }
        let ids: Vec<String> = value
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            TargetSelection::Skip
        } else {
            TargetSelection::Ids(ids)
        }
    }
}

pub struct RunController<'a> {
    context: &'a ScanContext,
}

impl<'a> RunController<'a> {
    pub fn new(context: &'a ScanContext) -> Self {
        Self { context }
    }

    /// Resolves the selected targets and scans them one at a time, volumes
    /// first. Failing to resolve a target list aborts the run; failures of
    /// individual targets are recorded in the report.
    pub fn run(&self, volumes: &TargetSelection, buckets: &TargetSelection) -> Result<RunReport> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now().to_rfc3339();
        info!("starting run {}", run_id);

        let mut targets: Vec<TargetReport> = Vec::new();

        if *volumes == TargetSelection::Skip {
            info!("skipping scanning volumes, none specified");
        } else {
            let resolved = self.resolve_volumes(volumes)?;
            let listing = resolved
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            info!("scanning the following volumes: [{}]", listing);
            let manager = VolumeLifecycleManager::new(self.context);
            for volume in &resolved {
                targets.push(manager.scan_volume(volume));
            }
        }

        if *buckets == TargetSelection::Skip {
            info!("skipping scanning buckets, none specified");
        } else {
            let resolved = self.resolve_buckets(buckets)?;
            info!("scanning the following buckets: [{}]", resolved.join(", "));
            for bucket in &resolved {
                targets.push(scan_bucket(self.context, bucket));
            }
        }

        let report = RunReport {
            report_version: REPORT_VERSION.to_string(),
            run_id,
            started_at,
            finished_at: Utc::now().to_rfc3339(),
            instance_id: Some(self.context.identity.instance_id.clone()),
            availability_zone: Some(self.context.identity.availability_zone.clone()),
            targets,
        };
        info!(
            "run {} finished: {} target(s), {} failed, {} match(es)",
            report.run_id,
            report.targets.len(),
            report.failed_targets(),
            report.total_matches()
        );
        Ok(report)
    }

    pub fn resolve_volumes(&self, selection: &TargetSelection) -> Result<Vec<VolumeInfo>> {
        let ids: &[String] = match selection {
            TargetSelection::Skip => return Ok(Vec::new()),
            TargetSelection::All => &[],
            TargetSelection::Ids(ids) => ids,
        };

        let mut volumes = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .context
                .block_storage
                .list_volumes(ids, token.as_deref())
                .context("describe volumes request failed")?;
            for volume in page.volumes {
                info!("found volume {}", volume.volume_id);
                volumes.push(volume);
            }
            match page.next_token {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => break,
            }
        }
        Ok(volumes)
    }

    pub fn resolve_buckets(&self, selection: &TargetSelection) -> Result<Vec<String>> {
        match selection {
            TargetSelection::Skip => Ok(Vec::new()),
            TargetSelection::Ids(ids) => Ok(ids.clone()),
            TargetSelection::All => self
                .context
                .object_storage
                .list_buckets()
                .context("list buckets request failed"),
        }
    }
}
