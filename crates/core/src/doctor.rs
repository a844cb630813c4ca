use std::env;
use std::fs;

use serde::{Deserialize, Serialize};
use sysinfo::Disks;

use crate::config::ScanSettings;
use crate::device::DeviceResolver;
use crate::signatures::rule_files;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountedDisk {
    pub name: String,
    pub mount_point: String,
    pub file_system: String,
    pub total_space_bytes: u64,
    pub free_space_bytes: u64,
    pub is_removable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorInfo {
    pub os: String,
    pub arch: String,
    pub current_dir: Option<String>,
    pub disks: Vec<MountedDisk>,
    pub device_dir: String,
    pub nvme_devices: Vec<String>,
    pub newest_device: Option<String>,
    pub mount_dir: String,
    pub mount_dir_exists: bool,
    /// `Some(false)` when something is already mounted or left behind there.
    pub mount_dir_empty: Option<bool>,
    pub signatures_dir: String,
    pub rule_files: Vec<String>,
    pub notes: Vec<String>,
}

pub fn collect_doctor_info(settings: &ScanSettings) -> DoctorInfo {
    let current_dir = env::current_dir()
        .ok()
        .map(|path| path.to_string_lossy().to_string());
    let mut notes = vec![
        "Volumes are mounted read-only and no-exec; source volumes are never modified."
            .to_string(),
    ];

    let resolver = DeviceResolver::new(&settings.device_dir);
    let nvme_devices = match resolver.list_devices() {
        Ok(devices) => devices
            .into_iter()
            .map(|(_, path)| path.to_string_lossy().to_string())
            .collect(),
        Err(err) => {
            notes.push(format!("Device directory unreadable: {err}"));
            Vec::new()
        }
    };
    let newest_device = resolver
        .newest_device()
        .ok()
        .map(|path| path.to_string_lossy().to_string());
    if newest_device.is_none() {
        notes.push(
            "No NVMe block device visible; volume scans need a Nitro-based instance.".to_string(),
        );
    }

    let mount_dir_exists = settings.mount_dir.is_dir();
    let mount_dir_empty = fs::read_dir(&settings.mount_dir)
        .ok()
        .map(|mut entries| entries.next().is_none());
    if mount_dir_empty == Some(false) {
        notes.push(format!(
            "Mount directory {} is not empty; a previous run may not have unmounted.",
            settings.mount_dir.display()
        ));
    }

    let rule_files: Vec<String> = rule_files(&settings.signatures_dir)
        .into_iter()
        .map(|path| path.to_string_lossy().to_string())
        .collect();
    if rule_files.is_empty() {
        notes.push(format!(
            "No rule files found under {}; scans will refuse to start.",
            settings.signatures_dir.display()
        ));
    }

    DoctorInfo {
        os: env::consts::OS.to_string(),
        arch: env::consts::ARCH.to_string(),
        current_dir,
        disks: enumerate_disks(),
        device_dir: settings.device_dir.to_string_lossy().to_string(),
        nvme_devices,
        newest_device,
        mount_dir: settings.mount_dir.to_string_lossy().to_string(),
        mount_dir_exists,
        mount_dir_empty,
        signatures_dir: settings.signatures_dir.to_string_lossy().to_string(),
        rule_files,
        notes,
    }
}

fn enumerate_disks() -> Vec<MountedDisk> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .map(|disk| MountedDisk {
            name: disk.name().to_string_lossy().to_string(),
            mount_point: disk.mount_point().to_string_lossy().to_string(),
            file_system: disk.file_system().to_string_lossy().to_string(),
            total_space_bytes: disk.total_space(),
            free_space_bytes: disk.available_space(),
            is_removable: disk.is_removable(),
        })
        .collect()
}
