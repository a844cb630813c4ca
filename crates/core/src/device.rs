use std::fs;
use std::path::PathBuf;

use crate::error::DeviceError;

/// Sort key of a hot-plugged NVMe block device name:
/// (controller, namespace, partition).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NvmeSlot {
    pub controller: u32,
    pub namespace: u32,
    pub partition: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct DeviceResolver {
    dev_dir: PathBuf,
}

impl DeviceResolver {
    pub fn new(dev_dir: impl Into<PathBuf>) -> Self {
        Self {
            dev_dir: dev_dir.into(),
        }
    }

    /// NVMe namespace and partition devices visible under the device
    /// directory, oldest first.
    pub fn list_devices(&self) -> Result<Vec<(NvmeSlot, PathBuf)>, DeviceError> {
        let entries = fs::read_dir(&self.dev_dir).map_err(|source| DeviceError::Io {
            dir: self.dev_dir.clone(),
            source,
        })?;

        let mut devices = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let slot = parse_slot(name.to_str()?)?;
                Some((slot, entry.path()))
            })
            .collect::<Vec<_>>();
        devices.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(devices)
    }

    /// The most recently attached block device: the highest NVMe slot.
    pub fn newest_device(&self) -> Result<PathBuf, DeviceError> {
        self.list_devices()?
            .pop()
            .map(|(_, path)| path)
            .ok_or_else(|| DeviceError::NoDeviceFound {
                dir: self.dev_dir.clone(),
            })
    }
}

/// Parses `nvme<controller>n<namespace>[p<partition>]`. Controller character
/// devices (`nvme0`) carry no namespace and are rejected.
pub fn parse_slot(name: &str) -> Option<NvmeSlot> {
    let rest = name.strip_prefix("nvme")?;
    let (controller, rest) = split_number(rest)?;
    let rest = rest.strip_prefix('n')?;
    let (namespace, rest) = split_number(rest)?;
    let partition = if rest.is_empty() {
        None
    } else {
        let (partition, tail) = split_number(rest.strip_prefix('p')?)?;
        if !tail.is_empty() {
            return None;
        }
        Some(partition)
    };
    Some(NvmeSlot {
        controller,
        namespace,
        partition,
    })
}

fn split_number(value: &str) -> Option<(u32, &str)> {
    let end = value
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(value.len());
    if end == 0 {
        return None;
    }
    Some((value[..end].parse().ok()?, &value[end..]))
}
