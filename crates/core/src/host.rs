use std::io;
use std::path::Path;

/// Host operating-system operations the volume lifecycle needs.
pub trait HostOps: Send + Sync {
    /// Mounts `device` at `target` read-only and without exec permission.
    fn mount_read_only(&self, device: &Path, target: &Path, fs_type: &str) -> io::Result<()>;

    fn unmount(&self, target: &Path) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxHost;

#[cfg(target_os = "linux")]
impl HostOps for LinuxHost {
    fn mount_read_only(&self, device: &Path, target: &Path, fs_type: &str) -> io::Result<()> {
        let device = c_path(device)?;
        let target = c_path(target)?;
        let fs_type = std::ffi::CString::new(fs_type)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let flags = libc::MS_RDONLY | libc::MS_NOEXEC;
        // SAFETY: all pointers come from live CStrings; data is unused.
        let result = unsafe {
            libc::mount(
                device.as_ptr(),
                target.as_ptr(),
                fs_type.as_ptr(),
                flags,
                std::ptr::null(),
            )
        };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        let target = c_path(target)?;
        // SAFETY: target is a live CString.
        let result = unsafe { libc::umount(target.as_ptr()) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(target_os = "linux")]
fn c_path(path: &Path) -> io::Result<std::ffi::CString> {
    use std::os::unix::ffi::OsStrExt;

    std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
}

#[cfg(not(target_os = "linux"))]
impl HostOps for LinuxHost {
    fn mount_read_only(&self, _device: &Path, _target: &Path, _fs_type: &str) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "mounting block devices is only supported on linux",
        ))
    }

    fn unmount(&self, _target: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unmounting block devices is only supported on linux",
        ))
    }
}
