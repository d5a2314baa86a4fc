//! User-space work-queue portals.
//!
//! A work queue enabled as a user queue shows up as a character device
//! (`/dev/dsa/wq<dev>.<queue>`). Mapping its first page yields the portal.
//! The queue's configured mode is read from sysfs and must match the
//! submission protocol the caller intends to use.

use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use crate::desc::HwDesc;
use crate::error::{Error, Result};
use crate::wq::{Enqueue, Portal, QueueProvider, WqMode};

/// Portal page size.
pub const PORTAL_SIZE: usize = 4096;

const DEV_DIR: &str = "/dev/dsa";
const SYSFS_DIR: &str = "/sys/bus/dsa/devices";

/// A mapped work-queue portal. Unmapped on drop.
pub struct UserPortal {
    name: String,
    portal: NonNull<u8>,
}

unsafe impl Send for UserPortal {}
unsafe impl Sync for UserPortal {}

impl UserPortal {
    /// Open and map the portal of the queue device at `path`.
    pub fn open(name: &str, path: &Path) -> Result<Self> {
        let unavailable = |source| Error::QueueUnavailable {
            name: name.to_string(),
            source,
        };
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(unavailable)?;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                PORTAL_SIZE,
                libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(unavailable(std::io::Error::last_os_error()));
        }
        // The mapping outlives the file descriptor.
        drop(file);
        let portal = NonNull::new(ptr as *mut u8).ok_or(Error::MapFailed { len: PORTAL_SIZE })?;
        tracing::debug!(name, ?path, "mapped work queue portal");
        Ok(Self {
            name: name.to_string(),
            portal,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Portal for UserPortal {
    #[inline]
    fn write64(&self, desc: &HwDesc) {
        let portal = self.portal.as_ptr();
        let desc = desc as *const HwDesc;
        movdir64b!(portal, desc);
    }

    #[inline]
    fn enqueue(&self, desc: &HwDesc) -> Enqueue {
        #[cfg(target_arch = "x86_64")]
        {
            let portal = self.portal.as_ptr();
            let desc = desc as *const HwDesc;
            if enqcmd!(portal, desc) {
                Enqueue::Accepted
            } else {
                Enqueue::Retry
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = desc;
            Enqueue::Fault(-libc::EOPNOTSUPP)
        }
    }
}

impl Drop for UserPortal {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.portal.as_ptr() as *mut libc::c_void, PORTAL_SIZE);
        }
        tracing::debug!(name = %self.name, "unmapped work queue portal");
    }
}

/// Acquires [`UserPortal`]s, checking each queue's configured mode.
#[derive(Debug, Clone)]
pub struct SysfsProvider {
    dev_dir: PathBuf,
    sysfs_dir: PathBuf,
}

impl Default for SysfsProvider {
    fn default() -> Self {
        Self {
            dev_dir: PathBuf::from(DEV_DIR),
            sysfs_dir: PathBuf::from(SYSFS_DIR),
        }
    }
}

impl SysfsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use alternative device and sysfs roots.
    pub fn with_roots(dev_dir: impl Into<PathBuf>, sysfs_dir: impl Into<PathBuf>) -> Self {
        Self {
            dev_dir: dev_dir.into(),
            sysfs_dir: sysfs_dir.into(),
        }
    }

    /// Configured mode of queue `name`.
    pub fn queue_mode(&self, name: &str) -> Result<WqMode> {
        let path = self.sysfs_dir.join(name).join("mode");
        let raw = std::fs::read_to_string(&path).map_err(|source| Error::QueueUnavailable {
            name: name.to_string(),
            source,
        })?;
        raw.parse().map_err(|_| Error::ModeMismatch {
            name: name.to_string(),
            expected: WqMode::Shared,
            found: raw.trim().to_string(),
        })
    }

    fn check_mode(&self, name: &str, mode: WqMode) -> Result<()> {
        let found = self.queue_mode(name).map_err(|e| match e {
            Error::ModeMismatch { name, found, .. } => Error::ModeMismatch {
                name,
                expected: mode,
                found,
            },
            other => other,
        })?;
        if found != mode {
            return Err(Error::ModeMismatch {
                name: name.to_string(),
                expected: mode,
                found: found.to_string(),
            });
        }
        Ok(())
    }
}

impl QueueProvider for SysfsProvider {
    type Portal = UserPortal;

    fn acquire(&self, name: &str, mode: WqMode) -> Result<UserPortal> {
        self.check_mode(name, mode)?;
        UserPortal::open(name, &self.dev_dir.join(name))
    }
}
