//! Low-level backing regions: POSIX shared memory and file mappings
//!
//! A bus name that looks like a path (contains `/`, or starts with `.`) is
//! mapped from a regular file and survives reboots with the file; any other
//! name resolves to a POSIX shared memory object under `/dev/shm`.

use crate::error::{BusError, Result};
use rustix::fd::OwnedFd;
use rustix::fs::{ftruncate, OFlags};
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::path::PathBuf;
use std::ptr::NonNull;

/// NAME_MAX minus the leading slash shm object names carry.
const MAX_NAME_LEN: usize = 254;

enum Backing {
    Object(String),
    File(PathBuf),
}

fn backing_for(name: &str) -> Backing {
    if name.contains('/') || name.starts_with('.') {
        Backing::File(PathBuf::from(name))
    } else {
        Backing::Object(format!("/{name}"))
    }
}

fn region_mode() -> Mode {
    Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP | Mode::ROTH
}

/// Handle to a mapped backing region
///
/// Dropping the handle unmaps it. The region itself persists until an
/// explicit [`ShmRegion::unlink`]; detaching never destroys shared state.
pub struct ShmRegion {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    name: String,
}

// SAFETY: ShmRegion can be shared between threads; all access to the mapped
// bytes is synchronized by the bus header/slot atomics layered on top.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create a new backing region of `size` bytes
    ///
    /// Fails with [`BusError::AlreadyExists`] if the name is taken. The fresh
    /// region is zero-filled by the kernel.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let backing = backing_for(name);
        if matches!(backing, Backing::Object(_)) && name.len() > MAX_NAME_LEN {
            return Err(BusError::NameTooLong {
                max: MAX_NAME_LEN,
                got: name.len(),
            });
        }

        let fd = match backing {
            Backing::Object(oname) => shm_open(
                oname.as_str(),
                ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
                region_mode(),
            ),
            Backing::File(path) => rustix::fs::open(
                &path,
                OFlags::RDWR | OFlags::CREATE | OFlags::EXCL,
                region_mode(),
            ),
        }
        .map_err(|e| {
            if e == Errno::EXIST {
                BusError::AlreadyExists {
                    name: name.to_string(),
                }
            } else {
                BusError::ShmCreate {
                    name: name.to_string(),
                    source: e.into(),
                }
            }
        })?;

        ftruncate(&fd, size as u64).map_err(|e| BusError::Truncate(e.into()))?;

        let addr = Self::map(&fd, size)?;
        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
        })
    }

    /// Open an existing backing region
    ///
    /// Fails with [`BusError::NotFound`] if no region of that name exists.
    pub fn open(name: &str) -> Result<Self> {
        let fd = match backing_for(name) {
            Backing::Object(oname) => shm_open(oname.as_str(), ShmOFlags::RDWR, Mode::empty()),
            Backing::File(path) => rustix::fs::open(&path, OFlags::RDWR, Mode::empty()),
        }
        .map_err(|e| {
            if e == Errno::NOENT {
                BusError::NotFound {
                    name: name.to_string(),
                }
            } else {
                BusError::ShmOpen {
                    name: name.to_string(),
                    source: e.into(),
                }
            }
        })?;

        let stat = rustix::fs::fstat(&fd).map_err(|e| BusError::ShmOpen {
            name: name.to_string(),
            source: e.into(),
        })?;
        let size = stat.st_size as usize;

        let addr = Self::map(&fd, size)?;
        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
        })
    }

    /// Remove the backing name
    ///
    /// Already-attached processes keep their mappings; the region is gone
    /// once the last of them detaches.
    pub fn unlink(name: &str) -> Result<()> {
        let res = match backing_for(name) {
            Backing::Object(oname) => shm_unlink(oname.as_str()),
            Backing::File(path) => rustix::fs::unlink(&path),
        };
        res.map_err(|e| {
            if e == Errno::NOENT {
                BusError::NotFound {
                    name: name.to_string(),
                }
            } else {
                BusError::Unlink {
                    name: name.to_string(),
                    source: e.into(),
                }
            }
        })
    }

    fn map(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )
            .map_err(|e| BusError::Mmap(e.into()))?
        };
        NonNull::new(addr.cast::<u8>()).ok_or_else(|| {
            BusError::Mmap(std::io::Error::new(
                std::io::ErrorKind::Other,
                "mmap returned null",
            ))
        })
    }

    /// Get raw pointer to the mapped region
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Get the mapped region base as a non-null pointer
    #[inline(always)]
    pub fn as_non_null(&self) -> NonNull<u8> {
        self.addr
    }

    /// Get size of the mapped region
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the region name
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // Detach only. The name stays linked for other processes.
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }
    }
}
