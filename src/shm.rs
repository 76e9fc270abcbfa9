//! Low-level POSIX shared memory operations

use crate::error::{ChannelError, Result};
use rustix::fd::OwnedFd;
use rustix::fs::{fstat, ftruncate};
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ptr::NonNull;
use tracing::{debug, warn};

/// Longest name accepted by the OS shm namespace, excluding the leading '/'
pub const MAX_NAME_LEN: usize = 255;

/// Turn a user-supplied channel name into the form `shm_open` expects.
///
/// A leading '/' is optional. The remainder must be non-empty, must not
/// contain another '/' or a NUL byte, and must fit in `MAX_NAME_LEN`.
pub fn os_name(name: &str) -> Result<String> {
    let bare = name.strip_prefix('/').unwrap_or(name);

    if bare.is_empty() {
        return Err(ChannelError::InvalidName {
            name: name.to_string(),
            reason: "name is empty",
        });
    }
    if bare.contains('/') {
        return Err(ChannelError::InvalidName {
            name: name.to_string(),
            reason: "name may only contain a leading '/'",
        });
    }
    if bare.contains('\0') {
        return Err(ChannelError::InvalidName {
            name: name.to_string(),
            reason: "name contains a NUL byte",
        });
    }
    if bare.len() > MAX_NAME_LEN {
        return Err(ChannelError::NameTooLong {
            max: MAX_NAME_LEN,
            got: bare.len(),
        });
    }

    Ok(format!("/{}", bare))
}

/// Handle to one mapping of a named shared memory object
///
/// The handle is not `Clone`: each value owns exactly one mapping and one
/// descriptor. Moving the handle does not move the mapped memory.
pub struct ShmRegion {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: Option<NonNull<u8>>,
    size: usize,
    name: String,
    is_owner: bool,
}

// SAFETY: the region is plain memory; access to its contents is synchronized
// by the process-shared primitives stored inside it.
unsafe impl Send for ShmRegion {}

impl ShmRegion {
    /// Create a fresh shared memory object, size it and map it
    ///
    /// Fails if an object with the same name already exists, unless
    /// `replace_stale` is set, in which case the old name is unlinked first.
    pub fn create(name: &str, size: usize, mode: u32, replace_stale: bool) -> Result<Self> {
        let full_name = os_name(name)?;

        if replace_stale {
            match shm_unlink(full_name.as_str()) {
                Ok(()) => warn!(name = %full_name, "removed stale shared memory object"),
                Err(Errno::NOENT) => {}
                Err(e) => {
                    return Err(ChannelError::ShmCreate {
                        name: full_name,
                        source: e.into(),
                    })
                }
            }
        }

        let fd = shm_open(
            full_name.as_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::from_bits_truncate(mode),
        )
        .map_err(|e| ChannelError::ShmCreate {
            name: full_name.clone(),
            source: e.into(),
        })?;

        // From here on the name exists; remove it again if we cannot finish.
        let mapped = ftruncate(&fd, size as u64)
            .map_err(|e| ChannelError::Truncate(e.into()))
            .and_then(|()| map_shared(&fd, size));

        let addr = match mapped {
            Ok(addr) => addr,
            Err(e) => {
                let _ = shm_unlink(full_name.as_str());
                return Err(e);
            }
        };

        // Fresh objects read as zero already; keep it explicit.
        unsafe {
            std::ptr::write_bytes(addr.as_ptr(), 0, size);
        }

        debug!(name = %full_name, size, "shared memory created");

        Ok(Self {
            fd,
            addr: Some(addr),
            size,
            name: full_name,
            is_owner: true,
        })
    }

    /// Open an existing shared memory object and map `size` bytes of it
    ///
    /// Never creates or resizes the object.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        let full_name = os_name(name)?;

        let fd = shm_open(full_name.as_str(), ShmOFlags::RDWR, Mode::empty()).map_err(|e| {
            ChannelError::ShmOpen {
                name: full_name.clone(),
                source: e.into(),
            }
        })?;

        let stat = fstat(&fd).map_err(|e| ChannelError::ShmOpen {
            name: full_name.clone(),
            source: e.into(),
        })?;
        let actual = usize::try_from(stat.st_size).unwrap_or(0);
        if actual < size {
            return Err(ChannelError::SizeMismatch {
                expected: size,
                actual,
            });
        }

        let addr = map_shared(&fd, size)?;

        debug!(name = %full_name, size, "shared memory opened");

        Ok(Self {
            fd,
            addr: Some(addr),
            size,
            name: full_name,
            is_owner: false,
        })
    }

    /// Remove a shared memory name
    ///
    /// Returns `Ok(false)` when the name was already absent.
    pub fn unlink(name: &str) -> Result<bool> {
        let full_name = os_name(name)?;
        match shm_unlink(full_name.as_str()) {
            Ok(()) => Ok(true),
            Err(Errno::NOENT) => Ok(false),
            Err(e) => Err(ChannelError::ShmUnlink {
                name: full_name,
                source: e.into(),
            }),
        }
    }

    /// Get raw pointer to shared memory
    ///
    /// Null once the region has been unmapped.
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.map_or(std::ptr::null_mut(), |addr| addr.as_ptr())
    }

    /// Get size of the mapping
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the OS name of the shared memory, including the leading '/'
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if this handle created the shared memory
    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    /// Unmap the region and close the descriptor, reporting an unmap failure
    pub fn close(mut self) -> Result<()> {
        self.unmap()
    }

    fn unmap(&mut self) -> Result<()> {
        match self.addr.take() {
            Some(addr) => unsafe {
                munmap(addr.as_ptr().cast(), self.size).map_err(|e| ChannelError::Munmap(e.into()))
            },
            None => Ok(()),
        }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if let Err(e) = self.unmap() {
            warn!(name = %self.name, error = %e, "unmap failed");
        }
    }
}

fn map_shared(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
        .map_err(|e| ChannelError::Mmap(e.into()))?
    };

    NonNull::new(addr.cast::<u8>()).ok_or_else(|| {
        ChannelError::Mmap(std::io::Error::new(
            std::io::ErrorKind::Other,
            "mmap returned null",
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("rdv_shm_{}_{}", tag, std::process::id())
    }

    #[test]
    fn test_os_name() {
        assert_eq!(os_name("chan").unwrap(), "/chan");
        assert_eq!(os_name("/chan").unwrap(), "/chan");

        assert!(matches!(os_name(""), Err(ChannelError::InvalidName { .. })));
        assert!(matches!(os_name("/"), Err(ChannelError::InvalidName { .. })));
        assert!(matches!(os_name("a/b"), Err(ChannelError::InvalidName { .. })));
        assert!(matches!(os_name("a\0b"), Err(ChannelError::InvalidName { .. })));

        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(os_name(&long), Err(ChannelError::NameTooLong { max: MAX_NAME_LEN, .. })));
    }

    #[test]
    fn test_create_and_open() {
        let name = unique("create_open");
        let size = 4096;

        let shm1 = ShmRegion::create(&name, size, 0o600, false).unwrap();
        assert!(shm1.is_owner());
        assert_eq!(shm1.size(), size);
        assert_eq!(shm1.name(), format!("/{}", name));

        unsafe {
            std::ptr::write(shm1.as_ptr(), 42u8);
        }

        let shm2 = ShmRegion::open(&name, size).unwrap();
        assert!(!shm2.is_owner());

        let val = unsafe { std::ptr::read(shm2.as_ptr()) };
        assert_eq!(val, 42u8);

        shm2.close().unwrap();
        shm1.close().unwrap();
        assert!(ShmRegion::unlink(&name).unwrap());
    }

    #[test]
    fn test_create_is_exclusive() {
        let name = unique("exclusive");

        let first = ShmRegion::create(&name, 4096, 0o600, false).unwrap();
        let second = ShmRegion::create(&name, 4096, 0o600, false);
        assert!(matches!(second, Err(ChannelError::ShmCreate { .. })));

        // A stale object can be replaced on request.
        let replaced = ShmRegion::create(&name, 4096, 0o600, true).unwrap();

        drop(first);
        drop(replaced);
        ShmRegion::unlink(&name).unwrap();
    }

    #[test]
    fn test_open_missing_and_too_small() {
        let name = unique("missing");
        assert!(matches!(ShmRegion::open(&name, 64), Err(ChannelError::ShmOpen { .. })));

        let small = ShmRegion::create(&name, 64, 0o600, false).unwrap();
        assert!(matches!(
            ShmRegion::open(&name, 4096),
            Err(ChannelError::SizeMismatch { expected: 4096, actual: 64 })
        ));

        drop(small);
        ShmRegion::unlink(&name).unwrap();
    }

    #[test]
    fn test_unlink_is_idempotent() {
        let name = unique("unlink");
        let shm = ShmRegion::create(&name, 128, 0o600, false).unwrap();
        drop(shm);

        assert!(ShmRegion::unlink(&name).unwrap());
        assert!(!ShmRegion::unlink(&name).unwrap());
        assert!(!ShmRegion::unlink(&name).unwrap());
    }
}
