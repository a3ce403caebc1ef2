//! POSIX shared memory holding the resource [`Region`].
//!
//! The object is sized to exactly one `Region` and mapped `MAP_SHARED`, so every process
//! opening the same name works on the same list. Access is serialised twice: a mutex
//! between threads of this process (an `flock` is held per open file description, not per
//! thread) and an exclusive `flock` on the object between processes.

use std::ffi::CString;
use std::io;
use std::mem::{size_of, MaybeUninit};
use std::ops::{Deref, DerefMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::{self, NonNull};

use parking_lot::{Mutex, MutexGuard};

use super::region::{Region, REGION_MAGIC};

const REGION_LEN: usize = size_of::<Region>();

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul in region name"))
}

fn flock(fd: RawFd, operation: libc::c_int) -> io::Result<()> {
    loop {
        #[allow(unsafe_code)]
        let rc = unsafe { libc::flock(fd, operation) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn object_len(fd: RawFd) -> io::Result<i64> {
    let mut stat = MaybeUninit::<libc::stat>::uninit();
    #[allow(unsafe_code)]
    let rc = unsafe { libc::fstat(fd, stat.as_mut_ptr()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    #[allow(unsafe_code)]
    let stat = unsafe { stat.assume_init() };
    Ok(i64::from(stat.st_size))
}

/// Sizes, maps and if needed initialises the object. Called with the object locked.
#[allow(unsafe_code)]
fn map_region(fd: RawFd) -> io::Result<NonNull<Region>> {
    let len = object_len(fd)?;
    if len == 0 {
        let target = libc::off_t::try_from(REGION_LEN)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "region too large"))?;
        let rc = unsafe { libc::ftruncate(fd, target) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
    } else if usize::try_from(len).ok() != Some(REGION_LEN) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("region object is {len} bytes, expected {REGION_LEN}"),
        ));
    }

    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            REGION_LEN,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    let base = NonNull::new(addr.cast::<Region>())
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;

    // A fresh object is all zeroes; anything without the marker is rebuilt.
    let magic = unsafe { ptr::addr_of!((*base.as_ptr()).magic).read() };
    if magic != REGION_MAGIC {
        tracing::info!("initialize shared region");
        unsafe {
            base.as_ptr().write(Region::new());
        }
    }
    Ok(base)
}

/// One mapping of a named region object.
pub(crate) struct Mapping {
    base: NonNull<Region>,
    fd: OwnedFd,
    threads: Mutex<()>,
}

// SAFETY: the mapping is only dereferenced through `lock`, which holds both the thread
// mutex and the process lock for the lifetime of the returned guard.
#[allow(unsafe_code)]
unsafe impl Send for Mapping {}
#[allow(unsafe_code)]
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Opens the named object, creating and initialising it when it does not exist.
    pub(crate) fn open(name: &str) -> io::Result<Self> {
        let c_name = c_name(name)?;
        #[allow(unsafe_code)]
        let raw = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        #[allow(unsafe_code)]
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        flock(fd.as_raw_fd(), libc::LOCK_EX)?;
        let mapped = map_region(fd.as_raw_fd());
        if let Err(e) = flock(fd.as_raw_fd(), libc::LOCK_UN) {
            tracing::warn!(error = %e, "region unlock failed");
        }
        Ok(Self {
            base: mapped?,
            fd,
            threads: Mutex::new(()),
        })
    }

    /// Removes the name; existing mappings stay valid.
    pub(crate) fn unlink(name: &str) -> io::Result<()> {
        let c_name = c_name(name)?;
        #[allow(unsafe_code)]
        let rc = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Exclusive access to the region, against this and every other process.
    pub(crate) fn lock(&self) -> RegionGuard<'_> {
        let threads = self.threads.lock();
        let locked = match flock(self.fd.as_raw_fd(), libc::LOCK_EX) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "region lock failed");
                false
            }
        };
        RegionGuard {
            mapping: self,
            locked,
            _threads: threads,
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        #[allow(unsafe_code)]
        let rc = unsafe { libc::munmap(self.base.as_ptr().cast(), REGION_LEN) };
        if rc < 0 {
            tracing::warn!(error = %io::Error::last_os_error(), "region unmap failed");
        }
    }
}

/// Locked view of a mapped region; unlocks on drop.
pub(crate) struct RegionGuard<'a> {
    mapping: &'a Mapping,
    locked: bool,
    _threads: MutexGuard<'a, ()>,
}

impl Deref for RegionGuard<'_> {
    type Target = Region;

    #[allow(unsafe_code)]
    fn deref(&self) -> &Region {
        unsafe { &*self.mapping.base.as_ptr() }
    }
}

impl DerefMut for RegionGuard<'_> {
    #[allow(unsafe_code)]
    fn deref_mut(&mut self) -> &mut Region {
        unsafe { &mut *self.mapping.base.as_ptr() }
    }
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        if self.locked {
            if let Err(e) = flock(self.mapping.fd.as_raw_fd(), libc::LOCK_UN) {
                tracing::warn!(error = %e, "region unlock failed");
            }
        }
    }
}
