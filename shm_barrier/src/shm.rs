//! Named shared memory on `/dev/shm`.

use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink};
use nix::sys::stat::{Mode, fstat};
use nix::unistd::{close, ftruncate};
use std::ffi::CString;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::ptr::NonNull;

/// A mapping of a named shared memory object.
///
/// Dropping the mapping unmaps it but never unlinks the name; the object
/// outlives every process that maps it until [`SharedMemory::unlink`].
pub struct SharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    fd: RawFd,
}

unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Create (or reuse) the object `path`, size it to `size` bytes and map it.
    ///
    /// Contents of a freshly created object are zero. An existing object is
    /// resized and mapped as is; the caller reinitialises it.
    pub fn create<P: AsRef<Path>>(path: P, size: usize) -> io::Result<Self> {
        let name = path_to_cstring(path)?;
        let size = non_zero(size)?;

        let fd = shm_open(
            name.as_c_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(errno)?;

        if let Err(e) = ftruncate(&fd, size.get() as i64) {
            let _ = shm_unlink(name.as_c_str());
            return Err(errno(e));
        }

        Self::map(fd, size)
    }

    /// Map the existing object `path`.
    ///
    /// Fails with `InvalidData` if the object is smaller than `size`.
    pub fn open<P: AsRef<Path>>(path: P, size: usize) -> io::Result<Self> {
        let name = path_to_cstring(path)?;
        let size = non_zero(size)?;

        let fd = shm_open(name.as_c_str(), OFlag::O_RDWR, Mode::empty()).map_err(errno)?;

        let stat = fstat(fd.as_raw_fd()).map_err(errno)?;
        if (stat.st_size as u64) < size.get() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "shared memory object holds {} bytes, expected {}",
                    stat.st_size,
                    size.get()
                ),
            ));
        }

        Self::map(fd, size)
    }

    fn map(fd: OwnedFd, size: NonZeroUsize) -> io::Result<Self> {
        let ptr = unsafe {
            mmap(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }
        .map_err(errno)?;

        Ok(Self {
            ptr: ptr.cast(),
            size: size.get(),
            fd: fd.into_raw_fd(),
        })
    }

    /// Remove the name `path`. Existing mappings stay valid.
    pub fn unlink<P: AsRef<Path>>(path: P) -> io::Result<()> {
        let name = path_to_cstring(path)?;
        shm_unlink(name.as_c_str()).map_err(errno)
    }

    /// Returns a pointer to the start of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Returns the size of the mapping.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Unmap and close, reporting failures instead of ignoring them.
    pub fn close(self) -> io::Result<()> {
        let this = std::mem::ManuallyDrop::new(self);
        let unmapped = unsafe { munmap(this.ptr.cast(), this.size) };
        unmapped.map_err(errno)?;
        close(this.fd).map_err(errno)
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), self.size);
        }
        let _ = close(self.fd);
    }
}

fn errno(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn non_zero(size: usize) -> io::Result<NonZeroUsize> {
    NonZeroUsize::new(size)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "size must be non-zero"))
}

fn path_to_cstring<P: AsRef<Path>>(path: P) -> io::Result<CString> {
    let path_str = path.as_ref().to_str().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path contains invalid UTF-8")
    })?;

    // Ensure the path starts with /
    let name = if path_str.starts_with('/') {
        path_str.to_string()
    } else {
        format!("/{}", path_str)
    };

    CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains null byte"))
}
