//! Device nodes opened for ioctl and memory mapping.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut, MmapOptions};
use tracing::debug;

use crate::buffer::{OffsetTable, Payload};
use crate::error::{IoctlError, Result};
use crate::marshal::Marshaller;

/// How a device node is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
    ReadOnly,
    #[default]
    ReadWrite,
}

/// How writable device memory is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapMode {
    /// Writes reach the device (`MAP_SHARED`).
    #[default]
    Shared,
    /// Writes stay in a private copy (`MAP_PRIVATE`).
    Private,
}

/// An open device file.
///
/// Owns the descriptor; the marshaller only borrows it for each call.
#[derive(Debug)]
pub struct DeviceFile {
    file: File,
    path: PathBuf,
}

impl DeviceFile {
    /// Open the device node at `path`.
    pub fn open<P: AsRef<Path>>(path: P, access: Access) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(access == Access::ReadWrite)
            .open(&path)?;
        debug!(path = %path.display(), fd = file.as_raw_fd(), ?access, "Opened device");
        Ok(Self { file, path })
    }

    /// Wrap an already open file.
    pub fn from_file(file: File, path: impl Into<PathBuf>) -> Self {
        Self {
            file,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// The POSIX descriptor handed to the kernel.
    pub fn posix_fd(&self) -> Result<RawFd> {
        let fd = self.file.as_raw_fd();
        if fd < 1 {
            return Err(IoctlError::InvalidDescriptor { fd });
        }
        Ok(fd)
    }

    /// Scalar ioctl on this device.
    ///
    /// # Safety
    ///
    /// See [`Marshaller::ioctl`].
    pub unsafe fn ioctl(&self, command: u64, value: i32) -> Result<i32> {
        Marshaller::new().ioctl(self.posix_fd()?, command, value)
    }

    /// Structured ioctl on this device.
    ///
    /// # Safety
    ///
    /// See [`Marshaller::ioctl_structured`].
    pub unsafe fn ioctl_structured(
        &self,
        command: u64,
        payload: Payload<'_>,
        offsets: OffsetTable<'_>,
    ) -> Result<i32> {
        Marshaller::new().ioctl_structured(self.posix_fd()?, command, payload, offsets)
    }

    /// Map `len` bytes of device memory starting at `offset`, readable and
    /// writable.
    ///
    /// Unlike `File`-based mapping helpers this never consults or truncates
    /// the file size, which device nodes usually report as zero. The mapping
    /// is released when dropped, and it can be passed to
    /// [`Payload::stable`] without staging.
    ///
    /// A shared mapping needs a device opened with [`Access::ReadWrite`];
    /// use [`DeviceFile::map_read_only`] otherwise.
    pub fn map(&self, len: usize, offset: u64, mode: MapMode) -> io::Result<MmapMut> {
        let mut options = MmapOptions::new();
        options.offset(offset).len(len);
        // Safety: device memory is not a file other processes truncate;
        // callers own the aliasing rules of the device they map.
        let map = unsafe {
            match mode {
                MapMode::Shared => options.map_mut(&self.file)?,
                MapMode::Private => options.map_copy(&self.file)?,
            }
        };
        debug!(path = %self.path.display(), len, offset, ?mode, "Mapped device memory");
        Ok(map)
    }

    /// Map `len` bytes of device memory starting at `offset` with read
    /// protection only. Works for either [`Access`] mode.
    pub fn map_read_only(&self, len: usize, offset: u64) -> io::Result<Mmap> {
        let mut options = MmapOptions::new();
        options.offset(offset).len(len);
        // Safety: as for `map`.
        let map = unsafe { options.map(&self.file)? };
        debug!(path = %self.path.display(), len, offset, "Mapped device memory read-only");
        Ok(map)
    }
}

impl AsRawFd for DeviceFile {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
