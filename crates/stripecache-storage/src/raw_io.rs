//! Positioned device I/O
//!
//! Provides byte-range access to a raw block device or a regular file:
//! - Positioned reads and writes (`pread`/`pwrite`)
//! - Optional direct I/O (`O_DIRECT` on Linux)
//! - Device geometry (total size, logical block size)
//!
//! Write access is part of the handle's type. A `Device<ReadOnly>` has no
//! write methods at all, so a read-only run cannot touch the disk.

use stripecache_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Buffer alignment used for direct I/O transfers
pub const ALIGNMENT: usize = 4096;

/// Default logical block size for regular files
pub const DEFAULT_HW_SECTOR_SIZE: u32 = 512;

mod sealed {
    pub trait Sealed {}
}

/// Access mode of a device handle
pub trait Access: sealed::Sealed + Send + Sync + 'static {
    /// Whether the handle was opened for writing
    const WRITABLE: bool;
}

/// Read-only access (the default)
#[derive(Debug, Clone, Copy)]
pub struct ReadOnly;

/// Read-write access
#[derive(Debug, Clone, Copy)]
pub struct ReadWrite;

impl sealed::Sealed for ReadOnly {}
impl sealed::Sealed for ReadWrite {}

impl Access for ReadOnly {
    const WRITABLE: bool = false;
}

impl Access for ReadWrite {
    const WRITABLE: bool = true;
}

/// Device geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Total size in bytes
    pub total_size: u64,
    /// Logical block (sector) size in bytes
    pub block_size: u32,
    /// Whether the path is a block device
    pub is_block_device: bool,
}

/// Open options for a device
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceOptions {
    /// Bypass the page cache
    pub direct_io: bool,
}

/// Handle to an open device
pub struct Device<A: Access = ReadOnly> {
    file: File,
    path: PathBuf,
    geometry: Geometry,
    direct_io: bool,
    _access: PhantomData<A>,
}

impl<A: Access> std::fmt::Debug for Device<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("path", &self.path)
            .field("geometry", &self.geometry)
            .field("writable", &A::WRITABLE)
            .finish()
    }
}

impl<A: Access> Device<A> {
    /// Open a device or file
    pub fn open(path: impl AsRef<Path>, options: DeviceOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut open = OpenOptions::new();
        open.read(true);
        if A::WRITABLE {
            open.write(true);
        }

        #[cfg(target_os = "linux")]
        if options.direct_io {
            open.custom_flags(libc::O_DIRECT);
        }

        let file = open
            .open(&path)
            .map_err(|e| Error::device(&path, "open", e))?;

        let metadata = file
            .metadata()
            .map_err(|e| Error::device(&path, "stat", e))?;
        let is_block_device = Self::is_block_device(&metadata);

        let geometry = if is_block_device {
            Geometry {
                total_size: Self::block_device_size(&file, &path)?,
                block_size: Self::block_device_sector_size(&file, &path)?,
                is_block_device,
            }
        } else if metadata.is_file() {
            Geometry {
                total_size: metadata.len(),
                block_size: DEFAULT_HW_SECTOR_SIZE,
                is_block_device,
            }
        } else {
            return Err(Error::UnsupportedDevice(format!(
                "{} is not a regular file or block device",
                path.display()
            )));
        };

        Ok(Self {
            file,
            path,
            geometry,
            direct_io: options.direct_io,
            _access: PhantomData,
        })
    }

    fn is_block_device(metadata: &std::fs::Metadata) -> bool {
        use std::os::unix::fs::FileTypeExt;
        let ft = metadata.file_type();
        ft.is_block_device() || ft.is_char_device()
    }

    /// Get block device size using ioctl
    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn block_device_size(file: &File, path: &Path) -> Result<u64> {
        use std::os::unix::io::AsRawFd;

        // BLKGETSIZE64 ioctl
        const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

        let mut size: u64 = 0;
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
        if ret == -1 {
            return Err(Error::device(
                path,
                "get block device size",
                std::io::Error::last_os_error(),
            ));
        }
        Ok(size)
    }

    /// Get logical sector size using ioctl
    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn block_device_sector_size(file: &File, path: &Path) -> Result<u32> {
        use std::os::unix::io::AsRawFd;

        // BLKSSZGET ioctl
        const BLKSSZGET: libc::c_ulong = 0x1268;

        let mut size: libc::c_int = 0;
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKSSZGET, &mut size) };
        if ret == -1 || size <= 0 {
            return Err(Error::device(
                path,
                "get block device sector size",
                std::io::Error::last_os_error(),
            ));
        }
        Ok(size.unsigned_abs())
    }

    /// Get block device size (non-Linux fallback)
    #[cfg(not(target_os = "linux"))]
    fn block_device_size(file: &File, path: &Path) -> Result<u64> {
        use std::io::{Seek, SeekFrom};
        let mut f = file;
        let size = f
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::device(path, "seek to end", e))?;
        f.seek(SeekFrom::Start(0))
            .map_err(|e| Error::device(path, "seek to start", e))?;
        Ok(size)
    }

    #[cfg(not(target_os = "linux"))]
    fn block_device_sector_size(_file: &File, _path: &Path) -> Result<u32> {
        Ok(DEFAULT_HW_SECTOR_SIZE)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub const fn size(&self) -> u64 {
        self.geometry.total_size
    }

    pub const fn is_writable(&self) -> bool {
        A::WRITABLE
    }

    /// Read up to `buf.len()` bytes at `offset`, returning the count read.
    /// A short count means end of device.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_alignment(offset, buf.len())?;
        let mut done = 0;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(Error::device(&self.path, format!("read at {offset}"), e));
                }
            }
        }
        Ok(done)
    }

    /// Read exactly `buf.len()` bytes at `offset`
    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let n = self.read_at(offset, buf)?;
        if n < buf.len() {
            return Err(Error::ShortTransfer {
                op: "read",
                path: self.path.clone(),
                offset,
                requested: buf.len(),
                transferred: n,
            });
        }
        Ok(())
    }

    /// Check alignment requirements for direct I/O
    fn check_alignment(&self, offset: u64, size: usize) -> Result<()> {
        if !self.direct_io {
            return Ok(());
        }
        let align = u64::from(self.geometry.block_size);
        if offset % align != 0 || size as u64 % align != 0 {
            return Err(Error::Misaligned {
                path: self.path.clone(),
                offset,
                size,
                alignment: align,
            });
        }
        Ok(())
    }
}

impl Device<ReadWrite> {
    /// Write all of `buf` at `offset`
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_alignment(offset, buf.len())?;
        let mut done = 0;
        while done < buf.len() {
            match self.file.write_at(&buf[done..], offset + done as u64) {
                Ok(0) => {
                    return Err(Error::ShortTransfer {
                        op: "write",
                        path: self.path.clone(),
                        offset,
                        requested: buf.len(),
                        transferred: done,
                    });
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(Error::device(
                        &self.path,
                        format!("write at {offset} ({done} of {} bytes written)", buf.len()),
                        e,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Sync data to disk
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| Error::device(&self.path, "sync", e))
    }
}

/// Aligned buffer for direct I/O operations
///
/// Over-allocates and exposes an aligned window into the allocation, so
/// no manual allocator calls are needed.
#[derive(Debug, Clone)]
pub struct AlignedBuffer {
    data: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedBuffer {
    /// Create a new zeroed buffer of `size` bytes aligned to `ALIGNMENT`
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self::with_alignment(size, ALIGNMENT)
    }

    /// Create a new zeroed buffer with custom alignment
    #[must_use]
    pub fn with_alignment(size: usize, alignment: usize) -> Self {
        let data = vec![0u8; size + alignment];
        let start = data.as_ptr().align_offset(alignment).min(alignment);
        Self {
            data,
            start,
            len: size,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.start..self.start + self.len]
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy data into the buffer (pads with zeros if source is smaller)
    pub fn copy_from(&mut self, src: &[u8]) {
        let dst = self.as_mut_slice();
        let copy_len = src.len().min(dst.len());
        dst[..copy_len].copy_from_slice(&src[..copy_len]);
        dst[copy_len..].fill(0);
    }
}

impl Default for AlignedBuffer {
    fn default() -> Self {
        Self::new(ALIGNMENT)
    }
}

impl AsRef<[u8]> for AlignedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for AlignedBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_aligned_buffer() {
        let mut buf = AlignedBuffer::new(4096);
        assert_eq!(buf.len(), 4096);
        assert_eq!(buf.as_slice().as_ptr() as usize % ALIGNMENT, 0);

        buf.copy_from(b"hello");
        assert_eq!(&buf.as_slice()[..5], b"hello");
        assert!(buf.as_slice()[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_device_write_and_read() {
        let temp = NamedTempFile::new().unwrap();
        temp.as_file().set_len(64 * 1024).unwrap();

        {
            let dev = Device::<ReadWrite>::open(temp.path(), DeviceOptions::default()).unwrap();
            assert!(dev.is_writable());
            assert_eq!(dev.size(), 64 * 1024);
            assert_eq!(dev.geometry().block_size, DEFAULT_HW_SECTOR_SIZE);
            dev.write_at(8192, b"test data pattern").unwrap();
            dev.sync().unwrap();
        }

        let dev = Device::<ReadOnly>::open(temp.path(), DeviceOptions::default()).unwrap();
        assert!(!dev.is_writable());
        let mut buf = [0u8; 17];
        dev.read_exact_at(8192, &mut buf).unwrap();
        assert_eq!(&buf, b"test data pattern");
    }

    #[test]
    fn test_short_read_at_end() {
        let temp = NamedTempFile::new().unwrap();
        temp.as_file().set_len(100).unwrap();
        let dev = Device::<ReadOnly>::open(temp.path(), DeviceOptions::default()).unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(dev.read_at(80, &mut buf).unwrap(), 20);
        let err = dev.read_exact_at(80, &mut buf).unwrap_err();
        assert!(err.is_device());
    }

    #[test]
    fn test_open_missing_is_device_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Device::<ReadOnly>::open(dir.path().join("nope"), DeviceOptions::default())
            .unwrap_err();
        assert!(err.is_device());
    }

    #[test]
    fn test_directory_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let err = Device::<ReadOnly>::open(dir.path(), DeviceOptions::default()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedDevice(_)));
    }
}
