//! The block-IO request model the interception pipeline works on.
//!
//! A registered device is a block special file or a loop-backed image,
//! opened read/write; all offsets are counted in 512-byte sectors. A [`Bio`]
//! is one write intent against such a device: the open handle, the device
//! number, the starting sector and the payload split into page-sized
//! chunks, plus the mark-once flag that lets the request travel through the
//! interception probe twice.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Size of one sector in bytes. All sector arithmetic in the crate uses
/// this unit.
pub const SECTOR_SIZE: u64 = 512;

/// Largest payload chunk carried by a single bio page.
pub const PAGE_SIZE: usize = 4096;

/// Identifies a block device by its `(major, minor)` pair.
///
/// Regular files (unbound loop images) synthesise an id from the inode so
/// they can take part in a session before any loop device is attached.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DeviceId {
    major: u32,
    minor: u32,
}

impl DeviceId {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Reads the device number of `path`.
    ///
    /// For block and character special files this is `st_rdev`; for a
    /// regular file the containing device and inode are folded together
    /// instead, which keeps ids unique within one host.
    pub fn of_path(path: &Path) -> io::Result<Self> {
        let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
        // SAFETY: cpath is NUL-terminated and st points to enough space for
        // a stat record; stat() fully initializes it on success.
        let ret = unsafe { libc::stat(cpath.as_ptr(), st.as_mut_ptr()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        let st = unsafe { st.assume_init() };
        let mode = st.st_mode & libc::S_IFMT;
        if mode == libc::S_IFBLK || mode == libc::S_IFCHR {
            Ok(Self::new(libc::major(st.st_rdev), libc::minor(st.st_rdev)))
        } else {
            Ok(Self::new(st.st_dev as u32, st.st_ino as u32))
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// A half-open range of sectors `[start, end)`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SectorRange {
    pub start: u64,
    pub end: u64,
}

impl SectorRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn sectors(&self) -> u64 {
        self.end - self.start
    }
}

/// An open block device or image file, addressed by sector.
pub struct BlockFile {
    file: File,
}

impl BlockFile {
    /// Opens `path` for reading and writing.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    /// Reads exactly `buf.len()` bytes starting at `sector`.
    pub fn read_at_sector(&self, sector: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, sector * SECTOR_SIZE)
    }

    /// Writes the whole of `buf` starting at `sector`.
    pub fn write_at_sector(&self, sector: u64, buf: &[u8]) -> io::Result<()> {
        self.file.write_all_at(buf, sector * SECTOR_SIZE)
    }
}

/// Operation carried by a bio.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BioOp {
    Read,
    Write,
}

/// One block-IO request.
pub struct Bio {
    disk: Arc<BlockFile>,
    dev: DeviceId,
    op: BioOp,
    sector: u64,
    pages: Vec<Vec<u8>>,
    marked: AtomicBool,
}

impl Bio {
    /// Builds a write request, splitting `payload` into page-sized chunks.
    pub fn write(disk: Arc<BlockFile>, dev: DeviceId, sector: u64, payload: &[u8]) -> Arc<Self> {
        Self::new(disk, dev, BioOp::Write, sector, payload)
    }

    /// Builds a read request over `nbytes` bytes. The probe only watches
    /// writes; reads always pass through.
    pub fn read(disk: Arc<BlockFile>, dev: DeviceId, sector: u64, nbytes: usize) -> Arc<Self> {
        Self::new(disk, dev, BioOp::Read, sector, &vec![0u8; nbytes])
    }

    fn new(
        disk: Arc<BlockFile>,
        dev: DeviceId,
        op: BioOp,
        sector: u64,
        payload: &[u8],
    ) -> Arc<Self> {
        let pages = payload.chunks(PAGE_SIZE).map(<[u8]>::to_vec).collect();
        Arc::new(Self {
            disk,
            dev,
            op,
            sector,
            pages,
            marked: AtomicBool::new(false),
        })
    }

    pub fn dev(&self) -> DeviceId {
        self.dev
    }

    pub fn disk(&self) -> &Arc<BlockFile> {
        &self.disk
    }

    pub fn sector(&self) -> u64 {
        self.sector
    }

    pub fn is_write(&self) -> bool {
        self.op == BioOp::Write
    }

    /// Total payload size in bytes.
    pub fn len_bytes(&self) -> usize {
        self.pages.iter().map(Vec::len).sum()
    }

    /// Empty writes exist; they are sent as write barriers.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty() || self.len_bytes() == 0
    }

    /// The sector span hit by this request, payload length rounded up to
    /// whole sectors.
    pub fn range(&self) -> SectorRange {
        let n = (self.len_bytes() as u64).div_ceil(SECTOR_SIZE);
        SectorRange::new(self.sector, self.sector + n)
    }

    pub fn pages(&self) -> &[Vec<u8>] {
        &self.pages
    }

    /// Toggles the mark-once flag. Returns `true` when the bio had already
    /// been intercepted (flag was set and is now cleared), `false` when
    /// this is the first encounter (flag is now set).
    ///
    /// The flag is what lets a request pass through the probe twice: once
    /// when it gets diverted, once when the engine resubmits it for real.
    pub fn toggle_mark(&self) -> bool {
        self.marked.fetch_xor(true, Ordering::AcqRel)
    }

    /// Applies the write downstream, page by page.
    pub fn apply(&self) -> io::Result<()> {
        let mut offset = self.sector * SECTOR_SIZE;
        for page in &self.pages {
            self.disk.file.write_all_at(page, offset)?;
            offset += page.len() as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn payload_is_split_into_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        std::fs::write(&path, vec![0u8; 16384]).unwrap();
        let disk = Arc::new(BlockFile::open(&path).unwrap());
        let bio = Bio::write(disk, DeviceId::new(7, 0), 2, &vec![0xAB; PAGE_SIZE + 512]);
        assert_eq!(bio.pages().len(), 2);
        assert_eq!(bio.pages()[0].len(), PAGE_SIZE);
        assert_eq!(bio.pages()[1].len(), 512);
        assert_eq!(bio.range(), SectorRange::new(2, 11));
    }

    #[test]
    pub fn mark_toggles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        let disk = Arc::new(BlockFile::open(&path).unwrap());
        let bio = Bio::write(disk, DeviceId::new(7, 0), 0, &[1, 2, 3]);
        assert!(!bio.toggle_mark());
        assert!(bio.toggle_mark());
        assert!(!bio.toggle_mark());
    }

    #[test]
    pub fn apply_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        let disk = Arc::new(BlockFile::open(&path).unwrap());
        let bio = Bio::write(disk.clone(), DeviceId::new(7, 0), 1, &[9u8; 512]);
        bio.apply().unwrap();
        let mut buf = [0u8; 512];
        disk.read_at_sector(1, &mut buf).unwrap();
        assert_eq!(buf, [9u8; 512]);
    }

    #[test]
    pub fn device_id_of_regular_file_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        std::fs::write(&path, b"x").unwrap();
        let a = DeviceId::of_path(&path).unwrap();
        let b = DeviceId::of_path(&path).unwrap();
        assert_eq!(a, b);
    }
}
