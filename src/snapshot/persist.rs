//! On-disk layout of captured blocks.
//!
//! Every session owns one directory under the snapshots root, named after
//! the tail of the device path and the session creation time. Inside it, a
//! single append-only `data` file holds a sequence of frames:
//!
//! ```text
//! frame := header { sector: u64 LE, nbytes: u64 LE } || payload
//! ```

use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::debug;
use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

/// Name of the per-session capture file.
pub const DATA_FILE: &str = "data";

/// Size of an encoded frame header.
pub const FRAME_HEADER_SIZE: usize = 16;

const DIR_MODE: u32 = 0o755;
const DATA_MODE: u32 = 0o600;

const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'_>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]");

/// The last `n` bytes of `path`, or the whole final component when that
/// component is shorter than `n`. A path ending in `/` is rejected, and so
/// is a cut that would split a multi-byte character.
fn tail(path: &str, n: usize) -> Option<&str> {
    let n = n.min(path.len());
    match path.rfind('/') {
        Some(pos) if pos + 1 == path.len() => None,
        Some(pos) if path.len() - (pos + 1) < n => Some(&path[pos + 1..]),
        _ => path.get(path.len() - n..),
    }
}

fn format_timestamp(wall: SystemTime) -> String {
    let odt = OffsetDateTime::from(wall);
    // The format string has no fallible component.
    odt.format(&TIMESTAMP_FORMAT)
        .unwrap_or_else(|_| String::from("0000-00-00T00:00:00.000000000"))
}

/// Derives the session directory name:
/// `tail(dev_path, prefix_len) || ISO-8601 timestamp with nanoseconds`.
pub fn session_dirname(dev_path: &str, wall: SystemTime, prefix_len: usize) -> Option<String> {
    let prefix = tail(dev_path, prefix_len)?;
    Some(format!("{prefix}{}", format_timestamp(wall)))
}

fn mkdir(path: &Path) -> io::Result<()> {
    match DirBuilder::new().mode(DIR_MODE).create(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            debug!("directory {} already exists", path.display());
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Creates the snapshots root, mode 0755. An existing root is accepted.
pub fn mkdir_root(root: &Path) -> io::Result<()> {
    mkdir(root)
}

/// Creates `<root>/<dirname>`, mode 0755, and returns its path. An
/// existing directory is accepted.
pub fn mkdir_session(root: &Path, dirname: &str) -> io::Result<PathBuf> {
    let dir = root.join(dirname);
    mkdir(&dir)?;
    Ok(dir)
}

/// Creates the `data` file inside a session directory: mode 0600,
/// append-only, and exclusive, so a second creator fails with
/// `AlreadyExists` instead of sharing the handle.
pub fn create_data_file(dir: &Path) -> io::Result<File> {
    OpenOptions::new()
        .append(true)
        .create_new(true)
        .mode(DATA_MODE)
        .open(dir.join(DATA_FILE))
}

/// Encodes one frame header.
pub fn encode_header(sector: u64, nbytes: u64) -> [u8; FRAME_HEADER_SIZE] {
    let mut buf = [0u8; FRAME_HEADER_SIZE];
    buf[..8].copy_from_slice(&sector.to_le_bytes());
    buf[8..].copy_from_slice(&nbytes.to_le_bytes());
    buf
}

/// Walks the frames of a `data` file.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads the next frame, `None` at end of file. A file truncated in
    /// the middle of a frame yields `UnexpectedEof`.
    pub fn next_frame(&mut self) -> io::Result<Option<(u64, Vec<u8>)>> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        match self.inner.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let sector = u64::from_le_bytes(header[..8].try_into().unwrap());
        let nbytes = u64::from_le_bytes(header[8..].try_into().unwrap());
        let mut payload = vec![0u8; nbytes as usize];
        self.inner.read_exact(&mut payload)?;
        Ok(Some((sector, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    pub fn tail_prefers_short_basenames() {
        assert_eq!(tail("/dev/loop0", 12), Some("loop0"));
        assert_eq!(tail("/dev/mapper/very-long-volume-name", 12), Some("-volume-name"));
        assert_eq!(tail("loop0", 12), Some("loop0"));
        assert_eq!(tail("/dev/", 12), None);
    }

    #[test]
    pub fn dirname_carries_nanosecond_timestamp() {
        let wall = SystemTime::UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789);
        let name = session_dirname("/dev/loop0", wall, 12).unwrap();
        assert_eq!(name, "loop02023-11-14T22:13:20.123456789");
    }

    #[test]
    pub fn data_file_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let session = mkdir_session(dir.path(), "s").unwrap();
        let _f = create_data_file(&session).unwrap();
        let err = create_data_file(&session).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    pub fn mkdir_session_accepts_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        mkdir_root(dir.path()).unwrap();
        let a = mkdir_session(dir.path(), "s").unwrap();
        let b = mkdir_session(dir.path(), "s").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    pub fn frame_round_trip() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&encode_header(100, 8));
        bytes.extend_from_slice(&[0xAAu8; 8]);
        bytes.extend_from_slice(&encode_header(9, 4));
        bytes.extend_from_slice(&[1, 2, 3, 4]);

        let mut frames = FrameReader::new(&bytes[..]);
        let (sector, payload) = frames.next_frame().unwrap().unwrap();
        assert_eq!((sector, payload.len()), (100, 8));
        assert_eq!(payload, [0xAAu8; 8]);
        let (sector, payload) = frames.next_frame().unwrap().unwrap();
        assert_eq!((sector, payload), (9, vec![1, 2, 3, 4]));
        assert!(frames.next_frame().unwrap().is_none());
    }

    #[test]
    pub fn truncated_frame_is_detected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&encode_header(0, 512));
        bytes.extend_from_slice(&[0u8; 100]);
        let mut frames = FrameReader::new(&bytes[..]);
        let err = frames.next_frame().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
