//! Mount-table scanning.
//!
//! Activation must happen before the mount a snapshot is meant to observe,
//! so `activate` refuses device paths that are currently listed as a mount
//! source in `/proc/self/mounts`.

use std::fs;
use std::io;
use std::path::Path;

const MOUNTS_PATH: &str = "/proc/self/mounts";

/// The mount source of one table row. Rows without at least source, mount
/// point and filesystem type are skipped. Octal escapes in the source are
/// left as-is; device paths with spaces cannot be registered anyway.
fn mount_source(line: &str) -> Option<&str> {
    let mut fields = line.split_ascii_whitespace();
    let source = fields.next()?;
    fields.next()?;
    fields.next()?;
    Some(source)
}

fn table_lists_source(table: &str, dev_path: &str) -> bool {
    table
        .lines()
        .filter_map(mount_source)
        .any(|source| source == dev_path)
}

/// True iff `dev_path` is the source of a currently mounted filesystem.
/// The path is canonicalised first so `/dev/../dev/loop0` matches; a path
/// that does not resolve cannot be mounted and is compared verbatim.
pub fn is_mount_source(dev_path: &Path) -> io::Result<bool> {
    let canonical = fs::canonicalize(dev_path).unwrap_or_else(|_| dev_path.to_path_buf());
    let table = match fs::read_to_string(MOUNTS_PATH) {
        Ok(t) => t,
        // Not a Linux-style proc: nothing can be mounted from our view.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    Ok(table_lists_source(&table, &canonical.to_string_lossy()))
}
