//! Engine configuration.

use std::path::PathBuf;

/// Default root of the on-disk capture tree.
pub const DEFAULT_ROOT: &str = "/snapshots";

/// How many characters of the device path prefix a session directory name,
/// by default. Valid values are clamped to 8..=16.
pub const DEFAULT_DIRNAME_PREFIX_LEN: usize = 12;

/// Tunables of a snapshot [`Engine`](crate::Engine).
///
/// The defaults match the module parameters of the in-kernel deployment;
/// tests usually relocate `snapshots_root` into a scratch directory.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory that holds one subdirectory per capture session.
    pub snapshots_root: PathBuf,
    /// Number of device-path characters used as the session directory name
    /// prefix.
    pub dirname_prefix_len: usize,
    /// Worker threads draining the capture queue.
    pub capture_workers: usize,
    /// Worker threads draining the per-block persistence queue.
    pub block_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            snapshots_root: PathBuf::from(DEFAULT_ROOT),
            dirname_prefix_len: DEFAULT_DIRNAME_PREFIX_LEN,
            capture_workers: 2,
            block_workers: 2,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relocates the capture tree.
    pub fn snapshots_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.snapshots_root = root.into();
        self
    }

    pub fn dirname_prefix_len(mut self, n: usize) -> Self {
        self.dirname_prefix_len = n.clamp(8, 16);
        self
    }

    pub fn capture_workers(mut self, n: usize) -> Self {
        self.capture_workers = n.max(1);
        self
    }

    pub fn block_workers(mut self, n: usize) -> Self {
        self.block_workers = n.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn prefix_len_is_clamped() {
        assert_eq!(Config::new().dirname_prefix_len(4).dirname_prefix_len, 8);
        assert_eq!(Config::new().dirname_prefix_len(40).dirname_prefix_len, 16);
        assert_eq!(Config::new().dirname_prefix_len(10).dirname_prefix_len, 10);
    }
}
