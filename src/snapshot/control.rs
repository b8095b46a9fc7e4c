/*
 * Copyright 2025 the bsnap authors
 *
 * This file is part of bsnap.
 *
 * bsnap is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * bsnap is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * bsnap. If not, see <https://www.gnu.org/licenses/>.
 */

//! Control-channel operations.
//!
//! The library-side halves of the command device: arming a device for
//! snapshotting, disarming it, and rendering the status listing. The
//! integer codes of [`SnapError`](crate::SnapError) are the wire contract
//! with user space; [`status_code`] performs the mapping.

use std::io;
use std::path::Path;

use crate::auth;
use crate::engine::Engine;
use crate::error::{Result, SnapError};
use crate::mounts;

/// Size of the status listing buffer, one page like the attribute file it
/// models.
pub const STATUS_BUF_SIZE: usize = 4096;

impl Engine {
    /// Registers `dev_path` for snapshotting, protected by `password`.
    ///
    /// From the next time the device is mounted until it is unmounted,
    /// every write against it is captured. A device that is mounted right
    /// now is refused: its pre-mount state is already gone.
    pub fn activate(&self, dev_path: &str, password: &str) -> Result<()> {
        if mounts::is_mount_source(Path::new(dev_path))? {
            return Err(SnapError::AlreadyMounted);
        }
        let hash = auth::hash_password(password)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        self.registry().insert(dev_path, &hash)
    }

    /// Unregisters `dev_path`. The password must match the one given at
    /// activation; a wrong password and an unknown path are reported
    /// identically, so probing the registry through this operation leaks
    /// nothing.
    pub fn deactivate(&self, dev_path: &str, password: &str) -> Result<()> {
        match self.registry().delete(dev_path, password) {
            Err(SnapError::NotFound) => Err(SnapError::WrongCredentials),
            other => other,
        }
    }

    /// Renders the status listing, one `<path> <dir|->` line per
    /// registered device, truncated with a trailing `EOF` when it exceeds
    /// `STATUS_BUF_SIZE`.
    pub fn status(&self) -> String {
        self.registry().render_listing(STATUS_BUF_SIZE)
    }
}

/// Folds an operation result into the integer surfaced through the
/// control channel: 0 on success, the stable code otherwise.
pub fn status_code(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.code(),
    }
}
