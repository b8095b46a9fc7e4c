//! Error taxonomy shared by the engine and the control channel.

use std::io;

use thiserror::Error;

/// Status code for [`SnapError::DuplicateName`].
pub const CODE_DUPLICATE_NAME: i32 = 5000;
/// Status code for [`SnapError::NameTooLong`].
pub const CODE_NAME_TOO_LONG: i32 = 5001;
/// Status code for [`SnapError::WrongCredentials`].
pub const CODE_WRONG_CREDENTIALS: i32 = 5002;
/// Status code for [`SnapError::AlreadyMounted`].
pub const CODE_ALREADY_MOUNTED: i32 = 5003;
/// Status code for [`SnapError::NoSessionPool`].
pub const CODE_NO_SESSION_POOL: i32 = 9000;
/// Status code for [`SnapError::NoSession`].
pub const CODE_NO_SESSION: i32 = 9001;

/// Longest device path accepted by the registry, including the NUL a C
/// consumer would append.
pub const PATH_MAX: usize = 4096;

/// Errors produced by the snapshot subsystem.
///
/// Control-channel operations surface these to user space as the integer
/// returned by [`SnapError::code`]; that mapping is a stable contract.
#[derive(Debug, Error)]
pub enum SnapError {
    /// The device path is already registered.
    #[error("device is already registered")]
    DuplicateName,
    /// The device path cannot possibly name a file.
    #[error("device path is too long")]
    NameTooLong,
    /// Wrong device path or password. The two cases are deliberately not
    /// distinguishable, so probing the registry leaks nothing.
    #[error("wrong device name or password")]
    WrongCredentials,
    /// The device is mounted right now; snapshots must be armed before the
    /// mount they are meant to observe.
    #[error("device is currently mounted")]
    AlreadyMounted,
    /// The engine has been shut down and no longer accepts work.
    #[error("snapshot engine is not running")]
    NoSessionPool,
    /// No active session for the device.
    #[error("no session associated with device")]
    NoSession,
    /// The requested range is already captured in full.
    #[error("range already captured")]
    AlreadyCovered,
    /// The device path is not registered.
    #[error("device path is not registered")]
    NotFound,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SnapError {
    /// The integer status surfaced through the control channel: zero is
    /// reserved for success, positive values are subsystem codes, negative
    /// values are kernel-style errnos.
    pub fn code(&self) -> i32 {
        match self {
            Self::DuplicateName => CODE_DUPLICATE_NAME,
            Self::NameTooLong => CODE_NAME_TOO_LONG,
            Self::WrongCredentials => CODE_WRONG_CREDENTIALS,
            Self::AlreadyMounted => CODE_ALREADY_MOUNTED,
            Self::NoSessionPool => CODE_NO_SESSION_POOL,
            Self::NoSession => CODE_NO_SESSION,
            Self::AlreadyCovered => -libc::EEXIST,
            Self::NotFound => -libc::ENOENT,
            Self::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

pub type Result<T> = std::result::Result<T, SnapError>;
