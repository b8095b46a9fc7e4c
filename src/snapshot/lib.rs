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

//! Copy-on-write block-device snapshots.
//!
//! A device or loop-backed image is registered with a path and a password;
//! from the moment it is mounted until it is unmounted, every write
//! against it is intercepted and the pre-image of the affected region is
//! captured to `/snapshots/<dir>/data`, exactly once per region per
//! session.
//!
//! The [`Engine`] is the process-wide instance: it owns the device
//! registry, the per-session capture state and the worker queues of the
//! interception pipeline. Mount/unmount and write events are delivered
//! through its `on_*` entry points by whatever hooking layer observes
//! them; the control channel drives [`Engine::activate`] and
//! [`Engine::deactivate`].

pub mod auth;
pub mod bio;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod hash;
pub mod itree;
pub mod mounts;
pub mod persist;
pub mod rbitmap;
pub mod registry;
pub mod session;
pub mod snapmap;

pub use bio::{Bio, BlockFile, DeviceId, SECTOR_SIZE, SectorRange};
pub use config::Config;
pub use control::status_code;
pub use engine::{Disposition, Engine, ReadBio};
pub use error::{Result, SnapError};
