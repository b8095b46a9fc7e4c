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

//! Per-mount snapshot session state.

use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

use log::debug;
use uuid::Uuid;

use crate::bio::{DeviceId, SectorRange};
use crate::itree::IntervalTree;

/// When a session was created.
///
/// The realtime half names the on-disk directory; the monotonic half orders
/// the session against concurrently observed events, so a capture completed
/// under an older mount is never attributed to a newer session.
#[derive(Clone, Copy, Debug)]
pub struct Stamp {
    pub mono: Instant,
    pub wall: SystemTime,
}

impl Stamp {
    pub fn now() -> Self {
        Self {
            mono: Instant::now(),
            wall: SystemTime::now(),
        }
    }
}

/// The interval between a registered device being mounted and unmounted.
///
/// Destruction is always deferred past in-flight readers: sessions are only
/// handed out as `Arc`s cloned inside a registry read-side critical
/// section.
pub struct Session {
    id: String,
    dev: DeviceId,
    created_on: Stamp,
    captured_ranges: Mutex<IntervalTree>,
}

impl Session {
    pub fn create(dev: DeviceId) -> Arc<Self> {
        let s = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            dev,
            created_on: Stamp::now(),
            captured_ranges: Mutex::new(IntervalTree::new()),
        });
        debug!("session {},{dev} created", s.id);
        s
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dev(&self) -> DeviceId {
        self.dev
    }

    pub fn created_on(&self) -> Stamp {
        self.created_on
    }

    /// Records `range` as safely captured, unless a single already
    /// recorded range contains it. Returns whether the range was inserted.
    ///
    /// Check and insert run under one lock acquisition, so an insert
    /// happens-before every later [`covers`](Self::covers) observation of
    /// the same range.
    pub fn add_range(&self, range: SectorRange) -> bool {
        if range.is_empty() {
            return false;
        }
        let mut tree = self
            .captured_ranges
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if tree.covers(range.start, range.end) {
            return false;
        }
        tree.insert(range.start, range.end);
        true
    }

    /// True iff `range` lies entirely inside one captured range.
    pub fn covers(&self, range: SectorRange) -> bool {
        self.captured_ranges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .covers(range.start, range.end)
    }
}
