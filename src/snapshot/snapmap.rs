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

//! Per-session capture files and the process-wide list that tracks them.
//!
//! A [`SnapMap`] pairs the append-only `data` file of one session with the
//! bitmap of sectors already written to it, which is what makes each
//! sector's pre-image land in the file at most once. Maps are keyed by
//! `(device, session creation time)` in a [`SnapList`] whose readers run
//! lock-free under a grace-period domain separate from the registry's.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crossbeam_epoch::{Atomic, Collector, Guard, Owned, Shared};
use log::debug;

use crate::bio::{DeviceId, SECTOR_SIZE};
use crate::error::Result;
use crate::persist;
use crate::rbitmap::Rbitmap32;

/// On-disk capture state of one session.
pub struct SnapMap {
    dev: DeviceId,
    created_on: SystemTime,
    bitmap: Rbitmap32,
    data: Mutex<File>,
}

impl SnapMap {
    fn new(dir: &Path, dev: DeviceId, created_on: SystemTime) -> io::Result<Self> {
        let data = persist::create_data_file(dir)?;
        Ok(Self {
            dev,
            created_on,
            bitmap: Rbitmap32::new(),
            data: Mutex::new(data),
        })
    }

    pub fn dev(&self) -> DeviceId {
        self.dev
    }

    /// Appends the pre-image `page` read at `sector`: the page's sectors
    /// are added to the bitmap and one frame is written per contiguous run
    /// of sectors that were not already in the file.
    ///
    /// A failed frame write leaves the affected sectors marked; the frame
    /// is not retried and the loss is reported to the caller.
    pub fn save(&self, sector: u64, page: &[u8]) -> io::Result<()> {
        if page.is_empty() {
            return Ok(());
        }
        let nsectors = (page.len() as u64).div_ceil(SECTOR_SIZE);
        let lo = sector as u32;
        let hi = (u64::from(lo) + nsectors).min(u64::from(u32::MAX)) as u32;
        let mask = self.bitmap.add_range(lo, hi);
        for (rlo, rhi) in mask.regions() {
            let from = rlo * SECTOR_SIZE as usize;
            let to = (rhi * SECTOR_SIZE as usize).min(page.len());
            self.write_frame(sector + rlo as u64, &page[from..to])?;
        }
        Ok(())
    }

    /// Writes one header+payload frame while holding the file lock, so
    /// frames from concurrent workers never interleave.
    fn write_frame(&self, sector: u64, payload: &[u8]) -> io::Result<()> {
        let mut f = self.data.lock().unwrap_or_else(|e| e.into_inner());
        f.write_all(&persist::encode_header(sector, payload.len() as u64))?;
        f.write_all(payload)?;
        Ok(())
    }
}

struct Entry {
    map: Arc<SnapMap>,
    next: Atomic<Entry>,
}

/// Process-wide list of live snap maps.
///
/// One writer mutex serialises create/destroy; lookups are lock-free.
/// Destroyed maps have their file handle closed only after the grace
/// period, once no reader can still hold the entry.
pub struct SnapList {
    head: Atomic<Entry>,
    write_lock: Mutex<()>,
    collector: Collector,
}

impl SnapList {
    pub fn new() -> Self {
        Self {
            head: Atomic::null(),
            write_lock: Mutex::new(()),
            collector: Collector::new(),
        }
    }

    fn pin(&self) -> Guard {
        self.collector.register().pin()
    }

    fn lookup_in<'g>(
        &self,
        dev: DeviceId,
        created_on: SystemTime,
        guard: &'g Guard,
    ) -> Option<&'g Entry> {
        let mut cur = self.head.load(Ordering::Acquire, guard);
        // SAFETY: nodes reached from head stay alive for the lifetime of
        // the pinned guard; unlinked nodes are only reclaimed after it.
        while let Some(e) = unsafe { cur.as_ref() } {
            if e.map.dev == dev && e.map.created_on == created_on {
                return Some(e);
            }
            cur = e.next.load(Ordering::Acquire, guard);
        }
        None
    }

    /// Registers a new map for `(dev, created_on)`, creating its `data`
    /// file inside `dir`. Fails with an `AlreadyExists` I/O error when the
    /// pair is already registered.
    pub fn create(&self, dir: &Path, dev: DeviceId, created_on: SystemTime) -> Result<()> {
        {
            let guard = self.pin();
            if self.lookup_in(dev, created_on, &guard).is_some() {
                return Err(io::Error::from_raw_os_error(libc::EEXIST).into());
            }
        }
        // The data file is O_EXCL, so concurrent creators for the same
        // session directory race on the filesystem, not on the list.
        let map = Arc::new(SnapMap::new(dir, dev, created_on)?);
        let guard = self.pin();
        let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.lookup_in(dev, created_on, &guard).is_some() {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists).into());
        }
        let entry = Owned::new(Entry {
            map,
            next: Atomic::null(),
        });
        entry
            .next
            .store(self.head.load(Ordering::Acquire, &guard), Ordering::Relaxed);
        self.head.store(entry, Ordering::Release);
        Ok(())
    }

    /// The map registered for `(dev, created_on)`, if any.
    pub fn lookup(&self, dev: DeviceId, created_on: SystemTime) -> Option<Arc<SnapMap>> {
        let guard = self.pin();
        self.lookup_in(dev, created_on, &guard).map(|e| e.map.clone())
    }

    /// Unlinks the map for `(dev, created_on)`; the entry (and with it the
    /// file handle, once all outstanding references drop) is reclaimed
    /// after a grace period.
    pub fn destroy(&self, dev: DeviceId, created_on: SystemTime) {
        let guard = self.pin();
        let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut prev = &self.head;
        loop {
            let cur = prev.load(Ordering::Acquire, &guard);
            // SAFETY: see lookup_in.
            let Some(e) = (unsafe { cur.as_ref() }) else {
                debug!("no snap map registered for device {dev}");
                return;
            };
            if e.map.dev == dev && e.map.created_on == created_on {
                prev.store(e.next.load(Ordering::Acquire, &guard), Ordering::Release);
                // SAFETY: cur is unlinked under the writer lock and can
                // no longer be reached by new readers.
                unsafe { guard.defer_destroy(cur) };
                return;
            }
            prev = &e.next;
        }
    }
}

impl Default for SnapList {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SnapList {
    fn drop(&mut self) {
        let guard = self.pin();
        let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut cur = self.head.swap(Shared::null(), Ordering::AcqRel, &guard);
        // SAFETY: the list is unreachable now; entries are retired into
        // the collector, which runs the deferred drops when it goes away.
        while let Some(e) = unsafe { cur.as_ref() } {
            let next = e.next.load(Ordering::Acquire, &guard);
            unsafe { guard.defer_destroy(cur) };
            cur = next;
        }
    }
}
