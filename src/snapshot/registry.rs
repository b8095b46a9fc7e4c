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

//! The registry of devices armed for snapshotting.
//!
//! A singly-linked list of entries, one writer mutex, lock-free reads
//! under epoch-based reclamation. Session attach and detach never mutate a
//! published node: a replacement node is built sharing the immutable
//! fields, swapped into the node's list position, and the old node is
//! retired. A retired node is dropped only after the grace period, and
//! dropping it tears down its session together with the session's snap
//! map, so a reader that obtained a session reference before the swap can
//! keep using it safely.
//!
//! The interception hot path looks entries up by device number, while the
//! control channel works with device paths; path lookups compare a cached
//! 64-bit hash before touching the string itself.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crossbeam_epoch::{Atomic, Collector, Guard, Owned, Shared};
use log::debug;

use crate::auth;
use crate::bio::{DeviceId, SectorRange};
use crate::error::{PATH_MAX, Result, SnapError};
use crate::hash::fast_hash;
use crate::persist;
use crate::session::Session;
use crate::snapmap::SnapList;

struct Node {
    name: Arc<str>,
    name_hash: u64,
    password_hash: Arc<str>,
    session: Option<Arc<Session>>,
    next: Atomic<Node>,
    maps: Arc<SnapList>,
}

impl Node {
    fn names(&self, name: &str, hash: u64) -> bool {
        self.name_hash == hash && *self.name == *name
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // Runs after the grace period (or for nodes that never got
        // published). The session and its on-disk map go down with the
        // node that owned them.
        if let Some(s) = self.session.take() {
            self.maps.destroy(s.dev(), s.created_on().wall);
            debug!("session {},{} destroyed", s.id(), s.dev());
        }
    }
}

/// A session resolved for a capture in flight: the session itself plus the
/// directory name derived from the owning entry's device path.
pub struct SessionRef {
    pub session: Arc<Session>,
    pub dirname: String,
}

/// The device registry. See the module docs for the concurrency scheme.
pub struct Registry {
    head: Atomic<Node>,
    write_lock: Mutex<()>,
    collector: Collector,
    maps: Arc<SnapList>,
    dirname_prefix_len: usize,
}

impl Registry {
    pub fn new(maps: Arc<SnapList>, dirname_prefix_len: usize) -> Self {
        Self {
            head: Atomic::null(),
            write_lock: Mutex::new(()),
            collector: Collector::new(),
            maps,
            dirname_prefix_len,
        }
    }

    fn pin(&self) -> Guard {
        self.collector.register().pin()
    }

    fn write_lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn find_by_name<'g>(&self, name: &str, hash: u64, guard: &'g Guard) -> Option<&'g Node> {
        let mut cur = self.head.load(Ordering::Acquire, guard);
        // SAFETY: every node reachable from head stays allocated at least
        // until the guard is dropped; retirement is deferred past it.
        while let Some(n) = unsafe { cur.as_ref() } {
            if n.names(name, hash) {
                return Some(n);
            }
            cur = n.next.load(Ordering::Acquire, guard);
        }
        None
    }

    fn find_by_dev<'g>(&self, dev: DeviceId, guard: &'g Guard) -> Option<&'g Node> {
        let mut cur = self.head.load(Ordering::Acquire, guard);
        // SAFETY: see find_by_name.
        while let Some(n) = unsafe { cur.as_ref() } {
            if n.session.as_ref().is_some_and(|s| s.dev() == dev) {
                return Some(n);
            }
            cur = n.next.load(Ordering::Acquire, guard);
        }
        None
    }

    /// Registers `name`. The caller provides the already-hashed password.
    pub fn insert(&self, name: &str, password_hash: &str) -> Result<()> {
        if name.len() >= PATH_MAX {
            return Err(SnapError::NameTooLong);
        }
        let hash = fast_hash(name);
        let node = Owned::new(Node {
            name: Arc::from(name),
            name_hash: hash,
            password_hash: Arc::from(password_hash),
            session: None,
            next: Atomic::null(),
            maps: self.maps.clone(),
        });
        let guard = self.pin();
        let _w = self.write_lock();
        if self.find_by_name(name, hash, &guard).is_some() {
            return Err(SnapError::DuplicateName);
        }
        node.next
            .store(self.head.load(Ordering::Acquire, &guard), Ordering::Relaxed);
        self.head.store(node, Ordering::Release);
        Ok(())
    }

    /// Unregisters `name` after verifying `password`. Any active session
    /// of the entry is torn down with it, after the grace period.
    pub fn delete(&self, name: &str, password: &str) -> Result<()> {
        let hash = fast_hash(name);
        let guard = self.pin();
        let _w = self.write_lock();
        let mut prev = &self.head;
        loop {
            let cur = prev.load(Ordering::Acquire, &guard);
            // SAFETY: see find_by_name.
            let Some(n) = (unsafe { cur.as_ref() }) else {
                return Err(SnapError::NotFound);
            };
            if n.names(name, hash) {
                if !auth::check_password(&n.password_hash, password) {
                    return Err(SnapError::WrongCredentials);
                }
                prev.store(n.next.load(Ordering::Acquire, &guard), Ordering::Release);
                // SAFETY: unlinked under the writer lock; no new reader
                // can reach cur, and current readers are covered by the
                // grace period.
                unsafe { guard.defer_destroy(cur) };
                return Ok(());
            }
            prev = &n.next;
        }
    }

    /// Attaches a freshly created session to the entry named `name`. The
    /// session is allocated before any lock is taken, mirroring the
    /// atomic-context discipline of the mount hook. An existing session of
    /// the entry is scheduled for deferred destruction.
    pub fn attach_session(&self, name: &str, dev: DeviceId) -> Result<()> {
        let session = Session::create(dev);
        let hash = fast_hash(name);
        let guard = self.pin();
        let _w = self.write_lock();
        let mut prev = &self.head;
        loop {
            let cur = prev.load(Ordering::Acquire, &guard);
            // SAFETY: see find_by_name.
            let Some(n) = (unsafe { cur.as_ref() }) else {
                debug!("no registered device for {name} ({dev})");
                return Err(SnapError::NotFound);
            };
            if n.names(name, hash) {
                self.replace(prev, cur, n, Some(session), &guard);
                return Ok(());
            }
            prev = &n.next;
        }
    }

    /// Detaches the session currently bound to `dev`, replacing the node
    /// with a session-less copy. Used both on unmount and when a mount
    /// fails after pre-attach.
    pub fn detach_session(&self, dev: DeviceId) -> Result<()> {
        let guard = self.pin();
        let _w = self.write_lock();
        let mut prev = &self.head;
        loop {
            let cur = prev.load(Ordering::Acquire, &guard);
            // SAFETY: see find_by_name.
            let Some(n) = (unsafe { cur.as_ref() }) else {
                return Err(SnapError::NoSession);
            };
            if n.session.as_ref().is_some_and(|s| s.dev() == dev) {
                self.replace(prev, cur, n, None, &guard);
                return Ok(());
            }
            prev = &n.next;
        }
    }

    /// Swaps a replacement for `cur` into the position pointed to by
    /// `prev` and retires the old node. Must run under the writer lock.
    fn replace(
        &self,
        prev: &Atomic<Node>,
        cur: Shared<'_, Node>,
        n: &Node,
        session: Option<Arc<Session>>,
        guard: &Guard,
    ) {
        let new = Owned::new(Node {
            name: n.name.clone(),
            name_hash: n.name_hash,
            password_hash: n.password_hash.clone(),
            session,
            next: Atomic::null(),
            maps: self.maps.clone(),
        });
        new.next
            .store(n.next.load(Ordering::Acquire, guard), Ordering::Relaxed);
        prev.store(new, Ordering::Release);
        // SAFETY: cur is unlinked under the writer lock; reclamation waits
        // for the grace period.
        unsafe { guard.defer_destroy(cur) };
    }

    /// The session bound to `dev` whose creation does not postdate
    /// `observed`, together with its directory name. Guards capture
    /// completions against sessions created after the write event they
    /// report for.
    pub fn find_session_at_or_before(&self, dev: DeviceId, observed: Instant) -> Option<SessionRef> {
        let guard = self.pin();
        let mut cur = self.head.load(Ordering::Acquire, &guard);
        // SAFETY: see find_by_name.
        while let Some(n) = unsafe { cur.as_ref() } {
            if let Some(s) = &n.session {
                if s.dev() == dev && s.created_on().mono <= observed {
                    let dirname = persist::session_dirname(
                        &n.name,
                        s.created_on().wall,
                        self.dirname_prefix_len,
                    )?;
                    return Some(SessionRef {
                        session: s.clone(),
                        dirname,
                    });
                }
            }
            cur = n.next.load(Ordering::Acquire, &guard);
        }
        None
    }

    /// Whether `range` is entirely inside a range already captured by the
    /// session bound to `dev`.
    pub fn covers(&self, dev: DeviceId, range: SectorRange) -> Result<bool> {
        let guard = self.pin();
        let n = self.find_by_dev(dev, &guard).ok_or(SnapError::NoSession)?;
        let s = n.session.as_ref().ok_or(SnapError::NoSession)?;
        Ok(s.covers(range))
    }

    /// Forwards `range` to the captured-range tree of the session bound to
    /// `dev` whose creation does not postdate `observed`.
    pub fn add_range(&self, dev: DeviceId, observed: Instant, range: SectorRange) -> Result<bool> {
        let guard = self.pin();
        let mut cur = self.head.load(Ordering::Acquire, &guard);
        // SAFETY: see find_by_name.
        while let Some(n) = unsafe { cur.as_ref() } {
            if let Some(s) = &n.session {
                if s.dev() == dev && s.created_on().mono <= observed {
                    return Ok(s.add_range(range));
                }
            }
            cur = n.next.load(Ordering::Acquire, &guard);
        }
        debug!("add_range: no session associated to device {dev}");
        Err(SnapError::NoSession)
    }

    /// Renders one line per registered device, `<path> <dir|->`, into a
    /// buffer of at most `cap` bytes. A truncated listing is terminated
    /// with the literal `EOF`.
    pub fn render_listing(&self, cap: usize) -> String {
        let mut out = String::new();
        let mut truncated = false;
        {
            let guard = self.pin();
            let mut cur = self.head.load(Ordering::Acquire, &guard);
            // SAFETY: see find_by_name.
            while let Some(n) = unsafe { cur.as_ref() } {
                let dir = n.session.as_ref().and_then(|s| {
                    persist::session_dirname(&n.name, s.created_on().wall, self.dirname_prefix_len)
                });
                let line = format!("{} {}\n", n.name, dir.as_deref().unwrap_or("-"));
                if out.len() + line.len() >= cap {
                    truncated = true;
                    break;
                }
                out.push_str(&line);
                cur = n.next.load(Ordering::Acquire, &guard);
            }
        }
        if truncated {
            if out.len() + 3 < cap {
                out.push_str("EOF");
            }
        } else if out.is_empty() {
            out.push_str("(no devices)\n");
        }
        out
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let guard = self.pin();
        let _w = self.write_lock();
        let mut cur = self.head.swap(Shared::null(), Ordering::AcqRel, &guard);
        // SAFETY: the list head is nulled out; nodes are retired into the
        // collector, which runs the deferred drops once every handle is
        // gone.
        while let Some(n) = unsafe { cur.as_ref() } {
            let next = n.next.load(Ordering::Acquire, &guard);
            unsafe { guard.defer_destroy(cur) };
            cur = next;
        }
    }
}
