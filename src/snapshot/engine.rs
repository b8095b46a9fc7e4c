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

//! The write-path interception state machine.
//!
//! A write against a device with an active session is diverted before it
//! reaches the disk: the pre-image of its target region is read first, the
//! original write is only submitted once that read has completed, and the
//! pre-image is appended to the session's capture file at most once per
//! sector. Capture is strictly best-effort; whatever fails along the way,
//! the original write is submitted exactly once.
//!
//! The entry points ([`Engine::submit_bio`], [`Engine::on_read_complete`])
//! never block on file I/O; they only inspect state and enqueue. The
//! sleepable stages run on three queues: a single-threaded ingress queue
//! that preserves submission order, a capture pool, and a per-block
//! persistence pool.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use std::time::SystemTime;

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, error};

use crate::bio::{Bio, DeviceId, SECTOR_SIZE};
use crate::config::Config;
use crate::error::{Result, SnapError};
use crate::persist;
use crate::registry::Registry;
use crate::snapmap::SnapList;

/// What became of a submitted bio.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Disposition {
    /// The write was intercepted; the engine owns it now and will submit
    /// it downstream once its pre-image has been read.
    Diverted,
    /// The request went straight through to the device.
    PassThrough,
}

struct WriteWork {
    bio: Arc<Bio>,
}

/// The completed pre-read over an intercepted write's target region.
pub struct ReadBio {
    orig: Arc<Bio>,
    pages: Option<Vec<Vec<u8>>>,
    completed_on: Instant,
}

impl ReadBio {
    /// `pages` is `None` when the read failed; capture is dropped but the
    /// original write still goes downstream.
    pub fn new(orig: Arc<Bio>, pages: Option<Vec<Vec<u8>>>) -> Self {
        Self {
            orig,
            pages,
            completed_on: Instant::now(),
        }
    }
}

struct BlockWork {
    dev: DeviceId,
    sector: u64,
    session_created_on: SystemTime,
    page: Vec<u8>,
}

/// Counts work items across all three queues so teardown and tests can
/// wait for the pipeline to run dry.
struct Inflight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Inflight {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    fn add(&self, n: usize) {
        *self.count.lock().unwrap_or_else(|e| e.into_inner()) += n;
    }

    fn done(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        while *count != 0 {
            count = self.idle.wait(count).unwrap_or_else(|e| e.into_inner());
        }
    }
}

struct Core {
    root: PathBuf,
    registry: Registry,
    maps: Arc<SnapList>,
    inflight: Inflight,
    accepting: AtomicBool,
    ingress_tx: Mutex<Option<Sender<WriteWork>>>,
    capture_tx: Mutex<Option<Sender<ReadBio>>>,
    block_tx: Mutex<Option<Sender<BlockWork>>>,
}

impl Core {
    /// True when the probe should leave the bio alone: reads, empty write
    /// barriers, the second pass of an already-intercepted bio, engine
    /// shutdown, devices without a session, and ranges already captured in
    /// full.
    fn skip(&self, bio: &Bio) -> bool {
        if !self.accepting.load(Ordering::Acquire) {
            return true;
        }
        if !bio.is_write() || bio.is_empty() || bio.toggle_mark() {
            return true;
        }
        match self.registry.covers(bio.dev(), bio.range()) {
            Ok(covered) => covered,
            Err(SnapError::NoSession) => true,
            Err(e) => {
                error!("covers lookup failed: {e}");
                true
            }
        }
    }

    fn submit(&self, bio: &Arc<Bio>) -> io::Result<Disposition> {
        if self.skip(bio) {
            if bio.is_write() && !bio.is_empty() {
                bio.apply()?;
            }
            return Ok(Disposition::PassThrough);
        }
        self.inflight.add(1);
        let sent = {
            let tx = self.ingress_tx.lock().unwrap_or_else(|e| e.into_inner());
            tx.as_ref()
                .map(|tx| tx.send(WriteWork { bio: bio.clone() }).is_ok())
                .unwrap_or(false)
        };
        if !sent {
            // Shutdown raced us; behave as if the probe never fired.
            self.inflight.done();
            bio.apply()?;
            return Ok(Disposition::PassThrough);
        }
        Ok(Disposition::Diverted)
    }

    /// Ingress stage: allocate buffers shaped like the write's payload and
    /// read the current content of the target region. The completion is
    /// handed to the capture queue; a failed read drops the capture but
    /// the write must still reach the disk.
    fn process_write(&self, bio: Arc<Bio>) {
        let mut pages = Vec::with_capacity(bio.pages().len());
        let mut sector = bio.sector();
        let mut ok = true;
        for page in bio.pages() {
            let mut buf = vec![0u8; page.len()];
            if let Err(e) = bio.disk().read_at_sector(sector, &mut buf) {
                error!("pre-image read of device {} failed: {e}", bio.dev());
                ok = false;
                break;
            }
            sector += (buf.len() as u64).div_ceil(SECTOR_SIZE);
            pages.push(buf);
        }
        let pages = ok.then_some(pages);
        self.read_complete(ReadBio::new(bio, pages));
        self.inflight.done();
    }

    /// End-I/O of the pre-read. Runs in the atomic tier: it only enqueues.
    fn read_complete(&self, read: ReadBio) {
        self.inflight.add(1);
        let sent = {
            let tx = self.capture_tx.lock().unwrap_or_else(|e| e.into_inner());
            tx.as_ref().map(|tx| tx.send(read).is_ok()).unwrap_or(false)
        };
        if !sent {
            self.inflight.done();
        }
    }

    /// Capture stage: attribute the completed read to a session, record
    /// the range, make sure the session directory and snap map exist, fan
    /// the pages out to the block queue, and finally submit the original
    /// write.
    fn save_capture(&self, work: ReadBio) {
        let bio = work.orig;
        let Some(pages) = work.pages else {
            self.submit_downstream(&bio);
            self.inflight.done();
            return;
        };
        let Some(sref) = self
            .registry
            .find_session_at_or_before(bio.dev(), work.completed_on)
        else {
            error!("no session associated to device {}, capture dropped", bio.dev());
            self.submit_downstream(&bio);
            self.inflight.done();
            return;
        };
        let stamp = sref.session.created_on();
        // The whole region was read successfully, so it can be recorded
        // before the frames land on disk.
        if let Err(e) = self
            .registry
            .add_range(bio.dev(), work.completed_on, bio.range())
        {
            debug!("range not recorded for device {}: {e}", bio.dev());
        }
        let dir = match persist::mkdir_session(&self.root, &sref.dirname) {
            Ok(dir) => dir,
            Err(e) => {
                error!("cannot create session directory {}: {e}", sref.dirname);
                self.submit_downstream(&bio);
                self.inflight.done();
                return;
            }
        };
        match self.maps.create(&dir, bio.dev(), stamp.wall) {
            Ok(()) => {}
            Err(SnapError::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                error!("cannot create snap map for device {}: {e}", bio.dev());
                self.submit_downstream(&bio);
                self.inflight.done();
                return;
            }
        }
        {
            let tx = self.block_tx.lock().unwrap_or_else(|e| e.into_inner());
            let mut sector = bio.sector();
            for page in pages {
                let sectors = (page.len() as u64).div_ceil(SECTOR_SIZE);
                self.inflight.add(1);
                let sent = tx
                    .as_ref()
                    .map(|tx| {
                        tx.send(BlockWork {
                            dev: bio.dev(),
                            sector,
                            session_created_on: stamp.wall,
                            page,
                        })
                        .is_ok()
                    })
                    .unwrap_or(false);
                if !sent {
                    self.inflight.done();
                }
                sector += sectors;
            }
        }
        self.submit_downstream(&bio);
        self.inflight.done();
    }

    /// Block stage: mark the page's sectors in the session bitmap and
    /// append one frame per run of sectors not yet persisted.
    fn save_block(&self, work: BlockWork) {
        let Some(map) = self.maps.lookup(work.dev, work.session_created_on) else {
            debug!("no snap map for device {}, block dropped", work.dev);
            self.inflight.done();
            return;
        };
        if let Err(e) = map.save(work.sector, &work.page) {
            error!(
                "cannot append frame at sector {} of device {}: {e}",
                work.sector, work.dev
            );
        }
        self.inflight.done();
    }

    /// Resubmits the original bio. Its mark-once flag is still set, so the
    /// probe clears it and lets the write pass through to the device.
    fn submit_downstream(&self, bio: &Arc<Bio>) {
        if let Err(e) = self.submit(bio) {
            error!("downstream write to device {} failed: {e}", bio.dev());
        }
    }
}

/// The interception and capture pipeline. One engine owns the registry,
/// the snap-map list and the three worker queues; dropping it stops
/// intake, drains every queue and waits out both grace-period domains.
pub struct Engine {
    core: Arc<Core>,
    ingress: Option<JoinHandle<()>>,
    capture: Vec<JoinHandle<()>>,
    block: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn new(cfg: Config) -> Result<Self> {
        persist::mkdir_root(&cfg.snapshots_root)?;
        let maps = Arc::new(SnapList::new());
        let registry = Registry::new(maps.clone(), cfg.dirname_prefix_len);
        let (ingress_tx, ingress_rx) = unbounded::<WriteWork>();
        let (capture_tx, capture_rx) = unbounded::<ReadBio>();
        let (block_tx, block_rx) = unbounded::<BlockWork>();
        let core = Arc::new(Core {
            root: cfg.snapshots_root,
            registry,
            maps,
            inflight: Inflight::new(),
            accepting: AtomicBool::new(true),
            ingress_tx: Mutex::new(Some(ingress_tx)),
            capture_tx: Mutex::new(Some(capture_tx)),
            block_tx: Mutex::new(Some(block_tx)),
        });

        let ingress = spawn_worker("snap-ingress", core.clone(), ingress_rx, |core, w| {
            core.process_write(w.bio)
        })?;
        let mut capture = Vec::with_capacity(cfg.capture_workers);
        for i in 0..cfg.capture_workers {
            capture.push(spawn_worker(
                &format!("snap-capture{i}"),
                core.clone(),
                capture_rx.clone(),
                Core::save_capture,
            )?);
        }
        let mut block = Vec::with_capacity(cfg.block_workers);
        for i in 0..cfg.block_workers {
            block.push(spawn_worker(
                &format!("snap-block{i}"),
                core.clone(),
                block_rx.clone(),
                Core::save_block,
            )?);
        }
        Ok(Self {
            core,
            ingress: Some(ingress),
            capture,
            block,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.core.registry
    }

    /// A registered device is being mounted. Called before the mount
    /// returns to user space, because the filesystem may issue writes
    /// straight away; a failed mount is rolled back through
    /// [`on_mount_finalize_failure`](Self::on_mount_finalize_failure).
    pub fn on_mount_preattach(&self, dev_path: &str, dev: DeviceId) -> Result<()> {
        self.core.registry.attach_session(dev_path, dev)
    }

    /// The mount that pre-attached a session did not complete.
    pub fn on_mount_finalize_failure(&self, dev: DeviceId) {
        if self.core.registry.detach_session(dev).is_err() {
            debug!("mount rollback: no session attached to device {dev}");
        }
    }

    pub fn on_unmount(&self, dev: DeviceId) {
        if self.core.registry.detach_session(dev).is_err() {
            debug!("unmount: no session attached to device {dev}");
        }
    }

    /// The probe on the write submission path. Pass-through requests are
    /// applied to the device before returning; diverted requests are owned
    /// by the engine from here on.
    pub fn submit_bio(&self, bio: &Arc<Bio>) -> io::Result<Disposition> {
        self.core.submit(bio)
    }

    /// Completion of a pre-read issued outside the engine's own ingress
    /// worker. Only enqueues; safe to call from non-sleepable contexts.
    pub fn on_read_complete(&self, read: ReadBio) {
        self.core.read_complete(read);
    }

    /// Blocks until every intercepted write submitted so far has been
    /// fully processed, captures included.
    pub fn drain(&self) {
        self.core.inflight.wait_idle();
    }

    fn teardown(&mut self) {
        self.core.accepting.store(false, Ordering::Release);
        drop(
            self.core
                .ingress_tx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take(),
        );
        if let Some(h) = self.ingress.take() {
            let _ = h.join();
        }
        drop(
            self.core
                .capture_tx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take(),
        );
        for h in self.capture.drain(..) {
            let _ = h.join();
        }
        drop(
            self.core
                .block_tx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take(),
        );
        for h in self.block.drain(..) {
            let _ = h.join();
        }
    }

    /// Stops intake and flushes all three queues in pipeline order.
    pub fn shutdown(mut self) {
        self.teardown();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn spawn_worker<W: Send + 'static>(
    name: &str,
    core: Arc<Core>,
    rx: Receiver<W>,
    run: impl Fn(&Core, W) + Send + 'static,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name(name.to_string()).spawn(move || {
        while let Ok(w) = rx.recv() {
            run(&core, w);
        }
    })
}
