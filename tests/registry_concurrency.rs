//! Concurrency properties of the registry and the bitmap: duplicate
//! arbitration, grace-period safety of session references, parallel chunk
//! updates.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;

use snapshot::auth::hash_password;
use snapshot::bio::{DeviceId, SectorRange};
use snapshot::rbitmap::Rbitmap32;
use snapshot::registry::Registry;
use snapshot::snapmap::SnapList;
use snapshot::SnapError;

fn registry() -> Arc<Registry> {
    Arc::new(Registry::new(Arc::new(SnapList::new()), 12))
}

#[test]
fn concurrent_inserts_of_one_path_yield_one_winner() {
    let r = registry();
    let hash = hash_password("pw").unwrap();
    let wins = AtomicUsize::new(0);
    let dups = AtomicUsize::new(0);
    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| match r.insert("/dev/loop0", &hash) {
                Ok(()) => {
                    wins.fetch_add(1, Ordering::Relaxed);
                }
                Err(SnapError::DuplicateName) => {
                    dups.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => panic!("unexpected error: {e}"),
            });
        }
    });
    assert_eq!(wins.load(Ordering::Relaxed), 1);
    assert_eq!(dups.load(Ordering::Relaxed), 7);
}

#[test]
fn readers_survive_session_replacement() {
    let r = registry();
    let hash = hash_password("pw").unwrap();
    r.insert("/dev/loop0", &hash).unwrap();
    let dev = DeviceId::new(7, 0);
    r.attach_session("/dev/loop0", dev).unwrap();

    let stop = AtomicBool::new(false);
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                while !stop.load(Ordering::Acquire) {
                    if let Some(sref) = r.find_session_at_or_before(dev, Instant::now()) {
                        // The session must stay fully usable even if it is
                        // detached and retired underneath us.
                        assert!(!sref.session.id().is_empty());
                        sref.session.covers(SectorRange::new(0, 8));
                        assert!(!sref.dirname.is_empty());
                    }
                }
            });
        }
        s.spawn(|| {
            for _ in 0..200 {
                r.attach_session("/dev/loop0", dev).unwrap();
                r.detach_session(dev).unwrap();
            }
            stop.store(true, Ordering::Release);
        });
    });
    assert!(r.find_session_at_or_before(dev, Instant::now()).is_none());
}

#[test]
fn concurrent_registrations_of_distinct_paths_all_land() {
    let r = registry();
    let hash = hash_password("pw").unwrap();
    thread::scope(|s| {
        for i in 0..8 {
            let hash = &hash;
            let r = &r;
            s.spawn(move || {
                for j in 0..16 {
                    r.insert(&format!("/dev/loop{i}-{j}"), hash).unwrap();
                }
            });
        }
    });
    let listing = r.render_listing(64 * 1024);
    assert_eq!(listing.lines().count(), 128);
}

#[test]
fn bitmap_chunks_update_in_parallel() {
    let bitmap = Arc::new(Rbitmap32::new());
    let added = AtomicUsize::new(0);
    thread::scope(|s| {
        for t in 0..8u32 {
            let bitmap = &bitmap;
            let added = &added;
            s.spawn(move || {
                // Every thread works a different top-level chunk.
                let base = t << 28;
                for i in 0..1000 {
                    if bitmap.add(base + i * 3) {
                        added.fetch_add(1, Ordering::Relaxed);
                    }
                }
                let mask = bitmap.add_range(base + 100_000, base + 101_000);
                added.fetch_add(mask.count_ones(), Ordering::Relaxed);
            });
        }
    });
    assert_eq!(added.load(Ordering::Relaxed), 8 * 2000);
    for t in 0..8u32 {
        assert!(bitmap.contains(t << 28));
        assert!(bitmap.contains((t << 28) + 100_999));
    }
}

#[test]
fn concurrent_add_of_one_key_adds_once() {
    let bitmap = Arc::new(Rbitmap32::new());
    let added = AtomicUsize::new(0);
    thread::scope(|s| {
        for _ in 0..8 {
            let bitmap = &bitmap;
            let added = &added;
            s.spawn(move || {
                if bitmap.add(12345) {
                    added.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });
    assert_eq!(added.load(Ordering::Relaxed), 1);
}
