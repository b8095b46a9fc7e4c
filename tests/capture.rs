//! End-to-end capture scenarios: activate, mount, intercepted writes,
//! at-most-once persistence, deactivate.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use snapshot::persist::FrameReader;
use snapshot::{Bio, BlockFile, Config, DeviceId, Disposition, Engine, status_code};
use tempfile::TempDir;

const IMAGE_SECTORS: u64 = 2048;

struct Fixture {
    _tmp: TempDir,
    root: PathBuf,
    image: PathBuf,
    engine: Engine,
}

/// A scratch image whose every sector is filled with its own low byte, so
/// pre-images are recognisable.
fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let image = tmp.path().join("img.raw");
    let mut content = Vec::with_capacity((IMAGE_SECTORS * 512) as usize);
    for sector in 0..IMAGE_SECTORS {
        content.extend_from_slice(&[sector as u8; 512]);
    }
    std::fs::write(&image, content).unwrap();

    let root = tmp.path().join("snapshots");
    let engine = Engine::new(Config::new().snapshots_root(&root)).unwrap();
    Fixture {
        _tmp: tmp,
        root,
        image,
        engine,
    }
}

impl Fixture {
    fn image_str(&self) -> &str {
        self.image.to_str().unwrap()
    }

    fn mount(&self) -> (Arc<BlockFile>, DeviceId) {
        let dev = DeviceId::of_path(&self.image).unwrap();
        self.engine.on_mount_preattach(self.image_str(), dev).unwrap();
        (Arc::new(BlockFile::open(&self.image).unwrap()), dev)
    }

    fn session_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<_> = std::fs::read_dir(&self.root)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        dirs.sort();
        dirs
    }

    fn frames_of(&self, dir: &Path) -> Vec<(u64, Vec<u8>)> {
        let file = File::open(dir.join("data")).unwrap();
        let mut reader = FrameReader::new(file);
        let mut frames = Vec::new();
        while let Some(frame) = reader.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    fn read_sector(&self, disk: &BlockFile, sector: u64) -> [u8; 512] {
        let mut buf = [0u8; 512];
        disk.read_at_sector(sector, &mut buf).unwrap();
        buf
    }
}

#[test]
fn activate_lists_device_without_session() {
    let f = fixture();
    assert_eq!(status_code(&f.engine.activate(f.image_str(), "pw")), 0);
    let status = f.engine.status();
    assert!(status.contains(&format!("{} -", f.image_str())), "{status}");
}

#[test]
fn first_write_captures_the_pre_image() {
    let f = fixture();
    f.engine.activate(f.image_str(), "pw").unwrap();
    let (disk, dev) = f.mount();

    let bio = Bio::write(disk.clone(), dev, 100, &[0xAA; 4096]);
    assert_eq!(f.engine.submit_bio(&bio).unwrap(), Disposition::Diverted);
    f.engine.drain();

    // The original write reached the device.
    assert_eq!(f.read_sector(&disk, 100), [0xAA; 512]);
    assert_eq!(f.read_sector(&disk, 107), [0xAA; 512]);

    // The capture file starts with a frame holding the prior content.
    let dirs = f.session_dirs();
    assert_eq!(dirs.len(), 1);
    let frames = f.frames_of(&dirs[0]);
    assert_eq!(frames.len(), 1);
    let (sector, payload) = &frames[0];
    assert_eq!((*sector, payload.len()), (100, 4096));
    for s in 0..8u64 {
        let chunk = &payload[(s * 512) as usize..((s + 1) * 512) as usize];
        assert!(chunk.iter().all(|&b| b == (100 + s) as u8));
    }
}

#[test]
fn covered_writes_pass_through_without_new_frames() {
    let f = fixture();
    f.engine.activate(f.image_str(), "pw").unwrap();
    let (disk, dev) = f.mount();

    let first = Bio::write(disk.clone(), dev, 100, &[0xAA; 4096]);
    assert_eq!(f.engine.submit_bio(&first).unwrap(), Disposition::Diverted);
    f.engine.drain();

    let second = Bio::write(disk.clone(), dev, 100, &[0xBB; 4096]);
    assert_eq!(f.engine.submit_bio(&second).unwrap(), Disposition::PassThrough);
    f.engine.drain();

    assert_eq!(f.read_sector(&disk, 100), [0xBB; 512]);
    let frames = f.frames_of(&f.session_dirs()[0]);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, 100);
}

#[test]
fn adjacent_write_appends_its_own_frame() {
    let f = fixture();
    f.engine.activate(f.image_str(), "pw").unwrap();
    let (disk, dev) = f.mount();

    let first = Bio::write(disk.clone(), dev, 100, &[0xAA; 4096]);
    f.engine.submit_bio(&first).unwrap();
    f.engine.drain();
    let second = Bio::write(disk.clone(), dev, 108, &[0xCC; 4096]);
    assert_eq!(f.engine.submit_bio(&second).unwrap(), Disposition::Diverted);
    f.engine.drain();

    let frames = f.frames_of(&f.session_dirs()[0]);
    assert_eq!(frames.len(), 2);
    assert_eq!((frames[0].0, frames[0].1.len()), (100, 4096));
    assert_eq!((frames[1].0, frames[1].1.len()), (108, 4096));
    assert!(frames[1].1.iter().take(512).all(|&b| b == 108));
}

#[test]
fn overlapping_write_persists_only_new_sectors() {
    let f = fixture();
    f.engine.activate(f.image_str(), "pw").unwrap();
    let (disk, dev) = f.mount();

    f.engine
        .submit_bio(&Bio::write(disk.clone(), dev, 100, &[0xAA; 4096]))
        .unwrap();
    f.engine.drain();
    // Sectors 104..112: 104..108 are already in the file, 108..112 are not.
    f.engine
        .submit_bio(&Bio::write(disk.clone(), dev, 104, &[0xDD; 4096]))
        .unwrap();
    f.engine.drain();

    let frames = f.frames_of(&f.session_dirs()[0]);
    assert_eq!(frames.len(), 2);
    assert_eq!((frames[1].0, frames[1].1.len()), (108, 2048));
    // The second frame holds the pre-image of sectors 108..112, untouched
    // by the first write.
    assert!(frames[1].1[..512].iter().all(|&b| b == 108));
}

#[test]
fn resubmitting_the_same_bio_captures_once() {
    let f = fixture();
    f.engine.activate(f.image_str(), "pw").unwrap();
    let (disk, dev) = f.mount();

    let bio = Bio::write(disk.clone(), dev, 200, &[0x11; 1024]);
    assert_eq!(f.engine.submit_bio(&bio).unwrap(), Disposition::Diverted);
    f.engine.drain();
    // The post-divert second pass of the same request.
    assert_eq!(f.engine.submit_bio(&bio).unwrap(), Disposition::PassThrough);
    f.engine.drain();

    let frames = f.frames_of(&f.session_dirs()[0]);
    assert_eq!(frames.len(), 1);
    assert_eq!((frames[0].0, frames[0].1.len()), (200, 1024));
}

#[test]
fn wrong_password_keeps_the_entry() {
    let f = fixture();
    f.engine.activate(f.image_str(), "pw").unwrap();
    let res = f.engine.deactivate(f.image_str(), "wrong");
    assert_eq!(status_code(&res), 5002);
    assert!(f.engine.status().contains(f.image_str()));

    assert_eq!(status_code(&f.engine.deactivate(f.image_str(), "pw")), 0);
    assert_eq!(f.engine.status(), "(no devices)\n");
}

#[test]
fn writes_without_a_session_pass_through_untouched() {
    let f = fixture();
    f.engine.activate(f.image_str(), "pw").unwrap();
    let dev = DeviceId::of_path(&f.image).unwrap();
    let disk = Arc::new(BlockFile::open(&f.image).unwrap());

    let bio = Bio::write(disk.clone(), dev, 5, &[0x42; 512]);
    assert_eq!(f.engine.submit_bio(&bio).unwrap(), Disposition::PassThrough);
    assert_eq!(f.read_sector(&disk, 5), [0x42; 512]);
    assert!(f.session_dirs().is_empty());
}

#[test]
fn failed_mount_detaches_the_session() {
    let f = fixture();
    f.engine.activate(f.image_str(), "pw").unwrap();
    let (disk, dev) = f.mount();
    f.engine.on_mount_finalize_failure(dev);

    let bio = Bio::write(disk.clone(), dev, 5, &[0x42; 512]);
    assert_eq!(f.engine.submit_bio(&bio).unwrap(), Disposition::PassThrough);
    f.engine.drain();
    assert_eq!(f.read_sector(&disk, 5), [0x42; 512]);
    assert!(f.session_dirs().is_empty());
    assert!(f.engine.status().contains(&format!("{} -", f.image_str())));
}

#[test]
fn remount_starts_a_fresh_session() {
    let f = fixture();
    f.engine.activate(f.image_str(), "pw").unwrap();
    let (disk, dev) = f.mount();
    f.engine
        .submit_bio(&Bio::write(disk.clone(), dev, 100, &[0xAA; 512]))
        .unwrap();
    f.engine.drain();
    f.engine.on_unmount(dev);

    let (disk, dev) = f.mount();
    f.engine
        .submit_bio(&Bio::write(disk.clone(), dev, 100, &[0xBB; 512]))
        .unwrap();
    f.engine.drain();

    let dirs = f.session_dirs();
    assert_eq!(dirs.len(), 2);
    // Each session captured the pre-image it observed: the original
    // content first, then the first write's payload.
    let payloads: Vec<u8> = dirs
        .iter()
        .map(|d| f.frames_of(d))
        .map(|frames| {
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].0, 100);
            frames[0].1[0]
        })
        .collect();
    assert!(payloads.contains(&100));
    assert!(payloads.contains(&0xAA));
}

#[test]
fn unmount_mid_pipeline_never_loses_writes() {
    let f = fixture();
    f.engine.activate(f.image_str(), "pw").unwrap();
    let (disk, dev) = f.mount();

    for i in 0..64u64 {
        f.engine
            .submit_bio(&Bio::write(disk.clone(), dev, i * 8, &[0xEE; 4096]))
            .unwrap();
    }
    f.engine.on_unmount(dev);
    f.engine.drain();

    for i in 0..64u64 {
        assert_eq!(f.read_sector(&disk, i * 8), [0xEE; 512]);
    }
}

#[test]
fn reads_are_never_intercepted() {
    let f = fixture();
    f.engine.activate(f.image_str(), "pw").unwrap();
    let (disk, dev) = f.mount();
    let bio = Bio::read(disk.clone(), dev, 100, 4096);
    assert_eq!(f.engine.submit_bio(&bio).unwrap(), Disposition::PassThrough);
    f.engine.drain();
    assert_eq!(f.read_sector(&disk, 100), [100u8; 512]);
    assert!(f.session_dirs().is_empty());
}

#[test]
fn empty_writes_are_ignored() {
    let f = fixture();
    f.engine.activate(f.image_str(), "pw").unwrap();
    let (disk, dev) = f.mount();
    let bio = Bio::write(disk.clone(), dev, 0, &[]);
    assert_eq!(f.engine.submit_bio(&bio).unwrap(), Disposition::PassThrough);
    f.engine.drain();
    assert!(f.session_dirs().is_empty());
}
