//! The `replay` command exercises the whole capture pipeline against a
//! registered image: activate, mount, replay a list of writes, unmount.

use std::ffi::OsString;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use snapshot::{Bio, BlockFile, Config, DeviceId, Engine, status_code};

use crate::error;

/// Shows a prompt and reads one line from stdin.
fn prompt_password() -> String {
    print!("Password: ");
    let _ = io::stdout().flush();
    let mut password = String::new();
    if io::stdin().lock().read_line(&mut password).is_err() {
        error("cannot read password");
    }
    password.trim_end_matches('\n').to_owned()
}

fn parse_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// One write per line: `<sector> <hex payload>`. Blank lines and lines
/// starting with `#` are skipped.
fn parse_writes(input: &str) -> Vec<(u64, Vec<u8>)> {
    let mut writes = Vec::new();
    for (lineno, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parsed = line.split_once(' ').and_then(|(sector, hex)| {
            Some((sector.parse().ok()?, parse_hex(hex.trim())?))
        });
        match parsed {
            Some(w) => writes.push(w),
            None => error(format_args!("malformed write on line {}", lineno + 1)),
        }
    }
    writes
}

pub fn main(args: impl Iterator<Item = OsString>) {
    let args: Vec<_> = args.collect();
    let (device, writes_file, root) = match &args[..] {
        [device, writes] => (device, writes, Path::new("/snapshots")),
        [device, writes, root] => (device, writes, Path::new(root)),
        _ => error("usage: bsnap replay <device> <writes-file> [snapshots-root]"),
    };
    let device = device
        .to_str()
        .unwrap_or_else(|| error("device path is not valid UTF-8"));

    let writes = fs::read_to_string(writes_file)
        .unwrap_or_else(|e| error(format_args!("cannot read writes file: {e}")));
    let writes = parse_writes(&writes);

    let password = prompt_password();
    let engine = Engine::new(Config::new().snapshots_root(root))
        .unwrap_or_else(|e| error(format_args!("cannot start engine: {e}")));

    let res = engine.activate(device, &password);
    if let Err(e) = &res {
        error(format_args!(
            "cannot activate snapshot of {device}: {e} (status {})",
            status_code(&res)
        ));
    }

    let dev = DeviceId::of_path(Path::new(device))
        .unwrap_or_else(|e| error(format_args!("cannot stat {device}: {e}")));
    let disk = Arc::new(
        BlockFile::open(Path::new(device))
            .unwrap_or_else(|e| error(format_args!("cannot open {device}: {e}"))),
    );

    engine
        .on_mount_preattach(device, dev)
        .unwrap_or_else(|e| error(format_args!("cannot attach session: {e}")));

    for (sector, payload) in &writes {
        let bio = Bio::write(disk.clone(), dev, *sector, payload);
        if let Err(e) = engine.submit_bio(&bio) {
            error(format_args!("write at sector {sector} failed: {e}"));
        }
    }
    engine.drain();

    print!("{}", engine.status());
    engine.on_unmount(dev);
    engine.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn writes_are_parsed() {
        let writes = parse_writes("# header\n\n100 aabb\n108 00ff10\n");
        assert_eq!(writes, vec![(100, vec![0xAA, 0xBB]), (108, vec![0x00, 0xFF, 0x10])]);
    }

    #[test]
    pub fn odd_hex_is_rejected() {
        assert!(parse_hex("abc").is_none());
        assert!(parse_hex("zz").is_none());
        assert_eq!(parse_hex(""), Some(Vec::new()));
    }
}
