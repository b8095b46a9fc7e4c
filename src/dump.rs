//! The `dump` command prints the frames of a capture data file.

use std::ffi::OsString;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use snapshot::persist::FrameReader;

use crate::error;

pub fn main(mut args: impl Iterator<Item = OsString>) {
    let Some(path) = args.next() else {
        error("usage: bsnap dump <data-file>");
    };
    let path = Path::new(&path);
    let file = File::open(path)
        .unwrap_or_else(|e| error(format_args!("cannot open {}: {e}", path.display())));
    let mut frames = FrameReader::new(BufReader::new(file));
    let mut n = 0usize;
    loop {
        match frames.next_frame() {
            Ok(Some((sector, payload))) => {
                println!("frame {n}: sector {sector} nbytes {}", payload.len());
                n += 1;
            }
            Ok(None) => break,
            Err(e) => error(format_args!("truncated or corrupt frame {n}: {e}")),
        }
    }
    println!("{n} frame(s)");
}
