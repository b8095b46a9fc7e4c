//! Control utility for the block-snapshot engine.

mod dump;
mod replay;

use std::env;
use std::fmt;
use std::process::exit;

/// Writes an error to stderr, then exits.
pub fn error<M: fmt::Display>(msg: M) -> ! {
    eprintln!("bsnap: error: {msg}");
    exit(1);
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!(" bsnap replay <device> <writes-file> [snapshots-root]");
    eprintln!(" bsnap dump <data-file>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!(" replay:\tarms <device> for snapshotting, mounts it and replays the");
    eprintln!("        \twrites listed in <writes-file>, one `<sector> <hex>` per line");
    eprintln!(" dump:\t\tprints the frames of a capture data file");
}

fn main() {
    env_logger::init();
    let mut args = env::args_os().skip(1);
    let Some(cmd) = args.next().and_then(|s| s.into_string().ok()) else {
        print_usage();
        exit(1);
    };
    match cmd.as_str() {
        "replay" => replay::main(args),
        "dump" => dump::main(args),
        "-h" | "--help" => print_usage(),
        _ => error("invalid command name"),
    }
}
