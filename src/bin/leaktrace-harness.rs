//! Standalone testcase harness.
//!
//! Runs the harness protocol over stdin with the built-in passthrough
//! target. Real deployments replace the target with bindings to the library
//! under analysis; the protocol and the marker exports stay the same.

use std::io::BufRead;

use clap::Parser;
use leaktrace::harness::{run_harness, PassthroughTarget};

#[derive(Parser, Debug)]
#[command(
    name = "leaktrace-harness",
    about = "Feeds testcase files to the traced target, driven by stdin commands"
)]
struct HarnessArgs {}

fn main() {
    env_logger::init();
    let _args = HarnessArgs::parse();

    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let mut target = PassthroughTarget;
    if let Err(err) = run_harness(&mut target, &mut input as &mut dyn BufRead) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
