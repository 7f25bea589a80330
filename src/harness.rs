//! The out-of-process testcase harness.
//!
//! The harness runs outside the DBI host, links the target library and
//! exposes the marker functions the planner finds by symbol. It reads
//! commands from stdin, one testcase per `t <id>` / path line pair, and
//! brackets each target run with the start/end markers. The markers must
//! survive as real, named, out-of-line symbols, hence `no_mangle`,
//! `inline(never)` and data-dependent return values.

use std::fs::File;
use std::hint::black_box;
use std::io::BufRead;

use crate::Error;

/// A target driven by the harness: initialized once, then run once per
/// testcase input file.
pub trait TraceTarget {
    /// One-time initialization, executed inside the trace prefix so that
    /// lazy loading does not pollute the first testcase.
    fn init(&mut self) -> Result<(), Error>;

    /// Processes one testcase input file.
    fn run(&mut self, input: &mut File) -> Result<(), Error>;
}

/// Marks the start of testcase `testcase_id`.
#[allow(non_snake_case)]
#[no_mangle]
#[inline(never)]
pub extern "C" fn PinNotifyTestcaseStart(testcase_id: i32) -> i32 {
    black_box(testcase_id.wrapping_add(42))
}

/// Marks the end of the current testcase.
#[allow(non_snake_case)]
#[no_mangle]
#[inline(never)]
pub extern "C" fn PinNotifyTestcaseEnd() -> i32 {
    black_box(42)
}

/// Reports the stack bounds of the harness thread.
#[allow(non_snake_case)]
#[no_mangle]
#[inline(never)]
pub extern "C" fn PinNotifyStackPointer(sp_min: u64, sp_max: u64) -> i32 {
    black_box(sp_min.wrapping_add(sp_max).wrapping_add(42) as i32)
}

/// Reports an allocation the tracer cannot observe through the allocator
/// hooks (e.g. memory handed out by a custom pool).
#[allow(non_snake_case)]
#[no_mangle]
#[inline(never)]
pub extern "C" fn PinNotifyAllocation(address: u64, size: u64) -> i32 {
    black_box(address.wrapping_add(size.wrapping_mul(23)) as i32)
}

#[cfg(target_arch = "x86_64")]
fn current_stack_pointer() -> u64 {
    let sp: u64;
    unsafe {
        core::arch::asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack));
    }
    sp
}

#[cfg(not(target_arch = "x86_64"))]
fn current_stack_pointer() -> u64 {
    // Close enough for stack bounds estimation on non-x86 builds.
    let marker = 0u8;
    core::ptr::addr_of!(marker) as u64
}

#[cfg(unix)]
fn stack_size_limit() -> u64 {
    use nix::sys::resource::{getrlimit, Resource};
    match getrlimit(Resource::RLIMIT_STACK) {
        Ok((soft, _hard)) => soft,
        Err(err) => {
            log::error!("error reading stack limit: {err}");
            8 * 1024 * 1024
        }
    }
}

#[cfg(not(unix))]
fn stack_size_limit() -> u64 {
    8 * 1024 * 1024
}

/// Estimates the stack bounds of the current thread and reports them
/// through [`PinNotifyStackPointer`].
///
/// There is no reliable portable way to get the exact stack extent, so the
/// current stack pointer is extended downwards by the stack size limit and
/// upwards to the next 64 KiB boundary.
pub fn report_stack_pointer() {
    let stack_base = current_stack_pointer();
    let stack_min = stack_base.saturating_sub(stack_size_limit());
    let stack_max = (stack_base.wrapping_add(0x10000)) & !0xFFFF;
    PinNotifyStackPointer(stack_min, stack_max);
}

/// One parsed stdin command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessCommand {
    /// `t <id>`: run the testcase with the given id.
    Testcase(i32),
    /// `e 0`: exit the harness.
    Exit,
}

/// Parses one command line of the harness protocol.
#[must_use]
pub fn parse_command(line: &str) -> Option<HarnessCommand> {
    let mut parts = line.split_whitespace();
    let command = parts.next()?;
    match command {
        "e" => Some(HarnessCommand::Exit),
        "t" => {
            let id = parts.next()?.parse().ok()?;
            Some(HarnessCommand::Testcase(id))
        }
        _ => None,
    }
}

/// Runs the harness protocol until an exit command or end of input.
///
/// Reads commands from `input` (stdin in production). For every testcase
/// the referenced file is opened, the start marker is called, the target
/// runs, and the end marker closes the testcase. Unopenable input files and
/// malformed commands are logged and skipped.
pub fn run_harness<T: TraceTarget>(
    target: &mut T,
    input: &mut dyn BufRead,
) -> Result<(), Error> {
    report_stack_pointer();
    target.init()?;

    let mut line = String::new();
    loop {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let command = match parse_command(&line) {
            Some(command) => command,
            None => {
                log::warn!("skipping malformed command: {}", line.trim_end());
                continue;
            }
        };
        match command {
            HarnessCommand::Exit => return Ok(()),
            HarnessCommand::Testcase(id) => {
                line.clear();
                if input.read_line(&mut line)? == 0 {
                    return Ok(());
                }
                let path = line.trim_end_matches(['\n', '\r']);

                let mut file = match File::open(path) {
                    Ok(file) => file,
                    Err(err) => {
                        log::error!("error opening input file '{path}': {err}");
                        continue;
                    }
                };

                PinNotifyTestcaseStart(id);
                let result = target.run(&mut file);
                PinNotifyTestcaseEnd();
                result?;
            }
        }
    }
}

/// A target that just consumes its input, useful for tracing the harness
/// machinery itself and as a template for real bindings.
#[derive(Debug, Default)]
pub struct PassthroughTarget;

impl TraceTarget for PassthroughTarget {
    fn init(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn run(&mut self, input: &mut File) -> Result<(), Error> {
        use std::io::Read;
        let mut contents = Vec::new();
        input.read_to_end(&mut contents)?;
        black_box(contents);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[derive(Default)]
    struct RecordingTarget {
        initialized: u32,
        runs: Vec<Vec<u8>>,
    }

    impl TraceTarget for RecordingTarget {
        fn init(&mut self) -> Result<(), Error> {
            self.initialized += 1;
            Ok(())
        }

        fn run(&mut self, input: &mut File) -> Result<(), Error> {
            use std::io::Read;
            let mut contents = Vec::new();
            input.read_to_end(&mut contents)?;
            self.runs.push(contents);
            Ok(())
        }
    }

    #[test]
    fn command_parsing() {
        assert_eq!(parse_command("t 7\n"), Some(HarnessCommand::Testcase(7)));
        assert_eq!(parse_command("e 0\n"), Some(HarnessCommand::Exit));
        assert_eq!(parse_command("e\n"), Some(HarnessCommand::Exit));
        assert_eq!(parse_command("t x\n"), None);
        assert_eq!(parse_command("t\n"), None);
        assert_eq!(parse_command("q 1\n"), None);
        assert_eq!(parse_command("\n"), None);
    }

    #[test]
    fn markers_return_data_dependent_values() {
        assert_eq!(PinNotifyTestcaseStart(1), 43);
        assert_eq!(PinNotifyTestcaseEnd(), 42);
        assert_eq!(PinNotifyStackPointer(1, 2), 45);
        assert_eq!(PinNotifyAllocation(10, 2), 56);
    }

    #[test]
    fn harness_runs_each_testcase_and_initializes_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let input_a = dir.path().join("a.bin");
        let input_b = dir.path().join("b.bin");
        std::fs::write(&input_a, b"aaaa").unwrap();
        std::fs::write(&input_b, b"bb").unwrap();

        let script = format!(
            "t 1\n{}\nt 2\n{}\ne 0\n",
            input_a.display(),
            input_b.display()
        );
        let mut target = RecordingTarget::default();
        run_harness(&mut target, &mut Cursor::new(script)).unwrap();

        assert_eq!(target.initialized, 1);
        assert_eq!(target.runs, vec![b"aaaa".to_vec(), b"bb".to_vec()]);
    }

    #[test]
    fn missing_input_files_are_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("ok.bin");
        std::fs::write(&input, b"x").unwrap();

        let script = format!("t 1\n/does/not/exist\nt 2\n{}\ne 0\n", input.display());
        let mut target = RecordingTarget::default();
        run_harness(&mut target, &mut Cursor::new(script)).unwrap();
        assert_eq!(target.runs.len(), 1);
    }

    #[test]
    fn end_of_input_terminates_the_loop() {
        let mut target = RecordingTarget::default();
        run_harness(&mut target, &mut Cursor::new("t 1\n")).unwrap();
        assert!(target.runs.is_empty());
    }

    #[test]
    fn stack_bounds_are_ordered() {
        // Smoke test: reporting must not panic and the rounding must hold.
        report_stack_pointer();
        let sp = current_stack_pointer();
        let max = (sp.wrapping_add(0x10000)) & !0xFFFF;
        assert_eq!(max % 0x10000, 0);
        assert!(max > sp);
    }
}
