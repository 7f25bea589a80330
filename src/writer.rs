//! Per-thread trace buffering and file output.
//!
//! The writer owns a fixed buffer of [`TraceEntry`] records and the file
//! currently receiving them. Output is split into two phases: everything up
//! to the first testcase goes into `{prefix}prefix.trace` (with image-load
//! metadata in `{prefix}prefix_data.txt`), and each testcase `id` gets its
//! own `{prefix}t{id}.trace`. Between testcases the buffer keeps advancing
//! but flushes are discarded.

use std::fs::File;
use std::io::{BufWriter, Write};

use crate::entry::{
    BranchKind, StackModificationCause, TraceEntry, TraceEntryKind, ENTRY_BUFFER_SIZE,
};
use crate::Error;

/// Testcase id value meaning "no testcase active".
const IDLE: i32 = -1;

/// Process-wide prefix phase state: the mode flag and the image metadata
/// side file. Exactly one instance exists, owned by the tracer, created
/// before any callback can run; the hot path is single-threaded, so plain
/// ownership replaces the global flag a multi-instance design would need.
#[derive(Debug)]
pub struct PrefixState {
    active: bool,
    metadata: Option<BufWriter<File>>,
}

impl PrefixState {
    /// Starts prefix mode and opens `{prefix}prefix_data.txt` truncated.
    pub fn init(output_prefix: &str) -> Result<Self, Error> {
        let path = format!("{output_prefix}prefix_data.txt");
        let file = File::create(&path).map_err(|source| Error::OutputFile { path, source })?;
        log::info!("trace prefix mode started");
        Ok(Self {
            active: true,
            metadata: Some(BufWriter::new(file)),
        })
    }

    /// Whether the process is still tracing the prefix.
    #[must_use]
    pub fn active(&self) -> bool {
        self.active
    }

    /// Appends one image-load line to the metadata file. Loads observed
    /// after the prefix phase are not recorded.
    pub fn record_image_load(
        &mut self,
        interesting: bool,
        start_address: u64,
        end_address: u64,
        name: &str,
    ) -> Result<(), Error> {
        let Some(metadata) = self.metadata.as_mut() else {
            log::warn!("image load ignored: {name}");
            return Ok(());
        };
        writeln!(
            metadata,
            "i\t{}\t{start_address:x}\t{end_address:x}\t{name}",
            i32::from(interesting)
        )?;
        Ok(())
    }

    /// Leaves prefix mode, closing the metadata file.
    fn close(&mut self) -> Result<(), Error> {
        if let Some(mut metadata) = self.metadata.take() {
            metadata.flush()?;
        }
        self.active = false;
        log::info!("trace prefix mode ended");
        Ok(())
    }
}

/// Buffered trace output for one instrumented thread.
#[derive(Debug)]
pub struct TraceWriter {
    output_prefix: String,
    file: Option<File>,
    current_path: String,
    entries: Box<[TraceEntry]>,
    testcase_id: i32,
}

impl TraceWriter {
    /// Creates a writer for the given output prefix and opens the prefix
    /// trace file truncated.
    pub fn new(output_prefix: &str) -> Result<Self, Error> {
        let mut writer = Self {
            output_prefix: output_prefix.to_string(),
            file: None,
            current_path: String::new(),
            entries: vec![TraceEntry::zeroed(); ENTRY_BUFFER_SIZE].into_boxed_slice(),
            testcase_id: IDLE,
        };
        writer.open_output_file(format!("{output_prefix}prefix.trace"))?;
        Ok(writer)
    }

    fn open_output_file(&mut self, path: String) -> Result<(), Error> {
        let file = File::create(&path).map_err(|source| Error::OutputFile {
            path: path.clone(),
            source,
        })?;
        self.file = Some(file);
        self.current_path = path;
        Ok(())
    }

    /// Index of the first buffer entry.
    #[must_use]
    pub const fn begin() -> usize {
        0
    }

    /// Index one past the last buffer entry.
    #[must_use]
    pub const fn end() -> usize {
        ENTRY_BUFFER_SIZE
    }

    /// Whether the next-entry cursor has reached the end of the buffer.
    #[must_use]
    pub const fn buffer_full(next: usize) -> bool {
        next == ENTRY_BUFFER_SIZE
    }

    /// The testcase id currently receiving output, or `None` between
    /// testcases.
    #[must_use]
    pub fn current_testcase(&self) -> Option<i32> {
        (self.testcase_id != IDLE).then_some(self.testcase_id)
    }

    /// Writes buffer entries `[0, upto)` to the current output file.
    ///
    /// Outside of a testcase and outside of the prefix phase the data is
    /// silently discarded: the buffer keeps filling, but nothing of the
    /// inter-testcase execution reaches disk.
    pub fn flush(&mut self, upto: usize, prefix_active: bool) -> Result<(), Error> {
        if self.testcase_id == IDLE && !prefix_active {
            return Ok(());
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(crate::entry::entries_as_bytes(&self.entries[..upto]))?;
        }
        Ok(())
    }

    /// Switches to a new testcase: ends the prefix phase on first use, then
    /// opens `{prefix}t{id}.trace` truncated.
    pub fn testcase_start(
        &mut self,
        testcase_id: i32,
        next: usize,
        prefix: &mut PrefixState,
    ) -> Result<(), Error> {
        if prefix.active() {
            self.testcase_end(next, prefix)?;
        }
        self.testcase_id = testcase_id;
        self.open_output_file(format!("{}t{}.trace", self.output_prefix, testcase_id))?;
        log::info!("switched to testcase #{testcase_id}");
        Ok(())
    }

    /// Ends the current testcase (or the prefix phase): flushes the
    /// remaining buffer, closes the file and, for a real testcase, emits the
    /// completion notification line on stdout. Returns the completed trace
    /// path when a notification was emitted.
    pub fn testcase_end(
        &mut self,
        next: usize,
        prefix: &mut PrefixState,
    ) -> Result<Option<String>, Error> {
        if next != Self::begin() {
            self.flush(next, prefix.active())?;
        }
        self.file = None;

        let mut completed = None;
        if prefix.active() {
            prefix.close()?;
        } else {
            // Single write so that readers of our stdout see whole lines.
            let line = format!("t\t{}\n", self.current_path);
            std::io::stdout().write_all(line.as_bytes())?;
            completed = Some(self.current_path.clone());
        }

        self.testcase_id = IDLE;
        Ok(completed)
    }

    fn insert(&mut self, next: usize, entry: TraceEntry) -> usize {
        self.entries[next] = entry;
        next + 1
    }

    /// Creates a new `MemoryRead` entry.
    pub fn insert_memory_read(
        &mut self,
        next: usize,
        instruction_address: u64,
        memory_address: u64,
        size: u16,
    ) -> usize {
        self.insert(
            next,
            TraceEntry::new(
                TraceEntryKind::MemoryRead,
                0,
                size,
                instruction_address,
                memory_address,
            ),
        )
    }

    /// Creates a new `MemoryWrite` entry.
    pub fn insert_memory_write(
        &mut self,
        next: usize,
        instruction_address: u64,
        memory_address: u64,
        size: u16,
    ) -> usize {
        self.insert(
            next,
            TraceEntry::new(
                TraceEntryKind::MemoryWrite,
                0,
                size,
                instruction_address,
                memory_address,
            ),
        )
    }

    /// Creates a new `HeapAllocSizeParameter` entry.
    pub fn insert_heap_alloc_size(&mut self, next: usize, size: u64) -> usize {
        self.insert(
            next,
            TraceEntry::new(TraceEntryKind::HeapAllocSizeParameter, 0, 0, size, 0),
        )
    }

    /// Creates a new `HeapAllocSizeParameter` entry for `calloc(count,
    /// size)`, reducing the two arguments to their product.
    pub fn insert_calloc_size(&mut self, next: usize, count: u64, size: u64) -> usize {
        self.insert_heap_alloc_size(next, count.wrapping_mul(size))
    }

    /// Creates a new `HeapAllocAddressReturn` entry.
    pub fn insert_heap_alloc_return(&mut self, next: usize, memory_address: u64) -> usize {
        self.insert(
            next,
            TraceEntry::new(
                TraceEntryKind::HeapAllocAddressReturn,
                0,
                0,
                0,
                memory_address,
            ),
        )
    }

    /// Creates a new `HeapFreeAddressParameter` entry.
    pub fn insert_heap_free_address(&mut self, next: usize, memory_address: u64) -> usize {
        self.insert(
            next,
            TraceEntry::new(
                TraceEntryKind::HeapFreeAddressParameter,
                0,
                0,
                0,
                memory_address,
            ),
        )
    }

    /// Creates a new `Branch` entry.
    pub fn insert_branch(
        &mut self,
        next: usize,
        source_address: u64,
        target_address: u64,
        taken: bool,
        kind: BranchKind,
    ) -> usize {
        self.insert(
            next,
            TraceEntry::new(
                TraceEntryKind::Branch,
                kind.flag(taken),
                0,
                source_address,
                target_address,
            ),
        )
    }

    /// Creates a new `StackPointerInfo` entry.
    pub fn insert_stack_pointer_info(
        &mut self,
        next: usize,
        stack_min: u64,
        stack_max: u64,
    ) -> usize {
        self.insert(
            next,
            TraceEntry::new(TraceEntryKind::StackPointerInfo, 0, 0, stack_min, stack_max),
        )
    }

    /// Creates a new `StackPointerModification` entry.
    pub fn insert_stack_pointer_modification(
        &mut self,
        next: usize,
        instruction_address: u64,
        stack_pointer: u64,
        cause: StackModificationCause,
    ) -> usize {
        self.insert(
            next,
            TraceEntry::new(
                TraceEntryKind::StackPointerModification,
                cause.flag(),
                0,
                instruction_address,
                stack_pointer,
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::parse_trace;
    use tempfile::TempDir;

    fn prefix_in(dir: &TempDir) -> String {
        format!("{}/run_", dir.path().display())
    }

    fn read_trace(path: &str) -> Vec<TraceEntry> {
        parse_trace(&std::fs::read(path).unwrap()).unwrap()
    }

    #[test]
    fn new_creates_the_prefix_trace_file() {
        let dir = TempDir::new().unwrap();
        let prefix = prefix_in(&dir);
        let _writer = TraceWriter::new(&prefix).unwrap();
        assert!(std::fs::metadata(format!("{prefix}prefix.trace")).is_ok());
    }

    #[test]
    fn new_fails_on_unwritable_prefix() {
        let err = TraceWriter::new("/nonexistent-dir/run_").unwrap_err();
        assert!(matches!(err, Error::OutputFile { .. }));
    }

    #[test]
    fn prefix_writes_land_in_the_prefix_trace() {
        let dir = TempDir::new().unwrap();
        let prefix = prefix_in(&dir);
        let mut prefix_state = PrefixState::init(&prefix).unwrap();
        let mut writer = TraceWriter::new(&prefix).unwrap();

        let mut next = TraceWriter::begin();
        next = writer.insert_branch(next, 0x10, 0x20, true, BranchKind::Call);
        writer.testcase_start(1, next, &mut prefix_state).unwrap();

        let entries = read_trace(&format!("{prefix}prefix.trace"));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_kind().unwrap(), TraceEntryKind::Branch);
        assert!(!prefix_state.active());
    }

    #[test]
    fn testcase_files_are_flushed_and_notified_on_end() {
        let dir = TempDir::new().unwrap();
        let prefix = prefix_in(&dir);
        let mut prefix_state = PrefixState::init(&prefix).unwrap();
        let mut writer = TraceWriter::new(&prefix).unwrap();

        writer
            .testcase_start(7, TraceWriter::begin(), &mut prefix_state)
            .unwrap();
        assert_eq!(writer.current_testcase(), Some(7));

        let mut next = TraceWriter::begin();
        next = writer.insert_memory_read(next, 0x1000, 0x2000, 8);
        next = writer.insert_memory_write(next, 0x1004, 0x2008, 4);
        let completed = writer.testcase_end(next, &mut prefix_state).unwrap();

        let path = format!("{prefix}t7.trace");
        assert_eq!(completed.as_deref(), Some(path.as_str()));
        let entries = read_trace(&path);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].param0, 8);
        assert_eq!(entries[1].entry_kind().unwrap(), TraceEntryKind::MemoryWrite);
        assert_eq!(writer.current_testcase(), None);
    }

    #[test]
    fn idle_flushes_are_discarded() {
        let dir = TempDir::new().unwrap();
        let prefix = prefix_in(&dir);
        let mut prefix_state = PrefixState::init(&prefix).unwrap();
        let mut writer = TraceWriter::new(&prefix).unwrap();

        writer
            .testcase_start(1, TraceWriter::begin(), &mut prefix_state)
            .unwrap();
        writer
            .testcase_end(TraceWriter::begin(), &mut prefix_state)
            .unwrap();

        // Entries accumulated while idle must never reach any file.
        let mut next = TraceWriter::begin();
        next = writer.insert_heap_alloc_size(next, 64);
        writer.flush(next, prefix_state.active()).unwrap();

        writer.testcase_start(2, TraceWriter::begin(), &mut prefix_state).unwrap();
        writer.testcase_end(TraceWriter::begin(), &mut prefix_state).unwrap();

        assert_eq!(std::fs::read(format!("{prefix}t1.trace")).unwrap().len(), 0);
        assert_eq!(std::fs::read(format!("{prefix}t2.trace")).unwrap().len(), 0);
    }

    #[test]
    fn completed_files_are_whole_multiples_of_the_entry_size() {
        let dir = TempDir::new().unwrap();
        let prefix = prefix_in(&dir);
        let mut prefix_state = PrefixState::init(&prefix).unwrap();
        let mut writer = TraceWriter::new(&prefix).unwrap();

        writer
            .testcase_start(3, TraceWriter::begin(), &mut prefix_state)
            .unwrap();
        let mut next = TraceWriter::begin();
        for i in 0..37 {
            next = writer.insert_memory_read(next, i, i * 2, 1);
        }
        writer.testcase_end(next, &mut prefix_state).unwrap();

        let len = std::fs::read(format!("{prefix}t3.trace")).unwrap().len();
        assert_eq!(len, 37 * TraceEntry::SIZE);
        assert_eq!(len % TraceEntry::SIZE, 0);
    }

    #[test]
    fn metadata_file_records_image_loads_line_by_line() {
        let dir = TempDir::new().unwrap();
        let prefix = prefix_in(&dir);
        let mut prefix_state = PrefixState::init(&prefix).unwrap();
        prefix_state
            .record_image_load(true, 0x1000, 0x1fff, "/opt/target.exe")
            .unwrap();
        prefix_state
            .record_image_load(false, 0x7f00_0000_0000, 0x7f00_0010_0000, "/lib/libc.so.6")
            .unwrap();

        let mut writer = TraceWriter::new(&prefix).unwrap();
        writer
            .testcase_start(1, TraceWriter::begin(), &mut prefix_state)
            .unwrap();

        let metadata = std::fs::read_to_string(format!("{prefix}prefix_data.txt")).unwrap();
        assert_eq!(
            metadata,
            "i\t1\t1000\t1fff\t/opt/target.exe\n\
             i\t0\t7f0000000000\t7f0000100000\t/lib/libc.so.6\n"
        );
    }

    #[test]
    fn image_loads_after_the_prefix_are_ignored() {
        let dir = TempDir::new().unwrap();
        let prefix = prefix_in(&dir);
        let mut prefix_state = PrefixState::init(&prefix).unwrap();
        let mut writer = TraceWriter::new(&prefix).unwrap();
        writer
            .testcase_start(1, TraceWriter::begin(), &mut prefix_state)
            .unwrap();

        prefix_state
            .record_image_load(true, 0x1000, 0x2000, "/late.so")
            .unwrap();
        let metadata = std::fs::read_to_string(format!("{prefix}prefix_data.txt")).unwrap();
        assert!(metadata.is_empty());
    }
}
