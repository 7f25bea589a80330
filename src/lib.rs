//! Dynamic binary instrumentation tracer for side-channel analysis.
//!
//! `leaktrace` plugs into a DBI host (an Intel-Pin-like framework, modeled
//! by the contract in [`dbi`]) and records a fixed-layout binary stream of
//! memory accesses, control flow, heap allocations and stack pointer
//! movements of the instrumented process. The trace is split into a prefix
//! phase (everything before the first testcase, including image-load
//! metadata) and one file per testcase, driven by marker calls from the
//! out-of-process [`harness`].
//!
//! The interesting engineering lives in three places:
//! * the [`planner`], which decides at translation time which hooks each
//!   instruction gets,
//! * the [`writer`], which turns hook invocations into bit-exact 24-byte
//!   records, and
//! * the semantic rewrites: CPUID feature masking against the fixed
//!   profiles in [`cpu`], deterministic RDRAND substitution, and
//!   allocation-return tracking across tail-called allocators in
//!   [`alloc`].

pub mod alloc;
pub mod cpu;
pub mod dbi;
pub mod entry;
pub mod harness;
pub mod image;
pub mod options;
pub mod planner;
pub mod tracer;
pub mod writer;

use thiserror::Error as ThisError;

/// Errors surfaced by the tracer and the harness.
#[derive(ThisError, Debug)]
pub enum Error {
    /// An output file could not be created; fatal for the tool.
    #[error("could not open output file '{path}': {source}")]
    OutputFile {
        path: String,
        source: std::io::Error,
    },

    /// A trace byte stream did not end on an entry boundary.
    #[error("truncated trace record ({0} trailing bytes)")]
    TruncatedTrace(usize),

    /// A trace entry carried an unknown kind tag.
    #[error("unknown trace entry kind {0}")]
    UnknownEntryKind(u32),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub use crate::dbi::DbiTool;
pub use crate::options::TracerOptions;
pub use crate::tracer::Tracer;
