//! The packed trace record format.
//!
//! Every event the tracer observes is encoded as one fixed-size
//! [`TraceEntry`]. Trace files are plain concatenations of these records in
//! little-endian byte order, so off-line analyses can parse them on any
//! platform by reading 24 bytes at a time.

use num_enum::TryFromPrimitive;
use static_assertions::const_assert_eq;

use crate::Error;

/// Number of entries held by one trace buffer.
pub const ENTRY_BUFFER_SIZE: usize = 16384;

/// The different kinds of trace entries. The discriminants are part of the
/// on-disk format and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u32)]
pub enum TraceEntryKind {
    /// A memory read access.
    MemoryRead = 1,
    /// A memory write access.
    MemoryWrite = 2,
    /// The size parameter of a heap allocation.
    HeapAllocSizeParameter = 3,
    /// The address returned by a heap allocation.
    HeapAllocAddressReturn = 4,
    /// The address parameter of a heap deallocation.
    HeapFreeAddressParameter = 5,
    /// A code branch.
    Branch = 6,
    /// Stack pointer bounds reported by the harness.
    StackPointerInfo = 7,
    /// A modification of the stack pointer.
    StackPointerModification = 8,
}

/// Branch kind stored in bits 1-2 of the flag byte of a [`Branch`] entry.
///
/// [`Branch`]: TraceEntryKind::Branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum BranchKind {
    Jump = 1,
    Call = 2,
    Return = 3,
}

impl BranchKind {
    /// Encodes the flag byte for a branch of this kind: bit 0 carries the
    /// taken bit, bits 1-2 the kind.
    #[must_use]
    pub const fn flag(self, taken: bool) -> u8 {
        ((self as u8) << 1) | taken as u8
    }
}

/// Cause stored in bits 0-1 of the flag byte of a
/// [`StackPointerModification`] entry.
///
/// [`StackPointerModification`]: TraceEntryKind::StackPointerModification
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum StackModificationCause {
    Call = 1,
    Return = 2,
    Other = 3,
}

impl StackModificationCause {
    /// Encodes the flag byte for a stack pointer modification.
    #[must_use]
    pub const fn flag(self) -> u8 {
        self as u8
    }
}

/// One record in a trace buffer.
///
/// The layout is fixed: `kind` at offset 0, `flag` at 4, one padding byte at
/// 5, `param0` at 6, `param1` at 8, `param2` at 16; 24 bytes total. With
/// `repr(C)` the natural alignment of the field types already yields exactly
/// this layout, which the assertion below pins down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TraceEntry {
    /// The kind of this entry, as the raw `TraceEntryKind` discriminant.
    pub kind: u32,
    /// Flag byte. Used by `Branch` and `StackPointerModification`.
    pub flag: u8,
    /// Padding for reliable parsing by analysis programs.
    padding: u8,
    /// The size of a memory access. Used by `MemoryRead`/`MemoryWrite`.
    pub param0: u16,
    /// Instruction address, allocation size or stack minimum, depending on
    /// the entry kind.
    pub param1: u64,
    /// Accessed or passed memory address, branch target or stack maximum,
    /// depending on the entry kind.
    pub param2: u64,
}

const_assert_eq!(core::mem::size_of::<TraceEntry>(), TraceEntry::SIZE);
const_assert_eq!(core::mem::align_of::<TraceEntry>(), 8);

impl TraceEntry {
    /// Serialized size of one entry in bytes.
    pub const SIZE: usize = 24;

    /// An all-zero entry, used to initialize buffers.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            kind: 0,
            flag: 0,
            padding: 0,
            param0: 0,
            param1: 0,
            param2: 0,
        }
    }

    /// Creates an entry with every field set explicitly; unused parameters
    /// are expected to be passed as zero so that records never carry stale
    /// data.
    #[must_use]
    pub const fn new(kind: TraceEntryKind, flag: u8, param0: u16, param1: u64, param2: u64) -> Self {
        Self {
            kind: kind as u32,
            flag,
            padding: 0,
            param0,
            param1,
            param2,
        }
    }

    /// Decodes the entry kind, failing on values outside the known range.
    pub fn entry_kind(&self) -> Result<TraceEntryKind, Error> {
        TraceEntryKind::try_from(self.kind).map_err(|_| Error::UnknownEntryKind(self.kind))
    }

    /// Serializes this entry into its on-disk little-endian form.
    #[must_use]
    pub fn to_le_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.kind.to_le_bytes());
        buf[4] = self.flag;
        buf[5] = self.padding;
        buf[6..8].copy_from_slice(&self.param0.to_le_bytes());
        buf[8..16].copy_from_slice(&self.param1.to_le_bytes());
        buf[16..24].copy_from_slice(&self.param2.to_le_bytes());
        buf
    }

    /// Deserializes one entry from its on-disk little-endian form.
    #[must_use]
    pub fn from_le_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            kind: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            flag: bytes[4],
            padding: bytes[5],
            param0: u16::from_le_bytes(bytes[6..8].try_into().unwrap()),
            param1: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            param2: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
        }
    }
}

/// Reinterprets a buffer of entries as raw bytes for bulk writing.
///
/// The tracer only targets little-endian x86, where the in-memory
/// representation equals the on-disk representation; `TraceEntry` is
/// `repr(C)` without padding bytes, so every byte is initialized.
#[must_use]
pub fn entries_as_bytes(entries: &[TraceEntry]) -> &[u8] {
    unsafe {
        core::slice::from_raw_parts(
            entries.as_ptr().cast::<u8>(),
            entries.len() * TraceEntry::SIZE,
        )
    }
}

/// Parses a complete trace byte stream into entries.
///
/// Fails if the stream is not a whole multiple of the record size; a
/// truncated tail indicates the traced process died mid-write.
pub fn parse_trace(bytes: &[u8]) -> Result<Vec<TraceEntry>, Error> {
    let trailing = bytes.len() % TraceEntry::SIZE;
    if trailing != 0 {
        return Err(Error::TruncatedTrace(trailing));
    }
    Ok(bytes
        .chunks_exact(TraceEntry::SIZE)
        .map(|chunk| TraceEntry::from_le_bytes(chunk.try_into().unwrap()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_is_packed_to_24_bytes() {
        assert_eq!(core::mem::size_of::<TraceEntry>(), 24);
        assert_eq!(core::mem::size_of::<[TraceEntry; 4]>(), 96);
    }

    #[test]
    fn field_offsets_match_the_wire_format() {
        let entry = TraceEntry::new(
            TraceEntryKind::MemoryRead,
            0xAB,
            0x1234,
            0x1122_3344_5566_7788,
            0x99AA_BBCC_DDEE_FF00,
        );
        let bytes = entry.to_le_bytes();
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes()); // kind @ 0
        assert_eq!(bytes[4], 0xAB); // flag @ 4
        assert_eq!(bytes[5], 0); // padding @ 5
        assert_eq!(&bytes[6..8], &0x1234u16.to_le_bytes()); // param0 @ 6
        assert_eq!(&bytes[8..16], &0x1122_3344_5566_7788u64.to_le_bytes()); // param1 @ 8
        assert_eq!(&bytes[16..24], &0x99AA_BBCC_DDEE_FF00u64.to_le_bytes()); // param2 @ 16
    }

    #[test]
    fn in_memory_layout_equals_wire_layout() {
        let entry = TraceEntry::new(TraceEntryKind::Branch, 0x05, 0, 0x4000, 0x5000);
        assert_eq!(entries_as_bytes(&[entry]), &entry.to_le_bytes()[..]);
    }

    #[test]
    fn branch_flags_encode_kind_and_taken_bit() {
        assert_eq!(BranchKind::Jump.flag(false), 0b010);
        assert_eq!(BranchKind::Jump.flag(true), 0b011);
        assert_eq!(BranchKind::Call.flag(true), 0b101);
        assert_eq!(BranchKind::Return.flag(true), 0b111);
    }

    #[test]
    fn stack_modification_flags() {
        assert_eq!(StackModificationCause::Call.flag(), 1);
        assert_eq!(StackModificationCause::Return.flag(), 2);
        assert_eq!(StackModificationCause::Other.flag(), 3);
    }

    #[test]
    fn parse_round_trips() {
        let entries = [
            TraceEntry::new(TraceEntryKind::MemoryWrite, 0, 8, 0x1000, 0x2000),
            TraceEntry::new(TraceEntryKind::Branch, BranchKind::Call.flag(true), 0, 3, 4),
        ];
        let parsed = parse_trace(entries_as_bytes(&entries)).unwrap();
        assert_eq!(parsed, entries);
        assert_eq!(parsed[0].entry_kind().unwrap(), TraceEntryKind::MemoryWrite);
    }

    #[test]
    fn parse_rejects_truncated_streams() {
        let bytes = [0u8; 25];
        assert!(matches!(
            parse_trace(&bytes),
            Err(Error::TruncatedTrace(1))
        ));
    }

    #[test]
    fn parse_surfaces_unknown_kinds() {
        let entry = TraceEntry {
            kind: 99,
            ..TraceEntry::zeroed()
        };
        let parsed = parse_trace(entries_as_bytes(&[entry])).unwrap();
        assert!(matches!(
            parsed[0].entry_kind(),
            Err(Error::UnknownEntryKind(99))
        ));
    }
}
