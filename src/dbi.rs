//! Contract with the DBI host.
//!
//! The host owns instruction decoding, code caches, symbol tables and thread
//! scheduling; the tracer only sees the views defined here. At translation
//! time the host hands basic blocks to [`DbiTool::instrument_block`] and
//! image loads to [`DbiTool::instrument_image`], receiving back plans that
//! say which hooks to place where. At runtime it invokes
//! [`DbiTool::execute_hook`] with the bound argument values whenever an
//! instrumented site fires.

use crate::cpu::CpuidRegisters;
use crate::entry::{BranchKind, StackModificationCause};

/// Host thread identifier. The tracer only instruments thread 0.
pub type ThreadId = u32;

/// The coarse opcode classification the planner selects on. Everything the
/// decision table does not care about collapses to `Other`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OpcodeClass {
    /// push, pusha, pushf, pushfd, pushfq and friends.
    Push,
    /// pop, popa, popf, popfd, popfq and friends.
    Pop,
    Lea,
    Cpuid,
    Rdrand,
    #[default]
    Other,
}

/// Decoded view of one instruction, as reported by the host.
#[derive(Debug, Clone, Default)]
pub struct Instruction {
    pub address: u64,
    pub opcode_class: OpcodeClass,
    /// Instruction carries a segment override prefix (fs/gs etc.).
    pub segment_prefix: bool,
    pub is_call: bool,
    pub is_branch: bool,
    pub is_ret: bool,
    pub is_control_flow: bool,
    /// Instruction reads memory through a standard operand.
    pub reads_memory: bool,
    /// Instruction has a second memory read operand (e.g. cmps).
    pub has_memory_read2: bool,
    /// Instruction writes memory through a standard operand.
    pub writes_memory: bool,
    /// Memory operands follow the standard base+index*scale+disp form.
    pub standard_memop: bool,
    /// Instruction writes the full-width stack pointer register.
    pub writes_full_stack_pointer: bool,
}

/// One basic block as delivered by the host at translation time.
#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    pub instructions: Vec<Instruction>,
}

impl BasicBlock {
    /// Addresses of the first and last instruction, if the block is
    /// non-empty.
    #[must_use]
    pub fn bounds(&self) -> Option<(u64, u64)> {
        match (self.instructions.first(), self.instructions.last()) {
            (Some(first), Some(last)) => Some((first.address, last.address)),
            _ => None,
        }
    }
}

/// One mapped region of a loaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub low: u64,
    pub high: u64,
}

/// An image load event, including the exported symbol names the host can
/// resolve for routine instrumentation.
#[derive(Debug, Clone, Default)]
pub struct ImageLoad {
    pub name: String,
    pub regions: Vec<MemoryRegion>,
    pub exports: Vec<String>,
}

impl ImageLoad {
    /// The union of all region extents.
    #[must_use]
    pub fn extent(&self) -> (u64, u64) {
        let mut iter = self.regions.iter();
        let Some(first) = iter.next() else {
            return (0, 0);
        };
        iter.fold((first.low, first.high), |(low, high), region| {
            (low.min(region.low), high.max(region.high))
        })
    }
}

/// Where a hook is attached relative to its instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPoint {
    /// Before the instruction executes.
    Before,
    /// After the instruction, on the fall-through path.
    After,
    /// After the instruction, on the taken-branch path.
    TakenBranch,
}

/// The runtime action a planned hook performs. Static arguments are carried
/// in the variant; everything else is bound from the [`HookContext`] at
/// execution time. Dispatch is a plain enum match, never virtual.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    /// Save the architectural EAX/ECX inputs of a CPUID instruction into
    /// the thread context before it executes.
    SaveCpuidInputs,
    /// Overwrite the CPUID output registers according to the selected
    /// profile.
    RewriteCpuid,
    /// Overwrite the RDRAND destination register with the fixed value.
    SubstituteRdrand,
    /// Record a branch entry. Calls are recorded as always-taken; jumps
    /// carry the runtime taken predicate.
    RecordBranch { kind: BranchKind },
    /// Record the branch entry of a taken return instruction.
    RecordReturnBranch,
    /// Record a stack pointer modification with the given cause.
    RecordStackPointerModification { cause: StackModificationCause },
    /// Count a taken call while allocation-return tracking is active.
    TrackAllocationCall,
    /// Count a taken return and emit the allocation address entry when the
    /// allocator frame unwinds.
    TrackAllocationReturn,
    /// Record a memory read; `second_operand` selects the second read
    /// operand of instructions that have one.
    RecordMemoryRead { second_operand: bool },
    /// Record a memory write.
    RecordMemoryWrite,
}

/// One hook placement decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedHook {
    pub point: InsertPoint,
    pub action: HookAction,
}

/// All hooks planned for one instruction, in execution order per insertion
/// point.
#[derive(Debug, Clone, Default)]
pub struct InstructionPlan {
    pub address: u64,
    pub hooks: Vec<PlannedHook>,
}

/// The translation result for one basic block.
#[derive(Debug, Clone, Default)]
pub struct BlockPlan {
    /// Whether the block lies in an interesting image (memory accesses and
    /// stack writes are only traced if it does).
    pub interesting: bool,
    pub instructions: Vec<InstructionPlan>,
}

impl BlockPlan {
    /// Total number of planned hooks, mostly useful for diagnostics.
    #[must_use]
    pub fn hook_count(&self) -> usize {
        self.instructions.iter().map(|i| i.hooks.len()).sum()
    }
}

/// Routine-level instrumentation resolved by symbol at image load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineHook {
    /// `PinNotifyTestcaseStart(id)`: switch the writer to a new testcase.
    TestcaseStart,
    /// `PinNotifyTestcaseEnd()`: close the current testcase.
    TestcaseEnd,
    /// `PinNotifyStackPointer(min, max)`: record the stack bounds.
    StackPointerInfo,
    /// `PinNotifyAllocation(addr, size)`: record an externally observed
    /// allocation as a size/address entry pair.
    ExplicitAllocation,
    /// Allocator entry: record the size argument and arm return tracking.
    HeapAllocSize { size_arg: usize },
    /// `calloc` entry: record `count * size` and arm return tracking.
    CallocSize { count_arg: usize, size_arg: usize },
    /// Deallocator entry: record the address argument.
    HeapFreeAddress { addr_arg: usize },
}

/// Binding of a [`RoutineHook`] to the exported symbol the host resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutineInstrumentation {
    pub symbol: String,
    pub hook: RoutineHook,
}

/// Runtime argument values the host binds for an instruction hook, the
/// moral equivalent of the symbolic hook arguments of the instrumentation
/// API. Fields irrelevant to a given action are ignored; the CPUID register
/// block and the RDRAND destination are written back by the rewrite hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct HookContext {
    pub instruction_address: u64,
    pub branch_target: u64,
    pub branch_taken: bool,
    pub memory_read_address: u64,
    pub memory_read2_address: u64,
    pub memory_write_address: u64,
    pub memory_read_size: u16,
    pub memory_write_size: u16,
    pub stack_pointer: u64,
    /// Return value register at function exit, bound for allocation return
    /// tracking.
    pub function_return_value: u64,
    /// CPUID register block; inputs before the instruction, outputs after.
    pub cpuid: CpuidRegisters,
    /// RDRAND destination register value after the instruction.
    pub rdrand_output: u64,
}

/// What the tool tells the host after an internal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionDisposition {
    /// The host should continue normal processing.
    Handled,
    /// The host should apply its default handling (terminate the process).
    Unhandled,
}

/// The callbacks a tracing tool registers with the DBI host.
///
/// Translation callbacks (`instrument_*`) run serialized with respect to
/// each other; runtime callbacks run in the context of the target thread.
pub trait DbiTool {
    /// Called once per translated basic block; returns the hook plan the
    /// host compiles into the block.
    fn instrument_block(&mut self, block: &BasicBlock) -> BlockPlan;

    /// Called once per image load; returns the routine hooks the host
    /// should install by symbol.
    fn instrument_image(&mut self, image: &ImageLoad) -> Vec<RoutineInstrumentation>;

    /// Called when a thread starts, before it executes instrumented code.
    fn thread_start(&mut self, tid: ThreadId);

    /// Called when a thread exits.
    fn thread_exit(&mut self, tid: ThreadId);

    /// Called whenever a planned instruction hook fires.
    fn execute_hook(&mut self, tid: ThreadId, action: HookAction, ctx: &mut HookContext);

    /// Called at the entry of an instrumented routine with the bound
    /// argument registers.
    fn routine_entry(&mut self, tid: ThreadId, hook: RoutineHook, args: &[u64]);

    /// Called when the tool itself raised an internal error.
    fn internal_error(&mut self, description: &str) -> ExceptionDisposition {
        log::error!("internal exception: {description}");
        ExceptionDisposition::Unhandled
    }
}
