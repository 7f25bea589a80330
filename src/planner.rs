//! Translation-time hook placement.
//!
//! The planner runs when the host translates a basic block, never at
//! runtime. It classifies the block against the image registry, walks the
//! instructions through a fixed decision table and emits the hook plan the
//! host compiles in. Frequent but analysis-irrelevant instructions
//! (push/pop/lea and anything with a segment prefix) are deliberately
//! skipped for throughput.

use hashbrown::HashSet;

use crate::dbi::{
    BasicBlock, BlockPlan, HookAction, ImageLoad, InsertPoint, Instruction, InstructionPlan,
    OpcodeClass, PlannedHook, RoutineHook, RoutineInstrumentation,
};
use crate::entry::{BranchKind, StackModificationCause};
use crate::image::ImageRegistry;

/// Static configuration the planner consults for every block.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlannerConfig {
    /// Insert stack-pointer modification hooks.
    pub track_stack_allocations: bool,
    /// Insert RDRAND substitution hooks.
    pub substitute_rdrand: bool,
}

/// Decides, per basic block, which hooks to attach and where.
#[derive(Debug, Clone, Copy)]
pub struct Planner {
    config: PlannerConfig,
}

impl Planner {
    #[must_use]
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// Plans one basic block against the current image registry.
    ///
    /// Blocks not covered by any image are conservatively treated as
    /// interesting; this happens for a few early libc blocks the host
    /// executes before reporting the load, so the warning is suppressed
    /// until libc has been observed.
    #[must_use]
    pub fn plan_block(
        &self,
        block: &BasicBlock,
        registry: &ImageRegistry,
        libc_loaded: bool,
    ) -> BlockPlan {
        let interesting = match block.bounds() {
            Some((first, last)) => match registry.find_containing(first, last) {
                Some(image) => image.interesting,
                None => {
                    if libc_loaded {
                        log::warn!("cannot resolve image of basic block {first:#x}");
                    }
                    true
                }
            },
            None => true,
        };

        BlockPlan {
            interesting,
            instructions: block
                .instructions
                .iter()
                .map(|ins| InstructionPlan {
                    address: ins.address,
                    hooks: self.plan_instruction(ins, interesting),
                })
                .collect(),
        }
    }

    /// The per-instruction decision table. Rules are evaluated in order and
    /// the first matching control-flow rule consumes the instruction.
    fn plan_instruction(&self, ins: &Instruction, interesting: bool) -> Vec<PlannedHook> {
        let mut hooks = Vec::new();

        // Segment-register addressing is used for thread local storage and
        // the like; relevant code does not touch it, far transfers are
        // unsupported anyway.
        if ins.segment_prefix {
            return hooks;
        }

        match ins.opcode_class {
            OpcodeClass::Push | OpcodeClass::Pop | OpcodeClass::Lea => return hooks,
            OpcodeClass::Cpuid => {
                hooks.push(PlannedHook {
                    point: InsertPoint::Before,
                    action: HookAction::SaveCpuidInputs,
                });
                hooks.push(PlannedHook {
                    point: InsertPoint::After,
                    action: HookAction::RewriteCpuid,
                });
                return hooks;
            }
            OpcodeClass::Rdrand if self.config.substitute_rdrand => {
                hooks.push(PlannedHook {
                    point: InsertPoint::After,
                    action: HookAction::SubstituteRdrand,
                });
                return hooks;
            }
            _ => {}
        }

        if ins.is_call && ins.is_control_flow {
            // Calls have no fall-through, so the branch entry goes before
            // the instruction and is always taken.
            hooks.push(PlannedHook {
                point: InsertPoint::Before,
                action: HookAction::RecordBranch {
                    kind: BranchKind::Call,
                },
            });
            if self.config.track_stack_allocations {
                hooks.push(PlannedHook {
                    point: InsertPoint::TakenBranch,
                    action: HookAction::RecordStackPointerModification {
                        cause: StackModificationCause::Call,
                    },
                });
            }
            hooks.push(PlannedHook {
                point: InsertPoint::TakenBranch,
                action: HookAction::TrackAllocationCall,
            });
            return hooks;
        }

        if ins.is_branch && ins.is_control_flow {
            hooks.push(PlannedHook {
                point: InsertPoint::Before,
                action: HookAction::RecordBranch {
                    kind: BranchKind::Jump,
                },
            });
            return hooks;
        }

        if ins.is_ret && ins.is_control_flow {
            hooks.push(PlannedHook {
                point: InsertPoint::TakenBranch,
                action: HookAction::RecordReturnBranch,
            });
            if self.config.track_stack_allocations {
                hooks.push(PlannedHook {
                    point: InsertPoint::TakenBranch,
                    action: HookAction::RecordStackPointerModification {
                        cause: StackModificationCause::Return,
                    },
                });
            }
            hooks.push(PlannedHook {
                point: InsertPoint::TakenBranch,
                action: HookAction::TrackAllocationReturn,
            });
            return hooks;
        }

        // Branches are traced everywhere; everything below only matters
        // inside interesting images.
        if !interesting {
            return hooks;
        }

        if self.config.track_stack_allocations && ins.writes_full_stack_pointer {
            hooks.push(PlannedHook {
                point: InsertPoint::After,
                action: HookAction::RecordStackPointerModification {
                    cause: StackModificationCause::Other,
                },
            });
        }

        if ins.reads_memory && ins.standard_memop {
            hooks.push(PlannedHook {
                point: InsertPoint::Before,
                action: HookAction::RecordMemoryRead {
                    second_operand: false,
                },
            });
        }
        if ins.has_memory_read2 && ins.standard_memop {
            hooks.push(PlannedHook {
                point: InsertPoint::Before,
                action: HookAction::RecordMemoryRead {
                    second_operand: true,
                },
            });
        }
        if ins.writes_memory && ins.standard_memop {
            hooks.push(PlannedHook {
                point: InsertPoint::Before,
                action: HookAction::RecordMemoryWrite,
            });
        }

        hooks
    }
}

/// Resolves the routine hooks to install for a freshly loaded image.
///
/// The testcase markers are looked up in every image; the allocator hooks
/// are keyed on the providing library's name, `ntdll` for the Windows heap
/// and `libc.so` for the C runtime.
#[must_use]
pub fn plan_routine_hooks(image: &ImageLoad) -> Vec<RoutineInstrumentation> {
    let exports: HashSet<&str> = image.exports.iter().map(String::as_str).collect();
    let mut hooks = Vec::new();

    let mut add = |symbol: &str, hook: RoutineHook| {
        if exports.contains(symbol) {
            hooks.push(RoutineInstrumentation {
                symbol: symbol.to_string(),
                hook,
            });
        }
    };

    add("PinNotifyTestcaseStart", RoutineHook::TestcaseStart);
    add("PinNotifyTestcaseEnd", RoutineHook::TestcaseEnd);
    add("PinNotifyStackPointer", RoutineHook::StackPointerInfo);
    add("PinNotifyAllocation", RoutineHook::ExplicitAllocation);

    let name = image.name.to_lowercase();
    if name.contains("ntdll") {
        add("RtlAllocateHeap", RoutineHook::HeapAllocSize { size_arg: 2 });
        add("RtlFreeHeap", RoutineHook::HeapFreeAddress { addr_arg: 2 });
    }
    if name.contains("libc.so") {
        add("malloc", RoutineHook::HeapAllocSize { size_arg: 0 });
        add(
            "calloc",
            RoutineHook::CallocSize {
                count_arg: 0,
                size_arg: 1,
            },
        );
        add("realloc", RoutineHook::HeapAllocSize { size_arg: 1 });
        add("free", RoutineHook::HeapFreeAddress { addr_arg: 0 });
    }

    hooks
}
