//! The tracing tool itself: per-thread state, runtime hook execution and
//! the host-facing callbacks.
//!
//! Only thread 0 is instrumented. Its state (writer, next-entry cursor,
//! CPUID input save area, allocation tracker) lives in one context slot
//! owned by the tracer; every other thread gets no slot, which makes all of
//! its hooks no-ops. The hot path therefore runs without any locking.

use crate::alloc::AllocationTracker;
use crate::cpu::CpuOverride;
use crate::dbi::{
    BasicBlock, BlockPlan, DbiTool, HookAction, HookContext, ImageLoad, RoutineHook,
    RoutineInstrumentation, ThreadId,
};
use crate::entry::BranchKind;
use crate::image::{image_is_interesting, ImageInfo, ImageRegistry};
use crate::options::TracerOptions;
use crate::planner::{plan_routine_hooks, Planner, PlannerConfig};
use crate::writer::{PrefixState, TraceWriter};
use crate::Error;

/// The only thread that is instrumented.
pub const MAIN_THREAD: ThreadId = 0;

/// Reports a fatal I/O failure and terminates the process, mirroring the
/// host's behavior for unrecoverable tool errors.
fn fatal(err: &Error) -> ! {
    eprintln!("error: {err}");
    std::process::exit(1);
}

/// Context-slot contents of the instrumented thread.
#[derive(Debug)]
struct ThreadState {
    writer: TraceWriter,
    /// Next writable buffer index, advanced by every append.
    next: usize,
    /// Saved architectural inputs of the CPUID instruction being rewritten.
    cpuid_input_eax: u32,
    cpuid_input_ecx: u32,
    allocation_tracker: AllocationTracker,
}

impl ThreadState {
    /// Appends one entry through `insert`, flushing the full buffer first.
    ///
    /// This is the single place where the buffer-full check happens: on
    /// every append, if the cursor has reached the end, the whole buffer is
    /// written out and the cursor resets before the new entry is stored.
    fn append(
        &mut self,
        prefix: &PrefixState,
        insert: impl FnOnce(&mut TraceWriter, usize) -> usize,
    ) {
        if TraceWriter::buffer_full(self.next) {
            if let Err(err) = self.writer.flush(TraceWriter::end(), prefix.active()) {
                fatal(&err);
            }
            self.next = TraceWriter::begin();
        }
        self.next = insert(&mut self.writer, self.next);
    }
}

/// The DBI tracing tool. One instance exists per traced process.
pub struct Tracer {
    output_prefix: String,
    interesting_patterns: Vec<String>,
    fixed_random: Option<u64>,
    cpu: CpuOverride,
    planner: Planner,
    registry: ImageRegistry,
    prefix: PrefixState,
    libc_load_detected: bool,
    /// Context slot of thread 0; `None` before thread start and for the
    /// whole lifetime of every other thread.
    main_thread: Option<ThreadState>,
}

impl Tracer {
    /// Builds the tool from parsed command line options and enters prefix
    /// mode. Fails if the prefix metadata file cannot be created.
    pub fn new(options: &TracerOptions) -> Result<Self, Error> {
        let output_prefix = options.trimmed_output_prefix();
        let prefix = PrefixState::init(&output_prefix)?;

        let fixed_random = options.fixed_random_value();
        if let Some(value) = fixed_random {
            log::info!("using fixed RDRAND output {value}");
        }
        let track_stack = options.stack_tracking_enabled();
        if track_stack {
            log::info!("stack allocation tracking is enabled");
        }

        Ok(Self {
            output_prefix,
            interesting_patterns: options.interesting_patterns(),
            fixed_random,
            cpu: CpuOverride::new(options.cpu_model),
            planner: Planner::new(PlannerConfig {
                track_stack_allocations: track_stack,
                substitute_rdrand: fixed_random.is_some(),
            }),
            registry: ImageRegistry::new(),
            prefix,
            // The Windows loader reports ntdll before any code runs, so the
            // early-block suppression only matters for the Unix libc.
            libc_load_detected: cfg!(windows),
            main_thread: None,
        })
    }

    /// Read access to the image registry, mainly for diagnostics.
    #[must_use]
    pub fn images(&self) -> &ImageRegistry {
        &self.registry
    }

    /// Whether the prefix phase is still active.
    #[must_use]
    pub fn prefix_active(&self) -> bool {
        self.prefix.active()
    }
}

impl DbiTool for Tracer {
    fn instrument_block(&mut self, block: &BasicBlock) -> BlockPlan {
        self.planner
            .plan_block(block, &self.registry, self.libc_load_detected)
    }

    fn instrument_image(&mut self, image: &ImageLoad) -> Vec<RoutineInstrumentation> {
        let interesting = image_is_interesting(&image.name, &self.interesting_patterns);
        let (start_address, end_address) = image.extent();

        if let Err(err) = self
            .prefix
            .record_image_load(interesting, start_address, end_address, &image.name)
        {
            fatal(&err);
        }

        self.registry.insert(ImageInfo {
            interesting,
            name: image.name.clone(),
            start_address,
            end_address,
        });
        log::info!(
            "image '{}' loaded at {start_address:#x}..{end_address:#x}{}",
            image.name,
            if interesting { " [interesting]" } else { "" }
        );

        if !self.libc_load_detected && image.name.contains("libc.so") {
            self.libc_load_detected = true;
            log::info!("libc detected");
        }

        let hooks = plan_routine_hooks(image);
        for hook in &hooks {
            log::info!("{}() instrumented", hook.symbol);
        }
        hooks
    }

    fn thread_start(&mut self, tid: ThreadId) {
        if tid != MAIN_THREAD {
            // Secondary threads run without a context slot and therefore
            // without any tracing side effects.
            log::info!("ignoring thread #{tid}");
            return;
        }

        let writer = match TraceWriter::new(&self.output_prefix) {
            Ok(writer) => writer,
            Err(err) => fatal(&err),
        };
        self.main_thread = Some(ThreadState {
            writer,
            next: TraceWriter::begin(),
            cpuid_input_eax: 0,
            cpuid_input_ecx: 0,
            allocation_tracker: AllocationTracker::new(),
        });
    }

    fn thread_exit(&mut self, tid: ThreadId) {
        if tid != MAIN_THREAD {
            return;
        }
        if let Some(mut state) = self.main_thread.take() {
            if let Err(err) = state.writer.flush(state.next, self.prefix.active()) {
                fatal(&err);
            }
        }
    }

    fn execute_hook(&mut self, tid: ThreadId, action: HookAction, ctx: &mut HookContext) {
        if tid != MAIN_THREAD {
            return;
        }
        let Self {
            main_thread,
            cpu,
            fixed_random,
            prefix,
            ..
        } = self;
        let Some(state) = main_thread.as_mut() else {
            return;
        };

        match action {
            HookAction::SaveCpuidInputs => {
                state.cpuid_input_eax = ctx.cpuid.eax;
                state.cpuid_input_ecx = ctx.cpuid.ecx;
            }
            HookAction::RewriteCpuid => {
                let (eax, ecx) = (state.cpuid_input_eax, state.cpuid_input_ecx);
                cpu.rewrite(eax, ecx, &mut ctx.cpuid);
            }
            HookAction::SubstituteRdrand => {
                if let Some(value) = fixed_random {
                    ctx.rdrand_output = *value;
                }
            }
            HookAction::RecordBranch { kind } => {
                // Calls are unconditional; only jumps carry a predicate.
                let taken = match kind {
                    BranchKind::Jump => ctx.branch_taken,
                    _ => true,
                };
                let (source, target) = (ctx.instruction_address, ctx.branch_target);
                state.append(prefix, |writer, next| {
                    writer.insert_branch(next, source, target, taken, kind)
                });
            }
            HookAction::RecordReturnBranch => {
                let (source, target) = (ctx.instruction_address, ctx.branch_target);
                state.append(prefix, |writer, next| {
                    writer.insert_branch(next, source, target, true, BranchKind::Return)
                });
            }
            HookAction::RecordStackPointerModification { cause } => {
                let (address, sp) = (ctx.instruction_address, ctx.stack_pointer);
                state.append(prefix, |writer, next| {
                    writer.insert_stack_pointer_modification(next, address, sp, cause)
                });
            }
            HookAction::TrackAllocationCall => {
                state.allocation_tracker.on_call();
            }
            HookAction::TrackAllocationReturn => {
                if state.allocation_tracker.on_return() {
                    let address = ctx.function_return_value;
                    state.append(prefix, |writer, next| {
                        writer.insert_heap_alloc_return(next, address)
                    });
                }
            }
            HookAction::RecordMemoryRead { second_operand } => {
                let address = if second_operand {
                    ctx.memory_read2_address
                } else {
                    ctx.memory_read_address
                };
                // The host reports one size for both read operands.
                let (instruction, size) = (ctx.instruction_address, ctx.memory_read_size);
                state.append(prefix, |writer, next| {
                    writer.insert_memory_read(next, instruction, address, size)
                });
            }
            HookAction::RecordMemoryWrite => {
                let (instruction, address, size) = (
                    ctx.instruction_address,
                    ctx.memory_write_address,
                    ctx.memory_write_size,
                );
                state.append(prefix, |writer, next| {
                    writer.insert_memory_write(next, instruction, address, size)
                });
            }
        }
    }

    fn routine_entry(&mut self, tid: ThreadId, hook: RoutineHook, args: &[u64]) {
        if tid != MAIN_THREAD {
            return;
        }
        let Self {
            main_thread,
            prefix,
            ..
        } = self;
        let Some(state) = main_thread.as_mut() else {
            return;
        };
        let arg = |index: usize| args.get(index).copied().unwrap_or(0);

        match hook {
            RoutineHook::TestcaseStart => {
                #[allow(clippy::cast_possible_truncation)]
                let id = arg(0) as i32;
                if let Err(err) = state.writer.testcase_start(id, state.next, prefix) {
                    fatal(&err);
                }
                state.next = TraceWriter::begin();
            }
            RoutineHook::TestcaseEnd => {
                if let Err(err) = state.writer.testcase_end(state.next, prefix) {
                    fatal(&err);
                }
                state.next = TraceWriter::begin();
            }
            RoutineHook::StackPointerInfo => {
                let (min, max) = (arg(0), arg(1));
                state.append(prefix, |writer, next| {
                    writer.insert_stack_pointer_info(next, min, max)
                });
            }
            RoutineHook::ExplicitAllocation => {
                let (address, size) = (arg(0), arg(1));
                state.append(prefix, |writer, next| {
                    writer.insert_heap_alloc_size(next, size)
                });
                state.append(prefix, |writer, next| {
                    writer.insert_heap_alloc_return(next, address)
                });
            }
            RoutineHook::HeapAllocSize { size_arg } => {
                let size = arg(size_arg);
                state.append(prefix, |writer, next| {
                    writer.insert_heap_alloc_size(next, size)
                });
                state.allocation_tracker.arm();
            }
            RoutineHook::CallocSize {
                count_arg,
                size_arg,
            } => {
                let (count, size) = (arg(count_arg), arg(size_arg));
                state.append(prefix, |writer, next| {
                    writer.insert_calloc_size(next, count, size)
                });
                state.allocation_tracker.arm();
            }
            RoutineHook::HeapFreeAddress { addr_arg } => {
                let address = arg(addr_arg);
                state.append(prefix, |writer, next| {
                    writer.insert_heap_free_address(next, address)
                });
            }
        }
    }
}
