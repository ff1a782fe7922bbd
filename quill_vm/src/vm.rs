//! VM state: stack, frames, globals, trace ring, teardown.

use crate::natives::NativeRegistry;
use crate::workers::TupleSpace;
use quill_bytecode::BytecodeImage;
use quill_core::{PrintPrefs, RefId, Value, VmResult};
use quill_runtime::Heap;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Initial stack size, in cells.
pub const INIT_STACK_SIZE: usize = 32 * 1024;
/// Default stack ceiling, in cells; overridable per VM.
pub const DEF_MAX_STACK_SIZE: usize = 512 * 1024;
/// Headroom checked at function entry; the most the stack may grow by in
/// a single call.
pub const STACK_MARGIN: usize = 8 * 1024;
/// Worker-thread cap; stops bad values from locking up the machine.
pub const MAX_WORKERS: i64 = 256;

/// Opcode tracing: `Tail` keeps a ring of the last 50 instruction lines
/// for error reports, `On` logs each line immediately, `Off` disables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMode {
    Off,
    On,
    Tail,
}

/// Entries the TAIL trace ring retains.
pub(crate) const TRACE_RING_TAIL: usize = 50;

/// Construction arguments, shared with worker VMs (which force trace off
/// and drop program args).
#[derive(Debug, Clone)]
pub struct VmArgs {
    pub program_args: Vec<String>,
    pub trace: TraceMode,
    /// Stack ceiling in cells.
    pub max_stack_size: usize,
    /// Debug mode: defer heap destruction to teardown.
    pub delete_delay: bool,
}

impl Default for VmArgs {
    fn default() -> VmArgs {
        VmArgs {
            program_args: Vec::new(),
            trace: TraceMode::Off,
            max_stack_size: DEF_MAX_STACK_SIZE,
            delete_delay: false,
        }
    }
}

/// Per-call record: where the function header lives in the code stream
/// (everything about the frame is re-read from it) and the stack depth at
/// establishment. The tail of the frame list is the executing frame.
#[derive(Debug, Clone, Copy)]
pub struct StackFrame {
    /// Code index of the header's `fid` word (first FUNSTART operand).
    pub funstart: usize,
    /// Stack depth after the entry protocol ran.
    pub spstart: usize,
}

pub struct Vm {
    pub(crate) image: Arc<BytecodeImage>,
    pub(crate) heap: Heap,
    pub(crate) stack: Vec<Value>,
    /// Stack depth; 0 is empty. Grows by push, shrinks by pop.
    pub(crate) sp: usize,
    pub(crate) stacksize: usize,
    pub(crate) maxstacksize: usize,
    pub(crate) maxsp: usize,
    pub(crate) frames: Vec<StackFrame>,
    /// Globals, directly indexed by instruction operands.
    pub(crate) vars: Box<[Value]>,
    /// Lazily populated slots for PUSHSTR literals.
    pub(crate) constant_strings: Vec<Option<RefId>>,
    /// Rendering of the program's final value, set by EXIT.
    pub evalret: String,
    /// What `print` writes.
    pub output: String,
    /// Debug sink: stack growth, leak dumps, worker errors.
    pub log: Vec<String>,
    pub(crate) errmsg: String,
    pub(crate) error_has_occured: bool,
    pub(crate) trace: TraceMode,
    pub(crate) trace_output: Vec<String>,
    pub(crate) trace_ring_idx: usize,
    /// Callee cell written by CALLV/DDCALL, consumed by the engine.
    pub(crate) next_call_target: usize,
    /// Function-table id the last RETURN targeted; JUMPIFUNWOUND reads it.
    pub(crate) ret_unwind_to: i32,
    pub(crate) natives: NativeRegistry,
    pub(crate) is_worker: bool,
    pub(crate) tuple_space: Option<Arc<TupleSpace>>,
    pub(crate) workers: Vec<JoinHandle<Option<String>>>,
    pub(crate) args: VmArgs,
}

impl Vm {
    /// Construct a VM over a verified image: stack at its initial size,
    /// globals sized by the image's specident count, constant-string
    /// slots reserved empty.
    pub fn new(image: Arc<BytecodeImage>, args: VmArgs) -> Vm {
        let nvars = image.specidents().len();
        let nstrings = image.nstrings();
        let mut heap = Heap::new();
        heap.delete_delay_mode = args.delete_delay;
        Vm {
            heap,
            stack: vec![Value::nil(); INIT_STACK_SIZE],
            sp: 0,
            stacksize: INIT_STACK_SIZE,
            maxstacksize: args.max_stack_size,
            maxsp: 0,
            frames: Vec::new(),
            vars: vec![Value::nil(); nvars].into_boxed_slice(),
            constant_strings: vec![None; nstrings],
            evalret: String::new(),
            output: String::new(),
            log: Vec::new(),
            errmsg: String::new(),
            error_has_occured: false,
            trace: args.trace,
            trace_output: Vec::new(),
            trace_ring_idx: 0,
            next_call_target: 0,
            ret_unwind_to: -1,
            natives: NativeRegistry::core(),
            is_worker: false,
            tuple_space: None,
            workers: Vec::new(),
            image,
            args,
        }
    }

    // -------------------------------------------------------------------------
    // Stack primitives
    // -------------------------------------------------------------------------

    #[inline(always)]
    pub(crate) fn push(&mut self, v: Value) {
        self.stack[self.sp] = v;
        self.sp += 1;
    }

    #[inline(always)]
    pub(crate) fn pop(&mut self) -> Value {
        self.sp -= 1;
        self.stack[self.sp]
    }

    #[inline(always)]
    pub(crate) fn top(&self) -> Value {
        self.stack[self.sp - 1]
    }

    /// Cell at depth `n` below the top (`top_m(0) == top()`).
    #[inline(always)]
    pub(crate) fn top_m(&self, n: usize) -> Value {
        self.stack[self.sp - 1 - n]
    }

    // -------------------------------------------------------------------------
    // Inspection (tests, embedders)
    // -------------------------------------------------------------------------

    pub fn image(&self) -> &Arc<BytecodeImage> {
        &self.image
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn stack_depth(&self) -> usize {
        self.sp
    }

    pub fn stack_size(&self) -> usize {
        self.stacksize
    }

    pub fn var(&self, idx: usize) -> Value {
        self.vars[idx]
    }

    pub fn trace_ring_len(&self) -> usize {
        self.trace_output.len()
    }

    // -------------------------------------------------------------------------
    // Trace ring
    // -------------------------------------------------------------------------

    /// Next slot of the trace ring (TAIL keeps 50, ON keeps 1).
    pub(crate) fn trace_stream(&mut self) -> &mut String {
        let trace_size = if self.trace == TraceMode::Tail { TRACE_RING_TAIL } else { 1 };
        if self.trace_output.len() < trace_size {
            self.trace_output.resize(trace_size, String::new());
        }
        if self.trace_ring_idx == trace_size {
            self.trace_ring_idx = 0;
        }
        let idx = self.trace_ring_idx;
        self.trace_ring_idx += 1;
        let sd = &mut self.trace_output[idx];
        sd.clear();
        sd
    }

    /// Record one instruction in the trace: op name plus previews of the
    /// top two cells.
    pub(crate) fn trace_ins(&mut self, name: &str) {
        let mut line = String::from(name);
        if self.sp > 0 {
            line.push_str(" - ");
            let top = self.top();
            self.value_to_string(&mut line, top, None, &PrintPrefs::debug(), 0);
            if self.sp > 1 {
                line.push_str(" - ");
                let below = self.top_m(1);
                self.value_to_string(&mut line, below, None, &PrintPrefs::debug(), 0);
            }
        }
        if self.trace == TraceMode::Tail {
            line.push('\n');
            *self.trace_stream() = line;
        } else {
            *self.trace_stream() = line.clone();
            self.log.push(line);
        }
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    /// Program end: render the final value, release everything the VM
    /// still owns, and report leaks. Called by the EXIT handler.
    pub(crate) fn end_eval(&mut self, ret: Value, tti: i32) -> VmResult<()> {
        self.terminate_workers();
        let ti = self.image.clone().type_info(tti);
        let mut out = String::new();
        self.value_to_string(&mut out, ret, Some(&ti), &PrintPrefs::program(), 0);
        self.evalret = out;
        self.heap.dec_ref_nil(ret);
        if self.sp != 0 {
            self.log.push(format!("stack diff: {}", self.sp));
            while self.sp > 0 {
                let v = self.pop();
                self.log.push(format!("left on the stack: {:#x}, type: {:?}", v.any(), v.tag()));
            }
            debug_assert!(false, "stack not empty at end of evaluation");
        }
        debug_assert!(self.frames.is_empty());
        self.log.push(format!("stack at its highest was: {}", self.maxsp));
        for i in 0..self.constant_strings.len() {
            if let Some(id) = self.constant_strings[i].take() {
                self.heap.dec(id);
            }
        }
        self.heap.drain_delayed();
        self.dump_leaks();
        Ok(())
    }

    /// Sort live objects by (refcount, type) and report them. Leaks mean
    /// cycles in the object graph, or an engine bug.
    pub(crate) fn dump_leaks(&mut self) {
        let mut leaks = self.heap.findleaks();
        if !leaks.is_empty() {
            self.log.push(
                "LEAKS FOUND (this indicates cycles in your object graph, or a bug in Quill)"
                    .to_owned(),
            );
            leaks.sort_by(|&a, &b| {
                let (ha, hb) = (self.heap.header(a), self.heap.header(b));
                hb.refc.cmp(&ha.refc).then(hb.tti.cmp(&ha.tti))
            });
            let mut sd = String::new();
            let pp = PrintPrefs::debug();
            for id in leaks {
                let h = self.heap.header(id);
                self.ref_to_string(&mut sd, id, &pp, 0);
                sd.push_str(&format!(" ({})\n", h.refc));
            }
            self.log.push(sd);
        }
        let stats = self.heap.stats();
        self.log.push(format!(
            "heap: {} allocated, {} freed, peak {}",
            stats.allocated, stats.freed, stats.peak_live
        ));
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        // A VM dropped without reaching EXIT (errors, worker teardown)
        // must still stop its workers.
        self.terminate_workers();
    }
}
