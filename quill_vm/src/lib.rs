//! Execution core of the Quill virtual machine.
//!
//! This crate owns everything that happens between a verified
//! `BytecodeImage` and a program result:
//!
//! - **VM state** (`vm`): the growable cell stack, the stack-frame list,
//!   the globals array sized from the image, constant-string slots, the
//!   trace ring and the error state.
//! - **Execution engine** (`exec`): function entry/exit with the
//!   swap/default-save/keep-var protocol, stack growth, conditional jumps,
//!   jump tables, direct and indirect calls through the next-call-target
//!   cell.
//! - **Opcode handlers** (`ops`): the base/call/jump family helpers the
//!   engine dispatches to.
//! - **Error path** (`error_path`): stack-trace assembly with variable
//!   dumps, recursive-error containment, serious errors.
//! - **Workers** (`workers`): independent VM instances over the shared
//!   image, passing class tuples through per-type blocking queues.
//!
//! A single VM is strictly single-threaded; only `worker_read` blocks.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod error_path;
pub mod exec;
pub mod natives;
pub mod ops;
pub mod render;
pub mod vm;
pub mod workers;

pub use natives::{NativeFun, NativeRegistry};
pub use vm::{
    StackFrame, TraceMode, Vm, VmArgs, DEF_MAX_STACK_SIZE, INIT_STACK_SIZE, MAX_WORKERS,
    STACK_MARGIN,
};
pub use workers::TupleSpace;

use quill_bytecode::BytecodeImage;
use quill_core::VmResult;
use std::sync::Arc;

/// Convenience: load, run, and hand back the VM for result inspection.
pub fn run(image: Arc<BytecodeImage>, args: VmArgs) -> (Vm, VmResult<()>) {
    let mut vm = Vm::new(image, args);
    let r = vm.eval_program();
    (vm, r)
}
