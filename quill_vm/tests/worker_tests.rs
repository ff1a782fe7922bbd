//! Worker / tuple-space tests: FIFO delivery, the full multi-worker
//! roundtrip, and misuse errors.

use quill_bytecode::{BytecodeImage, ImageBuilder, Opcode};
use quill_core::{ValueType, VmErrorKind};
use quill_vm::{NativeRegistry, Vm, VmArgs};
use std::sync::Arc;

fn nat(name: &str) -> i32 {
    NativeRegistry::core().lookup(name).expect("native registered")
}

fn run(b: ImageBuilder) -> (Vm, Result<(), quill_core::VmError>) {
    let image = Arc::new(BytecodeImage::load(&b.finish()).expect("image verifies"));
    let mut vm = Vm::new(image, VmArgs::default());
    let r = vm.eval_program();
    (vm, r)
}

/// Single VM, zero workers: tuples written to one class queue come back
/// in write order.
#[test]
fn test_tuple_fifo_single_reader() {
    let mut b = ImageBuilder::new();
    let t_int = b.type_simple(ValueType::Int);
    let p_idx = b.declare_udt("P", -1, 1);
    let p_tti = b.type_udt(ValueType::Class, p_idx, &[t_int]);
    let acc = b.declare_var("acc", t_int, false, false);
    let (start, write, read) = (nat("thread_start"), nat("thread_write"), nat("thread_read"));

    let shim = b.here();
    b.op(Opcode::PushInt, &[0]);
    b.op_bcall(start, 0);
    b.op(Opcode::Pop, &[]);
    for i in 1..=5 {
        b.op(Opcode::PushInt, &[i]);
        b.op_new_object(p_tti, 1);
        b.op_bcall(write, 0);
        b.op(Opcode::Pop, &[]);
    }
    b.op(Opcode::PushInt, &[0]);
    b.op(Opcode::StoreVar, &[acc]);
    for _ in 0..5 {
        b.op(Opcode::PushVar, &[acc]);
        b.op(Opcode::PushInt, &[10]);
        b.op(Opcode::IMul, &[]);
        b.op(Opcode::PushInt, &[p_tti]);
        b.op_bcall(read, 0);
        b.op(Opcode::PushFld, &[0]);
        b.op(Opcode::IAdd, &[]);
        b.op(Opcode::StoreVar, &[acc]);
    }
    b.op(Opcode::PushVar, &[acc]);
    b.op(Opcode::Exit, &[t_int]);
    b.set_entry(shim);

    let (vm, r) = run(b);
    r.unwrap();
    // FIFO: digits in write order.
    assert_eq!(vm.evalret, "12345");
    assert!(vm.heap().findleaks().is_empty());
}

/// Scenario: 4 workers read class P, write class Q; main writes 100 P
/// tuples and reads 100 Q tuples. Expect all results delivered, no
/// deadlock, clean termination.
#[test]
fn test_worker_roundtrip() {
    let mut b = ImageBuilder::new();
    let t_int = b.type_simple(ValueType::Int);
    let p_idx = b.declare_udt("P", -1, 1);
    let p_tti = b.type_udt(ValueType::Class, p_idx, &[t_int]);
    let q_idx = b.declare_udt("Q", -1, 1);
    let q_tti = b.type_udt(ValueType::Class, q_idx, &[t_int]);
    let i_var = b.declare_var("i", t_int, false, false);
    let sum = b.declare_var("sum", t_int, false, false);
    let (start, write, read, is_worker) = (
        nat("thread_start"),
        nat("thread_write"),
        nat("thread_read"),
        nat("is_worker"),
    );

    let shim = b.here();
    b.op_bcall(is_worker, 1);
    let main_l = b.new_label();
    b.jump_fail(main_l);

    // Worker: read P until teardown, write back Q{b: a}.
    let wloop = b.new_label();
    let wdone = b.new_label();
    b.place_block(wloop);
    b.op(Opcode::PushInt, &[p_tti]);
    b.op_bcall(read, 0);
    b.op(Opcode::Dup, &[]);
    b.jump_fail(wdone);
    b.op(Opcode::PushFld, &[0]);
    b.op_new_object(q_tti, 1);
    b.op_bcall(write, 0);
    b.op(Opcode::Pop, &[]);
    b.jump(wloop);
    b.set_depth(1);
    b.place_block(wdone);
    b.op(Opcode::Pop, &[]);
    b.op(Opcode::PushInt, &[0]);
    b.op(Opcode::Exit, &[t_int]);

    // Main: spawn, write 100 P, read and sum 100 Q.
    b.set_depth(0);
    b.place_block(main_l);
    b.op(Opcode::PushInt, &[4]);
    b.op_bcall(start, 0);
    b.op(Opcode::Pop, &[]);
    b.op(Opcode::PushInt, &[0]);
    b.op(Opcode::StoreVar, &[i_var]);
    let write_loop = b.new_label();
    let write_done = b.new_label();
    b.place_block(write_loop);
    b.op(Opcode::PushVar, &[i_var]);
    b.op(Opcode::PushInt, &[100]);
    b.op(Opcode::ILt, &[]);
    b.jump_fail(write_done);
    b.op(Opcode::PushVar, &[i_var]);
    b.op_new_object(p_tti, 1);
    b.op_bcall(write, 0);
    b.op(Opcode::Pop, &[]);
    b.op(Opcode::PushVar, &[i_var]);
    b.op(Opcode::PushInt, &[1]);
    b.op(Opcode::IAdd, &[]);
    b.op(Opcode::StoreVar, &[i_var]);
    b.jump(write_loop);
    b.set_depth(0);
    b.place_block(write_done);
    b.op(Opcode::PushInt, &[0]);
    b.op(Opcode::StoreVar, &[i_var]);
    b.op(Opcode::PushInt, &[0]);
    b.op(Opcode::StoreVar, &[sum]);
    let read_loop = b.new_label();
    let read_done = b.new_label();
    b.place_block(read_loop);
    b.op(Opcode::PushVar, &[i_var]);
    b.op(Opcode::PushInt, &[100]);
    b.op(Opcode::ILt, &[]);
    b.jump_fail(read_done);
    b.op(Opcode::PushVar, &[sum]);
    b.op(Opcode::PushInt, &[q_tti]);
    b.op_bcall(read, 0);
    b.op(Opcode::PushFld, &[0]);
    b.op(Opcode::IAdd, &[]);
    b.op(Opcode::StoreVar, &[sum]);
    b.op(Opcode::PushVar, &[i_var]);
    b.op(Opcode::PushInt, &[1]);
    b.op(Opcode::IAdd, &[]);
    b.op(Opcode::StoreVar, &[i_var]);
    b.jump(read_loop);
    b.set_depth(0);
    b.place_block(read_done);
    b.op(Opcode::PushVar, &[sum]);
    b.op(Opcode::Exit, &[t_int]);
    b.set_entry(shim);

    let (vm, r) = run(b);
    r.unwrap();
    // Sum of 0..100 routed through the workers.
    assert_eq!(vm.evalret, "4950");
    // Clean termination: no worker errors surfaced.
    assert!(!vm.log.iter().any(|l| l.contains("worker error")), "{:?}", vm.log);
    assert!(vm.heap().findleaks().is_empty());
}

#[test]
fn test_double_start_is_misuse() {
    let mut b = ImageBuilder::new();
    let t_int = b.type_simple(ValueType::Int);
    let start = nat("thread_start");
    let shim = b.here();
    b.op(Opcode::PushInt, &[0]);
    b.op_bcall(start, 0);
    b.op(Opcode::Pop, &[]);
    b.op(Opcode::PushInt, &[0]);
    b.op_bcall(start, 0);
    b.op(Opcode::Pop, &[]);
    b.op(Opcode::PushInt, &[0]);
    b.op(Opcode::Exit, &[t_int]);
    b.set_entry(shim);
    let (_vm, r) = run(b);
    let err = r.unwrap_err();
    assert_eq!(err.kind, VmErrorKind::WorkerMisuse);
    assert!(err.message.contains("workers already running"));
}

#[test]
fn test_write_non_class_is_type_mismatch() {
    let mut b = ImageBuilder::new();
    let t_int = b.type_simple(ValueType::Int);
    let _p = b.declare_udt("P", -1, 1);
    let (start, write) = (nat("thread_start"), nat("thread_write"));
    let shim = b.here();
    b.op(Opcode::PushInt, &[0]);
    b.op_bcall(start, 0);
    b.op(Opcode::Pop, &[]);
    b.op(Opcode::PushInt, &[7]);
    b.op_bcall(write, 0);
    b.op(Opcode::Pop, &[]);
    b.op(Opcode::PushInt, &[0]);
    b.op(Opcode::Exit, &[t_int]);
    b.set_entry(shim);
    let (_vm, r) = run(b);
    let err = r.unwrap_err();
    assert_eq!(err.kind, VmErrorKind::TypeMismatch);
    assert!(err.message.contains("must be a class"));
}

#[test]
fn test_write_ref_fields_rejected() {
    let mut b = ImageBuilder::new();
    let t_int = b.type_simple(ValueType::Int);
    let t_str = b.type_simple(ValueType::String);
    let r_idx = b.declare_udt("R", -1, 1);
    let r_tti = b.type_udt(ValueType::Class, r_idx, &[t_str]);
    let (start, write) = (nat("thread_start"), nat("thread_write"));
    let shim = b.here();
    b.op(Opcode::PushInt, &[0]);
    b.op_bcall(start, 0);
    b.op(Opcode::Pop, &[]);
    let s = b.intern("not scalar");
    b.op(Opcode::PushStr, &[s]);
    b.op_new_object(r_tti, 1);
    b.op_bcall(write, 0);
    b.op(Opcode::Pop, &[]);
    b.op(Opcode::PushInt, &[0]);
    b.op(Opcode::Exit, &[t_int]);
    b.set_entry(shim);
    let (_vm, r) = run(b);
    let err = r.unwrap_err();
    assert_eq!(err.kind, VmErrorKind::TypeMismatch);
    assert!(err.message.contains("only scalar class members"));
}
