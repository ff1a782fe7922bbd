//! Structural tests over the emitted C source: function shapes, labels,
//! epilogues, vtable sentinel, entry shim, and both output modes.

use quill_aot::to_c_source;
use quill_bytecode::{BytecodeImage, ImageBuilder, Opcode};
use quill_core::ValueType;
use quill_vm::NativeRegistry;

fn nat(name: &str) -> i32 {
    NativeRegistry::core().lookup(name).expect("native registered")
}

fn load(b: ImageBuilder) -> BytecodeImage {
    BytecodeImage::load(&b.finish()).expect("image verifies")
}

fn gen(b: ImageBuilder, cpp: bool) -> String {
    let image = load(b);
    to_c_source(&image, &NativeRegistry::core(), cpp).expect("translation succeeds")
}

/// `return 7`: one function, a vtable of just the sentinel, an entry shim
/// calling it.
fn minimal() -> ImageBuilder {
    let mut b = ImageBuilder::new();
    let t_int = b.type_simple(ValueType::Int);
    let shim = b.here();
    b.op(Opcode::PushInt, &[7]);
    b.op(Opcode::Exit, &[t_int]);
    b.set_entry(shim);
    b
}

#[test]
fn test_minimal_program_shape() {
    let src = gen(minimal(), false);
    // One fun_<n> whose body ends with the epilogue return.
    assert!(src.contains("static StackPtr fun_3(VMRef, StackPtr);"), "{src}");
    assert!(src.contains("static StackPtr fun_3(VMRef vm, StackPtr psp) {"));
    assert!(src.contains("    return psp;\n}"));
    // Vtable: no entries, sentinel only.
    assert!(src.contains("const fun_base_t vtables[] = {\n    0\n};"));
    // Entry shim calls the starting function after the cell-size handshake.
    assert!(src.contains("StackPtr compiled_entry_point(VMRef vm, StackPtr sp) {"));
    assert!(src.contains("    Entry(sizeof(Value));"));
    assert!(src.contains("    return fun_3(vm, sp);"));
}

#[test]
fn test_plain_mode_prototypes_cover_all_families() {
    let src = gen(minimal(), false);
    // Base family with operands.
    assert!(src.contains("StackPtr U_PUSHINT(VMRef, StackPtr, int);"));
    // Call family carries the continuation pointer.
    assert!(src.contains("StackPtr U_PUSHFUN(VMRef, StackPtr, int, fun_base_t);"));
    // Vararg family.
    assert!(src.contains("StackPtr U_FUNSTART(VMRef, StackPtr, const int *);"));
    assert!(src.contains("StackPtr U_JUMP_TABLE(VMRef, StackPtr, const int *);"));
    // Jump families.
    assert!(src.contains("StackPtr U_JUMPFAIL(VMRef, StackPtr);"));
    assert!(src.contains("StackPtr U_JUMPIFUNWOUND(VMRef, StackPtr, int);"));
    // Engine routines.
    for decl in [
        "extern fun_base_t GetNextCallTarget(VMRef);",
        "extern void Entry(int);",
        "extern StackPtr GLFrame(StackPtr, VMRef);",
        "extern void SwapVars(VMRef, int, StackPtr, int);",
        "extern void BackupVar(VMRef, int, Value *);",
        "extern void NilVal(Value *);",
        "extern void DecOwned(VMRef, int);",
        "extern void DecVal(VMRef, Value);",
        "extern void RestoreBackup(VMRef, int, Value);",
        "extern StackPtr PopArg(VMRef, int, StackPtr);",
    ] {
        assert!(src.contains(decl), "missing: {decl}");
    }
    // Self-contained cell typedef.
    assert!(src.contains("long long ival;"));
    assert!(src.contains("typedef Value *StackPtr;"));
}

/// A function with args, default-saves, keep slots and owned vars
/// exercises the whole prelude/epilogue protocol.
fn full_function() -> (ImageBuilder, usize) {
    let mut b = ImageBuilder::new();
    let t_int = b.type_simple(ValueType::Int);
    let t_str = b.type_simple(ValueType::String);
    let x = b.declare_var("counter", t_int, false, false);
    let s = b.declare_var("label", t_str, false, false);
    let d = b.declare_var("scratch", t_int, false, false);
    let fid = b.declare_function("munge");

    let f = b.fun_start(fid, 8, &[x, s], &[d], 1, &[s]);
    let lit = b.intern("munge says");
    b.op(Opcode::PushStr, &[lit]);
    b.op(Opcode::KeepRef, &[0, 0]);
    b.op(Opcode::Pop, &[]);
    b.op(Opcode::PushVar, &[x]);
    b.op(Opcode::PushInt, &[0]);
    b.op(Opcode::IGt, &[]);
    let alt = b.new_label();
    b.jump_fail(alt);
    b.op(Opcode::PushVar, &[x]);
    b.op(Opcode::Return, &[fid, 1]);
    b.set_depth(0);
    b.place_block(alt);
    b.op(Opcode::PushInt, &[-1]);
    b.op(Opcode::Return, &[fid, 1]);

    // The starting function gets its own anonymous header so the shim's
    // register array is sized for the two arguments it stages.
    let shim = b.fun_start(-1, 4, &[], &[], 0, &[]);
    b.op(Opcode::PushInt, &[5]);
    let hello = b.intern("hi");
    b.op(Opcode::PushStr, &[hello]);
    b.op_call(f, 2, 1);
    b.op(Opcode::Exit, &[t_int]);
    b.set_entry(shim);
    (b, f)
}

#[test]
fn test_prelude_and_epilogue_emission() {
    let (b, f) = full_function();
    let src = gen(b, false);
    // Function comment and signature.
    assert!(src.contains("// munge"));
    assert!(src.contains(&format!("static StackPtr fun_{f}(VMRef vm, StackPtr psp) {{")));
    // Locals sized from the header.
    assert!(src.contains("    Value regs[8];"));
    assert!(src.contains("    Value defsave[1];"));
    assert!(src.contains("    Value keepvar[1];"));
    assert!(src.contains("    StackPtr sp = &regs[-1];"));
    // Entry protocol: swaps for both args (reverse positions), backup,
    // keep-slot init.
    assert!(src.contains("SwapVars(vm, 0, psp, 1);"));
    assert!(src.contains("SwapVars(vm, 1, psp, 0);"));
    assert!(src.contains("BackupVar(vm, 2, &defsave[0]);"));
    assert!(src.contains("NilVal(&keepvar[0]);"));
    // Keep slot store.
    assert!(src.contains("keepvar[0] = TopM(sp, 0);"));
    // Exit protocol at RETURN: owned release, arg pop-backs in reverse,
    // value slide, deferred default restore, epilogue.
    assert!(src.contains("psp = U_RETURN(vm, psp, 0, 1);"));
    assert!(src.contains("DecOwned(vm, 1);"));
    let s_pop = src.find("psp = PopArg(vm, 1, psp);").expect("arg pop");
    let x_pop = src.find("psp = PopArg(vm, 0, psp);").expect("arg pop");
    assert!(s_pop < x_pop, "args pop back in reverse order");
    assert!(src.contains("Push(psp, TopM(sp, 0));"));
    assert!(src.contains("sp -= 1;"));
    assert!(src.contains("    epilogue:\n"));
    assert!(src.contains("RestoreBackup(vm, 2, defsave[0]);"));
    assert!(src.contains("DecVal(vm, keepvar[0]);"));
    // Conditional jump lowering and its target label.
    assert!(src.contains("sp = U_JUMPFAIL(vm, sp); { long long top = sp->ival; sp--; if (!top) goto block"));
    assert!(src.contains(":;"));
    // Symbol comments, and the direct call following the CALL helper.
    assert!(src.contains("/* \"munge says\" */"));
    assert!(src.contains("/* counter */"));
    assert!(src.contains("/* munge */"));
    assert!(src.contains(&format!(" sp = fun_{f}(vm, sp);")));
}

#[test]
fn test_cpp_mode_asserts_and_driver() {
    let (b, _f) = full_function();
    let src = gen(b, true);
    // Depth asserts reference the regso annotations.
    assert!(src.contains("assert(sp == &regs["));
    // Runtime-typed prelude/driver.
    assert!(src.contains("typedef quill::Value Value;"));
    assert!(src.contains("defsave[0] = BackupVar(vm, 2);"));
    assert!(src.contains("keepvar[0] = quill::NilVal();"));
    assert!(src.contains("if (Pop(sp).False()) goto block"));
    assert!(src.contains("static const int bytecodefb[] = {"));
    assert!(src.contains("extern \"C\" StackPtr compiled_entry_point(VMRef vm, StackPtr sp) {"));
    assert!(src.contains("RunCompiledCodeMain(argc, argv, (uint8_t *)bytecodefb,"));
    // No cell-size handshake in runtime-typed mode.
    assert!(!src.contains("Entry(sizeof(Value));"));
}

#[test]
fn test_jump_table_lowering() {
    let mut b = ImageBuilder::new();
    let t_int = b.type_simple(ValueType::Int);
    let shim = b.here();
    b.op(Opcode::PushInt, &[1]);
    let c0 = b.new_label();
    let c1 = b.new_label();
    let dl = b.new_label();
    let done = b.new_label();
    b.jump_table(0, 1, &[c0, c1], dl);
    b.place_case(c0);
    b.op(Opcode::PushInt, &[10]);
    b.jump(done);
    b.set_depth(0);
    b.place_case(c1);
    b.op(Opcode::PushInt, &[11]);
    b.jump(done);
    b.set_depth(0);
    b.place_case(dl);
    b.op(Opcode::PushInt, &[12]);
    b.jump(done);
    b.op(Opcode::JumpTableEnd, &[]);
    b.set_depth(1);
    b.place_block(done);
    b.op(Opcode::Exit, &[t_int]);
    b.set_entry(shim);

    let src = gen(b, false);
    assert!(src.contains("{ long long top = sp->ival; sp--; switch (top) {"));
    assert!(src.contains("case 0:"));
    assert!(src.contains("case 1:"));
    assert!(src.contains("default:"));
    assert!(src.contains("}} // switch"));
    // Case bodies escape the switch through gotos to a labeled block.
    assert!(src.contains("goto block"));
}

#[test]
fn test_indirect_calls_and_vtable() {
    let mut b = ImageBuilder::new();
    let t_int = b.type_simple(ValueType::Int);
    let c_idx = b.declare_udt("C", 0, 1);
    let c_tti = b.type_udt(ValueType::Class, c_idx, &[t_int]);
    let selfv = b.declare_var("self", c_tti, false, false);
    let fid = b.declare_function("m");
    let m = b.fun_start(fid, 8, &[selfv], &[], 0, &[selfv]);
    b.op(Opcode::PushVar, &[selfv]);
    b.op(Opcode::PushFld, &[0]);
    b.op(Opcode::Return, &[fid, 1]);
    b.push_vtable_entry(m as i32);
    b.push_vtable_entry(-1);

    let shim = b.fun_start(-1, 4, &[], &[], 0, &[]);
    b.op(Opcode::PushInt, &[7]);
    b.op_new_object(c_tti, 1);
    b.op_ddcall(0, 1, 1);
    b.op(Opcode::Pop, &[]);
    b.op(Opcode::PushInt, &[3]);
    b.op_push_fun(m);
    b.op_callv(1, 1);
    b.op(Opcode::Exit, &[t_int]);
    b.set_entry(shim);

    let plain = gen(b, false);
    // Indirect invocation through the next-call-target cell.
    assert!(plain.contains(" sp = GetNextCallTarget(vm)(vm, sp);"));
    // PUSHFUN passes the concrete function pointer as its continuation.
    assert!(plain.contains(&format!("sp = U_PUSHFUN(vm, sp, {m}, fun_{m});")));
    // Class-name comment on construction.
    assert!(plain.contains("/* C */"));
    // Vtable entries in declared order with a gap and the sentinel.
    assert!(plain.contains(&format!("    fun_{m},\n    0,\n    0\n}};")));
}

#[test]
fn test_gl_frame_bypass() {
    let mut b = ImageBuilder::new();
    let t_int = b.type_simple(ValueType::Int);
    let glf = nat("gl_frame");
    let shim = b.here();
    b.op_bcall(glf, 0);
    b.op(Opcode::PushInt, &[0]);
    b.op(Opcode::Exit, &[t_int]);
    b.set_entry(shim);
    let src = gen(b, false);
    assert!(src.contains("sp = GLFrame(sp, vm);"));
    assert!(!src.contains("U_BCALL(vm, sp"), "helper must be bypassed");
}

#[test]
fn test_string_comment_truncated_and_quoted() {
    let mut b = ImageBuilder::new();
    let t_str = b.type_simple(ValueType::String);
    let long: String = "x".repeat(80);
    let shim = b.here();
    let sidx = b.intern(&long);
    b.op(Opcode::PushStr, &[sidx]);
    b.op(Opcode::Exit, &[t_str]);
    b.set_entry(shim);
    let src = gen(b, false);
    let expected = format!("/* \"{}\" */", "x".repeat(50));
    assert!(src.contains(&expected));
    assert!(!src.contains(&"x".repeat(51)));
}

#[test]
fn test_corrupt_image_rejected_by_loader() {
    // The translator only ever sees verified images; corruption is
    // caught upstream.
    let b = minimal();
    let mut bytes = b.finish();
    let len = bytes.len();
    bytes[len - 12] = 0x7f; // clobber an opcode word in the code section
    assert!(BytecodeImage::load(&bytes).is_err());
}

/// AOT/interpreter agreement on shape: every fun_ prototype corresponds
/// to a FUNSTART (or the entry shim) in the stream the interpreter runs.
#[test]
fn test_prototypes_match_function_starts() {
    let (b, _f) = full_function();
    let image = load(b);
    let src = to_c_source(&image, &NativeRegistry::core(), false).unwrap();
    let code = image.code();
    let mut expected = Vec::new();
    let mut ip = 3;
    while ip < code.len() {
        let p = quill_bytecode::parse_op_and_get_arity(code, ip).unwrap();
        if p.op == Opcode::FunStart || ip == image.starting_ip() {
            expected.push(ip);
        }
        ip = p.next_ip;
    }
    for id in expected {
        assert!(src.contains(&format!("static StackPtr fun_{id}(VMRef, StackPtr);")));
    }
}
