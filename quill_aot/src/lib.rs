//! Ahead-of-time bytecode-to-C translator.
//!
//! A second code generator over the same instruction stream the
//! interpreter consumes: one C function per bytecode function, labeled
//! blocks with `goto` control flow, direct calls into the per-opcode
//! helper routines. All dynamic behavior stays in the helpers; the
//! translator's only job is to preserve control flow exactly, so the
//! resulting binary behaves bit-identically to the interpreter.
//!
//! Two output modes:
//!
//! - **Runtime-typed** (`cpp = true`): typedefs alias the runtime's own
//!   `Value`/`StackPtr`, the bytecode buffer is embedded, and a `main`
//!   hands everything to `RunCompiledCodeMain`.
//! - **Plain C** (`cpp = false`): a self-contained cell typedef, extern
//!   prototypes for every opcode helper in all five arity families, and
//!   an `Entry(sizeof(Value))` handshake that catches cell-layout drift
//!   between generator and runtime.

#![deny(unsafe_op_in_unsafe_fn)]

use quill_bytecode::{
    parse_op_and_get_arity, BytecodeImage, FunHeader, OpFamily, Opcode, MAX_OPS,
};
use quill_core::{VmError, VmResult};
use quill_vm::NativeRegistry;
use rustc_hash::FxHashMap;
use std::fmt::Write;

/// How long string-literal comments may get before truncation.
const COMMENT_STR_MAX: usize = 50;

/// Translate a verified image to one C source text.
pub fn to_c_source(
    image: &BytecodeImage,
    natives: &NativeRegistry,
    cpp: bool,
) -> VmResult<String> {
    let code = image.code();
    let mut sd = String::new();

    if cpp {
        sd.push_str(
            "#include \"quill/stdafx.h\"\n\
             #include \"quill/vmdata.h\"\n\
             #include \"quill/vmops.h\"\n\
             #include \"quill/compiler.h\"\n\
             \n\
             typedef quill::Value Value;\n\
             typedef quill::StackPtr StackPtr;\n\
             typedef quill::VM &VMRef;\n\
             typedef quill::fun_base_t fun_base_t;\n\
             \n\
             #if QUILL_ENGINE\n\
             \x20   extern \"C\" StackPtr GLFrame(StackPtr sp, VMRef vm);\n\
             #endif\n\
             \n",
        );
    } else {
        // This needs to correspond to the runtime Value, enforced in Entry().
        sd.push_str(
            "typedef struct {\n\
             \x20   union {\n\
             \x20       long long ival;\n\
             \x20       double fval;\n\
             \x20       void *rval;\n\
             \x20   };\n\
             \x20   int type;\n\
             } Value;\n\
             typedef Value *StackPtr;\n\
             typedef void *VMRef;\n\
             typedef StackPtr(*fun_base_t)(VMRef, StackPtr);\n\
             #define Pop(sp) (*(sp)--)\n\
             #define Push(sp, V) (*++(sp) = (V))\n\
             #define TopM(sp, N) (*((sp) - (N)))\n\
             \n",
        );
        for op in quill_bytecode::opcodes::all_opcodes() {
            let _ = match op.family() {
                OpFamily::Base => {
                    write!(sd, "StackPtr U_{}(VMRef, StackPtr", op.name()).ok();
                    for _ in 0..op.arity().max(0) {
                        sd.push_str(", int");
                    }
                    writeln!(sd, ");")
                }
                OpFamily::Call => {
                    write!(sd, "StackPtr U_{}(VMRef, StackPtr", op.name()).ok();
                    for _ in 0..op.arity().max(0) {
                        sd.push_str(", int");
                    }
                    writeln!(sd, ", fun_base_t);")
                }
                OpFamily::Vararg => writeln!(sd, "StackPtr U_{}(VMRef, StackPtr, const int *);", op.name()),
                OpFamily::Jump1 => writeln!(sd, "StackPtr U_{}(VMRef, StackPtr);", op.name()),
                OpFamily::Jump2 => writeln!(sd, "StackPtr U_{}(VMRef, StackPtr, int);", op.name()),
            };
        }
        sd.push_str(
            "extern fun_base_t GetNextCallTarget(VMRef);\n\
             extern void Entry(int);\n\
             extern StackPtr GLFrame(StackPtr, VMRef);\n\
             extern void SwapVars(VMRef, int, StackPtr, int);\n\
             extern void BackupVar(VMRef, int, Value *);\n\
             extern void NilVal(Value *);\n\
             extern void DecOwned(VMRef, int);\n\
             extern void DecVal(VMRef, Value);\n\
             extern void RestoreBackup(VMRef, int, Value);\n\
             extern StackPtr PopArg(VMRef, int, StackPtr);\n\
             \n",
        );
    }

    // Pass 1: declarations. Skip past the mandatory first JUMP, then emit
    // a forward prototype at every function entry.
    debug_assert_eq!(code[0], Opcode::Jump as i32);
    let starting_ip = image.starting_ip();
    let mut starting_point: i64 = -1;
    let mut ip = 3;
    while ip < code.len() {
        let id = ip;
        if code[ip] == Opcode::FunStart as i32 || ip == starting_ip {
            let _ = writeln!(sd, "static StackPtr fun_{id}(VMRef, StackPtr);");
            starting_point = id as i64;
        }
        let opc = code[ip];
        if !(0..MAX_OPS).contains(&opc) {
            return Err(VmError::malformed(format!("Corrupt bytecode: {opc} at: {id}")));
        }
        let Some(p) = parse_op_and_get_arity(code, ip) else {
            return Err(VmError::malformed(format!("Corrupt bytecode: {opc} at: {id}")));
        };
        ip = p.next_ip;
    }
    sd.push('\n');

    // Pass 2: bodies.
    let function_lookup: FxHashMap<i32, &str> = image
        .functions()
        .iter()
        .map(|f| (f.bytecode_start, f.name.as_ref()))
        .collect();
    let mut jumptables: Vec<&[i32]> = Vec::new();
    let mut ip = 3;
    let mut funstart: Option<usize> = None;
    let mut nkeepvars = 0i32;
    let mut ndefsave = 0usize;
    let mut sdt = String::new();
    while ip < code.len() {
        let id = ip;
        let is_start = ip == starting_ip;
        let p = parse_op_and_get_arity(code, ip).expect("stream verified in pass 1");
        let opc = p.op;
        let args = &code[p.args.clone()];

        if opc == Opcode::FunStart || is_start {
            funstart = Some(p.args.start);
            nkeepvars = 0;
            ndefsave = 0;
            sdt.clear();
            sd.push('\n');
            if let Some(name) = function_lookup.get(&(id as i32)) {
                let _ = writeln!(sd, "// {name}");
            }
            let _ = writeln!(sd, "static StackPtr fun_{id}(VMRef vm, StackPtr psp) {{");
            if opc == Opcode::FunStart {
                let header = FunHeader::parse(code, p.args.start).expect("verified header");
                ndefsave = header.ndef();
                nkeepvars = header.nkeepvars;
                let _ = writeln!(sd, "    Value regs[{}];", header.regs_max.max(1));
                if ndefsave > 0 {
                    let _ = writeln!(sd, "    Value defsave[{ndefsave}];");
                }
                if nkeepvars > 0 {
                    let _ = writeln!(sd, "    Value keepvar[{nkeepvars}];");
                }
            } else {
                // The entry shim returns at most one value.
                sd.push_str("    Value regs[1];\n");
            }
            sd.push_str("    StackPtr sp = &regs[-1];\n");
        }

        sd.push_str("    ");
        if cpp
            && !matches!(
                opc,
                Opcode::SaveRets | Opcode::JumpIfUnwound | Opcode::ReturnAny | Opcode::FunStart
            )
        {
            let _ = write!(sd, "assert(sp == &regs[{}]); ", p.regso - 1);
        }

        match opc {
            Opcode::FunStart => {
                let header = FunHeader::parse(code, p.args.start).expect("verified header");
                let nargs = header.nargs();
                for (i, &varidx) in code[header.args.clone()].iter().enumerate() {
                    let _ = write!(sd, "\n    SwapVars(vm, {varidx}, psp, {});", nargs - i - 1);
                }
                for (i, &varidx) in code[header.defs.clone()].iter().enumerate() {
                    // For most locals this saves a nil; only recursion sees
                    // an actual value.
                    if cpp {
                        let _ = write!(sd, "\n    defsave[{i}] = BackupVar(vm, {varidx});");
                    } else {
                        let _ = write!(sd, "\n    BackupVar(vm, {varidx}, &defsave[{i}]);");
                    }
                }
                for i in 0..header.nkeepvars {
                    if cpp {
                        let _ = write!(sd, "\n    keepvar[{i}] = quill::NilVal();");
                    } else {
                        let _ = write!(sd, "\n    NilVal(&keepvar[{i}]);");
                    }
                }
            }
            Opcode::Jump => {
                let _ = write!(sd, "goto block{};", args[0]);
            }
            _ if opc.is_cond_jump() => {
                let target = if opc == Opcode::JumpIfUnwound { args[1] } else { args[0] };
                let df = if opc == Opcode::JumpIfUnwound { args[0] } else { -1 };
                debug_assert!(target >= 0);
                let _ = write!(sd, "sp = U_{}(vm, sp", opc.name());
                if df >= 0 {
                    let _ = write!(sd, ", {df}");
                }
                if cpp {
                    let _ = write!(sd, "); if (Pop(sp).False()) goto block{target};");
                } else {
                    let _ = write!(
                        sd,
                        "); {{ long long top = sp->ival; sp--; if (!top) goto block{target}; }}"
                    );
                }
            }
            Opcode::BlockStart => {
                // The ";" keeps labels legal just before a closing brace.
                let _ = write!(sd, "block{id}:;");
            }
            Opcode::JumpTable => {
                if cpp {
                    sd.push_str("switch (Pop(sp).ival()) {");
                } else {
                    sd.push_str("{ long long top = sp->ival; sp--; switch (top) {");
                }
                jumptables.push(args);
            }
            Opcode::JumpTableCaseStart => {
                let t = jumptables.last().expect("case outside jump table");
                let mini = t[0];
                let maxi = t[1];
                for i in mini..=maxi {
                    if t[2 + (i - mini) as usize] == id as i32 {
                        let _ = write!(sd, "case {i}:");
                    }
                }
                if t[t.len() - 1] == id as i32 {
                    sd.push_str("default:");
                }
            }
            Opcode::JumpTableEnd => {
                if cpp {
                    sd.push_str("} // switch");
                } else {
                    sd.push_str("}} // switch");
                }
                jumptables.pop();
            }
            Opcode::Bcall
                if natives.get(args[0]).is_some_and(|nf| nf.is_gl_frame) =>
            {
                sd.push_str("sp = GLFrame(sp, vm);");
            }
            Opcode::Return | Opcode::ReturnAny => {
                let header = funstart.and_then(|fs| FunHeader::parse(code, fs));
                let nrets;
                if opc == Opcode::Return {
                    nrets = args[1];
                    let _ = write!(sd, "psp = U_RETURN(vm, psp, {}, {});", args[0], nrets);
                } else {
                    nrets = args[0];
                    let _ = write!(sd, "psp = U_RETURNANY(vm, psp, {});", nrets);
                }
                if let Some(header) = &header {
                    for &varidx in &code[header.owned.clone()] {
                        let _ = write!(sd, "\n    DecOwned(vm, {varidx});");
                    }
                    for &varidx in code[header.args.clone()].iter().rev() {
                        let _ = write!(sd, "\n    psp = PopArg(vm, {varidx}, psp);");
                    }
                }
                for i in 0..nrets {
                    let _ = write!(sd, "\n    Push(psp, TopM(sp, {}));", nrets - i - 1);
                }
                if nrets > 0 {
                    let _ = write!(sd, "\n    sp -= {nrets};");
                }
                sdt.clear();
                if let Some(header) = &header {
                    for (i, &varidx) in code[header.defs.clone()].iter().enumerate() {
                        let _ = writeln!(sdt, "    RestoreBackup(vm, {varidx}, defsave[{i}]);");
                    }
                }
                if opc == Opcode::Return {
                    sd.push_str("\n    goto epilogue;");
                }
            }
            Opcode::SaveRets => {
                sd.push_str("\n    goto epilogue;");
            }
            Opcode::KeepRef | Opcode::KeepRefLoop => {
                if opc == Opcode::KeepRefLoop {
                    let _ = write!(sd, "DecVal(vm, keepvar[{}]); ", args[1]);
                }
                let _ = write!(sd, "keepvar[{}] = TopM(sp, {});", args[1], args[0]);
            }
            _ => {
                let _ = write!(sd, "sp = U_{}(vm, sp", opc.name());
                for &a in args {
                    let _ = write!(sd, ", {a}");
                }
                if opc == Opcode::PushFun {
                    let _ = write!(sd, ", fun_{}", args[0]);
                }
                sd.push_str(");");

                let comment = op_comment(image, natives, code, opc, args);
                if !comment.is_empty() {
                    let _ = write!(sd, " /* {comment} */");
                }

                if opc == Opcode::Call {
                    let _ = write!(sd, " sp = fun_{}(vm, sp);", args[0]);
                } else if opc == Opcode::CallV || opc == Opcode::DdCall {
                    if cpp {
                        sd.push_str(" sp = vm.next_call_target(vm, sp);");
                    } else {
                        sd.push_str(" sp = GetNextCallTarget(vm)(vm, sp);");
                    }
                }
            }
        }
        sd.push('\n');

        ip = p.next_ip;
        if ip == code.len() || code[ip] == Opcode::FunStart as i32 || ip == starting_ip {
            if opc != Opcode::Exit && opc != Opcode::Abort {
                sd.push_str("    epilogue:\n");
            }
            if !sdt.is_empty() {
                sd.push_str(&sdt);
            }
            for i in 0..nkeepvars {
                let _ = writeln!(sd, "    DecVal(vm, keepvar[{i}]);");
            }
            sd.push_str("    return psp;\n}\n");
        }
    }

    // The vtable array: function ids in declared order, 0 for sentinel
    // gaps, always terminated by a 0 so the table is never empty.
    if cpp {
        sd.push_str("\nstatic");
    } else {
        sd.push_str("\nextern ");
    }
    sd.push_str(" const fun_base_t vtables[] = {\n");
    for &id in image.vtables() {
        sd.push_str("    ");
        if id >= 0 {
            let _ = write!(sd, "fun_{id}");
        } else {
            sd.push('0');
        }
        sd.push_str(",\n");
    }
    sd.push_str("    0\n};\n");

    if cpp {
        sd.push_str("\nstatic const int bytecodefb[] = {");
        for (i, w) in image.words().iter().enumerate() {
            if i % 16 == 0 {
                sd.push_str("\n ");
            }
            let _ = write!(sd, " {w},");
        }
        sd.push_str("\n};\n\n");
    }
    if cpp {
        sd.push_str("extern \"C\" ");
    }
    sd.push_str("StackPtr compiled_entry_point(VMRef vm, StackPtr sp) {\n");
    if !cpp {
        sd.push_str("    Entry(sizeof(Value));\n");
    }
    let _ = write!(sd, "    return fun_{starting_point}(vm, sp);\n}}\n\n");
    if cpp {
        sd.push_str("int main(int argc, char *argv[]) {\n");
        sd.push_str("    // This is hard-coded to call compiled_entry_point()\n");
        let _ = write!(
            sd,
            "    return RunCompiledCodeMain(argc, argv, (uint8_t *)bytecodefb, {}, vtables);\n}}\n",
            image.words().len() * 4
        );
    }

    Ok(sd)
}

/// Inline comment naming the symbol an operand refers to, when one does.
fn op_comment(
    image: &BytecodeImage,
    natives: &NativeRegistry,
    code: &[i32],
    opc: Opcode,
    args: &[i32],
) -> String {
    match opc {
        Opcode::PushVar | Opcode::StoreVar => image.var_ident(args[0]).name.to_string(),
        Opcode::PushStr => {
            let s = image.string(args[0]);
            let truncated: String = s.chars().take(COMMENT_STR_MAX).collect();
            escape_and_quote(&truncated)
        }
        Opcode::Call => {
            let fs = args[0] as usize;
            debug_assert_eq!(code[fs], Opcode::FunStart as i32);
            let fid = code[fs + 2];
            if fid >= 0 {
                image.functions()[fid as usize].name.to_string()
            } else {
                String::new()
            }
        }
        Opcode::Bcall => natives.get(args[0]).map(|nf| nf.name.to_owned()).unwrap_or_default(),
        Opcode::NewObject => {
            let ti = image.type_info(args[0]);
            if ti.t.is_udt() {
                image.udts()[ti.structidx as usize].name.to_string()
            } else {
                String::new()
            }
        }
        _ => String::new(),
    }
}

fn escape_and_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
