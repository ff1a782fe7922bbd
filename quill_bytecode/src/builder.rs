//! Programmatic image assembly.
//!
//! `ImageBuilder` is how tests and embedders produce images without a
//! front end: it interns strings and type descriptors, tracks the stack
//! depth that becomes each instruction's `regso` word, and resolves jump
//! labels in a fixup pass before serialization.

use crate::image::{
    BYTECODE_VERSION, SEC_CODE, SEC_ENUMS, SEC_FILENAMES, SEC_FLOATVECTYPES, SEC_FUNCTIONS,
    SEC_IDENTS, SEC_INTVECTYPES, SEC_LINETABLE, SEC_SPECIDENTS, SEC_STRINGTABLE, SEC_TYPETABLE,
    SEC_UDTS, SEC_VTABLES,
};
use crate::opcodes::Opcode;
use quill_core::ValueType;
use rustc_hash::FxHashMap;

/// Forward-reference handle for a jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

pub struct ImageBuilder {
    code: Vec<i32>,
    typetable: Vec<i32>,
    type_dedup: FxHashMap<Vec<i32>, i32>,
    strings: Vec<String>,
    string_ids: FxHashMap<String, i32>,
    specidents: Vec<(i32, i32)>,
    idents: Vec<(i32, bool, bool)>,
    functions: Vec<(i32, i32)>,
    udts: Vec<(i32, i32, i32)>,
    enums: Vec<(i32, i32, Vec<(i32, i64)>)>,
    filenames: Vec<String>,
    linetable: Vec<(i32, i32, i32)>,
    vtables: Vec<i32>,
    intvectypes: Vec<i32>,
    floatvectypes: Vec<i32>,
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, Label)>,
    depth: i32,
}

impl ImageBuilder {
    pub fn new() -> ImageBuilder {
        let mut b = ImageBuilder {
            code: Vec::new(),
            typetable: Vec::new(),
            type_dedup: FxHashMap::default(),
            strings: Vec::new(),
            string_ids: FxHashMap::default(),
            specidents: Vec::new(),
            idents: Vec::new(),
            functions: Vec::new(),
            udts: Vec::new(),
            enums: Vec::new(),
            filenames: Vec::new(),
            linetable: Vec::new(),
            vtables: Vec::new(),
            intvectypes: Vec::new(),
            floatvectypes: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            depth: 0,
        };
        // The mandatory first instruction; patched by set_entry.
        b.code.extend_from_slice(&[Opcode::Jump as i32, 0, -1]);
        b
    }

    // -------------------------------------------------------------------------
    // Symbols
    // -------------------------------------------------------------------------

    pub fn intern(&mut self, s: &str) -> i32 {
        if let Some(&id) = self.string_ids.get(s) {
            return id;
        }
        let id = self.strings.len() as i32;
        self.strings.push(s.to_owned());
        self.string_ids.insert(s.to_owned(), id);
        id
    }

    /// Declare a global variable slot; returns the specident index the
    /// `PUSHVAR`/`STOREVAR` operands use.
    pub fn declare_var(&mut self, name: &str, typeidx: i32, readonly: bool, global: bool) -> i32 {
        let sidx = self.intern(name);
        let ididx = self.idents.len() as i32;
        self.idents.push((sidx, readonly, global));
        let varidx = self.specidents.len() as i32;
        self.specidents.push((ididx, typeidx));
        varidx
    }

    /// Register a named function; its bytecode start is bound by the
    /// `fun_start` call that passes this id.
    pub fn declare_function(&mut self, name: &str) -> i32 {
        let sidx = self.intern(name);
        let fid = self.functions.len() as i32;
        self.functions.push((sidx, -1));
        fid
    }

    pub fn declare_udt(&mut self, name: &str, vtable_start: i32, nfields: i32) -> i32 {
        let sidx = self.intern(name);
        let idx = self.udts.len() as i32;
        self.udts.push((sidx, vtable_start, nfields));
        idx
    }

    pub fn add_enum(&mut self, name: &str, flags: i32, vals: &[(&str, i64)]) -> i32 {
        let sidx = self.intern(name);
        let vals = vals.iter().map(|(n, v)| (self.intern(n), *v)).collect();
        let idx = self.enums.len() as i32;
        self.enums.push((sidx, flags, vals));
        idx
    }

    pub fn add_filename(&mut self, name: &str) -> i32 {
        let idx = self.filenames.len() as i32;
        self.filenames.push(name.to_owned());
        idx
    }

    pub fn add_line(&mut self, ip: usize, line: i32, fileidx: i32) {
        self.linetable.push((ip as i32, line, fileidx));
    }

    pub fn push_vtable_entry(&mut self, fun_addr: i32) {
        self.vtables.push(fun_addr);
    }

    pub fn add_default_int_vector_type(&mut self, tti: i32) {
        self.intvectypes.push(tti);
    }

    pub fn add_default_float_vector_type(&mut self, tti: i32) {
        self.floatvectypes.push(tti);
    }

    // -------------------------------------------------------------------------
    // Types
    // -------------------------------------------------------------------------

    fn add_type(&mut self, entry: Vec<i32>) -> i32 {
        if let Some(&idx) = self.type_dedup.get(&entry) {
            return idx;
        }
        let idx = self.typetable.len() as i32;
        self.typetable.extend_from_slice(&entry);
        self.type_dedup.insert(entry, idx);
        idx
    }

    /// Single-word descriptor (float, string, any, function, resource).
    pub fn type_simple(&mut self, t: ValueType) -> i32 {
        match t {
            ValueType::Int => self.add_type(vec![t as i32, -1]),
            ValueType::Nil => self.add_type(vec![t as i32, -1]),
            _ => self.add_type(vec![t as i32]),
        }
    }

    pub fn type_int_enum(&mut self, enumidx: i32) -> i32 {
        self.add_type(vec![ValueType::Int as i32, enumidx])
    }

    pub fn type_vector(&mut self, subt: i32) -> i32 {
        self.add_type(vec![ValueType::Vector as i32, subt])
    }

    pub fn type_nil(&mut self, subt: i32) -> i32 {
        self.add_type(vec![ValueType::Nil as i32, subt])
    }

    /// Class/struct descriptor with its inline element-type list.
    pub fn type_udt(&mut self, t: ValueType, structidx: i32, elems: &[i32]) -> i32 {
        debug_assert!(t.is_udt());
        let mut entry = vec![t as i32, structidx, elems.len() as i32];
        entry.extend_from_slice(elems);
        self.add_type(entry)
    }

    // -------------------------------------------------------------------------
    // Emission
    // -------------------------------------------------------------------------

    /// Current code address.
    pub fn here(&self) -> usize {
        self.code.len()
    }

    /// Override the tracked stack depth (after joins where the builder
    /// cannot infer it).
    pub fn set_depth(&mut self, depth: i32) {
        self.depth = depth;
    }

    pub fn depth(&self) -> i32 {
        self.depth
    }

    /// Emit a fixed-arity instruction whose stack effect is statically
    /// known. Opcodes with caller-determined effects (calls, BCALL,
    /// NEWOBJECT) must use their dedicated emitters.
    pub fn op(&mut self, op: Opcode, args: &[i32]) {
        let effect = static_effect(op, args)
            .unwrap_or_else(|| panic!("{:?} needs an explicit stack effect", op));
        self.raw_op(op, args, effect);
    }

    fn raw_op(&mut self, op: Opcode, args: &[i32], effect: i32) {
        debug_assert!(op.arity() < 0 || args.len() == op.arity() as usize);
        self.code.push(op as i32);
        self.code.push(self.depth);
        self.code.extend_from_slice(args);
        self.depth += effect;
    }

    pub fn op_bcall(&mut self, nfidx: i32, effect: i32) {
        self.raw_op(Opcode::Bcall, &[nfidx], effect);
    }

    pub fn op_call(&mut self, fun_addr: usize, nargs: i32, nrets: i32) {
        self.raw_op(Opcode::Call, &[fun_addr as i32], nrets - nargs);
    }

    /// Indirect call: also pops the function value.
    pub fn op_callv(&mut self, nargs: i32, nrets: i32) {
        self.raw_op(Opcode::CallV, &[], nrets - nargs - 1);
    }

    pub fn op_ddcall(&mut self, vtab_slot: i32, nargs: i32, nrets: i32) {
        self.raw_op(Opcode::DdCall, &[vtab_slot, nargs], nrets - nargs);
    }

    pub fn op_new_object(&mut self, tti: i32, nfields: i32) {
        self.raw_op(Opcode::NewObject, &[tti], 1 - nfields);
    }

    pub fn op_push_fun(&mut self, fun_addr: usize) {
        self.raw_op(Opcode::PushFun, &[fun_addr as i32], 1);
    }

    // -------------------------------------------------------------------------
    // Control flow
    // -------------------------------------------------------------------------

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Emit the `BLOCK_START` that is this label's target.
    pub fn place_block(&mut self, l: Label) {
        assert!(self.labels[l.0].is_none(), "label placed twice");
        self.labels[l.0] = Some(self.code.len());
        self.raw_op(Opcode::BlockStart, &[], 0);
    }

    /// Emit the `JUMP_TABLE_CASE_START` a jump-table target points at.
    pub fn place_case(&mut self, l: Label) {
        assert!(self.labels[l.0].is_none(), "label placed twice");
        self.labels[l.0] = Some(self.code.len());
        self.raw_op(Opcode::JumpTableCaseStart, &[], 0);
    }

    fn emit_target(&mut self, l: Label) {
        self.fixups.push((self.code.len(), l));
        self.code.push(-1);
    }

    pub fn jump(&mut self, l: Label) {
        self.code.push(Opcode::Jump as i32);
        self.code.push(self.depth);
        self.emit_target(l);
    }

    pub fn jump_fail(&mut self, l: Label) {
        self.code.push(Opcode::JumpFail as i32);
        self.code.push(self.depth);
        self.emit_target(l);
        self.depth -= 1;
    }

    pub fn jump_no_fail(&mut self, l: Label) {
        self.code.push(Opcode::JumpNoFail as i32);
        self.code.push(self.depth);
        self.emit_target(l);
        self.depth -= 1;
    }

    pub fn jump_if_unwound(&mut self, df: i32, l: Label) {
        self.code.push(Opcode::JumpIfUnwound as i32);
        self.code.push(self.depth);
        self.code.push(df);
        self.emit_target(l);
    }

    pub fn jump_table(&mut self, mini: i32, maxi: i32, cases: &[Label], default: Label) {
        assert_eq!(cases.len() as i32, maxi - mini + 1);
        self.code.push(Opcode::JumpTable as i32);
        self.code.push(self.depth);
        self.code.push(mini);
        self.code.push(maxi);
        for &c in cases {
            self.emit_target(c);
        }
        self.emit_target(default);
        self.depth -= 1;
    }

    /// Emit a `FUNSTART` header; returns its code address (the id that
    /// `CALL` operands, vtable entries and `fun_<id>` names use). Resets
    /// depth tracking for the new body.
    pub fn fun_start(
        &mut self,
        fid: i32,
        regs_max: i32,
        args: &[i32],
        defs: &[i32],
        nkeepvars: i32,
        owned: &[i32],
    ) -> usize {
        let addr = self.code.len();
        if fid >= 0 {
            self.functions[fid as usize].1 = addr as i32;
        }
        self.depth = 0;
        self.code.push(Opcode::FunStart as i32);
        self.code.push(0);
        self.code.push(fid);
        self.code.push(regs_max);
        self.code.push(args.len() as i32);
        self.code.extend_from_slice(args);
        self.code.push(defs.len() as i32);
        self.code.extend_from_slice(defs);
        self.code.push(nkeepvars);
        self.code.push(owned.len() as i32);
        self.code.extend_from_slice(owned);
        addr
    }

    /// Patch the mandatory first `JUMP` to the starting function.
    pub fn set_entry(&mut self, addr: usize) {
        self.code[2] = addr as i32;
    }

    // -------------------------------------------------------------------------
    // Serialization
    // -------------------------------------------------------------------------

    pub fn finish(mut self) -> Vec<u8> {
        for (pos, l) in std::mem::take(&mut self.fixups) {
            let target = self.labels[l.0].expect("unresolved label");
            self.code[pos] = target as i32;
        }

        let strings_payload = serialize_strings(&self.strings);
        let filenames_payload = serialize_strings(&self.filenames);

        let mut specidents = vec![self.specidents.len() as i32];
        for (ididx, typeidx) in &self.specidents {
            specidents.extend_from_slice(&[*ididx, *typeidx]);
        }
        let mut idents = vec![self.idents.len() as i32];
        for (sidx, ro, gl) in &self.idents {
            idents.extend_from_slice(&[*sidx, *ro as i32, *gl as i32]);
        }
        let mut functions = vec![self.functions.len() as i32];
        for (sidx, start) in &self.functions {
            functions.extend_from_slice(&[*sidx, *start]);
        }
        let mut udts = vec![self.udts.len() as i32];
        for (sidx, vstart, nfields) in &self.udts {
            udts.extend_from_slice(&[*sidx, *vstart, *nfields]);
        }
        let mut enums = vec![self.enums.len() as i32];
        for (sidx, flags, vals) in &self.enums {
            enums.extend_from_slice(&[*sidx, *flags, vals.len() as i32]);
            for (vsidx, val) in vals {
                enums.extend_from_slice(&[*vsidx, *val as i32, (*val >> 32) as i32]);
            }
        }
        let mut linetable = vec![self.linetable.len() as i32];
        for (ip, line, fileidx) in &self.linetable {
            linetable.extend_from_slice(&[*ip, *line, *fileidx]);
        }

        let sections: Vec<(i32, Vec<i32>)> = vec![
            (SEC_TYPETABLE, self.typetable),
            (SEC_SPECIDENTS, specidents),
            (SEC_IDENTS, idents),
            (SEC_FUNCTIONS, functions),
            (SEC_UDTS, udts),
            (SEC_ENUMS, enums),
            (SEC_STRINGTABLE, strings_payload),
            (SEC_FILENAMES, filenames_payload),
            (SEC_LINETABLE, linetable),
            (SEC_VTABLES, self.vtables),
            (SEC_INTVECTYPES, self.intvectypes),
            (SEC_FLOATVECTYPES, self.floatvectypes),
            (SEC_CODE, self.code),
        ];

        let dir_end = 3 + sections.len() * 3;
        let mut words = Vec::with_capacity(dir_end);
        words.push(super::image::magic());
        words.push(BYTECODE_VERSION);
        words.push(sections.len() as i32);
        let mut off = dir_end;
        for (tag, payload) in &sections {
            words.extend_from_slice(&[*tag, off as i32, payload.len() as i32]);
            off += payload.len();
        }
        for (_, payload) in &sections {
            words.extend_from_slice(payload);
        }
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

impl Default for ImageBuilder {
    fn default() -> Self {
        ImageBuilder::new()
    }
}

fn serialize_strings(strings: &[String]) -> Vec<i32> {
    let mut out = vec![strings.len() as i32];
    for s in strings {
        let bytes = s.as_bytes();
        out.push(bytes.len() as i32);
        for chunk in bytes.chunks(4) {
            let mut w = [0u8; 4];
            w[..chunk.len()].copy_from_slice(chunk);
            out.push(i32::from_le_bytes(w));
        }
    }
    out
}

/// Net stack effect of fixed-effect opcodes; `None` for the ones whose
/// effect depends on context the emitter must supply.
fn static_effect(op: Opcode, args: &[i32]) -> Option<i32> {
    use Opcode::*;
    Some(match op {
        PushInt | PushInt64 | PushFloat | PushFloat64 | PushStr | PushNil | PushVar | Dup => 1,
        StoreVar | Pop | PopRef | VPush | IdxI => -1,
        IAdd | ISub | IMul | IDiv | IMod | ILt | ILe | IGt | IGe | IEq | INe | FAdd | FSub
        | FMul | FDiv | FLt | FEq | SAdd => -1,
        IUMinus | I2F | A2S | VLen | PushFld => 0,
        BlockStart | JumpTableCaseStart | JumpTableEnd | SaveRets | KeepRef | KeepRefLoop
        | Abort | Jump => 0,
        NewVec => 1 - args[1],
        JumpFail | JumpNoFail | JumpTable | Exit => -1,
        JumpIfUnwound => 0,
        Return => -args[1],
        ReturnAny => -args[0],
        NewObject | Bcall | Call | CallV | DdCall | FunStart | PushFun => return None,
    })
}
