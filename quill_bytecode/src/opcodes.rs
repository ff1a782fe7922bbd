//! Instruction set, arity tables and stream parsing.
//!
//! Every instruction is laid out as `[opcode, regso, operands...]` where
//! `regso` is the stack depth (in cells, relative to the frame base) the
//! type checker expects at that point; it only feeds debug assertions and
//! the AOT assert emitter. Most opcodes have a fixed operand count;
//! `FUNSTART` and `JUMP_TABLE` encode their own lengths.

use std::ops::Range;

/// Operand-count marker for the variable-length opcodes.
pub const ARITY_VARARG: i32 = -1;

/// One past the highest opcode id; anything outside `0..MAX_OPS` in a code
/// stream is corrupt.
pub const MAX_OPS: i32 = Opcode::Abort as i32 + 1;

// =============================================================================
// Opcodes
// =============================================================================

/// Bytecode operations.
///
/// Control flow (`Jump*`, `BlockStart`, `JumpTable*`, `Return*`,
/// `KeepRef*`, `FunStart`) is translated by the engines themselves; the
/// rest dispatch to handlers with their family's signature.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Jump = 0,
    JumpFail,
    JumpNoFail,
    JumpIfUnwound,
    BlockStart,
    JumpTable,
    JumpTableCaseStart,
    JumpTableEnd,
    FunStart,
    Return,
    ReturnAny,
    SaveRets,
    KeepRef,
    KeepRefLoop,
    Call,
    CallV,
    DdCall,
    PushFun,
    Bcall,

    PushInt,
    PushInt64,
    PushFloat,
    PushFloat64,
    PushStr,
    PushNil,
    PushVar,
    StoreVar,
    Dup,
    Pop,
    PopRef,

    IAdd,
    ISub,
    IMul,
    IDiv,
    IMod,
    IUMinus,
    ILt,
    ILe,
    IGt,
    IGe,
    IEq,
    INe,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FLt,
    FEq,
    I2F,
    A2S,
    SAdd,

    NewVec,
    VPush,
    VLen,
    IdxI,
    NewObject,
    PushFld,

    Exit,
    Abort,
}

/// The five handler signature families (spec: base / call / vararg /
/// jump1 / jump2). AOT plain-C output emits one prototype shape per
/// family; the engine-translated opcodes still belong to a family so the
/// prototype set is total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpFamily {
    /// `(vm, sp, a0..aA-1) -> sp`
    Base,
    /// `(vm, sp, a0..aA-1, fun_base_t cont) -> sp`
    Call,
    /// `(vm, sp, const int *args) -> sp`
    Vararg,
    /// `(vm, sp) -> sp`
    Jump1,
    /// `(vm, sp, int df) -> sp`
    Jump2,
}

impl Opcode {
    pub fn from_i32(v: i32) -> Option<Opcode> {
        if (0..MAX_OPS).contains(&v) {
            // Discriminants are dense and start at zero.
            Some(unsafe { std::mem::transmute::<i32, Opcode>(v) })
        } else {
            None
        }
    }

    /// Static operand count, or `ARITY_VARARG`.
    pub fn arity(self) -> i32 {
        use Opcode::*;
        match self {
            FunStart | JumpTable => ARITY_VARARG,
            Jump | JumpFail | JumpNoFail => 1,
            JumpIfUnwound => 2,
            BlockStart | JumpTableCaseStart | JumpTableEnd | SaveRets => 0,
            Return => 2,
            ReturnAny => 1,
            KeepRef | KeepRefLoop => 2,
            Call | PushFun | Bcall => 1,
            CallV => 0,
            DdCall => 2,
            PushInt | PushFloat | PushStr | PushVar | StoreVar | NewObject | PushFld | Exit => 1,
            PushInt64 | PushFloat64 | NewVec => 2,
            PushNil | Dup | Pop | PopRef | Abort => 0,
            IAdd | ISub | IMul | IDiv | IMod | IUMinus | ILt | ILe | IGt | IGe | IEq | INe
            | FAdd | FSub | FMul | FDiv | FLt | FEq | I2F | A2S | SAdd | VPush | VLen | IdxI => 0,
        }
    }

    pub fn family(self) -> OpFamily {
        use Opcode::*;
        match self {
            FunStart | JumpTable => OpFamily::Vararg,
            JumpFail | JumpNoFail => OpFamily::Jump1,
            JumpIfUnwound => OpFamily::Jump2,
            PushFun => OpFamily::Call,
            _ => OpFamily::Base,
        }
    }

    /// Upper-case name as it appears in AOT output (`U_<NAME>` helpers).
    pub fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            Jump => "JUMP",
            JumpFail => "JUMPFAIL",
            JumpNoFail => "JUMPNOFAIL",
            JumpIfUnwound => "JUMPIFUNWOUND",
            BlockStart => "BLOCK_START",
            JumpTable => "JUMP_TABLE",
            JumpTableCaseStart => "JUMP_TABLE_CASE_START",
            JumpTableEnd => "JUMP_TABLE_END",
            FunStart => "FUNSTART",
            Return => "RETURN",
            ReturnAny => "RETURNANY",
            SaveRets => "SAVERETS",
            KeepRef => "KEEPREF",
            KeepRefLoop => "KEEPREFLOOP",
            Call => "CALL",
            CallV => "CALLV",
            DdCall => "DDCALL",
            PushFun => "PUSHFUN",
            Bcall => "BCALL",
            PushInt => "PUSHINT",
            PushInt64 => "PUSHINT64",
            PushFloat => "PUSHFLT",
            PushFloat64 => "PUSHFLT64",
            PushStr => "PUSHSTR",
            PushNil => "PUSHNIL",
            PushVar => "PUSHVAR",
            StoreVar => "STOREVAR",
            Dup => "DUP",
            Pop => "POP",
            PopRef => "POPREF",
            IAdd => "IADD",
            ISub => "ISUB",
            IMul => "IMUL",
            IDiv => "IDIV",
            IMod => "IMOD",
            IUMinus => "IUMINUS",
            ILt => "ILT",
            ILe => "ILE",
            IGt => "IGT",
            IGe => "IGE",
            IEq => "IEQ",
            INe => "INE",
            FAdd => "FADD",
            FSub => "FSUB",
            FMul => "FMUL",
            FDiv => "FDIV",
            FLt => "FLT",
            FEq => "FEQ",
            I2F => "I2F",
            A2S => "A2S",
            SAdd => "SADD",
            NewVec => "NEWVEC",
            VPush => "VPUSH",
            VLen => "VLEN",
            IdxI => "IDXI",
            NewObject => "NEWOBJECT",
            PushFld => "PUSHFLD",
            Exit => "EXIT",
            Abort => "ABORT",
        }
    }

    /// Conditional jumps: helper leaves a truth cell, engine pops and
    /// branches on false.
    #[inline]
    pub fn is_cond_jump(self) -> bool {
        matches!(self, Opcode::JumpFail | Opcode::JumpNoFail | Opcode::JumpIfUnwound)
    }
}

/// Iterate all opcodes in id order (prototype emission, tables).
pub fn all_opcodes() -> impl Iterator<Item = Opcode> {
    (0..MAX_OPS).map(|i| Opcode::from_i32(i).unwrap())
}

// =============================================================================
// Stream parsing
// =============================================================================

/// A decoded instruction position: operand range and successor ip.
#[derive(Debug, Clone)]
pub struct ParsedOp {
    pub op: Opcode,
    pub regso: i32,
    /// Word range of the operands (excludes opcode and regso words).
    pub args: Range<usize>,
    pub next_ip: usize,
}

/// Decode the instruction at `ip`: identify the opcode, consume the
/// `regso` word, and step past the inline operands (including the
/// variable encodings of `FUNSTART` and `JUMP_TABLE`). Returns `None` on
/// an unknown opcode or a truncated stream.
pub fn parse_op_and_get_arity(code: &[i32], ip: usize) -> Option<ParsedOp> {
    let op = Opcode::from_i32(*code.get(ip)?)?;
    let regso = *code.get(ip + 1)?;
    let args = ip + 2;
    let next_ip = match op {
        Opcode::FunStart => FunHeader::parse(code, args)?.end_ip,
        Opcode::JumpTable => {
            let mini = *code.get(args)?;
            let maxi = *code.get(args + 1)?;
            if maxi < mini {
                return None;
            }
            // mini, maxi, one target per case, default.
            let end = args + 2 + (maxi - mini + 1) as usize + 1;
            if end > code.len() {
                return None;
            }
            end
        }
        _ => {
            let end = args + op.arity() as usize;
            if end > code.len() {
                return None;
            }
            end
        }
    };
    Some(ParsedOp { op, regso, args: args..next_ip, next_ip })
}

// =============================================================================
// Function headers
// =============================================================================

/// Decoded `FUNSTART` header. The layout, as operand words:
/// `fid, regs_max, nargs, arg_idx[nargs], ndef, def_idx[ndef],
/// nkeepvars, nownedvars, owned_idx[nownedvars]`.
///
/// `fid` is an index into the image's function table, or negative for an
/// anonymous block.
#[derive(Debug, Clone)]
pub struct FunHeader {
    pub fid: i32,
    pub regs_max: i32,
    pub args: Range<usize>,
    pub defs: Range<usize>,
    pub nkeepvars: i32,
    pub owned: Range<usize>,
    /// First code index after the header (the function body).
    pub end_ip: usize,
}

impl FunHeader {
    /// Parse a header whose `fid` word sits at `start` (i.e. the operand
    /// start of a `FUNSTART`, which is also what stack frames record).
    pub fn parse(code: &[i32], start: usize) -> Option<FunHeader> {
        let mut ip = start;
        let fid = *code.get(ip)?;
        let regs_max = *code.get(ip + 1)?;
        ip += 2;
        let nargs = *code.get(ip)? as usize;
        let args = ip + 1..ip + 1 + nargs;
        ip = args.end;
        let ndef = *code.get(ip)? as usize;
        let defs = ip + 1..ip + 1 + ndef;
        ip = defs.end;
        let nkeepvars = *code.get(ip)?;
        let nowned = *code.get(ip + 1)? as usize;
        let owned = ip + 2..ip + 2 + nowned;
        if owned.end > code.len() {
            return None;
        }
        let end_ip = owned.end;
        Some(FunHeader { fid, regs_max, args, defs, nkeepvars, owned, end_ip })
    }

    #[inline]
    pub fn nargs(&self) -> usize {
        self.args.len()
    }

    #[inline]
    pub fn ndef(&self) -> usize {
        self.defs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for op in all_opcodes() {
            assert_eq!(Opcode::from_i32(op as i32), Some(op));
        }
        assert_eq!(Opcode::from_i32(MAX_OPS), None);
        assert_eq!(Opcode::from_i32(-1), None);
    }

    #[test]
    fn test_families_cover_all() {
        // Every opcode belongs to exactly one family; the call family is
        // just PUSHFUN and the vararg family the engine-translated pair.
        assert_eq!(Opcode::PushFun.family(), OpFamily::Call);
        assert_eq!(Opcode::FunStart.family(), OpFamily::Vararg);
        assert_eq!(Opcode::JumpTable.family(), OpFamily::Vararg);
        assert_eq!(Opcode::JumpFail.family(), OpFamily::Jump1);
        assert_eq!(Opcode::JumpIfUnwound.family(), OpFamily::Jump2);
        assert_eq!(Opcode::IAdd.family(), OpFamily::Base);
    }

    #[test]
    fn test_parse_static_arity() {
        // [PUSHINT, regso=0, 42], [POP, regso=1]
        let code = [Opcode::PushInt as i32, 0, 42, Opcode::Pop as i32, 1];
        let p = parse_op_and_get_arity(&code, 0).unwrap();
        assert_eq!(p.op, Opcode::PushInt);
        assert_eq!(p.regso, 0);
        assert_eq!(&code[p.args.clone()], &[42]);
        let p2 = parse_op_and_get_arity(&code, p.next_ip).unwrap();
        assert_eq!(p2.op, Opcode::Pop);
        assert_eq!(p2.next_ip, code.len());
    }

    #[test]
    fn test_parse_jump_table() {
        // switch over 1..=3 with targets 100,101,102, default 103
        let code = [Opcode::JumpTable as i32, 1, 1, 3, 100, 101, 102, 103];
        let p = parse_op_and_get_arity(&code, 0).unwrap();
        assert_eq!(p.next_ip, code.len());
        assert_eq!(&code[p.args], &[1, 3, 100, 101, 102, 103]);
    }

    #[test]
    fn test_parse_funstart_header() {
        // fid=2, regs_max=4, nargs=2 [10, 11], ndef=1 [12], nkeep=1,
        // nowned=1 [10]
        let code = [
            Opcode::FunStart as i32,
            0, // regso
            2, 4, 2, 10, 11, 1, 12, 1, 1, 10,
        ];
        let p = parse_op_and_get_arity(&code, 0).unwrap();
        let h = FunHeader::parse(&code, 2).unwrap();
        assert_eq!(h.fid, 2);
        assert_eq!(h.regs_max, 4);
        assert_eq!(&code[h.args.clone()], &[10, 11]);
        assert_eq!(&code[h.defs.clone()], &[12]);
        assert_eq!(h.nkeepvars, 1);
        assert_eq!(&code[h.owned.clone()], &[10]);
        assert_eq!(h.end_ip, code.len());
        assert_eq!(p.next_ip, code.len());
    }

    #[test]
    fn test_truncated_stream_rejected() {
        let code = [Opcode::PushInt as i32, 0];
        assert!(parse_op_and_get_arity(&code, 0).is_none());
    }
}
