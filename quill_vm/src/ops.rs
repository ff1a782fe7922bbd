//! Opcode handlers.
//!
//! One function per opcode, named after it, in the signature shape of its
//! family (base handlers take their decoded operands, jump helpers leave
//! a truth cell for the engine to pop). Handlers own the refcount
//! protocol at their boundaries: everything they push is one owning
//! reference, everything they consume they either release or hand to a
//! new owner.

use crate::vm::Vm;
use quill_core::{PrintPrefs, Value, ValueType, VmErrorKind, VmResult};

// =============================================================================
// Pushes
// =============================================================================

#[inline(always)]
fn pushint(vm: &mut Vm, a: i32) {
    vm.push(Value::int(a as i64));
}

#[inline(always)]
fn pushint64(vm: &mut Vm, lo: i32, hi: i32) {
    vm.push(Value::int((lo as u32 as i64) | ((hi as i64) << 32)));
}

#[inline(always)]
fn pushflt(vm: &mut Vm, bits: i32) {
    vm.push(Value::float(f32::from_bits(bits as u32) as f64));
}

#[inline(always)]
fn pushflt64(vm: &mut Vm, lo: i32, hi: i32) {
    let bits = (lo as u32 as u64) | ((hi as u32 as u64) << 32);
    vm.push(Value::float(f64::from_bits(bits)));
}

fn pushstr(vm: &mut Vm, sidx: i32) {
    // Constant-string slots are populated on first use; the slot keeps
    // one reference until teardown, each push adds an owning copy.
    let id = match vm.constant_strings[sidx as usize] {
        Some(id) => id,
        None => {
            let image = vm.image.clone();
            let id = vm.heap.new_string(image.string(sidx));
            vm.constant_strings[sidx as usize] = Some(id);
            id
        }
    };
    vm.heap.inc(id);
    vm.push(Value::reference(id, ValueType::String));
}

#[inline(always)]
fn pushnil(vm: &mut Vm) {
    vm.push(Value::nil());
}

#[inline(always)]
fn pushvar(vm: &mut Vm, varidx: i32) {
    let v = vm.vars[varidx as usize];
    vm.heap.inc_ref_nil(v);
    vm.push(v);
}

#[inline(always)]
fn storevar(vm: &mut Vm, varidx: i32) {
    let v = vm.pop();
    let old = vm.vars[varidx as usize];
    vm.heap.dec_ref_nil(old);
    vm.vars[varidx as usize] = v;
}

#[inline(always)]
fn dup(vm: &mut Vm) {
    let v = vm.top();
    vm.heap.inc_ref_nil(v);
    vm.push(v);
}

/// Discard a scalar or borrowed cell (no release).
#[inline(always)]
fn pop_op(vm: &mut Vm) {
    vm.pop();
}

/// Discard an owning reference.
#[inline(always)]
fn popref(vm: &mut Vm) {
    let v = vm.pop();
    vm.heap.dec_ref_nil(v);
}

// =============================================================================
// Integer / float arithmetic
// =============================================================================

macro_rules! int_binop {
    ($name:ident, $a:ident, $b:ident, $e:expr) => {
        #[inline(always)]
        fn $name(vm: &mut Vm) -> VmResult<()> {
            let $b = vm.pop().ival();
            let $a = vm.pop().ival();
            vm.push(Value::int($e));
            Ok(())
        }
    };
}

int_binop!(iadd, a, b, a.wrapping_add(b));
int_binop!(isub, a, b, a.wrapping_sub(b));
int_binop!(imul, a, b, a.wrapping_mul(b));
int_binop!(ilt, a, b, (a < b) as i64);
int_binop!(ile, a, b, (a <= b) as i64);
int_binop!(igt, a, b, (a > b) as i64);
int_binop!(ige, a, b, (a >= b) as i64);
int_binop!(ieq, a, b, (a == b) as i64);
int_binop!(ine, a, b, (a != b) as i64);

fn idiv(vm: &mut Vm) -> VmResult<()> {
    let b = vm.pop().ival();
    let a = vm.pop().ival();
    if b == 0 {
        return Err(vm.error(VmErrorKind::UserError, "division by zero".to_owned()));
    }
    vm.push(Value::int(a.wrapping_div(b)));
    Ok(())
}

fn imod(vm: &mut Vm) -> VmResult<()> {
    let b = vm.pop().ival();
    let a = vm.pop().ival();
    if b == 0 {
        return Err(vm.error(VmErrorKind::UserError, "division by zero".to_owned()));
    }
    vm.push(Value::int(a.wrapping_rem(b)));
    Ok(())
}

#[inline(always)]
fn iuminus(vm: &mut Vm) {
    let a = vm.pop().ival();
    vm.push(Value::int(a.wrapping_neg()));
}

macro_rules! flt_binop {
    ($name:ident, $a:ident, $b:ident, $e:expr) => {
        #[inline(always)]
        fn $name(vm: &mut Vm) {
            let $b = vm.pop().fval();
            let $a = vm.pop().fval();
            vm.push($e);
        }
    };
}

flt_binop!(fadd, a, b, Value::float(a + b));
flt_binop!(fsub, a, b, Value::float(a - b));
flt_binop!(fmul, a, b, Value::float(a * b));
flt_binop!(fdiv, a, b, Value::float(a / b));
flt_binop!(flt_cmp, a, b, Value::int((a < b) as i64));
flt_binop!(feq, a, b, Value::int((a == b) as i64));

#[inline(always)]
fn i2f(vm: &mut Vm) {
    let a = vm.pop().ival();
    vm.push(Value::float(a as f64));
}

// =============================================================================
// Strings
// =============================================================================

fn a2s(vm: &mut Vm) -> VmResult<()> {
    let v = vm.pop();
    let mut sd = String::new();
    vm.value_to_string(&mut sd, v, None, &PrintPrefs::program(), 0);
    vm.heap.dec_ref_nil(v);
    let id = vm.heap.new_string(&sd);
    vm.push(Value::reference(id, ValueType::String));
    Ok(())
}

fn sadd(vm: &mut Vm) -> VmResult<()> {
    let b = vm.pop();
    let a = vm.pop();
    if a.tag() != ValueType::String || b.tag() != ValueType::String {
        return Err(vm.error(VmErrorKind::TypeMismatch, "string concat of non-strings".to_owned()));
    }
    let id = vm.heap.new_string_concat(a.refid(), b.refid());
    vm.heap.dec(a.refid());
    vm.heap.dec(b.refid());
    vm.push(Value::reference(id, ValueType::String));
    Ok(())
}

// =============================================================================
// Vectors
// =============================================================================

fn newvec(vm: &mut Vm, tti: i32, n: i32) -> VmResult<()> {
    let n = n as usize;
    let base = vm.sp - n;
    // Element ownership moves off the stack into the vector.
    let elems = vm.stack[base..vm.sp].to_vec();
    vm.sp = base;
    let id = vm.heap.new_vector(tti, elems);
    vm.push(Value::reference(id, ValueType::Vector));
    Ok(())
}

fn vpush(vm: &mut Vm) -> VmResult<()> {
    let v = vm.pop();
    let vecv = vm.top();
    if vecv.tag() != ValueType::Vector {
        return Err(vm.error(VmErrorKind::TypeMismatch, "append to non-vector".to_owned()));
    }
    vm.heap.vec_push(vecv.refid(), v);
    Ok(())
}

fn vlen(vm: &mut Vm) -> VmResult<()> {
    let vecv = vm.pop();
    if vecv.tag() != ValueType::Vector {
        return Err(vm.error(VmErrorKind::TypeMismatch, "length of non-vector".to_owned()));
    }
    let len = vm.heap.vec_len(vecv.refid());
    vm.heap.dec(vecv.refid());
    vm.push(Value::int(len));
    Ok(())
}

fn idxi(vm: &mut Vm) -> VmResult<()> {
    let idx = vm.pop().ival();
    let vecv = vm.pop();
    if vecv.tag() != ValueType::Vector {
        return Err(vm.error(VmErrorKind::TypeMismatch, "index of non-vector".to_owned()));
    }
    let id = vecv.refid();
    let len = vm.heap.vec_len(id);
    if idx < 0 || idx >= len {
        return Err(vm.idx_err(idx, len, id));
    }
    let elem = vm.heap.vec_elems(id)[idx as usize];
    vm.heap.inc_ref_nil(elem);
    vm.heap.dec(id);
    vm.push(elem);
    Ok(())
}

// =============================================================================
// Objects
// =============================================================================

fn newobject(vm: &mut Vm, tti: i32) -> VmResult<()> {
    let image = vm.image.clone();
    let ti = image.type_info(tti);
    let len = ti.len as usize;
    let base = vm.sp - len;
    let fields: Box<[Value]> = vm.stack[base..vm.sp].into();
    vm.sp = base;
    let id = vm.heap.new_object(tti, fields);
    let tag = if ti.t == ValueType::StructRef { ValueType::StructRef } else { ValueType::Class };
    vm.push(Value::reference(id, tag));
    Ok(())
}

fn pushfld(vm: &mut Vm, i: i32) -> VmResult<()> {
    let objv = vm.pop();
    if !objv.tag().is_udt() || !objv.is_ref() {
        return Err(vm.error(VmErrorKind::TypeMismatch, "field access of non-object".to_owned()));
    }
    let f = vm.heap.obj_field(objv.refid(), i as usize);
    vm.heap.inc_ref_nil(f);
    vm.heap.dec(objv.refid());
    vm.push(f);
    Ok(())
}

// =============================================================================
// Calls (the engine consumes next_call_target right after these)
// =============================================================================

pub(crate) fn u_pushfun(vm: &mut Vm, addr: i32) -> VmResult<()> {
    vm.push(Value::function(addr as i64));
    Ok(())
}

/// Pop the callee computed by preceding code into the next-call-target
/// cell; the engine invokes it immediately.
pub(crate) fn u_callv(vm: &mut Vm) -> VmResult<()> {
    let f = vm.pop();
    if f.tag() != ValueType::Function {
        return Err(vm.error(VmErrorKind::TypeMismatch, "dynamic call of a non-function value".to_owned()));
    }
    vm.next_call_target = f.ival() as usize;
    Ok(())
}

/// Virtual dispatch: resolve the receiver's class vtable slot into the
/// next-call-target cell. The receiver sits `nargs - 1` below the top.
pub(crate) fn u_ddcall(vm: &mut Vm, vtab_slot: i32, nargs: i32) -> VmResult<()> {
    let recv = vm.top_m(nargs as usize - 1);
    if recv.tag() != ValueType::Class {
        return Err(vm.error(VmErrorKind::TypeMismatch, "dynamic dispatch on a non-class value".to_owned()));
    }
    let image = vm.image.clone();
    let tti = vm.heap.header(recv.refid()).tti;
    let ti = image.type_info(tti);
    let udt = &image.udts()[ti.structidx as usize];
    let entry = image.vtables()[(udt.vtable_start + vtab_slot) as usize];
    if entry < 0 {
        return Err(vm.serious_error(
            VmErrorKind::InternalAssertion,
            format!("empty vtable slot {} of {}", vtab_slot, udt.name),
        ));
    }
    vm.next_call_target = entry as usize;
    Ok(())
}

pub(crate) fn u_bcall(vm: &mut Vm, nfidx: i32) -> VmResult<()> {
    let func = match vm.natives.get(nfidx) {
        Some(nf) => nf.func,
        None => {
            return Err(vm.serious_error(
                VmErrorKind::InternalAssertion,
                format!("unknown native function {nfidx}"),
            ))
        }
    };
    func(vm)
}

// =============================================================================
// Conditional-jump helpers: leave a truth cell, engine pops and branches
// on false
// =============================================================================

/// `JUMPFAIL`: branch taken when the condition is false. The condition
/// cell is consumed; a reference condition (nil checks) is released.
pub(crate) fn u_jumpfail(vm: &mut Vm) -> VmResult<()> {
    let cond = vm.pop();
    vm.heap.dec_ref_nil(cond);
    vm.push(Value::int(cond.is_true() as i64));
    Ok(())
}

/// `JUMPNOFAIL`: branch taken when the condition is true.
pub(crate) fn u_jumpnofail(vm: &mut Vm) -> VmResult<()> {
    let cond = vm.pop();
    vm.heap.dec_ref_nil(cond);
    vm.push(Value::int(!cond.is_true() as i64));
    Ok(())
}

/// `JUMPIFUNWOUND df`: true when the last RETURN targeted `df`, i.e. the
/// unwind stops in this frame. On false the engine branches to the
/// continue-unwinding path.
pub(crate) fn u_jumpifunwound(vm: &mut Vm, df: i32) -> VmResult<()> {
    vm.push(Value::int((vm.ret_unwind_to == df) as i64));
    Ok(())
}

// =============================================================================
// Program end
// =============================================================================

pub(crate) fn u_exit(vm: &mut Vm, tti: i32) -> VmResult<()> {
    let ret = vm.pop();
    vm.end_eval(ret, tti)
}

// =============================================================================
// Base-family dispatch
// =============================================================================

/// Route a base-family opcode to its handler. Control flow and the
/// call/exit opcodes are translated by the engine and never reach this.
pub(crate) fn dispatch_base(vm: &mut Vm, op: quill_bytecode::Opcode, args: &[i32]) -> VmResult<()> {
    use quill_bytecode::Opcode::*;
    match op {
        PushInt => pushint(vm, args[0]),
        PushInt64 => pushint64(vm, args[0], args[1]),
        PushFloat => pushflt(vm, args[0]),
        PushFloat64 => pushflt64(vm, args[0], args[1]),
        PushStr => pushstr(vm, args[0]),
        PushNil => pushnil(vm),
        PushVar => pushvar(vm, args[0]),
        StoreVar => storevar(vm, args[0]),
        Dup => dup(vm),
        Pop => pop_op(vm),
        PopRef => popref(vm),
        IAdd => return iadd(vm),
        ISub => return isub(vm),
        IMul => return imul(vm),
        IDiv => return idiv(vm),
        IMod => return imod(vm),
        IUMinus => iuminus(vm),
        ILt => return ilt(vm),
        ILe => return ile(vm),
        IGt => return igt(vm),
        IGe => return ige(vm),
        IEq => return ieq(vm),
        INe => return ine(vm),
        FAdd => fadd(vm),
        FSub => fsub(vm),
        FMul => fmul(vm),
        FDiv => fdiv(vm),
        FLt => flt_cmp(vm),
        FEq => feq(vm),
        I2F => i2f(vm),
        A2S => return a2s(vm),
        SAdd => return sadd(vm),
        NewVec => return newvec(vm, args[0], args[1]),
        VPush => return vpush(vm),
        VLen => return vlen(vm),
        IdxI => return idxi(vm),
        NewObject => return newobject(vm, args[0]),
        PushFld => return pushfld(vm, args[0]),
        _ => {
            return Err(vm.serious_error(
                VmErrorKind::InternalAssertion,
                format!("opcode {:?} reached base dispatch", op),
            ))
        }
    }
    Ok(())
}
