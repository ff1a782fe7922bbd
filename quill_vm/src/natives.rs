//! Native-function registry.
//!
//! `BCALL` dispatches through here. A native pops its arguments, pushes
//! its results, and may raise through the normal error path. The
//! registered set is the minimum the engine and tests exercise; embedders
//! extend it.

use crate::vm::Vm;
use quill_core::{PrintPrefs, Value, VmResult};
use rustc_hash::FxHashMap;

pub type NativeFn = fn(&mut Vm) -> VmResult<()>;

pub struct NativeFun {
    pub name: &'static str,
    /// Arguments popped; informational (the producer computed stack
    /// effects at compile time).
    pub nargs: usize,
    /// The frame-tick native the AOT translator calls directly instead of
    /// going through the helper.
    pub is_gl_frame: bool,
    pub func: NativeFn,
}

pub struct NativeRegistry {
    funs: Vec<NativeFun>,
    by_name: FxHashMap<&'static str, i32>,
}

impl NativeRegistry {
    /// The built-in set, in stable index order.
    pub fn core() -> NativeRegistry {
        let mut r = NativeRegistry { funs: Vec::new(), by_name: FxHashMap::default() };
        r.add("print", 1, false, nf_print);
        r.add("error", 1, false, nf_error);
        r.add("thread_start", 1, false, nf_thread_start);
        r.add("thread_write", 1, false, nf_thread_write);
        r.add("thread_read", 1, false, nf_thread_read);
        r.add("set_max_stack_size", 1, false, nf_set_max_stack_size);
        r.add("gl_frame", 0, true, nf_gl_frame);
        r.add("is_worker", 0, false, nf_is_worker);
        r
    }

    fn add(&mut self, name: &'static str, nargs: usize, is_gl_frame: bool, func: NativeFn) {
        self.by_name.insert(name, self.funs.len() as i32);
        self.funs.push(NativeFun { name, nargs, is_gl_frame, func });
    }

    pub fn get(&self, idx: i32) -> Option<&NativeFun> {
        self.funs.get(idx as usize)
    }

    pub fn lookup(&self, name: &str) -> Option<i32> {
        self.by_name.get(name).copied()
    }

    pub fn funs(&self) -> &[NativeFun] {
        &self.funs
    }
}

// =============================================================================
// The built-ins
// =============================================================================

fn nf_print(vm: &mut Vm) -> VmResult<()> {
    let v = vm.pop();
    let mut sd = String::new();
    vm.value_to_string(&mut sd, v, None, &PrintPrefs::program(), 0);
    vm.heap.dec_ref_nil(v);
    vm.output.push_str(&sd);
    vm.output.push('\n');
    vm.push(Value::nil());
    Ok(())
}

/// Script-raised error; goes through the same unwind as runtime failures.
fn nf_error(vm: &mut Vm) -> VmResult<()> {
    let v = vm.pop();
    let mut sd = String::new();
    vm.value_to_string(&mut sd, v, None, &PrintPrefs::program(), 0);
    vm.heap.dec_ref_nil(v);
    Err(vm.error(quill_core::VmErrorKind::UserError, sd))
}

fn nf_thread_start(vm: &mut Vm) -> VmResult<()> {
    let n = vm.pop().ival();
    vm.start_workers(n)?;
    vm.push(Value::nil());
    Ok(())
}

fn nf_thread_write(vm: &mut Vm) -> VmResult<()> {
    let v = vm.pop();
    let r = vm.worker_write(v);
    vm.heap.dec_ref_nil(v);
    r?;
    vm.push(Value::nil());
    Ok(())
}

fn nf_thread_read(vm: &mut Vm) -> VmResult<()> {
    let tti = vm.pop().ival() as i32;
    let v = vm.worker_read(tti)?;
    vm.push(v);
    Ok(())
}

fn nf_set_max_stack_size(vm: &mut Vm) -> VmResult<()> {
    let n = vm.pop().ival();
    vm.maxstacksize = n as usize;
    vm.push(Value::nil());
    Ok(())
}

/// Frame tick. Inert here; graphics embedders install their own, and the
/// AOT translator emits a direct `GLFrame(sp, vm)` call for it.
fn nf_gl_frame(_vm: &mut Vm) -> VmResult<()> {
    Ok(())
}

/// True inside worker VMs; programs branch on this to pick their role.
fn nf_is_worker(vm: &mut Vm) -> VmResult<()> {
    let v = Value::int(vm.is_worker as i64);
    vm.push(v);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_indices() {
        let r = NativeRegistry::core();
        assert_eq!(r.lookup("print"), Some(0));
        assert_eq!(r.lookup("thread_read"), Some(4));
        assert!(r.get(r.lookup("gl_frame").unwrap()).unwrap().is_gl_frame);
        assert_eq!(r.lookup("no_such_fn"), None);
    }
}
