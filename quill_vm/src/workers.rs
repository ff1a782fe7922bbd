//! Workers and the tuple space.
//!
//! Workers are whole VM instances, one per OS thread, sharing exactly two
//! things with their parent: the immutable program image and the tuple
//! space. The space keeps one blocking FIFO queue per user-defined class;
//! `worker_write` copies a scalar-field class instance into an owned cell
//! buffer and wakes one reader, `worker_read` blocks until a tuple or
//! teardown. `terminate_workers` is the only cancellation: flip the alive
//! flag, wake everyone, join.

use crate::vm::{TraceMode, Vm, VmArgs, MAX_WORKERS};
use parking_lot::{Condvar, Mutex};
use quill_core::{Value, ValueType, VmErrorKind, VmResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One class's queue: writers append under the lock and signal one
/// waiter; readers wait under the lock and pop.
pub struct TupleQueue {
    queue: Mutex<VecDeque<Box<[Value]>>>,
    cond: Condvar,
}

pub struct TupleSpace {
    tuple_types: Vec<TupleQueue>,
    alive: AtomicBool,
}

impl TupleSpace {
    pub fn new(ntypes: usize) -> TupleSpace {
        TupleSpace {
            tuple_types: (0..ntypes)
                .map(|_| TupleQueue { queue: Mutex::new(VecDeque::new()), cond: Condvar::new() })
                .collect(),
            alive: AtomicBool::new(true),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

impl Vm {
    /// Spawn `numthreads` workers (capped), each evaluating the shared
    /// program from the top in its own VM.
    pub fn start_workers(&mut self, numthreads: i64) -> VmResult<()> {
        if self.is_worker {
            return Err(self.error(
                VmErrorKind::WorkerMisuse,
                "workers can't start more worker threads".to_owned(),
            ));
        }
        if self.tuple_space.is_some() {
            return Err(self.error(VmErrorKind::WorkerMisuse, "workers already running".to_owned()));
        }
        let numthreads = numthreads.min(MAX_WORKERS).max(0);
        let ts = Arc::new(TupleSpace::new(self.image.udts().len()));
        self.tuple_space = Some(ts.clone());
        for _ in 0..numthreads {
            let image = self.image.clone();
            let ts = ts.clone();
            // Workers own all their memory; only the image and the space
            // are shared. Trace is forced off, program args dropped.
            let args = VmArgs {
                program_args: Vec::new(),
                trace: TraceMode::Off,
                max_stack_size: self.args.max_stack_size,
                delete_delay: false,
            };
            self.workers.push(std::thread::spawn(move || {
                let mut vm = Vm::new(image, args);
                vm.is_worker = true;
                vm.tuple_space = Some(ts);
                match vm.eval_program() {
                    Ok(()) => None,
                    Err(e) => Some(e.message),
                }
            }));
        }
        Ok(())
    }

    /// Stop the tuple space and join every worker. Worker errors land in
    /// the parent's log sink. No-op on workers and when nothing runs.
    pub fn terminate_workers(&mut self) {
        if self.is_worker {
            return;
        }
        let Some(ts) = self.tuple_space.take() else { return };
        ts.alive.store(false, Ordering::Release);
        for tt in &ts.tuple_types {
            tt.cond.notify_all();
        }
        for w in self.workers.drain(..) {
            match w.join() {
                Ok(Some(err)) => self.log.push(format!("worker error: {err}")),
                Ok(None) => {}
                Err(_) => self.log.push("worker error: thread panicked".to_owned()),
            }
        }
    }

    /// Enqueue a class instance's fields for readers of that class.
    /// Only scalar fields are allowed; the cells are copied into an owned
    /// buffer, so the object itself stays with the caller.
    pub fn worker_write(&mut self, v: Value) -> VmResult<()> {
        let Some(ts) = self.tuple_space.clone() else { return Ok(()) };
        if v.is_nil() {
            return Err(self.error(VmErrorKind::TypeMismatch, "thread write: nil reference".to_owned()));
        }
        if v.tag() != ValueType::Class {
            return Err(self.error(VmErrorKind::TypeMismatch, "thread write: must be a class".to_owned()));
        }
        let image = self.image.clone();
        let tti = self.heap.header(v.refid()).tti;
        let ti = image.type_info(tti);
        for &et in image.elem_types(&ti) {
            if image.type_info(et).t.is_ref_nil() {
                return Err(self.error(
                    VmErrorKind::TypeMismatch,
                    "thread write: only scalar class members supported for now".to_owned(),
                ));
            }
        }
        let buf: Box<[Value]> = self.heap.obj_fields(v.refid()).into();
        let tt = &ts.tuple_types[ti.structidx as usize];
        tt.queue.lock().push_back(buf);
        tt.cond.notify_one();
        Ok(())
    }

    /// Block until a tuple of the given class arrives (returns a fresh
    /// instance) or the space is torn down (returns nil).
    pub fn worker_read(&mut self, tti: i32) -> VmResult<Value> {
        let image = self.image.clone();
        let ti = image.type_info(tti);
        if ti.t != ValueType::Class {
            let name = self.proper_type_name(&ti);
            return Err(self.error(
                VmErrorKind::TypeMismatch,
                format!("thread read: must be a class type, not {name}"),
            ));
        }
        let Some(ts) = self.tuple_space.clone() else { return Ok(Value::nil()) };
        let tt = &ts.tuple_types[ti.structidx as usize];
        let buf = {
            let mut q = tt.queue.lock();
            loop {
                if let Some(b) = q.pop_front() {
                    break Some(b);
                }
                if !ts.is_alive() {
                    break None;
                }
                tt.cond.wait(&mut q);
            }
        };
        match buf {
            Some(b) => {
                let id = self.heap.new_object(tti, b);
                Ok(Value::reference(id, ValueType::Class))
            }
            None => Ok(Value::nil()),
        }
    }
}
