//! The error/unwind path.
//!
//! Two entry points: `error` (recoverable; builds a stack trace with
//! variable dumps while unwinding the frame list) and `serious_error`
//! (the VM may be inconsistent; message only). Both funnel through
//! `error_base`, which contains recursive errors and flushes the TAIL
//! trace ring. The returned `VmError` is the tagged-result analogue of
//! the original single unwind point: the engine propagates it out of
//! `eval_program` with `?` and nothing in between holds an uncleaned
//! external resource.

use crate::vm::{TraceMode, Vm};
use quill_bytecode::FunHeader;
use quill_core::{PrintPrefs, RefId, Value, ValueType, VmError, VmErrorKind};

/// Variable dumps stop once the message reaches this size.
const ERRMSG_DUMP_CAP: usize = 10_000;

impl Vm {
    /// Common prefix of both error paths. Returns an error immediately
    /// for the recursive case (an error raised while reporting one) and
    /// for TAIL mode, where the ring replaces the stack trace.
    fn error_base(&mut self, kind: VmErrorKind, err: &str) -> Option<VmError> {
        if self.error_has_occured {
            // Raised while building a trace: contain it rather than abort.
            let msg = format!("{}\nRECURSIVE ERROR:\n{}", self.errmsg, err);
            return Some(VmError::new(kind, msg));
        }
        self.error_has_occured = true;
        if self.trace == TraceMode::Tail && !self.trace_output.is_empty() {
            for i in self.trace_ring_idx..self.trace_output.len() {
                let line = self.trace_output[i].clone();
                self.errmsg.push_str(&line);
            }
            for i in 0..self.trace_ring_idx {
                let line = self.trace_output[i].clone();
                self.errmsg.push_str(&line);
            }
            self.errmsg.push_str(err);
            return Some(VmError::new(kind, self.errmsg.clone()));
        }
        self.errmsg.push_str("VM error: ");
        self.errmsg.push_str(err);
        None
    }

    /// Recoverable error: assemble the trace, dumping each frame's def
    /// and arg variables, restoring globals and discarding frames as it
    /// unwinds.
    pub(crate) fn error(&mut self, kind: VmErrorKind, err: String) -> VmError {
        if let Some(e) = self.error_base(kind, &err) {
            return e;
        }
        let image = self.image.clone();
        let code = image.code();

        // Cells of the interrupted expression: raw hex, plus a rendering
        // when the payload happens to be a live handle. They are popped
        // without release (their types are unknowable here; leaks after
        // an error are accepted).
        while self.sp > 0
            && (self.frames.is_empty() || self.sp != self.frames.last().unwrap().spstart)
        {
            let v = self.top();
            self.errmsg.push_str("\n   stack: ");
            self.errmsg.push_str(&format!("{:#x}", v.any()));
            if v.is_ref() && self.heap.is_live(v.refid()) {
                let mut sd = String::new();
                self.ref_to_string(&mut sd, v.refid(), &PrintPrefs::debug(), 0);
                self.errmsg.push_str(", maybe: ");
                self.errmsg.push_str(&sd);
            }
            self.pop();
        }

        loop {
            let Some(&stf) = self.frames.last() else { break };
            let deffun = code[stf.funstart];
            if deffun >= 0 {
                self.errmsg.push_str("\nin function: ");
                self.errmsg.push_str(&image.functions()[deffun as usize].name);
            } else {
                self.errmsg.push_str("\nin block");
            }
            let Some(header) = FunHeader::parse(code, stf.funstart) else { break };
            if self.errmsg.len() < ERRMSG_DUMP_CAP {
                let mut sd = String::new();
                let defs = &code[header.defs.clone()];
                let mut j = 0;
                while j < defs.len() {
                    let i = defs[defs.len() - 1 - j];
                    j += self.dump_var(&mut sd, self.vars[i as usize], i);
                }
                let args = &code[header.args.clone()];
                let mut j = 0;
                while j < args.len() {
                    let i = args[args.len() - 1 - j];
                    j += self.dump_var(&mut sd, self.vars[i as usize], i);
                }
                self.errmsg.push_str(&sd);
            }
            self.sp -= header.nkeepvars as usize;
            for &varidx in code[header.defs.clone()].iter().rev() {
                let v = self.pop();
                self.vars[varidx as usize] = v;
            }
            for &varidx in code[header.args.clone()].iter().rev() {
                let v = self.pop();
                self.vars[varidx as usize] = v;
            }
            self.frames.pop();
            self.sp = self.frames.last().map_or(0, |f| f.spstart);
        }

        VmError::new(kind, self.errmsg.clone())
    }

    /// Serious error: the VM state may be inconsistent, so no variable
    /// dumping is attempted.
    pub(crate) fn serious_error(&mut self, kind: VmErrorKind, err: String) -> VmError {
        if let Some(e) = self.error_base(kind, &err) {
            return e;
        }
        VmError::new(kind, self.errmsg.clone())
    }

    /// Index failure with a rendering of the offending container.
    pub(crate) fn idx_err(&mut self, i: i64, n: i64, v: RefId) -> VmError {
        let mut sd = format!("index {} out of range {} of: ", i, n);
        self.ref_to_string(&mut sd, v, &PrintPrefs::debug(), 0);
        self.error(VmErrorKind::IndexOutOfRange, sd)
    }

    /// Dump one variable into the trace. Skips globally read-only lets
    /// and slots whose runtime tag does not match their static type
    /// (likely uninitialized). Returns the number of cells consumed
    /// (struct-typed variables span several).
    fn dump_var(&self, sd: &mut String, x: Value, idx: i32) -> usize {
        let sid = self.image.specidents()[idx as usize];
        let id = &self.image.idents()[sid.ididx as usize];
        if id.readonly && id.global {
            return 1;
        }
        let ti = self.image.var_type(idx);
        if ti.t != x.tag() {
            return 1;
        }
        sd.push_str("\n   ");
        sd.push_str(&id.name);
        sd.push_str(" = ");
        self.value_to_string(sd, x, Some(&ti), &PrintPrefs::debug(), 0);
        if ti.t == ValueType::StructValue {
            ti.len as usize
        } else {
            1
        }
    }
}
