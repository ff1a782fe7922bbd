//! The execution engine: dispatch loop, function entry/exit, stack
//! growth, control flow.
//!
//! Calls are direct for `CALL` and indirect through the VM's
//! next-call-target cell for `CALLV`/`DDCALL`; in both cases the engine
//! transfers to the callee's `FUNSTART`, whose entry protocol swaps
//! argument globals, saves defaults, and reserves keep slots. `RETURN`
//! and `RETURNANY` run the exit protocol in the exact reverse order:
//! keep-vars, owned-vars, defaults, arguments, then the return-value
//! slide onto the caller's stack.

use crate::ops;
use crate::vm::{StackFrame, TraceMode, Vm, STACK_MARGIN};
use quill_bytecode::{parse_op_and_get_arity, FunHeader, Opcode};
use quill_core::{Value, VmError, VmErrorKind, VmResult};

impl Vm {
    /// Enter the program at the target of the mandatory first `JUMP`.
    pub fn eval_program(&mut self) -> VmResult<()> {
        let start = self.image.starting_ip();
        self.run(start)
    }

    fn run(&mut self, mut ip: usize) -> VmResult<()> {
        let image = self.image.clone();
        let code = image.code();
        // Interpreter-only return addresses; the stack-frame list itself
        // carries no resume point (AOT output returns natively instead).
        let mut ret_ips: Vec<usize> = Vec::new();
        loop {
            let Some(p) = parse_op_and_get_arity(code, ip) else {
                return Err(self.serious_error(
                    VmErrorKind::InternalAssertion,
                    format!("instruction decode failed at {ip}"),
                ));
            };
            if self.trace != TraceMode::Off {
                self.trace_ins(p.op.name());
            }
            #[cfg(debug_assertions)]
            self.check_depth(&p);
            let args = &code[p.args.clone()];
            match p.op {
                Opcode::FunStart => {
                    self.fun_intro(code, p.args.start)?;
                    ip = p.next_ip;
                }
                Opcode::Jump => ip = args[0] as usize,
                Opcode::JumpFail => {
                    ops::u_jumpfail(self)?;
                    ip = if !self.pop().is_true() { args[0] as usize } else { p.next_ip };
                }
                Opcode::JumpNoFail => {
                    ops::u_jumpnofail(self)?;
                    ip = if !self.pop().is_true() { args[0] as usize } else { p.next_ip };
                }
                Opcode::JumpIfUnwound => {
                    ops::u_jumpifunwound(self, args[0])?;
                    ip = if !self.pop().is_true() { args[1] as usize } else { p.next_ip };
                }
                Opcode::BlockStart | Opcode::JumpTableCaseStart | Opcode::JumpTableEnd => {
                    ip = p.next_ip;
                }
                Opcode::JumpTable => {
                    let v = self.pop().ival();
                    let mini = args[0] as i64;
                    let maxi = args[1] as i64;
                    let target = if (mini..=maxi).contains(&v) {
                        args[2 + (v - mini) as usize]
                    } else {
                        args[args.len() - 1]
                    };
                    ip = target as usize;
                }
                Opcode::Call => {
                    ret_ips.push(p.next_ip);
                    ip = args[0] as usize;
                }
                Opcode::CallV => {
                    ops::u_callv(self)?;
                    ret_ips.push(p.next_ip);
                    ip = self.next_call_target;
                }
                Opcode::DdCall => {
                    ops::u_ddcall(self, args[0], args[1])?;
                    ret_ips.push(p.next_ip);
                    ip = self.next_call_target;
                }
                Opcode::PushFun => {
                    ops::u_pushfun(self, args[0])?;
                    ip = p.next_ip;
                }
                Opcode::Return => {
                    self.ret_unwind_to = args[0];
                    self.fun_out(code, args[1] as usize)?;
                    match ret_ips.pop() {
                        Some(r) => ip = r,
                        None => return Ok(()),
                    }
                }
                Opcode::ReturnAny => {
                    self.fun_out(code, args[0] as usize)?;
                    match ret_ips.pop() {
                        Some(r) => ip = r,
                        None => return Ok(()),
                    }
                }
                Opcode::SaveRets => {
                    // Modeled as RETURNANY with zero values.
                    self.fun_out(code, 0)?;
                    match ret_ips.pop() {
                        Some(r) => ip = r,
                        None => return Ok(()),
                    }
                }
                Opcode::KeepRef => {
                    self.keep_store(code, args[0] as usize, args[1] as usize, false)?;
                    ip = p.next_ip;
                }
                Opcode::KeepRefLoop => {
                    self.keep_store(code, args[0] as usize, args[1] as usize, true)?;
                    ip = p.next_ip;
                }
                Opcode::Bcall => {
                    ops::u_bcall(self, args[0])?;
                    ip = p.next_ip;
                }
                Opcode::Exit => {
                    ops::u_exit(self, args[0])?;
                    return Ok(());
                }
                Opcode::Abort => {
                    return Err(self.error(VmErrorKind::UserError, "program aborted".to_owned()));
                }
                _ => {
                    ops::dispatch_base(self, p.op, args)?;
                    ip = p.next_ip;
                }
            }
        }
    }

    /// Debug-build check that the stack depth matches the instruction's
    /// `regso` annotation. Skipped for the opcodes whose effect is not
    /// statically known, mirroring the AOT assert emitter.
    #[cfg(debug_assertions)]
    fn check_depth(&self, p: &quill_bytecode::ParsedOp) {
        if matches!(
            p.op,
            Opcode::SaveRets | Opcode::JumpIfUnwound | Opcode::ReturnAny | Opcode::FunStart
        ) {
            return;
        }
        if let Some(stf) = self.frames.last() {
            debug_assert_eq!(
                self.sp as i64,
                stf.spstart as i64 + p.regso as i64,
                "stack depth mismatch at {:?}",
                p.op
            );
        }
    }

    // -------------------------------------------------------------------------
    // Function entry
    // -------------------------------------------------------------------------

    /// Entry protocol. `header_at` is the code index of the header's
    /// `fid` word; the frame records it so exit and unwind can re-read
    /// everything.
    pub(crate) fn fun_intro(&mut self, code: &[i32], header_at: usize) -> VmResult<()> {
        self.frames.push(StackFrame { funstart: header_at, spstart: 0 });
        if self.sp > self.stacksize - STACK_MARGIN {
            // Per-call growth is bounded by the margin.
            if self.stacksize >= self.maxstacksize {
                return Err(self.serious_error(
                    VmErrorKind::StackOverflow,
                    "stack overflow! (use set_max_stack_size() if needed)".to_owned(),
                ));
            }
            self.stacksize *= 2;
            self.stack.resize(self.stacksize, Value::nil());
            self.log.push(format!("stack grew to: {}", self.stacksize));
        }
        let header = FunHeader::parse(code, header_at).ok_or_else(|| {
            VmError::internal(format!("unparsable function header at {header_at}"))
        })?;
        let nargs = header.nargs();
        for (i, &varidx) in code[header.args.clone()].iter().enumerate() {
            // The global takes the caller's argument; the previous global
            // value parks on the stack and is restored at exit.
            let slot = self.sp - nargs + i;
            std::mem::swap(&mut self.vars[varidx as usize], &mut self.stack[slot]);
        }
        for &varidx in &code[header.defs.clone()] {
            // For most locals this just saves a nil; in recursive calls it
            // holds the previous activation's value.
            let saved = self.vars[varidx as usize];
            self.push(saved);
            self.vars[varidx as usize] = Value::nil();
        }
        for _ in 0..header.nkeepvars {
            self.push(Value::nil());
        }
        let spstart = self.sp;
        self.frames.last_mut().expect("frame just pushed").spstart = spstart;
        if self.sp > self.maxsp {
            self.maxsp = self.sp;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Function exit
    // -------------------------------------------------------------------------

    /// Exit protocol with `nrets` values on top of the stack. Order:
    /// keep-vars popped and released, owned globals released, defaults
    /// then arguments popped back in reverse, frame discarded, return
    /// values slid onto the caller's stack.
    pub(crate) fn fun_out(&mut self, code: &[i32], nrets: usize) -> VmResult<()> {
        self.sp -= nrets;
        let rets_base = self.sp;
        let Some(&stf) = self.frames.last() else {
            return Err(self.serious_error(
                VmErrorKind::InternalAssertion,
                "return without a stack frame".to_owned(),
            ));
        };
        if self.sp != stf.spstart {
            return Err(self.serious_error(
                VmErrorKind::InternalAssertion,
                format!("unbalanced stack at return: {} != {}", self.sp, stf.spstart),
            ));
        }
        let header = FunHeader::parse(code, stf.funstart)
            .ok_or_else(|| VmError::internal("unparsable function header at return"))?;
        for _ in 0..header.nkeepvars {
            let v = self.pop();
            self.heap.dec_ref_nil(v);
        }
        for &varidx in &code[header.owned.clone()] {
            let v = self.vars[varidx as usize];
            self.heap.dec_ref_nil(v);
        }
        for &varidx in code[header.defs.clone()].iter().rev() {
            let v = self.pop();
            self.vars[varidx as usize] = v;
        }
        for &varidx in code[header.args.clone()].iter().rev() {
            let v = self.pop();
            self.vars[varidx as usize] = v;
        }
        self.frames.pop();
        self.stack.copy_within(rets_base..rets_base + nrets, self.sp);
        self.sp += nrets;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Keep slots
    // -------------------------------------------------------------------------

    /// `KEEPREF n k`: anchor `top_m(n)` in keep slot `k` of the current
    /// frame. Ownership transfers to the slot (released at exit); the
    /// LOOP variant first releases the previous occupant.
    fn keep_store(&mut self, code: &[i32], n: usize, k: usize, dec_prior: bool) -> VmResult<()> {
        let Some(&stf) = self.frames.last() else {
            return Err(self.serious_error(
                VmErrorKind::InternalAssertion,
                "keepref without a stack frame".to_owned(),
            ));
        };
        let header = FunHeader::parse(code, stf.funstart)
            .ok_or_else(|| VmError::internal("unparsable function header at keepref"))?;
        let slot = stf.spstart - header.nkeepvars as usize + k;
        if dec_prior {
            let prior = self.stack[slot];
            self.heap.dec_ref_nil(prior);
        }
        self.stack[slot] = self.top_m(n);
        Ok(())
    }
}
