//! The register interpreter: fetch/decode/dispatch, calls, argument
//! binding, exception unwinding, and non-local exits.
//!
//! The loop keeps three locals per activation — the running proc, its irep,
//! and the program counter — and re-derives the register base from the
//! current context on every access, so fiber switches performed by native
//! methods are picked up transparently. Raising is uniform: any opcode body
//! that fails turns its error into the pending exception, and the top of
//! the loop walks frames running ensure handlers until a rescue entry or a
//! host boundary is found.

use crate::args::Aspec;
use crate::callinfo::{ACC_DIRECT, ACC_RESUMED, ACC_SKIP};
use crate::context::{FiberStatus, RESCUE_STACK_MAX};
use crate::error::{VmError, VmResult};
use crate::irep::{Irep, PoolValue};
use crate::numeric::{self, ArithOp, CmpOp};
use crate::object::{ObjBody, ObjFlags};
use crate::opcode::{fetch, OpCode};
use crate::procs::{ProcBody, ProcScope, RProc};
use crate::symbol::Sym;
use crate::value::{Int, ObjId, Value, Vtype};
use crate::vm::{Vm, CALL_MAXARGS, ECALL_DEPTH_MAX};
use std::rc::Rc;

/// The interpreter's per-activation state.
pub(crate) struct Frame {
    pub proc: ObjId,
    pub irep: Rc<Irep>,
    pub pc: usize,
}

/// Outcome of one instruction.
enum Step {
    Next,
    /// `vm_exec` returns this value to its caller.
    Return(Value),
}

/// Outcome of unwinding a pending exception.
enum UnwindOut {
    /// Frame repositioned (rescue handler or break landing); keep going.
    Continue,
    Return(Value),
}

/// Which exit `RETURN`/`RETURN_BLK`/`BREAK` requested.
#[derive(Clone, Copy, PartialEq)]
enum RetKind {
    Normal,
    Block,
    Break,
}

impl Vm {
    /// Executes a bytecode proc starting at `pc` until it returns across
    /// the current host boundary.
    pub(crate) fn vm_exec(&mut self, p: ObjId, pc: usize) -> VmResult<Value> {
        let irep = self
            .proc_irep(p)
            .ok_or_else(|| VmError::script("cannot execute a native proc"))?;
        let mut fr = Frame { proc: p, irep, pc };
        self.dispatch(&mut fr)
    }

    fn dispatch(&mut self, fr: &mut Frame) -> VmResult<Value> {
        let ai = self.arena_save();
        loop {
            if self.exc.is_some() {
                match self.unwind(fr, ai) {
                    Ok(UnwindOut::Continue) => continue,
                    Ok(UnwindOut::Return(v)) => return Ok(v),
                    Err(e) => {
                        // crossing the host boundary; the error carries the
                        // exception value
                        self.exc = None;
                        return Err(e);
                    }
                }
            }
            let Some((op, o)) = fetch(&fr.irep.iseq, &mut fr.pc) else {
                self.exc_set_err(VmError::script("invalid or truncated bytecode"));
                continue;
            };
            match self.step(fr, op, o.a as usize, o.b as usize, o.c as usize, ai) {
                Ok(Step::Next) => {}
                Ok(Step::Return(v)) => return Ok(v),
                Err(e) => self.exc_set_err(e),
            }
        }
    }

    fn syms_at(&self, fr: &Frame, i: usize) -> VmResult<Sym> {
        fr.irep
            .syms
            .get(i)
            .copied()
            .ok_or_else(|| VmError::script("symbol index out of range"))
    }

    fn pool_at(&self, fr: &Frame, i: usize) -> VmResult<PoolValue> {
        fr.irep
            .pool
            .get(i)
            .cloned()
            .ok_or_else(|| VmError::script("pool index out of range"))
    }

    #[allow(clippy::too_many_lines)]
    fn step(
        &mut self,
        fr: &mut Frame,
        op: OpCode,
        a: usize,
        b: usize,
        c: usize,
        ai: usize,
    ) -> VmResult<Step> {
        match op {
            OpCode::NOP => {}
            OpCode::MOVE => {
                let v = self.reg(b);
                self.set_reg(a, v);
            }
            OpCode::LOADL => {
                let v = match self.pool_at(fr, b)? {
                    PoolValue::Fixnum(i) => Value::Fixnum(i),
                    PoolValue::Float(f) => Value::Float(f),
                    PoolValue::Str(s) => {
                        let o = self.str_new(&s)?;
                        self.heap.header_mut(o).flags |= ObjFlags::FROZEN;
                        Value::Obj(o)
                    }
                };
                self.set_reg(a, v);
            }
            OpCode::LOADI => self.set_reg(a, Value::Fixnum(b as Int)),
            OpCode::LOADINEG => self.set_reg(a, Value::Fixnum(-(b as Int))),
            OpCode::LOADI_M1
            | OpCode::LOADI_0
            | OpCode::LOADI_1
            | OpCode::LOADI_2
            | OpCode::LOADI_3
            | OpCode::LOADI_4
            | OpCode::LOADI_5
            | OpCode::LOADI_6
            | OpCode::LOADI_7 => {
                let v = op as Int - OpCode::LOADI_0 as Int;
                self.set_reg(a, Value::Fixnum(v));
            }
            OpCode::LOADSYM => {
                let sym = self.syms_at(fr, b)?;
                self.set_reg(a, Value::Symbol(sym));
            }
            OpCode::LOADNIL => self.set_reg(a, Value::Nil),
            OpCode::LOADSELF => {
                let v = self.reg(0);
                self.set_reg(a, v);
            }
            OpCode::LOADT => self.set_reg(a, Value::True),
            OpCode::LOADF => self.set_reg(a, Value::False),

            OpCode::GETGV => {
                let sym = self.syms_at(fr, b)?;
                let v = self.globals.get(&sym).copied().unwrap_or(Value::Nil);
                self.set_reg(a, v);
            }
            OpCode::SETGV => {
                let sym = self.syms_at(fr, b)?;
                let v = self.reg(a);
                self.globals.insert(sym, v);
            }
            OpCode::GETSV => {
                let v = self.specials.get(b).copied().unwrap_or(Value::Nil);
                self.set_reg(a, v);
            }
            OpCode::SETSV => {
                if self.specials.len() <= b {
                    self.specials.resize(b + 1, Value::Nil);
                }
                self.specials[b] = self.reg(a);
            }
            OpCode::GETIV => {
                let sym = self.syms_at(fr, b)?;
                let v = self.iv_get(self.reg(0), sym);
                self.set_reg(a, v);
            }
            OpCode::SETIV => {
                let sym = self.syms_at(fr, b)?;
                let v = self.reg(a);
                let recv = self.reg(0);
                self.iv_set(recv, sym, v)?;
            }
            OpCode::GETCV => {
                let sym = self.syms_at(fr, b)?;
                let v = self.vm_cv_get(sym)?;
                self.set_reg(a, v);
            }
            OpCode::SETCV => {
                let sym = self.syms_at(fr, b)?;
                let v = self.reg(a);
                self.vm_cv_set(sym, v)?;
            }
            OpCode::GETCONST => {
                let sym = self.syms_at(fr, b)?;
                let v = self.vm_const_get(sym)?;
                self.set_reg(a, v);
            }
            OpCode::SETCONST => {
                let sym = self.syms_at(fr, b)?;
                let v = self.reg(a);
                self.vm_const_set(sym, v)?;
            }
            OpCode::GETMCNST => {
                let sym = self.syms_at(fr, b)?;
                let cls = self
                    .reg(a)
                    .obj()
                    .ok_or_else(|| VmError::type_error("class or module required"))?;
                let v = self.const_get(cls, sym)?;
                self.set_reg(a, v);
            }
            OpCode::SETMCNST => {
                let sym = self.syms_at(fr, b)?;
                let cls = self
                    .reg(a + 1)
                    .obj()
                    .ok_or_else(|| VmError::type_error("class or module required"))?;
                let v = self.reg(a);
                self.const_set(cls, sym, v)?;
            }

            OpCode::GETUPVAR => {
                let v = match self.uvenv(c) {
                    Some(e) => self.env_get(e, b),
                    None => Value::Nil,
                };
                self.set_reg(a, v);
            }
            OpCode::SETUPVAR => {
                if let Some(e) = self.uvenv(c) {
                    let v = self.reg(a);
                    self.env_set(e, b, v);
                }
            }

            OpCode::JMP => fr.pc = a,
            OpCode::JMPIF => {
                if self.reg(a).truthy() {
                    fr.pc = b;
                }
            }
            OpCode::JMPNOT => {
                if !self.reg(a).truthy() {
                    fr.pc = b;
                }
            }
            OpCode::JMPNIL => {
                if self.reg(a).is_nil() {
                    fr.pc = b;
                }
            }

            OpCode::ONERR => {
                let ridx = self.ctx().ci().ridx;
                if ridx >= RESCUE_STACK_MAX {
                    return Err(VmError::runtime("too many nested rescues"));
                }
                let ctx = self.ctx_mut();
                ctx.rescue.truncate(ridx);
                ctx.rescue.push(a as u32);
                ctx.ci_mut().ridx = ridx + 1;
            }
            OpCode::EXCEPT => {
                let v = self.caught.take().map(Value::Obj).unwrap_or(Value::Nil);
                self.set_reg(a, v);
            }
            OpCode::RESCUE => {
                let exc = self.reg(a);
                let filter = self.reg(b);
                let cls = match filter {
                    Value::Obj(o)
                        if matches!(self.heap.header(o).tt, Vtype::Class | Vtype::Module) =>
                    {
                        o
                    }
                    _ => {
                        return Err(VmError::type_error(
                            "class or module required for rescue clause",
                        ))
                    }
                };
                let matched = self.obj_is_kind_of(exc, cls);
                self.set_reg(b, Value::from_bool(matched));
            }
            OpCode::POPERR => {
                let ci = self.ctx_mut().ci_mut();
                ci.ridx = ci.ridx.saturating_sub(a);
            }
            OpCode::RAISE => {
                return Err(VmError::raise(self.reg(a)));
            }
            OpCode::EPUSH => {
                let child = fr
                    .irep
                    .reps
                    .get(a)
                    .cloned()
                    .ok_or_else(|| VmError::script("irep index out of range"))?;
                if self.ctx().eidx() >= RESCUE_STACK_MAX {
                    return Err(VmError::runtime("too many nested ensures"));
                }
                let p = self.closure_new(child)?;
                self.ctx_mut().ensure.push(Some(p));
                self.arena_restore(ai);
            }
            OpCode::EPOP => return self.op_epop(fr, a),

            OpCode::SENDV => {
                let mid = self.syms_at(fr, b)?;
                self.set_reg(a + 2, Value::Nil);
                return self.op_send(fr, a, mid, -1, ai);
            }
            OpCode::SENDVB => {
                let mid = self.syms_at(fr, b)?;
                return self.op_send(fr, a, mid, -1, ai);
            }
            OpCode::SEND => {
                let mid = self.syms_at(fr, b)?;
                let argc = if c == CALL_MAXARGS { -1 } else { c as i32 };
                let bidx = if argc < 0 { a + 2 } else { a + c + 1 };
                self.set_reg(bidx, Value::Nil);
                return self.op_send(fr, a, mid, argc, ai);
            }
            OpCode::SENDB => {
                let mid = self.syms_at(fr, b)?;
                let argc = if c == CALL_MAXARGS { -1 } else { c as i32 };
                return self.op_send(fr, a, mid, argc, ai);
            }
            OpCode::CALL => return self.op_call(fr, ai),
            OpCode::SUPER => return self.op_super(fr, a, b, ai),
            OpCode::ARGARY => return self.op_argary(a, b),
            OpCode::ENTER => return self.op_enter(fr, Aspec(a as u32)),
            OpCode::KARG => {
                let k = Value::Symbol(self.syms_at(fr, b)?);
                let kdict = self.reg(self.ctx().ci().argc.max(0) as usize);
                let h = match kdict {
                    Value::Obj(o) if matches!(self.heap.body(o), ObjBody::Hash(_)) => o,
                    _ => {
                        return Err(VmError::argument(format!(
                            "missing keyword: {}",
                            self.value_inspect(k)
                        )))
                    }
                };
                if !self.hash_key_p(h, k) {
                    return Err(VmError::argument(format!(
                        "missing keyword: {}",
                        match k {
                            Value::Symbol(s) => self.symbols.name(s).to_string(),
                            _ => self.value_inspect(k),
                        }
                    )));
                }
                let v = self.hash_get(h, k)?;
                self.set_reg(a, v);
                self.hash_delete_key(h, k)?;
            }
            OpCode::KEY_P => {
                let k = Value::Symbol(self.syms_at(fr, b)?);
                let kdict = self.reg(self.ctx().ci().argc.max(0) as usize);
                let p = match kdict {
                    Value::Obj(o) => self.hash_key_p(o, k),
                    _ => false,
                };
                self.set_reg(a, Value::from_bool(p));
            }
            OpCode::KEYEND => {
                let kdict = self.reg(self.ctx().ci().argc.max(0) as usize);
                if let Value::Obj(o) = kdict {
                    if matches!(self.heap.body(o), ObjBody::Hash(_)) && !self.hash_empty_p(o) {
                        let keys = self.hash_keys(o)?;
                        let name = match keys[0] {
                            Value::Symbol(s) => self.symbols.name(s).to_string(),
                            other => self.value_inspect(other),
                        };
                        return Err(VmError::argument(format!("unknown keyword: {name}")));
                    }
                }
            }

            OpCode::RETURN => return self.do_return(fr, a, RetKind::Normal, ai),
            OpCode::RETURN_BLK => return self.do_return(fr, a, RetKind::Block, ai),
            OpCode::BREAK => return self.do_return(fr, a, RetKind::Break, ai),
            OpCode::BLKPUSH => return self.op_blkpush(a, b),

            OpCode::ADD => return self.op_arith(fr, a, ArithOp::Add, ai),
            OpCode::SUB => return self.op_arith(fr, a, ArithOp::Sub, ai),
            OpCode::MUL => return self.op_arith(fr, a, ArithOp::Mul, ai),
            OpCode::DIV => {
                let x = self.reg(a);
                let y = self.reg(a + 1);
                match numeric::div(x, y) {
                    Some(v) => self.set_reg(a, v),
                    None => return self.op_opsend(fr, a, "/", ai),
                }
            }
            OpCode::ADDI => return self.op_arith_imm(fr, a, b, ArithOp::Add, ai),
            OpCode::SUBI => return self.op_arith_imm(fr, a, b, ArithOp::Sub, ai),
            OpCode::EQ => {
                let x = self.reg(a);
                let y = self.reg(a + 1);
                if self.obj_eq(x, y) {
                    self.set_reg(a, Value::True);
                } else {
                    match numeric::compare(CmpOp::Eq, x, y) {
                        Some(r) => self.set_reg(a, Value::from_bool(r)),
                        None => return self.op_opsend(fr, a, "==", ai),
                    }
                }
            }
            OpCode::LT => return self.op_cmp(fr, a, CmpOp::Lt, ai),
            OpCode::LE => return self.op_cmp(fr, a, CmpOp::Le, ai),
            OpCode::GT => return self.op_cmp(fr, a, CmpOp::Gt, ai),
            OpCode::GE => return self.op_cmp(fr, a, CmpOp::Ge, ai),

            OpCode::ARRAY => {
                let items: Vec<Value> = (0..b).map(|i| self.reg(a + i)).collect();
                let o = self.ary_new_from(items)?;
                self.set_reg(a, Value::Obj(o));
                self.arena_restore(ai);
            }
            OpCode::ARRAY2 => {
                let items: Vec<Value> = (0..c).map(|i| self.reg(b + i)).collect();
                let o = self.ary_new_from(items)?;
                self.set_reg(a, Value::Obj(o));
                self.arena_restore(ai);
            }
            OpCode::ARYCAT => {
                let dst = self.ary_ref_obj(self.reg(a))?;
                let src = self.reg(a + 1);
                self.ary_concat(dst, src)?;
                self.arena_restore(ai);
            }
            OpCode::ARYPUSH => {
                let dst = self.ary_ref_obj(self.reg(a))?;
                let v = self.reg(a + 1);
                self.ary_push(dst, v)?;
            }
            OpCode::ARYDUP => {
                let o = self.ary_dup(self.reg(a))?;
                self.set_reg(a, Value::Obj(o));
            }
            OpCode::AREF => {
                let v = self.reg(b);
                match v {
                    Value::Obj(o) if self.is_array(v) => {
                        let item = self.ary_get(o, c);
                        self.set_reg(a, item);
                    }
                    _ => {
                        if c == 0 {
                            self.set_reg(a, v);
                        } else {
                            self.set_reg(a, Value::Nil);
                        }
                    }
                }
            }
            OpCode::ASET => {
                let dst = self.ary_ref_obj(self.reg(b))?;
                let v = self.reg(a);
                self.ary_set(dst, c, v)?;
            }
            OpCode::APOST => return self.op_apost(fr, a, b, c, ai),

            OpCode::INTERN => {
                let sym = self.str_intern(self.reg(a))?;
                self.set_reg(a, Value::Symbol(sym));
                self.arena_restore(ai);
            }
            OpCode::STRING => {
                let s = match self.pool_at(fr, b)? {
                    PoolValue::Str(s) => s,
                    _ => return Err(VmError::script("string literal expected in pool")),
                };
                let o = self.str_new(&s)?;
                self.set_reg(a, Value::Obj(o));
                self.arena_restore(ai);
            }
            OpCode::STRCAT => {
                let recv = self.reg(a);
                let other = self.reg(a + 1);
                self.str_concat(recv, other)?;
            }

            OpCode::HASH => {
                let h = self.hash_new()?;
                for i in 0..b {
                    let k = self.reg(a + i * 2);
                    let v = self.reg(a + i * 2 + 1);
                    self.hash_set(h, k, v)?;
                }
                self.set_reg(a, Value::Obj(h));
                self.arena_restore(ai);
            }
            OpCode::HASHADD => {
                let h = self.ensure_hash(self.reg(a))?;
                for i in 0..b {
                    let k = self.reg(a + 1 + i * 2);
                    let v = self.reg(a + 1 + i * 2 + 1);
                    self.hash_set(h, k, v)?;
                }
                self.arena_restore(ai);
            }
            OpCode::HASHCAT => {
                let h = self.ensure_hash(self.reg(a))?;
                let other = self.reg(a + 1);
                self.hash_merge(h, other)?;
                self.arena_restore(ai);
            }

            OpCode::LAMBDA => {
                let child = self.child_irep(fr, b)?;
                let p = self.closure_new(child)?;
                self.proc_set_flag(p, ObjFlags::PROC_STRICT);
                self.set_reg(a, Value::Obj(p));
                self.arena_restore(ai);
            }
            OpCode::BLOCK => {
                let child = self.child_irep(fr, b)?;
                let p = self.closure_new(child)?;
                self.set_reg(a, Value::Obj(p));
                self.arena_restore(ai);
            }
            OpCode::METHOD => {
                let child = self.child_irep(fr, b)?;
                let p = self.proc_new(child)?;
                self.proc_set_flag(p, ObjFlags::PROC_SCOPE | ObjFlags::PROC_STRICT);
                self.set_reg(a, Value::Obj(p));
                self.arena_restore(ai);
            }

            OpCode::RANGE_INC => {
                let o = self.range_new(self.reg(a), self.reg(a + 1), false)?;
                self.set_reg(a, Value::Obj(o));
                self.arena_restore(ai);
            }
            OpCode::RANGE_EXC => {
                let o = self.range_new(self.reg(a), self.reg(a + 1), true)?;
                self.set_reg(a, Value::Obj(o));
                self.arena_restore(ai);
            }

            OpCode::OCLASS => {
                let oc = self.object_class;
                self.set_reg(a, Value::Obj(oc));
            }
            OpCode::CLASS => {
                let id = self.syms_at(fr, b)?;
                let base = match self.reg(a) {
                    Value::Nil => self
                        .ctx()
                        .ci()
                        .proc
                        .and_then(|p| self.proc_target_class(p))
                        .unwrap_or(self.object_class),
                    Value::Obj(o) => o,
                    _ => return Err(VmError::type_error("class definition in non-class")),
                };
                let sup = self.reg(a + 1);
                let cls = self.vm_define_class(base, sup, id)?;
                self.set_reg(a, Value::Obj(cls));
                self.arena_restore(ai);
            }
            OpCode::MODULE => {
                let id = self.syms_at(fr, b)?;
                let base = match self.reg(a) {
                    Value::Nil => self
                        .ctx()
                        .ci()
                        .proc
                        .and_then(|p| self.proc_target_class(p))
                        .unwrap_or(self.object_class),
                    Value::Obj(o) => o,
                    _ => return Err(VmError::type_error("module definition in non-class")),
                };
                let m = self.vm_define_module(base, id)?;
                self.set_reg(a, Value::Obj(m));
                self.arena_restore(ai);
            }
            OpCode::EXEC => return self.op_exec(fr, a, b),
            OpCode::DEF => {
                let target = match self.reg(a) {
                    Value::Obj(o)
                        if matches!(
                            self.heap.header(o).tt,
                            Vtype::Class | Vtype::Module | Vtype::SClass
                        ) =>
                    {
                        o
                    }
                    _ => return Err(VmError::type_error("method definition in non-class")),
                };
                let p = match self.reg(a + 1) {
                    Value::Obj(o) if self.heap.header(o).tt == Vtype::Proc => o,
                    _ => return Err(VmError::type_error("method body must be a proc")),
                };
                let mid = self.syms_at(fr, b)?;
                self.define_method_raw(target, mid, crate::class::Method::Proc(p));
                self.arena_restore(ai);
            }
            OpCode::ALIAS => {
                let tc = self.check_target_class()?;
                let new = self.syms_at(fr, a)?;
                let old = self.syms_at(fr, b)?;
                self.alias_method(tc, new, old)?;
            }
            OpCode::UNDEF => {
                let tc = self.check_target_class()?;
                let mid = self.syms_at(fr, a)?;
                self.undef_method(tc, mid);
            }
            OpCode::SCLASS => {
                let sc = self.singleton_class(self.reg(a))?;
                self.set_reg(a, Value::Obj(sc));
                self.arena_restore(ai);
            }
            OpCode::TCLASS => {
                let tc = self.check_target_class()?;
                self.set_reg(a, Value::Obj(tc));
            }

            OpCode::DEBUG => {
                log::debug!("DEBUG {a} {b} {c}");
            }
            OpCode::ERR => {
                let msg = match self.pool_at(fr, a)? {
                    PoolValue::Str(s) => s,
                    _ => "localjump".to_string(),
                };
                return Err(VmError::local_jump(msg));
            }
            OpCode::STOP => {
                let v = self.stop_run(fr)?;
                return Ok(Step::Return(v));
            }

            // resolved inside fetch
            OpCode::EXT1 | OpCode::EXT2 | OpCode::EXT3 => {}
        }
        Ok(Step::Next)
    }

    fn child_irep(&self, fr: &Frame, i: usize) -> VmResult<Rc<Irep>> {
        fr.irep
            .reps
            .get(i)
            .cloned()
            .ok_or_else(|| VmError::script("irep index out of range"))
    }

    fn check_target_class(&mut self) -> VmResult<ObjId> {
        self.ctx()
            .ci()
            .target_class
            .ok_or_else(|| VmError::type_error("no target class or module"))
    }

    // ---- arithmetic fast paths ----

    fn op_arith(&mut self, fr: &mut Frame, a: usize, op: ArithOp, ai: usize) -> VmResult<Step> {
        let x = self.reg(a);
        let y = self.reg(a + 1);
        if let Some(v) = numeric::arith(op, x, y) {
            self.set_reg(a, v);
            return Ok(Step::Next);
        }
        if op == ArithOp::Add
            && self.vtype(x) == Vtype::String
            && self.vtype(y) == Vtype::String
        {
            let v = self.str_plus(x, y)?;
            self.set_reg(a, v);
            self.arena_restore(ai);
            return Ok(Step::Next);
        }
        self.op_opsend(fr, a, op.name(), ai)
    }

    fn op_arith_imm(
        &mut self,
        fr: &mut Frame,
        a: usize,
        b: usize,
        op: ArithOp,
        ai: usize,
    ) -> VmResult<Step> {
        let x = self.reg(a);
        match x {
            Value::Fixnum(_) | Value::Float(_) => {
                let v = numeric::arith(op, x, Value::Fixnum(b as Int))
                    .expect("numeric immediate arithmetic");
                self.set_reg(a, v);
                Ok(Step::Next)
            }
            _ => {
                self.set_reg(a + 1, Value::Fixnum(b as Int));
                self.op_opsend(fr, a, op.name(), ai)
            }
        }
    }

    fn op_cmp(&mut self, fr: &mut Frame, a: usize, op: CmpOp, ai: usize) -> VmResult<Step> {
        let x = self.reg(a);
        let y = self.reg(a + 1);
        match numeric::compare(op, x, y) {
            Some(r) => {
                self.set_reg(a, Value::from_bool(r));
                Ok(Step::Next)
            }
            None => self.op_opsend(fr, a, op.name(), ai),
        }
    }

    /// Falls back from an operator fast path to a real dispatch of the
    /// operator method with one argument.
    fn op_opsend(&mut self, fr: &mut Frame, a: usize, name: &str, ai: usize) -> VmResult<Step> {
        let mid = self.intern(name);
        self.set_reg(a + 2, Value::Nil);
        self.op_send(fr, a, mid, 1, ai)
    }

    // ---- send ----

    fn op_send(
        &mut self,
        fr: &mut Frame,
        a: usize,
        mid: Sym,
        argc_in: i32,
        ai: usize,
    ) -> VmResult<Step> {
        let bidx = if argc_in < 0 {
            a + 2
        } else {
            a + argc_in as usize + 1
        };
        let recv = self.reg(a);
        let mut blk = self.reg(bidx);
        if !blk.is_nil() && self.vtype(blk) != Vtype::Proc {
            blk = self.convert_to_proc(blk)?;
            // the stack may have been reallocated during to_proc
            self.set_reg(bidx, blk);
        }
        let cls = self.class_of(recv);
        let mut mid = mid;
        let mut argc = argc_in;
        let (node, m) = match self.method_search_vm(cls, mid) {
            Some(found) => found,
            None => {
                let missing = self.intern("method_missing");
                let recursing =
                    self.ctx().ci().mid == Some(missing) && self.obj_eq(self.reg(0), recv);
                match self.method_search_vm(cls, missing) {
                    Some(found) if !recursing => {
                        if argc >= 0 {
                            if a + 2 >= fr.irep.nregs as usize {
                                self.stack_extend(a + 3)?;
                            }
                            let items: Vec<Value> =
                                (0..argc as usize).map(|i| self.reg(a + 1 + i)).collect();
                            let ary = self.ary_new_from(items)?;
                            self.set_reg(a + 1, Value::Obj(ary));
                            self.set_reg(a + 2, blk);
                            argc = -1;
                        }
                        let packed = self
                            .reg(a + 1)
                            .obj()
                            .ok_or_else(|| VmError::argument("bad argument pack"))?;
                        self.ary_unshift(packed, Value::Symbol(mid))?;
                        mid = missing;
                        found
                    }
                    _ => return Err(self.nomethod_error(mid, recv)),
                }
            }
        };

        self.cipush();
        let caller_base = self.ctx().stack_base;
        {
            let ci = self.ctx_mut().ci_mut();
            ci.mid = Some(mid);
            ci.stackent = caller_base;
            ci.target_class = Some(node);
            ci.argc = argc;
            ci.pc = Some(fr.pc);
            ci.acc = a as i32;
        }
        self.ctx_mut().stack_base = caller_base + a;

        let native = match m {
            crate::class::Method::Native(f) => Some((f, None)),
            crate::class::Method::Proc(p) if self.proc_has_flag(p, ObjFlags::PROC_CFUNC) => {
                Some((self.proc_native(p).expect("cfunc proc"), Some(p)))
            }
            _ => None,
        };
        if let Some((f, proc_id)) = native {
            if let Some(p) = proc_id {
                self.ctx_mut().ci_mut().proc = Some(p);
            }
            let r = f(self, recv);
            self.arena_restore(ai);
            let v = r?;
            if let Some(e) = self.exc.take() {
                return Err(VmError::raise(Value::Obj(e)));
            }
            self.cfunc_return(fr, v, blk)
        } else {
            let p = match m {
                crate::class::Method::Proc(p) => p,
                _ => return Err(self.nomethod_error(mid, recv)),
            };
            self.ctx_mut().ci_mut().proc = Some(p);
            fr.proc = p;
            fr.irep = self
                .proc_irep(p)
                .ok_or_else(|| VmError::script("method proc without irep"))?;
            let nregs = fr.irep.nregs as usize;
            self.stack_extend(if argc < 0 && nregs < 3 { 3 } else { nregs })?;
            fr.pc = 0;
            Ok(Step::Next)
        }
    }

    /// The common path after a native method returns: marks an orphaned
    /// block, recognizes a fiber switch (the context-modify marker), places
    /// the value, and restores the caller frame.
    fn cfunc_return(&mut self, fr: &mut Frame, v: Value, blk: Value) -> VmResult<Step> {
        // a non-strict block whose defining frame is returning becomes an
        // orphan; breaking through it later must raise
        if let Value::Obj(pb) = blk {
            if self.heap.header(pb).tt == Vtype::Proc
                && !self.proc_has_flag(pb, ObjFlags::PROC_STRICT)
            {
                let ci_len = self.ctx().ci.len();
                if ci_len >= 2 {
                    let below_env = self.ctx().ci[ci_len - 2].env;
                    if below_env.is_some() && self.proc_env(pb) == below_env {
                        self.proc_set_flag(pb, ObjFlags::PROC_ORPHAN);
                    }
                }
            }
        }
        let ci = self.ctx().ci().clone();
        if ci.target_class.is_none() {
            // return from a context-modifying method (fiber resume/yield)
            if ci.acc == ACC_RESUMED {
                return Ok(Step::Return(v));
            }
            let len = self.ctx().ci.len();
            let below = self.ctx().ci[len - 2]
                .proc
                .ok_or_else(|| VmError::script("context switch into a frame without a proc"))?;
            fr.proc = below;
            fr.irep = self
                .proc_irep(below)
                .ok_or_else(|| VmError::script("context switch into a native frame"))?;
        }
        // the callee frame's register 0 is the caller's accept slot
        {
            let base = self.ctx().stack_base;
            let ctx = self.ctx_mut();
            if base < ctx.stack.len() {
                ctx.stack[base] = v;
            }
        }
        let ci = self.ctx().ci().clone();
        self.ctx_mut().stack_base = ci.stackent;
        if let Some(pc) = ci.pc {
            fr.pc = pc;
        }
        self.cipop();
        Ok(Step::Next)
    }

    // ---- proc invocation (OP_CALL) ----

    fn op_call(&mut self, fr: &mut Frame, ai: usize) -> VmResult<Step> {
        let recv = self.reg(0);
        let m = match recv {
            Value::Obj(o) if self.heap.header(o).tt == Vtype::Proc => o,
            _ => return Err(VmError::type_error("can't call a non-proc")),
        };
        // replace the callinfo pushed by the `call` dispatch
        let tc = self.proc_target_class(m);
        {
            let ci = self.ctx_mut().ci_mut();
            ci.target_class = tc;
            ci.proc = Some(m);
        }
        if let Some(e) = self.proc_env(m) {
            let mid = match self.heap.body(e) {
                ObjBody::Env(env) => env.mid,
                _ => None,
            };
            if mid.is_some() {
                self.ctx_mut().ci_mut().mid = mid;
            }
        }
        if self.proc_has_flag(m, ObjFlags::PROC_CFUNC) {
            let f = self.proc_native(m).expect("cfunc proc");
            let r = f(self, recv);
            self.arena_restore(ai);
            let v = r?;
            if let Some(e) = self.exc.take() {
                return Err(VmError::raise(Value::Obj(e)));
            }
            let ci = self.ctx().ci().clone();
            self.ctx_mut().stack_base = ci.stackent;
            if ci.acc >= 0 {
                self.set_reg(ci.acc as usize, v);
            }
            if let Some(pc) = ci.pc {
                fr.pc = pc;
            }
            self.cipop();
            fr.proc = self
                .ctx()
                .ci()
                .proc
                .ok_or_else(|| VmError::script("caller frame without a proc"))?;
            fr.irep = self
                .proc_irep(fr.proc)
                .ok_or_else(|| VmError::script("caller frame without an irep"))?;
            Ok(Step::Next)
        } else {
            fr.proc = m;
            fr.irep = match self.proc_irep(m) {
                Some(i) => i,
                None => {
                    self.set_reg(0, Value::Nil);
                    return self.do_return(fr, 0, RetKind::Normal, ai);
                }
            };
            let nregs = fr.irep.nregs as usize;
            self.stack_extend(nregs)?;
            let argc = self.ctx().ci().argc;
            let clear_from = if argc < 0 { 3 } else { argc as usize + 2 };
            for i in clear_from..nregs {
                self.set_reg(i, Value::Nil);
            }
            if let Some(e) = self.proc_env(m) {
                let self_val = self.env_get(e, 0);
                self.set_reg(0, self_val);
            }
            fr.pc = 0;
            Ok(Step::Next)
        }
    }

    // ---- super ----

    fn op_super(&mut self, fr: &mut Frame, a: usize, b: usize, ai: usize) -> VmResult<Step> {
        let argc_in: i32 = if b == CALL_MAXARGS { -1 } else { b as i32 };
        let bidx = if argc_in < 0 { a + 2 } else { a + b + 1 };
        let (mid, cur_target) = {
            let ci = self.ctx().ci();
            (ci.mid, ci.target_class)
        };
        let mid = mid.ok_or_else(|| VmError::no_method("super called outside of method"))?;
        let mut target_class = self
            .ctx()
            .ci()
            .proc
            .and_then(|p| self.proc_target_class(p))
            .ok_or_else(|| VmError::no_method("super called outside of method"))?;
        if self.heap.header(target_class).tt == Vtype::Module {
            target_class = cur_target
                .filter(|t| self.heap.header(*t).tt == Vtype::IClass)
                .ok_or_else(|| VmError::runtime("superclass info lost"))?;
        }
        let recv = self.reg(0);
        if !self.obj_is_kind_of(recv, self.real_class(target_class)) {
            return Err(VmError::type_error(
                "self has wrong type to call super in this context",
            ));
        }
        let mut blk = self.reg(bidx);
        if !blk.is_nil() && self.vtype(blk) != Vtype::Proc {
            blk = self.convert_to_proc(blk)?;
            self.set_reg(bidx, blk);
        }
        let start = self
            .node_super(target_class)
            .unwrap_or(self.object_class);
        let mut argc = argc_in;
        let mut call_mid = mid;
        let (node, m) = match self.method_search_vm(start, mid) {
            Some(found) => found,
            None => {
                let missing = self.intern("method_missing");
                let search_cls = if mid != missing {
                    self.class_of(recv)
                } else {
                    start
                };
                match self.method_search_vm(search_cls, missing) {
                    None => return Err(self.nomethod_error(mid, recv)),
                    Some(found) => {
                        if argc >= 0 {
                            if a + 2 >= fr.irep.nregs as usize {
                                self.stack_extend(a + 3)?;
                            }
                            let items: Vec<Value> =
                                (0..b).map(|i| self.reg(a + 1 + i)).collect();
                            let ary = self.ary_new_from(items)?;
                            self.set_reg(a + 1, Value::Obj(ary));
                            self.set_reg(a + 2, blk);
                            argc = -1;
                        }
                        let packed = self
                            .reg(a + 1)
                            .obj()
                            .ok_or_else(|| VmError::argument("bad argument pack"))?;
                        self.ary_unshift(packed, Value::Symbol(mid))?;
                        call_mid = missing;
                        found
                    }
                }
            }
        };

        self.cipush();
        let caller_base = self.ctx().stack_base;
        {
            let ci = self.ctx_mut().ci_mut();
            ci.mid = Some(call_mid);
            ci.stackent = caller_base;
            ci.target_class = Some(node);
            ci.argc = argc;
            ci.pc = Some(fr.pc);
            ci.acc = a as i32;
        }
        self.ctx_mut().stack_base = caller_base + a;
        self.set_reg(0, recv);

        let native = match m {
            crate::class::Method::Native(f) => Some((f, None)),
            crate::class::Method::Proc(p) if self.proc_has_flag(p, ObjFlags::PROC_CFUNC) => {
                Some((self.proc_native(p).expect("cfunc proc"), Some(p)))
            }
            _ => None,
        };
        if let Some((f, proc_id)) = native {
            if let Some(p) = proc_id {
                self.ctx_mut().ci_mut().proc = Some(p);
            }
            let r = f(self, recv);
            self.arena_restore(ai);
            let v = r?;
            if let Some(e) = self.exc.take() {
                return Err(VmError::raise(Value::Obj(e)));
            }
            self.cfunc_return(fr, v, blk)
        } else {
            let p = match m {
                crate::class::Method::Proc(p) => p,
                _ => return Err(self.nomethod_error(mid, recv)),
            };
            self.ctx_mut().ci_mut().proc = Some(p);
            fr.proc = p;
            fr.irep = self
                .proc_irep(p)
                .ok_or_else(|| VmError::script("method proc without irep"))?;
            let nregs = fr.irep.nregs as usize;
            self.stack_extend(if argc < 0 && nregs < 3 { 3 } else { nregs })?;
            fr.pc = 0;
            Ok(Step::Next)
        }
    }

    fn op_argary(&mut self, a: usize, b: usize) -> VmResult<Step> {
        let m1 = (b >> 11) & 0x3f;
        let r = (b >> 10) & 0x1;
        let m2 = (b >> 5) & 0x1f;
        let kd = (b >> 4) & 0x1;
        let lv = b & 0xf;
        {
            let ci = self.ctx().ci();
            if ci.mid.is_none() || ci.target_class.is_none() {
                return Err(VmError::no_method("super called outside of method"));
            }
        }
        let read: Box<dyn Fn(&Vm, usize) -> Value> = if lv == 0 {
            Box::new(|vm, i| vm.reg(1 + i))
        } else {
            let e = self
                .uvenv(lv - 1)
                .ok_or_else(|| VmError::no_method("super called outside of method"))?;
            let elen = match self.heap.body(e) {
                ObjBody::Env(env) => env.len(),
                _ => 0,
            };
            if elen <= m1 + r + m2 + kd + 1 {
                return Err(VmError::no_method("super called outside of method"));
            }
            Box::new(move |vm, i| vm.env_get(e, 1 + i))
        };
        let ary = if r == 0 {
            let items: Vec<Value> = (0..m1 + m2 + kd).map(|i| read(self, i)).collect();
            self.ary_new_from(items)?
        } else {
            let mut items: Vec<Value> = (0..m1).map(|i| read(self, i)).collect();
            let rest = read(self, m1);
            if self.is_array(rest) {
                let rest_items = self.ary_items(rest.obj().unwrap())?.to_vec();
                items.extend(rest_items);
            }
            for i in 0..m2 {
                items.push(read(self, m1 + 1 + i));
            }
            if kd == 1 {
                items.push(read(self, m1 + m2 + 1));
            }
            self.ary_new_from(items)?
        };
        let blk = read(self, m1 + r + m2);
        self.set_reg(a, Value::Obj(ary));
        self.set_reg(a + 1, blk);
        Ok(Step::Next)
    }

    fn op_blkpush(&mut self, a: usize, b: usize) -> VmResult<Step> {
        let m1 = (b >> 11) & 0x3f;
        let r = (b >> 10) & 0x1;
        let m2 = (b >> 5) & 0x1f;
        let kd = (b >> 4) & 0x1;
        let lv = b & 0xf;
        let blk = if lv == 0 {
            self.reg(1 + m1 + r + m2 + kd)
        } else {
            let e = self
                .uvenv(lv - 1)
                .ok_or_else(|| VmError::local_jump("unexpected yield"))?;
            let (elen, mid, shared) = match self.heap.body(e) {
                ObjBody::Env(env) => (env.len(), env.mid, env.is_shared()),
                _ => (0, None, false),
            };
            if (!shared && mid.is_none()) || elen <= m1 + r + m2 + 1 {
                return Err(VmError::local_jump("unexpected yield"));
            }
            if self.env_get(e, 1 + m1 + r + m2).is_nil() {
                return Err(VmError::local_jump("no block given (yield)"));
            }
            let v = self.env_get(e, 1 + m1 + r + m2 + kd);
            self.set_reg(a, v);
            return Ok(Step::Next);
        };
        if lv == 0 && self.reg(1 + m1 + r + m2).is_nil() {
            return Err(VmError::local_jump("no block given (yield)"));
        }
        self.set_reg(a, blk);
        Ok(Step::Next)
    }

    // ---- argument binding (OP_ENTER) ----

    fn op_enter(&mut self, fr: &mut Frame, aspec: Aspec) -> VmResult<Step> {
        let m1 = aspec.req();
        let o = aspec.opt();
        let r = aspec.rest() as usize;
        let m2 = aspec.post();
        let kd = aspec.has_kd() as usize;
        let len = m1 + o + r + m2;
        let blk_pos = len + kd + 1;

        let argc0 = self.ctx().ci().argc;
        let blk = self.reg(1 + if argc0 < 0 { 1 } else { argc0 as usize });

        let (mut argv, mut argc): (Vec<Value>, usize) = if argc0 < 0 {
            let packed = self.reg(1);
            self.gc_protect(packed)?;
            let o = self
                .ary_ref_obj(packed)
                .map_err(|_| VmError::argument("packed arguments must be an array"))?;
            (self.ary_items(o)?.to_vec(), self.ary_len(o))
        } else {
            let n = argc0 as usize;
            ((0..n).map(|i| self.reg(1 + i)).collect(), n)
        };

        let strict = self.proc_has_flag(fr.proc, ObjFlags::PROC_STRICT);
        if strict {
            if argc < m1 + m2 || (r == 0 && argc > len + kd) {
                return Err(self.argnum_error(argc, m1 + m2));
            }
        } else if len > 1 && argc == 1 && self.is_array(argv[0]) {
            // auto-splat a single array argument into block parameters
            self.gc_protect(argv[0])?;
            let o = argv[0].obj().unwrap();
            argv = self.ary_items(o)?.to_vec();
            argc = argv.len();
        }

        let mut kargs = kd;
        let mut kdict_val = Value::Nil;
        if kd > 0 {
            if argc == m1 + m2 {
                kdict_val = Value::Obj(self.hash_new()?);
                kargs = 0;
            } else {
                let last_is_hash = argc > 0
                    && matches!(argv[argc - 1], Value::Obj(h) if matches!(self.heap.body(h), ObjBody::Hash(_)));
                if last_is_hash {
                    let h = argv[argc - 1].obj().unwrap();
                    self.hash_check_kdict(h)?;
                    kdict_val = argv[argc - 1];
                } else if r == 1 || argc <= m1 + m2 + o {
                    kdict_val = Value::Obj(self.hash_new()?);
                    kargs = 0;
                } else {
                    return Err(self.argnum_error(argc, m1 + m2));
                }
                if aspec.key() > 0 {
                    if let Value::Obj(h) = kdict_val {
                        // dup so keyword extraction can't eat the caller's hash
                        kdict_val = Value::Obj(self.hash_dup(h)?);
                    }
                }
            }
        }

        self.stack_extend(fr.irep.nregs as usize)?;

        if argc.saturating_sub(kargs) < len {
            let mlen = if argc < m1 + m2 {
                if m1 < argc {
                    argc - m1
                } else {
                    0
                }
            } else {
                m2
            };
            self.set_reg(blk_pos, blk);
            if kd > 0 {
                self.set_reg(len + 1, kdict_val);
            }
            // leading required and provided optionals
            for i in 0..argc.saturating_sub(mlen) {
                self.set_reg(1 + i, argv[i]);
            }
            if argc < m1 {
                for i in argc..m1 {
                    self.set_reg(1 + i, Value::Nil);
                }
            }
            // trailing required
            for i in 0..mlen {
                self.set_reg(len - m2 + 1 + i, argv[argc - mlen + i]);
            }
            for i in mlen..m2 {
                self.set_reg(len - m2 + 1 + i, Value::Nil);
            }
            if r == 1 {
                let empty = self.ary_new()?;
                self.set_reg(m1 + o + 1, Value::Obj(empty));
            }
            // skip initializer jumps for the optionals that were provided
            if o > 0 && argc.saturating_sub(kargs) > m1 + m2 {
                fr.pc += (argc - kargs - m1 - m2) * 3;
            }
        } else {
            self.set_reg(blk_pos, blk);
            if kd > 0 {
                self.set_reg(len + 1, kdict_val);
            }
            for i in 0..m1 + o {
                self.set_reg(1 + i, argv[i]);
            }
            let mut rnum = 0;
            if r == 1 {
                rnum = argc - m1 - o - m2 - kargs;
                let rest: Vec<Value> = argv[m1 + o..m1 + o + rnum].to_vec();
                let rest = self.ary_new_from(rest)?;
                self.set_reg(m1 + o + 1, Value::Obj(rest));
            }
            if m2 > 0 && argc - m2 > m1 {
                for i in 0..m2 {
                    self.set_reg(m1 + o + r + 1 + i, argv[m1 + o + rnum + i]);
                }
            }
            // all optionals provided: skip every initializer jump
            fr.pc += o * 3;
        }

        // canonical argc so keyword opcodes can find the dict register
        self.ctx_mut().ci_mut().argc = (len + kd) as i32;

        let nlocals = fr.irep.nlocals as usize;
        for i in blk_pos + 1..nlocals {
            self.set_reg(i, Value::Nil);
        }
        Ok(Step::Next)
    }

    fn argnum_error(&mut self, given: usize, expected: usize) -> VmError {
        VmError::argument(format!(
            "wrong number of arguments (given {given}, expected {expected})"
        ))
    }

    // ---- ensure execution (OP_EPOP and unwinding) ----

    fn op_epop(&mut self, fr: &mut Frame, mut a: usize) -> VmResult<Step> {
        let (epos, tc, mid) = {
            let ci = self.ctx().ci();
            (ci.epos, ci.target_class, ci.mid)
        };
        let self_val = self.reg(0);
        let eidx = self.ctx().eidx();
        if eidx <= epos {
            return Ok(Step::Next);
        }
        if a > eidx - epos {
            a = eidx - epos;
        }
        for n in 0..a {
            let nregs = fr.irep.nregs as usize;
            let p = match self.ctx_mut().ensure[epos + n].take() {
                Some(p) => p,
                None => continue,
            };
            let pirep = self
                .proc_irep(p)
                .ok_or_else(|| VmError::script("native ensure handler"))?;
            self.cipush();
            let base = self.ctx().stack_base;
            {
                let ci = self.ctx_mut().ci_mut();
                ci.mid = mid;
                ci.argc = 0;
                ci.proc = Some(p);
                ci.stackent = base;
                ci.target_class = tc;
                ci.pc = Some(fr.pc);
                ci.acc = nregs as i32;
            }
            self.ctx_mut().stack_base = base + nregs;
            fr.proc = p;
            fr.irep = pirep;
            self.stack_extend(fr.irep.nregs as usize)?;
            self.set_reg(0, self_val);
            fr.pc = 0;
        }
        self.ctx_mut().ensure.truncate(epos);
        Ok(Step::Next)
    }

    /// Runs the top ensure handler in its own mini-frame via a recursive
    /// entry into the interpreter. An exception raised inside the handler
    /// replaces the one being unwound.
    fn ecall(&mut self) -> VmResult<()> {
        let eidx = self.ctx().eidx();
        let Some(i) = eidx.checked_sub(1) else {
            return Ok(());
        };
        if self.ecall_depth > ECALL_DEPTH_MAX {
            return Err(VmError::raise(Value::Obj(self.stack_err)));
        }
        let p = self.ctx_mut().ensure[i].take();
        self.ctx_mut().ensure.truncate(i);
        let Some(p) = p else {
            return Ok(());
        };
        let env = self
            .proc_env(p)
            .ok_or_else(|| VmError::script("ensure handler without an env"))?;
        let mut nregs = self
            .proc_upper(p)
            .and_then(|u| self.proc_irep(u))
            .map(|i| i.nregs as usize)
            .unwrap_or(2);
        if let Some(cp) = self.ctx().ci().proc {
            if let Some(ir) = self.proc_irep(cp) {
                nregs = nregs.max(ir.nregs as usize);
            }
        }
        let saved_cur = self.cur;
        let saved_depth = self.ctx().ci.len();
        let saved_base = self.ctx().stack_base;
        let mid = self.ctx().ci().mid;
        let tc = self.proc_target_class(p);
        self.cipush();
        {
            let ci = self.ctx_mut().ci_mut();
            ci.stackent = saved_base;
            ci.mid = mid;
            ci.acc = ACC_SKIP;
            ci.argc = 0;
            ci.proc = Some(p);
            ci.target_class = tc;
        }
        self.ctx_mut().stack_base = saved_base + nregs;
        let saved_exc = self.exc.take();
        if let Some(e) = saved_exc {
            self.gc_protect(Value::Obj(e))?;
        }
        let self_val = self.env_get(env, 0);
        let ai = self.arena_save();
        self.ecall_depth += 1;
        let res = self.vm_run(p, self_val, 0);
        self.ecall_depth -= 1;
        self.cur = saved_cur;
        while self.ctx().ci.len() > saved_depth {
            self.cipop();
        }
        self.ctx_mut().stack_base = saved_base;
        match res {
            Ok(_) => {}
            Err(e) => {
                // a raise inside ensure replaces the unwinding exception
                self.exc_set_err(e);
            }
        }
        if self.exc.is_none() {
            self.exc = saved_exc;
        }
        self.arena_restore(ai);
        Ok(())
    }

    /// `L_STOP`: run remaining ensures for this frame, then hand the
    /// result (or the pending exception) to the host.
    fn stop_run(&mut self, fr: &Frame) -> VmResult<Value> {
        let epos = self.ctx().ci().epos;
        while self.ctx().eidx() > epos {
            self.ecall()?;
        }
        if let Some(e) = self.exc.take() {
            return Err(VmError::raise(Value::Obj(e)));
        }
        Ok(self.reg(fr.irep.nlocals as usize))
    }

    // ---- frame exit (RETURN / RETURN_BLK / BREAK) ----

    fn do_return(
        &mut self,
        fr: &mut Frame,
        a: usize,
        kind: RetKind,
        ai: usize,
    ) -> VmResult<Step> {
        // the frame's own block becomes an orphan once this frame is gone
        {
            let ci = self.ctx().ci().clone();
            if ci.mid.is_some() {
                let blk = if ci.argc < 0 {
                    self.reg(2)
                } else {
                    self.reg(ci.argc as usize + 1)
                };
                if let Value::Obj(pb) = blk {
                    if self.heap.header(pb).tt == Vtype::Proc
                        && !self.proc_has_flag(pb, ObjFlags::PROC_STRICT)
                    {
                        let len = self.ctx().ci.len();
                        if len >= 2 {
                            let below_env = self.ctx().ci[len - 2].env;
                            if below_env.is_some() && self.proc_env(pb) == below_env {
                                self.proc_set_flag(pb, ObjFlags::PROC_ORPHAN);
                            }
                        }
                    }
                }
            }
        }

        let v = self.reg(a);
        self.gc_protect(v)?;

        let mut kind = kind;
        if kind == RetKind::Block {
            let acc = self.ctx().ci().acc;
            let envset = self.proc_has_flag(fr.proc, ObjFlags::PROC_ENVSET);
            let strict = self.proc_has_flag(fr.proc, ObjFlags::PROC_STRICT);
            if acc >= 0 && envset && !strict {
                let dst = self.top_proc(fr.proc);
                if self.proc_has_flag(dst, ObjFlags::PROC_ENVSET) {
                    let e = self.proc_env(dst).expect("envset proc");
                    let (shared, cxt) = match self.heap.body(e) {
                        ObjBody::Env(env) => (env.is_shared(), env.cxt),
                        _ => (false, 0),
                    };
                    if !shared || cxt != self.cur {
                        return Err(VmError::local_jump("unexpected return"));
                    }
                }
                let mut t = self.ctx().ci.len() - 1;
                loop {
                    if self.ctx().ci[t].proc == Some(dst) {
                        break;
                    }
                    if self.ctx().ci[t].acc < 0 {
                        return Err(VmError::local_jump("unexpected return"));
                    }
                    if t == 0 {
                        return Err(VmError::local_jump("unexpected return"));
                    }
                    t -= 1;
                }
                if t == 0 {
                    return Err(VmError::local_jump("unexpected return"));
                }
                return self.return_tail(fr, t, v, ai);
            }
            kind = RetKind::Normal;
        }

        if kind == RetKind::Break {
            if self.proc_has_flag(fr.proc, ObjFlags::PROC_STRICT) {
                kind = RetKind::Normal;
            } else {
                return self.do_break(fr, v, ai);
            }
        }

        debug_assert!(kind == RetKind::Normal);
        let top = self.ctx().ci.len() - 1;
        let target = if top == 0 {
            match self.ctx().prev {
                None => {
                    // top-level return
                    let nl = fr.irep.nlocals as usize;
                    self.set_reg(nl, v);
                    let out = self.stop_run(fr)?;
                    return Ok(Step::Return(out));
                }
                Some(prev) => {
                    if self.ctx_at(prev).ci.len() == 1 {
                        return Err(VmError::fiber("double resume"));
                    }
                    while self.ctx().eidx() > 0 {
                        self.ecall()?;
                    }
                    // automatic yield at the end of the fiber
                    self.ctx_mut().status = FiberStatus::Terminated;
                    self.ctx_mut().prev = None;
                    self.cur = prev;
                    self.ctx_mut().status = FiberStatus::Running;
                    self.ctx().ci.len() - 1
                }
            }
        } else {
            top
        };
        self.return_tail(fr, target, v, ai)
    }

    fn do_break(&mut self, fr: &mut Frame, v: Value, ai: usize) -> VmResult<Step> {
        if self.proc_has_flag(fr.proc, ObjFlags::PROC_ORPHAN) {
            return Err(VmError::local_jump("break from proc-closure"));
        }
        let env = self
            .proc_env(fr.proc)
            .ok_or_else(|| VmError::local_jump("break from proc-closure"))?;
        let (shared, cxt) = match self.heap.body(env) {
            ObjBody::Env(e) => (e.is_shared(), e.cxt),
            _ => (false, 0),
        };
        if !shared || cxt != self.cur {
            return Err(VmError::local_jump("break from proc-closure"));
        }
        let epos = self.ctx().ci().epos;
        while self.ctx().eidx() > epos {
            self.ecall()?;
        }
        // break out of a fiber block returns to the resumer
        {
            let top = self.ctx().ci.len() - 1;
            if top == 0 && self.ctx().ci[0].pc.is_some() {
                let prev = self.ctx_mut().prev.take();
                if let Some(p) = prev {
                    self.cur = p;
                }
            }
        }
        if self.ctx().ci().acc < 0 {
            self.arena_restore(ai);
            let brk = self.break_new(fr.proc, v)?;
            return Err(VmError::raise(Value::Obj(brk)));
        }
        self.break_jump(fr, fr.proc, v, ai)
    }

    /// Walks down to the frame below the one running the block's defining
    /// method, then returns from it with `v`.
    fn break_jump(&mut self, fr: &mut Frame, proc_id: ObjId, v: Value, ai: usize) -> VmResult<Step> {
        let ent = self.ctx().ci().stackent;
        self.ctx_mut().stack_base = ent;
        let upper = self.proc_upper(proc_id);
        let mut ci = self.ctx().ci.len() - 1;
        loop {
            if ci == 0 {
                return Err(VmError::local_jump("break from proc-closure"));
            }
            if self.ctx().ci[ci - 1].proc == upper {
                break;
            }
            if self.ctx().ci[ci - 1].acc == ACC_SKIP {
                while self.ctx().ci.len() - 1 > ci {
                    self.cipop();
                }
                return Err(VmError::local_jump("break from proc-closure"));
            }
            ci -= 1;
        }
        self.return_tail(fr, ci, v, ai)
    }

    /// The common frame-exit tail: pops above the target, propagates the
    /// rescue depth, runs pending ensures, and lands the value in the
    /// caller's accept slot (or hands it to the host).
    fn return_tail(
        &mut self,
        fr: &mut Frame,
        target: usize,
        v: Value,
        ai: usize,
    ) -> VmResult<Step> {
        while self.ctx().ci.len() - 1 > target {
            self.cipop();
        }
        if target > 0 {
            let rb = self.ctx().ci[target - 1].ridx;
            self.ctx_mut().ci[target].ridx = rb;
        }
        let epos = self.ctx().ci[target].epos;
        while self.ctx().eidx() > epos {
            self.ecall()?;
        }
        let ci = self.ctx().ci[target].clone();
        if ci.acc == ACC_RESUMED {
            // fiber host boundary: the boundary owner pops its own frame
            self.arena_restore(ai);
            return Ok(Step::Return(v));
        }
        self.ctx_mut().stack_base = ci.stackent;
        self.cipop();
        if ci.acc == ACC_SKIP || ci.acc == ACC_DIRECT {
            self.arena_restore(ai);
            return Ok(Step::Return(v));
        }
        fr.pc = ci
            .pc
            .ok_or_else(|| VmError::script("return into a frame without a pc"))?;
        fr.proc = self
            .ctx()
            .ci()
            .proc
            .ok_or_else(|| VmError::script("return into a frame without a proc"))?;
        fr.irep = self
            .proc_irep(fr.proc)
            .ok_or_else(|| VmError::script("return into a native frame"))?;
        self.set_reg(ci.acc as usize, v);
        self.arena_restore(ai);
        Ok(Step::Next)
    }

    fn top_proc(&self, p: ObjId) -> ObjId {
        let mut p = p;
        while let Some(u) = self.proc_upper(p) {
            if self.proc_has_flag(p, ObjFlags::PROC_SCOPE)
                || self.proc_has_flag(p, ObjFlags::PROC_STRICT)
            {
                return p;
            }
            p = u;
        }
        p
    }

    // ---- OP_EXEC (class/module bodies) ----

    fn op_exec(&mut self, fr: &mut Frame, a: usize, b: usize) -> VmResult<Step> {
        let recv = self.reg(a);
        let recv_cls = match recv {
            Value::Obj(o)
                if matches!(
                    self.heap.header(o).tt,
                    Vtype::Class | Vtype::Module | Vtype::SClass
                ) =>
            {
                o
            }
            _ => return Err(VmError::type_error("class body requires a class or module")),
        };
        let child = self.child_irep(fr, b)?;
        let upper = self.ctx().ci().proc;
        let p = self.obj_alloc(
            Vtype::Proc,
            Some(self.proc_class),
            ObjBody::Proc(RProc {
                body: ProcBody::Irep(child.clone()),
                upper,
                scope: ProcScope::Class(Some(recv_cls)),
            }),
        )?;
        self.proc_set_flag(p, ObjFlags::PROC_SCOPE);
        if let Some(u) = upper {
            self.field_write_barrier(p, Value::Obj(u));
        }

        self.cipush();
        let base = self.ctx().stack_base;
        {
            let ci = self.ctx_mut().ci_mut();
            ci.pc = Some(fr.pc);
            ci.acc = a as i32;
            ci.mid = None;
            ci.stackent = base;
            ci.argc = 0;
            ci.target_class = Some(recv_cls);
            ci.proc = Some(p);
        }
        self.ctx_mut().stack_base = base + a;
        fr.proc = p;
        fr.irep = child;
        let nregs = fr.irep.nregs as usize;
        self.stack_extend(nregs)?;
        for i in 1..nregs {
            self.set_reg(i, Value::Nil);
        }
        fr.pc = 0;
        Ok(Step::Next)
    }

    // ---- destructuring ----

    fn op_apost(&mut self, _fr: &mut Frame, a: usize, pre: usize, post: usize, ai: usize) -> VmResult<Step> {
        let v = self.reg(a);
        let items: Vec<Value> = if self.is_array(v) {
            self.ary_items(v.obj().unwrap())?.to_vec()
        } else {
            vec![v]
        };
        let len = items.len();
        if len > pre + post {
            let mid: Vec<Value> = items[pre..len - post].to_vec();
            let rest = self.ary_new_from(mid)?;
            self.set_reg(a, Value::Obj(rest));
            for i in 0..post {
                self.set_reg(a + 1 + i, items[len - post + i]);
            }
        } else {
            let rest = self.ary_new()?;
            self.set_reg(a, Value::Obj(rest));
            let mut idx = 0;
            while idx + pre < len {
                self.set_reg(a + 1 + idx, items[pre + idx]);
                idx += 1;
            }
            while idx < post {
                self.set_reg(a + 1 + idx, Value::Nil);
                idx += 1;
            }
        }
        self.arena_restore(ai);
        Ok(Step::Next)
    }

    // ---- exception unwinding ----

    fn unwind(&mut self, fr: &mut Frame, ai: usize) -> VmResult<UnwindOut> {
        'raise: loop {
            let exc_obj = self.exc.expect("unwind without a pending exception");

            // an in-flight break arriving across a host boundary
            if self.heap.header(exc_obj).tt == Vtype::Break {
                let (target, val) = match self.heap.body(exc_obj) {
                    ObjBody::Break { target, val } => (*target, *val),
                    _ => unreachable!(),
                };
                self.exc = None;
                match self.break_jump(fr, target, val, ai) {
                    Ok(Step::Next) => return Ok(UnwindOut::Continue),
                    Ok(Step::Return(v)) => return Ok(UnwindOut::Return(v)),
                    Err(e) => {
                        // a failed break lands as an ordinary exception
                        self.exc_set_err(e);
                        continue 'raise;
                    }
                }
            }

            let ci0 = self.ctx().ci.len() - 1;
            let mut ci = ci0;
            if ci == 0 {
                if self.ctx().ci[0].ridx == 0 {
                    match self.unwind_fiber_top(fr)? {
                        Some(v) => return Ok(UnwindOut::Return(v)),
                        None => continue 'raise,
                    }
                }
                // fall through to the rescue transfer below
            } else {
                loop {
                    let (rt, rb) = {
                        let cis = &self.ctx().ci;
                        (cis[ci].ridx, cis[ci - 1].ridx)
                    };
                    if rt != rb {
                        break;
                    }
                    // this frame has no fresh rescue: pop it
                    let (stackent, acc) = {
                        let c = &self.ctx().ci[ci];
                        (c.stackent, c.acc)
                    };
                    self.cipop();
                    self.ctx_mut().stack_base = stackent;
                    if acc == ACC_SKIP || acc == ACC_RESUMED {
                        // host boundary: rethrow whatever is pending now (an
                        // ensure may have replaced the original exception)
                        let cur = self.exc.unwrap_or(exc_obj);
                        return Err(VmError::raise(Value::Obj(cur)));
                    }
                    ci = self.ctx().ci.len() - 1;
                    if ci == 0 {
                        if self.ctx().ci[0].ridx == 0 {
                            match self.unwind_fiber_top(fr)? {
                                Some(v) => return Ok(UnwindOut::Return(v)),
                                None => continue 'raise,
                            }
                        }
                        break;
                    }
                    // run ensures only when this frame will be skipped too
                    let (rt, rb) = {
                        let cis = &self.ctx().ci;
                        (cis[ci].ridx, cis[ci - 1].ridx)
                    };
                    if rt == rb {
                        let epos = self.ctx().ci[ci].epos;
                        while self.ctx().eidx() > epos {
                            self.ecall()?;
                        }
                    }
                }
            }

            // rescue transfer
            let top = self.ctx().ci.len() - 1;
            if self.ctx().ci[top].ridx == 0 {
                let v = self.stop_run(fr)?;
                return Ok(UnwindOut::Return(v));
            }
            let proc_id = self.ctx().ci[top]
                .proc
                .ok_or_else(|| VmError::raise(Value::Obj(exc_obj)))?;
            fr.proc = proc_id;
            fr.irep = self
                .proc_irep(proc_id)
                .ok_or_else(|| VmError::raise(Value::Obj(exc_obj)))?;
            self.stack_extend(fr.irep.nregs as usize)?;
            let ridx = {
                let ci = self.ctx_mut().ci_mut();
                ci.ridx -= 1;
                ci.ridx
            };
            let handler = self
                .ctx()
                .rescue
                .get(ridx)
                .copied()
                .ok_or_else(|| VmError::script("rescue stack out of sync"))?;
            fr.pc = handler as usize;
            // spec: control reaches the handler with the exception cleared;
            // EXCEPT picks it up from the in-flight slot
            self.caught = self.exc.take();
            return Ok(UnwindOut::Continue);
        }
    }

    /// Unwinding reached the bottom frame: finish the root context, or
    /// terminate a fiber and continue unwinding in its resumer.
    fn unwind_fiber_top(&mut self, fr: &mut Frame) -> VmResult<Option<Value>> {
        if self.cur == self.root {
            self.ctx_mut().stack_base = 0;
            let v = self.stop_run(fr)?;
            return Ok(Some(v));
        }
        let epos = self.ctx().ci[0].epos;
        while self.ctx().eidx() > epos {
            self.ecall()?;
        }
        self.ctx_mut().status = FiberStatus::Terminated;
        let prev = self.ctx_mut().prev.take();
        self.cur = prev.unwrap_or(self.root);
        Ok(None)
    }
}
