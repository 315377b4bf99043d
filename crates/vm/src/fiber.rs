//! Fibers: cooperatively scheduled contexts with their own stacks.
//!
//! Resume and yield are implemented entirely at the VM level: they swap the
//! current-context id and mark the frame control returns through by
//! clearing its target class (the context-modify marker the dispatch loop
//! recognizes after a native call). No OS-level switching is involved, and
//! the GC scans every fiber context's stacks as roots.

use crate::callinfo::CallInfo;
use crate::context::{Context, CtxId, FiberStatus};
use crate::error::{VmError, VmResult};
use crate::object::{ObjBody, ObjFlags};
use crate::value::{ObjId, Value, Vtype};
use crate::vm::Vm;

impl Vm {
    /// Creates a fiber object running `block` when first resumed.
    pub fn fiber_new(&mut self, block: Value) -> VmResult<ObjId> {
        let p = match block {
            Value::Obj(o) if self.heap.header(o).tt == Vtype::Proc => o,
            _ => return Err(VmError::argument("tried to create Fiber without a block")),
        };
        if self.proc_has_flag(p, ObjFlags::PROC_CFUNC) {
            return Err(VmError::fiber("can't create Fiber from a native proc"));
        }
        let fib = self.obj_alloc(
            Vtype::Fiber,
            Some(self.fiber_class),
            ObjBody::Fiber { cxt: None },
        )?;

        let mut ctx = Box::new(Context::new());
        ctx.status = FiberStatus::Created;
        ctx.fib = Some(fib);
        // the block's self lands in register 0
        ctx.stack[0] = self.reg(0);
        let base = CallInfo {
            proc: Some(p),
            pc: Some(0),
            stackent: 0,
            argc: 0,
            target_class: self.proc_target_class(p),
            ..Default::default()
        };
        ctx.ci[0] = base.clone();
        // dummy frame the first resume returns through
        ctx.ci.push(base);

        let id = self.alloc_context(ctx);
        if let ObjBody::Fiber { cxt } = self.heap.body_mut(fib) {
            *cxt = Some(id);
        }
        Ok(fib)
    }

    fn alloc_context(&mut self, ctx: Box<Context>) -> CtxId {
        match self.contexts.iter().position(|c| c.is_none()) {
            Some(hole) => {
                self.contexts[hole] = Some(ctx);
                hole
            }
            None => {
                self.contexts.push(Some(ctx));
                self.contexts.len() - 1
            }
        }
    }

    fn fiber_ctx(&self, fib: ObjId) -> VmResult<CtxId> {
        match self.heap.body(fib) {
            ObjBody::Fiber { cxt: Some(c) } => Ok(*c),
            ObjBody::Fiber { cxt: None } => Err(VmError::fiber("uninitialized fiber")),
            _ => Err(VmError::type_error("Fiber required")),
        }
    }

    /// Packs resume/yield values the way the switch hands them over.
    fn fiber_result(&mut self, args: &[Value]) -> VmResult<Value> {
        match args.len() {
            0 => Ok(Value::Nil),
            1 => Ok(args[0]),
            _ => Ok(Value::Obj(self.ary_new_from(args.to_vec())?)),
        }
    }

    /// Marks the current frame of `ctx` so the dispatch loop treats the
    /// pending native return as a context switch.
    fn mark_context_modify(&mut self, ctx: CtxId) {
        self.ctx_at_mut(ctx).ci_mut().target_class = None;
    }

    /// Switches execution into `fib`. Called from the `Fiber#resume`
    /// native; the dispatch loop (or the host boundary) completes the
    /// transfer when the native returns.
    pub(crate) fn fiber_switch(&mut self, fib: ObjId, args: &[Value]) -> VmResult<Value> {
        let target = self.fiber_ctx(fib)?;
        let status = self.ctx_at(target).status;
        match status {
            FiberStatus::Transferred => {
                return Err(VmError::fiber("resuming transferred fiber"))
            }
            FiberStatus::Running | FiberStatus::Resumed => {
                return Err(VmError::fiber("double resume"))
            }
            FiberStatus::Terminated => return Err(VmError::fiber("resuming dead fiber")),
            FiberStatus::Created | FiberStatus::Suspended => {}
        }
        let caller = self.cur;
        self.ctx_at_mut(caller).status = FiberStatus::Resumed;
        self.ctx_at_mut(target).prev = Some(caller);

        if status == FiberStatus::Created {
            // first resume: lay the arguments into the new frame
            let ctx = self.ctx_at_mut(target);
            let need = args.len() + 2;
            if ctx.stack.len() < need {
                ctx.stack.resize(need, Value::Nil);
            }
            for (i, &a) in args.iter().enumerate() {
                ctx.stack[1 + i] = a;
            }
            ctx.ci[0].argc = args.len() as i32;
        }
        self.ctx_at_mut(target).status = FiberStatus::Running;
        self.cur = target;
        self.mark_context_modify(target);
        // an old fiber object must be re-scanned after its stacks mutate
        self.write_barrier(fib);
        if let Some(caller_fib) = self.ctx_at(caller).fib {
            self.write_barrier(caller_fib);
        }
        self.fiber_result(args)
    }

    /// Suspends the current fiber, returning control (and `args`) to its
    /// resumer. Called from the `Fiber.yield` native.
    pub(crate) fn fiber_yield_values(&mut self, args: &[Value]) -> VmResult<Value> {
        let cur = self.cur;
        let prev = self
            .ctx_at(cur)
            .prev
            .ok_or_else(|| VmError::fiber("can't yield from root fiber"))?;
        self.ctx_at_mut(cur).status = FiberStatus::Suspended;
        self.ctx_at_mut(cur).prev = None;
        self.ctx_at_mut(prev).status = FiberStatus::Running;
        self.cur = prev;
        self.mark_context_modify(prev);
        if let Some(fib) = self.ctx_at(cur).fib {
            self.write_barrier(fib);
        }
        self.fiber_result(args)
    }

    /// Host-level resume; equivalent to calling `resume` on the fiber.
    pub fn fiber_resume(&mut self, fib: Value, args: &[Value]) -> VmResult<Value> {
        self.funcall(fib, "resume", args)
    }

    /// Whether a fiber can still be resumed.
    pub fn fiber_alive(&self, fib: ObjId) -> bool {
        match self.fiber_ctx(fib) {
            Ok(c) => self.ctx_at(c).status != FiberStatus::Terminated,
            Err(_) => false,
        }
    }
}

// ---- Fiber class methods ----

pub(crate) fn fiber_s_new(vm: &mut Vm, _self_val: Value) -> VmResult<Value> {
    let block = vm.native_block();
    let fib = vm.fiber_new(block)?;
    Ok(Value::Obj(fib))
}

pub(crate) fn fiber_resume_m(vm: &mut Vm, self_val: Value) -> VmResult<Value> {
    let fib = self_val
        .obj()
        .ok_or_else(|| VmError::type_error("Fiber required"))?;
    let args: Vec<Value> = (0..vm.native_argc()).map(|i| vm.native_arg(i)).collect();
    vm.fiber_switch(fib, &args)
}

pub(crate) fn fiber_s_yield(vm: &mut Vm, _self_val: Value) -> VmResult<Value> {
    let args: Vec<Value> = (0..vm.native_argc()).map(|i| vm.native_arg(i)).collect();
    vm.fiber_yield_values(&args)
}

pub(crate) fn fiber_alive_p(vm: &mut Vm, self_val: Value) -> VmResult<Value> {
    let fib = self_val
        .obj()
        .ok_or_else(|| VmError::type_error("Fiber required"))?;
    Ok(Value::from_bool(vm.fiber_alive(fib)))
}
