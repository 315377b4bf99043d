//! The VM state: the single container for every piece of runtime state.
//!
//! There is no process-wide mutable state anywhere in this crate; the
//! [`Vm`] handle owns the heap, GC, symbol table, global variables, method
//! cache, fiber contexts, and pre-allocated exceptions, and is passed
//! explicitly to every operation. One `Vm` is single-threaded; multiple VMs
//! may coexist if each stays on its own thread.

use crate::callinfo::{CallInfo, ACC_RESUMED, ACC_SKIP};
#[cfg(feature = "method-cache")]
use crate::class::{CacheEntry, METHOD_CACHE_SIZE};
use crate::class::{Method, MethodTable, RClass};
use crate::context::{Context, CtxId, STACK_GROWTH, STACK_MAX};
use crate::env::{EnvStorage, REnv};
use crate::error::{VmError, VmResult};
use crate::gc::Gc;
use crate::heap::Heap;
use crate::irep::Irep;
use crate::ivtable::IvTable;
use crate::object::{ObjBody, ObjFlags};
use crate::procs::{NativeFn, ProcBody, ProcScope, RProc};
use crate::symbol::{Sym, SymbolTable};
use crate::value::{ObjId, Value, Vtype};
use hashbrown::HashMap;
use std::rc::Rc;

/// Maximum host-call recursion depth.
pub const FUNCALL_DEPTH_MAX: usize = 512;
/// Maximum ensure-call recursion depth.
pub const ECALL_DEPTH_MAX: usize = 32;
/// Arguments beyond this are packed into one array.
pub const CALL_MAXARGS: usize = 127;

/// Tunables fixed at VM creation.
#[derive(Debug, Clone, Default)]
pub struct VmConfig {
    /// Hard cap on heap pages; allocation beyond it raises `NoMemoryError`
    /// after a full GC fails to make room. `None` means unbounded.
    pub heap_max_pages: Option<usize>,
    /// Start with generational GC disabled.
    pub disable_generational_gc: bool,
}

/// An embeddable Ruby-family virtual machine.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) gc: Gc,
    pub(crate) symbols: SymbolTable,
    pub(crate) globals: HashMap<Sym, Value>,
    pub(crate) specials: Vec<Value>,
    pub(crate) contexts: Vec<Option<Box<Context>>>,
    pub(crate) cur: CtxId,
    pub(crate) root: CtxId,
    /// Pending exception.
    pub(crate) exc: Option<ObjId>,
    /// Exception in flight to a rescue handler, consumed by `EXCEPT`.
    pub(crate) caught: Option<ObjId>,
    /// Ensure-handler recursion depth.
    pub(crate) ecall_depth: usize,

    // Built-in classes, fixed at init and treated as GC roots.
    pub basic_object_class: ObjId,
    pub object_class: ObjId,
    pub class_class: ObjId,
    pub module_class: ObjId,
    pub proc_class: ObjId,
    pub string_class: ObjId,
    pub array_class: ObjId,
    pub hash_class: ObjId,
    pub range_class: ObjId,
    pub float_class: ObjId,
    pub fixnum_class: ObjId,
    pub true_class: ObjId,
    pub false_class: ObjId,
    pub nil_class: ObjId,
    pub symbol_class: ObjId,
    pub kernel_module: ObjId,
    pub exception_class: ObjId,
    pub standard_error_class: ObjId,
    pub fiber_class: ObjId,

    pub(crate) top_self: ObjId,
    /// Pre-allocated so raising out-of-memory never allocates.
    pub(crate) nomem_err: ObjId,
    /// Pre-allocated so raising stack exhaustion never allocates.
    pub(crate) stack_err: ObjId,
    #[cfg(feature = "fixed-arena")]
    pub(crate) arena_err: ObjId,

    #[cfg(feature = "method-cache")]
    pub(crate) cache: Vec<Option<CacheEntry>>,

    /// Where `p` writes; defaults to stdout.
    pub(crate) out: OutputSink,
}

/// Destination for VM-produced text (`p` and friends).
#[derive(Debug)]
pub enum OutputSink {
    Stdout,
    /// Buffered for host inspection (tests, embedding).
    Capture(String),
}

impl Vm {
    /// Creates a VM with default configuration.
    pub fn open() -> VmResult<Box<Vm>> {
        Self::open_with(VmConfig::default())
    }

    /// Creates a VM, bootstrapping the class hierarchy, the pre-allocated
    /// exceptions, and the intrinsic method surface.
    pub fn open_with(config: VmConfig) -> VmResult<Box<Vm>> {
        let mut heap = Heap::new();
        heap.max_pages = config.heap_max_pages;
        let mut gc = Gc::new();
        if config.disable_generational_gc {
            gc.generational = false;
        }

        // Boot allocations bypass the GC trigger; the struct does not exist
        // yet to scan roots from.
        fn boot(heap: &mut Heap, gc: &mut Gc, tt: Vtype, body: ObjBody) -> ObjId {
            if !heap.has_free_slot() {
                heap.add_page().expect("boot heap page");
            }
            let id = heap.alloc_raw().expect("boot allocation");
            let slot = heap.slot_mut(id);
            slot.header.tt = tt;
            slot.header.color = gc.current_white();
            slot.body = body;
            gc.live += 1;
            id
        }
        fn boot_class(heap: &mut Heap, gc: &mut Gc, tt: Vtype, sup: Option<ObjId>) -> ObjId {
            boot(
                heap,
                gc,
                tt,
                ObjBody::Class(RClass {
                    super_: sup,
                    mt: MethodTable::new(),
                    iv: IvTable::new(),
                    instance_tt: Vtype::Object,
                }),
            )
        }

        let basic_object_class = boot_class(&mut heap, &mut gc, Vtype::Class, None);
        let object_class = boot_class(&mut heap, &mut gc, Vtype::Class, Some(basic_object_class));
        let module_class = boot_class(&mut heap, &mut gc, Vtype::Class, Some(object_class));
        let class_class = boot_class(&mut heap, &mut gc, Vtype::Class, Some(module_class));
        // metaclass links
        for c in [basic_object_class, object_class, module_class, class_class] {
            heap.header_mut(c).cls = Some(class_class);
        }
        fn mk(heap: &mut Heap, gc: &mut Gc, meta: ObjId, sup: ObjId, tt: Vtype) -> ObjId {
            let c = boot_class(heap, gc, Vtype::Class, Some(sup));
            heap.header_mut(c).cls = Some(meta);
            if let ObjBody::Class(cls) = heap.body_mut(c) {
                cls.instance_tt = tt;
            }
            c
        }
        let kernel_module = boot_class(&mut heap, &mut gc, Vtype::Module, None);
        heap.header_mut(kernel_module).cls = Some(module_class);

        let proc_class = mk(&mut heap, &mut gc, class_class, object_class, Vtype::Proc);
        let string_class = mk(&mut heap, &mut gc, class_class, object_class, Vtype::String);
        let array_class = mk(&mut heap, &mut gc, class_class, object_class, Vtype::Array);
        let hash_class = mk(&mut heap, &mut gc, class_class, object_class, Vtype::Hash);
        let range_class = mk(&mut heap, &mut gc, class_class, object_class, Vtype::Range);
        let float_class = mk(&mut heap, &mut gc, class_class, object_class, Vtype::False);
        let fixnum_class = mk(&mut heap, &mut gc, class_class, object_class, Vtype::False);
        let true_class = mk(&mut heap, &mut gc, class_class, object_class, Vtype::False);
        let false_class = mk(&mut heap, &mut gc, class_class, object_class, Vtype::False);
        let nil_class = mk(&mut heap, &mut gc, class_class, object_class, Vtype::False);
        let symbol_class = mk(&mut heap, &mut gc, class_class, object_class, Vtype::False);
        let exception_class = mk(&mut heap, &mut gc, class_class, object_class, Vtype::Exception);
        let standard_error_class = mk(
            &mut heap,
            &mut gc,
            class_class,
            exception_class,
            Vtype::Exception,
        );
        let fiber_class = mk(&mut heap, &mut gc, class_class, object_class, Vtype::Fiber);

        let top_self = boot(
            &mut heap,
            &mut gc,
            Vtype::Object,
            ObjBody::Object { iv: IvTable::new() },
        );
        heap.header_mut(top_self).cls = Some(object_class);

        let mut vm = Box::new(Vm {
            heap,
            gc,
            symbols: SymbolTable::new(),
            globals: HashMap::new(),
            specials: Vec::new(),
            contexts: vec![Some(Box::new(Context::new()))],
            cur: 0,
            root: 0,
            exc: None,
            caught: None,
            ecall_depth: 0,
            basic_object_class,
            object_class,
            class_class,
            module_class,
            proc_class,
            string_class,
            array_class,
            hash_class,
            range_class,
            float_class,
            fixnum_class,
            true_class,
            false_class,
            nil_class,
            symbol_class,
            kernel_module,
            exception_class,
            standard_error_class,
            fiber_class,
            top_self,
            // patched right below
            nomem_err: top_self,
            stack_err: top_self,
            #[cfg(feature = "fixed-arena")]
            arena_err: top_self,
            #[cfg(feature = "method-cache")]
            cache: vec![None; METHOD_CACHE_SIZE],
            out: OutputSink::Stdout,
        });
        vm.ctx_mut().ci_mut().target_class = Some(object_class);

        crate::exception::init_exceptions(&mut vm)?;
        crate::kernel::init_core(&mut vm)?;
        // boot objects are reachable as roots; drop their arena slots
        vm.arena_restore(0);
        Ok(vm)
    }

    /// Tears the VM down, releasing every context and heap page.
    pub fn close(mut self: Box<Vm>) {
        self.gc_free_all();
    }

    /// Buffers `p` output for host inspection instead of writing stdout.
    pub fn capture_output(&mut self) {
        self.out = OutputSink::Capture(String::new());
    }

    /// Takes everything captured so far.
    pub fn take_output(&mut self) -> String {
        match &mut self.out {
            OutputSink::Capture(s) => std::mem::take(s),
            OutputSink::Stdout => String::new(),
        }
    }

    /// Writes program output to the configured sink.
    pub(crate) fn write_out(&mut self, s: &str) {
        match &mut self.out {
            OutputSink::Stdout => print!("{s}"),
            OutputSink::Capture(buf) => buf.push_str(s),
        }
    }

    // ---- context and register access ----

    pub(crate) fn ctx(&self) -> &Context {
        self.contexts[self.cur].as_deref().expect("live context")
    }

    pub(crate) fn ctx_mut(&mut self) -> &mut Context {
        self.contexts[self.cur].as_deref_mut().expect("live context")
    }

    pub(crate) fn ctx_at(&self, id: CtxId) -> &Context {
        self.contexts[id].as_deref().expect("live context")
    }

    pub(crate) fn ctx_at_mut(&mut self, id: CtxId) -> &mut Context {
        self.contexts[id].as_deref_mut().expect("live context")
    }

    /// Reads register `i` of the current frame.
    pub fn reg(&self, i: usize) -> Value {
        let c = self.ctx();
        c.stack.get(c.stack_base + i).copied().unwrap_or(Value::Nil)
    }

    /// Writes register `i` of the current frame.
    pub fn set_reg(&mut self, i: usize, v: Value) {
        let c = self.ctx_mut();
        let idx = c.stack_base + i;
        if idx >= c.stack.len() {
            c.stack.resize(idx + 1, Value::Nil);
        }
        c.stack[idx] = v;
    }

    /// Interns a symbol.
    pub fn intern(&mut self, name: &str) -> Sym {
        self.symbols.intern(name)
    }

    /// Symbol name lookup.
    pub fn sym_name(&self, sym: Sym) -> &str {
        self.symbols.name(sym)
    }

    /// The top-level `self` object.
    pub fn top_self_value(&self) -> Value {
        Value::Obj(self.top_self)
    }

    /// The kind of any value; heap values read their header tag.
    pub fn vtype(&self, v: Value) -> Vtype {
        match v {
            Value::Obj(o) => self.heap.header(o).tt,
            other => other.immediate_vtype().expect("immediate"),
        }
    }

    /// The header type tag of a heap object.
    pub fn heap_tt(&self, o: ObjId) -> Vtype {
        self.heap.header(o).tt
    }

    /// The value kind instances of `cls` are created with.
    pub fn class_instance_tt(&self, cls: ObjId) -> Vtype {
        match self.heap.body(cls) {
            crate::object::ObjBody::Class(c) => c.instance_tt,
            _ => Vtype::Object,
        }
    }

    /// The block passed to the bytecode method below the current native
    /// frame (for `block_given?`-style queries).
    pub fn caller_block(&self) -> Option<Value> {
        let len = self.ctx().ci.len();
        if len < 2 {
            return None;
        }
        let below = &self.ctx().ci[len - 2];
        let base = self.ctx().ci().stackent;
        let idx = base
            + if below.argc < 0 {
                2
            } else {
                below.argc as usize + 1
            };
        self.ctx().stack.get(idx).copied()
    }

    /// Identity / immediate equality (`EQ` fast path before dispatch).
    pub fn obj_eq(&self, a: Value, b: Value) -> bool {
        a == b
    }

    // ---- value stack ----

    /// Grows the current frame's register window to `room` slots, raising
    /// the pre-allocated `SysStackError` past the ceiling. Envs and
    /// call-info entries hold stack offsets, so no relocation pass is
    /// needed when the buffer moves.
    pub(crate) fn stack_extend(&mut self, room: usize) -> VmResult<()> {
        let c = self.ctx();
        let need = c.stack_base + room;
        if need > c.stack.len() {
            let new_len = std::cmp::max(c.stack.len() + STACK_GROWTH, need);
            if new_len > STACK_MAX {
                return Err(VmError::raise(Value::Obj(self.stack_err)));
            }
            self.ctx_mut().stack.resize(new_len, Value::Nil);
        }
        Ok(())
    }

    /// Registers a frame actually needs, derived the way the GC's stack
    /// scan derives it.
    pub(crate) fn ci_nregs(&self, ci: &CallInfo) -> usize {
        let mut n = 0usize;
        match ci.proc {
            None => {
                return if ci.argc < 0 {
                    3
                } else {
                    ci.argc as usize + 2
                };
            }
            Some(p) => {
                if let Some(irep) = self.proc_irep(p) {
                    n = irep.nregs as usize;
                }
            }
        }
        if ci.argc < 0 && n < 3 {
            n = 3;
        }
        if ci.argc > n as i32 {
            n = ci.argc as usize + 2;
        }
        n
    }

    // ---- call-info stack ----

    /// Pushes a fresh call-info inheriting the rescue depth and ensure
    /// position.
    pub(crate) fn cipush(&mut self) {
        let c = self.ctx_mut();
        let ridx = c.ci().ridx;
        let epos = c.ensure.len();
        c.ci.push(CallInfo {
            ridx,
            epos,
            ..Default::default()
        });
    }

    /// Pops the top call-info, unsharing any env that still references the
    /// dying frame.
    pub(crate) fn cipop(&mut self) {
        let env = self.ctx_mut().ci.pop().and_then(|ci| ci.env);
        if let Some(e) = env {
            self.env_unshare(e);
        }
    }

    // ---- env objects ----

    /// Reads a captured local.
    pub(crate) fn env_get(&self, e: ObjId, i: usize) -> Value {
        match self.heap.body(e) {
            ObjBody::Env(env) => match &env.storage {
                EnvStorage::Shared { offset, len } => {
                    if i < *len {
                        self.ctx_at(env.cxt)
                            .stack
                            .get(offset + i)
                            .copied()
                            .unwrap_or(Value::Nil)
                    } else {
                        Value::Nil
                    }
                }
                EnvStorage::Owned(vals) => vals.get(i).copied().unwrap_or(Value::Nil),
            },
            _ => Value::Nil,
        }
    }

    /// Writes a captured local, with the backward barrier (env stores are
    /// dense).
    pub(crate) fn env_set(&mut self, e: ObjId, i: usize, v: Value) {
        let target = match self.heap.body(e) {
            ObjBody::Env(env) => match &env.storage {
                EnvStorage::Shared { offset, len } => {
                    if i >= *len {
                        return;
                    }
                    Some((env.cxt, offset + i))
                }
                EnvStorage::Owned(_) => None,
            },
            _ => return,
        };
        match target {
            Some((cxt, idx)) => {
                let c = self.ctx_at_mut(cxt);
                if idx < c.stack.len() {
                    c.stack[idx] = v;
                }
            }
            None => {
                if let ObjBody::Env(env) = self.heap.body_mut(e) {
                    if let EnvStorage::Owned(vals) = &mut env.storage {
                        if i < vals.len() {
                            vals[i] = v;
                        }
                    }
                }
            }
        }
        self.write_barrier(e);
    }

    /// Copies a stack-shared env's locals into its own heap storage. Called
    /// whenever the frame it captured exits.
    pub(crate) fn env_unshare(&mut self, e: ObjId) {
        let (cxt, offset, len) = match self.heap.body(e) {
            ObjBody::Env(env) => match env.storage {
                EnvStorage::Shared { offset, len } => (env.cxt, offset, len),
                EnvStorage::Owned(_) => return,
            },
            _ => return,
        };
        let vals: Vec<Value> = {
            let c = self.ctx_at(cxt);
            (0..len)
                .map(|i| c.stack.get(offset + i).copied().unwrap_or(Value::Nil))
                .collect()
        };
        if let ObjBody::Env(env) = self.heap.body_mut(e) {
            env.storage = EnvStorage::Owned(vals);
        }
        self.write_barrier(e);
    }

    /// The env capturing the current frame, created on first use.
    pub(crate) fn env_capture(&mut self) -> VmResult<ObjId> {
        if let Some(e) = self.ctx().ci().env {
            return Ok(e);
        }
        let (mid, tc, nlocals) = {
            let ci = self.ctx().ci();
            let nlocals = ci
                .proc
                .and_then(|p| self.proc_irep(p))
                .map(|i| i.nlocals as usize)
                .unwrap_or_else(|| self.ci_nregs(ci));
            (ci.mid, ci.target_class, nlocals)
        };
        let offset = self.ctx().stack_base;
        let e = self.obj_alloc(
            Vtype::Env,
            tc,
            ObjBody::Env(REnv {
                storage: EnvStorage::Shared {
                    offset,
                    len: nlocals,
                },
                cxt: self.cur,
                mid,
            }),
        )?;
        self.ctx_mut().ci_mut().env = Some(e);
        Ok(e)
    }

    /// Walks `up` levels of the proc lexical chain to the enclosing env.
    pub(crate) fn uvenv(&self, up: usize) -> Option<ObjId> {
        let mut proc_id = self.ctx().ci().proc?;
        for _ in 0..up {
            proc_id = match self.heap.body(proc_id) {
                ObjBody::Proc(p) => p.upper?,
                _ => return None,
            };
        }
        if let ObjBody::Proc(p) = self.heap.body(proc_id) {
            if let Some(e) = p.env() {
                return Some(e);
            }
        }
        // the defining frame may still be live on this context
        for ci in self.ctx().ci.iter().rev() {
            if ci.proc == Some(proc_id) {
                return ci.env;
            }
        }
        None
    }

    // ---- proc objects ----

    pub(crate) fn proc_irep(&self, p: ObjId) -> Option<Rc<Irep>> {
        match self.heap.body(p) {
            ObjBody::Proc(pr) => pr.irep().cloned(),
            _ => None,
        }
    }

    pub(crate) fn proc_native(&self, p: ObjId) -> Option<NativeFn> {
        match self.heap.body(p) {
            ObjBody::Proc(pr) => match pr.body {
                ProcBody::Native(f) => Some(f),
                ProcBody::Irep(_) => None,
            },
            _ => None,
        }
    }

    pub(crate) fn proc_has_flag(&self, p: ObjId, flag: ObjFlags) -> bool {
        self.heap.header(p).flags.contains(flag)
    }

    pub(crate) fn proc_set_flag(&mut self, p: ObjId, flag: ObjFlags) {
        self.heap.header_mut(p).flags |= flag;
    }

    pub(crate) fn proc_upper(&self, p: ObjId) -> Option<ObjId> {
        match self.heap.body(p) {
            ObjBody::Proc(pr) => pr.upper,
            _ => None,
        }
    }

    pub(crate) fn proc_env(&self, p: ObjId) -> Option<ObjId> {
        match self.heap.body(p) {
            ObjBody::Proc(pr) => pr.env(),
            _ => None,
        }
    }

    /// The class a proc defines methods against / resolves `super` in.
    /// Env-capturing procs read it off the captured env's class slot.
    pub(crate) fn proc_target_class(&self, p: ObjId) -> Option<ObjId> {
        match self.heap.body(p) {
            ObjBody::Proc(pr) => match pr.scope {
                ProcScope::Env(e) => self.heap.header(e).cls,
                ProcScope::Class(c) => c,
            },
            _ => None,
        }
    }

    /// A plain proc for a method or class body; no env capture.
    pub(crate) fn proc_new(&mut self, irep: Rc<Irep>) -> VmResult<ObjId> {
        let upper = self.ctx().ci().proc;
        self.obj_alloc(
            Vtype::Proc,
            Some(self.proc_class),
            ObjBody::Proc(RProc {
                body: ProcBody::Irep(irep),
                upper,
                scope: ProcScope::Class(self.ctx().ci().target_class),
            }),
        )
    }

    /// A closure over the current frame: captures the env and links the
    /// lexical chain.
    pub(crate) fn closure_new(&mut self, irep: Rc<Irep>) -> VmResult<ObjId> {
        let env = self.env_capture()?;
        let upper = self.ctx().ci().proc;
        let p = self.obj_alloc(
            Vtype::Proc,
            Some(self.proc_class),
            ObjBody::Proc(RProc {
                body: ProcBody::Irep(irep),
                upper,
                scope: ProcScope::Env(env),
            }),
        )?;
        self.proc_set_flag(p, ObjFlags::PROC_ENVSET);
        self.field_write_barrier(p, Value::Obj(env));
        Ok(p)
    }

    /// A native closure carrying captured values in an owned env.
    pub fn proc_new_cfunc_with_env(
        &mut self,
        f: NativeFn,
        captures: Vec<Value>,
    ) -> VmResult<ObjId> {
        let e = self.obj_alloc(
            Vtype::Env,
            None,
            ObjBody::Env(REnv {
                storage: EnvStorage::Owned(captures),
                cxt: self.cur,
                mid: None,
            }),
        )?;
        let p = self.obj_alloc(
            Vtype::Proc,
            Some(self.proc_class),
            ObjBody::Proc(RProc {
                body: ProcBody::Native(f),
                upper: None,
                scope: ProcScope::Env(e),
            }),
        )?;
        self.proc_set_flag(p, ObjFlags::PROC_CFUNC | ObjFlags::PROC_ENVSET);
        Ok(p)
    }

    /// Reads a value captured by the currently executing native closure.
    pub fn cfunc_env_get(&self, i: usize) -> Value {
        match self.ctx().ci().proc.and_then(|p| self.proc_env(p)) {
            Some(e) => self.env_get(e, i),
            None => Value::Nil,
        }
    }

    // ---- native argument access ----

    /// Positional argument count of the current native call.
    pub fn native_argc(&self) -> usize {
        let ci = self.ctx().ci();
        if ci.argc < 0 {
            match self.reg(1) {
                Value::Obj(o) => self.ary_len(o),
                _ => 0,
            }
        } else {
            ci.argc as usize
        }
    }

    /// Positional argument `i` of the current native call.
    pub fn native_arg(&self, i: usize) -> Value {
        let ci = self.ctx().ci();
        if ci.argc < 0 {
            match self.reg(1) {
                Value::Obj(o) => self.ary_get(o, i),
                _ => Value::Nil,
            }
        } else if i < ci.argc as usize {
            self.reg(i + 1)
        } else {
            Value::Nil
        }
    }

    /// Block argument of the current native call.
    pub fn native_block(&self) -> Value {
        let ci = self.ctx().ci();
        if ci.argc < 0 {
            self.reg(2)
        } else {
            self.reg(ci.argc as usize + 1)
        }
    }

    // ---- host call interface ----

    /// Invokes `name` on `receiver`.
    pub fn funcall(&mut self, receiver: Value, name: &str, args: &[Value]) -> VmResult<Value> {
        let mid = self.intern(name);
        self.funcall_argv(receiver, mid, args)
    }

    /// Invokes a method by symbol.
    pub fn funcall_argv(&mut self, receiver: Value, mid: Sym, args: &[Value]) -> VmResult<Value> {
        self.funcall_with_block(receiver, mid, args, Value::Nil)
    }

    /// Invokes a method with an explicit block. Exceptions unwind the
    /// frames this call pushed and return as `Err`.
    pub fn funcall_with_block(
        &mut self,
        receiver: Value,
        mid: Sym,
        args: &[Value],
        blk: Value,
    ) -> VmResult<Value> {
        let entry_ctx = self.cur;
        let entry_depth = self.ctx().ci.len();
        let result = self.funcall_inner(receiver, mid, args, blk);
        if result.is_err() {
            if self.cur != entry_ctx && self.contexts.get(entry_ctx).map(|c| c.is_some()) == Some(true)
            {
                self.cur = entry_ctx;
            }
            while self.ctx().ci.len() > entry_depth {
                let ent = self.ctx().ci().stackent;
                self.ctx_mut().stack_base = ent;
                self.cipop();
            }
        }
        result
    }

    fn funcall_inner(
        &mut self,
        receiver: Value,
        mut mid: Sym,
        args: &[Value],
        blk: Value,
    ) -> VmResult<Value> {
        if self.ctx().ci.len() > FUNCALL_DEPTH_MAX {
            return Err(VmError::raise(Value::Obj(self.stack_err)));
        }
        let n = self.ci_nregs(self.ctx().ci());
        let cls = self.class_of(receiver);

        let mut packed: Option<ObjId> = None;
        let (node, m) = match self.method_search_vm(cls, mid) {
            Some(found) => found,
            None => {
                let missing = self.intern("method_missing");
                match self.method_search_vm(cls, missing) {
                    Some(found) => {
                        let ary = self.ary_new_from(args.to_vec())?;
                        self.ary_unshift(ary, Value::Symbol(mid))?;
                        packed = Some(ary);
                        mid = missing;
                        found
                    }
                    None => {
                        return Err(self.nomethod_error(mid, receiver));
                    }
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
            ci.argc = args.len() as i32;
        }
        self.ctx_mut().stack_base = caller_base + n;

        // lay out self / args / block in the callee frame
        let is_native = matches!(m, Method::Native(_))
            || matches!(m, Method::Proc(p) if self.proc_has_flag(p, ObjFlags::PROC_CFUNC));
        let (argc, blk_idx) = if let Some(ary) = packed {
            self.ctx_mut().ci_mut().argc = -1;
            self.stack_extend(3)?;
            self.set_reg(1, Value::Obj(ary));
            (1usize, 2usize)
        } else if !is_native && args.len() >= CALL_MAXARGS {
            let ary = self.ary_new_from(args.to_vec())?;
            self.ctx_mut().ci_mut().argc = -1;
            self.stack_extend(3)?;
            self.set_reg(1, Value::Obj(ary));
            (1, 2)
        } else {
            let room = if is_native {
                args.len() + 2
            } else {
                let nregs = match m {
                    Method::Proc(p) => self
                        .proc_irep(p)
                        .map(|i| i.nregs as usize)
                        .unwrap_or(args.len() + 2),
                    _ => args.len() + 2,
                };
                nregs.max(args.len() + 2)
            };
            self.stack_extend(room)?;
            for (i, &a) in args.iter().enumerate() {
                self.set_reg(i + 1, a);
            }
            (args.len(), args.len() + 1)
        };
        debug_assert!(argc <= CALL_MAXARGS || is_native);
        self.set_reg(0, receiver);
        self.set_reg(blk_idx, blk);

        match (m, is_native) {
            (Method::Native(f), _) => self.funcall_native(f, receiver, None),
            (Method::Proc(p), true) => {
                let f = self.proc_native(p).expect("cfunc proc");
                self.funcall_native(f, receiver, Some(p))
            }
            (Method::Proc(p), false) => {
                {
                    let ci = self.ctx_mut().ci_mut();
                    ci.proc = Some(p);
                    ci.acc = ACC_SKIP;
                }
                self.vm_exec(p, 0)
            }
            (Method::Undef, _) => Err(self.nomethod_error(mid, receiver)),
        }
    }

    /// Runs a native method pushed by `funcall`, handling a context switch
    /// performed by the native (fiber resume/yield).
    fn funcall_native(
        &mut self,
        f: NativeFn,
        receiver: Value,
        proc_id: Option<ObjId>,
    ) -> VmResult<Value> {
        let entry_ctx = self.cur;
        {
            let ci = self.ctx_mut().ci_mut();
            ci.acc = ACC_RESUMED;
            ci.proc = proc_id;
        }
        let ai = self.arena_save();
        let r = f(self, receiver);
        self.arena_restore(ai);
        let v = r?;
        if let Some(e) = self.exc.take() {
            return Err(VmError::raise(Value::Obj(e)));
        }
        if self.cur != entry_ctx {
            // the native switched fibers; drive the VM until control comes
            // back to this boundary
            let v = self.continue_switched(v)?;
            // back on the entry context with our frame on top
            let ent = self.ctx().ci().stackent;
            self.ctx_mut().stack_base = ent;
            self.cipop();
            return Ok(v);
        }
        let ent = self.ctx().ci().stackent;
        self.ctx_mut().stack_base = ent;
        self.cipop();
        Ok(v)
    }

    /// After a native performed a fiber switch: enter the switched context
    /// the way the dispatch loop would, and run until the host boundary
    /// (the `ACC_RESUMED` frame) is reached again.
    fn continue_switched(&mut self, v: Value) -> VmResult<Value> {
        let ci = self.ctx().ci().clone();
        debug_assert!(ci.target_class.is_none());
        let below = self.ctx().ci[self.ctx().ci.len() - 2]
            .proc
            .expect("switched context frame");
        let base = self.ctx().stack_base;
        let c = self.ctx_mut();
        if base < c.stack.len() {
            c.stack[base] = v;
        }
        self.ctx_mut().stack_base = ci.stackent;
        let pc = ci.pc.unwrap_or(0);
        self.cipop();
        self.vm_exec(below, pc)
    }

    // ---- run entry points ----

    /// Runs a proc as the body of the current frame.
    pub(crate) fn vm_run(&mut self, p: ObjId, self_val: Value, stack_keep: usize) -> VmResult<Value> {
        let irep = self
            .proc_irep(p)
            .ok_or_else(|| VmError::script("cannot run a native proc directly"))?;
        let nregs = irep.nregs as usize;
        if stack_keep > nregs {
            self.stack_extend(stack_keep)?;
        } else {
            self.stack_extend(nregs)?;
            let base = self.ctx().stack_base;
            let c = self.ctx_mut();
            for i in stack_keep..nregs {
                c.stack[base + i] = Value::Nil;
            }
        }
        self.set_reg(0, self_val);
        self.vm_exec(p, 0)
    }

    /// Runs a top-level proc against `top_self`.
    pub(crate) fn top_run(&mut self, p: ObjId) -> VmResult<Value> {
        let top = Value::Obj(self.top_self);
        if self.ctx().ci.len() == 1 {
            {
                let oc = self.object_class;
                let ci = self.ctx_mut().ci_mut();
                ci.proc = Some(p);
                ci.target_class = Some(oc);
                ci.stackent = 0;
            }
            return self.vm_run(p, top, 0);
        }
        self.cipush();
        let base = self.ctx().stack_base;
        {
            let oc = self.object_class;
            let ci = self.ctx_mut().ci_mut();
            ci.proc = Some(p);
            ci.target_class = Some(oc);
            ci.stackent = base;
            ci.acc = ACC_SKIP;
        }
        let r = self.vm_run(p, top, 0);
        if self.ctx().ci.len() > 1 {
            let ent = self.ctx().ci().stackent;
            self.ctx_mut().stack_base = ent;
            self.cipop();
        }
        r
    }

    /// Raises a NoMethodError for a failed resolution.
    pub(crate) fn nomethod_error(&mut self, mid: Sym, receiver: Value) -> VmError {
        let cls = self.class_of(receiver);
        VmError::no_method(format!(
            "undefined method '{}' for {}",
            self.symbols.name(mid),
            self.class_name(cls)
        ))
    }

    /// Converts a non-proc block argument via `to_proc`.
    pub(crate) fn convert_to_proc(&mut self, v: Value) -> VmResult<Value> {
        let converted = self.funcall(v, "to_proc", &[])?;
        if self.vtype(converted) != Vtype::Proc {
            return Err(VmError::type_error("can't convert to Proc"));
        }
        Ok(converted)
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("live", &self.gc.live)
            .field("contexts", &self.contexts.len())
            .field("symbols", &self.symbols.len())
            .field("pending_exception", &self.exc.is_some())
            .finish()
    }
}
