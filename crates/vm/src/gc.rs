//! Tri-color incremental garbage collector.
//!
//! Two whites flip-flop each cycle: newly allocated objects wear the
//! current white, and anything still wearing the other white when the sweep
//! reaches it is dead. Gray objects wait on an intrusive list threaded
//! through the object headers; the atomic-gray list holds objects re-grayed
//! by the backward write barrier, drained in one go during final marking.
//! The state machine is ROOT -> MARK -> SWEEP -> ROOT, advanced a bounded
//! number of mark units at a time from allocation sites.
//!
//! In generational mode survivors stay black ("old") after a minor cycle;
//! minor cycles then only traverse barrier-generated grays and sweep pages
//! that still hold young objects. A major cycle is forced when the live
//! count outgrows `majorgc_old_threshold`.

use crate::context::{CtxId, FiberStatus};
use crate::error::{VmError, VmResult};
use crate::heap::HEAP_PAGE_SIZE;
use crate::object::ObjBody;
use crate::value::{ObjId, Value, Vtype};
use crate::vm::Vm;

pub const GC_GRAY: u8 = 0;
pub const GC_WHITE_A: u8 = 1;
pub const GC_WHITE_B: u8 = 2;
pub const GC_WHITES: u8 = GC_WHITE_A | GC_WHITE_B;
pub const GC_BLACK: u8 = 4;

/// Mark units processed per incremental step, scaled by `step_ratio`.
pub const GC_STEP_SIZE: usize = 1024;
const DEFAULT_GC_INTERVAL_RATIO: usize = 200;
const DEFAULT_GC_STEP_RATIO: usize = 200;
const MAJOR_GC_INC_RATIO: usize = 120;
const MAJOR_GC_TOOMANY: usize = 10000;

/// Arena capacity: initial for the growable default, hard under
/// `fixed-arena`.
pub const GC_ARENA_SIZE: usize = 100;

/// Collector phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Root,
    Mark,
    Sweep,
}

/// Collector state, owned by the VM.
#[derive(Debug)]
pub struct Gc {
    pub(crate) state: GcState,
    current_white_part: u8,
    pub(crate) gray_list: Option<ObjId>,
    pub(crate) atomic_gray_list: Option<ObjId>,
    pub(crate) live: usize,
    live_after_mark: usize,
    pub(crate) threshold: usize,
    pub(crate) interval_ratio: usize,
    pub(crate) step_ratio: usize,
    pub(crate) disabled: bool,
    pub(crate) iterating: bool,
    pub(crate) full: bool,
    pub(crate) generational: bool,
    pub(crate) out_of_memory: bool,
    majorgc_old_threshold: usize,
    /// Sweep cursor: next page index to examine.
    sweeps: usize,
    /// Bounded stack of temporary roots.
    pub(crate) arena: Vec<ObjId>,
}

impl Gc {
    pub fn new() -> Self {
        Self {
            state: GcState::Root,
            current_white_part: GC_WHITE_A,
            gray_list: None,
            atomic_gray_list: None,
            live: 0,
            live_after_mark: 0,
            threshold: GC_STEP_SIZE,
            interval_ratio: DEFAULT_GC_INTERVAL_RATIO,
            step_ratio: DEFAULT_GC_STEP_RATIO,
            disabled: false,
            iterating: false,
            full: false,
            generational: true,
            out_of_memory: false,
            majorgc_old_threshold: 0,
            sweeps: 0,
            arena: Vec::with_capacity(GC_ARENA_SIZE),
        }
    }

    pub(crate) fn current_white(&self) -> u8 {
        self.current_white_part
    }

    fn other_white(&self) -> u8 {
        self.current_white_part ^ GC_WHITES
    }

    fn flip_white(&mut self) {
        self.current_white_part = self.other_white();
    }

    fn is_minor(&self) -> bool {
        self.generational && !self.full
    }

    fn is_major(&self) -> bool {
        self.generational && self.full
    }
}

impl Default for Gc {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    // ---- color predicates ----

    fn is_black(&self, o: ObjId) -> bool {
        self.heap.header(o).color & GC_BLACK != 0
    }

    fn is_white(&self, o: ObjId) -> bool {
        self.heap.header(o).color & GC_WHITES != 0
    }

    fn is_gray(&self, o: ObjId) -> bool {
        self.heap.header(o).color == GC_GRAY
    }

    fn is_dead(&self, o: ObjId) -> bool {
        let h = self.heap.header(o);
        h.color & self.gc.other_white() != 0 && h.tt != Vtype::Free
    }

    fn paint_partial_white(&mut self, o: ObjId) {
        self.heap.header_mut(o).color = self.gc.current_white();
    }

    fn add_gray_list(&mut self, o: ObjId) {
        self.heap.header_mut(o).color = GC_GRAY;
        self.heap.header_mut(o).gc_next = self.gc.gray_list;
        self.gc.gray_list = Some(o);
    }

    // ---- allocation ----

    /// Allocates a heap object: advances the GC when past the threshold,
    /// pulls a slot, paints it the current white, and roots it in the
    /// arena. Raises the pre-allocated `NoMemoryError` when a full GC
    /// cannot make room.
    pub fn obj_alloc(
        &mut self,
        tt: Vtype,
        cls: Option<ObjId>,
        body: ObjBody,
    ) -> VmResult<ObjId> {
        if let Some(c) = cls {
            match self.heap.header(c).tt {
                Vtype::Class | Vtype::SClass | Vtype::Module | Vtype::IClass | Vtype::Env => {}
                _ => return Err(VmError::type_error("allocation failure")),
            }
        }
        if self.gc.threshold < self.gc.live && !self.gc.disabled {
            self.incremental_gc_entry();
        }
        let id = match self.alloc_slot_simple() {
            Some(id) => id,
            None => {
                // starved: full GC, then one more attempt
                self.full_gc();
                match self.alloc_slot_simple() {
                    Some(id) => id,
                    None => {
                        self.gc.out_of_memory = true;
                        return Err(VmError::raise(Value::Obj(self.nomem_err)));
                    }
                }
            }
        };
        self.gc.live += 1;
        self.gc_protect_obj(id)?;
        let white = self.gc.current_white();
        let slot = self.heap.slot_mut(id);
        slot.header.tt = tt;
        slot.header.cls = cls;
        slot.header.gc_next = None;
        slot.header.color = white;
        slot.body = body;
        Ok(id)
    }

    /// The non-raising allocator: returns `None` instead of collecting or
    /// raising (used where GC reentry must be avoided).
    pub(crate) fn alloc_slot_simple(&mut self) -> Option<ObjId> {
        if !self.heap.has_free_slot() && self.heap.add_page().is_none() {
            return None;
        }
        self.heap.alloc_raw()
    }

    // ---- arena ----

    /// Records the arena top; restore with [`Vm::arena_restore`].
    pub fn arena_save(&self) -> usize {
        self.gc.arena.len()
    }

    /// Drops transient roots above a saved arena top.
    pub fn arena_restore(&mut self, idx: usize) {
        self.gc.arena.truncate(idx);
    }

    fn gc_protect_obj(&mut self, o: ObjId) -> VmResult<()> {
        #[cfg(feature = "fixed-arena")]
        {
            if self.gc.arena.len() >= GC_ARENA_SIZE {
                // force room so raising the pre-allocated error is safe
                self.gc.arena.truncate(GC_ARENA_SIZE - 4);
                return Err(VmError::raise(Value::Obj(self.arena_err)));
            }
        }
        self.gc.arena.push(o);
        Ok(())
    }

    /// Roots a value in the arena for the duration of the current
    /// save/restore window.
    pub fn gc_protect(&mut self, v: Value) -> VmResult<()> {
        match v {
            Value::Obj(o) => self.gc_protect_obj(o),
            _ => Ok(()),
        }
    }

    /// Keeps an object alive indefinitely via the hidden root table.
    pub fn gc_register(&mut self, v: Value) -> VmResult<()> {
        let root = self.intern("_gc_root_");
        let table = match self.globals.get(&root) {
            Some(&Value::Obj(o)) if self.is_array_obj(o) => o,
            _ => {
                let t = self.ary_new()?;
                self.globals.insert(root, Value::Obj(t));
                t
            }
        };
        self.ary_push(table, v)
    }

    /// Removes an object from the hidden root table.
    pub fn gc_unregister(&mut self, v: Value) {
        let root = self.intern("_gc_root_");
        if let Some(&Value::Obj(o)) = self.globals.get(&root) {
            if let ObjBody::Array(items) = self.heap.body_mut(o) {
                if let Some(pos) = items.iter().position(|&x| x == v) {
                    items.remove(pos);
                }
            }
        }
    }

    fn is_array_obj(&self, o: ObjId) -> bool {
        matches!(self.heap.body(o), ObjBody::Array(_))
    }

    // ---- write barriers ----

    /// Field write barrier: a black holder gaining a white reference grays
    /// the referent during MARK, or re-whitens the holder during SWEEP so
    /// the mutation is re-traversed next cycle.
    pub(crate) fn field_write_barrier(&mut self, obj: ObjId, val: Value) {
        let Some(v) = val.obj() else { return };
        if !self.is_black(obj) {
            return;
        }
        if !self.is_white(v) {
            return;
        }
        if self.gc.generational || self.gc.state == GcState::Mark {
            self.add_gray_list(v);
        } else {
            debug_assert_eq!(self.gc.state, GcState::Sweep);
            self.paint_partial_white(obj);
        }
    }

    /// Backward write barrier: re-grays the holder onto the atomic-gray
    /// list, re-traversed in final marking. For densely mutated objects
    /// (array stores, env writes).
    pub(crate) fn write_barrier(&mut self, obj: ObjId) {
        if !self.is_black(obj) {
            return;
        }
        self.heap.header_mut(obj).color = GC_GRAY;
        self.heap.header_mut(obj).gc_next = self.gc.atomic_gray_list;
        self.gc.atomic_gray_list = Some(obj);
    }

    // ---- marking ----

    /// Grays a white object.
    pub(crate) fn gc_mark(&mut self, o: ObjId) {
        if !self.is_white(o) {
            return;
        }
        debug_assert!(self.heap.header(o).tt != Vtype::Free);
        self.add_gray_list(o);
    }

    fn gc_mark_value(&mut self, v: Value) {
        if let Value::Obj(o) = v {
            self.gc_mark(o);
        }
    }

    fn gc_mark_opt(&mut self, o: Option<ObjId>) {
        if let Some(o) = o {
            self.gc_mark(o);
        }
    }

    /// Pops `o` from the gray list, paints it black, and grays its
    /// children. Returns the child count as the mark-unit cost.
    fn gc_mark_children(&mut self, o: ObjId) -> usize {
        debug_assert!(self.is_gray(o));
        self.heap.header_mut(o).color = GC_BLACK;
        self.gc.gray_list = self.heap.header(o).gc_next;

        let mut children: Vec<Value> = Vec::new();
        if let Some(c) = self.heap.header(o).cls {
            children.push(Value::Obj(c));
        }
        let mut fiber_ctx: Option<CtxId> = None;
        match self.heap.body(o) {
            ObjBody::Class(c) => {
                for (_, m) in c.mt.iter() {
                    if let crate::class::Method::Proc(p) = m {
                        children.push(Value::Obj(p));
                    }
                }
                for (_, v) in c.iv.iter() {
                    children.push(v);
                }
                if let Some(s) = c.super_ {
                    children.push(Value::Obj(s));
                }
            }
            ObjBody::IClass(i) => {
                if let Some(mt) = &i.mt {
                    for (_, m) in mt.iter() {
                        if let crate::class::Method::Proc(p) = m {
                            children.push(Value::Obj(p));
                        }
                    }
                }
                if let Some(s) = i.super_ {
                    children.push(Value::Obj(s));
                }
            }
            ObjBody::Object { iv } | ObjBody::Exception { iv } | ObjBody::Data { iv } => {
                for (_, v) in iv.iter() {
                    children.push(v);
                }
            }
            ObjBody::Proc(p) => {
                if let Some(u) = p.upper {
                    children.push(Value::Obj(u));
                }
                if let Some(e) = p.env() {
                    children.push(Value::Obj(e));
                }
            }
            ObjBody::Env(env) => {
                let len = env.len();
                let cxt = env.cxt;
                let shared = env.is_shared();
                for i in 0..len {
                    children.push(self.env_get(o, i));
                }
                if shared {
                    if let Some(Some(c)) = self.contexts.get(cxt) {
                        if let Some(f) = c.fib {
                            children.push(Value::Obj(f));
                        }
                    }
                }
            }
            ObjBody::Fiber { cxt } => {
                fiber_ctx = *cxt;
            }
            ObjBody::Array(items) => {
                children.extend(items.iter().copied());
            }
            ObjBody::Hash(h) => {
                for &(k, v) in &h.entries {
                    children.push(k);
                    children.push(v);
                }
            }
            ObjBody::Range(r) => {
                children.push(r.beg);
                children.push(r.end);
            }
            ObjBody::Break { target, val } => {
                children.push(Value::Obj(*target));
                children.push(*val);
            }
            ObjBody::Str(_) | ObjBody::Free { .. } => {}
        }
        let mut count = children.len();
        for v in children {
            self.gc_mark_value(v);
        }
        if let Some(c) = fiber_ctx {
            count += self.gc_mark_context(c);
        }
        count
    }

    /// Marks a fiber context: the live stack region, every call-info's
    /// proc/env/target class, the ensure stack, and the previous context
    /// chain. Returns an approximate mark-unit cost.
    fn gc_mark_context(&mut self, start: CtxId) -> usize {
        let mut count = 0usize;
        let mut next = Some(start);
        while let Some(id) = next {
            let (values, prev) = {
                let Some(Some(c)) = self.contexts.get(id) else {
                    break;
                };
                if c.status == FiberStatus::Terminated {
                    break;
                }
                let mut vals: Vec<Value> = Vec::new();
                // live stack region
                let mut live = c.stack_base + self.ci_nregs(c.ci());
                if live > c.stack.len() {
                    live = c.stack.len();
                }
                vals.extend(c.stack[..live].iter().copied());
                for ci in &c.ci {
                    if let Some(e) = ci.env {
                        vals.push(Value::Obj(e));
                    }
                    if let Some(p) = ci.proc {
                        vals.push(Value::Obj(p));
                    }
                    if let Some(t) = ci.target_class {
                        vals.push(Value::Obj(t));
                    }
                }
                for e in c.ensure.iter().flatten() {
                    vals.push(Value::Obj(*e));
                }
                if let Some(f) = c.fib {
                    vals.push(Value::Obj(f));
                }
                (vals, c.prev)
            };
            // clear the dead region above the live stack
            {
                let live = {
                    let c = self.ctx_at(id);
                    (c.stack_base + self.ci_nregs(c.ci())).min(c.stack.len())
                };
                let c = self.ctx_at_mut(id);
                for v in c.stack[live..].iter_mut() {
                    *v = Value::Nil;
                }
            }
            count += values.len();
            for v in values {
                self.gc_mark_value(v);
            }
            next = prev;
        }
        count
    }

    fn root_scan_phase(&mut self) {
        if !self.gc.is_minor() {
            self.gc.gray_list = None;
            self.gc.atomic_gray_list = None;
        }
        // global variables and special variables
        let globals: Vec<Value> = self.globals.values().copied().collect();
        for v in globals {
            self.gc_mark_value(v);
        }
        let specials: Vec<Value> = self.specials.clone();
        for v in specials {
            self.gc_mark_value(v);
        }
        // arena
        let arena = self.gc.arena.clone();
        for o in arena {
            self.gc_mark(o);
        }
        // built-in classes
        let classes = [
            self.basic_object_class,
            self.object_class,
            self.class_class,
            self.module_class,
            self.proc_class,
            self.string_class,
            self.array_class,
            self.hash_class,
            self.range_class,
            self.float_class,
            self.fixnum_class,
            self.true_class,
            self.false_class,
            self.nil_class,
            self.symbol_class,
            self.kernel_module,
            self.exception_class,
            self.standard_error_class,
            self.fiber_class,
            self.top_self,
            self.nomem_err,
            self.stack_err,
        ];
        for c in classes {
            self.gc_mark(c);
        }
        #[cfg(feature = "fixed-arena")]
        {
            let e = self.arena_err;
            self.gc_mark(e);
        }
        // method-cache entries are roots: a hit must never resurrect a
        // swept class
        #[cfg(feature = "method-cache")]
        {
            let entries: Vec<_> = self.cache.iter().flatten().copied().collect();
            for e in entries {
                self.gc_mark(e.cls);
                self.gc_mark(e.node);
                if let crate::class::Method::Proc(p) = e.method {
                    self.gc_mark(p);
                }
            }
        }
        // pending / in-flight exceptions
        self.gc_mark_opt(self.exc);
        self.gc_mark_opt(self.caught);
        // execution contexts
        self.gc_mark_context(self.cur);
        if self.root != self.cur {
            self.gc_mark_context(self.root);
        }
    }

    fn gc_mark_gray_list(&mut self) {
        while let Some(o) = self.gc.gray_list {
            if self.is_gray(o) {
                self.gc_mark_children(o);
            } else {
                self.gc.gray_list = self.heap.header(o).gc_next;
            }
        }
    }

    fn incremental_marking_phase(&mut self, limit: usize) -> usize {
        let mut tried = 0;
        while self.gc.gray_list.is_some() && tried < limit {
            let o = self.gc.gray_list.unwrap();
            tried += self.gc_mark_children(o).max(1);
        }
        tried
    }

    /// Atomic re-scan: roots again, drain the gray list, then promote and
    /// drain the atomic-gray list.
    fn final_marking_phase(&mut self) {
        let arena = self.gc.arena.clone();
        for o in arena {
            self.gc_mark(o);
        }
        let globals: Vec<Value> = self.globals.values().copied().collect();
        for v in globals {
            self.gc_mark_value(v);
        }
        self.gc_mark_context(self.cur);
        if self.root != self.cur {
            self.gc_mark_context(self.root);
        }
        self.gc_mark_opt(self.exc);
        self.gc_mark_opt(self.caught);
        self.gc_mark_gray_list();
        debug_assert!(self.gc.gray_list.is_none());
        self.gc.gray_list = self.gc.atomic_gray_list.take();
        self.gc_mark_gray_list();
        debug_assert!(self.gc.gray_list.is_none());
    }

    fn prepare_incremental_sweep(&mut self) {
        self.gc.state = GcState::Sweep;
        self.gc.sweeps = 0;
        self.gc.live_after_mark = self.gc.live;
    }

    // ---- sweeping ----

    fn incremental_sweep_phase(&mut self, limit: usize) -> usize {
        let mut tried = 0usize;
        let mut page_idx = self.gc.sweeps;
        let minor = self.gc.is_minor();
        while page_idx < self.heap.pages_len() && tried < limit {
            let (exists, full, old) = match self.heap.page(page_idx) {
                Some(p) => (true, p.freelist.is_none(), p.old),
                None => (false, false, false),
            };
            if !exists {
                page_idx += 1;
                continue;
            }
            let mut freed = 0usize;
            let mut dead_slot = true;
            if minor && old {
                // no young object on this page; skip it wholesale
                dead_slot = false;
            } else {
                for s in 0..HEAP_PAGE_SIZE {
                    let id = ObjId((page_idx * HEAP_PAGE_SIZE + s) as u32);
                    let tt = self.heap.header(id).tt;
                    if tt == Vtype::Free {
                        continue;
                    }
                    if self.is_dead(id) {
                        self.obj_free(id, false);
                        self.heap.free_raw(id);
                        freed += 1;
                    } else {
                        if !self.gc.generational {
                            self.paint_partial_white(id);
                        }
                        dead_slot = false;
                    }
                }
            }
            if dead_slot && freed < HEAP_PAGE_SIZE && self.heap.live_pages() > 1 {
                log::debug!("gc: releasing empty heap page {page_idx}");
                self.heap.release_page(page_idx as u32);
            } else {
                if full && freed > 0 {
                    self.heap.link_free_page(page_idx as u32);
                }
                if let Some(p) = self.heap.page_mut(page_idx) {
                    p.old = p.freelist.is_none() && minor;
                }
            }
            tried += HEAP_PAGE_SIZE;
            self.gc.live -= freed;
            self.gc.live_after_mark -= freed.min(self.gc.live_after_mark);
            page_idx += 1;
        }
        self.gc.sweeps = page_idx;
        tried
    }

    /// Frees an object's out-of-band resources before its slot is recycled.
    fn obj_free(&mut self, id: ObjId, end: bool) {
        if let ObjBody::Fiber { cxt: Some(c) } = self.heap.body(id) {
            let c = *c;
            if c != self.root && c != self.cur {
                let terminated = self
                    .contexts
                    .get(c)
                    .and_then(|x| x.as_ref())
                    .map(|x| x.status == FiberStatus::Terminated)
                    .unwrap_or(true);
                if !end && !terminated {
                    // envs still sharing this stack must be copied out
                    let envs: Vec<ObjId> = self
                        .ctx_at(c)
                        .ci
                        .iter()
                        .filter_map(|ci| ci.env)
                        .collect();
                    for e in envs {
                        if !self.is_dead(e) && self.heap.header(e).tt == Vtype::Env {
                            self.env_unshare(e);
                        }
                    }
                }
                self.contexts[c] = None;
            }
        }
    }

    // ---- cycle control ----

    fn incremental_gc(&mut self, limit: usize) -> usize {
        match self.gc.state {
            GcState::Root => {
                self.root_scan_phase();
                self.gc.state = GcState::Mark;
                self.gc.flip_white();
                0
            }
            GcState::Mark => {
                if self.gc.gray_list.is_some() {
                    self.incremental_marking_phase(limit)
                } else {
                    self.final_marking_phase();
                    self.prepare_incremental_sweep();
                    0
                }
            }
            GcState::Sweep => {
                let tried = self.incremental_sweep_phase(limit);
                if tried == 0 {
                    self.gc.state = GcState::Root;
                }
                tried
            }
        }
    }

    fn incremental_gc_until(&mut self, to_state: GcState) {
        loop {
            self.incremental_gc(usize::MAX);
            if self.gc.state == to_state {
                break;
            }
        }
    }

    fn incremental_gc_step(&mut self) {
        let limit = (GC_STEP_SIZE / 100) * self.gc.step_ratio;
        let mut result = 0;
        while result < limit {
            result += self.incremental_gc(limit).max(1);
            if self.gc.state == GcState::Root {
                break;
            }
        }
        self.gc.threshold = self.gc.live + GC_STEP_SIZE;
    }

    /// Sweeps everything back to young, re-establishing generational
    /// invariants (used when toggling modes and before a major cycle).
    fn clear_all_old(&mut self) {
        debug_assert!(self.gc.generational);
        let origin = self.gc.generational;
        if self.gc.is_major() {
            // finish the half-baked cycle first
            self.incremental_gc_until(GcState::Root);
        }
        self.gc.generational = false;
        self.prepare_incremental_sweep();
        self.incremental_gc_until(GcState::Root);
        self.gc.generational = origin;
        self.gc.gray_list = None;
        self.gc.atomic_gray_list = None;
    }

    /// One threshold-driven GC advance: a whole minor cycle in generational
    /// mode, one bounded step otherwise.
    pub(crate) fn incremental_gc_entry(&mut self) {
        if self.gc.disabled || self.gc.iterating {
            return;
        }
        if self.gc.is_minor() {
            self.incremental_gc_until(GcState::Root);
        } else {
            self.incremental_gc_step();
        }
        if self.gc.state == GcState::Root {
            debug_assert!(self.gc.live >= self.gc.live_after_mark);
            self.gc.threshold =
                ((self.gc.live_after_mark / 100) * self.gc.interval_ratio).max(GC_STEP_SIZE);
            if self.gc.is_major() {
                let threshold = self.gc.live_after_mark / 100 * MAJOR_GC_INC_RATIO;
                self.gc.full = false;
                if threshold < MAJOR_GC_TOOMANY {
                    self.gc.majorgc_old_threshold = threshold;
                } else {
                    // too much allocated during the incremental cycle
                    self.full_gc();
                }
            } else if self.gc.is_minor() && self.gc.live > self.gc.majorgc_old_threshold {
                log::debug!("gc: promoting to major cycle (live={})", self.gc.live);
                self.clear_all_old();
                self.gc.full = true;
            }
        }
    }

    /// Runs a complete GC cycle immediately.
    pub fn full_gc(&mut self) {
        if self.gc.disabled || self.gc.iterating {
            return;
        }
        log::debug!("gc: full cycle (live={})", self.gc.live);
        if self.gc.generational {
            self.clear_all_old();
            self.gc.full = true;
        } else if self.gc.state != GcState::Root {
            self.incremental_gc_until(GcState::Root);
        }
        self.incremental_gc_until(GcState::Root);
        self.gc.threshold = (self.gc.live_after_mark / 100) * self.gc.interval_ratio;
        if self.gc.generational {
            self.gc.majorgc_old_threshold = self.gc.live_after_mark / 100 * MAJOR_GC_INC_RATIO;
            self.gc.full = false;
        }
    }

    /// `GC.start`.
    pub fn garbage_collect(&mut self) {
        self.full_gc();
    }

    /// Live object count.
    pub fn gc_live(&self) -> usize {
        self.gc.live
    }

    /// Enables collection; returns the previous disabled state.
    pub fn gc_enable(&mut self) -> bool {
        std::mem::replace(&mut self.gc.disabled, false)
    }

    /// Disables collection; returns the previous disabled state.
    pub fn gc_disable(&mut self) -> bool {
        std::mem::replace(&mut self.gc.disabled, true)
    }

    /// Whether generational mode is on.
    pub fn gc_generational(&self) -> bool {
        self.gc.generational
    }

    /// Toggles generational mode; forces the cycle work needed to
    /// re-establish invariants.
    pub fn gc_set_generational(&mut self, enable: bool) {
        if self.gc.generational == enable {
            return;
        }
        if self.gc.generational {
            self.clear_all_old();
            self.gc.generational = false;
            self.gc.full = false;
        } else {
            self.incremental_gc_until(GcState::Root);
            self.gc.generational = true;
            self.gc.majorgc_old_threshold = self.gc.live_after_mark / 100 * MAJOR_GC_INC_RATIO;
            self.gc.full = false;
        }
    }

    /// GC interval ratio (percent of the live set added to the threshold).
    pub fn gc_interval_ratio(&self) -> usize {
        self.gc.interval_ratio
    }

    pub fn gc_set_interval_ratio(&mut self, ratio: usize) {
        self.gc.interval_ratio = ratio;
    }

    /// GC step ratio (percent of `GC_STEP_SIZE` worked per step).
    pub fn gc_step_ratio(&self) -> usize {
        self.gc.step_ratio
    }

    pub fn gc_set_step_ratio(&mut self, ratio: usize) {
        self.gc.step_ratio = ratio;
    }

    /// Tears down every heap object at VM close.
    pub(crate) fn gc_free_all(&mut self) {
        for page_idx in 0..self.heap.pages_len() {
            if self.heap.page(page_idx).is_none() {
                continue;
            }
            for s in 0..HEAP_PAGE_SIZE {
                let id = ObjId((page_idx * HEAP_PAGE_SIZE + s) as u32);
                if self.heap.header(id).tt != Vtype::Free {
                    self.obj_free(id, true);
                    self.heap.free_raw(id);
                }
            }
        }
        self.gc.live = 0;
    }
}
