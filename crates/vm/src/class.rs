//! Class and module model: method tables, the iclass super chain, singleton
//! classes, and method resolution.
//!
//! Module inclusion splices proxy nodes (iclass) into the super chain; the
//! proxy's header class slot is the wrapped module and its method table is
//! read through that module, so methods defined on a module after inclusion
//! are visible immediately. Prepending interposes an origin node that takes
//! over the class's own method table. Lookup walks the chain linearly, with
//! an optional direct-mapped cache in front.

use crate::error::{VmError, VmResult};
use crate::ivtable::IvTable;
use crate::object::{ObjBody, ObjFlags};
use crate::procs::NativeFn;
use crate::symbol::Sym;
use crate::value::{ObjId, Value, Vtype};
use crate::vm::Vm;
use hashbrown::HashMap;

/// Method-cache entries; must be a power of two.
#[cfg(feature = "method-cache")]
pub const METHOD_CACHE_SIZE: usize = 256;

/// A resolved method entry: a proc (bytecode or native closure), a bare
/// native function, or the undef sentinel that stops lookup cold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Method {
    Proc(ObjId),
    Native(NativeFn),
    /// `undef_method` tombstone: aborts the super walk as "not found".
    Undef,
}

/// Symbol -> method map owned by a class (or an origin node).
#[derive(Debug, Default)]
pub struct MethodTable {
    map: HashMap<Sym, Method>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, mid: Sym) -> Option<Method> {
        self.map.get(&mid).copied()
    }

    pub fn insert(&mut self, mid: Sym, m: Method) {
        self.map.insert(mid, m);
    }

    pub fn remove(&mut self, mid: Sym) -> Option<Method> {
        self.map.remove(&mid)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Sym, Method)> + '_ {
        self.map.iter().map(|(&k, &v)| (k, v))
    }
}

/// Class, module, or singleton-class payload.
#[derive(Debug)]
pub struct RClass {
    pub super_: Option<ObjId>,
    pub mt: MethodTable,
    /// Constants, class variables, and class-level ivars.
    pub iv: IvTable,
    /// The value kind instances of this class are created with.
    pub instance_tt: Vtype,
}

/// Included-module proxy node. The wrapped module is the node's header
/// class slot; `mt` is owned only by origin nodes (prepend support).
#[derive(Debug)]
pub struct RIClass {
    pub super_: Option<ObjId>,
    pub mt: Option<MethodTable>,
}

#[cfg(feature = "method-cache")]
#[derive(Debug, Clone, Copy)]
pub(crate) struct CacheEntry {
    pub cls: ObjId,
    pub mid: Sym,
    /// Chain node the method was found on.
    pub node: ObjId,
    pub method: Method,
}

#[cfg(feature = "method-cache")]
pub(crate) fn cache_slot(cls: ObjId, mid: Sym) -> usize {
    let mut key = [0u8; 8];
    key[..4].copy_from_slice(&cls.0.to_le_bytes());
    key[4..].copy_from_slice(&mid.id().to_le_bytes());
    xxhash_rust::xxh3::xxh3_64(&key) as usize & (METHOD_CACHE_SIZE - 1)
}

impl Vm {
    /// The class of a value. Immediates map to the classes fixed at VM init.
    pub fn class_of(&self, v: Value) -> ObjId {
        match v {
            Value::Nil => self.nil_class,
            Value::False => self.false_class,
            Value::True => self.true_class,
            Value::Fixnum(_) => self.fixnum_class,
            Value::Float(_) => self.float_class,
            Value::Symbol(_) => self.symbol_class,
            Value::Undef => self.nil_class,
            Value::Obj(o) => self.heap.header(o).cls.unwrap_or(self.object_class),
        }
    }

    /// Skips singleton and proxy nodes to the first real class.
    pub fn real_class(&self, mut cls: ObjId) -> ObjId {
        loop {
            match self.heap.header(cls).tt {
                Vtype::SClass | Vtype::IClass => {
                    cls = match self.node_super(cls) {
                        Some(s) => s,
                        None => return cls,
                    };
                }
                _ => return cls,
            }
        }
    }

    /// Super link of a chain node.
    pub fn node_super(&self, node: ObjId) -> Option<ObjId> {
        match self.heap.body(node) {
            ObjBody::Class(c) => c.super_,
            ObjBody::IClass(i) => i.super_,
            _ => None,
        }
    }

    fn set_node_super(&mut self, node: ObjId, sup: Option<ObjId>) {
        match self.heap.body_mut(node) {
            ObjBody::Class(c) => c.super_ = sup,
            ObjBody::IClass(i) => i.super_ = sup,
            _ => {}
        }
        if let Some(s) = sup {
            self.field_write_barrier(node, Value::Obj(s));
        }
    }

    /// Reads a method from one chain node, treating an iclass as its wrapped
    /// module's table.
    fn node_find_method(&self, node: ObjId, mid: Sym) -> Option<Method> {
        match self.heap.body(node) {
            ObjBody::Class(c) => c.mt.get(mid),
            ObjBody::IClass(i) => {
                if let Some(mt) = &i.mt {
                    mt.get(mid)
                } else {
                    let module = self.heap.header(node).cls?;
                    match self.heap.body(module) {
                        ObjBody::Class(m) => m.mt.get(mid),
                        _ => None,
                    }
                }
            }
            _ => None,
        }
    }

    /// Walks the super chain. An undef tombstone aborts the search.
    pub fn method_search_super(&self, cls: ObjId, mid: Sym) -> Option<(ObjId, Method)> {
        let mut node = Some(cls);
        while let Some(n) = node {
            if let Some(m) = self.node_find_method(n, mid) {
                if matches!(m, Method::Undef) {
                    return None;
                }
                return Some((n, m));
            }
            node = self.node_super(n);
        }
        None
    }

    /// Method resolution with the direct-mapped cache in front.
    #[cfg(feature = "method-cache")]
    pub fn method_search_vm(&mut self, cls: ObjId, mid: Sym) -> Option<(ObjId, Method)> {
        let slot = cache_slot(cls, mid);
        if let Some(e) = self.cache[slot] {
            if e.cls == cls && e.mid == mid {
                return Some((e.node, e.method));
            }
        }
        let found = self.method_search_super(cls, mid);
        if let Some((node, method)) = found {
            self.cache[slot] = Some(CacheEntry {
                cls,
                mid,
                node,
                method,
            });
        }
        found
    }

    /// Method resolution without the cache.
    #[cfg(not(feature = "method-cache"))]
    pub fn method_search_vm(&mut self, cls: ObjId, mid: Sym) -> Option<(ObjId, Method)> {
        self.method_search_super(cls, mid)
    }

    /// Flushes the whole method cache.
    pub fn mc_clear(&mut self) {
        #[cfg(feature = "method-cache")]
        {
            log::debug!("method cache: full flush");
            self.cache.iter_mut().for_each(|e| *e = None);
        }
    }

    /// Invalidates cache entries affected by a mutation of `cls`. A class
    /// that has been inherited flushes everything, since any chain may now
    /// resolve through it.
    pub fn mc_invalidate(&mut self, cls: ObjId) {
        #[cfg(feature = "method-cache")]
        {
            if self
                .heap
                .header(cls)
                .flags
                .contains(ObjFlags::CLASS_IS_INHERITED)
            {
                self.mc_clear();
                return;
            }
            for e in self.cache.iter_mut() {
                if let Some(entry) = e {
                    if entry.cls == cls || entry.node == cls {
                        *e = None;
                    }
                }
            }
        }
        #[cfg(not(feature = "method-cache"))]
        let _ = cls;
    }

    /// Installs a method, invalidating affected cache lines.
    pub fn define_method_raw(&mut self, cls: ObjId, mid: Sym, m: Method) {
        if let Method::Proc(p) = m {
            self.field_write_barrier(cls, Value::Obj(p));
            // a method body resolves super against its defining class
            if self.proc_env(p).is_none() {
                if let ObjBody::Proc(pr) = self.heap.body_mut(p) {
                    pr.scope = crate::procs::ProcScope::Class(Some(cls));
                }
            }
        }
        let target = self.method_home(cls);
        match self.heap.body_mut(target) {
            ObjBody::Class(c) => c.mt.insert(mid, m),
            ObjBody::IClass(i) => {
                if let Some(mt) = &mut i.mt {
                    mt.insert(mid, m);
                }
            }
            _ => {}
        }
        self.mc_invalidate(cls);
    }

    /// Where newly defined methods land: the class itself, or for a shared
    /// iclass node, the wrapped module.
    fn method_home(&self, cls: ObjId) -> ObjId {
        match self.heap.body(cls) {
            ObjBody::IClass(i) if i.mt.is_none() => self.heap.header(cls).cls.unwrap_or(cls),
            _ => cls,
        }
    }

    /// Defines a native method.
    pub fn define_method(&mut self, cls: ObjId, name: &str, f: NativeFn) {
        let mid = self.intern(name);
        self.define_method_raw(cls, mid, Method::Native(f));
    }

    /// Defines a native method on the receiver's singleton class.
    pub fn define_class_method(&mut self, cls: ObjId, name: &str, f: NativeFn) -> VmResult<()> {
        let sc = self.singleton_class(Value::Obj(cls))?;
        self.define_method(sc, name, f);
        Ok(())
    }

    /// `undef_method`: installs the tombstone that stops lookup.
    pub fn undef_method(&mut self, cls: ObjId, mid: Sym) {
        self.define_method_raw(cls, mid, Method::Undef);
    }

    /// `alias_method new old`.
    pub fn alias_method(&mut self, cls: ObjId, new: Sym, old: Sym) -> VmResult<()> {
        let (_, m) = self.method_search_super(cls, old).ok_or_else(|| {
            VmError::name(format!(
                "undefined method '{}' for aliasing",
                self.symbols.name(old)
            ))
        })?;
        self.define_method_raw(cls, new, m);
        Ok(())
    }

    /// Allocates a bare class object.
    pub(crate) fn class_alloc(
        &mut self,
        tt: Vtype,
        super_: Option<ObjId>,
        meta: ObjId,
    ) -> VmResult<ObjId> {
        let instance_tt = match super_ {
            Some(s) => match self.heap.body(s) {
                ObjBody::Class(c) => c.instance_tt,
                _ => Vtype::Object,
            },
            None => Vtype::Object,
        };
        self.obj_alloc(
            tt,
            Some(meta),
            ObjBody::Class(RClass {
                super_,
                mt: MethodTable::new(),
                iv: IvTable::new(),
                instance_tt,
            }),
        )
    }

    /// Creates a new class under `super_` (Object when `None`), marking the
    /// superclass as inherited for cache purposes.
    pub fn class_new(&mut self, super_: Option<ObjId>) -> VmResult<ObjId> {
        let sup = super_.unwrap_or(self.object_class);
        let cls = self.class_alloc(Vtype::Class, Some(sup), self.class_class)?;
        self.heap.header_mut(sup).flags |= ObjFlags::CLASS_IS_INHERITED;
        Ok(cls)
    }

    /// Creates a new module.
    pub fn module_new(&mut self) -> VmResult<ObjId> {
        let m = self.class_alloc(Vtype::Module, None, self.module_class)?;
        if let ObjBody::Class(c) = self.heap.body_mut(m) {
            c.instance_tt = Vtype::False;
        }
        Ok(m)
    }

    /// Names a class by installing it as a constant and recording the name.
    pub fn name_class(&mut self, cls: ObjId, outer: ObjId, name: Sym) -> VmResult<()> {
        let classname = self.intern("__classname__");
        self.iv_set_on(cls, classname, Value::Symbol(name))?;
        self.const_set(outer, name, Value::Obj(cls))
    }

    /// Printable class name.
    pub fn class_name(&self, cls: ObjId) -> String {
        let cls = self.real_class(cls);
        if let Some(classname) = self.symbols.lookup("__classname__") {
            if let ObjBody::Class(c) = self.heap.body(cls) {
                if let Some(Value::Symbol(s)) = c.iv.get(classname) {
                    return self.symbols.name(s).to_string();
                }
            }
        }
        format!("#<Class:0x{:x}>", cls.0)
    }

    /// Finds the origin node of a possibly-prepended class.
    fn find_origin(&self, cls: ObjId) -> ObjId {
        if !self
            .heap
            .header(cls)
            .flags
            .contains(ObjFlags::CLASS_IS_PREPENDED)
        {
            return cls;
        }
        let mut node = self.node_super(cls);
        while let Some(n) = node {
            if self.heap.header(n).flags.contains(ObjFlags::CLASS_IS_ORIGIN) {
                return n;
            }
            node = self.node_super(n);
        }
        cls
    }

    /// The module an iclass node wraps, or the node itself for classes.
    fn wrapped_module(&self, node: ObjId) -> ObjId {
        match self.heap.header(node).tt {
            Vtype::IClass => self.heap.header(node).cls.unwrap_or(node),
            _ => node,
        }
    }

    /// Splices `module` (and the modules it includes) into the chain after
    /// `ins_pos`. Skips modules already present.
    fn include_module_at(&mut self, cls: ObjId, ins_pos: ObjId, module: ObjId) -> VmResult<()> {
        let mut ins = ins_pos;
        let mut m = Some(module);
        while let Some(node) = m {
            let wrapped = self.wrapped_module(node);
            // cycle / duplicate check over the receiver's chain
            let mut dup = false;
            let mut c = Some(cls);
            while let Some(n) = c {
                if n != cls && self.wrapped_module(n) == wrapped {
                    dup = true;
                    break;
                }
                c = self.node_super(n);
            }
            if wrapped == cls {
                return Err(VmError::argument("cyclic include detected"));
            }
            if !dup {
                let old_super = self.node_super(ins);
                let ic = self.obj_alloc(
                    Vtype::IClass,
                    Some(wrapped),
                    ObjBody::IClass(RIClass {
                        super_: old_super,
                        mt: None,
                    }),
                )?;
                self.set_node_super(ins, Some(ic));
                ins = ic;
            }
            m = self.node_super(node);
        }
        self.mc_invalidate(cls);
        Ok(())
    }

    /// `include`: modules go after the class's own methods.
    pub fn include_module(&mut self, cls: ObjId, module: ObjId) -> VmResult<()> {
        let origin = self.find_origin(cls);
        self.include_module_at(cls, origin, module)
    }

    /// `prepend`: interposes the origin node on first use, then splices the
    /// module directly after the class head.
    pub fn prepend_module(&mut self, cls: ObjId, module: ObjId) -> VmResult<()> {
        if !self
            .heap
            .header(cls)
            .flags
            .contains(ObjFlags::CLASS_IS_PREPENDED)
        {
            let old_super = self.node_super(cls);
            // the origin takes over the class's own method table
            let mt = match self.heap.body_mut(cls) {
                ObjBody::Class(c) => std::mem::take(&mut c.mt),
                _ => return Err(VmError::type_error("prepend on non-class")),
            };
            let origin = self.obj_alloc(
                Vtype::IClass,
                Some(cls),
                ObjBody::IClass(RIClass {
                    super_: old_super,
                    mt: Some(mt),
                }),
            )?;
            self.heap.header_mut(origin).flags |= ObjFlags::CLASS_IS_ORIGIN;
            self.set_node_super(cls, Some(origin));
            self.heap.header_mut(cls).flags |= ObjFlags::CLASS_IS_PREPENDED;
            self.mc_clear();
        }
        self.include_module_at(cls, cls, module)
    }

    /// Lazily allocates the singleton class of `v`.
    pub fn singleton_class(&mut self, v: Value) -> VmResult<ObjId> {
        match v {
            Value::Nil => Ok(self.nil_class),
            Value::True => Ok(self.true_class),
            Value::False => Ok(self.false_class),
            Value::Fixnum(_) | Value::Float(_) | Value::Symbol(_) | Value::Undef => Err(
                VmError::type_error("can't define singleton class of immediate value"),
            ),
            Value::Obj(o) => {
                let cls = self.heap.header(o).cls.unwrap_or(self.object_class);
                if self.heap.header(cls).tt == Vtype::SClass {
                    return Ok(cls);
                }
                // a class object's singleton super chain follows its
                // superclass's singleton chain
                let sup = if matches!(self.heap.header(o).tt, Vtype::Class | Vtype::SClass) {
                    match self.node_super(o).map(|s| self.real_class(s)) {
                        Some(s) => Some(self.singleton_class(Value::Obj(s))?),
                        None => Some(self.class_class),
                    }
                } else {
                    Some(cls)
                };
                let sc = self.class_alloc(Vtype::SClass, sup, self.class_class)?;
                if let ObjBody::Class(c) = self.heap.body_mut(sc) {
                    c.instance_tt = Vtype::False;
                }
                let attached = self.intern("__attached__");
                self.iv_set_on(sc, attached, v)?;
                self.heap.header_mut(o).cls = Some(sc);
                self.field_write_barrier(o, Value::Obj(sc));
                self.mc_invalidate(cls);
                Ok(sc)
            }
        }
    }

    /// `kind_of?`: walks the value's class chain looking for `cls`.
    pub fn obj_is_kind_of(&self, v: Value, cls: ObjId) -> bool {
        let mut node = Some(self.class_of(v));
        while let Some(n) = node {
            if n == cls || self.wrapped_module(n) == cls {
                return true;
            }
            node = self.node_super(n);
        }
        false
    }

    // ---- constants, class variables, instance variables ----

    /// Reads an ivar from a heap object; nil when absent or unsupported.
    pub fn iv_get(&self, v: Value, sym: Sym) -> Value {
        if let Value::Obj(o) = v {
            if let Some(iv) = self.heap.body(o).iv() {
                return iv.get(sym).unwrap_or(Value::Nil);
            }
        }
        Value::Nil
    }

    /// Writes an ivar, with the frozen check and write barrier.
    pub fn iv_set(&mut self, v: Value, sym: Sym, val: Value) -> VmResult<()> {
        match v {
            Value::Obj(o) => self.iv_set_on(o, sym, val),
            _ => Err(VmError::argument("cannot set instance variable")),
        }
    }

    pub(crate) fn iv_set_on(&mut self, o: ObjId, sym: Sym, val: Value) -> VmResult<()> {
        if self.heap.header(o).is_frozen() {
            let cls = self.class_of(Value::Obj(o));
            return Err(VmError::frozen(format!(
                "can't modify frozen {}",
                self.class_name(cls)
            )));
        }
        self.field_write_barrier(o, val);
        match self.heap.body_mut(o).iv_mut() {
            Some(iv) => {
                iv.set(sym, val);
                Ok(())
            }
            None => Err(VmError::type_error("can't set instance variable")),
        }
    }

    /// Constant lookup along the super chain of `cls`, falling back to the
    /// top level.
    pub fn const_get(&mut self, cls: ObjId, sym: Sym) -> VmResult<Value> {
        let mut node = Some(cls);
        while let Some(n) = node {
            let holder = self.wrapped_module(n);
            if let ObjBody::Class(c) = self.heap.body(holder) {
                if let Some(v) = c.iv.get(sym) {
                    return Ok(v);
                }
            }
            node = self.node_super(n);
        }
        if cls != self.object_class {
            if let ObjBody::Class(c) = self.heap.body(self.object_class) {
                if let Some(v) = c.iv.get(sym) {
                    return Ok(v);
                }
            }
        }
        Err(VmError::name(format!(
            "uninitialized constant {}",
            self.symbols.name(sym)
        )))
    }

    /// Constant lookup for `GETCONST`: lexical scope (the proc chain's
    /// target classes) first, then the current class chain.
    pub fn vm_const_get(&mut self, sym: Sym) -> VmResult<Value> {
        let mut p = self.ctx().ci().proc;
        while let Some(proc_id) = p {
            if let Some(tc) = self.proc_target_class(proc_id) {
                if let ObjBody::Class(c) = self.heap.body(tc) {
                    if let Some(v) = c.iv.get(sym) {
                        return Ok(v);
                    }
                }
            }
            p = match self.heap.body(proc_id) {
                ObjBody::Proc(pr) => pr.upper,
                _ => None,
            };
        }
        let tc = self
            .ctx()
            .ci()
            .target_class
            .unwrap_or(self.object_class);
        self.const_get(tc, sym)
    }

    pub fn const_set(&mut self, cls: ObjId, sym: Sym, val: Value) -> VmResult<()> {
        self.iv_set_on(cls, sym, val)
    }

    /// `SETCONST`: assigns in the current definition scope.
    pub fn vm_const_set(&mut self, sym: Sym, val: Value) -> VmResult<()> {
        let tc = self
            .ctx()
            .ci()
            .proc
            .and_then(|p| self.proc_target_class(p))
            .or(self.ctx().ci().target_class)
            .unwrap_or(self.object_class);
        self.const_set(tc, sym, val)
    }

    /// Class-variable read: search the target class chain.
    pub fn vm_cv_get(&mut self, sym: Sym) -> VmResult<Value> {
        let start = self
            .ctx()
            .ci()
            .target_class
            .unwrap_or(self.object_class);
        let mut node = Some(start);
        while let Some(n) = node {
            let holder = self.wrapped_module(n);
            if let ObjBody::Class(c) = self.heap.body(holder) {
                if let Some(v) = c.iv.get(sym) {
                    return Ok(v);
                }
            }
            node = self.node_super(n);
        }
        Err(VmError::name(format!(
            "uninitialized class variable {}",
            self.symbols.name(sym)
        )))
    }

    /// Class-variable write: assign where defined, else on the target class.
    pub fn vm_cv_set(&mut self, sym: Sym, val: Value) -> VmResult<()> {
        let start = self
            .ctx()
            .ci()
            .target_class
            .unwrap_or(self.object_class);
        let mut node = Some(start);
        while let Some(n) = node {
            let holder = self.wrapped_module(n);
            if let ObjBody::Class(c) = self.heap.body(holder) {
                if c.iv.contains(sym) {
                    return self.iv_set_on(holder, sym, val);
                }
            }
            node = self.node_super(n);
        }
        self.iv_set_on(start, sym, val)
    }

    /// `OP_CLASS`: reopen or create a named class under `base`.
    pub fn vm_define_class(
        &mut self,
        base: ObjId,
        super_: Value,
        id: Sym,
    ) -> VmResult<ObjId> {
        let sup = match super_ {
            Value::Nil => None,
            Value::Obj(o) if self.heap.header(o).tt == Vtype::Class => Some(o),
            _ => {
                return Err(VmError::type_error(
                    "superclass must be a Class",
                ))
            }
        };
        if let ObjBody::Class(c) = self.heap.body(base) {
            if let Some(Value::Obj(existing)) = c.iv.get(id) {
                if self.heap.header(existing).tt == Vtype::Class {
                    if let Some(s) = sup {
                        let real = self.real_class(self.node_super(existing).unwrap_or(s));
                        if real != s {
                            return Err(VmError::type_error(format!(
                                "superclass mismatch for class {}",
                                self.symbols.name(id)
                            )));
                        }
                    }
                    return Ok(existing);
                }
                return Err(VmError::type_error(format!(
                    "{} is not a class",
                    self.symbols.name(id)
                )));
            }
        }
        let cls = self.class_new(sup)?;
        self.name_class(cls, base, id)?;
        Ok(cls)
    }

    /// `OP_MODULE`: reopen or create a named module under `base`.
    pub fn vm_define_module(&mut self, base: ObjId, id: Sym) -> VmResult<ObjId> {
        if let ObjBody::Class(c) = self.heap.body(base) {
            if let Some(Value::Obj(existing)) = c.iv.get(id) {
                if self.heap.header(existing).tt == Vtype::Module {
                    return Ok(existing);
                }
                return Err(VmError::type_error(format!(
                    "{} is not a module",
                    self.symbols.name(id)
                )));
            }
        }
        let m = self.module_new()?;
        self.name_class(m, base, id)?;
        Ok(m)
    }
}
