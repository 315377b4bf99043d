//! Exception objects and the error-to-exception mapping.
//!
//! Exceptions are ordinary heap objects; the VM carries at most one pending
//! exception at a time. `NoMemoryError` and `SysStackError` instances are
//! built once at init so raising them can never allocate.

use crate::error::{VmError, VmResult};
use crate::ivtable::IvTable;
use crate::object::ObjBody;
use crate::value::{ObjId, Value, Vtype};
use crate::vm::Vm;

/// Builds the standard exception class taxonomy and the pre-allocated
/// instances. Runs once during `Vm::open`.
pub(crate) fn init_exceptions(vm: &mut Vm) -> VmResult<()> {
    let object = vm.object_class;
    let exception = vm.exception_class;
    let standard = vm.standard_error_class;

    let exc_name = vm.intern("Exception");
    vm.name_class(exception, object, exc_name)?;
    let std_name = vm.intern("StandardError");
    vm.name_class(standard, object, std_name)?;

    let define = |vm: &mut Vm, name: &str, sup: ObjId| -> VmResult<ObjId> {
        let cls = vm.class_new(Some(sup))?;
        let sym = vm.intern(name);
        vm.name_class(cls, object, sym)?;
        Ok(cls)
    };

    let runtime = define(vm, "RuntimeError", standard)?;
    define(vm, "ArgumentError", standard)?;
    define(vm, "TypeError", standard)?;
    let name_error = define(vm, "NameError", standard)?;
    define(vm, "NoMethodError", name_error)?;
    define(vm, "FrozenError", runtime)?;
    let range_error = define(vm, "RangeError", standard)?;
    define(vm, "FloatDomainError", range_error)?;
    define(vm, "LocalJumpError", standard)?;
    define(vm, "FiberError", standard)?;
    define(vm, "NotImplementedError", standard)?;
    define(vm, "ScriptError", standard)?;
    let nomem = define(vm, "NoMemoryError", exception)?;
    let sysstack = define(vm, "SysStackError", exception)?;

    vm.nomem_err = vm.exc_new(nomem, "Out of memory")?;
    vm.stack_err = vm.exc_new(sysstack, "stack level too deep")?;
    #[cfg(feature = "fixed-arena")]
    {
        vm.arena_err = vm.exc_new(runtime, "arena overflow error")?;
    }
    Ok(())
}

impl Vm {
    /// Allocates an exception of `cls` with a message.
    pub fn exc_new(&mut self, cls: ObjId, message: &str) -> VmResult<ObjId> {
        let exc = self.obj_alloc(
            Vtype::Exception,
            Some(cls),
            ObjBody::Exception { iv: IvTable::new() },
        )?;
        let msg = self.str_new(message)?;
        let mesg = self.intern("mesg");
        self.iv_set_on(exc, mesg, Value::Obj(msg))?;
        Ok(exc)
    }

    /// The message string of an exception object.
    pub fn exc_message(&self, exc: ObjId) -> String {
        if let Some(mesg) = self.symbols.lookup("mesg") {
            if let Some(Value::Obj(s)) = self.heap.body(exc).iv().and_then(|iv| iv.get(mesg)) {
                if let Ok(s) = self.str_ref(s) {
                    return s.to_string();
                }
            }
        }
        self.class_name(self.class_of(Value::Obj(exc)))
    }

    /// Looks up an exception class by its conventional name, falling back
    /// to `Exception`.
    pub(crate) fn exc_class_named(&mut self, name: &str) -> ObjId {
        let sym = self.intern(name);
        if let ObjBody::Class(c) = self.heap.body(self.object_class) {
            if let Some(Value::Obj(cls)) = c.iv.get(sym) {
                if matches!(self.heap.header(cls).tt, Vtype::Class) {
                    return cls;
                }
            }
        }
        self.exception_class
    }

    /// Materializes a `VmError` as an exception object. The pre-allocated
    /// instances cover the paths where allocation itself is the problem.
    pub(crate) fn error_to_exc(&mut self, e: VmError) -> ObjId {
        match e {
            VmError::Raise {
                exc: Value::Obj(o),
            } => o,
            VmError::Raise { exc } => {
                let cls = self.exc_class_named("RuntimeError");
                let msg = self.value_inspect(exc);
                self.exc_new(cls, &msg).unwrap_or(self.nomem_err)
            }
            VmError::NoMemory => self.nomem_err,
            VmError::SysStack => self.stack_err,
            other => {
                let cls = self.exc_class_named(other.class_name());
                let msg = other.message().unwrap_or("error").to_string();
                self.exc_new(cls, &msg).unwrap_or(self.nomem_err)
            }
        }
    }

    /// Sets the pending exception from an error.
    pub(crate) fn exc_set_err(&mut self, e: VmError) {
        let exc = self.error_to_exc(e);
        self.exc = Some(exc);
    }

    /// Allocates the in-flight payload for `break`.
    pub(crate) fn break_new(&mut self, target: ObjId, val: Value) -> VmResult<ObjId> {
        self.obj_alloc(Vtype::Break, None, ObjBody::Break { target, val })
    }

    /// The pending exception, if any (host inspection).
    pub fn pending_exception(&self) -> Option<Value> {
        self.exc.map(Value::Obj)
    }

    /// Clears the pending exception.
    pub fn clear_pending_exception(&mut self) {
        self.exc = None;
    }
}
