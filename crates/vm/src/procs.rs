//! Proc objects: bytecode or native closures.
//!
//! A proc pairs a body with its lexical position. Bytecode procs carry an
//! irep plus the `upper` link forming the static lexical chain; the scope is
//! either a target class (methods, class bodies) or a captured env
//! (closures). Native procs wrap a function pointer and may carry an env for
//! closure-over-values. The `STRICT`/`ORPHAN`/`ENVSET`/`SCOPE`/`CFUNC` bits
//! live in the object header's flag word.

use crate::error::VmResult;
use crate::irep::Irep;
use crate::value::{ObjId, Value};
use std::rc::Rc;

/// Native method signature: receives the VM and the receiver; arguments are
/// read from the current frame via `Vm::get_args` and friends.
pub type NativeFn = fn(&mut crate::vm::Vm, Value) -> VmResult<Value>;

/// The executable part of a proc.
#[derive(Clone)]
pub enum ProcBody {
    Irep(Rc<Irep>),
    Native(NativeFn),
}

impl std::fmt::Debug for ProcBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcBody::Irep(irep) => f.debug_tuple("Irep").field(&irep.nregs).finish(),
            ProcBody::Native(func) => f.debug_tuple("Native").field(&(*func as usize)).finish(),
        }
    }
}

/// Where the proc resolves `self`'s class and upvalues.
#[derive(Debug, Clone, Copy)]
pub enum ProcScope {
    /// Method or class-body proc: the defining class (None for top-level
    /// procs before a class is attached).
    Class(Option<ObjId>),
    /// Closure: the captured env (`ENVSET` is set in the header).
    Env(ObjId),
}

/// A proc object payload.
#[derive(Debug, Clone)]
pub struct RProc {
    pub body: ProcBody,
    /// Enclosing proc in the static lexical chain.
    pub upper: Option<ObjId>,
    pub scope: ProcScope,
}

impl RProc {
    /// The irep of a bytecode proc.
    pub fn irep(&self) -> Option<&Rc<Irep>> {
        match &self.body {
            ProcBody::Irep(irep) => Some(irep),
            ProcBody::Native(_) => None,
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self.body, ProcBody::Native(_))
    }

    /// The captured env, when the scope is one.
    pub fn env(&self) -> Option<ObjId> {
        match self.scope {
            ProcScope::Env(e) => Some(e),
            ProcScope::Class(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_accessors() {
        let irep = Rc::new(Irep::default());
        let p = RProc {
            body: ProcBody::Irep(irep),
            upper: None,
            scope: ProcScope::Class(None),
        };
        assert!(p.irep().is_some());
        assert!(p.env().is_none());
        assert!(!p.is_native());
    }
}
