//! Heap object header and per-kind payloads.
//!
//! Every heap object starts with the common [`ObjHeader`]: type tag, GC color,
//! a flag word (19 per-type bits plus the frozen bit), the class pointer, and
//! the intrusive link used to thread the collector's gray lists. The payload
//! is the [`ObjBody`] sum over all heap kinds.

use crate::class::{RClass, RIClass};
use crate::context::CtxId;
use crate::env::REnv;
use crate::hash::RHash;
use crate::ivtable::IvTable;
use crate::procs::RProc;
use crate::range::RRange;
use crate::value::{ObjId, Value, Vtype};
use bitflags::bitflags;

bitflags! {
    /// Per-object flag word: 19 type-specific bits plus the frozen bit.
    ///
    /// The type-specific bits overlap between kinds; which names are
    /// meaningful depends on the header's type tag.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjFlags: u32 {
        // class / module
        const CLASS_IS_PREPENDED = 1 << 16;
        const CLASS_IS_INHERITED = 1 << 17;
        const CLASS_IS_ORIGIN    = 1 << 18;
        // proc
        const PROC_CFUNC  = 1 << 7;
        const PROC_STRICT = 1 << 8;
        const PROC_ORPHAN = 1 << 9;
        const PROC_ENVSET = 1 << 10;
        const PROC_SCOPE  = 1 << 11;
        // irep loaded from a static buffer (kept for format symmetry)
        const IREP_NO_FREE = 1 << 0;
        // common
        const FROZEN = 1 << 19;
    }
}

/// Common header carried by every heap object.
#[derive(Debug, Clone)]
pub struct ObjHeader {
    /// Type tag; always equals the kind of any value pointing here.
    pub tt: Vtype,
    /// GC color bits (one of white-A, white-B, gray, black).
    pub color: u8,
    /// Flag word.
    pub flags: ObjFlags,
    /// Class pointer. For iclass nodes this is the wrapped module; for env
    /// objects it holds the creating frame's target class.
    pub cls: Option<ObjId>,
    /// Intrusive link threading the gray and atomic-gray lists.
    pub gc_next: Option<ObjId>,
}

impl ObjHeader {
    pub fn is_frozen(&self) -> bool {
        self.flags.contains(ObjFlags::FROZEN)
    }
}

/// Payload of a heap object, discriminated by the header's type tag.
///
/// `Class`, `Module` and `SClass` share the [`RClass`] payload; the tag
/// tells them apart. `Free` marks a slot on a page free list and must never
/// be reachable from a live value.
#[derive(Debug)]
pub enum ObjBody {
    /// Slot on the page free list; `next` is the next free slot on the page.
    Free { next: Option<u32> },
    /// Plain object: an instance-variable table.
    Object { iv: IvTable },
    /// Exception object (same shape as a plain object).
    Exception { iv: IvTable },
    /// Class, module, or singleton class.
    Class(RClass),
    /// Included-module proxy node in a super chain.
    IClass(RIClass),
    /// Bytecode or native closure.
    Proc(RProc),
    Array(Vec<Value>),
    Hash(RHash),
    Str(String),
    Range(RRange),
    /// Captured local-variable frame backing a closure.
    Env(REnv),
    /// Fiber object owning an execution context.
    Fiber { cxt: Option<CtxId> },
    /// In-flight `break` payload: the proc broken out of and the value.
    Break { target: ObjId, val: Value },
    /// Host data object.
    Data { iv: IvTable },
}

impl ObjBody {
    /// The instance-variable table of this object, if its kind has one.
    pub fn iv(&self) -> Option<&IvTable> {
        match self {
            ObjBody::Object { iv } | ObjBody::Exception { iv } | ObjBody::Data { iv } => Some(iv),
            ObjBody::Class(c) => Some(&c.iv),
            _ => None,
        }
    }

    /// Mutable access to the instance-variable table.
    pub fn iv_mut(&mut self) -> Option<&mut IvTable> {
        match self {
            ObjBody::Object { iv } | ObjBody::Exception { iv } | ObjBody::Data { iv } => Some(iv),
            ObjBody::Class(c) => Some(&mut c.iv),
            _ => None,
        }
    }
}
