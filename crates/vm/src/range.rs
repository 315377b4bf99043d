//! Range construction.

use crate::error::VmResult;
use crate::object::ObjBody;
use crate::value::{ObjId, Value, Vtype};
use crate::vm::Vm;

/// Range payload.
#[derive(Debug, Clone, Copy)]
pub struct RRange {
    pub beg: Value,
    pub end: Value,
    /// Exclusive upper bound (`...`).
    pub excl: bool,
}

impl Vm {
    /// Builds a range for `RANGE_INC` / `RANGE_EXC`.
    pub fn range_new(&mut self, beg: Value, end: Value, excl: bool) -> VmResult<ObjId> {
        self.obj_alloc(
            Vtype::Range,
            Some(self.range_class),
            ObjBody::Range(RRange { beg, end, excl }),
        )
    }
}
