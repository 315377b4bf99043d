//! Per-call frame metadata.

use crate::symbol::Sym;
use crate::value::ObjId;

/// Accept-slot sentinel: skip unwinding past this frame (host boundary).
pub const ACC_SKIP: i32 = -1;
/// Accept-slot sentinel: direct native call, no bytecode frame below.
pub const ACC_DIRECT: i32 = -2;
/// Accept-slot sentinel: frame entered by resuming a fiber from the host.
pub const ACC_RESUMED: i32 = -3;

/// Metadata for one active call.
///
/// `argc < 0` means the caller packed all arguments into a single array at
/// register 1. `acc` is the caller-frame register that receives the return
/// value, or one of the negative sentinels above.
#[derive(Debug, Clone)]
pub struct CallInfo {
    /// Method name being executed, if any.
    pub mid: Option<Sym>,
    /// Proc currently executing in this frame.
    pub proc: Option<ObjId>,
    /// Env captured over this frame, created lazily by closures.
    pub env: Option<ObjId>,
    /// Class the method was found on. Cleared to mark a context-modifying
    /// native return (fiber switch).
    pub target_class: Option<ObjId>,
    /// Caller's register base (offset into the context's value stack).
    pub stackent: usize,
    /// Argument count; negative means splat-packed as one array.
    pub argc: i32,
    /// Saved program counter to resume the caller at.
    pub pc: Option<usize>,
    /// Accept slot in the caller's frame, or a sentinel.
    pub acc: i32,
    /// Rescue-stack depth at entry.
    pub ridx: usize,
    /// Ensure-stack position at entry.
    pub epos: usize,
}

impl Default for CallInfo {
    fn default() -> Self {
        Self {
            mid: None,
            proc: None,
            env: None,
            target_class: None,
            stackent: 0,
            argc: 0,
            pc: None,
            acc: 0,
            ridx: 0,
            epos: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels_are_distinct() {
        assert!(ACC_SKIP != ACC_DIRECT && ACC_DIRECT != ACC_RESUMED);
        assert!(ACC_SKIP < 0 && ACC_DIRECT < 0 && ACC_RESUMED < 0);
    }

    #[test]
    fn test_default_frame() {
        let ci = CallInfo::default();
        assert_eq!(ci.argc, 0);
        assert_eq!(ci.acc, 0);
        assert!(ci.proc.is_none());
    }
}
