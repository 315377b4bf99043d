//! Error types for the RiteVM crate.
//!
//! Two layers of errors meet here. Ruby-level exceptions are ordinary heap
//! objects carried on the VM's pending-exception slot; they cross host
//! boundaries as [`VmError::Raise`]. Everything else is a pre-classified
//! error that the raise machinery maps onto the conventional exception class
//! of the same name before unwinding.

use crate::value::Value;
use thiserror::Error;

/// VM execution and loading errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VmError {
    /// Allocation starved after a full GC.
    #[error("out of memory")]
    NoMemory,

    /// Value stack, call-info stack, rescue stack, or ensure stack exhausted.
    #[error("stack level too deep")]
    SysStack,

    /// Arity mismatch, missing/unknown keyword, bad receiver for splat.
    #[error("argument error: {message}")]
    Argument { message: String },

    /// Wrong kind passed where a specific kind is required.
    #[error("type error: {message}")]
    Type { message: String },

    /// Undefined constant, method, or class variable.
    #[error("name error: {message}")]
    Name { message: String },

    /// Method resolution failed and `method_missing` chose to raise.
    #[error("no method error: {message}")]
    NoMethod { message: String },

    /// Mutation of a frozen object.
    #[error("frozen error: {message}")]
    Frozen { message: String },

    /// Integer conversion out of fixnum range.
    #[error("range error: {message}")]
    Range { message: String },

    /// Float-to-integer conversion of NaN or infinity.
    #[error("float domain error: {message}")]
    FloatDomain { message: String },

    /// Break from an orphaned proc or return from a vanished method frame.
    #[error("local jump error: {message}")]
    LocalJump { message: String },

    /// Fiber misuse: resume-terminated, double resume, yield from root.
    #[error("fiber error: {message}")]
    Fiber { message: String },

    /// Generic runtime error, including nested-rescue/ensure overflow.
    #[error("runtime error: {message}")]
    Runtime { message: String },

    /// Feature compiled out of this build.
    #[error("not implemented: {message}")]
    NotImplemented { message: String },

    /// Malformed bytecode or compiled unit.
    #[error("invalid script: {reason}")]
    Script { reason: String },

    /// An already-constructed exception value propagating out of the VM.
    #[error("exception raised")]
    Raise { exc: Value },
}

impl VmError {
    /// Create a new argument error.
    pub fn argument<S: Into<String>>(message: S) -> Self {
        Self::Argument {
            message: message.into(),
        }
    }

    /// Create a new type error.
    pub fn type_error<S: Into<String>>(message: S) -> Self {
        Self::Type {
            message: message.into(),
        }
    }

    /// Create a new name error.
    pub fn name<S: Into<String>>(message: S) -> Self {
        Self::Name {
            message: message.into(),
        }
    }

    /// Create a new no-method error.
    pub fn no_method<S: Into<String>>(message: S) -> Self {
        Self::NoMethod {
            message: message.into(),
        }
    }

    /// Create a new frozen-object error.
    pub fn frozen<S: Into<String>>(message: S) -> Self {
        Self::Frozen {
            message: message.into(),
        }
    }

    /// Create a new range error.
    pub fn range<S: Into<String>>(message: S) -> Self {
        Self::Range {
            message: message.into(),
        }
    }

    /// Create a new float-domain error.
    pub fn float_domain<S: Into<String>>(message: S) -> Self {
        Self::FloatDomain {
            message: message.into(),
        }
    }

    /// Create a new local-jump error.
    pub fn local_jump<S: Into<String>>(message: S) -> Self {
        Self::LocalJump {
            message: message.into(),
        }
    }

    /// Create a new fiber error.
    pub fn fiber<S: Into<String>>(message: S) -> Self {
        Self::Fiber {
            message: message.into(),
        }
    }

    /// Create a new runtime error.
    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Create a new invalid-script error.
    pub fn script<S: Into<String>>(reason: S) -> Self {
        Self::Script {
            reason: reason.into(),
        }
    }

    /// Wrap an exception value for host propagation.
    pub fn raise(exc: Value) -> Self {
        Self::Raise { exc }
    }

    /// The conventional Ruby class name for this error.
    pub fn class_name(&self) -> &'static str {
        match self {
            VmError::NoMemory => "NoMemoryError",
            VmError::SysStack => "SysStackError",
            VmError::Argument { .. } => "ArgumentError",
            VmError::Type { .. } => "TypeError",
            VmError::Name { .. } => "NameError",
            VmError::NoMethod { .. } => "NoMethodError",
            VmError::Frozen { .. } => "FrozenError",
            VmError::Range { .. } => "RangeError",
            VmError::FloatDomain { .. } => "FloatDomainError",
            VmError::LocalJump { .. } => "LocalJumpError",
            VmError::Fiber { .. } => "FiberError",
            VmError::Runtime { .. } => "RuntimeError",
            VmError::NotImplemented { .. } => "NotImplementedError",
            VmError::Script { .. } => "ScriptError",
            VmError::Raise { .. } => "Exception",
        }
    }

    /// The message carried by this error, when there is one.
    pub fn message(&self) -> Option<&str> {
        match self {
            VmError::Argument { message }
            | VmError::Type { message }
            | VmError::Name { message }
            | VmError::NoMethod { message }
            | VmError::Frozen { message }
            | VmError::Range { message }
            | VmError::FloatDomain { message }
            | VmError::LocalJump { message }
            | VmError::Fiber { message }
            | VmError::Runtime { message }
            | VmError::NotImplemented { message } => Some(message),
            VmError::Script { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Result type for VM operations.
pub type VmResult<T> = std::result::Result<T, VmError>;

impl From<rite_io::IoError> for VmError {
    fn from(error: rite_io::IoError) -> Self {
        VmError::script(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = VmError::argument("wrong number of arguments");
        assert!(matches!(error, VmError::Argument { .. }));
        assert_eq!(
            error.to_string(),
            "argument error: wrong number of arguments"
        );
    }

    #[test]
    fn test_class_names() {
        assert_eq!(VmError::NoMemory.class_name(), "NoMemoryError");
        assert_eq!(VmError::fiber("double resume").class_name(), "FiberError");
        assert_eq!(
            VmError::local_jump("break from proc-closure").class_name(),
            "LocalJumpError"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = rite_io::IoError::end_of_stream(4, "header");
        let vm: VmError = io.into();
        assert!(matches!(vm, VmError::Script { .. }));
    }
}
