//! # RiteVM
//!
//! An embeddable Ruby-family language runtime: a register-based bytecode
//! virtual machine over a dynamically typed object model, collected by a
//! tri-color incremental garbage collector.
//!
//! The VM state is a single explicit handle — nothing in this crate is
//! process-global — so a host can run several independent VMs as long as
//! each stays on one thread. Compiled units arrive in the rite binary
//! format (the compiler is an external collaborator); the [`IrepBuilder`]
//! assembles bytecode programmatically for tests and embedding.
//!
//! ## Architecture
//!
//! - **Vm**: the state handle — heap, GC, symbols, globals, contexts,
//!   method cache, pending exception
//! - **Heap / Gc**: fixed-slot pages with per-page free lists, swept by an
//!   incremental two-white collector with generational mode and write
//!   barriers
//! - **Class model**: method tables per class, module inclusion through
//!   iclass proxy nodes, prepend via origin nodes, lazy singleton classes
//! - **Interpreter**: variable-width bytecode with EXT-prefix widening,
//!   arithmetic fast paths, callee-side argument binding, rescue/ensure
//!   stacks, and break/return non-local exits
//! - **Fibers**: per-fiber value and call-info stacks; resume/yield swap
//!   the current-context pointer
//!
//! ## Example
//!
//! ```rust
//! use rite_vm::{IrepBuilder, OpCode, Value, Vm};
//!
//! # fn main() -> rite_vm::VmResult<()> {
//! let mut vm = Vm::open()?;
//!
//! // (1 + 2) * 3
//! let mut b = IrepBuilder::new();
//! b.regs(4)
//!     .op_bb(OpCode::LOADI, 1, 1)
//!     .op_bb(OpCode::LOADI, 2, 2)
//!     .op_b(OpCode::ADD, 1)
//!     .op_bb(OpCode::LOADI, 2, 3)
//!     .op_b(OpCode::MUL, 1)
//!     .op_b(OpCode::RETURN, 1);
//! let irep = b.build(&mut vm);
//!
//! let result = vm.run_irep(irep)?;
//! assert_eq!(result, Value::Fixnum(9));
//! # Ok(())
//! # }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

/// Embedding surface: load, define, get_args.
pub mod api;
/// Callee-side argument spec (the ENTER operand).
pub mod args;
/// Minimal array surface the VM depends on.
pub mod array;
/// Programmatic bytecode assembly.
pub mod builder;
/// Per-call frame metadata.
pub mod callinfo;
/// Classes, modules, iclass chains, and method resolution.
pub mod class;
/// Per-fiber execution contexts.
pub mod context;
/// Writer for the rite compiled-unit format.
pub mod dump;
/// Captured local-variable frames backing closures.
pub mod env;
/// VM error types and result handling.
pub mod error;
/// Exception objects and raise machinery.
pub mod exception;
/// The dispatch loop.
mod exec;
/// Fibers and context switching.
pub mod fiber;
/// Tri-color incremental garbage collector.
pub mod gc;
/// Minimal hash surface the VM depends on.
pub mod hash;
/// Heap pages and the slot allocator.
pub mod heap;
/// Compiled instruction sequences.
pub mod irep;
/// Instance-variable tables.
pub mod ivtable;
/// Intrinsic method surface.
mod kernel;
/// Reader for the rite compiled-unit format.
pub mod loader;
/// Fixnum/float arithmetic with overflow detection.
pub mod numeric;
/// Opcode definitions and the variable-width fetch.
pub mod opcode;
/// Proc objects.
pub mod procs;
/// Range construction.
pub mod range;
/// Minimal string surface and inspect.
pub mod string;
/// Symbol interning.
pub mod symbol;
/// The VM state handle.
pub mod vm;

/// Heap object headers and payloads.
pub mod object;
/// Tagged value representation.
pub mod value;

pub use api::Arg;
pub use args::Aspec;
pub use rite_io::Endian;
pub use builder::IrepBuilder;
pub use class::{Method, MethodTable};
pub use context::FiberStatus;
pub use error::{VmError, VmResult};
pub use gc::GcState;
pub use irep::{Irep, PoolValue};
pub use opcode::{OpCode, Operands, OperandLayout};
pub use symbol::Sym;
pub use value::{Float, Int, ObjId, Value, Vtype};
pub use vm::{Vm, VmConfig};
