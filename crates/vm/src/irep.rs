//! Compiled instruction sequences.
//!
//! An irep is one compiled method/block body: variable-width instruction
//! bytes, a typed constant pool, the symbols the code references, child ireps
//! for nested procs, local-variable metadata, and optional debug line info.
//! Ireps are reference-counted ([`std::rc::Rc`]) so procs that outlive their
//! compilation unit never dangle; they are immutable once built.

use crate::symbol::Sym;
use crate::value::{Float, Int};
use std::rc::Rc;

/// A typed constant-pool entry.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolValue {
    Str(String),
    Fixnum(Int),
    Float(Float),
}

/// Local-variable metadata: name (if not anonymous) and register position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LvEntry {
    pub name: Option<Sym>,
    pub reg: u16,
}

/// Debug line storage for one source file span.
#[derive(Debug, Clone, PartialEq)]
pub enum DebugLines {
    /// Dense: one line number per bytecode offset.
    Ary(Vec<u16>),
    /// Sparse: (start offset, line) pairs sorted by offset.
    FlatMap(Vec<(u32, u16)>),
}

/// Debug info for the part of an irep compiled from one file.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugFile {
    /// First bytecode offset covered by this file.
    pub start_pos: u32,
    pub filename: String,
    pub lines: DebugLines,
}

/// One compiled method or block body.
#[derive(Debug, Default)]
pub struct Irep {
    /// Locals (including self at register 0).
    pub nlocals: u16,
    /// Registers the frame needs.
    pub nregs: u16,
    /// Runtime flags (`IREP_NO_FREE` when backed by static storage).
    pub flags: u8,
    /// Variable-width instruction bytes.
    pub iseq: Vec<u8>,
    /// Constant pool.
    pub pool: Vec<PoolValue>,
    /// Symbols referenced by the code.
    pub syms: Vec<Sym>,
    /// Nested procs/blocks/method bodies.
    pub reps: Vec<Rc<Irep>>,
    /// Local-variable names, one entry per local after self.
    pub lvars: Vec<LvEntry>,
    /// Optional bytecode-offset -> (file, line) mapping.
    pub debug: Vec<DebugFile>,
}

impl Irep {
    /// Looks up the source file and line for a bytecode offset.
    pub fn line_for(&self, pc: usize) -> Option<(&str, u16)> {
        let pc = pc as u32;
        let file = self
            .debug
            .iter()
            .rev()
            .find(|f| f.start_pos <= pc)?;
        let line = match &file.lines {
            DebugLines::Ary(lines) => *lines.get((pc - file.start_pos) as usize)?,
            DebugLines::FlatMap(map) => {
                let idx = map.partition_point(|&(start, _)| start <= pc);
                if idx == 0 {
                    return None;
                }
                map[idx - 1].1
            }
        };
        Some((&file.filename, line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_lookup_dense() {
        let irep = Irep {
            debug: vec![DebugFile {
                start_pos: 0,
                filename: "main.rb".into(),
                lines: DebugLines::Ary(vec![1, 1, 2, 2, 3]),
            }],
            ..Default::default()
        };
        assert_eq!(irep.line_for(0), Some(("main.rb", 1)));
        assert_eq!(irep.line_for(3), Some(("main.rb", 2)));
        assert_eq!(irep.line_for(4), Some(("main.rb", 3)));
        assert_eq!(irep.line_for(99), None);
    }

    #[test]
    fn test_line_lookup_flat_map() {
        let irep = Irep {
            debug: vec![DebugFile {
                start_pos: 0,
                filename: "main.rb".into(),
                lines: DebugLines::FlatMap(vec![(0, 10), (6, 12), (14, 20)]),
            }],
            ..Default::default()
        };
        assert_eq!(irep.line_for(0), Some(("main.rb", 10)));
        assert_eq!(irep.line_for(7), Some(("main.rb", 12)));
        assert_eq!(irep.line_for(14), Some(("main.rb", 20)));
        assert_eq!(irep.line_for(100), Some(("main.rb", 20)));
    }

    #[test]
    fn test_shared_child_survives_parent_drop() {
        let child = Rc::new(Irep {
            nregs: 4,
            ..Default::default()
        });
        let parent = Irep {
            reps: vec![Rc::clone(&child)],
            ..Default::default()
        };
        drop(parent);
        assert_eq!(child.nregs, 4);
    }
}
