//! Programmatic irep construction.
//!
//! The compiler is an external collaborator, so tests and embedders that
//! need bytecode assemble it here: emit opcodes with operands (EXT prefixes
//! are inserted automatically when an operand outgrows a byte), pool and
//! symbol entries are deduplicated, and forward jumps are patched by
//! position.

use crate::irep::{Irep, LvEntry, PoolValue};
use crate::opcode::{OpCode, OperandLayout};
use crate::value::{Float, Int};
use crate::vm::Vm;
use std::rc::Rc;

/// Assembles one irep.
#[derive(Debug, Default)]
pub struct IrepBuilder {
    nlocals: u16,
    nregs: u16,
    iseq: Vec<u8>,
    pool: Vec<PoolValue>,
    syms: Vec<String>,
    reps: Vec<Rc<Irep>>,
    lvars: Vec<(Option<String>, u16)>,
}

impl IrepBuilder {
    pub fn new() -> Self {
        Self {
            nlocals: 1,
            nregs: 4,
            ..Default::default()
        }
    }

    /// Locals count (register 0 is self).
    pub fn locals(&mut self, n: u16) -> &mut Self {
        self.nlocals = n;
        self
    }

    /// Frame register count.
    pub fn regs(&mut self, n: u16) -> &mut Self {
        self.nregs = n;
        self
    }

    /// Current instruction offset (jump target / patch position).
    pub fn pos(&self) -> usize {
        self.iseq.len()
    }

    /// Interns a symbol name into this irep's symbol list.
    pub fn sym(&mut self, name: &str) -> usize {
        if let Some(i) = self.syms.iter().position(|s| s == name) {
            return i;
        }
        self.syms.push(name.to_string());
        self.syms.len() - 1
    }

    pub fn pool_str(&mut self, s: &str) -> usize {
        self.pool_entry(PoolValue::Str(s.to_string()))
    }

    pub fn pool_int(&mut self, i: Int) -> usize {
        self.pool_entry(PoolValue::Fixnum(i))
    }

    pub fn pool_float(&mut self, f: Float) -> usize {
        self.pool_entry(PoolValue::Float(f))
    }

    fn pool_entry(&mut self, v: PoolValue) -> usize {
        if let Some(i) = self.pool.iter().position(|p| *p == v) {
            return i;
        }
        self.pool.push(v);
        self.pool.len() - 1
    }

    /// Registers a child irep (block / method / ensure body).
    pub fn child(&mut self, irep: Rc<Irep>) -> usize {
        self.reps.push(irep);
        self.reps.len() - 1
    }

    /// Names a local variable for the LVAR section.
    pub fn lvar(&mut self, name: &str, reg: u16) -> &mut Self {
        self.lvars.push((Some(name.to_string()), reg));
        self
    }

    fn push_b(&mut self, v: u32) {
        debug_assert!(v <= 0xff);
        self.iseq.push(v as u8);
    }

    fn push_s(&mut self, v: u32) {
        debug_assert!(v <= 0xffff);
        self.iseq.push((v >> 8) as u8);
        self.iseq.push(v as u8);
    }

    fn push_w(&mut self, v: u32) {
        debug_assert!(v <= 0xff_ffff);
        self.iseq.push((v >> 16) as u8);
        self.iseq.push((v >> 8) as u8);
        self.iseq.push(v as u8);
    }

    /// Emits a no-operand instruction.
    pub fn op_z(&mut self, op: OpCode) -> &mut Self {
        debug_assert_eq!(op.layout(), OperandLayout::Z);
        self.iseq.push(op as u8);
        self
    }

    /// Emits a one-byte-operand instruction, widening via EXT1 if needed.
    pub fn op_b(&mut self, op: OpCode, a: u32) -> &mut Self {
        debug_assert_eq!(op.layout(), OperandLayout::B);
        if a > 0xff {
            self.iseq.push(OpCode::EXT1 as u8);
            self.iseq.push(op as u8);
            self.push_s(a);
        } else {
            self.iseq.push(op as u8);
            self.push_b(a);
        }
        self
    }

    /// Emits a two-byte-operand instruction with automatic EXT widening.
    pub fn op_bb(&mut self, op: OpCode, a: u32, b: u32) -> &mut Self {
        debug_assert_eq!(op.layout(), OperandLayout::BB);
        match (a > 0xff, b > 0xff) {
            (false, false) => {
                self.iseq.push(op as u8);
                self.push_b(a);
                self.push_b(b);
            }
            (true, false) => {
                self.iseq.push(OpCode::EXT1 as u8);
                self.iseq.push(op as u8);
                self.push_s(a);
                self.push_b(b);
            }
            (false, true) => {
                self.iseq.push(OpCode::EXT2 as u8);
                self.iseq.push(op as u8);
                self.push_b(a);
                self.push_s(b);
            }
            (true, true) => {
                self.iseq.push(OpCode::EXT3 as u8);
                self.iseq.push(op as u8);
                self.push_s(a);
                self.push_s(b);
            }
        }
        self
    }

    /// Emits a three-byte-operand instruction (`c` must stay a byte).
    pub fn op_bbb(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> &mut Self {
        debug_assert_eq!(op.layout(), OperandLayout::BBB);
        match (a > 0xff, b > 0xff) {
            (false, false) => {
                self.iseq.push(op as u8);
                self.push_b(a);
                self.push_b(b);
            }
            (true, false) => {
                self.iseq.push(OpCode::EXT1 as u8);
                self.iseq.push(op as u8);
                self.push_s(a);
                self.push_b(b);
            }
            (false, true) => {
                self.iseq.push(OpCode::EXT2 as u8);
                self.iseq.push(op as u8);
                self.push_b(a);
                self.push_s(b);
            }
            (true, true) => {
                self.iseq.push(OpCode::EXT3 as u8);
                self.iseq.push(op as u8);
                self.push_s(a);
                self.push_s(b);
            }
        }
        self.push_b(c);
        self
    }

    /// Emits a byte + 16-bit-operand instruction.
    pub fn op_bs(&mut self, op: OpCode, a: u32, b: u32) -> &mut Self {
        debug_assert_eq!(op.layout(), OperandLayout::BS);
        if a > 0xff {
            self.iseq.push(OpCode::EXT1 as u8);
            self.iseq.push(op as u8);
            self.push_s(a);
        } else {
            self.iseq.push(op as u8);
            self.push_b(a);
        }
        self.push_s(b);
        self
    }

    /// Emits a 16-bit-operand instruction.
    pub fn op_s(&mut self, op: OpCode, a: u32) -> &mut Self {
        debug_assert_eq!(op.layout(), OperandLayout::S);
        self.iseq.push(op as u8);
        self.push_s(a);
        self
    }

    /// Emits a 24-bit-operand instruction.
    pub fn op_w(&mut self, op: OpCode, a: u32) -> &mut Self {
        debug_assert_eq!(op.layout(), OperandLayout::W);
        self.iseq.push(op as u8);
        self.push_w(a);
        self
    }

    /// Emits a forward jump with a placeholder target; returns the patch
    /// position for [`IrepBuilder::patch_target`].
    pub fn jmp_placeholder(&mut self, op: OpCode) -> usize {
        debug_assert_eq!(op.layout(), OperandLayout::S);
        self.iseq.push(op as u8);
        let pos = self.iseq.len();
        self.push_s(0);
        pos
    }

    /// Emits a conditional forward jump (`JMPIF`/`JMPNOT`/`JMPNIL`) with a
    /// placeholder target.
    pub fn cond_jmp_placeholder(&mut self, op: OpCode, a: u32) -> usize {
        debug_assert_eq!(op.layout(), OperandLayout::BS);
        self.iseq.push(op as u8);
        self.push_b(a);
        let pos = self.iseq.len();
        self.push_s(0);
        pos
    }

    /// Back-fills a jump target recorded by a placeholder.
    pub fn patch_target(&mut self, patch_pos: usize, target: usize) {
        debug_assert!(target <= 0xffff);
        self.iseq[patch_pos] = (target >> 8) as u8;
        self.iseq[patch_pos + 1] = target as u8;
    }

    /// Finishes the irep, interning symbol names into the VM.
    pub fn build(&self, vm: &mut Vm) -> Rc<Irep> {
        let syms = self.syms.iter().map(|s| vm.intern(s)).collect();
        let lvars = self
            .lvars
            .iter()
            .map(|(name, reg)| LvEntry {
                name: name.as_deref().map(|n| vm.intern(n)),
                reg: *reg,
            })
            .collect();
        Rc::new(Irep {
            nlocals: self.nlocals,
            nregs: self.nregs,
            flags: 0,
            iseq: self.iseq.clone(),
            pool: self.pool.clone(),
            syms,
            reps: self.reps.clone(),
            lvars,
            debug: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::{fetch, OpCode};

    #[test]
    fn test_emit_and_fetch() {
        let mut b = IrepBuilder::new();
        b.op_bb(OpCode::MOVE, 1, 2).op_z(OpCode::NOP);
        let mut pc = 0;
        let (op, ops) = fetch(&b.iseq, &mut pc).unwrap();
        assert_eq!(op, OpCode::MOVE);
        assert_eq!((ops.a, ops.b), (1, 2));
        let (op, _) = fetch(&b.iseq, &mut pc).unwrap();
        assert_eq!(op, OpCode::NOP);
    }

    #[test]
    fn test_auto_ext_widening() {
        let mut b = IrepBuilder::new();
        b.op_bb(OpCode::MOVE, 300, 2);
        let mut pc = 0;
        let (op, ops) = fetch(&b.iseq, &mut pc).unwrap();
        assert_eq!(op, OpCode::MOVE);
        assert_eq!((ops.a, ops.b), (300, 2));
    }

    #[test]
    fn test_jump_patching() {
        let mut b = IrepBuilder::new();
        let patch = b.jmp_placeholder(OpCode::JMP);
        b.op_z(OpCode::NOP);
        let target = b.pos();
        b.patch_target(patch, target);
        let mut pc = 0;
        let (op, ops) = fetch(&b.iseq, &mut pc).unwrap();
        assert_eq!(op, OpCode::JMP);
        assert_eq!(ops.a as usize, target);
    }

    #[test]
    fn test_pool_and_sym_dedup() {
        let mut b = IrepBuilder::new();
        assert_eq!(b.pool_int(42), b.pool_int(42));
        assert_ne!(b.pool_int(42), b.pool_int(43));
        assert_eq!(b.sym("each"), b.sym("each"));
    }
}
