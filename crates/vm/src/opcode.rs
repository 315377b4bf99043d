//! Opcode definitions and the variable-width fetch.
//!
//! Instructions are an opcode byte followed by operands drawn from
//! {B = u8, S = u16, W = u24, Z = none}, big-endian within the stream. The
//! `EXT1`/`EXT2`/`EXT3` prefixes re-decode the next instruction's byte
//! operands one size wider (B -> S) for the first, second, or both operand
//! positions, letting small bodies stay compact while large ones still
//! address many registers.

use once_cell::sync::Lazy;

/// Operand layout of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandLayout {
    /// No operands.
    Z,
    /// One byte operand.
    B,
    /// Two byte operands.
    BB,
    /// Three byte operands.
    BBB,
    /// Byte + 16-bit operand.
    BS,
    /// One 16-bit operand.
    S,
    /// One 24-bit operand.
    W,
}

macro_rules! opcodes {
    ($(($name:ident, $layout:ident)),* $(,)?) => {
        /// VM instruction set.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum OpCode {
            $($name),*
        }

        impl OpCode {
            /// Every opcode, in numeric order.
            pub const ALL: &'static [OpCode] = &[$(OpCode::$name),*];

            /// The operand layout of this opcode.
            pub fn layout(self) -> OperandLayout {
                match self {
                    $(OpCode::$name => OperandLayout::$layout),*
                }
            }
        }
    };
}

opcodes! {
    (NOP, Z),
    (MOVE, BB),
    (LOADL, BB),
    (LOADI, BB),
    (LOADINEG, BB),
    (LOADI_M1, B),
    (LOADI_0, B),
    (LOADI_1, B),
    (LOADI_2, B),
    (LOADI_3, B),
    (LOADI_4, B),
    (LOADI_5, B),
    (LOADI_6, B),
    (LOADI_7, B),
    (LOADSYM, BB),
    (LOADNIL, B),
    (LOADSELF, B),
    (LOADT, B),
    (LOADF, B),
    (GETGV, BB),
    (SETGV, BB),
    (GETSV, BB),
    (SETSV, BB),
    (GETIV, BB),
    (SETIV, BB),
    (GETCV, BB),
    (SETCV, BB),
    (GETCONST, BB),
    (SETCONST, BB),
    (GETMCNST, BB),
    (SETMCNST, BB),
    (GETUPVAR, BBB),
    (SETUPVAR, BBB),
    (JMP, S),
    (JMPIF, BS),
    (JMPNOT, BS),
    (JMPNIL, BS),
    (ONERR, S),
    (EXCEPT, B),
    (RESCUE, BB),
    (POPERR, B),
    (RAISE, B),
    (EPUSH, B),
    (EPOP, B),
    (SENDV, BB),
    (SENDVB, BB),
    (SEND, BBB),
    (SENDB, BBB),
    (CALL, Z),
    (SUPER, BB),
    (ARGARY, BS),
    (ENTER, W),
    (KARG, BB),
    (KEY_P, BB),
    (KEYEND, Z),
    (RETURN, B),
    (RETURN_BLK, B),
    (BREAK, B),
    (BLKPUSH, BS),
    (ADD, B),
    (ADDI, BB),
    (SUB, B),
    (SUBI, BB),
    (MUL, B),
    (DIV, B),
    (EQ, B),
    (LT, B),
    (LE, B),
    (GT, B),
    (GE, B),
    (ARRAY, BB),
    (ARRAY2, BBB),
    (ARYCAT, B),
    (ARYPUSH, B),
    (ARYDUP, B),
    (AREF, BBB),
    (ASET, BBB),
    (APOST, BBB),
    (INTERN, B),
    (STRING, BB),
    (STRCAT, B),
    (HASH, BB),
    (HASHADD, BB),
    (HASHCAT, B),
    (LAMBDA, BB),
    (BLOCK, BB),
    (METHOD, BB),
    (RANGE_INC, B),
    (RANGE_EXC, B),
    (OCLASS, B),
    (CLASS, BB),
    (MODULE, BB),
    (EXEC, BB),
    (DEF, BB),
    (ALIAS, BB),
    (UNDEF, B),
    (SCLASS, B),
    (TCLASS, B),
    (DEBUG, BBB),
    (ERR, B),
    (EXT1, Z),
    (EXT2, Z),
    (EXT3, Z),
    (STOP, Z),
}

static FROM_U8: Lazy<[Option<OpCode>; 256]> = Lazy::new(|| {
    let mut table = [None; 256];
    for &op in OpCode::ALL {
        table[op as usize] = Some(op);
    }
    table
});

impl OpCode {
    /// Decodes an opcode byte.
    pub fn from_u8(byte: u8) -> Option<OpCode> {
        FROM_U8[byte as usize]
    }
}

/// Decoded operands; unused positions are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Operands {
    pub a: u32,
    pub b: u32,
    pub c: u32,
}

/// Which byte operands the pending EXT prefix widens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ext {
    None,
    One,
    Two,
    Three,
}

fn read_b(iseq: &[u8], pc: &mut usize) -> u32 {
    let v = iseq[*pc] as u32;
    *pc += 1;
    v
}

fn read_s(iseq: &[u8], pc: &mut usize) -> u32 {
    let v = ((iseq[*pc] as u32) << 8) | iseq[*pc + 1] as u32;
    *pc += 2;
    v
}

fn read_w(iseq: &[u8], pc: &mut usize) -> u32 {
    let v = ((iseq[*pc] as u32) << 16) | ((iseq[*pc + 1] as u32) << 8) | iseq[*pc + 2] as u32;
    *pc += 3;
    v
}

/// Fetches one instruction at `pc`, resolving EXT prefixes. Returns `None`
/// on an invalid opcode byte or a truncated sequence (the caller raises).
pub fn fetch(iseq: &[u8], pc: &mut usize) -> Option<(OpCode, Operands)> {
    let mut ext = Ext::None;
    loop {
        let op = OpCode::from_u8(*iseq.get(*pc)?)?;
        *pc += 1;
        match op {
            OpCode::EXT1 => {
                ext = Ext::One;
                continue;
            }
            OpCode::EXT2 => {
                ext = Ext::Two;
                continue;
            }
            OpCode::EXT3 => {
                ext = Ext::Three;
                continue;
            }
            _ => {}
        }
        let wide_a = matches!(ext, Ext::One | Ext::Three);
        let wide_b = matches!(ext, Ext::Two | Ext::Three);
        let needed = match op.layout() {
            OperandLayout::Z => 0,
            OperandLayout::B => 1 + wide_a as usize,
            OperandLayout::BB => 2 + wide_a as usize + wide_b as usize,
            OperandLayout::BBB => 3 + wide_a as usize + wide_b as usize,
            OperandLayout::BS => 3 + wide_a as usize,
            OperandLayout::S => 2,
            OperandLayout::W => 3,
        };
        if *pc + needed > iseq.len() {
            return None;
        }
        let mut ops = Operands::default();
        match op.layout() {
            OperandLayout::Z => {}
            OperandLayout::B => {
                ops.a = if wide_a {
                    read_s(iseq, pc)
                } else {
                    read_b(iseq, pc)
                };
            }
            OperandLayout::BB => {
                ops.a = if wide_a {
                    read_s(iseq, pc)
                } else {
                    read_b(iseq, pc)
                };
                ops.b = if wide_b {
                    read_s(iseq, pc)
                } else {
                    read_b(iseq, pc)
                };
            }
            OperandLayout::BBB => {
                ops.a = if wide_a {
                    read_s(iseq, pc)
                } else {
                    read_b(iseq, pc)
                };
                ops.b = if wide_b {
                    read_s(iseq, pc)
                } else {
                    read_b(iseq, pc)
                };
                ops.c = read_b(iseq, pc);
            }
            OperandLayout::BS => {
                ops.a = if wide_a {
                    read_s(iseq, pc)
                } else {
                    read_b(iseq, pc)
                };
                ops.b = read_s(iseq, pc);
            }
            OperandLayout::S => {
                ops.a = read_s(iseq, pc);
            }
            OperandLayout::W => {
                ops.a = read_w(iseq, pc);
            }
        }
        return Some((op, ops));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_opcodes() {
        for &op in OpCode::ALL {
            assert_eq!(OpCode::from_u8(op as u8), Some(op));
        }
    }

    #[test]
    fn test_fetch_bb() {
        let iseq = [OpCode::MOVE as u8, 3, 7];
        let mut pc = 0;
        let (op, ops) = fetch(&iseq, &mut pc).unwrap();
        assert_eq!(op, OpCode::MOVE);
        assert_eq!((ops.a, ops.b), (3, 7));
        assert_eq!(pc, 3);
    }

    #[test]
    fn test_fetch_s_is_big_endian() {
        let iseq = [OpCode::JMP as u8, 0x01, 0x02];
        let mut pc = 0;
        let (op, ops) = fetch(&iseq, &mut pc).unwrap();
        assert_eq!(op, OpCode::JMP);
        assert_eq!(ops.a, 0x0102);
    }

    #[test]
    fn test_fetch_w() {
        let iseq = [OpCode::ENTER as u8, 0x01, 0x02, 0x03];
        let mut pc = 0;
        let (_, ops) = fetch(&iseq, &mut pc).unwrap();
        assert_eq!(ops.a, 0x010203);
        assert_eq!(pc, 4);
    }

    #[test]
    fn test_ext1_widens_first_operand() {
        let iseq = [OpCode::EXT1 as u8, OpCode::MOVE as u8, 0x01, 0x02, 9];
        let mut pc = 0;
        let (op, ops) = fetch(&iseq, &mut pc).unwrap();
        assert_eq!(op, OpCode::MOVE);
        assert_eq!((ops.a, ops.b), (0x0102, 9));
    }

    #[test]
    fn test_ext3_widens_both() {
        let iseq = [
            OpCode::EXT3 as u8,
            OpCode::MOVE as u8,
            0x01,
            0x00,
            0x02,
            0x00,
        ];
        let mut pc = 0;
        let (op, ops) = fetch(&iseq, &mut pc).unwrap();
        assert_eq!(op, OpCode::MOVE);
        assert_eq!((ops.a, ops.b), (0x0100, 0x0200));
    }

    #[test]
    fn test_invalid_opcode() {
        let iseq = [0xff];
        let mut pc = 0;
        assert!(fetch(&iseq, &mut pc).is_none());
    }
}
