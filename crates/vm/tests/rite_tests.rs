//! The rite compiled-unit format: round trips, checksum validation, and
//! endianness autodetection.

mod common;

use common::*;
use rite_vm::dump::dump_rite;
use rite_vm::loader::read_rite;
use rite_vm::{Endian, IrepBuilder, OpCode, Value};

/// A small but representative program: pool entries of every type, symbols,
/// a child irep, and named locals.
fn sample_irep(vm: &mut rite_vm::Vm) -> std::rc::Rc<rite_vm::Irep> {
    let mut child = IrepBuilder::new();
    child.locals(2).regs(4);
    child
        .op_w(OpCode::ENTER, 0)
        .op_bb(OpCode::LOADI, 2, 5)
        .op_b(OpCode::RETURN, 2);
    let child_irep = child.build(vm);

    let mut b = IrepBuilder::new();
    let s = b.pool_str("hello");
    let i = b.pool_int(1234);
    let f = b.pool_float(2.5);
    let _p = b.sym("p");
    let _each = b.sym("each");
    b.locals(2).regs(8).lvar("x", 1);
    let ci = b.child(child_irep);
    b.op_bb(OpCode::STRING, 1, s as u32)
        .op_bb(OpCode::LOADL, 2, i as u32)
        .op_bb(OpCode::LOADL, 3, f as u32)
        .op_bb(OpCode::BLOCK, 4, ci as u32)
        .op_b(OpCode::RETURN, 2);
    b.build(vm)
}

#[test]
fn test_dump_load_round_trip_bytes() {
    let mut vm = open_vm();
    let irep = sample_irep(&mut vm);
    let bytes = vm.dump(&irep);

    let reloaded = read_rite(&mut vm, &bytes).expect("loads back");
    assert_eq!(reloaded.nlocals, irep.nlocals);
    assert_eq!(reloaded.nregs, irep.nregs);
    assert_eq!(reloaded.iseq, irep.iseq);
    assert_eq!(reloaded.pool, irep.pool);
    assert_eq!(reloaded.syms, irep.syms);
    assert_eq!(reloaded.reps.len(), 1);
    assert_eq!(reloaded.lvars, irep.lvars);

    // dump(load(bytes)) == bytes
    let bytes2 = vm.dump(&reloaded);
    assert_eq!(bytes2, bytes);
}

#[test]
fn test_little_endian_round_trip() {
    let mut vm = open_vm();
    let irep = sample_irep(&mut vm);
    let bytes = dump_rite(&vm, &irep, Endian::Little);
    assert_eq!(&bytes[0..4], b"RITL");
    let reloaded = read_rite(&mut vm, &bytes).expect("little-endian loads");
    assert_eq!(reloaded.iseq, irep.iseq);
    assert_eq!(dump_rite(&vm, &reloaded, Endian::Little), bytes);
}

#[test]
fn test_checksum_mismatch_rejected() {
    let mut vm = open_vm();
    let irep = sample_irep(&mut vm);
    let mut bytes = vm.dump(&irep);
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    let err = read_rite(&mut vm, &bytes).unwrap_err();
    assert!(err.to_string().contains("checksum"), "got: {err}");
}

#[test]
fn test_truncated_binary_rejected() {
    let mut vm = open_vm();
    let irep = sample_irep(&mut vm);
    let bytes = vm.dump(&irep);
    assert!(read_rite(&mut vm, &bytes[..10]).is_err());
    assert!(read_rite(&mut vm, &bytes[..bytes.len() / 2]).is_err());
}

#[test]
fn test_bad_ident_rejected() {
    let mut vm = open_vm();
    let irep = sample_irep(&mut vm);
    let mut bytes = vm.dump(&irep);
    bytes[0] = b'X';
    let err = read_rite(&mut vm, &bytes).unwrap_err();
    assert!(err.to_string().contains("ident"), "got: {err}");
}

#[test]
fn test_load_executes_top_level() {
    let mut vm = open_vm();
    let mut b = IrepBuilder::new();
    b.regs(4)
        .op_bb(OpCode::LOADI, 1, 6)
        .op_bb(OpCode::LOADI, 2, 7)
        .op_b(OpCode::MUL, 1)
        .op_b(OpCode::RETURN, 1);
    let irep = b.build(&mut vm);
    let bytes = vm.dump(&irep);

    let result = vm.load(&bytes).expect("loads and runs");
    assert_eq!(result, Value::Fixnum(42));
}

#[test]
fn test_load_propagates_uncaught_exception() {
    let mut vm = open_vm();
    let mut b = IrepBuilder::new();
    let raise_sym = b.sym("raise");
    let msg = b.pool_str("loaded failure");
    b.regs(6)
        .op_b(OpCode::LOADSELF, 1)
        .op_bb(OpCode::STRING, 2, msg as u32)
        .op_bbb(OpCode::SEND, 1, raise_sym as u32, 1)
        .op_b(OpCode::RETURN, 1);
    let irep = b.build(&mut vm);
    let bytes = vm.dump(&irep);

    let err = vm.load(&bytes).unwrap_err();
    assert_eq!(err_class(&vm, &err), "RuntimeError");
    assert!(vm.pending_exception().is_none());
}
