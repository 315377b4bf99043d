//! Core interpreter behavior: literals, arithmetic fast paths, jumps,
//! register moves, and the collection literal opcodes.

mod common;

use common::*;
use rite_vm::{Float, Int, IrepBuilder, OpCode, Value};

#[test]
fn test_arithmetic_and_p_output() {
    // p (1 + 2) * 3
    let mut vm = open_vm();
    vm.capture_output();
    let arena_before = vm.arena_save();

    let mut b = IrepBuilder::new();
    let p = b.sym("p");
    b.regs(8)
        .op_b(OpCode::LOADSELF, 1)
        .op_bb(OpCode::LOADI, 2, 1)
        .op_bb(OpCode::LOADI, 3, 2)
        .op_b(OpCode::ADD, 2)
        .op_bb(OpCode::LOADI, 3, 3)
        .op_b(OpCode::MUL, 2)
        .op_bbb(OpCode::SEND, 1, p as u32, 1)
        .op_b(OpCode::RETURN, 1);
    let irep = b.build(&mut vm);

    let result = vm.run_irep(irep).expect("runs clean");
    assert_eq!(result, Value::Fixnum(9));
    assert_eq!(vm.take_output(), "9\n");
    assert!(vm.pending_exception().is_none());
    assert_eq!(vm.arena_save(), arena_before);
}

#[test]
fn test_fixnum_overflow_promotes_to_float() {
    let mut vm = open_vm();
    let mut b = IrepBuilder::new();
    let max = b.pool_int(Int::MAX);
    b.regs(4)
        .op_bb(OpCode::LOADL, 1, max as u32)
        .op_bb(OpCode::ADDI, 1, 1)
        .op_b(OpCode::RETURN, 1);
    let irep = b.build(&mut vm);
    match vm.run_irep(irep).unwrap() {
        Value::Float(f) => assert_eq!(f, Int::MAX as Float + 1.0),
        other => panic!("expected float, got {other:?}"),
    }
}

#[test]
fn test_div_produces_float() {
    let mut vm = open_vm();
    let mut b = IrepBuilder::new();
    b.regs(4)
        .op_bb(OpCode::LOADI, 1, 7)
        .op_bb(OpCode::LOADI, 2, 2)
        .op_b(OpCode::DIV, 1)
        .op_b(OpCode::RETURN, 1);
    let irep = b.build(&mut vm);
    assert_eq!(vm.run_irep(irep).unwrap(), Value::Float(3.5));
}

#[test]
fn test_conditional_jumps() {
    let mut vm = open_vm();
    let mut b = IrepBuilder::new();
    b.regs(4).op_b(OpCode::LOADNIL, 1);
    let patch = b.cond_jmp_placeholder(OpCode::JMPNIL, 1);
    b.op_bb(OpCode::LOADI, 2, 1).op_b(OpCode::RETURN, 2);
    let target = b.pos();
    b.patch_target(patch, target);
    b.op_bb(OpCode::LOADI, 2, 2).op_b(OpCode::RETURN, 2);
    let irep = b.build(&mut vm);
    assert_eq!(vm.run_irep(irep).unwrap(), Value::Fixnum(2));
}

#[test]
fn test_comparisons() {
    let mut vm = open_vm();
    // 3 < 5
    let mut b = IrepBuilder::new();
    b.regs(4)
        .op_bb(OpCode::LOADI, 1, 3)
        .op_bb(OpCode::LOADI, 2, 5)
        .op_b(OpCode::LT, 1)
        .op_b(OpCode::RETURN, 1);
    let irep = b.build(&mut vm);
    assert_eq!(vm.run_irep(irep).unwrap(), Value::True);

    // 3 == 3.0 (mixed numeric equality)
    let mut b = IrepBuilder::new();
    let f = b.pool_float(3.0);
    b.regs(4)
        .op_bb(OpCode::LOADI, 1, 3)
        .op_bb(OpCode::LOADL, 2, f as u32)
        .op_b(OpCode::EQ, 1)
        .op_b(OpCode::RETURN, 1);
    let irep = b.build(&mut vm);
    assert_eq!(vm.run_irep(irep).unwrap(), Value::True);
}

#[test]
fn test_string_literals_and_concat() {
    let mut vm = open_vm();
    let mut b = IrepBuilder::new();
    let ab = b.pool_str("ab");
    let cd = b.pool_str("cd");
    b.regs(4)
        .op_bb(OpCode::STRING, 1, ab as u32)
        .op_bb(OpCode::STRING, 2, cd as u32)
        .op_b(OpCode::ADD, 1)
        .op_b(OpCode::RETURN, 1);
    let irep = b.build(&mut vm);
    let v = vm.run_irep(irep).unwrap();
    assert_eq!(as_str(&vm, v), "abcd");
}

#[test]
fn test_intern_opcode() {
    let mut vm = open_vm();
    let mut b = IrepBuilder::new();
    let s = b.pool_str("hello");
    b.regs(4)
        .op_bb(OpCode::STRING, 1, s as u32)
        .op_b(OpCode::INTERN, 1)
        .op_b(OpCode::RETURN, 1);
    let irep = b.build(&mut vm);
    match vm.run_irep(irep).unwrap() {
        Value::Symbol(sym) => assert_eq!(vm.sym_name(sym), "hello"),
        other => panic!("expected symbol, got {other:?}"),
    }
}

#[test]
fn test_array_literal_and_element_ops() {
    let mut vm = open_vm();
    let mut b = IrepBuilder::new();
    b.regs(8)
        .op_bb(OpCode::LOADI, 1, 1)
        .op_bb(OpCode::LOADI, 2, 2)
        .op_bb(OpCode::LOADI, 3, 3)
        .op_bb(OpCode::ARRAY, 1, 3)
        .op_bbb(OpCode::AREF, 2, 1, 1)
        .op_b(OpCode::RETURN, 2);
    let irep = b.build(&mut vm);
    assert_eq!(vm.run_irep(irep).unwrap(), Value::Fixnum(2));
}

#[test]
fn test_post_destructuring() {
    // a, *m, x, y = [1, 2, 3, 4, 5]  -> m == [2, 3] with pre=1, post=2
    let mut vm = open_vm();
    let mut b = IrepBuilder::new();
    b.regs(10)
        .op_bb(OpCode::LOADI, 1, 1)
        .op_bb(OpCode::LOADI, 2, 2)
        .op_bb(OpCode::LOADI, 3, 3)
        .op_bb(OpCode::LOADI, 4, 4)
        .op_bb(OpCode::LOADI, 5, 5)
        .op_bb(OpCode::ARRAY, 1, 5)
        .op_bbb(OpCode::APOST, 1, 1, 2)
        .op_bb(OpCode::ARRAY, 1, 3)
        .op_b(OpCode::RETURN, 1);
    let irep = b.build(&mut vm);
    let v = vm.run_irep(irep).unwrap();
    let items = as_ary(&vm, v);
    assert_eq!(items.len(), 3);
    assert_eq!(as_ary(&vm, items[0]), vec![Value::Fixnum(2), Value::Fixnum(3)]);
    assert_eq!(items[1], Value::Fixnum(4));
    assert_eq!(items[2], Value::Fixnum(5));
}

#[test]
fn test_hash_literal_and_merge() {
    let mut vm = open_vm();
    let mut b = IrepBuilder::new();
    let a_sym = b.sym("a");
    let b_sym = b.sym("b");
    b.regs(8)
        .op_bb(OpCode::LOADSYM, 1, a_sym as u32)
        .op_bb(OpCode::LOADI, 2, 1)
        .op_bb(OpCode::HASH, 1, 1)
        .op_bb(OpCode::LOADSYM, 2, b_sym as u32)
        .op_bb(OpCode::LOADI, 3, 2)
        .op_bb(OpCode::HASHADD, 1, 1)
        .op_b(OpCode::RETURN, 1);
    let irep = b.build(&mut vm);
    let v = vm.run_irep(irep).unwrap();
    let h = v.obj().expect("hash");
    let a = vm.intern("a");
    let bk = vm.intern("b");
    assert_eq!(vm.hash_get(h, Value::Symbol(a)).unwrap(), Value::Fixnum(1));
    assert_eq!(vm.hash_get(h, Value::Symbol(bk)).unwrap(), Value::Fixnum(2));
    assert_eq!(vm.hash_len(h), 2);
}

#[test]
fn test_range_construction() {
    let mut vm = open_vm();
    let mut b = IrepBuilder::new();
    b.regs(4)
        .op_bb(OpCode::LOADI, 1, 1)
        .op_bb(OpCode::LOADI, 2, 5)
        .op_b(OpCode::RANGE_INC, 1)
        .op_b(OpCode::RETURN, 1);
    let irep = b.build(&mut vm);
    let v = vm.run_irep(irep).unwrap();
    assert_eq!(vm.value_inspect(v), "1..5");
}

#[test]
fn test_wide_registers_via_ext_prefixes() {
    let mut vm = open_vm();
    let mut b = IrepBuilder::new();
    b.regs(310)
        .op_bb(OpCode::LOADI, 300, 7)
        .op_bb(OpCode::MOVE, 1, 300)
        .op_b(OpCode::RETURN, 1);
    let irep = b.build(&mut vm);
    assert_eq!(vm.run_irep(irep).unwrap(), Value::Fixnum(7));
}

#[test]
fn test_global_variables() {
    let mut vm = open_vm();
    let mut b = IrepBuilder::new();
    let g = b.sym("$counter");
    b.regs(4)
        .op_bb(OpCode::LOADI, 1, 41)
        .op_bb(OpCode::ADDI, 1, 1)
        .op_bb(OpCode::SETGV, 1, g as u32)
        .op_bb(OpCode::GETGV, 2, g as u32)
        .op_b(OpCode::RETURN, 2);
    let irep = b.build(&mut vm);
    assert_eq!(vm.run_irep(irep).unwrap(), Value::Fixnum(42));
    assert_eq!(vm.global_get("$counter"), Value::Fixnum(42));
}

#[test]
fn test_inspect_round_trip_literals() {
    let mut vm = open_vm();
    assert_eq!(vm.value_inspect(Value::Nil), "nil");
    assert_eq!(vm.value_inspect(Value::True), "true");
    assert_eq!(vm.value_inspect(Value::False), "false");
    assert_eq!(vm.value_inspect(Value::Fixnum(-42)), "-42");
    assert_eq!(vm.value_inspect(Value::Float(3.0)), "3.0");
    let s = vm.intern("sym");
    assert_eq!(vm.value_inspect(Value::Symbol(s)), ":sym");
    let str_obj = vm.str_new("a\"b").unwrap();
    assert_eq!(vm.value_inspect(Value::Obj(str_obj)), "\"a\\\"b\"");
}
