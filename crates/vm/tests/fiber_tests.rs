//! Fibers: resume/yield from bytecode and from the host boundary.

mod common;

use common::*;
use rite_vm::{IrepBuilder, OpCode, Value};

/// Builds `Fiber.new { Fiber.yield 1; Fiber.yield 2; 3 }` and stores it in
/// `$fib`, returning the main irep.
fn fiber_program(vm: &mut rite_vm::Vm, resumes_in_bytecode: bool) -> std::rc::Rc<rite_vm::Irep> {
    // fiber body
    let mut body = IrepBuilder::new();
    let fiber_const = body.sym("Fiber");
    let yield_sym = body.sym("yield");
    body.locals(2).regs(8);
    body.op_w(OpCode::ENTER, 0);
    for i in 1..=2 {
        body.op_bb(OpCode::GETCONST, 2, fiber_const as u32)
            .op_bb(OpCode::LOADI, 3, i)
            .op_bbb(OpCode::SEND, 2, yield_sym as u32, 1);
    }
    body.op_bb(OpCode::LOADI, 2, 3).op_b(OpCode::RETURN, 2);
    let body_irep = body.build(vm);

    let mut b = IrepBuilder::new();
    let fiber_const = b.sym("Fiber");
    let new_sym = b.sym("new");
    let resume = b.sym("resume");
    let fib_gv = b.sym("$fib");
    b.regs(10);
    let ci = b.child(body_irep);
    b.op_bb(OpCode::BLOCK, 2, ci as u32)
        .op_bb(OpCode::GETCONST, 1, fiber_const as u32)
        .op_bbb(OpCode::SENDB, 1, new_sym as u32, 0)
        .op_bb(OpCode::SETGV, 1, fib_gv as u32);
    if resumes_in_bytecode {
        b.op_bb(OpCode::MOVE, 2, 1)
            .op_bbb(OpCode::SEND, 2, resume as u32, 0)
            .op_bb(OpCode::MOVE, 3, 1)
            .op_bbb(OpCode::SEND, 3, resume as u32, 0)
            .op_bb(OpCode::MOVE, 4, 1)
            .op_bbb(OpCode::SEND, 4, resume as u32, 0)
            .op_bb(OpCode::ARRAY, 2, 3)
            .op_b(OpCode::RETURN, 2);
    } else {
        b.op_b(OpCode::RETURN, 1);
    }
    b.build(vm)
}

#[test]
fn test_fiber_resume_yield_in_bytecode() {
    let mut vm = open_vm();
    let main = fiber_program(&mut vm, true);
    let v = vm.run_irep(main).expect("fiber program runs");
    assert_eq!(
        as_ary(&vm, v),
        vec![Value::Fixnum(1), Value::Fixnum(2), Value::Fixnum(3)]
    );

    // a fourth resume raises FiberError
    let fib = vm.global_get("$fib");
    let err = vm.funcall(fib, "resume", &[]).unwrap_err();
    assert_eq!(err_class(&vm, &err), "FiberError");
}

#[test]
fn test_fiber_resume_from_host_boundary() {
    let mut vm = open_vm();
    let main = fiber_program(&mut vm, false);
    vm.run_irep(main).expect("fiber created");
    let fib = vm.global_get("$fib");

    assert_eq!(vm.funcall(fib, "resume", &[]).unwrap(), Value::Fixnum(1));
    assert_eq!(vm.funcall(fib, "alive?", &[]).unwrap(), Value::True);
    assert_eq!(vm.funcall(fib, "resume", &[]).unwrap(), Value::Fixnum(2));
    assert_eq!(vm.funcall(fib, "resume", &[]).unwrap(), Value::Fixnum(3));
    assert_eq!(vm.funcall(fib, "alive?", &[]).unwrap(), Value::False);

    let err = vm.funcall(fib, "resume", &[]).unwrap_err();
    assert_eq!(err_class(&vm, &err), "FiberError");
}

#[test]
fn test_fiber_first_resume_arguments() {
    let mut vm = open_vm();

    // Fiber.new { |a, b| a + b }
    let mut body = IrepBuilder::new();
    body.locals(4).regs(8);
    body.op_w(
        OpCode::ENTER,
        rite_vm::Aspec::new(2, 0, false, 0, 0, false, false).0,
    )
    .op_b(OpCode::ADD, 1)
    .op_b(OpCode::RETURN, 1);
    let body_irep = body.build(&mut vm);

    let mut b = IrepBuilder::new();
    let fiber_const = b.sym("Fiber");
    let new_sym = b.sym("new");
    b.regs(6);
    let ci = b.child(body_irep);
    b.op_bb(OpCode::BLOCK, 2, ci as u32)
        .op_bb(OpCode::GETCONST, 1, fiber_const as u32)
        .op_bbb(OpCode::SENDB, 1, new_sym as u32, 0)
        .op_b(OpCode::RETURN, 1);
    let main = b.build(&mut vm);
    let fib = vm.run_irep(main).unwrap();

    let v = vm
        .funcall(fib, "resume", &[Value::Fixnum(20), Value::Fixnum(22)])
        .unwrap();
    assert_eq!(v, Value::Fixnum(42));
}

#[test]
fn test_yield_from_root_fiber_errors() {
    let mut vm = open_vm();
    let mut b = IrepBuilder::new();
    let fiber_const = b.sym("Fiber");
    let yield_sym = b.sym("yield");
    b.regs(6)
        .op_bb(OpCode::GETCONST, 1, fiber_const as u32)
        .op_bb(OpCode::LOADI, 2, 1)
        .op_bbb(OpCode::SEND, 1, yield_sym as u32, 1)
        .op_b(OpCode::RETURN, 1);
    let main = b.build(&mut vm);
    let err = vm.run_irep(main).unwrap_err();
    assert_eq!(err_class(&vm, &err), "FiberError");
}

#[test]
fn test_fiber_new_without_block_errors() {
    let mut vm = open_vm();
    let fiber_cls = Value::Obj(vm.fiber_class);
    let err = vm.funcall(fiber_cls, "new", &[]).unwrap_err();
    assert_eq!(err_class(&vm, &err), "ArgumentError");
}
