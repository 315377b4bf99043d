//! Raise, rescue matching, ensure execution, and keyword-argument errors.

mod common;

use common::*;
use rite_vm::args::Aspec;
use rite_vm::{IrepBuilder, OpCode, Value};

/// The S2 shape: an inner begin/ensure inside an outer begin/rescue.
///
/// ```text
/// begin
///   begin
///     raise "x"
///   ensure
///     $trace = ($trace || "") + "A"
///   end
/// rescue RuntimeError => e
///   $trace += "B"
///   $msg = e.message
/// end
/// ```
#[test]
fn test_ensure_runs_before_rescue() {
    let mut vm = open_vm();

    // ensure body: $trace = ($trace || "") + "A"
    let mut ens = IrepBuilder::new();
    let trace = ens.sym("$trace");
    let a_lit = ens.pool_str("A");
    let empty = ens.pool_str("");
    ens.locals(2).regs(6);
    ens.op_w(OpCode::ENTER, 0)
        .op_bb(OpCode::GETGV, 2, trace as u32);
    let to_concat = ens.cond_jmp_placeholder(OpCode::JMPIF, 2);
    ens.op_bb(OpCode::STRING, 2, empty as u32);
    let target = ens.pos();
    ens.patch_target(to_concat, target);
    ens.op_bb(OpCode::STRING, 3, a_lit as u32)
        .op_b(OpCode::ADD, 2)
        .op_bb(OpCode::SETGV, 2, trace as u32)
        .op_b(OpCode::RETURN, 2);
    let ens_irep = ens.build(&mut vm);

    let mut b = IrepBuilder::new();
    let raise_sym = b.sym("raise");
    let runtime_error = b.sym("RuntimeError");
    let message = b.sym("message");
    let trace = b.sym("$trace");
    let msg_gv = b.sym("$msg");
    let x_lit = b.pool_str("x");
    let b_lit = b.pool_str("B");
    b.regs(8);
    let ens_ci = b.child(ens_irep);

    let onerr_outer = b.jmp_placeholder(OpCode::ONERR);
    let onerr_inner = b.jmp_placeholder(OpCode::ONERR);
    b.op_b(OpCode::EPUSH, ens_ci as u32)
        .op_b(OpCode::LOADSELF, 1)
        .op_bb(OpCode::STRING, 2, x_lit as u32)
        .op_bbb(OpCode::SEND, 1, raise_sym as u32, 1)
        // normal path (unreachable here)
        .op_b(OpCode::POPERR, 1)
        .op_b(OpCode::EPOP, 1);
    let to_done_a = b.jmp_placeholder(OpCode::JMP);

    // inner handler: run the ensure, then re-raise
    let inner = b.pos();
    b.patch_target(onerr_inner, inner);
    b.op_b(OpCode::EXCEPT, 1)
        .op_b(OpCode::EPOP, 1)
        .op_b(OpCode::RAISE, 1);

    // outer handler: match RuntimeError
    let outer = b.pos();
    b.patch_target(onerr_outer, outer);
    b.op_b(OpCode::EXCEPT, 1)
        .op_bb(OpCode::GETCONST, 2, runtime_error as u32)
        .op_bb(OpCode::RESCUE, 1, 2);
    let to_reraise = b.cond_jmp_placeholder(OpCode::JMPNOT, 2);
    // $trace += "B"
    b.op_bb(OpCode::GETGV, 2, trace as u32)
        .op_bb(OpCode::STRING, 3, b_lit as u32)
        .op_b(OpCode::ADD, 2)
        .op_bb(OpCode::SETGV, 2, trace as u32)
        // $msg = e.message
        .op_bb(OpCode::MOVE, 2, 1)
        .op_bbb(OpCode::SEND, 2, message as u32, 0)
        .op_bb(OpCode::SETGV, 2, msg_gv as u32);
    let to_done_b = b.jmp_placeholder(OpCode::JMP);

    let reraise = b.pos();
    b.patch_target(to_reraise, reraise);
    b.op_b(OpCode::RAISE, 1);

    let done = b.pos();
    b.patch_target(to_done_a, done);
    b.patch_target(to_done_b, done);
    b.op_b(OpCode::LOADNIL, 1).op_b(OpCode::RETURN, 1);

    let main = b.build(&mut vm);
    vm.run_irep(main).expect("rescued cleanly");

    let trace = vm.global_get("$trace");
    assert_eq!(as_str(&vm, trace), "AB");
    let msg = vm.global_get("$msg");
    assert_eq!(as_str(&vm, msg), "x");
    assert!(vm.pending_exception().is_none());
}

/// A non-matching rescue filter re-raises out to the host.
#[test]
fn test_rescue_filter_mismatch_propagates() {
    let mut vm = open_vm();
    let mut b = IrepBuilder::new();
    let raise_sym = b.sym("raise");
    let fiber_error = b.sym("FiberError");
    let x_lit = b.pool_str("boom");
    b.regs(8);

    let onerr = b.jmp_placeholder(OpCode::ONERR);
    b.op_b(OpCode::LOADSELF, 1)
        .op_bb(OpCode::STRING, 2, x_lit as u32)
        .op_bbb(OpCode::SEND, 1, raise_sym as u32, 1)
        .op_b(OpCode::POPERR, 1)
        .op_b(OpCode::LOADNIL, 1)
        .op_b(OpCode::RETURN, 1);
    let handler = b.pos();
    b.patch_target(onerr, handler);
    b.op_b(OpCode::EXCEPT, 1)
        .op_bb(OpCode::GETCONST, 2, fiber_error as u32)
        .op_bb(OpCode::RESCUE, 1, 2);
    let to_reraise = b.cond_jmp_placeholder(OpCode::JMPNOT, 2);
    b.op_b(OpCode::LOADNIL, 1).op_b(OpCode::RETURN, 1);
    let reraise = b.pos();
    b.patch_target(to_reraise, reraise);
    b.op_b(OpCode::RAISE, 1);
    let main = b.build(&mut vm);

    let err = vm.run_irep(main).unwrap_err();
    assert_eq!(err_class(&vm, &err), "RuntimeError");
    assert!(vm.pending_exception().is_none());
}

/// Ensures run on the normal exit path too (EPOP before RETURN).
#[test]
fn test_ensure_runs_on_normal_exit() {
    let mut vm = open_vm();

    // ensure body: $order = ($order || "") + "E"
    let mut ens = IrepBuilder::new();
    let order = ens.sym("$order");
    let e_lit = ens.pool_str("E");
    let empty = ens.pool_str("");
    ens.locals(2).regs(6);
    ens.op_w(OpCode::ENTER, 0)
        .op_bb(OpCode::GETGV, 2, order as u32);
    let have = ens.cond_jmp_placeholder(OpCode::JMPIF, 2);
    ens.op_bb(OpCode::STRING, 2, empty as u32);
    let t = ens.pos();
    ens.patch_target(have, t);
    ens.op_bb(OpCode::STRING, 3, e_lit as u32)
        .op_b(OpCode::ADD, 2)
        .op_bb(OpCode::SETGV, 2, order as u32)
        .op_b(OpCode::RETURN, 2);
    let ens_irep = ens.build(&mut vm);

    let mut b = IrepBuilder::new();
    let order = b.sym("$order");
    let body_lit = b.pool_str("body ");
    b.regs(6);
    let ens_ci = b.child(ens_irep);
    b.op_b(OpCode::EPUSH, ens_ci as u32)
        .op_bb(OpCode::STRING, 1, body_lit as u32)
        .op_bb(OpCode::SETGV, 1, order as u32)
        .op_b(OpCode::EPOP, 1)
        .op_bb(OpCode::GETGV, 1, order as u32)
        .op_b(OpCode::RETURN, 1);
    let main = b.build(&mut vm);

    let v = vm.run_irep(main).unwrap();
    assert_eq!(as_str(&vm, v), "body E");
}

/// S6: keyword arguments with defaults, missing-keyword and
/// unknown-keyword checks.
#[test]
fn test_keyword_arguments() {
    let mut vm = open_vm();
    let object = vm.object_class;

    // def m(a, b: 10, c:); [a, b, c]; end
    let mut m = IrepBuilder::new();
    let b_kw = m.sym("b");
    let c_kw = m.sym("c");
    m.locals(6).regs(12);
    m.op_w(OpCode::ENTER, Aspec::new(1, 0, false, 0, 2, false, false).0)
        .op_bb(OpCode::KEY_P, 4, b_kw as u32);
    let b_default = m.cond_jmp_placeholder(OpCode::JMPNOT, 4);
    m.op_bb(OpCode::KARG, 4, b_kw as u32);
    let b_done = m.jmp_placeholder(OpCode::JMP);
    let def_pos = m.pos();
    m.patch_target(b_default, def_pos);
    m.op_bb(OpCode::LOADI, 4, 10);
    let done_pos = m.pos();
    m.patch_target(b_done, done_pos);
    m.op_bb(OpCode::KARG, 5, c_kw as u32)
        .op_z(OpCode::KEYEND)
        .op_bb(OpCode::MOVE, 6, 1)
        .op_bb(OpCode::MOVE, 7, 4)
        .op_bb(OpCode::MOVE, 8, 5)
        .op_bb(OpCode::ARRAY, 6, 3)
        .op_b(OpCode::RETURN, 6);
    let m_irep = m.build(&mut vm);
    vm.define_irep_method(object, "m", m_irep).unwrap();

    let top = vm.top_self_value();
    let c = vm.intern("c");
    let b_sym = vm.intern("b");
    let d = vm.intern("d");

    // m(1, c: 3) => [1, 10, 3]
    let kw = vm.hash_new().unwrap();
    vm.hash_set(kw, Value::Symbol(c), Value::Fixnum(3)).unwrap();
    let v = vm
        .funcall(top, "m", &[Value::Fixnum(1), Value::Obj(kw)])
        .unwrap();
    assert_eq!(
        as_ary(&vm, v),
        vec![Value::Fixnum(1), Value::Fixnum(10), Value::Fixnum(3)]
    );

    // m(1, c: 3, b: 2) => [1, 2, 3]
    let kw = vm.hash_new().unwrap();
    vm.hash_set(kw, Value::Symbol(c), Value::Fixnum(3)).unwrap();
    vm.hash_set(kw, Value::Symbol(b_sym), Value::Fixnum(2))
        .unwrap();
    let v = vm
        .funcall(top, "m", &[Value::Fixnum(1), Value::Obj(kw)])
        .unwrap();
    assert_eq!(
        as_ary(&vm, v),
        vec![Value::Fixnum(1), Value::Fixnum(2), Value::Fixnum(3)]
    );

    // m(1, c: 3, d: 4) raises unknown keyword
    let kw = vm.hash_new().unwrap();
    vm.hash_set(kw, Value::Symbol(c), Value::Fixnum(3)).unwrap();
    vm.hash_set(kw, Value::Symbol(d), Value::Fixnum(4)).unwrap();
    let err = vm
        .funcall(top, "m", &[Value::Fixnum(1), Value::Obj(kw)])
        .unwrap_err();
    assert_eq!(err_class(&vm, &err), "ArgumentError");
    assert!(err.message().unwrap_or_default().contains("unknown keyword: d"));

    // the caller's hash is untouched (the callee worked on a dup)
    assert_eq!(vm.hash_len(kw), 2);

    // m(1) raises missing keyword
    let err = vm.funcall(top, "m", &[Value::Fixnum(1)]).unwrap_err();
    assert_eq!(err_class(&vm, &err), "ArgumentError");
    assert!(err.message().unwrap_or_default().contains("missing keyword: c"));
}

/// Strict arity checking on lambdas and methods.
#[test]
fn test_strict_arity_errors() {
    let mut vm = open_vm();
    let object = vm.object_class;

    let mut m = IrepBuilder::new();
    m.locals(4).regs(8);
    m.op_w(OpCode::ENTER, Aspec::new(2, 0, false, 0, 0, false, false).0)
        .op_b(OpCode::RETURN, 1);
    let m_irep = m.build(&mut vm);
    vm.define_irep_method(object, "two_args", m_irep).unwrap();

    let top = vm.top_self_value();
    let err = vm.funcall(top, "two_args", &[Value::Fixnum(1)]).unwrap_err();
    assert_eq!(err_class(&vm, &err), "ArgumentError");

    let err = vm
        .funcall(
            top,
            "two_args",
            &[Value::Fixnum(1), Value::Fixnum(2), Value::Fixnum(3)],
        )
        .unwrap_err();
    assert_eq!(err_class(&vm, &err), "ArgumentError");

    assert_eq!(
        vm.funcall(top, "two_args", &[Value::Fixnum(1), Value::Fixnum(2)])
            .unwrap(),
        Value::Fixnum(1)
    );
}

/// Raising a class from the host surface builds an instance of it.
#[test]
fn test_host_raise_maps_error_classes() {
    let mut vm = open_vm();
    let top = vm.top_self_value();
    let err = vm.funcall(top, "raise", &[]).unwrap_err();
    assert_eq!(err_class(&vm, &err), "RuntimeError");

    let msg = vm.str_new("custom").unwrap();
    let err = vm.funcall(top, "raise", &[Value::Obj(msg)]).unwrap_err();
    assert_eq!(err_class(&vm, &err), "RuntimeError");
    match err {
        rite_vm::VmError::Raise {
            exc: Value::Obj(o),
        } => assert_eq!(vm.exc_message(o), "custom"),
        other => panic!("expected raised object, got {other:?}"),
    }
}

/// Deep recursion exhausts the value stack with the pre-allocated error.
#[test]
fn test_infinite_recursion_raises_sys_stack() {
    let mut vm = open_vm();
    let object = vm.object_class;

    let mut m = IrepBuilder::new();
    let rec = m.sym("rec");
    m.locals(2).regs(6);
    m.op_w(OpCode::ENTER, 0)
        .op_b(OpCode::LOADSELF, 2)
        .op_bbb(OpCode::SEND, 2, rec as u32, 0)
        .op_b(OpCode::RETURN, 2);
    let m_irep = m.build(&mut vm);
    vm.define_irep_method(object, "rec", m_irep).unwrap();

    let top = vm.top_self_value();
    let err = vm.funcall(top, "rec", &[]).unwrap_err();
    assert_eq!(err_class(&vm, &err), "SysStackError");
}
