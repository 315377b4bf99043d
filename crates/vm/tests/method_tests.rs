//! Method definition, dispatch, the iclass chain, singleton classes, and
//! the method cache.

mod common;

use common::*;
use rite_vm::args::Aspec;
use rite_vm::{IrepBuilder, OpCode, Value, Vm, VmResult};

fn ret1(_vm: &mut Vm, _s: Value) -> VmResult<Value> {
    Ok(Value::Fixnum(1))
}

fn ret2(_vm: &mut Vm, _s: Value) -> VmResult<Value> {
    Ok(Value::Fixnum(2))
}

fn ret3(_vm: &mut Vm, _s: Value) -> VmResult<Value> {
    Ok(Value::Fixnum(3))
}

#[test]
fn test_instance_creation_and_ivars() {
    let mut vm = open_vm();
    let point = vm.define_class("Point", None).unwrap();

    // def initialize(x); @x = x; end
    let mut b = IrepBuilder::new();
    let x_iv = b.sym("@x");
    b.locals(3).regs(6);
    b.op_w(OpCode::ENTER, Aspec::new(1, 0, false, 0, 0, false, false).0)
        .op_bb(OpCode::SETIV, 1, x_iv as u32)
        .op_b(OpCode::LOADNIL, 2)
        .op_b(OpCode::RETURN, 2);
    let init = b.build(&mut vm);
    vm.define_irep_method(point, "initialize", init).unwrap();

    // def x; @x; end
    let mut b = IrepBuilder::new();
    let x_iv = b.sym("@x");
    b.locals(2).regs(4);
    b.op_w(OpCode::ENTER, 0)
        .op_bb(OpCode::GETIV, 1, x_iv as u32)
        .op_b(OpCode::RETURN, 1);
    let getter = b.build(&mut vm);
    vm.define_irep_method(point, "x", getter).unwrap();

    let obj = vm
        .funcall(Value::Obj(point), "new", &[Value::Fixnum(5)])
        .unwrap();
    assert_eq!(vm.funcall(obj, "x", &[]).unwrap(), Value::Fixnum(5));
    assert!(vm.obj_is_kind_of(obj, point));
}

#[test]
fn test_method_missing_raises_no_method_error() {
    let mut vm = open_vm();
    let top = vm.top_self_value();
    let err = vm.funcall(top, "no_such_method", &[]).unwrap_err();
    assert_eq!(err_class(&vm, &err), "NoMethodError");
    let msg = err.message().unwrap_or_default().to_string();
    assert!(msg.contains("no_such_method"), "got: {msg}");
}

#[test]
fn test_custom_method_missing_intercepts() {
    let mut vm = open_vm();
    let cls = vm.define_class("Ghost", None).unwrap();

    // def method_missing(name, *args); name; end
    let mut b = IrepBuilder::new();
    b.locals(4).regs(8);
    b.op_w(OpCode::ENTER, Aspec::new(1, 0, true, 0, 0, false, false).0)
        .op_b(OpCode::RETURN, 1);
    let mm = b.build(&mut vm);
    vm.define_irep_method(cls, "method_missing", mm).unwrap();

    let obj = vm.funcall(Value::Obj(cls), "new", &[]).unwrap();
    let got = vm.funcall(obj, "phantom", &[Value::Fixnum(9)]).unwrap();
    let phantom = vm.intern("phantom");
    assert_eq!(got, Value::Symbol(phantom));
}

#[test]
fn test_super_dispatch() {
    let mut vm = open_vm();
    let a = vm.define_class("SuperA", None).unwrap();
    let b_cls = vm.define_class("SuperB", Some(a)).unwrap();
    vm.define_method(a, "m", ret1);

    // def m; super() + 10; end
    let mut b = IrepBuilder::new();
    b.locals(2).regs(6);
    b.op_w(OpCode::ENTER, 0)
        .op_b(OpCode::LOADNIL, 2)
        .op_bb(OpCode::SUPER, 1, 0)
        .op_bb(OpCode::ADDI, 1, 10)
        .op_b(OpCode::RETURN, 1);
    let m = b.build(&mut vm);
    vm.define_irep_method(b_cls, "m", m).unwrap();

    let obj = vm.funcall(Value::Obj(b_cls), "new", &[]).unwrap();
    assert_eq!(vm.funcall(obj, "m", &[]).unwrap(), Value::Fixnum(11));
}

#[test]
fn test_include_module_inserts_after_own_methods() {
    let mut vm = open_vm();
    let m = vm.define_module("Greeting").unwrap();
    vm.define_method(m, "hello", ret1);
    let cls = vm.define_class("Greeter", None).unwrap();
    vm.include_module(cls, m).unwrap();

    let obj = vm.funcall(Value::Obj(cls), "new", &[]).unwrap();
    assert_eq!(vm.funcall(obj, "hello", &[]).unwrap(), Value::Fixnum(1));
    assert!(vm.obj_is_kind_of(obj, m));

    // the class's own method wins over the included one
    vm.define_method(cls, "hello", ret2);
    assert_eq!(vm.funcall(obj, "hello", &[]).unwrap(), Value::Fixnum(2));
}

#[test]
fn test_prepend_module_wins_over_own_methods() {
    let mut vm = open_vm();
    let cls = vm.define_class("Prep", None).unwrap();
    vm.define_method(cls, "hello", ret1);
    let p = vm.define_module("PrependedGreeting").unwrap();
    vm.define_method(p, "hello", ret3);
    vm.prepend_module(cls, p).unwrap();

    let obj = vm.funcall(Value::Obj(cls), "new", &[]).unwrap();
    assert_eq!(vm.funcall(obj, "hello", &[]).unwrap(), Value::Fixnum(3));
}

#[test]
fn test_module_methods_visible_after_include() {
    // methods defined on a module after inclusion resolve through the
    // proxy node immediately
    let mut vm = open_vm();
    let m = vm.define_module("Late").unwrap();
    let cls = vm.define_class("LateHost", None).unwrap();
    vm.include_module(cls, m).unwrap();
    let obj = vm.funcall(Value::Obj(cls), "new", &[]).unwrap();
    assert!(vm.funcall(obj, "later", &[]).is_err());
    vm.define_method(m, "later", ret2);
    assert_eq!(vm.funcall(obj, "later", &[]).unwrap(), Value::Fixnum(2));
}

#[test]
fn test_singleton_class_methods() {
    let mut vm = open_vm();
    let cls = vm.define_class("Single", None).unwrap();
    let a = vm.funcall(Value::Obj(cls), "new", &[]).unwrap();
    let b = vm.funcall(Value::Obj(cls), "new", &[]).unwrap();

    let sc = vm.singleton_class(a).unwrap();
    vm.define_method(sc, "special", ret1);

    assert_eq!(vm.funcall(a, "special", &[]).unwrap(), Value::Fixnum(1));
    let err = vm.funcall(b, "special", &[]).unwrap_err();
    assert_eq!(err_class(&vm, &err), "NoMethodError");
}

#[test]
fn test_singleton_class_of_immediates() {
    let mut vm = open_vm();
    assert!(vm.singleton_class(Value::Fixnum(1)).is_err());
    assert_eq!(vm.singleton_class(Value::Nil).unwrap(), vm.nil_class);
}

#[test]
fn test_alias_and_undef() {
    let mut vm = open_vm();
    let parent = vm.define_class("UPar", None).unwrap();
    let child = vm.define_class("UChild", Some(parent)).unwrap();
    vm.define_method(parent, "m", ret1);

    let aliased = vm.intern("m2");
    let orig = vm.intern("m");
    vm.alias_method(parent, aliased, orig).unwrap();

    let obj = vm.funcall(Value::Obj(child), "new", &[]).unwrap();
    assert_eq!(vm.funcall(obj, "m2", &[]).unwrap(), Value::Fixnum(1));

    // an undef tombstone on the child stops the super walk cold
    vm.undef_method(child, orig);
    let err = vm.funcall(obj, "m", &[]).unwrap_err();
    assert_eq!(err_class(&vm, &err), "NoMethodError");
    // the parent still responds
    let pobj = vm.funcall(Value::Obj(parent), "new", &[]).unwrap();
    assert_eq!(vm.funcall(pobj, "m", &[]).unwrap(), Value::Fixnum(1));
}

#[test]
fn test_method_redefinition_invalidates_cache() {
    let mut vm = open_vm();
    let cls = vm.define_class("Hot", None).unwrap();
    vm.define_method(cls, "m", ret1);
    let obj = vm.funcall(Value::Obj(cls), "new", &[]).unwrap();
    // prime the cache
    assert_eq!(vm.funcall(obj, "m", &[]).unwrap(), Value::Fixnum(1));
    assert_eq!(vm.funcall(obj, "m", &[]).unwrap(), Value::Fixnum(1));
    vm.define_method(cls, "m", ret2);
    assert_eq!(vm.funcall(obj, "m", &[]).unwrap(), Value::Fixnum(2));
}

#[test]
fn test_resolution_stable_without_mutation() {
    let mut vm = open_vm();
    let cls = vm.define_class("Stable", None).unwrap();
    vm.define_method(cls, "m", ret1);
    let mid = vm.intern("m");
    let first = vm.method_search_vm(cls, mid).expect("resolves");
    for _ in 0..10 {
        assert_eq!(vm.method_search_vm(cls, mid), Some(first));
    }
}

#[test]
fn test_symbol_block_coerced_via_to_proc() {
    let mut vm = open_vm();
    let object = vm.object_class;

    // def twice; yield 5; end
    let mut b = IrepBuilder::new();
    let call = b.sym("call");
    b.locals(2).regs(6);
    b.op_w(OpCode::ENTER, 0)
        .op_bs(OpCode::BLKPUSH, 2, 0)
        .op_bb(OpCode::LOADI, 3, 5)
        .op_bbb(OpCode::SEND, 2, call as u32, 1)
        .op_b(OpCode::RETURN, 2);
    let twice = b.build(&mut vm);
    vm.define_irep_method(object, "twice", twice).unwrap();

    // twice(&:inspect)
    let mut b = IrepBuilder::new();
    let twice_sym = b.sym("twice");
    let inspect = b.sym("inspect");
    b.regs(6)
        .op_b(OpCode::LOADSELF, 1)
        .op_bb(OpCode::LOADSYM, 2, inspect as u32)
        .op_bbb(OpCode::SENDB, 1, twice_sym as u32, 0)
        .op_b(OpCode::RETURN, 1);
    let main = b.build(&mut vm);
    let v = vm.run_irep(main).unwrap();
    assert_eq!(as_str(&vm, v), "5");
}

#[test]
fn test_block_given_p() {
    let mut vm = open_vm();
    let object = vm.object_class;

    // def bg; block_given?; end
    let mut b = IrepBuilder::new();
    let bgp = b.sym("block_given?");
    b.locals(2).regs(6);
    b.op_w(OpCode::ENTER, 0)
        .op_b(OpCode::LOADSELF, 2)
        .op_bbb(OpCode::SEND, 2, bgp as u32, 0)
        .op_b(OpCode::RETURN, 2);
    let bg = b.build(&mut vm);
    vm.define_irep_method(object, "bg", bg).unwrap();

    let top = vm.top_self_value();
    let mid = vm.intern("bg");
    assert_eq!(vm.funcall(top, "bg", &[]).unwrap(), Value::False);

    // build a lambda to pass as the block
    let mut b = IrepBuilder::new();
    b.regs(4);
    let mut child = IrepBuilder::new();
    child
        .locals(2)
        .regs(4)
        .op_w(OpCode::ENTER, 0)
        .op_b(OpCode::LOADNIL, 2)
        .op_b(OpCode::RETURN, 2);
    let child = child.build(&mut vm);
    let ci = b.child(child);
    b.op_bb(OpCode::LAMBDA, 1, ci as u32).op_b(OpCode::RETURN, 1);
    let main = b.build(&mut vm);
    let blk = vm.run_irep(main).unwrap();

    assert_eq!(
        vm.funcall_with_block(top, mid, &[], blk).unwrap(),
        Value::True
    );
}
