//! Collector behavior: full-cycle idempotence, garbage reclamation, write
//! barriers under generational mode, arena discipline, and allocation
//! starvation.

mod common;

use common::*;
use rite_vm::{Value, Vm, VmConfig, Vtype};

#[test]
fn test_full_gc_idempotent() {
    let mut vm = open_vm();
    // create some reachable structure
    let strs: Vec<Value> = (0..64)
        .map(|i| Value::Obj(vm.str_new(&format!("s{i}")).unwrap()))
        .collect();
    let arr = vm.ary_new_from(strs).unwrap();
    vm.gc_register(Value::Obj(arr)).unwrap();

    vm.full_gc();
    let live1 = vm.gc_live();
    vm.full_gc();
    assert_eq!(vm.gc_live(), live1);
}

#[test]
fn test_garbage_is_reclaimed() {
    let mut vm = open_vm();
    vm.full_gc();
    let base = vm.gc_live();
    for i in 0..10_000 {
        let ai = vm.arena_save();
        vm.str_new(&format!("transient {i}")).unwrap();
        vm.arena_restore(ai);
    }
    vm.full_gc();
    assert!(
        vm.gc_live() < base + 100,
        "live {} should stay near baseline {}",
        vm.gc_live(),
        base
    );
}

#[test]
fn test_rooted_objects_survive() {
    let mut vm = open_vm();
    let items: Vec<Value> = (0..16)
        .map(|i| Value::Obj(vm.str_new(&format!("keep {i}")).unwrap()))
        .collect();
    let arr = vm.ary_new_from(items).unwrap();
    vm.gc_register(Value::Obj(arr)).unwrap();

    for _ in 0..3 {
        vm.full_gc();
    }
    let items = vm.ary_items(arr).unwrap().to_vec();
    for (i, v) in items.iter().enumerate() {
        assert_eq!(as_str(&vm, *v), format!("keep {i}"));
    }

    vm.gc_unregister(Value::Obj(arr));
    let before = vm.gc_live();
    vm.full_gc();
    assert!(vm.gc_live() < before);
}

#[test]
fn test_write_barrier_keeps_new_reference_alive() {
    let mut vm = open_vm();
    assert!(vm.gc_generational());
    let arr = vm.ary_new().unwrap();
    vm.gc_register(Value::Obj(arr)).unwrap();
    // age the array: after a full cycle survivors stay black in
    // generational mode
    vm.full_gc();

    let s = vm.str_new("young").unwrap();
    vm.ary_push(arr, Value::Obj(s)).unwrap();

    // churn through enough garbage to drive several minor cycles
    for i in 0..20_000 {
        let ai = vm.arena_save();
        vm.str_new(&format!("junk {i}")).unwrap();
        vm.arena_restore(ai);
    }
    vm.full_gc();

    assert_eq!(vm.heap_tt(s), Vtype::String);
    assert_eq!(vm.str_ref(s).unwrap(), "young");
    assert_eq!(vm.ary_items(arr).unwrap(), &[Value::Obj(s)]);
}

#[test]
fn test_generational_toggle_forces_consistency() {
    let mut vm = open_vm();
    for i in 0..2_000 {
        let ai = vm.arena_save();
        vm.str_new(&format!("x{i}")).unwrap();
        vm.arena_restore(ai);
    }
    vm.gc_set_generational(false);
    assert!(!vm.gc_generational());
    vm.full_gc();
    let live = vm.gc_live();
    vm.gc_set_generational(true);
    assert!(vm.gc_generational());
    vm.full_gc();
    assert_eq!(vm.gc_live(), live);
}

#[test]
fn test_arena_save_restore_bounds_growth() {
    let mut vm = open_vm();
    let ai = vm.arena_save();
    for _ in 0..200 {
        vm.str_new("protected").unwrap();
    }
    assert!(vm.arena_save() >= ai + 200);
    vm.arena_restore(ai);
    assert_eq!(vm.arena_save(), ai);
}

#[test]
fn test_allocation_starvation_raises_preallocated_nomem() {
    let mut vm = Vm::open_with(VmConfig {
        heap_max_pages: Some(1),
        ..Default::default()
    })
    .expect("boots in one page");

    let arr = vm.ary_new().unwrap();
    vm.gc_register(Value::Obj(arr)).unwrap();

    let mut starved = None;
    for i in 0..4_096 {
        match vm.str_new(&format!("pin {i}")) {
            Ok(o) => vm.ary_push(arr, Value::Obj(o)).unwrap(),
            Err(e) => {
                starved = Some(e);
                break;
            }
        }
    }
    let err = starved.expect("one page must starve");
    assert_eq!(err_class(&vm, &err), "NoMemoryError");
}

#[test]
fn test_gc_disable_enable() {
    let mut vm = open_vm();
    assert!(!vm.gc_disable());
    // allocations run with the collector off
    for i in 0..100 {
        vm.str_new(&format!("off {i}")).unwrap();
    }
    assert!(vm.gc_enable());
    vm.full_gc();
}

#[test]
fn test_gc_runs_during_bytecode_execution() {
    // a loop allocating strings must trigger collection without losing
    // any live register value
    use rite_vm::{IrepBuilder, OpCode};
    let mut vm = open_vm();
    let mut b = IrepBuilder::new();
    let s = b.pool_str("payload");
    let limit = b.pool_int(20_000);
    // r1 = counter, r3..r5 scratch
    b.regs(8).op_bb(OpCode::LOADI, 1, 0);
    let head = b.pos();
    b.op_bb(OpCode::STRING, 3, s as u32)
        .op_bb(OpCode::ADDI, 1, 1)
        .op_bb(OpCode::MOVE, 4, 1)
        .op_bb(OpCode::LOADL, 5, limit as u32)
        .op_b(OpCode::LT, 4);
    let back = b.cond_jmp_placeholder(OpCode::JMPIF, 4);
    b.patch_target(back, head);
    b.op_b(OpCode::RETURN, 1);
    let irep = b.build(&mut vm);
    assert_eq!(vm.run_irep(irep).unwrap(), Value::Fixnum(20_000));
}
