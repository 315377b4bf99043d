//! Shared helpers for the integration suites.
#![allow(dead_code)]

use rite_vm::{Value, Vm, VmError};

pub fn open_vm() -> Box<Vm> {
    Vm::open().expect("vm boots")
}

/// Unwraps a string object's contents.
pub fn as_str(vm: &Vm, v: Value) -> String {
    match v {
        Value::Obj(o) => vm.str_ref(o).expect("string object").to_string(),
        other => panic!("expected a string, got {other:?}"),
    }
}

/// The exception class name an error maps to, whether it crossed the host
/// boundary as a raised object or as a pre-classified error.
pub fn err_class(vm: &Vm, e: &VmError) -> String {
    match e {
        VmError::Raise {
            exc: Value::Obj(o),
        } => vm.class_name(vm.class_of(Value::Obj(*o))),
        other => other.class_name().to_string(),
    }
}

/// Unwraps an array object's elements.
pub fn as_ary(vm: &Vm, v: Value) -> Vec<Value> {
    match v {
        Value::Obj(o) => vm.ary_items(o).expect("array object").to_vec(),
        other => panic!("expected an array, got {other:?}"),
    }
}
