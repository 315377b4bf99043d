//! The intrinsic method surface the VM itself depends on: the default
//! `method_missing`, `Class#new`, `Kernel#p` / `Kernel#raise`,
//! `Symbol#to_proc`, `Proc#call` (a one-instruction bytecode trampoline),
//! and the `Fiber` methods. Everything else belongs to the class library,
//! which is an external collaborator.

use crate::class::Method;
use crate::error::{VmError, VmResult};
use crate::fiber;
use crate::hash::RHash;
use crate::irep::Irep;
use crate::ivtable::IvTable;
use crate::object::ObjBody;
use crate::opcode::OpCode;
use crate::value::{Value, Vtype};
use crate::vm::Vm;
use std::rc::Rc;

/// Installs class names and the intrinsic methods. Runs once during
/// `Vm::open`.
pub(crate) fn init_core(vm: &mut Vm) -> VmResult<()> {
    let object = vm.object_class;
    for (cls, name) in [
        (vm.basic_object_class, "BasicObject"),
        (vm.object_class, "Object"),
        (vm.module_class, "Module"),
        (vm.class_class, "Class"),
        (vm.proc_class, "Proc"),
        (vm.string_class, "String"),
        (vm.array_class, "Array"),
        (vm.hash_class, "Hash"),
        (vm.range_class, "Range"),
        (vm.float_class, "Float"),
        (vm.fixnum_class, "Integer"),
        (vm.true_class, "TrueClass"),
        (vm.false_class, "FalseClass"),
        (vm.nil_class, "NilClass"),
        (vm.symbol_class, "Symbol"),
        (vm.kernel_module, "Kernel"),
        (vm.fiber_class, "Fiber"),
    ] {
        let sym = vm.intern(name);
        vm.name_class(cls, object, sym)?;
    }

    let basic = vm.basic_object_class;
    vm.define_method(basic, "initialize", basic_initialize);
    vm.define_method(basic, "method_missing", method_missing_default);

    let kernel = vm.kernel_module;
    vm.define_method(kernel, "p", kernel_p);
    vm.define_method(kernel, "raise", kernel_raise);
    vm.define_method(kernel, "block_given?", kernel_block_given_p);
    vm.define_method(kernel, "inspect", kernel_inspect);
    vm.include_module(object, kernel)?;

    let class_cls = vm.class_class;
    vm.define_method(class_cls, "new", class_new_instance);

    let exception = vm.exception_class;
    vm.define_method(exception, "initialize", exception_initialize);
    vm.define_method(exception, "message", exception_message);

    let symbol = vm.symbol_class;
    vm.define_method(symbol, "to_proc", sym_to_proc);

    // Proc#call is a one-instruction bytecode method: CALL replaces the
    // frame with the receiver proc's own body.
    let call_irep = Rc::new(Irep {
        nlocals: 1,
        nregs: 2,
        iseq: vec![OpCode::CALL as u8],
        ..Default::default()
    });
    let call_proc = vm.proc_new(call_irep)?;
    let proc_cls = vm.proc_class;
    let call_sym = vm.intern("call");
    vm.define_method_raw(proc_cls, call_sym, Method::Proc(call_proc));
    let idx_sym = vm.intern("[]");
    vm.define_method_raw(proc_cls, idx_sym, Method::Proc(call_proc));

    let fiber_cls = vm.fiber_class;
    vm.define_class_method(fiber_cls, "new", fiber::fiber_s_new)?;
    vm.define_class_method(fiber_cls, "yield", fiber::fiber_s_yield)?;
    vm.define_method(fiber_cls, "resume", fiber::fiber_resume_m);
    vm.define_method(fiber_cls, "alive?", fiber::fiber_alive_p);

    Ok(())
}

fn basic_initialize(_vm: &mut Vm, _self_val: Value) -> VmResult<Value> {
    Ok(Value::Nil)
}

/// The terminal `method_missing`: raises `NoMethodError` with the original
/// selector, which rides in as the first argument.
fn method_missing_default(vm: &mut Vm, self_val: Value) -> VmResult<Value> {
    let name = match vm.native_arg(0) {
        Value::Symbol(s) => vm.sym_name(s).to_string(),
        other => vm.value_inspect(other),
    };
    let cls = vm.class_of(self_val);
    Err(VmError::no_method(format!(
        "undefined method '{}' for {}",
        name,
        vm.class_name(cls)
    )))
}

fn kernel_p(vm: &mut Vm, _self_val: Value) -> VmResult<Value> {
    let n = vm.native_argc();
    let mut vals = Vec::with_capacity(n);
    for i in 0..n {
        let v = vm.native_arg(i);
        let line = vm.value_inspect(v);
        vm.write_out(&line);
        vm.write_out("\n");
        vals.push(v);
    }
    match vals.len() {
        0 => Ok(Value::Nil),
        1 => Ok(vals[0]),
        _ => Ok(Value::Obj(vm.ary_new_from(vals)?)),
    }
}

fn kernel_inspect(vm: &mut Vm, self_val: Value) -> VmResult<Value> {
    let s = vm.value_inspect(self_val);
    Ok(Value::Obj(vm.str_new(&s)?))
}

fn kernel_raise(vm: &mut Vm, _self_val: Value) -> VmResult<Value> {
    let argc = vm.native_argc();
    let exc = match argc {
        0 => {
            let cls = vm.exc_class_named("RuntimeError");
            vm.exc_new(cls, "unhandled exception")?
        }
        _ => {
            let first = vm.native_arg(0);
            match first {
                Value::Obj(o) if vm.heap_tt(o) == Vtype::String => {
                    let msg = vm.str_ref(o)?.to_string();
                    let cls = vm.exc_class_named("RuntimeError");
                    vm.exc_new(cls, &msg)?
                }
                Value::Obj(o) if vm.heap_tt(o) == Vtype::Exception => o,
                Value::Obj(o) if vm.heap_tt(o) == Vtype::Class => {
                    let msg = if argc >= 2 {
                        match vm.native_arg(1) {
                            Value::Obj(s) if vm.heap_tt(s) == Vtype::String => {
                                vm.str_ref(s)?.to_string()
                            }
                            other => vm.value_inspect(other),
                        }
                    } else {
                        vm.class_name(o)
                    };
                    vm.exc_new(o, &msg)?
                }
                _ => {
                    return Err(VmError::type_error(
                        "exception class/object expected",
                    ))
                }
            }
        }
    };
    Err(VmError::raise(Value::Obj(exc)))
}

/// Whether the calling method was handed a block.
fn kernel_block_given_p(vm: &mut Vm, _self_val: Value) -> VmResult<Value> {
    let given = vm.caller_block().map(|b| !b.is_nil()).unwrap_or(false);
    Ok(Value::from_bool(given))
}

/// `Class#new`: allocate by the class's instance type tag, then dispatch
/// `initialize` with the caller's arguments and block.
fn class_new_instance(vm: &mut Vm, self_val: Value) -> VmResult<Value> {
    let cls = match self_val {
        Value::Obj(o) if vm.heap_tt(o) == Vtype::Class => o,
        _ => return Err(VmError::type_error("Class required")),
    };
    let tt = vm.class_instance_tt(cls);
    let body = match tt {
        Vtype::Object => ObjBody::Object { iv: IvTable::new() },
        Vtype::Exception => ObjBody::Exception { iv: IvTable::new() },
        Vtype::Array => ObjBody::Array(Vec::new()),
        Vtype::Hash => ObjBody::Hash(RHash::default()),
        Vtype::String => ObjBody::Str(String::new()),
        Vtype::Data => ObjBody::Data { iv: IvTable::new() },
        Vtype::Fiber => ObjBody::Fiber { cxt: None },
        _ => {
            let name = vm.class_name(cls);
            return Err(VmError::type_error(format!(
                "allocator undefined for {name}"
            )));
        }
    };
    let obj = vm.obj_alloc(tt, Some(cls), body)?;
    vm.gc_protect(Value::Obj(obj))?;
    let args: Vec<Value> = (0..vm.native_argc()).map(|i| vm.native_arg(i)).collect();
    let blk = vm.native_block();
    let init = vm.intern("initialize");
    vm.funcall_with_block(Value::Obj(obj), init, &args, blk)?;
    Ok(Value::Obj(obj))
}

fn exception_initialize(vm: &mut Vm, self_val: Value) -> VmResult<Value> {
    if vm.native_argc() >= 1 {
        if let Value::Obj(s) = vm.native_arg(0) {
            if vm.heap_tt(s) == Vtype::String {
                let mesg = vm.intern("mesg");
                vm.iv_set(self_val, mesg, Value::Obj(s))?;
            }
        }
    }
    Ok(Value::Nil)
}

fn exception_message(vm: &mut Vm, self_val: Value) -> VmResult<Value> {
    let mesg = vm.intern("mesg");
    match vm.iv_get(self_val, mesg) {
        Value::Nil => {
            let cls = vm.class_of(self_val);
            let name = vm.class_name(cls);
            Ok(Value::Obj(vm.str_new(&name)?))
        }
        v => Ok(v),
    }
}

/// `Symbol#to_proc`: a native closure capturing the selector; invoking it
/// sends the selector to its first argument.
fn sym_to_proc(vm: &mut Vm, self_val: Value) -> VmResult<Value> {
    let sym = self_val
        .symbol()
        .ok_or_else(|| VmError::type_error("Symbol required"))?;
    let p = vm.proc_new_cfunc_with_env(sym_proc_call, vec![Value::Symbol(sym)])?;
    Ok(Value::Obj(p))
}

fn sym_proc_call(vm: &mut Vm, _self_val: Value) -> VmResult<Value> {
    let sym = match vm.cfunc_env_get(0) {
        Value::Symbol(s) => s,
        _ => return Err(VmError::argument("malformed to_proc closure")),
    };
    let argc = vm.native_argc();
    if argc < 1 {
        return Err(VmError::argument("no receiver given"));
    }
    let recv = vm.native_arg(0);
    let rest: Vec<Value> = (1..argc).map(|i| vm.native_arg(i)).collect();
    vm.funcall_argv(recv, sym, &rest)
}
