//! The embedding surface: loading compiled units, registering classes and
//! methods, and destructuring native-call arguments.

use crate::error::{VmError, VmResult};
use crate::irep::Irep;
use crate::object::ObjBody;
use crate::procs::{ProcBody, ProcScope, RProc};
use crate::symbol::Sym;
use crate::value::{Float, Int, ObjId, Value, Vtype};
use crate::vm::Vm;
use std::rc::Rc;

/// One destructured argument from [`Vm::get_args`].
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// `o` — any value.
    Val(Value),
    /// `i` — integer.
    Int(Int),
    /// `f` — float.
    Float(Float),
    /// `s` / `z` — string contents.
    Str(String),
    /// `a` — array elements.
    Ary(Vec<Value>),
    /// `H` — hash object.
    HashArg(Value),
    /// `C` — class or module.
    Class(ObjId),
    /// `n` — symbol.
    Sym(Sym),
    /// `b` — boolean.
    Bool(bool),
    /// `&` — block.
    Block(Value),
    /// `*` — remaining positional arguments.
    Rest(Vec<Value>),
    /// `?` — whether the previous optional argument was given.
    Given(bool),
    /// Optional argument that was not supplied (or nil under `!`).
    Absent,
}

impl Vm {
    /// Loads a compiled unit and runs its top-level irep against the
    /// top-level `self`, returning the last expression's value. An uncaught
    /// exception comes back as `Err` with the VM restored to its host-entry
    /// invariants.
    pub fn load(&mut self, bytes: &[u8]) -> VmResult<Value> {
        let irep = crate::loader::read_rite(self, bytes)?;
        self.run_irep(irep)
    }

    /// Runs an already-built irep tree as a top-level program.
    pub fn run_irep(&mut self, irep: Rc<Irep>) -> VmResult<Value> {
        let ai = self.arena_save();
        let oc = self.object_class;
        let p = self.obj_alloc(
            Vtype::Proc,
            Some(self.proc_class),
            ObjBody::Proc(RProc {
                body: ProcBody::Irep(irep),
                upper: None,
                scope: ProcScope::Class(Some(oc)),
            }),
        )?;
        let result = self.top_run(p);
        // the result stays rooted through the value stack; the arena goes
        // back to its pre-execution level
        self.arena_restore(ai);
        result
    }

    /// Serializes an irep tree to rite bytes (big-endian payload).
    pub fn dump(&self, irep: &Irep) -> Vec<u8> {
        crate::dump::dump_rite(self, irep, rite_io::Endian::Big)
    }

    /// Defines (or reopens) a class constant under `Object`.
    pub fn define_class(&mut self, name: &str, super_: Option<ObjId>) -> VmResult<ObjId> {
        let sym = self.intern(name);
        let oc = self.object_class;
        self.vm_define_class(oc, super_.map(Value::Obj).unwrap_or(Value::Nil), sym)
    }

    /// Defines (or reopens) a module constant under `Object`.
    pub fn define_module(&mut self, name: &str) -> VmResult<ObjId> {
        let sym = self.intern(name);
        let oc = self.object_class;
        self.vm_define_module(oc, sym)
    }

    /// Installs a compiled irep as a method body on `cls`.
    pub fn define_irep_method(
        &mut self,
        cls: ObjId,
        name: &str,
        irep: Rc<Irep>,
    ) -> VmResult<()> {
        let p = self.obj_alloc(
            Vtype::Proc,
            Some(self.proc_class),
            ObjBody::Proc(RProc {
                body: ProcBody::Irep(irep),
                upper: None,
                scope: ProcScope::Class(Some(cls)),
            }),
        )?;
        self.proc_set_flag(
            p,
            crate::object::ObjFlags::PROC_SCOPE | crate::object::ObjFlags::PROC_STRICT,
        );
        let mid = self.intern(name);
        self.define_method_raw(cls, mid, crate::class::Method::Proc(p));
        Ok(())
    }

    /// Reads a global variable.
    pub fn global_get(&mut self, name: &str) -> Value {
        let sym = self.intern(name);
        self.globals.get(&sym).copied().unwrap_or(Value::Nil)
    }

    /// Writes a global variable.
    pub fn global_set(&mut self, name: &str, v: Value) {
        let sym = self.intern(name);
        self.globals.insert(sym, v);
    }

    /// Destructures the current native call's arguments per a format
    /// string: `o` any, `i` integer, `f` float, `s`/`z` string, `a` array,
    /// `H` hash, `C` class/module, `n` symbol, `b` bool, `&` block, `*`
    /// rest, `|` optional from here, `!` accept nil for the previous
    /// specifier, `?` was-given flag.
    pub fn get_args(&mut self, format: &str) -> VmResult<Vec<Arg>> {
        let argc = self.native_argc();
        let mut out = Vec::new();
        let mut idx = 0usize;
        let mut optional = false;
        let mut last_given = true;
        let mut required = 0usize;

        let chars: Vec<char> = format.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let spec = chars[i];
            let bang = chars.get(i + 1) == Some(&'!');
            if bang {
                i += 1;
            }
            match spec {
                '|' => {
                    optional = true;
                }
                '?' => {
                    out.push(Arg::Given(last_given));
                }
                '&' => {
                    out.push(Arg::Block(self.native_block()));
                }
                '*' => {
                    let rest: Vec<Value> =
                        (idx..argc).map(|k| self.native_arg(k)).collect();
                    idx = argc;
                    out.push(Arg::Rest(rest));
                }
                _ => {
                    if !optional {
                        required += 1;
                    }
                    if idx >= argc {
                        if !optional {
                            return Err(VmError::argument(format!(
                                "wrong number of arguments (given {argc}, expected {required})"
                            )));
                        }
                        last_given = false;
                        out.push(Arg::Absent);
                        i += 1;
                        continue;
                    }
                    let v = self.native_arg(idx);
                    idx += 1;
                    last_given = true;
                    if v.is_nil() && bang {
                        out.push(Arg::Absent);
                        i += 1;
                        continue;
                    }
                    out.push(self.convert_arg(spec, v)?);
                }
            }
            i += 1;
        }
        if idx < argc && !format.contains('*') && !format.contains('|') {
            return Err(VmError::argument(format!(
                "wrong number of arguments (given {argc}, expected {required})"
            )));
        }
        Ok(out)
    }

    fn convert_arg(&mut self, spec: char, v: Value) -> VmResult<Arg> {
        match spec {
            'o' => Ok(Arg::Val(v)),
            'i' => match v {
                Value::Fixnum(n) => Ok(Arg::Int(n)),
                Value::Float(f) => {
                    if f.is_nan() || f.is_infinite() {
                        return Err(VmError::float_domain(format!("{f}")));
                    }
                    let t = f.trunc();
                    if t < Int::MIN as Float || t > Int::MAX as Float {
                        return Err(VmError::range("float out of integer range"));
                    }
                    Ok(Arg::Int(t as Int))
                }
                _ => Err(self.arg_type_error(v, "Integer")),
            },
            'f' => match v {
                Value::Fixnum(n) => Ok(Arg::Float(n as Float)),
                Value::Float(f) => Ok(Arg::Float(f)),
                _ => Err(self.arg_type_error(v, "Float")),
            },
            's' | 'z' => match v {
                Value::Obj(o) if self.heap_tt(o) == Vtype::String => {
                    Ok(Arg::Str(self.str_ref(o)?.to_string()))
                }
                _ => Err(self.arg_type_error(v, "String")),
            },
            'a' => match v {
                Value::Obj(o) if self.is_array(v) => Ok(Arg::Ary(self.ary_items(o)?.to_vec())),
                _ => Err(self.arg_type_error(v, "Array")),
            },
            'H' => match v {
                Value::Obj(o) if matches!(self.heap.body(o), ObjBody::Hash(_)) => {
                    Ok(Arg::HashArg(v))
                }
                _ => Err(self.arg_type_error(v, "Hash")),
            },
            'C' => match v {
                Value::Obj(o)
                    if matches!(
                        self.heap_tt(o),
                        Vtype::Class | Vtype::Module | Vtype::SClass
                    ) =>
                {
                    Ok(Arg::Class(o))
                }
                _ => Err(self.arg_type_error(v, "Class")),
            },
            'n' => match v {
                Value::Symbol(s) => Ok(Arg::Sym(s)),
                Value::Obj(o) if self.heap_tt(o) == Vtype::String => {
                    let name = self.str_ref(o)?.to_string();
                    Ok(Arg::Sym(self.intern(&name)))
                }
                _ => Err(self.arg_type_error(v, "Symbol")),
            },
            'b' => Ok(Arg::Bool(v.truthy())),
            other => Err(VmError::argument(format!(
                "invalid get_args specifier '{other}'"
            ))),
        }
    }

    fn arg_type_error(&mut self, v: Value, expected: &str) -> VmError {
        let cls = self.class_of(v);
        VmError::type_error(format!(
            "no implicit conversion of {} into {expected}",
            self.class_name(cls)
        ))
    }
}
