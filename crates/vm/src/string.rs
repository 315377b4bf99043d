//! The minimal string surface the VM depends on: literal construction, `+`,
//! concat, intern, and inspect for core literals.

use crate::error::{VmError, VmResult};
use crate::object::ObjBody;
use crate::symbol::Sym;
use crate::value::{Float, ObjId, Value, Vtype};
use crate::vm::Vm;

impl Vm {
    /// Allocates a string object.
    pub fn str_new(&mut self, s: &str) -> VmResult<ObjId> {
        self.obj_alloc(
            Vtype::String,
            Some(self.string_class),
            ObjBody::Str(s.to_string()),
        )
    }

    /// Borrow the bytes of a string object.
    pub fn str_ref(&self, o: ObjId) -> VmResult<&str> {
        match self.heap.body(o) {
            ObjBody::Str(s) => Ok(s),
            _ => Err(VmError::type_error("String required")),
        }
    }

    /// Coerces a value to a string object id.
    pub fn as_str_obj(&self, v: Value) -> VmResult<ObjId> {
        match v {
            Value::Obj(o) if matches!(self.heap.body(o), ObjBody::Str(_)) => Ok(o),
            _ => Err(VmError::type_error("String required")),
        }
    }

    /// `STRCAT`: appends `other` to `recv` in place.
    pub fn str_concat(&mut self, recv: Value, other: Value) -> VmResult<()> {
        let dst = self.as_str_obj(recv)?;
        if self.heap.header(dst).is_frozen() {
            return Err(VmError::frozen("can't modify frozen String"));
        }
        let src = self.as_str_obj(other)?;
        let tail = self.str_ref(src)?.to_string();
        match self.heap.body_mut(dst) {
            ObjBody::Str(s) => s.push_str(&tail),
            _ => unreachable!(),
        }
        Ok(())
    }

    /// String `+`: a fresh string, both operands untouched.
    pub fn str_plus(&mut self, a: Value, b: Value) -> VmResult<Value> {
        let left = self.str_ref(self.as_str_obj(a)?)?.to_string();
        let right = self.str_ref(self.as_str_obj(b)?)?.to_string();
        Ok(Value::Obj(self.str_new(&(left + &right))?))
    }

    /// `INTERN`: string to symbol.
    pub fn str_intern(&mut self, v: Value) -> VmResult<Sym> {
        let o = self.as_str_obj(v)?;
        let s = self.str_ref(o)?.to_string();
        Ok(self.intern(&s))
    }

    /// `inspect` for the immutable core literals (§ round-trip law): the
    /// result, re-parsed, denotes an equal value.
    pub fn value_inspect(&self, v: Value) -> String {
        match v {
            Value::Nil => "nil".to_string(),
            Value::True => "true".to_string(),
            Value::False => "false".to_string(),
            Value::Undef => "undef".to_string(),
            Value::Fixnum(i) => i.to_string(),
            Value::Float(f) => format_float(f),
            Value::Symbol(s) => format!(":{}", self.symbols.name(s)),
            Value::Obj(o) => match self.heap.body(o) {
                ObjBody::Str(s) => format!("\"{}\"", escape_str(s)),
                ObjBody::Array(items) => {
                    let parts: Vec<String> =
                        items.iter().map(|&i| self.value_inspect(i)).collect();
                    format!("[{}]", parts.join(", "))
                }
                ObjBody::Hash(h) => {
                    let parts: Vec<String> = h
                        .entries
                        .iter()
                        .map(|&(k, v)| {
                            format!("{}=>{}", self.value_inspect(k), self.value_inspect(v))
                        })
                        .collect();
                    format!("{{{}}}", parts.join(", "))
                }
                ObjBody::Range(r) => format!(
                    "{}{}{}",
                    self.value_inspect(r.beg),
                    if r.excl { "..." } else { ".." },
                    self.value_inspect(r.end)
                ),
                ObjBody::Class(_) => self.class_name(o),
                ObjBody::Exception { iv } => {
                    let cls = self.class_of(v);
                    match self
                        .symbols
                        .lookup("mesg")
                        .and_then(|m| iv.get(m))
                    {
                        Some(Value::Obj(s)) => match self.heap.body(s) {
                            ObjBody::Str(msg) => {
                                format!("#<{}: {}>", self.class_name(cls), msg)
                            }
                            _ => format!("#<{}>", self.class_name(cls)),
                        },
                        _ => format!("#<{}>", self.class_name(cls)),
                    }
                }
                _ => {
                    let cls = self.class_of(v);
                    format!("#<{}>", self.class_name(cls))
                }
            },
        }
    }
}

/// Floats always print a decimal point so they re-read as floats.
fn format_float(f: Float) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if f == f.trunc() && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

fn escape_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_format_keeps_point() {
        assert_eq!(format_float(3.0), "3.0");
        assert_eq!(format_float(3.5), "3.5");
        assert_eq!(format_float(-2.0), "-2.0");
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape_str("a\"b\n"), "a\\\"b\\n");
    }
}
