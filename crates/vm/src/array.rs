//! The minimal array surface the VM depends on: literals, splat, element
//! access, push/concat, and post destructuring support.

use crate::error::{VmError, VmResult};
use crate::object::ObjBody;
use crate::value::{ObjId, Value, Vtype};
use crate::vm::Vm;

impl Vm {
    /// Allocates an array with the given elements.
    pub fn ary_new_from(&mut self, values: Vec<Value>) -> VmResult<ObjId> {
        self.obj_alloc(Vtype::Array, Some(self.array_class), ObjBody::Array(values))
    }

    /// Allocates an empty array.
    pub fn ary_new(&mut self) -> VmResult<ObjId> {
        self.ary_new_from(Vec::new())
    }

    pub fn is_array(&self, v: Value) -> bool {
        matches!(v, Value::Obj(o) if matches!(self.heap.body(o), ObjBody::Array(_)))
    }

    pub fn ary_ref_obj(&self, v: Value) -> VmResult<ObjId> {
        match v {
            Value::Obj(o) if matches!(self.heap.body(o), ObjBody::Array(_)) => Ok(o),
            _ => Err(VmError::type_error("Array required")),
        }
    }

    pub fn ary_items(&self, o: ObjId) -> VmResult<&[Value]> {
        match self.heap.body(o) {
            ObjBody::Array(items) => Ok(items),
            _ => Err(VmError::type_error("Array required")),
        }
    }

    pub fn ary_len(&self, o: ObjId) -> usize {
        self.ary_items(o).map(|i| i.len()).unwrap_or(0)
    }

    /// Element read; nil out of range.
    pub fn ary_get(&self, o: ObjId, idx: usize) -> Value {
        self.ary_items(o)
            .ok()
            .and_then(|items| items.get(idx).copied())
            .unwrap_or(Value::Nil)
    }

    /// `ASET`: element write, growing with nils. Array stores are dense, so
    /// the backward barrier re-grays the holder instead of each element.
    pub fn ary_set(&mut self, o: ObjId, idx: usize, val: Value) -> VmResult<()> {
        self.write_barrier(o);
        match self.heap.body_mut(o) {
            ObjBody::Array(items) => {
                if idx >= items.len() {
                    items.resize(idx + 1, Value::Nil);
                }
                items[idx] = val;
                Ok(())
            }
            _ => Err(VmError::type_error("Array required")),
        }
    }

    /// `ARYPUSH`.
    pub fn ary_push(&mut self, o: ObjId, val: Value) -> VmResult<()> {
        self.write_barrier(o);
        match self.heap.body_mut(o) {
            ObjBody::Array(items) => {
                items.push(val);
                Ok(())
            }
            _ => Err(VmError::type_error("Array required")),
        }
    }

    /// Prepends a value (method_missing unshifts the original symbol).
    pub fn ary_unshift(&mut self, o: ObjId, val: Value) -> VmResult<()> {
        self.write_barrier(o);
        match self.heap.body_mut(o) {
            ObjBody::Array(items) => {
                items.insert(0, val);
                Ok(())
            }
            _ => Err(VmError::type_error("Array required")),
        }
    }

    /// `ARYCAT`: appends all elements of `other` (splatted) to `o`.
    pub fn ary_concat(&mut self, o: ObjId, other: Value) -> VmResult<()> {
        let items = match self.ary_splat(other)? {
            Value::Obj(src) => self.ary_items(src)?.to_vec(),
            _ => unreachable!("splat always yields an array"),
        };
        self.write_barrier(o);
        match self.heap.body_mut(o) {
            ObjBody::Array(dst) => {
                dst.extend(items);
                Ok(())
            }
            _ => Err(VmError::type_error("Array required")),
        }
    }

    /// Splat coercion: arrays pass through, everything else wraps.
    pub fn ary_splat(&mut self, v: Value) -> VmResult<Value> {
        if self.is_array(v) {
            return Ok(v);
        }
        Ok(Value::Obj(self.ary_new_from(vec![v])?))
    }

    /// `ARYDUP`: shallow copy, wrapping non-arrays.
    pub fn ary_dup(&mut self, v: Value) -> VmResult<ObjId> {
        let items = if self.is_array(v) {
            self.ary_items(v.obj().unwrap())?.to_vec()
        } else {
            vec![v]
        };
        self.ary_new_from(items)
    }
}
