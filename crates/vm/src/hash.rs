//! The minimal hash surface the VM depends on: literals, merge, and
//! keyword-argument dictionaries.
//!
//! Entries are kept in insertion order; keys compare by value for immediates
//! and by identity for heap objects, which covers every key the core itself
//! produces (keyword dicts are symbol-keyed by contract).

use crate::error::{VmError, VmResult};
use crate::object::ObjBody;
use crate::value::{ObjId, Value, Vtype};
use crate::vm::Vm;

/// Hash payload: ordered (key, value) pairs.
#[derive(Debug, Default)]
pub struct RHash {
    pub entries: Vec<(Value, Value)>,
}

impl RHash {
    pub fn find(&self, key: Value) -> Option<usize> {
        self.entries.iter().position(|&(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Vm {
    /// Allocates an empty hash.
    pub fn hash_new(&mut self) -> VmResult<ObjId> {
        self.obj_alloc(
            Vtype::Hash,
            Some(self.hash_class),
            ObjBody::Hash(RHash::default()),
        )
    }

    fn hash_body(&self, h: ObjId) -> VmResult<&RHash> {
        match self.heap.body(h) {
            ObjBody::Hash(hash) => Ok(hash),
            _ => Err(VmError::type_error("Hash required")),
        }
    }

    /// Inserts or replaces a pair.
    pub fn hash_set(&mut self, h: ObjId, key: Value, val: Value) -> VmResult<()> {
        self.field_write_barrier(h, key);
        self.field_write_barrier(h, val);
        match self.heap.body_mut(h) {
            ObjBody::Hash(hash) => {
                match hash.find(key) {
                    Some(i) => hash.entries[i].1 = val,
                    None => hash.entries.push((key, val)),
                }
                Ok(())
            }
            _ => Err(VmError::type_error("Hash required")),
        }
    }

    pub fn hash_get(&self, h: ObjId, key: Value) -> VmResult<Value> {
        let hash = self.hash_body(h)?;
        Ok(hash
            .find(key)
            .map(|i| hash.entries[i].1)
            .unwrap_or(Value::Nil))
    }

    pub fn hash_key_p(&self, h: ObjId, key: Value) -> bool {
        self.hash_body(h).map(|x| x.find(key).is_some()).unwrap_or(false)
    }

    pub fn hash_delete_key(&mut self, h: ObjId, key: Value) -> VmResult<Value> {
        match self.heap.body_mut(h) {
            ObjBody::Hash(hash) => match hash.find(key) {
                Some(i) => Ok(hash.entries.remove(i).1),
                None => Ok(Value::Nil),
            },
            _ => Err(VmError::type_error("Hash required")),
        }
    }

    pub fn hash_empty_p(&self, h: ObjId) -> bool {
        self.hash_body(h).map(|x| x.is_empty()).unwrap_or(true)
    }

    pub fn hash_len(&self, h: ObjId) -> usize {
        self.hash_body(h).map(|x| x.len()).unwrap_or(0)
    }

    /// The keys, in insertion order.
    pub fn hash_keys(&self, h: ObjId) -> VmResult<Vec<Value>> {
        Ok(self.hash_body(h)?.entries.iter().map(|&(k, _)| k).collect())
    }

    /// Shallow copy; lets a callee delete keyword keys without touching the
    /// caller's hash.
    pub fn hash_dup(&mut self, h: ObjId) -> VmResult<ObjId> {
        let entries = self.hash_body(h)?.entries.clone();
        self.obj_alloc(
            Vtype::Hash,
            Some(self.hash_class),
            ObjBody::Hash(RHash { entries }),
        )
    }

    /// `HASHCAT`: merges `other` into `h`, right side winning.
    pub fn hash_merge(&mut self, h: ObjId, other: Value) -> VmResult<()> {
        let src = match other {
            Value::Obj(o) if matches!(self.heap.body(o), ObjBody::Hash(_)) => o,
            _ => return Err(VmError::type_error("Hash required")),
        };
        let pairs = self.hash_body(src)?.entries.clone();
        for (k, v) in pairs {
            self.hash_set(h, k, v)?;
        }
        Ok(())
    }

    /// Validates a keyword dict: every key must be a symbol.
    pub fn hash_check_kdict(&self, h: ObjId) -> VmResult<()> {
        for &(k, _) in &self.hash_body(h)?.entries {
            if !matches!(k, Value::Symbol(_)) {
                return Err(VmError::argument("keyword arguments must have symbol keys"));
            }
        }
        Ok(())
    }

    /// Coerces a register value for `HASHADD`/`HASHCAT`.
    pub fn ensure_hash(&self, v: Value) -> VmResult<ObjId> {
        match v {
            Value::Obj(o) if matches!(self.heap.body(o), ObjBody::Hash(_)) => Ok(o),
            _ => Err(VmError::type_error("Hash required")),
        }
    }
}
