//! Instance-variable table.
//!
//! An ordered list of (symbol, value) pairs stored in fixed-size segments.
//! Small tables are scanned linearly; once the table grows past
//! [`IV_INDEX_THRESHOLD`] slots it builds a power-of-two open-addressed index
//! (quadratic probing) whose buckets point into the segment storage.
//! Deletion blanks the key in place, leaving an undef hole; compaction runs
//! when holes outnumber live entries.

use crate::symbol::Sym;
use crate::value::Value;
use xxhash_rust::xxh3::xxh3_64;

/// Entries per segment.
pub const IV_SEGMENT_SIZE: usize = 4;

/// Slot count above which the probing index is built.
pub const IV_INDEX_THRESHOLD: usize = 16;

const EMPTY_BUCKET: u32 = u32::MAX;

#[derive(Debug)]
struct Segment {
    keys: [Option<Sym>; IV_SEGMENT_SIZE],
    vals: [Value; IV_SEGMENT_SIZE],
}

impl Segment {
    fn new() -> Self {
        Self {
            keys: [None; IV_SEGMENT_SIZE],
            vals: [Value::Nil; IV_SEGMENT_SIZE],
        }
    }
}

/// Ordered symbol -> value map with index promotion.
#[derive(Debug, Default)]
pub struct IvTable {
    segments: Vec<Segment>,
    /// Used slots in the final segment.
    last_len: usize,
    /// Live entries (excludes deleted holes).
    size: usize,
    /// Deleted holes awaiting compaction.
    deleted: usize,
    /// Power-of-two probing index over slot positions, built lazily.
    index: Option<Vec<u32>>,
}

impl IvTable {
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
            last_len: 0,
            size: 0,
            deleted: 0,
            index: None,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Total slots, live or deleted.
    fn slots(&self) -> usize {
        if self.segments.is_empty() {
            0
        } else {
            (self.segments.len() - 1) * IV_SEGMENT_SIZE + self.last_len
        }
    }

    fn slot_key(&self, pos: usize) -> Option<Sym> {
        self.segments[pos / IV_SEGMENT_SIZE].keys[pos % IV_SEGMENT_SIZE]
    }

    fn slot_val(&self, pos: usize) -> Value {
        self.segments[pos / IV_SEGMENT_SIZE].vals[pos % IV_SEGMENT_SIZE]
    }

    fn hash_sym(sym: Sym) -> u64 {
        xxh3_64(&sym.id().to_le_bytes())
    }

    /// Finds the slot position of `sym`, via the index when present.
    fn find(&self, sym: Sym) -> Option<usize> {
        if let Some(index) = &self.index {
            let mask = index.len() - 1;
            let mut pos = Self::hash_sym(sym) as usize & mask;
            let mut step = 0;
            loop {
                match index[pos] {
                    EMPTY_BUCKET => return None,
                    slot => {
                        if self.slot_key(slot as usize) == Some(sym) {
                            return Some(slot as usize);
                        }
                    }
                }
                step += 1;
                if step > mask {
                    return None;
                }
                pos = (pos + step) & mask;
            }
        } else {
            (0..self.slots()).find(|&p| self.slot_key(p) == Some(sym))
        }
    }

    pub fn get(&self, sym: Sym) -> Option<Value> {
        self.find(sym).map(|p| self.slot_val(p))
    }

    pub fn contains(&self, sym: Sym) -> bool {
        self.find(sym).is_some()
    }

    /// Inserts or replaces. Returns true when the key was new.
    pub fn set(&mut self, sym: Sym, val: Value) -> bool {
        if let Some(pos) = self.find(sym) {
            self.segments[pos / IV_SEGMENT_SIZE].vals[pos % IV_SEGMENT_SIZE] = val;
            return false;
        }
        if self.segments.is_empty() || self.last_len == IV_SEGMENT_SIZE {
            self.segments.push(Segment::new());
            self.last_len = 0;
        }
        let pos = (self.segments.len() - 1) * IV_SEGMENT_SIZE + self.last_len;
        let seg = self.segments.last_mut().unwrap();
        seg.keys[self.last_len] = Some(sym);
        seg.vals[self.last_len] = val;
        self.last_len += 1;
        self.size += 1;

        let slots = self.slots();
        let capa = self.index.as_ref().map(|ix| ix.len());
        match capa {
            Some(capa) if slots * 2 > capa => self.rebuild_index(),
            Some(_) => {
                let index = self.index.as_mut().unwrap();
                let mask = index.len() - 1;
                let mut b = Self::hash_sym(sym) as usize & mask;
                let mut step = 0;
                while index[b] != EMPTY_BUCKET {
                    step += 1;
                    b = (b + step) & mask;
                }
                index[b] = pos as u32;
            }
            None => {
                if slots > IV_INDEX_THRESHOLD {
                    self.rebuild_index();
                }
            }
        }
        true
    }

    fn rebuild_index(&mut self) {
        let mut capa = 8usize;
        while capa < self.slots() * 2 {
            capa <<= 1;
        }
        let mut index = vec![EMPTY_BUCKET; capa];
        for pos in 0..self.slots() {
            if let Some(sym) = self.slot_key(pos) {
                let mask = capa - 1;
                let mut b = Self::hash_sym(sym) as usize & mask;
                let mut step = 0;
                while index[b] != EMPTY_BUCKET {
                    step += 1;
                    b = (b + step) & mask;
                }
                index[b] = pos as u32;
            }
        }
        self.index = Some(index);
    }

    /// Removes `sym`, blanking its slot. Returns the removed value.
    pub fn delete(&mut self, sym: Sym) -> Option<Value> {
        let pos = self.find(sym)?;
        let val = self.slot_val(pos);
        self.segments[pos / IV_SEGMENT_SIZE].keys[pos % IV_SEGMENT_SIZE] = None;
        self.segments[pos / IV_SEGMENT_SIZE].vals[pos % IV_SEGMENT_SIZE] = Value::Undef;
        self.size -= 1;
        self.deleted += 1;
        if self.index.is_some() {
            // the index still points at the hole; rebuild clears it
            self.rebuild_index();
        }
        if self.deleted > self.size {
            self.compact();
        }
        Some(val)
    }

    /// Rewrites the segments without holes.
    fn compact(&mut self) {
        let pairs: Vec<(Sym, Value)> = self.iter().collect();
        self.segments.clear();
        self.last_len = 0;
        self.size = 0;
        self.deleted = 0;
        self.index = None;
        for (k, v) in pairs {
            self.set(k, v);
        }
    }

    /// Iterates live entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (Sym, Value)> + '_ {
        (0..self.slots()).filter_map(move |p| self.slot_key(p).map(|k| (k, self.slot_val(p))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::SymbolTable;

    fn syms(n: usize) -> (SymbolTable, Vec<Sym>) {
        let mut t = SymbolTable::new();
        let v = (0..n).map(|i| t.intern(&format!("iv{i}"))).collect();
        (t, v)
    }

    #[test]
    fn test_set_get_small() {
        let (_t, s) = syms(3);
        let mut iv = IvTable::new();
        iv.set(s[0], Value::Fixnum(1));
        iv.set(s[1], Value::Fixnum(2));
        assert_eq!(iv.get(s[0]), Some(Value::Fixnum(1)));
        assert_eq!(iv.get(s[1]), Some(Value::Fixnum(2)));
        assert_eq!(iv.get(s[2]), None);
        assert_eq!(iv.len(), 2);
    }

    #[test]
    fn test_replace_keeps_size() {
        let (_t, s) = syms(1);
        let mut iv = IvTable::new();
        assert!(iv.set(s[0], Value::Fixnum(1)));
        assert!(!iv.set(s[0], Value::Fixnum(9)));
        assert_eq!(iv.get(s[0]), Some(Value::Fixnum(9)));
        assert_eq!(iv.len(), 1);
    }

    #[test]
    fn test_index_promotion() {
        let (_t, s) = syms(64);
        let mut iv = IvTable::new();
        for (i, &sym) in s.iter().enumerate() {
            iv.set(sym, Value::Fixnum(i as crate::value::Int));
        }
        assert!(iv.index.is_some());
        for (i, &sym) in s.iter().enumerate() {
            assert_eq!(iv.get(sym), Some(Value::Fixnum(i as crate::value::Int)));
        }
    }

    #[test]
    fn test_delete_and_compact() {
        let (_t, s) = syms(32);
        let mut iv = IvTable::new();
        for (i, &sym) in s.iter().enumerate() {
            iv.set(sym, Value::Fixnum(i as crate::value::Int));
        }
        for &sym in &s[..24] {
            assert!(iv.delete(sym).is_some());
        }
        assert_eq!(iv.len(), 8);
        for (i, &sym) in s.iter().enumerate().skip(24) {
            assert_eq!(iv.get(sym), Some(Value::Fixnum(i as crate::value::Int)));
        }
        for &sym in &s[..24] {
            assert_eq!(iv.get(sym), None);
        }
    }

    #[test]
    fn test_iteration_order() {
        let (_t, s) = syms(6);
        let mut iv = IvTable::new();
        for (i, &sym) in s.iter().enumerate() {
            iv.set(sym, Value::Fixnum(i as crate::value::Int));
        }
        iv.delete(s[2]);
        let order: Vec<Sym> = iv.iter().map(|(k, _)| k).collect();
        assert_eq!(order, vec![s[0], s[1], s[3], s[4], s[5]]);
    }
}
