//! Symbol interning.

use hashbrown::HashMap;

/// An interned name. Equal byte strings always intern to the same `Sym`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sym(pub(crate) u32);

impl Sym {
    /// The raw symbol id.
    pub fn id(self) -> u32 {
        self.0
    }
}

/// Interned name table: name -> id plus reverse lookup.
#[derive(Debug, Default)]
pub struct SymbolTable {
    tbl: HashMap<Box<str>, Sym>,
    rev: Vec<Box<str>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `name`, returning the existing id when already present.
    pub fn intern(&mut self, name: &str) -> Sym {
        if let Some(&sym) = self.tbl.get(name) {
            return sym;
        }
        let sym = Sym(self.rev.len() as u32 + 1);
        self.rev.push(name.into());
        self.tbl.insert(name.into(), sym);
        sym
    }

    /// Reverse lookup.
    pub fn name(&self, sym: Sym) -> &str {
        &self.rev[(sym.0 - 1) as usize]
    }

    /// Looks up an already-interned name without creating it.
    pub fn lookup(&self, name: &str) -> Option<Sym> {
        self.tbl.get(name).copied()
    }

    /// Number of interned symbols.
    pub fn len(&self) -> usize {
        self.rev.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rev.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_idempotent() {
        let mut t = SymbolTable::new();
        let a = t.intern("each");
        let b = t.intern("each");
        assert_eq!(a, b);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_distinct_names_distinct_ids() {
        let mut t = SymbolTable::new();
        let a = t.intern("foo");
        let b = t.intern("bar");
        assert_ne!(a, b);
    }

    #[test]
    fn test_round_trip() {
        let mut t = SymbolTable::new();
        let s = t.intern("method_missing");
        assert_eq!(t.name(s), "method_missing");
        assert_eq!(t.intern(t.name(s).to_string().as_str()), s);
    }
}
