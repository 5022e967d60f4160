//! Provides [`OpArena`], the store of numeric operator data indexed by
//! canonical operator identity.
//!
//! Symbolic expressions refer to operators only through their [`OpKey`]; the
//! numeric block for a key lives in exactly one slot of an arena, so that
//! every expression mentioning the key looks up the same data. Slots are
//! registered once (fixing the set of operators an operator tensor knows
//! about) and then materialized, evicted and rematerialized as a sweep moves
//! along the chain. Materializing a slot that already holds data is a
//! programming error and panics.
//!
//! # Example
//! ```
//! use block_sweep::{ expr::{ OpKey, OpName }, op_arena::OpArena };
//!
//! let mut ops: OpArena<f64> = OpArena::new();
//! let h = OpKey::new(OpName::H, &[]);
//! ops.register(h.clone());
//! assert!(!ops.is_materialized(&h));
//! ops.allocate(h.clone(), 1.5);
//! assert_eq!(ops.get(&h), Some(&1.5));
//! assert_eq!(ops.take(&h), Some(1.5));
//! assert!(ops.contains(&h));
//! ```

use std::fmt;
use rustc_hash::FxHashMap;
use serde::{ Deserialize, Serialize };
use crate::expr::OpKey;

/// Keyed collection of optionally materialized values with stable slots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpArena<T> {
    keys: Vec<OpKey>,
    data: Vec<Option<T>>,
    index: FxHashMap<OpKey, usize>,
}

impl<T> Default for OpArena<T> {
    fn default() -> Self { Self::new() }
}

impl<T> OpArena<T> {
    /// Create a new, empty arena.
    pub fn new() -> Self {
        Self { keys: Vec::new(), data: Vec::new(), index: FxHashMap::default() }
    }

    /// Register `key` without materializing it, returning its slot.
    ///
    /// Registering a known key returns the existing slot.
    pub fn register(&mut self, key: OpKey) -> usize {
        if let Some(&id) = self.index.get(&key) { return id; }
        let id = self.keys.len();
        self.index.insert(key.clone(), id);
        self.keys.push(key);
        self.data.push(None);
        id
    }

    /// Materialize `key` with `value`, registering it if needed.
    ///
    /// *Panics* if the slot already holds data.
    pub fn allocate(&mut self, key: OpKey, value: T) -> usize {
        let id = self.register(key);
        if self.data[id].is_some() {
            panic!("operator {} materialized twice", self.keys[id]);
        }
        self.data[id] = Some(value);
        id
    }

    /// Materialize `key` with `value`, replacing any existing data.
    pub fn replace(&mut self, key: OpKey, value: T) -> Option<T> {
        let id = self.register(key);
        self.data[id].replace(value)
    }

    /// Return the slot of `key`, if registered.
    #[inline]
    pub fn slot(&self, key: &OpKey) -> Option<usize> { self.index.get(key).copied() }

    /// Return `true` if `key` is registered.
    pub fn contains(&self, key: &OpKey) -> bool { self.index.contains_key(key) }

    /// Return `true` if `key` holds data.
    pub fn is_materialized(&self, key: &OpKey) -> bool {
        self.slot(key).is_some_and(|id| self.data[id].is_some())
    }

    /// Return a reference to the data for `key`, if materialized.
    #[inline]
    pub fn get(&self, key: &OpKey) -> Option<&T> {
        self.slot(key).and_then(|id| self.data[id].as_ref())
    }

    /// Return a mutable reference to the data for `key`, if materialized.
    #[inline]
    pub fn get_mut(&mut self, key: &OpKey) -> Option<&mut T> {
        self.slot(key).and_then(|id| self.data[id].as_mut())
    }

    /// Remove and return the data for `key`, keeping the slot registered.
    pub fn take(&mut self, key: &OpKey) -> Option<T> {
        self.slot(key).and_then(|id| self.data[id].take())
    }

    /// Drop all data, keeping every slot registered.
    pub fn clear_data(&mut self) { self.data.iter_mut().for_each(|d| { *d = None; }); }

    /// Number of registered keys.
    pub fn len(&self) -> usize { self.keys.len() }

    /// Return `true` if no key is registered.
    pub fn is_empty(&self) -> bool { self.keys.is_empty() }

    /// Number of materialized slots.
    pub fn n_materialized(&self) -> usize {
        self.data.iter().filter(|d| d.is_some()).count()
    }

    /// Iterate over registered keys in slot order.
    pub fn keys(&self) -> impl Iterator<Item = &OpKey> + '_ { self.keys.iter() }

    /// Iterate over materialized `(key, value)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (&OpKey, &T)> + '_ {
        self.keys.iter().zip(self.data.iter())
            .filter_map(|(k, d)| d.as_ref().map(|v| (k, v)))
    }

    /// Iterate mutably over materialized `(key, value)` pairs in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&OpKey, &mut T)> + '_ {
        self.keys.iter().zip(self.data.iter_mut())
            .filter_map(|(k, d)| d.as_mut().map(|v| (k, v)))
    }
}

impl<T> fmt::Display for OpArena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        let n = self.keys.len();
        for (k, (key, d)) in self.keys.iter().zip(self.data.iter()).enumerate() {
            write!(f, "{}{}", key, if d.is_some() { "" } else { "*" })?;
            if k < n - 1 { write!(f, ", ")?; }
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::OpName;

    #[test]
    fn slots_are_stable() {
        let mut ops: OpArena<u32> = OpArena::new();
        let a = OpKey::new(OpName::Sp, &[0]);
        let b = OpKey::new(OpName::Sm, &[0]);
        assert_eq!(ops.register(a.clone()), 0);
        assert_eq!(ops.allocate(b.clone(), 7), 1);
        assert_eq!(ops.register(a.clone()), 0);
        assert_eq!(ops.n_materialized(), 1);
        ops.clear_data();
        assert_eq!(ops.allocate(b.clone(), 8), 1);
        assert_eq!(format!("{}", ops), "[Sp[0]*, Sm[0]]");
    }

    #[test]
    #[should_panic]
    fn double_materialization_panics() {
        let mut ops: OpArena<u32> = OpArena::new();
        let a = OpKey::new(OpName::H, &[]);
        ops.allocate(a.clone(), 1);
        ops.allocate(a, 2);
    }
}
