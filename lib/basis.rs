//! Bond bases: mappings from quantum label to block dimension.
//!
//! A [`BondBasis`] describes the (renormalized) basis living on one bond of
//! the chain, or the physical basis of a single site. Fusing two bases with
//! [`BondBasis::fuse`] produces a [`FusedBasis`], which additionally records
//! where each pair of component labels lands inside the fused blocks. Fused
//! indices are always ordered with the first component outermost, i.e. the
//! state `(ia, ib)` of a pair `(qa, qb)` sits at
//! ```text
//! offset(qa, qb, q) + ia * dim(qb) + ib
//! ```
//! inside the block of fused label `q`.

use std::fmt;
use serde::{ Deserialize, Serialize };
use crate::quantum::QLabel;

/// Sorted list of `(label, dimension)` pairs with no zero dimensions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BondBasis<Q> {
    dims: Vec<(Q, usize)>,
}

impl<Q: QLabel> BondBasis<Q> {
    /// Create a new, empty basis.
    pub fn new() -> Self { Self { dims: Vec::new() } }

    /// Basis of the empty system: a single vacuum state.
    pub fn vacuum() -> Self { Self { dims: vec![(Q::vacuum(), 1)] } }

    /// Build from `(label, dim)` pairs, summing repeated labels and dropping
    /// zero dimensions.
    pub fn from_pairs<I>(pairs: I) -> Self
    where I: IntoIterator<Item = (Q, usize)>
    {
        let mut dims: Vec<(Q, usize)>
            = pairs.into_iter()
            .filter(|(_, d)| *d > 0)
            .collect();
        dims.sort_by_key(|(q, _)| *q);
        let mut merged: Vec<(Q, usize)> = Vec::with_capacity(dims.len());
        for (q, d) in dims.into_iter() {
            match merged.last_mut() {
                Some((ql, dl)) if *ql == q => { *dl += d; },
                _ => { merged.push((q, d)); },
            }
        }
        Self { dims: merged }
    }

    /// Return the dimension of the block with label `q` (zero if absent).
    #[inline]
    pub fn dim(&self, q: Q) -> usize {
        self.dims.binary_search_by_key(&q, |(ql, _)| *ql)
            .map(|k| self.dims[k].1)
            .unwrap_or(0)
    }

    /// Return `true` if `q` labels a non-empty block.
    #[inline]
    pub fn contains(&self, q: Q) -> bool { self.dim(q) > 0 }

    /// Total number of states.
    pub fn total_dim(&self) -> usize { self.dims.iter().map(|(_, d)| *d).sum() }

    /// Number of distinct labels.
    pub fn n_labels(&self) -> usize { self.dims.len() }

    /// Return `true` if the basis holds no states.
    pub fn is_empty(&self) -> bool { self.dims.is_empty() }

    /// Iterate over `(label, dim)` pairs in ascending label order.
    pub fn iter(&self) -> impl Iterator<Item = (Q, usize)> + '_ {
        self.dims.iter().copied()
    }

    /// Iterate over labels in ascending order.
    pub fn labels(&self) -> impl Iterator<Item = Q> + '_ {
        self.dims.iter().map(|(q, _)| *q)
    }

    /// Keep only the blocks for which `f` returns a non-zero dimension,
    /// replacing each dimension by the returned one.
    pub fn map_dims<F>(&self, mut f: F) -> Self
    where F: FnMut(Q, usize) -> usize
    {
        Self::from_pairs(self.dims.iter().map(|(q, d)| (*q, f(*q, *d))))
    }

    /// Fuse `self` (outer) with `rhs` (inner).
    pub fn fuse(&self, rhs: &Self) -> FusedBasis<Q> {
        let mut sizes: Vec<(Q, usize)> = Vec::new();
        let mut offsets: Vec<((Q, Q, Q), usize)> = Vec::new();
        for &(qa, da) in self.dims.iter() {
            for &(qb, db) in rhs.dims.iter() {
                for q in qa.fusion(qb).into_iter() {
                    let k = match sizes.iter().position(|(qs, _)| *qs == q) {
                        Some(k) => k,
                        None => { sizes.push((q, 0)); sizes.len() - 1 },
                    };
                    offsets.push(((qa, qb, q), sizes[k].1));
                    sizes[k].1 += da * db;
                }
            }
        }
        offsets.sort_by_key(|(key, _)| *key);
        FusedBasis {
            basis: Self::from_pairs(sizes),
            left: self.clone(),
            right: rhs.clone(),
            offsets,
        }
    }
}

impl<Q: QLabel> fmt::Display for BondBasis<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        let n = self.dims.len();
        for (k, (q, d)) in self.dims.iter().enumerate() {
            write!(f, "{}: {}", q, d)?;
            if k < n - 1 { write!(f, ", ")?; }
        }
        write!(f, "}}")
    }
}

/// A basis obtained by fusing two others, with the position of every
/// component pair inside the fused blocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FusedBasis<Q> {
    /// The fused basis itself.
    pub basis: BondBasis<Q>,
    /// Outer component.
    pub left: BondBasis<Q>,
    /// Inner component.
    pub right: BondBasis<Q>,
    offsets: Vec<((Q, Q, Q), usize)>,
}

impl<Q: QLabel> FusedBasis<Q> {
    /// Return the offset of the `(qa, qb)` sub-block inside fused block `q`.
    #[inline]
    pub fn offset(&self, qa: Q, qb: Q, q: Q) -> Option<usize> {
        self.offsets.binary_search_by_key(&(qa, qb, q), |(key, _)| *key)
            .ok()
            .map(|k| self.offsets[k].1)
    }

    /// Iterate over all `(qa, qb, offset)` components of fused block `q`.
    pub fn components(&self, q: Q) -> impl Iterator<Item = (Q, Q, usize)> + '_ {
        self.offsets.iter()
            .filter(move |((_, _, qf), _)| *qf == q)
            .map(|((qa, qb, _), off)| (*qa, *qb, *off))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantum::U1;

    fn spin() -> BondBasis<U1> { BondBasis::from_pairs([(U1(1), 1), (U1(-1), 1)]) }

    #[test]
    fn from_pairs_merges_and_sorts() {
        let b = BondBasis::from_pairs([(U1(2), 1), (U1(0), 2), (U1(2), 3), (U1(5), 0)]);
        assert_eq!(b.iter().collect::<Vec<_>>(), vec![(U1(0), 2), (U1(2), 4)]);
        assert_eq!(b.total_dim(), 6);
        assert_eq!(b.dim(U1(5)), 0);
    }

    #[test]
    fn fuse_two_spins() {
        let f = spin().fuse(&spin());
        assert_eq!(f.basis.dim(U1(0)), 2);
        assert_eq!(f.basis.dim(U1(2)), 1);
        assert_eq!(f.basis.dim(U1(-2)), 1);
        // (-1, +1) is visited before (+1, -1)
        assert_eq!(f.offset(U1(-1), U1(1), U1(0)), Some(0));
        assert_eq!(f.offset(U1(1), U1(-1), U1(0)), Some(1));
        assert_eq!(f.components(U1(0)).count(), 2);
    }
}
