//! Operator tensors: symbolic transfer structure plus numeric operator data.

use std::fmt;
use serde::{ Deserialize, Serialize };
use crate::{
    basis::{ BondBasis, FusedBasis },
    block::{ BlockInfo, BlockMatrix },
    expr::{ OpElement, OpExpr, OpKey },
    op_arena::OpArena,
    quantum::QLabel,
    symbolic::Symbolic,
};

/// Symbolic left/right accumulation structure plus the numeric operators it
/// refers to.
///
/// For a site of the chain operator, `lmat` and `rmat` are the transfer
/// matrices used when the site is absorbed into a left or right environment
/// block; for an environment block they are the vectors of operator names
/// the block provides. Either may be absent when the tensor is only ever
/// used from one side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperatorTensor<Q> {
    pub lmat: Option<Symbolic<Q>>,
    pub rmat: Option<Symbolic<Q>>,
    pub ops: OpArena<BlockMatrix<Q>>,
}

impl<Q: QLabel> Default for OperatorTensor<Q> {
    fn default() -> Self { Self::new() }
}

impl<Q: QLabel> OperatorTensor<Q> {
    /// Create a new tensor with no structure and no data.
    pub fn new() -> Self { Self { lmat: None, rmat: None, ops: OpArena::new() } }

    /// Create a tensor with the given symbolic structure, registering every
    /// operator it names.
    pub fn with_structure(lmat: Option<Symbolic<Q>>, rmat: Option<Symbolic<Q>>)
        -> Self
    {
        let mut new = Self { lmat, rmat, ops: OpArena::new() };
        new.register_names();
        new
    }

    fn register_names(&mut self) {
        let keys: Vec<OpKey>
            = self.lmat.iter().chain(self.rmat.iter())
            .flat_map(|s| s.exprs())
            .filter_map(|e| e.as_elem().map(|a| a.key.clone()))
            .collect();
        keys.into_iter().for_each(|k| { self.ops.register(k); });
    }

    /// Look up the numeric data for `key`.
    #[inline]
    pub fn get(&self, key: &OpKey) -> Option<&BlockMatrix<Q>> { self.ops.get(key) }

    /// Names carried by a vector-shaped `lmat`.
    pub fn left_names(&self) -> Vec<OpElement<Q>> {
        names_of(self.lmat.as_ref())
    }

    /// Names carried by a vector-shaped `rmat`.
    pub fn right_names(&self) -> Vec<OpElement<Q>> {
        names_of(self.rmat.as_ref())
    }

    /// Total number of stored elements.
    pub fn data_len(&self) -> usize {
        self.ops.iter().map(|(_, m)| m.len()).sum()
    }

    /// Drop every numeric operator, keeping the structure.
    pub fn deallocate(&mut self) { self.ops.clear_data(); }
}

fn names_of<Q: QLabel>(s: Option<&Symbolic<Q>>) -> Vec<OpElement<Q>> {
    s.and_then(|s| s.as_vec())
        .map(|v| v.iter().filter_map(|e| e.as_elem().cloned()).collect())
        .unwrap_or_default()
}

impl<Q: QLabel> fmt::Display for OperatorTensor<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f, "OperatorTensor(lmat: {:?}, rmat: {:?}, ops: {})",
            self.lmat.as_ref().map(|s| s.shape()),
            self.rmat.as_ref().map(|s| s.shape()),
            self.ops,
        )
    }
}

/// Deferred combination of a left and a right block.
///
/// Each entry of `ops` is defined by the expression at the same position in
/// `exprs`, to be evaluated against `lopt` (first factors) and `ropt` (second
/// factors) only when the combined operator is applied to a wavefunction.
#[derive(Clone, Debug)]
pub struct DelayedOperatorTensor<Q> {
    pub ops: Vec<OpElement<Q>>,
    pub exprs: Vec<OpExpr<Q>>,
    pub lopt: OperatorTensor<Q>,
    pub ropt: OperatorTensor<Q>,
}

impl<Q: QLabel> DelayedOperatorTensor<Q> {
    /// Return the expression defining `key`.
    pub fn expr_of(&self, key: &OpKey) -> Option<&OpExpr<Q>> {
        self.ops.iter().position(|op| &op.key == key)
            .map(|k| &self.exprs[k])
    }
}

/// Row and column bases on which operators of a block are allocated.
#[derive(Clone, Debug)]
pub struct OpBases<Q> {
    pub row: FusedBasis<Q>,
    pub col: FusedBasis<Q>,
}

impl<Q: QLabel> OpBases<Q> {
    /// Bases for a block whose bra and ket sides fuse the same components.
    pub fn symmetric(a: &BondBasis<Q>, b: &BondBasis<Q>) -> Self {
        let f = a.fuse(b);
        Self { row: f.clone(), col: f }
    }

    /// Layout of an operator with label shift `delta`.
    pub fn info(&self, delta: Q) -> BlockInfo<Q> {
        BlockInfo::operator(self.row.basis.clone(), self.col.basis.clone(), delta)
    }

    /// Zero operator with label shift `delta`.
    pub fn zeros(&self, delta: Q) -> BlockMatrix<Q> { BlockMatrix::zeros(self.info(delta)) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ expr::OpName, quantum::U1 };

    #[test]
    fn structure_registers_names() {
        let names = vec![
            OpElement::new(OpName::H, &[], U1(0), 1.0),
            OpElement::new(OpName::Sp, &[3], U1(2), 1.0),
            OpElement::new(OpName::I, &[], U1(0), 1.0),
        ];
        let t: OperatorTensor<U1>
            = OperatorTensor::with_structure(Some(Symbolic::row_of(&names)), None);
        assert_eq!(t.ops.len(), 3);
        assert_eq!(t.ops.n_materialized(), 0);
        assert_eq!(t.left_names(), names);
        assert!(t.right_names().is_empty());
    }
}
