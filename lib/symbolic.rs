//! Symbolic vectors and matrices of operator expressions.
//!
//! The operator tensor of every site carries the transfer structure of the
//! chain operator in symbolic form: a matrix whose entries are elementary
//! site operators, or a row (first site) or column (last site) vector.
//! Environment blocks carry a row (left) or column (right) vector of operator
//! names. Contracting a block with a site is then a symbolic vector-matrix
//! product,
//! ```text
//! left:   L'[j] = Σ_i L[i] ⊗ W[i, j]
//! right:  R'[i] = Σ_j W[i, j] ⊗ R[j]
//! window: H     = Σ_k L[k] ⊗ R[k]
//! ```
//! whose entries are the [`OpExpr`]s evaluated numerically by the
//! contraction engine. Zero operands are skipped; any operand that is not an
//! elementary operator is a structural error.

use serde::{ Deserialize, Serialize };
use thiserror::Error;
use crate::{
    expr::{ OpElement, OpExpr, OpProduct },
    quantum::QLabel,
};

#[derive(Debug, Error)]
pub enum SymbolicError {
    /// Returned when a product meets an operand that is neither zero nor an
    /// elementary operator.
    #[error("error in symbolic product: non-elementary operand {0}")]
    NonElementary(String),

    /// Returned when operand shapes are incompatible.
    #[error("error in symbolic product: incompatible shapes {0:?} and {1:?}")]
    ShapeMismatch((usize, usize), (usize, usize)),

    /// Returned when the operands are not a row/matrix/column combination.
    #[error("error in symbolic product: unsupported operand kinds {0} and {1}")]
    UnsupportedKinds(&'static str, &'static str),
}
use SymbolicError::*;
pub type SymbolicResult<T> = Result<T, SymbolicError>;

/// Row vector, column vector, or sparse matrix of operator expressions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Symbolic<Q> {
    Row(Vec<OpExpr<Q>>),
    Col(Vec<OpExpr<Q>>),
    Matrix {
        nrows: usize,
        ncols: usize,
        entries: Vec<(usize, usize, OpExpr<Q>)>,
    },
}

impl<Q: QLabel> Symbolic<Q> {
    /// Row vector of unit-factor names.
    pub fn row_of(names: &[OpElement<Q>]) -> Self {
        Self::Row(names.iter().map(|n| OpExpr::Elem(n.abs())).collect())
    }

    /// Column vector of unit-factor names.
    pub fn col_of(names: &[OpElement<Q>]) -> Self {
        Self::Col(names.iter().map(|n| OpExpr::Elem(n.abs())).collect())
    }

    /// Return `(nrows, ncols)`.
    pub fn shape(&self) -> (usize, usize) {
        match self {
            Self::Row(v) => (1, v.len()),
            Self::Col(v) => (v.len(), 1),
            Self::Matrix { nrows, ncols, .. } => (*nrows, *ncols),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Row(_) => "row",
            Self::Col(_) => "column",
            Self::Matrix { .. } => "matrix",
        }
    }

    /// Return `true` if `self` is `Row`.
    pub fn is_row(&self) -> bool { matches!(self, Self::Row(..)) }

    /// Return `true` if `self` is `Col`.
    pub fn is_col(&self) -> bool { matches!(self, Self::Col(..)) }

    /// Iterate over every non-zero entry.
    pub fn exprs(&self) -> Box<dyn Iterator<Item = &OpExpr<Q>> + '_> {
        match self {
            Self::Row(v) | Self::Col(v) => Box::new(v.iter().filter(|e| !e.is_zero())),
            Self::Matrix { entries, .. } =>
                Box::new(entries.iter().map(|(_, _, e)| e).filter(|e| !e.is_zero())),
        }
    }

    /// Return the entries of a vector.
    pub fn as_vec(&self) -> Option<&[OpExpr<Q>]> {
        match self {
            Self::Row(v) | Self::Col(v) => Some(v),
            Self::Matrix { .. } => None,
        }
    }

    /// Symbolic product `self * rhs`, returning the entries of the resulting
    /// vector.
    ///
    /// Supported combinations are row * matrix, matrix * column, row * row
    /// and column * column (the latter two act as vector * diagonal matrix,
    /// used at the chain boundaries), and row * column (a single entry).
    pub fn multiply(&self, rhs: &Self) -> SymbolicResult<Vec<OpExpr<Q>>> {
        match (self, rhs) {
            (Self::Row(l), Self::Matrix { nrows, ncols, entries }) => {
                if l.len() != *nrows {
                    return Err(ShapeMismatch(self.shape(), rhs.shape()));
                }
                let mut terms: Vec<Vec<OpProduct<Q>>> = vec![Vec::new(); *ncols];
                for (i, j, w) in entries.iter() {
                    push_product(&mut terms[*j], &l[*i], w)?;
                }
                Ok(terms.into_iter().map(OpExpr::from_products).collect())
            },
            (Self::Matrix { nrows, ncols, entries }, Self::Col(r)) => {
                if r.len() != *ncols {
                    return Err(ShapeMismatch(self.shape(), rhs.shape()));
                }
                let mut terms: Vec<Vec<OpProduct<Q>>> = vec![Vec::new(); *nrows];
                for (i, j, w) in entries.iter() {
                    push_product(&mut terms[*i], w, &r[*j])?;
                }
                Ok(terms.into_iter().map(OpExpr::from_products).collect())
            },
            (Self::Row(l), Self::Row(r)) | (Self::Col(l), Self::Col(r)) => {
                if l.len() != r.len() {
                    return Err(ShapeMismatch(self.shape(), rhs.shape()));
                }
                l.iter().zip(r.iter())
                    .map(|(a, b)| {
                        let mut terms: Vec<OpProduct<Q>> = Vec::new();
                        push_product(&mut terms, a, b)?;
                        Ok(OpExpr::from_products(terms))
                    })
                    .collect()
            },
            (Self::Row(l), Self::Col(r)) => {
                if l.len() != r.len() {
                    return Err(ShapeMismatch(self.shape(), rhs.shape()));
                }
                let mut terms: Vec<OpProduct<Q>> = Vec::new();
                for (a, b) in l.iter().zip(r.iter()) {
                    push_product(&mut terms, a, b)?;
                }
                Ok(vec![OpExpr::from_products(terms)])
            },
            _ => Err(UnsupportedKinds(self.kind(), rhs.kind())),
        }
    }
}

fn push_product<Q>(terms: &mut Vec<OpProduct<Q>>, a: &OpExpr<Q>, b: &OpExpr<Q>)
    -> SymbolicResult<()>
where Q: QLabel
{
    match (a, b) {
        (OpExpr::Zero, _) | (_, OpExpr::Zero) => Ok(()),
        (OpExpr::Elem(ea), OpExpr::Elem(eb)) => {
            terms.push(OpProduct::new(ea, eb, 0));
            Ok(())
        },
        (OpExpr::Elem(_), other) | (other, _) =>
            Err(NonElementary(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ expr::OpName, quantum::U1 };

    fn el(name: OpName, f: f64) -> OpExpr<U1> {
        OpExpr::Elem(OpElement::new(name, &[], U1(0), f))
    }

    #[test]
    fn row_times_matrix_skips_zeros() {
        let row = Symbolic::Row(vec![el(OpName::H, 1.0), OpExpr::Zero, el(OpName::I, 1.0)]);
        let mat = Symbolic::Matrix {
            nrows: 3,
            ncols: 2,
            entries: vec![
                (0, 0, el(OpName::I, 1.0)),
                (1, 0, el(OpName::Sz, 4.0)),
                (2, 0, el(OpName::Sz, 0.5)),
                (2, 1, el(OpName::I, 1.0)),
            ],
        };
        let out = row.multiply(&mat).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].terms().len(), 2);
        assert_eq!(out[0].terms()[1].factor, 0.5);
        assert!(matches!(out[1], OpExpr::Prod(..)));
    }

    #[test]
    fn row_times_col_is_single_sum() {
        let row = Symbolic::Row(vec![el(OpName::Sp, 1.0), el(OpName::Sm, 1.0)]);
        let col = Symbolic::Col(vec![el(OpName::Cp, 2.0), el(OpName::Cm, 2.0)]);
        let out = row.multiply(&col).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].terms().len(), 2);
    }

    #[test]
    fn non_elementary_operand_is_rejected() {
        let inner = OpExpr::Sum(vec![]);
        let row = Symbolic::Row(vec![inner]);
        let col = Symbolic::Col(vec![el(OpName::I, 1.0)]);
        assert!(matches!(row.multiply(&col), Err(NonElementary(_))));
        assert!(matches!(col.multiply(&row), Err(UnsupportedKinds(..))));
    }
}
