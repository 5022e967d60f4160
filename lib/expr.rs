//! Symbolic operator expressions.
//!
//! Operators are referred to by an [`OpKey`]: a name plus the chain sites it
//! acts on. An [`OpElement`] attaches a quantum-label shift and a scalar
//! factor to a key, and expressions combine elements into the small algebra
//! evaluated by the contraction engine:
//! ```text
//! OpExpr = Zero
//!        | Elem(a)
//!        | Prod(f * op(a) ⊗ op(b))
//!        | Sum(Prod, Prod, ...)
//!        | Ref(OpExpr, is_local)
//! ```
//! where `op(·)` optionally transposes its argument. Elements stored inside a
//! product always carry a unit factor; the product's own factor collects
//! everything else, so the key of an element is enough to find its numeric
//! data.
//!
//! `Ref` marks a subexpression that has been restricted to the terms owned by
//! one worker. Its flag records whether those terms are all there is
//! (`is_local == true`) or whether results still have to be combined across
//! workers.

use std::fmt;
use serde::{ Deserialize, Serialize };
use crate::quantum::QLabel;

/// Name of an elementary operator.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize,
)]
pub enum OpName {
    /// Identity.
    I,
    /// Hamiltonian, or its partial sum over a block of sites.
    H,
    /// Spin raising.
    Sp,
    /// Spin lowering.
    Sm,
    /// Spin projection.
    Sz,
    /// Complementary partner of `Sp` (collects couplings from the other side).
    Cp,
    /// Complementary partner of `Sm`.
    Cm,
    /// Complementary partner of `Sz`.
    Cz,
    /// Bond energy between two neighboring sites.
    B,
    /// Auxiliary operator family; the number is its communication channel.
    X(u16),
}

impl OpName {
    /// Communication channel of the name, if it has one.
    ///
    /// Names without a channel (identities and block Hamiltonians) appear in
    /// every term and are replicated on every worker.
    pub fn channel(self) -> Option<usize> {
        match self {
            Self::Sp | Self::Cp => Some(0),
            Self::Sm | Self::Cm => Some(1),
            Self::Sz | Self::Cz => Some(2),
            Self::X(k) => Some(k as usize),
            Self::I | Self::H | Self::B => None,
        }
    }

    /// Return `true` if `self` is `I`.
    pub fn is_identity(self) -> bool { matches!(self, Self::I) }
}

impl fmt::Display for OpName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I => write!(f, "I"),
            Self::H => write!(f, "H"),
            Self::Sp => write!(f, "Sp"),
            Self::Sm => write!(f, "Sm"),
            Self::Sz => write!(f, "Sz"),
            Self::Cp => write!(f, "Cp"),
            Self::Cm => write!(f, "Cm"),
            Self::Cz => write!(f, "Cz"),
            Self::B => write!(f, "B"),
            Self::X(k) => write!(f, "X{}", k),
        }
    }
}

/// Canonical identity of an operator: its name and the sites it acts on.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize,
)]
pub struct OpKey {
    pub name: OpName,
    pub sites: Vec<u16>,
}

impl OpKey {
    pub fn new(name: OpName, sites: &[u16]) -> Self {
        Self { name, sites: sites.to_vec() }
    }

    /// Key of the identity.
    pub fn identity() -> Self { Self { name: OpName::I, sites: Vec::new() } }
}

impl fmt::Display for OpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name.fmt(f)?;
        if !self.sites.is_empty() {
            write!(f, "[")?;
            let n = self.sites.len();
            for (k, s) in self.sites.iter().enumerate() {
                write!(f, "{}", s)?;
                if k < n - 1 { write!(f, ",")?; }
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

/// An operator key with a label shift and a scalar factor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpElement<Q> {
    pub key: OpKey,
    pub q_label: Q,
    pub factor: f64,
}

impl<Q: QLabel> OpElement<Q> {
    pub fn new(name: OpName, sites: &[u16], q_label: Q, factor: f64) -> Self {
        Self { key: OpKey::new(name, sites), q_label, factor }
    }

    /// Unit-factor identity.
    pub fn identity() -> Self {
        Self { key: OpKey::identity(), q_label: Q::vacuum(), factor: 1.0 }
    }

    /// Copy of `self` with unit factor.
    pub fn abs(&self) -> Self {
        Self { key: self.key.clone(), q_label: self.q_label, factor: 1.0 }
    }

    pub fn name(&self) -> OpName { self.key.name }
}

impl<Q: QLabel> fmt::Display for OpElement<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.factor != 1.0 { write!(f, "({}) ", self.factor)?; }
        self.key.fmt(f)
    }
}

/// Scaled product of one or two elements with optional transposition.
///
/// Bit `1` of `conj` transposes `a`, bit `2` transposes `b`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpProduct<Q> {
    pub a: OpElement<Q>,
    pub b: Option<OpElement<Q>>,
    pub conj: u8,
    pub factor: f64,
}

impl<Q: QLabel> OpProduct<Q> {
    /// Product `fa * fb * a ⊗ b` with the element factors absorbed.
    pub fn new(a: &OpElement<Q>, b: &OpElement<Q>, conj: u8) -> Self {
        Self {
            a: a.abs(),
            b: Some(b.abs()),
            conj,
            factor: a.factor * b.factor,
        }
    }

    /// Single-element term.
    pub fn single(a: &OpElement<Q>) -> Self {
        Self { a: a.abs(), b: None, conj: 0, factor: a.factor }
    }

    /// Return `true` if `a` enters transposed.
    pub fn trans_a(&self) -> bool { self.conj & 1 != 0 }

    /// Return `true` if `b` enters transposed.
    pub fn trans_b(&self) -> bool { self.conj & 2 != 0 }

    /// Total label shift of the product.
    pub fn delta(&self) -> Q {
        let da = if self.trans_a() { -self.a.q_label } else { self.a.q_label };
        match &self.b {
            Some(b) => {
                let db = if self.trans_b() { -b.q_label } else { b.q_label };
                da + db
            },
            None => da,
        }
    }

    /// Iterate over the keys referenced by the product.
    pub fn keys(&self) -> impl Iterator<Item = &OpKey> + '_ {
        std::iter::once(&self.a.key).chain(self.b.iter().map(|b| &b.key))
    }
}

impl<Q: QLabel> fmt::Display for OpProduct<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.factor != 1.0 { write!(f, "({}) ", self.factor)?; }
        write!(f, "{}", self.a)?;
        if self.trans_a() { write!(f, "^T")?; }
        if let Some(b) = &self.b {
            write!(f, " * {}", b)?;
            if self.trans_b() { write!(f, "^T")?; }
        }
        Ok(())
    }
}

/// Node of an operator expression tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OpExpr<Q> {
    Zero,
    Elem(OpElement<Q>),
    Prod(OpProduct<Q>),
    Sum(Vec<OpProduct<Q>>),
    Ref(Box<OpExpr<Q>>, bool),
}

impl<Q: QLabel> OpExpr<Q> {
    /// Return `true` if `self` is `Zero`.
    pub fn is_zero(&self) -> bool { matches!(self, Self::Zero) }

    /// Return `true` if `self` is `Elem`.
    pub fn is_elem(&self) -> bool { matches!(self, Self::Elem(..)) }

    /// Return `true` if `self` is `Ref`.
    pub fn is_ref(&self) -> bool { matches!(self, Self::Ref(..)) }

    /// Return the element if `self` is `Elem`.
    pub fn as_elem(&self) -> Option<&OpElement<Q>> {
        match self {
            Self::Elem(a) => Some(a),
            _ => None,
        }
    }

    /// Collapse a list of terms into the smallest equivalent node.
    pub fn from_products(mut terms: Vec<OpProduct<Q>>) -> Self {
        terms.retain(|t| t.factor != 0.0);
        match terms.len() {
            0 => Self::Zero,
            1 => Self::Prod(terms.swap_remove(0)),
            _ => Self::Sum(terms),
        }
    }

    /// Product of two element expressions; `None` if either side is not an
    /// element or zero.
    pub fn product(a: &Self, b: &Self, conj: u8) -> Option<Self> {
        match (a, b) {
            (Self::Zero, _) | (_, Self::Zero) => Some(Self::Zero),
            (Self::Elem(ea), Self::Elem(eb)) =>
                Some(Self::Prod(OpProduct::new(ea, eb, conj))),
            _ => None,
        }
    }

    /// Flatten into a list of products.
    ///
    /// `Ref` nodes are looked through; a bare element becomes a single-factor
    /// product.
    pub fn terms(&self) -> Vec<OpProduct<Q>> {
        match self {
            Self::Zero => Vec::new(),
            Self::Elem(a) => vec![OpProduct::single(a)],
            Self::Prod(p) => vec![p.clone()],
            Self::Sum(ps) => ps.clone(),
            Self::Ref(inner, _) => inner.terms(),
        }
    }

    /// Multiply every term by `f`.
    pub fn scale(&mut self, f: f64) {
        match self {
            Self::Zero => { },
            Self::Elem(a) => { a.factor *= f; },
            Self::Prod(p) => { p.factor *= f; },
            Self::Sum(ps) => { ps.iter_mut().for_each(|p| { p.factor *= f; }); },
            Self::Ref(inner, _) => { inner.scale(f); },
        }
    }

    /// Return a copy with every term multiplied by `f`.
    pub fn scaled(&self, f: f64) -> Self {
        let mut new = self.clone();
        new.scale(f);
        new
    }

    /// Collect every key referenced by the expression.
    pub fn keys(&self) -> Vec<OpKey> {
        let mut keys: Vec<OpKey>
            = self.terms().iter()
            .flat_map(|t| t.keys().cloned().collect::<Vec<_>>())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

impl<Q: QLabel> fmt::Display for OpExpr<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zero => write!(f, "0"),
            Self::Elem(a) => a.fmt(f),
            Self::Prod(p) => p.fmt(f),
            Self::Sum(ps) => {
                let n = ps.len();
                for (k, p) in ps.iter().enumerate() {
                    p.fmt(f)?;
                    if k < n - 1 { write!(f, " + ")?; }
                }
                Ok(())
            },
            Self::Ref(inner, is_local) =>
                write!(f, "Ref[{}]({})", if *is_local { "local" } else { "partial" }, inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantum::U1;

    #[test]
    fn product_absorbs_factors() {
        let a = OpExpr::Elem(OpElement::new(OpName::Sp, &[0], U1(2), 0.5));
        let b = OpExpr::Elem(OpElement::new(OpName::Cp, &[1], U1(-2), 3.0));
        let Some(OpExpr::Prod(p)) = OpExpr::product(&a, &b, 0) else {
            panic!("expected a product");
        };
        assert_eq!(p.factor, 1.5);
        assert_eq!(p.a.factor, 1.0);
        assert_eq!(p.delta(), U1(0));
        assert_eq!(format!("{}", p), "(1.5) Sp[0] * Cp[1]");
    }

    #[test]
    fn sums_collapse() {
        let a = OpElement::<U1>::new(OpName::Sz, &[2], U1(0), 1.0);
        assert!(OpExpr::<U1>::from_products(Vec::new()).is_zero());
        assert!(matches!(
            OpExpr::from_products(vec![OpProduct::single(&a)]),
            OpExpr::Prod(..)
        ));
        let mut sum = OpExpr::from_products(vec![OpProduct::single(&a); 3]);
        sum.scale(2.0);
        assert!(sum.terms().iter().all(|t| t.factor == 2.0));
        assert_eq!(sum.keys(), vec![OpKey::new(OpName::Sz, &[2])]);
    }

    #[test]
    fn transposed_delta() {
        let a = OpElement::new(OpName::Sp, &[0], U1(2), 1.0);
        let b = OpElement::new(OpName::Sp, &[1], U1(2), 1.0);
        assert_eq!(OpProduct::new(&a, &b, 2).delta(), U1(0));
        assert_eq!(OpProduct::new(&a, &b, 0).delta(), U1(4));
    }
}
