//! Quantum labels used to block-sparsify every tensor in the crate.
//!
//! Labels are consumed through the [`QLabel`] trait: a totally ordered set
//! with addition, negation, a vacuum element, and an iteration over the
//! labels obtained by fusing two others. For abelian symmetries fusion always
//! produces exactly one label; the trait admits more to leave room for
//! non-abelian label types.
//!
//! [`U1`] is the concrete label used by the models shipped with this crate,
//! counting twice the total *z*-projection of spin (so that spin-1/2 sites
//! carry labels ±1).
//!
//! ```
//! use block_sweep::quantum::{ QLabel, U1 };
//!
//! let up = U1(1);
//! let dn = U1(-1);
//! assert_eq!(up + dn, U1::vacuum());
//! assert_eq!(up.fusion(up), vec![U1(2)]);
//! assert_eq!(-up, dn);
//! ```

use std::{
    fmt,
    hash::Hash,
    ops::{ Add, Neg, Sub },
};
use serde::{ Deserialize, Serialize, de::DeserializeOwned };

/// Interface to a quantum-label algebra.
pub trait QLabel
where
    Self:
        Copy
        + fmt::Debug
        + fmt::Display
        + Eq
        + Ord
        + Hash
        + Add<Output = Self>
        + Sub<Output = Self>
        + Neg<Output = Self>
        + Send
        + Sync
        + Serialize
        + DeserializeOwned
        + 'static
{
    /// The label of the empty system.
    fn vacuum() -> Self;

    /// Return all labels obtained by fusing `self` with `rhs`.
    fn fusion(self, rhs: Self) -> Vec<Self>;

    /// Return `true` if `target` appears in the fusion of `self` with `rhs`.
    fn fuses_to(self, rhs: Self, target: Self) -> bool {
        self.fusion(rhs).contains(&target)
    }
}

/// Abelian U(1) label, stored as an integer charge.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize,
)]
pub struct U1(pub i32);

impl Add for U1 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self { Self(self.0 + rhs.0) }
}

impl Sub for U1 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self { Self(self.0 - rhs.0) }
}

impl Neg for U1 {
    type Output = Self;

    fn neg(self) -> Self { Self(-self.0) }
}

impl fmt::Display for U1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

impl QLabel for U1 {
    fn vacuum() -> Self { Self(0) }

    fn fusion(self, rhs: Self) -> Vec<Self> { vec![self + rhs] }

    fn fuses_to(self, rhs: Self, target: Self) -> bool {
        self + rhs == target
    }
}
