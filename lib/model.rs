//! Spin-1/2 site operators and reference states for the XXZ chain.
//!
//! Each spin-1/2 site carries the basis `{U1(-1): 1, U1(1): 1}`, i.e. the
//! down state first. Dense matrices below follow the same ordering:
//! ```text
//!         |↓⟩  |↑⟩
//! ⟨↓|  [  a    b  ]
//! ⟨↑|  [  c    d  ]
//! ```
//! and are converted to block form with [`to_block`].

use ndarray as nd;
use num_traits::Float;
use once_cell::sync::Lazy;
use serde::{ Deserialize, Serialize };
use crate::{
    basis::BondBasis,
    block::{ BlockInfo, BlockMatrix },
    expr::{ OpKey, OpName },
    mps::{ CanonicalTag, Fused, Mps, MpsInfo, MpsResult, SiteData, SiteTensor },
    op_arena::OpArena,
    quantum::{ QLabel, U1 },
};

/// Make the spin projection operator.
///
/// Consider using the lazily-constructed, `f64`-valued [`SZMAT`] instead.
pub fn make_sz<A: Float>() -> nd::Array2<A> {
    let h = (A::one() + A::one()).recip();
    nd::array![
        [-h,        A::zero()],
        [A::zero(), h        ],
    ]
}

/// Lazy-static version of [`make_sz`] for an `f64` element type.
pub static SZMAT: Lazy<nd::Array2<f64>> = Lazy::new(make_sz);

/// Make the spin raising operator.
///
/// Consider using the lazily-constructed, `f64`-valued [`SPMAT`] instead.
pub fn make_sp<A: Float>() -> nd::Array2<A> {
    nd::array![
        [A::zero(), A::zero()],
        [A::one(),  A::zero()],
    ]
}

/// Lazy-static version of [`make_sp`] for an `f64` element type.
pub static SPMAT: Lazy<nd::Array2<f64>> = Lazy::new(make_sp);

/// Make the spin lowering operator.
///
/// Consider using the lazily-constructed, `f64`-valued [`SMMAT`] instead.
pub fn make_sm<A: Float>() -> nd::Array2<A> {
    nd::array![
        [A::zero(), A::one() ],
        [A::zero(), A::zero()],
    ]
}

/// Lazy-static version of [`make_sm`] for an `f64` element type.
pub static SMMAT: Lazy<nd::Array2<f64>> = Lazy::new(make_sm);

/// Physical basis of a spin-1/2 site.
pub fn spin_basis() -> BondBasis<U1> { BondBasis::from_pairs([(U1(-1), 1), (U1(1), 1)]) }

/// Convert a dense operator on `basis` (labels in ascending order) to block
/// form with label shift `delta`, dropping entries outside the allowed
/// blocks.
pub fn to_block<Q: QLabel>(dense: &nd::Array2<f64>, basis: &BondBasis<Q>, delta: Q)
    -> BlockMatrix<Q>
{
    let offsets: Vec<(Q, usize)>
        = basis.iter()
        .scan(0, |acc, (q, d)| { let o = *acc; *acc += d; Some((q, o)) })
        .collect();
    let offset_of = |q: Q| -> usize {
        offsets.iter().find(|(ql, _)| *ql == q).map(|(_, o)| *o).unwrap_or(0)
    };
    let mut out = BlockMatrix::zeros(BlockInfo::operator(basis.clone(), basis.clone(), delta));
    for k in 0..out.n_blocks() {
        let e = out.info().entries()[k];
        let (ro, co) = (offset_of(e.row), offset_of(e.col));
        let src = dense.slice(nd::s![ro..ro + e.nrows, co..co + e.ncols]);
        out.block_mut(k).assign(&src);
    }
    out
}

/// Operators `I`, `Sp[i]`, `Sm[i]`, `Sz[i]` of a spin site.
pub fn spin_site_ops(site: usize) -> OpArena<BlockMatrix<U1>> {
    let b = spin_basis();
    let s = [site as u16];
    let mut ops = OpArena::new();
    ops.allocate(OpKey::identity(), BlockMatrix::identity(&b));
    ops.allocate(OpKey::new(OpName::Sp, &s), to_block(&SPMAT, &b, U1(2)));
    ops.allocate(OpKey::new(OpName::Sm, &s), to_block(&SMMAT, &b, U1(-2)));
    ops.allocate(OpKey::new(OpName::Sz, &s), to_block(&SZMAT, &b, U1(0)));
    ops
}

/// Operators of an ancilla site: only the identity.
pub fn ancilla_site_ops() -> OpArena<BlockMatrix<U1>> {
    let mut ops = OpArena::new();
    ops.allocate(OpKey::identity(), BlockMatrix::identity(&spin_basis()));
    ops
}

/// Couplings of the XXZ chain
/// ```text
/// H = Σ_i [ J/2 (S+_i S-_{i+1} + S-_i S+_{i+1}) + Jz Sz_i Sz_{i+1} ] + h Σ_i Sz_i
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Xxz {
    pub j: f64,
    pub jz: f64,
    pub h: f64,
}

impl Default for Xxz {
    fn default() -> Self { Self { j: 1.0, jz: 1.0, h: 0.0 } }
}

impl Xxz {
    pub fn new(j: f64, jz: f64, h: f64) -> Self { Self { j, jz, h } }

    /// Dense Hamiltonian on `n` spins, site 0 outermost.
    ///
    /// Only meant for small reference calculations.
    pub fn dense_hamiltonian(&self, n: usize) -> nd::Array2<f64> {
        let dim = 1_usize << n;
        let mut ham = nd::Array2::<f64>::zeros((dim, dim));
        let id = nd::Array2::<f64>::eye(2);
        let embed = |ops: &[(usize, &nd::Array2<f64>)]| -> nd::Array2<f64> {
            (0..n).fold(nd::Array2::<f64>::ones((1, 1)), |acc, k| {
                let op = ops.iter().find(|(s, _)| *s == k).map(|(_, m)| *m).unwrap_or(&id);
                nd::linalg::kron(&acc, op)
            })
        };
        for i in 0..n {
            ham.scaled_add(self.h, &embed(&[(i, &*SZMAT)]));
            if i + 1 == n { continue; }
            ham.scaled_add(self.j / 2.0, &embed(&[(i, &*SPMAT), (i + 1, &*SMMAT)]));
            ham.scaled_add(self.j / 2.0, &embed(&[(i, &*SMMAT), (i + 1, &*SPMAT)]));
            ham.scaled_add(self.jz, &embed(&[(i, &*SZMAT), (i + 1, &*SZMAT)]));
        }
        ham
    }
}

/// Infinite-temperature state of `n_phys` spins, each paired with an
/// ancilla spin in the singlet-like combination `(|↓↑⟩ + |↑↓⟩) / √2`.
///
/// Physical sites sit at even positions and ancillas at odd positions. The
/// center is on the last ancilla.
pub fn thermal_limit_state(n_phys: usize) -> MpsResult<Mps<U1>> {
    let n = 2 * n_phys;
    let spin = spin_basis();
    let vac: BondBasis<U1> = BondBasis::vacuum();
    let mut info = MpsInfo::new(vec![spin.clone(); n], U1(0), None)?;
    for i in 0..=n {
        let b = if i % 2 == 0 { vac.clone() } else { spin.clone() };
        info.left_dims[i] = b.clone();
        info.right_dims[i] = b;
    }
    info.bond_dim = Some(2);
    let pair = spin.fuse(&spin).basis;
    let amp = std::f64::consts::FRAC_1_SQRT_2;
    let mut tensors: Vec<SiteData<U1>> = Vec::with_capacity(n);
    let mut tags: Vec<CanonicalTag> = Vec::with_capacity(n);
    for i in 0..n {
        if i % 2 == 0 {
            let iso = BlockMatrix::identity(&spin);
            tensors.push(SiteData::Single(SiteTensor::new(Fused::Left, iso)));
            tags.push(CanonicalTag::L);
        } else {
            let last = i + 1 == n;
            let info = if last {
                BlockInfo::wavefunction(pair.clone(), vac.clone(), U1(0))
            } else {
                BlockInfo::operator(pair.clone(), vac.clone(), U1(0))
            };
            let mut mat = BlockMatrix::zeros(info);
            mat.data_mut().iter_mut().for_each(|x| { *x = amp; });
            tensors.push(SiteData::Single(SiteTensor::new(Fused::Left, mat)));
            tags.push(if last { CanonicalTag::C } else { CanonicalTag::L });
        }
    }
    Mps::from_parts(info, tensors, tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray_linalg::{ Eigh, UPLO };

    #[test]
    fn spin_algebra() {
        // [S+, S-] = 2 Sz
        let comm = SPMAT.dot(&*SMMAT) - SMMAT.dot(&*SPMAT);
        assert_eq!(comm, &*SZMAT * 2.0);
        let b = spin_basis();
        let sp = to_block(&SPMAT, &b, U1(2));
        assert_eq!(sp.len(), 1);
        assert_eq!(sp.get(U1(1), U1(-1)).unwrap()[[0, 0]], 1.0);
        let sz = to_block(&SZMAT, &b, U1(0));
        assert_eq!(sz.get(U1(-1), U1(-1)).unwrap()[[0, 0]], -0.5);
    }

    #[test]
    fn two_site_heisenberg_spectrum() {
        let ham = Xxz::default().dense_hamiltonian(2);
        let (vals, _) = ham.eigh(UPLO::Lower).unwrap();
        assert_abs_diff_eq!(vals[0], -0.75, epsilon = 1e-12);
        for v in vals.iter().skip(1) { assert_abs_diff_eq!(*v, 0.25, epsilon = 1e-12); }
    }

    #[test]
    fn thermal_state_is_normalized_product_of_pairs() {
        let mps = thermal_limit_state(3).unwrap();
        assert_eq!(mps.canonical_form(), "LLLLLC");
        let dense = mps.to_dense().unwrap();
        assert_abs_diff_eq!(dense.dot(&dense), 1.0, epsilon = 1e-12);
        // only states with each pair in (↓↑) or (↑↓) appear
        let nonzero = dense.iter().filter(|x| x.abs() > 1e-12).count();
        assert_eq!(nonzero, 8);
    }
}
