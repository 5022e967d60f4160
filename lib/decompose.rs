//! Truncated decompositions of two-site wavefunctions.
//!
//! A blocking step ends by splitting the optimized two-site wavefunction
//! into an isometry and a new center, keeping at most a fixed number of
//! states on the bond between them. Two routes are provided:
//! - [`split_density_matrix`] diagonalizes a reduced density matrix (which
//!   may carry extra noise or target-averaging terms) block by block;
//! - [`split_svd`] takes a singular value decomposition of the wavefunction
//!   itself.
//!
//! In both cases the states kept are chosen globally across all label
//! blocks: every weight of every block competes for the bond dimension
//! budget, the smallest weights being discarded first, and weights at or
//! below a cutoff are dropped altogether. The truncation error is the
//! discarded fraction of the total weight.

use ndarray as nd;
use ndarray_linalg::{ Eigh, SVD, UPLO, error::LinalgError };
use serde::{ Deserialize, Serialize };
use thiserror::Error;
use crate::{
    basis::BondBasis,
    block::{ self, BlockInfo, BlockMatrix },
    quantum::QLabel,
};

#[derive(Debug, Error)]
pub enum DecomposeError {
    /// Returned when a dense factorization fails.
    #[error("error in decomposition: {0}")]
    Linalg(#[from] LinalgError),

    /// Returned when a wavefunction has more than one block for a kept label.
    #[error("error in decomposition: label {0} appears in more than one block")]
    AmbiguousLabel(String),

    /// Returned when a factorization does not produce its singular vectors.
    #[error("error in decomposition: missing singular vectors for block {0}")]
    MissingVectors(usize),
}
use DecomposeError::*;
pub type DecomposeResult<T> = Result<T, DecomposeError>;

/// Truncation controls for one blocking step.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Truncation {
    /// Maximum number of kept states; `None` keeps everything above the
    /// cutoff.
    pub bond_dim: Option<usize>,
    /// Weights at or below this value are always discarded.
    pub cutoff: f64,
}

impl Default for Truncation {
    fn default() -> Self { Self { bond_dim: None, cutoff: 1e-14 } }
}

impl Truncation {
    /// Keep at most `bond_dim` states.
    pub fn new(bond_dim: usize) -> Self { Self { bond_dim: Some(bond_dim), ..Self::default() } }

    /// Keep everything above the cutoff.
    pub fn unlimited() -> Self { Self::default() }

    pub fn with_cutoff(mut self, cutoff: f64) -> Self {
        self.cutoff = cutoff;
        self
    }
}

/// Result of selecting states from a set of label-resolved weights.
#[derive(Clone, Debug, PartialEq)]
pub struct Selection<Q> {
    /// Number of kept states per label.
    pub kept: Vec<(Q, usize)>,
    pub kept_weight: f64,
    pub total_weight: f64,
}

impl<Q: QLabel> Selection<Q> {
    /// Discarded fraction of the total weight.
    pub fn error(&self) -> f64 {
        if self.total_weight > 0.0 {
            (1.0 - self.kept_weight / self.total_weight).max(0.0)
        } else {
            0.0
        }
    }

    /// Basis spanned by the kept states.
    pub fn basis(&self) -> BondBasis<Q> { BondBasis::from_pairs(self.kept.iter().copied()) }
}

/// Choose the states to keep from weights sorted in descending order within
/// each label.
///
/// At least one state is kept as long as any weight is positive.
pub fn select<Q: QLabel>(weights: &[(Q, Vec<f64>)], trunc: &Truncation) -> Selection<Q> {
    let mut all: Vec<(f64, usize, usize)>
        = weights.iter().enumerate()
        .flat_map(|(b, (_, ws))| {
            ws.iter().enumerate().map(move |(k, w)| (w.max(0.0), b, k))
        })
        .collect();
    let total_weight: f64 = all.iter().map(|(w, ..)| w).sum();
    all.sort_by(|l, r| r.0.total_cmp(&l.0).then(l.1.cmp(&r.1)).then(l.2.cmp(&r.2)));
    let budget = trunc.bond_dim.unwrap_or(usize::MAX);
    let mut counts: Vec<usize> = vec![0; weights.len()];
    let mut kept_weight: f64 = 0.0;
    for (n, (w, b, _)) in all.iter().enumerate() {
        if n >= budget { break; }
        if *w <= trunc.cutoff && n > 0 { break; }
        if *w <= 0.0 { break; }
        counts[*b] += 1;
        kept_weight += w;
    }
    let kept: Vec<(Q, usize)>
        = weights.iter().zip(counts)
        .filter(|(_, c)| *c > 0)
        .map(|((q, _), c)| (*q, c))
        .collect();
    Selection { kept, kept_weight, total_weight }
}

/// Isometry and statistics produced by a truncated split.
#[derive(Clone, Debug)]
pub struct Split<Q> {
    /// Left-canonical (`fused x new`) or right-canonical (`new x fused`)
    /// isometry, as an operator with zero label shift.
    pub isometry: BlockMatrix<Q>,
    /// Basis of the new bond.
    pub basis: BondBasis<Q>,
    pub selection: Selection<Q>,
}

/// Diagonalize a density matrix block by block and keep its dominant
/// eigenvectors.
///
/// With `forward` the density matrix lives on the fused left basis and the
/// isometry is left-canonical; otherwise it lives on the fused right basis
/// and the isometry is right-canonical.
pub fn split_density_matrix<Q: QLabel>(
    dm: &BlockMatrix<Q>,
    trunc: &Truncation,
    forward: bool,
) -> DecomposeResult<Split<Q>>
{
    let mut eigs: Vec<(Q, nd::Array2<f64>)> = Vec::new();
    let mut weights: Vec<(Q, Vec<f64>)> = Vec::new();
    for k in 0..dm.n_blocks() {
        let e = dm.info().entries()[k];
        if e.row != e.col { continue; }
        let (vals, vecs) = dm.block(k).eigh(UPLO::Lower)?;
        // ascending to descending
        let ws: Vec<f64> = vals.iter().rev().copied().collect();
        let vecs = vecs.slice(nd::s![.., ..;-1]).to_owned();
        weights.push((e.row, ws));
        eigs.push((e.row, vecs));
    }
    let selection = select(&weights, trunc);
    let basis = selection.basis();
    let fused = dm.info().rows().clone();
    let info = if forward {
        BlockInfo::operator(fused, basis.clone(), Q::vacuum())
    } else {
        BlockInfo::operator(basis.clone(), fused, Q::vacuum())
    };
    let mut isometry = BlockMatrix::zeros(info);
    for (q, vecs) in eigs.iter() {
        let m = basis.dim(*q);
        if m == 0 { continue; }
        let Some(k) = isometry.info().find(*q, *q) else { continue; };
        let kept = vecs.slice(nd::s![.., ..m]);
        if forward {
            isometry.block_mut(k).assign(&kept);
        } else {
            isometry.block_mut(k).assign(&kept.t());
        }
    }
    Ok(Split { isometry, basis, selection })
}

/// Apply a freshly computed isometry to the two-site wavefunction it was
/// derived from, producing the new one-site center.
///
/// Forward: `isoᵀ ψ` on `new x fused right`. Backward: `ψ isoᵀ` on
/// `fused left x new`.
pub fn project_center<Q: QLabel>(
    psi: &BlockMatrix<Q>,
    isometry: &BlockMatrix<Q>,
    forward: bool,
) -> BlockMatrix<Q>
{
    let target = psi.info().delta();
    if forward {
        let info = BlockInfo::wavefunction(
            isometry.info().cols().clone(), psi.info().cols().clone(), target);
        let mut c = BlockMatrix::zeros(info);
        block::matmul(isometry, true, psi, false, &mut c, 1.0);
        c
    } else {
        let info = BlockInfo::wavefunction(
            psi.info().rows().clone(), isometry.info().rows().clone(), target);
        let mut c = BlockMatrix::zeros(info);
        block::matmul(psi, false, isometry, true, &mut c, 1.0);
        c
    }
}

type SvdFactors = (Option<nd::Array2<f64>>, nd::Array1<f64>, Option<nd::Array2<f64>>);

fn with_vectors(k: usize, factors: SvdFactors)
    -> DecomposeResult<(nd::Array2<f64>, nd::Array1<f64>, nd::Array2<f64>)>
{
    let (Some(u), s, Some(vt)) = factors else { return Err(MissingVectors(k)); };
    Ok((u, s, vt))
}

/// Singular value decomposition of a two-site wavefunction, truncated.
///
/// Returns the isometry (left-canonical if `forward`, else right-canonical)
/// together with the new center carrying the singular values.
pub fn split_svd<Q: QLabel>(
    psi: &BlockMatrix<Q>,
    trunc: &Truncation,
    forward: bool,
) -> DecomposeResult<(Split<Q>, BlockMatrix<Q>)>
{
    struct Factors<Q> {
        q: Q,
        k: usize,
        u: nd::Array2<f64>,
        s: nd::Array1<f64>,
        vt: nd::Array2<f64>,
    }

    let mut factors: Vec<Factors<Q>> = Vec::new();
    let mut weights: Vec<(Q, Vec<f64>)> = Vec::new();
    for k in 0..psi.n_blocks() {
        let e = psi.info().entries()[k];
        let q = if forward { e.row } else { e.col };
        if weights.iter().any(|(ql, _)| *ql == q) {
            return Err(AmbiguousLabel(q.to_string()));
        }
        let (u, s, vt) = with_vectors(k, psi.block(k).svd(true, true)?)?;
        weights.push((q, s.iter().map(|x| x * x).collect()));
        factors.push(Factors { q, k, u, s, vt });
    }
    weights.sort_by_key(|(q, _)| *q);
    let selection = select(&weights, trunc);
    let basis = selection.basis();
    let target = psi.info().delta();
    let (iso_info, c_info) = if forward {
        (
            BlockInfo::operator(psi.info().rows().clone(), basis.clone(), Q::vacuum()),
            BlockInfo::wavefunction(basis.clone(), psi.info().cols().clone(), target),
        )
    } else {
        (
            BlockInfo::operator(basis.clone(), psi.info().cols().clone(), Q::vacuum()),
            BlockInfo::wavefunction(psi.info().rows().clone(), basis.clone(), target),
        )
    };
    let mut isometry = BlockMatrix::zeros(iso_info);
    let mut center = BlockMatrix::zeros(c_info);
    for Factors { q, k, u, s, vt } in factors.into_iter() {
        let m = basis.dim(q);
        if m == 0 { continue; }
        let e = psi.info().entries()[k];
        let (Some(ki), Some(kc)) = (
            isometry.info().find(q, q),
            if forward { center.info().find(q, e.col) } else { center.info().find(e.row, q) },
        ) else { continue; };
        if forward {
            isometry.block_mut(ki).assign(&u.slice(nd::s![.., ..m]));
            let mut sv = vt.slice(nd::s![..m, ..]).to_owned();
            sv.axis_iter_mut(nd::Axis(0)).zip(s.iter())
                .for_each(|(mut row, sj)| { row *= *sj; });
            center.block_mut(kc).assign(&sv);
        } else {
            isometry.block_mut(ki).assign(&vt.slice(nd::s![..m, ..]));
            let mut us = u.slice(nd::s![.., ..m]).to_owned();
            us.axis_iter_mut(nd::Axis(1)).zip(s.iter())
                .for_each(|(mut col, sj)| { col *= *sj; });
            center.block_mut(kc).assign(&us);
        }
    }
    Ok((Split { isometry, basis, selection }, center))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::quantum::U1;

    fn weights() -> Vec<(U1, Vec<f64>)> {
        vec![
            (U1(-2), vec![0.05]),
            (U1(0), vec![0.5, 0.2, 0.01]),
            (U1(2), vec![0.24]),
        ]
    }

    #[test]
    fn selection_discards_smallest_first() {
        let sel = select(&weights(), &Truncation::new(3));
        assert_eq!(sel.kept, vec![(U1(0), 2), (U1(2), 1)]);
        assert_abs_diff_eq!(sel.error(), 0.06, epsilon = 1e-12);
    }

    #[test]
    fn truncation_error_is_monotone() {
        let mut last = f64::INFINITY;
        let mut last_kept = 0.0;
        for m in 1..=6 {
            let sel = select(&weights(), &Truncation::new(m));
            assert!(sel.error() <= last);
            assert!(sel.kept_weight >= last_kept);
            last = sel.error();
            last_kept = sel.kept_weight;
        }
        assert_abs_diff_eq!(last, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn cutoff_drops_tiny_weights() {
        let sel = select(&weights(), &Truncation::unlimited().with_cutoff(0.02));
        assert_eq!(sel.kept.iter().map(|(_, c)| c).sum::<usize>(), 4);
    }

    #[test]
    fn svd_and_density_matrix_agree() {
        let basis = BondBasis::from_pairs([(U1(-1), 3), (U1(1), 3)]);
        let mut rng = StdRng::seed_from_u64(3);
        let mut psi = BlockMatrix::random(
            BlockInfo::wavefunction(basis.clone(), basis.clone(), U1(0)), &mut rng);
        psi.normalize();
        let trunc = Truncation::new(4);
        let (svd, center) = split_svd(&psi, &trunc, true).unwrap();
        let mut dm = BlockMatrix::zeros(BlockInfo::operator(basis.clone(), basis, U1(0)));
        block::density(&psi, true, 1.0, &mut dm);
        let eig = split_density_matrix(&dm, &trunc, true).unwrap();
        assert_eq!(svd.basis, eig.basis);
        assert_abs_diff_eq!(svd.selection.error(), eig.selection.error(), epsilon = 1e-10);
        let projected = project_center(&psi, &eig.isometry, true);
        assert_abs_diff_eq!(projected.norm(), center.norm(), epsilon = 1e-10);
        assert_abs_diff_eq!(
            center.norm().powi(2), 1.0 - svd.selection.error(), epsilon = 1e-10);
    }

    #[test]
    fn factorization_without_vectors_is_an_error() {
        let s = nd::Array1::from(vec![1.0]);
        let u = nd::Array2::eye(1);
        let err = with_vectors(2, (None, s.clone(), Some(u.clone()))).unwrap_err();
        assert!(matches!(err, MissingVectors(2)));
        assert!(with_vectors(0, (Some(u.clone()), s.clone(), None)).is_err());
        assert!(with_vectors(0, (Some(u.clone()), s, Some(u))).is_ok());
    }
}
