//! Matrix-free Krylov kernels on block-sparse wavefunctions.
//!
//! Every kernel takes the effective operator as a closure `apply(c, v)`
//! computing `v = H c` for a zeroed `v` of the same layout as `c`. Small
//! projected problems are solved densely with `ndarray-linalg`.
//!
//! - [`davidson`]: lowest eigenpairs, diagonal preconditioner, several roots
//!   at once.
//! - [`expo_apply`]: `exp(t (H + e0)) v` by a Lanczos projection with full
//!   reorthogonalization.
//! - [`rk4_stages`]: one classical Runge-Kutta step for `dv/dτ = t H v`,
//!   sampled at a third, two thirds and the whole of the step.

use ndarray as nd;
use ndarray_linalg::{ Eigh, UPLO, error::LinalgError };
use thiserror::Error;
use tracing::{ trace, warn };
use crate::{
    block::BlockMatrix,
    functions::ContractError,
    quantum::QLabel,
};

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("error in solver: {0}")]
    Linalg(#[from] LinalgError),

    #[error("error in solver: {0}")]
    Contract(#[from] ContractError),

    /// Returned when a solver is started without any vector.
    #[error("error in solver: no starting vector")]
    NoGuess,
}
use SolverError::*;
pub type SolverResult<T> = Result<T, SolverError>;

/// Result of a [`davidson`] run.
#[derive(Clone, Debug)]
pub struct DavidsonOutcome {
    /// Ritz values, ascending.
    pub energies: Vec<f64>,
    /// Number of operator applications.
    pub iterations: usize,
    pub converged: bool,
}

/// Result of an [`expo_apply`] run.
#[derive(Copy, Clone, Debug)]
pub struct ExpoOutcome {
    /// `⟨v|H|v⟩ / ⟨v|v⟩ + e0` of the propagated vector.
    pub energy: f64,
    /// Norm of the propagated vector.
    pub norm: f64,
    /// Number of operator applications.
    pub iterations: usize,
}

/// Result of [`rk4_stages`].
#[derive(Clone, Debug)]
pub struct Rk4Outcome<Q> {
    /// Approximations of the propagated vector at a third, two thirds and
    /// the whole of the step.
    pub stages: Vec<BlockMatrix<Q>>,
    /// Energy of the last stage.
    pub energy: f64,
    /// Norm of the last stage.
    pub norm: f64,
    pub iterations: usize,
}

const ORTHO_TOL: f64 = 1e-10;

fn orthogonalize<Q: QLabel>(v: &mut BlockMatrix<Q>, basis: &[BlockMatrix<Q>]) {
    // two passes of classical Gram-Schmidt
    for _ in 0..2 {
        for b in basis.iter() {
            let ov = b.dot(v);
            v.iadd(b, -ov, false);
        }
    }
}

fn apply_new<Q, F>(apply: &mut F, c: &BlockMatrix<Q>) -> SolverResult<BlockMatrix<Q>>
where
    Q: QLabel,
    F: FnMut(&BlockMatrix<Q>, &mut BlockMatrix<Q>) -> Result<(), ContractError>,
{
    let mut v = c.zeros_like();
    apply(c, &mut v)?;
    Ok(v)
}

fn combine<Q: QLabel>(vecs: &[BlockMatrix<Q>], coeffs: nd::ArrayView1<f64>)
    -> BlockMatrix<Q>
{
    let mut out = vecs[0].zeros_like();
    vecs.iter().zip(coeffs.iter())
        .for_each(|(v, c)| { out.iadd(v, *c, false); });
    out
}

/// Davidson iteration for the lowest `vecs.len()` eigenpairs.
///
/// `vecs` holds the initial guesses and receives the Ritz vectors. A root is
/// converged when its squared residual norm drops below `conv_thrd`; the
/// search space collapses onto the current Ritz vectors when it would exceed
/// `max_space`. Reaching `max_iter` operator applications is not an error:
/// the current estimates are returned with `converged == false`.
pub fn davidson<Q, F>(
    mut apply: F,
    diag: Option<&BlockMatrix<Q>>,
    vecs: &mut [BlockMatrix<Q>],
    conv_thrd: f64,
    max_iter: usize,
    max_space: usize,
) -> SolverResult<DavidsonOutcome>
where
    Q: QLabel,
    F: FnMut(&BlockMatrix<Q>, &mut BlockMatrix<Q>) -> Result<(), ContractError>,
{
    let k = vecs.len();
    let Some(first) = vecs.first() else { return Err(NoGuess); };
    let dim = first.len();
    let k_eff = k.min(dim);
    let max_space = max_space.max(2 * k_eff + 1).min(dim.max(1));

    let mut basis: Vec<BlockMatrix<Q>> = Vec::with_capacity(max_space);
    for v in vecs.iter() {
        let mut b = v.clone();
        orthogonalize(&mut b, &basis);
        if b.normalize() > ORTHO_TOL { basis.push(b); }
    }
    if basis.len() < k_eff {
        // fill up with unit vectors, lowest diagonal entries first
        let mut order: Vec<usize> = (0..dim).collect();
        if let Some(d) = diag {
            order.sort_by(|&a, &b| d.data()[a].total_cmp(&d.data()[b]));
        }
        for idx in order {
            if basis.len() >= k_eff { break; }
            let mut e = first.zeros_like();
            e.data_mut()[idx] = 1.0;
            orthogonalize(&mut e, &basis);
            if e.normalize() > ORTHO_TOL { basis.push(e); }
        }
    }
    let mut iterations: usize = 0;
    let mut sigma: Vec<BlockMatrix<Q>> = Vec::with_capacity(max_space);
    for b in basis.iter() {
        sigma.push(apply_new(&mut apply, b)?);
        iterations += 1;
    }

    loop {
        let m = basis.len();
        let mut hm: nd::Array2<f64> = nd::Array2::zeros((m, m));
        for i in 0..m {
            for j in 0..=i {
                let x = 0.5 * (basis[i].dot(&sigma[j]) + basis[j].dot(&sigma[i]));
                hm[[i, j]] = x;
                hm[[j, i]] = x;
            }
        }
        let (vals, evecs) = hm.eigh(UPLO::Lower)?;
        let nroot = k_eff.min(m);
        let mut ritz: Vec<BlockMatrix<Q>> = Vec::with_capacity(nroot);
        let mut hritz: Vec<BlockMatrix<Q>> = Vec::with_capacity(nroot);
        let mut residuals: Vec<(f64, BlockMatrix<Q>)> = Vec::with_capacity(nroot);
        for r in 0..nroot {
            let x = combine(&basis, evecs.column(r));
            let hx = combine(&sigma, evecs.column(r));
            let mut res = hx.clone();
            res.iadd(&x, -vals[r], false);
            residuals.push((res.dot(&res), res));
            ritz.push(x);
            hritz.push(hx);
        }
        let converged = residuals.iter().all(|(rsq, _)| *rsq < conv_thrd);
        trace!(
            space = m, iterations,
            energy = vals[0],
            max_residual = residuals.iter().map(|(r, _)| *r).fold(0.0, f64::max),
            "davidson step",
        );

        let mut corrections: Vec<BlockMatrix<Q>> = Vec::new();
        if !converged && iterations < max_iter {
            for (r, (rsq, res)) in residuals.iter().enumerate() {
                if *rsq < conv_thrd { continue; }
                let mut t = res.clone();
                if let Some(d) = diag {
                    t.data_mut().iter_mut().zip(d.data())
                        .for_each(|(x, dx)| {
                            let denom = vals[r] - dx;
                            let denom
                                = if denom.abs() < 1e-12 { 1e-12_f64.copysign(denom) }
                                else { denom };
                            *x /= denom;
                        });
                }
                orthogonalize(&mut t, &basis);
                orthogonalize(&mut t, &corrections);
                if t.normalize() > ORTHO_TOL { corrections.push(t); }
            }
        }

        if converged || iterations >= max_iter || corrections.is_empty() {
            if !converged {
                warn!(
                    iterations,
                    residuals = ?residuals.iter().map(|(r, _)| *r).collect::<Vec<f64>>(),
                    "davidson did not converge",
                );
            }
            let energies: Vec<f64> = vals.iter().take(nroot).copied().collect();
            for (v, x) in vecs.iter_mut().zip(ritz) { *v = x; }
            return Ok(DavidsonOutcome { energies, iterations, converged });
        }

        if m + corrections.len() > max_space {
            basis = ritz;
            sigma = hritz;
        }
        for t in corrections.into_iter() {
            if basis.len() >= dim { break; }
            sigma.push(apply_new(&mut apply, &t)?);
            basis.push(t);
            iterations += 1;
        }
    }
}

/// Replace `v` by `exp(t (H + const_e)) v`.
///
/// The Krylov space grows until the estimated error of the projected
/// exponential drops below `conv_thrd`, the space is exhausted, or it
/// reaches `max_dim` vectors.
pub fn expo_apply<Q, F>(
    mut apply: F,
    v: &mut BlockMatrix<Q>,
    t: f64,
    const_e: f64,
    conv_thrd: f64,
    max_dim: usize,
) -> SolverResult<ExpoOutcome>
where
    Q: QLabel,
    F: FnMut(&BlockMatrix<Q>, &mut BlockMatrix<Q>) -> Result<(), ContractError>,
{
    let nrm = v.norm();
    if nrm == 0.0 {
        return Ok(ExpoOutcome { energy: const_e, norm: 0.0, iterations: 0 });
    }
    let max_dim = max_dim.max(1).min(v.len());
    let mut q: Vec<BlockMatrix<Q>> = vec![v.clone()];
    q[0].scale(1.0 / nrm);
    let mut alphas: Vec<f64> = Vec::with_capacity(max_dim);
    let mut betas: Vec<f64> = Vec::with_capacity(max_dim);
    let mut iterations: usize = 0;
    let (coeffs, tri) = loop {
        let j = q.len() - 1;
        let mut w = apply_new(&mut apply, &q[j])?;
        iterations += 1;
        let a = q[j].dot(&w);
        alphas.push(a);
        orthogonalize(&mut w, &q);
        let b = w.norm();
        let tri = tridiagonal(&alphas, &betas);
        let (evals, evecs) = tri.eigh(UPLO::Lower)?;
        // y = exp(t T) e1
        let weights: nd::Array1<f64>
            = evecs.row(0).iter().zip(evals.iter())
            .map(|(c, e)| c * (t * e).exp())
            .collect();
        let y = evecs.dot(&weights);
        let err = b * y[j].abs();
        if b < ORTHO_TOL || err < conv_thrd || q.len() >= max_dim {
            break (y, tri);
        }
        w.scale(1.0 / b);
        q.push(w);
        betas.push(b);
    };
    let ty = tri.dot(&coeffs);
    let ysq = coeffs.dot(&coeffs);
    let energy = if ysq > 0.0 { coeffs.dot(&ty) / ysq } else { 0.0 } + const_e;
    let mut out = combine(&q, coeffs.view());
    out.scale(nrm * (t * const_e).exp());
    let norm = out.norm();
    *v = out;
    trace!(t, iterations, energy, norm, "krylov exponential");
    Ok(ExpoOutcome { energy, norm, iterations })
}

fn tridiagonal(alphas: &[f64], betas: &[f64]) -> nd::Array2<f64> {
    let m = alphas.len();
    let mut tri: nd::Array2<f64> = nd::Array2::zeros((m, m));
    for (i, a) in alphas.iter().enumerate() { tri[[i, i]] = *a; }
    for (i, b) in betas.iter().enumerate().take(m.saturating_sub(1)) {
        tri[[i, i + 1]] = *b;
        tri[[i + 1, i]] = *b;
    }
    tri
}

const RK4_NODES: [f64; 4] = [0.0, 0.5, 0.5, 1.0];
const RK4_STAGE_WEIGHTS: [[f64; 4]; 3] = [
    [31.0 / 162.0, 14.0 / 162.0, 14.0 / 162.0, -5.0 / 162.0],
    [16.0 / 81.0, 20.0 / 81.0, 20.0 / 81.0, -2.0 / 81.0],
    [1.0 / 6.0, 2.0 / 6.0, 2.0 / 6.0, 1.0 / 6.0],
];

/// One Runge-Kutta step of `dv/dτ = t H v` over `τ ∈ [0, 1]`, leaving `v`
/// unchanged.
///
/// The three stages approximate `exp(τ t (H + const_e)) v` at `τ = 1/3, 2/3,
/// 1` with dense-output weights of the classical scheme.
pub fn rk4_stages<Q, F>(mut apply: F, v: &BlockMatrix<Q>, t: f64, const_e: f64)
    -> SolverResult<Rk4Outcome<Q>>
where
    Q: QLabel,
    F: FnMut(&BlockMatrix<Q>, &mut BlockMatrix<Q>) -> Result<(), ContractError>,
{
    let mut ks: Vec<BlockMatrix<Q>> = Vec::with_capacity(4);
    for (i, node) in RK4_NODES.iter().enumerate() {
        let mut r = v.clone();
        if i > 0 { r.iadd(&ks[i - 1], *node, false); }
        let mut hr = apply_new(&mut apply, &r)?;
        hr.scale(t);
        ks.push(hr);
    }
    let stages: Vec<BlockMatrix<Q>>
        = RK4_STAGE_WEIGHTS.iter().enumerate()
        .map(|(j, cs)| {
            let mut r = v.clone();
            ks.iter().zip(cs).for_each(|(k, c)| { r.iadd(k, *c, false); });
            r.scale((t * (j + 1) as f64 / 3.0 * const_e).exp());
            r
        })
        .collect();
    let last = &stages[2];
    let hl = apply_new(&mut apply, last)?;
    let nsq = last.dot(last);
    let energy = if nsq > 0.0 { hl.dot(last) / nsq } else { 0.0 } + const_e;
    Ok(Rk4Outcome { stages, energy, norm: nsq.sqrt(), iterations: 5 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{ Rng, SeedableRng, rngs::StdRng };
    use crate::{ basis::BondBasis, block::BlockInfo, quantum::U1 };

    fn vector(dim: usize) -> BlockMatrix<U1> {
        BlockMatrix::zeros(BlockInfo::wavefunction(
            BondBasis::from_pairs([(U1(0), dim)]), BondBasis::vacuum(), U1(0)))
    }

    fn symmetric(dim: usize, seed: u64) -> nd::Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let a: nd::Array2<f64> = nd::Array2::from_shape_fn((dim, dim), |_| rng.gen_range(-1.0..1.0));
        &a + &a.t()
    }

    fn dense_apply(h: &nd::Array2<f64>)
        -> impl FnMut(&BlockMatrix<U1>, &mut BlockMatrix<U1>) -> Result<(), ContractError> + '_
    {
        move |c, v| {
            let x = nd::ArrayView1::from(c.data());
            let y = h.dot(&x);
            v.data_mut().iter_mut().zip(y.iter()).for_each(|(a, b)| { *a += b; });
            Ok(())
        }
    }

    #[test]
    fn davidson_finds_the_lowest_roots() {
        let dim = 30;
        let h = symmetric(dim, 1);
        let (exact, _) = h.eigh(UPLO::Lower).unwrap();
        let mut diag = vector(dim);
        diag.data_mut().iter_mut().zip(h.diag()).for_each(|(a, b)| { *a = *b; });
        let mut rng = StdRng::seed_from_u64(2);
        let mut guesses: Vec<BlockMatrix<U1>>
            = (0..2)
            .map(|_| {
                let mut g = vector(dim);
                g.add_random(1.0, &mut rng);
                g
            })
            .collect();
        let out = davidson(dense_apply(&h), Some(&diag), &mut guesses, 1e-16, 500, dim)
            .unwrap();
        assert!(out.converged);
        assert_abs_diff_eq!(out.energies[0], exact[0], epsilon = 1e-8);
        assert_abs_diff_eq!(out.energies[1], exact[1], epsilon = 1e-8);
        assert_abs_diff_eq!(guesses[0].norm(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(guesses[0].dot(&guesses[1]), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn davidson_without_guess_is_an_error() {
        let h = symmetric(4, 0);
        let mut none: Vec<BlockMatrix<U1>> = Vec::new();
        assert!(matches!(davidson(dense_apply(&h), None, &mut none, 1e-10, 10, 4), Err(NoGuess)));
    }

    #[test]
    fn krylov_exponential_matches_dense() {
        let dim = 16;
        let h = symmetric(dim, 3);
        let (vals, vecs) = h.eigh(UPLO::Lower).unwrap();
        let t = -0.3;
        let e0 = 0.7;
        let mut v = vector(dim);
        v.data_mut().iter_mut().enumerate().for_each(|(i, x)| { *x = 1.0 / (1.0 + i as f64); });
        let x0 = nd::Array1::from(v.data().to_vec());
        let expd = nd::Array2::from_diag(&vals.mapv(|e| (t * (e + e0)).exp()));
        let exact = vecs.dot(&expd).dot(&vecs.t()).dot(&x0);
        let out = expo_apply(dense_apply(&h), &mut v, t, e0, 1e-12, 40).unwrap();
        for (a, b) in v.data().iter().zip(exact.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
        assert_abs_diff_eq!(out.norm, exact.dot(&exact).sqrt(), epsilon = 1e-9);
        let energy = exact.dot(&h.dot(&exact)) / exact.dot(&exact) + e0;
        assert_abs_diff_eq!(out.energy, energy, epsilon = 1e-9);
    }

    #[test]
    fn rk4_stages_track_the_exponential() {
        let dim = 6;
        let h = symmetric(dim, 4);
        let (vals, vecs) = h.eigh(UPLO::Lower).unwrap();
        let t = -0.002;
        let mut v = vector(dim);
        v.data_mut().iter_mut().enumerate().for_each(|(i, x)| { *x = (i as f64).cos(); });
        let x0 = nd::Array1::from(v.data().to_vec());
        let out = rk4_stages(dense_apply(&h), &v, t, 0.0).unwrap();
        assert_eq!(out.stages.len(), 3);
        for (j, stage) in out.stages.iter().enumerate() {
            let tau = (j + 1) as f64 / 3.0;
            let expd = nd::Array2::from_diag(&vals.mapv(|e| (tau * t * e).exp()));
            let exact = vecs.dot(&expd).dot(&vecs.t()).dot(&x0);
            for (a, b) in stage.data().iter().zip(exact.iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-7);
            }
        }
        // input untouched
        assert_eq!(v.data(), x0.as_slice().unwrap());
    }
}
