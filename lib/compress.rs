//! Variational fit of `|bra⟩ ∝ O |ket⟩` under a bond-dimension budget.
//!
//! Each step applies the effective operator of the window to the ket window
//! and replaces the bra window by the normalized result. Both states move
//! their centers along; noise, when asked for, only enters the bra.

use std::time::Instant;
use rand::{ SeedableRng, rngs::StdRng };
use serde::{ Deserialize, Serialize };
use tracing::{ debug, info };
use crate::{
    decompose::Truncation,
    effective::EffectiveHamiltonian,
    environment::{ EnvError, FuseType, MovingEnvironment, NoiseKind },
    functions::TensorFunctions,
    mpo::Mpo,
    mps::Mps,
    quantum::QLabel,
    store::TensorStore,
    sweep::{ self, Interrupt, Schedule, SweepError, SweepResult },
};

/// Run configuration of [`Compress`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompressOptions {
    pub bra_bond_dims: Schedule<usize>,
    pub ket_bond_dims: Schedule<usize>,
    pub noises: Schedule<f64>,
    pub noise_kind: NoiseKind,
    pub cutoff: f64,
    pub seed: u64,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            bra_bond_dims: Schedule::constant(64),
            ket_bond_dims: Schedule::constant(64),
            noises: Schedule::constant(0.0),
            noise_kind: NoiseKind::DensityMatrix,
            cutoff: 0.0,
            seed: 0,
        }
    }
}

impl CompressOptions {
    pub fn with_bra_bond_dims(mut self, bond_dims: Vec<usize>) -> Self {
        self.bra_bond_dims = Schedule::new(bond_dims);
        self
    }

    pub fn with_ket_bond_dims(mut self, bond_dims: Vec<usize>) -> Self {
        self.ket_bond_dims = Schedule::new(bond_dims);
        self
    }

    pub fn with_noises(mut self, noises: Vec<f64>) -> Self {
        self.noises = Schedule::new(noises);
        self
    }

    pub fn with_noise_kind(mut self, kind: NoiseKind) -> Self {
        self.noise_kind = kind;
        self
    }

    pub fn with_cutoff(mut self, cutoff: f64) -> Self {
        self.cutoff = cutoff;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Outcome of one blocking step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompressIteration {
    pub site: usize,
    /// Norm of `O |ket⟩` restricted to the window.
    pub norm: f64,
    /// Discarded weight of the bra truncation.
    pub error: f64,
    pub nflop: usize,
    /// Multiplication wall time in seconds.
    pub tmult: f64,
}

/// Compression driver.
pub struct Compress<'a, Q, T>
where
    Q: QLabel,
    T: TensorFunctions<Q>,
{
    env: MovingEnvironment<'a, Q, T>,
    pub options: CompressOptions,
    interrupt: Option<Interrupt>,
    rng: StdRng,
    /// Last norm of every completed sweep.
    pub norms: Vec<f64>,
    /// Largest discarded weight of every completed sweep.
    pub discarded_weights: Vec<f64>,
}

impl<'a, Q, T> Compress<'a, Q, T>
where
    Q: QLabel,
    T: TensorFunctions<Q>,
{
    pub fn new(mpo: &'a Mpo<Q>, tf: &'a T, options: CompressOptions) -> Self {
        let rng = StdRng::seed_from_u64(options.seed);
        Self {
            env: MovingEnvironment::new(mpo, tf),
            options,
            interrupt: None,
            rng,
            norms: Vec::new(),
            discarded_weights: Vec::new(),
        }
    }

    pub fn with_store(mut self, store: TensorStore) -> Self {
        self.env = self.env.with_store(store);
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// Fit the bra window `(i, i + 1)` and move both centers past it.
    #[allow(clippy::too_many_arguments)]
    pub fn update_two_dot(
        &mut self,
        i: usize,
        bra: &mut Mps<Q>,
        ket: &mut Mps<Q>,
        forward: bool,
        bra_bond_dim: usize,
        ket_bond_dim: usize,
        noise: f64,
    ) -> SweepResult<CompressIteration>
    {
        Interrupt::check(self.interrupt.as_ref(), i)?;
        if bra.n_roots() != 1 || ket.n_roots() != 1 {
            return Err(SweepError::Unsupported("compression of a multi-target state".into()));
        }
        let _step = self.env.step();
        self.env.move_to(i)?;
        let Some(mut bra_psi) = self.env.contract_two_dot(i, bra, forward)?.pop() else {
            return Err(EnvError::NoWavefunction.into());
        };
        let Some(ket_psi) = self.env.contract_two_dot(i, ket, forward)?.pop() else {
            return Err(EnvError::NoWavefunction.into());
        };
        let h = EffectiveHamiltonian::new(
            self.env.eff_ham(FuseType::FuseLR, i, bra, ket)?, self.env.tf());
        let (norm, stats) = h.multiply(&ket_psi, &mut bra_psi)?;

        let cutoff = self.options.cutoff;
        let bra_dm = self.env.density_matrix(
            &bra_psi, forward, noise, self.options.noise_kind, &mut self.rng)?;
        let (bra_split, mut bra_centers) = self.env.split_density_matrix(
            &bra_dm, std::slice::from_ref(&bra_psi),
            &Truncation::new(bra_bond_dim).with_cutoff(cutoff), forward)?;
        bra_centers.iter_mut().for_each(|c| { c.normalize(); });
        let error = bra_split.selection.error();

        let ket_dm = self.env.density_matrix(
            &ket_psi, forward, 0.0, NoiseKind::None, &mut self.rng)?;
        let (ket_split, ket_centers) = self.env.split_density_matrix(
            &ket_dm, std::slice::from_ref(&ket_psi),
            &Truncation::new(ket_bond_dim).with_cutoff(cutoff), forward)?;

        self.env.propagate_wfn(i, bra, forward, bra_split, bra_centers)?;
        self.env.propagate_wfn(i, ket, forward, ket_split, ket_centers)?;
        debug!(
            site = i, forward, norm, error,
            nflop = stats.flops, tmult = stats.elapsed,
            "compress step",
        );
        Ok(CompressIteration {
            site: i,
            norm,
            error,
            nflop: stats.flops,
            tmult: stats.elapsed,
        })
    }

    /// One sweep in the given direction, returning the last step.
    pub fn sweep(
        &mut self,
        bra: &mut Mps<Q>,
        ket: &mut Mps<Q>,
        forward: bool,
        bra_bond_dim: usize,
        ket_bond_dim: usize,
        noise: f64,
    ) -> SweepResult<CompressIteration>
    {
        let windows = sweep::sweep_range(bra, forward)?;
        let (bc, kc) = (bra.center()?, ket.center()?);
        if bc != kc { return Err(SweepError::CenterMismatch { bra: bc, ket: kc }); }
        let mut last: Option<CompressIteration> = None;
        let mut max_error: f64 = 0.0;
        for i in windows.into_iter() {
            let it = self.update_two_dot(
                i, bra, ket, forward, bra_bond_dim, ket_bond_dim, noise)?;
            max_error = max_error.max(it.error);
            last = Some(it);
        }
        self.discarded_weights.push(max_error);
        last.ok_or(SweepError::NoWindow { center: bra.center()?, forward })
    }

    /// Alternate sweeps until the norm changes by less than `tol` between two
    /// sweeps at the final noise and bra bond dimension, or `n_sweeps` have
    /// run. Returns the last norm.
    ///
    /// The norm of a sweep is the windowed norm of `O |ket⟩` on its last
    /// window, taken before the bra center is renormalized; the fitted bra
    /// itself always leaves with unit norm.
    pub fn solve(
        &mut self,
        bra: &mut Mps<Q>,
        ket: &mut Mps<Q>,
        n_sweeps: usize,
        forward: bool,
        tol: f64,
    ) -> SweepResult<f64>
    {
        sweep::check_dot(bra)?;
        sweep::check_dot(ket)?;
        if self.options.noise_kind == NoiseKind::Perturbative {
            return Err(SweepError::Unsupported("perturbative noise in compression".into()));
        }
        self.env.prepare(bra, ket)?;
        let mut forward = forward;
        let mut last: Option<f64> = None;
        for iw in 0..n_sweeps {
            let t0 = Instant::now();
            let bra_bond_dim = self.options.bra_bond_dims.get(iw);
            let ket_bond_dim = self.options.ket_bond_dims.get(iw);
            let noise = self.options.noises.get(iw);
            let it = self.sweep(bra, ket, forward, bra_bond_dim, ket_bond_dim, noise)?;
            let (active_peak, scratch_peak) = self.env.arena_peaks();
            info!(
                sweep = iw, forward, bra_bond_dim, ket_bond_dim, noise,
                norm = it.norm,
                max_error = self.discarded_weights.last().copied().unwrap_or(0.0),
                active_peak, scratch_peak,
                elapsed = t0.elapsed().as_secs_f64(),
                "compress sweep",
            );
            self.norms.push(it.norm);
            let converged
                = last.map(|n| (n - it.norm).abs() < tol).unwrap_or(false)
                && self.options.noises.is_final(iw)
                && self.options.bra_bond_dims.is_final(iw);
            last = Some(it.norm);
            forward = !forward;
            if converged {
                info!(sweep = iw, norm = it.norm, "compress converged");
                break;
            }
        }
        last.ok_or(SweepError::NoSweeps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crate::{
        functions::SeqTensorFunctions,
        model::{ self, Xxz },
        mps::MpsInfo,
        quantum::U1,
    };

    fn state(n: usize, center: usize, m: usize, seed: u64) -> Mps<U1> {
        let mut rng = StdRng::seed_from_u64(seed);
        let info = MpsInfo::new(vec![model::spin_basis(); n], U1(0), Some(m)).unwrap();
        Mps::random(info, center, 1, &mut rng).unwrap()
    }

    #[test]
    fn identity_fit_reproduces_the_ket() {
        let n = 6;
        let mpo = Mpo::identity(vec![model::spin_basis(); n]);
        let tf = SeqTensorFunctions::default();
        let mut ket = state(n, 0, 4, 1);
        let mut bra = state(n, 0, 8, 2);
        let reference = ket.to_dense().unwrap();
        let mut comp = Compress::new(&mpo, &tf, CompressOptions::default()
            .with_bra_bond_dims(vec![8]));
        let norm = comp.solve(&mut bra, &mut ket, 6, true, 1e-10).unwrap();
        assert_abs_diff_eq!(norm, 1.0, epsilon = 1e-8);
        let fitted = bra.to_dense().unwrap();
        assert_abs_diff_eq!(fitted.dot(&reference).abs(), 1.0, epsilon = 1e-8);
    }

    #[test]
    fn applying_the_chain_operator_gives_its_norm() {
        let n = 4;
        let params = Xxz::new(1.0, 0.7, 0.0);
        let mpo = Mpo::xxz(n, params);
        let tf = SeqTensorFunctions::default();
        let mut ket = state(n, 0, 4, 3);
        let mut bra = state(n, 0, 8, 4);
        let v = ket.to_dense().unwrap();
        let hv = params.dense_hamiltonian(n).dot(&v);
        let mut comp = Compress::new(&mpo, &tf, CompressOptions::default()
            .with_noise_kind(NoiseKind::None));
        let norm = comp.solve(&mut bra, &mut ket, 6, true, 1e-12).unwrap();
        assert_abs_diff_eq!(norm, hv.dot(&hv).sqrt(), epsilon = 1e-8);
        let fitted = bra.to_dense().unwrap();
        assert_abs_diff_eq!(fitted.dot(&hv).abs(), norm, epsilon = 1e-8);
        assert_eq!(comp.norms.last().copied(), Some(norm));
        assert_abs_diff_eq!(bra.norm().unwrap(), 1.0, epsilon = 1e-10);
    }

    #[test]
    fn zero_sweeps_is_a_bad_argument() {
        let n = 4;
        let mpo = Mpo::identity(vec![model::spin_basis(); n]);
        let tf = SeqTensorFunctions::default();
        let mut ket = state(n, 0, 4, 7);
        let mut bra = state(n, 0, 4, 8);
        let mut comp = Compress::new(&mpo, &tf, CompressOptions::default());
        let err = comp.solve(&mut bra, &mut ket, 0, true, 0.0).unwrap_err();
        assert!(matches!(err, SweepError::NoSweeps));
    }

    #[test]
    fn misaligned_centers_are_rejected() {
        let n = 4;
        let mpo = Mpo::identity(vec![model::spin_basis(); n]);
        let tf = SeqTensorFunctions::default();
        let mut ket = state(n, 0, 4, 5);
        let mut bra = state(n, 1, 4, 6);
        let mut comp = Compress::new(&mpo, &tf, CompressOptions::default());
        let err = comp.solve(&mut bra, &mut ket, 2, true, 0.0).unwrap_err();
        assert!(matches!(err, SweepError::CenterMismatch { bra: 1, ket: 0 }));
    }
}
