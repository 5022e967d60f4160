//! Ground-state search by two-site DMRG.
//!
//! Each blocking step solves the effective eigenproblem of the window with
//! Davidson, builds a (possibly noisy) reduced density matrix, truncates it
//! to the scheduled bond dimension and moves the center one site on. Several
//! roots can be targeted at once; they then share one state-averaged basis.

use std::time::Instant;
use rand::{ SeedableRng, rngs::StdRng };
use serde::{ Deserialize, Serialize };
use tracing::{ debug, info };
use crate::{
    block::BlockMatrix,
    decompose::Truncation,
    effective::EffectiveHamiltonian,
    environment::{ FuseType, MovingEnvironment, NoiseKind },
    functions::TensorFunctions,
    mpo::Mpo,
    mps::Mps,
    quantum::QLabel,
    store::TensorStore,
    sweep::{
        self,
        DecompositionKind,
        Interrupt,
        Schedule,
        SweepError,
        SweepResult,
        TruncPattern,
    },
};

/// Run configuration of [`Dmrg`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DmrgOptions {
    pub bond_dims: Schedule<usize>,
    pub noises: Schedule<f64>,
    /// Squared-residual thresholds of the eigensolver; derived from the
    /// noise and the energy tolerance when absent.
    pub davidson_thresholds: Option<Schedule<f64>>,
    pub davidson_max_iter: usize,
    pub noise_kind: NoiseKind,
    pub decomposition: DecompositionKind,
    pub trunc_pattern: TruncPattern,
    pub cutoff: f64,
    /// Seed of the noise generator.
    pub seed: u64,
}

impl Default for DmrgOptions {
    fn default() -> Self {
        Self {
            bond_dims: Schedule::constant(64),
            noises: Schedule::constant(0.0),
            davidson_thresholds: None,
            davidson_max_iter: 5000,
            noise_kind: NoiseKind::DensityMatrix,
            decomposition: DecompositionKind::DensityMatrix,
            trunc_pattern: TruncPattern::None,
            cutoff: 1e-14,
            seed: 0,
        }
    }
}

impl DmrgOptions {
    pub fn with_bond_dims(mut self, bond_dims: Vec<usize>) -> Self {
        self.bond_dims = Schedule::new(bond_dims);
        self
    }

    pub fn with_noises(mut self, noises: Vec<f64>) -> Self {
        self.noises = Schedule::new(noises);
        self
    }

    pub fn with_davidson_thresholds(mut self, thresholds: Vec<f64>) -> Self {
        self.davidson_thresholds = Some(Schedule::new(thresholds));
        self
    }

    pub fn with_davidson_max_iter(mut self, max_iter: usize) -> Self {
        self.davidson_max_iter = max_iter;
        self
    }

    pub fn with_noise_kind(mut self, kind: NoiseKind) -> Self {
        self.noise_kind = kind;
        self
    }

    pub fn with_decomposition(mut self, kind: DecompositionKind) -> Self {
        self.decomposition = kind;
        self
    }

    pub fn with_trunc_pattern(mut self, pattern: TruncPattern) -> Self {
        self.trunc_pattern = pattern;
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

    /// Eigensolver threshold for sweep `iw`.
    pub fn davidson_threshold(&self, iw: usize, tol: f64) -> f64 {
        if let Some(ths) = &self.davidson_thresholds { return ths.get(iw); }
        let noise = self.noises.get(iw);
        let base = if noise != 0.0 { noise } else if tol != 0.0 { tol } else { 1e-9 };
        base * 0.1
    }
}

/// Outcome of one blocking step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DmrgIteration {
    pub site: usize,
    /// Energies of every root, `const_e` included.
    pub energies: Vec<f64>,
    /// Discarded weight of the truncation.
    pub error: f64,
    /// Eigensolver operator applications.
    pub ndav: usize,
    pub nflop: usize,
    /// Eigensolver wall time in seconds.
    pub tdav: f64,
}

/// Two-site DMRG driver.
pub struct Dmrg<'a, Q, T>
where
    Q: QLabel,
    T: TensorFunctions<Q>,
{
    env: MovingEnvironment<'a, Q, T>,
    pub options: DmrgOptions,
    interrupt: Option<Interrupt>,
    rng: StdRng,
    /// Lowest energies found by every completed sweep.
    pub energies: Vec<Vec<f64>>,
    /// Largest discarded weight of every completed sweep.
    pub discarded_weights: Vec<f64>,
}

impl<'a, Q, T> Dmrg<'a, Q, T>
where
    Q: QLabel,
    T: TensorFunctions<Q>,
{
    pub fn new(mpo: &'a Mpo<Q>, tf: &'a T, options: DmrgOptions) -> Self {
        let rng = StdRng::seed_from_u64(options.seed);
        Self {
            env: MovingEnvironment::new(mpo, tf),
            options,
            interrupt: None,
            rng,
            energies: Vec::new(),
            discarded_weights: Vec::new(),
        }
    }

    /// Keep environment blocks away from the window in `store`.
    pub fn with_store(mut self, store: TensorStore) -> Self {
        self.env = self.env.with_store(store);
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// Optimize the window `(i, i + 1)` and move the center past it.
    pub fn update_two_dot(
        &mut self,
        i: usize,
        mps: &mut Mps<Q>,
        forward: bool,
        bond_dim: usize,
        noise: f64,
        davidson_conv: f64,
    ) -> SweepResult<DmrgIteration>
    {
        Interrupt::check(self.interrupt.as_ref(), i)?;
        let opts = &self.options;
        let multi = mps.n_roots() > 1;
        if multi && opts.decomposition != DecompositionKind::DensityMatrix {
            return Err(SweepError::Unsupported(
                "state-averaged optimization needs density-matrix splitting".into()));
        }
        if multi && opts.noise_kind == NoiseKind::Perturbative {
            return Err(SweepError::Unsupported(
                "perturbative noise with several roots".into()));
        }
        if opts.decomposition == DecompositionKind::Svd
            && !matches!(opts.noise_kind, NoiseKind::None | NoiseKind::Wavefunction)
            && noise != 0.0
        {
            return Err(SweepError::Unsupported(
                format!("{:?} noise with SVD splitting", opts.noise_kind)));
        }
        let _step = self.env.step();
        self.env.move_to(i)?;
        let mut psis = self.env.contract_two_dot(i, mps, forward)?;
        let h = EffectiveHamiltonian::new(
            self.env.eff_ham(FuseType::FuseLR, i, mps, mps)?, self.env.tf());
        let (mut energies, stats)
            = h.eigs(&mut psis, davidson_conv, opts.davidson_max_iter)?;
        let const_e = self.env.mpo().const_e;
        energies.iter_mut().for_each(|e| { *e += const_e; });

        let trunc = opts.trunc_pattern.truncation(
            i, Truncation::new(bond_dim).with_cutoff(opts.cutoff));
        let (split, mut centers) = match opts.decomposition {
            DecompositionKind::Svd => {
                let mut psi = psis.remove(0);
                if noise != 0.0 && opts.noise_kind == NoiseKind::Wavefunction {
                    psi.add_random(noise, &mut self.rng);
                    psi.normalize();
                }
                self.env.split_wavefunction_svd(&psi, &trunc, forward)?
            },
            DecompositionKind::DensityMatrix => {
                let dm = if multi {
                    self.env.density_matrix_with_weights(
                        &psis, &mps.weights, forward, noise, opts.noise_kind, &mut self.rng)?
                } else if opts.noise_kind == NoiseKind::Perturbative {
                    let mut dm = self.env.density_matrix(
                        &psis[0], forward, 0.0, NoiseKind::None, &mut self.rng)?;
                    if noise != 0.0 {
                        let group = h.perturbative_noise(&psis[0], forward)?;
                        self.env.density_matrix_add_perturbation(&mut dm, &group, forward, noise);
                    }
                    dm
                } else {
                    self.env.density_matrix(
                        &psis[0], forward, noise, opts.noise_kind, &mut self.rng)?
                };
                self.env.split_density_matrix(&dm, &psis, &trunc, forward)?
            },
        };
        centers.iter_mut().for_each(|c: &mut BlockMatrix<Q>| { c.normalize(); });
        let error = split.selection.error();
        let kept = split.basis.total_dim();
        self.env.propagate_wfn(i, mps, forward, split, centers)?;
        debug!(
            site = i, forward, bond_dim = kept,
            energy = energies[0], error,
            ndav = stats.iterations, nflop = stats.flops, tdav = stats.elapsed,
            "dmrg step",
        );
        Ok(DmrgIteration {
            site: i,
            energies,
            error,
            ndav: stats.iterations,
            nflop: stats.flops,
            tdav: stats.elapsed,
        })
    }

    /// One sweep in the given direction, returning the step with the lowest
    /// energy.
    pub fn sweep(
        &mut self,
        mps: &mut Mps<Q>,
        forward: bool,
        bond_dim: usize,
        noise: f64,
        davidson_conv: f64,
    ) -> SweepResult<DmrgIteration>
    {
        let windows = sweep::sweep_range(mps, forward)?;
        let mut best: Option<DmrgIteration> = None;
        let mut max_error: f64 = 0.0;
        for i in windows.into_iter() {
            let it = self.update_two_dot(i, mps, forward, bond_dim, noise, davidson_conv)?;
            max_error = max_error.max(it.error);
            let better = best.as_ref()
                .map(|b| it.energies[0] < b.energies[0])
                .unwrap_or(true);
            if better { best = Some(it); }
        }
        self.discarded_weights.push(max_error);
        best.ok_or(SweepError::NoWindow { center: mps.center()?, forward })
    }

    /// Alternate sweeps until the lowest energy changes by less than `tol`
    /// between two sweeps at the final bond dimension and noise, or
    /// `n_sweeps` have run. Returns the last lowest energy.
    ///
    /// A zero `tol` never stops early.
    pub fn solve(&mut self, mps: &mut Mps<Q>, n_sweeps: usize, forward: bool, tol: f64)
        -> SweepResult<f64>
    {
        sweep::check_dot(mps)?;
        self.env.prepare(mps, mps)?;
        let mut forward = forward;
        let mut last: Option<f64> = None;
        for iw in 0..n_sweeps {
            let t0 = Instant::now();
            let bond_dim = self.options.bond_dims.get(iw);
            let noise = self.options.noises.get(iw);
            let conv = self.options.davidson_threshold(iw, tol);
            let best = self.sweep(mps, forward, bond_dim, noise, conv)?;
            let energy = best.energies[0];
            let max_error = self.discarded_weights.last().copied().unwrap_or(0.0);
            let (active_peak, scratch_peak) = self.env.arena_peaks();
            info!(
                sweep = iw, forward, bond_dim, noise, threshold = conv,
                energy, max_error, active_peak, scratch_peak,
                elapsed = t0.elapsed().as_secs_f64(),
                "dmrg sweep",
            );
            self.energies.push(best.energies);
            let converged
                = tol > 0.0
                && last.map(|e| (e - energy).abs() < tol).unwrap_or(false)
                && self.options.noises.is_final(iw)
                && self.options.bond_dims.is_final(iw);
            last = Some(energy);
            forward = !forward;
            if converged {
                info!(sweep = iw, energy, "dmrg converged");
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
    use ndarray_linalg::{ Eigh, UPLO };
    use crate::{
        arena::Frame,
        functions::SeqTensorFunctions,
        model::{ self, Xxz },
        mps::MpsInfo,
        quantum::U1,
    };

    fn state(n: usize, m: usize, n_roots: usize, seed: u64) -> Mps<U1> {
        let mut rng = StdRng::seed_from_u64(seed);
        let info = MpsInfo::new(vec![model::spin_basis(); n], U1(0), Some(m)).unwrap();
        Mps::random(info, 0, n_roots, &mut rng).unwrap()
    }

    fn exact_levels(params: Xxz, n: usize) -> Vec<f64> {
        let ham = params.dense_hamiltonian(n);
        let idx: Vec<usize>
            = (0..1_usize << n)
            .filter(|i| i.count_ones() as usize * 2 == n)
            .collect();
        let sub = ndarray::Array2::from_shape_fn(
            (idx.len(), idx.len()), |(a, b)| ham[[idx[a], idx[b]]]);
        let (vals, _) = sub.eigh(UPLO::Lower).unwrap();
        vals.to_vec()
    }

    #[test]
    fn ground_energy_of_a_short_chain() {
        let n = 6;
        let params = Xxz::new(1.0, 1.0, 0.0);
        let mpo = Mpo::xxz(n, params);
        let tf = SeqTensorFunctions::default();
        let mut mps = state(n, 8, 1, 1);
        let opts = DmrgOptions::default()
            .with_bond_dims(vec![8, 16])
            .with_noises(vec![1e-4, 0.0]);
        let mut dmrg = Dmrg::new(&mpo, &tf, opts);
        let energy = dmrg.solve(&mut mps, 10, true, 1e-10).unwrap();
        assert_abs_diff_eq!(energy, exact_levels(params, n)[0], epsilon = 1e-8);
        assert!(mps.check_canonical_form().is_ok());
    }

    #[test]
    fn arena_accounts_for_whole_steps() {
        let n = 6;
        let mpo = Mpo::xxz(n, Xxz::default());
        let tf = SeqTensorFunctions::default();
        let mut mps = state(n, 8, 1, 4);
        let mut dmrg = Dmrg::new(&mpo, &tf, DmrgOptions::default().with_bond_dims(vec![8]));
        dmrg.env.prepare(&mps, &mps).unwrap();
        {
            let _step = dmrg.env.step();
            let psis = dmrg.env.contract_two_dot(0, &mps, true).unwrap();
            dmrg.env.eff_ham(FuseType::FuseLR, 0, &mps, &mps).unwrap();
            assert!(dmrg.env.arena().used(Frame::Active) > psis[0].len());
            assert_eq!(dmrg.env.arena().depth(Frame::Active), 2);
        }
        assert_eq!(dmrg.env.arena().used(Frame::Active), 0);

        dmrg.solve(&mut mps, 2, true, 0.0).unwrap();
        let arena = dmrg.env.arena();
        for frame in [Frame::Active, Frame::Scratch] {
            assert!(arena.peak(frame) > 0);
            assert_eq!(arena.used(frame), 0);
            assert_eq!(arena.depth(frame), 0);
        }
    }

    #[test]
    fn zero_sweeps_is_a_bad_argument() {
        let mpo = Mpo::xxz(4, Xxz::default());
        let tf = SeqTensorFunctions::default();
        let mut mps = state(4, 4, 1, 5);
        let mut dmrg = Dmrg::new(&mpo, &tf, DmrgOptions::default());
        let err = dmrg.solve(&mut mps, 0, true, 0.0).unwrap_err();
        assert!(matches!(err, SweepError::NoSweeps));
        assert!(!err.is_unsupported());
    }

    #[test]
    fn state_averaged_roots() {
        let n = 4;
        let params = Xxz::new(1.0, 0.5, 0.0);
        let mpo = Mpo::xxz(n, params);
        let tf = SeqTensorFunctions::default();
        let mut mps = state(n, 8, 2, 2);
        let opts = DmrgOptions::default()
            .with_bond_dims(vec![8])
            .with_noise_kind(NoiseKind::None);
        let mut dmrg = Dmrg::new(&mpo, &tf, opts);
        dmrg.solve(&mut mps, 6, true, 1e-10).unwrap();
        let exact = exact_levels(params, n);
        let last = dmrg.energies.last().unwrap();
        assert_abs_diff_eq!(last[0], exact[0], epsilon = 1e-8);
        assert_abs_diff_eq!(last[1], exact[1], epsilon = 1e-8);
        assert_eq!(mps.canonical_form().matches('M').count(), 1);
    }

    #[test]
    fn svd_with_density_matrix_noise_is_unsupported() {
        let n = 4;
        let mpo = Mpo::xxz(n, Xxz::default());
        let tf = SeqTensorFunctions::default();
        let mut mps = state(n, 4, 1, 3);
        let opts = DmrgOptions::default()
            .with_decomposition(DecompositionKind::Svd)
            .with_noise_kind(NoiseKind::DensityMatrix)
            .with_noises(vec![1e-3]);
        let err = Dmrg::new(&mpo, &tf, opts).solve(&mut mps, 2, true, 0.0).unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn constant_shift_moves_every_energy() {
        let n = 4;
        let params = Xxz::default();
        let mpo = Mpo::xxz(n, params).with_const_e(2.5);
        let tf = SeqTensorFunctions::default();
        let mut mps = state(n, 8, 1, 4);
        let opts = DmrgOptions::default()
            .with_bond_dims(vec![8])
            .with_decomposition(DecompositionKind::Svd)
            .with_noise_kind(NoiseKind::None);
        let energy = Dmrg::new(&mpo, &tf, opts).solve(&mut mps, 4, true, 0.0).unwrap();
        assert_abs_diff_eq!(energy, exact_levels(params, n)[0] + 2.5, epsilon = 1e-8);
    }
}
