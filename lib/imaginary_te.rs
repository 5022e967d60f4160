//! Imaginary-time evolution `exp(-β H) |ψ⟩` by two-site sweeps.
//!
//! Two integrators are available. The tangent-space one evolves each window
//! with a Krylov exponential and evolves the site left behind back by the
//! same step, so that a full sweep advances the state by `β` once. The RK4
//! one builds the density matrix from the current window and the three
//! Runge-Kutta stages, which adapts the kept basis to the whole step before
//! the state is actually moved.

use std::time::Instant;
use rand::{ SeedableRng, rngs::StdRng };
use serde::{ Deserialize, Serialize };
use tracing::{ debug, info };
use crate::{
    block::BlockMatrix,
    decompose::Truncation,
    effective::{ EffStats, EffectiveHamiltonian },
    environment::{ EnvError, FuseType, MovingEnvironment, NoiseKind },
    functions::TensorFunctions,
    mpo::Mpo,
    mps::Mps,
    quantum::QLabel,
    store::TensorStore,
    sweep::{ self, Interrupt, Schedule, SweepError, SweepResult, TruncPattern },
};

/// Time integrator of [`ImaginaryTe`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TeMode {
    /// Krylov exponential with back-propagation of the neighbouring site.
    #[default]
    TangentSpace,
    /// Fourth-order Runge-Kutta, with a Krylov step on the last window.
    Rk4,
}

/// Run configuration of [`ImaginaryTe`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImaginaryTeOptions {
    pub bond_dims: Schedule<usize>,
    pub noises: Schedule<f64>,
    pub noise_kind: NoiseKind,
    pub mode: TeMode,
    /// Sweeps per time step; only the last one moves the state.
    pub n_sub_sweeps: usize,
    /// Density-matrix weights of the current window and the three RK4
    /// stages.
    pub weights: [f64; 4],
    pub trunc_pattern: TruncPattern,
    pub cutoff: f64,
    pub seed: u64,
}

impl Default for ImaginaryTeOptions {
    fn default() -> Self {
        Self {
            bond_dims: Schedule::constant(64),
            noises: Schedule::constant(0.0),
            noise_kind: NoiseKind::DensityMatrix,
            mode: TeMode::TangentSpace,
            n_sub_sweeps: 1,
            weights: [1.0 / 3.0, 1.0 / 6.0, 1.0 / 6.0, 1.0 / 3.0],
            trunc_pattern: TruncPattern::None,
            cutoff: 1e-14,
            seed: 0,
        }
    }
}

impl ImaginaryTeOptions {
    pub fn with_bond_dims(mut self, bond_dims: Vec<usize>) -> Self {
        self.bond_dims = Schedule::new(bond_dims);
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

    pub fn with_mode(mut self, mode: TeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_sub_sweeps(mut self, n: usize) -> Self {
        self.n_sub_sweeps = n.max(1);
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
}

/// Outcome of one blocking step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TeIteration {
    pub site: usize,
    /// Energy of the evolved window, `const_e` included.
    pub energy: f64,
    /// Squared norm of the evolved window before normalization.
    pub normsq: f64,
    pub error: f64,
    /// Operator applications of all integrator calls.
    pub nexpo: usize,
    /// Number of integrator calls.
    pub nexpok: usize,
    pub nflop: usize,
    /// Integrator wall time in seconds.
    pub texpo: f64,
}

impl TeIteration {
    fn add_stats(&mut self, stats: EffStats) {
        self.nexpo += stats.iterations;
        self.nexpok += 1;
        self.nflop += stats.flops;
        self.texpo += stats.elapsed;
    }
}

/// Imaginary-time evolution driver.
pub struct ImaginaryTe<'a, Q, T>
where
    Q: QLabel,
    T: TensorFunctions<Q>,
{
    env: MovingEnvironment<'a, Q, T>,
    pub options: ImaginaryTeOptions,
    interrupt: Option<Interrupt>,
    rng: StdRng,
    /// Energy after every completed time step.
    pub energies: Vec<f64>,
    /// Squared norm of the last window of every completed time step.
    pub normsqs: Vec<f64>,
    /// Largest discarded weight of every sweep.
    pub discarded_weights: Vec<f64>,
}

impl<'a, Q, T> ImaginaryTe<'a, Q, T>
where
    Q: QLabel,
    T: TensorFunctions<Q>,
{
    pub fn new(mpo: &'a Mpo<Q>, tf: &'a T, options: ImaginaryTeOptions) -> Self {
        let rng = StdRng::seed_from_u64(options.seed);
        Self {
            env: MovingEnvironment::new(mpo, tf),
            options,
            interrupt: None,
            rng,
            energies: Vec::new(),
            normsqs: Vec::new(),
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

    /// Evolve the window `(i, i + 1)` by `beta` (or only adapt its basis
    /// when `!advance`) and move the center past it.
    #[allow(clippy::too_many_arguments)]
    pub fn update_two_dot(
        &mut self,
        i: usize,
        mps: &mut Mps<Q>,
        forward: bool,
        advance: bool,
        beta: f64,
        bond_dim: usize,
        noise: f64,
    ) -> SweepResult<TeIteration>
    {
        Interrupt::check(self.interrupt.as_ref(), i)?;
        if mps.n_roots() != 1 {
            return Err(SweepError::Unsupported(
                "time evolution of a multi-target state".into()));
        }
        if self.options.noise_kind == NoiseKind::Perturbative {
            return Err(SweepError::Unsupported("perturbative noise in time evolution".into()));
        }
        let n = mps.n_sites();
        let boundary = (forward && i + 2 == n) || (!forward && i == 0);
        let const_e = self.env.mpo().const_e;
        let kind = self.options.noise_kind;
        let trunc = self.options.trunc_pattern.truncation(
            i, Truncation::new(bond_dim).with_cutoff(self.options.cutoff));

        let _step = self.env.step();
        self.env.move_to(i)?;
        let Some(mut psi) = self.env.contract_two_dot(i, mps, forward)?.pop() else {
            return Err(EnvError::NoWavefunction.into());
        };
        let h = EffectiveHamiltonian::new(
            self.env.eff_ham(FuseType::FuseLR, i, mps, mps)?, self.env.tf());
        let mut it = TeIteration {
            site: i,
            energy: 0.0,
            normsq: 0.0,
            error: 0.0,
            nexpo: 0,
            nexpok: 0,
            nflop: 0,
            texpo: 0.0,
        };

        if self.options.mode == TeMode::Rk4 && !(boundary && advance) {
            let (stages, energy, norm, stats) = h.rk4_apply(&psi, -beta, const_e)?;
            it.add_stats(stats);
            it.energy = energy;
            it.normsq = norm * norm;
            let mut all: Vec<BlockMatrix<Q>> = Vec::with_capacity(4);
            all.push(psi);
            all.extend(stages);
            let dm = self.env.density_matrix_with_weights(
                &all, &self.options.weights, forward, noise, kind, &mut self.rng)?;
            let kept = all.swap_remove(0);
            let (split, mut centers)
                = self.env.split_density_matrix(&dm, std::slice::from_ref(&kept), &trunc, forward)?;
            centers.iter_mut().for_each(|c| { c.normalize(); });
            it.error = split.selection.error();
            self.env.propagate_wfn(i, mps, forward, split, centers)?;
        } else {
            let t = if advance { -beta } else { 0.0 };
            let (energy, norm, stats) = h.expo_apply(&mut psi, t, const_e)?;
            it.add_stats(stats);
            it.energy = energy;
            it.normsq = norm * norm;
            if !(boundary && advance) { psi.normalize(); }
            let dm = self.env.density_matrix(&psi, forward, noise, kind, &mut self.rng)?;
            let (split, centers)
                = self.env.split_density_matrix(&dm, std::slice::from_ref(&psi), &trunc, forward)?;
            it.error = split.selection.error();
            self.env.commit_split(i, mps, forward, split, centers)?;
            if advance && !boundary {
                let stats = self.back_propagate(i, mps, forward, beta, const_e)?;
                it.add_stats(stats);
            }
            mps.propagate_wfn(i, forward)?;
        }
        debug!(
            site = i, forward, advance,
            energy = it.energy, normsq = it.normsq, error = it.error,
            nexpo = it.nexpo, nflop = it.nflop, texpo = it.texpo,
            "imaginary-time step",
        );
        Ok(it)
    }

    // undo the step on the single site now holding the center
    fn back_propagate(
        &mut self,
        i: usize,
        mps: &mut Mps<Q>,
        forward: bool,
        beta: f64,
        const_e: f64,
    ) -> SweepResult<EffStats>
    {
        let (fuse, site) = if forward { (FuseType::FuseR, i + 1) } else { (FuseType::FuseL, i) };
        let h = EffectiveHamiltonian::new(
            self.env.eff_ham(fuse, site, mps, mps)?, self.env.tf());
        let mut center: BlockMatrix<Q> = mps.site(site)?.tensors()[0].mat.clone();
        let (_, _, stats) = h.expo_apply(&mut center, beta, const_e)?;
        center.normalize();
        mps.set_center(vec![center])?;
        Ok(stats)
    }

    /// One sweep in the given direction, returning the last step.
    pub fn sweep(
        &mut self,
        mps: &mut Mps<Q>,
        forward: bool,
        advance: bool,
        beta: f64,
        bond_dim: usize,
        noise: f64,
    ) -> SweepResult<TeIteration>
    {
        let windows = sweep::sweep_range(mps, forward)?;
        let mut last: Option<TeIteration> = None;
        let mut max_error: f64 = 0.0;
        for i in windows.into_iter() {
            let it = self.update_two_dot(i, mps, forward, advance, beta, bond_dim, noise)?;
            max_error = max_error.max(it.error);
            last = Some(it);
        }
        self.discarded_weights.push(max_error);
        last.ok_or(SweepError::NoWindow { center: mps.center()?, forward })
    }

    /// Evolve `mps` by `n_steps` steps of `beta`, returning the energy after
    /// every step. The state is normalized after every sweep.
    pub fn solve(&mut self, mps: &mut Mps<Q>, n_steps: usize, beta: f64, forward: bool)
        -> SweepResult<Vec<f64>>
    {
        sweep::check_dot(mps)?;
        self.env.prepare(mps, mps)?;
        let n_sub = self.options.n_sub_sweeps.max(1);
        let mut forward = forward;
        let mut energies: Vec<f64> = Vec::with_capacity(n_steps);
        for step in 0..n_steps {
            let t0 = Instant::now();
            let bond_dim = self.options.bond_dims.get(step);
            let noise = self.options.noises.get(step);
            let mut last: Option<TeIteration> = None;
            for sub in 0..n_sub {
                let advance = sub + 1 == n_sub;
                let it = self.sweep(mps, forward, advance, beta, bond_dim, noise)?;
                mps.normalize()?;
                forward = !forward;
                last = Some(it);
            }
            let Some(it) = last else { continue; };
            let (active_peak, scratch_peak) = self.env.arena_peaks();
            info!(
                step, time = beta * (step + 1) as f64, forward = !forward,
                bond_dim, noise,
                energy = it.energy, normsq = it.normsq,
                max_error = self.discarded_weights.last().copied().unwrap_or(0.0),
                active_peak, scratch_peak,
                elapsed = t0.elapsed().as_secs_f64(),
                "imaginary-time step done",
            );
            energies.push(it.energy);
            self.normsqs.push(it.normsq);
        }
        self.energies.extend(energies.iter().copied());
        Ok(energies)
    }
}
