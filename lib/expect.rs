//! Expectation values `⟨bra|O|ket⟩` measured window by window.
//!
//! With a probe operator (see [`Mpo::window_ops`]) every window contributes
//! its local operators, so one sweep collects a full table of one- and
//! two-site values that [`Expect::one_pdm`] assembles into a matrix.
//! Otherwise every window yields the value of the whole operator.

use ndarray as nd;
use serde::{ Deserialize, Serialize };
use rand::{ SeedableRng, rngs::StdRng };
use tracing::{ debug, info };
use crate::{
    block::BlockMatrix,
    decompose::Truncation,
    effective::EffectiveHamiltonian,
    environment::{ FuseType, MovingEnvironment, NoiseKind },
    expr::OpElement,
    functions::TensorFunctions,
    mpo::Mpo,
    mps::{ Mps, MpsError },
    quantum::QLabel,
    store::TensorStore,
    sweep::{ self, Interrupt, SweepError, SweepResult },
};

/// Run configuration of [`Expect`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpectOptions {
    /// Bond dimension of the bra after propagation; `None` keeps everything.
    pub bra_bond_dim: Option<usize>,
    /// Bond dimension of the ket after propagation, when it is a separate
    /// state.
    pub ket_bond_dim: Option<usize>,
    pub cutoff: f64,
    /// Weights of the targets of a multi-target state; the state's own
    /// weights are used when absent.
    pub weights: Option<Vec<f64>>,
}

impl ExpectOptions {
    pub fn with_bra_bond_dim(mut self, m: usize) -> Self {
        self.bra_bond_dim = Some(m);
        self
    }

    pub fn with_ket_bond_dim(mut self, m: usize) -> Self {
        self.ket_bond_dim = Some(m);
        self
    }

    pub fn with_cutoff(mut self, cutoff: f64) -> Self {
        self.cutoff = cutoff;
        self
    }

    pub fn with_weights(mut self, weights: Vec<f64>) -> Self {
        self.weights = Some(weights);
        self
    }

    fn truncation(&self, m: Option<usize>) -> Truncation {
        match m {
            Some(m) => Truncation::new(m).with_cutoff(self.cutoff),
            None => Truncation::unlimited().with_cutoff(self.cutoff),
        }
    }
}

/// Normalized thermal weights `m_k exp(-β (E_k - E_min))` of a set of
/// levels with multiplicities `m_k`.
pub fn partition_weights(beta: f64, energies: &[f64], multiplicities: &[usize]) -> Vec<f64> {
    let emin = energies.iter().copied().fold(f64::INFINITY, f64::min);
    let w: Vec<f64>
        = energies.iter().zip(multiplicities)
        .map(|(e, m)| *m as f64 * (-beta * (e - emin)).exp())
        .collect();
    let z: f64 = w.iter().sum();
    w.into_iter().map(|x| x / z).collect()
}

/// Expectation driver.
pub struct Expect<'a, Q, T>
where
    Q: QLabel,
    T: TensorFunctions<Q>,
{
    env: MovingEnvironment<'a, Q, T>,
    pub options: ExpectOptions,
    interrupt: Option<Interrupt>,
    // only feeds the noise-free density matrices
    rng: StdRng,
    /// Values measured on every window, indexed by the window's first site.
    pub expectations: Vec<Vec<(OpElement<Q>, f64)>>,
}

impl<'a, Q, T> Expect<'a, Q, T>
where
    Q: QLabel,
    T: TensorFunctions<Q>,
{
    pub fn new(mpo: &'a Mpo<Q>, tf: &'a T, options: ExpectOptions) -> Self {
        Self {
            env: MovingEnvironment::new(mpo, tf),
            options,
            interrupt: None,
            rng: StdRng::seed_from_u64(0),
            expectations: Vec::new(),
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

    fn weights(&self, bra: &Mps<Q>) -> SweepResult<Vec<f64>> {
        let w = self.options.weights.clone().unwrap_or_else(|| bra.weights.clone());
        if w.len() != bra.n_roots() {
            return Err(MpsError::TargetCount { expected: bra.n_roots(), got: w.len() }.into());
        }
        Ok(w)
    }

    fn split_and_propagate(
        &mut self,
        i: usize,
        mps: &mut Mps<Q>,
        psis: &[BlockMatrix<Q>],
        weights: &[f64],
        forward: bool,
        bond_dim: Option<usize>,
    ) -> SweepResult<()>
    {
        let dm = self.env.density_matrix_with_weights(
            psis, weights, forward, 0.0, NoiseKind::None, &mut self.rng)?;
        let trunc = self.options.truncation(bond_dim);
        let (split, centers) = self.env.split_density_matrix(&dm, psis, &trunc, forward)?;
        self.env.propagate_wfn(i, mps, forward, split, centers)?;
        Ok(())
    }

    /// Measure on the window `(i, i + 1)`, moving the centers past it if
    /// `propagate`. `ket` defaults to `bra`.
    pub fn update_two_dot(
        &mut self,
        i: usize,
        bra: &mut Mps<Q>,
        mut ket: Option<&mut Mps<Q>>,
        forward: bool,
        propagate: bool,
    ) -> SweepResult<Vec<(OpElement<Q>, f64)>>
    {
        Interrupt::check(self.interrupt.as_ref(), i)?;
        let weights = self.weights(bra)?;
        let _step = self.env.step();
        self.env.move_to(i)?;
        let bra_psis = self.env.contract_two_dot(i, bra, forward)?;
        let ket_psis = match ket.as_deref() {
            Some(k) => self.env.contract_two_dot(i, k, forward)?,
            None => bra_psis.clone(),
        };
        if ket_psis.len() != bra_psis.len() {
            return Err(MpsError::TargetCount {
                expected: bra_psis.len(), got: ket_psis.len() }.into());
        }
        let op = {
            let k: &Mps<Q> = ket.as_deref().unwrap_or(&*bra);
            self.env.eff_ham(FuseType::FuseLR, i, bra, k)?
        };
        let h = EffectiveHamiltonian::new(op, self.env.tf());
        let mpo = self.env.mpo();
        let mut values: Vec<(OpElement<Q>, f64)> = Vec::new();
        let mut nflop: usize = 0;
        for ((b, k), w) in bra_psis.iter().zip(&ket_psis).zip(&weights) {
            let (vals, stats) = h.expect(b, k)?;
            nflop += stats.flops;
            if values.is_empty() {
                values = vals.into_iter().map(|(o, v)| (o, w * v)).collect();
            } else {
                values.iter_mut().zip(vals)
                    .for_each(|((_, acc), (_, v))| { *acc += w * v; });
            }
        }
        let wsum: f64 = weights.iter().sum();
        values.iter_mut()
            .filter(|(o, _)| o.key == mpo.op.key)
            .for_each(|(_, v)| { *v += wsum * mpo.const_e; });
        debug!(
            site = i, forward, n_values = values.len(),
            first = values.first().map(|(_, v)| *v).unwrap_or(0.0), nflop,
            "expect step",
        );
        if propagate {
            self.split_and_propagate(
                i, bra, &bra_psis, &weights, forward, self.options.bra_bond_dim)?;
            if let Some(k) = ket.as_deref_mut() {
                let kw = k.weights.clone();
                self.split_and_propagate(
                    i, k, &ket_psis, &kw, forward, self.options.ket_bond_dim)?;
            }
        }
        Ok(values)
    }

    fn run(
        &mut self,
        bra: &mut Mps<Q>,
        mut ket: Option<&mut Mps<Q>>,
        propagate: bool,
        forward: bool,
    ) -> SweepResult<f64>
    {
        sweep::check_dot(bra)?;
        let n = bra.n_sites();
        {
            let k: &Mps<Q> = ket.as_deref().unwrap_or(&*bra);
            sweep::check_dot(k)?;
            let (bc, kc) = (bra.center()?, k.center()?);
            if bc != kc { return Err(SweepError::CenterMismatch { bra: bc, ket: kc }); }
            self.env.prepare(bra, k)?;
        }
        self.expectations = vec![Vec::new(); n.saturating_sub(1)];
        let windows: Vec<(usize, bool)> = if propagate {
            sweep::sweep_range(bra, forward)?.into_iter().map(|i| (i, forward)).collect()
        } else {
            let c = bra.center()?;
            if c + 1 < n { vec![(c, true)] } else if c > 0 { vec![(c - 1, false)] } else {
                return Err(SweepError::NoWindow { center: c, forward });
            }
        };
        let mut last: f64 = 0.0;
        for (i, fwd) in windows.into_iter() {
            let values = self.update_two_dot(i, bra, ket.as_deref_mut(), fwd, propagate)?;
            last = values.first().map(|(_, v)| *v).unwrap_or(0.0);
            self.expectations[i] = values;
        }
        let (active_peak, scratch_peak) = self.env.arena_peaks();
        info!(propagate, forward, value = last, active_peak, scratch_peak, "expect done");
        Ok(last)
    }

    /// `⟨ψ|O|ψ⟩` over the windows of one sweep (`propagate`) or on the
    /// window at the center only. Returns the first value of the last
    /// window.
    pub fn solve(&mut self, mps: &mut Mps<Q>, propagate: bool, forward: bool)
        -> SweepResult<f64>
    {
        self.run(mps, None, propagate, forward)
    }

    /// Like [`solve`][Self::solve] for the transition value `⟨bra|O|ket⟩`.
    pub fn solve_between(
        &mut self,
        bra: &mut Mps<Q>,
        ket: &mut Mps<Q>,
        propagate: bool,
        forward: bool,
    ) -> SweepResult<f64>
    {
        self.run(bra, Some(ket), propagate, forward)
    }

    /// Assemble the measured one-site values on the diagonal and two-site
    /// values symmetrically off the diagonal of an `n x n` matrix.
    pub fn one_pdm(&self, n: usize) -> nd::Array2<f64> {
        let mut m: nd::Array2<f64> = nd::Array2::zeros((n, n));
        for (op, v) in self.expectations.iter().flatten() {
            match op.key.sites.as_slice() {
                [a] if (*a as usize) < n => { m[[*a as usize, *a as usize]] = *v; },
                [a, b] if (*a as usize) < n && (*b as usize) < n => {
                    let (a, b) = (*a as usize, *b as usize);
                    m[[a, b]] = *v;
                    m[[b, a]] = *v;
                },
                _ => { },
            }
        }
        m
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

    fn state(n: usize, center: usize, seed: u64) -> Mps<U1> {
        let mut rng = StdRng::seed_from_u64(seed);
        let info = MpsInfo::new(vec![model::spin_basis(); n], U1(0), Some(8)).unwrap();
        Mps::random(info, center, 1, &mut rng).unwrap()
    }

    // ⟨Sz_i⟩ and ⟨Sz_i Sz_j⟩ from a dense vector, site 0 outermost
    fn dense_sz(v: &nd::Array1<f64>, n: usize) -> nd::Array2<f64> {
        let sz = |x: usize, i: usize| if (x >> (n - 1 - i)) & 1 == 1 { 0.5 } else { -0.5 };
        nd::Array2::from_shape_fn((n, n), |(i, j)| {
            v.iter().enumerate()
                .map(|(x, a)| {
                    let f = if i == j { sz(x, i) } else { sz(x, i) * sz(x, j) };
                    a * a * f
                })
                .sum()
        })
    }

    #[test]
    fn energy_with_and_without_propagation() {
        let n = 5;
        let params = Xxz::new(1.0, 0.6, 0.2);
        let mpo = Mpo::xxz(n, params).with_const_e(-1.0);
        let tf = SeqTensorFunctions::default();
        let mut mps = state(n, 0, 2);
        let v = mps.to_dense().unwrap();
        let exact = v.dot(&params.dense_hamiltonian(n).dot(&v)) - 1.0;
        let mut ex = Expect::new(&mpo, &tf, ExpectOptions::default());
        let single = ex.solve(&mut mps, false, true).unwrap();
        assert_abs_diff_eq!(single, exact, epsilon = 1e-10);
        let swept = ex.solve(&mut mps, true, true).unwrap();
        assert_abs_diff_eq!(swept, exact, epsilon = 1e-10);
        assert_eq!(mps.center().unwrap(), n - 1);
        for w in ex.expectations.iter() {
            assert_abs_diff_eq!(w[0].1, exact, epsilon = 1e-10);
        }
    }

    #[test]
    fn sz_probe_fills_the_correlation_band() {
        let n = 5;
        let mpo = Mpo::sz_probe(n);
        let tf = SeqTensorFunctions::default();
        let mut mps = state(n, 0, 7);
        let exact = dense_sz(&mps.to_dense().unwrap(), n);
        let mut ex = Expect::new(&mpo, &tf, ExpectOptions::default());
        ex.solve(&mut mps, true, true).unwrap();
        let pdm = ex.one_pdm(n);
        for i in 0..n {
            assert_abs_diff_eq!(pdm[[i, i]], exact[[i, i]], epsilon = 1e-10);
            if i + 1 < n {
                assert_abs_diff_eq!(pdm[[i, i + 1]], exact[[i, i + 1]], epsilon = 1e-10);
                assert_abs_diff_eq!(pdm[[i + 1, i]], exact[[i, i + 1]], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn transition_value_between_two_states() {
        let n = 4;
        let params = Xxz::default();
        let mpo = Mpo::xxz(n, params);
        let tf = SeqTensorFunctions::default();
        let mut bra = state(n, 0, 3);
        let mut ket = state(n, 0, 4);
        let (b, k) = (bra.to_dense().unwrap(), ket.to_dense().unwrap());
        let exact = b.dot(&params.dense_hamiltonian(n).dot(&k));
        let mut ex = Expect::new(&mpo, &tf, ExpectOptions::default());
        let value = ex.solve_between(&mut bra, &mut ket, true, true).unwrap();
        assert_abs_diff_eq!(value, exact, epsilon = 1e-10);
    }

    #[test]
    fn thermal_weights_are_normalized() {
        let w = partition_weights(2.0, &[-1.0, -0.5, 0.3], &[1, 3, 5]);
        assert_abs_diff_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-14);
        assert!(w[0] > w[2]);
        let flat = partition_weights(0.0, &[-1.0, 2.0], &[1, 3]);
        assert_abs_diff_eq!(flat[1], 0.75, epsilon = 1e-14);
    }
}
