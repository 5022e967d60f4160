//! Effective operator of one blocking step.

use std::time::Instant;
use crate::{
    block::{ BlockInfo, BlockMatrix },
    connection::ConnectionPlan,
    expr::OpElement,
    functions::{ ContractResult, TensorFunctions },
    operator::DelayedOperatorTensor,
    quantum::QLabel,
    solver::{ self, SolverResult },
};

/// Work done by one call on an [`EffectiveHamiltonian`].
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct EffStats {
    /// Number of operator applications.
    pub iterations: usize,
    pub flops: usize,
    /// Wall time in seconds.
    pub elapsed: f64,
}

/// A delayed operator paired with the contraction engine evaluating it.
///
/// The first entry of the descriptor is the operator proper; further entries
/// only matter to [`expect`][Self::expect].
pub struct EffectiveHamiltonian<'t, Q, T>
where
    Q: QLabel,
    T: TensorFunctions<Q>,
{
    pub op: DelayedOperatorTensor<Q>,
    tf: &'t T,
}

impl<'t, Q, T> EffectiveHamiltonian<'t, Q, T>
where
    Q: QLabel,
    T: TensorFunctions<Q>,
{
    pub fn new(op: DelayedOperatorTensor<Q>, tf: &'t T) -> Self { Self { op, tf } }

    fn opdq(&self) -> Q {
        self.op.ops.first().map(|o| o.q_label).unwrap_or_else(Q::vacuum)
    }

    fn apply_op(&self, k: usize, c: &BlockMatrix<Q>, v: &mut BlockMatrix<Q>)
        -> ContractResult<()>
    {
        let q = self.op.ops[k].q_label;
        self.tf.multiply(
            &self.op.exprs[k], &self.op.lopt.ops, &self.op.ropt.ops, c, v, q, true)
    }

    fn stats(&self, t0: Instant, iterations: usize) -> EffStats {
        EffStats {
            iterations,
            flops: self.tf.take_flops(),
            elapsed: t0.elapsed().as_secs_f64(),
        }
    }

    /// Diagonal of the operator on wavefunctions laid out like `like`.
    pub fn diagonal(&self, like: &BlockMatrix<Q>) -> ContractResult<BlockMatrix<Q>> {
        let mut diag = like.zeros_like();
        self.tf.diagonal(
            &self.op.exprs[0], &self.op.lopt.ops, &self.op.ropt.ops, &mut diag, self.opdq())?;
        Ok(diag)
    }

    /// Lowest `kets.len()` eigenpairs, the kets serving as initial guesses.
    pub fn eigs(&self, kets: &mut [BlockMatrix<Q>], conv_thrd: f64, max_iter: usize)
        -> SolverResult<(Vec<f64>, EffStats)>
    {
        let t0 = Instant::now();
        let Some(first) = kets.first() else { return Err(solver::SolverError::NoGuess); };
        let diag = self.diagonal(first)?;
        let max_space = (4 * kets.len()).max(20);
        let out = solver::davidson(
            |c, v| self.apply_op(0, c, v),
            Some(&diag), kets, conv_thrd, max_iter, max_space,
        )?;
        Ok((out.energies, self.stats(t0, out.iterations)))
    }

    /// Replace `ket` by `exp(t (H + const_e)) ket`, returning the energy and
    /// norm of the result.
    pub fn expo_apply(&self, ket: &mut BlockMatrix<Q>, t: f64, const_e: f64)
        -> SolverResult<(f64, f64, EffStats)>
    {
        let t0 = Instant::now();
        let out = solver::expo_apply(
            |c, v| self.apply_op(0, c, v), ket, t, const_e, 1e-12, 60)?;
        Ok((out.energy, out.norm, self.stats(t0, out.iterations)))
    }

    /// Runge-Kutta stages of `exp(τ t (H + const_e)) ket` at `τ = 1/3, 2/3,
    /// 1`, leaving `ket` unchanged. The energy and norm refer to the last
    /// stage.
    pub fn rk4_apply(&self, ket: &BlockMatrix<Q>, t: f64, const_e: f64)
        -> SolverResult<(Vec<BlockMatrix<Q>>, f64, f64, EffStats)>
    {
        let t0 = Instant::now();
        let out = solver::rk4_stages(|c, v| self.apply_op(0, c, v), ket, t, const_e)?;
        Ok((out.stages, out.energy, out.norm, self.stats(t0, out.iterations)))
    }

    /// `bra = H ket`, returning the norm of the result.
    ///
    /// `bra` may live on different bond bases than `ket`; its layout is kept
    /// and its data overwritten.
    pub fn multiply(&self, ket: &BlockMatrix<Q>, bra: &mut BlockMatrix<Q>)
        -> ContractResult<(f64, EffStats)>
    {
        let t0 = Instant::now();
        bra.clear();
        self.apply_op(0, ket, bra)?;
        Ok((bra.norm(), self.stats(t0, 1)))
    }

    /// `⟨bra|O|ket⟩` for every operator `O` of the descriptor.
    pub fn expect(&self, bra: &BlockMatrix<Q>, ket: &BlockMatrix<Q>)
        -> ContractResult<(Vec<(OpElement<Q>, f64)>, EffStats)>
    {
        let t0 = Instant::now();
        let mut values: Vec<(OpElement<Q>, f64)> = Vec::with_capacity(self.op.ops.len());
        for (k, op) in self.op.ops.iter().enumerate() {
            let delta = ket.info().delta() + op.q_label;
            let mut v = BlockMatrix::zeros(BlockInfo::wavefunction(
                bra.info().rows().clone(), bra.info().cols().clone(), delta));
            self.apply_op(k, ket, &mut v)?;
            let value = if v.same_layout(bra) { bra.dot(&v) } else { 0.0 };
            values.push((op.clone(), value));
        }
        let n = values.len();
        Ok((values, self.stats(t0, n)))
    }

    /// Wavefunctions obtained by applying one side of every term of the
    /// operator to `ket`, the other side being traced out: the left side
    /// when `forward`, the right side otherwise.
    ///
    /// Members of the result differ in their target label; all share the
    /// bond bases of `ket`.
    pub fn perturbative_noise(&self, ket: &BlockMatrix<Q>, forward: bool)
        -> ContractResult<Vec<BlockMatrix<Q>>>
    {
        let expr = &self.op.exprs[0];
        let labels = ConnectionPlan::labels(expr, forward);
        let targets = ConnectionPlan::target_labels(&labels, ket.info().delta());
        let infos: Vec<BlockInfo<Q>>
            = targets.iter()
            .map(|q| {
                BlockInfo::wavefunction(
                    ket.info().rows().clone(), ket.info().cols().clone(), *q)
            })
            .collect();
        let plan = ConnectionPlan::build(expr, forward, ket.info(), &targets, &infos);
        let mut group: Vec<BlockMatrix<Q>>
            = infos.into_iter().map(BlockMatrix::zeros).collect();
        self.tf.partial_multiply(
            expr, &self.op.lopt.ops, &self.op.ropt.ops, ket, &plan, &mut group)?;
        self.tf.broadcast_group(&mut group)?;
        Ok(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray_linalg::{ Eigh, UPLO };
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::{
        environment::{ FuseType, MovingEnvironment },
        functions::SeqTensorFunctions,
        model::{ self, Xxz },
        mpo::Mpo,
        mps::{ Mps, MpsInfo },
        quantum::U1,
    };

    fn state(n: usize, target: U1, seed: u64) -> Mps<U1> {
        let mut rng = StdRng::seed_from_u64(seed);
        let info = MpsInfo::new(vec![model::spin_basis(); n], target, None).unwrap();
        Mps::random(info, 0, 1, &mut rng).unwrap()
    }

    // lowest eigenvalue of `ham` among product states with `ups` spins up
    fn sector_ground(ham: &ndarray::Array2<f64>, n: usize, ups: u32) -> f64 {
        let idx: Vec<usize>
            = (0..1_usize << n)
            .filter(|i| i.count_ones() == ups)
            .collect();
        let sub = ndarray::Array2::from_shape_fn(
            (idx.len(), idx.len()), |(a, b)| ham[[idx[a], idx[b]]]);
        let (vals, _) = sub.eigh(UPLO::Lower).unwrap();
        vals[0]
    }

    #[test]
    fn three_site_window_reaches_the_ground_state() {
        // full bond dimension: the first window spans the whole sector
        let n = 3;
        let params = Xxz::new(1.0, 0.8, 0.0);
        let mpo = Mpo::xxz(n, params);
        let tf = SeqTensorFunctions::default();
        let mps = state(n, U1(1), 9);
        let mut env = MovingEnvironment::new(&mpo, &tf);
        env.prepare(&mps, &mps).unwrap();
        let mut psi = env.contract_two_dot(0, &mps, true).unwrap();
        let h = EffectiveHamiltonian::new(env.eff_ham(FuseType::FuseLR, 0, &mps, &mps).unwrap(), &tf);
        let (energies, stats) = h.eigs(&mut psi, 1e-14, 200).unwrap();
        assert!(stats.iterations > 0);
        let exact = sector_ground(&params.dense_hamiltonian(n), n, 2);
        assert_abs_diff_eq!(energies[0], exact, epsilon = 1e-10);
        let mut hpsi = psi[0].zeros_like();
        let (norm, _) = h.multiply(&psi[0], &mut hpsi).unwrap();
        assert_abs_diff_eq!(norm, energies[0].abs(), epsilon = 1e-6);
    }

    #[test]
    fn perturbation_group_covers_every_shift() {
        let n = 4;
        let mpo = Mpo::xxz(n, Xxz::default());
        let tf = SeqTensorFunctions::default();
        let mps = state(n, U1(0), 4);
        let mut env = MovingEnvironment::new(&mpo, &tf);
        env.prepare(&mps, &mps).unwrap();
        let psi = env.contract_two_dot(0, &mps, true).unwrap().remove(0);
        let h = EffectiveHamiltonian::new(env.eff_ham(FuseType::FuseLR, 0, &mps, &mps).unwrap(), &tf);
        let group = h.perturbative_noise(&psi, true).unwrap();
        let mut deltas: Vec<U1> = group.iter().map(|g| g.info().delta()).collect();
        deltas.sort();
        assert_eq!(deltas, vec![U1(-2), U1(0), U1(2)]);
        assert!(group.iter().all(|g| g.info().rows() == psi.info().rows()));
        assert!(group.iter().any(|g| g.norm() > 0.0));
    }

    #[test]
    fn expectation_of_the_operator_is_the_energy() {
        let n = 4;
        let params = Xxz::new(1.0, 1.0, 0.3);
        let mpo = Mpo::xxz(n, params);
        let tf = SeqTensorFunctions::default();
        let mps = state(n, U1(0), 8);
        let mut env = MovingEnvironment::new(&mpo, &tf);
        env.prepare(&mps, &mps).unwrap();
        let psi = env.contract_two_dot(0, &mps, true).unwrap().remove(0);
        let h = EffectiveHamiltonian::new(env.eff_ham(FuseType::FuseLR, 0, &mps, &mps).unwrap(), &tf);
        let (values, _) = h.expect(&psi, &psi).unwrap();
        let dense = mps.to_dense().unwrap();
        let exact = dense.dot(&params.dense_hamiltonian(n).dot(&dense));
        assert_eq!(values.len(), 1);
        assert_abs_diff_eq!(values[0].1, exact, epsilon = 1e-10);
    }
}
