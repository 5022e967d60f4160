//! Left and right environment blocks of a sweep, and the decompositions
//! shared by every sweep algorithm.
//!
//! For a chain of `n` sites, `left[k]` is the operator block of sites `0..k`
//! rotated into the left bond basis of site `k`, and `right[k]` the block of
//! sites `k..n` rotated into the right bond basis of site `k - 1`:
//! ```text
//!   left[i]           window (i, i + 1)          right[i + 2]
//! ┌─────────┐   ┌────────────┬────────────┐   ┌──────────────┐
//! │ 0..i    │ ─ │  site i    │  site i+1  │ ─ │ i+2..n       │
//! └─────────┘   └────────────┴────────────┘   └──────────────┘
//!          enlarge_left(i)          enlarge_right(i + 1)
//! ```
//! Blocks are built lazily from the nearest valid one and invalidated when a
//! split changes the isometry they were rotated with. With a store attached,
//! blocks away from the current window are written out and dropped from
//! memory.

use std::time::Instant;
use rand::Rng;
use serde::{ Deserialize, Serialize };
use thiserror::Error;
use tracing::{ debug, trace };
use crate::{
    arena::{ Arena, ArenaScope, Frame },
    block::{ self, BlockInfo, BlockMatrix },
    decompose::{ self, DecomposeError, Split, Truncation },
    functions::{ ContractError, TensorFunctions },
    mpo::Mpo,
    mps::{ Mps, MpsError },
    operator::{ DelayedOperatorTensor, OpBases, OperatorTensor },
    quantum::QLabel,
    store::{ StoreError, StoreKey, TensorStore },
    symbolic::Symbolic,
};

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("error in environment: {0}")]
    Contract(#[from] ContractError),

    #[error("error in environment: {0}")]
    Mps(#[from] MpsError),

    #[error("error in environment: {0}")]
    Store(#[from] StoreError),

    #[error("error in environment: {0}")]
    Decompose(#[from] DecomposeError),

    /// Returned when the operator and a state live on different chains.
    #[error("error in environment: operator has {mpo} sites but a state has {mps}")]
    SiteCount { mpo: usize, mps: usize },

    /// Returned when an effective operator is requested outside the chain.
    #[error("error in environment: no {fuse:?} window at site {site} of {n_sites}")]
    Window { fuse: FuseType, site: usize, n_sites: usize },

    /// Returned when a density matrix is requested for no wavefunction.
    #[error("error in environment: no wavefunction to build a density matrix from")]
    NoWavefunction,

    /// Returned when the weights of a state-averaged density matrix do not
    /// match its wavefunctions.
    #[error("error in environment: {weights} weights for {psis} wavefunctions")]
    WeightCount { psis: usize, weights: usize },

    /// Returned when a block is expected in memory but is not.
    #[error("error in environment: {0} block {1} is missing")]
    MissingBlock(&'static str, usize),
}
use EnvError::*;
pub type EnvResult<T> = Result<T, EnvError>;

/// Shape of an effective operator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FuseType {
    /// Two-site window `(i, i + 1)`: enlarged left and right blocks.
    FuseLR,
    /// One site `k` fused into the right block: `left[k]` and the right
    /// block enlarged at `k`.
    FuseR,
    /// One site `k` fused into the left block: the left block enlarged at
    /// `k` and `right[k + 1]`.
    FuseL,
}

/// Kind of noise mixed into a density matrix.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NoiseKind {
    #[default]
    None,
    /// Random normalized perturbation of each wavefunction.
    Wavefunction,
    /// Random symmetric perturbation of the density matrix itself.
    DensityMatrix,
    /// Density of the wavefunction acted on by one side of every term of the
    /// effective operator.
    Perturbative,
}

/// Arena accounting of one blocking step, from [`MovingEnvironment::step`].
///
/// Storage counted while the guard is alive stays leased until it is
/// dropped.
#[derive(Debug)]
pub struct StepScope {
    _active: ArenaScope,
    _scratch: ArenaScope,
}

#[derive(Clone, Debug)]
enum Slot<Q> {
    Empty,
    Memory(OperatorTensor<Q>),
    Disk,
}

impl<Q> Slot<Q> {
    fn is_empty(&self) -> bool { matches!(self, Self::Empty) }
}

/// Environment blocks of one operator between a bra and a ket.
///
/// Bra and ket are passed to every call that may need to build a block;
/// they must be the same states (or their successors after the splits that
/// were reported through [`invalidate`][Self::invalidate]) across calls.
pub struct MovingEnvironment<'a, Q, T>
where
    Q: QLabel,
    T: TensorFunctions<Q>,
{
    mpo: &'a Mpo<Q>,
    tf: &'a T,
    left: Vec<Slot<Q>>,
    right: Vec<Slot<Q>>,
    store: Option<TensorStore>,
    arena: Arena,
    window: usize,
}

impl<'a, Q, T> MovingEnvironment<'a, Q, T>
where
    Q: QLabel,
    T: TensorFunctions<Q>,
{
    /// Create a new environment with no blocks.
    pub fn new(mpo: &'a Mpo<Q>, tf: &'a T) -> Self {
        let n = mpo.n_sites;
        Self {
            mpo,
            tf,
            left: (0..=n).map(|_| Slot::Empty).collect(),
            right: (0..=n).map(|_| Slot::Empty).collect(),
            store: None,
            arena: Arena::new(),
            window: 0,
        }
    }

    /// Keep blocks away from the current window in `store`.
    pub fn with_store(mut self, store: TensorStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn mpo(&self) -> &'a Mpo<Q> { self.mpo }

    pub fn tf(&self) -> &'a T { self.tf }

    pub fn arena(&self) -> &Arena { &self.arena }

    /// Largest storage simultaneously leased from the active and scratch
    /// frames so far.
    pub fn arena_peaks(&self) -> (usize, usize) {
        (self.arena.peak(Frame::Active), self.arena.peak(Frame::Scratch))
    }

    /// Open the accounting of one blocking step.
    ///
    /// Effective operators, window wavefunctions and density matrices built
    /// while the guard is alive are counted as outstanding until it is
    /// dropped; drivers hold it until the split has been propagated.
    pub fn step(&self) -> StepScope {
        StepScope {
            _active: self.arena.scope(Frame::Active),
            _scratch: self.arena.scope(Frame::Scratch),
        }
    }

    pub fn n_sites(&self) -> usize { self.mpo.n_sites }

    /// Check that `bra` and `ket` fit the operator and drop every block.
    pub fn prepare(&mut self, bra: &Mps<Q>, ket: &Mps<Q>) -> EnvResult<()> {
        let n = self.n_sites();
        for mps in [bra, ket] {
            if mps.n_sites() != n {
                return Err(SiteCount { mpo: n, mps: mps.n_sites() });
            }
        }
        self.left.iter_mut().chain(self.right.iter_mut())
            .for_each(|s| { *s = Slot::Empty; });
        self.window = bra.center()?.min(n.saturating_sub(2));
        debug!(n_sites = n, window = self.window, "prepared environment");
        Ok(())
    }

    /// Drop the blocks made stale by a split of the window `(i, i + 1)`.
    ///
    /// A forward split replaces the isometry of site `i`, so every left
    /// block past it goes; a backward split replaces the isometry of site
    /// `i + 1`, so every right block up to it goes.
    pub fn invalidate(&mut self, i: usize, forward: bool) {
        if forward {
            self.left.iter_mut().skip(i + 1).for_each(|s| { *s = Slot::Empty; });
        } else {
            self.right.iter_mut().take(i + 2).for_each(|s| { *s = Slot::Empty; });
        }
    }

    /// Make `i` the current window, writing blocks it will not need to the
    /// store if there is one.
    pub fn move_to(&mut self, i: usize) -> EnvResult<()> {
        self.window = i;
        let Some(store) = self.store.as_ref() else { return Ok(()); };
        let mut evicted: usize = 0;
        for (k, slot) in self.left.iter_mut().enumerate() {
            if k == i || k == i + 1 { continue; }
            if let Slot::Memory(block) = slot {
                store.save(StoreKey::LeftEnv(k), &*block)?;
                *slot = Slot::Disk;
                evicted += 1;
            }
        }
        for (k, slot) in self.right.iter_mut().enumerate() {
            if k == i + 1 || k == i + 2 { continue; }
            if let Slot::Memory(block) = slot {
                store.save(StoreKey::RightEnv(k), &*block)?;
                *slot = Slot::Disk;
                evicted += 1;
            }
        }
        trace!(window = i, evicted, "moved environment");
        Ok(())
    }

    fn load_slot(&mut self, left: bool, k: usize) -> EnvResult<()> {
        let slot = if left { &mut self.left[k] } else { &mut self.right[k] };
        if let Slot::Disk = slot {
            let store = self.store.as_ref()
                .ok_or(MissingBlock(if left { "left" } else { "right" }, k))?;
            let key = if left { StoreKey::LeftEnv(k) } else { StoreKey::RightEnv(k) };
            *slot = Slot::Memory(store.load(key)?);
        }
        Ok(())
    }

    fn peek(&self, left: bool, k: usize) -> EnvResult<&OperatorTensor<Q>> {
        let slot = if left { &self.left[k] } else { &self.right[k] };
        match slot {
            Slot::Memory(block) => Ok(block),
            _ => Err(MissingBlock(if left { "left" } else { "right" }, k)),
        }
    }

    /// Make sure `left[k]` is in memory, building it from the nearest valid
    /// block if needed. `left[0]` is the empty block and always valid.
    fn ensure_left(&mut self, k: usize, bra: &Mps<Q>, ket: &Mps<Q>) -> EnvResult<()> {
        if k == 0 { return Ok(()); }
        let mut j = k;
        while j > 0 && self.left[j].is_empty() { j -= 1; }
        if j > 0 { self.load_slot(true, j)?; }
        for m in j..k {
            let enlarged = self.enlarge_left(m, bra, ket)?;
            let bra_iso = bra.isometry(m)?;
            let ket_iso = ket.isometry(m)?;
            let mut block = OperatorTensor::new();
            self.tf.rotate(&enlarged, &bra_iso.mat, &ket_iso.mat, &mut block, true)?;
            trace!(site = m + 1, len = block.data_len(), "built left block");
            self.left[m + 1] = Slot::Memory(block);
        }
        self.load_slot(true, k)
    }

    /// Make sure `right[k]` is in memory. `right[n]` is the empty block.
    fn ensure_right(&mut self, k: usize, bra: &Mps<Q>, ket: &Mps<Q>) -> EnvResult<()> {
        let n = self.n_sites();
        if k >= n { return Ok(()); }
        let mut j = k;
        while j < n && self.right[j].is_empty() { j += 1; }
        if j < n { self.load_slot(false, j)?; }
        for m in (k..j).rev() {
            let enlarged = self.enlarge_right(m, bra, ket)?;
            let bra_iso = bra.isometry(m)?;
            let ket_iso = ket.isometry(m)?;
            let mut block = OperatorTensor::new();
            self.tf.rotate(&enlarged, &bra_iso.mat, &ket_iso.mat, &mut block, false)?;
            trace!(site = m, len = block.data_len(), "built right block");
            self.right[m] = Slot::Memory(block);
        }
        self.load_slot(false, k)
    }

    /// Left block of sites `0..=m` on the fused basis `left_dims[m] ⊗ site`,
    /// with the operator's transform applied if it has one at `m`.
    pub fn enlarge_left(&mut self, m: usize, bra: &Mps<Q>, ket: &Mps<Q>)
        -> EnvResult<OperatorTensor<Q>>
    {
        self.ensure_left(m, bra, ket)?;
        let mpo = self.mpo;
        let bases = OpBases {
            row: bra.info.left_dims[m].fuse(&mpo.site_bases[m]),
            col: ket.info.left_dims[m].fuse(&mpo.site_bases[m]),
        };
        let mut c = OperatorTensor::with_structure(
            Some(Symbolic::row_of(mpo.contract_names(m))), None);
        let prev = if m == 0 { None } else { Some(self.peek(true, m)?) };
        self.tf.left_contract(prev, &mpo.tensors[m], &mut c, &bases)?;
        if let Some(t) = mpo.transform_at(m) {
            self.tf.numerical_transform(&mut c, &t.names, &t.exprs, &bases)?;
        }
        Ok(c)
    }

    /// Right block of sites `m..n` on the fused basis
    /// `site ⊗ right_dims[m + 1]`.
    pub fn enlarge_right(&mut self, m: usize, bra: &Mps<Q>, ket: &Mps<Q>)
        -> EnvResult<OperatorTensor<Q>>
    {
        let n = self.n_sites();
        self.ensure_right(m + 1, bra, ket)?;
        let mpo = self.mpo;
        let bases = OpBases {
            row: mpo.site_bases[m].fuse(&bra.info.right_dims[m + 1]),
            col: mpo.site_bases[m].fuse(&ket.info.right_dims[m + 1]),
        };
        let mut c = OperatorTensor::with_structure(
            None, Some(Symbolic::col_of(&mpo.right_names[m])));
        let prev = if m + 1 >= n { None } else { Some(self.peek(false, m + 1)?) };
        self.tf.right_contract(prev, &mpo.tensors[m], &mut c, &bases)?;
        Ok(c)
    }

    /// Effective operator at site or window `i`.
    ///
    /// A probe operator on a two-site window yields one entry per local
    /// operator; anything else yields the single operator of the chain.
    pub fn eff_ham(&mut self, fuse: FuseType, i: usize, bra: &Mps<Q>, ket: &Mps<Q>)
        -> EnvResult<DelayedOperatorTensor<Q>>
    {
        let n = self.n_sites();
        let t0 = Instant::now();
        let (lop, rop) = match fuse {
            FuseType::FuseLR if i + 1 < n => {
                let lop = self.enlarge_left(i, bra, ket)?;
                let rop = self.enlarge_right(i + 1, bra, ket)?;
                (lop, rop)
            },
            FuseType::FuseR if i >= 1 && i < n => {
                self.ensure_left(i, bra, ket)?;
                let lop = self.peek(true, i)?.clone();
                let rop = self.enlarge_right(i, bra, ket)?;
                (lop, rop)
            },
            FuseType::FuseL if i + 1 < n => {
                self.ensure_right(i + 1, bra, ket)?;
                let rop = self.peek(false, i + 1)?.clone();
                let lop = self.enlarge_left(i, bra, ket)?;
                (lop, rop)
            },
            _ => { return Err(Window { fuse, site: i, n_sites: n }); },
        };
        self.arena.hold(Frame::Active, lop.data_len() + rop.data_len());
        let h = match (fuse, self.mpo.window_ops(i)) {
            (FuseType::FuseLR, Some((ops, exprs))) =>
                self.tf.delayed_contract_with(lop, rop, ops, exprs)?,
            _ => self.tf.delayed_contract(lop, rop, &self.mpo.op)?,
        };
        trace!(
            ?fuse, site = i,
            elapsed = t0.elapsed().as_secs_f64(),
            "built effective operator",
        );
        Ok(h)
    }

    /// Wavefunctions of the window `(i, i + 1)` of `mps`.
    pub fn contract_two_dot(&self, i: usize, mps: &Mps<Q>, forward: bool)
        -> EnvResult<Vec<BlockMatrix<Q>>>
    {
        let psis = mps.two_site(i, forward)?;
        let len: usize = psis.iter().map(|p| p.len()).sum();
        self.arena.hold(Frame::Active, len);
        Ok(psis)
    }

    /// Reduced density matrix of a single wavefunction.
    pub fn density_matrix<R>(
        &self,
        psi: &BlockMatrix<Q>,
        forward: bool,
        noise: f64,
        kind: NoiseKind,
        rng: &mut R,
    ) -> EnvResult<BlockMatrix<Q>>
    where R: Rng + ?Sized
    {
        self.density_matrix_with_weights(std::slice::from_ref(psi), &[1.0], forward, noise, kind, rng)
    }

    /// Weighted sum of the reduced density matrices of `psis`.
    ///
    /// The density matrix lives on the row basis of the wavefunctions when
    /// `forward` and on their column basis otherwise. Perturbative noise is
    /// not handled here; see
    /// [`density_matrix_add_perturbation`][Self::density_matrix_add_perturbation].
    pub fn density_matrix_with_weights<R>(
        &self,
        psis: &[BlockMatrix<Q>],
        weights: &[f64],
        forward: bool,
        noise: f64,
        kind: NoiseKind,
        rng: &mut R,
    ) -> EnvResult<BlockMatrix<Q>>
    where R: Rng + ?Sized
    {
        let Some(first) = psis.first() else {
            return Err(NoWavefunction);
        };
        if weights.len() != psis.len() {
            return Err(WeightCount { psis: psis.len(), weights: weights.len() });
        }
        let mut dm = BlockMatrix::zeros(dm_info(first, forward));
        self.arena.hold(Frame::Scratch, dm.len());
        let mut flops: usize = 0;
        for (psi, w) in psis.iter().zip(weights) {
            if kind == NoiseKind::Wavefunction && noise != 0.0 {
                let mut noisy = psi.clone();
                noisy.add_random(noise, rng);
                noisy.normalize();
                flops += block::density(&noisy, forward, *w, &mut dm);
            } else {
                flops += block::density(psi, forward, *w, &mut dm);
            }
        }
        if kind == NoiseKind::DensityMatrix && noise != 0.0 {
            let mut r = BlockMatrix::random(dm.info().clone(), rng);
            let rt = r.transpose();
            r.iadd(&rt, 1.0, false);
            r.normalize();
            dm.iadd(&r, noise, false);
        }
        self.tf.broadcast_group(std::slice::from_mut(&mut dm))?;
        trace!(forward, noise, ?kind, flops, "density matrix");
        Ok(dm)
    }

    /// Add `noise` times the normalized density of the perturbed
    /// wavefunctions `group` to `dm`.
    pub fn density_matrix_add_perturbation(
        &self,
        dm: &mut BlockMatrix<Q>,
        group: &[BlockMatrix<Q>],
        forward: bool,
        noise: f64,
    )
    {
        let normsq: f64 = group.iter().map(|p| p.dot(p)).sum();
        if noise == 0.0 || normsq == 0.0 { return; }
        let w = noise / normsq;
        for p in group.iter() {
            block::density(p, forward, w, dm);
        }
    }

    /// Truncated split of the window from a density matrix, projecting every
    /// wavefunction of `psis` onto the kept basis.
    pub fn split_density_matrix(
        &self,
        dm: &BlockMatrix<Q>,
        psis: &[BlockMatrix<Q>],
        trunc: &Truncation,
        forward: bool,
    ) -> EnvResult<(Split<Q>, Vec<BlockMatrix<Q>>)>
    {
        let split = decompose::split_density_matrix(dm, trunc, forward)?;
        let centers: Vec<BlockMatrix<Q>>
            = psis.iter()
            .map(|psi| decompose::project_center(psi, &split.isometry, forward))
            .collect();
        Ok((split, centers))
    }

    /// Truncated split of the window by a singular value decomposition.
    pub fn split_wavefunction_svd(
        &self,
        psi: &BlockMatrix<Q>,
        trunc: &Truncation,
        forward: bool,
    ) -> EnvResult<(Split<Q>, Vec<BlockMatrix<Q>>)>
    {
        let (split, center) = decompose::split_svd(psi, trunc, forward)?;
        Ok((split, vec![center]))
    }

    /// Store a split of the window `(i, i + 1)` in `mps` and persist the two
    /// tensors if it has a store. The blocks rotated with the replaced
    /// isometry are dropped.
    ///
    /// The new center keeps the fusion form of the split: right-fused after a
    /// forward split, left-fused after a backward one.
    pub fn commit_split(
        &mut self,
        i: usize,
        mps: &mut Mps<Q>,
        forward: bool,
        split: Split<Q>,
        centers: Vec<BlockMatrix<Q>>,
    ) -> EnvResult<()>
    {
        mps.apply_split(i, forward, split.isometry, split.basis, centers)?;
        self.invalidate(i, forward);
        if mps.store().is_some() {
            mps.save_tensor(i)?;
            mps.save_tensor(i + 1)?;
            let iso_site = if forward { i } else { i + 1 };
            mps.unload_tensor(iso_site)?;
        }
        Ok(())
    }

    /// [`commit_split`][Self::commit_split], then bring the new center into
    /// the form the next step in the same direction needs.
    pub fn propagate_wfn(
        &mut self,
        i: usize,
        mps: &mut Mps<Q>,
        forward: bool,
        split: Split<Q>,
        centers: Vec<BlockMatrix<Q>>,
    ) -> EnvResult<()>
    {
        self.commit_split(i, mps, forward, split, centers)?;
        mps.propagate_wfn(i, forward)?;
        Ok(())
    }
}

fn dm_info<Q: QLabel>(psi: &BlockMatrix<Q>, forward: bool) -> BlockInfo<Q> {
    let b = if forward { psi.info().rows() } else { psi.info().cols() };
    BlockInfo::operator(b.clone(), b.clone(), Q::vacuum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{ SeedableRng, rngs::StdRng };
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

    fn energy_of(h: &DelayedOperatorTensor<U1>, tf: &SeqTensorFunctions<U1>, psi: &BlockMatrix<U1>)
        -> f64
    {
        let mut v = psi.zeros_like();
        tf.multiply(&h.exprs[0], &h.lopt.ops, &h.ropt.ops, psi, &mut v, U1(0), true).unwrap();
        v.dot(psi) / psi.dot(psi)
    }

    #[test]
    fn every_window_sees_the_same_energy() {
        let n = 5;
        let mpo = Mpo::xxz(n, Xxz::default());
        let tf = SeqTensorFunctions::default();
        let mut mps = state(n, 0, 11);
        let mut env = MovingEnvironment::new(&mpo, &tf);
        env.prepare(&mps, &mps).unwrap();
        let psi = env.contract_two_dot(0, &mps, true).unwrap();
        let h = env.eff_ham(FuseType::FuseLR, 0, &mps, &mps).unwrap();
        let e0 = energy_of(&h, &tf, &psi[0]);
        let dense = mps.to_dense().unwrap();
        let exact = dense.dot(&Xxz::default().dense_hamiltonian(n).dot(&dense));
        assert_abs_diff_eq!(e0, exact, epsilon = 1e-10);
        // move the center without truncation; the energy is unchanged
        let mut rng = StdRng::seed_from_u64(0);
        for i in 0..n - 2 {
            let psis = env.contract_two_dot(i, &mps, true).unwrap();
            let dm = env.density_matrix(&psis[0], true, 0.0, NoiseKind::None, &mut rng).unwrap();
            let (split, centers)
                = env.split_density_matrix(&dm, &psis, &Truncation::unlimited(), true).unwrap();
            env.propagate_wfn(i, &mut mps, true, split, centers).unwrap();
            let psi = env.contract_two_dot(i + 1, &mps, true).unwrap();
            let h = env.eff_ham(FuseType::FuseLR, i + 1, &mps, &mps).unwrap();
            assert_abs_diff_eq!(energy_of(&h, &tf, &psi[0]), exact, epsilon = 1e-10);
        }
    }

    #[test]
    fn one_site_operators_match_the_window() {
        let n = 4;
        let mpo = Mpo::xxz(n, Xxz::new(1.0, 0.5, 0.1));
        let tf = SeqTensorFunctions::default();
        let mps = state(n, 1, 5);
        let dense = mps.to_dense().unwrap();
        let exact = dense.dot(&Xxz::new(1.0, 0.5, 0.1).dense_hamiltonian(n).dot(&dense));
        let mut env = MovingEnvironment::new(&mpo, &tf);
        env.prepare(&mps, &mps).unwrap();
        let c = mps.site(1).unwrap().tensors()[0].mat.clone();
        let h = env.eff_ham(FuseType::FuseR, 1, &mps, &mps).unwrap();
        assert_abs_diff_eq!(energy_of(&h, &tf, &c), exact, epsilon = 1e-10);
        assert!(env.eff_ham(FuseType::FuseR, 0, &mps, &mps).is_err());
        assert!(env.eff_ham(FuseType::FuseL, n - 1, &mps, &mps).is_err());
    }

    #[test]
    fn evicted_blocks_come_back_from_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let n = 6;
        let mpo = Mpo::xxz(n, Xxz::default());
        let tf = SeqTensorFunctions::default();
        let mps = state(n, 0, 3);
        let store = TensorStore::new(dir.path(), "env").unwrap();
        let mut env = MovingEnvironment::new(&mpo, &tf).with_store(store.clone());
        env.prepare(&mps, &mps).unwrap();
        let psi = env.contract_two_dot(0, &mps, true).unwrap();
        let e0 = energy_of(&env.eff_ham(FuseType::FuseLR, 0, &mps, &mps).unwrap(), &tf, &psi[0]);
        env.move_to(3).unwrap();
        assert!(store.contains(StoreKey::RightEnv(3)));
        env.move_to(0).unwrap();
        let e1 = energy_of(&env.eff_ham(FuseType::FuseLR, 0, &mps, &mps).unwrap(), &tf, &psi[0]);
        assert_abs_diff_eq!(e0, e1, epsilon = 1e-12);
    }

    #[test]
    fn noisy_density_matrix_keeps_its_trace_scale() {
        let mpo = Mpo::xxz(4, Xxz::default());
        let tf = SeqTensorFunctions::default();
        let mps = state(4, 0, 7);
        let env = MovingEnvironment::new(&mpo, &tf);
        let psi = env.contract_two_dot(0, &mps, true).unwrap().remove(0);
        let mut rng = StdRng::seed_from_u64(1);
        let clean = env.density_matrix(&psi, true, 0.0, NoiseKind::None, &mut rng).unwrap();
        let trace: f64
            = (0..clean.n_blocks())
            .map(|k| clean.block(k).diag().sum())
            .sum();
        assert_abs_diff_eq!(trace, psi.dot(&psi), epsilon = 1e-12);
        let noisy = env.density_matrix(&psi, true, 1e-3, NoiseKind::DensityMatrix, &mut rng)
            .unwrap();
        let mut diff = noisy.clone();
        diff.iadd(&clean, -1.0, false);
        assert_abs_diff_eq!(diff.norm(), 1e-3, epsilon = 1e-12);
        let dt = diff.transpose();
        for (a, b) in dt.data().iter().zip(diff.data()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-14);
        }
    }

    #[test]
    fn weights_must_match_the_wavefunctions() {
        let mpo = Mpo::xxz(4, Xxz::default());
        let tf = SeqTensorFunctions::default();
        let mps = state(4, 0, 9);
        let env = MovingEnvironment::new(&mpo, &tf);
        let psi = env.contract_two_dot(0, &mps, true).unwrap().remove(0);
        let psis = vec![psi.clone(), psi];
        let mut rng = StdRng::seed_from_u64(2);
        let err = env.density_matrix_with_weights(
            &psis, &[0.5], true, 0.0, NoiseKind::None, &mut rng).unwrap_err();
        assert!(matches!(err, EnvError::WeightCount { psis: 2, weights: 1 }));
        assert!(env.density_matrix_with_weights(
            &psis, &[0.5, 0.5, 0.5], true, 0.0, NoiseKind::None, &mut rng).is_err());
        assert!(env.density_matrix_with_weights(
            &psis, &[0.5, 0.5], true, 0.0, NoiseKind::None, &mut rng).is_ok());
    }
}
