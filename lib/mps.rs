//! Matrix product states in mixed canonical form.
//!
//! A state on `n` sites is stored as one block-sparse tensor per site. Sites
//! to the left of the orthogonality center are left-canonical isometries
//! (`L`), sites to its right are right-canonical isometries (`R`), and the
//! center (`C`) holds the wavefunction itself, or one wavefunction per target
//! when several states are averaged (`M`):
//! ```text
//!       left_dims[1]      left_dims[i]     right_dims[i+1]
//!            V                 V                 V
//! L[0] ---------- ... ------- C[i] -------- ... ------ R[n-1]
//!  |                           |                          |
//!  site 0                      site i                     site n-1
//! ```
//! Bond bases are tracked from both sides. `left_dims[i]` is the basis of the
//! states of sites `0..i`, labelled by their total label; `right_dims[i]` is
//! the basis of the states of sites `i..n`. A wavefunction pairs a left label
//! `l` with a right label `r` whenever `l ⊗ r` contains the target label.
//!
//! Every site tensor is a [`BlockMatrix`] with one of its indices fused with
//! the physical index of the site:
//! - `L` isometries map `left_dims[i] ⊗ site` onto `left_dims[i + 1]`
//!   (left-fused);
//! - `R` isometries map `site ⊗ right_dims[i + 1]` onto `right_dims[i]`
//!   (right-fused);
//! - the center may be stored either way and is converted on demand.
//!
//! Two-site blocking steps work on the wavefunction of a window `(i, i + 1)`,
//! which requires the center to sit on `i` for a forward step and on `i + 1`
//! for a backward step. After the step the center has moved by one site in
//! the direction of the sweep.
//!
//! Tensors can be evicted to a [`TensorStore`] and are reloaded transparently
//! on access.

use std::{ borrow::Cow, fmt };
use itertools::Itertools;
use ndarray as nd;
use ndarray_linalg::{ QR, error::LinalgError };
use rand::{ Rng, distributions::Distribution };
use serde::{ Deserialize, Serialize };
use statrs::distribution::Normal;
use thiserror::Error;
use crate::{
    basis::BondBasis,
    block::{ self, BlockInfo, BlockMatrix },
    quantum::QLabel,
    store::{ StoreError, StoreKey, TensorStore },
};

#[derive(Debug, Error)]
pub enum MpsError {
    /// Returned when attempting to create a state on zero sites.
    #[error("error in MPS creation: cannot create for an empty system")]
    EmptySystem,

    /// Returned when no state on the given sites carries the target label.
    #[error("error in MPS creation: target label {0} is unreachable")]
    UnreachableTarget(String),

    /// Returned when a site index is out of range.
    #[error("error in MPS: site index {0} out of range")]
    OutOfBounds(usize),

    /// Returned when the canonical-form tags do not have the expected shape.
    #[error("error in MPS: invalid canonical form {0}")]
    CanonicalForm(String),

    /// Returned when an operation needs a site tag other than the one present.
    #[error("error in MPS: site {site} is tagged {found} but {expected} is required")]
    UnexpectedTag { site: usize, found: char, expected: &'static str },

    /// Returned when a site tensor is neither in memory nor in the store.
    #[error("error in MPS: tensor of site {0} is not loaded")]
    NotLoaded(usize),

    /// Returned when group sizes disagree.
    #[error("error in MPS: expected {expected} wavefunctions, got {got}")]
    TargetCount { expected: usize, got: usize },

    #[error("error in MPS: {0}")]
    Store(#[from] StoreError),

    #[error("error in MPS: {0}")]
    Linalg(#[from] LinalgError),
}
use MpsError::*;
pub type MpsResult<T> = Result<T, MpsError>;

/// Canonical-form tag of a single site.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CanonicalTag {
    /// Left-canonical isometry.
    L,
    /// Single-target center.
    C,
    /// Right-canonical isometry.
    R,
    /// Multi-target center.
    M,
}

impl CanonicalTag {
    pub fn as_char(self) -> char {
        match self {
            Self::L => 'L',
            Self::C => 'C',
            Self::R => 'R',
            Self::M => 'M',
        }
    }

    /// Return `true` if `self` is `C` or `M`.
    pub fn is_center(self) -> bool { matches!(self, Self::C | Self::M) }
}

/// Which neighboring index the physical index of a site tensor is fused with.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Fused {
    /// `(left ⊗ site) x right`.
    Left,
    /// `left x (site ⊗ right)`.
    Right,
}

/// A site tensor together with its fusion form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SiteTensor<Q> {
    pub fused: Fused,
    pub mat: BlockMatrix<Q>,
}

impl<Q: QLabel> SiteTensor<Q> {
    pub fn new(fused: Fused, mat: BlockMatrix<Q>) -> Self { Self { fused, mat } }

    /// Return a copy in the requested fusion form.
    pub fn refused(
        &self,
        fused: Fused,
        left: &BondBasis<Q>,
        site: &BondBasis<Q>,
        right: &BondBasis<Q>,
    ) -> Self
    {
        match (self.fused, fused) {
            (Fused::Left, Fused::Right) =>
                Self::new(fused, self.mat.to_right_fused(left, site, right)),
            (Fused::Right, Fused::Left) =>
                Self::new(fused, self.mat.to_left_fused(left, site, right)),
            _ => self.clone(),
        }
    }
}

/// Data held for one site.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SiteData<Q> {
    Single(SiteTensor<Q>),
    /// One wavefunction per target, all in the same fusion form.
    Multi(Vec<SiteTensor<Q>>),
}

impl<Q: QLabel> SiteData<Q> {
    /// Every tensor held, in target order.
    pub fn tensors(&self) -> Vec<&SiteTensor<Q>> {
        match self {
            Self::Single(t) => vec![t],
            Self::Multi(ts) => ts.iter().collect(),
        }
    }

    /// The only tensor held, if there is one.
    pub fn single(&self) -> Option<&SiteTensor<Q>> {
        match self {
            Self::Single(t) => Some(t),
            Self::Multi(_) => None,
        }
    }

    fn map<F>(&self, mut f: F) -> Self
    where F: FnMut(&SiteTensor<Q>) -> SiteTensor<Q>
    {
        match self {
            Self::Single(t) => Self::Single(f(t)),
            Self::Multi(ts) => Self::Multi(ts.iter().map(f).collect()),
        }
    }
}

/// Site bases, target and bond bases of a state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MpsInfo<Q> {
    pub n_sites: usize,
    pub site_bases: Vec<BondBasis<Q>>,
    pub target: Q,
    /// `left_dims[i]` spans the states of sites `0..i`; `n_sites + 1` entries.
    pub left_dims: Vec<BondBasis<Q>>,
    /// `right_dims[i]` spans the states of sites `i..n`; `n_sites + 1` entries.
    pub right_dims: Vec<BondBasis<Q>>,
    /// Bond dimension the bond bases were last truncated to.
    pub bond_dim: Option<usize>,
}

impl<Q: QLabel> MpsInfo<Q> {
    /// Full bond bases compatible with `target`, truncated to `bond_dim`
    /// states per bond with label blocks shrunk proportionally.
    pub fn new(site_bases: Vec<BondBasis<Q>>, target: Q, bond_dim: Option<usize>)
        -> MpsResult<Self>
    {
        let n = site_bases.len();
        if n == 0 { return Err(EmptySystem); }
        let mut left_fci: Vec<BondBasis<Q>> = vec![BondBasis::vacuum()];
        for i in 0..n {
            let next = saturated(left_fci[i].fuse(&site_bases[i]).basis);
            left_fci.push(next);
        }
        let mut right_fci: Vec<BondBasis<Q>> = vec![BondBasis::vacuum(); n + 1];
        for i in (0..n).rev() {
            right_fci[i] = saturated(site_bases[i].fuse(&right_fci[i + 1]).basis);
        }
        if !left_fci[n].contains(target) {
            return Err(UnreachableTarget(target.to_string()));
        }
        // keep only labels that can still reach the target
        let left_dims: Vec<BondBasis<Q>>
            = left_fci.iter().zip(right_fci.iter())
            .map(|(l, r)| {
                l.map_dims(|q, d| {
                    if r.labels().any(|qr| q.fuses_to(qr, target)) { d } else { 0 }
                })
            })
            .collect();
        let right_dims: Vec<BondBasis<Q>>
            = right_fci.iter().zip(left_fci.iter())
            .map(|(r, l)| {
                r.map_dims(|q, d| {
                    if l.labels().any(|ql| ql.fuses_to(q, target)) { d } else { 0 }
                })
            })
            .collect();
        let mut info = Self {
            n_sites: n,
            site_bases,
            target,
            left_dims,
            right_dims,
            bond_dim: None,
        };
        if let Some(m) = bond_dim { info.set_bond_dimension(m); }
        Ok(info)
    }

    /// Shrink every bond basis to at most `m` states, keeping the relative
    /// size of its label blocks.
    pub fn set_bond_dimension(&mut self, m: usize) {
        let shrink = |b: &BondBasis<Q>| -> BondBasis<Q> {
            let total = b.total_dim();
            if total <= m { return b.clone(); }
            b.map_dims(|_, d| d.min((m * d).div_ceil(total)))
        };
        self.left_dims = self.left_dims.iter().map(shrink).collect();
        self.right_dims = self.right_dims.iter().map(shrink).collect();
        self.bond_dim = Some(m);
    }

    /// Largest number of states on any bond, counted from both sides.
    pub fn max_bond_dim(&self) -> usize {
        self.left_dims.iter().chain(self.right_dims.iter())
            .map(|b| b.total_dim())
            .max()
            .unwrap_or(0)
    }
}

// cap block sizes so that long chains do not overflow the FCI counts
fn saturated<Q: QLabel>(b: BondBasis<Q>) -> BondBasis<Q> {
    const CAP: usize = 1 << 40;
    b.map_dims(|_, d| d.min(CAP))
}

/// Matrix product state with a movable orthogonality center.
#[derive(Clone, Debug)]
pub struct MpsState<Q> {
    pub info: MpsInfo<Q>,
    tensors: Vec<Option<SiteData<Q>>>,
    canonical_form: Vec<CanonicalTag>,
    /// Number of sites in a blocking window.
    pub dot: usize,
    /// Averaging weights of the targets of a multi-target center.
    pub weights: Vec<f64>,
    store: Option<TensorStore>,
}

/// Shorthand used throughout the sweep modules.
pub type Mps<Q> = MpsState<Q>;

impl<Q: QLabel> MpsState<Q> {
    /// Random state with its center on `center`, holding `n_roots`
    /// wavefunctions there.
    ///
    /// Isometries are drawn from Gaussian matrices orthonormalized by a QR
    /// decomposition, each bond keeping at most as many states per label as
    /// the fused basis it is projected from. Every center wavefunction is
    /// normalized.
    pub fn random<R>(
        mut info: MpsInfo<Q>,
        center: usize,
        n_roots: usize,
        rng: &mut R,
    ) -> MpsResult<Self>
    where R: Rng + ?Sized
    {
        let n = info.n_sites;
        if center >= n { return Err(OutOfBounds(center)); }
        if n_roots == 0 { return Err(TargetCount { expected: 1, got: 0 }); }
        let normal = Normal::standard();
        let mut tensors: Vec<Option<SiteData<Q>>> = vec![None; n];
        let mut canonical_form: Vec<CanonicalTag> = vec![CanonicalTag::R; n];
        for i in 0..center {
            let fused = info.left_dims[i].fuse(&info.site_bases[i]).basis;
            let kept = fused.map_dims(|q, d| d.min(info.left_dims[i + 1].dim(q)));
            let iso = random_isometry(&fused, &kept, true, &normal, rng)?;
            info.left_dims[i + 1] = kept;
            tensors[i] = Some(SiteData::Single(SiteTensor::new(Fused::Left, iso)));
            canonical_form[i] = CanonicalTag::L;
        }
        for i in (center + 1..n).rev() {
            let fused = info.site_bases[i].fuse(&info.right_dims[i + 1]).basis;
            let kept = fused.map_dims(|q, d| d.min(info.right_dims[i].dim(q)));
            let iso = random_isometry(&fused, &kept, false, &normal, rng)?;
            info.right_dims[i] = kept;
            tensors[i] = Some(SiteData::Single(SiteTensor::new(Fused::Right, iso)));
        }
        let wfn_info = BlockInfo::wavefunction(
            info.left_dims[center].clone(),
            info.site_bases[center].fuse(&info.right_dims[center + 1]).basis,
            info.target,
        );
        let mut centers: Vec<SiteTensor<Q>>
            = (0..n_roots)
            .map(|_| {
                let mut mat = BlockMatrix::zeros(wfn_info.clone());
                mat.data_mut().iter_mut()
                    .for_each(|x| { *x = normal.sample(rng); });
                mat.normalize();
                SiteTensor::new(Fused::Right, mat)
            })
            .collect();
        if n_roots == 1 {
            tensors[center] = centers.pop().map(SiteData::Single);
            canonical_form[center] = CanonicalTag::C;
        } else {
            tensors[center] = Some(SiteData::Multi(centers));
            canonical_form[center] = CanonicalTag::M;
        }
        Ok(Self {
            info,
            tensors,
            canonical_form,
            dot: 2,
            weights: vec![1.0 / n_roots as f64; n_roots],
            store: None,
        })
    }

    /// Assemble a state from explicit site data.
    ///
    /// The bond bases of `info` must match the tensors; the canonical form is
    /// checked.
    pub fn from_parts(
        info: MpsInfo<Q>,
        tensors: Vec<SiteData<Q>>,
        canonical_form: Vec<CanonicalTag>,
    ) -> MpsResult<Self>
    {
        if tensors.len() != info.n_sites || canonical_form.len() != info.n_sites {
            return Err(CanonicalForm(format!(
                "{} tensors and {} tags for {} sites",
                tensors.len(), canonical_form.len(), info.n_sites,
            )));
        }
        let n_roots = tensors.iter()
            .map(|t| t.tensors().len())
            .max()
            .unwrap_or(1);
        let new = Self {
            info,
            tensors: tensors.into_iter().map(Some).collect(),
            canonical_form,
            dot: 2,
            weights: vec![1.0 / n_roots as f64; n_roots],
            store: None,
        };
        new.check_canonical_form()?;
        Ok(new)
    }

    /// Attach a store used for eviction and persistence.
    pub fn with_store(mut self, store: TensorStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn store(&self) -> Option<&TensorStore> { self.store.as_ref() }

    pub fn n_sites(&self) -> usize { self.info.n_sites }

    /// Number of targets held at the center.
    pub fn n_roots(&self) -> usize { self.weights.len() }

    /// Canonical-form tags as a string, e.g. `"LLCRR"`.
    pub fn canonical_form(&self) -> String {
        self.canonical_form.iter().map(|t| t.as_char()).collect()
    }

    pub fn tag(&self, i: usize) -> MpsResult<CanonicalTag> {
        self.canonical_form.get(i).copied().ok_or(OutOfBounds(i))
    }

    /// Position of the center.
    pub fn center(&self) -> MpsResult<usize> {
        self.canonical_form.iter()
            .position(|t| t.is_center())
            .ok_or_else(|| CanonicalForm(self.canonical_form()))
    }

    /// Check that the tags read `L*CR*` or `L*MR*`.
    pub fn check_canonical_form(&self) -> MpsResult<()> {
        let centers = self.canonical_form.iter().positions(|t| t.is_center()).collect_vec();
        let [c] = centers.as_slice() else {
            return Err(CanonicalForm(self.canonical_form()));
        };
        let ok
            = self.canonical_form[..*c].iter().all(|t| *t == CanonicalTag::L)
            && self.canonical_form[c + 1..].iter().all(|t| *t == CanonicalTag::R);
        if ok { Ok(()) } else { Err(CanonicalForm(self.canonical_form())) }
    }

    /// Return `true` if the data of site `i` is in memory.
    pub fn is_loaded(&self, i: usize) -> bool {
        self.tensors.get(i).is_some_and(|t| t.is_some())
    }

    /// Data of site `i`, read from the store if it has been evicted.
    pub fn site(&self, i: usize) -> MpsResult<Cow<'_, SiteData<Q>>> {
        match self.tensors.get(i) {
            None => Err(OutOfBounds(i)),
            Some(Some(data)) => Ok(Cow::Borrowed(data)),
            Some(None) => {
                let store = self.store.as_ref().ok_or(NotLoaded(i))?;
                Ok(Cow::Owned(store.load(StoreKey::Site(i))?))
            },
        }
    }

    /// The single tensor of an isometry site.
    pub fn isometry(&self, i: usize) -> MpsResult<SiteTensor<Q>> {
        let tag = self.tag(i)?;
        if tag.is_center() {
            return Err(UnexpectedTag { site: i, found: tag.as_char(), expected: "L or R" });
        }
        let data = self.site(i)?;
        data.single().cloned()
            .ok_or_else(|| CanonicalForm(self.canonical_form()))
    }

    /// Make sure the data of site `i` is in memory.
    pub fn load_tensor(&mut self, i: usize) -> MpsResult<()> {
        if self.is_loaded(i) { return Ok(()); }
        let data = self.site(i)?.into_owned();
        self.tensors[i] = Some(data);
        Ok(())
    }

    /// Write the data of site `i` to the store, if there is one.
    pub fn save_tensor(&self, i: usize) -> MpsResult<()> {
        let Some(store) = self.store.as_ref() else { return Ok(()); };
        match self.tensors.get(i) {
            None => Err(OutOfBounds(i)),
            Some(Some(data)) => Ok(store.save(StoreKey::Site(i), data)?),
            Some(None) => Ok(()),
        }
    }

    /// Drop the in-memory data of site `i` after saving it. Without a store
    /// the data stays in memory.
    pub fn unload_tensor(&mut self, i: usize) -> MpsResult<()> {
        if self.store.is_none() { return Ok(()); }
        self.save_tensor(i)?;
        if let Some(slot) = self.tensors.get_mut(i) { *slot = None; }
        Ok(())
    }

    /// Write every site, both bond bases of every bond, the tags and the
    /// descriptive data to the store.
    pub fn save(&self) -> MpsResult<()> {
        let Some(store) = self.store.as_ref() else { return Ok(()); };
        for i in 0..self.n_sites() { self.save_tensor(i)?; }
        for (i, b) in self.info.left_dims.iter().enumerate() {
            store.save(StoreKey::LeftBasis(i), b)?;
        }
        for (i, b) in self.info.right_dims.iter().enumerate() {
            store.save(StoreKey::RightBasis(i), b)?;
        }
        store.save(StoreKey::CanonicalForm, &self.canonical_form)?;
        store.save(StoreKey::Info, &(&self.info, self.dot, &self.weights))?;
        Ok(())
    }

    /// Reconstruct a state written by [`save`][Self::save], leaving every
    /// site tensor in the store until it is accessed.
    pub fn load(store: TensorStore) -> MpsResult<Self> {
        let (mut info, dot, weights): (MpsInfo<Q>, usize, Vec<f64>)
            = store.load(StoreKey::Info)?;
        for i in 0..=info.n_sites {
            info.left_dims[i] = store.load(StoreKey::LeftBasis(i))?;
            info.right_dims[i] = store.load(StoreKey::RightBasis(i))?;
        }
        let canonical_form: Vec<CanonicalTag> = store.load(StoreKey::CanonicalForm)?;
        let n = info.n_sites;
        let new = Self {
            info,
            tensors: vec![None; n],
            canonical_form,
            dot,
            weights,
            store: Some(store),
        };
        new.check_canonical_form()?;
        Ok(new)
    }

    /// Wavefunctions of the window `(i, i + 1)`.
    ///
    /// A forward window needs the center on `i`, a backward window on
    /// `i + 1`. The result has row basis `left_dims[i] ⊗ site_i` and column
    /// basis `site_{i+1} ⊗ right_dims[i + 2]`.
    pub fn two_site(&self, i: usize, forward: bool) -> MpsResult<Vec<BlockMatrix<Q>>> {
        let n = self.n_sites();
        if i + 1 >= n { return Err(OutOfBounds(i + 1)); }
        let (ci, oi) = if forward { (i, i + 1) } else { (i + 1, i) };
        let ctag = self.tag(ci)?;
        if !ctag.is_center() {
            return Err(UnexpectedTag { site: ci, found: ctag.as_char(), expected: "C or M" });
        }
        let iso = self.isometry(oi)?;
        let center = self.site(ci)?;
        let info = &self.info;
        let wfn_info = BlockInfo::wavefunction(
            info.left_dims[i].fuse(&info.site_bases[i]).basis,
            info.site_bases[i + 1].fuse(&info.right_dims[i + 2]).basis,
            info.target,
        );
        let bases = (
            &info.left_dims[ci],
            &info.site_bases[ci],
            &info.right_dims[ci + 1],
        );
        let psis: Vec<BlockMatrix<Q>>
            = center.tensors().into_iter()
            .map(|t| {
                let mut psi = BlockMatrix::zeros(wfn_info.clone());
                if forward {
                    let c = t.refused(Fused::Left, bases.0, bases.1, bases.2);
                    block::matmul(&c.mat, false, &iso.mat, false, &mut psi, 1.0);
                } else {
                    let c = t.refused(Fused::Right, bases.0, bases.1, bases.2);
                    block::matmul(&iso.mat, false, &c.mat, false, &mut psi, 1.0);
                }
                psi
            })
            .collect();
        Ok(psis)
    }

    /// Store the result of splitting the window `(i, i + 1)`.
    ///
    /// Forward: `isometry` becomes `L` on `i` and the centers (right-fused)
    /// move to `i + 1`. Backward: `isometry` becomes `R` on `i + 1` and the
    /// centers (left-fused) move to `i`. `basis` is the new bond basis
    /// between the two sites.
    pub fn apply_split(
        &mut self,
        i: usize,
        forward: bool,
        isometry: BlockMatrix<Q>,
        basis: BondBasis<Q>,
        mut centers: Vec<BlockMatrix<Q>>,
    ) -> MpsResult<()>
    {
        if i + 1 >= self.n_sites() { return Err(OutOfBounds(i + 1)); }
        if centers.len() != self.n_roots() {
            return Err(TargetCount { expected: self.n_roots(), got: centers.len() });
        }
        let (iso_site, center_site, iso_tag, iso_fused, c_fused)
            = if forward {
                (i, i + 1, CanonicalTag::L, Fused::Left, Fused::Right)
            } else {
                (i + 1, i, CanonicalTag::R, Fused::Right, Fused::Left)
            };
        if forward {
            self.info.left_dims[i + 1] = basis;
        } else {
            self.info.right_dims[i + 1] = basis;
        }
        self.tensors[iso_site]
            = Some(SiteData::Single(SiteTensor::new(iso_fused, isometry)));
        self.canonical_form[iso_site] = iso_tag;
        let (data, tag) = if centers.len() == 1 {
            let c = centers.pop().map(|m| SiteTensor::new(c_fused, m));
            (c.map(SiteData::Single), CanonicalTag::C)
        } else {
            let cs = centers.into_iter().map(|m| SiteTensor::new(c_fused, m)).collect();
            (Some(SiteData::Multi(cs)), CanonicalTag::M)
        };
        self.tensors[center_site] = data;
        self.canonical_form[center_site] = tag;
        Ok(())
    }

    /// Replace the wavefunctions at the center, keeping their fusion form.
    pub fn set_center(&mut self, mats: Vec<BlockMatrix<Q>>) -> MpsResult<()> {
        let c = self.center()?;
        let fused = self.site(c)?.tensors()[0].fused;
        if mats.len() != self.n_roots() {
            return Err(TargetCount { expected: self.n_roots(), got: mats.len() });
        }
        let mut ts: Vec<SiteTensor<Q>>
            = mats.into_iter().map(|m| SiteTensor::new(fused, m)).collect();
        self.tensors[c] = if ts.len() == 1 {
            ts.pop().map(SiteData::Single)
        } else {
            Some(SiteData::Multi(ts))
        };
        Ok(())
    }

    /// Bring the center tensors into the fusion form needed by the next step
    /// of a sweep moving in the same direction: left-fused unless the center
    /// sits on the last site after a forward step, right-fused unless it sits
    /// on the first site after a backward step.
    pub fn propagate_wfn(&mut self, i: usize, forward: bool) -> MpsResult<()> {
        let n = self.n_sites();
        let c = if forward { i + 1 } else { i };
        let want = match (forward, c) {
            (true, c) if c + 1 < n => Fused::Left,
            (true, _) => Fused::Right,
            (false, c) if c > 0 => Fused::Right,
            (false, _) => Fused::Left,
        };
        self.refuse_site(c, want)
    }

    /// Convert the tensors of site `i` to the fusion form `fused`.
    pub fn refuse_site(&mut self, i: usize, fused: Fused) -> MpsResult<()> {
        self.load_tensor(i)?;
        let (l, s, r) = (
            &self.info.left_dims[i],
            &self.info.site_bases[i],
            &self.info.right_dims[i + 1],
        );
        let Some(data) = self.tensors[i].as_ref() else { return Err(NotLoaded(i)); };
        let new = data.map(|t| t.refused(fused, l, s, r));
        self.tensors[i] = Some(new);
        Ok(())
    }

    /// Norm of the state (of the first target for a multi-target center).
    pub fn norm(&self) -> MpsResult<f64> {
        let c = self.center()?;
        let data = self.site(c)?;
        Ok(data.tensors()[0].mat.norm())
    }

    /// Normalize every center wavefunction.
    pub fn normalize(&mut self) -> MpsResult<()> {
        let c = self.center()?;
        self.load_tensor(c)?;
        match self.tensors[c].as_mut() {
            Some(SiteData::Single(t)) => { t.mat.normalize(); },
            Some(SiteData::Multi(ts)) => {
                ts.iter_mut().for_each(|t| { t.mat.normalize(); });
            },
            None => { return Err(NotLoaded(c)); },
        }
        Ok(())
    }

    /// Contract the state into a dense vector over the product basis of the
    /// sites, site 0 outermost and each site ordered by ascending label.
    ///
    /// Only meant for small chains.
    pub fn to_dense(&self) -> MpsResult<nd::Array1<f64>> {
        let n = self.n_sites();
        let c = self.center()?;
        let mut left: Vec<(Q, nd::Array2<f64>)> = vec![(Q::vacuum(), nd::Array2::ones((1, 1)))];
        let mut phys: usize = 1;
        for i in 0..n {
            let data = self.site(i)?;
            let t = if i == c {
                data.tensors()[0].refused(
                    Fused::Left,
                    &self.info.left_dims[i],
                    &self.info.site_bases[i],
                    &self.info.right_dims[i + 1],
                )
            } else if i < c {
                data.tensors()[0].clone()
            } else {
                break;
            };
            left = absorb_left(&left, phys, &t.mat, &self.info.left_dims[i], &self.info.site_bases[i]);
            phys *= self.info.site_bases[i].total_dim();
        }
        let mut right: Vec<(Q, nd::Array2<f64>)> = vec![(Q::vacuum(), nd::Array2::ones((1, 1)))];
        let mut rphys: usize = 1;
        for i in (c + 1..n).rev() {
            let t = self.isometry(i)?;
            right = absorb_right(&right, rphys, &t.mat, &self.info.site_bases[i], &self.info.right_dims[i + 1]);
            rphys *= self.info.site_bases[i].total_dim();
        }
        let mut out = nd::Array1::zeros(phys * rphys);
        for (ql, lm) in left.iter() {
            for (qr, rm) in right.iter() {
                // both sides are expressed on the bond to the right of the center
                if ql != qr || lm.ncols() != rm.nrows() { continue; }
                let prod = lm.dot(rm);
                for ((a, b), x) in prod.indexed_iter() {
                    out[a * rphys + b] += x;
                }
            }
        }
        Ok(out)
    }
}

/// Dense left partial products: for each bond label, a `phys x bond` matrix.
fn absorb_left<Q: QLabel>(
    left: &[(Q, nd::Array2<f64>)],
    phys: usize,
    t: &BlockMatrix<Q>,
    lbasis: &BondBasis<Q>,
    site: &BondBasis<Q>,
) -> Vec<(Q, nd::Array2<f64>)>
{
    let fused = lbasis.fuse(site);
    let dsite = site.total_dim();
    let site_offsets: Vec<(Q, usize)>
        = site.iter()
        .scan(0, |acc, (q, d)| { let o = *acc; *acc += d; Some((q, o)) })
        .collect();
    let mut out: Vec<(Q, nd::Array2<f64>)> = Vec::new();
    for k in 0..t.n_blocks() {
        let e = t.info().entries()[k];
        let blk = t.block(k);
        let mut acc = nd::Array2::<f64>::zeros((phys * dsite, e.ncols));
        for (ql, lm) in left.iter() {
            for &(qs, so) in site_offsets.iter() {
                let Some(off) = fused.offset(*ql, qs, e.row) else { continue; };
                let ds = site.dim(qs);
                for a in 0..lm.nrows() {
                    for b in 0..lm.ncols() {
                        let x = lm[[a, b]];
                        if x == 0.0 { continue; }
                        for s in 0..ds {
                            let row = blk.row(off + b * ds + s);
                            acc.row_mut(a * dsite + so + s).scaled_add(x, &row);
                        }
                    }
                }
            }
        }
        out.push((e.col, acc));
    }
    out
}

/// Dense right partial products: for each bond label, a `bond x phys` matrix.
fn absorb_right<Q: QLabel>(
    right: &[(Q, nd::Array2<f64>)],
    phys: usize,
    t: &BlockMatrix<Q>,
    site: &BondBasis<Q>,
    rbasis: &BondBasis<Q>,
) -> Vec<(Q, nd::Array2<f64>)>
{
    let fused = site.fuse(rbasis);
    let dsite = site.total_dim();
    let site_offsets: Vec<(Q, usize)>
        = site.iter()
        .scan(0, |acc, (q, d)| { let o = *acc; *acc += d; Some((q, o)) })
        .collect();
    let mut out: Vec<(Q, nd::Array2<f64>)> = Vec::new();
    for k in 0..t.n_blocks() {
        let e = t.info().entries()[k];
        let blk = t.block(k);
        let mut acc = nd::Array2::<f64>::zeros((e.nrows, dsite * phys));
        for (qr, rm) in right.iter() {
            for &(qs, so) in site_offsets.iter() {
                let Some(off) = fused.offset(qs, *qr, e.col) else { continue; };
                let dr = rbasis.dim(*qr);
                for s in 0..site.dim(qs) {
                    for b in 0..dr {
                        let col = blk.column(off + s * dr + b);
                        for p in 0..rm.ncols() {
                            let x = rm[[b, p]];
                            if x == 0.0 { continue; }
                            acc.column_mut((so + s) * phys + p).scaled_add(x, &col);
                        }
                    }
                }
            }
        }
        out.push((e.row, acc));
    }
    out
}

/// Random isometry between `fused` and `kept`, left-canonical (`fused x
/// kept`) if `left`, else right-canonical (`kept x fused`).
fn random_isometry<Q, R>(
    fused: &BondBasis<Q>,
    kept: &BondBasis<Q>,
    left: bool,
    normal: &Normal,
    rng: &mut R,
) -> MpsResult<BlockMatrix<Q>>
where
    Q: QLabel,
    R: Rng + ?Sized,
{
    let info = if left {
        BlockInfo::operator(fused.clone(), kept.clone(), Q::vacuum())
    } else {
        BlockInfo::operator(kept.clone(), fused.clone(), Q::vacuum())
    };
    let mut iso = BlockMatrix::zeros(info);
    for k in 0..iso.n_blocks() {
        let e = iso.info().entries()[k];
        let (m, d) = if left { (e.nrows, e.ncols) } else { (e.ncols, e.nrows) };
        let z: nd::Array2<f64>
            = nd::Array2::from_shape_simple_fn((m, d), || normal.sample(rng));
        let (q, _) = z.qr()?;
        if left {
            iso.block_mut(k).assign(&q);
        } else {
            iso.block_mut(k).assign(&q.t());
        }
    }
    Ok(iso)
}

impl<Q: QLabel> fmt::Display for MpsState<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f, "MPS({} sites, target {}, form {}, dot {})",
            self.n_sites(), self.info.target, self.canonical_form(), self.dot,
        )?;
        let dims = self.info.left_dims.iter()
            .map(|b| b.total_dim())
            .join(" ");
        write!(f, "  left bond dims: {}", dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::quantum::U1;

    fn spin() -> BondBasis<U1> { BondBasis::from_pairs([(U1(1), 1), (U1(-1), 1)]) }

    fn info(n: usize, m: usize) -> MpsInfo<U1> {
        MpsInfo::new(vec![spin(); n], U1(0), Some(m)).unwrap()
    }

    #[test]
    fn fci_bases_reach_target() {
        let info = MpsInfo::new(vec![spin(); 4], U1(0), None).unwrap();
        assert_eq!(info.left_dims[2].total_dim(), 4);
        // after three sites only labels within one flip of zero survive
        assert_eq!(info.left_dims[3].iter().collect_vec(), vec![(U1(-1), 3), (U1(1), 3)]);
        assert_eq!(info.left_dims[4].iter().collect_vec(), vec![(U1(0), 6)]);
        assert_eq!(info.right_dims[0].iter().collect_vec(), vec![(U1(0), 6)]);
        assert!(matches!(
            MpsInfo::new(vec![spin(); 3], U1(0), None),
            Err(UnreachableTarget(_))
        ));
        assert!(matches!(MpsInfo::<U1>::new(vec![], U1(0), None), Err(EmptySystem)));
    }

    #[test]
    fn bond_dimension_caps_every_bond() {
        let info = info(10, 8);
        for b in info.left_dims.iter().chain(info.right_dims.iter()) {
            assert!(b.total_dim() <= 8 + b.n_labels());
        }
        assert_eq!(info.left_dims[0], BondBasis::vacuum());
        assert_eq!(info.right_dims[10], BondBasis::vacuum());
    }

    #[test]
    fn random_state_is_canonical_and_normalized() {
        let mut rng = StdRng::seed_from_u64(10);
        let mps = Mps::random(info(6, 4), 2, 1, &mut rng).unwrap();
        assert_eq!(mps.canonical_form(), "LLCRRR");
        mps.check_canonical_form().unwrap();
        assert_abs_diff_eq!(mps.norm().unwrap(), 1.0, epsilon = 1e-12);
        let dense = mps.to_dense().unwrap();
        assert_abs_diff_eq!(dense.dot(&dense), 1.0, epsilon = 1e-10);
    }

    #[test]
    fn isometries_are_orthonormal() {
        let mut rng = StdRng::seed_from_u64(11);
        let mps = Mps::random(info(6, 6), 3, 1, &mut rng).unwrap();
        let l = mps.isometry(1).unwrap().mat;
        let mut ltl = BlockMatrix::zeros(BlockInfo::operator(
            l.info().cols().clone(), l.info().cols().clone(), U1(0)));
        block::matmul(&l, true, &l, false, &mut ltl, 1.0);
        let id = BlockMatrix::identity(l.info().cols());
        for (x, y) in ltl.data().iter().zip(id.data()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-12);
        }
    }

    #[test]
    fn split_moves_the_center() {
        let mut rng = StdRng::seed_from_u64(12);
        let mut mps = Mps::random(info(5, 4), 1, 1, &mut rng).unwrap();
        let dense = mps.to_dense().unwrap();
        let psi = mps.two_site(1, true).unwrap();
        let (split, center) = crate::decompose::split_svd(
            &psi[0], &crate::decompose::Truncation::unlimited(), true).unwrap();
        mps.apply_split(1, true, split.isometry, split.basis, vec![center]).unwrap();
        mps.propagate_wfn(1, true).unwrap();
        assert_eq!(mps.canonical_form(), "LLCRR");
        let after = mps.to_dense().unwrap();
        for (x, y) in dense.iter().zip(after.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-10);
        }
        // and back again
        let psi = mps.two_site(1, false).unwrap();
        let (split, center) = crate::decompose::split_svd(
            &psi[0], &crate::decompose::Truncation::unlimited(), false).unwrap();
        mps.apply_split(1, false, split.isometry, split.basis, vec![center]).unwrap();
        mps.propagate_wfn(1, false).unwrap();
        assert_eq!(mps.canonical_form(), "LCRRR");
        let back = mps.to_dense().unwrap();
        for (x, y) in dense.iter().zip(back.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-10);
        }
    }

    #[test]
    fn wrong_window_is_rejected() {
        let mut rng = StdRng::seed_from_u64(13);
        let mps = Mps::random(info(4, 4), 1, 1, &mut rng).unwrap();
        assert!(matches!(mps.two_site(2, true), Err(UnexpectedTag { site: 2, .. })));
        assert!(mps.two_site(0, false).is_ok());
        assert!(mps.two_site(1, true).is_ok());
    }

    #[test]
    fn persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TensorStore::new(dir.path(), "ket").unwrap();
        let mut rng = StdRng::seed_from_u64(14);
        let mut mps = Mps::random(info(5, 4), 2, 1, &mut rng).unwrap()
            .with_store(store.clone());
        mps.save().unwrap();
        let dense = mps.to_dense().unwrap();
        mps.unload_tensor(0).unwrap();
        assert!(!mps.is_loaded(0));
        assert_eq!(mps.to_dense().unwrap(), dense);
        let back: Mps<U1> = Mps::load(store).unwrap();
        assert_eq!(back.canonical_form(), "LLCRR");
        assert_eq!(back.info, mps.info);
        assert_eq!(back.to_dense().unwrap(), dense);
    }

    #[test]
    fn canonical_form_check() {
        let mut rng = StdRng::seed_from_u64(15);
        let mut mps = Mps::random(info(4, 4), 0, 2, &mut rng).unwrap();
        assert_eq!(mps.canonical_form(), "MRRR");
        mps.check_canonical_form().unwrap();
        mps.canonical_form[2] = CanonicalTag::L;
        assert!(matches!(mps.check_canonical_form(), Err(CanonicalForm(_))));
    }
}
