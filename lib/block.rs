//! Block-sparse matrices indexed by pairs of quantum labels.
//!
//! Every numeric object in a sweep (site tensors, renormalized operators,
//! two-site wavefunctions, density matrices) is a [`BlockMatrix`]: a row
//! basis, a column basis, a delta label, and one dense block for every pair
//! of row/column labels allowed by the selection rule of its
//! [`BlockKind`]:
//! - operators map column label `c` to row label `r` with `r ∈ c ⊗ delta`;
//! - wavefunctions pair a left label `l` with a right label `r` such that
//!   `delta ∈ l ⊗ r`, where `delta` is the target label of the state.
//!
//! All blocks live in a single contiguous buffer, in row-major order and
//! sorted by `(row label, column label)`, so that a block matrix can be
//! handed to a communicator or written to disk as a flat slice.
//!
//! The free functions at the bottom of this module are the numeric kernels
//! used by the contraction engine; each returns the number of floating-point
//! operations it performed.

use std::fmt;
use ndarray as nd;
use rand::Rng;
use serde::{ Deserialize, Serialize };
use crate::{
    basis::{ BondBasis, FusedBasis },
    quantum::QLabel,
};

/// Selection rule of a block matrix.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockKind {
    /// `row ∈ col ⊗ delta`.
    Operator,
    /// `delta ∈ row ⊗ col`.
    Wavefunction,
}

/// Location of one dense block inside the flat storage.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry<Q> {
    pub row: Q,
    pub col: Q,
    pub offset: usize,
    pub nrows: usize,
    pub ncols: usize,
}

impl<Q> BlockEntry<Q> {
    /// Number of elements in the block.
    pub fn len(&self) -> usize { self.nrows * self.ncols }

    /// Return `true` if the block holds no elements.
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

/// Block layout of a [`BlockMatrix`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo<Q> {
    rows: BondBasis<Q>,
    cols: BondBasis<Q>,
    delta: Q,
    kind: BlockKind,
    entries: Vec<BlockEntry<Q>>,
    len: usize,
}

impl<Q: QLabel> BlockInfo<Q> {
    /// Build the layout holding every block allowed by `kind` and `delta`.
    pub fn new(rows: BondBasis<Q>, cols: BondBasis<Q>, delta: Q, kind: BlockKind)
        -> Self
    {
        let mut entries: Vec<BlockEntry<Q>> = Vec::new();
        let mut offset: usize = 0;
        for (row, nrows) in rows.iter() {
            for (col, ncols) in cols.iter() {
                if Self::allowed(kind, delta, row, col) {
                    entries.push(BlockEntry { row, col, offset, nrows, ncols });
                    offset += nrows * ncols;
                }
            }
        }
        Self { rows, cols, delta, kind, entries, len: offset }
    }

    /// Layout of an operator shifting labels by `delta`.
    pub fn operator(rows: BondBasis<Q>, cols: BondBasis<Q>, delta: Q) -> Self {
        Self::new(rows, cols, delta, BlockKind::Operator)
    }

    /// Layout of a wavefunction with total label `target`.
    pub fn wavefunction(rows: BondBasis<Q>, cols: BondBasis<Q>, target: Q)
        -> Self
    {
        Self::new(rows, cols, target, BlockKind::Wavefunction)
    }

    /// Selection rule.
    #[inline]
    pub fn allowed(kind: BlockKind, delta: Q, row: Q, col: Q) -> bool {
        match kind {
            BlockKind::Operator => col.fuses_to(delta, row),
            BlockKind::Wavefunction => row.fuses_to(col, delta),
        }
    }

    pub fn rows(&self) -> &BondBasis<Q> { &self.rows }

    pub fn cols(&self) -> &BondBasis<Q> { &self.cols }

    pub fn delta(&self) -> Q { self.delta }

    pub fn kind(&self) -> BlockKind { self.kind }

    pub fn entries(&self) -> &[BlockEntry<Q>] { &self.entries }

    /// Total number of stored elements.
    pub fn len(&self) -> usize { self.len }

    /// Return `true` if no elements are stored.
    pub fn is_empty(&self) -> bool { self.len == 0 }

    /// Return the index of the block `(row, col)`, if present.
    #[inline]
    pub fn find(&self, row: Q, col: Q) -> Option<usize> {
        self.entries
            .binary_search_by(|e| (e.row, e.col).cmp(&(row, col)))
            .ok()
    }

    /// Layout of the transpose.
    pub fn transpose(&self) -> Self {
        match self.kind {
            BlockKind::Operator =>
                Self::operator(self.cols.clone(), self.rows.clone(), -self.delta),
            BlockKind::Wavefunction =>
                Self::wavefunction(self.cols.clone(), self.rows.clone(), self.delta),
        }
    }
}

/// Block-sparse matrix with contiguous storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockMatrix<Q> {
    info: BlockInfo<Q>,
    data: Vec<f64>,
}

impl<Q: QLabel> BlockMatrix<Q> {
    /// Allocate a zero matrix with layout `info`.
    pub fn zeros(info: BlockInfo<Q>) -> Self {
        let n = info.len();
        Self { info, data: vec![0.0; n] }
    }

    /// Allocate a matrix with entries drawn uniformly from `[-0.5, 0.5)`.
    pub fn random<R>(info: BlockInfo<Q>, rng: &mut R) -> Self
    where R: Rng + ?Sized
    {
        let data: Vec<f64>
            = (0..info.len())
            .map(|_| rng.gen_range(-0.5..0.5))
            .collect();
        Self { info, data }
    }

    /// Identity operator on `basis`.
    pub fn identity(basis: &BondBasis<Q>) -> Self {
        let info = BlockInfo::operator(basis.clone(), basis.clone(), Q::vacuum());
        let mut mat = Self::zeros(info);
        for k in 0..mat.n_blocks() {
            let e = mat.info.entries[k];
            if e.row == e.col {
                mat.block_mut(k).diag_mut().fill(1.0);
            }
        }
        mat
    }

    /// Zero matrix with the same layout as `self`.
    pub fn zeros_like(&self) -> Self { Self::zeros(self.info.clone()) }

    pub fn info(&self) -> &BlockInfo<Q> { &self.info }

    /// Total number of stored elements.
    pub fn len(&self) -> usize { self.data.len() }

    /// Return `true` if no elements are stored.
    pub fn is_empty(&self) -> bool { self.data.is_empty() }

    pub fn n_blocks(&self) -> usize { self.info.entries.len() }

    /// Flat view of the storage.
    pub fn data(&self) -> &[f64] { &self.data }

    /// Mutable flat view of the storage.
    pub fn data_mut(&mut self) -> &mut [f64] { &mut self.data }

    /// View of the `k`-th block.
    #[inline]
    pub fn block(&self, k: usize) -> nd::ArrayView2<'_, f64> {
        let e = &self.info.entries[k];
        nd::ArrayView2::from_shape(
            (e.nrows, e.ncols), &self.data[e.offset..e.offset + e.len()])
            .unwrap()
    }

    /// Mutable view of the `k`-th block.
    #[inline]
    pub fn block_mut(&mut self, k: usize) -> nd::ArrayViewMut2<'_, f64> {
        let e = self.info.entries[k];
        nd::ArrayViewMut2::from_shape(
            (e.nrows, e.ncols), &mut self.data[e.offset..e.offset + e.len()])
            .unwrap()
    }

    /// View of the block `(row, col)`, if present.
    pub fn get(&self, row: Q, col: Q) -> Option<nd::ArrayView2<'_, f64>> {
        self.info.find(row, col).map(|k| self.block(k))
    }

    /// The `k`-th block as `(bra, ket, view)`, transposed if `trans`.
    #[inline]
    pub fn oriented(&self, k: usize, trans: bool)
        -> (Q, Q, nd::ArrayView2<'_, f64>)
    {
        let e = self.info.entries[k];
        let v = self.block(k);
        if trans { (e.col, e.row, v.reversed_axes()) } else { (e.row, e.col, v) }
    }

    /// The block mapping `ket` to `bra` after an optional transpose.
    pub fn oriented_block(&self, bra: Q, ket: Q, trans: bool)
        -> Option<nd::ArrayView2<'_, f64>>
    {
        if trans {
            self.get(ket, bra).map(|v| v.reversed_axes())
        } else {
            self.get(bra, ket)
        }
    }

    /// Return `true` if `other` has exactly the same block layout.
    pub fn same_layout(&self, other: &Self) -> bool {
        self.info.entries == other.info.entries
    }

    /// Set all elements to zero.
    pub fn clear(&mut self) { self.data.iter_mut().for_each(|x| { *x = 0.0; }); }

    /// Frobenius norm.
    pub fn norm(&self) -> f64 { self.data.iter().map(|x| x * x).sum::<f64>().sqrt() }

    /// Frobenius inner product.
    ///
    /// *Panics* if the layouts differ.
    pub fn dot(&self, other: &Self) -> f64 {
        assert!(self.same_layout(other), "dot product of mismatched layouts");
        self.data.iter().zip(other.data.iter()).map(|(a, b)| a * b).sum()
    }

    pub fn scale(&mut self, factor: f64) {
        self.data.iter_mut().for_each(|x| { *x *= factor; });
    }

    /// Normalize in place, returning the norm before normalization.
    pub fn normalize(&mut self) -> f64 {
        let norm = self.norm();
        if norm > 0.0 { self.scale(1.0 / norm); }
        norm
    }

    /// `self += factor * op(other)`, where `op` transposes if `trans`.
    ///
    /// *Panics* if the layouts are incompatible.
    pub fn iadd(&mut self, other: &Self, factor: f64, trans: bool) {
        if !trans {
            assert!(self.same_layout(other), "iadd of mismatched layouts");
            self.data.iter_mut().zip(other.data.iter())
                .for_each(|(a, b)| { *a += factor * b; });
        } else {
            for k in 0..self.n_blocks() {
                let e = self.info.entries[k];
                let src = other.get(e.col, e.row)
                    .expect("iadd: missing transposed block");
                self.block_mut(k).scaled_add(factor, &src.reversed_axes());
            }
        }
    }

    /// Copy all data from a matrix of identical layout.
    pub fn copy_data_from(&mut self, other: &Self) {
        assert!(self.same_layout(other), "copy between mismatched layouts");
        self.data.copy_from_slice(&other.data);
    }

    /// Copy every block present in both matrices, restricted to the
    /// overlapping index range.
    pub fn selective_copy_from(&mut self, other: &Self) {
        for k in 0..self.n_blocks() {
            let e = self.info.entries[k];
            if let Some(src) = other.get(e.row, e.col) {
                let m = e.nrows.min(src.nrows());
                let n = e.ncols.min(src.ncols());
                self.block_mut(k)
                    .slice_mut(nd::s![..m, ..n])
                    .assign(&src.slice(nd::s![..m, ..n]));
            }
        }
    }

    /// Return the transpose.
    pub fn transpose(&self) -> Self {
        let mut out = Self::zeros(self.info.transpose());
        out.iadd(self, 1.0, true);
        out
    }

    /// Add `scale * x / |x|` for a random `x` of the same layout.
    pub fn add_random<R>(&mut self, scale: f64, rng: &mut R)
    where R: Rng + ?Sized
    {
        let mut noise = Self::random(self.info.clone(), rng);
        noise.normalize();
        self.iadd(&noise, scale, false);
    }

    /// Reinterpret a wavefunction stored as `left x (site ⊗ right)` as
    /// `(left ⊗ site) x right`.
    pub fn to_left_fused(
        &self,
        left: &BondBasis<Q>,
        site: &BondBasis<Q>,
        right: &BondBasis<Q>,
    ) -> Self
    {
        let sr = site.fuse(right);
        let ls = left.fuse(site);
        let info = BlockInfo::wavefunction(
            ls.basis.clone(), right.clone(), self.info.delta);
        let mut out = Self::zeros(info);
        for k in 0..self.n_blocks() {
            let e = self.info.entries[k];
            let src = self.block(k);
            for (qs, qr, co) in sr.components(e.col) {
                let (ds, dr) = (site.dim(qs), right.dim(qr));
                for qls in e.row.fusion(qs).into_iter() {
                    let Some(kd) = out.info.find(qls, qr) else { continue; };
                    let Some(ro) = ls.offset(e.row, qs, qls) else { continue; };
                    let mut dst = out.block_mut(kd);
                    for a in 0..e.nrows {
                        for is in 0..ds {
                            for ir in 0..dr {
                                dst[[ro + a * ds + is, ir]]
                                    = src[[a, co + is * dr + ir]];
                            }
                        }
                    }
                }
            }
        }
        out
    }

    /// Reinterpret a wavefunction stored as `(left ⊗ site) x right` as
    /// `left x (site ⊗ right)`.
    pub fn to_right_fused(
        &self,
        left: &BondBasis<Q>,
        site: &BondBasis<Q>,
        right: &BondBasis<Q>,
    ) -> Self
    {
        let sr = site.fuse(right);
        let ls = left.fuse(site);
        let info = BlockInfo::wavefunction(
            left.clone(), sr.basis.clone(), self.info.delta);
        let mut out = Self::zeros(info);
        for k in 0..self.n_blocks() {
            let e = self.info.entries[k];
            let src = self.block(k);
            let qr = e.col;
            let dr = right.dim(qr);
            for (ql, qs, ro) in ls.components(e.row) {
                let ds = site.dim(qs);
                for qsr in qs.fusion(qr).into_iter() {
                    let Some(kd) = out.info.find(ql, qsr) else { continue; };
                    let Some(co) = sr.offset(qs, qr, qsr) else { continue; };
                    let mut dst = out.block_mut(kd);
                    for a in 0..left.dim(ql) {
                        for is in 0..ds {
                            for ir in 0..dr {
                                dst[[a, co + is * dr + ir]]
                                    = src[[ro + a * ds + is, ir]];
                            }
                        }
                    }
                }
            }
        }
        out
    }
}

impl<Q: QLabel> fmt::Display for BlockMatrix<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f, "BlockMatrix({:?}, delta = {}, {} blocks, {} elements)",
            self.info.kind, self.info.delta, self.n_blocks(), self.len(),
        )?;
        for k in 0..self.n_blocks() {
            let e = self.info.entries[k];
            writeln!(f, "  [{} {}] {}x{}", e.row, e.col, e.nrows, e.ncols)?;
        }
        Ok(())
    }
}

/// `c += factor * op(a) * op(b)`.
pub fn matmul<Q: QLabel>(
    a: &BlockMatrix<Q>,
    trans_a: bool,
    b: &BlockMatrix<Q>,
    trans_b: bool,
    c: &mut BlockMatrix<Q>,
    factor: f64,
) -> usize
{
    let mut flops: usize = 0;
    for ka in 0..a.n_blocks() {
        let (ar, ac, av) = a.oriented(ka, trans_a);
        for kb in 0..b.n_blocks() {
            let (br, bc, bv) = b.oriented(kb, trans_b);
            if br != ac { continue; }
            if let Some(kc) = c.info.find(ar, bc) {
                nd::linalg::general_mat_mul(
                    factor, &av, &bv, 1.0, &mut c.block_mut(kc));
                flops += 2 * av.nrows() * av.ncols() * bv.ncols();
            }
        }
    }
    flops
}

/// `v += factor * op(l) * c * op(r)ᵀ`: the bilinear application of a
/// left/right operator pair to a wavefunction.
pub fn multiply_lcr<Q: QLabel>(
    l: &BlockMatrix<Q>,
    trans_l: bool,
    r: &BlockMatrix<Q>,
    trans_r: bool,
    c: &BlockMatrix<Q>,
    v: &mut BlockMatrix<Q>,
    factor: f64,
) -> usize
{
    let mut flops: usize = 0;
    for kc in 0..c.n_blocks() {
        let ec = c.info.entries[kc];
        let cv = c.block(kc);
        for kl in 0..l.n_blocks() {
            let (lb, lk, lv) = l.oriented(kl, trans_l);
            if lk != ec.row { continue; }
            let mut tmp: Option<nd::Array2<f64>> = None;
            for kr in 0..r.n_blocks() {
                let (rb, rk, rv) = r.oriented(kr, trans_r);
                if rk != ec.col { continue; }
                let Some(kv) = v.info.find(lb, rb) else { continue; };
                if tmp.is_none() {
                    flops += 2 * lv.nrows() * lv.ncols() * cv.ncols();
                }
                let t = tmp.get_or_insert_with(|| lv.dot(&cv));
                nd::linalg::general_mat_mul(
                    factor, &*t, &rv.t(), 1.0, &mut v.block_mut(kv));
                flops += 2 * t.nrows() * t.ncols() * rv.nrows();
            }
        }
    }
    flops
}

/// `v += factor * op(l) * c`, with the right factor traced out.
pub fn multiply_left<Q: QLabel>(
    l: &BlockMatrix<Q>,
    trans_l: bool,
    c: &BlockMatrix<Q>,
    v: &mut BlockMatrix<Q>,
    factor: f64,
) -> usize
{
    matmul(l, trans_l, c, false, v, factor)
}

/// `v += factor * c * op(r)ᵀ`, with the left factor traced out.
pub fn multiply_right<Q: QLabel>(
    r: &BlockMatrix<Q>,
    trans_r: bool,
    c: &BlockMatrix<Q>,
    v: &mut BlockMatrix<Q>,
    factor: f64,
) -> usize
{
    matmul(c, false, r, !trans_r, v, factor)
}

/// Diagonal of the superoperator `c ↦ l * c * rᵀ`, accumulated into `diag`.
pub fn diagonal_lr<Q: QLabel>(
    l: &BlockMatrix<Q>,
    r: &BlockMatrix<Q>,
    diag: &mut BlockMatrix<Q>,
    factor: f64,
) -> usize
{
    let mut flops: usize = 0;
    for k in 0..diag.n_blocks() {
        let e = diag.info.entries[k];
        let (Some(lv), Some(rv)) = (l.get(e.row, e.row), r.get(e.col, e.col))
            else { continue; };
        let ld = lv.diag();
        let rd = rv.diag();
        let mut dv = diag.block_mut(k);
        for ((i, j), x) in dv.indexed_iter_mut() {
            *x += factor * ld[i] * rd[j];
        }
        flops += 2 * e.len();
    }
    flops
}

/// `c += factor * op(a) ⊗ op(b)`, where the Kronecker product is mapped onto
/// the fused row and column bases of `c`.
pub fn tensor_product<Q: QLabel>(
    a: &BlockMatrix<Q>,
    trans_a: bool,
    b: &BlockMatrix<Q>,
    trans_b: bool,
    c: &mut BlockMatrix<Q>,
    row: &FusedBasis<Q>,
    col: &FusedBasis<Q>,
    factor: f64,
) -> usize
{
    let mut flops: usize = 0;
    for ka in 0..a.n_blocks() {
        let (abra, aket, av) = a.oriented(ka, trans_a);
        for kb in 0..b.n_blocks() {
            let (bbra, bket, bv) = b.oriented(kb, trans_b);
            let (mb, nb) = bv.dim();
            for qr in abra.fusion(bbra).into_iter() {
                for qc in aket.fusion(bket).into_iter() {
                    let Some(kc) = c.info.find(qr, qc) else { continue; };
                    let (Some(ro), Some(co))
                        = (row.offset(abra, bbra, qr), col.offset(aket, bket, qc))
                        else { continue; };
                    let mut cv = c.block_mut(kc);
                    for ((i, j), &x) in av.indexed_iter() {
                        if x == 0.0 { continue; }
                        cv.slice_mut(nd::s![
                            ro + i * mb .. ro + (i + 1) * mb,
                            co + j * nb .. co + (j + 1) * nb
                        ])
                            .scaled_add(factor * x, &bv);
                    }
                    flops += 2 * av.len() * bv.len();
                }
            }
        }
    }
    flops
}

/// Change the basis of an operator with a pair of isometries.
///
/// For a left block (`left == true`) the isometries are left-canonical
/// (`fused x new`) and `out += braᵀ * a * ket`; for a right block they are
/// right-canonical (`new x fused`) and `out += bra * a * ketᵀ`.
pub fn rotate<Q: QLabel>(
    a: &BlockMatrix<Q>,
    bra: &BlockMatrix<Q>,
    ket: &BlockMatrix<Q>,
    out: &mut BlockMatrix<Q>,
    left: bool,
) -> usize
{
    let delta = a.info().delta();
    if left {
        let mut tmp = BlockMatrix::zeros(BlockInfo::operator(
            a.info().rows().clone(), ket.info().cols().clone(), delta));
        let f0 = matmul(a, false, ket, false, &mut tmp, 1.0);
        f0 + matmul(bra, true, &tmp, false, out, 1.0)
    } else {
        let mut tmp = BlockMatrix::zeros(BlockInfo::operator(
            a.info().rows().clone(), ket.info().rows().clone(), delta));
        let f0 = matmul(a, false, ket, true, &mut tmp, 1.0);
        f0 + matmul(bra, false, &tmp, false, out, 1.0)
    }
}

/// Accumulate the reduced density matrix of `psi` into `dm`.
///
/// With `trace_right` the right index is traced out and `dm += w ψ ψᵀ` on the
/// row basis; otherwise `dm += w ψᵀ ψ` on the column basis.
pub fn density<Q: QLabel>(
    psi: &BlockMatrix<Q>,
    trace_right: bool,
    weight: f64,
    dm: &mut BlockMatrix<Q>,
) -> usize
{
    let mut flops: usize = 0;
    for k in 0..psi.n_blocks() {
        let e = psi.info.entries[k];
        let pv = psi.block(k);
        if trace_right {
            if let Some(kd) = dm.info.find(e.row, e.row) {
                nd::linalg::general_mat_mul(
                    weight, &pv, &pv.t(), 1.0, &mut dm.block_mut(kd));
                flops += 2 * e.nrows * e.nrows * e.ncols;
            }
        } else if let Some(kd) = dm.info.find(e.col, e.col) {
            nd::linalg::general_mat_mul(
                weight, &pv.t(), &pv, 1.0, &mut dm.block_mut(kd));
            flops += 2 * e.ncols * e.ncols * e.nrows;
        }
    }
    flops
}
