//! The contraction engine: numeric evaluation of operator expressions.
//!
//! [`TensorFunctions`] is the capability set used by every sweep algorithm.
//! All operations walk an [`OpExpr`] and look up the numeric operators it
//! names in left/right dictionaries (`OpArena`s of block matrices):
//! - `multiply` applies `Σ f op(L) ⊗ op(R)` to a two-site wavefunction;
//! - `partial_multiply` applies only one factor of every term, sending each
//!   result to the member of an output group matching its target label;
//! - `diagonal` computes the diagonal of the same application;
//! - `rotate` changes the basis of every operator of a block;
//! - `numerical_transform` derives new operators as linear combinations of
//!   existing ones;
//! - `left_assign`/`right_assign` and `left_contract`/`right_contract` build
//!   enlarged environment blocks;
//! - `delayed_contract` pairs two blocks without materializing the result.
//!
//! Two implementations exist: [`SeqTensorFunctions`], which evaluates
//! everything on the calling worker, and
//! [`ParallelTensorFunctions`][crate::parallel_functions::ParallelTensorFunctions],
//! which additionally follows an ownership rule. Missing operators and
//! unexpected expression nodes are structural errors reported as
//! [`ContractError`]; the numeric content of the blocks (NaN, overflow) is
//! not inspected.

use std::cell::{ Cell, RefCell };
use ndarray as nd;
use thiserror::Error;
use tracing::debug;
use crate::{
    batch::{ BatchQueue, MicroOp, PoolError, SeqMode },
    block::{ self, BlockInfo, BlockMatrix },
    comm::CommError,
    connection::ConnectionPlan,
    expr::{ OpElement, OpExpr, OpKey, OpProduct },
    op_arena::OpArena,
    operator::{ DelayedOperatorTensor, OpBases, OperatorTensor },
    quantum::QLabel,
    symbolic::{ Symbolic, SymbolicError },
};

#[derive(Debug, Error)]
pub enum ContractError {
    /// Returned when an expression names an operator absent from the
    /// dictionary it is evaluated against.
    #[error("error in contraction: operator {0} is not available")]
    MissingOperator(OpKey),

    /// Returned when an expression node has an unexpected kind.
    #[error("error in contraction: unexpected expression node {0}")]
    UnexpectedNode(String),

    /// Returned when the output label cannot be reached from the input label.
    #[error("error in contraction: label mismatch: {0}")]
    LabelMismatch(String),

    /// Returned when operator tensors lack the symbolic structure an
    /// operation needs.
    #[error("error in contraction: inconsistent structure: {0}")]
    Structure(String),

    #[error("error in contraction: {0}")]
    Symbolic(#[from] SymbolicError),

    #[error("error in contraction: {0}")]
    Comm(#[from] CommError),

    #[error("error in contraction: {0}")]
    Pool(#[from] PoolError),
}
use ContractError::*;
pub type ContractResult<T> = Result<T, ContractError>;

/// Dictionary from operator key to numeric data.
pub type OpMap<Q> = OpArena<BlockMatrix<Q>>;

/// Capability set of a contraction engine.
pub trait TensorFunctions<Q: QLabel> {
    /// Evaluation mode of micro-operations.
    fn mode(&self) -> SeqMode;

    /// Return the number of flops counted since the last call, resetting the
    /// counter.
    fn take_flops(&self) -> usize;

    /// Rank of this worker.
    fn rank(&self) -> usize { 0 }

    /// Number of cooperating workers.
    fn size(&self) -> usize { 1 }

    /// Return `true` if this worker is the root.
    fn is_root(&self) -> bool { self.rank() == 0 }

    /// `v += expr * c`, where `v` has label `c.delta + opdq`.
    ///
    /// With `all_reduce`, partial results at `Ref` boundaries are summed
    /// across workers so that `v` is identical everywhere afterwards.
    #[allow(clippy::too_many_arguments)]
    fn multiply(
        &self,
        expr: &OpExpr<Q>,
        lop: &OpMap<Q>,
        rop: &OpMap<Q>,
        c: &BlockMatrix<Q>,
        v: &mut BlockMatrix<Q>,
        opdq: Q,
        all_reduce: bool,
    ) -> ContractResult<()>;

    /// [`multiply`][Self::multiply] for every member of a group.
    #[allow(clippy::too_many_arguments)]
    fn multi_multiply(
        &self,
        expr: &OpExpr<Q>,
        lop: &OpMap<Q>,
        rop: &OpMap<Q>,
        cs: &[BlockMatrix<Q>],
        vs: &mut [BlockMatrix<Q>],
        opdq: Q,
        all_reduce: bool,
    ) -> ContractResult<()>
    {
        if cs.len() != vs.len() {
            return Err(Structure(format!(
                "group sizes {} and {} differ", cs.len(), vs.len())));
        }
        cs.iter().zip(vs.iter_mut())
            .try_for_each(|(c, v)| self.multiply(expr, lop, rop, c, v, opdq, all_reduce))
    }

    /// Apply one factor of every term of `expr` to `c`, the other factor being
    /// traced out, and accumulate each result into the member of `group`
    /// selected by `plan`.
    fn partial_multiply(
        &self,
        expr: &OpExpr<Q>,
        lop: &OpMap<Q>,
        rop: &OpMap<Q>,
        c: &BlockMatrix<Q>,
        plan: &ConnectionPlan<Q>,
        group: &mut [BlockMatrix<Q>],
    ) -> ContractResult<()>;

    /// `diag += diagonal(expr)` for wavefunctions with the layout of `diag`.
    fn diagonal(
        &self,
        expr: &OpExpr<Q>,
        lop: &OpMap<Q>,
        rop: &OpMap<Q>,
        diag: &mut BlockMatrix<Q>,
        opdq: Q,
    ) -> ContractResult<()>;

    /// Rotate every operator named by `a` into the basis of the isometries,
    /// storing the results in `c`.
    ///
    /// With `left`, `a.lmat` names the operators and the isometries are
    /// left-canonical; otherwise `a.rmat` and right-canonical.
    fn rotate(
        &self,
        a: &OperatorTensor<Q>,
        bra: &BlockMatrix<Q>,
        ket: &BlockMatrix<Q>,
        c: &mut OperatorTensor<Q>,
        left: bool,
    ) -> ContractResult<()>;

    /// Derive the operators `names` of `a` as the linear combinations
    /// `exprs` of operators already stored in `a`, and make `names` the new
    /// symbolic vector of `a`.
    fn numerical_transform(
        &self,
        a: &mut OperatorTensor<Q>,
        names: &[OpElement<Q>],
        exprs: &[OpExpr<Q>],
        bases: &OpBases<Q>,
    ) -> ContractResult<()>;

    /// Copy the operators of `a.lmat` into the slots of `c.lmat`.
    fn left_assign(
        &self,
        a: &OperatorTensor<Q>,
        c: &mut OperatorTensor<Q>,
        bases: &OpBases<Q>,
    ) -> ContractResult<()>;

    /// Copy the operators of `a.rmat` into the slots of `c.rmat`.
    fn right_assign(
        &self,
        a: &OperatorTensor<Q>,
        c: &mut OperatorTensor<Q>,
        bases: &OpBases<Q>,
    ) -> ContractResult<()>;

    /// `c = a.lmat * b.lmat`, or `c = b` if there is no left block yet.
    fn left_contract(
        &self,
        a: Option<&OperatorTensor<Q>>,
        b: &OperatorTensor<Q>,
        c: &mut OperatorTensor<Q>,
        bases: &OpBases<Q>,
    ) -> ContractResult<()>;

    /// `c = b.rmat * a.rmat`, or `c = b` if there is no right block yet.
    fn right_contract(
        &self,
        a: Option<&OperatorTensor<Q>>,
        b: &OperatorTensor<Q>,
        c: &mut OperatorTensor<Q>,
        bases: &OpBases<Q>,
    ) -> ContractResult<()>;

    /// Pair a left and a right block into the single operator `op = a.lmat *
    /// b.rmat` without evaluating it.
    fn delayed_contract(
        &self,
        a: OperatorTensor<Q>,
        b: OperatorTensor<Q>,
        op: &OpElement<Q>,
    ) -> ContractResult<DelayedOperatorTensor<Q>>;

    /// Pair a left and a right block into the operators `ops`, defined by the
    /// precomputed `exprs`.
    fn delayed_contract_with(
        &self,
        a: OperatorTensor<Q>,
        b: OperatorTensor<Q>,
        ops: Vec<OpElement<Q>>,
        exprs: Vec<OpExpr<Q>>,
    ) -> ContractResult<DelayedOperatorTensor<Q>>;

    /// Copy the root's version of `mats` to every worker.
    fn broadcast_group(&self, _mats: &mut [BlockMatrix<Q>]) -> ContractResult<()> {
        Ok(())
    }

    /// Sum scalar values over all workers.
    fn all_reduce_values(&self, _vals: &mut [f64]) -> ContractResult<()> { Ok(()) }
}

/// Pair the non-zero entries of a symbolic name vector with their defining
/// expressions, replacing the names of vanishing expressions by `Zero`.
pub(crate) fn contract_targets<Q>(names: &mut [OpExpr<Q>], exprs: Vec<OpExpr<Q>>)
    -> ContractResult<(Vec<OpElement<Q>>, Vec<OpExpr<Q>>)>
where Q: QLabel
{
    if names.len() != exprs.len() {
        return Err(Structure(format!(
            "{} names for {} expressions", names.len(), exprs.len())));
    }
    let mut targets: Vec<OpElement<Q>> = Vec::new();
    let mut defs: Vec<OpExpr<Q>> = Vec::new();
    for (name, expr) in names.iter_mut().zip(exprs) {
        match (&*name, expr) {
            (OpExpr::Zero, _) => { },
            (_, OpExpr::Zero) => { *name = OpExpr::Zero; },
            (OpExpr::Elem(el), expr) => {
                targets.push(el.clone());
                defs.push(expr);
            },
            (other, _) => { return Err(UnexpectedNode(other.to_string())); },
        }
    }
    Ok((targets, defs))
}

fn name_vec<'a, Q: QLabel>(s: Option<&'a Symbolic<Q>>, what: &str)
    -> ContractResult<&'a [OpExpr<Q>]>
{
    s.and_then(|s| s.as_vec())
        .ok_or_else(|| Structure(format!("{} is not a vector", what)))
}

fn name_vec_mut<'a, Q: QLabel>(s: Option<&'a mut Symbolic<Q>>, what: &str)
    -> ContractResult<&'a mut Vec<OpExpr<Q>>>
{
    match s {
        Some(Symbolic::Row(v)) | Some(Symbolic::Col(v)) => Ok(v),
        _ => Err(Structure(format!("{} is not a vector", what))),
    }
}

/// Shared body of the assign operations.
pub(crate) fn assign_with<Q, F>(
    a: &OperatorTensor<Q>,
    c: &mut OperatorTensor<Q>,
    bases: &OpBases<Q>,
    left: bool,
    available: F,
) -> ContractResult<()>
where
    Q: QLabel,
    F: Fn(&OpKey) -> bool,
{
    let (src, what) = if left { (a.lmat.as_ref(), "lmat") } else { (a.rmat.as_ref(), "rmat") };
    let src = name_vec(src, what)?;
    let OperatorTensor { lmat, rmat, ops } = c;
    let dst = name_vec_mut(if left { lmat.as_mut() } else { rmat.as_mut() }, what)?;
    if src.len() != dst.len() {
        return Err(Structure(format!(
            "cannot assign {} entries to {}", src.len(), dst.len())));
    }
    for (se, de) in src.iter().zip(dst.iter_mut()) {
        match (se, &*de) {
            (OpExpr::Zero, _) => { *de = OpExpr::Zero; },
            (OpExpr::Elem(_), OpExpr::Zero) => { },
            (OpExpr::Elem(ae), OpExpr::Elem(ce)) => {
                if !available(&ce.key) { continue; }
                let mat = a.ops.get(&ae.key)
                    .ok_or_else(|| MissingOperator(ae.key.clone()))?;
                let mut out = bases.zeros(ce.q_label);
                if out.same_layout(mat) {
                    out.copy_data_from(mat);
                } else {
                    out.selective_copy_from(mat);
                }
                if ae.factor != ce.factor { out.scale(ae.factor / ce.factor); }
                ops.allocate(ce.key.clone(), out);
            },
            (OpExpr::Elem(_), other) | (other, _) => {
                return Err(UnexpectedNode(other.to_string()));
            },
        }
    }
    Ok(())
}

/// Split the terms of a linear combination, each of which must be a single
/// scaled operator.
pub(crate) fn linear_terms<Q: QLabel>(expr: &OpExpr<Q>) -> ContractResult<Vec<OpProduct<Q>>> {
    let terms = expr.terms();
    if let Some(bad) = terms.iter().find(|t| t.b.is_some()) {
        return Err(UnexpectedNode(bad.to_string()));
    }
    Ok(terms)
}

/// In-process contraction engine.
#[derive(Debug)]
pub struct SeqTensorFunctions<Q> {
    queue: RefCell<BatchQueue<Q>>,
    flops: Cell<usize>,
}

impl<Q: QLabel> Default for SeqTensorFunctions<Q> {
    fn default() -> Self { Self::new(SeqMode::None, 1) }
}

impl<Q: QLabel> SeqTensorFunctions<Q> {
    /// Create a new engine evaluating micro-operations in `mode`, with
    /// `nthreads` pool threads in `Auto` mode.
    pub fn new(mode: SeqMode, nthreads: usize) -> Self {
        Self { queue: RefCell::new(BatchQueue::new(mode, nthreads)), flops: Cell::new(0) }
    }

    /// `Auto` mode with one pool thread per logical core.
    pub fn new_auto() -> Self { Self::new(SeqMode::Auto, num_cpus::get()) }

    pub(crate) fn add_flops(&self, n: usize) { self.flops.set(self.flops.get() + n); }

    /// Evaluate all queued micro-operations into `slots`.
    pub fn flush(&self, slots: &mut [Option<BlockMatrix<Q>>]) -> ContractResult<()> {
        let n = self.queue.borrow_mut().flush(slots)?;
        self.add_flops(n);
        Ok(())
    }

    fn push(&self, op: MicroOp<Q>) { self.queue.borrow_mut().push(op); }

    pub(crate) fn check_labels(c: &BlockMatrix<Q>, v: &BlockMatrix<Q>, opdq: Q) -> ContractResult<()> {
        let (cq, vq) = (c.info().delta(), v.info().delta());
        if cq.fuses_to(opdq, vq) {
            Ok(())
        } else {
            Err(LabelMismatch(format!("{} + {} does not reach {}", cq, opdq, vq)))
        }
    }

    fn lookup<'a>(ops: &'a OpMap<Q>, key: &OpKey) -> ContractResult<&'a BlockMatrix<Q>> {
        ops.get(key).ok_or_else(|| MissingOperator(key.clone()))
    }

    fn second<'a>(p: &'a OpProduct<Q>) -> ContractResult<&'a OpElement<Q>> {
        p.b.as_ref().ok_or_else(|| UnexpectedNode(p.to_string()))
    }

    /// Recursive body of `multiply`; `Ref` nodes are looked through.
    pub(crate) fn multiply_rec(
        &self,
        expr: &OpExpr<Q>,
        lop: &OpMap<Q>,
        rop: &OpMap<Q>,
        c: &BlockMatrix<Q>,
        v: &mut BlockMatrix<Q>,
    ) -> ContractResult<()>
    {
        match expr {
            OpExpr::Zero => Ok(()),
            OpExpr::Prod(p) => self.multiply_product(p, lop, rop, c, v),
            OpExpr::Sum(ps) =>
                ps.iter().try_for_each(|p| self.multiply_product(p, lop, rop, c, v)),
            OpExpr::Ref(inner, _) => self.multiply_rec(inner, lop, rop, c, v),
            OpExpr::Elem(_) => Err(UnexpectedNode(expr.to_string())),
        }
    }

    fn multiply_product(
        &self,
        p: &OpProduct<Q>,
        lop: &OpMap<Q>,
        rop: &OpMap<Q>,
        c: &BlockMatrix<Q>,
        v: &mut BlockMatrix<Q>,
    ) -> ContractResult<()>
    {
        let b = Self::second(p)?;
        let l = Self::lookup(lop, &p.a.key)?;
        let r = Self::lookup(rop, &b.key)?;
        self.add_flops(
            block::multiply_lcr(l, p.trans_a(), r, p.trans_b(), c, v, p.factor));
        Ok(())
    }

    /// Recursive body of `diagonal`; `Ref` nodes are looked through.
    pub(crate) fn diagonal_rec(
        &self,
        expr: &OpExpr<Q>,
        lop: &OpMap<Q>,
        rop: &OpMap<Q>,
        diag: &mut BlockMatrix<Q>,
    ) -> ContractResult<()>
    {
        match expr {
            OpExpr::Zero => Ok(()),
            OpExpr::Prod(p) => self.diagonal_product(p, lop, rop, diag),
            OpExpr::Sum(ps) =>
                ps.iter().try_for_each(|p| self.diagonal_product(p, lop, rop, diag)),
            OpExpr::Ref(inner, _) => self.diagonal_rec(inner, lop, rop, diag),
            OpExpr::Elem(_) => Err(UnexpectedNode(expr.to_string())),
        }
    }

    fn diagonal_product(
        &self,
        p: &OpProduct<Q>,
        lop: &OpMap<Q>,
        rop: &OpMap<Q>,
        diag: &mut BlockMatrix<Q>,
    ) -> ContractResult<()>
    {
        let b = Self::second(p)?;
        let l = Self::lookup(lop, &p.a.key)?;
        let r = Self::lookup(rop, &b.key)?;
        self.add_flops(block::diagonal_lr(l, r, diag, p.factor));
        Ok(())
    }

    /// Recursive body of `partial_multiply`; `Ref` nodes are looked through.
    pub(crate) fn partial_rec(
        &self,
        expr: &OpExpr<Q>,
        lop: &OpMap<Q>,
        rop: &OpMap<Q>,
        c: &BlockMatrix<Q>,
        plan: &ConnectionPlan<Q>,
        group: &mut [BlockMatrix<Q>],
    ) -> ContractResult<()>
    {
        match expr {
            OpExpr::Zero => Ok(()),
            OpExpr::Prod(p) => self.partial_product(p, lop, rop, c, plan, group),
            OpExpr::Sum(ps) =>
                ps.iter().try_for_each(|p| self.partial_product(p, lop, rop, c, plan, group)),
            OpExpr::Ref(inner, _) => self.partial_rec(inner, lop, rop, c, plan, group),
            OpExpr::Elem(_) => Err(UnexpectedNode(expr.to_string())),
        }
    }

    fn partial_product(
        &self,
        p: &OpProduct<Q>,
        lop: &OpMap<Q>,
        rop: &OpMap<Q>,
        c: &BlockMatrix<Q>,
        plan: &ConnectionPlan<Q>,
        group: &mut [BlockMatrix<Q>],
    ) -> ContractResult<()>
    {
        let identity = OpKey::identity();
        let trace_right = plan.trace_right();
        let (op, trans, q) = if trace_right {
            Self::lookup(rop, &identity)?;
            (Self::lookup(lop, &p.a.key)?, p.trans_a(), p.a.q_label)
        } else {
            Self::lookup(lop, &identity)?;
            let b = Self::second(p)?;
            (Self::lookup(rop, &b.key)?, p.trans_b(), b.q_label)
        };
        let dq = if trans { -q } else { q };
        let infos = plan.lookup(trans, dq)
            .ok_or_else(|| Structure(format!("no connection for shift {}", dq)))?;
        let mut flops: usize = 0;
        for info in infos.iter() {
            let v = group.get_mut(info.target)
                .ok_or_else(|| Structure(format!("no output for target {}", info.target)))?;
            for conn in info.entries.iter() {
                let Some(ov) = op.oriented_block(conn.bra, conn.ket, trans)
                    else { continue; };
                let cv = c.block(conn.ic);
                let mut vv = v.block_mut(conn.iv);
                if trace_right {
                    nd::linalg::general_mat_mul(p.factor, &ov, &cv, 1.0, &mut vv);
                    flops += 2 * ov.nrows() * ov.ncols() * cv.ncols();
                } else {
                    nd::linalg::general_mat_mul(p.factor, &cv, &ov.t(), 1.0, &mut vv);
                    flops += 2 * cv.nrows() * cv.ncols() * ov.nrows();
                }
            }
        }
        self.add_flops(flops);
        Ok(())
    }

    /// `c += expr` evaluated as Kronecker products of `aops` with `bops`.
    ///
    /// Outside of `SeqMode::None` the products are queued for destination
    /// slot `dest` and land at the next flush.
    pub fn tensor_product(
        &self,
        expr: &OpExpr<Q>,
        aops: &OpMap<Q>,
        bops: &OpMap<Q>,
        c: &mut BlockMatrix<Q>,
        bases: &OpBases<Q>,
        dest: usize,
    ) -> ContractResult<()>
    {
        match expr {
            OpExpr::Zero => Ok(()),
            OpExpr::Prod(p) => self.tensor_product_term(p, aops, bops, c, bases, dest),
            OpExpr::Sum(ps) =>
                ps.iter()
                .try_for_each(|p| self.tensor_product_term(p, aops, bops, c, bases, dest)),
            OpExpr::Ref(inner, _) => self.tensor_product(inner, aops, bops, c, bases, dest),
            OpExpr::Elem(_) => Err(UnexpectedNode(expr.to_string())),
        }
    }

    fn tensor_product_term(
        &self,
        p: &OpProduct<Q>,
        aops: &OpMap<Q>,
        bops: &OpMap<Q>,
        c: &mut BlockMatrix<Q>,
        bases: &OpBases<Q>,
        dest: usize,
    ) -> ContractResult<()>
    {
        let b = Self::second(p)?;
        let am = Self::lookup(aops, &p.a.key)?;
        let bm = Self::lookup(bops, &b.key)?;
        if self.mode().is_none() {
            self.add_flops(block::tensor_product(
                am, p.trans_a(), bm, p.trans_b(), c, &bases.row, &bases.col, p.factor));
        } else {
            self.push(MicroOp::TensorProduct {
                a: am.clone(),
                trans_a: p.trans_a(),
                b: bm.clone(),
                trans_b: p.trans_b(),
                row: bases.row.clone(),
                col: bases.col.clone(),
                factor: p.factor,
                dest,
                info: c.info().clone(),
            });
        }
        Ok(())
    }

    /// Zero matrix with the layout of `src` rotated by the isometries.
    pub(crate) fn rotated_zeros(
        src: &BlockMatrix<Q>,
        bra: &BlockMatrix<Q>,
        ket: &BlockMatrix<Q>,
        left: bool,
    ) -> BlockMatrix<Q>
    {
        let info = if left {
            BlockInfo::operator(
                bra.info().cols().clone(), ket.info().cols().clone(), src.info().delta())
        } else {
            BlockInfo::operator(
                bra.info().rows().clone(), ket.info().rows().clone(), src.info().delta())
        };
        BlockMatrix::zeros(info)
    }

    /// Rotate the operator `src` into a fresh matrix for slot `dest`.
    pub(crate) fn rotate_one(
        &self,
        src: &BlockMatrix<Q>,
        bra: &BlockMatrix<Q>,
        ket: &BlockMatrix<Q>,
        left: bool,
        dest: usize,
    ) -> BlockMatrix<Q>
    {
        let mut out = Self::rotated_zeros(src, bra, ket, left);
        if self.mode().is_none() {
            self.add_flops(block::rotate(src, bra, ket, &mut out, left));
        } else {
            self.push(MicroOp::Rotate {
                a: src.clone(),
                bra: bra.clone(),
                ket: ket.clone(),
                left,
                dest,
                info: out.info().clone(),
            });
        }
        out
    }

    /// Shared body of `numerical_transform`: localize each defining
    /// expression with `localize`, accumulate every local summand in passes
    /// over the summand index, and return the new operators with the
    /// locality flag of each.
    ///
    /// Passes continue until one contributes nothing, i.e. until every
    /// summand of every expression has been absorbed. Names whose expression
    /// is the name itself are left untouched and get no slot.
    pub(crate) fn transform_with<L>(
        &self,
        a: &mut OperatorTensor<Q>,
        names: &[OpElement<Q>],
        exprs: &[OpExpr<Q>],
        bases: &OpBases<Q>,
        mut localize: L,
    ) -> ContractResult<(Vec<Option<BlockMatrix<Q>>>, Vec<bool>)>
    where L: FnMut(&OpExpr<Q>, &OpKey) -> (OpExpr<Q>, bool)
    {
        if names.len() != exprs.len() {
            return Err(Structure(format!(
                "{} names for {} expressions", names.len(), exprs.len())));
        }
        let left = match (&a.lmat, &a.rmat) {
            (Some(_), None) => true,
            (None, Some(_)) => false,
            _ => {
                return Err(Structure(
                    "numerical transform needs exactly one of lmat and rmat".into()));
            },
        };
        let mut terms_of: Vec<Vec<OpProduct<Q>>> = Vec::with_capacity(names.len());
        let mut locality: Vec<bool> = Vec::with_capacity(names.len());
        let mut slots: Vec<Option<BlockMatrix<Q>>> = Vec::with_capacity(names.len());
        for (name, expr) in names.iter().zip(exprs) {
            // names defined as themselves keep their data
            if expr.as_elem().is_some_and(|e| e.key == name.key && e.factor == name.factor) {
                terms_of.push(Vec::new());
                locality.push(true);
                slots.push(None);
                continue;
            }
            if expr.is_zero() {
                terms_of.push(Vec::new());
                locality.push(true);
            } else {
                let (local, is_local)
                    = localize(&expr.scaled(1.0 / name.factor), &name.key);
                terms_of.push(linear_terms(&local)?);
                locality.push(is_local);
            }
            slots.push(Some(
                a.ops.take(&name.key).unwrap_or_else(|| bases.zeros(name.q_label))));
        }
        let mode = self.mode();
        let mut pass: usize = 0;
        loop {
            let mut found = false;
            for (k, terms) in terms_of.iter().enumerate() {
                let Some(t) = terms.get(pass) else { continue; };
                found = true;
                let src = Self::lookup(&a.ops, &t.a.key)?;
                let Some(dst) = slots[k].as_mut() else { continue; };
                if mode.is_none() {
                    dst.iadd(src, t.factor, t.conj != 0);
                    self.add_flops(src.len());
                } else {
                    self.push(MicroOp::Iadd {
                        src: src.clone(),
                        factor: t.factor,
                        trans: t.conj != 0,
                        dest: k,
                        info: dst.info().clone(),
                    });
                }
            }
            if !found { break; }
            if mode == SeqMode::Simple { self.flush(&mut slots)?; }
            pass += 1;
        }
        if mode.is_auto() { self.flush(&mut slots)?; }
        debug!(names = names.len(), passes = pass, "numerical transform");
        let vec = names.to_vec();
        if left {
            a.lmat = Some(Symbolic::row_of(&vec));
        } else {
            a.rmat = Some(Symbolic::col_of(&vec));
        }
        Ok((slots, locality))
    }
}

impl<Q: QLabel> TensorFunctions<Q> for SeqTensorFunctions<Q> {
    fn mode(&self) -> SeqMode { self.queue.borrow().mode() }

    fn take_flops(&self) -> usize { self.flops.replace(0) }

    fn multiply(
        &self,
        expr: &OpExpr<Q>,
        lop: &OpMap<Q>,
        rop: &OpMap<Q>,
        c: &BlockMatrix<Q>,
        v: &mut BlockMatrix<Q>,
        opdq: Q,
        _all_reduce: bool,
    ) -> ContractResult<()>
    {
        Self::check_labels(c, v, opdq)?;
        self.multiply_rec(expr, lop, rop, c, v)
    }

    fn partial_multiply(
        &self,
        expr: &OpExpr<Q>,
        lop: &OpMap<Q>,
        rop: &OpMap<Q>,
        c: &BlockMatrix<Q>,
        plan: &ConnectionPlan<Q>,
        group: &mut [BlockMatrix<Q>],
    ) -> ContractResult<()>
    {
        self.partial_rec(expr, lop, rop, c, plan, group)
    }

    fn diagonal(
        &self,
        expr: &OpExpr<Q>,
        lop: &OpMap<Q>,
        rop: &OpMap<Q>,
        diag: &mut BlockMatrix<Q>,
        opdq: Q,
    ) -> ContractResult<()>
    {
        if opdq != Q::vacuum() {
            return Err(LabelMismatch(format!("diagonal of an operator with shift {}", opdq)));
        }
        self.diagonal_rec(expr, lop, rop, diag)
    }

    fn rotate(
        &self,
        a: &OperatorTensor<Q>,
        bra: &BlockMatrix<Q>,
        ket: &BlockMatrix<Q>,
        c: &mut OperatorTensor<Q>,
        left: bool,
    ) -> ContractResult<()>
    {
        let names = if left { a.lmat.as_ref() } else { a.rmat.as_ref() };
        let names = name_vec(names, if left { "lmat" } else { "rmat" })?;
        let mut keys: Vec<OpKey> = Vec::new();
        let mut slots: Vec<Option<BlockMatrix<Q>>> = Vec::new();
        for e in names.iter() {
            match e {
                OpExpr::Zero => { },
                OpExpr::Elem(el) => {
                    let src = Self::lookup(&a.ops, &el.key)?;
                    slots.push(Some(self.rotate_one(src, bra, ket, left, slots.len())));
                    keys.push(el.key.clone());
                },
                other => { return Err(UnexpectedNode(other.to_string())); },
            }
        }
        self.flush(&mut slots)?;
        if left { c.lmat = a.lmat.clone(); } else { c.rmat = a.rmat.clone(); }
        for (key, slot) in keys.into_iter().zip(slots) {
            if let Some(mat) = slot { c.ops.allocate(key, mat); }
        }
        Ok(())
    }

    fn numerical_transform(
        &self,
        a: &mut OperatorTensor<Q>,
        names: &[OpElement<Q>],
        exprs: &[OpExpr<Q>],
        bases: &OpBases<Q>,
    ) -> ContractResult<()>
    {
        let (slots, _) = self.transform_with(a, names, exprs, bases, |e, _| (e.clone(), true))?;
        for (name, slot) in names.iter().zip(slots) {
            if let Some(mat) = slot { a.ops.allocate(name.key.clone(), mat); }
        }
        Ok(())
    }

    fn left_assign(
        &self,
        a: &OperatorTensor<Q>,
        c: &mut OperatorTensor<Q>,
        bases: &OpBases<Q>,
    ) -> ContractResult<()>
    {
        assign_with(a, c, bases, true, |_| true)
    }

    fn right_assign(
        &self,
        a: &OperatorTensor<Q>,
        c: &mut OperatorTensor<Q>,
        bases: &OpBases<Q>,
    ) -> ContractResult<()>
    {
        assign_with(a, c, bases, false, |_| true)
    }

    fn left_contract(
        &self,
        a: Option<&OperatorTensor<Q>>,
        b: &OperatorTensor<Q>,
        c: &mut OperatorTensor<Q>,
        bases: &OpBases<Q>,
    ) -> ContractResult<()>
    {
        let Some(a) = a else { return self.left_assign(b, c, bases); };
        let al = a.lmat.as_ref().ok_or_else(|| Structure("left block has no lmat".into()))?;
        let bl = b.lmat.as_ref().ok_or_else(|| Structure("site has no lmat".into()))?;
        let exprs = al.multiply(bl)?;
        let names = name_vec_mut(c.lmat.as_mut(), "lmat")?;
        let (targets, defs) = contract_targets(names, exprs)?;
        self.contract_into(&targets, &defs, &a.ops, &b.ops, &mut c.ops, bases)
    }

    fn right_contract(
        &self,
        a: Option<&OperatorTensor<Q>>,
        b: &OperatorTensor<Q>,
        c: &mut OperatorTensor<Q>,
        bases: &OpBases<Q>,
    ) -> ContractResult<()>
    {
        let Some(a) = a else { return self.right_assign(b, c, bases); };
        let ar = a.rmat.as_ref().ok_or_else(|| Structure("right block has no rmat".into()))?;
        let br = b.rmat.as_ref().ok_or_else(|| Structure("site has no rmat".into()))?;
        let exprs = br.multiply(ar)?;
        let names = name_vec_mut(c.rmat.as_mut(), "rmat")?;
        let (targets, defs) = contract_targets(names, exprs)?;
        self.contract_into(&targets, &defs, &b.ops, &a.ops, &mut c.ops, bases)
    }

    fn delayed_contract(
        &self,
        a: OperatorTensor<Q>,
        b: OperatorTensor<Q>,
        op: &OpElement<Q>,
    ) -> ContractResult<DelayedOperatorTensor<Q>>
    {
        let exprs = delayed_exprs(&a, &b)?;
        Ok(DelayedOperatorTensor { ops: vec![op.clone()], exprs, lopt: a, ropt: b })
    }

    fn delayed_contract_with(
        &self,
        a: OperatorTensor<Q>,
        b: OperatorTensor<Q>,
        ops: Vec<OpElement<Q>>,
        exprs: Vec<OpExpr<Q>>,
    ) -> ContractResult<DelayedOperatorTensor<Q>>
    {
        if ops.len() != exprs.len() {
            return Err(Structure(format!(
                "{} operators for {} expressions", ops.len(), exprs.len())));
        }
        Ok(DelayedOperatorTensor { ops, exprs, lopt: a, ropt: b })
    }
}

impl<Q: QLabel> SeqTensorFunctions<Q> {
    fn contract_into(
        &self,
        targets: &[OpElement<Q>],
        exprs: &[OpExpr<Q>],
        aops: &OpMap<Q>,
        bops: &OpMap<Q>,
        dest: &mut OpMap<Q>,
        bases: &OpBases<Q>,
    ) -> ContractResult<()>
    {
        let mut slots: Vec<Option<BlockMatrix<Q>>> = Vec::with_capacity(targets.len());
        for (i, (target, expr)) in targets.iter().zip(exprs).enumerate() {
            let mut mat = bases.zeros(target.q_label);
            self.tensor_product(expr, aops, bops, &mut mat, bases, i)?;
            slots.push(Some(mat));
        }
        self.flush(&mut slots)?;
        for (target, slot) in targets.iter().zip(slots) {
            if let Some(mat) = slot { dest.allocate(target.key.clone(), mat); }
        }
        Ok(())
    }
}

/// The single expression `a.lmat * b.rmat`.
pub(crate) fn delayed_exprs<Q: QLabel>(a: &OperatorTensor<Q>, b: &OperatorTensor<Q>)
    -> ContractResult<Vec<OpExpr<Q>>>
{
    let l = a.lmat.as_ref().ok_or_else(|| Structure("left block has no lmat".into()))?;
    let r = b.rmat.as_ref().ok_or_else(|| Structure("right block has no rmat".into()))?;
    let exprs = l.multiply(r)?;
    if exprs.len() != 1 {
        return Err(Structure(format!("expected one expression, found {}", exprs.len())));
    }
    Ok(exprs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::{ basis::BondBasis, expr::OpName, quantum::U1 };

    fn spin() -> BondBasis<U1> { BondBasis::from_pairs([(U1(1), 1), (U1(-1), 1)]) }

    fn site_ops() -> OpMap<U1> {
        let b = spin();
        let mut ops = OpArena::new();
        ops.allocate(OpKey::identity(), BlockMatrix::identity(&b));
        let mut sz = BlockMatrix::zeros(BlockInfo::operator(b.clone(), b.clone(), U1(0)));
        sz.block_mut(sz.info().find(U1(1), U1(1)).unwrap())[[0, 0]] = 0.5;
        sz.block_mut(sz.info().find(U1(-1), U1(-1)).unwrap())[[0, 0]] = -0.5;
        ops.allocate(OpKey::new(OpName::Sz, &[0]), sz);
        let mut sp = BlockMatrix::zeros(BlockInfo::operator(b.clone(), b.clone(), U1(2)));
        sp.block_mut(0)[[0, 0]] = 1.0;
        ops.allocate(OpKey::new(OpName::Sp, &[0]), sp);
        ops
    }

    fn sz_sz() -> OpExpr<U1> {
        let sz = OpElement::new(OpName::Sz, &[0], U1(0), 1.0);
        OpExpr::Prod(OpProduct { a: sz.clone(), b: Some(sz), conj: 0, factor: 2.0 })
    }

    #[test]
    fn multiply_matches_diagonal() {
        let tf: SeqTensorFunctions<U1> = SeqTensorFunctions::default();
        let ops = site_ops();
        let mut rng = StdRng::seed_from_u64(1);
        let info = BlockInfo::wavefunction(spin(), spin(), U1(0));
        let c = BlockMatrix::random(info.clone(), &mut rng);
        let mut v = BlockMatrix::zeros(info.clone());
        tf.multiply(&sz_sz(), &ops, &ops, &c, &mut v, U1(0), true).unwrap();
        let mut d = BlockMatrix::zeros(info);
        tf.diagonal(&sz_sz(), &ops, &ops, &mut d, U1(0)).unwrap();
        // Sz ⊗ Sz is diagonal, so v = d * c elementwise
        for ((x, y), z) in v.data().iter().zip(d.data()).zip(c.data()) {
            assert_abs_diff_eq!(*x, y * z, epsilon = 1e-14);
        }
        assert!(tf.take_flops() > 0);
        assert_eq!(tf.take_flops(), 0);
    }

    #[test]
    fn missing_operator_is_structural() {
        let tf: SeqTensorFunctions<U1> = SeqTensorFunctions::default();
        let ops = site_ops();
        let info = BlockInfo::wavefunction(spin(), spin(), U1(0));
        let c = BlockMatrix::zeros(info.clone());
        let mut v = BlockMatrix::zeros(info);
        let cz = OpElement::new(OpName::Cz, &[1], U1(0), 1.0);
        let expr = OpExpr::Prod(OpProduct::new(&cz, &cz, 0));
        assert!(matches!(
            tf.multiply(&expr, &ops, &ops, &c, &mut v, U1(0), false),
            Err(MissingOperator(_))
        ));
        assert!(matches!(
            tf.multiply(&OpExpr::Elem(cz), &ops, &ops, &c, &mut v, U1(0), false),
            Err(UnexpectedNode(_))
        ));
        assert!(matches!(
            tf.multiply(&sz_sz(), &ops, &ops, &c, &mut v, U1(2), false),
            Err(LabelMismatch(_))
        ));
    }

    #[test]
    fn numerical_transform_absorbs_every_summand() {
        for mode in [SeqMode::None, SeqMode::Simple, SeqMode::Auto] {
            let tf: SeqTensorFunctions<U1> = SeqTensorFunctions::new(mode, 2);
            let names_in = vec![
                OpElement::new(OpName::Sz, &[0], U1(0), 1.0),
                OpElement::identity(),
            ];
            let mut a = OperatorTensor::with_structure(Some(Symbolic::row_of(&names_in)), None);
            a.ops = site_ops();
            let target = OpElement::new(OpName::X(0), &[0], U1(0), 2.0);
            // X = (3 Sz + 0.5 I) / 2 after dividing by the name factor
            let expr = OpExpr::Sum(vec![
                OpProduct::single(&names_in[0].scaled_for_test(3.0)),
                OpProduct::single(&names_in[1].scaled_for_test(0.5)),
            ]);
            let bases = OpBases::symmetric(&BondBasis::vacuum(), &spin());
            tf.numerical_transform(&mut a, &[target.clone()], &[expr], &bases).unwrap();
            let x = a.ops.get(&target.key).unwrap();
            let up = x.get(U1(1), U1(1)).unwrap()[[0, 0]];
            let dn = x.get(U1(-1), U1(-1)).unwrap()[[0, 0]];
            assert_abs_diff_eq!(up, (1.5 + 0.5) / 2.0, epsilon = 1e-14);
            assert_abs_diff_eq!(dn, (-1.5 + 0.5) / 2.0, epsilon = 1e-14);
            assert_eq!(a.left_names(), vec![target.abs()]);
        }
    }

    impl OpElement<U1> {
        fn scaled_for_test(&self, f: f64) -> Self {
            Self { factor: self.factor * f, ..self.clone() }
        }
    }
}
