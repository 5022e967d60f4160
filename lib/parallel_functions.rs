//! Contraction engine for a group of cooperating workers.
//!
//! [`ParallelTensorFunctions`] evaluates the same operations as
//! [`SeqTensorFunctions`], but consults a [`ParallelRule`] to decide which
//! worker computes what:
//! - environment operators are produced only by their owner (or split across
//!   workers by term when the target is repeated), then reduced onto the
//!   owner and broadcast to every replica;
//! - localized expressions (`OpExpr::Ref`) mark the points where a partial
//!   result must be combined across workers. `multiply` all-reduces there,
//!   `partial_multiply` reduces onto the root, and `diagonal` aggregates all
//!   local terms before a single all-reduce.
//!
//! Every collective is issued in the same order by every worker: the
//! decision to communicate depends only on the symbolic structure and the
//! rule, never on which data happens to be present locally.

use tracing::trace;
use crate::{
    batch::SeqMode,
    block::BlockMatrix,
    comm::{ Accumulator, Communicator },
    connection::ConnectionPlan,
    expr::{ OpElement, OpExpr, OpKey },
    functions::{
        ContractError,
        ContractResult,
        OpMap,
        SeqTensorFunctions,
        TensorFunctions,
        assign_with,
        contract_targets,
        delayed_exprs,
    },
    operator::{ DelayedOperatorTensor, OpBases, OperatorTensor },
    quantum::QLabel,
    rule::ParallelRule,
    symbolic::Symbolic,
};

/// Contraction engine following an ownership rule.
#[derive(Debug)]
pub struct ParallelTensorFunctions<Q, R> {
    seq: SeqTensorFunctions<Q>,
    rule: R,
}

impl<Q, R> ParallelTensorFunctions<Q, R>
where
    Q: QLabel,
    R: ParallelRule,
{
    /// Create a new engine from a rule, evaluating local work with `seq`.
    pub fn new(rule: R, seq: SeqTensorFunctions<Q>) -> Self { Self { seq, rule } }

    pub fn rule(&self) -> &R { &self.rule }

    fn split_ref(expr: OpExpr<Q>) -> (OpExpr<Q>, bool) {
        match expr {
            OpExpr::Ref(inner, is_local) => (*inner, is_local),
            other => (other, true),
        }
    }

    fn localize(&self, expr: &OpExpr<Q>, target: &OpKey) -> (OpExpr<Q>, bool) {
        Self::split_ref(self.rule.localize_expr(expr, target))
    }

    fn multiply_rec(
        &self,
        expr: &OpExpr<Q>,
        lop: &OpMap<Q>,
        rop: &OpMap<Q>,
        c: &BlockMatrix<Q>,
        v: &mut BlockMatrix<Q>,
        all_reduce: bool,
    ) -> ContractResult<()>
    {
        match expr {
            OpExpr::Ref(inner, _) if all_reduce => {
                let mut acc = Accumulator::new(v.zeros_like());
                self.seq.multiply_rec(inner, lop, rop, c, acc.local_mut())?;
                let total = acc.all_reduce(self.rule.comm())?;
                v.iadd(total, 1.0, false);
                Ok(())
            },
            _ => self.seq.multiply_rec(expr, lop, rop, c, v),
        }
    }
}

impl<Q, R> TensorFunctions<Q> for ParallelTensorFunctions<Q, R>
where
    Q: QLabel,
    R: ParallelRule,
{
    fn mode(&self) -> SeqMode { self.seq.mode() }

    fn take_flops(&self) -> usize { self.seq.take_flops() }

    fn rank(&self) -> usize { self.rule.comm().rank() }

    fn size(&self) -> usize { self.rule.comm().size() }

    fn multiply(
        &self,
        expr: &OpExpr<Q>,
        lop: &OpMap<Q>,
        rop: &OpMap<Q>,
        c: &BlockMatrix<Q>,
        v: &mut BlockMatrix<Q>,
        opdq: Q,
        all_reduce: bool,
    ) -> ContractResult<()>
    {
        SeqTensorFunctions::check_labels(c, v, opdq)?;
        self.multiply_rec(expr, lop, rop, c, v, all_reduce)
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
        self.seq.partial_rec(expr, lop, rop, c, plan, group)?;
        if expr.is_ref() {
            let comm = self.rule.comm();
            comm.reduce_group(group, comm.root())?;
        }
        Ok(())
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
            return Err(ContractError::LabelMismatch(
                format!("diagonal of an operator with shift {}", opdq)));
        }
        match expr {
            OpExpr::Ref(inner, _) => {
                // all local terms are aggregated first, so a single
                // reduction covers both evaluation modes
                let mut acc = Accumulator::new(diag.zeros_like());
                self.seq.diagonal_rec(inner, lop, rop, acc.local_mut())?;
                trace!(mode = ?self.mode(), "diagonal: reducing local terms");
                let total = acc.all_reduce(self.rule.comm())?;
                diag.iadd(total, 1.0, false);
                Ok(())
            },
            _ => self.seq.diagonal_rec(expr, lop, rop, diag),
        }
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
        let names = names.and_then(Symbolic::as_vec)
            .ok_or_else(|| ContractError::Structure("rotated names are not a vector".into()))?;
        let mut keys: Vec<OpKey> = Vec::new();
        let mut slots: Vec<Option<BlockMatrix<Q>>> = Vec::new();
        for e in names.iter() {
            match e {
                OpExpr::Zero => { },
                OpExpr::Elem(el) => {
                    if !self.rule.available(&el.key) { continue; }
                    let src = a.ops.get(&el.key)
                        .ok_or_else(|| ContractError::MissingOperator(el.key.clone()))?;
                    let mat = if self.rule.own(&el.key) {
                        self.seq.rotate_one(src, bra, ket, left, slots.len())
                    } else {
                        SeqTensorFunctions::rotated_zeros(src, bra, ket, left)
                    };
                    slots.push(Some(mat));
                    keys.push(el.key.clone());
                },
                other => { return Err(ContractError::UnexpectedNode(other.to_string())); },
            }
        }
        self.seq.flush(&mut slots)?;
        let comm = self.rule.comm();
        for (key, slot) in keys.iter().zip(slots.iter_mut()) {
            let Some(mat) = slot.as_mut() else { continue; };
            if self.rule.repeat(key) {
                comm.broadcast_block(mat, self.rule.owner(key))?;
            }
        }
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
        let (mut slots, locality)
            = self.seq.transform_with(a, names, exprs, bases, |e, k| self.localize(e, k))?;
        let comm = self.rule.comm();
        for ((name, is_local), slot) in names.iter().zip(locality).zip(slots.iter_mut()) {
            let Some(mat) = slot.as_mut() else { continue; };
            let owner = self.rule.owner(&name.key);
            if !is_local { comm.reduce_block(mat, owner)?; }
            if self.rule.repeat(&name.key) { comm.broadcast_block(mat, owner)?; }
        }
        for (name, slot) in names.iter().zip(slots) {
            let Some(mat) = slot else { continue; };
            if self.rule.available(&name.key) {
                a.ops.allocate(name.key.clone(), mat);
            }
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
        assign_with(a, c, bases, true, |k| self.rule.available(k))
    }

    fn right_assign(
        &self,
        a: &OperatorTensor<Q>,
        c: &mut OperatorTensor<Q>,
        bases: &OpBases<Q>,
    ) -> ContractResult<()>
    {
        assign_with(a, c, bases, false, |k| self.rule.available(k))
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
        let al = a.lmat.as_ref()
            .ok_or_else(|| ContractError::Structure("left block has no lmat".into()))?;
        let bl = b.lmat.as_ref()
            .ok_or_else(|| ContractError::Structure("site has no lmat".into()))?;
        let exprs = al.multiply(bl)?;
        let OperatorTensor { lmat, ops, .. } = c;
        let names = match lmat.as_mut() {
            Some(Symbolic::Row(v)) => v,
            _ => { return Err(ContractError::Structure("lmat is not a row".into())); },
        };
        let (targets, defs) = contract_targets(names, exprs)?;
        self.rule.parallel_apply(
            &targets,
            &defs,
            |t| bases.zeros(t.q_label),
            |i, expr, mat| self.seq.tensor_product(expr, &a.ops, &b.ops, mat, bases, i),
            |slots| self.seq.flush(slots),
            ops,
        )
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
        let ar = a.rmat.as_ref()
            .ok_or_else(|| ContractError::Structure("right block has no rmat".into()))?;
        let br = b.rmat.as_ref()
            .ok_or_else(|| ContractError::Structure("site has no rmat".into()))?;
        let exprs = br.multiply(ar)?;
        let OperatorTensor { rmat, ops, .. } = c;
        let names = match rmat.as_mut() {
            Some(Symbolic::Col(v)) => v,
            _ => { return Err(ContractError::Structure("rmat is not a column".into())); },
        };
        let (targets, defs) = contract_targets(names, exprs)?;
        self.rule.parallel_apply(
            &targets,
            &defs,
            |t| bases.zeros(t.q_label),
            |i, expr, mat| self.seq.tensor_product(expr, &b.ops, &a.ops, mat, bases, i),
            |slots| self.seq.flush(slots),
            ops,
        )
    }

    fn delayed_contract(
        &self,
        a: OperatorTensor<Q>,
        b: OperatorTensor<Q>,
        op: &OpElement<Q>,
    ) -> ContractResult<DelayedOperatorTensor<Q>>
    {
        let exprs: Vec<OpExpr<Q>>
            = delayed_exprs(&a, &b)?
            .iter()
            .map(|e| self.rule.localize_expr(e, &op.key))
            .collect();
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
            return Err(ContractError::Structure(format!(
                "{} operators for {} expressions", ops.len(), exprs.len())));
        }
        let exprs: Vec<OpExpr<Q>>
            = ops.iter().zip(exprs.iter())
            .map(|(op, e)| self.rule.localize_expr(e, &op.key))
            .collect();
        Ok(DelayedOperatorTensor { ops, exprs, lopt: a, ropt: b })
    }

    fn broadcast_group(&self, mats: &mut [BlockMatrix<Q>]) -> ContractResult<()> {
        let comm = self.rule.comm();
        let root = comm.root();
        for m in mats.iter_mut() { comm.broadcast_block(m, root)?; }
        Ok(())
    }

    fn all_reduce_values(&self, vals: &mut [f64]) -> ContractResult<()> {
        Ok(self.rule.comm().all_reduce(vals)?)
    }
}
