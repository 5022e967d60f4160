//! Ownership rules: the partition of operators across workers.
//!
//! Every operator key is owned by exactly one worker. An operator may also be
//! *repeated*, in which case every worker keeps a copy and the owner is only
//! responsible for producing it; otherwise only the owner ever materializes
//! it. A rule is paired with the [`Communicator`] of the group it partitions.
//!
//! Expressions are localized before evaluation: each worker keeps only the
//! terms it is responsible for, wrapped in an [`OpExpr::Ref`] whose flag
//! records whether the terms of the whole expression all belong to the
//! target's owner. The flag depends only on the expression and the rule, so
//! every worker reaches the same decision about whether a reduction is
//! needed.

use crate::{
    block::BlockMatrix,
    comm::{ Communicator, LocalComm, SerialComm },
    expr::{ OpElement, OpExpr, OpKey, OpProduct },
    functions::ContractResult,
    op_arena::OpArena,
    quantum::QLabel,
};

/// Ownership data of a single operator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OpProperty {
    pub owner: usize,
    pub repeated: bool,
}

/// Partition of operator keys across the workers of a communicator.
pub trait ParallelRule {
    type Comm: Communicator;

    /// Communicator of the partitioned group.
    fn comm(&self) -> &Self::Comm;

    /// Ownership data of `key`.
    fn property(&self, key: &OpKey) -> OpProperty;

    /// Rank of the owner of `key`.
    fn owner(&self, key: &OpKey) -> usize { self.property(key).owner }

    /// Return `true` if every worker keeps a copy of `key`.
    fn repeat(&self, key: &OpKey) -> bool { self.property(key).repeated }

    /// Return `true` if this worker owns `key`.
    fn own(&self, key: &OpKey) -> bool { self.owner(key) == self.comm().rank() }

    /// Return `true` if this worker holds data for `key`.
    fn available(&self, key: &OpKey) -> bool {
        let p = self.property(key);
        p.repeated || p.owner == self.comm().rank()
    }

    /// Ranks holding data for `key`.
    fn replicas(&self, key: &OpKey) -> Vec<usize> {
        let p = self.property(key);
        if p.repeated { (0..self.comm().size()).collect() } else { vec![p.owner] }
    }

    /// Worker responsible for evaluating `term` on behalf of `target`.
    ///
    /// Terms of a non-repeated target belong to its owner. Terms of a repeated
    /// target are split by the first non-repeated factor, falling back to the
    /// target's owner.
    fn term_owner<Q>(&self, term: &OpProduct<Q>, target: &OpKey) -> usize
    where
        Q: QLabel,
        Self: Sized,
    {
        let pt = self.property(target);
        if !pt.repeated { return pt.owner; }
        term.keys()
            .map(|k| self.property(k))
            .find(|p| !p.repeated)
            .map(|p| p.owner)
            .unwrap_or(pt.owner)
    }

    /// Restrict `expr` to the terms this worker evaluates for `target`.
    ///
    /// Expressions that are already localized are returned unchanged.
    fn localize_expr<Q>(&self, expr: &OpExpr<Q>, target: &OpKey) -> OpExpr<Q>
    where
        Q: QLabel,
        Self: Sized,
    {
        if expr.is_ref() { return expr.clone(); }
        let rank = self.comm().rank();
        let owner = self.owner(target);
        let mut is_local = true;
        let mut local: Vec<OpProduct<Q>> = Vec::new();
        for term in expr.terms().into_iter() {
            let to = self.term_owner(&term, target);
            is_local &= to == owner;
            if to == rank { local.push(term); }
        }
        OpExpr::Ref(Box::new(OpExpr::from_products(local)), is_local)
    }

    /// Evaluate a batch of independent `expr -> target` jobs across owners.
    ///
    /// For every target, `alloc` creates a zero matrix; `compute(i, expr,
    /// mat)` evaluates the local part of `exprs[i]` into it. Once every local
    /// job has been issued, `flush` is called to complete any deferred work.
    /// Partial results are then reduced onto the target's owner, repeated
    /// targets are broadcast, and every result available on this worker is
    /// materialized into `dest`.
    fn parallel_apply<Q, A, F, G>(
        &self,
        targets: &[OpElement<Q>],
        exprs: &[OpExpr<Q>],
        mut alloc: A,
        mut compute: F,
        mut flush: G,
        dest: &mut OpArena<BlockMatrix<Q>>,
    ) -> ContractResult<()>
    where
        Q: QLabel,
        A: FnMut(&OpElement<Q>) -> BlockMatrix<Q>,
        F: FnMut(usize, &OpExpr<Q>, &mut BlockMatrix<Q>) -> ContractResult<()>,
        G: FnMut(&mut [Option<BlockMatrix<Q>>]) -> ContractResult<()>,
        Self: Sized,
    {
        let mut slots: Vec<Option<BlockMatrix<Q>>> = Vec::with_capacity(targets.len());
        let mut locality: Vec<bool> = Vec::with_capacity(targets.len());
        for (i, (target, expr)) in targets.iter().zip(exprs).enumerate() {
            let key = &target.key;
            let localized = self.localize_expr(expr, key);
            let (inner, is_local) = match localized {
                OpExpr::Ref(inner, is_local) => (*inner, is_local),
                other => (other, true),
            };
            locality.push(is_local);
            if !self.available(key) && is_local {
                slots.push(None);
                continue;
            }
            let mut mat = alloc(target);
            if !is_local || self.own(key) {
                compute(i, &inner, &mut mat)?;
            }
            slots.push(Some(mat));
        }
        flush(&mut slots)?;
        let comm = self.comm();
        for ((target, is_local), slot) in targets.iter().zip(locality).zip(slots.iter_mut()) {
            let Some(mat) = slot.as_mut() else { continue; };
            let owner = self.owner(&target.key);
            if !is_local { comm.reduce_block(mat, owner)?; }
            if self.repeat(&target.key) { comm.broadcast_block(mat, owner)?; }
        }
        for (target, slot) in targets.iter().zip(slots) {
            if let Some(mat) = slot {
                if self.available(&target.key) {
                    dest.allocate(target.key.clone(), mat);
                }
            }
        }
        Ok(())
    }
}

/// Trivial rule for a single worker.
#[derive(Copy, Clone, Debug, Default)]
pub struct SerialRule {
    comm: SerialComm,
}

impl SerialRule {
    pub fn new() -> Self { Self::default() }
}

impl ParallelRule for SerialRule {
    type Comm = SerialComm;

    fn comm(&self) -> &SerialComm { &self.comm }

    fn property(&self, _key: &OpKey) -> OpProperty {
        OpProperty { owner: 0, repeated: false }
    }
}

/// Rule assigning operators round-robin by communication channel.
///
/// The owner of a key is its name's channel modulo the group size. Names
/// without a channel (identities, block Hamiltonians, bond energies) are
/// repeated and produced by the root.
#[derive(Debug)]
pub struct ChannelRule<C> {
    comm: C,
}

impl<C: Communicator> ChannelRule<C> {
    pub fn new(comm: C) -> Self { Self { comm } }
}

impl ChannelRule<LocalComm> {
    /// One rule per member of a fresh in-process group of `size` workers.
    pub fn local_group(size: usize) -> Vec<Self> {
        LocalComm::group(size).into_iter().map(Self::new).collect()
    }
}

impl<C: Communicator> ParallelRule for ChannelRule<C> {
    type Comm = C;

    fn comm(&self) -> &C { &self.comm }

    fn property(&self, key: &OpKey) -> OpProperty {
        match key.name.channel() {
            Some(ch) => OpProperty { owner: ch % self.comm.size(), repeated: false },
            None => OpProperty { owner: self.comm.root(), repeated: true },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ expr::OpName, quantum::U1 };

    fn keys() -> Vec<OpKey> {
        let mut keys = vec![OpKey::identity(), OpKey::new(OpName::H, &[])];
        for s in 0..4_u16 {
            for name in [OpName::Sp, OpName::Sm, OpName::Sz, OpName::Cp, OpName::X(2)] {
                keys.push(OpKey::new(name, &[s]));
            }
        }
        keys
    }

    #[test]
    fn every_key_has_exactly_one_owner() {
        for size in 1..=4 {
            let rules = ChannelRule::local_group(size);
            for key in keys().iter() {
                let owners = rules.iter().filter(|r| r.own(key)).count();
                assert_eq!(owners, 1, "{} with {} workers", key, size);
            }
        }
    }

    #[test]
    fn localization_splits_repeated_targets() {
        let rules = ChannelRule::local_group(3);
        let el = |name, s: u16, q| OpElement::new(name, &[s], U1(q), 1.0);
        let expr = OpExpr::Sum(vec![
            OpProduct::new(&el(OpName::H, 0, 0), &OpElement::identity(), 0),
            OpProduct::new(&el(OpName::Sp, 0, 2), &el(OpName::Cp, 1, -2), 0),
            OpProduct::new(&el(OpName::Sm, 0, -2), &el(OpName::Cm, 1, 2), 0),
        ]);
        let target = OpKey::new(OpName::H, &[]);
        let counts: Vec<usize>
            = rules.iter()
            .map(|r| match r.localize_expr(&expr, &target) {
                OpExpr::Ref(inner, is_local) => {
                    assert!(!is_local);
                    inner.terms().len()
                },
                _ => panic!("expected a reference"),
            })
            .collect();
        assert_eq!(counts, vec![2, 1, 0]);
    }

    #[test]
    fn non_repeated_targets_stay_with_owner() {
        let rule = SerialRule::new();
        let el = OpElement::<U1>::new(OpName::Sm, &[3], U1(-2), 0.5);
        let expr = OpExpr::Prod(OpProduct::new(&OpElement::identity(), &el, 0));
        let OpExpr::Ref(_, is_local)
            = rule.localize_expr(&expr, &OpKey::new(OpName::Cp, &[3]))
            else { panic!("expected a reference"); };
        assert!(is_local);
    }
}
