//! Precomputed block connections for one-sided operator application.
//!
//! Perturbative noise applies only one factor of every term of the window
//! Hamiltonian to the two-site wavefunction, the other side being traced
//! out. The result of a term with label shift `dq` lands in a wavefunction
//! of target `c.delta + dq`; results are collected in an output group with
//! one member per distinct target. A [`ConnectionPlan`] fixes, for every
//! distinct `(conjugation, dq)` pair appearing in the expression, which block
//! of the input feeds which block of which output and through which
//! operator block, so that the per-term work is a plain loop over
//! [`Connection`]s.

use crate::{
    block::BlockInfo,
    expr::OpExpr,
    quantum::QLabel,
};

/// One input block feeding one output block through one operator block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Connection<Q> {
    /// Block index in the input wavefunction.
    pub ic: usize,
    /// Block index in the output wavefunction.
    pub iv: usize,
    /// Row label of the operator block (after orientation).
    pub bra: Q,
    /// Column label of the operator block (after orientation).
    pub ket: Q,
}

/// All connections for one `(conjugation, dq, target)` combination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo<Q> {
    /// Position of the output wavefunction in the group.
    pub target: usize,
    pub entries: Vec<Connection<Q>>,
}

impl<Q: QLabel> ConnectionInfo<Q> {
    /// Connect the blocks of `c` to the blocks of `v` through an operator of
    /// shift `dq` acting on the row index (`trace_right`) or the column index.
    pub fn new(
        c: &BlockInfo<Q>,
        v: &BlockInfo<Q>,
        target: usize,
        dq: Q,
        trace_right: bool,
    ) -> Self
    {
        let mut entries: Vec<Connection<Q>> = Vec::new();
        for (ic, e) in c.entries().iter().enumerate() {
            if trace_right {
                for bra in e.row.fusion(dq).into_iter() {
                    if let Some(iv) = v.find(bra, e.col) {
                        entries.push(Connection { ic, iv, bra, ket: e.row });
                    }
                }
            } else {
                for bra in e.col.fusion(dq).into_iter() {
                    if let Some(iv) = v.find(e.row, bra) {
                        entries.push(Connection { ic, iv, bra, ket: e.col });
                    }
                }
            }
        }
        Self { target, entries }
    }
}

/// Sorted `(conjugation, dq)` plan with the connections of every fused
/// target label.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionPlan<Q> {
    trace_right: bool,
    plan: Vec<(bool, Q)>,
    infos: Vec<Vec<ConnectionInfo<Q>>>,
    targets: Vec<Q>,
}

impl<Q: QLabel> ConnectionPlan<Q> {
    /// Collect the distinct `(conjugation, dq)` pairs of the surviving factor
    /// of every term of `expr`, and the sorted list of output targets.
    pub fn labels(expr: &OpExpr<Q>, trace_right: bool) -> Vec<(bool, Q)> {
        let mut plan: Vec<(bool, Q)>
            = expr.terms().iter()
            .filter_map(|t| {
                if trace_right {
                    let conj = t.trans_a();
                    Some((conj, if conj { -t.a.q_label } else { t.a.q_label }))
                } else {
                    let conj = t.trans_b();
                    t.b.as_ref()
                        .map(|b| (conj, if conj { -b.q_label } else { b.q_label }))
                }
            })
            .collect();
        plan.sort();
        plan.dedup();
        plan
    }

    /// Sorted output target labels reachable from an input of label `delta`.
    pub fn target_labels(plan: &[(bool, Q)], delta: Q) -> Vec<Q> {
        let mut targets: Vec<Q>
            = plan.iter()
            .flat_map(|(_, dq)| delta.fusion(*dq))
            .collect();
        targets.sort();
        targets.dedup();
        targets
    }

    /// Build the plan for `expr` applied to an input with layout `c`, given
    /// the layouts of the output group (one per entry of `targets`).
    pub fn build(
        expr: &OpExpr<Q>,
        trace_right: bool,
        c: &BlockInfo<Q>,
        targets: &[Q],
        group: &[BlockInfo<Q>],
    ) -> Self
    {
        let plan = Self::labels(expr, trace_right);
        let infos: Vec<Vec<ConnectionInfo<Q>>>
            = plan.iter()
            .map(|(_, dq)| {
                c.delta().fusion(*dq).into_iter()
                    .filter_map(|vdq| {
                        targets.binary_search(&vdq).ok()
                            .map(|iv| ConnectionInfo::new(c, &group[iv], iv, *dq, trace_right))
                    })
                    .collect()
            })
            .collect();
        Self { trace_right, plan, infos, targets: targets.to_vec() }
    }

    pub fn trace_right(&self) -> bool { self.trace_right }

    /// Output target labels, in group order.
    pub fn targets(&self) -> &[Q] { &self.targets }

    /// Connections for a term with the given orientation and shift.
    pub fn lookup(&self, conj: bool, dq: Q) -> Option<&[ConnectionInfo<Q>]> {
        self.plan.binary_search(&(conj, dq)).ok()
            .map(|ij| self.infos[ij].as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        basis::BondBasis,
        expr::{ OpElement, OpName, OpProduct },
        quantum::U1,
    };

    #[test]
    fn plan_collects_left_shifts() {
        let sp = OpElement::new(OpName::Sp, &[0], U1(2), 1.0);
        let sm = OpElement::new(OpName::Sm, &[0], U1(-2), 1.0);
        let cp = OpElement::new(OpName::Cp, &[1], U1(-2), 1.0);
        let cm = OpElement::new(OpName::Cm, &[1], U1(2), 1.0);
        let expr = OpExpr::Sum(vec![
            OpProduct::new(&sp, &cp, 0),
            OpProduct::new(&sm, &cm, 0),
            OpProduct::new(&sp, &cp, 0),
        ]);
        let plan = ConnectionPlan::labels(&expr, true);
        assert_eq!(plan, vec![(false, U1(-2)), (false, U1(2))]);
        let targets = ConnectionPlan::target_labels(&plan, U1(0));
        assert_eq!(targets, vec![U1(-2), U1(2)]);

        let left = BondBasis::from_pairs([(U1(-1), 1), (U1(1), 1)]);
        let c = BlockInfo::wavefunction(left.clone(), left.clone(), U1(0));
        let group: Vec<BlockInfo<U1>>
            = targets.iter()
            .map(|t| BlockInfo::wavefunction(left.clone(), left.clone(), *t))
            .collect();
        let full = ConnectionPlan::build(&expr, true, &c, &targets, &group);
        let raise = full.lookup(false, U1(2)).unwrap();
        assert_eq!(raise.len(), 1);
        assert_eq!(raise[0].target, 1);
        // only the (-1, +1) block can be raised
        assert_eq!(raise[0].entries.len(), 1);
        assert!(full.lookup(true, U1(2)).is_none());
    }
}
