//! Symbolic matrix product operators.
//!
//! An [`Mpo`] holds, for every site, an [`OperatorTensor`] whose `lmat` and
//! `rmat` describe how the site extends a left or right environment block,
//! together with the numeric site operators they name. For every bond the
//! names of the operators a left block ending there (`left_names[i]` covers
//! sites `0..=i`) and a right block starting there (`right_names[j]` covers
//! sites `j..n`) provides are listed as well.
//!
//! For the XXZ chain the blocks carry the five names
//! ```text
//! left:  [ H, Sp[i], Sm[i], Sz[i], I ]
//! right: [ I, Cp[j], Cm[j], Cz[j], H ]
//! ```
//! with the complementary operators `Cp = J/2 Sm`, `Cm = J/2 Sp`,
//! `Cz = Jz Sz` acting on the first site of the right block, so that the
//! Hamiltonian at any bond is the row-times-column product of the two name
//! vectors.
//!
//! Optionally the normal operators of one left block are replaced by
//! pre-scaled auxiliary operators `X(k)` through a numerical transform
//! ([`MpoTransform`]); the couplings then move from the right block's site
//! matrix into the transformed names.

use crate::{
    basis::BondBasis,
    block::BlockMatrix,
    expr::{ OpElement, OpExpr, OpKey, OpName, OpProduct },
    model::{ self, Xxz },
    op_arena::OpArena,
    operator::OperatorTensor,
    quantum::{ QLabel, U1 },
    symbolic::Symbolic,
};

/// Replacement of the names of one left block by linear combinations of
/// them, applied right after the block is enlarged at `site`.
#[derive(Clone, Debug, PartialEq)]
pub struct MpoTransform<Q> {
    pub site: usize,
    /// Names of the enlarged block before the transform.
    pub source: Vec<OpElement<Q>>,
    /// Names after the transform.
    pub names: Vec<OpElement<Q>>,
    /// Definition of every entry of `names` in terms of `source`.
    pub exprs: Vec<OpExpr<Q>>,
}

/// Chain operator in symbolic form.
#[derive(Clone, Debug)]
pub struct Mpo<Q> {
    pub n_sites: usize,
    pub site_bases: Vec<BondBasis<Q>>,
    pub tensors: Vec<OperatorTensor<Q>>,
    pub left_names: Vec<Vec<OpElement<Q>>>,
    pub right_names: Vec<Vec<OpElement<Q>>>,
    /// Name of the whole operator.
    pub op: OpElement<Q>,
    /// Constant added to every value of the operator.
    pub const_e: f64,
    pub transform: Option<MpoTransform<Q>>,
    /// Local operator measured by a probe operator (see [`Mpo::window_ops`]).
    pub probe: Option<OpName>,
}

impl<Q: QLabel> Mpo<Q> {
    /// Names a left block ending at `i` carries right after enlargement,
    /// before any transform.
    pub fn contract_names(&self, i: usize) -> &[OpElement<Q>] {
        match &self.transform {
            Some(t) if t.site == i => &t.source,
            _ => &self.left_names[i],
        }
    }

    /// Transform applied to the left block enlarged at `i`, if any.
    pub fn transform_at(&self, i: usize) -> Option<&MpoTransform<Q>> {
        self.transform.as_ref().filter(|t| t.site == i)
    }

    /// Local operators measured on the window `(i, i + 1)` by a probe
    /// operator, with their definitions in terms of the left block ending
    /// at `i` and the right block starting at `i + 1`.
    ///
    /// Every window yields `P[i]` and `P[i, i + 1]`; the last window also
    /// yields `P[i + 1]`. Returns `None` for operators without a probe.
    pub fn window_ops(&self, i: usize) -> Option<(Vec<OpElement<Q>>, Vec<OpExpr<Q>>)> {
        let probe = self.probe?;
        let l = &self.left_names[i];
        let r = &self.right_names[i + 1];
        let find = |names: &[OpElement<Q>], name: OpName| -> Option<OpElement<Q>> {
            names.iter().find(|e| e.name() == name).cloned()
        };
        let (li, lp) = (find(l, OpName::I)?, find(l, probe)?);
        let (ri, rp) = (find(r, OpName::I)?, find(r, probe)?);
        let (i16_, j16) = (i as u16, (i + 1) as u16);
        let prod = |a: &OpElement<Q>, b: &OpElement<Q>| OpExpr::Prod(OpProduct::new(a, b, 0));
        let mut ops = vec![
            OpElement::new(probe, &[i16_], lp.q_label, 1.0),
            OpElement::new(probe, &[i16_, j16], lp.q_label + rp.q_label, 1.0),
        ];
        let mut exprs = vec![prod(&lp, &ri), prod(&lp, &rp)];
        if i + 2 == self.n_sites {
            ops.push(OpElement::new(probe, &[j16], rp.q_label, 1.0));
            exprs.push(prod(&li, &rp));
        }
        Some((ops, exprs))
    }
}

fn el(name: OpName, site: usize, q: U1, f: f64) -> OpExpr<U1> {
    OpExpr::Elem(OpElement::new(name, &[site as u16], q, f))
}

fn id(f: f64) -> OpExpr<U1> {
    OpExpr::Elem(OpElement { factor: f, ..OpElement::identity() })
}

fn names(list: &[(OpName, Option<usize>, U1)]) -> Vec<OpElement<U1>> {
    list.iter()
        .map(|(name, site, q)| {
            let sites: Vec<u16> = site.iter().map(|s| *s as u16).collect();
            OpElement::new(*name, &sites, *q, 1.0)
        })
        .collect()
}

fn xxz_left_names(i: usize) -> Vec<OpElement<U1>> {
    names(&[
        (OpName::H, None, U1(0)),
        (OpName::Sp, Some(i), U1(2)),
        (OpName::Sm, Some(i), U1(-2)),
        (OpName::Sz, Some(i), U1(0)),
        (OpName::I, None, U1(0)),
    ])
}

fn xxz_right_names(j: usize) -> Vec<OpElement<U1>> {
    names(&[
        (OpName::I, None, U1(0)),
        (OpName::Cp, Some(j), U1(-2)),
        (OpName::Cm, Some(j), U1(2)),
        (OpName::Cz, Some(j), U1(0)),
        (OpName::H, None, U1(0)),
    ])
}

fn transformed_names(i: usize) -> Vec<OpElement<U1>> {
    names(&[
        (OpName::H, None, U1(0)),
        (OpName::X(0), Some(i), U1(2)),
        (OpName::X(1), Some(i), U1(-2)),
        (OpName::X(2), Some(i), U1(0)),
        (OpName::I, None, U1(0)),
    ])
}

fn matrix(n: usize, entries: Vec<(usize, usize, OpExpr<U1>)>) -> Symbolic<U1> {
    let entries = entries.into_iter().filter(|(_, _, e)| !e.is_zero()).collect();
    Symbolic::Matrix { nrows: n, ncols: n, entries }
}

fn pass_through(n: usize) -> Symbolic<U1> {
    matrix(n, (0..n).map(|k| (k, k, id(1.0))).collect())
}

/// Layout of the physical and ancilla sites of a chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Layout {
    Plain,
    Ancilla,
}

impl Layout {
    fn n_sites(self, n_phys: usize) -> usize {
        match self {
            Self::Plain => n_phys,
            Self::Ancilla => 2 * n_phys,
        }
    }

    fn is_physical(self, i: usize) -> bool {
        match self {
            Self::Plain => true,
            Self::Ancilla => i % 2 == 0,
        }
    }
}

impl Mpo<U1> {
    /// XXZ Hamiltonian on `n` spins.
    pub fn xxz(n: usize, params: Xxz) -> Self { Self::build_xxz(n, params, Layout::Plain, None) }

    /// XXZ Hamiltonian on `n` spins, with the normal operators of the left
    /// block ending at `site` collapsed into pre-scaled auxiliary operators.
    ///
    /// *Panics* if `site + 1` is not an inner bond of the chain.
    pub fn xxz_with_transform(n: usize, params: Xxz, site: usize) -> Self {
        assert!(site + 2 < n, "transform site {} leaves no inner bond on {} sites", site, n);
        Self::build_xxz(n, params, Layout::Plain, Some(site))
    }

    /// XXZ Hamiltonian on `n_phys` physical spins interleaved with ancilla
    /// spins on which it acts as the identity.
    pub fn xxz_with_ancilla(n_phys: usize, params: Xxz) -> Self {
        Self::build_xxz(n_phys, params, Layout::Ancilla, None)
    }

    fn build_xxz(n_phys: usize, p: Xxz, layout: Layout, transform: Option<usize>) -> Self {
        let n = layout.n_sites(n_phys);
        let (hj, jz, h) = (p.j / 2.0, p.jz, p.h);
        let left_names: Vec<Vec<OpElement<U1>>>
            = (0..n)
            .map(|i| if transform == Some(i) { transformed_names(i) } else { xxz_left_names(i) })
            .collect();
        let right_names: Vec<Vec<OpElement<U1>>> = (0..n).map(xxz_right_names).collect();
        // the right block right after the transformed bond carries unit couplings
        let unit_right = transform.map(|t| t + 1);
        let mut tensors: Vec<OperatorTensor<U1>> = Vec::with_capacity(n);
        for i in 0..n {
            let phys = layout.is_physical(i);
            let lmat = if !phys {
                pass_through(5)
            } else if i == 0 {
                Symbolic::Row(vec![
                    el(OpName::Sz, i, U1(0), h),
                    el(OpName::Sp, i, U1(2), 1.0),
                    el(OpName::Sm, i, U1(-2), 1.0),
                    el(OpName::Sz, i, U1(0), 1.0),
                    id(1.0),
                ])
            } else {
                // rows are the names of the block ending at i - 1
                let (cp, cm, cz) = if transform == Some(i - 1) { (1.0, 1.0, 1.0) } else { (hj, hj, jz) };
                matrix(5, vec![
                    (0, 0, id(1.0)),
                    (1, 0, el(OpName::Sm, i, U1(-2), cp)),
                    (2, 0, el(OpName::Sp, i, U1(2), cm)),
                    (3, 0, el(OpName::Sz, i, U1(0), cz)),
                    (4, 0, el(OpName::Sz, i, U1(0), h)),
                    (4, 1, el(OpName::Sp, i, U1(2), 1.0)),
                    (4, 2, el(OpName::Sm, i, U1(-2), 1.0)),
                    (4, 3, el(OpName::Sz, i, U1(0), 1.0)),
                    (4, 4, id(1.0)),
                ])
            };
            let last = i + 1 == n;
            let rmat = if !phys && last {
                Symbolic::Col(vec![id(1.0), OpExpr::Zero, OpExpr::Zero, OpExpr::Zero, OpExpr::Zero])
            } else if !phys {
                pass_through(5)
            } else if last {
                Symbolic::Col(vec![
                    id(1.0),
                    el(OpName::Sm, i, U1(-2), hj),
                    el(OpName::Sp, i, U1(2), hj),
                    el(OpName::Sz, i, U1(0), jz),
                    el(OpName::Sz, i, U1(0), h),
                ])
            } else {
                // complementary names of this block, and the couplings to
                // the complementary names of the block starting at i + 1
                let own = if unit_right == Some(i) { (1.0, 1.0, 1.0) } else { (hj, hj, jz) };
                let next = if unit_right == Some(i + 1) { (hj, hj, jz) } else { (1.0, 1.0, 1.0) };
                matrix(5, vec![
                    (0, 0, id(1.0)),
                    (1, 0, el(OpName::Sm, i, U1(-2), own.0)),
                    (2, 0, el(OpName::Sp, i, U1(2), own.1)),
                    (3, 0, el(OpName::Sz, i, U1(0), own.2)),
                    (4, 0, el(OpName::Sz, i, U1(0), h)),
                    (4, 1, el(OpName::Sp, i, U1(2), next.0)),
                    (4, 2, el(OpName::Sm, i, U1(-2), next.1)),
                    (4, 3, el(OpName::Sz, i, U1(0), next.2)),
                    (4, 4, id(1.0)),
                ])
            };
            let ops = if phys { model::spin_site_ops(i) } else { model::ancilla_site_ops() };
            tensors.push(OperatorTensor { lmat: Some(lmat), rmat: Some(rmat), ops });
        }
        let transform = transform.map(|t| {
            let source = xxz_left_names(t);
            let names = transformed_names(t);
            let exprs = vec![
                OpExpr::Elem(source[0].clone()),
                OpExpr::Elem(OpElement { factor: hj, ..source[1].clone() }),
                OpExpr::Elem(OpElement { factor: hj, ..source[2].clone() }),
                OpExpr::Elem(OpElement { factor: jz, ..source[3].clone() }),
                OpExpr::Elem(source[4].clone()),
            ];
            MpoTransform { site: t, source, names, exprs }
        });
        Self {
            n_sites: n,
            site_bases: vec![model::spin_basis(); n],
            tensors,
            left_names,
            right_names,
            op: OpElement::new(OpName::H, &[], U1(0), 1.0),
            const_e: 0.0,
            transform,
            probe: None,
        }
    }

    /// Identity operator on the given sites, used for overlaps.
    pub fn identity(site_bases: Vec<BondBasis<U1>>) -> Self {
        let n = site_bases.len();
        let ident = vec![OpElement::identity()];
        let tensors: Vec<OperatorTensor<U1>>
            = site_bases.iter().enumerate()
            .map(|(i, b)| {
                let mut ops = OpArena::new();
                ops.allocate(OpKey::identity(), BlockMatrix::identity(b));
                let lmat = if i == 0 { Symbolic::Row(vec![id(1.0)]) } else { matrix(1, vec![(0, 0, id(1.0))]) };
                let rmat = if i + 1 == n { Symbolic::Col(vec![id(1.0)]) } else { matrix(1, vec![(0, 0, id(1.0))]) };
                OperatorTensor { lmat: Some(lmat), rmat: Some(rmat), ops }
            })
            .collect();
        Self {
            n_sites: n,
            site_bases,
            tensors,
            left_names: vec![ident.clone(); n],
            right_names: vec![ident; n],
            op: OpElement::identity(),
            const_e: 0.0,
            transform: None,
            probe: None,
        }
    }

    /// Probe operator measuring `Sz` on every site and on every pair of
    /// neighbouring sites.
    pub fn sz_probe(n: usize) -> Self {
        let left = |i: usize| names(&[(OpName::I, None, U1(0)), (OpName::Sz, Some(i), U1(0))]);
        let tensors: Vec<OperatorTensor<U1>>
            = (0..n)
            .map(|i| {
                let lmat = if i == 0 {
                    Symbolic::Row(vec![id(1.0), el(OpName::Sz, i, U1(0), 1.0)])
                } else {
                    matrix(2, vec![(0, 0, id(1.0)), (0, 1, el(OpName::Sz, i, U1(0), 1.0))])
                };
                let rmat = if i + 1 == n {
                    Symbolic::Col(vec![id(1.0), el(OpName::Sz, i, U1(0), 1.0)])
                } else {
                    matrix(2, vec![(0, 0, id(1.0)), (1, 0, el(OpName::Sz, i, U1(0), 1.0))])
                };
                OperatorTensor { lmat: Some(lmat), rmat: Some(rmat), ops: model::spin_site_ops(i) }
            })
            .collect();
        Self {
            n_sites: n,
            site_bases: vec![model::spin_basis(); n],
            tensors,
            left_names: (0..n).map(left).collect(),
            right_names: (0..n).map(left).collect(),
            op: OpElement::new(OpName::Sz, &[], U1(0), 1.0),
            const_e: 0.0,
            transform: None,
            probe: Some(OpName::Sz),
        }
    }

    /// Set the constant added to every value of the operator.
    pub fn with_const_e(mut self, const_e: f64) -> Self {
        self.const_e = const_e;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_matrices_match_name_vectors() {
        let mpo = Mpo::xxz(5, Xxz::default());
        for i in 1..5 {
            let lmat = mpo.tensors[i].lmat.as_ref().unwrap();
            assert_eq!(lmat.shape(), (mpo.left_names[i - 1].len(), mpo.left_names[i].len()));
        }
        for j in 0..4 {
            let rmat = mpo.tensors[j].rmat.as_ref().unwrap();
            assert_eq!(rmat.shape(), (mpo.right_names[j].len(), mpo.right_names[j + 1].len()));
        }
        assert!(mpo.tensors[0].lmat.as_ref().unwrap().is_row());
        assert!(mpo.tensors[4].rmat.as_ref().unwrap().is_col());
    }

    #[test]
    fn bond_expression_pairs_names() {
        let mpo = Mpo::xxz(4, Xxz::new(1.0, 0.5, 0.0));
        let row = Symbolic::row_of(&mpo.left_names[1]);
        let col = Symbolic::col_of(&mpo.right_names[2]);
        let expr = row.multiply(&col).unwrap();
        assert_eq!(expr.len(), 1);
        let terms = expr[0].terms();
        assert_eq!(terms.len(), 5);
        assert!(terms.iter().all(|t| t.delta() == U1(0)));
    }

    #[test]
    fn transform_scales_normal_operators() {
        let mpo = Mpo::xxz_with_transform(6, Xxz::new(2.0, 3.0, 0.0), 2);
        let t = mpo.transform_at(2).unwrap();
        assert_eq!(mpo.contract_names(2), t.source.as_slice());
        assert_eq!(mpo.left_names[2], t.names);
        assert_eq!(t.exprs[1].as_elem().unwrap().factor, 1.0);
        assert_eq!(t.exprs[3].as_elem().unwrap().factor, 3.0);
        assert!(mpo.transform_at(3).is_none());
        assert_eq!(mpo.contract_names(3), mpo.left_names[3].as_slice());
    }

    #[test]
    fn probe_window_ops() {
        let mpo = Mpo::sz_probe(4);
        let (ops, exprs) = mpo.window_ops(1).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(exprs.len(), 2);
        let (ops, _) = mpo.window_ops(2).unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[2].key.sites, vec![3]);
        assert!(Mpo::xxz(4, Xxz::default()).window_ops(1).is_none());
    }
}
