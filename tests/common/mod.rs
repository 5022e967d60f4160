#![allow(dead_code)]

use ndarray as nd;
use ndarray_linalg::{ Eigh, UPLO };
use rand::{ SeedableRng, rngs::StdRng };
use block_sweep::{
    model::{ self, Xxz },
    mps::{ Mps, MpsInfo },
    quantum::U1,
};

/// Random spin chain state with zero total `Sz`.
pub fn random_state(n: usize, bond_dim: usize, center: usize, n_roots: usize, seed: u64)
    -> Mps<U1>
{
    let mut rng = StdRng::seed_from_u64(seed);
    let info = MpsInfo::new(vec![model::spin_basis(); n], U1(0), Some(bond_dim)).unwrap();
    Mps::random(info, center, n_roots, &mut rng).unwrap()
}

/// Eigenvalues of the XXZ chain in the zero-magnetization sector.
pub fn sector_levels(params: Xxz, n: usize) -> Vec<f64> {
    let ham = params.dense_hamiltonian(n);
    let idx: Vec<usize>
        = (0..1_usize << n)
        .filter(|i| 2 * i.count_ones() as usize == n)
        .collect();
    let sub = nd::Array2::from_shape_fn((idx.len(), idx.len()), |(a, b)| ham[[idx[a], idx[b]]]);
    let (vals, _) = sub.eigh(UPLO::Lower).unwrap();
    vals.to_vec()
}

/// Thermal energy `Tr(H e^{-βH}) / Tr(e^{-βH})` over the full spin space.
pub fn thermal_energy(params: Xxz, n: usize, beta: f64) -> f64 {
    let (vals, _) = params.dense_hamiltonian(n).eigh(UPLO::Lower).unwrap();
    let emin = vals.iter().copied().fold(f64::INFINITY, f64::min);
    let w = vals.mapv(|e| (-beta * (e - emin)).exp());
    (&w * &vals).sum() / w.sum()
}
