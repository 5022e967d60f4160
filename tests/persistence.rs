mod common;

use approx::assert_abs_diff_eq;
use block_sweep::{
    dmrg::{ Dmrg, DmrgOptions },
    expect::{ Expect, ExpectOptions },
    functions::SeqTensorFunctions,
    model::Xxz,
    mpo::Mpo,
    mps::Mps,
    quantum::U1,
    store::{ StoreKey, TensorStore },
};

#[test]
fn out_of_core_dmrg_round_trips_through_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let n = 8;
    let params = Xxz::new(1.0, 0.7, 0.0);
    let mpo = Mpo::xxz(n, params);
    let tf = SeqTensorFunctions::default();
    let mps_store = TensorStore::new(dir.path(), "mps").unwrap();
    let env_store = mps_store.with_tag("env");
    let mut mps = common::random_state(n, 8, 0, 1, 2).with_store(mps_store.clone());
    let opts = DmrgOptions::default()
        .with_bond_dims(vec![16])
        .with_noises(vec![1e-5, 0.0]);
    let energy = Dmrg::new(&mpo, &tf, opts)
        .with_store(env_store.clone())
        .solve(&mut mps, 8, true, 1e-10)
        .unwrap();
    assert_abs_diff_eq!(energy, common::sector_levels(params, n)[0], epsilon = 1e-8);
    // isometries away from the center were evicted along the way
    assert!((0..n).any(|i| !mps.is_loaded(i)));
    assert!((0..=n).any(|k| env_store.contains(StoreKey::LeftEnv(k))
        || env_store.contains(StoreKey::RightEnv(k))));

    mps.save().unwrap();
    let mut reloaded: Mps<U1> = Mps::load(mps_store).unwrap();
    assert_eq!(reloaded.canonical_form(), mps.canonical_form());
    assert_eq!(reloaded.info.left_dims, mps.info.left_dims);
    assert_eq!(reloaded.info.right_dims, mps.info.right_dims);
    let (a, b) = (reloaded.to_dense().unwrap(), mps.to_dense().unwrap());
    for (x, y) in a.iter().zip(b.iter()) {
        assert_abs_diff_eq!(*x, *y, epsilon = 1e-14);
    }

    let mut ex = Expect::new(&mpo, &tf, ExpectOptions::default());
    let value = ex.solve(&mut reloaded, false, true).unwrap();
    assert_abs_diff_eq!(value, energy, epsilon = 1e-7);
}
