mod common;

use block_sweep::{
    dmrg::{ Dmrg, DmrgOptions },
    environment::NoiseKind,
    expect::partition_weights,
    functions::SeqTensorFunctions,
    imaginary_te::{ ImaginaryTe, ImaginaryTeOptions },
    model::Xxz,
    mpo::Mpo,
    sweep::{ DecompositionKind, Interrupt, SweepError },
};

#[test]
fn raised_interrupt_stops_before_the_next_window() {
    let n = 6;
    let mpo = Mpo::xxz(n, Xxz::default());
    let tf = SeqTensorFunctions::default();
    let mut mps = common::random_state(n, 4, 0, 1, 1);
    let flag = Interrupt::new();
    let mut dmrg = Dmrg::new(&mpo, &tf, DmrgOptions::default())
        .with_interrupt(flag.clone());
    flag.trigger();
    let err = dmrg.solve(&mut mps, 4, true, 0.0).unwrap_err();
    assert!(matches!(err, SweepError::Interrupted { site: 0 }));
    assert!(!err.is_structural());
    assert!(mps.check_canonical_form().is_ok());

    flag.reset();
    assert!(dmrg.solve(&mut mps, 1, true, 0.0).is_ok());
}

#[test]
fn single_site_blocking_is_refused_by_every_driver() {
    let n = 4;
    let mpo = Mpo::xxz(n, Xxz::default());
    let tf = SeqTensorFunctions::default();
    let mut mps = common::random_state(n, 4, 0, 1, 2);
    mps.dot = 1;
    let err = Dmrg::new(&mpo, &tf, DmrgOptions::default())
        .solve(&mut mps, 2, true, 0.0)
        .unwrap_err();
    assert!(err.is_unsupported());
    let err = ImaginaryTe::new(&mpo, &tf, ImaginaryTeOptions::default())
        .solve(&mut mps, 1, 0.1, true)
        .unwrap_err();
    assert!(err.is_unsupported());
}

#[test]
fn state_averaging_restrictions() {
    let n = 4;
    let mpo = Mpo::xxz(n, Xxz::default());
    let tf = SeqTensorFunctions::default();

    let mut mps = common::random_state(n, 4, 0, 2, 3);
    let opts = DmrgOptions::default().with_decomposition(DecompositionKind::Svd);
    let err = Dmrg::new(&mpo, &tf, opts).solve(&mut mps, 1, true, 0.0).unwrap_err();
    assert!(err.is_unsupported());

    let mut mps = common::random_state(n, 4, 0, 2, 4);
    let opts = DmrgOptions::default().with_noise_kind(NoiseKind::Perturbative);
    let err = Dmrg::new(&mpo, &tf, opts).solve(&mut mps, 1, true, 0.0).unwrap_err();
    assert!(err.is_unsupported());

    let mut mps = common::random_state(n, 4, 0, 2, 5);
    let err = ImaginaryTe::new(&mpo, &tf, ImaginaryTeOptions::default())
        .solve(&mut mps, 1, 0.1, true)
        .unwrap_err();
    assert!(err.is_unsupported());
}

#[test]
fn partition_weights_sum_to_one() {
    let energies = [-3.2, -3.0, -2.1, -1.7];
    let mult = [1, 3, 5, 3];
    for beta in [0.0, 0.5, 2.0, 50.0] {
        let w = partition_weights(beta, &energies, &mult);
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-14);
        assert!(w.iter().all(|x| *x >= 0.0));
    }
    let cold = partition_weights(200.0, &energies, &mult);
    assert!(cold[0] > 1.0 - 1e-12);
}
