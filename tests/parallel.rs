mod common;

use std::thread;
use approx::assert_abs_diff_eq;
use block_sweep::{
    batch::SeqMode,
    dmrg::{ Dmrg, DmrgOptions },
    environment::NoiseKind,
    expect::{ Expect, ExpectOptions },
    functions::SeqTensorFunctions,
    model::Xxz,
    mpo::Mpo,
    parallel_functions::ParallelTensorFunctions,
    rule::ChannelRule,
};

fn options() -> DmrgOptions {
    DmrgOptions::default()
        .with_bond_dims(vec![8, 16])
        .with_noises(vec![1e-4, 0.0])
        .with_noise_kind(NoiseKind::DensityMatrix)
        .with_seed(42)
}

#[test]
fn distributed_dmrg_equals_serial() {
    let n = 8;
    let params = Xxz::new(1.0, 0.8, 0.0);
    let mpo = Mpo::xxz(n, params);
    let start = common::random_state(n, 8, 0, 1, 9);

    let tf = SeqTensorFunctions::default();
    let mut serial_mps = start.clone();
    let serial = Dmrg::new(&mpo, &tf, options())
        .solve(&mut serial_mps, 6, true, 0.0).unwrap();

    let rules = ChannelRule::local_group(3);
    let results: Vec<(f64, String)> = thread::scope(|s| {
        let handles: Vec<_>
            = rules.into_iter()
            .map(|rule| {
                let mpo = &mpo;
                let mut mps = start.clone();
                s.spawn(move || {
                    let tf = ParallelTensorFunctions::new(rule, SeqTensorFunctions::default());
                    let energy = Dmrg::new(mpo, &tf, options())
                        .solve(&mut mps, 6, true, 0.0).unwrap();
                    (energy, mps.canonical_form())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    for (energy, form) in results.iter() {
        assert_abs_diff_eq!(*energy, serial, epsilon = 1e-10);
        assert_eq!(form, &serial_mps.canonical_form());
    }
    assert_abs_diff_eq!(serial, common::sector_levels(params, n)[0], epsilon = 1e-8);
}

#[test]
fn batched_engine_equals_immediate_engine() {
    let n = 6;
    let params = Xxz::new(1.0, 1.0, 0.2);
    let mpo = Mpo::xxz(n, params);
    let start = common::random_state(n, 8, 0, 1, 4);
    let mut energies: Vec<f64> = Vec::new();
    for mode in [SeqMode::None, SeqMode::Simple, SeqMode::Auto] {
        let tf = SeqTensorFunctions::new(mode, 2);
        let mut mps = start.clone();
        energies.push(Dmrg::new(&mpo, &tf, options()).solve(&mut mps, 4, true, 0.0).unwrap());
    }
    assert_abs_diff_eq!(energies[0], energies[1], epsilon = 1e-10);
    assert_abs_diff_eq!(energies[0], energies[2], epsilon = 1e-10);
}

#[test]
fn distributed_expectation_equals_serial() {
    let n = 6;
    let mpo = Mpo::sz_probe(n);
    let start = common::random_state(n, 8, 0, 1, 12);

    let tf = SeqTensorFunctions::default();
    let mut mps = start.clone();
    let mut serial = Expect::new(&mpo, &tf, ExpectOptions::default());
    serial.solve(&mut mps, true, true).unwrap();
    let reference = serial.one_pdm(n);

    let rules = ChannelRule::local_group(2);
    let pdms: Vec<_> = thread::scope(|s| {
        let handles: Vec<_>
            = rules.into_iter()
            .map(|rule| {
                let mpo = &mpo;
                let mut mps = start.clone();
                s.spawn(move || {
                    let tf = ParallelTensorFunctions::new(rule, SeqTensorFunctions::default());
                    let mut ex = Expect::new(mpo, &tf, ExpectOptions::default());
                    ex.solve(&mut mps, true, true).unwrap();
                    ex.one_pdm(n)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    for pdm in pdms.iter() {
        for (a, b) in pdm.iter().zip(reference.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-10);
        }
    }
}
