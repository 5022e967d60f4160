mod common;

use approx::assert_abs_diff_eq;
use rand::{ SeedableRng, rngs::StdRng };
use block_sweep::{
    compress::{ Compress, CompressOptions },
    environment::NoiseKind,
    functions::SeqTensorFunctions,
    imaginary_te::{ ImaginaryTe, ImaginaryTeOptions, TeMode },
    model::{ self, Xxz },
    mpo::Mpo,
    mps::{ Mps, MpsInfo },
    quantum::U1,
};

#[test]
fn compress_thermal_limit_state_into_a_random_target() {
    let mut ket = model::thermal_limit_state(3).unwrap();
    let n = ket.n_sites();
    let mpo = Mpo::identity(ket.info.site_bases.clone());
    let mut rng = StdRng::seed_from_u64(17);
    let info = MpsInfo::new(ket.info.site_bases.clone(), U1(0), Some(4)).unwrap();
    let mut bra = Mps::random(info, n - 1, 1, &mut rng).unwrap();
    let tf = SeqTensorFunctions::default();
    let opts = CompressOptions::default()
        .with_bra_bond_dims(vec![4])
        .with_noise_kind(NoiseKind::None);
    let mut comp = Compress::new(&mpo, &tf, opts);
    let norm = comp.solve(&mut bra, &mut ket, 10, false, 1e-7).unwrap();
    assert_abs_diff_eq!(norm, 1.0, epsilon = 1e-7);
    assert!(comp.norms.len() <= 10);
    let overlap = bra.to_dense().unwrap().dot(&ket.to_dense().unwrap());
    assert_abs_diff_eq!(overlap.abs(), 1.0, epsilon = 1e-7);
}

#[test]
fn two_site_diagonal_operator_matches_exact_propagator() {
    // H = Sz Sz is -1/4 on the whole zero-magnetization sector
    let params = Xxz::new(0.0, 1.0, 0.0);
    let mpo = Mpo::xxz(2, params);
    let tf = SeqTensorFunctions::default();
    for mode in [TeMode::TangentSpace, TeMode::Rk4] {
        let mut mps = common::random_state(2, 2, 0, 1, 1);
        let before = mps.to_dense().unwrap();
        let beta = 0.25;
        let opts = ImaginaryTeOptions::default()
            .with_mode(mode)
            .with_noise_kind(NoiseKind::None);
        let mut te = ImaginaryTe::new(&mpo, &tf, opts);
        let energies = te.solve(&mut mps, 4, beta, true).unwrap();
        for (e, nsq) in energies.iter().zip(&te.normsqs) {
            assert_abs_diff_eq!(*e, -0.25, epsilon = 1e-10);
            assert_abs_diff_eq!(*nsq, (0.5 * beta).exp(), epsilon = 1e-10);
        }
        let after = mps.to_dense().unwrap();
        assert_abs_diff_eq!(after.dot(&before).abs(), 1.0, epsilon = 1e-10);
    }
}

#[test]
fn purified_state_cools_down() {
    let n_phys = 3;
    let params = Xxz::default();
    let mpo = Mpo::xxz_with_ancilla(n_phys, params);
    let mut mps = model::thermal_limit_state(n_phys).unwrap();
    let tf = SeqTensorFunctions::default();
    let opts = ImaginaryTeOptions::default()
        .with_bond_dims(vec![16])
        .with_noise_kind(NoiseKind::None);
    let mut te = ImaginaryTe::new(&mpo, &tf, opts);
    let energies = te.solve(&mut mps, 10, 0.05, false).unwrap();
    for pair in energies.windows(2) {
        assert!(pair[1] <= pair[0] + 1e-10, "{:?}", energies);
    }
    let ground = common::thermal_energy(params, n_phys, 1e3);
    let last = *energies.last().unwrap();
    assert!(last < 0.0);
    assert!(last > ground);
    assert!(mps.check_canonical_form().is_ok());
}
