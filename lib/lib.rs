#![allow(non_snake_case, non_upper_case_globals)]

//! Sweep algorithms on matrix product states with block-sparse, symmetry
//! labelled tensors.
//!
//! A two-site window is moved along an open chain. At every position the
//! environment blocks on either side are combined with the chain operator
//! into an effective operator of the window, a local problem is solved, and
//! the window is split again under a bond-dimension budget. The local
//! problem decides the algorithm:
//!
//! - [`dmrg`]: lowest eigenstates (one or several roots).
//! - [`imaginary_te`]: `exp(-β H) |ψ⟩`.
//! - [`compress`]: best fit of `O |ψ⟩` with fewer states.
//! - [`expect`]: expectation values and local correlation tables.
//!
//! Operators are kept symbolic ([`expr`], [`symbolic`], [`mpo`]) and
//! evaluated by a contraction engine ([`functions`]) that can split the work
//! across cooperating workers under a fixed ownership rule ([`rule`],
//! [`comm`], [`parallel_functions`]).

pub mod quantum;
pub mod basis;
pub mod block;
pub mod arena;
pub mod op_arena;

pub mod expr;
pub mod symbolic;
pub mod operator;

pub mod comm;
pub mod rule;
pub mod batch;
pub mod connection;
pub mod functions;
pub mod parallel_functions;

pub mod store;
pub mod decompose;
pub mod mps;
pub mod model;
pub mod mpo;

pub mod environment;
pub mod solver;
pub mod effective;
pub mod sweep;
pub mod dmrg;
pub mod imaginary_te;
pub mod compress;
pub mod expect;

pub use crate::{
    compress::{ Compress, CompressOptions },
    dmrg::{ Dmrg, DmrgOptions },
    expect::{ Expect, ExpectOptions },
    functions::{ SeqTensorFunctions, TensorFunctions },
    imaginary_te::{ ImaginaryTe, ImaginaryTeOptions, TeMode },
    mpo::Mpo,
    mps::{ Mps, MpsInfo },
    parallel_functions::ParallelTensorFunctions,
    quantum::{ QLabel, U1 },
    sweep::{ Interrupt, Schedule, SweepError, SweepResult },
};
