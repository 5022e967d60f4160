//! Pieces shared by the sweep algorithms: errors, schedules, truncation
//! controls, cancellation and the range of windows visited by one sweep.
//!
//! A sweep moves a two-site window across the chain. With the center on
//! site `c` of `n`:
//! ```text
//! forward:   windows c, c + 1, ..., n - 2     (center ends on n - 1)
//! backward:  windows c - 1, c - 2, ..., 0     (center ends on 0)
//! ```
//! so that consecutive sweeps alternate direction without moving the center
//! in between.

use std::sync::{ Arc, atomic::{ AtomicBool, Ordering } };
use serde::{ Deserialize, Serialize };
use thiserror::Error;
use crate::{
    decompose::Truncation,
    environment::EnvError,
    functions::ContractError,
    mps::{ Mps, MpsError },
    quantum::QLabel,
    solver::SolverError,
    store::StoreError,
};

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("error in sweep: {0}")]
    Env(#[from] EnvError),

    #[error("error in sweep: {0}")]
    Solver(#[from] SolverError),

    #[error("error in sweep: {0}")]
    Contract(#[from] ContractError),

    #[error("error in sweep: {0}")]
    Mps(#[from] MpsError),

    #[error("error in sweep: {0}")]
    Store(#[from] StoreError),

    /// Returned when a requested mode of operation is not available.
    #[error("error in sweep: unsupported: {0}")]
    Unsupported(String),

    /// Returned when the interrupt flag was raised.
    #[error("error in sweep: interrupted before window {site}")]
    Interrupted { site: usize },

    /// Returned when two states swept together have their centers apart.
    #[error("error in sweep: bra center {bra} does not match ket center {ket}")]
    CenterMismatch { bra: usize, ket: usize },

    /// Returned when a schedule has no values.
    #[error("error in sweep: empty schedule")]
    EmptySchedule,

    /// Returned when a run is asked for no sweeps.
    #[error("error in sweep: no sweeps requested")]
    NoSweeps,

    /// Returned when a sweep in the requested direction has nothing to do.
    #[error("error in sweep: no window for center {center} (forward: {forward})")]
    NoWindow { center: usize, forward: bool },
}
use SweepError::*;
pub type SweepResult<T> = Result<T, SweepError>;

impl SweepError {
    /// Return `true` for errors leaving the run in an unusable state.
    pub fn is_structural(&self) -> bool {
        !matches!(self, Unsupported(..) | Interrupted { .. })
    }

    /// Return `true` for requests the sweep does not implement.
    pub fn is_unsupported(&self) -> bool { matches!(self, Unsupported(..)) }
}

/// Per-sweep values, the last one repeating past the end.
///
/// Deserializes from a non-empty list of values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<T>")]
pub struct Schedule<T>(Vec<T>);

impl<T: Clone + PartialEq> Schedule<T> {
    /// Create a new schedule.
    ///
    /// *Panics* if `values` is empty.
    pub fn new(values: Vec<T>) -> Self {
        assert!(!values.is_empty(), "empty schedule");
        Self(values)
    }

    /// The same value for every sweep.
    pub fn constant(value: T) -> Self { Self(vec![value]) }

    /// Value for sweep `iw`.
    pub fn get(&self, iw: usize) -> T { self.0[iw.min(self.0.len() - 1)].clone() }

    /// Value of every sweep past the end of the schedule.
    pub fn last(&self) -> T { self.get(self.0.len()) }

    /// Return `true` if sweep `iw` already uses the final value.
    pub fn is_final(&self, iw: usize) -> bool { self.get(iw) == self.last() }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl<T> TryFrom<Vec<T>> for Schedule<T> {
    type Error = SweepError;

    fn try_from(values: Vec<T>) -> SweepResult<Self> {
        if values.is_empty() { Err(EmptySchedule) } else { Ok(Self(values)) }
    }
}

/// How a two-site wavefunction is split.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecompositionKind {
    /// Eigenvectors of the reduced density matrix.
    #[default]
    DensityMatrix,
    /// Singular value decomposition of the wavefunction.
    Svd,
}

/// Windows exempt from truncation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TruncPattern {
    /// Truncate everywhere.
    #[default]
    None,
    /// Truncate only on odd windows.
    TruncAfterOdd,
    /// Truncate only on even windows.
    TruncAfterEven,
}

impl TruncPattern {
    /// Truncation for window `i` given the regular one.
    pub fn truncation(self, i: usize, trunc: Truncation) -> Truncation {
        let exempt = match self {
            Self::None => false,
            Self::TruncAfterOdd => i % 2 == 0,
            Self::TruncAfterEven => i % 2 == 1,
        };
        if exempt { Truncation::unlimited().with_cutoff(trunc.cutoff) } else { trunc }
    }
}

/// Shareable cancellation flag, polled once per window.
#[derive(Clone, Debug, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self { Self::default() }

    /// Ask every sweep holding a clone of `self` to stop.
    pub fn trigger(&self) { self.0.store(true, Ordering::SeqCst); }

    pub fn reset(&self) { self.0.store(false, Ordering::SeqCst); }

    pub fn is_triggered(&self) -> bool { self.0.load(Ordering::SeqCst) }

    pub(crate) fn check(interrupt: Option<&Self>, site: usize) -> SweepResult<()> {
        match interrupt {
            Some(flag) if flag.is_triggered() => Err(Interrupted { site }),
            _ => Ok(()),
        }
    }
}

/// Fail unless `mps` uses two-site blocking.
pub fn check_dot<Q: QLabel>(mps: &Mps<Q>) -> SweepResult<()> {
    if mps.dot == 2 {
        Ok(())
    } else {
        Err(Unsupported(format!("{}-site blocking", mps.dot)))
    }
}

/// Windows visited by one sweep in the given direction.
pub fn sweep_range<Q: QLabel>(mps: &Mps<Q>, forward: bool) -> SweepResult<Vec<usize>> {
    check_dot(mps)?;
    let n = mps.n_sites();
    let c = mps.center()?;
    let windows: Vec<usize>
        = if forward {
            (c..n.saturating_sub(1)).collect()
        } else {
            (0..c).rev().collect()
        };
    if windows.is_empty() {
        Err(NoWindow { center: c, forward })
    } else {
        Ok(windows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::{ model, mps::MpsInfo, quantum::U1 };

    fn state(n: usize, center: usize) -> Mps<U1> {
        let mut rng = StdRng::seed_from_u64(0);
        let info = MpsInfo::new(vec![model::spin_basis(); n], U1(0), Some(4)).unwrap();
        Mps::random(info, center, 1, &mut rng).unwrap()
    }

    #[test]
    fn schedules_pad_with_their_last_value() {
        let s = Schedule::new(vec![10, 20, 30]);
        assert_eq!(s.get(0), 10);
        assert_eq!(s.get(2), 30);
        assert_eq!(s.get(7), 30);
        assert!(!s.is_final(1));
        assert!(s.is_final(2));
        assert!(Schedule::constant(0.0).is_final(0));
    }

    #[test]
    fn stored_schedules_must_be_non_empty() {
        let empty = bincode::serialize(&Vec::<usize>::new()).unwrap();
        assert!(bincode::deserialize::<Schedule<usize>>(&empty).is_err());
        assert!(Schedule::<usize>::try_from(Vec::new()).is_err());
        let s = Schedule::new(vec![8, 16]);
        let bytes = bincode::serialize(&s).unwrap();
        let back: Schedule<usize> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, s);
        assert_eq!(back.get(5), 16);
    }

    #[test]
    fn ranges_alternate_without_moving_the_center() {
        let mps = state(6, 2);
        assert_eq!(sweep_range(&mps, true).unwrap(), vec![2, 3, 4]);
        assert_eq!(sweep_range(&mps, false).unwrap(), vec![1, 0]);
        let first = state(6, 0);
        assert!(matches!(sweep_range(&first, false), Err(NoWindow { center: 0, forward: false })));
        let last = state(6, 5);
        assert!(sweep_range(&last, true).is_err());
    }

    #[test]
    fn single_site_blocking_is_unsupported() {
        let mut mps = state(4, 0);
        mps.dot = 1;
        let err = sweep_range(&mps, true).unwrap_err();
        assert!(err.is_unsupported());
        assert!(!err.is_structural());
    }

    #[test]
    fn trunc_pattern_exempts_alternate_windows() {
        let t = Truncation::new(4);
        assert_eq!(TruncPattern::TruncAfterOdd.truncation(0, t).bond_dim, None);
        assert_eq!(TruncPattern::TruncAfterOdd.truncation(1, t).bond_dim, Some(4));
        assert_eq!(TruncPattern::TruncAfterEven.truncation(1, t).bond_dim, None);
        assert_eq!(TruncPattern::None.truncation(1, t).bond_dim, Some(4));
    }

    #[test]
    fn interrupt_is_shared_between_clones() {
        let flag = Interrupt::new();
        let other = flag.clone();
        assert!(Interrupt::check(Some(&flag), 0).is_ok());
        other.trigger();
        assert!(matches!(Interrupt::check(Some(&flag), 3), Err(Interrupted { site: 3 })));
        flag.reset();
        assert!(!other.is_triggered());
    }
}
