//! Collective communication between cooperating workers.
//!
//! A [`Communicator`] connects the workers sharing one sweep. All collective
//! calls must be issued by every worker in the same order; each call returns
//! only once the data it touched is consistent on every participating
//! worker, which makes it a synchronization point for that data.
//!
//! Two implementations are provided:
//! - [`SerialComm`], the trivial single-worker communicator;
//! - [`LocalComm`], a group of in-process workers joined by a full mesh of
//!   crossbeam channels. Sums are always formed on the receiving worker in
//!   ascending rank order, so reductions are deterministic and every worker
//!   sees bitwise identical results after an all-reduce.

use crossbeam::channel;
use thiserror::Error;
use crate::{
    block::BlockMatrix,
    quantum::QLabel,
};

#[derive(Debug, Error)]
pub enum CommError {
    /// Returned when a peer has hung up.
    #[error("error in communication: worker {0} disconnected")]
    Disconnected(usize),

    /// Returned when a received buffer has the wrong length.
    #[error("error in communication: expected {expected} elements, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    /// Returned when a rank outside the group is addressed.
    #[error("error in communication: invalid rank {0}")]
    InvalidRank(usize),
}
use CommError::*;
pub type CommResult<T> = Result<T, CommError>;

/// Collective operations over flat `f64` buffers.
pub trait Communicator {
    /// Rank of this worker.
    fn rank(&self) -> usize;

    /// Number of workers.
    fn size(&self) -> usize;

    /// Rank that collects replicated results.
    fn root(&self) -> usize { 0 }

    /// Return `true` if this worker is the root.
    fn is_root(&self) -> bool { self.rank() == self.root() }

    /// Copy `data` from `owner` to every other worker.
    fn broadcast(&self, data: &mut [f64], owner: usize) -> CommResult<()>;

    /// Sum `data` over all workers into the buffer of `owner`. Buffers of
    /// other workers are left untouched.
    fn reduce_sum(&self, data: &mut [f64], owner: usize) -> CommResult<()>;

    /// Sum `data` over all workers, leaving the result on every worker.
    fn all_reduce(&self, data: &mut [f64]) -> CommResult<()> {
        let root = self.root();
        self.reduce_sum(data, root)?;
        self.broadcast(data, root)
    }

    /// Block until every worker has reached the barrier.
    fn barrier(&self) -> CommResult<()>;

    /// [`broadcast`][Self::broadcast] the data of a block matrix.
    fn broadcast_block<Q>(&self, mat: &mut BlockMatrix<Q>, owner: usize)
        -> CommResult<()>
    where
        Q: QLabel,
        Self: Sized,
    {
        self.broadcast(mat.data_mut(), owner)
    }

    /// [`reduce_sum`][Self::reduce_sum] the data of a block matrix.
    fn reduce_block<Q>(&self, mat: &mut BlockMatrix<Q>, owner: usize)
        -> CommResult<()>
    where
        Q: QLabel,
        Self: Sized,
    {
        self.reduce_sum(mat.data_mut(), owner)
    }

    /// [`all_reduce`][Self::all_reduce] the data of a block matrix.
    fn all_reduce_block<Q>(&self, mat: &mut BlockMatrix<Q>) -> CommResult<()>
    where
        Q: QLabel,
        Self: Sized,
    {
        self.all_reduce(mat.data_mut())
    }

    /// [`reduce_sum`][Self::reduce_sum] every member of a group.
    fn reduce_group<Q>(&self, group: &mut [BlockMatrix<Q>], owner: usize)
        -> CommResult<()>
    where
        Q: QLabel,
        Self: Sized,
    {
        group.iter_mut().try_for_each(|m| self.reduce_sum(m.data_mut(), owner))
    }

    /// [`all_reduce`][Self::all_reduce] every member of a group.
    fn all_reduce_group<Q>(&self, group: &mut [BlockMatrix<Q>]) -> CommResult<()>
    where
        Q: QLabel,
        Self: Sized,
    {
        group.iter_mut().try_for_each(|m| self.all_reduce(m.data_mut()))
    }
}

/// Single-worker communicator; every collective is a no-op.
#[derive(Copy, Clone, Debug, Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> usize { 0 }

    fn size(&self) -> usize { 1 }

    fn broadcast(&self, _data: &mut [f64], _owner: usize) -> CommResult<()> { Ok(()) }

    fn reduce_sum(&self, _data: &mut [f64], _owner: usize) -> CommResult<()> { Ok(()) }

    fn barrier(&self) -> CommResult<()> { Ok(()) }
}

/// One member of a group of in-process workers.
///
/// Create the whole group with [`LocalComm::group`] and move each member
/// onto its own thread.
#[derive(Debug)]
pub struct LocalComm {
    rank: usize,
    size: usize,
    to: Vec<channel::Sender<Vec<f64>>>,
    from: Vec<channel::Receiver<Vec<f64>>>,
}

impl LocalComm {
    /// Create a fully connected group of `size` workers.
    pub fn group(size: usize) -> Vec<Self> {
        let mut senders: Vec<Vec<Option<channel::Sender<Vec<f64>>>>>
            = (0..size).map(|_| (0..size).map(|_| None).collect()).collect();
        let mut receivers: Vec<Vec<Option<channel::Receiver<Vec<f64>>>>>
            = (0..size).map(|_| (0..size).map(|_| None).collect()).collect();
        for i in 0..size {
            for j in 0..size {
                let (tx, rx) = channel::unbounded();
                senders[i][j] = Some(tx);
                receivers[j][i] = Some(rx);
            }
        }
        senders.into_iter().zip(receivers)
            .enumerate()
            .map(|(rank, (to, from))| {
                Self {
                    rank,
                    size,
                    to: to.into_iter().flatten().collect(),
                    from: from.into_iter().flatten().collect(),
                }
            })
            .collect()
    }

    fn send(&self, dest: usize, data: Vec<f64>) -> CommResult<()> {
        self.to.get(dest).ok_or(InvalidRank(dest))?
            .send(data)
            .map_err(|_| Disconnected(dest))
    }

    fn recv(&self, src: usize) -> CommResult<Vec<f64>> {
        self.from.get(src).ok_or(InvalidRank(src))?
            .recv()
            .map_err(|_| Disconnected(src))
    }

    fn recv_exact(&self, src: usize, expected: usize) -> CommResult<Vec<f64>> {
        let buf = self.recv(src)?;
        if buf.len() != expected {
            return Err(LengthMismatch { expected, got: buf.len() });
        }
        Ok(buf)
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize { self.rank }

    fn size(&self) -> usize { self.size }

    fn broadcast(&self, data: &mut [f64], owner: usize) -> CommResult<()> {
        if owner >= self.size { return Err(InvalidRank(owner)); }
        if self.rank == owner {
            for dest in (0..self.size).filter(|r| *r != owner) {
                self.send(dest, data.to_vec())?;
            }
        } else {
            let buf = self.recv_exact(owner, data.len())?;
            data.copy_from_slice(&buf);
        }
        Ok(())
    }

    fn reduce_sum(&self, data: &mut [f64], owner: usize) -> CommResult<()> {
        if owner >= self.size { return Err(InvalidRank(owner)); }
        if self.rank != owner {
            return self.send(owner, data.to_vec());
        }
        let mut acc: Vec<f64> = vec![0.0; data.len()];
        for src in 0..self.size {
            if src == owner {
                acc.iter_mut().zip(data.iter()).for_each(|(a, x)| { *a += x; });
            } else {
                let buf = self.recv_exact(src, data.len())?;
                acc.iter_mut().zip(buf.iter()).for_each(|(a, x)| { *a += x; });
            }
        }
        data.copy_from_slice(&acc);
        Ok(())
    }

    fn barrier(&self) -> CommResult<()> {
        let mut token: [f64; 0] = [];
        self.reduce_sum(&mut token, self.root())?;
        self.broadcast(&mut token, self.root())
    }
}

/// Reduction state of an [`Accumulator`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccState {
    /// Holds this worker's contribution only.
    Partial,
    /// Holds the sum over all workers.
    Reduced,
}

/// A block matrix together with its reduction state.
///
/// Reducing an already-reduced accumulator does nothing, so the result of
/// [`Accumulator::all_reduce`] is stable under repetition.
#[derive(Clone, Debug)]
pub struct Accumulator<Q> {
    mat: BlockMatrix<Q>,
    state: AccState,
}

impl<Q: QLabel> Accumulator<Q> {
    /// Start a partial sum from a zero matrix.
    pub fn new(mat: BlockMatrix<Q>) -> Self { Self { mat, state: AccState::Partial } }

    pub fn state(&self) -> AccState { self.state }

    pub fn get(&self) -> &BlockMatrix<Q> { &self.mat }

    /// Mutable access to the local contribution; marks the sum partial again.
    pub fn local_mut(&mut self) -> &mut BlockMatrix<Q> {
        self.state = AccState::Partial;
        &mut self.mat
    }

    /// Sum over all workers, leaving the result everywhere.
    pub fn all_reduce<C>(&mut self, comm: &C) -> CommResult<&BlockMatrix<Q>>
    where C: Communicator
    {
        if self.state == AccState::Partial {
            comm.all_reduce_block(&mut self.mat)?;
            self.state = AccState::Reduced;
        }
        Ok(&self.mat)
    }

    /// Sum over all workers into `owner` only.
    ///
    /// Every worker leaves the accumulator in the reduced state so that the
    /// collective is not repeated; only `owner` holds meaningful data.
    pub fn reduce_to<C>(&mut self, comm: &C, owner: usize) -> CommResult<&BlockMatrix<Q>>
    where C: Communicator
    {
        if self.state == AccState::Partial {
            comm.reduce_block(&mut self.mat, owner)?;
            self.state = AccState::Reduced;
        }
        Ok(&self.mat)
    }

    pub fn into_inner(self) -> BlockMatrix<Q> { self.mat }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn local_group_all_reduce() {
        let comms = LocalComm::group(3);
        let results: Vec<Vec<f64>> = thread::scope(|s| {
            let handles: Vec<_>
                = comms.into_iter()
                .map(|comm| s.spawn(move || {
                    let r = comm.rank() as f64;
                    let mut data = vec![r, 10.0 * r];
                    comm.all_reduce(&mut data).unwrap();
                    comm.barrier().unwrap();
                    data
                }))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for data in results.iter() {
            assert_eq!(data, &vec![3.0, 30.0]);
        }
    }

    #[test]
    fn reduce_only_touches_owner() {
        let comms = LocalComm::group(2);
        let results: Vec<Vec<f64>> = thread::scope(|s| {
            let handles: Vec<_>
                = comms.into_iter()
                .map(|comm| s.spawn(move || {
                    let mut data = vec![1.0 + comm.rank() as f64];
                    comm.reduce_sum(&mut data, 1).unwrap();
                    data
                }))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results, vec![vec![1.0], vec![3.0]]);
    }
}
