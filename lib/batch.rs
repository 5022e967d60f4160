//! Deferred evaluation of independent block micro-operations.
//!
//! In [`SeqMode::Simple`] and [`SeqMode::Auto`] the contraction engine does
//! not evaluate tensor products, rotations and scaled additions as it walks an
//! expression; it queues them as [`MicroOp`]s and evaluates the whole queue
//! at a flush point. No ordering is guaranteed among queued operations, only
//! that every result has landed in its destination when the flush returns.
//! `Simple` mode evaluates the queue on the calling thread; `Auto` mode
//! spreads it over a [`BatchPool`].

use std::thread;
use crossbeam::channel;
use thiserror::Error;
use crate::{
    basis::FusedBasis,
    block::{ self, BlockInfo, BlockMatrix },
    quantum::QLabel,
};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to enqueue micro-operations: dead thread")]
    DeadThread,

    #[error("failed to enqueue micro-operations: closed sender channel")]
    ClosedSenderChannel,

    #[error("failed to receive micro-operation result: receiver error: {0}")]
    ClosedReceiverChannel(channel::RecvError),

    #[error("encountered receiver error from within a thread: receiver error: {0}")]
    WorkerReceiverError(channel::RecvError),
}
use PoolError::*;
pub type PoolResult<T> = Result<T, PoolError>;

/// Evaluation strategy of the contraction engine.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum SeqMode {
    /// Evaluate every operation immediately.
    #[default]
    None,
    /// Queue operations and evaluate them in order at each flush.
    Simple,
    /// Queue operations and evaluate them on a thread pool at each flush.
    Auto,
}

impl SeqMode {
    /// Return `true` if `self` is `None`.
    pub fn is_none(self) -> bool { matches!(self, Self::None) }

    /// Return `true` if `self` is `Auto`.
    pub fn is_auto(self) -> bool { matches!(self, Self::Auto) }
}

/// A self-contained block operation writing into destination slot `dest`.
#[derive(Clone, Debug)]
pub enum MicroOp<Q> {
    /// `dest += factor * op(a) ⊗ op(b)` on fused bases.
    TensorProduct {
        a: BlockMatrix<Q>,
        trans_a: bool,
        b: BlockMatrix<Q>,
        trans_b: bool,
        row: FusedBasis<Q>,
        col: FusedBasis<Q>,
        factor: f64,
        dest: usize,
        info: BlockInfo<Q>,
    },
    /// `dest += bra† a ket`, see [`block::rotate`].
    Rotate {
        a: BlockMatrix<Q>,
        bra: BlockMatrix<Q>,
        ket: BlockMatrix<Q>,
        left: bool,
        dest: usize,
        info: BlockInfo<Q>,
    },
    /// `dest += factor * op(src)`.
    Iadd {
        src: BlockMatrix<Q>,
        factor: f64,
        trans: bool,
        dest: usize,
        info: BlockInfo<Q>,
    },
}

impl<Q: QLabel> MicroOp<Q> {
    /// Destination slot of the result.
    pub fn dest(&self) -> usize {
        match self {
            Self::TensorProduct { dest, .. } => *dest,
            Self::Rotate { dest, .. } => *dest,
            Self::Iadd { dest, .. } => *dest,
        }
    }

    /// Evaluate into a fresh matrix, returning it with the flop count.
    pub fn execute(&self) -> (BlockMatrix<Q>, usize) {
        match self {
            Self::TensorProduct {
                a, trans_a, b, trans_b, row, col, factor, info, ..
            } => {
                let mut out = BlockMatrix::zeros(info.clone());
                let flops = block::tensor_product(
                    a, *trans_a, b, *trans_b, &mut out, row, col, *factor);
                (out, flops)
            },
            Self::Rotate { a, bra, ket, left, info, .. } => {
                let mut out = BlockMatrix::zeros(info.clone());
                let flops = block::rotate(a, bra, ket, &mut out, *left);
                (out, flops)
            },
            Self::Iadd { src, factor, trans, info, .. } => {
                let mut out = BlockMatrix::zeros(info.clone());
                out.iadd(src, *factor, *trans);
                (out, src.len())
            },
        }
    }
}

#[allow(clippy::large_enum_variant)]
#[derive(Clone, Debug)]
enum ToWorker<Q> {
    Stop,
    Work(MicroOp<Q>),
}

#[allow(clippy::large_enum_variant)]
#[derive(Clone, Debug)]
enum FromWorker<Q> {
    RecvError(channel::RecvError),
    Output(usize, BlockMatrix<Q>, usize),
}

/// A simple thread pool to evaluate batches of micro-operations in parallel.
///
/// Workload between threads is automatically balanced by means of a
/// single-producer, multiple-consumer channel. Results are returned in the
/// order in which the operations finished, tagged with their destination
/// slot. The pool is meant to be reused between batches and is **not**
/// thread-safe.
#[derive(Debug)]
pub struct BatchPool<Q> {
    threads: Vec<thread::JoinHandle<()>>,
    workers_in: channel::Sender<ToWorker<Q>>,
    workers_out: channel::Receiver<FromWorker<Q>>,
}

impl<Q: QLabel> BatchPool<Q> {
    /// Create a new thread pool of `nthreads` threads.
    pub fn new(nthreads: usize) -> Self {
        let (tx_in, rx_in) = channel::unbounded();
        let (tx_out, rx_out) = channel::unbounded();
        let mut threads = Vec::with_capacity(nthreads);
        for _ in 0..nthreads {
            let worker_receiver: channel::Receiver<ToWorker<Q>> = rx_in.clone();
            let worker_sender: channel::Sender<FromWorker<Q>> = tx_out.clone();
            let th = thread::spawn(move || loop {
                match worker_receiver.recv() {
                    Ok(ToWorker::Stop) => { break; },
                    Ok(ToWorker::Work(op)) => {
                        let dest = op.dest();
                        let (out, flops) = op.execute();
                        match worker_sender.send(FromWorker::Output(dest, out, flops)) {
                            Ok(()) => { continue; },
                            Err(err) => { panic!("sender error: {err}"); },
                        }
                    },
                    Err(err) => {
                        match worker_sender.send(FromWorker::RecvError(err)) {
                            Ok(()) => { panic!("receiver error"); },
                            Err(_) => { panic!("sender error: {err}"); },
                        }
                    },
                }
            });
            threads.push(th);
        }
        Self { threads, workers_in: tx_in, workers_out: rx_out }
    }

    /// Create a new thread pool with the number of threads equal to the number
    /// of logical CPU cores available in the current system.
    pub fn new_cpus() -> Self { Self::new(num_cpus::get()) }

    /// Number of worker threads.
    pub fn nthreads(&self) -> usize { self.threads.len() }

    /// Enqueue a batch of micro-operations to be distributed across all
    /// threads, returning `(dest, result, flops)` triples.
    ///
    /// This method will block until all enqueued operations have been
    /// completed.
    pub fn do_batch<I>(&self, ops: I) -> PoolResult<Vec<(usize, BlockMatrix<Q>, usize)>>
    where I: IntoIterator<Item = MicroOp<Q>>
    {
        if self.threads.iter().any(|th| th.is_finished()) {
            return Err(DeadThread);
        }
        let mut count: usize = 0;
        for op in ops.into_iter() {
            match self.workers_in.send(ToWorker::Work(op)) {
                Ok(()) => { count += 1; },
                Err(_) => { return Err(ClosedSenderChannel); },
            }
        }
        let mut output = Vec::with_capacity(count);
        for _ in 0..count {
            match self.workers_out.recv() {
                Ok(FromWorker::Output(dest, out, flops)) => {
                    output.push((dest, out, flops));
                },
                Ok(FromWorker::RecvError(err)) => {
                    return Err(WorkerReceiverError(err));
                },
                Err(err) => { return Err(ClosedReceiverChannel(err)); },
            }
        }
        Ok(output)
    }
}

impl<Q> Drop for BatchPool<Q> {
    fn drop(&mut self) {
        (0..self.threads.len())
            .for_each(|_| { self.workers_in.send(ToWorker::Stop).ok(); });
        self.threads.drain(..)
            .for_each(|th| { th.join().ok(); });
    }
}

/// Queue of deferred micro-operations for one evaluation mode.
#[derive(Debug)]
pub struct BatchQueue<Q> {
    mode: SeqMode,
    pool: Option<BatchPool<Q>>,
    queue: Vec<MicroOp<Q>>,
}

impl<Q: QLabel> BatchQueue<Q> {
    /// Create a queue for `mode`, starting a pool of `nthreads` threads in
    /// `Auto` mode.
    pub fn new(mode: SeqMode, nthreads: usize) -> Self {
        let pool = mode.is_auto().then(|| BatchPool::new(nthreads.max(1)));
        Self { mode, pool, queue: Vec::new() }
    }

    pub fn mode(&self) -> SeqMode { self.mode }

    /// Number of queued operations.
    pub fn len(&self) -> usize { self.queue.len() }

    /// Return `true` if nothing is queued.
    pub fn is_empty(&self) -> bool { self.queue.is_empty() }

    /// Queue `op`.
    pub fn push(&mut self, op: MicroOp<Q>) { self.queue.push(op); }

    /// Evaluate every queued operation, adding each result into its
    /// destination slot, and return the total flop count.
    ///
    /// Results whose slot is empty are dropped.
    pub fn flush(&mut self, dests: &mut [Option<BlockMatrix<Q>>]) -> PoolResult<usize> {
        if self.queue.is_empty() { return Ok(0); }
        let ops: Vec<MicroOp<Q>> = std::mem::take(&mut self.queue);
        let results: Vec<(usize, BlockMatrix<Q>, usize)>
            = match self.pool.as_ref() {
                Some(pool) => pool.do_batch(ops)?,
                None => ops.iter()
                    .map(|op| {
                        let (out, flops) = op.execute();
                        (op.dest(), out, flops)
                    })
                    .collect(),
            };
        let mut total: usize = 0;
        for (dest, out, flops) in results.into_iter() {
            total += flops;
            if let Some(Some(mat)) = dests.get_mut(dest) {
                mat.iadd(&out, 1.0, false);
            }
        }
        Ok(total)
    }

    /// [`flush`][Self::flush] into a single destination.
    pub fn flush_into(&mut self, dest: &mut BlockMatrix<Q>) -> PoolResult<usize> {
        let mut slot = [Some(std::mem::replace(dest, BlockMatrix::zeros(dest.info().clone())))];
        let res = self.flush(&mut slot);
        if let Some(mat) = slot[0].take() { *dest = mat; }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ basis::BondBasis, quantum::U1 };
    use rand::{ SeedableRng, rngs::StdRng };

    fn op(rng: &mut StdRng, dest: usize) -> (MicroOp<U1>, BlockInfo<U1>) {
        let basis = BondBasis::from_pairs([(U1(0), 3), (U1(2), 2)]);
        let info = BlockInfo::operator(basis.clone(), basis, U1(0));
        let src = BlockMatrix::random(info.clone(), rng);
        (MicroOp::Iadd { src, factor: 2.0, trans: true, dest, info: info.clone() }, info)
    }

    #[test]
    fn pool_and_sequential_flush_agree() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut simple: BatchQueue<U1> = BatchQueue::new(SeqMode::Simple, 0);
        let mut auto: BatchQueue<U1> = BatchQueue::new(SeqMode::Auto, 3);
        let mut info = None;
        for k in 0..10 {
            let (o, i) = op(&mut rng, k % 2);
            simple.push(o.clone());
            auto.push(o);
            info = Some(i);
        }
        let info = info.unwrap();
        let mut a = vec![Some(BlockMatrix::zeros(info.clone())), Some(BlockMatrix::zeros(info.clone()))];
        let mut b = a.clone();
        let fa = simple.flush(&mut a).unwrap();
        let fb = auto.flush(&mut b).unwrap();
        assert_eq!(fa, fb);
        for (x, y) in a.iter().zip(b.iter()) {
            let (x, y) = (x.as_ref().unwrap(), y.as_ref().unwrap());
            for (p, q) in x.data().iter().zip(y.data()) {
                approx::assert_abs_diff_eq!(p, q, epsilon = 1e-12);
            }
        }
        assert!(simple.is_empty() && auto.is_empty());
    }
}
