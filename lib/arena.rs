//! Two-frame stack arena accounting for the numeric storage of a sweep.
//!
//! Large block tensors are leased from one of two frames: the *active* frame
//! holds data that survives a whole blocking step (the two-site wavefunction,
//! environment blocks being rebuilt), while the *scratch* frame holds
//! short-lived intermediates (density matrices, Krylov vectors). Within a
//! frame, leases must be returned in reverse order of acquisition:
//! ```text
//! lease a ─┐
//! lease b ─┼─┐
//!          │ └─ release b
//!          └─── release a
//! ```
//! Releasing out of order is a programming error and panics. An
//! [`ArenaScope`] records the top of a frame when it is opened and releases
//! every lease taken after that point when it is dropped, so that early
//! returns through `?` leave the arena balanced.
//!
//! Storage that outlives the call that produced it is recorded with
//! [`Arena::hold`] instead: no receipt is handed out, and the lease stays
//! outstanding until the innermost open scope on its frame closes. With no
//! scope open a held lease only counts towards the peak.
//!
//! The arena is a cheap handle around shared state; clones refer to the same
//! frames.

use std::sync::{ Arc, Mutex };
use tracing::trace;

/// Memory frame selector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Frame {
    Active,
    Scratch,
}

impl Frame {
    fn idx(self) -> usize {
        match self {
            Self::Active => 0,
            Self::Scratch => 1,
        }
    }
}

/// Receipt for a block of leased storage.
///
/// Must be passed back to [`Arena::release`], or be covered by an enclosing
/// [`ArenaScope`].
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub struct Lease {
    frame: Frame,
    id: usize,
    len: usize,
}

impl Lease {
    /// Number of `f64` elements covered by the lease.
    pub fn len(&self) -> usize { self.len }

    /// Return `true` if the lease covers no elements.
    pub fn is_empty(&self) -> bool { self.len == 0 }

    pub fn frame(&self) -> Frame { self.frame }
}

#[derive(Clone, Debug, Default)]
struct FrameStack {
    stack: Vec<(usize, usize)>,
    used: usize,
    peak: usize,
    scopes: usize,
}

#[derive(Debug, Default)]
struct ArenaState {
    frames: [FrameStack; 2],
    next_id: usize,
}

/// Shared handle to a two-frame stack arena.
#[derive(Clone, Debug, Default)]
pub struct Arena {
    state: Arc<Mutex<ArenaState>>,
}

impl Arena {
    /// Create a new, empty arena.
    pub fn new() -> Self { Self::default() }

    fn with_state<F, U>(&self, f: F) -> U
    where F: FnOnce(&mut ArenaState) -> U
    {
        let mut guard
            = self.state.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Lease `len` elements from `frame`.
    pub fn lease(&self, frame: Frame, len: usize) -> Lease {
        self.with_state(|state| {
            let id = state.next_id;
            state.next_id += 1;
            let fs = &mut state.frames[frame.idx()];
            fs.stack.push((id, len));
            fs.used += len;
            fs.peak = fs.peak.max(fs.used);
            Lease { frame, id, len }
        })
    }

    /// Lease `len` elements from `frame` until the innermost open scope on
    /// `frame` is dropped.
    pub fn hold(&self, frame: Frame, len: usize) {
        self.with_state(|state| {
            let fs = &mut state.frames[frame.idx()];
            if fs.scopes == 0 {
                fs.peak = fs.peak.max(fs.used + len);
                return;
            }
            let id = state.next_id;
            state.next_id += 1;
            let fs = &mut state.frames[frame.idx()];
            fs.stack.push((id, len));
            fs.used += len;
            fs.peak = fs.peak.max(fs.used);
        })
    }

    /// Return a lease to its frame.
    ///
    /// *Panics* if `lease` is not the most recent outstanding lease of its
    /// frame.
    pub fn release(&self, lease: Lease) {
        self.with_state(|state| {
            let fs = &mut state.frames[lease.frame.idx()];
            match fs.stack.last() {
                Some(&(id, len)) if id == lease.id => {
                    fs.stack.pop();
                    fs.used -= len;
                },
                _ => {
                    panic!(
                        "arena lease {} released out of order in frame {:?}",
                        lease.id, lease.frame,
                    );
                },
            }
        })
    }

    /// Open a scope on `frame`; every lease of that frame taken while the
    /// scope is alive is released when it is dropped.
    pub fn scope(&self, frame: Frame) -> ArenaScope {
        let mark = self.with_state(|state| {
            let fs = &mut state.frames[frame.idx()];
            fs.scopes += 1;
            fs.stack.len()
        });
        ArenaScope { arena: self.clone(), frame, mark }
    }

    /// Number of elements currently leased from `frame`.
    pub fn used(&self, frame: Frame) -> usize {
        self.with_state(|state| state.frames[frame.idx()].used)
    }

    /// Largest number of elements simultaneously leased from `frame`.
    pub fn peak(&self, frame: Frame) -> usize {
        self.with_state(|state| state.frames[frame.idx()].peak)
    }

    /// Number of outstanding leases in `frame`.
    pub fn depth(&self, frame: Frame) -> usize {
        self.with_state(|state| state.frames[frame.idx()].stack.len())
    }

    fn unwind(&self, frame: Frame, mark: usize) {
        self.with_state(|state| {
            let fs = &mut state.frames[frame.idx()];
            while fs.stack.len() > mark {
                if let Some((_, len)) = fs.stack.pop() { fs.used -= len; }
            }
            fs.scopes = fs.scopes.saturating_sub(1);
        });
    }
}

/// Scoped acquisition guard created by [`Arena::scope`].
#[derive(Debug)]
pub struct ArenaScope {
    arena: Arena,
    frame: Frame,
    mark: usize,
}

impl ArenaScope {
    /// Lease from the guarded frame.
    pub fn lease(&self, len: usize) -> Lease { self.arena.lease(self.frame, len) }
}

impl Drop for ArenaScope {
    fn drop(&mut self) {
        let depth = self.arena.depth(self.frame);
        if depth > self.mark {
            trace!(frame = ?self.frame, released = depth - self.mark, "arena scope closed");
        }
        self.arena.unwind(self.frame, self.mark);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifo_release_tracks_peak() {
        let arena = Arena::new();
        let a = arena.lease(Frame::Active, 10);
        let b = arena.lease(Frame::Active, 5);
        let s = arena.lease(Frame::Scratch, 7);
        assert_eq!(arena.used(Frame::Active), 15);
        arena.release(b);
        arena.release(s);
        arena.release(a);
        assert_eq!(arena.used(Frame::Active), 0);
        assert_eq!(arena.peak(Frame::Active), 15);
        assert_eq!(arena.peak(Frame::Scratch), 7);
    }

    #[test]
    #[should_panic]
    fn out_of_order_release_panics() {
        let arena = Arena::new();
        let a = arena.lease(Frame::Scratch, 1);
        let _b = arena.lease(Frame::Scratch, 1);
        arena.release(a);
    }

    #[test]
    fn scope_releases_on_early_exit() {
        fn failing(arena: &Arena) -> Result<(), ()> {
            let scope = arena.scope(Frame::Scratch);
            let _l = scope.lease(100);
            Err(())
        }
        let arena = Arena::new();
        let keep = arena.lease(Frame::Scratch, 3);
        assert!(failing(&arena).is_err());
        assert_eq!(arena.used(Frame::Scratch), 3);
        assert_eq!(arena.peak(Frame::Scratch), 103);
        arena.release(keep);
    }

    #[test]
    fn held_leases_last_until_the_scope_closes() {
        let arena = Arena::new();
        arena.hold(Frame::Active, 4);
        assert_eq!(arena.used(Frame::Active), 0);
        assert_eq!(arena.peak(Frame::Active), 4);
        {
            let _step = arena.scope(Frame::Active);
            arena.hold(Frame::Active, 6);
            arena.hold(Frame::Active, 5);
            assert_eq!(arena.used(Frame::Active), 11);
            assert_eq!(arena.depth(Frame::Active), 2);
        }
        assert_eq!(arena.used(Frame::Active), 0);
        assert_eq!(arena.depth(Frame::Active), 0);
        assert_eq!(arena.peak(Frame::Active), 11);
    }
}
