//! Stop-the-world coordination for call-site patching.
//!
//! Some transitions rewrite `data` and `target` together in a way no
//! release/acquire sequencing can make safe for a concurrent caller, so
//! the patcher brings every mutator thread to a safepoint first:
//! 1. Arm the stop request.
//! 2. Wait, with no timeout, until every registered mutator is safe.
//! 3. Patch while the world is stopped.
//! 4. Release all mutators unconditionally.
//!
//! A mutator is safe when it is parked at a safepoint poll or inside a
//! blocked section (I/O, foreign calls). Stops are serialized by the single
//! owning thread issuing patches; arming an already-armed coordinator is a
//! contract violation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

// =============================================================================
// Mutator State
// =============================================================================

/// Identifies one registered mutator thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutatorId(u64);

/// State of a mutator thread with respect to safepoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MutatorState {
    /// Executing managed code; must reach a poll before a stop completes.
    Running,
    /// Parked at a safepoint poll, waiting for release.
    Parked,
    /// Inside a blocked section; already safe for patching.
    Blocked,
}

impl MutatorState {
    #[inline]
    fn is_safe(self) -> bool {
        matches!(self, MutatorState::Parked | MutatorState::Blocked)
    }
}

struct Inner {
    mutators: Vec<(MutatorId, MutatorState)>,
    stop_requested: bool,
    next_id: u64,
}

impl Inner {
    fn all_safe(&self) -> bool {
        self.mutators.iter().all(|(_, state)| state.is_safe())
    }

    fn set_state(&mut self, id: MutatorId, state: MutatorState) {
        let slot = self
            .mutators
            .iter_mut()
            .find(|(m, _)| *m == id)
            .expect("mutator is not registered");
        slot.1 = state;
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Brings all registered mutator threads to a safepoint and holds them
/// there while a patch runs.
pub struct SafepointCoordinator {
    /// Fast-path mirror of `Inner::stop_requested`, written under the lock.
    stop_flag: AtomicBool,
    inner: Mutex<Inner>,
    /// Signalled by mutators when one more of them becomes safe.
    mutator_safe: Condvar,
    /// Signalled by the coordinator when the world resumes.
    resume: Condvar,
    pauses: AtomicU64,
}

impl Default for SafepointCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SafepointCoordinator {
    /// Create a coordinator with no registered mutators.
    pub fn new() -> Self {
        Self {
            stop_flag: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                mutators: Vec::new(),
                stop_requested: false,
                next_id: 0,
            }),
            mutator_safe: Condvar::new(),
            resume: Condvar::new(),
            pauses: AtomicU64::new(0),
        }
    }

    /// Register the calling thread as a mutator. The thread must poll
    /// [`park_if_requested`](Self::park_if_requested) regularly while
    /// running managed code.
    pub fn register_mutator(&self) -> MutatorId {
        let mut inner = self.inner.lock();
        let id = MutatorId(inner.next_id);
        inner.next_id += 1;
        inner.mutators.push((id, MutatorState::Running));
        id
    }

    /// Remove a mutator. Its absence may complete a pending stop.
    pub fn unregister_mutator(&self, id: MutatorId) {
        let mut inner = self.inner.lock();
        let position = inner
            .mutators
            .iter()
            .position(|(m, _)| *m == id)
            .expect("mutator is not registered");
        inner.mutators.swap_remove(position);
        if inner.stop_requested && inner.all_safe() {
            self.mutator_safe.notify_one();
        }
    }

    /// Number of registered mutators.
    pub fn mutator_count(&self) -> usize {
        self.inner.lock().mutators.len()
    }

    /// Whether a stop is currently armed.
    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    /// Stop-the-world pauses performed so far.
    #[inline]
    pub fn pause_count(&self) -> u64 {
        self.pauses.load(Ordering::Relaxed)
    }

    /// Safepoint poll. Cheap when no stop is armed; otherwise parks the
    /// calling mutator until the world resumes.
    #[inline]
    pub fn park_if_requested(&self, id: MutatorId) {
        if self.stop_flag.load(Ordering::Acquire) {
            self.park_slow(id);
        }
    }

    #[cold]
    fn park_slow(&self, id: MutatorId) {
        let mut inner = self.inner.lock();
        while inner.stop_requested {
            inner.set_state(id, MutatorState::Parked);
            if inner.all_safe() {
                self.mutator_safe.notify_one();
            }
            self.resume.wait(&mut inner);
        }
        inner.set_state(id, MutatorState::Running);
    }

    /// Enter a blocked section (I/O, foreign call). The mutator counts as
    /// safe for the whole section; leaving it waits out any stop that is
    /// still in progress.
    pub fn blocked(&self, id: MutatorId) -> BlockedSection<'_> {
        let mut inner = self.inner.lock();
        inner.set_state(id, MutatorState::Blocked);
        if inner.stop_requested && inner.all_safe() {
            self.mutator_safe.notify_one();
        }
        BlockedSection {
            coordinator: self,
            id,
        }
    }

    /// Bring every registered mutator to a safepoint.
    ///
    /// Blocks with no timeout until all mutators are safe; once requested,
    /// the stop always completes. The world resumes when the returned scope
    /// drops.
    ///
    /// # Panics
    /// Panics if a stop is already armed. Patches are serialized by the
    /// single owning thread; overlapping stops are a contract violation.
    pub fn stop_the_world(&self) -> SafepointScope<'_> {
        let mut inner = self.inner.lock();
        assert!(!inner.stop_requested, "safepoint is already armed");
        inner.stop_requested = true;
        self.stop_flag.store(true, Ordering::Release);

        while !inner.all_safe() {
            self.mutator_safe.wait(&mut inner);
        }

        self.pauses.fetch_add(1, Ordering::Relaxed);
        SafepointScope { coordinator: self }
    }

    fn resume_all(&self) {
        let mut inner = self.inner.lock();
        inner.stop_requested = false;
        self.stop_flag.store(false, Ordering::Release);
        drop(inner);
        self.resume.notify_all();
    }
}

// =============================================================================
// RAII Scopes
// =============================================================================

/// Proof that the world is stopped.
///
/// Patch entry points that rewrite both words of a call site without the
/// lock-free sequencing take `&SafepointScope`, so the requirement is in
/// the signature. Dropping the scope releases every mutator
/// unconditionally.
#[must_use = "the world resumes as soon as the scope drops"]
pub struct SafepointScope<'c> {
    coordinator: &'c SafepointCoordinator,
}

impl Drop for SafepointScope<'_> {
    fn drop(&mut self) {
        self.coordinator.resume_all();
    }
}

/// Marks a mutator safe for the duration of a blocked operation.
pub struct BlockedSection<'c> {
    coordinator: &'c SafepointCoordinator,
    id: MutatorId,
}

impl Drop for BlockedSection<'_> {
    fn drop(&mut self) {
        let mut inner = self.coordinator.inner.lock();
        // A stop may still be holding the world; rejoin only after it ends.
        while inner.stop_requested {
            self.coordinator.resume.wait(&mut inner);
        }
        inner.set_state(self.id, MutatorState::Running);
    }
}

// =============================================================================
// Tests
// =============================================================================
