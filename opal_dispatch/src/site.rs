//! Live dispatch sites and the call-site patching protocol.
//!
//! A call site that is already running carries two words of runtime state:
//! `data` (the dispatch record — an inline-cache guard, a class-keyed
//! cache, or nothing for a plain static call) and `target` (the entry the
//! caller jumps to). The pair jointly selects which representation of
//! arguments the callee expects, so no concurrently executing caller may
//! ever observe new `data` with an old `target` or vice versa.
//!
//! Two mutation disciplines keep the pair consistent:
//! - **Stop-the-world** for infrequent transitions (deoptimization, IC
//!   installation, debugger work): the patcher takes a [`SafepointScope`]
//!   and mutates both words in any order while nothing runs.
//! - **Lock-free sequencing** for switchable calls under concurrent
//!   execution: release-store the miss stub as the target, release-store
//!   the new data, release-store the final target. A reader that
//!   acquire-loads the target and consults data only under the miss stub
//!   (or acquire-loads data first, then target) sees only self-consistent
//!   pairings.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use opal_core::config::PatchConfig;

use crate::safepoint::SafepointScope;

// =============================================================================
// Site Kind
// =============================================================================

/// What kind of dispatch a live call site performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteKind {
    /// Direct call to one target; no dispatch data.
    Static,
    /// Inline cache with a single-class guard.
    Monomorphic,
    /// Megamorphic dispatch through a class-keyed cache.
    Switchable,
    /// Call into native code through a relay trampoline.
    Native,
}

// =============================================================================
// Dispatch Site
// =============================================================================

/// Runtime state of one live call site.
///
/// Both words are plain atomics; the site itself never blocks. Which
/// mutation discipline applies is decided by the patch entry points in
/// [`DispatchPatcher`].
#[derive(Debug)]
pub struct DispatchSite {
    kind: SiteKind,
    data: AtomicUsize,
    target: AtomicUsize,
}

/// What a caller should do after reading a site in the canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Jump to the cached target directly.
    Direct(usize),
    /// The target was the miss stub; run the lookup path with `data`.
    Miss {
        /// Dispatch record read after the miss target.
        data: usize,
    },
}

impl DispatchSite {
    /// Create a site in its initial state.
    #[inline]
    pub const fn new(kind: SiteKind, data: usize, target: usize) -> Self {
        Self {
            kind,
            data: AtomicUsize::new(data),
            target: AtomicUsize::new(target),
        }
    }

    /// The site's dispatch kind.
    #[inline]
    pub fn kind(&self) -> SiteKind {
        self.kind
    }

    /// Acquire-load the current target.
    #[inline]
    pub fn load_target(&self) -> usize {
        self.target.load(Ordering::Acquire)
    }

    /// Acquire-load the current dispatch data.
    #[inline]
    pub fn load_data(&self) -> usize {
        self.data.load(Ordering::Acquire)
    }

    /// Canonical dispatch read: acquire the target, and consult data only
    /// when the target is the miss stub.
    #[inline]
    pub fn load_for_dispatch(&self, miss_stub: usize) -> Dispatch {
        let target = self.target.load(Ordering::Acquire);
        if target == miss_stub {
            Dispatch::Miss {
                data: self.data.load(Ordering::Acquire),
            }
        } else {
            Dispatch::Direct(target)
        }
    }

    /// Alternate read order for callers that pass the dispatch data on to
    /// the callee: acquire data first, then the target. Paired with the
    /// patch sequencing, the returned target is never older than the
    /// returned data.
    #[inline]
    pub fn load_data_then_target(&self) -> (usize, usize) {
        let data = self.data.load(Ordering::Acquire);
        let target = self.target.load(Ordering::Acquire);
        (data, target)
    }

    #[inline]
    pub(crate) fn store_data(&self, data: usize) {
        self.data.store(data, Ordering::Release);
    }

    #[inline]
    pub(crate) fn store_target(&self, target: usize) {
        self.target.store(target, Ordering::Release);
    }
}

// =============================================================================
// Patcher
// =============================================================================

/// Entry points for every call-site transition.
///
/// One patcher serves the whole isolate; patches to the same site are
/// serialized by the owning thread (compiler or debugger), so the patcher
/// itself only needs the per-site memory-ordering discipline.
#[derive(Debug)]
pub struct DispatchPatcher {
    config: PatchConfig,
    /// The generic, data-independent lookup stub switchable sites park on
    /// mid-transition.
    miss_stub: usize,
    patches_applied: AtomicU64,
    safepoint_patches: AtomicU64,
}

impl DispatchPatcher {
    /// Create a patcher for the given mode configuration.
    pub fn new(config: PatchConfig, miss_stub: usize) -> Self {
        Self {
            config,
            miss_stub,
            patches_applied: AtomicU64::new(0),
            safepoint_patches: AtomicU64::new(0),
        }
    }

    /// The shared miss stub address.
    #[inline]
    pub fn miss_stub(&self) -> usize {
        self.miss_stub
    }

    /// Retarget a static call.
    ///
    /// A static site has no dispatch data, so the single release store is
    /// the whole transition; no safepoint is needed.
    pub fn patch_static_call(&self, site: &DispatchSite, new_target: usize) {
        assert!(
            site.kind() == SiteKind::Static,
            "static-call patch applied to a {:?} site",
            site.kind()
        );
        site.store_target(new_target);
        self.patches_applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Install a new guard and target on a monomorphic inline cache.
    ///
    /// Rewrites both words, so the caller must hold the world stopped; the
    /// scope parameter is that proof. Store order is free at a safepoint.
    pub fn patch_instance_call(
        &self,
        site: &DispatchSite,
        new_data: usize,
        new_target: usize,
        _world: &SafepointScope<'_>,
    ) {
        assert!(
            site.kind() == SiteKind::Monomorphic,
            "instance-call patch applied to a {:?} site",
            site.kind()
        );
        site.store_data(new_data);
        site.store_target(new_target);
        self.patches_applied.fetch_add(1, Ordering::Relaxed);
        self.safepoint_patches.fetch_add(1, Ordering::Relaxed);
    }

    /// Transition a switchable call to a new cache and target while other
    /// threads may be dispatching through it.
    ///
    /// The miss stub is data-independent, so a reader that takes the
    /// intermediate target never needs the new data to be visible; the
    /// three release stores make every observable pairing self-consistent.
    pub fn patch_switchable_call(&self, site: &DispatchSite, new_data: usize, new_target: usize) {
        assert!(
            self.config.supports_switchable_calls,
            "switchable calls are not part of this mode"
        );
        assert!(
            site.kind() == SiteKind::Switchable,
            "switchable-call patch applied to a {:?} site",
            site.kind()
        );
        site.store_target(self.miss_stub);
        site.store_data(new_data);
        site.store_target(new_target);
        self.patches_applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Redirect a native call to a new native entry through its relay
    /// trampoline.
    ///
    /// The native entry rides in `data` and the trampoline in `target`;
    /// both change together, so this is a safepoint transition.
    pub fn patch_native_call(
        &self,
        site: &DispatchSite,
        new_target: usize,
        trampoline: usize,
        _world: &SafepointScope<'_>,
    ) {
        assert!(
            self.config.supports_native_calls,
            "native calls are not part of this mode"
        );
        assert!(
            site.kind() == SiteKind::Native,
            "native-call patch applied to a {:?} site",
            site.kind()
        );
        site.store_data(new_target);
        site.store_target(trampoline);
        self.patches_applied.fetch_add(1, Ordering::Relaxed);
        self.safepoint_patches.fetch_add(1, Ordering::Relaxed);
    }

    /// Counters for the patches performed so far.
    pub fn stats(&self) -> PatchStats {
        PatchStats {
            patches_applied: self.patches_applied.load(Ordering::Relaxed),
            safepoint_patches: self.safepoint_patches.load(Ordering::Relaxed),
        }
    }
}

/// Counters describing a patcher's activity.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatchStats {
    /// Transitions applied across all kinds.
    pub patches_applied: u64,
    /// Transitions that required the world stopped.
    pub safepoint_patches: u64,
}

// =============================================================================
// Tests
// =============================================================================
