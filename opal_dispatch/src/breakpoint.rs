//! Debugger breakpoints over live call sites.
//!
//! Enabling a breakpoint saves the site's exact `(data, target)` pair and
//! steers the caller onto a trap stub; disabling restores the pair, so a
//! set/remove cycle round-trips the site to precisely its prior state.
//! Both toggles run with the world stopped, and both are
//! idempotency-checked: enabling an enabled breakpoint or disabling a
//! disabled one is a programming-contract violation, not a runtime
//! condition.

use std::sync::Arc;

use crate::safepoint::SafepointScope;
use crate::site::{DispatchSite, SiteKind};

// =============================================================================
// Saved State
// =============================================================================

/// Pre-breakpoint state of a site's data word.
///
/// The representation is selected by call-site kind: most kinds carry a
/// dispatch record address, while a native site's data word encodes the
/// raw relay bytes the trap must put back verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavedSiteState {
    /// A dispatch-record address.
    Address(usize),
    /// Raw relay bytes, preserved bit-exactly.
    RawBytes([u8; 8]),
}

impl SavedSiteState {
    /// Capture one data word in the representation its kind dictates.
    fn capture(kind: SiteKind, word: usize) -> Self {
        match kind {
            SiteKind::Native => SavedSiteState::RawBytes((word as u64).to_le_bytes()),
            _ => SavedSiteState::Address(word),
        }
    }

    /// Decode back to the data word.
    fn decode(self) -> usize {
        match self {
            SavedSiteState::Address(address) => address,
            SavedSiteState::RawBytes(bytes) => u64::from_le_bytes(bytes) as usize,
        }
    }
}

#[derive(Debug)]
struct SavedPair {
    data: SavedSiteState,
    target: usize,
}

// =============================================================================
// Breakpoint
// =============================================================================

/// A reversible breakpoint on one dispatch site.
#[derive(Debug)]
pub struct SiteBreakpoint {
    site: Arc<DispatchSite>,
    trap_stub: usize,
    is_enabled: bool,
    saved: Option<SavedPair>,
}

impl SiteBreakpoint {
    /// Create a disabled breakpoint for `site`.
    pub fn new(site: Arc<DispatchSite>, trap_stub: usize) -> Self {
        Self {
            site,
            trap_stub,
            is_enabled: false,
            saved: None,
        }
    }

    /// Whether the trap stub is currently installed.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.is_enabled
    }

    /// The site this breakpoint patches.
    #[inline]
    pub fn site(&self) -> &DispatchSite {
        &self.site
    }

    /// Saved pre-breakpoint state, present while enabled.
    #[inline]
    pub fn saved_state(&self) -> Option<&SavedSiteState> {
        self.saved.as_ref().map(|pair| &pair.data)
    }

    /// Save the site's `(data, target)` pair and install the trap stub.
    ///
    /// # Panics
    /// Panics when the breakpoint is already enabled.
    pub fn enable(&mut self, _world: &SafepointScope<'_>) {
        assert!(!self.is_enabled, "breakpoint is already enabled");

        self.saved = Some(SavedPair {
            data: SavedSiteState::capture(self.site.kind(), self.site.load_data()),
            target: self.site.load_target(),
        });
        self.site.store_target(self.trap_stub);
        self.is_enabled = true;
    }

    /// Restore the saved `(data, target)` pair.
    ///
    /// # Panics
    /// Panics when the breakpoint is not enabled.
    pub fn disable(&mut self, _world: &SafepointScope<'_>) {
        assert!(self.is_enabled, "breakpoint is not enabled");

        let saved = self.saved.take().expect("enabled breakpoint lost its saved state");
        self.site.store_data(saved.data.decode());
        self.site.store_target(saved.target);
        self.is_enabled = false;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safepoint::SafepointCoordinator;

    const TRAP: usize = 0xBBBB;

    #[test]
    fn test_enable_installs_trap() {
        let coordinator = SafepointCoordinator::new();
        let site = Arc::new(DispatchSite::new(SiteKind::Monomorphic, 0x10, 0x2000));
        let mut breakpoint = SiteBreakpoint::new(Arc::clone(&site), TRAP);

        let world = coordinator.stop_the_world();
        breakpoint.enable(&world);
        drop(world);

        assert!(breakpoint.is_enabled());
        assert_eq!(site.load_target(), TRAP);
        // The dispatch record stays in place for the trap handler.
        assert_eq!(site.load_data(), 0x10);
        assert_eq!(
            breakpoint.saved_state(),
            Some(&SavedSiteState::Address(0x10))
        );
    }

    #[test]
    fn test_set_then_remove_round_trips_exactly() {
        let coordinator = SafepointCoordinator::new();
        let site = Arc::new(DispatchSite::new(SiteKind::Monomorphic, 0x10, 0x2000));
        let mut breakpoint = SiteBreakpoint::new(Arc::clone(&site), TRAP);

        let world = coordinator.stop_the_world();
        breakpoint.enable(&world);
        breakpoint.disable(&world);
        drop(world);

        assert!(!breakpoint.is_enabled());
        assert_eq!(site.load_data_then_target(), (0x10, 0x2000));
        assert!(breakpoint.saved_state().is_none());
    }

    #[test]
    fn test_native_site_saves_raw_bytes() {
        let coordinator = SafepointCoordinator::new();
        let site = Arc::new(DispatchSite::new(SiteKind::Native, 0x0102_0304, 0x7100));
        let mut breakpoint = SiteBreakpoint::new(Arc::clone(&site), TRAP);

        let world = coordinator.stop_the_world();
        breakpoint.enable(&world);
        assert!(matches!(
            breakpoint.saved_state(),
            Some(SavedSiteState::RawBytes(_))
        ));
        breakpoint.disable(&world);
        drop(world);

        assert_eq!(site.load_data_then_target(), (0x0102_0304, 0x7100));
    }

    #[test]
    fn test_reenable_after_disable() {
        let coordinator = SafepointCoordinator::new();
        let site = Arc::new(DispatchSite::new(SiteKind::Static, 0, 0x2000));
        let mut breakpoint = SiteBreakpoint::new(Arc::clone(&site), TRAP);

        let world = coordinator.stop_the_world();
        breakpoint.enable(&world);
        breakpoint.disable(&world);
        breakpoint.enable(&world);
        drop(world);

        assert_eq!(site.load_target(), TRAP);
    }

    #[test]
    #[should_panic(expected = "already enabled")]
    fn test_double_enable_is_a_contract_violation() {
        let coordinator = SafepointCoordinator::new();
        let site = Arc::new(DispatchSite::new(SiteKind::Static, 0, 0x2000));
        let mut breakpoint = SiteBreakpoint::new(site, TRAP);

        let world = coordinator.stop_the_world();
        breakpoint.enable(&world);
        breakpoint.enable(&world);
    }

    #[test]
    #[should_panic(expected = "not enabled")]
    fn test_disable_when_disabled_is_a_contract_violation() {
        let coordinator = SafepointCoordinator::new();
        let site = Arc::new(DispatchSite::new(SiteKind::Static, 0, 0x2000));
        let mut breakpoint = SiteBreakpoint::new(site, TRAP);

        let world = coordinator.stop_the_world();
        breakpoint.disable(&world);
    }
}
