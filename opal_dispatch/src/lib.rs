//! Runtime half of the Opal VM back end.
//!
//! Keeps call dispatch inside already running compiled code safely
//! mutable:
//! - dispatch sites pair a `data` word with a `target` word, rewritten
//!   either lock-free (switchable calls, via miss-stub sequencing) or with
//!   the world stopped;
//! - the safepoint coordinator brings every mutator thread to a stop, with
//!   no timeout and no partial failure, and releases them unconditionally;
//! - breakpoints and whole-function entry patches are reversible,
//!   idempotency-checked toggles over the same site state;
//! - the page-protection layer keeps code pages W^X while live bytes are
//!   rewritten.
#![deny(unsafe_op_in_unsafe_fn)]

pub mod breakpoint;
pub mod entry_patch;
pub mod protect;
pub mod safepoint;
pub mod site;

pub use breakpoint::{SavedSiteState, SiteBreakpoint};
pub use entry_patch::EntryPatch;
pub use protect::{ExecutableRegion, PageProtector};
pub use safepoint::{BlockedSection, MutatorId, SafepointCoordinator, SafepointScope};
pub use site::{Dispatch, DispatchPatcher, DispatchSite, PatchStats, SiteKind};
