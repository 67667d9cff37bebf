//! Build-time back end for the Opal VM.
//!
//! Turns independently generated code objects into one contiguous text
//! region:
//! - the relocation engine packs objects, resolves displacement-limited
//!   direct calls, and inserts call trampolines only when unavoidable;
//! - the block scheduler reorders a function's basic blocks from profile
//!   feedback (JIT) or segregates never-taken cold blocks (AOT) before the
//!   object is emitted;
//! - the image writer materializes the engine's command stream into the
//!   final text-section bytes.
//!
//! Everything here runs single-threaded at compile/snapshot-build time and
//! is deterministic given input order.

pub mod layout;
pub mod object;
pub mod schedule;
pub mod writer;

pub use layout::{ImageCommand, LayoutStats, Relocator, TextLayout};
pub use object::CodeObject;
pub use schedule::{BlockGraph, BlockScheduler, ScheduleStats};
pub use writer::{ImageError, ImageWriter};
