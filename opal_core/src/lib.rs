//! Shared leaf abstractions for the Opal back end.
//!
//! This crate defines the vocabulary the build-time and runtime halves of
//! the back end agree on:
//! - the ISA policy (instruction sizes, displacement ranges, in-place
//!   displacement encoding) that makes the layout engine portable,
//! - the call-site model (kinds, targets, per-object tables),
//! - explicit configuration structs threaded through every entry point.

pub mod callsite;
pub mod config;
pub mod isa;

pub use callsite::{CallKind, CallSite, CallSiteTable, CallTarget, CodeId};
pub use config::{BuildMode, LayoutConfig, PatchConfig};
pub use isa::{Arm64Policy, IsaPolicy, X64Policy};
