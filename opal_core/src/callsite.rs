//! Call-site model shared by the layout engine and the runtime patcher.
//!
//! A code object's outgoing control transfers are described by a table of
//! call sites, each naming a byte offset inside the object, the shape of
//! the transfer, and its destination. The layout engine consumes the table
//! to resolve displacements; the runtime patcher shares the same kind
//! vocabulary when rewriting live sites.

use smallvec::SmallVec;

// =============================================================================
// Code Identity
// =============================================================================

/// Handle identifying a code object within one layout run.
///
/// Code objects are arena-allocated by the compiler pipeline; the handle is
/// the object's index in that arena, so identity comparison is integer
/// comparison and no pointer aliasing is involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeId(u32);

impl CodeId {
    /// Create a handle from an arena index.
    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// The arena index this handle refers to.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

// =============================================================================
// Call Kinds and Targets
// =============================================================================

/// Shape of a direct control transfer encoded at a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// A pc-relative call that pushes a return address.
    DirectPcRelative,
    /// A pc-relative tail transfer (jump in call position).
    TailPcRelative,
}

/// Destination of a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    /// Another code object, by identity.
    Code(CodeId),
    /// An external stub at a pre-assigned text offset.
    Stub(u64),
}

// =============================================================================
// Call Site
// =============================================================================

/// One outgoing transfer inside a code object.
#[derive(Debug, Clone, Copy)]
pub struct CallSite {
    /// Byte offset of the call instruction inside the object's payload.
    pub offset: u32,
    /// Transfer shape.
    pub kind: CallKind,
    /// Where the transfer goes.
    pub target: CallTarget,
}

impl CallSite {
    /// Create a call-site entry.
    #[inline]
    pub const fn new(offset: u32, kind: CallKind, target: CallTarget) -> Self {
        Self {
            offset,
            kind,
            target,
        }
    }
}

// =============================================================================
// Call-Site Table
// =============================================================================

/// The ordered call-site table of one code object.
///
/// Entries are kept sorted by ascending in-object offset, and each physical
/// call instruction appears exactly once. The table exists only between
/// code generation and layout; the layout engine clears it once every site
/// is resolved.
#[derive(Debug, Clone, Default)]
pub struct CallSiteTable {
    sites: SmallVec<[CallSite; 4]>,
}

impl CallSiteTable {
    /// Create an empty table.
    #[inline]
    pub fn new() -> Self {
        Self {
            sites: SmallVec::new(),
        }
    }

    /// Append a call site.
    ///
    /// # Panics
    /// Panics if `site` is not past the previous entry: the table must be
    /// ordered by ascending offset with no duplicate instruction.
    pub fn push(&mut self, site: CallSite) {
        if let Some(last) = self.sites.last() {
            assert!(
                site.offset > last.offset,
                "call-site table must be ordered by ascending offset"
            );
        }
        self.sites.push(site);
    }

    /// Sites in ascending offset order.
    #[inline]
    pub fn sites(&self) -> &[CallSite] {
        &self.sites
    }

    /// Number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// Whether the table is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Drop all entries. Called by the layout engine after resolution so no
    /// layout metadata survives into the final image.
    #[inline]
    pub fn clear(&mut self) {
        self.sites.clear();
        self.sites.shrink_to_fit();
    }
}

// =============================================================================
// Tests
// =============================================================================
