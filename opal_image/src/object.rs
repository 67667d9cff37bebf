//! The code-object model consumed by the layout engine.

use opal_core::callsite::{CallSite, CallSiteTable};

// =============================================================================
// Code Object
// =============================================================================

/// One function's (or stub's) finished machine-code bytes plus its outgoing
/// call-site table.
///
/// Produced and owned by the compiler pipeline. The layout engine treats the
/// object as immutable once placed, except that it writes resolved
/// displacement bytes into the payload and clears the call-site table when
/// layout completes: a placed object carries no residual layout metadata.
#[derive(Debug, Clone)]
pub struct CodeObject {
    /// Finished machine code.
    payload: Vec<u8>,
    /// Outgoing transfers, ordered by ascending in-object offset.
    call_sites: CallSiteTable,
    /// Diagnostic name (function symbol), not used by layout.
    name: Option<String>,
}

impl CodeObject {
    /// Create a code object from its payload.
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            call_sites: CallSiteTable::new(),
            name: None,
        }
    }

    /// Attach a diagnostic name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attach the call-site table.
    pub fn with_call_sites(mut self, call_sites: CallSiteTable) -> Self {
        self.call_sites = call_sites;
        self
    }

    /// Append one call site.
    pub fn add_call_site(&mut self, site: CallSite) {
        self.call_sites.push(site);
    }

    /// Payload size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }

    /// The machine-code bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Mutable payload access, used by the layout engine to write resolved
    /// displacements in place.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    /// The call-site table.
    #[inline]
    pub fn call_sites(&self) -> &CallSiteTable {
        &self.call_sites
    }

    /// Diagnostic name, if any.
    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Drop the call-site table after layout.
    #[inline]
    pub(crate) fn clear_call_sites(&mut self) {
        self.call_sites.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================
