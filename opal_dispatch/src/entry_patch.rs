//! Whole-function entry patching for deoptimization.
//!
//! When a function's optimized code is invalidated, every future call must
//! land in the deoptimization path instead of the stale prologue. The
//! function carries a pre-reserved patch buffer holding a jump to that
//! path; patching swaps the prologue bytes with the buffer, so the
//! original prologue survives in the buffer and `restore_entry` is the
//! exact inverse. Both directions are guarded against double application.

use std::io;

use crate::protect::PageProtector;

// =============================================================================
// Entry Patch
// =============================================================================

/// Swaps a function's prologue with its pre-reserved jump buffer.
#[derive(Debug)]
pub struct EntryPatch {
    patch_len: usize,
    applied: bool,
}

impl EntryPatch {
    /// Create a patch over `patch_len` prologue bytes.
    ///
    /// # Panics
    /// Panics on a zero-length patch.
    pub fn new(patch_len: usize) -> Self {
        assert!(patch_len > 0, "entry patch cannot be empty");
        Self {
            patch_len,
            applied: false,
        }
    }

    /// Bytes swapped by this patch.
    #[inline]
    pub fn patch_len(&self) -> usize {
        self.patch_len
    }

    /// Whether the jump is currently installed over the prologue.
    #[inline]
    pub fn is_applied(&self) -> bool {
        self.applied
    }

    /// Install the jump: swap the prologue with the patch buffer.
    ///
    /// # Panics
    /// Panics when the entry is already patched or either slice is shorter
    /// than the patch.
    pub fn patch_entry(&mut self, prologue: &mut [u8], buffer: &mut [u8]) {
        assert!(!self.applied, "entry is already patched");
        self.swap(prologue, buffer);
        self.applied = true;
    }

    /// Remove the jump: swap the original prologue back.
    ///
    /// # Panics
    /// Panics when the entry is not patched or either slice is shorter
    /// than the patch.
    pub fn restore_entry(&mut self, prologue: &mut [u8], buffer: &mut [u8]) {
        assert!(self.applied, "entry is not patched");
        self.swap(prologue, buffer);
        self.applied = false;
    }

    /// Install the jump over a live, sealed prologue.
    ///
    /// # Safety
    /// `entry` must point at `patch_len` bytes inside a live executable
    /// mapping, and no thread may be executing the prologue; the caller
    /// holds the world at a safepoint.
    pub unsafe fn patch_entry_live(
        &mut self,
        protector: &PageProtector,
        entry: *mut u8,
        buffer: &mut [u8],
    ) -> io::Result<()> {
        assert!(!self.applied, "entry is already patched");
        // SAFETY: caller guarantees the span is mapped and quiescent
        unsafe { self.swap_live(protector, entry, buffer) }?;
        self.applied = true;
        Ok(())
    }

    /// Restore a live prologue.
    ///
    /// # Safety
    /// Same contract as [`patch_entry_live`](Self::patch_entry_live).
    pub unsafe fn restore_entry_live(
        &mut self,
        protector: &PageProtector,
        entry: *mut u8,
        buffer: &mut [u8],
    ) -> io::Result<()> {
        assert!(self.applied, "entry is not patched");
        // SAFETY: caller guarantees the span is mapped and quiescent
        unsafe { self.swap_live(protector, entry, buffer) }?;
        self.applied = false;
        Ok(())
    }

    fn swap(&self, prologue: &mut [u8], buffer: &mut [u8]) {
        let len = self.patch_len;
        assert!(prologue.len() >= len, "prologue shorter than the patch");
        assert!(buffer.len() >= len, "patch buffer shorter than the patch");
        prologue[..len].swap_with_slice(&mut buffer[..len]);
    }

    unsafe fn swap_live(
        &self,
        protector: &PageProtector,
        entry: *mut u8,
        buffer: &mut [u8],
    ) -> io::Result<()> {
        let len = self.patch_len;
        assert!(buffer.len() >= len, "patch buffer shorter than the patch");
        // SAFETY: caller guarantees [entry, entry + len) is mapped; the
        // protector opens it for writing
        unsafe {
            protector.with_writable(entry, len, || {
                let prologue = std::slice::from_raw_parts_mut(entry, len);
                prologue.swap_with_slice(&mut buffer[..len]);
            })
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protect::ExecutableRegion;

    #[test]
    fn test_patch_and_restore_round_trip() {
        let mut prologue = [0x55, 0x48, 0x89, 0xE5, 0x90];
        let mut buffer = [0xE9, 0x10, 0x00, 0x00, 0x00];
        let mut patch = EntryPatch::new(5);

        patch.patch_entry(&mut prologue, &mut buffer);
        assert!(patch.is_applied());
        // The jump is installed; the original prologue lives in the buffer.
        assert_eq!(prologue, [0xE9, 0x10, 0x00, 0x00, 0x00]);
        assert_eq!(buffer, [0x55, 0x48, 0x89, 0xE5, 0x90]);

        patch.restore_entry(&mut prologue, &mut buffer);
        assert!(!patch.is_applied());
        assert_eq!(prologue, [0x55, 0x48, 0x89, 0xE5, 0x90]);
        assert_eq!(buffer, [0xE9, 0x10, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_partial_prologue_swap() {
        let mut prologue = [0x55, 0x48, 0x89, 0xE5, 0x90, 0xC3];
        let mut buffer = [0xE9, 0x00, 0x00, 0x00, 0x00];
        let mut patch = EntryPatch::new(5);

        patch.patch_entry(&mut prologue, &mut buffer);
        // Bytes past the patch length are untouched.
        assert_eq!(prologue[5], 0xC3);
    }

    #[test]
    #[should_panic(expected = "already patched")]
    fn test_double_patch_is_a_contract_violation() {
        let mut prologue = [0u8; 8];
        let mut buffer = [0u8; 8];
        let mut patch = EntryPatch::new(5);
        patch.patch_entry(&mut prologue, &mut buffer);
        patch.patch_entry(&mut prologue, &mut buffer);
    }

    #[test]
    #[should_panic(expected = "not patched")]
    fn test_restore_unpatched_is_a_contract_violation() {
        let mut prologue = [0u8; 8];
        let mut buffer = [0u8; 8];
        let mut patch = EntryPatch::new(5);
        patch.restore_entry(&mut prologue, &mut buffer);
    }

    #[test]
    fn test_live_patch_over_sealed_region() {
        let mut region = ExecutableRegion::new(64).expect("allocation failed");
        region.write(&[0x55, 0x48, 0x89, 0xE5, 0x90]);
        region.seal().expect("seal failed");

        let protector = PageProtector::new();
        let mut buffer = [0xE9, 0x20, 0x00, 0x00, 0x00];
        let mut patch = EntryPatch::new(5);

        let entry = region.ptr_at(0);
        // SAFETY: the prologue lies inside the sealed region and nothing
        // executes it
        unsafe {
            patch
                .patch_entry_live(&protector, entry, &mut buffer)
                .expect("live patch failed");
        }
        assert_eq!(&region.as_slice()[..5], &[0xE9, 0x20, 0x00, 0x00, 0x00]);
        assert_eq!(buffer, [0x55, 0x48, 0x89, 0xE5, 0x90]);

        // SAFETY: same span as above
        unsafe {
            patch
                .restore_entry_live(&protector, entry, &mut buffer)
                .expect("live restore failed");
        }
        assert_eq!(&region.as_slice()[..5], &[0x55, 0x48, 0x89, 0xE5, 0x90]);
        assert!(!patch.is_applied());
    }
}
