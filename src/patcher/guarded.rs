//! This module contains a guarded single-word patcher
//!
//! A guarded patch only replaces an instruction it recognizes. Finding the replacement already in place counts as
//! success, so applying the same guarded patch twice is harmless.

use thiserror::Error;

use super::{commit, ApplyError, MemoryWriter};

/// A conditional overwrite of one instruction word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardedPatch {
    /// Address of the word
    pub address: u32,
    /// Word expected before patching
    pub original: u32,
    /// Word to write
    pub replacement: u32,
}

/// How a guarded patch succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOutcome {
    /// The original word was found and replaced
    Patched,
    /// The replacement was already there; nothing was written
    AlreadyApplied,
}

/// Errors when applying a [`GuardedPatch`]
#[derive(Debug, Error)]
pub enum GuardError<E> {
    /// The word was neither the original nor the replacement
    #[error("unexpected word {found:#010x} at {address:#010x} (expected {expected:#010x})")]
    Mismatch {
        /// Address of the word
        address: u32,
        /// Word that was found
        found: u32,
        /// Word that was expected
        expected: u32,
    },
    /// Reading, writing or cache maintenance failed
    #[error("{0}")]
    Apply(#[from] ApplyError<E>),
}

impl GuardedPatch {
    /// Creates a guarded patch
    pub const fn new(address: u32, original: u32, replacement: u32) -> Self {
        Self {
            address,
            original,
            replacement,
        }
    }

    /// Applies the patch.
    ///
    /// On [`GuardOutcome::Patched`] the word has been written, flushed from the data cache and invalidated in the
    /// instruction cache. On any error memory is left as it was found, unless the failure came from cache
    /// maintenance after the write.
    ///
    /// # Safety
    ///
    /// `address` must be valid for the writer, and the instruction there must not be executing while it is replaced
    pub unsafe fn apply<W: MemoryWriter + ?Sized>(
        &self,
        memory: &mut W,
    ) -> Result<GuardOutcome, GuardError<W::Error>> {
        let address = self.address;
        let current = memory
            .read_word(address)
            .map_err(|source| ApplyError::Read { address, source })?;

        if current == self.replacement {
            return Ok(GuardOutcome::AlreadyApplied);
        }
        if current != self.original {
            return Err(GuardError::Mismatch {
                address,
                found: current,
                expected: self.original,
            });
        }

        commit(memory, address, &self.replacement.to_be_bytes(), true)?;
        Ok(GuardOutcome::Patched)
    }
}

/// Replaces the word at `address` with `replacement` if it currently holds `original`.
///
/// Returns `true` if the word holds `replacement` afterwards.
///
/// # Safety
///
/// See [`GuardedPatch::apply`]
pub unsafe fn guarded_patch<W: MemoryWriter + ?Sized>(
    memory: &mut W,
    address: u32,
    original: u32,
    replacement: u32,
) -> bool {
    GuardedPatch::new(address, original, replacement)
        .apply(memory)
        .is_ok()
}
