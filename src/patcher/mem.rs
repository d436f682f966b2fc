//! This module contains a memory writer for the current process that adjusts memory permissions to patch read-only
//! code and data

use std::ptr;
use std::sync::atomic::{self, Ordering};

use region::Protection;
use thiserror::Error;

use super::MemoryWriter;

/// Whether instruction fetch on this host observes data writes without explicit cache maintenance
const COHERENT_INSTRUCTION_FETCH: bool = cfg!(any(target_arch = "x86", target_arch = "x86_64"));

/// Errors when writing to host memory
#[derive(Debug, Error)]
pub enum HostMemoryError {
    /// Error when setting memory protections
    #[error("Error setting memory protections")]
    ProtectionError(#[from] region::Error),
    /// The translated range doesn't fit in the host address space
    #[error("{len} bytes at {address:#010x} overflow the host address space")]
    AddressOverflow {
        /// Target address
        address: u32,
        /// Length of the access
        len: usize,
    },
    /// Written instructions can't be made visible to instruction fetch on this host
    #[error("cannot invalidate instruction cache over {len} bytes at {address:#010x} on this host")]
    IncoherentInstructionCache {
        /// Start of the range
        address: u32,
        /// Length of the range
        len: usize,
    },
}

/// Writes into the current process.
///
/// Target addresses are translated by adding `base`, the host address that target address 0 maps to. Write
/// permissions are added to the target pages for the duration of each write and then reverted.
///
/// Cache maintenance is a full memory fence. That is only enough where instruction fetch is coherent with data writes
/// (x86 and x86-64); elsewhere instruction cache invalidation fails with
/// [`HostMemoryError::IncoherentInstructionCache`], so code patches are reported as failed rather than applied.
///
/// # Safety
///
/// As always, writing through a `*mut u8` derived from a `&T` or `&mut T` can result in undefined behavior because rust
/// assumes `&T` will never change and `&mut T` will only be changed via that reference. Target memory **MUST** be
/// memory not tracked by Rust.
#[derive(Debug)]
pub struct HostMemory {
    /// Host address of target address 0
    base: usize,
}
impl HostMemory {
    /// Creates a writer whose target address 0 is `base`.
    ///
    /// # Safety
    ///
    /// Every target address later passed to this writer must translate to host memory that is valid for the access.
    pub unsafe fn new(base: *mut u8) -> Self {
        Self {
            base: base as usize,
        }
    }

    /// Creates a writer that uses target addresses as host addresses
    ///
    /// # Safety
    ///
    /// See [`HostMemory::new`]
    pub unsafe fn identity() -> Self {
        Self { base: 0 }
    }

    /// Translates a target range to a host pointer
    fn translate(&self, address: u32, len: usize) -> Result<*mut u8, HostMemoryError> {
        let start = self.base.checked_add(address as usize);
        start
            .filter(|start| start.checked_add(len).is_some())
            .map(|start| start as *mut u8)
            .ok_or(HostMemoryError::AddressOverflow { address, len })
    }
}

unsafe impl MemoryWriter for HostMemory {
    type Error = HostMemoryError;

    unsafe fn read_word(&mut self, address: u32) -> Result<u32, Self::Error> {
        let location = self.translate(address, 4)?;
        let mut word = [0u8; 4];
        // Safety: caller guarantees the translated range is readable
        ptr::copy_nonoverlapping(location, word.as_mut_ptr(), word.len());
        Ok(u32::from_be_bytes(word))
    }

    unsafe fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Self::Error> {
        let location = self.translate(address, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        let _guard = region::protect_with_handle(location, data.len(), Protection::all())?;
        // Safety: caller guarantees the translated range is valid, and we just made it writable
        ptr::copy(data.as_ptr(), location, data.len());
        Ok(())
    }

    unsafe fn flush_data_cache(&mut self, address: u32, len: usize) -> Result<(), Self::Error> {
        self.translate(address, len)?;
        atomic::fence(Ordering::SeqCst);
        Ok(())
    }

    unsafe fn invalidate_instruction_cache(
        &mut self,
        address: u32,
        len: usize,
    ) -> Result<(), Self::Error> {
        self.translate(address, len)?;
        if !COHERENT_INSTRUCTION_FETCH {
            return Err(HostMemoryError::IncoherentInstructionCache { address, len });
        }
        atomic::fence(Ordering::SeqCst);
        Ok(())
    }
}
