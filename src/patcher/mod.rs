//! # Patcher
//!
//! This module covers memory writers, which put patch bytes into the target address space and keep the caches
//! coherent afterwards.
//!
//! Every write goes through [`commit`], which runs write, data cache flush and (for code) instruction cache
//! invalidation over the same range, in that order, and stops at the first failure.

pub mod guarded;
pub mod mem;

use thiserror::Error;

/// Privileged access to the target address space
///
/// Addresses are 32-bit target addresses; translating them to something the host can dereference is up to the
/// implementor.
///
/// # Safety
///
/// Implementors must perform each operation fully and synchronously before returning `Ok`, and must touch exactly the
/// range they were given.
pub unsafe trait MemoryWriter {
    /// Error type that can occur when accessing memory
    type Error: std::error::Error + 'static;

    /// Reads the 4-byte word at `address`, in target (big-endian) byte order
    ///
    /// # Safety
    ///
    /// `address` must be readable for 4 bytes
    unsafe fn read_word(&mut self, address: u32) -> Result<u32, Self::Error>;

    /// Copies `data` to `address`
    ///
    /// # Safety
    ///
    /// `address` must be valid for `data.len()` bytes, and nothing may be executing or reading that range while it is
    /// written
    unsafe fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Flushes the data cache over `len` bytes at `address`
    ///
    /// # Safety
    ///
    /// `address` must be valid for `len` bytes
    unsafe fn flush_data_cache(&mut self, address: u32, len: usize) -> Result<(), Self::Error>;

    /// Invalidates the instruction cache over `len` bytes at `address`
    ///
    /// # Safety
    ///
    /// `address` must be valid for `len` bytes
    unsafe fn invalidate_instruction_cache(
        &mut self,
        address: u32,
        len: usize,
    ) -> Result<(), Self::Error>;
}

unsafe impl<W: MemoryWriter + ?Sized> MemoryWriter for &mut W {
    type Error = W::Error;

    unsafe fn read_word(&mut self, address: u32) -> Result<u32, Self::Error> {
        (**self).read_word(address)
    }

    unsafe fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Self::Error> {
        (**self).write(address, data)
    }

    unsafe fn flush_data_cache(&mut self, address: u32, len: usize) -> Result<(), Self::Error> {
        (**self).flush_data_cache(address, len)
    }

    unsafe fn invalidate_instruction_cache(
        &mut self,
        address: u32,
        len: usize,
    ) -> Result<(), Self::Error> {
        (**self).invalidate_instruction_cache(address, len)
    }
}

/// Errors when applying a patch, tagged with the step that failed
#[derive(Debug, Error)]
pub enum ApplyError<E> {
    /// Reading the current contents failed
    #[error("reading word at {address:#010x} failed: {source}")]
    Read {
        /// Address being read
        address: u32,
        /// Underlying writer error
        source: E,
    },
    /// The write itself failed
    #[error("writing {len} bytes at {address:#010x} failed: {source}")]
    Write {
        /// Start of the range
        address: u32,
        /// Length of the range
        len: usize,
        /// Underlying writer error
        source: E,
    },
    /// The data cache flush failed after a successful write
    #[error("flushing data cache over {len} bytes at {address:#010x} failed: {source}")]
    FlushData {
        /// Start of the range
        address: u32,
        /// Length of the range
        len: usize,
        /// Underlying writer error
        source: E,
    },
    /// The instruction cache invalidation failed after a successful write and flush
    #[error("invalidating instruction cache over {len} bytes at {address:#010x} failed: {source}")]
    InvalidateInstructions {
        /// Start of the range
        address: u32,
        /// Length of the range
        len: usize,
        /// Underlying writer error
        source: E,
    },
}
impl<E> ApplyError<E> {
    /// Address of the failing operation
    pub fn address(&self) -> u32 {
        match self {
            Self::Read { address, .. }
            | Self::Write { address, .. }
            | Self::FlushData { address, .. }
            | Self::InvalidateInstructions { address, .. } => *address,
        }
    }
}

/// Writes `data` at `address`, flushes the data cache over the written range, and if `instructions` is set
/// invalidates the instruction cache over it too.
///
/// # Safety
///
/// See [`MemoryWriter::write`]
pub unsafe fn commit<W: MemoryWriter + ?Sized>(
    memory: &mut W,
    address: u32,
    data: &[u8],
    instructions: bool,
) -> Result<(), ApplyError<W::Error>> {
    let len = data.len();
    memory
        .write(address, data)
        .map_err(|source| ApplyError::Write {
            address,
            len,
            source,
        })?;
    memory
        .flush_data_cache(address, len)
        .map_err(|source| ApplyError::FlushData {
            address,
            len,
            source,
        })?;
    if instructions {
        memory
            .invalidate_instruction_cache(address, len)
            .map_err(|source| ApplyError::InvalidateInstructions {
                address,
                len,
                source,
            })?;
    }
    Ok(())
}
