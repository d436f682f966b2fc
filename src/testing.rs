//! Fakes shared by the unit tests

use thiserror::Error;

use crate::format::OffsetBase;
use crate::module::{ModuleDirectory, ModuleInfo};
use crate::patcher::guarded::GuardedPatch;
use crate::patcher::MemoryWriter;

/// A successful operation seen by [`FakeMemory`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Op {
    /// Bytes written at an address
    Write(u32, Vec<u8>),
    /// Data cache flushed over a range
    Flush(u32, usize),
    /// Instruction cache invalidated over a range
    Invalidate(u32, usize),
}

/// Errors from [`FakeMemory`]
#[derive(Debug, Error)]
pub(crate) enum FakeError {
    /// Access outside the backing buffer
    #[error("{len} bytes at {address:#010x} are outside fake memory")]
    OutOfRange {
        /// Start of the access
        address: u32,
        /// Length of the access
        len: usize,
    },
    /// Failure requested by the test
    #[error("injected failure")]
    Injected,
}

/// A small target address space that records every successful operation
pub(crate) struct FakeMemory {
    /// Target address of `data[0]`
    base: u32,
    /// Backing bytes
    data: Vec<u8>,
    /// Successful operations, in order
    ops: Vec<Op>,
    /// Fail every data cache flush
    pub fail_flush: bool,
    /// Fail every instruction cache invalidation
    pub fail_invalidate: bool,
}
impl FakeMemory {
    /// Creates `len` zeroed bytes starting at `base`
    pub fn new(base: u32, len: usize) -> Self {
        Self {
            base,
            data: vec![0; len],
            ops: Vec::new(),
            fail_flush: false,
            fail_invalidate: false,
        }
    }

    /// Operations seen so far
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Index range for an access, if it is in bounds
    fn range(&self, address: u32, len: usize) -> Result<std::ops::Range<usize>, FakeError> {
        let start = address
            .checked_sub(self.base)
            .map(|off| off as usize)
            .filter(|&start| start + len <= self.data.len())
            .ok_or(FakeError::OutOfRange { address, len })?;
        Ok(start..start + len)
    }

    /// Current contents of a range; panics if out of bounds
    pub fn bytes(&self, address: u32, len: usize) -> &[u8] {
        let range = self.range(address, len).unwrap();
        &self.data[range]
    }

    /// Stores a big-endian word without recording an operation
    pub fn poke_word(&mut self, address: u32, word: u32) {
        let range = self.range(address, 4).unwrap();
        self.data[range].copy_from_slice(&word.to_be_bytes());
    }

    /// Loads a big-endian word
    pub fn peek_word(&self, address: u32) -> u32 {
        let b = self.bytes(address, 4);
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }
}
unsafe impl MemoryWriter for FakeMemory {
    type Error = FakeError;

    unsafe fn read_word(&mut self, address: u32) -> Result<u32, Self::Error> {
        self.range(address, 4)?;
        Ok(self.peek_word(address))
    }

    unsafe fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Self::Error> {
        let range = self.range(address, data.len())?;
        self.data[range].copy_from_slice(data);
        self.ops.push(Op::Write(address, data.to_vec()));
        Ok(())
    }

    unsafe fn flush_data_cache(&mut self, address: u32, len: usize) -> Result<(), Self::Error> {
        self.range(address, len)?;
        if self.fail_flush {
            return Err(FakeError::Injected);
        }
        self.ops.push(Op::Flush(address, len));
        Ok(())
    }

    unsafe fn invalidate_instruction_cache(
        &mut self,
        address: u32,
        len: usize,
    ) -> Result<(), Self::Error> {
        self.range(address, len)?;
        if self.fail_invalidate {
            return Err(FakeError::Injected);
        }
        self.ops.push(Op::Invalidate(address, len));
        Ok(())
    }
}

/// A module directory that hands out a scripted sequence of answers
pub(crate) struct FakeDirectory {
    /// Answers for successive `list_modules` calls; once exhausted, the last one repeats
    answers: Vec<Option<Vec<ModuleInfo>>>,
    /// Number of `list_modules` calls so far
    pub calls: usize,
    /// Patches handed out for recovery
    pub recovery: Vec<GuardedPatch>,
}
impl FakeDirectory {
    /// A directory that always answers with `modules`
    pub fn available(modules: Vec<ModuleInfo>) -> Self {
        Self::scripted(vec![Some(modules)])
    }

    /// A directory that answers with each of `answers` in turn
    pub fn scripted(answers: Vec<Option<Vec<ModuleInfo>>>) -> Self {
        Self {
            answers,
            calls: 0,
            recovery: Vec::new(),
        }
    }
}
impl ModuleDirectory for FakeDirectory {
    fn list_modules(&mut self) -> Option<Vec<ModuleInfo>> {
        let answer = self
            .answers
            .get(self.calls)
            .or(self.answers.last())
            .cloned()
            .flatten();
        self.calls += 1;
        answer
    }

    fn recovery_patches(&self) -> Vec<GuardedPatch> {
        self.recovery.clone()
    }
}

/// A module with distinct, recognizable bases
pub(crate) fn module(name: &str, text: u32, data: u32, read_only: u32) -> ModuleInfo {
    ModuleInfo::new(name)
        .with_region(OffsetBase::ModuleText, text, 0x1000)
        .with_region(OffsetBase::ModuleData, data, 0x1000)
        .with_region(OffsetBase::ModuleReadOnly, read_only, 0x1000)
}
