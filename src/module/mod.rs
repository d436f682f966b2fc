//! # Module
//!
//! This module covers loaded-module metadata and the directory that hands it out

pub mod handshake;

use crate::format::OffsetBase;
use crate::patcher::guarded::GuardedPatch;

/// Word offset of the gating branch inside the module-count entry point
pub const MODULE_COUNT_GATE_WORD: u32 = 6;
/// Word offset of the gating branch inside the module-info entry point
pub const MODULE_INFO_GATE_WORD: u32 = 22;
/// `beq +0x38`, the branch gating the module count
pub const MODULE_COUNT_GATE: u32 = 0x4182_0038;
/// `beq +0x100`, the branch gating the module info
pub const MODULE_INFO_GATE: u32 = 0x4182_0100;
/// `nop`
pub const NOP: u32 = 0x6000_0000;

/// A region of a loaded module
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Region {
    /// Absolute address of the region's start
    pub base: u32,
    /// Size of the region in bytes
    pub size: u32,
}

/// A loaded module
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Full name of the module
    pub name: String,
    /// Code
    pub text: Region,
    /// Data
    pub data: Region,
    /// Read-only data
    pub read_only: Region,
}
impl ModuleInfo {
    /// Creates a module with every region empty at address 0
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the region selected by `base`; [`OffsetBase::Absolute`] and unknown bases are ignored
    pub fn with_region(mut self, base: OffsetBase, start: u32, size: u32) -> Self {
        let region = Region { base: start, size };
        match base {
            OffsetBase::ModuleText => self.text = region,
            OffsetBase::ModuleData => self.data = region,
            OffsetBase::ModuleReadOnly => self.read_only = region,
            OffsetBase::Absolute | OffsetBase::Unknown(_) => {}
        }
        self
    }

    /// Address that an offset relative to `base` is added to
    pub fn base(&self, base: OffsetBase) -> u32 {
        match base {
            OffsetBase::ModuleText => self.text.base,
            OffsetBase::ModuleData => self.data.base,
            OffsetBase::ModuleReadOnly => self.read_only.base,
            OffsetBase::Absolute | OffsetBase::Unknown(_) => 0,
        }
    }
}

/// Source of loaded-module metadata
///
/// Every directory states its own recovery patches, usually [`module_list_gates`] at the host's entry points:
///
/// ```compile_fail
/// use binpatch::{ModuleDirectory, ModuleInfo};
///
/// struct Listing(Vec<ModuleInfo>);
/// impl ModuleDirectory for Listing {
///     fn list_modules(&mut self) -> Option<Vec<ModuleInfo>> {
///         Some(self.0.clone())
///     }
/// }
/// ```
pub trait ModuleDirectory {
    /// Lists the currently loaded modules, or `None` if the list can't be obtained
    fn list_modules(&mut self) -> Option<Vec<ModuleInfo>>;

    /// Guarded patches that unlock [`ModuleDirectory::list_modules`] when it comes back empty
    fn recovery_patches(&self) -> Vec<GuardedPatch>;
}

/// Builds the two patches that remove the branches gating the module list.
///
/// `module_count` and `module_info` are the entry points of the module-count and module-info functions.
pub fn module_list_gates(module_count: u32, module_info: u32) -> [GuardedPatch; 2] {
    [
        GuardedPatch::new(
            module_count.wrapping_add(MODULE_COUNT_GATE_WORD * 4),
            MODULE_COUNT_GATE,
            NOP,
        ),
        GuardedPatch::new(
            module_info.wrapping_add(MODULE_INFO_GATE_WORD * 4),
            MODULE_INFO_GATE,
            NOP,
        ),
    ]
}
