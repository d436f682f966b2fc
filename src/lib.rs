#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod diag;
pub mod engine;
pub mod format;
pub mod module;
pub mod patcher;
pub mod source;

#[cfg(test)]
mod testing;

pub use diag::{Diagnostics, Event, Recorder, TracingDiagnostics};
pub use engine::{run, ApplyReport, PatchEngine, ResolutionError, RunSummary};
pub use format::{BytePatch, FormatError, OffsetBase, PatchFile, RecordError, WordPatch};
pub use module::handshake::EnvironmentUnavailable;
pub use module::{module_list_gates, ModuleDirectory, ModuleInfo};
pub use patcher::guarded::{guarded_patch, GuardedPatch};
pub use patcher::MemoryWriter;
pub use source::{DirectorySource, PatchBlob, PatchSource, SourceConfig, SourceError};
