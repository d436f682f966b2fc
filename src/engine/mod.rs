//! # Engine
//!
//! This module covers applying decoded patch files to memory.
//!
//! A run obtains the module list once, then works through the patch files in order. Every file, record and patch
//! stands alone: a failure is reported and the next one is attempted. The only thing that stops a run is not
//! getting a module list at all, since module-relative patches can't be placed safely without it.

pub mod report;

use thiserror::Error;

use crate::diag::{Diagnostics, Event};
use crate::format::{BytePatch, FormatError, OffsetBase, PatchFile, WordPatch};
use crate::module::handshake::{acquire_modules, EnvironmentUnavailable};
use crate::module::{ModuleDirectory, ModuleInfo};
use crate::patcher::{commit, ApplyError, MemoryWriter};
use crate::source::{PatchBlob, PatchSource};

pub use self::report::{ApplyReport, FileError, FileOutcome, RunSummary};

/// No loaded module matched a byte patch's target
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    /// No module name ends with the suffix
    #[error("no loaded module matches {suffix:?}")]
    ModuleNotFound {
        /// Suffix that was searched for
        suffix: String,
    },
}

/// Errors when applying a single byte patch
#[derive(Debug, Error)]
pub enum PatchError<E> {
    /// The target couldn't be resolved; nothing was written
    #[error("{0}")]
    Resolution(#[from] ResolutionError),
    /// Writing or cache maintenance failed
    #[error("{0}")]
    Apply(#[from] ApplyError<E>),
}

/// Applies patch files against a snapshot of the loaded modules
pub struct PatchEngine<W, G> {
    /// Modules patches are resolved against, in directory order
    modules: Vec<ModuleInfo>,
    /// Writer for the target address space
    memory: W,
    /// Where events are reported
    diagnostics: G,
}
impl<W: MemoryWriter, G: Diagnostics> PatchEngine<W, G> {
    /// Creates an engine over an already obtained module list
    pub fn new(modules: Vec<ModuleInfo>, memory: W, diagnostics: G) -> Self {
        Self {
            modules,
            memory,
            diagnostics,
        }
    }

    /// Creates an engine, obtaining the module list from `directory` and recovering it if necessary.
    ///
    /// # Safety
    ///
    /// The directory's recovery patches must be valid for `memory`; see
    /// [`Handshake::step`](crate::module::handshake::Handshake::step)
    pub unsafe fn connect<D: ModuleDirectory + ?Sized>(
        directory: &mut D,
        mut memory: W,
        mut diagnostics: G,
    ) -> Result<Self, EnvironmentUnavailable> {
        let modules = acquire_modules(directory, &mut memory, &mut diagnostics)?;
        Ok(Self::new(modules, memory, diagnostics))
    }

    /// Modules patches are resolved against
    pub fn modules(&self) -> &[ModuleInfo] {
        &self.modules
    }

    /// The memory writer
    pub fn memory(&self) -> &W {
        &self.memory
    }

    /// The diagnostics sink
    pub fn diagnostics(&self) -> &G {
        &self.diagnostics
    }

    /// Takes the engine apart
    pub fn into_parts(self) -> (W, G) {
        (self.memory, self.diagnostics)
    }

    /// First module, in directory order, targeted by `patch`
    pub fn find_module(&self, patch: &BytePatch) -> Option<&ModuleInfo> {
        self.modules
            .iter()
            .find(|module| patch.targets(&module.name))
    }

    /// Computes the absolute address a byte patch writes to.
    ///
    /// The module is looked up even for absolute offsets, so a patch for a module that isn't loaded is never applied.
    pub fn resolve(&self, patch: &BytePatch) -> Result<u32, ResolutionError> {
        let module = self
            .find_module(patch)
            .ok_or_else(|| ResolutionError::ModuleNotFound {
                suffix: patch.target_module_suffix.clone(),
            })?;
        Ok(match patch.offset_base {
            OffsetBase::Absolute | OffsetBase::Unknown(_) => patch.offset,
            base => module.base(base).wrapping_add(patch.offset),
        })
    }

    /// Resolves and applies a byte patch, returning the address written to.
    ///
    /// # Safety
    ///
    /// The resolved range must be valid for the writer, and nothing may execute from it while it is written
    pub unsafe fn apply_byte_patch(
        &mut self,
        patch: &BytePatch,
    ) -> Result<u32, PatchError<W::Error>> {
        let address = self.resolve(patch)?;
        commit(
            &mut self.memory,
            address,
            &patch.data,
            patch.is_instructions,
        )?;
        Ok(address)
    }

    /// Writes a word patch one word at a time, each followed by its own flush and invalidate.
    ///
    /// Stops at the first failing word; the words before it stay written.
    ///
    /// # Safety
    ///
    /// `patch.target_address` must be valid for the writer for every word, and nothing may execute from the range
    /// while it is written
    pub unsafe fn apply_word_patch(
        &mut self,
        patch: &WordPatch,
    ) -> Result<(), ApplyError<W::Error>> {
        let mut address = patch.target_address;
        for word in &patch.words {
            commit(&mut self.memory, address, &word.to_be_bytes(), true)?;
            address = address.wrapping_add(4);
        }
        Ok(())
    }

    /// Applies every patch in `file`: word patches first, then byte patches, each in file order.
    ///
    /// # Safety
    ///
    /// See [`PatchEngine::apply_word_patch`] and [`PatchEngine::apply_byte_patch`]
    pub unsafe fn apply(&mut self, file: &PatchFile) -> ApplyReport<W::Error> {
        let mut report = ApplyReport::default();

        for patch in &file.word_patches {
            match self.apply_word_patch(patch) {
                Ok(()) => {
                    let len = patch.words.len() * 4;
                    self.applied(&mut report, patch.target_address, len, true)
                }
                Err(err) => self.failed(&mut report, err),
            }
        }

        for patch in &file.byte_patches {
            match self.apply_byte_patch(patch) {
                Ok(address) => self.applied(
                    &mut report,
                    address,
                    patch.data.len(),
                    patch.is_instructions,
                ),
                Err(PatchError::Resolution(err)) => {
                    self.diagnostics.emit(Event::PatchUnresolved {
                        suffix: patch.target_module_suffix.clone(),
                    });
                    report.unresolved.push(err);
                }
                Err(PatchError::Apply(err)) => self.failed(&mut report, err),
            }
        }

        report
    }

    /// Decodes and applies one patch file.
    ///
    /// # Safety
    ///
    /// See [`PatchEngine::apply`]
    pub unsafe fn apply_bytes(
        &mut self,
        name: &str,
        bytes: &[u8],
    ) -> Result<ApplyReport<W::Error>, FormatError> {
        let file = match PatchFile::decode(bytes, &mut self.diagnostics) {
            Ok(file) => file,
            Err(err) => {
                self.diagnostics.emit(Event::FileRejected {
                    name: name.into(),
                    reason: err.to_string(),
                });
                return Err(err);
            }
        };
        self.diagnostics.emit(Event::FileLoaded {
            name: name.into(),
            word_patches: file.word_patches.len(),
            byte_patches: file.byte_patches.len(),
        });
        Ok(self.apply(&file))
    }

    /// Applies every patch file from `source`, in order.
    ///
    /// # Safety
    ///
    /// See [`PatchEngine::apply`]
    pub unsafe fn run<S: PatchSource>(&mut self, mut source: S) -> RunSummary<W::Error> {
        let mut summary = RunSummary::default();
        while let Some(blob) = source.next_file() {
            let outcome = match blob {
                Ok(PatchBlob { name, bytes }) => {
                    let result = self.apply_bytes(&name, &bytes).map_err(FileError::from);
                    FileOutcome { name, result }
                }
                Err(err) => {
                    let name = err.path().display().to_string();
                    self.diagnostics.emit(Event::FileRejected {
                        name: name.clone(),
                        reason: err.to_string(),
                    });
                    FileOutcome {
                        name,
                        result: Err(FileError::from(err)),
                    }
                }
            };
            summary.files.push(outcome);
        }
        summary
    }

    /// Records a successful write
    fn applied(
        &mut self,
        report: &mut ApplyReport<W::Error>,
        address: u32,
        len: usize,
        instructions: bool,
    ) {
        self.diagnostics.emit(Event::PatchApplied {
            address,
            len,
            instructions,
        });
        report.applied.push((address, len));
    }

    /// Records a failed write
    fn failed(&mut self, report: &mut ApplyReport<W::Error>, err: ApplyError<W::Error>) {
        self.diagnostics.emit(Event::PatchFailed {
            address: err.address(),
            reason: err.to_string(),
        });
        report.failed.push(err);
    }
}

/// Performs a whole patching run: obtains the module list (recovering it if necessary), then applies every patch
/// file from `source`.
///
/// Returns [`EnvironmentUnavailable`] without touching any patch file if the module list can't be obtained.
///
/// # Safety
///
/// Every address the patch files resolve to, and every recovery patch, must be valid for `memory`
pub unsafe fn run<D, W, S, G>(
    directory: &mut D,
    memory: W,
    source: S,
    diagnostics: G,
) -> Result<RunSummary<W::Error>, EnvironmentUnavailable>
where
    D: ModuleDirectory + ?Sized,
    W: MemoryWriter,
    S: PatchSource,
    G: Diagnostics,
{
    let mut engine = PatchEngine::connect(directory, memory, diagnostics)?;
    Ok(engine.run(source))
}
