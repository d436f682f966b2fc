//! This module contains the handshake that obtains the module list before patching
//!
//! ```text
//! begin ─┬─> Available
//!        └─> Unavailable ──step──> RecoveryAttempted ──step──┬─> Available
//!                        │                                   └─> PermanentlyUnavailable
//!                        └──step (recovery refused)──────────────> PermanentlyUnavailable
//! ```

use thiserror::Error;

use crate::diag::{Diagnostics, Event};
use crate::patcher::guarded::GuardError;
use crate::patcher::MemoryWriter;

use super::{ModuleDirectory, ModuleInfo};

/// The module list could not be obtained, so nothing may be patched this run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnvironmentUnavailable {
    /// A recovery patch could not be applied
    #[error("module list unavailable and recovery patch at {address:#010x} failed")]
    RecoveryFailed {
        /// Address of the failing recovery patch
        address: u32,
    },
    /// The module list was still unavailable after recovery
    #[error("module list still unavailable after recovery")]
    StillUnavailable,
}

/// State of the module list handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    /// The first attempt came back empty
    Unavailable,
    /// The recovery patches are in place; the list has not been asked for again yet
    RecoveryAttempted,
    /// The module list was obtained
    Available(Vec<ModuleInfo>),
    /// The module list can't be obtained this run
    PermanentlyUnavailable(EnvironmentUnavailable),
}

/// Asks the directory for its modules, treating an empty list as no list
fn fetch<D: ModuleDirectory + ?Sized>(directory: &mut D) -> Option<Vec<ModuleInfo>> {
    directory
        .list_modules()
        .filter(|modules| !modules.is_empty())
}

impl Handshake {
    /// Makes the first attempt at obtaining the module list
    pub fn begin<D: ModuleDirectory + ?Sized>(directory: &mut D) -> Self {
        match fetch(directory) {
            Some(modules) => Self::Available(modules),
            None => Self::Unavailable,
        }
    }

    /// Returns `true` once no further step can change the state
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Available(_) | Self::PermanentlyUnavailable(_))
    }

    /// Advances the handshake by one transition.
    ///
    /// From [`Handshake::Unavailable`] the directory's recovery patches are applied in order, stopping at the first
    /// that fails. From [`Handshake::RecoveryAttempted`] the list is asked for once more. Final states are returned
    /// unchanged.
    ///
    /// # Safety
    ///
    /// The directory's recovery patches must be valid for `memory`; see
    /// [`GuardedPatch::apply`](crate::patcher::guarded::GuardedPatch::apply)
    pub unsafe fn step<D, W, G>(
        self,
        directory: &mut D,
        memory: &mut W,
        diagnostics: &mut G,
    ) -> Self
    where
        D: ModuleDirectory + ?Sized,
        W: MemoryWriter + ?Sized,
        G: Diagnostics + ?Sized,
    {
        match self {
            Self::Unavailable => {
                diagnostics.emit(Event::RecoveryAttempted);
                for patch in directory.recovery_patches() {
                    if let Err(err) = patch.apply(memory) {
                        match err {
                            GuardError::Mismatch { address, found, .. } => {
                                diagnostics.emit(Event::GuardRejected { address, found })
                            }
                            GuardError::Apply(err) => diagnostics.emit(Event::PatchFailed {
                                address: err.address(),
                                reason: err.to_string(),
                            }),
                        }
                        return Self::give_up(
                            EnvironmentUnavailable::RecoveryFailed {
                                address: patch.address,
                            },
                            diagnostics,
                        );
                    }
                }
                Self::RecoveryAttempted
            }
            Self::RecoveryAttempted => match fetch(directory) {
                Some(modules) => Self::Available(modules),
                None => Self::give_up(EnvironmentUnavailable::StillUnavailable, diagnostics),
            },
            done => done,
        }
    }

    /// Steps until the handshake is final
    ///
    /// # Safety
    ///
    /// See [`Handshake::step`]
    pub unsafe fn finish<D, W, G>(
        mut self,
        directory: &mut D,
        memory: &mut W,
        diagnostics: &mut G,
    ) -> Result<Vec<ModuleInfo>, EnvironmentUnavailable>
    where
        D: ModuleDirectory + ?Sized,
        W: MemoryWriter + ?Sized,
        G: Diagnostics + ?Sized,
    {
        while !self.is_final() {
            self = self.step(directory, memory, diagnostics);
        }
        match self {
            Self::Available(modules) => Ok(modules),
            Self::PermanentlyUnavailable(err) => Err(err),
            // `is_final` only lets the two states above out of the loop
            Self::Unavailable | Self::RecoveryAttempted => {
                Err(EnvironmentUnavailable::StillUnavailable)
            }
        }
    }

    /// Moves to [`Handshake::PermanentlyUnavailable`], reporting why
    fn give_up<G: Diagnostics + ?Sized>(err: EnvironmentUnavailable, diagnostics: &mut G) -> Self {
        diagnostics.emit(Event::EnvironmentUnavailable {
            reason: err.to_string(),
        });
        Self::PermanentlyUnavailable(err)
    }
}

/// Obtains the module list, patching out the gates guarding it if the first attempt fails.
///
/// # Safety
///
/// See [`Handshake::step`]
pub unsafe fn acquire_modules<D, W, G>(
    directory: &mut D,
    memory: &mut W,
    diagnostics: &mut G,
) -> Result<Vec<ModuleInfo>, EnvironmentUnavailable>
where
    D: ModuleDirectory + ?Sized,
    W: MemoryWriter + ?Sized,
    G: Diagnostics + ?Sized,
{
    Handshake::begin(directory).finish(directory, memory, diagnostics)
}
