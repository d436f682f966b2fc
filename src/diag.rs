//! # Diagnostics
//!
//! Decoding and patching report what they do through an injected [`Diagnostics`] sink instead of logging directly.
//! [`TracingDiagnostics`] forwards everything to `tracing`; [`Recorder`] keeps events in memory.

use crate::format::RecordError;

/// Something worth reporting while decoding or applying patches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A patch file decoded successfully
    FileLoaded {
        /// Name of the file
        name: String,
        /// Number of word patches it holds
        word_patches: usize,
        /// Number of byte patches it holds
        byte_patches: usize,
    },
    /// A patch file was rejected as a whole
    FileRejected {
        /// Name of the file
        name: String,
        /// Why it was rejected
        reason: String,
    },
    /// A malformed record was dropped
    RecordDropped {
        /// Index of the record within its file
        index: usize,
        /// What was wrong with it
        error: RecordError,
    },
    /// A record of an unknown kind was skipped
    RecordSkipped {
        /// Index of the record within its file
        index: usize,
        /// Raw type tag
        tag: u16,
        /// Length of the skipped value
        len: usize,
    },
    /// The buffer ran out before the declared number of records was read
    RecordCountOverstated {
        /// Count claimed by the header
        declared: u16,
        /// Records actually present
        found: usize,
    },
    /// Bytes were written (and flushed) at an address
    PatchApplied {
        /// First address written
        address: u32,
        /// Number of bytes written
        len: usize,
        /// Whether the instruction cache was invalidated
        instructions: bool,
    },
    /// No loaded module matched a byte patch's target
    PatchUnresolved {
        /// Module suffix that found no match
        suffix: String,
    },
    /// A write or cache operation failed
    PatchFailed {
        /// Address of the failing operation
        address: u32,
        /// What went wrong
        reason: String,
    },
    /// The module list was unavailable, so the gating branches are being patched out
    RecoveryAttempted,
    /// A guarded patch found a word it didn't expect
    GuardRejected {
        /// Address of the word
        address: u32,
        /// Value found there
        found: u32,
    },
    /// The module list could not be obtained; nothing will be patched
    EnvironmentUnavailable {
        /// Why the handshake gave up
        reason: String,
    },
}

/// Sink for [`Event`]s
pub trait Diagnostics {
    /// Reports a single event
    fn emit(&mut self, event: Event);
}
impl<G: Diagnostics + ?Sized> Diagnostics for &mut G {
    fn emit(&mut self, event: Event) {
        (**self).emit(event)
    }
}

/// Forwards events to the `tracing` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;
impl Diagnostics for TracingDiagnostics {
    fn emit(&mut self, event: Event) {
        match event {
            Event::FileLoaded {
                name,
                word_patches,
                byte_patches,
            } => tracing::debug!(%name, word_patches, byte_patches, "loaded patch file"),
            Event::FileRejected { name, reason } => {
                tracing::warn!(%name, %reason, "rejected patch file")
            }
            Event::RecordDropped { index, error } => {
                tracing::warn!(index, %error, "dropped malformed record")
            }
            Event::RecordSkipped { index, tag, len } => {
                tracing::debug!(index, tag, len, "skipped unknown record")
            }
            Event::RecordCountOverstated { declared, found } => {
                tracing::warn!(declared, found, "record count exceeds file contents")
            }
            Event::PatchApplied {
                address,
                len,
                instructions,
            } => tracing::debug!(
                address = format_args!("{address:#010x}"),
                len,
                instructions,
                "patch applied"
            ),
            Event::PatchUnresolved { suffix } => {
                tracing::warn!(%suffix, "no loaded module matches patch target")
            }
            Event::PatchFailed { address, reason } => tracing::error!(
                address = format_args!("{address:#010x}"),
                %reason,
                "patch failed"
            ),
            Event::RecoveryAttempted => {
                tracing::debug!("module list unavailable, patching module list gates")
            }
            Event::GuardRejected { address, found } => tracing::warn!(
                address = format_args!("{address:#010x}"),
                found = format_args!("{found:#010x}"),
                "unexpected instruction at guarded patch site"
            ),
            Event::EnvironmentUnavailable { reason } => {
                tracing::error!(%reason, "module list unavailable, not patching")
            }
        }
    }
}

/// Keeps every event in memory, in order
#[derive(Debug, Default, Clone)]
pub struct Recorder {
    /// Events seen so far
    events: Vec<Event>,
}
impl Recorder {
    /// Creates an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Events seen so far
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Number of events matching `pred`
    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.iter().filter(|&e| pred(e)).count()
    }

    /// Removes and returns every event seen so far
    pub fn take(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }
}
impl Diagnostics for Recorder {
    fn emit(&mut self, event: Event) {
        self.events.push(event);
    }
}
