//! Outcomes of applying patch files

use thiserror::Error;

use crate::format::FormatError;
use crate::patcher::ApplyError;
use crate::source::SourceError;

use super::ResolutionError;

/// What happened to the patches of one file
#[derive(Debug)]
pub struct ApplyReport<E> {
    /// Address and length of every successful write, in the order they were made
    pub applied: Vec<(u32, usize)>,
    /// Byte patches whose module wasn't loaded
    pub unresolved: Vec<ResolutionError>,
    /// Patches whose write or cache maintenance failed
    pub failed: Vec<ApplyError<E>>,
}
impl<E> Default for ApplyReport<E> {
    fn default() -> Self {
        Self {
            applied: Vec::new(),
            unresolved: Vec::new(),
            failed: Vec::new(),
        }
    }
}
impl<E> ApplyReport<E> {
    /// Returns `true` if every patch was applied
    pub fn is_clean(&self) -> bool {
        self.unresolved.is_empty() && self.failed.is_empty()
    }
}

/// Reasons a whole file was skipped
#[derive(Debug, Error)]
pub enum FileError {
    /// The file couldn't be read
    #[error("{0}")]
    Source(#[from] SourceError),
    /// The file isn't a valid patch file
    #[error("{0}")]
    Format(#[from] FormatError),
}

/// What happened to one file
#[derive(Debug)]
pub struct FileOutcome<E> {
    /// Name of the file
    pub name: String,
    /// Its report, or why it was skipped
    pub result: Result<ApplyReport<E>, FileError>,
}

/// What happened during a whole run
#[derive(Debug)]
pub struct RunSummary<E> {
    /// Every file seen, in order
    pub files: Vec<FileOutcome<E>>,
}
impl<E> Default for RunSummary<E> {
    fn default() -> Self {
        Self { files: Vec::new() }
    }
}
impl<E> RunSummary<E> {
    /// Number of files that decoded
    pub fn loaded(&self) -> usize {
        self.files.iter().filter(|f| f.result.is_ok()).count()
    }

    /// Number of files skipped as a whole
    pub fn rejected(&self) -> usize {
        self.files.len() - self.loaded()
    }

    /// Patches applied across every file
    pub fn applied(&self) -> usize {
        self.reports().map(|r| r.applied.len()).sum()
    }

    /// Reports of the files that decoded
    pub fn reports(&self) -> impl Iterator<Item = &ApplyReport<E>> {
        self.files.iter().filter_map(|f| f.result.as_ref().ok())
    }
}
