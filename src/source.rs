//! # Source
//!
//! Patch files are handed to the engine as [`PatchBlob`]s by any iterator of `Result<PatchBlob, SourceError>`.
//! [`DirectorySource`] is the usual one: every file with the patch extension in a single directory.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Directory patch files are loaded from by default
pub const DEFAULT_DIRECTORY: &str = "wiiu/patches";
/// Extension patch files carry by default
pub const DEFAULT_EXTENSION: &str = "pch";

/// Where to look for patch files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    /// Directory to scan; subdirectories are not searched
    pub directory: PathBuf,
    /// Extension of patch files, without the dot
    pub extension: String,
}
impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            directory: DEFAULT_DIRECTORY.into(),
            extension: DEFAULT_EXTENSION.into(),
        }
    }
}

/// The contents of one patch file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchBlob {
    /// Name used when reporting on this file
    pub name: String,
    /// Raw file contents
    pub bytes: Vec<u8>,
}

/// Errors when finding or reading patch files
#[derive(Debug, Error)]
pub enum SourceError {
    /// The directory couldn't be listed
    #[error("failed to list {}: {source}", .path.display())]
    List {
        /// Directory being listed
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },
    /// A patch file couldn't be read
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        /// File being read
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },
}
impl SourceError {
    /// Path the error is about
    pub fn path(&self) -> &Path {
        match self {
            Self::List { path, .. } | Self::Read { path, .. } => path,
        }
    }
}

/// Supplies patch files to a run, one at a time and in the order they should be applied
///
/// Any iterator of `Result<PatchBlob, SourceError>` is a source, so fixed lists of blobs can be handed to a run
/// directly.
pub trait PatchSource {
    /// Next patch file, or `None` once every file has been handed out
    fn next_file(&mut self) -> Option<Result<PatchBlob, SourceError>>;
}
impl<I> PatchSource for I
where
    I: Iterator<Item = Result<PatchBlob, SourceError>>,
{
    fn next_file(&mut self) -> Option<Result<PatchBlob, SourceError>> {
        self.next()
    }
}

/// Reads every patch file in a directory, in file name order
#[derive(Debug)]
pub struct DirectorySource {
    /// Paths still to be read, and entries that couldn't be inspected, in order
    entries: std::vec::IntoIter<Result<PathBuf, SourceError>>,
}
impl DirectorySource {
    /// Lists the patch files described by `config`.
    ///
    /// Symbolic links are followed. Entries that can't be inspected are handed out as errors in their place, so they
    /// are reported like unreadable files.
    pub fn open(config: &SourceConfig) -> Result<Self, SourceError> {
        let list_err = |source| SourceError::List {
            path: config.directory.clone(),
            source,
        };

        let mut entries = Vec::new();
        for entry in fs::read_dir(&config.directory).map_err(list_err)? {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(source) => {
                    entries.push(Err(list_err(source)));
                    continue;
                }
            };
            if path.extension() != Some(OsStr::new(&config.extension)) {
                continue;
            }
            match fs::metadata(&path) {
                Ok(metadata) if metadata.is_file() => entries.push(Ok(path)),
                Ok(_) => {}
                Err(source) => entries.push(Err(SourceError::Read { path, source })),
            }
        }
        entries.sort_by(|a, b| entry_path(a).cmp(entry_path(b)));

        Ok(Self {
            entries: entries.into_iter(),
        })
    }
}
impl PatchSource for DirectorySource {
    fn next_file(&mut self) -> Option<Result<PatchBlob, SourceError>> {
        let path = match self.entries.next()? {
            Ok(path) => path,
            Err(err) => return Some(Err(err)),
        };
        Some(match fs::read(&path) {
            Ok(bytes) => Ok(PatchBlob {
                name: path.display().to_string(),
                bytes,
            }),
            Err(source) => Err(SourceError::Read { path, source }),
        })
    }
}

/// Path a listed entry sorts by
fn entry_path(entry: &Result<PathBuf, SourceError>) -> &Path {
    match entry {
        Ok(path) => path,
        Err(err) => err.path(),
    }
}
