//! # Format
//!
//! This module covers the on-disk patch file format and its decoder.
//!
//! All multibyte fields are big-endian. A file is an 8-byte header followed by tagged, length-prefixed records:
//!
//! ```text
//! +0  magic        u32   0xBABECAFE
//! +4  version      u16   1
//! +6  record count u16   upper bound only
//! +8  records      { type: u16, length: u16, value: [u8; length] }*
//! ```

pub mod reader;

use thiserror::Error;

use crate::diag::{Diagnostics, Event};

use self::reader::{ReadError, Reader};

/// Magic number at the start of every patch file
pub const MAGIC: u32 = 0xBABE_CAFE;
/// The only supported format version
pub const VERSION: u16 = 1;
/// Size of the name field in a write-bytes record
pub const MODULE_NAME_LEN: usize = 32;
/// Fixed part of a write-words record value (the target address)
pub const WRITE_WORDS_HEADER_LEN: usize = 4;
/// Fixed part of a write-bytes record value (name, offset base, reserved, flag, offset)
pub const WRITE_BYTES_HEADER_LEN: usize = MODULE_NAME_LEN + 2 + 1 + 1 + 4;
/// Write-bytes flag marking the data as instructions
pub const FLAG_INSTRUCTIONS: u8 = 1 << 0;

/// Record type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Words written at an absolute address
    WriteWords,
    /// Bytes written relative to a loaded module
    WriteBytes,
    /// Anything else, including the reserved tags 1 and 3
    Unknown(u16),
}
impl From<u16> for RecordKind {
    fn from(tag: u16) -> Self {
        match tag {
            0 => Self::WriteWords,
            2 => Self::WriteBytes,
            other => Self::Unknown(other),
        }
    }
}

/// What a byte patch's offset is relative to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetBase {
    /// The offset is an absolute address
    Absolute,
    /// Start of the module's code
    ModuleText,
    /// Start of the module's data
    ModuleData,
    /// Start of the module's read-only data
    ModuleReadOnly,
    /// Unrecognized value; resolved like [`OffsetBase::Absolute`]
    Unknown(u16),
}
impl From<u16> for OffsetBase {
    fn from(raw: u16) -> Self {
        match raw {
            0 => Self::Absolute,
            1 => Self::ModuleText,
            2 => Self::ModuleData,
            3 => Self::ModuleReadOnly,
            other => Self::Unknown(other),
        }
    }
}

/// Words written at an absolute address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordPatch {
    /// Address of the first word
    pub target_address: u32,
    /// Words to write, in order
    pub words: Vec<u32>,
}

/// Bytes written relative to a loaded module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytePatch {
    /// Suffix of the target module's name
    pub target_module_suffix: String,
    /// What `offset` is relative to
    pub offset_base: OffsetBase,
    /// Offset from the base, or the address itself for [`OffsetBase::Absolute`]
    pub offset: u32,
    /// Whether the data is code and needs the instruction cache invalidated
    pub is_instructions: bool,
    /// Bytes to write
    pub data: Vec<u8>,
}
impl BytePatch {
    /// Returns `true` if this patch targets the module called `module_name`.
    ///
    /// The name matches when it ends with the suffix, either as a whole or once its extension is removed, so
    /// `coreinit` matches `homebrew_coreinit.rpl` but not `coreinit_extra.rpl`.
    pub fn targets(&self, module_name: &str) -> bool {
        let suffix = self.target_module_suffix.as_str();
        module_name.ends_with(suffix)
            || module_name
                .rsplit_once('.')
                .is_some_and(|(stem, _)| stem.ends_with(suffix))
    }
}

/// A decoded patch file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchFile {
    /// Word patches, in file order
    pub word_patches: Vec<WordPatch>,
    /// Byte patches, in file order
    pub byte_patches: Vec<BytePatch>,
}

/// Errors that reject a whole file
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    /// The file doesn't start with [`MAGIC`]
    #[error("bad magic {found:#010x}, expected {expected:#010x}", expected = MAGIC)]
    BadMagic {
        /// Magic that was found
        found: u32,
    },
    /// The file is a version other than [`VERSION`]
    #[error("unsupported version {found}, expected {expected}", expected = VERSION)]
    UnsupportedVersion {
        /// Version that was found
        found: u16,
    },
    /// The header or a record runs past the end of the file
    #[error("truncated patch file: {0}")]
    Truncated(#[from] ReadError),
}

/// Errors that drop a single record
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    /// The record is shorter than its fixed header
    #[error("record of {len} bytes is shorter than its {needed}-byte header")]
    TooShort {
        /// Length of the record value
        len: usize,
        /// Length of the fixed header for this record kind
        needed: usize,
    },
    /// A write-words payload is not made of whole words
    #[error("word payload of {len} bytes is not a multiple of 4")]
    MisalignedWords {
        /// Length of the payload after the address
        len: usize,
    },
}

impl PatchFile {
    /// Decodes a patch file.
    ///
    /// Header problems and records overrunning the buffer reject the whole file. Malformed records are dropped and
    /// records of unknown kinds are skipped; both are reported to `diagnostics` and decoding carries on with the next
    /// record. The header's record count is only trusted as far as the buffer actually goes.
    pub fn decode<G: Diagnostics + ?Sized>(
        bytes: &[u8],
        diagnostics: &mut G,
    ) -> Result<Self, FormatError> {
        let mut reader = Reader::new(bytes);

        let magic = reader.u32()?;
        if magic != MAGIC {
            return Err(FormatError::BadMagic { found: magic });
        }
        let version = reader.u16()?;
        if version != VERSION {
            return Err(FormatError::UnsupportedVersion { found: version });
        }
        let declared = reader.u16()?;

        let mut file = Self::default();
        for index in 0..usize::from(declared) {
            if reader.is_empty() {
                diagnostics.emit(Event::RecordCountOverstated {
                    declared,
                    found: index,
                });
                break;
            }

            let tag = reader.u16()?;
            let len = usize::from(reader.u16()?);
            // the outer reader is now past this record no matter what the value holds
            let value = reader.split(len)?.rest();

            let decoded = match RecordKind::from(tag) {
                RecordKind::WriteWords => decode_words(value).map(|p| file.word_patches.push(p)),
                RecordKind::WriteBytes => decode_bytes(value).map(|p| file.byte_patches.push(p)),
                RecordKind::Unknown(tag) => {
                    diagnostics.emit(Event::RecordSkipped { index, tag, len });
                    Ok(())
                }
            };
            if let Err(error) = decoded {
                diagnostics.emit(Event::RecordDropped { index, error });
            }
        }

        Ok(file)
    }

    /// Returns `true` if the file holds no patches
    pub fn is_empty(&self) -> bool {
        self.word_patches.is_empty() && self.byte_patches.is_empty()
    }
}

/// Decodes the value of a write-words record
fn decode_words(value: &[u8]) -> Result<WordPatch, RecordError> {
    let Some((address, payload)) = value.split_first_chunk::<WRITE_WORDS_HEADER_LEN>() else {
        return Err(RecordError::TooShort {
            len: value.len(),
            needed: WRITE_WORDS_HEADER_LEN,
        });
    };
    if !payload.len().is_multiple_of(4) {
        return Err(RecordError::MisalignedWords { len: payload.len() });
    }
    let words = payload
        .chunks_exact(4)
        .map(|w| u32::from_be_bytes([w[0], w[1], w[2], w[3]]))
        .collect();

    Ok(WordPatch {
        target_address: u32::from_be_bytes(*address),
        words,
    })
}

/// Decodes the value of a write-bytes record
fn decode_bytes(value: &[u8]) -> Result<BytePatch, RecordError> {
    let Some((header, data)) = value.split_first_chunk::<WRITE_BYTES_HEADER_LEN>() else {
        return Err(RecordError::TooShort {
            len: value.len(),
            needed: WRITE_BYTES_HEADER_LEN,
        });
    };
    let [.., base_hi, base_lo, _reserved, flag, o0, o1, o2, o3] = *header;

    let mut name = [0u8; MODULE_NAME_LEN];
    name.copy_from_slice(&header[..MODULE_NAME_LEN]);
    // the name is only bounded by the field, not by the file
    name[MODULE_NAME_LEN - 1] = 0;
    let name_len = name.iter().position(|&b| b == 0).unwrap_or(MODULE_NAME_LEN);

    Ok(BytePatch {
        target_module_suffix: String::from_utf8_lossy(&name[..name_len]).into_owned(),
        offset_base: OffsetBase::from(u16::from_be_bytes([base_hi, base_lo])),
        offset: u32::from_be_bytes([o0, o1, o2, o3]),
        is_instructions: flag & FLAG_INSTRUCTIONS != 0,
        data: data.to_vec(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use proptest::prelude::*;

    use crate::diag::{Event, Recorder};

    use super::reader::ReadError;
    use super::{BytePatch, FormatError, OffsetBase, PatchFile, RecordError, WordPatch, MAGIC, VERSION};

    /// Builds a patch file header
    pub(crate) fn header(count: u16) -> Vec<u8> {
        let mut out = vec![0xBA, 0xBE, 0xCA, 0xFE, 0x00, 0x01];
        out.extend_from_slice(&count.to_be_bytes());
        out
    }

    /// Builds a record with an arbitrary tag
    pub(crate) fn record(tag: u16, value: &[u8]) -> Vec<u8> {
        let mut out = tag.to_be_bytes().to_vec();
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value);
        out
    }

    /// Builds a write-words record
    pub(crate) fn words_record(address: u32, words: &[u32]) -> Vec<u8> {
        let mut value = address.to_be_bytes().to_vec();
        for w in words {
            value.extend_from_slice(&w.to_be_bytes());
        }
        record(0, &value)
    }

    /// Builds a write-bytes record
    pub(crate) fn bytes_record(
        module: &str,
        base: u16,
        flag: u8,
        offset: u32,
        data: &[u8],
    ) -> Vec<u8> {
        let mut value = [0u8; 32].to_vec();
        value[..module.len()].copy_from_slice(module.as_bytes());
        value.extend_from_slice(&base.to_be_bytes());
        value.push(0xEE);
        value.push(flag);
        value.extend_from_slice(&offset.to_be_bytes());
        value.extend_from_slice(data);
        record(2, &value)
    }

    /// Decodes with a throwaway recorder
    fn decode(bytes: &[u8]) -> Result<PatchFile, FormatError> {
        PatchFile::decode(bytes, &mut Recorder::new())
    }

    #[test]
    /// A header with no records is an empty file, not an error
    fn test_empty_file() {
        let file = decode(&header(0)).unwrap();
        assert!(file.is_empty());
    }

    #[test]
    /// Wrong magic or version rejects the file
    fn test_bad_header() {
        let mut bytes = header(0);
        bytes[3] = 0xFF;
        assert_eq!(
            decode(&bytes),
            Err(FormatError::BadMagic { found: 0xBABE_CAFF })
        );

        let mut bytes = header(0);
        bytes[5] = 2;
        assert_eq!(
            decode(&bytes),
            Err(FormatError::UnsupportedVersion { found: 2 })
        );

        assert!(matches!(
            decode(&[0xBA, 0xBE, 0xCA]),
            Err(FormatError::Truncated(_))
        ));
    }

    #[test]
    /// Both record kinds decode with every field in place
    fn test_records() {
        let mut bytes = header(2);
        bytes.extend(words_record(0x0200_0000, &[0x6000_0000, 0x4E80_0020]));
        bytes.extend(bytes_record("coreinit.rpl", 1, 1, 0x1234, &[0xAA, 0xBB]));

        let file = decode(&bytes).unwrap();
        assert_eq!(
            file.word_patches,
            [WordPatch {
                target_address: 0x0200_0000,
                words: vec![0x6000_0000, 0x4E80_0020],
            }]
        );
        assert_eq!(
            file.byte_patches,
            [BytePatch {
                target_module_suffix: "coreinit.rpl".into(),
                offset_base: OffsetBase::ModuleText,
                offset: 0x1234,
                is_instructions: true,
                data: vec![0xAA, 0xBB],
            }]
        );
    }

    #[test]
    /// A misaligned word payload drops only that record and the stream stays framed
    fn test_misaligned_words() {
        let mut bytes = header(2);
        bytes.extend(record(0, &[0, 0, 0x10, 0, 0xAA, 0xBB, 0xCC]));
        bytes.extend(words_record(0x10, &[1]));

        let mut recorder = Recorder::new();
        let file = PatchFile::decode(&bytes, &mut recorder).unwrap();

        assert_eq!(file.word_patches.len(), 1);
        assert_eq!(file.word_patches[0].target_address, 0x10);
        assert_eq!(
            recorder.events(),
            [Event::RecordDropped {
                index: 0,
                error: RecordError::MisalignedWords { len: 3 },
            }]
        );
    }

    #[test]
    /// Records shorter than their fixed header are dropped instead of underflowing
    fn test_short_records() {
        let mut bytes = header(3);
        bytes.extend(record(0, &[0, 0]));
        bytes.extend(record(2, &[0u8; 39]));
        bytes.extend(bytes_record("a", 0, 0, 4, &[]));

        let mut recorder = Recorder::new();
        let file = PatchFile::decode(&bytes, &mut recorder).unwrap();

        assert!(file.word_patches.is_empty());
        assert_eq!(file.byte_patches.len(), 1);
        assert!(file.byte_patches[0].data.is_empty());
        assert_eq!(
            recorder.count(|e| matches!(
                e,
                Event::RecordDropped {
                    error: RecordError::TooShort { .. },
                    ..
                }
            )),
            2
        );
    }

    #[test]
    /// Unknown and reserved records are skipped by exactly their length
    fn test_unknown_records() {
        let mut bytes = header(4);
        bytes.extend(record(1, &[0xFF; 5]));
        bytes.extend(record(3, &[]));
        bytes.extend(record(0x7777, &[0x00, 0x00, 0x00, 0x00]));
        bytes.extend(words_record(0x20, &[]));

        let mut recorder = Recorder::new();
        let file = PatchFile::decode(&bytes, &mut recorder).unwrap();

        assert_eq!(
            file.word_patches,
            [WordPatch {
                target_address: 0x20,
                words: vec![],
            }]
        );
        assert_eq!(
            recorder.events(),
            [
                Event::RecordSkipped {
                    index: 0,
                    tag: 1,
                    len: 5,
                },
                Event::RecordSkipped {
                    index: 1,
                    tag: 3,
                    len: 0,
                },
                Event::RecordSkipped {
                    index: 2,
                    tag: 0x7777,
                    len: 4,
                },
            ]
        );
    }

    #[test]
    /// Only bit 0 of the flag byte marks instructions
    fn test_instruction_flag() {
        let mut bytes = header(2);
        bytes.extend(bytes_record("a.rpl", 0, 0xFE, 0, &[1]));
        bytes.extend(bytes_record("a.rpl", 0, 0x01, 0, &[1]));

        let file = decode(&bytes).unwrap();
        assert!(!file.byte_patches[0].is_instructions);
        assert!(file.byte_patches[1].is_instructions);
    }

    #[test]
    /// The name field is bounded even without a terminator, and the reserved byte is ignored
    fn test_unterminated_name() {
        let mut bytes = header(1);
        let mut rec = bytes_record("", 9, 0, 0, &[1]);
        // fill the whole name field with 'x'
        rec[4..36].fill(b'x');
        bytes.extend(rec);

        let file = decode(&bytes).unwrap();
        let patch = &file.byte_patches[0];
        assert_eq!(patch.target_module_suffix, "x".repeat(31));
        assert_eq!(patch.offset_base, OffsetBase::Unknown(9));
        assert!(!patch.is_instructions);
    }

    #[test]
    /// A record running past the end of the buffer rejects the whole file
    fn test_overrunning_record() {
        let mut bytes = header(2);
        bytes.extend(words_record(0x10, &[1]));
        let mut bad = words_record(0x20, &[2, 3]);
        bad.truncate(bad.len() - 1);
        bytes.extend(bad);

        assert!(matches!(decode(&bytes), Err(FormatError::Truncated(_))));
    }

    #[test]
    /// An overstated record count stops at the end of the buffer
    fn test_overstated_count() {
        let mut bytes = header(0xFFFF);
        bytes.extend(words_record(0x10, &[1]));

        let mut recorder = Recorder::new();
        let file = PatchFile::decode(&bytes, &mut recorder).unwrap();

        assert_eq!(file.word_patches.len(), 1);
        assert_eq!(
            recorder.events(),
            [Event::RecordCountOverstated {
                declared: 0xFFFF,
                found: 1,
            }]
        );
    }

    #[test]
    /// An understated record count ignores the trailing records
    fn test_understated_count() {
        let mut bytes = header(1);
        bytes.extend(words_record(0x10, &[1]));
        bytes.extend(words_record(0x20, &[2]));

        let file = decode(&bytes).unwrap();
        assert_eq!(file.word_patches.len(), 1);
    }

    #[test]
    /// Suffix matching only matches the end of the name
    fn test_targets() {
        let patch = BytePatch {
            target_module_suffix: "coreinit".into(),
            offset_base: OffsetBase::Absolute,
            offset: 0,
            is_instructions: false,
            data: vec![],
        };
        assert!(patch.targets("homebrew_coreinit.rpl"));
        assert!(patch.targets("homebrew_coreinit"));
        assert!(patch.targets("coreinit"));
        assert!(!patch.targets("coreinit_extra.rpl"));
        assert!(!patch.targets("coreinit.rpl.bak"));

        let patch = BytePatch {
            target_module_suffix: "coreinit.rpl".into(),
            ..patch
        };
        assert!(patch.targets("homebrew_coreinit.rpl"));
    }

    /// A well-formed file with one record of each kind
    fn sample_file() -> Vec<u8> {
        let mut bytes = header(3);
        bytes.extend(words_record(0x0100_0000, &[0x6000_0000, 0x3860_0001]));
        bytes.extend(record(1, &[1, 2, 3]));
        bytes.extend(bytes_record("foo.rpl", 2, 1, 0x40, &[9, 8, 7]));
        bytes
    }

    proptest! {
        #[test]
        /// Every strict prefix that cuts into a record is rejected, never partially read
        fn prop_truncated_prefix_rejected(cut in 0usize..1000) {
            let bytes = sample_file();
            let cut = cut % bytes.len();
            // a prefix ending exactly between records is a valid, shorter file
            let boundaries = [8usize, 8 + 16, 8 + 16 + 7];
            let result = decode(&bytes[..cut]);
            if boundaries.contains(&cut) {
                prop_assert!(result.is_ok());
            } else {
                prop_assert!(matches!(
                    result,
                    Err(FormatError::Truncated(ReadError::OutOfBounds { .. }))
                ), "unexpected result: {:?}", result);
            }
        }

        #[test]
        /// Arbitrary bytes after a valid header never panic and never yield more records than fit
        fn prop_arbitrary_body(
            body in proptest::collection::vec(any::<u8>(), 0..512),
            count in any::<u16>(),
        ) {
            let mut bytes = header(count);
            bytes.extend_from_slice(&body);
            if let Ok(file) = decode(&bytes) {
                let records = file.word_patches.len() + file.byte_patches.len();
                prop_assert!(records <= usize::from(count));
                prop_assert!(records * 4 <= body.len());
            }
        }

        #[test]
        /// Any other magic or version rejects the file, whatever follows the header
        fn prop_bad_header_rejected(
            magic in prop_oneof![Just(MAGIC), any::<u32>()],
            version in prop_oneof![Just(VERSION), any::<u16>()],
            count in any::<u16>(),
        ) {
            prop_assume!(magic != MAGIC || version != VERSION);
            let mut bytes = magic.to_be_bytes().to_vec();
            bytes.extend_from_slice(&version.to_be_bytes());
            bytes.extend_from_slice(&count.to_be_bytes());
            bytes.extend(words_record(0x10, &[1]));

            let expected = if magic != MAGIC {
                FormatError::BadMagic { found: magic }
            } else {
                FormatError::UnsupportedVersion { found: version }
            };
            prop_assert_eq!(decode(&bytes), Err(expected));
        }
    }
}
