//! Readers and writers for CRIWARE CPK archives and PARC archives.
//!
//! CPK archives are built from UTF tables ([`utf`]) and may carry CRILAYLA
//! compressed files. PARC archives ([`par`]) hold a folder tree whose files
//! may be SLLZ compressed.

pub mod compression;
pub mod cpk;
pub mod endian;
pub mod error;
pub mod par;
pub mod path;
pub mod utf;

pub use cpk::{Cpk, EntryKind, EntryPatch, FileEntry, PatchField, TocKind};
pub use error::{ArchiveError, Result};
pub use par::{ParArchive, ParFile, ParReadOptions, ParWriteOptions};
pub use utf::{CellValue, FieldWidth, Utf};
