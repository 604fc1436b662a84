//! Codecs for the compressed payloads found inside CPK and PAR archives.

pub mod crilayla;
pub mod sllz;

pub use crilayla::{decompress_crilayla, is_crilayla};
pub use sllz::{SllzOptions, SllzVersion};
