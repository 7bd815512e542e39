//! Error types for NX image conversion.
//!
//! This module provides error handling for all conversion operations,
//! including container detection, image materialization, heuristic section
//! discovery, and ELF synthesis.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for NX image conversion operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to read file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write output file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Container Errors ====================
    #[error("no NSO, NRO, or MOD magic matched")]
    UnknownContainer,

    #[error("corrupt container: {reason}")]
    CorruptContainer { reason: String },

    #[error("LZ4 decompression of segment {segment} failed")]
    Decompress { segment: usize },

    // ==================== Raw MOD Errors ====================
    #[error("raw MOD image has no discoverable PLT")]
    MissingPlt,

    #[error("raw MOD layout invariant not satisfied: {reason}")]
    BadLayout { reason: &'static str },

    // ==================== Locally Recovered Conditions ====================
    #[error("exception frame measurement failed at offset {offset:#x}")]
    BadEh { offset: usize },

    #[error("no free section index meets ordering constraint for sh_addr {addr:#x}")]
    SectionSlotExhausted { addr: u64 },

    // ==================== Bounds Errors ====================
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

/// A specialized Result type for conversion operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if this error indicates a recoverable condition.
    ///
    /// Recoverable conditions (a failed exception-frame measurement, an
    /// exhausted ordered section slot) are logged as warnings and the
    /// affected sections are omitted or relocated; they never abort the
    /// conversion of the current file.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::BadEh { .. } | Error::SectionSlotExhausted { .. }
        )
    }

    /// Creates a corrupt-container error with a formatted reason.
    #[inline]
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Error::CorruptContainer {
            reason: reason.into(),
        }
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall { needed, available }
    }
}
