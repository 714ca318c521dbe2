//! OTR key trust: the text/binary codec pair behind out-of-band key verification.
//!
//! This crate turns the S-expression key store written by libpurple's OTR
//! plugin into typed DSA keys, and encodes those keys into the OTRv3 wire
//! format from which their fingerprints are computed. It includes:
//!
//! - **ints**: fixed-width and multi-precision (MPI) unsigned integer codec
//! - **sexp**: S-expression atom grammar and parser
//! - **record**: folding of parsed trees into key-addressable records
//! - **crypto**: SHA-1 digests, base64 armor, constant-time comparison
//! - **key**: DSA public/private key codec, keytype registry and fingerprints
//! - **store**: key-store accounts and the fingerprint table
//! - **config**: key-store file locations

pub mod config;
pub mod crypto;
pub mod ints;
pub mod key;
pub mod record;
pub mod sexp;
pub mod store;

/// Errors that can occur while parsing or decoding key material.
///
/// Every error aborts the whole operation; no partial result is returned.
#[derive(Debug, thiserror::Error)]
pub enum KeyTrustError {
    #[error("Structural error at offset {offset}: {message}")]
    Structural { offset: usize, message: String },

    #[error("Length mismatch at offset {offset}: declared {declared} bytes, found {actual}")]
    LengthMismatch {
        offset: usize,
        declared: usize,
        actual: usize,
    },

    #[error("Width overflow: value needs {needed} bytes, width is {width}")]
    WidthOverflow { width: usize, needed: usize },

    /// The keytype code always sits at offset 0 of the decoded buffer.
    #[error("Unknown key type 0x{0:04x} at offset 0")]
    UnknownKeyType(u16),

    #[error("Trailing data at offset {offset}: {remaining} bytes left unconsumed")]
    TrailingData { offset: usize, remaining: usize },

    /// A well-formed tree that does not have the expected record shape.
    /// Folded trees carry no byte positions, so the message names the
    /// offending record and field instead.
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeyTrustError {
    /// Byte offset into the input where the failure was detected, if the
    /// error concerns a position in the input.
    pub fn offset(&self) -> Option<usize> {
        match self {
            KeyTrustError::Structural { offset, .. }
            | KeyTrustError::LengthMismatch { offset, .. }
            | KeyTrustError::TrailingData { offset, .. } => Some(*offset),
            KeyTrustError::UnknownKeyType(_) => Some(0),
            _ => None,
        }
    }

    pub(crate) fn structural(offset: usize, message: impl Into<String>) -> Self {
        KeyTrustError::Structural {
            offset,
            message: message.into(),
        }
    }
}
