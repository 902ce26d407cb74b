/*
 * ApkSigBlock v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! Error types for the signing engine.
//! Every failure aborts the current run; nothing here is retried or downgraded.

use std::{fmt, io};

/// Comprehensive error type for all signing and verification operations.
#[derive(Debug)]
pub enum SignerError {
    /// I/O errors during read/write/seek/truncate, including short reads
    Io(io::Error),
    /// Unrecognized archive structure, missing end record, block self-check mismatch
    Format(String),
    /// Key family outside the supported set
    UnsupportedKey(String),
    /// Digest or signature computation, or re-verification, failed
    Crypto(String),
    /// A payload exceeds an addressable-length limit
    Size(String),
    /// Raw failure reported by `ring`
    Ring(ring::error::Unspecified),
    /// Key material rejected by `ring`
    KeyRejected(ring::error::KeyRejected),
    /// PEM format parsing errors
    Pem(pem::PemError),
    /// Validation failures while checking an existing signing block
    Validation(String),
    /// Configuration or setup errors
    Config(String),
}

pub type Result<T> = std::result::Result<T, SignerError>;

impl fmt::Display for SignerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignerError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                write!(f, "I/O Error: unexpected end of data ({})", e)
            }
            SignerError::Io(e) => write!(f, "I/O Error: {}", e),
            SignerError::Format(s) => write!(f, "Format Error: {}", s),
            SignerError::UnsupportedKey(s) => write!(f, "Unsupported Key: {}", s),
            SignerError::Crypto(s) => write!(f, "Cryptography Error: {}", s),
            SignerError::Size(s) => write!(f, "Size Error: {}", s),
            SignerError::Ring(e) => write!(f, "Cryptography Error: {}", e),
            SignerError::KeyRejected(e) => write!(f, "Key Rejected: {}", e),
            SignerError::Pem(e) => write!(f, "PEM Parsing Error: {}", e),
            SignerError::Validation(s) => write!(f, "Validation Error: {}", s),
            SignerError::Config(s) => write!(f, "Configuration Error: {}", s),
        }
    }
}

impl std::error::Error for SignerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignerError::Io(e) => Some(e),
            SignerError::Pem(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SignerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ring::error::Unspecified> for SignerError {
    fn from(e: ring::error::Unspecified) -> Self {
        Self::Ring(e)
    }
}

impl From<ring::error::KeyRejected> for SignerError {
    fn from(e: ring::error::KeyRejected) -> Self {
        Self::KeyRejected(e)
    }
}

impl From<pem::PemError> for SignerError {
    fn from(e: pem::PemError) -> Self {
        Self::Pem(e)
    }
}

impl SignerError {
    /// True when the failure is a short read on fixed-length data.
    pub fn is_unexpected_eof(&self) -> bool {
        matches!(self, SignerError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}
