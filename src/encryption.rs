//! Encryption keys attached to open arrays.
//!
//! The coordinator pins the key presented at first open and rejects later
//! opens with a differing key. Payload cryptography itself lives in the tile
//! codec layer; here only the kind code and key bytes are compared.

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// The encryption scheme of an array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionType {
    /// Unencrypted.
    NoEncryption,
    /// AES-256-GCM.
    Aes256Gcm,
}

impl EncryptionType {
    /// The 1-byte code stored in generic tile headers.
    #[must_use]
    pub fn wire_code(self) -> u8 {
        match self {
            Self::NoEncryption => 0,
            Self::Aes256Gcm => 1,
        }
    }

    /// Decode a header code.
    ///
    /// # Errors
    /// Returns [`StorageError::ParseError`] for an unknown code.
    pub fn from_wire_code(code: u8) -> Result<Self, StorageError> {
        match code {
            0 => Ok(Self::NoEncryption),
            1 => Ok(Self::Aes256Gcm),
            _ => Err(StorageError::ParseError(format!(
                "unknown encryption type code {code}"
            ))),
        }
    }
}

/// An encryption key: a kind and the key bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptionKey {
    kind: EncryptionType,
    bytes: Vec<u8>,
}

impl EncryptionKey {
    /// The unencrypted key.
    #[must_use]
    pub fn no_encryption() -> Self {
        Self {
            kind: EncryptionType::NoEncryption,
            bytes: Vec::new(),
        }
    }

    /// Create a key of `kind` from `bytes`.
    ///
    /// # Errors
    /// Returns [`StorageError::InvalidArgument`] if the key length does not
    /// fit the kind (AES-256-GCM requires 32 bytes, no-encryption none).
    pub fn new(kind: EncryptionType, bytes: Vec<u8>) -> Result<Self, StorageError> {
        let expected = match kind {
            EncryptionType::NoEncryption => 0,
            EncryptionType::Aes256Gcm => 32,
        };
        if bytes.len() != expected {
            return Err(StorageError::InvalidArgument(format!(
                "encryption key length {} invalid for {kind:?}",
                bytes.len()
            )));
        }
        Ok(Self { kind, bytes })
    }

    /// The key kind.
    #[must_use]
    pub fn kind(&self) -> EncryptionType {
        self.kind
    }
}

impl Default for EncryptionKey {
    fn default() -> Self {
        Self::no_encryption()
    }
}
