//! # Crypto Seams
//!
//! The cipher itself, key storage and storage-policy classification are
//! external collaborators. The core consumes them through the traits here
//! and treats every transform as an opaque, pure operation: no side effects
//! beyond writing the destination buffer.

use core::fmt;

use crate::pool::{IoDesc, PageBuf};

/// Direction of a crypto transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Plaintext in, ciphertext out.
    Encrypt,
    /// Ciphertext in, plaintext out.
    Decrypt,
}

/// Failure reported by a crypto primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// No usable key material for the request's user.
    NoKey,
    /// The transform itself failed.
    TransformFailed,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoKey => write!(f, "no key material"),
            Self::TransformFailed => write!(f, "transform failed"),
        }
    }
}

/// Page-granularity symmetric transform, already instantiated per user.
pub trait PageCipher: Send + Sync {
    /// Transform one page: `src` -> `dst`.
    fn crypt_page(&self, dir: Direction, src: &PageBuf, dst: &mut PageBuf)
        -> Result<(), CryptoError>;

    /// Transform a whole descriptor: `orig` pages -> `clone` pages,
    /// segment by segment.
    fn crypt_io(&self, dir: Direction, orig: &IoDesc, clone: &mut IoDesc)
        -> Result<(), CryptoError>;
}

/// Opaque master-key blob. Contents are never logged or inspected here.
#[derive(Clone)]
pub struct KeyMaterial {
    bytes: [u8; Self::MAX_LEN],
    len: usize,
}

impl KeyMaterial {
    /// Maximum key blob size carried through this layer.
    pub const MAX_LEN: usize = 64;

    /// Wrap a raw key blob; longer inputs are truncated to `MAX_LEN`.
    pub fn from_slice(raw: &[u8]) -> Self {
        let len = raw.len().min(Self::MAX_LEN);
        let mut bytes = [0u8; Self::MAX_LEN];
        bytes[..len].copy_from_slice(&raw[..len]);
        Self { bytes, len }
    }

    /// The key bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Redacted on purpose.
        write!(f, "KeyMaterial({} bytes)", self.len)
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        // Best-effort scrub; the authoritative copy lives in key storage.
        self.bytes.fill(0);
        self.len = 0;
    }
}

/// Per-user master-key lookup, backed by external key storage.
pub trait KeyProvider: Send + Sync {
    /// Key material for `user_id`, or `None` if no key is installed.
    fn master_key(&self, user_id: u32) -> Option<KeyMaterial>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_material_truncates_and_redacts() {
        let long = [7u8; 100];
        let key = KeyMaterial::from_slice(&long);
        assert_eq!(key.as_slice().len(), KeyMaterial::MAX_LEN);
        let dbg = alloc::format!("{:?}", key);
        assert_eq!(dbg, "KeyMaterial(64 bytes)");
    }

    #[test]
    fn key_material_roundtrip() {
        let key = KeyMaterial::from_slice(&[1, 2, 3]);
        assert_eq!(key.as_slice(), &[1, 2, 3]);
    }
}
