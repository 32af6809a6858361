// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ed25519 envelope signing and verification.
//!
//! Key files hold a hex-encoded 32-byte value (the signing seed or the
//! public key) followed by an optional newline.
//!
//! Loading signing material fails loudly: an agent must not start unsigned.
//! Verification never fails loudly: a bad signature is an expected outcome
//! and is reported as `false`.

use crate::canonical::canonicalize;
use crate::envelope::{Envelope, EnvelopeError};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zeroize::Zeroizing;

/// Ed25519 public key length.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Ed25519 signature length.
pub const SIGNATURE_LEN: usize = 64;

/// Errors loading or storing key material.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("cannot read key file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot write key file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed key in {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

/// Holds an agent's private signing key.
pub struct EnvelopeSigner {
    key: SigningKey,
}

impl std::fmt::Debug for EnvelopeSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeSigner")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

impl EnvelopeSigner {
    /// Build a signer from a raw 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(seed),
        }
    }

    /// Generate a fresh key from the OS RNG.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    /// Load a signer from a hex seed file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SigningError> {
        let path = path.as_ref();
        let seed = read_key_file(path)?;
        Ok(Self::from_seed(&seed))
    }

    /// Write the seed and public key files (`<path>` and `<path>.pub`).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<PathBuf, SigningError> {
        let path = path.as_ref();
        let seed_hex = Zeroizing::new(hex::encode(self.key.to_bytes()));
        write_key_file(path, seed_hex.as_str(), true)?;

        let pub_path = public_key_path(path);
        write_key_file(&pub_path, &self.public_key_hex(), false)?;
        Ok(pub_path)
    }

    /// Public half of the key.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.key.verifying_key().to_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    /// Sign canonical bytes.
    pub fn sign(&self, canonical: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.key.sign(canonical).to_bytes()
    }

    /// Sign `envelope` in place over its canonical form.
    pub fn sign_envelope(&self, envelope: &mut Envelope) -> Result<(), EnvelopeError> {
        envelope.signature = self.sign(&canonicalize(envelope)?).to_vec();
        Ok(())
    }
}

/// Verify `signature` over `canonical` with `public_key`.
///
/// Any malformed input yields `false`.
pub fn verify(public_key: &[u8], canonical: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; PUBLIC_KEY_LEN]>::try_from(public_key) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(canonical, &sig).is_ok()
}

/// Verify an envelope's own signature.
pub fn verify_envelope(public_key: &[u8], envelope: &Envelope) -> bool {
    match canonicalize(envelope) {
        Ok(canonical) => verify(public_key, &canonical, &envelope.signature),
        Err(_) => false,
    }
}

/// Load a hex public key file, checking it is a valid Ed25519 point.
pub fn load_public_key(path: impl AsRef<Path>) -> Result<[u8; PUBLIC_KEY_LEN], SigningError> {
    let path = path.as_ref();
    let bytes = read_key_file(path)?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| SigningError::Malformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(bytes)
}

/// `<path>.pub`
pub fn public_key_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}

fn read_key_file(path: &Path) -> Result<[u8; 32], SigningError> {
    let text = Zeroizing::new(std::fs::read_to_string(path).map_err(|source| {
        SigningError::Read {
            path: path.to_path_buf(),
            source,
        }
    })?);
    let bytes = Zeroizing::new(hex::decode(text.trim()).map_err(|e| SigningError::Malformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?);
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| SigningError::Malformed {
        path: path.to_path_buf(),
        reason: format!("expected 32 bytes, found {}", bytes.len()),
    })
}

fn write_key_file(path: &Path, contents: &str, private: bool) -> Result<(), SigningError> {
    let err = |source| SigningError::Write {
        path: path.to_path_buf(),
        source,
    };
    std::fs::write(path, format!("{contents}\n")).map_err(err)?;

    #[cfg(unix)]
    if private {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(err)?;
    }
    #[cfg(not(unix))]
    let _ = private;

    Ok(())
}
