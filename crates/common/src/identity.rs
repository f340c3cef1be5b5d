//! # Node Identity
//!
//! Each node holds a persistent ECDSA P-256 keypair. The public half is
//! published through the peer registry; the private half signs resource
//! offers, DHT updates, and challenge responses.
//!
//! ## Conventions
//!
//! - Public keys travel as hex-encoded SEC1 uncompressed points.
//! - Signatures are the raw 64-byte `r||s` form, hex-encoded, computed
//!   with ECDSA/SHA-256 (RFC 6979 deterministic nonces).
//! - The signing key is never exposed through any public method and is
//!   redacted from `Debug` output.
//!
//! A node that can neither load nor persist its keypair at startup must
//! refuse to serve; [`NodeKeypair::load_or_generate`] surfaces that as an
//! error for the caller to treat as fatal.

use std::fmt;
use std::path::Path;

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};

use crate::error::CommonError;

/// A node's ECDSA P-256 keypair.
pub struct NodeKeypair {
    signing_key: SigningKey,
}

impl NodeKeypair {
    /// Generates a fresh random keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut rand::rngs::OsRng);
        Self { signing_key }
    }

    /// Restores a keypair from the hex-encoded 32-byte secret scalar.
    pub fn from_secret_hex(s: &str) -> Result<Self, CommonError> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| CommonError::Crypto(format!("bad key hex: {}", e)))?;
        let signing_key = SigningKey::from_slice(&bytes)
            .map_err(|e| CommonError::Crypto(format!("bad P-256 secret: {}", e)))?;
        Ok(Self { signing_key })
    }

    /// Loads the keypair from `path`, or generates one and persists it
    /// there. Errors from either direction are startup-fatal for a node.
    pub fn load_or_generate(path: &Path) -> Result<Self, CommonError> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            return Self::from_secret_hex(&contents);
        }
        let keypair = Self::generate();
        std::fs::write(path, keypair.secret_hex())?;
        Ok(keypair)
    }

    /// Hex of the 32-byte secret scalar, the on-disk form.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Hex of the SEC1 uncompressed public point, the published form.
    pub fn public_key_hex(&self) -> String {
        let point = self.signing_key.verifying_key().to_encoded_point(false);
        hex::encode(point.as_bytes())
    }

    /// Signs `message` (ECDSA/SHA-256) and returns the hex `r||s` form.
    pub fn sign_hex(&self, message: &[u8]) -> String {
        let signature: Signature = self.signing_key.sign(message);
        hex::encode(signature.to_bytes())
    }
}

/// Verifies a hex `r||s` signature over `message` under a hex SEC1 public
/// key. Malformed keys or signatures verify as `false`; nothing panics
/// and nothing propagates.
pub fn verify_hex(public_key_hex: &str, message: &[u8], signature_hex: &str) -> bool {
    let Ok(key_bytes) = hex::decode(public_key_hex.trim()) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_sec1_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    verifying_key.verify(message, &signature).is_ok()
}

// Never print the secret scalar.
impl fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKeypair")
            .field("public_key", &self.public_key_hex())
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}
