// src/keys.rs
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::ProtoError;

const RSA_BITS: usize = 2048;

/// A long-lived RSA identity: the private key plus its derived public
/// identifiers. Public keys travel as base64-encoded SPKI PEM; the
/// fingerprint is SHA-256 of that base64-PEM string, base64-encoded again.
#[derive(Clone)]
pub struct Identity {
    private: RsaPrivateKey,
    public_pem_b64: String,
    fingerprint: String,
}

impl Identity {
    /// Generate a fresh 2048-bit keypair. Takes a while; call once at
    /// process start.
    pub fn generate() -> Result<Self, ProtoError> {
        let mut rng = rand::rngs::OsRng;
        let private = RsaPrivateKey::new(&mut rng, RSA_BITS)
            .map_err(|e| ProtoError::Crypto(format!("keygen failed: {e}")))?;
        Self::from_private(private)
    }

    pub fn from_private(private: RsaPrivateKey) -> Result<Self, ProtoError> {
        let public_pem_b64 = encode_public_key(&RsaPublicKey::from(&private))?;
        let fingerprint = fingerprint(&public_pem_b64);
        Ok(Self { private, public_pem_b64, fingerprint })
    }

    pub fn private(&self) -> &RsaPrivateKey {
        &self.private
    }

    pub fn public_pem_b64(&self) -> &str {
        &self.public_pem_b64
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// Base64 of the PEM (SPKI) encoding of a public key.
pub fn encode_public_key(key: &RsaPublicKey) -> Result<String, ProtoError> {
    let pem = key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| ProtoError::Crypto(format!("pem encode failed: {e}")))?;
    Ok(BASE64.encode(pem.as_bytes()))
}

/// Parse a base64-PEM public key as found in hellos, directories and key
/// wraps.
pub fn decode_public_key(b64_pem: &str) -> Result<RsaPublicKey, ProtoError> {
    let pem_bytes = BASE64.decode(b64_pem.trim())?;
    let pem = String::from_utf8(pem_bytes).map_err(|_| ProtoError::BadPublicKey)?;
    RsaPublicKey::from_public_key_pem(&pem).map_err(|_| ProtoError::BadPublicKey)
}

/// base64(SHA-256(base64-PEM)). The hash runs over the base64 *string*
/// bytes, not the decoded PEM.
pub fn fingerprint(public_pem_b64: &str) -> String {
    let digest = Sha256::digest(public_pem_b64.as_bytes());
    BASE64.encode(digest)
}
