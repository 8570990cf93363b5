// src/sign.rs
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rsa::traits::PublicKeyParts;
use rsa::{Pss, RsaPrivateKey, RsaPublicKey};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::keys::decode_public_key;
use crate::ProtoError;

/// The signed input is the JSON serialization of `data` concatenated with
/// the decimal counter string.
fn signing_input(data: &Value, counter: &str) -> Result<Vec<u8>, ProtoError> {
    let mut input = serde_json::to_string(data)?;
    input.push_str(counter);
    Ok(input.into_bytes())
}

// RSA-PSS with the maximum salt the modulus admits, matching a signer that
// uses "as large as possible" salting.
fn max_salt_pss(modulus_bytes: usize) -> Pss {
    let salt_len = modulus_bytes
        .saturating_sub(<Sha256 as Digest>::output_size())
        .saturating_sub(2);
    Pss::new_with_salt::<Sha256>(salt_len)
}

/// RSA-PSS/SHA-256 signature over `data` + `counter`, base64-encoded.
pub fn sign_value(
    key: &RsaPrivateKey,
    data: &Value,
    counter: &str,
) -> Result<String, ProtoError> {
    let digest = Sha256::digest(signing_input(data, counter)?);
    let mut rng = rand::rngs::OsRng;
    let sig = key
        .sign_with_rng(&mut rng, max_salt_pss(key.size()), &digest)
        .map_err(|e| ProtoError::Crypto(format!("pss sign failed: {e}")))?;
    Ok(BASE64.encode(sig))
}

/// Verify a base64 signature under a single decoded key.
pub fn verify_with_key(
    key: &RsaPublicKey,
    data: &Value,
    counter: &str,
    signature_b64: &str,
) -> bool {
    let Ok(input) = signing_input(data, counter) else {
        return false;
    };
    let Ok(sig) = BASE64.decode(signature_b64.trim()) else {
        return false;
    };
    let digest = Sha256::digest(input);
    key.verify(max_salt_pss(key.size()), &digest, &sig).is_ok()
}

/// Sweep a candidate key set (base64-PEM strings) and accept if any key
/// verifies. Callers order the iterator so a known signer key is tried
/// first; undecodable candidates are skipped.
pub fn verify_any<'a, I>(candidates: I, data: &Value, counter: &str, signature_b64: &str) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    for candidate in candidates {
        let Ok(key) = decode_public_key(candidate) else {
            continue;
        };
        if verify_with_key(&key, data, counter, signature_b64) {
            return true;
        }
    }
    false
}
