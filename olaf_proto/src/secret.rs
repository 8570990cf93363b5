// src/secret.rs
//
// Private-chat encryption: one fresh AES-128-GCM key per message, wrapped
// for every recipient (sender included) with RSA-OAEP/SHA-256. Receivers
// trial-unwrap the key list; the first wrap that opens decides whether the
// message was theirs.
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use rsa::{Oaep, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::envelope::ChatSegment;
use crate::keys::decode_public_key;
use crate::ProtoError;

const SYMM_KEY_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// What `{"chat": {...}}` looks like on the inside of the ciphertext.
#[derive(Debug, Serialize, Deserialize)]
struct SegmentWrapper {
    chat: ChatSegment,
}

/// The encrypted pieces of a chat payload: base64 nonce, base64 ciphertext,
/// and one base64 key wrap per recipient in `recipient_keys` order.
pub struct SealedSegment {
    pub iv: String,
    pub chat: String,
    pub symm_keys: Vec<String>,
}

/// Encrypt `segment` under a fresh key and wrap that key for each
/// base64-PEM public key in `recipient_keys`. The caller includes its own
/// key in the list so it can read echoes of its own traffic.
pub fn seal_segment(
    segment: &ChatSegment,
    recipient_keys: &[String],
) -> Result<SealedSegment, ProtoError> {
    let mut rng = rand::rngs::OsRng;

    let mut key = [0u8; SYMM_KEY_LEN];
    rng.fill_bytes(&mut key);
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);

    let plaintext = serde_json::to_vec(&SegmentWrapper { chat: segment.clone() })?;
    let cipher = Aes128Gcm::new_from_slice(&key)
        .map_err(|e| ProtoError::Crypto(format!("bad symm key length: {e}")))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| ProtoError::Crypto("aes-gcm encrypt failed".into()))?;

    let mut symm_keys = Vec::with_capacity(recipient_keys.len());
    for recipient in recipient_keys {
        let public = decode_public_key(recipient)?;
        let wrapped = public
            .encrypt(&mut rng, Oaep::new::<Sha256>(), &key)
            .map_err(|e| ProtoError::Crypto(format!("oaep wrap failed: {e}")))?;
        symm_keys.push(BASE64.encode(wrapped));
    }

    Ok(SealedSegment {
        iv: BASE64.encode(nonce),
        chat: BASE64.encode(ciphertext),
        symm_keys,
    })
}

/// Trial decryption. Unwrap attempts that fail are expected (wraps addressed
/// to other recipients) and stay silent. The first wrap that opens is used
/// for a single authenticated decryption; if that fails, the message was not
/// for us.
pub fn open_segment(
    private: &RsaPrivateKey,
    iv_b64: &str,
    chat_b64: &str,
    symm_keys: &[String],
) -> Option<ChatSegment> {
    let nonce = BASE64.decode(iv_b64.trim()).ok()?;
    if nonce.len() != NONCE_LEN {
        return None;
    }
    let ciphertext = BASE64.decode(chat_b64.trim()).ok()?;

    for wrapped in symm_keys {
        let Ok(wrapped) = BASE64.decode(wrapped.trim()) else {
            continue;
        };
        let Ok(key) = private.decrypt(Oaep::new::<Sha256>(), &wrapped) else {
            continue;
        };
        if key.len() != SYMM_KEY_LEN {
            continue;
        }

        let cipher = Aes128Gcm::new_from_slice(&key).ok()?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .ok()?;
        let wrapper: SegmentWrapper = serde_json::from_slice(&plaintext).ok()?;
        return Some(wrapper.chat);
    }
    None
}
