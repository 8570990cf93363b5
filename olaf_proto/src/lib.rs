// src/lib.rs
//
// Shared wire protocol for the OLAF/Neighbourhood overlay: the typed message
// envelope, identity keys and fingerprints, RSA-PSS signing, and the
// AES-GCM + RSA-OAEP private-chat construction. Both the node and the client
// build on this crate.

pub mod envelope;
pub mod keys;
pub mod secret;
pub mod sign;

pub use envelope::{
    ChatPayload, ChatSegment, Payload, ServerRecord, SignedEnvelope, WireMessage,
};
pub use keys::{fingerprint, Identity};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("counter is not a decimal integer")]
    BadCounter,

    #[error("invalid public key")]
    BadPublicKey,

    #[error("crypto failure: {0}")]
    Crypto(String),
}
