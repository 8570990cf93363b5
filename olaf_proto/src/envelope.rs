// src/envelope.rs
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::sign;
use crate::ProtoError;

/// Every frame on the wire is one of these. Deserialization doubles as the
/// structural validation pass: a frame with an unknown `type` or a missing
/// required field never yields a value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    #[serde(rename = "signed_data")]
    SignedData(SignedEnvelope),

    /// Service-accepted acknowledgement pushed by a server after a client
    /// `hello` has been processed.
    #[serde(rename = "hello")]
    HelloAck {},

    #[serde(rename = "client_list")]
    ClientList { servers: Vec<ServerRecord> },

    #[serde(rename = "client_list_request")]
    ClientListRequest {},

    #[serde(rename = "client_update")]
    ClientUpdate { clients: Vec<String> },

    #[serde(rename = "client_update_request")]
    ClientUpdateRequest {},
}

impl WireMessage {
    pub fn from_text(text: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> String {
        // The closed set above always serializes.
        serde_json::to_string(self).expect("wire message serializes")
    }
}

/// One partition of a `client_list`: a server address and the base64-PEM
/// public keys of the clients it currently serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub address: String,
    pub clients: Vec<String>,
}

/// The signed wrapper around every client- or server-originated payload.
///
/// `data` stays a raw JSON value: the signature covers the serialization the
/// sender produced, so verification must run over the bytes as received, not
/// over a re-encoding of a typed struct. `payload()` gives the typed view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub id: String,
    pub data: Value,
    pub counter: String,
    pub signature: String,
}

impl SignedEnvelope {
    /// Sign `payload` with `key` under the given counter and wrap it in a
    /// fresh single-use envelope.
    pub fn create(
        payload: &Payload,
        counter: u64,
        key: &rsa::RsaPrivateKey,
    ) -> Result<Self, ProtoError> {
        let data = serde_json::to_value(payload)?;
        let counter = counter.to_string();
        let signature = sign::sign_value(key, &data, &counter)?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            data,
            counter,
            signature,
        })
    }

    /// Typed view of `data`. Fails on an unknown inner type or a missing
    /// required field.
    pub fn payload(&self) -> Result<Payload, ProtoError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn counter_value(&self) -> Result<u64, ProtoError> {
        self.counter.trim().parse().map_err(|_| ProtoError::BadCounter)
    }

    /// True if the signature verifies under any of the candidate keys
    /// (base64-PEM). Order matters: callers put the signer's known key first
    /// when they have one.
    pub fn verify_any<'a, I>(&self, candidates: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        sign::verify_any(candidates, &self.data, &self.counter, &self.signature)
    }
}

/// The inner `data` of a `signed_data` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Payload {
    #[serde(rename = "hello")]
    Hello { public_key: String },

    #[serde(rename = "server_hello")]
    ServerHello { sender: String },

    #[serde(rename = "public_chat")]
    PublicChat { sender: String, message: String },

    #[serde(rename = "chat")]
    Chat(ChatPayload),
}

/// An encrypted private chat. `chat` is the AES-GCM ciphertext of a
/// [`ChatSegment`] wrapper, `symm_keys` the per-recipient RSA-OAEP wraps of
/// the one-shot AES key, `iv` the nonce. All base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPayload {
    pub destination_servers: Vec<String>,
    pub iv: String,
    pub symm_keys: Vec<String>,
    pub chat: String,
}

/// The plaintext recovered from a private chat: `participants[0]` is the
/// sender fingerprint, the rest are the recipients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSegment {
    pub participants: Vec<String>,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Identity;

    fn identity() -> Identity {
        Identity::generate().unwrap()
    }

    #[test]
    fn bare_frames_round_trip() {
        let text = WireMessage::ClientUpdateRequest {}.to_text();
        assert_eq!(text, r#"{"type":"client_update_request"}"#);
        assert!(matches!(
            WireMessage::from_text(&text).unwrap(),
            WireMessage::ClientUpdateRequest {}
        ));

        let ack = WireMessage::from_text(r#"{"type":"hello"}"#).unwrap();
        assert!(matches!(ack, WireMessage::HelloAck {}));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(WireMessage::from_text(r#"{"type":"admin_backdoor"}"#).is_err());
        assert!(WireMessage::from_text("not json at all").is_err());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        // client_update without its clients list
        assert!(WireMessage::from_text(r#"{"type":"client_update"}"#).is_err());
        // signed_data without a signature
        assert!(WireMessage::from_text(
            r#"{"type":"signed_data","id":"x","data":{},"counter":"1"}"#
        )
        .is_err());
    }

    #[test]
    fn signed_envelope_survives_the_wire() {
        let id = identity();
        let payload = Payload::PublicChat {
            sender: id.fingerprint().to_string(),
            message: "hello neighbourhood".to_string(),
        };
        let env = SignedEnvelope::create(&payload, 7, id.private()).unwrap();
        let text = WireMessage::SignedData(env).to_text();

        // A receiver parses the frame and verifies over the received bytes.
        let WireMessage::SignedData(parsed) = WireMessage::from_text(&text).unwrap() else {
            panic!("expected signed_data");
        };
        assert!(parsed.verify_any([id.public_pem_b64()]));
        assert_eq!(parsed.counter_value().unwrap(), 7);
        assert!(matches!(parsed.payload().unwrap(), Payload::PublicChat { .. }));
    }

    #[test]
    fn counter_must_be_decimal() {
        let env = SignedEnvelope {
            id: "i".into(),
            data: serde_json::json!({}),
            counter: "ten".into(),
            signature: String::new(),
        };
        assert!(matches!(env.counter_value(), Err(ProtoError::BadCounter)));
    }

    #[test]
    fn inner_payload_is_validated() {
        let id = identity();
        // hello payload missing public_key
        let env = SignedEnvelope {
            id: "i".into(),
            data: serde_json::json!({"type": "hello"}),
            counter: "1".into(),
            signature: String::new(),
        };
        assert!(env.payload().is_err());

        let good = SignedEnvelope::create(
            &Payload::Hello { public_key: id.public_pem_b64().to_string() },
            1,
            id.private(),
        )
        .unwrap();
        assert!(matches!(good.payload().unwrap(), Payload::Hello { .. }));
    }
}
