//! # Wire envelope
//!
//! The transport-agnostic record a ratchet message travels in: routing
//! metadata, the cleartext ratchet header, the ciphertext, a timestamp, a
//! random message id and a signature by the sender's identity key. The
//! engine only produces and consumes these records; framing and delivery
//! belong to the transport.
//!
//! Binary fields are base64 on the wire and the JSON field names are the
//! protocol's camelCase ones. The signature covers a canonical CBOR
//! serialization (RFC 8949 deterministic encoding, fixed field order) of
//! every field except `signature` itself, so signer and verifier always
//! hash identical bytes regardless of JSON whitespace or key order.
//!
//! Validation is structural first, cryptographic second: missing fields and
//! unsupported versions are rejected before a single curve operation runs.

use {
    crate::{
        primitive::{primitive_for, ChainType, PrimitiveError},
        ratchet::{EncryptedMessage, MessageHeader},
        x3dh::IdentityKeyPair,
    },
    base64::{engine::general_purpose::STANDARD as BASE64, Engine as _},
    ciborium::Value,
    rand::rngs::OsRng,
    rand_core::RngCore,
    serde::{Deserialize, Serialize},
    std::str::FromStr,
    thiserror::Error,
};

/// Highest protocol version this build understands.
pub const PROTOCOL_VERSION: u32 = 1;
/// Random message identifier length in bytes (hex on the wire).
pub const MESSAGE_ID_LEN: usize = 16;

// === Errors ===

/// Failures while building, parsing or checking an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Input is not a JSON document at all.
    #[error("malformed envelope")]
    Malformed,
    /// A required field is absent or empty. Hard failure, not a warning.
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    /// The envelope claims a version newer than this build supports.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    /// A base64 or chain-tag field does not decode.
    #[error("invalid field encoding: {0}")]
    Encoding(&'static str),
    /// Signing or chain resolution failed.
    #[error("envelope crypto failure: {0}")]
    Primitive(#[from] PrimitiveError),
    /// Canonical serialization failed (should be unreachable).
    #[error("envelope serialization failed")]
    Serialization,
}

// === Record types ===

/// Sender identification block.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeSender {
    pub address: String,
    pub chain_type: ChainType,
    /// Sender identity public key, base64.
    pub identity_key: String,
}

/// Recipient routing block.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeRecipient {
    pub address: String,
    pub chain_type: ChainType,
}

/// Ratchet header in wire form.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeHeader {
    /// Sender's current DH public key, base64.
    pub ephemeral_key: String,
    pub previous_chain_length: u32,
    pub message_number: u32,
}

/// The signed, versioned wire record. Immutable once built.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub version: u32,
    pub sender: EnvelopeSender,
    pub recipient: EnvelopeRecipient,
    pub header: EnvelopeHeader,
    /// `nonce || ciphertext+tag`, base64.
    pub ciphertext: String,
    /// Signature over the canonical serialization, base64.
    pub signature: String,
    /// Build time, epoch milliseconds.
    pub timestamp: i64,
    /// 16 random bytes, hex.
    pub message_id: String,
}

impl Envelope {
    // === Building ===

    /// Build and sign an envelope around a ratchet-sealed message.
    pub fn build(
        sender: &IdentityKeyPair,
        recipient_address: &str,
        recipient_chain_type: ChainType,
        message: &EncryptedMessage,
    ) -> Result<Self, EnvelopeError> {
        let primitive = primitive_for(sender.chain_type)?;
        let mut id_bytes = [0u8; MESSAGE_ID_LEN];
        OsRng.fill_bytes(&mut id_bytes);

        let mut envelope = Envelope {
            version: PROTOCOL_VERSION,
            sender: EnvelopeSender {
                address: sender.address.clone(),
                chain_type: sender.chain_type,
                identity_key: BASE64.encode(sender.key_pair.public()),
            },
            recipient: EnvelopeRecipient {
                address: recipient_address.to_string(),
                chain_type: recipient_chain_type,
            },
            header: EnvelopeHeader {
                ephemeral_key: BASE64.encode(&message.header.ephemeral_key),
                previous_chain_length: message.header.previous_chain_length,
                message_number: message.header.message_number,
            },
            ciphertext: BASE64.encode(&message.ciphertext),
            signature: String::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            message_id: hex::encode(id_bytes),
        };
        let signature = primitive.sign(sender.key_pair.private(), &envelope.signing_bytes()?)?;
        envelope.signature = BASE64.encode(signature);
        Ok(envelope)
    }

    // === Transport form ===

    /// Serialize to the JSON transport form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|_| EnvelopeError::Serialization)
    }

    /// Parse and structurally validate a received record.
    ///
    /// Field presence and version support are checked on the raw document
    /// before deserialization, so a missing field reports its name and an
    /// unknown future version is rejected without touching any key.
    pub fn from_bytes(data: &[u8]) -> Result<Self, EnvelopeError> {
        let value: serde_json::Value =
            serde_json::from_slice(data).map_err(|_| EnvelopeError::Malformed)?;
        Self::validate_document(&value)?;
        serde_json::from_value(value).map_err(|_| EnvelopeError::Malformed)
    }

    fn require_str<'a>(
        value: &'a serde_json::Value,
        path: &[&str],
        name: &'static str,
    ) -> Result<&'a str, EnvelopeError> {
        let mut cursor = value;
        for segment in path {
            cursor = cursor.get(segment).ok_or(EnvelopeError::MissingField(name))?;
        }
        match cursor.as_str() {
            Some(s) if !s.is_empty() => Ok(s),
            _ => Err(EnvelopeError::MissingField(name)),
        }
    }

    /// Structural validation of a raw JSON document.
    fn validate_document(value: &serde_json::Value) -> Result<(), EnvelopeError> {
        let version = value
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .ok_or(EnvelopeError::MissingField("version"))?;
        if version == 0 || version > u64::from(PROTOCOL_VERSION) {
            return Err(EnvelopeError::UnsupportedVersion(version as u32));
        }

        Self::require_str(value, &["sender", "address"], "sender.address")?;
        Self::require_str(value, &["sender", "identityKey"], "sender.identityKey")?;
        Self::require_str(value, &["recipient", "address"], "recipient.address")?;
        Self::require_str(value, &["header", "ephemeralKey"], "header.ephemeralKey")?;
        Self::require_str(value, &["ciphertext"], "ciphertext")?;
        Self::require_str(value, &["signature"], "signature")?;

        for (path, name) in [
            (["sender", "chainType"], "sender.chainType"),
            (["recipient", "chainType"], "recipient.chainType"),
        ] {
            let tag = Self::require_str(value, &path, name)?;
            ChainType::from_str(tag).map_err(|_| EnvelopeError::Encoding(name))?;
        }

        value
            .get("timestamp")
            .and_then(serde_json::Value::as_i64)
            .ok_or(EnvelopeError::MissingField("timestamp"))?;
        Self::require_str(value, &["messageId"], "messageId")?;
        Ok(())
    }

    /// Structural self-check of an already-deserialized record.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.version == 0 {
            return Err(EnvelopeError::MissingField("version"));
        }
        if self.version > PROTOCOL_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(self.version));
        }
        for (present, name) in [
            (!self.sender.address.is_empty(), "sender.address"),
            (!self.sender.identity_key.is_empty(), "sender.identityKey"),
            (!self.recipient.address.is_empty(), "recipient.address"),
            (!self.header.ephemeral_key.is_empty(), "header.ephemeralKey"),
            (!self.ciphertext.is_empty(), "ciphertext"),
            (!self.signature.is_empty(), "signature"),
            (!self.message_id.is_empty(), "messageId"),
        ] {
            if !present {
                return Err(EnvelopeError::MissingField(name));
            }
        }
        Ok(())
    }

    // === Canonical signing bytes ===

    /// Deterministic serialization of every field except `signature`.
    ///
    /// A CBOR map with this exact entry order is the canonical form; both
    /// builder and verifier derive it from the typed record, never from the
    /// transport JSON.
    fn signing_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let map = Value::Map(vec![
            (
                Value::Text("version".into()),
                Value::Integer(self.version.into()),
            ),
            (
                Value::Text("sender".into()),
                Value::Map(vec![
                    (
                        Value::Text("address".into()),
                        Value::Text(self.sender.address.clone()),
                    ),
                    (
                        Value::Text("chainType".into()),
                        Value::Text(self.sender.chain_type.to_string()),
                    ),
                    (
                        Value::Text("identityKey".into()),
                        Value::Text(self.sender.identity_key.clone()),
                    ),
                ]),
            ),
            (
                Value::Text("recipient".into()),
                Value::Map(vec![
                    (
                        Value::Text("address".into()),
                        Value::Text(self.recipient.address.clone()),
                    ),
                    (
                        Value::Text("chainType".into()),
                        Value::Text(self.recipient.chain_type.to_string()),
                    ),
                ]),
            ),
            (
                Value::Text("header".into()),
                Value::Map(vec![
                    (
                        Value::Text("ephemeralKey".into()),
                        Value::Text(self.header.ephemeral_key.clone()),
                    ),
                    (
                        Value::Text("previousChainLength".into()),
                        Value::Integer(self.header.previous_chain_length.into()),
                    ),
                    (
                        Value::Text("messageNumber".into()),
                        Value::Integer(self.header.message_number.into()),
                    ),
                ]),
            ),
            (
                Value::Text("ciphertext".into()),
                Value::Text(self.ciphertext.clone()),
            ),
            (
                Value::Text("timestamp".into()),
                Value::Integer(self.timestamp.into()),
            ),
            (
                Value::Text("messageId".into()),
                Value::Text(self.message_id.clone()),
            ),
        ]);
        let mut out = Vec::new();
        ciborium::ser::into_writer(&map, &mut out).map_err(|_| EnvelopeError::Serialization)?;
        Ok(out)
    }

    // === Verification & policy ===

    /// Recompute the canonical bytes and verify the signature against the
    /// sender's declared identity key, using the primitive registered for
    /// the sender's chain.
    pub fn verify_signature(&self) -> Result<bool, EnvelopeError> {
        let primitive = primitive_for(self.sender.chain_type)?;
        let identity_key = BASE64
            .decode(&self.sender.identity_key)
            .map_err(|_| EnvelopeError::Encoding("sender.identityKey"))?;
        let signature = BASE64
            .decode(&self.signature)
            .map_err(|_| EnvelopeError::Encoding("signature"))?;
        Ok(primitive.verify(&identity_key, &self.signing_bytes()?, &signature))
    }

    /// Whether the envelope is older than `max_age_ms`. The engine itself
    /// never rejects on age; that policy belongs to the caller.
    pub fn is_expired(&self, max_age_ms: i64) -> bool {
        self.is_expired_at(chrono::Utc::now().timestamp_millis(), max_age_ms)
    }

    /// Age check against an explicit clock, for callers and tests that own
    /// their notion of "now".
    pub fn is_expired_at(&self, now_ms: i64, max_age_ms: i64) -> bool {
        now_ms.saturating_sub(self.timestamp) > max_age_ms
    }

    // === Ratchet hand-off ===

    /// Decode the base64 fields back into ratchet inputs.
    pub fn open(&self) -> Result<(MessageHeader, Vec<u8>), EnvelopeError> {
        let ephemeral_key = BASE64
            .decode(&self.header.ephemeral_key)
            .map_err(|_| EnvelopeError::Encoding("header.ephemeralKey"))?;
        let ciphertext = BASE64
            .decode(&self.ciphertext)
            .map_err(|_| EnvelopeError::Encoding("ciphertext"))?;
        Ok((
            MessageHeader {
                ephemeral_key,
                previous_chain_length: self.header.previous_chain_length,
                message_number: self.header.message_number,
            },
            ciphertext,
        ))
    }
}
