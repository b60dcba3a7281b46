//! # Session layer: handshake to envelope
//!
//! Glues the X3DH key agreement and the Double Ratchet into one per-peer
//! object that seals plaintext straight into signed [`Envelope`]s and opens
//! received ones. Both parties end up with identical symmetric state; a
//! session is never shared between peers and must be externally serialized
//! for concurrent use.
//!
//! ## Example
//!
//! ```
//! use deyondcrypt_core::{
//!     primitive::ChainType,
//!     session::Session,
//!     x3dh::{create_pre_key_bundle, generate_identity_key_pair, generate_signed_pre_key},
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let alice = generate_identity_key_pair(&[0xaa; 32], 1, ChainType::Solana)?;
//! let bob = generate_identity_key_pair(&[0xbb; 32], 1, ChainType::Solana)?;
//!
//! // Bob publishes a bundle; Alice initiates against it.
//! let spk = generate_signed_pre_key(&bob, 1)?;
//! let bundle = create_pre_key_bundle(&bob, &spk, None);
//! let (mut alice_session, initial) = Session::initiate(&alice, &bundle)?;
//!
//! // Bob accepts the handshake and both sides exchange envelopes.
//! let mut bob_session = Session::accept(&bob, &spk.key_pair, None, &initial, &alice.address)?;
//! let envelope = alice_session.seal(b"hi bob")?;
//! assert_eq!(bob_session.open(&envelope)?, b"hi bob");
//! # Ok(()) }
//! ```

use {
    crate::{
        envelope::{Envelope, EnvelopeError},
        primitive::{ChainType, KeyPair},
        ratchet::{RatchetError, RatchetSession, SessionState},
        x3dh::{
            complete_key_exchange, initiate_key_exchange, IdentityKeyPair, InitialMessage,
            PreKeyBundle, X3dhError,
        },
    },
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    std::fmt,
    thiserror::Error,
    zeroize::Zeroize,
};

/// Domain prefix for deriving the stable session identifier.
const SESSION_ID_PREFIX: &[u8] = b"deyondcrypt-session-id";

/// Failures during session establishment or normal messaging.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("X3DH error: {0}")]
    X3dh(#[from] X3dhError),
    #[error("ratchet error: {0}")]
    Ratchet(#[from] RatchetError),
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
    /// The envelope signature did not match its sender identity key.
    #[error("envelope signature verification failed")]
    InvalidSignature,
    /// Opted-in age ceiling exceeded; see [`Session::open_with_max_age`].
    #[error("message is older than the permitted age")]
    MessageTooOld,
    /// Any attempt to use a session in an impossible state.
    #[error("session state error: {0}")]
    InvalidState(String),
}

/// Serializable snapshot of a whole session, ratchet state included.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    session_id: [u8; 32],
    ratchet: SessionState,
    local_identity: IdentityKeyPair,
    remote_address: String,
    remote_chain_type: ChainType,
    #[serde(with = "serde_bytes")]
    remote_identity_key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    associated_data: Vec<u8>,
}

/// A live end-to-end encrypted conversation with one peer.
pub struct Session {
    /// Stable identifier derived from the handshake secret. Suitable as a
    /// persistence key; identical on both sides.
    session_id: [u8; 32],
    ratchet: RatchetSession,
    local_identity: IdentityKeyPair,
    remote_address: String,
    remote_chain_type: ChainType,
    remote_identity_key: Vec<u8>,
    /// X3DH identity binding, kept for future authenticated contexts.
    associated_data: Vec<u8>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &hex::encode(self.session_id))
            .field("remote_address", &self.remote_address)
            .field("remote_chain_type", &self.remote_chain_type)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Deterministic session id from the X3DH shared secret.
    fn calculate_session_id(shared_secret: &[u8; 32]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(SESSION_ID_PREFIX);
        hasher.update(shared_secret);
        hasher.finalize().into()
    }

    // === Establishment ===

    /// Initiator entry point: run X3DH against a fetched bundle and return
    /// the session plus the initial message the responder needs.
    pub fn initiate(
        identity: &IdentityKeyPair,
        bundle: &PreKeyBundle,
    ) -> Result<(Self, InitialMessage), SessionError> {
        if bundle.chain_type != identity.chain_type {
            return Err(SessionError::InvalidState(format!(
                "bundle chain {} does not match identity chain {}",
                bundle.chain_type, identity.chain_type
            )));
        }
        let (exchange, initial) = initiate_key_exchange(identity, bundle)?;
        let ratchet = RatchetSession::initialize_as_alice(
            &exchange.shared_secret,
            identity.chain_type,
            &bundle.signed_pre_key,
        )?;
        let session = Self {
            session_id: Self::calculate_session_id(&exchange.shared_secret),
            ratchet,
            local_identity: identity.clone(),
            remote_address: bundle.address.clone(),
            remote_chain_type: bundle.chain_type,
            remote_identity_key: bundle.identity_key.clone(),
            associated_data: exchange.associated_data,
        };
        log::debug!("session initiated with {}", session.remote_address);
        Ok((session, initial))
    }

    /// Responder entry point: complete the handshake named in `initial`.
    ///
    /// `signed_pre_key` is the prekey pair the bundle advertised and
    /// `one_time_pre_key` the consumed one-time pair, if the message names
    /// one (fetch it with
    /// [`consume_one_time_pre_key`](crate::prekey_store::PreKeyStore::consume_one_time_pre_key)).
    pub fn accept(
        identity: &IdentityKeyPair,
        signed_pre_key: &KeyPair,
        one_time_pre_key: Option<&KeyPair>,
        initial: &InitialMessage,
        remote_address: &str,
    ) -> Result<Self, SessionError> {
        let exchange = complete_key_exchange(identity, signed_pre_key, one_time_pre_key, initial)?;
        let ratchet = RatchetSession::initialize_as_bob(
            &exchange.shared_secret,
            identity.chain_type,
            signed_pre_key.clone(),
        )?;
        let session = Self {
            session_id: Self::calculate_session_id(&exchange.shared_secret),
            ratchet,
            local_identity: identity.clone(),
            remote_address: remote_address.to_string(),
            remote_chain_type: identity.chain_type,
            remote_identity_key: initial.identity_key.clone(),
            associated_data: exchange.associated_data,
        };
        log::debug!("session accepted from {}", session.remote_address);
        Ok(session)
    }

    // === Accessors ===

    /// Stable 32-byte identifier, identical on both peers.
    pub fn id(&self) -> &[u8; 32] {
        &self.session_id
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn remote_identity_key(&self) -> &[u8] {
        &self.remote_identity_key
    }

    /// X3DH identity binding (initiator key followed by responder key).
    pub fn associated_data(&self) -> &[u8] {
        &self.associated_data
    }

    /// The underlying ratchet, for callers that need counters or the
    /// current DH key.
    pub fn ratchet(&self) -> &RatchetSession {
        &self.ratchet
    }

    // === Messaging ===

    /// Encrypt `plaintext` and wrap it in a signed envelope addressed to
    /// the peer.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Envelope, SessionError> {
        let message = self.ratchet.encrypt(plaintext)?;
        Ok(Envelope::build(
            &self.local_identity,
            &self.remote_address,
            self.remote_chain_type,
            &message,
        )?)
    }

    /// Validate, verify and decrypt a received envelope.
    ///
    /// Structural validation and signature verification run before any
    /// ratchet work; a bad signature is a typed failure, never a warning.
    pub fn open(&mut self, envelope: &Envelope) -> Result<Vec<u8>, SessionError> {
        envelope.validate()?;
        if !envelope.verify_signature()? {
            return Err(SessionError::InvalidSignature);
        }
        let (header, ciphertext) = envelope.open()?;
        Ok(self.ratchet.decrypt(&header, &ciphertext)?)
    }

    /// Like [`open`](Self::open) but with a caller-supplied age ceiling.
    pub fn open_with_max_age(
        &mut self,
        envelope: &Envelope,
        max_age_ms: i64,
    ) -> Result<Vec<u8>, SessionError> {
        if envelope.is_expired(max_age_ms) {
            return Err(SessionError::MessageTooOld);
        }
        self.open(envelope)
    }

    // === Persistence ===

    /// Snapshot the whole session for caller-owned storage.
    pub fn export_state(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id,
            ratchet: self.ratchet.export_state(),
            local_identity: self.local_identity.clone(),
            remote_address: self.remote_address.clone(),
            remote_chain_type: self.remote_chain_type,
            remote_identity_key: self.remote_identity_key.clone(),
            associated_data: self.associated_data.clone(),
        }
    }

    /// Rebuild a live session from a snapshot.
    pub fn restore(snapshot: SessionSnapshot) -> Result<Self, SessionError> {
        Ok(Self {
            session_id: snapshot.session_id,
            ratchet: RatchetSession::from_state(snapshot.ratchet)?,
            local_identity: snapshot.local_identity,
            remote_address: snapshot.remote_address,
            remote_chain_type: snapshot.remote_chain_type,
            remote_identity_key: snapshot.remote_identity_key,
            associated_data: snapshot.associated_data,
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.session_id.zeroize();
    }
}
