//! # Double Ratchet sessions
//!
//! Two symmetric chains (sending, receiving) nested inside one asymmetric
//! Diffie-Hellman ratchet, following Signal's public specification. The
//! X3DH shared secret seeds the root key; every round trip rotates the DH
//! pair, every message steps a chain key forward.
//!
//! Headers travel in cleartext next to the ciphertext. Out-of-order
//! delivery is absorbed by deriving and storing the skipped message keys,
//! keyed by `(sender DH public key, message number)`, in a fixed-capacity
//! map with insertion-order eviction.
//!
//! A session is not safe for concurrent mutation. One conversation means
//! one session, serialized by the caller; independent sessions share
//! nothing and may run in parallel.
//!
//! # Example
//!
//! ```
//! use deyondcrypt_core::{primitive::ChainType, ratchet::RatchetSession};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let shared = [7u8; 32];               // X3DH output, derived elsewhere
//! let primitive = deyondcrypt_core::primitive::primitive_for(ChainType::Solana)?;
//! let responder_spk = primitive.generate_keypair();
//!
//! let mut alice =
//!     RatchetSession::initialize_as_alice(&shared, ChainType::Solana, responder_spk.public())?;
//! let mut bob = RatchetSession::initialize_as_bob(&shared, ChainType::Solana, responder_spk)?;
//!
//! let message = alice.encrypt(b"hello bob")?;
//! assert_eq!(bob.decrypt(&message.header, &message.ciphertext)?, b"hello bob");
//! # Ok(()) }
//! ```

use {
    crate::{
        cipher::{self, CipherError, NONCE_LEN},
        kdf::{self, KdfError},
        primitive::{primitive_for, ChainPrimitive, ChainType, KeyPair, PrimitiveError},
        secret_bytes::SecretBytes,
    },
    lru::LruCache,
    serde::{Deserialize, Serialize},
    std::num::NonZeroUsize,
    subtle::ConstantTimeEq,
    thiserror::Error,
    zeroize::Zeroize,
};

/// Hard ceiling on keys skipped in a single decrypt call. Larger gaps are
/// protocol violations, not workload.
pub const MAX_SKIP: u32 = 1_000;
/// Capacity of the skipped-key map. Insertion beyond it evicts the oldest
/// stored key.
pub const SKIPPED_KEY_CAPACITY: usize = 1_000;
/// HKDF info label for deriving the initial root key from the X3DH secret.
const ROOT_INFO: &[u8] = b"DeyondCryptRoot";

// === Error types ===

/// Failures returned by [`RatchetSession`] operations.
#[derive(Debug, Error)]
pub enum RatchetError {
    /// Encrypt was called before this side had a sending chain (responder
    /// before its first ratchet step).
    #[error("session not initialized for sending")]
    NotInitializedForSending,
    /// Decrypt reached chain derivation without a receiving chain.
    #[error("session not initialized for receiving")]
    NotInitializedForReceiving,
    /// The header implies skipping more than [`MAX_SKIP`] keys.
    #[error("too many skipped messages")]
    TooManySkippedMessages,
    /// The message number was already consumed in the current chain and no
    /// skipped key is stored for it.
    #[error("duplicate message number {0} in current chain")]
    DuplicateMessage(u32),
    /// AEAD failure; no partial plaintext escapes.
    #[error("ratchet decryption failed: {0}")]
    Cipher(#[from] CipherError),
    /// A ratchet public key was rejected by the chain primitive.
    #[error("invalid ratchet key: {0}")]
    Primitive(#[from] PrimitiveError),
    #[error("key derivation failed: {0}")]
    Kdf(#[from] KdfError),
}

// === Wire header ===

/// Cleartext header accompanying every ciphertext. The receiver needs it to
/// know when to ratchet and how many keys to skip.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sender's current DH public key.
    #[serde(with = "serde_bytes")]
    pub ephemeral_key: Vec<u8>,
    /// Length of the sender's previous sending chain, captured at its last
    /// DH ratchet step.
    pub previous_chain_length: u32,
    /// Index of this message inside the active sending chain.
    pub message_number: u32,
}

/// A ratchet-sealed message ready for enveloping.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub header: MessageHeader,
    /// `nonce || ciphertext+tag`.
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    /// The nonce, redundantly available next to its prefixed copy.
    pub nonce: [u8; NONCE_LEN],
}

// === Skipped-key bookkeeping ===

type SkippedKeyId = (Vec<u8>, u32);

/// Serialized form of one skipped-key entry.
#[derive(Clone, Serialize, Deserialize)]
pub struct SkippedKeyEntry {
    #[serde(with = "serde_bytes")]
    remote_key: Vec<u8>,
    message_number: u32,
    message_key: SecretBytes,
}

/// Fixed-capacity map of message keys derived for not-yet-seen messages.
///
/// Entries are only ever pushed and popped, never refreshed in place, so
/// LRU order degenerates to insertion order and the capacity bound is
/// structural rather than test-verified.
struct SkippedKeys {
    keys: LruCache<SkippedKeyId, SecretBytes>,
}

impl SkippedKeys {
    fn new() -> Self {
        Self {
            keys: LruCache::new(
                NonZeroUsize::new(SKIPPED_KEY_CAPACITY).expect("capacity is non-zero"),
            ),
        }
    }

    fn insert(&mut self, remote_key: &[u8], message_number: u32, message_key: [u8; 32]) {
        self.keys.push(
            (remote_key.to_vec(), message_number),
            SecretBytes(message_key),
        );
    }

    /// Remove and return the key for `(remote_key, message_number)`.
    fn take(&mut self, remote_key: &[u8], message_number: u32) -> Option<SecretBytes> {
        self.keys.pop(&(remote_key.to_vec(), message_number))
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    /// Entries oldest-first, for state snapshots.
    fn snapshot(&self) -> Vec<SkippedKeyEntry> {
        let mut entries: Vec<SkippedKeyEntry> = self
            .keys
            .iter()
            .map(|((remote_key, message_number), message_key)| SkippedKeyEntry {
                remote_key: remote_key.clone(),
                message_number: *message_number,
                message_key: message_key.clone(),
            })
            .collect();
        // `iter` walks most-recent-first; snapshots store oldest-first.
        entries.reverse();
        entries
    }

    fn restore(entries: Vec<SkippedKeyEntry>) -> Self {
        let mut keys = Self::new();
        for entry in entries {
            keys.insert(&entry.remote_key, entry.message_number, entry.message_key.0);
        }
        keys
    }
}

// === State snapshot ===

/// The full mutable ratchet state for one conversation, as an opaque
/// serializable snapshot. Storage format and location are caller-owned.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub chain_type: ChainType,
    dh_key_pair: KeyPair,
    #[serde(with = "serde_bytes")]
    remote_dh_key: Option<Vec<u8>>,
    root_key: SecretBytes,
    sending_chain_key: Option<SecretBytes>,
    receiving_chain_key: Option<SecretBytes>,
    sending_message_number: u32,
    receiving_message_number: u32,
    previous_chain_length: u32,
    skipped: Vec<SkippedKeyEntry>,
}

// === The session ===

/// Live Double Ratchet state machine for one peer conversation.
pub struct RatchetSession {
    primitive: &'static dyn ChainPrimitive,
    chain_type: ChainType,
    /// Our current DH pair; rotated on every ratchet step.
    dh_key_pair: KeyPair,
    /// Peer's last seen DH public key. `None` until the first inbound
    /// message on the responder side.
    remote_dh_key: Option<Vec<u8>>,
    root_key: [u8; 32],
    sending_chain_key: Option<[u8; 32]>,
    receiving_chain_key: Option<[u8; 32]>,
    sending_message_number: u32,
    receiving_message_number: u32,
    /// Sending-chain length at our last DH ratchet, carried in headers.
    previous_chain_length: u32,
    skipped: SkippedKeys,
}

impl Zeroize for RatchetSession {
    fn zeroize(&mut self) {
        // KeyPair private halves and SecretBytes values shred themselves on
        // drop; the raw arrays held inline are wiped here.
        self.root_key.zeroize();
        if let Some(ref mut key) = self.sending_chain_key {
            key.zeroize();
        }
        if let Some(ref mut key) = self.receiving_chain_key {
            key.zeroize();
        }
        self.skipped.keys.clear();
    }
}

impl Drop for RatchetSession {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl RatchetSession {
    // === Initialisation ===

    /// Initial root key from the X3DH shared secret.
    fn derive_root(shared_secret: &[u8; 32]) -> Result<[u8; 32], RatchetError> {
        let okm = kdf::hkdf(shared_secret, None, ROOT_INFO, 32)?;
        let mut root = [0u8; 32];
        root.copy_from_slice(&okm);
        Ok(root)
    }

    /// Initiator-side construction, immediately ratcheting the sending side
    /// against the responder's signed prekey so the first message can be
    /// sent without waiting for a reply.
    pub fn initialize_as_alice(
        shared_secret: &[u8; 32],
        chain_type: ChainType,
        remote_signed_pre_key: &[u8],
    ) -> Result<Self, RatchetError> {
        let primitive = primitive_for(chain_type)?;
        if !primitive.is_valid_public_key(remote_signed_pre_key) {
            return Err(PrimitiveError::InvalidKey.into());
        }

        let mut root = Self::derive_root(shared_secret)?;
        let dh_key_pair = primitive.generate_keypair();
        let dh_output = primitive.shared_secret(dh_key_pair.private(), remote_signed_pre_key)?;
        let (new_root, sending_chain) = kdf::kdf_root(&root, &*dh_output)?;
        root.zeroize();

        log::debug!("ratchet session initialized as initiator on {chain_type}");
        Ok(Self {
            primitive,
            chain_type,
            dh_key_pair,
            remote_dh_key: Some(remote_signed_pre_key.to_vec()),
            root_key: new_root,
            sending_chain_key: Some(sending_chain),
            receiving_chain_key: None,
            sending_message_number: 0,
            receiving_message_number: 0,
            previous_chain_length: 0,
            skipped: SkippedKeys::new(),
        })
    }

    /// Responder-side construction. The DH pair is the signed prekey used
    /// during the handshake; no sending chain exists until the first
    /// inbound message triggers a ratchet step.
    pub fn initialize_as_bob(
        shared_secret: &[u8; 32],
        chain_type: ChainType,
        our_signed_pre_key: KeyPair,
    ) -> Result<Self, RatchetError> {
        let primitive = primitive_for(chain_type)?;
        let root_key = Self::derive_root(shared_secret)?;
        log::debug!("ratchet session initialized as responder on {chain_type}");
        Ok(Self {
            primitive,
            chain_type,
            dh_key_pair: our_signed_pre_key,
            remote_dh_key: None,
            root_key,
            sending_chain_key: None,
            receiving_chain_key: None,
            sending_message_number: 0,
            receiving_message_number: 0,
            previous_chain_length: 0,
            skipped: SkippedKeys::new(),
        })
    }

    // === Accessors ===

    pub fn chain_type(&self) -> ChainType {
        self.chain_type
    }

    /// Our current DH public key, as carried in outgoing headers.
    pub fn dh_public_key(&self) -> &[u8] {
        self.dh_key_pair.public()
    }

    /// Number of skipped message keys currently cached.
    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    // === Encrypt ===

    /// Seal one outbound message, advancing the sending chain.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptedMessage, RatchetError> {
        let mut chain_key = self
            .sending_chain_key
            .ok_or(RatchetError::NotInitializedForSending)?;
        let (next_chain, mut message_key) = kdf::kdf_chain(&chain_key);
        chain_key.zeroize();
        self.sending_chain_key = Some(next_chain);

        let header = MessageHeader {
            ephemeral_key: self.dh_key_pair.public().to_vec(),
            previous_chain_length: self.previous_chain_length,
            message_number: self.sending_message_number,
        };
        let payload = cipher::encrypt(plaintext, &message_key);
        message_key.zeroize();
        let payload = payload?;
        self.sending_message_number += 1;

        Ok(EncryptedMessage {
            header,
            ciphertext: payload.ciphertext,
            nonce: payload.nonce,
        })
    }

    // === Decrypt ===

    /// Open one inbound message, handling skipped-key lookup and automatic
    /// DH ratchet advancement.
    pub fn decrypt(
        &mut self,
        header: &MessageHeader,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, RatchetError> {
        // 1. Out-of-order recovery: a stored key decrypts directly and the
        //    entry is discarded.
        if let Some(message_key) = self
            .skipped
            .take(&header.ephemeral_key, header.message_number)
        {
            log::trace!(
                "decrypting skipped message {} with cached key",
                header.message_number
            );
            return Ok(cipher::decrypt_prefixed(ciphertext, &message_key.0)?);
        }

        // 2. A DH key we have not seen signals a ratchet step by the peer.
        let remote_changed = match self.remote_dh_key.as_deref() {
            Some(known) if known.len() == header.ephemeral_key.len() => {
                known.ct_eq(&header.ephemeral_key).unwrap_u8() == 0
            }
            _ => true,
        };
        if remote_changed {
            // Protect messages still in flight under the chain about to be
            // replaced, then ratchet.
            self.skip_message_keys(header.previous_chain_length)?;
            self.dh_ratchet(&header.ephemeral_key)?;
        } else if header.message_number < self.receiving_message_number {
            // Already consumed in this chain and not in the skipped map.
            return Err(RatchetError::DuplicateMessage(header.message_number));
        }

        // 3. Any remaining gap inside the now-current receiving chain.
        self.skip_message_keys(header.message_number)?;

        // 4. Derive, advance, open.
        let mut chain_key = self
            .receiving_chain_key
            .ok_or(RatchetError::NotInitializedForReceiving)?;
        let (next_chain, mut message_key) = kdf::kdf_chain(&chain_key);
        chain_key.zeroize();
        self.receiving_chain_key = Some(next_chain);
        self.receiving_message_number += 1;

        let plaintext = cipher::decrypt_prefixed(ciphertext, &message_key);
        message_key.zeroize();
        Ok(plaintext?)
    }

    // === Internal helpers ===

    /// Derive and store message keys for the current receiving chain up to
    /// (excluding) `until`.
    fn skip_message_keys(&mut self, until: u32) -> Result<(), RatchetError> {
        if self
            .receiving_message_number
            .checked_add(MAX_SKIP)
            .map(|limit| limit < until)
            .unwrap_or(true)
        {
            return Err(RatchetError::TooManySkippedMessages);
        }
        let Some(mut chain_key) = self.receiving_chain_key else {
            return Ok(());
        };
        let Some(remote_key) = self.remote_dh_key.clone() else {
            return Ok(());
        };
        let skipping = until.saturating_sub(self.receiving_message_number);
        while self.receiving_message_number < until {
            let (next_chain, message_key) = kdf::kdf_chain(&chain_key);
            chain_key.zeroize();
            chain_key = next_chain;
            self.skipped
                .insert(&remote_key, self.receiving_message_number, message_key);
            self.receiving_message_number += 1;
        }
        self.receiving_chain_key = Some(chain_key);
        if skipping > 0 {
            log::debug!(
                "stored {skipping} skipped message keys ({} cached)",
                self.skipped.len()
            );
        }
        Ok(())
    }

    /// Advance the DH ratchet: adopt the peer's new key for receiving, then
    /// rotate our own pair so the next reply ratchets forward too.
    fn dh_ratchet(&mut self, remote_key: &[u8]) -> Result<(), RatchetError> {
        if !self.primitive.is_valid_public_key(remote_key) {
            return Err(PrimitiveError::InvalidKey.into());
        }
        self.previous_chain_length = self.sending_message_number;
        self.sending_message_number = 0;
        self.receiving_message_number = 0;
        self.remote_dh_key = Some(remote_key.to_vec());

        // Receiving chain under the peer's fresh key.
        let dh_output = self
            .primitive
            .shared_secret(self.dh_key_pair.private(), remote_key)?;
        let (new_root, receiving_chain) = kdf::kdf_root(&self.root_key, &*dh_output)?;
        self.root_key.zeroize();
        self.root_key = new_root;
        self.receiving_chain_key = Some(receiving_chain);

        // Fresh local pair and a new sending chain.
        self.dh_key_pair = self.primitive.generate_keypair();
        let dh_output = self
            .primitive
            .shared_secret(self.dh_key_pair.private(), remote_key)?;
        let (new_root, sending_chain) = kdf::kdf_root(&self.root_key, &*dh_output)?;
        self.root_key.zeroize();
        self.root_key = new_root;
        self.sending_chain_key = Some(sending_chain);

        log::debug!(
            "DH ratchet advanced (previous chain length {})",
            self.previous_chain_length
        );
        Ok(())
    }

    // === State export / import ===

    /// Snapshot the full session state, skipped keys included.
    pub fn export_state(&self) -> SessionState {
        SessionState {
            chain_type: self.chain_type,
            dh_key_pair: self.dh_key_pair.clone(),
            remote_dh_key: self.remote_dh_key.clone(),
            root_key: SecretBytes(self.root_key),
            sending_chain_key: self.sending_chain_key.map(SecretBytes),
            receiving_chain_key: self.receiving_chain_key.map(SecretBytes),
            sending_message_number: self.sending_message_number,
            receiving_message_number: self.receiving_message_number,
            previous_chain_length: self.previous_chain_length,
            skipped: self.skipped.snapshot(),
        }
    }

    /// Rebuild a live session from a snapshot. The restored session can
    /// immediately continue encrypting and decrypting, including messages
    /// skipped before the export.
    pub fn from_state(state: SessionState) -> Result<Self, RatchetError> {
        let primitive = primitive_for(state.chain_type)?;
        Ok(Self {
            primitive,
            chain_type: state.chain_type,
            dh_key_pair: state.dh_key_pair,
            remote_dh_key: state.remote_dh_key,
            root_key: state.root_key.0,
            sending_chain_key: state.sending_chain_key.map(|k| k.0),
            receiving_chain_key: state.receiving_chain_key.map(|k| k.0),
            sending_message_number: state.sending_message_number,
            receiving_message_number: state.receiving_message_number,
            previous_chain_length: state.previous_chain_length,
            skipped: SkippedKeys::restore(state.skipped),
        })
    }
}
