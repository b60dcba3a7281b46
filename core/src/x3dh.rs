//! # X3DH: blockchain-identity key agreement
//!
//! Implements the Extended Triple Diffie-Hellman handshake over the
//! chain-pluggable [`primitive`](crate::primitive) layer. Identities are not
//! generated from fresh entropy but derived deterministically from a wallet
//! private key, so a wallet account always maps to the same messaging
//! identity without any central directory.
//!
//! ## High-level flow
//!
//! ```text
//! Initiator                                Responder (may be offline)
//! ─────────────────────────────────────────────────────────────────
//! generate_identity_key_pair()         generate_identity_key_pair()
//!                                       │
//!                                       ├─ generate_signed_pre_key()
//!                                       ├─ generate_one_time_pre_keys()
//!                                       └─ create_pre_key_bundle() ──► published
//! ┌─(1) fetch bundle ◄───────────────────────────────────────────────┘
//! │
//! │  (2) initiate_key_exchange()
//! ├─► InitialMessage ────────────────────────────────────────────────┐
//!                                       (3) complete_key_exchange() ◄┘
//! ```
//!
//! After step (3) both parties hold the same 32-byte shared secret, which
//! seeds a [`RatchetSession`](crate::ratchet::RatchetSession).

use {
    crate::{
        kdf::{self, KdfError},
        primitive::{primitive_for, ChainType, KeyPair, PrimitiveError, SharedSecret},
    },
    serde::{Deserialize, Serialize},
    thiserror::Error,
    zeroize::Zeroizing,
};

/// HKDF info label for the X3DH secret derivation.
const X3DH_INFO: &[u8] = b"DeyondCryptX3DH";
/// HKDF info prefix for wallet-to-identity derivation. The full label also
/// carries the chain tag, the chain id and a retry counter.
const IDENTITY_INFO_PREFIX: &str = "DeyondCrypt-Identity-v1";
/// Derivation retries before giving up on a wallet key. A single retry fires
/// with probability about 2^-128 on secp256k1 and never on Ed25519.
const MAX_DERIVE_ATTEMPTS: u8 = 8;

// === Error handling ===

/// Failures that may arise while preparing or running a handshake.
#[derive(Debug, Error)]
pub enum X3dhError {
    /// The bundle's signed-prekey signature does not verify against the
    /// bundle's identity key. Checked before any DH computation.
    #[error("signed pre-key signature verification failed")]
    InvalidSignature,
    /// The bundle is structurally unusable (malformed keys, wrong lengths).
    #[error("invalid pre-key bundle: {0}")]
    InvalidPreKeyBundle(&'static str),
    /// The initial message references a one-time prekey we no longer hold.
    #[error("one-time pre-key secret missing")]
    MissingOneTimePreKey,
    /// Key material rejected by the chain primitive.
    #[error("invalid key: {0}")]
    Primitive(#[from] PrimitiveError),
    /// HKDF failure.
    #[error("key derivation failed: {0}")]
    Kdf(#[from] KdfError),
}

// === Identity & prekey material ===

/// Long-term messaging identity, deterministically derived from a wallet
/// key. Logically permanent for the lifetime of the wallet account.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    /// The underlying curve key pair in the chain's encoding.
    pub key_pair: KeyPair,
    /// Chain family the identity is anchored to.
    pub chain_type: ChainType,
    /// Chain-native address derived from the public key.
    pub address: String,
}

/// A medium-lived prekey, signed by the identity key and rotated on an
/// interval by the caller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedPreKey {
    pub key_id: u32,
    pub key_pair: KeyPair,
    /// Signature by the identity private key over the prekey public key.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    /// Creation time, epoch milliseconds. Drives rotation policy.
    pub timestamp_ms: i64,
}

/// A single-use prekey. Consumed at most once, then gone forever.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OneTimePreKey {
    pub key_id: u32,
    pub key_pair: KeyPair,
}

/// The published record a peer fetches to start a session while we are
/// offline. Immutable once published.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Owner's chain-native address.
    pub address: String,
    /// Owner's chain family.
    pub chain_type: ChainType,
    /// Owner's identity public key.
    #[serde(with = "serde_bytes")]
    pub identity_key: Vec<u8>,
    pub signed_pre_key_id: u32,
    #[serde(with = "serde_bytes")]
    pub signed_pre_key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub signed_pre_key_signature: Vec<u8>,
    /// Identifier of the attached one-time prekey, absent once exhausted.
    pub one_time_pre_key_id: Option<u32>,
    #[serde(with = "serde_bytes")]
    pub one_time_pre_key: Option<Vec<u8>>,
}

impl PreKeyBundle {
    /// Self-check: does the signed-prekey signature verify against the
    /// bundle's own identity key?
    pub fn verify(&self) -> bool {
        let Ok(primitive) = primitive_for(self.chain_type) else {
            return false;
        };
        primitive.verify(
            &self.identity_key,
            &self.signed_pre_key,
            &self.signed_pre_key_signature,
        )
    }
}

/// First message of the handshake, sent (or published) by the initiator so
/// the responder can recompute the same secret.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitialMessage {
    /// Initiator's identity public key.
    #[serde(with = "serde_bytes")]
    pub identity_key: Vec<u8>,
    /// Initiator's ephemeral public key, fresh per handshake.
    #[serde(with = "serde_bytes")]
    pub ephemeral_key: Vec<u8>,
    /// Which of the responder's signed prekeys was used.
    pub signed_pre_key_id: u32,
    /// Which one-time prekey was consumed, if any.
    pub one_time_pre_key_id: Option<u32>,
}

/// Outcome of a completed handshake, identical on both sides.
#[derive(Debug)]
pub struct KeyExchange {
    /// The 32-byte shared secret, wiped on drop.
    pub shared_secret: SharedSecret,
    /// `initiator identity key || responder identity key`. Not consumed by
    /// the base ratchet but retained for later authenticated contexts.
    pub associated_data: Vec<u8>,
}

// === Identity derivation ===

/// Derive the messaging identity for a wallet account.
///
/// The derivation is deterministic: the same wallet key, chain id and chain
/// type always produce the same identity (and therefore the same address).
/// The derived scalar is independent from the wallet's transaction-signing
/// key because it passes through HKDF under a versioned label.
pub fn generate_identity_key_pair(
    wallet_private_key: &[u8],
    chain_id: u64,
    chain_type: ChainType,
) -> Result<IdentityKeyPair, X3dhError> {
    let primitive = primitive_for(chain_type)?;
    for attempt in 0..MAX_DERIVE_ATTEMPTS {
        let info = format!("{IDENTITY_INFO_PREFIX}/{chain_type}/{chain_id}/{attempt}");
        let seed = kdf::hkdf(wallet_private_key, None, info.as_bytes(), 32)?;
        // A scalar outside the curve group retries under the next label.
        let Ok(key_pair) = primitive.keypair_from_private(&seed) else {
            continue;
        };
        let address = primitive.address(key_pair.public())?;
        log::debug!("derived {chain_type} messaging identity for {address}");
        return Ok(IdentityKeyPair {
            key_pair,
            chain_type,
            address,
        });
    }
    Err(X3dhError::Primitive(PrimitiveError::InvalidKey))
}

// === Prekey generation ===

/// Generate a fresh signed prekey under `identity`.
pub fn generate_signed_pre_key(
    identity: &IdentityKeyPair,
    key_id: u32,
) -> Result<SignedPreKey, X3dhError> {
    let primitive = primitive_for(identity.chain_type)?;
    let key_pair = primitive.generate_keypair();
    let signature = primitive.sign(identity.key_pair.private(), key_pair.public())?;
    Ok(SignedPreKey {
        key_id,
        key_pair,
        signature,
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
    })
}

/// Generate a contiguous run of single-use prekeys with ids
/// `start_id..start_id + count`.
pub fn generate_one_time_pre_keys(
    chain_type: ChainType,
    start_id: u32,
    count: u32,
) -> Result<Vec<OneTimePreKey>, X3dhError> {
    let primitive = primitive_for(chain_type)?;
    Ok((0..count)
        .map(|offset| OneTimePreKey {
            key_id: start_id.wrapping_add(offset),
            key_pair: primitive.generate_keypair(),
        })
        .collect())
}

/// Assemble the publishable bundle for an identity.
pub fn create_pre_key_bundle(
    identity: &IdentityKeyPair,
    signed_pre_key: &SignedPreKey,
    one_time_pre_key: Option<&OneTimePreKey>,
) -> PreKeyBundle {
    PreKeyBundle {
        address: identity.address.clone(),
        chain_type: identity.chain_type,
        identity_key: identity.key_pair.public().to_vec(),
        signed_pre_key_id: signed_pre_key.key_id,
        signed_pre_key: signed_pre_key.key_pair.public().to_vec(),
        signed_pre_key_signature: signed_pre_key.signature.clone(),
        one_time_pre_key_id: one_time_pre_key.map(|k| k.key_id),
        one_time_pre_key: one_time_pre_key.map(|k| k.key_pair.public().to_vec()),
    }
}

// === Shared-secret derivation ===

/// Fold the DH outputs into the 32-byte shared secret.
///
/// The input key material is prefixed with 32 bytes of `0xff` as a
/// cross-protocol domain separator, then expanded under a zero salt.
fn derive_shared(dh_outputs: &[&[u8]]) -> Result<SharedSecret, X3dhError> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(32 + 32 * dh_outputs.len()));
    ikm.extend_from_slice(&[0xffu8; 32]);
    for dh in dh_outputs {
        ikm.extend_from_slice(dh);
    }
    let okm = kdf::hkdf(&ikm, Some(&[0u8; 32]), X3DH_INFO, 32)?;
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&okm);
    Ok(Zeroizing::new(secret))
}

/// Associated data binding both identities: initiator key first, responder
/// key second, so both sides compute identical bytes.
fn associated_data(initiator_identity: &[u8], responder_identity: &[u8]) -> Vec<u8> {
    let mut ad = Vec::with_capacity(initiator_identity.len() + responder_identity.len());
    ad.extend_from_slice(initiator_identity);
    ad.extend_from_slice(responder_identity);
    ad
}

// === Initiator side ===

/// Run the initiator half of the handshake against a fetched bundle.
///
/// The signed-prekey signature is verified first; on failure the function
/// aborts with [`X3dhError::InvalidSignature`] before any DH computation.
/// Every invocation draws a fresh ephemeral key, so two handshakes against
/// the same bundle derive different secrets.
pub fn initiate_key_exchange(
    our_identity: &IdentityKeyPair,
    bundle: &PreKeyBundle,
) -> Result<(KeyExchange, InitialMessage), X3dhError> {
    let primitive = primitive_for(bundle.chain_type)?;

    // Structural checks before any cryptographic work.
    if !primitive.is_valid_public_key(&bundle.identity_key) {
        return Err(X3dhError::InvalidPreKeyBundle("identity key"));
    }
    if !primitive.is_valid_public_key(&bundle.signed_pre_key) {
        return Err(X3dhError::InvalidPreKeyBundle("signed pre-key"));
    }
    if let Some(otpk) = &bundle.one_time_pre_key {
        if !primitive.is_valid_public_key(otpk) {
            return Err(X3dhError::InvalidPreKeyBundle("one-time pre-key"));
        }
    }

    if !primitive.verify(
        &bundle.identity_key,
        &bundle.signed_pre_key,
        &bundle.signed_pre_key_signature,
    ) {
        return Err(X3dhError::InvalidSignature);
    }

    let ephemeral = primitive.generate_keypair();

    let dh1 = primitive.shared_secret(our_identity.key_pair.private(), &bundle.signed_pre_key)?;
    let dh2 = primitive.shared_secret(ephemeral.private(), &bundle.identity_key)?;
    let dh3 = primitive.shared_secret(ephemeral.private(), &bundle.signed_pre_key)?;
    let dh4 = bundle
        .one_time_pre_key
        .as_ref()
        .map(|otpk| primitive.shared_secret(ephemeral.private(), otpk))
        .transpose()?;

    let mut dh_outputs: Vec<&[u8]> = vec![&*dh1, &*dh2, &*dh3];
    if let Some(dh4) = &dh4 {
        dh_outputs.push(&**dh4);
    }
    let shared_secret = derive_shared(&dh_outputs)?;

    let exchange = KeyExchange {
        shared_secret,
        associated_data: associated_data(our_identity.key_pair.public(), &bundle.identity_key),
    };
    let message = InitialMessage {
        identity_key: our_identity.key_pair.public().to_vec(),
        ephemeral_key: ephemeral.public().to_vec(),
        signed_pre_key_id: bundle.signed_pre_key_id,
        one_time_pre_key_id: bundle.one_time_pre_key_id,
    };
    log::debug!(
        "initiated key exchange with {} (one-time pre-key: {})",
        bundle.address,
        message.one_time_pre_key_id.is_some()
    );
    Ok((exchange, message))
}

// === Responder side ===

/// Run the responder half, recomputing the initiator's secret from the key
/// material named in the initial message.
///
/// `our_one_time_pre_key` must be the consumed prekey pair when the message
/// references one; passing `None` in that case fails with
/// [`X3dhError::MissingOneTimePreKey`].
pub fn complete_key_exchange(
    our_identity: &IdentityKeyPair,
    our_signed_pre_key: &KeyPair,
    our_one_time_pre_key: Option<&KeyPair>,
    message: &InitialMessage,
) -> Result<KeyExchange, X3dhError> {
    let primitive = primitive_for(our_identity.chain_type)?;

    if message.one_time_pre_key_id.is_some() && our_one_time_pre_key.is_none() {
        return Err(X3dhError::MissingOneTimePreKey);
    }

    let dh1 = primitive.shared_secret(our_signed_pre_key.private(), &message.identity_key)?;
    let dh2 = primitive.shared_secret(our_identity.key_pair.private(), &message.ephemeral_key)?;
    let dh3 = primitive.shared_secret(our_signed_pre_key.private(), &message.ephemeral_key)?;
    let dh4 = our_one_time_pre_key
        .map(|otpk| primitive.shared_secret(otpk.private(), &message.ephemeral_key))
        .transpose()?;

    let mut dh_outputs: Vec<&[u8]> = vec![&*dh1, &*dh2, &*dh3];
    if let Some(dh4) = &dh4 {
        dh_outputs.push(&**dh4);
    }
    let shared_secret = derive_shared(&dh_outputs)?;

    Ok(KeyExchange {
        shared_secret,
        associated_data: associated_data(&message.identity_key, our_identity.key_pair.public()),
    })
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches};

    const WALLET_KEY_A: [u8; 32] = [0x11; 32];
    const WALLET_KEY_B: [u8; 32] = [0x22; 32];

    fn identity(wallet: &[u8], chain: ChainType) -> IdentityKeyPair {
        generate_identity_key_pair(wallet, 1, chain).unwrap()
    }

    #[test]
    fn identity_derivation_is_deterministic_per_wallet() {
        for chain in [ChainType::Evm, ChainType::Solana] {
            let a = identity(&WALLET_KEY_A, chain);
            let b = identity(&WALLET_KEY_A, chain);
            assert_eq!(a.key_pair.public(), b.key_pair.public());
            assert_eq!(a.address, b.address);
        }
    }

    #[test]
    fn identity_differs_per_chain_id_and_wallet() {
        let base = generate_identity_key_pair(&WALLET_KEY_A, 1, ChainType::Evm).unwrap();
        let other_chain_id = generate_identity_key_pair(&WALLET_KEY_A, 137, ChainType::Evm).unwrap();
        let other_wallet = generate_identity_key_pair(&WALLET_KEY_B, 1, ChainType::Evm).unwrap();
        assert_ne!(base.key_pair.public(), other_chain_id.key_pair.public());
        assert_ne!(base.key_pair.public(), other_wallet.key_pair.public());
    }

    #[test]
    fn unsupported_chains_fail_typed() {
        assert_matches!(
            generate_identity_key_pair(&WALLET_KEY_A, 1, ChainType::Cosmos),
            Err(X3dhError::Primitive(PrimitiveError::UnsupportedChain(_)))
        );
    }

    #[test]
    fn bundle_self_verification() {
        let responder = identity(&WALLET_KEY_B, ChainType::Solana);
        let spk = generate_signed_pre_key(&responder, 1).unwrap();
        let bundle = create_pre_key_bundle(&responder, &spk, None);
        assert!(bundle.verify());

        let mut tampered = bundle;
        tampered.signed_pre_key_signature[0] ^= 0xff;
        assert!(!tampered.verify());
    }

    #[test]
    fn agreement_without_one_time_pre_key() {
        for chain in [ChainType::Evm, ChainType::Solana] {
            let initiator = identity(&WALLET_KEY_A, chain);
            let responder = identity(&WALLET_KEY_B, chain);
            let spk = generate_signed_pre_key(&responder, 7).unwrap();
            let bundle = create_pre_key_bundle(&responder, &spk, None);

            let (ours, message) = initiate_key_exchange(&initiator, &bundle).unwrap();
            let theirs =
                complete_key_exchange(&responder, &spk.key_pair, None, &message).unwrap();

            assert_eq!(&*ours.shared_secret, &*theirs.shared_secret);
            assert_eq!(ours.associated_data, theirs.associated_data);
            assert_eq!(message.signed_pre_key_id, 7);
            assert_eq!(message.one_time_pre_key_id, None);
        }
    }

    #[test]
    fn agreement_with_one_time_pre_key() {
        let initiator = identity(&WALLET_KEY_A, ChainType::Solana);
        let responder = identity(&WALLET_KEY_B, ChainType::Solana);
        let spk = generate_signed_pre_key(&responder, 1).unwrap();
        let otpks = generate_one_time_pre_keys(ChainType::Solana, 100, 3).unwrap();
        let bundle = create_pre_key_bundle(&responder, &spk, Some(&otpks[0]));

        let (ours, message) = initiate_key_exchange(&initiator, &bundle).unwrap();
        assert_eq!(message.one_time_pre_key_id, Some(100));

        let theirs = complete_key_exchange(
            &responder,
            &spk.key_pair,
            Some(&otpks[0].key_pair),
            &message,
        )
        .unwrap();
        assert_eq!(&*ours.shared_secret, &*theirs.shared_secret);
    }

    #[test]
    fn responder_refuses_when_one_time_secret_is_gone() {
        let initiator = identity(&WALLET_KEY_A, ChainType::Evm);
        let responder = identity(&WALLET_KEY_B, ChainType::Evm);
        let spk = generate_signed_pre_key(&responder, 1).unwrap();
        let otpks = generate_one_time_pre_keys(ChainType::Evm, 5, 1).unwrap();
        let bundle = create_pre_key_bundle(&responder, &spk, Some(&otpks[0]));

        let (_, message) = initiate_key_exchange(&initiator, &bundle).unwrap();
        assert_matches!(
            complete_key_exchange(&responder, &spk.key_pair, None, &message),
            Err(X3dhError::MissingOneTimePreKey)
        );
    }

    #[test]
    fn tampered_signature_aborts_before_any_secret() {
        let initiator = identity(&WALLET_KEY_A, ChainType::Evm);
        let responder = identity(&WALLET_KEY_B, ChainType::Evm);
        let eve = identity(&[0x33; 32], ChainType::Evm);

        let spk = generate_signed_pre_key(&responder, 1).unwrap();
        let mut bundle = create_pre_key_bundle(&responder, &spk, None);
        // Replace the signature with one from an unrelated identity.
        bundle.signed_pre_key_signature = primitive_for(ChainType::Evm)
            .unwrap()
            .sign(eve.key_pair.private(), spk.key_pair.public())
            .unwrap();

        assert_matches!(
            initiate_key_exchange(&initiator, &bundle),
            Err(X3dhError::InvalidSignature)
        );
    }

    #[test]
    fn malformed_bundle_keys_fail_structurally() {
        let initiator = identity(&WALLET_KEY_A, ChainType::Solana);
        let responder = identity(&WALLET_KEY_B, ChainType::Solana);
        let spk = generate_signed_pre_key(&responder, 1).unwrap();
        let mut bundle = create_pre_key_bundle(&responder, &spk, None);
        bundle.signed_pre_key = vec![0u8; 7];

        assert_matches!(
            initiate_key_exchange(&initiator, &bundle),
            Err(X3dhError::InvalidPreKeyBundle("signed pre-key"))
        );
    }

    #[test]
    fn distinct_initiators_derive_distinct_secrets() {
        let responder = identity(&WALLET_KEY_B, ChainType::Solana);
        let spk = generate_signed_pre_key(&responder, 1).unwrap();
        let bundle = create_pre_key_bundle(&responder, &spk, None);

        let alice = identity(&WALLET_KEY_A, ChainType::Solana);
        let charlie = identity(&[0x44; 32], ChainType::Solana);

        let (alice_exchange, _) = initiate_key_exchange(&alice, &bundle).unwrap();
        let (charlie_exchange, _) = initiate_key_exchange(&charlie, &bundle).unwrap();
        assert_ne!(&*alice_exchange.shared_secret, &*charlie_exchange.shared_secret);
    }

    #[test]
    fn repeated_handshakes_use_fresh_ephemerals() {
        let responder = identity(&WALLET_KEY_B, ChainType::Evm);
        let initiator = identity(&WALLET_KEY_A, ChainType::Evm);
        let spk = generate_signed_pre_key(&responder, 1).unwrap();
        let bundle = create_pre_key_bundle(&responder, &spk, None);

        let (first, first_msg) = initiate_key_exchange(&initiator, &bundle).unwrap();
        let (second, second_msg) = initiate_key_exchange(&initiator, &bundle).unwrap();
        assert_ne!(first_msg.ephemeral_key, second_msg.ephemeral_key);
        assert_ne!(&*first.shared_secret, &*second.shared_secret);
    }

    #[test]
    fn one_time_pre_key_ids_are_contiguous() {
        let keys = generate_one_time_pre_keys(ChainType::Solana, 40, 5).unwrap();
        let ids: Vec<u32> = keys.iter().map(|k| k.key_id).collect();
        assert_eq!(ids, vec![40, 41, 42, 43, 44]);
    }

    #[test]
    fn bundle_serde_round_trip() {
        let responder = identity(&WALLET_KEY_B, ChainType::Solana);
        let spk = generate_signed_pre_key(&responder, 9).unwrap();
        let otpks = generate_one_time_pre_keys(ChainType::Solana, 0, 1).unwrap();
        let bundle = create_pre_key_bundle(&responder, &spk, Some(&otpks[0]));

        let bytes = bincode::serialize(&bundle).unwrap();
        let restored: PreKeyBundle = bincode::deserialize(&bytes).unwrap();
        assert!(restored.verify());
        assert_eq!(restored.one_time_pre_key_id, Some(0));
    }
}
