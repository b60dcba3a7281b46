//! # Chain-pluggable elliptic-curve primitives
//!
//! Every DeyondCrypt identity is rooted in a wallet key on some chain, and
//! each chain family brings its own curve. This module defines the single
//! contract ([`ChainPrimitive`]) the rest of the protocol is written
//! against, plus the concrete implementations for the chains we support
//! today:
//!
//! * [`Secp256k1Primitive`] for `evm` wallets (ECDSA + secp256k1 ECDH),
//! * [`Ed25519Primitive`] for `solana` wallets (Ed25519 + an X25519 bridge
//!   for Diffie-Hellman).
//!
//! `bitcoin` and `cosmos` are recognised chain tags but have no primitive
//! registered yet; [`primitive_for`] reports them as
//! [`PrimitiveError::UnsupportedChain`].
//!
//! Resolution happens once per session or bundle at a single composition
//! point ([`primitive_for`]) and the `&'static dyn ChainPrimitive` handle is
//! threaded through, so no hot path performs a chain-tag lookup.

use {
    crate::secret_bytes::SecretVec,
    serde::{Deserialize, Serialize},
    std::fmt,
    thiserror::Error,
    zeroize::Zeroizing,
};

mod ed25519;
mod secp256k1;

pub use self::{ed25519::Ed25519Primitive, secp256k1::Secp256k1Primitive};

/// 32-byte Diffie-Hellman output, wiped from memory on drop.
pub type SharedSecret = Zeroizing<[u8; 32]>;

// === Error handling ===

/// Failures surfaced by the primitive layer.
#[derive(Debug, Error)]
pub enum PrimitiveError {
    /// Key material rejected at construction (wrong length, not a curve
    /// point, out-of-range scalar, small-order peer key).
    #[error("invalid key material")]
    InvalidKey,
    /// The chain tag is known but no primitive is registered for it.
    #[error("unsupported chain type: {0}")]
    UnsupportedChain(ChainType),
    /// The signing backend refused to produce a signature.
    #[error("signing failed")]
    SigningFailed,
}

// === Chain tags ===

/// Chain families a messaging identity can be anchored to.
///
/// The wire form is the lowercase tag (`"evm"`, `"solana"`, `"bitcoin"`,
/// `"cosmos"`), both in serde and in `Display`/`FromStr`.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    PartialEq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChainType {
    Evm,
    Solana,
    Bitcoin,
    Cosmos,
}

// === Key material ===

/// An elliptic-curve key pair in the encoding of its chain.
///
/// The private half is stored in a zeroize-on-drop buffer and never appears
/// in `Debug` output. Cloning is allowed so key pairs can move between a
/// store and a live session.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyPair {
    #[serde(with = "serde_bytes")]
    public: Vec<u8>,
    private: SecretVec,
}

impl KeyPair {
    /// Wraps raw key bytes. Validity is the concern of the primitive that
    /// produced or parses them, not of this container.
    pub fn new(public: Vec<u8>, private: Vec<u8>) -> Self {
        Self {
            public,
            private: SecretVec(private),
        }
    }

    /// Public half, in the chain's native encoding.
    pub fn public(&self) -> &[u8] {
        &self.public
    }

    /// Private half. Handle with care; the buffer is zeroized when the pair
    /// is dropped.
    pub fn private(&self) -> &[u8] {
        &self.private.0
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(&self.public))
            .field("private", &"<redacted>")
            .finish()
    }
}

// === The primitive contract ===

/// Per-chain elliptic-curve operations.
///
/// Implementations are stateless and thread-safe. Invalid key material must
/// be rejected by the constructor-style methods (`keypair_from_private`,
/// `shared_secret`, `address`) instead of being accepted and failing later
/// inside a handshake.
pub trait ChainPrimitive: Send + Sync + fmt::Debug {
    /// The chain this primitive serves.
    fn chain_type(&self) -> ChainType;

    /// Generate a fresh key pair from OS entropy.
    fn generate_keypair(&self) -> KeyPair;

    /// Rebuild a key pair from private key bytes, deriving the public half.
    fn keypair_from_private(&self, private: &[u8]) -> Result<KeyPair, PrimitiveError>;

    /// Diffie-Hellman agreement between our private key and a peer public
    /// key, reduced to 32 bytes of shared secret.
    fn shared_secret(
        &self,
        private: &[u8],
        peer_public: &[u8],
    ) -> Result<SharedSecret, PrimitiveError>;

    /// Sign `message` with the chain's native signature scheme.
    fn sign(&self, private: &[u8], message: &[u8]) -> Result<Vec<u8>, PrimitiveError>;

    /// Verify a signature. Malformed keys or signatures verify as `false`,
    /// never as a panic.
    fn verify(&self, public: &[u8], message: &[u8], signature: &[u8]) -> bool;

    /// Whether `bytes` parse as a public key on this chain's curve.
    fn is_valid_public_key(&self, bytes: &[u8]) -> bool;

    /// Whether `bytes` parse as a private key on this chain's curve.
    fn is_valid_private_key(&self, bytes: &[u8]) -> bool;

    /// Chain-native address string for a public key.
    fn address(&self, public: &[u8]) -> Result<String, PrimitiveError>;
}

/// Resolve the primitive registered for `chain`.
///
/// This is the only place in the crate where a chain tag is mapped to a
/// concrete curve implementation.
pub fn primitive_for(chain: ChainType) -> Result<&'static dyn ChainPrimitive, PrimitiveError> {
    match chain {
        ChainType::Evm => Ok(&Secp256k1Primitive),
        ChainType::Solana => Ok(&Ed25519Primitive),
        other => Err(PrimitiveError::UnsupportedChain(other)),
    }
}
