use {
    serde::{Deserialize, Serialize},
    zeroize::{Zeroize, ZeroizeOnDrop},
};

/// A serializable 32-byte secret that is wiped from memory when dropped.
/// Used for chain keys, message keys and the root key inside state
/// snapshots.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(#[serde(with = "serde_bytes")] pub [u8; 32]);

impl From<[u8; 32]> for SecretBytes {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Variable-length sibling of [`SecretBytes`] for private keys whose
/// encoding differs per chain.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SecretVec(#[serde(with = "serde_bytes")] pub Vec<u8>);

impl From<Vec<u8>> for SecretVec {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}
