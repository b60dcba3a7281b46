//! # Key derivation
//!
//! HKDF-SHA-256 (RFC 5869) and HMAC-SHA-256 wrappers, plus the two fixed
//! derivations the ratchet is built on:
//!
//! * the root-key KDF ([`kdf_root`]), which folds a Diffie-Hellman output
//!   into the current root key and yields a fresh chain key, and
//! * the chain-key KDF ([`kdf_chain`]), which steps a chain key forward and
//!   emits the per-message key.
//!
//! The domain-separation labels are fixed ASCII constants. Changing any of
//! them breaks interoperability with every deployed peer, so they must never
//! vary at runtime.

use {
    hkdf::Hkdf,
    hmac::{Hmac, Mac},
    sha2::Sha256,
    thiserror::Error,
    zeroize::Zeroizing,
};

/// HKDF-SHA-256 as per RFC 5869.
type HkdfSha256 = Hkdf<Sha256>;
/// HMAC-SHA-256.
type HmacSha256 = Hmac<Sha256>;

/// Chain-key KDF label for the per-message key.
const MESSAGE_KEY_LABEL: &[u8] = b"MessageKey";
/// Chain-key KDF label for the next chain key.
const CHAIN_KEY_LABEL: &[u8] = b"ChainKey";
/// Root-key KDF info label.
const ROOT_RATCHET_INFO: &[u8] = b"DeyondCryptRatchet";
/// Ceiling on HKDF output, per RFC 5869 (255 blocks of SHA-256).
const MAX_OUTPUT_LEN: usize = 255 * 32;

/// Failures of the derivation layer.
#[derive(Debug, Error)]
pub enum KdfError {
    /// Requested output length is zero or beyond what HKDF-SHA-256 yields.
    #[error("key derivation failed")]
    KeyDerivationFailed,
}

impl From<hkdf::InvalidLength> for KdfError {
    fn from(_: hkdf::InvalidLength) -> Self {
        Self::KeyDerivationFailed
    }
}

/// HKDF-SHA-256 extract-and-expand.
///
/// A `None` salt selects the RFC 5869 default (a zero-filled block). The
/// returned buffer is wiped on drop.
pub fn hkdf(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output_len: usize,
) -> Result<Zeroizing<Vec<u8>>, KdfError> {
    if output_len == 0 || output_len > MAX_OUTPUT_LEN {
        return Err(KdfError::KeyDerivationFailed);
    }
    let hk = HkdfSha256::new(salt, ikm);
    let mut okm = Zeroizing::new(vec![0u8; output_len]);
    hk.expand(info, &mut okm)?;
    Ok(okm)
}

/// One-shot HMAC-SHA-256.
pub fn hmac_sha256(key: &[u8], info: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(info);
    mac.finalize().into_bytes().into()
}

/// Root-key KDF: 64 bytes of HKDF output split into the new root key
/// (`[0..32]`) and the new chain key (`[32..64]`), with the current root key
/// as salt.
pub fn kdf_root(root_key: &[u8; 32], dh_output: &[u8]) -> Result<([u8; 32], [u8; 32]), KdfError> {
    let okm = hkdf(dh_output, Some(root_key), ROOT_RATCHET_INFO, 64)?;
    let mut new_root = [0u8; 32];
    new_root.copy_from_slice(&okm[..32]);
    let mut chain_key = [0u8; 32];
    chain_key.copy_from_slice(&okm[32..]);
    Ok((new_root, chain_key))
}

/// Chain-key KDF: `(next_chain_key, message_key)` from the current chain
/// key. One-way in both directions, so a leaked message key exposes neither
/// its siblings nor the chain.
pub fn kdf_chain(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    (
        hmac_sha256(chain_key, CHAIN_KEY_LABEL),
        hmac_sha256(chain_key, MESSAGE_KEY_LABEL),
    )
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches};

    #[test]
    fn hkdf_is_deterministic_and_label_separated() {
        let a = hkdf(b"ikm", Some(b"salt"), b"label-one", 32).unwrap();
        let b = hkdf(b"ikm", Some(b"salt"), b"label-one", 32).unwrap();
        let c = hkdf(b"ikm", Some(b"salt"), b"label-two", 32).unwrap();
        assert_eq!(&*a, &*b);
        assert_ne!(&*a, &*c);
    }

    #[test]
    fn hkdf_rejects_degenerate_lengths() {
        assert_matches!(
            hkdf(b"ikm", None, b"info", 0),
            Err(KdfError::KeyDerivationFailed)
        );
        assert_matches!(
            hkdf(b"ikm", None, b"info", MAX_OUTPUT_LEN + 1),
            Err(KdfError::KeyDerivationFailed)
        );
    }

    #[test]
    fn root_kdf_halves_are_distinct() {
        let (root, chain) = kdf_root(&[7u8; 32], &[9u8; 32]).unwrap();
        assert_ne!(root, chain);
        // Re-deriving with the same inputs reproduces both halves.
        let (root2, chain2) = kdf_root(&[7u8; 32], &[9u8; 32]).unwrap();
        assert_eq!(root, root2);
        assert_eq!(chain, chain2);
    }

    #[test]
    fn chain_kdf_separates_message_and_chain_keys() {
        let ck = [3u8; 32];
        let (next, mk) = kdf_chain(&ck);
        assert_ne!(next, mk);
        assert_ne!(next, ck);

        // Advancing twice from the same point is stable.
        let (next2, mk2) = kdf_chain(&ck);
        assert_eq!(next, next2);
        assert_eq!(mk, mk2);

        // And the second step differs from the first.
        let (next3, mk3) = kdf_chain(&next);
        assert_ne!(next3, next);
        assert_ne!(mk3, mk);
    }

    #[test]
    fn hmac_differs_per_key() {
        assert_ne!(hmac_sha256(b"k1", b"info"), hmac_sha256(b"k2", b"info"));
    }
}
