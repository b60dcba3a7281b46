//! Ed25519 primitive backing `solana` identities.
//!
//! Signing and verification are plain Ed25519 (`verify_strict`, so
//! non-canonical points are rejected). Diffie-Hellman bridges to X25519 per
//! RFC 7748: the private scalar is the low half of `SHA-512(seed)` and the
//! peer's verifying key is mapped to its Montgomery form. The chain-native
//! address is the base58 encoding of the 32-byte verifying key.

use {
    super::{ChainPrimitive, ChainType, KeyPair, PrimitiveError, SharedSecret},
    ed25519_dalek::{Signer, SigningKey, VerifyingKey},
    rand::rngs::OsRng,
    sha2::{Digest, Sha512},
    x25519_dalek::StaticSecret,
    zeroize::{Zeroize, Zeroizing},
};

/// Ed25519 implementation of [`ChainPrimitive`].
#[derive(Debug)]
pub struct Ed25519Primitive;

impl Ed25519Primitive {
    fn signing_key(private: &[u8]) -> Result<SigningKey, PrimitiveError> {
        let seed: [u8; 32] = private.try_into().map_err(|_| PrimitiveError::InvalidKey)?;
        Ok(SigningKey::from_bytes(&seed))
    }

    fn verifying_key(public: &[u8]) -> Result<VerifyingKey, PrimitiveError> {
        let bytes: [u8; 32] = public.try_into().map_err(|_| PrimitiveError::InvalidKey)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| PrimitiveError::InvalidKey)
    }

    /// RFC 7748 bridge: Ed25519 seed to X25519 scalar.
    ///
    /// Clamping happens inside `x25519-dalek` during scalar multiplication;
    /// the intermediate hash is wiped before returning.
    fn montgomery_secret(seed: &[u8; 32]) -> StaticSecret {
        let mut hash = [0u8; 64];
        hash.copy_from_slice(&Sha512::digest(seed));
        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&hash[..32]);
        hash.zeroize();
        let secret = StaticSecret::from(scalar);
        scalar.zeroize();
        secret
    }
}

impl ChainPrimitive for Ed25519Primitive {
    fn chain_type(&self) -> ChainType {
        ChainType::Solana
    }

    fn generate_keypair(&self) -> KeyPair {
        let signing = SigningKey::generate(&mut OsRng);
        KeyPair::new(
            signing.verifying_key().to_bytes().to_vec(),
            signing.to_bytes().to_vec(),
        )
    }

    fn keypair_from_private(&self, private: &[u8]) -> Result<KeyPair, PrimitiveError> {
        let signing = Self::signing_key(private)?;
        Ok(KeyPair::new(
            signing.verifying_key().to_bytes().to_vec(),
            signing.to_bytes().to_vec(),
        ))
    }

    fn shared_secret(
        &self,
        private: &[u8],
        peer_public: &[u8],
    ) -> Result<SharedSecret, PrimitiveError> {
        let signing = Self::signing_key(private)?;
        let secret = Self::montgomery_secret(&signing.to_bytes());
        let peer = Self::verifying_key(peer_public)?;
        let peer_montgomery = x25519_dalek::PublicKey::from(peer.to_montgomery().to_bytes());
        let shared = secret.diffie_hellman(&peer_montgomery);
        // Small-order peer points collapse the shared secret to zero.
        if !shared.was_contributory() {
            return Err(PrimitiveError::InvalidKey);
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }

    fn sign(&self, private: &[u8], message: &[u8]) -> Result<Vec<u8>, PrimitiveError> {
        let signing = Self::signing_key(private)?;
        Ok(signing.sign(message).to_bytes().to_vec())
    }

    fn verify(&self, public: &[u8], message: &[u8], signature: &[u8]) -> bool {
        let Ok(verifying) = Self::verifying_key(public) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        verifying.verify_strict(message, &signature).is_ok()
    }

    fn is_valid_public_key(&self, bytes: &[u8]) -> bool {
        Self::verifying_key(bytes).is_ok()
    }

    fn is_valid_private_key(&self, bytes: &[u8]) -> bool {
        bytes.len() == 32
    }

    fn address(&self, public: &[u8]) -> Result<String, PrimitiveError> {
        Self::verifying_key(public)?;
        Ok(bs58::encode(public).into_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_bridge_matches_between_both_directions() {
        let a = Ed25519Primitive.generate_keypair();
        let b = Ed25519Primitive.generate_keypair();
        let ab = Ed25519Primitive.shared_secret(a.private(), b.public()).unwrap();
        let ba = Ed25519Primitive.shared_secret(b.private(), a.public()).unwrap();
        assert_eq!(&*ab, &*ba);
    }

    #[test]
    fn dh_bridge_is_deterministic() {
        let a = Ed25519Primitive.keypair_from_private(&[0x55u8; 32]).unwrap();
        let b = Ed25519Primitive.keypair_from_private(&[0x66u8; 32]).unwrap();
        let one = Ed25519Primitive.shared_secret(a.private(), b.public()).unwrap();
        let two = Ed25519Primitive.shared_secret(a.private(), b.public()).unwrap();
        assert_eq!(&*one, &*two);
    }

    #[test]
    fn strict_verification_rejects_cross_key_signatures() {
        let a = Ed25519Primitive.generate_keypair();
        let b = Ed25519Primitive.generate_keypair();
        let sig = Ed25519Primitive.sign(a.private(), b"hello").unwrap();
        assert!(Ed25519Primitive.verify(a.public(), b"hello", &sig));
        assert!(!Ed25519Primitive.verify(b.public(), b"hello", &sig));
        assert!(!Ed25519Primitive.verify(a.public(), b"hello", &sig[..63]));
    }

    #[test]
    fn address_is_base58_of_the_verifying_key() {
        let pair = Ed25519Primitive.generate_keypair();
        let address = Ed25519Primitive.address(pair.public()).unwrap();
        let decoded = bs58::decode(&address).into_vec().unwrap();
        assert_eq!(decoded, pair.public());
    }

    #[test]
    fn invalid_public_keys_are_rejected_everywhere() {
        let pair = Ed25519Primitive.generate_keypair();
        assert!(!Ed25519Primitive.is_valid_public_key(&[0xffu8; 31]));
        assert!(Ed25519Primitive.address(&[0xffu8; 31]).is_err());
        assert!(Ed25519Primitive
            .shared_secret(pair.private(), &[0xffu8; 31])
            .is_err());
    }
}
