//! secp256k1 primitive backing `evm` identities.
//!
//! Keys use the SEC1 encodings native to the curve: 32-byte private scalars
//! and 33-byte compressed public points. Diffie-Hellman is plain secp256k1
//! ECDH (the x coordinate of the shared point, which every consumer feeds
//! through HKDF before use). Signatures are 64-byte fixed-width ECDSA.
//! Addresses follow the Ethereum convention:
//! `0x || hex(keccak256(uncompressed_point[1..])[12..])`.

use {
    super::{ChainPrimitive, ChainType, KeyPair, PrimitiveError, SharedSecret},
    k256::{
        ecdh,
        ecdsa::{
            signature::{Signer, Verifier},
            Signature, SigningKey, VerifyingKey,
        },
        elliptic_curve::sec1::ToEncodedPoint,
        PublicKey, SecretKey,
    },
    rand::rngs::OsRng,
    sha3::{Digest, Keccak256},
    zeroize::Zeroizing,
};

/// ECDSA-over-secp256k1 implementation of [`ChainPrimitive`].
#[derive(Debug)]
pub struct Secp256k1Primitive;

impl Secp256k1Primitive {
    fn secret_key(private: &[u8]) -> Result<SecretKey, PrimitiveError> {
        SecretKey::from_slice(private).map_err(|_| PrimitiveError::InvalidKey)
    }

    fn public_key(public: &[u8]) -> Result<PublicKey, PrimitiveError> {
        PublicKey::from_sec1_bytes(public).map_err(|_| PrimitiveError::InvalidKey)
    }

    fn compressed(public: &PublicKey) -> Vec<u8> {
        public.to_encoded_point(true).as_bytes().to_vec()
    }
}

impl ChainPrimitive for Secp256k1Primitive {
    fn chain_type(&self) -> ChainType {
        ChainType::Evm
    }

    fn generate_keypair(&self) -> KeyPair {
        let secret = SecretKey::random(&mut OsRng);
        let public = Self::compressed(&secret.public_key());
        KeyPair::new(public, secret.to_bytes().as_slice().to_vec())
    }

    fn keypair_from_private(&self, private: &[u8]) -> Result<KeyPair, PrimitiveError> {
        let secret = Self::secret_key(private)?;
        let public = Self::compressed(&secret.public_key());
        Ok(KeyPair::new(public, secret.to_bytes().as_slice().to_vec()))
    }

    fn shared_secret(
        &self,
        private: &[u8],
        peer_public: &[u8],
    ) -> Result<SharedSecret, PrimitiveError> {
        let secret = Self::secret_key(private)?;
        let peer = Self::public_key(peer_public)?;
        let shared = ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(Zeroizing::new(out))
    }

    fn sign(&self, private: &[u8], message: &[u8]) -> Result<Vec<u8>, PrimitiveError> {
        let signing = SigningKey::from_slice(private).map_err(|_| PrimitiveError::InvalidKey)?;
        let signature: Signature = signing.sign(message);
        Ok(signature.to_bytes().as_slice().to_vec())
    }

    fn verify(&self, public: &[u8], message: &[u8], signature: &[u8]) -> bool {
        let Ok(verifying) = VerifyingKey::from_sec1_bytes(public) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        verifying.verify(message, &signature).is_ok()
    }

    fn is_valid_public_key(&self, bytes: &[u8]) -> bool {
        PublicKey::from_sec1_bytes(bytes).is_ok()
    }

    fn is_valid_private_key(&self, bytes: &[u8]) -> bool {
        SecretKey::from_slice(bytes).is_ok()
    }

    fn address(&self, public: &[u8]) -> Result<String, PrimitiveError> {
        let key = Self::public_key(public)?;
        let uncompressed = key.to_encoded_point(false);
        // Skip the 0x04 SEC1 tag, hash the 64-byte point, keep the low 20 bytes.
        let digest = Keccak256::digest(&uncompressed.as_bytes()[1..]);
        Ok(format!("0x{}", hex::encode(&digest[12..])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_key_round_trips_to_the_same_public_key() {
        let pair = Secp256k1Primitive.generate_keypair();
        let rebuilt = Secp256k1Primitive
            .keypair_from_private(pair.private())
            .unwrap();
        assert_eq!(pair.public(), rebuilt.public());
    }

    #[test]
    fn rejects_malformed_key_material_at_construction() {
        assert!(Secp256k1Primitive.keypair_from_private(&[0u8; 32]).is_err());
        assert!(Secp256k1Primitive.keypair_from_private(&[1u8; 16]).is_err());
        assert!(!Secp256k1Primitive.is_valid_public_key(&[2u8; 32]));
        assert!(!Secp256k1Primitive.is_valid_private_key(&[0u8; 32]));
    }

    #[test]
    fn shared_secret_rejects_invalid_peer_points() {
        let pair = Secp256k1Primitive.generate_keypair();
        assert!(Secp256k1Primitive
            .shared_secret(pair.private(), &[0u8; 33])
            .is_err());
    }

    #[test]
    fn address_is_lowercase_eip_hex() {
        let pair = Secp256k1Primitive.generate_keypair();
        let address = Secp256k1Primitive.address(pair.public()).unwrap();
        assert!(address.starts_with("0x"));
        assert_eq!(address.len(), 42);
        assert!(address[2..].chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic per key.
        assert_eq!(address, Secp256k1Primitive.address(pair.public()).unwrap());
    }

    #[test]
    fn signatures_are_fixed_width() {
        let pair = Secp256k1Primitive.generate_keypair();
        let sig = Secp256k1Primitive.sign(pair.private(), b"msg").unwrap();
        assert_eq!(sig.len(), 64);
    }

    #[test]
    fn tampered_signature_fails_verification() {
        let pair = Secp256k1Primitive.generate_keypair();
        let mut sig = Secp256k1Primitive.sign(pair.private(), b"msg").unwrap();
        sig[10] ^= 0x01;
        assert!(!Secp256k1Primitive.verify(pair.public(), b"msg", &sig));
    }
}
