#![forbid(unsafe_code)]
//! # DeyondCrypt protocol core
//!
//! End-to-end encrypted messaging rooted in blockchain wallet identities:
//! an X3DH key-agreement phase over chain-pluggable curve primitives,
//! followed by a Double Ratchet encryption phase, wrapped into signed,
//! versioned wire envelopes.
//!
//! The crate performs no network I/O and owns no durable storage. Callers
//! inject persistence through [`prekey_store::PreKeyStore`] and the opaque
//! session snapshots, and exchange only [`envelope::Envelope`] values with
//! their transport.

/// Chain-pluggable elliptic-curve primitives (key generation, ECDH,
/// signing) plus the chain-type registry resolving a tag to a concrete
/// implementation exactly once per session or bundle.
pub mod primitive;

/// HKDF and HMAC-SHA-256 derivations: the root-key and chain-key KDFs the
/// ratchet advances on.
pub mod kdf;

/// ChaCha20-Poly1305 authenticated encryption of per-message payloads,
/// nonce prepended for transport.
pub mod cipher;

/// X3DH key agreement: wallet-derived identities, signed and one-time
/// prekeys, published bundles and the asynchronous handshake itself.
pub mod x3dh;

/// Injected prekey persistence: the store contract plus in-memory and
/// JSON-file implementations with at-most-once one-time-prekey consumption.
pub mod prekey_store;

/// The Double Ratchet session: per-message symmetric ratcheting,
/// per-round-trip DH ratcheting and bounded out-of-order recovery.
pub mod ratchet;

/// The signed, versioned, transport-agnostic wire record and its canonical
/// signing-byte serialization.
pub mod envelope;

/// Per-peer glue tying handshake, ratchet and envelope together.
pub mod session;

mod secret_bytes;
pub use secret_bytes::{SecretBytes, SecretVec};
