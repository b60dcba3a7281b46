//! Prekey persistence, as an injected dependency.
//!
//! The protocol engine never owns durable storage. Callers hand it an
//! implementation of [`PreKeyStore`]; two are provided here, an in-memory
//! store for tests and short-lived processes and a JSON-file store with
//! atomic writes. The load-bearing contract is
//! [`consume_one_time_pre_key`](PreKeyStore::consume_one_time_pre_key):
//! a given key id yields its pair at most once, ever. Consumed ids are
//! tombstoned so even re-storing the same id cannot resurrect it.

use {
    crate::x3dh::{IdentityKeyPair, OneTimePreKey, SignedPreKey},
    serde::{Deserialize, Serialize},
    std::{
        collections::{BTreeMap, HashSet},
        fs,
        io::Write,
        path::{Path, PathBuf},
    },
    thiserror::Error,
};

/// Failures of a prekey store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Attempt to store a one-time prekey under an id that already exists
    /// or was already consumed.
    #[error("one-time pre-key id {0} already used")]
    DuplicateKeyId(u32),
}

/// Storage contract consumed by the handshake layer.
///
/// Implementations must guarantee at-most-once consumption of one-time
/// prekeys. Everything else is ordinary keyed storage.
pub trait PreKeyStore {
    fn store_identity_key_pair(&mut self, identity: &IdentityKeyPair) -> Result<(), StoreError>;
    fn identity_key_pair(&self) -> Result<Option<IdentityKeyPair>, StoreError>;

    fn store_signed_pre_key(&mut self, pre_key: &SignedPreKey) -> Result<(), StoreError>;
    fn signed_pre_key(&self, key_id: u32) -> Result<Option<SignedPreKey>, StoreError>;
    /// The most recently created signed prekey, the one bundles should
    /// advertise.
    fn latest_signed_pre_key(&self) -> Result<Option<SignedPreKey>, StoreError>;
    /// Drop signed prekeys created before `cutoff_ms`, always retaining the
    /// newest one so late-arriving handshakes against the current bundle
    /// keep working. Returns how many were removed.
    fn remove_signed_pre_keys_before(&mut self, cutoff_ms: i64) -> Result<usize, StoreError>;

    fn store_one_time_pre_keys(&mut self, pre_keys: &[OneTimePreKey]) -> Result<(), StoreError>;
    /// Atomically hand out and delete the prekey with `key_id`. Returns
    /// `None` for unknown and for already-consumed ids.
    fn consume_one_time_pre_key(&mut self, key_id: u32)
        -> Result<Option<OneTimePreKey>, StoreError>;
    fn one_time_pre_key_count(&self) -> Result<usize, StoreError>;
}

// === In-memory implementation ===

/// Volatile store backed by ordinary maps. Suitable for tests and for hosts
/// that snapshot state through their own persistence layer.
#[derive(Default)]
pub struct MemoryPreKeyStore {
    identity: Option<IdentityKeyPair>,
    signed: BTreeMap<u32, SignedPreKey>,
    one_time: BTreeMap<u32, OneTimePreKey>,
    consumed: HashSet<u32>,
}

impl MemoryPreKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreKeyStore for MemoryPreKeyStore {
    fn store_identity_key_pair(&mut self, identity: &IdentityKeyPair) -> Result<(), StoreError> {
        self.identity = Some(identity.clone());
        Ok(())
    }

    fn identity_key_pair(&self) -> Result<Option<IdentityKeyPair>, StoreError> {
        Ok(self.identity.clone())
    }

    fn store_signed_pre_key(&mut self, pre_key: &SignedPreKey) -> Result<(), StoreError> {
        self.signed.insert(pre_key.key_id, pre_key.clone());
        Ok(())
    }

    fn signed_pre_key(&self, key_id: u32) -> Result<Option<SignedPreKey>, StoreError> {
        Ok(self.signed.get(&key_id).cloned())
    }

    fn latest_signed_pre_key(&self) -> Result<Option<SignedPreKey>, StoreError> {
        Ok(self
            .signed
            .values()
            .max_by_key(|k| (k.timestamp_ms, k.key_id))
            .cloned())
    }

    fn remove_signed_pre_keys_before(&mut self, cutoff_ms: i64) -> Result<usize, StoreError> {
        let latest = self.latest_signed_pre_key()?.map(|k| k.key_id);
        let before = self.signed.len();
        self.signed
            .retain(|id, key| Some(*id) == latest || key.timestamp_ms >= cutoff_ms);
        Ok(before - self.signed.len())
    }

    fn store_one_time_pre_keys(&mut self, pre_keys: &[OneTimePreKey]) -> Result<(), StoreError> {
        for key in pre_keys {
            if self.consumed.contains(&key.key_id) || self.one_time.contains_key(&key.key_id) {
                return Err(StoreError::DuplicateKeyId(key.key_id));
            }
        }
        for key in pre_keys {
            self.one_time.insert(key.key_id, key.clone());
        }
        Ok(())
    }

    fn consume_one_time_pre_key(
        &mut self,
        key_id: u32,
    ) -> Result<Option<OneTimePreKey>, StoreError> {
        let taken = self.one_time.remove(&key_id);
        if taken.is_some() {
            self.consumed.insert(key_id);
        }
        Ok(taken)
    }

    fn one_time_pre_key_count(&self) -> Result<usize, StoreError> {
        Ok(self.one_time.len())
    }
}

// === File-backed implementation ===

/// On-disk document shape of [`FilePreKeyStore`].
#[derive(Default, Serialize, Deserialize)]
struct PreKeyDocument {
    identity: Option<IdentityKeyPair>,
    signed: Vec<SignedPreKey>,
    one_time: Vec<OneTimePreKey>,
    consumed: Vec<u32>,
}

/// Durable store persisting a JSON document after every mutation.
///
/// Writes go to a sibling temp file which is then renamed over the target,
/// so a crash mid-write leaves the previous document intact. Key material is
/// stored in the clear; protecting the file is the host's concern.
pub struct FilePreKeyStore {
    path: PathBuf,
    inner: MemoryPreKeyStore,
}

impl FilePreKeyStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let inner = match fs::read(&path) {
            Ok(bytes) => {
                let doc: PreKeyDocument = serde_json::from_slice(&bytes)?;
                let mut store = MemoryPreKeyStore::new();
                store.identity = doc.identity;
                store.signed = doc.signed.into_iter().map(|k| (k.key_id, k)).collect();
                store.one_time = doc.one_time.into_iter().map(|k| (k.key_id, k)).collect();
                store.consumed = doc.consumed.into_iter().collect();
                store
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => MemoryPreKeyStore::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, inner })
    }

    fn persist(&self) -> Result<(), StoreError> {
        let doc = PreKeyDocument {
            identity: self.inner.identity.clone(),
            signed: self.inner.signed.values().cloned().collect(),
            one_time: self.inner.one_time.values().cloned().collect(),
            consumed: self.inner.consumed.iter().copied().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl PreKeyStore for FilePreKeyStore {
    fn store_identity_key_pair(&mut self, identity: &IdentityKeyPair) -> Result<(), StoreError> {
        self.inner.store_identity_key_pair(identity)?;
        self.persist()
    }

    fn identity_key_pair(&self) -> Result<Option<IdentityKeyPair>, StoreError> {
        self.inner.identity_key_pair()
    }

    fn store_signed_pre_key(&mut self, pre_key: &SignedPreKey) -> Result<(), StoreError> {
        self.inner.store_signed_pre_key(pre_key)?;
        self.persist()
    }

    fn signed_pre_key(&self, key_id: u32) -> Result<Option<SignedPreKey>, StoreError> {
        self.inner.signed_pre_key(key_id)
    }

    fn latest_signed_pre_key(&self) -> Result<Option<SignedPreKey>, StoreError> {
        self.inner.latest_signed_pre_key()
    }

    fn remove_signed_pre_keys_before(&mut self, cutoff_ms: i64) -> Result<usize, StoreError> {
        let removed = self.inner.remove_signed_pre_keys_before(cutoff_ms)?;
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    fn store_one_time_pre_keys(&mut self, pre_keys: &[OneTimePreKey]) -> Result<(), StoreError> {
        self.inner.store_one_time_pre_keys(pre_keys)?;
        self.persist()
    }

    fn consume_one_time_pre_key(
        &mut self,
        key_id: u32,
    ) -> Result<Option<OneTimePreKey>, StoreError> {
        let taken = self.inner.consume_one_time_pre_key(key_id)?;
        if taken.is_some() {
            self.persist()?;
        }
        Ok(taken)
    }

    fn one_time_pre_key_count(&self) -> Result<usize, StoreError> {
        self.inner.one_time_pre_key_count()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            primitive::ChainType,
            x3dh::{
                generate_identity_key_pair, generate_one_time_pre_keys, generate_signed_pre_key,
            },
        },
        assert_matches::assert_matches,
    };

    fn fixtures() -> (IdentityKeyPair, SignedPreKey, Vec<OneTimePreKey>) {
        let identity = generate_identity_key_pair(&[0xabu8; 32], 1, ChainType::Solana).unwrap();
        let spk = generate_signed_pre_key(&identity, 1).unwrap();
        let otpks = generate_one_time_pre_keys(ChainType::Solana, 10, 3).unwrap();
        (identity, spk, otpks)
    }

    #[test]
    fn one_time_pre_keys_are_consumed_at_most_once() {
        let (_, _, otpks) = fixtures();
        let mut store = MemoryPreKeyStore::new();
        store.store_one_time_pre_keys(&otpks).unwrap();
        assert_eq!(store.one_time_pre_key_count().unwrap(), 3);

        let first = store.consume_one_time_pre_key(11).unwrap();
        assert_eq!(first.unwrap().key_id, 11);
        assert!(store.consume_one_time_pre_key(11).unwrap().is_none());
        assert_eq!(store.one_time_pre_key_count().unwrap(), 2);
    }

    #[test]
    fn consumed_ids_cannot_be_restored() {
        let (_, _, otpks) = fixtures();
        let mut store = MemoryPreKeyStore::new();
        store.store_one_time_pre_keys(&otpks).unwrap();
        store.consume_one_time_pre_key(10).unwrap();

        assert_matches!(
            store.store_one_time_pre_keys(&otpks[..1]),
            Err(StoreError::DuplicateKeyId(10))
        );
    }

    #[test]
    fn duplicate_live_ids_are_rejected() {
        let (_, _, otpks) = fixtures();
        let mut store = MemoryPreKeyStore::new();
        store.store_one_time_pre_keys(&otpks).unwrap();
        assert_matches!(
            store.store_one_time_pre_keys(&otpks[1..2]),
            Err(StoreError::DuplicateKeyId(11))
        );
    }

    #[test]
    fn signed_pre_key_rotation_retains_the_newest() {
        let (identity, _, _) = fixtures();
        let mut store = MemoryPreKeyStore::new();
        let mut old = generate_signed_pre_key(&identity, 1).unwrap();
        old.timestamp_ms = 1_000;
        let mut newer = generate_signed_pre_key(&identity, 2).unwrap();
        newer.timestamp_ms = 2_000;
        store.store_signed_pre_key(&old).unwrap();
        store.store_signed_pre_key(&newer).unwrap();

        assert_eq!(store.latest_signed_pre_key().unwrap().unwrap().key_id, 2);

        // Cutoff beyond both: the old one goes, the newest survives.
        let removed = store.remove_signed_pre_keys_before(10_000).unwrap();
        assert_eq!(removed, 1);
        assert!(store.signed_pre_key(1).unwrap().is_none());
        assert!(store.signed_pre_key(2).unwrap().is_some());
    }

    #[test]
    fn file_store_round_trips_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prekeys.json");
        let (identity, spk, otpks) = fixtures();

        {
            let mut store = FilePreKeyStore::open(&path).unwrap();
            store.store_identity_key_pair(&identity).unwrap();
            store.store_signed_pre_key(&spk).unwrap();
            store.store_one_time_pre_keys(&otpks).unwrap();
            store.consume_one_time_pre_key(10).unwrap();
        }

        let mut reopened = FilePreKeyStore::open(&path).unwrap();
        let loaded = reopened.identity_key_pair().unwrap().unwrap();
        assert_eq!(loaded.address, identity.address);
        assert_eq!(reopened.one_time_pre_key_count().unwrap(), 2);
        // Consumption tombstones survive the reopen.
        assert!(reopened.consume_one_time_pre_key(10).unwrap().is_none());
        assert_matches!(
            reopened.store_one_time_pre_keys(&otpks[..1]),
            Err(StoreError::DuplicateKeyId(10))
        );
    }
}
