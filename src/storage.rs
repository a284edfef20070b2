//! Storage capability consumed by the engine, plus an in-memory
//! implementation suitable for tests and embedding.
//!
//! The engine only ever talks to storage through [`ProtocolStore`]; it
//! never calls the store twice concurrently for the same peer because
//! every mutating operation runs under the per-peer queue.

use crate::error::{Error, Result};
use crate::keys::{KeyPair, PublicKey};
use crate::record::SessionRecord;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Capability set the session engine requires from its backing store.
///
/// All methods are asynchronous and fallible; none mutate engine state.
#[async_trait]
pub trait ProtocolStore: Send + Sync {
    /// Our long-term identity key pair.
    async fn get_our_identity(&self) -> Result<KeyPair>;

    /// Our 14-bit registration id.
    async fn get_our_registration_id(&self) -> Result<u32>;

    /// Trust decision for a peer identity key (TOFU or policy).
    async fn is_trusted_identity(&self, name: &str, identity_key: &PublicKey) -> Result<bool>;

    /// Loads the session record for a fully qualified address, if any.
    async fn load_session(&self, address: &str) -> Result<Option<SessionRecord>>;

    /// Atomically persists a (possibly pruned) session record.
    async fn store_session(&self, address: &str, record: &SessionRecord) -> Result<()>;

    /// One-time pre-key lookup.
    async fn load_pre_key(&self, id: u32) -> Result<Option<KeyPair>>;

    /// Medium-term signed pre-key lookup.
    async fn load_signed_pre_key(&self, id: u32) -> Result<Option<KeyPair>>;

    /// Deletes a consumed one-time pre-key. Idempotent.
    async fn remove_pre_key(&self, id: u32) -> Result<()>;
}

/// Thread-safe in-memory store.
///
/// Keeps identity material, pre-keys and serialized session records
/// behind an `Arc<Mutex<_>>` so clones share state across tasks. Trust
/// is first-use: the first identity key seen for a name is recorded and
/// later keys must match; [`InMemoryStore::set_trusted`] overrides the
/// decision for a name, which tests use to model revocation.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

struct StoreInner {
    identity: KeyPair,
    registration_id: u32,
    sessions: HashMap<String, Vec<u8>>,
    pre_keys: HashMap<u32, KeyPair>,
    signed_pre_keys: HashMap<u32, KeyPair>,
    seen_identities: HashMap<String, PublicKey>,
    trust_overrides: HashMap<String, bool>,
}

impl InMemoryStore {
    /// Creates a store owning the given identity.
    #[must_use]
    pub fn new(identity: KeyPair, registration_id: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                identity,
                registration_id,
                sessions: HashMap::new(),
                pre_keys: HashMap::new(),
                signed_pre_keys: HashMap::new(),
                seen_identities: HashMap::new(),
                trust_overrides: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StoreInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Storage("store lock poisoned".into()))
    }

    /// Registers a one-time pre-key pair.
    pub fn add_pre_key(&self, id: u32, key_pair: KeyPair) -> Result<()> {
        self.lock()?.pre_keys.insert(id, key_pair);
        Ok(())
    }

    /// Registers a signed pre-key pair.
    pub fn add_signed_pre_key(&self, id: u32, key_pair: KeyPair) -> Result<()> {
        self.lock()?.signed_pre_keys.insert(id, key_pair);
        Ok(())
    }

    /// Forces the trust decision for a name, overriding first-use.
    pub fn set_trusted(&self, name: &str, trusted: bool) -> Result<()> {
        self.lock()?
            .trust_overrides
            .insert(name.to_string(), trusted);
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl ProtocolStore for InMemoryStore {
    async fn get_our_identity(&self) -> Result<KeyPair> {
        Ok(self.lock()?.identity.clone())
    }

    async fn get_our_registration_id(&self) -> Result<u32> {
        Ok(self.lock()?.registration_id)
    }

    async fn is_trusted_identity(&self, name: &str, identity_key: &PublicKey) -> Result<bool> {
        let mut inner = self.lock()?;
        if let Some(&decision) = inner.trust_overrides.get(name) {
            return Ok(decision);
        }
        match inner.seen_identities.get(name) {
            Some(seen) => Ok(seen == identity_key),
            None => {
                inner
                    .seen_identities
                    .insert(name.to_string(), *identity_key);
                Ok(true)
            }
        }
    }

    async fn load_session(&self, address: &str) -> Result<Option<SessionRecord>> {
        let data = self.lock()?.sessions.get(address).cloned();
        data.map(|bytes| SessionRecord::deserialize(&bytes)).transpose()
    }

    async fn store_session(&self, address: &str, record: &SessionRecord) -> Result<()> {
        let bytes = record.serialize()?;
        self.lock()?.sessions.insert(address.to_string(), bytes);
        Ok(())
    }

    async fn load_pre_key(&self, id: u32) -> Result<Option<KeyPair>> {
        Ok(self.lock()?.pre_keys.get(&id).cloned())
    }

    async fn load_signed_pre_key(&self, id: u32) -> Result<Option<KeyPair>> {
        Ok(self.lock()?.signed_pre_keys.get(&id).cloned())
    }

    async fn remove_pre_key(&self, id: u32) -> Result<()> {
        self.lock()?.pre_keys.remove(&id);
        Ok(())
    }
}
