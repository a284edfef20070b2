//! A peer's collection of sessions: one open session at most, closed
//! sessions retained in bounded number for trial decryption.

use crate::error::{Error, Result};
use crate::keys::PublicKey;
use crate::session::{BaseKeyType, SessionEntry};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;
use tracing::{error, warn};

/// Sessions kept per record after pruning
pub const CLOSED_SESSIONS_MAX: usize = 40;

/// Current persisted record version
pub const SESSION_RECORD_VERSION: &str = "v1";

/// Ordered migrations: each target version paired with its rewrite of
/// the raw record tree.
const MIGRATIONS: &[(&str, fn(&mut Value))] = &[(SESSION_RECORD_VERSION, migrate_v1)];

/// All sessions for one peer device, keyed by handshake base key in
/// insertion order.
#[derive(Clone, Debug, Default)]
pub struct SessionRecord {
    sessions: Vec<SessionEntry>,
}

impl SessionRecord {
    /// Creates an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a session by base key. Looking up a session indexed
    /// under our own base key is a caller bug: the receiver must never
    /// trial-decrypt against a session it initiated under that key.
    pub fn get_session(&self, base_key: &PublicKey) -> Result<Option<&SessionEntry>> {
        let session = self
            .sessions
            .iter()
            .find(|s| s.index_info.base_key == *base_key);
        if let Some(session) = session {
            if session.index_info.base_key_type == BaseKeyType::Ours {
                return Err(Error::InvalidArgument(
                    "tried to look up a session keyed by our own base key".into(),
                ));
            }
        }
        Ok(session)
    }

    /// Mutable variant of [`Self::get_session`].
    pub fn get_session_mut(&mut self, base_key: &PublicKey) -> Result<Option<&mut SessionEntry>> {
        let session = self
            .sessions
            .iter_mut()
            .find(|s| s.index_info.base_key == *base_key);
        if let Some(session) = session {
            if session.index_info.base_key_type == BaseKeyType::Ours {
                return Err(Error::InvalidArgument(
                    "tried to look up a session keyed by our own base key".into(),
                ));
            }
            return Ok(Some(session));
        }
        Ok(None)
    }

    /// Returns the open session, if any.
    #[must_use]
    pub fn get_open_session(&self) -> Option<&SessionEntry> {
        self.sessions.iter().find(|s| !s.is_closed())
    }

    /// Mutable variant of [`Self::get_open_session`].
    pub fn get_open_session_mut(&mut self) -> Option<&mut SessionEntry> {
        self.sessions.iter_mut().find(|s| !s.is_closed())
    }

    /// Closes the open session, if any.
    pub fn close_open_session(&mut self) {
        if let Some(session) = self.get_open_session_mut() {
            session.close();
        }
    }

    /// Inserts a session, replacing any existing session with the same
    /// base key, then prunes old closed sessions.
    pub fn set_session(&mut self, session: SessionEntry) {
        let base_key = session.index_info.base_key;
        match self
            .sessions
            .iter_mut()
            .find(|s| s.index_info.base_key == base_key)
        {
            Some(existing) => *existing = session,
            None => self.sessions.push(session),
        }
        self.remove_old_sessions();
    }

    /// All sessions, most recently used first. This is the trial
    /// decryption order.
    #[must_use]
    pub fn get_sessions(&self) -> Vec<&SessionEntry> {
        let mut sessions: Vec<&SessionEntry> = self.sessions.iter().collect();
        sessions.sort_by_key(|s| std::cmp::Reverse(s.index_info.used));
        sessions
    }

    /// Session indices in trial decryption order (most recently used
    /// first).
    pub(crate) fn recency_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.sessions.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(self.sessions[i].index_info.used));
        order
    }

    pub(crate) fn session_at_mut(&mut self, index: usize) -> &mut SessionEntry {
        &mut self.sessions[index]
    }

    pub(crate) fn session_at(&self, index: usize) -> &SessionEntry {
        &self.sessions[index]
    }

    /// Number of sessions currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when the record holds no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drops every session.
    pub fn delete_all_sessions(&mut self) {
        self.sessions.clear();
    }

    /// Evicts the oldest-closed sessions until at most
    /// [`CLOSED_SESSIONS_MAX`] remain. Open sessions are never evicted;
    /// if the record is over the limit with nothing evictable this only
    /// warns.
    pub fn remove_old_sessions(&mut self) {
        while self.sessions.len() > CLOSED_SESSIONS_MAX {
            let oldest = self
                .sessions
                .iter()
                .enumerate()
                .filter(|(_, s)| s.is_closed())
                .min_by_key(|(_, s)| s.index_info.closed)
                .map(|(i, _)| i);
            match oldest {
                Some(index) => {
                    self.sessions.remove(index);
                }
                None => {
                    warn!(
                        count = self.sessions.len(),
                        "record over session limit but no closed session to evict"
                    );
                    break;
                }
            }
        }
    }

    /// Serializes to the persisted layout:
    /// `{ "_sessions": { base64(base_key): session }, "version": "v1" }`.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut sessions = serde_json::Map::new();
        for session in &self.sessions {
            sessions.insert(
                BASE64.encode(session.index_info.base_key.serialize()),
                session.serialize(),
            );
        }
        let mut root = serde_json::Map::new();
        root.insert("_sessions".into(), Value::Object(sessions));
        root.insert(
            "version".into(),
            Value::String(SESSION_RECORD_VERSION.into()),
        );
        serde_json::to_vec(&Value::Object(root))
            .map_err(|e| Error::Session(format!("record serialize: {e}")))
    }

    /// Loads a persisted record, running any pending migrations first.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut root: Value = serde_json::from_slice(data)
            .map_err(|e| Error::Session(format!("record deserialize: {e}")))?;
        if !root.is_object() {
            return Err(Error::Session("record is not an object".into()));
        }
        migrate(&mut root)?;

        let sessions_value = root
            .get("_sessions")
            .and_then(Value::as_object)
            .ok_or_else(|| Error::Session("record has no _sessions map".into()))?;

        let mut sessions = Vec::with_capacity(sessions_value.len());
        for (encoded_key, session_value) in sessions_value {
            let session = SessionEntry::deserialize(session_value)?;
            if BASE64.encode(session.index_info.base_key.serialize()) != *encoded_key {
                return Err(Error::Session(
                    "session stored under a key that is not its base key".into(),
                ));
            }
            sessions.push(session);
        }
        Ok(Self { sessions })
    }
}

/// Runs every migration newer than the stored version, in order.
fn migrate(root: &mut Value) -> Result<()> {
    let stored = root
        .get("version")
        .and_then(Value::as_str)
        .map(str::to_string);
    let mut run = stored.is_none();
    for (version, migration) in MIGRATIONS {
        if run {
            migration(root);
            root["version"] = Value::String((*version).to_string());
        } else if Some(*version) == stored.as_deref() {
            // Everything after the stored version still needs to run.
            run = true;
        }
    }
    if !run {
        return Err(Error::Session(format!(
            "unknown record version: {}",
            stored.unwrap_or_default()
        )));
    }
    Ok(())
}

/// v1: registration ids moved from the record root into each session.
/// A root-level id is copied into any session missing one; without a
/// root-level id, open sessions missing an id are a data loss we can
/// only report.
fn migrate_v1(root: &mut Value) {
    let root_registration_id = root.get("registration_id").and_then(Value::as_u64);
    let Some(sessions) = root.get_mut("_sessions").and_then(Value::as_object_mut) else {
        return;
    };
    for session in sessions.values_mut() {
        if session.get("registration_id").and_then(Value::as_u64).is_some() {
            continue;
        }
        match root_registration_id {
            Some(id) => {
                session["registration_id"] = Value::from(id);
            }
            None => {
                let closed = session
                    .get("index_info")
                    .and_then(|i| i.get("closed"))
                    .and_then(Value::as_i64)
                    .unwrap_or(-1);
                if closed == -1 {
                    error!("open session has no registration id after migration");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{SymmetricKey, KEY_SIZE};
    use crate::keys::KeyPair;
    use crate::session::{now_ms, CurrentRatchet, IndexInfo};
    use rand_core::OsRng;

    fn session_with(base_key_type: BaseKeyType, used: i64, closed: i64) -> SessionEntry {
        let ours = KeyPair::generate(&mut OsRng);
        let base = KeyPair::generate(&mut OsRng);
        let identity = KeyPair::generate(&mut OsRng);
        let mut session = SessionEntry::new(
            Some(1),
            CurrentRatchet {
                ephemeral_key_pair: ours,
                last_remote_ephemeral_key: base.public_key,
                previous_counter: 0,
                root_key: SymmetricKey::from_bytes([3u8; KEY_SIZE]),
            },
            IndexInfo {
                base_key: base.public_key,
                base_key_type,
                remote_identity_key: identity.public_key,
                created: now_ms(),
                used,
                closed: -1,
            },
        );
        session.index_info.closed = closed;
        session
    }

    #[test]
    fn test_single_open_session() {
        let mut record = SessionRecord::new();
        let first = session_with(BaseKeyType::Theirs, 1, -1);
        record.set_session(first);
        record.close_open_session();
        record.set_session(session_with(BaseKeyType::Theirs, 2, -1));

        assert_eq!(record.len(), 2);
        let open: Vec<_> = record
            .get_sessions()
            .into_iter()
            .filter(|s| !s.is_closed())
            .collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].index_info.used, 2);
    }

    #[test]
    fn test_get_session_rejects_our_base_key() {
        let mut record = SessionRecord::new();
        let session = session_with(BaseKeyType::Ours, 1, -1);
        let base_key = session.index_info.base_key;
        record.set_session(session);
        assert!(record.get_session(&base_key).is_err());
    }

    #[test]
    fn test_set_session_replaces_same_base_key() {
        let mut record = SessionRecord::new();
        let mut session = session_with(BaseKeyType::Theirs, 1, -1);
        let base_key = session.index_info.base_key;
        record.set_session(session.clone());

        session.registration_id = Some(99);
        record.set_session(session);
        assert_eq!(record.len(), 1);
        assert_eq!(
            record
                .get_session(&base_key)
                .unwrap()
                .unwrap()
                .registration_id,
            Some(99)
        );
    }

    #[test]
    fn test_trial_order_is_used_descending() {
        let mut record = SessionRecord::new();
        record.set_session(session_with(BaseKeyType::Theirs, 10, 100));
        record.set_session(session_with(BaseKeyType::Theirs, 30, 100));
        record.set_session(session_with(BaseKeyType::Theirs, 20, -1));

        let used: Vec<i64> = record
            .get_sessions()
            .iter()
            .map(|s| s.index_info.used)
            .collect();
        assert_eq!(used, vec![30, 20, 10]);
    }

    #[test]
    fn test_retention_evicts_oldest_closed_only() {
        let mut record = SessionRecord::new();
        for i in 0..60i64 {
            record.set_session(session_with(BaseKeyType::Theirs, i, i + 1000));
        }
        record.set_session(session_with(BaseKeyType::Theirs, 99, -1));

        assert_eq!(record.len(), CLOSED_SESSIONS_MAX);
        // The survivors are the open session plus the most recently closed.
        assert!(record.get_open_session().is_some());
        let min_closed = record
            .get_sessions()
            .iter()
            .filter(|s| s.is_closed())
            .map(|s| s.index_info.closed)
            .min()
            .unwrap();
        assert_eq!(min_closed, 1000 + 60 - (CLOSED_SESSIONS_MAX as i64 - 1));
    }

    #[test]
    fn test_retention_never_evicts_open_sessions() {
        let mut record = SessionRecord::new();
        for i in 0..(CLOSED_SESSIONS_MAX + 5) {
            record.set_session(session_with(BaseKeyType::Theirs, i as i64, -1));
        }
        // All open: nothing evictable, count stays above the limit.
        assert_eq!(record.len(), CLOSED_SESSIONS_MAX + 5);
    }

    #[test]
    fn test_record_round_trip() {
        let mut record = SessionRecord::new();
        record.set_session(session_with(BaseKeyType::Theirs, 1, -1));
        record.set_session(session_with(BaseKeyType::Theirs, 2, 50));

        let bytes = record.serialize().unwrap();
        let restored = SessionRecord::deserialize(&bytes).unwrap();
        assert_eq!(restored.len(), 2);
        assert!(restored.get_open_session().is_some());
    }

    #[test]
    fn test_migration_hoists_registration_id() {
        let mut record = SessionRecord::new();
        let mut session = session_with(BaseKeyType::Theirs, 1, -1);
        session.registration_id = None;
        let base_key = session.index_info.base_key;
        record.set_session(session);

        let mut root: Value = serde_json::from_slice(&record.serialize().unwrap()).unwrap();
        root.as_object_mut().unwrap().remove("version");
        root["registration_id"] = Value::from(4242);
        let bytes = serde_json::to_vec(&root).unwrap();

        let restored = SessionRecord::deserialize(&bytes).unwrap();
        assert_eq!(
            restored
                .get_session(&base_key)
                .unwrap()
                .unwrap()
                .registration_id,
            Some(4242)
        );
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let mut record = SessionRecord::new();
        record.set_session(session_with(BaseKeyType::Theirs, 1, -1));
        let mut root: Value = serde_json::from_slice(&record.serialize().unwrap()).unwrap();
        root["version"] = Value::String("v9".into());
        let bytes = serde_json::to_vec(&root).unwrap();
        assert!(SessionRecord::deserialize(&bytes).is_err());
    }
}
