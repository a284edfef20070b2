//! One Double Ratchet session: the root ratchet, its sending and
//! receiving chains, skipped message keys and handshake bookkeeping.

use crate::crypto::{self, SymmetricKey, KEY_SIZE};
use crate::error::{Error, Result};
use crate::keys::{KeyPair, PublicKey, SecretKey, PUBLIC_KEY_SIZE};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Maximum distance a message counter may run ahead of its chain, and
/// therefore the most skipped message keys one chain retains
pub const MAX_MESSAGE_KEYS_GAP: i32 = 2000;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Whether a chain encrypts or decrypts
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChainType {
    /// The single outbound chain
    Sending = 1,
    /// An inbound chain keyed by an observed remote ephemeral
    Receiving = 2,
}

/// Who contributed the handshake base key this session is indexed under
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BaseKeyType {
    /// We initiated; the base key is our ephemeral
    Ours = 1,
    /// The peer initiated; the base key is theirs
    Theirs = 2,
}

/// Evolving chain key. The counter starts at -1 so the first derived
/// message key lands on counter 0; an absent key marks the chain closed.
#[derive(Clone, Debug)]
pub struct ChainKey {
    /// Index of the most recently derived message key
    pub counter: i32,
    /// Current chain key, or `None` once the chain is closed
    pub key: Option<SymmetricKey>,
}

/// One symmetric ratchet chain with its skipped message keys
#[derive(Clone, Debug)]
pub struct Chain {
    /// Evolving chain key
    pub chain_key: ChainKey,
    /// Direction of this chain
    pub chain_type: ChainType,
    /// Derived but unconsumed message keys, by counter
    pub message_keys: HashMap<u32, SymmetricKey>,
}

impl Chain {
    pub(crate) fn new(chain_key: SymmetricKey, chain_type: ChainType) -> Self {
        Self {
            chain_key: ChainKey {
                counter: -1,
                key: Some(chain_key),
            },
            chain_type,
            message_keys: HashMap::new(),
        }
    }

    /// Advances the symmetric ratchet until `until`, stashing every
    /// derived message key. Refuses to run more than
    /// [`MAX_MESSAGE_KEYS_GAP`] steps ahead or to advance a closed chain.
    pub(crate) fn fill_message_keys(&mut self, until: i32) -> Result<()> {
        while self.chain_key.counter < until {
            if until - self.chain_key.counter > MAX_MESSAGE_KEYS_GAP {
                return Err(Error::Session(format!(
                    "over {MAX_MESSAGE_KEYS_GAP} messages into the future"
                )));
            }
            let Some(key) = self.chain_key.key.as_ref() else {
                return Err(Error::Session(
                    "chain closed, cannot derive message keys".into(),
                ));
            };
            let next = self.chain_key.counter + 1;
            let message_key = crypto::hmac_sha256(key.as_bytes(), &[1]);
            let next_chain_key = crypto::hmac_sha256(key.as_bytes(), &[2]);
            #[allow(clippy::cast_sign_loss)]
            self.message_keys
                .insert(next as u32, SymmetricKey::from_bytes(message_key));
            self.chain_key.key = Some(SymmetricKey::from_bytes(next_chain_key));
            self.chain_key.counter = next;
        }
        Ok(())
    }
}

/// The DH half of the double ratchet
#[derive(Clone, Debug)]
pub struct CurrentRatchet {
    /// Our current ratchet key pair
    pub ephemeral_key_pair: KeyPair,
    /// The most recent remote ratchet key we stepped against
    pub last_remote_ephemeral_key: PublicKey,
    /// Final counter of our previous sending chain
    pub previous_counter: u32,
    /// Root key feeding the next chain derivation
    pub root_key: SymmetricKey,
}

/// Session identity and lifecycle metadata
#[derive(Clone, Debug)]
pub struct IndexInfo {
    /// Handshake base key this session is indexed under
    pub base_key: PublicKey,
    /// Who contributed the base key
    pub base_key_type: BaseKeyType,
    /// Peer identity key; immutable for the session's life
    pub remote_identity_key: PublicKey,
    /// Creation time (ms since epoch)
    pub created: i64,
    /// Last successful use (ms since epoch)
    pub used: i64,
    /// Close time, or -1 while the session is open
    pub closed: i64,
}

/// Handshake material repeated on outbound messages until the peer's
/// first reply proves the session is established
#[derive(Clone, Debug)]
pub struct PendingPreKey {
    /// Signed pre-key id we handshook against
    pub signed_key_id: u32,
    /// Our handshake base key
    pub base_key: PublicKey,
    /// One-time pre-key id, when the bundle carried one
    pub pre_key_id: Option<u32>,
}

/// One Double Ratchet session state
#[derive(Clone, Debug)]
pub struct SessionEntry {
    /// Peer device registration id, when known
    pub registration_id: Option<u32>,
    /// DH ratchet state
    pub current_ratchet: CurrentRatchet,
    /// Identity and lifecycle metadata
    pub index_info: IndexInfo,
    /// Outstanding handshake material
    pub pending_pre_key: Option<PendingPreKey>,
    chains: HashMap<PublicKey, Chain>,
}

impl SessionEntry {
    pub(crate) fn new(
        registration_id: Option<u32>,
        current_ratchet: CurrentRatchet,
        index_info: IndexInfo,
    ) -> Self {
        Self {
            registration_id,
            current_ratchet,
            index_info,
            pending_pre_key: None,
            chains: HashMap::new(),
        }
    }

    /// Registers a chain under an ephemeral key. Overwriting is an error.
    pub fn add_chain(&mut self, key: PublicKey, chain: Chain) -> Result<()> {
        if self.chains.contains_key(&key) {
            return Err(Error::InvalidArgument(
                "chain already exists for this key".into(),
            ));
        }
        self.chains.insert(key, chain);
        Ok(())
    }

    /// Looks up a chain by ephemeral key.
    #[must_use]
    pub fn get_chain(&self, key: &PublicKey) -> Option<&Chain> {
        self.chains.get(key)
    }

    /// Mutable chain lookup.
    pub fn get_chain_mut(&mut self, key: &PublicKey) -> Option<&mut Chain> {
        self.chains.get_mut(key)
    }

    /// Removes a chain. Removing a missing chain is an error.
    pub fn delete_chain(&mut self, key: &PublicKey) -> Result<()> {
        if self.chains.remove(key).is_none() {
            return Err(Error::InvalidArgument(
                "tried to delete a missing chain".into(),
            ));
        }
        Ok(())
    }

    /// Iterates all chains.
    pub fn chains(&self) -> impl Iterator<Item = (&PublicKey, &Chain)> {
        self.chains.iter()
    }

    /// Derives a new chain off the root ratchet: DH against
    /// `remote_key`, then a two-chunk root KDF. A sending chain is
    /// keyed by our ratchet key, a receiving chain by the remote's.
    pub(crate) fn calculate_ratchet(
        &mut self,
        remote_key: &PublicKey,
        chain_type: ChainType,
    ) -> Result<()> {
        let shared = self
            .current_ratchet
            .ephemeral_key_pair
            .private_key
            .calculate_agreement(remote_key);
        let mut derived = crypto::derive_secrets(
            shared.as_bytes(),
            self.current_ratchet.root_key.as_bytes(),
            crypto::WHISPER_RATCHET_INFO,
            2,
        )?;
        let chain_key = derived.pop().expect("two chunks requested");
        let root_key = derived.pop().expect("two chunks requested");

        let key = match chain_type {
            ChainType::Sending => self.current_ratchet.ephemeral_key_pair.public_key,
            ChainType::Receiving => *remote_key,
        };
        self.add_chain(key, Chain::new(chain_key, chain_type))?;
        self.current_ratchet.root_key = root_key;
        Ok(())
    }

    /// True once the session has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.index_info.closed != -1
    }

    /// Closes the session; re-closing only warns.
    pub fn close(&mut self) {
        if self.is_closed() {
            warn!(closed_at = self.index_info.closed, "session already closed");
            return;
        }
        self.index_info.closed = now_ms();
    }

    /// Reopens a closed session.
    pub fn mark_open(&mut self) {
        self.index_info.closed = -1;
    }

    /// Serializes to the persisted JSON tree: byte fields base64, the
    /// chain map keyed by base64 ephemeral key.
    #[must_use]
    pub fn serialize(&self) -> serde_json::Value {
        serde_json::to_value(self.to_data()).expect("session data serializes")
    }

    /// Rebuilds a session from its persisted tree, validating required
    /// fields and byte lengths and applying defaults for absent
    /// lifecycle fields.
    pub fn deserialize(value: &serde_json::Value) -> Result<Self> {
        let data: SessionData = serde_json::from_value(value.clone())
            .map_err(|e| Error::Session(format!("invalid session data: {e}")))?;
        Self::from_data(data)
    }

    fn to_data(&self) -> SessionData {
        let ratchet = &self.current_ratchet;
        SessionData {
            registration_id: self.registration_id,
            current_ratchet: RatchetData {
                ephemeral_key_pair: KeyPairData {
                    pub_key: BASE64.encode(ratchet.ephemeral_key_pair.public_key.serialize()),
                    priv_key: BASE64.encode(ratchet.ephemeral_key_pair.private_key.to_bytes()),
                },
                last_remote_ephemeral_key: BASE64
                    .encode(ratchet.last_remote_ephemeral_key.serialize()),
                previous_counter: Some(ratchet.previous_counter),
                root_key: BASE64.encode(ratchet.root_key.as_bytes()),
            },
            index_info: IndexInfoData {
                base_key: BASE64.encode(self.index_info.base_key.serialize()),
                base_key_type: self.index_info.base_key_type as u8,
                remote_identity_key: BASE64.encode(self.index_info.remote_identity_key.serialize()),
                created: Some(self.index_info.created),
                used: Some(self.index_info.used),
                closed: Some(self.index_info.closed),
            },
            chains: self
                .chains
                .iter()
                .map(|(key, chain)| {
                    (
                        BASE64.encode(key.serialize()),
                        ChainData {
                            chain_key: ChainKeyData {
                                counter: chain.chain_key.counter,
                                key: chain
                                    .chain_key
                                    .key
                                    .as_ref()
                                    .map(|k| BASE64.encode(k.as_bytes())),
                            },
                            chain_type: chain.chain_type as u8,
                            message_keys: chain
                                .message_keys
                                .iter()
                                .map(|(counter, key)| {
                                    (counter.to_string(), BASE64.encode(key.as_bytes()))
                                })
                                .collect(),
                        },
                    )
                })
                .collect(),
            pending_pre_key: self.pending_pre_key.as_ref().map(|p| PendingPreKeyData {
                signed_key_id: p.signed_key_id,
                base_key: BASE64.encode(p.base_key.serialize()),
                pre_key_id: p.pre_key_id,
            }),
        }
    }

    fn from_data(data: SessionData) -> Result<Self> {
        let ratchet = data.current_ratchet;
        let current_ratchet = CurrentRatchet {
            ephemeral_key_pair: KeyPair {
                public_key: decode_public_key(&ratchet.ephemeral_key_pair.pub_key, "pub_key")?,
                private_key: SecretKey::from_bytes(decode_key32(
                    &ratchet.ephemeral_key_pair.priv_key,
                    "priv_key",
                )?),
            },
            last_remote_ephemeral_key: decode_public_key(
                &ratchet.last_remote_ephemeral_key,
                "last_remote_ephemeral_key",
            )?,
            previous_counter: ratchet.previous_counter.unwrap_or(0),
            root_key: SymmetricKey::from_bytes(decode_key32(&ratchet.root_key, "root_key")?),
        };

        let index = data.index_info;
        let index_info = IndexInfo {
            base_key: decode_public_key(&index.base_key, "base_key")?,
            base_key_type: match index.base_key_type {
                1 => BaseKeyType::Ours,
                2 => BaseKeyType::Theirs,
                other => {
                    return Err(Error::Session(format!("invalid base key type: {other}")));
                }
            },
            remote_identity_key: decode_public_key(
                &index.remote_identity_key,
                "remote_identity_key",
            )?,
            created: index.created.unwrap_or_else(now_ms),
            used: index.used.unwrap_or_else(now_ms),
            closed: index.closed.unwrap_or(-1),
        };

        let mut chains = HashMap::new();
        for (encoded_key, chain_data) in data.chains {
            let key = decode_public_key(&encoded_key, "chain key")?;
            let mut message_keys = HashMap::new();
            for (counter, encoded) in chain_data.message_keys {
                let counter: u32 = counter.parse().map_err(|_| {
                    Error::Session(format!("invalid message key counter: {counter}"))
                })?;
                message_keys.insert(
                    counter,
                    SymmetricKey::from_bytes(decode_key32(&encoded, "message key")?),
                );
            }
            chains.insert(
                key,
                Chain {
                    chain_key: ChainKey {
                        counter: chain_data.chain_key.counter,
                        key: chain_data
                            .chain_key
                            .key
                            .as_deref()
                            .map(|k| decode_key32(k, "chain key").map(SymmetricKey::from_bytes))
                            .transpose()?,
                    },
                    chain_type: match chain_data.chain_type {
                        1 => ChainType::Sending,
                        2 => ChainType::Receiving,
                        other => {
                            return Err(Error::Session(format!("invalid chain type: {other}")));
                        }
                    },
                    message_keys,
                },
            );
        }

        let pending_pre_key = data
            .pending_pre_key
            .map(|p| {
                Ok::<_, Error>(PendingPreKey {
                    signed_key_id: p.signed_key_id,
                    base_key: decode_public_key(&p.base_key, "pending base_key")?,
                    pre_key_id: p.pre_key_id,
                })
            })
            .transpose()?;

        Ok(Self {
            registration_id: data.registration_id,
            current_ratchet,
            index_info,
            pending_pre_key,
            chains,
        })
    }
}

fn decode_exact(encoded: &str, expected: usize, field: &str) -> Result<Vec<u8>> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|_| Error::Session(format!("invalid base64 in session field {field}")))?;
    if bytes.len() != expected {
        return Err(Error::Session(format!(
            "session field {field} has length {}, expected {expected}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn decode_public_key(encoded: &str, field: &str) -> Result<PublicKey> {
    PublicKey::from_slice(&decode_exact(encoded, PUBLIC_KEY_SIZE, field)?)
        .map_err(|e| Error::Session(format!("session field {field}: {e}")))
}

fn decode_key32(encoded: &str, field: &str) -> Result<[u8; KEY_SIZE]> {
    Ok(decode_exact(encoded, KEY_SIZE, field)?
        .try_into()
        .expect("length checked above"))
}

#[derive(Serialize, Deserialize)]
struct SessionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    registration_id: Option<u32>,
    current_ratchet: RatchetData,
    index_info: IndexInfoData,
    chains: BTreeMap<String, ChainData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pending_pre_key: Option<PendingPreKeyData>,
}

#[derive(Serialize, Deserialize)]
struct KeyPairData {
    pub_key: String,
    priv_key: String,
}

#[derive(Serialize, Deserialize)]
struct RatchetData {
    ephemeral_key_pair: KeyPairData,
    last_remote_ephemeral_key: String,
    #[serde(default)]
    previous_counter: Option<u32>,
    root_key: String,
}

#[derive(Serialize, Deserialize)]
struct IndexInfoData {
    base_key: String,
    base_key_type: u8,
    remote_identity_key: String,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    used: Option<i64>,
    #[serde(default)]
    closed: Option<i64>,
}

#[derive(Serialize, Deserialize)]
struct ChainKeyData {
    counter: i32,
    key: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ChainData {
    chain_key: ChainKeyData,
    chain_type: u8,
    message_keys: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct PendingPreKeyData {
    signed_key_id: u32,
    base_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pre_key_id: Option<u32>,
}
