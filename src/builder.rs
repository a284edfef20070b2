//! Session establishment: the initiator path from a published pre-key
//! bundle and the responder path from a received pre-key message, both
//! feeding the mixed Diffie-Hellman derivation that seeds the ratchet.

use crate::address::ProtocolAddress;
use crate::crypto;
use crate::error::{Error, Result};
use crate::keys::{KeyPair, PublicKey};
use crate::queue;
use crate::record::SessionRecord;
use crate::session::{
    now_ms, BaseKeyType, ChainType, CurrentRatchet, IndexInfo, PendingPreKey, SessionEntry,
};
use crate::storage::ProtocolStore;
use crate::wire::PreKeyWhisperMessage;
use crate::xeddsa;

use rand_core::OsRng;
use std::sync::Arc;
use zeroize::Zeroizing;

/// A peer's published one-time pre-key
#[derive(Clone, Debug)]
pub struct OneTimePreKey {
    /// Pre-key id
    pub key_id: u32,
    /// Pre-key public half
    pub public_key: PublicKey,
}

/// A peer's published signed pre-key
#[derive(Clone, Debug)]
pub struct SignedPreKey {
    /// Signed pre-key id
    pub key_id: u32,
    /// Signed pre-key public half
    pub public_key: PublicKey,
    /// XEdDSA signature by the peer's identity key over `public_key`
    pub signature: [u8; 64],
}

/// Everything a peer publishes so sessions can be initiated while it
/// is offline
#[derive(Clone, Debug)]
pub struct PreKeyBundle {
    /// Peer identity key
    pub identity_key: PublicKey,
    /// Peer device registration id
    pub registration_id: u32,
    /// Optional one-time pre-key
    pub pre_key: Option<OneTimePreKey>,
    /// Signed pre-key
    pub signed_pre_key: SignedPreKey,
}

/// Builds sessions with one peer device.
#[derive(Clone)]
pub struct SessionBuilder {
    storage: Arc<dyn ProtocolStore>,
    address: ProtocolAddress,
    accept_unverified_pre_keys: bool,
}

impl SessionBuilder {
    /// Creates a builder for the given peer.
    #[must_use]
    pub fn new(storage: Arc<dyn ProtocolStore>, address: ProtocolAddress) -> Self {
        Self {
            storage,
            address,
            accept_unverified_pre_keys: false,
        }
    }

    /// Disables signed pre-key signature verification.
    ///
    /// Only for tests and fixtures that fabricate bundles without a
    /// valid signature. Production callers must never use this: an
    /// unverified signed pre-key lets an attacker who controls the
    /// bundle channel substitute their own key.
    #[must_use]
    pub fn dangerously_accept_unverified_pre_keys(mut self) -> Self {
        self.accept_unverified_pre_keys = true;
        self
    }

    /// Initiates a session from the peer's pre-key bundle and stores
    /// the resulting record. Runs under the peer's queue.
    pub async fn init_outgoing(&self, device: PreKeyBundle) -> Result<()> {
        let this = self.clone();
        queue::run(&self.address.to_string(), async move {
            this.run_init_outgoing(device).await
        })
        .await
    }

    async fn run_init_outgoing(&self, device: PreKeyBundle) -> Result<()> {
        let fq_addr = self.address.to_string();
        if !self
            .storage
            .is_trusted_identity(self.address.name(), &device.identity_key)
            .await?
        {
            return Err(Error::UntrustedIdentity {
                addr: self.address.name().to_string(),
                identity_key: device.identity_key.serialize().to_vec(),
            });
        }

        if !self.accept_unverified_pre_keys
            && !xeddsa::verify(
                &device.identity_key,
                device.signed_pre_key.public_key.serialize(),
                &device.signed_pre_key.signature,
            )
        {
            return Err(Error::PreKey(
                "signed pre-key signature verification failed".into(),
            ));
        }

        let base_key = KeyPair::generate(&mut OsRng);
        let mut session = self
            .init_session(
                true,
                Some(&base_key),
                None,
                device.identity_key,
                device.pre_key.as_ref().map(|p| p.public_key),
                Some(device.signed_pre_key.public_key),
                Some(device.registration_id),
            )
            .await?;
        session.pending_pre_key = Some(PendingPreKey {
            signed_key_id: device.signed_pre_key.key_id,
            base_key: base_key.public_key,
            pre_key_id: device.pre_key.as_ref().map(|p| p.key_id),
        });

        let mut record = self
            .storage
            .load_session(&fq_addr)
            .await?
            .unwrap_or_default();
        record.close_open_session();
        record.set_session(session);
        self.storage.store_session(&fq_addr, &record).await
    }

    /// Responder path: builds a session from a received pre-key
    /// message and inserts it into `record`. Returns the consumed
    /// one-time pre-key id, or `None` when the message re-delivers a
    /// handshake this record already processed.
    ///
    /// The caller is responsible for running this under the peer's
    /// serialized context; [`crate::cipher::SessionCipher`] invokes it
    /// from inside its own queued job.
    pub async fn init_incoming(
        &self,
        record: &mut SessionRecord,
        message: &PreKeyWhisperMessage,
    ) -> Result<Option<u32>> {
        let identity_key = PublicKey::from_slice(
            message
                .identity_key
                .as_deref()
                .ok_or_else(|| Error::InvalidArgument("pre-key message missing identity key".into()))?,
        )?;
        let base_key = PublicKey::from_slice(
            message
                .base_key
                .as_deref()
                .ok_or_else(|| Error::InvalidArgument("pre-key message missing base key".into()))?,
        )?;

        if !self
            .storage
            .is_trusted_identity(self.address.name(), &identity_key)
            .await?
        {
            return Err(Error::UntrustedIdentity {
                addr: self.address.name().to_string(),
                identity_key: identity_key.serialize().to_vec(),
            });
        }

        // A session for this base key means this handshake was already
        // processed; a retransmitted pre-key message changes nothing.
        if record.get_session(&base_key)?.is_some() {
            return Ok(None);
        }

        let pre_key_pair = match message.pre_key_id {
            Some(id) => Some(self.storage.load_pre_key(id).await?.ok_or_else(|| {
                Error::PreKey(format!("message names pre-key {id} but it is not in storage"))
            })?),
            None => None,
        };
        let signed_pre_key_id = message.signed_pre_key_id.ok_or_else(|| {
            Error::InvalidArgument("pre-key message missing signed pre-key id".into())
        })?;
        let signed_pre_key_pair = self
            .storage
            .load_signed_pre_key(signed_pre_key_id)
            .await?
            .ok_or_else(|| {
                Error::PreKey(format!("no signed pre-key with id {signed_pre_key_id}"))
            })?;

        record.close_open_session();
        let session = self
            .init_session(
                false,
                pre_key_pair.as_ref(),
                Some(&signed_pre_key_pair),
                identity_key,
                Some(base_key),
                None,
                message.registration_id,
            )
            .await?;
        record.set_session(session);
        Ok(message.pre_key_id)
    }

    /// Derives the initial root key from the agreement cascade and
    /// assembles the session state. The initiator additionally seeds
    /// its first sending chain against the peer's signed pre-key.
    #[allow(clippy::too_many_arguments)]
    async fn init_session(
        &self,
        is_initiator: bool,
        our_ephemeral: Option<&KeyPair>,
        our_signed: Option<&KeyPair>,
        their_identity: PublicKey,
        their_ephemeral: Option<PublicKey>,
        their_signed: Option<PublicKey>,
        registration_id: Option<u32>,
    ) -> Result<SessionEntry> {
        if is_initiator && our_signed.is_some() {
            return Err(Error::InvalidArgument(
                "initiator must not supply its own signed key".into(),
            ));
        }
        if !is_initiator && their_signed.is_some() {
            return Err(Error::InvalidArgument(
                "responder must not supply a remote signed key".into(),
            ));
        }
        // The initiator's base key stands in for its signed key; the
        // responder sees that base key as the remote signed key.
        let our_signed = match our_signed {
            Some(pair) => pair,
            None => our_ephemeral.ok_or_else(|| {
                Error::InvalidArgument("initiator requires an ephemeral base key".into())
            })?,
        };
        let their_signed = match their_signed {
            Some(key) => key,
            None => their_ephemeral.ok_or_else(|| {
                Error::InvalidArgument("responder requires the remote base key".into())
            })?,
        };

        let our_identity = self.storage.get_our_identity().await?;

        let a1 = our_identity.private_key.calculate_agreement(&their_signed);
        let a2 = our_signed.private_key.calculate_agreement(&their_identity);
        let a3 = our_signed.private_key.calculate_agreement(&their_signed);

        let mut shared_secret = Zeroizing::new(Vec::with_capacity(32 * 5));
        shared_secret.extend_from_slice(&[0xffu8; 32]);
        if is_initiator {
            shared_secret.extend_from_slice(a1.as_bytes());
            shared_secret.extend_from_slice(a2.as_bytes());
        } else {
            shared_secret.extend_from_slice(a2.as_bytes());
            shared_secret.extend_from_slice(a1.as_bytes());
        }
        shared_secret.extend_from_slice(a3.as_bytes());
        // Both endpoints contributed an ephemeral only on the one-time
        // pre-key path.
        if let (Some(our_eph), Some(their_eph)) = (our_ephemeral, their_ephemeral) {
            let a4 = our_eph.private_key.calculate_agreement(&their_eph);
            shared_secret.extend_from_slice(a4.as_bytes());
        }

        let mut master = crypto::derive_secrets(
            &shared_secret,
            &[0u8; 32],
            crypto::WHISPER_TEXT_INFO,
            2,
        )?;
        drop(master.pop());
        let root_key = master.pop().expect("two chunks requested");

        let ephemeral_key_pair = if is_initiator {
            KeyPair::generate(&mut OsRng)
        } else {
            our_signed.clone()
        };
        let base_key = if is_initiator {
            our_signed.public_key
        } else {
            their_signed
        };
        let now = now_ms();
        let mut session = SessionEntry::new(
            registration_id,
            CurrentRatchet {
                ephemeral_key_pair,
                last_remote_ephemeral_key: their_signed,
                previous_counter: 0,
                root_key,
            },
            IndexInfo {
                base_key,
                base_key_type: if is_initiator {
                    BaseKeyType::Ours
                } else {
                    BaseKeyType::Theirs
                },
                remote_identity_key: their_identity,
                created: now,
                used: now,
                closed: -1,
            },
        );

        if is_initiator {
            session.calculate_ratchet(&their_signed, ChainType::Sending)?;
        }
        Ok(session)
    }
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
