//! Message encryption and decryption over an established session,
//! including the DH ratchet stepping and trial decryption across a
//! peer's session record.

use crate::address::ProtocolAddress;
use crate::builder::SessionBuilder;
use crate::crypto::{self, MAC_SIZE};
use crate::error::{Error, Result};
use crate::keys::{KeyPair, PublicKey};
use crate::queue;
use crate::record::SessionRecord;
use crate::session::{now_ms, ChainType, SessionEntry};
use crate::storage::ProtocolStore;
use crate::wire::{self, PreKeyWhisperMessage, WhisperMessage};

use prost::Message as _;
use rand_core::OsRng;
use std::sync::Arc;
use tracing::{debug, warn};
use zeroize::Zeroize;

/// Output of [`SessionCipher::encrypt`]
#[derive(Clone, Debug)]
pub struct EncryptedMessage {
    /// [`crate::wire::WHISPER_MESSAGE_TYPE`] for an established
    /// session, [`crate::wire::PREKEY_MESSAGE_TYPE`] while the
    /// handshake is still unacknowledged
    pub message_type: u8,
    /// Complete envelope bytes
    pub body: Vec<u8>,
    /// Peer device registration id, when the session knows it
    pub registration_id: Option<u32>,
}

/// Encrypts and decrypts messages for one peer device.
///
/// Every public method runs as a job on the peer's queue, so all
/// mutations of that peer's record are strictly serialized.
#[derive(Clone)]
pub struct SessionCipher {
    storage: Arc<dyn ProtocolStore>,
    address: ProtocolAddress,
    builder: SessionBuilder,
}

impl SessionCipher {
    /// Creates a cipher for the given peer.
    #[must_use]
    pub fn new(storage: Arc<dyn ProtocolStore>, address: ProtocolAddress) -> Self {
        let builder = SessionBuilder::new(storage.clone(), address.clone());
        Self {
            storage,
            address,
            builder,
        }
    }

    /// Encrypts `plaintext` on the open session, advancing the sending
    /// chain by one message key.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedMessage> {
        let this = self.clone();
        let data = plaintext.to_vec();
        queue::run(&self.address.to_string(), async move {
            this.run_encrypt(data).await
        })
        .await
    }

    /// Decrypts a ratchet message by trial over the peer's sessions,
    /// most recently used first.
    pub async fn decrypt_whisper_message(&self, body: &[u8]) -> Result<Vec<u8>> {
        let this = self.clone();
        let data = body.to_vec();
        queue::run(&self.address.to_string(), async move {
            this.run_decrypt_whisper(data).await
        })
        .await
    }

    /// Decrypts a pre-key message, building the responder session
    /// first if this handshake has not been processed yet.
    pub async fn decrypt_pre_key_whisper_message(&self, body: &[u8]) -> Result<Vec<u8>> {
        let this = self.clone();
        let data = body.to_vec();
        queue::run(&self.address.to_string(), async move {
            this.run_decrypt_pre_key(data).await
        })
        .await
    }

    /// True when the peer's record holds an open session.
    pub async fn has_open_session(&self) -> Result<bool> {
        let this = self.clone();
        queue::run(&self.address.to_string(), async move {
            let record = this.storage.load_session(&this.address.to_string()).await?;
            Ok(record.is_some_and(|r| r.get_open_session().is_some()))
        })
        .await
    }

    /// Closes the open session, if any.
    pub async fn close_open_session(&self) -> Result<()> {
        let this = self.clone();
        queue::run(&self.address.to_string(), async move {
            let fq_addr = this.address.to_string();
            if let Some(mut record) = this.storage.load_session(&fq_addr).await? {
                record.close_open_session();
                this.storage.store_session(&fq_addr, &record).await?;
            }
            Ok(())
        })
        .await
    }

    async fn run_encrypt(&self, data: Vec<u8>) -> Result<EncryptedMessage> {
        let fq_addr = self.address.to_string();
        let our_identity = self.storage.get_our_identity().await?;
        let our_registration_id = self.storage.get_our_registration_id().await?;
        let mut record = self
            .storage
            .load_session(&fq_addr)
            .await?
            .ok_or_else(|| Error::Session("no sessions for address".into()))?;

        let remote_identity = record
            .get_open_session()
            .ok_or_else(|| Error::Session("no open session".into()))?
            .index_info
            .remote_identity_key;
        if !self
            .storage
            .is_trusted_identity(self.address.name(), &remote_identity)
            .await?
        {
            return Err(Error::UntrustedIdentity {
                addr: self.address.name().to_string(),
                identity_key: remote_identity.serialize().to_vec(),
            });
        }

        let session = record
            .get_open_session_mut()
            .ok_or_else(|| Error::Session("no open session".into()))?;
        let ratchet_key = session.current_ratchet.ephemeral_key_pair.public_key;
        let previous_counter = session.current_ratchet.previous_counter;
        let registration_id = session.registration_id;
        let pending = session.pending_pre_key.clone();

        let chain = session
            .get_chain_mut(&ratchet_key)
            .ok_or_else(|| Error::Session("missing sending chain".into()))?;
        if chain.chain_type != ChainType::Sending {
            return Err(Error::InvalidArgument(
                "tried to encrypt on a receiving chain".into(),
            ));
        }
        let next = chain.chain_key.counter + 1;
        chain.fill_message_keys(next)?;
        let counter = u32::try_from(chain.chain_key.counter)
            .map_err(|_| Error::Session("sending chain counter out of range".into()))?;
        let message_key = chain
            .message_keys
            .remove(&counter)
            .ok_or_else(|| Error::Session("sending chain yielded no message key".into()))?;
        let keys = crypto::expand_message_keys(&message_key)?;

        let message = WhisperMessage {
            ephemeral_key: Some(ratchet_key.serialize().to_vec()),
            counter: Some(counter),
            previous_counter: Some(previous_counter),
            ciphertext: Some(crypto::aes_cbc_encrypt(keys.cipher_key(), keys.iv(), &data)),
        };
        let wire_bytes = message.encode_to_vec();

        let mut mac_input = Vec::with_capacity(2 * 33 + 1 + wire_bytes.len());
        mac_input.extend_from_slice(our_identity.public_key.serialize());
        mac_input.extend_from_slice(remote_identity.serialize());
        mac_input.push(wire::version_byte());
        mac_input.extend_from_slice(&wire_bytes);
        let mut mac = crypto::hmac_sha256(keys.mac_key(), &mac_input);

        let mut envelope = Vec::with_capacity(1 + wire_bytes.len() + MAC_SIZE);
        envelope.push(wire::version_byte());
        envelope.extend_from_slice(&wire_bytes);
        envelope.extend_from_slice(&mac[..MAC_SIZE]);
        mac.zeroize();

        let (message_type, body) = if let Some(pending) = pending {
            let pre_key_message = PreKeyWhisperMessage {
                registration_id: Some(our_registration_id),
                pre_key_id: pending.pre_key_id,
                signed_pre_key_id: Some(pending.signed_key_id),
                base_key: Some(pending.base_key.serialize().to_vec()),
                identity_key: Some(our_identity.public_key.serialize().to_vec()),
                message: Some(envelope),
            };
            let mut body = Vec::with_capacity(1 + pre_key_message.encoded_len());
            body.push(wire::version_byte());
            body.extend_from_slice(&pre_key_message.encode_to_vec());
            (wire::PREKEY_MESSAGE_TYPE, body)
        } else {
            (wire::WHISPER_MESSAGE_TYPE, envelope)
        };

        self.storage.store_session(&fq_addr, &record).await?;
        Ok(EncryptedMessage {
            message_type,
            body,
            registration_id,
        })
    }

    async fn run_decrypt_whisper(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let fq_addr = self.address.to_string();
        let our_identity = self.storage.get_our_identity().await?;
        let mut record = self
            .storage
            .load_session(&fq_addr)
            .await?
            .ok_or_else(|| Error::Session("no session record for address".into()))?;

        let (index, plaintext) = Self::decrypt_with_sessions(&mut record, &our_identity, &data)?;

        let session = record.session_at(index);
        let remote_identity = session.index_info.remote_identity_key;
        let decrypted_on_closed = session.is_closed();
        // Trust is re-checked after decryption so a revoked identity
        // surfaces even when the ciphertext itself was valid.
        if !self
            .storage
            .is_trusted_identity(self.address.name(), &remote_identity)
            .await?
        {
            return Err(Error::UntrustedIdentity {
                addr: self.address.name().to_string(),
                identity_key: remote_identity.serialize().to_vec(),
            });
        }
        if decrypted_on_closed {
            warn!(address = %fq_addr, "decrypted message on a closed session");
        }
        self.storage.store_session(&fq_addr, &record).await?;
        Ok(plaintext)
    }

    async fn run_decrypt_pre_key(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        if data.len() < wire::MIN_PREKEY_MESSAGE_SIZE {
            return Err(Error::InvalidArgument(format!(
                "pre-key message too short: {} bytes",
                data.len()
            )));
        }
        wire::check_version_byte(data[0])?;
        let message = PreKeyWhisperMessage::decode(&data[1..])?;
        let base_key = PublicKey::from_slice(message.base_key.as_deref().ok_or_else(|| {
            Error::InvalidArgument("pre-key message missing base key".into())
        })?)?;
        if message.identity_key.is_none() {
            return Err(Error::InvalidArgument(
                "pre-key message missing identity key".into(),
            ));
        }
        let envelope = message.message.clone().ok_or_else(|| {
            Error::InvalidArgument("pre-key message missing inner message".into())
        })?;

        let fq_addr = self.address.to_string();
        let our_identity = self.storage.get_our_identity().await?;
        let mut record = match self.storage.load_session(&fq_addr).await? {
            Some(record) => record,
            None => {
                if message.registration_id.is_none() {
                    return Err(Error::InvalidArgument(
                        "pre-key message missing registration id".into(),
                    ));
                }
                SessionRecord::new()
            }
        };

        let consumed_pre_key = self.builder.init_incoming(&mut record, &message).await?;
        let session = record
            .get_session_mut(&base_key)?
            .ok_or_else(|| Error::Session("no session for handshake base key".into()))?;
        let plaintext = Self::do_decrypt(session, &our_identity, &envelope)?;
        session.index_info.used = now_ms();

        self.storage.store_session(&fq_addr, &record).await?;
        if let Some(pre_key_id) = consumed_pre_key {
            self.storage.remove_pre_key(pre_key_id).await?;
        }
        Ok(plaintext)
    }

    /// Tries each session in most-recently-used order. Failed attempts
    /// run against a copy so they cannot disturb state the matching
    /// session later needs; the winning copy is committed back.
    fn decrypt_with_sessions(
        record: &mut SessionRecord,
        our_identity: &KeyPair,
        data: &[u8],
    ) -> Result<(usize, Vec<u8>)> {
        let order = record.recency_order();
        if order.is_empty() {
            return Err(Error::Session("no sessions available".into()));
        }
        let candidates = order.len();
        let mut last_error = None;
        for index in order {
            let mut candidate = record.session_at(index).clone();
            match Self::do_decrypt(&mut candidate, our_identity, data) {
                Ok(plaintext) => {
                    candidate.index_info.used = now_ms();
                    *record.session_at_mut(index) = candidate;
                    return Ok((index, plaintext));
                }
                Err(err) if err.is_session_kind() => last_error = Some(err),
                // Message-level failures are identical for every
                // session; no point trying the rest.
                Err(err) => return Err(err),
            }
        }
        if candidates == 1 {
            // A single candidate cannot reveal which key material was
            // present; surface the specific failure so duplicate
            // delivery shows up as a counter error.
            return Err(last_error.expect("the only candidate recorded an error"));
        }
        debug!(candidates, "trial decryption failed for every session");
        Err(Error::Session("no matching sessions".into()))
    }

    fn do_decrypt(
        session: &mut SessionEntry,
        our_identity: &KeyPair,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let (wire_bytes, received_mac) = wire::split_whisper_envelope(data)?;
        let message = WhisperMessage::decode(wire_bytes)?;
        let ephemeral_key = PublicKey::from_slice(message.ephemeral_key.as_deref().ok_or_else(
            || Error::Session("message missing ephemeral key".into()),
        )?)?;
        let counter = message
            .counter
            .ok_or_else(|| Error::Session("message missing counter".into()))?;
        let previous_counter = message
            .previous_counter
            .ok_or_else(|| Error::Session("message missing previous counter".into()))?;
        let ciphertext = message
            .ciphertext
            .as_deref()
            .ok_or_else(|| Error::Session("message missing ciphertext".into()))?;

        Self::maybe_step_ratchet(session, ephemeral_key, previous_counter)?;

        let remote_identity = session.index_info.remote_identity_key;
        let chain = session
            .get_chain_mut(&ephemeral_key)
            .ok_or_else(|| Error::Session("no chain for ratchet key".into()))?;
        if chain.chain_type != ChainType::Receiving {
            return Err(Error::InvalidArgument(
                "tried to decrypt on a sending chain".into(),
            ));
        }
        chain.fill_message_keys(
            i32::try_from(counter).map_err(|_| Error::Session("counter out of range".into()))?,
        )?;
        let message_key = chain.message_keys.remove(&counter).ok_or_else(|| {
            Error::MessageCounter("message key used already or never filled".into())
        })?;
        let keys = crypto::expand_message_keys(&message_key)?;

        let mut mac_input = Vec::with_capacity(2 * 33 + 1 + wire_bytes.len());
        mac_input.extend_from_slice(remote_identity.serialize());
        mac_input.extend_from_slice(our_identity.public_key.serialize());
        mac_input.push(wire::version_byte());
        mac_input.extend_from_slice(wire_bytes);
        let verified = crypto::verify_mac(&mac_input, keys.mac_key(), received_mac, MAC_SIZE);
        mac_input.zeroize();
        verified?;

        let plaintext = crypto::aes_cbc_decrypt(keys.cipher_key(), keys.iv(), ciphertext)?;

        // Any successful chain decrypt proves the handshake completed.
        session.pending_pre_key = None;
        Ok(plaintext)
    }

    /// Steps the DH ratchet when a message arrives under an unseen
    /// remote ratchet key: the previous receiving chain is topped up to
    /// the peer's final counter and closed, new receiving and sending
    /// chains are derived, and our ratchet key rotates.
    fn maybe_step_ratchet(
        session: &mut SessionEntry,
        remote_key: PublicKey,
        previous_counter: u32,
    ) -> Result<()> {
        if session.get_chain(&remote_key).is_some() {
            return Ok(());
        }
        debug!("stepping DH ratchet for new remote ephemeral key");

        let last_remote = session.current_ratchet.last_remote_ephemeral_key;
        if let Some(previous_chain) = session.get_chain_mut(&last_remote) {
            let final_counter = i32::try_from(previous_counter)
                .map_err(|_| Error::Session("previous counter out of range".into()))?;
            previous_chain.fill_message_keys(final_counter)?;
            // Close the chain; its skipped keys stay consumable.
            previous_chain.chain_key.key = None;
        }

        session.calculate_ratchet(&remote_key, ChainType::Receiving)?;

        let our_ratchet_key = session.current_ratchet.ephemeral_key_pair.public_key;
        let final_send_counter = session
            .get_chain(&our_ratchet_key)
            .map(|chain| chain.chain_key.counter);
        if let Some(final_counter) = final_send_counter {
            // A never-used chain sits at -1; record it as 0.
            session.current_ratchet.previous_counter =
                u32::try_from(final_counter).unwrap_or(0);
            session.delete_chain(&our_ratchet_key)?;
        }

        session.current_ratchet.ephemeral_key_pair = KeyPair::generate(&mut OsRng);
        session.calculate_ratchet(&remote_key, ChainType::Sending)?;
        session.current_ratchet.last_remote_ephemeral_key = remote_key;
        Ok(())
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
