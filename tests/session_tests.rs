//! End-to-end session tests: handshake, message exchange, ratchet
//! stepping, trust gating, retention and per-peer serialization.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use prost::Message as _;
use rand_core::{OsRng, RngCore};
use whisper_ratchet::wire::{self, WhisperMessage, PREKEY_MESSAGE_TYPE, WHISPER_MESSAGE_TYPE};
use whisper_ratchet::{
    generate_registration_id, xeddsa, Error, InMemoryStore, KeyPair, OneTimePreKey,
    PreKeyBundle, ProtocolAddress, ProtocolStore, SessionBuilder, SessionCipher, SignedPreKey,
};

static DEVICE_SEQ: AtomicUsize = AtomicUsize::new(0);

/// One device with its own identity and store. Names are unique per
/// test so peers in concurrently running tests never share a queue
/// bucket or storage key.
struct Device {
    name: String,
    identity: KeyPair,
    registration_id: u32,
    store: InMemoryStore,
}

impl Device {
    fn new(label: &str) -> Self {
        let name = format!("{label}-{}", DEVICE_SEQ.fetch_add(1, Ordering::Relaxed));
        let identity = KeyPair::generate(&mut OsRng);
        let registration_id = generate_registration_id(&mut OsRng);
        let store = InMemoryStore::new(identity.clone(), registration_id);
        Self {
            name,
            identity,
            registration_id,
            store,
        }
    }

    fn storage(&self) -> Arc<InMemoryStore> {
        Arc::new(self.store.clone())
    }

    fn address(&self) -> ProtocolAddress {
        ProtocolAddress::new(self.name.clone(), 1).unwrap()
    }

    /// Fully qualified address used as the storage key.
    fn fq(&self) -> String {
        format!("{}.1", self.name)
    }

    fn builder_for(&self, peer: &Device) -> SessionBuilder {
        SessionBuilder::new(self.storage(), peer.address())
    }

    fn cipher_for(&self, peer: &Device) -> SessionCipher {
        SessionCipher::new(self.storage(), peer.address())
    }

    /// Publishes a signed pre-key (and optionally a one-time pre-key)
    /// and returns the bundle a peer would fetch.
    fn publish_bundle(&self, signed_id: u32, pre_key_id: Option<u32>) -> PreKeyBundle {
        let signed = KeyPair::generate(&mut OsRng);
        let mut random = [0u8; 64];
        OsRng.fill_bytes(&mut random);
        let signature = xeddsa::sign(
            &self.identity.private_key,
            signed.public_key.serialize(),
            &random,
        );
        self.store.add_signed_pre_key(signed_id, signed.clone()).unwrap();

        let pre_key = pre_key_id.map(|id| {
            let pair = KeyPair::generate(&mut OsRng);
            self.store.add_pre_key(id, pair.clone()).unwrap();
            OneTimePreKey {
                key_id: id,
                public_key: pair.public_key,
            }
        });

        PreKeyBundle {
            identity_key: self.identity.public_key,
            registration_id: self.registration_id,
            pre_key,
            signed_pre_key: SignedPreKey {
                key_id: signed_id,
                public_key: signed.public_key,
                signature,
            },
        }
    }
}

/// Runs the full first round: Alice initiates against Bob's bundle,
/// Bob decrypts her pre-key message and replies, and Alice decrypts
/// the reply. That clears Alice's pending handshake material, so every
/// message the test sends afterwards is a plain ratchet message.
async fn establish(alice: &Device, bob: &Device) -> (SessionCipher, SessionCipher) {
    let bundle = bob.publish_bundle(42, Some(7));
    alice.builder_for(bob).init_outgoing(bundle).await.unwrap();

    let alice_cipher = alice.cipher_for(bob);
    let bob_cipher = bob.cipher_for(alice);

    let first = alice_cipher.encrypt(b"hello").await.unwrap();
    let plaintext = bob_cipher
        .decrypt_pre_key_whisper_message(&first.body)
        .await
        .unwrap();
    assert_eq!(plaintext, b"hello");

    let reply = bob_cipher.encrypt(b"hello yourself").await.unwrap();
    let plaintext = alice_cipher.decrypt_whisper_message(&reply.body).await.unwrap();
    assert_eq!(plaintext, b"hello yourself");

    (alice_cipher, bob_cipher)
}

fn wire_counter(body: &[u8]) -> u32 {
    let message = WhisperMessage::decode(&body[1..body.len() - 8]).unwrap();
    message.counter.unwrap()
}

#[tokio::test]
async fn test_handshake_then_first_message() {
    let alice = Device::new("alice");
    let bob = Device::new("bob");

    let bundle = bob.publish_bundle(42, Some(7));
    alice.builder_for(&bob).init_outgoing(bundle).await.unwrap();

    let message = alice.cipher_for(&bob).encrypt(b"hi").await.unwrap();
    assert_eq!(message.message_type, PREKEY_MESSAGE_TYPE);
    assert_eq!(message.body[0], 0x33);
    assert_eq!(message.registration_id, Some(bob.registration_id));

    let plaintext = bob
        .cipher_for(&alice)
        .decrypt_pre_key_whisper_message(&message.body)
        .await
        .unwrap();
    assert_eq!(plaintext, b"hi");

    // The consumed one-time pre-key is gone.
    assert!(bob.store.load_pre_key(7).await.unwrap().is_none());
}

#[tokio::test]
async fn test_reply_switches_to_whisper_messages() {
    let alice = Device::new("alice");
    let bob = Device::new("bob");

    let bundle = bob.publish_bundle(42, Some(7));
    alice.builder_for(&bob).init_outgoing(bundle).await.unwrap();
    let alice_cipher = alice.cipher_for(&bob);
    let bob_cipher = bob.cipher_for(&alice);

    // Until the peer proves the handshake completed, Alice keeps
    // wrapping her messages as pre-key messages.
    let first = alice_cipher.encrypt(b"hi").await.unwrap();
    assert_eq!(first.message_type, PREKEY_MESSAGE_TYPE);
    bob_cipher
        .decrypt_pre_key_whisper_message(&first.body)
        .await
        .unwrap();

    let reply = bob_cipher.encrypt(b"hey").await.unwrap();
    assert_eq!(reply.message_type, WHISPER_MESSAGE_TYPE);

    let plaintext = alice_cipher.decrypt_whisper_message(&reply.body).await.unwrap();
    assert_eq!(plaintext, b"hey");

    // Alice's pending handshake material is cleared by the first
    // successful decrypt, so her next message is a plain one.
    let record = alice.store.load_session(&bob.fq()).await.unwrap().unwrap();
    assert!(record.get_open_session().unwrap().pending_pre_key.is_none());
    let next = alice_cipher.encrypt(b"again").await.unwrap();
    assert_eq!(next.message_type, WHISPER_MESSAGE_TYPE);
}

#[tokio::test]
async fn test_out_of_order_delivery() {
    let alice = Device::new("alice");
    let bob = Device::new("bob");
    let (alice_cipher, bob_cipher) = establish(&alice, &bob).await;

    let mut messages = Vec::new();
    for i in 1..=5u8 {
        messages.push(alice_cipher.encrypt(&[i]).await.unwrap());
    }

    for index in [2usize, 0, 4, 1, 3] {
        let plaintext = bob_cipher
            .decrypt_whisper_message(&messages[index].body)
            .await
            .unwrap();
        assert_eq!(plaintext, vec![index as u8 + 1]);
    }

    // Second delivery of the same message: its key was consumed.
    let err = bob_cipher
        .decrypt_whisper_message(&messages[2].body)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MessageCounter(_)));
}

#[tokio::test]
async fn test_reverse_order_full_chain() {
    let alice = Device::new("alice");
    let bob = Device::new("bob");
    let (alice_cipher, bob_cipher) = establish(&alice, &bob).await;

    let mut messages = Vec::new();
    for i in 0..10u8 {
        messages.push(alice_cipher.encrypt(&[i]).await.unwrap());
    }
    for (i, message) in messages.iter().enumerate().rev() {
        let plaintext = bob_cipher
            .decrypt_whisper_message(&message.body)
            .await
            .unwrap();
        assert_eq!(plaintext, vec![i as u8]);
    }
}

#[tokio::test]
async fn test_counter_gap_ceiling() {
    let alice = Device::new("alice");
    let bob = Device::new("bob");

    let bundle = bob.publish_bundle(42, None);
    alice.builder_for(&bob).init_outgoing(bundle).await.unwrap();
    let alice_cipher = alice.cipher_for(&bob);
    let bob_cipher = bob.cipher_for(&alice);

    let mut messages = Vec::new();
    for i in 0..2002u32 {
        messages.push(alice_cipher.encrypt(&i.to_le_bytes()).await.unwrap());
    }

    // The last message is 2,001 keys ahead of an untouched chain.
    let err = bob_cipher
        .decrypt_pre_key_whisper_message(&messages[2001].body)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Session(_)));

    // The failure did not advance state: everything still decrypts.
    for (i, message) in messages.iter().enumerate().take(2001) {
        let plaintext = bob_cipher
            .decrypt_pre_key_whisper_message(&message.body)
            .await
            .unwrap();
        assert_eq!(plaintext, (i as u32).to_le_bytes());
    }
    let plaintext = bob_cipher
        .decrypt_pre_key_whisper_message(&messages[2001].body)
        .await
        .unwrap();
    assert_eq!(plaintext, 2001u32.to_le_bytes());
}

#[tokio::test]
async fn test_dh_ratchet_steps_on_reply() {
    let alice = Device::new("alice");
    let bob = Device::new("bob");
    let (alice_cipher, bob_cipher) = establish(&alice, &bob).await;

    // Drive Alice's sending chain to counter 2.
    for i in 0..3u8 {
        let message = alice_cipher.encrypt(&[i]).await.unwrap();
        bob_cipher.decrypt_whisper_message(&message.body).await.unwrap();
    }
    let before = alice.store.load_session(&bob.fq()).await.unwrap().unwrap();
    let session = before.get_open_session().unwrap();
    let old_ratchet_key = session.current_ratchet.ephemeral_key_pair.public_key;
    assert!(session.get_chain(&old_ratchet_key).is_some());

    // Bob's reply carries a new remote ratchet key; decrypting it
    // steps Alice's DH ratchet.
    let reply = bob_cipher.encrypt(b"pong").await.unwrap();
    alice_cipher.decrypt_whisper_message(&reply.body).await.unwrap();

    let after = alice.store.load_session(&bob.fq()).await.unwrap().unwrap();
    let session = after.get_open_session().unwrap();
    let new_ratchet_key = session.current_ratchet.ephemeral_key_pair.public_key;
    assert_ne!(new_ratchet_key, old_ratchet_key);
    // The superseded sending chain is removed and its final counter
    // recorded.
    assert!(session.get_chain(&old_ratchet_key).is_none());
    assert_eq!(session.current_ratchet.previous_counter, 2);
}

#[tokio::test]
async fn test_trust_gate_blocks_handshake() {
    let alice = Device::new("alice");
    let bob = Device::new("bob");

    alice.store.set_trusted(&bob.name, false).unwrap();
    let bundle = bob.publish_bundle(42, None);
    let err = alice
        .builder_for(&bob)
        .init_outgoing(bundle)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UntrustedIdentity { .. }));
    // Nothing was persisted.
    assert!(alice.store.load_session(&bob.fq()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_trust_revocation_mid_session() {
    let alice = Device::new("alice");
    let bob = Device::new("bob");
    let (alice_cipher, bob_cipher) = establish(&alice, &bob).await;

    let message = alice_cipher.encrypt(b"still here?").await.unwrap();
    bob.store.set_trusted(&alice.name, false).unwrap();

    // Trust is re-checked after decryption, so the revocation surfaces
    // even though the ciphertext itself was valid.
    let err = bob_cipher
        .decrypt_whisper_message(&message.body)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UntrustedIdentity { .. }));

    // Encryption toward a distrusted peer fails too.
    bob.store.set_trusted(&alice.name, true).unwrap();
    bob_cipher.decrypt_whisper_message(&message.body).await.unwrap();
    bob.store.set_trusted(&alice.name, false).unwrap();
    let err = bob_cipher.encrypt(b"reply").await.unwrap_err();
    assert!(matches!(err, Error::UntrustedIdentity { .. }));
}

#[tokio::test]
async fn test_retransmitted_pre_key_message() {
    let alice = Device::new("alice");
    let bob = Device::new("bob");

    let bundle = bob.publish_bundle(42, Some(7));
    alice.builder_for(&bob).init_outgoing(bundle).await.unwrap();
    let message = alice.cipher_for(&bob).encrypt(b"knock").await.unwrap();

    let bob_cipher = bob.cipher_for(&alice);
    let plaintext = bob_cipher
        .decrypt_pre_key_whisper_message(&message.body)
        .await
        .unwrap();
    assert_eq!(plaintext, b"knock");
    assert!(bob.store.load_pre_key(7).await.unwrap().is_none());

    let sessions_before = bob
        .store
        .load_session(&alice.fq())
        .await
        .unwrap()
        .unwrap()
        .len();

    // The same envelope again: the handshake short-circuits on the
    // known base key and the consumed counter reports the duplicate.
    let err = bob_cipher
        .decrypt_pre_key_whisper_message(&message.body)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MessageCounter(_)));
    let sessions_after = bob
        .store
        .load_session(&alice.fq())
        .await
        .unwrap()
        .unwrap()
        .len();
    assert_eq!(sessions_before, sessions_after);
}

#[tokio::test]
async fn test_bounded_retention_across_handshakes() {
    let alice = Device::new("alice");
    let bob = Device::new("bob");
    let bundle = bob.publish_bundle(42, None);

    for round in 0..60u32 {
        alice
            .builder_for(&bob)
            .init_outgoing(bundle.clone())
            .await
            .unwrap();
        let message = alice
            .cipher_for(&bob)
            .encrypt(&round.to_le_bytes())
            .await
            .unwrap();
        let plaintext = bob
            .cipher_for(&alice)
            .decrypt_pre_key_whisper_message(&message.body)
            .await
            .unwrap();
        assert_eq!(plaintext, round.to_le_bytes());
    }

    let record = bob.store.load_session(&alice.fq()).await.unwrap().unwrap();
    assert_eq!(record.len(), 40);
    let open: Vec<_> = record
        .get_sessions()
        .into_iter()
        .filter(|s| !s.is_closed())
        .collect();
    assert_eq!(open.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_encrypts_are_serialized_per_peer() {
    let alice = Device::new("alice");
    let bob = Device::new("bob");
    let (alice_cipher, bob_cipher) = establish(&alice, &bob).await;

    let encrypts: Vec<_> = (0..10).map(|_| alice_cipher.encrypt(b"burst")).collect();
    let messages: Vec<_> = futures::future::join_all(encrypts)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    // Counters are assigned strictly in submission order; the reply
    // round in establish left Alice on a fresh sending chain.
    let counters: Vec<u32> = messages.iter().map(|m| wire_counter(&m.body)).collect();
    assert_eq!(counters, (0..10).collect::<Vec<_>>());

    for message in &messages {
        bob_cipher.decrypt_whisper_message(&message.body).await.unwrap();
    }
}

#[tokio::test]
async fn test_session_lifecycle_queries() {
    let alice = Device::new("alice");
    let bob = Device::new("bob");

    let alice_cipher = alice.cipher_for(&bob);
    assert!(!alice_cipher.has_open_session().await.unwrap());
    let err = alice_cipher.encrypt(b"too soon").await.unwrap_err();
    assert!(matches!(err, Error::Session(_)));

    let bundle = bob.publish_bundle(42, None);
    alice.builder_for(&bob).init_outgoing(bundle).await.unwrap();
    assert!(alice_cipher.has_open_session().await.unwrap());

    alice_cipher.close_open_session().await.unwrap();
    assert!(!alice_cipher.has_open_session().await.unwrap());
    let err = alice_cipher.encrypt(b"closed").await.unwrap_err();
    assert!(matches!(err, Error::Session(_)));
}

#[tokio::test]
async fn test_incompatible_version_is_rejected() {
    let alice = Device::new("alice");
    let bob = Device::new("bob");
    let (alice_cipher, bob_cipher) = establish(&alice, &bob).await;

    let mut message = alice_cipher.encrypt(b"versioned").await.unwrap();
    message.body[0] = (2 << 4) | 2;
    let err = bob_cipher
        .decrypt_whisper_message(&message.body)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::IncompatibleVersion(_)));
}

#[tokio::test]
async fn test_tampered_envelope_fails_authentication() {
    let alice = Device::new("alice");
    let bob = Device::new("bob");
    let (alice_cipher, bob_cipher) = establish(&alice, &bob).await;

    let mut message = alice_cipher.encrypt(b"integrity").await.unwrap();
    let len = message.body.len();
    message.body[len - 1] ^= 0x01;

    // The record holds a single candidate session, so the specific
    // authentication failure is surfaced.
    let err = bob_cipher
        .decrypt_whisper_message(&message.body)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BadMac));
}

#[tokio::test]
async fn test_no_pre_key_bundle_still_handshakes() {
    // Without a one-time pre-key the derivation drops the fourth
    // agreement but both sides still converge.
    let alice = Device::new("alice");
    let bob = Device::new("bob");

    let bundle = bob.publish_bundle(42, None);
    alice.builder_for(&bob).init_outgoing(bundle).await.unwrap();
    let message = alice.cipher_for(&bob).encrypt(b"no otpk").await.unwrap();

    let decoded = wire::PreKeyWhisperMessage::decode(&message.body[1..]).unwrap();
    assert!(decoded.pre_key_id.is_none());

    let plaintext = bob
        .cipher_for(&alice)
        .decrypt_pre_key_whisper_message(&message.body)
        .await
        .unwrap();
    assert_eq!(plaintext, b"no otpk");
}
