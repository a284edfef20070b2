//! # Double Ratchet session engine
//!
//! Forward-secret, post-compromise-secure pairwise messaging between
//! devices identified by `(name, device_id)` addresses. Sessions are
//! seeded by an asynchronous pre-key handshake and advanced by the
//! Double Ratchet: a symmetric chain per direction plus a fresh
//! Diffie-Hellman step on every reply.
//!
//! ## Security Properties
//!
//! - **Forward secrecy**: consumed message keys cannot be re-derived
//! - **Post-compromise security**: each reply rotates the ratchet key
//! - **Asynchronous**: the initiator encrypts against a published
//!   pre-key bundle while the peer is offline
//! - **Out-of-order tolerance**: skipped message keys are retained per
//!   chain, bounded at 2,000
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rand_core::OsRng;
//! use whisper_ratchet::{
//!     InMemoryStore, KeyPair, ProtocolAddress, SessionCipher,
//! };
//!
//! # async fn demo() -> whisper_ratchet::Result<()> {
//! let identity = KeyPair::generate(&mut OsRng);
//! let store = Arc::new(InMemoryStore::new(identity, 1));
//! let peer = ProtocolAddress::new("drew", 1)?;
//! let cipher = SessionCipher::new(store, peer);
//!
//! // After a handshake (SessionBuilder::init_outgoing or an incoming
//! // pre-key message) the cipher encrypts and decrypts:
//! let outgoing = cipher.encrypt(b"hi there").await?;
//! # let _ = outgoing;
//! # Ok(())
//! # }
//! ```
//!
//! All mutating operations for one peer run strictly serialized;
//! operations for different peers proceed concurrently.

#![forbid(unsafe_code)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![warn(clippy::all, clippy::pedantic, clippy::cargo)]

pub mod address;
pub mod builder;
pub mod cipher;
pub mod crypto;
pub mod error;
pub mod keys;
mod queue;
pub mod record;
pub mod session;
pub mod storage;
pub mod wire;
pub mod xeddsa;

// Re-export main types
pub use address::ProtocolAddress;
pub use builder::{OneTimePreKey, PreKeyBundle, SessionBuilder, SignedPreKey};
pub use cipher::{EncryptedMessage, SessionCipher};
pub use error::{Error, Result};
pub use keys::{generate_registration_id, KeyPair, PublicKey, SecretKey};
pub use record::SessionRecord;
pub use session::SessionEntry;
pub use storage::{InMemoryStore, ProtocolStore};
