//! Error types for the session engine.

use thiserror::Error;

/// Result type alias for session engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during handshakes, encryption and decryption
#[derive(Error, Debug)]
pub enum Error {
    /// The peer's identity key failed the trust check
    #[error("untrusted identity key for {addr}")]
    UntrustedIdentity {
        /// Identifier part of the peer address
        addr: String,
        /// The identity key that was rejected (public material)
        identity_key: Vec<u8>,
    },

    /// Generic session failure: no record, no open session, missing or
    /// closed chain, malformed session fields
    #[error("session error: {0}")]
    Session(String),

    /// Message counter already consumed or never filled; duplicate
    /// delivery indicator
    #[error("message counter error: {0}")]
    MessageCounter(String),

    /// Missing or invalid pre-key material during a handshake
    #[error("pre-key error: {0}")]
    PreKey(String),

    /// Message authentication failed
    #[error("bad mac")]
    BadMac,

    /// MAC length did not match the expected truncation
    #[error("bad mac length: {0}")]
    BadMacLength(usize),

    /// Version-byte nibble check failed
    #[error("incompatible protocol version byte {0:#04x}")]
    IncompatibleVersion(u8),

    /// Precondition violation: wrong sizes, missing fields, bad key types
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Storage backend failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Wire message failed to decode
    #[error("malformed wire message")]
    Wire(#[from] prost::DecodeError),
}

impl Error {
    /// True for the error kinds trial decryption absorbs per session.
    pub(crate) fn is_session_kind(&self) -> bool {
        matches!(
            self,
            Error::Session(_)
                | Error::MessageCounter(_)
                | Error::PreKey(_)
                | Error::BadMac
                | Error::BadMacLength(_)
        )
    }
}
