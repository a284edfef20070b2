//! Wire framing: protobuf message layouts, envelope assembly and the
//! protocol version byte.

use crate::crypto::MAC_SIZE;
use crate::error::{Error, Result};

/// Current protocol version
pub const VERSION: u8 = 3;

/// Smallest well-formed ratchet message envelope: version byte plus
/// truncated MAC
pub const MIN_WHISPER_MESSAGE_SIZE: usize = 1 + MAC_SIZE;

/// Smallest well-formed pre-key message envelope
pub const MIN_PREKEY_MESSAGE_SIZE: usize = 2;

/// Type discriminator for a ratchet message
pub const WHISPER_MESSAGE_TYPE: u8 = 1;

/// Type discriminator for a pre-key message
pub const PREKEY_MESSAGE_TYPE: u8 = 3;

/// One Double Ratchet message
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WhisperMessage {
    /// Sender's current ratchet public key (33 bytes, prefixed)
    #[prost(bytes = "vec", optional, tag = "1")]
    pub ephemeral_key: Option<Vec<u8>>,
    /// Position in the sending chain
    #[prost(uint32, optional, tag = "2")]
    pub counter: Option<u32>,
    /// Final counter of the sender's previous sending chain
    #[prost(uint32, optional, tag = "3")]
    pub previous_counter: Option<u32>,
    /// AES-256-CBC ciphertext
    #[prost(bytes = "vec", optional, tag = "4")]
    pub ciphertext: Option<Vec<u8>>,
}

/// A ratchet message wrapped with the handshake material the responder
/// needs to build the session
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PreKeyWhisperMessage {
    /// Sender's registration id
    #[prost(uint32, optional, tag = "5")]
    pub registration_id: Option<u32>,
    /// Consumed one-time pre-key id, when one was present in the bundle
    #[prost(uint32, optional, tag = "1")]
    pub pre_key_id: Option<u32>,
    /// Signed pre-key id the sender handshook against
    #[prost(uint32, optional, tag = "6")]
    pub signed_pre_key_id: Option<u32>,
    /// Sender's handshake base key (33 bytes, prefixed)
    #[prost(bytes = "vec", optional, tag = "2")]
    pub base_key: Option<Vec<u8>>,
    /// Sender's identity key (33 bytes, prefixed)
    #[prost(bytes = "vec", optional, tag = "3")]
    pub identity_key: Option<Vec<u8>>,
    /// Complete inner ratchet message envelope
    #[prost(bytes = "vec", optional, tag = "4")]
    pub message: Option<Vec<u8>>,
}

/// The version byte sent on every envelope: our version in the high
/// nibble, the minimum version we accept in the low nibble.
#[must_use]
pub fn version_byte() -> u8 {
    (VERSION << 4) | VERSION
}

/// Validates an incoming version byte: the sender's version (high
/// nibble) must be at least ours, and the sender's minimum (low nibble)
/// must not exceed ours.
pub fn check_version_byte(byte: u8) -> Result<()> {
    let version = byte >> 4;
    let minimum = byte & 0x0f;
    if version < VERSION || minimum > VERSION {
        return Err(Error::IncompatibleVersion(byte));
    }
    Ok(())
}

/// Splits a ratchet message envelope into its wire bytes and truncated
/// MAC, after validating the version byte and minimum size.
pub(crate) fn split_whisper_envelope(data: &[u8]) -> Result<(&[u8], &[u8])> {
    if data.len() < MIN_WHISPER_MESSAGE_SIZE {
        return Err(Error::InvalidArgument(format!(
            "ratchet message too short: {} bytes",
            data.len()
        )));
    }
    check_version_byte(data[0])?;
    let (wire, mac) = data[1..].split_at(data.len() - 1 - MAC_SIZE);
    Ok((wire, mac))
}
