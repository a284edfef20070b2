//! Cryptographic primitives: hashing, HKDF, AES-256-CBC and MAC handling.

use crate::error::{Error, Result};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// HKDF info label for the handshake master secret
pub(crate) const WHISPER_TEXT_INFO: &[u8] = b"WhisperText";

/// HKDF info label for root-chain ratchet steps
pub(crate) const WHISPER_RATCHET_INFO: &[u8] = b"WhisperRatchet";

/// HKDF info label for per-message key expansion
pub(crate) const WHISPER_MESSAGE_KEYS_INFO: &[u8] = b"WhisperMessageKeys";

/// Size of symmetric keys (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of AES-CBC initialisation vectors
pub const IV_SIZE: usize = 16;

/// Truncated length of the envelope MAC
pub const MAC_SIZE: usize = 8;

/// 32-byte symmetric key with automatic zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    /// Create from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get key as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey([REDACTED])")
    }
}

/// SHA-512 digest. Empty input is rejected.
pub fn hash(data: &[u8]) -> Result<[u8; 64]> {
    if data.is_empty() {
        return Err(Error::InvalidArgument("cannot hash empty input".into()));
    }
    let digest = Sha512::digest(data);
    Ok(digest.into())
}

/// HMAC-SHA256 over `data` with `key`
#[must_use]
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; KEY_SIZE] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// PKCS#7 padded AES-256-CBC encryption
#[must_use]
pub fn aes_cbc_encrypt(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], data: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
}

/// AES-256-CBC decryption; fails on invalid PKCS#7 padding
pub fn aes_cbc_decrypt(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], data: &[u8]) -> Result<Vec<u8>> {
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|_| Error::Session("bad ciphertext padding".into()))
}

/// Computes HMAC-SHA256 over `data`, truncates to `length` bytes and
/// compares against `mac` in constant time.
pub fn verify_mac(data: &[u8], key: &[u8], mac: &[u8], length: usize) -> Result<()> {
    if mac.len() != length {
        return Err(Error::BadMacLength(mac.len()));
    }
    let mut calculated = hmac_sha256(key, data);
    if length > calculated.len() {
        calculated.zeroize();
        return Err(Error::BadMacLength(length));
    }
    let matched: bool = calculated[..length].ct_eq(mac).into();
    calculated.zeroize();
    if matched {
        Ok(())
    } else {
        Err(Error::BadMac)
    }
}

/// RFC 5869 HKDF-SHA256: extract with a 32-byte salt, expand `info` into
/// one to three 32-byte chunks.
pub fn derive_secrets(
    input: &[u8],
    salt: &[u8; KEY_SIZE],
    info: &[u8],
    chunks: usize,
) -> Result<Vec<SymmetricKey>> {
    if !(1..=3).contains(&chunks) {
        return Err(Error::InvalidArgument(format!(
            "invalid HKDF chunk count: {chunks}"
        )));
    }
    let hkdf = Hkdf::<Sha256>::new(Some(salt), input);
    let mut okm = [0u8; 3 * KEY_SIZE];
    hkdf.expand(info, &mut okm[..chunks * KEY_SIZE])
        .expect("output size is valid");

    let keys = okm[..chunks * KEY_SIZE]
        .chunks_exact(KEY_SIZE)
        .map(|chunk| SymmetricKey::from_bytes(chunk.try_into().expect("chunk is 32 bytes")))
        .collect();
    okm.zeroize();
    Ok(keys)
}

/// Key material expanded from one message key: cipher key, MAC key and IV
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MessageKeyMaterial {
    cipher_key: [u8; KEY_SIZE],
    mac_key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
}

impl MessageKeyMaterial {
    /// AES-256 key for the message body
    #[must_use]
    pub fn cipher_key(&self) -> &[u8; KEY_SIZE] {
        &self.cipher_key
    }

    /// HMAC key for the envelope MAC
    #[must_use]
    pub fn mac_key(&self) -> &[u8; KEY_SIZE] {
        &self.mac_key
    }

    /// CBC initialisation vector
    #[must_use]
    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }
}

impl std::fmt::Debug for MessageKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageKeyMaterial([REDACTED])")
    }
}

/// Expands a 32-byte message key into cipher key, MAC key and IV.
pub fn expand_message_keys(message_key: &SymmetricKey) -> Result<MessageKeyMaterial> {
    let mut derived = derive_secrets(
        message_key.as_bytes(),
        &[0u8; KEY_SIZE],
        WHISPER_MESSAGE_KEYS_INFO,
        3,
    )?;
    let iv_source = derived.pop().expect("three chunks requested");
    let mac_key = derived.pop().expect("three chunks requested");
    let cipher_key = derived.pop().expect("three chunks requested");

    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&iv_source.as_bytes()[..IV_SIZE]);

    Ok(MessageKeyMaterial {
        cipher_key: *cipher_key.as_bytes(),
        mac_key: *mac_key.as_bytes(),
        iv,
    })
}
