//! Key material: prefixed Curve25519 public keys, zeroizing secret keys,
//! key agreement and registration ids.

use crate::crypto::KEY_SIZE;
use crate::error::{Error, Result};

use rand_core::CryptoRngCore;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Type byte carried by every public key on the wire and in storage
pub const KEY_TYPE_BYTE: u8 = 0x05;

/// Serialized public key size: type byte plus 32-byte Montgomery u
pub const PUBLIC_KEY_SIZE: usize = 33;

/// ASN.1 SPKI prefix framing a raw X25519 public key as DER
pub const SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x6e, 0x03, 0x21, 0x00,
];

/// ASN.1 PKCS#8 prefix framing a raw X25519 private key as DER
pub const PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x6e, 0x04, 0x22, 0x04,
    0x20,
];

/// X25519 public key, stored with its `0x05` type prefix (33 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Wraps a raw 32-byte Montgomery-u value, adding the type prefix
    #[must_use]
    pub fn from_raw(raw: [u8; KEY_SIZE]) -> Self {
        let mut bytes = [0u8; PUBLIC_KEY_SIZE];
        bytes[0] = KEY_TYPE_BYTE;
        bytes[1..].copy_from_slice(&raw);
        Self(bytes)
    }

    /// Parses a serialized 33-byte key, validating the type prefix
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(Error::InvalidArgument(format!(
                "invalid public key length: {}",
                bytes.len()
            )));
        }
        if bytes[0] != KEY_TYPE_BYTE {
            return Err(Error::InvalidArgument(format!(
                "invalid public key type byte: {:#04x}",
                bytes[0]
            )));
        }
        let mut out = [0u8; PUBLIC_KEY_SIZE];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    /// Serialized form including the type prefix
    #[must_use]
    pub fn serialize(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Raw 32-byte Montgomery-u value with the prefix stripped
    #[must_use]
    pub fn key_bytes(&self) -> [u8; KEY_SIZE] {
        self.0[1..].try_into().expect("key is 33 bytes")
    }

    /// DER SPKI encoding for interop with platform key stores
    #[must_use]
    pub fn to_spki_der(&self) -> Vec<u8> {
        let mut der = Vec::with_capacity(SPKI_PREFIX.len() + KEY_SIZE);
        der.extend_from_slice(&SPKI_PREFIX);
        der.extend_from_slice(&self.0[1..]);
        der
    }

    /// Parses a DER SPKI encoded X25519 public key
    pub fn from_spki_der(der: &[u8]) -> Result<Self> {
        let raw = der
            .strip_prefix(&SPKI_PREFIX[..])
            .ok_or_else(|| Error::InvalidArgument("invalid SPKI prefix".into()))?;
        let raw: [u8; KEY_SIZE] = raw
            .try_into()
            .map_err(|_| Error::InvalidArgument(format!("invalid SPKI key length: {}", raw.len())))?;
        Ok(Self::from_raw(raw))
    }

    pub(crate) fn to_x25519(self) -> X25519PublicKey {
        X25519PublicKey::from(self.key_bytes())
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey([REDACTED])")
    }
}

impl From<X25519PublicKey> for PublicKey {
    fn from(pk: X25519PublicKey) -> Self {
        Self::from_raw(*pk.as_bytes())
    }
}

/// X25519 secret key with automatic zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(StaticSecret);

impl SecretKey {
    /// Generate a new random secret key
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self(StaticSecret::random_from_rng(rng))
    }

    /// Create from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Raw scalar bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; KEY_SIZE] {
        self.0.to_bytes()
    }

    /// The corresponding prefixed public key
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(X25519PublicKey::from(&self.0))
    }

    /// X25519 agreement with a prefixed public key; the prefix is
    /// stripped before the scalar multiplication.
    #[must_use]
    pub fn calculate_agreement(&self, their_key: &PublicKey) -> DhSecret {
        let shared = self.0.diffie_hellman(&their_key.to_x25519());
        DhSecret(*shared.as_bytes())
    }

    /// DER PKCS#8 encoding for interop with platform key stores
    #[must_use]
    pub fn to_pkcs8_der(&self) -> Vec<u8> {
        let mut der = Vec::with_capacity(PKCS8_PREFIX.len() + KEY_SIZE);
        der.extend_from_slice(&PKCS8_PREFIX);
        der.extend_from_slice(&self.to_bytes());
        der
    }

    /// Parses a DER PKCS#8 encoded X25519 private key
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        let raw = der
            .strip_prefix(&PKCS8_PREFIX[..])
            .ok_or_else(|| Error::InvalidArgument("invalid PKCS#8 prefix".into()))?;
        let raw: [u8; KEY_SIZE] = raw.try_into().map_err(|_| {
            Error::InvalidArgument(format!("invalid PKCS#8 key length: {}", raw.len()))
        })?;
        Ok(Self::from_bytes(raw))
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// Output of an X25519 agreement (32 bytes), zeroized on drop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DhSecret([u8; KEY_SIZE]);

impl DhSecret {
    /// Returns the shared secret bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for DhSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhSecret([REDACTED])")
    }
}

/// An X25519 key pair
#[derive(Clone)]
pub struct KeyPair {
    /// Prefixed public key
    pub public_key: PublicKey,
    /// Private key
    pub private_key: SecretKey,
}

impl KeyPair {
    /// Generate a fresh key pair
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        let private_key = SecretKey::generate(rng);
        let public_key = private_key.public_key();
        Self {
            public_key,
            private_key,
        }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Generates a 14-bit registration id from two random bytes.
pub fn generate_registration_id<R: CryptoRngCore>(rng: &mut R) -> u32 {
    let mut bytes = [0u8; 2];
    rng.fill_bytes(&mut bytes);
    u32::from(u16::from_le_bytes(bytes) & 0x3fff)
}
