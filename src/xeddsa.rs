//! XEdDSA signatures over X25519 keys.
//!
//! Follows "The XEdDSA and VXEdDSA Signature Schemes" by Trevor
//! Perrin, revision 1, 2016-10-20: the clamped X25519 scalar is
//! negated when its Ed25519 public point has a set sign bit, so the
//! effective public point always carries sign zero and the ordinary
//! Ed25519 equations apply on both sides.

use crate::keys::{PublicKey, SecretKey};
use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::MontgomeryPoint;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// XEdDSA signature: R commitment and s scalar, 32 bytes each
pub const SIGNATURE_LENGTH: usize = 64;

/// Domain separator for the nonce hash: 0xFE padded with 0xFF bytes.
const NONCE_DOMAIN: [u8; 32] = {
    let mut bytes = [0xFF; 32];
    bytes[0] = 0xFE;
    bytes
};

/// Signs `message` with an X25519 private key.
///
/// `random` MUST be fresh cryptographically random bytes for every
/// signature; reusing it leaks the private key.
#[must_use]
pub fn sign(
    private_key: &SecretKey,
    message: &[u8],
    random: &[u8; 64],
) -> [u8; SIGNATURE_LENGTH] {
    let (mut a, public) = calculate_key_pair(&private_key.to_bytes());

    // r = hash1(a || M || Z) mod q
    let mut hasher = Sha512::new();
    hasher.update(NONCE_DOMAIN);
    hasher.update(a.as_bytes());
    hasher.update(message);
    hasher.update(random);
    let mut r = Scalar::from_bytes_mod_order_wide(&hasher.finalize().into());

    let commitment = (&r * ED25519_BASEPOINT_TABLE).compress();
    let h = challenge(&commitment, &public, message);
    let s = r + h * a;
    a.zeroize();
    r.zeroize();

    let mut signature = [0u8; SIGNATURE_LENGTH];
    signature[..32].copy_from_slice(commitment.as_bytes());
    signature[32..].copy_from_slice(s.as_bytes());
    signature
}

/// Verifies an XEdDSA signature against a prefixed X25519 public key.
/// Malformed keys and signatures verify as `false`.
#[must_use]
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(signature) = <&[u8; SIGNATURE_LENGTH]>::try_from(signature) else {
        return false;
    };
    let commitment_bytes: [u8; 32] = signature[..32].try_into().expect("split above");
    let mut s_bytes = [0u8; 32];
    s_bytes.copy_from_slice(&signature[32..]);

    // s must arrive fully reduced; the group order is below 2^253.
    if s_bytes[31] & 0xE0 != 0 {
        return false;
    }
    let commitment = CompressedEdwardsY(commitment_bytes);
    if commitment.decompress().is_none() {
        return false;
    }
    let Some(a_point) = signer_point(public_key) else {
        return false;
    };
    if !a_point.is_torsion_free() {
        return false;
    }

    let s = Scalar::from_bytes_mod_order(s_bytes);
    let h = challenge(&commitment, &a_point.compress(), message);

    // R == sB - hA, compared over the compressed encoding.
    let check = EdwardsPoint::vartime_double_scalar_mul_basepoint(&h, &-a_point, &s);
    check.compress().as_bytes().ct_eq(&commitment_bytes).into()
}

/// Ed25519 key pair behind an X25519 private key: the clamped scalar,
/// negated when its public point compresses with a set sign bit, and
/// that public point with the sign bit cleared.
fn calculate_key_pair(k: &[u8; 32]) -> (Scalar, CompressedEdwardsY) {
    let mut clamped = *k;
    clamped[0] &= 248;
    clamped[31] &= 127;
    clamped[31] |= 64;
    let mut scalar = Scalar::from_bytes_mod_order(clamped);
    clamped.zeroize();

    let mut public = (&scalar * ED25519_BASEPOINT_TABLE).compress().to_bytes();
    if public[31] >> 7 == 1 {
        scalar = -scalar;
    }
    public[31] &= 0x7F;
    (scalar, CompressedEdwardsY(public))
}

/// Maps a Montgomery-u public key to the even-sign Edwards point the
/// signer committed to.
fn signer_point(public_key: &PublicKey) -> Option<EdwardsPoint> {
    let mut u = public_key.key_bytes();
    u[31] &= 0x7F;
    MontgomeryPoint(u).to_edwards(0)
}

/// h = hash(R || A || M) mod q
fn challenge(
    commitment: &CompressedEdwardsY,
    public: &CompressedEdwardsY,
    message: &[u8],
) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(commitment.as_bytes());
    hasher.update(public.as_bytes());
    hasher.update(message);
    Scalar::from_bytes_mod_order_wide(&hasher.finalize().into())
}
