//! ECDSA key pairs and signatures over secp256k1.
//!
//! Signing is deterministic (RFC 6979), so two engines signing the same
//! digest with the same key produce byte-identical signatures. Signature
//! components are carried as minimal big-endian bytes on the wire and
//! re-padded to field width for verification.

use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{EncodedPoint, FieldBytes};
use std::fmt;

use crate::hash::Hash;
use crate::identity::Identity;

/// Errors from key handling and signing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// Public key bytes do not describe a point on the curve.
    #[error("incorrect public key format")]
    PubKeyFormat,

    /// Private key bytes are not a valid non-zero scalar.
    #[error("invalid private key")]
    PrivateKeyFormat,

    /// The signing primitive rejected the digest.
    #[error("signing failed")]
    SigningFailed,
}

/// A secp256k1 key pair for signing consensus messages.
#[derive(Clone)]
pub struct KeyPair {
    secret: SigningKey,
}

impl KeyPair {
    /// Construct from raw 32-byte secret scalar bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let secret =
            SigningKey::from_bytes(&(*bytes).into()).map_err(|_| CryptoError::PrivateKeyFormat)?;
        Ok(Self { secret })
    }

    /// Derive a key pair from a seed (for testing/simulation).
    ///
    /// Seeds that do not form a valid scalar are re-hashed until one does,
    /// so this is total and deterministic.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let mut candidate = *seed;
        loop {
            if let Ok(secret) = SigningKey::from_bytes(&candidate.into()) {
                return Self { secret };
            }
            candidate = Hash::of(&candidate).to_bytes();
        }
    }

    /// Get the public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(*self.secret.verifying_key())
    }

    /// Get the participant identity (padded X ‖ Y coordinates).
    pub fn identity(&self) -> Identity {
        self.public_key().to_identity()
    }

    /// Sign a precomputed 32-byte digest (RFC 6979, deterministic).
    pub fn sign_digest(&self, digest: &Hash) -> Result<Signature, CryptoError> {
        let sig: EcdsaSignature = self
            .secret
            .sign_prehash(digest.as_bytes())
            .map_err(|_| CryptoError::SigningFailed)?;
        let (r, s) = sig.split_bytes();
        Ok(Signature {
            r: minimal_bytes(r.as_slice()),
            s: minimal_bytes(s.as_slice()),
        })
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair({:?})", self.identity())
    }
}

/// A secp256k1 public key for signature verification.
#[derive(Clone)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Reconstruct a public key from a participant identity.
    ///
    /// Rejects coordinates that do not lie on the curve.
    pub fn from_identity(identity: &Identity) -> Result<Self, CryptoError> {
        let x = FieldBytes::clone_from_slice(identity.x());
        let y = FieldBytes::clone_from_slice(identity.y());
        let point = EncodedPoint::from_affine_coordinates(&x, &y, false);
        let key = VerifyingKey::from_encoded_point(&point).map_err(|_| CryptoError::PubKeyFormat)?;
        Ok(Self(key))
    }

    /// Derive the participant identity: X and Y coordinates, each
    /// left-zero-padded to 32 bytes, concatenated.
    pub fn to_identity(&self) -> Identity {
        let point = self.0.to_encoded_point(false);
        let mut bytes = [0u8; Identity::BYTES];
        if let (Some(x), Some(y)) = (point.x(), point.y()) {
            bytes[..32].copy_from_slice(x.as_slice());
            bytes[32..].copy_from_slice(y.as_slice());
        }
        Identity::from_raw(bytes)
    }

    /// Verify a signature over a 32-byte digest.
    pub fn verify_digest(&self, digest: &Hash, signature: &Signature) -> bool {
        let Some(r) = left_pad32(&signature.r) else {
            return false;
        };
        let Some(s) = left_pad32(&signature.s) else {
            return false;
        };
        let Ok(sig) = EcdsaSignature::from_scalars(r, s) else {
            return false;
        };
        self.0.verify_prehash(digest.as_bytes(), &sig).is_ok()
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for PublicKey {}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({:?})", self.to_identity())
    }
}

/// An ECDSA signature with minimal big-endian component bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Signature {
    r: Vec<u8>,
    s: Vec<u8>,
}

impl Signature {
    /// Wrap raw component bytes as received from the wire.
    pub fn from_parts(r: Vec<u8>, s: Vec<u8>) -> Self {
        Self { r, s }
    }

    /// The `r` component, minimal big-endian.
    pub fn r(&self) -> &[u8] {
        &self.r
    }

    /// The `s` component, minimal big-endian.
    pub fn s(&self) -> &[u8] {
        &self.s
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Signature(r={}, s={})",
            hex::encode(&self.r),
            hex::encode(&self.s)
        )
    }
}

/// Strip leading zero bytes, as `big.Int.Bytes` style minimal encoding.
fn minimal_bytes(bytes: &[u8]) -> Vec<u8> {
    let start = bytes
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

/// Left-pad minimal bytes back to field width; `None` if too long.
fn left_pad32(bytes: &[u8]) -> Option<[u8; 32]> {
    if bytes.len() > 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(bytes);
    Some(out)
}
