//! Participant identity: padded public-key coordinates.

use std::fmt;

use crate::crypto::CryptoError;

/// Bytes per public-key axis (X or Y coordinate).
pub const AXIS_BYTES: usize = 32;

/// A participant's stable identifier: the X and Y coordinates of its
/// secp256k1 public key, each left-zero-padded to 32 bytes, concatenated.
///
/// Carries no on-curve guarantee by itself; reconstructing a
/// [`PublicKey`](crate::PublicKey) from an identity performs the curve check.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity([u8; Identity::BYTES]);

impl Identity {
    /// Size of an identity in bytes.
    pub const BYTES: usize = 2 * AXIS_BYTES;

    /// Wrap raw identity bytes.
    pub fn from_raw(bytes: [u8; Identity::BYTES]) -> Self {
        Self(bytes)
    }

    /// Build an identity from variable-length big-endian axis bytes.
    ///
    /// Axes shorter than 32 bytes keep their leading zeros; longer axes are
    /// an encoding error.
    pub fn from_axes(x: &[u8], y: &[u8]) -> Result<Self, CryptoError> {
        if x.len() > AXIS_BYTES || y.len() > AXIS_BYTES {
            return Err(CryptoError::PubKeyFormat);
        }
        let mut bytes = [0u8; Identity::BYTES];
        bytes[AXIS_BYTES - x.len()..AXIS_BYTES].copy_from_slice(x);
        bytes[Identity::BYTES - y.len()..].copy_from_slice(y);
        Ok(Self(bytes))
    }

    /// The padded X coordinate.
    pub fn x(&self) -> &[u8; AXIS_BYTES] {
        self.0[..AXIS_BYTES]
            .try_into()
            .unwrap_or(&[0u8; AXIS_BYTES])
    }

    /// The padded Y coordinate.
    pub fn y(&self) -> &[u8; AXIS_BYTES] {
        self.0[AXIS_BYTES..]
            .try_into()
            .unwrap_or(&[0u8; AXIS_BYTES])
    }

    /// Get bytes as slice reference.
    pub fn as_bytes(&self) -> &[u8; Identity::BYTES] {
        &self.0
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(self.0);
        write!(f, "Identity({}..{})", &hex[..8], &hex[120..])
    }
}
