//! Signed wire envelope.
//!
//! Every transmitted unit is a [`SignedMessage`] wrapping an encoded inner
//! message. The canonical digest covers a fixed ASCII prefix, the protocol
//! version, the signer's padded public-key coordinates and the
//! length-prefixed message body, so any deviation in padding, length
//! encoding or prefix produces an unverifiable envelope.

use bdls_types::{CryptoError, Hash, Identity, KeyPair, PublicKey, Signature};

use crate::codec::{CodecError, FieldReader, FieldWriter};

/// Current protocol version, checked on every inbound envelope.
pub const PROTOCOL_VERSION: u32 = 1;

/// Fixed prefix for the signing digest.
pub const SIGNATURE_PREFIX: &[u8] = b"===Sperax Signed Message===\n";

/// A signed wire envelope.
///
/// `x`/`y` are the signer's public-key coordinates (left-zero-padded to 32
/// bytes each); `r`/`s` are the minimal big-endian ECDSA signature
/// components over the canonical digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMessage {
    pub version: u32,
    pub x: [u8; 32],
    pub y: [u8; 32],
    pub message: Vec<u8>,
    pub r: Vec<u8>,
    pub s: Vec<u8>,
}

impl SignedMessage {
    /// Sign an encoded inner message with the given key pair.
    pub fn sign(message: Vec<u8>, keypair: &KeyPair) -> Result<Self, CryptoError> {
        let identity = keypair.identity();
        let mut envelope = Self {
            version: PROTOCOL_VERSION,
            x: *identity.x(),
            y: *identity.y(),
            message,
            r: Vec::new(),
            s: Vec::new(),
        };
        let signature = keypair.sign_digest(&envelope.digest())?;
        envelope.r = signature.r().to_vec();
        envelope.s = signature.s().to_vec();
        Ok(envelope)
    }

    /// Canonical digest:
    /// `blake2b-256(prefix ‖ version-le32 ‖ x ‖ y ‖ len-le32(message) ‖ message)`.
    pub fn digest(&self) -> Hash {
        Hash::of_parts(&[
            SIGNATURE_PREFIX,
            &self.version.to_le_bytes(),
            &self.x,
            &self.y,
            &(self.message.len() as u32).to_le_bytes(),
            &self.message,
        ])
    }

    /// The signer's identity as embedded in the envelope.
    ///
    /// Purely positional; does not prove the coordinates lie on the curve.
    pub fn identity(&self) -> Identity {
        let mut bytes = [0u8; Identity::BYTES];
        bytes[..32].copy_from_slice(&self.x);
        bytes[32..].copy_from_slice(&self.y);
        Identity::from_raw(bytes)
    }

    /// Reconstruct the signer's public key, rejecting off-curve coordinates.
    pub fn public_key(&self) -> Result<PublicKey, CryptoError> {
        PublicKey::from_identity(&self.identity())
    }

    /// Verify the signature against a previously reconstructed public key.
    pub fn verify_with(&self, public_key: &PublicKey) -> bool {
        let signature = Signature::from_parts(self.r.clone(), self.s.clone());
        public_key.verify_digest(&self.digest(), &signature)
    }

    /// Verify the envelope end to end: coordinates on curve and signature
    /// valid over the canonical digest.
    pub fn verify(&self) -> bool {
        match self.public_key() {
            Ok(public_key) => self.verify_with(&public_key),
            Err(_) => false,
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = FieldWriter::new();
        writer.put_u32(self.version);
        writer.put_raw(&self.x);
        writer.put_raw(&self.y);
        writer.put_bytes(&self.message);
        writer.put_bytes(&self.r);
        writer.put_bytes(&self.s);
        writer.into_bytes()
    }

    /// Decode from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = FieldReader::new(bytes);
        let envelope = Self::decode_from(&mut reader)?;
        reader.finish()?;
        Ok(envelope)
    }

    pub(crate) fn decode_from(reader: &mut FieldReader<'_>) -> Result<Self, CodecError> {
        let version = reader.read_u32()?;
        let x = reader.read_array::<32>()?;
        let y = reader.read_array::<32>()?;
        let message = reader.read_bytes()?.to_vec();
        let r = reader.read_bytes()?.to_vec();
        let s = reader.read_bytes()?.to_vec();
        Ok(Self {
            version,
            x,
            y,
            message,
            r,
            s,
        })
    }
}
