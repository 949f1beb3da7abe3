//! Core types for BDLS consensus.
//!
//! This crate provides the foundation layer used throughout the consensus
//! implementation:
//!
//! - **Primitives**: Blake2b-256 [`Hash`], secp256k1 [`KeyPair`]/[`PublicKey`]
//! - **Identity**: stable 64-byte participant identifier
//! - **Registry**: [`ParticipantSet`] with quorum arithmetic and the
//!   deterministic leader rule
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer. Everything
//! here is deterministic: hashing, identity derivation and ECDSA signing
//! (RFC 6979) produce identical bytes for identical inputs.

mod crypto;
mod hash;
mod identity;
mod participant;

pub use crypto::{CryptoError, KeyPair, PublicKey, Signature};
pub use hash::Hash;
pub use identity::{Identity, AXIS_BYTES};
pub use participant::ParticipantSet;

/// Application state under agreement: opaque bytes ordered and validated by
/// user-supplied callbacks. Identity of a state is the hash of its bytes.
pub type State = Vec<u8>;
