//! Wire messages for the consensus protocol.
//!
//! Two layers make up a transmitted unit:
//!
//! - [`Message`]: the inner protocol record (kind, height, round, state,
//!   optional proof set), encoded with deterministic length-prefixed framing.
//! - [`SignedMessage`]: the outer envelope binding the inner bytes to a
//!   participant's key with an ECDSA signature over the canonical digest.
//!
//! Encoding is byte-exact: identical values always encode to identical
//! bytes, which the engine's determinism guarantee relies on.

mod codec;
mod envelope;
mod message;

pub use codec::CodecError;
pub use envelope::{SignedMessage, PROTOCOL_VERSION, SIGNATURE_PREFIX};
pub use message::{Message, MessageKind};
