//! Error taxonomy for configuration and inbound-message handling.

use thiserror::Error;

/// Errors surfaced by engine construction and message ingestion.
///
/// Inbound-message errors mean the message was dropped; they never leave the
/// engine in a partially updated state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConsensusError {
    #[error("config: epoch is not set")]
    ConfigEpoch,

    #[error("config: state compare function is not set")]
    ConfigStateCompare,

    #[error("config: state validate function is not set")]
    ConfigStateValidate,

    #[error("config: private key is not set")]
    ConfigPrivateKey,

    #[error("config: insufficient participants")]
    ConfigParticipants,

    #[error("incorrect public key format")]
    PubKeyFormat,

    #[error("invalid message signature")]
    MessageSignature,

    #[error("unsupported protocol version")]
    MessageVersion,

    #[error("message signer is not a participant")]
    MessageUnknownParticipant,

    #[error("message height outside the acceptable window")]
    MessageHeight,

    #[error("message round outside the acceptable window")]
    MessageRound,

    #[error("message state rejected by validation")]
    MessageState,

    #[error("message proof set failed verification")]
    MessageProof,

    #[error("message could not be decoded")]
    MessageDecoded,

    #[error("message rejected by the external validator")]
    MessageValidator,
}
