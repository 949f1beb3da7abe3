//! Inbound message validation.
//!
//! Stateless portions of the pipeline live here: envelope authentication and
//! proof-set verification. Height/round windows and the user hooks depend on
//! engine state and are applied by the engine itself.

use std::collections::BTreeSet;

use bdls_messages::{Message, MessageKind, SignedMessage, PROTOCOL_VERSION};
use bdls_types::{Hash, Identity, ParticipantSet};

use crate::error::ConsensusError;

/// Decode an inbound frame into an envelope.
pub(crate) fn decode_envelope(bytes: &[u8]) -> Result<SignedMessage, ConsensusError> {
    SignedMessage::decode(bytes).map_err(|_| ConsensusError::MessageDecoded)
}

/// Authenticate an envelope and decode its inner message.
///
/// Checks, in order: public key well-formed and on the curve, signature
/// valid over the canonical digest, signer a registered participant, inner
/// message decodable, protocol version supported.
pub(crate) fn authenticate(
    envelope: &SignedMessage,
    participants: &ParticipantSet,
) -> Result<(Message, Identity), ConsensusError> {
    let public_key = envelope
        .public_key()
        .map_err(|_| ConsensusError::PubKeyFormat)?;

    if !envelope.verify_with(&public_key) {
        return Err(ConsensusError::MessageSignature);
    }

    let signer = envelope.identity();
    if !participants.contains(&signer) {
        return Err(ConsensusError::MessageUnknownParticipant);
    }

    let message =
        Message::decode(&envelope.message).map_err(|_| ConsensusError::MessageDecoded)?;

    if envelope.version != PROTOCOL_VERSION {
        return Err(ConsensusError::MessageVersion);
    }

    Ok((message, signer))
}

/// Verify the proof set attached to a message.
///
/// Every element must be a verifiable envelope of the phase preceding
/// `message.kind`, from a distinct registered participant, carrying the same
/// height and state; the distinct-signer count must reach the quorum
/// threshold. Nested proofs inside elements are not recursed into.
///
/// For RoundChange the proof is an optional lock justification: a RoundChange
/// quorum for the same state at one common earlier round. Returns that
/// justification round when present.
pub(crate) fn verify_proof(
    message: &Message,
    participants: &ParticipantSet,
) -> Result<Option<u64>, ConsensusError> {
    if let Some(state_hash) = message.state_hash {
        if state_hash != Hash::of(&message.state) {
            return Err(ConsensusError::MessageState);
        }
    }

    let required_kind = match message.kind {
        MessageKind::Lock => MessageKind::RoundChange,
        MessageKind::Commit => MessageKind::Lock,
        MessageKind::Decide => MessageKind::Commit,
        MessageKind::RoundChange => {
            if message.proof.is_empty() {
                return Ok(None);
            }
            MessageKind::RoundChange
        }
        MessageKind::Resync => {
            if message.proof.is_empty() {
                return Ok(None);
            }
            return Err(ConsensusError::MessageProof);
        }
    };

    let mut signers: BTreeSet<Identity> = BTreeSet::new();
    let mut justification_round: Option<u64> = None;

    for element in &message.proof {
        if element.version != PROTOCOL_VERSION || !element.verify() {
            return Err(ConsensusError::MessageProof);
        }

        let signer = element.identity();
        if !participants.contains(&signer) {
            return Err(ConsensusError::MessageProof);
        }

        let inner =
            Message::decode(&element.message).map_err(|_| ConsensusError::MessageProof)?;
        if inner.kind != required_kind
            || inner.height != message.height
            || inner.state != message.state
        {
            return Err(ConsensusError::MessageProof);
        }

        if message.kind == MessageKind::RoundChange {
            // Justification quorum sits at one common round strictly below
            // the announced round.
            match justification_round {
                None => {
                    if inner.round >= message.round {
                        return Err(ConsensusError::MessageProof);
                    }
                    justification_round = Some(inner.round);
                }
                Some(round) => {
                    if inner.round != round {
                        return Err(ConsensusError::MessageProof);
                    }
                }
            }
        } else if inner.round != message.round {
            return Err(ConsensusError::MessageProof);
        }

        signers.insert(signer);
    }

    if signers.len() < participants.quorum() {
        return Err(ConsensusError::MessageProof);
    }

    Ok(justification_round)
}
