//! Inner protocol messages and their proof sets.

use std::fmt;

use bdls_types::Hash;

use crate::codec::{CodecError, FieldReader, FieldWriter};
use crate::envelope::SignedMessage;

/// Discriminated protocol message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Announces entry into a round with a candidate state.
    RoundChange,
    /// Locks a state backed by a RoundChange quorum.
    Lock,
    /// Commits a locked state backed by a Lock quorum.
    Commit,
    /// Terminal event for a height backed by a Commit quorum.
    Decide,
    /// Request for the peer's most recent Decide.
    Resync,
}

impl MessageKind {
    /// Wire discriminator.
    pub fn code(self) -> u8 {
        match self {
            MessageKind::RoundChange => 1,
            MessageKind::Lock => 2,
            MessageKind::Commit => 3,
            MessageKind::Decide => 4,
            MessageKind::Resync => 5,
        }
    }

    /// Parse a wire discriminator.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(MessageKind::RoundChange),
            2 => Some(MessageKind::Lock),
            3 => Some(MessageKind::Commit),
            4 => Some(MessageKind::Decide),
            5 => Some(MessageKind::Resync),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::RoundChange => "roundchange",
            MessageKind::Lock => "lock",
            MessageKind::Commit => "commit",
            MessageKind::Decide => "decide",
            MessageKind::Resync => "resync",
        };
        write!(f, "{}", name)
    }
}

/// A protocol message: kind, coordinates, state payload and optional proof
/// set of signed envelopes of the preceding phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub height: u64,
    pub round: u64,
    pub state: Vec<u8>,
    /// Identity of `state`; carried on quorum-bearing messages as a
    /// cross-check, absent on RoundChange and Resync.
    pub state_hash: Option<Hash>,
    /// Quorum certificate: envelopes of the preceding phase, or a lock
    /// justification on RoundChange.
    pub proof: Vec<SignedMessage>,
}

impl Message {
    /// RoundChange with an optional lock justification.
    pub fn round_change(
        height: u64,
        round: u64,
        state: Vec<u8>,
        justification: Vec<SignedMessage>,
    ) -> Self {
        Self {
            kind: MessageKind::RoundChange,
            height,
            round,
            state,
            state_hash: None,
            proof: justification,
        }
    }

    /// Lock carrying its RoundChange proof set.
    pub fn lock(height: u64, round: u64, state: Vec<u8>, proof: Vec<SignedMessage>) -> Self {
        let state_hash = Some(Hash::of(&state));
        Self {
            kind: MessageKind::Lock,
            height,
            round,
            state,
            state_hash,
            proof,
        }
    }

    /// Commit carrying its Lock proof set.
    pub fn commit(height: u64, round: u64, state: Vec<u8>, proof: Vec<SignedMessage>) -> Self {
        let state_hash = Some(Hash::of(&state));
        Self {
            kind: MessageKind::Commit,
            height,
            round,
            state,
            state_hash,
            proof,
        }
    }

    /// Decide carrying its Commit proof set.
    pub fn decide(height: u64, round: u64, state: Vec<u8>, proof: Vec<SignedMessage>) -> Self {
        let state_hash = Some(Hash::of(&state));
        Self {
            kind: MessageKind::Decide,
            height,
            round,
            state,
            state_hash,
            proof,
        }
    }

    /// Resync request announcing the local (height, round).
    pub fn resync(height: u64, round: u64) -> Self {
        Self {
            kind: MessageKind::Resync,
            height,
            round,
            state: Vec::new(),
            state_hash: None,
            proof: Vec::new(),
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = FieldWriter::new();
        writer.put_u8(self.kind.code());
        writer.put_u64(self.height);
        writer.put_u64(self.round);
        writer.put_bytes(&self.state);
        match &self.state_hash {
            Some(hash) => {
                writer.put_u8(1);
                writer.put_raw(hash.as_bytes());
            }
            None => writer.put_u8(0),
        }
        writer.put_u32(self.proof.len() as u32);
        for element in &self.proof {
            writer.put_bytes(&element.encode());
        }
        writer.into_bytes()
    }

    /// Decode from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = FieldReader::new(bytes);

        let code = reader.read_u8()?;
        let kind = MessageKind::from_code(code).ok_or(CodecError::UnknownKind(code))?;
        let height = reader.read_u64()?;
        let round = reader.read_u64()?;
        let state = reader.read_bytes()?.to_vec();
        let state_hash = match reader.read_u8()? {
            0 => None,
            _ => Some(Hash::from_raw(reader.read_array::<32>()?)),
        };

        let count = reader.read_u32()?;
        let mut proof = Vec::new();
        for _ in 0..count {
            let element = reader.read_bytes()?;
            proof.push(SignedMessage::decode(element)?);
        }

        reader.finish()?;
        Ok(Self {
            kind,
            height,
            round,
            state,
            state_hash,
            proof,
        })
    }
}
