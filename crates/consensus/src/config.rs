//! Engine configuration and validation.

use std::cmp::Ordering;
use std::time::Duration;

use bdls_messages::{Message, SignedMessage};
use bdls_types::{Identity, KeyPair};

use crate::error::ConsensusError;

/// Minimum number of participants the protocol tolerates (n ≥ 4 for f ≥ 1).
pub const MINIMUM_PARTICIPANTS: usize = 4;

/// Total order on application states.
pub type StateCompareFn = Box<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

/// Syntactic validity predicate for application states.
pub type StateValidateFn = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// External veto over inbound messages, applied after the built-in checks.
pub type MessageValidatorFn = Box<dyn Fn(&Message, &SignedMessage) -> bool + Send + Sync>;

/// Observer invoked for every outbound message before it is queued.
pub type MessageOutFn = Box<dyn Fn(&Message, &SignedMessage) + Send + Sync>;

/// Parameters of the consensus protocol.
///
/// Optional fields that [`Config::validate`] requires mirror what the engine
/// cannot invent on its own: the epoch, the state callbacks and the signing
/// key.
pub struct Config {
    /// The starting time point for consensus; also keys the leader rotation,
    /// so all participants must agree on it.
    pub epoch: Option<Duration>,

    /// Height at which this engine begins.
    pub current_height: u64,

    /// Signing key; its public identity must be in `participants` for this
    /// node to take part (a pure observer configuration is legal).
    pub private_key: Option<KeyPair>,

    /// Consensus group in enumeration order, identical on all nodes.
    pub participants: Vec<Identity>,

    /// Deliver `<commit>` via unicast to the round leader instead of
    /// broadcasting.
    pub enable_commit_unicast: bool,

    /// Base round-trip expectation used for round deadlines; adjustable at
    /// runtime via `set_latency`.
    pub expected_latency: Duration,

    /// Total order on states.
    pub state_compare: Option<StateCompareFn>,

    /// State validity predicate.
    pub state_validate: Option<StateValidateFn>,

    /// Optional external message veto.
    pub message_validator: Option<MessageValidatorFn>,

    /// Optional outbound-message observer.
    pub message_out_callback: Option<MessageOutFn>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            epoch: None,
            current_height: 0,
            private_key: None,
            participants: Vec::new(),
            enable_commit_unicast: false,
            expected_latency: Duration::from_millis(500),
            state_compare: None,
            state_validate: None,
            message_validator: None,
            message_out_callback: None,
        }
    }
}

impl Config {
    /// Verify the integrity of this config when creating a new engine.
    pub fn validate(&self) -> Result<(), ConsensusError> {
        if self.epoch.is_none() {
            return Err(ConsensusError::ConfigEpoch);
        }

        if self.state_compare.is_none() {
            return Err(ConsensusError::ConfigStateCompare);
        }

        if self.state_validate.is_none() {
            return Err(ConsensusError::ConfigStateValidate);
        }

        if self.private_key.is_none() {
            return Err(ConsensusError::ConfigPrivateKey);
        }

        if self.participants.len() < MINIMUM_PARTICIPANTS {
            return Err(ConsensusError::ConfigParticipants);
        }

        Ok(())
    }
}
