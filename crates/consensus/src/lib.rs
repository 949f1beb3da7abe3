//! BDLS consensus core.
//!
//! This crate provides the deterministic consensus state machine for the
//! BDLS protocol (ePrint 2019/1460): Byzantine fault tolerant agreement for
//! partially-connected asynchronous networks, safe and live against up to
//! f < n/3 Byzantine participants.
//!
//! # Architecture
//!
//! The engine is a pure, side-effect-free state machine:
//!
//! ```text
//! receive_message(bytes, now) ─┐
//! update(now) ─────────────────┼─→ Consensus ─→ drain_output() → [(Destination, bytes)]
//! propose(state) ──────────────┘
//! ```
//!
//! It performs no I/O and owns no clock: the embedding agent feeds it
//! inbound frames and the current time, then forwards whatever signed
//! envelopes it queued. All calls must be serialized with `now`
//! monotonically non-decreasing.
//!
//! # Determinism
//!
//! No randomness influences protocol decisions: signing is RFC 6979, all
//! tie-breaks use the user-supplied total order, and every internal
//! iteration runs over ordered maps. Two engines with identical
//! configuration, input sequence and `now` sequence produce identical
//! output bytes.

mod config;
mod error;
mod outbox;
mod round;
mod state;
mod validator;

pub use config::{
    Config, MessageOutFn, MessageValidatorFn, StateCompareFn, StateValidateFn,
    MINIMUM_PARTICIPANTS,
};
pub use error::ConsensusError;
pub use outbox::Destination;
pub use state::Consensus;
