//! BDLS consensus state machine.
//!
//! This module implements the consensus engine as a synchronous,
//! deterministic state machine. The embedder feeds it inbound frames via
//! [`Consensus::receive_message`] and wall-clock ticks via
//! [`Consensus::update`]; both return after appending any resulting signed
//! envelopes to an internal queue drained by [`Consensus::drain_output`].
//! The engine owns no threads, timers or sockets.
//!
//! # Round Flow
//!
//! 1. **RoundChange** → on entering (h, r), broadcast the candidate state:
//!    the locked state, the local proposal when leading, or the best state
//!    seen this height
//! 2. **Lock** → a quorum of RoundChanges for one state forms a proof set;
//!    broadcast a Lock and pin the state
//! 3. **Commit** → a quorum of Locks forms a proof set; broadcast a Commit
//!    (unicast to the round leader when commit-unicast is enabled)
//! 4. **Decide** → a quorum of Commits forms a proof set; broadcast the
//!    Decide, record the decision and enter (h+1, 0)
//!
//! Rounds time out on an exponential schedule, and a quorum of RoundChange
//! signers at a higher round pulls a lagging node forward.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use bdls_messages::{Message, MessageKind, SignedMessage};
use bdls_types::{Hash, Identity, KeyPair, ParticipantSet};

use crate::config::{Config, MessageOutFn, MessageValidatorFn, StateCompareFn, StateValidateFn};
use crate::error::ConsensusError;
use crate::outbox::{Destination, Outbox};
use crate::round::{LockRecord, RoundState, StateGroup};
use crate::validator;

/// Cap on the exponential round back-off: deadlines grow as
/// `expected_latency · 2^min(round, MAX_BACKOFF_EXPONENT)`.
const MAX_BACKOFF_EXPONENT: u64 = 10;

/// How far above the current round an inbound message may sit. Bounds
/// adversarial round inflation while still letting lagging nodes buffer the
/// majority's messages.
const ROUND_LOOKAHEAD: u64 = 8;

/// The most recent decision, kept verbatim for resync replies.
#[derive(Debug, Clone)]
struct DecideRecord {
    height: u64,
    round: u64,
    state: Vec<u8>,
    envelope: Vec<u8>,
}

/// BDLS consensus engine for one participant.
///
/// Strictly single-threaded; the embedder serializes all calls and supplies
/// `now` monotonically non-decreasing. Given identical configuration and
/// identical input/`now` sequences, two engines produce byte-identical
/// output sequences.
pub struct Consensus {
    // ═══════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════
    /// Signing key for outbound envelopes.
    keypair: KeyPair,

    /// Our identity (padded public-key coordinates).
    identity: Identity,

    /// The fixed participant registry.
    participants: ParticipantSet,

    /// Whether our identity is itself registered; a non-member engine
    /// observes and decides but never emits protocol messages.
    is_member: bool,

    // ═══════════════════════════════════════════════════════════════════════
    // User callbacks
    // ═══════════════════════════════════════════════════════════════════════
    state_compare: StateCompareFn,
    state_validate: StateValidateFn,
    message_validator: Option<MessageValidatorFn>,
    message_out: Option<MessageOutFn>,

    // ═══════════════════════════════════════════════════════════════════════
    // Protocol parameters
    // ═══════════════════════════════════════════════════════════════════════
    /// Shared starting point; keys the leader rotation.
    epoch: Duration,

    /// Deliver Commit messages via unicast to the round leader.
    commit_unicast: bool,

    /// Base latency expectation for round deadlines.
    expected_latency: Duration,

    // ═══════════════════════════════════════════════════════════════════════
    // Chain state
    // ═══════════════════════════════════════════════════════════════════════
    /// Current height.
    height: u64,

    /// Current round within the height.
    round: u64,

    /// When the current round was entered; established lazily on the first
    /// call carrying a clock.
    round_entered: Option<Duration>,

    /// Per-round tallies for the current height.
    rounds: BTreeMap<u64, RoundState>,

    /// The state we are pinned to, if any.
    lock: Option<LockRecord>,

    /// Application proposal for the current height.
    proposal: Option<Vec<u8>>,

    /// Best state observed this height under the user's total order.
    best_seen: Option<Vec<u8>>,

    /// Most recent decision (ours or accepted from the network).
    latest_decide: Option<DecideRecord>,

    // ═══════════════════════════════════════════════════════════════════════
    // Time & output
    // ═══════════════════════════════════════════════════════════════════════
    /// Latest observed clock.
    now: Duration,

    /// Rate limiter for outbound resync requests.
    last_resync_request: Option<Duration>,

    /// Signed envelopes awaiting pickup.
    outbox: Outbox,
}

impl std::fmt::Debug for Consensus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consensus")
            .field("identity", &self.identity)
            .field("height", &self.height)
            .field("round", &self.round)
            .field("participants", &self.participants.len())
            .field("locked_round", &self.lock.as_ref().map(|l| l.round))
            .field("decided", &self.latest_decide.is_some())
            .finish()
    }
}

impl Consensus {
    /// Create a new consensus engine from a validated configuration.
    pub fn new(config: Config) -> Result<Self, ConsensusError> {
        config.validate()?;

        let Config {
            epoch,
            current_height,
            private_key,
            participants,
            enable_commit_unicast,
            expected_latency,
            state_compare,
            state_validate,
            message_validator,
            message_out_callback,
        } = config;

        let epoch = epoch.ok_or(ConsensusError::ConfigEpoch)?;
        let state_compare = state_compare.ok_or(ConsensusError::ConfigStateCompare)?;
        let state_validate = state_validate.ok_or(ConsensusError::ConfigStateValidate)?;
        let keypair = private_key.ok_or(ConsensusError::ConfigPrivateKey)?;

        let identity = keypair.identity();
        let participants = ParticipantSet::new(participants);
        let is_member = participants.contains(&identity);

        let mut rounds = BTreeMap::new();
        rounds.insert(0, RoundState::default());

        info!(
            ?identity,
            height = current_height,
            participants = participants.len(),
            quorum = participants.quorum(),
            member = is_member,
            "consensus engine created"
        );

        Ok(Self {
            keypair,
            identity,
            participants,
            is_member,
            state_compare,
            state_validate,
            message_validator,
            message_out: message_out_callback,
            epoch,
            commit_unicast: enable_commit_unicast,
            expected_latency,
            height: current_height,
            round: 0,
            round_entered: None,
            rounds,
            lock: None,
            proposal: None,
            best_seen: None,
            latest_decide: None,
            now: Duration::ZERO,
            last_resync_request: None,
            outbox: Outbox::default(),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    /// Our participant identity.
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Current height.
    pub fn height(&self) -> u64 {
        self.height
    }

    /// Current round within the height.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Quorum threshold T of the participant set.
    pub fn quorum(&self) -> usize {
        self.participants.quorum()
    }

    /// Adjust the expected network latency used for round deadlines.
    pub fn set_latency(&mut self, latency: Duration) {
        debug!(?latency, "expected latency updated");
        self.expected_latency = latency;
    }

    /// The most recent decision as `(height, round, state)`; before any
    /// decision, the current coordinates with an empty state.
    pub fn current_state(&self) -> (u64, u64, Vec<u8>) {
        match &self.latest_decide {
            Some(decide) => (decide.height, decide.round, decide.state.clone()),
            None => (self.height, self.round, Vec::new()),
        }
    }

    /// Drain queued outbound envelopes as `(destination, bytes)` pairs.
    pub fn drain_output(&mut self) -> Vec<(Destination, Vec<u8>)> {
        self.outbox.drain()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Entry points
    // ═══════════════════════════════════════════════════════════════════════

    /// Pin a candidate state for the current height.
    ///
    /// The proposal feeds the local RoundChange rule only; it does not by
    /// itself become the committed state. Proposals are cleared on height
    /// advance. Invalid states are ignored.
    pub fn propose(&mut self, state: &[u8]) {
        if !(self.state_validate)(state) {
            warn!(height = self.height, "proposal rejected by state validator");
            return;
        }
        debug!(height = self.height, "proposal pinned");
        self.proposal = Some(state.to_vec());
        self.observe_state(state);
    }

    /// Ingest one inbound frame.
    ///
    /// Invalid messages are dropped with a typed error and never mutate
    /// engine state; duplicates are silently ignored.
    pub fn receive_message(&mut self, bytes: &[u8], now: Duration) -> Result<(), ConsensusError> {
        self.advance_clock(now);

        let envelope = validator::decode_envelope(bytes)?;
        let (message, signer) = validator::authenticate(&envelope, &self.participants)?;

        trace!(
            kind = %message.kind,
            height = message.height,
            round = message.round,
            peer = ?signer,
            "inbound message"
        );

        match message.kind {
            MessageKind::Resync => {
                validator::verify_proof(&message, &self.participants)?;
                self.check_external_validator(&message, &envelope)?;
                self.handle_resync(&message, signer);
                Ok(())
            }
            MessageKind::Decide => {
                if !(self.state_validate)(&message.state) {
                    return Err(ConsensusError::MessageState);
                }
                validator::verify_proof(&message, &self.participants)?;
                self.check_external_validator(&message, &envelope)?;
                self.handle_decide(bytes, &message);
                self.step()
            }
            MessageKind::RoundChange | MessageKind::Lock | MessageKind::Commit => {
                if message.height != self.height {
                    if message.height > self.height {
                        // Best effort; the height rejection below stands
                        // regardless of whether the request could be signed.
                        self.maybe_request_resync(signer).ok();
                    }
                    return Err(ConsensusError::MessageHeight);
                }
                if message.round < self.round || message.round > self.round + ROUND_LOOKAHEAD {
                    return Err(ConsensusError::MessageRound);
                }
                if !(self.state_validate)(&message.state) {
                    return Err(ConsensusError::MessageState);
                }
                let justification = validator::verify_proof(&message, &self.participants)?;
                self.check_external_validator(&message, &envelope)?;

                match message.kind {
                    MessageKind::RoundChange => {
                        self.handle_round_change(envelope, message, signer, justification)
                    }
                    MessageKind::Lock => self.handle_lock(envelope, message, signer),
                    MessageKind::Commit => self.handle_commit(envelope, message, signer),
                    _ => {}
                }
                self.step()
            }
        }
    }

    /// Advance protocol timers against the supplied clock.
    ///
    /// Called periodically by the embedder; drives round deadlines and any
    /// pending phase transitions.
    pub fn update(&mut self, now: Duration) -> Result<(), ConsensusError> {
        self.advance_clock(now);

        if let Some(entered) = self.round_entered {
            let exponent = self.round.min(MAX_BACKOFF_EXPONENT) as u32;
            let deadline = entered + self.expected_latency.saturating_mul(1u32 << exponent);
            if self.now > deadline {
                let next = self.round + 1;
                info!(
                    height = self.height,
                    round = next,
                    "round deadline elapsed, advancing"
                );
                self.enter_round(next);
            }
        }

        self.step()
    }

    /// Validate an arbitrary Decide envelope without touching engine state.
    ///
    /// Used by embedders for proof-verified catch-up: a frame that passes
    /// here carries a commit quorum for `(height, round, state)`.
    pub fn validate_decide_message(
        &self,
        bytes: &[u8],
    ) -> Result<(u64, u64, Vec<u8>), ConsensusError> {
        let envelope = validator::decode_envelope(bytes)?;
        let (message, _) = validator::authenticate(&envelope, &self.participants)?;
        if message.kind != MessageKind::Decide {
            return Err(ConsensusError::MessageDecoded);
        }
        if !(self.state_validate)(&message.state) {
            return Err(ConsensusError::MessageState);
        }
        validator::verify_proof(&message, &self.participants)?;
        Ok((message.height, message.round, message.state))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Clock & transitions
    // ═══════════════════════════════════════════════════════════════════════

    fn advance_clock(&mut self, now: Duration) {
        if now > self.now {
            self.now = now;
        }
        if self.round_entered.is_none() {
            self.round_entered = Some(self.now);
        }
    }

    fn enter_round(&mut self, round: u64) {
        self.round = round;
        self.round_entered = Some(self.now);
        self.rounds.entry(round).or_default();
        debug!(height = self.height, round, "entered round");
    }

    fn enter_height(&mut self, height: u64) {
        self.height = height;
        self.rounds.clear();
        self.lock = None;
        self.proposal = None;
        self.best_seen = None;
        self.enter_round(0);
        info!(height, "entered height");
    }

    fn epoch_millis(&self) -> u64 {
        self.epoch.as_millis() as u64
    }

    fn round_leader(&self) -> Identity {
        self.participants
            .leader_for(self.epoch_millis(), self.height, self.round)
    }

    /// Track the best state observed this height under the user order.
    fn observe_state(&mut self, state: &[u8]) {
        let better = match &self.best_seen {
            Some(best) => (self.state_compare)(state, best) == Ordering::Greater,
            None => true,
        };
        if better {
            self.best_seen = Some(state.to_vec());
        }
    }

    fn check_external_validator(
        &self,
        message: &Message,
        envelope: &SignedMessage,
    ) -> Result<(), ConsensusError> {
        if let Some(hook) = &self.message_validator {
            if !hook(message, envelope) {
                return Err(ConsensusError::MessageValidator);
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inbound handlers
    // ═══════════════════════════════════════════════════════════════════════

    fn handle_round_change(
        &mut self,
        envelope: SignedMessage,
        message: Message,
        signer: Identity,
        justification: Option<u64>,
    ) {
        let state_hash = Hash::of(&message.state);
        let round = self.rounds.entry(message.round).or_default();
        if !round.add_round_change(signer, state_hash, &message.state, envelope, justification) {
            trace!(peer = ?signer, round = message.round, "duplicate roundchange ignored");
            return;
        }
        self.observe_state(&message.state);
    }

    fn handle_lock(&mut self, envelope: SignedMessage, message: Message, signer: Identity) {
        let state_hash = Hash::of(&message.state);
        let round = message.round;
        {
            let round_state = self.rounds.entry(round).or_default();
            if !round_state.add_lock(signer, state_hash, &message.state, envelope) {
                trace!(peer = ?signer, round, "duplicate lock ignored");
                return;
            }
            // The attached RoundChange quorum is itself evidence for this
            // round; absorbing it lets a lagging node reach the quorum and
            // sync forward. Justifications nested inside the elements are
            // unverified and therefore not counted.
            for element in &message.proof {
                if let Ok(inner) = Message::decode(&element.message) {
                    if inner.kind == MessageKind::RoundChange {
                        round_state.add_round_change(
                            element.identity(),
                            state_hash,
                            &message.state,
                            element.clone(),
                            None,
                        );
                    }
                }
            }
        }
        self.observe_state(&message.state);

        // A verifiable lock at a strictly higher round supersedes ours.
        let adopt = match &self.lock {
            Some(existing) => round > existing.round,
            None => true,
        };
        if adopt {
            debug!(round, state = ?state_hash, "adopting lock");
            self.lock = Some(LockRecord {
                round,
                state: message.state,
                state_hash,
                proof: message.proof,
            });
        }
    }

    fn handle_commit(&mut self, envelope: SignedMessage, message: Message, signer: Identity) {
        let state_hash = Hash::of(&message.state);
        let round = message.round;
        {
            let round_state = self.rounds.entry(round).or_default();
            if !round_state.add_commit(signer, state_hash, &message.state, envelope) {
                trace!(peer = ?signer, round, "duplicate commit ignored");
                return;
            }
            // Absorb the Lock quorum carried as proof.
            for element in &message.proof {
                if let Ok(inner) = Message::decode(&element.message) {
                    if inner.kind == MessageKind::Lock {
                        round_state.add_lock(
                            element.identity(),
                            state_hash,
                            &message.state,
                            element.clone(),
                        );
                    }
                }
            }
        }
        self.observe_state(&message.state);
    }

    fn handle_decide(&mut self, raw: &[u8], message: &Message) {
        if message.height < self.height {
            debug!(
                height = message.height,
                current = self.height,
                "stale decide ignored"
            );
            return;
        }

        info!(
            height = message.height,
            round = message.round,
            "decide accepted from network"
        );

        let newer = match &self.latest_decide {
            Some(existing) => message.height >= existing.height,
            None => true,
        };
        if newer {
            self.latest_decide = Some(DecideRecord {
                height: message.height,
                round: message.round,
                state: message.state.clone(),
                envelope: raw.to_vec(),
            });
        }

        self.enter_height(message.height + 1);
    }

    fn handle_resync(&mut self, message: &Message, signer: Identity) {
        let Some(decide) = &self.latest_decide else {
            trace!(peer = ?signer, "resync request but no decide to offer");
            return;
        };
        if decide.height < message.height {
            return;
        }
        debug!(
            peer = ?signer,
            height = decide.height,
            "answering resync with latest decide"
        );
        let bytes = decide.envelope.clone();
        self.outbox.push(Destination::Unicast(signer), bytes);
    }

    /// Ask a peer that is ahead of us for its latest decide, at most once
    /// per expected-latency interval.
    fn maybe_request_resync(&mut self, peer: Identity) -> Result<(), ConsensusError> {
        if !self.is_member {
            return Ok(());
        }
        if let Some(last) = self.last_resync_request {
            if self.now.saturating_sub(last) < self.expected_latency {
                return Ok(());
            }
        }
        self.last_resync_request = Some(self.now);

        let message = Message::resync(self.height, self.round);
        let envelope = self.sign_message(&message)?;
        debug!(peer = ?peer, height = self.height, "requesting resync");
        self.dispatch(Destination::Unicast(peer), &message, &envelope);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Phase triggers
    // ═══════════════════════════════════════════════════════════════════════

    /// Run phase transitions to a fixpoint.
    ///
    /// Each trigger fires at most once per round (or height, for decides),
    /// so the loop terminates.
    fn step(&mut self) -> Result<(), ConsensusError> {
        loop {
            if self.try_decide()? {
                continue;
            }
            let mut progressed = self.ensure_round_change()?;
            progressed |= self.try_sync_round();
            progressed |= self.try_lock()?;
            progressed |= self.try_commit()?;
            if !progressed {
                break;
            }
        }
        Ok(())
    }

    /// Broadcast our RoundChange for the current round when a candidate
    /// state is available.
    ///
    /// The candidate is, in order of precedence: the locked state (with its
    /// proof as justification), the local proposal when we lead this round,
    /// or — evaluated once at round entry — the best state seen so far.
    /// After the entry evaluation, only a lock or a local proposal can still
    /// trigger the broadcast; merely observed states never do, so a node
    /// with nothing of its own stays silent instead of echoing the first
    /// state that happens to arrive.
    fn ensure_round_change(&mut self) -> Result<bool, ConsensusError> {
        if !self.is_member {
            return Ok(false);
        }

        let (sent, evaluated) = {
            let round_state = self.rounds.entry(self.round).or_default();
            (round_state.sent_round_change, round_state.entry_evaluated)
        };
        if sent {
            return Ok(false);
        }
        let at_entry = !evaluated;
        if let Some(round_state) = self.rounds.get_mut(&self.round) {
            round_state.entry_evaluated = true;
        }

        let candidate = self.round_change_candidate(at_entry);
        let Some((state, mut justification)) = candidate else {
            return Ok(false);
        };
        // A justification quorum must sit strictly below the announced
        // round; a lock at the current round is already this round's
        // RoundChange set, so it is carried as plain state only.
        let justification_round = match &self.lock {
            Some(lock) if !justification.is_empty() && lock.round < self.round => Some(lock.round),
            _ => {
                justification = Vec::new();
                None
            }
        };

        let message = Message::round_change(self.height, self.round, state.clone(), justification);
        let envelope = self.sign_message(&message)?;
        debug!(
            height = self.height,
            round = self.round,
            locked = justification_round.is_some(),
            "broadcasting roundchange"
        );
        self.dispatch(Destination::Broadcast, &message, &envelope);

        let state_hash = Hash::of(&state);
        let round_state = self.rounds.entry(self.round).or_default();
        round_state.sent_round_change = true;
        round_state.add_round_change(
            self.identity,
            state_hash,
            &state,
            envelope,
            justification_round,
        );
        self.observe_state(&state);
        Ok(true)
    }

    fn round_change_candidate(&self, at_entry: bool) -> Option<(Vec<u8>, Vec<SignedMessage>)> {
        if let Some(lock) = &self.lock {
            return Some((lock.state.clone(), lock.proof.clone()));
        }
        let leading =
            self.participants
                .is_leader(&self.identity, self.epoch_millis(), self.height, self.round);
        if leading {
            if let Some(proposal) = &self.proposal {
                return Some((proposal.clone(), Vec::new()));
            }
        }
        if at_entry {
            self.best_seen.clone().map(|state| (state, Vec::new()))
        } else {
            self.proposal.clone().map(|state| (state, Vec::new()))
        }
    }

    /// Jump forward when a quorum is already working at a higher round.
    fn try_sync_round(&mut self) -> bool {
        let threshold = self.participants.quorum();
        let target = self
            .rounds
            .iter()
            .filter(|(round, round_state)| {
                **round > self.round
                    && (round_state.round_changes.distinct_signers() >= threshold
                        || round_state.locks.quorum_group(threshold).is_some())
            })
            .map(|(round, _)| *round)
            .max();

        match target {
            Some(round) => {
                info!(
                    height = self.height,
                    from = self.round,
                    to = round,
                    "syncing to majority round"
                );
                self.enter_round(round);
                true
            }
            None => false,
        }
    }

    /// On a quorum of RoundChanges, select a state by the MaxLock rule and
    /// broadcast a Lock carrying the RoundChange proof set.
    fn try_lock(&mut self) -> Result<bool, ConsensusError> {
        if !self.is_member {
            return Ok(false);
        }

        let threshold = self.participants.quorum();
        let selection = {
            let Some(round_state) = self.rounds.get(&self.round) else {
                return Ok(false);
            };
            if round_state.sent_lock {
                return Ok(false);
            }
            // MaxLock: among states with a RoundChange quorum, prefer the
            // highest attached lock-justification round, then the user's
            // total order.
            let mut best: Option<(&Hash, &StateGroup)> = None;
            for (hash, group) in &round_state.round_changes.groups {
                if group.signers.len() < threshold {
                    continue;
                }
                best = Some(match best {
                    None => (hash, group),
                    Some((best_hash, best_group)) => {
                        let preference = group
                            .max_justification
                            .cmp(&best_group.max_justification)
                            .then_with(|| (self.state_compare)(&group.state, &best_group.state));
                        if preference == Ordering::Greater {
                            (hash, group)
                        } else {
                            (best_hash, best_group)
                        }
                    }
                });
            }
            best.map(|(hash, group)| (*hash, group.state.clone(), group.envelopes.clone()))
        };
        let Some((state_hash, state, proof)) = selection else {
            return Ok(false);
        };

        let message = Message::lock(self.height, self.round, state.clone(), proof.clone());
        let envelope = self.sign_message(&message)?;
        info!(
            height = self.height,
            round = self.round,
            state = ?state_hash,
            "roundchange quorum reached, broadcasting lock"
        );
        self.dispatch(Destination::Broadcast, &message, &envelope);

        let raise = match &self.lock {
            Some(existing) => self.round > existing.round,
            None => true,
        };
        if raise {
            self.lock = Some(LockRecord {
                round: self.round,
                state: state.clone(),
                state_hash,
                proof,
            });
        }

        let round_state = self.rounds.entry(self.round).or_default();
        round_state.sent_lock = true;
        round_state.add_lock(self.identity, state_hash, &state, envelope);
        Ok(true)
    }

    /// On a quorum of Locks for one state, broadcast a Commit carrying the
    /// Lock proof set.
    fn try_commit(&mut self) -> Result<bool, ConsensusError> {
        if !self.is_member {
            return Ok(false);
        }

        let threshold = self.participants.quorum();
        let selection = {
            let Some(round_state) = self.rounds.get(&self.round) else {
                return Ok(false);
            };
            if round_state.sent_commit {
                return Ok(false);
            }
            round_state
                .locks
                .quorum_group(threshold)
                .map(|(hash, group)| (*hash, group.state.clone(), group.envelopes.clone()))
        };
        let Some((state_hash, state, proof)) = selection else {
            return Ok(false);
        };

        let message = Message::commit(self.height, self.round, state.clone(), proof);
        let envelope = self.sign_message(&message)?;
        info!(
            height = self.height,
            round = self.round,
            state = ?state_hash,
            "lock quorum reached, committing"
        );

        let destination = if self.commit_unicast {
            Destination::Unicast(self.round_leader())
        } else {
            Destination::Broadcast
        };
        if destination == Destination::Unicast(self.identity) {
            // We are the unicast target; counting our own commit suffices.
            if let Some(callback) = &self.message_out {
                callback(&message, &envelope);
            }
        } else {
            self.dispatch(destination, &message, &envelope);
        }

        let round_state = self.rounds.entry(self.round).or_default();
        round_state.sent_commit = true;
        round_state.add_commit(self.identity, state_hash, &state, envelope);
        Ok(true)
    }

    /// On a quorum of Commits at any round of this height, emit the Decide
    /// and advance to the next height.
    fn try_decide(&mut self) -> Result<bool, ConsensusError> {
        let threshold = self.participants.quorum();
        let found = self.rounds.iter().find_map(|(round, round_state)| {
            round_state
                .commits
                .quorum_group(threshold)
                .map(|(hash, group)| (*round, *hash, group.state.clone(), group.envelopes.clone()))
        });
        let Some((round, state_hash, state, proof)) = found else {
            return Ok(false);
        };

        let message = Message::decide(self.height, round, state.clone(), proof);
        let envelope = self.sign_message(&message)?;
        info!(
            height = self.height,
            round,
            state = ?state_hash,
            "commit quorum reached, deciding"
        );
        if self.is_member {
            self.dispatch(Destination::Broadcast, &message, &envelope);
        }

        self.latest_decide = Some(DecideRecord {
            height: self.height,
            round,
            state,
            envelope: envelope.encode(),
        });
        self.enter_height(self.height + 1);
        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Output
    // ═══════════════════════════════════════════════════════════════════════

    fn sign_message(&self, message: &Message) -> Result<SignedMessage, ConsensusError> {
        SignedMessage::sign(message.encode(), &self.keypair)
            .map_err(|_| ConsensusError::MessageSignature)
    }

    fn dispatch(&mut self, destination: Destination, message: &Message, envelope: &SignedMessage) {
        if let Some(callback) = &self.message_out {
            callback(message, envelope);
        }
        self.outbox.push(destination, envelope.encode());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    const LATENCY: Duration = Duration::from_millis(500);

    fn keys(n: usize) -> Vec<KeyPair> {
        (0..n)
            .map(|i| KeyPair::from_seed(&[i as u8 + 1; 32]))
            .collect()
    }

    fn config_for(keys: &[KeyPair], index: usize) -> Config {
        Config {
            epoch: Some(Duration::from_secs(1)),
            current_height: 0,
            private_key: Some(keys[index].clone()),
            participants: keys.iter().map(|k| k.identity()).collect(),
            expected_latency: LATENCY,
            state_compare: Some(Box::new(|a: &[u8], b: &[u8]| a.cmp(b))),
            state_validate: Some(Box::new(|s: &[u8]| !s.is_empty())),
            ..Default::default()
        }
    }

    fn engine(keys: &[KeyPair], index: usize) -> Consensus {
        Consensus::new(config_for(keys, index)).unwrap()
    }

    fn frame(key: &KeyPair, message: &Message) -> Vec<u8> {
        SignedMessage::sign(message.encode(), key).unwrap().encode()
    }

    fn decode_outputs(outputs: Vec<(Destination, Vec<u8>)>) -> Vec<(Destination, Message)> {
        outputs
            .into_iter()
            .map(|(destination, bytes)| {
                let envelope = SignedMessage::decode(&bytes).unwrap();
                (destination, Message::decode(&envelope.message).unwrap())
            })
            .collect()
    }

    fn round_change_set(keys: &[KeyPair], height: u64, round: u64, state: &[u8]) -> Vec<SignedMessage> {
        keys.iter()
            .map(|k| {
                let msg = Message::round_change(height, round, state.to_vec(), Vec::new());
                SignedMessage::sign(msg.encode(), k).unwrap()
            })
            .collect()
    }

    fn commit_set(keys: &[KeyPair], height: u64, round: u64, state: &[u8]) -> Vec<SignedMessage> {
        keys.iter()
            .map(|k| {
                let msg = Message::commit(height, round, state.to_vec(), Vec::new());
                SignedMessage::sign(msg.encode(), k).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_round_change_broadcast_after_propose() {
        let keys = keys(4);
        let mut node = engine(&keys, 0);
        node.propose(b"alpha");
        node.update(Duration::from_millis(1)).unwrap();

        let outputs = decode_outputs(node.drain_output());
        assert_eq!(outputs.len(), 1);
        let (destination, message) = &outputs[0];
        assert_eq!(*destination, Destination::Broadcast);
        assert_eq!(message.kind, MessageKind::RoundChange);
        assert_eq!(message.height, 0);
        assert_eq!(message.round, 0);
        assert_eq!(message.state, b"alpha".to_vec());
        assert!(message.proof.is_empty());
    }

    #[test]
    fn test_silent_without_candidate() {
        let keys = keys(4);
        let mut node = engine(&keys, 0);
        node.update(Duration::from_millis(1)).unwrap();
        assert!(node.drain_output().is_empty());
    }

    #[test]
    fn test_invalid_proposal_ignored() {
        let keys = keys(4);
        let mut node = engine(&keys, 0);
        node.propose(b"");
        node.update(Duration::from_millis(1)).unwrap();
        assert!(node.drain_output().is_empty());
    }

    #[test]
    fn test_round_timeout_advances_round() {
        let keys = keys(4);
        let mut node = engine(&keys, 0);
        node.propose(b"alpha");
        node.update(Duration::from_millis(1)).unwrap();
        assert_eq!(node.round(), 0);

        node.update(Duration::from_secs(2)).unwrap();
        assert_eq!(node.round(), 1);

        let outputs = decode_outputs(node.drain_output());
        let rounds: Vec<u64> = outputs
            .iter()
            .filter(|(_, m)| m.kind == MessageKind::RoundChange)
            .map(|(_, m)| m.round)
            .collect();
        assert_eq!(rounds, vec![0, 1]);
    }

    #[test]
    fn test_backoff_doubles_deadline() {
        let keys = keys(4);
        let mut node = engine(&keys, 0);
        node.propose(b"alpha");
        node.update(Duration::from_millis(1)).unwrap();

        // Round 0 deadline: ~1ms + 500ms.
        node.update(Duration::from_millis(600)).unwrap();
        assert_eq!(node.round(), 1);

        // Round 1 deadline doubles to 1s; 1.1s after entry is not enough.
        node.update(Duration::from_millis(1500)).unwrap();
        assert_eq!(node.round(), 1);

        node.update(Duration::from_millis(1700)).unwrap();
        assert_eq!(node.round(), 2);
    }

    #[test]
    fn test_lock_after_round_change_quorum() {
        let keys = keys(4);
        let mut node = engine(&keys, 0);
        let t = Duration::from_millis(1);
        node.propose(b"s");
        node.update(t).unwrap();

        for key in &keys[1..3] {
            let msg = Message::round_change(0, 0, b"s".to_vec(), Vec::new());
            node.receive_message(&frame(key, &msg), t).unwrap();
        }

        let outputs = decode_outputs(node.drain_output());
        let lock = outputs
            .iter()
            .find(|(_, m)| m.kind == MessageKind::Lock)
            .expect("lock should be broadcast after quorum");
        assert_eq!(lock.1.state, b"s".to_vec());
        assert_eq!(lock.1.proof.len(), 3);
        assert_eq!(lock.1.state_hash, Some(Hash::of(b"s")));
    }

    #[test]
    fn test_duplicate_round_change_does_not_count_twice() {
        let keys = keys(4);
        let mut node = engine(&keys, 0);
        let t = Duration::from_millis(1);
        node.propose(b"s");
        node.update(t).unwrap();

        let msg = Message::round_change(0, 0, b"s".to_vec(), Vec::new());
        let bytes = frame(&keys[1], &msg);
        node.receive_message(&bytes, t).unwrap();
        node.receive_message(&bytes, t).unwrap();

        // Two distinct signers (self + peer 1) is below the quorum of 3.
        let outputs = decode_outputs(node.drain_output());
        assert!(outputs.iter().all(|(_, m)| m.kind != MessageKind::Lock));
    }

    #[test]
    fn test_full_height_decides() {
        let keys = keys(4);
        let mut node = engine(&keys, 0);
        let t = Duration::from_millis(1);
        node.propose(b"s");
        node.update(t).unwrap();

        for key in &keys[1..3] {
            let msg = Message::round_change(0, 0, b"s".to_vec(), Vec::new());
            node.receive_message(&frame(key, &msg), t).unwrap();
        }

        // Peers lock with the same RoundChange quorum.
        let rc_proof = round_change_set(&keys[..3], 0, 0, b"s");
        for key in &keys[1..3] {
            let msg = Message::lock(0, 0, b"s".to_vec(), rc_proof.clone());
            node.receive_message(&frame(key, &msg), t).unwrap();
        }

        // Peers commit with a Lock quorum.
        let lock_proof: Vec<SignedMessage> = keys[..3]
            .iter()
            .map(|k| {
                let msg = Message::lock(0, 0, b"s".to_vec(), rc_proof.clone());
                SignedMessage::sign(msg.encode(), k).unwrap()
            })
            .collect();
        for key in &keys[1..3] {
            let msg = Message::commit(0, 0, b"s".to_vec(), lock_proof.clone());
            node.receive_message(&frame(key, &msg), t).unwrap();
        }

        assert_eq!(node.height(), 1);
        assert_eq!(node.round(), 0);
        assert_eq!(node.current_state(), (0, 0, b"s".to_vec()));

        let outputs = decode_outputs(node.drain_output());
        let kinds: Vec<MessageKind> = outputs.iter().map(|(_, m)| m.kind).collect();
        assert!(kinds.contains(&MessageKind::Lock));
        assert!(kinds.contains(&MessageKind::Commit));
        assert!(kinds.contains(&MessageKind::Decide));

        // The decide carries a commit quorum for the decided state.
        let decide = outputs
            .iter()
            .find(|(_, m)| m.kind == MessageKind::Decide)
            .unwrap();
        assert_eq!(decide.1.height, 0);
        assert_eq!(decide.1.state, b"s".to_vec());
        assert!(decide.1.proof.len() >= 3);
    }

    #[test]
    fn test_round_inflation_rejected() {
        let keys = keys(4);
        let mut node = engine(&keys, 0);
        let t = Duration::from_millis(1);
        node.update(t).unwrap();

        let msg = Message::round_change(0, 10, b"s".to_vec(), Vec::new());
        let err = node.receive_message(&frame(&keys[1], &msg), t);
        assert_eq!(err, Err(ConsensusError::MessageRound));
        assert_eq!(node.height(), 0);
        assert_eq!(node.round(), 0);
        assert!(node.drain_output().is_empty());

        // The edge of the window is still acceptable.
        let msg = Message::round_change(0, 8, b"s".to_vec(), Vec::new());
        node.receive_message(&frame(&keys[1], &msg), t).unwrap();
    }

    #[test]
    fn test_stale_round_rejected() {
        let keys = keys(4);
        let mut node = engine(&keys, 0);
        node.propose(b"s");
        node.update(Duration::from_millis(1)).unwrap();
        node.update(Duration::from_secs(2)).unwrap();
        assert_eq!(node.round(), 1);

        let msg = Message::round_change(0, 0, b"s".to_vec(), Vec::new());
        assert_eq!(
            node.receive_message(&frame(&keys[1], &msg), Duration::from_secs(2)),
            Err(ConsensusError::MessageRound)
        );
    }

    #[test]
    fn test_height_mismatch_rejected_with_resync_request() {
        let keys = keys(4);
        let mut node = engine(&keys, 0);
        let t = Duration::from_millis(1);
        node.update(t).unwrap();

        let msg = Message::round_change(5, 0, b"s".to_vec(), Vec::new());
        assert_eq!(
            node.receive_message(&frame(&keys[1], &msg), t),
            Err(ConsensusError::MessageHeight)
        );

        let outputs = decode_outputs(node.drain_output());
        assert_eq!(outputs.len(), 1);
        let (destination, resync) = &outputs[0];
        assert_eq!(*destination, Destination::Unicast(keys[1].identity()));
        assert_eq!(resync.kind, MessageKind::Resync);
        assert_eq!(resync.height, 0);
    }

    #[test]
    fn test_resync_requests_rate_limited() {
        let keys = keys(4);
        let mut node = engine(&keys, 0);
        let t = Duration::from_millis(1);

        let msg = Message::round_change(5, 0, b"s".to_vec(), Vec::new());
        let bytes = frame(&keys[1], &msg);
        let _ = node.receive_message(&bytes, t);
        let _ = node.receive_message(&bytes, Duration::from_millis(2));

        let outputs = decode_outputs(node.drain_output());
        let resyncs = outputs
            .iter()
            .filter(|(_, m)| m.kind == MessageKind::Resync)
            .count();
        assert_eq!(resyncs, 1);
    }

    #[test]
    fn test_unknown_participant_rejected() {
        let keys = keys(4);
        let mut node = engine(&keys, 0);
        let outsider = KeyPair::from_seed(&[99u8; 32]);

        let msg = Message::round_change(0, 0, b"s".to_vec(), Vec::new());
        assert_eq!(
            node.receive_message(&frame(&outsider, &msg), Duration::from_millis(1)),
            Err(ConsensusError::MessageUnknownParticipant)
        );
    }

    #[test]
    fn test_garbage_frame_rejected() {
        let keys = keys(4);
        let mut node = engine(&keys, 0);
        assert_eq!(
            node.receive_message(&[0u8; 16], Duration::from_millis(1)),
            Err(ConsensusError::MessageDecoded)
        );
    }

    #[test]
    fn test_invalid_state_rejected() {
        let keys = keys(4);
        let mut node = engine(&keys, 0);
        let msg = Message::round_change(0, 0, Vec::new(), Vec::new());
        assert_eq!(
            node.receive_message(&frame(&keys[1], &msg), Duration::from_millis(1)),
            Err(ConsensusError::MessageState)
        );
    }

    #[test]
    fn test_decide_catchup_jumps_height() {
        let keys = keys(4);
        let mut node = engine(&keys, 0);
        let t = Duration::from_millis(1);

        let proof = commit_set(&keys[..3], 3, 0, b"s");
        let decide = Message::decide(3, 0, b"s".to_vec(), proof);
        node.receive_message(&frame(&keys[1], &decide), t).unwrap();

        assert_eq!(node.height(), 4);
        assert_eq!(node.round(), 0);
        assert_eq!(node.current_state(), (3, 0, b"s".to_vec()));
    }

    #[test]
    fn test_stale_decide_accepted_but_ignored() {
        let keys = keys(4);
        let mut node = engine(&keys, 0);
        let t = Duration::from_millis(1);

        // Jump to height 4 first.
        let proof = commit_set(&keys[..3], 3, 0, b"s");
        let decide = Message::decide(3, 0, b"s".to_vec(), proof);
        node.receive_message(&frame(&keys[1], &decide), t).unwrap();
        assert_eq!(node.height(), 4);

        // A replayed decide for an earlier height is accepted without regress.
        let proof = commit_set(&keys[..3], 1, 0, b"old");
        let decide = Message::decide(1, 0, b"old".to_vec(), proof);
        node.receive_message(&frame(&keys[1], &decide), t).unwrap();
        assert_eq!(node.height(), 4);
        assert_eq!(node.current_state(), (3, 0, b"s".to_vec()));

        // A decide for the current height still advances.
        let proof = commit_set(&keys[..3], 4, 0, b"next");
        let decide = Message::decide(4, 0, b"next".to_vec(), proof);
        node.receive_message(&frame(&keys[1], &decide), t).unwrap();
        assert_eq!(node.height(), 5);
    }

    #[test]
    fn test_decide_with_bad_proof_rejected() {
        let keys = keys(4);
        let mut node = engine(&keys, 0);

        // Only two distinct commit signers.
        let proof = commit_set(&keys[..2], 3, 0, b"s");
        let decide = Message::decide(3, 0, b"s".to_vec(), proof);
        assert_eq!(
            node.receive_message(&frame(&keys[1], &decide), Duration::from_millis(1)),
            Err(ConsensusError::MessageProof)
        );
        assert_eq!(node.height(), 0);
    }

    #[test]
    fn test_resync_answered_with_latest_decide() {
        let keys = keys(4);
        let mut node = engine(&keys, 0);
        let t = Duration::from_millis(1);

        let proof = commit_set(&keys[..3], 3, 0, b"s");
        let decide = Message::decide(3, 0, b"s".to_vec(), proof);
        node.receive_message(&frame(&keys[1], &decide), t).unwrap();
        node.drain_output();

        let resync = Message::resync(0, 0);
        node.receive_message(&frame(&keys[2], &resync), t).unwrap();

        let outputs = node.drain_output();
        assert_eq!(outputs.len(), 1);
        let (destination, bytes) = &outputs[0];
        assert_eq!(*destination, Destination::Unicast(keys[2].identity()));
        let (height, round, state) = node.validate_decide_message(bytes).unwrap();
        assert_eq!((height, round, state), (3, 0, b"s".to_vec()));
    }

    #[test]
    fn test_resync_unanswered_without_decide() {
        let keys = keys(4);
        let mut node = engine(&keys, 0);
        let resync = Message::resync(0, 0);
        node.receive_message(&frame(&keys[2], &resync), Duration::from_millis(1))
            .unwrap();
        assert!(node.drain_output().is_empty());
    }

    #[test]
    fn test_validate_decide_message() {
        let keys = keys(4);
        let node = engine(&keys, 0);

        let proof = commit_set(&keys[..3], 7, 2, b"s");
        let decide = Message::decide(7, 2, b"s".to_vec(), proof);
        let bytes = frame(&keys[1], &decide);
        assert_eq!(
            node.validate_decide_message(&bytes),
            Ok((7, 2, b"s".to_vec()))
        );

        // A non-decide frame is not a decide message.
        let rc = Message::round_change(7, 2, b"s".to_vec(), Vec::new());
        assert_eq!(
            node.validate_decide_message(&frame(&keys[1], &rc)),
            Err(ConsensusError::MessageDecoded)
        );
    }

    #[test]
    fn test_lock_adoption_pulls_round_forward() {
        let keys = keys(4);
        let mut node = engine(&keys, 0);
        let t = Duration::from_millis(1);
        node.update(t).unwrap();

        // A lock at round 2 carries a RoundChange quorum for round 2; the
        // absorbed quorum pulls us to that round.
        let rc_proof = round_change_set(&keys[..3], 0, 2, b"s");
        let lock = Message::lock(0, 2, b"s".to_vec(), rc_proof);
        node.receive_message(&frame(&keys[1], &lock), t).unwrap();

        assert_eq!(node.round(), 2);

        // Our next roundchange carries the adopted lock state.
        let outputs = decode_outputs(node.drain_output());
        let rc = outputs
            .iter()
            .find(|(_, m)| m.kind == MessageKind::RoundChange && m.round == 2)
            .expect("roundchange for the synced round");
        assert_eq!(rc.1.state, b"s".to_vec());
    }

    #[test]
    fn test_round_sync_on_round_change_quorum() {
        let keys = keys(4);
        let mut node = engine(&keys, 0);
        let t = Duration::from_millis(1);
        node.update(t).unwrap();

        for key in &keys[1..4] {
            let msg = Message::round_change(0, 3, b"s".to_vec(), Vec::new());
            node.receive_message(&frame(key, &msg), t).unwrap();
        }

        assert_eq!(node.round(), 3);
    }

    #[test]
    fn test_commit_unicast_targets_leader() {
        let keys = keys(4);
        let mut config = config_for(&keys, 0);
        config.enable_commit_unicast = true;
        let mut node = Consensus::new(config).unwrap();
        let t = Duration::from_millis(1);
        node.propose(b"s");
        node.update(t).unwrap();

        for key in &keys[1..3] {
            let msg = Message::round_change(0, 0, b"s".to_vec(), Vec::new());
            node.receive_message(&frame(key, &msg), t).unwrap();
        }
        let rc_proof = round_change_set(&keys[..3], 0, 0, b"s");
        for key in &keys[1..3] {
            let msg = Message::lock(0, 0, b"s".to_vec(), rc_proof.clone());
            node.receive_message(&frame(key, &msg), t).unwrap();
        }

        let participants =
            ParticipantSet::new(keys.iter().map(|k| k.identity()).collect::<Vec<_>>());
        let leader = participants.leader_for(1000, 0, 0);

        let outputs = decode_outputs(node.drain_output());
        let commits: Vec<&(Destination, Message)> = outputs
            .iter()
            .filter(|(_, m)| m.kind == MessageKind::Commit)
            .collect();
        if leader == node.identity() {
            // Leader keeps its own commit local.
            assert!(commits.is_empty());
        } else {
            assert_eq!(commits.len(), 1);
            assert_eq!(commits[0].0, Destination::Unicast(leader));
        }
    }

    #[test]
    fn test_external_validator_vetoes() {
        let keys = keys(4);
        let mut config = config_for(&keys, 0);
        config.message_validator = Some(Box::new(|_, _| false));
        let mut node = Consensus::new(config).unwrap();

        let msg = Message::round_change(0, 0, b"s".to_vec(), Vec::new());
        assert_eq!(
            node.receive_message(&frame(&keys[1], &msg), Duration::from_millis(1)),
            Err(ConsensusError::MessageValidator)
        );
    }

    #[test]
    fn test_message_out_callback_observes_outbound() {
        let keys = keys(4);
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let mut config = config_for(&keys, 0);
        config.message_out_callback = Some(Box::new(move |_, _| {
            seen.fetch_add(1, AtomicOrdering::SeqCst);
        }));
        let mut node = Consensus::new(config).unwrap();
        node.propose(b"s");
        node.update(Duration::from_millis(1)).unwrap();

        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(node.drain_output().len(), 1);
    }

    #[test]
    fn test_observer_never_emits() {
        let keys = keys(5);
        // Participants are keys 1..=4; our key 0 is an observer.
        let mut config = config_for(&keys, 0);
        config.participants = keys[1..].iter().map(|k| k.identity()).collect();
        let mut node = Consensus::new(config).unwrap();
        let t = Duration::from_millis(1);
        node.propose(b"s");
        node.update(t).unwrap();
        assert!(node.drain_output().is_empty());

        // It still follows decides.
        let proof = commit_set(&keys[1..4], 0, 0, b"s");
        let decide = Message::decide(0, 0, b"s".to_vec(), proof);
        node.receive_message(&frame(&keys[1], &decide), t).unwrap();
        assert_eq!(node.height(), 1);
    }

    #[test]
    fn test_proposal_cleared_on_height_advance() {
        let keys = keys(4);
        let mut node = engine(&keys, 0);
        let t = Duration::from_millis(1);
        node.propose(b"s");
        node.update(t).unwrap();
        node.drain_output();

        let proof = commit_set(&keys[..3], 0, 0, b"other");
        let decide = Message::decide(0, 0, b"other".to_vec(), proof);
        node.receive_message(&frame(&keys[1], &decide), t).unwrap();
        assert_eq!(node.height(), 1);

        // No proposal at the new height: nothing to broadcast.
        node.update(Duration::from_millis(2)).unwrap();
        let outputs = decode_outputs(node.drain_output());
        assert!(outputs
            .iter()
            .all(|(_, m)| m.kind != MessageKind::RoundChange || m.height == 0));
    }

    #[test]
    fn test_deterministic_outputs() {
        let keys = keys(4);
        let run = || {
            let mut node = engine(&keys, 0);
            let t = Duration::from_millis(1);
            node.propose(b"s");
            node.update(t).unwrap();
            for key in &keys[1..3] {
                let msg = Message::round_change(0, 0, b"s".to_vec(), Vec::new());
                node.receive_message(&frame(key, &msg), t).unwrap();
            }
            node.update(Duration::from_secs(3)).unwrap();
            node.drain_output()
        };

        let a = run();
        let b = run();
        assert_eq!(a, b);
    }
}
