//! Per-round vote bookkeeping.
//!
//! Everything is keyed by `BTreeMap`/`BTreeSet` so iteration over tallies is
//! deterministic across engines processing the same inputs.

use std::collections::{BTreeMap, BTreeSet};

use bdls_messages::SignedMessage;
use bdls_types::{Hash, Identity};
use tracing::warn;

/// Envelopes of one phase that carry the same (height, round, state),
/// deduplicated by signer.
#[derive(Debug, Clone)]
pub(crate) struct StateGroup {
    /// The carried state bytes.
    pub state: Vec<u8>,
    /// Envelopes in arrival order (arrival order is part of the engine's
    /// deterministic input, so proof sets built from it are reproducible).
    pub envelopes: Vec<SignedMessage>,
    /// Distinct signers contributing to this group.
    pub signers: BTreeSet<Identity>,
    /// Highest lock-justification round attached to any RoundChange in this
    /// group; feeds the MaxLock selection.
    pub max_justification: Option<u64>,
}

impl StateGroup {
    fn new(state: Vec<u8>) -> Self {
        Self {
            state,
            envelopes: Vec::new(),
            signers: BTreeSet::new(),
            max_justification: None,
        }
    }
}

/// One phase's tally: signer → state hash, plus per-state groups.
#[derive(Debug, Default)]
pub(crate) struct PhaseTally {
    by_signer: BTreeMap<Identity, Hash>,
    pub groups: BTreeMap<Hash, StateGroup>,
}

impl PhaseTally {
    /// Record an envelope. Returns `false` when the signer already
    /// contributed this phase (duplicates and equivocations are dropped).
    fn add(
        &mut self,
        signer: Identity,
        state_hash: Hash,
        state: &[u8],
        envelope: SignedMessage,
        justification: Option<u64>,
        phase: &'static str,
    ) -> bool {
        if let Some(existing) = self.by_signer.get(&signer) {
            if *existing != state_hash {
                warn!(?signer, phase, "equivocation attempt dropped");
            }
            return false;
        }
        self.by_signer.insert(signer, state_hash);

        let group = self
            .groups
            .entry(state_hash)
            .or_insert_with(|| StateGroup::new(state.to_vec()));
        group.signers.insert(signer);
        group.envelopes.push(envelope);
        if justification > group.max_justification {
            group.max_justification = justification;
        }
        true
    }

    /// Number of distinct signers across all states this phase.
    pub fn distinct_signers(&self) -> usize {
        self.by_signer.len()
    }

    /// The first group (in state-hash order) reaching `threshold` distinct
    /// signers. At most one group can reach a quorum per phase because each
    /// signer counts once.
    pub fn quorum_group(&self, threshold: usize) -> Option<(&Hash, &StateGroup)> {
        self.groups
            .iter()
            .find(|(_, group)| group.signers.len() >= threshold)
    }
}

/// State held for a single (height, round).
#[derive(Debug, Default)]
pub(crate) struct RoundState {
    pub round_changes: PhaseTally,
    pub locks: PhaseTally,
    pub commits: PhaseTally,

    /// Phase-message emission flags; each phase broadcasts at most once per
    /// round.
    pub sent_round_change: bool,
    pub sent_lock: bool,
    pub sent_commit: bool,

    /// Whether the one-shot entry evaluation of the RoundChange candidate
    /// has run for this round.
    pub entry_evaluated: bool,
}

impl RoundState {
    pub fn add_round_change(
        &mut self,
        signer: Identity,
        state_hash: Hash,
        state: &[u8],
        envelope: SignedMessage,
        justification: Option<u64>,
    ) -> bool {
        self.round_changes
            .add(signer, state_hash, state, envelope, justification, "roundchange")
    }

    pub fn add_lock(
        &mut self,
        signer: Identity,
        state_hash: Hash,
        state: &[u8],
        envelope: SignedMessage,
    ) -> bool {
        self.locks
            .add(signer, state_hash, state, envelope, None, "lock")
    }

    pub fn add_commit(
        &mut self,
        signer: Identity,
        state_hash: Hash,
        state: &[u8],
        envelope: SignedMessage,
    ) -> bool {
        self.commits
            .add(signer, state_hash, state, envelope, None, "commit")
    }
}

/// The local lock: the state this participant is pinned to, with the
/// RoundChange proof set that justifies it. Raised only to strictly higher
/// rounds.
#[derive(Debug, Clone)]
pub(crate) struct LockRecord {
    pub round: u64,
    pub state: Vec<u8>,
    pub state_hash: Hash,
    pub proof: Vec<SignedMessage>,
}
