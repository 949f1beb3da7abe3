//! Participant registry: quorum arithmetic and the leader rule.

use std::collections::BTreeMap;

use crate::hash::Hash;
use crate::identity::Identity;

/// The fixed, ordered set of consensus participants.
///
/// Built once at engine construction; the enumeration order is the order
/// given in configuration and never changes, so every derived quantity
/// (indices, leader rotation) is identical on every correctly configured
/// node.
#[derive(Debug, Clone)]
pub struct ParticipantSet {
    participants: Vec<Identity>,
    index: BTreeMap<Identity, usize>,
}

impl ParticipantSet {
    /// Build the registry from the configured enumeration order.
    ///
    /// A duplicated identity keeps its first index; quorum counting is by
    /// distinct identity so duplicates never inflate voting power.
    pub fn new(participants: Vec<Identity>) -> Self {
        let mut index = BTreeMap::new();
        for (i, id) in participants.iter().enumerate() {
            index.entry(*id).or_insert(i);
        }
        Self {
            participants,
            index,
        }
    }

    /// Number of participants n.
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    /// True when the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Membership test.
    pub fn contains(&self, identity: &Identity) -> bool {
        self.index.contains_key(identity)
    }

    /// Index of a participant in enumeration order.
    pub fn index_of(&self, identity: &Identity) -> Option<usize> {
        self.index.get(identity).copied()
    }

    /// Participant at a given index.
    pub fn get(&self, index: usize) -> Option<&Identity> {
        self.participants.get(index)
    }

    /// Iterate participants in enumeration order.
    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.participants.iter()
    }

    /// Maximum tolerated Byzantine participants: f = ⌊(n−1)/3⌋.
    pub fn max_faulty(&self) -> usize {
        self.participants.len().saturating_sub(1) / 3
    }

    /// Quorum threshold: T = n − f, i.e. at least 2f+1 distinct signers.
    pub fn quorum(&self) -> usize {
        self.participants.len() - self.max_faulty()
    }

    /// Deterministic leader for a (height, round) pair.
    ///
    /// `L(h, r) = keyed-blake2b(epoch, h ‖ r) mod n`, indexing the
    /// enumeration order. Any node with the same configuration computes the
    /// same leader.
    pub fn leader_for(&self, epoch_millis: u64, height: u64, round: u64) -> Identity {
        let mut input = [0u8; 16];
        input[..8].copy_from_slice(&height.to_le_bytes());
        input[8..].copy_from_slice(&round.to_le_bytes());
        let digest = Hash::keyed(&epoch_millis.to_le_bytes(), &input);
        let index = (digest.as_u64() % self.participants.len() as u64) as usize;
        self.participants[index]
    }

    /// Check whether an identity leads the given (height, round).
    pub fn is_leader(&self, identity: &Identity, epoch_millis: u64, height: u64, round: u64) -> bool {
        self.leader_for(epoch_millis, height, round) == *identity
    }
}
