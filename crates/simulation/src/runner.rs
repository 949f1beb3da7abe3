//! Deterministic simulation runner.
//!
//! Owns a set of consensus engines and a time-ordered delivery queue.
//! Each tick the runner delivers due messages, calls `update` on every
//! engine, and routes drained envelopes back through the simulated network.
//! With the same seed and the same scripted inputs, every run is
//! byte-for-byte identical.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::trace;

use bdls_consensus::{Config, Consensus, Destination};
use bdls_types::{Identity, KeyPair};

use crate::network::{NetworkConfig, SimulatedNetwork};
use crate::NodeIndex;

/// Simulation clock granularity.
const TICK: Duration = Duration::from_millis(1);

/// One routed envelope, kept for determinism comparisons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficRecord {
    /// Send time.
    pub at: Duration,
    /// Sending node.
    pub from: NodeIndex,
    /// Receiving node.
    pub to: NodeIndex,
    /// Envelope bytes.
    pub bytes: Vec<u8>,
}

struct NodeHandle {
    engine: Consensus,
    /// Every decision observed on this node, in order.
    decisions: Vec<(u64, u64, Vec<u8>)>,
}

/// Drives N consensus engines over a simulated network.
pub struct SimulationRunner {
    nodes: Vec<NodeHandle>,
    identities: Vec<Identity>,
    network: SimulatedNetwork,
    rng: ChaCha8Rng,
    /// (deliver_at, sequence) → (receiver, bytes). The sequence number keeps
    /// simultaneous deliveries ordered.
    pending: BTreeMap<(Duration, u64), (NodeIndex, Vec<u8>)>,
    sequence: u64,
    now: Duration,
    traffic: Vec<TrafficRecord>,
}

impl SimulationRunner {
    /// Create a runner with one engine per configured node.
    ///
    /// Node `i` signs with the deterministic seed `i + 1`, so clusters built
    /// from the same configuration are identical across runs.
    pub fn new(network_config: NetworkConfig, seed: u64) -> Self {
        let keypairs: Vec<KeyPair> = (0..network_config.nodes)
            .map(|i| KeyPair::from_seed(&[i as u8 + 1; 32]))
            .collect();
        let identities: Vec<Identity> = keypairs.iter().map(|k| k.identity()).collect();

        let nodes = keypairs
            .iter()
            .map(|keypair| {
                let config = Config {
                    epoch: Some(Duration::from_secs(1)),
                    private_key: Some(keypair.clone()),
                    participants: identities.clone(),
                    state_compare: Some(Box::new(|a: &[u8], b: &[u8]| a.cmp(b))),
                    state_validate: Some(Box::new(|s: &[u8]| !s.is_empty())),
                    ..Default::default()
                };
                NodeHandle {
                    engine: Consensus::new(config).expect("valid simulation config"),
                    decisions: Vec::new(),
                }
            })
            .collect();

        Self {
            nodes,
            identities,
            network: SimulatedNetwork::new(network_config),
            rng: ChaCha8Rng::seed_from_u64(seed),
            pending: BTreeMap::new(),
            sequence: 0,
            now: Duration::ZERO,
            traffic: Vec::new(),
        }
    }

    // ─── Accessors ───

    /// The engine of a node.
    pub fn node(&self, index: NodeIndex) -> &Consensus {
        &self.nodes[index as usize].engine
    }

    /// Decisions observed on a node so far, in order.
    pub fn decisions(&self, index: NodeIndex) -> &[(u64, u64, Vec<u8>)] {
        &self.nodes[index as usize].decisions
    }

    /// Participant identities in node order.
    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    /// The simulated network, for partitions and loss injection.
    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    /// Current simulated time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// All routed traffic so far.
    pub fn traffic(&self) -> &[TrafficRecord] {
        &self.traffic
    }

    // ─── Scripted inputs ───

    /// Propose a state on one node.
    pub fn propose(&mut self, index: NodeIndex, state: &[u8]) {
        self.nodes[index as usize].engine.propose(state);
    }

    /// Propose the same state on every node.
    pub fn propose_all(&mut self, state: &[u8]) {
        for node in &mut self.nodes {
            node.engine.propose(state);
        }
    }

    /// Adjust the expected latency (round deadline base) on every engine.
    pub fn set_expected_latency(&mut self, latency: Duration) {
        for node in &mut self.nodes {
            node.engine.set_latency(latency);
        }
    }

    // ─── Execution ───

    /// Advance simulated time until `deadline`.
    pub fn run_until(&mut self, deadline: Duration) {
        while self.now < deadline {
            self.now += TICK;
            self.deliver_due();
            for index in 0..self.nodes.len() as NodeIndex {
                let _ = self.nodes[index as usize].engine.update(self.now);
                self.collect(index);
            }
        }
    }

    /// Advance simulated time by `duration`.
    pub fn run_for(&mut self, duration: Duration) {
        let deadline = self.now + duration;
        self.run_until(deadline);
    }

    fn deliver_due(&mut self) {
        loop {
            let due = match self.pending.first_key_value() {
                Some((key, _)) if key.0 <= self.now => *key,
                _ => break,
            };
            if let Some((to, bytes)) = self.pending.remove(&due) {
                let result = self.nodes[to as usize]
                    .engine
                    .receive_message(&bytes, self.now);
                if let Err(error) = result {
                    trace!(node = to, %error, "message dropped");
                }
                self.collect(to);
            }
        }
    }

    /// Record any new decision and route drained output.
    fn collect(&mut self, index: NodeIndex) {
        let node = &mut self.nodes[index as usize];

        let (height, round, state) = node.engine.current_state();
        if !state.is_empty() {
            let is_new = node
                .decisions
                .last()
                .map_or(true, |last| last.0 != height);
            if is_new {
                node.decisions.push((height, round, state));
            }
        }

        let outputs = node.engine.drain_output();
        for (destination, bytes) in outputs {
            match destination {
                Destination::Broadcast => {
                    for to in 0..self.nodes.len() as NodeIndex {
                        if to != index {
                            self.route(index, to, bytes.clone());
                        }
                    }
                }
                Destination::Unicast(identity) => {
                    if let Some(to) = self.index_of(&identity) {
                        self.route(index, to, bytes.clone());
                    }
                }
            }
        }
    }

    fn route(&mut self, from: NodeIndex, to: NodeIndex, bytes: Vec<u8>) {
        let Some(latency) = self.network.should_deliver(from, to, &mut self.rng) else {
            return;
        };
        self.traffic.push(TrafficRecord {
            at: self.now,
            from,
            to,
            bytes: bytes.clone(),
        });
        self.sequence += 1;
        self.pending
            .insert((self.now + latency, self.sequence), (to, bytes));
    }

    fn index_of(&self, identity: &Identity) -> Option<NodeIndex> {
        self.identities
            .iter()
            .position(|id| id == identity)
            .map(|i| i as NodeIndex)
    }

    // ─── Invariant helpers ───

    /// Panic if any two nodes decided different states for the same height.
    pub fn assert_agreement(&self) {
        let mut by_height: BTreeMap<u64, (NodeIndex, &[u8])> = BTreeMap::new();
        for (index, node) in self.nodes.iter().enumerate() {
            for (height, _, state) in &node.decisions {
                match by_height.get(height) {
                    Some((first, expected)) => assert_eq!(
                        expected,
                        &state.as_slice(),
                        "nodes {} and {} disagree at height {}",
                        first,
                        index,
                        height
                    ),
                    None => {
                        by_height.insert(*height, (index as NodeIndex, state));
                    }
                }
            }
        }
    }

    /// True when every node has recorded a decision for `height`.
    pub fn all_decided(&self, height: u64) -> bool {
        self.nodes
            .iter()
            .all(|node| node.decisions.iter().any(|(h, _, _)| *h == height))
    }
}
