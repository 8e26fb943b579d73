//! Event types and priority queue ordering for discrete event simulation.

use std::cmp::Ordering;

use loramesh::{Duration, Timestamp};

use crate::NodeIndex;

/// Unique sequence number for deterministic event ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Scenario actions that can be scheduled during simulation.
#[derive(Debug, Clone)]
pub enum ScenarioAction {
    /// Partition the network into isolated groups.
    Partition { groups: Vec<Vec<NodeIndex>> },
    /// Heal all partitions (restore full connectivity).
    HealPartition,
    /// Disable a specific link.
    DisableLink { from: NodeIndex, to: NodeIndex },
    /// Enable a specific link.
    EnableLink { from: NodeIndex, to: NodeIndex },
    /// Set loss rate on a link.
    SetLossRate {
        from: NodeIndex,
        to: NodeIndex,
        rate: f64,
    },
    /// Ask the node to join the mesh below its best neighbour.
    JoinMesh {
        node: NodeIndex,
        periodicity: Duration,
    },
    /// Record application payloads arriving on `port`.
    Listen { node: NodeIndex, port: u8 },
    /// Reserve recurring uplink slots.
    RegisterTransmission {
        node: NodeIndex,
        port: u8,
        interval: Duration,
    },
    /// Queue a payload for the next uplink slot of `port`.
    QueueUplink {
        node: NodeIndex,
        port: u8,
        payload: Vec<u8>,
        confirmed: bool,
    },
    /// Take a mesh snapshot for metrics.
    TakeSnapshot,
}

/// Events in the discrete event simulation.
#[derive(Debug, Clone)]
pub enum Event {
    /// The node powers up; its superframe starts now.
    NodeStart { node: NodeIndex },
    /// Poll a node at the time it asked for.
    Wake { node: NodeIndex },
    /// A frame reaches a node's antenna.
    FrameDelivery {
        to: NodeIndex,
        from: NodeIndex,
        data: Vec<u8>,
        rssi: i16,
    },
    /// A transmission finished.
    TxDone { node: NodeIndex },
    /// A single reception window closed without a frame.
    RxTimeout { node: NodeIndex, generation: u64 },
    /// Execute a scenario action.
    ScenarioAction(ScenarioAction),
}

/// A scheduled event with timestamp and sequence number for ordering.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    /// When the event should occur.
    pub time: Timestamp,
    /// Sequence number for deterministic ordering of same-time events.
    pub seq: SequenceNumber,
    /// The event to process.
    pub event: Event,
}

impl ScheduledEvent {
    pub fn new(time: Timestamp, seq: SequenceNumber, event: Event) -> Self {
        Self { time, seq, event }
    }
}

// Implement ordering for min-heap (BinaryHeap is max-heap, so we reverse).
impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earlier time first, then lower sequence number.
        match other.time.cmp(&self.time) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}
