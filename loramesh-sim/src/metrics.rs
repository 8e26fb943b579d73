//! Metrics collection for simulation analysis.

use hashbrown::HashMap;
use loramesh::{DevAddr, DeviceRole, Timestamp};

use crate::NodeIndex;

/// Mesh state of one node at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    pub dev_addr: DevAddr,
    pub role: DeviceRole,
    /// Coordinator the node follows, 0 if none.
    pub coordinator: DevAddr,
    pub parent: Option<DevAddr>,
    pub children: usize,
}

/// A snapshot of mesh state at a point in time.
#[derive(Debug, Clone)]
pub struct MeshSnapshot {
    pub time: Timestamp,
    pub nodes: HashMap<NodeIndex, NodeState>,
}

impl MeshSnapshot {
    pub fn new(time: Timestamp) -> Self {
        Self {
            time,
            nodes: HashMap::new(),
        }
    }

    pub fn record_node(&mut self, index: NodeIndex, state: NodeState) {
        self.nodes.insert(index, state);
    }

    /// Distinct coordinators followed by started nodes, ascending.
    pub fn coordinators(&self) -> Vec<DevAddr> {
        let mut coordinators: Vec<DevAddr> = self.nodes.values().map(|s| s.coordinator).collect();
        coordinators.sort_unstable();
        coordinators.dedup();
        coordinators
    }

    /// The coordinator everybody follows, if there is exactly one.
    pub fn coordinator(&self) -> Option<DevAddr> {
        match self.coordinators().as_slice() {
            [single] if *single != 0 => Some(*single),
            _ => None,
        }
    }

    /// Nodes holding the coordinator role.
    pub fn coordinator_roles(&self) -> Vec<NodeIndex> {
        let mut result: Vec<NodeIndex> = self
            .nodes
            .iter()
            .filter(|(_, s)| s.role == DeviceRole::Coordinator)
            .map(|(&i, _)| i)
            .collect();
        result.sort_unstable();
        result
    }

    /// One coordinator known to all, and exactly one node claims the role.
    pub fn converged(&self) -> bool {
        self.coordinator().is_some() && self.coordinator_roles().len() == 1
    }

    pub fn total_children(&self) -> usize {
        self.nodes.values().map(|s| s.children).sum()
    }
}

/// Simulation metrics collected over time.
#[derive(Debug, Clone, Default)]
pub struct SimMetrics {
    /// Frames put on air.
    pub frames_sent: u64,
    /// Frames lost to link loss.
    pub frames_dropped: u64,
    /// Frames accepted by a listening radio.
    pub frames_delivered: u64,
    /// Frames that arrived while the receiver was not listening.
    pub frames_missed: u64,
    pub snapshots: Vec<MeshSnapshot>,
}

impl SimMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_snapshot(&mut self, snapshot: MeshSnapshot) {
        self.snapshots.push(snapshot);
    }

    /// First snapshot time at which the mesh had converged.
    pub fn convergence_time(&self) -> Option<Timestamp> {
        self.snapshots
            .iter()
            .find(|s| s.converged())
            .map(|s| s.time)
    }

    pub fn latest_snapshot(&self) -> Option<&MeshSnapshot> {
        self.snapshots.last()
    }
}

/// Result of running a simulation.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub end_time: Timestamp,
    pub metrics: SimMetrics,
    /// Whether the run ended because no events were left.
    pub queue_exhausted: bool,
}

impl SimulationResult {
    /// Whether the final snapshot shows a single coordinator.
    pub fn converged(&self) -> bool {
        self.metrics
            .latest_snapshot()
            .is_some_and(MeshSnapshot::converged)
    }

    pub fn final_coordinator(&self) -> Option<DevAddr> {
        self.metrics
            .latest_snapshot()
            .and_then(MeshSnapshot::coordinator)
    }
}
