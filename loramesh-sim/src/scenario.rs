//! Scenario builder for setting up and running simulations.

use loramesh::device::DebugFlags;
use loramesh::traits::test_impls::FixedPosition;
use loramesh::{
    AlwaysElect, DeviceClass, Duration, MeshSettings, Position, Result, Timestamp,
    WeightedElection,
};

use crate::event::ScenarioAction;
use crate::metrics::SimulationResult;
use crate::sim::Simulator;
use crate::topology::{Link, Topology};
use crate::NodeIndex;

/// Type of topology to generate.
#[derive(Debug, Clone)]
enum TopologyType {
    FullyConnected,
    Chain,
    /// First node is the hub.
    Star,
    Custom(Topology),
}

/// Coordinator election policy installed on every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElectionMode {
    /// Rank and distance weighted, randomised.
    #[default]
    Weighted,
    /// Always nominate, always accept.
    AlwaysElect,
}

/// Builder for simulation scenarios.
///
/// Nodes power up one `stagger` apart, node 0 first, so node 0 holds the
/// lowest address and is the first to beacon.
pub struct ScenarioBuilder {
    num_nodes: usize,
    seed: u64,
    stagger: Duration,
    class: DeviceClass,
    election: ElectionMode,
    duty_cycle: bool,
    topology_type: TopologyType,
    positions: Vec<Position>,
    loss_rate: f64,
    delay: Duration,
    actions: Vec<(Timestamp, ScenarioAction)>,
    snapshot_interval: Option<Duration>,
}

impl Default for ScenarioBuilder {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ScenarioBuilder {
    /// Create a fully connected scenario with `num_nodes` class C nodes.
    pub fn new(num_nodes: usize) -> Self {
        Self {
            num_nodes,
            seed: 42,
            stagger: Duration::from_secs(1),
            class: DeviceClass::C,
            election: ElectionMode::default(),
            duty_cycle: false,
            topology_type: TopologyType::FullyConnected,
            positions: Vec::new(),
            loss_rate: 0.0,
            delay: Duration::from_millis(1),
            actions: Vec::new(),
            snapshot_interval: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Time between consecutive node power-ups.
    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }

    pub fn with_class(mut self, class: DeviceClass) -> Self {
        self.class = class;
        self
    }

    pub fn with_election(mut self, election: ElectionMode) -> Self {
        self.election = election;
        self
    }

    /// Enforce the regional duty-cycle limits (off by default).
    pub fn with_duty_cycle(mut self, enforce: bool) -> Self {
        self.duty_cycle = enforce;
        self
    }

    /// Fixed positions by node index; nodes beyond the list have none.
    pub fn with_positions(mut self, positions: Vec<Position>) -> Self {
        self.positions = positions;
        self
    }

    pub fn topology(mut self, topo: Topology) -> Self {
        self.topology_type = TopologyType::Custom(topo);
        self
    }

    pub fn fully_connected(mut self) -> Self {
        self.topology_type = TopologyType::FullyConnected;
        self
    }

    pub fn chain_topology(mut self) -> Self {
        self.topology_type = TopologyType::Chain;
        self
    }

    pub fn star_topology(mut self) -> Self {
        self.topology_type = TopologyType::Star;
        self
    }

    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = Some(interval);
        self
    }

    pub fn action_at(mut self, time: Timestamp, action: ScenarioAction) -> Self {
        self.actions.push((time, action));
        self
    }

    pub fn partition_at(self, time: Timestamp, groups: Vec<Vec<NodeIndex>>) -> Self {
        self.action_at(time, ScenarioAction::Partition { groups })
    }

    pub fn heal_at(self, time: Timestamp) -> Self {
        self.action_at(time, ScenarioAction::HealPartition)
    }

    pub fn snapshot_at(self, time: Timestamp) -> Self {
        self.action_at(time, ScenarioAction::TakeSnapshot)
    }

    pub fn listen_at(self, time: Timestamp, node: NodeIndex, port: u8) -> Self {
        self.action_at(time, ScenarioAction::Listen { node, port })
    }

    pub fn join_mesh_at(self, time: Timestamp, node: NodeIndex, periodicity: Duration) -> Self {
        self.action_at(time, ScenarioAction::JoinMesh { node, periodicity })
    }

    pub fn register_transmission_at(
        self,
        time: Timestamp,
        node: NodeIndex,
        port: u8,
        interval: Duration,
    ) -> Self {
        self.action_at(
            time,
            ScenarioAction::RegisterTransmission {
                node,
                port,
                interval,
            },
        )
    }

    pub fn uplink_at(self, time: Timestamp, node: NodeIndex, port: u8, payload: &[u8]) -> Self {
        self.action_at(
            time,
            ScenarioAction::QueueUplink {
                node,
                port,
                payload: payload.to_vec(),
                confirmed: false,
            },
        )
    }

    fn settings(&self) -> MeshSettings {
        let settings = MeshSettings::new().with_class(self.class);
        if self.duty_cycle {
            settings
        } else {
            settings.with_debug(DebugFlags::DUTY_CYCLE_OVERRIDE)
        }
    }

    /// Build the simulator with all nodes, topology and actions.
    pub fn build(self) -> Result<Simulator> {
        let link = Link::default()
            .with_loss_rate(self.loss_rate)
            .with_delay(self.delay);
        let topo = match self.topology_type.clone() {
            TopologyType::FullyConnected => Topology::fully_connected(self.num_nodes, link),
            TopologyType::Chain => Topology::chain(self.num_nodes, link),
            TopologyType::Star => Topology::star(self.num_nodes, link),
            TopologyType::Custom(t) => t,
        };

        let mut sim = Simulator::new(self.seed).with_topology(topo);
        if let Some(interval) = self.snapshot_interval {
            sim = sim.with_snapshot_interval(interval);
        }

        for i in 0..self.num_nodes {
            let start = Timestamp::ZERO + self.stagger.saturating_mul(i as u64);
            let position = FixedPosition(self.positions.get(i).copied());
            let node_seed = self.seed.wrapping_add(i as u64 * 1000);
            let index = sim.add_node(self.settings(), node_seed, start, position)?;
            if let Some(node) = sim.node_mut(index) {
                match self.election {
                    ElectionMode::Weighted => node.inner_mut().set_election_policy(WeightedElection),
                    ElectionMode::AlwaysElect => node.inner_mut().set_election_policy(AlwaysElect),
                }
            }
        }

        for (time, action) in self.actions {
            sim.schedule_action(time, action);
        }
        Ok(sim)
    }

    /// Build and run the simulation for the specified duration.
    pub fn run_for(self, duration: Duration) -> Result<SimulationResult> {
        let mut sim = self.build()?;
        Ok(sim.run_for(duration))
    }

    /// Build and run until the specified time.
    pub fn run_until(self, time: Timestamp) -> Result<SimulationResult> {
        let mut sim = self.build()?;
        Ok(sim.run_until(time))
    }
}

/// N fully connected class C nodes.
pub fn simple_scenario(num_nodes: usize) -> ScenarioBuilder {
    ScenarioBuilder::new(num_nodes).fully_connected()
}

#[cfg(test)]
mod tests {
    use loramesh::DeviceRole;

    use super::*;
    use crate::node::sim_address;

    #[test]
    fn test_scenario_builder_basic() {
        let sim = ScenarioBuilder::new(3).with_seed(123).build().unwrap();
        assert_eq!(sim.nodes().len(), 3);
        assert_eq!(sim.nodes()[2].start_at, Timestamp::from_secs(2));
        assert!(sim.topology().is_connected(0, 2));
    }

    #[test]
    fn test_scenario_with_loss() {
        let sim = ScenarioBuilder::new(2)
            .with_loss_rate(0.5)
            .build()
            .unwrap();
        let link = sim.topology().get_link(0, 1).unwrap();
        assert_eq!(link.loss_rate, 0.5);
    }

    #[test]
    fn test_positions_applied() {
        let sim = ScenarioBuilder::new(2)
            .with_positions(vec![Position::new(100, 200)])
            .build()
            .unwrap();
        assert!(sim.nodes()[0].inner().device().is_joined());
        assert_eq!(sim.nodes().len(), 2);
    }

    #[test]
    fn test_scenario_partition() {
        let mut sim = ScenarioBuilder::new(4)
            .partition_at(Timestamp::from_millis(500), vec![vec![0, 1], vec![2, 3]])
            .build()
            .unwrap();
        assert!(sim.topology().is_connected(0, 2));

        sim.run_for(Duration::from_secs(1));

        assert!(!sim.topology().is_connected(0, 2));
        assert!(sim.topology().is_connected(0, 1));
        assert!(sim.topology().is_connected(2, 3));
    }

    #[test]
    fn test_star_hub_becomes_coordinator() {
        let result = ScenarioBuilder::new(4)
            .star_topology()
            .with_election(ElectionMode::AlwaysElect)
            .run_until(Timestamp::from_secs(45))
            .unwrap();
        assert!(result.converged());
        assert_eq!(result.final_coordinator(), Some(sim_address(0)));
        let snapshot = result.metrics.latest_snapshot().unwrap();
        assert_eq!(snapshot.nodes[&0].role, DeviceRole::Coordinator);
    }
}
