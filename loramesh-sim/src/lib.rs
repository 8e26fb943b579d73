//! loramesh-sim - Discrete event simulator for loramesh networks.
//!
//! Runs whole LoRaMesh networks in one process against simulated time, so
//! elections and join-mesh handshakes that take minutes on air finish in
//! milliseconds and are reproducible from a seed.
//!
//! # Features
//!
//! - **Discrete event simulation**: no real-time delays, deterministic ordering
//! - **Simulated radio**: half duplex, airtime from the LoRa time-on-air
//!   formula, frames only received while the radio listens
//! - **Configurable topology**: fully connected, chain, star or custom
//! - **Scenario builder**: staggered power-up, partitions, join-mesh and
//!   uplink actions
//! - **Metrics**: frame counts and mesh snapshots (coordinator, roles, children)
//!
//! # Example
//!
//! ```
//! use loramesh_sim::{ElectionMode, ScenarioBuilder, Timestamp};
//!
//! let result = ScenarioBuilder::new(3)
//!     .with_election(ElectionMode::AlwaysElect)
//!     .run_until(Timestamp::from_secs(45))
//!     .unwrap();
//!
//! assert!(result.converged());
//! ```
//!
//! # Architecture
//!
//! The simulator keeps a priority queue of events ordered by
//! (time, sequence number). Each node is polled whenever something happens
//! to it (start, frame, tx done, window timeout) and again at the time its
//! `next_wakeup` asks for. Frames the node put on air are routed through
//! the topology and delivered after their airtime.

pub mod event;
pub mod metrics;
pub mod node;
pub mod scenario;
pub mod sim;
pub mod topology;

/// Position of a node in the simulator's node list.
///
/// Addresses change when a node joins the mesh, so nodes are tracked by index.
pub type NodeIndex = usize;

pub use event::{Event, ScenarioAction, ScheduledEvent};
pub use loramesh::{DevAddr, Duration, Timestamp};
pub use metrics::{MeshSnapshot, NodeState, SimMetrics, SimulationResult};
pub use node::{sim_address, SimClock, SimNode, SimRadio};
pub use scenario::{simple_scenario, ElectionMode, ScenarioBuilder};
pub use sim::Simulator;
pub use topology::{Link, Topology};
