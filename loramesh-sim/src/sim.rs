//! Discrete event simulator for loramesh networks.

use std::collections::BinaryHeap;

use log::{debug, warn};
use loramesh::traits::test_impls::FixedPosition;
use loramesh::{Duration, MeshSettings, Result, Timestamp};

use crate::event::{Event, ScenarioAction, ScheduledEvent, SequenceNumber};
use crate::metrics::{MeshSnapshot, NodeState, SimMetrics, SimulationResult};
use crate::node::{RadioOutput, SimNode};
use crate::topology::Topology;
use crate::NodeIndex;

/// Polls closer together than this are merged.
const MIN_POLL_STEP: Duration = Duration::from_millis(1);

/// Discrete event simulator for loramesh networks.
pub struct Simulator {
    nodes: Vec<SimNode>,
    topology: Topology,
    current_time: Timestamp,
    event_queue: BinaryHeap<ScheduledEvent>,
    metrics: SimMetrics,
    next_seq: u64,
    /// RNG state for frame loss.
    rng_state: u64,
    snapshot_interval: Option<Duration>,
    next_snapshot: Option<Timestamp>,
}

impl Simulator {
    /// Create a new simulator with given RNG seed.
    pub fn new(seed: u64) -> Self {
        Self {
            nodes: Vec::new(),
            topology: Topology::new(),
            current_time: Timestamp::ZERO,
            event_queue: BinaryHeap::new(),
            metrics: SimMetrics::new(),
            next_seq: 0,
            rng_state: seed,
            snapshot_interval: None,
            next_snapshot: None,
        }
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Record a mesh snapshot every `interval`.
    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = Some(interval);
        self.next_snapshot = Some(self.current_time + interval);
        self
    }

    /// Add a node that powers up at `start_at`.
    ///
    /// The node is personalised into the network immediately; its radio and
    /// superframe start with the first poll.
    pub fn add_node(
        &mut self,
        settings: MeshSettings,
        seed: u64,
        start_at: Timestamp,
        position: FixedPosition,
    ) -> Result<NodeIndex> {
        let index = self.nodes.len();
        let node = SimNode::new(index, settings, seed, start_at, position)?;
        self.nodes.push(node);
        self.schedule(start_at, Event::NodeStart { node: index });
        Ok(index)
    }

    pub fn node(&self, index: NodeIndex) -> Option<&SimNode> {
        self.nodes.get(index)
    }

    pub fn node_mut(&mut self, index: NodeIndex) -> Option<&mut SimNode> {
        self.nodes.get_mut(index)
    }

    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    pub fn current_time(&self) -> Timestamp {
        self.current_time
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn topology_mut(&mut self) -> &mut Topology {
        &mut self.topology
    }

    pub fn metrics(&self) -> &SimMetrics {
        &self.metrics
    }

    pub fn schedule(&mut self, time: Timestamp, event: Event) {
        let seq = SequenceNumber::new(self.next_seq);
        self.next_seq += 1;
        self.event_queue.push(ScheduledEvent::new(time, seq, event));
    }

    pub fn schedule_action(&mut self, time: Timestamp, action: ScenarioAction) {
        self.schedule(time, Event::ScenarioAction(action));
    }

    /// Run simulation until specified time.
    pub fn run_until(&mut self, end_time: Timestamp) -> SimulationResult {
        while self.event_queue.peek().is_some_and(|e| e.time <= end_time) {
            let Some(event) = self.event_queue.pop() else {
                break;
            };
            self.maybe_take_snapshot(event.time);
            self.advance_time(event.time);
            self.process_event(event.event);
        }
        self.maybe_take_snapshot(end_time);
        self.advance_time(end_time);
        self.take_snapshot();

        SimulationResult {
            end_time: self.current_time,
            metrics: self.metrics.clone(),
            queue_exhausted: self.event_queue.is_empty(),
        }
    }

    pub fn run_for(&mut self, duration: Duration) -> SimulationResult {
        self.run_until(self.current_time + duration)
    }

    fn advance_time(&mut self, time: Timestamp) {
        if time > self.current_time {
            self.current_time = time;
        }
    }

    fn process_event(&mut self, event: Event) {
        match event {
            Event::NodeStart { node } => {
                if let Some(n) = self.nodes.get_mut(node) {
                    n.started = true;
                    self.poll_node(node);
                }
            }
            Event::Wake { node } => {
                let now = self.current_time;
                let due = self
                    .nodes
                    .get(node)
                    .is_some_and(|n| n.started && n.wake_at == Some(now));
                if due {
                    self.poll_node(node);
                }
            }
            Event::FrameDelivery {
                to,
                from,
                data,
                rssi,
            } => self.deliver_frame(to, from, &data, rssi),
            Event::TxDone { node } => {
                if let Some(n) = self.nodes.get_mut(node) {
                    n.complete_tx();
                    self.poll_node(node);
                }
            }
            Event::RxTimeout { node, generation } => {
                let expired = self
                    .nodes
                    .get_mut(node)
                    .is_some_and(|n| n.expire_rx(generation));
                if expired {
                    self.poll_node(node);
                }
            }
            Event::ScenarioAction(action) => self.execute_action(action),
        }
    }

    fn deliver_frame(&mut self, to: NodeIndex, from: NodeIndex, data: &[u8], rssi: i16) {
        let Some(node) = self.nodes.get_mut(to) else {
            return;
        };
        if node.started && node.deliver(data, rssi) {
            self.metrics.frames_delivered += 1;
            self.poll_node(to);
        } else {
            debug!("node {} missed a frame from node {}", to, from);
            self.metrics.frames_missed += 1;
        }
    }

    /// Poll a node now, route its output and schedule its next wake-up.
    fn poll_node(&mut self, index: NodeIndex) {
        let now = self.current_time;
        let Some(node) = self.nodes.get_mut(index) else {
            return;
        };
        if !node.started {
            return;
        }
        let output = node.poll(now);
        let wake = node.next_wakeup(now).max(now + MIN_POLL_STEP);
        let reschedule = match node.wake_at {
            Some(at) => at <= now || wake < at,
            None => true,
        };
        if reschedule {
            node.wake_at = Some(wake);
            self.schedule(wake, Event::Wake { node: index });
        }
        self.route_output(index, output);
    }

    fn route_output(&mut self, sender: NodeIndex, output: RadioOutput) {
        let now = self.current_time;
        for (generation, timeout) in output.rx_windows {
            self.schedule(
                now + timeout,
                Event::RxTimeout {
                    node: sender,
                    generation,
                },
            );
        }
        for (frame, airtime) in output.frames {
            self.route_frame(sender, frame, airtime);
        }
    }

    /// Put a frame on air to every neighbour in range.
    fn route_frame(&mut self, sender: NodeIndex, data: Vec<u8>, airtime: Duration) {
        self.metrics.frames_sent += 1;
        let now = self.current_time;
        self.schedule(now + airtime, Event::TxDone { node: sender });

        let mut deliveries = Vec::new();
        for neighbor in self.topology.neighbors(sender) {
            let Some(link) = self.topology.get_link(sender, neighbor) else {
                continue;
            };
            let (loss_rate, delay, rssi) = (link.loss_rate, link.delay, link.rssi);
            if loss_rate > 0.0 && self.random_f64() < loss_rate {
                self.metrics.frames_dropped += 1;
                continue;
            }
            deliveries.push((neighbor, delay, rssi));
        }

        for (neighbor, delay, rssi) in deliveries {
            self.schedule(
                now + airtime + delay,
                Event::FrameDelivery {
                    to: neighbor,
                    from: sender,
                    data: data.clone(),
                    rssi,
                },
            );
        }
    }

    fn execute_action(&mut self, action: ScenarioAction) {
        match action {
            ScenarioAction::Partition { groups } => self.topology.partition(&groups),
            ScenarioAction::HealPartition => self.topology.heal(),
            ScenarioAction::DisableLink { from, to } => {
                if let Some(link) = self.topology.get_link_mut(from, to) {
                    link.active = false;
                }
            }
            ScenarioAction::EnableLink { from, to } => {
                if let Some(link) = self.topology.get_link_mut(from, to) {
                    link.active = true;
                }
            }
            ScenarioAction::SetLossRate { from, to, rate } => {
                if let Some(link) = self.topology.get_link_mut(from, to) {
                    link.loss_rate = rate.clamp(0.0, 1.0);
                }
            }
            ScenarioAction::TakeSnapshot => self.take_snapshot(),
            ScenarioAction::JoinMesh { node, periodicity } => {
                self.node_call(node, "join mesh", |n| {
                    n.inner_mut().join_mesh(periodicity).map(|_| ())
                });
            }
            ScenarioAction::Listen { node, port } => {
                self.node_call(node, "listen", |n| n.listen(port));
            }
            ScenarioAction::RegisterTransmission {
                node,
                port,
                interval,
            } => {
                self.node_call(node, "register transmission", |n| {
                    n.inner_mut()
                        .register_transmission(port, interval)
                        .map(|_| ())
                });
            }
            ScenarioAction::QueueUplink {
                node,
                port,
                payload,
                confirmed,
            } => {
                self.node_call(node, "queue uplink", |n| {
                    n.inner_mut().queue_uplink(port, &payload, confirmed)
                });
            }
        }
    }

    /// Run an API call on a node at the current time, then poll it.
    fn node_call<F>(&mut self, index: NodeIndex, what: &str, f: F)
    where
        F: FnOnce(&mut SimNode) -> Result<()>,
    {
        let now = self.current_time;
        let Some(node) = self.nodes.get_mut(index) else {
            warn!("{}: no node {}", what, index);
            return;
        };
        node.set_time(now);
        if let Err(e) = f(node) {
            warn!("{} on node {} failed: {}", what, index, e);
        }
        self.poll_node(index);
    }

    /// Take the periodic snapshots due before `until`.
    fn maybe_take_snapshot(&mut self, until: Timestamp) {
        while let (Some(next), Some(interval)) = (self.next_snapshot, self.snapshot_interval) {
            if next > until {
                break;
            }
            self.advance_time(next);
            self.take_snapshot();
            self.next_snapshot = Some(next + interval);
        }
    }

    /// Record the mesh state of every started node.
    pub fn take_snapshot(&mut self) {
        let mut snapshot = MeshSnapshot::new(self.current_time);
        for node in self.nodes.iter().filter(|n| n.is_started()) {
            snapshot.record_node(
                node.index(),
                NodeState {
                    dev_addr: node.dev_addr(),
                    role: node.role(),
                    coordinator: node.coordinator(),
                    parent: node.parent(),
                    children: node.child_count(),
                },
            );
        }
        self.metrics.add_snapshot(snapshot);
    }

    /// Generate a random f64 in [0, 1).
    fn random_f64(&mut self) -> f64 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1);
        (self.rng_state >> 11) as f64 / (1u64 << 53) as f64
    }
}
