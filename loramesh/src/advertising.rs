//! Advertising beacons, coordinator election and the join-mesh handshake.
//!
//! This module handles:
//! - Periodic beacons in the advertising slot of the superframe
//! - The neighbour table fed by received beacons
//! - Adopting or claiming the coordinator role
//! - Join-mesh requests (child side) and acceptance (parent side)

use hashbrown::HashMap;
use log::{debug, info, warn};

use crate::config::MeshConfig;
use crate::election::ElectionContext;
use crate::mac::seal_control;
use crate::node::{Node, PendingJoin};
use crate::phy::PHY_FLAG_PRIORITY;
use crate::registry::ChildNode;
use crate::scheduler::EventType;
use crate::time::{Duration, Timestamp};
use crate::traits::{Cipher, Clock, Position, PositionSource, Radio};
use crate::types::{DevAddr, DeviceRole, Error, Event, Result, ADVERTISING_INTERVAL};
use crate::wire::{Beacon, ControlMessage, JoinMeshAccept, JoinMeshRequest};

/// What we last heard from a neighbour's beacon.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Neighbor {
    pub dev_addr: DevAddr,
    pub role: DeviceRole,
    pub rank: u8,
    pub position: Position,
    pub coordinator: DevAddr,
    pub rssi: i16,
    pub snr: i8,
    pub last_seen: Timestamp,
}

/// Bounded neighbour table; the entry heard longest ago is evicted first.
#[derive(Debug)]
pub struct NeighborTable {
    entries: HashMap<DevAddr, Neighbor>,
    capacity: usize,
}

impl NeighborTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert or refresh a neighbour.
    pub fn update(&mut self, neighbor: Neighbor) {
        if !self.entries.contains_key(&neighbor.dev_addr) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .values()
                .min_by_key(|n| (n.last_seen, n.dev_addr))
                .map(|n| n.dev_addr);
            match oldest {
                Some(addr) => {
                    self.entries.remove(&addr);
                }
                None => return,
            }
        }
        self.entries.insert(neighbor.dev_addr, neighbor);
    }

    pub fn get(&self, addr: DevAddr) -> Option<&Neighbor> {
        self.entries.get(&addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Neighbor> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Highest `(rank, rssi)` neighbour accepted by `filter`. Ties go to the
    /// lower address.
    pub fn best_parent<F>(&self, mut filter: F) -> Option<&Neighbor>
    where
        F: FnMut(&Neighbor) -> bool,
    {
        self.entries
            .values()
            .filter(|n| filter(n))
            .max_by(|a, b| {
                (a.rank, a.rssi)
                    .cmp(&(b.rank, b.rssi))
                    .then(b.dev_addr.cmp(&a.dev_addr))
            })
    }
}

fn known_position(p: Position) -> Option<Position> {
    // (0, 0) is what a node without a fix advertises.
    (p != Position::default()).then_some(p)
}

/// Allocate the address of a new child from its nonce.
///
/// The result shares our upper 16 bits and is neither zero, our own address
/// nor taken by `taken`.
pub fn derive_child_address<F>(own: DevAddr, nonce: u16, mut taken: F) -> Option<DevAddr>
where
    F: FnMut(DevAddr) -> bool,
{
    let prefix = own & 0xFFFF_0000;
    let mut low = nonce;
    for _ in 0..=u16::MAX as u32 {
        let candidate = prefix | low as u32;
        if candidate != 0 && candidate != own && !taken(candidate) {
            return Some(candidate);
        }
        low = low.wrapping_add(1);
    }
    None
}

impl<R, Cip, Clk, P, C> Node<R, Cip, Clk, P, C>
where
    R: Radio,
    Cip: Cipher,
    Clk: Clock,
    P: PositionSource,
    C: MeshConfig,
{
    /// Send the beacon when its time in the superframe comes round.
    pub(crate) fn advertising_timer(&mut self, now: Timestamp) {
        let Some(at) = self.next_advertising else {
            return;
        };
        if now < at {
            return;
        }
        let interval = self.device.adv_slot.interval.max(ADVERTISING_INTERVAL);
        let mut next = at + interval;
        while next <= now {
            next += interval;
        }
        self.next_advertising = Some(next);

        match self.send_advertising() {
            Ok(()) => {}
            Err(Error::NotAvail) => debug!("beacon skipped, network not joined"),
            Err(e) => warn!("beacon not sent: {}", e),
        }
    }

    /// Broadcast our beacon.
    ///
    /// With no coordinator known, the election policy decides whether we
    /// announce ourselves.
    pub fn send_advertising(&mut self) -> Result<()> {
        if !self.device.is_joined() {
            return Err(Error::NotAvail);
        }
        if self.device.coordinator == 0 {
            let ctx = self.election_context(false, None, None);
            if self.election.nominate(&ctx) {
                self.become_coordinator();
            }
        }
        let slot = self.device.adv_slot;
        let beacon = Beacon {
            dev_addr: self.device.dev_addr,
            role: self.device.role,
            rank: self.rank(),
            position: self.position.latest_position().unwrap_or_default(),
            coordinator: self.device.coordinator,
            slot_time: slot.time,
            interval_s: slot.interval.as_secs().min(u8::MAX as u64) as u8,
            duration_s: slot.duration.as_secs().min(u8::MAX as u64) as u8,
        };
        debug!(
            "beacon: rank {} coordinator {:08x}",
            beacon.rank, beacon.coordinator
        );
        self.send_control(&ControlMessage::Beacon(beacon))
    }

    fn send_control(&mut self, msg: &ControlMessage) -> Result<()> {
        if !self.device.is_joined() {
            return Err(Error::NotAvail);
        }
        let frame = seal_control(&self.cipher, &self.device.keys.nwk, msg)?;
        self.mac_put_payload(PHY_FLAG_PRIORITY, &frame)
    }

    pub(crate) fn on_control_message(&mut self, now: Timestamp, msg: ControlMessage) -> Result<()> {
        match msg {
            ControlMessage::Beacon(beacon) => self.process_advertising(now, &beacon),
            ControlMessage::JoinMeshRequest(req) => self.process_join_mesh_req(now, &req),
            ControlMessage::JoinMeshAccept(accept) => self.process_join_mesh_accept(&accept),
        }
    }

    fn election_context(
        &mut self,
        coordinator_known: bool,
        neighbor_rank: Option<u8>,
        distance: Option<u32>,
    ) -> ElectionContext {
        ElectionContext {
            role: self.device.role,
            rank: self.rank(),
            children: self.children.len(),
            capacity: self.children.capacity(),
            coordinator_known,
            neighbor_rank,
            distance,
            random: self.radio.random(),
        }
    }

    /// Record a neighbour's beacon and run the coordinator election.
    pub(crate) fn process_advertising(&mut self, now: Timestamp, beacon: &Beacon) -> Result<()> {
        if beacon.dev_addr == self.device.dev_addr {
            return Ok(());
        }
        self.neighbors.update(Neighbor {
            dev_addr: beacon.dev_addr,
            role: beacon.role,
            rank: beacon.rank,
            position: beacon.position,
            coordinator: beacon.coordinator,
            rssi: self.device.last_rssi,
            snr: self.device.last_snr,
            last_seen: now,
        });

        let known = self.device.coordinator;
        let announced = beacon.coordinator;
        let distance = known_position(beacon.position).and_then(|p| self.position.distance_to(&p));

        if announced != known {
            if announced == 0 {
                // Our own beacon will tell them.
                return Ok(());
            }
            if self.device.is_coordinator() {
                // Lower address wins between two coordinators.
                if announced < self.device.dev_addr {
                    self.adopt_coordinator(announced);
                }
                return Ok(());
            }
            let announcer_leads = announced == beacon.dev_addr;
            let ctx = self.election_context(true, Some(beacon.rank), distance);
            if !announcer_leads && self.election.nominate(&ctx) {
                self.become_coordinator();
            } else {
                self.adopt_coordinator(announced);
            }
        } else if announced == 0 {
            let ctx = self.election_context(false, Some(beacon.rank), distance);
            if self.election.nominate(&ctx) {
                self.become_coordinator();
            }
        }
        Ok(())
    }

    fn become_coordinator(&mut self) {
        let own = self.device.dev_addr;
        if self.device.coordinator != own {
            info!("{:08x} claims the coordinator role", own);
            self.device.coordinator = own;
            self.push_event(Event::CoordinatorChanged { coordinator: own });
        }
        self.set_role(DeviceRole::Coordinator);
    }

    fn adopt_coordinator(&mut self, coordinator: DevAddr) {
        if self.device.coordinator != coordinator {
            info!("coordinator is now {:08x}", coordinator);
            self.device.coordinator = coordinator;
            self.push_event(Event::CoordinatorChanged { coordinator });
        }
        if self.device.role == DeviceRole::Coordinator {
            let role = if self.children.is_empty() {
                DeviceRole::Node
            } else {
                DeviceRole::Router
            };
            self.set_role(role);
        }
    }

    /// Ask the best neighbour to take us as a child.
    ///
    /// Returns the chosen parent; completion is reported with
    /// `Event::MeshJoined`.
    pub fn join_mesh(&mut self, periodicity: Duration) -> Result<DevAddr> {
        if !self.device.is_joined() {
            return Err(Error::NotAvail);
        }
        let own = self.device.dev_addr;
        let children = &self.children;
        let target = self
            .neighbors
            .best_parent(|n| n.dev_addr != own && !children.contains(n.dev_addr))
            .map(|n| n.dev_addr)
            .ok_or(Error::Failed)?;

        let nonce = self.radio.random() as u16;
        let req = JoinMeshRequest {
            requester: own,
            nonce,
            target,
            periodicity_s: periodicity.as_secs().min(u16::MAX as u64) as u16,
            class: self.device.class,
        };
        self.send_control(&ControlMessage::JoinMeshRequest(req))?;
        self.pending_join = Some(PendingJoin::Mesh {
            nonce,
            target,
            periodicity,
        });
        debug!("join-mesh request to {:08x}, nonce {:04x}", target, nonce);
        Ok(target)
    }

    /// Parent side: register the requester as a child and answer it.
    ///
    /// The accept is queued before the child is committed, so a full tx
    /// queue leaves no record behind. A repeated request is answered with
    /// the address handed out the first time.
    pub(crate) fn process_join_mesh_req(&mut self, now: Timestamp, req: &JoinMeshRequest) -> Result<()> {
        if req.target != self.device.dev_addr {
            return Ok(());
        }
        let origin = (req.requester, req.nonce);
        let existing = self
            .children
            .iter()
            .find(|c| c.join_request == Some(origin))
            .map(|c| c.dev_addr);
        if let Some(existing) = existing {
            debug!(
                "repeated join-mesh request from {:08x}, re-sending {:08x}",
                req.requester, existing
            );
            return self.send_join_mesh_accept(req, existing);
        }

        let ctx = self.election_context(false, None, None);
        if !self.election.accept(&ctx) {
            debug!("join-mesh request from {:08x} declined", req.requester);
            return Ok(());
        }
        if self.children.available() == 0 {
            return Err(Error::NotAvail);
        }

        let own = self.device.dev_addr;
        let children = &self.children;
        let assigned = derive_child_address(own, req.nonce, |a| children.contains(a))
            .ok_or(Error::NotAvail)?;
        self.send_join_mesh_accept(req, assigned)?;

        let mut child = ChildNode::new(assigned, self.device.keys);
        child.class = req.class;
        child.channel = self.device.channel;
        child.datarate = self.device.datarate;
        child.tx_power = self.device.tx_power;
        child.periodicity = Duration::from_secs(req.periodicity_s as u64);
        child.slot_duration = EventType::SyncRx.duration();
        child.join_request = Some(origin);
        if req.periodicity_s != 0 {
            match self
                .scheduler
                .register(EventType::SyncRx, child.periodicity, assigned, now)
            {
                Ok(handler) => child.sync_handler = Some(handler),
                Err(e) => warn!("no sync slots for child {:08x}: {}", assigned, e),
            }
        }
        let sync_handler = child.sync_handler;
        if let Err(e) = self.add_child_node(child) {
            if let Some(handler) = sync_handler {
                // Best effort; the handler was just created.
                let _ = self.scheduler.remove_handler(handler, now);
            }
            return Err(e);
        }
        Ok(())
    }

    fn send_join_mesh_accept(&mut self, req: &JoinMeshRequest, assigned: DevAddr) -> Result<()> {
        let parent = self.device.dev_addr;
        self.send_control(&ControlMessage::JoinMeshAccept(JoinMeshAccept {
            requester: req.requester,
            nonce: req.nonce,
            assigned,
            parent,
        }))
    }

    /// Child side: take the assigned address and remember the parent.
    pub(crate) fn process_join_mesh_accept(&mut self, accept: &JoinMeshAccept) -> Result<()> {
        let Some(PendingJoin::Mesh {
            nonce,
            target,
            periodicity,
        }) = self.pending_join
        else {
            return Ok(());
        };
        if accept.requester != self.device.dev_addr
            || accept.nonce != nonce
            || accept.parent != target
        {
            return Ok(());
        }

        self.device.dev_addr = accept.assigned;
        self.device.uplink_counter = 0;
        self.device.downlink_counter = 0;
        self.parent = Some(accept.parent);
        self.pending_join = None;
        info!(
            "joined mesh below {:08x} as {:08x}, uplink every {} s",
            accept.parent,
            accept.assigned,
            periodicity.as_secs()
        );
        self.push_event(Event::MeshJoined {
            parent: accept.parent,
            dev_addr: accept.assigned,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;

    use super::*;
    use crate::config::{DefaultConfig, MeshSettings};
    use crate::crypto::AesCmacCipher;
    use crate::device::DebugFlags;
    use crate::election::AlwaysElect;
    use crate::mac::open_control;
    use crate::phy::PhyPacket;
    use crate::traits::test_impls::{FixedPosition, MockClock, MockRadio};
    use crate::types::{DeviceClass, SessionKeys};

    type TestNode = Node<MockRadio, AesCmacCipher, MockClock, FixedPosition, DefaultConfig>;

    const KEYS: SessionKeys = SessionKeys::new([0x11; 16], [0x22; 16]);

    fn make_node(addr: DevAddr) -> TestNode {
        let settings = MeshSettings::new()
            .with_class(DeviceClass::C)
            .with_debug(DebugFlags::DUTY_CYCLE_OVERRIDE);
        let mut node = Node::new(
            MockRadio::new(),
            AesCmacCipher::new(),
            MockClock::new(),
            FixedPosition::at(0, 1_000),
            settings,
        )
        .unwrap();
        node.set_election_policy(AlwaysElect);
        node.join_abp(addr, 0x13, KEYS).unwrap();
        node
    }

    fn neighbor(addr: DevAddr, rank: u8, rssi: i16, seen: u64) -> Neighbor {
        Neighbor {
            dev_addr: addr,
            role: DeviceRole::Node,
            rank,
            position: Position::default(),
            coordinator: 0,
            rssi,
            snr: 0,
            last_seen: Timestamp::from_millis(seen),
        }
    }

    fn beacon(addr: DevAddr, coordinator: DevAddr) -> Beacon {
        Beacon {
            dev_addr: addr,
            role: DeviceRole::Node,
            rank: 0,
            position: Position::new(0, 2_000),
            coordinator,
            slot_time: 0,
            interval_s: 36,
            duration_s: 2,
        }
    }

    /// Control message the node queued for transmission.
    fn sent_control(node: &TestNode) -> ControlMessage {
        let buf = node.phy.take_tx().unwrap();
        let packet = PhyPacket::parse(&buf).unwrap();
        open_control(&AesCmacCipher::new(), &KEYS.nwk, packet.payload).unwrap()
    }

    #[test]
    fn test_table_evicts_oldest() {
        let mut table = NeighborTable::with_capacity(2);
        table.update(neighbor(1, 0, -80, 100));
        table.update(neighbor(2, 0, -80, 50));
        table.update(neighbor(1, 3, -70, 200));
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(1).unwrap().rank, 3);

        table.update(neighbor(3, 0, -90, 300));
        assert_eq!(table.len(), 2);
        assert!(table.get(2).is_none());
        assert!(table.get(1).is_some() && table.get(3).is_some());
    }

    #[test]
    fn test_best_parent_by_rank_then_rssi() {
        let mut table = NeighborTable::with_capacity(8);
        table.update(neighbor(1, 2, -100, 0));
        table.update(neighbor(2, 2, -60, 0));
        table.update(neighbor(3, 1, -30, 0));
        assert_eq!(table.best_parent(|_| true).unwrap().dev_addr, 2);
        assert_eq!(table.best_parent(|n| n.dev_addr != 2).unwrap().dev_addr, 1);
        assert!(table.best_parent(|_| false).is_none());
    }

    #[test]
    fn test_child_address_derivation() {
        let own = 0x2600_0001;
        assert_eq!(derive_child_address(own, 0x1234, |_| false), Some(0x2600_1234));
        // Our own address is skipped.
        assert_eq!(derive_child_address(own, 0x0001, |_| false), Some(0x2600_0002));
        assert_eq!(
            derive_child_address(own, 0x1234, |a| a == 0x2600_1234),
            Some(0x2600_1235)
        );
        // Zero is never handed out.
        assert_eq!(derive_child_address(0x0000_0001, 0, |_| false), Some(0x0000_0002));
        assert_eq!(derive_child_address(own, 0, |_| true), None);
    }

    #[test]
    fn test_adopt_announced_coordinator() {
        let mut node = make_node(0x2600_0005);
        node.process_advertising(Timestamp::ZERO, &beacon(0x2600_0002, 0x2600_0002))
            .unwrap();
        assert_eq!(node.coordinator(), 0x2600_0002);
        assert_eq!(node.role(), DeviceRole::Node);
        assert_eq!(node.neighbors().len(), 1);
        assert_eq!(
            node.events().try_receive().ok(),
            Some(Event::Joined {
                dev_addr: 0x2600_0005
            })
        );
        assert_eq!(
            node.events().try_receive().ok(),
            Some(Event::CoordinatorChanged {
                coordinator: 0x2600_0002
            })
        );
    }

    #[test]
    fn test_nominate_when_nobody_leads() {
        let mut node = make_node(0x2600_0005);
        node.process_advertising(Timestamp::ZERO, &beacon(0x2600_0002, 0))
            .unwrap();
        assert_eq!(node.coordinator(), 0x2600_0005);
        assert_eq!(node.role(), DeviceRole::Coordinator);
    }

    #[test]
    fn test_lower_address_wins_between_coordinators() {
        let mut node = make_node(0x2600_0005);
        node.process_advertising(Timestamp::ZERO, &beacon(0x2600_0009, 0))
            .unwrap();
        assert_eq!(node.role(), DeviceRole::Coordinator);

        node.process_advertising(Timestamp::ZERO, &beacon(0x2600_0009, 0x2600_0009))
            .unwrap();
        assert_eq!(node.coordinator(), 0x2600_0005);

        node.process_advertising(Timestamp::ZERO, &beacon(0x2600_0002, 0x2600_0002))
            .unwrap();
        assert_eq!(node.coordinator(), 0x2600_0002);
        assert_eq!(node.role(), DeviceRole::Node);
    }

    #[test]
    fn test_own_beacon_ignored() {
        let mut node = make_node(0x2600_0005);
        node.process_advertising(Timestamp::ZERO, &beacon(0x2600_0005, 0))
            .unwrap();
        assert!(node.neighbors().is_empty());
        assert_eq!(node.coordinator(), 0);
    }

    #[test]
    fn test_beacon_announces_self_nomination() {
        let mut node = make_node(0x2600_0005);
        node.send_advertising().unwrap();
        let ControlMessage::Beacon(b) = sent_control(&node) else {
            panic!("expected a beacon");
        };
        assert_eq!(b.dev_addr, 0x2600_0005);
        assert_eq!(b.coordinator, 0x2600_0005);
        assert_eq!(b.role, DeviceRole::Coordinator);
        assert_eq!(b.rank, 4);
        assert_eq!(b.position, Position::new(0, 1_000));
        assert_eq!((b.interval_s, b.duration_s), (36, 2));
    }

    #[test]
    fn test_beacon_requires_join() {
        let settings = MeshSettings::new();
        let mut node: TestNode = Node::new(
            MockRadio::new(),
            AesCmacCipher::new(),
            MockClock::new(),
            FixedPosition::none(),
            settings,
        )
        .unwrap();
        assert_eq!(node.send_advertising(), Err(Error::NotAvail));
    }

    #[test]
    fn test_advertising_timer_fires_once_per_interval() {
        let mut node = make_node(0x2600_0005);
        node.advertising_timer(Timestamp::from_millis(35_999));
        assert!(!node.phy().tx_pending());
        node.advertising_timer(Timestamp::from_millis(36_000));
        assert!(node.phy().tx_pending());
        assert_eq!(node.next_advertising, Some(Timestamp::from_millis(72_000)));
    }

    #[test]
    fn test_join_mesh_handshake() {
        let mut parent = make_node(0x2600_0001);
        let mut child = make_node(0x2600_0042);

        assert_eq!(child.join_mesh(Duration::from_secs(16)), Err(Error::Failed));
        child
            .process_advertising(Timestamp::ZERO, &beacon(0x2600_0001, 0x2600_0001))
            .unwrap();
        assert_eq!(child.join_mesh(Duration::from_secs(16)), Ok(0x2600_0001));

        let ControlMessage::JoinMeshRequest(req) = sent_control(&child) else {
            panic!("expected a join-mesh request");
        };
        assert_eq!(req.target, 0x2600_0001);
        parent.process_join_mesh_req(Timestamp::ZERO, &req).unwrap();

        let assigned = 0x2600_0000 | req.nonce as u32;
        let record = parent.find_child_node(assigned).unwrap();
        assert_eq!(record.keys, KEYS);
        assert_eq!(record.periodicity, Duration::from_secs(16));
        assert!(record.sync_handler.is_some());
        assert_eq!(parent.role(), DeviceRole::Router);

        let ControlMessage::JoinMeshAccept(accept) = sent_control(&parent) else {
            panic!("expected a join-mesh accept");
        };
        child.process_join_mesh_accept(&accept).unwrap();
        assert_eq!(child.dev_addr(), assigned);
        assert_eq!(child.parent(), Some(0x2600_0001));
    }

    fn join_request(periodicity_s: u16) -> JoinMeshRequest {
        JoinMeshRequest {
            requester: 0x2600_0042,
            nonce: 0x1234,
            target: 0x2600_0001,
            periodicity_s,
            class: DeviceClass::A,
        }
    }

    #[test]
    fn test_join_mesh_accept_blocked_commits_nothing() {
        let mut parent = make_node(0x2600_0001);
        parent.send_frame(10, &[1], false).unwrap();
        let events_before = parent.scheduler().len();

        let result = parent.process_join_mesh_req(Timestamp::ZERO, &join_request(16));
        assert_eq!(result, Err(Error::Busy));
        assert!(parent.child_nodes().next().is_none());
        assert_eq!(parent.role(), DeviceRole::Node);
        assert_eq!(parent.scheduler().len(), events_before);

        // Once the queue drains the same request goes through.
        parent.phy.take_tx().unwrap();
        parent
            .process_join_mesh_req(Timestamp::ZERO, &join_request(16))
            .unwrap();
        assert!(parent.find_child_node(0x2600_1234).is_some());
        assert_eq!(parent.role(), DeviceRole::Router);
    }

    #[test]
    fn test_repeated_join_mesh_request_reuses_child() {
        let mut parent = make_node(0x2600_0001);
        let req = join_request(16);
        parent.process_join_mesh_req(Timestamp::ZERO, &req).unwrap();
        let ControlMessage::JoinMeshAccept(first) = sent_control(&parent) else {
            panic!("expected a join-mesh accept");
        };
        let events_after_first = parent.scheduler().len();

        parent.process_join_mesh_req(Timestamp::ZERO, &req).unwrap();
        let ControlMessage::JoinMeshAccept(second) = sent_control(&parent) else {
            panic!("expected a join-mesh accept");
        };

        assert_eq!(first, second);
        assert_eq!(first.assigned, 0x2600_1234);
        let children: Vec<DevAddr> = parent.child_nodes().map(|c| c.dev_addr).collect();
        assert_eq!(children, vec![0x2600_1234]);
        assert_eq!(parent.scheduler().len(), events_after_first);

        // A fresh nonce from the same requester is a new join.
        let mut again = req;
        again.nonce = 0x1235;
        parent.process_join_mesh_req(Timestamp::ZERO, &again).unwrap();
        assert_eq!(parent.child_nodes().count(), 2);
    }

    #[test]
    fn test_join_mesh_request_for_someone_else() {
        let mut node = make_node(0x2600_0001);
        let req = JoinMeshRequest {
            requester: 0x2600_0042,
            nonce: 7,
            target: 0x2600_0099,
            periodicity_s: 0,
            class: DeviceClass::A,
        };
        node.process_join_mesh_req(Timestamp::ZERO, &req).unwrap();
        assert!(node.child_nodes().next().is_none());
        assert!(!node.phy().tx_pending());
    }

    #[test]
    fn test_stray_accept_ignored() {
        let mut node = make_node(0x2600_0042);
        let accept = JoinMeshAccept {
            requester: 0x2600_0042,
            nonce: 1,
            assigned: 0x2600_0001,
            parent: 0x2600_0007,
        };
        node.process_join_mesh_accept(&accept).unwrap();
        assert_eq!(node.dev_addr(), 0x2600_0042);
        assert_eq!(node.parent(), None);
    }
}
