//! Application-facing API: ports, sends, periodic transmissions, joins and
//! the child/multicast registries.

use alloc::boxed::Box;

use log::{debug, error, info, trace, warn};

use crate::config::MeshConfig;
use crate::device::ControlFlags;
use crate::mac::seal_join_request;
use crate::node::{Node, PendingJoin, PendingUplink};
use crate::phy::{PHY_FLAG_PRIORITY, PHY_FLAG_RX_WINDOWS};
use crate::registry::{ChildNode, MulticastGroup};
use crate::scheduler::{EventType, HandlerKey, SlotAction};
use crate::time::{Duration, Timestamp};
use crate::traits::{Cipher, Clock, PortHandler, PositionSource, Radio};
use crate::types::{
    DevAddr, DeviceRole, Error, Event, Result, SessionKeys, LORAMESH_PAYLOAD_SIZE, PORT_MAX,
    PORT_MIN,
};
use crate::wire::{JoinRequest, MacCommand};

fn check_app_port(port: u8) -> Result<()> {
    if (PORT_MIN..=PORT_MAX).contains(&port) {
        Ok(())
    } else {
        Err(Error::Range)
    }
}

fn check_payload(payload: &[u8]) -> Result<()> {
    if payload.len() > LORAMESH_PAYLOAD_SIZE {
        Err(Error::Overflow)
    } else {
        Ok(())
    }
}

impl<R, Cip, Clk, P, C> Node<R, Cip, Clk, P, C>
where
    R: Radio,
    Cip: Cipher,
    Clk: Clock,
    P: PositionSource,
    C: MeshConfig,
{
    // --- Applications ---

    /// Bind a handler to an application port in `1..=223`.
    pub fn register_application<H>(&mut self, port: u8, handler: H) -> Result<()>
    where
        H: PortHandler + 'static,
    {
        check_app_port(port)?;
        if self.applications.iter().any(|(p, _)| *p == port)
            || self.applications.len() >= C::MAX_APPLICATIONS
        {
            return Err(Error::NotAvail);
        }
        self.applications.push((port, Box::new(handler)));
        Ok(())
    }

    pub fn unregister_application(&mut self, port: u8) -> Result<()> {
        let index = self
            .applications
            .iter()
            .position(|(p, _)| *p == port)
            .ok_or(Error::Failed)?;
        self.applications.swap_remove(index);
        Ok(())
    }

    /// Deliver a decrypted payload to the handler bound to `port`.
    pub fn on_packet_rx(&mut self, port: u8, payload: &[u8]) -> Result<()> {
        let (_, handler) = self
            .applications
            .iter_mut()
            .find(|(p, _)| *p == port)
            .ok_or(Error::Failed)?;
        handler.on_frame(port, payload)
    }

    // --- Sending ---

    /// Send an uplink to our parent (or the network) now.
    ///
    /// The frame is queued in the PHY; it leaves as soon as the slot plan
    /// and duty cycle allow.
    pub fn send_frame(&mut self, port: u8, payload: &[u8], confirmed: bool) -> Result<()> {
        if !self.device.is_joined() {
            return Err(Error::NotAvail);
        }
        check_payload(payload)?;
        if port > PORT_MAX {
            return Err(Error::Range);
        }
        self.frm_send_uplink(port, payload, confirmed)
    }

    /// Send a downlink to a registered multicast group.
    pub fn send_multicast(&mut self, group: DevAddr, port: u8, payload: &[u8]) -> Result<()> {
        if !self.device.is_joined() {
            return Err(Error::NotAvail);
        }
        check_payload(payload)?;
        check_app_port(port)?;
        let g = self.multicast.find(group).ok_or(Error::Failed)?;
        let (keys, fcnt) = (g.keys, g.downlink_counter);
        self.frm_send_downlink(group, &keys, fcnt, port, payload)?;
        if let Some(g) = self.multicast.find_mut(group) {
            g.downlink_counter = fcnt.wrapping_add(1);
        }
        Ok(())
    }

    /// Send a downlink to one of our children.
    pub fn send_to_child(&mut self, child: DevAddr, port: u8, payload: &[u8]) -> Result<()> {
        if !self.device.is_joined() {
            return Err(Error::NotAvail);
        }
        check_payload(payload)?;
        check_app_port(port)?;
        let c = self.children.find(child).ok_or(Error::Failed)?;
        let (keys, fcnt) = (c.keys, c.downlink_counter);
        self.frm_send_downlink(child, &keys, fcnt, port, payload)?;
        if let Some(c) = self.children.find_mut(child) {
            c.downlink_counter = fcnt.wrapping_add(1);
        }
        Ok(())
    }

    /// Ask the network for a link check on the next uplink.
    pub fn request_link_check(&mut self) {
        self.frm_queue_command(MacCommand::LinkCheckReq);
    }

    // --- Periodic transmissions ---

    /// Reserve recurring uplink slots for `port`.
    ///
    /// Allocation failures are logged and returned; nothing is reserved in
    /// that case.
    pub fn register_transmission(&mut self, port: u8, interval: Duration) -> Result<HandlerKey> {
        check_app_port(port)?;
        if self.transmissions.contains_key(&port) {
            return Err(Error::NotAvail);
        }
        let now = self.clock.now();
        let handler = self
            .scheduler
            .register(EventType::Uplink, interval, port as u32, now)
            .map_err(|e| {
                error!(
                    "uplink on port {} every {} ms not scheduled: {}",
                    port,
                    interval.as_millis(),
                    e
                );
                e
            })?;
        self.transmissions.insert(port, handler);
        Ok(handler)
    }

    pub fn unregister_transmission(&mut self, port: u8) -> Result<()> {
        let handler = self.transmissions.remove(&port).ok_or(Error::Failed)?;
        self.pending_uplinks.remove(&port);
        let now = self.clock.now();
        self.scheduler.remove_handler(handler, now)
    }

    /// Reserve recurring multicast slots for a registered group.
    pub fn register_multicast_transmission(
        &mut self,
        group: DevAddr,
        interval: Duration,
    ) -> Result<HandlerKey> {
        match self.multicast.find(group) {
            None => return Err(Error::Failed),
            Some(g) if g.handler.is_some() => return Err(Error::NotAvail),
            Some(_) => {}
        }
        let now = self.clock.now();
        let handler = self
            .scheduler
            .register(EventType::Multicast, interval, group, now)
            .map_err(|e| {
                error!("multicast to {:08x} not scheduled: {}", group, e);
                e
            })?;
        if let Some(g) = self.multicast.find_mut(group) {
            g.handler = Some(handler);
            g.periodicity = interval;
        }
        Ok(handler)
    }

    pub fn unregister_multicast_transmission(&mut self, group: DevAddr) -> Result<()> {
        let handler = self
            .multicast
            .find_mut(group)
            .and_then(|g| g.handler.take())
            .ok_or(Error::Failed)?;
        self.pending_multicast.remove(&group);
        let now = self.clock.now();
        self.scheduler.remove_handler(handler, now)
    }

    /// Queue a payload for the next uplink slot of `port`.
    pub fn queue_uplink(&mut self, port: u8, payload: &[u8], confirmed: bool) -> Result<()> {
        if !self.device.is_joined() {
            return Err(Error::NotAvail);
        }
        check_payload(payload)?;
        check_app_port(port)?;
        if !self.transmissions.contains_key(&port) {
            return Err(Error::Failed);
        }
        self.pending_uplinks.insert(
            port,
            PendingUplink {
                payload: payload.to_vec(),
                confirmed,
            },
        );
        Ok(())
    }

    /// Queue a payload for the next multicast slot of `group`.
    pub fn queue_multicast(&mut self, group: DevAddr, port: u8, payload: &[u8]) -> Result<()> {
        if !self.device.is_joined() {
            return Err(Error::NotAvail);
        }
        check_payload(payload)?;
        check_app_port(port)?;
        if !self.multicast.find(group).is_some_and(|g| g.handler.is_some()) {
            return Err(Error::Failed);
        }
        self.pending_multicast.insert(group, (port, payload.to_vec()));
        Ok(())
    }

    /// Act on a slot reached by the scheduler.
    pub(crate) fn mesh_on_slot(&mut self, now: Timestamp, action: SlotAction) {
        trace!("slot {} {}", action.slot, action.event_type);
        match action.event_type {
            EventType::Uplink => {
                let port = action.context as u8;
                if let Some(up) = self.pending_uplinks.remove(&port) {
                    if let Err(e) = self.send_frame(port, &up.payload, up.confirmed) {
                        warn!("uplink on port {} failed: {}", port, e);
                    }
                }
            }
            EventType::Multicast => {
                let group = action.context;
                if let Some((port, payload)) = self.pending_multicast.remove(&group) {
                    if let Err(e) = self.send_multicast(group, port, &payload) {
                        warn!("multicast to {:08x} failed: {}", group, e);
                    }
                }
            }
            EventType::SyncRx => {
                if !self.device.class.listens_continuously() {
                    debug!("sync rx for child {:08x} at {} ms", action.context, now.as_millis());
                    self.phy_open_window();
                }
            }
            // The PHY opens the real windows from tx-done.
            EventType::Rx1Window | EventType::Rx2Window => {}
        }
    }

    // --- Network join ---

    /// Activation by personalization.
    pub fn join_abp(&mut self, dev_addr: DevAddr, net_id: u32, keys: SessionKeys) -> Result<()> {
        if dev_addr == 0 {
            return Err(Error::Range);
        }
        self.device.dev_addr = dev_addr;
        self.device.net_id = net_id;
        self.device.keys = keys;
        self.device.uplink_counter = 0;
        self.device.downlink_counter = 0;
        self.device.ctrl.insert(ControlFlags::NETWORK_JOINED);
        self.pending_join = None;
        info!("joined network {:06x} as {:08x} (ABP)", net_id, dev_addr);
        self.push_event(Event::Joined { dev_addr });
        Ok(())
    }

    /// Start over-the-air activation with the configured credentials.
    ///
    /// Completion is reported with `Event::Joined`.
    pub fn join_otaa(&mut self) -> Result<()> {
        let otaa = self.otaa.ok_or(Error::NotAvail)?;
        let dev_nonce = self.radio.random() as u16;
        let req = JoinRequest {
            app_eui: otaa.app_eui,
            dev_eui: otaa.dev_eui,
            dev_nonce,
        };
        let frame = seal_join_request(&self.cipher, &otaa.app_key, &req)?;
        self.mac_put_payload(PHY_FLAG_PRIORITY | PHY_FLAG_RX_WINDOWS, &frame)?;
        self.device.dev_nonce = dev_nonce;
        self.device.ctrl.remove(ControlFlags::NETWORK_JOINED);
        self.pending_join = Some(PendingJoin::Otaa { dev_nonce });
        debug!("join request sent, nonce {:04x}", dev_nonce);
        Ok(())
    }

    // --- Registries ---

    /// Register a child. The first child turns a plain node into a router.
    pub fn add_child_node(&mut self, child: ChildNode) -> Result<()> {
        let dev_addr = child.dev_addr;
        self.children.add(child)?;
        info!("child {:08x} added ({} total)", dev_addr, self.children.len());
        self.push_event(Event::ChildAdded { dev_addr });
        if self.device.role == DeviceRole::Node {
            self.set_role(DeviceRole::Router);
        }
        Ok(())
    }

    /// Unregister a child and release its synchronized receive slots.
    pub fn remove_child_node(&mut self, dev_addr: DevAddr) -> Result<ChildNode> {
        let child = self.children.remove(dev_addr)?;
        if let Some(handler) = child.sync_handler {
            let now = self.clock.now();
            if let Err(e) = self.scheduler.remove_handler(handler, now) {
                warn!("sync slots of {:08x} not released: {}", dev_addr, e);
            }
        }
        info!("child {:08x} removed", dev_addr);
        self.push_event(Event::ChildRemoved { dev_addr });
        if self.children.is_empty() && self.device.role == DeviceRole::Router {
            self.set_role(DeviceRole::Node);
        }
        Ok(child)
    }

    pub fn find_child_node(&self, dev_addr: DevAddr) -> Option<&ChildNode> {
        self.children.find(dev_addr)
    }

    pub fn add_multicast_group(&mut self, group: MulticastGroup) -> Result<()> {
        self.multicast.add(group).map(|_| ())
    }

    /// Unregister a group together with its multicast slots.
    pub fn remove_multicast_group(&mut self, address: DevAddr) -> Result<MulticastGroup> {
        let group = self.multicast.remove(address)?;
        self.pending_multicast.remove(&address);
        if let Some(handler) = group.handler {
            let now = self.clock.now();
            self.scheduler.remove_handler(handler, now)?;
        }
        Ok(group)
    }

    pub fn find_multicast_group(&self, address: DevAddr) -> Option<&MulticastGroup> {
        self.multicast.find(address)
    }
}

#[cfg(test)]
mod tests {
    use alloc::rc::Rc;
    use alloc::vec;
    use alloc::vec::Vec;
    use core::cell::RefCell;

    use super::*;
    use crate::config::{DefaultConfig, MeshSettings, OtaaCredentials};
    use crate::crypto::AesCmacCipher;
    use crate::device::DebugFlags;
    use crate::mac::{open_join_request, seal_join_accept};
    use crate::traits::test_impls::{FixedPosition, MockClock, MockRadio};
    use crate::types::DeviceClass;
    use crate::wire::JoinAccept;

    type TestNode = Node<MockRadio, AesCmacCipher, MockClock, FixedPosition, DefaultConfig>;

    const KEYS: SessionKeys = SessionKeys::new([0x11; 16], [0x22; 16]);

    fn make_node() -> TestNode {
        let settings = MeshSettings::new()
            .with_class(DeviceClass::C)
            .with_debug(DebugFlags::DUTY_CYCLE_OVERRIDE);
        Node::new(
            MockRadio::new(),
            AesCmacCipher::new(),
            MockClock::new(),
            FixedPosition::none(),
            settings,
        )
        .unwrap()
    }

    fn joined_node() -> TestNode {
        let mut node = make_node();
        node.join_abp(0x2600_0001, 0x13, KEYS).unwrap();
        node
    }

    #[test]
    fn test_port_dispatch_only_hits_bound_handler() {
        let mut node = make_node();
        let hits: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(vec![]));
        for port in [2u8, 10, 223] {
            let hits = hits.clone();
            node.register_application(port, move |p: u8, _data: &[u8]| -> Result<()> {
                hits.borrow_mut().push(p);
                Ok(())
            })
            .unwrap();
        }

        node.on_packet_rx(10, &[1, 2]).unwrap();
        assert_eq!(hits.borrow().as_slice(), &[10]);

        assert_eq!(node.on_packet_rx(5, &[1]), Err(Error::Failed));
        assert_eq!(hits.borrow().len(), 1);
    }

    #[test]
    fn test_register_application_rules() {
        let mut node = make_node();
        let noop = |_p: u8, _d: &[u8]| -> Result<()> { Ok(()) };
        assert_eq!(node.register_application(0, noop), Err(Error::Range));
        assert_eq!(node.register_application(224, noop), Err(Error::Range));
        node.register_application(1, noop).unwrap();
        assert_eq!(node.register_application(1, noop), Err(Error::NotAvail));

        node.unregister_application(1).unwrap();
        node.register_application(1, noop).unwrap();
        assert_eq!(node.unregister_application(99), Err(Error::Failed));
    }

    #[test]
    fn test_application_capacity() {
        let mut node = make_node();
        let noop = |_p: u8, _d: &[u8]| -> Result<()> { Ok(()) };
        for port in 1..=DefaultConfig::MAX_APPLICATIONS as u8 {
            node.register_application(port, noop).unwrap();
        }
        assert_eq!(node.register_application(200, noop), Err(Error::NotAvail));
    }

    #[test]
    fn test_send_requires_join() {
        let mut node = make_node();
        assert_eq!(node.send_frame(10, &[1], false), Err(Error::NotAvail));
        assert_eq!(node.send_multicast(0xff00_0001, 10, &[1]), Err(Error::NotAvail));
        assert!(!node.phy().tx_pending());
    }

    #[test]
    fn test_oversized_payload_rejected_without_side_effects() {
        let mut node = joined_node();
        let big = [0u8; LORAMESH_PAYLOAD_SIZE + 1];
        assert_eq!(node.send_frame(10, &big, false), Err(Error::Overflow));
        assert!(!node.phy().tx_pending());
        assert_eq!(node.device().uplink_counter, 0);
        assert!(node.radio().sent.is_empty());

        node.send_frame(10, &[0u8; LORAMESH_PAYLOAD_SIZE], false).unwrap();
        assert!(node.phy().tx_pending());
    }

    #[test]
    fn test_register_transmission_every_4s() {
        let mut node = joined_node();
        let handler = node.register_transmission(10, Duration::from_secs(4)).unwrap();
        assert_eq!(node.scheduler().instances(handler), 8);
        assert_eq!(node.scheduler().len(), 24);
        let kinds: Vec<EventType> = node
            .scheduler()
            .events()
            .take(3)
            .filter_map(|(_, e)| node.scheduler().handler(e.handler).map(|h| h.event_type))
            .collect();
        assert_eq!(
            kinds,
            vec![EventType::Uplink, EventType::Rx1Window, EventType::Rx2Window]
        );

        assert_eq!(
            node.register_transmission(10, Duration::from_secs(4)),
            Err(Error::NotAvail)
        );
        node.unregister_transmission(10).unwrap();
        assert!(node.scheduler().is_empty());
    }

    #[test]
    fn test_register_transmission_failure_returned() {
        let mut node = joined_node();
        // One slot period collides with the uplink's own windows.
        assert_eq!(
            node.register_transmission(10, Duration::from_millis(100)),
            Err(Error::Range)
        );
        assert!(node.scheduler().is_empty());
        assert!(!node.transmissions.contains_key(&10));
    }

    #[test]
    fn test_queue_uplink_needs_schedule() {
        let mut node = joined_node();
        assert_eq!(node.queue_uplink(10, &[1], false), Err(Error::Failed));
        node.register_transmission(10, Duration::from_secs(8)).unwrap();
        node.queue_uplink(10, &[1], false).unwrap();
        assert!(node.pending_uplinks.contains_key(&10));
    }

    #[test]
    fn test_multicast_slot_sends_queued_payload() {
        let mut node = joined_node();
        node.poll(Timestamp::ZERO);
        node.add_multicast_group(MulticastGroup::new(0xff00_0001, KEYS))
            .unwrap();
        node.register_multicast_transmission(0xff00_0001, Duration::from_secs(16))
            .unwrap();
        node.queue_multicast(0xff00_0001, 30, b"all").unwrap();

        node.poll(Timestamp::from_millis(4_000));
        assert_eq!(node.radio().sent.len(), 1);
        assert_eq!(node.find_multicast_group(0xff00_0001).unwrap().downlink_counter, 1);
        assert!(node.pending_multicast.is_empty());

        node.remove_multicast_group(0xff00_0001).unwrap();
        assert!(node.scheduler().is_empty());
    }

    #[test]
    fn test_child_registry_and_roles() {
        let mut node = joined_node();
        node.add_child_node(ChildNode::new(0x2600_1000, KEYS)).unwrap();
        assert_eq!(node.role(), DeviceRole::Router);
        assert_eq!(
            node.add_child_node(ChildNode::new(0x2600_1000, KEYS)),
            Err(Error::Failed)
        );

        let removed = node.remove_child_node(0x2600_1000).unwrap();
        assert_eq!(removed.dev_addr, 0x2600_1000);
        assert!(node.find_child_node(0x2600_1000).is_none());
        assert_eq!(node.role(), DeviceRole::Node);
        assert_eq!(node.remove_child_node(0x2600_1000).err(), Some(Error::Failed));
    }

    #[test]
    fn test_child_removal_frees_sync_slots() {
        let mut node = joined_node();
        let handler = node
            .scheduler
            .register(EventType::SyncRx, Duration::from_secs(16), 0x2600_1000, Timestamp::ZERO)
            .unwrap();
        let mut child = ChildNode::new(0x2600_1000, KEYS);
        child.sync_handler = Some(handler);
        node.add_child_node(child).unwrap();
        assert_eq!(node.scheduler().len(), 2);

        node.remove_child_node(0x2600_1000).unwrap();
        assert!(node.scheduler().is_empty());
        assert!(node.scheduler().handler(handler).is_none());
    }

    #[test]
    fn test_send_to_child_counts_downlinks() {
        let mut node = joined_node();
        assert_eq!(node.send_to_child(0x2600_1000, 10, &[1]), Err(Error::Failed));
        node.add_child_node(ChildNode::new(0x2600_1000, KEYS)).unwrap();
        node.send_to_child(0x2600_1000, 10, &[1]).unwrap();
        assert_eq!(node.find_child_node(0x2600_1000).unwrap().downlink_counter, 1);
    }

    #[test]
    fn test_join_abp_rejects_zero_address() {
        let mut node = make_node();
        assert_eq!(node.join_abp(0, 0, KEYS), Err(Error::Range));
        assert!(!node.is_joined());
    }

    #[test]
    fn test_otaa_join() {
        let app_key = [0x5a; 16];
        let otaa = OtaaCredentials {
            dev_eui: [1, 2, 3, 4, 5, 6, 7, 8],
            app_eui: [8; 8],
            app_key,
        };
        let settings = MeshSettings::new()
            .with_class(DeviceClass::C)
            .with_otaa(otaa)
            .with_debug(DebugFlags::DUTY_CYCLE_OVERRIDE);
        let mut node: TestNode = Node::new(
            MockRadio::new(),
            AesCmacCipher::new(),
            MockClock::new(),
            FixedPosition::none(),
            settings,
        )
        .unwrap();

        node.join_otaa().unwrap();
        node.poll(Timestamp::ZERO);
        node.poll(Timestamp::ZERO);
        let sent = node.radio_mut().take_sent();
        assert_eq!(sent.len(), 1);
        let cipher = AesCmacCipher::new();
        let req = open_join_request(&cipher, &app_key, &sent[0]).unwrap();
        assert_eq!(req.dev_eui, otaa.dev_eui);

        let accept = JoinAccept {
            app_nonce: 0x00_1234,
            net_id: 0x13,
            dev_addr: 0x2601_0042,
            dl_settings: 0,
            rx_delay: 1,
        };
        let frame = seal_join_accept(&cipher, &app_key, &accept).unwrap();
        node.radio().complete_tx();
        node.radio().inject_rx(&frame, -70, 8);
        node.poll(Timestamp::from_millis(100));

        assert!(node.is_joined());
        assert_eq!(node.dev_addr(), 0x2601_0042);
        let expected = crate::crypto::derive_session_keys(
            &cipher,
            &app_key,
            accept.app_nonce,
            accept.net_id,
            req.dev_nonce,
        );
        assert_eq!(node.device().keys, expected);
        assert_eq!(
            node.events().try_receive(),
            Ok(Event::Joined {
                dev_addr: 0x2601_0042
            })
        );
    }

    #[test]
    fn test_otaa_without_credentials() {
        let mut node = make_node();
        assert_eq!(node.join_otaa(), Err(Error::NotAvail));
    }
}
