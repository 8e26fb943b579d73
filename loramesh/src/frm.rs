//! Frame layer: addressing, counters, payload encryption and MAC commands.
//!
//! ## Frame layout (after the MHDR)
//!
//! ```text
//! DevAddr (4) || FCtrl (1) || FCnt (2) || FOpts (0..15) || [FPort (1) || FRMPayload]
//!
//! FCtrl = ADR (7) | ADRACKReq (6) | ACK (5) | FPending (4) | FOptsLen (3..0)
//! ```
//!
//! Counters are 32 bits internally and travel as their low 16 bits. Port 0
//! payloads are encrypted with the network session key, every other port
//! with the application session key.

use log::{debug, info, warn};

use crate::channel::{datarate_params, tx_power_dbm, ChannelMask, DR_MIN};
use crate::config::MeshConfig;
use crate::crypto::payload_crypt;
use crate::device::{ControlFlags, DeviceState};
use crate::mac::{parse_mhdr, seal_data, split_mic, verify_data, MType, MacBuffer};
use crate::node::Node;
use crate::phy::PHY_FLAG_RX_WINDOWS;
use crate::time::Timestamp;
use crate::traits::{Cipher, Clock, PositionSource, Radio};
use crate::types::{
    DevAddr, Error, Event, Payload, Result, SessionKeys, ADR_ACK_DELAY, ADR_ACK_LIMIT,
    FRM_HEADER_SIZE, FRM_PORT_SIZE, LORAMESH_PAYLOAD_SIZE, MAC_HEADER_SIZE, MAC_MAX_PAYLOAD,
    MAX_FOPTS_LEN, PORT_MAC_COMMANDS,
};
use crate::wire::{Encode, MacCommand, Reader, Writer};

pub type FOpts = heapless::Vec<u8, MAX_FOPTS_LEN>;

/// Frame control byte.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FCtrl {
    pub adr: bool,
    /// ADRACKReq on uplinks (RFU on downlinks).
    pub adr_ack_req: bool,
    pub ack: bool,
    pub fpending: bool,
    pub fopts_len: u8,
}

impl FCtrl {
    pub fn to_byte(self) -> u8 {
        (self.adr as u8) << 7
            | (self.adr_ack_req as u8) << 6
            | (self.ack as u8) << 5
            | (self.fpending as u8) << 4
            | (self.fopts_len & 0x0f)
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            adr: b & 0x80 != 0,
            adr_ack_req: b & 0x40 != 0,
            ack: b & 0x20 != 0,
            fpending: b & 0x10 != 0,
            fopts_len: b & 0x0f,
        }
    }
}

/// Parsed data frame. The payload is still encrypted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataFrame<'a> {
    pub mtype: MType,
    pub dev_addr: DevAddr,
    pub fctrl: FCtrl,
    /// Low 16 bits of the frame counter.
    pub fcnt: u16,
    pub fopts: FOpts,
    pub port: Option<u8>,
    pub payload: &'a [u8],
}

/// Split a MAC data frame into its fields without checking the MIC.
pub fn parse_data_frame(frame: &[u8]) -> Result<DataFrame<'_>> {
    let first = frame.first().copied().ok_or(Error::Failed)?;
    let mtype = parse_mhdr(first)?;
    if !mtype.is_uplink() && !mtype.is_downlink() {
        return Err(Error::InvalidType);
    }
    let (msg, _) = split_mic(frame)?;
    if msg.len() < MAC_HEADER_SIZE + FRM_HEADER_SIZE {
        return Err(Error::Failed);
    }

    let mut r = Reader::new(&msg[MAC_HEADER_SIZE..]);
    let dev_addr = r.read_u32_le()?;
    let fctrl = FCtrl::from_byte(r.read_u8()?);
    let fcnt = r.read_u16_le()?;
    let mut fopts = FOpts::new();
    fopts
        .extend_from_slice(r.read_bytes(fctrl.fopts_len as usize)?)
        .map_err(|_| Error::Overflow)?;
    let (port, payload) = if r.is_empty() {
        (None, &[][..])
    } else {
        (Some(r.read_u8()?), r.read_rest())
    };

    Ok(DataFrame {
        mtype,
        dev_addr,
        fctrl,
        fcnt,
        fopts,
        port,
        payload,
    })
}

/// Recover a 32-bit counter from its low 16 bits and the next expected value.
pub fn extend_counter(expected: u32, fcnt: u16) -> u32 {
    let candidate = (expected & 0xffff_0000) | fcnt as u32;
    if candidate < expected {
        candidate.wrapping_add(0x1_0000)
    } else {
        candidate
    }
}

/// Fields of an outbound data frame.
#[derive(Clone, Copy, Debug)]
pub struct OutFrame<'a> {
    pub mtype: MType,
    pub dev_addr: DevAddr,
    pub fctrl: FCtrl,
    pub fcnt: u32,
    pub fopts: &'a [u8],
    pub port: Option<u8>,
    pub payload: &'a [u8],
}

/// Encrypt the payload, lay out the frame and seal it at the MAC layer.
pub fn build_data_frame<C: Cipher>(
    cipher: &C,
    keys: &SessionKeys,
    f: &OutFrame<'_>,
) -> Result<MacBuffer> {
    if f.fopts.len() > MAX_FOPTS_LEN {
        return Err(Error::Overflow);
    }
    match f.port {
        None if !f.payload.is_empty() => return Err(Error::Range),
        Some(PORT_MAC_COMMANDS) if !f.fopts.is_empty() => return Err(Error::Range),
        _ => {}
    }

    let mut w = Writer::with_capacity(FRM_HEADER_SIZE + f.fopts.len() + 1 + f.payload.len());
    w.write_u32_le(f.dev_addr);
    w.write_u8(
        FCtrl {
            fopts_len: f.fopts.len() as u8,
            ..f.fctrl
        }
        .to_byte(),
    );
    w.write_u16_le(f.fcnt as u16);
    w.write_bytes(f.fopts);
    if let Some(port) = f.port {
        w.write_u8(port);
        let mut body = f.payload.to_vec();
        payload_crypt(
            cipher,
            keys.payload_key(port),
            f.dev_addr,
            f.mtype.direction(),
            f.fcnt,
            &mut body,
        );
        w.write_bytes(&body);
    }

    seal_data(cipher, f.mtype, w.as_slice(), &keys.nwk, f.dev_addr, f.fcnt)
}

/// Verify a parsed frame against `expected` and decrypt its payload.
///
/// Returns the full counter of the frame and the plaintext.
pub fn open_data_frame<C: Cipher>(
    cipher: &C,
    keys: &SessionKeys,
    frame: &[u8],
    parsed: &DataFrame<'_>,
    expected: u32,
) -> Result<(u32, Payload)> {
    let fcnt = extend_counter(expected, parsed.fcnt);
    verify_data(
        cipher,
        frame,
        &keys.nwk,
        parsed.dev_addr,
        parsed.mtype.direction(),
        fcnt,
    )?;
    let mut payload = parsed.payload.to_vec();
    if let Some(port) = parsed.port {
        payload_crypt(
            cipher,
            keys.payload_key(port),
            parsed.dev_addr,
            parsed.mtype.direction(),
            fcnt,
            &mut payload,
        );
    }
    Ok((fcnt, payload))
}

/// Apply the ADR back-off once the network has been silent for too long.
///
/// Steps the datarate down, or re-enables the default channels when already
/// at the lowest datarate, and restarts the count.
pub fn adr_backoff(dev: &mut DeviceState, default_mask: ChannelMask) {
    if !dev.ctrl.contains(ControlFlags::ADR) {
        return;
    }
    if dev.adr_ack_counter >= ADR_ACK_LIMIT + ADR_ACK_DELAY {
        if dev.datarate > DR_MIN {
            dev.datarate -= 1;
            debug!("ADR back-off to DR{}", dev.datarate);
        } else {
            dev.channel_mask = default_mask;
        }
        dev.adr_ack_counter = 0;
    }
}

/// Whether the next uplink should carry ADRACKReq.
pub fn adr_ack_requested(dev: &DeviceState) -> bool {
    dev.ctrl.contains(ControlFlags::ADR) && dev.adr_ack_counter >= ADR_ACK_LIMIT
}

impl<R, Cip, Clk, P, C> Node<R, Cip, Clk, P, C>
where
    R: Radio,
    Cip: Cipher,
    Clk: Clock,
    P: PositionSource,
    C: MeshConfig,
{
    /// Send a data frame from this node towards its parent.
    pub(crate) fn frm_send_uplink(&mut self, port: u8, payload: &[u8], confirmed: bool) -> Result<()> {
        adr_backoff(&mut self.device, self.channels.default_mask());

        let room = MAC_MAX_PAYLOAD - FRM_HEADER_SIZE - FRM_PORT_SIZE - payload.len().min(LORAMESH_PAYLOAD_SIZE);
        let fopts: FOpts = if port == PORT_MAC_COMMANDS || self.mac_answers.len() > room {
            // Answers wait for a frame with room for them.
            FOpts::new()
        } else {
            self.mac_answers.clone()
        };
        let mtype = if confirmed {
            MType::ConfirmedUp
        } else {
            MType::UnconfirmedUp
        };
        let fctrl = FCtrl {
            adr: self.device.ctrl.contains(ControlFlags::ADR),
            adr_ack_req: adr_ack_requested(&self.device),
            ack: self.device.ctrl.contains(ControlFlags::ACK_PENDING),
            ..FCtrl::default()
        };
        let out = OutFrame {
            mtype,
            dev_addr: self.device.dev_addr,
            fctrl,
            fcnt: self.device.uplink_counter,
            fopts: &fopts,
            port: Some(port),
            payload,
        };
        let frame = build_data_frame(&self.cipher, &self.device.keys, &out)?;
        self.mac_put_payload(PHY_FLAG_RX_WINDOWS, &frame)?;

        let fcnt = self.device.next_uplink_counter();
        debug!("uplink fcnt {} port {} ({} bytes)", fcnt, port, payload.len());
        self.device.ctrl.remove(ControlFlags::ACK_PENDING);
        self.device.ctrl.set(ControlFlags::ACK_REQUESTED, confirmed);
        if !fopts.is_empty() {
            self.mac_answers.clear();
        }
        if self.device.ctrl.contains(ControlFlags::ADR) {
            self.device.adr_ack_counter = self.device.adr_ack_counter.saturating_add(1);
        }
        Ok(())
    }

    /// Send an unconfirmed downlink to a child or multicast group.
    pub(crate) fn frm_send_downlink(
        &mut self,
        dev_addr: DevAddr,
        keys: &SessionKeys,
        fcnt: u32,
        port: u8,
        payload: &[u8],
    ) -> Result<()> {
        let out = OutFrame {
            mtype: MType::UnconfirmedDown,
            dev_addr,
            fctrl: FCtrl::default(),
            fcnt,
            fopts: &[],
            port: Some(port),
            payload,
        };
        let frame = build_data_frame(&self.cipher, keys, &out)?;
        self.mac_put_payload(0, &frame)
    }

    /// Handle a received data frame.
    ///
    /// Uplinks are accepted only from registered children. Downlinks are
    /// accepted when addressed to us or to a multicast group we belong to.
    pub(crate) fn frm_on_frame(&mut self, _now: Timestamp, frame: &[u8]) -> Result<()> {
        let parsed = parse_data_frame(frame)?;
        let addr = parsed.dev_addr;

        let payload = if parsed.mtype.is_uplink() {
            let child = self.children.find(addr).ok_or(Error::Failed)?;
            let (keys, expected) = (child.keys, child.uplink_counter);
            let (fcnt, payload) = open_data_frame(&self.cipher, &keys, frame, &parsed, expected)?;
            if let Some(child) = self.children.find_mut(addr) {
                child.uplink_counter = fcnt.wrapping_add(1);
            }
            debug!("uplink from child {:08x} fcnt {}", addr, fcnt);
            self.frm_child_commands(addr, &parsed.fopts);
            if parsed.port == Some(PORT_MAC_COMMANDS) {
                self.frm_child_commands(addr, &payload);
            }
            payload
        } else if addr == self.device.dev_addr && self.device.is_joined() {
            let keys = self.device.keys;
            let expected = self.device.downlink_counter;
            let (fcnt, payload) = open_data_frame(&self.cipher, &keys, frame, &parsed, expected)?;
            self.device.downlink_counter = fcnt.wrapping_add(1);
            self.device.adr_ack_counter = 0;
            if parsed.fctrl.ack {
                self.device.ctrl.remove(ControlFlags::ACK_REQUESTED);
                self.push_event(Event::AckReceived);
            }
            if parsed.mtype.is_confirmed() {
                self.device.ctrl.insert(ControlFlags::ACK_PENDING);
            }
            self.frm_commands(&parsed.fopts);
            if parsed.port == Some(PORT_MAC_COMMANDS) {
                self.frm_commands(&payload);
            }
            payload
        } else if let Some(group) = self.multicast.find(addr) {
            let (keys, expected) = (group.keys, group.downlink_counter);
            let (fcnt, payload) = open_data_frame(&self.cipher, &keys, frame, &parsed, expected)?;
            if let Some(group) = self.multicast.find_mut(addr) {
                group.downlink_counter = fcnt.wrapping_add(1);
            }
            payload
        } else {
            return Err(Error::Failed);
        };

        match parsed.port {
            Some(port) if port != PORT_MAC_COMMANDS => self.on_packet_rx(port, &payload),
            _ => Ok(()),
        }
    }

    /// Execute commands received from our parent and queue their answers.
    fn frm_commands(&mut self, data: &[u8]) {
        let mut r = Reader::new(data);
        while !r.is_empty() {
            let cmd = match MacCommand::decode_downlink(&mut r) {
                Ok(cmd) => cmd,
                Err(e) => {
                    debug!("MAC command parse stopped: {:?}", e);
                    return;
                }
            };
            if let Some(answer) = self.frm_apply_command(cmd) {
                self.frm_queue_command(answer);
            }
        }
    }

    fn frm_apply_command(&mut self, cmd: MacCommand) -> Option<MacCommand> {
        match cmd {
            MacCommand::LinkCheckAns { margin, gateways } => {
                self.push_event(Event::LinkCheck { margin, gateways });
                None
            }
            MacCommand::LinkAdrReq {
                datarate,
                tx_power,
                channel_mask,
                ..
            } => {
                let mask_ok = channel_mask != 0 && self.channels.mask_is_valid(channel_mask);
                let dr_ok = datarate_params(datarate).is_some();
                let power_ok = tx_power_dbm(tx_power).is_some();
                let status = (power_ok as u8) << 2 | (dr_ok as u8) << 1 | mask_ok as u8;
                if mask_ok && dr_ok && power_ok {
                    self.device.channel_mask = channel_mask;
                    self.device.datarate = datarate;
                    self.device.tx_power = tx_power;
                    info!("link ADR: DR{} power {} mask {:04x}", datarate, tx_power, channel_mask);
                }
                Some(MacCommand::LinkAdrAns { status })
            }
            MacCommand::DutyCycleReq { max_dcycle } => {
                self.channels
                    .set_aggregated_dcycle(1u16 << max_dcycle.min(15));
                Some(MacCommand::DutyCycleAns)
            }
            MacCommand::DevStatusReq => Some(MacCommand::DevStatusAns {
                battery: 255,
                margin: self.device.last_snr,
            }),
            _ => None,
        }
    }

    /// Queue a MAC command for the FOpts of the next uplink.
    pub(crate) fn frm_queue_command(&mut self, cmd: MacCommand) {
        let mut w = Writer::new();
        cmd.encode(&mut w);
        if self.mac_answers.extend_from_slice(w.as_slice()).is_err() {
            warn!("FOpts full, dropping {:?}", cmd);
        }
    }

    fn frm_child_commands(&mut self, child: DevAddr, data: &[u8]) {
        let mut r = Reader::new(data);
        while !r.is_empty() {
            match MacCommand::decode_uplink(&mut r) {
                Ok(cmd) => debug!("child {:08x} sent {:?}", child, cmd),
                Err(_) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::config::{DefaultConfig, MeshSettings};
    use crate::crypto::AesCmacCipher;
    use crate::device::DebugFlags;
    use crate::phy::PhyPacket;
    use crate::registry::{ChildNode, MulticastGroup};
    use crate::traits::test_impls::{FixedPosition, MockClock, MockRadio};
    use crate::types::DeviceClass;

    type TestNode = Node<MockRadio, AesCmacCipher, MockClock, FixedPosition, DefaultConfig>;

    const NET_KEYS: SessionKeys = SessionKeys::new([0x11; 16], [0x22; 16]);

    fn make_node(addr: DevAddr) -> TestNode {
        let settings = MeshSettings::new()
            .with_class(DeviceClass::C)
            .with_debug(DebugFlags::DUTY_CYCLE_OVERRIDE);
        let mut node = Node::new(
            MockRadio::new(),
            AesCmacCipher::new(),
            MockClock::new(),
            FixedPosition::none(),
            settings,
        )
        .unwrap();
        node.join_abp(addr, 0x13, NET_KEYS).unwrap();
        node
    }

    fn frame(mtype: MType, addr: DevAddr, fcnt: u32, port: u8, payload: &[u8]) -> MacBuffer {
        let out = OutFrame {
            mtype,
            dev_addr: addr,
            fctrl: FCtrl::default(),
            fcnt,
            fopts: &[],
            port: Some(port),
            payload,
        };
        build_data_frame(&AesCmacCipher::new(), &NET_KEYS, &out).unwrap()
    }

    fn queued(node: &TestNode) -> Option<MacBuffer> {
        node.phy.take_tx().map(|buf| {
            let mut out = MacBuffer::new();
            let _ = out.extend_from_slice(PhyPacket::parse(&buf).unwrap().payload);
            out
        })
    }

    #[test]
    fn test_fctrl_bits() {
        let fctrl = FCtrl {
            adr: true,
            adr_ack_req: false,
            ack: true,
            fpending: false,
            fopts_len: 3,
        };
        assert_eq!(fctrl.to_byte(), 0xa3);
        assert_eq!(FCtrl::from_byte(0xa3), fctrl);
        assert!(FCtrl::from_byte(0x40).adr_ack_req);
        assert!(FCtrl::from_byte(0x10).fpending);
    }

    #[test]
    fn test_counter_extension() {
        assert_eq!(extend_counter(0, 0), 0);
        assert_eq!(extend_counter(5, 7), 7);
        assert_eq!(extend_counter(0x0001_fff0, 0xfff5), 0x0001_fff5);
        // Low half wrapped past the expected value.
        assert_eq!(extend_counter(0x0001_fff0, 0x0002), 0x0002_0002);
        assert_eq!(extend_counter(0xffff, 0x0000), 0x1_0000);
    }

    #[test]
    fn test_round_trip_every_port_key() {
        let cipher = AesCmacCipher::new();
        let payload = b"temperature=21.5";
        for port in [0u8, 1, 10, 223] {
            let buf = frame(MType::UnconfirmedUp, 0x2600_0007, 3, port, payload);
            let parsed = parse_data_frame(&buf).unwrap();
            assert_eq!(parsed.port, Some(port));
            assert_ne!(parsed.payload, &payload[..]);
            let (fcnt, plain) = open_data_frame(&cipher, &NET_KEYS, &buf, &parsed, 0).unwrap();
            assert_eq!(fcnt, 3);
            assert_eq!(plain, payload.to_vec());
        }
    }

    #[test]
    fn test_any_corruption_fails_mic() {
        let cipher = AesCmacCipher::new();
        let buf = frame(MType::UnconfirmedDown, 0x2600_0007, 1, 5, &[1, 2, 3, 4]);
        for i in 0..buf.len() {
            let mut bad = buf.clone();
            bad[i] ^= 0x04;
            let result = parse_data_frame(&bad)
                .and_then(|p| open_data_frame(&cipher, &NET_KEYS, &bad, &p, 0).map(|_| ()));
            assert!(result.is_err(), "corruption at byte {} not detected", i);
        }
    }

    #[test]
    fn test_frame_without_port() {
        let cipher = AesCmacCipher::new();
        let out = OutFrame {
            mtype: MType::UnconfirmedUp,
            dev_addr: 9,
            fctrl: FCtrl::default(),
            fcnt: 0,
            fopts: &[0x02],
            port: None,
            payload: &[],
        };
        let buf = build_data_frame(&cipher, &NET_KEYS, &out).unwrap();
        let parsed = parse_data_frame(&buf).unwrap();
        assert_eq!(parsed.port, None);
        assert_eq!(parsed.fopts.as_slice(), &[0x02]);
        assert_eq!(parsed.fctrl.fopts_len, 1);
    }

    #[test]
    fn test_build_rejects_bad_layouts() {
        let cipher = AesCmacCipher::new();
        let mut out = OutFrame {
            mtype: MType::UnconfirmedUp,
            dev_addr: 9,
            fctrl: FCtrl::default(),
            fcnt: 0,
            fopts: &[],
            port: None,
            payload: &[1],
        };
        assert_eq!(build_data_frame(&cipher, &NET_KEYS, &out), Err(Error::Range));
        out.port = Some(0);
        out.fopts = &[0x02];
        assert_eq!(build_data_frame(&cipher, &NET_KEYS, &out), Err(Error::Range));
    }

    #[test]
    fn test_uplink_from_unknown_child_rejected() {
        let mut node = make_node(0x2600_0001);
        let buf = frame(MType::UnconfirmedUp, 0x2600_0099, 0, 10, &[1]);
        assert_eq!(node.frm_on_frame(Timestamp::ZERO, &buf), Err(Error::Failed));
    }

    #[test]
    fn test_uplink_from_child_uses_child_keys_and_counter() {
        let mut node = make_node(0x2600_0001);
        let seen = alloc::rc::Rc::new(core::cell::RefCell::new(vec![]));
        let sink = seen.clone();
        node.register_application(10, move |_port: u8, data: &[u8]| -> Result<()> {
            sink.borrow_mut().push(data.to_vec());
            Ok(())
        })
        .unwrap();
        node.add_child_node(ChildNode::new(0x2600_0042, NET_KEYS)).unwrap();

        let buf = frame(MType::UnconfirmedUp, 0x2600_0042, 4, 10, b"hi");
        node.frm_on_frame(Timestamp::ZERO, &buf).unwrap();
        assert_eq!(seen.borrow().as_slice(), &[b"hi".to_vec()]);
        assert_eq!(node.find_child_node(0x2600_0042).unwrap().uplink_counter, 5);

        // Child keys differ from ours: a frame sealed with network keys fails.
        node.remove_child_node(0x2600_0042).unwrap();
        let other = SessionKeys::new([0x33; 16], [0x44; 16]);
        node.add_child_node(ChildNode::new(0x2600_0042, other)).unwrap();
        let buf = frame(MType::UnconfirmedUp, 0x2600_0042, 5, 10, b"hi");
        assert_eq!(node.frm_on_frame(Timestamp::ZERO, &buf), Err(Error::Failed));
    }

    #[test]
    fn test_multicast_downlink_uses_group_keys() {
        let mut node = make_node(0x2600_0001);
        node.register_application(20, |_port: u8, _data: &[u8]| -> Result<()> { Ok(()) })
            .unwrap();
        let buf = frame(MType::UnconfirmedDown, 0xff00_0001, 0, 20, &[7]);
        assert_eq!(node.frm_on_frame(Timestamp::ZERO, &buf), Err(Error::Failed));

        node.add_multicast_group(MulticastGroup::new(0xff00_0001, NET_KEYS))
            .unwrap();
        node.frm_on_frame(Timestamp::ZERO, &buf).unwrap();
        assert_eq!(
            node.find_multicast_group(0xff00_0001).unwrap().downlink_counter,
            1
        );
    }

    #[test]
    fn test_confirmed_downlink_sets_ack_pending() {
        let mut node = make_node(0x2600_0001);
        node.register_application(10, |_port: u8, _data: &[u8]| -> Result<()> { Ok(()) })
            .unwrap();
        let buf = frame(MType::ConfirmedDown, 0x2600_0001, 0, 10, &[1]);
        node.frm_on_frame(Timestamp::ZERO, &buf).unwrap();
        assert!(node.device().ctrl.contains(ControlFlags::ACK_PENDING));
        assert_eq!(node.device().downlink_counter, 1);

        node.frm_send_uplink(10, &[2], false).unwrap();
        let sent = queued(&node).unwrap();
        assert!(parse_data_frame(&sent).unwrap().fctrl.ack);
        assert!(!node.device().ctrl.contains(ControlFlags::ACK_PENDING));
    }

    #[test]
    fn test_ack_clears_request() {
        let mut node = make_node(0x2600_0001);
        node.frm_send_uplink(10, &[1], true).unwrap();
        assert!(node.device().ctrl.contains(ControlFlags::ACK_REQUESTED));

        let out = OutFrame {
            mtype: MType::UnconfirmedDown,
            dev_addr: 0x2600_0001,
            fctrl: FCtrl {
                ack: true,
                ..FCtrl::default()
            },
            fcnt: 0,
            fopts: &[],
            port: None,
            payload: &[],
        };
        let buf = build_data_frame(&AesCmacCipher::new(), &NET_KEYS, &out).unwrap();
        node.frm_on_frame(Timestamp::ZERO, &buf).unwrap();
        assert!(!node.device().ctrl.contains(ControlFlags::ACK_REQUESTED));
        assert_eq!(node.events().try_receive(), Ok(Event::Joined { dev_addr: 0x2600_0001 }));
        assert_eq!(node.events().try_receive(), Ok(Event::AckReceived));
    }

    #[test]
    fn test_link_adr_and_dev_status_answers_ride_next_uplink() {
        let mut node = make_node(0x2600_0001);
        let mut w = Writer::new();
        MacCommand::LinkAdrReq {
            datarate: 2,
            tx_power: 3,
            channel_mask: 0b011,
            redundancy: 0,
        }
        .encode(&mut w);
        MacCommand::DevStatusReq.encode(&mut w);
        let fopts = w.finish();
        let out = OutFrame {
            mtype: MType::UnconfirmedDown,
            dev_addr: 0x2600_0001,
            fctrl: FCtrl::default(),
            fcnt: 0,
            fopts: &fopts,
            port: None,
            payload: &[],
        };
        let buf = build_data_frame(&AesCmacCipher::new(), &NET_KEYS, &out).unwrap();
        node.frm_on_frame(Timestamp::ZERO, &buf).unwrap();

        assert_eq!(node.device().datarate, 2);
        assert_eq!(node.device().tx_power, 3);
        assert_eq!(node.device().channel_mask, 0b011);

        node.frm_send_uplink(10, &[1], false).unwrap();
        let sent = queued(&node).unwrap();
        let parsed = parse_data_frame(&sent).unwrap();
        assert_eq!(parsed.fopts.as_slice(), &[0x03, 0x07, 0x06, 0xff, 0x00]);
        assert!(node.mac_answers.is_empty());
    }

    #[test]
    fn test_link_adr_rejects_unknown_channels() {
        let mut node = make_node(0x2600_0001);
        let answer = node.frm_apply_command(MacCommand::LinkAdrReq {
            datarate: 2,
            tx_power: 1,
            channel_mask: 0b1000_0000,
            redundancy: 0,
        });
        assert_eq!(answer, Some(MacCommand::LinkAdrAns { status: 0b110 }));
        assert_eq!(node.device().datarate, 5);
    }

    #[test]
    fn test_adr_backoff_sequence() {
        let mut dev = DeviceState::new(&MeshSettings::new().with_adr(true).with_datarate(1));
        dev.adr_ack_counter = ADR_ACK_LIMIT - 1;
        assert!(!adr_ack_requested(&dev));
        dev.adr_ack_counter = ADR_ACK_LIMIT;
        assert!(adr_ack_requested(&dev));

        dev.adr_ack_counter = ADR_ACK_LIMIT + ADR_ACK_DELAY;
        adr_backoff(&mut dev, 0b111);
        assert_eq!(dev.datarate, 0);
        assert_eq!(dev.adr_ack_counter, 0);

        // At DR0 the default channels come back instead.
        dev.channel_mask = 0b001;
        dev.adr_ack_counter = ADR_ACK_LIMIT + ADR_ACK_DELAY;
        adr_backoff(&mut dev, 0b111);
        assert_eq!(dev.datarate, 0);
        assert_eq!(dev.channel_mask, 0b111);
    }

    #[test]
    fn test_uplink_sets_adr_ack_req_after_limit() {
        let mut node = make_node(0x2600_0001);
        node.device.ctrl.insert(ControlFlags::ADR);
        node.device.adr_ack_counter = ADR_ACK_LIMIT;
        node.frm_send_uplink(10, &[1], false).unwrap();
        let sent = queued(&node).unwrap();
        let fctrl = parse_data_frame(&sent).unwrap().fctrl;
        assert!(fctrl.adr);
        assert!(fctrl.adr_ack_req);
        assert_eq!(node.device().adr_ack_counter, ADR_ACK_LIMIT + 1);
    }

    #[test]
    fn test_busy_phy_does_not_consume_counter() {
        let mut node = make_node(0x2600_0001);
        node.frm_send_uplink(10, &[1], false).unwrap();
        assert_eq!(node.frm_send_uplink(10, &[2], false), Err(Error::Busy));
        assert_eq!(node.device().uplink_counter, 1);
    }
}
