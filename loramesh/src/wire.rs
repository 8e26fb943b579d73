//! Wire format serialization and deserialization.
//!
//! All multi-byte integers are little-endian.
//!
//! ## Mesh control frames (Proprietary MType)
//!
//! ```text
//! MHDR (1) || cmd (1) || body || MIC (4)
//!
//! 0x01 beacon:       addr (4) || role<<4|rank (1) || lat (4) || lon (4)
//!                    || coordinator (4) || slot_time (4)
//!                    || interval_s (1) || duration_s (1)
//! 0x02 join request: requester (4) || nonce (2) || target (4)
//!                    || periodicity_s (2) || class (1)
//! 0x03 join accept:  requester (4) || nonce (2) || assigned (4) || parent (4)
//! ```
//!
//! ## OTAA bodies (between MHDR and MIC)
//!
//! ```text
//! join request: AppEUI (8) || DevEUI (8) || DevNonce (2)
//! join accept:  AppNonce (3) || NetID (3) || DevAddr (4) || DLSettings (1) || RxDelay (1)
//! ```

use alloc::vec::Vec;

use crate::traits::Position;
use crate::types::{DevAddr, DeviceClass, DeviceRole, Error, Eui, MAX_RANK};

/// Decoding error types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Unexpected end of buffer.
    UnexpectedEof,
    /// Invalid length value or trailing bytes.
    InvalidLength,
    /// Invalid message or command type.
    InvalidMessageType,
    /// Field outside its valid domain.
    InvalidValue,
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::InvalidMessageType => Error::InvalidType,
            _ => Error::Failed,
        }
    }
}

/// Zero-copy reader over a byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Returns the number of bytes remaining.
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        if self.pos >= self.buf.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    /// Read a fixed number of bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.pos + len > self.buf.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Everything left in the buffer.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos.min(self.buf.len())..];
        self.pos = self.buf.len();
        slice
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Read a 24-bit little-endian value.
    pub fn read_u24_le(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_bytes(3)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, DecodeError> {
        self.read_u32_le().map(|v| v as i32)
    }

    /// Read an EUI transmitted least significant byte first.
    pub fn read_eui(&mut self) -> Result<Eui, DecodeError> {
        let bytes = self.read_bytes(8)?;
        let mut eui = [0u8; 8];
        for (dst, src) in eui.iter_mut().zip(bytes.iter().rev()) {
            *dst = *src;
        }
        Ok(eui)
    }
}

/// Writer for encoding messages.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn write_u16_le(&mut self, v: u16) {
        self.write_bytes(&v.to_le_bytes());
    }

    /// Write the low 24 bits of `v`.
    pub fn write_u24_le(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes()[..3]);
    }

    pub fn write_u32_le(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i32_le(&mut self, v: i32) {
        self.write_u32_le(v as u32);
    }

    pub fn write_eui(&mut self, eui: &Eui) {
        for b in eui.iter().rev() {
            self.write_u8(*b);
        }
    }

    /// Finish writing and return the buffer.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

/// Trait for types that can be encoded to wire format.
pub trait Encode {
    fn encode(&self, w: &mut Writer);

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.finish()
    }
}

/// Trait for types that can be decoded from wire format.
pub trait Decode: Sized {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError>;

    /// Decode from a byte slice (strict: rejects trailing bytes).
    fn decode_from_slice(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(data);
        let result = Self::decode(&mut r)?;
        if !r.is_empty() {
            return Err(DecodeError::InvalidLength);
        }
        Ok(result)
    }
}

// Mesh control command identifiers
pub const CMD_BEACON: u8 = 0x01;
pub const CMD_JOIN_MESH_REQ: u8 = 0x02;
pub const CMD_JOIN_MESH_ACCEPT: u8 = 0x03;

/// Advertising beacon.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Beacon {
    pub dev_addr: DevAddr,
    pub role: DeviceRole,
    pub rank: u8,
    pub position: Position,
    pub coordinator: DevAddr,
    /// Offset of the advertising slot in the superframe, ms.
    pub slot_time: u32,
    pub interval_s: u8,
    pub duration_s: u8,
}

impl Encode for Beacon {
    fn encode(&self, w: &mut Writer) {
        w.write_u32_le(self.dev_addr);
        w.write_u8(((self.role as u8) << 4) | (self.rank & 0x0f));
        w.write_i32_le(self.position.lat);
        w.write_i32_le(self.position.lon);
        w.write_u32_le(self.coordinator);
        w.write_u32_le(self.slot_time);
        w.write_u8(self.interval_s);
        w.write_u8(self.duration_s);
    }
}

impl Decode for Beacon {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let dev_addr = r.read_u32_le()?;
        let role_rank = r.read_u8()?;
        let role = DeviceRole::from_bits(role_rank >> 4).ok_or(DecodeError::InvalidValue)?;
        let rank = role_rank & 0x0f;
        let lat = r.read_i32_le()?;
        let lon = r.read_i32_le()?;
        let coordinator = r.read_u32_le()?;
        let slot_time = r.read_u32_le()?;
        let interval_s = r.read_u8()?;
        let duration_s = r.read_u8()?;

        if dev_addr == 0 || rank > MAX_RANK {
            return Err(DecodeError::InvalidValue);
        }

        Ok(Beacon {
            dev_addr,
            role,
            rank,
            position: Position::new(lat, lon),
            coordinator,
            slot_time,
            interval_s,
            duration_s,
        })
    }
}

/// Request to join the mesh below `target`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JoinMeshRequest {
    pub requester: DevAddr,
    pub nonce: u16,
    pub target: DevAddr,
    /// Uplink periodicity the child intends to use, seconds.
    pub periodicity_s: u16,
    pub class: DeviceClass,
}

impl Encode for JoinMeshRequest {
    fn encode(&self, w: &mut Writer) {
        w.write_u32_le(self.requester);
        w.write_u16_le(self.nonce);
        w.write_u32_le(self.target);
        w.write_u16_le(self.periodicity_s);
        w.write_u8(self.class.to_bits());
    }
}

impl Decode for JoinMeshRequest {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let requester = r.read_u32_le()?;
        let nonce = r.read_u16_le()?;
        let target = r.read_u32_le()?;
        let periodicity_s = r.read_u16_le()?;
        let class = DeviceClass::from_bits(r.read_u8()?).ok_or(DecodeError::InvalidValue)?;
        Ok(JoinMeshRequest {
            requester,
            nonce,
            target,
            periodicity_s,
            class,
        })
    }
}

/// Parent's answer to a join-mesh request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JoinMeshAccept {
    pub requester: DevAddr,
    pub nonce: u16,
    pub assigned: DevAddr,
    pub parent: DevAddr,
}

impl Encode for JoinMeshAccept {
    fn encode(&self, w: &mut Writer) {
        w.write_u32_le(self.requester);
        w.write_u16_le(self.nonce);
        w.write_u32_le(self.assigned);
        w.write_u32_le(self.parent);
    }
}

impl Decode for JoinMeshAccept {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let requester = r.read_u32_le()?;
        let nonce = r.read_u16_le()?;
        let assigned = r.read_u32_le()?;
        let parent = r.read_u32_le()?;
        if assigned == 0 {
            return Err(DecodeError::InvalidValue);
        }
        Ok(JoinMeshAccept {
            requester,
            nonce,
            assigned,
            parent,
        })
    }
}

/// Body of a mesh control frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    Beacon(Beacon),
    JoinMeshRequest(JoinMeshRequest),
    JoinMeshAccept(JoinMeshAccept),
}

impl ControlMessage {
    pub fn command(&self) -> u8 {
        match self {
            ControlMessage::Beacon(_) => CMD_BEACON,
            ControlMessage::JoinMeshRequest(_) => CMD_JOIN_MESH_REQ,
            ControlMessage::JoinMeshAccept(_) => CMD_JOIN_MESH_ACCEPT,
        }
    }
}

impl Encode for ControlMessage {
    fn encode(&self, w: &mut Writer) {
        w.write_u8(self.command());
        match self {
            ControlMessage::Beacon(b) => b.encode(w),
            ControlMessage::JoinMeshRequest(m) => m.encode(w),
            ControlMessage::JoinMeshAccept(m) => m.encode(w),
        }
    }
}

impl Decode for ControlMessage {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        match r.read_u8()? {
            CMD_BEACON => Ok(ControlMessage::Beacon(Beacon::decode(r)?)),
            CMD_JOIN_MESH_REQ => Ok(ControlMessage::JoinMeshRequest(JoinMeshRequest::decode(r)?)),
            CMD_JOIN_MESH_ACCEPT => Ok(ControlMessage::JoinMeshAccept(JoinMeshAccept::decode(r)?)),
            _ => Err(DecodeError::InvalidMessageType),
        }
    }
}

/// OTAA join request body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JoinRequest {
    pub app_eui: Eui,
    pub dev_eui: Eui,
    pub dev_nonce: u16,
}

impl Encode for JoinRequest {
    fn encode(&self, w: &mut Writer) {
        w.write_eui(&self.app_eui);
        w.write_eui(&self.dev_eui);
        w.write_u16_le(self.dev_nonce);
    }
}

impl Decode for JoinRequest {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(JoinRequest {
            app_eui: r.read_eui()?,
            dev_eui: r.read_eui()?,
            dev_nonce: r.read_u16_le()?,
        })
    }
}

/// OTAA join accept body (decrypted, without MIC).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JoinAccept {
    pub app_nonce: u32,
    pub net_id: u32,
    pub dev_addr: DevAddr,
    pub dl_settings: u8,
    pub rx_delay: u8,
}

impl Encode for JoinAccept {
    fn encode(&self, w: &mut Writer) {
        w.write_u24_le(self.app_nonce);
        w.write_u24_le(self.net_id);
        w.write_u32_le(self.dev_addr);
        w.write_u8(self.dl_settings);
        w.write_u8(self.rx_delay);
    }
}

impl Decode for JoinAccept {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(JoinAccept {
            app_nonce: r.read_u24_le()?,
            net_id: r.read_u24_le()?,
            dev_addr: r.read_u32_le()?,
            dl_settings: r.read_u8()?,
            rx_delay: r.read_u8()?,
        })
    }
}

// MAC command identifiers
pub const CID_LINK_CHECK: u8 = 0x02;
pub const CID_LINK_ADR: u8 = 0x03;
pub const CID_DUTY_CYCLE: u8 = 0x04;
pub const CID_DEV_STATUS: u8 = 0x06;

/// MAC command carried in FOpts or on port 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MacCommand {
    LinkCheckReq,
    LinkCheckAns { margin: u8, gateways: u8 },
    LinkAdrReq { datarate: u8, tx_power: u8, channel_mask: u16, redundancy: u8 },
    /// Bits: 0 channel mask ok, 1 datarate ok, 2 power ok.
    LinkAdrAns { status: u8 },
    DutyCycleReq { max_dcycle: u8 },
    DutyCycleAns,
    DevStatusReq,
    DevStatusAns { battery: u8, margin: i8 },
}

impl MacCommand {
    pub fn cid(&self) -> u8 {
        match self {
            MacCommand::LinkCheckReq | MacCommand::LinkCheckAns { .. } => CID_LINK_CHECK,
            MacCommand::LinkAdrReq { .. } | MacCommand::LinkAdrAns { .. } => CID_LINK_ADR,
            MacCommand::DutyCycleReq { .. } | MacCommand::DutyCycleAns => CID_DUTY_CYCLE,
            MacCommand::DevStatusReq | MacCommand::DevStatusAns { .. } => CID_DEV_STATUS,
        }
    }

    /// Encoded size including the CID.
    pub fn len(&self) -> usize {
        1 + match self {
            MacCommand::LinkCheckReq | MacCommand::DutyCycleAns | MacCommand::DevStatusReq => 0,
            MacCommand::LinkCheckAns { .. } | MacCommand::DevStatusAns { .. } => 2,
            MacCommand::LinkAdrReq { .. } => 4,
            MacCommand::LinkAdrAns { .. } | MacCommand::DutyCycleReq { .. } => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Decode a command sent by a parent to its child.
    pub fn decode_downlink(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        match r.read_u8()? {
            CID_LINK_CHECK => Ok(MacCommand::LinkCheckAns {
                margin: r.read_u8()?,
                gateways: r.read_u8()?,
            }),
            CID_LINK_ADR => {
                let dr_power = r.read_u8()?;
                let channel_mask = r.read_u16_le()?;
                let redundancy = r.read_u8()?;
                Ok(MacCommand::LinkAdrReq {
                    datarate: dr_power >> 4,
                    tx_power: dr_power & 0x0f,
                    channel_mask,
                    redundancy,
                })
            }
            CID_DUTY_CYCLE => Ok(MacCommand::DutyCycleReq {
                max_dcycle: r.read_u8()?,
            }),
            CID_DEV_STATUS => Ok(MacCommand::DevStatusReq),
            _ => Err(DecodeError::InvalidMessageType),
        }
    }

    /// Decode a command sent by a child to its parent.
    pub fn decode_uplink(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        match r.read_u8()? {
            CID_LINK_CHECK => Ok(MacCommand::LinkCheckReq),
            CID_LINK_ADR => Ok(MacCommand::LinkAdrAns { status: r.read_u8()? }),
            CID_DUTY_CYCLE => Ok(MacCommand::DutyCycleAns),
            CID_DEV_STATUS => Ok(MacCommand::DevStatusAns {
                battery: r.read_u8()?,
                margin: r.read_u8()? as i8,
            }),
            _ => Err(DecodeError::InvalidMessageType),
        }
    }
}

impl Encode for MacCommand {
    fn encode(&self, w: &mut Writer) {
        w.write_u8(self.cid());
        match *self {
            MacCommand::LinkCheckReq | MacCommand::DutyCycleAns | MacCommand::DevStatusReq => {}
            MacCommand::LinkCheckAns { margin, gateways } => {
                w.write_u8(margin);
                w.write_u8(gateways);
            }
            MacCommand::LinkAdrReq {
                datarate,
                tx_power,
                channel_mask,
                redundancy,
            } => {
                w.write_u8((datarate << 4) | (tx_power & 0x0f));
                w.write_u16_le(channel_mask);
                w.write_u8(redundancy);
            }
            MacCommand::LinkAdrAns { status } => w.write_u8(status),
            MacCommand::DutyCycleReq { max_dcycle } => w.write_u8(max_dcycle),
            MacCommand::DevStatusAns { battery, margin } => {
                w.write_u8(battery);
                w.write_u8(margin as u8);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    fn beacon() -> Beacon {
        Beacon {
            dev_addr: 0x2601_0001,
            role: DeviceRole::Router,
            rank: 5,
            position: Position::new(-473_977_420, 85_416_940),
            coordinator: 0x2601_0009,
            slot_time: 0,
            interval_s: 36,
            duration_s: 2,
        }
    }

    #[test]
    fn test_beacon_layout() {
        let bytes = beacon().encode_to_vec();
        assert_eq!(bytes.len(), 23);
        assert_eq!(&bytes[0..4], &[0x01, 0x00, 0x01, 0x26]);
        assert_eq!(bytes[4], 0x15);
        assert_eq!(&bytes[13..17], &0x2601_0009u32.to_le_bytes());
        assert_eq!(bytes[21], 36);
        assert_eq!(bytes[22], 2);
        assert_eq!(Beacon::decode_from_slice(&bytes), Ok(beacon()));
    }

    #[test]
    fn test_beacon_rejects_bad_role() {
        let mut bytes = beacon().encode_to_vec();
        bytes[4] = 0x75;
        assert_eq!(
            Beacon::decode_from_slice(&bytes),
            Err(DecodeError::InvalidValue)
        );
    }

    #[test]
    fn test_beacon_truncated() {
        let bytes = beacon().encode_to_vec();
        assert_eq!(
            Beacon::decode_from_slice(&bytes[..20]),
            Err(DecodeError::UnexpectedEof)
        );
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = beacon().encode_to_vec();
        bytes.push(0);
        assert_eq!(
            Beacon::decode_from_slice(&bytes),
            Err(DecodeError::InvalidLength)
        );
    }

    #[test]
    fn test_control_message_dispatch() {
        let req = ControlMessage::JoinMeshRequest(JoinMeshRequest {
            requester: 0x0a0b_0c0d,
            nonce: 0x1234,
            target: 0x2601_0001,
            periodicity_s: 60,
            class: DeviceClass::C,
        });
        let bytes = req.encode_to_vec();
        assert_eq!(bytes[0], CMD_JOIN_MESH_REQ);
        assert_eq!(bytes.len(), 14);
        assert_eq!(ControlMessage::decode_from_slice(&bytes), Ok(req));

        assert_eq!(
            ControlMessage::decode_from_slice(&[0x09]),
            Err(DecodeError::InvalidMessageType)
        );
    }

    #[test]
    fn test_join_accept_rejects_zero_address() {
        let accept = JoinMeshAccept {
            requester: 1,
            nonce: 2,
            assigned: 0,
            parent: 3,
        };
        let bytes = accept.encode_to_vec();
        assert_eq!(
            JoinMeshAccept::decode_from_slice(&bytes),
            Err(DecodeError::InvalidValue)
        );
    }

    #[test]
    fn test_eui_reversed_on_wire() {
        let req = JoinRequest {
            app_eui: [1, 2, 3, 4, 5, 6, 7, 8],
            dev_eui: [0; 8],
            dev_nonce: 0xbeef,
        };
        let bytes = req.encode_to_vec();
        assert_eq!(&bytes[..8], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&bytes[16..], &[0xef, 0xbe]);
        assert_eq!(JoinRequest::decode_from_slice(&bytes), Ok(req));
    }

    #[test]
    fn test_join_accept_24bit_fields() {
        let accept = JoinAccept {
            app_nonce: 0x00ab_cdef,
            net_id: 0x13,
            dev_addr: 0x2601_1234,
            dl_settings: 0,
            rx_delay: 1,
        };
        let bytes = accept.encode_to_vec();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[..3], &[0xef, 0xcd, 0xab]);
        assert_eq!(JoinAccept::decode_from_slice(&bytes), Ok(accept));
    }

    #[test]
    fn test_mac_command_sequence() {
        let mut w = Writer::new();
        MacCommand::LinkAdrReq {
            datarate: 3,
            tx_power: 2,
            channel_mask: 0x0007,
            redundancy: 0,
        }
        .encode(&mut w);
        MacCommand::DevStatusReq.encode(&mut w);
        let bytes = w.finish();
        assert_eq!(bytes, vec![0x03, 0x32, 0x07, 0x00, 0x00, 0x06]);

        let mut r = Reader::new(&bytes);
        assert!(matches!(
            MacCommand::decode_downlink(&mut r),
            Ok(MacCommand::LinkAdrReq { datarate: 3, tx_power: 2, channel_mask: 7, .. })
        ));
        assert_eq!(MacCommand::decode_downlink(&mut r), Ok(MacCommand::DevStatusReq));
        assert!(r.is_empty());
    }

    #[test]
    fn test_mac_command_len_matches_encoding() {
        let cmds = [
            MacCommand::LinkCheckReq,
            MacCommand::LinkCheckAns { margin: 10, gateways: 1 },
            MacCommand::LinkAdrAns { status: 7 },
            MacCommand::DutyCycleAns,
            MacCommand::DevStatusAns { battery: 255, margin: -3 },
        ];
        for cmd in cmds {
            assert_eq!(cmd.encode_to_vec().len(), cmd.len());
        }
    }

    #[test]
    fn test_decode_error_maps_to_error() {
        assert_eq!(Error::from(DecodeError::InvalidMessageType), Error::InvalidType);
        assert_eq!(Error::from(DecodeError::UnexpectedEof), Error::Failed);
    }
}
