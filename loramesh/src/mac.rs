//! MAC layer: message header, integrity codes and frame-type dispatch.
//!
//! ```text
//! MHDR (1) || MACPayload (<= 123) || MIC (4)
//!
//! MHDR = MType (bits 7..5) | RFU (4..2) | Major (1..0)
//! ```
//!
//! Data frames carry a B0-based MIC under the network session key. Mesh
//! control frames (Proprietary) and join requests carry a plain CMAC over
//! everything before the MIC. Join accepts are encrypted after the MHDR.

use log::{debug, info};

use crate::config::MeshConfig;
use crate::crypto::{
    compute_mic, compute_plain_mic, derive_session_keys, join_accept_decrypt, join_accept_encrypt,
    Direction,
};
use crate::device::ControlFlags;
use crate::node::{Node, PendingJoin};
use crate::phy::PhyPacket;
use crate::time::Timestamp;
use crate::traits::{Cipher, Clock, PositionSource, Radio};
use crate::types::{
    AesKey, DevAddr, Error, Event, Result, MAC_HEADER_SIZE, MAC_MAX_PAYLOAD, MIC_SIZE,
    PHY_MAX_PAYLOAD,
};
use crate::wire::{ControlMessage, Decode, Encode, JoinAccept, JoinRequest, Writer};

/// A complete MAC frame as handed to the PHY.
pub type MacBuffer = heapless::Vec<u8, PHY_MAX_PAYLOAD>;

const JOIN_ACCEPT_BODY_SIZE: usize = 12;

/// Message type, MHDR bits 7..5.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MType {
    JoinRequest = 0,
    JoinAccept = 1,
    UnconfirmedUp = 2,
    UnconfirmedDown = 3,
    ConfirmedUp = 4,
    ConfirmedDown = 5,
    Rfu = 6,
    Proprietary = 7,
}

impl MType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => MType::JoinRequest,
            1 => MType::JoinAccept,
            2 => MType::UnconfirmedUp,
            3 => MType::UnconfirmedDown,
            4 => MType::ConfirmedUp,
            5 => MType::ConfirmedDown,
            6 => MType::Rfu,
            _ => MType::Proprietary,
        }
    }

    pub fn is_uplink(self) -> bool {
        matches!(self, MType::UnconfirmedUp | MType::ConfirmedUp)
    }

    pub fn is_downlink(self) -> bool {
        matches!(self, MType::UnconfirmedDown | MType::ConfirmedDown)
    }

    pub fn is_confirmed(self) -> bool {
        matches!(self, MType::ConfirmedUp | MType::ConfirmedDown)
    }

    /// Direction used in the B0 and A blocks.
    pub fn direction(self) -> Direction {
        if self.is_uplink() {
            Direction::Up
        } else {
            Direction::Down
        }
    }
}

/// Encode the MHDR for `mtype`, LoRaWAN R1.
pub fn mhdr(mtype: MType) -> u8 {
    (mtype as u8) << 5
}

/// Decode an MHDR byte. Unknown major versions and RFU frames are rejected.
pub fn parse_mhdr(byte: u8) -> Result<MType> {
    if byte & 0x03 != 0 {
        return Err(Error::InvalidType);
    }
    match MType::from_bits(byte >> 5) {
        MType::Rfu => Err(Error::InvalidType),
        mtype => Ok(mtype),
    }
}

/// Split a frame into its MIC-covered part and the little-endian MIC.
pub fn split_mic(frame: &[u8]) -> Result<(&[u8], u32)> {
    if frame.len() < MAC_HEADER_SIZE + MIC_SIZE {
        return Err(Error::Failed);
    }
    let (msg, mic) = frame.split_at(frame.len() - MIC_SIZE);
    Ok((msg, u32::from_le_bytes([mic[0], mic[1], mic[2], mic[3]])))
}

fn stamp(mtype: MType, payload: &[u8]) -> Result<MacBuffer> {
    if payload.len() > MAC_MAX_PAYLOAD {
        return Err(Error::Overflow);
    }
    let mut buf = MacBuffer::new();
    buf.push(mhdr(mtype)).map_err(|_| Error::Overflow)?;
    buf.extend_from_slice(payload).map_err(|_| Error::Overflow)?;
    Ok(buf)
}

fn append_mic(buf: &mut MacBuffer, mic: u32) -> Result<()> {
    buf.extend_from_slice(&mic.to_le_bytes())
        .map_err(|_| Error::Overflow)
}

/// Stamp the MHDR on a data frame and append its MIC.
///
/// `frame` is the FRM output: address, FCtrl, FCnt, FOpts, port and the
/// encrypted payload.
pub fn seal_data<C: Cipher>(
    cipher: &C,
    mtype: MType,
    frame: &[u8],
    nwk_key: &AesKey,
    addr: DevAddr,
    fcnt: u32,
) -> Result<MacBuffer> {
    let mut buf = stamp(mtype, frame)?;
    let mic = compute_mic(cipher, nwk_key, addr, mtype.direction(), fcnt, &buf);
    append_mic(&mut buf, mic)?;
    Ok(buf)
}

/// Check the MIC of a received data frame under a full 32-bit counter.
pub fn verify_data<C: Cipher>(
    cipher: &C,
    frame: &[u8],
    nwk_key: &AesKey,
    addr: DevAddr,
    dir: Direction,
    fcnt: u32,
) -> Result<()> {
    let (msg, mic) = split_mic(frame)?;
    if compute_mic(cipher, nwk_key, addr, dir, fcnt, msg) == mic {
        Ok(())
    } else {
        Err(Error::Failed)
    }
}

/// Frame a payload with a plain CMAC under `key`.
fn seal_plain<C: Cipher>(cipher: &C, mtype: MType, body: &[u8], key: &AesKey) -> Result<MacBuffer> {
    let mut buf = stamp(mtype, body)?;
    let mic = compute_plain_mic(cipher, key, &buf);
    append_mic(&mut buf, mic)?;
    Ok(buf)
}

fn open_plain<'a, C: Cipher>(cipher: &C, frame: &'a [u8], key: &AesKey) -> Result<&'a [u8]> {
    let (msg, mic) = split_mic(frame)?;
    if compute_plain_mic(cipher, key, msg) != mic {
        return Err(Error::Failed);
    }
    Ok(&msg[MAC_HEADER_SIZE..])
}

/// Build a mesh control frame.
pub fn seal_control<C: Cipher>(
    cipher: &C,
    nwk_key: &AesKey,
    msg: &ControlMessage,
) -> Result<MacBuffer> {
    let mut w = Writer::with_capacity(32);
    msg.encode(&mut w);
    seal_plain(cipher, MType::Proprietary, w.as_slice(), nwk_key)
}

/// Verify and decode a mesh control frame.
pub fn open_control<C: Cipher>(
    cipher: &C,
    nwk_key: &AesKey,
    frame: &[u8],
) -> Result<ControlMessage> {
    let body = open_plain(cipher, frame, nwk_key)?;
    Ok(ControlMessage::decode_from_slice(body)?)
}

pub fn seal_join_request<C: Cipher>(
    cipher: &C,
    app_key: &AesKey,
    req: &JoinRequest,
) -> Result<MacBuffer> {
    seal_plain(cipher, MType::JoinRequest, &req.encode_to_vec(), app_key)
}

pub fn open_join_request<C: Cipher>(
    cipher: &C,
    app_key: &AesKey,
    frame: &[u8],
) -> Result<JoinRequest> {
    let body = open_plain(cipher, frame, app_key)?;
    Ok(JoinRequest::decode_from_slice(body)?)
}

/// Network-side join accept: MIC over the plaintext, then encryption of
/// body and MIC together.
pub fn seal_join_accept<C: Cipher>(
    cipher: &C,
    app_key: &AesKey,
    accept: &JoinAccept,
) -> Result<MacBuffer> {
    let mut buf = seal_plain(cipher, MType::JoinAccept, &accept.encode_to_vec(), app_key)?;
    join_accept_encrypt(cipher, app_key, &mut buf[MAC_HEADER_SIZE..]);
    Ok(buf)
}

pub fn open_join_accept<C: Cipher>(
    cipher: &C,
    app_key: &AesKey,
    frame: &[u8],
) -> Result<JoinAccept> {
    if frame.len() != MAC_HEADER_SIZE + JOIN_ACCEPT_BODY_SIZE + MIC_SIZE {
        return Err(Error::Failed);
    }
    let mut plain = MacBuffer::new();
    plain.extend_from_slice(frame).map_err(|_| Error::Overflow)?;
    join_accept_decrypt(cipher, app_key, &mut plain[MAC_HEADER_SIZE..]);
    let body = open_plain(cipher, &plain, app_key)?;
    Ok(JoinAccept::decode_from_slice(body)?)
}

impl<R, Cip, Clk, P, C> Node<R, Cip, Clk, P, C>
where
    R: Radio,
    Cip: Cipher,
    Clk: Clock,
    P: PositionSource,
    C: MeshConfig,
{
    /// Hand a finished MAC frame to the PHY.
    pub(crate) fn mac_put_payload(&mut self, flags: u8, frame: &MacBuffer) -> Result<()> {
        self.phy_put_payload(flags, frame)
    }

    /// Drain one frame from the PHY rx queue and dispatch it by MType.
    pub(crate) fn mac_process(&mut self, now: Timestamp) {
        let Ok(buf) = self.phy.receive() else {
            return;
        };
        let Ok(packet) = PhyPacket::parse(&buf) else {
            return;
        };
        if let Err(e) = self.mac_on_packet_rx(now, packet.payload) {
            debug!("rx frame rejected: {}", e);
        }
    }

    pub(crate) fn mac_on_packet_rx(&mut self, now: Timestamp, frame: &[u8]) -> Result<()> {
        let first = frame.first().copied().ok_or(Error::Failed)?;
        match parse_mhdr(first)? {
            MType::JoinAccept => self.mac_on_join_accept(frame),
            MType::Proprietary => {
                if !self.device.is_joined() {
                    return Err(Error::NotAvail);
                }
                let msg = open_control(&self.cipher, &self.device.keys.nwk, frame)?;
                self.on_control_message(now, msg)
            }
            MType::JoinRequest => {
                // Join servers are outside the mesh.
                Ok(())
            }
            _ => self.frm_on_frame(now, frame),
        }
    }

    fn mac_on_join_accept(&mut self, frame: &[u8]) -> Result<()> {
        let Some(PendingJoin::Otaa { dev_nonce }) = self.pending_join else {
            return Err(Error::Failed);
        };
        let otaa = self.otaa.ok_or(Error::Failed)?;
        let accept = open_join_accept(&self.cipher, &otaa.app_key, frame)?;

        self.device.keys = derive_session_keys(
            &self.cipher,
            &otaa.app_key,
            accept.app_nonce,
            accept.net_id,
            dev_nonce,
        );
        self.device.dev_addr = accept.dev_addr;
        self.device.net_id = accept.net_id;
        self.device.uplink_counter = 0;
        self.device.downlink_counter = 0;
        self.device.ctrl.insert(ControlFlags::NETWORK_JOINED);
        self.pending_join = None;
        info!("joined network {:06x} as {:08x}", accept.net_id, accept.dev_addr);
        self.push_event(Event::Joined {
            dev_addr: accept.dev_addr,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AesCmacCipher;
    use crate::wire::Beacon;
    use crate::traits::Position;
    use crate::types::DeviceRole;

    const KEY: AesKey = [0x2b; 16];

    #[test]
    fn test_mhdr_bits() {
        assert_eq!(mhdr(MType::UnconfirmedUp), 0x40);
        assert_eq!(mhdr(MType::ConfirmedDown), 0xa0);
        assert_eq!(mhdr(MType::Proprietary), 0xe0);
        assert_eq!(parse_mhdr(0x40), Ok(MType::UnconfirmedUp));
        assert_eq!(parse_mhdr(0x41), Err(Error::InvalidType));
        assert_eq!(parse_mhdr(0xc0), Err(Error::InvalidType));
    }

    #[test]
    fn test_data_frame_mic() {
        let cipher = AesCmacCipher::new();
        let frame = [0x01, 0x00, 0x00, 0x26, 0x00, 0x05, 0x00, 0x0a, 0xde, 0xad];
        let buf = seal_data(&cipher, MType::UnconfirmedUp, &frame, &KEY, 0x2600_0001, 5).unwrap();
        assert_eq!(buf.len(), 1 + frame.len() + 4);
        assert_eq!(buf[0], 0x40);
        verify_data(&cipher, &buf, &KEY, 0x2600_0001, Direction::Up, 5).unwrap();

        // Wrong counter, wrong direction, corrupted byte.
        assert_eq!(
            verify_data(&cipher, &buf, &KEY, 0x2600_0001, Direction::Up, 6),
            Err(Error::Failed)
        );
        assert_eq!(
            verify_data(&cipher, &buf, &KEY, 0x2600_0001, Direction::Down, 5),
            Err(Error::Failed)
        );
        let mut bad = buf.clone();
        bad[8] ^= 0x01;
        assert_eq!(
            verify_data(&cipher, &bad, &KEY, 0x2600_0001, Direction::Up, 5),
            Err(Error::Failed)
        );
    }

    #[test]
    fn test_data_frame_overflow() {
        let cipher = AesCmacCipher::new();
        let frame = [0u8; MAC_MAX_PAYLOAD + 1];
        assert_eq!(
            seal_data(&cipher, MType::UnconfirmedUp, &frame, &KEY, 1, 0),
            Err(Error::Overflow)
        );
        let fits = [0u8; MAC_MAX_PAYLOAD];
        let buf = seal_data(&cipher, MType::UnconfirmedUp, &fits, &KEY, 1, 0).unwrap();
        assert_eq!(buf.len(), PHY_MAX_PAYLOAD);
    }

    #[test]
    fn test_control_frame_roundtrip_and_tamper() {
        let cipher = AesCmacCipher::new();
        let msg = ControlMessage::Beacon(Beacon {
            dev_addr: 0x2600_0002,
            role: DeviceRole::Coordinator,
            rank: 4,
            position: Position::new(1, 2),
            coordinator: 0x2600_0002,
            slot_time: 0,
            interval_s: 36,
            duration_s: 2,
        });
        let buf = seal_control(&cipher, &KEY, &msg).unwrap();
        assert_eq!(buf[0], 0xe0);
        assert_eq!(buf[1], 0x01);
        assert_eq!(open_control(&cipher, &KEY, &buf), Ok(msg));

        assert_eq!(open_control(&cipher, &[0; 16], &buf), Err(Error::Failed));
        let mut bad = buf.clone();
        bad[3] ^= 0x80;
        assert_eq!(open_control(&cipher, &KEY, &bad), Err(Error::Failed));
    }

    #[test]
    fn test_join_request_mic() {
        let cipher = AesCmacCipher::new();
        let req = JoinRequest {
            app_eui: [1; 8],
            dev_eui: [2; 8],
            dev_nonce: 0x0102,
        };
        let buf = seal_join_request(&cipher, &KEY, &req).unwrap();
        assert_eq!(buf.len(), 23);
        assert_eq!(buf[0], 0x00);
        assert_eq!(open_join_request(&cipher, &KEY, &buf), Ok(req));
    }

    #[test]
    fn test_join_accept_is_encrypted() {
        let cipher = AesCmacCipher::new();
        let accept = JoinAccept {
            app_nonce: 0x0a0b0c,
            net_id: 0x000013,
            dev_addr: 0x2601_abcd,
            dl_settings: 0,
            rx_delay: 1,
        };
        let buf = seal_join_accept(&cipher, &KEY, &accept).unwrap();
        assert_eq!(buf.len(), 17);
        assert_eq!(buf[0], 0x20);
        // Address bytes must not appear in clear.
        assert_ne!(&buf[7..11], &0x2601_abcdu32.to_le_bytes());
        assert_eq!(open_join_accept(&cipher, &KEY, &buf), Ok(accept));
        assert_eq!(
            open_join_accept(&cipher, &[9; 16], &buf),
            Err(Error::Failed)
        );
    }

    #[test]
    fn test_split_mic_short_frame() {
        assert_eq!(split_mic(&[0x40, 1, 2]), Err(Error::Failed));
        let (msg, mic) = split_mic(&[0x40, 0x78, 0x56, 0x34, 0x12]).unwrap();
        assert_eq!(msg, &[0x40]);
        assert_eq!(mic, 0x1234_5678);
    }
}
