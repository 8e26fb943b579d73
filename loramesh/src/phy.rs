//! Physical layer: packet envelope, tx/rx queues and the radio state machine.
//!
//! ## Buffer layout
//!
//! ```text
//! flags (1) || size (1) || payload (size <= 128)
//! ```
//!
//! The radio ISR only pushes `RadioEvent`s; `Node::poll` drains them here.
//! Class C/D nodes return to continuous receive after every transmission.
//! Class A/B nodes sleep and open RX1/RX2 at fixed delays after tx-done when
//! the frame asked for reception windows.

use embassy_sync::channel::Channel;
use log::{debug, trace, warn};

use crate::channel::{datarate_params, tx_power_dbm, RX2_DATARATE, RX2_FREQUENCY};
use crate::config::MeshConfig;
use crate::device::DebugFlags;
use crate::node::Node;
use crate::time::{Duration, Timestamp};
use crate::traits::{
    Bandwidth, ChannelMutex, Cipher, Clock, Modem, PositionSource, Radio, RadioEvent,
    RadioStatus, RxConfig, TxConfig,
};
use crate::types::{
    Error, Result, PHY_BUFFER_SIZE, PHY_HEADER_SIZE, PHY_MAX_PAYLOAD, RECEPTION_RESERVED_TIME,
    RX1_DELAY, RX2_DELAY,
};

/// Open RX1/RX2 after this frame is sent.
pub const PHY_FLAG_RX_WINDOWS: u8 = 0x01;
/// Send regardless of the slot schedule (beacons, joins, mesh control).
pub const PHY_FLAG_PRIORITY: u8 = 0x02;

const PREAMBLE_LEN: u16 = 8;
const CODERATE_4_5: u8 = 1;

pub type PhyBuffer = heapless::Vec<u8, PHY_BUFFER_SIZE>;

/// Single-slot queue between layers.
pub type PhyQueue = Channel<ChannelMutex, PhyBuffer, 1>;

/// Parsed view of a PHY buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhyPacket<'a> {
    pub flags: u8,
    pub payload: &'a [u8],
}

impl<'a> PhyPacket<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < PHY_HEADER_SIZE {
            return Err(Error::Failed);
        }
        let size = buf[1] as usize;
        if size > PHY_MAX_PAYLOAD || PHY_HEADER_SIZE + size > buf.len() {
            return Err(Error::Overflow);
        }
        Ok(Self {
            flags: buf[0],
            payload: &buf[PHY_HEADER_SIZE..PHY_HEADER_SIZE + size],
        })
    }

    pub fn encode(flags: u8, payload: &[u8]) -> Result<PhyBuffer> {
        if payload.len() > PHY_MAX_PAYLOAD {
            return Err(Error::Overflow);
        }
        let mut buf = PhyBuffer::new();
        buf.push(flags).map_err(|_| Error::Overflow)?;
        buf.push(payload.len() as u8).map_err(|_| Error::Overflow)?;
        buf.extend_from_slice(payload).map_err(|_| Error::Overflow)?;
        Ok(buf)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhyState {
    Initial,
    Idle,
    WaitTxDone,
    Receiving,
}

#[derive(Clone, Copy, Debug)]
struct InFlight {
    channel: usize,
    airtime: Duration,
    flags: u8,
    started: Timestamp,
}

/// Frame counters kept by the PHY.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PhyStats {
    pub tx_frames: u32,
    pub rx_frames: u32,
    pub rx_dropped: u32,
    pub tx_deferred: u32,
}

/// PHY queues and state.
pub struct Phy {
    state: PhyState,
    tx_queue: PhyQueue,
    rx_queue: PhyQueue,
    /// Frame taken from the tx queue but not yet allowed on air.
    staged: Option<PhyBuffer>,
    in_flight: Option<InFlight>,
    rx1_at: Option<Timestamp>,
    rx2_at: Option<Timestamp>,
    rx1_channel: usize,
    stats: PhyStats,
}

impl Default for Phy {
    fn default() -> Self {
        Self::new()
    }
}

impl Phy {
    pub fn new() -> Self {
        Self {
            state: PhyState::Initial,
            tx_queue: Channel::new(),
            rx_queue: Channel::new(),
            staged: None,
            in_flight: None,
            rx1_at: None,
            rx2_at: None,
            rx1_channel: 0,
            stats: PhyStats::default(),
        }
    }

    pub fn state(&self) -> PhyState {
        self.state
    }

    pub fn stats(&self) -> PhyStats {
        self.stats
    }

    /// Queue a MAC frame for transmission.
    pub fn put_payload(&self, flags: u8, payload: &[u8]) -> Result<()> {
        let buf = PhyPacket::encode(flags, payload)?;
        self.tx_queue.try_send(buf).map_err(|_| Error::Busy)
    }

    /// Whether a frame is queued or staged for transmission.
    pub fn tx_pending(&self) -> bool {
        self.staged.is_some() || !self.tx_queue.is_empty()
    }

    pub fn rx_pending(&self) -> bool {
        !self.rx_queue.is_empty()
    }

    /// Take the next received MAC frame.
    pub fn receive(&self) -> Result<PhyBuffer> {
        self.rx_queue.try_receive().map_err(|_| Error::RxEmpty)
    }

    fn push_rx(&mut self, frame: &[u8]) -> Result<()> {
        let buf = PhyPacket::encode(0, frame)?;
        self.rx_queue.try_send(buf).map_err(|_| Error::Busy)
    }

    /// Earliest pending reception-window timer.
    pub fn next_timer(&self) -> Option<Timestamp> {
        match (self.rx1_at, self.rx2_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Reception windows still to come after the last transmission.
    pub fn windows_pending(&self) -> bool {
        self.rx1_at.is_some() || self.rx2_at.is_some()
    }

    #[cfg(test)]
    pub(crate) fn take_tx(&self) -> Option<PhyBuffer> {
        self.tx_queue.try_receive().ok()
    }
}

/// Receive symbol timeout per datarate.
pub fn symbol_timeout(dr: u8) -> u16 {
    match dr {
        3 | 4 => 8,
        5 => 10,
        6 => 14,
        _ => 5,
    }
}

/// Transmit configuration for a datarate and tx-power index.
pub fn tx_config(dr: u8, power: u8) -> Result<TxConfig> {
    let (spreading_factor, bandwidth) = datarate_params(dr).ok_or(Error::Range)?;
    let power_dbm = tx_power_dbm(power).ok_or(Error::Range)?;
    Ok(TxConfig {
        modem: Modem::LoRa,
        power_dbm,
        bandwidth,
        spreading_factor,
        coderate: CODERATE_4_5,
        preamble_len: PREAMBLE_LEN,
        crc_on: true,
        iq_inverted: false,
    })
}

/// Receive configuration for a datarate.
pub fn rx_config(dr: u8, continuous: bool) -> Result<RxConfig> {
    let (spreading_factor, bandwidth) = datarate_params(dr).ok_or(Error::Range)?;
    Ok(RxConfig {
        modem: Modem::LoRa,
        bandwidth,
        spreading_factor,
        coderate: CODERATE_4_5,
        preamble_len: PREAMBLE_LEN,
        symbol_timeout: symbol_timeout(dr),
        continuous,
        // Node-to-node links use normal IQ in both directions.
        iq_inverted: false,
        max_payload_len: PHY_MAX_PAYLOAD as u8,
    })
}

/// LoRa airtime (Semtech AN1200.13), explicit header.
pub fn lora_time_on_air(cfg: &TxConfig, len: usize) -> Duration {
    let bw = cfg.bandwidth.hz() as u64;
    let sf = cfg.spreading_factor.clamp(6, 12) as i64;
    let symbol_us = (1u64 << sf) * 1_000_000 / bw;
    let low_dr_optimize = sf >= 11 && cfg.bandwidth == Bandwidth::Khz125;

    let preamble_us = (4 * cfg.preamble_len as u64 + 17) * symbol_us / 4;

    let crc = if cfg.crc_on { 16 } else { 0 };
    let num = 8 * len as i64 - 4 * sf + 28 + crc;
    let den = 4 * (sf - if low_dr_optimize { 2 } else { 0 });
    let coded = if num > 0 {
        ((num + den - 1) / den) * (cfg.coderate as i64 + 4)
    } else {
        0
    };
    let payload_us = (8 + coded as u64) * symbol_us;

    Duration::from_millis((preamble_us + payload_us).div_ceil(1000))
}

impl<R, Cip, Clk, P, C> Node<R, Cip, Clk, P, C>
where
    R: Radio,
    Cip: Cipher,
    Clk: Clock,
    P: PositionSource,
    C: MeshConfig,
{
    /// Hand a MAC frame to the PHY tx queue.
    pub(crate) fn phy_put_payload(&mut self, flags: u8, payload: &[u8]) -> Result<()> {
        self.phy.put_payload(flags, payload).map_err(|e| {
            warn!("phy tx queue rejected frame: {}", e);
            e
        })
    }

    /// Drain radio interrupt events.
    pub(crate) fn phy_radio_events(&mut self, now: Timestamp) {
        while let Ok(event) = self.radio.events().try_receive() {
            match event {
                RadioEvent::TxDone => self.phy_on_tx_done(now),
                RadioEvent::RxDone { payload, rssi, snr } => {
                    self.device.last_rssi = rssi;
                    self.device.last_snr = snr;
                    match self.phy.push_rx(&payload) {
                        Ok(()) => self.phy.stats.rx_frames += 1,
                        Err(e) => {
                            self.phy.stats.rx_dropped += 1;
                            warn!("rx frame dropped ({} bytes): {}", payload.len(), e);
                        }
                    }
                    if !self.device.class.listens_continuously() {
                        // A frame in RX1 makes RX2 unnecessary.
                        self.phy.rx2_at = None;
                        self.radio.sleep();
                        self.phy.state = PhyState::Idle;
                    } else if self.radio.status() != RadioStatus::RxRunning {
                        // A single window ended with this frame.
                        self.phy_start_continuous_rx();
                    }
                }
                RadioEvent::RxTimeout | RadioEvent::RxError => {
                    if self.device.class.listens_continuously() {
                        self.phy_start_continuous_rx();
                    } else {
                        self.radio.sleep();
                        self.phy.state = PhyState::Idle;
                    }
                }
                RadioEvent::CadDone { detected } => {
                    trace!("cad done, activity: {}", detected);
                }
            }
        }
    }

    fn phy_on_tx_done(&mut self, now: Timestamp) {
        let Some(tx) = self.phy.in_flight.take() else {
            return;
        };
        self.phy.stats.tx_frames += 1;
        self.channels.record_tx(tx.channel, now, tx.airtime);

        if self.device.class.listens_continuously() {
            self.phy_start_continuous_rx();
            return;
        }
        self.radio.sleep();
        self.phy.state = PhyState::Idle;
        if tx.flags & PHY_FLAG_RX_WINDOWS != 0
            && !self.device.debug.contains(DebugFlags::RX_WINDOWS_DISABLED)
        {
            self.phy.rx1_channel = tx.channel;
            self.phy.rx1_at = Some(now + RX1_DELAY);
            self.phy.rx2_at = Some(now + RX2_DELAY);
        }
    }

    pub(crate) fn phy_start_continuous_rx(&mut self) {
        let freq = self
            .channels
            .channel(self.device.channel)
            .map_or(RX2_FREQUENCY, |c| c.freq_hz);
        if self.phy_open_rx(freq, self.device.datarate, true).is_ok() {
            self.phy.state = PhyState::Receiving;
        }
    }

    fn phy_open_rx(&mut self, freq_hz: u32, dr: u8, continuous: bool) -> Result<()> {
        let config = rx_config(dr, continuous)?;
        self.radio.set_channel(freq_hz);
        self.radio.set_rx_config(&config);
        let timeout = if continuous {
            Duration::ZERO
        } else {
            RECEPTION_RESERVED_TIME
        };
        self.radio.rx(timeout);
        Ok(())
    }

    /// Open a single reception window on the current channel.
    pub(crate) fn phy_open_window(&mut self) {
        if self.phy.state == PhyState::WaitTxDone {
            return;
        }
        let freq = self
            .channels
            .channel(self.device.channel)
            .map_or(RX2_FREQUENCY, |c| c.freq_hz);
        if self.phy_open_rx(freq, self.device.datarate, false).is_ok() {
            self.phy.state = PhyState::Receiving;
        }
    }

    /// Fire due RX1/RX2 timers.
    pub(crate) fn phy_timers(&mut self, now: Timestamp) {
        if self.phy.rx1_at.is_some_and(|t| now >= t) {
            self.phy.rx1_at = None;
            let freq = self
                .channels
                .channel(self.phy.rx1_channel)
                .map_or(RX2_FREQUENCY, |c| c.freq_hz);
            trace!("opening RX1 on {} Hz", freq);
            if self.phy_open_rx(freq, self.device.datarate, false).is_ok() {
                self.phy.state = PhyState::Receiving;
            }
        }
        if self.phy.rx2_at.is_some_and(|t| now >= t) {
            self.phy.rx2_at = None;
            trace!("opening RX2");
            if self.phy_open_rx(RX2_FREQUENCY, RX2_DATARATE, false).is_ok() {
                self.phy.state = PhyState::Receiving;
            }
        }
    }

    /// Advance the state machine and start a transmission if one is allowed.
    pub(crate) fn phy_process(&mut self, now: Timestamp) {
        match self.phy.state {
            PhyState::Initial => {
                self.radio.init();
                self.radio
                    .set_max_payload_length(Modem::LoRa, PHY_MAX_PAYLOAD as u8);
                self.phy.state = PhyState::Idle;
                if self.device.class.listens_continuously() {
                    self.phy_start_continuous_rx();
                } else {
                    self.radio.sleep();
                }
            }
            PhyState::WaitTxDone => {
                if let Some(tx) = self.phy.in_flight {
                    // Lost TxDone interrupt.
                    let deadline = tx.started + tx.airtime * 2 + RX1_DELAY;
                    if now >= deadline {
                        warn!("tx done missing, resetting radio");
                        self.phy.in_flight = None;
                        self.radio.reset();
                        self.phy.state = PhyState::Idle;
                    }
                }
            }
            PhyState::Idle | PhyState::Receiving => {
                let class_a = !self.device.class.listens_continuously();
                if class_a && (self.phy.state == PhyState::Receiving || self.phy.windows_pending())
                {
                    return;
                }
                if self.phy.staged.is_none() {
                    self.phy.staged = self.phy.tx_queue.try_receive().ok();
                }
                if self.phy.staged.is_some() {
                    self.phy_try_send(now);
                }
            }
        }
    }

    fn phy_try_send(&mut self, now: Timestamp) {
        let Some(buf) = self.phy.staged.as_ref() else {
            return;
        };
        let Ok(packet) = PhyPacket::parse(buf) else {
            self.phy.staged = None;
            return;
        };
        let flags = packet.flags;
        if flags & PHY_FLAG_PRIORITY == 0 && self.scheduler.check_tx(now).is_err() {
            self.phy.stats.tx_deferred += 1;
            return;
        }

        let random = self.radio.random();
        let override_dc = self.device.debug.contains(DebugFlags::DUTY_CYCLE_OVERRIDE);
        let channel = match self.channels.set_next_channel(
            now,
            self.device.datarate,
            &mut self.device.channel_mask,
            random,
            override_dc,
        ) {
            Ok(channel) => channel,
            Err(e) => {
                self.phy.stats.tx_deferred += 1;
                debug!("no channel for DR{}: {}", self.device.datarate, e);
                return;
            }
        };
        let Some(freq) = self.channels.channel(channel).map(|c| c.freq_hz) else {
            return;
        };
        let config = match tx_config(self.device.datarate, self.device.tx_power) {
            Ok(config) => config,
            Err(e) => {
                warn!("invalid tx settings, dropping frame: {}", e);
                self.phy.staged = None;
                return;
            }
        };

        self.device.channel = channel;
        self.radio.set_channel(freq);
        self.radio.set_tx_config(&config);
        let airtime = self.radio.time_on_air(Modem::LoRa, packet.payload.len());
        self.radio.send(packet.payload);
        debug!(
            "tx {} bytes on {} Hz DR{} ({} ms)",
            packet.payload.len(),
            freq,
            self.device.datarate,
            airtime.as_millis()
        );
        self.phy.in_flight = Some(InFlight {
            channel,
            airtime,
            flags,
            started: now,
        });
        self.phy.state = PhyState::WaitTxDone;
        self.phy.staged = None;
    }
}
