//! Channel plan, sub-bands and duty-cycle bookkeeping.
//!
//! Follows the LoRaMAC band model: every transmission charges its band with
//! `time_off = airtime * dcycle - airtime`, and a channel is usable again once
//! that much time has passed since the band's last tx-done. An aggregated
//! duty cycle applies on top of all bands (1 = unrestricted).

use log::{debug, warn};

use crate::time::{Duration, Timestamp};
use crate::traits::Bandwidth;
use crate::types::{Error, Result};

pub const MAX_CHANNELS: usize = 16;
pub const MAX_BANDS: usize = 5;

/// One enable bit per channel.
pub type ChannelMask = u16;

/// Lowest and highest datarate index.
pub const DR_MIN: u8 = 0;
pub const DR_MAX: u8 = 6;

/// Spreading factor and bandwidth per datarate index.
pub const DATARATES: [(u8, Bandwidth); 7] = [
    (12, Bandwidth::Khz125),
    (11, Bandwidth::Khz125),
    (10, Bandwidth::Khz125),
    (9, Bandwidth::Khz125),
    (8, Bandwidth::Khz125),
    (7, Bandwidth::Khz125),
    (7, Bandwidth::Khz250),
];

/// Output power in dBm per tx-power index.
pub const TX_POWERS: [i8; 6] = [20, 14, 11, 8, 5, 2];

pub const RX2_FREQUENCY: u32 = 869_525_000;
pub const RX2_DATARATE: u8 = 0;

pub fn datarate_params(dr: u8) -> Option<(u8, Bandwidth)> {
    DATARATES.get(dr as usize).copied()
}

pub fn tx_power_dbm(index: u8) -> Option<i8> {
    TX_POWERS.get(index as usize).copied()
}

/// A radio channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Channel {
    pub freq_hz: u32,
    pub dr_min: u8,
    pub dr_max: u8,
    pub band: u8,
}

impl Channel {
    pub const fn new(freq_hz: u32, dr_min: u8, dr_max: u8, band: u8) -> Self {
        Self {
            freq_hz,
            dr_min,
            dr_max,
            band,
        }
    }

    pub fn supports(&self, dr: u8) -> bool {
        self.freq_hz != 0 && (self.dr_min..=self.dr_max).contains(&dr)
    }
}

/// Regulatory sub-band.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Band {
    /// Inverse duty cycle (100 = 1%).
    pub dcycle: u16,
    pub last_tx_done: Timestamp,
    pub time_off: Duration,
}

impl Band {
    pub const fn new(dcycle: u16) -> Self {
        Self {
            dcycle,
            last_tx_done: Timestamp::ZERO,
            time_off: Duration::ZERO,
        }
    }

    pub fn is_available(&self, now: Timestamp) -> bool {
        now.saturating_sub(self.last_tx_done) >= self.time_off
    }

    /// Time until the band may transmit again.
    pub fn wait_time(&self, now: Timestamp) -> Duration {
        self.time_off
            .saturating_sub(now.saturating_sub(self.last_tx_done))
    }
}

fn time_off(dcycle: u16, airtime: Duration) -> Duration {
    airtime
        .saturating_mul(dcycle.max(1) as u64)
        .saturating_sub(airtime)
}

/// Channels, bands and aggregate duty-cycle state.
#[derive(Clone, Debug)]
pub struct ChannelPlan {
    channels: heapless::Vec<Channel, MAX_CHANNELS>,
    bands: [Band; MAX_BANDS],
    default_mask: ChannelMask,
    aggregated_dcycle: u16,
    aggregated_last_tx_done: Timestamp,
    aggregated_time_off: Duration,
}

impl ChannelPlan {
    /// EU 863-870 default plan: three join channels in band G1.
    pub fn eu868() -> Self {
        let mut channels = heapless::Vec::new();
        for freq in [868_100_000, 868_300_000, 868_500_000] {
            let _ = channels.push(Channel::new(freq, 0, 5, 1));
        }
        Self {
            channels,
            bands: [
                Band::new(100),  // G   863.0 - 868.0 MHz
                Band::new(100),  // G1  868.0 - 868.6 MHz
                Band::new(1000), // G2  868.7 - 869.2 MHz
                Band::new(10),   // G3  869.4 - 869.65 MHz
                Band::new(100),  // G4  869.7 - 870.0 MHz
            ],
            default_mask: 0b111,
            aggregated_dcycle: 1,
            aggregated_last_tx_done: Timestamp::ZERO,
            aggregated_time_off: Duration::ZERO,
        }
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channel(&self, index: usize) -> Option<&Channel> {
        self.channels.get(index)
    }

    pub fn bands(&self) -> &[Band] {
        &self.bands
    }

    pub fn default_mask(&self) -> ChannelMask {
        self.default_mask
    }

    /// Add a channel, returning its index.
    pub fn add_channel(&mut self, channel: Channel) -> Result<usize> {
        if channel.band as usize >= MAX_BANDS || channel.dr_min > channel.dr_max {
            return Err(Error::Range);
        }
        self.channels.push(channel).map_err(|_| Error::NotAvail)?;
        Ok(self.channels.len() - 1)
    }

    pub fn aggregated_dcycle(&self) -> u16 {
        self.aggregated_dcycle
    }

    pub fn set_aggregated_dcycle(&mut self, dcycle: u16) {
        self.aggregated_dcycle = dcycle.max(1);
    }

    /// Whether every enabled channel index in `mask` exists in the plan.
    pub fn mask_is_valid(&self, mask: ChannelMask) -> bool {
        (0..MAX_CHANNELS)
            .filter(|i| mask & (1 << i) != 0)
            .all(|i| self.channels.get(i).is_some_and(|c| c.freq_hz != 0))
    }

    /// Pick a random usable channel for `dr`.
    ///
    /// An all-zero mask is reset to the default channels. Returns `Disabled`
    /// when candidates exist but duty cycle blocks all of them, `NotAvail`
    /// when no enabled channel supports the datarate.
    pub fn set_next_channel(
        &self,
        now: Timestamp,
        dr: u8,
        mask: &mut ChannelMask,
        random: u32,
        duty_cycle_override: bool,
    ) -> Result<usize> {
        if *mask == 0 {
            debug!("channel mask empty, re-enabling default channels");
            *mask = self.default_mask;
        }

        let aggregated_ok = duty_cycle_override
            || now.saturating_sub(self.aggregated_last_tx_done) >= self.aggregated_time_off;

        let mut candidates: heapless::Vec<usize, MAX_CHANNELS> = heapless::Vec::new();
        let mut supporting = 0usize;
        for (i, channel) in self.channels.iter().enumerate() {
            if *mask & (1 << i) == 0 || !channel.supports(dr) {
                continue;
            }
            supporting += 1;
            let band_ok = duty_cycle_override
                || self
                    .bands
                    .get(channel.band as usize)
                    .is_some_and(|b| b.is_available(now));
            if aggregated_ok && band_ok {
                let _ = candidates.push(i);
            }
        }

        if !candidates.is_empty() {
            return Ok(candidates[random as usize % candidates.len()]);
        }
        if supporting > 0 {
            warn!("duty cycle blocks all {} channels for DR{}", supporting, dr);
            Err(Error::Disabled)
        } else {
            Err(Error::NotAvail)
        }
    }

    /// Charge a finished transmission to its band and the aggregate budget.
    pub fn record_tx(&mut self, channel: usize, tx_done: Timestamp, airtime: Duration) {
        let Some(band) = self
            .channels
            .get(channel)
            .and_then(|c| self.bands.get_mut(c.band as usize))
        else {
            return;
        };
        band.last_tx_done = tx_done;
        band.time_off = time_off(band.dcycle, airtime);
        self.aggregated_last_tx_done = tx_done;
        self.aggregated_time_off = time_off(self.aggregated_dcycle, airtime);
    }

    /// Shortest wait until a band carrying an enabled channel accepts a
    /// transmission again.
    pub fn next_band_available(&self, now: Timestamp, mask: ChannelMask) -> Duration {
        let band_wait = self
            .channels
            .iter()
            .enumerate()
            .filter(|(i, c)| mask & (1 << i) != 0 && c.freq_hz != 0)
            .filter_map(|(_, c)| self.bands.get(c.band as usize))
            .map(|b| b.wait_time(now))
            .min()
            .unwrap_or(Duration::ZERO);
        let aggregated_wait = self
            .aggregated_time_off
            .saturating_sub(now.saturating_sub(self.aggregated_last_tx_done));
        band_wait.max(aggregated_wait)
    }
}
