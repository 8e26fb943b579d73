//! Device state: identity, session keys, link counters and radio settings.
//!
//! One `DeviceState` exists per node. It is owned by the `Node` and only
//! mutated from the mesh task; the radio ISR never touches it.

use core::fmt;

use crate::channel::ChannelMask;
use crate::config::MeshSettings;
use crate::time::Duration;
use crate::types::{
    DevAddr, DeviceClass, DeviceRole, Eui, SessionKeys, ADVERTISING_INTERVAL,
    ADVERTISING_RESERVED_TIME, MAX_RANK,
};

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $bit:expr,)* }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
        pub struct $name(u8);

        impl $name {
            $($(#[$fmeta])* pub const $flag: $name = $name($bit);)*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn bits(self) -> u8 {
                self.0
            }

            pub const fn from_bits_truncate(bits: u8) -> Self {
                Self(bits & (0 $(| $bit)*))
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            pub fn set(&mut self, other: Self, value: bool) {
                if value {
                    self.insert(other);
                } else {
                    self.remove(other);
                }
            }

            pub const fn union(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut set = f.debug_set();
                $(if self.contains(Self::$flag) {
                    set.entry(&format_args!("{}", stringify!($flag)));
                })*
                set.finish()
            }
        }
    };
}

flag_set! {
    /// Runtime control flags.
    ControlFlags {
        NETWORK_JOINED = 0x01,
        ADR = 0x02,
        PUBLIC_NETWORK = 0x04,
        /// A confirmed downlink awaits our ACK bit.
        ACK_PENDING = 0x08,
        /// We sent a confirmed uplink and wait for the ACK.
        ACK_REQUESTED = 0x10,
    }
}

flag_set! {
    /// Debug switches, normally all off.
    DebugFlags {
        /// Skip band and aggregate duty-cycle checks.
        DUTY_CYCLE_OVERRIDE = 0x01,
        /// Never advance the uplink counter.
        FIXED_UPLINK_COUNTER = 0x02,
        /// Do not open RX1/RX2 after class A transmissions.
        RX_WINDOWS_DISABLED = 0x04,
    }
}

/// Where this node's advertising beacon sits in the superframe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdvertisingSlot {
    /// Offset of the beacon from the superframe start, in milliseconds.
    pub time: u32,
    pub interval: Duration,
    pub duration: Duration,
}

impl Default for AdvertisingSlot {
    fn default() -> Self {
        Self {
            time: 0,
            interval: ADVERTISING_INTERVAL,
            duration: ADVERTISING_RESERVED_TIME,
        }
    }
}

/// Identity, keys, counters and radio configuration of this node.
#[derive(Clone)]
pub struct DeviceState {
    pub dev_addr: DevAddr,
    pub net_id: u32,
    pub dev_eui: Eui,
    pub app_eui: Eui,
    pub role: DeviceRole,
    pub class: DeviceClass,
    pub keys: SessionKeys,
    /// Next uplink counter to use.
    pub uplink_counter: u32,
    /// Next downlink counter expected.
    pub downlink_counter: u32,
    pub channel: usize,
    pub datarate: u8,
    pub tx_power: u8,
    pub adr_ack_counter: u16,
    pub channel_mask: ChannelMask,
    pub ctrl: ControlFlags,
    pub debug: DebugFlags,
    /// Elected coordinator, 0 if none.
    pub coordinator: DevAddr,
    pub adv_slot: AdvertisingSlot,
    pub dev_nonce: u16,
    pub last_snr: i8,
    pub last_rssi: i16,
}

impl DeviceState {
    pub fn new(settings: &MeshSettings) -> Self {
        let mut ctrl = ControlFlags::empty();
        ctrl.set(ControlFlags::ADR, settings.adr);
        ctrl.set(ControlFlags::PUBLIC_NETWORK, settings.public_network);
        let (dev_eui, app_eui) = settings
            .otaa
            .map(|o| (o.dev_eui, o.app_eui))
            .unwrap_or_default();
        Self {
            dev_addr: 0,
            net_id: 0,
            dev_eui,
            app_eui,
            role: DeviceRole::Node,
            class: settings.class,
            keys: SessionKeys::default(),
            uplink_counter: 0,
            downlink_counter: 0,
            channel: 0,
            datarate: settings.datarate,
            tx_power: settings.tx_power,
            adr_ack_counter: 0,
            channel_mask: settings.channel_plan.default_mask(),
            ctrl,
            debug: settings.debug,
            coordinator: 0,
            adv_slot: AdvertisingSlot::default(),
            dev_nonce: 0,
            last_snr: 0,
            last_rssi: 0,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.ctrl.contains(ControlFlags::NETWORK_JOINED)
    }

    /// Take the uplink counter for the next frame.
    pub fn next_uplink_counter(&mut self) -> u32 {
        let fcnt = self.uplink_counter;
        if !self.debug.contains(DebugFlags::FIXED_UPLINK_COUNTER) {
            self.uplink_counter = self.uplink_counter.wrapping_add(1);
        }
        fcnt
    }

    /// Rank advertised in beacons.
    pub fn rank(&self, children: usize) -> u8 {
        let children = children.min(MAX_RANK as usize) as u8;
        children
            .saturating_add(self.role.rank_bonus())
            .min(MAX_RANK)
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator != 0 && self.coordinator == self.dev_addr
    }
}

impl fmt::Debug for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceState")
            .field("dev_addr", &format_args!("{:08x}", self.dev_addr))
            .field("role", &self.role)
            .field("class", &self.class)
            .field("uplink_counter", &self.uplink_counter)
            .field("downlink_counter", &self.downlink_counter)
            .field("datarate", &self.datarate)
            .field("ctrl", &self.ctrl)
            .field("coordinator", &format_args!("{:08x}", self.coordinator))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_insert_remove() {
        let mut ctrl = ControlFlags::empty();
        ctrl.insert(ControlFlags::NETWORK_JOINED);
        ctrl.insert(ControlFlags::ACK_PENDING);
        assert!(ctrl.contains(ControlFlags::NETWORK_JOINED));
        assert!(ctrl.contains(ControlFlags::NETWORK_JOINED.union(ControlFlags::ACK_PENDING)));
        ctrl.remove(ControlFlags::ACK_PENDING);
        assert!(!ctrl.contains(ControlFlags::ACK_PENDING));
        assert_eq!(ctrl.bits(), 0x01);
    }

    #[test]
    fn test_from_bits_truncates_unknown() {
        assert_eq!(DebugFlags::from_bits_truncate(0xff).bits(), 0x07);
    }

    #[test]
    fn test_new_from_settings() {
        let settings = MeshSettings::new()
            .with_class(DeviceClass::C)
            .with_adr(true)
            .with_datarate(2);
        let dev = DeviceState::new(&settings);
        assert_eq!(dev.class, DeviceClass::C);
        assert_eq!(dev.datarate, 2);
        assert!(dev.ctrl.contains(ControlFlags::ADR));
        assert!(dev.ctrl.contains(ControlFlags::PUBLIC_NETWORK));
        assert!(!dev.is_joined());
        assert_eq!(dev.channel_mask, 0b111);
    }

    #[test]
    fn test_fixed_uplink_counter() {
        let mut dev = DeviceState::new(&MeshSettings::new());
        assert_eq!(dev.next_uplink_counter(), 0);
        assert_eq!(dev.next_uplink_counter(), 1);
        dev.debug.insert(DebugFlags::FIXED_UPLINK_COUNTER);
        assert_eq!(dev.next_uplink_counter(), 2);
        assert_eq!(dev.next_uplink_counter(), 2);
    }

    #[test]
    fn test_rank_clamped() {
        let mut dev = DeviceState::new(&MeshSettings::new());
        assert_eq!(dev.rank(0), 0);
        dev.role = DeviceRole::Router;
        assert_eq!(dev.rank(3), 5);
        dev.role = DeviceRole::Coordinator;
        assert_eq!(dev.rank(40), MAX_RANK);
    }
}
