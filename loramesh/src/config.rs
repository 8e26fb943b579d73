//! Compile-time capacity bounds and runtime node settings.
//!
//! The `MeshConfig` trait fixes every pool size at compile time, so a node
//! allocates its arenas once at construction and never again. Use
//! `DefaultConfig` for routers and coordinators, `SmallConfig` for leaf nodes
//! on 32KB parts.
//!
//! # Example
//!
//! ```ignore
//! use loramesh::{Node, DefaultConfig, SmallConfig};
//!
//! let router = Node::<_, _, _, _, DefaultConfig>::new(radio, cipher, clock, gps, settings);
//! let leaf = Node::<_, _, _, _, SmallConfig>::new(radio, cipher, clock, gps, settings);
//! ```

use crate::channel::ChannelPlan;
use crate::device::DebugFlags;
use crate::types::{AesKey, DeviceClass, Eui};

/// Configuration trait for compile-time capacity tuning.
///
/// All bounds must be non-zero. `MAX_EVENT_HANDLERS` includes the two
/// fixed reception-window handlers.
pub trait MeshConfig {
    /// Maximum registered child nodes.
    const MAX_CHILD_NODES: usize;

    /// Maximum registered multicast groups.
    const MAX_MULTICAST_GROUPS: usize;

    /// Maximum scheduled slot reservations.
    const MAX_SCHEDULER_EVENTS: usize;

    /// Maximum scheduler handlers.
    const MAX_EVENT_HANDLERS: usize;

    /// Maximum registered application ports.
    const MAX_APPLICATIONS: usize;

    /// Maximum tracked advertising neighbours.
    const MAX_NEIGHBORS: usize;
}

/// Default configuration for routers and coordinators.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConfig;

impl MeshConfig for DefaultConfig {
    const MAX_CHILD_NODES: usize = 16;
    const MAX_MULTICAST_GROUPS: usize = 4;
    const MAX_SCHEDULER_EVENTS: usize = 128;
    const MAX_EVENT_HANDLERS: usize = 24;
    const MAX_APPLICATIONS: usize = 8;
    const MAX_NEIGHBORS: usize = 16;
}

/// Small configuration for leaf nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmallConfig;

impl MeshConfig for SmallConfig {
    const MAX_CHILD_NODES: usize = 4;
    const MAX_MULTICAST_GROUPS: usize = 2;
    const MAX_SCHEDULER_EVENTS: usize = 48;
    const MAX_EVENT_HANDLERS: usize = 8;
    const MAX_APPLICATIONS: usize = 4;
    const MAX_NEIGHBORS: usize = 4;
}

/// Over-the-air activation credentials.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct OtaaCredentials {
    pub dev_eui: Eui,
    pub app_eui: Eui,
    pub app_key: AesKey,
}

/// Runtime settings applied when a node is created.
#[derive(Clone, Debug)]
pub struct MeshSettings {
    pub class: DeviceClass,
    pub otaa: Option<OtaaCredentials>,
    pub adr: bool,
    pub public_network: bool,
    pub datarate: u8,
    pub tx_power: u8,
    pub channel_plan: ChannelPlan,
    pub debug: DebugFlags,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            class: DeviceClass::A,
            otaa: None,
            adr: false,
            public_network: true,
            datarate: 5,
            tx_power: 1,
            channel_plan: ChannelPlan::eu868(),
            debug: DebugFlags::empty(),
        }
    }
}

impl MeshSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class(mut self, class: DeviceClass) -> Self {
        self.class = class;
        self
    }

    pub fn with_otaa(mut self, otaa: OtaaCredentials) -> Self {
        self.otaa = Some(otaa);
        self
    }

    pub fn with_adr(mut self, adr: bool) -> Self {
        self.adr = adr;
        self
    }

    pub fn with_public_network(mut self, public: bool) -> Self {
        self.public_network = public;
        self
    }

    /// Initial datarate index (DR0..DR6).
    pub fn with_datarate(mut self, datarate: u8) -> Self {
        self.datarate = datarate;
        self
    }

    /// Initial tx power index into the power table.
    pub fn with_tx_power(mut self, tx_power: u8) -> Self {
        self.tx_power = tx_power;
        self
    }

    pub fn with_channel_plan(mut self, plan: ChannelPlan) -> Self {
        self.channel_plan = plan;
        self
    }

    pub fn with_debug(mut self, debug: DebugFlags) -> Self {
        self.debug = debug;
        self
    }
}
