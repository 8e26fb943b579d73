//! Node context: owns every layer's state and drives the frame pipeline.
//!
//! A `Node` replaces the process-wide device record: all layers are `impl`
//! blocks on it (see `phy`, `mac`, `frm`, `mesh`, `advertising`, `shell`),
//! so the single writer is whoever holds `&mut Node`. The radio ISR only
//! talks to the node through the radio's event channel.
//!
//! # Usage
//!
//! ```ignore
//! let mut node = Node::<_, _, _, _, DefaultConfig>::new(radio, cipher, clock, gps, settings)?;
//! node.join_abp(0x2601_0001, 0x13, keys)?;
//! node.register_application(10, |port, data: &[u8]| Ok(()))?;
//! node.register_transmission(10, Duration::from_secs(60))?;
//!
//! // Spawn the node's run loop
//! spawn(async move {
//!     node.run().await;
//! });
//! ```
//!
//! Deterministic hosts call [`Node::poll`] directly and sleep until
//! [`Node::next_wakeup`].

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::marker::PhantomData;

use embassy_sync::channel::Channel;
use hashbrown::HashMap;
use log::{info, warn};

use crate::advertising::NeighborTable;
use crate::channel::ChannelPlan;
use crate::config::{DefaultConfig, MeshConfig, MeshSettings, OtaaCredentials};
use crate::device::DeviceState;
use crate::election::{ElectionPolicy, WeightedElection};
use crate::frm::FOpts;
use crate::phy::{Phy, PhyState};
use crate::registry::{ChildNode, ChildRegistry, MulticastGroup, MulticastRegistry};
use crate::scheduler::{HandlerKey, Scheduler};
use crate::time::{Duration, Timestamp};
use crate::traits::{Cipher, Clock, EventChannel, PortHandler, PositionSource, Radio};
use crate::types::{
    DevAddr, DeviceRole, Event, Payload, Result, ADVERTISING_INTERVAL, MESH_POLL_INTERVAL,
};

/// Join procedure waiting for its answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PendingJoin {
    Otaa {
        dev_nonce: u16,
    },
    Mesh {
        nonce: u16,
        target: DevAddr,
        periodicity: Duration,
    },
}

/// Payload waiting for its uplink slot.
#[derive(Clone, Debug)]
pub(crate) struct PendingUplink {
    pub payload: Payload,
    pub confirmed: bool,
}

/// Registered application port.
pub(crate) type Application = (u8, Box<dyn PortHandler>);

/// The LoRaMesh node.
///
/// Generic over:
/// - `R`: radio transceiver
/// - `Cip`: AES/CMAC backend
/// - `Clk`: clock/timer implementation
/// - `P`: position source
/// - `C`: compile-time capacities
pub struct Node<R, Cip, Clk, P, C = DefaultConfig> {
    // Dependencies (injected)
    pub(crate) radio: R,
    pub(crate) cipher: Cip,
    pub(crate) clock: Clk,
    pub(crate) position: P,

    pub(crate) events: EventChannel,

    // Device and radio configuration
    pub(crate) device: DeviceState,
    pub(crate) channels: ChannelPlan,
    pub(crate) otaa: Option<OtaaCredentials>,

    // Frame pipeline
    pub(crate) phy: Phy,
    pub(crate) scheduler: Scheduler,
    /// MAC commands for the FOpts of the next uplink.
    pub(crate) mac_answers: FOpts,

    // Topology
    pub(crate) children: ChildRegistry,
    pub(crate) multicast: MulticastRegistry,
    pub(crate) parent: Option<DevAddr>,
    pub(crate) neighbors: NeighborTable,
    pub(crate) election: Box<dyn ElectionPolicy>,

    // Application
    pub(crate) applications: Vec<Application>,
    /// Uplink handlers by port.
    pub(crate) transmissions: HashMap<u8, HandlerKey>,
    pub(crate) pending_uplinks: HashMap<u8, PendingUplink>,
    /// Multicast payloads by group: (port, payload).
    pub(crate) pending_multicast: HashMap<DevAddr, (u8, Payload)>,

    // Procedures
    pub(crate) pending_join: Option<PendingJoin>,
    pub(crate) next_advertising: Option<Timestamp>,
    pub(crate) started: Timestamp,

    _config: PhantomData<C>,
}

impl<R, Cip, Clk, P, C> Node<R, Cip, Clk, P, C>
where
    R: Radio,
    Cip: Cipher,
    Clk: Clock,
    P: PositionSource,
    C: MeshConfig,
{
    /// Create a node. The superframe epoch is the current clock time.
    pub fn new(radio: R, cipher: Cip, clock: Clk, position: P, settings: MeshSettings) -> Result<Self> {
        let now = clock.now();
        let scheduler = Scheduler::new(C::MAX_SCHEDULER_EVENTS, C::MAX_EVENT_HANDLERS, now)?;
        let device = DeviceState::new(&settings);

        Ok(Self {
            radio,
            cipher,
            clock,
            position,
            events: Channel::new(),
            device,
            channels: settings.channel_plan,
            otaa: settings.otaa,
            phy: Phy::new(),
            scheduler,
            mac_answers: FOpts::new(),
            children: ChildRegistry::with_capacity(C::MAX_CHILD_NODES),
            multicast: MulticastRegistry::with_capacity(C::MAX_MULTICAST_GROUPS),
            parent: None,
            neighbors: NeighborTable::with_capacity(C::MAX_NEIGHBORS),
            election: Box::new(WeightedElection),
            applications: Vec::with_capacity(C::MAX_APPLICATIONS),
            transmissions: HashMap::new(),
            pending_uplinks: HashMap::new(),
            pending_multicast: HashMap::new(),
            pending_join: None,
            // Listen for one full interval before the first beacon.
            next_advertising: Some(now + ADVERTISING_INTERVAL),
            started: now,
            _config: PhantomData,
        })
    }

    /// Replace the coordinator-election policy.
    pub fn set_election_policy<E: ElectionPolicy + 'static>(&mut self, policy: E) {
        self.election = Box::new(policy);
    }

    // --- Accessors ---

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn clock(&self) -> &Clk {
        &self.clock
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn device(&self) -> &DeviceState {
        &self.device
    }

    pub fn dev_addr(&self) -> DevAddr {
        self.device.dev_addr
    }

    pub fn role(&self) -> DeviceRole {
        self.device.role
    }

    /// Elected coordinator, 0 if none is known.
    pub fn coordinator(&self) -> DevAddr {
        self.device.coordinator
    }

    /// Parent assigned by a join-mesh accept.
    pub fn parent(&self) -> Option<DevAddr> {
        self.parent
    }

    pub fn is_joined(&self) -> bool {
        self.device.is_joined()
    }

    /// Rank advertised in the next beacon.
    pub fn rank(&self) -> u8 {
        self.device.rank(self.children.len())
    }

    pub fn channel_plan(&self) -> &ChannelPlan {
        &self.channels
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn phy(&self) -> &Phy {
        &self.phy
    }

    pub fn child_nodes(&self) -> impl Iterator<Item = &ChildNode> {
        self.children.iter()
    }

    pub fn multicast_groups(&self) -> impl Iterator<Item = &MulticastGroup> {
        self.multicast.iter()
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    /// Application event channel.
    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    pub(crate) fn push_event(&mut self, event: Event) {
        if self.events.try_send(event).is_err() {
            warn!("event queue full, dropping event");
        }
    }

    pub(crate) fn set_role(&mut self, role: DeviceRole) {
        if self.device.role != role {
            info!("role {} -> {}", self.device.role, role);
            self.device.role = role;
            self.push_event(Event::RoleChanged { role });
        }
    }

    // --- Main loop ---

    /// Run one pass of the pipeline at `now`.
    ///
    /// Radio events are drained first, then due timers fire (slot dispatch,
    /// advertising, reception windows), then the PHY may start a
    /// transmission and one received frame is handed up the stack.
    pub fn poll(&mut self, now: Timestamp) {
        self.phy_radio_events(now);

        // Drift is logged by the scheduler and the cursor re-aligned.
        if let Ok(Some(action)) = self.scheduler.on_timer(now) {
            self.mesh_on_slot(now, action);
        }
        self.advertising_timer(now);
        self.phy_timers(now);

        self.phy_process(now);
        self.mac_process(now);
    }

    /// Earliest time at which `poll` has work to do.
    pub fn next_wakeup(&self, now: Timestamp) -> Timestamp {
        if self.phy.rx_pending() || !self.radio.events().is_empty() {
            return now;
        }
        let mut wake = now + ADVERTISING_INTERVAL;
        for t in [
            self.scheduler.timer(),
            self.phy.next_timer(),
            self.next_advertising,
        ]
        .into_iter()
        .flatten()
        {
            wake = wake.min(t);
        }
        if self.phy.tx_pending() || matches!(self.phy.state(), PhyState::Initial | PhyState::WaitTxDone)
        {
            wake = wake.min(now + MESH_POLL_INTERVAL);
        }
        wake.max(now)
    }

    /// Run the node's main loop.
    ///
    /// The pipeline is polled every `MESH_POLL_INTERVAL`. Call this from an
    /// async task/executor.
    pub async fn run(&mut self) -> ! {
        loop {
            let now = self.clock.now();
            self.poll(now);
            self.clock.sleep_until(now + MESH_POLL_INTERVAL).await;
        }
    }
}
