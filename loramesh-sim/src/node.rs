//! Simulated radio, clock and the node wrapper driven by the simulator.

use std::cell::{Cell, RefCell};
use std::future::{ready, Ready};
use std::rc::Rc;

use embassy_sync::channel::Channel;
use loramesh::config::DefaultConfig;
use loramesh::phy::lora_time_on_air;
use loramesh::traits::test_impls::FixedPosition;
use loramesh::traits::{
    Modem, RadioEventChannel, RadioFrame, RadioStatus, RxConfig, TxConfig,
};
use loramesh::{
    AesCmacCipher, Clock, DevAddr, DeviceRole, Duration, Event as MeshEvent, MeshSettings, Node,
    Radio, RadioEvent, Result, SessionKeys, Timestamp,
};

use crate::NodeIndex;

/// Network id every simulated node is personalised with.
pub const SIM_NET_ID: u32 = 0x13;

/// Session keys shared by the whole simulated network.
pub const SIM_KEYS: SessionKeys = SessionKeys::new([0x2b; 16], [0x7e; 16]);

/// SNR reported with every simulated reception.
const SIM_SNR: i8 = 7;

/// Address a node is personalised with: a distinct upper half per node.
pub fn sim_address(index: NodeIndex) -> DevAddr {
    0x2600_0001 | ((index as u32 + 1) & 0xff) << 16
}

/// Radio on a simulated medium.
///
/// Transmitted frames and receive timeouts are collected for the simulator,
/// which turns them into scheduled events. A frame is only received while
/// the radio is in receive mode.
pub struct SimRadio {
    status: RadioStatus,
    pub frequency: u32,
    pub tx_config: Option<TxConfig>,
    pub rx_config: Option<RxConfig>,
    pub initialized: bool,
    continuous: bool,
    /// Bumped whenever a pending reception window is cancelled.
    rx_generation: u64,
    outbox: Vec<(Vec<u8>, Duration)>,
    rx_windows: Vec<(u64, Duration)>,
    random_state: u64,
    events: RadioEventChannel,
}

impl SimRadio {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            status: RadioStatus::Idle,
            frequency: 0,
            tx_config: None,
            rx_config: None,
            initialized: false,
            continuous: false,
            rx_generation: 0,
            outbox: Vec::new(),
            rx_windows: Vec::new(),
            random_state: seed,
            events: Channel::new(),
        }
    }

    /// Frames handed to the radio since the last call, with their airtime.
    pub fn take_outbox(&mut self) -> Vec<(Vec<u8>, Duration)> {
        std::mem::take(&mut self.outbox)
    }

    /// Single reception windows opened since the last call.
    pub fn take_rx_windows(&mut self) -> Vec<(u64, Duration)> {
        std::mem::take(&mut self.rx_windows)
    }

    /// A frame arrives; returns false if the receiver was not listening.
    pub fn deliver(&mut self, data: &[u8], rssi: i16, snr: i8) -> bool {
        if self.status != RadioStatus::RxRunning {
            return false;
        }
        let mut payload = RadioFrame::new();
        if payload.extend_from_slice(data).is_err() {
            return false;
        }
        if !self.continuous {
            self.status = RadioStatus::Idle;
            self.rx_generation += 1;
        }
        self.events
            .try_send(RadioEvent::RxDone { payload, rssi, snr })
            .is_ok()
    }

    pub fn complete_tx(&mut self) {
        if self.status == RadioStatus::TxRunning {
            self.status = RadioStatus::Idle;
            let _ = self.events.try_send(RadioEvent::TxDone);
        }
    }

    /// Close the window opened as `generation`, if it is still open.
    pub fn expire_rx(&mut self, generation: u64) -> bool {
        if generation != self.rx_generation || self.status != RadioStatus::RxRunning {
            return false;
        }
        self.status = RadioStatus::Idle;
        self.events.try_send(RadioEvent::RxTimeout).is_ok()
    }
}

impl Radio for SimRadio {
    fn init(&mut self) {
        self.initialized = true;
    }

    fn reset(&mut self) {
        self.status = RadioStatus::Idle;
        self.rx_generation += 1;
    }

    fn set_channel(&mut self, freq_hz: u32) {
        self.frequency = freq_hz;
    }

    fn set_tx_config(&mut self, config: &TxConfig) {
        self.tx_config = Some(*config);
    }

    fn set_rx_config(&mut self, config: &RxConfig) {
        self.rx_config = Some(*config);
    }

    fn send(&mut self, frame: &[u8]) {
        let airtime = self.time_on_air(Modem::LoRa, frame.len());
        self.outbox.push((frame.to_vec(), airtime));
        self.status = RadioStatus::TxRunning;
        self.rx_generation += 1;
    }

    fn rx(&mut self, timeout: Duration) {
        self.rx_generation += 1;
        self.status = RadioStatus::RxRunning;
        self.continuous = timeout == Duration::ZERO;
        if !self.continuous {
            self.rx_windows.push((self.rx_generation, timeout));
        }
    }

    fn sleep(&mut self) {
        self.status = RadioStatus::Idle;
        self.rx_generation += 1;
    }

    fn random(&mut self) -> u32 {
        self.random_state = self
            .random_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.random_state >> 32) as u32
    }

    fn time_on_air(&self, _modem: Modem, len: usize) -> Duration {
        match self.tx_config {
            Some(cfg) => lora_time_on_air(&cfg, len),
            None => Duration::from_millis(50),
        }
    }

    fn status(&self) -> RadioStatus {
        self.status
    }

    fn set_max_payload_length(&mut self, _modem: Modem, _len: u8) {}

    fn events(&self) -> &RadioEventChannel {
        &self.events
    }
}

/// Clock for simulation.
///
/// Time is controlled externally by the simulator.
pub struct SimClock {
    current: Cell<Timestamp>,
}

impl SimClock {
    pub fn at(time: Timestamp) -> Self {
        Self {
            current: Cell::new(time),
        }
    }

    pub fn set(&self, time: Timestamp) {
        self.current.set(time);
    }
}

impl Clock for SimClock {
    type SleepFuture<'a> = Ready<()>;

    fn now(&self) -> Timestamp {
        self.current.get()
    }

    fn sleep_until(&self, _time: Timestamp) -> Self::SleepFuture<'_> {
        ready(())
    }
}

/// Type alias for simulated nodes.
pub type SimNodeInner = Node<SimRadio, AesCmacCipher, SimClock, FixedPosition, DefaultConfig>;

/// Application payloads received by a node: (port, payload).
pub type Received = Rc<RefCell<Vec<(u8, Vec<u8>)>>>;

/// What a poll produced for the medium.
#[derive(Debug, Default)]
pub struct RadioOutput {
    pub frames: Vec<(Vec<u8>, Duration)>,
    pub rx_windows: Vec<(u64, Duration)>,
}

/// Wrapper around a loramesh node for simulation.
pub struct SimNode {
    index: NodeIndex,
    inner: SimNodeInner,
    /// When the node powers up.
    pub start_at: Timestamp,
    pub(crate) started: bool,
    /// Pending wake-up, if one is scheduled.
    pub(crate) wake_at: Option<Timestamp>,
    events: Vec<MeshEvent>,
    received: Received,
}

impl SimNode {
    /// Create a node that is personalised (ABP) into the simulated network.
    ///
    /// The node's superframe starts at `start_at`.
    pub fn new(
        index: NodeIndex,
        settings: MeshSettings,
        seed: u64,
        start_at: Timestamp,
        position: FixedPosition,
    ) -> Result<Self> {
        let mut inner = Node::new(
            SimRadio::with_seed(seed),
            AesCmacCipher::new(),
            SimClock::at(start_at),
            position,
            settings,
        )?;
        inner.join_abp(sim_address(index), SIM_NET_ID, SIM_KEYS)?;
        let mut node = Self {
            index,
            inner,
            start_at,
            started: false,
            wake_at: None,
            events: Vec::new(),
            received: Rc::new(RefCell::new(Vec::new())),
        };
        node.drain_events();
        Ok(node)
    }

    pub fn index(&self) -> NodeIndex {
        self.index
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn inner(&self) -> &SimNodeInner {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut SimNodeInner {
        &mut self.inner
    }

    pub fn dev_addr(&self) -> DevAddr {
        self.inner.dev_addr()
    }

    pub fn role(&self) -> DeviceRole {
        self.inner.role()
    }

    pub fn coordinator(&self) -> DevAddr {
        self.inner.coordinator()
    }

    pub fn parent(&self) -> Option<DevAddr> {
        self.inner.parent()
    }

    pub fn child_count(&self) -> usize {
        self.inner.child_nodes().count()
    }

    pub fn neighbor_count(&self) -> usize {
        self.inner.neighbors().len()
    }

    /// Application events the node has emitted so far.
    pub fn events(&self) -> &[MeshEvent] {
        &self.events
    }

    /// Payloads delivered to ports registered with [`SimNode::listen`].
    pub fn received(&self) -> Vec<(u8, Vec<u8>)> {
        self.received.borrow().clone()
    }

    /// Record every payload arriving on `port`.
    pub fn listen(&mut self, port: u8) -> Result<()> {
        let received = self.received.clone();
        self.inner
            .register_application(port, move |port: u8, data: &[u8]| -> Result<()> {
                received.borrow_mut().push((port, data.to_vec()));
                Ok(())
            })
    }

    /// Move the node's clock; API calls read it.
    pub fn set_time(&self, now: Timestamp) {
        self.inner.clock().set(now);
    }

    /// Run the node's pipeline at `now` and collect what it put on air.
    pub fn poll(&mut self, now: Timestamp) -> RadioOutput {
        self.set_time(now);
        self.inner.poll(now);
        self.drain_events();
        let radio = self.inner.radio_mut();
        RadioOutput {
            frames: radio.take_outbox(),
            rx_windows: radio.take_rx_windows(),
        }
    }

    pub fn next_wakeup(&self, now: Timestamp) -> Timestamp {
        self.inner.next_wakeup(now)
    }

    pub fn deliver(&mut self, data: &[u8], rssi: i16) -> bool {
        self.inner.radio_mut().deliver(data, rssi, SIM_SNR)
    }

    pub fn complete_tx(&mut self) {
        self.inner.radio_mut().complete_tx();
    }

    pub fn expire_rx(&mut self, generation: u64) -> bool {
        self.inner.radio_mut().expire_rx(generation)
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.inner.events().try_receive() {
            self.events.push(event);
        }
    }
}
