//! Core traits for radio, cryptography, time and position abstraction.
//!
//! These traits allow the stack to run against:
//! - Radio transceivers (SX1276 driver, simulated medium)
//! - Cipher backends (software AES, hardware AES engines)
//! - Time sources (hardware timers, simulated time)
//! - Position providers (GPS receiver, fixed survey position)

use core::future::Future;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

use crate::time::{Duration, Timestamp};
use crate::types::{AesKey, Event, Result, RADIO_MAX_FRAME};

/// Queue size for radio interrupt events.
pub const RADIO_EVENT_QUEUE_SIZE: usize = 4;

/// Queue size for the application event channel.
pub const EVENT_QUEUE_SIZE: usize = 16;

/// Mutex type used for channels.
pub type ChannelMutex = CriticalSectionRawMutex;

/// Raw frame as delivered by the radio.
pub type RadioFrame = heapless::Vec<u8, RADIO_MAX_FRAME>;

/// Channel carrying radio interrupt events into the mesh task.
pub type RadioEventChannel = Channel<ChannelMutex, RadioEvent, RADIO_EVENT_QUEUE_SIZE>;

/// Application event channel.
pub type EventChannel = Channel<ChannelMutex, Event, EVENT_QUEUE_SIZE>;

/// Event raised by the radio driver in interrupt context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RadioEvent {
    TxDone,
    RxDone { payload: RadioFrame, rssi: i16, snr: i8 },
    RxTimeout,
    RxError,
    CadDone { detected: bool },
}

/// Transceiver state as reported by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RadioStatus {
    Idle,
    RxRunning,
    TxRunning,
    Cad,
}

/// Modulation used for time-on-air and payload limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Modem {
    Fsk,
    LoRa,
}

/// LoRa bandwidth.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bandwidth {
    Khz125,
    Khz250,
    Khz500,
}

impl Bandwidth {
    pub fn hz(self) -> u32 {
        match self {
            Bandwidth::Khz125 => 125_000,
            Bandwidth::Khz250 => 250_000,
            Bandwidth::Khz500 => 500_000,
        }
    }
}

/// Transmit configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxConfig {
    pub modem: Modem,
    pub power_dbm: i8,
    pub bandwidth: Bandwidth,
    pub spreading_factor: u8,
    /// Coding rate denominator offset (1 = 4/5 .. 4 = 4/8).
    pub coderate: u8,
    pub preamble_len: u16,
    pub crc_on: bool,
    pub iq_inverted: bool,
}

/// Receive configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxConfig {
    pub modem: Modem,
    pub bandwidth: Bandwidth,
    pub spreading_factor: u8,
    pub coderate: u8,
    pub preamble_len: u16,
    pub symbol_timeout: u16,
    pub continuous: bool,
    pub iq_inverted: bool,
    pub max_payload_len: u8,
}

/// Radio transceiver capability set.
///
/// Interrupt handlers report completions by pushing into `events()`; that
/// channel is the only state shared between interrupt and task context.
///
/// # Usage Contract
///
/// - Radio ISR → `events().try_send(RadioEvent::RxDone { .. })`
/// - Mesh task → `events().try_receive()` on every poll
pub trait Radio {
    /// Bring the transceiver up. Called once from the PHY initial state.
    fn init(&mut self);

    fn reset(&mut self);

    /// Tune to a carrier frequency in Hz.
    fn set_channel(&mut self, freq_hz: u32);

    fn set_tx_config(&mut self, config: &TxConfig);

    fn set_rx_config(&mut self, config: &RxConfig);

    /// Start transmitting. Completion is signalled with `RadioEvent::TxDone`.
    fn send(&mut self, frame: &[u8]);

    /// Start receiving. `Duration::ZERO` means continuous reception.
    fn rx(&mut self, timeout: Duration);

    fn sleep(&mut self);

    /// Hardware random word (wideband RSSI noise on the SX1276).
    fn random(&mut self) -> u32;

    /// Airtime of a frame of `len` bytes under the current tx configuration.
    fn time_on_air(&self, modem: Modem, len: usize) -> Duration;

    fn status(&self) -> RadioStatus;

    fn set_max_payload_length(&mut self, modem: Modem, len: u8);

    fn check_rf_frequency(&self, freq_hz: u32) -> bool {
        let _ = freq_hz;
        true
    }

    /// Interrupt event channel.
    fn events(&self) -> &RadioEventChannel;
}

/// Time source trait for real or simulated time.
///
/// # Example (embedded with embassy)
///
/// ```text
/// struct EmbassyClock;
///
/// impl Clock for EmbassyClock {
///     type SleepFuture<'a> = embassy_time::Timer;
///
///     fn now(&self) -> Timestamp {
///         Timestamp::from_millis(embassy_time::Instant::now().as_millis())
///     }
///
///     fn sleep_until(&self, time: Timestamp) -> Self::SleepFuture<'_> {
///         embassy_time::Timer::at(embassy_time::Instant::from_millis(time.as_millis()))
///     }
/// }
/// ```
pub trait Clock {
    /// Future type returned by sleep_until.
    type SleepFuture<'a>: Future<Output = ()>
    where
        Self: 'a;

    fn now(&self) -> Timestamp;

    fn sleep_until(&self, time: Timestamp) -> Self::SleepFuture<'_>;
}

/// Block cipher and MAC primitives.
///
/// The LoRaWAN constructions in [`crate::crypto`] are built on these three
/// operations, so a hardware AES engine only has to provide them.
pub trait Cipher {
    /// AES-128 encrypt one block in place.
    fn encrypt_block(&self, key: &AesKey, block: &mut [u8; 16]);

    /// AES-128 decrypt one block in place.
    fn decrypt_block(&self, key: &AesKey, block: &mut [u8; 16]);

    /// AES-CMAC over `data`.
    fn cmac(&self, key: &AesKey, data: &[u8]) -> [u8; 16];
}

/// Binary position, scaled signed latitude and longitude.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Position {
    pub lat: i32,
    pub lon: i32,
}

impl Position {
    pub const fn new(lat: i32, lon: i32) -> Self {
        Self { lat, lon }
    }

    /// Octagonal distance estimate in position units.
    ///
    /// Within 8% of the euclidean distance, no floating point needed.
    pub fn distance_to(&self, other: &Position) -> u32 {
        let dlat = (self.lat as i64 - other.lat as i64).unsigned_abs();
        let dlon = (self.lon as i64 - other.lon as i64).unsigned_abs();
        let (big, small) = if dlat > dlon { (dlat, dlon) } else { (dlon, dlat) };
        let d = big + small * 3 / 8;
        d.min(u32::MAX as u64) as u32
    }
}

/// Source of this node's position (GPS receiver or fixed configuration).
pub trait PositionSource {
    /// Last known position, if any fix is available.
    fn latest_position(&self) -> Option<Position>;

    /// Distance from the last known position to `other`.
    fn distance_to(&self, other: &Position) -> Option<u32> {
        self.latest_position().map(|p| p.distance_to(other))
    }
}

/// Handler bound to an application port.
///
/// Closures of the form `FnMut(u8, &[u8]) -> Result<()>` implement this.
pub trait PortHandler {
    fn on_frame(&mut self, port: u8, payload: &[u8]) -> Result<()>;
}

impl<F> PortHandler for F
where
    F: FnMut(u8, &[u8]) -> Result<()>,
{
    fn on_frame(&mut self, port: u8, payload: &[u8]) -> Result<()> {
        self(port, payload)
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_impls {
    //! Mock implementations of traits for unit testing and the simulator.
    //!
    //! Available when running tests or with the `test-support` feature enabled.

    use alloc::vec::Vec;
    use core::cell::Cell;
    use core::future::{ready, Ready};

    use super::*;
    use crate::phy::lora_time_on_air;

    /// Mock radio that records every call.
    pub struct MockRadio {
        pub frequency: u32,
        pub tx_config: Option<TxConfig>,
        pub rx_config: Option<RxConfig>,
        pub sent: Vec<Vec<u8>>,
        pub rx_requests: Vec<Duration>,
        pub status: RadioStatus,
        pub sleeps: usize,
        pub initialized: bool,
        random_state: u64,
        events: RadioEventChannel,
    }

    impl Default for MockRadio {
        fn default() -> Self {
            Self {
                frequency: 0,
                tx_config: None,
                rx_config: None,
                sent: Vec::new(),
                rx_requests: Vec::new(),
                status: RadioStatus::Idle,
                sleeps: 0,
                initialized: false,
                random_state: 12345,
                events: Channel::new(),
            }
        }
    }

    impl MockRadio {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_seed(seed: u64) -> Self {
            Self {
                random_state: seed,
                ..Self::default()
            }
        }

        /// Inject a received frame as the ISR would.
        pub fn inject_rx(&self, data: &[u8], rssi: i16, snr: i8) {
            let mut payload = RadioFrame::new();
            let _ = payload.extend_from_slice(data);
            let _ = self.events.try_send(RadioEvent::RxDone { payload, rssi, snr });
        }

        /// Signal completion of the last transmission.
        pub fn complete_tx(&self) {
            let _ = self.events.try_send(RadioEvent::TxDone);
        }

        /// Take all transmitted frames.
        pub fn take_sent(&mut self) -> Vec<Vec<u8>> {
            core::mem::take(&mut self.sent)
        }
    }

    impl Radio for MockRadio {
        fn init(&mut self) {
            self.initialized = true;
        }

        fn reset(&mut self) {
            self.status = RadioStatus::Idle;
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
            self.sent.push(frame.to_vec());
            self.status = RadioStatus::TxRunning;
        }

        fn rx(&mut self, timeout: Duration) {
            self.rx_requests.push(timeout);
            self.status = RadioStatus::RxRunning;
        }

        fn sleep(&mut self) {
            self.sleeps += 1;
            self.status = RadioStatus::Idle;
        }

        fn random(&mut self) -> u32 {
            // Simple LCG
            self.random_state = self
                .random_state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1);
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

    /// Mock clock for testing (synchronous, time advances manually).
    pub struct MockClock {
        current: Cell<Timestamp>,
    }

    impl Default for MockClock {
        fn default() -> Self {
            Self {
                current: Cell::new(Timestamp::ZERO),
            }
        }
    }

    impl MockClock {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn at(time: Timestamp) -> Self {
            Self {
                current: Cell::new(time),
            }
        }

        pub fn set(&self, time: Timestamp) {
            self.current.set(time);
        }

        pub fn advance(&self, duration: Duration) {
            self.current.set(self.current.get() + duration);
        }
    }

    impl Clock for MockClock {
        type SleepFuture<'a> = Ready<()>;

        fn now(&self) -> Timestamp {
            self.current.get()
        }

        fn sleep_until(&self, time: Timestamp) -> Self::SleepFuture<'_> {
            // Jump straight to the deadline.
            if time > self.current.get() {
                self.current.set(time);
            }
            ready(())
        }
    }

    /// Position source with a fixed (or absent) fix.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct FixedPosition(pub Option<Position>);

    impl FixedPosition {
        pub fn at(lat: i32, lon: i32) -> Self {
            Self(Some(Position::new(lat, lon)))
        }

        pub fn none() -> Self {
            Self(None)
        }
    }

    impl PositionSource for FixedPosition {
        fn latest_position(&self) -> Option<Position> {
            self.0
        }
    }
}
