//! Core types and constants for the loramesh stack.

use core::fmt;

use crate::time::Duration;

// Frame sizes
pub const PHY_MAX_PAYLOAD: usize = 128;
pub const PHY_HEADER_SIZE: usize = 2; // flags + size
pub const PHY_BUFFER_SIZE: usize = PHY_HEADER_SIZE + PHY_MAX_PAYLOAD;
pub const MAC_HEADER_SIZE: usize = 1;
pub const MIC_SIZE: usize = 4;
pub const MAC_MAX_PAYLOAD: usize = PHY_MAX_PAYLOAD - MAC_HEADER_SIZE - MIC_SIZE;
pub const FRM_HEADER_SIZE: usize = 7; // addr(4) + fctrl(1) + fcnt(2)
pub const FRM_PORT_SIZE: usize = 1;
pub const MAX_FOPTS_LEN: usize = 15;
pub const LORAMESH_PAYLOAD_SIZE: usize = MAC_MAX_PAYLOAD - FRM_HEADER_SIZE - FRM_PORT_SIZE;
pub const RADIO_MAX_FRAME: usize = 255;

// Application ports
pub const PORT_MAC_COMMANDS: u8 = 0;
pub const PORT_MIN: u8 = 1;
pub const PORT_MAX: u8 = 223;

// Superframe timing
pub const TIME_PER_SLOT: Duration = Duration::from_millis(100);
pub const ADVERTISING_INTERVAL: Duration = Duration::from_millis(36_000);
pub const ADVERTISING_RESERVED_TIME: Duration = Duration::from_millis(2_000);
pub const ADVERTISING_GUARD_TIME: Duration = Duration::from_millis(2_000);
pub const AVAILABLE_SLOT_TIME: Duration = Duration::from_millis(
    ADVERTISING_INTERVAL.as_millis()
        - ADVERTISING_RESERVED_TIME.as_millis()
        - ADVERTISING_GUARD_TIME.as_millis(),
);
pub const NOF_AVAILABLE_SLOTS: u16 =
    (AVAILABLE_SLOT_TIME.as_millis() / TIME_PER_SLOT.as_millis()) as u16;
pub const UPLINK_RESERVED_TIME: Duration = Duration::from_millis(500);
pub const RECEPTION_RESERVED_TIME: Duration = Duration::from_millis(500);
pub const MULTICAST_RESERVED_TIME: Duration = Duration::from_millis(1_000);
pub const RX1_DELAY: Duration = Duration::from_millis(1_000);
pub const RX2_DELAY: Duration = Duration::from_millis(2_000);
pub const MAX_ALLOCATION_TRIES: usize = 10;
pub const MESH_POLL_INTERVAL: Duration = Duration::from_millis(10);

// Adaptive data rate
pub const ADR_ACK_LIMIT: u16 = 64;
pub const ADR_ACK_DELAY: u16 = 32;

// Ranking
pub const MAX_RANK: u8 = 15;

/// 32-bit device or group address.
pub type DevAddr = u32;

/// 128-bit AES key.
pub type AesKey = [u8; 16];

/// 64-bit extended unique identifier.
pub type Eui = [u8; 8];

/// Application payload type.
pub type Payload = alloc::vec::Vec<u8>;

/// Network and application session keys.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionKeys {
    pub nwk: AesKey,
    pub app: AesKey,
}

impl SessionKeys {
    pub const fn new(nwk: AesKey, app: AesKey) -> Self {
        Self { nwk, app }
    }

    /// Key used for payload encryption on the given port.
    pub fn payload_key(&self, port: u8) -> &AesKey {
        if port == PORT_MAC_COMMANDS {
            &self.nwk
        } else {
            &self.app
        }
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("nwk", &format_args!("[{:02x}{:02x}..]", self.nwk[0], self.nwk[1]))
            .field("app", &format_args!("[{:02x}{:02x}..]", self.app[0], self.app[1]))
            .finish()
    }
}

/// Position of a node in the mesh hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DeviceRole {
    #[default]
    Node = 0,
    Router = 1,
    Coordinator = 2,
}

impl DeviceRole {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(DeviceRole::Node),
            1 => Some(DeviceRole::Router),
            2 => Some(DeviceRole::Coordinator),
            _ => None,
        }
    }

    /// Rank contribution of the role.
    pub fn rank_bonus(self) -> u8 {
        match self {
            DeviceRole::Node => 0,
            DeviceRole::Router => 2,
            DeviceRole::Coordinator => 4,
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRole::Node => f.write_str("NODE"),
            DeviceRole::Router => f.write_str("ROUTER"),
            DeviceRole::Coordinator => f.write_str("COORDINATOR"),
        }
    }
}

/// LoRaWAN-style device class.
///
/// Class B behaves like class A (no beacon tracking) and class D like class C.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DeviceClass {
    #[default]
    A,
    B,
    C,
    D,
}

impl DeviceClass {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(DeviceClass::A),
            1 => Some(DeviceClass::B),
            2 => Some(DeviceClass::C),
            3 => Some(DeviceClass::D),
            _ => None,
        }
    }

    pub fn to_bits(self) -> u8 {
        self as u8
    }

    /// Whether the receiver stays on between transmissions.
    pub fn listens_continuously(self) -> bool {
        matches!(self, DeviceClass::C | DeviceClass::D)
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            DeviceClass::A => 'A',
            DeviceClass::B => 'B',
            DeviceClass::C => 'C',
            DeviceClass::D => 'D',
        };
        write!(f, "{}", c)
    }
}

/// Events emitted by the node for application handling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Network join completed (ABP or OTAA).
    Joined { dev_addr: DevAddr },
    /// Joined the mesh below a parent.
    MeshJoined { parent: DevAddr, dev_addr: DevAddr },
    /// Known coordinator changed (0 = none).
    CoordinatorChanged { coordinator: DevAddr },
    /// This node's role changed.
    RoleChanged { role: DeviceRole },
    /// A child node was registered.
    ChildAdded { dev_addr: DevAddr },
    /// A child node was removed.
    ChildRemoved { dev_addr: DevAddr },
    /// A confirmed uplink was acknowledged.
    AckReceived,
    /// Link check answer received.
    LinkCheck { margin: u8, gateways: u8 },
}

/// Error taxonomy shared by every layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Generic failure or lookup miss.
    #[error("operation failed")]
    Failed,
    /// Buffer or size bound exceeded.
    #[error("size bound exceeded")]
    Overflow,
    /// Resource exhausted or network not joined.
    #[error("resource not available")]
    NotAvail,
    /// Parameter outside its valid domain.
    #[error("parameter out of range")]
    Range,
    /// Queue drained with nothing in it.
    #[error("queue empty")]
    RxEmpty,
    /// Queue full or medium busy.
    #[error("busy")]
    Busy,
    /// Transmission forbidden by duty cycle.
    #[error("transmission disabled")]
    Disabled,
    /// Unrecognised frame or message type.
    #[error("invalid message type")]
    InvalidType,
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_budget() {
        assert_eq!(PHY_BUFFER_SIZE, 130);
        assert_eq!(MAC_MAX_PAYLOAD, 123);
        assert_eq!(LORAMESH_PAYLOAD_SIZE, 115);
    }

    #[test]
    fn test_superframe_constants() {
        assert_eq!(AVAILABLE_SLOT_TIME.as_millis(), 32_000);
        assert_eq!(NOF_AVAILABLE_SLOTS, 320);
    }

    #[test]
    fn test_role_bits() {
        for role in [DeviceRole::Node, DeviceRole::Router, DeviceRole::Coordinator] {
            assert_eq!(DeviceRole::from_bits(role as u8), Some(role));
        }
        assert_eq!(DeviceRole::from_bits(7), None);
    }

    #[test]
    fn test_payload_key_selection() {
        let keys = SessionKeys::new([1; 16], [2; 16]);
        assert_eq!(keys.payload_key(0), &[1; 16]);
        assert_eq!(keys.payload_key(10), &[2; 16]);
    }
}
