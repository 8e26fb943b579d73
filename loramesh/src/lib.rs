#![forbid(unsafe_code)]
//! loramesh - Time-slotted mesh networking over LoRa radios
//!
//! A LoRaWAN-style frame pipeline (PHY, MAC, FRM) with a mesh layer on top:
//! nodes advertise in a shared slot, elect a coordinator, adopt children and
//! reserve recurring transmission slots in a 36 s superframe.
//!
//! This crate is `no_std` but **requires the `alloc` crate**. Pools and
//! registries are allocated once, when the node is created, with capacities
//! taken from [`MeshConfig`].
//!
//! # Key Properties
//!
//! - Slot reservations never overlap and are allocated all-or-nothing
//! - Data frames are AES-encrypted and carry a 4-byte CMAC MIC
//! - Mesh control frames (beacons, join-mesh) are authenticated with the
//!   network session key
//! - The coordinator election policy is pluggable
//! - The radio ISR only ever enqueues; all state belongs to the node task
//!
//! # Example (integration pattern)
//!
//! ```text
//! use loramesh::{Node, DefaultConfig, MeshSettings, SessionKeys, Duration};
//!
//! // Implement Radio, Cipher (or use AesCmacCipher), Clock and
//! // PositionSource for your platform...
//!
//! let mut node = Node::<_, _, _, _, DefaultConfig>::new(
//!     radio, AesCmacCipher::new(), clock, gps, MeshSettings::new(),
//! )?;
//! node.join_abp(0x2601_0001, 0x13, SessionKeys::new(nwk, app))?;
//! node.register_application(10, |port, data: &[u8]| Ok(()))?;
//! node.register_transmission(10, Duration::from_secs(60))?;
//!
//! spawn(async move {
//!     node.run().await;
//! });
//! ```
//!
//! # Module Structure
//!
//! - [`types`] - Constants, errors, roles and application events
//! - [`scheduler`] - Superframe slot allocation and dispatch
//! - [`phy`], [`mac`], [`frm`] - The frame pipeline
//! - [`wire`] - Control-frame and MAC-command codecs
//! - [`mesh`] - Application API, joins, child and multicast registries
//! - [`advertising`] - Beacons, neighbours and the join-mesh handshake
//! - [`election`] - Coordinator election policies
//! - [`node`] - Node context and run loop
//! - [`shell`] - Read-only diagnostics
//! - [`traits`] - Radio, Cipher, Clock and PositionSource seams

#![no_std]

// Prevent test features from being used in release builds.
#[cfg(all(feature = "test-support", not(test), not(debug_assertions)))]
compile_error!(
    "The `test-support` feature must not be enabled in release builds. \
     It includes a mock radio and clock that do not talk to any hardware."
);

extern crate alloc;

pub mod advertising;
pub mod channel;
pub mod collections;
pub mod config;
pub mod crypto;
pub mod device;
pub mod election;
pub mod frm;
pub mod mac;
pub mod mesh;
pub mod node;
pub mod phy;
pub mod registry;
pub mod scheduler;
pub mod shell;
pub mod time;
pub mod traits;
pub mod types;
pub mod wire;

// Re-export main types at crate root
pub use advertising::{Neighbor, NeighborTable};
pub use config::{DefaultConfig, MeshConfig, MeshSettings, OtaaCredentials, SmallConfig};
pub use crypto::AesCmacCipher;
pub use election::{AlwaysElect, ElectionContext, ElectionPolicy, WeightedElection};
pub use node::Node;
pub use registry::{ChildNode, MulticastGroup};
pub use scheduler::{EventType, HandlerKey};
pub use time::{Duration, Timestamp};
pub use traits::{Cipher, Clock, PortHandler, Position, PositionSource, Radio, RadioEvent};
pub use types::{DevAddr, DeviceClass, DeviceRole, Error, Event, Result, SessionKeys};
