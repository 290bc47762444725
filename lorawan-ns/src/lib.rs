//! LoRaWAN network server protocol engine in Rust
//!
//! This crate implements the network side of LoRaWAN 1.0.x: it takes frames
//! forwarded by Semtech-style gateways, verifies and decrypts them, runs the
//! OTAA join handshake, answers MAC commands and builds downlinks timed for
//! the device's RX1 or RX2 window.
//!
//! # Features
//! - Frame codec for join and data frames, plus the optional PHY wrapper
//! - AES-CMAC MICs, FRMPayload and Join-Accept encryption, key derivation
//! - Typed MAC commands for both directions with response planning
//! - DevNonce and FCnt replay protection, atomic per device
//! - RX1/RX2 window selection on the 32-bit gateway counter
//! - No unsafe code
//!
//! The UDP transport, persistence and process setup belong to the embedding
//! application. Sessions are kept behind the [`SessionStore`] trait.
//!
//! # Example
//! ```no_run
//! use lorawan_ns::{
//!     config::{AesKey, DeviceConfig, DeviceRegistry, Eui64, NetworkConfig},
//!     device::MemorySessionStore,
//!     server::NetworkServer,
//! };
//!
//! let registry: DeviceRegistry = [DeviceConfig::new_otaa(
//!     "8877665544332211".parse().unwrap(),
//!     "1122334455667788".parse().unwrap(),
//!     AesKey::new([0x2B; 16]),
//! )]
//! .into_iter()
//! .collect();
//!
//! let store = MemorySessionStore::new();
//! let server = NetworkServer::new(NetworkConfig::default(), registry, store).unwrap();
//!
//! # let push_data = br#"{"rxpk":[]}"#;
//! for outcome in server.handle_push_data(push_data).unwrap() {
//!     if let Ok(Some(downlink)) = outcome.map(|o| o.downlink) {
//!         let _json = downlink.pull_resp().to_json().unwrap();
//!         // hand `_json` to the gateway in a PULL_RESP
//!     }
//! }
//! # let _ = Eui64::new([0; 8]);
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

/// Device and network configuration
pub mod config;

/// Cryptographic functions
pub mod crypto;

/// Device sessions and the session store
pub mod device;

/// Gateway JSON envelope
pub mod gateway;

/// Over-the-air activation
pub mod join;

/// LoRaWAN protocol implementation
pub mod lorawan;

/// Receive-window scheduling
pub mod scheduler;

/// Uplink dispatch and downlink assembly
pub mod server;

pub use device::{MemorySessionStore, SessionStore};
pub use server::{NetworkServer, Outcome, ServerError, UplinkEvent};
