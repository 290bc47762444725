//! Device and network configuration
//!
//! This module contains the configuration types consumed by the protocol
//! engine. It includes:
//! - Identifier and key types (DevEUI, DevAddr, AES keys)
//! - Provisioned device credentials and the device registry
//! - Network-wide parameters (NetID, RX settings, CFList)
//!
//! Loading these from disk is left to the embedding application; every type
//! here is `serde`-friendly.

use thiserror::Error;

use crate::crypto::CryptoError;

/// Device identifiers, keys and the device registry
pub mod device;

/// Network-wide parameters
pub mod network;

pub use device::{AesKey, DevAddr, DeviceConfig, DeviceRegistry, Eui64};
pub use network::NetworkConfig;

/// Configuration error
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// A hex-encoded field could not be parsed
    #[error("invalid hex value for {field}: {value:?}")]
    InvalidHex {
        /// Field being parsed
        field: &'static str,
        /// Offending input
        value: String,
    },
    /// Key material of the wrong size
    #[error(transparent)]
    Key(#[from] CryptoError),
    /// RX1 delay outside 1..=15 seconds
    #[error("RX1 delay must be 1..=15 s, got {0}")]
    InvalidRxDelay(u8),
    /// RX2 delay not after RX1
    #[error("RX2 delay must be after RX1 and at most 16 s, got {0}")]
    InvalidRx2Delay(u8),
    /// RX1DROffset or RX2 data rate out of range
    #[error("invalid DL settings: rx1_dr_offset={rx1_dr_offset}, rx2_data_rate={rx2_data_rate}")]
    InvalidDlSettings {
        /// RX1 data rate offset (0..=7)
        rx1_dr_offset: u8,
        /// RX2 data rate (0..=15)
        rx2_data_rate: u8,
    },
    /// CFList frequencies that cannot be encoded
    #[error("invalid CFList: {0}")]
    InvalidCfList(&'static str),
    /// NetID wider than 24 bits
    #[error("NetID {0:#x} does not fit in 24 bits")]
    InvalidNetId(u32),
}
