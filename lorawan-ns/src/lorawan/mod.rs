//! LoRaWAN protocol implementation
//!
//! This module contains the wire-level pieces of the protocol:
//! - Frame codec (MHDR, FHDR, Join-Request, data frames)
//! - Physical wrapper and receive-window timing parameters
//! - Regional parameters
//! - MAC command handling

/// MAC command handling
pub mod commands;

/// Frame codec
pub mod mac;

/// PHY layer framing
pub mod phy;

/// Regional parameters and configurations
pub mod region;

pub use mac::{Frame, FrameError, MType};
pub use phy::{PhyFrame, TimingParams};
pub use region::{DataRate, Eu868, Region};
