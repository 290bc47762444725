//! Semtech packet-forwarder JSON envelope
//!
//! Inbound `PUSH_DATA` bodies carry an `rxpk` array, outbound `PULL_RESP`
//! bodies a single `txpk`. PHYPayloads travel base64-encoded. The UDP framing
//! around these bodies belongs to the transport.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::network::NetworkConfig;
use crate::lorawan::region::{DataRate, InvalidDataRate};

/// Envelope errors; raised before any protocol logic runs
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// JSON body did not parse
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// `data` is not valid base64
    #[error("bad base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    /// `datr` is not a LoRa data rate
    #[error(transparent)]
    DataRate(#[from] InvalidDataRate),
    /// `size` disagrees with the decoded payload
    #[error("rxpk size {declared} but payload has {actual} bytes")]
    SizeMismatch {
        /// Declared size
        declared: u16,
        /// Decoded length
        actual: usize,
    },
}

/// Convert a frequency in MHz to Hz
pub fn mhz_to_hz(mhz: f64) -> u32 {
    (mhz * 1_000_000.0).round() as u32
}

/// Convert a frequency in Hz to MHz
pub fn hz_to_mhz(hz: u32) -> f64 {
    hz as f64 / 1_000_000.0
}

/// One received packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RxPk {
    /// Base64 PHYPayload
    pub data: String,
    /// Gateway counter at reception (µs)
    pub tmst: u32,
    /// Frequency in MHz
    pub freq: f64,
    /// `SFxBWy`
    pub datr: String,
    /// Coding rate
    #[serde(default = "default_codr")]
    pub codr: String,
    /// RSSI in dBm
    #[serde(default)]
    pub rssi: i32,
    /// SNR in dB
    #[serde(default)]
    pub lsnr: f32,
    /// Concentrator IF channel
    #[serde(default)]
    pub chan: u8,
    /// Concentrator RF chain
    #[serde(default)]
    pub rfch: u8,
    /// Payload size the gateway declared
    #[serde(default)]
    pub size: Option<u16>,
}

impl RxPk {
    /// Decode the PHYPayload
    pub fn phy_payload(&self) -> Result<Vec<u8>, EnvelopeError> {
        let payload = STANDARD.decode(self.data.trim())?;
        if let Some(declared) = self.size {
            if declared as usize != payload.len() {
                return Err(EnvelopeError::SizeMismatch {
                    declared,
                    actual: payload.len(),
                });
            }
        }
        Ok(payload)
    }

    /// Parse `datr`
    pub fn data_rate(&self) -> Result<DataRate, EnvelopeError> {
        Ok(self.datr.parse()?)
    }

    /// Frequency in Hz
    pub fn frequency(&self) -> u32 {
        mhz_to_hz(self.freq)
    }
}

/// `PUSH_DATA` JSON body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushData {
    /// Received packets; absent on status-only bodies
    #[serde(default)]
    pub rxpk: Vec<RxPk>,
}

impl PushData {
    /// Parse a JSON body
    pub fn from_json(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn default_codr() -> String {
    "4/5".to_string()
}

/// Packet to transmit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxPk {
    /// Send immediately, ignoring `tmst`
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub imme: bool,
    /// Gateway counter to transmit at (µs)
    pub tmst: u32,
    /// Frequency in MHz
    pub freq: f64,
    /// RF chain to transmit on
    pub rfch: u8,
    /// TX power in dBm
    pub powe: i8,
    /// Modulation, `LORA`
    pub modu: String,
    /// Data rate, `SFxBWy`
    pub datr: String,
    /// Coding rate
    pub codr: String,
    /// Inverted polarity, always set for end-device downlinks
    pub ipol: bool,
    /// PHYPayload size in bytes
    pub size: u16,
    /// Base64 PHYPayload
    pub data: String,
}

impl Default for TxPk {
    fn default() -> Self {
        Self {
            imme: false,
            tmst: 0,
            freq: 0.0,
            rfch: 0,
            powe: 14,
            modu: "LORA".to_string(),
            datr: String::new(),
            codr: default_codr(),
            ipol: true,
            size: 0,
            data: String::new(),
        }
    }
}

impl TxPk {
    /// Downlink at `tmst` on `frequency` Hz using the network's TX defaults
    pub fn new(
        phy_payload: &[u8],
        tmst: u32,
        frequency: u32,
        data_rate: DataRate,
        config: &NetworkConfig,
    ) -> Self {
        Self {
            tmst,
            freq: hz_to_mhz(frequency),
            rfch: config.rf_chain,
            powe: config.tx_power,
            datr: data_rate.to_string(),
            codr: config.coding_rate.clone(),
            size: phy_payload.len() as u16,
            data: STANDARD.encode(phy_payload),
            ..Self::default()
        }
    }

    /// Decode the PHYPayload
    pub fn phy_payload(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(STANDARD.decode(&self.data)?)
    }
}

/// `PULL_RESP` JSON body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResp {
    /// Packet to send
    pub txpk: TxPk,
}

impl PullResp {
    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }
}
