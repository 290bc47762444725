//! Physical-layer framing and receive-window timing
//!
//! Gateways normally hand over a bare PHYPayload. Captures taken below the
//! concentrator still carry the LoRa physical wrapper:
//!
//! ```text
//! Preamble(8) | PHDR(1) | PHDR_CRC(1) | PHYPayload(n) | CRC(2, LE)
//! ```
//!
//! Both CRCs are CRC-16/XMODEM; the header check byte is the low byte of the
//! CRC over PHDR.

use serde::{Deserialize, Serialize};

use super::mac::FrameError;

/// Preamble length of the physical wrapper in bytes
pub const PREAMBLE_LEN: usize = 8;

/// Overhead of the wrapper around a PHYPayload
pub const PHY_OVERHEAD: usize = PREAMBLE_LEN + 2 + 2;

/// Receive window timing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingParams {
    /// RX1 delay in seconds (1..=15)
    pub rx1_delay: u8,
    /// RX2 delay in seconds; `None` means one second after RX1
    pub rx2_delay: Option<u8>,
    /// Join accept delay 1 in seconds
    pub join_accept_delay1: u8,
    /// Join accept delay 2 in seconds
    pub join_accept_delay2: u8,
}

impl Default for TimingParams {
    fn default() -> Self {
        Self {
            rx1_delay: 1,
            rx2_delay: None,
            join_accept_delay1: 5,
            join_accept_delay2: 6,
        }
    }
}

impl TimingParams {
    /// Effective RX2 delay
    pub fn rx2_delay(&self) -> u8 {
        self.rx2_delay
            .unwrap_or_else(|| self.rx1_delay.saturating_add(1))
    }
}

/// Physical frame as captured below the concentrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhyFrame {
    /// Preamble bytes
    pub preamble: [u8; PREAMBLE_LEN],
    /// Physical header
    pub phdr: u8,
    /// Physical header check byte
    pub phdr_crc: u8,
    /// Wrapped PHYPayload
    pub payload: Vec<u8>,
    /// Payload CRC
    pub crc: u16,
}

impl PhyFrame {
    /// Wrap a PHYPayload, computing both check values
    pub fn wrap(phdr: u8, payload: &[u8]) -> Self {
        Self {
            preamble: [0; PREAMBLE_LEN],
            phdr,
            phdr_crc: crc16(&[phdr]) as u8,
            payload: payload.to_vec(),
            crc: crc16(payload),
        }
    }

    /// Split raw bytes into wrapper fields
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < PHY_OVERHEAD {
            return Err(FrameError::TruncatedFrame { len: bytes.len() });
        }
        let (head, rest) = bytes.split_at(PREAMBLE_LEN + 2);
        let (payload, crc) = rest.split_at(rest.len() - 2);

        let mut preamble = [0u8; PREAMBLE_LEN];
        preamble.copy_from_slice(&head[..PREAMBLE_LEN]);

        Ok(Self {
            preamble,
            phdr: head[PREAMBLE_LEN],
            phdr_crc: head[PREAMBLE_LEN + 1],
            payload: payload.to_vec(),
            crc: u16::from_le_bytes([crc[0], crc[1]]),
        })
    }

    /// Serialize the wrapper
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PHY_OVERHEAD + self.payload.len());
        out.extend_from_slice(&self.preamble);
        out.push(self.phdr);
        out.push(self.phdr_crc);
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.crc.to_le_bytes());
        out
    }

    /// Check header and payload CRCs
    pub fn verify_crc(&self) -> Result<(), FrameError> {
        let header = crc16(&[self.phdr]) as u8;
        if header != self.phdr_crc {
            return Err(FrameError::CrcMismatch {
                expected: header as u16,
                actual: self.phdr_crc as u16,
            });
        }
        let payload = crc16(&self.payload);
        if payload != self.crc {
            return Err(FrameError::CrcMismatch {
                expected: payload,
                actual: self.crc,
            });
        }
        Ok(())
    }
}

/// CRC-16/XMODEM (poly 0x1021, init 0, no reflection)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}
