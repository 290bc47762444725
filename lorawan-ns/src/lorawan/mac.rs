//! LoRaWAN frame codec
//!
//! `PHYPayload = MHDR | MACPayload | MIC`. Data frames carry
//! `FHDR | [FPort | FRMPayload]` as MACPayload, Join-Requests a fixed
//! 18-byte body, Join-Accepts an encrypted body that is only opened by the
//! join procedure. Multi-byte fields are little-endian on the wire.

use core::fmt;

use heapless::Vec as FOptsVec;
use thiserror::Error;

use crate::config::device::{AesKey, DevAddr, Eui64};
use crate::crypto::{self, Direction, Mic, MIC_SIZE};

/// Maximum FOpts length
pub const MAX_FOPTS_LEN: usize = 15;

/// MHDR size in bytes
pub const MHDR_SIZE: usize = 1;

/// Join-Request MACPayload length
pub const JOIN_REQUEST_LEN: usize = 18;

/// Minimum FHDR length (no FOpts)
pub const FHDR_MIN_LEN: usize = 7;

/// Frame codec errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer than MHDR + 4 MIC bytes
    #[error("truncated frame: {len} bytes")]
    TruncatedFrame {
        /// Bytes available
        len: usize,
    },
    /// Data MACPayload shorter than an FHDR
    #[error("MACPayload too short for FHDR: {len} bytes")]
    TruncatedMacPayload {
        /// MACPayload length
        len: usize,
    },
    /// FOptsLen points past the end of the MACPayload
    #[error("FOptsLen {f_opts_len} exceeds the {available} bytes after FHDR")]
    FOptsOverrun {
        /// Declared FOpts length
        f_opts_len: u8,
        /// Bytes actually present
        available: usize,
    },
    /// Join-Request body is not 18 bytes
    #[error("join-request payload must be 18 bytes, got {0}")]
    InvalidJoinRequestLength(usize),
    /// More than 15 bytes offered as FOpts
    #[error("FOpts limited to 15 bytes, got {0}")]
    FOptsTooLong(usize),
    /// Physical wrapper CRC mismatch
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch {
        /// Computed CRC
        expected: u16,
        /// CRC carried in the frame
        actual: u16,
    },
}

/// MAC header types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MType {
    /// Join-Request
    JoinRequest = 0x00,
    /// Join-Accept
    JoinAccept = 0x20,
    /// Unconfirmed data uplink
    UnconfirmedDataUp = 0x40,
    /// Unconfirmed data downlink
    UnconfirmedDataDown = 0x60,
    /// Confirmed data uplink
    ConfirmedDataUp = 0x80,
    /// Confirmed data downlink
    ConfirmedDataDown = 0xA0,
    /// Rejoin-Request (LoRaWAN 1.1)
    RejoinRequest = 0xC0,
    /// Proprietary frame
    Proprietary = 0xE0,
}

impl MType {
    /// Decode from the three MSBs of an MHDR byte
    pub fn from_bits(byte: u8) -> Self {
        match byte & 0xE0 {
            0x00 => MType::JoinRequest,
            0x20 => MType::JoinAccept,
            0x40 => MType::UnconfirmedDataUp,
            0x60 => MType::UnconfirmedDataDown,
            0x80 => MType::ConfirmedDataUp,
            0xA0 => MType::ConfirmedDataDown,
            0xC0 => MType::RejoinRequest,
            _ => MType::Proprietary,
        }
    }

    /// Whether frames of this type carry an FHDR
    pub fn is_data(self) -> bool {
        matches!(
            self,
            MType::UnconfirmedDataUp
                | MType::UnconfirmedDataDown
                | MType::ConfirmedDataUp
                | MType::ConfirmedDataDown
        )
    }

    /// Direction of a data frame type
    pub fn direction(self) -> Direction {
        match self {
            MType::JoinAccept | MType::UnconfirmedDataDown | MType::ConfirmedDataDown => {
                Direction::Down
            }
            _ => Direction::Up,
        }
    }
}

/// MAC header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mhdr {
    /// Message type
    pub mtype: MType,
    /// Reserved bits
    pub rfu: u8,
    /// LoRaWAN major version, 0 for R1
    pub major: u8,
}

impl Mhdr {
    /// LoRaWAN R1 header of the given type
    pub fn new(mtype: MType) -> Self {
        Self {
            mtype,
            rfu: 0,
            major: 0,
        }
    }

    /// Encode as a single byte
    pub fn to_byte(&self) -> u8 {
        self.mtype as u8 | ((self.rfu & 0x07) << 2) | (self.major & 0x03)
    }

    /// Decode a single byte
    pub fn from_byte(byte: u8) -> Self {
        Self {
            mtype: MType::from_bits(byte),
            rfu: (byte >> 2) & 0x07,
            major: byte & 0x03,
        }
    }
}

/// Frame header flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FCtrl {
    /// ADR enabled
    pub adr: bool,
    /// ADR acknowledgement requested (uplink only)
    pub adr_ack_req: bool,
    /// Acknowledges the last confirmed frame
    pub ack: bool,
    /// More downlink data pending (downlink only)
    pub f_pending: bool,
    /// Length of FOpts
    pub f_opts_len: u8,
}

impl FCtrl {
    /// Encode as a single byte; FOptsLen is taken from the field
    pub fn to_byte(&self) -> u8 {
        let mut byte = self.f_opts_len & 0x0F;
        if self.adr {
            byte |= 0x80;
        }
        if self.adr_ack_req {
            byte |= 0x40;
        }
        if self.ack {
            byte |= 0x20;
        }
        if self.f_pending {
            byte |= 0x10;
        }
        byte
    }

    /// Decode a single byte
    pub fn from_byte(byte: u8) -> Self {
        Self {
            adr: (byte & 0x80) != 0,
            adr_ack_req: (byte & 0x40) != 0,
            ack: (byte & 0x20) != 0,
            f_pending: (byte & 0x10) != 0,
            f_opts_len: byte & 0x0F,
        }
    }
}

/// Frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fhdr {
    /// Device address
    pub dev_addr: DevAddr,
    /// Frame control
    pub f_ctrl: FCtrl,
    /// 16 low bits of the frame counter
    pub f_cnt: u16,
    /// Piggybacked MAC commands
    pub f_opts: FOptsVec<u8, MAX_FOPTS_LEN>,
}

impl Fhdr {
    /// Header with empty FOpts
    pub fn new(dev_addr: DevAddr, f_ctrl: FCtrl, f_cnt: u16) -> Self {
        Self {
            dev_addr,
            f_ctrl: FCtrl {
                f_opts_len: 0,
                ..f_ctrl
            },
            f_cnt,
            f_opts: FOptsVec::new(),
        }
    }

    /// Replace FOpts, keeping FOptsLen in sync
    pub fn set_f_opts(&mut self, f_opts: &[u8]) -> Result<(), FrameError> {
        self.f_opts =
            FOptsVec::from_slice(f_opts).map_err(|_| FrameError::FOptsTooLong(f_opts.len()))?;
        self.f_ctrl.f_opts_len = f_opts.len() as u8;
        Ok(())
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let f_ctrl = FCtrl {
            f_opts_len: self.f_opts.len() as u8,
            ..self.f_ctrl
        };
        out.extend_from_slice(&self.dev_addr.to_le_bytes());
        out.push(f_ctrl.to_byte());
        out.extend_from_slice(&self.f_cnt.to_le_bytes());
        out.extend_from_slice(&self.f_opts);
    }
}

/// DevNonce as carried in a Join-Request (wire byte order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DevNonce(pub [u8; 2]);

impl fmt::Display for DevNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}", self.0[0], self.0[1])
    }
}

/// Join-Request body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinRequestPayload {
    /// Join server identity
    pub app_eui: Eui64,
    /// Device identity
    pub dev_eui: Eui64,
    /// Device nonce
    pub dev_nonce: DevNonce,
}

impl JoinRequestPayload {
    fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() != JOIN_REQUEST_LEN {
            return Err(FrameError::InvalidJoinRequestLength(bytes.len()));
        }
        let mut app_eui = [0u8; 8];
        let mut dev_eui = [0u8; 8];
        app_eui.copy_from_slice(&bytes[0..8]);
        dev_eui.copy_from_slice(&bytes[8..16]);
        Ok(Self {
            app_eui: Eui64(app_eui),
            dev_eui: Eui64(dev_eui),
            dev_nonce: DevNonce([bytes[16], bytes[17]]),
        })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.app_eui.as_bytes());
        out.extend_from_slice(self.dev_eui.as_bytes());
        out.extend_from_slice(&self.dev_nonce.0);
    }
}

/// Data frame body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPayload {
    /// Frame header
    pub fhdr: Fhdr,
    /// Present iff bytes follow FOpts
    pub f_port: Option<u8>,
    /// Still encrypted when decoded from the wire
    pub frm_payload: Vec<u8>,
}

impl DataPayload {
    fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < FHDR_MIN_LEN {
            return Err(FrameError::TruncatedMacPayload { len: bytes.len() });
        }
        let dev_addr = DevAddr::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let f_ctrl = FCtrl::from_byte(bytes[4]);
        let f_cnt = u16::from_le_bytes([bytes[5], bytes[6]]);

        let rest = &bytes[FHDR_MIN_LEN..];
        let f_opts_len = f_ctrl.f_opts_len as usize;
        if rest.len() < f_opts_len {
            return Err(FrameError::FOptsOverrun {
                f_opts_len: f_ctrl.f_opts_len,
                available: rest.len(),
            });
        }
        let (f_opts, rest) = rest.split_at(f_opts_len);
        let f_opts =
            FOptsVec::from_slice(f_opts).map_err(|_| FrameError::FOptsTooLong(f_opts_len))?;

        let (f_port, frm_payload) = match rest.split_first() {
            Some((port, payload)) => (Some(*port), payload.to_vec()),
            None => (None, Vec::new()),
        };

        Ok(Self {
            fhdr: Fhdr {
                dev_addr,
                f_ctrl,
                f_cnt,
                f_opts,
            },
            f_port,
            frm_payload,
        })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        self.fhdr.encode_into(out);
        if let Some(port) = self.f_port {
            out.push(port);
            out.extend_from_slice(&self.frm_payload);
        }
    }
}

/// MACPayload variants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacPayload {
    /// Join-Request body
    JoinRequest(JoinRequestPayload),
    /// Encrypted Join-Accept body
    JoinAccept(Vec<u8>),
    /// Data frame body
    Data(DataPayload),
    /// RejoinRequest and Proprietary bodies are kept opaque
    Raw(Vec<u8>),
}

/// A decoded PHYPayload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// MAC header
    pub mhdr: Mhdr,
    /// MACPayload
    pub payload: MacPayload,
    /// Message integrity code
    pub mic: Mic,
}

impl Frame {
    /// Decode a PHYPayload
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < 1 + MIC_SIZE {
            return Err(FrameError::TruncatedFrame { len: bytes.len() });
        }
        let mhdr = Mhdr::from_byte(bytes[0]);
        let (body, mic_bytes) = bytes[1..].split_at(bytes.len() - 1 - MIC_SIZE);
        let mut mic = [0u8; MIC_SIZE];
        mic.copy_from_slice(mic_bytes);

        let payload = match mhdr.mtype {
            MType::JoinRequest => MacPayload::JoinRequest(JoinRequestPayload::decode(body)?),
            MType::JoinAccept => MacPayload::JoinAccept(body.to_vec()),
            t if t.is_data() => MacPayload::Data(DataPayload::decode(body)?),
            _ => MacPayload::Raw(body.to_vec()),
        };

        Ok(Self { mhdr, payload, mic })
    }

    /// Serialize MACPayload only
    pub fn mac_payload_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match &self.payload {
            MacPayload::JoinRequest(jr) => jr.encode_into(&mut out),
            MacPayload::Data(data) => data.encode_into(&mut out),
            MacPayload::JoinAccept(bytes) | MacPayload::Raw(bytes) => out.extend_from_slice(bytes),
        }
        out
    }

    /// Serialize `MHDR | MACPayload`, the MIC input
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.mhdr.to_byte()];
        out.extend_from_slice(&self.mac_payload_bytes());
        out
    }

    /// Serialize the whole PHYPayload
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.signed_bytes();
        out.extend_from_slice(&self.mic);
        out
    }

    /// Data payload, if this is a data frame
    pub fn data(&self) -> Option<&DataPayload> {
        match &self.payload {
            MacPayload::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Compute and store the MIC of a data frame under NwkSKey
    ///
    /// `f_cnt` is the full 32-bit counter; the FHDR carries its low 16 bits.
    pub fn sign_data(&mut self, nwk_skey: &AesKey, f_cnt: u32) {
        if let MacPayload::Data(data) = &self.payload {
            self.mic = crypto::compute_mic(
                nwk_skey,
                data.fhdr.dev_addr,
                f_cnt,
                self.mhdr.mtype.direction(),
                self.mhdr.to_byte(),
                &self.mac_payload_bytes(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mhdr_bit_layout() {
        let mhdr = Mhdr::from_byte(0x80);
        assert_eq!(mhdr.mtype, MType::ConfirmedDataUp);
        assert_eq!(mhdr.major, 0);

        let odd = Mhdr::from_byte(0x5D);
        assert_eq!(odd.mtype, MType::UnconfirmedDataUp);
        assert_eq!(odd.rfu, 0x07);
        assert_eq!(odd.major, 0x01);
        assert_eq!(odd.to_byte(), 0x5D);
    }

    #[test]
    fn fctrl_bits() {
        let fctrl = FCtrl::from_byte(0xA3);
        assert!(fctrl.adr);
        assert!(!fctrl.adr_ack_req);
        assert!(fctrl.ack);
        assert!(!fctrl.f_pending);
        assert_eq!(fctrl.f_opts_len, 3);
        assert_eq!(fctrl.to_byte(), 0xA3);
    }

    #[test]
    fn decode_join_request() {
        let bytes = hex::decode("0011223344556677888877665544332211AABBCCDD1122").unwrap();
        let frame = Frame::decode(&bytes).unwrap();
        assert_eq!(frame.mhdr.mtype, MType::JoinRequest);
        assert_eq!(frame.mic, [0xCC, 0xDD, 0x11, 0x22]);
        match frame.payload {
            MacPayload::JoinRequest(jr) => {
                assert_eq!(jr.app_eui.to_string(), "1122334455667788");
                assert_eq!(jr.dev_eui.to_string(), "8877665544332211");
                assert_eq!(jr.dev_nonce.to_string(), "AABB");
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(Frame::decode(&bytes).unwrap().encode(), bytes);
    }

    #[test]
    fn decode_data_with_fopts_and_port() {
        // DevAddr 04030201, FCtrl ADR + FOptsLen 2, FCnt 0x0105, FOpts 02 02, FPort 1
        let bytes = hex::decode("4001020304820501020201AABBDEADBEEF").unwrap();

        let frame = Frame::decode(&bytes).unwrap();
        let data = frame.data().unwrap();
        assert_eq!(data.fhdr.dev_addr, DevAddr(0x0403_0201));
        assert!(data.fhdr.f_ctrl.adr);
        assert_eq!(data.fhdr.f_cnt, 0x0105);
        assert_eq!(&data.fhdr.f_opts[..], &[0x02, 0x02]);
        assert_eq!(data.f_port, Some(1));
        assert_eq!(data.frm_payload, vec![0xAA, 0xBB]);
        assert_eq!(frame.mic, [0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(frame.encode(), bytes);
    }

    #[test]
    fn data_without_port_has_no_payload() {
        let bytes = hex::decode("400102030400070011223344").unwrap();
        let frame = Frame::decode(&bytes).unwrap();
        let data = frame.data().unwrap();
        assert_eq!(data.f_port, None);
        assert!(data.frm_payload.is_empty());
        assert_eq!(data.fhdr.f_cnt, 7);
        assert_eq!(frame.encode(), bytes);
    }

    #[test]
    fn short_frames_are_rejected() {
        assert_eq!(
            Frame::decode(&[0x40, 1, 2, 3]),
            Err(FrameError::TruncatedFrame { len: 4 })
        );
        assert_eq!(
            Frame::decode(&[0x40, 1, 2, 3, 4, 5]),
            Err(FrameError::TruncatedMacPayload { len: 1 })
        );
        // FOptsLen 5 but only 1 byte after FHDR
        let bytes = hex::decode("4001020304050000AA11223344").unwrap();
        assert_eq!(
            Frame::decode(&bytes),
            Err(FrameError::FOptsOverrun {
                f_opts_len: 5,
                available: 1
            })
        );
        let bytes = hex::decode("00112233445566778811223344").unwrap();
        assert_eq!(
            Frame::decode(&bytes),
            Err(FrameError::InvalidJoinRequestLength(8))
        );
    }

    #[test]
    fn set_f_opts_tracks_length() {
        let mut fhdr = Fhdr::new(DevAddr(1), FCtrl::default(), 0);
        fhdr.set_f_opts(&[0x02, 0x0A, 0x01]).unwrap();
        assert_eq!(fhdr.f_ctrl.f_opts_len, 3);
        assert_eq!(fhdr.set_f_opts(&[0u8; 16]), Err(FrameError::FOptsTooLong(16)));
    }

    #[test]
    fn sign_data_produces_verifiable_mic() {
        let key = AesKey::new([7; 16]);
        let mut frame = Frame {
            mhdr: Mhdr::new(MType::UnconfirmedDataDown),
            payload: MacPayload::Data(DataPayload {
                fhdr: Fhdr::new(DevAddr(0x2601_0001), FCtrl::default(), 3),
                f_port: Some(10),
                frm_payload: vec![1, 2, 3],
            }),
            mic: [0; 4],
        };
        frame.sign_data(&key, 3);
        assert!(crypto::verify_mic(
            &key,
            DevAddr(0x2601_0001),
            3,
            Direction::Down,
            frame.mhdr.to_byte(),
            &frame.mac_payload_bytes(),
            &frame.mic,
        ));
    }
}
