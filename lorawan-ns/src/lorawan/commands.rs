//! MAC command extraction, decoding and response planning
//!
//! Commands are `CID | payload` records with a fixed payload length per
//! `(CID, direction)`. Extraction walks the stream sequentially using a static
//! table; decoding turns each record into a typed command; planning maps the
//! decoded uplink commands onto the downlink answers and retries they call for.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::crypto::Direction;
use crate::device::DeviceSettings;

/// Largest MAC command block that fits in FOpts
pub const MAX_FOPTS_COMMANDS_LEN: usize = 15;

/// Seconds between the Unix epoch and the GPS epoch (1980-01-06)
const GPS_EPOCH_OFFSET: u64 = 315_964_800;

/// Leap seconds GPS time is ahead of UTC
const GPS_LEAP_SECONDS: u64 = 18;

/// Command decoding error; local to the offending command
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum MacCommandError {
    /// Payload length differs from the fixed length of the CID
    #[error("malformed payload for CID {cid:#04x}: expected {expected} bytes, got {actual}")]
    MalformedPayload {
        /// Command identifier
        cid: u8,
        /// Fixed payload length of the CID
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },
}

struct CidEntry {
    cid: u8,
    name: &'static str,
    payload_len: usize,
}

const fn entry(cid: u8, name: &'static str, payload_len: usize) -> CidEntry {
    CidEntry {
        cid,
        name,
        payload_len,
    }
}

/// Commands sent by end-devices
const UPLINK_TABLE: [CidEntry; 14] = [
    entry(0x01, "ResetInd", 1),
    entry(0x02, "LinkCheckReq", 0),
    entry(0x03, "LinkADRAns", 1),
    entry(0x04, "DutyCycleAns", 0),
    entry(0x05, "RXParamSetupAns", 1),
    entry(0x06, "DevStatusAns", 2),
    entry(0x07, "NewChannelAns", 1),
    entry(0x08, "RXTimingSetupAns", 0),
    entry(0x09, "TxParamSetupAns", 0),
    entry(0x0A, "DlChannelAns", 1),
    entry(0x0B, "RekeyInd", 1),
    entry(0x0C, "ADRParamSetupAns", 0),
    entry(0x0D, "DeviceTimeReq", 0),
    entry(0x0F, "RejoinParamSetupAns", 1),
];

/// Commands sent by the network server
const DOWNLINK_TABLE: [CidEntry; 15] = [
    entry(0x01, "ResetConf", 1),
    entry(0x02, "LinkCheckAns", 2),
    entry(0x03, "LinkADRReq", 4),
    entry(0x04, "DutyCycleReq", 1),
    entry(0x05, "RXParamSetupReq", 4),
    entry(0x06, "DevStatusReq", 0),
    entry(0x07, "NewChannelReq", 5),
    entry(0x08, "RXTimingSetupReq", 1),
    entry(0x09, "TxParamSetupReq", 1),
    entry(0x0A, "DlChannelReq", 4),
    entry(0x0B, "RekeyConf", 1),
    entry(0x0C, "ADRParamSetupReq", 1),
    entry(0x0D, "DeviceTimeAns", 5),
    entry(0x0E, "ForceRejoinReq", 2),
    entry(0x0F, "RejoinParamSetupReq", 1),
];

fn lookup(cid: u8, dir: Direction) -> Option<&'static CidEntry> {
    let table: &'static [CidEntry] = match dir {
        Direction::Up => &UPLINK_TABLE,
        Direction::Down => &DOWNLINK_TABLE,
    };
    table.iter().find(|s| s.cid == cid)
}

/// Name and payload length of a known `(CID, direction)`
pub fn command_info(cid: u8, dir: Direction) -> Option<(&'static str, usize)> {
    lookup(cid, dir).map(|s| (s.name, s.payload_len))
}

fn unknown_name(cid: u8) -> String {
    format!("UnknownCID_{cid:02X}")
}

/// One command as cut out of a FOpts / FRMPayload stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCommand {
    /// Command identifier
    pub cid: u8,
    /// Link direction of the stream
    pub direction: Direction,
    /// Shorter than the fixed length only when the stream ended early
    pub payload: Vec<u8>,
}

impl RawCommand {
    /// Table name, or `UnknownCID_XX`
    pub fn name(&self) -> Cow<'static, str> {
        match lookup(self.cid, self.direction) {
            Some(entry) => Cow::Borrowed(entry.name),
            None => Cow::Owned(unknown_name(self.cid)),
        }
    }

    /// Whether the CID is in the table for this direction
    pub fn is_known(&self) -> bool {
        lookup(self.cid, self.direction).is_some()
    }
}

/// Split a command stream into records
///
/// Unknown CIDs are assumed to carry no payload, so the walk only stays
/// aligned if that assumption holds.
pub fn extract(bytes: &[u8], direction: Direction) -> Vec<RawCommand> {
    let mut commands = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let cid = bytes[pos];
        pos += 1;
        let len = lookup(cid, direction).map_or(0, |s| s.payload_len);
        let end = (pos + len).min(bytes.len());
        commands.push(RawCommand {
            cid,
            direction,
            payload: bytes[pos..end].to_vec(),
        });
        pos = end;
    }

    commands
}

fn check_len(cid: u8, dir: Direction, payload: &[u8]) -> Result<(), MacCommandError> {
    let expected = lookup(cid, dir).map_or(0, |s| s.payload_len);
    if payload.len() != expected {
        return Err(MacCommandError::MalformedPayload {
            cid,
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn frequency_from_bytes(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], 0]) * 100
}

fn frequency_to_bytes(hz: u32) -> [u8; 3] {
    let b = (hz / 100).to_le_bytes();
    [b[0], b[1], b[2]]
}

/// Uplink MAC command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkCommand {
    /// Reset indication (ABP devices)
    ResetInd {
        /// LoRaWAN minor version
        minor: u8,
    },
    /// Link check request
    LinkCheckReq,
    /// Link ADR answer
    LinkADRAns {
        /// Channel mask ACK
        ch_mask_ack: bool,
        /// Data rate ACK
        data_rate_ack: bool,
        /// TX power ACK
        tx_power_ack: bool,
    },
    /// Duty cycle answer
    DutyCycleAns,
    /// RX parameter setup answer
    RXParamSetupAns {
        /// RX2 channel ACK
        channel_ack: bool,
        /// RX2 data rate ACK
        rx2_data_rate_ack: bool,
        /// RX1 data rate offset ACK
        rx1_dr_offset_ack: bool,
    },
    /// Device status answer
    DevStatusAns {
        /// Battery level (0 = external power, 1-254 = level, 255 = unknown)
        battery: u8,
        /// Demodulation margin in dB (-32..=31)
        margin: i8,
    },
    /// New channel answer
    NewChannelAns {
        /// Channel frequency OK
        channel_freq_ok: bool,
        /// Data rate range OK
        data_rate_range_ok: bool,
    },
    /// RX timing setup answer
    RXTimingSetupAns,
    /// TX parameter setup answer
    TxParamSetupAns,
    /// Downlink channel answer
    DlChannelAns {
        /// Channel frequency OK
        channel_freq_ok: bool,
        /// Uplink frequency exists
        uplink_freq_exists: bool,
    },
    /// Rekey indication
    RekeyInd {
        /// LoRaWAN minor version
        minor: u8,
    },
    /// ADR parameter setup answer
    ADRParamSetupAns,
    /// Device time request
    DeviceTimeReq,
    /// Rejoin parameter setup answer
    RejoinParamSetupAns {
        /// Max time accepted
        time_ok: bool,
    },
    /// CID not in the uplink table
    Unknown {
        /// Command identifier
        cid: u8,
    },
}

impl UplinkCommand {
    /// Decode a command payload
    pub fn decode(cid: u8, payload: &[u8]) -> Result<Self, MacCommandError> {
        if lookup(cid, Direction::Up).is_none() {
            return Ok(UplinkCommand::Unknown { cid });
        }
        check_len(cid, Direction::Up, payload)?;
        let b0 = payload.first().copied().unwrap_or(0);

        Ok(match cid {
            0x01 => UplinkCommand::ResetInd { minor: b0 & 0x0F },
            0x02 => UplinkCommand::LinkCheckReq,
            0x03 => UplinkCommand::LinkADRAns {
                ch_mask_ack: b0 & 0x01 != 0,
                data_rate_ack: b0 & 0x02 != 0,
                tx_power_ack: b0 & 0x04 != 0,
            },
            0x04 => UplinkCommand::DutyCycleAns,
            0x05 => UplinkCommand::RXParamSetupAns {
                channel_ack: b0 & 0x01 != 0,
                rx2_data_rate_ack: b0 & 0x02 != 0,
                rx1_dr_offset_ack: b0 & 0x04 != 0,
            },
            0x06 => UplinkCommand::DevStatusAns {
                battery: b0,
                // 6-bit two's complement
                margin: ((payload[1] << 2) as i8) >> 2,
            },
            0x07 => UplinkCommand::NewChannelAns {
                channel_freq_ok: b0 & 0x01 != 0,
                data_rate_range_ok: b0 & 0x02 != 0,
            },
            0x08 => UplinkCommand::RXTimingSetupAns,
            0x09 => UplinkCommand::TxParamSetupAns,
            0x0A => UplinkCommand::DlChannelAns {
                channel_freq_ok: b0 & 0x01 != 0,
                uplink_freq_exists: b0 & 0x02 != 0,
            },
            0x0B => UplinkCommand::RekeyInd { minor: b0 & 0x0F },
            0x0C => UplinkCommand::ADRParamSetupAns,
            0x0D => UplinkCommand::DeviceTimeReq,
            0x0F => UplinkCommand::RejoinParamSetupAns {
                time_ok: b0 & 0x01 != 0,
            },
            _ => UplinkCommand::Unknown { cid },
        })
    }

    /// Command identifier
    pub fn cid(&self) -> u8 {
        match self {
            UplinkCommand::ResetInd { .. } => 0x01,
            UplinkCommand::LinkCheckReq => 0x02,
            UplinkCommand::LinkADRAns { .. } => 0x03,
            UplinkCommand::DutyCycleAns => 0x04,
            UplinkCommand::RXParamSetupAns { .. } => 0x05,
            UplinkCommand::DevStatusAns { .. } => 0x06,
            UplinkCommand::NewChannelAns { .. } => 0x07,
            UplinkCommand::RXTimingSetupAns => 0x08,
            UplinkCommand::TxParamSetupAns => 0x09,
            UplinkCommand::DlChannelAns { .. } => 0x0A,
            UplinkCommand::RekeyInd { .. } => 0x0B,
            UplinkCommand::ADRParamSetupAns => 0x0C,
            UplinkCommand::DeviceTimeReq => 0x0D,
            UplinkCommand::RejoinParamSetupAns { .. } => 0x0F,
            UplinkCommand::Unknown { cid } => *cid,
        }
    }

    /// Table name, or `UnknownCID_XX`
    pub fn name(&self) -> Cow<'static, str> {
        match lookup(self.cid(), Direction::Up) {
            Some(entry) if !matches!(self, UplinkCommand::Unknown { .. }) => {
                Cow::Borrowed(entry.name)
            }
            _ => Cow::Owned(unknown_name(self.cid())),
        }
    }

    /// Append `CID | payload`
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.cid());
        match *self {
            UplinkCommand::ResetInd { minor } | UplinkCommand::RekeyInd { minor } => {
                out.push(minor & 0x0F)
            }
            UplinkCommand::LinkADRAns {
                ch_mask_ack,
                data_rate_ack,
                tx_power_ack,
            } => out.push(
                ch_mask_ack as u8 | (data_rate_ack as u8) << 1 | (tx_power_ack as u8) << 2,
            ),
            UplinkCommand::RXParamSetupAns {
                channel_ack,
                rx2_data_rate_ack,
                rx1_dr_offset_ack,
            } => out.push(
                channel_ack as u8 | (rx2_data_rate_ack as u8) << 1 | (rx1_dr_offset_ack as u8) << 2,
            ),
            UplinkCommand::DevStatusAns { battery, margin } => {
                out.push(battery);
                out.push(margin as u8 & 0x3F);
            }
            UplinkCommand::NewChannelAns {
                channel_freq_ok,
                data_rate_range_ok,
            } => out.push(channel_freq_ok as u8 | (data_rate_range_ok as u8) << 1),
            UplinkCommand::DlChannelAns {
                channel_freq_ok,
                uplink_freq_exists,
            } => out.push(channel_freq_ok as u8 | (uplink_freq_exists as u8) << 1),
            UplinkCommand::RejoinParamSetupAns { time_ok } => out.push(time_ok as u8),
            UplinkCommand::LinkCheckReq
            | UplinkCommand::DutyCycleAns
            | UplinkCommand::RXTimingSetupAns
            | UplinkCommand::TxParamSetupAns
            | UplinkCommand::ADRParamSetupAns
            | UplinkCommand::DeviceTimeReq
            | UplinkCommand::Unknown { .. } => {}
        }
    }
}

/// Downlink MAC command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownlinkCommand {
    /// Reset confirmation
    ResetConf {
        /// LoRaWAN minor version
        minor: u8,
    },
    /// Link check answer
    LinkCheckAns {
        /// Link margin in dB
        margin: u8,
        /// Number of gateways that received the request
        gateway_count: u8,
    },
    /// Link ADR request
    LinkADRReq {
        /// Data rate index
        data_rate: u8,
        /// TX power index
        tx_power: u8,
        /// Channel mask
        ch_mask: u16,
        /// Channel mask control
        ch_mask_cntl: u8,
        /// Number of transmissions
        nb_trans: u8,
    },
    /// Duty cycle request
    DutyCycleReq {
        /// Aggregated duty cycle is 1 / 2^max_duty_cycle
        max_duty_cycle: u8,
    },
    /// RX parameter setup request
    RXParamSetupReq {
        /// RX1 data rate offset
        rx1_dr_offset: u8,
        /// RX2 data rate index
        rx2_data_rate: u8,
        /// RX2 frequency in Hz
        frequency: u32,
    },
    /// Device status request
    DevStatusReq,
    /// New channel request
    NewChannelReq {
        /// Channel index
        ch_index: u8,
        /// Frequency in Hz
        frequency: u32,
        /// Maximum data rate
        max_dr: u8,
        /// Minimum data rate
        min_dr: u8,
    },
    /// RX timing setup request
    RXTimingSetupReq {
        /// RX1 delay in seconds (0 means 1)
        delay: u8,
    },
    /// TX parameter setup request
    TxParamSetupReq {
        /// Downlink dwell time
        downlink_dwell_time: bool,
        /// Uplink dwell time
        uplink_dwell_time: bool,
        /// Maximum EIRP index
        max_eirp: u8,
    },
    /// Downlink channel request
    DlChannelReq {
        /// Channel index
        ch_index: u8,
        /// Downlink frequency in Hz
        frequency: u32,
    },
    /// Rekey confirmation
    RekeyConf {
        /// LoRaWAN minor version
        minor: u8,
    },
    /// ADR parameter setup request
    ADRParamSetupReq {
        /// ADR_ACK_LIMIT exponent
        limit_exp: u8,
        /// ADR_ACK_DELAY exponent
        delay_exp: u8,
    },
    /// Device time answer
    DeviceTimeAns {
        /// Seconds since the GPS epoch
        gps_seconds: u32,
        /// Fractional second in 1/256 s
        fraction: u8,
    },
    /// Force rejoin request
    ForceRejoinReq {
        /// Retransmission period exponent
        period: u8,
        /// Maximum retries
        max_retries: u8,
        /// Rejoin type
        rejoin_type: u8,
        /// Data rate index
        data_rate: u8,
    },
    /// Rejoin parameter setup request
    RejoinParamSetupReq {
        /// Max time exponent
        max_time_n: u8,
        /// Max count exponent
        max_count_n: u8,
    },
    /// CID not in the downlink table
    Unknown {
        /// Command identifier
        cid: u8,
    },
}

impl DownlinkCommand {
    /// Decode a command payload
    pub fn decode(cid: u8, payload: &[u8]) -> Result<Self, MacCommandError> {
        if lookup(cid, Direction::Down).is_none() {
            return Ok(DownlinkCommand::Unknown { cid });
        }
        check_len(cid, Direction::Down, payload)?;
        let p = payload;

        Ok(match cid {
            0x01 => DownlinkCommand::ResetConf { minor: p[0] & 0x0F },
            0x02 => DownlinkCommand::LinkCheckAns {
                margin: p[0],
                gateway_count: p[1],
            },
            0x03 => DownlinkCommand::LinkADRReq {
                data_rate: p[0] >> 4,
                tx_power: p[0] & 0x0F,
                ch_mask: u16::from_le_bytes([p[1], p[2]]),
                ch_mask_cntl: (p[3] >> 4) & 0x07,
                nb_trans: p[3] & 0x0F,
            },
            0x04 => DownlinkCommand::DutyCycleReq {
                max_duty_cycle: p[0] & 0x0F,
            },
            0x05 => DownlinkCommand::RXParamSetupReq {
                rx1_dr_offset: (p[0] >> 4) & 0x07,
                rx2_data_rate: p[0] & 0x0F,
                frequency: frequency_from_bytes(&p[1..4]),
            },
            0x06 => DownlinkCommand::DevStatusReq,
            0x07 => DownlinkCommand::NewChannelReq {
                ch_index: p[0],
                frequency: frequency_from_bytes(&p[1..4]),
                max_dr: p[4] >> 4,
                min_dr: p[4] & 0x0F,
            },
            0x08 => DownlinkCommand::RXTimingSetupReq { delay: p[0] & 0x0F },
            0x09 => DownlinkCommand::TxParamSetupReq {
                downlink_dwell_time: p[0] & 0x20 != 0,
                uplink_dwell_time: p[0] & 0x10 != 0,
                max_eirp: p[0] & 0x0F,
            },
            0x0A => DownlinkCommand::DlChannelReq {
                ch_index: p[0],
                frequency: frequency_from_bytes(&p[1..4]),
            },
            0x0B => DownlinkCommand::RekeyConf { minor: p[0] & 0x0F },
            0x0C => DownlinkCommand::ADRParamSetupReq {
                limit_exp: p[0] >> 4,
                delay_exp: p[0] & 0x0F,
            },
            0x0D => DownlinkCommand::DeviceTimeAns {
                gps_seconds: u32::from_le_bytes([p[0], p[1], p[2], p[3]]),
                fraction: p[4],
            },
            0x0E => {
                let v = u16::from_le_bytes([p[0], p[1]]);
                DownlinkCommand::ForceRejoinReq {
                    period: ((v >> 11) & 0x07) as u8,
                    max_retries: ((v >> 8) & 0x07) as u8,
                    rejoin_type: ((v >> 4) & 0x07) as u8,
                    data_rate: (v & 0x0F) as u8,
                }
            }
            0x0F => DownlinkCommand::RejoinParamSetupReq {
                max_time_n: p[0] >> 4,
                max_count_n: p[0] & 0x0F,
            },
            _ => DownlinkCommand::Unknown { cid },
        })
    }

    /// Command identifier
    pub fn cid(&self) -> u8 {
        match self {
            DownlinkCommand::ResetConf { .. } => 0x01,
            DownlinkCommand::LinkCheckAns { .. } => 0x02,
            DownlinkCommand::LinkADRReq { .. } => 0x03,
            DownlinkCommand::DutyCycleReq { .. } => 0x04,
            DownlinkCommand::RXParamSetupReq { .. } => 0x05,
            DownlinkCommand::DevStatusReq => 0x06,
            DownlinkCommand::NewChannelReq { .. } => 0x07,
            DownlinkCommand::RXTimingSetupReq { .. } => 0x08,
            DownlinkCommand::TxParamSetupReq { .. } => 0x09,
            DownlinkCommand::DlChannelReq { .. } => 0x0A,
            DownlinkCommand::RekeyConf { .. } => 0x0B,
            DownlinkCommand::ADRParamSetupReq { .. } => 0x0C,
            DownlinkCommand::DeviceTimeAns { .. } => 0x0D,
            DownlinkCommand::ForceRejoinReq { .. } => 0x0E,
            DownlinkCommand::RejoinParamSetupReq { .. } => 0x0F,
            DownlinkCommand::Unknown { cid } => *cid,
        }
    }

    /// Table name, or `UnknownCID_XX`
    pub fn name(&self) -> Cow<'static, str> {
        match lookup(self.cid(), Direction::Down) {
            Some(entry) if !matches!(self, DownlinkCommand::Unknown { .. }) => {
                Cow::Borrowed(entry.name)
            }
            _ => Cow::Owned(unknown_name(self.cid())),
        }
    }

    /// Whether the device answers this command with an uplink `*Ans`
    pub fn expects_answer(&self) -> bool {
        !matches!(
            self,
            DownlinkCommand::ResetConf { .. }
                | DownlinkCommand::LinkCheckAns { .. }
                | DownlinkCommand::RekeyConf { .. }
                | DownlinkCommand::DeviceTimeAns { .. }
                | DownlinkCommand::ForceRejoinReq { .. }
                | DownlinkCommand::Unknown { .. }
        )
    }

    /// Serialized size including the CID
    pub fn encoded_len(&self) -> usize {
        match self {
            DownlinkCommand::Unknown { .. } => 1,
            _ => 1 + lookup(self.cid(), Direction::Down).map_or(0, |s| s.payload_len),
        }
    }

    /// Append `CID | payload`
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.cid());
        match *self {
            DownlinkCommand::ResetConf { minor } | DownlinkCommand::RekeyConf { minor } => {
                out.push(minor & 0x0F)
            }
            DownlinkCommand::LinkCheckAns {
                margin,
                gateway_count,
            } => out.extend_from_slice(&[margin, gateway_count]),
            DownlinkCommand::LinkADRReq {
                data_rate,
                tx_power,
                ch_mask,
                ch_mask_cntl,
                nb_trans,
            } => {
                out.push((data_rate & 0x0F) << 4 | (tx_power & 0x0F));
                out.extend_from_slice(&ch_mask.to_le_bytes());
                out.push((ch_mask_cntl & 0x07) << 4 | (nb_trans & 0x0F));
            }
            DownlinkCommand::DutyCycleReq { max_duty_cycle } => out.push(max_duty_cycle & 0x0F),
            DownlinkCommand::RXParamSetupReq {
                rx1_dr_offset,
                rx2_data_rate,
                frequency,
            } => {
                out.push((rx1_dr_offset & 0x07) << 4 | (rx2_data_rate & 0x0F));
                out.extend_from_slice(&frequency_to_bytes(frequency));
            }
            DownlinkCommand::NewChannelReq {
                ch_index,
                frequency,
                max_dr,
                min_dr,
            } => {
                out.push(ch_index);
                out.extend_from_slice(&frequency_to_bytes(frequency));
                out.push((max_dr & 0x0F) << 4 | (min_dr & 0x0F));
            }
            DownlinkCommand::RXTimingSetupReq { delay } => out.push(delay & 0x0F),
            DownlinkCommand::TxParamSetupReq {
                downlink_dwell_time,
                uplink_dwell_time,
                max_eirp,
            } => out.push(
                (downlink_dwell_time as u8) << 5
                    | (uplink_dwell_time as u8) << 4
                    | (max_eirp & 0x0F),
            ),
            DownlinkCommand::DlChannelReq {
                ch_index,
                frequency,
            } => {
                out.push(ch_index);
                out.extend_from_slice(&frequency_to_bytes(frequency));
            }
            DownlinkCommand::ADRParamSetupReq {
                limit_exp,
                delay_exp,
            } => out.push((limit_exp & 0x0F) << 4 | (delay_exp & 0x0F)),
            DownlinkCommand::DeviceTimeAns {
                gps_seconds,
                fraction,
            } => {
                out.extend_from_slice(&gps_seconds.to_le_bytes());
                out.push(fraction);
            }
            DownlinkCommand::ForceRejoinReq {
                period,
                max_retries,
                rejoin_type,
                data_rate,
            } => {
                let v = (period as u16 & 0x07) << 11
                    | (max_retries as u16 & 0x07) << 8
                    | (rejoin_type as u16 & 0x07) << 4
                    | (data_rate as u16 & 0x0F);
                out.extend_from_slice(&v.to_le_bytes());
            }
            DownlinkCommand::RejoinParamSetupReq {
                max_time_n,
                max_count_n,
            } => out.push((max_time_n & 0x0F) << 4 | (max_count_n & 0x0F)),
            DownlinkCommand::DevStatusReq | DownlinkCommand::Unknown { .. } => {}
        }
    }
}

/// Serialize a command batch
pub fn encode_downlink(commands: &[DownlinkCommand]) -> Vec<u8> {
    let mut out = Vec::with_capacity(commands.iter().map(|c| c.encoded_len()).sum());
    for command in commands {
        command.encode_into(&mut out);
    }
    out
}

/// Extract and decode an uplink command stream
pub fn decode_uplink(bytes: &[u8]) -> Vec<Result<UplinkCommand, MacCommandError>> {
    extract(bytes, Direction::Up)
        .iter()
        .map(|raw| UplinkCommand::decode(raw.cid, &raw.payload))
        .collect()
}

/// Extract and decode a downlink command stream
pub fn decode_downlink(bytes: &[u8]) -> Vec<Result<DownlinkCommand, MacCommandError>> {
    extract(bytes, Direction::Down)
        .iter()
        .map(|raw| DownlinkCommand::decode(raw.cid, &raw.payload))
        .collect()
}

/// GPS time as carried by DeviceTimeAns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpsTime {
    /// Seconds since 1980-01-06
    pub seconds: u32,
    /// Fractional second in 1/256 s
    pub fraction: u8,
}

impl GpsTime {
    /// Convert a duration since the Unix epoch
    pub fn from_unix(since_epoch: Duration) -> Self {
        let seconds = since_epoch
            .as_secs()
            .saturating_sub(GPS_EPOCH_OFFSET)
            .saturating_add(GPS_LEAP_SECONDS);
        Self {
            seconds: seconds as u32,
            fraction: ((since_epoch.subsec_nanos() as u64 * 256) / 1_000_000_000) as u8,
        }
    }

    /// Current GPS time from the system clock
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::from_unix(since_epoch)
    }
}

/// Sub-field a device refused in an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejected {
    /// LinkADRReq channel mask
    ChannelMask,
    /// Data rate
    DataRate,
    /// TX power
    TxPower,
    /// RX2 frequency
    Rx2Channel,
    /// RX2 data rate
    Rx2DataRate,
    /// RX1 data rate offset
    Rx1DrOffset,
    /// Channel frequency
    Frequency,
    /// Channel data rate range
    DataRateRange,
    /// Uplink frequency of a DlChannelReq channel
    UplinkFrequency,
}

/// One command the next downlink should carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCommand {
    /// Position of the triggering uplink command in its batch
    pub source_index: usize,
    /// Command to send
    pub command: DownlinkCommand,
    /// Refused sub-fields when this is a retry
    pub retry: Vec<Rejected>,
}

/// Response commands keyed by name, each list in arrival order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownlinkPlan {
    jobs: BTreeMap<Cow<'static, str>, Vec<PlannedCommand>>,
}

impl DownlinkPlan {
    /// Queue a job under the command's name
    pub fn push(&mut self, job: PlannedCommand) {
        self.jobs.entry(job.command.name()).or_default().push(job);
    }

    /// Jobs queued for one command name
    pub fn get(&self, name: &str) -> &[PlannedCommand] {
        self.jobs.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of queued jobs
    pub fn len(&self) -> usize {
        self.jobs.values().map(Vec::len).sum()
    }

    /// Whether no job is queued
    pub fn is_empty(&self) -> bool {
        self.jobs.values().all(Vec::is_empty)
    }

    /// All commands in order of the uplink commands that caused them
    pub fn commands(&self) -> Vec<DownlinkCommand> {
        let mut jobs: Vec<&PlannedCommand> = self.jobs.values().flatten().collect();
        jobs.sort_by_key(|job| job.source_index);
        jobs.into_iter().map(|job| job.command).collect()
    }
}

/// Inputs the planner needs besides the decoded commands
#[derive(Debug, Clone, Copy)]
pub struct PlanContext<'a> {
    /// Time stamped into DeviceTimeAns
    pub gps_time: GpsTime,
    /// LinkCheckAns margin of the uplink
    pub link_margin: u8,
    /// Gateways that heard the uplink
    pub gateway_count: u8,
    /// Requests sent earlier and still awaiting an answer
    pub pending: &'a [DownlinkCommand],
    /// Current session radio settings, used when no request is pending
    pub settings: &'a DeviceSettings,
}

fn rejected(flags: &[(bool, Rejected)]) -> Vec<Rejected> {
    flags
        .iter()
        .filter(|(ok, _)| !ok)
        .map(|(_, field)| *field)
        .collect()
}

/// Build the response plan for a decoded uplink command batch
///
/// Malformed commands are skipped; their siblings are still planned. The nth
/// answer of a CID is matched with the nth pending request of that CID.
pub fn plan_downlink(
    commands: &[Result<UplinkCommand, MacCommandError>],
    ctx: &PlanContext<'_>,
) -> DownlinkPlan {
    let mut plan = DownlinkPlan::default();
    let mut answers_seen: BTreeMap<u8, usize> = BTreeMap::new();

    let mut pending_for = |cid: u8| -> Option<DownlinkCommand> {
        let nth = answers_seen.entry(cid).or_insert(0);
        let found = ctx.pending.iter().filter(|c| c.cid() == cid).nth(*nth).copied();
        *nth += 1;
        found
    };

    for (index, command) in commands.iter().enumerate() {
        let Ok(command) = command else {
            continue;
        };

        let (response, retry) = match *command {
            UplinkCommand::LinkCheckReq => (
                Some(DownlinkCommand::LinkCheckAns {
                    margin: ctx.link_margin,
                    gateway_count: ctx.gateway_count,
                }),
                Vec::new(),
            ),
            UplinkCommand::DeviceTimeReq => (
                Some(DownlinkCommand::DeviceTimeAns {
                    gps_seconds: ctx.gps_time.seconds,
                    fraction: ctx.gps_time.fraction,
                }),
                Vec::new(),
            ),
            UplinkCommand::ResetInd { minor } => (
                Some(DownlinkCommand::ResetConf { minor: minor.min(1) }),
                Vec::new(),
            ),
            UplinkCommand::RekeyInd { minor } => (
                Some(DownlinkCommand::RekeyConf { minor: minor.min(1) }),
                Vec::new(),
            ),
            UplinkCommand::LinkADRAns {
                ch_mask_ack,
                data_rate_ack,
                tx_power_ack,
            } => {
                let pending = pending_for(0x03);
                let retry = rejected(&[
                    (ch_mask_ack, Rejected::ChannelMask),
                    (data_rate_ack, Rejected::DataRate),
                    (tx_power_ack, Rejected::TxPower),
                ]);
                let request = pending.unwrap_or(DownlinkCommand::LinkADRReq {
                    data_rate: ctx.settings.data_rate,
                    tx_power: ctx.settings.tx_power,
                    ch_mask: ctx.settings.ch_mask,
                    ch_mask_cntl: 0,
                    nb_trans: ctx.settings.nb_trans,
                });
                ((!retry.is_empty()).then_some(request), retry)
            }
            UplinkCommand::RXParamSetupAns {
                channel_ack,
                rx2_data_rate_ack,
                rx1_dr_offset_ack,
            } => {
                let pending = pending_for(0x05);
                let retry = rejected(&[
                    (channel_ack, Rejected::Rx2Channel),
                    (rx2_data_rate_ack, Rejected::Rx2DataRate),
                    (rx1_dr_offset_ack, Rejected::Rx1DrOffset),
                ]);
                let request = pending.unwrap_or(DownlinkCommand::RXParamSetupReq {
                    rx1_dr_offset: ctx.settings.rx1_dr_offset,
                    rx2_data_rate: ctx.settings.rx2_data_rate,
                    frequency: ctx.settings.rx2_frequency,
                });
                ((!retry.is_empty()).then_some(request), retry)
            }
            UplinkCommand::NewChannelAns {
                channel_freq_ok,
                data_rate_range_ok,
            } => {
                let pending = pending_for(0x07);
                let retry = rejected(&[
                    (channel_freq_ok, Rejected::Frequency),
                    (data_rate_range_ok, Rejected::DataRateRange),
                ]);
                (pending.filter(|_| !retry.is_empty()), retry)
            }
            UplinkCommand::DlChannelAns {
                channel_freq_ok,
                uplink_freq_exists,
            } => {
                let pending = pending_for(0x0A);
                let retry = rejected(&[
                    (channel_freq_ok, Rejected::Frequency),
                    (uplink_freq_exists, Rejected::UplinkFrequency),
                ]);
                (pending.filter(|_| !retry.is_empty()), retry)
            }
            UplinkCommand::DutyCycleAns
            | UplinkCommand::RXTimingSetupAns
            | UplinkCommand::TxParamSetupAns
            | UplinkCommand::DevStatusAns { .. }
            | UplinkCommand::ADRParamSetupAns
            | UplinkCommand::RejoinParamSetupAns { .. }
            | UplinkCommand::Unknown { .. } => (None, Vec::new()),
        };

        if let Some(command) = response {
            plan.push(PlannedCommand {
                source_index: index,
                command,
                retry,
            });
        }
    }

    plan
}
