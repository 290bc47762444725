use core::fmt;
use core::str::FromStr;

use thiserror::Error;

/// Extra channels advertised in the Join-Accept CFList (EU868), in Hz
pub const EU868_DEFAULT_CF_LIST: [u32; 5] =
    [867_100_000, 867_300_000, 867_500_000, 867_700_000, 867_900_000];

/// Mandatory EU868 join channels, in Hz
pub const EU868_JOIN_CHANNELS: [u32; 3] = [868_100_000, 868_300_000, 868_500_000];

/// Preamble symbols sent by gateways and devices
const PREAMBLE_SYMBOLS: u32 = 8;

/// A `datr` string that is not a LoRa `SFxBWy` descriptor
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unsupported data rate {0:?}")]
pub struct InvalidDataRate(pub String);

/// LoRa modulation of a data rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataRate {
    /// Spreading factor (7..=12)
    pub spreading_factor: u8,
    /// Bandwidth in kHz
    pub bandwidth_khz: u16,
}

impl DataRate {
    /// Create a data rate
    pub const fn new(spreading_factor: u8, bandwidth_khz: u16) -> Self {
        Self {
            spreading_factor,
            bandwidth_khz,
        }
    }

    /// Get bandwidth in Hz
    pub fn bandwidth(&self) -> u32 {
        self.bandwidth_khz as u32 * 1000
    }

    /// Symbol duration in microseconds
    pub fn symbol_time_us(&self) -> u32 {
        ((1u64 << self.spreading_factor) * 1000 / self.bandwidth_khz.max(1) as u64) as u32
    }

    // Low data rate optimisation kicks in when symbols exceed 16 ms.
    fn low_data_rate_optimize(&self) -> bool {
        self.spreading_factor >= 11 && self.bandwidth_khz == 125
    }

    /// LoRa time on air of a PHYPayload in microseconds
    ///
    /// Explicit header, 8 preamble symbols. `coding_rate` is the denominator
    /// of the `4/x` code rate (5..=8). Downlinks are sent without payload CRC.
    pub fn time_on_air_us(&self, payload_len: usize, coding_rate: u8, crc: bool) -> u32 {
        let sf = self.spreading_factor as i64;
        let cr = coding_rate.clamp(5, 8) as i64 - 4;
        let de = self.low_data_rate_optimize() as i64;
        let t_sym = self.symbol_time_us() as u64;

        // n_payload = 8 + max(ceil((8PL - 4SF + 28 + 16CRC) / 4(SF - 2DE)) * (CR + 4), 0)
        let numerator = 8 * payload_len as i64 - 4 * sf + 28 + if crc { 16 } else { 0 };
        let denominator = 4 * (sf - 2 * de);
        let blocks = if numerator > 0 && denominator > 0 {
            (numerator + denominator - 1) / denominator
        } else {
            0
        };
        let n_payload = 8 + (blocks * (cr + 4)) as u64;

        // Preamble is n + 4.25 symbols; work in quarter symbols.
        let t_preamble = (PREAMBLE_SYMBOLS as u64 * 4 + 17) * t_sym / 4;

        (t_preamble + n_payload * t_sym) as u32
    }

    /// Demodulation SNR floor in dB
    pub fn demod_floor_db(&self) -> f32 {
        match self.spreading_factor {
            7 => -7.5,
            8 => -10.0,
            9 => -12.5,
            10 => -15.0,
            11 => -17.5,
            _ => -20.0,
        }
    }

    /// LinkCheckAns margin: dB above the demodulation floor, clamped to 0..=254
    pub fn link_margin(&self, snr: f32) -> u8 {
        (snr - self.demod_floor_db()).clamp(0.0, 254.0) as u8
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SF{}BW{}", self.spreading_factor, self.bandwidth_khz)
    }
}

impl FromStr for DataRate {
    type Err = InvalidDataRate;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidDataRate(s.to_string());
        let rest = s.strip_prefix("SF").ok_or_else(invalid)?;
        let (sf, bw) = rest.split_once("BW").ok_or_else(invalid)?;
        let spreading_factor: u8 = sf.parse().map_err(|_| invalid())?;
        let bandwidth_khz: u16 = bw.parse().map_err(|_| invalid())?;
        if !(5..=12).contains(&spreading_factor) || bandwidth_khz == 0 {
            return Err(invalid());
        }
        Ok(Self::new(spreading_factor, bandwidth_khz))
    }
}

/// Regional parameters the network server needs for downlinks
pub trait Region: Send + Sync {
    /// Modulation of a data rate index
    fn data_rate(&self, index: u8) -> Option<DataRate>;

    /// Index of a modulation, if the region defines it
    fn data_rate_index(&self, data_rate: DataRate) -> Option<u8>;

    /// RX1 data rate index for an uplink index and RX1DROffset
    fn rx1_data_rate(&self, uplink_index: u8, offset: u8) -> u8;

    /// RX1 frequency for an uplink frequency
    fn rx1_frequency(&self, uplink_frequency: u32) -> u32;

    /// Default RX2 parameters `(frequency, data rate index)`
    fn rx2_window(&self) -> (u32, u8);

    /// Maximum MACPayload size for a data rate index
    fn max_payload_size(&self, index: u8) -> usize;
}

/// EU 863-870 MHz band
#[derive(Debug, Clone, Copy, Default)]
pub struct Eu868;

const EU868_DATA_RATES: [DataRate; 7] = [
    DataRate::new(12, 125), // DR0
    DataRate::new(11, 125), // DR1
    DataRate::new(10, 125), // DR2
    DataRate::new(9, 125),  // DR3
    DataRate::new(8, 125),  // DR4
    DataRate::new(7, 125),  // DR5
    DataRate::new(7, 250),  // DR6
];

impl Region for Eu868 {
    fn data_rate(&self, index: u8) -> Option<DataRate> {
        EU868_DATA_RATES.get(index as usize).copied()
    }

    fn data_rate_index(&self, data_rate: DataRate) -> Option<u8> {
        EU868_DATA_RATES
            .iter()
            .position(|dr| *dr == data_rate)
            .map(|i| i as u8)
    }

    fn rx1_data_rate(&self, uplink_index: u8, offset: u8) -> u8 {
        uplink_index.saturating_sub(offset)
    }

    fn rx1_frequency(&self, uplink_frequency: u32) -> u32 {
        uplink_frequency
    }

    fn rx2_window(&self) -> (u32, u8) {
        (869_525_000, 0)
    }

    fn max_payload_size(&self, index: u8) -> usize {
        match index {
            0..=2 => 59,
            3 => 123,
            _ => 230,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datr_strings_parse_and_print() {
        let dr: DataRate = "SF7BW125".parse().unwrap();
        assert_eq!(dr, DataRate::new(7, 125));
        assert_eq!(dr.to_string(), "SF7BW125");
        assert_eq!(dr.bandwidth(), 125_000);
        assert!("FSK50".parse::<DataRate>().is_err());
        assert!("SF13BW125".parse::<DataRate>().is_err());
        assert!("SFxBW125".parse::<DataRate>().is_err());
    }

    #[test]
    fn symbol_times() {
        assert_eq!(DataRate::new(7, 125).symbol_time_us(), 1024);
        assert_eq!(DataRate::new(12, 125).symbol_time_us(), 32_768);
        assert_eq!(DataRate::new(7, 250).symbol_time_us(), 512);
    }

    #[test]
    fn time_on_air_matches_semtech_calculator() {
        // 13-byte frame at SF7/125, CR 4/5: 46.336 ms with CRC, 41.216 ms without.
        let sf7 = DataRate::new(7, 125);
        assert_eq!(sf7.time_on_air_us(13, 5, true), 46_336);
        assert_eq!(sf7.time_on_air_us(13, 5, false), 41_216);

        // Low data rate optimisation at SF12.
        let sf12 = DataRate::new(12, 125);
        assert!(sf12.time_on_air_us(13, 5, false) > 900_000);
    }

    #[test]
    fn link_margin_is_clamped() {
        let sf7 = DataRate::new(7, 125);
        assert_eq!(sf7.link_margin(5.0), 12);
        assert_eq!(sf7.link_margin(-20.0), 0);
        assert_eq!(DataRate::new(12, 125).link_margin(-10.0), 10);
    }

    #[test]
    fn eu868_rx1_lowers_data_rate() {
        let region = Eu868;
        assert_eq!(region.rx1_data_rate(5, 0), 5);
        assert_eq!(region.rx1_data_rate(5, 2), 3);
        assert_eq!(region.rx1_data_rate(1, 4), 0);
        assert_eq!(region.data_rate_index(DataRate::new(9, 125)), Some(3));
        assert_eq!(region.data_rate(0), Some(DataRate::new(12, 125)));
        assert_eq!(region.data_rate(7), None);
        assert_eq!(region.rx1_frequency(868_100_000), 868_100_000);
        assert_eq!(region.rx2_window(), (869_525_000, 0));
    }
}
