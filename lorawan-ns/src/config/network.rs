use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::lorawan::phy::TimingParams;
use crate::lorawan::region::EU868_DEFAULT_CF_LIST;

/// Maximum number of extra channels a CFList can carry
pub const CF_LIST_MAX_CHANNELS: usize = 5;

/// Network-wide parameters shared by every device session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// 24-bit network identifier; its 7 low bits are the NwkID used in DevAddr
    pub net_id: u32,
    /// Receive window delays
    pub timing: TimingParams,
    /// RX1 data rate offset advertised in DLSettings (0..=7)
    pub rx1_dr_offset: u8,
    /// RX2 data rate index (0..=15)
    pub rx2_data_rate: u8,
    /// RX2 frequency in Hz
    pub rx2_frequency: u32,
    /// Extra channels sent in the Join-Accept CFList, in Hz
    pub cf_list: Vec<u32>,
    /// Downlink TX power in dBm
    pub tx_power: i8,
    /// RF chain used for downlinks
    pub rf_chain: u8,
    /// LoRa coding rate for downlinks
    pub coding_rate: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            net_id: 0x00_0012,
            timing: TimingParams::default(),
            rx1_dr_offset: 0,
            rx2_data_rate: 0,
            rx2_frequency: 869_525_000,
            cf_list: EU868_DEFAULT_CF_LIST.to_vec(),
            tx_power: 14,
            rf_chain: 0,
            coding_rate: "4/5".to_string(),
        }
    }
}

impl NetworkConfig {
    /// NwkID (7 bits) derived from the NetID
    pub fn nwk_id(&self) -> u8 {
        (self.net_id & 0x7F) as u8
    }

    /// NetID as the 3 little-endian wire bytes
    pub fn net_id_bytes(&self) -> [u8; 3] {
        let b = self.net_id.to_le_bytes();
        [b[0], b[1], b[2]]
    }

    /// Check every field against its protocol range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.net_id > 0x00FF_FFFF {
            return Err(ConfigError::InvalidNetId(self.net_id));
        }
        if !(1..=15).contains(&self.timing.rx1_delay) {
            return Err(ConfigError::InvalidRxDelay(self.timing.rx1_delay));
        }
        if let Some(d2) = self.timing.rx2_delay {
            if d2 <= self.timing.rx1_delay || d2 > 16 {
                return Err(ConfigError::InvalidRx2Delay(d2));
            }
        }
        if self.rx1_dr_offset > 7 || self.rx2_data_rate > 15 {
            return Err(ConfigError::InvalidDlSettings {
                rx1_dr_offset: self.rx1_dr_offset,
                rx2_data_rate: self.rx2_data_rate,
            });
        }
        if self.cf_list.len() > CF_LIST_MAX_CHANNELS {
            return Err(ConfigError::InvalidCfList("more than 5 channels"));
        }
        if self
            .cf_list
            .iter()
            .any(|f| f % 100 != 0 || f / 100 > 0x00FF_FFFF)
        {
            return Err(ConfigError::InvalidCfList(
                "frequencies must be multiples of 100 Hz below 1.67 GHz",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_eu868() {
        let config = NetworkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.nwk_id(), 0x12);
        assert_eq!(config.net_id_bytes(), [0x12, 0x00, 0x00]);
        assert_eq!(config.timing.rx1_delay, 1);
        assert_eq!(config.cf_list.len(), 5);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let mut config = NetworkConfig::default();
        config.timing.rx1_delay = 16;
        assert_eq!(config.validate(), Err(ConfigError::InvalidRxDelay(16)));

        let mut config = NetworkConfig::default();
        config.timing.rx2_delay = Some(1);
        assert_eq!(config.validate(), Err(ConfigError::InvalidRx2Delay(1)));
        config.timing.rx2_delay = Some(5);
        assert!(config.validate().is_ok());

        let mut config = NetworkConfig::default();
        config.rx1_dr_offset = 8;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDlSettings { .. })
        ));

        let mut config = NetworkConfig::default();
        config.cf_list.push(868_100_000);
        assert!(config.validate().is_err());

        let mut config = NetworkConfig::default();
        config.cf_list[0] = 867_100_050;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: NetworkConfig = serde_json::from_str(r#"{"net_id": 19}"#).unwrap();
        assert_eq!(config.net_id, 19);
        assert_eq!(config.rx2_frequency, 869_525_000);
    }
}
