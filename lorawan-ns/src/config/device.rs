use core::fmt;
use core::str::FromStr;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::crypto::CryptoError;

/// EUI-64 identifier (DevEUI, AppEUI/JoinEUI).
///
/// Bytes are held in over-the-air order, the same order they occupy inside
/// a Join-Request, and are displayed as hex in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Eui64(pub [u8; 8]);

impl Eui64 {
    /// Create an EUI from its over-the-air bytes
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Get the over-the-air bytes
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl FromStr for Eui64 {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(parse_hex_array(s, "EUI-64")?))
    }
}

impl TryFrom<String> for Eui64 {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Eui64> for String {
    fn from(value: Eui64) -> Self {
        value.to_string()
    }
}

/// 32-bit device network address.
///
/// Serialized little-endian on the wire, displayed as the big-endian value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DevAddr(pub u32);

impl DevAddr {
    /// Build an address from its NwkID (7 bits) and NwkAddr (25 bits)
    pub fn from_parts(nwk_id: u8, nwk_addr: u32) -> Option<Self> {
        if nwk_id > 0x7F || nwk_addr > 0x01FF_FFFF {
            return None;
        }
        Some(Self(((nwk_id as u32) << 25) | nwk_addr))
    }

    /// Decode from the 4 wire bytes
    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }

    /// Encode to the 4 wire bytes
    pub fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// NwkID part (7 most significant bits)
    pub fn nwk_id(self) -> u8 {
        (self.0 >> 25) as u8
    }

    /// NwkAddr part (25 least significant bits)
    pub fn nwk_addr(self) -> u32 {
        self.0 & 0x01FF_FFFF
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl FromStr for DevAddr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 4] = parse_hex_array(s, "DevAddr")?;
        Ok(Self(u32::from_be_bytes(bytes)))
    }
}

impl TryFrom<String> for DevAddr {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DevAddr> for String {
    fn from(value: DevAddr) -> Self {
        value.to_string()
    }
}

/// AES-128 key (AppKey, NwkSKey, AppSKey)
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AesKey([u8; 16]);

impl AesKey {
    /// Create a new key from raw bytes
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Create a key from a slice, rejecting anything that is not 16 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; 16] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyMaterial { len: bytes.len() })?;
        Ok(Self(key))
    }

    /// Get key bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

// Keys never end up in logs.
impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesKey(..)")
    }
}

impl FromStr for AesKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|_| ConfigError::InvalidHex {
            field: "AES key",
            value: s.to_string(),
        })?;
        Ok(Self::from_slice(&bytes)?)
    }
}

impl TryFrom<String> for AesKey {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AesKey> for String {
    fn from(value: AesKey) -> Self {
        hex::encode_upper(value.0)
    }
}

fn parse_hex_array<const N: usize>(s: &str, field: &'static str) -> Result<[u8; N], ConfigError> {
    let invalid = || ConfigError::InvalidHex {
        field,
        value: s.to_string(),
    };
    let bytes = hex::decode(s.trim()).map_err(|_| invalid())?;
    bytes.try_into().map_err(|_| invalid())
}

/// Provisioned OTAA credentials of one end-device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device EUI (unique device identifier)
    pub dev_eui: Eui64,
    /// Application EUI
    pub app_eui: Eui64,
    /// Application key, root of the join procedure
    pub app_key: AesKey,
    /// Fixed NwkAddr for this device; allocated by the server when absent
    #[serde(default)]
    pub nwk_addr: Option<u32>,
}

impl DeviceConfig {
    /// Create a new OTAA device configuration
    pub fn new_otaa(dev_eui: Eui64, app_eui: Eui64, app_key: AesKey) -> Self {
        Self {
            dev_eui,
            app_eui,
            app_key,
            nwk_addr: None,
        }
    }

    /// Pin the NwkAddr assigned on join
    pub fn with_nwk_addr(mut self, nwk_addr: u32) -> Self {
        self.nwk_addr = Some(nwk_addr);
        self
    }
}

/// Registry of provisioned devices, keyed by DevEUI.
///
/// Read-only from the protocol engine's point of view; a DevEUI missing here
/// is an unknown device and never gets a session.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: HashMap<Eui64, DeviceConfig>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a device
    pub fn insert(&mut self, config: DeviceConfig) -> Option<DeviceConfig> {
        self.devices.insert(config.dev_eui, config)
    }

    /// Remove a device
    pub fn remove(&mut self, dev_eui: &Eui64) -> Option<DeviceConfig> {
        self.devices.remove(dev_eui)
    }

    /// Look up a device
    pub fn get(&self, dev_eui: &Eui64) -> Option<&DeviceConfig> {
        self.devices.get(dev_eui)
    }

    /// Device provisioned with a fixed NwkAddr
    pub fn nwk_addr_owner(&self, nwk_addr: u32) -> Option<&DeviceConfig> {
        self.devices.values().find(|d| d.nwk_addr == Some(nwk_addr))
    }

    /// Number of provisioned devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no device is provisioned
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl FromIterator<DeviceConfig> for DeviceRegistry {
    fn from_iter<I: IntoIterator<Item = DeviceConfig>>(iter: I) -> Self {
        let mut registry = Self::new();
        for config in iter {
            registry.insert(config);
        }
        registry
    }
}
