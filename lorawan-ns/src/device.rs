//! Device sessions and the session store
//!
//! A [`DeviceSession`] is everything the network server remembers about one
//! end-device between packets: identity, session keys, frame counters, the
//! DevNonces it has already used, radio settings and queued downlink data.
//!
//! Sessions live behind the [`SessionStore`] trait. Every read-modify-write
//! goes through [`SessionStore::update_session`] (or its variants), which
//! runs the closure under that device's lock and only commits when the
//! closure succeeds. Counter and nonce checks are therefore atomic per
//! device while different devices never contend.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use heapless::Vec as BoundedVec;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::debug;

use crate::config::device::{DevAddr, Eui64};
use crate::config::network::NetworkConfig;
use crate::crypto::SessionKeys;
use crate::lorawan::commands::{DownlinkCommand, MacCommandError, UplinkCommand};
use crate::lorawan::mac::DevNonce;
use crate::lorawan::region::EU868_JOIN_CHANNELS;

/// DevNonces remembered per device
pub const DEV_NONCE_HISTORY: usize = 1024;

/// Default time to wait for a device lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(200);

/// Session store failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No session for the DevEUI
    #[error("no session for DevEUI {0}")]
    NotFound(Eui64),
    /// No session owns the DevAddr
    #[error("no session for DevAddr {0}")]
    AddrNotFound(DevAddr),
    /// The device lock was not acquired in time
    #[error("timed out waiting for session {0}")]
    Timeout(Eui64),
    /// The DevAddr already routes to another device
    #[error("DevAddr {dev_addr} is already assigned to {owner}")]
    AddrInUse {
        /// Contested address
        dev_addr: DevAddr,
        /// Device currently holding it
        owner: Eui64,
    },
}

/// Join state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinStatus {
    /// A Join-Request was seen but no session is established
    #[default]
    Pending,
    /// Session keys are in place
    Accepted,
}

/// Radio settings the device is known to use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSettings {
    /// RX1 delay in seconds
    pub rx1_delay: u8,
    /// RX1 data rate offset
    pub rx1_dr_offset: u8,
    /// RX2 data rate index
    pub rx2_data_rate: u8,
    /// RX2 frequency in Hz
    pub rx2_frequency: u32,
    /// Enabled uplink channels in Hz
    pub channels: Vec<u32>,
    /// Aggregated duty cycle exponent
    pub max_duty_cycle: u8,
    /// ADR data rate index
    pub data_rate: u8,
    /// ADR TX power index
    pub tx_power: u8,
    /// ADR channel mask
    pub ch_mask: u16,
    /// ADR repetitions
    pub nb_trans: u8,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self::from_network(&NetworkConfig::default())
    }
}

impl DeviceSettings {
    /// Settings a device has right after joining this network
    pub fn from_network(config: &NetworkConfig) -> Self {
        let mut channels = EU868_JOIN_CHANNELS.to_vec();
        channels.extend_from_slice(&config.cf_list);
        Self {
            rx1_delay: config.timing.rx1_delay,
            rx1_dr_offset: config.rx1_dr_offset,
            rx2_data_rate: config.rx2_data_rate,
            rx2_frequency: config.rx2_frequency,
            channels,
            max_duty_cycle: 0,
            data_rate: 0,
            tx_power: 0,
            ch_mask: 0x00FF,
            nb_trans: 1,
        }
    }
}

/// Last DevStatusAns content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStatus {
    /// Battery level (0 = external power, 255 = unknown)
    pub battery: Option<u8>,
    /// Demodulation margin in dB
    pub margin: Option<i8>,
}

/// Application data waiting for the next downlink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedData {
    /// Application port (1..=223)
    pub f_port: u8,
    /// Plaintext payload
    pub payload: Vec<u8>,
    /// Send as ConfirmedDataDown
    pub confirmed: bool,
}

/// Bounded history of used DevNonces.
///
/// Holds the last [`DEV_NONCE_HISTORY`] nonces; once full, the oldest entry
/// is overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DevNonceHistory {
    nonces: BoundedVec<DevNonce, DEV_NONCE_HISTORY>,
    next: usize,
}

impl DevNonceHistory {
    /// Create an empty history
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the nonce was used within the window
    pub fn contains(&self, nonce: &DevNonce) -> bool {
        self.nonces.contains(nonce)
    }

    /// Record a nonce, evicting the oldest one when full
    pub fn insert(&mut self, nonce: DevNonce) {
        if let Err(nonce) = self.nonces.push(nonce) {
            self.nonces[self.next] = nonce;
            self.next = (self.next + 1) % DEV_NONCE_HISTORY;
        }
    }

    /// Number of remembered nonces
    pub fn len(&self) -> usize {
        self.nonces.len()
    }

    /// Whether no nonce is remembered
    pub fn is_empty(&self) -> bool {
        self.nonces.is_empty()
    }
}

/// Network-side state of one end-device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSession {
    /// Device identity
    pub dev_eui: Eui64,
    /// Join server / application identity
    pub app_eui: Eui64,
    /// Assigned at join
    pub dev_addr: Option<DevAddr>,
    /// Derived at join
    pub keys: Option<SessionKeys>,
    /// Last accepted uplink counter
    pub fcnt_up: u32,
    /// Next downlink counter
    pub fcnt_down: u32,
    /// DevNonces seen in Join-Requests
    pub used_dev_nonces: DevNonceHistory,
    /// Radio settings in effect
    pub settings: DeviceSettings,
    /// Last reported device status
    pub status: DeviceStatus,
    /// Whether the last join completed
    pub join_status: JoinStatus,
    /// Commands to send with the next downlink
    pub mac_queue: Vec<DownlinkCommand>,
    /// Requests sent and not yet answered
    pub pending_mac: Vec<DownlinkCommand>,
    /// Application payloads to send
    pub data_queue: VecDeque<QueuedData>,
}

impl DeviceSession {
    /// Fresh session for a device that has not joined yet
    pub fn new(dev_eui: Eui64, app_eui: Eui64, settings: DeviceSettings) -> Self {
        Self {
            dev_eui,
            app_eui,
            dev_addr: None,
            keys: None,
            fcnt_up: 0,
            fcnt_down: 0,
            used_dev_nonces: DevNonceHistory::new(),
            settings,
            status: DeviceStatus::default(),
            join_status: JoinStatus::Pending,
            mac_queue: Vec::new(),
            pending_mac: Vec::new(),
            data_queue: VecDeque::new(),
        }
    }

    /// Install a new session after a successful join
    pub fn establish(&mut self, dev_addr: DevAddr, keys: SessionKeys, settings: DeviceSettings) {
        self.dev_addr = Some(dev_addr);
        self.keys = Some(keys);
        self.fcnt_up = 0;
        self.fcnt_down = 0;
        self.settings = settings;
        self.pending_mac.clear();
        self.join_status = JoinStatus::Accepted;
    }

    /// Whether an uplink counter is acceptable
    ///
    /// Counters must be strictly greater than the stored one, which a join
    /// resets to 0, so the first uplink of a session carries FCnt 1 or more.
    pub fn accepts_fcnt_up(&self, f_cnt: u32) -> bool {
        f_cnt > self.fcnt_up
    }

    /// Record an accepted uplink counter
    pub fn set_fcnt_up(&mut self, f_cnt: u32) {
        self.fcnt_up = f_cnt;
    }

    /// Take the next downlink counter
    pub fn next_fcnt_down(&mut self) -> u32 {
        let f_cnt = self.fcnt_down;
        self.fcnt_down = self.fcnt_down.wrapping_add(1);
        f_cnt
    }

    fn take_pending(&mut self, cid: u8) -> Option<DownlinkCommand> {
        let index = self.pending_mac.iter().position(|c| c.cid() == cid)?;
        Some(self.pending_mac.remove(index))
    }

    /// Apply the session side effects of uplink MAC answers
    ///
    /// Accepted requests are committed to [`DeviceSettings`]; every answered
    /// request leaves the pending list.
    pub fn apply_mac_answers(&mut self, commands: &[Result<UplinkCommand, MacCommandError>]) {
        for command in commands.iter().flatten() {
            match *command {
                UplinkCommand::DevStatusAns { battery, margin } => {
                    self.take_pending(0x06);
                    self.status = DeviceStatus {
                        battery: Some(battery),
                        margin: Some(margin),
                    };
                }
                UplinkCommand::RXTimingSetupAns => {
                    let request = self.take_pending(0x08);
                    if let Some(DownlinkCommand::RXTimingSetupReq { delay }) = request {
                        self.settings.rx1_delay = delay.max(1);
                    }
                }
                UplinkCommand::RXParamSetupAns {
                    channel_ack,
                    rx2_data_rate_ack,
                    rx1_dr_offset_ack,
                } => {
                    if let Some(DownlinkCommand::RXParamSetupReq {
                        rx1_dr_offset,
                        rx2_data_rate,
                        frequency,
                    }) = self.take_pending(0x05)
                    {
                        if channel_ack && rx2_data_rate_ack && rx1_dr_offset_ack {
                            self.settings.rx1_dr_offset = rx1_dr_offset;
                            self.settings.rx2_data_rate = rx2_data_rate;
                            self.settings.rx2_frequency = frequency;
                        }
                    }
                }
                UplinkCommand::LinkADRAns {
                    ch_mask_ack,
                    data_rate_ack,
                    tx_power_ack,
                } => {
                    if let Some(DownlinkCommand::LinkADRReq {
                        data_rate,
                        tx_power,
                        ch_mask,
                        nb_trans,
                        ..
                    }) = self.take_pending(0x03)
                    {
                        if ch_mask_ack && data_rate_ack && tx_power_ack {
                            self.settings.data_rate = data_rate;
                            self.settings.tx_power = tx_power;
                            self.settings.ch_mask = ch_mask;
                            self.settings.nb_trans = nb_trans.max(1);
                        }
                    }
                }
                UplinkCommand::DutyCycleAns => {
                    let request = self.take_pending(0x04);
                    if let Some(DownlinkCommand::DutyCycleReq { max_duty_cycle }) = request {
                        self.settings.max_duty_cycle = max_duty_cycle;
                    }
                }
                UplinkCommand::NewChannelAns {
                    channel_freq_ok,
                    data_rate_range_ok,
                } => {
                    if let Some(DownlinkCommand::NewChannelReq {
                        ch_index,
                        frequency,
                        ..
                    }) = self.take_pending(0x07)
                    {
                        if channel_freq_ok && data_rate_range_ok {
                            let index = ch_index as usize;
                            if index < self.settings.channels.len() {
                                self.settings.channels[index] = frequency;
                            } else {
                                self.settings.channels.push(frequency);
                            }
                        }
                    }
                }
                UplinkCommand::DlChannelAns { .. } => {
                    self.take_pending(0x0A);
                }
                UplinkCommand::TxParamSetupAns => {
                    self.take_pending(0x09);
                }
                UplinkCommand::ADRParamSetupAns => {
                    self.take_pending(0x0C);
                }
                UplinkCommand::RejoinParamSetupAns { .. } => {
                    self.take_pending(0x0F);
                }
                UplinkCommand::ResetInd { .. }
                | UplinkCommand::LinkCheckReq
                | UplinkCommand::RekeyInd { .. }
                | UplinkCommand::DeviceTimeReq
                | UplinkCommand::Unknown { .. } => {}
            }
        }
    }
}

/// Keyed storage of device sessions, atomic per device
pub trait SessionStore: Send + Sync {
    /// Snapshot of a session by DevEUI
    fn get_session(&self, dev_eui: &Eui64) -> Result<DeviceSession, StoreError>;

    /// Snapshot of a session by DevAddr
    fn get_session_by_addr(&self, dev_addr: DevAddr) -> Result<DeviceSession, StoreError>;

    /// DevEUI whose session currently owns a DevAddr
    fn dev_addr_owner(&self, dev_addr: DevAddr) -> Option<Eui64>;

    /// Insert or replace a session, indexing its DevAddr
    fn dev_addr_owner(&self, dev_addr: DevAddr) -> Option<Eui64> {
        self.addr_owner(dev_addr).ok()
    }

    fn put_session(&self, dev_eui: Eui64, session: DeviceSession) -> Result<(), StoreError> {
        let blank = DeviceSession::new(dev_eui, session.app_eui, session.settings.clone());
        self.upsert_session(
            &dev_eui,
            || blank,
            |stored: &mut DeviceSession| -> Result<(), StoreError> {
                *stored = session;
                Ok(())
            },
        )?;
        debug!(%dev_eui, "session stored");
        Ok(())
    }

    fn remove_session(&self, dev_eui: &Eui64) -> Result<Option<DeviceSession>, StoreError> {
        let Ok(entry) = self.entry(dev_eui) else {
            return Ok(None);
        };
        let guard = entry
            .try_lock_for(self.lock_timeout)
            .ok_or(StoreError::Timeout(*dev_eui))?;
        {
            let mut sessions = self.sessions.write();
            if !sessions.get(dev_eui).is_some_and(|current| Arc::ptr_eq(current, &entry)) {
                return Ok(None);
            }
            sessions.remove(dev_eui);
        }
        let session = guard.clone();
        self.reindex(*dev_eui, session.dev_addr, None)?;
        debug!(%dev_eui, "session removed");
        Ok(Some(session))
    }

    fn update_session<T, E, F>(&self, dev_eui: &Eui64, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut DeviceSession) -> Result<T, E>,
        E: From<StoreError>,
    {
        let entry = self.entry(dev_eui)?;
        self.modify(&entry, dev_eui, false, f)
    }

    fn update_session_by_addr<T, E, F>(&self, dev_addr: DevAddr, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut DeviceSession) -> Result<T, E>,
        E: From<StoreError>,
    {
        let dev_eui = self.addr_owner(dev_addr)?;
        self.update_session(&dev_eui, f)
    }

    fn upsert_session<T, E, I, F>(&self, dev_eui: &Eui64, init: I, f: F) -> Result<T, E>
    where
        I: FnOnce() -> DeviceSession,
        F: FnOnce(&mut DeviceSession) -> Result<T, E>,
        E: From<StoreError>,
    {
        let (entry, created) = {
            let mut sessions = self.sessions.write();
            match sessions.get(dev_eui) {
                Some(entry) => (entry.clone(), false),
                None => {
                    let entry = Arc::new(Mutex::new(init()));
                    sessions.insert(*dev_eui, entry.clone());
                    (entry, true)
                }
            }
        };

        self.modify(&entry, dev_eui, created, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::device::AesKey;

    const DEV_EUI: Eui64 = Eui64::new([0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
    const APP_EUI: Eui64 = Eui64::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);

    fn session() -> DeviceSession {
        DeviceSession::new(DEV_EUI, APP_EUI, DeviceSettings::default())
    }

    fn keys() -> SessionKeys {
        SessionKeys {
            nwk_skey: AesKey::new([1; 16]),
            app_skey: AesKey::new([2; 16]),
        }
    }

    #[test]
    fn nonce_history_is_bounded_fifo() {
        let mut history = DevNonceHistory::new();
        for n in 0..DEV_NONCE_HISTORY as u16 {
            history.insert(DevNonce(n.to_le_bytes()));
        }
        assert_eq!(history.len(), DEV_NONCE_HISTORY);
        assert!(history.contains(&DevNonce([0, 0])));

        history.insert(DevNonce([0xFF, 0xFF]));
        assert_eq!(history.len(), DEV_NONCE_HISTORY);
        assert!(!history.contains(&DevNonce([0, 0])));
        assert!(history.contains(&DevNonce([1, 0])));
        assert!(history.contains(&DevNonce([0xFF, 0xFF])));
    }

    #[test]
    fn fcnt_rules() {
        let mut s = session();
        s.establish(DevAddr(1), keys(), DeviceSettings::default());
        assert_eq!(s.fcnt_up, 0);
        assert!(!s.accepts_fcnt_up(0));
        assert!(s.accepts_fcnt_up(1));
        s.set_fcnt_up(1);
        assert!(!s.accepts_fcnt_up(1));
        s.set_fcnt_up(10);
        assert!(!s.accepts_fcnt_up(10));
        assert!(!s.accepts_fcnt_up(9));

        assert_eq!(s.next_fcnt_down(), 0);
        assert_eq!(s.next_fcnt_down(), 1);
        assert_eq!(s.fcnt_down, 2);
    }

    #[test]
    fn establish_resets_counters() {
        let mut s = session();
        s.set_fcnt_up(50);
        s.fcnt_down = 7;
        s.establish(DevAddr(9), keys(), DeviceSettings::default());
        assert_eq!(s.fcnt_up, 0);
        assert_eq!(s.fcnt_down, 0);
        assert!(!s.accepts_fcnt_up(0));
        assert_eq!(s.join_status, JoinStatus::Accepted);
    }

    #[test]
    fn mac_answers_commit_pending_settings() {
        let mut s = session();
        s.pending_mac = vec![
            DownlinkCommand::RXTimingSetupReq { delay: 3 },
            DownlinkCommand::RXParamSetupReq {
                rx1_dr_offset: 1,
                rx2_data_rate: 3,
                frequency: 869_525_000,
            },
            DownlinkCommand::DevStatusReq,
            DownlinkCommand::DutyCycleReq { max_duty_cycle: 4 },
        ];
        s.apply_mac_answers(&[
            Ok(UplinkCommand::RXTimingSetupAns),
            Ok(UplinkCommand::RXParamSetupAns {
                channel_ack: true,
                rx2_data_rate_ack: true,
                rx1_dr_offset_ack: true,
            }),
            Ok(UplinkCommand::DevStatusAns {
                battery: 200,
                margin: -3,
            }),
        ]);
        assert_eq!(s.settings.rx1_delay, 3);
        assert_eq!(s.settings.rx1_dr_offset, 1);
        assert_eq!(s.settings.rx2_data_rate, 3);
        assert_eq!(s.status.battery, Some(200));
        assert_eq!(s.status.margin, Some(-3));
        assert_eq!(
            s.pending_mac,
            vec![DownlinkCommand::DutyCycleReq { max_duty_cycle: 4 }]
        );
    }

    #[test]
    fn rejected_rx_params_are_not_committed() {
        let mut s = session();
        s.pending_mac = vec![DownlinkCommand::RXParamSetupReq {
            rx1_dr_offset: 1,
            rx2_data_rate: 3,
            frequency: 869_100_000,
        }];
        s.apply_mac_answers(&[Ok(UplinkCommand::RXParamSetupAns {
            channel_ack: false,
            rx2_data_rate_ack: true,
            rx1_dr_offset_ack: true,
        })]);
        assert_eq!(s.settings.rx2_frequency, 869_525_000);
        assert!(s.pending_mac.is_empty());
    }

    #[test]
    fn store_indexes_by_addr() {
        let store = MemorySessionStore::new();
        let mut s = session();
        s.dev_addr = Some(DevAddr(0x2403_4567));
        store.put_session(DEV_EUI, s).unwrap();

        let found = store.get_session_by_addr(DevAddr(0x2403_4567)).unwrap();
        assert_eq!(found.dev_eui, DEV_EUI);
        assert_eq!(
            store.get_session_by_addr(DevAddr(1)),
            Err(StoreError::AddrNotFound(DevAddr(1)))
        );

        store.remove_session(&DEV_EUI).unwrap();
        assert!(store.is_empty());
        assert!(store.get_session_by_addr(DevAddr(0x2403_4567)).is_err());
        assert_eq!(store.get_session(&DEV_EUI), Err(StoreError::NotFound(DEV_EUI)));
    }

    #[test]
    fn failed_update_does_not_commit() {
        let store = MemorySessionStore::new();
        store.put_session(DEV_EUI, session()).unwrap();

        let result: Result<(), StoreError> = store.update_session(&DEV_EUI, |s| {
            s.fcnt_up = 99;
            Err(StoreError::NotFound(DEV_EUI))
        });
        assert!(result.is_err());
        assert_eq!(store.get_session(&DEV_EUI).unwrap().fcnt_up, 0);

        store
            .update_session::<_, StoreError, _>(&DEV_EUI, |s| {
                s.dev_addr = Some(DevAddr(5));
                Ok(())
            })
            .unwrap();
        assert_eq!(store.get_session_by_addr(DevAddr(5)).unwrap().dev_eui, DEV_EUI);
    }

    #[test]
    fn failed_upsert_leaves_no_session() {
        let store = MemorySessionStore::new();
        let result: Result<(), StoreError> =
            store.upsert_session(&DEV_EUI, session, |_| Err(StoreError::NotFound(DEV_EUI)));
        assert!(result.is_err());
        assert!(store.is_empty());

        store
            .upsert_session::<_, StoreError, _, _>(&DEV_EUI, session, |_| Ok(()))
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn address_of_another_device_is_refused() {
        const OTHER: Eui64 = Eui64::new([0x42; 8]);
        let store = MemorySessionStore::new();
        let mut s = session();
        s.dev_addr = Some(DevAddr(0x2400_0001));
        store.put_session(DEV_EUI, s).unwrap();
        store
            .put_session(OTHER, DeviceSession::new(OTHER, APP_EUI, DeviceSettings::default()))
            .unwrap();

        let result = store.update_session::<_, StoreError, _>(&OTHER, |s| {
            s.dev_addr = Some(DevAddr(0x2400_0001));
            Ok(())
        });
        assert_eq!(
            result,
            Err(StoreError::AddrInUse {
                dev_addr: DevAddr(0x2400_0001),
                owner: DEV_EUI
            })
        );
        assert_eq!(store.dev_addr_owner(DevAddr(0x2400_0001)), Some(DEV_EUI));
        assert_eq!(store.get_session(&OTHER).unwrap().dev_addr, None);
    }

    #[test]
    fn update_after_purge_is_not_committed() {
        let store = MemorySessionStore::new();
        store.put_session(DEV_EUI, session()).unwrap();

        // entry fetched before the purge, as a concurrent update would have
        let entry = store.entry(&DEV_EUI).unwrap();
        assert!(store.remove_session(&DEV_EUI).unwrap().is_some());

        let result = store.modify::<_, StoreError, _>(&entry, &DEV_EUI, false, |s| {
            s.dev_addr = Some(DevAddr(5));
            Ok(())
        });
        assert_eq!(result, Err(StoreError::NotFound(DEV_EUI)));
        assert_eq!(store.dev_addr_owner(DevAddr(5)), None);
        assert!(store.is_empty());
    }

    #[test]
    fn purge_races_with_updates() {
        let store = Arc::new(MemorySessionStore::with_lock_timeout(Duration::from_secs(5)));
        let mut s = session();
        s.dev_addr = Some(DevAddr(7));
        store.put_session(DEV_EUI, s).unwrap();

        std::thread::scope(|scope| {
            for n in 0..4u32 {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    for i in 0..50 {
                        let _ = store.update_session::<_, StoreError, _>(&DEV_EUI, |s| {
                            s.dev_addr = Some(DevAddr(100 + n * 50 + i));
                            Ok(())
                        });
                    }
                });
            }
            let store = Arc::clone(&store);
            scope.spawn(move || store.remove_session(&DEV_EUI).unwrap());
        });

        assert!(store.is_empty());
        assert!(store.by_addr.read().is_empty());
    }

    #[test]
    fn concurrent_updates_are_serialized() {
        let store = Arc::new(MemorySessionStore::with_lock_timeout(Duration::from_secs(5)));
        store.put_session(DEV_EUI, session()).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        store
                            .update_session::<_, StoreError, _>(&DEV_EUI, |s| {
                                s.fcnt_down += 1;
                                Ok(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.get_session(&DEV_EUI).unwrap().fcnt_down, 800);
    }
}
