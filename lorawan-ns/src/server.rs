//! Uplink dispatch
//!
//! [`NetworkServer`] is the per-packet pipeline: decode the PHYPayload, route
//! it by MType to the join procedure or to data-uplink handling, and assemble
//! the downlink with its transmit parameters. All session reads and writes go
//! through the [`SessionStore`], one atomic update per packet.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::device::{DevAddr, DeviceConfig, DeviceRegistry, Eui64};
use crate::config::network::NetworkConfig;
use crate::config::ConfigError;
use crate::crypto::{self, CryptoError, Direction, SessionKeys, MIC_SIZE};
use crate::device::{DeviceSession, DeviceSettings, QueuedData, SessionStore, StoreError};
use crate::gateway::{EnvelopeError, PushData, PullResp, RxPk, TxPk};
use crate::join::{self, JoinError, JoinProcedure};
use crate::lorawan::commands::{
    self, DownlinkCommand, GpsTime, MacCommandError, PlanContext, UplinkCommand,
};
use crate::lorawan::mac::{
    DataPayload, FCtrl, Fhdr, Frame, FrameError, MType, MacPayload, Mhdr, MAX_FOPTS_LEN,
    MHDR_SIZE,
};
use crate::lorawan::phy::TimingParams;
use crate::lorawan::region::{DataRate, Eu868, Region};
use crate::scheduler::{RxWindow, RxWindowPlan, UplinkTiming};

/// Highest application FPort
pub const MAX_APP_F_PORT: u8 = 223;

const NWK_ADDR_MASK: u32 = 0x01FF_FFFF;

/// Counter values tried before giving up on a free NwkAddr
const MAX_ADDR_ATTEMPTS: usize = 1024;

/// Coding rate denominator used for downlink airtime
const DOWNLINK_CODING_RATE: u8 = 5;

/// Device identity named in an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceId {
    /// Join-Request sender
    Eui(Eui64),
    /// Data uplink sender
    Addr(DevAddr),
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Eui(eui) => write!(f, "DevEUI {eui}"),
            DeviceId::Addr(addr) => write!(f, "DevAddr {addr}"),
        }
    }
}

/// Packet processing errors
///
/// Every error aborts the current packet only. Nothing is committed to the
/// session store for a packet that fails.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Frame decoding failed
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// MIC or key failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// Join procedure failure
    #[error(transparent)]
    Join(#[from] JoinError),
    /// Session store failure
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Gateway envelope failure
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Data uplink with a counter not above the last accepted one
    #[error("replayed FCnt {received} from {dev_addr} (last {last})")]
    ReplayedFCnt {
        /// Sender
        dev_addr: DevAddr,
        /// Counter in the frame
        received: u32,
        /// Last accepted counter
        last: u32,
    },
    /// No provisioned device or session
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),
    /// MType the server does not accept
    #[error("unsupported message type {0:?}")]
    UnsupportedMType(MType),
    /// MAC commands need FPort 0 but application data is also queued
    #[error("{mac_len} bytes of MAC commands cannot share a frame with application data")]
    MacCommandConflict { mac_len: usize },
    /// Application data on a reserved port
    #[error("FPort {0} is not an application port")]
    InvalidFPort(u8),
    /// Data rate index the region does not define
    #[error("data rate index {0} not defined for region")]
    InvalidDataRateIndex(u8),
    /// NwkAddr wider than 25 bits
    #[error("NwkAddr {0:#x} does not fit in 25 bits")]
    InvalidNwkAddr(u32),
    /// No free NwkAddr found for a joining device
    #[error("no free NwkAddr after {0} attempts")]
    DevAddrExhausted(usize),
    /// Downlink exceeds the region payload limit even without deferrable content
    #[error("MACPayload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge {
        /// MACPayload length
        len: usize,
        /// Limit at the chosen data rate
        max: usize,
    },
}

impl ServerError {
    /// MIC failures and replays, logged as security events
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            ServerError::Crypto(CryptoError::InvalidMic { .. })
                | ServerError::Join(JoinError::Crypto(CryptoError::InvalidMic { .. }))
                | ServerError::Join(JoinError::ReplayedDevNonce(_))
                | ServerError::ReplayedFCnt { .. }
        )
    }
}

/// Radio metadata of one received uplink
#[derive(Debug, Clone, Copy)]
pub struct UplinkMeta {
    /// Arrival timing
    pub timing: UplinkTiming,
    /// Frequency in Hz
    pub frequency: u32,
    /// Uplink data rate
    pub data_rate: DataRate,
    /// SNR in dB
    pub snr: f32,
    /// RSSI in dBm
    pub rssi: i32,
    /// Receptions of the same frame in this batch
    pub gateway_count: u8,
}

impl UplinkMeta {
    /// Metadata from an `rxpk` received at `received_at`
    pub fn from_rxpk(
        rx: &RxPk,
        received_at: Instant,
        gateway_count: u8,
    ) -> Result<Self, EnvelopeError> {
        Ok(Self {
            timing: UplinkTiming {
                tmst: rx.tmst,
                received_at,
            },
            frequency: rx.frequency(),
            data_rate: rx.data_rate()?,
            snr: rx.lsnr,
            rssi: rx.rssi,
            gateway_count,
        })
    }
}

/// Accepted data uplink
#[derive(Debug, Clone, PartialEq)]
pub struct DataUplink {
    /// Sender identity
    pub dev_eui: Eui64,
    /// Sender address
    pub dev_addr: DevAddr,
    /// Frame counter
    pub f_cnt: u32,
    /// Sent as ConfirmedDataUp
    pub confirmed: bool,
    /// ADR bit of the uplink
    pub adr: bool,
    /// FPort, absent when no FRMPayload
    pub f_port: Option<u8>,
    /// Decrypted application payload; empty on FPort 0
    pub payload: Vec<u8>,
    /// MAC commands from FOpts or FPort 0, malformed ones included
    pub mac_commands: Vec<Result<UplinkCommand, MacCommandError>>,
}

/// What an accepted uplink did
#[derive(Debug, Clone, PartialEq)]
pub enum UplinkEvent {
    /// Join-Request accepted
    Joined {
        /// Joining device
        dev_eui: Eui64,
        /// Address assigned
        dev_addr: DevAddr,
    },
    /// Data uplink accepted
    Data(DataUplink),
}

/// Downlink ready for the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct Downlink {
    /// Encrypted and signed PHYPayload
    pub phy_payload: Vec<u8>,
    /// Receive window timing
    pub window: RxWindowPlan,
    /// Gateway transmit request
    pub txpk: TxPk,
}

impl Downlink {
    /// `PULL_RESP` body for this downlink
    pub fn pull_resp(&self) -> PullResp {
        PullResp {
            txpk: self.txpk.clone(),
        }
    }
}

/// Result of one uplink
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// What the uplink did
    pub event: UplinkEvent,
    /// Downlink to send, if any
    pub downlink: Option<Downlink>,
}

/// One data downlink before encryption and signing
#[derive(Debug, Clone, Copy)]
pub struct DataDownlink<'a> {
    /// Destination address
    pub dev_addr: DevAddr,
    /// Full 32-bit FCntDown
    pub f_cnt: u32,
    /// Send as ConfirmedDataDown
    pub confirmed: bool,
    /// Acknowledge a confirmed uplink
    pub ack: bool,
    /// More data queued
    pub f_pending: bool,
    /// ADR bit
    pub adr: bool,
    /// Commands to carry
    pub mac_commands: &'a [DownlinkCommand],
    /// `(FPort, plaintext)`
    pub application: Option<(u8, &'a [u8])>,
}

impl DataDownlink<'_> {
    /// Encode, encrypt and sign the PHYPayload
    ///
    /// MAC commands up to 15 bytes ride in FOpts. Larger batches go to
    /// FRMPayload on FPort 0 under NwkSKey, which leaves no room for
    /// application data.
    pub fn encode(&self, keys: &SessionKeys) -> Result<Vec<u8>, ServerError> {
        let mac = commands::encode_downlink(self.mac_commands);
        let f_ctrl = FCtrl {
            adr: self.adr,
            adr_ack_req: false,
            ack: self.ack,
            f_pending: self.f_pending,
            f_opts_len: 0,
        };
        let mut fhdr = Fhdr::new(self.dev_addr, f_ctrl, self.f_cnt as u16);

        let (f_port, plaintext) = if mac.len() <= MAX_FOPTS_LEN {
            fhdr.set_f_opts(&mac)?;
            match self.application {
                Some((port, data)) => (Some(port), data.to_vec()),
                None => (None, Vec::new()),
            }
        } else if self.application.is_some() {
            return Err(ServerError::MacCommandConflict { mac_len: mac.len() });
        } else {
            (Some(0), mac)
        };

        let frm_payload = match f_port {
            Some(port) => crypto::encrypt_frm_payload(
                crypto::payload_key(port, &keys.nwk_skey, &keys.app_skey),
                self.dev_addr,
                self.f_cnt,
                Direction::Down,
                &plaintext,
            ),
            None => Vec::new(),
        };

        let mtype = if self.confirmed {
            MType::ConfirmedDataDown
        } else {
            MType::UnconfirmedDataDown
        };
        let mut frame = Frame {
            mhdr: Mhdr::new(mtype),
            payload: MacPayload::Data(DataPayload {
                fhdr,
                f_port,
                frm_payload,
            }),
            mic: [0; MIC_SIZE],
        };
        frame.sign_data(&keys.nwk_skey, self.f_cnt);
        Ok(frame.encode())
    }
}

/// Receive-window parameters of one downlink
#[derive(Debug, Clone, Copy)]
struct WindowParams {
    rx1_delay: u8,
    rx2_delay: Option<u8>,
    rx1_dr_offset: u8,
    rx2_frequency: u32,
    rx2_data_rate: u8,
}

impl WindowParams {
    /// A configured RX2 delay applies while it still follows the session's RX1
    fn from_settings(settings: &DeviceSettings, timing: &TimingParams) -> Self {
        Self {
            rx1_delay: settings.rx1_delay,
            rx2_delay: timing.rx2_delay.filter(|d2| *d2 > settings.rx1_delay),
            rx1_dr_offset: settings.rx1_dr_offset,
            rx2_frequency: settings.rx2_frequency,
            rx2_data_rate: settings.rx2_data_rate,
        }
    }
}

/// LoRaWAN network server protocol engine
pub struct NetworkServer<S: SessionStore> {
    config: NetworkConfig,
    registry: DeviceRegistry,
    store: S,
    region: Box<dyn Region>,
    next_nwk_addr: AtomicU32,
}

impl<S: SessionStore> NetworkServer<S> {
    /// Create a server for the EU868 region
    pub fn new(
        config: NetworkConfig,
        registry: DeviceRegistry,
        store: S,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        Self::check_region(&config, &Eu868)?;
        Ok(Self {
            config,
            registry,
            store,
            region: Box::new(Eu868),
            next_nwk_addr: AtomicU32::new(1),
        })
    }

    /// Replace the regional parameters
    pub fn with_region(mut self, region: Box<dyn Region>) -> Result<Self, ServerError> {
        Self::check_region(&self.config, region.as_ref())?;
        self.region = region;
        Ok(self)
    }

    fn check_region(config: &NetworkConfig, region: &dyn Region) -> Result<(), ServerError> {
        match region.data_rate(config.rx2_data_rate) {
            Some(_) => Ok(()),
            None => Err(ServerError::InvalidDataRateIndex(config.rx2_data_rate)),
        }
    }

    /// Network configuration in use
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Backing session store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Handle a `PUSH_DATA` JSON body
    ///
    /// Receptions of the same PHYPayload are merged: the one with the best
    /// SNR is processed and the rest only count towards GwCnt. Each distinct
    /// frame gets its own result.
    pub fn handle_push_data(
        &self,
        body: &[u8],
    ) -> Result<Vec<Result<Outcome, ServerError>>, ServerError> {
        let received_at = Instant::now();
        let push = PushData::from_json(body)?;

        let mut frames: Vec<(&RxPk, u8)> = Vec::new();
        for rx in &push.rxpk {
            match frames.iter_mut().find(|(best, _)| best.data == rx.data) {
                Some((best, count)) => {
                    *count = count.saturating_add(1);
                    if rx.lsnr > best.lsnr {
                        *best = rx;
                    }
                }
                None => frames.push((rx, 1)),
            }
        }
        debug!(rxpk = push.rxpk.len(), frames = frames.len(), "push data");

        Ok(frames
            .into_iter()
            .map(|(rx, count)| self.handle_rxpk(rx, received_at, count))
            .collect())
    }

    /// Handle one `rxpk`
    pub fn handle_rxpk(
        &self,
        rx: &RxPk,
        received_at: Instant,
        gateway_count: u8,
    ) -> Result<Outcome, ServerError> {
        let meta = UplinkMeta::from_rxpk(rx, received_at, gateway_count)?;
        let phy_payload = rx.phy_payload()?;
        self.handle_uplink(&phy_payload, &meta)
    }

    /// Handle one PHYPayload
    pub fn handle_uplink(
        &self,
        phy_payload: &[u8],
        meta: &UplinkMeta,
    ) -> Result<Outcome, ServerError> {
        let result = Frame::decode(phy_payload)
            .map_err(ServerError::from)
            .and_then(|frame| {
                debug!(mtype = ?frame.mhdr.mtype, len = phy_payload.len(), "uplink decoded");
                match frame.mhdr.mtype {
                    MType::JoinRequest => self.handle_join_request(&frame, meta),
                    MType::UnconfirmedDataUp | MType::ConfirmedDataUp => {
                        self.handle_data_up(&frame, meta)
                    }
                    other => Err(ServerError::UnsupportedMType(other)),
                }
            });

        if let Err(err) = &result {
            if err.is_security_event() {
                warn!(error = %err, "uplink rejected");
            } else {
                debug!(error = %err, "uplink dropped");
            }
        }
        result
    }

    fn handle_join_request(
        &self,
        frame: &Frame,
        meta: &UplinkMeta,
    ) -> Result<Outcome, ServerError> {
        let MacPayload::JoinRequest(request) = &frame.payload else {
            return Err(ServerError::UnsupportedMType(frame.mhdr.mtype));
        };
        let device = self
            .registry
            .get(&request.dev_eui)
            .ok_or(ServerError::UnknownDevice(DeviceId::Eui(request.dev_eui)))?;

        let mut procedure = JoinProcedure::new(&self.config, device);
        procedure.validate(frame)?;

        let (rx2_frequency, rx2_data_rate) = self.region.rx2_window();
        let window = WindowParams {
            rx1_delay: self.config.timing.join_accept_delay1,
            rx2_delay: Some(self.config.timing.join_accept_delay2),
            rx1_dr_offset: 0,
            rx2_frequency,
            rx2_data_rate,
        };

        let (dev_addr, downlink) = self.store.upsert_session(
            &request.dev_eui,
            || {
                DeviceSession::new(
                    request.dev_eui,
                    request.app_eui,
                    DeviceSettings::from_network(&self.config),
                )
            },
            |session: &mut DeviceSession| -> Result<_, ServerError> {
                let dev_addr = self.assign_dev_addr(device, session)?;
                let accept =
                    procedure.establish(session, dev_addr, join::random_app_nonce())?;
                let (downlink, _) = self.schedule(accept.phy_payload, meta, &window)?;
                Ok((accept.dev_addr, downlink))
            },
        )?;
        info!(dev_eui = %request.dev_eui, %dev_addr, "device joined");

        Ok(Outcome {
            event: UplinkEvent::Joined {
                dev_eui: request.dev_eui,
                dev_addr,
            },
            downlink: Some(downlink),
        })
    }

    /// DevAddr for a joining device
    ///
    /// A provisioned NwkAddr wins, then the session's current address on this
    /// network. Otherwise the allocation counter advances past addresses that
    /// are provisioned for, or routed to, another device.
    fn assign_dev_addr(
        &self,
        device: &DeviceConfig,
        session: &DeviceSession,
    ) -> Result<DevAddr, ServerError> {
        let nwk_id = self.config.nwk_id();
        if let Some(fixed) = device.nwk_addr {
            return DevAddr::from_parts(nwk_id, fixed).ok_or(ServerError::InvalidNwkAddr(fixed));
        }
        if let Some(current) = session.dev_addr.filter(|addr| addr.nwk_id() == nwk_id) {
            return Ok(current);
        }

        for _ in 0..MAX_ADDR_ATTEMPTS {
            let nwk_addr = self.next_nwk_addr.fetch_add(1, Ordering::Relaxed) & NWK_ADDR_MASK;
            if self.registry.nwk_addr_owner(nwk_addr).is_some() {
                continue;
            }
            let Some(candidate) = DevAddr::from_parts(nwk_id, nwk_addr) else {
                continue;
            };
            match self.store.dev_addr_owner(candidate) {
                Some(owner) if owner != session.dev_eui => {
                    debug!(dev_addr = %candidate, %owner, "DevAddr taken, skipping");
                }
                _ => return Ok(candidate),
            }
        }
        Err(ServerError::DevAddrExhausted(MAX_ADDR_ATTEMPTS))
    }

    fn handle_data_up(
        &self,
        frame: &Frame,
        meta: &UplinkMeta,
    ) -> Result<Outcome, ServerError> {
        let Some(data) = frame.data() else {
            return Err(ServerError::UnsupportedMType(frame.mhdr.mtype));
        };
        let dev_addr = data.fhdr.dev_addr;
        let f_cnt = u32::from(data.fhdr.f_cnt);
        let confirmed = frame.mhdr.mtype == MType::ConfirmedDataUp;
        let mhdr = frame.mhdr.to_byte();
        let mac_payload = frame.mac_payload_bytes();

        let (uplink, downlink) = self
            .store
            .update_session_by_addr(dev_addr, |session| -> Result<_, ServerError> {
                let Some(keys) = session.keys else {
                    return Err(ServerError::UnknownDevice(DeviceId::Addr(dev_addr)));
                };
                crypto::check_mic(
                    &keys.nwk_skey,
                    dev_addr,
                    f_cnt,
                    Direction::Up,
                    mhdr,
                    &mac_payload,
                    &frame.mic,
                )?;
                if !session.accepts_fcnt_up(f_cnt) {
                    return Err(ServerError::ReplayedFCnt {
                        dev_addr,
                        received: f_cnt,
                        last: session.fcnt_up,
                    });
                }
                session.set_fcnt_up(f_cnt);

                let plaintext = match data.f_port {
                    Some(port) => crypto::decrypt_frm_payload(
                        crypto::payload_key(port, &keys.nwk_skey, &keys.app_skey),
                        dev_addr,
                        f_cnt,
                        Direction::Up,
                        &data.frm_payload,
                    ),
                    None => Vec::new(),
                };
                // FPort 0 carries MAC commands in FRMPayload and FOpts must be empty
                let (mac_bytes, payload) = if data.f_port == Some(0) {
                    if !data.fhdr.f_opts.is_empty() {
                        warn!(
                            %dev_addr,
                            f_opts_len = data.fhdr.f_opts.len(),
                            "FOpts ignored on FPort 0"
                        );
                    }
                    (plaintext, Vec::new())
                } else {
                    (data.fhdr.f_opts.to_vec(), plaintext)
                };

                let mac_commands = commands::decode_uplink(&mac_bytes);
                for err in mac_commands.iter().filter_map(|c| c.as_ref().err()) {
                    warn!(%dev_addr, error = %err, "malformed MAC command");
                }
                let plan = commands::plan_downlink(
                    &mac_commands,
                    &PlanContext {
                        gps_time: GpsTime::now(),
                        link_margin: meta.data_rate.link_margin(meta.snr),
                        gateway_count: meta.gateway_count,
                        pending: &session.pending_mac,
                        settings: &session.settings,
                    },
                );
                session.apply_mac_answers(&mac_commands);

                let downlink = self.build_data_downlink(
                    session,
                    &keys,
                    plan.commands(),
                    confirmed,
                    data,
                    meta,
                )?;
                let uplink = DataUplink {
                    dev_eui: session.dev_eui,
                    dev_addr,
                    f_cnt,
                    confirmed,
                    adr: data.fhdr.f_ctrl.adr,
                    f_port: data.f_port,
                    payload,
                    mac_commands,
                };
                Ok((uplink, downlink))
            })
            .map_err(|err| match err {
                ServerError::Store(StoreError::AddrNotFound(addr)) => {
                    ServerError::UnknownDevice(DeviceId::Addr(addr))
                }
                err => err,
            })?;
        info!(
            dev_eui = %uplink.dev_eui,
            %dev_addr,
            f_cnt,
            f_port = ?uplink.f_port,
            "uplink accepted"
        );
        Ok(Outcome {
            event: UplinkEvent::Data(uplink),
            downlink,
        })
    }

    /// Build and schedule the downlink answering a data uplink, if one is needed
    ///
    /// Runs inside the session update so FCntDown, the queues and the pending
    /// request list only advance when the whole packet succeeds. A frame over
    /// the payload limit of the chosen window first leaves its application
    /// data queued, then hands trailing MAC commands back to the MAC queue.
    fn build_data_downlink(
        &self,
        session: &mut DeviceSession,
        keys: &SessionKeys,
        mut mac_out: Vec<DownlinkCommand>,
        confirmed: bool,
        uplink: &DataPayload,
        meta: &UplinkMeta,
    ) -> Result<Option<Downlink>, ServerError> {
        mac_out.append(&mut session.mac_queue);
        let window = WindowParams::from_settings(&session.settings, &self.config.timing);
        let must_answer = confirmed || uplink.fhdr.f_ctrl.adr_ack_req;
        let mac_len: usize = mac_out.iter().map(DownlinkCommand::encoded_len).sum();
        let mut with_data = mac_len <= MAX_FOPTS_LEN && !session.data_queue.is_empty();
        if mac_len > MAX_FOPTS_LEN && !session.data_queue.is_empty() {
            debug!(mac_len, "MAC commands on FPort 0, application data deferred");
        }
        let mut deferred = Vec::new();
        let f_cnt = session.fcnt_down;

        let downlink = loop {
            if !must_answer && mac_out.is_empty() && !with_data {
                break None;
            }
            let application = session.data_queue.front().filter(|_| with_data);
            let phy_payload = DataDownlink {
                dev_addr: uplink.fhdr.dev_addr,
                f_cnt,
                confirmed: application.is_some_and(|a| a.confirmed),
                ack: confirmed,
                f_pending: session.data_queue.len() > usize::from(with_data),
                adr: uplink.fhdr.f_ctrl.adr,
                mac_commands: &mac_out,
                application: application.map(|a| (a.f_port, a.payload.as_slice())),
            }
            .encode(keys)?;

            let len = phy_payload.len() - MHDR_SIZE - MIC_SIZE;
            let (downlink, data_rate_index) = self.schedule(phy_payload, meta, &window)?;
            let max = self.region.max_payload_size(data_rate_index);
            if len <= max {
                break Some(downlink);
            }
            if with_data {
                debug!(len, max, "application data deferred, frame too large");
                with_data = false;
            } else if let Some(command) = mac_out.pop() {
                deferred.insert(0, command);
            } else {
                return Err(ServerError::PayloadTooLarge { len, max });
            }
        };

        if !deferred.is_empty() {
            warn!(
                dev_addr = %uplink.fhdr.dev_addr,
                deferred = deferred.len(),
                "MAC commands do not fit the downlink, kept for the next one"
            );
        }
        session.mac_queue = deferred;
        let Some(downlink) = downlink else {
            return Ok(None);
        };

        if with_data {
            session.data_queue.pop_front();
        }
        session.next_fcnt_down();
        session
            .pending_mac
            .extend(mac_out.iter().filter(|c| c.expects_answer()).copied());
        debug!(
            dev_addr = %uplink.fhdr.dev_addr,
            f_cnt,
            mac_commands = mac_out.len(),
            "data downlink built"
        );
        Ok(Some(downlink))
    }

    /// Pick the receive window and fill in the transmit parameters
    ///
    /// Also returns the data rate index of the chosen window. An uplink data
    /// rate the region does not define leaves RX2 as the only window.
    fn schedule(
        &self,
        phy_payload: Vec<u8>,
        meta: &UplinkMeta,
        params: &WindowParams,
    ) -> Result<(Downlink, u8), ServerError> {
        let rx1 = self.region.data_rate_index(meta.data_rate).and_then(|index| {
            let rx1_index = self.region.rx1_data_rate(index, params.rx1_dr_offset);
            self.region.data_rate(rx1_index).map(|dr| (rx1_index, dr))
        });
        let rx2 = self
            .region
            .data_rate(params.rx2_data_rate)
            .map(|dr| (params.rx2_data_rate, dr))
            .ok_or(ServerError::InvalidDataRateIndex(params.rx2_data_rate))?;

        let (_, airtime_dr) = rx1.unwrap_or(rx2);
        let tx_us = airtime_dr.time_on_air_us(phy_payload.len(), DOWNLINK_CODING_RATE, false);
        let mut window = meta.timing.plan(params.rx1_delay, params.rx2_delay, tx_us);
        let (frequency, (index, data_rate)) = match (window.chosen, rx1) {
            (RxWindow::Rx1, Some(rx1)) => (self.region.rx1_frequency(meta.frequency), rx1),
            _ => {
                window.chosen = RxWindow::Rx2;
                (params.rx2_frequency, rx2)
            }
        };

        let txpk = TxPk::new(&phy_payload, window.tmst(), frequency, data_rate, &self.config);
        Ok((
            Downlink {
                phy_payload,
                window,
                txpk,
            },
            index,
        ))
    }

    /// Queue a MAC command for the device's next downlink
    pub fn enqueue_mac_command(
        &self,
        dev_eui: &Eui64,
        command: DownlinkCommand,
    ) -> Result<(), ServerError> {
        self.store.update_session(dev_eui, |session| {
            session.mac_queue.push(command);
            Ok(())
        })
    }

    /// Queue application data for the device's next downlink
    pub fn queue_application_data(
        &self,
        dev_eui: &Eui64,
        f_port: u8,
        payload: Vec<u8>,
        confirmed: bool,
    ) -> Result<(), ServerError> {
        if !(1..=MAX_APP_F_PORT).contains(&f_port) {
            return Err(ServerError::InvalidFPort(f_port));
        }
        self.store.update_session(dev_eui, |session| {
            session.data_queue.push_back(QueuedData {
                f_port,
                payload,
                confirmed,
            });
            Ok(())
        })
    }

    /// Forget a device's session so its next join starts from defaults
    pub fn disconnect(&self, dev_eui: &Eui64) -> Result<Option<DeviceSession>, ServerError> {
        let removed = self.store.remove_session(dev_eui)?;
        if removed.is_some() {
            info!(%dev_eui, "session purged");
        }
        Ok(removed)
    }
}
