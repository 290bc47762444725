//! Over-the-air activation
//!
//! A [`JoinProcedure`] walks one Join-Request through
//! `AwaitingJoinRequest -> Validating -> {Rejected | SessionEstablished}`:
//! - [`JoinProcedure::validate`] checks the frame type and the AppKey MIC
//! - [`JoinProcedure::establish`] enforces DevNonce uniqueness, derives the
//!   session keys, resets the session and builds the Join-Accept
//!
//! The procedure only touches the [`DeviceSession`] it is handed; callers run
//! `establish` inside a store update so the nonce check and the session reset
//! commit together.

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::device::{AesKey, DevAddr, DeviceConfig};
use crate::config::network::NetworkConfig;
use crate::crypto::{self, CryptoError, SessionKeys};
use crate::device::{DeviceSession, DeviceSettings};
use crate::lorawan::mac::{DevNonce, Frame, JoinRequestPayload, MType, MacPayload, Mhdr};

/// Join-Accept plaintext length without CFList
pub const JOIN_ACCEPT_LEN: usize = 12;

/// CFList length
pub const CF_LIST_LEN: usize = 16;

/// Join failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JoinError {
    /// MIC or key failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// DevNonce seen before for this device
    #[error("replayed DevNonce {0}")]
    ReplayedDevNonce(DevNonce),
    /// Frame type does not fit the step
    #[error("unexpected message type {0:?}")]
    UnexpectedMType(MType),
    /// Step called out of order
    #[error("join procedure is {0:?}")]
    InvalidState(JoinState),
}

/// Join procedure states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    /// Nothing received yet
    AwaitingJoinRequest,
    /// MIC verified, session not yet established
    Validating,
    /// Request refused
    Rejected,
    /// Keys derived and Join-Accept built
    SessionEstablished,
}

/// DLSettings byte of a Join-Accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DlSettings {
    /// RX1 data rate offset (3 bits)
    pub rx1_dr_offset: u8,
    /// RX2 data rate (4 bits)
    pub rx2_data_rate: u8,
}

impl DlSettings {
    /// Pack into the DLSettings byte
    pub fn to_byte(self) -> u8 {
        (self.rx1_dr_offset & 0x07) << 4 | (self.rx2_data_rate & 0x0F)
    }

    /// Unpack a DLSettings byte
    pub fn from_byte(byte: u8) -> Self {
        Self {
            rx1_dr_offset: (byte >> 4) & 0x07,
            rx2_data_rate: byte & 0x0F,
        }
    }
}

/// Encode up to five channel frequencies (Hz) as a CFList
///
/// Each frequency takes 3 little-endian bytes in units of 100 Hz; unused
/// slots stay zero and the last byte is RFU.
pub fn encode_cf_list(frequencies: &[u32]) -> [u8; CF_LIST_LEN] {
    let mut cf_list = [0u8; CF_LIST_LEN];
    for (slot, freq) in cf_list[..15].chunks_mut(3).zip(frequencies) {
        slot.copy_from_slice(&(freq / 100).to_le_bytes()[..3]);
    }
    cf_list
}

/// Join-Accept fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinAcceptParams {
    /// Server nonce
    pub app_nonce: [u8; 3],
    /// Network identifier, little-endian
    pub net_id: [u8; 3],
    /// Address assigned to the device
    pub dev_addr: DevAddr,
    /// Downlink settings
    pub dl_settings: DlSettings,
    /// RX1 delay in seconds (1..=15)
    pub rx_delay: u8,
    /// Extra channels, if any
    pub cf_list: Option<[u8; CF_LIST_LEN]>,
}

impl JoinAcceptParams {
    /// Plaintext Join-Accept payload (12 or 28 bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(JOIN_ACCEPT_LEN + CF_LIST_LEN);
        out.extend_from_slice(&self.app_nonce);
        out.extend_from_slice(&self.net_id);
        out.extend_from_slice(&self.dev_addr.to_le_bytes());
        out.push(self.dl_settings.to_byte());
        out.push(self.rx_delay & 0x0F);
        if let Some(cf_list) = &self.cf_list {
            out.extend_from_slice(cf_list);
        }
        out
    }
}

/// Build a Join-Accept PHYPayload: `MHDR | Encrypted(payload) | MIC`
pub fn build_join_accept(app_key: &AesKey, params: &JoinAcceptParams) -> Vec<u8> {
    let mhdr = Mhdr::new(MType::JoinAccept).to_byte();
    let encrypted = crypto::encrypt_join_accept(app_key, &params.to_bytes());
    let mic = crypto::compute_join_accept_mic(app_key, mhdr, &encrypted);

    let mut out = Vec::with_capacity(1 + encrypted.len() + mic.len());
    out.push(mhdr);
    out.extend_from_slice(&encrypted);
    out.extend_from_slice(&mic);
    out
}

/// Verify the MIC of a Join-Accept frame
pub fn verify_join_accept(app_key: &AesKey, frame: &Frame) -> Result<(), JoinError> {
    let MacPayload::JoinAccept(encrypted) = &frame.payload else {
        return Err(JoinError::UnexpectedMType(frame.mhdr.mtype));
    };
    let computed = crypto::compute_join_accept_mic(app_key, frame.mhdr.to_byte(), encrypted);
    if computed != frame.mic {
        return Err(CryptoError::InvalidMic {
            received: frame.mic,
            computed,
        }
        .into());
    }
    Ok(())
}

/// Random 24-bit AppNonce
pub fn random_app_nonce() -> [u8; 3] {
    let mut app_nonce = [0u8; 3];
    rand::thread_rng().fill(&mut app_nonce[..]);
    app_nonce
}

/// Result of a successful join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAccept {
    /// Join-Accept PHYPayload
    pub phy_payload: Vec<u8>,
    /// Assigned address
    pub dev_addr: DevAddr,
    /// Derived session keys
    pub keys: SessionKeys,
}

/// One Join-Request on its way through validation and session setup
#[derive(Debug)]
pub struct JoinProcedure<'a> {
    config: &'a NetworkConfig,
    device: &'a DeviceConfig,
    state: JoinState,
    request: Option<JoinRequestPayload>,
}

impl<'a> JoinProcedure<'a> {
    /// Start a procedure for a provisioned device
    pub fn new(config: &'a NetworkConfig, device: &'a DeviceConfig) -> Self {
        Self {
            config,
            device,
            state: JoinState::AwaitingJoinRequest,
            request: None,
        }
    }

    /// Current state
    pub fn state(&self) -> JoinState {
        self.state
    }

    fn reject<E: Into<JoinError>>(&mut self, err: E) -> JoinError {
        self.state = JoinState::Rejected;
        err.into()
    }

    /// Check frame type and MIC
    pub fn validate(&mut self, frame: &Frame) -> Result<JoinRequestPayload, JoinError> {
        if self.state != JoinState::AwaitingJoinRequest {
            return Err(JoinError::InvalidState(self.state));
        }
        self.state = JoinState::Validating;

        let MacPayload::JoinRequest(request) = frame.payload else {
            return Err(self.reject(JoinError::UnexpectedMType(frame.mhdr.mtype)));
        };

        let signed = frame.signed_bytes();
        let app_key = &self.device.app_key;
        if let Err(err) = crypto::check_join_request_mic(app_key, &signed, &frame.mic) {
            warn!(dev_eui = %request.dev_eui, "join-request MIC mismatch");
            return Err(self.reject(err));
        }

        debug!(dev_eui = %request.dev_eui, dev_nonce = %request.dev_nonce, "join-request MIC ok");
        self.request = Some(request);
        Ok(request)
    }

    /// Enforce DevNonce uniqueness and install the new session
    ///
    /// On `ReplayedDevNonce` the session is left untouched.
    pub fn establish(
        &mut self,
        session: &mut DeviceSession,
        dev_addr: DevAddr,
        app_nonce: [u8; 3],
    ) -> Result<JoinAccept, JoinError> {
        let request = match (self.state, self.request) {
            (JoinState::Validating, Some(request)) => request,
            _ => return Err(JoinError::InvalidState(self.state)),
        };

        if session.used_dev_nonces.contains(&request.dev_nonce) {
            warn!(dev_eui = %request.dev_eui, dev_nonce = %request.dev_nonce, "replayed DevNonce");
            return Err(self.reject(JoinError::ReplayedDevNonce(request.dev_nonce)));
        }
        session.used_dev_nonces.insert(request.dev_nonce);

        let net_id = self.config.net_id_bytes();
        let keys = crypto::derive_session_keys(
            &self.device.app_key,
            &app_nonce,
            &net_id,
            &request.dev_nonce.0,
        );
        session.app_eui = request.app_eui;
        session.establish(dev_addr, keys, DeviceSettings::from_network(self.config));

        let params = JoinAcceptParams {
            app_nonce,
            net_id,
            dev_addr,
            dl_settings: DlSettings {
                rx1_dr_offset: self.config.rx1_dr_offset,
                rx2_data_rate: self.config.rx2_data_rate,
            },
            rx_delay: self.config.timing.rx1_delay,
            cf_list: (!self.config.cf_list.is_empty())
                .then(|| encode_cf_list(&self.config.cf_list)),
        };
        let phy_payload = build_join_accept(&self.device.app_key, &params);

        self.state = JoinState::SessionEstablished;
        Ok(JoinAccept {
            phy_payload,
            dev_addr,
            keys,
        })
    }
}
