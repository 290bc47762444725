//! LoRaWAN cryptographic operations
//!
//! This module provides cryptographic functions for LoRaWAN 1.0.x security:
//! - Message Integrity Code (MIC) computation and verification
//! - FRMPayload encryption/decryption
//! - Join-Accept payload encryption
//! - Session key derivation
//!
//! All functions are pure and allocation-light; key length is enforced by
//! [`AesKey`], so only key construction can fail with
//! [`CryptoError::InvalidKeyMaterial`].

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use thiserror::Error;

use crate::config::device::{AesKey, DevAddr};

/// MIC size in bytes
pub const MIC_SIZE: usize = 4;

/// Block size for AES-128
const BLOCK_SIZE: usize = 16;

/// Four-byte Message Integrity Code
pub type Mic = [u8; MIC_SIZE];

/// Cryptographic failure
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material is not exactly 16 bytes
    #[error("invalid key material: expected 16 bytes, got {len}")]
    InvalidKeyMaterial {
        /// Length that was supplied
        len: usize,
    },
    /// Recomputed MIC differs from the received one
    #[error("MIC mismatch: received {received:02X?}, computed {computed:02X?}")]
    InvalidMic {
        /// MIC carried by the frame
        received: Mic,
        /// MIC recomputed locally
        computed: Mic,
    },
}

/// Direction identifiers for cryptographic operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Uplink (device to network)
    Up = 0,
    /// Downlink (network to device)
    Down = 1,
}

/// Session keys derived from a successful join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionKeys {
    /// Network session key (MIC, FPort 0 payloads)
    pub nwk_skey: AesKey,
    /// Application session key (FPort > 0 payloads)
    pub app_skey: AesKey,
}

fn cipher(key: &AesKey) -> Aes128 {
    Aes128::new(GenericArray::from_slice(key.as_bytes()))
}

fn cmac(key: &AesKey, parts: &[&[u8]]) -> [u8; BLOCK_SIZE] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key.as_bytes()));
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

fn truncate_mic(full: &[u8; BLOCK_SIZE]) -> Mic {
    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&full[..MIC_SIZE]);
    mic
}

/// Build the 16-byte B0 block prefixed to data-frame MIC input
pub fn b0_block(dev_addr: DevAddr, fcnt: u32, dir: Direction, msg_len: usize) -> [u8; BLOCK_SIZE] {
    let mut b0 = [0u8; BLOCK_SIZE];
    b0[0] = 0x49;
    b0[5] = dir as u8;
    b0[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    b0[10..14].copy_from_slice(&fcnt.to_le_bytes());
    b0[15] = msg_len as u8;
    b0
}

/// Build the A block used as AES input for FRMPayload keystream block `index`
pub fn a_block(dev_addr: DevAddr, fcnt: u32, dir: Direction, index: u8) -> [u8; BLOCK_SIZE] {
    let mut a = [0u8; BLOCK_SIZE];
    a[0] = 0x01;
    a[5] = dir as u8;
    a[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    a[10..14].copy_from_slice(&fcnt.to_le_bytes());
    a[15] = index;
    a
}

/// Compute the MIC of a data frame
///
/// # Arguments
/// * `key` - NwkSKey
/// * `dev_addr` - Device address
/// * `fcnt` - Frame counter, zero-extended to 32 bits
/// * `dir` - Message direction
/// * `mhdr` - MAC header byte
/// * `mac_payload` - Serialized MACPayload
pub fn compute_mic(
    key: &AesKey,
    dev_addr: DevAddr,
    fcnt: u32,
    dir: Direction,
    mhdr: u8,
    mac_payload: &[u8],
) -> Mic {
    let b0 = b0_block(dev_addr, fcnt, dir, 1 + mac_payload.len());
    truncate_mic(&cmac(key, &[&b0, &[mhdr], mac_payload]))
}

/// Verify the MIC of a data frame, returning `true` on a byte-exact match
pub fn verify_mic(
    key: &AesKey,
    dev_addr: DevAddr,
    fcnt: u32,
    dir: Direction,
    mhdr: u8,
    mac_payload: &[u8],
    mic: &Mic,
) -> bool {
    check_mic(key, dev_addr, fcnt, dir, mhdr, mac_payload, mic).is_ok()
}

/// Verify the MIC of a data frame, reporting a mismatch as [`CryptoError::InvalidMic`]
pub fn check_mic(
    key: &AesKey,
    dev_addr: DevAddr,
    fcnt: u32,
    dir: Direction,
    mhdr: u8,
    mac_payload: &[u8],
    mic: &Mic,
) -> Result<(), CryptoError> {
    let computed = compute_mic(key, dev_addr, fcnt, dir, mhdr, mac_payload);
    if &computed == mic {
        Ok(())
    } else {
        Err(CryptoError::InvalidMic {
            received: *mic,
            computed,
        })
    }
}

/// Compute the MIC of a Join-Request over `MHDR ‖ MACPayload` (no B0 block)
pub fn compute_join_request_mic(app_key: &AesKey, msg: &[u8]) -> Mic {
    truncate_mic(&cmac(app_key, &[msg]))
}

/// Verify the MIC of a Join-Request
pub fn check_join_request_mic(app_key: &AesKey, msg: &[u8], mic: &Mic) -> Result<(), CryptoError> {
    let computed = compute_join_request_mic(app_key, msg);
    if &computed == mic {
        Ok(())
    } else {
        Err(CryptoError::InvalidMic {
            received: *mic,
            computed,
        })
    }
}

/// Compute the MIC of a Join-Accept over `MHDR ‖ EncryptedPayload`
pub fn compute_join_accept_mic(app_key: &AesKey, mhdr: u8, encrypted_payload: &[u8]) -> Mic {
    truncate_mic(&cmac(app_key, &[&[mhdr], encrypted_payload]))
}

/// Pick the key protecting FRMPayload: NwkSKey on FPort 0, AppSKey otherwise
pub fn payload_key<'a>(f_port: u8, nwk_skey: &'a AesKey, app_skey: &'a AesKey) -> &'a AesKey {
    if f_port == 0 {
        nwk_skey
    } else {
        app_skey
    }
}

/// Encrypt or decrypt FRMPayload with the LoRaWAN counter-mode keystream
///
/// The transform is its own inverse; `dir` only changes the A blocks.
///
/// # Arguments
/// * `key` - AES key for encryption/decryption
/// * `dev_addr` - Device address
/// * `fcnt` - Frame counter
/// * `dir` - Message direction
/// * `payload` - Data to encrypt/decrypt
pub fn encrypt_frm_payload(
    key: &AesKey,
    dev_addr: DevAddr,
    fcnt: u32,
    dir: Direction,
    payload: &[u8],
) -> Vec<u8> {
    let cipher = cipher(key);
    let mut result = Vec::with_capacity(payload.len());

    for (i, chunk) in payload.chunks(BLOCK_SIZE).enumerate() {
        // Block indices are 1-based.
        let mut s = a_block(dev_addr, fcnt, dir, (i + 1) as u8);
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut s));
        result.extend(chunk.iter().zip(s.iter()).map(|(p, k)| p ^ k));
    }

    result
}

/// Inverse of [`encrypt_frm_payload`]; provided for readability at call sites
pub fn decrypt_frm_payload(
    key: &AesKey,
    dev_addr: DevAddr,
    fcnt: u32,
    dir: Direction,
    payload: &[u8],
) -> Vec<u8> {
    encrypt_frm_payload(key, dev_addr, fcnt, dir, payload)
}

fn reversed_blocks(data: &[u8]) -> Vec<u8> {
    let padded_len = data.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    let mut buf: Vec<u8> = data.iter().rev().copied().collect();
    buf.resize(padded_len, 0);
    buf
}

/// Encrypt a Join-Accept payload
///
/// The plaintext is byte-reversed, zero-padded to a block boundary, encrypted
/// block by block with AES-ECB under the AppKey, reversed again and cut back to
/// the plaintext length.
pub fn encrypt_join_accept(app_key: &AesKey, plaintext: &[u8]) -> Vec<u8> {
    let cipher = cipher(app_key);
    let mut buf = reversed_blocks(plaintext);
    for block in buf.chunks_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    buf.reverse();
    buf.truncate(plaintext.len());
    buf
}

/// Mirror of [`encrypt_join_accept`]
///
/// Recovers the plaintext exactly when its length is a multiple of 16 bytes;
/// for other lengths the truncated tail of the last cipher block is gone.
pub fn decrypt_join_accept(app_key: &AesKey, ciphertext: &[u8]) -> Vec<u8> {
    let cipher = cipher(app_key);
    let mut buf = reversed_blocks(ciphertext);
    for block in buf.chunks_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
    buf.reverse();
    buf.truncate(ciphertext.len());
    buf
}

/// Derive network and application session keys after a join
///
/// # Arguments
/// * `app_key` - Application key
/// * `app_nonce` - AppNonce, 3 wire bytes
/// * `net_id` - NetID, 3 wire bytes
/// * `dev_nonce` - DevNonce, 2 wire bytes
pub fn derive_session_keys(
    app_key: &AesKey,
    app_nonce: &[u8; 3],
    net_id: &[u8; 3],
    dev_nonce: &[u8; 2],
) -> SessionKeys {
    let cipher = cipher(app_key);
    let derive = |key_type: u8| {
        let mut block = [0u8; BLOCK_SIZE];
        block[0] = key_type;
        block[1..4].copy_from_slice(app_nonce);
        block[4..7].copy_from_slice(net_id);
        block[7..9].copy_from_slice(dev_nonce);
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
        AesKey::new(block)
    };

    SessionKeys {
        nwk_skey: derive(0x01),
        app_skey: derive(0x02),
    }
}
