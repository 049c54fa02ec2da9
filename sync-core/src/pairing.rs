//! Pairing payloads for clipmesh.
//!
//! This module provides:
//! - One-shot six-digit pairing tokens
//! - The payload one device shows (as QR code or text) so another can
//!   pair with it: its [`SyncInfo`] plus a token
//!
//! The payload flow:
//! 1. Device A generates a token and encodes its sync info with it
//! 2. Device B decodes the payload, adds A as a peer and caches the token
//! 3. B's resolver submits the token when A shows up as UNVERIFIED
//!
//! Encoding: `JSON({version, syncInfo, token})`, rotated left by the salt
//! sum, XORed with the 4-byte salt, prefixed with the salt, then URL-safe
//! base64 without padding. The transform only keeps casual readers from
//! seeing addresses in the payload; it is not encryption.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use sync_types::SyncInfo;
use thiserror::Error;

/// Current payload format version.
pub const PAYLOAD_VERSION: u32 = 1;

const SALT_LEN: usize = 4;
const TOKEN_LIMIT: u32 = 1_000_000;
// Largest multiple of TOKEN_LIMIT that fits a u32; samples at or above it
// are drawn again so every code is equally likely.
const SAMPLE_LIMIT: u32 = (u32::MAX / TOKEN_LIMIT) * TOKEN_LIMIT;

/// Error type for pairing operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    /// The payload is invalid (bad base64, too short, or bad JSON).
    #[error("invalid pairing payload: {0}")]
    InvalidPayload(String),
    /// Version mismatch.
    #[error("unsupported pairing payload version: {0}")]
    UnsupportedVersion(u32),
    /// The token is not a six-digit code.
    #[error("invalid pairing token: {0}")]
    InvalidToken(String),
    /// The OS random source failed.
    #[error("random source unavailable: {0}")]
    RandomUnavailable(String),
}

/// A six-digit one-shot pairing code (`000000`..=`999999`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct PairingToken(u32);

impl PairingToken {
    /// Generate a fresh token from the OS random source.
    pub fn generate() -> Result<Self, PairingError> {
        loop {
            let mut bytes = [0u8; 4];
            getrandom::getrandom(&mut bytes)
                .map_err(|e| PairingError::RandomUnavailable(e.to_string()))?;
            if let Some(code) = code_from_sample(u32::from_le_bytes(bytes)) {
                return Ok(Self(code));
            }
        }
    }

    /// Wrap a numeric code.
    pub fn new(code: u32) -> Result<Self, PairingError> {
        if code >= TOKEN_LIMIT {
            return Err(PairingError::InvalidToken(format!(
                "{} has more than six digits",
                code
            )));
        }
        Ok(Self(code))
    }

    /// The numeric value.
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for PairingToken {
    type Error = PairingError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Self::new(code)
    }
}

impl From<PairingToken> for u32 {
    fn from(token: PairingToken) -> Self {
        token.0
    }
}

impl FromStr for PairingToken {
    type Err = PairingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 6 || !s.chars().all(|c| c.is_ascii_digit()) {
            return Err(PairingError::InvalidToken("expected six digits".into()));
        }
        let code = s
            .parse()
            .map_err(|_| PairingError::InvalidToken("expected six digits".into()))?;
        Self::new(code)
    }
}

impl fmt::Display for PairingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

// Opaque so tokens never end up in logs
impl fmt::Debug for PairingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PairingToken([REDACTED])")
    }
}

/// What a device shows so another device can pair with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncInfoPayload {
    /// The announcing device.
    pub sync_info: SyncInfo,
    /// Token the other side should present when trusting.
    pub token: PairingToken,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePayload {
    version: u32,
    sync_info: SyncInfo,
    token: PairingToken,
}

impl SyncInfoPayload {
    /// Bundle sync info with a token.
    pub fn new(sync_info: SyncInfo, token: PairingToken) -> Self {
        Self { sync_info, token }
    }

    /// Encode with a fresh random salt.
    pub fn encode(&self) -> Result<String, PairingError> {
        let mut salt = [0u8; SALT_LEN];
        getrandom::getrandom(&mut salt)
            .map_err(|e| PairingError::RandomUnavailable(e.to_string()))?;
        self.encode_with_salt(salt)
    }

    /// Encode with a caller-chosen salt (deterministic output).
    pub fn encode_with_salt(&self, salt: [u8; SALT_LEN]) -> Result<String, PairingError> {
        let wire = WirePayload {
            version: PAYLOAD_VERSION,
            sync_info: self.sync_info.clone(),
            token: self.token,
        };
        let mut body = serde_json::to_vec(&wire)
            .map_err(|e| PairingError::InvalidPayload(format!("json encode: {}", e)))?;

        let shift = salt_shift(&salt, body.len());
        body.rotate_left(shift);
        xor_with_salt(&mut body, &salt);

        let mut out = Vec::with_capacity(SALT_LEN + body.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&body);
        Ok(URL_SAFE_NO_PAD.encode(out))
    }

    /// Decode a payload produced by [`encode`](Self::encode).
    pub fn decode(payload: &str) -> Result<Self, PairingError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim())
            .map_err(|e| PairingError::InvalidPayload(format!("base64 decode: {}", e)))?;

        if bytes.len() <= SALT_LEN {
            return Err(PairingError::InvalidPayload(format!(
                "payload too short: {} bytes",
                bytes.len()
            )));
        }

        let (salt_bytes, body) = bytes.split_at(SALT_LEN);
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(salt_bytes);

        let mut body = body.to_vec();
        xor_with_salt(&mut body, &salt);
        let shift = salt_shift(&salt, body.len());
        body.rotate_right(shift);

        let wire: WirePayload = serde_json::from_slice(&body)
            .map_err(|e| PairingError::InvalidPayload(format!("json parse: {}", e)))?;

        if wire.version != PAYLOAD_VERSION {
            return Err(PairingError::UnsupportedVersion(wire.version));
        }

        Ok(Self {
            sync_info: wire.sync_info,
            token: wire.token,
        })
    }
}

fn code_from_sample(sample: u32) -> Option<u32> {
    (sample < SAMPLE_LIMIT).then_some(sample % TOKEN_LIMIT)
}

fn salt_shift(salt: &[u8; SALT_LEN], len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let sum: usize = salt.iter().map(|b| *b as usize).sum();
    sum % len
}

fn xor_with_salt(body: &mut [u8], salt: &[u8; SALT_LEN]) {
    for (i, byte) in body.iter_mut().enumerate() {
        *byte ^= salt[i % SALT_LEN];
    }
}
