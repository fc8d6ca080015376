//! # Property Store
//!
//! Process-global configuration the protocol engine reads at session open
//! and writes back at session close: byte counters, transmit intervals,
//! quotas, encoding bitmap, motion intervals, identifiers. The store also
//! answers the wire-level GET/SET property packets, so every key carries a
//! wire type and an access mode.
//!
//! Persistence is a `key=value` text file plus a binary cache snapshot;
//! the engine does not interpret either beyond load/save.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::codec::{decode_int, encode_int};
use crate::defaults;
use crate::packet::ENCODING_REQUIRED_MASK;

// ----------------------------------------------------------------------------
// keys

/// Property keys, grouped by family: 0xF1xx state, 0xF3xx communication,
/// 0xF7xx motion, 0xF8xx geozone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PropKey {
    StateUniqueId = 0xF131,
    StateAccountId = 0xF132,
    StateDeviceId = 0xF133,

    CommSpeakFirst = 0xF303,
    CommFirstBrief = 0xF304,
    CommMaxConnections = 0xF311,
    CommMinXmitDelay = 0xF312,
    CommMinXmitRate = 0xF313,
    CommMaxXmitRate = 0xF315,
    CommMaxDuplexEvents = 0xF317,
    CommMaxSimplexEvents = 0xF318,
    CommEncodings = 0xF321,
    CommCustomFormats = 0xF326,
    CommBytesRead = 0xF331,
    CommBytesWritten = 0xF332,

    MotionStart = 0xF711,
    MotionInMotion = 0xF713,
    MotionDormantInterval = 0xF716,

    GeozoneVersion = 0xF890,
}

impl PropKey {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        use PropKey::*;
        Some(match code {
            0xF131 => StateUniqueId,
            0xF132 => StateAccountId,
            0xF133 => StateDeviceId,
            0xF303 => CommSpeakFirst,
            0xF304 => CommFirstBrief,
            0xF311 => CommMaxConnections,
            0xF312 => CommMinXmitDelay,
            0xF313 => CommMinXmitRate,
            0xF315 => CommMaxXmitRate,
            0xF317 => CommMaxDuplexEvents,
            0xF318 => CommMaxSimplexEvents,
            0xF321 => CommEncodings,
            0xF326 => CommCustomFormats,
            0xF331 => CommBytesRead,
            0xF332 => CommBytesWritten,
            0xF711 => MotionStart,
            0xF713 => MotionInMotion,
            0xF716 => MotionDormantInterval,
            0xF890 => GeozoneVersion,
            _ => return None,
        })
    }

    /// Wire access mode. Identity keys are set locally, never by the server.
    fn read_only(self) -> bool {
        matches!(
            self,
            PropKey::StateUniqueId | PropKey::StateAccountId | PropKey::StateDeviceId
        )
    }
}

/// A stored property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropValue {
    U32(u32),
    U32Array(Vec<u32>),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
}

/// Property access failures, mapped by the session layer onto the
/// corresponding wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropError {
    InvalidKey,
    ReadOnly,
    WriteOnly,
    InvalidValue,
}

// ----------------------------------------------------------------------------

/// The process-global property store. All access goes through its own lock.
#[derive(Debug, Default)]
pub struct PropertyStore {
    values: RwLock<HashMap<u16, PropValue>>,
}

impl PropertyStore {
    /// A store populated with the protocol defaults.
    pub fn new() -> Self {
        let store = PropertyStore::default();
        {
            let mut v = store.values.write();
            v.insert(
                PropKey::CommMaxConnections.code(),
                PropValue::U32Array(vec![
                    defaults::MAX_TOTAL_CONNECTIONS,
                    defaults::MAX_DUPLEX_CONNECTIONS,
                    defaults::CONNECTION_WINDOW_MINUTES,
                ]),
            );
            v.insert(PropKey::CommMinXmitDelay.code(), PropValue::U32(0));
            v.insert(PropKey::CommMinXmitRate.code(), PropValue::U32(0));
            v.insert(
                PropKey::CommMaxXmitRate.code(),
                PropValue::U32(defaults::MAX_XMIT_RATE_SEC),
            );
            v.insert(
                PropKey::CommMaxDuplexEvents.code(),
                PropValue::U32(defaults::DEFAULT_DUPLEX_MAX_EVENTS),
            );
            v.insert(
                PropKey::CommMaxSimplexEvents.code(),
                PropValue::U32(defaults::DEFAULT_SIMPLEX_MAX_EVENTS),
            );
            v.insert(
                PropKey::CommEncodings.code(),
                PropValue::U32(ENCODING_REQUIRED_MASK | crate::packet::Encoding::Csv.mask()),
            );
            v.insert(PropKey::CommCustomFormats.code(), PropValue::Bool(true));
            v.insert(PropKey::CommBytesRead.code(), PropValue::U32(0));
            v.insert(PropKey::CommBytesWritten.code(), PropValue::U32(0));
            v.insert(PropKey::CommSpeakFirst.code(), PropValue::Bool(true));
            v.insert(PropKey::CommFirstBrief.code(), PropValue::Bool(false));
            v.insert(PropKey::MotionStart.code(), PropValue::U32(0));
            v.insert(PropKey::MotionInMotion.code(), PropValue::U32(0));
            v.insert(PropKey::MotionDormantInterval.code(), PropValue::U32(0));
            v.insert(PropKey::GeozoneVersion.code(), PropValue::U32(0));
            v.insert(PropKey::StateUniqueId.code(), PropValue::Bytes(Vec::new()));
            v.insert(PropKey::StateAccountId.code(), PropValue::Text(String::new()));
            v.insert(PropKey::StateDeviceId.code(), PropValue::Text(String::new()));
        }
        store
    }

    // ------------------------------------------------------------------
    // typed access

    pub fn get_u32(&self, key: PropKey, dft: u32) -> u32 {
        match self.values.read().get(&key.code()) {
            Some(PropValue::U32(v)) => *v,
            Some(PropValue::Bool(b)) => *b as u32,
            _ => dft,
        }
    }

    pub fn set_u32(&self, key: PropKey, val: u32) {
        self.values.write().insert(key.code(), PropValue::U32(val));
    }

    /// Add to a numeric property (the doubling of a value is an add of
    /// itself).
    pub fn add_u32(&self, key: PropKey, delta: u32) {
        let cur = self.get_u32(key, 0);
        self.set_u32(key, cur.saturating_add(delta));
    }

    pub fn get_bool(&self, key: PropKey, dft: bool) -> bool {
        match self.values.read().get(&key.code()) {
            Some(PropValue::Bool(b)) => *b,
            Some(PropValue::U32(v)) => *v != 0,
            _ => dft,
        }
    }

    pub fn set_bool(&self, key: PropKey, val: bool) {
        self.values.write().insert(key.code(), PropValue::Bool(val));
    }

    pub fn get_u32_array(&self, key: PropKey) -> Vec<u32> {
        match self.values.read().get(&key.code()) {
            Some(PropValue::U32Array(v)) => v.clone(),
            Some(PropValue::U32(v)) => vec![*v],
            _ => Vec::new(),
        }
    }

    pub fn get_string(&self, key: PropKey, dft: &str) -> String {
        match self.values.read().get(&key.code()) {
            Some(PropValue::Text(s)) => s.clone(),
            _ => dft.to_string(),
        }
    }

    pub fn set_string(&self, key: PropKey, val: &str) {
        self.values
            .write()
            .insert(key.code(), PropValue::Text(val.to_string()));
    }

    pub fn get_bytes(&self, key: PropKey) -> Vec<u8> {
        match self.values.read().get(&key.code()) {
            Some(PropValue::Bytes(b)) => b.clone(),
            _ => Vec::new(),
        }
    }

    pub fn set_bytes(&self, key: PropKey, val: Vec<u8>) {
        self.values.write().insert(key.code(), PropValue::Bytes(val));
    }

    // ------------------------------------------------------------------
    // wire access (GET/SET property packets)

    /// Render a property for a property-value packet payload.
    pub fn get_wire(&self, code: u16) -> Result<Vec<u8>, PropError> {
        PropKey::from_code(code).ok_or(PropError::InvalidKey)?;
        let values = self.values.read();
        let val = values.get(&code).ok_or(PropError::InvalidKey)?;
        Ok(match val {
            PropValue::U32(v) => {
                let mut buf = [0u8; 4];
                encode_int(&mut buf, *v, false);
                buf.to_vec()
            }
            PropValue::U32Array(arr) => {
                let mut out = Vec::with_capacity(arr.len() * 4);
                for v in arr {
                    let mut buf = [0u8; 4];
                    encode_int(&mut buf, *v, false);
                    out.extend_from_slice(&buf);
                }
                out
            }
            PropValue::Bool(b) => vec![*b as u8],
            PropValue::Text(s) => s.as_bytes().to_vec(),
            PropValue::Bytes(b) => b.clone(),
        })
    }

    /// Apply a server-supplied property value.
    pub fn set_wire(&self, code: u16, data: &[u8]) -> Result<(), PropError> {
        let key = PropKey::from_code(code).ok_or(PropError::InvalidKey)?;
        if key.read_only() {
            return Err(PropError::ReadOnly);
        }
        let mut values = self.values.write();
        let slot = values.get_mut(&code).ok_or(PropError::InvalidKey)?;
        match slot {
            PropValue::U32(v) => {
                if data.is_empty() || data.len() > 4 {
                    return Err(PropError::InvalidValue);
                }
                *v = decode_int(data, false);
            }
            PropValue::U32Array(arr) => {
                if data.is_empty() || data.len() % 4 != 0 {
                    return Err(PropError::InvalidValue);
                }
                *arr = data.chunks(4).map(|c| decode_int(c, false)).collect();
            }
            PropValue::Bool(b) => {
                if data.len() != 1 {
                    return Err(PropError::InvalidValue);
                }
                *b = data[0] != 0;
            }
            PropValue::Text(s) => {
                *s = String::from_utf8_lossy(data).into_owned();
            }
            PropValue::Bytes(b) => {
                *b = data.to_vec();
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // persistence

    /// Load `key=value` text, hex keys. Unknown keys and malformed lines are
    /// skipped with a log line rather than failing the whole load.
    pub fn load_file(&self, path: &Path) -> std::io::Result<()> {
        let file = std::fs::File::open(path)?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key_text, val_text)) = line.split_once('=') else {
                tracing::warn!("skipping malformed property line: {}", line);
                continue;
            };
            let key_text = key_text.trim().trim_start_matches("0x");
            let Ok(code) = u16::from_str_radix(key_text, 16) else {
                tracing::warn!("skipping property with bad key: {}", line);
                continue;
            };
            if PropKey::from_code(code).is_none() {
                tracing::warn!("skipping unknown property key 0x{:04X}", code);
                continue;
            }
            self.apply_text(code, val_text.trim());
        }
        Ok(())
    }

    fn apply_text(&self, code: u16, text: &str) {
        let mut values = self.values.write();
        let parsed = match values.get(&code) {
            Some(PropValue::U32(_)) | None => text.parse::<u32>().ok().map(PropValue::U32),
            Some(PropValue::U32Array(_)) => {
                let parts: Option<Vec<u32>> =
                    text.split(',').map(|p| p.trim().parse::<u32>().ok()).collect();
                parts.map(PropValue::U32Array)
            }
            Some(PropValue::Bool(_)) => match text {
                "true" | "1" => Some(PropValue::Bool(true)),
                "false" | "0" => Some(PropValue::Bool(false)),
                _ => None,
            },
            Some(PropValue::Text(_)) => Some(PropValue::Text(text.to_string())),
            Some(PropValue::Bytes(_)) => Some(PropValue::Bytes(
                crate::codec::ascii::decode_hex(text.trim_start_matches("0x").as_bytes()),
            )),
        };
        match parsed {
            Some(v) => {
                values.insert(code, v);
            }
            None => tracing::warn!("skipping property 0x{:04X} with bad value: {}", code, text),
        }
    }

    /// Save `key=value` text.
    pub fn save_file(&self, path: &Path) -> std::io::Result<()> {
        let mut out = std::fs::File::create(path)?;
        let values = self.values.read();
        let mut codes: Vec<&u16> = values.keys().collect();
        codes.sort();
        for code in codes {
            let text = match &values[code] {
                PropValue::U32(v) => v.to_string(),
                PropValue::U32Array(arr) => arr
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
                PropValue::Bool(b) => b.to_string(),
                PropValue::Text(s) => s.clone(),
                PropValue::Bytes(b) => format!("0x{}", crate::codec::ascii::encode_hex(b)),
            };
            writeln!(out, "0x{:04X}={}", code, text)?;
        }
        Ok(())
    }

    /// Binary cache snapshot (faster to reload than the text file).
    pub fn save_cache(&self, path: &Path) -> std::io::Result<()> {
        let values = self.values.read();
        let snapshot: Vec<(u16, PropValue)> =
            values.iter().map(|(k, v)| (*k, v.clone())).collect();
        let data = bincode::serialize(&snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, data)
    }

    pub fn load_cache(&self, path: &Path) -> std::io::Result<()> {
        let data = std::fs::read(path)?;
        let snapshot: Vec<(u16, PropValue)> = bincode::deserialize(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut values = self.values.write();
        for (code, val) in snapshot {
            values.insert(code, val);
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
