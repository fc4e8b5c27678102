//! CAN frame types
//!
//! Only classic CAN 2.0A frames are bridged: an 11-bit identifier and at most
//! eight payload bytes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{BridgeError, Result};

/// Largest standard (11-bit) identifier
pub const MAX_STANDARD_ID: u16 = 0x7FF;

/// CAN 2.0 payload limit
pub const MAX_PAYLOAD: usize = 8;

/// Standard 11-bit arbitration identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanId(u16);

impl CanId {
    /// Create an identifier, rejecting values above 0x7FF
    pub fn new(raw: u16) -> Result<Self> {
        if raw > MAX_STANDARD_ID {
            return Err(BridgeError::InvalidIdentifier(format!("0x{raw:X}")));
        }
        Ok(Self(raw))
    }

    /// Identifier from the low 11 bits of `raw`, for constants
    pub const fn masked(raw: u16) -> Self {
        Self(raw & MAX_STANDARD_ID)
    }

    /// Raw identifier value
    pub const fn raw(self) -> u16 {
        self.0
    }

    /// Parse control-plane text: `0x`-prefixed hexadecimal or plain decimal
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let parsed = match trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => trimmed.parse::<u32>(),
        };

        match parsed {
            Ok(value) if value <= u32::from(MAX_STANDARD_ID) => Ok(Self(value as u16)),
            _ => Err(BridgeError::InvalidIdentifier(trimmed.to_string())),
        }
    }

    /// Parse command-line text, which is always hexadecimal (`0x` optional)
    pub fn parse_hex(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        match u32::from_str_radix(digits, 16) {
            Ok(value) if value <= u32::from(MAX_STANDARD_ID) => Ok(Self(value as u16)),
            _ => Err(BridgeError::InvalidIdentifier(trimmed.to_string())),
        }
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

impl FromStr for CanId {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for CanId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CanId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Number(u64),
            Text(String),
        }

        match RawId::deserialize(deserializer)? {
            RawId::Number(n) => u16::try_from(n)
                .map_err(|_| BridgeError::InvalidIdentifier(n.to_string()))
                .and_then(CanId::new)
                .map_err(serde::de::Error::custom),
            RawId::Text(s) => CanId::parse(&s).map_err(serde::de::Error::custom),
        }
    }
}

/// Which side of the bridge a frame was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusSide {
    A,
    B,
}

impl BusSide {
    /// The side frames from this side are forwarded to
    pub const fn opposite(self) -> Self {
        match self {
            BusSide::A => BusSide::B,
            BusSide::B => BusSide::A,
        }
    }
}

impl fmt::Display for BusSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusSide::A => write!(f, "A"),
            BusSide::B => write!(f, "B"),
        }
    }
}

/// Classic CAN data frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: CanId,
    len: u8,
    data: [u8; MAX_PAYLOAD],
    origin: Option<BusSide>,
}

impl CanFrame {
    /// Create a new standard frame
    pub fn new(id: CanId, payload: &[u8]) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD {
            return Err(BridgeError::InternalError(format!(
                "CAN 2.0 data must be <= {MAX_PAYLOAD} bytes, got {}",
                payload.len()
            )));
        }

        let mut data = [0u8; MAX_PAYLOAD];
        data[..payload.len()].copy_from_slice(payload);

        Ok(Self {
            id,
            len: payload.len() as u8,
            data,
            origin: None,
        })
    }

    /// Tag the frame with the bridge side it was received on
    pub fn received_on(mut self, side: BusSide) -> Self {
        self.origin = Some(side);
        self
    }

    pub fn id(&self) -> CanId {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn origin(&self) -> Option<BusSide> {
        self.origin
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.id, self.len)?;
        for byte in self.data() {
            write!(f, " {byte:02X}")?;
        }
        Ok(())
    }
}
