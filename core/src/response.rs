//! Results received from the card.
//!
//! Commands are built with the `apdu` crate; a result additionally carries the transport failure
//! of the transfer, if any.

use std::fmt::{Display, Formatter};

/// A status word trailing every response from the card.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct StatusWord(pub u16);

impl StatusWord {
    pub const SUCCESS: Self = Self(0x9000);

    pub fn new(sw1: u8, sw2: u8) -> Self {
        Self(u16::from_be_bytes([sw1, sw2]))
    }

    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl Display for StatusWord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

/// A result of one transfer: the response data, the status word and an optional transport error.
///
/// Transport failures never panic or propagate; they are carried in `error` as the numeric
/// PC/SC code and leave `sw` empty.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApduResult {
    pub data: Vec<u8>,
    pub sw: Option<StatusWord>,
    pub error: Option<u32>,
}

impl ApduResult {
    /// Parses a result from the octets received from the card.
    pub fn from_bytes(mut bytes: Vec<u8>) -> Self {
        if bytes.len() < 2 {
            return Self {
                data: bytes,
                ..Default::default()
            };
        }

        let sw2 = bytes.pop().unwrap_or_default();
        let sw1 = bytes.pop().unwrap_or_default();

        Self {
            data: bytes,
            sw: Some(StatusWord::new(sw1, sw2)),
            error: None,
        }
    }

    /// Creates a result for a transfer that failed in the transport with the PC/SC code.
    pub fn failure(code: u32) -> Self {
        Self {
            error: Some(code),
            ..Default::default()
        }
    }

    /// Determines whether the card answered `90 00` without any transport error.
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.sw == Some(StatusWord::SUCCESS)
    }

    /// The response data followed by the status word.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.data.clone();
        if let Some(sw) = self.sw {
            bytes.extend_from_slice(&sw.to_bytes());
        }

        bytes
    }

    /// Lowercase hex of the response data followed by the status word.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// The transport error as lowercase hex, if any.
    pub fn error_hex(&self) -> Option<String> {
        self.error.map(|code| format!("{:x}", code))
    }
}

/// Decodes a hex APDU as written by the server, ignoring whitespace between groups.
pub fn decode_hex(text: &str) -> Result<Vec<u8>, hex::FromHexError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();

    hex::decode(compact)
}
