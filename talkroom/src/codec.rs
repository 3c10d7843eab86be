//! Reversible encoding of stored message text.
//!
//! The encoded form is standard base64 of the UTF-8 text followed by a
//! marker. It hides nothing from anyone with read access to the table; it
//! only keeps stored text from being read at a glance.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Suffix identifying encoded content.
pub const MARKER: &str = "::b64";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageCodec {
    #[default]
    Plain,
    Obfuscated,
}

impl MessageCodec {
    pub fn from_flag(obfuscate: bool) -> Self {
        if obfuscate {
            Self::Obfuscated
        } else {
            Self::Plain
        }
    }

    pub fn encode(&self, text: &str) -> String {
        match self {
            Self::Plain => text.to_string(),
            Self::Obfuscated => format!("{}{}", STANDARD.encode(text.as_bytes()), MARKER),
        }
    }

    /// Decoding always accepts both forms so that rooms with mixed history
    /// read correctly whichever mode is active.
    pub fn decode(&self, stored: &str) -> String {
        decode(stored)
    }
}

/// Reverse [`MessageCodec::encode`]. Unmarked or undecodable content is
/// returned unchanged.
pub fn decode(stored: &str) -> String {
    let Some(body) = stored.strip_suffix(MARKER) else {
        return stored.to_string();
    };
    STANDARD
        .decode(body)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| stored.to_string())
}
