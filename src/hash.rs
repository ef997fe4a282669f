use std::fmt::Display;
use std::str::FromStr;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde::de;

use crate::errors::Error;

/// Length of the raw digest in bytes.
pub const TTH_BYTES: usize = 24;

/// Length of the base32 text form.
pub const TTH_BASE32_LEN: usize = 39;

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Content hash of a shared file. Two files with equal hashes are the same
/// content regardless of name or location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tth([u8; TTH_BYTES]);

impl Tth {
    /// Wraps a raw digest.
    pub fn from_bytes(bytes: [u8; TTH_BYTES]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; TTH_BYTES] {
        &self.0
    }

    /// Returns true for the all-zero value used when a peer in compatibility
    /// mode did not send a hash.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Base32 text form as sent on the wire.
    pub fn to_base32(&self) -> String {
        let mut out = String::with_capacity(TTH_BASE32_LEN);
        let mut buffer: u32 = 0;
        let mut bits = 0;
        for byte in self.0 {
            buffer = (buffer << 8) | byte as u32;
            bits += 8;
            while bits >= 5 {
                bits -= 5;
                out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
            }
        }
        if bits > 0 {
            out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
        }
        out
    }
}

impl FromStr for Tth {
    type Err = Error;

    /// Decodes the 39 character base32 form. Lowercase input is accepted;
    /// the three unused bits of the last character must be zero.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != TTH_BASE32_LEN {
            return Err(Error::InvalidArgument(format!(
                "TTH must be {TTH_BASE32_LEN} characters, got {}",
                s.len()
            )));
        }
        let mut out = [0u8; TTH_BYTES];
        let mut buffer: u32 = 0;
        let mut bits = 0;
        let mut index = 0;
        for c in s.bytes() {
            let value = match c.to_ascii_uppercase() {
                c @ b'A'..=b'Z' => c - b'A',
                c @ b'2'..=b'7' => c - b'2' + 26,
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "Invalid TTH character '{}'",
                        c as char
                    )));
                }
            };
            buffer = (buffer << 5) | value as u32;
            bits += 5;
            if bits >= 8 {
                bits -= 8;
                if index < TTH_BYTES {
                    out[index] = (buffer >> bits) as u8;
                    index += 1;
                }
            }
        }
        // 39 characters carry three bits more than the digest
        if buffer & ((1 << bits) - 1) != 0 {
            return Err(Error::InvalidArgument(format!(
                "TTH {s} has trailing bits set"
            )));
        }
        Ok(Tth(out))
    }
}

impl Display for Tth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_base32())
    }
}

impl Serialize for Tth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base32())
    }
}

impl<'de> Deserialize<'de> for Tth {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
