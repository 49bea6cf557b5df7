use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::FabricError;

/// Length of a Curve25519 public or private key.
pub const KEY_LEN: usize = 32;

/// Identity of a fabric peer (its public key), or a device private key.
///
/// Parsed from the base64 form used in wg-quick files or from 64 hex digits.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey([u8; KEY_LEN]);

impl PeerKey {
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Lowercase hex, as expected by the UAPI configuration protocol.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    fn from_hex(s: &str) -> Option<[u8; KEY_LEN]> {
        if s.len() != KEY_LEN * 2 || !s.is_ascii() {
            return None;
        }
        let mut out = [0u8; KEY_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(out)
    }
}

impl FromStr for PeerKey {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(bytes) = Self::from_hex(s) {
            return Ok(Self(bytes));
        }
        let decoded = BASE64
            .decode(s)
            .map_err(|e| FabricError::InvalidKey(format!("{s}: {e}")))?;
        let bytes: [u8; KEY_LEN] = decoded.try_into().map_err(|v: Vec<u8>| {
            FabricError::InvalidKey(format!("expected {KEY_LEN} bytes, got {}", v.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerKey({})", self.to_base64())
    }
}

impl Serialize for PeerKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PeerKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_base64_and_hex_agree() {
        let bytes: [u8; KEY_LEN] = std::array::from_fn(|i| i as u8);
        let key = PeerKey::from_bytes(bytes);

        let from_b64: PeerKey = key.to_base64().parse().unwrap();
        let from_hex: PeerKey = key.to_hex().parse().unwrap();

        assert_eq!(from_b64, key);
        assert_eq!(from_hex, key);
        assert!(key.to_hex().starts_with("000102"));
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert!("AAAA".parse::<PeerKey>().is_err());
        assert!("not a key at all".parse::<PeerKey>().is_err());
    }

    #[test]
    fn test_zero_key() {
        assert!(PeerKey::from_bytes([0; KEY_LEN]).is_zero());
        assert!(!PeerKey::from_bytes([1; KEY_LEN]).is_zero());
    }
}
