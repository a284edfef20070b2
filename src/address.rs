//! Peer addressing: an immutable `(name, device id)` pair with a
//! canonical `"name.device_id"` string encoding.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Identifies one device of one peer.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ProtocolAddress {
    name: String,
    device_id: u32,
}

impl ProtocolAddress {
    /// Builds an address. The name must be non-empty and must not
    /// contain `.`, which is reserved as the encoding separator.
    pub fn new(name: impl Into<String>, device_id: u32) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidArgument("empty address name".into()));
        }
        if name.contains('.') {
            return Err(Error::InvalidArgument(format!(
                "address name may not contain '.': {name}"
            )));
        }
        Ok(Self { name, device_id })
    }

    /// Identifier part of the address
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device part of the address
    #[must_use]
    pub fn device_id(&self) -> u32 {
        self.device_id
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device_id)
    }
}

impl FromStr for ProtocolAddress {
    type Err = Error;

    /// Parses `"name.device_id"`, splitting on the LAST `.` so that
    /// names containing dots round-trip.
    fn from_str(encoded: &str) -> Result<Self> {
        let (name, device) = encoded.rsplit_once('.').ok_or_else(|| {
            Error::InvalidArgument(format!("invalid address encoding: {encoded}"))
        })?;
        if name.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "invalid address encoding: {encoded}"
            )));
        }
        if device.is_empty() || !device.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidArgument(format!(
                "invalid device id in address: {encoded}"
            )));
        }
        let device_id = device.parse::<u32>().map_err(|_| {
            Error::InvalidArgument(format!("device id out of range in address: {encoded}"))
        })?;
        Ok(Self {
            name: name.to_string(),
            device_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_round_trip() {
        let addr = ProtocolAddress::new("aalekh", 3).unwrap();
        assert_eq!(addr.to_string(), "aalekh.3");
        let parsed: ProtocolAddress = "aalekh.3".parse().unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn test_constructor_rejects_dotted_names() {
        assert!(ProtocolAddress::new("a.b", 1).is_err());
        assert!(ProtocolAddress::new("", 1).is_err());
    }

    #[test]
    fn test_parse_splits_on_last_dot() {
        let parsed: ProtocolAddress = "dotted.name.7".parse().unwrap();
        assert_eq!(parsed.name(), "dotted.name");
        assert_eq!(parsed.device_id(), 7);
        assert_eq!(parsed.to_string(), "dotted.name.7");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("nodot".parse::<ProtocolAddress>().is_err());
        assert!(".5".parse::<ProtocolAddress>().is_err());
        assert!("name.".parse::<ProtocolAddress>().is_err());
        assert!("name.-1".parse::<ProtocolAddress>().is_err());
        assert!("name.1x".parse::<ProtocolAddress>().is_err());
        assert!("name.99999999999999".parse::<ProtocolAddress>().is_err());
    }
}
