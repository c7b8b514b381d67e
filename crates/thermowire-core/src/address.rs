//! 1-Wire device address and its text codec
//!
//! An address is the 8-byte ROM code burned into every device:
//! one family byte, six serial bytes and a trailing CRC-8 byte.
//! The canonical text form is `XX:XX:XX:XX:XX:XX:XX:XX` (uppercase hex).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of bytes in a ROM code
pub const ADDRESS_LEN: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("Address needs 16 hex digits, found {found}")]
    TooFewDigits { found: usize },
    #[error("Hex digit at position {position} is not followed by its pair")]
    SplitPair { position: usize },
}

/// Immutable hardware identity of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
    pub const fn new(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    /// Family (model) code, the first ROM byte
    pub fn family_code(&self) -> u8 {
        self.0[0]
    }

    /// Six serial bytes
    pub fn serial(&self) -> [u8; 6] {
        let mut serial = [0u8; 6];
        serial.copy_from_slice(&self.0[1..7]);
        serial
    }

    /// CRC-8 byte as read from the bus
    pub fn crc(&self) -> u8 {
        self.0[7]
    }

    /// The seven bytes covered by the CRC (family + serial)
    pub fn rom(&self) -> [u8; 7] {
        let mut rom = [0u8; 7];
        rom.copy_from_slice(&self.0[..7]);
        rom
    }

    /// Address packed as a little-endian integer, the layout the bus delivers it in
    pub fn packed(&self) -> u64 {
        u64::from_le_bytes(self.0)
    }
}

impl From<[u8; ADDRESS_LEN]> for Address {
    fn from(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_address(s)
    }
}

/// Format an address in its canonical colon-separated form
pub fn format_address(address: &Address) -> String {
    address.to_string()
}

/// Parse an address from text.
///
/// Any non-hex characters between byte pairs are skipped, so
/// `28-ff:4c_7c+0b:16,04a0` and `28FF4C7C0B1604A0` yield the same address.
/// Text after the sixteenth digit is ignored.
pub fn parse_address(text: &str) -> Result<Address, AddressParseError> {
    let mut bytes = [0u8; ADDRESS_LEN];
    let mut chars = text.char_indices().peekable();
    let mut filled = 0;

    while filled < ADDRESS_LEN {
        // Skip separators up to the next high nibble
        let (position, high) = loop {
            match chars.next() {
                Some((pos, c)) => {
                    if let Some(nibble) = c.to_digit(16) {
                        break (pos, nibble as u8);
                    }
                }
                None => {
                    return Err(AddressParseError::TooFewDigits { found: filled * 2 });
                }
            }
        };

        let low = match chars.next() {
            Some((_, c)) => match c.to_digit(16) {
                Some(nibble) => nibble as u8,
                None => return Err(AddressParseError::SplitPair { position }),
            },
            None => {
                return Err(AddressParseError::TooFewDigits {
                    found: filled * 2 + 1,
                })
            }
        };

        bytes[filled] = (high << 4) | low;
        filled += 1;
    }

    Ok(Address(bytes))
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse_address(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: Address = Address::new([0x28, 0xFF, 0x4C, 0x7C, 0x0B, 0x16, 0x04, 0xA0]);

    #[test]
    fn test_format_is_uppercase_and_padded() {
        let addr = Address::new([0x28, 0x0F, 0x00, 0x01, 0xAB, 0xCD, 0xEF, 0x05]);
        assert_eq!(format_address(&addr), "28:0F:00:01:AB:CD:EF:05");
    }

    #[test]
    fn test_parse_canonical_round_trip() {
        for addr in [
            SAMPLE,
            Address::default(),
            Address::new([0xFF; 8]),
            Address::new([0x10, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]),
        ] {
            assert_eq!(parse_address(&addr.to_string()).unwrap(), addr);
        }
    }

    #[test]
    fn test_parse_arbitrary_separators() {
        let messy = parse_address("28-ff:4c_7c+0b:16,04a0").unwrap();
        let clean = parse_address("28ff4c7c0b1604a0").unwrap();
        assert_eq!(messy, clean);
        assert_eq!(messy, SAMPLE);
    }

    proptest! {
        #[test]
        fn prop_format_then_parse_is_identity(bytes in any::<[u8; 8]>()) {
            let addr = Address::new(bytes);
            prop_assert_eq!(parse_address(&format_address(&addr)), Ok(addr));
        }

        #[test]
        fn prop_separators_between_pairs_are_skipped(
            bytes in any::<[u8; 8]>(),
            separators in proptest::collection::vec("[-:_ ,.+g-zG-Z]{0,3}", 9),
        ) {
            let mut text = separators[0].clone();
            for (byte, separator) in bytes.iter().zip(&separators[1..]) {
                text.push_str(&format!("{:02x}", byte));
                text.push_str(separator);
            }
            prop_assert_eq!(parse_address(&text), Ok(Address::new(bytes)));
        }
    }

    #[test]
    fn test_parse_ignores_trailing_text() {
        let addr: Address = "28FF4C7C0B1604A0 (boiler)".parse().unwrap();
        assert_eq!(addr, SAMPLE);
    }

    #[test]
    fn test_parse_too_few_digits() {
        assert_eq!(
            parse_address("28:FF:4C"),
            Err(AddressParseError::TooFewDigits { found: 6 })
        );
        assert_eq!(
            parse_address("28FF4C7C0B1604A"),
            Err(AddressParseError::TooFewDigits { found: 15 })
        );
        assert_eq!(
            parse_address(""),
            Err(AddressParseError::TooFewDigits { found: 0 })
        );
    }

    #[test]
    fn test_parse_split_pair() {
        assert_eq!(
            parse_address("2-8FF4C7C0B1604A0"),
            Err(AddressParseError::SplitPair { position: 0 })
        );
    }

    #[test]
    fn test_accessors() {
        assert_eq!(SAMPLE.family_code(), 0x28);
        assert_eq!(SAMPLE.serial(), [0xFF, 0x4C, 0x7C, 0x0B, 0x16, 0x04]);
        assert_eq!(SAMPLE.crc(), 0xA0);
        assert_eq!(SAMPLE.rom(), [0x28, 0xFF, 0x4C, 0x7C, 0x0B, 0x16, 0x04]);
        assert_eq!(SAMPLE.packed(), 0xA004_160B_7C4C_FF28);
    }

    #[test]
    fn test_serde_uses_canonical_text() {
        let json = serde_json::to_string(&SAMPLE).unwrap();
        assert_eq!(json, "\"28:FF:4C:7C:0B:16:04:A0\"");
        let back: Address = serde_json::from_str("\"28-ff-4c-7c-0b-16-04-a0\"").unwrap();
        assert_eq!(back, SAMPLE);
        assert!(serde_json::from_str::<Address>("\"28ff\"").is_err());
    }
}
