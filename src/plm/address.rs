//! Device addresses on the Insteon network.
//!
//! Every address is three bytes on the wire. Insteon devices use all three;
//! legacy X10 devices are identified by a single house/unit byte that lives in
//! the low byte with high and middle forced to zero.
//!
//! ```text
//!   Insteon  28.C3.91   -> [0x28, 0xC3, 0x91]
//!   X10      A.1        -> [0x00, 0x00, 0x66]   (house A = 0x6, unit 1 = 0x6)
//! ```
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use thiserror::Error;

/// X10 nibble codes for houses A..P and units 1..16 (same ordering for both).
const X10_CODES: [u8; 16] = [
    0x6, 0xE, 0x2, 0xA, 0x1, 0x9, 0x5, 0xD, 0x7, 0xF, 0x3, 0xB, 0x0, 0x8, 0x4, 0xC,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("malformed address '{0}'")]
    Malformed(String),
    #[error("invalid X10 house code '{0}'")]
    BadHouse(String),
    #[error("invalid X10 unit code '{0}'")]
    BadUnit(String),
}

/// A 3-byte device identifier. Equality and hashing use only the raw bytes,
/// so an X10 address and an Insteon address with the same bytes compare equal.
#[derive(Clone, Copy, Debug)]
pub enum DeviceAddress {
    Insteon([u8; 3]),
    X10(u8),
}

impl DeviceAddress {
    pub fn insteon(high: u8, middle: u8, low: u8) -> Self {
        DeviceAddress::Insteon([high, middle, low])
    }

    /// Build an X10 address from a house letter (`'A'..='P'`) and unit (1..=16).
    pub fn x10(house: char, unit: u8) -> Result<Self, AddressParseError> {
        let h = house.to_ascii_uppercase();
        if !('A'..='P').contains(&h) {
            return Err(AddressParseError::BadHouse(house.to_string()));
        }
        if !(1..=16).contains(&unit) {
            return Err(AddressParseError::BadUnit(unit.to_string()));
        }
        let house_code = X10_CODES[(h as u8 - b'A') as usize];
        let unit_code = X10_CODES[(unit - 1) as usize];
        Ok(DeviceAddress::X10((house_code << 4) | unit_code))
    }

    /// Decode three wire bytes. Addresses read off the wire are always Insteon;
    /// X10 traffic carries its house/unit in separate message fields.
    pub fn from_bytes(bytes: [u8; 3]) -> Self {
        DeviceAddress::Insteon(bytes)
    }

    pub fn to_bytes(self) -> [u8; 3] {
        match self {
            DeviceAddress::Insteon(b) => b,
            DeviceAddress::X10(code) => [0, 0, code],
        }
    }

    pub fn high_byte(self) -> u8 {
        self.to_bytes()[0]
    }

    pub fn middle_byte(self) -> u8 {
        self.to_bytes()[1]
    }

    pub fn low_byte(self) -> u8 {
        self.to_bytes()[2]
    }

    pub fn is_x10(self) -> bool {
        matches!(self, DeviceAddress::X10(_))
    }

    /// House nibble as sent on the wire (X10 only; zero for Insteon).
    pub fn x10_house_code(self) -> u8 {
        match self {
            DeviceAddress::X10(code) => (code & 0xF0) >> 4,
            DeviceAddress::Insteon(_) => 0,
        }
    }

    /// Unit nibble as sent on the wire (X10 only; zero for Insteon).
    pub fn x10_unit_code(self) -> u8 {
        match self {
            DeviceAddress::X10(code) => code & 0x0F,
            DeviceAddress::Insteon(_) => 0,
        }
    }
}

impl PartialEq for DeviceAddress {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for DeviceAddress {}

impl Hash for DeviceAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

fn x10_index(code: u8) -> Option<usize> {
    X10_CODES.iter().position(|&c| c == code)
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceAddress::Insteon([h, m, l]) => write!(f, "{:02X}.{:02X}.{:02X}", h, m, l),
            DeviceAddress::X10(code) => {
                let house = x10_index((code & 0xF0) >> 4).map(|i| (b'A' + i as u8) as char);
                let unit = x10_index(code & 0x0F).map(|i| i + 1);
                match (house, unit) {
                    (Some(h), Some(u)) => write!(f, "{}.{}", h, u),
                    _ => write!(f, "X10:{:02X}", code),
                }
            }
        }
    }
}

impl FromStr for DeviceAddress {
    type Err = AddressParseError;

    /// Accepts `xx.xx.xx` (hex, Insteon) or `H.U` (X10 house letter, unit number).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        match parts.as_slice() {
            [h, m, l] => {
                let parse = |p: &str| {
                    if p.len() != 2 {
                        return Err(AddressParseError::Malformed(s.to_string()));
                    }
                    u8::from_str_radix(p, 16).map_err(|_| AddressParseError::Malformed(s.to_string()))
                };
                Ok(DeviceAddress::insteon(parse(h)?, parse(m)?, parse(l)?))
            }
            [house, unit] => {
                let mut chars = house.chars();
                let h = match (chars.next(), chars.next()) {
                    (Some(c), None) => c,
                    _ => return Err(AddressParseError::BadHouse(house.to_string())),
                };
                let u: u8 = unit
                    .parse()
                    .map_err(|_| AddressParseError::BadUnit(unit.to_string()))?;
                DeviceAddress::x10(h, u)
            }
            _ => Err(AddressParseError::Malformed(s.to_string())),
        }
    }
}

/// X10 command nibbles (low nibble of the raw X10 byte when the flag is 0x80).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum X10Command {
    AllUnitsOff = 0x0,
    AllLightsOn = 0x1,
    On = 0x2,
    Off = 0x3,
    Dim = 0x4,
    Bright = 0x5,
    AllLightsOff = 0x6,
    ExtendedCode = 0x7,
    HailRequest = 0x8,
    HailAck = 0x9,
    PresetDim1 = 0xA,
    PresetDim2 = 0xB,
    ExtendedData = 0xC,
    StatusOn = 0xD,
    StatusOff = 0xE,
    StatusRequest = 0xF,
}

impl X10Command {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Nibble used with the preset-dim commands for each of the 16 levels.
pub const X10_CODE_FOR_LEVEL: [u8; 16] = [0, 8, 4, 12, 2, 10, 6, 14, 1, 9, 5, 13, 3, 11, 7, 15];
