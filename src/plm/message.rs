//! Insteon message codec.
//!
//! A [`Message`] is a fixed-length byte buffer plus the [`MessageDefinition`]
//! it was created from. The definition names each field and records its byte
//! offset and type; every read or write goes through it so offsets never leak
//! into callers.
//!
//! Definitions are owned by the [`MessageRegistry`](super::registry::MessageRegistry)
//! and shared as `Arc`s; a message is always a copy of a template buffer with
//! some fields overwritten.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::address::DeviceAddress;

/// Well-known field names used across the message table.
pub mod fields {
    pub const CMD: &str = "Cmd";
    pub const FROM_ADDRESS: &str = "fromAddress";
    pub const TO_ADDRESS: &str = "toAddress";
    pub const MESSAGE_FLAGS: &str = "messageFlags";
    pub const COMMAND_1: &str = "command1";
    pub const COMMAND_2: &str = "command2";
    pub const ACK_NACK: &str = "ACK/NACK";
    pub const RAW_X10: &str = "rawX10";
    pub const X10_FLAG: &str = "X10Flag";
    pub const IM_ADDRESS: &str = "IMAddress";
    pub const LINK_ADDR: &str = "LinkAddr";
    pub const RECORD_FLAGS: &str = "RecordFlags";
    pub const ALL_LINK_GROUP: &str = "ALLLinkGroup";
    pub const DEVICE_CATEGORY: &str = "DeviceCategory";
    pub const DEVICE_SUB_CATEGORY: &str = "DeviceSubCategory";
    pub const FIRMWARE_VERSION: &str = "FirmwareVersion";

    pub const USER_DATA: [&str; 14] = [
        "userData1",
        "userData2",
        "userData3",
        "userData4",
        "userData5",
        "userData6",
        "userData7",
        "userData8",
        "userData9",
        "userData10",
        "userData11",
        "userData12",
        "userData13",
        "userData14",
    ];
}

use fields::*;

/// Frame start marker.
pub const STX: u8 = 0x02;
/// Pure NACK byte the modem sends when it could not accept a command.
pub const NACK: u8 = 0x15;
/// Positive acknowledgement byte in ACK/NACK fields.
pub const ACK: u8 = 0x06;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    Byte,
    Int,
    Address,
}

impl DataType {
    pub fn size(self) -> usize {
        match self {
            DataType::Byte => 1,
            DataType::Int => 4,
            DataType::Address => 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub offset: usize,
    pub data_type: DataType,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("message {message} has no field '{field}'")]
    UnknownField { message: &'static str, field: String },
    #[error("field '{field}' is {actual:?}, not {expected:?}")]
    TypeMismatch {
        field: &'static str,
        expected: DataType,
        actual: DataType,
    },
    #[error("field '{field}' write beyond end of msg (offset {offset}, len {len})")]
    OutOfBounds {
        field: &'static str,
        offset: usize,
        len: usize,
    },
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error(transparent)]
    Field(#[from] FieldError),
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("message {name} expects {expected} bytes, got {actual}")]
    BadLength {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    ToModem,
    FromModem,
}

/// Insteon message type, carried in the top three bits of the flags byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgType {
    Direct = 0,
    AckOfDirect = 1,
    AllLinkCleanup = 2,
    AllLinkCleanupAck = 3,
    Broadcast = 4,
    NackOfDirect = 5,
    AllLinkBroadcast = 6,
    AllLinkCleanupNack = 7,
}

impl MsgType {
    pub fn from_flags(flags: u8) -> Self {
        match flags >> 5 {
            0 => MsgType::Direct,
            1 => MsgType::AckOfDirect,
            2 => MsgType::AllLinkCleanup,
            3 => MsgType::AllLinkCleanupAck,
            4 => MsgType::Broadcast,
            5 => MsgType::NackOfDirect,
            6 => MsgType::AllLinkBroadcast,
            _ => MsgType::AllLinkCleanupNack,
        }
    }
}

/// Layout of one message kind.
#[derive(Debug)]
pub struct MessageDefinition {
    pub name: &'static str,
    pub direction: Direction,
    pub command: u8,
    pub extended: bool,
    pub header_len: usize,
    pub len: usize,
    /// Sorted by offset.
    pub fields: Vec<Field>,
    pub template: Vec<u8>,
}

impl MessageDefinition {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    fn checked(&self, name: &str, data_type: DataType, buf_len: usize) -> Result<&Field, FieldError> {
        let field = self.field(name).ok_or_else(|| FieldError::UnknownField {
            message: self.name,
            field: name.to_string(),
        })?;
        if field.data_type != data_type {
            return Err(FieldError::TypeMismatch {
                field: field.name,
                expected: data_type,
                actual: field.data_type,
            });
        }
        if field.offset + data_type.size() > buf_len {
            return Err(FieldError::OutOfBounds {
                field: field.name,
                offset: field.offset,
                len: buf_len,
            });
        }
        Ok(field)
    }
}

#[derive(Clone)]
pub struct Message {
    data: Vec<u8>,
    definition: Arc<MessageDefinition>,
    quiet_time: Duration,
}

impl Message {
    /// Fresh copy of a template.
    pub fn from_definition(definition: Arc<MessageDefinition>) -> Self {
        Self {
            data: definition.template.clone(),
            definition,
            quiet_time: Duration::ZERO,
        }
    }

    /// Wrap bytes received from the modem. The length must match the definition.
    pub fn from_bytes(definition: Arc<MessageDefinition>, bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() != definition.len {
            return Err(MessageError::BadLength {
                name: definition.name,
                expected: definition.len,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            data: bytes.to_vec(),
            definition,
            quiet_time: Duration::ZERO,
        })
    }

    pub fn name(&self) -> &'static str {
        self.definition.name
    }

    pub fn definition(&self) -> &MessageDefinition {
        &self.definition
    }

    pub fn direction(&self) -> Direction {
        self.definition.direction
    }

    pub fn header_len(&self) -> usize {
        self.definition.header_len
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn command_number(&self) -> u8 {
        self.data.get(1).copied().unwrap_or(0)
    }

    /// How long the writer must stay silent after this message has gone out.
    pub fn quiet_time(&self) -> Duration {
        self.quiet_time
    }

    pub fn set_quiet_time(&mut self, quiet: Duration) {
        self.quiet_time = quiet;
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.definition.contains_field(name)
    }

    pub fn get_byte(&self, name: &str) -> Result<u8, FieldError> {
        let f = self.definition.checked(name, DataType::Byte, self.data.len())?;
        Ok(self.data[f.offset])
    }

    pub fn set_byte(&mut self, name: &str, value: u8) -> Result<(), FieldError> {
        let offset = self.definition.checked(name, DataType::Byte, self.data.len())?.offset;
        self.data[offset] = value;
        Ok(())
    }

    pub fn get_int(&self, name: &str) -> Result<i32, FieldError> {
        let f = self.definition.checked(name, DataType::Int, self.data.len())?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.data[f.offset..f.offset + 4]);
        Ok(i32::from_be_bytes(raw))
    }

    pub fn set_int(&mut self, name: &str, value: i32) -> Result<(), FieldError> {
        let offset = self.definition.checked(name, DataType::Int, self.data.len())?.offset;
        self.data[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn get_address(&self, name: &str) -> Result<DeviceAddress, FieldError> {
        let f = self.definition.checked(name, DataType::Address, self.data.len())?;
        let mut raw = [0u8; 3];
        raw.copy_from_slice(&self.data[f.offset..f.offset + 3]);
        Ok(DeviceAddress::from_bytes(raw))
    }

    pub fn set_address(&mut self, name: &str, addr: DeviceAddress) -> Result<(), FieldError> {
        let offset = self.definition.checked(name, DataType::Address, self.data.len())?.offset;
        self.data[offset..offset + 3].copy_from_slice(&addr.to_bytes());
        Ok(())
    }

    /// `count` raw bytes starting at the named field.
    pub fn get_bytes(&self, name: &str, count: usize) -> Result<&[u8], FieldError> {
        let field = self.definition.field(name).ok_or_else(|| FieldError::UnknownField {
            message: self.definition.name,
            field: name.to_string(),
        })?;
        if field.offset + count > self.data.len() {
            return Err(FieldError::OutOfBounds {
                field: field.name,
                offset: field.offset,
                len: self.data.len(),
            });
        }
        Ok(&self.data[field.offset..field.offset + count])
    }

    pub fn msg_type(&self) -> Option<MsgType> {
        self.get_byte(MESSAGE_FLAGS).ok().map(MsgType::from_flags)
    }

    fn is_of_type(&self, t: MsgType) -> bool {
        self.msg_type() == Some(t)
    }

    pub fn is_pure_nack(&self) -> bool {
        self.data.len() == 2 && self.data[1] == NACK
    }

    pub fn is_extended(&self) -> bool {
        self.get_byte(MESSAGE_FLAGS)
            .map(|flags| flags & 0x10 == 0x10)
            .unwrap_or(false)
    }

    /// Messages without an ACK/NACK byte are not replies to anything we sent.
    pub fn is_unsolicited(&self) -> bool {
        !self.definition.contains_field(ACK_NACK)
    }

    pub fn is_echo(&self) -> bool {
        self.is_pure_nack() || !self.is_unsolicited()
    }

    pub fn is_broadcast(&self) -> bool {
        self.is_of_type(MsgType::AllLinkBroadcast) || self.is_of_type(MsgType::Broadcast)
    }

    pub fn is_cleanup(&self) -> bool {
        self.is_of_type(MsgType::AllLinkCleanup)
    }

    pub fn is_all_link_broadcast(&self) -> bool {
        self.is_of_type(MsgType::AllLinkBroadcast)
    }

    pub fn is_all_link(&self) -> bool {
        self.is_of_type(MsgType::AllLinkBroadcast) || self.is_of_type(MsgType::AllLinkCleanup)
    }

    pub fn is_ack_of_direct(&self) -> bool {
        self.is_of_type(MsgType::AckOfDirect)
    }

    pub fn is_all_link_cleanup_ack_or_nack(&self) -> bool {
        self.is_of_type(MsgType::AllLinkCleanupAck) || self.is_of_type(MsgType::AllLinkCleanupNack)
    }

    pub fn is_x10(&self) -> bool {
        matches!(self.get_byte(CMD), Ok(0x52) | Ok(0x63))
    }

    pub fn hops_left(&self) -> Result<u8, FieldError> {
        Ok((self.get_byte(MESSAGE_FLAGS)? & 0x0C) >> 2)
    }

    pub fn max_hops(&self) -> Result<u8, FieldError> {
        Ok(self.get_byte(MESSAGE_FLAGS)? & 0x03)
    }

    /// Fill userData1..14, zero-padding short input and ignoring anything past 14 bytes.
    pub fn set_user_data(&mut self, data: &[u8]) -> Result<(), FieldError> {
        for (i, name) in USER_DATA.iter().enumerate() {
            self.set_byte(name, data.get(i).copied().unwrap_or(0))?;
        }
        Ok(())
    }

    /// One-byte checksum into userData14. Returns the value written.
    pub fn set_crc(&mut self) -> Result<u8, FieldError> {
        let mut input = [0u8; 15];
        input[0] = self.get_byte(COMMAND_1)?;
        input[1] = self.get_byte(COMMAND_2)?;
        input[2..].copy_from_slice(self.get_bytes(USER_DATA[0], 13)?);
        let crc = crc1(&input);
        self.set_byte(USER_DATA[13], crc)?;
        Ok(crc)
    }

    /// Two-byte checksum into userData13 (high) and userData14 (low).
    pub fn set_crc2(&mut self) -> Result<u16, FieldError> {
        let crc = crc2(self.get_bytes(COMMAND_1, 14)?);
        self.set_byte(USER_DATA[12], (crc >> 8) as u8)?;
        self.set_byte(USER_DATA[13], (crc & 0xFF) as u8)?;
        Ok(crc)
    }

    pub fn to_hex(&self) -> String {
        crate::logutil::hex_spaced(&self.data)
    }
}

/// Sum of all bytes, two's-complement negated.
pub fn crc1(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    sum.wrapping_neg()
}

/// Bit-serial 16-bit checksum used by newer (i2cs) devices. Bits enter LSB first.
pub fn crc2(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in bytes {
        let mut b = byte;
        for _ in 0..8 {
            let mut fb = (b & 0x01) as u16;
            if crc & 0x8000 == 0 {
                fb ^= 1;
            }
            if crc & 0x4000 == 0 {
                fb ^= 1;
            }
            if crc & 0x1000 == 0 {
                fb ^= 1;
            }
            if crc & 0x0008 == 0 {
                fb ^= 1;
            }
            crc = (crc << 1) | fb;
            b >>= 1;
        }
    }
    crc
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data && self.definition.name == other.definition.name
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction() {
            Direction::ToModem => "OUT:",
            Direction::FromModem => "IN:",
        };
        write!(f, "{}|{}", self.name(), dir)?;
        for field in &self.definition.fields {
            match field.data_type {
                DataType::Byte => {
                    let b = self.data[field.offset];
                    if field.name == MESSAGE_FLAGS {
                        write!(
                            f,
                            "{}=0x{:02X}={:?}:{}:{}|",
                            field.name,
                            b,
                            MsgType::from_flags(b),
                            b & 0x03,
                            (b & 0x0C) >> 2
                        )?;
                    } else {
                        write!(f, "{}=0x{:02X}|", field.name, b)?;
                    }
                }
                DataType::Int => {
                    let mut raw = [0u8; 4];
                    raw.copy_from_slice(&self.data[field.offset..field.offset + 4]);
                    write!(f, "{}={}|", field.name, i32::from_be_bytes(raw))?;
                }
                DataType::Address => {
                    let mut raw = [0u8; 3];
                    raw.copy_from_slice(&self.data[field.offset..field.offset + 3]);
                    write!(f, "{}={}|", field.name, DeviceAddress::from_bytes(raw))?;
                }
            }
        }
        Ok(())
    }
}
