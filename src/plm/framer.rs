//! Incremental framer for the PLM byte stream.
//!
//! The modem emits messages back to back with no length prefix:
//!
//!   `0x02 <cmd> <header...> <payload...>`
//!
//! The command byte gives the header length; for the two commands that come
//! in standard and extended flavours (0x51/0x62) the flags byte at the end of
//! the header picks the full length. A lone `0x15` is a pure NACK and carries
//! no frame start. Feed arbitrary chunks with [`MessageFramer::add_bytes`] and
//! drain with [`MessageFramer::next_message`] until it returns `Ok(None)`.
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use log::trace;
use thiserror::Error;

use super::message::{Message, MessageError, NACK, STX};
use super::registry::MessageRegistry;
use crate::logutil::hex_snippet;

/// Receive buffer bound. Nothing the modem sends comes close.
pub const MAX_BUFFER: usize = 4096;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("incoming data does not start with 0x02 (skipped {skipped} bytes)")]
    NoFrameStart { skipped: usize },
    #[error("unknown command code 0x{0:02X}")]
    UnknownCommand(u8),
    #[error("unknown command code/ext flag: 0x{cmd:02X} extended={extended}")]
    UnknownLength { cmd: u8, extended: bool },
    #[error("receive buffer overflow, discarded {discarded} bytes")]
    Overflow { discarded: usize },
    #[error(transparent)]
    Message(#[from] MessageError),
}

pub struct MessageFramer {
    buf: BytesMut,
    registry: Arc<MessageRegistry>,
}

impl MessageFramer {
    pub fn new(registry: Arc<MessageRegistry>) -> Self {
        Self {
            buf: BytesMut::with_capacity(MAX_BUFFER),
            registry,
        }
    }

    /// Append received bytes. If the buffer would grow past [`MAX_BUFFER`] the
    /// old contents are dropped and an error is returned; the new chunk is still
    /// kept (when it fits on its own) so the next frame start can be found.
    pub fn add_bytes(&mut self, data: &[u8]) -> Result<(), FramingError> {
        if self.buf.len() + data.len() > MAX_BUFFER {
            let mut discarded = self.buf.len();
            self.buf.clear();
            if data.len() <= MAX_BUFFER {
                self.buf.extend_from_slice(data);
            } else {
                discarded += data.len();
            }
            return Err(FramingError::Overflow { discarded });
        }
        self.buf.extend_from_slice(data);
        trace!("read buffer: len {} data: {}", self.buf.len(), hex_snippet(&self.buf, 64));
        Ok(())
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn next_message(&mut self) -> Result<Option<Message>, FramingError> {
        let first = match self.buf.first() {
            Some(b) => *b,
            None => return Ok(None),
        };
        if first == NACK {
            self.buf.advance(1);
            return Ok(Some(self.registry.make("PureNACK")?));
        }
        if first != STX {
            let skipped = self.drain_to_frame_start();
            return Err(FramingError::NoFrameStart { skipped });
        }
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let cmd = self.buf[1];
        let header_len = match self.registry.header_length(cmd) {
            Some(len) => len,
            None => {
                self.buf.advance(1);
                self.drain_to_frame_start();
                return Err(FramingError::UnknownCommand(cmd));
            }
        };
        if self.buf.len() < header_len {
            return Ok(None);
        }
        let extended = header_len > 2 && self.buf[header_len - 1] & 0x10 == 0x10;
        let definition = match self.registry.reply_definition(cmd, extended) {
            Some(def) => def,
            None => {
                self.buf.advance(1);
                self.drain_to_frame_start();
                return Err(FramingError::UnknownLength { cmd, extended });
            }
        };
        if self.buf.len() < definition.len {
            return Ok(None);
        }
        let frame = self.buf.split_to(definition.len);
        let msg = Message::from_bytes(definition, &frame)?;
        trace!("keeping buffer len {}", self.buf.len());
        Ok(Some(msg))
    }

    /// Drop bytes until the buffer starts with 0x02 or is empty.
    fn drain_to_frame_start(&mut self) -> usize {
        let skip = self
            .buf
            .iter()
            .position(|b| *b == STX)
            .unwrap_or(self.buf.len());
        self.buf.advance(skip);
        skip
    }
}
