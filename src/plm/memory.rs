//! In-memory stand-in for the serial modem.
//!
//! [`MemoryModem`] hands out [`Connector`]s whose links read from a byte
//! queue and record everything written. An optional responder closure plays
//! the modem: it sees each write and returns the bytes to answer with. Used
//! by the integration tests and by `plmgate start --simulate`.
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use super::address::DeviceAddress;
use super::message::{ACK, NACK, STX};
use super::port::{Connector, ModemIo};

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

#[derive(Default)]
struct MemoryState {
    to_host: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    responder: Option<Responder>,
    broken: bool,
    failing_opens: u32,
    opens: u32,
}

#[derive(Clone, Default)]
pub struct MemoryModem {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryModem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        let modem = Self::new();
        modem.lock().responder = Some(Box::new(responder));
        modem
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue bytes for the host to read.
    pub fn inject(&self, bytes: &[u8]) {
        self.lock().to_host.extend(bytes.iter().copied());
    }

    /// Every write call so far, one entry per call.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    pub fn take_writes(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.lock().writes)
    }

    /// Make the next read fail with a broken pipe.
    pub fn break_link(&self) {
        self.lock().broken = true;
    }

    /// Fail the next `n` opens.
    pub fn fail_opens(&self, n: u32) {
        self.lock().failing_opens = n;
    }

    pub fn opens(&self) -> u32 {
        self.lock().opens
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            modem: self.clone(),
        }
    }
}

pub struct MemoryConnector {
    modem: MemoryModem,
}

impl Connector for MemoryConnector {
    fn open(&self) -> io::Result<Box<dyn ModemIo>> {
        let mut state = self.modem.lock();
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(io::Error::new(io::ErrorKind::NotFound, "simulated open failure"));
        }
        state.opens += 1;
        state.broken = false;
        Ok(Box::new(MemoryLink {
            modem: self.modem.clone(),
        }))
    }

    fn name(&self) -> String {
        "memory".to_string()
    }
}

struct MemoryLink {
    modem: MemoryModem,
}

impl Read for MemoryLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.modem.lock();
        if state.broken {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated link loss"));
        }
        if state.to_host.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.to_host.len());
        for (slot, byte) in buf.iter_mut().zip(state.to_host.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MemoryLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.modem.lock();
        state.writes.push(buf.to_vec());
        let reply = state.responder.as_mut().map(|respond| respond(buf));
        if let Some(reply) = reply {
            state.to_host.extend(reply);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One all-link record served by [`simulated_plm`].
#[derive(Debug, Clone, Copy)]
pub struct SimulatedLink {
    pub address: DeviceAddress,
    pub controller: bool,
    pub group: u8,
}

/// A modem that behaves well enough to exercise the whole stack without
/// hardware: it echoes commands with ACK, reports its own address, serves the
/// given link records and has every Insteon device acknowledge direct
/// commands. Status requests (0x19) report the last level set.
pub fn simulated_plm(im_address: DeviceAddress, links: Vec<SimulatedLink>) -> MemoryModem {
    let mut next_record = 0usize;
    let mut levels: HashMap<[u8; 3], u8> = HashMap::new();
    MemoryModem::with_responder(move |out| {
        let mut reply = out.to_vec();
        if out.len() < 2 || out[0] != STX {
            return vec![NACK];
        }
        match out[1] {
            0x60 => {
                reply.extend_from_slice(&im_address.to_bytes());
                reply.extend_from_slice(&[0x03, 0x15, 0x9B, ACK]);
            }
            0x69 | 0x6A => {
                if out[1] == 0x69 {
                    next_record = 0;
                }
                match links.get(next_record) {
                    Some(link) => {
                        next_record += 1;
                        reply.push(ACK);
                        let flags = if link.controller { 0xE2 } else { 0xA2 };
                        reply.extend_from_slice(&[STX, 0x57, flags, link.group]);
                        reply.extend_from_slice(&link.address.to_bytes());
                        reply.extend_from_slice(&[0x01, 0x20, 0x41]);
                    }
                    None => reply.push(NACK),
                }
            }
            0x62 if out.len() == 8 => {
                reply.push(ACK);
                let to = [out[2], out[3], out[4]];
                let (cmd1, cmd2) = (out[6], out[7]);
                let ack_cmd2 = match cmd1 {
                    0x11 | 0x12 => {
                        levels.insert(to, cmd2);
                        cmd2
                    }
                    0x13 | 0x14 => {
                        levels.insert(to, 0);
                        0
                    }
                    0x19 => *levels.get(&to).unwrap_or(&0),
                    _ => cmd2,
                };
                let ack_cmd1 = if cmd1 == 0x19 { 0x00 } else { cmd1 };
                reply.extend_from_slice(&[STX, 0x50]);
                reply.extend_from_slice(&to);
                reply.extend_from_slice(&im_address.to_bytes());
                reply.extend_from_slice(&[0x2B, ack_cmd1, ack_cmd2]);
            }
            _ => reply.push(ACK),
        }
        reply
    })
}
