//! The modem's all-link database.
//!
//! The download walks the modem's link table one record at a time:
//!
//! ```text
//!   host  -> 0x69 GetFirstALLLinkRecord
//!   modem -> 0x69 echo (ACK)          0x57 record
//!   host  -> 0x6A GetNextALLLinkRecord
//!   modem -> 0x6A echo (ACK)          0x57 record
//!   ...
//!   modem -> 0x6A echo (NACK)         no more records
//! ```
//!
//! Records accumulate in a staging table owned by the builder and are swapped
//! into the shared [`ModemDb`] in one step when the modem reports the end. A
//! download that stalls past the retry timeout is thrown away and restarted.
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use super::address::DeviceAddress;
use super::message::fields::*;
use super::message::{FieldError, Message, NACK};
use super::port::{MessageWriter, PortEvent};
use super::registry::MessageRegistry;
use crate::metrics;

/// Record flag bit set when the modem is the controller of the group.
const CONTROLLER_FLAG: u8 = 0x40;

#[derive(Debug, Clone)]
pub struct ModemDbEntry {
    address: DeviceAddress,
    link_records: Vec<Message>,
    controls: BTreeSet<u8>,
    responds_to: BTreeSet<u8>,
}

impl ModemDbEntry {
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            link_records: Vec::new(),
            controls: BTreeSet::new(),
            responds_to: BTreeSet::new(),
        }
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn add_link_record(&mut self, record: Message) -> Result<(), FieldError> {
        let group = record.get_byte(ALL_LINK_GROUP)?;
        if record.get_byte(RECORD_FLAGS)? & CONTROLLER_FLAG != 0 {
            self.controls.insert(group);
        } else {
            self.responds_to.insert(group);
        }
        self.link_records.push(record);
        Ok(())
    }

    pub fn link_records(&self) -> &[Message] {
        &self.link_records
    }

    /// Groups the modem controls on this device.
    pub fn controls(&self) -> &BTreeSet<u8> {
        &self.controls
    }

    /// Groups of this device the modem responds to.
    pub fn responds_to(&self) -> &BTreeSet<u8> {
        &self.responds_to
    }
}

fn hex_groups(groups: &BTreeSet<u8>) -> String {
    let list: Vec<String> = groups.iter().map(|g| format!("{:02X}", g)).collect();
    format!("[{}]", list.join(","))
}

impl fmt::Display for ModemDbEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: records={} controls={} respondsTo={}",
            self.address,
            self.link_records.len(),
            hex_groups(&self.controls),
            hex_groups(&self.responds_to)
        )
    }
}

#[derive(Default)]
struct DbInner {
    entries: HashMap<DeviceAddress, ModemDbEntry>,
    complete: bool,
}

/// Shared read view of the last completed download.
#[derive(Clone, Default)]
pub struct ModemDb {
    inner: Arc<Mutex<DbInner>>,
}

impl ModemDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DbInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_complete(&self) -> bool {
        self.lock().complete
    }

    pub fn contains(&self, address: &DeviceAddress) -> bool {
        self.lock().entries.contains_key(address)
    }

    pub fn entry(&self, address: &DeviceAddress) -> Option<ModemDbEntry> {
        self.lock().entries.get(address).cloned()
    }

    pub fn addresses(&self) -> Vec<DeviceAddress> {
        self.lock().entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, entries: HashMap<DeviceAddress, ModemDbEntry>) {
        let mut inner = self.lock();
        inner.entries = entries;
        inner.complete = true;
    }

    fn mark_stale(&self) {
        self.lock().complete = false;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbEvent {
    Complete { entries: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    NotStarted,
    Downloading { started: Instant },
    Complete,
}

pub struct ModemDbBuilder {
    state: BuildState,
    staging: HashMap<DeviceAddress, ModemDbEntry>,
    db: ModemDb,
    registry: Arc<MessageRegistry>,
    retry_timeout: Duration,
    modem_known: bool,
    /// Set while waiting for the modem to answer GetIMInfo.
    identify_since: Option<Instant>,
}

impl ModemDbBuilder {
    pub fn new(db: ModemDb, registry: Arc<MessageRegistry>, retry_timeout: Duration) -> Self {
        Self {
            state: BuildState::NotStarted,
            staging: HashMap::new(),
            db,
            registry,
            retry_timeout,
            modem_known: false,
            identify_since: None,
        }
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn db(&self) -> &ModemDb {
        &self.db
    }

    /// Begin a fresh download, discarding anything staged.
    pub fn start(&mut self, now: Instant, writer: &dyn MessageWriter) {
        info!("starting modem database download");
        self.staging.clear();
        self.state = BuildState::Downloading { started: now };
        metrics::inc_db_cycles();
        self.send("GetFirstALLLinkRecord", writer);
    }

    fn send(&self, name: &str, writer: &dyn MessageWriter) {
        match self.registry.make(name) {
            Ok(msg) => {
                if let Err(e) = writer.write(msg) {
                    warn!("error sending {}: {}", name, e);
                }
            }
            Err(e) => warn!("cannot build {}: {}", name, e),
        }
    }

    /// Link disappeared; whatever we have staged may be incomplete.
    pub fn reset(&mut self) {
        debug!("modem db builder reset");
        self.staging.clear();
        self.state = BuildState::NotStarted;
        self.db.mark_stale();
    }

    /// Expect a GetIMInfo reply within the retry timeout; ask again if none comes.
    pub fn await_modem(&mut self, now: Instant) {
        if !self.modem_known && self.state == BuildState::NotStarted {
            self.identify_since = Some(now);
        }
    }

    /// When the current download, or the wait for the modem, has to be retried.
    pub fn deadline(&self) -> Option<Instant> {
        match (self.state, self.identify_since) {
            (BuildState::Downloading { started }, _) => Some(started + self.retry_timeout),
            (BuildState::NotStarted, Some(since)) => Some(since + self.retry_timeout),
            _ => None,
        }
    }

    /// Restart a stalled download or re-query a silent modem. Returns true if
    /// anything was sent.
    pub fn check_timeout(&mut self, now: Instant, writer: &dyn MessageWriter) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                if self.state == BuildState::NotStarted {
                    warn!("modem did not identify itself, asking again");
                    self.identify_since = Some(now);
                    self.send("GetIMInfo", writer);
                } else {
                    warn!("modem database download unsuccessful, restarting!");
                    self.start(now, writer);
                }
                true
            }
            _ => false,
        }
    }

    pub fn handle_message(&mut self, msg: &Message, now: Instant, writer: &dyn MessageWriter) -> Option<DbEvent> {
        if msg.is_pure_nack() {
            return None;
        }
        match msg.command_number() {
            0x60 => {
                // Modem answered GetIMInfo: it is up, start the download.
                self.modem_known = true;
                self.identify_since = None;
                if self.state == BuildState::NotStarted {
                    self.start(now, writer);
                }
                None
            }
            0x69 | 0x6A if matches!(self.state, BuildState::Downloading { .. }) => {
                match msg.get_byte(ACK_NACK) {
                    Ok(NACK) => {
                        debug!("got all link records.");
                        Some(self.finish())
                    }
                    Ok(_) => None,
                    Err(e) => {
                        debug!("bad field handling link records: {}", e);
                        None
                    }
                }
            }
            0x57 if matches!(self.state, BuildState::Downloading { .. }) => {
                if let Err(e) = self.stage_record(msg) {
                    debug!("bad field handling link records: {}", e);
                }
                self.send("GetNextALLLinkRecord", writer);
                None
            }
            _ => None,
        }
    }

    pub fn handle_reconnect(&mut self, now: Instant, writer: &dyn MessageWriter) {
        self.reset();
        if self.modem_known {
            self.start(now, writer);
        } else {
            self.await_modem(now);
        }
    }

    fn stage_record(&mut self, msg: &Message) -> Result<(), FieldError> {
        let address = msg.get_address(LINK_ADDR)?;
        self.staging
            .entry(address)
            .or_insert_with(|| ModemDbEntry::new(address))
            .add_link_record(msg.clone())
    }

    fn finish(&mut self) -> DbEvent {
        let staged = std::mem::take(&mut self.staging);
        log_records(&staged);
        let entries = staged.len();
        self.db.publish(staged);
        self.state = BuildState::Complete;
        info!("modem database complete: {} devices", entries);
        DbEvent::Complete { entries }
    }

    /// Drive the builder from a port listener channel until it closes.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<PortEvent>,
        writer: impl MessageWriter,
        db_tx: mpsc::UnboundedSender<DbEvent>,
    ) -> Result<()> {
        debug!("starting modem db builder task");
        self.await_modem(Instant::now());
        loop {
            let deadline = self.deadline();
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(PortEvent::Message(msg)) => {
                            if let Some(done) = self.handle_message(&msg, Instant::now(), &writer) {
                                if db_tx.send(done).is_err() {
                                    break;
                                }
                            }
                        }
                        Some(PortEvent::Reconnected) => self.handle_reconnect(Instant::now(), &writer),
                        None => break,
                    }
                }
                _ = sleep_until_opt(deadline) => {
                    self.check_timeout(Instant::now(), &writer);
                }
            }
        }
        debug!("exiting modem db builder task");
        Ok(())
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

fn log_records(entries: &HashMap<DeviceAddress, ModemDbEntry>) {
    debug!("MDB ------- start of modem link records ------------------");
    for entry in entries.values() {
        for m in entry.link_records() {
            let flags = m.get_byte(RECORD_FLAGS).unwrap_or(0);
            let kind = if flags & CONTROLLER_FLAG != 0 { "CTRL" } else { "RESP" };
            debug!(
                "MDB {}: {} group: {:02X} data1: {:02X} data2: {:02X} data3: {:02X}",
                entry.address(),
                kind,
                m.get_byte(ALL_LINK_GROUP).unwrap_or(0),
                m.get_byte("LinkData1").unwrap_or(0),
                m.get_byte("LinkData2").unwrap_or(0),
                m.get_byte("LinkData3").unwrap_or(0)
            );
        }
        debug!("MDB {}", entry);
    }
    debug!("MDB ---------------- end of modem link records -----------");
}
