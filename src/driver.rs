//! # Driver
//!
//! The driver task owns every [`Device`] and the [`RequestQueueManager`].
//! It multiplexes four inputs with `tokio::select!`:
//!
//! - port events (inbound messages, reconnects)
//! - modem-database events (download complete)
//! - API commands from [`DriverHandle`]
//! - the earliest device or poll deadline (one `sleep_until`)
//!
//! Routing of inbound messages:
//!
//! ```text
//!   echo / pure NACK          -> dropped (the writer already consumed it)
//!   X10 flag 0x00             -> remember house/unit
//!   X10 flag 0x80             -> command for the remembered unit
//!   Insteon to modem/bcast    -> device by fromAddress
//!   anything else             -> dropped
//! ```
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::config::Config;
use crate::device::queue::RequestQueueManager;
use crate::device::types::DeviceTypeRegistry;
use crate::device::{Command, Device, DeviceSnapshot, StatePublisher};
use crate::metrics;
use crate::plm::address::DeviceAddress;
use crate::plm::message::fields::*;
use crate::plm::message::Message;
use crate::plm::modem_db::{DbEvent, ModemDb, ModemDbBuilder};
use crate::plm::port::{start_port, Connector, MessageWriter, PortEvent, PortHandle};
use crate::plm::registry::MessageRegistry;

pub enum DriverCommand {
    Send {
        address: DeviceAddress,
        feature: Option<String>,
        command: Command,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Snapshot(oneshot::Sender<DriverSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Serialize)]
pub struct DriverSnapshot {
    pub port: String,
    pub modem_address: Option<String>,
    pub db_complete: bool,
    pub db_entries: usize,
    pub devices: Vec<DeviceSnapshot>,
    pub metrics: metrics::Snapshot,
}

#[derive(Clone, Debug)]
pub struct DriverHandle {
    tx: mpsc::UnboundedSender<DriverCommand>,
}

impl DriverHandle {
    pub async fn send_command(&self, address: DeviceAddress, feature: Option<&str>, command: Command) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DriverCommand::Send {
                address,
                feature: feature.map(str::to_string),
                command,
                reply,
            })
            .map_err(|_| anyhow!("driver is not running"))?;
        rx.await
            .map_err(|_| anyhow!("driver stopped before answering"))?
            .map_err(|e| anyhow!(e))
    }

    pub async fn snapshot(&self) -> Option<DriverSnapshot> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(DriverCommand::Snapshot(tx)).is_ok() {
            rx.await.ok()
        } else {
            None
        }
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(DriverCommand::Shutdown(tx));
        let _ = rx.await;
    }
}

pub struct Driver {
    port: PortHandle,
    registry: Arc<MessageRegistry>,
    devices: HashMap<DeviceAddress, Device>,
    queue: RequestQueueManager,
    /// Next full poll per device; same earliest-wins bookkeeping as the queue.
    polls: RequestQueueManager,
    poll_interval: Duration,
    publisher: Arc<dyn StatePublisher>,
    db: ModemDb,
    modem_address: Option<DeviceAddress>,
    x10_house_unit: Option<u8>,
}

impl Driver {
    pub fn new(
        port: PortHandle,
        devices: Vec<Device>,
        db: ModemDb,
        publisher: Arc<dyn StatePublisher>,
        poll_interval: Duration,
    ) -> Self {
        let registry = port.registry().clone();
        Self {
            port,
            registry,
            devices: devices.into_iter().map(|d| (d.address(), d)).collect(),
            queue: RequestQueueManager::new(),
            polls: RequestQueueManager::new(),
            poll_interval,
            publisher,
            db,
            modem_address: None,
            x10_house_unit: None,
        }
    }

    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<PortEvent>,
        mut db_events: mpsc::UnboundedReceiver<DbEvent>,
        mut commands: mpsc::UnboundedReceiver<DriverCommand>,
    ) -> Result<()> {
        info!("driver started with {} devices on {}", self.devices.len(), self.port.name());
        self.request_modem_info();
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                event = events.recv() => match event {
                    Some(PortEvent::Message(msg)) => self.handle_port_message(&msg, Instant::now()),
                    Some(PortEvent::Reconnected) => {
                        info!("port reconnected, waiting for modem database");
                        self.polls = RequestQueueManager::new();
                    }
                    None => {
                        info!("port closed");
                        break;
                    }
                },
                Some(event) = db_events.recv() => match event {
                    DbEvent::Complete { entries } => self.on_db_complete(entries, Instant::now()),
                },
                cmd = commands.recv() => match cmd {
                    Some(DriverCommand::Send { address, feature, command, reply }) => {
                        let result = self.handle_command(address, feature.as_deref(), command, Instant::now());
                        let _ = reply.send(result);
                    }
                    Some(DriverCommand::Snapshot(resp)) => {
                        let _ = resp.send(self.snapshot());
                    }
                    Some(DriverCommand::Shutdown(done)) => {
                        self.port.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.port.shutdown();
                        break;
                    }
                },
                _ = sleep_until_opt(deadline) => self.service_due(Instant::now()),
            }
        }
        info!("driver stopped");
        Ok(())
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.queue.next_deadline(), self.polls.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn request_modem_info(&self) {
        match self.registry.make("GetIMInfo") {
            Ok(m) => {
                if let Err(e) = self.port.write(m) {
                    error!("cannot query modem info: {}", e);
                }
            }
            Err(e) => error!("cannot build modem info request: {}", e),
        }
    }

    fn handle_port_message(&mut self, msg: &Message, now: Instant) {
        if msg.command_number() == 0x60 {
            match msg.get_address(IM_ADDRESS) {
                Ok(addr) => {
                    if self.modem_address != Some(addr) {
                        info!("modem address is {}", addr);
                    }
                    self.modem_address = Some(addr);
                }
                Err(e) => warn!("modem info reply without address: {}", e),
            }
            return;
        }
        if msg.is_echo() {
            trace!("not routing echo {}", msg);
            return;
        }
        if msg.is_x10() {
            self.handle_x10_message(msg, now);
            return;
        }
        if !msg.has_field(FROM_ADDRESS) {
            trace!("not routing {}", msg.name());
            return;
        }
        let (from, to) = match (msg.get_address(FROM_ADDRESS), msg.get_address(TO_ADDRESS)) {
            (Ok(from), Ok(to)) => (from, to),
            _ => return,
        };
        if !msg.is_broadcast() && Some(to) != self.modem_address {
            trace!("ignoring message from {} to {}", from, to);
            return;
        }
        self.route(from, msg, now);
    }

    fn handle_x10_message(&mut self, msg: &Message, now: Instant) {
        let (raw, flag) = match (msg.get_byte(RAW_X10), msg.get_byte(X10_FLAG)) {
            (Ok(raw), Ok(flag)) => (raw, flag),
            _ => return,
        };
        if flag & 0x80 == 0 {
            // unit code, the command follows
            self.x10_house_unit = Some(raw);
            return;
        }
        match self.x10_house_unit {
            Some(house_unit) if house_unit >> 4 == raw >> 4 => {
                self.route(DeviceAddress::X10(house_unit), msg, now);
            }
            _ => debug!("x10 command {:02X} without a unit code", raw),
        }
    }

    fn route(&mut self, addr: DeviceAddress, msg: &Message, now: Instant) {
        let Some(dev) = self.devices.get_mut(&addr) else {
            debug!("message from unknown device {}: {}", addr, msg);
            return;
        };
        let was_waiting = dev.feature_queried().is_some();
        if let Some(at) = dev.handle_message(msg, self.publisher.as_ref(), now) {
            self.queue.add_queue(addr, at);
        }
        // a reply frees the queue right away
        if was_waiting && dev.feature_queried().is_none() && dev.queue_len() > 0 {
            self.queue.add_queue(addr, now);
        }
    }

    fn on_db_complete(&mut self, entries: usize, now: Instant) {
        info!("modem database has {} entries, starting polling", entries);
        let mut linked: Vec<DeviceAddress> = Vec::new();
        for addr in self.devices.keys() {
            if addr.is_x10() {
                continue;
            }
            if self.db.contains(addr) {
                linked.push(*addr);
            } else {
                warn!("device {} not found in the modem database. Did you forget to link?", addr);
            }
        }
        linked.sort_by_key(|a| a.to_bytes());
        self.polls = RequestQueueManager::new();
        if linked.is_empty() {
            return;
        }
        // spread the first round over one interval
        let spacing = self.poll_interval / linked.len() as u32;
        for (i, addr) in linked.into_iter().enumerate() {
            self.polls.add_queue(addr, now + spacing * i as u32);
        }
    }

    fn service_due(&mut self, now: Instant) {
        for addr in self.polls.take_due(now) {
            if let Some(dev) = self.devices.get_mut(&addr) {
                if let Some(at) = dev.do_poll(Duration::ZERO, now) {
                    self.queue.add_queue(addr, at);
                }
                self.polls.add_queue(addr, now + self.poll_interval);
            }
        }
        for addr in self.queue.take_due(now) {
            let Some(dev) = self.devices.get_mut(&addr) else {
                continue;
            };
            if let Some(next) = dev.process_request_queue(now, &self.port) {
                self.queue.add_queue(addr, next);
            }
            if let Some(update) = dev.take_reachability_update() {
                self.publisher.publish(update);
            }
        }
    }

    fn handle_command(
        &mut self,
        addr: DeviceAddress,
        feature: Option<&str>,
        cmd: Command,
        now: Instant,
    ) -> Result<(), String> {
        let dev = self
            .devices
            .get_mut(&addr)
            .ok_or_else(|| format!("unknown device {}", addr))?;
        if let Some(at) = dev.handle_command(feature, cmd, now).map_err(|e| e.to_string())? {
            self.queue.add_queue(addr, at);
        }
        Ok(())
    }

    fn snapshot(&self) -> DriverSnapshot {
        let mut devices: Vec<DeviceSnapshot> = self.devices.values().map(Device::snapshot).collect();
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        DriverSnapshot {
            port: self.port.name().to_string(),
            modem_address: self.modem_address.map(|a| a.to_string()),
            db_complete: self.db.is_complete(),
            db_entries: self.db.len(),
            devices,
            metrics: metrics::snapshot(),
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

/// Build devices from the config, open the port and spawn the port, modem
/// database and driver tasks.
pub async fn start_driver(
    config: &Config,
    connector: Arc<dyn Connector>,
    publisher: Arc<dyn StatePublisher>,
) -> Result<(DriverHandle, Vec<JoinHandle<()>>)> {
    let registry = Arc::new(MessageRegistry::standard());
    let mut types = DeviceTypeRegistry::builtin();
    if let Some(path) = &config.device_types_file {
        let n = types.load_file(path).await?;
        info!("loaded {} device types from {}", n, path);
    }

    let mut devices = Vec::with_capacity(config.devices.len());
    for dc in &config.devices {
        let addr = dc.parsed_address()?;
        let device_type = types
            .get(&dc.product_key)
            .map_err(|e| anyhow!("device {}: {}", dc.address, e))?;
        let dev = Device::from_type(addr, device_type, registry.clone(), config.device_tuning())?
            .with_name(dc.name.clone());
        debug!("configured device {} ({})", addr, dc.product_key);
        devices.push(dev);
    }

    let (port, mut tasks) = start_port(connector, registry.clone(), config.port_tuning()).await?;

    let db = ModemDb::new();
    let builder = ModemDbBuilder::new(db.clone(), registry, config.db_retry_timeout());
    let (db_tx, db_rx) = mpsc::unbounded_channel();
    let db_port_events = port.subscribe();
    let db_writer = port.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = builder.run(db_port_events, db_writer, db_tx).await {
            error!("Modem database task error: {}", e);
        }
    }));

    let driver_events = port.subscribe();
    let (tx, rx) = mpsc::unbounded_channel();
    let driver = Driver::new(port, devices, db, publisher, config.poll_interval());
    tasks.push(tokio::spawn(async move {
        if let Err(e) = driver.run(driver_events, db_rx, rx).await {
            error!("Driver task error: {}", e);
        }
    }));

    Ok((DriverHandle { tx }, tasks))
}
