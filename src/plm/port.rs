//! Half-duplex transport to the modem.
//!
//! The PLM accepts one command at a time and answers each with an echo that
//! carries an ACK/NACK byte (or a bare `0x15` when it could not even parse the
//! command). One writer task owns the send side and one reader task owns the
//! receive side; they share the link behind a mutex and rendezvous through a
//! [`ReplyLatch`]:
//!
//! ```text
//!   writer:  arm latch -> write bytes -> wait(ack_timeout)
//!   reader:  frame bytes -> every listener gets the message
//!                        -> non-unsolicited reply completes the latch
//! ```
//!
//! A NACK or a timeout makes the writer sleep `retry_delay` and retransmit, up
//! to `max_retries` times. Every message is followed by its quiet time.
//!
//! Any hard I/O error closes the link and reopens it through the
//! [`Connector`], following the configured backoff. Listeners are told with
//! [`PortEvent::Reconnected`].
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use log::{debug, error, info, trace, warn};
use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, Duration, Instant};

use super::framer::MessageFramer;
use super::message::Message;
use super::registry::MessageRegistry;
use crate::logutil::hex_snippet;
use crate::metrics;

/// Attempts after the first one when opening the link at startup.
const OPEN_RETRIES: u32 = 5;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct PortTuning {
    pub read_timeout: Duration,
    pub ack_timeout: Duration,
    /// Retransmissions after the first attempt.
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Reconnect delays; the last one repeats.
    pub reconnect_backoff: Vec<Duration>,
}

impl Default for PortTuning {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(50),
            ack_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            reconnect_backoff: [500, 1000, 2000, 5000, 10_000]
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }
}

/// Anything byte-duplex the modem can sit behind.
pub trait ModemIo: Read + Write + Send {}

impl<T: Read + Write + Send> ModemIo for T {}

pub type SharedLink = Arc<Mutex<Box<dyn ModemIo>>>;

/// Opens (and reopens) the link.
pub trait Connector: Send + Sync {
    fn open(&self) -> io::Result<Box<dyn ModemIo>>;
    fn name(&self) -> String;
}

#[cfg(feature = "serial")]
pub struct SerialConnector {
    pub port_name: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

#[cfg(feature = "serial")]
impl Connector for SerialConnector {
    fn open(&self) -> io::Result<Box<dyn ModemIo>> {
        debug!("Opening serial port {} at {} baud", self.port_name, self.baud_rate);
        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(self.read_timeout)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .open()?;
        // Drop whatever the modem buffered while nobody was listening.
        let _ = port.clear(serialport::ClearBuffer::Input);
        Ok(Box::new(port))
    }

    fn name(&self) -> String {
        self.port_name.clone()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("port is shut down")]
    Closed,
}

/// Outbound side of the port as seen by devices and the DB builder.
pub trait MessageWriter {
    fn write(&self, msg: Message) -> Result<(), PortError>;
}

#[derive(Debug)]
pub enum ControlMessage {
    Shutdown,
    /// Drop and reopen the link (sent to the reader by the writer on I/O errors).
    Reconnect,
}

#[derive(Debug, Clone)]
pub enum PortEvent {
    Message(Message),
    Reconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyState {
    Idle,
    WaitingForAck,
    GotAck,
    GotNack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    Ack,
    Nack,
    Timeout,
}

/// Writer/reader rendezvous for the modem's echo.
pub struct ReplyLatch {
    state: Mutex<ReplyState>,
    notify: Notify,
}

impl Default for ReplyLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyLatch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ReplyState::Idle),
            notify: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, ReplyState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Must be called before the bytes go out.
    pub fn arm(&self) {
        *self.state() = ReplyState::WaitingForAck;
    }

    pub fn disarm(&self) {
        *self.state() = ReplyState::Idle;
    }

    /// Record a reply. Ignored unless a writer is waiting.
    pub fn complete(&self, ack: bool) -> bool {
        let mut state = self.state();
        if *state != ReplyState::WaitingForAck {
            return false;
        }
        *state = if ack { ReplyState::GotAck } else { ReplyState::GotNack };
        self.notify.notify_one();
        true
    }

    fn take(&self) -> Option<ReplyOutcome> {
        let mut state = self.state();
        let outcome = match *state {
            ReplyState::GotAck => ReplyOutcome::Ack,
            ReplyState::GotNack => ReplyOutcome::Nack,
            _ => return None,
        };
        *state = ReplyState::Idle;
        Some(outcome)
    }

    pub async fn wait(&self, timeout: Duration) -> ReplyOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(outcome) = self.take() {
                return outcome;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let mut state = self.state();
                let outcome = match *state {
                    ReplyState::GotAck => ReplyOutcome::Ack,
                    ReplyState::GotNack => ReplyOutcome::Nack,
                    _ => ReplyOutcome::Timeout,
                };
                *state = ReplyState::Idle;
                return outcome;
            }
        }
    }
}

type Listeners = Arc<Mutex<Vec<mpsc::UnboundedSender<PortEvent>>>>;

fn lock_listeners(listeners: &Listeners) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<PortEvent>>> {
    listeners.lock().unwrap_or_else(|e| e.into_inner())
}

fn broadcast(listeners: &Listeners, event: PortEvent) {
    // Closed receivers are pruned on the way.
    lock_listeners(listeners).retain(|tx| tx.send(event.clone()).is_ok());
}

fn lock_link(link: &SharedLink) -> MutexGuard<'_, Box<dyn ModemIo>> {
    link.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct PortReader {
    link: SharedLink,
    connector: Arc<dyn Connector>,
    registry: Arc<MessageRegistry>,
    framer: MessageFramer,
    latch: Arc<ReplyLatch>,
    listeners: Listeners,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    tuning: PortTuning,
}

impl PortReader {
    pub async fn run(mut self) -> Result<()> {
        info!("Starting port reader on {}", self.connector.name());
        let mut interval = tokio::time::interval(Duration::from_millis(10));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                control_msg = self.control_rx.recv() => {
                    match control_msg {
                        Some(ControlMessage::Shutdown) => {
                            info!("Reader task received shutdown signal");
                            break;
                        }
                        Some(ControlMessage::Reconnect) => {
                            if !self.reconnect().await {
                                break;
                            }
                        }
                        None => {
                            warn!("Control channel closed, shutting down reader");
                            break;
                        }
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.read_and_process() {
                        match e.kind() {
                            io::ErrorKind::Interrupted => {
                                debug!("Reader interrupted (EINTR)");
                            }
                            _ => {
                                warn!("Read error on {}: {}", self.connector.name(), e);
                                if !self.reconnect().await {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }

        // Dropping the senders closes every listener channel.
        lock_listeners(&self.listeners).clear();
        info!("Port reader shutting down");
        Ok(())
    }

    fn read_and_process(&mut self) -> io::Result<()> {
        let mut buffer = [0u8; 1024];
        let read_result = {
            let mut port = lock_link(&self.link);
            port.read(&mut buffer)
        };
        match read_result {
            Ok(n) if n > 0 => {
                trace!("RAW {} bytes: {}", n, hex_snippet(&buffer[..n], 64));
                self.process_bytes(&buffer[..n]);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(ref e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn process_bytes(&mut self, data: &[u8]) {
        if let Err(e) = self.framer.add_bytes(data) {
            metrics::inc_framing_errors();
            warn!("{}", e);
        }
        loop {
            match self.framer.next_message() {
                Ok(Some(msg)) => self.deliver(msg),
                Ok(None) => break,
                Err(e) => {
                    metrics::inc_framing_errors();
                    warn!("Framing error: {}", e);
                }
            }
        }
    }

    fn deliver(&self, msg: Message) {
        metrics::inc_frames_decoded();
        debug!("got msg: {}", msg);
        if msg.is_pure_nack() {
            metrics::inc_pure_nacks();
            self.latch.complete(false);
        } else if !msg.is_unsolicited() {
            self.latch.complete(true);
        }
        broadcast(&self.listeners, PortEvent::Message(msg));
    }

    /// Returns false if shutdown was requested while reconnecting.
    async fn reconnect(&mut self) -> bool {
        warn!("Link to {} lost, reconnecting", self.connector.name());
        let mut attempt = 0usize;
        loop {
            let delay = self.backoff_delay(attempt);
            tokio::select! {
                control_msg = self.control_rx.recv() => {
                    match control_msg {
                        Some(ControlMessage::Reconnect) => continue,
                        _ => return false,
                    }
                }
                _ = sleep(delay) => {}
            }
            match self.connector.open() {
                Ok(io) => {
                    *lock_link(&self.link) = io;
                    self.framer = MessageFramer::new(self.registry.clone());
                    metrics::inc_reconnects();
                    info!("Reconnected to {} after {} attempt(s)", self.connector.name(), attempt + 1);
                    // Collapse reconnect requests queued while we were down.
                    loop {
                        match self.control_rx.try_recv() {
                            Ok(ControlMessage::Reconnect) => continue,
                            Ok(ControlMessage::Shutdown) => return false,
                            Err(mpsc::error::TryRecvError::Empty) => break,
                            Err(mpsc::error::TryRecvError::Disconnected) => return false,
                        }
                    }
                    broadcast(&self.listeners, PortEvent::Reconnected);
                    return true;
                }
                Err(e) => {
                    warn!("Reconnect attempt {} to {} failed: {}", attempt + 1, self.connector.name(), e);
                    attempt += 1;
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: usize) -> Duration {
        let schedule = &self.tuning.reconnect_backoff;
        let base = match schedule.get(attempt.min(schedule.len().saturating_sub(1))) {
            Some(d) => *d,
            None => OPEN_RETRY_DELAY,
        };
        let max_jitter = base.as_millis() as u64 / 4;
        let jitter = if max_jitter > 0 {
            rand::thread_rng().gen_range(0..=max_jitter)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }
}

/// Send side state, split from [`PortWriter`] so a send can race the control channel.
struct WriterLink {
    link: SharedLink,
    latch: Arc<ReplyLatch>,
    reader_control_tx: mpsc::UnboundedSender<ControlMessage>,
    tuning: PortTuning,
}

impl WriterLink {
    fn write_bytes(&self, data: &[u8]) -> io::Result<()> {
        let mut port = lock_link(&self.link);
        port.write_all(data)?;
        port.flush()
    }

    /// Write, wait for the echo, retransmit on NACK/timeout, then observe the quiet time.
    async fn send(&self, msg: &Message) -> ReplyOutcome {
        debug!("writing ({}ms): {}", msg.quiet_time().as_millis(), msg);
        metrics::inc_writes();
        let started = std::time::Instant::now();
        let mut retries = 0u32;
        let outcome = loop {
            self.latch.arm();
            let outcome = match self.write_bytes(msg.bytes()) {
                Ok(()) => {
                    trace!("TX {}", msg.to_hex());
                    self.latch.wait(self.tuning.ack_timeout).await
                }
                Err(e) => {
                    self.latch.disarm();
                    warn!("Write to modem failed: {}", e);
                    let _ = self.reader_control_tx.send(ControlMessage::Reconnect);
                    ReplyOutcome::Nack
                }
            };
            match outcome {
                ReplyOutcome::Ack => {
                    metrics::inc_acks();
                    metrics::observe_ack_latency(started);
                    break outcome;
                }
                ReplyOutcome::Nack => {
                    metrics::inc_nacks();
                    debug!("writer got nack for {}", msg.name());
                }
                ReplyOutcome::Timeout => {
                    metrics::inc_timeouts();
                    debug!("writer timeout expired, asking for retransmit");
                }
            }
            if retries >= self.tuning.max_retries {
                metrics::inc_write_failures();
                error!(
                    "Giving up on {} after {} attempts",
                    msg,
                    self.tuning.max_retries + 1
                );
                break outcome;
            }
            retries += 1;
            metrics::inc_retries();
            sleep(self.tuning.retry_delay).await;
            info!("retransmitting msg: {}", msg);
        };
        if !msg.quiet_time().is_zero() {
            sleep(msg.quiet_time()).await;
        }
        outcome
    }
}

pub struct PortWriter {
    io: WriterLink,
    outgoing_rx: mpsc::UnboundedReceiver<Message>,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
}

impl PortWriter {
    pub async fn run(mut self) -> Result<()> {
        info!("Starting port writer");
        loop {
            let msg = tokio::select! {
                control_msg = self.control_rx.recv() => {
                    match control_msg {
                        Some(ControlMessage::Reconnect) => continue,
                        _ => break,
                    }
                }
                msg = self.outgoing_rx.recv() => {
                    match msg {
                        Some(m) => m,
                        None => break,
                    }
                }
            };
            // A reconnect request must not cut a send short; only shutdown does.
            let send = self.io.send(&msg);
            tokio::pin!(send);
            let stopped = loop {
                tokio::select! {
                    _ = &mut send => break false,
                    control_msg = self.control_rx.recv() => {
                        if !matches!(control_msg, Some(ControlMessage::Reconnect)) {
                            break true;
                        }
                    }
                }
            };
            if stopped {
                self.io.latch.disarm();
                break;
            }
        }
        info!("Port writer shutting down");
        Ok(())
    }
}

/// Cloneable front door to a running port.
#[derive(Clone)]
pub struct PortHandle {
    outgoing_tx: mpsc::UnboundedSender<Message>,
    reader_control_tx: mpsc::UnboundedSender<ControlMessage>,
    writer_control_tx: mpsc::UnboundedSender<ControlMessage>,
    listeners: Listeners,
    registry: Arc<MessageRegistry>,
    name: String,
}

impl PortHandle {
    /// New listener channel. Every inbound message is delivered in wire order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PortEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock_listeners(&self.listeners).push(tx);
        rx
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shutdown(&self) {
        let _ = self.writer_control_tx.send(ControlMessage::Shutdown);
        let _ = self.reader_control_tx.send(ControlMessage::Shutdown);
    }
}

impl MessageWriter for PortHandle {
    fn write(&self, msg: Message) -> Result<(), PortError> {
        trace!("offering message: {}", msg);
        self.outgoing_tx.send(msg).map_err(|_| PortError::Closed)
    }
}

async fn open_with_retries(connector: &dyn Connector) -> Result<Box<dyn ModemIo>> {
    let mut attempt = 0;
    loop {
        match connector.open() {
            Ok(io) => return Ok(io),
            Err(e) if attempt < OPEN_RETRIES => {
                info!("failed to open port {} ({}), retrying", connector.name(), e);
                attempt += 1;
                sleep(OPEN_RETRY_DELAY).await;
            }
            Err(e) => {
                return Err(anyhow!(
                    "Failed to open port {} after {} attempts: {}",
                    connector.name(),
                    attempt + 1,
                    e
                ))
            }
        }
    }
}

/// Open the link and build the reader, writer and handle. Spawn
/// `reader.run()` and `writer.run()` to start moving bytes.
pub async fn create_port_system(
    connector: Arc<dyn Connector>,
    registry: Arc<MessageRegistry>,
    tuning: PortTuning,
) -> Result<(PortReader, PortWriter, PortHandle)> {
    let io = open_with_retries(connector.as_ref()).await?;
    let link: SharedLink = Arc::new(Mutex::new(io));
    let latch = Arc::new(ReplyLatch::new());
    let listeners: Listeners = Arc::new(Mutex::new(Vec::new()));

    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel::<Message>();
    let (reader_control_tx, reader_control_rx) = mpsc::unbounded_channel::<ControlMessage>();
    let (writer_control_tx, writer_control_rx) = mpsc::unbounded_channel::<ControlMessage>();

    let name = connector.name();
    let reader = PortReader {
        link: link.clone(),
        connector,
        registry: registry.clone(),
        framer: MessageFramer::new(registry.clone()),
        latch: latch.clone(),
        listeners: listeners.clone(),
        control_rx: reader_control_rx,
        tuning: tuning.clone(),
    };
    let writer = PortWriter {
        io: WriterLink {
            link,
            latch,
            reader_control_tx: reader_control_tx.clone(),
            tuning,
        },
        outgoing_rx,
        control_rx: writer_control_rx,
    };
    let handle = PortHandle {
        outgoing_tx,
        reader_control_tx,
        writer_control_tx,
        listeners,
        registry,
        name,
    };
    Ok((reader, writer, handle))
}

/// [`create_port_system`] plus spawning both tasks.
pub async fn start_port(
    connector: Arc<dyn Connector>,
    registry: Arc<MessageRegistry>,
    tuning: PortTuning,
) -> Result<(PortHandle, Vec<tokio::task::JoinHandle<()>>)> {
    let (reader, writer, handle) = create_port_system(connector, registry, tuning).await?;
    let reader_task = tokio::spawn(async move {
        if let Err(e) = reader.run().await {
            error!("Reader task error: {}", e);
        }
    });
    let writer_task = tokio::spawn(async move {
        if let Err(e) = writer.run().await {
            error!("Writer task error: {}", e);
        }
    });
    Ok((handle, vec![reader_task, writer_task]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latch_reply_before_wait_is_not_lost() {
        let latch = ReplyLatch::new();
        latch.arm();
        assert!(latch.complete(true));
        assert_eq!(latch.wait(Duration::from_millis(10)).await, ReplyOutcome::Ack);
    }

    #[tokio::test]
    async fn latch_ignores_replies_when_idle() {
        let latch = ReplyLatch::new();
        assert!(!latch.complete(true));
        latch.arm();
        assert_eq!(latch.wait(Duration::from_millis(20)).await, ReplyOutcome::Timeout);
        assert!(!latch.complete(false));
    }

    #[tokio::test]
    async fn latch_wakes_waiter() {
        let latch = Arc::new(ReplyLatch::new());
        latch.arm();
        let l2 = latch.clone();
        let waiter = tokio::spawn(async move { l2.wait(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        latch.complete(false);
        assert_eq!(waiter.await.unwrap(), ReplyOutcome::Nack);
    }

    #[tokio::test]
    async fn writer_finishes_a_send_across_a_reconnect_request() {
        use crate::plm::memory::MemoryModem;
        use crate::plm::message::ACK;

        let mut first = true;
        let modem = MemoryModem::with_responder(move |out| {
            if std::mem::take(&mut first) {
                return Vec::new();
            }
            let mut reply = out.to_vec();
            match out.get(1) {
                Some(0x60) => reply.extend_from_slice(&[0x44, 0x85, 0x11, 0x03, 0x15, 0x9B, ACK]),
                _ => reply.extend_from_slice(&[0x00, 0x00, 0x00, ACK]),
            }
            reply
        });
        let registry = Arc::new(MessageRegistry::standard());
        let tuning = PortTuning {
            read_timeout: Duration::from_millis(5),
            ack_timeout: Duration::from_millis(100),
            retry_delay: Duration::from_millis(10),
            ..PortTuning::default()
        };
        let (reader, writer, handle) = create_port_system(Arc::new(modem.connector()), registry.clone(), tuning)
            .await
            .unwrap();
        tokio::spawn(reader.run());
        tokio::spawn(writer.run());
        let mut events = handle.subscribe();

        handle.write(registry.make("GetIMInfo").unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.writer_control_tx.send(ControlMessage::Reconnect).unwrap();

        let echo = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("retransmission never acknowledged")
            .unwrap();
        assert!(matches!(echo, PortEvent::Message(m) if m.command_number() == 0x60));
        assert_eq!(modem.writes(), vec![vec![0x02, 0x60], vec![0x02, 0x60]]);

        // still serving the queue afterwards
        handle.write(registry.make("GetIMConfiguration").unwrap()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert_eq!(modem.writes().len(), 3);
        handle.shutdown();
    }
}
