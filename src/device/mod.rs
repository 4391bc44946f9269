//! # Devices
//!
//! A [`Device`] owns its features (an arena indexed by [`FeatureId`]) and a
//! time-ordered queue of outbound messages. At most one direct query is in
//! flight per device: the queue holds back until the reply arrives or the
//! direct-ack timeout passes.
//!
//! - [`dispatch`] - per-feature dispatchers
//! - [`handlers`] - message, command and poll handlers
//! - [`publish`] - typed state updates going up
//! - [`types`] - product key to feature list
//! - [`queue`] - one timer for all device queues
pub mod dispatch;
pub mod feature;
pub mod handlers;
pub mod publish;
pub mod queue;
pub mod types;

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::time::{Duration, Instant};

pub use feature::{Feature, FeatureId, QueryStatus};
pub use handlers::{Command, CommandKind};
pub use publish::{ChangeType, ChannelPublisher, LogPublisher, StatePublisher, StateUpdate, StateValue};

use dispatch::{dispatch, QueryContext};
use handlers::{CommandHandler, HandlerError, Reaction};
use types::{DeviceType, DeviceTypeError};

use crate::plm::address::DeviceAddress;
use crate::plm::message::fields::COMMAND_1;
use crate::plm::message::Message;
use crate::plm::port::MessageWriter;
use crate::plm::registry::MessageRegistry;

/// Quiet time after a direct message, the device needs it to answer.
pub const QUIET_TIME_DIRECT_MESSAGE: Duration = Duration::from_millis(2000);
/// Spacing between the poll messages of one device.
pub const TIME_BETWEEN_POLL_MESSAGES: Duration = Duration::from_millis(1500);
/// How soon to look again while a query is unanswered.
const QUERY_RECHECK: Duration = Duration::from_millis(2000);
/// Quiet time the transport keeps after each queued write.
const WRITE_QUIET_TIME: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct DeviceTuning {
    /// How long a direct query may stay unanswered.
    pub direct_ack_timeout: Duration,
    /// Unanswered queries in a row before the device is reported unreachable.
    pub dead_device_count: u32,
}

impl Default for DeviceTuning {
    fn default() -> Self {
        Self {
            direct_ack_timeout: Duration::from_millis(6000),
            dead_device_count: 10,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{device} has no feature {feature}")]
    UnknownFeature { device: DeviceAddress, feature: String },
    #[error("{device}: no feature handles {command:?}")]
    NoHandler { device: DeviceAddress, command: Command },
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceStatus {
    Initialized,
    Polling,
}

struct QueueEntry {
    at: Instant,
    seq: u64,
    feature: FeatureId,
    msg: Message,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureSnapshot {
    pub name: String,
    pub template: String,
    pub query_status: QueryStatus,
    pub value: Option<StateValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub address: String,
    pub product_key: String,
    pub name: Option<String>,
    pub status: DeviceStatus,
    pub reachable: bool,
    pub queued: usize,
    pub feature_queried: Option<String>,
    pub features: Vec<FeatureSnapshot>,
}

pub struct Device {
    address: DeviceAddress,
    product_key: String,
    name: Option<String>,
    features: Vec<Feature>,
    status: DeviceStatus,
    registry: Arc<MessageRegistry>,
    tuning: DeviceTuning,
    queue: BinaryHeap<Reverse<QueueEntry>>,
    next_seq: u64,
    feature_queried: Option<FeatureId>,
    queried_command: Option<u8>,
    last_query_time: Option<Instant>,
    last_time_polled: Option<Instant>,
    missed_queries: u32,
    reachable: bool,
    reachability_changed: bool,
}

impl Device {
    pub fn new(
        address: DeviceAddress,
        product_key: &str,
        features: Vec<Feature>,
        registry: Arc<MessageRegistry>,
        tuning: DeviceTuning,
    ) -> Self {
        Self {
            address,
            product_key: product_key.to_string(),
            name: None,
            features,
            status: DeviceStatus::Initialized,
            registry,
            tuning,
            queue: BinaryHeap::new(),
            next_seq: 0,
            feature_queried: None,
            queried_command: None,
            last_query_time: None,
            last_time_polled: None,
            missed_queries: 0,
            reachable: true,
            reachability_changed: false,
        }
    }

    pub fn from_type(
        address: DeviceAddress,
        device_type: &DeviceType,
        registry: Arc<MessageRegistry>,
        tuning: DeviceTuning,
    ) -> Result<Self, DeviceTypeError> {
        let features = device_type.build_features()?;
        Ok(Self::new(address, &device_type.product_key, features, registry, tuning))
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn product_key(&self) -> &str {
        &self.product_key
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn feature(&self, id: FeatureId) -> Option<&Feature> {
        self.features.get(id.0)
    }

    pub fn feature_id(&self, name: &str) -> Option<FeatureId> {
        self.features.iter().position(|f| f.name() == name).map(FeatureId)
    }

    pub fn feature_queried(&self) -> Option<FeatureId> {
        self.feature_queried
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn last_time_polled(&self) -> Option<Instant> {
        self.last_time_polled
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    fn push(&mut self, msg: Message, feature: FeatureId, at: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Reverse(QueueEntry { at, seq, feature, msg }));
    }

    /// Queue `msg` for sending `delay` from now and return when it falls due.
    /// The caller hands that time to the [`queue::RequestQueueManager`].
    pub fn enqueue(&mut self, mut msg: Message, feature: FeatureId, delay: Duration, now: Instant) -> Instant {
        if is_query(&msg) {
            msg.set_quiet_time(QUIET_TIME_DIRECT_MESSAGE);
        }
        let at = now + delay;
        trace!("{}: enqueued {} due in {:?}", self.address, msg, delay);
        self.push(msg, feature, at);
        at
    }

    /// Send the head of the queue if it is due and no query is outstanding.
    /// Returns when the device next wants service, or `None` when the queue
    /// is empty.
    pub fn process_request_queue(&mut self, now: Instant, writer: &dyn MessageWriter) -> Option<Instant> {
        let head = self.queue.peek()?.0.at;
        if head > now {
            return Some(head);
        }
        if let Some(id) = self.feature_queried {
            let expires = self
                .last_query_time
                .map_or(now, |t| t + self.tuning.direct_ack_timeout);
            if now < expires {
                return Some(now + QUERY_RECHECK);
            }
            debug!("gave up waiting for query reply from device {}", self.address);
            if let Some(f) = self.features.get_mut(id.0) {
                f.set_query_status(QueryStatus::NotPending);
            }
            self.clear_query();
            self.note_missed_query();
        }
        let Reverse(entry) = self.queue.pop()?;
        let mut msg = entry.msg;
        if is_query(&msg) {
            self.last_query_time = Some(now);
            self.queried_command = msg.get_byte(COMMAND_1).ok();
            if let Some(f) = self.features.get_mut(entry.feature.0) {
                f.set_query_status(QueryStatus::QueryPending);
            }
            self.feature_queried = Some(entry.feature);
        }
        let quiet = msg.quiet_time();
        msg.set_quiet_time(WRITE_QUIET_TIME);
        trace!("{}: writing {}", self.address, msg);
        if let Err(e) = writer.write(msg) {
            error!("{}: failed to send queued message: {}", self.address, e);
        }
        let after_quiet = now + quiet;
        Some(match self.queue.peek() {
            Some(Reverse(next)) => after_quiet.max(next.at),
            None => after_quiet,
        })
    }

    fn clear_query(&mut self) {
        self.feature_queried = None;
        self.queried_command = None;
    }

    fn note_missed_query(&mut self) {
        self.missed_queries += 1;
        if self.reachable && self.missed_queries > self.tuning.dead_device_count {
            warn!(
                "{}: {} queries unanswered, marking unreachable",
                self.address, self.missed_queries
            );
            self.reachable = false;
            self.reachability_changed = true;
        }
    }

    /// Reachability change since the last call, if any.
    pub fn take_reachability_update(&mut self) -> Option<StateUpdate> {
        if !std::mem::take(&mut self.reachability_changed) {
            return None;
        }
        Some(StateUpdate::new(
            self.address,
            "reachable",
            StateValue::Reachable(self.reachable),
        ))
    }

    /// Queue the poll messages of every feature, spaced apart, starting
    /// `delay` from now. Returns the first due time if anything was queued.
    pub fn do_poll(&mut self, delay: Duration, now: Instant) -> Option<Instant> {
        let mut polls = Vec::new();
        for (i, f) in self.features.iter().enumerate() {
            match f.poll_handler().make_msg(self.address, &self.registry) {
                Ok(Some(m)) => polls.push((FeatureId(i), m)),
                Ok(None) => {}
                Err(e) => warn!("{}:{} cannot build poll message: {}", self.address, f.name(), e),
            }
        }
        if polls.is_empty() {
            return None;
        }
        let start = now + delay;
        let mut at = start;
        for (id, m) in polls {
            self.push(m, id, at);
            at += TIME_BETWEEN_POLL_MESSAGES;
        }
        self.status = DeviceStatus::Polling;
        self.last_time_polled = Some(now);
        Some(start)
    }

    fn poll_feature(&mut self, id: FeatureId, now: Instant) -> Option<Instant> {
        let f = self.features.get(id.0)?;
        match f.poll_handler().make_msg(self.address, &self.registry) {
            Ok(Some(m)) => Some(self.enqueue(m, id, Duration::ZERO, now)),
            Ok(None) => None,
            Err(e) => {
                warn!("{}:{} cannot build poll message: {}", self.address, f.name(), e);
                None
            }
        }
    }

    /// Apply an inbound message. Regular features are tried first and the
    /// first one whose query it answers stops the scan; status features
    /// always see it. Returns a due time if follow-up messages were queued.
    pub fn handle_message(&mut self, msg: &Message, publisher: &dyn StatePublisher, now: Instant) -> Option<Instant> {
        self.missed_queries = 0;
        if !self.reachable {
            info!("{}: reachable again", self.address);
            self.reachable = true;
            publisher.publish(StateUpdate::new(self.address, "reachable", StateValue::Reachable(true)));
        }

        let query = QueryContext {
            queried: self.feature_queried,
            queried_command: self.queried_command,
        };
        let mut reactions = Vec::new();
        for i in 0..self.features.len() {
            if self.features[i].is_status_feature() {
                continue;
            }
            let d = dispatch(&mut self.features, FeatureId(i), msg, query);
            reactions.extend(d.reactions);
            if d.consumed {
                trace!("{}:{} answered query", self.address, self.features[i].name());
                self.clear_query();
                break;
            }
        }
        for i in 0..self.features.len() {
            if self.features[i].is_status_feature() {
                reactions.extend(dispatch(&mut self.features, FeatureId(i), msg, query).reactions);
            }
        }

        let mut wake: Option<Instant> = None;
        for (id, reaction) in reactions {
            match reaction {
                Reaction::Publish(value, change) => {
                    if let Some(f) = self.features.get_mut(id.0) {
                        f.publish(self.address, value, change, publisher);
                    }
                }
                Reaction::Poll => {
                    if let Some(at) = self.poll_feature(id, now) {
                        wake = Some(wake.map_or(at, |w| w.min(at)));
                    }
                }
            }
        }
        wake
    }

    /// First feature with a real handler for `kind`.
    fn feature_for(&self, kind: CommandKind) -> Option<FeatureId> {
        self.features
            .iter()
            .position(|f| f.command_handler(kind) != CommandHandler::Warn)
            .map(FeatureId)
    }

    /// Turn a command into queued messages. Without a feature name the
    /// first feature that handles the command gets it; a refresh without a
    /// feature polls the whole device.
    pub fn handle_command(
        &mut self,
        feature: Option<&str>,
        cmd: Command,
        now: Instant,
    ) -> Result<Option<Instant>, DeviceError> {
        let id = match feature {
            Some(name) => self.feature_id(name).ok_or_else(|| DeviceError::UnknownFeature {
                device: self.address,
                feature: name.to_string(),
            })?,
            None if cmd == Command::Refresh => return Ok(self.do_poll(Duration::ZERO, now)),
            None => self.feature_for(cmd.kind()).ok_or(DeviceError::NoHandler {
                device: self.address,
                command: cmd,
            })?,
        };
        if cmd == Command::Refresh {
            return Ok(self.poll_feature(id, now));
        }
        let handler = self.features[id.0].command_handler(cmd.kind());
        if handler == CommandHandler::Warn {
            warn!("{}:{} has no handler for {:?}", self.address, self.features[id.0].name(), cmd);
            return Err(DeviceError::NoHandler {
                device: self.address,
                command: cmd,
            });
        }
        let msgs = handler.build(cmd, self.address, &self.registry)?;
        info!(
            "{}:{} {} -> {} message(s) for {:?}",
            self.address,
            self.features[id.0].name(),
            handler.name(),
            msgs.len(),
            cmd
        );
        let mut first = None;
        for m in msgs {
            let at = self.enqueue(m, id, Duration::ZERO, now);
            first.get_or_insert(at);
        }
        Ok(first)
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            address: self.address.to_string(),
            product_key: self.product_key.clone(),
            name: self.name.clone(),
            status: self.status,
            reachable: self.reachable,
            queued: self.queue.len(),
            feature_queried: self
                .feature_queried
                .and_then(|id| self.feature(id))
                .map(|f| f.name().to_string()),
            features: self
                .features
                .iter()
                .map(|f| FeatureSnapshot {
                    name: f.name().to_string(),
                    template: f.template().to_string(),
                    query_status: f.query_status(),
                    value: f.last_value().cloned(),
                })
                .collect(),
        }
    }
}

/// Direct Insteon messages expect an answer from the device. Broadcasts and
/// X10 do not.
fn is_query(msg: &Message) -> bool {
    !msg.is_broadcast() && !msg.is_x10()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plm::port::PortError;
    use std::cell::RefCell;
    use types::DeviceTypeRegistry;

    #[derive(Default)]
    struct Recorder(RefCell<Vec<Message>>);

    impl MessageWriter for Recorder {
        fn write(&self, msg: Message) -> Result<(), PortError> {
            self.0.borrow_mut().push(msg);
            Ok(())
        }
    }

    const IM: [u8; 3] = [0x44, 0x85, 0x11];

    fn device(key: &str) -> Device {
        let reg = Arc::new(MessageRegistry::standard());
        let types = DeviceTypeRegistry::builtin();
        Device::from_type(
            DeviceAddress::insteon(0x28, 0xC3, 0x91),
            types.get(key).unwrap(),
            reg,
            DeviceTuning {
                direct_ack_timeout: Duration::from_millis(6000),
                dead_device_count: 1,
            },
        )
        .unwrap()
    }

    fn ack(cmd2: u8) -> Message {
        let reg = MessageRegistry::standard();
        let mut bytes = vec![0x02, 0x50, 0x28, 0xC3, 0x91];
        bytes.extend_from_slice(&IM);
        bytes.extend_from_slice(&[0x2B, 0x00, cmd2]);
        Message::from_bytes(reg.reply_definition(0x50, false).unwrap(), &bytes).unwrap()
    }

    #[test]
    fn one_query_in_flight_until_answered() {
        let mut dev = device("F00.00.02");
        let w = Recorder::default();
        let t0 = Instant::now();
        assert_eq!(dev.do_poll(Duration::ZERO, t0), Some(t0));
        let switch = dev.feature_id("switch").unwrap();
        dev.handle_command(Some("switch"), Command::On, t0).unwrap();
        assert_eq!(dev.queue_len(), 2);

        // poll goes out first and becomes the pending query; the command
        // behind it is already due
        assert_eq!(dev.process_request_queue(t0, &w), Some(t0));
        assert_eq!(w.0.borrow().len(), 1);
        assert_eq!(w.0.borrow()[0].quiet_time(), WRITE_QUIET_TIME);
        assert_eq!(dev.feature_queried(), Some(switch));
        assert_eq!(dev.features()[switch.0].query_status(), QueryStatus::QueryPending);

        // held back while the query is unanswered
        let t1 = t0 + Duration::from_millis(100);
        assert_eq!(dev.process_request_queue(t1, &w), Some(t1 + QUERY_RECHECK));
        assert_eq!(w.0.borrow().len(), 1);

        let (publisher, mut rx) = ChannelPublisher::new();
        dev.handle_message(&ack(0xFF), &publisher, t1);
        assert_eq!(dev.feature_queried(), None);
        assert_eq!(dev.features()[switch.0].query_status(), QueryStatus::QueryAnswered);
        let update = rx.try_recv().unwrap();
        assert_eq!((update.feature.as_str(), update.value), ("switch", StateValue::OnOff(true)));

        dev.process_request_queue(t1, &w);
        assert_eq!(w.0.borrow().len(), 2);
        assert_eq!(w.0.borrow()[1].bytes(), &[0x02, 0x62, 0x28, 0xC3, 0x91, 0x0F, 0x11, 0xFF]);
    }

    #[test]
    fn gives_up_after_direct_ack_timeout() {
        let mut dev = device("F00.00.02");
        let w = Recorder::default();
        let t0 = Instant::now();
        dev.handle_command(Some("switch"), Command::On, t0).unwrap();
        dev.handle_command(Some("switch"), Command::Off, t0).unwrap();
        dev.process_request_queue(t0, &w);
        let late = t0 + Duration::from_millis(6001);
        dev.process_request_queue(late, &w);
        assert_eq!(w.0.borrow().len(), 2);
        assert_eq!(dev.feature_queried(), dev.feature_id("switch"));
        assert!(dev.take_reachability_update().is_none());

        // second miss exceeds dead_device_count = 1
        dev.handle_command(Some("switch"), Command::On, late).unwrap();
        dev.process_request_queue(late + Duration::from_millis(6001), &w);
        let update = dev.take_reachability_update().unwrap();
        assert_eq!(update.value, StateValue::Reachable(false));
        assert!(dev.take_reachability_update().is_none());

        let (publisher, mut rx) = ChannelPublisher::new();
        dev.handle_message(&ack(0x00), &publisher, late);
        assert!(dev.is_reachable());
        assert_eq!(rx.try_recv().unwrap().value, StateValue::Reachable(true));
    }

    #[test]
    fn polls_are_spaced() {
        let mut dev = device("F00.00.24");
        let t0 = Instant::now();
        assert_eq!(dev.do_poll(Duration::from_secs(1), t0), Some(t0 + Duration::from_secs(1)));
        assert_eq!(dev.queue_len(), 2);
        assert_eq!(dev.status(), DeviceStatus::Polling);
        let w = Recorder::default();
        // not due yet
        assert_eq!(dev.process_request_queue(t0, &w), Some(t0 + Duration::from_secs(1)));
        assert!(w.0.borrow().is_empty());
        let t1 = t0 + Duration::from_secs(1);
        let next = dev.process_request_queue(t1, &w).unwrap();
        assert_eq!(next, t1 + TIME_BETWEEN_POLL_MESSAGES);
    }

    #[test]
    fn commands_without_feature_pick_a_handler() {
        let mut dev = device("F00.00.01");
        let t0 = Instant::now();
        dev.handle_command(None, Command::Percent(50), t0).unwrap();
        assert_eq!(dev.queue_len(), 1);
        assert!(matches!(
            dev.handle_command(None, Command::Number(2), t0),
            Err(DeviceError::NoHandler { .. })
        ));
        assert!(matches!(
            dev.handle_command(Some("nope"), Command::On, t0),
            Err(DeviceError::UnknownFeature { .. })
        ));
        // fastonoff has a handler for on/off only
        assert!(dev.handle_command(Some("fastonoff"), Command::Increase, t0).is_err());
        assert!(dev.handle_command(None, Command::Refresh, t0).unwrap().is_some());
    }

    #[test]
    fn snapshot_reports_features() {
        let dev = device("F00.00.15");
        let snap = dev.snapshot();
        assert_eq!(snap.address, "28.C3.91");
        assert_eq!(snap.features.len(), 7);
        assert!(snap.features.iter().any(|f| f.name == "keypadbuttons"));
    }

    fn pending_queries(dev: &Device) -> usize {
        dev.features()
            .iter()
            .filter(|f| f.query_status() == QueryStatus::QueryPending)
            .count()
    }

    #[test]
    fn only_one_feature_waits_for_a_reply() {
        let mut dev = device("F00.00.24");
        let w = Recorder::default();
        let (publisher, _rx) = ChannelPublisher::new();
        let t0 = Instant::now();
        dev.do_poll(Duration::ZERO, t0);
        dev.handle_command(Some("lightdimmer"), Command::Percent(50), t0).unwrap();
        dev.handle_command(Some("fan"), Command::Number(2), t0).unwrap();
        assert_eq!(dev.queue_len(), 4);

        dev.process_request_queue(t0, &w);
        assert_eq!(w.0.borrow().len(), 1);
        assert_eq!(pending_queries(&dev), 1);

        // everything else is held back, whichever feature it belongs to
        let t1 = t0 + Duration::from_millis(100);
        dev.process_request_queue(t1, &w);
        assert_eq!(w.0.borrow().len(), 1);
        assert_eq!(pending_queries(&dev), 1);

        dev.handle_message(&ack(0x80), &publisher, t1);
        assert_eq!(pending_queries(&dev), 0);
        assert_eq!(dev.feature_queried(), None);

        dev.process_request_queue(t1, &w);
        assert_eq!(w.0.borrow().len(), 2);
        assert_eq!(pending_queries(&dev), 1);

        // unanswered: given up, and the next message takes the slot
        let late = t1 + Duration::from_millis(6001);
        dev.process_request_queue(late, &w);
        assert_eq!(w.0.borrow().len(), 3);
        assert_eq!(pending_queries(&dev), 1);

        // the reply to the abandoned query shows up after all
        dev.handle_message(&ack(0x00), &publisher, late);
        assert!(pending_queries(&dev) <= 1);

        let mut now = late;
        for _ in 0..20 {
            if dev.queue_len() == 0 {
                break;
            }
            if dev.feature_queried().is_some() {
                dev.handle_message(&ack(0xAA), &publisher, now);
                assert!(pending_queries(&dev) <= 1);
            }
            let next = dev.process_request_queue(now, &w);
            assert!(pending_queries(&dev) <= 1);
            now = next.unwrap_or(now).max(now + Duration::from_secs(7));
        }
        assert_eq!(dev.queue_len(), 0);
        assert_eq!(w.0.borrow().len(), 4);
    }
}
