//! Upward interface: typed state updates leaving the driver.
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::plm::address::DeviceAddress;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value")]
pub enum StateValue {
    OnOff(bool),
    Percent(u8),
    Decimal(f64),
    Timestamp(DateTime<Utc>),
    Reachable(bool),
}

impl std::fmt::Display for StateValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateValue::OnOff(true) => write!(f, "ON"),
            StateValue::OnOff(false) => write!(f, "OFF"),
            StateValue::Percent(p) => write!(f, "{}%", p),
            StateValue::Decimal(d) => write!(f, "{}", d),
            StateValue::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            StateValue::Reachable(true) => write!(f, "ONLINE"),
            StateValue::Reachable(false) => write!(f, "OFFLINE"),
        }
    }
}

/// Whether a repeat of the last published value goes out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Changed,
    Always,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateUpdate {
    pub device: String,
    pub feature: String,
    pub value: StateValue,
}

impl StateUpdate {
    pub fn new(device: DeviceAddress, feature: &str, value: StateValue) -> Self {
        Self {
            device: device.to_string(),
            feature: feature.to_string(),
            value,
        }
    }
}

pub trait StatePublisher: Send + Sync {
    fn publish(&self, update: StateUpdate);
}

/// Forwards updates into an unbounded channel.
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<StateUpdate>,
}

impl ChannelPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StateUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatePublisher for ChannelPublisher {
    fn publish(&self, update: StateUpdate) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(update);
    }
}

pub struct LogPublisher;

impl StatePublisher for LogPublisher {
    fn publish(&self, update: StateUpdate) {
        info!("{}:{} -> {}", update.device, update.feature, update.value);
    }
}
