//! One controllable or observable aspect of a device.
use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use super::dispatch::Dispatcher;
use super::handlers::{
    CommandHandler, CommandKind, GroupMessage, GroupMessageStateMachine, HandlerEntry, MessageHandler, PollHandler,
};
use super::publish::{ChangeType, StatePublisher, StateUpdate, StateValue};
use crate::plm::address::DeviceAddress;

/// Index into a device's feature arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeatureId(pub usize);

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueryStatus {
    NotPending,
    QueryPending,
    QueryAnswered,
}

#[derive(Debug, Clone)]
pub struct Feature {
    name: String,
    template: String,
    status_feature: bool,
    dispatcher: Dispatcher,
    handlers: HashMap<u8, HandlerEntry>,
    default_handler: HandlerEntry,
    commands: HashMap<CommandKind, CommandHandler>,
    default_command: CommandHandler,
    poll: PollHandler,
    query_status: QueryStatus,
    last_value: Option<StateValue>,
    connected: Vec<FeatureId>,
    group_states: HashMap<(u8, u8), GroupMessageStateMachine>,
}

impl Feature {
    pub fn new(name: &str, template: &str, dispatcher: Dispatcher) -> Self {
        Self {
            name: name.to_string(),
            template: template.to_string(),
            status_feature: false,
            dispatcher,
            handlers: HashMap::new(),
            default_handler: HandlerEntry::new(MessageHandler::NoOp),
            commands: HashMap::new(),
            default_command: CommandHandler::Warn,
            poll: PollHandler::None,
            query_status: QueryStatus::NotPending,
            last_value: None,
            connected: Vec::new(),
            group_states: HashMap::new(),
        }
    }

    /// Status features see every message after the regular features.
    pub fn status_feature(mut self) -> Self {
        self.status_feature = true;
        self
    }

    pub fn handler(mut self, cmd1: u8, entry: HandlerEntry) -> Self {
        self.handlers.insert(cmd1, entry);
        self
    }

    pub fn default_handler(mut self, entry: HandlerEntry) -> Self {
        self.default_handler = entry;
        self
    }

    pub fn command(mut self, kind: CommandKind, handler: CommandHandler) -> Self {
        self.commands.insert(kind, handler);
        self
    }

    pub fn poll(mut self, poll: PollHandler) -> Self {
        self.poll = poll;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn is_status_feature(&self) -> bool {
        self.status_feature
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher
    }

    pub fn query_status(&self) -> QueryStatus {
        self.query_status
    }

    pub fn set_query_status(&mut self, status: QueryStatus) {
        self.query_status = status;
    }

    pub fn last_value(&self) -> Option<&StateValue> {
        self.last_value.as_ref()
    }

    pub fn connect(&mut self, id: FeatureId) {
        if !self.connected.contains(&id) {
            self.connected.push(id);
        }
    }

    pub fn connected(&self) -> &[FeatureId] {
        &self.connected
    }

    pub fn has_handler(&self, cmd1: u8) -> bool {
        self.handlers.contains_key(&cmd1)
    }

    /// The handler registered for `key`, or the default one.
    pub fn handler_for(&self, key: Option<u8>) -> HandlerEntry {
        key.and_then(|k| self.handlers.get(&k))
            .copied()
            .unwrap_or(self.default_handler)
    }

    pub fn command_handler(&self, kind: CommandKind) -> CommandHandler {
        self.commands.get(&kind).copied().unwrap_or(self.default_command)
    }

    pub fn poll_handler(&self) -> PollHandler {
        self.poll
    }

    /// Feed one all-link message through the per-handler group state machine.
    /// Returns true if it repeats something already acted upon.
    pub fn is_duplicate(&mut self, cmd1: u8, group: u8, kind: GroupMessage) -> bool {
        !self.group_states.entry((cmd1, group)).or_default().action(kind)
    }

    /// Publish `value` unless it repeats the last one and `change` allows
    /// suppression. Returns whether anything went out.
    pub fn publish(
        &mut self,
        address: DeviceAddress,
        value: StateValue,
        change: ChangeType,
        publisher: &dyn StatePublisher,
    ) -> bool {
        if change == ChangeType::Changed && self.last_value.as_ref() == Some(&value) {
            return false;
        }
        self.last_value = Some(value.clone());
        publisher.publish(StateUpdate::new(address, &self.name, value));
        true
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}) {:?}", self.name, self.template, self.query_status)
    }
}
