//! Per-feature message dispatchers.
//!
//! A dispatcher decides which of its feature's handlers sees a message and
//! whether the message answers the query the device is waiting on. It returns
//! the handler reactions instead of applying them, so the device can publish
//! and enqueue after the arena borrow ends.
use log::{debug, trace, warn};

use super::feature::{Feature, FeatureId, QueryStatus};
use super::handlers::{GroupMessage, Reaction};
use crate::plm::address::DeviceAddress;
use crate::plm::message::fields::*;
use crate::plm::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatcher {
    Default,
    /// Like `Default`, but handlers of the connected features run.
    DefaultGroup,
    /// Consumes acks to its own poll and nothing else.
    PollGroup,
    Simple,
    X10,
    PassThrough,
    NoOp,
}

/// What the device knows about the query it is waiting on.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryContext {
    pub queried: Option<FeatureId>,
    /// command1 of the outbound query, used to route extended acks.
    pub queried_command: Option<u8>,
}

#[derive(Debug, Default)]
pub struct Dispatch {
    /// The message answered this feature's pending query.
    pub consumed: bool,
    pub reactions: Vec<(FeatureId, Reaction)>,
}

impl Dispatch {
    fn react(&mut self, id: FeatureId, reaction: Option<Reaction>) {
        if let Some(r) = reaction {
            self.reactions.push((id, r));
        }
    }
}

/// Run `msg` through the dispatcher of feature `id`.
pub fn dispatch(features: &mut [Feature], id: FeatureId, msg: &Message, query: QueryContext) -> Dispatch {
    let mut out = Dispatch::default();
    let Some(feature) = features.get(id.0) else {
        warn!("dispatch to unknown feature {}", id);
        return out;
    };
    match feature.dispatcher() {
        Dispatcher::Default => dispatch_default(features, id, msg, query, false, &mut out),
        Dispatcher::DefaultGroup => dispatch_default(features, id, msg, query, true, &mut out),
        Dispatcher::PollGroup => dispatch_poll_group(features, id, msg, query, &mut out),
        Dispatcher::Simple => dispatch_simple(features, id, msg, query, &mut out),
        Dispatcher::X10 => dispatch_x10(features, id, msg, &mut out),
        Dispatcher::PassThrough => {
            let entry = features[id.0].handler_for(None);
            if entry.matches(msg) {
                out.react(id, entry.handle(None, 0x01, msg));
            }
        }
        Dispatcher::NoOp => {}
    }
    if out.consumed {
        features[id.0].set_query_status(QueryStatus::QueryAnswered);
    }
    out
}

fn is_my_direct_ack(feature: &Feature, id: FeatureId, msg: &Message, query: QueryContext) -> bool {
    msg.is_ack_of_direct() && feature.query_status() == QueryStatus::QueryPending && query.queried == Some(id)
}

/// Handler key for an ack to our query. The ack's command1 is not the
/// command we sent, so standard acks go to the status reply handler and
/// extended acks to the handler for the original command.
fn ack_key(cmd: u8, cmd1: u8, query: QueryContext) -> u8 {
    if cmd == 0x50 {
        0x19
    } else {
        query.queried_command.unwrap_or(cmd1)
    }
}

fn dispatch_default(
    features: &mut [Feature],
    id: FeatureId,
    msg: &Message,
    query: QueryContext,
    fan_out: bool,
    out: &mut Dispatch,
) {
    let (cmd, cmd1) = match (msg.get_byte(CMD), msg.get_byte(COMMAND_1)) {
        (Ok(cmd), Ok(cmd1)) => (cmd, cmd1),
        _ => return,
    };
    if msg.is_all_link_cleanup_ack_or_nack() {
        // the modem sees these for groups it controls, nothing to do
        return;
    }
    if handle_all_link_message(features, id, msg, out) {
        return;
    }
    let feature = &features[id.0];
    let mut key = None;
    if msg.is_ack_of_direct() {
        if is_my_direct_ack(feature, id, msg, query) {
            out.consumed = true;
            key = Some(ack_key(cmd, cmd1, query));
        }
    } else {
        key = Some(cmd1);
    }
    if fan_out {
        if key.is_none() {
            return;
        }
        let targets = feature.connected().to_vec();
        for target in targets {
            let Some(f) = features.get(target.0) else {
                continue;
            };
            let entry = f.handler_for(key);
            if entry.matches(msg) {
                trace!("{} fans out to {}", features[id.0].name(), f.name());
                out.react(target, entry.handle(None, cmd1, msg));
            }
        }
    } else if key.is_some() || feature.is_status_feature() {
        let entry = feature.handler_for(key);
        if entry.matches(msg) {
            trace!("{} -> {:?} {}", feature.name(), entry.handler, msg);
            out.react(id, entry.handle(None, cmd1, msg));
        }
    }
}

fn dispatch_poll_group(features: &mut [Feature], id: FeatureId, msg: &Message, query: QueryContext, out: &mut Dispatch) {
    if msg.is_all_link_cleanup_ack_or_nack() || !msg.is_ack_of_direct() {
        return;
    }
    out.consumed = is_my_direct_ack(&features[id.0], id, msg, query);
}

fn dispatch_simple(features: &mut [Feature], id: FeatureId, msg: &Message, query: QueryContext, out: &mut Dispatch) {
    if handle_all_link_message(features, id, msg, out) {
        return;
    }
    let Ok(cmd1) = msg.get_byte(COMMAND_1) else {
        return;
    };
    if msg.is_all_link_cleanup_ack_or_nack() {
        return;
    }
    let feature = &features[id.0];
    out.consumed = is_my_direct_ack(feature, id, msg, query);
    let entry = feature.handler_for(Some(cmd1));
    if entry.matches(msg) {
        out.react(id, entry.handle(None, cmd1, msg));
    }
}

fn dispatch_x10(features: &mut [Feature], id: FeatureId, msg: &Message, out: &mut Dispatch) {
    let raw = match msg.get_byte(RAW_X10) {
        Ok(raw) => raw,
        Err(e) => {
            debug!("x10 dispatch: {}", e);
            return;
        }
    };
    let cmd = raw & 0x0F;
    let entry = features[id.0].handler_for(Some(cmd));
    if entry.matches(msg) {
        out.react(id, entry.handle(None, cmd, msg));
    }
}

/// command1 of an all-link message. The cleanup-success report is an
/// all-link broadcast whose command1 is 0x06 and whose to-address high byte
/// holds the command that was cleaned up.
///
/// FIXME: only ever observed on a few switch models; verify against more
/// hardware that the high byte really carries the original command.
pub fn all_link_command(cleanup: bool, cmd1: u8, to: DeviceAddress) -> u8 {
    if !cleanup && cmd1 == 0x06 {
        to.high_byte()
    } else {
        cmd1
    }
}

/// Handle an all-link broadcast or cleanup. Returns true if the message was
/// all-link traffic, whether or not a handler ran.
fn handle_all_link_message(features: &mut [Feature], id: FeatureId, msg: &Message, out: &mut Dispatch) -> bool {
    if !msg.is_all_link() {
        return false;
    }
    let (to, raw_cmd1, cmd2) = match (
        msg.get_address(TO_ADDRESS),
        msg.get_byte(COMMAND_1),
        msg.get_byte(COMMAND_2),
    ) {
        (Ok(to), Ok(c1), Ok(c2)) => (to, c1, c2),
        _ => {
            warn!("malformed all-link message: {}", msg);
            return true;
        }
    };
    let cleanup = msg.is_cleanup();
    let cmd1 = all_link_command(cleanup, raw_cmd1, to);
    // broadcasts carry the group in the to-address, cleanups in command2
    let group = if cleanup { cmd2 } else { to.low_byte() };
    let kind = if cleanup {
        GroupMessage::Cleanup
    } else if raw_cmd1 == 0x06 {
        GroupMessage::Success
    } else {
        GroupMessage::Broadcast
    };

    let feature = &mut features[id.0];
    if !feature.has_handler(cmd1) {
        trace!("{}: no handler for all-link cmd {:02X}", feature.name(), cmd1);
        return true;
    }
    let entry = feature.handler_for(Some(cmd1));
    if !entry.matches_group(group) || !entry.matches(msg) {
        return true;
    }
    if feature.is_duplicate(cmd1, group, kind) {
        trace!("{}: ignoring duplicate {:?} group {}", feature.name(), kind, group);
        return true;
    }
    out.react(id, entry.handle(Some(group), cmd1, msg));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::handlers::{HandlerEntry, MessageHandler};
    use crate::device::publish::{ChangeType, StateValue};
    use crate::plm::registry::MessageRegistry;

    const DEV: [u8; 3] = [0x28, 0xC3, 0x91];
    const IM: [u8; 3] = [0x44, 0x85, 0x11];

    fn inbound(to: [u8; 3], flags: u8, cmd1: u8, cmd2: u8) -> Message {
        let reg = MessageRegistry::standard();
        let mut bytes = vec![0x02, 0x50];
        bytes.extend_from_slice(&DEV);
        bytes.extend_from_slice(&to);
        bytes.extend_from_slice(&[flags, cmd1, cmd2]);
        Message::from_bytes(reg.reply_definition(0x50, false).unwrap(), &bytes).unwrap()
    }

    fn switch_features() -> Vec<Feature> {
        vec![Feature::new("switch", "SwitchLevel", Dispatcher::Default)
            .handler(0x11, HandlerEntry::new(MessageHandler::LightOn { dimmer: false }).with_group(Some(1)))
            .handler(0x13, HandlerEntry::new(MessageHandler::LightOff { dimmer: false }).with_group(Some(1)))
            .handler(0x19, HandlerEntry::new(MessageHandler::SwitchReply))]
    }

    fn on() -> Reaction {
        Reaction::Publish(StateValue::OnOff(true), ChangeType::Changed)
    }

    #[test]
    fn broadcast_then_cleanup_then_success_publishes_once() {
        let mut f = switch_features();
        let q = QueryContext::default();
        let bcast = inbound([0, 0, 1], 0xCF, 0x11, 0x00);
        let clean = inbound(IM, 0x41, 0x11, 0x01);
        let success = inbound([0x11, 0, 1], 0xCF, 0x06, 0x00);
        let d = dispatch(&mut f, FeatureId(0), &bcast, q);
        assert!(!d.consumed);
        assert_eq!(d.reactions, vec![(FeatureId(0), on())]);
        assert!(dispatch(&mut f, FeatureId(0), &clean, q).reactions.is_empty());
        assert!(dispatch(&mut f, FeatureId(0), &success, q).reactions.is_empty());
        // next press goes through again
        assert_eq!(dispatch(&mut f, FeatureId(0), &bcast, q).reactions.len(), 1);
    }

    #[test]
    fn other_groups_are_ignored() {
        let mut f = switch_features();
        let bcast = inbound([0, 0, 2], 0xCF, 0x11, 0x00);
        assert!(dispatch(&mut f, FeatureId(0), &bcast, QueryContext::default())
            .reactions
            .is_empty());
    }

    #[test]
    fn cleanup_success_uses_high_byte() {
        assert_eq!(all_link_command(false, 0x06, DeviceAddress::insteon(0x13, 0, 1)), 0x13);
        assert_eq!(all_link_command(true, 0x06, DeviceAddress::insteon(0x13, 0, 1)), 0x06);
        assert_eq!(all_link_command(false, 0x11, DeviceAddress::insteon(0x13, 0, 1)), 0x11);
    }

    #[test]
    fn ack_answers_only_the_queried_feature() {
        let mut f = switch_features();
        let ack = inbound(IM, 0x2B, 0x00, 0xFF);
        // not pending: ignored
        let d = dispatch(&mut f, FeatureId(0), &ack, QueryContext::default());
        assert!(!d.consumed && d.reactions.is_empty());

        f[0].set_query_status(QueryStatus::QueryPending);
        let q = QueryContext {
            queried: Some(FeatureId(0)),
            queried_command: Some(0x19),
        };
        let d = dispatch(&mut f, FeatureId(0), &ack, q);
        assert!(d.consumed);
        assert_eq!(d.reactions, vec![(FeatureId(0), on())]);
        assert_eq!(f[0].query_status(), QueryStatus::QueryAnswered);
    }

    #[test]
    fn group_dispatcher_fans_out_reply() {
        let mut f = vec![
            Feature::new("buttons", "KeypadButtonGroup", Dispatcher::DefaultGroup),
            Feature::new("button3", "KeypadButton", Dispatcher::Simple)
                .handler(0x19, HandlerEntry::new(MessageHandler::KeypadButtonReply).with_group(Some(3))),
            Feature::new("button4", "KeypadButton", Dispatcher::Simple)
                .handler(0x19, HandlerEntry::new(MessageHandler::KeypadButtonReply).with_group(Some(4))),
        ];
        f[0].connect(FeatureId(1));
        f[0].connect(FeatureId(2));
        f[0].set_query_status(QueryStatus::QueryPending);
        let q = QueryContext {
            queried: Some(FeatureId(0)),
            queried_command: Some(0x19),
        };
        let d = dispatch(&mut f, FeatureId(0), &inbound(IM, 0x2B, 0x00, 0b0000_0100), q);
        assert!(d.consumed);
        assert_eq!(
            d.reactions,
            vec![
                (FeatureId(1), on()),
                (FeatureId(2), Reaction::Publish(StateValue::OnOff(false), ChangeType::Changed)),
            ]
        );
    }

    #[test]
    fn poll_group_consumes_own_ack_only() {
        let mut f = vec![Feature::new("poller", "PollGroup", Dispatcher::PollGroup)];
        let ack = inbound(IM, 0x2B, 0x00, 0x00);
        assert!(!dispatch(&mut f, FeatureId(0), &ack, QueryContext::default()).consumed);
        f[0].set_query_status(QueryStatus::QueryPending);
        let q = QueryContext {
            queried: Some(FeatureId(0)),
            queried_command: Some(0x19),
        };
        assert!(dispatch(&mut f, FeatureId(0), &inbound(IM, 0x0B, 0x11, 0xFF), q).reactions.is_empty());
        assert!(dispatch(&mut f, FeatureId(0), &ack, q).consumed);
    }

    #[test]
    fn x10_routes_by_command_nibble() {
        let reg = MessageRegistry::standard();
        let mut f = vec![Feature::new("switch", "X10Switch", Dispatcher::X10)
            .handler(0x02, HandlerEntry::new(MessageHandler::LightOn { dimmer: false }))
            .handler(0x03, HandlerEntry::new(MessageHandler::LightOff { dimmer: false }))];
        let msg = Message::from_bytes(reg.reply_definition(0x52, false).unwrap(), &[0x02, 0x52, 0x63, 0x80]).unwrap();
        let d = dispatch(&mut f, FeatureId(0), &msg, QueryContext::default());
        assert_eq!(
            d.reactions,
            vec![(FeatureId(0), Reaction::Publish(StateValue::OnOff(false), ChangeType::Changed))]
        );
    }

    #[test]
    fn extended_ack_routes_by_queried_command() {
        assert_eq!(ack_key(0x50, 0x2E, QueryContext::default()), 0x19);
        let q = QueryContext {
            queried: Some(FeatureId(0)),
            queried_command: Some(0x2E),
        };
        assert_eq!(ack_key(0x51, 0x00, q), 0x2E);
    }
}
