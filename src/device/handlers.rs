//! Message, command and poll handlers.
//!
//! Message handlers turn an inbound message into a [`Reaction`]; they never
//! touch the feature themselves, the caller applies the reaction. Command
//! handlers turn a [`Command`] into the outbound messages to enqueue.
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::publish::{ChangeType, StateValue};
use crate::plm::address::{DeviceAddress, X10Command, X10_CODE_FOR_LEVEL};
use crate::plm::message::fields::*;
use crate::plm::message::{FieldError, Message, MessageError};
use crate::plm::registry::MessageRegistry;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Field(#[from] FieldError),
    #[error("{0} is not an X10 address")]
    NotX10(DeviceAddress),
    #[error("ramp level {0} out of range 0-100")]
    RampLevel(u8),
    #[error("ramp time {0} must not be negative")]
    RampTime(f64),
    #[error("{handler} does not understand {command:?}")]
    Unsupported { handler: &'static str, command: Command },
}

/// Commands arriving from above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Command {
    On,
    Off,
    Percent(u8),
    Increase,
    Decrease,
    Number(i64),
    Refresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    OnOff,
    Percent,
    IncreaseDecrease,
    Number,
    Refresh,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::On | Command::Off => CommandKind::OnOff,
            Command::Percent(_) => CommandKind::Percent,
            Command::Increase | Command::Decrease => CommandKind::IncreaseDecrease,
            Command::Number(_) => CommandKind::Number,
            Command::Refresh => CommandKind::Refresh,
        }
    }
}

impl std::str::FromStr for Command {
    type Err = String;

    /// `on`, `off`, `up`, `down`, `refresh`, `42%` or a bare number.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "on" => Ok(Command::On),
            "off" => Ok(Command::Off),
            "up" | "increase" => Ok(Command::Increase),
            "down" | "decrease" => Ok(Command::Decrease),
            "refresh" => Ok(Command::Refresh),
            _ => {
                if let Some(pc) = s.strip_suffix('%') {
                    pc.parse::<u8>()
                        .ok()
                        .filter(|p| *p <= 100)
                        .map(Command::Percent)
                        .ok_or_else(|| format!("bad percentage: {}", s))
                } else {
                    s.parse::<i64>()
                        .map(Command::Number)
                        .map_err(|_| format!("unknown command: {}", s))
                }
            }
        }
    }
}

/// What a message handler wants done with its feature.
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    Publish(StateValue, ChangeType),
    /// Ask the device for fresh status.
    Poll,
}

/// Optional equality test on one byte field of the inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageFilter {
    pub field: &'static str,
    pub value: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageHandler {
    NoOp,
    LightOn { dimmer: bool },
    LightOff { dimmer: bool },
    DimmerReply,
    SwitchReply,
    StopManualChange,
    FanLincFanReply,
    ThermostatModeReply,
    /// Bit `group - 1` of command2 is the button LED.
    KeypadButtonReply,
    LastHeard,
}

/// A handler plus the parameters it was configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerEntry {
    pub handler: MessageHandler,
    pub group: Option<u8>,
    pub filter: Option<MessageFilter>,
}

impl HandlerEntry {
    pub fn new(handler: MessageHandler) -> Self {
        Self {
            handler,
            group: None,
            filter: None,
        }
    }

    pub fn with_group(mut self, group: Option<u8>) -> Self {
        self.group = group;
        self
    }

    pub fn with_filter(mut self, field: &'static str, value: u8) -> Self {
        self.filter = Some(MessageFilter { field, value });
        self
    }

    pub fn matches_group(&self, group: u8) -> bool {
        self.group.map_or(true, |g| g == group)
    }

    pub fn matches(&self, msg: &Message) -> bool {
        match self.filter {
            None => true,
            Some(f) => msg.get_byte(f.field).map_or(false, |v| v == f.value),
        }
    }

    /// `group` is set for all-link traffic and `None` for direct messages.
    pub fn handle(&self, group: Option<u8>, cmd1: u8, msg: &Message) -> Option<Reaction> {
        let cmd2 = msg.get_byte(COMMAND_2).ok();
        let changed = |v| Some(Reaction::Publish(v, ChangeType::Changed));
        match self.handler {
            MessageHandler::NoOp => None,
            MessageHandler::LightOn { dimmer: false } => changed(StateValue::OnOff(true)),
            MessageHandler::LightOn { dimmer: true } => {
                // Fast-on and all-link on go to full brightness. A direct on
                // carries the level the device went to.
                let level = match (group, cmd2) {
                    (None, Some(level)) if cmd1 != 0x12 && level != 0 => level,
                    _ => 0xFF,
                };
                changed(StateValue::Percent(level_to_percent(level)))
            }
            MessageHandler::LightOff { dimmer: false } => changed(StateValue::OnOff(false)),
            MessageHandler::LightOff { dimmer: true } => changed(StateValue::Percent(0)),
            MessageHandler::DimmerReply => cmd2.and_then(|level| changed(StateValue::Percent(level_to_percent(level)))),
            MessageHandler::SwitchReply => cmd2.and_then(|level| changed(StateValue::OnOff(level != 0))),
            MessageHandler::StopManualChange => Some(Reaction::Poll),
            MessageHandler::FanLincFanReply => {
                cmd2.and_then(|speed| changed(StateValue::Decimal((f64::from(speed) / 85.0).round())))
            }
            MessageHandler::ThermostatModeReply => cmd2.and_then(|mode| changed(StateValue::Decimal(f64::from(mode)))),
            MessageHandler::KeypadButtonReply => {
                let bit = self.group.filter(|g| (1..=8).contains(g))? - 1;
                cmd2.and_then(|mask| changed(StateValue::OnOff(mask & (1 << bit) != 0)))
            }
            MessageHandler::LastHeard => Some(Reaction::Publish(StateValue::Timestamp(Utc::now()), ChangeType::Always)),
        }
    }
}

/// Insteon 0..255 level to a 0..100 percentage.
pub fn level_to_percent(level: u8) -> u8 {
    ((f64::from(level) * 100.0) / 255.0).round() as u8
}

/// Percentage to the 0..255 level, rounding up so 1% is never off.
pub fn percent_to_level(percent: u8) -> u8 {
    ((f64::from(percent.min(100)) * 255.0) / 100.0).ceil() as u8
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandHandler {
    /// Logs and drops the command.
    Warn,
    NoOp,
    LightOnOff,
    FastOnOff,
    Percent,
    RampPercent { ramp_time: f64 },
    IncreaseDecrease,
    X10OnOff,
    X10Percent,
    X10IncreaseDecrease,
    FanLincFan,
    ThermostatSystemMode,
}

impl CommandHandler {
    pub fn name(&self) -> &'static str {
        match self {
            CommandHandler::Warn => "Warn",
            CommandHandler::NoOp => "NoOp",
            CommandHandler::LightOnOff => "LightOnOff",
            CommandHandler::FastOnOff => "FastOnOff",
            CommandHandler::Percent => "Percent",
            CommandHandler::RampPercent { .. } => "RampPercent",
            CommandHandler::IncreaseDecrease => "IncreaseDecrease",
            CommandHandler::X10OnOff => "X10OnOff",
            CommandHandler::X10Percent => "X10Percent",
            CommandHandler::X10IncreaseDecrease => "X10IncreaseDecrease",
            CommandHandler::FanLincFan => "FanLincFan",
            CommandHandler::ThermostatSystemMode => "ThermostatSystemMode",
        }
    }

    /// Outbound messages for `cmd`, in the order they must be sent.
    pub fn build(
        &self,
        cmd: Command,
        addr: DeviceAddress,
        registry: &MessageRegistry,
    ) -> Result<Vec<Message>, HandlerError> {
        let unsupported = || HandlerError::Unsupported {
            handler: self.name(),
            command: cmd,
        };
        let m = match (self, cmd) {
            (CommandHandler::Warn, _) | (CommandHandler::NoOp, _) => return Ok(Vec::new()),
            (CommandHandler::LightOnOff, Command::On) => registry.standard_message(addr, 0x0F, 0x11, 0xFF)?,
            (CommandHandler::LightOnOff, Command::Off) => registry.standard_message(addr, 0x0F, 0x13, 0x00)?,
            (CommandHandler::FastOnOff, Command::On) => registry.standard_message(addr, 0x0F, 0x12, 0xFF)?,
            (CommandHandler::FastOnOff, Command::Off) => registry.standard_message(addr, 0x0F, 0x14, 0x00)?,
            (CommandHandler::Percent, Command::Percent(0)) => registry.standard_message(addr, 0x0F, 0x13, 0x00)?,
            (CommandHandler::Percent, Command::Percent(pc)) => {
                registry.standard_message(addr, 0x0F, 0x11, percent_to_level(pc))?
            }
            (CommandHandler::RampPercent { ramp_time }, Command::Percent(0)) => {
                // Validate even though the off command carries no ramp.
                encode_ramp(*ramp_time, 0)?;
                registry.standard_message(addr, 0x0F, RAMP_OFF, 0x00)?
            }
            (CommandHandler::RampPercent { ramp_time }, Command::Percent(pc)) => {
                registry.standard_message(addr, 0x0F, RAMP_ON, encode_ramp(*ramp_time, pc)?)?
            }
            (CommandHandler::IncreaseDecrease, Command::Increase) => registry.standard_message(addr, 0x0F, 0x15, 0x00)?,
            (CommandHandler::IncreaseDecrease, Command::Decrease) => registry.standard_message(addr, 0x0F, 0x16, 0x00)?,
            (CommandHandler::X10OnOff, Command::On) => return x10_pair(addr, X10Command::On.code(), registry),
            (CommandHandler::X10OnOff, Command::Off) => return x10_pair(addr, X10Command::Off.code(), registry),
            (CommandHandler::X10IncreaseDecrease, Command::Increase) => {
                return x10_pair(addr, X10Command::Bright.code(), registry)
            }
            (CommandHandler::X10IncreaseDecrease, Command::Decrease) => {
                return x10_pair(addr, X10Command::Dim.code(), registry)
            }
            (CommandHandler::X10Percent, Command::Percent(pc)) => {
                let house = x10_house(addr)?;
                let unit = registry.x10_message(house << 4 | addr.x10_unit_code(), 0x00)?;
                let level = usize::from(pc.min(100)) * 32 / 100;
                let dim = if level >= 16 {
                    X10Command::PresetDim2
                } else {
                    X10Command::PresetDim1
                };
                let raw = X10_CODE_FOR_LEVEL[level % 16] << 4 | dim.code();
                return Ok(vec![unit, registry.x10_message(raw, 0x80)?]);
            }
            (CommandHandler::FanLincFan, Command::Number(speed)) => {
                let level = match speed {
                    1 => 0x55,
                    2 => 0xAA,
                    3 => 0xFF,
                    _ => 0x00,
                };
                registry.extended_message(addr, 0x0F, 0x11, level, &[0x02])?
            }
            (CommandHandler::ThermostatSystemMode, Command::Number(mode)) => {
                let code = match mode {
                    0 => 0x09, // off
                    1 => 0x04, // heat
                    2 => 0x05, // cool
                    3 => 0x06, // auto
                    _ => 0x0A, // program
                };
                registry.extended_message_crc2(addr, 0x0F, 0x6B, code, &[])?
            }
            _ => return Err(unsupported()),
        };
        Ok(vec![m])
    }
}

const RAMP_ON: u8 = 0x2E;
const RAMP_OFF: u8 = 0x2F;

/// Ramp times (seconds) at half rate, index 0 is the slowest code 15.
const HALF_RATE_RAMP_TIMES: [f64; 16] = [
    0.1, 0.3, 2.0, 6.5, 19.0, 23.5, 28.0, 32.0, 38.5, 47.0, 90.0, 150.0, 210.0, 270.0, 360.0, 480.0,
];

/// command2 for the light-on-at-ramp-rate command: level nibble high,
/// ramp code low. The ramp code is the nearest table entry.
pub fn encode_ramp(ramp_time: f64, level_percent: u8) -> Result<u8, HandlerError> {
    if level_percent > 100 {
        return Err(HandlerError::RampLevel(level_percent));
    }
    if ramp_time < 0.0 || ramp_time.is_nan() {
        return Err(HandlerError::RampTime(ramp_time));
    }
    let level = (f64::from(level_percent) / (100.0 / 15.0)).round() as u8;
    let idx = HALF_RATE_RAMP_TIMES.partition_point(|t| *t < ramp_time);
    let code = if idx < HALF_RATE_RAMP_TIMES.len() && HALF_RATE_RAMP_TIMES[idx] == ramp_time {
        15 - idx
    } else if idx == 0 {
        15
    } else if idx == HALF_RATE_RAMP_TIMES.len() {
        0
    } else {
        let below = (HALF_RATE_RAMP_TIMES[idx - 1] - ramp_time).abs();
        let above = (HALF_RATE_RAMP_TIMES[idx] - ramp_time).abs();
        15 - if below > above { idx } else { idx - 1 }
    };
    Ok(((level & 0x0F) << 4) | (code as u8 & 0x0F))
}

fn x10_house(addr: DeviceAddress) -> Result<u8, HandlerError> {
    if addr.is_x10() {
        Ok(addr.x10_house_code())
    } else {
        Err(HandlerError::NotX10(addr))
    }
}

/// X10 needs the unit selected first, then the command for the house.
fn x10_pair(addr: DeviceAddress, command: u8, registry: &MessageRegistry) -> Result<Vec<Message>, HandlerError> {
    let house = x10_house(addr)?;
    let unit = registry.x10_message(house << 4 | addr.x10_unit_code(), 0x00)?;
    let cmd = registry.x10_message(house << 4 | command, 0x80)?;
    Ok(vec![unit, cmd])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollHandler {
    None,
    Standard { cmd1: u8, cmd2: u8 },
}

impl PollHandler {
    pub fn status(cmd2: u8) -> Self {
        PollHandler::Standard { cmd1: 0x19, cmd2 }
    }

    pub fn make_msg(&self, addr: DeviceAddress, registry: &MessageRegistry) -> Result<Option<Message>, MessageError> {
        match self {
            PollHandler::None => Ok(None),
            PollHandler::Standard { cmd1, cmd2 } => registry.standard_message(addr, 0x0F, *cmd1, *cmd2).map(Some),
        }
    }
}

/// The three messages of one all-link group transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMessage {
    Broadcast,
    Cleanup,
    Success,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum GroupState {
    #[default]
    ExpectBcast,
    ExpectClean,
    ExpectSuccess,
}

/// A group command arrives as broadcast, then cleanup, then success. Only the
/// first of those that actually reaches us is published.
#[derive(Debug, Clone, Default)]
pub struct GroupMessageStateMachine {
    state: GroupState,
}

impl GroupMessageStateMachine {
    /// Returns true if the message should be acted upon.
    pub fn action(&mut self, msg: GroupMessage) -> bool {
        let publish = match (self.state, msg) {
            (GroupState::ExpectBcast, GroupMessage::Broadcast) => true,
            // broadcast was missed
            (GroupState::ExpectBcast, GroupMessage::Cleanup) => true,
            (GroupState::ExpectBcast, GroupMessage::Success) => false,
            (GroupState::ExpectClean, _) => false,
            // success was missed, this is a new transmission
            (GroupState::ExpectSuccess, GroupMessage::Broadcast) => true,
            (GroupState::ExpectSuccess, _) => false,
        };
        self.state = match msg {
            GroupMessage::Broadcast => GroupState::ExpectClean,
            GroupMessage::Cleanup => GroupState::ExpectSuccess,
            GroupMessage::Success => GroupState::ExpectBcast,
        };
        publish
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> MessageRegistry {
        MessageRegistry::standard()
    }

    fn dimmer() -> DeviceAddress {
        DeviceAddress::insteon(0x28, 0xC3, 0x91)
    }

    #[test]
    fn light_on_builds_standard_message() {
        let msgs = CommandHandler::LightOnOff.build(Command::On, dimmer(), &registry()).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].bytes(), &[0x02, 0x62, 0x28, 0xC3, 0x91, 0x0F, 0x11, 0xFF]);
    }

    #[test]
    fn percent_rounds_up() {
        let r = registry();
        let m = &CommandHandler::Percent.build(Command::Percent(1), dimmer(), &r).unwrap()[0];
        assert_eq!(m.get_byte(COMMAND_1).unwrap(), 0x11);
        assert_eq!(m.get_byte(COMMAND_2).unwrap(), 3);
        let m = &CommandHandler::Percent.build(Command::Percent(0), dimmer(), &r).unwrap()[0];
        assert_eq!(m.get_byte(COMMAND_1).unwrap(), 0x13);
        assert_eq!(percent_to_level(100), 0xFF);
        assert_eq!(level_to_percent(0x80), 50);
    }

    #[test]
    fn unsupported_command_is_an_error() {
        let err = CommandHandler::LightOnOff
            .build(Command::Percent(20), dimmer(), &registry())
            .unwrap_err();
        assert!(matches!(err, HandlerError::Unsupported { .. }));
    }

    #[test]
    fn x10_on_sends_unit_then_command() {
        let addr: DeviceAddress = "A.1".parse().unwrap();
        let msgs = CommandHandler::X10OnOff.build(Command::On, addr, &registry()).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].bytes(), &[0x02, 0x63, 0x66, 0x00]);
        assert_eq!(msgs[1].bytes(), &[0x02, 0x63, 0x62, 0x80]);
    }

    #[test]
    fn x10_percent_uses_preset_dim() {
        let addr: DeviceAddress = "A.1".parse().unwrap();
        let msgs = CommandHandler::X10Percent.build(Command::Percent(75), addr, &registry()).unwrap();
        // 75% -> level 24 -> PresetDim2 with the code for 8
        assert_eq!(msgs[1].get_byte(RAW_X10).unwrap(), X10_CODE_FOR_LEVEL[8] << 4 | 0x0B);
        assert!(CommandHandler::X10OnOff.build(Command::On, dimmer(), &registry()).is_err());
    }

    #[test]
    fn fanlinc_and_thermostat_extended_messages() {
        let r = registry();
        let fan = &CommandHandler::FanLincFan.build(Command::Number(2), dimmer(), &r).unwrap()[0];
        assert!(fan.is_extended());
        assert_eq!(fan.get_byte(COMMAND_2).unwrap(), 0xAA);
        assert_eq!(fan.get_byte(USER_DATA[0]).unwrap(), 0x02);
        let sum = fan.bytes()[6..].iter().fold(0u8, |a, b| a.wrapping_add(*b));
        assert_eq!(sum, 0);

        let mode = &CommandHandler::ThermostatSystemMode
            .build(Command::Number(0), dimmer(), &r)
            .unwrap()[0];
        assert_eq!(mode.get_byte(COMMAND_1).unwrap(), 0x6B);
        assert_eq!(mode.get_byte(COMMAND_2).unwrap(), 0x09);
        assert_eq!(mode.get_byte(USER_DATA[12]).unwrap(), 0x37);
        assert_eq!(mode.get_byte(USER_DATA[13]).unwrap(), 0x32);
    }

    #[test]
    fn ramp_encoding_picks_nearest_rate() {
        assert_eq!(encode_ramp(2.0, 100).unwrap(), 0xFD);
        assert_eq!(encode_ramp(0.0, 0).unwrap(), 0x0F);
        assert_eq!(encode_ramp(1000.0, 0).unwrap(), 0x00);
        // 20 s is closer to 19 than to 23.5
        assert_eq!(encode_ramp(20.0, 0).unwrap() & 0x0F, 11);
        assert!(encode_ramp(-1.0, 50).is_err());
        assert!(encode_ramp(1.0, 101).is_err());
    }

    #[test]
    fn group_state_machine_suppresses_repeats() {
        let mut sm = GroupMessageStateMachine::default();
        assert!(sm.action(GroupMessage::Broadcast));
        assert!(!sm.action(GroupMessage::Cleanup));
        assert!(!sm.action(GroupMessage::Success));
        // broadcast missed, cleanup gets through
        assert!(sm.action(GroupMessage::Cleanup));
        assert!(!sm.action(GroupMessage::Success));
        // repeated broadcast is a duplicate
        assert!(sm.action(GroupMessage::Broadcast));
        assert!(!sm.action(GroupMessage::Broadcast));
    }

    #[test]
    fn commands_parse_from_text() {
        assert_eq!("ON".parse::<Command>().unwrap(), Command::On);
        assert_eq!("40%".parse::<Command>().unwrap(), Command::Percent(40));
        assert_eq!("3".parse::<Command>().unwrap(), Command::Number(3));
        assert!("150%".parse::<Command>().is_err());
        assert!("sideways".parse::<Command>().is_err());
    }
}
