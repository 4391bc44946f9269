//! Device-type table: product key to the features a device carries.
//!
//! Each feature names a template. Templates are built in and bundle the
//! dispatcher, message handlers, command handlers and poll handler for one
//! kind of feature. Extra product keys can be loaded from TOML:
//!
//! ```toml
//! [[device_type]]
//! product_key = "F00.00.0E"
//! model = "2476D"
//! description = "SwitchLinc Dimmer (older)"
//! features = [
//!     { name = "dimmer", template = "DimmerLevel", group = 1 },
//!     { name = "lastheardfrom", template = "LastHeardFrom" },
//! ]
//! ```
use std::collections::HashMap;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::dispatch::Dispatcher;
use super::feature::{Feature, FeatureId};
use super::handlers::{CommandHandler, CommandKind, HandlerEntry, MessageHandler, PollHandler};

/// Product key the modem itself reports under.
pub const MODEM_PRODUCT_KEY: &str = "0x000045";

const DEFAULT_RAMP_TIME: f64 = 2.0;

#[derive(Debug, Error)]
pub enum DeviceTypeError {
    #[error("failed to read device types from {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse device types: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{product_key}: unknown feature template {template}")]
    UnknownTemplate { product_key: String, template: String },
    #[error("{product_key}: group {group} names unknown feature {member}")]
    UnknownMember {
        product_key: String,
        group: String,
        member: String,
    },
    #[error("{product_key}: duplicate feature name {name}")]
    DuplicateFeature { product_key: String, name: String },
    #[error("unknown product key {0}")]
    UnknownProductKey(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureSpec {
    pub name: String,
    pub template: String,
    /// All-link group the feature answers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<u8>,
    /// Seconds, for ramp templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ramp_time: Option<f64>,
}

impl FeatureSpec {
    fn new(name: &str, template: &str) -> Self {
        Self {
            name: name.to_string(),
            template: template.to_string(),
            group: None,
            ramp_time: None,
        }
    }

    fn group(mut self, group: u8) -> Self {
        self.group = Some(group);
        self
    }
}

/// A feature whose dispatcher forwards to member features.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureGroupSpec {
    pub name: String,
    pub template: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceType {
    pub product_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub features: Vec<FeatureSpec>,
    #[serde(default)]
    pub groups: Vec<FeatureGroupSpec>,
}

impl DeviceType {
    fn new(product_key: &str, model: &str, description: &str) -> Self {
        Self {
            product_key: product_key.to_string(),
            model: model.to_string(),
            description: description.to_string(),
            features: Vec::new(),
            groups: Vec::new(),
        }
    }

    fn feature(mut self, spec: FeatureSpec) -> Self {
        self.features.push(spec);
        self
    }

    fn feature_group(mut self, name: &str, template: &str, members: &[&str]) -> Self {
        self.groups.push(FeatureGroupSpec {
            name: name.to_string(),
            template: template.to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
        });
        self
    }

    /// Instantiate the feature arena: plain features first, then groups with
    /// their member ids connected.
    pub fn build_features(&self) -> Result<Vec<Feature>, DeviceTypeError> {
        let mut features: Vec<Feature> = Vec::with_capacity(self.features.len() + self.groups.len());
        let mut ids: HashMap<&str, FeatureId> = HashMap::new();
        for spec in &self.features {
            if ids.insert(&spec.name, FeatureId(features.len())).is_some() {
                return Err(self.duplicate(&spec.name));
            }
            features.push(self.template(spec)?);
        }
        for group in &self.groups {
            let spec = FeatureSpec::new(&group.name, &group.template);
            let mut feature = self.template(&spec)?;
            for member in &group.members {
                let id = ids.get(member.as_str()).ok_or_else(|| DeviceTypeError::UnknownMember {
                    product_key: self.product_key.clone(),
                    group: group.name.clone(),
                    member: member.clone(),
                })?;
                feature.connect(*id);
            }
            if ids.insert(&group.name, FeatureId(features.len())).is_some() {
                return Err(self.duplicate(&group.name));
            }
            features.push(feature);
        }
        Ok(features)
    }

    fn template(&self, spec: &FeatureSpec) -> Result<Feature, DeviceTypeError> {
        feature_from_template(spec).ok_or_else(|| DeviceTypeError::UnknownTemplate {
            product_key: self.product_key.clone(),
            template: spec.template.clone(),
        })
    }

    fn duplicate(&self, name: &str) -> DeviceTypeError {
        DeviceTypeError::DuplicateFeature {
            product_key: self.product_key.clone(),
            name: name.to_string(),
        }
    }
}

/// Names accepted in `template = ...`.
pub const TEMPLATES: &[&str] = &[
    "DimmerLevel",
    "SwitchLevel",
    "FastOnOff",
    "RampDimmer",
    "FanLincFan",
    "ThermostatSystemMode",
    "KeypadButton",
    "KeypadButtonGroup",
    "PollGroup",
    "LastHeardFrom",
    "X10Switch",
    "X10Dimmer",
];

fn feature_from_template(spec: &FeatureSpec) -> Option<Feature> {
    let name = spec.name.as_str();
    let template = spec.template.as_str();
    let grouped = |h| HandlerEntry::new(h).with_group(spec.group);
    let f = match template {
        "DimmerLevel" | "SwitchLevel" => {
            let dimmer = template == "DimmerLevel";
            let reply = if dimmer {
                MessageHandler::DimmerReply
            } else {
                MessageHandler::SwitchReply
            };
            let mut f = Feature::new(name, template, Dispatcher::Default)
                .handler(0x11, grouped(MessageHandler::LightOn { dimmer }))
                .handler(0x12, grouped(MessageHandler::LightOn { dimmer }))
                .handler(0x13, grouped(MessageHandler::LightOff { dimmer }))
                .handler(0x14, grouped(MessageHandler::LightOff { dimmer }))
                .handler(0x19, HandlerEntry::new(reply))
                .command(CommandKind::OnOff, CommandHandler::LightOnOff)
                .poll(PollHandler::status(0x00));
            if dimmer {
                f = f
                    .handler(0x18, grouped(MessageHandler::StopManualChange))
                    .command(CommandKind::Percent, CommandHandler::Percent)
                    .command(CommandKind::IncreaseDecrease, CommandHandler::IncreaseDecrease);
            }
            f
        }
        "FastOnOff" => Feature::new(name, template, Dispatcher::NoOp).command(CommandKind::OnOff, CommandHandler::FastOnOff),
        "RampDimmer" => Feature::new(name, template, Dispatcher::NoOp).command(
            CommandKind::Percent,
            CommandHandler::RampPercent {
                ramp_time: spec.ramp_time.unwrap_or(DEFAULT_RAMP_TIME),
            },
        ),
        "FanLincFan" => Feature::new(name, template, Dispatcher::Default)
            .handler(0x19, HandlerEntry::new(MessageHandler::FanLincFanReply))
            .command(CommandKind::Number, CommandHandler::FanLincFan)
            .poll(PollHandler::status(0x03)),
        "ThermostatSystemMode" => Feature::new(name, template, Dispatcher::Default)
            .handler(0x19, HandlerEntry::new(MessageHandler::ThermostatModeReply))
            .command(CommandKind::Number, CommandHandler::ThermostatSystemMode)
            .poll(PollHandler::Standard { cmd1: 0x6B, cmd2: 0x02 }),
        "KeypadButton" => Feature::new(name, template, Dispatcher::Simple)
            .handler(0x11, grouped(MessageHandler::LightOn { dimmer: false }))
            .handler(0x12, grouped(MessageHandler::LightOn { dimmer: false }))
            .handler(0x13, grouped(MessageHandler::LightOff { dimmer: false }))
            .handler(0x14, grouped(MessageHandler::LightOff { dimmer: false }))
            .handler(0x19, grouped(MessageHandler::KeypadButtonReply)),
        // LED state of every button in one reply
        "KeypadButtonGroup" => Feature::new(name, template, Dispatcher::DefaultGroup).poll(PollHandler::status(0x01)),
        "PollGroup" => Feature::new(name, template, Dispatcher::PollGroup).poll(PollHandler::status(0x00)),
        "LastHeardFrom" => Feature::new(name, template, Dispatcher::PassThrough)
            .status_feature()
            .default_handler(HandlerEntry::new(MessageHandler::LastHeard)),
        "X10Switch" | "X10Dimmer" => {
            let dimmer = template == "X10Dimmer";
            let mut f = Feature::new(name, template, Dispatcher::X10)
                .handler(0x02, HandlerEntry::new(MessageHandler::LightOn { dimmer }))
                .handler(0x03, HandlerEntry::new(MessageHandler::LightOff { dimmer }))
                .command(CommandKind::OnOff, CommandHandler::X10OnOff);
            if dimmer {
                f = f
                    .command(CommandKind::Percent, CommandHandler::X10Percent)
                    .command(CommandKind::IncreaseDecrease, CommandHandler::X10IncreaseDecrease);
            }
            f
        }
        _ => return None,
    };
    Some(f)
}

#[derive(Debug, Deserialize)]
struct DeviceTypeFile {
    #[serde(default, rename = "device_type")]
    device_types: Vec<DeviceType>,
}

#[derive(Debug, Clone)]
pub struct DeviceTypeRegistry {
    types: HashMap<String, DeviceType>,
}

impl DeviceTypeRegistry {
    /// The device types this driver knows out of the box.
    pub fn builtin() -> Self {
        let last_heard = || FeatureSpec::new("lastheardfrom", "LastHeardFrom");
        let types = vec![
            DeviceType::new(MODEM_PRODUCT_KEY, "2413U", "PowerLinc Modem"),
            DeviceType::new("F00.00.01", "2477D", "SwitchLinc Dimmer")
                .feature(FeatureSpec::new("dimmer", "DimmerLevel").group(1))
                .feature(FeatureSpec::new("fastonoff", "FastOnOff"))
                .feature(FeatureSpec::new("rampdimmer", "RampDimmer"))
                .feature(last_heard()),
            DeviceType::new("F00.00.02", "2477S", "SwitchLinc Switch")
                .feature(FeatureSpec::new("switch", "SwitchLevel").group(1))
                .feature(FeatureSpec::new("fastonoff", "FastOnOff"))
                .feature(last_heard()),
            DeviceType::new("F00.00.15", "2334-232", "KeypadLinc Dimmer 6 Button")
                .feature(FeatureSpec::new("loaddimmer", "DimmerLevel").group(1))
                .feature(FeatureSpec::new("buttonA", "KeypadButton").group(3))
                .feature(FeatureSpec::new("buttonB", "KeypadButton").group(4))
                .feature(FeatureSpec::new("buttonC", "KeypadButton").group(5))
                .feature(FeatureSpec::new("buttonD", "KeypadButton").group(6))
                .feature(last_heard())
                .feature_group(
                    "keypadbuttons",
                    "KeypadButtonGroup",
                    &["buttonA", "buttonB", "buttonC", "buttonD"],
                ),
            DeviceType::new("F00.00.18", "2441TH", "Insteon Thermostat")
                .feature(FeatureSpec::new("systemmode", "ThermostatSystemMode"))
                .feature(last_heard()),
            DeviceType::new("F00.00.24", "2475F", "FanLinc")
                .feature(FeatureSpec::new("lightdimmer", "DimmerLevel").group(1))
                .feature(FeatureSpec::new("fan", "FanLincFan"))
                .feature(last_heard()),
            DeviceType::new("X00.00.01", "X10 Switch", "Generic X10 Switch")
                .feature(FeatureSpec::new("switch", "X10Switch")),
            DeviceType::new("X00.00.02", "X10 Dimmer", "Generic X10 Dimmer")
                .feature(FeatureSpec::new("dimmer", "X10Dimmer")),
        ];
        Self {
            types: types.into_iter().map(|t| (t.product_key.clone(), t)).collect(),
        }
    }

    pub fn get(&self, product_key: &str) -> Result<&DeviceType, DeviceTypeError> {
        self.types
            .get(product_key)
            .ok_or_else(|| DeviceTypeError::UnknownProductKey(product_key.to_string()))
    }

    pub fn product_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.types.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Parse TOML device types and merge them over the table. Every type is
    /// checked before any is added. Returns the number merged.
    pub fn merge_toml(&mut self, text: &str) -> Result<usize, DeviceTypeError> {
        let file: DeviceTypeFile = toml::from_str(text)?;
        for t in &file.device_types {
            t.build_features()?;
        }
        let n = file.device_types.len();
        for t in file.device_types {
            if self.types.contains_key(&t.product_key) {
                info!("device type {} overrides the built-in definition", t.product_key);
            } else {
                debug!("adding device type {} ({})", t.product_key, t.model);
            }
            self.types.insert(t.product_key.clone(), t);
        }
        Ok(n)
    }

    pub async fn load_file(&mut self, path: &str) -> Result<usize, DeviceTypeError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| DeviceTypeError::Io {
                path: path.to_string(),
                source,
            })?;
        self.merge_toml(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::feature::QueryStatus;

    #[test]
    fn builtin_types_instantiate() {
        let reg = DeviceTypeRegistry::builtin();
        for key in reg.product_keys() {
            let features = reg.get(key).unwrap().build_features().unwrap();
            assert!(features.iter().all(|f| f.query_status() == QueryStatus::NotPending));
        }
        assert!(reg.get("F00.00.99").is_err());
        assert!(reg.get(MODEM_PRODUCT_KEY).unwrap().features.is_empty());
    }

    #[test]
    fn keypad_group_connects_buttons() {
        let reg = DeviceTypeRegistry::builtin();
        let features = reg.get("F00.00.15").unwrap().build_features().unwrap();
        let group = features.iter().find(|f| f.name() == "keypadbuttons").unwrap();
        assert_eq!(group.dispatcher(), Dispatcher::DefaultGroup);
        assert_eq!(group.connected().len(), 4);
        let first = group.connected()[0];
        assert_eq!(features[first.0].name(), "buttonA");
    }

    #[test]
    fn every_template_name_resolves() {
        for t in TEMPLATES {
            assert!(feature_from_template(&FeatureSpec::new("x", t)).is_some(), "{}", t);
        }
        assert!(feature_from_template(&FeatureSpec::new("x", "Nope")).is_none());
    }

    #[test]
    fn toml_types_merge_and_validate() {
        let mut reg = DeviceTypeRegistry::builtin();
        let before = reg.len();
        let n = reg
            .merge_toml(
                r#"
                [[device_type]]
                product_key = "F00.00.0E"
                model = "2476D"
                features = [
                    { name = "dimmer", template = "RampDimmer", ramp_time = 6.5 },
                    { name = "level", template = "DimmerLevel", group = 1 },
                ]
                "#,
            )
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(reg.len(), before + 1);
        let features = reg.get("F00.00.0E").unwrap().build_features().unwrap();
        assert_eq!(
            features[0].command_handler(CommandKind::Percent),
            CommandHandler::RampPercent { ramp_time: 6.5 }
        );

        let bad = reg.merge_toml(
            r#"
            [[device_type]]
            product_key = "F00.00.0F"
            features = [{ name = "a", template = "Bogus" }]
            "#,
        );
        assert!(matches!(bad, Err(DeviceTypeError::UnknownTemplate { .. })));
        assert!(reg.get("F00.00.0F").is_err());

        let bad_group = reg.merge_toml(
            r#"
            [[device_type]]
            product_key = "F00.00.10"
            features = [{ name = "a", template = "KeypadButton", group = 3 }]
            groups = [{ name = "g", template = "KeypadButtonGroup", members = ["b"] }]
            "#,
        );
        assert!(matches!(bad_group, Err(DeviceTypeError::UnknownMember { .. })));
    }
}
