//! Bus topic construction and inbound command topic parsing
//!
//! Every topic lives under a configurable root (`matter` by default):
//!
//! - `<base>/bridge/state`, `<base>/bridge/info`, `<base>/bridge/config/devices`
//!   and `<base>/bridge/devices` describe the bridge itself
//! - `<base>/<id>/availability` and `<base>/<id>/<suffix>` mirror one device
//! - `<base>/<id>/set/<cluster>[/<command>]` carries inbound commands

/// Builds topics under one base topic
#[derive(Debug, Clone, PartialEq)]
pub struct TopicBuilder {
    base: String,
}

impl TopicBuilder {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// `<base>/bridge/state`: `online`/`offline`, also the last-will topic
    pub fn bridge_state(&self) -> String {
        format!("{}/bridge/state", self.base)
    }

    /// `<base>/bridge/info`: periodic JSON summary
    pub fn bridge_info(&self) -> String {
        format!("{}/bridge/info", self.base)
    }

    /// `<base>/bridge/config/devices`: JSON list of friendly names
    pub fn bridge_device_names(&self) -> String {
        format!("{}/bridge/config/devices", self.base)
    }

    /// `<base>/bridge/devices`: join and leave events
    pub fn bridge_devices(&self) -> String {
        format!("{}/bridge/devices", self.base)
    }

    pub fn availability(&self, stable_id: &str) -> String {
        format!("{}/{}/availability", self.base, stable_id)
    }

    pub fn attribute(&self, stable_id: &str, suffix: &str) -> String {
        format!("{}/{}/{}", self.base, stable_id, suffix)
    }

    /// Subscription filter for every device's command topics
    pub fn command_filter(&self) -> String {
        format!("{}/+/set/#", self.base)
    }

    /// Split `<base>/<id>/set/<cluster>[/<command>]`
    ///
    /// A missing command level yields `default`, leaving the payload to
    /// select the action. Levels beyond the command are ignored.
    pub fn parse_command(&self, topic: &str) -> Option<CommandTopic> {
        let rest = topic.strip_prefix(self.base.as_str())?.strip_prefix('/')?;
        let mut levels = rest.split('/');

        let identifier = levels.next().filter(|s| !s.is_empty())?;
        if levels.next()? != "set" {
            return None;
        }
        let cluster = levels.next().filter(|s| !s.is_empty())?;
        let command = levels
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_COMMAND);

        Some(CommandTopic {
            identifier: identifier.to_string(),
            cluster: cluster.to_string(),
            command: command.to_string(),
        })
    }
}

/// Command name used when the topic stops at the cluster level
pub const DEFAULT_COMMAND: &str = "default";

/// Parsed inbound command address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTopic {
    pub identifier: String,
    pub cluster: String,
    pub command: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bridge_topics() {
        let topics = TopicBuilder::new("matter");
        assert_eq!(topics.bridge_state(), "matter/bridge/state");
        assert_eq!(topics.bridge_info(), "matter/bridge/info");
        assert_eq!(topics.bridge_device_names(), "matter/bridge/config/devices");
        assert_eq!(topics.bridge_devices(), "matter/bridge/devices");
        assert_eq!(topics.command_filter(), "matter/+/set/#");
    }

    #[test]
    fn test_device_topics() {
        let topics = TopicBuilder::new("matter");
        assert_eq!(topics.availability("node_7"), "matter/node_7/availability");
        assert_eq!(
            topics.attribute("kitchen", "temperature"),
            "matter/kitchen/temperature"
        );
    }

    #[test]
    fn test_parse_full_command() {
        let topics = TopicBuilder::new("matter");
        assert_eq!(
            topics.parse_command("matter/kitchen-lamp/set/onoff/on"),
            Some(CommandTopic {
                identifier: "kitchen-lamp".to_string(),
                cluster: "onoff".to_string(),
                command: "on".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_command_without_command_level() {
        let topics = TopicBuilder::new("matter");
        let parsed = topics.parse_command("matter/12/set/onoff").unwrap();
        assert_eq!(parsed.identifier, "12");
        assert_eq!(parsed.command, DEFAULT_COMMAND);
    }

    #[test]
    fn test_parse_rejects_foreign_topics() {
        let topics = TopicBuilder::new("matter");
        assert_eq!(topics.parse_command("other/lamp/set/onoff/on"), None);
        assert_eq!(topics.parse_command("matterx/lamp/set/onoff/on"), None);
        assert_eq!(topics.parse_command("matter/lamp/get/onoff/on"), None);
        assert_eq!(topics.parse_command("matter/lamp/set"), None);
        assert_eq!(topics.parse_command("matter//set/onoff"), None);
    }

    #[test]
    fn test_parse_with_nested_base() {
        let topics = TopicBuilder::new("home/matter");
        let parsed = topics.parse_command("home/matter/lamp/set/onoff/toggle").unwrap();
        assert_eq!(parsed.identifier, "lamp");
        assert_eq!(parsed.command, "toggle");
    }

    proptest! {
        #[test]
        fn parse_recovers_identifier(id in "[a-zA-Z0-9_-]{1,24}", cmd in "[a-z]{1,8}") {
            let topics = TopicBuilder::new("matter");
            let topic = format!("matter/{id}/set/onoff/{cmd}");
            let parsed = topics.parse_command(&topic).unwrap();
            prop_assert_eq!(parsed.identifier, id);
            prop_assert_eq!(parsed.command, cmd);
        }
    }
}
