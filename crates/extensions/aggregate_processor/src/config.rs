use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_GROUP_DURATION: Duration = Duration::from_secs(180);

/// Configuration of an aggregate processor
///
/// ```toml
/// identification_keys = ["sourceIp", "destinationIp"]
/// group_duration = "30s"
/// aggregate_when = "/status == 200"
/// aggregated_events_tag = "aggregated"
///
/// [action]
/// name = "count"
/// settings = { count_key = "total" }
/// ```
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateProcessorConfig {
    pub identification_keys: Vec<String>,

    #[serde(default = "default_group_duration")]
    #[serde(deserialize_with = "parse_human_duration")]
    pub group_duration: Duration,

    #[serde(default)]
    pub aggregate_when: Option<String>,

    #[serde(default)]
    pub aggregated_events_tag: Option<String>,

    pub action: ActionConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionConfig {
    pub name: String,

    #[serde(default)]
    pub settings: Value,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("At least one identification key is required")]
    NoIdentificationKeys,

    #[error("The group duration must be greater than zero")]
    ZeroGroupDuration,

    #[error("Unknown aggregate action: {name}")]
    UnknownAction { name: String },

    #[error("Invalid settings for the {action} aggregate action: {reason}")]
    InvalidSettings { action: String, reason: String },

    #[error(transparent)]
    InvalidToml(#[from] toml::de::Error),
}

impl AggregateProcessorConfig {
    pub fn new(identification_keys: Vec<String>, group_duration: Duration, action: &str) -> Self {
        AggregateProcessorConfig {
            identification_keys,
            group_duration,
            aggregate_when: None,
            aggregated_events_tag: None,
            action: ActionConfig {
                name: action.to_string(),
                settings: Value::Null,
            },
        }
    }

    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: AggregateProcessorConfig = toml::from_str(toml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identification_keys.is_empty() {
            return Err(ConfigError::NoIdentificationKeys);
        }
        if self.group_duration.is_zero() {
            return Err(ConfigError::ZeroGroupDuration);
        }
        Ok(())
    }
}

fn default_group_duration() -> Duration {
    DEFAULT_GROUP_DURATION
}

fn parse_human_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    humantime::parse_duration(&value).map_err(|_| serde::de::Error::custom("Invalid duration"))
}
