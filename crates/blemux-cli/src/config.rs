//! Roster and controller configuration.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use blemux_core::{CyclerConfig, ParameterPolicy, RetryConfig};
use blemux_types::{
    Address, AdvertisingParameters, Identity, MAX_LOCAL_NAME_LEN, MAX_PAYLOAD_LEN, PayloadBuilder,
    Roster,
};

/// Longest accepted HCI command timeout.
const MAX_COMMAND_TIMEOUT_MS: u64 = 60_000;

/// Multiplexer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Controller selection.
    pub controller: ControllerConfig,
    /// Dwell, parameters and payload layout.
    pub advertising: AdvertisingConfig,
    /// Back-off for failed critical commands.
    pub retry: RetrySettings,
    /// Identities to cycle through, in order.
    pub identities: Vec<IdentityConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            advertising: AdvertisingConfig::default(),
            retry: RetrySettings::default(),
            identities: Roster::reference()
                .iter()
                .map(IdentityConfig::from)
                .collect(),
        }
    }
}

impl Config {
    /// Load configuration from the default path.
    ///
    /// A missing file yields the reference configuration.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return every error found.
    ///
    /// This checks:
    /// - Command timeout and dwell are non-zero and bounded
    /// - Advertising intervals are within 0x0020..=0x4000 and ordered
    /// - Service UUIDs leave room for the local name
    /// - At least one identity; names 1..=248 bytes; addresses parse
    /// - No duplicate addresses
    /// - Every identity's payload can be built
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.controller.validate());
        errors.extend(self.advertising.validate());
        errors.extend(self.retry.validate());

        if self.identities.is_empty() {
            errors.push(ValidationError::new(
                "identities",
                "at least one identity is required",
            ));
        }

        let builder = self.advertising.payload_builder();
        let layout_fits = builder.fixed_len() + 2 <= MAX_PAYLOAD_LEN;
        let mut seen: HashMap<Address, usize> = HashMap::new();

        for (i, identity) in self.identities.iter().enumerate() {
            let prefix = format!("identities[{}]", i);
            errors.extend(identity.validate(&prefix));

            if let Ok(address) = identity.address.parse::<Address>() {
                match seen.entry(address) {
                    Entry::Occupied(first) => errors.push(ValidationError::new(
                        format!("{}.address", prefix),
                        format!(
                            "duplicate address {} (also used by identities[{}])",
                            address,
                            first.get()
                        ),
                    )),
                    Entry::Vacant(slot) => {
                        slot.insert(i);
                    }
                }
            }

            if layout_fits
                && !identity.name.is_empty()
                && let Err(e) = builder.build_name(&identity.name)
            {
                errors.push(ValidationError::new(
                    format!("{}.name", prefix),
                    format!("payload cannot be built: {}", e),
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Build the roster from the configured identities.
    pub fn roster(&self) -> Result<Roster, ConfigError> {
        let mut identities = Vec::with_capacity(self.identities.len());
        for (i, entry) in self.identities.iter().enumerate() {
            let address = entry.address.parse::<Address>().map_err(|e| {
                ConfigError::Validation(vec![ValidationError::new(
                    format!("identities[{}].address", i),
                    e.to_string(),
                )])
            })?;
            let identity = Identity::new(entry.name.clone(), address).map_err(|e| {
                ConfigError::Validation(vec![ValidationError::new(
                    format!("identities[{}].name", i),
                    e.to_string(),
                )])
            })?;
            identities.push(identity);
        }

        Roster::new(identities).map_err(|e| {
            ConfigError::Validation(vec![ValidationError::new("identities", e.to_string())])
        })
    }

    /// Cycler settings derived from this configuration.
    pub fn cycler_config(&self) -> CyclerConfig {
        CyclerConfig {
            dwell: self.advertising.dwell(),
            parameters: self.advertising.parameters(),
            parameter_policy: self.advertising.resend_parameters,
            payload: self.advertising.payload_builder(),
            retry: self.retry.to_retry_config(),
        }
    }
}

/// How the controller is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Raw HCI socket (Linux).
    #[default]
    Hci,
    /// In-process mock controller; no radio.
    Simulated,
}

/// Controller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Controller binding.
    pub transport: Transport,
    /// HCI device index (`hci0` = 0).
    pub device: u16,
    /// Time to wait for each command acknowledgement, in milliseconds.
    pub command_timeout_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            transport: Transport::default(),
            device: 0,
            command_timeout_ms: 1000,
        }
    }
}

impl ControllerConfig {
    /// Validate controller configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.command_timeout_ms == 0 {
            errors.push(ValidationError::new(
                "controller.command_timeout_ms",
                "command timeout must be greater than 0",
            ));
        } else if self.command_timeout_ms > MAX_COMMAND_TIMEOUT_MS {
            errors.push(ValidationError::new(
                "controller.command_timeout_ms",
                format!(
                    "command timeout {} ms is too long (max {} ms)",
                    self.command_timeout_ms, MAX_COMMAND_TIMEOUT_MS
                ),
            ));
        }

        errors
    }

    /// Command timeout as a duration.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Named interval presets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalProfile {
    /// 100 ms fixed.
    #[default]
    Standard,
    /// 20 to 40 ms.
    Fast,
}

/// Advertising settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvertisingConfig {
    /// Time each identity stays on air, in milliseconds.
    pub dwell_ms: u64,
    /// Interval preset.
    pub profile: IntervalProfile,
    /// Explicit minimum interval in 0.625 ms units (overrides the profile).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_min: Option<u16>,
    /// Explicit maximum interval in 0.625 ms units (overrides the profile).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_max: Option<u16>,
    /// When advertising parameters are sent to the controller.
    pub resend_parameters: ParameterPolicy,
    /// 16-bit service UUIDs advertised ahead of the name.
    pub service_uuids: Vec<u16>,
    /// Emit an empty name structure instead of skipping the identity.
    pub allow_empty_name: bool,
}

impl Default for AdvertisingConfig {
    fn default() -> Self {
        Self {
            dwell_ms: 1000,
            profile: IntervalProfile::default(),
            interval_min: None,
            interval_max: None,
            resend_parameters: ParameterPolicy::default(),
            service_uuids: Vec::new(),
            allow_empty_name: true,
        }
    }
}

impl AdvertisingConfig {
    /// Validate advertising configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.dwell_ms == 0 {
            errors.push(ValidationError::new(
                "advertising.dwell_ms",
                "dwell must be greater than 0",
            ));
        }

        if let Err(e) = self.parameters().validate() {
            errors.push(ValidationError::new("advertising.interval", e.to_string()));
        }

        let builder = self.payload_builder();
        if builder.fixed_len() + 2 > MAX_PAYLOAD_LEN {
            errors.push(ValidationError::new(
                "advertising.service_uuids",
                format!(
                    "{} service UUIDs leave no room for the local name",
                    self.service_uuids.len()
                ),
            ));
        }

        errors
    }

    /// Dwell as a duration.
    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.dwell_ms)
    }

    /// Parameters from the profile, with explicit intervals applied.
    pub fn parameters(&self) -> AdvertisingParameters {
        let mut params = match self.profile {
            IntervalProfile::Standard => AdvertisingParameters::standard(),
            IntervalProfile::Fast => AdvertisingParameters::fast(),
        };
        if let Some(min) = self.interval_min {
            params.interval_min = min;
        }
        if let Some(max) = self.interval_max {
            params.interval_max = max;
        }
        params
    }

    /// Payload builder for the configured layout.
    pub fn payload_builder(&self) -> PayloadBuilder {
        PayloadBuilder::new()
            .service_uuids(self.service_uuids.iter().copied())
            .allow_empty_name(self.allow_empty_name)
    }
}

/// Retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries per identity before the cycle fails.
    pub max_retries: u32,
    /// First back-off delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Back-off ceiling in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
        }
    }
}

impl RetrySettings {
    /// Validate retry configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.initial_delay_ms > self.max_delay_ms {
            errors.push(ValidationError::new(
                "retry.initial_delay_ms",
                format!(
                    "initial delay {} ms exceeds max delay {} ms",
                    self.initial_delay_ms, self.max_delay_ms
                ),
            ));
        }

        errors
    }

    /// Retry policy for the cycler.
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries)
            .initial_delay(Duration::from_millis(self.initial_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
    }
}

/// One `[[identities]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Advertised local name.
    pub name: String,
    /// Static random address, `AA:BB:CC:DD:EE:FF`.
    pub address: String,
}

impl IdentityConfig {
    /// Validate a single identity entry.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.name.is_empty() {
            errors.push(ValidationError::new(
                format!("{}.name", prefix),
                "name cannot be empty",
            ));
        } else if self.name.len() > MAX_LOCAL_NAME_LEN {
            errors.push(ValidationError::new(
                format!("{}.name", prefix),
                format!(
                    "name is {} bytes (max {})",
                    self.name.len(),
                    MAX_LOCAL_NAME_LEN
                ),
            ));
        }

        if let Err(e) = self.address.parse::<Address>() {
            errors.push(ValidationError::new(
                format!("{}.address", prefix),
                e.to_string(),
            ));
        }

        errors
    }
}

impl From<&Identity> for IdentityConfig {
    fn from(identity: &Identity) -> Self {
        Self {
            name: identity.name().to_string(),
            address: identity.address().to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path (e.g., `advertising.dwell_ms` or `identities[0].address`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("blemux")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validation_errors(config: &Config) -> Vec<ValidationError> {
        match config.validate() {
            Err(ConfigError::Validation(errors)) => errors,
            other => panic!("expected validation errors, got {:?}", other),
        }
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.controller.transport, Transport::Hci);
        assert_eq!(config.controller.command_timeout_ms, 1000);
        assert_eq!(config.advertising.dwell_ms, 1000);
        assert_eq!(config.identities.len(), 3);
        assert_eq!(config.identities[0].name, "DISP_01");
        assert_eq!(config.identities[2].address, "AA:BB:CC:DD:EE:03");
        config.validate().expect("Default config should be valid");
    }

    #[test]
    fn test_default_roster_matches_reference() {
        assert_eq!(Config::default().roster().unwrap(), Roster::reference());
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("blemux/config.toml"));
    }

    #[test]
    fn test_config_full_toml() {
        let toml = r#"
            [controller]
            transport = "simulated"
            device = 1
            command_timeout_ms = 500

            [advertising]
            dwell_ms = 2000
            profile = "fast"
            resend_parameters = "once"
            service_uuids = [0x180D]
            allow_empty_name = false

            [retry]
            max_retries = 5
            initial_delay_ms = 50

            [[identities]]
            name = "Heart Rate"
            address = "C0:11:22:33:44:55"

            [[identities]]
            name = "Thermometer"
            address = "c0:11:22:33:44:56"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.controller.transport, Transport::Simulated);
        assert_eq!(config.controller.device, 1);
        assert_eq!(config.controller.command_timeout(), Duration::from_millis(500));
        assert_eq!(config.advertising.resend_parameters, ParameterPolicy::Once);
        assert_eq!(config.retry.max_delay_ms, 5000);

        let cycler = config.cycler_config();
        assert_eq!(cycler.dwell, Duration::from_secs(2));
        assert_eq!(cycler.parameters, AdvertisingParameters::fast());
        assert_eq!(cycler.payload.name_budget(), 22);
        assert_eq!(cycler.retry.max_retries, 5);

        let roster = config.roster().unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(
            roster.get(1).unwrap().address(),
            Address::new([0xC0, 0x11, 0x22, 0x33, 0x44, 0x56])
        );
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str("[advertising]\ndwell_ms = 250\n").unwrap();
        assert_eq!(config.advertising.dwell_ms, 250);
        assert_eq!(config.controller, ControllerConfig::default());
        assert_eq!(config.identities.len(), 3);
    }

    #[test]
    fn test_explicit_intervals_override_profile() {
        let config: Config =
            toml::from_str("[advertising]\nprofile = \"fast\"\ninterval_max = 0x0100\n").unwrap();
        let params = config.advertising.parameters();
        assert_eq!(params.interval_min, 0x0020);
        assert_eq!(params.interval_max, 0x0100);
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.advertising.dwell_ms = 1500;
        config.advertising.service_uuids = vec![0x180D];
        config.identities.truncate(1);

        config.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();
        loaded.validate().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_load_nonexistent() {
        let result = Config::load("/nonexistent/path/config.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("invalid.toml");
        std::fs::write(&config_path, "this is not valid { toml").unwrap();

        let result = Config::load(&config_path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_unknown_transport_rejected() {
        let result: Result<Config, _> = toml::from_str("[controller]\ntransport = \"usb\"\n");
        assert!(result.is_err());
    }

    // ==========================================================================
    // Validation tests
    // ==========================================================================

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = Config::default();
        config.controller.command_timeout_ms = 0;
        config.advertising.dwell_ms = 0;
        config.advertising.interval_min = Some(0x0010);
        config.identities[1].address = "not-an-address".to_string();

        let errors = validation_errors(&config);
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "controller.command_timeout_ms",
                "advertising.dwell_ms",
                "advertising.interval",
                "identities[1].address",
            ]
        );
    }

    #[test]
    fn test_duplicate_addresses_case_insensitive() {
        let mut config = Config::default();
        config.identities[2].address = "aa:bb:cc:dd:ee:01".to_string();

        let errors = validation_errors(&config);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "identities[2].address");
        assert!(errors[0].message.contains("identities[0]"));
    }

    #[test]
    fn test_empty_identities() {
        let mut config = Config::default();
        config.identities.clear();
        let errors = validation_errors(&config);
        assert_eq!(errors[0].field, "identities");
    }

    #[test]
    fn test_name_bounds() {
        let mut config = Config::default();
        config.identities[0].name = String::new();
        config.identities[1].name = "n".repeat(MAX_LOCAL_NAME_LEN + 1);

        let errors = validation_errors(&config);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("empty"));
        assert!(errors[1].message.contains("249 bytes"));
    }

    #[test]
    fn test_long_name_is_valid() {
        let mut config = Config::default();
        config.identities[0].name = "n".repeat(MAX_LOCAL_NAME_LEN);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_too_many_service_uuids() {
        let mut config = Config::default();
        config.advertising.service_uuids = (0x1800..0x180D).collect();

        let errors = validation_errors(&config);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "advertising.service_uuids");
    }

    #[test]
    fn test_strict_names_without_room() {
        let mut config = Config::default();
        config.advertising.service_uuids = (0x1800..0x180C).collect();
        config.advertising.allow_empty_name = false;

        let errors = validation_errors(&config);
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().all(|e| e.message.contains("payload cannot be built")));
    }

    #[test]
    fn test_retry_delay_order() {
        let mut config = Config::default();
        config.retry.initial_delay_ms = 10_000;
        let errors = validation_errors(&config);
        assert_eq!(errors[0].field, "retry.initial_delay_ms");
    }

    #[test]
    fn test_validation_error_display() {
        let error = ConfigError::Validation(vec![ValidationError::new(
            "advertising.dwell_ms",
            "dwell must be greater than 0",
        )]);
        assert_eq!(
            error.to_string(),
            "Configuration validation failed:\n  - advertising.dwell_ms: dwell must be greater than 0"
        );
    }
}
