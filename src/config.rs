//! Operator configuration
//!
//! TOML file with four sections:
//! - `[guild]`: which guild this gate instance serves
//! - `[roles]`: entitlement role IDs (paid tier, free tier) and bypass roles
//! - `[timing]`: grace period, debounce, confirmation and drift-watch bounds
//! - `[logging]`: log level and optional log file
//!
//! Entitlement roles may be left unset; the gate then refuses to hold anyone
//! and says so on every join until the file is fixed.

use crate::platform::{GuildId, RetryPolicy, RoleId, RoleSet};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default log level
const DEFAULT_LOG_LEVEL: &str = "info";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write config file '{path}': {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Entitlement roles not configured: {0}")]
    MissingRoles(&'static str),

    #[error("Invalid entitlement roles: {0}")]
    InvalidRoles(String),
}

/// Gate configuration (operator settings)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    pub guild: GuildConfig,

    #[serde(default)]
    pub roles: RoleSettings,

    #[serde(default)]
    pub timing: Timing,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildConfig {
    pub id: GuildId,
}

/// Entitlement and bypass role IDs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSettings {
    /// Paid subscription tier
    pub paid: Option<RoleId>,

    /// Free tier; also what a joiner without entitlements is gated on
    pub free: Option<RoleId>,

    /// Holders of any of these skip the gate entirely
    #[serde(default)]
    pub bypass: Vec<RoleId>,
}

impl RoleSettings {
    /// Resolve the configured entitlement roles for a guild.
    ///
    /// Fails if either role is unset, if both are the same role, or if one of
    /// them is the guild's implicit everyone role.
    pub fn entitlements(&self, guild: GuildId) -> Result<EntitlementRoles, ConfigError> {
        let paid = self.paid.ok_or(ConfigError::MissingRoles("roles.paid"))?;
        let free = self.free.ok_or(ConfigError::MissingRoles("roles.free"))?;

        if paid == free {
            return Err(ConfigError::InvalidRoles(format!(
                "paid and free tier are the same role ({})",
                paid
            )));
        }
        if paid == guild.everyone_role() || free == guild.everyone_role() {
            return Err(ConfigError::InvalidRoles(
                "the everyone role cannot be an entitlement".to_string(),
            ));
        }

        Ok(EntitlementRoles { paid, free })
    }
}

/// The two entitlement classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitlementRoles {
    pub paid: RoleId,
    pub free: RoleId,
}

impl EntitlementRoles {
    pub fn contains(&self, role: RoleId) -> bool {
        role == self.paid || role == self.free
    }

    /// The entitlement roles within `roles`.
    pub fn intersect(&self, roles: &RoleSet) -> RoleSet {
        roles
            .iter()
            .copied()
            .filter(|role| self.contains(*role))
            .collect()
    }

    pub fn includes_paid(&self, roles: &RoleSet) -> bool {
        roles.contains(&self.paid)
    }
}

/// Delays and bounds of the hold/release state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Wait after a join before re-reading roles (partner assignment race)
    #[serde(with = "humantime_duration")]
    pub join_grace: Duration,

    /// Wait after entering verification, absorbing queued role events
    #[serde(with = "humantime_duration")]
    pub release_debounce: Duration,

    /// Polls of the live role list after a release
    pub confirm_attempts: u32,

    #[serde(with = "humantime_duration")]
    pub confirm_interval: Duration,

    /// Total post-release drift watch
    #[serde(with = "humantime_duration")]
    pub drift_watch: Duration,

    #[serde(with = "humantime_duration")]
    pub drift_interval: Duration,

    /// Retries for individual transient platform failures
    pub retry_limit: u32,

    #[serde(with = "humantime_duration")]
    pub retry_backoff: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            join_grace: Duration::from_secs(2),
            release_debounce: Duration::from_secs(1),
            confirm_attempts: 5,
            confirm_interval: Duration::from_secs(3),
            drift_watch: Duration::from_secs(120),
            drift_interval: Duration::from_secs(10),
            retry_limit: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl Timing {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_limit,
            base_delay: self.retry_backoff,
            max_delay: self.confirm_interval.max(self.retry_backoff),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            file: None,
        }
    }
}

impl GateConfig {
    /// Create a new configuration for a guild, entitlement roles unset
    pub fn new(guild: GuildId) -> Self {
        Self {
            guild: GuildConfig { id: guild },
            roles: RoleSettings::default(),
            timing: Timing::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(path, &contents)
    }

    fn parse(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        write_file(path, &contents)
    }

    /// Generate default configuration content as a string with comments
    pub fn generate_default_toml(guild: GuildId) -> String {
        format!(
            r#"# Subscription Verification Gate Configuration
#
# New members carrying entitlement roles have them held back until a human
# verification step releases them. Members joining without entitlements are
# gated on the free tier.

[guild]
id = {guild}

[roles]
# Entitlement role IDs. The gate refuses to hold anyone until both are set.
# paid = 0
# free = 0

# Roles whose holders skip verification entirely
bypass = []

[timing]
# Re-read a joiner's roles after this delay (partner integrations assign late)
join_grace = "2s"
# Settle time after verification starts, before roles are restored
release_debounce = "1s"
# Confirmation polls after restoring roles, and the delay between them
confirm_attempts = 5
confirm_interval = "3s"
# Watch restored roles for silent reverts this long, at this interval
drift_watch = "2m"
drift_interval = "10s"
# Retries for individual transient platform failures
retry_limit = 3
retry_backoff = "500ms"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (optional, logs to stderr if not specified)
# file = "/var/log/subgate/subgate.log"
"#,
            guild = guild
        )
    }

    /// Create and save a default configuration file
    pub fn create_default(config_path: &Path, guild: GuildId) -> Result<(), ConfigError> {
        write_file(config_path, &Self::generate_default_toml(guild))
    }
}

fn write_file(path: &Path, contents: &str) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };

    // Create parent directory if needed
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    fs::write(path, contents).map_err(write_err)
}

/// Serde adapter for human-readable durations ("2s", "1m 30s", "500ms")
mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const GUILD: GuildId = GuildId(100);

    #[test]
    fn test_default_config() {
        let config = GateConfig::new(GUILD);

        assert_eq!(config.guild.id, GUILD);
        assert_eq!(config.roles.paid, None);
        assert_eq!(config.timing.confirm_attempts, 5);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let mut config = GateConfig::new(GUILD);
        config.roles.paid = Some(RoleId(1));
        config.roles.free = Some(RoleId(2));
        config.timing.join_grace = Duration::from_millis(1500);
        config.save(&config_path).unwrap();

        let loaded = GateConfig::load(&config_path).unwrap();
        assert_eq!(loaded.roles, config.roles);
        assert_eq!(loaded.timing, config.timing);
    }

    #[test]
    fn test_create_default_config_loads() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        GateConfig::create_default(&config_path, GUILD).unwrap();
        assert!(config_path.exists());

        let config = GateConfig::load(&config_path).unwrap();
        assert_eq!(config.guild.id, GUILD);
        assert_eq!(config.timing, Timing::default());
        assert!(config.roles.bypass.is_empty());
        // Roles are deliberately left unset in the generated file
        assert!(config.roles.entitlements(GUILD).is_err());
    }

    #[test]
    fn test_load_config_with_defaults() {
        let minimal = r#"
[guild]
id = 100

[roles]
paid = 1
free = 2

[timing]
drift_watch = "30s"
"#;
        let config = GateConfig::parse(Path::new("inline.toml"), minimal).unwrap();

        assert_eq!(config.timing.drift_watch, Duration::from_secs(30));
        assert_eq!(config.timing.join_grace, Duration::from_secs(2));
        assert_eq!(config.logging.level, "info");
        assert_eq!(
            config.roles.entitlements(GUILD).unwrap(),
            EntitlementRoles {
                paid: RoleId(1),
                free: RoleId(2)
            }
        );
    }

    #[test]
    fn test_bad_duration_rejected() {
        let bad = r#"
[guild]
id = 100

[timing]
join_grace = "soon"
"#;
        let err = GateConfig::parse(Path::new("inline.toml"), bad).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = GateConfig::load(Path::new("/nonexistent/subgate.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_entitlements_validation() {
        let mut roles = RoleSettings::default();
        assert!(matches!(
            roles.entitlements(GUILD),
            Err(ConfigError::MissingRoles("roles.paid"))
        ));

        roles.paid = Some(RoleId(1));
        assert!(matches!(
            roles.entitlements(GUILD),
            Err(ConfigError::MissingRoles("roles.free"))
        ));

        roles.free = Some(RoleId(1));
        assert!(matches!(
            roles.entitlements(GUILD),
            Err(ConfigError::InvalidRoles(_))
        ));

        roles.free = Some(GUILD.everyone_role());
        assert!(matches!(
            roles.entitlements(GUILD),
            Err(ConfigError::InvalidRoles(_))
        ));
    }

    #[test]
    fn test_intersect_skips_other_roles() {
        let entitlements = EntitlementRoles {
            paid: RoleId(1),
            free: RoleId(2),
        };
        let roles: RoleSet = [RoleId(1), RoleId(5), GUILD.everyone_role()]
            .into_iter()
            .collect();

        assert_eq!(
            entitlements.intersect(&roles),
            [RoleId(1)].into_iter().collect()
        );
        assert!(entitlements.includes_paid(&roles));
    }

    #[test]
    fn test_retry_policy_from_timing() {
        let timing = Timing::default();
        let policy = timing.retry_policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(3));
    }
}
