//! Session configuration.
//!
//! Fixed when the session starts; nothing here changes while mounted. Values
//! come from an optional TOML file and are then overridden by command-line
//! flags in the binary.
//!
//! ```toml
//! capacity = "10M"
//! prompting = true
//! scope = "op"
//! prompt_timeout_secs = 30
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use strum::{Display, EnumString};
use thiserror::Error;

use crate::store::DEFAULT_CAPACITY;

/// How prompt answers are keyed in the grant table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumString, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ScopeMode {
    /// Key on (operation, exact path).
    #[default]
    Op,
    /// Key on the exact path only, covering any operation.
    Path,
}

/// Configuration errors. Fatal at startup, before anything is mounted.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid capacity {0:?}: expected a positive byte count such as 1048576, 512K or 10M")]
    InvalidCapacity(String),

    #[error("invalid scope mode {0:?}: expected \"op\" or \"path\"")]
    InvalidScopeMode(String),

    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Session configuration for one mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanaryConfig {
    /// Upper bound on the total bytes of all file contents.
    pub capacity_bytes: u64,
    /// When false, every call is allowed and only audited.
    pub prompting_enabled: bool,
    /// Grant keying.
    pub scope_mode: ScopeMode,
    /// Upper bound on how long one prompt may wait. `None` waits forever.
    pub prompt_timeout: Option<Duration>,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: DEFAULT_CAPACITY,
            prompting_enabled: true,
            scope_mode: ScopeMode::Op,
            prompt_timeout: None,
        }
    }
}

/// On-disk form; every field optional so a file can set just one thing.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    capacity: Option<CapacityValue>,
    prompting: Option<bool>,
    scope: Option<String>,
    prompt_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CapacityValue {
    Bytes(u64),
    Text(String),
}

impl CanaryConfig {
    /// Parse a TOML document on top of the defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        let mut config = Self::default();
        if let Some(capacity) = file.capacity {
            config.capacity_bytes = match capacity {
                CapacityValue::Bytes(n) => n,
                CapacityValue::Text(s) => parse_capacity(&s)?,
            };
        }
        if let Some(prompting) = file.prompting {
            config.prompting_enabled = prompting;
        }
        if let Some(scope) = file.scope {
            config.scope_mode = parse_scope_mode(&scope)?;
        }
        if let Some(secs) = file.prompt_timeout_secs {
            // 0 means wait forever, same as leaving it out.
            config.prompt_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject values the session cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity_bytes == 0 {
            return Err(ConfigError::InvalidCapacity("0".to_string()));
        }
        if usize::try_from(self.capacity_bytes).is_err() {
            return Err(ConfigError::InvalidCapacity(self.capacity_bytes.to_string()));
        }
        Ok(())
    }
}

/// Parse a scope mode name (`op` or `path`).
pub fn parse_scope_mode(s: &str) -> Result<ScopeMode, ConfigError> {
    ScopeMode::from_str(s.trim()).map_err(|_| ConfigError::InvalidScopeMode(s.to_string()))
}

/// Parse a byte count with an optional binary `K`, `M` or `G` suffix.
pub fn parse_capacity(s: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidCapacity(s.to_string());
    let trimmed = s.trim();
    let (digits, scale) = match trimmed.chars().last() {
        Some(c) if c.eq_ignore_ascii_case(&'k') => (&trimmed[..trimmed.len() - 1], 1u64 << 10),
        Some(c) if c.eq_ignore_ascii_case(&'m') => (&trimmed[..trimmed.len() - 1], 1u64 << 20),
        Some(c) if c.eq_ignore_ascii_case(&'g') => (&trimmed[..trimmed.len() - 1], 1u64 << 30),
        _ => (trimmed, 1),
    };
    let value = digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(scale))
        .ok_or_else(invalid)?;
    if value == 0 {
        return Err(invalid());
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CanaryConfig::default();
        assert_eq!(config.capacity_bytes, 10 * 1024 * 1024);
        assert!(config.prompting_enabled);
        assert_eq!(config.scope_mode, ScopeMode::Op);
        assert!(config.prompt_timeout.is_none());
    }

    #[test]
    fn test_parse_capacity() {
        assert_eq!(parse_capacity("1024").unwrap(), 1024);
        assert_eq!(parse_capacity("512K").unwrap(), 512 * 1024);
        assert_eq!(parse_capacity("10m").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_capacity("1G").unwrap(), 1 << 30);
        assert!(matches!(
            parse_capacity("0"),
            Err(ConfigError::InvalidCapacity(_))
        ));
        assert!(parse_capacity("ten").is_err());
        assert!(parse_capacity("").is_err());
    }

    #[test]
    fn test_parse_scope_mode() {
        assert_eq!(parse_scope_mode("op").unwrap(), ScopeMode::Op);
        assert_eq!(parse_scope_mode("path").unwrap(), ScopeMode::Path);
        assert!(matches!(
            parse_scope_mode("subtree"),
            Err(ConfigError::InvalidScopeMode(_))
        ));
        assert_eq!(ScopeMode::Path.to_string(), "path");
    }

    #[test]
    fn test_from_toml() {
        let config = CanaryConfig::from_toml_str(
            r#"
            capacity = "1M"
            prompting = false
            scope = "path"
            prompt_timeout_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.capacity_bytes, 1 << 20);
        assert!(!config.prompting_enabled);
        assert_eq!(config.scope_mode, ScopeMode::Path);
        assert_eq!(config.prompt_timeout, Some(Duration::from_secs(5)));

        let config = CanaryConfig::from_toml_str("capacity = 2048").unwrap();
        assert_eq!(config.capacity_bytes, 2048);
        assert!(config.prompting_enabled);
    }

    #[test]
    fn test_from_toml_rejects_bad_values() {
        assert!(matches!(
            CanaryConfig::from_toml_str("scope = \"tree\""),
            Err(ConfigError::InvalidScopeMode(_))
        ));
        assert!(matches!(
            CanaryConfig::from_toml_str("capacity = 0"),
            Err(ConfigError::InvalidCapacity(_))
        ));
        assert!(matches!(
            CanaryConfig::from_toml_str("colour = \"red\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "scope = \"path\"").unwrap();
        let config = CanaryConfig::load(file.path()).unwrap();
        assert_eq!(config.scope_mode, ScopeMode::Path);

        assert!(matches!(
            CanaryConfig::load(Path::new("/definitely/not/here.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
