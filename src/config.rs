//! YAML configuration for Hearth.
//!
//! Loaded once at startup from `app_config.yaml` (or `$HEARTH_CONFIG`).
//! The whitelist/blacklist rule lives here because it is configuration
//! semantics, not HTTP semantics: a non-empty whitelist admits only listed
//! ids and the blacklist is ignored entirely; otherwise the blacklist
//! removes listed ids; otherwise everything is allowed. Both lists accept
//! `*`/`?` wildcards (`climate.*`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Main configuration container.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub home_assistant: HomeAssistantConfig,

    #[serde(default)]
    pub app: AppSettings,

    #[serde(default)]
    pub whitelist: Vec<String>,

    #[serde(default)]
    pub blacklist: Vec<String>,

    /// Extra IPs exempt from ban enforcement. Loopback addresses are always
    /// exempt regardless of this list.
    #[serde(default)]
    pub safe_ips: Vec<String>,

    #[serde(default = "default_ban_file")]
    pub ban_file: PathBuf,

    #[serde(default = "default_users_file")]
    pub users_file: PathBuf,
}

/// Home Assistant connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HomeAssistantConfig {
    pub url: String,
    pub api_token: String,
}

/// Application settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_history_days")]
    pub default_history_days: u32,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for AppSettings {
    fn default() -> Self {
        AppSettings {
            language: default_language(),
            default_history_days: default_history_days(),
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_language() -> String {
    "fr".to_string()
}

fn default_history_days() -> u32 {
    4
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_ban_file() -> PathBuf {
    PathBuf::from("ip_bans.yaml")
}

fn default_users_file() -> PathBuf {
    PathBuf::from("users.yaml")
}

/// Configuration safe to expose to the frontend. Never includes the API token.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicConfig {
    pub language: String,
    pub default_history_days: u32,
    pub ha_url: String,
}

impl Config {
    /// Load and validate configuration from a YAML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Configuration file not found: {}", path.display()))?;
        let mut config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("Invalid YAML in {}", path.display()))?;

        if config.home_assistant.url.is_empty() || config.home_assistant.api_token.is_empty() {
            anyhow::bail!("'url' and 'api_token' are required in the home_assistant section");
        }
        config.home_assistant.url = config.home_assistant.url.trim_end_matches('/').to_string();

        if !matches!(config.app.language.as_str(), "fr" | "en") {
            tracing::warn!(
                language = %config.app.language,
                "Unknown language, defaulting to 'fr'"
            );
            config.app.language = default_language();
        }

        Ok(config)
    }

    /// Whitelist/blacklist rule. A non-empty whitelist wins entirely:
    /// the blacklist is not consulted at all in that case.
    pub fn is_entity_allowed(&self, entity_id: &str) -> bool {
        if !self.whitelist.is_empty() {
            return self
                .whitelist
                .iter()
                .any(|pattern| pattern_matches(pattern, entity_id));
        }
        !self
            .blacklist
            .iter()
            .any(|pattern| pattern_matches(pattern, entity_id))
    }

    pub fn public(&self) -> PublicConfig {
        PublicConfig {
            language: self.app.language.clone(),
            default_history_days: self.app.default_history_days,
            ha_url: self.home_assistant.url.clone(),
        }
    }
}

/// Shell-style wildcard match: `*` spans any run of characters, `?` exactly
/// one. Iterative two-pointer scan with single-star backtracking.
fn pattern_matches(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(whitelist: &[&str], blacklist: &[&str]) -> Config {
        Config {
            home_assistant: HomeAssistantConfig {
                url: "http://ha.local:8123".into(),
                api_token: "token".into(),
            },
            app: AppSettings::default(),
            whitelist: whitelist.iter().map(|s| s.to_string()).collect(),
            blacklist: blacklist.iter().map(|s| s.to_string()).collect(),
            safe_ips: vec![],
            ban_file: default_ban_file(),
            users_file: default_users_file(),
        }
    }

    #[test]
    fn test_no_filters_allows_all() {
        let config = config_with(&[], &[]);
        assert!(config.is_entity_allowed("sensor.anything"));
    }

    #[test]
    fn test_whitelist_wins_over_blacklist() {
        // Deliberate simplification: whitelist non-empty means the
        // blacklist is ignored, even when it lists other entities.
        let config = config_with(&["climate.living_room"], &["sensor.x"]);
        assert!(config.is_entity_allowed("climate.living_room"));
        assert!(!config.is_entity_allowed("sensor.x"));
        assert!(!config.is_entity_allowed("sensor.y"));
    }

    #[test]
    fn test_blacklist_removes_listed_ids() {
        let config = config_with(&[], &["sensor.noisy"]);
        assert!(!config.is_entity_allowed("sensor.noisy"));
        assert!(config.is_entity_allowed("sensor.quiet"));
    }

    #[test]
    fn test_wildcard_patterns() {
        let config = config_with(&["climate.*"], &[]);
        assert!(config.is_entity_allowed("climate.living_room"));
        assert!(!config.is_entity_allowed("sensor.temperature"));

        assert!(pattern_matches("sensor.*_power", "sensor.oven_power"));
        assert!(pattern_matches("sensor.??", "sensor.ab"));
        assert!(!pattern_matches("sensor.??", "sensor.abc"));
        assert!(pattern_matches("*", "anything.at_all"));
    }

    #[test]
    fn test_load_from_yaml() {
        let yaml = r#"
home_assistant:
  url: "http://ha.local:8123/"
  api_token: "secret"
app:
  language: en
  default_history_days: 7
whitelist:
  - "climate.*"
safe_ips:
  - "10.0.0.2"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.app.language, "en");
        assert_eq!(config.app.default_history_days, 7);
        assert_eq!(config.whitelist, vec!["climate.*"]);
        assert_eq!(config.safe_ips, vec!["10.0.0.2"]);
        assert_eq!(config.ban_file, PathBuf::from("ip_bans.yaml"));
    }
}
