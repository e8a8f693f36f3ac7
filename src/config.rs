use std::collections::HashMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

/// All durable state lives under this directory, relative to the project
/// root the daemon is started from.
pub const DATA_DIR: &str = "tmp/cc-discord-bot";

/// Prompt template rendered into the positional agent prompt.
pub const PROMPT_TEMPLATE_PATH: &str = "prompts/prompt_template.md";

/// System prompt file handed to the agent CLI via --append-system-prompt-file.
pub const SYSTEM_PROMPT_PATH: &str = "prompts/system_prompt.md";

static SNOWFLAKE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{17,20}$").unwrap());
static ENV_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Env keys the gateway always sets itself; user-supplied extras that
/// collide are rejected at validation time.
pub const RESERVED_ENV_KEYS: [&str; 2] = ["FORCE_COLOR", "CLAUDECODE"];

/// Boot configuration drawn from the environment.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub discord_token: String,
    pub allowed_user_ids: Vec<u64>,
}

impl BotConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let discord_token = std::env::var("DISCORD_BOT_TOKEN")
            .map_err(|_| anyhow::anyhow!("DISCORD_BOT_TOKEN is not set"))?;
        if discord_token.trim().is_empty() {
            anyhow::bail!("DISCORD_BOT_TOKEN is empty");
        }

        let raw_ids = std::env::var("ALLOWED_USER_IDS")
            .map_err(|_| anyhow::anyhow!("ALLOWED_USER_IDS is not set"))?;
        let mut allowed_user_ids = Vec::new();
        for part in raw_ids.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if !SNOWFLAKE_RE.is_match(part) {
                anyhow::bail!("ALLOWED_USER_IDS entry '{}' is not a snowflake", part);
            }
            allowed_user_ids.push(part.parse::<u64>()?);
        }
        if allowed_user_ids.is_empty() {
            anyhow::bail!("ALLOWED_USER_IDS must list at least one user id");
        }

        Ok(Self {
            discord_token,
            allowed_user_ids,
        })
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    Main,
    Isolated,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    pub name: String,
    pub cron: String,
    pub timezone: String,
    #[serde(default)]
    pub prompt: String,
    pub discord_notify: bool,
    #[serde(default)]
    pub prompt_file: Option<String>,
    #[serde(default)]
    pub skippable: bool,
    #[serde(default)]
    pub session_mode: SessionMode,
}

/// The on-disk settings file (JSON). Unknown keys are rejected so typos
/// fail at boot instead of silently doing nothing.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(rename = "bypass-mode", default)]
    pub bypass_mode: bool,
    #[serde(default = "default_enable_sandbox")]
    pub enable_sandbox: bool,
    #[serde(default = "default_claude_timeout")]
    pub claude_timeout_seconds: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub discord_connection_heartbeat_interval_seconds: u64,
    #[serde(default = "default_reconnect_grace")]
    pub discord_connection_reconnect_grace_seconds: u64,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

fn default_enable_sandbox() -> bool {
    true
}
fn default_claude_timeout() -> u64 {
    1800
}
fn default_heartbeat_interval() -> u64 {
    60
}
fn default_reconnect_grace() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bypass_mode: false,
            enable_sandbox: default_enable_sandbox(),
            claude_timeout_seconds: default_claude_timeout(),
            discord_connection_heartbeat_interval_seconds: default_heartbeat_interval(),
            discord_connection_reconnect_grace_seconds: default_reconnect_grace(),
            env: HashMap::new(),
            schedules: Vec::new(),
        }
    }
}

impl Settings {
    /// Load and validate the settings file. A missing file yields defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let settings = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str::<Settings>(&content)
                .map_err(|e| anyhow::anyhow!("invalid settings file {}: {}", path.display(), e))?
        } else {
            Settings::default()
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(10..=7200).contains(&self.claude_timeout_seconds) {
            anyhow::bail!(
                "claude_timeout_seconds must be in 10..=7200, got {}",
                self.claude_timeout_seconds
            );
        }
        if !(10..=300).contains(&self.discord_connection_heartbeat_interval_seconds) {
            anyhow::bail!(
                "discord_connection_heartbeat_interval_seconds must be in 10..=300, got {}",
                self.discord_connection_heartbeat_interval_seconds
            );
        }
        if !(5..=120).contains(&self.discord_connection_reconnect_grace_seconds) {
            anyhow::bail!(
                "discord_connection_reconnect_grace_seconds must be in 5..=120, got {}",
                self.discord_connection_reconnect_grace_seconds
            );
        }

        for key in self.env.keys() {
            if !ENV_KEY_RE.is_match(key) {
                anyhow::bail!("env key '{}' is not a valid identifier", key);
            }
            if RESERVED_ENV_KEYS.contains(&key.as_str()) {
                anyhow::bail!("env key '{}' is reserved", key);
            }
        }

        let mut seen_session_names: HashMap<String, &str> = HashMap::new();
        for schedule in &self.schedules {
            if schedule.name.trim().is_empty() {
                anyhow::bail!("schedule with empty name");
            }
            schedule
                .cron
                .parse::<croner::Cron>()
                .map_err(|e| anyhow::anyhow!("schedule '{}': bad cron: {}", schedule.name, e))?;
            schedule.timezone.parse::<chrono_tz::Tz>().map_err(|_| {
                anyhow::anyhow!("schedule '{}': unknown timezone '{}'", schedule.name, schedule.timezone)
            })?;
            if schedule.prompt.trim().is_empty() && schedule.prompt_file.is_none() {
                anyhow::bail!("schedule '{}': needs prompt or prompt_file", schedule.name);
            }

            // Two schedules collapsing to one session file would silently
            // share agent context; the settings file is the guard.
            let sanitized = sanitize_schedule_name(&schedule.name);
            if let Some(other) = seen_session_names.insert(sanitized.clone(), &schedule.name) {
                anyhow::bail!(
                    "schedules '{}' and '{}' collide on session file name '{}'",
                    other,
                    schedule.name,
                    sanitized
                );
            }
        }

        Ok(())
    }

    pub fn schedule(&self, name: &str) -> Option<&ScheduleConfig> {
        self.schedules.iter().find(|s| s.name == name)
    }
}

/// Settings file path, overridable for tests and multi-bot setups.
pub fn settings_path() -> PathBuf {
    std::env::var("CCDB_SETTINGS_FILE")
        .ok()
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("settings.json"))
}

/// Isolated-session filenames are derived from the schedule name; anything
/// outside `[A-Za-z0-9_-]` becomes `_`.
pub fn sanitize_schedule_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn data_dir() -> PathBuf {
    PathBuf::from(DATA_DIR)
}

pub fn event_bus_path() -> PathBuf {
    data_dir().join("event-bus.sqlite3")
}

pub fn sandbox_id_path() -> PathBuf {
    data_dir().join("sandbox_id.txt")
}

pub fn attachments_dir(message_id: &str) -> PathBuf {
    data_dir().join("attachments").join(message_id)
}

pub fn handoff_path(schedule_name: &str, at: chrono::DateTime<chrono::Local>) -> PathBuf {
    data_dir()
        .join("handoffs")
        .join(at.format("%Y/%m/%d").to_string())
        .join(format!("{}.md", sanitize_schedule_name(schedule_name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> anyhow::Result<Settings> {
        let settings: Settings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    #[test]
    fn defaults_are_valid() {
        let settings = parse("{}").unwrap();
        assert!(settings.enable_sandbox);
        assert!(!settings.bypass_mode);
        assert_eq!(settings.claude_timeout_seconds, 1800);
        assert_eq!(settings.discord_connection_heartbeat_interval_seconds, 60);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(parse(r#"{"bypass_mode": true}"#).is_err());
        assert!(parse(r#"{"no_such_key": 1}"#).is_err());
    }

    #[test]
    fn bypass_mode_uses_dashed_key() {
        let settings = parse(r#"{"bypass-mode": true}"#).unwrap();
        assert!(settings.bypass_mode);
    }

    #[test]
    fn timeout_range_enforced() {
        assert!(parse(r#"{"claude_timeout_seconds": 9}"#).is_err());
        assert!(parse(r#"{"claude_timeout_seconds": 7201}"#).is_err());
        assert!(parse(r#"{"claude_timeout_seconds": 10}"#).is_ok());
    }

    #[test]
    fn heartbeat_and_grace_ranges_enforced() {
        assert!(parse(r#"{"discord_connection_heartbeat_interval_seconds": 5}"#).is_err());
        assert!(parse(r#"{"discord_connection_reconnect_grace_seconds": 121}"#).is_err());
        assert!(parse(r#"{"discord_connection_reconnect_grace_seconds": 5}"#).is_ok());
    }

    #[test]
    fn env_keys_validated() {
        assert!(parse(r#"{"env": {"GOOD_KEY": "v"}}"#).is_ok());
        assert!(parse(r#"{"env": {"1BAD": "v"}}"#).is_err());
        assert!(parse(r#"{"env": {"has-dash": "v"}}"#).is_err());
        assert!(parse(r#"{"env": {"FORCE_COLOR": "1"}}"#).is_err());
        assert!(parse(r#"{"env": {"CLAUDECODE": ""}}"#).is_err());
    }

    #[test]
    fn schedules_validated() {
        let good = r#"{"schedules": [
            {"name": "morning-plan", "cron": "0 9 * * *", "timezone": "America/New_York",
             "prompt": "plan the day", "discord_notify": true}
        ]}"#;
        assert!(parse(good).is_ok());

        let bad_cron = r#"{"schedules": [
            {"name": "x", "cron": "not cron", "timezone": "UTC",
             "prompt": "p", "discord_notify": false}
        ]}"#;
        assert!(parse(bad_cron).is_err());

        let bad_tz = r#"{"schedules": [
            {"name": "x", "cron": "0 9 * * *", "timezone": "Mars/Olympus",
             "prompt": "p", "discord_notify": false}
        ]}"#;
        assert!(parse(bad_tz).is_err());
    }

    #[test]
    fn colliding_session_names_rejected() {
        let colliding = r#"{"schedules": [
            {"name": "a b", "cron": "0 9 * * *", "timezone": "UTC",
             "prompt": "p", "discord_notify": false},
            {"name": "a.b", "cron": "0 10 * * *", "timezone": "UTC",
             "prompt": "p", "discord_notify": false}
        ]}"#;
        assert!(parse(colliding).is_err());
    }

    #[test]
    fn sanitize_replaces_everything_unusual() {
        assert_eq!(sanitize_schedule_name("morning-plan"), "morning-plan");
        assert_eq!(sanitize_schedule_name("a b/c"), "a_b_c");
        assert_eq!(sanitize_schedule_name("日報"), "__");
    }

    #[test]
    fn session_mode_parses() {
        let json = r#"{"schedules": [
            {"name": "x", "cron": "0 9 * * *", "timezone": "UTC", "prompt": "p",
             "discord_notify": false, "session_mode": "isolated"}
        ]}"#;
        let settings = parse(json).unwrap();
        assert_eq!(settings.schedules[0].session_mode, SessionMode::Isolated);
    }
}
