//! Process configuration loaded from a TOML file.
//!
//! Durations are written as strings (`"10s"`, `"5m"`, `"30d"`); paths are
//! normalized to end with `/` the way the artifact writers expect.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::convert::parse_duration;

fn de_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let s = String::deserialize(d)?;
    parse_duration(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {s}")))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub frs: FrsLocalConfig,
    #[serde(default)]
    pub lprs: LprsLocalConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Config {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Config =
            toml::from_str(&text).map_err(|e| crate::Error::internal(format!("config: {e}")))?;
        config.frs.normalize_paths();
        config.lprs.normalize_paths();
        Ok(config)
    }

    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let mut error = |message: String| {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message,
            })
        };
        if self.database.frs_url.is_empty() {
            error("database.frs-url must be set".into());
        }
        if self.database.lprs_url.is_empty() {
            error("database.lprs-url must be set".into());
        }
        if self.frs.screenshots_path.is_empty() {
            error("frs.screenshots-path must be set".into());
        }
        if self.lprs.screenshots_path.is_empty() {
            error("lprs.screenshots-path must be set".into());
        }
        if self.frs.events_path.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "frs.events-path is empty; copy-events maintenance will be idle".into(),
            });
        }
        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server & database
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DatabaseConfig {
    /// Postgres DSN for the face recognition schema.
    #[serde(default, rename = "frs-url")]
    pub frs_url: String,
    /// Postgres DSN for the license plate recognition schema.
    #[serde(default, rename = "lprs-url")]
    pub lprs_url: String,
    #[serde(default = "d_pool", rename = "max-connections")]
    pub max_connections: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FRS local section
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FrsLocalConfig {
    /// Tenant id granted to unauthenticated calls; `<= 0` disables the grant.
    #[serde(default = "d_one")]
    pub allow_group_id_without_auth: i32,
    #[serde(default)]
    pub screenshots_path: String,
    #[serde(default)]
    pub screenshots_url_prefix: String,
    #[serde(default)]
    pub events_path: String,
    /// Font used for the on-screen datetime/title overlay; OSD is disabled
    /// with a warning when the file is missing.
    #[serde(default = "d_font")]
    pub osd_font_path: String,
    #[serde(default = "d_1h", deserialize_with = "de_duration")]
    pub clear_old_log_faces: Duration,
    #[serde(default = "d_10s", deserialize_with = "de_duration")]
    pub flag_deleted_maintenance_interval: Duration,
    #[serde(default = "d_5m", deserialize_with = "de_duration")]
    pub flag_deleted_ttl: Duration,
    #[serde(default = "d_30s", deserialize_with = "de_duration")]
    pub copy_events_maintenance_interval: Duration,
    #[serde(default = "d_1d", deserialize_with = "de_duration")]
    pub clear_old_events: Duration,
    #[serde(default = "d_4h", deserialize_with = "de_duration")]
    pub log_faces_ttl: Duration,
    #[serde(default = "d_30d", deserialize_with = "de_duration")]
    pub events_ttl: Duration,
    #[serde(default = "d_1s", deserialize_with = "de_duration")]
    pub cache_update_interval: Duration,
}

impl Default for FrsLocalConfig {
    fn default() -> Self {
        Self {
            allow_group_id_without_auth: 1,
            screenshots_path: String::new(),
            screenshots_url_prefix: String::new(),
            events_path: String::new(),
            osd_font_path: d_font(),
            clear_old_log_faces: d_1h(),
            flag_deleted_maintenance_interval: d_10s(),
            flag_deleted_ttl: d_5m(),
            copy_events_maintenance_interval: d_30s(),
            clear_old_events: d_1d(),
            log_faces_ttl: d_4h(),
            events_ttl: d_30d(),
            cache_update_interval: d_1s(),
        }
    }
}

impl FrsLocalConfig {
    fn normalize_paths(&mut self) {
        for p in [
            &mut self.screenshots_path,
            &mut self.screenshots_url_prefix,
            &mut self.events_path,
        ] {
            if !p.is_empty() && !p.ends_with('/') {
                p.push('/');
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LPRS local section
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LprsLocalConfig {
    #[serde(default = "d_one")]
    pub allow_group_id_without_auth: i32,
    #[serde(default)]
    pub screenshots_path: String,
    #[serde(default)]
    pub screenshots_url_prefix: String,
    /// Where frames with detected but unrecognized plates are kept.
    #[serde(default)]
    pub failed_path: String,
    #[serde(default = "d_5s", deserialize_with = "de_duration")]
    pub ban_maintenance_interval: Duration,
    #[serde(default = "d_2h", deserialize_with = "de_duration")]
    pub events_log_maintenance_interval: Duration,
    #[serde(default = "d_4h", deserialize_with = "de_duration")]
    pub events_log_ttl: Duration,
    #[serde(default = "d_60d", deserialize_with = "de_duration")]
    pub failed_ttl: Duration,
    #[serde(default = "d_1s", deserialize_with = "de_duration")]
    pub cache_update_interval: Duration,
}

impl Default for LprsLocalConfig {
    fn default() -> Self {
        Self {
            allow_group_id_without_auth: 1,
            screenshots_path: String::new(),
            screenshots_url_prefix: String::new(),
            failed_path: String::new(),
            ban_maintenance_interval: d_5s(),
            events_log_maintenance_interval: d_2h(),
            events_log_ttl: d_4h(),
            failed_ttl: d_60d(),
            cache_update_interval: d_1s(),
        }
    }
}

impl LprsLocalConfig {
    fn normalize_paths(&mut self) {
        for p in [
            &mut self.screenshots_path,
            &mut self.screenshots_url_prefix,
            &mut self.failed_path,
        ] {
            if !p.is_empty() && !p.ends_with('/') {
                p.push('/');
            }
        }
    }
}

fn d_host() -> String {
    "0.0.0.0".into()
}
fn d_port() -> u16 {
    9051
}
fn d_pool() -> u32 {
    8
}
fn d_one() -> i32 {
    1
}
fn d_font() -> String {
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf".into()
}
fn d_1s() -> Duration {
    Duration::from_secs(1)
}
fn d_5s() -> Duration {
    Duration::from_secs(5)
}
fn d_10s() -> Duration {
    Duration::from_secs(10)
}
fn d_30s() -> Duration {
    Duration::from_secs(30)
}
fn d_5m() -> Duration {
    Duration::from_secs(300)
}
fn d_1h() -> Duration {
    Duration::from_secs(3_600)
}
fn d_2h() -> Duration {
    Duration::from_secs(7_200)
}
fn d_4h() -> Duration {
    Duration::from_secs(14_400)
}
fn d_1d() -> Duration {
    Duration::from_secs(86_400)
}
fn d_30d() -> Duration {
    Duration::from_secs(30 * 86_400)
}
fn d_60d() -> Duration {
    Duration::from_secs(60 * 86_400)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let toml = r#"
            [server]
            host = "127.0.0.1"
            port = 9052

            [database]
            frs-url = "postgres://frs@localhost/frs"
            lprs-url = "postgres://lprs@localhost/lprs"

            [frs]
            screenshots-path = "/var/lib/faceplate/frs/screenshots"
            screenshots-url-prefix = "http://localhost:9051/frs/screenshots"
            events-path = "/var/lib/faceplate/frs/events"
            log-faces-ttl = "4h"
            flag-deleted-ttl = "5m"

            [lprs]
            screenshots-path = "/var/lib/faceplate/lprs/screenshots"
            failed-path = "/var/lib/faceplate/lprs/failed"
            events-log-ttl = "4h"
        "#;
        let mut config: Config = toml::from_str(toml).unwrap();
        config.frs.normalize_paths();
        config.lprs.normalize_paths();

        assert_eq!(config.server.port, 9052);
        assert!(config.frs.screenshots_path.ends_with('/'));
        assert!(config.lprs.failed_path.ends_with('/'));
        assert_eq!(config.frs.log_faces_ttl, Duration::from_secs(14_400));
        assert!(config.validate().is_empty());
    }

    #[test]
    fn defaults_fail_validation() {
        let config = Config::default();
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("frs-url")));
    }
}
