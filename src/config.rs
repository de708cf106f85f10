use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEV_JWT_SECRET: &str = "devsecret";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub backbone: BackboneConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_bind")]
    pub bind: String,
    #[serde(default)]
    pub http_bind: Option<String>,
    #[serde(default = "default_server_path")]
    pub path: String,
    #[serde(default = "default_send_buffer_size")]
    pub send_buffer_size: usize,
    #[serde(default = "default_write_wait_ms")]
    pub write_wait_ms: u64,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_server_bind(),
            http_bind: None,
            path: default_server_path(),
            send_buffer_size: default_send_buffer_size(),
            write_wait_ms: default_write_wait_ms(),
            max_message_bytes: default_max_message_bytes(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    #[serde(default)]
    pub jwt_issuer: String,
    #[serde(default)]
    pub jwt_audience: String,
    #[serde(default = "default_jwt_leeway_secs")]
    pub jwt_leeway_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            jwt_issuer: String::new(),
            jwt_audience: String::new(),
            jwt_leeway_secs: default_jwt_leeway_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackboneConfig {
    #[serde(default = "default_backbone_kind")]
    pub kind: BackboneKind,
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_group_mode")]
    pub group_mode: GroupMode,
    #[serde(default = "default_partitions")]
    pub partitions: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            kind: default_backbone_kind(),
            brokers: default_brokers(),
            topic: default_topic(),
            group: default_group(),
            group_mode: default_group_mode(),
            partitions: default_partitions(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackboneKind {
    Memory,
    Kafka,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupMode {
    Shared,
    PerInstance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl ServerConfig {
    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl AuthConfig {
    pub fn leeway(&self) -> Duration {
        Duration::from_secs(self.jwt_leeway_secs)
    }
}

impl BackboneConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    #[cfg_attr(not(feature = "kafka"), allow(dead_code))]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(path)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// File contents over defaults, without environment overrides or
    /// validation. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config file {}", path.display()))?;
        toml::from_str::<Config>(&text)
            .with_context(|| format!("failed parsing TOML config {}", path.display()))
    }

    pub fn apply_cli_overrides(&mut self, bind: Option<&str>, log_format: Option<LogFormat>) {
        if let Some(bind) = bind {
            self.server.bind = bind.to_owned();
        }
        if let Some(format) = log_format {
            self.log.format = format;
        }
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| env::var(key).ok());
    }

    /// Applies overrides read through `lookup`. Unset keys keep the current
    /// value; unparsable ones are logged and skipped.
    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let value = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = value("HTTP_ADDR") {
            self.server.bind = normalize_bind(&v);
        }
        if let Some(v) = lookup("WSRELAY_HTTP_BIND") {
            let trimmed = v.trim();
            self.server.http_bind = if trimmed.is_empty() {
                None
            } else {
                Some(normalize_bind(trimmed))
            };
        }
        if let Some(v) = value("WSRELAY_PATH") {
            self.server.path = v;
        }
        if let Some(v) = value("WSRELAY_SEND_BUFFER_SIZE") {
            match v.parse::<usize>() {
                Ok(n) => self.server.send_buffer_size = n.max(1),
                Err(err) => warn!("invalid WSRELAY_SEND_BUFFER_SIZE {v:?}: {err}"),
            }
        }
        if let Some(v) = value("WSRELAY_WRITE_WAIT") {
            override_millis("WSRELAY_WRITE_WAIT", &v, &mut self.server.write_wait_ms);
        }
        if let Some(v) = value("WSRELAY_MAX_MESSAGE_BYTES") {
            match v.parse::<usize>() {
                Ok(n) if n > 0 => self.server.max_message_bytes = n,
                _ => warn!(
                    "invalid WSRELAY_MAX_MESSAGE_BYTES {v:?}, keeping {}",
                    self.server.max_message_bytes
                ),
            }
        }
        if let Some(v) = value("WSRELAY_DRAIN_TIMEOUT") {
            override_millis("WSRELAY_DRAIN_TIMEOUT", &v, &mut self.server.drain_timeout_ms);
        }
        if let Some(v) = value("JWT_SECRET") {
            self.auth.jwt_secret = v;
        }
        if let Some(v) = lookup("JWT_ISSUER") {
            self.auth.jwt_issuer = v.trim().to_owned();
        }
        if let Some(v) = lookup("JWT_AUDIENCE") {
            self.auth.jwt_audience = v.trim().to_owned();
        }
        if let Some(v) = value("JWT_LEEWAY") {
            match parse_duration(&v) {
                Some(d) => self.auth.jwt_leeway_secs = d.as_secs(),
                None => warn!(
                    "invalid duration for JWT_LEEWAY: {v:?}, using default {}s",
                    self.auth.jwt_leeway_secs
                ),
            }
        }
        if let Some(v) = value("WSRELAY_BACKBONE") {
            match parse_backbone_kind(&v) {
                Some(kind) => self.backbone.kind = kind,
                None => warn!("unknown WSRELAY_BACKBONE {v:?}, keeping {:?}", self.backbone.kind),
            }
        }
        if let Some(v) = value("KAFKA_BROKERS") {
            let brokers = split_csv(&v);
            if !brokers.is_empty() {
                self.backbone.brokers = brokers;
            }
        }
        if let Some(v) = value("KAFKA_TOPIC") {
            self.backbone.topic = v;
        }
        if let Some(v) = value("KAFKA_GROUP") {
            self.backbone.group = v;
        }
        if let Some(v) = value("WSRELAY_GROUP_MODE") {
            match parse_group_mode(&v) {
                Some(mode) => self.backbone.group_mode = mode,
                None => warn!(
                    "unknown WSRELAY_GROUP_MODE {v:?}, keeping {:?}",
                    self.backbone.group_mode
                ),
            }
        }
        if let Some(v) = value("WSRELAY_PARTITIONS") {
            match v.parse::<usize>() {
                Ok(n) if n > 0 => self.backbone.partitions = n,
                _ => warn!(
                    "invalid WSRELAY_PARTITIONS {v:?}, keeping {}",
                    self.backbone.partitions
                ),
            }
        }
        if let Some(v) = value("WSRELAY_MAX_RETRIES") {
            match v.parse::<u32>() {
                Ok(n) => self.backbone.max_retries = n,
                Err(err) => warn!(
                    "invalid WSRELAY_MAX_RETRIES {v:?}: {err}, keeping {}",
                    self.backbone.max_retries
                ),
            }
        }
        if let Some(v) = value("WSRELAY_RETRY_BACKOFF") {
            override_millis("WSRELAY_RETRY_BACKOFF", &v, &mut self.backbone.retry_backoff_ms);
        }
        if let Some(v) = value("WSRELAY_SEND_TIMEOUT") {
            override_millis("WSRELAY_SEND_TIMEOUT", &v, &mut self.backbone.send_timeout_ms);
        }
        if let Some(v) = value("WSRELAY_LOG_FORMAT") {
            match parse_log_format(&v) {
                Some(format) => self.log.format = format,
                None => warn!("unknown WSRELAY_LOG_FORMAT {v:?}, keeping {:?}", self.log.format),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.bind.trim().is_empty() {
            anyhow::bail!("server.bind must not be empty");
        }
        if self
            .server
            .http_bind
            .as_deref()
            .is_some_and(|bind| bind.trim().is_empty())
        {
            anyhow::bail!("server.http_bind must not be empty when provided");
        }
        if !self.server.path.starts_with('/') {
            anyhow::bail!("server.path must start with '/'");
        }
        if self.server.send_buffer_size == 0 {
            anyhow::bail!("server.send_buffer_size must be > 0");
        }
        if self.server.write_wait_ms == 0 {
            anyhow::bail!("server.write_wait_ms must be > 0");
        }
        if self.server.max_message_bytes == 0 {
            anyhow::bail!("server.max_message_bytes must be > 0");
        }
        if self.auth.jwt_secret.is_empty() {
            anyhow::bail!("auth.jwt_secret must not be empty");
        }
        if self.backbone.topic.trim().is_empty() {
            anyhow::bail!("backbone.topic must not be empty");
        }
        if self.backbone.group.trim().is_empty() {
            anyhow::bail!("backbone.group must not be empty");
        }
        if self.backbone.partitions == 0 {
            anyhow::bail!("backbone.partitions must be > 0");
        }
        if self.backbone.kind == BackboneKind::Kafka && self.backbone.brokers.is_empty() {
            anyhow::bail!("backbone.kind=kafka requires backbone.brokers or KAFKA_BROKERS");
        }
        Ok(())
    }
}

fn override_millis(key: &str, raw: &str, slot: &mut u64) {
    match parse_duration(raw) {
        Some(d) => *slot = d.as_millis() as u64,
        None => warn!("invalid duration for {key}: {raw:?}, keeping {}ms", *slot),
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

/// `:8080` listens on every interface.
fn normalize_bind(bind: &str) -> String {
    let bind = bind.trim();
    if bind.starts_with(':') {
        format!("0.0.0.0{bind}")
    } else {
        bind.to_owned()
    }
}

pub fn split_csv(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Accepts `250ms`, `5s`, `2m`, `1h` or bare seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|ch: char| !ch.is_ascii_digit() && ch != '.')
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value = number.parse::<f64>().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let secs = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1_000.0,
        "m" => value * 60.0,
        "h" => value * 3_600.0,
        _ => return None,
    };
    Some(Duration::from_secs_f64(secs))
}

fn parse_backbone_kind(s: &str) -> Option<BackboneKind> {
    match s.trim().to_ascii_lowercase().as_str() {
        "memory" | "in-process" | "inprocess" => Some(BackboneKind::Memory),
        "kafka" => Some(BackboneKind::Kafka),
        _ => None,
    }
}

fn parse_group_mode(s: &str) -> Option<GroupMode> {
    match s.trim().to_ascii_lowercase().as_str() {
        "shared" => Some(GroupMode::Shared),
        "per_instance" | "per-instance" | "broadcast" => Some(GroupMode::PerInstance),
        _ => None,
    }
}

pub fn log_format_from_env() -> Option<LogFormat> {
    env_value("WSRELAY_LOG_FORMAT").and_then(|v| parse_log_format(&v))
}

pub fn parse_log_format(s: &str) -> Option<LogFormat> {
    match s.trim().to_ascii_lowercase().as_str() {
        "text" | "plain" | "pretty" => Some(LogFormat::Text),
        "json" => Some(LogFormat::Json),
        _ => None,
    }
}

fn default_server_bind() -> String {
    "0.0.0.0:8080".to_owned()
}

fn default_server_path() -> String {
    "/ws".to_owned()
}

fn default_send_buffer_size() -> usize {
    16
}

fn default_write_wait_ms() -> u64 {
    5_000
}

fn default_max_message_bytes() -> usize {
    1024 * 1024
}

fn default_drain_timeout_ms() -> u64 {
    5_000
}

fn default_jwt_secret() -> String {
    DEV_JWT_SECRET.to_owned()
}

fn default_jwt_leeway_secs() -> u64 {
    5
}

fn default_backbone_kind() -> BackboneKind {
    BackboneKind::Memory
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_owned()]
}

fn default_topic() -> String {
    "ws-messages".to_owned()
}

fn default_group() -> String {
    "ws-dispatcher".to_owned()
}

fn default_group_mode() -> GroupMode {
    GroupMode::Shared
}

fn default_partitions() -> usize {
    8
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_send_timeout_ms() -> u64 {
    10_000
}
