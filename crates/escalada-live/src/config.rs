use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::LiveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Files,
    Sqlite,
}

impl FromStr for StorageBackend {
    type Err = LiveError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "files" | "json" | "fs" => Ok(StorageBackend::Files),
            "sqlite" | "db" => Ok(StorageBackend::Sqlite),
            other => Err(LiveError::Config(format!("unknown storage backend '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root of the file backend: `boxes/`, `events.ndjson`, `settings.json`.
    pub dir: PathBuf,
    pub sqlite_path: PathBuf,
    pub max_audit_file_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Files,
            dir: PathBuf::from("data"),
            sqlite_path: PathBuf::from("data/escalada.db"),
            max_audit_file_bytes: 50 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// `None` disables the periodic task; on-demand backups still work.
    pub interval: Option<Duration>,
    pub retention_files: usize,
    pub dir: PathBuf,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            interval: Some(Duration::from_secs(10 * 60)),
            retention_files: 20,
            dir: PathBuf::from("backups"),
        }
    }
}

/// What a rate-limit budget is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateKeyScope {
    Box,
    BoxSession,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_per_second: usize,
    pub max_per_minute: usize,
    pub block: Duration,
    pub cleanup_interval: Duration,
    /// Per-command-type budgets over a one minute window.
    pub command_limits: HashMap<String, usize>,
    pub key_scope: RateKeyScope,
    /// Write an audit record for throttled commands.
    pub audit_throttled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let command_limits = [
            ("PROGRESS_UPDATE", 120),
            ("INIT_ROUTE", 10),
            ("SUBMIT_SCORE", 30),
            ("REGISTER_TIME", 300),
        ]
        .into_iter()
        .map(|(name, limit)| (name.to_string(), limit))
        .collect();
        Self {
            enabled: true,
            max_per_second: 20,
            max_per_minute: 300,
            block: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(5 * 60),
            command_limits,
            key_scope: RateKeyScope::Box,
            audit_throttled: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Outbound messages buffered per connection before sends start failing.
    pub queue_capacity: usize,
    /// Consecutive failed sends after which a connection is dropped.
    pub max_send_failures: u32,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            max_send_failures: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub storage: StorageConfig,
    /// Drop persisted box states before loading the registry. Audit and
    /// settings survive.
    pub reset_boxes_on_start: bool,
    pub backup: BackupConfig,
    pub rate_limit: RateLimitConfig,
    pub heartbeat: HeartbeatConfig,
    pub broadcast: BroadcastConfig,
    pub http_bind: SocketAddr,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            reset_boxes_on_start: true,
            backup: BackupConfig::default(),
            rate_limit: RateLimitConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            broadcast: BroadcastConfig::default(),
            http_bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
        }
    }
}

impl LiveConfig {
    /// Build from process environment; errors only on malformed values.
    pub fn from_env() -> Result<Self, LiveError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, LiveError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut cfg = Self::default();

        if let Some(raw) = get("STORAGE_BACKEND") {
            cfg.storage.backend = raw.parse()?;
        }
        if let Some(raw) = get("STORAGE_DIR") {
            cfg.storage.dir = PathBuf::from(raw);
            cfg.storage.sqlite_path = cfg.storage.dir.join("escalada.db");
        }
        if let Some(raw) = get("SQLITE_PATH") {
            cfg.storage.sqlite_path = PathBuf::from(raw);
        }
        if let Some(mb) = parse::<u64>(&get, "MAX_AUDIT_FILE_SIZE_MB")? {
            cfg.storage.max_audit_file_bytes = mb.max(1) * 1024 * 1024;
        }
        if let Some(raw) = get("RESET_BOXES_ON_START") {
            cfg.reset_boxes_on_start = parse_flag(&raw);
        }

        if let Some(minutes) = parse::<u64>(&get, "BACKUP_INTERVAL_MIN")? {
            cfg.backup.interval = (minutes > 0).then(|| Duration::from_secs(minutes * 60));
        }
        if let Some(files) = parse::<usize>(&get, "BACKUP_RETENTION_FILES")? {
            cfg.backup.retention_files = files.max(1);
        }
        if let Some(raw) = get("BACKUP_DIR") {
            cfg.backup.dir = PathBuf::from(raw);
        }

        if let Some(raw) = get("RATE_LIMIT_ENABLED") {
            cfg.rate_limit.enabled = parse_flag(&raw);
        }
        if let Some(n) = parse::<usize>(&get, "RATE_LIMIT_PER_SECOND")? {
            cfg.rate_limit.max_per_second = n;
        }
        if let Some(n) = parse::<usize>(&get, "RATE_LIMIT_PER_MINUTE")? {
            cfg.rate_limit.max_per_minute = n;
        }
        if let Some(secs) = parse::<u64>(&get, "RATE_LIMIT_BLOCK_SEC")? {
            cfg.rate_limit.block = Duration::from_secs(secs);
        }
        if let Some(minutes) = parse::<u64>(&get, "RATE_LIMIT_CLEANUP_INTERVAL_MIN")? {
            cfg.rate_limit.cleanup_interval = Duration::from_secs(minutes.max(1) * 60);
        }
        if let Some(raw) = get("RATE_LIMIT_SCOPE") {
            cfg.rate_limit.key_scope = match raw.trim().to_ascii_lowercase().as_str() {
                "box" => RateKeyScope::Box,
                "session" | "box_session" => RateKeyScope::BoxSession,
                other => {
                    return Err(LiveError::Config(format!(
                        "RATE_LIMIT_SCOPE: unknown scope '{other}'"
                    )));
                }
            };
        }
        if let Some(raw) = get("AUDIT_THROTTLED") {
            cfg.rate_limit.audit_throttled = parse_flag(&raw);
        }

        if let Some(secs) = parse::<u64>(&get, "HEARTBEAT_INTERVAL_SEC")? {
            cfg.heartbeat.interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse::<u64>(&get, "HEARTBEAT_TIMEOUT_SEC")? {
            cfg.heartbeat.timeout = Duration::from_secs(secs.max(1));
        }

        if let Some(bind) = parse::<SocketAddr>(&get, "HTTP_BIND")? {
            cfg.http_bind = bind;
        }
        Ok(cfg)
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, LiveError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| LiveError::Config(format!("{key}={raw}: {e}")))
        })
        .transpose()
}

/// Anything other than an explicit "off" value counts as enabled.
fn parse_flag(raw: &str) -> bool {
    !matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "n" | "off"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = LiveConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.storage.backend, StorageBackend::Files);
        assert!(cfg.reset_boxes_on_start);
        assert_eq!(cfg.backup.interval, Some(Duration::from_secs(600)));
        assert_eq!(cfg.backup.retention_files, 20);
        assert_eq!(cfg.rate_limit.max_per_second, 20);
        assert_eq!(cfg.rate_limit.max_per_minute, 300);
        assert_eq!(cfg.rate_limit.command_limits.get("INIT_ROUTE"), Some(&10));
        assert_eq!(cfg.storage.max_audit_file_bytes, 50 * 1024 * 1024);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = LiveConfig::from_lookup(lookup(&[
            ("STORAGE_BACKEND", "sqlite"),
            ("STORAGE_DIR", "/srv/live"),
            ("RESET_BOXES_ON_START", "off"),
            ("BACKUP_INTERVAL_MIN", "0"),
            ("RATE_LIMIT_SCOPE", "session"),
            ("AUDIT_THROTTLED", "1"),
            ("HTTP_BIND", "0.0.0.0:9000"),
        ]))
        .unwrap();
        assert_eq!(cfg.storage.backend, StorageBackend::Sqlite);
        assert_eq!(cfg.storage.sqlite_path, PathBuf::from("/srv/live/escalada.db"));
        assert!(!cfg.reset_boxes_on_start);
        assert_eq!(cfg.backup.interval, None);
        assert_eq!(cfg.rate_limit.key_scope, RateKeyScope::BoxSession);
        assert!(cfg.rate_limit.audit_throttled);
        assert_eq!(cfg.http_bind.port(), 9000);
    }

    #[test]
    fn malformed_number_is_an_error() {
        let err = LiveConfig::from_lookup(lookup(&[("RATE_LIMIT_PER_SECOND", "many")]))
            .expect_err("should fail");
        assert!(matches!(err, LiveError::Config(msg) if msg.contains("RATE_LIMIT_PER_SECOND")));
    }
}
