use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub sessions: SessionsConfig,
    pub channels: ChannelsConfig,
    pub auth: AuthConfig,
    pub tools: ToolsConfig,
    pub events: EventsConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct SessionsConfig {
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub busy_policy: BusyPolicy,
    /// Upper bound on invocations waiting behind the in-flight one (queue policy only).
    pub max_queued: usize,
    pub history_limit: usize,
}

#[derive(Clone, Debug)]
pub struct ChannelsConfig {
    pub dedupe_capacity: usize,
    pub outbound_queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub send_max_retries: u32,
    pub send_base_delay_ms: u64,
    pub send_max_delay_ms: u64,
    /// Ingress reconnect budget; reset whenever a connection delivers events.
    pub reconnect_max_retries: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub max_failures: u32,
    pub backoff: BackoffConfig,
    pub wait_for_cooldown: bool,
    pub max_wait_secs: u64,
    pub max_failover_attempts: u32,
    pub profiles: Vec<ProfileConfig>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub multiplier: u32,
    pub max_ms: u64,
}

#[derive(Clone, Debug)]
pub struct ProfileConfig {
    pub id: String,
    pub provider: String,
    pub credential_ref: String,
    pub api_key: Option<SecretString>,
    /// Lower values are tried first.
    pub priority: u32,
}

#[derive(Clone, Debug)]
pub struct ToolsConfig {
    pub default_timeout_ms: u64,
}

#[derive(Clone, Debug)]
pub struct EventsConfig {
    pub subscriber_buffer: usize,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    Queue,
    Reject,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    DropOldest,
    RejectNew,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub store_url: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub idle_timeout_secs: Option<u64>,
    pub busy_policy: Option<BusyPolicy>,
    pub server_port: Option<u16>,
    pub profiles: Option<Vec<ProfileConfig>>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                url: "sqlite://switchboard.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            sessions: SessionsConfig {
                idle_timeout_secs: 1800,
                sweep_interval_secs: 60,
                busy_policy: BusyPolicy::Queue,
                max_queued: 8,
                history_limit: 20,
            },
            channels: ChannelsConfig {
                dedupe_capacity: 1024,
                outbound_queue_capacity: 64,
                overflow: OverflowPolicy::DropOldest,
                send_max_retries: 3,
                send_base_delay_ms: 200,
                send_max_delay_ms: 5_000,
                reconnect_max_retries: 10,
                reconnect_base_delay_ms: 500,
                reconnect_max_delay_ms: 30_000,
            },
            auth: AuthConfig {
                max_failures: 5,
                backoff: BackoffConfig { base_ms: 1_000, multiplier: 2, max_ms: 300_000 },
                wait_for_cooldown: false,
                max_wait_secs: 30,
                max_failover_attempts: 2,
                profiles: Vec::new(),
            },
            tools: ToolsConfig { default_timeout_ms: 30_000 },
            events: EventsConfig { subscriber_buffer: 256 },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl SessionsConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl AuthConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

impl ToolsConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl std::str::FromStr for BusyPolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(Self::Queue),
            "reject" => Ok(Self::Reject),
            other => Err(ConfigError::Validation(format!(
                "unsupported busy policy `{other}` (expected queue|reject)"
            ))),
        }
    }
}

impl std::str::FromStr for OverflowPolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "drop_oldest" => Ok(Self::DropOldest),
            "reject_new" => Ok(Self::RejectNew),
            other => Err(ConfigError::Validation(format!(
                "unsupported overflow policy `{other}` (expected drop_oldest|reject_new)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from("switchboard.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(store) = patch.store {
            if let Some(url) = store.url {
                self.store.url = url;
            }
            if let Some(max_connections) = store.max_connections {
                self.store.max_connections = max_connections;
            }
            if let Some(timeout_secs) = store.timeout_secs {
                self.store.timeout_secs = timeout_secs;
            }
        }

        if let Some(sessions) = patch.sessions {
            if let Some(idle_timeout_secs) = sessions.idle_timeout_secs {
                self.sessions.idle_timeout_secs = idle_timeout_secs;
            }
            if let Some(sweep_interval_secs) = sessions.sweep_interval_secs {
                self.sessions.sweep_interval_secs = sweep_interval_secs;
            }
            if let Some(busy_policy) = sessions.busy_policy {
                self.sessions.busy_policy = busy_policy;
            }
            if let Some(max_queued) = sessions.max_queued {
                self.sessions.max_queued = max_queued;
            }
            if let Some(history_limit) = sessions.history_limit {
                self.sessions.history_limit = history_limit;
            }
        }

        if let Some(channels) = patch.channels {
            if let Some(dedupe_capacity) = channels.dedupe_capacity {
                self.channels.dedupe_capacity = dedupe_capacity;
            }
            if let Some(outbound_queue_capacity) = channels.outbound_queue_capacity {
                self.channels.outbound_queue_capacity = outbound_queue_capacity;
            }
            if let Some(overflow) = channels.overflow {
                self.channels.overflow = overflow;
            }
            if let Some(send_max_retries) = channels.send_max_retries {
                self.channels.send_max_retries = send_max_retries;
            }
            if let Some(send_base_delay_ms) = channels.send_base_delay_ms {
                self.channels.send_base_delay_ms = send_base_delay_ms;
            }
            if let Some(send_max_delay_ms) = channels.send_max_delay_ms {
                self.channels.send_max_delay_ms = send_max_delay_ms;
            }
            if let Some(reconnect_max_retries) = channels.reconnect_max_retries {
                self.channels.reconnect_max_retries = reconnect_max_retries;
            }
            if let Some(reconnect_base_delay_ms) = channels.reconnect_base_delay_ms {
                self.channels.reconnect_base_delay_ms = reconnect_base_delay_ms;
            }
            if let Some(reconnect_max_delay_ms) = channels.reconnect_max_delay_ms {
                self.channels.reconnect_max_delay_ms = reconnect_max_delay_ms;
            }
        }

        if let Some(auth) = patch.auth {
            if let Some(max_failures) = auth.max_failures {
                self.auth.max_failures = max_failures;
            }
            if let Some(backoff) = auth.backoff {
                if let Some(base_ms) = backoff.base_ms {
                    self.auth.backoff.base_ms = base_ms;
                }
                if let Some(multiplier) = backoff.multiplier {
                    self.auth.backoff.multiplier = multiplier;
                }
                if let Some(max_ms) = backoff.max_ms {
                    self.auth.backoff.max_ms = max_ms;
                }
            }
            if let Some(wait_for_cooldown) = auth.wait_for_cooldown {
                self.auth.wait_for_cooldown = wait_for_cooldown;
            }
            if let Some(max_wait_secs) = auth.max_wait_secs {
                self.auth.max_wait_secs = max_wait_secs;
            }
            if let Some(max_failover_attempts) = auth.max_failover_attempts {
                self.auth.max_failover_attempts = max_failover_attempts;
            }
            if let Some(profiles) = auth.profiles {
                self.auth.profiles = profiles.into_iter().map(ProfilePatch::into_config).collect();
            }
        }

        if let Some(tools) = patch.tools {
            if let Some(default_timeout_ms) = tools.default_timeout_ms {
                self.tools.default_timeout_ms = default_timeout_ms;
            }
        }

        if let Some(events) = patch.events {
            if let Some(subscriber_buffer) = events.subscriber_buffer {
                self.events.subscriber_buffer = subscriber_buffer;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("SWITCHBOARD_STORE_URL") {
            self.store.url = value;
        }
        if let Some(value) = read_env("SWITCHBOARD_STORE_MAX_CONNECTIONS") {
            self.store.max_connections = parse_u32("SWITCHBOARD_STORE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_STORE_TIMEOUT_SECS") {
            self.store.timeout_secs = parse_u64("SWITCHBOARD_STORE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("SWITCHBOARD_SESSIONS_IDLE_TIMEOUT_SECS") {
            self.sessions.idle_timeout_secs =
                parse_u64("SWITCHBOARD_SESSIONS_IDLE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_SESSIONS_SWEEP_INTERVAL_SECS") {
            self.sessions.sweep_interval_secs =
                parse_u64("SWITCHBOARD_SESSIONS_SWEEP_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_SESSIONS_BUSY_POLICY") {
            self.sessions.busy_policy = value.parse()?;
        }
        if let Some(value) = read_env("SWITCHBOARD_SESSIONS_MAX_QUEUED") {
            self.sessions.max_queued = parse_usize("SWITCHBOARD_SESSIONS_MAX_QUEUED", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_SESSIONS_HISTORY_LIMIT") {
            self.sessions.history_limit =
                parse_usize("SWITCHBOARD_SESSIONS_HISTORY_LIMIT", &value)?;
        }

        if let Some(value) = read_env("SWITCHBOARD_CHANNELS_DEDUPE_CAPACITY") {
            self.channels.dedupe_capacity =
                parse_usize("SWITCHBOARD_CHANNELS_DEDUPE_CAPACITY", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_CHANNELS_OUTBOUND_QUEUE_CAPACITY") {
            self.channels.outbound_queue_capacity =
                parse_usize("SWITCHBOARD_CHANNELS_OUTBOUND_QUEUE_CAPACITY", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_CHANNELS_OVERFLOW") {
            self.channels.overflow = value.parse()?;
        }
        if let Some(value) = read_env("SWITCHBOARD_CHANNELS_SEND_MAX_RETRIES") {
            self.channels.send_max_retries =
                parse_u32("SWITCHBOARD_CHANNELS_SEND_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_CHANNELS_RECONNECT_MAX_RETRIES") {
            self.channels.reconnect_max_retries =
                parse_u32("SWITCHBOARD_CHANNELS_RECONNECT_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("SWITCHBOARD_AUTH_MAX_FAILURES") {
            self.auth.max_failures = parse_u32("SWITCHBOARD_AUTH_MAX_FAILURES", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_AUTH_BACKOFF_BASE_MS") {
            self.auth.backoff.base_ms = parse_u64("SWITCHBOARD_AUTH_BACKOFF_BASE_MS", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_AUTH_BACKOFF_MULTIPLIER") {
            self.auth.backoff.multiplier =
                parse_u32("SWITCHBOARD_AUTH_BACKOFF_MULTIPLIER", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_AUTH_BACKOFF_MAX_MS") {
            self.auth.backoff.max_ms = parse_u64("SWITCHBOARD_AUTH_BACKOFF_MAX_MS", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_AUTH_WAIT_FOR_COOLDOWN") {
            self.auth.wait_for_cooldown = parse_bool("SWITCHBOARD_AUTH_WAIT_FOR_COOLDOWN", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_AUTH_MAX_WAIT_SECS") {
            self.auth.max_wait_secs = parse_u64("SWITCHBOARD_AUTH_MAX_WAIT_SECS", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_AUTH_MAX_FAILOVER_ATTEMPTS") {
            self.auth.max_failover_attempts =
                parse_u32("SWITCHBOARD_AUTH_MAX_FAILOVER_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_AUTH_PROFILES") {
            self.auth.profiles = parse_profiles("SWITCHBOARD_AUTH_PROFILES", &value)?;
        }

        if let Some(value) = read_env("SWITCHBOARD_TOOLS_DEFAULT_TIMEOUT_MS") {
            self.tools.default_timeout_ms =
                parse_u64("SWITCHBOARD_TOOLS_DEFAULT_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_EVENTS_SUBSCRIBER_BUFFER") {
            self.events.subscriber_buffer =
                parse_usize("SWITCHBOARD_EVENTS_SUBSCRIBER_BUFFER", &value)?;
        }

        if let Some(value) = read_env("SWITCHBOARD_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("SWITCHBOARD_SERVER_PORT") {
            self.server.port = parse_u16("SWITCHBOARD_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("SWITCHBOARD_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("SWITCHBOARD_LOGGING_LEVEL").or_else(|| read_env("SWITCHBOARD_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("SWITCHBOARD_LOGGING_FORMAT").or_else(|| read_env("SWITCHBOARD_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(store_url) = overrides.store_url {
            self.store.url = store_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
        if let Some(idle_timeout_secs) = overrides.idle_timeout_secs {
            self.sessions.idle_timeout_secs = idle_timeout_secs;
        }
        if let Some(busy_policy) = overrides.busy_policy {
            self.sessions.busy_policy = busy_policy;
        }
        if let Some(server_port) = overrides.server_port {
            self.server.port = server_port;
        }
        if let Some(profiles) = overrides.profiles {
            self.auth.profiles = profiles;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_store(&self.store)?;
        validate_sessions(&self.sessions)?;
        validate_channels(&self.channels)?;
        validate_auth(&self.auth)?;
        validate_tools(&self.tools)?;
        validate_events(&self.events)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("switchboard.toml"), PathBuf::from("config/switchboard.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_store(store: &StoreConfig) -> Result<(), ConfigError> {
    let url = store.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "store.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if store.max_connections == 0 {
        return Err(ConfigError::Validation(
            "store.max_connections must be greater than zero".to_string(),
        ));
    }

    if store.timeout_secs == 0 || store.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "store.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_sessions(sessions: &SessionsConfig) -> Result<(), ConfigError> {
    if sessions.idle_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "sessions.idle_timeout_secs must be greater than zero".to_string(),
        ));
    }

    if sessions.sweep_interval_secs == 0 || sessions.sweep_interval_secs > sessions.idle_timeout_secs
    {
        return Err(ConfigError::Validation(
            "sessions.sweep_interval_secs must be in range 1..=sessions.idle_timeout_secs"
                .to_string(),
        ));
    }

    if sessions.busy_policy == BusyPolicy::Queue && sessions.max_queued == 0 {
        return Err(ConfigError::Validation(
            "sessions.max_queued must be greater than zero when busy_policy is `queue` (use `reject` to refuse concurrent messages)"
                .to_string(),
        ));
    }

    Ok(())
}

fn validate_channels(channels: &ChannelsConfig) -> Result<(), ConfigError> {
    if channels.dedupe_capacity == 0 {
        return Err(ConfigError::Validation(
            "channels.dedupe_capacity must be greater than zero".to_string(),
        ));
    }

    if channels.outbound_queue_capacity == 0 {
        return Err(ConfigError::Validation(
            "channels.outbound_queue_capacity must be greater than zero".to_string(),
        ));
    }

    if channels.send_base_delay_ms > channels.send_max_delay_ms {
        return Err(ConfigError::Validation(
            "channels.send_base_delay_ms must not exceed channels.send_max_delay_ms".to_string(),
        ));
    }

    if channels.reconnect_base_delay_ms > channels.reconnect_max_delay_ms {
        return Err(ConfigError::Validation(
            "channels.reconnect_base_delay_ms must not exceed channels.reconnect_max_delay_ms"
                .to_string(),
        ));
    }

    Ok(())
}

fn validate_auth(auth: &AuthConfig) -> Result<(), ConfigError> {
    if auth.max_failures == 0 {
        return Err(ConfigError::Validation(
            "auth.max_failures must be greater than zero".to_string(),
        ));
    }

    if auth.backoff.base_ms == 0 || auth.backoff.base_ms > auth.backoff.max_ms {
        return Err(ConfigError::Validation(
            "auth.backoff.base_ms must be in range 1..=auth.backoff.max_ms".to_string(),
        ));
    }

    if auth.backoff.multiplier < 2 {
        return Err(ConfigError::Validation(
            "auth.backoff.multiplier must be at least 2 so every failure lengthens the cooldown"
                .to_string(),
        ));
    }

    if auth.wait_for_cooldown && auth.max_wait_secs == 0 {
        return Err(ConfigError::Validation(
            "auth.max_wait_secs must be greater than zero when auth.wait_for_cooldown is true"
                .to_string(),
        ));
    }

    if auth.profiles.is_empty() {
        return Err(ConfigError::Validation(
            "at least one [[auth.profiles]] entry is required (or set SWITCHBOARD_AUTH_PROFILES=id:provider:credential_ref[:priority],...)"
                .to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for profile in &auth.profiles {
        if profile.id.trim().is_empty() {
            return Err(ConfigError::Validation("auth.profiles[].id must not be empty".to_string()));
        }
        if !seen.insert(profile.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "auth.profiles[].id `{}` is declared more than once",
                profile.id
            )));
        }
        if profile.provider.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "auth.profiles[`{}`].provider must not be empty",
                profile.id
            )));
        }
        let has_inline_key =
            profile.api_key.as_ref().is_some_and(|key| !key.expose_secret().trim().is_empty());
        if profile.credential_ref.trim().is_empty() && !has_inline_key {
            return Err(ConfigError::Validation(format!(
                "auth.profiles[`{}`] needs a credential_ref or an api_key",
                profile.id
            )));
        }
    }

    Ok(())
}

fn validate_tools(tools: &ToolsConfig) -> Result<(), ConfigError> {
    if tools.default_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "tools.default_timeout_ms must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_events(events: &EventsConfig) -> Result<(), ConfigError> {
    if events.subscriber_buffer == 0 {
        return Err(ConfigError::Validation(
            "events.subscriber_buffer must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| invalid_override(key, value))
}

/// `id:provider:credential_ref[:priority]`, comma separated.
fn parse_profiles(key: &str, value: &str) -> Result<Vec<ProfileConfig>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let fields: Vec<&str> = entry.split(':').map(str::trim).collect();
            let (id, provider, credential_ref, priority) = match fields.as_slice() {
                [id, provider, credential_ref] => (*id, *provider, *credential_ref, 0),
                [id, provider, credential_ref, priority] => {
                    let priority =
                        priority.parse::<u32>().map_err(|_| invalid_override(key, entry))?;
                    (*id, *provider, *credential_ref, priority)
                }
                _ => return Err(invalid_override(key, entry)),
            };
            Ok(ProfileConfig {
                id: id.to_string(),
                provider: provider.to_string(),
                credential_ref: credential_ref.to_string(),
                api_key: None,
                priority,
            })
        })
        .collect()
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    store: Option<StorePatch>,
    sessions: Option<SessionsPatch>,
    channels: Option<ChannelsPatch>,
    auth: Option<AuthPatch>,
    tools: Option<ToolsPatch>,
    events: Option<EventsPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct StorePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionsPatch {
    idle_timeout_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    busy_policy: Option<BusyPolicy>,
    max_queued: Option<usize>,
    history_limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ChannelsPatch {
    dedupe_capacity: Option<usize>,
    outbound_queue_capacity: Option<usize>,
    overflow: Option<OverflowPolicy>,
    send_max_retries: Option<u32>,
    send_base_delay_ms: Option<u64>,
    send_max_delay_ms: Option<u64>,
    reconnect_max_retries: Option<u32>,
    reconnect_base_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthPatch {
    max_failures: Option<u32>,
    backoff: Option<BackoffPatch>,
    wait_for_cooldown: Option<bool>,
    max_wait_secs: Option<u64>,
    max_failover_attempts: Option<u32>,
    profiles: Option<Vec<ProfilePatch>>,
}

#[derive(Debug, Default, Deserialize)]
struct BackoffPatch {
    base_ms: Option<u64>,
    multiplier: Option<u32>,
    max_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ProfilePatch {
    id: String,
    provider: String,
    #[serde(default)]
    credential_ref: String,
    api_key: Option<String>,
    #[serde(default)]
    priority: u32,
}

impl ProfilePatch {
    fn into_config(self) -> ProfileConfig {
        ProfileConfig {
            id: self.id,
            provider: self.provider,
            credential_ref: self.credential_ref,
            api_key: self.api_key.map(SecretString::from),
            priority: self.priority,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ToolsPatch {
    default_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EventsPatch {
    subscriber_buffer: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
