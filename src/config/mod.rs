use anyhow::{Context, Result};
use chrono::{FixedOffset, NaiveTime};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub counter: CounterConfig,
    #[serde(default)]
    pub flush: FlushConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    /// Prefix prepended to every counter key. Must end with ':'.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

pub fn default_key_prefix() -> String {
    "wc:".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(rename = "type", default = "default_database_type")]
    pub database_type: String,
    /// SQLite database file. Ignored for postgres.
    #[serde(default = "default_database_path")]
    pub path: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_type: default_database_type(),
            path: default_database_path(),
            host: None,
            port: None,
            database: None,
            user: None,
            password: None,
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseConfig {
    /// Connect options for the postgres pool. Credentials are passed as-is,
    /// never through a URL, so they need no escaping.
    pub fn postgres_options(&self) -> Option<PgConnectOptions> {
        Some(
            PgConnectOptions::new()
                .host(self.host.as_deref()?)
                .port(self.port.unwrap_or(5432))
                .username(self.user.as_deref()?)
                .password(self.password.as_deref()?)
                .database(self.database.as_deref()?),
        )
    }
}

fn default_database_type() -> String {
    "sqlite".to_string()
}

fn default_database_path() -> String {
    "webcounter.db".to_string()
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AuthConfig {
    /// Shared secret for request signatures.
    /// Can also be set via WEBCOUNTER__AUTH__HMAC_SECRET.
    pub hmac_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CounterConfig {
    #[serde(default = "default_online_window_secs")]
    pub online_window_secs: u64,
    /// Fixed UTC offset used for day buckets, e.g. "+07:00".
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
    /// How long a day bucket survives past the end of its day.
    #[serde(default = "default_day_key_margin_secs")]
    pub day_key_margin_secs: u64,
    /// Optional bound on the visit cookie lifetime. Unset means a session cookie.
    pub visit_token_max_age_secs: Option<u64>,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            online_window_secs: default_online_window_secs(),
            utc_offset: default_utc_offset(),
            day_key_margin_secs: default_day_key_margin_secs(),
            visit_token_max_age_secs: None,
        }
    }
}

impl CounterConfig {
    pub fn offset(&self) -> Result<FixedOffset> {
        parse_utc_offset(&self.utc_offset)
    }
}

fn default_online_window_secs() -> u64 {
    60
}

fn default_utc_offset() -> String {
    "+00:00".to_string()
}

fn default_day_key_margin_secs() -> u64 {
    2 * 86_400
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlushConfig {
    /// Run the daily flush from inside the server process.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Local time of day ("HH:MM") at which the daily flush fires.
    #[serde(default = "default_flush_at")]
    pub at: String,
    /// Number of sites reconciled concurrently.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            at: default_flush_at(),
            parallelism: default_parallelism(),
            lock_ttl_secs: default_lock_ttl_secs(),
        }
    }
}

impl FlushConfig {
    pub fn time_of_day(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.at, "%H:%M")
            .with_context(|| format!("Invalid flush time '{}', expected HH:MM", self.at))
    }
}

fn default_true() -> bool {
    true
}

fn default_flush_at() -> String {
    "00:05".to_string()
}

fn default_parallelism() -> usize {
    4
}

fn default_lock_ttl_secs() -> u64 {
    600
}

/// Parse a fixed offset of the form `+HH:MM`, `-HH:MM` or `Z`.
pub fn parse_utc_offset(s: &str) -> Result<FixedOffset> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("z") || s.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).context("Invalid UTC offset");
    }

    let (sign, rest) = if let Some(rest) = s.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = s.strip_prefix('-') {
        (-1, rest)
    } else {
        anyhow::bail!("Invalid UTC offset '{}', expected +HH:MM", s);
    };
    let (hours, minutes) = rest
        .split_once(':')
        .with_context(|| format!("Invalid UTC offset '{}', expected +HH:MM", s))?;
    let hours: i32 = hours
        .parse()
        .with_context(|| format!("Invalid UTC offset hours in '{}'", s))?;
    let minutes: i32 = minutes
        .parse()
        .with_context(|| format!("Invalid UTC offset minutes in '{}'", s))?;
    if !(0..=23).contains(&hours) || !(0..=59).contains(&minutes) {
        anyhow::bail!("UTC offset '{}' out of range", s);
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .with_context(|| format!("UTC offset '{}' out of range", s))
}

impl AppConfig {
    /// Load configuration from an optional file and environment variables
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Example: WEBCOUNTER__SERVER__PORT=8080
        builder = builder.add_source(
            config::Environment::with_prefix("WEBCOUNTER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.database.database_type.as_str() {
            "postgres" => {
                if self.database.host.is_none() {
                    anyhow::bail!("Postgres database requires 'host'");
                }
                if self.database.database.is_none() {
                    anyhow::bail!("Postgres database requires 'database'");
                }
                if self.database.user.is_none() {
                    anyhow::bail!("Postgres database requires 'user'");
                }
                if self.database.password.is_none() {
                    anyhow::bail!("Postgres database requires 'password'");
                }
            }
            "sqlite" => {
                if self.database.path.is_empty() {
                    anyhow::bail!("SQLite database requires 'path'");
                }
            }
            _ => anyhow::bail!("Invalid database type: {}", self.database.database_type),
        }

        match self.auth.hmac_secret.as_deref() {
            None | Some("") => anyhow::bail!("auth.hmac_secret must be set"),
            Some(_) => {}
        }

        if self.counter.online_window_secs == 0 {
            anyhow::bail!("counter.online_window_secs must be greater than zero");
        }
        self.counter.offset()?;

        if !self.redis.key_prefix.ends_with(':') {
            anyhow::bail!("redis.key_prefix must end with ':'");
        }

        self.flush.time_of_day()?;
        if self.flush.parallelism == 0 {
            anyhow::bail!("flush.parallelism must be greater than zero");
        }

        Ok(())
    }
}
