use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub analysis: AnalysisConfig,
    /// Messages produced while loading, replayed by [`Config::log_load_messages`]
    #[serde(skip)]
    pub load_log: Vec<LoadMessage>,
}

/// A configuration loading message recorded before logging is initialized
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadMessage {
    Info(String),
    Warn(String),
}

/// Pooled connections one analysis holds at once: the plan and five statistics queries
pub const CONNECTIONS_PER_ANALYSIS: u32 = 6;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Target PostgreSQL database. Plans and statistics are read from it, nothing is written.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// Pool acquire timeout in seconds (accepts "5s", "1m")
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub acquire_timeout_secs: u64,
    /// `statement_timeout` applied to every pooled connection
    pub statement_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Forward rule rewrites to later rules and report them
    pub enable_rewrites: bool,
    /// Evaluate non-rewriting rules on the rayon pool
    pub parallel_rules: bool,
    /// Upper bound of concurrently analyzed queries in one bulk request
    pub bulk_concurrency: usize,
    /// Attach a summary text to every result
    pub summary: bool,
}

/// Command line arguments for configuration overrides
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "sql-advisor")]
#[command(version, about = "SQL Advisor - PostgreSQL query linting service")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Server host (overrides config file)
    #[arg(long, value_name = "HOST")]
    pub server_host: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(long, value_name = "URL")]
    pub database_url: Option<String>,

    /// Maximum pooled connections (overrides config file)
    #[arg(long, value_name = "N")]
    pub database_max_connections: Option<u32>,

    /// Logging level (overrides config file, e.g., "info,sql_advisor=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Enable/disable query rewrites (overrides config file)
    #[arg(long, value_name = "BOOL")]
    pub enable_rewrites: Option<bool>,

    /// Bulk analysis concurrency (overrides config file)
    #[arg(long, value_name = "N")]
    pub bulk_concurrency: Option<usize>,
}

impl Config {
    /// Load configuration with command line, environment variable, and file support
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Command line arguments
    /// 2. Environment variables (prefixed with APP_, `.env` is honored)
    /// 3. Configuration file (conf/config.toml)
    /// 4. Default values
    ///
    /// Nothing is logged here since the subscriber depends on the loaded `[logging]`
    /// section. Call [`Config::log_load_messages`] once it is installed.
    pub fn load() -> Result<Self, anyhow::Error> {
        let cli_args = CommandLineArgs::parse();
        let dotenv_path = dotenvy::dotenv().ok();
        let mut config = Self::load_with(&cli_args, |key| std::env::var(key).ok())?;
        if let Some(path) = dotenv_path {
            config
                .load_log
                .insert(0, LoadMessage::Info(format!("Loaded environment from {}", path.display())));
        }
        Ok(config)
    }

    fn load_with(
        cli_args: &CommandLineArgs,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, anyhow::Error> {
        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            let mut config = Self::from_toml(&config_path)?;
            config.info(format!("Loaded configuration from {}", config_path));
            config
        } else {
            let mut config = Config::default();
            config.warn("Configuration file not found, using defaults");
            config
        };

        config.apply_env_overrides(env);
        config.apply_cli_overrides(cli_args);
        config.validate()?;
        config.check_pool_size();

        Ok(config)
    }

    /// Emit the messages recorded while loading
    pub fn log_load_messages(&self) {
        for message in &self.load_log {
            match message {
                LoadMessage::Info(msg) => tracing::info!("{}", msg),
                LoadMessage::Warn(msg) => tracing::warn!("{}", msg),
            }
        }
    }

    fn info(&mut self, message: impl Into<String>) {
        self.load_log.push(LoadMessage::Info(message.into()));
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.load_log.push(LoadMessage::Warn(message.into()));
    }

    /// Warn when the pool cannot serve one analysis, or one bulk batch, without waiting
    fn check_pool_size(&mut self) {
        let needed = CONNECTIONS_PER_ANALYSIS.max(self.analysis.bulk_concurrency as u32);
        if self.database.max_connections < needed {
            self.warn(format!(
                "database.max_connections ({}) is below the {} connections an analysis needs at once; \
                 requests will wait for connections and statistics may degrade",
                self.database.max_connections, needed
            ));
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - APP_SERVER_HOST / APP_SERVER_PORT
    /// - APP_DATABASE_URL
    /// - APP_DATABASE_MAX_CONNECTIONS
    /// - APP_DATABASE_ACQUIRE_TIMEOUT (accepts "5s", "1m")
    /// - APP_DATABASE_STATEMENT_TIMEOUT_MS
    /// - APP_LOG_LEVEL / APP_LOG_FILE
    /// - APP_ANALYSIS_ENABLE_REWRITES / APP_ANALYSIS_PARALLEL_RULES (true/false)
    /// - APP_ANALYSIS_BULK_CONCURRENCY
    /// - APP_ANALYSIS_SUMMARY (true/false)
    fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(host) = env("APP_SERVER_HOST") {
            self.server.host = host;
            self.info(format!("Override server.host from env: {}", self.server.host));
        }

        if let Some(port) = env("APP_SERVER_PORT")
            && let Ok(port) = port.parse()
        {
            self.server.port = port;
            self.info(format!("Override server.port from env: {}", self.server.port));
        }

        if let Some(db_url) = env("APP_DATABASE_URL") {
            self.database.url = db_url;
            self.info("Override database.url from env");
        }

        if let Some(max) = env("APP_DATABASE_MAX_CONNECTIONS")
            && let Ok(max) = max.parse()
        {
            self.database.max_connections = max;
            self.info(format!(
                "Override database.max_connections from env: {}",
                self.database.max_connections
            ));
        }

        if let Some(timeout) = env("APP_DATABASE_ACQUIRE_TIMEOUT") {
            match parse_duration_to_secs(&timeout) {
                Ok(val) => {
                    self.database.acquire_timeout_secs = val;
                    self.info(format!(
                        "Override database.acquire_timeout_secs from env: {}",
                        self.database.acquire_timeout_secs
                    ));
                },
                Err(e) => self.warn(format!(
                    "Invalid APP_DATABASE_ACQUIRE_TIMEOUT '{}': {} (keep {})",
                    timeout,
                    e,
                    self.database.acquire_timeout_secs
                )),
            }
        }

        if let Some(timeout) = env("APP_DATABASE_STATEMENT_TIMEOUT_MS")
            && let Ok(timeout) = timeout.parse()
        {
            self.database.statement_timeout_ms = timeout;
            self.info(format!(
                "Override database.statement_timeout_ms from env: {}",
                self.database.statement_timeout_ms
            ));
        }

        if let Some(level) = env("APP_LOG_LEVEL") {
            self.logging.level = level;
            self.info(format!("Override logging.level from env: {}", self.logging.level));
        }

        if let Some(file) = env("APP_LOG_FILE") {
            self.info(format!("Override logging.file from env: {}", file));
            self.logging.file = Some(file).filter(|f| !f.is_empty());
        }

        if let Some(enabled) = env("APP_ANALYSIS_ENABLE_REWRITES")
            && let Ok(val) = enabled.parse()
        {
            self.analysis.enable_rewrites = val;
            self.info(format!(
                "Override analysis.enable_rewrites from env: {}",
                self.analysis.enable_rewrites
            ));
        }

        if let Some(parallel) = env("APP_ANALYSIS_PARALLEL_RULES")
            && let Ok(val) = parallel.parse()
        {
            self.analysis.parallel_rules = val;
            self.info(format!(
                "Override analysis.parallel_rules from env: {}",
                self.analysis.parallel_rules
            ));
        }

        if let Some(limit) = env("APP_ANALYSIS_BULK_CONCURRENCY")
            && let Ok(val) = limit.parse()
        {
            self.analysis.bulk_concurrency = val;
            self.info(format!(
                "Override analysis.bulk_concurrency from env: {}",
                self.analysis.bulk_concurrency
            ));
        }

        if let Some(summary) = env("APP_ANALYSIS_SUMMARY")
            && let Ok(val) = summary.parse()
        {
            self.analysis.summary = val;
            self.info(format!("Override analysis.summary from env: {}", self.analysis.summary));
        }
    }

    /// Apply command line argument overrides (highest priority)
    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(host) = &args.server_host {
            self.server.host = host.clone();
            self.info(format!("Override server.host from CLI: {}", self.server.host));
        }

        if let Some(port) = args.server_port {
            self.server.port = port;
            self.info(format!("Override server.port from CLI: {}", self.server.port));
        }

        if let Some(db_url) = &args.database_url {
            self.database.url = db_url.clone();
            self.info("Override database.url from CLI");
        }

        if let Some(max) = args.database_max_connections {
            self.database.max_connections = max;
            self.info(format!(
                "Override database.max_connections from CLI: {}",
                self.database.max_connections
            ));
        }

        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
            self.info(format!("Override logging.level from CLI: {}", self.logging.level));
        }

        if let Some(enabled) = args.enable_rewrites {
            self.analysis.enable_rewrites = enabled;
            self.info(format!(
                "Override analysis.enable_rewrites from CLI: {}",
                self.analysis.enable_rewrites
            ));
        }

        if let Some(limit) = args.bulk_concurrency {
            self.analysis.bulk_concurrency = limit;
            self.info(format!(
                "Override analysis.bulk_concurrency from CLI: {}",
                self.analysis.bulk_concurrency
            ));
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if !self.database.url.starts_with("postgres://")
            && !self.database.url.starts_with("postgresql://")
        {
            anyhow::bail!("database.url must be a postgres:// or postgresql:// URL");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("database.max_connections must be > 0");
        }
        if self.database.acquire_timeout_secs == 0 {
            anyhow::bail!("database.acquire_timeout_secs must be > 0");
        }

        if self.analysis.bulk_concurrency == 0 {
            anyhow::bail!("analysis.bulk_concurrency must be > 0");
        }

        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths =
            ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080 }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://postgres@localhost:5432/postgres".to_string(),
            max_connections: 10,
            acquire_timeout_secs: 5,
            statement_timeout_ms: 30_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), file: None }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self { enable_rewrites: true, parallel_rules: true, bulk_concurrency: 4, summary: true }
    }
}

// =========================
// Helpers for parsing values
// =========================

fn parse_duration_to_secs(input: &str) -> Result<u64, String> {
    // Accept plain numbers (treated as seconds)
    if let Ok(val) = input.parse::<u64>() {
        return Ok(val);
    }

    let s = input.trim().to_lowercase();
    let (num_str, unit) = s.split_at(s.chars().take_while(|c| c.is_ascii_digit()).count());
    if num_str.is_empty() || unit.is_empty() {
        return Err("missing number or unit".into());
    }
    let n: u64 = num_str.parse().map_err(|_| "invalid number".to_string())?;
    match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => Ok(n),
        "m" | "min" | "mins" | "minute" | "minutes" => Ok(n * 60),
        _ => Err(format!("unsupported unit: {}", unit)),
    }
}

fn deserialize_duration_secs<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct Visitor;
    impl<'de> serde::de::Visitor<'de> for Visitor {
        type Value = u64;
        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "a number of seconds or a string like '5s', '1m'")
        }
        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v)
        }
        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if v >= 0 { Ok(v as u64) } else { Err(E::custom("negative not allowed")) }
        }
        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_duration_to_secs(v).map_err(E::custom)
        }
    }
    deserializer.deserialize_any(Visitor)
}
