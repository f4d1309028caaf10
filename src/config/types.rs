use serde::Deserialize;

/// Main configuration structure for Sumi-Harvest
///
/// Every section is optional; missing keys take their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub progress: ProgressConfig,

    /// URLs to harvest, in order
    #[serde(default)]
    pub urls: Vec<String>,
}

/// Circuit breaker settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Diagnostic name used in logs and errors
    pub name: String,

    /// Consecutive failures that open the circuit
    #[serde(rename = "failure-threshold")]
    pub failure_threshold: u32,

    /// Seconds an open circuit waits before allowing a trial call
    #[serde(rename = "recovery-timeout-secs")]
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            name: "fetch".to_string(),
            failure_threshold: 10,
            recovery_timeout_secs: 60,
        }
    }
}

/// Retry and backoff settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per URL, including the first
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    #[serde(rename = "initial-delay-ms")]
    pub initial_delay_ms: u64,

    #[serde(rename = "backoff-multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound for a single backoff sleep
    #[serde(rename = "max-delay-ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 240_000,
        }
    }
}

/// HTTP client settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Whole-request timeout
    #[serde(rename = "timeout-secs")]
    pub timeout_secs: u64,

    #[serde(rename = "connect-timeout-secs")]
    pub connect_timeout_secs: u64,

    #[serde(rename = "user-agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            connect_timeout_secs: 10,
            user_agent: format!("sumi-harvest/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Run ledger database settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    pub path: String,

    /// Size of the connection pool
    #[serde(rename = "max-connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "sumi-harvest.db".to_string(),
            max_connections: 5,
        }
    }
}

/// Progress snapshot settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Snapshot file; defaults to the user state directory
    #[serde(rename = "state-path")]
    pub state_path: Option<String>,
}
