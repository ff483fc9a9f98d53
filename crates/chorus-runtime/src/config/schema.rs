//! Configuration schema definitions.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use chorus_framework::{DispatchConfig, GatewayConfig, Mode, SpamPolicy, Templates, WalletConfig};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ChorusConfig {
    /// Identity, operators and command surface.
    pub host: HostConfig,
    /// Document store and gateway retry policy.
    pub store: StoreConfig,
    /// Admission filters, deadlines and reply templates.
    pub dispatch: DispatchSection,
    /// Cooldown and rate-limit table.
    pub rate_limit: RateLimitConfig,
    /// Wallet limits.
    pub wallet: WalletSection,
    /// Scheduler loop.
    pub scheduler: SchedulerConfig,
    /// Health endpoint.
    pub health: HealthConfig,
    /// Logging.
    pub logging: LoggingConfig,
    /// Per-plugin config sections, keyed by plugin name. Merged over the
    /// `[config]` table of the plugin's file.
    pub plugins: HashMap<String, Value>,
}

// =============================================================================
// Host
// =============================================================================

/// Host identity and operator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Phone number of the owner (`OWNER_NUMBER`).
    #[serde(deserialize_with = "number_opt")]
    pub owner_number: Option<String>,
    /// Host admins (`ADMIN_NUMBERS`, comma-separated in the environment).
    #[serde(deserialize_with = "number_list")]
    pub admin_numbers: Vec<String>,
    /// Command prefix, a single character (`PREFIX`).
    pub prefix: String,
    /// Public or private mode (`MODE`).
    pub mode: Mode,
    /// IANA timezone for scheduled tasks (`TIMEZONE`).
    pub timezone: String,
    /// Directory of plugin files (`PLUGIN_DIR`).
    pub plugin_dir: PathBuf,
    /// How long group metadata is cached.
    pub metadata_ttl_ms: u64,
    /// Outbound sends allowed to queue at the gate.
    pub outbound_buffer: usize,
    /// Delay between broadcast sends.
    pub broadcast_pacing_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            owner_number: None,
            admin_numbers: Vec::new(),
            prefix: ".".into(),
            mode: Mode::Public,
            timezone: "Africa/Lagos".into(),
            plugin_dir: PathBuf::from("plugins"),
            metadata_ttl_ms: 5 * 60 * 1000,
            outbound_buffer: 32,
            broadcast_pacing_ms: 1500,
        }
    }
}

impl HostConfig {
    /// The prefix character, if `prefix` is exactly one character.
    pub fn prefix_char(&self) -> Option<char> {
        let mut chars = self.prefix.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Some(c),
            _ => None,
        }
    }
}

// =============================================================================
// Store
// =============================================================================

/// Store location and gateway retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `memory://` or `file://<dir>` (`STORE_URI`).
    pub uri: String,
    /// Deadline of one store call.
    pub op_timeout_ms: u64,
    /// Attempts per operation, first try included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Upper bound on the retry delay.
    pub max_delay_ms: u64,
    /// Consecutive unavailabilities that open the circuit breaker.
    pub breaker_threshold: u32,
    /// Window for those failures.
    pub breaker_window_ms: u64,
    /// Time the breaker stays open.
    pub breaker_cooldown_ms: u64,
    /// Period of background flushes; 0 disables them.
    pub flush_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let gateway = GatewayConfig::default();
        Self {
            uri: "memory://".into(),
            op_timeout_ms: gateway.op_timeout.as_millis() as u64,
            max_attempts: gateway.max_attempts,
            base_delay_ms: gateway.base_delay.as_millis() as u64,
            max_delay_ms: gateway.max_delay.as_millis() as u64,
            breaker_threshold: gateway.breaker_threshold,
            breaker_window_ms: gateway.breaker_window.as_millis() as u64,
            breaker_cooldown_ms: gateway.breaker_cooldown.as_millis() as u64,
            flush_interval_ms: 30_000,
        }
    }
}

impl StoreConfig {
    /// Gateway tuning derived from this section.
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            op_timeout: Duration::from_millis(self.op_timeout_ms),
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            breaker_threshold: self.breaker_threshold,
            breaker_window: Duration::from_millis(self.breaker_window_ms),
            breaker_cooldown: Duration::from_millis(self.breaker_cooldown_ms),
        }
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Dispatcher and registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    /// Default handler deadline.
    pub handler_timeout_ms: u64,
    /// Deadline of each plugin's `on_init`.
    pub init_timeout_ms: u64,
    /// How long shutdown waits for in-flight handlers.
    pub drain_timeout_ms: u64,
    /// Remove links posted by group members.
    pub anti_link: bool,
    /// Per-sender message rate limit.
    pub anti_spam: Option<AntiSpamConfig>,
    /// Reply templates.
    pub templates: Templates,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            handler_timeout_ms: 60_000,
            init_timeout_ms: 30_000,
            drain_timeout_ms: 10_000,
            anti_link: false,
            anti_spam: None,
            templates: Templates::default(),
        }
    }
}

/// Anti-spam window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AntiSpamConfig {
    /// Messages allowed per window.
    pub limit: u32,
    /// Window length.
    pub window_ms: u64,
}

impl DispatchSection {
    /// Dispatcher settings derived from this section.
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            handler_timeout: Duration::from_millis(self.handler_timeout_ms),
            anti_link: self.anti_link,
            anti_spam: self.anti_spam.map(|s| SpamPolicy {
                limit: s.limit,
                window: Duration::from_millis(s.window_ms),
            }),
            templates: self.templates.clone(),
        }
    }
}

// =============================================================================
// Rate limit / wallet / scheduler / health
// =============================================================================

/// Cooldown table settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Entries kept before the oldest are evicted.
    pub capacity: usize,
    /// Period of the expired-entry sweep.
    pub sweep_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: chorus_framework::rate_limit::DEFAULT_CAPACITY,
            sweep_interval_ms: chorus_framework::rate_limit::SWEEP_INTERVAL.as_millis() as u64,
        }
    }
}

/// Wallet limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletSection {
    /// Upper bound on the wallet balance.
    pub max_wallet: i64,
    /// Upper bound on the bank balance.
    pub max_bank: i64,
    /// Compare-and-set attempts per mutation.
    pub max_cas_retries: u32,
}

impl Default for WalletSection {
    fn default() -> Self {
        let wallet = WalletConfig::default();
        Self {
            max_wallet: wallet.max_wallet,
            max_bank: wallet.max_bank,
            max_cas_retries: wallet.max_cas_retries,
        }
    }
}

impl WalletSection {
    /// Wallet settings derived from this section.
    pub fn wallet_config(&self) -> WalletConfig {
        WalletConfig {
            max_wallet: self.max_wallet,
            max_bank: self.max_bank,
            max_cas_retries: self.max_cas_retries,
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How long shutdown waits for running tasks.
    pub shutdown_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: 5_000,
        }
    }
}

/// Health endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Serve `/health` and `/plugins`.
    pub enabled: bool,
    /// Listen address.
    pub bind: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1:8080".into(),
        }
    }
}

// =============================================================================
// Logging
// =============================================================================

/// Log level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Everything.
    Trace,
    /// Debug and above.
    Debug,
    /// Info and above.
    #[default]
    Info,
    /// Warnings and errors.
    Warn,
    /// Errors only.
    Error,
}

impl LogLevel {
    /// Lowercase name, as used in filter directives.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// The matching `tracing` level.
    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One line per event, abbreviated.
    #[default]
    Compact,
    /// One line per event with all fields.
    Full,
    /// Multi-line, human-oriented.
    Pretty,
    /// Newline-delimited JSON (needs the `json-log` feature).
    Json,
}

/// Log destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    /// Standard output.
    #[default]
    Stdout,
    /// Standard error.
    Stderr,
    /// `file_path`, rotated daily.
    File,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpanEventConfig {
    /// Span created.
    pub new: bool,
    /// Span entered.
    pub enter: bool,
    /// Span exited.
    pub exit: bool,
    /// Span closed.
    pub close: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base level; `RUST_LOG` takes precedence.
    pub level: LogLevel,
    /// Line format.
    pub format: LogFormat,
    /// Destination.
    pub output: LogOutput,
    /// Span events.
    pub span_events: SpanEventConfig,
    /// Include thread ids.
    pub thread_ids: bool,
    /// Include source file and line.
    pub file_location: bool,
    /// Log file for [`LogOutput::File`].
    pub file_path: Option<PathBuf>,
    /// Rotated files kept.
    pub max_files: u32,
    /// Per-module levels, e.g. `chorus_framework::dispatcher = "debug"`.
    pub filters: HashMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            output: LogOutput::Stdout,
            span_events: SpanEventConfig::default(),
            thread_ids: false,
            file_location: false,
            file_path: None,
            max_files: 7,
            filters: HashMap::new(),
        }
    }
}

// =============================================================================
// Lenient number fields
// =============================================================================

/// Phone numbers arrive as strings from files and as integers from the
/// environment (figment parses `OWNER_NUMBER=234...` as a number).
#[derive(Deserialize)]
#[serde(untagged)]
enum NumberField {
    Text(String),
    Int(u64),
    List(Vec<NumberItem>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberItem {
    Text(String),
    Int(u64),
}

impl NumberItem {
    fn into_string(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Int(n) => n.to_string(),
        }
    }
}

fn split_list(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn number_opt<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(
        match Option::<NumberField>::deserialize(deserializer)? {
            None => None,
            Some(NumberField::Text(s)) if s.trim().is_empty() => None,
            Some(NumberField::Text(s)) => Some(s.trim().to_string()),
            Some(NumberField::Int(n)) => Some(n.to_string()),
            Some(NumberField::List(_)) => {
                return Err(serde::de::Error::custom("expected a single phone number"));
            }
        },
    )
}

fn number_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(match NumberField::deserialize(deserializer)? {
        NumberField::Text(s) => split_list(&s),
        NumberField::Int(n) => vec![n.to_string()],
        NumberField::List(items) => items.into_iter().map(NumberItem::into_string).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_numbers_accept_every_shape() {
        let host: HostConfig =
            serde_json::from_value(serde_json::json!({ "admin_numbers": "111, 222,,333" }))
                .unwrap();
        assert_eq!(host.admin_numbers, vec!["111", "222", "333"]);

        let host: HostConfig =
            serde_json::from_value(serde_json::json!({ "admin_numbers": ["111", 222] })).unwrap();
        assert_eq!(host.admin_numbers, vec!["111", "222"]);

        let host: HostConfig =
            serde_json::from_value(serde_json::json!({ "owner_number": 2348012345678u64 }))
                .unwrap();
        assert_eq!(host.owner_number.as_deref(), Some("2348012345678"));
    }

    #[test]
    fn test_prefix_char() {
        let mut host = HostConfig::default();
        assert_eq!(host.prefix_char(), Some('.'));
        host.prefix = "!!".into();
        assert_eq!(host.prefix_char(), None);
        host.prefix = String::new();
        assert_eq!(host.prefix_char(), None);
    }

    #[test]
    fn test_dispatch_section_converts() {
        let section = DispatchSection {
            anti_spam: Some(AntiSpamConfig {
                limit: 5,
                window_ms: 10_000,
            }),
            ..DispatchSection::default()
        };
        let config = section.dispatch_config();
        assert_eq!(config.handler_timeout, Duration::from_secs(60));
        assert_eq!(config.anti_spam.unwrap().window, Duration::from_secs(10));
    }
}
