use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

pub const DEFAULT_LEAD_MINUTES: i64 = 30;
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_SYNC_WINDOW_HOURS: i64 = 24;
pub const DEFAULT_PAGE_SIZE: u32 = 100;
/// Hard ceiling on attendee page requests for a single event.
pub const DEFAULT_MAX_PAGES: u32 = 1000;
pub const DEFAULT_DEAD_LETTER_MAX: usize = 1000;

/// Top-level config (rollcall.toml + ROLLCALL_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollcallConfig {
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub document: DocumentConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub base_url: String,
    /// Bearer credential attached to every upstream call.
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_sort")]
    pub sort: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_token: String::new(),
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
            sort: default_sort(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Minutes before an event's start at which processing triggers.
    #[serde(default = "default_lead_minutes")]
    pub lead_minutes: i64,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Look-ahead window for upstream sync.
    #[serde(default = "default_sync_window_hours")]
    pub sync_window_hours: i64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            lead_minutes: DEFAULT_LEAD_MINUTES,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            sync_window_hours: DEFAULT_SYNC_WINDOW_HOURS,
        }
    }
}

/// Which events survive the fee predicate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeFilter {
    #[default]
    Any,
    Paid,
    Free,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Category allow-list. Empty accepts every category.
    #[serde(default)]
    pub categories: Vec<String>,
    /// Event name must contain at least one of these. Empty disables.
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub exclude_keywords: Vec<String>,
    #[serde(default)]
    pub fee: FeeFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Upper bound of the random term added to every backoff delay.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip `closed → open`.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive probe successes that close a half-open breaker.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
    /// Concurrent trial calls allowed while half-open.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            reset_timeout_secs: default_reset_timeout_secs(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

/// Per-dependency call timeouts. A timeout counts as a failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_api_timeout")]
    pub api_secs: u64,
    #[serde(default = "default_email_timeout")]
    pub email_secs: u64,
    #[serde(default = "default_printer_timeout")]
    pub printer_secs: u64,
    #[serde(default = "default_webhook_timeout")]
    pub webhook_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            api_secs: default_api_timeout(),
            email_secs: default_email_timeout(),
            printer_secs: default_printer_timeout(),
            webhook_secs: default_webhook_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    /// Passed through untouched to the document generator.
    #[serde(default)]
    pub layout: serde_json::Value,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            layout: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryConfig {
    pub print: Option<PrintConfig>,
    pub email: Option<EmailConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintConfig {
    #[serde(default = "default_print_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub recipients: Vec<String>,
    /// Opaque to the core; interpreted only by the mail collaborator.
    #[serde(default)]
    pub transport: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    #[serde(default = "default_dead_letter_max")]
    pub max_entries: usize,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_DEAD_LETTER_MAX,
        }
    }
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}
fn default_max_pages() -> u32 {
    DEFAULT_MAX_PAGES
}
fn default_sort() -> String {
    "startDate".to_string()
}
fn default_lead_minutes() -> i64 {
    DEFAULT_LEAD_MINUTES
}
fn default_sync_interval_secs() -> u64 {
    DEFAULT_SYNC_INTERVAL_SECS
}
fn default_sync_window_hours() -> i64 {
    DEFAULT_SYNC_WINDOW_HOURS
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter_ms() -> u64 {
    250
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_reset_timeout_secs() -> u64 {
    60
}
fn default_half_open_max_calls() -> u32 {
    1
}
fn default_api_timeout() -> u64 {
    30
}
fn default_email_timeout() -> u64 {
    60
}
fn default_printer_timeout() -> u64 {
    60
}
fn default_webhook_timeout() -> u64 {
    10
}
fn default_print_program() -> String {
    "lp".to_string()
}
fn default_dead_letter_max() -> usize {
    DEFAULT_DEAD_LETTER_MAX
}
fn rollcall_home() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.rollcall", home)
}
fn default_db_path() -> String {
    format!("{}/rollcall.db", rollcall_home())
}
fn default_output_dir() -> String {
    format!("{}/rosters", rollcall_home())
}

/// One week.
pub const MAX_LEAD_MINUTES: i64 = 7 * 24 * 60;
/// One leap year.
pub const MAX_SYNC_WINDOW_HOURS: i64 = 366 * 24;

impl RollcallConfig {
    /// Load config from a TOML file with ROLLCALL_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ROLLCALL_CONFIG env var
    ///   3. ~/.rollcall/rollcall.toml
    ///
    /// A missing file is not an error; defaults fill every gap. Nested keys
    /// are addressed with `__`, e.g. `ROLLCALL_SCHEDULE__LEAD_MINUTES=15`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("ROLLCALL_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        let config: RollcallConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("ROLLCALL_").ignore(&["config"]).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the scheduler misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.upstream.page_size == 0 {
            return Err(ConfigError::Invalid("upstream.page_size must be > 0".into()));
        }
        if self.upstream.max_pages == 0 {
            return Err(ConfigError::Invalid("upstream.max_pages must be > 0".into()));
        }
        if !(0..=MAX_LEAD_MINUTES).contains(&self.schedule.lead_minutes) {
            return Err(ConfigError::Invalid(format!(
                "schedule.lead_minutes must be within 0..={MAX_LEAD_MINUTES}"
            )));
        }
        if !(1..=MAX_SYNC_WINDOW_HOURS).contains(&self.schedule.sync_window_hours) {
            return Err(ConfigError::Invalid(format!(
                "schedule.sync_window_hours must be within 1..={MAX_SYNC_WINDOW_HOURS}"
            )));
        }
        if self.resilience.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "resilience.retry.max_attempts must be >= 1".into(),
            ));
        }
        if self.resilience.breaker.failure_threshold == 0
            || self.resilience.breaker.success_threshold == 0
        {
            return Err(ConfigError::Invalid(
                "resilience.breaker thresholds must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Fail fast when the upstream endpoint is unusable.
    pub fn require_upstream(&self) -> Result<()> {
        if self.upstream.base_url.trim().is_empty() {
            return Err(ConfigError::Missing {
                key: "upstream.base_url".into(),
            });
        }
        if self.upstream.api_token.trim().is_empty() {
            return Err(ConfigError::Missing {
                key: "upstream.api_token".into(),
            });
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    format!("{}/rollcall.toml", rollcall_home())
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_apply_when_file_is_missing() {
        Jail::expect_with(|_jail| {
            let config = RollcallConfig::load(Some("does-not-exist.toml")).unwrap();
            assert_eq!(config.schedule.lead_minutes, DEFAULT_LEAD_MINUTES);
            assert_eq!(config.upstream.page_size, DEFAULT_PAGE_SIZE);
            assert_eq!(config.resilience.breaker.failure_threshold, 5);
            assert_eq!(config.filters.fee, FeeFilter::Any);
            assert!(config.delivery.print.is_none());
            Ok(())
        });
    }

    #[test]
    fn toml_and_env_layers_merge() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "rollcall.toml",
                r#"
                [upstream]
                base_url = "https://api.example.org/v1"
                api_token = "secret"

                [filters]
                categories = ["Workshop"]
                fee = "paid"

                [delivery.email]
                recipients = ["desk@example.org"]
                transport = { program = "mail", args = ["-s", "{subject}"] }
                "#,
            )?;
            jail.set_env("ROLLCALL_SCHEDULE__LEAD_MINUTES", "15");

            let config = RollcallConfig::load(Some("rollcall.toml")).unwrap();
            assert_eq!(config.upstream.base_url, "https://api.example.org/v1");
            assert_eq!(config.schedule.lead_minutes, 15);
            assert_eq!(config.filters.categories, vec!["Workshop".to_string()]);
            assert_eq!(config.filters.fee, FeeFilter::Paid);
            assert!(config.require_upstream().is_ok());
            let email = config.delivery.email.as_ref().unwrap();
            assert_eq!(email.transport["program"], "mail");
            Ok(())
        });
    }

    #[test]
    fn zero_page_size_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("rollcall.toml", "[upstream]\npage_size = 0\n")?;
            let err = RollcallConfig::load(Some("rollcall.toml")).unwrap_err();
            assert!(err.to_string().contains("page_size"));
            Ok(())
        });
    }

    #[test]
    fn schedule_bounds_are_enforced() {
        let mut config = RollcallConfig::default();
        config.schedule.lead_minutes = 1_000_000_000_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lead_minutes"));

        config.schedule.lead_minutes = MAX_LEAD_MINUTES;
        assert!(config.validate().is_ok());

        config.schedule.sync_window_hours = MAX_SYNC_WINDOW_HOURS + 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sync_window_hours"));

        config.schedule.sync_window_hours = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_upstream_is_reported() {
        let config = RollcallConfig::default();
        assert!(matches!(
            config.require_upstream(),
            Err(ConfigError::Missing { .. })
        ));
    }
}
