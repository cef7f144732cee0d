//! Configuration parsing.
//!
//! Ad selection is configured from a TOML file. Every field has a default,
//! so an empty file is a valid configuration:
//!
//! ```toml
//! [timeouts]
//! bidding_per_custom_audience = "5s"
//! scoring = "5s"
//! overall = "10s"
//!
//! [concurrency]
//! max_concurrent_bidding = 6
//!
//! [features]
//! debug_reporting = true
//!
//! [sandbox]
//! interpreter = "node"
//!
//! [sandbox.retry.backoff]
//! type = "exponential"
//! initial_delay = "50ms"
//! max_delay = "500ms"
//! ```
//!
//! Feature toggles are turned into strategy objects by the engine at
//! construction time; nothing reads them globally.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::debug::{self, DebugReportingStrategy};
use crate::marshal::{self, AdCounterKeyCopier};
use crate::parse::{BidParseOptions, AD_COST_ROUNDING_BITS};

/// Maximum size of a configuration file.
pub const MAX_CONFIG_FILE_SIZE: u64 = 256 * 1024;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Validation(String),
}

// =============================================================================
// AdSelectionConfig
// =============================================================================

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdSelectionConfig {
    /// Stage and fetch timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Pool sizes.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// Feature toggles.
    #[serde(default)]
    pub features: FeatureConfig,

    /// Script sandbox settings.
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Network fetch settings.
    #[serde(default)]
    pub fetch: FetchConfig,
}

impl AdSelectionConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is too large, cannot be read, cannot be
    /// parsed, or fails validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let size = std::fs::metadata(path)?.len();
        if size > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Validation(format!(
                "config file is {size} bytes, limit is {MAX_CONFIG_FILE_SIZE}"
            )));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("timeouts.bidding_per_custom_audience", self.timeouts.bidding_per_custom_audience),
            ("timeouts.scoring", self.timeouts.scoring),
            ("timeouts.overall", self.timeouts.overall),
            ("timeouts.fetch", self.timeouts.fetch),
            ("timeouts.outcome_selection", self.timeouts.outcome_selection),
            ("sandbox.max_execution_time", self.sandbox.max_execution_time),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(ConfigError::Validation(format!("{name} must be non-zero")));
            }
        }
        let limits = [
            ("concurrency.max_concurrent_bidding", self.concurrency.max_concurrent_bidding),
            ("concurrency.max_concurrent_scripts", self.concurrency.max_concurrent_scripts),
            ("concurrency.max_concurrent_fetches", self.concurrency.max_concurrent_fetches),
            ("sandbox.max_output_bytes", self.sandbox.max_output_bytes),
            ("fetch.max_response_bytes", self.fetch.max_response_bytes),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{name} must be non-zero")));
            }
        }
        if self.sandbox.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "sandbox.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Debug reporting strategy selected by `features.debug_reporting`.
    #[must_use]
    pub fn debug_reporting_strategy(&self) -> Arc<dyn DebugReportingStrategy> {
        debug::strategy_for(self.features.debug_reporting)
    }

    /// Counter-key copier selected by `features.ad_counter_key_copying`.
    #[must_use]
    pub fn counter_key_copier(&self) -> Arc<dyn AdCounterKeyCopier> {
        marshal::copier_for(self.features.ad_counter_key_copying)
    }

    /// Bid parse options selected by `features.ad_cost_extraction`.
    #[must_use]
    pub fn bid_parse_options(&self) -> BidParseOptions {
        BidParseOptions {
            ad_cost_extraction: self.features.ad_cost_extraction,
            ad_cost_rounding_bits: AD_COST_ROUNDING_BITS,
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Stage and fetch timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Bound on bidding for one custom audience, fetches included.
    #[serde(default = "default_bidding_timeout", with = "humantime_serde")]
    pub bidding_per_custom_audience: Duration,

    /// Bound on the scoring stage, fetches included.
    #[serde(default = "default_scoring_timeout", with = "humantime_serde")]
    pub scoring: Duration,

    /// Bound on the whole auction.
    #[serde(default = "default_overall_timeout", with = "humantime_serde")]
    pub overall: Duration,

    /// Bound on each individual script or signals fetch.
    #[serde(default = "default_fetch_timeout", with = "humantime_serde")]
    pub fetch: Duration,

    /// Bound on outcome selection.
    #[serde(default = "default_outcome_selection_timeout", with = "humantime_serde")]
    pub outcome_selection: Duration,
}

const fn default_bidding_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_scoring_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_overall_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_fetch_timeout() -> Duration {
    Duration::from_secs(2)
}

const fn default_outcome_selection_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            bidding_per_custom_audience: default_bidding_timeout(),
            scoring: default_scoring_timeout(),
            overall: default_overall_timeout(),
            fetch: default_fetch_timeout(),
            outcome_selection: default_outcome_selection_timeout(),
        }
    }
}

/// Pool sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConcurrencyConfig {
    /// Custom audiences bidding at once.
    #[serde(default = "default_max_concurrent_bidding")]
    pub max_concurrent_bidding: usize,

    /// Script invocations running at once.
    #[serde(default = "default_max_concurrent_scripts")]
    pub max_concurrent_scripts: usize,

    /// Fetches in flight at once.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
}

const fn default_max_concurrent_bidding() -> usize {
    6
}

const fn default_max_concurrent_scripts() -> usize {
    4
}

const fn default_max_concurrent_fetches() -> usize {
    8
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_bidding: default_max_concurrent_bidding(),
            max_concurrent_scripts: default_max_concurrent_scripts(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
        }
    }
}

/// Feature toggles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureConfig {
    /// Require and attach `adCost` on bids.
    #[serde(default)]
    pub ad_cost_extraction: bool,

    /// Keep script-declared debug report URLs.
    #[serde(default)]
    pub debug_reporting: bool,

    /// Expose counter keys to bidding scripts and restore them on bids.
    #[serde(default)]
    pub ad_counter_key_copying: bool,

    /// Attach the trusted scoring signals data version to scores.
    #[serde(default)]
    pub data_version_header: bool,

    /// Keep only the highest bid of each custom audience.
    #[serde(default = "default_true")]
    pub best_bid_per_custom_audience: bool,

    /// Honor developer overrides from the store.
    #[serde(default)]
    pub dev_options: bool,
}

const fn default_true() -> bool {
    true
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            ad_cost_extraction: false,
            debug_reporting: false,
            ad_counter_key_copying: false,
            data_version_header: false,
            best_bid_per_custom_audience: true,
            dev_options: false,
        }
    }
}

/// Subprocess sandbox settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxConfig {
    /// JavaScript interpreter reading a program on stdin.
    #[serde(default = "default_interpreter")]
    pub interpreter: PathBuf,

    /// Extra interpreter arguments.
    ///
    /// Defaults to node's permission model with no filesystem, child process
    /// or worker grants.
    #[serde(default = "default_interpreter_args")]
    pub args: Vec<String>,

    /// Hard cap on one invocation, independent of stage deadlines.
    #[serde(default = "default_max_execution_time", with = "humantime_serde")]
    pub max_execution_time: Duration,

    /// Cap on captured stdout and stderr combined.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Retry policy for sandbox availability failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_interpreter() -> PathBuf {
    PathBuf::from("node")
}

/// Enables node's permission model. Newer releases also accept
/// `--permission`; this spelling works from node 20 on.
pub const NODE_PERMISSION_FLAG: &str = "--experimental-permission";

fn default_interpreter_args() -> Vec<String> {
    vec![NODE_PERMISSION_FLAG.to_string()]
}

const fn default_max_execution_time() -> Duration {
    Duration::from_secs(5)
}

const fn default_max_output_bytes() -> usize {
    1024 * 1024
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            args: default_interpreter_args(),
            max_execution_time: default_max_execution_time(),
            max_output_bytes: default_max_output_bytes(),
            retry: RetryConfig::default(),
        }
    }
}

/// Network fetch settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetchConfig {
    /// Responses larger than this are rejected.
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,

    /// User agent sent with HTTP requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Also accept `http` and local `file` URLs. Only `https` is fetched
    /// otherwise.
    #[serde(default)]
    pub allow_insecure_schemes: bool,
}

const fn default_max_response_bytes() -> usize {
    1024 * 1024
}

fn default_user_agent() -> String {
    concat!("adsel/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_response_bytes: default_max_response_bytes(),
            user_agent: default_user_agent(),
            allow_insecure_schemes: false,
        }
    }
}

// =============================================================================
// Retry
// =============================================================================

/// Retry policy for retriable sandbox failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between attempts.
    #[serde(default = "default_retry_backoff")]
    pub backoff: BackoffConfig,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_retry_backoff() -> BackoffConfig {
    BackoffConfig::Exponential {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(500),
        multiplier: 2.0,
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_retry_backoff(),
        }
    }
}

/// Backoff between retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Same delay every time.
    Fixed {
        /// Delay duration.
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// Delay multiplied on each attempt.
    Exponential {
        /// First delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Delay cap.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,

        /// Growth factor (default: 2.0).
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },

    /// Delay increased by a constant on each attempt.
    Linear {
        /// First delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Increase per attempt.
        #[serde(with = "humantime_serde")]
        increment: Duration,

        /// Delay cap.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,
    },
}

const fn default_multiplier() -> f64 {
    2.0
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let step = attempt.saturating_sub(1);
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                #[allow(clippy::cast_possible_wrap)] // retry counts are tiny
                let secs = initial_delay.as_secs_f64() * multiplier.powi(step as i32);
                Duration::try_from_secs_f64(secs)
                    .unwrap_or(*max_delay)
                    .min(*max_delay)
            },
            Self::Linear {
                initial_delay,
                increment,
                max_delay,
            } => (*initial_delay + increment.saturating_mul(step)).min(*max_delay),
        }
    }
}
