//! Stage execution logging and Prometheus metrics.
//!
//! The coordinator and orchestrators report through [`ExecutionLogger`],
//! which is infallible by construction: logging can never change an auction
//! outcome. [`AuctionMetrics`] is the Prometheus implementation.
//!
//! # Metrics Families
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `adsel_stage_duration_seconds` | Histogram | `stage`, `outcome` |
//! | `adsel_stage_total` | Counter | `stage`, `outcome` |
//! | `adsel_excluded_items_total` | Counter | `stage`, `reason` |
//!
//! # Usage
//!
//! ```rust,ignore
//! let registry = MetricsRegistry::new()?;
//! let coordinator = AuctionCoordinator::new(config, runner, fetcher, store)
//!     .with_logger(Arc::new(registry.auction_metrics().clone()));
//! // ... run auctions ...
//! let output = registry.encode_text()?;
//! ```

use std::fmt;
use std::sync::Arc;

use adsel_core::Stage;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use thiserror::Error;
use tokio::time::Instant;

/// Maximum length for label values.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Histogram buckets for stage latency (in seconds).
pub const STAGE_DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Outcome label for a stage that completed.
pub const OUTCOME_SUCCESS: &str = "success";

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

// =============================================================================
// ExecutionLogger
// =============================================================================

/// Receives stage timings and per-item exclusions.
pub trait ExecutionLogger: Send + Sync + fmt::Debug {
    /// A stage started at `at`.
    fn stage_started(&self, stage: Stage, at: Instant);

    /// A stage that started at `started` ended at `ended` with `outcome`
    /// ([`OUTCOME_SUCCESS`] or an error kind).
    fn stage_ended(&self, stage: Stage, started: Instant, ended: Instant, outcome: &str);

    /// An item was dropped from `stage` for `reason`.
    fn item_excluded(&self, stage: Stage, reason: &str);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExecutionLogger;

impl ExecutionLogger for NoopExecutionLogger {
    fn stage_started(&self, _stage: Stage, _at: Instant) {}

    fn stage_ended(&self, _stage: Stage, _started: Instant, _ended: Instant, _outcome: &str) {}

    fn item_excluded(&self, _stage: Stage, _reason: &str) {}
}

// =============================================================================
// AuctionMetrics
// =============================================================================

/// Prometheus metrics for auction stages.
///
/// All metrics use interior mutability; the struct is cheap to clone and
/// safe to share across threads.
#[derive(Clone)]
pub struct AuctionMetrics {
    stage_duration: HistogramVec,
    stage_total: CounterVec,
    excluded_items_total: CounterVec,
}

impl fmt::Debug for AuctionMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuctionMetrics").finish_non_exhaustive()
    }
}

impl AuctionMetrics {
    /// Creates the metrics and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register.
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let stage_duration = HistogramVec::new(
            HistogramOpts::new(
                "adsel_stage_duration_seconds",
                "Wall-clock duration of auction stages",
            )
            .buckets(STAGE_DURATION_BUCKETS.to_vec()),
            &["stage", "outcome"],
        )?;
        registry.register(Box::new(stage_duration.clone()))?;

        let stage_total = CounterVec::new(
            Opts::new("adsel_stage_total", "Completed auction stages by outcome"),
            &["stage", "outcome"],
        )?;
        registry.register(Box::new(stage_total.clone()))?;

        let excluded_items_total = CounterVec::new(
            Opts::new(
                "adsel_excluded_items_total",
                "Bids and scores dropped from a stage",
            ),
            &["stage", "reason"],
        )?;
        registry.register(Box::new(excluded_items_total.clone()))?;

        Ok(Self {
            stage_duration,
            stage_total,
            excluded_items_total,
        })
    }

    /// Returns the number of completed `stage` runs with `outcome`.
    #[must_use]
    pub fn stage_count(&self, stage: Stage, outcome: &str) -> f64 {
        self.stage_total
            .with_label_values(&[stage.as_str(), truncate_label(outcome)])
            .get()
    }

    /// Returns the number of items dropped from `stage` for `reason`.
    #[must_use]
    pub fn excluded_count(&self, stage: Stage, reason: &str) -> f64 {
        self.excluded_items_total
            .with_label_values(&[stage.as_str(), truncate_label(reason)])
            .get()
    }
}

impl ExecutionLogger for AuctionMetrics {
    fn stage_started(&self, _stage: Stage, _at: Instant) {}

    fn stage_ended(&self, stage: Stage, started: Instant, ended: Instant, outcome: &str) {
        let outcome = truncate_label(outcome);
        let seconds = ended.saturating_duration_since(started).as_secs_f64();
        self.stage_duration
            .with_label_values(&[stage.as_str(), outcome])
            .observe(seconds);
        self.stage_total
            .with_label_values(&[stage.as_str(), outcome])
            .inc();
    }

    fn item_excluded(&self, stage: Stage, reason: &str) {
        self.excluded_items_total
            .with_label_values(&[stage.as_str(), truncate_label(reason)])
            .inc();
    }
}

// =============================================================================
// MetricsRegistry
// =============================================================================

/// Holds the Prometheus registry and the auction metrics.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    auction_metrics: AuctionMetrics,
}

impl fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegistry").finish_non_exhaustive()
    }
}

impl MetricsRegistry {
    /// Creates a registry with all auction metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let auction_metrics = AuctionMetrics::new(&registry)?;
        Ok(Self {
            registry,
            auction_metrics,
        })
    }

    /// The auction metrics.
    #[must_use]
    pub const fn auction_metrics(&self) -> &AuctionMetrics {
        &self.auction_metrics
    }

    /// The auction metrics as a shareable logger.
    #[must_use]
    pub fn logger(&self) -> Arc<dyn ExecutionLogger> {
        Arc::new(self.auction_metrics.clone())
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Truncates a label value at a UTF-8 boundary.
fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value;
    }
    let end = value
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= MAX_LABEL_VALUE_LEN)
        .last()
        .unwrap_or(0);
    &value[..end]
}
