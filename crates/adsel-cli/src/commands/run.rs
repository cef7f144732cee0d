//! `adsel run`: one auction from a JSON request file.
//!
//! # Exit Codes
//!
//! - 0: the auction produced a winner
//! - 1: the auction failed, or the request could not be loaded

use std::path::PathBuf;
use std::sync::Arc;

use adsel_core::AdSelectionConfig;
use adsel_engine::{
    AdSelectionRequest, AuctionCoordinator, HttpFetcher, InMemoryAdSelectionStore,
    MetricsRegistry, ProcessScriptRunner,
};
use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use super::{read_bounded, runtime, MAX_INPUT_FILE_SIZE};

/// Exit codes for `adsel run`.
pub mod exit_codes {
    /// A winner was selected.
    pub const SUCCESS: u8 = 0;
    /// No winner.
    pub const FAILED: u8 = 1;
}

/// Arguments for `adsel run`.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Auction request JSON file.
    #[arg(long)]
    pub request: PathBuf,

    /// Print the full auction report (scores, debug reports, states)
    /// instead of the outcome alone.
    #[arg(long)]
    pub report: bool,

    /// Print Prometheus metrics for the run to stderr.
    #[arg(long)]
    pub metrics: bool,
}

/// Runs the auction and returns the process exit code.
pub fn run(config: &AdSelectionConfig, args: &RunArgs) -> u8 {
    match run_inner(config, args) {
        Ok(output) => {
            println!("{output}");
            exit_codes::SUCCESS
        },
        Err(e) => {
            eprintln!("Error: {e:#}");
            exit_codes::FAILED
        },
    }
}

fn run_inner(config: &AdSelectionConfig, args: &RunArgs) -> Result<String> {
    let request = load_request(&args.request)?;
    let fetcher = HttpFetcher::new(&config.fetch, config.timeouts.fetch)
        .context("failed to build HTTP client")?;
    let registry = MetricsRegistry::new().context("failed to register metrics")?;
    let coordinator = AuctionCoordinator::new(
        config.clone(),
        Arc::new(ProcessScriptRunner::new(&config.sandbox)),
        Arc::new(fetcher),
        Arc::new(InMemoryAdSelectionStore::new()),
    )
    .with_logger(registry.logger());

    let result = runtime()?.block_on(coordinator.run_auction(&request));
    if args.metrics {
        eprint!("{}", registry.encode_text().context("failed to encode metrics")?);
    }
    let report = result.map_err(|e| anyhow::anyhow!("auction failed ({}): {e}", e.kind()))?;
    info!(ad_selection_id = %report.outcome.ad_selection_id, "auction won");

    if args.report {
        serde_json::to_string_pretty(&report).context("failed to serialize report")
    } else {
        serde_json::to_string_pretty(&report.outcome).context("failed to serialize outcome")
    }
}

/// Loads and parses an auction request.
fn load_request(path: &std::path::Path) -> Result<AdSelectionRequest> {
    let content = read_bounded(path, MAX_INPUT_FILE_SIZE)?;
    serde_json::from_str(&content)
        .with_context(|| format!("invalid auction request in '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const REQUEST: &str = r#"{
        "config": {
            "seller": "seller.example",
            "decision_logic_uri": "https://seller.example/score.js",
            "trusted_scoring_signals_uri": "https://seller.example/kv",
            "custom_audience_buyers": ["buyer.example"]
        },
        "custom_audiences": [{
            "owner": "com.example.app",
            "buyer": "buyer.example",
            "name": "shoes",
            "activation_time": "2024-01-01T00:00:00Z",
            "expiration_time": "2999-01-01T00:00:00Z",
            "bidding_logic_uri": "https://buyer.example/bid.js",
            "ads": [{ "render_uri": "https://buyer.example/ad/1", "metadata": { "bid": 2 } }]
        }],
        "caller": "com.example.app"
    }"#;

    #[test]
    fn request_file_is_parsed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(REQUEST.as_bytes()).unwrap();
        let request = load_request(file.path()).unwrap();
        assert_eq!(request.caller, "com.example.app");
        assert_eq!(request.custom_audiences.len(), 1);
        assert_eq!(request.custom_audiences[0].ads.len(), 1);
        assert!(request.contextual_signals.is_empty());
    }

    #[test]
    fn malformed_request_names_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{\"caller\": 3}").unwrap();
        let err = load_request(file.path()).unwrap_err();
        assert!(err.to_string().contains("invalid auction request"));
    }

    #[test]
    fn missing_request_fails_with_exit_code_one() {
        let args = RunArgs {
            request: PathBuf::from("/nonexistent/request.json"),
            report: false,
            metrics: false,
        };
        assert_eq!(run(&AdSelectionConfig::default(), &args), exit_codes::FAILED);
    }
}
