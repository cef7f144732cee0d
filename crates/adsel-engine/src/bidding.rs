//! Bid generation.
//!
//! [`BidGenerator::generate_bids`] runs a buyer's `generateBid` over one
//! custom audience's candidates:
//!
//! - **per-candidate** (`Legacy`/`Current`): one invocation per candidate,
//!   concurrently; surviving bids are returned in candidate order regardless
//!   of completion order
//! - **whole-audience** (`WholeAudience`, script version 3 and up): one
//!   invocation with the full candidate list; at most one bid
//!
//! Item-level problems (malformed output, a bad status, a non-positive bid)
//! exclude the candidate. A script that references an undefined symbol, a
//! missing `generateBid`, an unreachable sandbox, an invocation that times
//! out or a whole-audience result with more than one winner fails the call.
//!
//! [`BidGenerator::run_bidding_for_custom_audience`] adds input resolution
//! (developer override or fetch of bidding logic and trusted bidding
//! signals) and the optional best-bid reduction.

use std::sync::Arc;
use std::time::Duration;

use adsel_core::debug::DebugReportingStrategy;
use adsel_core::marshal::{drivers, ArgumentMarshaler, BiddingSignals, CallingConvention};
use adsel_core::parse::{self, BidParseOptions, ParsedBid};
use adsel_core::{
    AdData, AdSelectionConfig, AuctionConfig, AuctionError, BidResult, CustomAudience,
    CustomAudienceSignals, ScriptFailure, Signals, Stage,
};
use futures::future::join_all;
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::deadline::Deadline;
use crate::fetch::{FetchCache, FetchError};
use crate::metrics::ExecutionLogger;
use crate::sandbox::SandboxPool;
use crate::store::AdSelectionStore;

/// Query parameter listing trusted bidding signal keys.
pub const TRUSTED_BIDDING_KEYS_PARAM: &str = "keys";

/// A buyer bidding script and its declared version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiddingScript {
    /// Script source.
    pub text: String,
    /// Version declared by the fetch side channel or override, if any.
    pub version: Option<u64>,
}

impl BiddingScript {
    /// A script with no declared version.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            version: None,
        }
    }

    /// Sets the declared version.
    #[must_use]
    pub const fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }
}

/// A bid together with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct AdBiddingOutcome {
    /// The bid.
    pub bid: BidResult,
    /// Audience that produced it.
    pub custom_audience: CustomAudienceSignals,
    /// Where the bidding logic was loaded from.
    pub bidding_logic_uri: Url,
}

// =============================================================================
// BidGenerator
// =============================================================================

/// Bid generation orchestrator.
#[derive(Debug, Clone)]
pub struct BidGenerator {
    sandbox: SandboxPool,
    marshaler: ArgumentMarshaler,
    debug_reporting: Arc<dyn DebugReportingStrategy>,
    parse_options: BidParseOptions,
    best_bid_only: bool,
    fetch_timeout: Duration,
    store: Arc<dyn AdSelectionStore>,
    logger: Arc<dyn ExecutionLogger>,
}

impl BidGenerator {
    /// Creates a generator with strategies selected by `config`.
    #[must_use]
    pub fn new(
        sandbox: SandboxPool,
        config: &AdSelectionConfig,
        store: Arc<dyn AdSelectionStore>,
        logger: Arc<dyn ExecutionLogger>,
    ) -> Self {
        Self {
            sandbox,
            marshaler: ArgumentMarshaler::new(config.counter_key_copier()),
            debug_reporting: config.debug_reporting_strategy(),
            parse_options: config.bid_parse_options(),
            best_bid_only: config.features.best_bid_per_custom_audience,
            fetch_timeout: config.timeouts.fetch,
            store,
            logger,
        }
    }

    /// Generates bids for `candidates` with `script`.
    ///
    /// Returns an empty list when every candidate is excluded.
    ///
    /// # Errors
    ///
    /// - [`AuctionError::Script`] for reference errors, a missing
    ///   `generateBid`, sandbox unavailability, or a whole-audience result
    ///   with more than one bid
    /// - [`AuctionError::Timeout`] if `deadline` passes first
    #[instrument(skip_all, fields(candidates = candidates.len(), version = ?script.version))]
    pub async fn generate_bids(
        &self,
        script: &BiddingScript,
        candidates: &[AdData],
        signals: &BiddingSignals,
        deadline: Deadline,
    ) -> Result<Vec<BidResult>, AuctionError> {
        let work = async {
            let convention = match CallingConvention::from_version(script.version) {
                Some(convention) => convention,
                None => self.probe_convention(&script.text).await?,
            };
            debug!(convention = convention.as_str(), "resolved calling convention");
            if convention == CallingConvention::WholeAudience {
                self.generate_whole_audience(script, candidates, signals, deadline)
                    .await
            } else {
                self.generate_per_candidate(script, convention, candidates, signals, deadline)
                    .await
            }
        };
        deadline
            .run(work)
            .await
            .unwrap_or(Err(AuctionError::stage_timeout(Stage::Bidding)))
    }

    async fn probe_convention(&self, script: &str) -> Result<CallingConvention, AuctionError> {
        let arity = self
            .sandbox
            .arg_count(script, drivers::GENERATE_BID)
            .await
            .map_err(bidding_failure)?;
        CallingConvention::from_arity(arity).ok_or_else(|| {
            AuctionError::script(
                Stage::Bidding,
                ScriptFailure::reference(format!("{} is not defined", drivers::GENERATE_BID)),
            )
        })
    }

    async fn generate_per_candidate(
        &self,
        script: &BiddingScript,
        convention: CallingConvention,
        candidates: &[AdData],
        signals: &BiddingSignals,
        deadline: Deadline,
    ) -> Result<Vec<BidResult>, AuctionError> {
        let calls = candidates.iter().map(|ad| async move {
            let args = self.marshaler.bid_arguments(convention, ad, signals);
            self.sandbox
                .run(&script.text, drivers::GENERATE_BID, &args, deadline)
                .await
        });
        let outcomes = join_all(calls).await;

        let mut bids = Vec::with_capacity(candidates.len());
        for (ad, outcome) in candidates.iter().zip(outcomes) {
            let Some(raw) = self.soft_script_outcome(outcome)? else {
                continue;
            };
            match parse::parse_bid_output(&raw, self.parse_options) {
                Ok(parsed) => bids.push(self.bid_result(parsed, candidates)),
                Err(reason) => {
                    debug!(render_uri = %ad.render_uri, %reason, "candidate excluded");
                    self.logger.item_excluded(Stage::Bidding, reason.kind());
                },
            }
        }
        Ok(bids)
    }

    async fn generate_whole_audience(
        &self,
        script: &BiddingScript,
        candidates: &[AdData],
        signals: &BiddingSignals,
        deadline: Deadline,
    ) -> Result<Vec<BidResult>, AuctionError> {
        let program = drivers::wrap(&script.text, drivers::GENERATE_BID_V3_DRIVER);
        let args = self.marshaler.whole_audience_arguments(candidates, signals);
        let outcome = self
            .sandbox
            .run(&program, drivers::GENERATE_BID_V3_ENTRY, &args, deadline)
            .await;
        let Some(raw) = self.soft_script_outcome(outcome)? else {
            return Ok(Vec::new());
        };
        let batch = match parse::parse_batch(&raw) {
            Ok(batch) => batch,
            Err(failure @ ScriptFailure::MalformedOutput { .. }) => {
                self.logger.item_excluded(Stage::Bidding, failure.kind());
                return Ok(Vec::new());
            },
            Err(failure) => return Err(bidding_failure(failure)),
        };
        if !batch.is_success() {
            debug!(status = ?batch.status, "whole-audience bid excluded");
            self.logger.item_excluded(Stage::Bidding, "non_zero_status");
            return Ok(Vec::new());
        }
        if batch.results.len() > 1 {
            return Err(AuctionError::script(
                Stage::Bidding,
                ScriptFailure::semantic(format!(
                    "whole-audience generateBid returned {} bids, expected at most one",
                    batch.results.len()
                )),
            ));
        }
        let Some(item) = batch.results.first() else {
            return Ok(Vec::new());
        };
        match parse::parse_whole_audience_item(item, self.parse_options) {
            Ok(parsed) => Ok(vec![self.bid_result(parsed, candidates)]),
            Err(reason) => {
                debug!(%reason, "whole-audience bid excluded");
                self.logger.item_excluded(Stage::Bidding, reason.kind());
                Ok(Vec::new())
            },
        }
    }

    /// Splits one invocation's failure into an exclusion (`Ok(None)`) or a
    /// hard failure. Only malformed output is excluded.
    fn soft_script_outcome(
        &self,
        outcome: Result<String, ScriptFailure>,
    ) -> Result<Option<String>, AuctionError> {
        match outcome {
            Ok(raw) => Ok(Some(raw)),
            Err(failure @ ScriptFailure::MalformedOutput { .. }) => {
                debug!(error = %failure, "bidding invocation excluded");
                self.logger.item_excluded(Stage::Bidding, failure.kind());
                Ok(None)
            },
            Err(failure) => Err(bidding_failure(failure)),
        }
    }

    fn bid_result(&self, parsed: ParsedBid, candidates: &[AdData]) -> BidResult {
        BidResult {
            ad: self.marshaler.copier().restore(parsed.ad, candidates),
            bid: parsed.bid,
            ad_cost: parsed.ad_cost,
            debug_reports: self.debug_reporting.resolve(&parsed.debug),
        }
    }

    // =========================================================================
    // Per-audience orchestration
    // =========================================================================

    /// Resolves inputs for `audience` and generates its bids.
    ///
    /// Uses the caller's audience override when developer options are
    /// enabled, otherwise fetches bidding logic and trusted bidding signals
    /// concurrently through `cache`.
    ///
    /// # Errors
    ///
    /// - [`AuctionError::MissingBiddingLogic`] or
    ///   [`AuctionError::MissingTrustedBiddingSignals`] if inputs cannot be
    ///   fetched
    /// - [`AuctionError::Timeout`] if either fetch runs out of time
    /// - anything [`Self::generate_bids`] returns
    #[instrument(skip_all, fields(buyer = %audience.buyer, name = %audience.name))]
    pub async fn run_bidding_for_custom_audience(
        &self,
        audience: &CustomAudience,
        config: &AuctionConfig,
        contextual_signals: &Signals,
        cache: &FetchCache,
        deadline: Deadline,
    ) -> Result<Vec<AdBiddingOutcome>, AuctionError> {
        let (script, trusted_bidding_signals) =
            self.resolve_inputs(audience, cache, deadline).await?;
        let signals = BiddingSignals {
            auction_signals: config.auction_signals.clone(),
            per_buyer_signals: config.per_buyer_signals_for(&audience.buyer),
            trusted_bidding_signals,
            contextual_signals: contextual_signals.clone(),
            custom_audience: audience.signals(),
        };
        let mut bids = self
            .generate_bids(&script, &audience.ads, &signals, deadline)
            .await?;
        if self.best_bid_only {
            bids = best_bid(bids).into_iter().collect();
        }
        debug!(bids = bids.len(), "audience bidding finished");
        Ok(bids
            .into_iter()
            .map(|bid| AdBiddingOutcome {
                bid,
                custom_audience: signals.custom_audience.clone(),
                bidding_logic_uri: audience.bidding_logic_uri.clone(),
            })
            .collect())
    }

    async fn resolve_inputs(
        &self,
        audience: &CustomAudience,
        cache: &FetchCache,
        deadline: Deadline,
    ) -> Result<(BiddingScript, Signals), AuctionError> {
        let dev = cache.dev_context();
        if dev.dev_options_enabled {
            let found = self
                .store
                .fetch_custom_audience_override(
                    &audience.owner,
                    &audience.buyer,
                    &audience.name,
                    &dev.caller,
                )
                .await
                .map_err(|e| AuctionError::Storage {
                    stage: Stage::Bidding,
                    reason: e.to_string(),
                })?;
            if let Some(found) = found {
                debug!("using custom audience override");
                let script = BiddingScript {
                    text: found.bidding_logic,
                    version: found.bidding_logic_version,
                };
                return Ok((script, found.trusted_bidding_signals));
            }
        }

        let fetch_deadline = deadline.child(self.fetch_timeout);
        let (logic, signals) = tokio::join!(
            cache.get(&audience.bidding_logic_uri, fetch_deadline),
            self.fetch_trusted_bidding_signals(audience, cache, fetch_deadline)
        );
        let logic = match logic {
            Ok(logic) => logic,
            Err(FetchError::Timeout { .. }) => {
                return Err(AuctionError::stage_timeout(Stage::Bidding))
            },
            Err(e) => {
                warn!(uri = %audience.bidding_logic_uri, error = %e, "bidding logic unavailable");
                return Err(AuctionError::MissingBiddingLogic {
                    buyer: audience.buyer.clone(),
                    reason: e.to_string(),
                });
            },
        };
        let signals = signals?;
        Ok((
            BiddingScript {
                text: logic.body,
                version: logic.version,
            },
            signals,
        ))
    }

    async fn fetch_trusted_bidding_signals(
        &self,
        audience: &CustomAudience,
        cache: &FetchCache,
        deadline: Deadline,
    ) -> Result<Signals, AuctionError> {
        let Some(data) = &audience.trusted_bidding_data else {
            return Ok(Signals::empty());
        };
        let missing = |reason: String| AuctionError::MissingTrustedBiddingSignals {
            buyer: audience.buyer.clone(),
            reason,
        };
        let uri = trusted_bidding_uri(&data.uri, &data.keys);
        let response = match cache.get(&uri, deadline).await {
            Ok(response) => response,
            Err(FetchError::Timeout { .. }) => {
                return Err(AuctionError::stage_timeout(Stage::Bidding))
            },
            Err(e) => {
                warn!(%uri, error = %e, "trusted bidding signals unavailable");
                return Err(missing(e.to_string()));
            },
        };
        let body: Value = serde_json::from_str(&response.body)
            .map_err(|e| missing(format!("response is not JSON: {e}")))?;
        Ok(select_keys(&body, &data.keys))
    }
}

/// Appends the audience's keys to the trusted bidding signals endpoint.
#[must_use]
pub fn trusted_bidding_uri(base: &Url, keys: &[String]) -> Url {
    let mut uri = base.clone();
    if !keys.is_empty() {
        uri.query_pairs_mut()
            .append_pair(TRUSTED_BIDDING_KEYS_PARAM, &keys.join(","));
    }
    uri
}

/// Keeps only `keys` from a trusted signals object; non-objects pass through.
fn select_keys(body: &Value, keys: &[String]) -> Signals {
    let Value::Object(all) = body else {
        return Signals::from_value(body.clone());
    };
    let selected: Map<String, Value> = keys
        .iter()
        .filter_map(|key| all.get(key).map(|value| (key.clone(), value.clone())))
        .collect();
    Signals::from_value(Value::Object(selected))
}

/// The highest bid; ties keep the earliest.
fn best_bid(bids: Vec<BidResult>) -> Option<BidResult> {
    bids.into_iter()
        .reduce(|best, bid| if bid.bid > best.bid { bid } else { best })
}

fn bidding_failure(failure: ScriptFailure) -> AuctionError {
    AuctionError::script(Stage::Bidding, failure)
}
