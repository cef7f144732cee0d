//! Ad scoring.
//!
//! [`ScoreGenerator::score_ads`] runs the seller's `scoreAd` over a bid list
//! in one batch call. Unlike bidding, the batch must account for every
//! submitted bid: fewer results than bids fails the call with
//! [`AuctionError::InsufficientScoreCount`]. Individual results with a bad
//! status or score are still excluded without failing the call.
//!
//! [`ScoreGenerator::run_ad_scoring`] assembles the submission (remarketing
//! bids first, then signed contextual bids by buyer), resolves the decision
//! logic and trusted scoring signals, and routes buyers with a developer
//! per-buyer override through their own scoring call.

use std::sync::Arc;
use std::time::Duration;

use adsel_core::debug::DebugReportingStrategy;
use adsel_core::marshal::{drivers, ArgumentMarshaler, ScoringSignals};
use adsel_core::parse;
use adsel_core::{
    AdSelectionConfig, AdTechIdentifier, AuctionConfig, AuctionError, BidResult, BidSource,
    DebugReportUris, ScoreResult, Signals, Stage,
};
use futures::future::try_join_all;
use serde_json::json;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::bidding::AdBiddingOutcome;
use crate::deadline::Deadline;
use crate::fetch::{FetchCache, FetchError};
use crate::metrics::ExecutionLogger;
use crate::sandbox::SandboxPool;
use crate::store::AdSelectionStore;

/// Query parameter listing the render URIs being scored.
pub const RENDER_URIS_PARAM: &str = "renderUris";

/// Key of the data version in seller contextual signals.
pub const DATA_VERSION_KEY: &str = "dataVersion";

/// A bid submitted for scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringCandidate {
    /// The bid.
    pub bid: BidResult,
    /// Where it came from.
    pub source: BidSource,
}

impl ScoringCandidate {
    /// A remarketing bid from on-device bidding.
    #[must_use]
    pub fn remarketing(outcome: AdBiddingOutcome) -> Self {
        Self {
            bid: outcome.bid,
            source: BidSource::CustomAudience(outcome.custom_audience),
        }
    }

    const fn is_contextual(&self) -> bool {
        matches!(self.source, BidSource::Contextual { .. })
    }
}

/// Seller inputs for one scoring run.
struct SellerInputs {
    decision_logic: String,
    trusted_scoring_signals: Signals,
    data_version: Option<u32>,
}

// =============================================================================
// ScoreGenerator
// =============================================================================

/// Score generation orchestrator.
#[derive(Debug, Clone)]
pub struct ScoreGenerator {
    sandbox: SandboxPool,
    debug_reporting: Arc<dyn DebugReportingStrategy>,
    data_version_header: bool,
    fetch_timeout: Duration,
    store: Arc<dyn AdSelectionStore>,
    logger: Arc<dyn ExecutionLogger>,
}

impl ScoreGenerator {
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
            debug_reporting: config.debug_reporting_strategy(),
            data_version_header: config.features.data_version_header,
            fetch_timeout: config.timeouts.fetch,
            store,
            logger,
        }
    }

    /// Scores `candidates` with `script` in one call.
    ///
    /// Results carry the candidate's position as `submission_index`.
    ///
    /// # Errors
    ///
    /// - [`AuctionError::Script`] if the scoring call fails
    /// - [`AuctionError::InsufficientScoreCount`] if fewer results than
    ///   candidates come back
    /// - [`AuctionError::Timeout`] if `deadline` passes first
    #[instrument(skip_all, fields(bids = candidates.len()))]
    pub async fn score_ads(
        &self,
        script: &str,
        candidates: &[ScoringCandidate],
        config: &AuctionConfig,
        signals: &ScoringSignals,
        deadline: Deadline,
    ) -> Result<Vec<ScoreResult>, AuctionError> {
        let batch: Vec<(usize, &ScoringCandidate)> = candidates.iter().enumerate().collect();
        self.score_batch(script, &batch, config, signals, deadline)
            .await
    }

    async fn score_batch(
        &self,
        script: &str,
        batch: &[(usize, &ScoringCandidate)],
        config: &AuctionConfig,
        signals: &ScoringSignals,
        deadline: Deadline,
    ) -> Result<Vec<ScoreResult>, AuctionError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let work = async {
            let program = drivers::wrap(script, drivers::SCORE_ADS_DRIVER);
            let args = ArgumentMarshaler::scoring_arguments(
                batch.iter().map(|(_, c)| (&c.bid.ad, c.bid.bid)),
                config,
                signals,
            );
            let raw = self
                .sandbox
                .run(&program, drivers::SCORE_ADS_ENTRY, &args, deadline)
                .await
                .map_err(|e| AuctionError::script(Stage::Scoring, e))?;
            let output =
                parse::parse_batch(&raw).map_err(|e| AuctionError::script(Stage::Scoring, e))?;
            let results = if output.is_success() {
                output.results
            } else {
                warn!(status = ?output.status, "scoring batch reported failure");
                Vec::new()
            };
            if results.len() < batch.len() {
                return Err(AuctionError::InsufficientScoreCount {
                    expected: batch.len(),
                    actual: results.len(),
                });
            }
            if results.len() > batch.len() {
                warn!(
                    expected = batch.len(),
                    actual = results.len(),
                    "ignoring surplus scores"
                );
            }

            let mut scores = Vec::with_capacity(batch.len());
            for ((index, candidate), item) in batch.iter().zip(&results) {
                match parse::parse_score_item(item) {
                    Ok(parsed) => scores.push(ScoreResult {
                        submission_index: *index,
                        bid: candidate.bid.clone(),
                        source: candidate.source.clone(),
                        score: parsed.score,
                        debug_reports: self.debug_reporting.resolve(&parsed.debug),
                        reject_reason: parsed.reject_reason,
                        seller_contextual_signals: Signals::empty(),
                    }),
                    Err(reason) => {
                        debug!(index, %reason, "score excluded");
                        self.logger.item_excluded(Stage::Scoring, reason.kind());
                    },
                }
            }
            Ok(scores)
        };
        deadline
            .run(work)
            .await
            .unwrap_or(Err(AuctionError::stage_timeout(Stage::Scoring)))
    }

    // =========================================================================
    // Auction-level scoring
    // =========================================================================

    /// Scores remarketing bids together with the config's signed contextual
    /// bids.
    ///
    /// Results are in submission order: remarketing bids in the order given,
    /// then contextual bids by buyer.
    ///
    /// # Errors
    ///
    /// - [`AuctionError::MissingDecisionLogic`] or
    ///   [`AuctionError::MissingTrustedScoringSignals`] if seller inputs
    ///   cannot be fetched
    /// - anything [`Self::score_ads`] returns
    #[instrument(skip_all, fields(seller = %config.seller, remarketing = remarketing.len()))]
    pub async fn run_ad_scoring(
        &self,
        remarketing: Vec<AdBiddingOutcome>,
        config: &AuctionConfig,
        contextual_signals: &Signals,
        cache: &FetchCache,
        deadline: Deadline,
    ) -> Result<Vec<ScoreResult>, AuctionError> {
        let candidates = self.submission(remarketing, config);
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let seller = self.resolve_seller_inputs(&candidates, config, cache, deadline).await?;
        let overrides = self.per_buyer_overrides(&candidates, config, cache).await?;

        let mut main = Vec::new();
        let mut overridden: Vec<(&str, Vec<(usize, &ScoringCandidate)>)> = overrides
            .iter()
            .map(|(_, script)| (script.as_str(), Vec::new()))
            .collect();
        for (index, candidate) in candidates.iter().enumerate() {
            let group = overrides
                .iter()
                .position(|(buyer, _)| {
                    candidate.is_contextual() && candidate.source.buyer() == buyer
                });
            match group {
                Some(group) => overridden[group].1.push((index, candidate)),
                None => main.push((index, candidate)),
            }
        }

        let signals_for = |batch: &[(usize, &ScoringCandidate)]| ScoringSignals {
            seller_signals: config.seller_signals.clone(),
            trusted_scoring_signals: seller.trusted_scoring_signals.clone(),
            contextual_signals: contextual_signals.clone(),
            custom_audience_signals: batch
                .iter()
                .filter_map(|(_, c)| match &c.source {
                    BidSource::CustomAudience(signals) => Some(signals.clone()),
                    BidSource::Contextual { .. } => None,
                })
                .collect(),
        };
        let main_signals = signals_for(&main);
        let overridden_signals: Vec<ScoringSignals> =
            overridden.iter().map(|(_, batch)| signals_for(batch)).collect();

        let main_call = self.score_batch(
            &seller.decision_logic,
            &main,
            config,
            &main_signals,
            deadline,
        );
        let override_calls = try_join_all(overridden.iter().zip(&overridden_signals).map(
            |((script, batch), signals)| self.score_batch(script, batch, config, signals, deadline),
        ));
        let (main_scores, override_scores) = tokio::try_join!(main_call, override_calls)?;

        let mut scores: Vec<ScoreResult> = main_scores
            .into_iter()
            .chain(override_scores.into_iter().flatten())
            .collect();
        scores.sort_by_key(|score| score.submission_index);

        if let Some(version) = seller.data_version.filter(|_| self.data_version_header) {
            let signals = Signals::from_value(json!({ DATA_VERSION_KEY: version }));
            for score in &mut scores {
                score.seller_contextual_signals = signals.clone();
            }
        }
        debug!(scores = scores.len(), "scoring finished");
        Ok(scores)
    }

    /// Remarketing bids first, then positive contextual bids by buyer.
    fn submission(
        &self,
        remarketing: Vec<AdBiddingOutcome>,
        config: &AuctionConfig,
    ) -> Vec<ScoringCandidate> {
        let mut candidates: Vec<ScoringCandidate> = remarketing
            .into_iter()
            .map(ScoringCandidate::remarketing)
            .collect();
        for (buyer, bundle) in &config.per_buyer_signed_contextual_ads {
            for ad_with_bid in &bundle.ads_with_bid {
                if ad_with_bid.bid.is_nan() || ad_with_bid.bid <= 0.0 {
                    debug!(%buyer, bid = ad_with_bid.bid, "contextual bid excluded");
                    self.logger.item_excluded(Stage::Scoring, "non_positive_bid");
                    continue;
                }
                candidates.push(ScoringCandidate {
                    bid: BidResult {
                        ad: ad_with_bid.ad.clone(),
                        bid: ad_with_bid.bid,
                        ad_cost: None,
                        debug_reports: DebugReportUris::empty(),
                    },
                    source: BidSource::Contextual {
                        buyer: buyer.clone(),
                    },
                });
            }
        }
        candidates
    }

    async fn resolve_seller_inputs(
        &self,
        candidates: &[ScoringCandidate],
        config: &AuctionConfig,
        cache: &FetchCache,
        deadline: Deadline,
    ) -> Result<SellerInputs, AuctionError> {
        let dev = cache.dev_context();
        if dev.dev_options_enabled {
            let found = self
                .store
                .fetch_dev_override(&config.id(), &dev.caller)
                .await
                .map_err(|e| storage_error(&e))?;
            if let Some(found) = found {
                debug!("using decision logic override");
                return Ok(SellerInputs {
                    decision_logic: found.decision_logic,
                    trusted_scoring_signals: found.trusted_scoring_signals,
                    data_version: None,
                });
            }
        }

        let fetch_deadline = deadline.child(self.fetch_timeout);
        let signals_uri = trusted_scoring_uri(
            &config.trusted_scoring_signals_uri,
            candidates.iter().map(|c| &c.bid.ad.render_uri),
        );
        let (logic, signals) = tokio::join!(
            cache.get(&config.decision_logic_uri, fetch_deadline),
            cache.get(&signals_uri, fetch_deadline)
        );

        let logic = match logic {
            Ok(logic) => logic,
            Err(FetchError::Timeout { .. }) => {
                return Err(AuctionError::stage_timeout(Stage::Scoring))
            },
            Err(e) => {
                warn!(uri = %config.decision_logic_uri, error = %e, "decision logic unavailable");
                return Err(AuctionError::MissingDecisionLogic {
                    stage: Stage::Scoring,
                    reason: e.to_string(),
                });
            },
        };
        let signals = match signals {
            Ok(signals) => signals,
            Err(FetchError::Timeout { .. }) => {
                return Err(AuctionError::stage_timeout(Stage::Scoring))
            },
            Err(e) => {
                warn!(uri = %signals_uri, error = %e, "trusted scoring signals unavailable");
                return Err(AuctionError::MissingTrustedScoringSignals {
                    reason: e.to_string(),
                });
            },
        };
        let trusted_scoring_signals = Signals::from_json_str(&signals.body).map_err(|e| {
            AuctionError::MissingTrustedScoringSignals {
                reason: format!("response is not JSON: {e}"),
            }
        })?;
        Ok(SellerInputs {
            decision_logic: logic.body,
            trusted_scoring_signals,
            data_version: signals.data_version,
        })
    }

    /// Per-buyer decision logic overrides for the contextual buyers present.
    async fn per_buyer_overrides(
        &self,
        candidates: &[ScoringCandidate],
        config: &AuctionConfig,
        cache: &FetchCache,
    ) -> Result<Vec<(AdTechIdentifier, String)>, AuctionError> {
        let dev = cache.dev_context();
        if !dev.dev_options_enabled {
            return Ok(Vec::new());
        }
        let config_id = config.id();
        let mut overrides = Vec::new();
        for buyer in config.per_buyer_signed_contextual_ads.keys() {
            let present = candidates
                .iter()
                .any(|c| c.is_contextual() && c.source.buyer() == buyer);
            if !present {
                continue;
            }
            let found = self
                .store
                .fetch_per_buyer_override(&config_id, buyer, &dev.caller)
                .await
                .map_err(|e| storage_error(&e))?;
            if let Some(script) = found {
                debug!(%buyer, "using per-buyer decision logic override");
                overrides.push((buyer.clone(), script));
            }
        }
        Ok(overrides)
    }
}

fn storage_error(error: &impl std::fmt::Display) -> AuctionError {
    AuctionError::Storage {
        stage: Stage::Scoring,
        reason: error.to_string(),
    }
}

/// Appends the render URIs being scored to the trusted scoring signals
/// endpoint.
#[must_use]
pub fn trusted_scoring_uri<'a>(base: &Url, render_uris: impl IntoIterator<Item = &'a Url>) -> Url {
    let joined = render_uris
        .into_iter()
        .map(Url::as_str)
        .collect::<Vec<_>>()
        .join(",");
    let mut uri = base.clone();
    if !joined.is_empty() {
        uri.query_pairs_mut().append_pair(RENDER_URIS_PARAM, &joined);
    }
    uri
}
