//! Auction coordination.
//!
//! [`AuctionCoordinator`] drives one auction through
//! `Init → FetchingInputs → Bidding → Scoring → Selecting → Completed`,
//! moving to `Failed` from any stage on a hard error. There is no partial
//! success: results of completed stages are dropped when a later stage
//! fails.
//!
//! `FetchingInputs` validates the request and picks the participating
//! audiences. Nothing is fetched eagerly for buyers: each audience fetches
//! its bidding logic and trusted signals through the per-auction
//! [`FetchCache`] when it starts bidding, and the seller's decision logic is
//! warmed into the same cache alongside bidding.
//!
//! # Deadlines
//!
//! The whole auction runs under the overall deadline. Each custom audience
//! bids under its own child deadline and scoring under another; a child
//! timeout surfaces as a stage timeout unless the overall deadline had
//! expired by then.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use adsel_core::debug::finalize_debug_reports;
use adsel_core::{
    AdSelectionConfig, AdSelectionFailure, AdSelectionId, AuctionConfig, AuctionError,
    BidSource, CustomAudience, ScoreResult, ScriptRunner, Signals, Stage, TimeoutScope,
};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::bidding::{AdBiddingOutcome, BidGenerator};
use crate::deadline::Deadline;
use crate::fetch::{DevContext, FetchCache, Fetcher};
use crate::metrics::{ExecutionLogger, NoopExecutionLogger, OUTCOME_SUCCESS};
use crate::sandbox::SandboxPool;
use crate::scoring::ScoreGenerator;
use crate::store::{AdSelectionStore, BidHistoryRecord};

/// Maximum number of custom audiences accepted in one request.
pub const MAX_CUSTOM_AUDIENCES: usize = 1000;

// =============================================================================
// Request and outcome
// =============================================================================

/// Everything one auction needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdSelectionRequest {
    /// Seller configuration.
    pub config: AuctionConfig,
    /// The device's custom audiences; inactive or empty ones are skipped.
    #[serde(default)]
    pub custom_audiences: Vec<CustomAudience>,
    /// Contextual signals shared with buyers and the seller.
    #[serde(default)]
    pub contextual_signals: Signals,
    /// Calling package or principal.
    pub caller: String,
}

/// The public result of a successful auction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdSelectionOutcome {
    /// Id under which the winner was persisted.
    pub ad_selection_id: AdSelectionId,
    /// Winning render URI.
    pub render_uri: Url,
    /// Winning bid.
    pub bid: f64,
}

/// Full diagnostic record of a completed auction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuctionReport {
    /// Public outcome.
    pub outcome: AdSelectionOutcome,
    /// Winning score.
    pub winner: ScoreResult,
    /// Every surviving score in submission order.
    pub scores: Vec<ScoreResult>,
    /// Finalized debug report URLs.
    pub debug_reports: Vec<Url>,
    /// States visited, `Init` first.
    pub states: Vec<AuctionState>,
}

// =============================================================================
// AuctionState
// =============================================================================

/// Lifecycle of one auction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuctionState {
    /// Not started.
    Init,
    /// Validating the request and choosing participating audiences.
    /// Fetches are issued on demand by the stages that need them.
    FetchingInputs,
    /// Buyers are bidding.
    Bidding,
    /// The seller is scoring.
    Scoring,
    /// Picking and persisting the winner.
    Selecting,
    /// A winner was selected and persisted.
    Completed,
    /// A stage failed.
    Failed,
}

impl AuctionState {
    /// Returns `true` if no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns the state as a string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::FetchingInputs => "fetching_inputs",
            Self::Bidding => "bidding",
            Self::Scoring => "scoring",
            Self::Selecting => "selecting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Returns the valid transitions from this state.
    #[must_use]
    pub const fn valid_transitions(&self) -> &'static [Self] {
        match self {
            Self::Init => &[Self::FetchingInputs, Self::Failed],
            Self::FetchingInputs => &[Self::Bidding, Self::Failed],
            Self::Bidding => &[Self::Scoring, Self::Failed],
            Self::Scoring => &[Self::Selecting, Self::Failed],
            Self::Selecting => &[Self::Completed, Self::Failed],
            Self::Completed | Self::Failed => &[],
        }
    }

    /// Returns `true` if transitioning to `target` is valid from this state.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        self.valid_transitions().contains(&target)
    }

    /// The pipeline stage run in this state, if any.
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::FetchingInputs => Some(Stage::FetchingInputs),
            Self::Bidding => Some(Stage::Bidding),
            Self::Scoring => Some(Stage::Scoring),
            Self::Selecting => Some(Stage::Selecting),
            Self::Init | Self::Completed | Self::Failed => None,
        }
    }
}

impl fmt::Display for AuctionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records the states one auction visits.
#[derive(Debug)]
struct StateTracker {
    history: Vec<AuctionState>,
}

impl StateTracker {
    fn new() -> Self {
        Self {
            history: vec![AuctionState::Init],
        }
    }

    fn current(&self) -> AuctionState {
        self.history
            .last()
            .copied()
            .unwrap_or(AuctionState::Init)
    }

    fn advance(&mut self, target: AuctionState) {
        let current = self.current();
        if !current.can_transition_to(target) {
            warn!(from = %current, to = %target, "ignoring invalid auction transition");
            return;
        }
        debug!(from = %current, to = %target, "auction transition");
        self.history.push(target);
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Wall-clock source for audience activation and record timestamps.
pub trait Clock: Send + Sync + fmt::Debug {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// =============================================================================
// AuctionCoordinator
// =============================================================================

/// Runs auctions end to end.
#[derive(Debug, Clone)]
pub struct AuctionCoordinator {
    config: AdSelectionConfig,
    sandbox: SandboxPool,
    bidder: BidGenerator,
    scorer: ScoreGenerator,
    fetcher: Arc<dyn Fetcher>,
    fetch_permits: Arc<Semaphore>,
    bidding_permits: Arc<Semaphore>,
    store: Arc<dyn AdSelectionStore>,
    logger: Arc<dyn ExecutionLogger>,
    clock: Arc<dyn Clock>,
}

impl AuctionCoordinator {
    /// Creates a coordinator with a no-op logger and the system clock.
    #[must_use]
    pub fn new(
        config: AdSelectionConfig,
        runner: Arc<dyn ScriptRunner>,
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn AdSelectionStore>,
    ) -> Self {
        let sandbox = SandboxPool::new(
            runner,
            config.concurrency.max_concurrent_scripts,
            config.sandbox.retry.clone(),
        );
        let logger: Arc<dyn ExecutionLogger> = Arc::new(NoopExecutionLogger);
        Self {
            bidder: BidGenerator::new(sandbox.clone(), &config, store.clone(), logger.clone()),
            scorer: ScoreGenerator::new(sandbox.clone(), &config, store.clone(), logger.clone()),
            fetch_permits: Arc::new(Semaphore::new(config.concurrency.max_concurrent_fetches)),
            bidding_permits: Arc::new(Semaphore::new(config.concurrency.max_concurrent_bidding)),
            sandbox,
            fetcher,
            store,
            logger,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Reports stage timings and exclusions to `logger`.
    #[must_use]
    pub fn with_logger(mut self, logger: Arc<dyn ExecutionLogger>) -> Self {
        self.bidder = BidGenerator::new(
            self.sandbox.clone(),
            &self.config,
            self.store.clone(),
            logger.clone(),
        );
        self.scorer = ScoreGenerator::new(
            self.sandbox.clone(),
            &self.config,
            self.store.clone(),
            logger.clone(),
        );
        self.logger = logger;
        self
    }

    /// Uses `clock` for activation checks and timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &AdSelectionConfig {
        &self.config
    }

    /// Runs an auction and returns only the public outcome.
    ///
    /// # Errors
    ///
    /// Returns [`AdSelectionFailure::Internal`] for every failure; the cause
    /// is logged.
    pub async fn select_ads(
        &self,
        request: &AdSelectionRequest,
    ) -> Result<AdSelectionOutcome, AdSelectionFailure> {
        match self.run_auction(request).await {
            Ok(report) => Ok(report.outcome),
            Err(e) => {
                warn!(
                    kind = e.kind(),
                    stage = ?e.stage(),
                    error = %e,
                    "ad selection failed"
                );
                Err(e.into())
            },
        }
    }

    /// Runs an auction and returns the full report.
    ///
    /// # Errors
    ///
    /// Returns the [`AuctionError`] that failed the auction. A stage timeout
    /// observed after the overall deadline expired is reported as an overall
    /// timeout.
    #[instrument(skip_all, fields(seller = %request.config.seller, caller = %request.caller))]
    pub async fn run_auction(
        &self,
        request: &AdSelectionRequest,
    ) -> Result<AuctionReport, AuctionError> {
        let overall = Deadline::after(self.config.timeouts.overall);
        let mut tracker = StateTracker::new();
        let result = overall
            .run(self.run_stages(request, overall, &mut tracker))
            .await
            .unwrap_or(Err(AuctionError::Timeout {
                scope: TimeoutScope::Overall,
            }));
        match result {
            Ok(mut report) => {
                tracker.advance(AuctionState::Completed);
                report.states = tracker.history;
                info!(
                    ad_selection_id = %report.outcome.ad_selection_id,
                    bid = report.outcome.bid,
                    "auction completed"
                );
                Ok(report)
            },
            Err(e) => {
                let failed_in = tracker.current();
                tracker.advance(AuctionState::Failed);
                let e = if overall.is_expired() {
                    e.into_overall_timeout()
                } else {
                    e
                };
                debug!(state = %failed_in, error = %e, "auction failed");
                Err(e)
            },
        }
    }

    async fn run_stages(
        &self,
        request: &AdSelectionRequest,
        overall: Deadline,
        tracker: &mut StateTracker,
    ) -> Result<AuctionReport, AuctionError> {
        let config = &request.config;
        let dev = DevContext::new(request.caller.clone(), self.config.features.dev_options);
        let cache = FetchCache::new(self.fetcher.clone(), self.fetch_permits.clone(), dev);

        let audiences = self
            .stage(tracker, AuctionState::FetchingInputs, async {
                self.participating_audiences(request)
            })
            .await?;

        let warm_decision_logic = async {
            if !self.config.features.dev_options {
                let deadline = overall.child(self.config.timeouts.fetch);
                if let Err(e) = cache.get(&config.decision_logic_uri, deadline).await {
                    debug!(error = %e, "decision logic prefetch failed");
                }
            }
        };
        let bidding = self.stage(
            tracker,
            AuctionState::Bidding,
            self.run_bidding(&audiences, request, &cache, overall),
        );
        let (bids, ()) = tokio::join!(bidding, warm_decision_logic);
        let bids = bids?;

        if bids.is_empty() && !has_contextual_bids(config) {
            return Err(AuctionError::NoWinner {
                stage: Stage::Bidding,
            });
        }
        let bidding_logic: Vec<Url> = bids.iter().map(|b| b.bidding_logic_uri.clone()).collect();

        let scoring_deadline = overall.child(self.config.timeouts.scoring);
        let scores = self
            .stage(
                tracker,
                AuctionState::Scoring,
                self.scorer.run_ad_scoring(
                    bids,
                    config,
                    &request.contextual_signals,
                    &cache,
                    scoring_deadline,
                ),
            )
            .await?;

        self.stage(tracker, AuctionState::Selecting, async {
            self.select_winner(config, scores, &bidding_logic).await
        })
        .await
    }

    /// Runs `work` as the stage of `state`, reporting to the logger.
    async fn stage<T, F>(
        &self,
        tracker: &mut StateTracker,
        state: AuctionState,
        work: F,
    ) -> Result<T, AuctionError>
    where
        F: Future<Output = Result<T, AuctionError>>,
    {
        tracker.advance(state);
        let stage = state.stage().unwrap_or(Stage::FetchingInputs);
        let started = Instant::now();
        self.logger.stage_started(stage, started);
        let result = work.await;
        let outcome = match &result {
            Ok(_) => OUTCOME_SUCCESS,
            Err(e) => e.kind(),
        };
        self.logger
            .stage_ended(stage, started, Instant::now(), outcome);
        result
    }

    /// Validates the request and returns the audiences that may bid, ordered
    /// by buyer participation order.
    fn participating_audiences<'a>(
        &self,
        request: &'a AdSelectionRequest,
    ) -> Result<Vec<&'a CustomAudience>, AuctionError> {
        if request.caller.is_empty() {
            return Err(AuctionError::InvalidInput {
                reason: "caller is empty".to_string(),
            });
        }
        if request.config.seller.as_str().is_empty() {
            return Err(AuctionError::InvalidInput {
                reason: "seller is empty".to_string(),
            });
        }
        if request.custom_audiences.len() > MAX_CUSTOM_AUDIENCES {
            return Err(AuctionError::InvalidInput {
                reason: format!(
                    "{} custom audiences exceed the limit of {MAX_CUSTOM_AUDIENCES}",
                    request.custom_audiences.len()
                ),
            });
        }

        let now = self.clock.now();
        let buyers = &request.config.custom_audience_buyers;
        let mut audiences: Vec<(usize, &CustomAudience)> = request
            .custom_audiences
            .iter()
            .filter(|audience| {
                let eligible = audience.is_active_at(now) && !audience.ads.is_empty();
                if !eligible {
                    debug!(buyer = %audience.buyer, name = %audience.name, "audience skipped");
                }
                eligible
            })
            .filter_map(|audience| {
                buyers
                    .iter()
                    .position(|buyer| *buyer == audience.buyer)
                    .map(|rank| (rank, audience))
            })
            .collect();
        audiences.sort_by_key(|(rank, _)| *rank);
        debug!(participating = audiences.len(), "audiences resolved");
        Ok(audiences.into_iter().map(|(_, audience)| audience).collect())
    }

    async fn run_bidding(
        &self,
        audiences: &[&CustomAudience],
        request: &AdSelectionRequest,
        cache: &FetchCache,
        overall: Deadline,
    ) -> Result<Vec<AdBiddingOutcome>, AuctionError> {
        let per_audience = audiences.iter().map(|audience| async move {
            let _permit = self.bidding_permits.acquire().await.map_err(|_| {
                AuctionError::InvalidInput {
                    reason: "bidding pool closed".to_string(),
                }
            })?;
            let deadline = overall.child(self.config.timeouts.bidding_per_custom_audience);
            self.bidder
                .run_bidding_for_custom_audience(
                    audience,
                    &request.config,
                    &request.contextual_signals,
                    cache,
                    deadline,
                )
                .await
        });
        let bids: Vec<AdBiddingOutcome> = try_join_all(per_audience)
            .await?
            .into_iter()
            .flatten()
            .collect();
        debug!(bids = bids.len(), "bidding finished");
        Ok(bids)
    }

    async fn select_winner(
        &self,
        config: &AuctionConfig,
        scores: Vec<ScoreResult>,
        bidding_logic: &[Url],
    ) -> Result<AuctionReport, AuctionError> {
        let winner_index = select_highest_score(&scores).ok_or(AuctionError::NoWinner {
            stage: Stage::Selecting,
        })?;
        let winner = scores[winner_index].clone();
        let debug_reports = finalize_debug_reports(&config.seller, &scores, Some(winner_index));

        let ad_selection_id = AdSelectionId::new(rand::thread_rng().gen_range(1..=u64::MAX));
        let logic_uri = match &winner.source {
            BidSource::CustomAudience(_) => bidding_logic.get(winner.submission_index).cloned(),
            BidSource::Contextual { buyer } => config
                .per_buyer_signed_contextual_ads
                .get(buyer)
                .map(|bundle| bundle.decision_logic_uri.clone()),
        }
        .unwrap_or_else(|| config.decision_logic_uri.clone());
        let record = BidHistoryRecord {
            ad_selection_id,
            custom_audience: match &winner.source {
                BidSource::CustomAudience(signals) => Some(signals.clone()),
                BidSource::Contextual { .. } => None,
            },
            buyer: winner.source.buyer().clone(),
            bid: winner.bid.bid,
            render_uri: winner.bid.ad.render_uri.clone(),
            bidding_logic_uri: logic_uri,
            seller: config.seller.clone(),
            created_at: self.clock.now(),
        };
        self.store
            .persist_bid_history(record)
            .await
            .map_err(|e| AuctionError::Storage {
                stage: Stage::Selecting,
                reason: e.to_string(),
            })?;

        Ok(AuctionReport {
            outcome: AdSelectionOutcome {
                ad_selection_id,
                render_uri: winner.bid.ad.render_uri.clone(),
                bid: winner.bid.bid,
            },
            winner,
            scores,
            debug_reports,
            states: Vec::new(),
        })
    }
}

fn has_contextual_bids(config: &AuctionConfig) -> bool {
    config
        .per_buyer_signed_contextual_ads
        .values()
        .any(|bundle| !bundle.ads_with_bid.is_empty())
}

/// Index of the highest strictly positive score; ties go to the earliest
/// submission.
#[must_use]
pub fn select_highest_score(scores: &[ScoreResult]) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .filter(|(_, s)| s.score > 0.0)
        .max_by(|(_, a), (_, b)| {
            a.score
                .total_cmp(&b.score)
                .then(b.submission_index.cmp(&a.submission_index))
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
#[allow(clippy::float_cmp)] // bids and scores are exact JSON round trips
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use adsel_core::{AdData, AdTechIdentifier, BidResult, DebugReportUris};
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::store::InMemoryAdSelectionStore;
    use crate::test_support::{FakeScript, FakeScriptRunner, StaticFetcher};

    const BID_JS: &str = "function generateBid(ad, a, b, c, d, e) {}";
    const SCORE_JS: &str = "function scoreAd(ad, bid, a, b, c, d, e) {}";

    #[derive(Debug)]
    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn audience(buyer: &str, name: &str, bids: &[f64]) -> CustomAudience {
        CustomAudience {
            owner: "com.example.app".to_string(),
            buyer: AdTechIdentifier::new(buyer),
            name: name.to_string(),
            activation_time: at(0),
            expiration_time: at(10_000),
            user_bidding_signals: Signals::empty(),
            bidding_logic_uri: Url::parse(&format!("https://{buyer}/bid.js")).unwrap(),
            trusted_bidding_data: None,
            ads: bids
                .iter()
                .enumerate()
                .map(|(i, bid)| {
                    AdData::new(
                        Url::parse(&format!("https://{buyer}/{name}/{i}")).unwrap(),
                        json!({ "bid": bid }),
                    )
                })
                .collect(),
        }
    }

    fn request(audiences: Vec<CustomAudience>) -> AdSelectionRequest {
        AdSelectionRequest {
            config: AuctionConfig {
                seller: AdTechIdentifier::new("seller.example"),
                decision_logic_uri: Url::parse("https://seller.example/score.js").unwrap(),
                trusted_scoring_signals_uri: Url::parse("https://seller.example/kv").unwrap(),
                custom_audience_buyers: vec![
                    AdTechIdentifier::new("a.example"),
                    AdTechIdentifier::new("b.example"),
                ],
                auction_signals: Signals::empty(),
                seller_signals: Signals::empty(),
                per_buyer_signals: BTreeMap::new(),
                per_buyer_signed_contextual_ads: BTreeMap::new(),
            },
            custom_audiences: audiences,
            contextual_signals: Signals::empty(),
            caller: "com.example.app".to_string(),
        }
    }

    fn fetcher() -> StaticFetcher {
        StaticFetcher::new()
            .with("https://a.example/bid.js", BID_JS)
            .with("https://b.example/bid.js", BID_JS)
            .with("https://seller.example/score.js", SCORE_JS)
            .with("https://seller.example/kv", "{}")
    }

    fn runner() -> FakeScriptRunner {
        FakeScriptRunner::new()
            .with_script(
                BID_JS,
                FakeScript::bidding(|ad| ad["metadata"]["bid"].as_f64().unwrap_or_default()),
            )
            .with_script(SCORE_JS, FakeScript::scoring(|_, bid| bid))
    }

    fn coordinator(
        config: AdSelectionConfig,
        runner: FakeScriptRunner,
        fetcher: StaticFetcher,
        store: Arc<InMemoryAdSelectionStore>,
    ) -> AuctionCoordinator {
        AuctionCoordinator::new(config, Arc::new(runner), Arc::new(fetcher), store)
            .with_clock(Arc::new(FixedClock(at(5_000))))
    }

    #[tokio::test]
    async fn highest_bid_wins_and_is_persisted() {
        let store = Arc::new(InMemoryAdSelectionStore::new());
        let coordinator =
            coordinator(AdSelectionConfig::default(), runner(), fetcher(), store.clone());
        let report = coordinator
            .run_auction(&request(vec![
                audience("a.example", "shoes", &[1.1]),
                audience("b.example", "hats", &[2.2]),
            ]))
            .await
            .unwrap();

        assert_eq!(report.outcome.bid, 2.2);
        assert_eq!(report.outcome.render_uri.as_str(), "https://b.example/hats/0");
        assert_ne!(report.outcome.ad_selection_id.get(), 0);
        assert_eq!(
            report.states,
            [
                AuctionState::Init,
                AuctionState::FetchingInputs,
                AuctionState::Bidding,
                AuctionState::Scoring,
                AuctionState::Selecting,
                AuctionState::Completed,
            ]
        );
        assert_eq!(store.history_len().await, 1);
    }

    #[tokio::test]
    async fn buyers_outside_the_config_and_inactive_audiences_do_not_bid() {
        let mut expired = audience("a.example", "expired", &[9.0]);
        expired.expiration_time = at(1_000);
        let outsider = audience("c.example", "outsider", &[8.0]);
        let coordinator = coordinator(
            AdSelectionConfig::default(),
            runner(),
            fetcher(),
            Arc::new(InMemoryAdSelectionStore::new()),
        );

        let report = coordinator
            .run_auction(&request(vec![
                expired,
                outsider,
                audience("a.example", "shoes", &[1.0]),
            ]))
            .await
            .unwrap();
        assert_eq!(report.scores.len(), 1);
        assert_eq!(report.outcome.bid, 1.0);
    }

    #[tokio::test]
    async fn no_participating_audience_has_no_winner() {
        let coordinator = coordinator(
            AdSelectionConfig::default(),
            runner(),
            fetcher(),
            Arc::new(InMemoryAdSelectionStore::new()),
        );
        let err = coordinator.run_auction(&request(Vec::new())).await.unwrap_err();
        assert_eq!(
            err,
            AuctionError::NoWinner {
                stage: Stage::Bidding
            }
        );
    }

    #[tokio::test]
    async fn select_ads_hides_the_cause() {
        let coordinator = coordinator(
            AdSelectionConfig::default(),
            runner(),
            StaticFetcher::new(),
            Arc::new(InMemoryAdSelectionStore::new()),
        );
        let failure = coordinator
            .select_ads(&request(vec![audience("a.example", "shoes", &[1.0])]))
            .await
            .unwrap_err();
        assert_eq!(failure, AdSelectionFailure::Internal);
    }

    #[tokio::test]
    async fn empty_caller_is_rejected_before_anything_is_fetched() {
        let fetcher = fetcher();
        let coordinator = coordinator(
            AdSelectionConfig::default(),
            runner(),
            fetcher.clone(),
            Arc::new(InMemoryAdSelectionStore::new()),
        );
        let mut request = request(vec![audience("a.example", "shoes", &[1.0])]);
        request.caller.clear();
        let err = coordinator.run_auction(&request).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert!(fetcher.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_bidding_past_the_overall_deadline_is_an_overall_timeout() {
        let mut config = AdSelectionConfig::default();
        config.timeouts.overall = Duration::from_secs(1);
        let coordinator = coordinator(
            config,
            runner().with_delay(Duration::from_secs(30)),
            fetcher(),
            Arc::new(InMemoryAdSelectionStore::new()),
        );
        let err = coordinator
            .run_auction(&request(vec![audience("a.example", "shoes", &[1.0])]))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AuctionError::Timeout {
                scope: TimeoutScope::Overall
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_audience_is_a_bidding_timeout() {
        let mut config = AdSelectionConfig::default();
        config.timeouts.bidding_per_custom_audience = Duration::from_secs(1);
        config.timeouts.overall = Duration::from_secs(60);
        let coordinator = coordinator(
            config,
            runner().with_delay(Duration::from_secs(5)),
            fetcher(),
            Arc::new(InMemoryAdSelectionStore::new()),
        );
        let err = coordinator
            .run_auction(&request(vec![audience("a.example", "shoes", &[1.0])]))
            .await
            .unwrap_err();
        assert_eq!(err, AuctionError::stage_timeout(Stage::Bidding));
    }

    fn scored(index: usize, score: f64) -> ScoreResult {
        ScoreResult {
            submission_index: index,
            bid: BidResult {
                ad: AdData::new(
                    Url::parse(&format!("https://a.example/{index}")).unwrap(),
                    json!(null),
                ),
                bid: 1.0,
                ad_cost: None,
                debug_reports: DebugReportUris::empty(),
            },
            source: BidSource::Contextual {
                buyer: AdTechIdentifier::new("a.example"),
            },
            score,
            debug_reports: DebugReportUris::empty(),
            reject_reason: None,
            seller_contextual_signals: Signals::empty(),
        }
    }

    #[test]
    fn ties_go_to_the_earliest_submission() {
        let scores = [scored(0, 1.0), scored(1, 3.0), scored(2, 3.0)];
        assert_eq!(select_highest_score(&scores), Some(1));
    }

    #[test]
    fn non_positive_scores_never_win() {
        let scores = [scored(0, 0.0), scored(1, -2.0)];
        assert_eq!(select_highest_score(&scores), None);
        assert_eq!(select_highest_score(&[]), None);
    }

    #[test]
    fn transitions_only_move_forward() {
        assert!(AuctionState::Init.can_transition_to(AuctionState::FetchingInputs));
        assert!(AuctionState::Scoring.can_transition_to(AuctionState::Failed));
        assert!(!AuctionState::Scoring.can_transition_to(AuctionState::Bidding));
        assert!(!AuctionState::Init.can_transition_to(AuctionState::Completed));
        assert!(AuctionState::Completed.valid_transitions().is_empty());
        assert!(AuctionState::Failed.is_terminal());
    }
}
