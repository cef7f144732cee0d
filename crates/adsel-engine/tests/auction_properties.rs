//! Property tests over complete auctions.
//!
//! Audiences bid the values in their ad metadata and the seller scores by
//! bid, so the expected outcome of every generated auction is known up front.

// Test code uses proptest which generates patterns that trigger these lints.
#![allow(clippy::float_cmp)]

use std::collections::BTreeMap;
use std::sync::Arc;

use adsel_core::{
    AdData, AdSelectionConfig, AdTechIdentifier, AuctionConfig, AuctionError, CustomAudience,
    Signals, Stage,
};
use adsel_engine::test_support::{FakeScript, FakeScriptRunner, StaticFetcher};
use adsel_engine::{
    AdSelectionRequest, AdSelectionStore, AuctionCoordinator, AuctionState,
    InMemoryAdSelectionStore,
};
use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use serde_json::{json, Value};
use url::Url;

const BID_JS: &str = "function generateBid(ad, auction, perBuyer, trusted, contextual, ca) {}";
const SCORE_JS: &str = "function scoreAd(ad, bid, config, seller, trusted, contextual, cas) {}";
const BUYERS: [&str; 3] = ["a.example", "b.example", "c.example"];

fn url(text: &str) -> Url {
    Url::parse(text).expect("valid test URL")
}

fn audience(buyer: &str, index: usize, bids: &[f64]) -> CustomAudience {
    CustomAudience {
        owner: "com.example.app".to_string(),
        buyer: AdTechIdentifier::new(buyer),
        name: format!("ca{index}"),
        activation_time: Utc.timestamp_millis_opt(0).unwrap(),
        expiration_time: Utc::now() + chrono::Duration::days(1),
        user_bidding_signals: Signals::empty(),
        bidding_logic_uri: url(&format!("https://{buyer}/bid.js")),
        trusted_bidding_data: None,
        ads: bids
            .iter()
            .enumerate()
            .map(|(i, bid)| {
                AdData::new(
                    url(&format!("https://{buyer}/ca{index}/{i}")),
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
            decision_logic_uri: url("https://seller.example/score.js"),
            trusted_scoring_signals_uri: url("https://seller.example/kv"),
            custom_audience_buyers: BUYERS.iter().map(|b| AdTechIdentifier::new(*b)).collect(),
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

/// Builds a coordinator whose buyers bid `metadata.bid` and whose seller
/// scores by bid.
fn coordinator(config: AdSelectionConfig, store: Arc<InMemoryAdSelectionStore>) -> AuctionCoordinator {
    let runner = FakeScriptRunner::new()
        .with_script(
            BID_JS,
            FakeScript::bidding(|ad: &Value| ad["metadata"]["bid"].as_f64().unwrap_or_default()),
        )
        .with_script(SCORE_JS, FakeScript::scoring(|_, bid| bid));
    let mut fetcher = StaticFetcher::new()
        .with("https://seller.example/score.js", SCORE_JS)
        .with("https://seller.example/kv", "{}");
    for buyer in BUYERS {
        fetcher = fetcher.with(&format!("https://{buyer}/bid.js"), BID_JS);
    }
    AuctionCoordinator::new(config, Arc::new(runner), Arc::new(fetcher), store)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("test runtime")
}

/// Bids on a coarse grid so ties and non-positive bids are common.
fn arb_bid() -> impl Strategy<Value = f64> {
    (-2_i32..=12).prop_map(|quarters| f64::from(quarters) * 0.25)
}

fn arb_audiences() -> impl Strategy<Value = Vec<(usize, Vec<f64>)>> {
    prop::collection::vec(
        (0..BUYERS.len(), prop::collection::vec(arb_bid(), 1..4)),
        1..6,
    )
}

fn build(audiences: &[(usize, Vec<f64>)]) -> Vec<CustomAudience> {
    audiences
        .iter()
        .enumerate()
        .map(|(index, (buyer, bids))| audience(BUYERS[*buyer], index, bids))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// The highest positive bid wins and is the only record persisted.
    #[test]
    fn prop_highest_positive_bid_wins(audiences in arb_audiences(), best_only in any::<bool>()) {
        let expected = audiences
            .iter()
            .flat_map(|(_, bids)| bids.iter().copied())
            .filter(|bid| *bid > 0.0)
            .reduce(f64::max);

        let mut config = AdSelectionConfig::default();
        config.features.best_bid_per_custom_audience = best_only;
        let store = Arc::new(InMemoryAdSelectionStore::new());
        let coordinator = coordinator(config, store.clone());
        let result = runtime().block_on(coordinator.run_auction(&request(build(&audiences))));

        match expected {
            Some(best) => {
                let report = result.map_err(|e| TestCaseError::fail(e.to_string()))?;
                prop_assert_eq!(report.outcome.bid, best);
                prop_assert_eq!(report.winner.bid.bid, best);
                prop_assert_eq!(report.states.first(), Some(&AuctionState::Init));
                prop_assert_eq!(report.states.last(), Some(&AuctionState::Completed));
                prop_assert!(report.scores.iter().all(|s| s.score <= best));

                let history = runtime()
                    .block_on(store.fetch_bid_history(&[report.outcome.ad_selection_id]))
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                prop_assert_eq!(history.len(), 1);
                prop_assert_eq!(history[0].bid, best);
            },
            None => {
                prop_assert_eq!(result.err(), Some(AuctionError::NoWinner { stage: Stage::Bidding }));
                prop_assert_eq!(runtime().block_on(store.history_len()), 0);
            },
        }
    }

    /// Reducing to the best bid per audience never changes the winning bid.
    #[test]
    fn prop_best_bid_reduction_preserves_winning_bid(audiences in arb_audiences()) {
        let run = |best_only: bool| {
            let mut config = AdSelectionConfig::default();
            config.features.best_bid_per_custom_audience = best_only;
            let coordinator = coordinator(config, Arc::new(InMemoryAdSelectionStore::new()));
            runtime()
                .block_on(coordinator.run_auction(&request(build(&audiences))))
                .map(|report| (report.outcome.bid, report.scores.len()))
                .ok()
        };
        let reduced = run(true);
        let full = run(false);
        prop_assert_eq!(reduced.map(|(bid, _)| bid), full.map(|(bid, _)| bid));
        if let (Some((_, reduced_count)), Some((_, full_count))) = (reduced, full) {
            prop_assert!(reduced_count <= full_count);
        }
    }
}
