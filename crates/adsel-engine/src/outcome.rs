//! Selection among completed ad selections.
//!
//! The seller's `selectOutcome` receives previously persisted auction
//! winners and picks at most one. The driver output must report success and
//! exactly one result: `null` means no winner, an object with an `id` names
//! the winner. Anything else fails the call.

use std::sync::Arc;

use adsel_core::marshal::{drivers, ArgumentMarshaler};
use adsel_core::parse;
use adsel_core::{
    AdSelectionId, AuctionError, ScriptFailure, SelectionCandidate, Signals, Stage,
};
use tracing::{debug, instrument};

use crate::deadline::Deadline;
use crate::sandbox::SandboxPool;
use crate::store::AdSelectionStore;

/// Outcome selection orchestrator.
#[derive(Debug, Clone)]
pub struct OutcomeSelector {
    sandbox: SandboxPool,
    store: Arc<dyn AdSelectionStore>,
}

impl OutcomeSelector {
    /// Creates a selector.
    #[must_use]
    pub fn new(sandbox: SandboxPool, store: Arc<dyn AdSelectionStore>) -> Self {
        Self { sandbox, store }
    }

    /// Runs `selection_logic` over `outcomes`.
    ///
    /// # Errors
    ///
    /// - [`AuctionError::Script`] if the script fails, its output breaks the
    ///   single-result contract, or it names an id not among `outcomes`
    /// - [`AuctionError::Timeout`] if `deadline` passes first
    #[instrument(skip_all, fields(outcomes = outcomes.len()))]
    pub async fn select_outcome(
        &self,
        selection_logic: &str,
        outcomes: &[SelectionCandidate],
        selection_signals: &Signals,
        deadline: Deadline,
    ) -> Result<Option<AdSelectionId>, AuctionError> {
        let work = async {
            let program = drivers::wrap(selection_logic, drivers::SELECT_OUTCOME_DRIVER);
            let args = ArgumentMarshaler::outcome_selection_arguments(outcomes, selection_signals);
            let raw = self
                .sandbox
                .run(&program, drivers::SELECT_OUTCOME_ENTRY, &args, deadline)
                .await
                .map_err(script_error)?;
            let batch = parse::parse_batch(&raw).map_err(script_error)?;
            let selected = parse::parse_selection(&batch).map_err(script_error)?;
            if let Some(id) = selected {
                if !outcomes.iter().any(|o| o.ad_selection_id == id) {
                    return Err(script_error(ScriptFailure::semantic(format!(
                        "selected outcome {id} was not offered"
                    ))));
                }
            }
            debug!(selected = ?selected, "outcome selection finished");
            Ok(selected)
        };
        deadline
            .run(work)
            .await
            .unwrap_or(Err(AuctionError::stage_timeout(Stage::OutcomeSelection)))
    }

    /// Loads `ids` from bid history and selects among them.
    ///
    /// Unknown ids are skipped. With no known ids there is nothing to select
    /// and the script is not run.
    ///
    /// # Errors
    ///
    /// - [`AuctionError::Storage`] if history cannot be read
    /// - anything [`Self::select_outcome`] returns
    pub async fn select_from_history(
        &self,
        selection_logic: &str,
        ids: &[AdSelectionId],
        selection_signals: &Signals,
        deadline: Deadline,
    ) -> Result<Option<AdSelectionId>, AuctionError> {
        let records = self
            .store
            .fetch_bid_history(ids)
            .await
            .map_err(|e| AuctionError::Storage {
                stage: Stage::OutcomeSelection,
                reason: e.to_string(),
            })?;
        if records.is_empty() {
            return Ok(None);
        }
        let outcomes: Vec<SelectionCandidate> =
            records.iter().map(|record| record.as_candidate()).collect();
        self.select_outcome(selection_logic, &outcomes, selection_signals, deadline)
            .await
    }
}

fn script_error(failure: ScriptFailure) -> AuctionError {
    AuctionError::script(Stage::OutcomeSelection, failure)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use adsel_core::{AdTechIdentifier, AdSelectionConfig};
    use chrono::Utc;
    use serde_json::{json, Value};
    use url::Url;

    use super::*;
    use crate::store::{BidHistoryRecord, InMemoryAdSelectionStore};
    use crate::test_support::{FakeScript, FakeScriptRunner};

    const LOGIC: &str = "function selectOutcome(outcomes, signals) {}";

    fn selector(script: FakeScript, store: Arc<InMemoryAdSelectionStore>) -> OutcomeSelector {
        let runner = FakeScriptRunner::new().with_script(LOGIC, script);
        let config = AdSelectionConfig::default();
        OutcomeSelector::new(
            SandboxPool::new(Arc::new(runner), 2, config.sandbox.retry),
            store,
        )
    }

    fn candidate(id: u64, bid: f64) -> SelectionCandidate {
        SelectionCandidate {
            ad_selection_id: AdSelectionId::new(id),
            bid,
            render_uri: Url::parse(&format!("https://buyer.example/ad/{id}")).unwrap(),
        }
    }

    /// Picks the highest bid above the `floor` selection signal.
    fn highest_above_floor() -> FakeScript {
        FakeScript::new().function("selectOutcome", 2, |args| {
            let floor = args[1]["floor"].as_f64().unwrap_or_default();
            let best = args[0]
                .as_array()
                .into_iter()
                .flatten()
                .filter(|o| o["bid"].as_f64().unwrap_or_default() > floor)
                .max_by(|a, b| {
                    let a = a["bid"].as_f64().unwrap_or_default();
                    let b = b["bid"].as_f64().unwrap_or_default();
                    a.total_cmp(&b)
                })
                .cloned()
                .unwrap_or(Value::Null);
            Ok(json!({ "status": 0, "result": best }))
        })
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn selects_the_named_outcome() {
        let selector = selector(highest_above_floor(), Arc::new(InMemoryAdSelectionStore::new()));
        let selected = selector
            .select_outcome(
                LOGIC,
                &[candidate(11, 1.0), candidate(12, 3.0)],
                &Signals::from_value(json!({ "floor": 0.5 })),
                deadline(),
            )
            .await
            .unwrap();
        assert_eq!(selected, Some(AdSelectionId::new(12)));
    }

    #[tokio::test]
    async fn null_result_selects_nothing() {
        let selector = selector(highest_above_floor(), Arc::new(InMemoryAdSelectionStore::new()));
        let selected = selector
            .select_outcome(
                LOGIC,
                &[candidate(11, 1.0)],
                &Signals::from_value(json!({ "floor": 5.0 })),
                deadline(),
            )
            .await
            .unwrap();
        assert_eq!(selected, None);
    }

    #[tokio::test]
    async fn several_results_are_a_semantic_error() {
        let script = FakeScript::new().function("selectOutcome", 2, |args| {
            Ok(json!({ "status": 0, "result": args[0] }))
        });
        let selector = selector(script, Arc::new(InMemoryAdSelectionStore::new()));
        let err = selector
            .select_outcome(
                LOGIC,
                &[candidate(1, 1.0), candidate(2, 2.0)],
                &Signals::empty(),
                deadline(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "semantic_output_error");
        assert_eq!(err.stage(), Some(Stage::OutcomeSelection));
    }

    #[tokio::test]
    async fn failure_status_is_a_semantic_error() {
        let script = FakeScript::new()
            .function("selectOutcome", 2, |_| Ok(json!({ "status": 1, "result": null })));
        let selector = selector(script, Arc::new(InMemoryAdSelectionStore::new()));
        let err = selector
            .select_outcome(LOGIC, &[candidate(1, 1.0)], &Signals::empty(), deadline())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "semantic_output_error");
    }

    #[tokio::test]
    async fn unknown_id_is_rejected() {
        let script = FakeScript::new()
            .function("selectOutcome", 2, |_| Ok(json!({ "status": 0, "result": { "id": "99" } })));
        let selector = selector(script, Arc::new(InMemoryAdSelectionStore::new()));
        let err = selector
            .select_outcome(LOGIC, &[candidate(1, 1.0)], &Signals::empty(), deadline())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "semantic_output_error");
    }

    #[tokio::test]
    async fn history_candidates_are_loaded_from_the_store() {
        let store = Arc::new(InMemoryAdSelectionStore::new());
        for (id, bid) in [(21, 2.0), (22, 4.0)] {
            let candidate = candidate(id, bid);
            store
                .persist_bid_history(BidHistoryRecord {
                    ad_selection_id: candidate.ad_selection_id,
                    custom_audience: None,
                    buyer: AdTechIdentifier::new("buyer.example"),
                    bid,
                    render_uri: candidate.render_uri,
                    bidding_logic_uri: Url::parse("https://buyer.example/bid.js").unwrap(),
                    seller: AdTechIdentifier::new("seller.example"),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let selector = selector(highest_above_floor(), store);

        let selected = selector
            .select_from_history(
                LOGIC,
                &[AdSelectionId::new(21), AdSelectionId::new(22), AdSelectionId::new(23)],
                &Signals::empty(),
                deadline(),
            )
            .await
            .unwrap();
        assert_eq!(selected, Some(AdSelectionId::new(22)));

        let none = selector
            .select_from_history(LOGIC, &[AdSelectionId::new(5)], &Signals::empty(), deadline())
            .await
            .unwrap();
        assert_eq!(none, None);
    }
}
