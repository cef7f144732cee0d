//! Storage collaborator.
//!
//! The engine persists one [`BidHistoryRecord`] per completed auction and
//! reads developer overrides keyed by [`AuctionConfigId`] and caller. Real
//! deployments back [`AdSelectionStore`] with a database;
//! [`InMemoryAdSelectionStore`] serves tests and the CLI.

use std::collections::HashMap;
use std::fmt;

use adsel_core::{
    AdSelectionId, AdTechIdentifier, AuctionConfigId, CustomAudienceSignals, SelectionCandidate,
    Signals,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use url::Url;

/// Maximum number of bid history records kept in memory.
pub const MAX_IN_MEMORY_RECORDS: usize = 10_000;

// =============================================================================
// Records
// =============================================================================

/// Persisted outcome of one completed auction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidHistoryRecord {
    /// Id assigned to the selection.
    pub ad_selection_id: AdSelectionId,
    /// Audience that produced the winning bid, if it was a remarketing bid.
    pub custom_audience: Option<CustomAudienceSignals>,
    /// Buyer of the winning bid.
    pub buyer: AdTechIdentifier,
    /// Winning bid value.
    pub bid: f64,
    /// Winning render URI.
    pub render_uri: Url,
    /// Location of the winning buyer's bidding or decision logic.
    pub bidding_logic_uri: Url,
    /// Seller that ran the auction.
    pub seller: AdTechIdentifier,
    /// Completion instant.
    pub created_at: DateTime<Utc>,
}

impl BidHistoryRecord {
    /// Returns the selection as an outcome selection candidate.
    #[must_use]
    pub fn as_candidate(&self) -> SelectionCandidate {
        SelectionCandidate {
            ad_selection_id: self.ad_selection_id,
            bid: self.bid,
            render_uri: self.render_uri.clone(),
        }
    }
}

/// Developer override of the seller's decision logic and signals.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionLogicOverride {
    /// Scoring script text.
    pub decision_logic: String,
    /// Trusted scoring signals.
    pub trusted_scoring_signals: Signals,
}

/// Developer override of an audience's bidding logic and signals.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomAudienceOverride {
    /// Bidding script text.
    pub bidding_logic: String,
    /// Declared bidding logic version, if any.
    pub bidding_logic_version: Option<u64>,
    /// Trusted bidding signals.
    pub trusted_bidding_signals: Signals,
}

/// Errors from the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The store is full.
    #[error("store capacity {limit} exceeded")]
    CapacityExceeded {
        /// Record limit.
        limit: usize,
    },

    /// A record with the same id already exists.
    #[error("ad selection {id} already persisted")]
    Duplicate {
        /// Conflicting id.
        id: AdSelectionId,
    },

    /// Backend failure.
    #[error("storage backend failed: {0}")]
    Backend(String),
}

// =============================================================================
// AdSelectionStore
// =============================================================================

/// Persistence of auction history and developer overrides.
#[async_trait]
pub trait AdSelectionStore: Send + Sync + fmt::Debug {
    /// Persists the outcome of a completed auction.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the record cannot be written.
    async fn persist_bid_history(&self, record: BidHistoryRecord) -> Result<(), StoreError>;

    /// Returns the caller's override of the seller decision logic for
    /// `config_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on backend failure.
    async fn fetch_dev_override(
        &self,
        config_id: &AuctionConfigId,
        caller: &str,
    ) -> Result<Option<DecisionLogicOverride>, StoreError>;

    /// Returns the caller's override of `buyer`'s contextual decision logic
    /// for `config_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on backend failure.
    async fn fetch_per_buyer_override(
        &self,
        config_id: &AuctionConfigId,
        buyer: &AdTechIdentifier,
        caller: &str,
    ) -> Result<Option<String>, StoreError>;

    /// Returns the caller's override of an audience's bidding logic.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on backend failure.
    async fn fetch_custom_audience_override(
        &self,
        owner: &str,
        buyer: &AdTechIdentifier,
        name: &str,
        caller: &str,
    ) -> Result<Option<CustomAudienceOverride>, StoreError>;

    /// Returns the persisted records among `ids`, in `ids` order, skipping
    /// unknown ids.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on backend failure.
    async fn fetch_bid_history(
        &self,
        ids: &[AdSelectionId],
    ) -> Result<Vec<BidHistoryRecord>, StoreError>;
}

// =============================================================================
// InMemoryAdSelectionStore
// =============================================================================

type AudienceKey = (String, AdTechIdentifier, String, String);

#[derive(Debug, Default)]
struct Inner {
    history: HashMap<AdSelectionId, BidHistoryRecord>,
    decision_overrides: HashMap<(AuctionConfigId, String), DecisionLogicOverride>,
    buyer_overrides: HashMap<(AuctionConfigId, AdTechIdentifier, String), String>,
    audience_overrides: HashMap<AudienceKey, CustomAudienceOverride>,
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryAdSelectionStore {
    inner: RwLock<Inner>,
}

impl InMemoryAdSelectionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a decision logic override.
    pub async fn add_dev_override(
        &self,
        config_id: AuctionConfigId,
        caller: impl Into<String>,
        value: DecisionLogicOverride,
    ) {
        self.inner
            .write()
            .await
            .decision_overrides
            .insert((config_id, caller.into()), value);
    }

    /// Registers a per-buyer contextual decision logic override.
    pub async fn add_per_buyer_override(
        &self,
        config_id: AuctionConfigId,
        buyer: AdTechIdentifier,
        caller: impl Into<String>,
        decision_logic: impl Into<String>,
    ) {
        self.inner
            .write()
            .await
            .buyer_overrides
            .insert((config_id, buyer, caller.into()), decision_logic.into());
    }

    /// Registers a custom audience bidding override.
    pub async fn add_custom_audience_override(
        &self,
        signals: &CustomAudienceSignals,
        caller: impl Into<String>,
        value: CustomAudienceOverride,
    ) {
        let key = (
            signals.owner.clone(),
            signals.buyer.clone(),
            signals.name.clone(),
            caller.into(),
        );
        self.inner.write().await.audience_overrides.insert(key, value);
    }

    /// Number of persisted records.
    pub async fn history_len(&self) -> usize {
        self.inner.read().await.history.len()
    }
}

#[async_trait]
impl AdSelectionStore for InMemoryAdSelectionStore {
    async fn persist_bid_history(&self, record: BidHistoryRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.history.contains_key(&record.ad_selection_id) {
            return Err(StoreError::Duplicate {
                id: record.ad_selection_id,
            });
        }
        if inner.history.len() >= MAX_IN_MEMORY_RECORDS {
            return Err(StoreError::CapacityExceeded {
                limit: MAX_IN_MEMORY_RECORDS,
            });
        }
        inner.history.insert(record.ad_selection_id, record);
        Ok(())
    }

    async fn fetch_dev_override(
        &self,
        config_id: &AuctionConfigId,
        caller: &str,
    ) -> Result<Option<DecisionLogicOverride>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .decision_overrides
            .get(&(*config_id, caller.to_string()))
            .cloned())
    }

    async fn fetch_per_buyer_override(
        &self,
        config_id: &AuctionConfigId,
        buyer: &AdTechIdentifier,
        caller: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .buyer_overrides
            .get(&(*config_id, buyer.clone(), caller.to_string()))
            .cloned())
    }

    async fn fetch_custom_audience_override(
        &self,
        owner: &str,
        buyer: &AdTechIdentifier,
        name: &str,
        caller: &str,
    ) -> Result<Option<CustomAudienceOverride>, StoreError> {
        let key = (
            owner.to_string(),
            buyer.clone(),
            name.to_string(),
            caller.to_string(),
        );
        Ok(self.inner.read().await.audience_overrides.get(&key).cloned())
    }

    async fn fetch_bid_history(
        &self,
        ids: &[AdSelectionId],
    ) -> Result<Vec<BidHistoryRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.history.get(id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use adsel_core::AuctionConfig;

    use super::*;

    fn record(id: u64) -> BidHistoryRecord {
        BidHistoryRecord {
            ad_selection_id: AdSelectionId::new(id),
            custom_audience: None,
            buyer: AdTechIdentifier::new("buyer.example"),
            bid: 1.5,
            render_uri: Url::parse("https://buyer.example/ad").unwrap(),
            bidding_logic_uri: Url::parse("https://buyer.example/bid.js").unwrap(),
            seller: AdTechIdentifier::new("seller.example"),
            created_at: Utc::now(),
        }
    }

    fn config_id() -> AuctionConfigId {
        AuctionConfig {
            seller: AdTechIdentifier::new("seller.example"),
            decision_logic_uri: Url::parse("https://seller.example/decide.js").unwrap(),
            trusted_scoring_signals_uri: Url::parse("https://seller.example/signals").unwrap(),
            custom_audience_buyers: Vec::new(),
            auction_signals: Signals::empty(),
            seller_signals: Signals::empty(),
            per_buyer_signals: BTreeMap::new(),
            per_buyer_signed_contextual_ads: BTreeMap::new(),
        }
        .id()
    }

    #[tokio::test]
    async fn history_round_trips_in_request_order() {
        let store = InMemoryAdSelectionStore::new();
        store.persist_bid_history(record(1)).await.unwrap();
        store.persist_bid_history(record(2)).await.unwrap();

        let ids = [AdSelectionId::new(2), AdSelectionId::new(9), AdSelectionId::new(1)];
        let records = store.fetch_bid_history(&ids).await.unwrap();
        let got: Vec<_> = records.iter().map(|r| r.ad_selection_id.get()).collect();
        assert_eq!(got, [2, 1]);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let store = InMemoryAdSelectionStore::new();
        store.persist_bid_history(record(7)).await.unwrap();
        let err = store.persist_bid_history(record(7)).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::Duplicate {
                id: AdSelectionId::new(7)
            }
        );
        assert_eq!(store.history_len().await, 1);
    }

    #[tokio::test]
    async fn overrides_are_scoped_to_caller() {
        let store = InMemoryAdSelectionStore::new();
        let id = config_id();
        store
            .add_dev_override(
                id,
                "com.example.app",
                DecisionLogicOverride {
                    decision_logic: "function scoreAd() {}".to_string(),
                    trusted_scoring_signals: Signals::empty(),
                },
            )
            .await;
        store
            .add_per_buyer_override(
                id,
                AdTechIdentifier::new("buyer.example"),
                "com.example.app",
                "function scoreAd() { return 1; }",
            )
            .await;

        assert!(store
            .fetch_dev_override(&id, "com.example.app")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .fetch_dev_override(&id, "com.other.app")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .fetch_per_buyer_override(&id, &AdTechIdentifier::new("buyer.example"), "com.example.app")
            .await
            .unwrap()
            .is_some());
    }
}
