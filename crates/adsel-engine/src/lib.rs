//! Auction engine for on-device ad selection.
//!
//! This crate sequences the building blocks of `adsel-core` into a complete
//! auction: buyer scripts generate bids, the seller script scores them, the
//! highest score wins, and the outcome is persisted.
//!
//! # Architecture
//!
//! ```text
//! AuctionCoordinator
//!     │
//!     ├── BidGenerator     (per custom audience, bounded pool)
//!     │       └── SandboxPool ──> dyn ScriptRunner
//!     ├── ScoreGenerator   (one batch per decision logic)
//!     │       └── SandboxPool
//!     ├── FetchCache ──> dyn Fetcher       (scripts and trusted signals)
//!     ├── dyn AdSelectionStore              (overrides, bid history)
//!     └── dyn ExecutionLogger               (stage latency, exclusions)
//! ```
//!
//! [`OutcomeSelector`] is a separate entry point that picks among already
//! completed selections using a seller `selectOutcome` script.
//!
//! # Failure model
//!
//! Every call is bounded by a [`Deadline`]. Per-item problems (an
//! unparseable bid, a non-success score) drop the item; structural problems
//! fail the whole auction with a typed [`adsel_core::AuctionError`] that
//! callers of [`AuctionCoordinator::select_ads`] only ever see as the opaque
//! [`adsel_core::AdSelectionFailure`].

pub mod bidding;
pub mod coordinator;
pub mod deadline;
pub mod fetch;
pub mod metrics;
pub mod outcome;
pub mod sandbox;
pub mod scoring;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use bidding::{AdBiddingOutcome, BidGenerator, BiddingScript};
pub use coordinator::{
    AdSelectionOutcome, AdSelectionRequest, AuctionCoordinator, AuctionReport, AuctionState, Clock,
    SystemClock,
};
pub use deadline::Deadline;
pub use fetch::{DevContext, FetchCache, FetchError, FetchResponse, Fetcher, HttpFetcher};
pub use metrics::{
    AuctionMetrics, ExecutionLogger, MetricsError, MetricsRegistry, NoopExecutionLogger,
};
pub use outcome::OutcomeSelector;
pub use sandbox::{ProcessScriptRunner, SandboxPool};
pub use scoring::{ScoreGenerator, ScoringCandidate};
pub use store::{AdSelectionStore, BidHistoryRecord, InMemoryAdSelectionStore, StoreError};
