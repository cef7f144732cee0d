//! Core building blocks for on-device ad selection.
//!
//! This crate holds everything the auction engine needs that does not touch
//! the network, the filesystem, or a runtime:
//!
//! - [`types`]: the auction data model (creatives, audiences, bids, scores)
//! - [`script`]: the sandboxed script runner contract and failure taxonomy
//! - [`marshal`]: conversion of domain values into ordered script arguments,
//!   calling conventions, driver wrappers and counter-key copiers
//! - [`parse`]: defensive parsing of script output into typed records
//! - [`debug`]: debug-reporting strategies and report URI finalization
//! - [`config`]: TOML configuration for timeouts, pools and feature toggles
//! - [`error`]: auction-level error taxonomy and the opaque public failure
//!
//! # Architecture
//!
//! ```text
//! ScriptRunner (contract)
//!     │
//!     ├── marshal: domain values ──> Vec<ScriptArgument>
//!     └── parse:   raw output    ──> ItemOutcome<ParsedBid | ParsedScore>
//! ```
//!
//! The orchestrators that sequence these pieces live in `adsel-engine`.

pub mod config;
pub mod debug;
pub mod error;
pub mod marshal;
pub mod parse;
pub mod script;
pub mod types;

pub use config::{AdSelectionConfig, ConfigError};
pub use error::{AdSelectionFailure, AuctionError, Stage, TimeoutScope};
pub use script::{ScriptArgument, ScriptFailure, ScriptRunner};
pub use types::{
    AdCost, AdData, AdSelectionId, AdTechIdentifier, AdWithBid, AuctionConfig, AuctionConfigId,
    BidResult, BidSource, CustomAudience, CustomAudienceSignals, DebugReportUris, DebugUri,
    ScoreResult, SelectionCandidate, SignedContextualAds, Signals, TrustedBiddingData,
};
