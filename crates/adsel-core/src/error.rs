//! Auction error taxonomy.
//!
//! [`AuctionError`] is the internal diagnostic error: it keeps the stage a
//! failure originated in and its cause. Callers outside the engine only ever
//! see [`AdSelectionFailure`], which carries no detail.

use std::fmt;

use thiserror::Error;

use crate::script::ScriptFailure;
use crate::types::AdTechIdentifier;

// =============================================================================
// Stage
// =============================================================================

/// A stage of the auction pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Request validation and input prefetch.
    FetchingInputs,
    /// Per-buyer bid generation.
    Bidding,
    /// Seller scoring over merged bids.
    Scoring,
    /// Winner selection and persistence.
    Selecting,
    /// Selection among completed auction outcomes.
    OutcomeSelection,
}

impl Stage {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FetchingInputs => "fetching_inputs",
            Self::Bidding => "bidding",
            Self::Scoring => "scoring",
            Self::Selecting => "selecting",
            Self::OutcomeSelection => "outcome_selection",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutScope {
    /// A stage (or sub-call) deadline.
    Stage(Stage),
    /// The whole-auction deadline.
    Overall,
}

impl fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage(stage) => write!(f, "stage {stage}"),
            Self::Overall => f.write_str("overall auction"),
        }
    }
}

// =============================================================================
// AuctionError
// =============================================================================

/// Hard failure of an auction.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum AuctionError {
    /// A script failed in a way that aborts its call.
    #[error("{stage} script failed: {source}")]
    Script {
        /// Stage the script ran in.
        stage: Stage,
        /// Script failure.
        #[source]
        source: ScriptFailure,
    },

    /// A deadline expired.
    #[error("{scope} timed out")]
    Timeout {
        /// Which deadline expired.
        scope: TimeoutScope,
    },

    /// Scoring returned fewer scores than bids submitted.
    #[error("scoring returned {actual} scores for {expected} bids")]
    InsufficientScoreCount {
        /// Bids submitted.
        expected: usize,
        /// Scores returned.
        actual: usize,
    },

    /// Seller trusted scoring signals could not be obtained.
    #[error("trusted scoring signals unavailable: {reason}")]
    MissingTrustedScoringSignals {
        /// Underlying cause.
        reason: String,
    },

    /// Buyer trusted bidding signals could not be obtained.
    #[error("trusted bidding signals unavailable for {buyer}: {reason}")]
    MissingTrustedBiddingSignals {
        /// Buyer whose signals are missing.
        buyer: AdTechIdentifier,
        /// Underlying cause.
        reason: String,
    },

    /// A buyer's bidding script could not be obtained.
    #[error("bidding logic unavailable for {buyer}: {reason}")]
    MissingBiddingLogic {
        /// Buyer whose script is missing.
        buyer: AdTechIdentifier,
        /// Underlying cause.
        reason: String,
    },

    /// The seller's decision or selection script could not be obtained.
    #[error("{stage} decision logic unavailable: {reason}")]
    MissingDecisionLogic {
        /// Stage that needed the script.
        stage: Stage,
        /// Underlying cause.
        reason: String,
    },

    /// No eligible result to select.
    #[error("no eligible winner after {stage}")]
    NoWinner {
        /// Stage that ran out of candidates.
        stage: Stage,
    },

    /// The request is unusable.
    #[error("invalid request: {reason}")]
    InvalidInput {
        /// What is wrong.
        reason: String,
    },

    /// The storage collaborator failed.
    #[error("storage failed during {stage}: {reason}")]
    Storage {
        /// Stage that used storage.
        stage: Stage,
        /// Underlying cause.
        reason: String,
    },
}

impl AuctionError {
    /// Wraps a script failure from `stage`. An invocation that ran out of
    /// time is a timeout of that stage.
    #[must_use]
    pub fn script(stage: Stage, source: ScriptFailure) -> Self {
        match source {
            ScriptFailure::Timeout => Self::stage_timeout(stage),
            source => Self::Script { stage, source },
        }
    }

    /// A stage timeout.
    #[must_use]
    pub const fn stage_timeout(stage: Stage) -> Self {
        Self::Timeout {
            scope: TimeoutScope::Stage(stage),
        }
    }

    /// Returns the error kind as a stable label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Script { source, .. } => source.kind(),
            Self::Timeout {
                scope: TimeoutScope::Overall,
            } => "overall_timeout",
            Self::Timeout { .. } => "stage_timeout",
            Self::InsufficientScoreCount { .. } => "insufficient_score_count",
            Self::MissingTrustedScoringSignals { .. } => "missing_trusted_scoring_signals",
            Self::MissingTrustedBiddingSignals { .. } => "missing_trusted_bidding_signals",
            Self::MissingBiddingLogic { .. } => "missing_bidding_logic",
            Self::MissingDecisionLogic { .. } => "missing_decision_logic",
            Self::NoWinner { .. } => "no_winner",
            Self::InvalidInput { .. } => "invalid_input",
            Self::Storage { .. } => "storage",
        }
    }

    /// Returns the stage the failure originated in.
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::Script { stage, .. }
            | Self::MissingDecisionLogic { stage, .. }
            | Self::NoWinner { stage }
            | Self::Storage { stage, .. }
            | Self::Timeout {
                scope: TimeoutScope::Stage(stage),
            } => Some(*stage),
            Self::InsufficientScoreCount { .. } | Self::MissingTrustedScoringSignals { .. } => {
                Some(Stage::Scoring)
            },
            Self::MissingTrustedBiddingSignals { .. } | Self::MissingBiddingLogic { .. } => {
                Some(Stage::Bidding)
            },
            Self::InvalidInput { .. } => Some(Stage::FetchingInputs),
            Self::Timeout {
                scope: TimeoutScope::Overall,
            } => None,
        }
    }

    /// Re-labels a stage timeout as an overall timeout.
    #[must_use]
    pub fn into_overall_timeout(self) -> Self {
        match self {
            Self::Timeout { .. } => Self::Timeout {
                scope: TimeoutScope::Overall,
            },
            other => other,
        }
    }
}

// =============================================================================
// AdSelectionFailure
// =============================================================================

/// The only failure visible across the public boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdSelectionFailure {
    /// The auction did not produce a winner.
    #[error("internal error")]
    Internal,
}

impl From<AuctionError> for AdSelectionFailure {
    fn from(_: AuctionError) -> Self {
        Self::Internal
    }
}
