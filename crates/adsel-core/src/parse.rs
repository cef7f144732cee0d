//! Script output parsing.
//!
//! Item-level problems never abort a batch: they produce an
//! [`ExclusionReason`] carried as the `Err` side of an [`ItemOutcome`], and
//! the orchestrator drops that item. Only batch-level structural problems
//! are reported as [`ScriptFailure`].
//!
//! # Output shapes
//!
//! ```text
//! per-candidate bid   {status, ad: {render_uri, metadata}, bid, adCost?, forDebuggingOnly?}
//! whole-audience item {ad, bid, render, adCost?, forDebuggingOnly?}
//! score item          {status, score, rejectReason?, forDebuggingOnly?}
//! batch               {status, results: [...]}
//! ```

use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

use crate::script::ScriptFailure;
use crate::types::{AdCost, AdData, AdSelectionId};

/// Status value meaning success.
pub const STATUS_SUCCESS: i64 = 0;

/// Default stochastic rounding width attached to ad costs.
pub const AD_COST_ROUNDING_BITS: u32 = 8;

const STATUS_FIELD: &str = "status";
const RESULTS_FIELD: &str = "results";
const AD_FIELD: &str = "ad";
const BID_FIELD: &str = "bid";
const AD_COST_FIELD: &str = "adCost";
const RENDER_FIELD: &str = "render";
const SCORE_FIELD: &str = "score";
const REJECT_REASON_FIELD: &str = "rejectReason";
const ID_FIELD: &str = "id";
const DEBUG_FIELD: &str = "forDebuggingOnly";
const DEBUG_WIN_FIELD: &str = "reportAdAuctionWin";
const DEBUG_LOSS_FIELD: &str = "reportAdAuctionLoss";

// =============================================================================
// Outcome types
// =============================================================================

/// Why one item was dropped from a batch.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum ExclusionReason {
    /// The output was not JSON.
    #[error("output is not valid JSON")]
    NotJson,

    /// The output was JSON but not an object.
    #[error("output is not an object")]
    NotAnObject,

    /// No status field.
    #[error("output has no status")]
    MissingStatus,

    /// A status other than success.
    #[error("output status {status} is not success")]
    NonZeroStatus {
        /// The reported status.
        status: i64,
    },

    /// A required field is missing or has the wrong type.
    #[error("field `{field}` is missing or invalid")]
    InvalidField {
        /// Field name.
        field: &'static str,
    },

    /// Bid is zero, negative, or not finite.
    #[error("bid {bid} is not strictly positive")]
    NonPositiveBid {
        /// The declared bid.
        bid: f64,
    },

    /// Cost extraction is enabled and no usable cost was declared.
    #[error("ad cost is missing or invalid")]
    MissingAdCost,
}

impl ExclusionReason {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotJson => "not_json",
            Self::NotAnObject => "not_an_object",
            Self::MissingStatus => "missing_status",
            Self::NonZeroStatus { .. } => "non_zero_status",
            Self::InvalidField { .. } => "invalid_field",
            Self::NonPositiveBid { .. } => "non_positive_bid",
            Self::MissingAdCost => "missing_ad_cost",
        }
    }
}

/// Per-item parse result: the value, or why the item is excluded.
pub type ItemOutcome<T> = Result<T, ExclusionReason>;

/// Debug report URLs exactly as the script declared them.
///
/// Non-string values are already dropped here; URL validity is decided by
/// the debug-reporting strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclaredDebugUris {
    /// Declared win report URL.
    pub win: Option<String>,
    /// Declared loss report URL.
    pub loss: Option<String>,
}

/// Options controlling bid parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BidParseOptions {
    /// Require and attach `adCost`.
    pub ad_cost_extraction: bool,
    /// Rounding width recorded on extracted costs.
    pub ad_cost_rounding_bits: u32,
}

impl Default for BidParseOptions {
    fn default() -> Self {
        Self {
            ad_cost_extraction: false,
            ad_cost_rounding_bits: AD_COST_ROUNDING_BITS,
        }
    }
}

/// A successfully parsed bid.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBid {
    /// The ad the script bid on, without counter keys.
    pub ad: AdData,
    /// Strictly positive bid.
    pub bid: f64,
    /// Cost, present only when extraction is enabled.
    pub ad_cost: Option<AdCost>,
    /// Declared debug report URLs.
    pub debug: DeclaredDebugUris,
}

/// A successfully parsed score.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedScore {
    /// Seller-assigned score.
    pub score: f64,
    /// Seller reject reason.
    pub reject_reason: Option<String>,
    /// Declared debug report URLs.
    pub debug: DeclaredDebugUris,
}

/// Output of a batch driver.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutput {
    /// Batch status; `None` if absent or not an integer.
    pub status: Option<i64>,
    /// Per-item results in input order.
    pub results: Vec<Value>,
}

impl BatchOutput {
    /// Returns `true` if the batch reported success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == Some(STATUS_SUCCESS)
    }
}

// =============================================================================
// Bids
// =============================================================================

/// Parses the raw output of one per-candidate `generateBid` call.
///
/// # Errors
///
/// Returns the reason the candidate is excluded.
pub fn parse_bid_output(raw: &str, options: BidParseOptions) -> ItemOutcome<ParsedBid> {
    let value: Value = serde_json::from_str(raw).map_err(|_| ExclusionReason::NotJson)?;
    parse_bid_item(&value, options)
}

/// Parses one per-candidate bid object.
///
/// # Errors
///
/// Returns the reason the candidate is excluded.
pub fn parse_bid_item(value: &Value, options: BidParseOptions) -> ItemOutcome<ParsedBid> {
    let object = value.as_object().ok_or(ExclusionReason::NotAnObject)?;
    check_status(object)?;
    let ad = object
        .get(AD_FIELD)
        .and_then(parse_ad)
        .ok_or(ExclusionReason::InvalidField { field: AD_FIELD })?;
    finish_bid(object, ad, options)
}

/// Parses the single item returned by the whole-audience driver.
///
/// The item carries the render URI in `render` and the chosen ad (or its
/// metadata) in `ad`.
///
/// # Errors
///
/// Returns the reason the bid is excluded.
pub fn parse_whole_audience_item(
    value: &Value,
    options: BidParseOptions,
) -> ItemOutcome<ParsedBid> {
    let object = value.as_object().ok_or(ExclusionReason::NotAnObject)?;
    let render_uri = object
        .get(RENDER_FIELD)
        .and_then(Value::as_str)
        .and_then(|s| Url::parse(s).ok())
        .ok_or(ExclusionReason::InvalidField {
            field: RENDER_FIELD,
        })?;
    let metadata = match object.get(AD_FIELD) {
        Some(Value::Object(ad)) if ad.contains_key("metadata") => ad["metadata"].clone(),
        Some(other) => other.clone(),
        None => Value::Null,
    };
    finish_bid(object, AdData::new(render_uri, metadata), options)
}

fn finish_bid(
    object: &Map<String, Value>,
    ad: AdData,
    options: BidParseOptions,
) -> ItemOutcome<ParsedBid> {
    let bid = object
        .get(BID_FIELD)
        .and_then(Value::as_f64)
        .ok_or(ExclusionReason::InvalidField { field: BID_FIELD })?;
    if !(bid.is_finite() && bid > 0.0) {
        return Err(ExclusionReason::NonPositiveBid { bid });
    }
    let ad_cost = if options.ad_cost_extraction {
        let value = object
            .get(AD_COST_FIELD)
            .and_then(Value::as_f64)
            .filter(|cost| cost.is_finite())
            .ok_or(ExclusionReason::MissingAdCost)?;
        Some(AdCost {
            value,
            rounding_bits: options.ad_cost_rounding_bits,
        })
    } else {
        None
    };
    Ok(ParsedBid {
        ad,
        bid,
        ad_cost,
        debug: declared_debug_uris(object),
    })
}

fn parse_ad(value: &Value) -> Option<AdData> {
    let object = value.as_object()?;
    let render_uri = Url::parse(object.get("render_uri")?.as_str()?).ok()?;
    let metadata = object.get("metadata").cloned().unwrap_or(Value::Null);
    Some(AdData::new(render_uri, metadata))
}

// =============================================================================
// Scores
// =============================================================================

/// Parses one item of the scoring driver's results.
///
/// # Errors
///
/// Returns the reason the score is excluded.
pub fn parse_score_item(value: &Value) -> ItemOutcome<ParsedScore> {
    let object = value.as_object().ok_or(ExclusionReason::NotAnObject)?;
    check_status(object)?;
    let score = object
        .get(SCORE_FIELD)
        .and_then(Value::as_f64)
        .filter(|score| score.is_finite())
        .ok_or(ExclusionReason::InvalidField { field: SCORE_FIELD })?;
    let reject_reason = object
        .get(REJECT_REASON_FIELD)
        .and_then(Value::as_str)
        .filter(|reason| !reason.is_empty())
        .map(str::to_string);
    Ok(ParsedScore {
        score,
        reject_reason,
        debug: declared_debug_uris(object),
    })
}

// =============================================================================
// Batches
// =============================================================================

/// Parses the `{status, results}` envelope produced by a batch driver.
///
/// A missing or null `results` is an empty list.
///
/// # Errors
///
/// - [`ScriptFailure::MalformedOutput`] if the output is not a JSON object
/// - [`ScriptFailure::SemanticOutput`] if `results` is not a list
pub fn parse_batch(raw: &str) -> Result<BatchOutput, ScriptFailure> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| ScriptFailure::malformed(format!("batch output is not JSON: {e}")))?;
    let Value::Object(mut object) = value else {
        return Err(ScriptFailure::malformed("batch output is not an object"));
    };
    let status = object.get(STATUS_FIELD).and_then(Value::as_i64);
    let results = match object.remove(RESULTS_FIELD) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(ScriptFailure::semantic("batch results is not a list")),
    };
    Ok(BatchOutput { status, results })
}

/// Interprets the outcome selection driver's output.
///
/// Exactly one result is required: `null` selects nothing, an object with an
/// `id` selects that ad selection.
///
/// # Errors
///
/// Returns [`ScriptFailure::SemanticOutput`] if the status is not success,
/// the result count is not one, or the result has no usable id.
pub fn parse_selection(batch: &BatchOutput) -> Result<Option<AdSelectionId>, ScriptFailure> {
    if !batch.is_success() || batch.results.len() != 1 {
        return Err(ScriptFailure::semantic(format!(
            "outcome selection returned status {:?} with {} results, expected exactly one",
            batch.status,
            batch.results.len()
        )));
    }
    match &batch.results[0] {
        Value::Null => Ok(None),
        Value::Object(object) => {
            let id = match object.get(ID_FIELD) {
                Some(Value::String(s)) => s.parse::<u64>().ok(),
                Some(Value::Number(n)) => n.as_u64(),
                _ => None,
            };
            id.map(|id| Some(AdSelectionId::new(id)))
                .ok_or_else(|| ScriptFailure::semantic("selected outcome has no valid id"))
        },
        _ => Err(ScriptFailure::semantic("selected outcome is not an object")),
    }
}

// =============================================================================
// Shared helpers
// =============================================================================

fn check_status(object: &Map<String, Value>) -> ItemOutcome<()> {
    match object.get(STATUS_FIELD) {
        None | Some(Value::Null) => Err(ExclusionReason::MissingStatus),
        Some(value) => match value.as_i64() {
            Some(STATUS_SUCCESS) => Ok(()),
            Some(status) => Err(ExclusionReason::NonZeroStatus { status }),
            None => Err(ExclusionReason::InvalidField {
                field: STATUS_FIELD,
            }),
        },
    }
}

fn declared_debug_uris(object: &Map<String, Value>) -> DeclaredDebugUris {
    let Some(debug) = object.get(DEBUG_FIELD).and_then(Value::as_object) else {
        return DeclaredDebugUris::default();
    };
    let declared = |field: &str| debug.get(field).and_then(Value::as_str).map(str::to_string);
    DeclaredDebugUris {
        win: declared(DEBUG_WIN_FIELD),
        loss: declared(DEBUG_LOSS_FIELD),
    }
}
