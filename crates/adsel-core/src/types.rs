//! Auction data model.
//!
//! All types here are immutable value records. They are produced by storage
//! or by the request surface, flow through bidding and scoring, and are never
//! mutated in place by the orchestrators.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

// =============================================================================
// Identifiers
// =============================================================================

/// Identity of an ad tech (buyer or seller), usually its registrable domain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdTechIdentifier(String);

impl AdTechIdentifier {
    /// Creates an identifier from any string-like value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if `host` is this ad tech or one of its subdomains.
    #[must_use]
    pub fn matches_host(&self, host: &str) -> bool {
        host == self.0
            || host
                .strip_suffix(self.0.as_str())
                .is_some_and(|prefix| prefix.ends_with('.'))
    }
}

impl fmt::Display for AdTechIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AdTechIdentifier {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier assigned to one completed ad selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdSelectionId(u64);

impl AdSelectionId {
    /// Wraps a raw id value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AdSelectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content hash of an [`AuctionConfig`], used to key developer overrides.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AuctionConfigId([u8; 32]);

impl AuctionConfigId {
    /// Returns the raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the lowercase hex encoding of the digest.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for AuctionConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AuctionConfigId")
            .field(&self.to_hex())
            .finish()
    }
}

impl fmt::Display for AuctionConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// =============================================================================
// Signals
// =============================================================================

/// An opaque JSON signals blob handed to scripts unchanged.
///
/// Defaults to the empty object `{}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signals(serde_json::Value);

impl Signals {
    /// The empty signals object.
    #[must_use]
    pub fn empty() -> Self {
        Self(serde_json::Value::Object(serde_json::Map::new()))
    }

    /// Wraps an already-parsed JSON value.
    #[must_use]
    pub const fn from_value(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Parses a signals blob from JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if `text` is not valid JSON.
    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text).map(Self)
    }

    /// Returns the underlying JSON value.
    #[must_use]
    pub const fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Returns `true` if this is the empty object.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.as_object().is_some_and(serde_json::Map::is_empty)
    }
}

impl Default for Signals {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for Signals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Creatives and audiences
// =============================================================================

/// A candidate creative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdData {
    /// Where the creative is rendered from.
    pub render_uri: Url,

    /// Free-form metadata interpreted only by scripts.
    #[serde(default)]
    pub metadata: serde_json::Value,

    /// Opaque counter keys used by frequency capping.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub ad_counter_keys: BTreeSet<i32>,
}

impl AdData {
    /// Creates a creative with no counter keys.
    #[must_use]
    pub fn new(render_uri: Url, metadata: serde_json::Value) -> Self {
        Self {
            render_uri,
            metadata,
            ad_counter_keys: BTreeSet::new(),
        }
    }

    /// Attaches counter keys.
    #[must_use]
    pub fn with_counter_keys(mut self, keys: impl IntoIterator<Item = i32>) -> Self {
        self.ad_counter_keys = keys.into_iter().collect();
        self
    }
}

/// Location and keys of a buyer's trusted bidding signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedBiddingData {
    /// Key-value server endpoint.
    pub uri: Url,

    /// Keys this audience looks up.
    #[serde(default)]
    pub keys: Vec<String>,
}

/// A named group of creatives belonging to one buyer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomAudience {
    /// Package or principal that joined the audience.
    pub owner: String,

    /// Buyer that bids on behalf of this audience.
    pub buyer: AdTechIdentifier,

    /// Audience name, unique per (owner, buyer).
    pub name: String,

    /// Instant from which the audience participates.
    pub activation_time: DateTime<Utc>,

    /// Instant after which the audience no longer participates.
    pub expiration_time: DateTime<Utc>,

    /// Per-audience signals passed to the bidding script.
    #[serde(default)]
    pub user_bidding_signals: Signals,

    /// Location of the buyer's bidding script.
    pub bidding_logic_uri: Url,

    /// Trusted bidding signals lookup, if any.
    #[serde(default)]
    pub trusted_bidding_data: Option<TrustedBiddingData>,

    /// Candidate creatives.
    #[serde(default)]
    pub ads: Vec<AdData>,
}

impl CustomAudience {
    /// Returns `true` if the audience is active at `now`.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.activation_time <= now && now < self.expiration_time
    }

    /// Returns the provenance signals for bids made by this audience.
    #[must_use]
    pub fn signals(&self) -> CustomAudienceSignals {
        CustomAudienceSignals {
            owner: self.owner.clone(),
            buyer: self.buyer.clone(),
            name: self.name.clone(),
            activation_time: self.activation_time,
            expiration_time: self.expiration_time,
            user_bidding_signals: self.user_bidding_signals.clone(),
        }
    }
}

/// Provenance of a bid made on behalf of a custom audience.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomAudienceSignals {
    /// Audience owner.
    pub owner: String,
    /// Bidding buyer.
    pub buyer: AdTechIdentifier,
    /// Audience name.
    pub name: String,
    /// Activation instant.
    pub activation_time: DateTime<Utc>,
    /// Expiration instant.
    pub expiration_time: DateTime<Utc>,
    /// Per-audience signals blob.
    #[serde(default)]
    pub user_bidding_signals: Signals,
}

// =============================================================================
// Bids and scores
// =============================================================================

/// Cost of an ad when billed per click, with its stochastic rounding width.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdCost {
    /// Cost value declared by the bidding script.
    pub value: f64,
    /// Number of bits kept when the cost is stochastically rounded.
    pub rounding_bits: u32,
}

/// A debug report URI, or the empty sentinel.
///
/// Never absent: missing, malformed, or suppressed URIs are all represented
/// by [`DebugUri::empty`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DebugUri(String);

impl DebugUri {
    /// The empty sentinel.
    #[must_use]
    pub const fn empty() -> Self {
        Self(String::new())
    }

    /// Parses a script-declared URI, yielding the sentinel if it is not an
    /// absolute URL.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        Url::parse(value).map_or_else(|_| Self::empty(), |url| Self(url.into()))
    }

    /// Returns `true` for the sentinel.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the URI text (empty for the sentinel).
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Win and loss debug report URIs attached to a bid or a score.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugReportUris {
    /// Reported if the ad wins.
    pub win: DebugUri,
    /// Reported if the ad loses.
    pub loss: DebugUri,
}

impl DebugReportUris {
    /// Both URIs set to the empty sentinel.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            win: DebugUri::empty(),
            loss: DebugUri::empty(),
        }
    }
}

/// A creative paired with a bid, as carried by signed contextual bundles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdWithBid {
    /// The creative.
    pub ad: AdData,
    /// The bid value.
    pub bid: f64,
}

/// Output of bidding for one creative.
///
/// The bid is always strictly positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidResult {
    /// The creative the script bid on, with counter keys as restored by the
    /// active copier.
    pub ad: AdData,
    /// Bid value.
    pub bid: f64,
    /// Cost record, only when cost extraction is enabled.
    #[serde(default)]
    pub ad_cost: Option<AdCost>,
    /// Buyer debug report URIs.
    #[serde(default)]
    pub debug_reports: DebugReportUris,
}

/// Bundle of pre-computed contextual bids supplied by the seller for a buyer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedContextualAds {
    /// Buyer the bids belong to.
    pub buyer: AdTechIdentifier,
    /// Buyer decision logic location, used for reporting.
    pub decision_logic_uri: Url,
    /// The bids.
    #[serde(default)]
    pub ads_with_bid: Vec<AdWithBid>,
}

/// Where a scored bid came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BidSource {
    /// Generated on-device for a custom audience.
    CustomAudience(CustomAudienceSignals),
    /// Supplied by the seller as a signed contextual bid.
    Contextual {
        /// Buyer of the contextual bid.
        buyer: AdTechIdentifier,
    },
}

impl BidSource {
    /// Returns the buyer responsible for the bid.
    #[must_use]
    pub const fn buyer(&self) -> &AdTechIdentifier {
        match self {
            Self::CustomAudience(signals) => &signals.buyer,
            Self::Contextual { buyer } => buyer,
        }
    }
}

/// Output of scoring for one submitted bid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    /// Position of the bid in the submitted list (remarketing first).
    pub submission_index: usize,
    /// The scored bid.
    pub bid: BidResult,
    /// Origin of the bid.
    pub source: BidSource,
    /// Seller-assigned desirability.
    pub score: f64,
    /// Seller debug report URIs.
    #[serde(default)]
    pub debug_reports: DebugReportUris,
    /// Seller reject reason, verbatim.
    #[serde(default)]
    pub reject_reason: Option<String>,
    /// Seller contextual signals, e.g. a trusted signals data version.
    #[serde(default)]
    pub seller_contextual_signals: Signals,
}

/// A previously completed ad selection offered to outcome selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionCandidate {
    /// Id of the completed selection.
    pub ad_selection_id: AdSelectionId,
    /// Winning bid of that selection.
    pub bid: f64,
    /// Winning render URI of that selection.
    pub render_uri: Url,
}

// =============================================================================
// Auction configuration
// =============================================================================

/// Seller-supplied configuration for one auction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuctionConfig {
    /// Seller running the auction.
    pub seller: AdTechIdentifier,

    /// Location of the seller's scoring script.
    pub decision_logic_uri: Url,

    /// Location of the seller's trusted scoring signals.
    pub trusted_scoring_signals_uri: Url,

    /// Buyers allowed to bid with custom audiences, in participation order.
    #[serde(default)]
    pub custom_audience_buyers: Vec<AdTechIdentifier>,

    /// Signals shared with every buyer and the seller.
    #[serde(default)]
    pub auction_signals: Signals,

    /// Signals for the seller's scoring script only.
    #[serde(default)]
    pub seller_signals: Signals,

    /// Signals for each buyer's bidding script.
    #[serde(default)]
    pub per_buyer_signals: BTreeMap<AdTechIdentifier, Signals>,

    /// Signed contextual bids keyed by buyer.
    #[serde(default)]
    pub per_buyer_signed_contextual_ads: BTreeMap<AdTechIdentifier, SignedContextualAds>,
}

impl AuctionConfig {
    /// Returns the per-buyer signals for `buyer`, or empty signals.
    #[must_use]
    pub fn per_buyer_signals_for(&self, buyer: &AdTechIdentifier) -> Signals {
        self.per_buyer_signals.get(buyer).cloned().unwrap_or_default()
    }

    /// Computes the content identity of this configuration.
    ///
    /// Two configs with equal fields always produce the same id.
    #[must_use]
    pub fn id(&self) -> AuctionConfigId {
        let mut hasher = blake3::Hasher::new();
        let mut field = |bytes: &[u8]| {
            hasher.update(&(bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        };
        field(self.seller.as_str().as_bytes());
        field(self.decision_logic_uri.as_str().as_bytes());
        field(self.trusted_scoring_signals_uri.as_str().as_bytes());
        for buyer in &self.custom_audience_buyers {
            field(buyer.as_str().as_bytes());
        }
        field(self.auction_signals.to_string().as_bytes());
        field(self.seller_signals.to_string().as_bytes());
        for (buyer, signals) in &self.per_buyer_signals {
            field(buyer.as_str().as_bytes());
            field(signals.to_string().as_bytes());
        }
        for (buyer, bundle) in &self.per_buyer_signed_contextual_ads {
            field(buyer.as_str().as_bytes());
            field(bundle.decision_logic_uri.as_str().as_bytes());
            for ad in &bundle.ads_with_bid {
                field(ad.ad.render_uri.as_str().as_bytes());
                field(&ad.bid.to_le_bytes());
            }
        }
        AuctionConfigId(*hasher.finalize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuctionConfig {
        AuctionConfig {
            seller: AdTechIdentifier::new("seller.example"),
            decision_logic_uri: Url::parse("https://seller.example/decide.js").unwrap(),
            trusted_scoring_signals_uri: Url::parse("https://seller.example/signals").unwrap(),
            custom_audience_buyers: vec![AdTechIdentifier::new("buyer.example")],
            auction_signals: Signals::empty(),
            seller_signals: Signals::empty(),
            per_buyer_signals: BTreeMap::new(),
            per_buyer_signed_contextual_ads: BTreeMap::new(),
        }
    }

    #[test]
    fn auction_config_id_is_stable_and_content_sensitive() {
        let a = config();
        let b = config();
        assert_eq!(a.id(), b.id());

        let mut c = config();
        c.seller_signals = Signals::from_json_str(r#"{"floor":1}"#).unwrap();
        assert_ne!(a.id(), c.id());
        assert_eq!(a.id().to_hex().len(), 64);
    }

    #[test]
    fn debug_uri_sentinel_for_invalid_values() {
        assert!(DebugUri::parse("not a url").is_empty());
        assert!(DebugUri::parse("").is_empty());
        let uri = DebugUri::parse("https://buyer.example/win");
        assert_eq!(uri.as_str(), "https://buyer.example/win");
    }

    #[test]
    fn ad_tech_matches_subdomains_only() {
        let buyer = AdTechIdentifier::new("buyer.example");
        assert!(buyer.matches_host("buyer.example"));
        assert!(buyer.matches_host("reports.buyer.example"));
        assert!(!buyer.matches_host("evilbuyer.example"));
    }

    #[test]
    fn custom_audience_activity_window_is_half_open() {
        let start = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let end = DateTime::parse_from_rfc3339("2026-02-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let audience = CustomAudience {
            owner: "com.example.app".to_string(),
            buyer: AdTechIdentifier::new("buyer.example"),
            name: "shoes".to_string(),
            activation_time: start,
            expiration_time: end,
            user_bidding_signals: Signals::empty(),
            bidding_logic_uri: Url::parse("https://buyer.example/bid.js").unwrap(),
            trusted_bidding_data: None,
            ads: Vec::new(),
        };
        assert!(audience.is_active_at(start));
        assert!(!audience.is_active_at(end));
    }

    #[test]
    fn signals_default_to_empty_object() {
        let signals = Signals::default();
        assert!(signals.is_empty());
        assert_eq!(signals.to_string(), "{}");
        assert!(Signals::from_json_str("{broken").is_err());
    }
}
