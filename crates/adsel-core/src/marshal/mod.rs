//! Argument marshaling.
//!
//! Converts domain values into the ordered [`ScriptArgument`] lists each
//! entry point expects, and resolves which bidding calling convention a
//! buyer script uses.
//!
//! # Calling conventions
//!
//! | Convention      | Selected when            | `generateBid` arguments |
//! |-----------------|--------------------------|-------------------------|
//! | `Current`       | arity probe != 7         | ad, auction, per-buyer, trusted, contextual, audience |
//! | `Legacy`        | arity probe == 7         | as `Current`, with empty user signals before audience |
//! | `WholeAudience` | script version >= 3      | audience (with ads), auction, per-buyer, trusted, contextual |

pub mod copier;
pub mod drivers;

use std::sync::Arc;

use serde_json::{json, Map, Value};

pub use self::copier::{
    copier_for, AdCounterKeyCopier, CopyingCounterKeyCopier, NoOpCounterKeyCopier,
};
use crate::script::ScriptArgument;
use crate::types::{
    AdData, AuctionConfig, CustomAudienceSignals, SelectionCandidate, Signals,
};

/// Arity of the legacy `generateBid` signature.
pub const LEGACY_GENERATE_BID_ARITY: i32 = 7;

/// First bidding logic version that uses the whole-audience convention.
pub const WHOLE_AUDIENCE_MIN_VERSION: u64 = 3;

// =============================================================================
// CallingConvention
// =============================================================================

/// How a buyer's `generateBid` is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    /// Seven arguments, with an empty user signals object second to last.
    Legacy,
    /// Six arguments, once per candidate.
    Current,
    /// Once per audience with the whole candidate list; at most one bid.
    WholeAudience,
}

impl CallingConvention {
    /// Resolves the convention from a declared script version, if that alone
    /// decides it.
    #[must_use]
    pub fn from_version(version: Option<u64>) -> Option<Self> {
        version
            .filter(|v| *v >= WHOLE_AUDIENCE_MIN_VERSION)
            .map(|_| Self::WholeAudience)
    }

    /// Resolves the per-candidate convention from a probed arity.
    ///
    /// Returns `None` when the entry point is absent (`arity < 0`).
    #[must_use]
    pub const fn from_arity(arity: i32) -> Option<Self> {
        match arity {
            a if a < 0 => None,
            LEGACY_GENERATE_BID_ARITY => Some(Self::Legacy),
            _ => Some(Self::Current),
        }
    }

    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Current => "current",
            Self::WholeAudience => "whole_audience",
        }
    }
}

// =============================================================================
// Signal bundles
// =============================================================================

/// Signals a bidding script receives besides the candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct BiddingSignals {
    /// Auction-wide signals.
    pub auction_signals: Signals,
    /// Seller-provided signals for this buyer.
    pub per_buyer_signals: Signals,
    /// Buyer key-value lookups.
    pub trusted_bidding_signals: Signals,
    /// Contextual signals.
    pub contextual_signals: Signals,
    /// The bidding audience.
    pub custom_audience: CustomAudienceSignals,
}

/// Signals a scoring script receives besides the bids.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScoringSignals {
    /// Seller-only signals.
    pub seller_signals: Signals,
    /// Seller key-value lookups.
    pub trusted_scoring_signals: Signals,
    /// Contextual signals.
    pub contextual_signals: Signals,
    /// Provenance of every remarketing bid.
    pub custom_audience_signals: Vec<CustomAudienceSignals>,
}

// =============================================================================
// ArgumentMarshaler
// =============================================================================

/// Builds script argument lists.
#[derive(Debug, Clone)]
pub struct ArgumentMarshaler {
    copier: Arc<dyn AdCounterKeyCopier>,
}

impl Default for ArgumentMarshaler {
    fn default() -> Self {
        Self::new(Arc::new(NoOpCounterKeyCopier))
    }
}

impl ArgumentMarshaler {
    /// Creates a marshaler using `copier` for counter keys.
    #[must_use]
    pub fn new(copier: Arc<dyn AdCounterKeyCopier>) -> Self {
        Self { copier }
    }

    /// The counter-key copier in use.
    #[must_use]
    pub fn copier(&self) -> &dyn AdCounterKeyCopier {
        self.copier.as_ref()
    }

    /// Marshals a candidate for a bidding script, including counter keys
    /// when the copier exposes them.
    #[must_use]
    pub fn ad_argument(&self, ad: &AdData) -> Value {
        let mut argument = Map::new();
        argument.insert("render_uri".to_string(), Value::from(ad.render_uri.as_str()));
        argument.insert("metadata".to_string(), ad.metadata.clone());
        self.copier.annotate(ad, &mut argument);
        Value::Object(argument)
    }

    /// Marshals an ad for the seller, without counter keys.
    #[must_use]
    pub fn scoring_ad_argument(ad: &AdData) -> Value {
        json!({
            "render_uri": ad.render_uri.as_str(),
            "metadata": ad.metadata,
        })
    }

    /// Marshals audience provenance.
    #[must_use]
    pub fn custom_audience_signals_argument(signals: &CustomAudienceSignals) -> Value {
        json!({
            "owner": signals.owner,
            "buyer": signals.buyer.as_str(),
            "name": signals.name,
            "activation_time": signals.activation_time.timestamp_millis(),
            "expiration_time": signals.expiration_time.timestamp_millis(),
            "user_bidding_signals": signals.user_bidding_signals.as_value(),
        })
    }

    /// Marshals the seller-visible part of an auction config.
    #[must_use]
    pub fn auction_config_argument(config: &AuctionConfig) -> Value {
        let per_buyer_signals: Map<String, Value> = config
            .per_buyer_signals
            .iter()
            .map(|(buyer, signals)| (buyer.to_string(), signals.as_value().clone()))
            .collect();
        json!({
            "seller": config.seller.as_str(),
            "decision_logic_uri": config.decision_logic_uri.as_str(),
            "trusted_scoring_signals_uri": config.trusted_scoring_signals_uri.as_str(),
            "custom_audience_buyers": config
                .custom_audience_buyers
                .iter()
                .map(|buyer| buyer.as_str())
                .collect::<Vec<_>>(),
            "auction_signals": config.auction_signals.as_value(),
            "seller_signals": config.seller_signals.as_value(),
            "per_buyer_signals": per_buyer_signals,
        })
    }

    /// Arguments for one per-candidate `generateBid` call.
    ///
    /// [`CallingConvention::WholeAudience`] is marshaled by
    /// [`Self::whole_audience_arguments`]; passing it here yields the
    /// `Current` list.
    #[must_use]
    pub fn bid_arguments(
        &self,
        convention: CallingConvention,
        ad: &AdData,
        signals: &BiddingSignals,
    ) -> Vec<ScriptArgument> {
        let mut args = vec![
            ScriptArgument::new("ad", self.ad_argument(ad)),
            ScriptArgument::new("auction_signals", signals.auction_signals.as_value().clone()),
            ScriptArgument::new(
                "per_buyer_signals",
                signals.per_buyer_signals.as_value().clone(),
            ),
            ScriptArgument::new(
                "trusted_bidding_signals",
                signals.trusted_bidding_signals.as_value().clone(),
            ),
            ScriptArgument::new(
                "contextual_signals",
                signals.contextual_signals.as_value().clone(),
            ),
        ];
        if convention == CallingConvention::Legacy {
            args.push(ScriptArgument::new(
                "user_signals",
                Signals::empty().as_value().clone(),
            ));
        }
        args.push(ScriptArgument::new(
            "custom_audience_signals",
            Self::custom_audience_signals_argument(&signals.custom_audience),
        ));
        args
    }

    /// Arguments for the whole-audience `generateBid` driver.
    #[must_use]
    pub fn whole_audience_arguments(
        &self,
        candidates: &[AdData],
        signals: &BiddingSignals,
    ) -> Vec<ScriptArgument> {
        let audience = &signals.custom_audience;
        let custom_audience = json!({
            "owner": audience.owner,
            "buyer": audience.buyer.as_str(),
            "name": audience.name,
            "user_bidding_signals": audience.user_bidding_signals.as_value(),
            "ads": candidates
                .iter()
                .map(|ad| self.ad_argument(ad))
                .collect::<Vec<_>>(),
        });
        vec![
            ScriptArgument::new("custom_audience", custom_audience),
            ScriptArgument::new("auction_signals", signals.auction_signals.as_value().clone()),
            ScriptArgument::new(
                "per_buyer_signals",
                signals.per_buyer_signals.as_value().clone(),
            ),
            ScriptArgument::new(
                "trusted_bidding_signals",
                signals.trusted_bidding_signals.as_value().clone(),
            ),
            ScriptArgument::new(
                "contextual_signals",
                signals.contextual_signals.as_value().clone(),
            ),
        ]
    }

    /// Arguments for the scoring driver. `bids` are `(ad, bid)` pairs in
    /// submission order.
    #[must_use]
    pub fn scoring_arguments<'a>(
        bids: impl IntoIterator<Item = (&'a AdData, f64)>,
        config: &AuctionConfig,
        signals: &ScoringSignals,
    ) -> Vec<ScriptArgument> {
        let ads: Vec<Value> = bids
            .into_iter()
            .map(|(ad, bid)| json!({ "ad": Self::scoring_ad_argument(ad), "bid": bid }))
            .collect();
        vec![
            ScriptArgument::new("ads", Value::Array(ads)),
            ScriptArgument::new("auction_config", Self::auction_config_argument(config)),
            ScriptArgument::new("seller_signals", signals.seller_signals.as_value().clone()),
            ScriptArgument::new(
                "trusted_scoring_signals",
                signals.trusted_scoring_signals.as_value().clone(),
            ),
            ScriptArgument::new(
                "contextual_signals",
                signals.contextual_signals.as_value().clone(),
            ),
            ScriptArgument::new(
                "custom_audience_scoring_signals",
                Value::Array(
                    signals
                        .custom_audience_signals
                        .iter()
                        .map(Self::custom_audience_signals_argument)
                        .collect(),
                ),
            ),
        ]
    }

    /// Arguments for the outcome selection driver.
    ///
    /// Ids are passed as decimal strings so that scripts never round them.
    #[must_use]
    pub fn outcome_selection_arguments(
        candidates: &[SelectionCandidate],
        selection_signals: &Signals,
    ) -> Vec<ScriptArgument> {
        let outcomes: Vec<Value> = candidates
            .iter()
            .map(|candidate| {
                json!({
                    "id": candidate.ad_selection_id.to_string(),
                    "bid": candidate.bid,
                    "render_uri": candidate.render_uri.as_str(),
                })
            })
            .collect();
        vec![
            ScriptArgument::new("outcomes", Value::Array(outcomes)),
            ScriptArgument::new("selection_signals", selection_signals.as_value().clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};
    use url::Url;

    use super::*;
    use crate::types::{AdSelectionId, AdTechIdentifier};

    fn audience() -> CustomAudienceSignals {
        CustomAudienceSignals {
            owner: "com.example.app".to_string(),
            buyer: AdTechIdentifier::new("buyer.example"),
            name: "shoes".to_string(),
            activation_time: Utc.timestamp_millis_opt(1_000).unwrap(),
            expiration_time: Utc.timestamp_millis_opt(2_000).unwrap(),
            user_bidding_signals: Signals::from_json_str(r#"{"size":42}"#).unwrap(),
        }
    }

    fn signals() -> BiddingSignals {
        BiddingSignals {
            auction_signals: Signals::from_json_str(r#"{"auction":1}"#).unwrap(),
            per_buyer_signals: Signals::from_json_str(r#"{"buyer":2}"#).unwrap(),
            trusted_bidding_signals: Signals::from_json_str(r#"{"k":"v"}"#).unwrap(),
            contextual_signals: Signals::empty(),
            custom_audience: audience(),
        }
    }

    fn ad() -> AdData {
        AdData::new(
            Url::parse("https://buyer.example/ad/1").unwrap(),
            json!({"price": 3}),
        )
        .with_counter_keys([7, 8])
    }

    #[test]
    fn convention_resolution() {
        assert_eq!(CallingConvention::from_arity(-1), None);
        assert_eq!(
            CallingConvention::from_arity(7),
            Some(CallingConvention::Legacy)
        );
        assert_eq!(
            CallingConvention::from_arity(6),
            Some(CallingConvention::Current)
        );
        assert_eq!(
            CallingConvention::from_arity(0),
            Some(CallingConvention::Current)
        );
        assert_eq!(
            CallingConvention::from_version(Some(3)),
            Some(CallingConvention::WholeAudience)
        );
        assert_eq!(CallingConvention::from_version(Some(2)), None);
        assert_eq!(CallingConvention::from_version(None), None);
    }

    #[test]
    fn current_convention_has_six_arguments_audience_last() {
        let marshaler = ArgumentMarshaler::default();
        let args = marshaler.bid_arguments(CallingConvention::Current, &ad(), &signals());
        let names: Vec<_> = args.iter().map(ScriptArgument::name).collect();
        assert_eq!(
            names,
            [
                "ad",
                "auction_signals",
                "per_buyer_signals",
                "trusted_bidding_signals",
                "contextual_signals",
                "custom_audience_signals"
            ]
        );
        assert_eq!(args[5].value()["user_bidding_signals"], json!({"size": 42}));
    }

    #[test]
    fn legacy_convention_inserts_empty_user_signals_second_to_last() {
        let marshaler = ArgumentMarshaler::default();
        let args = marshaler.bid_arguments(CallingConvention::Legacy, &ad(), &signals());
        assert_eq!(args.len(), LEGACY_GENERATE_BID_ARITY as usize);
        assert_eq!(args[5].name(), "user_signals");
        assert_eq!(args[5].value(), &json!({}));
        assert_eq!(args[6].name(), "custom_audience_signals");
    }

    #[test]
    fn ad_argument_exposes_counter_keys_only_when_copying() {
        let plain = ArgumentMarshaler::default().ad_argument(&ad());
        assert!(plain.get("ad_counter_keys").is_none());
        assert_eq!(plain["render_uri"], "https://buyer.example/ad/1");

        let copying = ArgumentMarshaler::new(copier_for(true)).ad_argument(&ad());
        assert_eq!(copying["ad_counter_keys"], json!([7, 8]));
    }

    #[test]
    fn whole_audience_arguments_embed_all_candidates() {
        let marshaler = ArgumentMarshaler::default();
        let args = marshaler.whole_audience_arguments(&[ad(), ad()], &signals());
        assert_eq!(args.len(), 5);
        assert_eq!(args[0].value()["ads"].as_array().unwrap().len(), 2);
        assert_eq!(args[0].value()["name"], "shoes");
    }

    #[test]
    fn scoring_arguments_preserve_bid_order() {
        let config = AuctionConfig {
            seller: AdTechIdentifier::new("seller.example"),
            decision_logic_uri: Url::parse("https://seller.example/decide.js").unwrap(),
            trusted_scoring_signals_uri: Url::parse("https://seller.example/kv").unwrap(),
            custom_audience_buyers: vec![AdTechIdentifier::new("buyer.example")],
            auction_signals: Signals::empty(),
            seller_signals: Signals::empty(),
            per_buyer_signals: BTreeMap::new(),
            per_buyer_signed_contextual_ads: BTreeMap::new(),
        };
        let first = ad();
        let second = AdData::new(Url::parse("https://buyer.example/ad/2").unwrap(), json!(null));
        let args = ArgumentMarshaler::scoring_arguments(
            [(&first, 1.5), (&second, 0.5)],
            &config,
            &ScoringSignals::default(),
        );
        let ads = args[0].value().as_array().unwrap();
        assert_eq!(ads[0]["bid"], 1.5);
        assert_eq!(ads[1]["ad"]["render_uri"], "https://buyer.example/ad/2");
        assert!(ads[0]["ad"].get("ad_counter_keys").is_none());
        assert_eq!(args[1].value()["seller"], "seller.example");
    }

    #[test]
    fn outcome_ids_are_strings() {
        let args = ArgumentMarshaler::outcome_selection_arguments(
            &[SelectionCandidate {
                ad_selection_id: AdSelectionId::new(u64::MAX),
                bid: 2.0,
                render_uri: Url::parse("https://buyer.example/ad/1").unwrap(),
            }],
            &Signals::empty(),
        );
        assert_eq!(args[0].value()[0]["id"], u64::MAX.to_string());
    }
}
