//! Debug report finalization.
//!
//! After a winner is chosen, each scored bid contributes its win URIs (if it
//! won) or loss URIs (otherwise), from both the buyer and the seller. Auction
//! variables are substituted into the URI text, then URIs are filtered:
//!
//! - scheme must be `https` and length below [`MAX_DEBUG_URI_LEN`]
//! - host must belong to the ad tech that declared it
//! - at most [`MAX_DEBUG_URIS_PER_AD_TECH`] URIs per host

use std::collections::HashMap;

use url::Url;

use crate::types::{AdTechIdentifier, DebugUri, ScoreResult};

/// URIs at or above this length are dropped.
pub const MAX_DEBUG_URI_LEN: usize = 2048;

/// Maximum URIs kept per reporting host.
pub const MAX_DEBUG_URIS_PER_AD_TECH: usize = 75;

/// Value substituted for variables that have no value.
pub const UNKNOWN_VARIABLE: &str = "unknown";

/// Reject reasons that are reported verbatim.
pub const VALID_SELLER_REJECT_REASONS: [&str; 8] = [
    "not-available",
    "invalid-bid",
    "bid-below-auction-floor",
    "pending-approval-by-exchange",
    "disapproved-by-exchange",
    "blocked-by-publisher",
    "language-exclusions",
    "category-exclusions",
];

const WINNING_BID: &str = "winningBid";
const MADE_WINNING_BID: &str = "madeWinningBid";
const HIGHEST_SCORING_OTHER_BID: &str = "highestScoringOtherBid";
const MADE_HIGHEST_SCORING_OTHER_BID: &str = "madeHighestScoringOtherBid";
const REJECT_REASON: &str = "rejectReason";

/// Collects the finalized debug report URLs of a completed auction.
///
/// `winner` is the index into `scores` of the winning result, if any. The
/// highest-scoring other bid is the best-scoring non-winner.
#[must_use]
pub fn finalize_debug_reports(
    seller: &AdTechIdentifier,
    scores: &[ScoreResult],
    winner: Option<usize>,
) -> Vec<Url> {
    let winning = winner.and_then(|i| scores.get(i));
    let other = scores
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != winner)
        .max_by(|(ia, a), (ib, b)| a.score.total_cmp(&b.score).then(ib.cmp(ia)))
        .map(|(_, score)| score);

    let mut per_host: HashMap<String, usize> = HashMap::new();
    let mut finalized = Vec::new();
    for (index, score) in scores.iter().enumerate() {
        let won = Some(index) == winner;
        let buyer = score.source.buyer();
        let variables = [
            (
                WINNING_BID,
                winning.map_or_else(|| UNKNOWN_VARIABLE.to_string(), |w| w.bid.bid.to_string()),
            ),
            (
                MADE_WINNING_BID,
                winning
                    .is_some_and(|w| w.source.buyer() == buyer)
                    .to_string(),
            ),
            (
                HIGHEST_SCORING_OTHER_BID,
                other.map_or_else(|| UNKNOWN_VARIABLE.to_string(), |o| o.bid.bid.to_string()),
            ),
            (
                MADE_HIGHEST_SCORING_OTHER_BID,
                other.is_some_and(|o| o.source.buyer() == buyer).to_string(),
            ),
            (
                REJECT_REASON,
                score
                    .reject_reason
                    .as_deref()
                    .filter(|reason| VALID_SELLER_REJECT_REASONS.contains(reason))
                    .unwrap_or(UNKNOWN_VARIABLE)
                    .to_string(),
            ),
        ];
        let (buyer_uri, seller_uri) = if won {
            (&score.bid.debug_reports.win, &score.debug_reports.win)
        } else {
            (&score.bid.debug_reports.loss, &score.debug_reports.loss)
        };
        for (uri, ad_tech) in [(buyer_uri, buyer), (seller_uri, seller)] {
            let Some(url) = finalize_uri(uri, ad_tech, &variables) else {
                continue;
            };
            let host = url.host_str().unwrap_or_default().to_string();
            let count = per_host.entry(host).or_default();
            if *count < MAX_DEBUG_URIS_PER_AD_TECH {
                *count += 1;
                finalized.push(url);
            }
        }
    }
    finalized
}

fn finalize_uri(
    uri: &DebugUri,
    ad_tech: &AdTechIdentifier,
    variables: &[(&str, String)],
) -> Option<Url> {
    if uri.is_empty() {
        return None;
    }
    let mut text = uri.as_str().to_string();
    for (name, value) in variables {
        text = text
            .replace(&format!("${{{name}}}"), value)
            .replace(&format!("$%7B{name}%7D"), value);
    }
    let url = Url::parse(&text).ok()?;
    (url.scheme() == "https"
        && url.as_str().len() < MAX_DEBUG_URI_LEN
        && url.host_str().is_some_and(|host| ad_tech.matches_host(host)))
    .then_some(url)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use url::Url;

    use super::*;
    use crate::types::{
        AdData, BidResult, BidSource, CustomAudienceSignals, DebugReportUris, Signals,
    };

    fn score(buyer: &str, bid: f64, score: f64, win: &str, loss: &str) -> ScoreResult {
        ScoreResult {
            submission_index: 0,
            bid: BidResult {
                ad: AdData::new(
                    Url::parse(&format!("https://{buyer}/ad")).unwrap(),
                    serde_json::Value::Null,
                ),
                bid,
                ad_cost: None,
                debug_reports: DebugReportUris {
                    win: DebugUri::parse(win),
                    loss: DebugUri::parse(loss),
                },
            },
            source: BidSource::CustomAudience(CustomAudienceSignals {
                owner: "owner".to_string(),
                buyer: AdTechIdentifier::new(buyer),
                name: "ca".to_string(),
                activation_time: Utc::now(),
                expiration_time: Utc::now(),
                user_bidding_signals: Signals::empty(),
            }),
            score,
            debug_reports: DebugReportUris::empty(),
            reject_reason: None,
            seller_contextual_signals: Signals::empty(),
        }
    }

    #[test]
    fn winner_reports_win_and_others_report_loss_with_variables() {
        let seller = AdTechIdentifier::new("seller.example");
        let scores = vec![
            score(
                "a.example",
                1.0,
                1.0,
                "https://a.example/win",
                "https://a.example/loss?winner=${winningBid}&reason=${rejectReason}",
            ),
            score(
                "b.example",
                2.0,
                2.0,
                "https://b.example/win?other=${highestScoringOtherBid}",
                "https://b.example/loss",
            ),
        ];
        let urls = finalize_debug_reports(&seller, &scores, Some(1));
        let urls: Vec<_> = urls.iter().map(Url::as_str).collect();
        assert_eq!(
            urls,
            [
                "https://a.example/loss?winner=2&reason=unknown",
                "https://b.example/win?other=1",
            ]
        );
    }

    #[test]
    fn foreign_hosts_and_plain_http_are_dropped() {
        let seller = AdTechIdentifier::new("seller.example");
        let scores = vec![
            score("a.example", 1.0, 1.0, "https://evil.example/win", ""),
            score("b.example", 1.0, 0.5, "", "http://b.example/loss"),
        ];
        assert!(finalize_debug_reports(&seller, &scores, Some(0)).is_empty());
    }

    #[test]
    fn per_host_limit_applies() {
        let seller = AdTechIdentifier::new("seller.example");
        let scores: Vec<_> = (0..MAX_DEBUG_URIS_PER_AD_TECH + 5)
            .map(|_| score("a.example", 1.0, 1.0, "", "https://a.example/loss"))
            .collect();
        assert_eq!(
            finalize_debug_reports(&seller, &scores, None).len(),
            MAX_DEBUG_URIS_PER_AD_TECH
        );
    }

    #[test]
    fn encoded_path_variables_are_substituted() {
        let seller = AdTechIdentifier::new("seller.example");
        let scores = vec![score(
            "a.example",
            3.0,
            1.0,
            "https://a.example/win/${winningBid}",
            "",
        )];
        let urls = finalize_debug_reports(&seller, &scores, Some(0));
        assert_eq!(urls[0].as_str(), "https://a.example/win/3");
    }
}
