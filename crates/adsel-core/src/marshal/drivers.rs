//! Generated script code appended to ad tech scripts.
//!
//! Drivers adapt an ad tech entry point to the batch output shape
//! `{status, results: [...]}` consumed by [`crate::parse::parse_batch`];
//! probes answer presence and arity questions about a script.

/// Bidding entry point defined by buyer scripts.
pub const GENERATE_BID: &str = "generateBid";

/// Scoring entry point defined by seller scripts.
pub const SCORE_AD: &str = "scoreAd";

/// Outcome selection entry point defined by seller scripts.
pub const SELECT_OUTCOME: &str = "selectOutcome";

/// Entry point of [`CHECK_FUNCTIONS_PROBE`].
pub const CHECK_FUNCTIONS_ENTRY: &str = "__rb_check_functions";

/// Returns `true` iff every name in its argument list is a function.
pub const CHECK_FUNCTIONS_PROBE: &str = r"
function __rb_check_functions(names) {
  for (const name of names) {
    try {
      if (typeof eval(name) !== 'function') return false;
    } catch (e) {
      if (e instanceof ReferenceError) return false;
      throw e;
    }
  }
  return true;
}
";

/// Entry point of [`ARG_COUNT_PROBE`].
pub const ARG_COUNT_ENTRY: &str = "__rb_arg_count";

/// Returns the declared parameter count of the named function, or -1.
pub const ARG_COUNT_PROBE: &str = r"
function __rb_arg_count(name) {
  try {
    const f = eval(name);
    return typeof f === 'function' ? f.length : -1;
  } catch (e) {
    if (e instanceof ReferenceError) return -1;
    throw e;
  }
}
";

/// Entry point of [`GENERATE_BID_V3_DRIVER`].
pub const GENERATE_BID_V3_ENTRY: &str = "__rb_generate_bid_v3";

/// Calls a whole-audience `generateBid` once and requires a single object
/// carrying `ad`, `bid` and `render`.
pub const GENERATE_BID_V3_DRIVER: &str = r"
function __rb_generate_bid_v3(custom_audience, auction_signals, per_buyer_signals,
    trusted_bidding_signals, contextual_signals) {
  const result = generateBid(custom_audience, auction_signals, per_buyer_signals,
      trusted_bidding_signals, contextual_signals);
  if (Array.isArray(result)) {
    return {status: 0, results: result};
  }
  if (result === Object(result) && 'ad' in result && 'bid' in result && 'render' in result) {
    return {status: 0, results: [result]};
  }
  return {status: -1, results: []};
}
";

/// Entry point of [`SCORE_ADS_DRIVER`].
pub const SCORE_ADS_ENTRY: &str = "__rb_score_ads";

/// Calls `scoreAd` once per submitted bid without short-circuiting.
///
/// A bid whose call throws anything but a `ReferenceError` yields a
/// `{status: -1}` item so the result list stays aligned with the input.
pub const SCORE_ADS_DRIVER: &str = r"
function __rb_score_ads(ads, auction_config, seller_signals, trusted_scoring_signals,
    contextual_signals, custom_audience_scoring_signals) {
  const results = [];
  for (const item of ads) {
    let result;
    try {
      result = scoreAd(item.ad, item.bid, auction_config, seller_signals,
          trusted_scoring_signals, contextual_signals, custom_audience_scoring_signals);
    } catch (e) {
      if (e instanceof ReferenceError) throw e;
      result = {status: -1};
    }
    results.push(result === Object(result) ? result : {status: -1});
  }
  return {status: 0, results: results};
}
";

/// Entry point of [`SELECT_OUTCOME_DRIVER`].
pub const SELECT_OUTCOME_ENTRY: &str = "__rb_select_outcome";

/// Calls `selectOutcome` once; its `result` must be a single outcome or null.
pub const SELECT_OUTCOME_DRIVER: &str = r"
function __rb_select_outcome(outcomes, selection_signals) {
  const output = selectOutcome(outcomes, selection_signals);
  if (output !== Object(output)) return {status: -1, results: []};
  const selected = output.result === undefined ? null : output.result;
  return {status: output.status, results: Array.isArray(selected) ? selected : [selected]};
}
";

/// Appends `driver` to `script`.
#[must_use]
pub fn wrap(script: &str, driver: &str) -> String {
    let mut wrapped = String::with_capacity(script.len() + driver.len() + 1);
    wrapped.push_str(script);
    wrapped.push('\n');
    wrapped.push_str(driver);
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::is_valid_entry_point;

    #[test]
    fn driver_entry_points_are_defined_by_their_drivers() {
        for (entry, driver) in [
            (CHECK_FUNCTIONS_ENTRY, CHECK_FUNCTIONS_PROBE),
            (ARG_COUNT_ENTRY, ARG_COUNT_PROBE),
            (GENERATE_BID_V3_ENTRY, GENERATE_BID_V3_DRIVER),
            (SCORE_ADS_ENTRY, SCORE_ADS_DRIVER),
            (SELECT_OUTCOME_ENTRY, SELECT_OUTCOME_DRIVER),
        ] {
            assert!(is_valid_entry_point(entry));
            assert!(driver.contains(&format!("function {entry}(")));
        }
    }

    #[test]
    fn wrap_keeps_script_first() {
        let wrapped = wrap("function scoreAd() {}", SCORE_ADS_DRIVER);
        assert!(wrapped.starts_with("function scoreAd() {}\n"));
        assert!(wrapped.ends_with(SCORE_ADS_DRIVER));
    }
}
