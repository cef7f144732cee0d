//! Counter-key copier strategies.
//!
//! Ad counter keys are opaque to bidding scripts. Whether they are exposed
//! to the script and carried onto the resulting bid is a feature toggle, so
//! the marshaler delegates both directions to an injected copier.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::types::AdData;

/// Field holding counter keys in an ad argument.
pub const AD_COUNTER_KEYS_FIELD: &str = "ad_counter_keys";

/// Moves counter keys into script arguments and back onto results.
pub trait AdCounterKeyCopier: Send + Sync + fmt::Debug {
    /// Adds `ad`'s counter keys to its marshaled `argument`, if copying.
    fn annotate(&self, ad: &AdData, argument: &mut Map<String, Value>);

    /// Re-attaches counter keys to a script-returned ad by matching its
    /// render URI against the submitted `candidates`.
    fn restore(&self, ad: AdData, candidates: &[AdData]) -> AdData;
}

/// Drops counter keys in both directions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpCounterKeyCopier;

impl AdCounterKeyCopier for NoOpCounterKeyCopier {
    fn annotate(&self, _ad: &AdData, _argument: &mut Map<String, Value>) {}

    fn restore(&self, mut ad: AdData, _candidates: &[AdData]) -> AdData {
        ad.ad_counter_keys = BTreeSet::new();
        ad
    }
}

/// Serializes counter keys into the ad argument and restores them by render
/// URI.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyingCounterKeyCopier;

impl AdCounterKeyCopier for CopyingCounterKeyCopier {
    fn annotate(&self, ad: &AdData, argument: &mut Map<String, Value>) {
        if ad.ad_counter_keys.is_empty() {
            return;
        }
        argument.insert(
            AD_COUNTER_KEYS_FIELD.to_string(),
            Value::Array(
                ad.ad_counter_keys
                    .iter()
                    .map(|key| Value::from(*key))
                    .collect(),
            ),
        );
    }

    fn restore(&self, mut ad: AdData, candidates: &[AdData]) -> AdData {
        ad.ad_counter_keys = candidates
            .iter()
            .find(|candidate| candidate.render_uri == ad.render_uri)
            .map(|candidate| candidate.ad_counter_keys.clone())
            .unwrap_or_default();
        ad
    }
}

/// Returns the copier for the counter-key copying toggle.
#[must_use]
pub fn copier_for(copying_enabled: bool) -> Arc<dyn AdCounterKeyCopier> {
    if copying_enabled {
        Arc::new(CopyingCounterKeyCopier)
    } else {
        Arc::new(NoOpCounterKeyCopier)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use url::Url;

    use super::*;

    fn ad(uri: &str, keys: &[i32]) -> AdData {
        AdData::new(Url::parse(uri).unwrap(), json!({})).with_counter_keys(keys.iter().copied())
    }

    #[test]
    fn copying_round_trips_keys_by_render_uri() {
        let candidates = vec![ad("https://b.example/1", &[3, 1]), ad("https://b.example/2", &[9])];
        let copier = CopyingCounterKeyCopier;

        let mut argument = Map::new();
        copier.annotate(&candidates[0], &mut argument);
        assert_eq!(argument[AD_COUNTER_KEYS_FIELD], json!([1, 3]));

        let returned = ad("https://b.example/1", &[]);
        let restored = copier.restore(returned, &candidates);
        assert_eq!(restored.ad_counter_keys, candidates[0].ad_counter_keys);
    }

    #[test]
    fn copying_yields_empty_keys_for_unknown_render_uri() {
        let candidates = vec![ad("https://b.example/1", &[1])];
        let restored = CopyingCounterKeyCopier.restore(ad("https://b.example/x", &[5]), &candidates);
        assert!(restored.ad_counter_keys.is_empty());
    }

    #[test]
    fn no_op_never_exposes_or_restores_keys() {
        let candidates = vec![ad("https://b.example/1", &[1, 2])];
        let copier = NoOpCounterKeyCopier;

        let mut argument = Map::new();
        copier.annotate(&candidates[0], &mut argument);
        assert!(argument.is_empty());

        let restored = copier.restore(candidates[0].clone(), &candidates);
        assert!(restored.ad_counter_keys.is_empty());
    }
}
