//! Debug reporting.
//!
//! Scripts may declare win/loss debug report URLs. Whether those survive
//! into bid and score results is decided by an injected
//! [`DebugReportingStrategy`]; orchestrators never branch on a flag.
//! [`finalize`] turns the surviving URIs of a completed auction into the
//! list of report URLs to send.

pub mod finalize;

use std::fmt;
use std::sync::Arc;

pub use self::finalize::{finalize_debug_reports, MAX_DEBUG_URIS_PER_AD_TECH, MAX_DEBUG_URI_LEN};
use crate::parse::DeclaredDebugUris;
use crate::types::{DebugReportUris, DebugUri};

/// Decides which declared debug report URLs are kept.
pub trait DebugReportingStrategy: Send + Sync + fmt::Debug {
    /// Converts declared URLs into result URIs.
    fn resolve(&self, declared: &DeclaredDebugUris) -> DebugReportUris;

    /// Returns `true` if declared URLs can survive resolution.
    fn is_enabled(&self) -> bool;
}

/// Keeps every declared URL that parses as an absolute URL.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugReportingEnabled;

impl DebugReportingStrategy for DebugReportingEnabled {
    fn resolve(&self, declared: &DeclaredDebugUris) -> DebugReportUris {
        let resolve = |uri: &Option<String>| {
            uri.as_deref()
                .map_or_else(DebugUri::empty, DebugUri::parse)
        };
        DebugReportUris {
            win: resolve(&declared.win),
            loss: resolve(&declared.loss),
        }
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

/// Substitutes the empty sentinel for every URL.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugReportingDisabled;

impl DebugReportingStrategy for DebugReportingDisabled {
    fn resolve(&self, _declared: &DeclaredDebugUris) -> DebugReportUris {
        DebugReportUris::empty()
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Returns the strategy for the debug reporting toggle.
#[must_use]
pub fn strategy_for(enabled: bool) -> Arc<dyn DebugReportingStrategy> {
    if enabled {
        Arc::new(DebugReportingEnabled)
    } else {
        Arc::new(DebugReportingDisabled)
    }
}
