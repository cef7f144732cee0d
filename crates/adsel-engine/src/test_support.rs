//! Scriptable collaborators for tests.
//!
//! [`FakeScriptRunner`] stands in for a JavaScript sandbox: tests register a
//! script text together with Rust closures for the functions it defines, and
//! the runner answers probes and emulates the batch drivers the engine
//! appends to scripts. [`StaticFetcher`] serves canned documents by URL.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use adsel_core::marshal::drivers;
use adsel_core::{ScriptArgument, ScriptFailure, ScriptRunner};
use async_trait::async_trait;
use serde_json::{json, Value};
use url::Url;

use crate::fetch::{DevContext, FetchError, FetchResponse, Fetcher};

/// Raw function body: receives argument values, returns output text.
pub type RawHandler = Arc<dyn Fn(&[Value]) -> Result<String, ScriptFailure> + Send + Sync>;

// =============================================================================
// FakeScript
// =============================================================================

#[derive(Clone)]
struct FakeFunction {
    arity: i32,
    handler: RawHandler,
}

/// The functions a fake script defines.
#[derive(Clone, Default)]
pub struct FakeScript {
    functions: HashMap<String, FakeFunction>,
}

impl fmt::Debug for FakeScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FakeScript").field("functions", &names).finish()
    }
}

impl FakeScript {
    /// A script defining nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines `name` with `arity` parameters returning a JSON value.
    #[must_use]
    pub fn function<F>(self, name: &str, arity: i32, body: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, ScriptFailure> + Send + Sync + 'static,
    {
        self.raw_function(name, arity, move |args| body(args).map(|v| v.to_string()))
    }

    /// Defines `name` with `arity` parameters returning raw output text.
    #[must_use]
    pub fn raw_function<F>(mut self, name: &str, arity: i32, body: F) -> Self
    where
        F: Fn(&[Value]) -> Result<String, ScriptFailure> + Send + Sync + 'static,
    {
        self.functions.insert(
            name.to_string(),
            FakeFunction {
                arity,
                handler: Arc::new(body),
            },
        );
        self
    }

    /// A per-candidate `generateBid` bidding `bid_for(ad)` on every ad.
    #[must_use]
    pub fn bidding<F>(bid_for: F) -> Self
    where
        F: Fn(&Value) -> f64 + Send + Sync + 'static,
    {
        Self::new().function(drivers::GENERATE_BID, 6, move |args| {
            let ad = args.first().cloned().unwrap_or(Value::Null);
            let bid = bid_for(&ad);
            Ok(json!({ "status": 0, "ad": ad, "bid": bid }))
        })
    }

    /// A `scoreAd` scoring every ad with `score_for(ad, bid)`.
    #[must_use]
    pub fn scoring<F>(score_for: F) -> Self
    where
        F: Fn(&Value, f64) -> f64 + Send + Sync + 'static,
    {
        Self::new().function(drivers::SCORE_AD, 7, move |args| {
            let ad = args.first().cloned().unwrap_or(Value::Null);
            let bid = args.get(1).and_then(Value::as_f64).unwrap_or_default();
            Ok(json!({ "status": 0, "score": score_for(&ad, bid) }))
        })
    }

    fn call(&self, name: &str, args: &[Value]) -> Result<String, ScriptFailure> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| ScriptFailure::reference(format!("ReferenceError: {name} is not defined")))?;
        (function.handler)(args)
    }

    /// Calls `name` and parses its output like a driver would; a throw or
    /// unparseable output becomes `None`.
    fn call_value(&self, name: &str, args: &[Value]) -> Result<Option<Value>, ScriptFailure> {
        match self.call(name, args) {
            Ok(raw) => Ok(serde_json::from_str(&raw).ok()),
            Err(failure @ ScriptFailure::Reference { .. }) => Err(failure),
            Err(ScriptFailure::MalformedOutput { .. } | ScriptFailure::SemanticOutput { .. }) => {
                Ok(None)
            },
            Err(other) => Err(other),
        }
    }
}

// =============================================================================
// FakeScriptRunner
// =============================================================================

/// A [`ScriptRunner`] backed by registered [`FakeScript`]s.
#[derive(Clone, Default)]
pub struct FakeScriptRunner {
    scripts: Arc<Mutex<Vec<(String, FakeScript)>>>,
    calls: Arc<Mutex<HashMap<String, usize>>>,
    delay: Option<Duration>,
}

impl fmt::Debug for FakeScriptRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeScriptRunner")
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl FakeScriptRunner {
    /// A runner with no scripts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps `delay` before every invocation.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Registers `script` under its source `text`.
    #[must_use]
    pub fn with_script(self, text: impl Into<String>, script: FakeScript) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((text.into(), script));
        self
    }

    /// Number of invocations of `entry_point` so far.
    #[must_use]
    pub fn calls(&self, entry_point: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entry_point)
            .copied()
            .unwrap_or_default()
    }

    fn lookup(&self, program: &str) -> Option<FakeScript> {
        let scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        scripts
            .iter()
            .find(|(text, _)| {
                program == text
                    || program
                        .strip_prefix(text.as_str())
                        .is_some_and(|rest| rest.starts_with('\n'))
            })
            .map(|(_, script)| script.clone())
    }

    fn dispatch(script: &FakeScript, entry_point: &str, args: &[Value]) -> Result<String, ScriptFailure> {
        let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Null);
        match entry_point {
            drivers::CHECK_FUNCTIONS_ENTRY => {
                let all = arg(0).as_array().is_some_and(|names| {
                    names
                        .iter()
                        .all(|n| n.as_str().is_some_and(|n| script.functions.contains_key(n)))
                });
                Ok(all.to_string())
            },
            drivers::ARG_COUNT_ENTRY => {
                let arity = arg(0)
                    .as_str()
                    .and_then(|name| script.functions.get(name))
                    .map_or(-1, |f| f.arity);
                Ok(arity.to_string())
            },
            drivers::GENERATE_BID_V3_ENTRY => {
                let result = script.call_value(drivers::GENERATE_BID, args)?;
                let output = match result {
                    Some(Value::Array(items)) => json!({ "status": 0, "results": items }),
                    Some(Value::Object(item))
                        if ["ad", "bid", "render"].iter().all(|k| item.contains_key(*k)) =>
                    {
                        json!({ "status": 0, "results": [item] })
                    },
                    _ => json!({ "status": -1, "results": [] }),
                };
                Ok(output.to_string())
            },
            drivers::SCORE_ADS_ENTRY => {
                let items = arg(0).as_array().cloned().unwrap_or_default();
                let mut results = Vec::with_capacity(items.len());
                for item in items {
                    let mut call_args = vec![
                        item.get("ad").cloned().unwrap_or(Value::Null),
                        item.get("bid").cloned().unwrap_or(Value::Null),
                    ];
                    call_args.extend(args.iter().skip(1).cloned());
                    let result = match script.call_value(drivers::SCORE_AD, &call_args)? {
                        Some(value @ Value::Object(_)) => value,
                        _ => json!({ "status": -1 }),
                    };
                    results.push(result);
                }
                Ok(json!({ "status": 0, "results": results }).to_string())
            },
            drivers::SELECT_OUTCOME_ENTRY => {
                let output = match script.call_value(drivers::SELECT_OUTCOME, args)? {
                    Some(Value::Object(output)) => output,
                    _ => return Ok(json!({ "status": -1, "results": [] }).to_string()),
                };
                let selected = output.get("result").cloned().unwrap_or(Value::Null);
                let results = match selected {
                    Value::Array(items) => items,
                    other => vec![other],
                };
                let status = output.get("status").cloned().unwrap_or(Value::Null);
                Ok(json!({ "status": status, "results": results }).to_string())
            },
            name => script.call(name, args),
        }
    }
}

#[async_trait]
impl ScriptRunner for FakeScriptRunner {
    async fn run(
        &self,
        script: &str,
        entry_point: &str,
        args: &[ScriptArgument],
    ) -> Result<String, ScriptFailure> {
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(entry_point.to_string())
            .or_default() += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let fake = self
            .lookup(script)
            .ok_or_else(|| ScriptFailure::reference("SyntaxError: unknown script"))?;
        let values: Vec<Value> = args.iter().map(|a| a.value().clone()).collect();
        Self::dispatch(&fake, entry_point, &values)
    }
}

// =============================================================================
// StaticFetcher
// =============================================================================

/// A [`Fetcher`] serving canned responses.
///
/// Lookups try the exact URL first, then the URL without its query.
#[derive(Debug, Clone, Default)]
pub struct StaticFetcher {
    responses: Arc<Mutex<HashMap<Url, FetchResponse>>>,
    requests: Arc<Mutex<Vec<Url>>>,
    delay: Option<Duration>,
    slow: Arc<Mutex<HashMap<Url, Duration>>>,
}

impl StaticFetcher {
    /// A fetcher serving nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `body` at `uri`.
    #[must_use]
    pub fn with(self, uri: &str, body: impl Into<String>) -> Self {
        self.with_response(uri, FetchResponse::text(body))
    }

    /// Serves `response` at `uri`.
    ///
    /// # Panics
    ///
    /// Panics if `uri` is not a valid URL.
    #[must_use]
    #[allow(clippy::missing_panics_doc)]
    pub fn with_response(self, uri: &str, response: FetchResponse) -> Self {
        #[allow(clippy::expect_used)]
        let uri = Url::parse(uri).expect("test URL must parse");
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uri, response);
        self
    }

    /// Sleeps `delay` before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sleeps `delay` before answering requests for `uri`, with or without
    /// a query.
    ///
    /// # Panics
    ///
    /// Panics if `uri` is not a valid URL.
    #[must_use]
    #[allow(clippy::missing_panics_doc)]
    pub fn with_slow(self, uri: &str, delay: Duration) -> Self {
        #[allow(clippy::expect_used)]
        let uri = Url::parse(uri).expect("test URL must parse");
        self.slow
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uri, delay);
        self
    }

    /// Every URL requested so far, in request order.
    #[must_use]
    pub fn requests(&self) -> Vec<Url> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of requests whose URL without query equals `uri`.
    #[must_use]
    pub fn request_count(&self, uri: &str) -> usize {
        self.requests()
            .iter()
            .filter(|requested| {
                let mut base = (*requested).clone();
                base.set_query(None);
                base.as_str() == uri
            })
            .count()
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch_text(&self, uri: &Url, _dev: &DevContext) -> Result<FetchResponse, FetchError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(uri.clone());
        let mut base = uri.clone();
        base.set_query(None);
        let slow = self
            .slow
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&base)
            .copied();
        if let Some(delay) = self.delay.into_iter().chain(slow).max() {
            tokio::time::sleep(delay).await;
        }
        let responses = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
        responses
            .get(uri)
            .or_else(|| responses.get(&base))
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                uri: uri.to_string(),
            })
    }
}
