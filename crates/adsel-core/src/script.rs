//! Script runner contract.
//!
//! A [`ScriptRunner`] executes untrusted ad tech script text against a named
//! entry point with an ordered argument list and returns the raw text the
//! entry point produced. Runners are stateless per call and must be safe to
//! call concurrently.
//!
//! Presence and arity probes ([`ScriptRunner::validate`],
//! [`ScriptRunner::arg_count`]) have default implementations that append a
//! small probe function to the script and execute it through
//! [`ScriptRunner::run`], so a concrete runner only has to implement `run`.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::marshal::drivers;

/// Maximum length of an entry point name.
pub const MAX_ENTRY_POINT_LEN: usize = 128;

// =============================================================================
// ScriptArgument
// =============================================================================

/// One named, positional script argument.
///
/// Arguments are passed to the entry point in list order; the name is only
/// used for diagnostics and generated driver code.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptArgument {
    name: String,
    value: Value,
}

impl ScriptArgument {
    /// Creates an argument.
    #[must_use]
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Argument name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Argument value.
    #[must_use]
    pub const fn value(&self) -> &Value {
        &self.value
    }

    /// Consumes the argument, returning its value.
    #[must_use]
    pub fn into_value(self) -> Value {
        self.value
    }
}

// =============================================================================
// ScriptFailure
// =============================================================================

/// Typed failure of one script invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ScriptFailure {
    /// The script referenced an undefined symbol or could not be loaded.
    #[error("script reference error: {message}")]
    Reference {
        /// Interpreter diagnostic.
        message: String,
    },

    /// The output parsed but violates the entry point's output contract.
    #[error("script output violates contract: {message}")]
    SemanticOutput {
        /// Description of the violation.
        message: String,
    },

    /// The invocation did not finish in time.
    #[error("script execution timed out")]
    Timeout,

    /// The output could not be parsed, or the script threw.
    #[error("malformed script output: {message}")]
    MalformedOutput {
        /// Description of the problem.
        message: String,
    },

    /// The sandbox could not be reached or started.
    #[error("script sandbox unavailable: {message}")]
    Unavailable {
        /// Description of the problem.
        message: String,
    },
}

impl ScriptFailure {
    /// Creates a reference failure.
    #[must_use]
    pub fn reference(message: impl Into<String>) -> Self {
        Self::Reference {
            message: message.into(),
        }
    }

    /// Creates a semantic output failure.
    #[must_use]
    pub fn semantic(message: impl Into<String>) -> Self {
        Self::SemanticOutput {
            message: message.into(),
        }
    }

    /// Creates a malformed output failure.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedOutput {
            message: message.into(),
        }
    }

    /// Creates an unavailable failure.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Returns the failure kind as a stable label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Reference { .. } => "reference_error",
            Self::SemanticOutput { .. } => "semantic_output_error",
            Self::Timeout => "timeout",
            Self::MalformedOutput { .. } => "malformed_output",
            Self::Unavailable { .. } => "unavailable",
        }
    }

    /// Returns `true` if retrying the same invocation may succeed.
    ///
    /// Only sandbox availability problems are retriable; script behavior is
    /// deterministic for identical inputs.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

// =============================================================================
// ScriptRunner
// =============================================================================

/// Executes untrusted script text inside an isolated sandbox.
///
/// Implementations must not let scripts reach the network or the disk, and
/// must report every failure as a [`ScriptFailure`] value.
#[async_trait]
pub trait ScriptRunner: Send + Sync + fmt::Debug {
    /// Calls `entry_point` defined by `script` with `args` in order and
    /// returns the JSON text of its return value.
    ///
    /// # Errors
    ///
    /// Returns a [`ScriptFailure`] describing why no output was produced.
    async fn run(
        &self,
        script: &str,
        entry_point: &str,
        args: &[ScriptArgument],
    ) -> Result<String, ScriptFailure>;

    /// Like [`Self::run`], but gives up with [`ScriptFailure::Timeout`] once
    /// `budget` has elapsed.
    ///
    /// The default implementation ignores `budget` and delegates to
    /// [`Self::run`]; callers still bound the returned future themselves.
    ///
    /// # Errors
    ///
    /// Returns a [`ScriptFailure`] describing why no output was produced.
    async fn run_within(
        &self,
        script: &str,
        entry_point: &str,
        args: &[ScriptArgument],
        _budget: Duration,
    ) -> Result<String, ScriptFailure> {
        self.run(script, entry_point, args).await
    }

    /// Returns `true` iff every name in `entry_points` is a function defined
    /// by `script`. Declaration order does not matter.
    ///
    /// A script that cannot be loaded at all validates as `false`.
    ///
    /// # Errors
    ///
    /// Returns a [`ScriptFailure`] if the probe could not be executed.
    async fn validate(&self, script: &str, entry_points: &[&str]) -> Result<bool, ScriptFailure> {
        let probe = drivers::wrap(script, drivers::CHECK_FUNCTIONS_PROBE);
        let args = [ScriptArgument::new(
            "names",
            Value::Array(
                entry_points
                    .iter()
                    .map(|name| Value::String((*name).to_string()))
                    .collect(),
            ),
        )];
        match self
            .run(&probe, drivers::CHECK_FUNCTIONS_ENTRY, &args)
            .await
        {
            Ok(raw) => serde_json::from_str::<bool>(raw.trim())
                .map_err(|e| ScriptFailure::malformed(format!("validation probe: {e}"))),
            Err(ScriptFailure::Reference { .. }) => Ok(false),
            Err(other) => Err(other),
        }
    }

    /// Returns the declared parameter count of `entry_point`, or `-1` if the
    /// script does not define it.
    ///
    /// # Errors
    ///
    /// Returns a [`ScriptFailure`] if the probe could not be executed.
    async fn arg_count(&self, script: &str, entry_point: &str) -> Result<i32, ScriptFailure> {
        let probe = drivers::wrap(script, drivers::ARG_COUNT_PROBE);
        let args = [ScriptArgument::new(
            "name",
            Value::String(entry_point.to_string()),
        )];
        let raw = self.run(&probe, drivers::ARG_COUNT_ENTRY, &args).await?;
        serde_json::from_str::<i32>(raw.trim())
            .map_err(|e| ScriptFailure::malformed(format!("arity probe: {e}")))
    }
}

/// Returns `true` if `name` can be used verbatim as a call target.
///
/// Accepts plain identifiers only: ASCII letters, digits, `_` and `$`, not
/// starting with a digit.
#[must_use]
pub fn is_valid_entry_point(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_ENTRY_POINT_LEN
        && (first.is_ascii_alphabetic() || first == '_' || first == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Records the composed script and replies with a canned result.
    #[derive(Debug)]
    struct CannedRunner {
        reply: Result<String, ScriptFailure>,
        seen: Mutex<Vec<(String, String)>>,
    }

    impl CannedRunner {
        fn new(reply: Result<String, ScriptFailure>) -> Self {
            Self {
                reply,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ScriptRunner for CannedRunner {
        async fn run(
            &self,
            script: &str,
            entry_point: &str,
            _args: &[ScriptArgument],
        ) -> Result<String, ScriptFailure> {
            self.seen
                .lock()
                .unwrap()
                .push((script.to_string(), entry_point.to_string()));
            self.reply.clone()
        }
    }

    #[tokio::test]
    async fn validate_runs_presence_probe_after_script() {
        let runner = CannedRunner::new(Ok("true".to_string()));
        let ok = runner
            .validate("function scoreAd() {}", &["scoreAd"])
            .await
            .unwrap();
        assert!(ok);

        let seen = runner.seen.lock().unwrap();
        let (script, entry) = &seen[0];
        assert!(script.starts_with("function scoreAd() {}"));
        assert!(script.contains(drivers::CHECK_FUNCTIONS_ENTRY));
        assert_eq!(entry, drivers::CHECK_FUNCTIONS_ENTRY);
    }

    #[tokio::test]
    async fn validate_treats_unloadable_script_as_invalid() {
        let runner = CannedRunner::new(Err(ScriptFailure::reference("SyntaxError")));
        assert!(!runner.validate("function (", &["scoreAd"]).await.unwrap());
    }

    #[tokio::test]
    async fn validate_propagates_sandbox_failures() {
        let runner = CannedRunner::new(Err(ScriptFailure::unavailable("down")));
        let err = runner.validate("", &["scoreAd"]).await.unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn arg_count_parses_probe_output() {
        let runner = CannedRunner::new(Ok("-1\n".to_string()));
        assert_eq!(runner.arg_count("", "generateBid").await.unwrap(), -1);

        let runner = CannedRunner::new(Ok("\"seven\"".to_string()));
        let err = runner.arg_count("", "generateBid").await.unwrap_err();
        assert_eq!(err.kind(), "malformed_output");
    }

    #[tokio::test]
    async fn run_within_defaults_to_run() {
        let runner = CannedRunner::new(Ok("1".to_string()));
        let raw = runner
            .run_within("", "generateBid", &[], Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(raw, "1");
        assert_eq!(runner.seen.lock().unwrap()[0].1, "generateBid");
    }

    #[test]
    fn entry_point_names_are_plain_identifiers() {
        assert!(is_valid_entry_point("generateBid"));
        assert!(is_valid_entry_point("__rb_score_ads"));
        assert!(is_valid_entry_point("$fn1"));
        assert!(!is_valid_entry_point(""));
        assert!(!is_valid_entry_point("1abc"));
        assert!(!is_valid_entry_point("a.b"));
        assert!(!is_valid_entry_point("f();process.exit()"));
        assert!(!is_valid_entry_point(&"a".repeat(MAX_ENTRY_POINT_LEN + 1)));
    }
}
