//! Interpreter child-process script runner.
//!
//! Each invocation spawns a fresh interpreter (`node` by default, under its
//! permission model), writes a small host program to its stdin, and reads
//! the result back from stdout. The host program evaluates the script in a
//! fresh `node:vm` context whose globals hold no `require`, `process` or
//! `fetch`, calls the entry point there, and prints the JSON result on a
//! single line prefixed with [`RESULT_MARKER`].
//!
//! Output is read through bounded buffers and the whole invocation runs
//! under the smaller of the configured execution cap and the caller's
//! budget. The child is killed on drop, so a cancelled or timed-out
//! invocation never leaves an orphan process behind.
//!
//! # Failure classification
//!
//! | Observation                                   | Failure            |
//! |-----------------------------------------------|--------------------|
//! | interpreter cannot be spawned                 | `Unavailable`      |
//! | program cannot be written to stdin            | `Unavailable`      |
//! | timeout elapsed                               | `Timeout`          |
//! | non-zero exit, `ReferenceError`/`SyntaxError` | `Reference`        |
//! | non-zero exit, anything else                  | `MalformedOutput`  |
//! | zero exit, no marker line                     | `MalformedOutput`  |

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use adsel_core::config::SandboxConfig;
use adsel_core::script::is_valid_entry_point;
use adsel_core::{ScriptArgument, ScriptFailure, ScriptRunner};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, instrument};

/// Prefix of the stdout line carrying the entry point's result.
pub const RESULT_MARKER: &str = "__adsel_result__:";

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Globals installed in the script context before the script runs.
const CONTEXT_PRELUDE: &str = "globalThis.console = { log() {}, info() {}, warn() {}, error() {}, \
                               debug() {} };";

/// Runs scripts in a short-lived interpreter process.
#[derive(Debug, Clone)]
pub struct ProcessScriptRunner {
    interpreter: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    max_output_bytes: usize,
}

impl ProcessScriptRunner {
    /// Creates a runner from sandbox settings.
    #[must_use]
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            args: config.args.clone(),
            timeout: config.max_execution_time,
            max_output_bytes: config.max_output_bytes,
        }
    }

    /// Overrides the interpreter command and its arguments.
    #[must_use]
    pub fn with_interpreter(mut self, interpreter: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.interpreter = interpreter.into();
        self.args = args;
        self
    }

    /// Overrides the per-invocation timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builds the host program: it evaluates the script in an empty `vm`
    /// context, applies the entry point to the JSON-encoded arguments inside
    /// that context, and prints the marker line.
    ///
    /// The script and the call are embedded as JSON string literals, so
    /// script text is never parsed by the host program itself.
    fn program(
        script: &str,
        entry_point: &str,
        args: &[ScriptArgument],
    ) -> Result<String, ScriptFailure> {
        let encode = |what: &str, e: serde_json::Error| {
            ScriptFailure::malformed(format!("cannot encode {what}: {e}"))
        };
        let values: Vec<&Value> = args.iter().map(ScriptArgument::value).collect();
        let encoded_args = serde_json::to_string(&values).map_err(|e| encode("arguments", e))?;
        let call = format!(
            "(function (r) {{ return JSON.stringify(r === undefined ? null : r); }})\
             ({entry_point}.apply(null, {encoded_args}))"
        );
        let prelude = serde_json::to_string(CONTEXT_PRELUDE).map_err(|e| encode("prelude", e))?;
        let script = serde_json::to_string(script).map_err(|e| encode("script", e))?;
        let call = serde_json::to_string(&call).map_err(|e| encode("call", e))?;
        Ok(format!(
            "'use strict';\nconst __adsel_vm = require('node:vm');\nconst __adsel_context = \
             __adsel_vm.createContext(Object.create(null));\n__adsel_vm.runInContext({prelude}, \
             __adsel_context);\n__adsel_vm.runInContext({script}, __adsel_context);\nconst \
             __adsel_result = __adsel_vm.runInContext({call}, __adsel_context);\n\
             process.stdout.write('{RESULT_MARKER}' + __adsel_result + '\\n');\n"
        ))
    }

    fn classify_failure(stderr: &str, code: Option<i32>) -> ScriptFailure {
        let detail = stderr
            .lines()
            .find(|line| line.contains("Error"))
            .unwrap_or_else(|| stderr.lines().last().unwrap_or_default())
            .trim()
            .to_string();
        if stderr.contains("ReferenceError") || stderr.contains("SyntaxError") {
            ScriptFailure::reference(detail)
        } else {
            ScriptFailure::malformed(format!("interpreter exited with {code:?}: {detail}"))
        }
    }
}

impl Default for ProcessScriptRunner {
    fn default() -> Self {
        Self::new(&SandboxConfig::default())
    }
}

/// Reads `stream` to EOF, keeping at most `limit` bytes.
///
/// Returns the kept bytes and whether anything was dropped.
async fn read_bounded<R: AsyncRead + Unpin>(stream: &mut R, limit: usize) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    let mut exceeded = false;
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(buf.len());
                if n > room {
                    buf.extend_from_slice(&chunk[..room]);
                    exceeded = true;
                    // keep draining so the child never blocks on a full pipe
                } else {
                    buf.extend_from_slice(&chunk[..n]);
                }
            },
        }
    }
    (buf, exceeded)
}

#[async_trait]
impl ScriptRunner for ProcessScriptRunner {
    async fn run(
        &self,
        script: &str,
        entry_point: &str,
        args: &[ScriptArgument],
    ) -> Result<String, ScriptFailure> {
        self.run_within(script, entry_point, args, self.timeout)
            .await
    }

    #[instrument(skip(self, script, args), fields(interpreter = %self.interpreter.display()))]
    async fn run_within(
        &self,
        script: &str,
        entry_point: &str,
        args: &[ScriptArgument],
        budget: Duration,
    ) -> Result<String, ScriptFailure> {
        if !is_valid_entry_point(entry_point) {
            return Err(ScriptFailure::reference(format!(
                "invalid entry point name: {entry_point:?}"
            )));
        }
        let program = Self::program(script, entry_point, args)?;
        let started = Instant::now();
        let deadline = started + budget.min(self.timeout);

        let mut cmd = tokio::process::Command::new(&self.interpreter);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| ScriptFailure::unavailable(format!("failed to spawn interpreter: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            match tokio::time::timeout_at(deadline, stdin.write_all(program.as_bytes())).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => {
                    return Err(ScriptFailure::unavailable(format!(
                        "failed to write program to interpreter: {e}"
                    )));
                },
                Err(_) => {
                    debug!(entry_point, elapsed = ?started.elapsed(), "program write timed out");
                    return Err(ScriptFailure::Timeout);
                },
            }
        }

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ScriptFailure::unavailable("failed to capture stdout"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ScriptFailure::unavailable("failed to capture stderr"))?;

        let per_stream_limit = self.max_output_bytes;
        let outcome = tokio::time::timeout_at(deadline, async {
            tokio::join!(
                read_bounded(&mut stdout, per_stream_limit),
                read_bounded(&mut stderr, per_stream_limit),
                child.wait()
            )
        })
        .await;

        let Ok(((stdout_buf, stdout_exceeded), (stderr_buf, _), status)) = outcome else {
            let _ = child.kill().await;
            debug!(entry_point, elapsed = ?started.elapsed(), "script timed out");
            return Err(ScriptFailure::Timeout);
        };
        let status = status
            .map_err(|e| ScriptFailure::unavailable(format!("failed to wait for interpreter: {e}")))?;
        debug!(
            entry_point,
            elapsed = ?started.elapsed(),
            code = ?status.code(),
            stdout_bytes = stdout_buf.len(),
            "script finished"
        );

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr_buf);
            return Err(Self::classify_failure(&stderr, status.code()));
        }
        if stdout_exceeded {
            return Err(ScriptFailure::malformed(format!(
                "output exceeded {per_stream_limit} bytes"
            )));
        }
        let stdout = String::from_utf8_lossy(&stdout_buf);
        stdout
            .lines()
            .rev()
            .find_map(|line| line.strip_prefix(RESULT_MARKER))
            .map(str::to_string)
            .ok_or_else(|| ScriptFailure::malformed("interpreter produced no result"))
    }
}
