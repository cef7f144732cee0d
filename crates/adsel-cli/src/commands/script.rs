//! `adsel validate` and `adsel arity`: script probes.

use std::path::{Path, PathBuf};

use adsel_core::script::is_valid_entry_point;
use adsel_core::{AdSelectionConfig, ScriptRunner};
use adsel_engine::ProcessScriptRunner;
use anyhow::{bail, Context, Result};
use clap::Args;

use super::{read_bounded, runtime, MAX_INPUT_FILE_SIZE};

/// Arguments for `adsel validate`.
#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Script file to probe.
    #[arg(long)]
    pub script: PathBuf,

    /// Entry point that must be defined (repeatable).
    #[arg(long = "entry", required = true)]
    pub entries: Vec<String>,
}

/// Arguments for `adsel arity`.
#[derive(Debug, Args)]
pub struct ArityArgs {
    /// Script file to probe.
    #[arg(long)]
    pub script: PathBuf,

    /// Function whose parameter count is printed.
    #[arg(long)]
    pub entry: String,
}

/// Prints `true` if the script defines every entry point, `false` otherwise.
///
/// # Errors
///
/// Returns an error for unreadable scripts, invalid entry point names, or
/// sandbox failures.
pub fn validate(config: &AdSelectionConfig, args: &ValidateArgs) -> Result<()> {
    for entry in &args.entries {
        check_entry_point(entry)?;
    }
    let script = load_script(&args.script)?;
    let runner = ProcessScriptRunner::new(&config.sandbox);
    let entries: Vec<&str> = args.entries.iter().map(String::as_str).collect();
    let valid = runtime()?
        .block_on(runner.validate(&script, &entries))
        .context("script probe failed")?;
    println!("{valid}");
    Ok(())
}

/// Prints the declared parameter count of an entry point, `-1` if undefined.
///
/// # Errors
///
/// Returns an error for unreadable scripts, an invalid entry point name, or
/// sandbox failures.
pub fn arity(config: &AdSelectionConfig, args: &ArityArgs) -> Result<()> {
    check_entry_point(&args.entry)?;
    let script = load_script(&args.script)?;
    let runner = ProcessScriptRunner::new(&config.sandbox);
    let count = runtime()?
        .block_on(runner.arg_count(&script, &args.entry))
        .context("script probe failed")?;
    println!("{count}");
    Ok(())
}

fn check_entry_point(name: &str) -> Result<()> {
    if !is_valid_entry_point(name) {
        bail!("'{name}' is not a valid entry point name");
    }
    Ok(())
}

fn load_script(path: &Path) -> Result<String> {
    read_bounded(path, MAX_INPUT_FILE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_point_names_are_checked_before_reading() {
        let args = ArityArgs {
            script: PathBuf::from("/nonexistent/bid.js"),
            entry: "generateBid; process.exit(0)".to_string(),
        };
        let err = arity(&AdSelectionConfig::default(), &args).unwrap_err();
        assert!(err.to_string().contains("not a valid entry point"));
    }

    #[test]
    fn missing_script_is_reported() {
        let args = ValidateArgs {
            script: PathBuf::from("/nonexistent/bid.js"),
            entries: vec!["generateBid".to_string()],
        };
        let err = validate(&AdSelectionConfig::default(), &args).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/bid.js"));
    }
}
