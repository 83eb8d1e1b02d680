//! Rendering of scheduler submit files.

use std::fmt::Write as _;

use crate::classad;
use crate::config::SubmitConfig;
use crate::env;
use crate::error::EngineError;
use crate::error::EngineResult;
use crate::job::Job;
use crate::quote::quote;
use crate::style::UNIVERSE_KEY;
use crate::workflow::WorkflowMetadata;

/// The width of the separator line closing a submit file.
const SEPARATOR_WIDTH: usize = 72;

/// The comment closing a submit file.
pub const TRAILER: &str = "# END OF SUBMIT FILE";

/// Attributes the renderer writes in fixed positions.
const FIXED_KEYS: &[&str] = &["environment", UNIVERSE_KEY, "executable", "arguments"];

/// Renders the submit file of an enabled job.
///
/// The job's scheduler attributes are written in insertion order after the
/// environment, universe, executable and arguments lines. Defaults for
/// job release and removal and for file transfer are added when the job
/// does not set them.
pub fn render(
    job: &Job,
    config: &SubmitConfig,
    metadata: &WorkflowMetadata,
    cluster_size: Option<usize>,
) -> EngineResult<String> {
    let mut out = String::new();

    // Writing to a string cannot fail.
    let _ = writeln!(out, "environment = {}", env::escape(&job.env));
    if let Some(universe) = job.attributes.get(UNIVERSE_KEY) {
        let _ = writeln!(out, "{UNIVERSE_KEY} = {universe}");
    }
    let _ = writeln!(out, "executable = {}", job.executable);

    if !job.arguments.is_empty() {
        let arguments = if job.profile.arguments_quote.unwrap_or(config.quote_arguments) {
            quote(&job.arguments, true).map_err(|source| EngineError::Grammar {
                job: job.id.clone(),
                source,
            })?
        } else {
            job.arguments.clone()
        };
        let _ = writeln!(out, "arguments = {arguments}");
    }

    for (key, value) in job.attributes.iter() {
        if FIXED_KEYS.contains(&key) {
            continue;
        }
        let _ = writeln!(out, "{key} = {value}");
    }

    let mut defaults: Vec<(&str, String)> = vec![
        ("periodic_release", config.periodic_release.clone()),
        ("periodic_remove", config.periodic_remove.clone()),
    ];
    if !job.transfer_inputs.is_empty() {
        defaults.push((
            "transfer_input_files",
            job.transfer_inputs
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(","),
        ));
    }
    if !job.transfer_outputs.is_empty() {
        defaults.push((
            "transfer_output_files",
            job.transfer_outputs
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(","),
        ));
    }
    if !job.transfer_inputs.is_empty() || !job.transfer_outputs.is_empty() {
        defaults.push(("should_transfer_files", "YES".into()));
        defaults.push(("when_to_transfer_output", "ON_EXIT".into()));
    }

    for (key, value) in defaults {
        if !job.attributes.contains(key) {
            let _ = writeln!(out, "{key} = {value}");
        }
    }

    classad::render(metadata, job, cluster_size, &mut out);

    let _ = writeln!(out, "queue");
    let _ = writeln!(out, "{}", "#".repeat(SEPARATOR_WIDTH));
    let _ = writeln!(out, "{TRAILER}");
    Ok(out)
}
