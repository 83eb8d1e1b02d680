//! Implementation of the generate command.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use gridwright_engine::Assembler;
use gridwright_engine::Assembly;
use gridwright_engine::InMemoryCatalog;
use gridwright_engine::Workflow;
use tracing::info;

use crate::config::Config;
use crate::input;

/// Arguments for the `generate` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// The workflow to generate artifacts for (JSON, YAML or TOML).
    #[arg(value_name = "WORKFLOW")]
    pub workflow: PathBuf,

    /// The site, transformation and credential catalog (JSON, YAML or
    /// TOML).
    #[arg(long, value_name = "PATH")]
    pub catalog: Option<PathBuf>,

    /// The directory the artifacts are written to.
    #[arg(short = 'o', long, value_name = "DIR")]
    pub submit_dir: PathBuf,

    /// The workflow's directory below each site's scratch directory.
    #[arg(long, value_name = "DIR")]
    pub relative_dir: Option<String>,

    /// The number of jobs assembled in parallel.
    #[arg(short, long)]
    pub parallelism: Option<usize>,
}

/// Formats the failures of an assembly.
fn failures(assembly: Assembly) -> String {
    let mut out = String::new();
    for outcome in assembly.jobs {
        if let Err(e) = outcome.result {
            // Writing to a string cannot fail.
            let _ = writeln!(
                out,
                "  {id}: {e:#}",
                id = outcome.id,
                e = anyhow::Error::new(e)
            );
        }
    }
    out
}

/// Runs the `generate` command.
pub async fn generate(args: Args, config: Config) -> Result<()> {
    let workflow: Workflow = input::read(&args.workflow)?;

    let catalog_path = args
        .catalog
        .or(config.generate_config.catalog)
        .context("a catalog is required: pass `--catalog` or set `generate.catalog`")?;
    let catalog: InMemoryCatalog = input::read(&catalog_path)?;

    let relative_dir = args
        .relative_dir
        .or(config.generate_config.relative_dir)
        .unwrap_or_else(|| workflow.name.clone());

    let mut engine = config.engine;
    if args.parallelism.is_some() {
        engine.parallelism = args.parallelism;
        engine.validate()?;
    }

    info!(
        "generating artifacts for workflow `{name}` in `{dir}`",
        name = workflow.name,
        dir = args.submit_dir.display()
    );

    let submit_dir = args.submit_dir;
    let assembly = tokio::task::spawn_blocking(move || {
        Assembler::new(
            &engine,
            &catalog,
            &catalog,
            &catalog,
            &submit_dir,
            relative_dir,
        )
        .assemble(workflow)
    })
    .await
    .context("failed to join the assembly task")?
    .context("failed to assemble workflow")?;

    if let Some(dag) = &assembly.dag {
        println!("{}", dag.display());
        return Ok(());
    }

    let count = assembly.failures().count();
    bail!(
        "{count} job(s) failed to assemble:\n{failures}",
        failures = failures(assembly).trim_end()
    )
}
