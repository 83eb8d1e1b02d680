//! Implementation of the quote command.

use anyhow::Context;
use clap::Parser;

/// Arguments for the `quote` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// The raw argument string.
    #[arg(allow_hyphen_values = true)]
    pub arguments: String,

    /// Do not enclose the result in double quotes.
    #[arg(long)]
    pub no_enclose: bool,
}

/// Runs the `quote` command.
pub fn quote(args: Args) -> anyhow::Result<()> {
    let quoted = gridwright_engine::quote(&args.arguments, !args.no_enclose)
        .with_context(|| format!("failed to quote `{}`", args.arguments))?;
    println!("{quoted}");
    Ok(())
}
