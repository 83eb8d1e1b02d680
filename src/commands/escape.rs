//! Implementation of the escape command.

use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use gridwright_engine::EnvironmentProfile;

/// Arguments for the `escape` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// The variables to escape, in order.
    #[arg(value_name = "NAME=VALUE", required = true)]
    pub variables: Vec<String>,
}

/// Parses `NAME=VALUE` pairs into a profile.
fn profile(variables: &[String]) -> Result<EnvironmentProfile> {
    let mut profile = EnvironmentProfile::new();
    for variable in variables {
        match variable.split_once('=') {
            Some((name, value)) if !name.is_empty() => {
                profile.set(name, value);
            }
            _ => bail!("invalid variable `{variable}`: expected `NAME=VALUE`"),
        }
    }
    Ok(profile)
}

/// Runs the `escape` command.
pub fn escape(args: Args) -> Result<()> {
    let profile = profile(&args.variables)?;
    println!("{}", gridwright_engine::escape(&profile));
    Ok(())
}
