//! Implementation of the configuration module.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use serde::Deserialize;
use serde::Serialize;

/// Represents the configuration for the gridwright CLI tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    /// Configuration for the `generate` command.
    #[serde(default, rename = "generate")]
    pub generate_config: GenerateConfig,
    /// Configuration of the engine.
    #[serde(default)]
    pub engine: gridwright_engine::Config,
}

/// Represents the configuration for the `generate` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct GenerateConfig {
    /// The default catalog file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<PathBuf>,
    /// The workflow's directory below each site's scratch directory.
    ///
    /// Defaults to the workflow's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_dir: Option<String>,
}

impl Config {
    /// Validate a configuration.
    pub fn validate(&self) -> Result<()> {
        if let Some(dir) = &self.generate_config.relative_dir
            && Path::new(dir).is_absolute()
        {
            bail!("configuration value `generate.relative_dir` must be a relative path");
        }

        self.engine.validate()
    }

    /// Read a configuration file from the specified path.
    pub fn read_config(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file `{}`", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("failed to parse config file `{}`", path.display()))
    }

    /// Write a configuration to the specified path.
    pub fn write_config(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, data)
            .with_context(|| format!("failed to write config file `{}`", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gridwright.toml");

        let mut config = Config::default();
        config.generate_config.relative_dir = Some("user/diamond".into());
        config.engine.submit.retry = 3;
        config.write_config(&path).unwrap();

        assert_eq!(Config::read_config(&path).unwrap(), config);
    }

    #[test]
    fn validation() {
        let mut config = Config::default();
        config.generate_config.relative_dir = Some("/abs".into());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.engine.parallelism = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[engine]\nbogus = true\n").unwrap();

        let e = Config::read_config(&path).unwrap_err();
        assert!(format!("{e}").contains("bad.toml"));
    }
}
