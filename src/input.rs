//! Reading of workflow and catalog documents.

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use serde::de::DeserializeOwned;

/// The formats a document may be written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// JSON.
    Json,
    /// YAML.
    Yaml,
    /// TOML.
    Toml,
}

impl Format {
    /// Determines the format of a document from its extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "json" => Some(Self::Json),
            "yml" | "yaml" => Some(Self::Yaml),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }
}

/// Reads a document, choosing the format by extension.
pub fn read<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let Some(format) = Format::from_path(path) else {
        bail!(
            "unsupported document `{}`: expected a `.json`, `.yaml`, `.yml` or `.toml` file",
            path.display()
        );
    };

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read `{}`", path.display()))?;

    let parsed = match format {
        Format::Json => serde_json::from_str(&text).map_err(anyhow::Error::from),
        Format::Yaml => serde_yaml_ng::from_str(&text).map_err(anyhow::Error::from),
        Format::Toml => toml::from_str(&text).map_err(anyhow::Error::from),
    };
    parsed.with_context(|| format!("failed to parse `{}`", path.display()))
}
