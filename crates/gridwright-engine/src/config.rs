//! Implementation of engine configuration.

use anyhow::Result;
use anyhow::bail;
use serde::Deserialize;
use serde::Serialize;

use crate::job::DataConfiguration;
use crate::job::PostScriptScope;
use crate::strategy::StrategyKind;

/// The default length above which launcher invocations are written to a
/// file.
pub const DEFAULT_INVOKE_LENGTH: usize = 4000;

/// The default expression releasing held jobs.
pub const DEFAULT_PERIODIC_RELEASE: &str = "False";

/// The default expression removing jobs held for more than half an hour.
pub const DEFAULT_PERIODIC_REMOVE: &str =
    "(JobStatus == 5) && ((CurrentTime - EnteredCurrentStatus) > 1800)";

/// Represents engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    /// The strategy used when neither the job nor its data configuration
    /// selects one.
    #[serde(default)]
    pub default_strategy: StrategyKind,
    /// The data configuration of jobs that do not set one.
    #[serde(default)]
    pub data_configuration: DataConfiguration,
    /// Instrumented launcher configuration.
    #[serde(default)]
    pub launcher: LauncherConfig,
    /// Bootstrap script configuration.
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    /// Sequencer configuration.
    #[serde(default)]
    pub sequencer: SequencerConfig,
    /// Submit file configuration.
    #[serde(default)]
    pub submit: SubmitConfig,
    /// Cloud batch configuration.
    #[serde(default)]
    pub cloud_batch: CloudBatchConfig,
    /// The number of jobs assembled in parallel; defaults to the number of
    /// CPUs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
}

impl Config {
    /// Validates the engine configuration.
    pub fn validate(&self) -> Result<()> {
        self.launcher.validate()?;
        self.submit.validate()?;
        self.cloud_batch.validate()?;

        if self.parallelism == Some(0) {
            bail!("configuration value `parallelism` cannot be zero");
        }

        Ok(())
    }
}

/// Configuration of the instrumented launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct LauncherConfig {
    /// Invocations longer than this are written to a file.
    #[serde(default = "default_invoke_length")]
    pub invoke_length: usize,
    /// Always write compute job invocations to a file.
    #[serde(default)]
    pub always_invoke: bool,
    /// Never write invocations to a file.
    #[serde(default)]
    pub disable_invoke: bool,
    /// Ask the launcher to record file statistics for inputs and outputs.
    #[serde(default)]
    pub stat: bool,
    /// Ask the launcher to set the execute bit of staged executables.
    #[serde(default = "default_true")]
    pub set_execute_bit: bool,
    /// Run jobs in worker-node directories through launcher hooks.
    #[serde(default)]
    pub worker_node_execution: bool,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            invoke_length: DEFAULT_INVOKE_LENGTH,
            always_invoke: false,
            disable_invoke: false,
            stat: false,
            set_execute_bit: true,
            worker_node_execution: false,
        }
    }
}

impl LauncherConfig {
    /// Validates the launcher configuration.
    pub fn validate(&self) -> Result<()> {
        if self.invoke_length == 0 {
            bail!("configuration value `launcher.invoke_length` cannot be zero");
        }

        if self.always_invoke && self.disable_invoke {
            bail!(
                "configuration values `launcher.always_invoke` and `launcher.disable_invoke` \
                 cannot both be set"
            );
        }

        Ok(())
    }
}

/// Configuration of bootstrap scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct BootstrapConfig {
    /// Ship the worker package with every job.
    #[serde(default = "default_true")]
    pub stage_worker_package: bool,
    /// Fail when the worker package does not match the planner version.
    #[serde(default = "default_true")]
    pub strict_worker_package_check: bool,
    /// Allow the script to download a worker package when none is shipped.
    #[serde(default = "default_true")]
    pub allow_worker_package_download: bool,
    /// Verify checksums of staged inputs.
    #[serde(default = "default_true")]
    pub integrity_checking: bool,
    /// Run the job through the instrumented launcher inside the script.
    #[serde(default = "default_true")]
    pub instrumentation: bool,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            stage_worker_package: true,
            strict_worker_package_check: true,
            allow_worker_package_download: true,
            integrity_checking: true,
            instrumentation: true,
        }
    }
}

/// Configuration of the sequencer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SequencerConfig {
    /// Stop a clustered job at the first failing task.
    #[serde(default = "default_true")]
    pub abort_on_first_failure: bool,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            abort_on_first_failure: true,
        }
    }
}

/// Configuration of generated submit files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SubmitConfig {
    /// The `periodic_release` expression of jobs that do not set one.
    #[serde(default = "default_periodic_release")]
    pub periodic_release: String,
    /// The `periodic_remove` expression of jobs that do not set one.
    #[serde(default = "default_periodic_remove")]
    pub periodic_remove: String,
    /// The retry count of jobs that do not set one.
    #[serde(default = "default_retry")]
    pub retry: u32,
    /// Which jobs receive a post script.
    #[serde(default)]
    pub post_script_scope: PostScriptScope,
    /// The directory post scripts are installed in on the submit host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_script_dir: Option<String>,
    /// Pass job arguments through the argument quoter.
    #[serde(default = "default_true")]
    pub quote_arguments: bool,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            periodic_release: default_periodic_release(),
            periodic_remove: default_periodic_remove(),
            retry: default_retry(),
            post_script_scope: PostScriptScope::default(),
            post_script_dir: None,
            quote_arguments: true,
        }
    }
}

impl SubmitConfig {
    /// Validates the submit configuration.
    pub fn validate(&self) -> Result<()> {
        if self.periodic_release.trim().is_empty() {
            bail!("configuration value `submit.periodic_release` cannot be empty");
        }

        if self.periodic_remove.trim().is_empty() {
            bail!("configuration value `submit.periodic_remove` cannot be empty");
        }

        Ok(())
    }
}

/// Configuration of cloud batch submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct CloudBatchConfig {
    /// The bucket (`s3://...`) jobs exchange files through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
}

impl CloudBatchConfig {
    /// Validates the cloud batch configuration.
    pub fn validate(&self) -> Result<()> {
        if let Some(bucket) = &self.bucket
            && !bucket.starts_with("s3://")
        {
            bail!("configuration value `cloud_batch.bucket` must be an `s3://` URL");
        }

        Ok(())
    }
}

/// Used for serde defaults.
fn default_true() -> bool {
    true
}

/// Used for serde defaults.
fn default_invoke_length() -> usize {
    DEFAULT_INVOKE_LENGTH
}

/// Used for serde defaults.
fn default_periodic_release() -> String {
    DEFAULT_PERIODIC_RELEASE.to_string()
}

/// Used for serde defaults.
fn default_periodic_remove() -> String {
    DEFAULT_PERIODIC_REMOVE.to_string()
}

/// Used for serde defaults.
fn default_retry() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.default_strategy, StrategyKind::Instrumented);
        assert_eq!(config.launcher.invoke_length, DEFAULT_INVOKE_LENGTH);
        assert!(config.sequencer.abort_on_first_failure);
        assert_eq!(config.submit.retry, 1);
        config.validate().unwrap();
    }

    #[test]
    fn validation() {
        let mut config = Config::default();
        config.launcher.invoke_length = 0;
        assert_eq!(
            config.validate().unwrap_err().to_string(),
            "configuration value `launcher.invoke_length` cannot be zero"
        );

        let mut config = Config::default();
        config.cloud_batch.bucket = Some("gs://bucket".into());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.parallelism = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("[launcher]\nbogus = 1").is_err());
    }
}
