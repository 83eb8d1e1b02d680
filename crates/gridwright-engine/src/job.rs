//! The job data model.

use std::fmt;
use std::path::PathBuf;

use indexmap::IndexMap;
use indexmap::IndexSet;
use serde::Deserialize;
use serde::Serialize;
use strum::EnumIter;
use strum::IntoStaticStr;

use crate::env::EnvironmentProfile;
use crate::env::Hooks;
use crate::strategy::StrategyKind;
use crate::style::StyleKind;

/// The handle of the submit host's own site.
pub const LOCAL_SITE: &str = "local";

/// The class of a job, used by the policy tables and classads.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobClass {
    /// A job whose class was never assigned.
    Unassigned,
    /// A user compute job.
    Compute,
    /// Stages inputs to a staging site.
    StageIn,
    /// Stages outputs away from a staging site.
    StageOut,
    /// Moves data between two staging sites.
    InterSiteTransfer,
    /// Stages the worker package.
    StageWorker,
    /// Creates a workflow directory on a staging site.
    CreateDirectory,
    /// Removes files from a staging site.
    Cleanup,
    /// Sets the execute bit of staged executables.
    Chmod,
    /// Registers outputs in a replica catalog.
    ReplicaRegistration,
    /// Plans and runs a sub-workflow.
    SubWorkflow,
    /// A clustered job made of several constituent jobs.
    Aggregated,
}

impl JobClass {
    /// The integer code published in the `+gw_job_class` classad.
    pub fn code(&self) -> u32 {
        match self {
            Self::Unassigned => 0,
            Self::Compute | Self::Aggregated => 1,
            Self::StageIn | Self::StageWorker => 2,
            Self::StageOut => 3,
            Self::ReplicaRegistration => 4,
            Self::InterSiteTransfer => 5,
            Self::CreateDirectory => 6,
            Self::Cleanup => 8,
            Self::Chmod => 9,
            Self::SubWorkflow => 11,
        }
    }

    /// Determines if jobs of this class are data transfer jobs.
    pub fn is_transfer(&self) -> bool {
        matches!(
            self,
            Self::StageIn | Self::StageOut | Self::InterSiteTransfer | Self::StageWorker
        )
    }

    /// Determines if jobs of this class are planner tools whose standard
    /// input is shipped by the scheduler rather than read on the site.
    pub fn ships_stdin(&self) -> bool {
        self.is_transfer()
            || matches!(
                self,
                Self::Cleanup | Self::CreateDirectory | Self::Aggregated
            )
    }
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s: &'static str = self.into();
        write!(f, "{s}")
    }
}

/// How data reaches the nodes a job runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataConfiguration {
    /// Jobs run in a shared filesystem reachable from the staging site.
    #[default]
    #[serde(rename = "sharedfs")]
    SharedFs,
    /// Jobs stage their own data from a staging site.
    #[serde(rename = "nonsharedfs")]
    NonSharedFs,
    /// Data is staged by the scheduler through the submit host.
    #[serde(rename = "condorio")]
    CondorIo,
}

impl DataConfiguration {
    /// Determines if jobs in this configuration stage their own data.
    pub fn stages_on_worker(&self) -> bool {
        !matches!(self, Self::SharedFs)
    }
}

/// A URL together with the site it is located on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct FileUrl {
    /// The site handle.
    pub site: String,
    /// The URL.
    pub url: String,
}

impl FileUrl {
    /// Constructs a new file URL.
    pub fn new(site: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            url: url.into(),
        }
    }
}

/// A file used or produced by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct JobFile {
    /// The logical file name.
    pub lfn: String,
    /// Whether the file is an executable staged for the job.
    #[serde(default)]
    pub executable: bool,
    /// Whether the file is a checkpoint file.
    #[serde(default)]
    pub checkpoint: bool,
    /// Whether the file is a container image.
    #[serde(default)]
    pub container_image: bool,
    /// Explicit source locations; when empty the staging site is used.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<FileUrl>,
    /// An explicit destination; when absent the staging site is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<FileUrl>,
    /// Set when no checksum will be computed for the file on the worker.
    #[serde(default)]
    pub integrity_unchecked: bool,
}

impl JobFile {
    /// Constructs a plain data file.
    pub fn new(lfn: impl Into<String>) -> Self {
        Self {
            lfn: lfn.into(),
            executable: false,
            checkpoint: false,
            container_image: false,
            sources: Vec::new(),
            destination: None,
            integrity_unchecked: false,
        }
    }
}

/// The container runtimes a job can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    /// A docker image saved as a tarball.
    Docker,
    /// A singularity (apptainer) image.
    Singularity,
}

/// The container a job runs in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Container {
    /// The runtime used to run the image.
    pub kind: ContainerKind,
    /// The logical name of the image file among the job inputs.
    pub image: String,
    /// The image tag passed to the runtime; defaults to the logical name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Host paths mounted at the same path inside the container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<String>,
}

/// Ordered scheduler attributes of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchedulerAttributes(IndexMap<String, String>);

impl SchedulerAttributes {
    /// Sets an attribute.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Sets an attribute only if it is not already set.
    pub fn set_if_absent(&mut self, key: &str, value: impl Into<String>) {
        if !self.0.contains_key(key) {
            self.0.insert(key.to_string(), value.into());
        }
    }

    /// Gets an attribute.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Determines if an attribute is set.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Removes an attribute.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.shift_remove(key)
    }

    /// Iterates the attributes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// When a post script runs for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostScriptScope {
    /// Every job gets a post script.
    #[default]
    All,
    /// Replica registration jobs get no post script.
    Essential,
}

/// Meta-scheduler (DAG manager) directives of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct DagmanProfile {
    /// The post script; `none` disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<String>,
    /// Extra arguments for the post script.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_arguments: Option<String>,
    /// The scope of post scripts for the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_scope: Option<PostScriptScope>,
    /// A pre script run before the job is submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre: Option<String>,
    /// How often the job is retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
    /// The throttling category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// The meta-scheduler priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

/// Settings for the relay dispatch tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct RelayProfile {
    /// The designator of the remote site understood by the relay tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_designator: Option<String>,
    /// The SSH identity used to reach the remote site.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_identity_path: Option<String>,
    /// The directory the relay tool keeps job state in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_path: Option<String>,
}

/// Settings that control how a job is wrapped and launched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct WrapperProfile {
    /// Forces a particular enablement strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyKind>,
    /// Extra arguments passed to the launcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launcher_arguments: Option<String>,
    /// Overrides the path of the launcher or dispatch tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launcher_path: Option<String>,
    /// Asks the launcher to change into the job directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_dir: Option<bool>,
    /// Asks the launcher to create and change into the job directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_dir: Option<bool>,
    /// Overrides the worker-node directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wn_dir: Option<String>,
    /// The submission style.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<StyleKind>,
    /// The marker a post script looks for to classify a run as successful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_message: Option<String>,
    /// Checkpoint time in minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_time: Option<u64>,
    /// Maximum walltime in minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_walltime: Option<u64>,
    /// Expected runtime in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<u64>,
    /// Number of cores the job uses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    /// The data configuration; defaults to the engine setting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_configuration: Option<DataConfiguration>,
    /// Runs the job in a worker-node directory through launcher hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_node_execution: Option<bool>,
    /// A script on the submit host sourced before the job runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_setup: Option<String>,
    /// Ships the user proxy with the job instead of using a remote directory.
    #[serde(default)]
    pub transfer_proxy: bool,
    /// Whether the arguments are passed through the argument quoter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments_quote: Option<bool>,
    /// Remote gateway keys such as `queue`, `project` or `maxwalltime`.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub gateway: IndexMap<String, String>,
    /// Relay dispatch settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay: Option<RelayProfile>,
}

/// A file generated for a job that is written once the job's artifacts are
/// complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFile {
    /// The absolute path of the file in the submit directory.
    pub path: PathBuf,
    /// The contents of the file.
    pub contents: String,
    /// Whether the file should be marked executable.
    pub executable: bool,
}

/// A job to generate submit artifacts for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Job {
    /// The unique job identifier.
    pub id: String,
    /// The class of the job.
    pub class: JobClass,
    /// The complete transformation name (`namespace::name:version`).
    #[serde(default)]
    pub transformation: String,
    /// The identifier of the job in the abstract workflow.
    #[serde(default)]
    pub logical_id: String,
    /// The executable path on the target site.
    pub executable: String,
    /// The raw argument string.
    #[serde(default)]
    pub arguments: String,
    /// The standard input file; empty for none.
    #[serde(default)]
    pub stdin: String,
    /// The standard output file; empty for the default.
    #[serde(default)]
    pub stdout: String,
    /// The standard error file; empty for the default.
    #[serde(default)]
    pub stderr: String,
    /// The input files.
    #[serde(default)]
    pub inputs: Vec<JobFile>,
    /// The output files.
    #[serde(default)]
    pub outputs: Vec<JobFile>,
    /// The site the job executes on.
    pub site: String,
    /// The site data is staged to and from; defaults to the execution site.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_site: Option<String>,
    /// The container the job runs in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,
    /// The distance of the job from the workflow roots.
    #[serde(default)]
    pub depth: u32,
    /// The directory the job runs in on the remote site.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    /// Scheduler attributes.
    #[serde(default)]
    pub attributes: SchedulerAttributes,
    /// Environment variables.
    #[serde(default)]
    pub env: EnvironmentProfile,
    /// Hook commands run by the launcher.
    #[serde(default)]
    pub hooks: Hooks,
    /// Meta-scheduler directives.
    #[serde(default)]
    pub dagman: DagmanProfile,
    /// Wrapper settings.
    #[serde(default)]
    pub profile: WrapperProfile,
    /// Files the scheduler transfers to the job.
    #[serde(default, skip_serializing_if = "IndexSet::is_empty")]
    pub transfer_inputs: IndexSet<String>,
    /// Files the scheduler transfers back from the job.
    #[serde(default, skip_serializing_if = "IndexSet::is_empty")]
    pub transfer_outputs: IndexSet<String>,
    /// The strategy that enabled the job.
    #[serde(skip)]
    pub enabled_by: Option<StrategyKind>,
    /// Files generated for the job, written after assembly succeeds.
    #[serde(skip)]
    pub generated: Vec<GeneratedFile>,
}

impl Job {
    /// Constructs a new job with empty bags.
    pub fn new(
        id: impl Into<String>,
        class: JobClass,
        executable: impl Into<String>,
        site: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            logical_id: id.clone(),
            id,
            class,
            transformation: String::new(),
            executable: executable.into(),
            arguments: String::new(),
            stdin: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            site: site.into(),
            staging_site: None,
            container: None,
            depth: 0,
            directory: None,
            attributes: SchedulerAttributes::default(),
            env: EnvironmentProfile::new(),
            hooks: Hooks::default(),
            dagman: DagmanProfile::default(),
            profile: WrapperProfile::default(),
            transfer_inputs: IndexSet::new(),
            transfer_outputs: IndexSet::new(),
            enabled_by: None,
            generated: Vec::new(),
        }
    }

    /// Determines if the job runs on the submit host.
    pub fn is_local(&self) -> bool {
        self.site == LOCAL_SITE
    }

    /// Gets the site data is staged through.
    pub fn staging_site(&self) -> &str {
        self.staging_site.as_deref().unwrap_or(&self.site)
    }

    /// Determines if user executables are staged along with the job.
    pub fn user_executables_staged(&self) -> bool {
        self.inputs.iter().any(|f| f.executable)
    }

    /// Gets the transformation name to report, falling back to the
    /// executable.
    pub fn transformation(&self) -> &str {
        if self.transformation.is_empty() {
            &self.executable
        } else {
            &self.transformation
        }
    }

    /// Records a file to write along with the job's submit file.
    pub fn add_generated(&mut self, path: PathBuf, contents: String, executable: bool) {
        self.generated.push(GeneratedFile {
            path,
            contents,
            executable,
        });
    }
}

/// The tool that renders an aggregated job into a single executable form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterTool {
    /// The constituents are run in order by the cluster tool.
    #[default]
    Sequencer,
    /// The constituents are submitted to a cloud batch service.
    CloudBatch,
}

/// A job made of several constituent jobs that are submitted as one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct AggregatedJob {
    /// The aggregate job that is submitted.
    pub job: Job,
    /// The constituents, in the order they run.
    pub constituents: Vec<Job>,
    /// The tool the clustering phase chose to render the aggregate.
    #[serde(default)]
    pub clustered_by: ClusterTool,
}

impl AggregatedJob {
    /// Constructs a new aggregated job.
    pub fn new(mut job: Job, constituents: Vec<Job>, clustered_by: ClusterTool) -> Self {
        job.class = JobClass::Aggregated;
        Self {
            job,
            constituents,
            clustered_by,
        }
    }
}
