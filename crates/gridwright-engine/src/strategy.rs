//! Enablement strategies.
//!
//! A strategy turns an abstract job into one the scheduler can launch: it
//! rewrites the executable and arguments, binds standard streams and adds
//! whatever files and environment the launch needs. Strategies form a closed
//! set selected by [`StrategyKind`]; [`Strategy::new`] builds the variant
//! for a kind.
//!
//! Every strategy mutates the job in place. A strategy returns
//! [`Enablement::Unsupported`] only when the job's site lacks a capability
//! the strategy needs; every other problem is an [`EngineError`].

use std::fmt;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use strum::EnumIter;
use strum::IntoStaticStr;
use tracing::debug;

use crate::catalog::CredentialHandler;
use crate::catalog::HOME_VARIABLE;
use crate::catalog::SiteCatalog;
use crate::catalog::TransformationCatalog;
use crate::config::Config;
use crate::error::Capability;
use crate::error::EngineError;
use crate::error::EngineResult;
use crate::job::AggregatedJob;
use crate::job::ClusterTool;
use crate::job::DataConfiguration;
use crate::job::Job;
use crate::job::JobClass;
use crate::job::PostScriptScope;

pub mod bootstrap;
pub mod cloud_batch;
pub mod direct;
pub mod instrumented;
pub mod relay;

pub use bootstrap::Bootstrap;
pub use bootstrap::WorkerPackageCache;
pub use cloud_batch::CloudBatch;
pub use direct::Direct;
pub use instrumented::Instrumented;
pub use relay::Relay;

/// The transformation name of the instrumented launcher.
pub const LAUNCHER_TRANSFORMATION: &str = "gridwright::launch";

/// The file name of the instrumented launcher.
pub const LAUNCHER_BASENAME: &str = "gw-launch";

/// The transformation name of the data mover.
pub const TRANSFER_TRANSFORMATION: &str = "gridwright::transfer";

/// The file name of the data mover.
pub const TRANSFER_BASENAME: &str = "gw-transfer";

/// The transformation name of the sequencer tool.
pub const SEQUENCER_TRANSFORMATION: &str = "gridwright::cluster";

/// The file name of the sequencer tool.
pub const SEQUENCER_BASENAME: &str = "gw-cluster";

/// The transformation name of the relay dispatch tool.
pub const RELAY_TRANSFORMATION: &str = "gridwright::distribute";

/// The file name of the relay dispatch tool.
pub const RELAY_BASENAME: &str = "gw-distribute";

/// The file name of the integrity checking tool.
pub const INTEGRITY_BASENAME: &str = "gw-integrity";

/// The available enablement strategies.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StrategyKind {
    /// Launches the user's executable as is.
    Direct,
    /// Launches the executable through the instrumented launcher.
    #[default]
    Instrumented,
    /// Launches the job through a generated worker-node bootstrap script.
    Bootstrap,
    /// Dispatches the job from the submit host through the relay tool.
    Relay,
    /// Submits the constituents of a clustered job to a cloud batch
    /// service.
    CloudBatch,
}

impl StrategyKind {
    /// Determines if jobs enabled by this strategy are submitted from the
    /// submit host's local universe whatever their execution site.
    pub fn submits_locally(&self) -> bool {
        matches!(self, Self::Relay | Self::CloudBatch)
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s: &'static str = self.into();
        write!(f, "{s}")
    }
}

/// The outcome of enabling a job.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Enablement {
    /// The job was enabled.
    Enabled,
    /// The job's site lacks a capability the strategy needs.
    Unsupported(Capability),
}

impl Enablement {
    /// Determines if the job was enabled.
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// The post scripts a strategy can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum PostScript {
    /// Checks the launcher record (or the bootstrap success marker) for the
    /// job's exit code.
    #[strum(serialize = "gw-exitcode")]
    ExitCode,
    /// No post script.
    #[strum(serialize = "none")]
    None,
}

impl fmt::Display for PostScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s: &'static str = self.into();
        write!(f, "{s}")
    }
}

/// Selects the post script of a job.
///
/// The job's own `post` directive overrides the strategy default. With an
/// `essential` scope, replica registration jobs get no post script. Returns
/// `None` when no post script runs.
pub fn select_post_script(
    job: &Job,
    default: PostScript,
    scope: PostScriptScope,
) -> Option<String> {
    let scope = job.dagman.post_scope.unwrap_or(scope);
    if scope == PostScriptScope::Essential && job.class == JobClass::ReplicaRegistration {
        return None;
    }

    let name = match &job.dagman.post {
        Some(post) => post.as_str(),
        None => default.into(),
    };

    if name == <&str>::from(PostScript::None) {
        None
    } else {
        Some(name.to_string())
    }
}

/// Implemented by every enablement strategy.
pub trait JobEnabler {
    /// Enables a job, mutating it in place.
    fn enable(&self, job: &mut Job) -> EngineResult<Enablement>;

    /// Enables a clustered job and its constituents.
    fn enable_aggregated(&self, job: &mut AggregatedJob) -> EngineResult<Enablement>;

    /// The post script used when a job does not name one.
    fn default_post_script(&self) -> PostScript;

    /// Determines if the strategy can set the execute bit of staged
    /// executables on the remote site.
    fn can_set_execute_bit(&self) -> bool;

    /// Gets the directory the job runs in on the worker node.
    fn worker_node_directory(&self, job: &Job) -> String;
}

/// Everything a strategy consults while enabling jobs.
///
/// A context is shared by every job of a workflow and is only read.
#[derive(Clone, Copy)]
pub struct EnableContext<'a> {
    /// The engine configuration.
    pub config: &'a Config,
    /// The site catalog.
    pub sites: &'a dyn SiteCatalog,
    /// The transformation catalog.
    pub transformations: &'a dyn TransformationCatalog,
    /// The credential handler.
    pub credentials: &'a dyn CredentialHandler,
    /// The directory generated files are written to.
    pub submit_dir: &'a Path,
    /// The workflow's directory relative to site scratch directories.
    pub relative_dir: &'a str,
    /// Worker package locations, resolved once per site.
    pub worker_packages: &'a WorkerPackageCache,
}

impl fmt::Debug for EnableContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnableContext")
            .field("submit_dir", &self.submit_dir)
            .field("relative_dir", &self.relative_dir)
            .finish_non_exhaustive()
    }
}

impl<'a> EnableContext<'a> {
    /// Resolves the path of a planner tool on a site.
    ///
    /// The site's installed capability wins, then the transformation
    /// catalog, then `bin/<basename>` under the runtime the site's
    /// environment points at.
    pub fn resolve_tool(
        &self,
        site: &str,
        transformation: &str,
        basename: &str,
        capability: Option<&str>,
    ) -> Option<String> {
        if let Some(path) = capability.and_then(|c| self.sites.installed_path(site, c)) {
            return Some(path.to_string());
        }

        if let Some(path) = self.transformations.lookup(transformation, site) {
            return Some(path.to_string());
        }

        let home = self.sites.site(site)?.environment.get(HOME_VARIABLE)?;
        Some(format!(
            "{home}/bin/{basename}",
            home = home.trim_end_matches('/')
        ))
    }

    /// Gets the path of a file in the submit directory.
    pub fn submit_path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.submit_dir.join(name)
    }

    /// Gets the data configuration of a job.
    pub fn data_configuration(&self, job: &Job) -> DataConfiguration {
        job.profile
            .data_configuration
            .unwrap_or(self.config.data_configuration)
    }

    /// Gets the shared filesystem directory a job runs in on its site.
    ///
    /// An explicit directory on the job wins over the site's shared
    /// scratch directory.
    pub fn execution_directory(&self, job: &Job) -> Option<String> {
        if let Some(dir) = &job.directory {
            return Some(dir.clone());
        }

        let scratch = self.sites.shared_scratch(&job.site)?.trim_end_matches('/');
        let relative = self.relative_dir.trim_matches('/');
        if relative.is_empty() {
            Some(scratch.to_string())
        } else {
            Some(format!("{scratch}/{relative}"))
        }
    }
}

/// Selects the strategy for a job.
///
/// An explicit strategy on the job wins. Otherwise jobs that stage their own
/// data run through bootstrap scripts (clusters rendered by the cloud batch
/// tool through [`StrategyKind::CloudBatch`]) and all others use the
/// configured default.
pub fn select_strategy(
    config: &Config,
    job: &Job,
    clustered_by: Option<ClusterTool>,
) -> StrategyKind {
    if let Some(kind) = job.profile.strategy {
        return kind;
    }

    if clustered_by == Some(ClusterTool::CloudBatch) {
        return StrategyKind::CloudBatch;
    }

    let data = job
        .profile
        .data_configuration
        .unwrap_or(config.data_configuration);
    if data.stages_on_worker() {
        StrategyKind::Bootstrap
    } else {
        config.default_strategy
    }
}

/// Checks whether a job may be enabled by a strategy.
///
/// Returns `true` when the job is already enabled by the same strategy; a
/// job enabled by a different strategy is invalid.
fn already_enabled(job: &Job, kind: StrategyKind) -> EngineResult<bool> {
    match job.enabled_by {
        Some(existing) if existing == kind => {
            debug!(job = %job.id, "job is already enabled by strategy `{kind}`");
            Ok(true)
        }
        Some(existing) => Err(EngineError::invalid(
            &job.id,
            format!(
                "job is already enabled by strategy `{existing}` and cannot be enabled by \
                 `{kind}`"
            ),
        )),
        None => Ok(false),
    }
}

/// Runs `apply` on a job unless it is already enabled, recording the
/// strategy on success.
pub(crate) fn guarded(
    job: &mut Job,
    kind: StrategyKind,
    apply: impl FnOnce(&mut Job) -> EngineResult<Enablement>,
) -> EngineResult<Enablement> {
    if already_enabled(job, kind)? {
        return Ok(Enablement::Enabled);
    }

    // Work on a copy so a rejected job is left exactly as it was given.
    let mut candidate = job.clone();
    let enablement = apply(&mut candidate)?;
    if enablement.is_enabled() {
        candidate.enabled_by = Some(kind);
        *job = candidate;
    }
    Ok(enablement)
}

/// Runs `apply` on a clustered job unless it is already enabled, recording
/// the strategy on the aggregate on success.
pub(crate) fn guarded_aggregate(
    job: &mut AggregatedJob,
    kind: StrategyKind,
    apply: impl FnOnce(&mut AggregatedJob) -> EngineResult<Enablement>,
) -> EngineResult<Enablement> {
    if already_enabled(&job.job, kind)? {
        return Ok(Enablement::Enabled);
    }

    let mut candidate = job.clone();
    let enablement = apply(&mut candidate)?;
    if enablement.is_enabled() {
        candidate.job.enabled_by = Some(kind);
        *job = candidate;
    }
    Ok(enablement)
}

/// Sets the directory a job starts in, using the key the job's universe
/// understands.
pub(crate) fn set_directory(job: &mut Job, dir: &str) {
    let key = match job.attributes.get(crate::style::UNIVERSE_KEY) {
        Some("local" | "scheduler" | "standard") => "initialdir",
        _ => "remote_initialdir",
    };
    job.attributes.set(key, dir);
    job.directory = Some(dir.to_string());
}

/// Removes any directory a job starts in.
pub(crate) fn clear_directory(job: &mut Job) {
    job.attributes.remove("initialdir");
    job.attributes.remove("remote_initialdir");
    job.directory = None;
}

/// Moves a job to the submit host's local universe, dropping whatever its
/// submission style set up for a remote gateway.
pub(crate) fn submit_locally(job: &mut Job) {
    job.site = crate::job::LOCAL_SITE.to_string();
    job.profile.style = Some(crate::style::StyleKind::Condor);
    job.attributes.set(crate::style::UNIVERSE_KEY, "local");
    job.attributes.remove(crate::style::GRID_RESOURCE_KEY);
    job.attributes.remove("globusrsl");
    job.attributes.remove("remote_universe");
}

/// Determines if the job is submitted through a remote gateway.
pub(crate) fn is_gateway_job(job: &Job) -> bool {
    job.profile.style.is_some_and(|s| s.is_remote_gateway())
}

/// A strategy built for a particular kind.
#[derive(Debug)]
pub enum Strategy<'a> {
    /// See [`Direct`].
    Direct(Direct<'a>),
    /// See [`Instrumented`].
    Instrumented(Instrumented<'a>),
    /// See [`Bootstrap`].
    Bootstrap(Bootstrap<'a>),
    /// See [`Relay`].
    Relay(Relay<'a>),
    /// See [`CloudBatch`].
    CloudBatch(CloudBatch<'a>),
}

impl<'a> Strategy<'a> {
    /// Builds the strategy of the given kind.
    pub fn new(kind: StrategyKind, ctx: EnableContext<'a>) -> Self {
        match kind {
            StrategyKind::Direct => Self::Direct(Direct::new(ctx)),
            StrategyKind::Instrumented => Self::Instrumented(Instrumented::new(ctx)),
            StrategyKind::Bootstrap => Self::Bootstrap(Bootstrap::new(ctx)),
            StrategyKind::Relay => Self::Relay(Relay::new(ctx)),
            StrategyKind::CloudBatch => Self::CloudBatch(CloudBatch::new(ctx)),
        }
    }

    /// Gets the kind of the strategy.
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::Direct(_) => StrategyKind::Direct,
            Self::Instrumented(_) => StrategyKind::Instrumented,
            Self::Bootstrap(_) => StrategyKind::Bootstrap,
            Self::Relay(_) => StrategyKind::Relay,
            Self::CloudBatch(_) => StrategyKind::CloudBatch,
        }
    }

    /// Gets the strategy as a trait object.
    fn enabler(&self) -> &dyn JobEnabler {
        match self {
            Self::Direct(s) => s,
            Self::Instrumented(s) => s,
            Self::Bootstrap(s) => s,
            Self::Relay(s) => s,
            Self::CloudBatch(s) => s,
        }
    }
}

impl JobEnabler for Strategy<'_> {
    fn enable(&self, job: &mut Job) -> EngineResult<Enablement> {
        self.enabler().enable(job)
    }

    fn enable_aggregated(&self, job: &mut AggregatedJob) -> EngineResult<Enablement> {
        self.enabler().enable_aggregated(job)
    }

    fn default_post_script(&self) -> PostScript {
        self.enabler().default_post_script()
    }

    fn can_set_execute_bit(&self) -> bool {
        self.enabler().can_set_execute_bit()
    }

    fn worker_node_directory(&self, job: &Job) -> String {
        self.enabler().worker_node_directory(job)
    }
}
