//! Launches jobs through generated worker-node bootstrap scripts.
//!
//! A bootstrap script is what the scheduler runs on the worker node. It
//! creates a work directory, puts the worker package on the path, stages
//! the job's inputs, runs the job through an inner strategy, stages the
//! outputs back and removes the work directory again, whatever way the
//! script ends.
//!
//! The script sources the shared helper library [`COMMON_LIBRARY`], which
//! the scheduler ships alongside it.

use std::path::Path;
use std::path::PathBuf;

use tracing::debug;

use super::EnableContext;
use super::Enablement;
use super::INTEGRITY_BASENAME;
use super::JobEnabler;
use super::PostScript;
use super::SEQUENCER_BASENAME;
use super::SEQUENCER_TRANSFORMATION;
use super::StrategyKind;
use super::TRANSFER_BASENAME;
use super::TRANSFER_TRANSFORMATION;
use super::clear_directory;
use super::direct::Direct;
use super::direct::bind_stdio;
use super::guarded;
use super::guarded_aggregate;
use super::instrumented::Instrumented;
use super::instrumented::suppress_header;
use crate::catalog::HOME_VARIABLE;
use crate::error::Capability;
use crate::error::EngineError;
use crate::error::EngineResult;
use crate::job::AggregatedJob;
use crate::job::DataConfiguration;
use crate::job::Job;
use crate::job::JobClass;
use crate::job::JobFile;
use crate::lifecycle;
use crate::lifecycle::Linkage;
use crate::lifecycle::TransferKind;
use crate::sequencer;

mod container;
mod package;
pub(crate) mod script;

pub use package::WORKER_PACKAGE_TRANSFORMATION;
pub use package::WorkerPackageCache;
use script::Fragment;
use script::WorkDir;

/// The shell library every bootstrap script sources.
pub const COMMON_LIBRARY: &str = include_str!("bootstrap/gw-lite-common.sh");

/// The file name of the shell library in the submit directory.
pub const COMMON_LIBRARY_BASENAME: &str = "gw-lite-common.sh";

/// The marker a successful bootstrap script prints on its standard error.
pub const SUCCESS_MESSAGE: &str = "GridwrightLite: exitcode 0";

/// The job environment variable naming the parent of the work directory.
pub const WORK_DIR_PARENT_VARIABLE: &str = "GW_WN_TMP";

/// The worker-node directory reported for bootstrapped jobs.
const WORKER_NODE_DIRECTORY: &str = "$PWD";

/// Gets the path of the shell library in a submit directory.
pub fn common_library_path(submit_dir: &Path) -> PathBuf {
    submit_dir.join(COMMON_LIBRARY_BASENAME)
}

/// Where the worker package of a job comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WorkerPackage {
    /// The site already provides the runtime.
    Provided,
    /// The package is shipped with the job.
    Staged(String),
    /// The script downloads the package if it may.
    Download(Option<String>),
}

/// The data movement a bootstrap script performs.
#[derive(Debug, Default)]
struct Staging {
    /// The transfer list for container images.
    containers: Option<String>,
    /// The transfer list for inputs.
    inputs: Option<String>,
    /// The transfer list for outputs.
    outputs: Option<String>,
    /// Inputs whose checksums are verified.
    verify: Vec<String>,
}

/// The strategy running inside the bootstrap script.
#[derive(Debug, Clone, Copy)]
enum Inner<'a> {
    /// The instrumented launcher from the worker package.
    Instrumented(Instrumented<'a>),
    /// The user's executable as is.
    Direct(Direct<'a>),
}

impl Inner<'_> {
    /// Gets the kind of the inner strategy.
    fn kind(&self) -> StrategyKind {
        match self {
            Self::Instrumented(_) => StrategyKind::Instrumented,
            Self::Direct(_) => StrategyKind::Direct,
        }
    }

    /// Enables a job with the inner strategy.
    fn apply(&self, job: &mut Job) -> EngineResult<Enablement> {
        match self {
            Self::Instrumented(s) => s.apply(job),
            Self::Direct(s) => s.apply(job),
        }
    }

    /// Enables a constituent of a clustered job with the inner strategy.
    fn apply_constituent(&self, job: &mut Job) -> EngineResult<Enablement> {
        match self {
            Self::Instrumented(s) => s.apply_constituent(job),
            Self::Direct(s) => s.apply(job),
        }
    }
}

/// Wraps jobs in worker-node bootstrap scripts.
#[derive(Debug, Clone, Copy)]
pub struct Bootstrap<'a> {
    /// The enablement context.
    ctx: EnableContext<'a>,
}

impl<'a> Bootstrap<'a> {
    /// Constructs the strategy.
    pub fn new(ctx: EnableContext<'a>) -> Self {
        Self { ctx }
    }

    /// Gets the strategy that runs inside the script.
    fn inner(&self) -> Inner<'a> {
        if self.ctx.config.bootstrap.instrumentation {
            Inner::Instrumented(Instrumented::in_worker_package(self.ctx))
        } else {
            Inner::Direct(Direct::new(self.ctx))
        }
    }

    /// Gets a worker package tool, preferring a catalogued location on the
    /// job's site.
    fn tool(&self, job: &Job, transformation: &str, basename: &str) -> String {
        self.ctx
            .transformations
            .lookup(transformation, &job.site)
            .unwrap_or(basename)
            .to_string()
    }

    /// Gets the data configuration of a job, failing for shared filesystem
    /// jobs.
    fn data_configuration(&self, job: &Job) -> EngineResult<DataConfiguration> {
        let data = self.ctx.data_configuration(job);
        if !data.stages_on_worker() {
            return Err(EngineError::invalid(
                &job.id,
                "bootstrap scripts require the `nonsharedfs` or `condorio` data configuration",
            ));
        }
        Ok(data)
    }

    /// Determines where the worker package of a job comes from.
    fn worker_package(&self, job: &Job) -> Result<WorkerPackage, Capability> {
        let site = self.ctx.sites.site(&job.site);
        let provided = site.is_some_and(|s| s.environment.contains(HOME_VARIABLE))
            || job.env.contains(HOME_VARIABLE);
        if provided || job.class == JobClass::SubWorkflow {
            return Ok(WorkerPackage::Provided);
        }

        let config = &self.ctx.config.bootstrap;
        let location = self.ctx.worker_packages.location(&job.site, || {
            site.and_then(|s| s.worker_package.clone()).or_else(|| {
                self.ctx
                    .transformations
                    .lookup(WORKER_PACKAGE_TRANSFORMATION, &job.site)
                    .map(str::to_string)
            })
        });

        if config.stage_worker_package {
            location
                .map(WorkerPackage::Staged)
                .ok_or(Capability::WorkerPackage)
        } else {
            Ok(WorkerPackage::Download(
                location.filter(|_| config.allow_worker_package_download),
            ))
        }
    }

    /// Determines the data movement of a job and attaches what it needs.
    fn stage(&self, job: &mut Job, data: DataConfiguration) -> EngineResult<Staging> {
        let mut staging = Staging::default();
        if !matches!(job.class, JobClass::Compute | JobClass::Aggregated) {
            return Ok(staging);
        }

        if self.ctx.config.bootstrap.integrity_checking {
            staging.verify = job
                .inputs
                .iter()
                .filter(|f| !f.integrity_unchecked && !f.container_image)
                .map(|f| f.lfn.clone())
                .collect();
        }

        if data == DataConfiguration::CondorIo {
            let sources: Vec<_> = job
                .inputs
                .iter()
                .map(|f| self.condor_io_source(job, f))
                .collect();
            let outputs: Vec<_> = job.outputs.iter().map(|f| f.lfn.clone()).collect();
            job.transfer_inputs.extend(sources);
            job.transfer_outputs.extend(outputs);
            return Ok(staging);
        }

        let plan = lifecycle::plan(&self.ctx, job, script::WORK_DIR_TOKEN)?;
        lifecycle::attach_credentials(&self.ctx, job, &plan);

        let (containers, inputs): (Vec<_>, Vec<_>) = plan
            .stage_in
            .into_iter()
            .partition(|t| t.kind == TransferKind::Container);
        if !containers.is_empty() {
            staging.containers = Some(lifecycle::transfer_list(job, Linkage::Input, &containers)?);
        }
        if !inputs.is_empty() {
            staging.inputs = Some(lifecycle::transfer_list(job, Linkage::Input, &inputs)?);
        }
        if !plan.stage_out.is_empty() {
            staging.outputs = Some(lifecycle::transfer_list(
                job,
                Linkage::Output,
                &plan.stage_out,
            )?);
        }
        Ok(staging)
    }

    /// Gets the submit host path the scheduler ships an input from.
    fn condor_io_source(&self, job: &Job, file: &JobFile) -> String {
        if let Some(source) = file.sources.first() {
            return source
                .url
                .strip_prefix("file://")
                .unwrap_or(&source.url)
                .to_string();
        }

        let staging = self.ctx.sites.shared_scratch(job.staging_site());
        let relative = self.ctx.relative_dir.trim_matches('/');
        match staging {
            Some(scratch) => format!(
                "{scratch}/{relative}/{lfn}",
                scratch = scratch.trim_end_matches('/'),
                lfn = file.lfn
            ),
            None => self.ctx.submit_path(&file.lfn).display().to_string(),
        }
    }

    /// Determines how the script picks its work directory.
    fn work_dir(&self, job: &Job, data: DataConfiguration) -> WorkDir {
        if data == DataConfiguration::CondorIo {
            return WorkDir::SchedulerDirectory;
        }

        job.env
            .get(WORK_DIR_PARENT_VARIABLE)
            .map(str::to_string)
            .or_else(|| job.profile.wn_dir.clone())
            .or_else(|| {
                self.ctx
                    .sites
                    .site(&job.site)
                    .and_then(|s| s.local_scratch.clone())
            })
            .map(WorkDir::Under)
            .unwrap_or(WorkDir::FromEnvironment)
    }

    /// Ships the standard input of planner tools with the job.
    fn ship_stdin(&self, job: &mut Job) {
        if job.class.ships_stdin() && !job.stdin.is_empty() {
            let path = self.ctx.submit_path(&job.stdin).display().to_string();
            job.transfer_inputs.insert(path);
        }
    }

    /// Writes the script of an enabled job and points the job at it.
    fn finish(
        &self,
        job: &mut Job,
        data: DataConfiguration,
        package: WorkerPackage,
        staging: Staging,
        command: String,
        inner: StrategyKind,
    ) {
        let config = &self.ctx.config.bootstrap;
        let transfer = self.tool(job, TRANSFER_TRANSFORMATION, TRANSFER_BASENAME);

        let mut fragments = vec![
            Fragment::Preamble {
                library: COMMON_LIBRARY_BASENAME,
                strict_check: config.strict_worker_package_check,
                allow_download: config.allow_worker_package_download,
                package_url: match &package {
                    WorkerPackage::Download(url) => url.clone(),
                    _ => None,
                },
            },
            Fragment::Traps,
            Fragment::WorkDir(self.work_dir(job, data)),
            Fragment::WorkerPackage,
        ];

        if let Some(list) = staging.containers {
            fragments.push(Fragment::Transfer {
                message: "Staging in container",
                tool: transfer.clone(),
                list,
            });
        }
        if let Some(list) = staging.inputs {
            fragments.push(Fragment::Transfer {
                message: "Staging in input data and executables",
                tool: transfer.clone(),
                list,
            });
        }
        if !staging.verify.is_empty() {
            fragments.push(Fragment::Integrity {
                tool: INTEGRITY_BASENAME.to_string(),
                files: staging.verify,
            });
        }
        if let Some(setup) = job.profile.environment_setup.clone() {
            job.transfer_inputs.insert(setup.clone());
            fragments.push(Fragment::EnvironmentSetup(
                lifecycle::basename(&setup).to_string(),
            ));
        }

        fragments.push(Fragment::Run(container::wrap(
            job.container.as_ref(),
            &command,
        )));

        if let Some(list) = staging.outputs {
            fragments.push(Fragment::Transfer {
                message: "Staging out output files",
                tool: transfer,
                list,
            });
        }
        fragments.push(Fragment::Exit);

        let name = format!("{id}.sh", id = job.id);
        let path = self.ctx.submit_path(&name);
        job.add_generated(path.clone(), script::assemble(&fragments), true);

        job.executable = path.display().to_string();
        job.arguments.clear();
        job.stdin.clear();
        job.attributes.set("transfer_executable", "true");
        job.attributes.remove("input");
        clear_directory(job);
        job.profile.change_dir = Some(false);
        job.profile.create_dir = Some(false);
        job.profile.success_message = Some(SUCCESS_MESSAGE.to_string());

        job.transfer_inputs.shift_insert(
            0,
            common_library_path(self.ctx.submit_dir).display().to_string(),
        );
        if let WorkerPackage::Staged(location) = package {
            job.transfer_inputs.insert(location);
        }

        if inner == StrategyKind::Direct || !config.integrity_checking {
            for output in &mut job.outputs {
                output.integrity_unchecked = true;
            }
        }

        debug!(job = %job.id, inner = %inner, "enabled job through a bootstrap script");
    }

    /// Enables a job without recording the strategy.
    pub(crate) fn apply(&self, job: &mut Job) -> EngineResult<Enablement> {
        let data = self.data_configuration(job)?;
        let inner = self.inner();

        if job.is_local() && job.class != JobClass::Compute {
            debug!(job = %job.id, "local planner job runs without a bootstrap script");
            return if self.ctx.config.bootstrap.instrumentation {
                Instrumented::new(self.ctx).apply(job)
            } else {
                inner.apply(job)
            };
        }

        let package = match self.worker_package(job) {
            Ok(package) => package,
            Err(capability) => return Ok(Enablement::Unsupported(capability)),
        };

        let staging = self.stage(job, data)?;
        self.ship_stdin(job);
        job.profile.change_dir = Some(false);
        job.profile.create_dir = Some(false);
        job.directory = None;

        let enablement = inner.apply(job)?;
        if !enablement.is_enabled() {
            return Ok(enablement);
        }

        let mut command = format!(
            "{exe} {args}",
            exe = job.executable,
            args = job.arguments
        )
        .trim_end()
        .to_string();
        if inner.kind() == StrategyKind::Direct && !job.stdin.is_empty() {
            command.push_str(" < ");
            command.push_str(&job.stdin);
        }

        self.finish(job, data, package, staging, command, inner.kind());
        Ok(Enablement::Enabled)
    }

    /// Enables a clustered job without recording the strategy.
    ///
    /// The constituents are rendered for the sequencer, which the script
    /// runs on the task list shipped with the job.
    pub(crate) fn apply_aggregated(&self, job: &mut AggregatedJob) -> EngineResult<Enablement> {
        let data = self.data_configuration(&job.job)?;
        let inner = self.inner();

        let package = match self.worker_package(&job.job) {
            Ok(package) => package,
            Err(capability) => return Ok(Enablement::Unsupported(capability)),
        };

        if job.job.inputs.is_empty() && job.job.outputs.is_empty() {
            collect_files(job);
        }

        let staging = self.stage(&mut job.job, data)?;
        for (i, constituent) in job.constituents.iter_mut().enumerate() {
            constituent.profile.change_dir = Some(false);
            constituent.profile.create_dir = Some(false);
            constituent.directory = None;
            if i > 0 && inner.kind() == StrategyKind::Instrumented {
                suppress_header(constituent);
            }

            let enablement = guarded(constituent, inner.kind(), |c| inner.apply_constituent(c))?;
            if !enablement.is_enabled() {
                return Ok(enablement);
            }
        }

        let tool = self.tool(&job.job, SEQUENCER_TRANSFORMATION, SEQUENCER_BASENAME);
        sequencer::make_concrete(&self.ctx, job, &tool, None)?;

        let aggregate = &mut job.job;
        bind_stdio(&self.ctx, aggregate);
        let list = self.ctx.submit_path(&aggregate.stdin).display().to_string();
        aggregate.transfer_inputs.insert(list);
        let command = format!(
            "{exe} {args} < {stdin}",
            exe = aggregate.executable,
            args = aggregate.arguments,
            stdin = aggregate.stdin
        )
        .replace("  ", " ");

        self.finish(aggregate, data, package, staging, command, inner.kind());
        Ok(Enablement::Enabled)
    }
}

/// Collects the files of a clustered job from its constituents.
///
/// Files produced by one constituent and consumed by a later one stay on
/// the worker node.
fn collect_files(job: &mut AggregatedJob) {
    let mut inputs: Vec<JobFile> = Vec::new();
    let mut outputs: Vec<JobFile> = Vec::new();
    for constituent in &job.constituents {
        for input in &constituent.inputs {
            let produced = outputs.iter().any(|o| o.lfn == input.lfn);
            let seen = inputs.iter().any(|i| i.lfn == input.lfn);
            if !produced && !seen {
                inputs.push(input.clone());
            }
        }
        for output in &constituent.outputs {
            if !outputs.iter().any(|o| o.lfn == output.lfn) {
                outputs.push(output.clone());
            }
        }
    }
    job.job.inputs = inputs;
    job.job.outputs = outputs;
}

impl JobEnabler for Bootstrap<'_> {
    fn enable(&self, job: &mut Job) -> EngineResult<Enablement> {
        guarded(job, StrategyKind::Bootstrap, |job| self.apply(job))
    }

    fn enable_aggregated(&self, job: &mut AggregatedJob) -> EngineResult<Enablement> {
        guarded_aggregate(job, StrategyKind::Bootstrap, |job| {
            self.apply_aggregated(job)
        })
    }

    fn default_post_script(&self) -> PostScript {
        PostScript::ExitCode
    }

    fn can_set_execute_bit(&self) -> bool {
        false
    }

    fn worker_node_directory(&self, _: &Job) -> String {
        WORKER_NODE_DIRECTORY.to_string()
    }
}
