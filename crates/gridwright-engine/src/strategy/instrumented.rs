//! Launches jobs through the instrumented launcher.
//!
//! The launcher records start and stop times, the exit status and optional
//! file statistics of the command it runs. Its own output is the job's
//! scheduler output, so the user's streams are passed to it as options.

use std::fmt::Write as _;

use tracing::debug;
use tracing::warn;

use super::EnableContext;
use super::Enablement;
use super::JobEnabler;
use super::LAUNCHER_BASENAME;
use super::LAUNCHER_TRANSFORMATION;
use super::PostScript;
use super::StrategyKind;
use super::direct::bind_stdio;
use super::guarded;
use super::guarded_aggregate;
use super::set_directory;
use crate::catalog::LAUNCHER_CAPABILITY;
use crate::error::Capability;
use crate::error::EngineError;
use crate::error::EngineResult;
use crate::job::AggregatedJob;
use crate::job::Job;
use crate::job::JobClass;
use crate::job::JobFile;
use crate::lifecycle;
use crate::sequencer;

/// The environment variable announcing the directory a job runs in.
pub const SCRATCH_DIR_VARIABLE: &str = "GW_SCRATCH_DIR";

/// The launcher option that suppresses its record header.
pub const SUPPRESS_HEADER_OPTION: &str = "-H";

/// The minimum number of seconds between a checkpoint signal and the end of
/// a job's walltime.
const MIN_CHECKPOINT_GRACE: u64 = 10;

/// Wraps jobs with the instrumented launcher.
#[derive(Debug, Clone, Copy)]
pub struct Instrumented<'a> {
    /// The enablement context.
    ctx: EnableContext<'a>,
    /// Whether to refer to the launcher by its installed path.
    ///
    /// Bootstrap scripts find the launcher in the worker package and only
    /// need its file name.
    full_path: bool,
}

impl<'a> Instrumented<'a> {
    /// Constructs the strategy.
    pub fn new(ctx: EnableContext<'a>) -> Self {
        Self {
            ctx,
            full_path: true,
        }
    }

    /// Constructs the strategy for launching inside a bootstrap script.
    pub(crate) fn in_worker_package(ctx: EnableContext<'a>) -> Self {
        Self {
            ctx,
            full_path: false,
        }
    }

    /// Resolves the launcher for a job.
    fn launcher(&self, job: &Job) -> Option<String> {
        if let Some(path) = &job.profile.launcher_path {
            return Some(path.clone());
        }

        if !self.full_path {
            return Some(
                self.ctx
                    .transformations
                    .lookup(LAUNCHER_TRANSFORMATION, &job.site)
                    .unwrap_or(LAUNCHER_BASENAME)
                    .to_string(),
            );
        }

        self.ctx.resolve_tool(
            &job.site,
            LAUNCHER_TRANSFORMATION,
            LAUNCHER_BASENAME,
            Some(LAUNCHER_CAPABILITY),
        )
    }

    /// Determines if the launcher runs the job in a worker-node directory
    /// through hooks.
    ///
    /// Only jobs that stage their own data do so unless the job asks for it
    /// explicitly.
    fn worker_node_execution(&self, job: &Job) -> bool {
        self.full_path
            && job.profile.worker_node_execution.unwrap_or(
                self.ctx.config.launcher.worker_node_execution
                    && self.ctx.data_configuration(job).stages_on_worker(),
            )
    }

    /// Wraps a job with the launcher without recording the strategy.
    pub(crate) fn apply(&self, job: &mut Job) -> EngineResult<Enablement> {
        self.wrap(job, false)
    }

    /// Wraps a constituent of a clustered job without recording the
    /// strategy.
    pub(crate) fn apply_constituent(&self, job: &mut Job) -> EngineResult<Enablement> {
        self.wrap(job, true)
    }

    /// Wraps a job or a constituent of a clustered job.
    fn wrap(&self, job: &mut Job, constituent: bool) -> EngineResult<Enablement> {
        let Some(launcher) = self.launcher(job) else {
            return Ok(Enablement::Unsupported(Capability::Launcher));
        };

        let timeouts = timeout_options(job)?;
        let config = &self.ctx.config.launcher;
        let mut args = String::new();

        // Writing to a string cannot fail.
        let _ = write!(
            args,
            " -n {tx} -N {id} ",
            tx = job.transformation(),
            id = job.logical_id
        );

        if !job.stdin.is_empty() {
            if job.class.ships_stdin() && self.full_path {
                args.push_str("-i - ");
                let input = self.ctx.submit_path(&job.stdin).display().to_string();
                job.attributes.set("input", input);
            } else {
                let _ = write!(args, "-i {stdin} ", stdin = job.stdin);
            }
        }

        if !job.stdout.is_empty() {
            if job.stdout == format!("{id}.out", id = job.id) {
                warn!(
                    job = %job.id,
                    "standard output `{stdout}` is overwritten by the launcher record (WAW \
                     conflict)",
                    stdout = job.stdout
                );
            }
            let _ = write!(args, "-o {stdout} ", stdout = job.stdout);
        }

        if !job.stderr.is_empty() {
            let _ = write!(args, "-e {stderr} ", stderr = job.stderr);
        }

        let _ = write!(args, "-R {site} ", site = job.site);

        let mut invoke_directory = None;
        if !constituent && self.worker_node_execution(job) {
            let dir = lifecycle::worker_node_directory(&self.ctx, job);
            let plan = lifecycle::plan(&self.ctx, job, &dir)?;
            lifecycle::install_hooks(&self.ctx, job, &plan)?;
            job.env.set(SCRATCH_DIR_VARIABLE, dir.as_str());
            let _ = write!(args, " -w {dir} ");
            job.directory = None;
        } else if job.profile.create_dir == Some(true)
            && let Some(dir) = self.ctx.execution_directory(job)
        {
            job.env.set(SCRATCH_DIR_VARIABLE, dir.as_str());
            let _ = write!(args, " -W {dir} ");
            job.directory = None;
        } else if job.profile.change_dir == Some(true)
            && let Some(dir) = self.ctx.execution_directory(job)
        {
            job.env.set(SCRATCH_DIR_VARIABLE, dir.as_str());
            let _ = write!(args, " -w {dir} ");
            job.directory = None;
        } else if job.profile.transfer_proxy {
            job.directory = None;
        } else if self.full_path && requires_directory(job.class) {
            invoke_directory = self.ctx.execution_directory(job);
        }

        if config.set_execute_bit && job.user_executables_staged() {
            args.push_str(" -X ");
        }

        if config.stat {
            self.stat_options(job, &mut args);
        }

        if let Some(extra) = &job.profile.launcher_arguments {
            let _ = write!(args, " {extra} ");
        }

        args.push_str(&timeouts);

        let command = format!(
            "{exe} {arguments}",
            exe = job.executable,
            arguments = job.arguments
        );
        let command = command.trim_end();

        let tail = if !constituent && self.use_invoke(job, command) {
            if let Some(dir) = invoke_directory.take() {
                let _ = write!(args, " -w {dir} ");
                job.directory = None;
            }
            let name = format!("{id}.arg", id = job.id);
            let mut contents = String::new();
            contents.push_str(&job.executable);
            contents.push('\n');
            for token in job.arguments.split_whitespace() {
                contents.push_str(token);
                contents.push('\n');
            }
            let path = self.ctx.submit_path(&name);
            job.transfer_inputs.insert(path.display().to_string());
            job.add_generated(path, contents, false);
            format!("-I {name}")
        } else {
            command.to_string()
        };

        if let Some(dir) = invoke_directory {
            set_directory(job, &dir);
        }

        // The launcher's record is the job's output; the user's streams are
        // handled by the launcher itself.
        let streams = (
            std::mem::take(&mut job.stdin),
            std::mem::take(&mut job.stdout),
            std::mem::take(&mut job.stderr),
        );
        bind_stdio(&self.ctx, job);
        (job.stdin, job.stdout, job.stderr) = streams;

        // Only the launcher options are normalized; the user's command is
        // passed through as written.
        job.executable = launcher;
        job.arguments = format!("{options} {tail}", options = collapse_spaces(&args))
            .trim_start()
            .to_string();
        debug!(
            job = %job.id,
            launcher = %job.executable,
            "enabled job through the instrumented launcher"
        );
        Ok(Enablement::Enabled)
    }

    /// Determines if a job's invocation is written to an invocation file.
    fn use_invoke(&self, job: &Job, command: &str) -> bool {
        let config = &self.ctx.config.launcher;
        !config.disable_invoke
            && job.class == JobClass::Compute
            && (config.always_invoke || command.len() > config.invoke_length)
    }

    /// Appends the file statistics options, writing the list-of-files
    /// files they refer to.
    fn stat_options(&self, job: &mut Job, args: &mut String) {
        if !job.class.is_transfer() && !job.inputs.is_empty() {
            let name = format!("{id}.in.lof", id = job.id);
            let inputs = job.inputs.clone();
            self.write_lof(job, &name, inputs);
            let _ = write!(args, " -S @{name} ");
        }

        if job.class != JobClass::Cleanup && !job.outputs.is_empty() {
            let name = format!("{id}.out.lof", id = job.id);
            let outputs = job.outputs.clone();
            self.write_lof(job, &name, outputs);
            let _ = write!(args, " -s @{name} ");
        }
    }

    /// Writes a list-of-files file for the launcher.
    fn write_lof(&self, job: &mut Job, name: &str, files: Vec<JobFile>) {
        let mut contents = String::new();
        for file in files {
            let _ = writeln!(contents, "{lfn}={lfn}", lfn = file.lfn);
        }
        let path = self.ctx.submit_path(name);
        job.transfer_inputs.insert(path.display().to_string());
        job.add_generated(path, contents, false);
    }

    /// Enables a clustered job without recording the strategy.
    pub(crate) fn apply_aggregated(&self, job: &mut AggregatedJob) -> EngineResult<Enablement> {
        let tool = match sequencer::cluster_tool(&self.ctx, &job.job) {
            Ok(tool) => tool,
            Err(capability) => return Ok(Enablement::Unsupported(capability)),
        };

        let worker_node = self.worker_node_execution(&job.job);
        let directory = if worker_node {
            Some(lifecycle::worker_node_directory(&self.ctx, &job.job))
        } else {
            None
        };

        for (i, constituent) in job.constituents.iter_mut().enumerate() {
            if i > 0 {
                suppress_header(constituent);
            }
            if let Some(dir) = &directory {
                constituent.directory = Some(dir.clone());
                constituent.profile.change_dir = Some(true);
                constituent.profile.create_dir = Some(false);
            }

            let enablement = guarded(constituent, StrategyKind::Instrumented, |c| {
                self.apply_constituent(c)
            })?;
            if !enablement.is_enabled() {
                return Ok(enablement);
            }
        }

        let tasks = match &directory {
            Some(dir) => {
                let mut inputs = Vec::new();
                let mut outputs = Vec::new();
                for constituent in &job.constituents {
                    inputs.extend(constituent.inputs.iter().cloned());
                    outputs.extend(constituent.outputs.iter().cloned());
                }
                job.job.inputs = inputs;
                job.job.outputs = outputs;
                let plan = lifecycle::plan(&self.ctx, &job.job, dir)?;
                Some(lifecycle::sequenced_tasks(&self.ctx, &mut job.job, &plan)?)
            }
            None => None,
        };

        sequencer::make_concrete(&self.ctx, job, &tool, tasks)?;
        super::Direct::new(self.ctx).apply(&mut job.job)
    }
}

/// Adds the header suppression option to a constituent's launcher
/// arguments.
pub(crate) fn suppress_header(job: &mut Job) {
    let args = job.profile.launcher_arguments.get_or_insert_default();
    if !args
        .split_whitespace()
        .any(|a| a == SUPPRESS_HEADER_OPTION)
    {
        args.push(' ');
        args.push_str(SUPPRESS_HEADER_OPTION);
    }
}

/// Determines if the launcher should be started in the job's remote
/// directory.
fn requires_directory(class: JobClass) -> bool {
    !matches!(class, JobClass::Cleanup | JobClass::ReplicaRegistration)
}

/// Builds the checkpoint timeout options of a job.
///
/// The launcher signals the job to checkpoint after the checkpoint time and
/// kills it halfway between then and the end of its walltime.
fn timeout_options(job: &Job) -> EngineResult<String> {
    let Some(checkpoint) = job.profile.checkpoint_time else {
        return Ok(String::new());
    };
    let checkpoint = checkpoint * 60;
    let mut options = format!(" -k {checkpoint} ");

    let max = job
        .profile
        .max_walltime
        .map(|m| m * 60)
        .or_else(|| {
            job.profile
                .gateway
                .get("maxwalltime")
                .and_then(|m| m.trim().parse::<u64>().ok())
                .map(|m| m * 60)
        })
        .or(job.profile.runtime);

    if let Some(max) = max {
        let grace = max.checked_sub(checkpoint).unwrap_or_default();
        if grace < MIN_CHECKPOINT_GRACE {
            return Err(EngineError::invalid(
                &job.id,
                format!(
                    "the walltime of {max} seconds must exceed the checkpoint time of \
                     {checkpoint} seconds by at least {MIN_CHECKPOINT_GRACE} seconds"
                ),
            ));
        }
        let _ = write!(options, "-K {kill} ", kill = grace / 2);
    }

    Ok(options)
}

/// Collapses runs of spaces and trims the result.
fn collapse_spaces(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_space = true;
    for ch in s.chars() {
        if ch == ' ' {
            if !prev_space {
                out.push(' ');
            }
            prev_space = true;
        } else {
            out.push(ch);
            prev_space = false;
        }
    }

    if out.ends_with(' ') {
        out.pop();
    }
    out
}

impl JobEnabler for Instrumented<'_> {
    fn enable(&self, job: &mut Job) -> EngineResult<Enablement> {
        guarded(job, StrategyKind::Instrumented, |job| self.apply(job))
    }

    fn enable_aggregated(&self, job: &mut AggregatedJob) -> EngineResult<Enablement> {
        guarded_aggregate(job, StrategyKind::Instrumented, |job| {
            self.apply_aggregated(job)
        })
    }

    fn default_post_script(&self) -> PostScript {
        PostScript::ExitCode
    }

    fn can_set_execute_bit(&self) -> bool {
        true
    }

    fn worker_node_directory(&self, job: &Job) -> String {
        lifecycle::worker_node_directory(&self.ctx, job)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::env::HookKind;
    use crate::testing::Fixture;

    #[test]
    fn argument_order() {
        let fixture = Fixture::new();
        let ctx = fixture.context();

        let mut job = fixture.compute_job("preprocess_ID1", "hpc");
        job.stdin = "f.in".into();
        job.stdout = "f.log".into();
        job.profile.launcher_arguments = Some("-B 4096".into());
        assert_eq!(
            Instrumented::new(ctx).enable(&mut job).unwrap(),
            Enablement::Enabled
        );

        assert_eq!(job.executable, "/apps/gridwright/bin/gw-launch");
        assert_eq!(
            job.arguments,
            "-n diamond::preprocess:4.0 -N ID1 -i f.in -o f.log -R hpc -B 4096 \
             /usr/bin/preprocess -a preprocess -T 60 -i f.a -o f.b1 f.b2"
        );
        assert_eq!(
            job.attributes.get("remote_initialdir"),
            Some("/lustre/scratch/user/diamond/run0001")
        );
        assert_eq!(
            job.attributes.get("output"),
            Some(
                fixture
                    .submit_dir()
                    .join("preprocess_ID1.out")
                    .display()
                    .to_string()
                    .as_str()
            )
        );
        assert_eq!(job.enabled_by, Some(StrategyKind::Instrumented));
    }

    #[test]
    fn missing_launcher_is_unsupported() {
        let fixture = Fixture::new();
        let ctx = fixture.context();

        let mut job = fixture.compute_job("preprocess_ID1", "nowhere");
        let before = job.clone();
        assert_eq!(
            Instrumented::new(ctx).enable(&mut job).unwrap(),
            Enablement::Unsupported(Capability::Launcher)
        );
        assert_eq!(job, before);
    }

    #[test]
    fn user_arguments_keep_their_spacing() {
        let fixture = Fixture::new();
        let ctx = fixture.context();

        let mut job = fixture.compute_job("preprocess_ID1", "hpc");
        job.arguments = "-m 'a    b'".into();
        assert_eq!(Instrumented::new(ctx).enable(&mut job).unwrap(), Enablement::Enabled);
        assert_eq!(
            job.arguments,
            "-n diamond::preprocess:4.0 -N ID1 -R hpc /usr/bin/preprocess -m 'a    b'"
        );
    }

    #[test]
    fn rejected_constituent_leaves_the_cluster_unchanged() {
        let fixture = Fixture::new();
        let ctx = fixture.context();

        let constituents = vec![
            fixture.compute_job("preprocess_ID1", "condorpool"),
            fixture.compute_job("preprocess_ID2", "nowhere"),
        ];
        let mut job = AggregatedJob::new(
            Job::new("merge_ID1", JobClass::Aggregated, "", "condorpool"),
            constituents,
            crate::job::ClusterTool::Sequencer,
        );
        let before = job.clone();
        assert_eq!(
            Instrumented::new(ctx).enable_aggregated(&mut job).unwrap(),
            Enablement::Unsupported(Capability::Launcher)
        );
        assert_eq!(job, before);
        assert_eq!(job.constituents[0].enabled_by, None);
    }

    #[test]
    fn change_directory_and_stat() {
        let mut fixture = Fixture::new();
        fixture.config.launcher.stat = true;
        let ctx = fixture.context();

        let mut job = fixture.compute_job("preprocess_ID1", "hpc");
        job.profile.change_dir = Some(true);
        job.inputs[0].executable = true;
        assert_eq!(Instrumented::new(ctx).enable(&mut job).unwrap(), Enablement::Enabled);

        assert!(job.arguments.starts_with(
            "-n diamond::preprocess:4.0 -N ID1 -R hpc -w /lustre/scratch/user/diamond/run0001 \
             -X -S @preprocess_ID1.in.lof -s @preprocess_ID1.out.lof /usr/bin/preprocess"
        ));
        assert_eq!(
            job.env.get(SCRATCH_DIR_VARIABLE),
            Some("/lustre/scratch/user/diamond/run0001")
        );
        assert!(job.attributes.get("remote_initialdir").is_none());
        assert_eq!(job.generated.len(), 2);
        assert_eq!(job.generated[0].contents, "f.a=f.a\n");
        assert_eq!(job.generated[1].contents, "f.b1=f.b1\nf.b2=f.b2\n");
    }

    #[test]
    fn checkpoint_timeouts() {
        let fixture = Fixture::new();
        let ctx = fixture.context();

        let mut job = fixture.compute_job("preprocess_ID1", "hpc");
        job.profile.checkpoint_time = Some(10);
        job.profile.max_walltime = Some(20);
        assert_eq!(Instrumented::new(ctx).enable(&mut job).unwrap(), Enablement::Enabled);
        assert!(job.arguments.contains("-R hpc -k 600 -K 300 /usr/bin/preprocess"));

        let mut job = fixture.compute_job("preprocess_ID2", "hpc");
        job.profile.checkpoint_time = Some(1);
        job.profile.runtime = Some(65);
        let e = Instrumented::new(ctx).enable(&mut job).unwrap_err();
        assert!(matches!(e, EngineError::InvalidJob { .. }));
        assert_eq!(job.enabled_by, None);
    }

    #[test]
    fn large_invocations_use_a_file() {
        let mut fixture = Fixture::new();
        fixture.config.launcher.always_invoke = true;
        let ctx = fixture.context();

        let mut job = fixture.compute_job("preprocess_ID1", "hpc");
        assert_eq!(Instrumented::new(ctx).enable(&mut job).unwrap(), Enablement::Enabled);

        assert_eq!(
            job.arguments,
            "-n diamond::preprocess:4.0 -N ID1 -R hpc -w /lustre/scratch/user/diamond/run0001 \
             -I preprocess_ID1.arg"
        );
        assert!(job.attributes.get("remote_initialdir").is_none());
        let arg = &job.generated[0];
        assert!(arg.path.ends_with("preprocess_ID1.arg"));
        assert_eq!(
            arg.contents,
            "/usr/bin/preprocess\n-a\npreprocess\n-T\n60\n-i\nf.a\n-o\nf.b1\nf.b2\n"
        );
        assert!(
            job.transfer_inputs
                .contains(&arg.path.display().to_string())
        );
    }

    #[test]
    fn worker_node_execution_installs_hooks() {
        let mut fixture = Fixture::new();
        fixture.config.launcher.worker_node_execution = true;
        let ctx = fixture.context();

        let mut job = fixture.compute_job("preprocess_ID1", "condorpool");
        job.profile.strategy = Some(StrategyKind::Instrumented);
        job.profile.data_configuration = Some(crate::job::DataConfiguration::NonSharedFs);
        assert_eq!(Instrumented::new(ctx).enable(&mut job).unwrap(), Enablement::Enabled);

        let dir = "/scratch/wn/user-diamond-run0001-preprocess_ID1";
        assert!(job.arguments.contains(&format!("-R condorpool -w {dir} ")));
        assert_eq!(
            job.hooks.get(HookKind::Setup),
            Some(format!("/bin/mkdir -p {dir}").as_str())
        );
        assert_eq!(
            job.hooks.get(HookKind::Pre),
            Some("/opt/gw/bin/gw-transfer --file sls_preprocess_ID1.in")
        );
        assert_eq!(
            job.hooks.get(HookKind::Post),
            Some("/opt/gw/bin/gw-transfer --file sls_preprocess_ID1.out")
        );
        assert_eq!(job.directory, None);
    }

    #[test]
    fn spaces_are_collapsed() {
        assert_eq!(collapse_spaces("  -n a  -N b   -R c "), "-n a -N b -R c");
        assert_eq!(collapse_spaces(""), "");
    }
}
