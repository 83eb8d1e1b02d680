//! Launches jobs without a wrapper.

use tracing::debug;

use super::EnableContext;
use super::Enablement;
use super::JobEnabler;
use super::PostScript;
use super::StrategyKind;
use super::guarded;
use super::guarded_aggregate;
use super::is_gateway_job;
use super::set_directory;
use crate::error::EngineResult;
use crate::job::AggregatedJob;
use crate::job::Job;
use crate::job::JobClass;
use crate::sequencer;

/// Runs the user's executable as is, binding its standard streams to files
/// in the submit directory.
#[derive(Debug, Clone, Copy)]
pub struct Direct<'a> {
    /// The enablement context.
    ctx: EnableContext<'a>,
}

impl<'a> Direct<'a> {
    /// Constructs the strategy.
    pub fn new(ctx: EnableContext<'a>) -> Self {
        Self { ctx }
    }

    /// Binds a job's standard streams and directory without recording the
    /// strategy.
    pub(crate) fn apply(&self, job: &mut Job) -> EngineResult<Enablement> {
        bind_stdio(&self.ctx, job);

        if job.class != JobClass::Cleanup
            && let Some(dir) = self.ctx.execution_directory(job)
        {
            set_directory(job, &dir);
        }

        debug!(job = %job.id, "enabled job to run directly");
        Ok(Enablement::Enabled)
    }

    /// Enables a clustered job's constituents and renders the cluster
    /// without recording the strategy.
    pub(crate) fn apply_aggregated(&self, job: &mut AggregatedJob) -> EngineResult<Enablement> {
        let tool = match sequencer::cluster_tool(&self.ctx, &job.job) {
            Ok(tool) => tool,
            Err(capability) => return Ok(Enablement::Unsupported(capability)),
        };

        for constituent in &mut job.constituents {
            let enablement = guarded(constituent, StrategyKind::Direct, |c| self.apply(c))?;
            if !enablement.is_enabled() {
                return Ok(enablement);
            }
        }

        sequencer::make_concrete(&self.ctx, job, &tool, None)?;
        self.apply(&mut job.job)
    }
}

/// Binds the standard streams of a job to scheduler attributes.
///
/// Planner tools read a standard input file shipped from the submit
/// directory; output and error default to `<id>.out` and `<id>.err` there.
pub(crate) fn bind_stdio(ctx: &EnableContext<'_>, job: &mut Job) {
    if !job.stdin.is_empty() {
        let input = if job.class.ships_stdin() {
            ctx.submit_path(&job.stdin).display().to_string()
        } else {
            job.stdin.clone()
        };
        job.attributes.set("input", input);
    }

    let gateway = is_gateway_job(job);
    let output = if job.stdout.is_empty() {
        ctx.submit_path(format!("{id}.out", id = job.id))
            .display()
            .to_string()
    } else {
        job.stdout.clone()
    };
    job.attributes.set("output", output);
    if gateway {
        job.attributes.set("transfer_output", "true");
    }

    let error = if job.stderr.is_empty() {
        ctx.submit_path(format!("{id}.err", id = job.id))
            .display()
            .to_string()
    } else {
        job.stderr.clone()
    };
    job.attributes.set("error", error);
    if gateway {
        job.attributes.set("transfer_error", "true");
    }
}

impl JobEnabler for Direct<'_> {
    fn enable(&self, job: &mut Job) -> EngineResult<Enablement> {
        guarded(job, StrategyKind::Direct, |job| self.apply(job))
    }

    fn enable_aggregated(&self, job: &mut AggregatedJob) -> EngineResult<Enablement> {
        guarded_aggregate(job, StrategyKind::Direct, |job| self.apply_aggregated(job))
    }

    fn default_post_script(&self) -> PostScript {
        PostScript::None
    }

    fn can_set_execute_bit(&self) -> bool {
        false
    }

    fn worker_node_directory(&self, job: &Job) -> String {
        self.ctx
            .execution_directory(job)
            .unwrap_or_else(|| crate::lifecycle::worker_node_directory(&self.ctx, job))
    }
}
