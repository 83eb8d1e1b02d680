//! Dispatches jobs from the submit host through the relay tool.
//!
//! The relay tool runs in the submit host's local universe and submits the
//! launcher invocation to the remote site's batch system over SSH. Most of
//! what it needs travels in `RELAY_*` environment variables.

use tracing::debug;

use super::EnableContext;
use super::Enablement;
use super::JobEnabler;
use super::PostScript;
use super::RELAY_BASENAME;
use super::RELAY_TRANSFORMATION;
use super::StrategyKind;
use super::clear_directory;
use super::guarded;
use super::guarded_aggregate;
use super::instrumented::Instrumented;
use super::submit_locally;
use crate::env::EnvironmentProfile;
use crate::env::escape_value;
use crate::error::Capability;
use crate::error::EngineError;
use crate::error::EngineResult;
use crate::job::AggregatedJob;
use crate::job::DataConfiguration;
use crate::job::Job;
use crate::job::LOCAL_SITE;
use crate::lifecycle;

/// The scheduler attribute recording the site a relayed job really runs on.
pub const REMOTE_SITE_KEY: &str = "+remote_site";

/// Maps gateway keys to the relay variables they are passed in.
const GATEWAY_VARIABLES: [(&str, &str); 4] = [
    ("hostcount", "RELAY_NODES"),
    ("xcount", "RELAY_PPN"),
    ("maxwalltime", "RELAY_WALLTIME"),
    ("maxmemory", "RELAY_PER_PROCESS_MEMORY"),
];

/// Wraps the launcher invocation of a job with the relay tool.
#[derive(Debug, Clone, Copy)]
pub struct Relay<'a> {
    /// The enablement context.
    ctx: EnableContext<'a>,
}

impl<'a> Relay<'a> {
    /// Constructs the strategy.
    pub fn new(ctx: EnableContext<'a>) -> Self {
        Self { ctx }
    }

    /// Resolves the relay tool on the submit host.
    fn tool(&self) -> Option<String> {
        self.ctx
            .resolve_tool(LOCAL_SITE, RELAY_TRANSFORMATION, RELAY_BASENAME, None)
    }

    /// Fails for jobs that stage their own data.
    fn check_data_configuration(&self, job: &Job) -> EngineResult<()> {
        if self.ctx.data_configuration(job) == DataConfiguration::NonSharedFs {
            return Err(EngineError::invalid(
                &job.id,
                "the relay tool only supports shared filesystem jobs",
            ));
        }
        Ok(())
    }

    /// Builds the environment the relay tool reads.
    fn relay_environment(&self, job: &Job) -> EngineResult<EnvironmentProfile> {
        let relay = job.profile.relay.clone().unwrap_or_default();

        let mut remote = String::new();
        for (i, (key, value)) in job.env.iter().enumerate() {
            if i > 0 {
                remote.push(',');
            }
            remote.push_str(key);
            remote.push('=');
            escape_value(value, &mut remote);
        }

        let identity = match relay.ssh_identity_path {
            Some(path) => path,
            None => self
                .ctx
                .credentials
                .credential_for(job, &format!("scp://{site}", site = job.site))
                .map(|c| c.path)
                .ok_or_else(|| {
                    EngineError::invalid(
                        &job.id,
                        format!(
                            "the relay tool needs an SSH identity for site `{site}`",
                            site = job.site
                        ),
                    )
                })?,
        };

        let mut env = EnvironmentProfile::new();
        env.set("RELAY_REMOTE_ENVIRONMENT", remote);
        env.set(
            "RELAY_SITE_DESIGNATOR",
            relay.site_designator.unwrap_or_else(|| job.site.clone()),
        );
        env.set("RELAY_SSH_IDENTITY_PATH", identity);
        if let Some(path) = relay
            .job_path
            .or_else(|| self.ctx.execution_directory(job))
        {
            env.set("RELAY_JOB_PATH", path);
        }
        env.set("RELAY_JOB_STDOUT", format!("{id}.stdout", id = job.id));
        env.set("RELAY_JOB_STDERR", format!("{id}.stderr", id = job.id));

        for (key, variable) in GATEWAY_VARIABLES {
            if let Some(value) = job.profile.gateway.get(key) {
                env.set(variable, value.as_str());
            }
        }
        Ok(env)
    }

    /// Moves an enabled job to the submit host under the relay tool.
    fn dispatch(&self, job: &mut Job, tool: String) -> EngineResult<()> {
        let mut env = self
            .ctx
            .sites
            .site(LOCAL_SITE)
            .map(|s| s.environment.clone())
            .unwrap_or_default();
        for (key, value) in self.relay_environment(job)?.iter() {
            env.set(key, value);
        }

        job.arguments = format!(
            "{launcher} {args}",
            launcher = job.executable,
            args = job.arguments
        )
        .trim_end()
        .to_string();
        job.executable = tool;

        job.attributes
            .set(REMOTE_SITE_KEY, format!("\"{site}\"", site = job.site));
        submit_locally(job);
        job.attributes.remove("transfer_output");
        job.attributes.remove("transfer_error");
        clear_directory(job);
        job.env = env;

        debug!(job = %job.id, tool = %job.executable, "dispatching job through the relay tool");
        Ok(())
    }

    /// Enables a job without recording the strategy.
    pub(crate) fn apply(&self, job: &mut Job) -> EngineResult<Enablement> {
        self.check_data_configuration(job)?;
        let launcher = Instrumented::new(self.ctx);
        if job.is_local() {
            return launcher.apply(job);
        }

        let Some(tool) = self.tool() else {
            return Ok(Enablement::Unsupported(Capability::Executable(
                RELAY_TRANSFORMATION.to_string(),
            )));
        };

        job.profile.change_dir = Some(true);
        job.profile.create_dir = Some(false);
        let enablement = launcher.apply(job)?;
        if !enablement.is_enabled() {
            return Ok(enablement);
        }

        self.dispatch(job, tool)?;
        Ok(Enablement::Enabled)
    }

    /// Enables a clustered job without recording the strategy.
    pub(crate) fn apply_aggregated(&self, job: &mut AggregatedJob) -> EngineResult<Enablement> {
        self.check_data_configuration(&job.job)?;
        let launcher = Instrumented::new(self.ctx);
        for constituent in &mut job.constituents {
            constituent.profile.change_dir = Some(true);
            constituent.profile.create_dir = Some(false);
        }

        if job.job.is_local() {
            return launcher.apply_aggregated(job);
        }

        let Some(tool) = self.tool() else {
            return Ok(Enablement::Unsupported(Capability::Executable(
                RELAY_TRANSFORMATION.to_string(),
            )));
        };

        let enablement = launcher.apply_aggregated(job)?;
        if !enablement.is_enabled() {
            return Ok(enablement);
        }

        self.dispatch(&mut job.job, tool)?;
        Ok(Enablement::Enabled)
    }
}

impl JobEnabler for Relay<'_> {
    fn enable(&self, job: &mut Job) -> EngineResult<Enablement> {
        guarded(job, StrategyKind::Relay, |job| self.apply(job))
    }

    fn enable_aggregated(&self, job: &mut AggregatedJob) -> EngineResult<Enablement> {
        guarded_aggregate(job, StrategyKind::Relay, |job| self.apply_aggregated(job))
    }

    fn default_post_script(&self) -> PostScript {
        PostScript::ExitCode
    }

    fn can_set_execute_bit(&self) -> bool {
        true
    }

    fn worker_node_directory(&self, job: &Job) -> String {
        self.ctx
            .execution_directory(job)
            .unwrap_or_else(|| lifecycle::worker_node_directory(&self.ctx, job))
    }
}
