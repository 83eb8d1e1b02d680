//! Renders clustered jobs for the sequencer tool.
//!
//! The sequencer reads a task list on its standard input and runs the
//! tasks in order. Each constituent becomes a `#@` marker line naming the
//! task followed by its command line.

use std::fmt::Write as _;

use tracing::debug;

use crate::error::Capability;
use crate::error::EngineResult;
use crate::job::AggregatedJob;
use crate::job::Job;
use crate::lifecycle::SequencedTasks;
use crate::strategy::EnableContext;
use crate::strategy::SEQUENCER_BASENAME;
use crate::strategy::SEQUENCER_TRANSFORMATION;

/// The prefix of the marker line preceding each task.
pub const TASK_MARKER: &str = "#@";

/// The sequencer option that stops at the first failing task.
pub const ABORT_OPTION: &str = "-f";

/// Resolves the sequencer tool on the site of a clustered job.
pub fn cluster_tool(ctx: &EnableContext<'_>, job: &Job) -> Result<String, Capability> {
    ctx.resolve_tool(&job.site, SEQUENCER_TRANSFORMATION, SEQUENCER_BASENAME, None)
        .ok_or_else(|| Capability::Executable(SEQUENCER_TRANSFORMATION.to_string()))
}

/// Renders the task list of a clustered job.
///
/// Setup tasks come first and trailer tasks last; constituents keep their
/// order and are numbered from one.
pub fn render(job: &AggregatedJob, tasks: Option<&SequencedTasks>) -> String {
    let mut out = String::new();

    // Writing to a string cannot fail.
    if let Some(tasks) = tasks {
        for task in &tasks.setup {
            let _ = writeln!(out, "{task}");
        }
    }

    for (i, constituent) in job.constituents.iter().enumerate() {
        let _ = writeln!(
            out,
            "{TASK_MARKER} {n} {tx} {id}",
            n = i + 1,
            tx = constituent.transformation(),
            id = constituent.logical_id
        );
        let command = format!(
            "{exe} {args}",
            exe = constituent.executable,
            args = constituent.arguments
        );
        let _ = writeln!(out, "{command}", command = command.trim_end());
    }

    if let Some(tasks) = tasks {
        for task in &tasks.trailer {
            let _ = writeln!(out, "{task}");
        }
    }

    out
}

/// Turns a clustered job into an invocation of the sequencer.
///
/// The task list is written to `<id>.in` and becomes the job's standard
/// input. When worker-node tasks are given the sequencer also creates and
/// removes the worker-node directory.
pub fn make_concrete(
    ctx: &EnableContext<'_>,
    job: &mut AggregatedJob,
    tool: &str,
    tasks: Option<SequencedTasks>,
) -> EngineResult<()> {
    let list = render(job, tasks.as_ref());
    let name = format!("{id}.in", id = job.job.id);
    let path = ctx.submit_path(&name);

    let aggregate = &mut job.job;
    aggregate.add_generated(path, list, false);
    aggregate.stdin = name;
    aggregate.stdout.clear();
    aggregate.stderr.clear();
    aggregate.executable = tool.to_string();
    aggregate.arguments = if ctx.config.sequencer.abort_on_first_failure {
        ABORT_OPTION.to_string()
    } else {
        String::new()
    };

    if tasks.is_none() {
        aggregate.env.remove(crate::lifecycle::CLUSTER_SETUP_VARIABLE);
        aggregate.env.remove(crate::lifecycle::CLUSTER_CLEANUP_VARIABLE);
    }

    debug!(
        job = %aggregate.id,
        constituents = job.constituents.len(),
        "rendered clustered job for the sequencer"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::job::ClusterTool;
    use crate::job::JobClass;
    use crate::strategy::Enablement;
    use crate::strategy::Instrumented;
    use crate::strategy::JobEnabler;
    use crate::strategy::StrategyKind;
    use crate::testing::Fixture;

    fn cluster(fixture: &Fixture) -> AggregatedJob {
        let constituents = ["ID1", "ID2", "ID3"]
            .iter()
            .map(|id| fixture.compute_job(&format!("preprocess_{id}"), "condorpool"))
            .collect();
        AggregatedJob::new(
            Job::new("merge_preprocess_ID1", JobClass::Aggregated, "", "condorpool"),
            constituents,
            ClusterTool::Sequencer,
        )
    }

    #[test]
    fn constituents_keep_order_and_suppress_headers() {
        let fixture = Fixture::new();
        let ctx = fixture.context();

        let mut job = cluster(&fixture);
        assert_eq!(
            Instrumented::new(ctx).enable_aggregated(&mut job).unwrap(),
            Enablement::Enabled
        );

        let list = &job.job.generated[0].contents;
        let lines: Vec<_> = list.lines().collect();
        assert_eq!(lines.len(), 6);
        for (i, id) in ["ID1", "ID2", "ID3"].iter().enumerate() {
            assert_eq!(
                lines[i * 2],
                format!("#@ {n} diamond::preprocess:4.0 {id}", n = i + 1)
            );
            assert!(lines[i * 2 + 1].starts_with("/opt/gw/bin/gw-launch -n "));
            assert_eq!(lines[i * 2 + 1].contains(" -H "), i > 0);
        }

        assert_eq!(job.job.executable, "/opt/gw/bin/gw-cluster");
        assert_eq!(job.job.arguments, "-f");
        assert_eq!(job.job.stdin, "merge_preprocess_ID1.in");
        assert_eq!(
            job.job.attributes.get("input"),
            Some(
                fixture
                    .submit_dir()
                    .join("merge_preprocess_ID1.in")
                    .display()
                    .to_string()
                    .as_str()
            )
        );
        assert_eq!(job.job.enabled_by, Some(StrategyKind::Instrumented));
        assert!(
            job.constituents
                .iter()
                .all(|c| c.enabled_by == Some(StrategyKind::Instrumented))
        );
    }

    #[test]
    fn abort_option_follows_configuration() {
        let mut fixture = Fixture::new();
        fixture.config.sequencer.abort_on_first_failure = false;
        let ctx = fixture.context();

        let mut job = cluster(&fixture);
        make_concrete(&ctx, &mut job, "/opt/gw/bin/gw-cluster", None).unwrap();
        assert_eq!(job.job.arguments, "");
    }

    #[test]
    fn setup_and_trailer_tasks_surround_constituents() {
        let fixture = Fixture::new();
        let job = cluster(&fixture);
        let tasks = SequencedTasks {
            setup: vec!["/bin/cp sls_x.in /wn".into()],
            trailer: vec!["gw-transfer --file /wn/sls_x.out".into()],
        };

        let list = render(&job, Some(&tasks));
        let lines: Vec<_> = list.lines().collect();
        assert_eq!(lines.first(), Some(&"/bin/cp sls_x.in /wn"));
        assert_eq!(lines[1], "#@ 1 diamond::preprocess:4.0 ID1");
        assert_eq!(lines.last(), Some(&"gw-transfer --file /wn/sls_x.out"));
    }

    #[test]
    fn missing_tool_is_a_capability() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        let job = Job::new("merge", JobClass::Aggregated, "", "nowhere");
        assert_eq!(
            cluster_tool(&ctx, &job),
            Err(Capability::Executable(SEQUENCER_TRANSFORMATION.into()))
        );
    }
}
