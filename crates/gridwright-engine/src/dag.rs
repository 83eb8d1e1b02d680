//! Rendering of the meta-scheduler DAG file.

use std::fmt::Write as _;

use crate::job::Job;
use crate::workflow::Dependency;

/// The width of the separator lines framing the DAG file.
const SEPARATOR_WIDTH: usize = 70;

/// The directives of a single DAG node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagNode {
    /// The job identifier; the submit file is `<id>.sub`.
    pub id: String,
    /// The pre script command, if any.
    pub pre: Option<String>,
    /// The post script name or path, if any.
    pub post: Option<String>,
    /// Extra arguments for the post script.
    pub post_arguments: Option<String>,
    /// The message marking success in the job's standard error.
    pub success_message: Option<String>,
    /// The number of retries.
    pub retry: u32,
    /// The throttling category.
    pub category: Option<String>,
    /// The node priority.
    pub priority: Option<i64>,
}

impl DagNode {
    /// Creates the node of an enabled job.
    ///
    /// `post` is the post script selected for the job and `retry` the
    /// default retry count for jobs that do not set one.
    pub fn new(job: &Job, post: Option<String>, retry: u32) -> Self {
        Self {
            id: job.id.clone(),
            pre: job.dagman.pre.clone(),
            post,
            post_arguments: job.dagman.post_arguments.clone(),
            success_message: job.profile.success_message.clone(),
            retry: job.dagman.retry.unwrap_or(retry),
            category: job.dagman.category.clone(),
            priority: job.dagman.priority,
        }
    }
}

/// Writes a framed comment block.
fn frame(out: &mut String, lines: &[&str]) {
    let separator = "#".repeat(SEPARATOR_WIDTH);
    // Writing to a string cannot fail.
    let _ = writeln!(out, "{separator}");
    for line in lines {
        let _ = writeln!(out, "# {line}");
    }
    let _ = writeln!(out, "{separator}");
}

/// Renders a DAG file.
///
/// Post scripts named without a directory are resolved against
/// `post_script_dir` when one is given.
pub fn render(
    name: &str,
    nodes: &[DagNode],
    dependencies: &[Dependency],
    post_script_dir: Option<&str>,
) -> String {
    let mut out = String::new();
    frame(
        &mut out,
        &["GRIDWRIGHT GENERATED DAG FILE", &format!("DAG {name}")],
    );

    // Writing to a string cannot fail.
    for node in nodes {
        let id = &node.id;
        let _ = writeln!(out, "JOB {id} {id}.sub");

        if let Some(pre) = &node.pre {
            let _ = writeln!(out, "SCRIPT PRE {id} {pre}");
        }

        if let Some(post) = &node.post {
            let path = match post_script_dir {
                Some(dir) if !post.contains('/') => {
                    format!("{dir}/{post}", dir = dir.trim_end_matches('/'))
                }
                _ => post.clone(),
            };
            let _ = write!(out, "SCRIPT POST {id} {path} -r $RETURN");
            if let Some(message) = &node.success_message {
                let _ = write!(out, " -s \"{message}\"");
            }
            if let Some(args) = &node.post_arguments {
                let _ = write!(out, " {args}");
            }
            let _ = writeln!(out, " {id}.out");
        }

        let _ = writeln!(out, "RETRY {id} {retry}", retry = node.retry);

        if let Some(category) = &node.category {
            let _ = writeln!(out, "CATEGORY {id} {category}");
        }

        if let Some(priority) = node.priority {
            let _ = writeln!(out, "PRIORITY {id} {priority}");
        }
    }

    for dep in dependencies {
        let _ = writeln!(out, "PARENT {} CHILD {}", dep.parent, dep.child);
    }

    frame(&mut out, &["End of DAG"]);
    out
}
