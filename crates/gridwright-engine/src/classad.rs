//! Workflow classads attached to every submit file.
//!
//! Classads are extra attributes the scheduler carries along with a job so
//! that monitoring tools can relate a running job back to its workflow.
//! String values are double quoted; integer values are written bare.

use std::fmt::Write as _;

use crate::job::Job;
use crate::workflow::WorkflowMetadata;

/// The prefix of every classad key.
pub const CLASSAD_PREFIX: &str = "+gw_";

/// The value of a classad.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassAdValue {
    /// A string, rendered in double quotes.
    String(String),
    /// An integer, rendered bare.
    Integer(i64),
}

impl ClassAdValue {
    /// Renders the value.
    fn render(&self, out: &mut String) {
        // Writing to a string cannot fail.
        match self {
            Self::String(s) => {
                out.push('"');
                for ch in s.chars() {
                    if ch == '"' {
                        out.push('\\');
                    }
                    out.push(ch);
                }
                out.push('"');
            }
            Self::Integer(i) => {
                let _ = write!(out, "{i}");
            }
        }
    }
}

impl From<&str> for ClassAdValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ClassAdValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for ClassAdValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

/// Computes the classads of a job.
///
/// `cluster_size` is the number of constituents when the job is a clustered
/// job.
pub fn classads(
    metadata: &WorkflowMetadata,
    job: &Job,
    cluster_size: Option<usize>,
) -> Vec<(&'static str, ClassAdValue)> {
    let mut ads: Vec<(&'static str, ClassAdValue)> = vec![
        ("wf_uuid", metadata.uuid.to_string().into()),
        ("root_wf_uuid", metadata.root_uuid.to_string().into()),
        ("wf_name", metadata.name.as_str().into()),
        ("version", env!("CARGO_PKG_VERSION").into()),
        ("job_class", i64::from(job.class.code()).into()),
        ("wf_dag_job_id", job.id.as_str().into()),
        ("wf_dax_job_id", job.logical_id.as_str().into()),
        (
            "job_runtime",
            i64::try_from(job.profile.runtime.unwrap_or(0))
                .unwrap_or(i64::MAX)
                .into(),
        ),
        ("cores", i64::from(job.profile.cores.unwrap_or(1)).into()),
    ];

    if let Some(size) = cluster_size {
        ads.push((
            "cluster_size",
            i64::try_from(size).unwrap_or(i64::MAX).into(),
        ));
    }

    ads.push(("site", job.site.as_str().into()));
    ads.push(("wf_xformation", job.transformation().into()));
    ads
}

/// Renders the classads of a job as submit file lines.
pub fn render(
    metadata: &WorkflowMetadata,
    job: &Job,
    cluster_size: Option<usize>,
    out: &mut String,
) {
    for (key, value) in classads(metadata, job, cluster_size) {
        out.push_str(CLASSAD_PREFIX);
        out.push_str(key);
        out.push_str(" = ");
        value.render(out);
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    use super::*;
    use crate::job::JobClass;

    fn metadata() -> WorkflowMetadata {
        WorkflowMetadata {
            name: "diamond".into(),
            uuid: Uuid::from_u128(1),
            root_uuid: Uuid::from_u128(2),
        }
    }

    #[test]
    fn compute_job_classads() {
        let mut job = Job::new("preprocess_ID1", JobClass::Compute, "/usr/bin/preprocess", "hpc");
        job.logical_id = "ID1".into();
        job.transformation = "diamond::preprocess:4.0".into();
        job.profile.runtime = Some(60);

        let mut out = String::new();
        render(&metadata(), &job, None, &mut out);
        assert_eq!(
            out,
            format!(
                "+gw_wf_uuid = \"00000000-0000-0000-0000-000000000001\"\n+gw_root_wf_uuid = \
                 \"00000000-0000-0000-0000-000000000002\"\n+gw_wf_name = \"diamond\"\n+gw_version \
                 = \"{version}\"\n+gw_job_class = 1\n+gw_wf_dag_job_id = \
                 \"preprocess_ID1\"\n+gw_wf_dax_job_id = \"ID1\"\n+gw_job_runtime = 60\n+gw_cores \
                 = 1\n+gw_site = \"hpc\"\n+gw_wf_xformation = \"diamond::preprocess:4.0\"\n",
                version = env!("CARGO_PKG_VERSION")
            )
        );
    }

    #[test]
    fn cluster_size_only_for_clusters() {
        let job = Job::new("merge_ID9", JobClass::Aggregated, "/bin/true", "local");
        let ads = classads(&metadata(), &job, Some(3));
        assert!(ads.contains(&("cluster_size", ClassAdValue::Integer(3))));
        assert!(ads.contains(&("wf_xformation", "/bin/true".into())));

        let ads = classads(&metadata(), &job, None);
        assert!(!ads.iter().any(|(k, _)| *k == "cluster_size"));
    }

    #[test]
    fn quotes_are_escaped() {
        let mut out = String::new();
        ClassAdValue::from(r#"say "hi""#).render(&mut out);
        assert_eq!(out, r#""say \"hi\"""#);
    }
}
