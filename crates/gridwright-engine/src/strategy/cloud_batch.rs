//! Submits the constituents of a clustered job to a cloud batch service.
//!
//! Every constituent becomes a bootstrap script that a small launch script
//! fetches from the job's bucket and runs inside the service's container.
//! The clustered job itself runs the batch tool on the submit host, which
//! uploads the files, submits the tasks listed in `<id>.in` and waits for
//! them.

use serde::Serialize;
use tracing::debug;

use super::EnableContext;
use super::Enablement;
use super::JobEnabler;
use super::PostScript;
use super::StrategyKind;
use super::bootstrap::Bootstrap;
use super::bootstrap::common_library_path;
use super::clear_directory;
use super::direct::bind_stdio;
use super::guarded;
use super::guarded_aggregate;
use super::submit_locally;
use crate::catalog::CredentialKind;
use crate::error::Capability;
use crate::error::EngineError;
use crate::error::EngineResult;
use crate::job::AggregatedJob;
use crate::job::ClusterTool;
use crate::job::Job;
use crate::job::LOCAL_SITE;
use crate::lifecycle;

/// The transformation name of the cloud batch tool.
pub const BATCH_TRANSFORMATION: &str = "gridwright::batch";

/// The file name of the cloud batch tool.
pub const BATCH_BASENAME: &str = "gw-batch";

/// The script each task runs in the batch container.
pub const LAUNCH_SCRIPT: &str = include_str!("cloud_batch/gw-batch-launch.sh");

/// The file name of the task launch script.
pub const LAUNCH_SCRIPT_BASENAME: &str = "gw-batch-launch.sh";

/// The environment variable holding the bucket directory of a clustered
/// job.
pub const BUCKET_VARIABLE: &str = "GW_BATCH_BUCKET";

/// The environment variable listing the files a task fetches.
const TRANSFER_INPUT_FILES_VARIABLE: &str = "TRANSFER_INPUT_FILES";

/// The variables the container's fetch-and-run entry point reads.
const BATCH_FILE_TYPE_VARIABLE: &str = "BATCH_FILE_TYPE";
const BATCH_FILE_URL_VARIABLE: &str = "BATCH_FILE_S3_URL";

/// A task of the batch tool's submission file.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchTask<'a> {
    /// The task name.
    job_name: &'a str,
    /// The program the container runs.
    executable: &'a str,
    /// The program's arguments.
    arguments: &'a str,
    /// The task's environment.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    environment: Vec<BatchVariable<'a>>,
}

/// An environment variable of a batch task.
#[derive(Debug, Serialize)]
struct BatchVariable<'a> {
    /// The variable name.
    name: &'a str,
    /// The variable value.
    value: &'a str,
}

/// The batch tool's submission file.
#[derive(Debug, Serialize)]
struct BatchSubmission<'a> {
    /// The tasks to submit.
    #[serde(rename = "SubmitJob")]
    submit_job: Vec<BatchTask<'a>>,
}

/// Enables clustered jobs for a cloud batch service.
#[derive(Debug, Clone, Copy)]
pub struct CloudBatch<'a> {
    /// The enablement context.
    ctx: EnableContext<'a>,
}

impl<'a> CloudBatch<'a> {
    /// Constructs the strategy.
    pub fn new(ctx: EnableContext<'a>) -> Self {
        Self { ctx }
    }

    /// Gets the bucket directory of a clustered job.
    fn bucket(&self, job: &Job) -> EngineResult<Option<String>> {
        let bucket = self.ctx.config.cloud_batch.bucket.as_deref().or_else(|| {
            self.ctx
                .sites
                .site(job.staging_site())
                .and_then(|s| s.batch_bucket.as_deref())
        });

        let Some(bucket) = bucket else {
            return Ok(None);
        };
        if !bucket.starts_with("s3://") {
            return Err(EngineError::invalid(
                &job.id,
                format!("cloud batch bucket `{bucket}` is not an `s3://` URL"),
            ));
        }

        let bucket = bucket.trim_end_matches('/');
        let relative = self.ctx.relative_dir.trim_matches('/');
        Ok(Some(if relative.is_empty() {
            bucket.to_string()
        } else {
            format!("{bucket}/{relative}")
        }))
    }

    /// Rewrites a constituent enabled through a bootstrap script into a
    /// batch task.
    ///
    /// Credentials are uploaded once for the whole clustered job, so they
    /// are moved into `credentials` and the task refers to them in the
    /// bucket.
    fn make_task(&self, job: &mut Job, bucket: &str, credentials: &mut Vec<String>) {
        let script = std::mem::take(&mut job.executable);

        for kind in CredentialKind::ALL {
            let Some(name) = job
                .env
                .get(kind.variable())
                .and_then(|v| v.strip_prefix("./"))
                .map(str::to_string)
            else {
                continue;
            };

            job.env
                .set(kind.variable(), format!("{bucket}/{name}"));
            let shipped = job
                .transfer_inputs
                .iter()
                .find(|f| lifecycle::basename(f) == name)
                .cloned();
            if let Some(path) = shipped {
                job.transfer_inputs.shift_remove(&path);
                push_unique(credentials, path);
            }
            if kind == CredentialKind::X509
                && let Some(path) = job.attributes.remove("x509userproxy")
            {
                push_unique(credentials, path);
            }
        }

        job.transfer_inputs.insert(script.clone());
        let library = common_library_path(self.ctx.submit_dir)
            .display()
            .to_string();
        let files = job
            .transfer_inputs
            .iter()
            .filter(|f| **f != library)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",");
        if !files.is_empty() {
            job.env.set(TRANSFER_INPUT_FILES_VARIABLE, files);
        }

        job.env.set(BATCH_FILE_TYPE_VARIABLE, "script");
        job.env.set(
            BATCH_FILE_URL_VARIABLE,
            format!("{bucket}/{LAUNCH_SCRIPT_BASENAME}"),
        );
        job.arguments = lifecycle::basename(&script).to_string();
        job.executable = LAUNCH_SCRIPT_BASENAME.to_string();
    }

    /// Writes the submission file of a clustered job.
    fn submission(&self, job: &mut AggregatedJob) -> EngineResult<String> {
        let tasks = job
            .constituents
            .iter()
            .map(|c| BatchTask {
                job_name: &c.id,
                executable: &c.executable,
                arguments: &c.arguments,
                environment: c
                    .env
                    .iter()
                    .map(|(name, value)| BatchVariable { name, value })
                    .collect(),
            })
            .collect();

        let contents = serde_json::to_string_pretty(&BatchSubmission { submit_job: tasks })
            .map_err(|source| EngineError::Serialization {
                job: job.job.id.clone(),
                source,
            })?;

        let name = format!("{id}.in", id = job.job.id);
        let path = self.ctx.submit_path(&name);
        job.job.add_generated(path.clone(), contents, false);
        Ok(path.display().to_string())
    }

    /// Enables a clustered job without recording the strategy.
    pub(crate) fn apply_aggregated(&self, job: &mut AggregatedJob) -> EngineResult<Enablement> {
        if job.clustered_by != ClusterTool::CloudBatch {
            return Err(EngineError::invalid(
                &job.job.id,
                "only jobs clustered for the cloud batch tool can be enabled for it",
            ));
        }

        let Some(bucket) = self.bucket(&job.job)? else {
            return Ok(Enablement::Unsupported(Capability::BatchBucket));
        };
        let Some(tool) =
            self.ctx
                .resolve_tool(LOCAL_SITE, BATCH_TRANSFORMATION, BATCH_BASENAME, None)
        else {
            return Ok(Enablement::Unsupported(Capability::Executable(
                BATCH_TRANSFORMATION.to_string(),
            )));
        };

        let bootstrap = Bootstrap::new(self.ctx);
        let mut credentials = Vec::new();
        for constituent in &mut job.constituents {
            let enablement = guarded(constituent, StrategyKind::Bootstrap, |c| {
                let enablement = bootstrap.apply(c)?;
                if enablement.is_enabled() {
                    self.make_task(c, &bucket, &mut credentials);
                }
                Ok(enablement)
            })?;
            if !enablement.is_enabled() {
                return Ok(enablement);
            }
        }

        let list = self.submission(job)?;
        let launch = self.ctx.submit_path(LAUNCH_SCRIPT_BASENAME);
        let aggregate = &mut job.job;
        aggregate.add_generated(launch.clone(), LAUNCH_SCRIPT.to_string(), true);

        let mut files = credentials;
        files.push(common_library_path(self.ctx.submit_dir).display().to_string());
        files.push(launch.display().to_string());

        aggregate.env.set(BUCKET_VARIABLE, bucket.as_str());
        submit_locally(aggregate);
        aggregate.executable = tool;
        aggregate.arguments = format!(
            "--prefix {id} --log-file {log} --s3 {bucket} --files {files} {list}",
            id = aggregate.id,
            log = self
                .ctx
                .submit_path(format!("{id}.log", id = aggregate.id))
                .display(),
            files = files.join(","),
        );
        aggregate.stdin.clear();
        aggregate.stdout.clear();
        aggregate.stderr.clear();
        aggregate.transfer_inputs.clear();
        clear_directory(aggregate);
        bind_stdio(&self.ctx, aggregate);

        debug!(
            job = %aggregate.id,
            tasks = job.constituents.len(),
            "enabled clustered job for the cloud batch tool"
        );
        Ok(Enablement::Enabled)
    }
}

/// Appends a path unless it is already present.
fn push_unique(paths: &mut Vec<String>, path: String) {
    if !paths.contains(&path) {
        paths.push(path);
    }
}

impl JobEnabler for CloudBatch<'_> {
    fn enable(&self, job: &mut Job) -> EngineResult<Enablement> {
        guarded(job, StrategyKind::CloudBatch, |job| {
            Err(EngineError::invalid(
                &job.id,
                "the cloud batch strategy only enables clustered jobs",
            ))
        })
    }

    fn enable_aggregated(&self, job: &mut AggregatedJob) -> EngineResult<Enablement> {
        guarded_aggregate(job, StrategyKind::CloudBatch, |job| {
            self.apply_aggregated(job)
        })
    }

    fn default_post_script(&self) -> PostScript {
        PostScript::ExitCode
    }

    fn can_set_execute_bit(&self) -> bool {
        false
    }

    fn worker_node_directory(&self, job: &Job) -> String {
        Bootstrap::new(self.ctx).worker_node_directory(job)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::job::DataConfiguration;
    use crate::job::JobClass;
    use crate::testing::Fixture;

    fn cluster(fixture: &Fixture, clustered_by: ClusterTool) -> AggregatedJob {
        let constituents = ["preprocess_ID1", "preprocess_ID2"]
            .into_iter()
            .map(|id| {
                let mut job = fixture.compute_job(id, "condorpool");
                job.profile.data_configuration = Some(DataConfiguration::NonSharedFs);
                job
            })
            .collect();
        let mut aggregate = Job::new("merge_ID1", JobClass::Aggregated, "", "condorpool");
        aggregate.staging_site = Some("staging".into());
        AggregatedJob::new(aggregate, constituents, clustered_by)
    }

    #[test]
    fn rejected_constituent_leaves_the_cluster_unchanged() {
        let mut fixture = Fixture::new();
        fixture.config.cloud_batch.bucket = Some("s3://gw-bucket".into());
        let ctx = fixture.context();

        let mut job = cluster(&fixture, ClusterTool::CloudBatch);
        job.constituents[1].site = "nowhere".into();
        let before = job.clone();
        assert_eq!(
            CloudBatch::new(ctx).enable_aggregated(&mut job).unwrap(),
            Enablement::Unsupported(Capability::WorkerPackage)
        );
        assert_eq!(job, before);
        assert!(job.job.generated.is_empty());
    }

    #[test]
    fn constituents_become_batch_tasks() {
        let mut fixture = Fixture::new();
        fixture.config.cloud_batch.bucket = Some("s3://gw-bucket".into());
        let ctx = fixture.context();
        let submit = fixture.submit_dir();

        let mut job = cluster(&fixture, ClusterTool::CloudBatch);
        assert_eq!(
            CloudBatch::new(ctx).enable_aggregated(&mut job).unwrap(),
            Enablement::Enabled
        );

        let bucket = "s3://gw-bucket/user/diamond/run0001";
        let task = &job.constituents[1];
        assert_eq!(task.executable, LAUNCH_SCRIPT_BASENAME);
        assert_eq!(task.arguments, "preprocess_ID2.sh");
        assert_eq!(task.env.get(BATCH_FILE_TYPE_VARIABLE), Some("script"));
        assert_eq!(
            task.env.get(BATCH_FILE_URL_VARIABLE),
            Some(format!("{bucket}/gw-batch-launch.sh").as_str())
        );
        assert_eq!(
            task.env.get("X509_USER_PROXY"),
            Some(format!("{bucket}/x509up_u1000").as_str())
        );
        let files = task.env.get(TRANSFER_INPUT_FILES_VARIABLE).unwrap();
        assert!(!files.contains("gw-lite-common.sh"));
        assert!(files.ends_with(&submit.join("preprocess_ID2.sh").display().to_string()));
        assert!(task.attributes.get("x509userproxy").is_none());
        assert_eq!(task.enabled_by, Some(StrategyKind::Bootstrap));

        let aggregate = &job.job;
        assert_eq!(aggregate.site, LOCAL_SITE);
        assert_eq!(aggregate.executable, "/usr/local/bin/gw-batch");
        assert_eq!(aggregate.env.get(BUCKET_VARIABLE), Some(bucket));
        assert!(aggregate.arguments.starts_with(&format!(
            "--prefix merge_ID1 --log-file {log} --s3 {bucket} --files /tmp/x509up_u1000,",
            log = submit.join("merge_ID1.log").display()
        )));
        assert!(
            aggregate
                .arguments
                .ends_with(&submit.join("merge_ID1.in").display().to_string())
        );
        assert_eq!(
            aggregate.attributes.get("output"),
            Some(submit.join("merge_ID1.out").display().to_string().as_str())
        );
        assert_eq!(aggregate.enabled_by, Some(StrategyKind::CloudBatch));

        let submission = aggregate
            .generated
            .iter()
            .find(|g| g.path.ends_with("merge_ID1.in"))
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&submission.contents).unwrap();
        let tasks = value["SubmitJob"].as_array().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0]["jobName"], "preprocess_ID1");
        assert_eq!(tasks[0]["executable"], "gw-batch-launch.sh");
        assert!(
            tasks[0]["environment"]
                .as_array()
                .unwrap()
                .iter()
                .any(|v| v["name"] == "BATCH_FILE_TYPE" && v["value"] == "script")
        );
    }

    #[test]
    fn bucket_comes_from_the_staging_site() {
        let mut fixture = Fixture::new();
        fixture
            .catalog
            .sites
            .get_mut("staging")
            .unwrap()
            .batch_bucket = Some("s3://staging-bucket/".into());
        let ctx = fixture.context();

        let mut job = cluster(&fixture, ClusterTool::CloudBatch);
        assert_eq!(
            CloudBatch::new(ctx).enable_aggregated(&mut job).unwrap(),
            Enablement::Enabled
        );
        assert_eq!(
            job.job.env.get(BUCKET_VARIABLE),
            Some("s3://staging-bucket/user/diamond/run0001")
        );
    }

    #[test]
    fn missing_bucket_is_unsupported() {
        let fixture = Fixture::new();
        let ctx = fixture.context();

        let mut job = cluster(&fixture, ClusterTool::CloudBatch);
        assert_eq!(
            CloudBatch::new(ctx).enable_aggregated(&mut job).unwrap(),
            Enablement::Unsupported(Capability::BatchBucket)
        );
        assert!(job.constituents.iter().all(|c| c.enabled_by.is_none()));
    }

    #[test]
    fn only_cloud_batch_clusters_are_enabled() {
        let mut fixture = Fixture::new();
        fixture.config.cloud_batch.bucket = Some("s3://gw-bucket".into());
        let ctx = fixture.context();

        let mut job = cluster(&fixture, ClusterTool::Sequencer);
        let e = CloudBatch::new(ctx).enable_aggregated(&mut job).unwrap_err();
        assert!(matches!(e, EngineError::InvalidJob { .. }));

        let mut single = fixture.compute_job("preprocess_ID3", "condorpool");
        let e = CloudBatch::new(ctx).enable(&mut single).unwrap_err();
        assert!(matches!(e, EngineError::InvalidJob { .. }));
    }

    #[test]
    #[cfg(unix)]
    fn launch_script_shellchecks() {
        let Ok(shellcheck) = which::which("shellcheck") else {
            return;
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LAUNCH_SCRIPT_BASENAME);
        std::fs::write(&path, LAUNCH_SCRIPT).unwrap();
        let status = std::process::Command::new(shellcheck)
            .arg("--shell=bash")
            .arg(&path)
            .status()
            .unwrap();
        assert!(status.success());
    }
}
