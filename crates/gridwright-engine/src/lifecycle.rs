//! Worker-node lifecycle: directories, second-level staging and hooks.
//!
//! Jobs that run on ephemeral worker-node storage create a directory, fetch
//! their inputs into it, run, push their outputs back and remove the
//! directory. This module computes that plan and renders it either as
//! launcher hooks, as sequencer tasks, or as transfer lists embedded in a
//! bootstrap script.

use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::catalog::CredentialKind;
use crate::env::HookKind;
use crate::error::Capability;
use crate::error::EngineError;
use crate::error::EngineResult;
use crate::job::FileUrl;
use crate::job::Job;
use crate::job::JobFile;
use crate::quote::quote;
use crate::strategy::EnableContext;
use crate::strategy::TRANSFER_BASENAME;
use crate::strategy::TRANSFER_TRANSFORMATION;

/// The environment variable holding the sequencer setup command.
pub const CLUSTER_SETUP_VARIABLE: &str = "GW_CLUSTER_SETUP";

/// The environment variable holding the sequencer cleanup command.
pub const CLUSTER_CLEANUP_VARIABLE: &str = "GW_CLUSTER_CLEANUP";

/// The kind of file a transfer moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    /// A data file.
    File,
    /// An executable that needs its execute bit set.
    Executable,
    /// A container image.
    Container,
}

/// A single second-level staging transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    /// The logical file name.
    pub lfn: String,
    /// The kind of file.
    pub kind: TransferKind,
    /// Whether the file is a checkpoint file.
    pub checkpoint: bool,
    /// Candidate sources, in order of preference.
    pub sources: Vec<FileUrl>,
    /// The destination.
    pub destination: FileUrl,
}

impl FileTransfer {
    /// Gets the URLs of the transfer that are not on the worker node.
    pub fn remote_urls(&self) -> impl Iterator<Item = &str> {
        self.sources
            .iter()
            .chain(std::iter::once(&self.destination))
            .map(|u| u.url.as_str())
            .filter(|u| !u.starts_with("file://"))
    }

    /// Determines if any source of the transfer is off the worker node.
    pub fn has_remote_source(&self) -> bool {
        self.sources.iter().any(|u| !u.url.starts_with("file://"))
    }
}

/// The direction of a transfer list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Linkage {
    /// Files fetched before the job runs.
    Input,
    /// Files pushed after the job runs.
    Output,
}

/// The plan for running a job in a worker-node directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingPlan {
    /// The worker-node directory.
    pub directory: String,
    /// Files to fetch before the job runs.
    pub stage_in: Vec<FileTransfer>,
    /// Files to push after the job runs.
    pub stage_out: Vec<FileTransfer>,
}

impl StagingPlan {
    /// Determines if any input needs fetching.
    ///
    /// Inputs whose sources are all on the worker node are already in place.
    pub fn needs_stage_in(&self) -> bool {
        self.stage_in.iter().any(FileTransfer::has_remote_source)
    }

    /// Determines if any output needs pushing.
    pub fn needs_stage_out(&self) -> bool {
        !self.stage_out.is_empty()
    }
}

/// Computes the worker-node directory of a job.
///
/// The `wn_dir` profile wins; otherwise the directory is
/// `<site temp dir>/<relative dir with / replaced by ->-<job id>`.
pub fn worker_node_directory(ctx: &EnableContext<'_>, job: &Job) -> String {
    if let Some(dir) = &job.profile.wn_dir {
        return dir.clone();
    }

    let temp = ctx
        .sites
        .temp_directory(&job.site)
        .or_else(|| ctx.sites.site(&job.site)?.environment.get("TMPDIR"))
        .unwrap_or("/tmp");
    let temp = temp.trim_end_matches('/');
    let relative = ctx.relative_dir.trim_matches('/').replace('/', "-");
    if relative.is_empty() {
        format!("{temp}/{id}", id = job.id)
    } else {
        format!("{temp}/{relative}-{id}", id = job.id)
    }
}

/// Gets the URL of the workflow directory on the job's staging site.
pub fn staging_url(ctx: &EnableContext<'_>, job: &Job) -> Option<String> {
    let site = ctx.sites.site(job.staging_site())?;
    let server = site.file_server.as_deref()?.trim_end_matches('/');
    let scratch = site.shared_scratch.as_deref().unwrap_or("").trim_matches('/');
    let relative = ctx.relative_dir.trim_matches('/');

    let mut url = server.to_string();
    for part in [scratch, relative] {
        if !part.is_empty() {
            url.push('/');
            url.push_str(part);
        }
    }
    Some(url)
}

/// Gets the transfer kind of a job file.
fn transfer_kind(file: &JobFile) -> TransferKind {
    if file.container_image {
        TransferKind::Container
    } else if file.executable {
        TransferKind::Executable
    } else {
        TransferKind::File
    }
}

/// Builds the staging plan of a job for a worker-node directory.
pub fn plan(ctx: &EnableContext<'_>, job: &Job, directory: &str) -> EngineResult<StagingPlan> {
    let staging = staging_url(ctx, job);
    let missing_server = || EngineError::Capability {
        job: job.id.clone(),
        site: job.staging_site().to_string(),
        capability: Capability::FileServer,
    };
    let local = |lfn: &str| FileUrl::new(job.site.clone(), format!("file://{directory}/{lfn}"));

    let mut stage_in = Vec::with_capacity(job.inputs.len());
    for file in &job.inputs {
        let sources = if file.sources.is_empty() {
            let base = staging.as_deref().ok_or_else(missing_server)?;
            vec![FileUrl::new(
                job.staging_site(),
                format!("{base}/{lfn}", lfn = file.lfn),
            )]
        } else {
            file.sources.clone()
        };

        stage_in.push(FileTransfer {
            lfn: file.lfn.clone(),
            kind: transfer_kind(file),
            checkpoint: file.checkpoint,
            sources,
            destination: local(&file.lfn),
        });
    }

    let mut stage_out = Vec::with_capacity(job.outputs.len());
    for file in &job.outputs {
        let destination = match &file.destination {
            Some(d) => d.clone(),
            None => {
                let base = staging.as_deref().ok_or_else(missing_server)?;
                FileUrl::new(job.staging_site(), format!("{base}/{lfn}", lfn = file.lfn))
            }
        };

        stage_out.push(FileTransfer {
            lfn: file.lfn.clone(),
            kind: transfer_kind(file),
            checkpoint: file.checkpoint,
            sources: vec![local(&file.lfn)],
            destination,
        });
    }

    debug!(
        job = %job.id,
        directory,
        inputs = stage_in.len(),
        outputs = stage_out.len(),
        "computed worker-node staging plan"
    );

    Ok(StagingPlan {
        directory: directory.to_string(),
        stage_in,
        stage_out,
    })
}

/// A source URL in a serialized transfer list.
#[derive(Serialize)]
struct SourceUrl<'a> {
    /// The site of the URL.
    site_label: &'a str,
    /// The URL.
    url: &'a str,
    /// The preference of the source, lower is better.
    priority: usize,
    /// Whether the file is a checkpoint file.
    checkpoint: bool,
}

/// A destination URL in a serialized transfer list.
#[derive(Serialize)]
struct DestinationUrl<'a> {
    /// The site of the URL.
    site_label: &'a str,
    /// The URL.
    url: &'a str,
    /// The kind of file.
    #[serde(rename = "type")]
    kind: TransferKind,
}

/// An entry in a serialized transfer list.
#[derive(Serialize)]
struct TransferEntry<'a> {
    /// Always `transfer`.
    #[serde(rename = "type")]
    ty: &'static str,
    /// Whether the files are inputs or outputs.
    linkage: Linkage,
    /// The logical file name.
    lfn: &'a str,
    /// The position of the entry in the list, starting at one.
    id: usize,
    /// The sources.
    src_urls: Vec<SourceUrl<'a>>,
    /// The destinations.
    dest_urls: Vec<DestinationUrl<'a>>,
}

/// Serializes transfers into the data mover's JSON transfer list.
pub fn transfer_list(
    job: &Job,
    linkage: Linkage,
    transfers: &[FileTransfer],
) -> EngineResult<String> {
    let entries: Vec<_> = transfers
        .iter()
        .enumerate()
        .map(|(i, t)| TransferEntry {
            ty: "transfer",
            linkage,
            lfn: &t.lfn,
            id: i + 1,
            src_urls: t
                .sources
                .iter()
                .enumerate()
                .map(|(priority, s)| SourceUrl {
                    site_label: &s.site,
                    url: &s.url,
                    priority,
                    checkpoint: t.checkpoint,
                })
                .collect(),
            dest_urls: vec![DestinationUrl {
                site_label: &t.destination.site,
                url: &t.destination.url,
                kind: t.kind,
            }],
        })
        .collect();

    serde_json::to_string_pretty(&entries).map_err(|source| EngineError::Serialization {
        job: job.id.clone(),
        source,
    })
}

/// Resolves the data mover on the job's site.
pub fn transfer_tool(ctx: &EnableContext<'_>, job: &Job) -> EngineResult<String> {
    ctx.resolve_tool(&job.site, TRANSFER_TRANSFORMATION, TRANSFER_BASENAME, None)
        .ok_or_else(|| EngineError::Capability {
            job: job.id.clone(),
            site: job.site.clone(),
            capability: Capability::Executable(TRANSFER_TRANSFORMATION.to_string()),
        })
}

/// Attaches the credentials the plan's transfers need to the job.
///
/// Proxies are handed to the scheduler; other credentials are shipped with
/// the job and announced through their environment variable relative to
/// the job's directory. Returns the attached credential file names.
pub fn attach_credentials(
    ctx: &EnableContext<'_>,
    job: &mut Job,
    plan: &StagingPlan,
) -> Vec<(CredentialKind, String)> {
    let mut attached: Vec<(CredentialKind, String)> = Vec::new();
    for transfer in plan.stage_in.iter().chain(&plan.stage_out) {
        for url in transfer.remote_urls() {
            let Some(credential) = ctx.credentials.credential_for(job, url) else {
                continue;
            };
            if attached.iter().any(|(k, _)| *k == credential.kind) {
                continue;
            }

            let name = basename(&credential.path).to_string();
            if credential.kind == CredentialKind::X509 {
                job.attributes.set("x509userproxy", credential.path.clone());
            } else {
                job.transfer_inputs.insert(credential.path.clone());
            }
            job.env
                .set(credential.kind.variable(), format!("./{name}"));
            attached.push((credential.kind, name));
        }
    }
    attached
}

/// Gets the file name component of a path.
pub(crate) fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

/// Quotes a hook command so it survives the scheduler's argument parsing.
fn quote_hook(job: &Job, command: &str) -> EngineResult<String> {
    quote(command, false).map_err(|source| EngineError::Grammar {
        job: job.id.clone(),
        source,
    })
}

/// Sets a hook on a job, reporting a conflict as an invalid job.
fn set_hook(job: &mut Job, kind: HookKind, command: String) -> EngineResult<()> {
    job.hooks
        .set(kind, command)
        .map_err(|e| EngineError::invalid(&job.id, e.to_string()))
}

/// Writes the transfer list files of a plan, returning their names.
fn write_transfer_lists(
    ctx: &EnableContext<'_>,
    job: &mut Job,
    plan: &StagingPlan,
) -> EngineResult<(Option<String>, Option<String>)> {
    let mut names = (None, None);
    if plan.needs_stage_in() {
        let name = format!("sls_{id}.in", id = job.id);
        let list = transfer_list(job, Linkage::Input, &plan.stage_in)?;
        let path = ctx.submit_dir.join(&name);
        job.transfer_inputs.insert(path.display().to_string());
        job.add_generated(path, list, false);
        names.0 = Some(name);
    }
    if plan.needs_stage_out() {
        let name = format!("sls_{id}.out", id = job.id);
        let list = transfer_list(job, Linkage::Output, &plan.stage_out)?;
        let path = ctx.submit_dir.join(&name);
        job.transfer_inputs.insert(path.display().to_string());
        job.add_generated(path, list, false);
        names.1 = Some(name);
    }
    Ok(names)
}

/// Installs the setup, pre, post and cleanup hooks of a plan on a job.
///
/// The transfer lists are shipped with the job as `sls_<id>.in` and
/// `sls_<id>.out`.
pub fn install_hooks(
    ctx: &EnableContext<'_>,
    job: &mut Job,
    plan: &StagingPlan,
) -> EngineResult<()> {
    attach_credentials(ctx, job, plan);
    let (input_list, output_list) = write_transfer_lists(ctx, job, plan)?;
    let tool = if input_list.is_some() || output_list.is_some() {
        Some(transfer_tool(ctx, job)?)
    } else {
        None
    };

    let dir = &plan.directory;
    let setup = quote_hook(job, &format!("/bin/mkdir -p {dir}"))?;
    set_hook(job, HookKind::Setup, setup)?;

    if let (Some(tool), Some(list)) = (&tool, &input_list) {
        let pre = quote_hook(job, &format!("{tool} --file {list}"))?;
        set_hook(job, HookKind::Pre, pre)?;
    }
    if let (Some(tool), Some(list)) = (&tool, &output_list) {
        let post = quote_hook(job, &format!("{tool} --file {list}"))?;
        set_hook(job, HookKind::Post, post)?;
    }

    let cleanup = quote_hook(job, &format!("/bin/rm -rf {dir}"))?;
    set_hook(job, HookKind::Cleanup, cleanup)?;
    Ok(())
}

/// Tasks run by the sequencer around the constituents of a clustered job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequencedTasks {
    /// Tasks that precede every constituent.
    pub setup: Vec<String>,
    /// Tasks that follow every constituent.
    pub trailer: Vec<String>,
}

/// Builds the sequencer tasks that stage a clustered job's data.
///
/// The directory itself is created and removed by the sequencer through
/// `GW_CLUSTER_SETUP` and `GW_CLUSTER_CLEANUP`.
pub fn sequenced_tasks(
    ctx: &EnableContext<'_>,
    job: &mut Job,
    plan: &StagingPlan,
) -> EngineResult<SequencedTasks> {
    let credentials = attach_credentials(ctx, job, plan);
    let (input_list, output_list) = write_transfer_lists(ctx, job, plan)?;
    let dir = &plan.directory;
    let mut tasks = SequencedTasks::default();

    for (kind, name) in &credentials {
        if *kind == CredentialKind::S3 {
            tasks.setup.push(format!("/bin/chmod 600 {name}"));
        }
    }

    let mut copies: Vec<String> = credentials
        .iter()
        .filter(|(kind, _)| *kind != CredentialKind::X509)
        .map(|(_, name)| name.clone())
        .collect();
    copies.extend(input_list.iter().cloned());
    copies.extend(output_list.iter().cloned());
    if !copies.is_empty() {
        tasks
            .setup
            .push(format!("/bin/cp {files} {dir}", files = copies.join(" ")));
    }

    if let Some((_, proxy)) = credentials.iter().find(|(k, _)| *k == CredentialKind::X509) {
        tasks.setup.push(format!("/bin/chmod 600 {dir}/{proxy}"));
    }

    if input_list.is_some() || output_list.is_some() {
        let tool = transfer_tool(ctx, job)?;
        if let Some(list) = &input_list {
            tasks.setup.push(format!("{tool} --file {dir}/{list}"));
        }
        if let Some(list) = &output_list {
            tasks.trailer.push(format!("{tool} --file {dir}/{list}"));
        }
    }

    job.env
        .set(CLUSTER_SETUP_VARIABLE, format!("/bin/mkdir -p {dir}"));
    job.env
        .set(CLUSTER_CLEANUP_VARIABLE, format!("/bin/rm -rf {dir}"));
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::job::JobClass;
    use crate::testing::Fixture;

    #[test]
    fn worker_node_directory_layout() {
        let fixture = Fixture::new();
        let ctx = fixture.context();

        let job = Job::new("ID1", JobClass::Compute, "/bin/true", "condorpool");
        assert_eq!(
            worker_node_directory(&ctx, &job),
            "/scratch/wn/user-diamond-run0001-ID1"
        );

        let job = Job::new("ID2", JobClass::Compute, "/bin/true", "unknown");
        assert_eq!(
            worker_node_directory(&ctx, &job),
            "/tmp/user-diamond-run0001-ID2"
        );

        let mut job = Job::new("ID3", JobClass::Compute, "/bin/true", "condorpool");
        job.profile.wn_dir = Some("/fast/ID3".into());
        assert_eq!(worker_node_directory(&ctx, &job), "/fast/ID3");
    }

    #[test]
    fn plan_uses_staging_site_and_explicit_urls() {
        let fixture = Fixture::new();
        let ctx = fixture.context();

        let mut job = Job::new("ID1", JobClass::Compute, "/bin/true", "condorpool");
        job.staging_site = Some("staging".into());
        job.inputs.push(JobFile::new("f.a"));
        let mut explicit = JobFile::new("f.b");
        explicit.sources.push(FileUrl::new("web", "http://example.org/f.b"));
        job.inputs.push(explicit);
        job.outputs.push(JobFile::new("f.c"));

        let plan = plan(&ctx, &job, "/wn").unwrap();
        assert!(plan.needs_stage_in());
        assert!(plan.needs_stage_out());
        assert_eq!(
            plan.stage_in[0].sources,
            vec![FileUrl::new(
                "staging",
                "gsiftp://staging.example.org/shared/user/diamond/run0001/f.a"
            )]
        );
        assert_eq!(plan.stage_in[0].destination.url, "file:///wn/f.a");
        assert_eq!(plan.stage_in[1].sources[0].url, "http://example.org/f.b");
        assert_eq!(plan.stage_out[0].sources[0].url, "file:///wn/f.c");
        assert_eq!(
            plan.stage_out[0].destination.url,
            "gsiftp://staging.example.org/shared/user/diamond/run0001/f.c"
        );
    }

    #[test]
    fn worker_node_inputs_are_not_fetched() {
        let fixture = Fixture::new();
        let ctx = fixture.context();

        let mut job = Job::new("ID1", JobClass::Compute, "/bin/true", "condorpool");
        let mut input = JobFile::new("f.a");
        input.sources.push(FileUrl::new("condorpool", "file:///scratch/wn/f.a"));
        job.inputs.push(input);

        let plan = plan(&ctx, &job, "/wn").unwrap();
        assert_eq!(plan.stage_in.len(), 1);
        assert!(!plan.needs_stage_in());
        assert!(!plan.needs_stage_out());

        install_hooks(&ctx, &mut job, &plan).unwrap();
        assert!(!job.generated.iter().any(|g| g.path.ends_with("sls_ID1.in")));
        assert!(job.hooks.get(HookKind::Pre).is_none());
        assert_eq!(job.hooks.get(HookKind::Setup), Some("/bin/mkdir -p /wn"));
    }

    #[test]
    fn plan_without_file_server_is_a_capability_error() {
        let fixture = Fixture::new();
        let ctx = fixture.context();

        let mut job = Job::new("ID1", JobClass::Compute, "/bin/true", "condorpool");
        job.inputs.push(JobFile::new("f.a"));
        let e = plan(&ctx, &job, "/wn").unwrap_err();
        assert!(matches!(
            e,
            EngineError::Capability {
                capability: Capability::FileServer,
                ..
            }
        ));
    }

    #[test]
    fn transfer_list_format() {
        let fixture = Fixture::new();
        let ctx = fixture.context();

        let mut job = Job::new("ID1", JobClass::Compute, "/bin/true", "condorpool");
        job.staging_site = Some("staging".into());
        job.inputs.push(JobFile::new("f.a"));
        let plan = plan(&ctx, &job, "/wn").unwrap();

        let list: serde_json::Value =
            serde_json::from_str(&transfer_list(&job, Linkage::Input, &plan.stage_in).unwrap())
                .unwrap();
        assert_eq!(
            list,
            serde_json::json!([{
                "type": "transfer",
                "linkage": "input",
                "lfn": "f.a",
                "id": 1,
                "src_urls": [{
                    "site_label": "staging",
                    "url": "gsiftp://staging.example.org/shared/user/diamond/run0001/f.a",
                    "priority": 0,
                    "checkpoint": false
                }],
                "dest_urls": [{
                    "site_label": "condorpool",
                    "url": "file:///wn/f.a",
                    "type": "file"
                }]
            }])
        );
    }

    #[test]
    fn hooks_are_installed_once() {
        let fixture = Fixture::new();
        let ctx = fixture.context();

        let mut job = Job::new("ID1", JobClass::Compute, "/bin/true", "condorpool");
        job.staging_site = Some("staging".into());
        job.inputs.push(JobFile::new("f.a"));
        let plan = plan(&ctx, &job, "/wn/ID1").unwrap();
        install_hooks(&ctx, &mut job, &plan).unwrap();

        assert_eq!(job.hooks.get(HookKind::Setup), Some("/bin/mkdir -p /wn/ID1"));
        assert_eq!(
            job.hooks.get(HookKind::Pre),
            Some("/opt/gw/bin/gw-transfer --file sls_ID1.in")
        );
        assert_eq!(job.hooks.get(HookKind::Post), None);
        assert_eq!(job.hooks.get(HookKind::Cleanup), Some("/bin/rm -rf /wn/ID1"));
        assert_eq!(job.generated.len(), 1);
        assert!(job.generated[0].path.ends_with("sls_ID1.in"));
        assert_eq!(job.attributes.get("x509userproxy"), Some("/tmp/x509up_u1000"));
        assert_eq!(job.env.get("X509_USER_PROXY"), Some("./x509up_u1000"));

        let elsewhere = super::plan(&ctx, &job, "/wn/elsewhere").unwrap();
        let e = install_hooks(&ctx, &mut job, &elsewhere).unwrap_err();
        assert!(matches!(e, EngineError::InvalidJob { .. }));
    }

    #[test]
    fn sequenced_tasks_copy_credentials_first() {
        let fixture = Fixture::new();
        let ctx = fixture.context();

        let mut job = Job::new("merge_ID9", JobClass::Aggregated, "/bin/true", "condorpool");
        let mut input = JobFile::new("f.a");
        input.sources.push(FileUrl::new("s3", "s3://bucket/f.a"));
        job.inputs.push(input);
        let plan = plan(&ctx, &job, "/wn/merge").unwrap();

        let tasks = sequenced_tasks(&ctx, &mut job, &plan).unwrap();
        assert_eq!(
            tasks.setup,
            vec![
                "/bin/chmod 600 s3cfg".to_string(),
                "/bin/cp s3cfg sls_merge_ID9.in /wn/merge".to_string(),
                "/opt/gw/bin/gw-transfer --file /wn/merge/sls_merge_ID9.in".to_string(),
            ]
        );
        assert!(tasks.trailer.is_empty());
        assert_eq!(job.env.get("S3CFG"), Some("./s3cfg"));
        assert_eq!(job.env.get(CLUSTER_SETUP_VARIABLE), Some("/bin/mkdir -p /wn/merge"));
        assert!(job.transfer_inputs.contains("/home/user/.creds/s3cfg"));
    }
}
