//! The submission-artifact assembler.
//!
//! The assembler runs every job of a workflow through the pipeline:
//!
//! 1. the submission style is resolved and applied;
//! 2. the site's environment fills in variables the job does not set;
//! 3. the enablement strategy rewrites the job;
//! 4. priority and concurrency group are assigned;
//! 5. hooks are written into the environment and the submit file is
//!    rendered.
//!
//! Jobs are assembled in parallel. A job that fails has none of its
//! artifacts written; its siblings are unaffected. The DAG file is only
//! written when every job assembled.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use rayon::prelude::*;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::catalog::CredentialHandler;
use crate::catalog::SiteCatalog;
use crate::catalog::TransformationCatalog;
use crate::config::Config;
use crate::dag;
use crate::dag::DagNode;
use crate::error::EngineError;
use crate::error::EngineResult;
use crate::job::AggregatedJob;
use crate::job::GeneratedFile;
use crate::job::Job;
use crate::policy::PolicyTables;
use crate::strategy::EnableContext;
use crate::strategy::Enablement;
use crate::strategy::JobEnabler;
use crate::strategy::Strategy;
use crate::strategy::StrategyKind;
use crate::strategy::WorkerPackageCache;
use crate::strategy::bootstrap::COMMON_LIBRARY;
use crate::strategy::bootstrap::common_library_path;
use crate::strategy::select_post_script;
use crate::strategy::select_strategy;
use crate::style::StyleKind;
use crate::style::StyleRegistry;
use crate::submit;
use crate::workflow::Workflow;
use crate::workflow::WorkflowMetadata;

/// A job whose artifacts were rendered but not yet written.
#[derive(Debug)]
struct Rendered {
    /// The job's DAG node.
    node: DagNode,
    /// The strategy that enabled the job.
    strategy: StrategyKind,
    /// The auxiliary files, deduplicated by path.
    generated: Vec<GeneratedFile>,
    /// The submit file.
    submit: GeneratedFile,
    /// Whether the job needs the bootstrap shell library.
    uses_common_library: bool,
}

/// A job whose artifacts were written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledJob {
    /// The job's DAG node.
    pub node: DagNode,
    /// The strategy that enabled the job.
    pub strategy: StrategyKind,
    /// The submit file.
    pub submit_file: PathBuf,
    /// The auxiliary files written for the job.
    pub generated: Vec<PathBuf>,
}

/// The outcome of assembling one job.
#[derive(Debug)]
pub struct JobOutcome {
    /// The job identifier.
    pub id: String,
    /// The assembled job or the reason it failed.
    pub result: EngineResult<AssembledJob>,
}

/// The outcome of assembling a workflow.
#[derive(Debug)]
pub struct Assembly {
    /// The per-job outcomes, in workflow order.
    pub jobs: Vec<JobOutcome>,
    /// The DAG file, if every job assembled.
    pub dag: Option<PathBuf>,
}

impl Assembly {
    /// Iterates the jobs that failed.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &EngineError)> {
        self.jobs.iter().filter_map(|o| match &o.result {
            Ok(_) => None,
            Err(e) => Some((o.id.as_str(), e)),
        })
    }

    /// Determines if every job assembled.
    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Generates the submit artifacts of a workflow.
pub struct Assembler<'a> {
    /// The engine configuration.
    config: &'a Config,
    /// The site catalog.
    sites: &'a dyn SiteCatalog,
    /// The transformation catalog.
    transformations: &'a dyn TransformationCatalog,
    /// The credential handler.
    credentials: &'a dyn CredentialHandler,
    /// The submit directory.
    submit_dir: PathBuf,
    /// The workflow's directory relative to a site's scratch directory.
    relative_dir: String,
    /// The style handlers.
    styles: StyleRegistry,
    /// The priority and concurrency tables.
    policy: PolicyTables,
    /// The worker package locations.
    worker_packages: WorkerPackageCache,
}

impl std::fmt::Debug for Assembler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assembler")
            .field("config", self.config)
            .field("submit_dir", &self.submit_dir)
            .field("relative_dir", &self.relative_dir)
            .field("styles", &self.styles)
            .field("worker_packages", &self.worker_packages)
            .finish_non_exhaustive()
    }
}

impl<'a> Assembler<'a> {
    /// Constructs an assembler writing into `submit_dir`.
    ///
    /// `relative_dir` is the workflow's directory below a site's scratch
    /// directory.
    pub fn new(
        config: &'a Config,
        sites: &'a dyn SiteCatalog,
        transformations: &'a dyn TransformationCatalog,
        credentials: &'a dyn CredentialHandler,
        submit_dir: impl AsRef<Path>,
        relative_dir: impl Into<String>,
    ) -> Self {
        Self {
            config,
            sites,
            transformations,
            credentials,
            submit_dir: path_clean::clean(submit_dir.as_ref()),
            relative_dir: relative_dir.into(),
            styles: StyleRegistry::new(),
            policy: PolicyTables::new(),
            worker_packages: WorkerPackageCache::new(),
        }
    }

    /// Gets the enablement context of the assembler.
    pub fn context(&self) -> EnableContext<'_> {
        EnableContext {
            config: self.config,
            sites: self.sites,
            transformations: self.transformations,
            credentials: self.credentials,
            submit_dir: &self.submit_dir,
            relative_dir: &self.relative_dir,
            worker_packages: &self.worker_packages,
        }
    }

    /// Assembles a workflow, writing every artifact into the submit
    /// directory.
    ///
    /// An error is returned only when the workflow as a whole is invalid;
    /// failures of individual jobs are reported in the returned
    /// [`Assembly`].
    pub fn assemble(&self, mut workflow: Workflow) -> EngineResult<Assembly> {
        workflow.validate()?;
        workflow.assign_depths()?;
        let metadata = workflow.metadata();

        fs::create_dir_all(&self.submit_dir).map_err(|e| EngineError::io(&self.submit_dir, e))?;

        let Workflow {
            name,
            jobs,
            clusters,
            dependencies,
            ..
        } = workflow;

        let render = || -> Vec<(String, EngineResult<Rendered>)> {
            let jobs = jobs.into_par_iter().map(|job| {
                let id = job.id.clone();
                (id, self.render_job(&metadata, job))
            });
            let clusters = clusters.into_par_iter().map(|cluster| {
                let id = cluster.job.id.clone();
                (id, self.render_cluster(&metadata, cluster))
            });
            jobs.chain(clusters).collect()
        };

        let rendered = match self.config.parallelism {
            Some(threads) => match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
                Ok(pool) => pool.install(render),
                Err(e) => {
                    warn!("failed to create a pool of {threads} threads: {e}");
                    render()
                }
            },
            None => render(),
        };

        let mut library_written = false;
        let mut outcomes = Vec::with_capacity(rendered.len());
        for (id, result) in rendered {
            let result = result.and_then(|rendered| {
                if rendered.uses_common_library && !library_written {
                    let path = common_library_path(&self.submit_dir);
                    write_file(&path, COMMON_LIBRARY, false)?;
                    library_written = true;
                }
                self.write(rendered)
            });

            match &result {
                Ok(job) => debug!(
                    job = %id,
                    strategy = %job.strategy,
                    "wrote `{}`",
                    job.submit_file.display()
                ),
                Err(e) => warn!(job = %id, "failed to assemble job: {e:#}"),
            }
            outcomes.push(JobOutcome { id, result });
        }

        let mut assembly = Assembly {
            jobs: outcomes,
            dag: None,
        };

        if assembly.is_success() {
            let nodes: Vec<_> = assembly
                .jobs
                .iter()
                .filter_map(|o| o.result.as_ref().ok().map(|j| j.node.clone()))
                .collect();
            let text = dag::render(
                &name,
                &nodes,
                &dependencies,
                self.config.submit.post_script_dir.as_deref(),
            );
            let path = self.submit_dir.join(format!("{name}.dag"));
            write_file(&path, &text, false)?;
            info!("wrote DAG file `{}` with {} jobs", path.display(), nodes.len());
            assembly.dag = Some(path);
        } else {
            let failed = assembly.failures().count();
            warn!("{failed} job(s) failed to assemble; the DAG file was not written");
        }

        Ok(assembly)
    }

    /// Applies the style and fills in the site's environment.
    ///
    /// Jobs the strategy submits from the submit host never talk to their
    /// execution site's gateway and always use the condor style.
    fn prepare(&self, job: &mut Job, kind: StrategyKind) -> EngineResult<()> {
        if kind.submits_locally() {
            job.profile.style = Some(StyleKind::Condor);
        }
        let style = self.styles.apply(job, self.sites)?;
        debug!(job = %job.id, "applied submission style `{style}`");

        if let Some(site) = self.sites.site(&job.site) {
            job.env.merge_missing(&site.environment);
        }
        Ok(())
    }

    /// Assigns priority and concurrency group and writes hooks into the
    /// environment.
    fn finish(&self, job: &mut Job) -> EngineResult<()> {
        let assigned = match self.policy.assign_priority(job) {
            Ok(()) => self.policy.assign_concurrency(job),
            Err(e) => Err(e),
        };
        assigned.map_err(|source| EngineError::Policy {
            job: job.id.clone(),
            source,
        })?;

        job.hooks.apply_to(&mut job.env);
        Ok(())
    }

    /// Runs a job through the pipeline.
    fn render_job(&self, metadata: &WorkflowMetadata, mut job: Job) -> EngineResult<Rendered> {
        let kind = select_strategy(self.config, &job, None);
        self.prepare(&mut job, kind)?;

        let strategy = Strategy::new(kind, self.context());
        let enablement = strategy.enable(&mut job)?;
        check(&job, enablement)?;

        self.finish(&mut job)?;
        self.render(metadata, &strategy, job, Vec::new(), None)
    }

    /// Runs a clustered job through the pipeline.
    fn render_cluster(
        &self,
        metadata: &WorkflowMetadata,
        mut cluster: AggregatedJob,
    ) -> EngineResult<Rendered> {
        let kind = select_strategy(self.config, &cluster.job, Some(cluster.clustered_by));
        self.prepare(&mut cluster.job, kind)?;
        for constituent in &mut cluster.constituents {
            if let Some(site) = self.sites.site(&constituent.site) {
                constituent.env.merge_missing(&site.environment);
            }
        }

        let strategy = Strategy::new(kind, self.context());
        let enablement = strategy.enable_aggregated(&mut cluster)?;
        check(&cluster.job, enablement)?;

        self.finish(&mut cluster.job)?;
        let size = cluster.constituents.len();
        let constituents = cluster.constituents;
        self.render(metadata, &strategy, cluster.job, constituents, Some(size))
    }

    /// Renders the artifacts of an enabled job.
    fn render(
        &self,
        metadata: &WorkflowMetadata,
        strategy: &Strategy<'_>,
        mut job: Job,
        constituents: Vec<Job>,
        cluster_size: Option<usize>,
    ) -> EngineResult<Rendered> {
        let post = select_post_script(
            &job,
            strategy.default_post_script(),
            self.config.submit.post_script_scope,
        );
        let node = DagNode::new(&job, post, self.config.submit.retry);

        let library = common_library_path(&self.submit_dir).display().to_string();
        let uses_common_library = std::iter::once(&job)
            .chain(&constituents)
            .any(|j| {
                matches!(
                    j.enabled_by,
                    Some(StrategyKind::Bootstrap | StrategyKind::CloudBatch)
                ) || j.transfer_inputs.contains(&library)
            });

        let text = submit::render(&job, &self.config.submit, metadata, cluster_size)?;

        let mut seen = HashSet::new();
        let generated = std::mem::take(&mut job.generated)
            .into_iter()
            .chain(constituents.into_iter().flat_map(|c| c.generated))
            .filter(|g| seen.insert(g.path.clone()))
            .collect();

        Ok(Rendered {
            node,
            strategy: strategy.kind(),
            generated,
            submit: GeneratedFile {
                path: self.submit_dir.join(format!("{id}.sub", id = job.id)),
                contents: text,
                executable: false,
            },
            uses_common_library,
        })
    }

    /// Writes the artifacts of a rendered job.
    fn write(&self, rendered: Rendered) -> EngineResult<AssembledJob> {
        let mut written = Vec::with_capacity(rendered.generated.len());
        for file in &rendered.generated {
            write_file(&file.path, &file.contents, file.executable)?;
            written.push(file.path.clone());
        }

        write_file(&rendered.submit.path, &rendered.submit.contents, false)?;
        Ok(AssembledJob {
            node: rendered.node,
            strategy: rendered.strategy,
            submit_file: rendered.submit.path,
            generated: written,
        })
    }
}

/// Converts an unsupported enablement into a capability error.
fn check(job: &Job, enablement: Enablement) -> EngineResult<()> {
    match enablement {
        Enablement::Enabled => Ok(()),
        Enablement::Unsupported(capability) => Err(EngineError::Capability {
            job: job.id.clone(),
            site: job.site.clone(),
            capability,
        }),
    }
}

/// Writes a file, marking it executable when asked.
fn write_file(path: &Path, contents: &str, executable: bool) -> EngineResult<()> {
    fs::write(path, contents).map_err(|e| EngineError::io(path, e))?;

    #[cfg(unix)]
    if executable {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .map_err(|e| EngineError::io(path, e))?;
    }

    #[cfg(not(unix))]
    let _ = executable;

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    use super::*;
    use crate::error::Capability;
    use crate::job::ClusterTool;
    use crate::job::DataConfiguration;
    use crate::testing::Fixture;
    use crate::workflow::Dependency;

    fn assembler(fixture: &Fixture) -> Assembler<'_> {
        Assembler::new(
            &fixture.config,
            &fixture.catalog,
            &fixture.catalog,
            &fixture.catalog,
            fixture.submit_dir(),
            "user/diamond/run0001",
        )
    }

    fn workflow(fixture: &Fixture) -> Workflow {
        let mut workflow = Workflow::new("diamond");

        let mut preprocess = fixture.compute_job("preprocess_ID1", "hpc");
        preprocess.env.set("GREETING", "hello world");
        workflow.jobs.push(preprocess);

        let mut findrange = fixture.compute_job("findrange_ID2", "condorpool");
        findrange.profile.style = Some(StyleKind::Condor);
        findrange.profile.data_configuration = Some(DataConfiguration::NonSharedFs);
        workflow.jobs.push(findrange);

        let mut analyze = fixture.compute_job("analyze_ID4", "hpc");
        analyze.profile.runtime = Some(120);
        let summarize = fixture.compute_job("summarize_ID5", "hpc");
        workflow.clusters.push(AggregatedJob::new(
            fixture.compute_job("merge_ID9", "hpc"),
            vec![analyze, summarize],
            ClusterTool::Sequencer,
        ));

        workflow.dependencies = vec![
            Dependency {
                parent: "preprocess_ID1".into(),
                child: "findrange_ID2".into(),
            },
            Dependency {
                parent: "findrange_ID2".into(),
                child: "merge_ID9".into(),
            },
        ];
        workflow
    }

    #[test]
    fn writes_every_artifact() {
        let fixture = Fixture::new();
        let assembly = assembler(&fixture).assemble(workflow(&fixture)).unwrap();
        assert!(assembly.is_success());

        let submit = fixture.submit_dir();
        let strategies: Vec<_> = assembly
            .jobs
            .iter()
            .map(|o| o.result.as_ref().unwrap().strategy)
            .collect();
        assert_eq!(
            strategies,
            [
                StrategyKind::Instrumented,
                StrategyKind::Bootstrap,
                StrategyKind::Instrumented
            ]
        );

        for id in ["preprocess_ID1", "findrange_ID2", "merge_ID9"] {
            let text = fs::read_to_string(submit.join(format!("{id}.sub"))).unwrap();
            assert!(text.starts_with("environment = \""), "{id}: {text}");
            assert!(text.ends_with("# END OF SUBMIT FILE\n"));
            assert!(text.contains(&format!("+gw_wf_dag_job_id = \"{id}\"\n")));
        }

        let preprocess = fs::read_to_string(submit.join("preprocess_ID1.sub")).unwrap();
        assert!(preprocess.contains("GREETING='hello world'"));
        assert!(preprocess.contains("GW_HOME=/apps/gridwright"));
        assert!(preprocess.contains("universe = grid\n"));
        assert!(preprocess.contains("priority = 10\n"));

        let merge = fs::read_to_string(submit.join("merge_ID9.sub")).unwrap();
        assert!(merge.contains("+gw_cluster_size = 2\n"));
        assert!(merge.contains("priority = 30\n"));

        let script = submit.join("findrange_ID2.sh");
        assert!(script.exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&script).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
        assert_eq!(
            fs::read_to_string(common_library_path(submit)).unwrap(),
            COMMON_LIBRARY
        );

        let dag = fs::read_to_string(assembly.dag.unwrap()).unwrap();
        assert!(dag.contains("JOB preprocess_ID1 preprocess_ID1.sub\n"));
        assert!(dag.contains(
            "SCRIPT POST findrange_ID2 gw-exitcode -r $RETURN -s \"GridwrightLite: exitcode 0\" \
             findrange_ID2.out\n"
        ));
        assert!(dag.contains("PRIORITY merge_ID9 30\n"));
        assert!(dag.contains("PARENT findrange_ID2 CHILD merge_ID9\n"));
    }

    fn submit_file(fixture: &Fixture, id: &str) -> String {
        fs::read_to_string(fixture.submit_dir().join(format!("{id}.sub"))).unwrap()
    }

    fn assert_submitted_locally(text: &str) {
        assert!(text.contains("universe = local\n"), "{text}");
        assert!(text.contains("+gw_site = \"local\"\n"), "{text}");
        for key in ["grid_resource", "globusrsl", "remote_universe"] {
            assert!(!text.contains(key), "`{key}` in {text}");
        }
    }

    #[test]
    fn relay_jobs_are_submitted_locally() {
        let fixture = Fixture::new();
        let mut workflow = Workflow::new("relay");
        let mut job = fixture.compute_job("preprocess_ID1", "hpc");
        job.profile.strategy = Some(StrategyKind::Relay);
        workflow.jobs.push(job);

        let assembly = assembler(&fixture).assemble(workflow).unwrap();
        assert!(assembly.is_success());
        assert_eq!(
            assembly.jobs[0].result.as_ref().unwrap().strategy,
            StrategyKind::Relay
        );

        let text = submit_file(&fixture, "preprocess_ID1");
        assert_submitted_locally(&text);
        assert!(text.contains("executable = /usr/local/bin/gw-distribute\n"));
    }

    #[test]
    fn cloud_batch_clusters_are_submitted_locally() {
        let mut fixture = Fixture::new();
        fixture.catalog.sites.get_mut("staging").unwrap().batch_bucket =
            Some("s3://staging-bucket/".into());

        let mut workflow = Workflow::new("batch");
        for (id, site) in [("merge_ID1", "hpc"), ("merge_ID2", "condorpool")] {
            let constituents = ["preprocess", "findrange"]
                .into_iter()
                .map(|name| {
                    let mut job = fixture.compute_job(&format!("{name}_{id}"), "condorpool");
                    job.profile.data_configuration = Some(DataConfiguration::NonSharedFs);
                    job
                })
                .collect();
            workflow.clusters.push(AggregatedJob::new(
                fixture.compute_job(id, site),
                constituents,
                ClusterTool::CloudBatch,
            ));
        }

        let assembly = assembler(&fixture).assemble(workflow).unwrap();
        let failures: Vec<_> = assembly.failures().map(|(id, _)| id.to_string()).collect();
        assert!(failures.is_empty(), "{failures:?}");

        for id in ["merge_ID1", "merge_ID2"] {
            let text = submit_file(&fixture, id);
            assert_submitted_locally(&text);
            assert!(text.contains("executable = /usr/local/bin/gw-batch\n"), "{text}");
        }
    }

    #[test]
    #[traced_test]
    fn failed_jobs_leave_no_artifacts() {
        let fixture = Fixture::new();
        let mut workflow = workflow(&fixture);
        workflow.jobs[0].site = "nowhere".into();
        workflow.jobs[0].profile.style = Some(StyleKind::Condor);

        let assembly = assembler(&fixture).assemble(workflow).unwrap();
        let failures: Vec<_> = assembly.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "preprocess_ID1");
        assert!(matches!(
            failures[0].1,
            EngineError::Capability {
                capability: Capability::Launcher,
                ..
            }
        ));

        let submit = fixture.submit_dir();
        assert!(!submit.join("preprocess_ID1.sub").exists());
        assert!(submit.join("findrange_ID2.sub").exists());
        assert!(submit.join("merge_ID9.sub").exists());
        assert!(assembly.dag.is_none());
        assert!(!submit.join("diamond.dag").exists());
        assert!(logs_contain("the DAG file was not written"));
    }

    #[test]
    fn invalid_workflows_are_rejected() {
        let fixture = Fixture::new();
        let mut workflow = workflow(&fixture);
        workflow.dependencies.push(Dependency {
            parent: "merge_ID9".into(),
            child: "preprocess_ID1".into(),
        });
        assert!(matches!(
            assembler(&fixture).assemble(workflow),
            Err(EngineError::InvalidJob { .. })
        ));
    }

    #[test]
    fn bounded_parallelism() {
        let mut fixture = Fixture::new();
        fixture.config.parallelism = Some(1);
        let assembly = assembler(&fixture).assemble(workflow(&fixture)).unwrap();
        assert!(assembly.is_success());
        assert_eq!(
            assembly.jobs.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(),
            ["preprocess_ID1", "findrange_ID2", "merge_ID9"]
        );
    }
}
