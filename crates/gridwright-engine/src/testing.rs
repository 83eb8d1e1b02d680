//! Shared fixtures for unit tests.

use std::path::Path;

use tempfile::TempDir;

use crate::catalog::CredentialKind;
use crate::catalog::HOME_VARIABLE;
use crate::catalog::InMemoryCatalog;
use crate::catalog::LAUNCHER_CAPABILITY;
use crate::catalog::SiteEntry;
use crate::catalog::TransformationEntry;
use crate::config::Config;
use crate::job::Job;
use crate::job::JobClass;
use crate::job::JobFile;
use crate::strategy::EnableContext;
use crate::strategy::RELAY_TRANSFORMATION;
use crate::strategy::SEQUENCER_TRANSFORMATION;
use crate::strategy::TRANSFER_TRANSFORMATION;
use crate::strategy::WorkerPackageCache;
use crate::strategy::cloud_batch::BATCH_TRANSFORMATION;

/// A workflow environment with four sites:
///
/// * `condorpool`: a pool with the launcher installed and no shared
///   filesystem.
/// * `staging`: the file server jobs stage data through.
/// * `hpc`: a cluster behind a gateway with a runtime installed.
/// * `local`: the submit host.
pub(crate) struct Fixture {
    /// The engine configuration.
    pub config: Config,
    /// The catalogs.
    pub catalog: InMemoryCatalog,
    /// The submit directory.
    submit: TempDir,
    /// The workflow's relative directory.
    relative: String,
    /// The worker package cache.
    packages: WorkerPackageCache,
}

impl Fixture {
    /// Creates the fixture.
    pub fn new() -> Self {
        let mut catalog = InMemoryCatalog::default();

        let mut condorpool = SiteEntry {
            temp_directory: Some("/scratch/wn".into()),
            worker_package: Some("/opt/gw/packages/gridwright-worker-x86_64_linux.tar.gz".into()),
            ..Default::default()
        };
        condorpool
            .installed
            .insert(LAUNCHER_CAPABILITY.into(), "/opt/gw/bin/gw-launch".into());
        catalog.sites.insert("condorpool".into(), condorpool);

        catalog.sites.insert(
            "staging".into(),
            SiteEntry {
                file_server: Some("gsiftp://staging.example.org".into()),
                shared_scratch: Some("/shared".into()),
                ..Default::default()
            },
        );

        let mut hpc = SiteEntry {
            gateway: Some("hpc.example.org/jobmanager-slurm".into()),
            batch_system: Some("slurm".into()),
            shared_scratch: Some("/lustre/scratch".into()),
            ..Default::default()
        };
        hpc.environment.set(HOME_VARIABLE, "/apps/gridwright");
        catalog.sites.insert("hpc".into(), hpc);

        let mut local = SiteEntry {
            shared_scratch: Some("/home/user/runs".into()),
            ..Default::default()
        };
        local.environment.set("LANG", "C");
        catalog.sites.insert("local".into(), local);

        for (name, site, path) in [
            (TRANSFER_TRANSFORMATION, "condorpool", "/opt/gw/bin/gw-transfer"),
            (SEQUENCER_TRANSFORMATION, "condorpool", "/opt/gw/bin/gw-cluster"),
            (RELAY_TRANSFORMATION, "local", "/usr/local/bin/gw-distribute"),
            (BATCH_TRANSFORMATION, "local", "/usr/local/bin/gw-batch"),
        ] {
            catalog.transformations.push(TransformationEntry {
                name: name.into(),
                site: site.into(),
                path: path.into(),
            });
        }

        catalog
            .credentials
            .insert(CredentialKind::S3, "/home/user/.creds/s3cfg".into());
        catalog
            .credentials
            .insert(CredentialKind::X509, "/tmp/x509up_u1000".into());
        catalog
            .credentials
            .insert(CredentialKind::Ssh, "/home/user/.ssh/id_rsa".into());

        Self {
            config: Config::default(),
            catalog,
            submit: tempfile::tempdir().expect("failed to create submit directory"),
            relative: "user/diamond/run0001".into(),
            packages: WorkerPackageCache::new(),
        }
    }

    /// Gets an enablement context over the fixture.
    pub fn context(&self) -> EnableContext<'_> {
        EnableContext {
            config: &self.config,
            sites: &self.catalog,
            transformations: &self.catalog,
            credentials: &self.catalog,
            submit_dir: self.submit.path(),
            relative_dir: &self.relative,
            worker_packages: &self.packages,
        }
    }

    /// Gets the submit directory.
    pub fn submit_dir(&self) -> &Path {
        self.submit.path()
    }

    /// Creates a compute job that reads `f.a` and writes `f.b1` and `f.b2`.
    pub fn compute_job(&self, id: &str, site: &str) -> Job {
        let mut job = Job::new(id, JobClass::Compute, "/usr/bin/preprocess", site);
        job.logical_id = id.rsplit('_').next().unwrap_or(id).to_string();
        job.transformation = "diamond::preprocess:4.0".into();
        job.arguments = "-a preprocess -T 60 -i f.a -o f.b1 f.b2".into();
        job.staging_site = Some("staging".into());
        job.inputs.push(JobFile::new("f.a"));
        job.outputs.push(JobFile::new("f.b1"));
        job.outputs.push(JobFile::new("f.b2"));
        job
    }
}
