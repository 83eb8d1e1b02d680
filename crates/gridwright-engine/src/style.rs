//! Submission styles.
//!
//! A style decides how the scheduler reaches a site: directly, through a
//! remote gateway, through pilot jobs, or over SSH. Styles only add or
//! rewrite scheduler attributes; the job's executable, arguments and stdio
//! belong to the enablement strategy.

use std::fmt::Write as _;
use std::sync::OnceLock;

use serde::Deserialize;
use serde::Serialize;
use strum::EnumIter;
use strum::IntoStaticStr;
use tracing::debug;

use crate::catalog::SiteCatalog;
use crate::catalog::SiteEntry;
use crate::error::Capability;
use crate::error::EngineError;
use crate::error::EngineResult;
use crate::job::Job;

/// The scheduler attribute holding the universe of a job.
pub const UNIVERSE_KEY: &str = "universe";

/// The scheduler attribute holding the grid resource of a job.
pub const GRID_RESOURCE_KEY: &str = "grid_resource";

/// The available submission styles.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StyleKind {
    /// Submits to the local scheduler pool.
    Condor,
    /// Submits to a remote scheduler daemon.
    CondorC,
    /// Submits through a remote gateway to a site batch system.
    Globus,
    /// Submits to pilot jobs started on the site.
    Glidein,
    /// Submits to a glidein workload management system.
    GlideinWms,
    /// Submits to a site batch system over SSH.
    Ssh,
}

impl StyleKind {
    /// Determines the style of a job, writing the resolved style back.
    ///
    /// An explicit style on the job wins; otherwise jobs on the submit host
    /// use [`StyleKind::Condor`] and all others [`StyleKind::Globus`].
    pub fn resolve(job: &mut Job) -> Self {
        let kind = job.profile.style.unwrap_or(if job.is_local() {
            Self::Condor
        } else {
            Self::Globus
        });
        job.profile.style = Some(kind);
        kind
    }

    /// Determines if jobs of this style run remotely through the grid
    /// universe.
    pub fn is_remote_gateway(&self) -> bool {
        matches!(self, Self::CondorC | Self::Globus | Self::Ssh)
    }

    /// Gets the index of the style in a registry.
    fn index(&self) -> usize {
        match self {
            Self::Condor => 0,
            Self::CondorC => 1,
            Self::Globus => 2,
            Self::Glidein => 3,
            Self::GlideinWms => 4,
            Self::Ssh => 5,
        }
    }

    /// Creates the handler of the style.
    fn create(&self) -> Box<dyn SubmissionStyle> {
        match self {
            Self::Condor => Box::new(Condor),
            Self::CondorC => Box::new(CondorC),
            Self::Globus => Box::new(Globus),
            Self::Glidein => Box::new(Glidein),
            Self::GlideinWms => Box::new(GlideinWms),
            Self::Ssh => Box::new(Ssh),
        }
    }
}

impl std::fmt::Display for StyleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s: &'static str = self.into();
        write!(f, "{s}")
    }
}

/// Implemented by submission style handlers.
pub trait SubmissionStyle: Send + Sync {
    /// Applies the style to a job's scheduler attributes.
    fn apply(&self, job: &mut Job, sites: &dyn SiteCatalog) -> EngineResult<()>;
}

/// A registry that creates each style handler once, on first use.
#[derive(Default)]
pub struct StyleRegistry {
    /// The handlers, indexed by style.
    handlers: [OnceLock<Box<dyn SubmissionStyle>>; 6],
}

impl std::fmt::Debug for StyleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let created = self.handlers.iter().filter(|h| h.get().is_some()).count();
        f.debug_struct("StyleRegistry")
            .field("created", &created)
            .finish()
    }
}

impl StyleRegistry {
    /// Constructs an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the handler for a style.
    pub fn handler(&self, kind: StyleKind) -> &dyn SubmissionStyle {
        self.handlers[kind.index()]
            .get_or_init(|| {
                debug!("creating handler for submission style `{kind}`");
                kind.create()
            })
            .as_ref()
    }

    /// Resolves and applies the style of a job.
    pub fn apply(&self, job: &mut Job, sites: &dyn SiteCatalog) -> EngineResult<StyleKind> {
        let kind = StyleKind::resolve(job);
        self.handler(kind).apply(job, sites)?;
        Ok(kind)
    }
}

/// Gets the gateway contact of the job's site.
fn gateway<'a>(job: &Job, site: Option<&'a SiteEntry>) -> EngineResult<&'a str> {
    site.and_then(|s| s.gateway.as_deref())
        .ok_or_else(|| EngineError::Capability {
            job: job.id.clone(),
            site: job.site.clone(),
            capability: Capability::Gateway,
        })
}

/// Submits to the local pool.
struct Condor;

impl SubmissionStyle for Condor {
    fn apply(&self, job: &mut Job, _: &dyn SiteCatalog) -> EngineResult<()> {
        let universe = if job.is_local() { "local" } else { "vanilla" };
        job.attributes.set_if_absent(UNIVERSE_KEY, universe);
        Ok(())
    }
}

/// Submits to a remote scheduler daemon.
struct CondorC;

impl SubmissionStyle for CondorC {
    fn apply(&self, job: &mut Job, sites: &dyn SiteCatalog) -> EngineResult<()> {
        let contact = gateway(job, sites.site(&job.site))?;
        job.attributes.set(UNIVERSE_KEY, "grid");
        job.attributes
            .set(GRID_RESOURCE_KEY, format!("condor {contact}"));
        job.attributes.set_if_absent("remote_universe", "vanilla");
        Ok(())
    }
}

/// Submits through a remote gateway.
struct Globus;

impl SubmissionStyle for Globus {
    fn apply(&self, job: &mut Job, sites: &dyn SiteCatalog) -> EngineResult<()> {
        let contact = gateway(job, sites.site(&job.site))?;
        job.attributes.set(UNIVERSE_KEY, "grid");
        job.attributes.set(GRID_RESOURCE_KEY, format!("gt5 {contact}"));

        if !job.profile.gateway.is_empty() {
            let mut rsl = String::new();
            for (key, value) in &job.profile.gateway {
                // Writing to a string cannot fail.
                let _ = write!(rsl, "({key}={value})");
            }
            job.attributes.set("globusrsl", rsl);
        }
        Ok(())
    }
}

/// Submits to glidein pilots.
struct Glidein;

impl SubmissionStyle for Glidein {
    fn apply(&self, job: &mut Job, _: &dyn SiteCatalog) -> EngineResult<()> {
        job.attributes.set(UNIVERSE_KEY, "vanilla");
        job.attributes.set_if_absent(
            "requirements",
            format!("(GLIDEIN_Site == \"{site}\")", site = job.site),
        );
        Ok(())
    }
}

/// Submits to a glidein workload management system.
struct GlideinWms;

impl SubmissionStyle for GlideinWms {
    fn apply(&self, job: &mut Job, _: &dyn SiteCatalog) -> EngineResult<()> {
        job.attributes.set(UNIVERSE_KEY, "vanilla");
        job.attributes
            .set_if_absent("+DESIRED_Sites", format!("\"{site}\"", site = job.site));
        if let Some(cores) = job.profile.cores {
            job.attributes.set_if_absent("request_cpus", cores.to_string());
        }
        if let Some(memory) = job.profile.gateway.get("maxmemory").cloned() {
            job.attributes.set_if_absent("request_memory", memory);
        }
        Ok(())
    }
}

/// Submits over SSH to a site batch system.
struct Ssh;

impl SubmissionStyle for Ssh {
    fn apply(&self, job: &mut Job, sites: &dyn SiteCatalog) -> EngineResult<()> {
        let site = sites.site(&job.site);
        let contact = gateway(job, site)?;
        let batch = site
            .and_then(|s| s.batch_system.as_deref())
            .unwrap_or("pbs");
        job.attributes.set(UNIVERSE_KEY, "grid");
        job.attributes
            .set(GRID_RESOURCE_KEY, format!("batch {batch} {contact}"));
        if let Some(queue) = job.profile.gateway.get("queue").cloned() {
            job.attributes.set_if_absent("+remote_queue", format!("\"{queue}\""));
        }
        Ok(())
    }
}
