//! Lookups the engine consumes from the planner's catalogs.
//!
//! The engine never owns catalog content; it asks a [`SiteCatalog`], a
//! [`TransformationCatalog`] and a [`CredentialHandler`] for what it needs.
//! [`InMemoryCatalog`] implements all three from serde data and is what the
//! command line tool and the tests use.

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

use crate::env::EnvironmentProfile;
use crate::job::Job;

/// The environment variable that points at a runtime installed on a site.
pub const HOME_VARIABLE: &str = "GW_HOME";

/// The capability name of the instrumented launcher.
pub const LAUNCHER_CAPABILITY: &str = "launcher";

/// Describes a site known to the planner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SiteEntry {
    /// The directory jobs may use for temporary worker-node directories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_directory: Option<String>,
    /// Node-local scratch space bootstrap scripts prefer for work
    /// directories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_scratch: Option<String>,
    /// The shared filesystem directory workflows run in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_scratch: Option<String>,
    /// The URL prefix under which the shared scratch directory is served.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_server: Option<String>,
    /// The remote gateway contact (`host/jobmanager-pbs`, `user@host`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    /// The batch system behind the gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_system: Option<String>,
    /// The URL of a worker package built for the site.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_package: Option<String>,
    /// The bucket cloud batch jobs exchange files through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_bucket: Option<String>,
    /// Installed tool paths keyed by capability name.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub installed: IndexMap<String, String>,
    /// Environment every job on the site receives.
    #[serde(default)]
    pub environment: EnvironmentProfile,
}

/// Site metadata lookups.
pub trait SiteCatalog: Send + Sync {
    /// Looks up a site by handle.
    fn site(&self, handle: &str) -> Option<&SiteEntry>;

    /// Gets the temporary directory of a site.
    fn temp_directory(&self, handle: &str) -> Option<&str> {
        self.site(handle)?.temp_directory.as_deref()
    }

    /// Gets the shared filesystem working directory of a site.
    fn shared_scratch(&self, handle: &str) -> Option<&str> {
        self.site(handle)?.shared_scratch.as_deref()
    }

    /// Gets the installed path of a capability on a site.
    fn installed_path(&self, handle: &str, capability: &str) -> Option<&str> {
        self.site(handle)?
            .installed
            .get(capability)
            .map(String::as_str)
    }
}

/// Physical locations of logical transformations.
pub trait TransformationCatalog: Send + Sync {
    /// Gets the physical path of a transformation on a site.
    fn lookup(&self, transformation: &str, site: &str) -> Option<&str>;
}

/// The kinds of credentials a data movement may need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// A grid proxy certificate.
    X509,
    /// An S3 configuration file.
    S3,
    /// An SSH private key.
    Ssh,
    /// An iRODS environment file.
    Irods,
    /// A Google Storage key.
    GoogleStorage,
}

impl CredentialKind {
    /// Every credential kind.
    pub const ALL: [CredentialKind; 5] = [
        Self::X509,
        Self::S3,
        Self::Ssh,
        Self::Irods,
        Self::GoogleStorage,
    ];

    /// The environment variable data movers read the credential path from.
    pub fn variable(&self) -> &'static str {
        match self {
            Self::X509 => "X509_USER_PROXY",
            Self::S3 => "S3CFG",
            Self::Ssh => "SSH_PRIVATE_KEY",
            Self::Irods => "IRODS_ENVIRONMENT_FILE",
            Self::GoogleStorage => "GOOGLE_PKCS12",
        }
    }

    /// Determines the credential a URL needs from its scheme.
    pub fn for_url(url: &str) -> Option<Self> {
        let (scheme, _) = url.split_once("://")?;
        match scheme {
            "gsiftp" | "gridftp" => Some(Self::X509),
            "s3" | "s3s" => Some(Self::S3),
            "scp" | "sftp" => Some(Self::Ssh),
            "irods" => Some(Self::Irods),
            "gs" => Some(Self::GoogleStorage),
            _ => None,
        }
    }
}

/// A credential file on the submit host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// The kind of the credential.
    pub kind: CredentialKind,
    /// The path of the credential on the submit host.
    pub path: String,
}

/// Associates credentials with data movements.
pub trait CredentialHandler: Send + Sync {
    /// Gets the credential needed to move data to or from `url` for a job.
    fn credential_for(&self, job: &Job, url: &str) -> Option<Credential>;
}

/// A transformation catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct TransformationEntry {
    /// The complete transformation name.
    pub name: String,
    /// The site the transformation is installed on.
    pub site: String,
    /// The physical path.
    pub path: String,
}

/// A catalog held entirely in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct InMemoryCatalog {
    /// Sites keyed by handle.
    #[serde(default)]
    pub sites: IndexMap<String, SiteEntry>,
    /// Installed transformations.
    #[serde(default)]
    pub transformations: Vec<TransformationEntry>,
    /// Credential files on the submit host.
    #[serde(default)]
    pub credentials: IndexMap<CredentialKind, String>,
}

impl SiteCatalog for InMemoryCatalog {
    fn site(&self, handle: &str) -> Option<&SiteEntry> {
        self.sites.get(handle)
    }
}

impl TransformationCatalog for InMemoryCatalog {
    fn lookup(&self, transformation: &str, site: &str) -> Option<&str> {
        self.transformations
            .iter()
            .find(|e| e.name == transformation && e.site == site)
            .map(|e| e.path.as_str())
    }
}

impl CredentialHandler for InMemoryCatalog {
    fn credential_for(&self, _: &Job, url: &str) -> Option<Credential> {
        let kind = CredentialKind::for_url(url)?;
        let path = self.credentials.get(&kind)?;
        Some(Credential {
            kind,
            path: path.clone(),
        })
    }
}
