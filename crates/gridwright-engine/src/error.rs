//! Errors raised while generating submit artifacts.

use std::fmt;
use std::path::PathBuf;

use crate::job::JobClass;
use crate::quote::QuoteError;

/// A site capability a strategy could not resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    /// The instrumented launcher is not installed on the site.
    Launcher,
    /// A transformation has no physical location on the site.
    Executable(String),
    /// The location of the worker package for the site is unknown.
    WorkerPackage,
    /// The staging site has no file server to stage data through.
    FileServer,
    /// No bucket is configured for cloud batch submission.
    BatchBucket,
    /// The site has no remote gateway contact for the job's style.
    Gateway,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Launcher => write!(f, "instrumented launcher"),
            Self::Executable(name) => write!(f, "executable for transformation `{name}`"),
            Self::WorkerPackage => write!(f, "worker package location"),
            Self::FileServer => write!(f, "file server"),
            Self::BatchBucket => write!(f, "cloud batch bucket"),
            Self::Gateway => write!(f, "remote gateway contact"),
        }
    }
}

/// An error raised by the priority and concurrency tables.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// The job class has no priority entry.
    #[error("job class `{0}` has no priority entry")]
    UnknownPriorityClass(JobClass),
    /// The job class has no concurrency entry.
    #[error("job class `{0}` has no concurrency group entry")]
    UnknownConcurrencyClass(JobClass),
}

/// An error raised while generating submit artifacts for a job.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A site capability required by the job could not be resolved.
    #[error("job `{job}` cannot run on site `{site}`: no {capability} is available")]
    Capability {
        /// The job identifier.
        job: String,
        /// The site that lacks the capability.
        site: String,
        /// The missing capability.
        capability: Capability,
    },
    /// The job's arguments or hooks could not be quoted.
    #[error("failed to quote arguments of job `{job}`")]
    Grammar {
        /// The job identifier.
        job: String,
        /// The quoting error.
        #[source]
        source: QuoteError,
    },
    /// The policy tables do not know the job's class.
    #[error("policy lookup failed for job `{job}`")]
    Policy {
        /// The job identifier.
        job: String,
        /// The policy error.
        #[source]
        source: PolicyError,
    },
    /// A generated file could not be written.
    #[error("failed to write `{}`", .path.display())]
    Io {
        /// The path being written.
        path: PathBuf,
        /// The I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The job description is inconsistent with the requested strategy.
    #[error("invalid job `{job}`: {reason}")]
    InvalidJob {
        /// The job identifier.
        job: String,
        /// Why the job is invalid.
        reason: String,
    },
    /// A transfer list could not be serialized.
    #[error("failed to serialize a transfer list for job `{job}`")]
    Serialization {
        /// The job identifier.
        job: String,
        /// The serialization error.
        #[source]
        source: serde_json::Error,
    },
}

impl EngineError {
    /// Constructs an invalid job error.
    pub(crate) fn invalid(job: &str, reason: impl Into<String>) -> Self {
        Self::InvalidJob {
            job: job.to_string(),
            reason: reason.into(),
        }
    }

    /// Constructs an I/O error for a path.
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
