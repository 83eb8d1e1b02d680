//! Default priorities and concurrency groups for jobs.
//!
//! The tables are built once and handed to the assembler; nothing here is
//! global.

use std::collections::HashMap;
use std::fmt;

use crate::error::PolicyError;
use crate::job::Job;
use crate::job::JobClass;

/// The scheduler attribute holding a job's priority.
pub const PRIORITY_KEY: &str = "priority";

/// The scheduler attribute holding a job's concurrency limits.
pub const CONCURRENCY_LIMITS_KEY: &str = "concurrency_limits";

/// How the default priority of a job class is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityRule {
    /// A fixed priority.
    Fixed(i64),
    /// Ten times the job's depth in the workflow.
    Depth,
}

/// A named throttling group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyGroup {
    /// Data transfer jobs, subdivided by kind.
    Transfer(&'static str),
    /// Auxiliary jobs, subdivided by kind.
    Auxiliary(&'static str),
}

impl fmt::Display for ConcurrencyGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transfer(sub) => write!(f, "gw_transfer.{sub}"),
            Self::Auxiliary(sub) => write!(f, "gw_auxiliary.{sub}"),
        }
    }
}

/// The throttling applied to a job class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    /// Jobs of the class share a concurrency group.
    Group(ConcurrencyGroup),
    /// Jobs of the class are not throttled.
    Unthrottled,
}

/// Immutable priority and concurrency tables.
#[derive(Debug, Clone)]
pub struct PolicyTables {
    /// The priority rule of each known class.
    priorities: HashMap<JobClass, PriorityRule>,
    /// The throttle of each known class.
    throttles: HashMap<JobClass, Throttle>,
}

impl PolicyTables {
    /// Builds the default tables.
    pub fn new() -> Self {
        use ConcurrencyGroup::*;
        use JobClass::*;

        let priorities = HashMap::from([
            (StageIn, PriorityRule::Fixed(700)),
            (InterSiteTransfer, PriorityRule::Fixed(700)),
            (StageWorker, PriorityRule::Fixed(700)),
            (CreateDirectory, PriorityRule::Fixed(800)),
            (Chmod, PriorityRule::Fixed(800)),
            (StageOut, PriorityRule::Fixed(900)),
            (ReplicaRegistration, PriorityRule::Fixed(900)),
            (Cleanup, PriorityRule::Fixed(1000)),
            (Compute, PriorityRule::Depth),
            (SubWorkflow, PriorityRule::Depth),
            (Aggregated, PriorityRule::Depth),
        ]);

        let throttles = HashMap::from([
            (StageIn, Throttle::Group(Transfer("stagein"))),
            (StageOut, Throttle::Group(Transfer("stageout"))),
            (InterSiteTransfer, Throttle::Group(Transfer("inter"))),
            (StageWorker, Throttle::Group(Transfer("worker"))),
            (CreateDirectory, Throttle::Group(Auxiliary("createdir"))),
            (Cleanup, Throttle::Group(Auxiliary("cleanup"))),
            (ReplicaRegistration, Throttle::Group(Auxiliary("registration"))),
            (Chmod, Throttle::Group(Auxiliary("chmod"))),
            (Compute, Throttle::Unthrottled),
            (SubWorkflow, Throttle::Unthrottled),
            (Aggregated, Throttle::Unthrottled),
        ]);

        Self {
            priorities,
            throttles,
        }
    }

    /// Builds tables from explicit entries.
    pub fn from_entries(
        priorities: impl IntoIterator<Item = (JobClass, PriorityRule)>,
        throttles: impl IntoIterator<Item = (JobClass, Throttle)>,
    ) -> Self {
        Self {
            priorities: priorities.into_iter().collect(),
            throttles: throttles.into_iter().collect(),
        }
    }

    /// Computes the default priority of a job.
    pub fn default_priority(&self, class: JobClass, depth: u32) -> Result<i64, PolicyError> {
        match self.priorities.get(&class) {
            Some(PriorityRule::Fixed(p)) => Ok(*p),
            Some(PriorityRule::Depth) => Ok(i64::from(depth) * 10),
            None => Err(PolicyError::UnknownPriorityClass(class)),
        }
    }

    /// Gets the throttle of a job class.
    pub fn throttle(&self, class: JobClass) -> Result<Throttle, PolicyError> {
        self.throttles
            .get(&class)
            .copied()
            .ok_or(PolicyError::UnknownConcurrencyClass(class))
    }

    /// Assigns a priority to a job that has none and mirrors it into the
    /// meta-scheduler directives.
    pub fn assign_priority(&self, job: &mut Job) -> Result<(), PolicyError> {
        let priority = match job.attributes.get(PRIORITY_KEY) {
            Some(existing) => existing.trim().parse::<i64>().ok(),
            None => {
                let p = self.default_priority(job.class, job.depth)?;
                job.attributes.set(PRIORITY_KEY, p.to_string());
                Some(p)
            }
        };

        if job.dagman.priority.is_none() {
            job.dagman.priority = priority;
        }
        Ok(())
    }

    /// Adds the job to its concurrency group, if it has one.
    pub fn assign_concurrency(&self, job: &mut Job) -> Result<(), PolicyError> {
        if let Throttle::Group(group) = self.throttle(job.class)? {
            job.attributes
                .set_if_absent(CONCURRENCY_LIMITS_KEY, group.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use strum::IntoEnumIterator;

    use super::*;

    fn job(class: JobClass, depth: u32) -> Job {
        let mut job = Job::new("j", class, "/bin/true", "local");
        job.depth = depth;
        job
    }

    #[test]
    fn default_priorities() {
        let tables = PolicyTables::new();
        let cases = [
            (JobClass::StageIn, 700),
            (JobClass::InterSiteTransfer, 700),
            (JobClass::CreateDirectory, 800),
            (JobClass::Chmod, 800),
            (JobClass::StageOut, 900),
            (JobClass::ReplicaRegistration, 900),
            (JobClass::Cleanup, 1000),
            (JobClass::Compute, 30),
        ];
        for (class, expected) in cases {
            let mut j = job(class, 3);
            tables.assign_priority(&mut j).unwrap();
            assert_eq!(j.attributes.get(PRIORITY_KEY), Some(expected.to_string().as_str()));
            assert_eq!(j.dagman.priority, Some(expected));
        }
    }

    #[test]
    fn priority_is_idempotent() {
        let tables = PolicyTables::new();

        let mut explicit = job(JobClass::Cleanup, 2);
        explicit.attributes.set(PRIORITY_KEY, "5");
        for _ in 0..2 {
            tables.assign_priority(&mut explicit).unwrap();
            assert_eq!(explicit.attributes.get(PRIORITY_KEY), Some("5"));
        }
        assert_eq!(explicit.dagman.priority, Some(5));

        let mut implicit = job(JobClass::Compute, 4);
        tables.assign_priority(&mut implicit).unwrap();
        let first = implicit.clone();
        tables.assign_priority(&mut implicit).unwrap();
        assert_eq!(implicit, first);
        assert_eq!(implicit.attributes.get(PRIORITY_KEY), Some("40"));
    }

    #[test]
    fn explicit_dagman_priority_is_kept() {
        let tables = PolicyTables::new();
        let mut j = job(JobClass::StageIn, 0);
        j.dagman.priority = Some(1);
        tables.assign_priority(&mut j).unwrap();
        assert_eq!(j.attributes.get(PRIORITY_KEY), Some("700"));
        assert_eq!(j.dagman.priority, Some(1));
    }

    #[test]
    fn concurrency_is_complete() {
        let tables = PolicyTables::new();
        for class in JobClass::iter() {
            match tables.throttle(class) {
                Ok(Throttle::Group(group)) => assert!(!group.to_string().is_empty()),
                Ok(Throttle::Unthrottled) => assert!(matches!(
                    class,
                    JobClass::Compute | JobClass::SubWorkflow | JobClass::Aggregated
                )),
                Err(e) => {
                    assert_eq!(class, JobClass::Unassigned);
                    assert_eq!(e, PolicyError::UnknownConcurrencyClass(class));
                }
            }
        }
    }

    #[test]
    fn concurrency_groups() {
        let tables = PolicyTables::new();
        let cases = [
            (JobClass::StageIn, Some("gw_transfer.stagein")),
            (JobClass::StageOut, Some("gw_transfer.stageout")),
            (JobClass::InterSiteTransfer, Some("gw_transfer.inter")),
            (JobClass::StageWorker, Some("gw_transfer.worker")),
            (JobClass::CreateDirectory, Some("gw_auxiliary.createdir")),
            (JobClass::Cleanup, Some("gw_auxiliary.cleanup")),
            (JobClass::ReplicaRegistration, Some("gw_auxiliary.registration")),
            (JobClass::Chmod, Some("gw_auxiliary.chmod")),
            (JobClass::Compute, None),
            (JobClass::SubWorkflow, None),
        ];
        for (class, expected) in cases {
            let mut j = job(class, 0);
            tables.assign_concurrency(&mut j).unwrap();
            assert_eq!(j.attributes.get(CONCURRENCY_LIMITS_KEY), expected);
        }
    }

    #[test]
    fn unknown_class_is_a_policy_error() {
        let tables = PolicyTables::new();
        let mut j = job(JobClass::Unassigned, 0);
        assert_eq!(
            tables.assign_priority(&mut j).unwrap_err(),
            PolicyError::UnknownPriorityClass(JobClass::Unassigned)
        );
        assert_eq!(
            tables.assign_concurrency(&mut j).unwrap_err(),
            PolicyError::UnknownConcurrencyClass(JobClass::Unassigned)
        );

        let sparse = PolicyTables::from_entries([], [(JobClass::Compute, Throttle::Unthrottled)]);
        assert!(sparse.throttle(JobClass::StageIn).is_err());
        assert!(sparse.default_priority(JobClass::Compute, 1).is_err());
    }
}
