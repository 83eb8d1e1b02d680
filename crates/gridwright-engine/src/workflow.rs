//! Executable workflows handed to the engine.

use std::collections::HashMap;
use std::collections::HashSet;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use petgraph::graph::NodeIndex;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::error::EngineError;
use crate::error::EngineResult;
use crate::job::AggregatedJob;
use crate::job::Job;

/// An edge between two jobs of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Dependency {
    /// The identifier of the job that runs first.
    pub parent: String,
    /// The identifier of the job that runs after the parent.
    pub child: String,
}

/// The identity of a workflow as recorded in classads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowMetadata {
    /// The workflow's name.
    pub name: String,
    /// The workflow's identifier.
    pub uuid: Uuid,
    /// The identifier of the top-level workflow.
    pub root_uuid: Uuid,
}

/// A planned workflow: jobs, clustered jobs and the edges between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Workflow {
    /// The workflow's name; the DAG file is named after it.
    pub name: String,
    /// The workflow's identifier; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    /// The identifier of the top-level workflow; defaults to `uuid`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_uuid: Option<Uuid>,
    /// The jobs submitted on their own.
    #[serde(default)]
    pub jobs: Vec<Job>,
    /// The clustered jobs.
    #[serde(default)]
    pub clusters: Vec<AggregatedJob>,
    /// The edges between submitted jobs.
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

impl Workflow {
    /// Creates an empty workflow.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: None,
            root_uuid: None,
            jobs: Vec::new(),
            clusters: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    /// Gets the workflow's metadata, generating an identifier if the
    /// workflow has none.
    pub fn metadata(&mut self) -> WorkflowMetadata {
        let uuid = *self.uuid.get_or_insert_with(Uuid::new_v4);
        WorkflowMetadata {
            name: self.name.clone(),
            uuid,
            root_uuid: self.root_uuid.unwrap_or(uuid),
        }
    }

    /// Iterates the identifiers of the submitted jobs, clusters last.
    pub fn job_ids(&self) -> impl Iterator<Item = &str> {
        self.jobs
            .iter()
            .map(|j| j.id.as_str())
            .chain(self.clusters.iter().map(|c| c.job.id.as_str()))
    }

    /// Checks that identifiers are unique and that every edge names a
    /// submitted job.
    pub fn validate(&self) -> EngineResult<()> {
        let mut seen = HashSet::new();
        for id in self.job_ids() {
            if !seen.insert(id) {
                return Err(EngineError::invalid(
                    id,
                    "the job identifier appears more than once in the workflow",
                ));
            }
        }

        for cluster in &self.clusters {
            if cluster.constituents.is_empty() {
                return Err(EngineError::invalid(
                    &cluster.job.id,
                    "a clustered job must have at least one constituent",
                ));
            }
        }

        for dep in &self.dependencies {
            for id in [&dep.parent, &dep.child] {
                if !seen.contains(id.as_str()) {
                    return Err(EngineError::invalid(
                        id,
                        "a dependency names a job that is not in the workflow",
                    ));
                }
            }
        }

        Ok(())
    }

    /// Assigns a depth to every job that has none.
    ///
    /// Root jobs are at depth 1 and every other job is one deeper than its
    /// deepest parent. Constituents of a cluster take the cluster's depth.
    pub fn assign_depths(&mut self) -> EngineResult<()> {
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut indexes: HashMap<String, NodeIndex> = HashMap::new();
        for id in self.job_ids() {
            indexes.insert(id.to_string(), graph.add_node(id.to_string()));
        }

        for dep in &self.dependencies {
            if let (Some(p), Some(c)) = (indexes.get(&dep.parent), indexes.get(&dep.child)) {
                graph.update_edge(*p, *c, ());
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            EngineError::invalid(
                &graph[cycle.node_id()],
                "the job is part of a dependency cycle",
            )
        })?;

        let mut depths: HashMap<NodeIndex, u32> = HashMap::new();
        for index in order {
            let depth = graph
                .neighbors_directed(index, petgraph::Direction::Incoming)
                .filter_map(|p| depths.get(&p))
                .max()
                .map_or(1, |d| d + 1);
            depths.insert(index, depth);
        }

        let depth_of = |id: &str| indexes.get(id).and_then(|i| depths.get(i)).copied();
        for job in &mut self.jobs {
            if job.depth == 0
                && let Some(depth) = depth_of(&job.id)
            {
                job.depth = depth;
            }
        }

        for cluster in &mut self.clusters {
            if cluster.job.depth == 0
                && let Some(depth) = depth_of(&cluster.job.id)
            {
                cluster.job.depth = depth;
            }

            let depth = cluster.job.depth;
            for constituent in &mut cluster.constituents {
                if constituent.depth == 0 {
                    constituent.depth = depth;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::job::ClusterTool;
    use crate::job::JobClass;

    fn job(id: &str) -> Job {
        Job::new(id, JobClass::Compute, "/bin/true", "condorpool")
    }

    fn edge(parent: &str, child: &str) -> Dependency {
        Dependency {
            parent: parent.into(),
            child: child.into(),
        }
    }

    fn diamond() -> Workflow {
        let mut workflow = Workflow::new("diamond");
        workflow.jobs = vec![job("preprocess"), job("findrange_1"), job("findrange_2")];
        workflow.clusters.push(AggregatedJob::new(
            job("merge_cluster"),
            vec![job("analyze"), job("summarize")],
            ClusterTool::Sequencer,
        ));
        workflow.dependencies = vec![
            edge("preprocess", "findrange_1"),
            edge("preprocess", "findrange_2"),
            edge("findrange_1", "merge_cluster"),
            edge("findrange_2", "merge_cluster"),
        ];
        workflow
    }

    #[test]
    fn depths_follow_longest_path() {
        let mut workflow = diamond();
        workflow.jobs[2].depth = 7;
        workflow.validate().unwrap();
        workflow.assign_depths().unwrap();

        let depths: Vec<_> = workflow.jobs.iter().map(|j| j.depth).collect();
        assert_eq!(depths, [1, 2, 7]);
        assert_eq!(workflow.clusters[0].job.depth, 3);
        assert!(workflow.clusters[0].constituents.iter().all(|c| c.depth == 3));
    }

    #[test]
    fn cycles_are_invalid() {
        let mut workflow = diamond();
        workflow.dependencies.push(edge("merge_cluster", "preprocess"));
        let e = workflow.assign_depths().unwrap_err();
        assert!(e.to_string().contains("dependency cycle"));
    }

    #[test]
    fn validation() {
        let mut workflow = diamond();
        workflow.jobs.push(job("preprocess"));
        assert!(workflow.validate().unwrap_err().to_string().contains("more than once"));

        let mut workflow = diamond();
        workflow.dependencies.push(edge("preprocess", "ghost"));
        assert!(workflow.validate().unwrap_err().to_string().contains("`ghost`"));
    }

    #[test]
    fn root_uuid_defaults_to_uuid() {
        let mut workflow = diamond();
        let metadata = workflow.metadata();
        assert_eq!(metadata.uuid, metadata.root_uuid);
        assert_eq!(workflow.uuid, Some(metadata.uuid));
        assert_eq!(workflow.metadata(), metadata);
    }

    #[test]
    fn deserializes() {
        let workflow: Workflow = serde_json::from_str(
            r#"{
                "name": "diamond",
                "jobs": [{ "id": "a", "class": "compute", "executable": "/bin/true", "site": "local" }],
                "dependencies": []
            }"#,
        )
        .unwrap();
        assert_eq!(workflow.jobs.len(), 1);
        assert!(workflow.uuid.is_none());
    }
}
