// Job Dependency Graph (DAG) Builder
// Resolves job-level `needs` into a DAG used for validation and scheduling order

use crate::workflow::models::{Job, Workflow};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

/// Error type for graph operations
#[derive(Debug, Clone)]
pub struct GraphError {
    pub message: String,
    pub kind: GraphErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// Circular dependency detected
    CyclicDependency,
    /// Reference to unknown job
    UnknownDependency,
    /// Invalid workflow structure
    InvalidStructure,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph error: {}", self.message)
    }
}

impl std::error::Error for GraphError {}

impl GraphError {
    pub fn cyclic(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::CyclicDependency,
        }
    }

    pub fn unknown_dependency(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::UnknownDependency,
        }
    }

    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::InvalidStructure,
        }
    }
}

/// A node representing a job in the graph
#[derive(Debug, Clone)]
pub struct JobNode {
    /// Job identifier (key in the workflow's `jobs` map)
    pub id: String,
    /// Job definition
    pub job: Job,
    /// Jobs this job depends on, deduplicated, in declaration order
    pub dependencies: Vec<String>,
}

/// Directed acyclic graph of the jobs in a workflow
#[derive(Debug, Clone)]
pub struct JobGraph {
    /// All jobs, sorted by id
    pub jobs: Vec<JobNode>,
    /// Quick lookup of job index by id
    job_indices: HashMap<String, usize>,
    /// Reverse edges: job id -> ids of jobs that need it
    dependents: HashMap<String, Vec<String>>,
}

impl JobGraph {
    /// Build a graph from a workflow, rejecting unknown `needs` and cycles
    pub fn from_workflow(workflow: &Workflow) -> Result<Self, GraphError> {
        if workflow.jobs.is_empty() {
            return Err(GraphError::invalid_structure("workflow has no jobs"));
        }

        let mut jobs = Vec::with_capacity(workflow.jobs.len());
        let mut job_indices = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

        for (i, (id, job)) in workflow.jobs.iter().enumerate() {
            let mut seen = HashSet::new();
            let mut dependencies = Vec::new();

            for dep in job.needs.to_vec() {
                if !workflow.jobs.contains_key(&dep) {
                    return Err(GraphError::unknown_dependency(format!(
                        "job '{}' depends on unknown job '{}'",
                        id, dep
                    )));
                }
                if dep == *id {
                    return Err(GraphError::cyclic(format!(
                        "circular dependency detected in jobs: {} -> {}",
                        id, id
                    )));
                }
                if seen.insert(dep.clone()) {
                    dependents.entry(dep.clone()).or_default().push(id.clone());
                    dependencies.push(dep);
                }
            }

            job_indices.insert(id.clone(), i);
            jobs.push(JobNode {
                id: id.clone(),
                job: job.clone(),
                dependencies,
            });
        }

        let graph = Self {
            jobs,
            job_indices,
            dependents,
        };

        graph.detect_cycles()?;

        Ok(graph)
    }

    /// Detect cycles in job dependencies using DFS
    fn detect_cycles(&self) -> Result<(), GraphError> {
        let mut visited = HashSet::new();
        let mut rec_stack = Vec::new();

        for node in &self.jobs {
            if !visited.contains(node.id.as_str()) {
                if let Some(cycle) = self.dfs_cycle(node, &mut visited, &mut rec_stack) {
                    return Err(GraphError::cyclic(format!(
                        "circular dependency detected in jobs: {}",
                        cycle.join(" -> ")
                    )));
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle<'a>(
        &'a self,
        node: &'a JobNode,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(node.id.as_str());
        rec_stack.push(node.id.as_str());

        for dep in &node.dependencies {
            if let Some(pos) = rec_stack.iter().position(|id| *id == dep.as_str()) {
                // Report the closed loop starting at the repeated job
                let mut cycle: Vec<String> =
                    rec_stack[pos..].iter().map(|s| s.to_string()).collect();
                cycle.push(dep.clone());
                return Some(cycle);
            }

            if !visited.contains(dep.as_str()) {
                if let Some(dep_node) = self.get_job(dep) {
                    if let Some(cycle) = self.dfs_cycle(dep_node, visited, rec_stack) {
                        return Some(cycle);
                    }
                }
            }
        }

        rec_stack.pop();
        None
    }

    /// Get jobs in topological order (dependencies first, ties broken by id)
    pub fn topological_order(&self) -> Vec<&JobNode> {
        // Kahn's algorithm with an ordered ready set
        let mut in_degree: HashMap<&str, usize> = self
            .jobs
            .iter()
            .map(|node| (node.id.as_str(), node.dependencies.len()))
            .collect();

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();

        let mut result = Vec::with_capacity(self.jobs.len());

        while let Some(id) = ready.pop_first() {
            if let Some(node) = self.get_job(id) {
                result.push(node);
            }

            for dependent in self.dependents(id) {
                if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(dependent.as_str());
                    }
                }
            }
        }

        result
    }

    /// Group jobs into levels; jobs within a level have no dependencies on each other
    pub fn parallel_levels(&self) -> Vec<Vec<&JobNode>> {
        let mut levels: Vec<Vec<&JobNode>> = Vec::new();
        let mut assigned: HashMap<&str, usize> = HashMap::new();

        for node in self.topological_order() {
            let level = node
                .dependencies
                .iter()
                .filter_map(|dep| assigned.get(dep.as_str()))
                .max()
                .map(|l| l + 1)
                .unwrap_or(0);

            assigned.insert(node.id.as_str(), level);

            if level >= levels.len() {
                levels.resize(level + 1, Vec::new());
            }
            levels[level].push(node);
        }

        levels
    }

    /// Get a job by id
    pub fn get_job(&self, id: &str) -> Option<&JobNode> {
        self.job_indices.get(id).map(|&idx| &self.jobs[idx])
    }

    /// Direct dependencies of a job
    pub fn dependencies(&self, id: &str) -> &[String] {
        self.get_job(id)
            .map(|node| node.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Jobs that directly need the given job
    pub fn dependents(&self, id: &str) -> &[String] {
        self.dependents
            .get(id)
            .map(|d| d.as_slice())
            .unwrap_or(&[])
    }

    /// Transitive dependencies of a job
    pub fn ancestors(&self, id: &str) -> BTreeSet<String> {
        let mut result = BTreeSet::new();
        let mut stack: Vec<&str> = self.dependencies(id).iter().map(String::as_str).collect();

        while let Some(current) = stack.pop() {
            if result.insert(current.to_string()) {
                stack.extend(self.dependencies(current).iter().map(String::as_str));
            }
        }

        result
    }

    /// Number of jobs in the graph
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::models::{JobNeeds, Trigger};

    use std::collections::BTreeMap;

    fn make_workflow(jobs: Vec<(&str, JobNeeds)>) -> Workflow {
        Workflow {
            name: Some("test".to_string()),
            on: Trigger::Single("push".to_string()),
            env: Default::default(),
            defaults: None,
            jobs: jobs
                .into_iter()
                .map(|(id, needs)| {
                    (
                        id.to_string(),
                        Job {
                            needs,
                            ..Default::default()
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn single(dep: &str) -> JobNeeds {
        JobNeeds::Single(dep.to_string())
    }

    fn multiple(deps: &[&str]) -> JobNeeds {
        JobNeeds::Multiple(deps.iter().map(|d| d.to_string()).collect())
    }

    fn ids(nodes: &[&JobNode]) -> Vec<String> {
        nodes.iter().map(|n| n.id.clone()).collect()
    }

    #[test]
    fn test_linear_chain() {
        let workflow = make_workflow(vec![
            ("build", JobNeeds::None),
            ("test", single("build")),
            ("deploy", single("test")),
        ]);

        let graph = JobGraph::from_workflow(&workflow).unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(
            ids(&graph.topological_order()),
            vec!["build", "test", "deploy"]
        );
        assert_eq!(graph.dependents("build"), &["test".to_string()]);
    }

    #[test]
    fn test_parallel_levels() {
        let workflow = make_workflow(vec![
            ("build", JobNeeds::None),
            ("unit", single("build")),
            ("integration", single("build")),
            ("deploy", multiple(&["unit", "integration"])),
        ]);

        let graph = JobGraph::from_workflow(&workflow).unwrap();
        let levels = graph.parallel_levels();

        assert_eq!(levels.len(), 3);
        assert_eq!(ids(&levels[0]), vec!["build"]);
        // Same level, ordered by id
        assert_eq!(ids(&levels[1]), vec!["integration", "unit"]);
        assert_eq!(ids(&levels[2]), vec!["deploy"]);
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let workflow = make_workflow(vec![
            ("a", multiple(&["d", "c"])),
            ("b", JobNeeds::None),
            ("c", single("b")),
            ("d", JobNeeds::None),
        ]);

        let graph = JobGraph::from_workflow(&workflow).unwrap();
        let order = ids(&graph.topological_order());
        let pos = |id: &str| order.iter().position(|o| o == id).unwrap();

        assert_eq!(order.len(), 4);
        for node in &graph.jobs {
            for dep in &node.dependencies {
                assert!(pos(dep) < pos(&node.id), "{} before {}", dep, node.id);
            }
        }
    }

    #[test]
    fn test_cycle_detection_names_path() {
        let workflow = make_workflow(vec![
            ("a", single("c")),
            ("b", single("a")),
            ("c", single("b")),
        ]);

        let err = JobGraph::from_workflow(&workflow).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::CyclicDependency);
        assert!(err.message.contains("a -> c -> b -> a"), "{}", err.message);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let workflow = make_workflow(vec![("a", single("a"))]);
        let err = JobGraph::from_workflow(&workflow).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::CyclicDependency);
    }

    #[test]
    fn test_unknown_dependency() {
        let workflow = make_workflow(vec![("build", JobNeeds::None), ("test", single("lint"))]);

        let err = JobGraph::from_workflow(&workflow).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::UnknownDependency);
        assert!(err.message.contains("'lint'"));
    }

    #[test]
    fn test_empty_workflow() {
        let workflow = make_workflow(vec![]);
        let err = JobGraph::from_workflow(&workflow).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::InvalidStructure);
    }

    #[test]
    fn test_duplicate_needs_are_collapsed() {
        let workflow = make_workflow(vec![
            ("build", JobNeeds::None),
            ("test", multiple(&["build", "build"])),
        ]);

        let graph = JobGraph::from_workflow(&workflow).unwrap();
        assert_eq!(graph.dependencies("test"), &["build".to_string()]);
        assert_eq!(graph.dependents("build").len(), 1);
    }

    #[test]
    fn test_ancestors() {
        let workflow = make_workflow(vec![
            ("a", JobNeeds::None),
            ("b", single("a")),
            ("c", single("b")),
            ("d", JobNeeds::None),
        ]);

        let graph = JobGraph::from_workflow(&workflow).unwrap();
        let ancestors: Vec<_> = graph.ancestors("c").into_iter().collect();
        assert_eq!(ancestors, vec!["a", "b"]);
        assert!(graph.ancestors("d").is_empty());
    }
}
