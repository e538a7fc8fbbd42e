use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use taskgrade_dag::{ExecutionGraph, ExecutionId, FileId};

/// A structural defect of an execution graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// An execution reads a file that nothing provides or produces.
    #[error("file {id} ({description}) is read but never provided nor produced")]
    MissingFile {
        /// The id of the missing file.
        id: FileId,
        /// What reads it.
        description: String,
    },
    /// A file is produced by more than one execution, or both provided and
    /// produced.
    #[error("file {id} has more than one producer")]
    DuplicateProducer {
        /// The id of the file.
        id: FileId,
    },
    /// The graph contains a dependency cycle.
    #[error("dependency cycle detected, '{description}' is in the cycle")]
    CycleDetected {
        /// The description of an execution inside the cycle.
        description: String,
    },
}

/// Validate the structure of a graph: every file has exactly one producer,
/// every dependency is known and the dependencies form no cycle.
pub fn check_graph(graph: &ExecutionGraph) -> Result<(), GraphError> {
    let mut known_files: HashSet<FileId> = HashSet::new();
    for id in graph.provided_files.keys() {
        if !known_files.insert(*id) {
            return Err(GraphError::DuplicateProducer { id: *id });
        }
    }
    for execution in &graph.executions {
        for output in execution.produces() {
            if !known_files.insert(output) {
                return Err(GraphError::DuplicateProducer { id: output });
            }
        }
    }
    for execution in &graph.executions {
        for dep in execution.dependencies() {
            if !known_files.contains(&dep) {
                return Err(GraphError::MissingFile {
                    id: dep,
                    description: format!("dependency of '{}'", execution.description),
                });
            }
        }
    }

    // Kahn visit over the file lattice: executions whose inputs never become
    // ready are part of a cycle
    let mut dependents: HashMap<FileId, Vec<ExecutionId>> = HashMap::new();
    let mut missing: HashMap<ExecutionId, usize> = HashMap::new();
    let mut ready_execs: VecDeque<ExecutionId> = VecDeque::new();
    let mut ready_files: VecDeque<FileId> = graph.provided_files.keys().copied().collect();
    for (id, execution) in graph.executions.iter().enumerate() {
        let deps = execution.dependencies();
        if deps.is_empty() {
            ready_execs.push_back(id);
        } else {
            missing.insert(id, deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(id);
            }
        }
    }
    while !ready_execs.is_empty() || !ready_files.is_empty() {
        while let Some(file) = ready_files.pop_front() {
            for exec in dependents.remove(&file).unwrap_or_default() {
                let count = missing.get_mut(&exec).expect("missing count vanished");
                *count -= 1;
                if *count == 0 {
                    missing.remove(&exec);
                    ready_execs.push_back(exec);
                }
            }
        }
        while let Some(exec) = ready_execs.pop_front() {
            for output in graph.executions[exec].produces() {
                ready_files.push_back(output);
            }
        }
    }
    if let Some((&exec, _)) = missing.iter().next() {
        return Err(GraphError::CycleDetected {
            description: graph.executions[exec].description.clone(),
        });
    }
    Ok(())
}
