//! Turn pipeline graph
//!
//! A turn is a walk from the single entry stage to a terminal stage. Nodes
//! carry their own retry limit and timeout; edges carry a [`Guard`] that is
//! evaluated against the outcome of the stage just executed. The graph is
//! built and validated once, then shared read-only by every turn.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::config::EngineSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Begin,
    Recall,
    SkipRecall,
    Assemble,
    Generate,
    Postprocess,
    Persist,
    Done,
    Failed,
    FailedPersist,
}

impl Stage {
    pub const ALL: [Stage; 10] = [
        Stage::Begin,
        Stage::Recall,
        Stage::SkipRecall,
        Stage::Assemble,
        Stage::Generate,
        Stage::Postprocess,
        Stage::Persist,
        Stage::Done,
        Stage::Failed,
        Stage::FailedPersist,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed | Stage::FailedPersist)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Begin => "BEGIN",
            Stage::Recall => "RECALL",
            Stage::SkipRecall => "SKIP_RECALL",
            Stage::Assemble => "ASSEMBLE",
            Stage::Generate => "GENERATE",
            Stage::Postprocess => "POSTPROCESS",
            Stage::Persist => "PERSIST",
            Stage::Done => "DONE",
            Stage::Failed => "FAILED",
            Stage::FailedPersist => "FAILED_PERSIST",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Facts a guard may look at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conditions {
    pub memory_enabled: bool,
    /// Whether the stage just executed succeeded
    pub succeeded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Guard {
    Always,
    MemoryEnabled,
    MemoryDisabled,
    Succeeded,
    Failed,
}

impl Guard {
    pub fn holds(&self, conditions: Conditions) -> bool {
        match self {
            Guard::Always => true,
            Guard::MemoryEnabled => conditions.memory_enabled,
            Guard::MemoryDisabled => !conditions.memory_enabled,
            Guard::Succeeded => conditions.succeeded,
            Guard::Failed => !conditions.succeeded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSpec {
    pub stage: Stage,
    /// Attempts made in place before the stage counts as failed
    pub max_attempts: u32,
    pub timeout: Option<Duration>,
}

impl NodeSpec {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            max_attempts: 1,
            timeout: None,
        }
    }

    pub fn attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: Stage,
    pub to: Stage,
    pub guard: Guard,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Graph has no entry stage")]
    NoEntry,

    #[error("Graph has more than one entry stage: {0:?}")]
    MultipleEntries(Vec<Stage>),

    #[error("Stage {0} is declared twice")]
    DuplicateNode(Stage),

    #[error("Edge references undeclared stage {0}")]
    UnknownStage(Stage),

    #[error("Stage {0} must allow at least one attempt")]
    InvalidRetry(Stage),

    #[error("Terminal stage {0} has outgoing edges")]
    TerminalHasEdges(Stage),

    #[error("Stage {0} has no guard covering every outcome")]
    IncompleteGuards(Stage),

    #[error("Stage {0} is unreachable from the entry")]
    Unreachable(Stage),

    #[error("Cycle through stage {0}")]
    Cycle(Stage),
}

/// A validated, immutable pipeline graph
#[derive(Debug, Clone)]
pub struct Graph {
    entry: Stage,
    nodes: HashMap<Stage, NodeSpec>,
    edges: Vec<Edge>,
}

impl Graph {
    pub fn new(nodes: Vec<NodeSpec>, edges: Vec<Edge>) -> Result<Self, GraphError> {
        let mut by_stage = HashMap::with_capacity(nodes.len());
        for node in nodes {
            if node.max_attempts == 0 {
                return Err(GraphError::InvalidRetry(node.stage));
            }
            if by_stage.insert(node.stage, node).is_some() {
                return Err(GraphError::DuplicateNode(node.stage));
            }
        }

        for edge in &edges {
            for stage in [edge.from, edge.to] {
                if !by_stage.contains_key(&stage) {
                    return Err(GraphError::UnknownStage(stage));
                }
            }
        }

        let entry = find_entry(&by_stage, &edges)?;
        let graph = Self {
            entry,
            nodes: by_stage,
            edges,
        };
        graph.validate()?;
        Ok(graph)
    }

    /// The turn pipeline
    ///
    /// ```text
    /// BEGIN -> RECALL | SKIP_RECALL -> ASSEMBLE -> GENERATE -> POSTPROCESS -> PERSIST -> DONE
    ///                                      \-> FAILED   \-> FAILED               \-> FAILED_PERSIST
    /// ```
    pub fn standard(settings: &EngineSettings) -> Result<Self, GraphError> {
        let nodes = vec![
            NodeSpec::new(Stage::Begin),
            NodeSpec::new(Stage::Recall).timeout(Duration::from_secs(settings.recall_timeout_secs)),
            NodeSpec::new(Stage::SkipRecall),
            NodeSpec::new(Stage::Assemble),
            NodeSpec::new(Stage::Generate)
                .attempts(settings.generate_attempts)
                .timeout(Duration::from_secs(settings.generate_timeout_secs)),
            NodeSpec::new(Stage::Postprocess),
            NodeSpec::new(Stage::Persist).timeout(Duration::from_secs(settings.persist_timeout_secs)),
            NodeSpec::new(Stage::Done),
            NodeSpec::new(Stage::Failed),
            NodeSpec::new(Stage::FailedPersist),
        ];

        let edge = |from, to, guard| Edge { from, to, guard };
        let edges = vec![
            edge(Stage::Begin, Stage::Recall, Guard::MemoryEnabled),
            edge(Stage::Begin, Stage::SkipRecall, Guard::MemoryDisabled),
            edge(Stage::Recall, Stage::Assemble, Guard::Always),
            edge(Stage::SkipRecall, Stage::Assemble, Guard::Always),
            edge(Stage::Assemble, Stage::Generate, Guard::Succeeded),
            edge(Stage::Assemble, Stage::Failed, Guard::Failed),
            edge(Stage::Generate, Stage::Postprocess, Guard::Succeeded),
            edge(Stage::Generate, Stage::Failed, Guard::Failed),
            edge(Stage::Postprocess, Stage::Persist, Guard::Always),
            edge(Stage::Persist, Stage::Done, Guard::Succeeded),
            edge(Stage::Persist, Stage::FailedPersist, Guard::Failed),
        ];

        Self::new(nodes, edges)
    }

    pub fn entry(&self) -> Stage {
        self.entry
    }

    pub fn node(&self, stage: Stage) -> Option<&NodeSpec> {
        self.nodes.get(&stage)
    }

    /// The stage that follows `from`; first matching edge wins
    pub fn next(&self, from: Stage, conditions: Conditions) -> Option<Stage> {
        self.edges
            .iter()
            .find(|e| e.from == from && e.guard.holds(conditions))
            .map(|e| e.to)
    }

    /// Upper bound on steps in any walk through the graph
    pub fn max_steps(&self) -> usize {
        self.nodes.len()
    }

    fn validate(&self) -> Result<(), GraphError> {
        let every_condition = [
            Conditions { memory_enabled: true, succeeded: true },
            Conditions { memory_enabled: true, succeeded: false },
            Conditions { memory_enabled: false, succeeded: true },
            Conditions { memory_enabled: false, succeeded: false },
        ];

        let mut stages: Vec<Stage> = self.nodes.keys().copied().collect();
        stages.sort();

        for &stage in &stages {
            let outgoing = self.edges.iter().any(|e| e.from == stage);
            if stage.is_terminal() {
                if outgoing {
                    return Err(GraphError::TerminalHasEdges(stage));
                }
            } else if !every_condition.iter().all(|c| self.next(stage, *c).is_some()) {
                return Err(GraphError::IncompleteGuards(stage));
            }
        }

        let reachable = self.reachable();
        if let Some(stage) = stages.iter().find(|s| !reachable.contains(s)) {
            return Err(GraphError::Unreachable(*stage));
        }

        self.check_acyclic(&stages)
    }

    fn reachable(&self) -> HashSet<Stage> {
        let mut seen = HashSet::from([self.entry]);
        let mut stack = vec![self.entry];
        while let Some(stage) = stack.pop() {
            for edge in self.edges.iter().filter(|e| e.from == stage) {
                if seen.insert(edge.to) {
                    stack.push(edge.to);
                }
            }
        }
        seen
    }

    /// Depth-first search with an explicit on-path set
    fn check_acyclic(&self, stages: &[Stage]) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            OnPath,
            Done,
        }

        fn visit(graph: &Graph, stage: Stage, marks: &mut HashMap<Stage, Mark>) -> Result<(), GraphError> {
            match marks.get(&stage) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::OnPath) => return Err(GraphError::Cycle(stage)),
                None => {}
            }
            marks.insert(stage, Mark::OnPath);
            for edge in graph.edges.iter().filter(|e| e.from == stage) {
                visit(graph, edge.to, marks)?;
            }
            marks.insert(stage, Mark::Done);
            Ok(())
        }

        let mut marks = HashMap::new();
        for &stage in stages {
            visit(self, stage, &mut marks)?;
        }
        Ok(())
    }
}

fn find_entry(nodes: &HashMap<Stage, NodeSpec>, edges: &[Edge]) -> Result<Stage, GraphError> {
    let targets: HashSet<Stage> = edges.iter().map(|e| e.to).collect();
    let mut entries: Vec<Stage> = nodes.keys().filter(|s| !targets.contains(s)).copied().collect();
    entries.sort();

    match entries.len() {
        0 => Err(GraphError::NoEntry),
        1 => Ok(entries[0]),
        _ => Err(GraphError::MultipleEntries(entries)),
    }
}
