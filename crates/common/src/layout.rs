//! Step identifiers and step layouts.
//!
//! A [`StepLayout`] describes where the tasks of one job step run: which
//! nodes, how many tasks per node, the global task ids on each node and the
//! address of each node's daemon. All per-node arrays share the ordering of
//! the expanded node-name list.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hostlist::{Hostlist, HostlistError};

/// Upper bound on the number of tasks in one step.
pub const MAX_TASKS: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error(transparent)]
    Hostlist(#[from] HostlistError),
    #[error("step layout has no nodes")]
    NoNodes,
    #[error("node list names {names} nodes but the layout has {nodes}")]
    NodeNameCount { names: usize, nodes: usize },
    #[error("{addrs} node addresses given for {nodes} nodes")]
    AddressCount { addrs: usize, nodes: usize },
    #[error("task id {task} is outside the step's {total} tasks")]
    TaskOutOfRange { task: u32, total: usize },
    #[error("step has {total} tasks, more than the limit of {MAX_TASKS}")]
    TooManyTasks { total: u64 },
    #[error("task id {0} is assigned to more than one node")]
    DuplicateTask(u32),
    #[error("step {0} gives neither tasks_per_node nor task_ids")]
    MissingTasks(StepId),
    #[error("invalid step id '{0}', expected <job>[.<step>]")]
    InvalidStepId(String),
}

/// (job id, step id) pair naming one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId {
    pub job_id: u32,
    pub step_id: u32,
}

impl StepId {
    pub const fn new(job_id: u32, step_id: u32) -> Self {
        Self { job_id, step_id }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.job_id, self.step_id)
    }
}

impl FromStr for StepId {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LayoutError::InvalidStepId(s.to_string());
        let (job, step) = match s.trim().split_once('.') {
            Some((job, step)) => (job, step),
            None => (s.trim(), "0"),
        };
        Ok(Self {
            job_id: job.parse().map_err(|_| invalid())?,
            step_id: step.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepLayout {
    node_list: String,
    hosts: Hostlist,
    node_addrs: Vec<SocketAddr>,
    tids: Vec<Vec<u32>>,
    task_count: usize,
}

impl StepLayout {
    /// Builds a layout from explicit per-node task ids, checking that every
    /// per-node array lines up with the node list and that task ids are a
    /// partition of `0..task_count`.
    pub fn new(
        node_list: impl Into<String>,
        node_addrs: Vec<SocketAddr>,
        tids: Vec<Vec<u32>>,
    ) -> Result<Self, LayoutError> {
        let node_list = node_list.into();
        let hosts = Hostlist::parse(&node_list)?;
        let nodes = tids.len();
        if nodes == 0 {
            return Err(LayoutError::NoNodes);
        }
        if hosts.len() != nodes {
            return Err(LayoutError::NodeNameCount {
                names: hosts.len(),
                nodes,
            });
        }
        if node_addrs.len() != nodes {
            return Err(LayoutError::AddressCount {
                addrs: node_addrs.len(),
                nodes,
            });
        }

        let task_count: usize = tids.iter().map(Vec::len).sum();
        if task_count > MAX_TASKS {
            return Err(LayoutError::TooManyTasks {
                total: task_count as u64,
            });
        }
        let mut seen = HashSet::with_capacity(task_count);
        for &task in tids.iter().flatten() {
            if task as usize >= task_count {
                return Err(LayoutError::TaskOutOfRange {
                    task,
                    total: task_count,
                });
            }
            if !seen.insert(task) {
                return Err(LayoutError::DuplicateTask(task));
            }
        }

        Ok(Self {
            node_list,
            hosts,
            node_addrs,
            tids,
            task_count,
        })
    }

    /// Block distribution: node 0 gets the first `tasks_per_node[0]` ids, and so on.
    pub fn block(
        node_list: impl Into<String>,
        node_addrs: Vec<SocketAddr>,
        tasks_per_node: &[u32],
    ) -> Result<Self, LayoutError> {
        let total: u64 = tasks_per_node.iter().map(|&count| u64::from(count)).sum();
        if total > MAX_TASKS as u64 {
            return Err(LayoutError::TooManyTasks { total });
        }

        let mut next = 0u32;
        let tids = tasks_per_node
            .iter()
            .map(|&count| {
                let ids: Vec<u32> = (next..next + count).collect();
                next += count;
                ids
            })
            .collect();
        Self::new(node_list, node_addrs, tids)
    }

    pub fn node_count(&self) -> usize {
        self.tids.len()
    }

    pub fn task_count(&self) -> usize {
        self.task_count
    }

    /// Compact node-name list as published by the metadata service.
    pub fn node_list(&self) -> &str {
        &self.node_list
    }

    pub fn hosts(&self) -> &Hostlist {
        &self.hosts
    }

    pub fn node_addrs(&self) -> &[SocketAddr] {
        &self.node_addrs
    }

    pub fn tasks_on(&self, node: usize) -> usize {
        self.tids.get(node).map_or(0, Vec::len)
    }

    pub fn task_ids(&self, node: usize) -> &[u32] {
        self.tids.get(node).map(Vec::as_slice).unwrap_or_default()
    }

    /// Human-readable rendering of the layout, one line per entry.
    pub fn describe(&self) -> Vec<String> {
        let mut lines = vec![
            format!("node count = {}", self.node_count()),
            format!("total task count = {}", self.task_count),
            format!("node names = \"{}\"", self.node_list),
        ];
        for (node, name) in self.hosts.iter().enumerate() {
            lines.push(format!(
                "{}: node {}, tasks {}",
                name,
                node,
                self.tasks_on(node)
            ));
            for task in self.task_ids(node) {
                lines.push(format!("\ttask {}", task));
            }
        }
        lines
    }
}

/// One `[[step]]` table of a layout file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLayoutSpec {
    pub job_id: u32,
    #[serde(default)]
    pub step_id: u32,
    pub node_list: String,
    pub node_addrs: Vec<SocketAddr>,
    #[serde(default)]
    pub tasks_per_node: Option<Vec<u32>>,
    #[serde(default)]
    pub task_ids: Option<Vec<Vec<u32>>>,
}

impl StepLayoutSpec {
    pub fn step(&self) -> StepId {
        StepId::new(self.job_id, self.step_id)
    }

    pub fn into_layout(self) -> Result<(StepId, StepLayout), LayoutError> {
        let step = self.step();
        let layout = match (self.task_ids, self.tasks_per_node) {
            (Some(tids), _) => StepLayout::new(self.node_list, self.node_addrs, tids)?,
            (None, Some(counts)) => StepLayout::block(self.node_list, self.node_addrs, &counts)?,
            (None, None) => return Err(LayoutError::MissingTasks(step)),
        };
        Ok((step, layout))
    }
}

/// TOML file of known step layouts.
///
/// ```toml
/// [[step]]
/// job_id = 42
/// step_id = 0
/// node_list = "node[1-3]"
/// node_addrs = ["10.0.0.1:6818", "10.0.0.2:6818", "10.0.0.3:6818"]
/// tasks_per_node = [2, 2, 2]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepLayoutFile {
    #[serde(default, rename = "step")]
    pub steps: Vec<StepLayoutSpec>,
}

impl StepLayoutFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read layout file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse layout file {}", path.display()))
    }

    pub fn into_layouts(self) -> Result<Vec<(StepId, StepLayout)>> {
        self.steps
            .into_iter()
            .map(|spec| {
                let step = spec.step();
                spec.into_layout()
                    .with_context(|| format!("invalid layout for step {}", step))
            })
            .collect()
    }
}
