//! Guard selection and onion path cache. Guards are checked by the host; this module only
//! tracks which candidates were accepted and how paths are assembled and repaired.

use std::collections::HashMap;

use rand::seq::{IteratorRandom, SliceRandom};
use tracing::{debug, info, warn};

use crate::error::NodeError;
use crate::node::{Node, Path};

pub const DEFAULT_GUARD_COUNT: usize = 2;
pub const DEFAULT_PATH_COUNT: usize = 2;
/// Hops per path, guard included.
pub const PATH_LENGTH: usize = 3;
pub const DEFAULT_PATH_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone)]
pub struct PathConfig {
    pub guard_count: usize,
    pub path_count: usize,
    pub failure_threshold: u32,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            guard_count: DEFAULT_GUARD_COUNT,
            path_count: DEFAULT_PATH_COUNT,
            failure_threshold: DEFAULT_PATH_FAILURE_THRESHOLD,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    #[error("insufficient nodes to build paths (need {needed}, have {available})")]
    InsufficientNodes { needed: usize, available: usize },
}

impl From<PathError> for NodeError {
    fn from(_: PathError) -> Self {
        NodeError::InsufficientNodes
    }
}

/// Result of repairing a path around an unreachable hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopRepair {
    pub removed: Node,
    /// The rebuilt path, or `None` if no spare node was available and the path was dropped.
    pub path: Option<Path>,
}

#[derive(Default)]
pub struct PathCache {
    config: PathConfig,
    guards: Vec<Node>,
    paths: Vec<Path>,
    failures: HashMap<Path, u32>,
}

impl PathCache {
    pub fn new(config: PathConfig) -> Self {
        Self {
            config,
            guards: Vec::new(),
            paths: Vec::new(),
            failures: HashMap::new(),
        }
    }

    pub fn guards(&self) -> &[Node] {
        &self.guards
    }

    pub fn paths(&self) -> &[Path] {
        &self.paths
    }

    pub fn needs_guards(&self) -> bool {
        self.guards.len() < self.config.guard_count
    }

    /// Up to `count` random pool nodes that are not guards and have not been tried yet.
    pub fn guard_candidates(&self, pool: &[Node], tried: &[Node], count: usize) -> Vec<Node> {
        pool.iter()
            .filter(|n| !self.guards.contains(n) && !tried.contains(n))
            .cloned()
            .choose_multiple(&mut rand::thread_rng(), count)
    }

    /// Accept a checked candidate. Returns false once enough guards are held or on duplicates.
    pub fn accept_guard(&mut self, node: Node) -> bool {
        if !self.needs_guards() || self.guards.contains(&node) {
            return false;
        }
        info!(guard = %node, "guard accepted");
        self.guards.push(node);
        true
    }

    /// One path per guard, each completed with two distinct non-guard nodes used by no other path.
    pub fn build_paths(&mut self, pool: &[Node]) -> Result<Vec<Path>, PathError> {
        let mut spare: Vec<Node> = pool
            .iter()
            .filter(|n| !self.guards.contains(n))
            .cloned()
            .collect();
        let needed = self.guards.len() * (PATH_LENGTH - 1);
        if self.guards.is_empty() || spare.len() < needed {
            warn!(needed, available = spare.len(), "not enough nodes to build paths");
            return Err(PathError::InsufficientNodes {
                needed: needed.max(PATH_LENGTH - 1),
                available: spare.len(),
            });
        }
        spare.shuffle(&mut rand::thread_rng());
        let mut paths = Vec::with_capacity(self.guards.len());
        for guard in &self.guards {
            // Checked above: `spare` holds two nodes per guard.
            let (Some(hop1), Some(hop2)) = (spare.pop(), spare.pop()) else {
                break;
            };
            paths.push(Path::new(guard.clone(), hop1, hop2));
        }
        for path in &paths {
            info!(path = %path, "onion path built");
        }
        self.failures.clear();
        self.paths = paths.clone();
        Ok(paths)
    }

    /// The target number of paths is cached.
    pub fn has_enough_paths(&self) -> bool {
        self.paths.len() >= self.config.path_count
    }

    /// A cached path that does not contain `exclude`. `None` when fewer than the target
    /// number of paths are cached or every path contains the excluded node.
    pub fn path(&self, exclude: Option<&Node>) -> Option<Path> {
        if !self.has_enough_paths() {
            return None;
        }
        self.paths
            .iter()
            .filter(|p| exclude.map_or(true, |n| !p.contains(n)))
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    /// Count a failure against a path. Returns true when the path was dropped.
    pub fn record_path_failure(&mut self, path: &Path) -> bool {
        let count = self.failures.entry(path.clone()).or_insert(0);
        *count += 1;
        debug!(path = %path, failures = *count, "path failure recorded");
        if *count >= self.config.failure_threshold {
            self.drop_path(path);
            true
        } else {
            false
        }
    }

    /// Remove a path and retire its guard.
    pub fn drop_path(&mut self, path: &Path) {
        self.failures.remove(path);
        self.paths.retain(|p| p != path);
        self.guards.retain(|g| *g != path.guard);
        info!(path = %path, "onion path dropped");
    }

    /// Replace the hop whose ed25519 key matches with a node unused by any path or guard.
    pub fn repair_hop(&mut self, ed25519: &str, pool: &[Node]) -> Option<HopRepair> {
        let index = self
            .paths
            .iter()
            .position(|p| p.nodes().iter().any(|n| n.ed25519() == Some(ed25519)))?;
        let old = self.paths[index].clone();
        let removed = old
            .nodes()
            .into_iter()
            .find(|n| n.ed25519() == Some(ed25519))?
            .clone();
        if removed == old.guard {
            self.drop_path(&old);
            return Some(HopRepair { removed, path: None });
        }
        let replacement = pool
            .iter()
            .filter(|n| {
                **n != removed
                    && !self.guards.contains(n)
                    && !self.paths.iter().any(|p| p.contains(n))
            })
            .choose(&mut rand::thread_rng())
            .cloned();
        let Some(replacement) = replacement else {
            self.drop_path(&old);
            return Some(HopRepair { removed, path: None });
        };
        let mut repaired = old.clone();
        if repaired.hop1 == removed {
            repaired.hop1 = replacement;
        } else {
            repaired.hop2 = replacement;
        }
        self.failures.remove(&old);
        self.paths[index] = repaired.clone();
        info!(removed = %removed, path = %repaired, "onion path repaired");
        Some(HopRepair {
            removed,
            path: Some(repaired),
        })
    }

    /// Reinstate persisted paths and their guards.
    pub fn restore(&mut self, paths: Vec<Path>) {
        self.guards = paths.iter().map(|p| p.guard.clone()).collect();
        self.paths = paths;
        self.failures.clear();
    }

    /// Forget guards and paths, e.g. after the pool was replaced.
    pub fn invalidate(&mut self) {
        self.guards.clear();
        self.paths.clear();
        self.failures.clear();
    }
}
