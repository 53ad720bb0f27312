//! Admission pre-checks for scale-up
//!
//! Before committing to new replicas the controller asks a
//! [`ResourceScheduler`] whether each one could be placed. The check is
//! advisory: nothing is reserved, so a later placement can still fail.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::ResourceRequirements;

/// Pre-flight capacity query
pub trait ResourceScheduler: Send + Sync {
    /// One entry per requirement: whether it could be placed alongside the
    /// ones before it
    fn can_schedule(&self, requirements: &[ResourceRequirements]) -> Vec<bool>;
}

/// Scheduler that admits everything
#[derive(Debug, Clone, Copy, Default)]
pub struct Unbounded;

impl ResourceScheduler for Unbounded {
    fn can_schedule(&self, requirements: &[ResourceRequirements]) -> Vec<bool> {
        vec![true; requirements.len()]
    }
}

// ============================================================================
// Cluster Resources
// ============================================================================

/// Capacity of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResources {
    pub name: String,

    #[serde(default)]
    pub cpus: f64,

    #[serde(default)]
    pub gpus: f64,

    #[serde(default)]
    pub memory_mb: u64,

    #[serde(default)]
    pub custom: BTreeMap<String, f64>,
}

impl NodeResources {
    /// Node with only CPU capacity
    pub fn new(name: impl Into<String>, cpus: f64) -> Self {
        Self {
            name: name.into(),
            cpus,
            gpus: 0.0,
            memory_mb: 0,
            custom: BTreeMap::new(),
        }
    }

    pub fn with_gpus(mut self, gpus: f64) -> Self {
        self.gpus = gpus;
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_custom(mut self, name: impl Into<String>, amount: f64) -> Self {
        self.custom.insert(name.into(), amount);
        self
    }

    fn fits(&self, req: &ResourceRequirements) -> bool {
        self.cpus >= req.cpus
            && self.gpus >= req.gpus
            && self.memory_mb >= req.memory_mb
            && req
                .custom
                .iter()
                .all(|(name, amount)| self.custom.get(name).copied().unwrap_or(0.0) >= *amount)
    }

    fn reserve(&mut self, req: &ResourceRequirements) {
        self.cpus -= req.cpus;
        self.gpus -= req.gpus;
        self.memory_mb -= req.memory_mb;
        for (name, amount) in &req.custom {
            if let Some(available) = self.custom.get_mut(name) {
                *available -= amount;
            }
        }
    }
}

/// Static view of cluster capacity
///
/// Requirements are packed greedily onto the first node with room, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterResources {
    nodes: Vec<NodeResources>,
}

impl ClusterResources {
    pub fn new(nodes: Vec<NodeResources>) -> Self {
        Self { nodes }
    }

    pub fn nodes(&self) -> &[NodeResources] {
        &self.nodes
    }

    /// Total CPUs across nodes
    pub fn total_cpus(&self) -> f64 {
        self.nodes.iter().map(|n| n.cpus).sum()
    }
}

impl ResourceScheduler for ClusterResources {
    fn can_schedule(&self, requirements: &[ResourceRequirements]) -> Vec<bool> {
        let mut remaining = self.nodes.clone();
        requirements
            .iter()
            .map(|req| match remaining.iter_mut().find(|node| node.fits(req)) {
                Some(node) => {
                    node.reserve(req);
                    true
                }
                None => false,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_admits_all() {
        let reqs = vec![ResourceRequirements::cpus(100.0); 3];
        assert_eq!(Unbounded.can_schedule(&reqs), vec![true, true, true]);
    }

    #[test]
    fn test_greedy_packing() {
        let cluster = ClusterResources::new(vec![
            NodeResources::new("a", 2.0),
            NodeResources::new("b", 1.0),
        ]);
        let reqs = vec![ResourceRequirements::cpus(1.0); 4];

        assert_eq!(cluster.can_schedule(&reqs), vec![true, true, true, false]);
    }

    #[test]
    fn test_check_reserves_nothing() {
        let cluster = ClusterResources::new(vec![NodeResources::new("a", 1.0)]);
        let reqs = vec![ResourceRequirements::cpus(1.0)];

        assert_eq!(cluster.can_schedule(&reqs), vec![true]);
        assert_eq!(cluster.can_schedule(&reqs), vec![true]);
        assert_eq!(cluster.total_cpus(), 1.0);
    }

    #[test]
    fn test_gpu_and_memory_limits() {
        let cluster = ClusterResources::new(vec![
            NodeResources::new("cpu-only", 8.0).with_memory_mb(4096),
            NodeResources::new("gpu", 8.0).with_gpus(1.0).with_memory_mb(1024),
        ]);
        let gpu_req = ResourceRequirements {
            gpus: 1.0,
            memory_mb: 512,
            ..ResourceRequirements::cpus(1.0)
        };

        assert_eq!(cluster.can_schedule(&[gpu_req.clone(), gpu_req]), vec![true, false]);
    }

    #[test]
    fn test_custom_resources() {
        let cluster = ClusterResources::new(vec![NodeResources::new("a", 4.0).with_custom("tpu", 1.0)]);
        let req = ResourceRequirements::cpus(1.0).with_custom("tpu", 1.0);
        let missing = ResourceRequirements::cpus(1.0).with_custom("fpga", 1.0);

        assert_eq!(cluster.can_schedule(&[req.clone(), req]), vec![true, false]);
        assert_eq!(cluster.can_schedule(&[missing]), vec![false]);
    }
}
