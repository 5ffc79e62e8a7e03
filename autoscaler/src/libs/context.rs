//! The state for a single scaling cycle
//!
//! Every cycle starts from a fresh snapshot of the cluster. The sets here are only mutated by
//! the sequential matching pass so nodes can't be claimed twice within one cycle.

use std::collections::HashSet;

use crate::conf::ClusterSettings;
use crate::models::{ComputeNode, InstanceProfile, PipelinePod};

/// The counts of what happened in a single cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// The size of the cluster at the end of this cycle
    pub cluster_size: usize,
    /// The number of provisioning tasks in flight at the end of this cycle
    pub in_flight: usize,
    /// The number of runs we are tracking retries for
    pub queued: usize,
    /// The number of provisioning tasks dispatched for runs
    pub dispatched: usize,
    /// The number of idle nodes reassigned to runs
    pub reassigned: usize,
    /// The number of runs bound to instances that already existed
    pub recovered: usize,
    /// The number of runs left pending for a later cycle
    pub deferred: usize,
    /// The number of runs failed out
    pub failed: usize,
    /// The number of nodes terminated
    pub terminated: usize,
    /// The number of idle nodes kept for deferred runs
    pub reserved: usize,
    /// The number of warm pool nodes dispatched
    pub warm_dispatched: usize,
}

/// The snapshot and claims for a single cycle
#[derive(Debug)]
pub struct CycleContext {
    /// The cluster settings for this cycle
    pub settings: ClusterSettings,
    /// The nodes that existed when this cycle started
    pub nodes: Vec<ComputeNode>,
    /// The run ids labeled on our nodes
    pub node_runs: HashSet<String>,
    /// The names of all pipeline pods
    pub pods: HashSet<String>,
    /// The nodes reassigned to a new run this cycle
    pub reassigned: HashSet<String>,
    /// The runs that were given a node this cycle
    pub scheduled: HashSet<String>,
    /// The nodes terminated this cycle
    pub evicted: HashSet<String>,
    /// The requirements of runs we could not find a node for this cycle
    pub deferred: Vec<InstanceProfile>,
    /// What has happened this cycle so far
    pub report: CycleReport,
}

impl CycleContext {
    /// Start a new cycle from a snapshot of the cluster
    ///
    /// # Arguments
    ///
    /// * `settings` - The cluster settings for this cycle
    /// * `nodes` - The nodes currently in the cluster
    /// * `pods` - The pipeline pods currently in the cluster
    pub fn new(settings: ClusterSettings, nodes: Vec<ComputeNode>, pods: &[PipelinePod]) -> Self {
        // get the run ids for all of our nodes
        let node_runs = nodes.iter().map(|node| node.run_id.clone()).collect();
        // get the names of all of our pods
        let pods = pods.iter().map(|pod| pod.name.clone()).collect();
        CycleContext {
            settings,
            nodes,
            node_runs,
            pods,
            reassigned: HashSet::default(),
            scheduled: HashSet::default(),
            evicted: HashSet::default(),
            deferred: Vec::default(),
            report: CycleReport::default(),
        }
    }

    /// Whether a node is not bound to a pod and has not been claimed this cycle
    ///
    /// # Arguments
    ///
    /// * `node` - The node to check
    pub fn is_idle(&self, node: &ComputeNode) -> bool {
        !node.paused
            && !self.pods.contains(&node.run_id)
            && !self.scheduled.contains(&node.run_id)
            && !self.reassigned.contains(&node.name)
            && !self.evicted.contains(&node.name)
    }

    /// Get the idle nodes that could be handed to a new run
    pub fn idle_nodes(&self) -> Vec<ComputeNode> {
        self.nodes
            .iter()
            .filter(|node| self.is_idle(node))
            .cloned()
            .collect()
    }

    /// Get the current size of the cluster
    ///
    /// # Arguments
    ///
    /// * `in_flight` - The number of nodes currently being provisioned
    pub fn cluster_size(&self, in_flight: usize) -> usize {
        // nodes we terminated this cycle no longer count even if they still show up
        let alive = self
            .nodes
            .iter()
            .filter(|node| !self.evicted.contains(&node.name))
            .count();
        alive + in_flight
    }

    /// Mark a node as terminated this cycle
    ///
    /// # Arguments
    ///
    /// * `node` - The name of the node that was terminated
    pub fn evict(&mut self, node: &str) {
        // only count each node once
        if self.evicted.insert(node.to_owned()) {
            self.report.terminated += 1;
        }
    }

    /// Claim a deferred requirement that an idle node could fill
    ///
    /// Returns true if a matching requirement was found and removed.
    ///
    /// # Arguments
    ///
    /// * `profile` - The profile of the idle node
    pub fn take_deferred(&mut self, profile: &InstanceProfile) -> bool {
        match self.deferred.iter().position(|req| req.matches(profile)) {
            Some(index) => {
                self.deferred.swap_remove(index);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CycleContext;
    use crate::conf::ClusterSettings;
    use crate::models::{ComputeNode, InstanceProfile, PipelinePod};

    #[test]
    fn idle_nodes_skip_bound_and_claimed() {
        let nodes = vec![
            ComputeNode::new("node-1", "1"),
            ComputeNode::new("node-2", "2"),
            ComputeNode::new("node-3", "p-3"),
            ComputeNode::new("node-4", "4").paused(),
        ];
        let pods = vec![PipelinePod::unschedulable("1")];
        let mut ctx = CycleContext::new(ClusterSettings::default(), nodes, &pods);
        ctx.reassigned.insert("node-2".to_owned());
        let idle = ctx.idle_nodes();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].name, "node-3");
    }

    #[test]
    fn evicted_nodes_leave_the_cluster_size() {
        let nodes = vec![ComputeNode::new("node-1", "1"), ComputeNode::new("node-2", "2")];
        let mut ctx = CycleContext::new(ClusterSettings::default(), nodes, &[]);
        assert_eq!(ctx.cluster_size(1), 3);
        ctx.evict("node-1");
        ctx.evict("node-1");
        assert_eq!(ctx.cluster_size(1), 2);
        assert_eq!(ctx.report.terminated, 1);
    }

    #[test]
    fn deferred_requirements_are_taken_once() {
        let mut ctx = CycleContext::new(ClusterSettings::default(), Vec::default(), &[]);
        let profile = InstanceProfile::new("m5.large", 50, "img");
        ctx.deferred.push(profile.clone());
        assert!(ctx.take_deferred(&profile.clone().assigned("i-1", "10.0.0.1", "node-1")));
        assert!(!ctx.take_deferred(&profile));
    }
}
