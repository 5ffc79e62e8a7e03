//! In memory backends for dry runs and tests
//!
//! These pretend to be a cluster, a cloud and a run store. They record every command they are
//! given and can be scripted to fail so the engine can be exercised without real infrastructure.

use chrono::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use super::{CloudProvider, Orchestrator, RunStore};
use crate::Error;
use crate::libs::helpers;
use crate::models::{
    ComputeNode, Disk, InstanceProfile, PAUSED_LABEL, PipelinePod, RUN_ID_LABEL, Run, RunStatus,
};

/// The state of a pretend cluster
#[derive(Debug, Default)]
pub struct ClusterState {
    /// The nodes in this cluster by name
    pub nodes: BTreeMap<String, ComputeNode>,
    /// The pipeline pods in this cluster in the order they were added
    pub pods: Vec<PipelinePod>,
    /// The pods that were deleted
    pub deleted_pods: Vec<String>,
    /// The labels that were set on nodes
    pub labels: Vec<(String, String, String)>,
}

/// A pretend cluster
#[derive(Debug, Clone, Default)]
pub struct DryRunCluster {
    /// The shared state of this cluster
    state: Arc<Mutex<ClusterState>>,
    /// Whether connecting to this cluster should fail
    offline: Arc<AtomicBool>,
}

impl DryRunCluster {
    /// Add a node to this cluster
    ///
    /// # Arguments
    ///
    /// * `node` - The node to add
    pub fn add_node(&self, node: ComputeNode) {
        helpers::lock(&self.state)
            .nodes
            .insert(node.name.clone(), node);
    }

    /// Add a pod to this cluster
    ///
    /// # Arguments
    ///
    /// * `pod` - The pod to add
    pub fn add_pod(&self, pod: PipelinePod) {
        helpers::lock(&self.state).pods.push(pod);
    }

    /// Remove a node from this cluster
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the node to remove
    pub fn remove_node(&self, name: &str) -> Option<ComputeNode> {
        helpers::lock(&self.state).nodes.remove(name)
    }

    /// Get the nodes in this cluster
    pub fn nodes(&self) -> Vec<ComputeNode> {
        helpers::lock(&self.state).nodes.values().cloned().collect()
    }

    /// Get the pods in this cluster
    pub fn pods(&self) -> Vec<PipelinePod> {
        helpers::lock(&self.state).pods.clone()
    }

    /// Get the names of the pods that were deleted
    pub fn deleted_pods(&self) -> Vec<String> {
        helpers::lock(&self.state).deleted_pods.clone()
    }

    /// Get the labels that were set on nodes
    pub fn labels(&self) -> Vec<(String, String, String)> {
        helpers::lock(&self.state).labels.clone()
    }

    /// Set whether connecting to this cluster fails
    ///
    /// # Arguments
    ///
    /// * `offline` - Whether this cluster is unreachable
    pub fn offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Relabel the node bound to a run
    ///
    /// Returns false if no node was bound to that run.
    ///
    /// # Arguments
    ///
    /// * `old_id` - The run id the node is labeled with
    /// * `new_id` - The run id to label the node with
    fn relabel(&self, old_id: &str, new_id: &str) -> bool {
        let mut state = helpers::lock(&self.state);
        match state.nodes.values_mut().find(|node| node.run_id == old_id) {
            Some(node) => {
                node.run_id = new_id.to_owned();
                true
            }
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl Orchestrator for DryRunCluster {
    async fn connect(&self) -> Result<(), Error> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::new("Dry run cluster is offline"));
        }
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<ComputeNode>, Error> {
        Ok(self.nodes())
    }

    async fn list_pods(&self) -> Result<Vec<PipelinePod>, Error> {
        Ok(self.pods())
    }

    async fn delete_pod(&self, name: &str) -> Result<(), Error> {
        let mut state = helpers::lock(&self.state);
        state.pods.retain(|pod| pod.name != name);
        state.deleted_pods.push(name.to_owned());
        Ok(())
    }

    async fn label_node(&self, node: &str, label: &str, value: &str) -> Result<(), Error> {
        let mut state = helpers::lock(&self.state);
        state
            .labels
            .push((node.to_owned(), label.to_owned(), value.to_owned()));
        // apply the labels we understand
        if let Some(target) = state.nodes.get_mut(node) {
            match label {
                RUN_ID_LABEL => target.run_id = value.to_owned(),
                PAUSED_LABEL => target.paused = true,
                _ => (),
            }
        }
        Ok(())
    }
}

/// The state of a pretend cloud
#[derive(Debug, Default)]
pub struct CloudState {
    /// The instances that exist for runs
    pub instances: HashMap<String, InstanceProfile>,
    /// The exit codes to fail upcoming provisioning calls with
    pub up_failures: VecDeque<Option<i32>>,
    /// The results to give for reassigning nodes by their current run id
    pub reassign_results: HashMap<String, bool>,
    /// The nodes that are at the end of their billing period
    pub expired: HashSet<String>,
    /// The disks attached to every node
    pub disks: Vec<Disk>,
    /// The runs nodes were provisioned for
    pub scale_ups: Vec<(String, InstanceProfile)>,
    /// The warm pool nodes that were provisioned
    pub free_ups: Vec<(String, InstanceProfile)>,
    /// The nodes that were terminated
    pub scale_downs: Vec<String>,
    /// The reassignments that were attempted
    pub reassigns: Vec<(String, String)>,
}

/// A pretend cloud that provisions nodes into a pretend cluster
#[derive(Debug, Clone)]
pub struct DryRunCloud {
    /// The cluster our nodes show up in
    cluster: DryRunCluster,
    /// The shared state of this cloud
    state: Arc<Mutex<CloudState>>,
    /// Provisioning waits until this is open
    gate: Arc<watch::Sender<bool>>,
    /// The counter for node names
    counter: Arc<AtomicU64>,
}

impl DryRunCloud {
    /// Create a pretend cloud for a pretend cluster
    ///
    /// # Arguments
    ///
    /// * `cluster` - The cluster to provision nodes into
    pub fn new(cluster: &DryRunCluster) -> Self {
        let (gate, _) = watch::channel(true);
        DryRunCloud {
            cluster: cluster.clone(),
            state: Arc::new(Mutex::new(CloudState::default())),
            gate: Arc::new(gate),
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Make provisioning calls wait until [`DryRunCloud::release`] is called
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    /// Let any waiting provisioning calls continue
    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Fail the next provisioning call
    ///
    /// # Arguments
    ///
    /// * `code` - The exit code to fail with
    pub fn fail_next_up(&self, code: Option<i32>) {
        helpers::lock(&self.state).up_failures.push_back(code);
    }

    /// Pretend an instance already exists for a run
    ///
    /// # Arguments
    ///
    /// * `run_id` - The run this instance was created for
    /// * `instance` - The instance that exists
    pub fn add_instance(&self, run_id: &str, instance: InstanceProfile) {
        helpers::lock(&self.state)
            .instances
            .insert(run_id.to_owned(), instance);
    }

    /// Set the result of reassigning the node bound to a run
    ///
    /// # Arguments
    ///
    /// * `old_id` - The run id the node is labeled with
    /// * `result` - Whether reassigning it works
    pub fn reassign_result(&self, old_id: &str, result: bool) {
        helpers::lock(&self.state)
            .reassign_results
            .insert(old_id.to_owned(), result);
    }

    /// Mark a node as at the end of its billing period
    ///
    /// # Arguments
    ///
    /// * `node` - The name of the node
    pub fn expire(&self, node: &str) {
        helpers::lock(&self.state).expired.insert(node.to_owned());
    }

    /// Set the disks attached to every node
    ///
    /// # Arguments
    ///
    /// * `disks` - The disks to report
    pub fn set_disks(&self, disks: Vec<Disk>) {
        helpers::lock(&self.state).disks = disks;
    }

    /// Get the runs nodes were provisioned for
    pub fn scale_ups(&self) -> Vec<(String, InstanceProfile)> {
        helpers::lock(&self.state).scale_ups.clone()
    }

    /// Get the warm pool nodes that were provisioned
    pub fn free_ups(&self) -> Vec<(String, InstanceProfile)> {
        helpers::lock(&self.state).free_ups.clone()
    }

    /// Get the nodes that were terminated
    pub fn scale_downs(&self) -> Vec<String> {
        helpers::lock(&self.state).scale_downs.clone()
    }

    /// Get the reassignments that were attempted
    pub fn reassigns(&self) -> Vec<(String, String)> {
        helpers::lock(&self.state).reassigns.clone()
    }

    /// Wait until provisioning is allowed
    async fn wait_for_gate(&self) -> Result<(), Error> {
        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map_err(|err| Error::new(format!("Dry run gate closed: {err}")))?;
        Ok(())
    }

    /// Build a new node name
    fn next_name(&self) -> String {
        format!("dry-run-node-{}", self.counter.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait::async_trait]
impl CloudProvider for DryRunCloud {
    async fn describe_instance(
        &self,
        run_id: &str,
        profile: &InstanceProfile,
    ) -> Result<Option<InstanceProfile>, Error> {
        let state = helpers::lock(&self.state);
        Ok(state
            .instances
            .get(run_id)
            .filter(|instance| instance.matches(profile))
            .cloned())
    }

    async fn scale_up_node(
        &self,
        run_id: &str,
        profile: &InstanceProfile,
    ) -> Result<InstanceProfile, Error> {
        helpers::lock(&self.state)
            .scale_ups
            .push((run_id.to_owned(), profile.clone()));
        self.wait_for_gate().await?;
        // fail this call if we were told to
        if let Some(code) = helpers::lock(&self.state).up_failures.pop_front() {
            return Err(Error::node_up(code, format!("Dry run failed to provision {run_id}")));
        }
        // build our node
        let name = self.next_name();
        let assigned = profile.clone().assigned(
            format!("i-{name}"),
            "10.0.0.1".to_owned(),
            name.clone(),
        );
        let mut node = ComputeNode::new(name, run_id);
        node.created = Some(Utc::now());
        self.cluster.add_node(node);
        helpers::lock(&self.state)
            .instances
            .insert(run_id.to_owned(), assigned.clone());
        Ok(assigned)
    }

    async fn scale_up_free_node(
        &self,
        node_id: &str,
        profile: &InstanceProfile,
    ) -> Result<(), Error> {
        helpers::lock(&self.state)
            .free_ups
            .push((node_id.to_owned(), profile.clone()));
        self.wait_for_gate().await?;
        if let Some(code) = helpers::lock(&self.state).up_failures.pop_front() {
            return Err(Error::node_up(code, format!("Dry run failed to provision {node_id}")));
        }
        let mut node = ComputeNode::new(self.next_name(), node_id);
        node.created = Some(Utc::now());
        self.cluster.add_node(node);
        Ok(())
    }

    async fn scale_down_node(&self, node: &str) -> Result<(), Error> {
        helpers::lock(&self.state)
            .scale_downs
            .push(node.to_owned());
        self.cluster.remove_node(node);
        Ok(())
    }

    async fn reassign_node(&self, old_id: &str, new_id: &str) -> Result<bool, Error> {
        let result = {
            let mut state = helpers::lock(&self.state);
            state
                .reassigns
                .push((old_id.to_owned(), new_id.to_owned()));
            state.reassign_results.get(old_id).copied().unwrap_or(true)
        };
        Ok(result && self.cluster.relabel(old_id, new_id))
    }

    async fn is_node_expired(&self, node: &str) -> Result<bool, Error> {
        Ok(helpers::lock(&self.state).expired.contains(node))
    }

    async fn load_disks(&self, _region_id: Option<u64>, _run_id: &str) -> Result<Vec<Disk>, Error> {
        Ok(helpers::lock(&self.state).disks.clone())
    }
}

/// The state of a pretend run store
#[derive(Debug, Default)]
pub struct StoreState {
    /// The runs in this store
    pub runs: BTreeMap<u64, Run>,
    /// The runs that fail to load
    pub broken: HashSet<u64>,
    /// The instance updates that were made
    pub instance_updates: Vec<(u64, InstanceProfile)>,
    /// The status updates that were requested
    pub status_updates: Vec<(u64, RunStatus)>,
    /// The disks that were registered
    pub disks: Vec<(u64, Vec<Disk>)>,
    /// The runs whose price was recomputed
    pub prices: Vec<u64>,
    /// The pod statuses that were recorded
    pub pod_statuses: Vec<(u64, String)>,
}

/// A pretend run store
#[derive(Debug, Clone, Default)]
pub struct DryRunStore {
    /// The shared state of this store
    state: Arc<Mutex<StoreState>>,
}

impl DryRunStore {
    /// Add a run to this store
    ///
    /// # Arguments
    ///
    /// * `run` - The run to add
    pub fn add_run(&self, run: Run) {
        helpers::lock(&self.state).runs.insert(run.id, run);
    }

    /// Remove a run from this store
    ///
    /// # Arguments
    ///
    /// * `id` - The run to remove
    pub fn remove_run(&self, id: u64) {
        helpers::lock(&self.state).runs.remove(&id);
    }

    /// Make a run fail to load
    ///
    /// # Arguments
    ///
    /// * `id` - The run to break
    pub fn break_run(&self, id: u64) {
        helpers::lock(&self.state).broken.insert(id);
    }

    /// Get a run from this store
    ///
    /// # Arguments
    ///
    /// * `id` - The run to get
    pub fn run(&self, id: u64) -> Option<Run> {
        helpers::lock(&self.state).runs.get(&id).cloned()
    }

    /// Get the instance updates that were made
    pub fn instance_updates(&self) -> Vec<(u64, InstanceProfile)> {
        helpers::lock(&self.state).instance_updates.clone()
    }

    /// Get the status updates that were requested
    pub fn status_updates(&self) -> Vec<(u64, RunStatus)> {
        helpers::lock(&self.state).status_updates.clone()
    }

    /// Get the disks that were registered
    pub fn registered_disks(&self) -> Vec<(u64, Vec<Disk>)> {
        helpers::lock(&self.state).disks.clone()
    }

    /// Get the runs whose price was recomputed
    pub fn prices(&self) -> Vec<u64> {
        helpers::lock(&self.state).prices.clone()
    }

    /// Get the pod statuses that were recorded
    pub fn pod_statuses(&self) -> Vec<(u64, String)> {
        helpers::lock(&self.state).pod_statuses.clone()
    }
}

#[async_trait::async_trait]
impl RunStore for DryRunStore {
    async fn load_run(&self, id: u64) -> Result<Option<Run>, Error> {
        let state = helpers::lock(&self.state);
        if state.broken.contains(&id) {
            return Err(Error::new(format!("Dry run store failed to load {id}")));
        }
        Ok(state.runs.get(&id).cloned())
    }

    async fn update_instance(&self, id: u64, instance: &InstanceProfile) -> Result<(), Error> {
        let mut state = helpers::lock(&self.state);
        state.instance_updates.push((id, instance.clone()));
        if let Some(run) = state.runs.get_mut(&id) {
            run.instance = Some(instance.clone());
        }
        Ok(())
    }

    async fn update_status_if_not_final(&self, id: u64, status: RunStatus) -> Result<(), Error> {
        let mut state = helpers::lock(&self.state);
        state.status_updates.push((id, status));
        if let Some(run) = state.runs.get_mut(&id) {
            if !run.status.is_final() {
                run.status = status;
            }
        }
        Ok(())
    }

    async fn register_disks(&self, id: u64, disks: &[Disk]) -> Result<(), Error> {
        helpers::lock(&self.state).disks.push((id, disks.to_vec()));
        Ok(())
    }

    async fn adjust_price_for_disks(&self, id: u64, _disks: &[Disk]) -> Result<(), Error> {
        helpers::lock(&self.state).prices.push(id);
        Ok(())
    }

    async fn update_pod_status(&self, id: u64, status: &str) -> Result<(), Error> {
        let mut state = helpers::lock(&self.state);
        state.pod_statuses.push((id, status.to_owned()));
        if let Some(run) = state.runs.get_mut(&id) {
            run.pod_status = Some(status.to_owned());
        }
        Ok(())
    }
}
