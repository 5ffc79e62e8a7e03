//! The external systems the autoscaler reconciles against
//!
//! The autoscaler never owns nodes, pods or runs. It observes and commands them through these
//! traits so the same engine can drive a real cluster or the in memory dry run backends.

use std::sync::Arc;

use crate::Error;
use crate::models::{ComputeNode, Disk, InstanceProfile, PipelinePod, Run, RunStatus};

pub mod api;
pub mod command;
pub mod dry_run;
pub mod k8s;

pub use api::ApiRunStore;
pub use command::CommandCloud;
pub use dry_run::{DryRunCloud, DryRunCluster, DryRunStore};
pub use k8s::K8s;

/// The systems a scaling cycle talks to
#[derive(Clone)]
pub struct Backends {
    /// The cluster our nodes and pods live in
    pub orchestrator: Arc<dyn Orchestrator>,
    /// The cloud our nodes are provisioned in
    pub cloud: Arc<dyn CloudProvider>,
    /// The store our runs live in
    pub store: Arc<dyn RunStore>,
}

impl Backends {
    /// Bundle the systems a scaling cycle talks to
    ///
    /// # Arguments
    ///
    /// * `orchestrator` - The cluster our nodes and pods live in
    /// * `cloud` - The cloud our nodes are provisioned in
    /// * `store` - The store our runs live in
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        cloud: Arc<dyn CloudProvider>,
        store: Arc<dyn RunStore>,
    ) -> Self {
        Backends {
            orchestrator,
            cloud,
            store,
        }
    }
}

/// The methods required to list and label the nodes and pods in a cluster
#[async_trait::async_trait]
pub trait Orchestrator: Send + Sync {
    /// Make sure we can talk to the cluster before starting a cycle
    async fn connect(&self) -> Result<(), Error>;

    /// List all nodes provisioned for pipeline runs
    async fn list_nodes(&self) -> Result<Vec<ComputeNode>, Error>;

    /// List all pipeline pods
    async fn list_pods(&self) -> Result<Vec<PipelinePod>, Error>;

    /// Delete a pipeline pod
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the pod to delete
    async fn delete_pod(&self, name: &str) -> Result<(), Error>;

    /// Set a label on a node
    ///
    /// # Arguments
    ///
    /// * `node` - The name of the node to label
    /// * `label` - The label to set
    /// * `value` - The value to set
    async fn label_node(&self, node: &str, label: &str, value: &str) -> Result<(), Error>;
}

/// The methods required to provision and retire compute nodes
#[async_trait::async_trait]
pub trait CloudProvider: Send + Sync {
    /// Check if an instance already exists for a run that fills its requirement
    ///
    /// # Arguments
    ///
    /// * `run_id` - The run to look for an instance for
    /// * `profile` - The instance this run requires
    async fn describe_instance(
        &self,
        run_id: &str,
        profile: &InstanceProfile,
    ) -> Result<Option<InstanceProfile>, Error>;

    /// Provision a node for a run
    ///
    /// Failures of the provisioning process itself are returned as [`Error::NodeUp`].
    ///
    /// # Arguments
    ///
    /// * `run_id` - The run to provision a node for
    /// * `profile` - The instance to provision
    async fn scale_up_node(
        &self,
        run_id: &str,
        profile: &InstanceProfile,
    ) -> Result<InstanceProfile, Error>;

    /// Provision a warm pool node that is not bound to a run
    ///
    /// # Arguments
    ///
    /// * `node_id` - The synthetic id to label this node with
    /// * `profile` - The instance to provision
    async fn scale_up_free_node(&self, node_id: &str, profile: &InstanceProfile)
    -> Result<(), Error>;

    /// Terminate a node
    ///
    /// # Arguments
    ///
    /// * `node` - The name of the node to terminate
    async fn scale_down_node(&self, node: &str) -> Result<(), Error>;

    /// Rebind an idle node from one run id to another
    ///
    /// # Arguments
    ///
    /// * `old_id` - The run id the node is currently labeled with
    /// * `new_id` - The run id to bind the node to
    async fn reassign_node(&self, old_id: &str, new_id: &str) -> Result<bool, Error>;

    /// Check if a node is at the end of its billing period
    ///
    /// # Arguments
    ///
    /// * `node` - The name of the node to check
    async fn is_node_expired(&self, node: &str) -> Result<bool, Error>;

    /// List the disks attached to a runs node
    ///
    /// # Arguments
    ///
    /// * `region_id` - The region the node lives in
    /// * `run_id` - The run whose node we are checking
    async fn load_disks(&self, region_id: Option<u64>, run_id: &str) -> Result<Vec<Disk>, Error>;
}

/// The methods required to read and update runs
#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    /// Load a run returning None if it no longer exists
    ///
    /// # Arguments
    ///
    /// * `id` - The id of the run to load
    async fn load_run(&self, id: u64) -> Result<Option<Run>, Error>;

    /// Save the instance a run requires or was given
    ///
    /// # Arguments
    ///
    /// * `id` - The run to update
    /// * `instance` - The instance to save
    async fn update_instance(&self, id: u64, instance: &InstanceProfile) -> Result<(), Error>;

    /// Set the status of a run unless it has already reached a final status
    ///
    /// # Arguments
    ///
    /// * `id` - The run to update
    /// * `status` - The status to set
    async fn update_status_if_not_final(&self, id: u64, status: RunStatus) -> Result<(), Error>;

    /// Register the disks attached to a runs node
    ///
    /// # Arguments
    ///
    /// * `id` - The run to register disks for
    /// * `disks` - The disks to register
    async fn register_disks(&self, id: u64, disks: &[Disk]) -> Result<(), Error>;

    /// Recompute the price of a run based on its disks
    ///
    /// # Arguments
    ///
    /// * `id` - The run to reprice
    /// * `disks` - The disks attached to this run
    async fn adjust_price_for_disks(&self, id: u64, disks: &[Disk]) -> Result<(), Error>;

    /// Record the status of a runs pod
    ///
    /// # Arguments
    ///
    /// * `id` - The run to update
    /// * `status` - The pod status to record
    async fn update_pod_status(&self, id: u64, status: &str) -> Result<(), Error>;
}
