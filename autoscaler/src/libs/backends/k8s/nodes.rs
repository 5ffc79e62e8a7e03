use chrono::prelude::*;
use k8s_openapi::api::core::v1::{Node, NodeCondition};
use kube::api::{Api, ListParams, Patch, PatchParams};
use serde::Serialize;
use serde_json::json;
use tracing::{Level, event, instrument};

use crate::Error;
use crate::conf::K8sConf;
use crate::models::{ComputeNode, NodeHealth, PAUSED_LABEL, RUN_ID_LABEL};

/// The node conditions that mean a node is broken when they are true
const PRESSURE_CONDITIONS: [&str; 4] = [
    "MemoryPressure",
    "DiskPressure",
    "PIDPressure",
    "NetworkUnavailable",
];

/// Convert a k8s timestamp to a chrono timestamp
///
/// # Arguments
///
/// * `time` - The k8s timestamp to convert
pub(super) fn timestamp<T: Serialize>(time: &T) -> Option<DateTime<Utc>> {
    // go through json so we don't depend on the time types k8s-openapi uses
    serde_json::to_value(time)
        .ok()?
        .as_str()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|time| time.with_timezone(&Utc))
}

/// Get the health of a node from its conditions
///
/// # Arguments
///
/// * `conditions` - The conditions reported for a node
pub fn health(conditions: &[NodeCondition]) -> NodeHealth {
    for cond in conditions {
        // a node that isn't ready or is under pressure is broken
        let failed = match cond.type_.as_str() {
            "Ready" => cond.status != "True",
            kind if PRESSURE_CONDITIONS.contains(&kind) => cond.status == "True",
            _ => false,
        };
        if failed {
            return NodeHealth::failed(&cond.type_, cond.reason.clone(), cond.message.clone());
        }
    }
    NodeHealth::Healthy
}

/// Convert a k8s node to a compute node
///
/// Nodes without a name or a run id label are not ours and are skipped.
///
/// # Arguments
///
/// * `node` - The node to convert
pub fn to_compute_node(node: &Node) -> Option<ComputeNode> {
    let name = node.metadata.name.as_ref()?;
    let labels = node.metadata.labels.as_ref()?;
    let run_id = labels.get(RUN_ID_LABEL)?;
    let mut compute = ComputeNode::new(name, run_id);
    compute.paused = labels.contains_key(PAUSED_LABEL);
    compute.created = node.metadata.creation_timestamp.as_ref().and_then(timestamp);
    // get this nodes conditions if it has any
    if let Some(conditions) = node
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
    {
        compute.health = health(conditions);
        // the latest heartbeat across all conditions
        compute.heartbeat = conditions
            .iter()
            .filter_map(|cond| cond.last_heartbeat_time.as_ref().and_then(timestamp))
            .max();
    }
    Some(compute)
}

/// Wrapper for node api routes in k8s
pub struct Nodes {
    /// API client for node commands in k8s
    api: Api<Node>,
    /// The label selectors to list our nodes with
    selectors: Vec<String>,
}

impl Nodes {
    /// Build new wrapper for k8s functions regarding nodes
    ///
    /// # Arguments
    ///
    /// * `client` - Kubernetes client
    /// * `conf` - The Kubernetes settings
    pub fn new(client: &kube::Client, conf: &K8sConf) -> Self {
        // only list nodes that are bound to a run
        let mut selectors = vec![RUN_ID_LABEL.to_owned()];
        // restrict to our region and provider if we have them
        if let Some(region) = &conf.region {
            selectors.push(format!("cloud_region={region}"));
        }
        if let Some(provider) = &conf.provider {
            selectors.push(format!("cloud_provider={provider}"));
        }
        Nodes {
            api: Api::all(client.clone()),
            selectors,
        }
    }

    /// List all of our nodes
    #[instrument(name = "k8s::Nodes::list", skip_all, err(Debug))]
    pub async fn list(&self) -> Result<Vec<ComputeNode>, Error> {
        // insert our label filters into list params
        let params = self
            .selectors
            .iter()
            .fold(ListParams::default(), |params, label| params.labels(label));
        let nodes = self.api.list(&params).await?;
        Ok(nodes.iter().filter_map(to_compute_node).collect())
    }

    /// Label a node
    ///
    /// # Arguments
    ///
    /// * `node` - The name of the node to label
    /// * `label` - The label to create/overwrite
    /// * `value` - The value of the label to set/overwrite
    #[instrument(name = "k8s::Nodes::label", skip(self), err(Debug))]
    pub async fn label(&self, node: &str, label: &str, value: &str) -> Result<(), Error> {
        // build label patch
        let patch = json!({
            "metadata": {
                "labels": {
                    label: value
                }
            }
        });
        // build patch params
        let params = PatchParams {
            field_manager: Some("pipeline-autoscaler".to_owned()),
            ..Default::default()
        };
        // patch node labels
        let patched = self.api.patch(node, &params, &Patch::Merge(&patch)).await?;
        // make sure our patch was succesful
        let labels = patched.metadata.labels.unwrap_or_default();
        if labels.get(label).map(String::as_str) != Some(value) {
            return Err(Error::new(format!(
                "Failed to label node {node} with {label}:{value}"
            )));
        }
        event!(Level::DEBUG, node, label, value);
        Ok(())
    }
}
