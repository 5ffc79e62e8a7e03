//! Observes and labels pipeline nodes and pods in Kubernetes

use kube::config::KubeConfigOptions;
use tracing::{Level, event, instrument};

pub mod nodes;
pub mod pods;

use nodes::Nodes;
use pods::Pods;

use super::Orchestrator;
use crate::Error;
use crate::conf::K8sConf;
use crate::models::{ComputeNode, PipelinePod};

/// Kubernetes wrapper
pub struct K8s {
    /// The client used to talk to k8s
    client: kube::Client,
    /// Node wrappers
    pub nodes: Nodes,
    /// Pod wrappers
    pub pods: Pods,
}

impl K8s {
    /// Builds a new k8s wrapper
    ///
    /// # Arguments
    ///
    /// * `conf` - The Kubernetes settings
    pub async fn new(conf: &K8sConf) -> Result<Self, Error> {
        // use our configured context or the current one
        let opts = KubeConfigOptions {
            context: conf.context.clone(),
            ..Default::default()
        };
        // init client
        let client = kube::Client::try_from(kube::Config::from_kubeconfig(&opts).await?)?;
        // setup k8s wrappers
        let nodes = Nodes::new(&client, conf);
        let pods = Pods::new(&client, &conf.namespace);
        Ok(K8s {
            client,
            nodes,
            pods,
        })
    }

    /// Get the client used to talk to k8s
    pub fn client(&self) -> &kube::Client {
        &self.client
    }
}

#[async_trait::async_trait]
impl Orchestrator for K8s {
    #[instrument(name = "Orchestrator<K8s>::connect", skip_all, err(Debug))]
    async fn connect(&self) -> Result<(), Error> {
        let version = self.client.apiserver_version().await?;
        event!(Level::DEBUG, version = &version.git_version);
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<ComputeNode>, Error> {
        self.nodes.list().await
    }

    async fn list_pods(&self) -> Result<Vec<PipelinePod>, Error> {
        self.pods.list().await
    }

    async fn delete_pod(&self, name: &str) -> Result<(), Error> {
        self.pods.delete(name).await
    }

    async fn label_node(&self, node: &str, label: &str, value: &str) -> Result<(), Error> {
        self.nodes.label(node, label, value).await
    }
}
