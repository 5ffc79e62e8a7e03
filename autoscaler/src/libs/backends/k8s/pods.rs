use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams};
use tracing::instrument;

use crate::Error;
use crate::models::{PRIORITY_LABEL, PipelinePod, PodPhase};

/// Check if k8s could not find a node to place a pod on
///
/// # Arguments
///
/// * `pod` - The pod to check
pub fn is_unschedulable(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions.iter().any(|cond| {
                cond.type_ == "PodScheduled"
                    && cond.status == "False"
                    && cond.reason.as_deref() == Some("Unschedulable")
            })
        })
}

/// Convert a k8s pod to a pipeline pod
///
/// # Arguments
///
/// * `pod` - The pod to convert
pub fn to_pipeline_pod(pod: &Pod) -> Option<PipelinePod> {
    let name = pod.metadata.name.as_ref()?;
    let phase = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref());
    Some(PipelinePod {
        name: name.clone(),
        phase: PodPhase::parse(phase),
        unschedulable: is_unschedulable(pod),
        priority_score: pod
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(PRIORITY_LABEL))
            .cloned(),
    })
}

/// Wrapper for pod api routes in k8s
pub struct Pods {
    /// API client for pods in our namespace
    api: Api<Pod>,
}

impl Pods {
    /// Build new wrapper for k8s functions regarding pods
    ///
    /// # Arguments
    ///
    /// * `client` - Kubernetes client
    /// * `ns` - The namespace our pipeline pods live in
    pub fn new(client: &kube::Client, ns: &str) -> Self {
        Pods {
            api: Api::namespaced(client.clone(), ns),
        }
    }

    /// List all pipeline pods
    #[instrument(name = "k8s::Pods::list", skip_all, err(Debug))]
    pub async fn list(&self) -> Result<Vec<PipelinePod>, Error> {
        let params = ListParams::default().labels("type=pipeline");
        let pods = self.api.list(&params).await?;
        Ok(pods.iter().filter_map(to_pipeline_pod).collect())
    }

    /// Deletes a pod by name
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the pod to delete
    #[instrument(name = "k8s::Pods::delete", skip(self), err(Debug))]
    pub async fn delete(&self, name: &str) -> Result<(), Error> {
        // delete target pod
        if let Err(error) = self.api.delete(name, &DeleteParams::default()).await {
            // the pod is already gone if this is a 404
            match &error {
                kube::Error::Api(api_err) if api_err.code == 404 => (),
                _ => return Err(Error::from(error)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Pod;
    use serde_json::json;

    use super::to_pipeline_pod;
    use crate::models::PodPhase;

    #[test]
    fn convert_pending_pods() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": {"name": "17", "labels": {"type": "pipeline", "priority-score": "40"}},
            "status": {
                "phase": "Pending",
                "conditions": [{
                    "type": "PodScheduled",
                    "status": "False",
                    "reason": "Unschedulable"
                }]
            }
        }))
        .unwrap();
        let pipeline = to_pipeline_pod(&pod).unwrap();
        assert_eq!(pipeline.name, "17");
        assert_eq!(pipeline.phase, PodPhase::Pending);
        assert!(pipeline.unschedulable);
        assert_eq!(pipeline.priority(), 40);
    }

    #[test]
    fn scheduled_pods_are_not_pending() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": {"name": "18"},
            "status": {
                "phase": "Running",
                "conditions": [{"type": "PodScheduled", "status": "True"}]
            }
        }))
        .unwrap();
        let pipeline = to_pipeline_pod(&pod).unwrap();
        assert_eq!(pipeline.phase, PodPhase::Running);
        assert!(!pipeline.unschedulable);
        assert_eq!(pipeline.priority(), 0);
    }
}
