//! The compute nodes and pipeline pods observed in the cluster

use chrono::prelude::*;

/// The label binding a node to the run it was created or reassigned for
pub const RUN_ID_LABEL: &str = "runid";
/// The label marking a node whose run is paused
pub const PAUSED_LABEL: &str = "Paused";
/// The label holding the scheduling priority declared for a pod
pub const PRIORITY_LABEL: &str = "priority-score";

/// The health of a compute node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeHealth {
    /// This node is ready for work
    Healthy,
    /// A node condition reports that this node is broken
    Failed {
        /// The condition that failed
        condition: String,
        /// The reason reported for this condition
        reason: Option<String>,
        /// The message reported for this condition
        message: Option<String>,
    },
}

impl NodeHealth {
    /// Build a failed health status
    ///
    /// # Arguments
    ///
    /// * `condition` - The condition that failed
    /// * `reason` - The reason the condition failed
    /// * `message` - The message for the failed condition
    pub fn failed<T: Into<String>>(
        condition: T,
        reason: Option<String>,
        message: Option<String>,
    ) -> Self {
        NodeHealth::Failed {
            condition: condition.into(),
            reason,
            message,
        }
    }

    /// Describe this health in the form recorded as a runs pod status
    pub fn describe(&self) -> String {
        match self {
            NodeHealth::Healthy => "Ready".to_owned(),
            NodeHealth::Failed {
                condition,
                reason,
                message,
            } => {
                // start with the failing condition
                let mut desc = condition.clone();
                // add our reason and message if we have them
                for extra in [reason, message].into_iter().flatten() {
                    desc.push_str(": ");
                    desc.push_str(extra);
                }
                desc
            }
        }
    }
}

/// A compute node provisioned for pipeline runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeNode {
    /// The Kubernetes name of this node
    pub name: String,
    /// The run id this node is labeled with
    pub run_id: String,
    /// The health of this node
    pub health: NodeHealth,
    /// Whether this nodes run is paused
    pub paused: bool,
    /// When this node was created
    pub created: Option<DateTime<Utc>>,
    /// When this node last reported in
    pub heartbeat: Option<DateTime<Utc>>,
}

impl ComputeNode {
    /// Create a new healthy node
    ///
    /// # Arguments
    ///
    /// * `name` - The name of this node
    /// * `run_id` - The run id this node is labeled with
    pub fn new<N: Into<String>, R: Into<String>>(name: N, run_id: R) -> Self {
        ComputeNode {
            name: name.into(),
            run_id: run_id.into(),
            health: NodeHealth::Healthy,
            paused: false,
            created: None,
            heartbeat: None,
        }
    }

    /// Set the health of this node
    ///
    /// # Arguments
    ///
    /// * `health` - The health to set
    #[must_use]
    pub fn health(mut self, health: NodeHealth) -> Self {
        self.health = health;
        self
    }

    /// Mark this node as paused
    #[must_use]
    pub fn paused(mut self) -> Self {
        self.paused = true;
        self
    }

    /// Whether this node is healthy
    pub fn is_healthy(&self) -> bool {
        self.health == NodeHealth::Healthy
    }

    /// Whether this node was provisioned for the warm pool and never bound to a run
    ///
    /// # Arguments
    ///
    /// * `prefix` - The prefix used for warm pool node ids
    pub fn is_free(&self, prefix: &str) -> bool {
        self.run_id.starts_with(prefix)
    }
}

/// The phase of a pipeline pod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Parse a Kubernetes pod phase
    ///
    /// # Arguments
    ///
    /// * `phase` - The raw phase to parse
    pub fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    /// Whether this pod has finished
    pub fn is_final(self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// A pod executing a pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelinePod {
    /// The name of this pod which is the id of its run
    pub name: String,
    /// The phase of this pod
    pub phase: PodPhase,
    /// Whether Kubernetes could not find a node to place this pod on
    pub unschedulable: bool,
    /// The raw priority score declared for this pod
    pub priority_score: Option<String>,
}

impl PipelinePod {
    /// Create a new pending pod that cannot be scheduled yet
    ///
    /// # Arguments
    ///
    /// * `name` - The name of this pod
    pub fn unschedulable<T: Into<String>>(name: T) -> Self {
        PipelinePod {
            name: name.into(),
            phase: PodPhase::Pending,
            unschedulable: true,
            priority_score: None,
        }
    }

    /// Set the phase of this pod
    ///
    /// # Arguments
    ///
    /// * `phase` - The phase to set
    #[must_use]
    pub fn phase(mut self, phase: PodPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Mark whether this pod is waiting for a node
    ///
    /// # Arguments
    ///
    /// * `unschedulable` - Whether this pod cannot be placed
    #[must_use]
    pub fn waiting(mut self, unschedulable: bool) -> Self {
        self.unschedulable = unschedulable;
        self
    }

    /// Set the priority score for this pod
    ///
    /// # Arguments
    ///
    /// * `score` - The raw score to set
    #[must_use]
    pub fn score<T: Into<String>>(mut self, score: T) -> Self {
        self.priority_score = Some(score.into());
        self
    }

    /// Get the priority score of this pod defaulting to 0 when it is missing or invalid
    pub fn priority(&self) -> i64 {
        self.priority_score
            .as_deref()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::{NodeHealth, PipelinePod};

    #[test]
    fn priority_defaults_to_zero() {
        assert_eq!(PipelinePod::unschedulable("1").priority(), 0);
        assert_eq!(PipelinePod::unschedulable("1").score("high").priority(), 0);
        assert_eq!(PipelinePod::unschedulable("1").score("25").priority(), 25);
    }

    #[test]
    fn failed_health_description() {
        let health = NodeHealth::failed(
            "Ready",
            Some("KubeletNotReady".to_owned()),
            Some("PLEG is not healthy".to_owned()),
        );
        assert_eq!(health.describe(), "Ready: KubeletNotReady: PLEG is not healthy");
        assert_eq!(NodeHealth::failed("DiskPressure", None, None).describe(), "DiskPressure");
    }
}
