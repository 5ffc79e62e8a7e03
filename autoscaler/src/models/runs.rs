//! The runs that request compute nodes

use super::InstanceProfile;

/// The lifecycle states a run can be in
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// This run is waiting for or running on a node
    Running,
    /// This run is being paused
    Pausing,
    /// This run is paused and does not need a node
    Paused,
    /// This run is being resumed and needs a node again
    Resuming,
    /// This run was stopped by a user
    Stopped,
    /// This run failed
    Failure,
    /// This run completed successfully
    Success,
}

impl RunStatus {
    /// Whether this status can never change again
    pub fn is_final(self) -> bool {
        matches!(
            self,
            RunStatus::Stopped | RunStatus::Failure | RunStatus::Success
        )
    }

    /// Whether this run is paused or on its way to being paused
    pub fn is_paused(self) -> bool {
        matches!(self, RunStatus::Pausing | RunStatus::Paused)
    }

    /// Get our status as a str
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Pausing => "PAUSING",
            RunStatus::Paused => "PAUSED",
            RunStatus::Resuming => "RESUMING",
            RunStatus::Stopped => "STOPPED",
            RunStatus::Failure => "FAILURE",
            RunStatus::Success => "SUCCESS",
        }
    }
}

/// A run that needs a compute node
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    /// The id of this run
    pub id: u64,
    /// The current status of this run
    pub status: RunStatus,
    /// The instance this run requires or was given
    #[serde(default)]
    pub instance: Option<InstanceProfile>,
    /// The run that launched this one if any
    #[serde(default)]
    pub parent_id: Option<u64>,
    /// The platform this run executes on
    #[serde(default)]
    pub platform: Option<String>,
    /// The last pod status recorded for this run
    #[serde(default)]
    pub pod_status: Option<String>,
}

impl Run {
    /// Create a new running run
    ///
    /// # Arguments
    ///
    /// * `id` - The id of this run
    pub fn new(id: u64) -> Self {
        Run {
            id,
            status: RunStatus::Running,
            instance: None,
            parent_id: None,
            platform: None,
            pod_status: None,
        }
    }

    /// Set the instance this run requires
    ///
    /// # Arguments
    ///
    /// * `instance` - The instance to require
    #[must_use]
    pub fn instance(mut self, instance: InstanceProfile) -> Self {
        self.instance = Some(instance);
        self
    }

    /// Set the parent of this run
    ///
    /// # Arguments
    ///
    /// * `parent` - The id of the parent run
    #[must_use]
    pub fn parent(mut self, parent: u64) -> Self {
        self.parent_id = Some(parent);
        self
    }

    /// Set the platform this run executes on
    ///
    /// # Arguments
    ///
    /// * `platform` - The platform to use
    #[must_use]
    pub fn platform<T: Into<String>>(mut self, platform: T) -> Self {
        self.platform = Some(platform.into());
        self
    }

        /// Set the status of this run
    ///
    /// # Arguments
    ///
    /// * `status` - The status to set
    #[must_use]
    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = status;
        self
    }
}
