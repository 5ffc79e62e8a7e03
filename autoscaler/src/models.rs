//! The data model the autoscaler reconciles over
//!
//! None of these objects are owned by the autoscaler. Runs live in the pipeline API while nodes
//! and pods live in Kubernetes and the cloud. These are snapshots of them taken each cycle.

mod disks;
mod nodes;
mod profiles;
mod runs;

pub use disks::Disk;
pub use nodes::{
    ComputeNode, NodeHealth, PAUSED_LABEL, PRIORITY_LABEL, PipelinePod, PodPhase, RUN_ID_LABEL,
};
pub use profiles::InstanceProfile;
pub use runs::{Run, RunStatus};
