mod autoscaler;
pub mod backends;
mod context;
mod helpers;
mod locks;
mod matcher;
mod pool;
mod provision;
mod retries;
mod scanner;

pub use autoscaler::Autoscaler;
pub use context::{CycleContext, CycleReport};
pub use helpers::parse_run_id;
pub use locks::{CycleLock, LeaseLock, LocalLock};
pub use matcher::{DeferReason, MatchOutcome, NodeMatcher};
pub use pool::{Disposition, FreeNodePool};
pub use provision::{InFlightGuard, NodeUpFailure, ProvisionOutcome, Provisioner};
pub use retries::{RetryState, RetryTracker};
pub use scanner::{Candidate, PendingScanner, order};
