//! Provisions nodes on a bounded pool of detached tasks
//!
//! The scaling loop never waits on these tasks except for warm pool nodes. Every dispatch owns an
//! [`InFlightGuard`] so the in flight marker for a run is always released exactly once no matter
//! how the task ends.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{Level, event, instrument};

use super::backends::Backends;
use super::retries::RetryTracker;
use crate::Error;
use crate::conf::AutoscalerConf;
use crate::models::InstanceProfile;

/// The ways provisioning a node can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeUpFailure {
    /// The cloud had no spot capacity left for this instance
    SpotExhausted,
    /// A provider quota was exceeded
    QuotaExceeded,
    /// Any other failure
    Generic,
}

impl NodeUpFailure {
    /// Classify a provisioning error by its exit signal
    ///
    /// # Arguments
    ///
    /// * `err` - The error to classify
    /// * `conf` - The autoscaler config with our distinguished exit codes
    pub fn classify(err: &Error, conf: &AutoscalerConf) -> Self {
        match err.exit_code() {
            Some(code) if code == conf.spot_exhausted_code => NodeUpFailure::SpotExhausted,
            Some(code) if code == conf.quota_exceeded_code => NodeUpFailure::QuotaExceeded,
            _ => NodeUpFailure::Generic,
        }
    }

    /// Get this failure as a str
    pub fn as_str(self) -> &'static str {
        match self {
            NodeUpFailure::SpotExhausted => "SpotExhausted",
            NodeUpFailure::QuotaExceeded => "QuotaExceeded",
            NodeUpFailure::Generic => "Generic",
        }
    }
}

/// How a provisioning task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// A node was provisioned
    Provisioned(InstanceProfile),
    /// A warm pool node was provisioned
    Warm(String),
    /// Provisioning failed
    Failed(NodeUpFailure),
}

/// Releases the in flight marker for a run when a provisioning task ends
///
/// A guard that is dropped without being completed counts as a generic failure.
#[derive(Debug)]
pub struct InFlightGuard {
    /// The tracker holding our in flight marker
    tracker: RetryTracker,
    /// The id the marker was set for
    id: String,
    /// Whether to forget all counters when this guard ends
    ephemeral: bool,
    /// Whether this guard was already completed
    done: bool,
}

impl InFlightGuard {
    /// Start an attempt and build a guard that will end it
    ///
    /// # Arguments
    ///
    /// * `tracker` - The tracker to start the attempt in
    /// * `id` - The id to start an attempt for
    /// * `ephemeral` - Whether counters should be dropped on any completion
    pub fn begin(tracker: &RetryTracker, id: String, ephemeral: bool) -> Self {
        tracker.begin_attempt(&id);
        InFlightGuard {
            tracker: tracker.clone(),
            id,
            ephemeral,
            done: false,
        }
    }

    /// End this attempt successfully
    pub fn succeed(mut self) {
        self.done = true;
        self.tracker.end_attempt(&self.id, true);
    }

    /// End this attempt as a failure
    ///
    /// # Arguments
    ///
    /// * `failure` - The kind of failure that occured
    pub fn fail(mut self, failure: NodeUpFailure) {
        self.done = true;
        self.release(failure);
    }

    /// Clear our marker and fold a failure into our counters
    fn release(&self, failure: NodeUpFailure) {
        // warm pool ids are never retried so just forget them
        if self.ephemeral {
            self.tracker.end_attempt(&self.id, true);
            return;
        }
        // fold in our failure before anyone can see this run as idle
        match failure {
            NodeUpFailure::SpotExhausted => self.tracker.record_spot_failure(&self.id),
            NodeUpFailure::QuotaExceeded => self.tracker.record_quota_exceeded(&self.id),
            NodeUpFailure::Generic => (),
        }
        self.tracker.end_attempt(&self.id, false);
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.done {
            event!(Level::WARN, id = &self.id, msg = "Provisioning task ended early");
            self.release(NodeUpFailure::Generic);
        }
    }
}

/// Dispatches provisioning tasks onto a bounded worker pool
#[derive(Clone)]
pub struct Provisioner {
    /// The autoscaler settings
    conf: Arc<AutoscalerConf>,
    /// The systems we provision against
    backends: Backends,
    /// The shared retry state
    tracker: RetryTracker,
    /// Limits how many tasks talk to the cloud at once
    workers: Arc<Semaphore>,
    /// The counter for warm pool node ids
    counter: Arc<AtomicU64>,
}

impl Provisioner {
    /// Create a new provisioner
    ///
    /// # Arguments
    ///
    /// * `conf` - The autoscaler settings
    /// * `backends` - The systems to provision against
    /// * `tracker` - The shared retry state
    pub fn new(conf: Arc<AutoscalerConf>, backends: Backends, tracker: RetryTracker) -> Self {
        let workers = Arc::new(Semaphore::new(conf.workers.max(1)));
        // seed our counter with the time so ids don't repeat across restarts
        let seed = chrono::Utc::now().timestamp_millis().unsigned_abs();
        Provisioner {
            conf,
            backends,
            tracker,
            workers,
            counter: Arc::new(AtomicU64::new(seed)),
        }
    }

    /// Provision a node for a run without waiting for it
    ///
    /// The attempt is started before this returns so the next run in this cycle sees it in flight.
    ///
    /// # Arguments
    ///
    /// * `id` - The run to provision a node for
    /// * `profile` - The instance to provision
    pub fn dispatch(&self, id: u64, profile: InstanceProfile) -> JoinHandle<ProvisionOutcome> {
        // mark this run as in flight right away
        let guard = InFlightGuard::begin(&self.tracker, id.to_string(), false);
        let this = self.clone();
        tokio::spawn(async move {
            match this.provision(id, &profile).await {
                Ok(assigned) => {
                    guard.succeed();
                    ProvisionOutcome::Provisioned(assigned)
                }
                Err(err) => {
                    let failure = NodeUpFailure::classify(&err, &this.conf);
                    event!(
                        Level::ERROR,
                        run = id,
                        failure = failure.as_str(),
                        error = err.to_string()
                    );
                    guard.fail(failure);
                    ProvisionOutcome::Failed(failure)
                }
            }
        })
    }

    /// Provision a warm pool node without a run
    ///
    /// # Arguments
    ///
    /// * `profile` - The instance to provision
    pub fn dispatch_free(&self, profile: InstanceProfile) -> JoinHandle<ProvisionOutcome> {
        // build a synthetic id for this node
        let node_id = self.next_free_id();
        let guard = InFlightGuard::begin(&self.tracker, node_id.clone(), true);
        let this = self.clone();
        tokio::spawn(async move {
            match this.provision_free(&node_id, &profile).await {
                Ok(()) => {
                    guard.succeed();
                    ProvisionOutcome::Warm(node_id)
                }
                Err(err) => {
                    let failure = NodeUpFailure::classify(&err, &this.conf);
                    event!(Level::ERROR, node = &node_id, error = err.to_string());
                    guard.fail(failure);
                    ProvisionOutcome::Failed(failure)
                }
            }
        })
    }

    /// Get the next synthetic warm pool node id
    fn next_free_id(&self) -> String {
        let next = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}{next}", self.conf.free_node_prefix)
    }

    /// Wait for a free worker slot
    async fn permit(&self) -> Result<tokio::sync::OwnedSemaphorePermit, Error> {
        self.workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| Error::new(format!("Provisioning pool closed: {err}")))
    }

    /// Provision and register a node for a run
    ///
    /// # Arguments
    ///
    /// * `id` - The run to provision a node for
    /// * `profile` - The instance to provision
    #[instrument(name = "Provisioner::provision", skip(self, profile), err(Debug))]
    async fn provision(&self, id: u64, profile: &InstanceProfile) -> Result<InstanceProfile, Error> {
        let _permit = self.permit().await?;
        // save what we are about to create so a crash here can be recovered next cycle
        self.backends.store.update_instance(id, profile).await?;
        // create this node
        let assigned = self
            .backends
            .cloud
            .scale_up_node(&id.to_string(), profile)
            .await?;
        event!(
            Level::INFO,
            run = id,
            node = assigned.node_name.as_deref(),
            msg = "Provisioned node"
        );
        // save the node we were given
        self.backends.store.update_instance(id, &assigned).await?;
        // the node exists now so disk problems do not fail this attempt
        if let Err(err) = attach_disks(&self.backends, id, assigned.region_id).await {
            event!(Level::WARN, run = id, error = err.to_string());
        }
        Ok(assigned)
    }

    /// Provision a warm pool node
    ///
    /// # Arguments
    ///
    /// * `node_id` - The synthetic id for this node
    /// * `profile` - The instance to provision
    #[instrument(name = "Provisioner::provision_free", skip(self, profile), err(Debug))]
    async fn provision_free(&self, node_id: &str, profile: &InstanceProfile) -> Result<(), Error> {
        let _permit = self.permit().await?;
        self.backends
            .cloud
            .scale_up_free_node(node_id, profile)
            .await?;
        event!(Level::INFO, node = node_id, msg = "Provisioned warm node");
        Ok(())
    }
}

/// Register the disks on a runs node and recompute its price
///
/// # Arguments
///
/// * `backends` - The systems to talk to
/// * `id` - The run whose node was just bound
/// * `region_id` - The region the node lives in
pub async fn attach_disks(
    backends: &Backends,
    id: u64,
    region_id: Option<u64>,
) -> Result<(), Error> {
    let disks = backends.cloud.load_disks(region_id, &id.to_string()).await?;
    backends.store.register_disks(id, &disks).await?;
    backends.store.adjust_price_for_disks(id, &disks).await
}

#[cfg(test)]
mod tests {
    use super::{InFlightGuard, NodeUpFailure};
    use crate::Error;
    use crate::conf::AutoscalerConf;
    use crate::libs::RetryTracker;

    #[test]
    fn classify_exit_codes() {
        let conf = AutoscalerConf::default();
        let spot = Error::node_up(Some(conf.spot_exhausted_code), "no spot");
        let quota = Error::node_up(Some(conf.quota_exceeded_code), "quota");
        let other = Error::node_up(Some(1), "boom");
        let killed = Error::node_up(None, "killed");
        assert_eq!(NodeUpFailure::classify(&spot, &conf), NodeUpFailure::SpotExhausted);
        assert_eq!(NodeUpFailure::classify(&quota, &conf), NodeUpFailure::QuotaExceeded);
        assert_eq!(NodeUpFailure::classify(&other, &conf), NodeUpFailure::Generic);
        assert_eq!(NodeUpFailure::classify(&killed, &conf), NodeUpFailure::Generic);
        assert_eq!(
            NodeUpFailure::classify(&Error::new("api down"), &conf),
            NodeUpFailure::Generic
        );
    }

    #[test]
    fn dropped_guards_release_the_marker() {
        let tracker = RetryTracker::default();
        let guard = InFlightGuard::begin(&tracker, "1".to_owned(), false);
        assert!(tracker.is_in_flight("1"));
        drop(guard);
        assert!(!tracker.is_in_flight("1"));
        assert_eq!(tracker.attempts("1"), 1);
    }

    #[test]
    fn ephemeral_guards_forget_failures() {
        let tracker = RetryTracker::default();
        let guard = InFlightGuard::begin(&tracker, "p-1".to_owned(), true);
        guard.fail(NodeUpFailure::SpotExhausted);
        assert_eq!(tracker.state("p-1"), None);
    }
}
