//! Drives scaling cycles on a fixed delay under a cluster wide lock
//!
//! Every cycle recomputes its view of the cluster from scratch. Only the retry tracker carries
//! state from one cycle to the next.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{Instrument, Level, event, instrument, span};

use super::backends::Backends;
use super::context::{CycleContext, CycleReport};
use super::locks::CycleLock;
use super::matcher::NodeMatcher;
use super::pool::FreeNodePool;
use super::provision::Provisioner;
use super::retries::RetryTracker;
use super::scanner::PendingScanner;
use crate::Error;
use crate::conf::{AutoscalerConf, SettingsSource};

/// Reconciles pending runs against the nodes in a cluster
pub struct Autoscaler {
    /// The autoscaler settings
    conf: Arc<AutoscalerConf>,
    /// Where we get our cluster settings from each cycle
    settings: Box<dyn SettingsSource>,
    /// The systems we reconcile against
    backends: Backends,
    /// The retry state shared with in flight provisioning tasks
    tracker: RetryTracker,
    /// Finds and matches pending runs
    scanner: PendingScanner,
    /// Maintains our idle nodes
    pool: FreeNodePool,
    /// Keeps other autoscalers from running at the same time
    lock: Box<dyn CycleLock>,
}

impl Autoscaler {
    /// Create a new autoscaler
    ///
    /// # Arguments
    ///
    /// * `conf` - The autoscaler settings
    /// * `settings` - Where to get our cluster settings from each cycle
    /// * `backends` - The systems to reconcile against
    /// * `lock` - The lock to hold while running a cycle
    pub fn new(
        conf: AutoscalerConf,
        settings: Box<dyn SettingsSource>,
        backends: Backends,
        lock: Box<dyn CycleLock>,
    ) -> Self {
        let conf = Arc::new(conf);
        let tracker = RetryTracker::default();
        // build our components
        let provisioner = Provisioner::new(conf.clone(), backends.clone(), tracker.clone());
        let matcher = NodeMatcher::new(
            conf.clone(),
            backends.clone(),
            tracker.clone(),
            provisioner.clone(),
        );
        let scanner = PendingScanner::new(backends.clone(), tracker.clone(), matcher);
        let pool = FreeNodePool::new(conf.clone(), backends.clone(), tracker.clone(), provisioner);
        Autoscaler {
            conf,
            settings,
            backends,
            tracker,
            scanner,
            pool,
            lock,
        }
    }

    /// Get the retry state shared with our provisioning tasks
    pub fn tracker(&self) -> &RetryTracker {
        &self.tracker
    }

    /// Run a single scaling cycle
    #[instrument(name = "Autoscaler::run_once", skip_all, err(Debug))]
    pub async fn run_once(&self) -> Result<CycleReport, Error> {
        // get the current cluster settings
        let settings = self.settings.current()?;
        // make sure we can talk to the cluster at all
        self.backends.orchestrator.connect().await?;
        // snapshot our nodes and pods
        let nodes = self.backends.orchestrator.list_nodes().await?;
        let pods = self.backends.orchestrator.list_pods().await?;
        let mut ctx = CycleContext::new(settings, nodes, &pods);
        // match any pending runs
        self.scanner.scan(&pods, &mut ctx).await;
        // retire unneeded nodes and fill our warm floor
        self.pool.reconcile(&mut ctx).await?;
        // finish our report
        let in_flight = self.tracker.in_flight();
        let mut report = ctx.report.clone();
        report.in_flight = in_flight;
        report.queued = self.tracker.queued();
        report.cluster_size = ctx.cluster_size(in_flight);
        event!(
            Level::INFO,
            cluster_size = report.cluster_size,
            in_flight = report.in_flight,
            queued = report.queued,
            dispatched = report.dispatched,
            reassigned = report.reassigned,
            recovered = report.recovered,
            deferred = report.deferred,
            failed = report.failed,
            terminated = report.terminated,
            reserved = report.reserved,
            warm_dispatched = report.warm_dispatched
        );
        Ok(report)
    }

    /// Run a single cycle if we can get our lock
    ///
    /// Our hold on the lock is renewed for as long as the cycle runs. The cycle is abandoned if
    /// we lose the lock part way through. Returns None if another autoscaler holds the lock.
    pub async fn single_loop(&self) -> Result<Option<CycleReport>, Error> {
        let hold = Duration::from_secs(self.conf.lock_ttl.max(1));
        if !self.lock.try_acquire(hold).await? {
            event!(Level::DEBUG, msg = "Cycle lock is held elsewhere");
            return Ok(None);
        }
        tokio::select! {
            report = self.run_once() => report.map(Some),
            err = self.keep_alive(hold) => Err(err),
        }
    }

    /// Keep renewing our cycle lock until we lose it
    ///
    /// # Arguments
    ///
    /// * `hold` - How long each renewal holds the lock for
    async fn keep_alive(&self, hold: Duration) -> Error {
        let mut renewed = Instant::now();
        loop {
            // renew well before our current hold runs out
            tokio::time::sleep(hold / 2).await;
            match self.lock.renew(hold).await {
                Ok(true) => renewed = Instant::now(),
                Ok(false) => return Error::new("Lost the cycle lock to another autoscaler"),
                Err(err) => {
                    event!(Level::WARN, error = err.to_string(), msg = "Failed to renew cycle lock");
                    // anyone could have taken our lock by now
                    if renewed.elapsed() >= hold {
                        return Error::new("Cycle lock lapsed before it could be renewed");
                    }
                }
            }
        }
    }

    /// Start scaling forever
    pub async fn start(&self) {
        let dwell = Duration::from_secs(self.conf.dwell);
        loop {
            let span = span!(Level::INFO, "Scaling Cycle");
            // failed cycles are retried on the next loop
            if let Err(err) = self.single_loop().instrument(span).await {
                event!(Level::ERROR, error = err.to_string());
            }
            tokio::time::sleep(dwell).await;
        }
    }
}
