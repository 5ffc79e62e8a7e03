//! Decides whether a pending run reuses a node, gets a new one, or waits
//!
//! Matching is strictly sequential within a cycle. Every decision that claims a node or counts
//! towards the cluster size is recorded in the [`CycleContext`] before the next run is matched.

use std::sync::Arc;
use tracing::{Level, event, instrument};

use super::backends::Backends;
use super::context::CycleContext;
use super::helpers;
use super::provision::{self, Provisioner};
use super::retries::RetryTracker;
use crate::Error;
use crate::conf::{AutoscalerConf, ClusterSettings};
use crate::models::{ComputeNode, InstanceProfile, RUN_ID_LABEL, Run, RunStatus};

/// Why a run was left pending for a later cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// The cluster is over its max size
    ClusterFull,
    /// The cluster is at its max size and no idle node could be terminated
    NoEvictableNode,
    /// Too many provisioning tasks are in flight
    TooManyInFlight,
}

impl DeferReason {
    /// Get this reason as a str
    pub fn as_str(self) -> &'static str {
        match self {
            DeferReason::ClusterFull => "ClusterFull",
            DeferReason::NoEvictableNode => "NoEvictableNode",
            DeferReason::TooManyInFlight => "TooManyInFlight",
        }
    }
}

/// What the matcher decided for a single run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// A provisioning task is already running for this run
    InFlight,
    /// A node is already labeled for this run
    AlreadyBound,
    /// This run used up its provisioning attempts and was failed
    RetriesExhausted,
    /// An instance already existed for this run and was bound to it
    Recovered,
    /// An idle node was reassigned to this run
    Reassigned(String),
    /// This run was left pending for a later cycle
    Deferred(DeferReason),
    /// A provisioning task was dispatched for this run
    Dispatched,
}

/// Matches pending runs against idle nodes
#[derive(Clone)]
pub struct NodeMatcher {
    /// The autoscaler settings
    conf: Arc<AutoscalerConf>,
    /// The systems we match against
    backends: Backends,
    /// The shared retry state
    tracker: RetryTracker,
    /// Dispatches provisioning tasks
    provisioner: Provisioner,
}

impl NodeMatcher {
    /// Create a new node matcher
    ///
    /// # Arguments
    ///
    /// * `conf` - The autoscaler settings
    /// * `backends` - The systems to match against
    /// * `tracker` - The shared retry state
    /// * `provisioner` - Dispatches provisioning tasks
    pub fn new(
        conf: Arc<AutoscalerConf>,
        backends: Backends,
        tracker: RetryTracker,
        provisioner: Provisioner,
    ) -> Self {
        NodeMatcher {
            conf,
            backends,
            tracker,
            provisioner,
        }
    }

    /// Decide what to do for a single pending run
    ///
    /// # Arguments
    ///
    /// * `run` - The pending run
    /// * `ctx` - The state of the current cycle
    #[instrument(name = "NodeMatcher::process", skip_all, fields(run = run.id), err(Debug))]
    pub async fn process(&self, run: &Run, ctx: &mut CycleContext) -> Result<MatchOutcome, Error> {
        let id = run.id.to_string();
        // never dispatch twice for the same run
        if self.tracker.is_in_flight(&id) {
            return Ok(MatchOutcome::InFlight);
        }
        // a node already exists for this run
        if ctx.node_runs.contains(&id) {
            return Ok(MatchOutcome::AlreadyBound);
        }
        // fail runs that have used up their attempts
        if self.tracker.attempts(&id) >= ctx.settings.max_retries {
            event!(
                Level::WARN,
                run = run.id,
                attempts = self.tracker.attempts(&id),
                msg = "Provisioning attempts exhausted"
            );
            self.backends
                .store
                .update_status_if_not_final(run.id, RunStatus::Failure)
                .await?;
            self.tracker.clear(&id);
            ctx.report.failed += 1;
            return Ok(MatchOutcome::RetriesExhausted);
        }
        // figure out what this run needs
        let requirement = self.requirement(run, &ctx.settings).await?;
        // bind an instance that was created for this run already
        if let Some(instance) = self
            .backends
            .cloud
            .describe_instance(&id, &requirement)
            .await?
        {
            self.backends.store.update_instance(run.id, &instance).await?;
            self.tracker.clear(&id);
            ctx.scheduled.insert(id);
            ctx.report.recovered += 1;
            event!(
                Level::INFO,
                run = run.id,
                node = instance.node_name.as_deref(),
                msg = "Recovered existing instance"
            );
            return Ok(MatchOutcome::Recovered);
        }
        // try to reuse an idle node
        if let Some(node) = self.reassign(run.id, &requirement, ctx).await? {
            return Ok(MatchOutcome::Reassigned(node));
        }
        // make sure the cluster has room for another node
        let size = ctx.cluster_size(self.tracker.in_flight());
        let max_size = ctx.settings.max_size;
        if size > max_size {
            return Ok(self.defer(run, requirement, DeferReason::ClusterFull, ctx));
        }
        if size == max_size {
            if !ctx.settings.kill_not_matching_nodes {
                return Ok(self.defer(run, requirement, DeferReason::ClusterFull, ctx));
            }
            // make room by terminating an idle node
            if !self.evict(ctx).await? {
                return Ok(self.defer(run, requirement, DeferReason::NoEvictableNode, ctx));
            }
        }
        // make sure we don't have too many tasks talking to the cloud
        if self.tracker.in_flight() >= ctx.settings.max_nodeup_threads {
            return Ok(self.defer(run, requirement, DeferReason::TooManyInFlight, ctx));
        }
        // hand this run off to a provisioning task
        ctx.scheduled.insert(id);
        ctx.report.dispatched += 1;
        event!(
            Level::INFO,
            run = run.id,
            node_type = requirement.node_type.as_deref(),
            spot = requirement.spot,
            msg = "Dispatching node"
        );
        // the task runs detached and releases its own in flight marker
        drop(self.provisioner.dispatch(run.id, requirement));
        Ok(MatchOutcome::Dispatched)
    }

    /// Build the instance requirement for a run
    ///
    /// Runs that have exhausted their spot attempts fall back to on demand capacity for good.
    ///
    /// # Arguments
    ///
    /// * `run` - The run to build a requirement for
    /// * `settings` - The current cluster settings
    async fn requirement(
        &self,
        run: &Run,
        settings: &ClusterSettings,
    ) -> Result<InstanceProfile, Error> {
        // use the runs own instance or fall back to our defaults
        let mut requirement = match &run.instance {
            Some(instance) => instance.requirement(),
            None => settings.default_profile()?,
        };
        // a run always needs a node built for its own platform
        if run.platform.is_some() {
            requirement.platform.clone_from(&run.platform);
        }
        // stop asking for spot capacity if it keeps failing
        if requirement.spot
            && self.tracker.spot_failures(&run.id.to_string()) >= settings.max_spot_attempts
        {
            requirement.spot = false;
            self.backends
                .store
                .update_instance(run.id, &requirement)
                .await?;
            event!(
                Level::INFO,
                run = run.id,
                msg = "Falling back to on demand capacity"
            );
        }
        Ok(requirement)
    }

    /// Try to reassign a matching idle node to a run
    ///
    /// Returns the name of the reassigned node if one was found.
    ///
    /// # Arguments
    ///
    /// * `id` - The run to find a node for
    /// * `requirement` - The instance this run requires
    /// * `ctx` - The state of the current cycle
    async fn reassign(
        &self,
        id: u64,
        requirement: &InstanceProfile,
        ctx: &mut CycleContext,
    ) -> Result<Option<String>, Error> {
        let new_id = id.to_string();
        for node in ctx.idle_nodes() {
            // never hand out broken nodes
            if !node.is_healthy() {
                continue;
            }
            // get the instance this node was built as
            let previous = match idle_profile(&self.backends, &node, &ctx.settings, &self.conf)
                .await
            {
                Ok(Some(previous)) => previous,
                Ok(None) => continue,
                Err(err) => {
                    event!(Level::WARN, node = &node.name, error = err.to_string());
                    continue;
                }
            };
            if !previous.matches(requirement) {
                continue;
            }
            // try to rebind this node
            match self.backends.cloud.reassign_node(&node.run_id, &new_id).await {
                Ok(true) => (),
                Ok(false) => {
                    event!(Level::WARN, node = &node.name, run = id, msg = "Reassign refused");
                    continue;
                }
                Err(err) => {
                    event!(Level::WARN, node = &node.name, run = id, error = err.to_string());
                    continue;
                }
            }
            // claim this node for the rest of the cycle
            ctx.reassigned.insert(node.name.clone());
            ctx.scheduled.insert(new_id.clone());
            ctx.node_runs.insert(new_id.clone());
            ctx.report.reassigned += 1;
            self.tracker.clear(&new_id);
            event!(Level::INFO, node = &node.name, run = id, msg = "Reassigned node");
            // save the new binding
            let mut binding = previous;
            binding.node_name = Some(node.name.clone());
            self.backends.store.update_instance(id, &binding).await?;
            // the cloud relabels the node too so this is best effort
            if let Err(err) = self
                .backends
                .orchestrator
                .label_node(&node.name, RUN_ID_LABEL, &new_id)
                .await
            {
                event!(Level::WARN, node = &node.name, error = err.to_string());
            }
            if let Err(err) = provision::attach_disks(&self.backends, id, binding.region_id).await
            {
                event!(Level::WARN, run = id, error = err.to_string());
            }
            return Ok(Some(node.name));
        }
        Ok(None)
    }

    /// Terminate one idle node to make room in a full cluster
    ///
    /// Returns false if there was no idle node to terminate.
    ///
    /// # Arguments
    ///
    /// * `ctx` - The state of the current cycle
    async fn evict(&self, ctx: &mut CycleContext) -> Result<bool, Error> {
        let Some(node) = ctx.idle_nodes().into_iter().next() else {
            return Ok(false);
        };
        self.backends.cloud.scale_down_node(&node.name).await?;
        ctx.evict(&node.name);
        event!(Level::INFO, node = &node.name, msg = "Evicted idle node");
        Ok(true)
    }

    /// Leave a run pending for the next cycle
    ///
    /// # Arguments
    ///
    /// * `run` - The run to defer
    /// * `requirement` - The instance this run requires
    /// * `reason` - Why this run is being deferred
    /// * `ctx` - The state of the current cycle
    fn defer(
        &self,
        run: &Run,
        requirement: InstanceProfile,
        reason: DeferReason,
        ctx: &mut CycleContext,
    ) -> MatchOutcome {
        event!(Level::INFO, run = run.id, reason = reason.as_str(), msg = "Deferred");
        // keep track of this requirement so an idle node that fits it isn't retired
        ctx.deferred.push(requirement);
        ctx.report.deferred += 1;
        MatchOutcome::Deferred(reason)
    }
}

/// Get the instance an idle node was provisioned as
///
/// Warm pool nodes were built from our defaults while all others were built for the run they are
/// still labeled with. Returns None if that run no longer exists.
///
/// # Arguments
///
/// * `backends` - The systems to talk to
/// * `node` - The idle node
/// * `settings` - The current cluster settings
/// * `conf` - The autoscaler settings
pub async fn idle_profile(
    backends: &Backends,
    node: &ComputeNode,
    settings: &ClusterSettings,
    conf: &AutoscalerConf,
) -> Result<Option<InstanceProfile>, Error> {
    if node.is_free(&conf.free_node_prefix) {
        return settings.default_profile().map(Some);
    }
    let id = helpers::parse_run_id(&node.run_id)?;
    let run = backends.store.load_run(id).await?;
    Ok(run.and_then(|run| run.instance))
}
