//! Retires idle nodes we don't need and keeps a warm floor of free nodes

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, event, instrument};

use super::backends::Backends;
use super::context::CycleContext;
use super::helpers;
use super::provision::{ProvisionOutcome, Provisioner};
use super::retries::RetryTracker;
use crate::Error;
use crate::conf::AutoscalerConf;
use crate::models::{ComputeNode, InstanceProfile, NodeHealth, RunStatus};

/// What happened to a single node during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// This node was already claimed this cycle or is running a pod
    Claimed,
    /// This node was broken and terminated
    Failed,
    /// This node was bound to a run that no longer exists and was terminated
    Orphaned,
    /// This node was kept for a deferred run that could use it
    Reserved,
    /// This node was kept to hold our warm floor
    Kept,
    /// This node was at the end of its billing period and terminated
    Expired,
    /// This node was left alone
    Idle,
}

/// Maintains the pool of idle nodes
#[derive(Clone)]
pub struct FreeNodePool {
    /// The autoscaler settings
    conf: Arc<AutoscalerConf>,
    /// The systems we reconcile against
    backends: Backends,
    /// The shared retry state
    tracker: RetryTracker,
    /// Dispatches warm pool nodes
    provisioner: Provisioner,
}

impl FreeNodePool {
    /// Create a new free node pool
    ///
    /// # Arguments
    ///
    /// * `conf` - The autoscaler settings
    /// * `backends` - The systems to reconcile against
    /// * `tracker` - The shared retry state
    /// * `provisioner` - Dispatches warm pool nodes
    pub fn new(
        conf: Arc<AutoscalerConf>,
        backends: Backends,
        tracker: RetryTracker,
        provisioner: Provisioner,
    ) -> Self {
        FreeNodePool {
            conf,
            backends,
            tracker,
            provisioner,
        }
    }

    /// Retire unneeded nodes and then top up our warm floor
    ///
    /// # Arguments
    ///
    /// * `ctx` - The state of the current cycle
    #[instrument(name = "FreeNodePool::reconcile", skip_all, err(Debug))]
    pub async fn reconcile(&self, ctx: &mut CycleContext) -> Result<(), Error> {
        // broken defaults only affect free nodes so still retire everything else
        let default = ctx.settings.default_profile();
        if let Err(err) = &default {
            event!(Level::ERROR, error = err.to_string(), msg = "Default instance is malformed");
        }
        // check every node that was not paused
        let nodes = ctx
            .nodes
            .iter()
            .filter(|node| !node.paused)
            .cloned()
            .collect::<Vec<_>>();
        for node in nodes {
            match self.inspect(&node, default.as_ref().ok(), ctx).await {
                Ok(disposition) => {
                    event!(Level::DEBUG, node = &node.name, disposition = ?disposition);
                }
                Err(err) => {
                    event!(Level::ERROR, node = &node.name, error = err.to_string());
                }
            }
        }
        // top up our warm floor
        self.fill(default?, ctx).await;
        Ok(())
    }

    /// Decide what to do with a single node
    ///
    /// # Arguments
    ///
    /// * `node` - The node to inspect
    /// * `default` - The platform default instance if it is valid
    /// * `ctx` - The state of the current cycle
    async fn inspect(
        &self,
        node: &ComputeNode,
        default: Option<&InstanceProfile>,
        ctx: &mut CycleContext,
    ) -> Result<Disposition, Error> {
        // the matcher already took care of these nodes
        if ctx.evicted.contains(&node.name) || ctx.reassigned.contains(&node.name) {
            return Ok(Disposition::Claimed);
        }
        let free = node.is_free(&self.conf.free_node_prefix);
        // retire broken nodes and fail whatever was running on them
        if let NodeHealth::Failed { .. } = &node.health {
            // a broken node is retired even if we can't fail its run
            if !free {
                if let Err(err) = self.fail_run(node, ctx).await {
                    event!(Level::ERROR, node = &node.name, error = err.to_string());
                }
            }
            self.terminate(node, ctx).await?;
            return Ok(Disposition::Failed);
        }
        // get the instance this node was built as
        let profile = if free {
            match default {
                Some(default) => default.clone(),
                None => return Ok(Disposition::Idle),
            }
        } else {
            let id = helpers::parse_run_id(&node.run_id)?;
            match self.backends.store.load_run(id).await? {
                Some(run) => match run.instance {
                    Some(instance) => instance,
                    // we don't know what this node is so leave it be
                    None => return Ok(Disposition::Idle),
                },
                None => {
                    // the run this node was built for is gone
                    self.terminate(node, ctx).await?;
                    return Ok(Disposition::Orphaned);
                }
            }
        };
        // skip nodes with work on them
        if !ctx.is_idle(node) {
            return Ok(Disposition::Claimed);
        }
        // keep nodes that a deferred run could use
        if ctx.take_deferred(&profile) {
            ctx.report.reserved += 1;
            return Ok(Disposition::Reserved);
        }
        // keep default nodes while we are at or under our floor
        let size = ctx.cluster_size(self.tracker.in_flight());
        let is_default = default.is_some_and(|default| profile.matches(default));
        if is_default && size <= ctx.settings.min_size {
            return Ok(Disposition::Kept);
        }
        // retire nodes at the end of their billing period
        if self.backends.cloud.is_node_expired(&node.name).await? {
            self.terminate(node, ctx).await?;
            return Ok(Disposition::Expired);
        }
        Ok(Disposition::Idle)
    }

    /// Fail the run bound to a broken node
    ///
    /// # Arguments
    ///
    /// * `node` - The broken node
    /// * `ctx` - The state of the current cycle
    async fn fail_run(&self, node: &ComputeNode, ctx: &mut CycleContext) -> Result<(), Error> {
        let id = helpers::parse_run_id(&node.run_id)?;
        event!(
            Level::WARN,
            node = &node.name,
            run = id,
            health = node.health.describe(),
            msg = "Node failed"
        );
        self.backends
            .store
            .update_status_if_not_final(id, RunStatus::Failure)
            .await?;
        self.backends
            .store
            .update_pod_status(id, &node.health.describe())
            .await?;
        ctx.report.failed += 1;
        Ok(())
    }

    /// Terminate a node
    ///
    /// # Arguments
    ///
    /// * `node` - The node to terminate
    /// * `ctx` - The state of the current cycle
    async fn terminate(&self, node: &ComputeNode, ctx: &mut CycleContext) -> Result<(), Error> {
        self.backends.cloud.scale_down_node(&node.name).await?;
        ctx.evict(&node.name);
        event!(Level::INFO, node = &node.name, msg = "Terminated node");
        Ok(())
    }

    /// Dispatch warm pool nodes until we reach our floor and wait for them
    ///
    /// # Arguments
    ///
    /// * `default` - The platform default instance
    /// * `ctx` - The state of the current cycle
    async fn fill(&self, default: InstanceProfile, ctx: &mut CycleContext) {
        let active = ctx.cluster_size(self.tracker.in_flight());
        let missing = ctx.settings.min_size.saturating_sub(active);
        if missing == 0 {
            return;
        }
        event!(Level::INFO, active, min = ctx.settings.min_size, missing);
        // dispatch all of our warm nodes at once
        let handles = (0..missing)
            .map(|_| self.provisioner.dispatch_free(default.clone()))
            .collect::<Vec<_>>();
        ctx.report.warm_dispatched += missing;
        // wait for them to finish but not forever
        let timeout = Duration::from_secs(self.conf.warm_pool_timeout);
        match tokio::time::timeout(timeout, join_all(handles)).await {
            Ok(results) => {
                let failed = results
                    .iter()
                    .filter(|result| !matches!(result, Ok(ProvisionOutcome::Warm(_))))
                    .count();
                if failed > 0 {
                    event!(Level::WARN, failed, msg = "Warm pool nodes failed");
                }
            }
            // our tasks keep running and release their own markers
            Err(_) => event!(Level::WARN, missing, msg = "Timed out waiting for warm pool"),
        }
    }
}
