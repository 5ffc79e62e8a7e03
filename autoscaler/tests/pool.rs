//! Tests retiring idle nodes and filling the warm pool

use pipeline_autoscaler::conf::ClusterSettings;
use pipeline_autoscaler::models::{
    ComputeNode, InstanceProfile, NodeHealth, PipelinePod, Run, RunStatus,
};
use pipeline_autoscaler::test_utilities::Harness;
use pipeline_autoscaler::{Error, contains, is, is_not_in};

#[tokio::test]
async fn warm_pool_fills_to_min_size() -> Result<(), Error> {
    let settings = ClusterSettings {
        min_size: 3,
        ..ClusterSettings::default()
    };
    let harness = Harness::new(settings);
    harness.cluster.add_node(ComputeNode::new("node-0", "p-0"));
    let mut ctx = harness.context();
    harness.pool().reconcile(&mut ctx).await?;
    // we already had one free node so only two more are needed
    let ups = harness.cloud.free_ups();
    is!(ups.len(), 2);
    is!(ctx.report.warm_dispatched, 2);
    is!(ctx.report.terminated, 0);
    // our warm nodes are joined before reconcile returns
    is!(harness.tracker.in_flight(), 0);
    is!(harness.tracker.queued(), 0);
    is!(harness.cluster.nodes().len(), 3);
    // every warm node gets a unique free id and our default instance
    let default = harness.settings.default_profile()?;
    is!(ups[0].0 != ups[1].0, true);
    for (id, profile) in &ups {
        is!(id.starts_with(&harness.conf.free_node_prefix), true);
        is!(profile, &default);
    }
    Ok(())
}

#[tokio::test]
async fn failed_warm_nodes_are_forgotten() -> Result<(), Error> {
    let settings = ClusterSettings {
        min_size: 2,
        ..ClusterSettings::default()
    };
    let harness = Harness::new(settings);
    harness.cloud.fail_next_up(Some(harness.conf.spot_exhausted_code));
    let mut ctx = harness.context();
    harness.pool().reconcile(&mut ctx).await?;
    is!(harness.cloud.free_ups().len(), 2);
    is!(harness.cluster.nodes().len(), 1);
    is!(harness.tracker.queued(), 0);
    Ok(())
}

#[tokio::test]
async fn failed_nodes_fail_their_run() -> Result<(), Error> {
    let harness = Harness::new(ClusterSettings::default());
    harness.store.add_run(Run::new(7));
    let health = NodeHealth::failed(
        "DiskPressure",
        Some("KubeletHasDiskPressure".to_owned()),
        None,
    );
    harness
        .cluster
        .add_node(ComputeNode::new("node-7", "7").health(health));
    let mut ctx = harness.context();
    harness.pool().reconcile(&mut ctx).await?;
    contains!(harness.store.status_updates(), &(7, RunStatus::Failure));
    let status = (7, "DiskPressure: KubeletHasDiskPressure".to_owned());
    contains!(harness.store.pod_statuses(), &status);
    is!(harness.cloud.scale_downs(), vec!["node-7".to_owned()]);
    is!(ctx.report.failed, 1);
    is!(ctx.report.terminated, 1);
    Ok(())
}

#[tokio::test]
async fn failed_free_nodes_are_terminated() -> Result<(), Error> {
    let harness = Harness::new(ClusterSettings::default());
    let health = NodeHealth::failed("Ready", None, None);
    harness
        .cluster
        .add_node(ComputeNode::new("node-0", "p-0").health(health));
    let mut ctx = harness.context();
    harness.pool().reconcile(&mut ctx).await?;
    is!(harness.store.status_updates().len(), 0);
    is!(harness.cloud.scale_downs(), vec!["node-0".to_owned()]);
    is!(ctx.report.failed, 0);
    Ok(())
}

#[tokio::test]
async fn orphaned_nodes_are_terminated() -> Result<(), Error> {
    let harness = Harness::new(ClusterSettings::default());
    // run 8 no longer exists
    harness.cluster.add_node(ComputeNode::new("node-8", "8"));
    let mut ctx = harness.context();
    harness.pool().reconcile(&mut ctx).await?;
    is!(harness.cloud.scale_downs(), vec!["node-8".to_owned()]);
    Ok(())
}

#[tokio::test]
async fn expired_idle_nodes_are_terminated() -> Result<(), Error> {
    let harness = Harness::new(ClusterSettings::default());
    let profile = InstanceProfile::new("r5.large", 10, "pipeline/other:1");
    harness
        .store
        .add_run(Run::new(7).status(RunStatus::Success).instance(profile.clone()));
    harness
        .store
        .add_run(Run::new(8).status(RunStatus::Success).instance(profile));
    harness.cluster.add_node(ComputeNode::new("node-7", "7"));
    harness.cluster.add_node(ComputeNode::new("node-8", "8"));
    harness.cloud.expire("node-7");
    let mut ctx = harness.context();
    harness.pool().reconcile(&mut ctx).await?;
    is!(harness.cloud.scale_downs(), vec!["node-7".to_owned()]);
    Ok(())
}

#[tokio::test]
async fn nodes_are_reserved_for_deferred_runs() -> Result<(), Error> {
    let harness = Harness::new(ClusterSettings::default());
    let profile = InstanceProfile::new("r5.large", 10, "pipeline/other:1");
    harness
        .store
        .add_run(Run::new(7).status(RunStatus::Success).instance(profile.clone()));
    harness.cluster.add_node(ComputeNode::new("node-7", "7"));
    harness.cloud.expire("node-7");
    let mut ctx = harness.context();
    // a run that could use this node is waiting on a slot
    ctx.deferred.push(profile);
    harness.pool().reconcile(&mut ctx).await?;
    is!(ctx.report.reserved, 1);
    is_not_in!(harness.cloud.scale_downs(), "node-7".to_owned());
    Ok(())
}

#[tokio::test]
async fn busy_and_paused_nodes_are_left_alone() -> Result<(), Error> {
    let harness = Harness::new(ClusterSettings::default());
    harness.store.add_run(Run::new(7));
    harness.cluster.add_node(ComputeNode::new("node-7", "7"));
    harness.cluster.add_node(ComputeNode::new("node-9", "9").paused());
    harness
        .cluster
        .add_pod(PipelinePod::unschedulable("7").waiting(false));
    harness.cloud.expire("node-7");
    harness.cloud.expire("node-9");
    let mut ctx = harness.context();
    harness.pool().reconcile(&mut ctx).await?;
    is!(harness.cloud.scale_downs().len(), 0);
    Ok(())
}

#[tokio::test]
async fn default_nodes_are_kept_at_min_size() -> Result<(), Error> {
    let settings = ClusterSettings {
        min_size: 2,
        ..ClusterSettings::default()
    };
    let harness = Harness::new(settings);
    harness.cluster.add_node(ComputeNode::new("node-0", "p-0"));
    harness.cluster.add_node(ComputeNode::new("node-1", "p-1"));
    harness.cloud.expire("node-0");
    harness.cloud.expire("node-1");
    let mut ctx = harness.context();
    harness.pool().reconcile(&mut ctx).await?;
    // both nodes hold our floor even though they are expired
    is!(harness.cloud.scale_downs().len(), 0);
    is!(harness.cloud.free_ups().len(), 0);
    Ok(())
}

#[tokio::test]
async fn default_nodes_above_min_size_expire() -> Result<(), Error> {
    let settings = ClusterSettings {
        min_size: 1,
        ..ClusterSettings::default()
    };
    let harness = Harness::new(settings);
    harness.cluster.add_node(ComputeNode::new("node-0", "p-0"));
    harness.cluster.add_node(ComputeNode::new("node-1", "p-1"));
    harness.cloud.expire("node-0");
    harness.cloud.expire("node-1");
    let mut ctx = harness.context();
    harness.pool().reconcile(&mut ctx).await?;
    // the first node is retired and the second is kept to hold our floor
    is!(harness.cloud.scale_downs(), vec!["node-0".to_owned()]);
    is!(ctx.report.terminated, 1);
    is!(harness.cloud.free_ups().len(), 0);
    Ok(())
}

#[tokio::test]
async fn malformed_defaults_still_retire_nodes() -> Result<(), Error> {
    let mut settings = ClusterSettings {
        min_size: 3,
        ..ClusterSettings::default()
    };
    settings.defaults.image = String::new();
    let harness = Harness::new(settings);
    // run 8 no longer exists
    harness.cluster.add_node(ComputeNode::new("node-8", "8"));
    let health = NodeHealth::failed("Ready", None, None);
    harness
        .cluster
        .add_node(ComputeNode::new("node-9", "p-9").health(health));
    harness.cluster.add_node(ComputeNode::new("node-0", "p-0"));
    harness.cloud.expire("node-0");
    let mut ctx = harness.context();
    // our broken defaults are still reported
    is!(harness.pool().reconcile(&mut ctx).await.is_err(), true);
    contains!(harness.cloud.scale_downs(), &"node-8".to_owned());
    contains!(harness.cloud.scale_downs(), &"node-9".to_owned());
    // free nodes are left alone since we can't tell what they are
    is_not_in!(harness.cloud.scale_downs(), "node-0".to_owned());
    is!(harness.cloud.free_ups().len(), 0);
    Ok(())
}
