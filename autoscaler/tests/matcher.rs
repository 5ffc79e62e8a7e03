//! Tests matching pending runs to nodes

use pipeline_autoscaler::conf::ClusterSettings;
use pipeline_autoscaler::libs::{DeferReason, MatchOutcome};
use pipeline_autoscaler::models::{
    ComputeNode, Disk, InstanceProfile, PipelinePod, RUN_ID_LABEL, Run, RunStatus,
};
use pipeline_autoscaler::test_utilities::{self, Harness};
use pipeline_autoscaler::{Error, contains, is};

/// Build an instance that never matches our defaults
fn other_profile() -> InstanceProfile {
    InstanceProfile::new("r5.large", 10, "pipeline/other:1")
}

#[tokio::test]
async fn dispatch_once_per_run() -> Result<(), Error> {
    let harness = Harness::new(ClusterSettings::default());
    harness.store.add_run(Run::new(1));
    let disks = vec![Disk::new("vol-1", 50), Disk::new("vol-2", 30)];
    harness.cloud.set_disks(disks.clone());
    // keep our provisioning task from finishing
    harness.cloud.hold();
    let matcher = harness.matcher();
    let mut ctx = harness.context();
    let run = Run::new(1);
    let first = matcher.process(&run, &mut ctx).await?;
    is!(first, MatchOutcome::Dispatched);
    // the same run must not be dispatched again while in flight
    let second = matcher.process(&run, &mut ctx).await?;
    is!(second, MatchOutcome::InFlight);
    is!(harness.tracker.is_in_flight("1"), true);
    // let our task finish
    harness.cloud.release();
    test_utilities::settle(&harness.tracker).await?;
    is!(harness.cloud.scale_ups().len(), 1);
    // a successful attempt forgets the run
    is!(harness.tracker.state("1"), None);
    // the node we were given was saved
    let saved = harness.store.run(1).and_then(|run| run.instance);
    is!(saved.and_then(|instance| instance.node_name).is_some(), true);
    // the disks on our new node were registered and priced
    is!(harness.store.registered_disks(), vec![(1, disks)]);
    is!(harness.store.prices(), vec![1]);
    Ok(())
}

#[tokio::test]
async fn bound_runs_are_skipped() -> Result<(), Error> {
    let harness = Harness::new(ClusterSettings::default());
    harness.cluster.add_node(ComputeNode::new("node-1", "1"));
    harness.cluster.add_pod(PipelinePod::unschedulable("1"));
    let mut ctx = harness.context();
    let outcome = harness.matcher().process(&Run::new(1), &mut ctx).await?;
    is!(outcome, MatchOutcome::AlreadyBound);
    is!(harness.cloud.scale_ups().len(), 0);
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_fail_the_run() -> Result<(), Error> {
    let settings = ClusterSettings {
        max_retries: 2,
        ..ClusterSettings::default()
    };
    let harness = Harness::new(settings);
    harness.store.add_run(Run::new(1));
    let matcher = harness.matcher();
    // fail two provisioning attempts
    for attempt in 1..=2 {
        harness.cloud.fail_next_up(Some(1));
        let mut ctx = harness.context();
        let outcome = matcher.process(&Run::new(1), &mut ctx).await?;
        is!(outcome, MatchOutcome::Dispatched);
        test_utilities::settle(&harness.tracker).await?;
        is!(harness.tracker.attempts("1"), attempt);
    }
    // the next cycle should give up on this run
    let mut ctx = harness.context();
    let outcome = matcher.process(&Run::new(1), &mut ctx).await?;
    is!(outcome, MatchOutcome::RetriesExhausted);
    is!(ctx.report.failed, 1);
    is!(harness.tracker.state("1"), None);
    let status = harness.store.run(1).map(|run| run.status);
    is!(status, Some(RunStatus::Failure));
    is!(harness.cloud.scale_ups().len(), 2);
    Ok(())
}

#[tokio::test]
async fn quota_failures_are_not_counted() -> Result<(), Error> {
    let harness = Harness::new(ClusterSettings::default());
    harness.store.add_run(Run::new(1));
    let matcher = harness.matcher();
    // exceed our quota
    harness.cloud.fail_next_up(Some(harness.conf.quota_exceeded_code));
    let mut ctx = harness.context();
    matcher.process(&Run::new(1), &mut ctx).await?;
    test_utilities::settle(&harness.tracker).await?;
    is!(harness.tracker.attempts("1"), 0);
    is!(harness.tracker.is_in_flight("1"), false);
    // a generic failure still counts
    harness.cloud.fail_next_up(Some(1));
    let mut ctx = harness.context();
    matcher.process(&Run::new(1), &mut ctx).await?;
    test_utilities::settle(&harness.tracker).await?;
    is!(harness.tracker.attempts("1"), 1);
    Ok(())
}

#[tokio::test]
async fn spot_falls_back_once() -> Result<(), Error> {
    let settings = ClusterSettings {
        max_spot_attempts: 1,
        ..ClusterSettings::default()
    };
    let harness = Harness::new(settings);
    let requested = other_profile().spot(true);
    harness.store.add_run(Run::new(1).instance(requested));
    let matcher = harness.matcher();
    // run out of spot capacity
    harness.cloud.fail_next_up(Some(harness.conf.spot_exhausted_code));
    let mut ctx = harness.context();
    let run = harness.store.run(1).ok_or(Error::new("missing run"))?;
    matcher.process(&run, &mut ctx).await?;
    test_utilities::settle(&harness.tracker).await?;
    is!(harness.tracker.spot_failures("1"), 1);
    // block dispatching so only the fallback itself is persisted
    for _ in 0..2 {
        let mut ctx = harness.context();
        ctx.settings.max_nodeup_threads = 0;
        let run = harness.store.run(1).ok_or(Error::new("missing run"))?;
        let outcome = matcher.process(&run, &mut ctx).await?;
        is!(outcome, MatchOutcome::Deferred(DeferReason::TooManyInFlight));
        // the deferred requirement is on demand
        is!(ctx.deferred.iter().all(|req| !req.spot), true);
    }
    let fallbacks = harness
        .store
        .instance_updates()
        .iter()
        .filter(|(_, instance)| !instance.spot)
        .count();
    is!(fallbacks, 1);
    let saved = harness.store.run(1).and_then(|run| run.instance);
    is!(saved.map(|instance| instance.spot), Some(false));
    Ok(())
}

#[tokio::test]
async fn existing_instances_are_recovered() -> Result<(), Error> {
    let harness = Harness::new(ClusterSettings::default());
    harness.store.add_run(Run::new(1));
    let default = harness.settings.default_profile()?;
    harness
        .cloud
        .add_instance("1", default.assigned("i-1", "10.0.0.9", "node-9"));
    let mut ctx = harness.context();
    let outcome = harness.matcher().process(&Run::new(1), &mut ctx).await?;
    is!(outcome, MatchOutcome::Recovered);
    is!(ctx.report.recovered, 1);
    is!(harness.cloud.scale_ups().len(), 0);
    let saved = harness.store.run(1).and_then(|run| run.instance);
    is!(
        saved.and_then(|instance| instance.node_name),
        Some("node-9".to_owned())
    );
    Ok(())
}

#[tokio::test]
async fn idle_nodes_are_reassigned() -> Result<(), Error> {
    let harness = Harness::new(ClusterSettings::default());
    let default = harness.settings.default_profile()?;
    // run 7 finished with its node still up
    harness.store.add_run(
        Run::new(7)
            .status(RunStatus::Success)
            .instance(default.assigned("i-7", "10.0.0.7", "node-7")),
    );
    harness.store.add_run(Run::new(1));
    harness.cluster.add_node(ComputeNode::new("node-7", "7"));
    let disks = vec![Disk::new("vol-7", 50)];
    harness.cloud.set_disks(disks.clone());
    let mut ctx = harness.context();
    let outcome = harness.matcher().process(&Run::new(1), &mut ctx).await?;
    is!(outcome, MatchOutcome::Reassigned("node-7".to_owned()));
    // the reused disks now belong to run 1
    is!(harness.store.registered_disks(), vec![(1, disks)]);
    is!(harness.store.prices(), vec![1]);
    is!(ctx.report.reassigned, 1);
    is!(harness.cloud.scale_ups().len(), 0);
    is!(harness.cloud.reassigns(), vec![("7".to_owned(), "1".to_owned())]);
    let saved = harness.store.run(1).and_then(|run| run.instance);
    is!(
        saved.and_then(|instance| instance.node_name),
        Some("node-7".to_owned())
    );
    let label = ("node-7".to_owned(), RUN_ID_LABEL.to_owned(), "1".to_owned());
    contains!(harness.cluster.labels(), &label);
    // this node can't be handed out again this cycle
    is!(ctx.idle_nodes().len(), 0);
    Ok(())
}

#[tokio::test]
async fn runs_need_nodes_for_their_platform() -> Result<(), Error> {
    let harness = Harness::new(ClusterSettings::default());
    harness.store.add_run(Run::new(1).platform("windows"));
    // our warm node was built for the default platform
    harness.cluster.add_node(ComputeNode::new("node-0", "p-0"));
    let mut ctx = harness.context();
    let run = harness.store.run(1).ok_or(Error::new("missing run"))?;
    let outcome = harness.matcher().process(&run, &mut ctx).await?;
    is!(outcome, MatchOutcome::Dispatched);
    is!(harness.cloud.reassigns().len(), 0);
    test_utilities::settle(&harness.tracker).await?;
    let ups = harness.cloud.scale_ups();
    is!(ups.len(), 1);
    is!(ups[0].1.platform.as_deref(), Some("windows"));
    Ok(())
}

#[tokio::test]
async fn refused_reassignments_provision() -> Result<(), Error> {
    let harness = Harness::new(ClusterSettings::default());
    harness.store.add_run(Run::new(1));
    harness.cluster.add_node(ComputeNode::new("node-0", "p-0"));
    harness.cloud.reassign_result("p-0", false);
    let mut ctx = harness.context();
    let outcome = harness.matcher().process(&Run::new(1), &mut ctx).await?;
    is!(outcome, MatchOutcome::Dispatched);
    is!(harness.cloud.reassigns().len(), 1);
    test_utilities::settle(&harness.tracker).await?;
    is!(harness.cloud.scale_ups().len(), 1);
    Ok(())
}

#[tokio::test]
async fn full_clusters_defer() -> Result<(), Error> {
    let settings = ClusterSettings {
        max_size: 1,
        ..ClusterSettings::default()
    };
    let harness = Harness::new(settings);
    harness.store.add_run(Run::new(7).instance(other_profile()));
    harness.store.add_run(Run::new(1));
    // an idle node that does not match our run
    harness.cluster.add_node(ComputeNode::new("node-7", "7"));
    let mut ctx = harness.context();
    let outcome = harness.matcher().process(&Run::new(1), &mut ctx).await?;
    is!(outcome, MatchOutcome::Deferred(DeferReason::ClusterFull));
    is!(ctx.report.deferred, 1);
    is!(harness.cloud.scale_downs().len(), 0);
    is!(harness.cloud.scale_ups().len(), 0);
    Ok(())
}

#[tokio::test]
async fn full_clusters_evict_idle_nodes() -> Result<(), Error> {
    let settings = ClusterSettings {
        max_size: 1,
        kill_not_matching_nodes: true,
        ..ClusterSettings::default()
    };
    let harness = Harness::new(settings);
    harness.store.add_run(Run::new(7).instance(other_profile()));
    harness.store.add_run(Run::new(1));
    harness.cluster.add_node(ComputeNode::new("node-7", "7"));
    let mut ctx = harness.context();
    let outcome = harness.matcher().process(&Run::new(1), &mut ctx).await?;
    is!(outcome, MatchOutcome::Dispatched);
    is!(harness.cloud.scale_downs(), vec!["node-7".to_owned()]);
    is!(ctx.report.terminated, 1);
    test_utilities::settle(&harness.tracker).await?;
    is!(harness.cloud.scale_ups().len(), 1);
    Ok(())
}

#[tokio::test]
async fn full_clusters_without_idle_nodes_defer() -> Result<(), Error> {
    let settings = ClusterSettings {
        max_size: 1,
        kill_not_matching_nodes: true,
        ..ClusterSettings::default()
    };
    let harness = Harness::new(settings);
    harness.store.add_run(Run::new(1));
    // this node is busy running its own pod
    harness.cluster.add_node(ComputeNode::new("node-7", "7"));
    harness.cluster.add_pod(PipelinePod::unschedulable("7").waiting(false));
    let mut ctx = harness.context();
    let outcome = harness.matcher().process(&Run::new(1), &mut ctx).await?;
    is!(outcome, MatchOutcome::Deferred(DeferReason::NoEvictableNode));
    is!(harness.cloud.scale_downs().len(), 0);
    Ok(())
}
