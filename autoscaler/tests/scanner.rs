//! Tests finding and ordering pending runs

use pipeline_autoscaler::conf::ClusterSettings;
use pipeline_autoscaler::models::{PipelinePod, PodPhase, Run, RunStatus};
use pipeline_autoscaler::test_utilities::{self, Harness};
use pipeline_autoscaler::{Error, contains, is, is_not_in};

/// Add three pending runs where two share a parent
fn add_batch(harness: &Harness) {
    harness.store.add_run(Run::new(1).parent(5));
    harness.store.add_run(Run::new(2).parent(5));
    harness.store.add_run(Run::new(3));
    harness.cluster.add_pod(PipelinePod::unschedulable("1").score("10"));
    harness.cluster.add_pod(PipelinePod::unschedulable("2").score("20"));
    harness.cluster.add_pod(PipelinePod::unschedulable("3").score("100"));
}

#[tokio::test]
async fn batch_runs_go_first() -> Result<(), Error> {
    // only allow a single dispatch so we can see who went first
    let settings = ClusterSettings {
        max_nodeup_threads: 1,
        ..ClusterSettings::default()
    };
    let harness = Harness::new(settings);
    harness.cloud.hold();
    add_batch(&harness);
    let mut ctx = harness.context();
    harness.scanner().scan(&harness.cluster.pods(), &mut ctx).await;
    is!(harness.tracker.is_in_flight("2"), true);
    is!(harness.tracker.is_in_flight("1"), false);
    is!(harness.tracker.is_in_flight("3"), false);
    is!(ctx.report.dispatched, 1);
    is!(ctx.report.deferred, 2);
    harness.cloud.release();
    Ok(())
}

#[tokio::test]
async fn high_non_batch_priority_goes_first() -> Result<(), Error> {
    let settings = ClusterSettings {
        max_nodeup_threads: 1,
        high_non_batch_priority: true,
        ..ClusterSettings::default()
    };
    let harness = Harness::new(settings);
    harness.cloud.hold();
    add_batch(&harness);
    let mut ctx = harness.context();
    harness.scanner().scan(&harness.cluster.pods(), &mut ctx).await;
    is!(harness.tracker.is_in_flight("3"), true);
    is!(harness.tracker.in_flight(), 1);
    harness.cloud.release();
    Ok(())
}

#[tokio::test]
async fn orphaned_pods_are_deleted() -> Result<(), Error> {
    let harness = Harness::new(ClusterSettings::default());
    // neither of these pods will have a run when we scan
    harness.cluster.add_pod(PipelinePod::unschedulable("42"));
    harness.cluster.add_pod(PipelinePod::unschedulable("not-a-run"));
    // run 42 failed to get a node before it was deleted
    harness.store.add_run(Run::new(42));
    harness.cloud.fail_next_up(Some(1));
    let mut ctx = harness.context();
    harness.matcher().process(&Run::new(42), &mut ctx).await?;
    test_utilities::settle(&harness.tracker).await?;
    is!(harness.tracker.attempts("42"), 1);
    harness.store.remove_run(42);
    let mut ctx = harness.context();
    harness.scanner().scan(&harness.cluster.pods(), &mut ctx).await;
    // its retry state is forgotten with its pod
    is!(harness.tracker.state("42"), None);
    is!(harness.tracker.queued(), 0);
    let deleted = harness.cluster.deleted_pods();
    contains!(deleted, &"42".to_owned());
    contains!(deleted, &"not-a-run".to_owned());
    is!(harness.cluster.pods().len(), 0);
    // nothing new was provisioned for our orphans
    is!(harness.cloud.scale_ups().len(), 1);
    Ok(())
}

#[tokio::test]
async fn unreachable_runs_are_kept() -> Result<(), Error> {
    let harness = Harness::new(ClusterSettings::default());
    harness.store.add_run(Run::new(1));
    harness.store.break_run(1);
    harness.cluster.add_pod(PipelinePod::unschedulable("1"));
    let mut ctx = harness.context();
    harness.scanner().scan(&harness.cluster.pods(), &mut ctx).await;
    is!(harness.cluster.deleted_pods().len(), 0);
    is!(harness.tracker.is_in_flight("1"), false);
    Ok(())
}

#[tokio::test]
async fn only_waiting_runs_are_matched() -> Result<(), Error> {
    let harness = Harness::new(ClusterSettings::default());
    harness.cloud.hold();
    harness.store.add_run(Run::new(1));
    harness.store.add_run(Run::new(2).status(RunStatus::Paused));
    harness.store.add_run(Run::new(3).status(RunStatus::Stopped));
    harness.store.add_run(Run::new(4));
    harness.store.add_run(Run::new(5));
    harness.cluster.add_pod(PipelinePod::unschedulable("1"));
    harness.cluster.add_pod(PipelinePod::unschedulable("2"));
    harness.cluster.add_pod(PipelinePod::unschedulable("3"));
    // k8s can place this one on its own
    harness.cluster.add_pod(PipelinePod::unschedulable("4").waiting(false));
    // this one already finished
    harness.cluster.add_pod(PipelinePod::unschedulable("5").phase(PodPhase::Failed));
    let mut ctx = harness.context();
    harness.scanner().scan(&harness.cluster.pods(), &mut ctx).await;
    is!(harness.tracker.in_flight(), 1);
    is!(harness.tracker.is_in_flight("1"), true);
    is_not_in!(harness.cluster.deleted_pods(), "3".to_owned());
    harness.cloud.release();
    Ok(())
}
