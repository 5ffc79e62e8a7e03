//! Finds the pending runs that need a node and feeds them to the matcher in priority order

use itertools::Itertools;
use rand::seq::SliceRandom;
use std::cmp::Ordering;
use tracing::{Level, event, instrument};

use super::backends::Backends;
use super::context::CycleContext;
use super::helpers;
use super::matcher::{MatchOutcome, NodeMatcher};
use super::retries::RetryTracker;
use crate::conf::ClusterSettings;
use crate::models::{PipelinePod, Run};

/// A pending pod and the run backing it
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The pod for this run
    pub pod: PipelinePod,
    /// The run backing this pod
    pub run: Run,
}

impl Candidate {
    /// Compare the parents of two candidates
    ///
    /// Runs without a parent sort last unless `none_first` is set.
    ///
    /// # Arguments
    ///
    /// * `other` - The candidate to compare against
    /// * `none_first` - Whether runs without a parent go first
    fn cmp_parent(&self, other: &Candidate, none_first: bool) -> Ordering {
        match (self.run.parent_id, other.run.parent_id) {
            (Some(left), Some(right)) => left.cmp(&right),
            (None, None) => Ordering::Equal,
            (None, Some(_)) if none_first => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) if none_first => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
        }
    }
}

/// Order candidates by parent and then by priority score
///
/// This sort is stable so candidates that tie keep the order they were listed in.
///
/// # Arguments
///
/// * `candidates` - The candidates to order
/// * `settings` - The current cluster settings
pub fn order(candidates: Vec<Candidate>, settings: &ClusterSettings) -> Vec<Candidate> {
    // random scheduling ignores all priorities
    if settings.random_scheduling {
        let mut candidates = candidates;
        candidates.shuffle(&mut rand::rng());
        return candidates;
    }
    let none_first = settings.high_non_batch_priority;
    candidates
        .into_iter()
        .sorted_by(|left, right| {
            left.cmp_parent(right, none_first)
                .then_with(|| right.pod.priority().cmp(&left.pod.priority()))
        })
        .collect()
}

/// Scans pipeline pods for runs waiting on a node
#[derive(Clone)]
pub struct PendingScanner {
    /// The systems we scan
    backends: Backends,
    /// The shared retry state
    tracker: RetryTracker,
    /// Decides what to do for each pending run
    matcher: NodeMatcher,
}

impl PendingScanner {
    /// Create a new pending scanner
    ///
    /// # Arguments
    ///
    /// * `backends` - The systems to scan
    /// * `tracker` - The shared retry state
    /// * `matcher` - The matcher to feed pending runs to
    pub fn new(backends: Backends, tracker: RetryTracker, matcher: NodeMatcher) -> Self {
        PendingScanner {
            backends,
            tracker,
            matcher,
        }
    }

    /// Scan our pods and match any runs that are waiting on a node
    ///
    /// Failures for a single run are logged and never stop the rest of the scan.
    ///
    /// # Arguments
    ///
    /// * `pods` - The pipeline pods in the cluster
    /// * `ctx` - The state of the current cycle
    #[instrument(name = "PendingScanner::scan", skip_all)]
    pub async fn scan(&self, pods: &[PipelinePod], ctx: &mut CycleContext) {
        // resolve the runs for our pods
        let candidates = self.resolve(pods).await;
        // order our candidates and only keep the ones k8s can't place
        let pending = order(candidates, &ctx.settings)
            .into_iter()
            .filter(|candidate| candidate.pod.unschedulable)
            .collect::<Vec<_>>();
        event!(Level::INFO, pending = pending.len());
        // match each pending run one at a time
        for candidate in pending {
            match self.matcher.process(&candidate.run, ctx).await {
                Ok(MatchOutcome::Deferred(_)) | Ok(MatchOutcome::Dispatched) => (),
                Ok(outcome) => {
                    event!(Level::DEBUG, run = candidate.run.id, outcome = ?outcome);
                }
                Err(err) => {
                    event!(Level::ERROR, run = candidate.run.id, error = err.to_string());
                }
            }
        }
    }

    /// Resolve the runs for all active pipeline pods
    ///
    /// # Arguments
    ///
    /// * `pods` - The pipeline pods in the cluster
    async fn resolve(&self, pods: &[PipelinePod]) -> Vec<Candidate> {
        let mut candidates = Vec::with_capacity(pods.len());
        // finished pods are cleaned up elsewhere
        for pod in pods.iter().filter(|pod| !pod.phase.is_final()) {
            // get the run for this pod
            let run = match helpers::parse_run_id(&pod.name) {
                Ok(id) => match self.backends.store.load_run(id).await {
                    Ok(run) => run,
                    Err(err) => {
                        // we can't tell if this run exists so try again next cycle
                        event!(Level::WARN, pod = &pod.name, error = err.to_string());
                        continue;
                    }
                },
                Err(err) => {
                    event!(Level::WARN, pod = &pod.name, error = err.to_string());
                    None
                }
            };
            match run {
                // skip runs that don't need a node
                Some(run) if run.status.is_paused() || run.status.is_final() => (),
                Some(run) => candidates.push(Candidate {
                    pod: pod.clone(),
                    run,
                }),
                None => self.remove_orphan(pod).await,
            }
        }
        candidates
    }

    /// Delete a pod whose run no longer exists
    ///
    /// # Arguments
    ///
    /// * `pod` - The orphaned pod
    async fn remove_orphan(&self, pod: &PipelinePod) {
        event!(Level::INFO, pod = &pod.name, msg = "Deleting orphaned pod");
        self.tracker.clear(&pod.name);
        if let Err(err) = self.backends.orchestrator.delete_pod(&pod.name).await {
            event!(Level::ERROR, pod = &pod.name, error = err.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Candidate, order};
    use crate::conf::ClusterSettings;
    use crate::models::{PipelinePod, Run};

    /// Build a candidate for ordering
    fn candidate(id: u64, parent: Option<u64>, score: i64) -> Candidate {
        let mut run = Run::new(id);
        run.parent_id = parent;
        Candidate {
            pod: PipelinePod::unschedulable(id.to_string()).score(score.to_string()),
            run,
        }
    }

    /// Get the run ids in order
    fn ids(candidates: &[Candidate]) -> Vec<u64> {
        candidates.iter().map(|candidate| candidate.run.id).collect()
    }

    #[test]
    fn parents_then_score() {
        let candidates = vec![
            candidate(1, Some(5), 10),
            candidate(2, Some(5), 20),
            candidate(3, None, 100),
        ];
        let ordered = order(candidates, &ClusterSettings::default());
        assert_eq!(ids(&ordered), vec![2, 1, 3]);
    }

    #[test]
    fn high_non_batch_priority_goes_first() {
        let candidates = vec![
            candidate(1, Some(5), 10),
            candidate(2, Some(5), 20),
            candidate(3, None, 100),
        ];
        let settings = ClusterSettings {
            high_non_batch_priority: true,
            ..ClusterSettings::default()
        };
        let ordered = order(candidates, &settings);
        assert_eq!(ids(&ordered), vec![3, 2, 1]);
    }

    #[test]
    fn lower_parents_first_and_ties_are_stable() {
        let candidates = vec![
            candidate(1, Some(9), 0),
            candidate(2, Some(4), 0),
            candidate(3, Some(4), 0),
            candidate(4, None, 0),
            candidate(5, None, 0),
        ];
        let ordered = order(candidates, &ClusterSettings::default());
        assert_eq!(ids(&ordered), vec![2, 3, 1, 4, 5]);
    }

    #[test]
    fn missing_scores_are_zero() {
        let mut unscored = candidate(1, Some(1), 0);
        unscored.pod.priority_score = None;
        let candidates = vec![unscored, candidate(2, Some(1), -5), candidate(3, Some(1), 5)];
        let ordered = order(candidates, &ClusterSettings::default());
        assert_eq!(ids(&ordered), vec![3, 1, 2]);
    }

    #[test]
    fn random_scheduling_keeps_every_candidate() {
        let candidates = (0..20).map(|id| candidate(id, Some(id), 0)).collect();
        let settings = ClusterSettings {
            random_scheduling: true,
            ..ClusterSettings::default()
        };
        let mut ordered = ids(&order(candidates, &settings));
        ordered.sort_unstable();
        assert_eq!(ordered, (0..20).collect::<Vec<_>>());
    }
}
