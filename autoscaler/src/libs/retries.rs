//! Tracks provisioning attempts for runs across cycles
//!
//! Provisioning tasks finish on worker threads long after the cycle that dispatched them so this
//! state is shared between the scaling loop and every in flight task. Only the operations below
//! are exposed so the one in flight task per run rule can't be broken by a stray increment.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::helpers;

/// The attempt bookkeeping for a single run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// The number of provisioning attempts that count towards the retry ceiling
    ///
    /// This can go negative if quota failures outnumber real attempts.
    pub attempts: i64,
    /// The number of times spot capacity was exhausted for this run
    pub spot_failures: u32,
    /// Whether a provisioning task is currently running for this run
    pub in_flight: bool,
}

/// Thread safe attempt counters and in flight markers by run id
#[derive(Debug, Default, Clone)]
pub struct RetryTracker {
    /// The retry state for each run we have tried to provision
    states: Arc<Mutex<HashMap<String, RetryState>>>,
}

impl RetryTracker {
    /// Start a provisioning attempt for a run
    ///
    /// Returns the attempt count before this attempt.
    ///
    /// # Arguments
    ///
    /// * `id` - The run we are provisioning a node for
    pub fn begin_attempt(&self, id: &str) -> i64 {
        // get a lock on our states
        let mut states = helpers::lock(&self.states);
        // get this runs state or start a new one
        let state = states.entry(id.to_owned()).or_default();
        let previous = state.attempts;
        // count this attempt and mark it as in flight
        state.attempts += 1;
        state.in_flight = true;
        previous
    }

    /// End a provisioning attempt for a run
    ///
    /// # Arguments
    ///
    /// * `id` - The run whose attempt finished
    /// * `clear_counters` - Whether to forget this runs counters too
    pub fn end_attempt(&self, id: &str, clear_counters: bool) {
        // get a lock on our states
        let mut states = helpers::lock(&self.states);
        if clear_counters {
            // drop this run entirely
            states.remove(id);
        } else if let Some(state) = states.get_mut(id) {
            // just clear our in flight marker
            state.in_flight = false;
        }
    }

    /// Record that spot capacity was exhausted for a run
    ///
    /// # Arguments
    ///
    /// * `id` - The run that could not get spot capacity
    pub fn record_spot_failure(&self, id: &str) {
        // runs that were forgotten mid attempt stay forgotten
        if let Some(state) = helpers::lock(&self.states).get_mut(id) {
            state.spot_failures += 1;
        }
    }

    /// Record that a provider quota was exceeded for a run
    ///
    /// This undoes the increment from [`RetryTracker::begin_attempt`] since quota failures
    /// are expected to clear up given time.
    ///
    /// # Arguments
    ///
    /// * `id` - The run that hit a quota
    pub fn record_quota_exceeded(&self, id: &str) {
        if let Some(state) = helpers::lock(&self.states).get_mut(id) {
            state.attempts -= 1;
        }
    }

    /// Forget everything about a run
    ///
    /// # Arguments
    ///
    /// * `id` - The run to forget
    pub fn clear(&self, id: &str) {
        helpers::lock(&self.states).remove(id);
    }

    /// Check if a provisioning task is running for a run
    ///
    /// # Arguments
    ///
    /// * `id` - The run to check
    pub fn is_in_flight(&self, id: &str) -> bool {
        helpers::lock(&self.states)
            .get(id)
            .is_some_and(|state| state.in_flight)
    }

    /// Get the number of counted attempts for a run
    ///
    /// # Arguments
    ///
    /// * `id` - The run to check
    pub fn attempts(&self, id: &str) -> i64 {
        helpers::lock(&self.states)
            .get(id)
            .map_or(0, |state| state.attempts)
    }

    /// Get the number of spot failures for a run
    ///
    /// # Arguments
    ///
    /// * `id` - The run to check
    pub fn spot_failures(&self, id: &str) -> u32 {
        helpers::lock(&self.states)
            .get(id)
            .map_or(0, |state| state.spot_failures)
    }

    /// Get a copy of the full state for a run if we are tracking it
    ///
    /// # Arguments
    ///
    /// * `id` - The run to check
    pub fn state(&self, id: &str) -> Option<RetryState> {
        helpers::lock(&self.states).get(id).copied()
    }

    /// Get the number of provisioning tasks currently in flight
    pub fn in_flight(&self) -> usize {
        helpers::lock(&self.states)
            .values()
            .filter(|state| state.in_flight)
            .count()
    }

    /// Get the number of runs we are currently tracking retries for
    pub fn queued(&self) -> usize {
        helpers::lock(&self.states).len()
    }
}
