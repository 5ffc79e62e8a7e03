//! Locks that keep two autoscalers from running a cycle at the same time
//!
//! Locks are never released. A cycle renews its hold while it runs and the lock lapses once the
//! hold time has passed after the cycle ends, so a crashed instance can't block others forever.

use chrono::prelude::*;
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::{Api, PostParams};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{Level, event, instrument};
use uuid::Uuid;

use super::helpers;
use crate::Error;

/// A lock that a scaling cycle must hold before running
#[async_trait::async_trait]
pub trait CycleLock: Send + Sync {
    /// Try to take this lock for a period of time
    ///
    /// Returns false if someone else holds it.
    ///
    /// # Arguments
    ///
    /// * `hold` - How long to hold this lock for
    async fn try_acquire(&self, hold: Duration) -> Result<bool, Error>;

    /// Extend a hold we already have on this lock
    ///
    /// Returns false if we no longer hold it.
    ///
    /// # Arguments
    ///
    /// * `hold` - How long to hold this lock for from now
    async fn renew(&self, hold: Duration) -> Result<bool, Error>;
}

/// Get the time a hold taken now expires at
///
/// # Arguments
///
/// * `now` - The current time
/// * `hold` - How long the hold lasts
fn hold_until(now: DateTime<Utc>, hold: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(hold).unwrap_or(chrono::Duration::zero())
}

/// A hold on a local lock
#[derive(Debug, Clone, Copy)]
struct LocalHold {
    /// Who holds this lock
    holder: Uuid,
    /// When this hold expires
    until: DateTime<Utc>,
}

/// A lock that only covers this process
#[derive(Debug)]
pub struct LocalLock {
    /// The identity we hold this lock as
    holder: Uuid,
    /// The current hold on this lock shared with our contenders
    hold: Arc<Mutex<Option<LocalHold>>>,
}

impl Default for LocalLock {
    fn default() -> Self {
        LocalLock {
            holder: Uuid::new_v4(),
            hold: Arc::new(Mutex::new(None)),
        }
    }
}

impl LocalLock {
    /// Get another handle to this lock that competes with us for it
    pub fn contender(&self) -> LocalLock {
        LocalLock {
            holder: Uuid::new_v4(),
            hold: self.hold.clone(),
        }
    }
}

#[async_trait::async_trait]
impl CycleLock for LocalLock {
    async fn try_acquire(&self, hold: Duration) -> Result<bool, Error> {
        let now = Utc::now();
        let mut current = helpers::lock(&self.hold);
        // someone else is still holding this lock
        if current.is_some_and(|current| current.holder != self.holder && current.until > now) {
            return Ok(false);
        }
        *current = Some(LocalHold {
            holder: self.holder,
            until: hold_until(now, hold),
        });
        Ok(true)
    }

    async fn renew(&self, hold: Duration) -> Result<bool, Error> {
        let mut current = helpers::lock(&self.hold);
        match current.as_mut() {
            Some(current) if current.holder == self.holder => {
                current.until = hold_until(Utc::now(), hold);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// A cluster wide lock backed by a Kubernetes lease
pub struct LeaseLock {
    /// API client for leases in our namespace
    api: Api<Lease>,
    /// The name of our lease
    name: String,
    /// The identity we hold this lease as
    holder: String,
}

/// The parts of a lease we care about
#[derive(Debug, Clone, PartialEq, Eq)]
struct LeaseHold {
    /// Who holds this lease
    holder: Option<String>,
    /// When this lease expires
    expires: Option<DateTime<Utc>>,
}

impl LeaseHold {
    /// Read the current hold from a lease
    ///
    /// # Arguments
    ///
    /// * `lease` - The lease to read
    fn from_lease(lease: &Lease) -> Result<Self, Error> {
        // read the lease spec as json so we don't depend on the time types k8s-openapi uses
        let spec = serde_json::to_value(&lease.spec)?;
        let holder = spec
            .get("holderIdentity")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let duration = spec.get("leaseDurationSeconds").and_then(Value::as_i64);
        let renewed = spec
            .get("renewTime")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|time| time.with_timezone(&Utc));
        let expires = match (renewed, duration) {
            (Some(renewed), Some(duration)) => Some(renewed + chrono::Duration::seconds(duration)),
            _ => None,
        };
        Ok(LeaseHold { holder, expires })
    }

    /// Whether a holder other than us can't take this lease yet
    ///
    /// # Arguments
    ///
    /// * `holder` - The identity trying to take this lease
    /// * `now` - The current time
    fn blocks(&self, holder: &str, now: DateTime<Utc>) -> bool {
        match (&self.holder, self.expires) {
            (Some(current), Some(expires)) => current != holder && expires > now,
            _ => false,
        }
    }
}

impl LeaseLock {
    /// Create a new lease lock
    ///
    /// # Arguments
    ///
    /// * `client` - Kubernetes client
    /// * `namespace` - The namespace to put our lease in
    /// * `name` - The name of our lease
    pub fn new(client: &kube::Client, namespace: &str, name: &str) -> Self {
        // get our hostname so its easy to tell who holds this lease
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "autoscaler".to_owned());
        LeaseLock {
            api: Api::namespaced(client.clone(), namespace),
            name: name.to_owned(),
            holder: format!("{host}-{}", Uuid::new_v4()),
        }
    }

    /// Build the lease we want to write
    ///
    /// # Arguments
    ///
    /// * `version` - The resource version of the lease we are replacing
    /// * `now` - The current time
    /// * `hold` - How long to hold this lease for
    fn build(
        &self,
        version: Option<String>,
        now: DateTime<Utc>,
        hold: Duration,
    ) -> Result<Lease, Error> {
        let lease = json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": {
                "name": &self.name,
                "resourceVersion": version,
            },
            "spec": {
                "holderIdentity": &self.holder,
                "leaseDurationSeconds": hold.as_secs().max(1),
                "renewTime": now.to_rfc3339_opts(SecondsFormat::Micros, true),
            }
        });
        Ok(serde_json::from_value(lease)?)
    }
}

/// Map a conflict from the API to a lost race
macro_rules! lost_race {
    ($result:expr) => {
        match $result {
            Ok(_) => Ok(true),
            // someone else wrote this lease first
            Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(false),
            Err(err) => Err(Error::from(err)),
        }
    };
}

#[async_trait::async_trait]
impl CycleLock for LeaseLock {
    #[instrument(name = "LeaseLock::try_acquire", skip(self), err(Debug))]
    async fn try_acquire(&self, hold: Duration) -> Result<bool, Error> {
        let now = Utc::now();
        match self.api.get_opt(&self.name).await? {
            // nobody has ever taken this lease
            None => {
                let lease = self.build(None, now, hold)?;
                lost_race!(self.api.create(&PostParams::default(), &lease).await)
            }
            Some(existing) => {
                let current = LeaseHold::from_lease(&existing)?;
                if current.blocks(&self.holder, now) {
                    event!(Level::DEBUG, holder = current.holder.as_deref(), msg = "Lease is held");
                    return Ok(false);
                }
                // take or renew this lease at the version we read
                let version = existing.metadata.resource_version.clone();
                let lease = self.build(version, now, hold)?;
                lost_race!(
                    self.api
                        .replace(&self.name, &PostParams::default(), &lease)
                        .await
                )
            }
        }
    }

    #[instrument(name = "LeaseLock::renew", skip(self), err(Debug))]
    async fn renew(&self, hold: Duration) -> Result<bool, Error> {
        let Some(existing) = self.api.get_opt(&self.name).await? else {
            return Ok(false);
        };
        // someone else took this lease from us
        let current = LeaseHold::from_lease(&existing)?;
        if current.holder.as_deref() != Some(self.holder.as_str()) {
            event!(Level::WARN, holder = current.holder.as_deref(), msg = "Lease was taken");
            return Ok(false);
        }
        let version = existing.metadata.resource_version.clone();
        let lease = self.build(version, Utc::now(), hold)?;
        lost_race!(
            self.api
                .replace(&self.name, &PostParams::default(), &lease)
                .await
        )
    }
}
