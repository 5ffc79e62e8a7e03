//! The utilties for tests involving the autoscaler

use std::sync::Arc;
use std::time::Duration;

use crate::Error;
use crate::conf::{AutoscalerConf, ClusterSettings};
use crate::libs::backends::{Backends, DryRunCloud, DryRunCluster, DryRunStore};
use crate::libs::{
    Autoscaler, CycleContext, FreeNodePool, LocalLock, NodeMatcher, PendingScanner, Provisioner,
    RetryTracker,
};

/// Check that two values are equal
#[macro_export]
macro_rules! is {
    ($left:expr, $right:expr) => {
        match (&$left, &$right) {
            (left, right) => {
                if left != right {
                    return Err($crate::Error::new(format!(
                        "Failed == check because the value {:#?} != {:#?}",
                        left, right
                    )));
                }
            }
        }
    };
    ($left:expr, $right:expr, $msg:expr) => {
        match (&$left, &$right) {
            (left, right) => {
                if left != right {
                    return Err($crate::Error::new(format!(
                        "Failed == check because {:#?} != {:#?}: Check '{}'",
                        left, right, $msg
                    )));
                }
            }
        }
    };
}

/// Check that two values are not equal
#[macro_export]
macro_rules! is_not {
    ($left:expr, $right:expr) => {
        match (&$left, &$right) {
            (left, right) => {
                if left == right {
                    return Err($crate::Error::new(format!(
                        "Failed != check {:#?} == {:#?}",
                        left, right
                    )));
                }
            }
        }
    };
}

/// Check that a list contains an item
#[macro_export]
macro_rules! contains {
    ($list:expr, $item:expr) => {
        match (&$list, $item) {
            (list, item) => {
                if !list.contains(item) {
                    return Err($crate::Error::new(format!(
                        "Failed contains check because {:#?} is not in {:#?}",
                        item, list
                    )));
                }
            }
        }
    };
}

/// Check that a list does not contain an item
#[macro_export]
macro_rules! is_not_in {
    ($list:expr, $item:expr) => {
        match (&$list, &$item) {
            (list, item) => {
                if list.contains(item) {
                    return Err($crate::Error::new(format!(
                        "Failed \"does not contain\" check because {:#?} is in {:#?}",
                        item, list
                    )));
                }
            }
        }
    };
}

/// A dry run cluster, cloud and store along with the engine components wired to them
pub struct Harness {
    /// The autoscaler settings
    pub conf: Arc<AutoscalerConf>,
    /// The cluster settings for every cycle
    pub settings: ClusterSettings,
    /// The pretend cluster
    pub cluster: DryRunCluster,
    /// The pretend cloud
    pub cloud: DryRunCloud,
    /// The pretend run store
    pub store: DryRunStore,
    /// The backends wrapping our pretend systems
    pub backends: Backends,
    /// The retry state shared by our components
    pub tracker: RetryTracker,
    /// The provisioner shared by our components
    pub provisioner: Provisioner,
}

impl Harness {
    /// Build a new dry run harness
    ///
    /// # Arguments
    ///
    /// * `settings` - The cluster settings to use
    pub fn new(settings: ClusterSettings) -> Self {
        Harness::with_conf(AutoscalerConf::default(), settings)
    }

    /// Build a new dry run harness with custom autoscaler settings
    ///
    /// # Arguments
    ///
    /// * `conf` - The autoscaler settings to use
    /// * `settings` - The cluster settings to use
    pub fn with_conf(conf: AutoscalerConf, settings: ClusterSettings) -> Self {
        let conf = Arc::new(conf);
        let cluster = DryRunCluster::default();
        let cloud = DryRunCloud::new(&cluster);
        let store = DryRunStore::default();
        let backends = Backends::new(
            Arc::new(cluster.clone()),
            Arc::new(cloud.clone()),
            Arc::new(store.clone()),
        );
        let tracker = RetryTracker::default();
        let provisioner = Provisioner::new(conf.clone(), backends.clone(), tracker.clone());
        Harness {
            conf,
            settings,
            cluster,
            cloud,
            store,
            backends,
            tracker,
            provisioner,
        }
    }

    /// Build a node matcher sharing our tracker
    pub fn matcher(&self) -> NodeMatcher {
        NodeMatcher::new(
            self.conf.clone(),
            self.backends.clone(),
            self.tracker.clone(),
            self.provisioner.clone(),
        )
    }

    /// Build a pending scanner sharing our tracker
    pub fn scanner(&self) -> PendingScanner {
        PendingScanner::new(self.backends.clone(), self.tracker.clone(), self.matcher())
    }

    /// Build a free node pool sharing our tracker
    pub fn pool(&self) -> FreeNodePool {
        FreeNodePool::new(
            self.conf.clone(),
            self.backends.clone(),
            self.tracker.clone(),
            self.provisioner.clone(),
        )
    }

    /// Snapshot our pretend cluster into a new cycle
    pub fn context(&self) -> CycleContext {
        CycleContext::new(
            self.settings.clone(),
            self.cluster.nodes(),
            &self.cluster.pods(),
        )
    }

    /// Build a full autoscaler on top of our pretend systems
    ///
    /// The autoscaler has its own retry tracker.
    pub fn autoscaler(&self) -> Autoscaler {
        self.autoscaler_with_lock(LocalLock::default())
    }

    /// Build a full autoscaler that runs its cycles under a specific lock
    ///
    /// # Arguments
    ///
    /// * `lock` - The lock to run cycles under
    pub fn autoscaler_with_lock(&self, lock: LocalLock) -> Autoscaler {
        Autoscaler::new(
            self.conf.as_ref().clone(),
            Box::new(self.settings.clone()),
            self.backends.clone(),
            Box::new(lock),
        )
    }
}

/// Wait for all in flight provisioning tasks to finish
///
/// # Arguments
///
/// * `tracker` - The tracker to watch
pub async fn settle(tracker: &RetryTracker) -> Result<(), Error> {
    let wait = async {
        while tracker.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait).await?;
    Ok(())
}
