//! The autoscaler responsible for matching pipeline runs to compute nodes

#[macro_use]
extern crate serde_derive;

pub mod conf;
mod error;
pub mod libs;
pub mod models;
pub mod trace;

pub use conf::Conf;
pub use error::Error;
pub use libs::{Autoscaler, CycleReport, RetryTracker};

// expose test utilities if that feature is enabled
#[cfg(feature = "test-utilities")]
pub mod test_utilities;
