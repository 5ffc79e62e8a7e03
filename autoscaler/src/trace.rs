//! Sets up tracing for the autoscaler

use tracing_subscriber::prelude::*;

use crate::Error;
use crate::conf::Tracing;

/// Setup our stdout tracer
///
/// # Arguments
///
/// * `name` - The name of the service to trace
/// * `conf` - The tracing config to use
pub fn setup(name: &str, conf: &Tracing) -> Result<(), Error> {
    // build our local tracer filtered to our configured level
    let local = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(conf.local.level.to_filter());
    // init our tracing registry
    tracing_subscriber::registry()
        .with(local)
        .try_init()
        .map_err(|err| Error::new(format!("Failed to register stdout tracer: {err}")))?;
    // log that tracing is setup
    tracing::event!(
        tracing::Level::INFO,
        msg = "Tracing setup",
        service = name,
        level = conf.local.level.to_string()
    );
    Ok(())
}
