use clap::Parser;

/// The Command line args to pass to the autoscaler
#[derive(Parser, Debug, Clone)]
#[clap(version, author)]
pub struct Args {
    /// The path to load the config file from
    #[clap(short, long, default_value = "autoscaler.yml")]
    pub config: String,
    /// Scale a pretend in memory cluster instead of a real one
    #[clap(long, default_value_t)]
    pub dry_run: bool,
    /// Run a single cycle and exit
    #[clap(long, default_value_t)]
    pub once: bool,
}
