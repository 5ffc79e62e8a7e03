//! The config for the autoscaler
use std::path::{Path, PathBuf};

use crate::Error;
use crate::models::InstanceProfile;

/// Helps serde default the time between cycles to 30 seconds
fn default_dwell() -> u64 {
    30
}

/// Helps serde default how long to wait on warm pool nodes to 10 minutes
fn default_warm_pool_timeout() -> u64 {
    600
}

/// Helps serde default the size of the provisioning worker pool to 32
fn default_workers() -> usize {
    32
}

/// Helps serde default the prefix for warm pool node ids
fn default_free_node_prefix() -> String {
    "p-".to_owned()
}

/// Helps serde default the exit code for exhausted spot capacity
fn default_spot_exhausted_code() -> i32 {
    5
}

/// Helps serde default the exit code for an exceeded provider quota
fn default_quota_exceeded_code() -> i32 {
    6
}

/// The settings for the autoscaler loop itself
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AutoscalerConf {
    /// How long to wait between cycles in seconds
    #[serde(default = "default_dwell")]
    pub dwell: u64,
    /// How long a cycle holds the cluster wide lock in seconds
    #[serde(default = "default_dwell")]
    pub lock_ttl: u64,
    /// How long to wait for warm pool nodes to be provisioned in seconds
    #[serde(default = "default_warm_pool_timeout")]
    pub warm_pool_timeout: u64,
    /// The max number of provisioning tasks that can talk to the cloud at once
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// The prefix for the ids of warm pool nodes
    #[serde(default = "default_free_node_prefix")]
    pub free_node_prefix: String,
    /// The exit code provisioning uses when spot capacity is exhausted
    #[serde(default = "default_spot_exhausted_code")]
    pub spot_exhausted_code: i32,
    /// The exit code provisioning uses when a provider quota was exceeded
    #[serde(default = "default_quota_exceeded_code")]
    pub quota_exceeded_code: i32,
}

impl Default for AutoscalerConf {
    fn default() -> Self {
        AutoscalerConf {
            dwell: default_dwell(),
            lock_ttl: default_dwell(),
            warm_pool_timeout: default_warm_pool_timeout(),
            workers: default_workers(),
            free_node_prefix: default_free_node_prefix(),
            spot_exhausted_code: default_spot_exhausted_code(),
            quota_exceeded_code: default_quota_exceeded_code(),
        }
    }
}

/// Helps serde default the default instance type
fn default_node_type() -> String {
    "m5.large".to_owned()
}

/// Helps serde default the default disk size to 50 GiB
fn default_disk() -> u64 {
    50
}

/// Helps serde default the extra docker disk to 30 GiB
fn default_extra_disk() -> u64 {
    30
}

/// Helps serde default the default node image
fn default_image() -> String {
    "pipeline/node:latest".to_owned()
}

/// The instance to use when a run does not request one and for warm pool nodes
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DefaultInstance {
    /// The instance type to use
    #[serde(default = "default_node_type")]
    pub node_type: String,
    /// The disk size to request in GiB
    #[serde(default = "default_disk")]
    pub disk: u64,
    /// The extra disk added on top of the requested disk for docker images in GiB
    #[serde(default = "default_extra_disk")]
    pub extra_disk: u64,
    /// The image to boot nodes from
    #[serde(default = "default_image")]
    pub image: String,
    /// Whether to use spot capacity
    #[serde(default)]
    pub spot: bool,
    /// The region to spawn nodes in
    #[serde(default)]
    pub region_id: Option<u64>,
    /// The platform warm nodes and runs without one are built for
    #[serde(default)]
    pub platform: Option<String>,
}

impl Default for DefaultInstance {
    fn default() -> Self {
        DefaultInstance {
            node_type: default_node_type(),
            disk: default_disk(),
            extra_disk: default_extra_disk(),
            image: default_image(),
            spot: false,
            region_id: None,
            platform: None,
        }
    }
}

/// Helps serde default the max cluster size to 50
fn default_max_size() -> usize {
    50
}

/// Helps serde default the max concurrent provisioning tasks to 10
fn default_max_nodeup_threads() -> usize {
    10
}

/// Helps serde default the max provisioning attempts for a run to 5
fn default_max_retries() -> i64 {
    5
}

/// Helps serde default the max spot attempts for a run to 3
fn default_max_spot_attempts() -> u32 {
    3
}

/// The bounds and policies for the cluster that are reread every cycle
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClusterSettings {
    /// The number of nodes to always keep around
    #[serde(default)]
    pub min_size: usize,
    /// The max number of nodes this cluster can have
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// The max number of provisioning tasks that can be in flight
    #[serde(default = "default_max_nodeup_threads")]
    pub max_nodeup_threads: usize,
    /// The max number of provisioning attempts for a single run
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    /// The number of spot failures before a run falls back to on demand capacity
    #[serde(default = "default_max_spot_attempts")]
    pub max_spot_attempts: u32,
    /// Whether to feed pending runs to the matcher in a random order
    #[serde(default)]
    pub random_scheduling: bool,
    /// Whether runs without a parent go first instead of last
    #[serde(default)]
    pub high_non_batch_priority: bool,
    /// Whether to kill idle nodes to make room when the cluster is full
    #[serde(default)]
    pub kill_not_matching_nodes: bool,
    /// The default instance for runs and warm pool nodes
    #[serde(default)]
    pub defaults: DefaultInstance,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        ClusterSettings {
            min_size: 0,
            max_size: default_max_size(),
            max_nodeup_threads: default_max_nodeup_threads(),
            max_retries: default_max_retries(),
            max_spot_attempts: default_max_spot_attempts(),
            random_scheduling: false,
            high_non_batch_priority: false,
            kill_not_matching_nodes: false,
            defaults: DefaultInstance::default(),
        }
    }
}

impl ClusterSettings {
    /// Build the platform default instance profile
    pub fn default_profile(&self) -> Result<InstanceProfile, Error> {
        // get our default instance settings
        let defaults = &self.defaults;
        // make sure these defaults can actually build a node
        if defaults.node_type.trim().is_empty() {
            return Err(Error::new("The default instance type is not set"));
        }
        if defaults.image.trim().is_empty() {
            return Err(Error::new("The default instance image is not set"));
        }
        if defaults.disk == 0 {
            return Err(Error::new("The default instance disk must be larger then 0"));
        }
        // build our default profile
        let mut profile = InstanceProfile::new(&defaults.node_type, defaults.disk, &defaults.image)
            .effective_disk(defaults.disk + defaults.extra_disk)
            .spot(defaults.spot);
        profile.region_id = defaults.region_id;
        profile.platform.clone_from(&defaults.platform);
        Ok(profile)
    }
}

/// Helps serde default the namespace to default
fn default_namespace() -> String {
    "default".to_owned()
}

/// Helps serde default the name of the lease to lock cycles with
fn default_lease() -> String {
    "pipeline-autoscaler".to_owned()
}

/// The Kubernetes specific settings
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct K8sConf {
    /// The namespace pipeline pods live in
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// The kubeconfig context to use instead of the in cluster service account
    #[serde(default)]
    pub context: Option<String>,
    /// Only manage nodes in this cloud region
    #[serde(default)]
    pub region: Option<String>,
    /// Only manage nodes from this cloud provider
    #[serde(default)]
    pub provider: Option<String>,
    /// The name of the lease used to lock scaling cycles
    #[serde(default = "default_lease")]
    pub lease: String,
}

impl Default for K8sConf {
    fn default() -> Self {
        K8sConf {
            namespace: default_namespace(),
            context: None,
            region: None,
            provider: None,
            lease: default_lease(),
        }
    }
}

/// Helps serde default the path to the cloud bridge
fn default_cloud_program() -> PathBuf {
    PathBuf::from("/opt/pipeline/bin/pipe-cloud")
}

/// Helps serde default the timeout for cloud commands to 20 minutes
fn default_cloud_timeout() -> u64 {
    1200
}

/// The settings for the command used to talk to the cloud
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CloudConf {
    /// The program to execute
    #[serde(default = "default_cloud_program")]
    pub program: PathBuf,
    /// Any args to pass before the sub command
    #[serde(default)]
    pub args: Vec<String>,
    /// How long any single cloud command can take in seconds
    #[serde(default = "default_cloud_timeout")]
    pub timeout: u64,
}

impl Default for CloudConf {
    fn default() -> Self {
        CloudConf {
            program: default_cloud_program(),
            args: Vec::default(),
            timeout: default_cloud_timeout(),
        }
    }
}

/// Helps serde default the url for the pipeline api
fn default_api_url() -> String {
    "http://localhost:8080/restapi".to_owned()
}

/// The settings for talking to the pipeline API
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ApiConf {
    /// The base url for the pipeline API
    #[serde(default = "default_api_url")]
    pub url: String,
    /// The token to authenticate with
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for ApiConf {
    fn default() -> Self {
        ApiConf {
            url: default_api_url(),
            token: None,
        }
    }
}

/// The settings for sending traces to stdout/stderr
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct TracingLocal {
    /// The log level to use for stdout/stderr
    #[serde(default)]
    pub level: LogLevel,
}

/// The tracing settings to use
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Tracing {
    /// The settings for sending traces to stdout/stderr
    #[serde(default)]
    pub local: TracingLocal,
}

/// The log level to set
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Copy, Default)]
pub enum LogLevel {
    /// Do not log any info
    Off,
    /// Log at the error level
    Error,
    /// Log at the warning level
    Warn,
    /// Log at the info level
    #[default]
    Info,
    /// Log at the debug level
    Debug,
    /// Log at the tracing level
    Trace,
}

impl LogLevel {
    /// Cast this log level to a tracing filter
    #[must_use]
    pub fn to_filter(&self) -> tracing_subscriber::filter::LevelFilter {
        match self {
            LogLevel::Off => tracing_subscriber::filter::LevelFilter::OFF,
            LogLevel::Error => tracing_subscriber::filter::LevelFilter::ERROR,
            LogLevel::Warn => tracing_subscriber::filter::LevelFilter::WARN,
            LogLevel::Info => tracing_subscriber::filter::LevelFilter::INFO,
            LogLevel::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
            LogLevel::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
        }
    }
}

impl std::fmt::Display for LogLevel {
    /// Allow the log level to be displayed
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LogLevel::Off => write!(f, "Off"),
            LogLevel::Error => write!(f, "Error"),
            LogLevel::Warn => write!(f, "Warn"),
            LogLevel::Info => write!(f, "Info"),
            LogLevel::Debug => write!(f, "Debug"),
            LogLevel::Trace => write!(f, "Trace"),
        }
    }
}

/// The config for the autoscaler
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Conf {
    /// The settings for the scaling loop
    #[serde(default)]
    pub autoscaler: AutoscalerConf,
    /// The cluster bounds and policies
    #[serde(default)]
    pub cluster: ClusterSettings,
    /// The Kubernetes settings
    #[serde(default)]
    pub k8s: K8sConf,
    /// The cloud bridge settings
    #[serde(default)]
    pub cloud: CloudConf,
    /// The pipeline API settings
    #[serde(default)]
    pub api: ApiConf,
    /// The tracing settings
    #[serde(default)]
    pub tracing: Tracing,
}

impl Conf {
    /// Creates a new [Conf] object
    ///
    /// # Arguments
    ///
    /// * `path` - The path to use when reading the config file
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            // load from a file first
            .add_source(config::File::from(path.as_ref()).format(config::FileFormat::Yaml))
            // then overlay any environment args ontop
            .add_source(
                config::Environment::with_prefix("autoscaler")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

/// A source of cluster settings that is consulted at the start of every cycle
pub trait SettingsSource: Send + Sync {
    /// Get the current cluster settings
    fn current(&self) -> Result<ClusterSettings, Error>;
}

impl SettingsSource for ClusterSettings {
    /// Static settings never change
    fn current(&self) -> Result<ClusterSettings, Error> {
        Ok(self.clone())
    }
}

/// Cluster settings that are reloaded from the config file every cycle
#[derive(Debug, Clone)]
pub struct FileSettings {
    /// The path to the config file
    path: PathBuf,
}

impl FileSettings {
    /// Create a new file backed settings source
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the config file
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        FileSettings { path: path.into() }
    }
}

impl SettingsSource for FileSettings {
    /// Reload our cluster settings from disk
    fn current(&self) -> Result<ClusterSettings, Error> {
        Ok(Conf::new(&self.path)?.cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::ClusterSettings;

    #[test]
    fn default_profile_adds_extra_disk() {
        let profile = ClusterSettings::default().default_profile().unwrap();
        assert_eq!(profile.node_type.as_deref(), Some("m5.large"));
        assert_eq!(profile.disk, Some(50));
        assert_eq!(profile.effective_disk, Some(80));
        assert!(!profile.spot);
    }

    #[test]
    fn malformed_defaults_are_rejected() {
        let mut settings = ClusterSettings::default();
        settings.defaults.node_type = " ".to_owned();
        assert!(settings.default_profile().is_err());
        let mut settings = ClusterSettings::default();
        settings.defaults.disk = 0;
        assert!(settings.default_profile().is_err());
    }
}
