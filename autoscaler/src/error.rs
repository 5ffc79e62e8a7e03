//! An error from the autoscaler
use reqwest::StatusCode;

/// An error from the autoscaler or one of the systems it talks to
#[derive(Debug)]
pub enum Error {
    /// An error returned by the pipeline API
    Api {
        code: StatusCode,
        msg: Option<String>,
    },
    /// A generic error with a message
    Generic(String),
    /// A node provisioning process exited unsuccessfully
    NodeUp {
        /// The exit code of the provisioning process if it exited on its own
        code: Option<i32>,
        msg: String,
    },
    /// An error from sending or recieving a request
    Reqwest(reqwest::Error),
    /// An IO Error
    IO(std::io::Error),
    /// An error from loading a config
    Config(config::ConfigError),
    /// An error from converting a value with serde
    Serde(serde_json::Error),
    /// An error from parsing an int
    ParseInt(std::num::ParseIntError),
    /// An error from joining a tokio task
    JoinError(tokio::task::JoinError),
    /// An operation did not complete in time
    Timeout(tokio::time::error::Elapsed),
    /// An error from the k8s client
    K8s(kube::Error),
    /// An error from getting a k8s config
    K8sConfig(kube::config::KubeconfigError),
}

impl Error {
    /// Create a new generic error
    ///
    /// # Arguments
    ///
    /// * `msg` - The error message to set
    pub fn new<T: Into<String>>(msg: T) -> Self {
        Error::Generic(msg.into())
    }

    /// Create a new node provisioning error
    ///
    /// # Arguments
    ///
    /// * `code` - The exit code of the provisioning process
    /// * `msg` - The error message to set
    pub fn node_up<T: Into<String>>(code: Option<i32>, msg: T) -> Self {
        Error::NodeUp {
            code,
            msg: msg.into(),
        }
    }

    /// Get the status code from this error if one exists
    pub fn status(&self) -> Option<StatusCode> {
        // get the status code from any error types that support it
        match self {
            Error::Api { code, .. } => Some(code.to_owned()),
            Error::Reqwest(err) => err.status(),
            Error::K8s(err) => match err {
                kube::Error::Api(resp) => StatusCode::from_u16(resp.code).ok(),
                _ => None,
            },
            _ => None,
        }
    }

    /// Get the exit code of a failed provisioning process if this is one
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::NodeUp { code, .. } => *code,
            _ => None,
        }
    }

    /// Get the error message for this error if one exists
    pub fn msg(&self) -> Option<String> {
        // get the msg from any error types that support it
        match self {
            Error::Api { msg, .. } => msg.clone(),
            Error::Generic(msg) => Some(msg.clone()),
            Error::NodeUp { msg, .. } => Some(msg.clone()),
            Error::Reqwest(err) => Some(err.to_string()),
            Error::IO(err) => Some(err.to_string()),
            Error::Config(err) => Some(err.to_string()),
            Error::Serde(err) => Some(err.to_string()),
            Error::ParseInt(err) => Some(err.to_string()),
            Error::JoinError(err) => Some(err.to_string()),
            Error::Timeout(err) => Some(err.to_string()),
            Error::K8s(err) => Some(err.to_string()),
            Error::K8sConfig(err) => Some(err.to_string()),
        }
    }

    /// get the kind of error as a str
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Api { .. } => "Api",
            Error::Generic(_) => "Generic",
            Error::NodeUp { .. } => "NodeUp",
            Error::Reqwest(_) => "Reqwest",
            Error::IO(_) => "IO",
            Error::Config(_) => "Config",
            Error::Serde(_) => "Serde",
            Error::ParseInt(_) => "ParseInt",
            Error::JoinError(_) => "JoinError",
            Error::Timeout(_) => "Timeout",
            Error::K8s(_) => "K8s",
            Error::K8sConfig(_) => "K8sConf",
        }
    }
}

impl std::fmt::Display for Error {
    /// display this error in a easy readble format
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match (self.status(), self.exit_code(), self.msg()) {
            (Some(code), _, Some(msg)) => write!(f, "Code: {code} Error: {msg}"),
            (None, Some(exit), Some(msg)) => write!(f, "Exit: {exit} Error: {msg}"),
            (None, None, Some(msg)) => write!(f, "Error: {msg}"),
            (Some(code), _, None) => write!(f, "Code: {code}"),
            (None, _, None) => write!(f, "Kind: {}", self.kind()),
        }
    }
}

// mark that this is an error struct
impl std::error::Error for Error {}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::Reqwest(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IO(error)
    }
}

impl From<config::ConfigError> for Error {
    fn from(error: config::ConfigError) -> Self {
        Error::Config(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serde(error)
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(error: std::num::ParseIntError) -> Self {
        Error::ParseInt(error)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(error: tokio::task::JoinError) -> Self {
        Error::JoinError(error)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(error)
    }
}

impl From<kube::Error> for Error {
    fn from(error: kube::Error) -> Self {
        Error::K8s(error)
    }
}

impl From<kube::config::KubeconfigError> for Error {
    fn from(error: kube::config::KubeconfigError) -> Self {
        Error::K8sConfig(error)
    }
}
