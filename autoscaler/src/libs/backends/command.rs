//! Talks to the cloud through an external bridge command
//!
//! Every operation runs the bridge once with a sub command. Profiles are passed as json arguments
//! and replies are read as json from stdout. The exit code of a failed provisioning call is kept
//! so spot and quota failures can be told apart.

use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::{Level, event, instrument};

use super::CloudProvider;
use crate::Error;
use crate::conf::CloudConf;
use crate::models::{Disk, InstanceProfile};

/// Get the stderr from a finished command
///
/// # Arguments
///
/// * `output` - The output of the command
fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_owned()
}

/// Build an error for a bridge command that exited unsuccessfully
///
/// # Arguments
///
/// * `sub` - The sub command that failed
/// * `output` - The output of the command
fn failed(sub: &str, output: &Output) -> Error {
    Error::new(format!(
        "Cloud {sub} failed with {}: {}",
        output.status,
        stderr(output)
    ))
}

/// A cloud provider backed by an external command
pub struct CommandCloud {
    /// The settings for our bridge command
    conf: CloudConf,
}

impl CommandCloud {
    /// Create a new command backed cloud
    ///
    /// # Arguments
    ///
    /// * `conf` - The settings for our bridge command
    pub fn new(conf: CloudConf) -> Self {
        CommandCloud { conf }
    }

    /// Run our bridge with a sub command
    ///
    /// # Arguments
    ///
    /// * `sub` - The sub command to run
    /// * `args` - The args to pass to the sub command
    #[instrument(name = "CommandCloud::exec", skip(self), err(Debug))]
    async fn exec(&self, sub: &str, args: &[String]) -> Result<Output, Error> {
        let mut cmd = Command::new(&self.conf.program);
        cmd.args(&self.conf.args)
            .arg(sub)
            .args(args)
            .stdin(Stdio::null())
            // a timed out child is killed when its future is dropped
            .kill_on_drop(true);
        let timeout = Duration::from_secs(self.conf.timeout);
        let output = tokio::time::timeout(timeout, cmd.output()).await??;
        event!(Level::DEBUG, sub, code = output.status.code());
        Ok(output)
    }

    /// Run a sub command that must succeed and parse its json reply
    ///
    /// # Arguments
    ///
    /// * `sub` - The sub command to run
    /// * `args` - The args to pass to the sub command
    async fn exec_json<T: serde::de::DeserializeOwned>(
        &self,
        sub: &str,
        args: &[String],
    ) -> Result<T, Error> {
        let output = self.exec(sub, args).await?;
        if !output.status.success() {
            return Err(failed(sub, &output));
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    /// Run a sub command whose exit status is its answer
    ///
    /// # Arguments
    ///
    /// * `sub` - The sub command to run
    /// * `args` - The args to pass to the sub command
    async fn exec_check(&self, sub: &str, args: &[String]) -> Result<bool, Error> {
        let output = self.exec(sub, args).await?;
        Ok(output.status.success())
    }

    /// Run a provisioning sub command keeping its exit code on failure
    ///
    /// # Arguments
    ///
    /// * `sub` - The sub command to run
    /// * `args` - The args to pass to the sub command
    async fn exec_node_up(&self, sub: &str, args: &[String]) -> Result<Output, Error> {
        let output = self.exec(sub, args).await?;
        if !output.status.success() {
            return Err(Error::node_up(output.status.code(), stderr(&output)));
        }
        Ok(output)
    }
}

#[async_trait::async_trait]
impl CloudProvider for CommandCloud {
    async fn describe_instance(
        &self,
        run_id: &str,
        profile: &InstanceProfile,
    ) -> Result<Option<InstanceProfile>, Error> {
        let args = [run_id.to_owned(), serde_json::to_string(profile)?];
        self.exec_json("describe", &args).await
    }

    async fn scale_up_node(
        &self,
        run_id: &str,
        profile: &InstanceProfile,
    ) -> Result<InstanceProfile, Error> {
        let args = [run_id.to_owned(), serde_json::to_string(profile)?];
        let output = self.exec_node_up("up", &args).await?;
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    async fn scale_up_free_node(
        &self,
        node_id: &str,
        profile: &InstanceProfile,
    ) -> Result<(), Error> {
        let args = [node_id.to_owned(), serde_json::to_string(profile)?];
        self.exec_node_up("up-free", &args).await?;
        Ok(())
    }

    async fn scale_down_node(&self, node: &str) -> Result<(), Error> {
        let output = self.exec("down", &[node.to_owned()]).await?;
        if !output.status.success() {
            return Err(failed("down", &output));
        }
        Ok(())
    }

    async fn reassign_node(&self, old_id: &str, new_id: &str) -> Result<bool, Error> {
        self.exec_check("reassign", &[old_id.to_owned(), new_id.to_owned()])
            .await
    }

    async fn is_node_expired(&self, node: &str) -> Result<bool, Error> {
        self.exec_check("expired", &[node.to_owned()]).await
    }

    async fn load_disks(&self, region_id: Option<u64>, run_id: &str) -> Result<Vec<Disk>, Error> {
        let mut args = vec![run_id.to_owned()];
        // only pass a region if we know it
        if let Some(region_id) = region_id {
            args.push("--region".to_owned());
            args.push(region_id.to_string());
        }
        self.exec_json("disks", &args).await
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::CommandCloud;
    use crate::conf::CloudConf;
    use crate::libs::backends::CloudProvider;
    use crate::models::InstanceProfile;

    /// Build a bridge that runs a shell script
    fn bridge(script: &str) -> CommandCloud {
        CommandCloud::new(CloudConf {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_owned(), script.to_owned(), "bridge".to_owned()],
            timeout: 5,
        })
    }

    #[tokio::test]
    async fn node_up_failures_keep_their_exit_code() {
        let cloud = bridge("echo 'no spot capacity' >&2; exit 5");
        let profile = InstanceProfile::new("m5.large", 50, "img").spot(true);
        let err = cloud.scale_up_node("1", &profile).await.unwrap_err();
        assert_eq!(err.exit_code(), Some(5));
        assert_eq!(err.msg().as_deref(), Some("no spot capacity"));
    }

    #[tokio::test]
    async fn node_up_replies_are_parsed() {
        let cloud = bridge(
            r#"echo '{"nodeType":"m5.large","disk":50,"spot":false,"nodeName":"node-1"}'"#,
        );
        let profile = InstanceProfile::new("m5.large", 50, "img");
        let assigned = cloud.scale_up_node("1", &profile).await.unwrap();
        assert_eq!(assigned.node_name.as_deref(), Some("node-1"));
    }

    #[tokio::test]
    async fn exit_status_answers_checks() {
        assert!(bridge("exit 0").reassign_node("1", "2").await.unwrap());
        assert!(!bridge("exit 1").is_node_expired("node-1").await.unwrap());
    }
}
