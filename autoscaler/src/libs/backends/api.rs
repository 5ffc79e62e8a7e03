//! Reads and updates runs through the pipeline API

use reqwest::StatusCode;
use serde_json::json;
use tracing::instrument;

use super::RunStore;
use crate::Error;
use crate::conf::ApiConf;
use crate::models::{Disk, InstanceProfile, Run, RunStatus};

/// Send a request and return the response if it was successful
macro_rules! send {
    ($client:expr, $req:expr) => {
        // attempt to send request
        match $client.execute($req.build()?).await {
            // response was received
            Ok(resp) => {
                // check if a response has an error status or not
                if resp.status().is_success() {
                    Ok(resp)
                } else {
                    // the response had an error status
                    let code = resp.status();
                    let msg = resp.text().await.ok().filter(|msg| !msg.is_empty());
                    Err(Error::Api { code, msg })
                }
            }
            Err(e) => Err(Error::from(e)),
        }
    };
}

/// A run store backed by the pipeline API
#[derive(Clone)]
pub struct ApiRunStore {
    /// The base url for the pipeline API
    host: String,
    /// The token to authenticate with
    token: Option<String>,
    /// The client used to talk to the API
    client: reqwest::Client,
}

impl ApiRunStore {
    /// Create a new API backed run store
    ///
    /// # Arguments
    ///
    /// * `conf` - The pipeline API settings
    pub fn new(conf: &ApiConf) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(ApiRunStore {
            host: conf.url.trim_end_matches('/').to_owned(),
            token: conf.token.clone(),
            client,
        })
    }

    /// Start building a POST request for a run
    ///
    /// # Arguments
    ///
    /// * `id` - The run to post to
    /// * `route` - The route under this run to post to
    fn post(&self, id: u64, route: &str) -> reqwest::RequestBuilder {
        self.auth(self.client.post(format!("{}/run/{id}/{route}", self.host)))
    }

    /// Add our token to a request if we have one
    ///
    /// # Arguments
    ///
    /// * `req` - The request to authenticate
    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait::async_trait]
impl RunStore for ApiRunStore {
    #[instrument(name = "ApiRunStore::load_run", skip(self), err(Debug))]
    async fn load_run(&self, id: u64) -> Result<Option<Run>, Error> {
        // build request
        let req = self.auth(self.client.get(format!("{}/run/{id}", self.host)));
        match send!(self.client, req) {
            Ok(resp) => Ok(Some(resp.json::<Run>().await?)),
            // this run was deleted
            Err(err) if err.status() == Some(StatusCode::NOT_FOUND) => Ok(None),
            Err(err) => Err(err),
        }
    }

    #[instrument(name = "ApiRunStore::update_instance", skip(self, instance), err(Debug))]
    async fn update_instance(&self, id: u64, instance: &InstanceProfile) -> Result<(), Error> {
        let req = self.post(id, "instance").json(instance);
        send!(self.client, req)?;
        Ok(())
    }

    #[instrument(name = "ApiRunStore::update_status_if_not_final", skip(self), err(Debug))]
    async fn update_status_if_not_final(&self, id: u64, status: RunStatus) -> Result<(), Error> {
        let req = self
            .post(id, "status")
            .json(&json!({ "status": status, "onlyIfNotFinal": true }));
        send!(self.client, req)?;
        Ok(())
    }

    #[instrument(name = "ApiRunStore::register_disks", skip(self, disks), err(Debug))]
    async fn register_disks(&self, id: u64, disks: &[Disk]) -> Result<(), Error> {
        let req = self.post(id, "disks").json(disks);
        send!(self.client, req)?;
        Ok(())
    }

    #[instrument(name = "ApiRunStore::adjust_price_for_disks", skip(self, disks), err(Debug))]
    async fn adjust_price_for_disks(&self, id: u64, disks: &[Disk]) -> Result<(), Error> {
        let req = self.post(id, "price").json(disks);
        send!(self.client, req)?;
        Ok(())
    }

    #[instrument(name = "ApiRunStore::update_pod_status", skip(self), err(Debug))]
    async fn update_pod_status(&self, id: u64, status: &str) -> Result<(), Error> {
        let req = self
            .post(id, "pod-status")
            .json(&json!({ "podStatus": status }));
        send!(self.client, req)?;
        Ok(())
    }
}
