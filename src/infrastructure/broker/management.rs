//! Client for the broker's HTTP management API.
//!
//! Only queue depth is read from it; everything else goes over AMQP.

use std::time::Duration;

use reqwest::{StatusCode, Url};
use serde::Deserialize;

use crate::config::ManagementConfig;
use crate::error::{QueueError, Result};

#[derive(Debug, Deserialize)]
struct QueueInfo {
    #[serde(default)]
    messages_ready: Option<u64>,
}

#[derive(Clone)]
pub struct ManagementApi {
    client: reqwest::Client,
    base_url: Url,
    vhost: String,
    username: String,
    password: String,
}

impl ManagementApi {
    #[tracing::instrument(level = "debug", skip(config), fields(host = %config.host, port = config.port))]
    pub fn new(config: &ManagementConfig) -> Result<Self> {
        let base_url = Url::parse(&format!("http://{}:{}/", config.host, config.port))
            .map_err(|e| QueueError::Broker(format!("invalid management address: {}", e)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url,
            vhost: config.vhost.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    /// `/api/queues/{vhost}/{queue}` with both segments percent-encoded,
    /// so the default vhost `/` becomes `%2F`.
    pub fn queue_url(&self, queue: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| QueueError::Broker("management URL cannot be a base".to_string()))?
            .clear()
            .extend(["api", "queues", self.vhost.as_str(), queue]);
        Ok(url)
    }

    /// Ready message count of `queue`, or `None` if the broker does not
    /// know the queue or did not report the figure.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn messages_ready(&self, queue: &str) -> Result<Option<u64>> {
        let resp = self
            .client
            .get(self.queue_url(queue)?)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let info: QueueInfo = resp.error_for_status()?.json().await?;
        Ok(info.messages_ready)
    }
}
