use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::config::HomeAssistantConfig;

/// Thin wrapper over the Home Assistant REST states API.
pub struct HomeAssistantAPI {
    endpoint_url: String,
    auth_token: SecretString,
    client: reqwest::Client,
}

impl HomeAssistantAPI {
    pub fn new(config: &HomeAssistantConfig) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            endpoint_url: config.url.trim_end_matches('/').to_string(),
            auth_token: config.token.clone(),
            client,
        })
    }

    /// Creates or replaces the state of `entity_id`.
    pub async fn publish_state(
        &self,
        entity_id: &str,
        state: &str,
        attributes: Map<String, Value>,
    ) -> Result<HASensor, anyhow::Error> {
        if self.endpoint_url.is_empty() {
            anyhow::bail!("No HA connection");
        }
        let body = StateUpdate { state, attributes };
        let response = self
            .client
            .post(format!("{}/api/states/{}", self.endpoint_url, entity_id))
            .bearer_auth(self.auth_token.expose_secret())
            .json(&body)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(response.json().await?),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                anyhow::bail!("Home Assistant rejected the access token")
            }
            status => {
                let text = response.text().await.unwrap_or_default();
                anyhow::bail!("Home Assistant returned {} for {}: {}", status, entity_id, text)
            }
        }
    }
}

#[derive(Serialize)]
struct StateUpdate<'a> {
    state: &'a str,
    attributes: Map<String, Value>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HASensor {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub last_changed: String,
    #[serde(default)]
    pub last_updated: String,
}
