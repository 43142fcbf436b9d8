//! Fire-and-forget MEV reward enrichment.
//!
//! On every proposed block the scheduler spawns an unsupervised lookup
//! against the external reward API. Outcomes are logged and counted; a
//! failing or slow reward service never delays or fails a batch.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, ClientBuilder};
use serde::Deserialize;

use beacon_duty_watch_shared::eth_spec::{Slot, ValidatorIndex};

use crate::prometheus_metrics::{operations, ServiceMetrics};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct BlockRewardDto {
    reward_wei: String,
}

pub struct MevRewardClient {
    base_url: String,
    http: Client,
    metrics: ServiceMetrics,
}

impl MevRewardClient {
    pub fn new(base_url: &str, metrics: ServiceMetrics) -> Result<Self, reqwest::Error> {
        let http = ClientBuilder::new().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.strip_suffix('/').unwrap_or(base_url).to_owned(),
            http,
            metrics,
        })
    }

    /// Spawns the lookup and returns immediately.
    pub fn spawn_lookup(self: &Arc<Self>, validator: ValidatorIndex, slot: Slot, block_number: u64) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let result = client
                .metrics
                .observe(operations::mev::BLOCK_REWARD, || {
                    client.fetch_block_reward(block_number)
                })
                .await;
            match result {
                Ok(reward_wei) => {
                    tracing::info!(validator, slot, block_number, reward_wei, "MEV reward")
                }
                Err(e) => tracing::warn!(
                    validator,
                    slot,
                    block_number,
                    "MEV reward lookup failed: {e:?}"
                ),
            }
        });
    }

    async fn fetch_block_reward(&self, block_number: u64) -> anyhow::Result<String> {
        let url = format!("{}/{}", self.base_url, block_number);
        let response = self.http.get(&url).send().await?.error_for_status()?;
        let reward = response.json::<BlockRewardDto>().await?;
        Ok(reward.reward_wei)
    }
}
