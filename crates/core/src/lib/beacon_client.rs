//! HTTP client for the beacon node REST API.
//!
//! All reads go through the slot caches first; cache misses are collapsed
//! per slot through a single-flight map, and every outbound request takes
//! a permit from a shared semaphore so the configured concurrency ceiling
//! holds across committee pre-fetch and block fetch phases alike.

use std::num::ParseIntError;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{header::ACCEPT, Client, ClientBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use beacon_duty_watch_shared::beacon::{
    AttestationSummary, BlockSummary, CommitteeSummary, ProposerDuty, Withdrawal,
};
use beacon_duty_watch_shared::eth_spec::{Epoch, Slot};

use crate::cache::{spawn_sweeper, CacheConfig, CacheStats, SlotCache};
use crate::prometheus_metrics::{operations, ServiceMetrics};
use crate::singleflight::{await_leader, Flight, SingleFlight};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("beacon node request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("beacon node returned {status} for {url}")]
    Status { status: StatusCode, url: String },

    #[error("unexpected beacon response shape: {0}")]
    Convert(#[from] ConvertError),

    #[error("shared fetch for slot {0} failed upstream")]
    SharedFetchFailed(Slot),
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("failed to parse integer field {field}: {source}")]
    IntField {
        field: &'static str,
        source: ParseIntError,
    },
}

fn parse_u64(field: &'static str, raw: &str) -> Result<u64, ConvertError> {
    raw.parse()
        .map_err(|source| ConvertError::IntField { field, source })
}

// The beacon API encodes integers as JSON strings; these DTOs mirror the
// wire shape and convert into the domain model afterwards.

#[derive(Serialize, Deserialize)]
struct BeaconHeaderResponse {
    data: BeaconHeaderData,
}

#[derive(Serialize, Deserialize)]
struct BeaconHeaderData {
    header: BeaconHeaderEnvelope,
}

#[derive(Serialize, Deserialize)]
struct BeaconHeaderEnvelope {
    message: BeaconHeaderMessage,
}

#[derive(Serialize, Deserialize)]
struct BeaconHeaderMessage {
    slot: String,
}

#[derive(Serialize, Deserialize)]
struct BlockResponse {
    data: BlockEnvelope,
}

#[derive(Serialize, Deserialize)]
struct BlockEnvelope {
    message: BlockMessage,
}

#[derive(Serialize, Deserialize)]
struct BlockMessage {
    slot: String,
    proposer_index: String,
    body: BlockBody,
}

#[derive(Serialize, Deserialize)]
struct BlockBody {
    #[serde(default)]
    attestations: Vec<AttestationDto>,
    #[serde(default)]
    execution_payload: Option<ExecutionPayloadDto>,
}

#[derive(Serialize, Deserialize)]
struct AttestationDto {
    aggregation_bits: String,
    #[serde(default)]
    committee_bits: Option<String>,
    data: AttestationDataDto,
}

#[derive(Serialize, Deserialize)]
struct AttestationDataDto {
    slot: String,
    index: String,
}

#[derive(Serialize, Deserialize)]
struct ExecutionPayloadDto {
    block_number: String,
    #[serde(default)]
    withdrawals: Vec<WithdrawalDto>,
}

#[derive(Serialize, Deserialize)]
struct WithdrawalDto {
    validator_index: String,
    address: String,
    amount: String,
}

#[derive(Serialize, Deserialize)]
struct CommitteesResponse {
    data: Vec<CommitteeDto>,
}

#[derive(Serialize, Deserialize)]
struct CommitteeDto {
    slot: String,
    index: String,
    validators: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct ProposerDutiesResponse {
    data: Vec<ProposerDutyDto>,
}

#[derive(Serialize, Deserialize)]
struct ProposerDutyDto {
    slot: String,
    validator_index: String,
    pubkey: String,
}

impl TryFrom<BlockMessage> for BlockSummary {
    type Error = ConvertError;

    fn try_from(value: BlockMessage) -> Result<Self, Self::Error> {
        let slot = parse_u64("message.slot", &value.slot)?;
        let proposer_index = parse_u64("message.proposer_index", &value.proposer_index)?;

        let attestations = value
            .body
            .attestations
            .into_iter()
            .map(|att| {
                Ok(AttestationSummary {
                    slot: parse_u64("attestation.data.slot", &att.data.slot)?,
                    committee_index: parse_u64("attestation.data.index", &att.data.index)?,
                    aggregation_bits: att.aggregation_bits,
                    committee_bits: att.committee_bits,
                })
            })
            .collect::<Result<Vec<_>, ConvertError>>()?;

        let (exec_block_number, withdrawals) = match value.body.execution_payload {
            Some(payload) => {
                let block_number = parse_u64("execution_payload.block_number", &payload.block_number)?;
                let withdrawals = payload
                    .withdrawals
                    .into_iter()
                    .map(|w| {
                        Ok(Withdrawal {
                            validator_index: parse_u64("withdrawal.validator_index", &w.validator_index)?,
                            address: w.address,
                            amount_gwei: parse_u64("withdrawal.amount", &w.amount)?,
                        })
                    })
                    .collect::<Result<Vec<_>, ConvertError>>()?;
                (Some(block_number), withdrawals)
            }
            None => (None, Vec::new()),
        };

        Ok(BlockSummary {
            slot,
            proposer_index,
            exec_block_number,
            attestations,
            withdrawals,
        })
    }
}

impl TryFrom<CommitteeDto> for CommitteeSummary {
    type Error = ConvertError;

    fn try_from(value: CommitteeDto) -> Result<Self, Self::Error> {
        Ok(CommitteeSummary {
            slot: parse_u64("committee.slot", &value.slot)?,
            index: parse_u64("committee.index", &value.index)?,
            validators: value
                .validators
                .iter()
                .map(|v| parse_u64("committee.validators", v))
                .collect::<Result<Vec<_>, ConvertError>>()?,
        })
    }
}

impl TryFrom<ProposerDutyDto> for ProposerDuty {
    type Error = ConvertError;

    fn try_from(value: ProposerDutyDto) -> Result<Self, Self::Error> {
        Ok(ProposerDuty {
            slot: parse_u64("duty.slot", &value.slot)?,
            validator_index: parse_u64("duty.validator_index", &value.validator_index)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClientCacheStats {
    pub blocks: CacheStats,
    pub committees: CacheStats,
}

pub struct BeaconClient {
    base_url: String,
    http: Client,
    request_permits: Arc<Semaphore>,
    block_cache: Arc<SlotCache<Option<Arc<BlockSummary>>>>,
    committee_cache: Arc<SlotCache<Arc<Vec<CommitteeSummary>>>>,
    inflight_blocks: SingleFlight<Slot, Option<Arc<BlockSummary>>>,
    inflight_committees: SingleFlight<Slot, Option<Arc<Vec<CommitteeSummary>>>>,
    metrics: ServiceMetrics,
}

impl BeaconClient {
    pub fn new(
        base_url: &str,
        max_concurrent_requests: u32,
        cache_config: CacheConfig,
        metrics: ServiceMetrics,
    ) -> Result<Self, ClientError> {
        let http = ClientBuilder::new().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base_url: Self::normalize_url(base_url),
            http,
            request_permits: Arc::new(Semaphore::new(max_concurrent_requests as usize)),
            block_cache: Arc::new(SlotCache::new("blocks", cache_config.clone())),
            committee_cache: Arc::new(SlotCache::new("committees", cache_config)),
            inflight_blocks: SingleFlight::new(),
            inflight_committees: SingleFlight::new(),
            metrics,
        })
    }

    fn normalize_url(base_url: &str) -> String {
        base_url.strip_suffix('/').unwrap_or(base_url).to_owned()
    }

    /// One HTTP GET under a concurrency permit. `Ok(None)` is a 404; the
    /// permit is held until the body has been read and parsed.
    async fn get_json_allowing_404<T: DeserializeOwned>(
        &self,
        url: String,
    ) -> Result<Option<T>, ClientError> {
        let _permit = self
            .request_permits
            .acquire()
            .await
            .expect("request semaphore never closes");
        tracing::debug!("Sending request to: {url}");

        let response = self.http.get(&url).header(ACCEPT, "application/json").send().await?;
        let status = response.status();
        tracing::debug!(
            "Received response with status {} and content length {}",
            status,
            response
                .content_length()
                .map(|v| v.to_string())
                .unwrap_or("[unknown]".to_string())
        );

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ClientError::Status { status, url });
        }
        let parsed = response.json::<T>().await?;
        Ok(Some(parsed))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, ClientError> {
        self.get_json_allowing_404(url.clone())
            .await?
            .ok_or(ClientError::Status {
                status: StatusCode::NOT_FOUND,
                url,
            })
    }

    pub async fn head_slot(&self) -> Result<Slot, ClientError> {
        let url = format!("{}/eth/v1/beacon/headers/head", self.base_url);
        let response: BeaconHeaderResponse = self
            .metrics
            .observe(operations::beacon::HEAD, || self.get_json(url))
            .await?;
        let slot = parse_u64("header.message.slot", &response.data.header.message.slot)?;
        Ok(slot)
    }

    /// Block at `slot`, or `None` for a missed slot. Missed slots are
    /// cached as tombstones and never retried.
    pub async fn block(&self, slot: Slot) -> Result<Option<Arc<BlockSummary>>, ClientError> {
        if let Some(cached) = self.block_cache.get(slot) {
            return Ok(cached);
        }
        match self.inflight_blocks.begin(slot) {
            Flight::Follower(receiver) => await_leader(receiver)
                .await
                .ok_or(ClientError::SharedFetchFailed(slot)),
            Flight::Leader(guard) => {
                let fetched = self
                    .metrics
                    .observe(operations::beacon::BLOCK, || self.fetch_block(slot))
                    .await?;
                self.block_cache.set(slot, fetched.clone());
                guard.complete(fetched.clone());
                Ok(fetched)
            }
        }
    }

    async fn fetch_block(&self, slot: Slot) -> Result<Option<Arc<BlockSummary>>, ClientError> {
        let url = format!("{}/eth/v2/beacon/blocks/{}", self.base_url, slot);
        match self.get_json_allowing_404::<BlockResponse>(url).await? {
            Some(response) => {
                let summary: BlockSummary = response.data.message.try_into()?;
                Ok(Some(Arc::new(summary)))
            }
            None => {
                tracing::debug!(slot, "No block at slot, recording tombstone");
                Ok(None)
            }
        }
    }

    /// Ordered committee list for `slot`, or `None` when the beacon node
    /// has no committee data for it (404). Unlike missed blocks, that
    /// outcome is not cached and will be retried on the next overlap.
    pub async fn committees(
        &self,
        slot: Slot,
    ) -> Result<Option<Arc<Vec<CommitteeSummary>>>, ClientError> {
        if let Some(cached) = self.committee_cache.get(slot) {
            return Ok(Some(cached));
        }
        match self.inflight_committees.begin(slot) {
            Flight::Follower(receiver) => await_leader(receiver)
                .await
                .ok_or(ClientError::SharedFetchFailed(slot)),
            Flight::Leader(guard) => {
                let fetched = self
                    .metrics
                    .observe(operations::beacon::COMMITTEES, || self.fetch_committees(slot))
                    .await?;
                if let Some(committees) = &fetched {
                    self.committee_cache.set(slot, Arc::clone(committees));
                }
                guard.complete(fetched.clone());
                Ok(fetched)
            }
        }
    }

    async fn fetch_committees(
        &self,
        slot: Slot,
    ) -> Result<Option<Arc<Vec<CommitteeSummary>>>, ClientError> {
        let url = format!(
            "{}/eth/v1/beacon/states/{}/committees?slot={}",
            self.base_url, slot, slot
        );
        match self.get_json_allowing_404::<CommitteesResponse>(url).await? {
            Some(response) => {
                let committees = response
                    .data
                    .into_iter()
                    .map(CommitteeSummary::try_from)
                    .collect::<Result<Vec<_>, ConvertError>>()?;
                Ok(Some(Arc::new(committees)))
            }
            None => {
                tracing::warn!(slot, "Committees unavailable for slot");
                Ok(None)
            }
        }
    }

    /// Proposer duties for an epoch; `None` when the epoch is unknown to
    /// the node (404), which callers treat as a skipped epoch.
    pub async fn proposer_duties(
        &self,
        epoch: Epoch,
    ) -> Result<Option<Vec<ProposerDuty>>, ClientError> {
        let url = format!("{}/eth/v1/validator/duties/proposer/{}", self.base_url, epoch);
        let response = self
            .metrics
            .observe(operations::beacon::PROPOSER_DUTIES, || {
                self.get_json_allowing_404::<ProposerDutiesResponse>(url)
            })
            .await?;
        match response {
            Some(duties) => {
                let duties = duties
                    .data
                    .into_iter()
                    .map(ProposerDuty::try_from)
                    .collect::<Result<Vec<_>, ConvertError>>()?;
                Ok(Some(duties))
            }
            None => {
                tracing::warn!(epoch, "Proposer duties unavailable for epoch");
                Ok(None)
            }
        }
    }

    pub fn cache_stats(&self) -> ClientCacheStats {
        ClientCacheStats {
            blocks: self.block_cache.stats(),
            committees: self.committee_cache.stats(),
        }
    }

    pub fn spawn_cache_sweepers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            spawn_sweeper(Arc::clone(&self.block_cache), shutdown.clone()),
            spawn_sweeper(Arc::clone(&self.committee_cache), shutdown),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_response_converts_to_summary() {
        let raw = serde_json::json!({
            "data": {
                "message": {
                    "slot": "200",
                    "proposer_index": "100",
                    "body": {
                        "attestations": [
                            {
                                "aggregation_bits": "0x1b",
                                "data": { "slot": "199", "index": "2" }
                            },
                            {
                                "aggregation_bits": "0x17",
                                "committee_bits": "0x0a",
                                "data": { "slot": "199", "index": "0" }
                            }
                        ],
                        "execution_payload": {
                            "block_number": "500",
                            "withdrawals": [
                                {
                                    "validator_index": "100",
                                    "address": "0xabc",
                                    "amount": "32000000000"
                                }
                            ]
                        }
                    }
                }
            }
        });
        let response: BlockResponse = serde_json::from_value(raw).unwrap();
        let summary: BlockSummary = response.data.message.try_into().unwrap();

        assert_eq!(summary.slot, 200);
        assert_eq!(summary.proposer_index, 100);
        assert_eq!(summary.exec_block_number, Some(500));
        assert_eq!(summary.attestations.len(), 2);
        assert!(!summary.attestations[0].is_electra());
        assert!(summary.attestations[1].is_electra());
        assert_eq!(summary.withdrawals[0].amount_gwei, 32000000000);
    }

    #[test]
    fn pre_bellatrix_block_has_no_exec_number() {
        let raw = serde_json::json!({
            "data": {
                "message": {
                    "slot": "7",
                    "proposer_index": "3",
                    "body": { "attestations": [] }
                }
            }
        });
        let response: BlockResponse = serde_json::from_value(raw).unwrap();
        let summary: BlockSummary = response.data.message.try_into().unwrap();
        assert_eq!(summary.exec_block_number, None);
        assert!(summary.withdrawals.is_empty());
    }

    #[test]
    fn malformed_integer_fields_are_rejected() {
        let raw = serde_json::json!({
            "data": {
                "message": {
                    "slot": "not-a-number",
                    "proposer_index": "3",
                    "body": { "attestations": [] }
                }
            }
        });
        let response: BlockResponse = serde_json::from_value(raw).unwrap();
        let converted: Result<BlockSummary, _> = response.data.message.try_into();
        assert!(matches!(
            converted,
            Err(ConvertError::IntField {
                field: "message.slot",
                ..
            })
        ));
    }

    #[test]
    fn committee_dto_converts_validator_strings() {
        let dto = CommitteeDto {
            slot: "300".to_owned(),
            index: "2".to_owned(),
            validators: vec!["100".to_owned(), "200".to_owned()],
        };
        let committee: CommitteeSummary = dto.try_into().unwrap();
        assert_eq!(committee.validators, vec![100, 200]);
    }

    #[test]
    fn base_url_trailing_slash_is_stripped() {
        assert_eq!(
            BeaconClient::normalize_url("http://127.0.0.1:5052/"),
            "http://127.0.0.1:5052"
        );
    }
}
