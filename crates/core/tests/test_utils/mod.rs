//! A synthetic beacon node and scheduler harness for end-to-end tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tokio::sync::watch;

use beacon_duty_watch_core::beacon_client::BeaconClient;
use beacon_duty_watch_core::cache::CacheConfig;
use beacon_duty_watch_core::cursor::CursorStore;
use beacon_duty_watch_core::emitter::{EventEmitter, MemoryNotifier, Notifier};
use beacon_duty_watch_core::prometheus_metrics::Metrics;
use beacon_duty_watch_core::scheduler::{Scheduler, SchedulerConfig};
use beacon_duty_watch_shared::validators::MonitoredValidators;

#[derive(Default)]
pub struct BeaconFixture {
    pub head_slot: u64,
    pub blocks: HashMap<u64, Value>,
    pub committees: HashMap<u64, Vec<Value>>,
    pub duties: HashMap<u64, Vec<Value>>,
}

impl BeaconFixture {
    pub fn new(head_slot: u64) -> Self {
        Self {
            head_slot,
            ..Default::default()
        }
    }

    pub fn with_block(mut self, slot: u64, message: Value) -> Self {
        self.blocks.insert(slot, message);
        self
    }

    pub fn with_committees(mut self, slot: u64, committees: Vec<Value>) -> Self {
        self.committees.insert(slot, committees);
        self
    }

    /// Serves an empty committee list for every slot in the range; lets a
    /// test opt slots out of attestation reconciliation without 404 noise.
    pub fn with_empty_committees(mut self, slots: std::ops::RangeInclusive<u64>) -> Self {
        for slot in slots {
            self.committees.entry(slot).or_default();
        }
        self
    }

    pub fn with_duties(mut self, epoch: u64, duties: Vec<Value>) -> Self {
        self.duties.insert(epoch, duties);
        self
    }
}

pub struct FixtureState {
    pub fixture: BeaconFixture,
    pub block_requests: AtomicU64,
    pub committee_requests: AtomicU64,
}

impl FixtureState {
    pub fn new(fixture: BeaconFixture) -> Arc<Self> {
        Arc::new(Self {
            fixture,
            block_requests: AtomicU64::new(0),
            committee_requests: AtomicU64::new(0),
        })
    }
}

pub fn block_message(slot: u64, proposer: u64, exec_block_number: Option<u64>) -> Value {
    let mut body = json!({ "attestations": [] });
    if let Some(block_number) = exec_block_number {
        body["execution_payload"] = json!({
            "block_number": block_number.to_string(),
            "withdrawals": [],
        });
    }
    json!({
        "slot": slot.to_string(),
        "proposer_index": proposer.to_string(),
        "body": body,
    })
}

pub fn attestation_json(
    slot: u64,
    committee_index: u64,
    aggregation_bits: &str,
    committee_bits: Option<&str>,
) -> Value {
    let mut attestation = json!({
        "aggregation_bits": aggregation_bits,
        "data": { "slot": slot.to_string(), "index": committee_index.to_string() },
    });
    if let Some(bits) = committee_bits {
        attestation["committee_bits"] = json!(bits);
    }
    attestation
}

pub fn with_attestations(mut message: Value, attestations: Vec<Value>) -> Value {
    message["body"]["attestations"] = Value::Array(attestations);
    message
}

pub fn committee_json(slot: u64, index: u64, validators: &[u64]) -> Value {
    json!({
        "slot": slot.to_string(),
        "index": index.to_string(),
        "validators": validators.iter().map(|v| v.to_string()).collect::<Vec<_>>(),
    })
}

pub fn duty_json(slot: u64, validator: u64) -> Value {
    json!({
        "slot": slot.to_string(),
        "validator_index": validator.to_string(),
        "pubkey": format!("0x{:096x}", validator),
    })
}

async fn head_handler(State(state): State<Arc<FixtureState>>) -> Json<Value> {
    Json(json!({
        "data": {
            "header": {
                "message": { "slot": state.fixture.head_slot.to_string() }
            }
        }
    }))
}

async fn block_handler(
    State(state): State<Arc<FixtureState>>,
    Path(slot): Path<u64>,
) -> Response {
    state.block_requests.fetch_add(1, Ordering::Relaxed);
    match state.fixture.blocks.get(&slot) {
        Some(message) => Json(json!({ "data": { "message": message } })).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn committees_handler(
    State(state): State<Arc<FixtureState>>,
    Path(slot): Path<u64>,
) -> Response {
    state.committee_requests.fetch_add(1, Ordering::Relaxed);
    match state.fixture.committees.get(&slot) {
        Some(committees) => Json(json!({ "data": committees })).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn duties_handler(
    State(state): State<Arc<FixtureState>>,
    Path(epoch): Path<u64>,
) -> Json<Value> {
    let duties = state.fixture.duties.get(&epoch).cloned().unwrap_or_default();
    Json(json!({ "data": duties }))
}

/// Serves the fixture on an ephemeral local port; returns the base URL.
pub async fn spawn_beacon(state: Arc<FixtureState>) -> String {
    let app = Router::new()
        .route("/eth/v1/beacon/headers/head", get(head_handler))
        .route("/eth/v2/beacon/blocks/{slot}", get(block_handler))
        .route("/eth/v1/beacon/states/{slot}/committees", get(committees_handler))
        .route("/eth/v1/validator/duties/proposer/{epoch}", get(duties_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

pub fn monitored(pairs: &[(&str, &[u64])]) -> MonitoredValidators {
    let groups: std::collections::BTreeMap<String, Vec<u64>> = pairs
        .iter()
        .map(|(label, indices)| (label.to_string(), indices.to_vec()))
        .collect();
    MonitoredValidators::new(groups).unwrap()
}

/// Genesis timestamp that puts the expected slot exactly `lag` slots ahead
/// of the fixture head.
pub fn genesis_for_lag(head_slot: u64, lag: u64) -> u64 {
    let now = chrono::Utc::now().timestamp().max(0) as u64;
    now - (head_slot + lag) * 12
}

pub struct TestHarness {
    pub scheduler: Scheduler,
    pub events: MemoryNotifier,
    pub metrics: Arc<Metrics>,
    pub cursor_path: PathBuf,
    _shutdown_tx: watch::Sender<bool>,
}

pub async fn build_harness(
    base_url: &str,
    monitored: MonitoredValidators,
    cursor_initial: u64,
    genesis_timestamp: u64,
    batch_size: u32,
) -> TestHarness {
    let metrics = Arc::new(Metrics::new("duty_watch_test"));
    let client = Arc::new(
        BeaconClient::new(
            base_url,
            8,
            CacheConfig::default(),
            metrics.services.beacon.clone(),
        )
        .unwrap(),
    );

    let events = MemoryNotifier::default();
    let emitter = EventEmitter::new(
        Notifier::Memory(events.clone()),
        Duration::from_secs(1800),
        Some(metrics.watcher.events_total.clone()),
    );

    let cursor_path = std::env::temp_dir().join(format!(
        "duty-watch-test-cursor-{}-{}.json",
        std::process::id(),
        rand::random::<u64>()
    ));
    let _ = std::fs::remove_file(&cursor_path);
    let cursor = CursorStore::open(cursor_path.clone(), cursor_initial).unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(
        SchedulerConfig {
            batch_size,
            polling_interval: Duration::from_secs(1),
            epochs_before_final: 1,
            max_concurrent_requests: 8,
            stale_threshold_slots: 10,
            genesis_timestamp,
        },
        client,
        monitored,
        emitter,
        cursor,
        None,
        Arc::clone(&metrics),
        shutdown_rx,
    );

    TestHarness {
        scheduler,
        events,
        metrics,
        cursor_path,
        _shutdown_tx: shutdown_tx,
    }
}
