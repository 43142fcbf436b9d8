//! The outer polling loop: advances the safe-slot frontier, partitions the
//! backlog into batches, drives fetch + reconcile + emit for each, and
//! persists the cursor so progress survives restarts.
//!
//! Exactly one batch is active at a time; within a batch the fetch phases
//! fan out but stay under the client's global concurrency ceiling. A batch
//! that fails still advances the cursor (at-most-once delivery) so a
//! persistently failing range cannot wedge the watcher.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::watch;

use beacon_duty_watch_shared::beacon::{BlockSummary, CommitteeSummary, ProposerDuty};
use beacon_duty_watch_shared::eth_spec::{epoch_of, expected_slot_at, first_slot_of, Slot};
use beacon_duty_watch_shared::events::Event;
use beacon_duty_watch_shared::validators::MonitoredValidators;

use crate::beacon_client::{BeaconClient, ClientError};
use crate::cursor::{CursorError, CursorStore};
use crate::emitter::EventEmitter;
use crate::mev::MevRewardClient;
use crate::prometheus_metrics::Metrics;
use crate::reconciler::{reconcile_batch, BatchInputs, BatchRange, BatchReport};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Cursor(#[from] CursorError),
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub batch_size: u32,
    pub polling_interval: Duration,
    pub epochs_before_final: u64,
    pub max_concurrent_requests: u32,
    pub stale_threshold_slots: u64,
    pub genesis_timestamp: u64,
}

/// Highest slot considered finalized for processing.
pub fn safe_slot(head: Slot, epochs_before_final: u64) -> Slot {
    first_slot_of(epoch_of(head).saturating_sub(epochs_before_final))
}

/// Splits `(cursor, target]` into consecutive ranges of at most
/// `batch_size` slots.
pub fn partition(cursor: Slot, target: Slot, batch_size: u32) -> Vec<BatchRange> {
    let mut ranges = Vec::new();
    let mut begin = cursor;
    while begin < target {
        let end = (begin + batch_size as u64).min(target);
        ranges.push(BatchRange { begin, end });
        begin = end;
    }
    ranges
}

pub struct Scheduler {
    config: SchedulerConfig,
    client: Arc<BeaconClient>,
    monitored: MonitoredValidators,
    emitter: EventEmitter,
    cursor: CursorStore,
    mev: Option<Arc<MevRewardClient>>,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        client: Arc<BeaconClient>,
        monitored: MonitoredValidators,
        emitter: EventEmitter,
        cursor: CursorStore,
        mev: Option<Arc<MevRewardClient>>,
        metrics: Arc<Metrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            client,
            monitored,
            emitter,
            cursor,
            mev,
            metrics,
            shutdown,
        }
    }

    pub fn cursor_slot(&self) -> Slot {
        self.cursor.current()
    }

    pub async fn run(mut self) {
        let sweepers = self.client.spawn_cache_sweepers(self.shutdown.clone());

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_once().await {
                tracing::error!("Polling tick failed: {e:?}");
                self.emitter
                    .emit(Event::InternalError {
                        message: format!("polling tick failed: {e}"),
                        batch_range: None,
                    })
                    .await;
            }

            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(self.config.polling_interval) => {}
                changed = shutdown.changed() => {
                    // a closed channel means the owner is gone; keep the
                    // poll cadence instead of spinning
                    if changed.is_err() {
                        tokio::time::sleep(self.config.polling_interval).await;
                    }
                }
            }
        }

        for sweeper in sweepers {
            sweeper.abort();
        }
        tracing::info!(cursor = self.cursor.current(), "Scheduler stopped");
    }

    /// One polling tick: head, staleness, then every pending batch up to
    /// the safe slot. Public so tests can drive the loop deterministically.
    pub async fn run_once(&mut self) -> Result<(), SchedulerError> {
        let head = self.client.head_slot().await?;
        self.metrics.watcher.head_slot.set(head);
        self.check_staleness(head).await;

        let target = safe_slot(head, self.config.epochs_before_final);
        self.metrics.watcher.safe_slot.set(target);

        if target <= self.cursor.current() {
            tracing::debug!(
                target,
                cursor = self.cursor.current(),
                "Safe slot not past cursor, nothing to process"
            );
            return Ok(());
        }

        for range in partition(self.cursor.current(), target, self.config.batch_size) {
            if *self.shutdown.borrow() {
                tracing::info!(%range, "Shutdown requested, leaving batch unprocessed");
                break;
            }
            self.process_and_emit(range).await?;
        }

        self.publish_cache_stats();
        Ok(())
    }

    async fn check_staleness(&self, head: Slot) {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let expected = expected_slot_at(self.config.genesis_timestamp, now);
        let slots_behind = expected.saturating_sub(head);
        if slots_behind > self.config.stale_threshold_slots {
            tracing::warn!(expected, head, slots_behind, "Beacon node head lags wall clock");
            self.emitter.emit(Event::NodeStale { slots_behind }).await;
        }
    }

    async fn process_and_emit(&mut self, range: BatchRange) -> Result<(), SchedulerError> {
        match self.process_batch(range).await {
            Ok(report) => {
                self.metrics.watcher.batches_total.inc();
                self.emit_report(&report).await;
            }
            Err(e) => {
                // at-most-once: the failed range is not re-attempted
                self.metrics.watcher.batch_failures_total.inc();
                tracing::error!(%range, "Batch failed: {e:?}");
                self.emitter
                    .emit(Event::InternalError {
                        message: format!("batch {range} failed: {e}"),
                        batch_range: Some((range.begin, range.end)),
                    })
                    .await;
            }
        }

        self.cursor.advance(range.end)?;
        self.metrics.watcher.cursor_slot.set(range.end);
        Ok(())
    }

    async fn process_batch(&self, range: BatchRange) -> Result<BatchReport, SchedulerError> {
        tracing::info!(%range, "Processing batch");
        let committees = self.fetch_committees(range).await;
        let duties = self.fetch_duties(range).await?;
        let blocks = self.fetch_blocks(range).await?;

        let inputs = BatchInputs {
            range,
            duties,
            committees,
            blocks,
        };
        Ok(reconcile_batch(&inputs, &self.monitored))
    }

    /// Committees for `(begin, end + 32]`: the batch slots feed
    /// reconciliation, the tail warms the cache for the next batch. A
    /// failed or 404'd fetch inside the batch becomes a skipped slot.
    async fn fetch_committees(
        &self,
        range: BatchRange,
    ) -> HashMap<Slot, Arc<Vec<CommitteeSummary>>> {
        let results: Vec<(Slot, Result<Option<Arc<Vec<CommitteeSummary>>>, ClientError>)> =
            stream::iter(range.begin + 1..=range.inclusion_end())
                .map(|slot| async move { (slot, self.client.committees(slot).await) })
                .buffer_unordered(self.config.max_concurrent_requests as usize)
                .collect()
                .await;

        let mut committees = HashMap::new();
        for (slot, result) in results {
            match result {
                Ok(Some(list)) => {
                    committees.insert(slot, list);
                }
                Ok(None) => {}
                Err(e) if range.contains(slot) => {
                    tracing::warn!(slot, "Committee fetch failed, slot will be skipped: {e:?}");
                }
                Err(e) => {
                    tracing::debug!(slot, "Committee pre-fetch beyond batch failed: {e:?}");
                }
            }
        }
        committees
    }

    async fn fetch_duties(&self, range: BatchRange) -> Result<Vec<ProposerDuty>, SchedulerError> {
        let mut duties = Vec::new();
        for epoch in epoch_of(range.begin + 1)..=epoch_of(range.end) {
            match self.client.proposer_duties(epoch).await? {
                Some(mut epoch_duties) => duties.append(&mut epoch_duties),
                None => tracing::warn!(epoch, "Proposer duties unavailable, skipping epoch"),
            }
        }
        Ok(duties)
    }

    /// Blocks for `(begin, end + 32]`; the tail past `end` only feeds the
    /// inclusion scan. Any fetch failure fails the whole batch.
    async fn fetch_blocks(
        &self,
        range: BatchRange,
    ) -> Result<HashMap<Slot, Option<Arc<BlockSummary>>>, SchedulerError> {
        let results: Vec<(Slot, Result<Option<Arc<BlockSummary>>, ClientError>)> =
            stream::iter(range.begin + 1..=range.inclusion_end())
                .map(|slot| async move { (slot, self.client.block(slot).await) })
                .buffer_unordered(self.config.max_concurrent_requests as usize)
                .collect()
                .await;

        let mut blocks = HashMap::new();
        for (slot, result) in results {
            blocks.insert(slot, result?);
        }
        Ok(blocks)
    }

    async fn emit_report(&self, report: &BatchReport) {
        let watcher = &self.metrics.watcher;
        watcher
            .attestations_included_total
            .inc_by(report.attestations_included() as u64);
        watcher.decode_errors_total.inc_by(report.decode_errors);
        watcher
            .skipped_slots_total
            .inc_by(report.skipped_slots.len() as u64);

        for event in report.to_events(&self.monitored) {
            self.emitter.emit(event).await;
        }

        if let Some(mev) = &self.mev {
            for outcome in report.proposed_with_exec_block() {
                if let Some(block_number) = outcome.exec_block_number {
                    mev.spawn_lookup(outcome.validator, outcome.slot, block_number);
                }
            }
        }
    }

    fn publish_cache_stats(&self) {
        let stats = self.client.cache_stats();
        let cache = &self.metrics.cache;
        cache.hits.with_label_values(&["blocks"]).set(stats.blocks.hits);
        cache.misses.with_label_values(&["blocks"]).set(stats.blocks.misses);
        cache.hits.with_label_values(&["committees"]).set(stats.committees.hits);
        cache.misses.with_label_values(&["committees"]).set(stats.committees.misses);
        tracing::debug!(
            block_hit_rate = stats.blocks.hit_rate(),
            committee_hit_rate = stats.committees.hit_rate(),
            "Cache statistics"
        );
    }
}
