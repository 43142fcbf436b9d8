//! Delivery of typed events to the notification sink.
//!
//! Events are handed over synchronously in emission order. `NodeStale` and
//! `InternalError` carry a process-wide per-category rate limit so a
//! lagging node or a flapping batch cannot cause a notification storm.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use beacon_duty_watch_shared::events::Event;

use crate::prometheus_metrics::UIntCounterVec;

/// Where events end up. Dispatch is by enum, not trait object, so the
/// notifier can be swapped per configuration (`test_mode` installs the
/// no-op stub) without boxing.
pub trait Notify {
    #[allow(async_fn_in_trait)]
    async fn deliver(&self, event: &Event) -> anyhow::Result<()>;
}

/// Default sink: renders every event through the log pipeline.
pub struct LogNotifier;

impl Notify for LogNotifier {
    async fn deliver(&self, event: &Event) -> anyhow::Result<()> {
        match event {
            Event::BlockProposed {
                validator,
                label,
                slot,
                exec_block_number,
            } => tracing::info!(
                validator,
                label,
                slot,
                exec_block_number,
                "Block proposed"
            ),
            Event::BlockMissed {
                validator,
                label,
                slot,
            } => tracing::warn!(validator, label, slot, "Block proposal missed"),
            Event::AttestationMissed {
                label,
                validators,
                slots,
            } => tracing::warn!(
                label,
                count = validators.len(),
                ?validators,
                ?slots,
                "Attestations missed"
            ),
            Event::WithdrawalsBatched {
                label,
                entries,
                total_gwei,
            } => tracing::info!(label, count = entries.len(), total_gwei, "Withdrawals paid"),
            Event::NodeStale { slots_behind } => {
                tracing::warn!(slots_behind, "Beacon node is lagging wall clock")
            }
            Event::InternalError {
                message,
                batch_range,
            } => tracing::error!(message, ?batch_range, "Internal error"),
        }
        Ok(())
    }
}

/// Stub installed by `test_mode`: accepts and discards everything.
pub struct NoopNotifier;

impl Notify for NoopNotifier {
    async fn deliver(&self, _event: &Event) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Captures events for inspection; used by tests.
#[derive(Default, Clone)]
pub struct MemoryNotifier {
    events: std::sync::Arc<Mutex<Vec<Event>>>,
}

impl MemoryNotifier {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

impl Notify for MemoryNotifier {
    async fn deliver(&self, event: &Event) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

pub enum Notifier {
    Log(LogNotifier),
    Noop(NoopNotifier),
    Memory(MemoryNotifier),
}

impl Notify for Notifier {
    async fn deliver(&self, event: &Event) -> anyhow::Result<()> {
        match self {
            Self::Log(notifier) => notifier.deliver(event).await,
            Self::Noop(notifier) => notifier.deliver(event).await,
            Self::Memory(notifier) => notifier.deliver(event).await,
        }
    }
}

pub struct EventEmitter {
    notifier: Notifier,
    rate_limit_window: Duration,
    last_sent: Mutex<HashMap<&'static str, Instant>>,
    events_total: Option<UIntCounterVec>,
}

impl EventEmitter {
    pub fn new(
        notifier: Notifier,
        rate_limit_window: Duration,
        events_total: Option<UIntCounterVec>,
    ) -> Self {
        Self {
            notifier,
            rate_limit_window,
            last_sent: Mutex::new(HashMap::new()),
            events_total,
        }
    }

    /// Delivers the event unless its category is inside the rate-limit
    /// window; returns whether it was handed to the notifier. Notifier
    /// failures are logged and do not propagate into the core.
    pub async fn emit(&self, event: Event) -> bool {
        if let Some(category) = event.rate_limit_category() {
            let mut last_sent = self.last_sent.lock();
            let now = Instant::now();
            match last_sent.get(category) {
                Some(sent) if now.duration_since(*sent) < self.rate_limit_window => {
                    tracing::debug!(category, "Dropping rate-limited event");
                    return false;
                }
                _ => {
                    last_sent.insert(category, now);
                }
            }
        }

        if let Some(events_total) = &self.events_total {
            events_total.with_label_values(&[event.kind()]).inc();
        }
        if let Err(e) = self.notifier.deliver(&event).await {
            tracing::error!(kind = event.kind(), "Failed to deliver event: {e:?}");
        }
        true
    }
}
