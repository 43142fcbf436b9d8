use std::future::Future;

use prometheus::{
    core::{Atomic, AtomicU64, GenericCounterVec, GenericGauge, GenericGaugeVec},
    HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
};

pub mod outcome {
    pub const SUCCESS: &str = "success";
    pub const ERROR: &str = "error";
}

pub mod operations {
    pub mod beacon {
        pub const HEAD: &str = "head";
        pub const BLOCK: &str = "block";
        pub const COMMITTEES: &str = "committees";
        pub const PROPOSER_DUTIES: &str = "proposer_duties";
    }
    pub mod mev {
        pub const BLOCK_REWARD: &str = "block_reward";
    }
}

pub type UIntGauge = GenericGauge<AtomicU64>;
pub type UIntGaugeVec = GenericGaugeVec<AtomicU64>;
pub type UIntCounterVec = GenericCounterVec<AtomicU64>;

pub trait Registar {
    fn register_on(&self, registry: &Registry) -> anyhow::Result<()>;
}

pub struct Metrics {
    pub watcher: Watcher,
    pub services: Services,
    pub cache: CacheMetrics,
}

impl Registar for Metrics {
    fn register_on(&self, registry: &Registry) -> anyhow::Result<()> {
        self.watcher.register_on(registry)?;
        self.services.register_on(registry)?;
        self.cache.register_on(registry)?;
        Ok(())
    }
}

pub struct Watcher {
    pub head_slot: UIntGauge,
    pub safe_slot: UIntGauge,
    pub cursor_slot: UIntGauge,
    pub batches_total: IntCounter,
    pub batch_failures_total: IntCounter,
    pub events_total: UIntCounterVec,
    pub attestations_included_total: IntCounter,
    pub decode_errors_total: IntCounter,
    pub skipped_slots_total: IntCounter,
}

impl Registar for Watcher {
    fn register_on(&self, registry: &Registry) -> anyhow::Result<()> {
        registry.register(Box::new(self.head_slot.clone()))?;
        registry.register(Box::new(self.safe_slot.clone()))?;
        registry.register(Box::new(self.cursor_slot.clone()))?;
        registry.register(Box::new(self.batches_total.clone()))?;
        registry.register(Box::new(self.batch_failures_total.clone()))?;
        registry.register(Box::new(self.events_total.clone()))?;
        registry.register(Box::new(self.attestations_included_total.clone()))?;
        registry.register(Box::new(self.decode_errors_total.clone()))?;
        registry.register(Box::new(self.skipped_slots_total.clone()))?;
        Ok(())
    }
}

/// Metric bundle for one outbound dependency; cheap to clone and share.
#[derive(Clone)]
pub struct ServiceMetrics {
    pub call_count: UIntCounterVec,
    pub execution_time_seconds: HistogramVec,
    pub status: UIntCounterVec,
}

impl Registar for ServiceMetrics {
    fn register_on(&self, registry: &Registry) -> anyhow::Result<()> {
        registry.register(Box::new(self.call_count.clone()))?;
        registry.register(Box::new(self.execution_time_seconds.clone()))?;
        registry.register(Box::new(self.status.clone()))?;
        Ok(())
    }
}

impl ServiceMetrics {
    /// Counts and times one outbound call, labelling the outcome.
    pub async fn observe<F, Fut, T, E>(&self, operation: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_count.with_label_values(&[operation]).inc();
        let timer = self
            .execution_time_seconds
            .with_label_values(&[operation])
            .start_timer();
        let result = f().await;
        timer.observe_duration();
        let outcome = if result.is_ok() {
            outcome::SUCCESS
        } else {
            outcome::ERROR
        };
        self.status.with_label_values(&[operation, outcome]).inc();
        result
    }
}

pub struct Services {
    pub beacon: ServiceMetrics,
    pub mev: ServiceMetrics,
}

impl Registar for Services {
    fn register_on(&self, registry: &Registry) -> anyhow::Result<()> {
        self.beacon.register_on(registry)?;
        self.mev.register_on(registry)?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct CacheMetrics {
    pub hits: UIntGaugeVec,
    pub misses: UIntGaugeVec,
}

impl Registar for CacheMetrics {
    fn register_on(&self, registry: &Registry) -> anyhow::Result<()> {
        registry.register(Box::new(self.hits.clone()))?;
        registry.register(Box::new(self.misses.clone()))?;
        Ok(())
    }
}

fn gauge<TVal: Atomic>(namespace: &str, name: &str, help: &str) -> GenericGauge<TVal> {
    let opts = Opts::new(name, help).namespace(namespace.to_string());
    GenericGauge::with_opts(opts).unwrap()
}

fn gauge_vec<TVal: Atomic>(namespace: &str, name: &str, help: &str, labels: &[&str]) -> GenericGaugeVec<TVal> {
    let opts = Opts::new(name, help).namespace(namespace.to_string());
    GenericGaugeVec::new(opts, labels).unwrap()
}

fn int_counter(namespace: &str, name: &str, help: &str) -> IntCounter {
    let opts = Opts::new(name, help).namespace(namespace.to_string());
    IntCounter::with_opts(opts).unwrap()
}

fn counter_vec<TVal: Atomic>(namespace: &str, name: &str, help: &str, labels: &[&str]) -> GenericCounterVec<TVal> {
    let opts = Opts::new(name, help).namespace(namespace.to_string());
    GenericCounterVec::new(opts, labels).unwrap()
}

fn histogram_vec(namespace: &str, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let opts = HistogramOpts::new(name, help).namespace(namespace.to_string());
    HistogramVec::new(opts, labels).unwrap()
}

impl Metrics {
    pub fn new(namespace: &str) -> Self {
        let watcher = Watcher {
            head_slot: gauge(namespace, "watcher__head_slot", "Latest observed head slot"),
            safe_slot: gauge(namespace, "watcher__safe_slot", "Latest computed safe slot"),
            cursor_slot: gauge(namespace, "watcher__cursor_slot", "Last fully processed slot"),
            batches_total: int_counter(namespace, "watcher__batches_total", "Processed batches"),
            batch_failures_total: int_counter(
                namespace,
                "watcher__batch_failures_total",
                "Batches that ended in an error",
            ),
            events_total: counter_vec(
                namespace,
                "watcher__events_total",
                "Emitted events",
                &["kind"],
            ),
            attestations_included_total: int_counter(
                namespace,
                "watcher__attestations_included_total",
                "Monitored attestations found on chain",
            ),
            decode_errors_total: int_counter(
                namespace,
                "watcher__decode_errors_total",
                "Attestations discarded due to malformed bitfields",
            ),
            skipped_slots_total: int_counter(
                namespace,
                "watcher__skipped_slots_total",
                "Slots skipped because committees were unavailable",
            ),
        };

        fn build_service_metrics(namespace: &str, component: &str) -> ServiceMetrics {
            ServiceMetrics {
                call_count: counter_vec(
                    namespace,
                    &format!("external__{component}__call_count"),
                    "Total call count",
                    &["operation"],
                ),
                execution_time_seconds: histogram_vec(
                    namespace,
                    &format!("external__{component}__execution_time_seconds"),
                    "Execution time in seconds",
                    &["operation"],
                ),
                status: counter_vec(
                    namespace,
                    &format!("external__{component}__status"),
                    "Call outcomes",
                    &["operation", "outcome"],
                ),
            }
        }

        let services = Services {
            beacon: build_service_metrics(namespace, "beacon"),
            mev: build_service_metrics(namespace, "mev"),
        };

        let cache = CacheMetrics {
            hits: gauge_vec(namespace, "cache__hits", "Cache hits", &["store"]),
            misses: gauge_vec(namespace, "cache__misses", "Cache misses", &["store"]),
        };

        Metrics {
            watcher,
            services,
            cache,
        }
    }
}
