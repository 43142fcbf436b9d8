//! Log pipeline setup.
//!
//! The watcher narrates batches and slot ranges at info level; hyper and
//! reqwest would trace every outbound connection of the fetch fan-out, so
//! they are held to warnings unless `RUST_LOG` says otherwise.

use derive_more::FromStr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, PartialEq, FromStr)]
pub enum LogFormat {
    Plain,
    Json,
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,hyper_util=warn,reqwest=warn"))
}

/// Installs the global subscriber. Calling it again is a no-op, which
/// keeps multi-entry test setups simple.
pub fn init(format: &LogFormat) {
    let registry = tracing_subscriber::registry().with(default_filter());
    let installed = match format {
        LogFormat::Json => registry
            .with(json_subscriber::layer().flatten_event(true))
            .try_init(),
        LogFormat::Plain => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_thread_names(true),
            )
            .try_init(),
    };
    if installed.is_err() {
        tracing::debug!("Logger was already installed");
    }
}
