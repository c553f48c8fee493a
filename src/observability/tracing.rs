use tracing::Span;
use tracing_subscriber::EnvFilter;
use crate::config::LoggingConfig;
use crate::types::ids::CycleId;

pub fn trace_cycle(cycle_id: &CycleId, collection_seq: u64) -> Span {
    tracing::info_span!(
        "collection_cycle",
        cycle_id = %cycle_id,
        collection_seq,
    )
}

pub fn trace_source(source: &str) -> Span {
    tracing::info_span!(
        "source_collection",
        source = %source,
    )
}

pub fn trace_health_check(source: &str) -> Span {
    tracing::debug_span!(
        "health_check",
        source = %source,
    )
}

/// Install the global subscriber. `RUST_LOG` overrides the configured filter.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("tracing subscriber already installed: {}", e);
    }
}
