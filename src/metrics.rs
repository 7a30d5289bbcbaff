use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, IntCounter, IntGauge, TextEncoder, opts, register_histogram,
    register_int_counter, register_int_gauge,
};

pub static CONNECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "roomcast_connections_total",
        "Total number of accepted client connections"
    ))
    .unwrap()
});

pub static CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!(
        "roomcast_connections_active",
        "Client connections with an established session"
    ))
    .unwrap()
});

pub static USERS_ONLINE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!(
        "roomcast_users_online",
        "Users with at least one open connection"
    ))
    .unwrap()
});

pub static MESSAGES_SENT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "roomcast_messages_sent_total",
        "Messages accepted through the full pipeline"
    ))
    .unwrap()
});

pub static MESSAGES_FLAGGED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "roomcast_messages_flagged_total",
        "Messages flagged by the moderation stage"
    ))
    .unwrap()
});

pub static RATE_LIMIT_REJECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "roomcast_rate_limit_rejections_total",
        "Actions rejected by the rate limiter"
    ))
    .unwrap()
});

pub static INDEXING_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "roomcast_indexing_failures_total",
        "Search index requests that failed"
    ))
    .unwrap()
});

pub static MESSAGE_PIPELINE_TIME: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "roomcast_message_pipeline_seconds",
        "Time from sendMessage receipt to broadcast"
    )
    .unwrap()
});

pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}
