//! Prometheus metrics handler

use crate::domain::signaling::RelayKind;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder. Call once per process.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_gauge!("relay_rooms", "Number of rooms with at least one member");
    describe_gauge!("relay_connections", "Number of connected signaling clients");
    describe_counter!(
        "relay_messages_forwarded_total",
        "Offers, answers and candidates delivered to their target"
    );
    describe_counter!(
        "relay_messages_dropped_total",
        "Offers, answers and candidates whose target was not connected"
    );

    Ok(handle)
}

/// `GET /metrics`
pub async fn metrics_handler(State(prometheus_handle): State<PrometheusHandle>) -> Response {
    let metrics = prometheus_handle.render();
    (StatusCode::OK, metrics).into_response()
}

pub fn update_relay_gauges(rooms: usize, connections: usize) {
    gauge!("relay_rooms").set(rooms as f64);
    gauge!("relay_connections").set(connections as f64);
}

pub fn record_relay_forwarded(kind: RelayKind) {
    counter!("relay_messages_forwarded_total", "kind" => kind.as_str()).increment(1);
}

pub fn record_relay_dropped(kind: RelayKind) {
    counter!("relay_messages_dropped_total", "kind" => kind.as_str()).increment(1);
}
