//! Prometheus metrics for session lifecycle and acquisition observability.

use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Values acquired (poll reads and push notifications), post-classification
pub static VALUES_ACQUIRED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "tagflux_values_acquired_total",
        "Acquired tag values, post-classification",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Per-item acquisition failures (bad quality, read errors, rejections)
pub static ACQUISITION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "tagflux_acquisition_errors_total",
        "Tag reads or notifications that produced an error-quality value",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Alarm state transitions across all tags
pub static ALARM_TRANSITIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "tagflux_alarm_transitions_total",
        "Per-tag alarm state changes",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Reconnect attempts, successful or not
pub static RECONNECT_ATTEMPTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "tagflux_reconnect_attempts_total",
        "Background reconnect attempts",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Operations that gave up waiting for the connection gate
pub static GATE_TIMEOUTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "tagflux_gate_timeouts_total",
        "Network operations abandoned waiting for the connection gate",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Currently connected sessions
pub static CONNECTED_SESSIONS: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new("tagflux_connected_sessions", "Currently connected sessions").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    let _ = VALUES_ACQUIRED_TOTAL.get();
    let _ = ACQUISITION_ERRORS_TOTAL.get();
    let _ = ALARM_TRANSITIONS_TOTAL.get();
    let _ = RECONNECT_ATTEMPTS_TOTAL.get();
    let _ = GATE_TIMEOUTS_TOTAL.get();
    let _ = CONNECTED_SESSIONS.get();
}

/// Serve the registry as Prometheus text format on a background thread.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(server) => server,
            Err(e) => {
                tracing::error!("Failed to bind metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            match request.url() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = REGISTRY.gather();
                    let mut buffer = Vec::new();

                    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                        tracing::warn!("Failed to encode metrics: {}", e);
                        let _ = request.respond(
                            Response::from_string("Internal Server Error").with_status_code(500),
                        );
                        continue;
                    }

                    let response = Response::from_data(buffer).with_header(
                        tiny_http::Header::from_bytes(
                            &b"Content-Type"[..],
                            &b"text/plain; version=0.0.4"[..],
                        )
                        .unwrap(),
                    );
                    let _ = request.respond(response);
                }
                "/health" => {
                    let _ = request.respond(Response::from_string("OK"));
                }
                _ => {
                    let _ =
                        request.respond(Response::from_string("Not Found").with_status_code(404));
                }
            }
        }
    })
}
