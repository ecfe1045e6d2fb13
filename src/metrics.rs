//! Prometheus metrics HTTP server.
//!
//! Exposes feed and display statistics plus the size of the spot store in
//! Prometheus text format.

use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use tokio::net::TcpListener;
use tracing::info;

use crate::stats::FeedStats;
use crate::store::SpotStore;

/// Shared handles read on every scrape.
#[derive(Clone)]
pub struct MetricsState {
    pub stats: Arc<FeedStats>,
    pub store: Arc<SpotStore>,
}

/// Start the Prometheus metrics HTTP server.
///
/// Serves metrics at `/metrics` until the task is dropped.
/// Returns an error if the server fails to bind to the port.
pub async fn start_metrics_server(port: u16, state: MetricsState) -> Result<(), std::io::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!("Prometheus metrics server listening on http://{}/metrics", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    let output = format_prometheus_metrics(&state.stats, &state.store);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        output,
    )
}

fn metric(out: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
    let _ = writeln!(out, "{} {}", name, value);
}

/// Format statistics as Prometheus text format.
fn format_prometheus_metrics(stats: &FeedStats, store: &SpotStore) -> String {
    let summary = stats.summary();
    let mut out = String::with_capacity(4096);

    metric(
        &mut out,
        "rbn_vfd_uptime_seconds",
        "gauge",
        "Time since the pipeline started",
        format_args!("{:.3}", summary.elapsed_secs),
    );
    metric(
        &mut out,
        "rbn_vfd_lines_received_total",
        "counter",
        "Lines received from the feed",
        summary.lines_received,
    );
    metric(
        &mut out,
        "rbn_vfd_bytes_received_total",
        "counter",
        "Bytes received from the feed",
        summary.bytes_received,
    );
    metric(
        &mut out,
        "rbn_vfd_spots_total",
        "counter",
        "Spots parsed and aggregated",
        summary.spots_parsed,
    );
    metric(
        &mut out,
        "rbn_vfd_parse_rejections_total",
        "counter",
        "Spot lines that failed to parse",
        summary.parse_rejections,
    );
    metric(
        &mut out,
        "rbn_vfd_non_spot_lines_total",
        "counter",
        "Non-spot lines received",
        summary.non_spot_lines,
    );
    metric(
        &mut out,
        "rbn_vfd_logins_total",
        "counter",
        "Successful logins",
        summary.logins,
    );
    metric(
        &mut out,
        "rbn_vfd_connection_failures_total",
        "counter",
        "Connections that failed or dropped with an error",
        summary.connection_failures,
    );
    metric(
        &mut out,
        "rbn_vfd_frames_rendered_total",
        "counter",
        "Display frames computed",
        summary.frames_rendered,
    );
    metric(
        &mut out,
        "rbn_vfd_frames_written_total",
        "counter",
        "Display frames written to the device",
        summary.frames_written,
    );
    metric(
        &mut out,
        "rbn_vfd_device_errors_total",
        "counter",
        "Output device failures",
        summary.device_errors,
    );
    metric(
        &mut out,
        "rbn_vfd_spots_per_second",
        "gauge",
        "Current spot processing rate",
        format_args!("{:.3}", summary.spots_per_second),
    );
    metric(
        &mut out,
        "rbn_vfd_aggregated_spots",
        "gauge",
        "Records currently held in the spot store",
        store.len(),
    );
    metric(
        &mut out,
        "rbn_vfd_evicted_spots_total",
        "counter",
        "Records removed by expiry",
        store
            .evicted_total
            .load(std::sync::atomic::Ordering::Relaxed),
    );

    out.push_str("# HELP rbn_vfd_spots_by_band_total Spots broken down by amateur band\n");
    out.push_str("# TYPE rbn_vfd_spots_by_band_total counter\n");
    let mut bands: Vec<_> = summary.spots_by_band.iter().collect();
    bands.sort();
    for (band, count) in bands {
        let _ = writeln!(out, "rbn_vfd_spots_by_band_total{{band=\"{}\"}} {}", band, count);
    }

    if let Some(ref snr) = summary.snr_percentiles {
        out.push_str("# HELP rbn_vfd_snr_db SNR distribution in decibels\n");
        out.push_str("# TYPE rbn_vfd_snr_db summary\n");
        let _ = writeln!(out, "rbn_vfd_snr_db{{quantile=\"0.5\"}} {}", snr.p50);
        let _ = writeln!(out, "rbn_vfd_snr_db{{quantile=\"0.9\"}} {}", snr.p90);
        let _ = writeln!(out, "rbn_vfd_snr_db{{quantile=\"0.99\"}} {}", snr.p99);
        let _ = writeln!(out, "rbn_vfd_snr_db_count {}", summary.spots_parsed);
    }

    if let Some(ref wpm) = summary.wpm_percentiles {
        out.push_str("# HELP rbn_vfd_wpm WPM (words per minute) distribution\n");
        out.push_str("# TYPE rbn_vfd_wpm summary\n");
        let _ = writeln!(out, "rbn_vfd_wpm{{quantile=\"0.5\"}} {}", wpm.p50);
        let _ = writeln!(out, "rbn_vfd_wpm{{quantile=\"0.9\"}} {}", wpm.p90);
        let _ = writeln!(out, "rbn_vfd_wpm{{quantile=\"0.99\"}} {}", wpm.p99);
        let _ = writeln!(out, "rbn_vfd_wpm_count {}", summary.spots_parsed);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spot::{Mode, RawSpot};

    #[test]
    fn test_format_prometheus_metrics_empty() {
        let output = format_prometheus_metrics(&FeedStats::new(), &SpotStore::new());

        assert!(output.contains("rbn_vfd_uptime_seconds"));
        assert!(output.contains("rbn_vfd_parse_rejections_total 0"));
        assert!(output.contains("rbn_vfd_non_spot_lines_total 0"));
        assert!(output.contains("rbn_vfd_aggregated_spots 0"));
        assert!(!output.contains("rbn_vfd_snr_db{"));
    }

    #[test]
    fn test_format_prometheus_metrics_with_data() {
        let stats = FeedStats::new();
        let store = SpotStore::new();

        let spot = RawSpot::new("TEST-#", "W1AW", 14025.0, 15, 22, Mode::Cw);
        stats.record_line(100);
        stats.record_spot(&spot);
        store.upsert(spot.clone());
        store.upsert(RawSpot::new("TEST-#", "K1TTT", 7025.0, 9, 30, Mode::Cw));

        let output = format_prometheus_metrics(&stats, &store);

        assert!(output.contains("rbn_vfd_spots_total 1"));
        assert!(output.contains("rbn_vfd_bytes_received_total 100"));
        assert!(output.contains("rbn_vfd_spots_by_band_total{band=\"20m\"} 1"));
        assert!(output.contains("rbn_vfd_aggregated_spots 2"));
        assert!(output.contains("rbn_vfd_snr_db_count 1"));
    }

    #[test]
    fn test_prometheus_format_validity() {
        let stats = FeedStats::new();
        stats.record_spot(&RawSpot::new("TEST-#", "W1AW", 14025.0, -3, 22, Mode::Cw));
        let output = format_prometheus_metrics(&stats, &SpotStore::new());

        // Each sample line is a metric name followed by a value
        for line in output.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            assert_eq!(parts.len(), 2, "Invalid metric line: {}", line);
            assert!(parts[1].parse::<f64>().is_ok(), "Bad value: {}", line);
        }
    }
}
