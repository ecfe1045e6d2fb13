//! Statistics tracking for the spot pipeline.
//!
//! Counters cover the feed (lines, bytes, spots, rejections, logins) and the
//! display (frames, device errors). Distributions of SNR and WPM, spots per
//! band, and the busiest skimmers are kept for the summary and metrics.

use hdrhistogram::Histogram;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::spot::RawSpot;

/// Thread-safe statistics collector shared by the feed and display tasks.
#[derive(Debug)]
pub struct FeedStats {
    /// Lines received from the feed
    pub lines_received: AtomicU64,

    /// Bytes received from the feed
    pub bytes_received: AtomicU64,

    /// Spots parsed and folded into the store
    pub spots_parsed: AtomicU64,

    /// Lines with the spot prefix that failed the grammar
    pub parse_rejections: AtomicU64,

    /// Lines without the spot prefix
    pub non_spot_lines: AtomicU64,

    /// Successful logins
    pub logins: AtomicU64,

    /// Connection attempts or sessions that ended in an error
    pub connection_failures: AtomicU64,

    /// Frames computed by the display scheduler
    pub frames_rendered: AtomicU64,

    /// Frames actually written to the device
    pub frames_written: AtomicU64,

    /// Device open or write failures
    pub device_errors: AtomicU64,

    /// Histogram of SNR values, offset by 30 to handle negatives
    snr_histogram: RwLock<Histogram<u64>>,

    /// Histogram of WPM values
    wpm_histogram: RwLock<Histogram<u64>>,

    /// Spots per band
    spots_by_band: RwLock<HashMap<String, u64>>,

    /// Top spotters (skimmers)
    top_spotters: RwLock<HashMap<String, u64>>,

    /// When stats collection started
    start_time: Instant,
}

fn new_histogram() -> Histogram<u64> {
    // Bounds are constants well inside what hdrhistogram accepts
    Histogram::new_with_bounds(1, 100, 2).expect("valid histogram bounds")
}

impl FeedStats {
    pub fn new() -> Self {
        Self {
            lines_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            spots_parsed: AtomicU64::new(0),
            parse_rejections: AtomicU64::new(0),
            non_spot_lines: AtomicU64::new(0),
            logins: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            frames_rendered: AtomicU64::new(0),
            frames_written: AtomicU64::new(0),
            device_errors: AtomicU64::new(0),
            snr_histogram: RwLock::new(new_histogram()),
            wpm_histogram: RwLock::new(new_histogram()),
            spots_by_band: RwLock::new(HashMap::new()),
            top_spotters: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Record a received line.
    pub fn record_line(&self, bytes: usize) {
        self.lines_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a successfully parsed spot.
    pub fn record_spot(&self, spot: &RawSpot) {
        self.spots_parsed.fetch_add(1, Ordering::Relaxed);

        let snr_offset = (spot.snr_db + 30).max(0) as u64;
        if let Ok(mut hist) = self.snr_histogram.write() {
            let _ = hist.record(snr_offset.clamp(1, 99));
        }

        if let Ok(mut hist) = self.wpm_histogram.write() {
            let _ = hist.record(u64::from(spot.wpm).clamp(1, 99));
        }

        if let Some(band) = spot.band()
            && let Ok(mut map) = self.spots_by_band.write()
        {
            *map.entry(band.to_string()).or_insert(0) += 1;
        }

        if let Ok(mut map) = self.top_spotters.write() {
            *map.entry(spot.spotter.clone()).or_insert(0) += 1;
        }
    }

    pub fn record_rejection(&self) {
        self.parse_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_non_spot(&self) {
        self.non_spot_lines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_login(&self) {
        self.logins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a computed frame and whether it reached the device.
    pub fn record_frame(&self, written: bool) {
        self.frames_rendered.fetch_add(1, Ordering::Relaxed);
        if written {
            self.frames_written.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_device_error(&self) {
        self.device_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn spots_per_second(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.spots_parsed.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Generate a summary report.
    pub fn summary(&self) -> StatsSummary {
        let percentiles = |hist: &RwLock<Histogram<u64>>, offset: u64| {
            hist.read().ok().filter(|h| !h.is_empty()).map(|h| HistogramPercentiles {
                p50: h.value_at_quantile(0.50) as i64 - offset as i64,
                p90: h.value_at_quantile(0.90) as i64 - offset as i64,
                p99: h.value_at_quantile(0.99) as i64 - offset as i64,
                min: h.min() as i64 - offset as i64,
                max: h.max() as i64 - offset as i64,
                mean: h.mean() - offset as f64,
            })
        };

        let spots_by_band = self
            .spots_by_band
            .read()
            .map(|m| m.clone())
            .unwrap_or_default();

        // Get top 10 spotters
        let top_spotters = self
            .top_spotters
            .read()
            .map(|m| {
                let mut vec: Vec<_> = m.iter().map(|(k, v)| (k.clone(), *v)).collect();
                vec.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                vec.truncate(10);
                vec
            })
            .unwrap_or_default();

        StatsSummary {
            elapsed_secs: self.elapsed().as_secs_f64(),
            lines_received: self.lines_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            spots_parsed: self.spots_parsed.load(Ordering::Relaxed),
            parse_rejections: self.parse_rejections.load(Ordering::Relaxed),
            non_spot_lines: self.non_spot_lines.load(Ordering::Relaxed),
            logins: self.logins.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            frames_rendered: self.frames_rendered.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            device_errors: self.device_errors.load(Ordering::Relaxed),
            spots_per_second: self.spots_per_second(),
            snr_percentiles: percentiles(&self.snr_histogram, 30),
            wpm_percentiles: percentiles(&self.wpm_histogram, 0),
            spots_by_band,
            top_spotters,
        }
    }
}

impl Default for FeedStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Percentile values from a histogram.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramPercentiles {
    pub p50: i64,
    pub p90: i64,
    pub p99: i64,
    pub min: i64,
    pub max: i64,
    pub mean: f64,
}

/// Summary of collected statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub elapsed_secs: f64,
    pub lines_received: u64,
    pub bytes_received: u64,
    pub spots_parsed: u64,
    pub parse_rejections: u64,
    pub non_spot_lines: u64,
    pub logins: u64,
    pub connection_failures: u64,
    pub frames_rendered: u64,
    pub frames_written: u64,
    pub device_errors: u64,
    pub spots_per_second: f64,
    pub snr_percentiles: Option<HistogramPercentiles>,
    pub wpm_percentiles: Option<HistogramPercentiles>,
    pub spots_by_band: HashMap<String, u64>,
    pub top_spotters: Vec<(String, u64)>,
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "═══════════════════════════════════════════════════════")?;
        writeln!(f, "                 RBN VFD STATISTICS")?;
        writeln!(f, "═══════════════════════════════════════════════════════")?;
        writeln!(f)?;
        writeln!(f, "Runtime: {:.1}s", self.elapsed_secs)?;
        writeln!(f, "Lines received: {}", self.lines_received)?;
        writeln!(f, "Bytes received: {} KB", self.bytes_received / 1024)?;
        writeln!(f, "Spots parsed: {}", self.spots_parsed)?;
        writeln!(f, "Parse rejections: {}", self.parse_rejections)?;
        writeln!(f, "Non-spot lines: {}", self.non_spot_lines)?;
        writeln!(f, "Logins: {}", self.logins)?;
        writeln!(f, "Connection failures: {}", self.connection_failures)?;
        writeln!(
            f,
            "Frames: {} rendered, {} written",
            self.frames_rendered, self.frames_written
        )?;
        writeln!(f, "Device errors: {}", self.device_errors)?;
        writeln!(f, "Rate: {:.1} spots/sec", self.spots_per_second)?;
        writeln!(f)?;

        if let Some(ref p) = self.snr_percentiles {
            writeln!(f, "SNR Distribution (dB):")?;
            writeln!(f, "  Min: {}, Max: {}, Mean: {:.1}", p.min, p.max, p.mean)?;
            writeln!(f, "  P50: {}, P90: {}, P99: {}", p.p50, p.p90, p.p99)?;
            writeln!(f)?;
        }

        if let Some(ref p) = self.wpm_percentiles {
            writeln!(f, "WPM Distribution:")?;
            writeln!(f, "  Min: {}, Max: {}, Mean: {:.1}", p.min, p.max, p.mean)?;
            writeln!(f, "  P50: {}, P90: {}, P99: {}", p.p50, p.p90, p.p99)?;
            writeln!(f)?;
        }

        if !self.spots_by_band.is_empty() {
            writeln!(f, "Spots by Band:")?;
            let mut bands: Vec<_> = self.spots_by_band.iter().collect();
            bands.sort_by(|a, b| b.1.cmp(a.1));
            for (band, count) in bands {
                writeln!(f, "  {}: {}", band, count)?;
            }
            writeln!(f)?;
        }

        if !self.top_spotters.is_empty() {
            writeln!(f, "Top 10 Spotters:")?;
            for (i, (spotter, count)) in self.top_spotters.iter().enumerate() {
                writeln!(f, "  {}. {}: {}", i + 1, spotter, count)?;
            }
        }

        Ok(())
    }
}
