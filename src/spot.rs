//! Data structures representing RBN spots.
//!
//! A [`RawSpot`] is one decoded report line from the telnet feed. The
//! [`SpotStore`](crate::store::SpotStore) folds raw spots into
//! [`AggregatedSpot`]s, one per (spotted callsign, rounded frequency) pair.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// The transmission mode of the spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    /// Continuous Wave (Morse code)
    Cw,
    /// Radio Teletype
    Rtty,
    /// FT8 digital mode
    Ft8,
    /// FT4 digital mode
    Ft4,
    /// PSK31 digital mode
    Psk31,
    /// Any other mode token
    Unknown,
}

impl Mode {
    /// Map a mode token from a report line, ignoring case.
    pub fn from_token(token: &str) -> Self {
        match token.to_ascii_uppercase().as_str() {
            "CW" => Mode::Cw,
            "RTTY" => Mode::Rtty,
            "FT8" => Mode::Ft8,
            "FT4" => Mode::Ft4,
            "PSK31" => Mode::Psk31,
            _ => Mode::Unknown,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Cw => write!(f, "CW"),
            Mode::Rtty => write!(f, "RTTY"),
            Mode::Ft8 => write!(f, "FT8"),
            Mode::Ft4 => write!(f, "FT4"),
            Mode::Psk31 => write!(f, "PSK31"),
            Mode::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Returns the amateur radio band for a frequency in kHz.
pub fn band_for(frequency_khz: f64) -> Option<&'static str> {
    match frequency_khz as u32 {
        135..=138 => Some("2200m"),
        472..=479 => Some("630m"),
        1800..=2000 => Some("160m"),
        3500..=4000 => Some("80m"),
        5330..=5410 => Some("60m"),
        7000..=7300 => Some("40m"),
        10100..=10150 => Some("30m"),
        14000..=14350 => Some("20m"),
        18068..=18168 => Some("17m"),
        21000..=21450 => Some("15m"),
        24890..=24990 => Some("12m"),
        28000..=29700 => Some("10m"),
        50000..=54000 => Some("6m"),
        144000..=148000 => Some("2m"),
        _ => None,
    }
}

/// Round a frequency to the integer kHz bucket used for grouping.
pub fn center_frequency(frequency_khz: f64) -> i64 {
    frequency_khz.round() as i64
}

/// Build the store key for a callsign and frequency bucket.
pub fn spot_key(dx_call: &str, center_frequency_khz: i64) -> String {
    format!("{}|{}", dx_call, center_frequency_khz)
}

/// A single spot as reported by a skimmer.
///
/// A raw spot like:
/// ```text
/// DX de EA5WU-#:    7018.3  RW1M           CW    19 dB  18 WPM  CQ      2259Z
/// ```
///
/// parses into a `RawSpot` with spotter `EA5WU` (trailing `-#` removed),
/// `dx_call` `RW1M`, 7018.3 kHz, 19 dB and 18 WPM.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSpot {
    /// The skimmer that heard the signal, with trailing `-`, `#` and `:` stripped.
    pub spotter: String,

    /// The station being spotted.
    pub dx_call: String,

    /// Frequency in kHz.
    pub frequency_khz: f64,

    /// Signal-to-noise ratio in decibels.
    pub snr_db: i32,

    /// CW speed in words per minute.
    pub wpm: u16,

    /// The transmission mode.
    pub mode: Mode,

    /// The UTC time printed at the end of the line, when present.
    pub reported_time: Option<NaiveTime>,

    /// When this process received the spot.
    pub timestamp: Instant,
}

impl RawSpot {
    /// Create a raw spot received now.
    pub fn new(
        spotter: impl Into<String>,
        dx_call: impl Into<String>,
        frequency_khz: f64,
        snr_db: i32,
        wpm: u16,
        mode: Mode,
    ) -> Self {
        Self {
            spotter: spotter.into(),
            dx_call: dx_call.into(),
            frequency_khz,
            snr_db,
            wpm,
            mode,
            reported_time: None,
            timestamp: Instant::now(),
        }
    }

    /// Replace the receive timestamp.
    pub fn at(mut self, timestamp: Instant) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Returns the amateur radio band for this spot's frequency.
    pub fn band(&self) -> Option<&'static str> {
        band_for(self.frequency_khz)
    }

    /// The store key this spot folds into.
    pub fn key(&self) -> String {
        spot_key(&self.dx_call, center_frequency(self.frequency_khz))
    }
}

impl fmt::Display for RawSpot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DX de {}: {:>8.1} {} {} {} dB {} WPM",
            self.spotter, self.frequency_khz, self.dx_call, self.mode, self.snr_db, self.wpm,
        )?;
        if let Some(time) = self.reported_time {
            write!(f, " {}", time.format("%H%MZ"))?;
        }
        Ok(())
    }
}

/// Running summary of every spot heard for one callsign near one frequency.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedSpot {
    /// The spotted station.
    pub dx_call: String,

    /// Mean frequency of all folded spots, in kHz.
    pub frequency_khz: f64,

    /// Rounded frequency of the first spot. Never changes.
    pub center_frequency_khz: i64,

    /// Best SNR seen so far.
    pub highest_snr: i32,

    /// Mean speed of all folded spots, in WPM.
    pub average_wpm: f64,

    /// Number of spots folded in.
    pub spot_count: u32,

    /// Mode of the most recent spot.
    pub mode: Mode,

    /// Receive time of the most recent spot.
    pub last_spotted: Instant,
}

impl AggregatedSpot {
    /// Start a new aggregate from its first spot.
    pub fn from_raw(raw: &RawSpot) -> Self {
        Self {
            dx_call: raw.dx_call.clone(),
            frequency_khz: raw.frequency_khz,
            center_frequency_khz: center_frequency(raw.frequency_khz),
            highest_snr: raw.snr_db,
            average_wpm: f64::from(raw.wpm),
            spot_count: 1,
            mode: raw.mode,
            last_spotted: raw.timestamp,
        }
    }

    /// Fold another spot in using incremental means.
    pub fn update(&mut self, raw: &RawSpot) {
        self.spot_count += 1;
        let n = f64::from(self.spot_count);
        self.average_wpm += (f64::from(raw.wpm) - self.average_wpm) / n;
        self.frequency_khz += (raw.frequency_khz - self.frequency_khz) / n;
        if raw.snr_db > self.highest_snr {
            self.highest_snr = raw.snr_db;
        }
        self.mode = raw.mode;
        if raw.timestamp > self.last_spotted {
            self.last_spotted = raw.timestamp;
        }
    }

    pub fn key(&self) -> String {
        spot_key(&self.dx_call, self.center_frequency_khz)
    }

    /// Time since the last spot, measured against `now`.
    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_spotted)
    }

    pub fn age(&self) -> Duration {
        self.age_at(Instant::now())
    }

    /// Age as a fraction of `max_age`: 0.0 when just spotted, 1.0 once expired.
    pub fn age_fraction(&self, max_age: Duration) -> f32 {
        if max_age.is_zero() {
            return 1.0;
        }
        (self.age().as_secs_f32() / max_age.as_secs_f32()).min(1.0)
    }

    pub fn band(&self) -> Option<&'static str> {
        band_for(self.frequency_khz)
    }
}
