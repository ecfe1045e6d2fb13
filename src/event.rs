//! Notifications published to whoever drives the [`Controller`](crate::service::Controller).

use std::fmt;

use crate::display::DisplayFrame;

/// Lifecycle of the feed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    Idle,
    Connecting,
    /// Connected, waiting for the callsign prompt.
    AwaitingPrompt,
    /// Callsign sent, spots flowing.
    LoggedIn,
    Closing,
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedStatus::Idle => write!(f, "Idle"),
            FeedStatus::Connecting => write!(f, "Connecting"),
            FeedStatus::AwaitingPrompt => write!(f, "Connected, waiting for login prompt"),
            FeedStatus::LoggedIn => write!(f, "Logged in"),
            FeedStatus::Closing => write!(f, "Closing"),
        }
    }
}

/// State of the output device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputStatus {
    Open(String),
    Closed,
}

/// Direction of raw feed traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Received,
    Sent,
}

/// Everything the core reports to its collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The feed connection changed state.
    FeedStatus(FeedStatus),

    /// The feed failed to connect, read, or write.
    FeedError(String),

    /// A spot was folded into the store.
    SpotAdded {
        key: String,
        spot_count: u32,
        /// Total records in the store after the update.
        records: usize,
    },

    /// A new frame was computed, whether or not a device is attached.
    DisplayUpdated(DisplayFrame),

    /// The output device opened or closed.
    OutputStatus(OutputStatus),

    /// The output device failed to open or write.
    OutputError(String),

    /// A line of telnet traffic, for debugging.
    RawData { text: String, direction: Direction },
}
