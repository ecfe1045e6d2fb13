//! RBN VFD - Aggregate Reverse Beacon Network spots onto a two-line VFD.
//!
//! This crate provides:
//! - A nom-based parser for RBN spot lines
//! - A login handshake and line framer for the RBN telnet feed
//! - A thread-safe store that folds repeated spots into one record
//! - A display scheduler that rotates records across a serial VFD
//! - A command facade tying the feed, store, and display together
//!
//! # Example
//!
//! ```rust,no_run
//! use rbn_vfd::{parser::parse_spot, store::SpotStore};
//!
//! let line = "DX de EA5WU-#:    7018.3  RW1M           CW    19 dB  18 WPM  CQ      2259Z";
//! let spot = parse_spot(line).expect("Failed to parse spot");
//!
//! let store = SpotStore::new();
//! store.upsert(spot);
//!
//! for record in store.query(10, std::time::Duration::from_secs(600)) {
//!     println!("{} {:.1} {}", record.dx_call, record.frequency_khz, record.highest_snr);
//! }
//! ```

pub mod client;
pub mod config;
pub mod display;
pub mod event;
pub mod login;
pub mod metrics;
pub mod parser;
pub mod scheduler;
pub mod service;
pub mod spot;
pub mod stats;
pub mod store;

pub use client::{FeedClient, FeedCommand, FeedConfig};
pub use config::{Config, DisplayConfig};
pub use display::{DisplayError, DisplayFrame, LineLayout, VfdDisplay, format_spot};
pub use event::{Direction, Event, FeedStatus, OutputStatus};
pub use login::{Handshake, LineAction, LineBuffer, LoginState};
pub use parser::{ParseError, looks_like_spot, parse_spot};
pub use scheduler::{DisplayScheduler, SchedulerSettings};
pub use service::{Command, Controller};
pub use spot::{AggregatedSpot, Mode, RawSpot};
pub use stats::{FeedStats, StatsSummary};
pub use store::SpotStore;
