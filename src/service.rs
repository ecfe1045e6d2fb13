//! Command facade over the running pipeline.
//!
//! [`Controller::start`] spawns three tasks sharing one [`SpotStore`]: the
//! feed client, the display scheduler, and a periodic eviction pass. The
//! caller drives them with [`Command`]s and observes them through the
//! [`Event`] receiver returned alongside the controller.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{FeedClient, FeedCommand};
use crate::config::Config;
use crate::event::Event;
use crate::scheduler::{DisplayCommand, DisplayScheduler};
use crate::stats::FeedStats;
use crate::store::SpotStore;

/// Capacity of the outbound event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Shortest gap between eviction passes.
pub const MIN_PURGE_INTERVAL: Duration = Duration::from_secs(1);

/// Requests accepted by the [`Controller`].
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Connect to the feed and log in with this callsign.
    Connect(String),
    Disconnect,
    /// Open the named serial port as the output device.
    OpenOutput(String),
    CloseOutput,
    /// Clear the device and preview without closing the port.
    BlankOutput,
    SetMinSnr(i32),
    SetMaxAge(Duration),
    SetRotationInterval(Duration),
    /// Drop every aggregated record.
    ClearStore,
}

/// Handle to the running feed, scheduler, and eviction tasks.
pub struct Controller {
    store: Arc<SpotStore>,
    stats: Arc<FeedStats>,
    feed_tx: mpsc::UnboundedSender<FeedCommand>,
    display_tx: mpsc::UnboundedSender<DisplayCommand>,
    events: mpsc::Sender<Event>,
    tasks: Vec<JoinHandle<()>>,
}

impl Controller {
    /// Spawn the pipeline. Must be called inside a Tokio runtime.
    pub fn start(config: &Config) -> (Self, mpsc::Receiver<Event>) {
        let store = Arc::new(SpotStore::with_retention(config.retention()));
        let stats = Arc::new(FeedStats::new());
        let (events, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let client = FeedClient::new(
            config.feed_config(),
            Arc::clone(&store),
            Arc::clone(&stats),
            events.clone(),
        );

        let (display_tx, display_rx) = mpsc::unbounded_channel();
        let scheduler = DisplayScheduler::new(
            Arc::clone(&store),
            Arc::clone(&stats),
            events.clone(),
            config.scheduler_settings(),
        );

        let tasks = vec![
            tokio::spawn(client.run(feed_rx)),
            tokio::spawn(scheduler.run(display_rx)),
            tokio::spawn(evict_periodically(
                Arc::clone(&store),
                config.purge_interval(),
            )),
        ];

        info!(
            "Pipeline started (retention {}m, purge every {}s)",
            config.retention_minutes,
            config.purge_interval().as_secs()
        );

        (
            Self {
                store,
                stats,
                feed_tx,
                display_tx,
                events,
                tasks,
            },
            event_rx,
        )
    }

    /// Queue a command. Never blocks.
    pub fn send(&self, command: Command) {
        debug!("Command: {:?}", command);
        match command {
            Command::Connect(callsign) => {
                let callsign = callsign.trim().to_uppercase();
                if callsign.is_empty() {
                    warn!("Refusing to connect without a callsign");
                    let _ = self
                        .events
                        .try_send(Event::FeedError("Callsign is required".to_string()));
                    return;
                }
                self.feed(FeedCommand::Connect(callsign));
            }
            Command::Disconnect => self.feed(FeedCommand::Disconnect),
            Command::OpenOutput(port) => self.display(DisplayCommand::Open(port)),
            Command::CloseOutput => self.display(DisplayCommand::Close),
            Command::BlankOutput => self.display(DisplayCommand::Blank),
            Command::SetMinSnr(min_snr) => self.display(DisplayCommand::SetMinSnr(min_snr)),
            Command::SetMaxAge(max_age) => self.display(DisplayCommand::SetMaxAge(max_age)),
            Command::SetRotationInterval(interval) => {
                self.display(DisplayCommand::SetInterval(interval))
            }
            Command::ClearStore => {
                self.store.clear();
                info!("Spot store cleared");
            }
        }
    }

    pub fn store(&self) -> &Arc<SpotStore> {
        &self.store
    }

    pub fn stats(&self) -> &Arc<FeedStats> {
        &self.stats
    }

    /// Close the feed and the device, then wait for the tasks to finish.
    ///
    /// Status events are sent with backpressure, so the event receiver must
    /// either keep being drained or be dropped before this is awaited.
    pub async fn shutdown(self) {
        let Self {
            feed_tx,
            display_tx,
            mut tasks,
            ..
        } = self;

        // Dropping the command senders ends the feed and scheduler loops
        drop(feed_tx);
        drop(display_tx);

        // The eviction timer never ends on its own
        if let Some(evictor) = tasks.pop() {
            evictor.abort();
        }
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Task ended abnormally: {}", e);
            }
        }
        info!("Pipeline stopped");
    }

    fn feed(&self, command: FeedCommand) {
        if self.feed_tx.send(command).is_err() {
            warn!("Feed task is not running");
        }
    }

    fn display(&self, command: DisplayCommand) {
        if self.display_tx.send(command).is_err() {
            warn!("Display task is not running");
        }
    }
}

/// Drop expired records on a fixed cadence.
async fn evict_periodically(store: Arc<SpotStore>, every: Duration) {
    // interval() panics on a zero period
    let mut interval = tokio::time::interval(every.max(MIN_PURGE_INTERVAL));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let removed = store.evict_expired();
        if removed > 0 {
            debug!("Evicted {} expired spots, {} remain", removed, store.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{FeedStatus, OutputStatus};
    use crate::spot::{Mode, RawSpot};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn local_config(port: u16) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout: 5,
            read_timeout: 5,
            ..Default::default()
        }
    }

    async fn next_matching<F>(events: &mut mpsc::Receiver<Event>, mut wanted: F) -> Event
    where
        F: FnMut(&Event) -> bool,
    {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if wanted(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_empty_callsign_refused() {
        let (controller, mut events) = Controller::start(&Config::default());

        controller.send(Command::Connect("   ".to_string()));
        let event = next_matching(&mut events, |e| {
            matches!(e, Event::FeedError(_) | Event::FeedStatus(_))
        })
        .await;
        assert_eq!(event, Event::FeedError("Callsign is required".to_string()));

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_normalizes_callsign() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            write_half.write_all(b"Please enter your call:\r\n").await.unwrap();
            let mut login = String::new();
            BufReader::new(read_half).read_line(&mut login).await.unwrap();
            login
        });

        let (controller, mut events) = Controller::start(&local_config(port));
        controller.send(Command::Connect("  w6jsv ".to_string()));

        assert_eq!(server.await.unwrap(), "W6JSV\r\n");
        next_matching(&mut events, |e| {
            *e == Event::FeedStatus(FeedStatus::LoggedIn)
        })
        .await;

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_clear_store() {
        let (controller, _events) = Controller::start(&Config::default());
        controller
            .store()
            .upsert(RawSpot::new("K3LR", "WO6W", 14033.0, 12, 24, Mode::Cw));
        assert_eq!(controller.store().len(), 1);

        controller.send(Command::ClearStore);
        assert!(controller.store().is_empty());

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_missing_output_reports_error() {
        let (controller, mut events) = Controller::start(&Config::default());

        controller.send(Command::OpenOutput("/dev/does-not-exist-vfd".to_string()));
        next_matching(&mut events, |e| matches!(e, Event::OutputError(_))).await;
        let event = next_matching(&mut events, |e| matches!(e, Event::OutputStatus(_))).await;
        assert_eq!(event, Event::OutputStatus(OutputStatus::Closed));

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_preview_follows_store() {
        let mut config = Config::default();
        config.display.min_snr = 0;
        config.display.scroll_interval_ms = 250;
        let (controller, mut events) = Controller::start(&config);

        controller
            .store()
            .upsert(RawSpot::new("K3LR", "WO6W", 14033.0, 12, 24, Mode::Cw));

        let event = next_matching(&mut events, |e| match e {
            Event::DisplayUpdated(frame) => frame.lines[0].contains("WO6W"),
            _ => false,
        })
        .await;
        let Event::DisplayUpdated(frame) = event else {
            unreachable!()
        };
        assert_eq!(frame.lines[0].len(), 20);

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_zero_purge_interval_still_evicts() {
        let config = Config {
            retention_minutes: 1,
            purge_interval: 0,
            ..Default::default()
        };
        let (controller, _events) = Controller::start(&config);

        let stale = std::time::Instant::now()
            .checked_sub(Duration::from_secs(120))
            .unwrap();
        controller
            .store()
            .upsert(RawSpot::new("K3LR", "WO6W", 14033.0, 12, 24, Mode::Cw).at(stale));

        // The eviction task is still alive and runs at the floor cadence
        let deadline = tokio::time::Instant::now() + MIN_PURGE_INTERVAL * 3;
        while !controller.store().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(controller.store().is_empty());

        controller.shutdown().await;
    }
}
