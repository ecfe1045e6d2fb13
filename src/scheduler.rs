//! Display scheduler task.
//!
//! On every tick the scheduler reads a filtered snapshot from the store,
//! lets [`Rotation`] pick the frame, records it as the preview, and writes it
//! to the VFD when one is open. It is the only owner of the device, so all
//! writes are serialized through its task.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::display::{DISPLAY_WIDTH, DisplayFrame, LineLayout, Rotation, VfdDisplay};
use crate::event::{Event, OutputStatus};
use crate::stats::FeedStats;
use crate::store::SpotStore;

/// Shortest allowed rotation interval.
pub const MIN_ROTATION_INTERVAL: Duration = Duration::from_millis(250);

/// Default rotation interval.
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(3);

/// Clamp a requested rotation interval to the allowed floor.
pub fn clamp_interval(interval: Duration) -> Duration {
    interval.max(MIN_ROTATION_INTERVAL)
}

/// Parameters the scheduler reads on every tick.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub min_snr: i32,
    pub max_age: Duration,
    pub interval: Duration,
    pub width: usize,
    pub layout: LineLayout,
    pub baud_rate: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            min_snr: 10,
            max_age: Duration::from_secs(10 * 60),
            interval: DEFAULT_ROTATION_INTERVAL,
            width: DISPLAY_WIDTH,
            layout: LineLayout::default(),
            baud_rate: crate::display::BAUD_RATE,
        }
    }
}

/// Commands handled by the scheduler task.
#[derive(Debug)]
pub enum DisplayCommand {
    Open(String),
    Close,
    Blank,
    SetMinSnr(i32),
    SetMaxAge(Duration),
    SetInterval(Duration),
}

impl DisplayCommand {
    /// Whether applying the command performs device I/O.
    fn touches_device(&self) -> bool {
        matches!(
            self,
            DisplayCommand::Open(_) | DisplayCommand::Close | DisplayCommand::Blank
        )
    }
}

/// Owns the VFD and renders the store onto it.
pub struct DisplayScheduler {
    store: Arc<SpotStore>,
    stats: Arc<FeedStats>,
    events: mpsc::Sender<Event>,
    display: VfdDisplay,
    rotation: Rotation,
    settings: SchedulerSettings,
}

impl DisplayScheduler {
    pub fn new(
        store: Arc<SpotStore>,
        stats: Arc<FeedStats>,
        events: mpsc::Sender<Event>,
        mut settings: SchedulerSettings,
    ) -> Self {
        settings.interval = clamp_interval(settings.interval);
        Self {
            display: VfdDisplay::new(settings.width),
            store,
            stats,
            events,
            rotation: Rotation::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn display(&self) -> &VfdDisplay {
        &self.display
    }

    /// Mutable access to the device, for attaching a writer directly.
    pub fn display_mut(&mut self) -> &mut VfdDisplay {
        &mut self.display
    }

    /// Compute the next frame and write it if the device is open.
    ///
    /// Device failures are reported as events; the tick itself never fails.
    pub fn tick(&mut self) -> DisplayFrame {
        let spots = self
            .store
            .query(self.settings.min_snr, self.settings.max_age);
        let frame = self
            .rotation
            .next_frame(&spots, self.settings.width, self.settings.layout);

        match self.display.show(frame.clone()) {
            Ok(written) => self.stats.record_frame(written),
            Err(e) => {
                self.stats.record_frame(false);
                self.report_device_error(e.to_string());
            }
        }

        debug!("Display frame ({} spots):\n{}", spots.len(), frame);
        let _ = self.events.try_send(Event::DisplayUpdated(frame.clone()));
        frame
    }

    /// Apply one command.
    pub fn apply(&mut self, command: DisplayCommand) {
        match command {
            DisplayCommand::Open(port) => {
                match self.display.open(&port, self.settings.baud_rate) {
                    Ok(()) => self.emit(Event::OutputStatus(OutputStatus::Open(port))),
                    Err(e) => self.report_device_error(e.to_string()),
                }
            }
            DisplayCommand::Close => {
                if self.display.is_open() {
                    self.display.close();
                    self.emit(Event::OutputStatus(OutputStatus::Closed));
                }
            }
            DisplayCommand::Blank => {
                if let Err(e) = self.display.blank() {
                    self.report_device_error(e.to_string());
                }
                let _ = self
                    .events
                    .try_send(Event::DisplayUpdated(self.display.preview().clone()));
            }
            DisplayCommand::SetMinSnr(min_snr) => {
                info!("Min SNR set to {} dB", min_snr);
                self.settings.min_snr = min_snr;
            }
            DisplayCommand::SetMaxAge(max_age) => {
                let max_age = max_age.min(self.store.retention());
                info!("Max age set to {}s", max_age.as_secs());
                self.settings.max_age = max_age;
            }
            DisplayCommand::SetInterval(interval) => {
                let interval = clamp_interval(interval);
                info!("Rotation interval set to {}ms", interval.as_millis());
                self.settings.interval = interval;
            }
        }
    }

    fn report_device_error(&mut self, message: String) {
        warn!("VFD error: {}", message);
        self.stats.record_device_error();
        self.emit(Event::OutputError(message));
        if !self.display.is_open() {
            self.emit(Event::OutputStatus(OutputStatus::Closed));
        }
    }

    fn emit(&self, event: Event) {
        if self.events.try_send(event).is_err() {
            debug!("Event channel full or closed; dropping display event");
        }
    }

    /// Run `work` on the blocking pool and hand the scheduler back.
    ///
    /// Serial opens and writes block for up to the port timeout, so they stay
    /// off the async workers. Returns `None` if `work` panicked.
    async fn offload<F>(mut self, work: F) -> Option<Self>
    where
        F: FnOnce(&mut Self) + Send + 'static,
    {
        let joined = tokio::task::spawn_blocking(move || {
            work(&mut self);
            self
        })
        .await;
        match joined {
            Ok(scheduler) => Some(scheduler),
            Err(e) => {
                error!("Display work failed: {}", e);
                None
            }
        }
    }

    /// Tick until the command channel closes.
    ///
    /// A pending tick keeps its deadline when the interval changes; the new
    /// interval applies from the tick after it.
    pub async fn run(self, mut commands: mpsc::UnboundedReceiver<DisplayCommand>) {
        let mut scheduler = self;
        let mut next_tick = Instant::now();

        loop {
            tokio::select! {
                _ = sleep_until(next_tick) => {
                    let ticked = scheduler.offload(|s| {
                        s.tick();
                    });
                    scheduler = match ticked.await {
                        Some(scheduler) => scheduler,
                        None => return,
                    };
                    next_tick = Instant::now() + scheduler.settings.interval;
                }
                command = commands.recv() => {
                    match command {
                        Some(command) if command.touches_device() => {
                            scheduler = match scheduler.offload(|s| s.apply(command)).await {
                                Some(scheduler) => scheduler,
                                None => return,
                            };
                        }
                        Some(command) => scheduler.apply(command),
                        None => break,
                    }
                }
            }
        }

        let _ = scheduler.offload(|s| s.display.close()).await;
        debug!("Display scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::tests::{FlakySink, SharedSink};
    use crate::display::{CLEAR_HOME, NO_DATA_TEXT, pad_line};
    use crate::spot::{Mode, RawSpot};

    fn scheduler_with(store: Arc<SpotStore>) -> (DisplayScheduler, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(100);
        let settings = SchedulerSettings {
            min_snr: 0,
            ..Default::default()
        };
        (
            DisplayScheduler::new(store, Arc::new(FeedStats::new()), tx, settings),
            rx,
        )
    }

    fn add(store: &SpotStore, call: &str, freq: f64, snr: i32) {
        store.upsert(RawSpot::new("TEST", call, freq, snr, 20, Mode::Cw));
    }

    #[test]
    fn test_clamp_interval() {
        assert_eq!(clamp_interval(Duration::ZERO), MIN_ROTATION_INTERVAL);
        assert_eq!(
            clamp_interval(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_tick_without_device_previews() {
        let store = Arc::new(SpotStore::new());
        let (mut scheduler, mut rx) = scheduler_with(Arc::clone(&store));

        let frame = scheduler.tick();
        assert_eq!(frame.lines[0], pad_line(NO_DATA_TEXT, DISPLAY_WIDTH));
        assert_eq!(rx.try_recv().unwrap(), Event::DisplayUpdated(frame));

        add(&store, "WO6W", 14033.0, 20);
        let frame = scheduler.tick();
        assert!(frame.lines[0].starts_with("14033.0 WO6W 20"));
        assert_eq!(scheduler.display().preview(), &frame);
    }

    #[test]
    fn test_tick_writes_to_device() {
        let store = Arc::new(SpotStore::new());
        add(&store, "WO6W", 14033.0, 20);
        let (mut scheduler, _rx) = scheduler_with(Arc::clone(&store));

        let sink = SharedSink::default();
        scheduler
            .display_mut()
            .attach("test", Box::new(sink.clone()))
            .unwrap();

        let frame = scheduler.tick();
        let written = sink.0.lock().unwrap().clone();
        assert_eq!(&written[..CLEAR_HOME.len()], CLEAR_HOME);
        assert!(written.ends_with(&frame.to_bytes()));
    }

    #[test]
    fn test_write_failure_reported_once() {
        let store = Arc::new(SpotStore::new());
        let (mut scheduler, mut rx) = scheduler_with(store);

        // The blank on attach succeeds, the first frame fails
        scheduler
            .display_mut()
            .attach("ttyUSB0", Box::new(FlakySink::new(1)))
            .unwrap();

        let first = scheduler.tick();
        let second = scheduler.tick();
        assert!(!scheduler.display().is_open());
        assert_eq!(scheduler.display().preview(), &second);
        assert!(first.lines[0].starts_with(NO_DATA_TEXT));

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let errors = events
            .iter()
            .filter(|e| matches!(e, Event::OutputError(_)))
            .count();
        let closed = events
            .iter()
            .filter(|e| matches!(e, Event::OutputStatus(OutputStatus::Closed)))
            .count();
        let frames = events
            .iter()
            .filter(|e| matches!(e, Event::DisplayUpdated(_)))
            .count();
        assert_eq!(errors, 1);
        assert_eq!(closed, 1);
        assert_eq!(frames, 2);
    }

    #[test]
    fn test_filter_commands() {
        let store = Arc::new(SpotStore::new());
        add(&store, "WEAK", 7018.0, 5);
        add(&store, "LOUD", 14033.0, 25);
        let (mut scheduler, _rx) = scheduler_with(Arc::clone(&store));

        scheduler.apply(DisplayCommand::SetMinSnr(20));
        let frame = scheduler.tick();
        assert!(frame.lines[0].contains("LOUD"));
        assert_eq!(frame.lines[1].trim(), "");

        scheduler.apply(DisplayCommand::SetMaxAge(Duration::from_secs(24 * 3600)));
        assert_eq!(scheduler.settings().max_age, store.retention());

        scheduler.apply(DisplayCommand::SetInterval(Duration::ZERO));
        assert_eq!(scheduler.settings().interval, MIN_ROTATION_INTERVAL);
    }

    #[test]
    fn test_open_missing_port_reports_error() {
        let store = Arc::new(SpotStore::new());
        let (mut scheduler, mut rx) = scheduler_with(store);

        scheduler.apply(DisplayCommand::Open("/dev/does-not-exist-vfd".to_string()));
        assert!(!scheduler.display().is_open());
        assert!(matches!(rx.try_recv(), Ok(Event::OutputError(_))));
    }

    #[test]
    fn test_rotation_through_store() {
        let store = Arc::new(SpotStore::new());
        for (i, call) in ["A1", "B2", "C3"].iter().enumerate() {
            add(&store, call, 7000.0 + 1000.0 * i as f64, 20);
        }
        let (mut scheduler, _rx) = scheduler_with(Arc::clone(&store));

        let first = scheduler.tick();
        let second = scheduler.tick();
        assert!(first.lines[0].contains("A1") && first.lines[1].contains("B2"));
        assert!(second.lines[0].contains("B2") && second.lines[1].contains("C3"));
    }

    /// Blocks every write for a while, like a stalled serial port.
    struct SlowSink(Duration);

    impl std::io::Write for SlowSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            std::thread::sleep(self.0);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_slow_device_does_not_block_runtime() {
        let store = Arc::new(SpotStore::new());
        let (mut scheduler, _rx) = scheduler_with(store);
        scheduler
            .display_mut()
            .attach("slow", Box::new(SlowSink(Duration::from_millis(400))))
            .unwrap();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(scheduler.run(cmd_rx));

        // Single-threaded runtime: this only finishes on time if the
        // device write runs elsewhere
        let start = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        assert!(start.elapsed() < Duration::from_millis(300));

        drop(cmd_tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_and_reconfigures() {
        let store = Arc::new(SpotStore::new());
        let (scheduler, mut rx) = scheduler_with(store);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(scheduler.run(cmd_rx));

        // First frame is immediate
        assert!(matches!(rx.recv().await, Some(Event::DisplayUpdated(_))));

        let start = Instant::now();
        assert!(matches!(rx.recv().await, Some(Event::DisplayUpdated(_))));
        assert_eq!(start.elapsed(), DEFAULT_ROTATION_INTERVAL);

        // The pending tick keeps its deadline; the new interval applies after it
        cmd_tx
            .send(DisplayCommand::SetInterval(Duration::from_secs(1)))
            .unwrap();
        let start = Instant::now();
        assert!(matches!(rx.recv().await, Some(Event::DisplayUpdated(_))));
        assert_eq!(start.elapsed(), DEFAULT_ROTATION_INTERVAL);

        let start = Instant::now();
        assert!(matches!(rx.recv().await, Some(Event::DisplayUpdated(_))));
        assert_eq!(start.elapsed(), Duration::from_secs(1));

        drop(cmd_tx);
        handle.await.unwrap();
    }
}
