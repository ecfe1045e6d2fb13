//! Telnet client for connecting to the Reverse Beacon Network.
//!
//! The client runs as a background task driven by [`FeedCommand`]s. A
//! connect request opens the socket, performs the login handshake, and
//! folds every spot into the [`SpotStore`]. The connection ends on a
//! disconnect request, a read error, a read timeout, or remote close. The
//! client never reconnects on its own.

use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::event::{Direction, Event, FeedStatus};
use crate::login::{Handshake, LineAction, LineBuffer};
use crate::stats::FeedStats;
use crate::store::SpotStore;

/// Default RBN telnet server for CW/RTTY spots.
pub const RBN_HOST: &str = "rbn.telegraphy.de";

/// Default port for CW/RTTY spots.
pub const RBN_PORT: u16 = 7000;

/// Shortest connect or read timeout the client will use.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for the feed client.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Hostname of the RBN server.
    pub host: String,

    /// Port number.
    pub port: u16,

    /// Connection timeout.
    pub connect_timeout: Duration,

    /// How long the socket may stay silent before the connection is dropped.
    pub read_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            host: RBN_HOST.to_string(),
            port: RBN_PORT,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(120),
        }
    }
}

impl FeedConfig {
    /// Set the host and port.
    pub fn with_server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }
}

/// Commands sent to the feed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedCommand {
    /// Connect and log in with this callsign.
    Connect(String),
    /// Close the current connection, if any.
    Disconnect,
}

/// How a connected session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Requested,
    RemoteClosed,
    /// The command channel closed; the task should exit.
    Shutdown,
}

/// Wait for the command that ends the current connection attempt or session.
///
/// Connect requests are ignored while a connection is in progress.
async fn next_session_end(commands: &mut mpsc::UnboundedReceiver<FeedCommand>) -> SessionEnd {
    loop {
        match commands.recv().await {
            Some(FeedCommand::Disconnect) => return SessionEnd::Requested,
            Some(FeedCommand::Connect(_)) => {
                warn!("Already connected; ignoring connect request");
            }
            None => return SessionEnd::Shutdown,
        }
    }
}

/// Async RBN telnet client.
pub struct FeedClient {
    config: FeedConfig,
    store: Arc<SpotStore>,
    stats: Arc<FeedStats>,
    events: mpsc::Sender<Event>,
}

impl FeedClient {
    /// Timeouts below [`MIN_TIMEOUT`] are raised to it.
    pub fn new(
        mut config: FeedConfig,
        store: Arc<SpotStore>,
        stats: Arc<FeedStats>,
        events: mpsc::Sender<Event>,
    ) -> Self {
        config.connect_timeout = config.connect_timeout.max(MIN_TIMEOUT);
        config.read_timeout = config.read_timeout.max(MIN_TIMEOUT);
        Self {
            config,
            store,
            stats,
            events,
        }
    }

    /// Serve commands until the command channel closes.
    pub async fn run(self, mut commands: mpsc::UnboundedReceiver<FeedCommand>) {
        loop {
            // Idle: wait for a connect request
            let callsign = loop {
                match commands.recv().await {
                    Some(FeedCommand::Connect(callsign)) => break callsign,
                    Some(FeedCommand::Disconnect) => continue,
                    None => return,
                }
            };

            self.set_status(FeedStatus::Connecting).await;

            // Dropping the connect future abandons the attempt
            let opened = tokio::select! {
                opened = self.open() => opened.map(Ok),
                end = next_session_end(&mut commands) => Ok(Err(end)),
            };

            let outcome = match opened {
                Ok(Ok(stream)) => self.stream(stream, &callsign, &mut commands).await,
                Ok(Err(end)) => Ok(end),
                Err(e) => Err(e),
            };

            let shutdown = match outcome {
                Ok(SessionEnd::Requested) => {
                    info!("Disconnected on request");
                    false
                }
                Ok(SessionEnd::RemoteClosed) => {
                    info!("Connection closed by server");
                    self.emit(Event::FeedError("Connection closed by server".to_string()))
                        .await;
                    false
                }
                Ok(SessionEnd::Shutdown) => true,
                Err(e) => {
                    error!("Connection error: {:#}", e);
                    self.stats.record_connection_failure();
                    self.emit(Event::FeedError(format!("{:#}", e))).await;
                    false
                }
            };

            self.set_status(FeedStatus::Closing).await;
            self.set_status(FeedStatus::Idle).await;

            if shutdown {
                return;
            }
        }
    }

    async fn open(&self) -> Result<TcpStream> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("Connecting to {}...", addr);

        let stream = timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .context("Connection timeout")?
            .with_context(|| format!("Failed to connect to {}", addr))?;

        info!("Connected to {}", addr);
        Ok(stream)
    }

    /// Run the handshake and line loop on an open stream.
    ///
    /// The stream halves are owned here, so the socket is closed on every
    /// return path.
    async fn stream(
        &self,
        stream: TcpStream,
        callsign: &str,
        commands: &mut mpsc::UnboundedReceiver<FeedCommand>,
    ) -> Result<SessionEnd> {
        self.set_status(FeedStatus::AwaitingPrompt).await;

        let (mut reader, mut writer) = stream.into_split();
        let mut handshake = Handshake::new(callsign);
        let mut lines = LineBuffer::new();
        let mut chunk = [0u8; 4096];

        loop {
            tokio::select! {
                end = next_session_end(commands) => return Ok(end),

                read = timeout(self.config.read_timeout, reader.read(&mut chunk)) => {
                    let n = match read {
                        Ok(Ok(0)) => return Ok(SessionEnd::RemoteClosed),
                        Ok(Ok(n)) => n,
                        Ok(Err(e)) => return Err(e).context("Read error"),
                        Err(_) => {
                            warn!("Read timeout, connection may be stale");
                            return Err(anyhow!("Read timeout"));
                        }
                    };
                    lines.extend(&chunk[..n]);

                    while let Some(line) = lines.next_line() {
                        let action = self.handle_line(&mut handshake, &line);
                        if let LineAction::SendLogin(login) = action {
                            self.send_login(&mut writer, &login).await?;
                        }
                    }

                    // The prompt usually arrives without a newline
                    if !lines.is_empty()
                        && let Some(login) = handshake.process_partial(&lines.pending())
                    {
                        self.raw(lines.pending(), Direction::Received);
                        lines.clear();
                        self.send_login(&mut writer, &login).await?;
                    }

                    let discarded = lines.discard_overflow();
                    if discarded > 0 {
                        warn!("Dropped {} bytes without a line break", discarded);
                        self.stats.record_rejection();
                    }
                }
            }
        }
    }

    /// Route one complete line through the handshake and into the store.
    fn handle_line(&self, handshake: &mut Handshake, line: &str) -> LineAction {
        self.stats.record_line(line.len());
        self.raw(line.to_string(), Direction::Received);

        let action = handshake.process_line(line, std::time::Instant::now());
        match &action {
            LineAction::Spot(spot) => {
                self.stats.record_spot(spot);
                let upsert = self.store.upsert(spot.clone());
                let _ = self.events.try_send(Event::SpotAdded {
                    key: upsert.key,
                    spot_count: upsert.spot_count,
                    records: self.store.len(),
                });
            }
            LineAction::Rejected => self.stats.record_rejection(),
            LineAction::Ignored => {
                self.stats.record_non_spot();
                debug!("Non-spot line: {}", line);
            }
            LineAction::SendLogin(_) => {}
        }
        action
    }

    async fn send_login(
        &self,
        writer: &mut tokio::net::tcp::OwnedWriteHalf,
        login: &str,
    ) -> Result<()> {
        info!("Sending callsign: {}", login.trim_end());
        writer
            .write_all(login.as_bytes())
            .await
            .context("Failed to send callsign")?;
        writer.flush().await?;

        self.raw(login.to_string(), Direction::Sent);
        self.stats.record_login();
        self.set_status(FeedStatus::LoggedIn).await;
        Ok(())
    }

    fn raw(&self, text: String, direction: Direction) {
        let _ = self.events.try_send(Event::RawData { text, direction });
    }

    async fn set_status(&self, status: FeedStatus) {
        debug!("Feed status: {}", status);
        self.emit(Event::FeedStatus(status)).await;
    }

    async fn emit(&self, event: Event) {
        // The receiver going away is not the feed's problem
        let _ = self.events.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    const SPOT_LINE: &str =
        "DX de K3LR-#:    14033.0  WO6W           CW    12 dB  24 WPM  CQ      2259Z\r\n";

    #[test]
    fn test_default_config() {
        let config = FeedConfig::default();
        assert_eq!(config.host, RBN_HOST);
        assert_eq!(config.port, RBN_PORT);
    }

    #[test]
    fn test_config_builder() {
        let config = FeedConfig::default().with_server("test.example.com", 1234);
        assert_eq!(config.host, "test.example.com");
        assert_eq!(config.port, 1234);
    }

    struct Harness {
        commands: mpsc::UnboundedSender<FeedCommand>,
        events: mpsc::Receiver<Event>,
        store: Arc<SpotStore>,
        stats: Arc<FeedStats>,
        task: tokio::task::JoinHandle<()>,
    }

    fn local_config(port: u16) -> FeedConfig {
        FeedConfig {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            ..FeedConfig::default().with_server("127.0.0.1", port)
        }
    }

    fn start_client(port: u16) -> Harness {
        start_client_with(local_config(port))
    }

    fn start_client_with(config: FeedConfig) -> Harness {
        let store = Arc::new(SpotStore::new());
        let stats = Arc::new(FeedStats::new());
        let (event_tx, events) = mpsc::channel(1000);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let client = FeedClient::new(config, Arc::clone(&store), Arc::clone(&stats), event_tx);
        let task = tokio::spawn(client.run(command_rx));
        Harness {
            commands,
            events,
            store,
            stats,
            task,
        }
    }

    fn failures(stats: &FeedStats) -> u64 {
        stats
            .connection_failures
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    async fn wait_for_status(
        events: &mut mpsc::Receiver<Event>,
        wanted: FeedStatus,
    ) -> Vec<Event> {
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let done = event == Event::FeedStatus(wanted);
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_login_and_spot_flow() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut reader = BufReader::new(read_half);

            write_half.write_all(b"noise\r\n").await.unwrap();
            // Prompt without a newline, like the real server
            write_half
                .write_all(b"Please enter your call: ")
                .await
                .unwrap();

            let mut login = String::new();
            reader.read_line(&mut login).await.unwrap();

            write_half.write_all(SPOT_LINE.as_bytes()).await.unwrap();
            write_half
                .write_all(b"DX de K3LR-#: 14033.0 WO6W CW 12 24 WPM CQ 2259Z\r\n")
                .await
                .unwrap();
            login
        });

        let mut h = start_client(port);
        h.commands
            .send(FeedCommand::Connect("W6JSV".to_string()))
            .unwrap();

        let login = server.await.unwrap();
        assert_eq!(login, "W6JSV\r\n");

        // Server dropped its socket after the spots; the client goes idle
        let events = wait_for_status(&mut h.events, FeedStatus::Idle).await;
        let statuses: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::FeedStatus(s) => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                FeedStatus::Connecting,
                FeedStatus::AwaitingPrompt,
                FeedStatus::LoggedIn,
                FeedStatus::Closing,
                FeedStatus::Idle,
            ]
        );

        let sent: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, Event::RawData { direction: Direction::Sent, .. }))
            .collect();
        assert_eq!(sent.len(), 1);

        // A server hangup is reported but is not a connection failure
        let closed_at = events
            .iter()
            .position(|e| *e == Event::FeedError("Connection closed by server".to_string()))
            .expect("remote close reported");
        assert_eq!(events[closed_at + 1], Event::FeedStatus(FeedStatus::Closing));
        assert_eq!(failures(&h.stats), 0);

        assert_eq!(h.store.len(), 1);
        let record = h.store.get("WO6W|14033").unwrap();
        assert_eq!(record.spot_count, 1);
        assert_eq!(record.highest_snr, 12);

        drop(h.commands);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_request_closes_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"Welcome\r\n").await.unwrap();
            // Blocks until the client closes its end
            let mut buf = Vec::new();
            socket.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let mut h = start_client(port);
        h.commands
            .send(FeedCommand::Connect("W6JSV".to_string()))
            .unwrap();
        wait_for_status(&mut h.events, FeedStatus::AwaitingPrompt).await;

        h.commands.send(FeedCommand::Disconnect).unwrap();
        wait_for_status(&mut h.events, FeedStatus::Idle).await;

        // Never logged in, so nothing was sent
        let received = server.await.unwrap();
        assert!(received.is_empty());

        drop(h.commands);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_idle() {
        // Bind then drop to get a port with nothing listening
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut h = start_client(port);
        h.commands
            .send(FeedCommand::Connect("W6JSV".to_string()))
            .unwrap();

        let events = wait_for_status(&mut h.events, FeedStatus::Idle).await;
        assert!(events.iter().any(|e| matches!(e, Event::FeedError(_))));
        assert!(!events.contains(&Event::FeedStatus(FeedStatus::AwaitingPrompt)));

        drop(h.commands);
        h.task.await.unwrap();
    }

    /// A listener whose accept queue is full, so new connects stall.
    async fn stalled_listener() -> (tokio::net::TcpListener, Vec<TcpStream>, u16) {
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(0).unwrap();
        let addr = listener.local_addr().unwrap();

        // Never accepted; the first connect that stalls means the queue is full
        let mut held = Vec::new();
        for _ in 0..16 {
            match timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => held.push(stream),
                _ => break,
            }
        }
        (listener, held, addr.port())
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting() {
        let (_listener, _held, port) = stalled_listener().await;

        let mut h = start_client(port);
        h.commands
            .send(FeedCommand::Connect("W6JSV".to_string()))
            .unwrap();
        wait_for_status(&mut h.events, FeedStatus::Connecting).await;

        h.commands.send(FeedCommand::Disconnect).unwrap();
        let events = timeout(
            Duration::from_secs(2),
            wait_for_status(&mut h.events, FeedStatus::Idle),
        )
        .await
        .expect("idle well before the connect timeout");
        assert!(!events.iter().any(|e| matches!(e, Event::FeedError(_))));
        assert_eq!(failures(&h.stats), 0);

        drop(h.commands);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_while_connecting() {
        let (_listener, _held, port) = stalled_listener().await;

        let mut h = start_client(port);
        h.commands
            .send(FeedCommand::Connect("W6JSV".to_string()))
            .unwrap();
        wait_for_status(&mut h.events, FeedStatus::Connecting).await;

        drop(h.commands);
        timeout(Duration::from_secs(2), h.task)
            .await
            .expect("task exits well before the connect timeout")
            .unwrap();
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Accept and hold the socket without sending anything
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let mut h = start_client_with(FeedConfig {
            read_timeout: Duration::ZERO,
            ..local_config(port)
        });
        h.commands
            .send(FeedCommand::Connect("W6JSV".to_string()))
            .unwrap();
        wait_for_status(&mut h.events, FeedStatus::AwaitingPrompt).await;

        // Zero is raised to the floor, so the socket gets a full second
        let start = std::time::Instant::now();
        let events = wait_for_status(&mut h.events, FeedStatus::Idle).await;
        assert!(start.elapsed() >= Duration::from_millis(900));
        assert_eq!(
            events,
            vec![
                Event::FeedError("Read timeout".to_string()),
                Event::FeedStatus(FeedStatus::Closing),
                Event::FeedStatus(FeedStatus::Idle),
            ]
        );
        assert_eq!(failures(&h.stats), 1);

        server.abort();
        drop(h.commands);
        h.task.await.unwrap();
    }
}
