//! Ingest
//!
//! Owns the connection to the backend's log socket. The socket runs in a
//! dedicated thread; text frames come back to the owner as
//! `IngestEvent::Line`s over a bounded channel, together with connection
//! state changes and transport errors.
//!
//! A connection that fails or closes is retried after a fixed delay, for as
//! long as the `Ingestor` is alive. Dropping it (or calling `teardown()`)
//! stops the thread, including a pending reconnect or an unfinished
//! handshake, and no further events are delivered.

use super::url::socket_url;
use super::url::UrlError;
use crate::data::RawLine;

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use std::env;
use std::io;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use tungstenite::handshake::HandshakeError;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};
use url::Url;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(250);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_EVENT_QUEUE_SIZE: usize = 4096;

/// Event queue size, overridable (upwards only) with
/// `BYPASS_TELEMETRY_EVENT_QUEUE`.
pub fn event_queue_size() -> usize {
    let min_size = DEFAULT_EVENT_QUEUE_SIZE;
    if let Ok(req) = env::var("BYPASS_TELEMETRY_EVENT_QUEUE") {
        std::cmp::max(req.parse().unwrap_or(0), min_size)
    } else {
        min_size
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("connection closed by peer")]
    Closed,
    #[error("connection attempt cancelled")]
    Cancelled,
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectScheduled,
}

/// What to do after a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ScheduleReconnect,
    Stop,
}

/// Connection lifecycle, without any I/O.
#[derive(Debug)]
pub struct Connection {
    state: ConnectionState,
    cleaning_up: bool,
}

impl Connection {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            cleaning_up: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_cleaning_up(&self) -> bool {
        self.cleaning_up
    }

    /// Starts a connection attempt. Refused once torn down.
    pub fn connect(&mut self) -> bool {
        if self.cleaning_up {
            return false;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    pub fn opened(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Connected;
        }
    }

    /// The connection attempt failed.
    pub fn failed(&mut self) -> Action {
        self.closed()
    }

    /// The open connection closed.
    pub fn closed(&mut self) -> Action {
        if self.cleaning_up {
            self.state = ConnectionState::Disconnected;
            Action::Stop
        } else {
            self.state = ConnectionState::ReconnectScheduled;
            Action::ScheduleReconnect
        }
    }

    pub fn teardown(&mut self) {
        self.cleaning_up = true;
        self.state = ConnectionState::Disconnected;
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub enum IngestEvent {
    State(ConnectionState),
    Line(RawLine),
    TransportError(String),
}

/// Opens connections to the log socket.
pub trait Transport: Send + 'static {
    type Conn: TransportConnection;
    /// Must return in bounded time. Attempts that wait on the peer poll
    /// `cancelled` and give up with `IngestError::Cancelled` once it is true.
    fn connect(
        &mut self,
        url: &Url,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<Self::Conn, IngestError>;
}

pub trait TransportConnection {
    /// Next text message. `Ok(None)` if nothing usable arrived within the
    /// poll interval; `Err(IngestError::Closed)` once the peer has closed.
    fn recv(&mut self) -> Result<Option<String>, IngestError>;
    fn close(&mut self);
}

pub struct WebSocketTransport {
    read_timeout: Duration,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            read_timeout,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    fn open_stream(&self, url: &Url) -> Result<TcpStream, IngestError> {
        let mut last_error = None;
        for addr in url.socket_addrs(|| None)? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        let error = last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "log socket has no address")
        });
        Err(error.into())
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(DEFAULT_READ_TIMEOUT)
    }
}

impl Transport for WebSocketTransport {
    type Conn = WebSocketConnection;

    fn connect(
        &mut self,
        url: &Url,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<WebSocketConnection, IngestError> {
        let stream = self.open_stream(url)?;
        // Reads must time out so the socket thread notices teardown, during
        // the handshake as well as afterwards.
        stream.set_read_timeout(Some(self.read_timeout))?;
        stream.set_write_timeout(Some(self.handshake_timeout))?;

        let deadline = Instant::now() + self.handshake_timeout;
        let mut attempt = tungstenite::client_tls(url.as_str(), stream);
        loop {
            match attempt {
                Ok((socket, _response)) => return Ok(WebSocketConnection { socket }),
                Err(HandshakeError::Failure(e)) => return Err(e.into()),
                Err(HandshakeError::Interrupted(mid)) => {
                    if cancelled() {
                        return Err(IngestError::Cancelled);
                    }
                    if Instant::now() >= deadline {
                        let kind = io::ErrorKind::TimedOut;
                        return Err(io::Error::new(kind, "websocket handshake timed out").into());
                    }
                    attempt = mid.handshake();
                }
            }
        }
    }
}

pub struct WebSocketConnection {
    socket: WebSocket<MaybeTlsStream<TcpStream>>,
}

impl TransportConnection for WebSocketConnection {
    fn recv(&mut self) -> Result<Option<String>, IngestError> {
        match self.socket.read() {
            Ok(Message::Text(text)) => Ok(Some(text)),
            Ok(Message::Binary(data)) => Ok(String::from_utf8(data).ok()),
            Ok(Message::Close(_)) => Err(IngestError::Closed),
            Ok(_) => Ok(None),
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                Ok(None)
            }
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Err(IngestError::Closed)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) {
        let _ = self.socket.close(None);
        let _ = self.socket.flush();
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub url: Url,
    pub reconnect_delay: Duration,
    pub event_queue_size: usize,
}

impl IngestConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            event_queue_size: event_queue_size(),
        }
    }

    /// Config for the log socket of the panel served at `origin`.
    pub fn for_origin(origin: &str) -> Result<Self, UrlError> {
        Ok(Self::new(socket_url(origin)?))
    }
}

/// Handle to the socket thread.
pub struct Ingestor {
    events: Receiver<IngestEvent>,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Ingestor {
    /// Connects over a real websocket.
    pub fn connect(config: IngestConfig) -> Ingestor {
        Self::spawn(config, WebSocketTransport::default())
    }

    pub fn spawn<T: Transport>(config: IngestConfig, transport: T) -> Ingestor {
        let (event_sender, event_receiver) = channel::bounded(config.event_queue_size.max(1));
        let (shutdown_sender, shutdown_receiver) = channel::bounded(1);
        let thread = thread::spawn(move || {
            SocketThread {
                config,
                transport,
                connection: Connection::new(),
                events: event_sender,
                shutdown: shutdown_receiver,
            }
            .run()
        });
        Ingestor {
            events: event_receiver,
            shutdown: Some(shutdown_sender),
            thread: Some(thread),
        }
    }

    /// To use in `crossbeam::channel::select!`.
    pub fn events(&self) -> &Receiver<IngestEvent> {
        &self.events
    }

    /// Stops the socket thread and waits for it to exit.
    pub fn teardown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // Dropping the sender wakes the thread from any wait.
        self.shutdown.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("socket thread panicked");
            }
        }
    }
}

impl Drop for Ingestor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SocketThread<T: Transport> {
    config: IngestConfig,
    transport: T,
    connection: Connection,
    events: Sender<IngestEvent>,
    shutdown: Receiver<()>,
}

impl<T: Transport> SocketThread<T> {
    fn run(mut self) {
        while self.connection.connect() {
            self.publish_state();
            info!(url = %self.config.url, "connecting to log socket");
            let shutdown = &self.shutdown;
            let cancelled = || !matches!(shutdown.try_recv(), Err(TryRecvError::Empty));
            let attempt = self.transport.connect(&self.config.url, &cancelled);
            let action = match attempt {
                Ok(mut conn) => {
                    self.connection.opened();
                    self.publish_state();
                    info!("log socket connected");
                    self.pump(&mut conn);
                    conn.close();
                    self.shutdown_requested();
                    self.connection.closed()
                }
                Err(e) => {
                    if !self.shutdown_requested() {
                        self.report(&e);
                    }
                    self.connection.failed()
                }
            };

            match action {
                Action::Stop => break,
                Action::ScheduleReconnect => {
                    self.publish_state();
                    info!(
                        delay_ms = self.config.reconnect_delay.as_millis() as u64,
                        "reconnect scheduled"
                    );
                    self.wait_reconnect();
                }
            }
        }
        debug!("socket thread exiting");
    }

    fn pump(&mut self, conn: &mut T::Conn) {
        while !self.shutdown_requested() {
            match conn.recv() {
                Ok(Some(text)) => {
                    if !self.emit(IngestEvent::Line(Arc::from(text))) {
                        return;
                    }
                }
                Ok(None) => {}
                Err(IngestError::Closed) => {
                    info!("log socket closed");
                    return;
                }
                Err(e) => {
                    self.report(&e);
                    return;
                }
            }
        }
    }

    fn wait_reconnect(&mut self) {
        channel::select! {
            recv(self.shutdown) -> _ => self.connection.teardown(),
            recv(channel::after(self.config.reconnect_delay)) -> _ => {}
        }
    }

    fn shutdown_requested(&mut self) -> bool {
        if !self.connection.is_cleaning_up() {
            match self.shutdown.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => self.connection.teardown(),
                Err(TryRecvError::Empty) => {}
            }
        }
        self.connection.is_cleaning_up()
    }

    fn report(&mut self, error: &IngestError) {
        warn!(error = %error, "log socket error");
        self.emit(IngestEvent::TransportError(error.to_string()));
    }

    fn publish_state(&mut self) {
        self.emit(IngestEvent::State(self.connection.state()));
    }

    /// Delivers `event` unless teardown comes first. Nothing is delivered
    /// after teardown.
    fn emit(&mut self, event: IngestEvent) -> bool {
        if self.connection.is_cleaning_up() {
            return false;
        }
        let delivered = channel::select! {
            send(self.events, event) -> res => res.is_ok(),
            recv(self.shutdown) -> _ => false,
        };
        if !delivered {
            self.connection.teardown();
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    enum Step {
        Text(&'static str),
        Idle,
    }

    /// Each connect consumes one session: `None` fails the attempt, `Some`
    /// plays the steps and then closes. An exhausted script fails forever.
    #[derive(Clone, Default)]
    struct Scripted {
        sessions: Arc<Mutex<VecDeque<Option<Vec<Step>>>>>,
        attempts: Arc<AtomicUsize>,
    }

    impl Scripted {
        fn new(sessions: Vec<Option<Vec<Step>>>) -> Self {
            Self {
                sessions: Arc::new(Mutex::new(sessions.into())),
                attempts: Arc::default(),
            }
        }
    }

    struct ScriptedConn(VecDeque<Step>);

    impl Transport for Scripted {
        type Conn = ScriptedConn;

        fn connect(
            &mut self,
            _url: &Url,
            _cancelled: &dyn Fn() -> bool,
        ) -> Result<ScriptedConn, IngestError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.sessions.lock().unwrap().pop_front() {
                Some(Some(steps)) => Ok(ScriptedConn(steps.into())),
                _ => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into()),
            }
        }
    }

    impl TransportConnection for ScriptedConn {
        fn recv(&mut self) -> Result<Option<String>, IngestError> {
            match self.0.pop_front() {
                Some(Step::Text(t)) => Ok(Some(t.to_string())),
                Some(Step::Idle) => Ok(None),
                None => Err(IngestError::Closed),
            }
        }

        fn close(&mut self) {}
    }

    /// A peer that never finishes the handshake: connect waits until
    /// cancelled, or fails after a long timeout.
    struct Stalled {
        timeout: Duration,
    }

    impl Transport for Stalled {
        type Conn = ScriptedConn;

        fn connect(
            &mut self,
            _url: &Url,
            cancelled: &dyn Fn() -> bool,
        ) -> Result<ScriptedConn, IngestError> {
            let deadline = Instant::now() + self.timeout;
            while Instant::now() < deadline {
                if cancelled() {
                    return Err(IngestError::Cancelled);
                }
                thread::sleep(Duration::from_millis(10));
            }
            Err(io::Error::new(io::ErrorKind::TimedOut, "handshake timed out").into())
        }
    }

    /// Runs `teardown()` on a side thread; `true` if it returned in time.
    fn teardown_within(ingestor: Ingestor, limit: Duration) -> bool {
        let (done, finished) = channel::bounded(1);
        thread::spawn(move || {
            ingestor.teardown();
            let _ = done.send(());
        });
        finished.recv_timeout(limit).is_ok()
    }

    fn config(delay: Duration) -> IngestConfig {
        let mut config = IngestConfig::for_origin("http://localhost:1").unwrap();
        config.reconnect_delay = delay;
        config
    }

    fn next(ingestor: &Ingestor) -> IngestEvent {
        ingestor
            .events()
            .recv_timeout(Duration::from_secs(5))
            .expect("no event")
    }

    #[test]
    fn lifecycle_transitions() {
        let mut c = Connection::new();
        assert_eq!(c.state(), ConnectionState::Disconnected);
        assert!(c.connect());
        assert_eq!(c.state(), ConnectionState::Connecting);
        c.opened();
        assert_eq!(c.state(), ConnectionState::Connected);
        assert_eq!(c.closed(), Action::ScheduleReconnect);
        assert_eq!(c.state(), ConnectionState::ReconnectScheduled);
        assert!(c.connect());
        assert_eq!(c.failed(), Action::ScheduleReconnect);
        c.teardown();
        assert!(!c.connect());
        assert_eq!(c.closed(), Action::Stop);
        assert_eq!(c.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn reconnects_after_failure_and_close() {
        let transport = Scripted::new(vec![
            None,
            Some(vec![Step::Text("a"), Step::Idle, Step::Text("b")]),
        ]);
        let attempts = transport.attempts.clone();
        let ingestor = Ingestor::spawn(config(Duration::from_millis(10)), transport);

        assert!(matches!(next(&ingestor), IngestEvent::State(ConnectionState::Connecting)));
        assert!(matches!(next(&ingestor), IngestEvent::TransportError(_)));
        assert!(matches!(
            next(&ingestor),
            IngestEvent::State(ConnectionState::ReconnectScheduled)
        ));
        assert!(matches!(next(&ingestor), IngestEvent::State(ConnectionState::Connecting)));
        assert!(matches!(next(&ingestor), IngestEvent::State(ConnectionState::Connected)));
        assert!(matches!(next(&ingestor), IngestEvent::Line(l) if &*l == "a"));
        assert!(matches!(next(&ingestor), IngestEvent::Line(l) if &*l == "b"));
        assert!(matches!(
            next(&ingestor),
            IngestEvent::State(ConnectionState::ReconnectScheduled)
        ));

        ingestor.teardown();
        assert!(attempts.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn teardown_cancels_pending_reconnect() {
        let transport = Scripted::new(vec![]);
        let attempts = transport.attempts.clone();
        let ingestor = Ingestor::spawn(config(Duration::from_secs(600)), transport);
        loop {
            if let IngestEvent::State(ConnectionState::ReconnectScheduled) = next(&ingestor) {
                break;
            }
        }
        let events = ingestor.events().clone();

        let started = Instant::now();
        ingestor.teardown();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn teardown_interrupts_stalled_connect() {
        let transport = Stalled {
            timeout: Duration::from_secs(600),
        };
        let ingestor = Ingestor::spawn(config(Duration::from_millis(10)), transport);
        assert!(matches!(next(&ingestor), IngestEvent::State(ConnectionState::Connecting)));
        let events = ingestor.events().clone();

        assert!(teardown_within(ingestor, Duration::from_secs(5)));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn stalled_connect_times_out_into_reconnect() {
        let transport = Stalled {
            timeout: Duration::from_millis(50),
        };
        let ingestor = Ingestor::spawn(config(Duration::from_secs(600)), transport);
        assert!(matches!(next(&ingestor), IngestEvent::State(ConnectionState::Connecting)));
        assert!(matches!(next(&ingestor), IngestEvent::TransportError(_)));
        assert!(matches!(
            next(&ingestor),
            IngestEvent::State(ConnectionState::ReconnectScheduled)
        ));
        assert!(teardown_within(ingestor, Duration::from_secs(5)));
    }

    fn silent_listener() -> (std::net::TcpListener, IngestConfig) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = IngestConfig::for_origin(&format!("http://127.0.0.1:{port}")).unwrap();
        config.reconnect_delay = Duration::from_secs(600);
        (listener, config)
    }

    #[test]
    fn silent_server_handshake_fails_into_reconnect() {
        let (_listener, config) = silent_listener();
        let transport = WebSocketTransport::default().handshake_timeout(Duration::from_millis(300));
        let ingestor = Ingestor::spawn(config, transport);
        assert!(matches!(next(&ingestor), IngestEvent::State(ConnectionState::Connecting)));
        assert!(matches!(next(&ingestor), IngestEvent::TransportError(_)));
        assert!(matches!(
            next(&ingestor),
            IngestEvent::State(ConnectionState::ReconnectScheduled)
        ));
        assert!(teardown_within(ingestor, Duration::from_secs(5)));
    }

    #[test]
    fn teardown_during_silent_handshake_returns() {
        let (_listener, config) = silent_listener();
        let ingestor = Ingestor::connect(config);
        assert!(matches!(next(&ingestor), IngestEvent::State(ConnectionState::Connecting)));
        thread::sleep(Duration::from_millis(100));

        assert!(teardown_within(ingestor, Duration::from_secs(2)));
    }
}
