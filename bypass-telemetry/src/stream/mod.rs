//! Stream
//! Everything between the backend's log socket and the history sinks.

mod batcher;
mod ingest;
mod url;

pub use self::batcher::{Batcher, FlushReport, SinkId, Sinks, DEFAULT_FLUSH_INTERVAL};
pub use self::ingest::{
    event_queue_size, Action, Connection, ConnectionState, IngestConfig, IngestError, IngestEvent,
    Ingestor, Transport, TransportConnection, WebSocketTransport, DEFAULT_EVENT_QUEUE_SIZE,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_READ_TIMEOUT, DEFAULT_RECONNECT_DELAY,
};
pub use self::url::{socket_url, UrlError, DEFAULT_ORIGIN, LOG_SOCKET_PATH};
