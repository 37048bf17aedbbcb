use bypass_telemetry::data::{ParsedRecord, SortColumn};
use bypass_telemetry::store::{state_path, StateStore};
use bypass_telemetry::stream::{IngestConfig, UrlError, DEFAULT_ORIGIN};
use clap::Parser;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug, Clone)]
pub struct ConnOpts {
    /// Origin the control panel is served from (e.g., http://localhost:8080)
    #[arg(
        short = 'o',
        long = "origin",
        env = "BYPASS_TELEMETRY_ORIGIN",
        default_value = DEFAULT_ORIGIN,
        help = "Control panel origin"
    )]
    pub origin: String,

    /// Delay before reconnecting a closed log socket
    #[arg(long = "reconnect-ms", default_value_t = 3000, value_name = "MS")]
    pub reconnect_ms: u64,
}

impl ConnOpts {
    pub fn ingest_config(&self) -> Result<IngestConfig, UrlError> {
        let mut config = IngestConfig::for_origin(&self.origin)?;
        config.reconnect_delay = Duration::from_millis(self.reconnect_ms);
        Ok(config)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct StateOpts {
    /// State file holding filter, sort and entities (default: $BYPASS_TELEMETRY_STATE or ./telemetry-state.yaml)
    #[arg(long = "state", value_name = "PATH")]
    pub state: Option<PathBuf>,
}

impl StateOpts {
    pub fn store(&self) -> StateStore {
        StateStore::new(state_path(self.state.as_deref()))
    }
}

fn env_filter(verbose: u8) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    }
}

/// Logs to stderr.
pub fn init_logging(verbose: u8) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter(verbose))
        .init();
}

/// Logs to `path`, appending. For tools that own the terminal.
pub fn init_file_logging(verbose: u8, path: &Path) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .with(env_filter(verbose))
        .init();
    Ok(())
}

pub fn parse_sort_column(name: &str) -> Result<SortColumn, String> {
    SortColumn::from_name(name).ok_or_else(|| {
        let names: Vec<&str> = SortColumn::ALL.iter().map(|c| c.name()).collect();
        format!("unknown column `{name}`, expected one of: {}", names.join(", "))
    })
}

/// One record on one line, with the resolved organization if any.
pub fn format_record(record: &ParsedRecord, org: Option<&str>) -> String {
    let mut line = format!(
        "{:<19}  {:<3}  {:<16}  {:<32}  {:<21} -> {}",
        record.timestamp,
        record.protocol.as_str(),
        record.set(),
        record.domain,
        record.source,
        record.destination
    );
    if !record.source_alias.is_empty() {
        line.push_str(&format!("  ({})", record.source_alias));
    }
    if let Some(org) = org {
        line.push_str(&format!("  [{org}]"));
    }
    line
}
