use bypass_telemetry::data::{
    FilterQuery, ParsedRecord, RecordParser, SortColumn, SortDirection, SortState,
};
use bypass_telemetry::enrich::{Enrichment, Entity};
use bypass_telemetry::store::{PersistedState, StateStore};
use bypass_telemetry::stream::{Batcher, IngestEvent, Ingestor, Sinks};
use bypass_telemetry::RawLine;
use bypass_telemetry_tools::{
    format_record, init_logging, parse_sort_column, ConnOpts, StateOpts,
};
use clap::{Parser, Subcommand};
use crossbeam::channel;
use std::io::{self, BufRead};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "bt-tool",
    version,
    about = "Connection log streaming, parsing and enrichment tool"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream connection events, printing the matching records of every batch
    Dump {
        #[command(flatten)]
        conn: ConnOpts,
        #[command(flatten)]
        state: StateOpts,

        /// Filter expression (default: the saved filter)
        #[arg(short = 'f', long = "filter")]
        filter: Option<String>,

        /// Only targeted traffic
        #[arg(short = 't', long = "targeted")]
        targeted: bool,

        /// Sort each batch by this column (timestamp, set, protocol, domain, source, destination)
        #[arg(short = 's', long = "sort", value_parser = parse_sort_column)]
        sort: Option<SortColumn>,

        /// Sort descending
        #[arg(long = "desc", requires = "sort")]
        desc: bool,

        /// Exit after this many records
        #[arg(short = 'n', long = "limit")]
        limit: Option<usize>,
    },
    /// Parse connection lines from stdin
    Parse {
        #[command(flatten)]
        state: StateOpts,

        /// Only print records matching this filter
        #[arg(short = 'f', long = "filter")]
        filter: Option<String>,
    },
    /// Manage the organizations used to enrich destinations
    Entity {
        #[command(flatten)]
        state: StateOpts,

        #[command(subcommand)]
        action: EntityAction,
    },
    /// Print the organization owning a destination address
    Resolve {
        #[command(flatten)]
        state: StateOpts,

        /// Address, optionally with port (1.2.3.4:443, [2001:db8::1]:443)
        destination: String,
    },
}

#[derive(Subcommand, Debug)]
enum EntityAction {
    /// Add an organization, replacing one with the same id
    Add {
        id: String,
        name: String,
        /// CIDR prefixes (e.g., 104.16.0.0/13)
        #[arg(required = true)]
        prefixes: Vec<String>,
    },
    /// Remove an organization
    Remove { id: String },
    /// List organizations
    List,
}

fn load_strict(store: &StateStore) -> Result<PersistedState, ()> {
    store.load().map_err(|e| error!("{e}"))
}

fn dump(
    conn: &ConnOpts,
    state: &StateOpts,
    filter: Option<String>,
    targeted: bool,
    sort: SortState,
    limit: Option<usize>,
) -> Result<(), ()> {
    let config = conn.ingest_config().map_err(|e| error!("{e}"))?;
    let saved = state.store().load_or_default();
    let query = FilterQuery::parse(filter.as_deref().unwrap_or(&saved.filter));
    let mut resolver = saved.resolver();

    let ingestor = Ingestor::connect(config);
    let mut batcher = Batcher::default();
    let mut sinks = Sinks::default();
    let mut parser = RecordParser::default();
    let mut printed = 0usize;

    loop {
        let timer = batcher.timer().cloned().unwrap_or_else(channel::never);
        crossbeam::select! {
            recv(ingestor.events()) -> event => match event {
                Ok(IngestEvent::Line(line)) => {
                    batcher.enqueue(line);
                }
                Ok(IngestEvent::State(state)) => info!(?state, "connection"),
                Ok(IngestEvent::TransportError(_)) => {}
                Err(_) => {
                    warn!("socket thread exited");
                    return Err(());
                }
            },
            recv(timer) -> _ => {
                let report = batcher.flush(&mut sinks);
                let history = sinks.domains.history().get_all();
                let fresh = &history[history.len().saturating_sub(report.domains_written)..];
                let records: Vec<Arc<ParsedRecord>> = parser
                    .parse_all(fresh)
                    .into_iter()
                    .filter(|r| !targeted || r.is_targeted())
                    .collect();
                for record in sort.apply(query.apply(&records, &mut resolver)) {
                    let org = resolver.resolve(&record.destination);
                    println!("{}", format_record(&record, org.as_deref()));
                    printed += 1;
                    if limit.is_some_and(|n| printed >= n) {
                        // Dropping the ingestor stops the socket thread.
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn parse(state: &StateOpts, filter: Option<String>) -> Result<(), ()> {
    let saved = state.store().load_or_default();
    let mut resolver = saved.resolver();
    let query = FilterQuery::parse(filter.as_deref().unwrap_or(""));
    let mut parser = RecordParser::default();
    let mut malformed = 0usize;
    let mut shown = 0usize;

    for line in io::stdin().lock().lines() {
        let line = line.map_err(|e| error!("failed to read stdin: {e}"))?;
        let raw: RawLine = Arc::from(line.as_str());
        let Some(record) = parser.parse(&raw) else {
            malformed += 1;
            continue;
        };
        if query.matches(&record, &mut resolver) {
            let org = resolver.resolve(&record.destination);
            println!("{}", format_record(&record, org.as_deref()));
            shown += 1;
        }
    }

    let stats = parser.stats();
    eprintln!(
        "{shown} shown, {malformed} malformed, {} parsed, {} cache hits",
        stats.parses, stats.hits
    );
    Ok(())
}

fn entity(state: &StateOpts, action: EntityAction) -> Result<(), ()> {
    let store = state.store();
    let mut saved = load_strict(&store)?;
    match action {
        EntityAction::Add { id, name, prefixes } => {
            let entity = Entity { id, name, prefixes };
            for prefix in entity.invalid_prefixes() {
                warn!(prefix, "not a CIDR prefix, it will never match");
            }
            let id = entity.id.clone();
            if saved.upsert_entity(entity) {
                println!("replaced {id}");
            } else {
                println!("added {id}");
            }
        }
        EntityAction::Remove { id } => {
            if saved.remove_entity(&id).is_none() {
                error!("no entity with id {id}");
                return Err(());
            }
            println!("removed {id}");
        }
        EntityAction::List => {
            for e in &saved.entities {
                println!("{:<16} {:<24} {}", e.id, e.name, e.prefixes.join(" "));
            }
            return Ok(());
        }
    }
    store.save(&saved).map_err(|e| error!("{e}"))
}

fn resolve(state: &StateOpts, destination: &str) -> Result<(), ()> {
    let mut resolver = load_strict(&state.store())?.resolver();
    match resolver.resolve(destination) {
        Some(name) => println!("{name}"),
        None => println!("unknown"),
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Dump {
            conn,
            state,
            filter,
            targeted,
            sort,
            desc,
            limit,
        } => {
            let direction = if desc {
                SortDirection::Desc
            } else {
                SortDirection::Asc
            };
            let sort = sort
                .map(|column| SortState::new(column, direction))
                .unwrap_or_default();
            dump(&conn, &state, filter, targeted, sort, limit)
        }
        Commands::Parse { state, filter } => parse(&state, filter),
        Commands::Entity { state, action } => entity(&state, action),
        Commands::Resolve { state, destination } => resolve(&state, &destination),
    };

    if result.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
