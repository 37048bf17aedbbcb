// bt-logview
//
// Live connection log of the bypass engine, in two tabs: every log line,
// and connection events only. Filter, sort, targeted-only and pause apply
// as the lines stream in.
//
// Quit:  q / Esc / Ctrl-C

use bypass_telemetry::data::{ParsedRecord, RecordParser, Scope, SortColumn, SortDirection};
use bypass_telemetry::enrich::{Enrichment, Resolver};
use bypass_telemetry::store::PersistedState;
use bypass_telemetry::stream::{Batcher, ConnectionState, IngestEvent, Ingestor, SinkId, Sinks};
use bypass_telemetry::view::ScrollAnchor;
use bypass_telemetry::LogView;
use bypass_telemetry_tools::{format_record, init_file_logging, ConnOpts, StateOpts};
use chrono::{DateTime, Local};
use clap::Parser;
use crossbeam::channel;
use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::style::{Attribute, Color, ResetColor, SetAttribute, SetForegroundColor};
use crossterm::{cursor, event, style, terminal, ExecutableCommand, QueueableCommand};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const HEADER_LINES: u16 = 4;
const FOOTER_LINES: u16 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "bt-logview",
    version,
    about = "Live connection log viewer for the bypass engine"
)]
struct Cli {
    #[command(flatten)]
    conn: ConnOpts,

    #[command(flatten)]
    state: StateOpts,

    /// Write logs to this file; nothing is logged without it
    #[arg(long = "log-file", value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// UI refresh rate
    #[arg(long = "fps", default_value_t = 10)]
    fps: u64,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

struct Tab {
    sink: SinkId,
    view: LogView,
}

impl Tab {
    fn new(sink: SinkId, saved: &PersistedState) -> Self {
        let mut view = LogView::new(RecordParser::default(), ScrollAnchor::new(0.0, 1.0, 1.0));
        view.set_filter(&saved.filter);
        view.set_sort(saved.sort);
        Self { sink, view }
    }
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

struct App {
    url: String,
    sinks: Sinks,
    batcher: Batcher,
    tabs: [Tab; 2],
    current: usize,
    resolver: Resolver,
    connection: ConnectionState,
    last_error: Option<String>,
    last_flush: Option<DateTime<Local>>,
    editing: Option<String>,
    selected: Option<String>,
    page: f64,
}

impl App {
    fn new(url: String, saved: &PersistedState) -> Self {
        Self {
            url,
            sinks: Sinks::default(),
            batcher: Batcher::default(),
            tabs: [Tab::new(SinkId::Logs, saved), Tab::new(SinkId::Domains, saved)],
            current: 1,
            resolver: saved.resolver(),
            connection: ConnectionState::Disconnected,
            last_error: None,
            last_flush: None,
            editing: None,
            selected: None,
            page: 1.0,
        }
    }

    fn tab(&self) -> &Tab {
        &self.tabs[self.current]
    }

    fn anchor_mut(&mut self) -> &mut ScrollAnchor {
        self.tabs[self.current].view.anchor_mut()
    }

    fn on_ingest(&mut self, event: IngestEvent) {
        match event {
            IngestEvent::Line(line) => {
                self.batcher.enqueue(line);
            }
            IngestEvent::State(state) => {
                if state == ConnectionState::Connected {
                    self.last_error = None;
                }
                self.connection = state;
            }
            IngestEvent::TransportError(e) => self.last_error = Some(e),
        }
    }

    fn flush(&mut self) {
        let report = self.batcher.flush(&mut self.sinks);
        if report.lines > 0 {
            self.last_flush = Some(Local::now());
        }
    }

    fn resize(&mut self, rows: u16) {
        self.page = f64::from(rows.saturating_sub(HEADER_LINES + FOOTER_LINES).max(1));
        for tab in self.tabs.iter_mut() {
            tab.view.anchor_mut().set_viewport_height(self.page);
        }
    }

    fn refresh(&mut self) {
        for tab in self.tabs.iter_mut() {
            tab.view
                .refresh(self.sinks.get(tab.sink).history(), &mut self.resolver);
        }
    }

    // Filter, sort and scope are shared by both tabs.
    fn set_filter(&mut self, text: &str) {
        for tab in self.tabs.iter_mut() {
            tab.view.set_filter(text);
        }
    }

    fn click_sort(&mut self, column: SortColumn) {
        for tab in self.tabs.iter_mut() {
            tab.view.click_sort(column);
        }
    }

    fn toggle_scope(&mut self) {
        let scope = self.tab().view.scope().toggled();
        for tab in self.tabs.iter_mut() {
            tab.view.set_scope(scope);
        }
    }

    /// Index of the bottom row on screen.
    fn highlighted_index(&self) -> Option<usize> {
        let view = &self.tab().view;
        let first = view.anchor().offset().floor() as usize;
        (first + self.page as usize)
            .min(view.rows().len())
            .checked_sub(1)
    }

    fn highlighted(&self) -> Option<&Arc<ParsedRecord>> {
        self.tab().view.rows().get(self.highlighted_index()?)
    }

    fn on_key(&mut self, key: KeyEvent) -> Flow {
        if self.editing.is_some() {
            match key.code {
                KeyCode::Enter => {
                    if let Some(text) = self.editing.take() {
                        self.set_filter(&text);
                    }
                }
                KeyCode::Esc => self.editing = None,
                KeyCode::Backspace => {
                    if let Some(text) = self.editing.as_mut() {
                        text.pop();
                    }
                }
                KeyCode::Char(c) => {
                    if let Some(text) = self.editing.as_mut() {
                        text.push(c);
                    }
                }
                _ => {}
            }
            return Flow::Continue;
        }

        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            return Flow::Quit;
        }
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return Flow::Quit,
            KeyCode::Tab => self.current = (self.current + 1) % self.tabs.len(),
            KeyCode::Char('/') => {
                self.editing = Some(self.tab().view.filter_text().to_string());
            }
            KeyCode::Char(c @ '1'..='6') => {
                self.click_sort(SortColumn::ALL[c as usize - '1' as usize]);
            }
            KeyCode::Char('t') => self.toggle_scope(),
            KeyCode::Char('p') => {
                let sink = self.tab().sink;
                let paused = self.sinks.get_mut(sink).toggle_paused();
                info!(sink = sink.name(), paused, "pause toggled");
            }
            KeyCode::Char('c') => {
                let sink = self.tab().sink;
                self.sinks.get_mut(sink).clear();
                info!(sink = sink.name(), "history cleared");
            }
            KeyCode::Up => self.anchor_mut().scroll_by(-1.0),
            KeyCode::Down => self.anchor_mut().scroll_by(1.0),
            KeyCode::PageUp => {
                let page = self.page;
                self.anchor_mut().scroll_by(-page);
            }
            KeyCode::PageDown => {
                let page = self.page;
                self.anchor_mut().scroll_by(page);
            }
            KeyCode::Home => self.anchor_mut().scroll_to_top(),
            KeyCode::End => self.anchor_mut().scroll_to_bottom(),
            KeyCode::Enter => {
                self.selected = self
                    .highlighted()
                    .map(|record| record.selection_value().to_string());
            }
            _ => {}
        }
        Flow::Continue
    }
}

fn connection_label(state: ConnectionState) -> (&'static str, Color) {
    match state {
        ConnectionState::Connected => ("connected", Color::Green),
        ConnectionState::Connecting => ("connecting", Color::Yellow),
        ConnectionState::ReconnectScheduled => ("reconnecting", Color::Yellow),
        ConnectionState::Disconnected => ("disconnected", Color::Red),
    }
}

fn fit(text: &str, width: usize) -> String {
    text.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .take(width)
        .collect()
}

struct Tui {
    stdout: io::Stdout,
}

impl Tui {
    fn setup() -> io::Result<Self> {
        let mut stdout = io::stdout();
        terminal::enable_raw_mode()?;
        stdout.execute(terminal::EnterAlternateScreen)?;
        stdout.execute(cursor::Hide)?;
        Ok(Self { stdout })
    }

    fn teardown(&mut self) {
        let _ = self.stdout.execute(cursor::Show);
        let _ = self.stdout.execute(terminal::LeaveAlternateScreen);
        let _ = terminal::disable_raw_mode();
        let _ = self.stdout.flush();
    }

    fn draw(&mut self, app: &mut App) -> io::Result<()> {
        let (width, height) = terminal::size()?;
        let width = width as usize;
        self.stdout.queue(cursor::MoveTo(0, 0))?;
        self.stdout
            .queue(terminal::Clear(terminal::ClearType::All))?;

        // Header
        let (label, color) = connection_label(app.connection);
        self.stdout.queue(SetAttribute(Attribute::Bold))?;
        self.stdout.queue(style::Print(fit(&format!("bt-logview  {}", app.url), width)))?;
        self.stdout.queue(SetAttribute(Attribute::Reset))?;
        self.stdout.queue(SetForegroundColor(color))?;
        self.stdout.queue(style::Print(format!("  [{label}]")))?;
        self.stdout.queue(ResetColor)?;
        self.stdout.queue(cursor::MoveToNextLine(1))?;

        // Tabs and view settings
        let highlighted = app.highlighted_index();
        let tab = &app.tabs[app.current];
        for (i, t) in app.tabs.iter().enumerate() {
            let sink = app.sinks.get(t.sink);
            let mut label = format!(" {} ({}) ", t.sink.name(), sink.history().len());
            if sink.is_paused() {
                label.push_str("[paused] ");
            }
            if i == app.current {
                self.stdout.queue(SetAttribute(Attribute::Reverse))?;
            }
            self.stdout.queue(style::Print(label))?;
            self.stdout.queue(SetAttribute(Attribute::Reset))?;
            self.stdout.queue(style::Print(" "))?;
        }
        let scope = match tab.view.scope() {
            Scope::All => "all",
            Scope::Targeted => "targeted",
        };
        let sort = match tab.view.sort().active() {
            Some((column, SortDirection::Asc)) => format!("{column} asc"),
            Some((column, SortDirection::Desc)) => format!("{column} desc"),
            None => "none".to_string(),
        };
        self.stdout.queue(style::Print(format!("  scope: {scope}  sort: {sort}")))?;
        self.stdout.queue(cursor::MoveToNextLine(1))?;

        // Filter
        let filter = match &app.editing {
            Some(text) => format!("filter> {text}_"),
            None => format!("filter: {}", tab.view.filter_text()),
        };
        self.stdout.queue(style::Print(fit(&filter, width)))?;
        self.stdout.queue(cursor::MoveToNextLine(1))?;

        // Table header
        let columns = match tab.sink {
            SinkId::Logs => "line".to_string(),
            SinkId::Domains => format!(
                "{:<19}  {:<3}  {:<16}  {:<32}  {:<21} -> {}",
                "1:timestamp", "3:p", "2:set", "4:domain", "5:source", "6:destination"
            ),
        };
        self.stdout.queue(SetAttribute(Attribute::Bold))?;
        self.stdout.queue(style::Print(fit(&columns, width)))?;
        self.stdout.queue(SetAttribute(Attribute::Reset))?;
        self.stdout.queue(cursor::MoveToNextLine(1))?;

        // Rows on screen, out of the materialized window
        let visible = tab.view.visible();
        let first = tab.view.anchor().offset().floor() as usize;
        let skip = first.saturating_sub(visible.range.start);
        for (i, record) in visible
            .rows
            .iter()
            .enumerate()
            .skip(skip)
            .take(app.page as usize)
        {
            let text = match tab.sink {
                SinkId::Logs => record.raw.to_string(),
                SinkId::Domains => {
                    let org = app.resolver.resolve(&record.destination);
                    format_record(record, org.as_deref())
                }
            };
            if Some(visible.range.start + i) == highlighted {
                self.stdout.queue(SetAttribute(Attribute::Reverse))?;
            }
            if record.is_targeted() {
                self.stdout.queue(SetForegroundColor(Color::Yellow))?;
            }
            self.stdout.queue(style::Print(fit(&text, width)))?;
            self.stdout.queue(ResetColor)?;
            self.stdout.queue(SetAttribute(Attribute::Reset))?;
            self.stdout.queue(cursor::MoveToNextLine(1))?;
        }

        // Footer
        self.stdout
            .queue(cursor::MoveTo(0, height.saturating_sub(FOOTER_LINES)))?;
        let mut status = format!(
            "{} shown, {} parsed, {} stored",
            tab.view.rows().len(),
            tab.view.parsed_len(),
            app.sinks.get(tab.sink).history().len()
        );
        if let Some(at) = app.last_flush {
            status.push_str(&format!("  last batch {}", at.format("%H:%M:%S")));
        }
        if let Some(selected) = &app.selected {
            status.push_str(&format!("  selected: {selected}"));
        }
        self.stdout.queue(style::Print(fit(&status, width)))?;
        if tab.view.anchor().has_new_below() {
            self.stdout.queue(SetForegroundColor(Color::Green))?;
            self.stdout.queue(style::Print("  new data below (End)"))?;
            self.stdout.queue(ResetColor)?;
        }
        if let Some(error) = &app.last_error {
            self.stdout.queue(SetForegroundColor(Color::Red))?;
            self.stdout.queue(style::Print(format!("  {error}")))?;
            self.stdout.queue(ResetColor)?;
        }
        self.stdout.queue(cursor::MoveToNextLine(1))?;
        self.stdout.queue(style::Print(fit(
            "Tab switch  / filter  1-6 sort  t targeted  p pause  c clear  Enter select  q quit",
            width,
        )))?;

        self.stdout.flush()
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(path) = &cli.log_file {
        if let Err(e) = init_file_logging(cli.verbose, path) {
            eprintln!("failed to open log file {}: {e}", path.display());
            return ExitCode::FAILURE;
        }
    }
    let config = match cli.conn.ingest_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let store = cli.state.store();
    let mut saved = store.load_or_default();

    let mut tui = match Tui::setup() {
        Ok(tui) => tui,
        Err(e) => {
            eprintln!("terminal setup failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let mut t = Tui {
            stdout: io::stdout(),
        };
        t.teardown();
        original_hook(panic_info);
    }));

    let mut app = App::new(config.url.to_string(), &saved);
    let ingestor = Ingestor::connect(config);

    // Keyboard handler
    let (key_tx, key_rx) = channel::unbounded();
    std::thread::spawn(move || loop {
        if let Ok(ev) = event::read() {
            let _ = key_tx.send(ev);
        }
    });

    // UI loop
    let frame = Duration::from_millis(1000 / cli.fps.max(1));
    let tick = channel::tick(frame);
    'main: loop {
        let timer = app.batcher.timer().cloned().unwrap_or_else(channel::never);
        crossbeam::select! {
            recv(key_rx) -> ev => {
                if let Ok(event::Event::Key(k)) = ev {
                    if k.kind == KeyEventKind::Press && app.on_key(k) == Flow::Quit {
                        break 'main;
                    }
                }
            }

            recv(ingestor.events()) -> ev => match ev {
                Ok(ev) => app.on_ingest(ev),
                Err(_) => {
                    warn!("socket thread exited");
                    break 'main;
                }
            },

            recv(timer) -> _ => app.flush(),

            recv(tick) -> _ => {
                if let Ok((_, rows)) = terminal::size() {
                    app.resize(rows);
                }
                app.refresh();
                if tui.draw(&mut app).is_err() {
                    break 'main;
                }
            }
        }
    }

    app.batcher.cancel();
    ingestor.teardown();
    tui.teardown();

    saved.filter = app.tab().view.filter_text().to_string();
    saved.sort = app.tab().view.sort();
    if let Err(e) = store.save(&saved) {
        eprintln!("{e}");
    }
    if let Some(selected) = &app.selected {
        println!("{selected}");
    }
    ExitCode::SUCCESS
}
