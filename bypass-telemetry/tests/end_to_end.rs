use bypass_telemetry::data::Scope;
use bypass_telemetry::enrich::NoEnrichment;
use bypass_telemetry::stream::{
    Batcher, IngestConfig, IngestError, IngestEvent, Ingestor, SinkId, Sinks, Transport,
    TransportConnection,
};
use bypass_telemetry::{LogView, RawLine};

use crossbeam::channel;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

fn event(i: usize) -> RawLine {
    Arc::from(format!("2024-01-01 00:00:00,TCP,,d{i}.com,src{i},,10.0.0.1:443"))
}

fn flush_lines(batcher: &mut Batcher, sinks: &mut Sinks, lines: impl IntoIterator<Item = RawLine>) {
    for line in lines {
        batcher.enqueue(line);
    }
    batcher.flush(sinks);
}

#[test]
fn history_keeps_the_newest_lines() {
    let mut batcher = Batcher::default();
    let mut sinks = Sinks::default();
    for chunk in (0..2500).collect::<Vec<_>>().chunks(100) {
        flush_lines(&mut batcher, &mut sinks, chunk.iter().map(|&i| event(i)));
    }
    let logs = sinks.logs.history().get_all();
    assert_eq!(logs.len(), 2000);
    assert_eq!(&*logs[0], &*event(500));
    assert_eq!(&*logs[1999], &*event(2499));
}

#[test]
fn malformed_line_is_stored_but_not_parsed() {
    let mut batcher = Batcher::default();
    let mut sinks = Sinks::default();
    let mut view = LogView::default();
    flush_lines(&mut batcher, &mut sinks, (0..10).map(event));
    view.refresh(sinks.logs.history(), &mut NoEnrichment);
    assert_eq!(view.parsed_len(), 10);

    flush_lines(&mut batcher, &mut sinks, [RawLine::from("x,y")]);
    assert_eq!(sinks.logs.history().len(), 11);
    assert_eq!(sinks.domains.history().len(), 10);
    view.refresh(sinks.logs.history(), &mut NoEnrichment);
    assert_eq!(view.parsed_len(), 10);
    assert_eq!(view.rows().len(), 10);
}

#[test]
fn pause_freezes_and_resume_appends_only_new_lines() {
    let mut batcher = Batcher::default();
    let mut sinks = Sinks::default();
    flush_lines(&mut batcher, &mut sinks, (0..5).map(event));

    sinks.get_mut(SinkId::Domains).toggle_paused();
    flush_lines(&mut batcher, &mut sinks, (5..10).map(event));
    assert_eq!(sinks.domains.history().len(), 5);
    assert_eq!(sinks.logs.history().len(), 10);

    sinks.get_mut(SinkId::Domains).toggle_paused();
    flush_lines(&mut batcher, &mut sinks, (10..13).map(event));
    let domains = sinks.domains.history().get_all();
    let expected: Vec<RawLine> = (0..5).chain(10..13).map(event).collect();
    assert_eq!(&*domains, &expected[..]);
}

#[test]
fn targeted_scope_shows_only_targeted_events() {
    let mut batcher = Batcher::default();
    let mut sinks = Sinks::default();
    flush_lines(
        &mut batcher,
        &mut sinks,
        [
            event(0),
            RawLine::from("2024-01-01 00:00:01,UDP,,d1.com,src1,vpn,10.0.0.2:53"),
        ],
    );
    let mut view = LogView::default();
    view.set_scope(Scope::Targeted);
    view.refresh(sinks.domains.history(), &mut NoEnrichment);
    assert_eq!(view.rows().len(), 1);
    assert_eq!(view.rows()[0].ip_set, "vpn");
}

/// Replays a fixed set of lines on the first connection, then refuses.
struct Replay(Option<Vec<String>>);

struct ReplayConn(VecDeque<String>);

impl Transport for Replay {
    type Conn = ReplayConn;

    fn connect(
        &mut self,
        _url: &Url,
        _cancelled: &dyn Fn() -> bool,
    ) -> Result<ReplayConn, IngestError> {
        match self.0.take() {
            Some(lines) => Ok(ReplayConn(lines.into())),
            None => Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into()),
        }
    }
}

impl TransportConnection for ReplayConn {
    fn recv(&mut self) -> Result<Option<String>, IngestError> {
        self.0.pop_front().map(Some).ok_or(IngestError::Closed)
    }

    fn close(&mut self) {}
}

#[test]
fn socket_lines_reach_the_view() {
    let lines: Vec<String> = (0..50).map(|i| event(i).to_string()).collect();
    let mut config = IngestConfig::for_origin("http://localhost:1").unwrap();
    config.reconnect_delay = Duration::from_secs(600);
    let ingestor = Ingestor::spawn(config, Replay(Some(lines)));

    let mut batcher = Batcher::new(Duration::from_millis(5));
    let mut sinks = Sinks::default();
    let deadline = channel::after(Duration::from_secs(10));
    while sinks.domains.history().len() < 50 {
        let timer = batcher.timer().cloned().unwrap_or_else(channel::never);
        channel::select! {
            recv(ingestor.events()) -> msg => {
                if let Ok(IngestEvent::Line(line)) = msg {
                    batcher.enqueue(line);
                }
            }
            recv(timer) -> _ => {
                batcher.flush(&mut sinks);
            }
            recv(deadline) -> _ => panic!("lines did not arrive"),
        }
    }
    ingestor.teardown();

    let mut view = LogView::default();
    view.set_filter("domain:d4");
    view.refresh(sinks.domains.history(), &mut NoEnrichment);
    let domains: Vec<&str> = view.rows().iter().map(|r| r.domain.as_str()).collect();
    let expected: Vec<String> = [4].into_iter().chain(40..50).map(|i| format!("d{i}.com")).collect();
    assert_eq!(domains, expected);
}
