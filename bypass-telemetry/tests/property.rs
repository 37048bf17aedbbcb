use bypass_telemetry::data::{HistoryBuffer, RawLine, Reconciler, Scope};
use bypass_telemetry::view::{visible_range, Viewport};
use proptest::prelude::*;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Push(Vec<RawLine>),
    Clear,
}

fn any_line() -> impl Strategy<Value = RawLine> {
    prop_oneof![
        8 => (0u16..400, any::<bool>()).prop_map(|(id, targeted)| {
            let set = if targeted { "hosts" } else { "" };
            Arc::from(format!("2024-01-01 00:00:00,TCP,{set},d{id}.com,src,,10.0.0.1"))
        }),
        1 => "[a-z,]{0,12}".prop_map(|s| Arc::from(s.as_str())),
    ]
}

fn any_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        10 => prop::collection::vec(any_line(), 0..30).prop_map(Op::Push),
        3 => (any_line(), 0usize..120).prop_map(|(line, n)| Op::Push(vec![line; n])),
        1 => Just(Op::Clear),
    ]
}

fn raws(records: &[Arc<bypass_telemetry::ParsedRecord>]) -> Vec<String> {
    records.iter().map(|r| r.raw.to_string()).collect()
}

proptest! {
    #[test]
    fn history_never_exceeds_capacity(
        capacity in 1usize..64,
        ops in prop::collection::vec(any_op(), 1..60),
    ) {
        let mut history = HistoryBuffer::new(capacity);
        let mut model: Vec<RawLine> = Vec::new();
        for op in ops {
            match op {
                Op::Push(lines) => {
                    model.extend(lines.iter().cloned());
                    history.push(lines);
                }
                Op::Clear => {
                    model.clear();
                    history.clear();
                }
            }
            let keep = model.len().min(capacity);
            prop_assert!(history.len() <= capacity);
            let snapshot = history.get_all();
            prop_assert_eq!(&snapshot[..], &model[model.len() - keep..]);
        }
    }

    #[test]
    fn incremental_matches_full_parse(
        capacity in 1usize..160,
        ops in prop::collection::vec(any_op(), 1..40),
        targeted in any::<bool>(),
    ) {
        let scope = if targeted { Scope::Targeted } else { Scope::All };
        let mut history = HistoryBuffer::new(capacity);
        let mut incremental = Reconciler::default();
        for op in ops {
            match op {
                Op::Push(lines) => history.push(lines),
                Op::Clear => history.clear(),
            }
            let snapshot = history.get_all();
            let inc = incremental.reconcile(&snapshot, scope);
            let full = Reconciler::default().reconcile(&snapshot, scope);
            prop_assert_eq!(raws(&inc.records), raws(&full.records));
        }
    }

    #[test]
    fn window_is_bounded(
        total in 0usize..100_000,
        offset in 0.0f64..3_000_000.0,
        height in 0.0f64..5_000.0,
        row_height in 1.0f64..100.0,
        overscan in 0usize..50,
    ) {
        let viewport = Viewport { offset, height, row_height, overscan };
        let range = visible_range(total, &viewport);
        let shown = (height / row_height).ceil() as usize;
        prop_assert!(range.start <= range.end);
        prop_assert!(range.end <= total);
        prop_assert!(range.len() <= shown + 2 * overscan);
        let skipped = (total - range.len()) as f64 * row_height;
        prop_assert!((range.top_spacer + range.bottom_spacer - skipped).abs() < 1e-6 * skipped.max(1.0));
    }
}
