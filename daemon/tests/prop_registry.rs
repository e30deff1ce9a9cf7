mod common;

use common::*;
use flow_tracker::events::ConnEventKind;
use flow_tracker::{ConnectionKey, StatsDelta};
use proptest::prelude::*;

// ===========================================================================
// Counter accumulation
// ===========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Byte counters equal the sum of the non-negative deltas, per flow,
    /// however updates for distinct flows are interleaved.
    #[test]
    fn counters_sum_clamped_deltas(
        updates in prop::collection::vec((0usize..4, -1000i64..10_000, -1000i64..10_000), 0..200)
    ) {
        let engine = engine();
        let tuples: Vec<_> = (0..4u16).map(|i| client_tuple(42000 + i, [1, 1, 1, 1], 443)).collect();
        let mut expected = [(0u64, 0u64); 4];

        for (flow, sent, recv) in &updates {
            engine.handle_event(update(tuples[*flow], *flow as u64, *sent, *recv));
            expected[*flow].0 += (*sent).max(0) as u64;
            expected[*flow].1 += (*recv).max(0) as u64;
        }

        for (flow, tuple) in tuples.iter().enumerate() {
            let key = ConnectionKey::new(*tuple, flow as u64);
            match engine.registry().get(&key) {
                Some(snapshot) => {
                    prop_assert_eq!(snapshot.sent_bytes, expected[flow].0);
                    prop_assert_eq!(snapshot.recv_bytes, expected[flow].1);
                }
                None => prop_assert!(updates.iter().all(|(f, _, _)| *f != flow)),
            }
        }
    }

    /// Counters never decrease while a flow is active.
    #[test]
    fn counters_are_monotonic(deltas in prop::collection::vec(-500i64..500, 1..100)) {
        let engine = engine();
        let tuple = client_tuple(42000, [1, 1, 1, 1], 443);
        let key = ConnectionKey::new(tuple, 1);
        let mut last = 0u64;
        for delta in deltas {
            engine.handle_event(update(tuple, 1, delta, 0));
            let sent = engine.registry().get(&key).map(|s| s.sent_bytes).unwrap_or(0);
            prop_assert!(sent >= last);
            last = sent;
        }
    }

    /// Any number of repeated closes leaves the first snapshot unchanged.
    #[test]
    fn close_is_idempotent(
        sent in 0i64..100_000,
        repeats in prop::collection::vec((0i64..100_000, 0i64..100_000), 1..10)
    ) {
        let engine = engine();
        engine.register_client("p");
        let tuple = client_tuple(42000, [1, 1, 1, 1], 443);
        engine.handle_event(update(tuple, 1, sent, 0));
        engine.handle_event(close(tuple, 1));
        let first = engine.poll_since("p").unwrap();
        prop_assert_eq!(first.closed.len(), 1);
        let snapshot = first.closed[0].snapshot.clone();

        for (s, r) in &repeats {
            engine.handle_event(conn(ConnEventKind::Close, tuple, 1, StatsDelta::bytes(*s, *r)));
        }
        let again = engine.poll_since("p").unwrap();
        prop_assert!(again.closed.is_empty());
        prop_assert_eq!(&first.closed[0].snapshot, &snapshot);
        prop_assert_eq!(snapshot.sent_bytes, sent as u64);
        prop_assert_eq!(engine.diagnostics().registry.duplicate_closes, repeats.len() as u64);
    }
}
