//! Property-based ordering tests for the property tree.
//!
//! 1. Concurrent writers: every subscriber of a node observes the same
//!    sequence of values.
//! 2. Child operations: the children list seen through AddChild/DelChild/
//!    MoveChild events always matches the node's actual children.

use std::sync::{Arc, Mutex};
use std::thread;

use marquee_prop::{Prop, PropEvent, PropValue, SubscriptionOptions};
use proptest::prelude::*;

// ── Helpers ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum ChildOp {
    Create(u8),
    Delete(u8),
    MoveToFront(u8),
    MoveToEnd(u8),
}

fn child_op_strategy() -> impl Strategy<Value = ChildOp> {
    prop_oneof![
        (0u8..6).prop_map(ChildOp::Create),
        (0u8..6).prop_map(ChildOp::Delete),
        (0u8..6).prop_map(ChildOp::MoveToFront),
        (0u8..6).prop_map(ChildOp::MoveToEnd),
    ]
}

fn names(children: &[Prop]) -> Vec<String> {
    children
        .iter()
        .map(|c| c.name().unwrap_or_default().to_string())
        .collect()
}

/// Rebuilds a child list purely from events.
fn mirror(log: Arc<Mutex<Vec<Prop>>>) -> impl Fn(&PropEvent) + Send + Sync {
    move |event: &PropEvent| {
        let mut list = log.lock().unwrap();
        match event {
            PropEvent::AddChild { child, before } | PropEvent::MoveChild { child, before } => {
                list.retain(|c| !c.is_same(child));
                let index = before
                    .as_ref()
                    .and_then(|b| list.iter().position(|c| c.is_same(b)))
                    .unwrap_or(list.len());
                list.insert(index, child.clone());
            }
            PropEvent::DelChild(child) => list.retain(|c| !c.is_same(child)),
            _ => {}
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 1. Concurrent writers
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn subscribers_agree_on_order(
        writers in proptest::collection::vec(proptest::collection::vec(any::<i32>(), 1..20), 1..5),
        subscribers in 2usize..5,
    ) {
        let node = Prop::create_root(Some("shared"));
        let logs: Vec<Arc<Mutex<Vec<PropValue>>>> =
            (0..subscribers).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();
        let _subs: Vec<_> = logs
            .iter()
            .map(|log| {
                let log = log.clone();
                node.subscribe(SubscriptionOptions::default().no_initial_update(), move |e| {
                    if let PropEvent::Set(v) = e {
                        log.lock().unwrap().push(v.clone());
                    }
                })
                .unwrap()
            })
            .collect();

        let handles: Vec<_> = writers
            .iter()
            .cloned()
            .map(|values| {
                let node = node.clone();
                thread::spawn(move || {
                    for v in values {
                        node.set_value(v).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let expected_len: usize = writers.iter().map(Vec::len).sum();
        let first = logs[0].lock().unwrap().clone();
        prop_assert_eq!(first.len(), expected_len);
        for log in &logs[1..] {
            prop_assert_eq!(&*log.lock().unwrap(), &first);
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 2. Child operations
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn events_track_children(ops in proptest::collection::vec(child_op_strategy(), 1..40)) {
        let root = Prop::create_root(Some("root"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = root
            .subscribe(SubscriptionOptions::default(), mirror(seen.clone()))
            .unwrap();

        for op in ops {
            match op {
                ChildOp::Create(n) => {
                    root.create_child(&format!("c{n}")).unwrap();
                }
                ChildOp::Delete(n) => {
                    root.delete_child_by_name(&format!("c{n}")).unwrap();
                }
                ChildOp::MoveToFront(n) => {
                    if let Some(child) = root.child(&format!("c{n}")) {
                        let first = root.children().first().cloned();
                        child.move_before(first.as_ref()).unwrap();
                    }
                }
                ChildOp::MoveToEnd(n) => {
                    if let Some(child) = root.child(&format!("c{n}")) {
                        child.move_before(None).unwrap();
                    }
                }
            }
            prop_assert_eq!(names(&seen.lock().unwrap()), names(&root.children()));
        }
    }
}
