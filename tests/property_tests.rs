//! Property-based tests for curation and the store's upsert convergence,
//! plus fuzz-style decoding of arbitrary payloads.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use serde_json::{json, Map, Value};

use flowtrace::codec;
use flowtrace::curator::merge;
use flowtrace::store::memory::InMemoryBackend;
use flowtrace::store::{DocumentStore, UpsertOp, TIMESTAMP_FIELD};
use flowtrace::{TaskMessage, TaskStatus};

// ─── Arbitrary Strategies ───────────────────────────────────────────────────

fn arb_status() -> impl Strategy<Value = TaskStatus> {
    prop::sample::select(vec![
        TaskStatus::Submitted,
        TaskStatus::Running,
        TaskStatus::Finished,
        TaskStatus::Error,
    ])
}

fn arb_bindings() -> impl Strategy<Value = BTreeMap<String, i64>> {
    prop::collection::btree_map("[a-z]{1,6}", any::<i64>(), 0..5)
}

fn to_map(bindings: &BTreeMap<String, i64>) -> Option<Map<String, Value>> {
    if bindings.is_empty() {
        return None;
    }
    Some(bindings.iter().map(|(k, v)| (k.clone(), json!(v))).collect())
}

fn arb_message(task_ids: &'static [&'static str]) -> impl Strategy<Value = TaskMessage> {
    (
        prop::sample::select(task_ids),
        proptest::option::of(arb_status()),
        proptest::option::of("wf-[0-9]{1,2}"),
        arb_bindings(),
        arb_bindings(),
    )
        .prop_map(|(task_id, status, workflow_id, used, generated)| TaskMessage {
            task_id: Some(task_id.to_string()),
            status,
            workflow_id,
            used: to_map(&used),
            generated: to_map(&generated),
            ..TaskMessage::default()
        })
}

const IDS: &[&str] = &["t1", "t2", "t3"];

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

async fn persist(store: &DocumentStore, batch: &[TaskMessage]) {
    let curated = merge(batch, store.correlation_key());
    let summary = store.upsert_many(UpsertOp::from_curated(curated)).await;
    assert!(summary.is_success());
}

fn without_timestamp(record: Option<Map<String, Value>>) -> Option<Map<String, Value>> {
    record.map(|mut r| {
        r.remove(TIMESTAMP_FIELD);
        r
    })
}

// ─── Curation Properties ────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Merging a message twice is the same as merging it once.
    #[test]
    fn merge_is_idempotent(message in arb_message(IDS)) {
        let once = merge(std::slice::from_ref(&message), "task_id");
        let twice = merge(&[message.clone(), message], "task_id");
        prop_assert_eq!(once, twice);
    }

    /// Disjoint nested bindings from separate messages all survive.
    #[test]
    fn nested_bindings_accumulate(
        used in arb_bindings(),
        generated in arb_bindings(),
    ) {
        let first = TaskMessage { used: to_map(&used), ..TaskMessage::new("t") };
        let second = TaskMessage { generated: to_map(&generated), ..TaskMessage::new("t") };
        let curated = merge(&[first, second], "task_id");
        let record = &curated.updates["t"];
        for (k, v) in &used {
            prop_assert_eq!(&record["used"][k], &json!(v));
        }
        for (k, v) in &generated {
            prop_assert_eq!(&record["generated"][k], &json!(v));
        }
    }

    /// The last reported status wins.
    #[test]
    fn last_status_wins(statuses in prop::collection::vec(arb_status(), 1..6)) {
        let batch: Vec<_> = statuses
            .iter()
            .map(|s| TaskMessage::new("t").with_status(*s))
            .collect();
        let curated = merge(&batch, "task_id");
        let last = statuses.last().copied().map(|s| json!(s.to_string()));
        prop_assert_eq!(curated.updates["t"].get("status").cloned(), last);
    }
}

// ─── Store Convergence ──────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Flushing a batch in one go or split at any point converges to the
    /// same records.
    #[test]
    fn split_flushes_converge(
        batch in prop::collection::vec(arb_message(IDS), 1..12),
        split in any::<prop::sample::Index>(),
    ) {
        let at = split.index(batch.len() + 1);
        let (whole, parts) = block_on(async {
            let whole = DocumentStore::new(Arc::new(InMemoryBackend::new()), "task_id");
            persist(&whole, &batch).await;

            let parts = DocumentStore::new(Arc::new(InMemoryBackend::new()), "task_id");
            persist(&parts, &batch[..at]).await;
            persist(&parts, &batch[at..]).await;
            (whole, parts)
        });
        for id in IDS {
            let (a, b) = block_on(async {
                (whole.get(id).await.unwrap(), parts.get(id).await.unwrap())
            });
            let strip_id = |r: Option<Map<String, Value>>| {
                without_timestamp(r).map(|mut r| {
                    r.remove("_id");
                    r
                })
            };
            prop_assert_eq!(strip_id(a), strip_id(b));
        }
    }

    /// Re-delivering an already persisted batch changes nothing.
    #[test]
    fn redelivery_is_harmless(batch in prop::collection::vec(arb_message(IDS), 1..8)) {
        let (before, after) = block_on(async {
            let store = DocumentStore::new(Arc::new(InMemoryBackend::new()), "task_id");
            persist(&store, &batch).await;
            let before = store.documents().await.unwrap();
            persist(&store, &batch).await;
            let after = store.documents().await.unwrap();
            (before, after)
        });
        let strip = |docs: Vec<Map<String, Value>>| -> Vec<_> {
            docs.into_iter().map(|d| without_timestamp(Some(d))).collect()
        };
        prop_assert_eq!(strip(before), strip(after));
    }
}

// ─── Fuzz Decoding ──────────────────────────────────────────────────────────

proptest! {
    /// Arbitrary bytes never panic the decoder.
    #[test]
    fn fuzz_decode_arbitrary_bytes(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = codec::decode(&bytes);
    }
}
