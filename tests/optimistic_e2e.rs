use std::borrow::Cow;

use serde_json::{json, Value};

use kyrocache::{
    transaction_fn, CacheConfig, CacheError, CacheEvent, CacheWrite, Document, EntityKey, Field, InMemoryCache,
    NormalizedStore, OptimisticError, TransactionFn, Variables,
};

fn item_doc() -> Document {
    Document::builder()
        .field(
            Field::new("item")
                .select("__typename")
                .select("id")
                .select("label")
                .select("count"),
        )
        .build()
        .unwrap()
}

fn item(label: &str, count: i64) -> Value {
    json!({"item": {"__typename": "Item", "id": 1, "label": label, "count": count}})
}

fn write_item(label: &'static str, count: i64) -> TransactionFn {
    transaction_fn(move |tx| tx.write_query(&item_doc(), &Variables::new(), item(label, count)))
}

/// Adds `by` to whatever count the effective store currently holds.
fn bump(by: i64) -> TransactionFn {
    transaction_fn(move |tx| {
        let vars = Variables::new();
        let current = tx.read_query(&item_doc(), &vars)?;
        let label = current["item"]["label"].as_str().unwrap_or_default().to_string();
        let count = current["item"]["count"].as_i64().unwrap_or_default();
        tx.write_query(
            &item_doc(),
            &vars,
            json!({"item": {"__typename": "Item", "id": 1, "label": label, "count": count + by}}),
        )
    })
}

fn seeded() -> InMemoryCache {
    let mut cache = InMemoryCache::new(CacheConfig::default()).unwrap();
    cache
        .write_result(&CacheWrite::query(item_doc(), Variables::new(), item("base", 0)))
        .unwrap();
    cache
}

fn effective_item(cache: &InMemoryCache) -> Value {
    cache
        .read_query_optimistic(EntityKey::root_query(), &item_doc(), &Variables::new())
        .unwrap()
}

#[test]
fn overlay_applies_patches_in_order() {
    let mut cache = seeded();
    cache.perform_optimistic_transaction(bump(1), "a").unwrap();
    cache.perform_optimistic_transaction(bump(10), "b").unwrap();

    let mut expected = cache.data().clone();
    for patch in cache.optimistic_queue().patches() {
        expected.apply_patch(&patch.data);
    }
    assert_eq!(cache.optimistic_data().as_ref(), &expected);
    assert_eq!(effective_item(&cache)["item"]["count"], json!(11));
}

#[test]
fn removing_first_patch_replays_the_rest() {
    let mut cache = seeded();
    cache.perform_optimistic_transaction(bump(1), "a").unwrap();
    cache.perform_optimistic_transaction(bump(10), "b").unwrap();

    cache.remove_optimistic("a");

    // Same as if only "b" had ever run against the confirmed store.
    let mut fresh = seeded();
    fresh.perform_optimistic_transaction(bump(10), "b").unwrap();
    assert_eq!(
        cache.optimistic_data().fingerprint(),
        fresh.optimistic_data().fingerprint()
    );
    assert_eq!(effective_item(&cache)["item"]["count"], json!(10));
}

#[test]
fn optimistic_round_trip_leaves_confirmed_untouched() {
    let mut cache = seeded();
    let confirmed: NormalizedStore = cache.data().clone();

    cache.perform_optimistic_transaction(write_item("guess", 1), "m1").unwrap();
    assert_eq!(cache.data(), &confirmed);
    assert_ne!(cache.optimistic_data().as_ref(), &confirmed);

    cache.remove_optimistic("m1");
    assert_eq!(cache.data(), &confirmed);
    assert_eq!(cache.optimistic_data().as_ref(), &confirmed);
    assert!(matches!(cache.optimistic_data(), Cow::Borrowed(_)));
}

#[test]
fn later_patch_wins_per_record() {
    let mut cache = seeded();
    cache.perform_optimistic_transaction(write_item("first", 1), "m1").unwrap();
    cache.perform_optimistic_transaction(write_item("second", 2), "m2").unwrap();
    assert_eq!(effective_item(&cache), item("second", 2));

    cache.remove_optimistic("m2");
    assert_eq!(effective_item(&cache), item("first", 1));
}

#[test]
fn confirmed_writes_under_an_overlay() {
    let mut cache = seeded();
    cache.perform_optimistic_transaction(write_item("guess", 5), "m1").unwrap();
    cache
        .write_result(&CacheWrite::query(item_doc(), Variables::new(), item("server", 7)))
        .unwrap();

    // The pending patch still shadows the record it replaced.
    assert_eq!(effective_item(&cache), item("guess", 5));
    cache.remove_optimistic("m1");
    assert_eq!(effective_item(&cache), item("server", 7));
}

#[test]
fn duplicate_pending_id_is_rejected() {
    let mut cache = seeded();
    cache.perform_optimistic_transaction(bump(1), "m1").unwrap();
    let err = cache.perform_optimistic_transaction(bump(1), "m1").unwrap_err();
    assert_eq!(
        err,
        CacheError::Optimistic(OptimisticError::DuplicateId {
            id: "m1".to_string()
        })
    );
    assert_eq!(cache.optimistic_queue().len(), 1);

    // Once removed, the id can be reused.
    cache.remove_optimistic("m1");
    cache.perform_optimistic_transaction(bump(1), "m1").unwrap();
}

#[test]
fn unknown_ids_are_ignored() {
    let mut cache = seeded();
    cache.perform_optimistic_transaction(bump(1), "a").unwrap();
    assert!(!cache.remove_optimistic("nope"));
    assert_eq!(cache.optimistic_queue().len(), 1);
    assert_eq!(effective_item(&cache)["item"]["count"], json!(1));
}

#[test]
fn failed_optimistic_transaction_records_nothing() {
    let mut cache = seeded();
    let events = cache.subscribe();
    let err = cache
        .perform_optimistic_transaction(
            transaction_fn(|tx| {
                tx.write_query(&item_doc(), &Variables::new(), json!({"item": {"__typename": "Item", "id": 1}}))
            }),
            "bad",
        )
        .unwrap_err();
    assert!(err.is_write());
    assert!(cache.optimistic_queue().is_empty());
    assert!(events.drain().is_empty());
}

#[test]
fn overlay_events_are_published() {
    let mut cache = seeded();
    let events = cache.subscribe();
    cache.perform_optimistic_transaction(write_item("x", 1), "m1").unwrap();
    cache.remove_optimistic("m1");

    let seen = events.drain();
    assert_eq!(seen.len(), 2);
    assert!(matches!(&seen[0], CacheEvent::OptimisticRecorded { id, keys }
        if id.as_str() == "m1" && keys.contains(&EntityKey::from("Item:1"))));
    assert!(matches!(&seen[1], CacheEvent::OptimisticRemoved { id } if id.as_str() == "m1"));
}
