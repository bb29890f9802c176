//! # Config Store Integration Tests
//!
//! Durable behaviour of the store across reopen, and the consumer key index lifecycle.

use api_dataplane::store::{ConfigStore, Event, CONSUMERS, ROUTES};
use serde_json::json;

fn consumer_event(username: &str, key: &str) -> Event {
    Event::put(
        format!("/apisix/consumers/{}", username),
        serde_json::to_vec(&json!({
            "username": username,
            "plugins": {"key-auth": {"key": key}}
        }))
        .unwrap(),
    )
}

#[test]
fn test_consumer_update_and_delete_maintain_index() {
    let store = ConfigStore::open_in_memory();

    store.apply(&consumer_event("jack", "key-one")).unwrap();
    assert_eq!(store.consumer_by_plugin_key("key-auth", "key-one").unwrap(), "jack");

    store.apply(&consumer_event("jack", "key-two")).unwrap();
    assert!(store.consumer_by_plugin_key("key-auth", "key-one").is_err());
    assert_eq!(store.consumer_by_plugin_key("key-auth", "key-two").unwrap(), "jack");

    store.apply(&Event::delete("/apisix/consumers/jack")).unwrap();
    assert!(store.consumer_by_plugin_key("key-auth", "key-two").is_err());
    assert!(store.get(CONSUMERS, "jack").unwrap_err().is_not_found());
}

#[test]
fn test_malformed_consumer_leaves_store_untouched() {
    let store = ConfigStore::open_in_memory();
    store.apply(&consumer_event("jack", "key-one")).unwrap();

    let broken = Event::put("/apisix/consumers/jack", "{not json");
    assert!(store.apply(&broken).is_err());

    assert_eq!(store.consumer_by_plugin_key("key-auth", "key-one").unwrap(), "jack");
    assert!(store.get_consumer("jack").is_ok());
}

#[test]
fn test_reopen_restores_resources_and_index() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");

    {
        let store = ConfigStore::open(&path).unwrap();
        store
            .put(ROUTES, "1", serde_json::to_vec(&json!({"uri": "/get"})).unwrap())
            .unwrap();
        store.apply(&consumer_event("rose", "rose-key")).unwrap();
    }

    let reopened = ConfigStore::open(&path).unwrap();
    assert_eq!(reopened.get_route("1").unwrap().uri.as_deref(), Some("/get"));
    assert_eq!(
        reopened.consumer_by_plugin_key("key-auth", "rose-key").unwrap(),
        "rose"
    );
}

#[test]
fn test_replace_all_drops_entries_missing_from_snapshot() {
    let store = ConfigStore::open_in_memory();
    store.put(ROUTES, "stale", &b"{}"[..]).unwrap();
    store.apply(&consumer_event("old", "old-key")).unwrap();

    store
        .replace_all(&[
            Event::put("/apisix/routes/fresh", r#"{"uri":"/fresh"}"#),
            consumer_event("new", "new-key"),
        ])
        .unwrap();

    assert!(store.get(ROUTES, "stale").is_err());
    assert!(store.get(ROUTES, "fresh").is_ok());
    assert!(store.consumer_by_plugin_key("key-auth", "old-key").is_err());
    assert_eq!(store.consumer_by_plugin_key("key-auth", "new-key").unwrap(), "new");
}

#[test]
fn test_snapshot_is_isolated_from_later_writes() {
    let store = ConfigStore::open_in_memory();
    store.put(ROUTES, "1", &b"{}"[..]).unwrap();

    let snapshot = store.snapshot();
    store.delete(ROUTES, "1").unwrap();

    assert!(snapshot.get(ROUTES, "1").is_ok());
    assert!(store.get(ROUTES, "1").is_err());
}
