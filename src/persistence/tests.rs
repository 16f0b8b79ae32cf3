use std::collections::HashSet;
use std::sync::Mutex;

use tempfile::{TempDir, tempdir};

use super::message_store::{MessageStore, StoredMessage};
use super::guid::Guid;
use crate::protocol::Qos;
use crate::utils::error::StoreError;

fn open_store() -> (MessageStore, TempDir) {
    let dir = tempdir().unwrap();
    let store = MessageStore::open(dir.path().to_str().unwrap()).unwrap();
    (store, dir)
}

fn message(client_id: &str, message_id: u16, topic: &str, payload: &str, qos: Qos) -> StoredMessage {
    StoredMessage::new(client_id, message_id, topic, payload.as_bytes().to_vec(), qos, false)
}

#[test]
fn test_store_and_get_roundtrip() {
    let (store, _dir) = open_store();
    let msg = message("client-a", 1, "t/1", "hello", Qos::AtLeastOnce);

    let guid = store.store_for_future(&msg).unwrap();
    let loaded = store.get_by_guid(guid).unwrap().expect("message should exist");

    assert_eq!(loaded, msg);
    assert_eq!(store.pending_count("client-a").unwrap(), 1);
}

#[test]
fn test_missing_client_id_rejected() {
    let (store, _dir) = open_store();
    let msg = message("", 1, "t/1", "hello", Qos::AtLeastOnce);

    let err = store.store_for_future(&msg).unwrap_err();
    assert!(matches!(err, StoreError::MissingClientId));
    assert_eq!(store.pending_count("").unwrap(), 0);
}

#[test]
fn test_retained_overwrite_keeps_latest_only() {
    let (store, _dir) = open_store();
    let g1 = store.persist(&message("client-a", 0, "t", "old", Qos::AtMostOnce)).unwrap();
    let g2 = store.persist(&message("client-a", 0, "t", "new", Qos::AtMostOnce)).unwrap();

    store.store_retained("t", g1).unwrap();
    store.store_retained("t", g2).unwrap();

    let matches = store.search_matching(|topic| topic == "t").unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].payload, b"new");

    // The displaced message had no other referrer and must be gone.
    assert!(store.get_by_guid(g1).unwrap().is_none());
    assert!(store.get_by_guid(g2).unwrap().is_some());
}

#[test]
fn test_clean_retained_removes_entry_and_message() {
    let (store, _dir) = open_store();
    let guid = store.persist(&message("client-a", 0, "t", "hello", Qos::AtMostOnce)).unwrap();
    store.store_retained("t", guid).unwrap();

    store.clean_retained("t").unwrap();

    assert!(store.search_matching(|_| true).unwrap().is_empty());
    assert!(store.get_by_guid(guid).unwrap().is_none());
}

#[test]
fn test_drop_session_clears_pending_and_messages() {
    let (store, _dir) = open_store();
    let g1 = store.store_for_future(&message("client-a", 1, "t/1", "one", Qos::AtLeastOnce)).unwrap();
    let g2 = store.store_for_future(&message("client-a", 2, "t/2", "two", Qos::ExactlyOnce)).unwrap();
    assert_eq!(store.pending_count("client-a").unwrap(), 2);

    store.drop_session("client-a").unwrap();

    assert_eq!(store.pending_count("client-a").unwrap(), 0);
    assert!(store.get_by_guid(g1).unwrap().is_none());
    assert!(store.get_by_guid(g2).unwrap().is_none());

    // Idempotent
    store.drop_session("client-a").unwrap();
    assert_eq!(store.pending_count("client-a").unwrap(), 0);
}

#[test]
fn test_reused_message_id_collects_displaced_message() {
    let (store, _dir) = open_store();
    let g1 = store.store_for_future(&message("client-a", 5, "t", "first", Qos::AtLeastOnce)).unwrap();
    let g2 = store.store_for_future(&message("client-a", 5, "t", "second", Qos::AtLeastOnce)).unwrap();

    // Only the latest mapping stays pending; the displaced body is gone.
    assert_eq!(store.pending_count("client-a").unwrap(), 1);
    assert!(store.get_by_guid(g1).unwrap().is_none());
    assert!(store.get_by_guid(g2).unwrap().is_some());

    store.drop_session("client-a").unwrap();
    assert!(store.get_by_guid(g2).unwrap().is_none());
}

#[test]
fn test_reused_message_id_keeps_displaced_retained_message() {
    let (store, _dir) = open_store();
    let g1 = store.store_for_future(&message("client-a", 5, "t", "first", Qos::AtLeastOnce)).unwrap();
    store.store_retained("t", g1).unwrap();

    store.store_for_future(&message("client-a", 5, "t", "second", Qos::AtLeastOnce)).unwrap();

    // Displacement only releases the pending reference; the retained index
    // still points at the first body.
    assert!(store.get_by_guid(g1).unwrap().is_some());
    let matches = store.search_matching(|topic| topic == "t").unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].payload, b"first");
}

#[test]
fn test_retained_message_survives_session_drop() {
    let (store, _dir) = open_store();
    let msg = message("client-a", 1, "t", "keep me", Qos::AtLeastOnce);
    let guid = store.store_for_future(&msg).unwrap();
    store.store_retained("t", guid).unwrap();

    store.drop_session("client-a").unwrap();

    assert_eq!(store.pending_count("client-a").unwrap(), 0);
    assert!(store.get_by_guid(guid).unwrap().is_some());
    let matches = store.search_matching(|topic| topic == "t").unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].payload, b"keep me");
}

#[test]
fn test_take_pending_releases_reference() {
    let (store, _dir) = open_store();
    let guid = store.store_for_future(&message("client-a", 7, "t", "x", Qos::AtLeastOnce)).unwrap();

    let taken = store.sessions().take_pending("client-a", 7).unwrap();
    assert_eq!(taken, Some(guid));
    store.remove_if_unreferenced(guid).unwrap();
    assert!(store.get_by_guid(guid).unwrap().is_none());

    // Duplicate retransmission: the mapping is already gone.
    assert_eq!(store.sessions().take_pending("client-a", 7).unwrap(), None);
}

#[test]
fn test_remove_if_unreferenced_keeps_session_referenced_message() {
    let (store, _dir) = open_store();
    let guid = store.store_for_future(&message("client-a", 3, "t", "x", Qos::AtLeastOnce)).unwrap();

    store.remove_if_unreferenced(guid).unwrap();

    assert!(store.get_by_guid(guid).unwrap().is_some());
}

#[test]
fn test_search_matching_skips_dangling_entry() {
    let (store, _dir) = open_store();
    // Retained entry pointing at a guid that was never stored.
    store.store_retained("ghost", Guid::random()).unwrap();

    let matches = store.search_matching(|_| true).unwrap();
    assert!(matches.is_empty());
}

#[test]
fn test_search_matching_filters_by_predicate() {
    let (store, _dir) = open_store();
    for topic in ["a/1", "a/2", "b/1"] {
        let guid = store.persist(&message("client-a", 0, topic, topic, Qos::AtMostOnce)).unwrap();
        store.store_retained(topic, guid).unwrap();
    }

    let matches = store.search_matching(|topic| topic.starts_with("a/")).unwrap();
    assert_eq!(matches.len(), 2);
    assert!(matches.iter().all(|m| m.topic.starts_with("a/")));
}

#[test]
fn test_pending_guids_reflect_inflight_messages() {
    let (store, _dir) = open_store();
    let g1 = store.store_for_future(&message("client-a", 1, "t/1", "one", Qos::AtLeastOnce)).unwrap();
    let g2 = store.store_for_future(&message("client-a", 2, "t/2", "two", Qos::AtLeastOnce)).unwrap();

    let guids = store.sessions().pending_guids("client-a").unwrap();
    assert_eq!(guids.len(), 2);
    assert!(guids.contains(&g1));
    assert!(guids.contains(&g2));

    store.sessions().take_pending("client-a", 1).unwrap();
    let guids = store.sessions().pending_guids("client-a").unwrap();
    assert_eq!(guids, vec![g2]);
}

#[test]
fn test_pending_maps_are_isolated_per_client() {
    let (store, _dir) = open_store();
    store.store_for_future(&message("client-a", 1, "t", "a", Qos::AtLeastOnce)).unwrap();
    store.store_for_future(&message("client-b", 1, "t", "b", Qos::AtLeastOnce)).unwrap();

    store.drop_session("client-a").unwrap();

    assert_eq!(store.pending_count("client-a").unwrap(), 0);
    assert_eq!(store.pending_count("client-b").unwrap(), 1);
}

#[test]
fn test_concurrent_publishers_get_distinct_guids() {
    let (store, _dir) = open_store();
    let guids = Mutex::new(HashSet::new());

    std::thread::scope(|scope| {
        for i in 0..100 {
            let store = &store;
            let guids = &guids;
            scope.spawn(move || {
                let client = format!("client-{i}");
                let topic = format!("topic/{i}");
                let msg = message(&client, 1, &topic, "payload", Qos::AtLeastOnce);
                let guid = store.store_for_future(&msg).unwrap();
                guids.lock().unwrap().insert(guid);
            });
        }
    });

    let guids = guids.into_inner().unwrap();
    assert_eq!(guids.len(), 100);
    for guid in guids {
        assert!(store.get_by_guid(guid).unwrap().is_some());
    }
    for i in 0..100 {
        assert_eq!(store.pending_count(&format!("client-{i}")).unwrap(), 1);
    }
}
