use std::fs;

use chat_provider::{Message, TokenUsage, ToolCall};
use ledger_store::{
    session_file_name, JsonFileStore, LedgerSnapshot, LedgerStore, LedgerStoreError, MemoryStore,
};
use serde_json::json;
use time::macros::datetime;

fn sample_snapshot(session_id: &str) -> LedgerSnapshot {
    let mut snapshot = LedgerSnapshot::empty(session_id, "llama3.1:8b");
    snapshot.messages = vec![
        Message::user("what time is it?"),
        Message::assistant_tool_calls(
            "",
            Some("llama3.1:8b".to_string()),
            vec![ToolCall::from_value("current_datetime", json!({}))],
        ),
        Message::tool("current_datetime", "2026-02-14T09:00:00Z"),
        Message::assistant(
            "It is nine o'clock.",
            Some("llama3.1:8b".to_string()),
            TokenUsage::new(12, 80),
        ),
    ];
    snapshot.metadata.message_count = snapshot.messages.len();
    snapshot
}

#[test]
fn file_store_round_trips_a_full_ledger() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let store = JsonFileStore::new(dir.path().join("chat_sessions"));
    let snapshot = sample_snapshot("abc123");

    store.save(&snapshot).expect("save should succeed");
    let loaded = store
        .load("abc123")
        .expect("load should succeed")
        .expect("ledger should exist");

    assert_eq!(loaded, snapshot);
    assert!(dir
        .path()
        .join("chat_sessions")
        .join(session_file_name("abc123"))
        .exists());
}

#[test]
fn file_store_writes_flat_messages_with_metadata() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let store = JsonFileStore::new(dir.path());
    store
        .save(&sample_snapshot("flat1"))
        .expect("save should succeed");

    let raw = fs::read_to_string(dir.path().join("flat1.json")).expect("file should exist");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("file should be JSON");

    assert_eq!(value["metadata"]["session_id"], "flat1");
    assert_eq!(value["metadata"]["message_count"], 4);
    assert_eq!(value["messages"][1]["tool_calls"][0]["tool_name"], "current_datetime");
    assert_eq!(value["messages"][2]["tool_name"], "current_datetime");
    assert_eq!(value["messages"][3]["eval_count"], 12);
    assert!(value["messages"][1].get("eval_count").is_none());
}

#[test]
fn missing_session_loads_as_none_and_delete_reports_absence() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let store = JsonFileStore::new(dir.path());

    assert!(store.load("nothing").expect("load should succeed").is_none());
    assert!(!store.delete("nothing").expect("delete should succeed"));

    store
        .save(&sample_snapshot("present"))
        .expect("save should succeed");
    assert!(store.delete("present").expect("delete should succeed"));
    assert!(store.load("present").expect("load should succeed").is_none());
}

#[test]
fn save_overwrites_previous_state() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let store = JsonFileStore::new(dir.path());
    let mut snapshot = sample_snapshot("grow");
    store.save(&snapshot).expect("first save should succeed");

    snapshot.messages.truncate(1);
    snapshot.metadata.message_count = 1;
    store.save(&snapshot).expect("second save should succeed");

    let loaded = store
        .load("grow")
        .expect("load should succeed")
        .expect("ledger should exist");
    assert_eq!(loaded.messages.len(), 1);
    assert!(!dir.path().join("grow.json.tmp").exists());
}

#[test]
fn invalid_session_ids_never_touch_the_filesystem() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let store = JsonFileStore::new(dir.path());

    let error = store
        .load("../escape")
        .expect_err("path-like id must be rejected");
    assert!(matches!(error, LedgerStoreError::InvalidSessionId { .. }));
}

#[test]
fn load_rejects_file_for_another_session() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let store = JsonFileStore::new(dir.path());
    store
        .save(&sample_snapshot("original"))
        .expect("save should succeed");
    fs::copy(dir.path().join("original.json"), dir.path().join("copy.json"))
        .expect("copy should succeed");

    let error = store.load("copy").expect_err("mismatched id must fail");
    assert!(matches!(
        error,
        LedgerStoreError::SessionIdMismatch { ref expected, ref found, .. }
            if expected == "copy" && found == "original"
    ));
}

#[test]
fn load_reports_corrupt_json() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("broken.json"), "{ not json").expect("write should succeed");
    let store = JsonFileStore::new(dir.path());

    let error = store.load("broken").expect_err("corrupt file must fail");
    assert!(matches!(error, LedgerStoreError::JsonParse { .. }));
}

#[test]
fn load_rejects_messages_that_break_role_invariants() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let raw = json!({
        "metadata": {
            "session_id": "bad",
            "model": "m",
            "created_at": "2026-02-14T00:00:00Z",
            "updated_at": "2026-02-14T00:00:00Z",
            "message_count": 1,
        },
        "messages": [{
            "role": "assistant",
            "content": "x",
            "tool_calls": [{"tool_name": "t", "arguments": {}}],
            "eval_count": 3,
            "prompt_eval_count": 4,
            "timestamp": "2026-02-14T00:00:00Z",
        }],
    });
    fs::write(dir.path().join("bad.json"), raw.to_string()).expect("write should succeed");

    let error = JsonFileStore::new(dir.path())
        .load("bad")
        .expect_err("tool-call message with usage must fail");
    assert!(matches!(error, LedgerStoreError::JsonParse { .. }));
}

#[test]
fn list_orders_by_most_recent_update_and_skips_garbage() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let store = JsonFileStore::new(dir.path());

    let mut older = sample_snapshot("older");
    older.metadata.updated_at = datetime!(2026-01-01 00:00 UTC);
    let mut newer = sample_snapshot("newer");
    newer.metadata.updated_at = datetime!(2026-02-01 00:00 UTC);
    store.save(&older).expect("save should succeed");
    store.save(&newer).expect("save should succeed");
    fs::write(dir.path().join("junk.json"), "[]").expect("write should succeed");
    fs::write(dir.path().join("notes.txt"), "ignored").expect("write should succeed");

    let listed = store.list().expect("list should succeed");
    let ids: Vec<&str> = listed.iter().map(|meta| meta.session_id.as_str()).collect();
    assert_eq!(ids, vec!["newer", "older"]);
}

#[test]
fn list_of_missing_directory_is_empty() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let store = JsonFileStore::new(dir.path().join("never-created"));

    assert!(store.list().expect("list should succeed").is_empty());
}

#[test]
fn memory_store_behaves_like_file_store() {
    let store = MemoryStore::new();
    assert!(store.is_empty());

    store
        .save(&sample_snapshot("mem"))
        .expect("save should succeed");
    let loaded = store
        .load("mem")
        .expect("load should succeed")
        .expect("ledger should exist");
    assert_eq!(loaded.messages.len(), 4);
    assert_eq!(store.list().expect("list should succeed").len(), 1);
    assert!(store.delete("mem").expect("delete should succeed"));
    assert!(store.is_empty());
}
