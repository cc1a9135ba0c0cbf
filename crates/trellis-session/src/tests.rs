use std::time::Duration;

use trellis_ai::{ContentBlock, ToolCall, Turn};

use super::*;

fn store(dir: &Path) -> SessionStore {
    SessionStore::open(SessionStoreConfig::new(dir)).expect("open store")
}

fn assistant_with_call(call_id: &str, tool: &str) -> Turn {
    Turn::assistant_blocks(vec![
        ContentBlock::Text {
            text: "let me check".to_string(),
        },
        ContentBlock::tool_call(ToolCall {
            id: call_id.to_string(),
            name: tool.to_string(),
            arguments: serde_json::json!({}),
        }),
    ])
}

#[tokio::test]
async fn acquire_new_key_yields_empty_session() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let store = store(tempdir.path());
    let handle = store.acquire("agent:A1:channel:C").await.expect("acquire");
    assert!(handle.turns().is_empty());
    assert!(!handle.is_degraded());
}

#[tokio::test]
async fn persist_then_reacquire_round_trips_history() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let store = store(tempdir.path());

    let mut handle = store.acquire("agent:A1:channel:C:peer:alice").await.expect("acquire");
    handle.append_turn(Turn::user("hello"));
    handle.append_turn(Turn::assistant_text("hi alice"));
    handle.persist().expect("persist");
    let written = handle.turns().to_vec();
    drop(handle);

    let reloaded = store.acquire("agent:A1:channel:C:peer:alice").await.expect("reacquire");
    assert_eq!(reloaded.turns(), written.as_slice());
    assert!(!reloaded.is_degraded());
}

#[tokio::test]
async fn second_acquire_fails_fast_until_first_releases() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let store = store(tempdir.path());

    let first = store.acquire("agent:A1:channel:C").await.expect("acquire");
    let contended = store.acquire("agent:A1:channel:C").await;
    match contended {
        Err(error) => assert!(error.is_retryable()),
        Ok(_) => panic!("second acquire should contend"),
    }

    drop(first);
    assert!(store.acquire("agent:A1:channel:C").await.is_ok());
}

#[tokio::test]
async fn unrelated_keys_do_not_contend() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let store = store(tempdir.path());
    let _first = store.acquire("agent:A1:channel:C").await.expect("acquire");
    assert!(store.acquire("agent:A1:channel:D").await.is_ok());
}

#[tokio::test]
async fn queue_policy_waits_for_release() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let mut config = SessionStoreConfig::new(tempdir.path());
    config.lock_policy = LockPolicy::Queue {
        max_waiters: 4,
        wait_timeout: Duration::from_secs(1),
    };
    let store = std::sync::Arc::new(SessionStore::open(config).expect("open store"));

    let handle = store.acquire("agent:A1:channel:C").await.expect("acquire");
    let waiter = {
        let store = store.clone();
        tokio::spawn(async move { store.acquire("agent:A1:channel:C").await.is_ok() })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(handle);
    assert!(waiter.await.expect("join"));
}

#[tokio::test]
async fn queue_policy_times_out_as_contention() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let mut config = SessionStoreConfig::new(tempdir.path());
    config.lock_policy = LockPolicy::Queue {
        max_waiters: 4,
        wait_timeout: Duration::from_millis(20),
    };
    let store = SessionStore::open(config).expect("open store");

    let _held = store.acquire("agent:A1:channel:C").await.expect("acquire");
    let waited = store.acquire("agent:A1:channel:C").await;
    assert!(matches!(waited, Err(SessionError::LockContention { .. })));
}

#[tokio::test]
async fn malformed_trailing_line_is_dropped_on_read() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let store = store(tempdir.path());

    let mut handle = store.acquire("k").await.expect("acquire");
    handle.append_turn(Turn::user("hello"));
    handle.persist().expect("persist");
    drop(handle);

    // Simulate a crash mid-append: a truncated JSON line at the tail.
    let path = session_record_path(tempdir.path(), "k");
    let mut raw = std::fs::read_to_string(&path).expect("read");
    raw.push_str("{\"record_type\":\"turn\",\"turn\":{\"role\":\"assist");
    std::fs::write(&path, raw).expect("write");

    let handle = store.acquire("k").await.expect("reacquire");
    assert_eq!(handle.turns().len(), 1);
    assert_eq!(handle.repair_report().dropped_malformed_lines, 1);
    assert!(!handle.is_degraded());
}

#[tokio::test]
async fn orphan_tool_result_is_dropped_and_unanswered_call_is_paired() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let store = store(tempdir.path());

    let mut handle = store.acquire("k").await.expect("acquire");
    handle.append_turn(Turn::user("run the tool"));
    handle.append_turn(Turn::tool_result("ghost-call", "lookup", "orphaned", false));
    handle.append_turn(assistant_with_call("call-1", "lookup"));
    handle.persist().expect("persist");
    drop(handle);

    let handle = store.acquire("k").await.expect("reacquire");
    let report = handle.repair_report();
    assert_eq!(report.dropped_orphan_results, 1);
    assert_eq!(report.injected_error_results, 1);

    let last = handle.turns().last().expect("last turn");
    assert_eq!(last.tool_call_id.as_deref(), Some("call-1"));
    assert!(last.is_error);
}

#[tokio::test]
async fn unreadable_record_degrades_to_empty() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let store = store(tempdir.path());

    let path = session_record_path(tempdir.path(), "k");
    std::fs::write(&path, "{\"not\":\"a session record\"}\n").expect("write garbage");

    let handle = store.acquire("k").await.expect("acquire");
    assert!(handle.turns().is_empty());
    assert!(handle.is_degraded());
}

#[tokio::test]
async fn turn_window_truncates_oldest_preserving_pairing() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let mut config = SessionStoreConfig::new(tempdir.path());
    config.max_turns = 3;
    let store = SessionStore::open(config).expect("open store");

    let mut handle = store.acquire("k").await.expect("acquire");
    handle.append_turn(Turn::user("one"));
    handle.append_turn(assistant_with_call("call-1", "lookup"));
    handle.append_turn(Turn::tool_result("call-1", "lookup", "found it", false));
    handle.append_turn(Turn::assistant_text("answer"));
    handle.append_turn(Turn::user("two"));
    handle.persist().expect("persist");
    drop(handle);

    let handle = store.acquire("k").await.expect("reacquire");
    // A window of 3 would start at the tool result; the start advances past
    // it so no pair is split.
    assert_eq!(handle.turns().len(), 2);
    assert_eq!(handle.turns()[0].text_content(), "answer");
    assert!(handle.repair_report().truncated_turns > 0);
}

#[tokio::test]
async fn crash_mid_write_leaves_old_record_visible() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let store = store(tempdir.path());

    let mut handle = store.acquire("k").await.expect("acquire");
    handle.append_turn(Turn::user("durable"));
    handle.persist().expect("persist");
    drop(handle);

    // A crash before rename leaves only a temp file behind; the promoted
    // record must still read back complete.
    let orphan_temp = tempdir.path().join(".k.jsonl.tmp-999-123");
    std::fs::write(&orphan_temp, "half a reco").expect("write temp");

    let handle = store.acquire("k").await.expect("reacquire");
    assert_eq!(handle.turns().len(), 1);
    assert_eq!(handle.turns()[0].text_content(), "durable");
}

#[tokio::test]
async fn prune_removes_record_and_validate_reports_structure() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let store = store(tempdir.path());

    let mut handle = store.acquire("k").await.expect("acquire");
    handle.append_turn(Turn::user("hello"));
    handle.persist().expect("persist");
    drop(handle);

    let report = store.validate("k");
    assert!(report.is_valid());
    assert_eq!(report.turns, 1);

    assert!(store.prune("k").await.expect("prune"));
    assert!(!store.prune("k").await.expect("prune again"));
    assert!(store.list_session_keys().expect("list").is_empty());
}

#[tokio::test]
async fn list_session_keys_recovers_original_keys() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let store = store(tempdir.path());

    for key in ["agent:A1:channel:C", "agent:A1:channel:C:peer:alice"] {
        let handle = store.acquire(key).await.expect("acquire");
        handle.persist().expect("persist");
    }

    let keys = store.list_session_keys().expect("list");
    assert_eq!(
        keys,
        vec![
            "agent:A1:channel:C".to_string(),
            "agent:A1:channel:C:peer:alice".to_string()
        ]
    );
}
