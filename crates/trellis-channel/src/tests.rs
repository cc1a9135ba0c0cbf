use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::*;

struct ScriptedAdapter {
    limit: usize,
    failures_before_success: AtomicUsize,
    retryable: bool,
    sent: Mutex<Vec<String>>,
}

impl ScriptedAdapter {
    fn reliable(limit: usize) -> Self {
        Self {
            limit,
            failures_before_success: AtomicUsize::new(0),
            retryable: true,
            sent: Mutex::new(Vec::new()),
        }
    }

    fn failing(failures: usize, retryable: bool) -> Self {
        Self {
            limit: 4_000,
            failures_before_success: AtomicUsize::new(failures),
            retryable,
            sent: Mutex::new(Vec::new()),
        }
    }

    fn sent_chunks(&self) -> Vec<String> {
        self.sent.lock().expect("sent lock").clone()
    }
}

#[async_trait]
impl ChannelAdapter for ScriptedAdapter {
    fn channel_id(&self) -> &str {
        "scripted"
    }

    fn chunk_limit(&self) -> usize {
        self.limit
    }

    async fn send(
        &self,
        _target: &DeliveryTarget,
        chunk: &str,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let remaining = self.failures_before_success.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_before_success
                .store(remaining - 1, Ordering::SeqCst);
            return Err(if self.retryable {
                DeliveryError::retryable("rate_limited", "slow down")
            } else {
                DeliveryError::permanent("forbidden", "bot was removed")
            });
        }
        let mut sent = self.sent.lock().expect("sent lock");
        sent.push(chunk.to_string());
        Ok(DeliveryReceipt {
            message_id: format!("msg-{}", sent.len()),
            timestamp: Utc::now(),
        })
    }
}

fn fast_config() -> OutboundDeliveryConfig {
    OutboundDeliveryConfig {
        dedupe_window_ms: 1_000,
        max_send_attempts: 3,
        retry_backoff_min: Duration::from_millis(1),
        retry_backoff_max: Duration::from_millis(2),
        state_dir: None,
    }
}

fn target() -> DeliveryTarget {
    DeliveryTarget {
        channel_id: "scripted".to_string(),
        peer_id: "alice".to_string(),
        guild_id: None,
    }
}

#[test]
fn chunk_text_prefers_line_boundaries() {
    let text = "first line\nsecond line\nthird";
    let chunks = chunk_text(text, 12);
    assert_eq!(chunks, vec!["first line", "second line", "third"]);
}

#[test]
fn chunk_text_hard_splits_overlong_lines() {
    let text = "abcdefghij";
    let chunks = chunk_text(text, 4);
    assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
}

#[test]
fn chunk_text_empty_input_yields_no_chunks() {
    assert!(chunk_text("", 10).is_empty());
    assert!(chunk_text("   \n", 10).is_empty());
}

#[tokio::test]
async fn deliver_splits_and_sends_every_chunk() {
    let adapter = ScriptedAdapter::reliable(12);
    let delivery = OutboundDelivery::new(fast_config());
    let report = delivery
        .deliver(&adapter, &target(), "first line\nsecond line")
        .await
        .expect("deliver");
    assert_eq!(report.chunk_count, 2);
    assert_eq!(report.receipts.len(), 2);
    assert_eq!(adapter.sent_chunks(), vec!["first line", "second line"]);
}

#[tokio::test]
async fn deliver_retries_retryable_failures_then_succeeds() {
    let adapter = ScriptedAdapter::failing(2, true);
    let delivery = OutboundDelivery::new(fast_config());
    let report = delivery
        .deliver(&adapter, &target(), "hello")
        .await
        .expect("deliver");
    assert_eq!(report.receipts.len(), 1);
    assert_eq!(adapter.sent_chunks(), vec!["hello"]);
}

#[tokio::test]
async fn deliver_gives_up_after_max_attempts() {
    let adapter = ScriptedAdapter::failing(10, true);
    let delivery = OutboundDelivery::new(fast_config());
    let error = delivery
        .deliver(&adapter, &target(), "hello")
        .await
        .expect_err("should fail");
    assert_eq!(error.code, "rate_limited");
    assert!(adapter.sent_chunks().is_empty());
}

#[tokio::test]
async fn deliver_does_not_retry_permanent_failures() {
    let adapter = ScriptedAdapter::failing(1, false);
    let delivery = OutboundDelivery::new(fast_config());
    let error = delivery
        .deliver(&adapter, &target(), "hello")
        .await
        .expect_err("should fail");
    assert_eq!(error.code, "forbidden");
    // One failure scripted; a retry would have succeeded, proving none happened.
    assert!(adapter.sent_chunks().is_empty());
}

#[tokio::test]
async fn deliver_dedupes_identical_payload_within_window() {
    let adapter = ScriptedAdapter::reliable(4_000);
    let delivery = OutboundDelivery::new(fast_config());
    delivery
        .deliver(&adapter, &target(), "same text")
        .await
        .expect("first deliver");
    let second = delivery
        .deliver(&adapter, &target(), "same text")
        .await
        .expect("second deliver");
    assert_eq!(second.deduped_chunks, 1);
    assert!(second.receipts.is_empty());
    assert_eq!(adapter.sent_chunks().len(), 1);
}

#[tokio::test]
async fn deliver_writes_receipt_log_records() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let mut config = fast_config();
    config.state_dir = Some(tempdir.path().to_path_buf());
    let adapter = ScriptedAdapter::reliable(4_000);
    let delivery = OutboundDelivery::new(config);
    delivery
        .deliver(&adapter, &target(), "logged")
        .await
        .expect("deliver");

    let log = std::fs::read_to_string(tempdir.path().join("delivery-receipts.jsonl"))
        .expect("receipt log");
    assert_eq!(log.lines().count(), 1);
    assert!(log.contains("\"record_type\":\"delivered\""));
}
