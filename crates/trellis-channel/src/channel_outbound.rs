//! Outbound delivery pipeline: chunking, dedupe, bounded retry, receipts.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use trellis_core::{current_unix_timestamp_ms, BoundedBackoff};

use crate::channel_contract::{ChannelAdapter, DeliveryError, DeliveryReceipt, DeliveryTarget};

const RECEIPT_LOG_FILE_NAME: &str = "delivery-receipts.jsonl";

#[derive(Debug, Clone)]
/// Tunables for the outbound pipeline.
pub struct OutboundDeliveryConfig {
    /// Identical payloads to the same target inside this window are dropped.
    pub dedupe_window_ms: u64,
    pub max_send_attempts: usize,
    pub retry_backoff_min: Duration,
    pub retry_backoff_max: Duration,
    /// State directory holding the receipt log; `None` disables the log.
    pub state_dir: Option<PathBuf>,
}

impl Default for OutboundDeliveryConfig {
    fn default() -> Self {
        Self {
            dedupe_window_ms: 1_000,
            max_send_attempts: 3,
            retry_backoff_min: Duration::from_millis(250),
            retry_backoff_max: Duration::from_secs(5),
            state_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
/// Outcome of delivering one text through an adapter.
pub struct OutboundReport {
    pub chunk_count: usize,
    pub deduped_chunks: usize,
    pub receipts: Vec<DeliveryReceipt>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "record_type", rename_all = "snake_case")]
enum ReceiptRecord {
    Delivered {
        unix_ms: u64,
        target: DeliveryTarget,
        message_id: String,
        attempts: usize,
    },
    Failed {
        unix_ms: u64,
        target: DeliveryTarget,
        code: String,
        message: String,
        attempts: usize,
    },
}

/// Sends agent output through a channel adapter with dedupe and retry.
pub struct OutboundDelivery {
    config: OutboundDeliveryConfig,
    recent_sends: Mutex<HashMap<(DeliveryTarget, String), u64>>,
}

impl OutboundDelivery {
    pub fn new(config: OutboundDeliveryConfig) -> Self {
        Self {
            config,
            recent_sends: Mutex::new(HashMap::new()),
        }
    }

    /// Chunks `text`, drops duplicates inside the dedupe window, sends each
    /// chunk with bounded retries, and records every result. A failed chunk
    /// aborts the remainder so ordering is never scrambled by partial resend.
    pub async fn deliver(
        &self,
        adapter: &dyn ChannelAdapter,
        target: &DeliveryTarget,
        text: &str,
    ) -> Result<OutboundReport, DeliveryError> {
        let chunks = chunk_text(text, adapter.chunk_limit());
        let mut report = OutboundReport {
            chunk_count: chunks.len(),
            ..OutboundReport::default()
        };

        for chunk in &chunks {
            if self.is_duplicate(target, chunk) {
                debug!(
                    channel_id = adapter.channel_id(),
                    "dropping duplicate outbound chunk inside dedupe window"
                );
                report.deduped_chunks += 1;
                continue;
            }
            let (receipt, attempts) = self.send_with_retry(adapter, target, chunk).await?;
            self.record_receipt(ReceiptRecord::Delivered {
                unix_ms: current_unix_timestamp_ms(),
                target: target.clone(),
                message_id: receipt.message_id.clone(),
                attempts,
            });
            report.receipts.push(receipt);
        }

        Ok(report)
    }

    async fn send_with_retry(
        &self,
        adapter: &dyn ChannelAdapter,
        target: &DeliveryTarget,
        chunk: &str,
    ) -> Result<(DeliveryReceipt, usize), DeliveryError> {
        let mut backoff =
            BoundedBackoff::new(self.config.retry_backoff_min, self.config.retry_backoff_max);
        let max_attempts = self.config.max_send_attempts.max(1);
        let mut attempts = 0usize;

        loop {
            attempts += 1;
            match adapter.send(target, chunk).await {
                Ok(receipt) => return Ok((receipt, attempts)),
                Err(error) if error.retryable && attempts < max_attempts => {
                    warn!(
                        channel_id = adapter.channel_id(),
                        code = error.code.as_str(),
                        attempts,
                        "outbound send failed, retrying"
                    );
                    tokio::time::sleep(backoff.next_delay()).await;
                }
                Err(error) => {
                    warn!(
                        channel_id = adapter.channel_id(),
                        code = error.code.as_str(),
                        attempts,
                        "outbound send exhausted retries"
                    );
                    self.record_receipt(ReceiptRecord::Failed {
                        unix_ms: current_unix_timestamp_ms(),
                        target: target.clone(),
                        code: error.code.clone(),
                        message: error.message.clone(),
                        attempts,
                    });
                    return Err(error);
                }
            }
        }
    }

    fn is_duplicate(&self, target: &DeliveryTarget, chunk: &str) -> bool {
        let hash = format!("{:x}", Sha256::digest(chunk.as_bytes()));
        let now = current_unix_timestamp_ms();
        let mut recent = self
            .recent_sends
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        recent.retain(|_, sent_at| now.saturating_sub(*sent_at) <= self.config.dedupe_window_ms);
        let key = (target.clone(), hash);
        match recent.get(&key) {
            Some(_) => true,
            None => {
                recent.insert(key, now);
                false
            }
        }
    }

    fn record_receipt(&self, record: ReceiptRecord) {
        let Some(state_dir) = self.config.state_dir.as_ref() else {
            return;
        };
        if let Err(error) = append_receipt_record(state_dir, &record) {
            warn!(error = %error, "failed to append delivery receipt record");
        }
    }
}

fn append_receipt_record(state_dir: &std::path::Path, record: &ReceiptRecord) -> Result<()> {
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create {}", state_dir.display()))?;
    let path = state_dir.join(RECEIPT_LOG_FILE_NAME);
    let line = serde_json::to_string(record).context("failed to serialize receipt record")?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to append to {}", path.display()))?;
    Ok(())
}

/// Splits text into chunks of at most `max_chars`, preferring line breaks and
/// falling back to a hard character split for overlong lines.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let trimmed = text.trim_end();
    if trimmed.is_empty() || max_chars == 0 {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in trimmed.split_inclusive('\n') {
        let line_len = line.chars().count();
        if line_len > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            chunks.extend(hard_split(line, max_chars));
            continue;
        }
        if current_len + line_len > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current.push_str(line);
        current_len += line_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
        .into_iter()
        .map(|chunk| chunk.trim_end().to_string())
        .filter(|chunk| !chunk.is_empty())
        .collect()
}

fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    for ch in text.chars() {
        current.push(ch);
        current_len += 1;
        if current_len >= max_chars {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
