//! Write-ahead log for the queue shard: newline-delimited JSON, append-only, never rewritten
//! (SPEC_FULL.md §6.3).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::queue::Message;

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type")]
enum WalRecord {
    #[serde(rename = "ENQUEUE")]
    Enqueue { payload: Message },
    #[serde(rename = "ACK")]
    Ack { msg_id: String },
}

/// Flushes the buffered line to disk every 100ms, or immediately once the buffer reaches 1MiB
/// (SPEC_FULL.md §4.5). `immediate` mode bypasses batching entirely: every append is written and
/// fsynced before returning, for tests that need a deterministic on-disk state.
pub struct Wal {
    path: PathBuf,
    file: Mutex<File>,
    buffer: Mutex<Vec<u8>>,
    immediate: bool,
}

pub const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);
pub const FLUSH_THRESHOLD_BYTES: usize = 1024 * 1024;

impl Wal {
    pub async fn open(path: impl Into<PathBuf>, immediate: bool) -> Result<Self, WalError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            buffer: Mutex::new(Vec::new()),
            immediate,
        })
    }

    pub async fn append_enqueue(&self, message: &Message) -> Result<(), WalError> {
        self.append_record(&WalRecord::Enqueue {
            payload: message.clone(),
        })
        .await
    }

    pub async fn append_ack(&self, msg_id: &str) -> Result<(), WalError> {
        self.append_record(&WalRecord::Ack {
            msg_id: msg_id.to_string(),
        })
        .await
    }

    async fn append_record(&self, record: &WalRecord) -> Result<(), WalError> {
        let mut line = serde_json::to_vec(record).expect("wal record always serializes");
        line.push(b'\n');

        if self.immediate {
            let mut file = self.file.lock().await;
            file.write_all(&line).await?;
            file.flush().await?;
            file.sync_data().await?;
            return Ok(());
        }

        let mut buffer = self.buffer.lock().await;
        buffer.extend_from_slice(&line);
        if buffer.len() >= FLUSH_THRESHOLD_BYTES {
            let to_write = std::mem::take(&mut *buffer);
            drop(buffer);
            self.write_bytes(&to_write).await?;
        }
        Ok(())
    }

    /// Flushes the buffered lines. Called both by the periodic flusher task and directly when the
    /// size threshold is crossed inline with an append.
    pub async fn flush(&self) -> Result<(), WalError> {
        let mut buffer = self.buffer.lock().await;
        if buffer.is_empty() {
            return Ok(());
        }
        let to_write = std::mem::take(&mut *buffer);
        drop(buffer);
        self.write_bytes(&to_write).await
    }

    async fn write_bytes(&self, bytes: &[u8]) -> Result<(), WalError> {
        let mut file = self.file.lock().await;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(())
    }

    /// Spawns the periodic flusher task (§4.5, §5: "Queue WAL flusher (100 ms)").
    pub fn spawn_flusher(self: &std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        let wal = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(err) = wal.flush().await {
                    tracing::warn!(?err, "wal flush failed");
                }
            }
        })
    }

    /// Replays the WAL to reconstruct per-queue FIFOs, per SPEC_FULL.md §4.5's recovery
    /// algorithm: every ENQUEUEd message not later ACKed is appended to its queue, in the order
    /// it was first seen. A corrupt trailing line (a crash mid-write) is dropped silently; a
    /// corrupt line elsewhere in the file is a programmer-invariant violation (the WAL is
    /// append-only) and recovery stops there, returning what was parsed up to that point.
    pub async fn recover(&self) -> Result<std::collections::HashMap<String, Vec<Message>>, WalError> {
        use std::collections::HashMap;

        let mut contents = String::new();
        match File::open(&self.path).await {
            Ok(mut file) => {
                file.read_to_string(&mut contents).await?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HashMap::new());
            }
            Err(err) => return Err(err.into()),
        }

        let mut per_queue_enqueued: HashMap<String, Vec<Message>> = HashMap::new();
        let mut acked: std::collections::HashSet<String> = std::collections::HashSet::new();

        let lines: Vec<&str> = contents.lines().collect();
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WalRecord>(line) {
                Ok(WalRecord::Enqueue { payload }) => {
                    per_queue_enqueued
                        .entry(payload.queue.clone())
                        .or_default()
                        .push(payload);
                }
                Ok(WalRecord::Ack { msg_id }) => {
                    acked.insert(msg_id);
                }
                Err(err) => {
                    let is_last = i + 1 == lines.len();
                    if is_last {
                        tracing::warn!(?err, "dropping truncated trailing wal line");
                        break;
                    }
                    tracing::error!(?err, line = i, "wal corruption mid-file, stopping recovery");
                    break;
                }
            }
        }

        let mut queues: HashMap<String, Vec<Message>> = HashMap::new();
        for (queue, messages) in per_queue_enqueued {
            let live: Vec<Message> = messages
                .into_iter()
                .filter(|m| !acked.contains(&m.id))
                .collect();
            queues.insert(queue, live);
        }
        Ok(queues)
    }
}
