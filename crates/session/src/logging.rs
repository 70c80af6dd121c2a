//! Per-turn structured log.
//!
//! Every finished turn produces one JSON record, emitted through tracing and
//! optionally appended to a JSONL file.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::types::TurnMode;

/// Tracing target for turn records.
pub const TURN_LOG_TARGET: &str = "agentchat_turn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub ts: DateTime<Utc>,
    pub mode: TurnMode,
    pub status: TurnStatus,
    pub steps: usize,
    pub citations: usize,
    pub tokens: usize,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TurnRecord {
    pub fn new(mode: TurnMode, status: TurnStatus, duration_ms: u64) -> Self {
        Self {
            ts: Utc::now(),
            mode,
            status,
            steps: 0,
            citations: 0,
            tokens: 0,
            duration_ms,
            error: None,
        }
    }
}

pub struct TurnLogger {
    log_path: Option<PathBuf>,
    count: RwLock<u64>,
}

impl TurnLogger {
    /// With `None`, records only go to tracing.
    pub fn new(log_path: Option<PathBuf>) -> Self {
        Self {
            log_path,
            count: RwLock::new(0),
        }
    }

    pub async fn log(&self, record: &TurnRecord) {
        let json = serde_json::to_string(record).unwrap_or_else(|e| {
            format!(
                r#"{{"error":"serialization failed: {}","ts":"{}"}}"#,
                e,
                Utc::now().to_rfc3339()
            )
        });

        tracing::info!(target: TURN_LOG_TARGET, "{}", json);

        if let Some(ref path) = self.log_path {
            if let Err(e) = append_log_line(path, &json).await {
                tracing::warn!(path = %path.display(), "Failed to write turn log: {}", e);
            }
        }

        *self.count.write().await += 1;
    }

    pub async fn turn_count(&self) -> u64 {
        *self.count.read().await
    }
}

async fn append_log_line(path: &Path, line: &str) -> Result<(), std::io::Error> {
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}
