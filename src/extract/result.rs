//! Batch extraction results

use serde::Serialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::ErrorKind;

/// Outcome for one image, in input order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PerImageOutcome {
    Text(String),
    Failure { kind: ErrorKind, message: String },
}

impl PerImageOutcome {
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        PerImageOutcome::Failure {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn cancelled() -> Self {
        Self::failure(ErrorKind::Cancelled, "batch cancelled before this image was processed")
    }

    pub fn is_text(&self) -> bool {
        matches!(self, PerImageOutcome::Text(_))
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            PerImageOutcome::Text(text) => Some(text),
            PerImageOutcome::Failure { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            PerImageOutcome::Text(_) => None,
            PerImageOutcome::Failure { kind, .. } => Some(*kind),
        }
    }
}

/// One image's outcome with its provenance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionEntry {
    pub source_path: PathBuf,
    pub outcome: PerImageOutcome,
}

/// Whether every image was attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Completed,
    Cancelled,
}

/// Aggregated output of one batch.
///
/// Holds exactly one entry per input image, in input order.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionResult {
    batch_id: Uuid,
    status: BatchStatus,
    elapsed_ms: u64,
    entries: Vec<ExtractionEntry>,
}

impl ExtractionResult {
    pub(crate) fn new(batch_id: Uuid, entries: Vec<ExtractionEntry>, elapsed_ms: u64) -> Self {
        let cancelled = entries
            .iter()
            .any(|e| e.outcome.error_kind() == Some(ErrorKind::Cancelled));
        Self {
            batch_id,
            status: if cancelled {
                BatchStatus::Cancelled
            } else {
                BatchStatus::Completed
            },
            elapsed_ms,
            entries,
        }
    }

    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }

    /// Wall-clock processing time
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    pub fn entries(&self) -> &[ExtractionEntry] {
        &self.entries
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &PerImageOutcome> {
        self.entries.iter().map(|e| &e.outcome)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn text_count(&self) -> usize {
        self.outcomes().filter(|o| o.is_text()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.len() - self.text_count()
    }

    /// True when every image produced text
    pub fn is_complete(&self) -> bool {
        self.status == BatchStatus::Completed && self.failure_count() == 0
    }

    /// Single display string: text outcomes joined by newlines, failures as
    /// marked error lines
    pub fn to_display_string(&self) -> String {
        self.entries
            .iter()
            .map(|entry| match &entry.outcome {
                PerImageOutcome::Text(text) => text.trim_end_matches(['\r', '\n']).to_string(),
                PerImageOutcome::Failure { kind, message } => {
                    failure_line(*kind, &entry.source_path, message)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn failure_line(kind: ErrorKind, path: &Path, message: &str) -> String {
    format!("[{} error] {}: {}", kind, path.display(), message)
}
