//! Result types handed back to callers.
//!
//! Everything here is `Serialize` so a front-end can return it verbatim as
//! JSON. Results are wrapped in `Arc` by the registry once terminal and never
//! mutated afterwards.

use crate::error::{DocumentError, PageError};
use crate::state::{JobState, PageState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Unique identifier of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// A fresh random (v4) identifier.
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(JobId)
    }
}

/// Terminal status of one page inside a completed document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Completed,
    Failed,
}

/// Result for a single page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    /// 0-based page index.
    pub index: usize,
    pub status: PageStatus,
    /// Recognised text. Empty for blank and failed pages.
    pub text: String,
    /// Engine confidence in `[0, 1]`. Zero for blank and failed pages.
    pub confidence: f32,
    /// `true` when the engine reported no recognisable text.
    pub empty: bool,
    /// OCR attempts made (1 = first try succeeded).
    pub attempts: u32,
    /// Wall-clock time from first attempt to terminal state.
    pub duration_ms: u64,
    pub error: Option<PageError>,
}

impl PageResult {
    pub fn is_success(&self) -> bool {
        self.status == PageStatus::Completed
    }
}

/// Aggregate statistics for a completed document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentStats {
    pub total_pages: usize,
    pub succeeded_pages: usize,
    pub failed_pages: usize,
    /// Succeeded pages with no recognisable text.
    pub empty_pages: usize,
    /// Mean confidence over succeeded, non-empty pages.
    pub mean_confidence: Option<f32>,
    pub raster_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// Ordered per-page output of a `Completed` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentResult {
    /// Exactly one entry per page, ordered by `index`.
    pub pages: Vec<PageResult>,
    pub stats: DocumentStats,
}

impl DocumentResult {
    /// Join the text of every successful page with `separator`.
    pub fn text(&self, separator: &str) -> String {
        self.pages
            .iter()
            .filter(|p| p.is_success())
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join(separator)
    }
}

/// What a terminal job carries: a result or an error, never neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed(DocumentResult),
    Failed(DocumentError),
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Completed(_) => JobState::Completed,
            JobOutcome::Failed(_) => JobState::Failed,
        }
    }

    pub fn result(&self) -> Option<&DocumentResult> {
        match self {
            JobOutcome::Completed(r) => Some(r),
            JobOutcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&DocumentError> {
        match self {
            JobOutcome::Completed(_) => None,
            JobOutcome::Failed(e) => Some(e),
        }
    }
}

/// Point-in-time view of a registry entry.
///
/// `outcome` is `Some` exactly when `state` is terminal.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Page count once rasterisation has declared it.
    pub page_count: Option<usize>,
    /// Progress of every page produced so far, by index.
    pub pages: Vec<PageState>,
    pub outcome: Option<Arc<JobOutcome>>,
}

impl JobSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Pages that have reached a terminal state.
    pub fn finished_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.is_terminal()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(index: usize, text: &str, ok: bool) -> PageResult {
        PageResult {
            index,
            status: if ok {
                PageStatus::Completed
            } else {
                PageStatus::Failed
            },
            text: text.to_string(),
            confidence: if ok { 0.9 } else { 0.0 },
            empty: text.is_empty(),
            attempts: 1,
            duration_ms: 0,
            error: None,
        }
    }

    #[test]
    fn text_skips_failed_pages() {
        let doc = DocumentResult {
            pages: vec![page(0, "one", true), page(1, "", false), page(2, "three", true)],
            stats: DocumentStats::default(),
        };
        assert_eq!(doc.text("\n\n"), "one\n\nthree");
    }

    #[test]
    fn job_id_round_trips_through_display() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn outcome_state_matches_variant() {
        let failed = JobOutcome::Failed(DocumentError::Cancelled);
        assert_eq!(failed.state(), JobState::Failed);
        assert!(failed.result().is_none());
        assert_eq!(failed.error(), Some(&DocumentError::Cancelled));
    }
}
