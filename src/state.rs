//! Job and page state machines.
//!
//! ```text
//! Received ──▶ Rasterizing ──▶ Processing ──▶ Aggregating ──▶ Completed
//!    │              │               │               │
//!    └──────────────┴───────────────┴───────────────┴──────▶ Failed
//! ```
//!
//! Transitions are checked by a pure function so every edge can be tested
//! without rasterising or recognising anything.

use serde::{Deserialize, Serialize};

/// Lifecycle of a submitted document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Registered; bytes stored.
    Received,
    /// Rasteriser running; no page produced yet.
    Rasterizing,
    /// Pages are being recognised.
    Processing,
    /// All pages terminal; assembling the ordered result.
    Aggregating,
    Completed,
    Failed,
}

impl JobState {
    /// `true` for `Completed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// Only forward edges of the pipeline are legal, and any non-terminal
    /// state may fail. Self-transitions are rejected.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Received, Rasterizing)
                | (Rasterizing, Processing)
                | (Processing, Aggregating)
                | (Aggregating, Completed)
                | (Received | Rasterizing | Processing | Aggregating, Failed)
        )
    }

    /// Pure transition function: the new state, or `None` when illegal.
    pub fn transition(self, next: JobState) -> Option<JobState> {
        self.can_transition_to(next).then_some(next)
    }
}

/// Lifecycle of a single page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl PageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PageState::Completed | PageState::Failed)
    }

    pub fn can_transition_to(self, next: PageState) -> bool {
        use PageState::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Processing, Completed) | (Processing, Failed)
        )
    }
}
