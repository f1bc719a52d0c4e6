//! Error types for the edgequake-ocr library.
//!
//! The taxonomy mirrors who can fix a failure:
//!
//! * [`InputError`]: the caller sent something we cannot read (unknown
//!   format, corrupt structure, too many pages). Never retried.
//!
//! * [`OcrError`]: the recognition engine failed on one page. Transient;
//!   retried inside the page processor and, once exhausted, recorded as a
//!   [`PageError`] on that page only.
//!
//! * [`JobError`]: the surrounding system misused the registry (duplicate
//!   id, unknown job, backwards transition). Surfaced as-is.
//!
//! * [`DocumentError`]: the terminal failure attached to a job: an input
//!   error, every page failing, cancellation, or an internal fault.
//!
//! [`ServiceError`] is what the top-level entry points return.

use crate::state::{JobState, PageState};
use crate::JobId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Caller-fixable problems with the submitted document.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputError {
    /// The payload is not a document type we know how to rasterise.
    #[error("Unsupported document format (first bytes: {magic:02x?})")]
    UnsupportedFormat { magic: Vec<u8> },

    /// The header was recognised but structural parsing failed.
    #[error("Document is corrupt: {detail}")]
    CorruptDocument { detail: String },

    /// The declared page count is above the configured maximum.
    #[error("Document declares {declared} pages; the limit is {max}")]
    ResourceExhausted { declared: usize, max: usize },

    /// The document parsed but contains no pages.
    #[error("Document contains no pages")]
    EmptyDocument,
}

/// Failure reported by a [`crate::pipeline::render::Rasterizer`].
#[derive(Debug, Clone, Error)]
pub enum RasterError {
    #[error(transparent)]
    Input(#[from] InputError),

    /// The rendering backend itself is unavailable (e.g. pdfium not bound).
    #[error("Rasteriser backend error: {0}")]
    Backend(String),
}

/// Failure reported by a [`crate::pipeline::ocr::OcrEngine`].
#[derive(Debug, Clone, Error)]
pub enum OcrError {
    /// Internal engine error; treated as transient.
    #[error("OCR engine failure: {detail}")]
    EngineFailure { detail: String },
}

impl OcrError {
    pub fn engine(detail: impl Into<String>) -> Self {
        OcrError::EngineFailure {
            detail: detail.into(),
        }
    }
}

/// A non-fatal error for a single page, stored in its
/// [`crate::output::PageResult`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageError {
    /// OCR failed on every attempt.
    #[error("Page {page}: OCR failed after {attempts} attempts: {detail}")]
    OcrFailed {
        page: usize,
        attempts: u32,
        detail: String,
    },
}

/// Registry misuse. These indicate integration faults and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("Job {0} is already registered")]
    DuplicateJobId(JobId),

    #[error("Job {0} is not registered")]
    UnknownJob(JobId),

    #[error("Job {id}: invalid transition {from:?} → {to:?}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("Job {0} not found (never submitted, removed, or expired)")]
    JobNotFound(JobId),

    /// A page update arrived after the job went terminal.
    #[error("Job {id} is already {state:?}; page updates are rejected")]
    JobFinished { id: JobId, state: JobState },

    #[error("Job {id}, page {page}: invalid transition {from:?} → {to:?}")]
    InvalidPageTransition {
        id: JobId,
        page: usize,
        from: PageState,
        to: PageState,
    },

    /// A terminal transition arrived without a matching outcome.
    #[error("Job {id}: transition to {to:?} requires a matching outcome")]
    MissingOutcome { id: JobId, to: JobState },

    /// Removal was requested while the pipeline is still running.
    #[error("Job {id} is still active ({state:?})")]
    JobActive { id: JobId, state: JobState },
}

/// Terminal failure attached to a job.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DocumentError {
    #[error(transparent)]
    Input(#[from] InputError),

    /// Zero pages succeeded.
    #[error("All {total} pages failed.\nFirst error: {first_error}")]
    AllPagesFailed { total: usize, first_error: String },

    /// The job was cancelled before it finished.
    #[error("Job was cancelled")]
    Cancelled,

    /// Backend or runtime fault (panicked task, unbound rasteriser, …).
    #[error("Internal error: {detail}")]
    Internal { detail: String },
}

impl From<RasterError> for DocumentError {
    fn from(e: RasterError) -> Self {
        match e {
            RasterError::Input(input) => DocumentError::Input(input),
            RasterError::Backend(detail) => DocumentError::Internal { detail },
        }
    }
}

/// All errors returned by the top-level service API.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Job(#[from] JobError),

    /// The job finished in `Failed`.
    #[error("Job {id} failed: {source}")]
    JobFailed {
        id: JobId,
        #[source]
        source: DocumentError,
    },

    /// `submit` was called after `shutdown`.
    #[error("Pipeline is shut down")]
    ShutDown,

    /// The vision provider could not be initialised.
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Input resolution ─────────────────────────────────────────────────
    #[error("Input file not found: '{path}'")]
    FileNotFound { path: std::path::PathBuf },

    #[error("Failed to read '{path}': {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_exhausted_display() {
        let e = InputError::ResourceExhausted {
            declared: 900,
            max: 500,
        };
        let msg = e.to_string();
        assert!(msg.contains("900"), "got: {msg}");
        assert!(msg.contains("500"), "got: {msg}");
    }

    #[test]
    fn backend_raster_error_becomes_internal() {
        let e: DocumentError = RasterError::Backend("no pdfium".into()).into();
        assert_eq!(
            e,
            DocumentError::Internal {
                detail: "no pdfium".into()
            }
        );
    }

    #[test]
    fn input_raster_error_stays_input() {
        let e: DocumentError = RasterError::Input(InputError::EmptyDocument).into();
        assert_eq!(e, DocumentError::Input(InputError::EmptyDocument));
    }

    #[test]
    fn document_error_serialises_with_kind_tag() {
        let e = DocumentError::Input(InputError::CorruptDocument {
            detail: "bad xref".into(),
        });
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains(r#""kind":"input""#), "got: {json}");
        assert!(json.contains("corrupt_document"), "got: {json}");
        let back: DocumentError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn invalid_transition_display() {
        let id = JobId::new();
        let e = JobError::InvalidTransition {
            id,
            from: JobState::Completed,
            to: JobState::Processing,
        };
        let msg = e.to_string();
        assert!(msg.contains("Completed"), "got: {msg}");
        assert!(msg.contains(&id.to_string()), "got: {msg}");
    }
}
