//! # edgequake-ocr
//!
//! Extract plain text from scanned or digitally-authored documents, one page
//! at a time, with a confidence score per page.
//!
//! A document is submitted as bytes and gets a [`JobId`] straight away. In
//! the background each page is rasterised, recognised by an
//! [`OcrEngine`](pipeline::ocr::OcrEngine), and the results are assembled in
//! page order. Callers poll [`DocumentPipeline::get_result`], watch a stream
//! of snapshots, or simply `wait`.
//!
//! ## Pipeline Overview
//!
//! ```text
//! bytes
//!  │
//!  ├─ 1. Submit     register job (Received), return JobId
//!  ├─ 2. Rasterise  pdfium / image → page bitmaps      (Rasterizing)
//!  ├─ 3. Recognise  OCR per page on the worker pool     (Processing)
//!  ├─ 4. Aggregate  order by page index, compute stats  (Aggregating)
//!  └─ 5. Retain     frozen result in the registry       (Completed | Failed)
//! ```
//!
//! Rasterisation and recognition share one bounded worker pool across every
//! in-flight document. A page that keeps failing is reported on its own; the
//! job only fails when no page succeeds.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_ocr::{
//!     DocumentPipeline, PipelineConfig, StandardRasterizer, SubmitOptions,
//!     VisionOcrConfig, VisionOcrEngine,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let engine = VisionOcrEngine::new(VisionOcrConfig::default())?;
//!     let pipeline = DocumentPipeline::new(
//!         PipelineConfig::default(),
//!         Arc::new(StandardRasterizer::new()),
//!         Arc::new(engine),
//!     )?;
//!
//!     let result = pipeline
//!         .process(std::fs::read("scan.pdf")?, SubmitOptions::default())
//!         .await?;
//!     println!("{}", result.text("\n\n"));
//!     eprintln!("mean confidence: {:?}", result.stats.mean_confidence);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdfocr` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-ocr = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod pool;
pub mod prompts;
pub mod registry;
pub mod state;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder, VisionOcrConfig, VisionOcrConfigBuilder};
pub use error::{
    DocumentError, InputError, JobError, OcrError, PageError, RasterError, ServiceError,
};
pub use output::{
    DocumentResult, DocumentStats, JobId, JobOutcome, JobSnapshot, PageResult, PageStatus,
};
pub use pipeline::document::{Document, DocumentPipeline, SubmitOptions};
pub use pipeline::ocr::{
    ExclusiveOcrEngine, OcrEngine, Recognition, SerializedEngine, VisionOcrEngine,
};
pub use pipeline::render::{PageImage, PageSink, RasterOptions, Rasterizer, StandardRasterizer};
pub use pool::{PoolError, WorkerPool};
pub use registry::{JobRegistry, StatePayload};
pub use state::{JobState, PageState};
pub use stream::JobUpdates;
