//! Pipeline stages for document OCR.
//!
//! Each submodule implements exactly one step, so each is testable alone and
//! a backend (rasteriser, OCR engine) can be swapped without touching the
//! others.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ page ──▶ ocr ──▶ transcript ──▶ document
//! (bytes)   (pages)   (retry)   (engine) (cleanup)    (aggregate)
//! ```
//!
//! 1. [`input`]:    load a path or URL; sniff the format from magic bytes
//! 2. [`render`]:   rasterise pages into a [`render::PageSink`]; pdfium for
//!    PDF, `image` for single-page raster formats
//! 3. [`page`]:     run OCR for one page on the worker pool with retry
//! 4. [`ocr`]:      the engine seam plus the bundled vision-model engine
//!    ([`encode`] and [`transcript`] are its request and reply halves)
//! 5. [`document`]: the per-job state machine, cancellation and ordered
//!    aggregation

pub mod document;
pub mod encode;
pub mod input;
pub mod ocr;
pub mod page;
pub mod render;
pub mod transcript;
