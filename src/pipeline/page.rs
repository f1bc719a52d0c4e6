//! Page processor: drive OCR for one page with retry.
//!
//! ## Retry Strategy
//!
//! Engine failures are treated as transient (rate limits, timeouts, a
//! flaky native library). Exponential backoff (`retry_backoff_ms *
//! 2^(retry-1)`) spreads retries out: with a 500 ms base and 2 retries the
//! wait sequence is 500 ms → 1 s. No worker is held while backing off.
//!
//! A page that exhausts its retries is marked `Failed` on its own; sibling
//! pages are never aborted.

use crate::config::PipelineConfig;
use crate::error::PageError;
use crate::output::{JobId, PageResult, PageStatus};
use crate::pipeline::ocr::{OcrEngine, Recognition};
use crate::pipeline::render::PageImage;
use crate::pool::{PoolError, WorkerPool};
use crate::registry::JobRegistry;
use crate::state::PageState;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What became of a page.
#[derive(Debug)]
pub enum PageOutcome {
    /// Reached `Completed` or `Failed`.
    Finished(PageResult),
    /// Not run to completion because the job was cancelled or the pool shut
    /// down. The result, if any, is discarded.
    Skipped { index: usize },
}

/// Shared by every page of every document.
#[derive(Clone)]
pub struct PageProcessor {
    engine: Arc<dyn OcrEngine>,
    pool: WorkerPool,
    registry: Arc<JobRegistry>,
    config: Arc<PipelineConfig>,
}

impl PageProcessor {
    pub fn new(
        engine: Arc<dyn OcrEngine>,
        pool: WorkerPool,
        registry: Arc<JobRegistry>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            engine,
            pool,
            registry,
            config,
        }
    }

    /// Recognise `page`, retrying engine failures up to `max_retries` times.
    ///
    /// The image is moved into each worker call and handed back, so exactly
    /// one thread owns it at any time. It is dropped on every return path.
    pub async fn process(
        &self,
        job: JobId,
        page: PageImage,
        cancel: &CancellationToken,
    ) -> PageOutcome {
        let index = page.index;
        if cancel.is_cancelled() {
            return PageOutcome::Skipped { index };
        }

        self.report(job, index, PageState::Processing);
        let start = Instant::now();
        let max_attempts = self.config.max_retries + 1;
        let mut page = page;
        let mut last_err = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let backoff = self.config.backoff_for(attempt - 1);
                warn!(
                    "Page {}: retry {}/{} after {}ms",
                    index + 1,
                    attempt - 1,
                    self.config.max_retries,
                    backoff.as_millis()
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return PageOutcome::Skipped { index },
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            let engine = Arc::clone(&self.engine);
            let run = self
                .pool
                .run(cancel, move || {
                    let result = engine.recognize(&page.image);
                    (page, result)
                })
                .await;

            let result = match run {
                Ok((returned, result)) => {
                    page = returned;
                    result
                }
                Err(PoolError::Cancelled | PoolError::Closed) => {
                    return PageOutcome::Skipped { index };
                }
                Err(PoolError::Panicked(msg)) => {
                    // The image went down with the worker; nothing to retry with.
                    warn!("Page {}: OCR worker panicked: {}", index + 1, msg);
                    let detail = format!("worker panicked: {msg}");
                    return self.finish_failed(job, index, attempt, start, detail);
                }
            };

            match result {
                Ok(recognition) => {
                    drop(page);
                    return self.finish_ok(job, index, attempt, start, recognition);
                }
                Err(e) => {
                    warn!("Page {}: attempt {} failed: {}", index + 1, attempt, e);
                    last_err = e.to_string();
                }
            }
        }

        drop(page);
        self.finish_failed(job, index, max_attempts, start, last_err)
    }

    fn finish_ok(
        &self,
        job: JobId,
        index: usize,
        attempts: u32,
        start: Instant,
        recognition: Recognition,
    ) -> PageOutcome {
        let (text, confidence, empty) = match recognition {
            Recognition::Text { text, confidence } => (text, confidence.clamp(0.0, 1.0), false),
            Recognition::EmptyPage => (String::new(), 0.0, true),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(
            page = index + 1,
            attempts,
            duration_ms,
            chars = text.len(),
            confidence,
            empty,
            "Page recognised"
        );
        self.report(job, index, PageState::Completed);
        PageOutcome::Finished(PageResult {
            index,
            status: PageStatus::Completed,
            text,
            confidence,
            empty,
            attempts,
            duration_ms,
            error: None,
        })
    }

    fn finish_failed(
        &self,
        job: JobId,
        index: usize,
        attempts: u32,
        start: Instant,
        detail: String,
    ) -> PageOutcome {
        warn!("Page {}: giving up after {} attempts", index + 1, attempts);
        self.report(job, index, PageState::Failed);
        PageOutcome::Finished(PageResult {
            index,
            status: PageStatus::Failed,
            text: String::new(),
            confidence: 0.0,
            empty: false,
            attempts,
            duration_ms: start.elapsed().as_millis() as u64,
            error: Some(PageError::OcrFailed {
                page: index,
                attempts,
                detail,
            }),
        })
    }

    /// Page updates are refused once the job is terminal; that is expected
    /// after a cancel.
    fn report(&self, job: JobId, index: usize, state: PageState) {
        if let Err(e) = self.registry.update_page(job, index, state) {
            debug!("Page {} update ignored: {}", index + 1, e);
        }
    }
}
