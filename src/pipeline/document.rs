//! Document pipeline: submit/poll orchestration of rasterise → OCR → aggregate.
//!
//! ## Data flow
//!
//! ```text
//!  submit ─▶ registry (Received)
//!            │
//!            ▼ job task
//!  rasteriser thread ──bounded channel──▶ job task buffers pages (Rasterizing)
//!  (one permit per render)                     │
//!                                              ▼ rasteriser returned Ok
//!                                         page tasks on the pool (Processing)
//!                                              │
//!                                              ▼ join all, slot by index
//!                                         Aggregating ─▶ Completed | Failed
//! ```
//!
//! No page reaches the OCR engine until the whole document has rasterised:
//! a document that turns out to be corrupt on its last page fails without a
//! single recognition call. Each buffered page is capped at
//! `max_rendered_pixels` per edge and the page count at `max_pages`. Once
//! processing starts, at most `workers + page_buffer` page tasks per
//! document are in flight.
//!
//! Each job has its own `CancellationToken`, a child of the pipeline's, so
//! [`DocumentPipeline::shutdown`] stops everything at once.

use crate::config::PipelineConfig;
use crate::error::{DocumentError, InputError, JobError, RasterError, ServiceError};
use crate::output::{DocumentResult, DocumentStats, JobId, JobOutcome, JobSnapshot, PageResult};
use crate::pipeline::ocr::OcrEngine;
use crate::pipeline::page::{PageOutcome, PageProcessor};
use crate::pipeline::render::{PageImage, PageSink, RasterOptions, Rasterizer};
use crate::pool::WorkerPool;
use crate::registry::{JobRegistry, StatePayload};
use crate::state::{JobState, PageState};
use crate::stream::JobUpdates;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// A submitted document. The byte payload is shared, never copied.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: JobId,
    pub bytes: Arc<[u8]>,
    pub dpi: u32,
    /// Known up front only when the caller declared it.
    pub page_count: Option<usize>,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn new(id: JobId, bytes: impl Into<Arc<[u8]>>, dpi: u32) -> Self {
        Self {
            id,
            bytes: bytes.into(),
            dpi,
            page_count: None,
            created_at: Utc::now(),
        }
    }
}

/// Per-submission overrides.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Rasterisation DPI for this document, clamped to 72–600.
    pub dpi: Option<u32>,
}

/// Messages from the rasteriser thread to the job task.
enum RasterEvent {
    Begin(usize),
    Page(PageImage),
}

/// Bridges the blocking rasteriser to the async job task.
///
/// A pool permit is held only while a page renders and is released before
/// the page is handed over, so a full channel never pins a worker that a
/// page task needs.
struct ChannelSink {
    tx: mpsc::Sender<RasterEvent>,
    pool: WorkerPool,
    cancel: CancellationToken,
    options: RasterOptions,
    permit: Option<OwnedSemaphorePermit>,
}

impl PageSink for ChannelSink {
    fn begin(&mut self, page_count: usize) -> Result<(), RasterError> {
        self.options.check_page_count(page_count)?;
        // A closed channel is noticed by the next `before_page`.
        let _ = self.tx.blocking_send(RasterEvent::Begin(page_count));
        Ok(())
    }

    fn before_page(&mut self, _index: usize) -> ControlFlow<()> {
        if self.tx.is_closed() {
            return ControlFlow::Break(());
        }
        match self.pool.acquire_blocking(&self.cancel) {
            Ok(permit) => {
                self.permit = Some(permit);
                ControlFlow::Continue(())
            }
            Err(_) => ControlFlow::Break(()),
        }
    }

    fn page(&mut self, page: PageImage) -> ControlFlow<()> {
        self.permit = None;
        if self.cancel.is_cancelled() {
            return ControlFlow::Break(());
        }
        match self.tx.blocking_send(RasterEvent::Page(page)) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }
}

struct Inner {
    config: Arc<PipelineConfig>,
    rasterizer: Arc<dyn Rasterizer>,
    pages: PageProcessor,
    pool: WorkerPool,
    registry: Arc<JobRegistry>,
    shutdown: CancellationToken,
    cancels: DashMap<JobId, CancellationToken>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// The document OCR service.
///
/// Cheap to clone; clones share the worker pool and the registry.
///
/// # Example
/// ```rust,no_run
/// use edgequake_ocr::{
///     DocumentPipeline, PipelineConfig, StandardRasterizer, SubmitOptions,
///     VisionOcrConfig, VisionOcrEngine,
/// };
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = VisionOcrEngine::new(VisionOcrConfig::default())?;
/// let pipeline = DocumentPipeline::new(
///     PipelineConfig::default(),
///     Arc::new(StandardRasterizer::new()),
///     Arc::new(engine),
/// )?;
/// let bytes = std::fs::read("scan.pdf")?;
/// let id = pipeline.submit(bytes, SubmitOptions::default())?;
/// let snapshot = pipeline.wait(id).await?;
/// println!("{:?}", snapshot.state);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DocumentPipeline {
    inner: Arc<Inner>,
}

impl DocumentPipeline {
    /// Create the pipeline and start the registry reaper.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(
        config: PipelineConfig,
        rasterizer: Arc<dyn Rasterizer>,
        engine: Arc<dyn OcrEngine>,
    ) -> Result<Self, ServiceError> {
        tokio::runtime::Handle::try_current().map_err(|e| {
            ServiceError::Internal(format!("DocumentPipeline needs a Tokio runtime: {e}"))
        })?;

        let config = Arc::new(config);
        let pool = WorkerPool::new(config.workers);
        let registry = Arc::new(JobRegistry::new(config.retention()));
        let shutdown = CancellationToken::new();
        let pages = PageProcessor::new(
            engine,
            pool.clone(),
            Arc::clone(&registry),
            Arc::clone(&config),
        );

        let reaper = registry.spawn_reaper(config.reaper_interval(), shutdown.child_token());

        info!(
            workers = config.workers,
            dpi = config.dpi,
            max_pages = config.max_pages,
            max_retries = config.max_retries,
            "Document pipeline started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                rasterizer,
                pages,
                pool,
                registry,
                shutdown,
                cancels: DashMap::new(),
                reaper: Mutex::new(Some(reaper)),
            }),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.inner.registry
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    /// Register `bytes` as a new job and start processing it.
    ///
    /// Returns as soon as the job is registered in `Received`.
    pub fn submit(
        &self,
        bytes: impl Into<Arc<[u8]>>,
        options: SubmitOptions,
    ) -> Result<JobId, ServiceError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(ServiceError::ShutDown);
        }

        let dpi = options
            .dpi
            .map(|d| d.clamp(72, 600))
            .unwrap_or(inner.config.dpi);
        let doc = Document::new(JobId::new(), bytes, dpi);
        let id = doc.id;
        inner.registry.register(id, &doc)?;

        let cancel = inner.shutdown.child_token();
        inner.cancels.insert(id, cancel.clone());
        info!(job_id = %id, bytes = doc.bytes.len(), dpi, "Job submitted");

        tokio::spawn(run_job(Arc::clone(inner), doc, cancel));
        Ok(id)
    }

    /// Current state and, once terminal, the frozen result.
    pub fn get_result(&self, id: JobId) -> Result<JobSnapshot, JobError> {
        self.inner.registry.get_result(id)
    }

    /// Stream snapshots of `id` until it is terminal.
    pub fn watch(&self, id: JobId) -> Result<JobUpdates, JobError> {
        self.inner.registry.watch(id)
    }

    /// Wait for `id` to reach a terminal state.
    pub async fn wait(&self, id: JobId) -> Result<JobSnapshot, JobError> {
        self.inner.registry.wait(id).await
    }

    /// Cancel a job that has not finished.
    ///
    /// The job is `Failed(Cancelled)` when this returns. Pages already on a
    /// worker finish, and their results are discarded.
    pub fn cancel(&self, id: JobId) -> Result<(), JobError> {
        let inner = &self.inner;
        inner.registry.update_state(
            id,
            JobState::Failed,
            StatePayload::Outcome(JobOutcome::Failed(DocumentError::Cancelled)),
        )?;
        if let Some(token) = inner.cancels.get(&id) {
            token.cancel();
        }
        info!(job_id = %id, "Job cancelled");
        Ok(())
    }

    /// Submit and wait. `Failed` jobs come back as [`ServiceError::JobFailed`].
    pub async fn process(
        &self,
        bytes: impl Into<Arc<[u8]>>,
        options: SubmitOptions,
    ) -> Result<DocumentResult, ServiceError> {
        let id = self.submit(bytes, options)?;
        let snapshot = self.wait(id).await?;
        match snapshot.outcome.as_deref() {
            Some(JobOutcome::Completed(result)) => Ok(result.clone()),
            Some(JobOutcome::Failed(error)) => Err(ServiceError::JobFailed {
                id,
                source: error.clone(),
            }),
            None => Err(ServiceError::Internal(format!(
                "job {id} is terminal without an outcome"
            ))),
        }
    }

    /// Cancel every job, stop the reaper, and clear the registry.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        let reaper = inner
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reaper) = reaper {
            if let Err(e) = reaper.await {
                warn!("Registry reaper ended abnormally: {}", e);
            }
        }
        inner.pool.close();
        inner.registry.clear();
        inner.cancels.clear();
        info!("Document pipeline shut down");
    }
}

#[instrument(name = "job", skip_all, fields(job_id = %doc.id))]
async fn run_job(inner: Arc<Inner>, doc: Document, cancel: CancellationToken) {
    let id = doc.id;
    let outcome = execute(&inner, &doc, &cancel).await;
    match &outcome {
        JobOutcome::Completed(result) => info!(
            pages = result.stats.total_pages,
            failed = result.stats.failed_pages,
            duration_ms = result.stats.total_duration_ms,
            "Job completed"
        ),
        JobOutcome::Failed(error) => warn!("Job failed: {}", error),
    }
    // Rejected when the job was cancelled meanwhile; the cancel already
    // recorded the terminal outcome.
    if let Err(e) = inner
        .registry
        .update_state(id, outcome.state(), StatePayload::Outcome(outcome))
    {
        debug!("Final state update ignored: {}", e);
    }
    inner.cancels.remove(&id);
}

/// Drive one document to its outcome. Never touches the terminal state.
async fn execute(inner: &Inner, doc: &Document, cancel: &CancellationToken) -> JobOutcome {
    let id = doc.id;
    let started = Instant::now();

    if let Err(e) = advance(inner, id, JobState::Rasterizing, StatePayload::None) {
        debug!("Job not started: {}", e);
        return JobOutcome::Failed(DocumentError::Cancelled);
    }

    let pages = match rasterize(inner, doc, cancel).await {
        Ok(pages) => pages,
        Err(error) => return JobOutcome::Failed(error),
    };
    let total = pages.len();
    let raster_ms = started.elapsed().as_millis() as u64;

    if let Err(e) = advance(inner, id, JobState::Processing, StatePayload::PageCount(total)) {
        debug!("Job stopped before processing: {}", e);
        return JobOutcome::Failed(DocumentError::Cancelled);
    }
    for index in 0..total {
        if let Err(e) = inner.registry.update_page(id, index, PageState::Pending) {
            debug!("Page {} registration ignored: {}", index + 1, e);
        }
    }

    let in_flight_limit = inner.pool.size() + inner.config.page_buffer;
    let mut tasks: JoinSet<PageOutcome> = JoinSet::new();
    let mut outcomes = Vec::with_capacity(total);
    let mut faults: Vec<String> = Vec::new();

    for page in pages {
        if cancel.is_cancelled() {
            break;
        }
        while tasks.len() >= in_flight_limit {
            match tasks.join_next().await {
                Some(joined) => collect(joined, &mut outcomes, &mut faults),
                None => break,
            }
        }
        let processor = inner.pages.clone();
        let token = cancel.clone();
        tasks.spawn(async move { processor.process(id, page, &token).await });
    }
    while let Some(joined) = tasks.join_next().await {
        collect(joined, &mut outcomes, &mut faults);
    }

    if cancel.is_cancelled() {
        return JobOutcome::Failed(DocumentError::Cancelled);
    }
    if let Some(detail) = faults.into_iter().next() {
        return JobOutcome::Failed(DocumentError::Internal { detail });
    }

    if let Err(e) = advance(inner, id, JobState::Aggregating, StatePayload::None) {
        debug!("Job stopped before aggregation: {}", e);
        return JobOutcome::Failed(DocumentError::Cancelled);
    }

    let mut results = Vec::with_capacity(total);
    for outcome in outcomes {
        match outcome {
            PageOutcome::Finished(result) => results.push(result),
            PageOutcome::Skipped { index } => {
                return JobOutcome::Failed(DocumentError::Internal {
                    detail: format!("page {} was never processed", index + 1),
                });
            }
        }
    }
    aggregate(results, total, raster_ms, started.elapsed().as_millis() as u64)
}

/// Run the rasteriser to completion and return every page in order.
///
/// Any rasteriser error, contract violation, or cancellation drops the pages
/// rendered so far.
async fn rasterize(
    inner: &Inner,
    doc: &Document,
    cancel: &CancellationToken,
) -> Result<Vec<PageImage>, DocumentError> {
    // Stops the rasteriser thread when this function returns early.
    let stop = cancel.child_token();
    let _stop_on_exit = stop.clone().drop_guard();

    let options = RasterOptions {
        dpi: doc.dpi,
        max_rendered_pixels: inner.config.max_rendered_pixels,
        max_pages: inner.config.max_pages,
    };
    let (tx, rx) = mpsc::channel(inner.config.page_buffer);
    let mut sink = ChannelSink {
        tx,
        pool: inner.pool.clone(),
        cancel: stop,
        options,
        permit: None,
    };
    let rasterizer = Arc::clone(&inner.rasterizer);
    let bytes = Arc::clone(&doc.bytes);
    let raster = tokio::task::spawn_blocking(move || {
        rasterizer.rasterize(&bytes, &options, &mut sink)
    });

    let mut events = ReceiverStream::new(rx);
    let mut pages: Vec<PageImage> = Vec::new();
    let mut declared = None;
    let mut fault = None;

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.next() => event,
        };
        match event {
            None => break,
            Some(RasterEvent::Begin(n)) => {
                debug!(pages = n, "Page count declared");
                declared = Some(n);
                pages.reserve(n);
            }
            Some(RasterEvent::Page(page)) => {
                if page.index != pages.len() {
                    fault = Some(format!(
                        "rasteriser produced page {} where page {} was expected",
                        page.index + 1,
                        pages.len() + 1
                    ));
                    break;
                }
                pages.push(page);
            }
        }
    }
    // Ends rasterisation if it is still running.
    drop(events);

    let result = raster.await;
    if cancel.is_cancelled() {
        return Err(DocumentError::Cancelled);
    }
    match result {
        Ok(Ok(n)) => debug!(pages = n, "Rasterisation finished"),
        Ok(Err(e)) => return Err(DocumentError::from(e)),
        Err(e) => {
            return Err(DocumentError::Internal {
                detail: format!("rasteriser task panicked: {e}"),
            })
        }
    }
    if let Some(detail) = fault {
        return Err(DocumentError::Internal { detail });
    }
    if pages.is_empty() {
        return Err(InputError::EmptyDocument.into());
    }
    if let Some(n) = declared.filter(|n| *n != pages.len()) {
        return Err(DocumentError::Internal {
            detail: format!("rasteriser declared {n} pages but produced {}", pages.len()),
        });
    }
    Ok(pages)
}

fn advance(
    inner: &Inner,
    id: JobId,
    next: JobState,
    payload: StatePayload,
) -> Result<(), JobError> {
    inner.registry.update_state(id, next, payload)
}

fn collect(
    joined: Result<PageOutcome, tokio::task::JoinError>,
    outcomes: &mut Vec<PageOutcome>,
    faults: &mut Vec<String>,
) {
    match joined {
        Ok(outcome) => outcomes.push(outcome),
        Err(e) => faults.push(format!("page task panicked: {e}")),
    }
}

/// Place page results into a slot array by index and build the outcome.
///
/// Results may arrive in any order. Exactly one result per index in
/// `0..total` is required.
pub(crate) fn aggregate(
    results: Vec<PageResult>,
    total: usize,
    raster_duration_ms: u64,
    total_duration_ms: u64,
) -> JobOutcome {
    let mut slots: Vec<Option<PageResult>> = vec![None; total];
    for result in results {
        let index = result.index;
        match slots.get_mut(index) {
            Some(slot) if slot.is_none() => *slot = Some(result),
            _ => {
                return JobOutcome::Failed(DocumentError::Internal {
                    detail: format!("duplicate or out-of-range result for page {}", index + 1),
                });
            }
        }
    }

    let mut pages = Vec::with_capacity(total);
    for (index, slot) in slots.into_iter().enumerate() {
        match slot {
            Some(page) => pages.push(page),
            None => {
                return JobOutcome::Failed(DocumentError::Internal {
                    detail: format!("no result for page {}", index + 1),
                });
            }
        }
    }

    let succeeded: Vec<&PageResult> = pages.iter().filter(|p| p.is_success()).collect();
    if succeeded.is_empty() {
        let first_error = pages
            .iter()
            .find_map(|p| p.error.as_ref())
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        return JobOutcome::Failed(DocumentError::AllPagesFailed { total, first_error });
    }

    let recognised: Vec<f32> = succeeded
        .iter()
        .filter(|p| !p.empty)
        .map(|p| p.confidence)
        .collect();
    let mean_confidence =
        (!recognised.is_empty()).then(|| recognised.iter().sum::<f32>() / recognised.len() as f32);

    let stats = DocumentStats {
        total_pages: total,
        succeeded_pages: succeeded.len(),
        failed_pages: total - succeeded.len(),
        empty_pages: succeeded.iter().filter(|p| p.empty).count(),
        mean_confidence,
        raster_duration_ms,
        total_duration_ms,
    };
    JobOutcome::Completed(DocumentResult { pages, stats })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PageError;
    use crate::output::PageStatus;

    fn ok(index: usize, text: &str, confidence: f32) -> PageResult {
        PageResult {
            index,
            status: PageStatus::Completed,
            text: text.into(),
            confidence,
            empty: text.is_empty(),
            attempts: 1,
            duration_ms: 1,
            error: None,
        }
    }

    fn failed(index: usize) -> PageResult {
        PageResult {
            index,
            status: PageStatus::Failed,
            text: String::new(),
            confidence: 0.0,
            empty: false,
            attempts: 3,
            duration_ms: 1,
            error: Some(PageError::OcrFailed {
                page: index,
                attempts: 3,
                detail: format!("boom {index}"),
            }),
        }
    }

    #[test]
    fn aggregate_orders_by_index() {
        let out = aggregate(
            vec![ok(2, "c", 0.9), ok(0, "a", 0.9), ok(1, "b", 0.6)],
            3,
            5,
            10,
        );
        let result = out.result().unwrap();
        let indices: Vec<usize> = result.pages.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(result.text(" "), "a b c");
        let mean = result.stats.mean_confidence.unwrap();
        assert!((mean - 0.8).abs() < 1e-6);
    }

    #[test]
    fn aggregate_all_failed_reports_first_error() {
        let out = aggregate(vec![failed(1), failed(0)], 2, 0, 0);
        match out.error() {
            Some(DocumentError::AllPagesFailed { total, first_error }) => {
                assert_eq!(*total, 2);
                assert!(first_error.contains("boom 0"), "got: {first_error}");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn aggregate_partial_failure_completes() {
        let out = aggregate(vec![failed(0), ok(1, "", 0.0)], 2, 0, 0);
        let stats = &out.result().unwrap().stats;
        assert_eq!(stats.failed_pages, 1);
        assert_eq!(stats.empty_pages, 1);
        assert_eq!(stats.mean_confidence, None);
    }

    #[test]
    fn aggregate_rejects_missing_and_duplicate_pages() {
        assert!(matches!(
            aggregate(vec![ok(0, "a", 1.0)], 2, 0, 0).error(),
            Some(DocumentError::Internal { .. })
        ));
        assert!(matches!(
            aggregate(vec![ok(0, "a", 1.0), ok(0, "b", 1.0)], 2, 0, 0).error(),
            Some(DocumentError::Internal { .. })
        ));
    }

    #[test]
    fn submit_options_default_keeps_config_dpi() {
        assert_eq!(SubmitOptions::default().dpi, None);
    }
}
