//! Streaming progress API: emit job snapshots as they change.
//!
//! Large documents take minutes. Rather than polling
//! [`JobRegistry::get_result`], a caller can subscribe to a job and receive
//! every state or page transition as a [`JobSnapshot`]. The stream ends after
//! the terminal snapshot.
//!
//! Snapshots are coalesced: a slow consumer sees the latest state, never a
//! backlog.

use crate::error::JobError;
use crate::output::{JobId, JobSnapshot};
use crate::registry::JobRegistry;
use futures::stream::StreamExt;
use std::pin::Pin;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::Stream;

/// A boxed stream of job snapshots.
pub type JobUpdates = Pin<Box<dyn Stream<Item = JobSnapshot> + Send>>;

impl JobRegistry {
    /// Stream snapshots of `id` until it reaches a terminal state.
    ///
    /// The first item is the current snapshot; the last is terminal.
    ///
    /// # Example
    /// ```rust,no_run
    /// # use edgequake_ocr::{JobRegistry, JobId};
    /// # use futures::StreamExt;
    /// # async fn demo(registry: &JobRegistry, id: JobId) -> Result<(), Box<dyn std::error::Error>> {
    /// let mut updates = registry.watch(id)?;
    /// while let Some(snap) = updates.next().await {
    ///     println!("{:?}: {}/{:?} pages", snap.state, snap.finished_pages(), snap.page_count);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn watch(&self, id: JobId) -> Result<JobUpdates, JobError> {
        let rx = self.subscribe(id)?;
        Ok(Box::pin(until_terminal(WatchStream::new(rx))))
    }
}

/// Pass snapshots through up to and including the first terminal one.
///
/// The registry keeps every sender alive, so the inner stream never ends on
/// its own; the terminal snapshot must end this one without polling again.
fn until_terminal<S>(inner: S) -> impl Stream<Item = JobSnapshot> + Send
where
    S: Stream<Item = JobSnapshot> + Send + Unpin,
{
    futures::stream::unfold((inner, false), |(mut inner, done)| async move {
        if done {
            return None;
        }
        let snap = inner.next().await?;
        let terminal = snap.is_terminal();
        Some((snap, (inner, terminal)))
    })
}
