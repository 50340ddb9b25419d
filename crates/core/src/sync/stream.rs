//! Lazy, restartable queue listing

use std::sync::Arc;

use futures::stream::{self, Stream, TryStreamExt};
use tillsync_domain::{QueueCursor, QueueItemStatus, Result, SyncQueueItem, TillSyncError};

use super::ports::SyncQueueRepository;

/// Stream every item in `status` in `created_at` order, fetching `page_size`
/// rows at a time. Pass the cursor of the last item seen to resume.
pub fn queue_stream(
    queue: Arc<dyn SyncQueueRepository>,
    status: QueueItemStatus,
    start_after: Option<QueueCursor>,
    page_size: usize,
) -> impl Stream<Item = Result<SyncQueueItem>> + Send {
    let page_size = page_size.max(1);

    stream::try_unfold(Some(start_after), move |state| {
        let queue = Arc::clone(&queue);
        async move {
            let Some(cursor) = state else { return Ok(None) };
            let page = queue.list_by_status(status, cursor.as_ref(), page_size).await?;
            if page.is_empty() {
                return Ok(None);
            }

            let next = if page.len() < page_size {
                None
            } else {
                page.last().map(|item| Some(QueueCursor::after(item)))
            };
            Ok(Some((stream::iter(page.into_iter().map(Ok::<_, TillSyncError>)), next)))
        }
    })
    .try_flatten()
}
