use std::future::Future;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::error::Result;
use crate::store::Page;

/// Lazily enumerated results of a continuation-token query.
pub type PageStream<T> = ReceiverStream<Result<T>>;

/// Drive `fetch` from the first page until the continuation runs out,
/// yielding items as pages arrive.
///
/// Empty pages that still carry a continuation are followed, not treated as
/// the end. The first error is yielded and ends the stream; enumeration
/// restarts from scratch by calling `paginate` again. Dropping the stream
/// stops the background fetch at the next send.
pub fn paginate<T, F, Fut>(page_size: usize, mut fetch: F) -> PageStream<T>
where
    T: Send + 'static,
    F: FnMut(Option<String>, usize) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Page<T>>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(page_size.clamp(1, 1024));

    tokio::spawn(async move {
        let mut continuation: Option<String> = None;
        loop {
            match fetch(continuation.take(), page_size).await {
                Ok(page) => {
                    for item in page.items {
                        if tx.send(Ok(item)).await.is_err() {
                            // Consumer dropped the stream
                            return;
                        }
                    }
                    match page.continuation {
                        Some(next) => continuation = Some(next),
                        None => return,
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Paginated query failed");
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    });

    ReceiverStream::new(rx)
}

/// Drain a page stream into a vector, stopping at the first error.
pub async fn collect_all<T>(mut stream: PageStream<T>) -> Result<Vec<T>> {
    let mut items = Vec::new();
    while let Some(item) = stream.next().await {
        items.push(item?);
    }
    Ok(items)
}
