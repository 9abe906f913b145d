use std::{
    future::Future,
    io,
    pin::Pin,
    task::Poll,
    time::Duration,
};

use axum::body::Bytes;
use futures::{ready, Stream};
use tokio::{
    sync::{mpsc, oneshot},
    time,
};
use tokio_util::sync::CancellationToken;

use super::{
    job::{CompressionJob, EXIT_GRACE},
    ArchiveConfig,
};

type Chunk = io::Result<Bytes>;

/// Why forwarding stopped before the end of the archive.
#[derive(Debug)]
enum Interruption {
    Disconnected,
    Shutdown,
    Failed(io::Error),
}

/// An archive response in progress.
///
/// Forwarding runs in its own task which owns the [`CompressionJob`]. Whatever ends the
/// transfer, the task stops and reaps the bundler before it returns.
pub struct StreamSession {
    job: CompressionJob,
    head: Bytes,
    chunk_size: usize,
    delay: Duration,
    cancel: CancellationToken,
}

impl StreamSession {
    pub fn new(
        job: CompressionJob,
        head: Bytes,
        config: &ArchiveConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job,
            head,
            chunk_size: config.chunk_size,
            delay: config.delay,
            cancel,
        }
    }

    /// Starts forwarding and returns the response body.
    ///
    /// Dropping the returned stream is how a client disconnection is noticed. A failed
    /// transfer ends the stream with an error once the chunks already sent are consumed,
    /// however long the client takes to read them.
    pub fn into_body(self) -> impl Stream<Item = Chunk> + Send + 'static {
        let (tx, mut rx) = mpsc::channel(1);
        let (fail, failure) = oneshot::channel();
        tokio::spawn(self.run(tx, fail));

        let mut failure = Some(failure);
        futures::stream::poll_fn(move |cx| {
            if let Some(chunk) = ready!(rx.poll_recv(cx)) {
                return Poll::Ready(Some(Ok(chunk)));
            }
            let outcome = match failure.as_mut() {
                Some(failure) => ready!(Pin::new(failure).poll(cx)),
                None => return Poll::Ready(None),
            };
            failure = None;
            // A dropped sender means the archive is complete.
            Poll::Ready(outcome.ok().map(Err))
        })
    }

    async fn run(mut self, tx: mpsc::Sender<Bytes>, fail: oneshot::Sender<io::Error>) {
        let id = self.job.id();
        let forwarded = self.forward(&tx).await;

        let status = match forwarded {
            Ok(()) => self.job.finish(EXIT_GRACE).await,
            Err(_) => self.job.terminate().await,
        };
        let status = match status {
            Ok(status) => Some(status),
            Err(err) => {
                log::error!("[{}] Cannot stop bundler: {}", id, err);
                None
            }
        };

        match forwarded {
            Ok(()) => match status {
                Some(status) if status.success() => log::debug!("[{}] Archive sent", id),
                Some(status) => {
                    let diagnostics = self.job.diagnostics().await;
                    log::error!(
                        "[{}] Bundler failed with {} while streaming: {}",
                        id,
                        status,
                        diagnostics
                    );
                    abort(fail, io::Error::new(io::ErrorKind::Other, "archiving failed"));
                }
                None => {
                    abort(fail, io::Error::new(io::ErrorKind::Other, "archiving failed"));
                }
            },
            Err(Interruption::Disconnected) => {
                log::warn!("[{}] Download was interrupted", id);
            }
            Err(Interruption::Shutdown) => {
                log::warn!("[{}] Download cancelled by shutdown", id);
                abort(
                    fail,
                    io::Error::new(io::ErrorKind::Interrupted, "server is shutting down"),
                );
            }
            Err(Interruption::Failed(err)) => {
                log::error!("[{}] Cannot read bundler output: {}", id, err);
                abort(fail, err);
            }
        }
    }

    async fn forward(&mut self, tx: &mpsc::Sender<Bytes>) -> Result<(), Interruption> {
        let mut chunk = std::mem::take(&mut self.head);
        loop {
            if !chunk.is_empty() {
                log::debug!("[{}] Sending archive chunk of {} bytes", self.job.id(), chunk.len());
                watch(tx, &self.cancel, tx.send(chunk))
                    .await?
                    .map_err(|_| Interruption::Disconnected)?;
                if !self.delay.is_zero() {
                    watch(tx, &self.cancel, time::sleep(self.delay)).await?;
                }
            }

            chunk = match watch(tx, &self.cancel, self.job.read_chunk(self.chunk_size))
                .await?
                .map_err(Interruption::Failed)?
            {
                Some(chunk) => chunk,
                None => return Ok(()),
            };
        }
    }
}

/// Runs `fut` unless the client goes away or the server shuts down first.
async fn watch<F: Future>(
    tx: &mpsc::Sender<Bytes>,
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, Interruption> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interruption::Shutdown),
        _ = tx.closed() => Err(Interruption::Disconnected),
        output = fut => Ok(output),
    }
}

// An error item makes hyper drop the connection instead of terminating the body cleanly.
fn abort(fail: oneshot::Sender<io::Error>, err: io::Error) {
    let _ = fail.send(err);
}
