use std::{sync::Arc, time::Duration};

use axum::{
    body::StreamBody,
    response::{IntoResponse, Response},
    routing::get,
    Extension, Router,
};
use hyper::{
    header::{CONTENT_DISPOSITION, CONTENT_TYPE},
    StatusCode,
};
use tokio_util::sync::CancellationToken;

use crate::error::{archive as ArchiveError, Error};

mod identifier;
mod job;
mod locator;
mod session;
#[cfg(test)]
mod testing;

pub use identifier::Identifier;
pub use job::{Bundler, CompressionJob};
pub use locator::{Locator, DEFAULT_SOURCE_DIR};
pub use session::StreamSession;

const ATTACHMENT: &str = r#"attachment; filename="photos.zip""#;
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Immutable settings shared by every archive request.
#[derive(Clone, Debug)]
pub struct ArchiveConfig {
    pub locator: Locator,
    pub bundler: Bundler,
    pub chunk_size: usize,
    pub delay: Duration,
}

pub async fn handler(
    Extension(config): Extension<Arc<ArchiveConfig>>,
    Extension(shutdown): Extension<CancellationToken>,
    identifier: Identifier,
) -> Result<Response, Error> {
    let root = config.locator.resolve().await;
    let is_dir = tokio::fs::metadata(root.join(identifier.as_ref()))
        .await
        .map(|md| md.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return Err(ArchiveError::ArchiveNotFound);
    }

    let cancel = shutdown.child_token();
    let mut job = CompressionJob::start(&config.bundler, &root, &identifier)?;
    let head = tokio::select! {
        head = job.probe(config.chunk_size) => head?,
        _ = cancel.cancelled() => {
            if let Err(err) = job.terminate().await {
                log::error!("[{}] Cannot stop bundler: {}", job.id(), err);
            }
            return Err(ArchiveError::ShuttingDown);
        }
    };
    log::info!(
        "[{}] Streaming archive of {} (pid {:?})",
        job.id(),
        identifier,
        job.pid()
    );

    let session = StreamSession::new(job, head, &config, cancel);
    Ok((
        StatusCode::OK,
        [(CONTENT_TYPE, "application/zip"), (CONTENT_DISPOSITION, ATTACHMENT)],
        StreamBody::new(session.into_body()),
    )
        .into_response())
}

pub fn router(config: Arc<ArchiveConfig>, shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/archive/:identifier/", get(handler))
        .route("/archive/:identifier", get(handler))
        .layer(Extension(config))
        .layer(Extension(shutdown))
}
