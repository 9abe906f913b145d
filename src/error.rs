use axum::response::{IntoResponse, Response};
use hyper::{header, StatusCode};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid archive identifier")]
    InvalidIdentifier,
    #[error("cannot extract archive identifier")]
    IdentifierExtract,
    #[error("archive does not exist or was deleted")]
    ArchiveNotFound,
    #[error("cannot start archiving, try again later")]
    ProcessStart,
    #[error("archiving failed, try again later")]
    ProcessExecution,
    #[error("server is shutting down")]
    ShuttingDown,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        use Error::*;
        match self {
            // Malformed identifiers are indistinguishable from missing archives for the client.
            InvalidIdentifier => StatusCode::NOT_FOUND,
            IdentifierExtract => StatusCode::INTERNAL_SERVER_ERROR,
            ArchiveNotFound => StatusCode::NOT_FOUND,
            ProcessStart => StatusCode::INTERNAL_SERVER_ERROR,
            ProcessExecution => StatusCode::INTERNAL_SERVER_ERROR,
            ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.to_string(),
        )
            .into_response()
    }
}

pub mod archive {
    pub use super::Error::{
        ArchiveNotFound,
        IdentifierExtract,
        InvalidIdentifier,
        ProcessExecution,
        ProcessStart,
        ShuttingDown,
    };
}
