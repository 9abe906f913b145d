use std::{io, path::Path};

use axum::{body::Bytes, response::IntoResponse, routing::get, Extension, Router};
use hyper::{header, StatusCode};

/// Landing page, read once at startup.
#[derive(Clone, Debug)]
pub struct Index(Bytes);

impl Index {
    pub async fn load(path: &Path) -> io::Result<Self> {
        Ok(Self(Bytes::from(tokio::fs::read(path).await?)))
    }
}

async fn handler(Extension(index): Extension<Index>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        index.0,
    )
}

pub fn router(index: Index) -> Router {
    Router::new()
        .route("/", get(handler))
        .route("/index.html", get(handler))
        .layer(Extension(index))
}
