use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::ConnectInfo,
    middleware::{self, Next},
    response::IntoResponse,
    Router, Server,
};
use clap::Parser;
use hyper::Request;
use tokio_util::sync::CancellationToken;

use crate::index::Index;
use crate::options::Options;

mod archive;
mod error;
mod index;
mod misc;
mod options;

async fn logger<B>(req: Request<B>, next: Next<B>) -> impl IntoResponse {
    match req.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => {
            log::info!("{} {} {}", addr, req.method(), req.uri().path())
        }
        None => log::info!("{} {}", req.method(), req.uri().path()),
    }
    next.run(req).await
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::error!("Cannot listen for Ctrl-C: {}", err);
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                log::error!("Cannot listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => (),
        _ = terminate => (),
    }
    log::info!("Shutting down, cancelling running downloads");
    shutdown.cancel();
}

#[tokio::main]
async fn main() {
    let options = Options::parse();
    env_logger::Builder::new()
        .filter_level(options.log_level())
        .init();

    let index = Index::load(&options.index)
        .await
        .unwrap_or_else(|e| exit_error!("Cannot read index page {}: {}", options.index.display(), e));
    let shutdown = CancellationToken::new();

    let app = Router::new()
        .merge(index::router(index))
        .merge(archive::router(
            Arc::new(options.archive_config()),
            shutdown.clone(),
        ))
        .layer(middleware::from_fn(logger));

    let address = SocketAddr::new(options.address, options.port);
    let server = Server::try_bind(&address)
        .unwrap_or_else(|e| exit_error!("Cannot bind {}: {}", address, e));

    log::info!("App is running on: {}", address);
    server
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .unwrap_or_else(|e| exit_error!("Server stopped: {}", e));
}
