//! chunkdock server binary.
//!
//! Accepts large files as independently uploaded chunks, reassembles them once
//! every chunk has arrived, and reclaims storage from abandoned uploads. The
//! main entry point builds the engine and the Axum router, then starts the HTTP
//! listener (and an HTTPS listener when a certificate is configured).

mod artifacts;
mod assembly;
mod atomic;
mod background;
mod chunks;
mod config;
mod engine;
mod error;
mod files;
mod http;
mod locking;
mod logging;
mod reaper;
mod scan;
mod tls;
mod upload;
mod validate;

use axum::extract::connect_info::ConnectInfo;
use axum::http::Request;
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::background::spawn_background_tasks;
use crate::config::Args;
use crate::engine::UploadEngine;
use crate::http::{build_cors_layer, build_router};
use crate::scan::{AcceptAll, CommandScanner, ContentScanner};

shadow!(build);

/// Starts the upload server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = Args::parse();
    logging::init_logging(args.log_format);

    let scanner: Arc<dyn ContentScanner> = match args.scan_command.as_deref() {
        Some(command) => Arc::new(
            CommandScanner::from_command_line(
                command,
                Duration::from_secs(args.scan_timeout_secs),
            )
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?,
        ),
        None => Arc::new(AcceptAll),
    };
    let config = args.upload_config();
    info!(
        upload_dir = ?config.upload_dir,
        chunk_dir = ?config.chunk_dir,
        retention_secs = config.retention.as_secs(),
        missing_chunks = ?config.missing_chunks,
        scanner = scanner.name(),
        "upload engine configured"
    );
    let engine = Arc::new(UploadEngine::new(config, scanner));
    engine.ensure_dirs().await?;
    spawn_background_tasks(
        engine.clone(),
        Duration::from_secs(args.reap_interval_secs),
    )
    .await;

    let mut app = build_router(engine, args.body_limit()).layer(
        TraceLayer::new_for_http()
            .make_span_with(|request: &Request<_>| {
                let forwarded_ip = request
                    .headers()
                    .get("x-forwarded-for")
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.split(',').next().unwrap_or("").trim().to_string());
                let connect_ip = request
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.to_string());
                let client_ip = forwarded_ip
                    .or(connect_ip)
                    .unwrap_or_else(|| "unknown".to_string());

                info_span!(
                    env!("CARGO_CRATE_NAME"),
                    client_ip,
                    method = ?request.method(),
                    path = ?request.uri().path(),
                )
            })
            .on_request(DefaultOnRequest::new().level(Level::DEBUG))
            .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
    );
    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let tls_config = tls::load_rustls_config(&args).await?;
    let handle = Handle::new();

    info!("Starting HTTP server at {}", http_addr);
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.clone().into_make_service_with_connect_info::<SocketAddr>());
    let https_server = async {
        match tls_config {
            Some(tls_config) => {
                let https_addr = SocketAddr::new(host, args.https_port);
                info!("Starting HTTPS server at {}", https_addr);
                axum_server::bind_rustls(https_addr, tls_config)
                    .handle(handle.clone())
                    .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                    .await
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = http_server => result?,
        result = https_server => result?,
        _ = shutdown_signal(handle.clone()) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
