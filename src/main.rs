//! SendVault 服务入口。
//!
//! 把分片上传管理器挂到 Axum 路由上，启动空闲会话清理任务，
//! 并在收到退出信号前持续提供 HTTP 服务。

mod auth;
mod config;
mod error;
mod finalize;
mod http;
mod logging;
mod manager;
mod reaper;
mod receiver;
mod records;
mod session;
mod storage;
mod upload;
mod version;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::{HeaderName, Request};
use axum::routing::{get, patch, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span, warn};

use crate::auth::IdentityConfig;
use crate::config::Args;
use crate::http::{add_security_headers, build_cors_layer, extract_forwarded_ip};
use crate::manager::{UploadConfig, UploadManager};
use crate::records::{LogNotifier, MemoryRepository};
use crate::reaper::spawn_reaper;
use crate::storage::Storage;

shadow!(build);

/// 启动 SendVault 服务，直到退出。
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage_root = PathBuf::from(&args.storage_dir);
    let storage = Arc::new(match args.spool_dir.as_deref() {
        Some(spool) => Storage::new(storage_root, PathBuf::from(spool)),
        None => Storage::with_default_spool(storage_root),
    });
    storage.ensure_dirs().await?;

    let upload_config = UploadConfig {
        max_total_size: args.upload_max_size,
        max_concurrent: args.upload_max_concurrent,
        idle_timeout: Duration::from_secs(args.upload_idle_timeout_secs),
        sweep_interval: Duration::from_secs(args.upload_sweep_interval_secs.max(1)),
        default_max_downloads: args.default_max_downloads,
        default_expiry_days: args.default_expiry_days,
        large_upload_threshold: args.large_upload_threshold,
    };
    let manager = Arc::new(UploadManager::new(
        storage.clone(),
        Arc::new(MemoryRepository::new()),
        Arc::new(LogNotifier),
        upload_config,
    ));
    let identity = Arc::new(IdentityConfig {
        header: HeaderName::try_from(args.identity_header.as_str()).map_err(|err| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string())
        })?,
    });

    let mut app = Router::new()
        .route("/api/upload/init", post(upload::init_upload))
        .route(
            "/api/upload/chunk",
            patch(upload::upload_chunk).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/upload/complete", post(upload::complete_upload))
        .route("/api/upload/abort", post(upload::abort_upload))
        .route("/api/upload/status", get(upload::upload_status))
        .route("/api/version", get(version::get_version_info))
        .layer(middleware::from_fn(auth::identity_middleware))
        .layer(middleware::from_fn(add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip =
                        extract_forwarded_ip(request.headers()).map(|ip| ip.to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip().to_string());
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
        )
        .layer(Extension(manager.clone()))
        .layer(Extension(identity));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();
    let reaper_shutdown = CancellationToken::new();
    let reaper = spawn_reaper(manager, reaper_shutdown.clone());

    info!(
        storage = ?storage.root_path(),
        "🚀 Starting HTTP server at {}",
        addr
    );
    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::spawn(shutdown_signal(handle));
    let result = server.await;

    reaper_shutdown.cancel();
    if let Err(err) = reaper.await {
        warn!(error = %err, "upload reaper task failed");
    }
    result
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
