//! Repogate server binary.
//!
//! Exposes one repository directory over HTTP(S) for browsing and image uploads. Every request
//! passes a shared-secret gateway with per-IP failure throttling and a same-origin check on
//! mutations. Paths are confined to the repository root, and hidden or version-control ignored
//! entries are never disclosed.

mod atomic;
mod auth;
mod background;
mod cache;
mod config;
mod error;
mod files;
mod http;
mod listing;
mod logging;
mod router;
mod sandbox;
mod tls;
mod upload;
mod version;
mod visibility;

use axum::extract::Extension;
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use crate::auth::{AuthGateway, FailurePolicy, FailureStore};
use crate::background::spawn_background_tasks;
use crate::config::Args;
use crate::http::RequestScheme;
use crate::listing::Storage;
use crate::router::build_router;
use crate::sandbox::RepoRoot;
use crate::upload::UploadConfig;
use crate::visibility::{FailPolicy, GitIgnoreOracle, VisibilityFilter};

shadow!(build);

/// Starts the gateway and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let root = RepoRoot::open(&args.root).await?;
    info!(root = %root.path().display(), "serving repository");

    let oracle = Arc::new(GitIgnoreOracle::new(&args.git_bin, root.path()));
    let fail_policy = if args.ignore_fail_closed {
        FailPolicy::Closed
    } else {
        FailPolicy::Open
    };
    let visibility = VisibilityFilter::new(
        oracle,
        Duration::from_millis(args.ignore_timeout_ms),
        fail_policy,
    );
    let storage = Arc::new(Storage::new(root, visibility, args.tree_max_entries));
    let upload_config = Arc::new(UploadConfig {
        upload_dir: args.upload_dir.clone(),
        screenshot_dir: args.screenshot_dir.clone(),
        max_size: args.upload_max_size,
    });
    let gateway = Arc::new(AuthGateway {
        secret: args.password.clone().filter(|secret| !secret.is_empty()),
        failures: FailureStore::new(FailurePolicy {
            max_failures: args.auth_max_failures,
            window: Duration::from_secs(args.auth_window_secs),
            block: Duration::from_secs(args.auth_block_secs),
            max_tracked: args.auth_max_tracked,
        }),
        trust_forwarded_for: args.trust_forwarded_for,
    });
    if gateway.is_open_access() {
        warn!("no password configured, running in open-access mode");
    }

    let app = build_router(
        storage,
        upload_config,
        gateway.clone(),
        args.cors_origins.as_deref(),
    );

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!("Starting HTTP server at {}", http_addr);
    let http_app = app.clone().layer(Extension(RequestScheme::Http));
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(http_app.into_make_service_with_connect_info::<SocketAddr>());

    let https_server = match args.https_port {
        Some(port) => {
            let https_addr = SocketAddr::new(host, port);
            let tls_config = tls::build_rustls_config(
                args.tls_cert.as_deref(),
                args.tls_key.as_deref(),
                host,
            )
            .await?;
            info!("Starting HTTPS server at {}", https_addr);
            let https_app = app.layer(Extension(RequestScheme::Https));
            Some(
                axum_server::bind_rustls(https_addr, tls_config)
                    .handle(handle.clone())
                    .serve(https_app.into_make_service_with_connect_info::<SocketAddr>()),
            )
        }
        None => None,
    };

    spawn_background_tasks(gateway);
    match https_server {
        Some(https_server) => {
            tokio::select! {
                result = http_server => result?,
                result = https_server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
        None => {
            tokio::select! {
                result = http_server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
