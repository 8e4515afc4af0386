/*
 * Stack Controller - Kubernetes dispatcher for CI jobs
 * Copyright (C) 2026 Stack Controller authors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Stack Controller Service
//!
//! Watches CI job pods for containers stuck in `ImagePullBackOff` and
//! cancels the upstream job, so it fails fast instead of waiting out its
//! timeout. Serves health and readiness endpoints on the side.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use clap::Parser;
use serde_json::{json, Value};
use stack_controller::{run_watcher, BuildkiteClient, ControllerConfig};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "stack-controller")]
#[command(about = "Cancels CI jobs whose pods cannot pull their images")]
#[command(version)]
struct Cli {
    /// Path to the controller configuration file; a missing file is an error.
    /// Without it, `CONTROLLER_CONFIG_PATH` or the default mount is tried and
    /// defaults are used if that fails.
    #[arg(long)]
    config: Option<String>,

    /// Namespace to watch, overriding the configuration file
    #[arg(long, short = 'n')]
    namespace: Option<String>,

    /// Address for the health endpoints
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Upstream API token
    #[arg(long, env = "BUILDKITE_TOKEN", hide_env_values = true)]
    token: String,
}

#[derive(Clone)]
struct AppState {
    watching: Arc<AtomicBool>,
}

fn init_tracing() {
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json");

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,stack_controller=debug".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

fn load_controller_config(cli: &Cli) -> Result<ControllerConfig> {
    let mut config = match cli.config.as_deref() {
        Some(path) => ControllerConfig::from_mounted_file(path)
            .with_context(|| format!("loading configuration from {path}"))?,
        None => ControllerConfig::load(),
    };

    if let Some(namespace) = &cli.namespace {
        config.namespace.clone_from(namespace);
    }

    config.validate().context("invalid controller configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    info!(
        "Starting Stack Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Arc::new(load_controller_config(&cli)?);
    info!(
        namespace = %config.namespace,
        grace_period_seconds = config.image_pull_back_off_grace_period_seconds,
        "Configuration loaded"
    );

    let client = kube::Client::try_default()
        .await
        .context("connecting to Kubernetes")?;
    info!("Connected to Kubernetes cluster");

    let api = Arc::new(
        BuildkiteClient::new(&cli.token, &config.graphql_endpoint, config.api_timeout())
            .context("building upstream API client")?,
    );

    let watching = Arc::new(AtomicBool::new(true));
    let mut watcher_handle = {
        let config = Arc::clone(&config);
        let watching = Arc::clone(&watching);
        tokio::spawn(async move {
            let result = run_watcher(client, &config, api).await;
            watching.store(false, Ordering::SeqCst);
            result
        })
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
        .with_state(AppState { watching });

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;
    info!("Controller HTTP server listening on {}", cli.listen);

    let server = async {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
    };

    tokio::select! {
        served = server => {
            served.context("HTTP server failed")?;
        }
        finished = &mut watcher_handle => {
            match finished {
                Ok(Ok(())) => warn!("Pod watch ended unexpectedly"),
                Ok(Err(e)) => {
                    error!(error = %e, "ImagePullBackOff watcher failed");
                    return Err(e).context("ImagePullBackOff watcher failed");
                }
                Err(e) => {
                    error!(error = %e, "ImagePullBackOff watcher task panicked");
                    return Err(e).context("ImagePullBackOff watcher task failed");
                }
            }
        }
    }

    watcher_handle.abort();
    info!("Controller service stopped");
    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "stack-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if !state.watching.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "status": "ready",
        "service": "stack-controller",
        "version": env!("CARGO_PKG_VERSION")
    })))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
