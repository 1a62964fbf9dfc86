// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Kube Tunnel Manager Contributors

// Kube Tunnel Manager - Daemon
// Supervises the kubectl/socat process pairs behind every tunnel

mod api;
mod auth;
mod commands;
mod config;
mod discovery;
mod monitor;
mod notify;
mod permissions;
mod pidfile;
mod probe;
mod process;
mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tower::Service;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::{create_router, AppState};
use commands::KubectlPlanner;
use config::{DaemonConfig, ListenerMode};
use discovery::DiscoveryClient;
use monitor::HealthMonitor;
use notify::{DesktopSink, NotificationThrottler};
use supervisor::ConnectionSupervisor;

#[tokio::main]
async fn main() -> Result<()> {
    // Restrictive umask before creating any files
    permissions::set_restrictive_umask();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kube_tunnel_daemon=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Kube Tunnel Manager Daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let _pid_guard = pidfile::PidFileGuard::create()
        .context("Failed to create PID file - another daemon may already be running")?;

    let daemon_config = DaemonConfig::load()?;
    info!("Listener mode: {:?}", daemon_config.listener_mode);
    info!("Authentication required: {}", daemon_config.require_auth);

    let auth_token = if daemon_config.require_auth {
        let (token, _was_new) = auth::load_or_generate_token(&daemon_config.auth_token_path)?;
        Some(token)
    } else {
        info!("Authentication disabled - API endpoints are publicly accessible");
        None
    };

    // Build the supervisor over the persisted tunnel list
    let store = daemon_config.tunnel_store()?;
    let planner = Arc::new(KubectlPlanner::new(daemon_config.kubectl_path.clone()));
    let notifier = Arc::new(NotificationThrottler::new(Arc::new(DesktopSink)));
    let supervisor = ConnectionSupervisor::new(planner, notifier);

    let tunnels = store.load()?;
    info!(
        "Loaded {} tunnel(s) from {}",
        tunnels.len(),
        store.path().display()
    );
    for tunnel in &tunnels {
        supervisor.insert(tunnel.clone()).await;
    }
    for tunnel in tunnels.iter().filter(|t| t.enabled) {
        if let Err(e) = supervisor.start(tunnel.id).await {
            warn!("Failed to start tunnel '{}': {}", tunnel.name, e);
        }
    }

    // Log tunnel events
    let mut event_rx = supervisor.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            info!("Tunnel event: {:?}", event);
        }
    });

    // Health monitor with its own shutdown channel
    let (monitor_shutdown_tx, monitor_shutdown_rx) = tokio::sync::watch::channel(false);
    let monitor_handle = tokio::spawn(HealthMonitor::new(supervisor.clone()).run(monitor_shutdown_rx));

    // Shutdown broadcast for graceful SSE stream termination
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let state = Arc::new(AppState {
        supervisor: supervisor.clone(),
        store,
        discovery: DiscoveryClient::new(daemon_config.kubectl_path.clone()),
        shutdown_tx: shutdown_tx.clone(),
    });

    let app = if let Some(token) = auth_token {
        let auth_state = auth::AuthState::new(token);
        create_router(state).layer(axum::middleware::from_fn_with_state(
            auth_state,
            auth::auth_middleware,
        ))
    } else {
        create_router(state)
    };

    match daemon_config.listener_mode {
        ListenerMode::UnixSocket => {
            serve_unix_socket(
                app,
                &daemon_config,
                supervisor.clone(),
                shutdown_tx,
                monitor_shutdown_tx.clone(),
            )
            .await?;
        }
        ListenerMode::TcpHttp => {
            let bind_address = kube_tunnel_common::format_host_port(
                &daemon_config.bind_host,
                daemon_config.bind_port,
            );
            serve_tcp_http(
                app,
                &bind_address,
                supervisor.clone(),
                shutdown_tx,
                monitor_shutdown_tx.clone(),
            )
            .await?;
        }
    }

    let _ = monitor_shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), monitor_handle).await;

    info!("Daemon shut down");
    Ok(())
}

/// Serve on a Unix domain socket (local-only)
async fn serve_unix_socket(
    app: axum::Router,
    daemon_config: &DaemonConfig,
    supervisor: ConnectionSupervisor,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
    monitor_shutdown_tx: tokio::sync::watch::Sender<bool>,
) -> Result<()> {
    let socket_path = config::socket_path()?;

    if socket_path.exists() {
        std::fs::remove_file(&socket_path).context("Failed to remove existing socket file")?;
    }

    if let Some(parent) = socket_path.parent() {
        permissions::ensure_directory_with_permissions(parent, daemon_config.group_access)?;
    }

    let listener = UnixListener::bind(&socket_path).context(format!(
        "Failed to bind to socket: {}",
        socket_path.display()
    ))?;

    permissions::set_socket_permissions(&socket_path, daemon_config.group_access)?;

    info!("Daemon listening on Unix socket: {}", socket_path.display());
    info!("Daemon started successfully");

    let (shutdown_signal_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let shutdown_broadcast = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown(supervisor, monitor_shutdown_tx).await;
        // Signal SSE streams to close
        let _ = shutdown_broadcast.send(());
        // Signal the accept loop to stop
        let _ = shutdown_signal_tx.send(()).await;
    });

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutting down server...");
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, _addr)) => {
                        let app = app.clone();

                        tokio::spawn(async move {
                            let stream = TokioIo::new(stream);

                            let hyper_service = hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
                                let mut app = app.clone();
                                async move {
                                    app.call(request).await
                                }
                            });

                            if let Err(err) = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                                .serve_connection_with_upgrades(stream, hyper_service)
                                .await
                            {
                                // Client disconnects (e.g. Ctrl+C on a watch) are normal
                                let err_msg = err.to_string();
                                if err_msg.contains("connection closed") || err_msg.contains("Broken pipe") {
                                    debug!("Client disconnected: {}", err);
                                } else {
                                    error!("Error serving connection: {}", err);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }

    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }

    Ok(())
}

/// Serve on TCP with plain HTTP (localhost only)
async fn serve_tcp_http(
    app: axum::Router,
    bind_address: &str,
    supervisor: ConnectionSupervisor,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
    monitor_shutdown_tx: tokio::sync::watch::Sender<bool>,
) -> Result<()> {
    info!("Daemon listening on TCP (HTTP): {}", bind_address);
    info!("HTTP mode has no encryption - use only on localhost");
    info!("Daemon started successfully");

    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .context(format!("Failed to bind to {}", bind_address))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_shutdown(supervisor, monitor_shutdown_tx).await;
            let _ = shutdown_tx.send(());
        })
        .await
        .context("TCP HTTP server error")?;

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, then take everything down
async fn wait_for_shutdown(
    supervisor: ConnectionSupervisor,
    monitor_shutdown_tx: tokio::sync::watch::Sender<bool>,
) {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        };
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down");
    }

    // Monitor first so no reconcile pass races the bulk kill
    let _ = monitor_shutdown_tx.send(true);
    supervisor.stop_all().await;
    info!("All tunnels stopped");
}
