mod config;
mod gate;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use admission_admin::AppState;
use admission_rate_limit::{AdaptiveThrottler, LoadSampler, RateLimiter};
use admission_scheduler::RequestScheduler;
use anyhow::Result;
use axum::http::StatusCode;
use axum::{middleware, Router};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::DaemonConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let daemon_config = DaemonConfig::from_args()?;
    let config = daemon_config.config.clone();
    info!(config_path = %daemon_config.config_path.display(), "starting admission daemon");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = RequestScheduler::new(&config.scheduler);
    let queue_probe = scheduler.clone();
    let sampler = Arc::new(LoadSampler::with_system_cpu(
        config.load.clone(),
        Arc::new(move || queue_probe.queue_depth()),
    ));
    let throttler = Arc::new(AdaptiveThrottler::new(config.throttle.clone(), sampler.clone()));
    let limiter = RateLimiter::new(&config.rate_limit, throttler)?;

    let state = Arc::new(AppState::new(
        config.clone(),
        Some(daemon_config.config_path.clone()),
        limiter.clone(),
        scheduler.clone(),
        Some(sampler.clone()),
    )?);

    let mut tasks = vec![
        sampler.spawn(shutdown_rx.clone()),
        limiter.start_cleanup_task(
            Duration::from_secs(config.rate_limit.cleanup_interval_secs.max(1)),
            shutdown_rx.clone(),
        ),
        scheduler.spawn_dispatcher(shutdown_rx.clone()),
    ];

    // Admin API
    let admin_state = Arc::clone(&state);
    let admin_listen = config.server.admin.listen.clone();
    let admin_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) =
            admission_admin::run_admin_server(admin_state, &admin_listen, wait_for_shutdown(admin_shutdown))
                .await
        {
            error!(error = %e, "admin API server error");
        }
    }));

    tasks.push(tokio::spawn(handle_signals(Arc::clone(&state), shutdown_tx)));

    // Forward-auth gate: every admitted request answers 204.
    let gate = Router::new()
        .fallback(|| async { StatusCode::NO_CONTENT })
        .layer(middleware::from_fn_with_state(Arc::clone(&state), gate::admit));

    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    info!(addr = %config.server.listen, "admission gate listening");

    axum::serve(listener, gate.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
        .await?;

    scheduler.shutdown();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }

    info!("admission daemon stopped");
    Ok(())
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

/// Ctrl-C / SIGTERM stop the daemon; SIGHUP reloads the configuration file.
async fn handle_signals(state: Arc<AppState>, shutdown_tx: watch::Sender<bool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut hangup, mut terminate) =
            match (signal(SignalKind::hangup()), signal(SignalKind::terminate())) {
                (Ok(hangup), Ok(terminate)) => (hangup, terminate),
                (Err(e), _) | (_, Err(e)) => {
                    error!(error = %e, "failed to install signal handlers");
                    let _ = tokio::signal::ctrl_c().await;
                    let _ = shutdown_tx.send(true);
                    return;
                }
            };

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = terminate.recv() => break,
                _ = hangup.recv() => {
                    info!("SIGHUP received");
                    if let Err(e) = state.reload_from_disk() {
                        error!(error = %e, "configuration reload failed");
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = &state;
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
}
