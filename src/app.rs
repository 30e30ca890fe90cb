use crate::cli::RunArgs;
use relay_core::config::{AppConfig, ConfigWatcher};
use relay_server::AppState;
use std::path::Path;

pub struct Application {
    state: AppState,
    config_path: String,
    host: String,
    port: u16,
}

impl Application {
    pub fn build(args: &RunArgs) -> anyhow::Result<Self> {
        let mut config = AppConfig::load(&args.config)?;
        if let Some(port) = args.port {
            config.port = port;
        }

        // the supervisor (external) reads this too; surfaced here so a
        // single-worker run documents its environment
        if let Ok(workers) = std::env::var("WORKER_COUNT") {
            tracing::info!(worker_count = %workers, "running as one worker of a supervised set");
        }

        let host = config.host.clone();
        let port = config.port;

        std::fs::create_dir_all(&args.data_dir)?;
        let state = AppState::build(config, Path::new(&args.data_dir))?;
        relay_translator::register_all(&state.registry);
        state.writer.start();

        Ok(Self {
            state,
            config_path: args.config.clone(),
            host,
            port,
        })
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        // hot reload: validate, then swap config and runtime state in
        let reload_state = self.state.clone();
        let _watcher = ConfigWatcher::start(
            self.config_path.clone(),
            self.state.config.clone(),
            move |new_config| {
                reload_state.apply_config(new_config.clone());
            },
        )?;

        // daily retention pass over the access store
        let cleanup_writer = self.state.writer.clone();
        tokio::spawn(async move {
            let retention_days = std::env::var("RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30u32);
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match cleanup_writer.cleanup(retention_days).await {
                    Ok(deleted) if deleted > 0 => {
                        tracing::info!(deleted, "expired access log rows removed");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "access log cleanup failed"),
                }
            }
        });

        let router = relay_server::build_router(self.state.clone());
        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(%addr, "relay listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        // drain the log queue with a bounded wait before exiting
        tracing::info!("shutting down; draining access log queue");
        let close = self.state.writer.close();
        if tokio::time::timeout(std::time::Duration::from_secs(5), close)
            .await
            .is_err()
        {
            tracing::warn!("access log drain timed out");
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
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
}
