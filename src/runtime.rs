use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::{IdentityVerifier, JwtVerifier};
use crate::backbone;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::gateway_server::GatewayServer;
use crate::hub::Hub;
use crate::producer::{Producer, Publisher};

const DISPATCHER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Wires the backbone, Hub, dispatcher and gateway together and runs them
/// until a shutdown signal arrives.
pub struct GatewayRuntime {
    config: Config,
}

impl GatewayRuntime {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        let cancel = CancellationToken::new();
        let signal_task = tokio::spawn(wait_for_shutdown(cancel.clone()));
        let result = self.run_until(cancel).await;
        signal_task.abort();
        result
    }

    pub async fn run_until(self, cancel: CancellationToken) -> Result<()> {
        let cfg = &self.config;
        info!(
            "starting gateway (bind={}, path={}, backbone={:?}, topic={}, group_mode={:?}, send_buffer={})",
            cfg.server.bind,
            cfg.server.path,
            cfg.backbone.kind,
            cfg.backbone.topic,
            cfg.backbone.group_mode,
            cfg.server.send_buffer_size
        );
        if cfg.auth.jwt_secret == crate::config::DEV_JWT_SECRET {
            warn!("JWT_SECRET is the development default; set a real secret outside local testing");
        }

        let backbone = backbone::connect(&cfg.backbone)
            .await
            .context("failed joining message backbone")?;
        info!("dispatcher joined consumer group {}", backbone.group);

        let hub = Arc::new(Hub::new());
        let publisher: Arc<dyn Publisher> = Arc::new(Producer::new(
            backbone.transport,
            cfg.backbone.max_retries,
            cfg.backbone.retry_backoff(),
        ));
        let verifier: Arc<dyn IdentityVerifier> = Arc::new(JwtVerifier::new(
            &cfg.auth.jwt_secret,
            &cfg.auth.jwt_issuer,
            &cfg.auth.jwt_audience,
            cfg.auth.leeway(),
        ));

        let dispatcher = Dispatcher::new(hub.clone(), cfg.backbone.retry_backoff());
        let subscription = backbone.subscription;
        let dispatcher_task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { dispatcher.run(subscription, cancel).await })
        };

        let server = GatewayServer::new(cfg.server.clone(), hub, publisher, verifier);
        let result = server.run(cancel.clone()).await;
        cancel.cancel();

        match tokio::time::timeout(DISPATCHER_STOP_TIMEOUT, dispatcher_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => warn!("dispatcher exited with error: {err:#}"),
            Ok(Err(err)) => warn!("dispatcher task failed: {err}"),
            Err(_) => warn!("dispatcher did not stop within {DISPATCHER_STOP_TIMEOUT:?}"),
        }
        result
    }
}

async fn wait_for_shutdown(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        let mut terminate = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("failed installing SIGTERM handler: {err}");
                if signal::ctrl_c().await.is_ok() {
                    info!("received ctrl-c, shutting down");
                }
                cancel.cancel();
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => info!("received ctrl-c, shutting down"),
            _ = terminate.recv() => info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        if signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
        }
    }

    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use tokio_util::sync::CancellationToken;

    use super::GatewayRuntime;
    use crate::config::Config;

    fn reserve_bind() -> Result<String> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);
        Ok(addr.to_string())
    }

    #[tokio::test]
    async fn runtime_stops_cleanly_on_cancel() -> Result<()> {
        let mut config = Config::default();
        config.server.bind = reserve_bind()?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(GatewayRuntime::new(config).run_until(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task).await???;
        Ok(())
    }

    #[tokio::test]
    async fn occupied_bind_address_is_fatal() -> Result<()> {
        let held = std::net::TcpListener::bind("127.0.0.1:0")?;
        let mut config = Config::default();
        config.server.bind = held.local_addr()?.to_string();
        let result = GatewayRuntime::new(config)
            .run_until(CancellationToken::new())
            .await;
        assert!(result.is_err());
        Ok(())
    }
}
