//! Wiring of the gateway, its admin service and the shared state between them

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{error, info, warn};

use crate::access_log::AccessLogger;
use crate::admin::ClientAdmin;
use crate::admin_api::{run_admin_api_with_shutdown, AdminApi};
use crate::authenticator::{AuthPipeline, SignedRequestAuthenticator};
use crate::cache::{GatewayCache, MemoryCache, RedisCache};
use crate::clock::Clock;
use crate::config::{CacheBackend, GatewayConfig};
use crate::credential_cache::CredentialCache;
use crate::error::GatewayError;
use crate::gateway::{run_gateway_with_shutdown, Gateway, GatewaySettings, Upstream};
use crate::rate_limiter::RateLimiter;
use crate::replay_guard::ReplayGuard;
use crate::store::GatewayStore;

/// Everything a running gateway process needs
pub struct GatewayApp {
    pub gateway: Arc<Gateway>,
    pub admin: Arc<ClientAdmin>,
    pub logger: Arc<AccessLogger>,
    pub credentials: Arc<CredentialCache>,
}

impl GatewayApp {
    /// Assemble from already-open backends. Must run inside a tokio runtime.
    pub fn assemble(
        config: &GatewayConfig,
        store: Arc<GatewayStore>,
        cache: Arc<dyn GatewayCache>,
        upstream: Arc<dyn Upstream>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let credentials = Arc::new(CredentialCache::new(
            cache.clone(),
            config.auth.credential_cache_ttl(),
            config.auth.negative_cache_ttl(),
        ));

        let authenticator = SignedRequestAuthenticator::new(
            credentials.clone(),
            store.clone(),
            ReplayGuard::new(config.auth.replay_window()),
            clock.clone(),
        );
        let pipeline = AuthPipeline::new().with(Arc::new(authenticator));

        let rate_limiter = RateLimiter::new(
            cache,
            store.clone(),
            config.rate_limit.minute_bucket(),
            config.rate_limit.daily_count_cache_ttl(),
        );

        let logger = Arc::new(AccessLogger::spawn(
            store.clone(),
            config.access_log.queue_capacity,
        ));

        let gateway = Arc::new(Gateway::new(
            GatewaySettings::from(config),
            pipeline,
            rate_limiter,
            logger.clone(),
            upstream,
            clock.clone(),
        ));

        let admin = Arc::new(ClientAdmin::from_store(store, credentials.clone(), clock));

        Self {
            gateway,
            admin,
            logger,
            credentials,
        }
    }

    /// Serve the gateway, and the admin API when a token is configured,
    /// until `signal` resolves.
    ///
    /// A server that fails to bind or stops on its own ends the run with its
    /// error; the other server is drained first.
    pub async fn serve<S>(&self, config: &GatewayConfig, signal: S) -> Result<(), GatewayError>
    where
        S: Future<Output = ()>,
    {
        let gateway_addr = config.listen_addr()?;
        let admin_addr = if config.admin.token.is_empty() {
            warn!("Admin API disabled: no admin token configured");
            None
        } else {
            Some(config.admin_listen_addr()?)
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut gateway_task = tokio::spawn(run_gateway_with_shutdown(
            gateway_addr,
            self.gateway.clone(),
            wait_for_shutdown(shutdown_rx.clone()),
        ));
        let mut admin_task = admin_addr.map(|addr| {
            let api = Arc::new(AdminApi::new(self.admin.clone(), config.admin.token.clone()));
            tokio::spawn(run_admin_api_with_shutdown(
                addr,
                api,
                wait_for_shutdown(shutdown_rx),
            ))
        });

        let mut gateway_done = false;
        let mut admin_done = false;
        let outcome = tokio::select! {
            _ = signal => {
                info!("Shutdown requested, draining connections");
                Ok(())
            }
            result = &mut gateway_task => {
                gateway_done = true;
                Err(server_exit("Gateway", result))
            }
            result = async {
                match admin_task.as_mut() {
                    Some(task) => task.await,
                    None => std::future::pending().await,
                }
            } => {
                admin_done = true;
                Err(server_exit("Admin API", result))
            }
        };

        if let Err(e) = &outcome {
            error!("{}", e);
        }
        let _ = shutdown_tx.send(true);

        if !gateway_done {
            log_drained("Gateway", gateway_task.await);
        }
        if let Some(task) = admin_task {
            if !admin_done {
                log_drained("Admin API", task.await);
            }
        }

        outcome
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

/// Error for a server that finished before shutdown was requested
fn server_exit(name: &str, result: Result<Result<(), GatewayError>, JoinError>) -> GatewayError {
    match result {
        Ok(Err(e)) => e,
        Ok(Ok(())) => GatewayError::Server(format!("{} server stopped unexpectedly", name)),
        Err(e) => GatewayError::Server(format!("{} task failed: {}", name, e)),
    }
}

fn log_drained(name: &str, result: Result<Result<(), GatewayError>, JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("{} server error: {}", name, e),
        Err(e) => error!("{} task failed: {}", name, e),
    }
}

/// Build the configured cache backend
pub async fn open_cache(
    config: &GatewayConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn GatewayCache>, GatewayError> {
    match config.cache.backend {
        CacheBackend::Memory => Ok(Arc::new(MemoryCache::with_clock(clock))),
        CacheBackend::Redis => Ok(Arc::new(RedisCache::new(&config.cache.redis_url).await?)),
    }
}
