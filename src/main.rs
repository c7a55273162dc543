mod config;

use clap::Parser as _;
use config::Config;
use std::sync::Arc;
use steadfast::{
    AppState, build_metrics_layer_and_handle, build_metrics_router, build_router,
    circuit_breaker::CircuitBreakerRegistry,
    client::create_hyper_client,
    context::ContextWindowManager,
    fallback::FallbackChain,
    health::HealthMonitor,
    providers::{ProviderCredentials, ProviderRegistry},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

#[tokio::main]
#[instrument]
pub async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse().validate()?;
    info!("Starting steadfast with config: {:?}", config);

    let credentials = ProviderCredentials::from_env();
    let registry = Arc::new(ProviderRegistry::from_credentials(
        &credentials,
        create_hyper_client(config.pool()),
    ));
    if !registry.has_any_provider() {
        warn!("No vendor credentials configured, every generation request will fail");
    }

    let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker()));
    let chain = FallbackChain::new(Arc::clone(&registry), Arc::clone(&breakers))
        .with_context_manager(ContextWindowManager::new(config.reserved_output_tokens));
    let health = Arc::new(HealthMonitor::new(
        registry,
        breakers,
        config.health_monitor(),
    ));

    let shutdown = CancellationToken::new();
    let monitor_task = Arc::clone(&health).spawn(shutdown.clone());

    let app_state = AppState::new(chain, health, config.key_ring()?);
    let mut router = build_router(app_state);

    if config.metrics {
        let (metrics_layer, handle) = build_metrics_layer_and_handle(config.metrics_prefix.clone());
        router = router.layer(metrics_layer);

        let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr).await?;
        info!("Metrics listening on {}", metrics_addr);
        let metrics_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let served = axum::serve(metrics_listener, build_metrics_router(handle))
                .with_graceful_shutdown(metrics_shutdown.cancelled_owned())
                .await;
            if let Err(e) = served {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("steadfast listening on {}", bind_addr);

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                signal.cancel();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    shutdown.cancel();
    monitor_task.await?;
    Ok(())
}
