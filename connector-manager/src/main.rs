use anyhow::{Context, Result};
use connector_manager::api::{create_router, ApiState};
use connector_manager::reload::spawn_reload_loop;
use connector_manager::{builtin_registry, Agent, FeatureBindings, LifecycleManager};
use snamp::config::{load_config, new_runtime_settings, SnampConfig};
use snamp::configuration::ConfigurationManager;
use snamp::persistence::FileConfigurationStore;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "snamp=info,connector_manager=info".into()),
        )
        .init();

    info!("SNAMP agent starting...");

    let config = match std::env::var("SNAMP_CONFIG") {
        Ok(path) => load_config(&path)
            .with_context(|| format!("Failed to load settings from {}", path))?,
        Err(_) => SnampConfig::default(),
    };
    let admin_token = std::env::var("SNAMP_ADMIN_TOKEN").ok();
    let settings = new_runtime_settings(&config);

    info!(
        configuration = %config.persistence.path.display(),
        update_window_ms = config.update_window.duration_ms,
        reload_enabled = config.reload.enabled,
        api_port = config.api.port,
        "Settings loaded"
    );

    // Plugins and lifecycle
    let bindings = Arc::new(FeatureBindings::new());
    let registry = builtin_registry(Arc::clone(&bindings));
    info!(
        connectors = ?registry.connector_types(),
        gateways = ?registry.gateway_types(),
        "Plugins registered"
    );
    let lifecycle = LifecycleManager::new(
        registry,
        bindings,
        Arc::clone(&settings),
        config.update_window.timer_tick(),
    );
    lifecycle.start();

    // Persisted configuration
    let store = Arc::new(
        FileConfigurationStore::new(&config.persistence.path)
            .context("Failed to initialize configuration store")?,
    );
    let agent = Arc::new(Agent::new(
        ConfigurationManager::with_store(store),
        lifecycle,
        settings,
        config.persistence.save_on_apply,
    ));

    match agent.load_and_reconcile().await {
        Ok(Some(outcome)) => info!(
            changes = outcome.change_count,
            failed = outcome.report.failures.len(),
            "Initial configuration applied"
        ),
        Ok(None) => {}
        Err(e) => warn!(error = %format!("{:#}", e), "Failed to apply stored configuration"),
    }

    let reload_handle = spawn_reload_loop(Arc::clone(&agent), config.reload.interval());

    // Start HTTP API server
    let server_handle = if config.api.enabled {
        let router = create_router(ApiState {
            agent: Arc::clone(&agent),
            admin_token,
        });
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.api.port))
            .await
            .context("Failed to bind API port")?;
        info!(port = config.api.port, "Agent API listening");

        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!(error = %e, "Agent API server error");
            }
        }))
    } else {
        None
    };

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    // Graceful shutdown
    if let Some(handle) = server_handle {
        handle.abort();
    }
    reload_handle.abort();
    agent.shutdown().await;
    info!("SNAMP agent stopped");

    Ok(())
}
