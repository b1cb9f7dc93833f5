//! skiff Node Agent
//!
//! The node agent runs on each worker node and supervises the allocations
//! the control plane assigns to it. On startup it restores any allocations
//! persisted by a previous process and resumes supervising them.

use std::sync::Arc;

use anyhow::{Context, Result};
use skiff_node_agent::alloc::{AllocRunnerDeps, NoopPrevAlloc};
use skiff_node_agent::client::ControlPlaneClient;
use skiff_node_agent::metrics::ClientMetrics;
use skiff_node_agent::state::{self, AllocRecord, SqliteStateStore, StateStore, ALLOC_KEY};
use skiff_node_agent::{AllocRunner, Config, MockTaskRunnerFactory};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting skiff node agent");

    // Load configuration
    let config = Arc::new(Config::from_env()?);
    info!(
        node_id = %config.node_id,
        control_plane_url = %config.control_plane_url,
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data dir {}", config.data_dir.display()))?;

    let registry = prometheus::Registry::new();
    let metrics = Arc::new(ClientMetrics::new(
        &registry,
        config.disable_tagged_metrics,
        config.backwards_compatible_metrics,
    )?);

    let state_store: Arc<dyn StateStore> =
        Arc::new(SqliteStateStore::open(&config.state_path).context("failed to open state store")?);

    let updater = Arc::new(ControlPlaneClient::new(&config)?).into_updater();

    // TODO: replace with the exec-driver task runner factory once the task
    // execution plane lands.
    let factory = Arc::new(MockTaskRunnerFactory::new());

    // Restore allocations persisted by a previous agent process.
    let mut restored = 0usize;
    for alloc_id in state_store.list_allocs()? {
        let mut record: Option<AllocRecord> = None;
        state_store.view(&alloc_id, &mut |bucket| {
            record = state::get_object(bucket, ALLOC_KEY)?;
            Ok(())
        })?;
        let Some(record) = record else {
            warn!(alloc_id = %alloc_id, "Skipping allocation bucket without alloc record");
            continue;
        };

        let runner = AllocRunner::new(
            AllocRunnerDeps {
                config: config.clone(),
                state_store: state_store.clone(),
                updater: updater.clone(),
                task_runner_factory: factory.clone(),
                prev_alloc: Arc::new(NoopPrevAlloc),
                metrics: metrics.clone(),
            },
            record.alloc,
        );

        match runner.restore_state() {
            Ok(()) => {
                tokio::spawn(runner.run());
                restored += 1;
            }
            Err(e) => {
                error!(alloc_id = %alloc_id, error = %e, "Failed to restore allocation");
            }
        }
    }
    info!(count = restored, "Restored allocations from state store");

    // Log device fingerprints when a plugin is configured.
    if let Some(addr) = config.device_plugin_addr.clone() {
        tokio::spawn(async move {
            match skiff_node_agent::device::DevicePlugin::connect(&addr).await {
                Ok(mut plugin) => match plugin.fingerprint().await {
                    Ok(mut stream) => {
                        while let Ok(Some(devices)) = stream.message().await {
                            info!(
                                vendor = %devices.vendor,
                                device_type = %devices.device_type,
                                count = devices.devices.len(),
                                "Device fingerprint update"
                            );
                        }
                    }
                    Err(e) => warn!(error = %e, "Device fingerprint stream failed"),
                },
                Err(e) => warn!(error = %e, "Device plugin connection failed"),
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down skiff node agent");

    Ok(())
}
