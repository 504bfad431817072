use anyhow::{Context, Result};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use exdebug_cloud::activation::{ActivationServer, HostAccessPoint};
use exdebug_cloud::cloud::{CloudEvent, CloudManager};
use exdebug_cloud::config::Config;
use exdebug_cloud::credentials::CredentialStore;
use exdebug_cloud::link::LinkState;
use exdebug_cloud::simulate;
use exdebug_cloud::storage::KvStore;

const SAMPLE_INTERVAL_MS: u64 = 100;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("LOG_FORMAT").map_or(false, |v| v == "json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = match Config::load_from_file() {
        Ok(config) => config,
        Err(e) => {
            info!("No config file ({:#}), reading environment", e);
            Config::from_env()?
        }
    };
    let config = Arc::new(config);
    info!(product_id = %config.product_id, api = %config.api_base_url, "Device starting");

    let kv = Arc::new(
        KvStore::open(&config.storage_path)
            .with_context(|| format!("opening {}", config.storage_path.display()))?,
    );
    let link = LinkState::new(env_flag("LINK_CONNECTED", true));
    let manager = CloudManager::with_onenet(config.clone(), kv.clone(), link.clone());

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CloudEvent::Activation(state) => info!(?state, "Activation state"),
                CloudEvent::UploadProgress { task_id, progress, .. } => info!(task_id, progress, "Upload progress"),
                CloudEvent::UploadCompleted { task_id, success, error } => {
                    info!(task_id, success, error = ?error, "Upload finished")
                }
            }
        }
    });

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    if manager.needs_activation() {
        let softap = std::env::var("ACTIVATION_MODE").map_or(false, |m| m == "softap");
        if link.is_connected() && !softap {
            if let Err(e) = manager.register_direct().await {
                error!("Direct activation failed: {}", e);
            }
        } else {
            let server = ActivationServer::new(
                Client::new(),
                config.clone(),
                CredentialStore::new(kv.clone()),
                HostAccessPoint,
            );
            info!(device_code = %manager.device_code(), "Waiting for SoftAP activation");
            tokio::select! {
                result = manager.activate_via_softap(&server) => match result {
                    Ok(identity) => info!(device_name = %identity.device_name, "Activated via SoftAP"),
                    Err(e) => error!("SoftAP activation failed: {}", e),
                },
                _ = &mut shutdown => {
                    info!("Interrupted during activation");
                    server.stop().await?;
                    return Ok(());
                }
            }
        }
    }

    if manager.is_activated() && link.is_connected() {
        if let Err(e) = manager.set_device_online(true).await {
            warn!("Could not report online: {}", e);
        }
    }

    for path in std::env::args().skip(1) {
        match manager.enqueue(&path).await {
            Ok(task_id) => info!(task_id, %path, "Queued for upload"),
            Err(e) => warn!(%path, "Not queued: {}", e),
        }
    }

    let simulate_samples = env_flag("SIMULATE_SAMPLES", false);
    let mut process_interval = time::interval(Duration::from_millis(config.process_interval_ms.max(1)));
    let mut sample_interval = time::interval(Duration::from_millis(SAMPLE_INTERVAL_MS));

    loop {
        tokio::select! {
            _ = process_interval.tick() => {
                manager.process().await;
            }
            _ = sample_interval.tick(), if simulate_samples => {
                manager.record_sample(simulate::probe_sample()).await;
            }
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
        }
    }

    if manager.is_online() {
        if let Err(e) = manager.set_device_online(false).await {
            warn!("Could not report offline: {}", e);
        }
    }
    manager.shutdown().await?;
    Ok(())
}
