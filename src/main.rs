use crate::config::ConfigStore;
use crate::controller::Reconciler;
use crate::inspection::KubeInspector;
use crate::metrics::DriftMetrics;
use crate::oci_registry::OciRegistryClient;
use crate::sink::{FanOutSink, ObservabilitySink, ResultStore};
use crate::state::{ControllerContext, CycleOutcome};
use crate::tag_resolver::RegistryTagResolver;
use crate::webserver::AppState;
use anyhow::Context;
use std::env;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber;

mod config;
mod controller;
mod drift;
mod image_reference;
mod inspection;
mod matcher;
mod metrics;
mod oci_registry;
mod secret_string;
mod sink;
mod state;
mod tag_resolver;
#[cfg(test)]
mod testing;
mod version;
mod webserver;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting kube-version-checker {}", env!("CARGO_PKG_VERSION"));

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
    let config_store = Arc::new(ConfigStore::load(&config_path)?);
    let config = config_store.snapshot().await;

    let http_client = oci_registry::create_client(&config)?;
    let cache_capacity = NonZeroUsize::new(config.reconciler.cache_capacity)
        .context("reconciler.cacheCapacity must be greater than zero")?;
    let resolver = Arc::new(RegistryTagResolver::new(
        Arc::new(OciRegistryClient::new(http_client)),
        cache_capacity,
        Duration::from_secs(config.reconciler.registry_timeout_seconds),
        config.reconciler.tag_page_limit,
    ));

    let kube_client = inspection::create_client().await?;
    let shutdown = CancellationToken::new();
    let reconciler = Reconciler::new(
        Arc::new(KubeInspector::new(kube_client)),
        Arc::clone(&resolver),
        Arc::clone(&config_store),
        shutdown.clone(),
    );
    let results = Arc::new(ResultStore::new());
    let metrics = Arc::new(DriftMetrics::new()?);
    let sink = FanOutSink::new(vec![
        results.clone() as Arc<dyn ObservabilitySink>,
        metrics.clone(),
    ]);
    let controller = Arc::new(ControllerContext::new(
        reconciler,
        resolver,
        config_store,
        Arc::new(sink),
    ));

    // The schedule is read once, a config reload does not reschedule the job
    info!("Executing job scheduler at cron schedule {}", config.schedule);
    let mut scheduler = JobScheduler::new().await?;
    let job_controller = Arc::clone(&controller);
    let job = Job::new_async(config.schedule.clone(), move |_uuid, _l| {
        let controller = Arc::clone(&job_controller);
        Box::pin(async move {
            match controller.trigger_cycle().await {
                CycleOutcome::Published(count) => {
                    debug!("Published {} version check results", count)
                }
                outcome => debug!("Scheduled version check finished: {:?}", outcome),
            }
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;

    tokio::spawn(cancel_on_shutdown_signal(shutdown.clone()));

    let app = webserver::create_app(AppState {
        controller,
        results,
        metrics,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    scheduler.shutdown().await?;
    info!("Shutdown complete");
    Ok(())
}

async fn cancel_on_shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {:?}", e);
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
                error!("Failed to listen for SIGTERM: {:?}", e);
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
    info!("Shutdown signal received, stopping");
    shutdown.cancel();
}
