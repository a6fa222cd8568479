//! casebench -- data-driven test execution orchestrator.
//!
//! This crate runs parameterized test scripts across rows of case data,
//! optionally inside a disposable browser container, and reports per-case
//! and per-job outcomes through a SQLite bulletin board and a message broker.

pub mod api;
pub mod browser;
pub mod config;
pub mod credentials;
pub mod environment;
pub mod events;
pub mod job;
pub mod retry;
pub mod sandbox;
pub mod scheduler;
pub mod services;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::browser::WebDriverConnector;
use crate::config::OrchestratorConfig;
use crate::environment::docker::DockerRuntime;
use crate::environment::ContainerProvisioner;
use crate::events::{BrokerPublisher, OutboxPublisher};
use crate::job::coordinator::{Collaborators, JobCoordinator, JobSummary};
use crate::job::ExecutionJob;
use crate::services::ServiceClient;
use crate::storage::Store;

/// Open the store and build every shared collaborator from `config`.
///
/// A missing Docker daemon is not fatal; web-mode jobs then fail at
/// provisioning.
pub fn collaborators(config: OrchestratorConfig) -> Result<Collaborators> {
    let db_path = config.paths.database.to_string_lossy().into_owned();
    info!(%db_path, "Initializing database");
    let store = Store::open(&db_path)?;

    let provisioner = match DockerRuntime::connect() {
        Ok(runtime) => {
            let connector = WebDriverConnector::new(Duration::from_secs(60))
                .context("failed to build WebDriver client")?;
            Some(Arc::new(ContainerProvisioner::new(
                Arc::new(runtime),
                Arc::new(connector),
                config.docker.clone(),
            )))
        }
        Err(e) => {
            warn!(error = %e, "docker unavailable, web-mode jobs will fail");
            None
        }
    };

    let services =
        ServiceClient::new(config.services.clone()).context("failed to build service client")?;
    let publisher = Arc::new(OutboxPublisher::new(store.clone(), config.events.clone()));

    Ok(Collaborators {
        config: Arc::new(config),
        store: store.clone(),
        provisioner,
        stop_flags: Arc::new(store),
        publisher,
        services,
    })
}

/// Start the orchestrator daemon: intake API plus the outbox dispatcher.
pub async fn serve(bind: &str, config: OrchestratorConfig) -> Result<()> {
    let secret_key = config.credentials.resolve_secret();
    let deps = collaborators(config)?;

    if let Some(broker) = BrokerPublisher::from_config(&deps.config.events)? {
        let store = deps.store.clone();
        let interval = Duration::from_secs(deps.config.events.dispatch_interval_secs.max(1));
        tokio::spawn(async move {
            events::run_dispatcher(store, broker, interval).await;
        });
    } else {
        info!("no broker configured, events stay in the outbox");
    }

    let addr: std::net::SocketAddr = bind.parse()?;
    let app = api::router(api::state::AppState::new(deps, secret_key));

    info!(%addr, "casebench listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Run one job in the foreground, then flush its events to the broker if
/// one is configured.
pub async fn run_job(config: OrchestratorConfig, job: ExecutionJob) -> Result<JobSummary> {
    let deps = collaborators(config)?;
    let summary = JobCoordinator::new(job, deps.clone()).run().await;

    if let Some(broker) = BrokerPublisher::from_config(&deps.config.events)? {
        let delivered = events::dispatch_once(&deps.store, &broker, 1000).await?;
        info!(delivered, "events forwarded to broker");
    }
    Ok(summary)
}
