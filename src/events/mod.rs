//! Lifecycle events: case-completed and job-completed.
//!
//! Coordinators publish through the outbox; a dispatcher forwards queued rows
//! to the broker's management HTTP endpoint.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::EventsConfig;
use crate::job::{CaseFailure, CaseStatus, JobStatus};
use crate::storage::Store;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("outbox write failed: {0}")]
    Outbox(String),

    #[error("broker request failed: {0}")]
    Broker(#[from] reqwest::Error),

    #[error("broker returned HTTP {0}")]
    Status(u16),

    #[error("broker did not route message to {0}")]
    Unrouted(String),
}

/// One flat lifecycle record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum JobEvent {
    CaseCompleted {
        case_id: String,
        job_id: String,
        status: CaseStatus,
        evidence_dir: PathBuf,
        error: Option<CaseFailure>,
    },
    JobCompleted {
        job_id: String,
        status: JobStatus,
        case_count: usize,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::CaseCompleted { job_id, .. } | JobEvent::JobCompleted { job_id, .. } => job_id,
        }
    }

    /// Routing key the event is published under.
    pub fn channel<'a>(&self, config: &'a EventsConfig) -> &'a str {
        match self {
            JobEvent::CaseCompleted { .. } => &config.case_channel,
            JobEvent::JobCompleted { .. } => &config.job_channel,
        }
    }
}

#[async_trait::async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &JobEvent) -> Result<(), PublishError>;
}

/// Queues events in the store's outbox.
pub struct OutboxPublisher {
    store: Store,
    config: EventsConfig,
}

impl OutboxPublisher {
    pub fn new(store: Store, config: EventsConfig) -> Self {
        Self { store, config }
    }
}

#[async_trait::async_trait]
impl EventPublisher for OutboxPublisher {
    async fn publish(&self, event: &JobEvent) -> Result<(), PublishError> {
        let payload = serde_json::to_string(event)?;
        self.store
            .enqueue_event(event.channel(&self.config), &payload)
            .map_err(|e| PublishError::Outbox(e.to_string()))?;
        debug!(job_id = %event.job_id(), "event queued");
        Ok(())
    }
}

/// Publishes straight to a RabbitMQ exchange over the management API.
#[derive(Clone)]
pub struct BrokerPublisher {
    client: reqwest::Client,
    endpoint: String,
    config: EventsConfig,
}

impl BrokerPublisher {
    /// `None` when no broker is configured.
    pub fn from_config(config: &EventsConfig) -> Result<Option<Self>, PublishError> {
        let Some(base) = config.broker_url.as_deref() else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let endpoint = format!(
            "{}/api/exchanges/{}/{}/publish",
            base.trim_end_matches('/'),
            config.vhost.replace('/', "%2F"),
            config.exchange
        );
        Ok(Some(Self {
            client,
            endpoint,
            config: config.clone(),
        }))
    }

    /// Publish an already serialized payload under `channel`.
    pub async fn publish_raw(&self, channel: &str, payload: &str) -> Result<(), PublishError> {
        let body = json!({
            "properties": { "content_type": "application/json", "delivery_mode": 2 },
            "routing_key": channel,
            "payload": payload,
            "payload_encoding": "string",
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(user) = self.config.broker_user.as_deref() {
            request = request.basic_auth(user, self.config.broker_password.as_deref());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PublishError::Status(status.as_u16()));
        }

        let ack: serde_json::Value = response.json().await?;
        if ack.get("routed").and_then(|v| v.as_bool()) == Some(false) {
            return Err(PublishError::Unrouted(channel.to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventPublisher for BrokerPublisher {
    async fn publish(&self, event: &JobEvent) -> Result<(), PublishError> {
        let payload = serde_json::to_string(event)?;
        self.publish_raw(event.channel(&self.config), &payload).await
    }
}

/// Publishes to every sink; reports the first failure after trying all.
pub struct FanoutPublisher {
    sinks: Vec<Arc<dyn EventPublisher>>,
}

impl FanoutPublisher {
    pub fn new(sinks: Vec<Arc<dyn EventPublisher>>) -> Self {
        Self { sinks }
    }
}

#[async_trait::async_trait]
impl EventPublisher for FanoutPublisher {
    async fn publish(&self, event: &JobEvent) -> Result<(), PublishError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.publish(event).await {
                warn!(job_id = %event.job_id(), error = %e, "event sink failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Forward one batch of queued events. Returns how many were delivered.
/// A failed row stays queued and stops the batch to keep channel order.
pub async fn dispatch_once(store: &Store, broker: &BrokerPublisher, batch: usize) -> anyhow::Result<usize> {
    let pending = store.pending_events(batch)?;
    let mut delivered = 0;
    for entry in pending {
        if let Err(e) = broker.publish_raw(&entry.channel, &entry.payload_json).await {
            warn!(outbox_id = entry.id, channel = %entry.channel, error = %e, "event delivery failed, will retry");
            break;
        }
        store.mark_dispatched(entry.id)?;
        delivered += 1;
    }
    Ok(delivered)
}

/// Background loop draining the outbox into the broker.
pub async fn run_dispatcher(store: Store, broker: BrokerPublisher, interval: Duration) {
    info!(interval_secs = interval.as_secs(), "event dispatcher started");
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match dispatch_once(&store, &broker, 100).await {
            Ok(0) => {}
            Ok(n) => debug!(delivered = n, "outbox drained"),
            Err(e) => error!(error = %e, "outbox dispatch failed"),
        }
    }
}
