//! NATS JetStream stream of execution events.
//!
//! Every event appended to the execution log can be mirrored to a JetStream
//! stream so other services (notifications, analytics) can follow executions
//! without polling the database. Events are published to subjects like
//! `automation.execution.<execution_id>`, one subject per execution for easy
//! replay.

use crate::envelope::Envelope;
use crate::error::StoreError;
use crate::execution::ExecutionEvent;
use crate::log::EventSink;
use async_nats::jetstream;
use async_trait::async_trait;
use dealflow_core::{ExecutionId, OrganizationId};
use futures::StreamExt;
use serde::Deserialize;
use std::time::Duration;

/// Subject prefix for execution events.
const EXECUTION_SUBJECT_PREFIX: &str = "automation.execution";

/// Default stream name for execution events.
const EVENTS_STREAM_NAME: &str = "AUTOMATION_EVENTS";

/// How long replay waits for the next message before assuming the end.
const REPLAY_IDLE_TIMEOUT: Duration = Duration::from_millis(100);

/// Configuration for the NATS event stream.
#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL.
    pub url: String,
    /// Stream name for events (defaults to AUTOMATION_EVENTS).
    #[serde(default)]
    pub stream_name: Option<String>,
}

impl NatsConfig {
    /// Creates a new config with the given NATS URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream_name: None,
        }
    }

    fn stream(&self) -> &str {
        self.stream_name.as_deref().unwrap_or(EVENTS_STREAM_NAME)
    }
}

/// Publishes execution events to JetStream.
pub struct NatsEventStream {
    jetstream: jetstream::Context,
    config: NatsConfig,
}

impl NatsEventStream {
    /// Connects to NATS and makes sure the stream exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or stream setup fails.
    pub async fn connect(config: NatsConfig) -> Result<Self, StoreError> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| StoreError::Unavailable {
                reason: format!("failed to connect to NATS: {e}"),
            })?;

        let jetstream = async_nats::jetstream::new(client);

        let stream_config = jetstream::stream::Config {
            name: config.stream().to_string(),
            subjects: vec![format!("{EXECUTION_SUBJECT_PREFIX}.>")],
            storage: jetstream::stream::StorageType::File,
            retention: jetstream::stream::RetentionPolicy::Limits,
            ..Default::default()
        };

        jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| StoreError::Unavailable {
                reason: format!("failed to create events stream: {e}"),
            })?;

        tracing::info!(stream = config.stream(), "execution event stream ready");

        Ok(Self { jetstream, config })
    }

    /// Returns the subject for an execution's events.
    fn subject(execution_id: ExecutionId) -> String {
        format!("{EXECUTION_SUBJECT_PREFIX}.{execution_id}")
    }

    /// Reads back every event published for an execution.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be read or a message is malformed.
    pub async fn replay(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Vec<Envelope<ExecutionEvent>>, StoreError> {
        let load_failed = |message: String| StoreError::Backend { reason: message };

        let stream = self
            .jetstream
            .get_stream(self.config.stream())
            .await
            .map_err(|e| load_failed(format!("failed to get stream: {e}")))?;

        let consumer = stream
            .create_consumer(jetstream::consumer::pull::Config {
                filter_subject: Self::subject(execution_id),
                deliver_policy: jetstream::consumer::DeliverPolicy::All,
                ..Default::default()
            })
            .await
            .map_err(|e| load_failed(format!("failed to create consumer: {e}")))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| load_failed(format!("failed to get messages: {e}")))?;

        let mut events = Vec::new();
        while let Ok(Some(message)) = tokio::time::timeout(REPLAY_IDLE_TIMEOUT, messages.next()).await {
            let message = message.map_err(|e| load_failed(e.to_string()))?;
            let envelope = Envelope::<ExecutionEvent>::from_json_bytes(&message.payload)
                .map_err(|e| StoreError::Corrupt {
                    reason: format!("failed to deserialize event: {e}"),
                })?;
            events.push(envelope);
            message
                .ack()
                .await
                .map_err(|e| load_failed(format!("failed to ack message: {e}")))?;
        }

        Ok(events)
    }
}

#[async_trait]
impl EventSink for NatsEventStream {
    async fn publish(
        &self,
        organization_id: OrganizationId,
        event: &ExecutionEvent,
    ) -> Result<(), StoreError> {
        let subject = Self::subject(event.execution_id());
        let bytes = Envelope::new(organization_id, event)
            .to_json_bytes()
            .map_err(|e| StoreError::Backend {
                reason: format!("failed to serialize event: {e}"),
            })?;

        self.jetstream
            .publish(subject, bytes.into())
            .await
            .map_err(|e| StoreError::Unavailable {
                reason: e.to_string(),
            })?
            .await
            .map_err(|e| StoreError::Unavailable {
                reason: e.to_string(),
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_stream_name() {
        let config = NatsConfig::new("nats://localhost:4222");
        assert_eq!(config.stream(), "AUTOMATION_EVENTS");

        let named = NatsConfig {
            stream_name: Some("CUSTOM".to_string()),
            ..config
        };
        assert_eq!(named.stream(), "CUSTOM");
    }

    #[test]
    fn subject_per_execution() {
        let id = ExecutionId::new();
        assert_eq!(
            NatsEventStream::subject(id),
            format!("automation.execution.{id}")
        );
    }
}
