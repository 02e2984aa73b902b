//! Event Publisher Adapters
//!
//! Sinks for the mutations the reconcilers report: an audit log line per
//! event, a per-type Prometheus counter, a fan-out over several sinks, and
//! an in-memory collector for tests.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::domain::events::DomainEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;
use crate::metrics::ControllerMetrics;

/// Writes one structured `info` line per event.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditLogPublisher;

impl AuditLogPublisher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventPublisher for AuditLogPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        let kind = event.event_type();
        match &event {
            DomainEvent::ClaimCreated {
                namespace,
                storage,
                claim,
                capacity,
                storage_class,
                ..
            } => info!(
                event = kind,
                namespace = %namespace,
                storage = %storage,
                claim = %claim,
                capacity = %capacity,
                storage_class = %storage_class,
                "Created claim"
            ),
            DomainEvent::ClaimResized {
                namespace,
                storage,
                claim,
                old_capacity,
                new_capacity,
                ..
            } => info!(
                event = kind,
                namespace = %namespace,
                storage = %storage,
                claim = %claim,
                old_capacity = old_capacity.as_deref().unwrap_or("<unset>"),
                new_capacity = %new_capacity,
                "Resized claim"
            ),
            DomainEvent::AttachmentCreated {
                attachment,
                volume,
                node,
                attacher,
                ..
            } => info!(
                event = kind,
                attachment = %attachment,
                volume = %volume,
                node = %node,
                attacher = %attacher,
                "Created volume attachment"
            ),
            DomainEvent::AttachmentDeleted {
                attachment,
                old_node,
                new_node,
                ..
            } => info!(
                event = kind,
                attachment = %attachment,
                old_node = %old_node,
                new_node = %new_node,
                "Deleted volume attachment for node move"
            ),
        }
        Ok(())
    }
}

/// Counts events per type in `storage_provisioner_domain_events_total`.
#[derive(Debug, Clone)]
pub struct MetricsEventPublisher {
    metrics: Arc<ControllerMetrics>,
}

impl MetricsEventPublisher {
    pub fn new(metrics: Arc<ControllerMetrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl EventPublisher for MetricsEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        self.metrics.record_event(event.event_type());
        Ok(())
    }
}

/// Hands every event to each sink in order.
///
/// A failing sink does not stop the others; the first error is returned
/// once all of them ran.
#[derive(Default)]
pub struct FanOutPublisher {
    sinks: Vec<Arc<dyn EventPublisher>>,
}

impl FanOutPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventPublisher>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl std::fmt::Debug for FanOutPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutPublisher")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[async_trait]
impl EventPublisher for FanOutPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.publish(event.clone()).await {
                warn!(event = event.event_type(), error = %e, "Event sink failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Keeps every published event for later inspection.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: parking_lot::RwLock<Vec<DomainEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<DomainEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use assert_matches::assert_matches;

    struct Broken;

    #[async_trait]
    impl EventPublisher for Broken {
        async fn publish(&self, _event: DomainEvent) -> Result<()> {
            Err(Error::Internal("sink down".into()))
        }
    }

    #[tokio::test]
    async fn test_audit_log_accepts_every_event() {
        let publisher = AuditLogPublisher::new();
        for event in [
            DomainEvent::claim_created("ns", "data", "ns-data-abcde", "1Gi", "fast"),
            DomainEvent::claim_resized("ns", "data", "ns-data-abcde", None, "2Gi"),
            DomainEvent::attachment_created("ns-data-abcde", "pv-1", "node-1", "csi.example.com"),
            DomainEvent::attachment_deleted("ns-data-abcde", "node-1", "node-2"),
        ] {
            publisher.publish(event).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_metrics_publisher_counts_by_type() {
        let metrics = Arc::new(ControllerMetrics::new().unwrap());
        let publisher = MetricsEventPublisher::new(metrics.clone());

        publisher
            .publish(DomainEvent::claim_created("ns", "a", "ns-a-1", "1Gi", "fast"))
            .await
            .unwrap();
        publisher
            .publish(DomainEvent::claim_created("ns", "b", "ns-b-1", "1Gi", "fast"))
            .await
            .unwrap();
        publisher
            .publish(DomainEvent::attachment_deleted("ns-a-1", "node-1", "node-2"))
            .await
            .unwrap();

        assert_eq!(metrics.event_count("ClaimCreated"), 2);
        assert_eq!(metrics.event_count("AttachmentDeleted"), 1);
        assert_eq!(metrics.event_count("ClaimResized"), 0);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_sink() {
        let metrics = Arc::new(ControllerMetrics::new().unwrap());
        let collector = Arc::new(InMemoryEventCollector::new());
        let publisher = FanOutPublisher::new()
            .with_sink(Arc::new(AuditLogPublisher::new()))
            .with_sink(Arc::new(MetricsEventPublisher::new(metrics.clone())))
            .with_sink(collector.clone());

        publisher
            .publish(DomainEvent::attachment_created("c", "pv-1", "node-1", "csi.example.com"))
            .await
            .unwrap();

        assert_eq!(collector.len(), 1);
        assert_eq!(metrics.event_count("AttachmentCreated"), 1);
    }

    #[tokio::test]
    async fn test_fan_out_keeps_going_past_a_failing_sink() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let publisher = FanOutPublisher::new()
            .with_sink(Arc::new(Broken))
            .with_sink(collector.clone());

        let result = publisher
            .publish(DomainEvent::claim_resized("ns", "a", "ns-a-1", Some("1Gi".into()), "2Gi"))
            .await;

        assert_matches!(result, Err(Error::Internal(_)));
        assert_eq!(collector.events_of_type("ClaimResized").len(), 1);
    }

    #[tokio::test]
    async fn test_empty_fan_out_is_a_no_op() {
        assert!(FanOutPublisher::new()
            .publish(DomainEvent::attachment_deleted("c", "node-1", "node-2"))
            .await
            .is_ok());
    }
}
