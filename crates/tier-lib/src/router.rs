//! Dispatch of decoded envelopes to per-kind handlers

use crate::envelope::{Envelope, NoticeKind};
use crate::observability::ScalerMetrics;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Handles every envelope of one notice kind
#[async_trait]
pub trait NoticeHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("no handler registered for required notice kind {0}")]
    MissingHandler(NoticeKind),

    #[error("more than one handler registered for notice kind {0}")]
    DuplicateHandler(NoticeKind),
}

/// Collects handlers and validates them against the kinds a service must serve
pub struct MessageRouterBuilder {
    required: Vec<NoticeKind>,
    handlers: HashMap<NoticeKind, Arc<dyn NoticeHandler>>,
    duplicate: Option<NoticeKind>,
}

impl MessageRouterBuilder {
    pub fn route(mut self, kind: NoticeKind, handler: Arc<dyn NoticeHandler>) -> Self {
        if self.handlers.insert(kind, handler).is_some() && self.duplicate.is_none() {
            self.duplicate = Some(kind);
        }
        self
    }

    /// Register one handler for several kinds
    pub fn route_all(mut self, kinds: &[NoticeKind], handler: Arc<dyn NoticeHandler>) -> Self {
        for kind in kinds {
            self = self.route(*kind, Arc::clone(&handler));
        }
        self
    }

    pub fn build(self) -> Result<MessageRouter, RouterError> {
        if let Some(kind) = self.duplicate {
            return Err(RouterError::DuplicateHandler(kind));
        }
        if let Some(kind) = self
            .required
            .iter()
            .find(|kind| !self.handlers.contains_key(kind))
        {
            return Err(RouterError::MissingHandler(*kind));
        }

        Ok(MessageRouter {
            handlers: self.handlers,
            metrics: ScalerMetrics::new(),
        })
    }
}

/// Immutable kind → handler table
pub struct MessageRouter {
    handlers: HashMap<NoticeKind, Arc<dyn NoticeHandler>>,
    metrics: ScalerMetrics,
}

impl MessageRouter {
    pub fn builder(required: &[NoticeKind]) -> MessageRouterBuilder {
        MessageRouterBuilder {
            required: required.to_vec(),
            handlers: HashMap::new(),
            duplicate: None,
        }
    }

    pub fn handles(&self, kind: NoticeKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Run the handler for the envelope's kind. Errors are logged, never returned.
    pub async fn dispatch(&self, envelope: Envelope) {
        let kind = envelope.kind();
        let Some(handler) = self.handlers.get(&kind) else {
            warn!(
                kind = %kind,
                instance = %envelope.instance_name,
                "No handler for notice kind, dropping envelope"
            );
            return;
        };

        let envelope_id = envelope.id;
        let instance = envelope.instance_name.clone();
        let started = Instant::now();

        match handler.handle(envelope).await {
            Ok(()) => debug!(kind = %kind, instance = %instance, "Envelope handled"),
            Err(e) => error!(
                kind = %kind,
                instance = %instance,
                envelope_id = %envelope_id,
                error = %format!("{:#}", e),
                "Handler failed"
            ),
        }

        self.metrics
            .observe_dispatch_latency(started.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Payload;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<NoticeKind>>,
    }

    #[async_trait]
    impl NoticeHandler for Recorder {
        async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(envelope.kind());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl NoticeHandler for Failing {
        async fn handle(&self, _envelope: Envelope) -> anyhow::Result<()> {
            anyhow::bail!("store unavailable")
        }
    }

    #[test]
    fn test_build_requires_every_kind() {
        let result = MessageRouter::builder(&[NoticeKind::Up, NoticeKind::Metrics])
            .route(NoticeKind::Up, Arc::new(Recorder::default()))
            .build();

        assert_eq!(
            result.err(),
            Some(RouterError::MissingHandler(NoticeKind::Metrics))
        );
    }

    #[test]
    fn test_build_rejects_duplicate_handler() {
        let result = MessageRouter::builder(&[NoticeKind::Up])
            .route(NoticeKind::Up, Arc::new(Recorder::default()))
            .route(NoticeKind::Up, Arc::new(Recorder::default()))
            .build();

        assert_eq!(
            result.err(),
            Some(RouterError::DuplicateHandler(NoticeKind::Up))
        );
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_kind_and_drops_unknown() {
        let lifecycle = Arc::new(Recorder::default());
        let router = MessageRouter::builder(&NoticeKind::LIFECYCLE)
            .route_all(&NoticeKind::LIFECYCLE, lifecycle.clone())
            .build()
            .unwrap();

        router.dispatch(Envelope::new("h1", "1.0", Payload::Up)).await;
        router.dispatch(Envelope::new("h1", "1.0", Payload::Down)).await;
        router
            .dispatch(Envelope::new(
                "h1",
                "1.0",
                Payload::Threshold(Default::default()),
            ))
            .await;

        assert!(!router.handles(NoticeKind::Threshold));
        assert_eq!(
            *lifecycle.seen.lock().unwrap(),
            vec![NoticeKind::Up, NoticeKind::Down]
        );
    }

    #[tokio::test]
    async fn test_handler_error_is_contained() {
        let router = MessageRouter::builder(&[NoticeKind::Install])
            .route(NoticeKind::Install, Arc::new(Failing))
            .build()
            .unwrap();

        router
            .dispatch(Envelope::new("h1", "1.0", Payload::Install))
            .await;
    }
}
