//! # Dead-Letter Handling
//!
//! Hooks invoked by the scheduler's DLQ loop for every event that exhausted
//! its retry budget: first the [`DlqHandler`] (archive, forward, repair),
//! then the [`DlqAlertHandler`] (page someone).

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tracing::error;

use crate::error::{OutboxError, Result};
use crate::event::OutboxEvent;

#[async_trait]
pub trait DlqHandler: Send + Sync {
    async fn handle(&self, event: &OutboxEvent) -> Result<()>;
}

#[async_trait]
pub trait DlqAlertHandler: Send + Sync {
    async fn alert(&self, event: &OutboxEvent) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpDlqHandler;

#[async_trait]
impl DlqHandler for NoOpDlqHandler {
    async fn handle(&self, _event: &OutboxEvent) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpDlqAlertHandler;

#[async_trait]
impl DlqAlertHandler for NoOpDlqAlertHandler {
    async fn alert(&self, _event: &OutboxEvent) -> Result<()> {
        Ok(())
    }
}

/// Wraps an async closure as a [`DlqHandler`].
pub struct FnDlqHandler<F>(F);

impl<F, Fut> FnDlqHandler<F>
where
    F: Fn(OutboxEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> DlqHandler for FnDlqHandler<F>
where
    F: Fn(OutboxEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, event: &OutboxEvent) -> Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Wraps an async closure as a [`DlqAlertHandler`].
pub struct FnDlqAlertHandler<F>(F);

impl<F, Fut> FnDlqAlertHandler<F>
where
    F: Fn(OutboxEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> DlqAlertHandler for FnDlqAlertHandler<F>
where
    F: Fn(OutboxEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn alert(&self, event: &OutboxEvent) -> Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Emits one structured `error!` record per dead-lettered event.
///
/// Works as either hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDlqHandler;

impl LoggingDlqHandler {
    fn log(event: &OutboxEvent) {
        error!(
            event_id = %event.id,
            tenant_id = %event.tenant_id,
            aggregate_type = %event.aggregate_type,
            aggregate_id = %event.aggregate_id,
            event_type = %event.event_type,
            retry_count = event.retry_count,
            last_error = event.last_error.as_deref().unwrap_or(""),
            "Outbox event dead-lettered"
        );
    }
}

#[async_trait]
impl DlqHandler for LoggingDlqHandler {
    async fn handle(&self, event: &OutboxEvent) -> Result<()> {
        Self::log(event);
        Ok(())
    }
}

#[async_trait]
impl DlqAlertHandler for LoggingDlqHandler {
    async fn alert(&self, event: &OutboxEvent) -> Result<()> {
        Self::log(event);
        Ok(())
    }
}

/// Runs every inner handler, even after a failure, and returns the last
/// error seen.
#[derive(Clone, Default)]
pub struct CompositeDlqHandler {
    handlers: Vec<Arc<dyn DlqHandler>>,
}

impl CompositeDlqHandler {
    pub fn new(handlers: Vec<Arc<dyn DlqHandler>>) -> Self {
        Self { handlers }
    }

    pub fn with_handler(mut self, handler: impl DlqHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl DlqHandler for CompositeDlqHandler {
    async fn handle(&self, event: &OutboxEvent) -> Result<()> {
        let mut last_error: Option<OutboxError> = None;
        for handler in &self.handlers {
            if let Err(e) = handler.handle(event).await {
                last_error = Some(e);
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
