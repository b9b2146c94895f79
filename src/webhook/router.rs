use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::event::{EventKind, ProcessorEvent};
use crate::error::AppResult;
use crate::handlers::{
    AccountUpdatedHandler, ChargeFailedHandler, ChargeSucceededHandler, HandlerContext, MovementFailedHandler,
    MovementPaidHandler, Rail, TransferCreatedHandler,
};

/// What a handler did with an event. Every variant counts as processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerOutcome {
    Applied,
    AlreadyApplied,
    TargetNotFound,
    Ignored,
}

/// Event handler trait - one implementation per event kind
///
/// INVARIANTS:
/// - replaying an event already applied must produce no writes
/// - every write goes through a single unit of work
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &ProcessorEvent) -> AppResult<HandlerOutcome>;
}

/// EventRouter - routes processor events to their handler
pub struct EventRouter {
    handlers: HashMap<EventKind, Arc<dyn EventHandler>>,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Router with a handler for every known event kind
    pub fn with_default_handlers(ctx: HandlerContext) -> Self {
        let mut router = Self::new();
        for kind in EventKind::ALL {
            // exhaustive: a new kind does not compile until it has a handler
            let handler: Arc<dyn EventHandler> = match kind {
                EventKind::ChargeSucceeded => Arc::new(ChargeSucceededHandler::new(ctx.clone())),
                EventKind::ChargeFailed => Arc::new(ChargeFailedHandler::new(ctx.clone())),
                EventKind::TransferCreated => Arc::new(TransferCreatedHandler::new(ctx.clone())),
                EventKind::TransferPaid => Arc::new(MovementPaidHandler::new(ctx.clone(), Rail::Transfer)),
                EventKind::TransferFailed => Arc::new(MovementFailedHandler::new(ctx.clone(), Rail::Transfer)),
                EventKind::AccountUpdated => Arc::new(AccountUpdatedHandler::new(ctx.clone())),
                EventKind::PayoutPaid => Arc::new(MovementPaidHandler::new(ctx.clone(), Rail::Payout)),
                EventKind::PayoutFailed => Arc::new(MovementFailedHandler::new(ctx.clone(), Rail::Payout)),
            };
            router.register(kind, handler);
        }
        router
    }

    /// Register a handler for an event kind
    ///
    /// Only call this during initialization
    pub fn register(&mut self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        info!("Registering webhook handler for {}", kind);
        self.handlers.insert(kind, handler);
    }

    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn dispatch(&self, event: &ProcessorEvent) -> AppResult<HandlerOutcome> {
        let Some(kind) = event.kind() else {
            info!("Unhandled webhook event type: {}", event.event_type);
            return Ok(HandlerOutcome::Ignored);
        };

        let Some(handler) = self.handlers.get(&kind) else {
            warn!("No handler registered for {}", kind);
            return Ok(HandlerOutcome::Ignored);
        };

        handler.handle(event).await
    }

    pub fn registered_kinds(&self) -> Vec<EventKind> {
        self.handlers.keys().copied().collect()
    }
}
