//! Publish/subscribe event bus.
//!
//! One [`EventBus`] contract, two interchangeable backends:
//!
//! - [`LocalBus`] — in-process dispatcher for a single runtime. Events are
//!   delivered to subscribers in publish order; each subscription drains its
//!   own queue, so a slow handler never stalls the dispatcher or its peers.
//! - [`SharedBus`] — multi-process deployments. Subscriptions, history, and
//!   a job queue live in a shared key-value store; delivery is decoupled,
//!   at-least-once, and may duplicate or reorder across distinct events.
//!
//! Application code holds an `Arc<dyn EventBus>` and never depends on which
//! backend is active.

mod kv;
mod local;
mod shared;

pub use kv::{KvStore, SqliteKv};
pub use local::LocalBus;
pub use shared::SharedBus;

use crate::error::BusError;
use crate::event::Event;
use crate::subscription::{SubscribeOptions, SubscriptionId, SubscriptionInfo};
use async_trait::async_trait;
use std::sync::Arc;

/// Receives events matched to a subscription.
///
/// Handlers run outside the dispatcher's critical path. An error return is
/// caught at the dispatch boundary and logged; it never reaches the
/// publisher or other subscribers. Blocking work belongs in
/// `tokio::task::spawn_blocking` inside the handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Adapter turning a synchronous closure into an [`EventHandler`].
pub struct FnHandler<F> {
    func: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.func)(event)
    }
}

/// The bus contract shared by both backends.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Start delivering. Idempotent; must be called before `publish`.
    async fn start(&self) -> Result<(), BusError>;

    /// Drain and stop the dispatcher. Idempotent.
    async fn stop(&self);

    /// Register a handler for every event whose type matches `pattern`.
    ///
    /// `handler_id` is a stable identifier chosen by the caller; it keys
    /// `unsubscribe_handler` and, on the shared backend, names the worker
    /// job that invokes the handler.
    async fn subscribe(
        &self,
        pattern: &str,
        handler_id: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId, BusError>;

    /// Remove one subscription. Returns `false` if the id is unknown.
    async fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Remove every subscription registered under `handler_id`; returns the
    /// number removed.
    async fn unsubscribe_handler(&self, handler_id: &str) -> usize;

    /// Enqueue an event for delivery. Fails with [`BusError::NotRunning`]
    /// before `start`.
    async fn publish(&self, event: Event) -> Result<(), BusError>;

    /// Fire-and-forget variant: logs and discards when the bus is not
    /// running instead of raising.
    fn publish_sync(&self, event: Event);

    /// Recently published events, most recent first, optionally filtered by
    /// the same glob semantics subscriptions use.
    async fn event_history(
        &self,
        limit: Option<usize>,
        event_type_pattern: Option<&str>,
    ) -> Vec<Event>;

    /// Drop all retained history.
    async fn clear_history(&self);

    /// Descriptors of all live subscriptions.
    async fn subscriptions(&self) -> Vec<SubscriptionInfo>;
}
