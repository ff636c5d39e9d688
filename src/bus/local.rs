//! In-process event bus.
//!
//! One dispatcher task drains an ordered publish queue. Every subscription
//! owns a private delivery queue and worker task: events reach any single
//! handler in publish order, and a slow or failing handler only ever delays
//! its own queue. Unsubscribing cancels the worker, so events not yet
//! dispatched to that subscriber are dropped immediately.

use super::{EventBus, EventHandler};
use crate::config::BusConfig;
use crate::error::BusError;
use crate::event::Event;
use crate::history::EventHistory;
use crate::pattern::TypePattern;
use crate::subscription::{
    SubscribeOptions, Subscription, SubscriptionId, SubscriptionInfo,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

struct SubscriptionEntry {
    subscription: Subscription,
    queue: mpsc::UnboundedSender<Arc<Event>>,
    cancel: CancellationToken,
}

/// In-process [`EventBus`] implementation.
pub struct LocalBus {
    inner: Arc<Inner>,
}

struct Inner {
    running: AtomicBool,
    next_id: AtomicU64,
    // Publish side of the dispatch queue. std lock: accessed from the
    // synchronous publish_sync path and never held across await.
    publish_tx: std::sync::RwLock<Option<mpsc::UnboundedSender<Arc<Event>>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    registry: RwLock<HashMap<SubscriptionId, SubscriptionEntry>>,
    history: RwLock<EventHistory>,
}

impl LocalBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                running: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                publish_tx: std::sync::RwLock::new(None),
                dispatcher: Mutex::new(None),
                registry: RwLock::new(HashMap::new()),
                history: RwLock::new(EventHistory::new(config.max_history)),
            }),
        }
    }

    fn send_to_dispatcher(&self, event: Event) -> Result<(), BusError> {
        let guard = self
            .inner
            .publish_tx
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(tx) = guard.as_ref() {
            if tx.send(Arc::new(event)).is_ok() {
                return Ok(());
            }
        }
        Err(BusError::NotRunning)
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

#[async_trait]
impl EventBus for LocalBus {
    async fn start(&self) -> Result<(), BusError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<Event>>();
        {
            let mut guard = self
                .inner
                .publish_tx
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *guard = Some(tx);
        }

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                inner.history.write().await.record(event.clone());

                let registry = inner.registry.read().await;
                for entry in registry.values() {
                    if entry.subscription.wants(&event) {
                        // A closed queue means the worker is gone; the
                        // subscription is being torn down concurrently.
                        let _ = entry.queue.send(event.clone());
                    }
                }
            }
            debug!("event dispatcher drained");
        });

        *self.inner.dispatcher.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        // Closing the publish side lets the dispatcher drain what is already
        // queued and exit.
        {
            let mut guard = self
                .inner
                .publish_tx
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.take();
        }

        if let Some(handle) = self.inner.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                error!("event dispatcher task failed: {e}");
            }
        }
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler_id: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId, BusError> {
        let pattern = TypePattern::new(pattern)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);

        let subscription = Subscription {
            id,
            pattern,
            handler_id: handler_id.to_string(),
            priority_filter: options.priority_filter,
            source_filter: options.source_filter,
            created_at: Utc::now(),
        };

        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<Arc<Event>>();
        let cancel = CancellationToken::new();

        let worker_cancel = cancel.clone();
        let worker_handler_id = subscription.handler_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = worker_cancel.cancelled() => break,
                    received = queue_rx.recv() => match received {
                        Some(event) => {
                            if let Err(e) = handler.handle(&event).await {
                                error!(
                                    handler = %worker_handler_id,
                                    event_id = %event.event_id,
                                    event_type = %event.event_type,
                                    "event handler failed: {e:#}"
                                );
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        self.inner.registry.write().await.insert(
            id,
            SubscriptionEntry {
                subscription,
                queue: queue_tx,
                cancel,
            },
        );

        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.inner.registry.write().await.remove(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    async fn unsubscribe_handler(&self, handler_id: &str) -> usize {
        let mut registry = self.inner.registry.write().await;
        let ids: Vec<SubscriptionId> = registry
            .iter()
            .filter(|(_, e)| e.subscription.handler_id == handler_id)
            .map(|(id, _)| *id)
            .collect();

        for id in &ids {
            if let Some(entry) = registry.remove(id) {
                entry.cancel.cancel();
            }
        }
        ids.len()
    }

    async fn publish(&self, event: Event) -> Result<(), BusError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(BusError::NotRunning);
        }
        self.send_to_dispatcher(event)
    }

    fn publish_sync(&self, event: Event) {
        if !self.inner.running.load(Ordering::SeqCst) {
            warn!(
                event_type = %event.event_type,
                "publish_sync on stopped bus, event discarded"
            );
            return;
        }
        if let Err(e) = self.send_to_dispatcher(event) {
            warn!("publish_sync failed, event discarded: {e}");
        }
    }

    async fn event_history(
        &self,
        limit: Option<usize>,
        event_type_pattern: Option<&str>,
    ) -> Vec<Event> {
        self.inner
            .history
            .read()
            .await
            .query(limit, event_type_pattern)
    }

    async fn clear_history(&self) {
        self.inner.history.write().await.clear();
    }

    async fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let registry = self.inner.registry.read().await;
        let mut infos: Vec<SubscriptionInfo> = registry
            .values()
            .map(|e| e.subscription.info())
            .collect();
        infos.sort_by_key(|i| i.id);
        infos
    }
}
