//! Shared-store event bus for multi-process deployments.
//!
//! Subscriptions, event history, and a job queue live in a [`KvStore`]
//! shared by every worker process. `publish` persists the event and
//! enqueues a dispatch job; a worker resolves matching subscriptions and
//! enqueues one invoke job per match, named by the subscriber's stable
//! handler id. Whichever worker holds that handler locally executes it.
//!
//! Delivery is at-least-once: jobs may be re-run and distinct events may
//! arrive out of order across processes. Ordering holds only for a single
//! publisher feeding a single consuming worker. Store failures degrade to
//! logged no-ops and empty results so the rest of the system keeps
//! functioning.
//!
//! Persisted key layout (bit-compatible with the original deployment):
//!
//! - `event:{event_id}` — hash: `event_type`, `data`, `priority`, `source`,
//!   `correlation_id`, `timestamp`; expires after the retention window.
//! - `event_history` — list of ids, newest first, trimmed to `max_history`.
//! - `events_by_type:{event_type}` — set of ids.
//! - `subscription:{id}` — hash: `pattern`, `handler_task`,
//!   `priority_filter`, `source_filter`, `created_at`.
//! - `subscriptions_by_pattern:{pattern}` — set of ids.
//! - `all_subscriptions` — set of ids.

use super::{EventBus, EventHandler, KvStore};
use crate::config::BusConfig;
use crate::error::BusError;
use crate::event::{Event, EventPriority};
use crate::pattern::{pattern_matches, TypePattern};
use crate::subscription::{SubscribeOptions, SubscriptionId, SubscriptionInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const DISPATCH_QUEUE: &str = "jobs:dispatch";
const SUBSCRIPTION_COUNTER: &str = "subscription:next_id";
const ALL_SUBSCRIPTIONS: &str = "all_subscriptions";
const EVENT_HISTORY: &str = "event_history";

fn event_key(event_id: &str) -> String {
    format!("event:{event_id}")
}

fn subscription_key(id: SubscriptionId) -> String {
    format!("subscription:{id}")
}

fn pattern_index_key(pattern: &str) -> String {
    format!("subscriptions_by_pattern:{pattern}")
}

fn type_index_key(event_type: &str) -> String {
    format!("events_by_type:{event_type}")
}

fn invoke_queue_key(handler_id: &str) -> String {
    format!("jobs:invoke:{handler_id}")
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
enum Job {
    Dispatch {
        event_id: String,
    },
    Invoke {
        subscription_id: SubscriptionId,
        event_id: String,
    },
}

/// Shared-store [`EventBus`] implementation.
pub struct SharedBus {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn KvStore>,
    config: BusConfig,
    running: AtomicBool,
    /// Fallback id source when the shared counter is unreachable.
    fallback_id: AtomicU64,
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
    worker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SharedBus {
    pub fn new(store: Arc<dyn KvStore>, config: BusConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                running: AtomicBool::new(false),
                fallback_id: AtomicU64::new(1_000_000_000),
                handlers: RwLock::new(HashMap::new()),
                worker: Mutex::new(None),
            }),
        }
    }
}

impl Inner {
    fn persist_event(&self, event: &Event) {
        let data = serde_json::to_string(&event.data).unwrap_or_else(|_| "{}".to_string());
        let mut fields: Vec<(&str, String)> = vec![
            ("event_type", event.event_type.clone()),
            ("data", data),
            ("priority", event.priority.as_str().to_string()),
            ("timestamp", event.timestamp.to_rfc3339()),
        ];
        if let Some(source) = &event.source {
            fields.push(("source", source.clone()));
        }
        if let Some(correlation_id) = &event.correlation_id {
            fields.push(("correlation_id", correlation_id.clone()));
        }

        let key = event_key(&event.event_id);
        let result = self
            .store
            .hash_set(&key, &fields)
            .and_then(|_| self.store.expire(&key, self.config.event_ttl_secs))
            .and_then(|_| self.store.list_push_front(EVENT_HISTORY, &event.event_id))
            .and_then(|_| self.store.list_trim(EVENT_HISTORY, self.config.max_history))
            .and_then(|_| {
                self.store
                    .set_add(&type_index_key(&event.event_type), &event.event_id)
            })
            .and_then(|_| {
                let job = serde_json::to_string(&Job::Dispatch {
                    event_id: event.event_id.clone(),
                })
                .unwrap_or_default();
                self.store.list_push_front(DISPATCH_QUEUE, &job)
            });

        if let Err(e) = result {
            warn!(
                event_id = %event.event_id,
                "shared store unavailable, event dropped: {e}"
            );
        }
    }

    fn load_event(&self, event_id: &str) -> Option<Event> {
        let fields = match self.store.hash_get_all(&event_key(event_id)) {
            Ok(Some(fields)) => fields,
            Ok(None) => return None,
            Err(e) => {
                warn!(event_id, "failed to load event from shared store: {e}");
                return None;
            }
        };

        let data = fields
            .get("data")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        let timestamp = fields
            .get("timestamp")
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Some(Event {
            event_type: fields.get("event_type").cloned().unwrap_or_default(),
            data,
            priority: fields
                .get("priority")
                .map(|p| EventPriority::parse(p))
                .unwrap_or_default(),
            source: fields.get("source").cloned(),
            correlation_id: fields.get("correlation_id").cloned(),
            event_id: event_id.to_string(),
            timestamp,
        })
    }

    fn load_subscription_info(&self, id: SubscriptionId) -> Option<SubscriptionInfo> {
        let fields = self.store.hash_get_all(&subscription_key(id)).ok()??;
        Some(SubscriptionInfo {
            id,
            pattern: fields.get("pattern").cloned().unwrap_or_default(),
            handler_id: fields.get("handler_task").cloned().unwrap_or_default(),
            priority_filter: fields.get("priority_filter").map(|p| EventPriority::parse(p)),
            source_filter: fields.get("source_filter").cloned(),
            created_at: fields
                .get("created_at")
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
        })
    }

    fn subscription_ids(&self) -> Vec<SubscriptionId> {
        match self.store.set_members(ALL_SUBSCRIPTIONS) {
            Ok(members) => members.iter().filter_map(|m| m.parse().ok()).collect(),
            Err(e) => {
                warn!("failed to list subscriptions from shared store: {e}");
                Vec::new()
            }
        }
    }

    /// Resolve a dispatch job into one invoke job per matching subscription.
    fn dispatch_one(&self, event_id: &str) {
        let Some(event) = self.load_event(event_id) else {
            debug!(event_id, "dispatch job for expired or missing event");
            return;
        };

        for id in self.subscription_ids() {
            let Some(info) = self.load_subscription_info(id) else {
                continue;
            };
            if !pattern_matches(&info.pattern, &event.event_type) {
                continue;
            }
            if let Some(filter) = info.priority_filter {
                if event.priority > filter {
                    continue;
                }
            }
            if let Some(filter) = &info.source_filter {
                if event.source.as_deref() != Some(filter.as_str()) {
                    continue;
                }
            }

            let job = serde_json::to_string(&Job::Invoke {
                subscription_id: id,
                event_id: event_id.to_string(),
            })
            .unwrap_or_default();
            if let Err(e) = self
                .store
                .list_push_front(&invoke_queue_key(&info.handler_id), &job)
            {
                warn!(
                    handler = %info.handler_id,
                    event_id,
                    "failed to enqueue invoke job: {e}"
                );
            }
        }
    }

    async fn run_worker(self: Arc<Self>, cancel: CancellationToken) {
        let poll = std::time::Duration::from_millis(self.config.job_poll_interval_ms.max(10));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }

            // Any worker may resolve dispatch jobs.
            loop {
                match self.store.list_pop_back(DISPATCH_QUEUE) {
                    Ok(Some(raw)) => {
                        if let Ok(Job::Dispatch { event_id }) = serde_json::from_str(&raw) {
                            self.dispatch_one(&event_id);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("dispatch queue unavailable: {e}");
                        break;
                    }
                }
            }

            // Invoke jobs are routed by handler id; only drain queues for
            // handlers this process holds.
            let local: Vec<(String, Arc<dyn EventHandler>)> = {
                let handlers = self.handlers.read().await;
                handlers
                    .iter()
                    .map(|(id, h)| (id.clone(), h.clone()))
                    .collect()
            };

            for (handler_id, handler) in local {
                loop {
                    match self.store.list_pop_back(&invoke_queue_key(&handler_id)) {
                        Ok(Some(raw)) => {
                            let Ok(Job::Invoke { event_id, .. }) = serde_json::from_str(&raw)
                            else {
                                continue;
                            };
                            let Some(event) = self.load_event(&event_id) else {
                                continue;
                            };
                            if let Err(e) = handler.handle(&event).await {
                                error!(
                                    handler = %handler_id,
                                    event_id = %event.event_id,
                                    event_type = %event.event_type,
                                    "event handler failed: {e:#}"
                                );
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(handler = %handler_id, "invoke queue unavailable: {e}");
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl EventBus for SharedBus {
    async fn start(&self) -> Result<(), BusError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.inner.clone().run_worker(cancel.clone()));
        *self.inner.worker.lock().await = Some((cancel, handle));
        Ok(())
    }

    async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some((cancel, handle)) = self.inner.worker.lock().await.take() {
            cancel.cancel();
            if let Err(e) = handle.await {
                error!("shared bus worker task failed: {e}");
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
        // Validate before persisting anything.
        TypePattern::new(pattern)?;

        let id = match self.inner.store.incr(SUBSCRIPTION_COUNTER) {
            Ok(id) => id,
            Err(e) => {
                warn!("shared id counter unavailable, using fallback ids: {e}");
                self.inner.fallback_id.fetch_add(1, Ordering::SeqCst)
            }
        };

        let mut fields: Vec<(&str, String)> = vec![
            ("pattern", pattern.to_string()),
            ("handler_task", handler_id.to_string()),
            ("created_at", Utc::now().to_rfc3339()),
        ];
        if let Some(priority) = options.priority_filter {
            fields.push(("priority_filter", priority.as_str().to_string()));
        }
        if let Some(source) = &options.source_filter {
            fields.push(("source_filter", source.clone()));
        }

        let result = self
            .inner
            .store
            .hash_set(&subscription_key(id), &fields)
            .and_then(|_| {
                self.inner
                    .store
                    .set_add(&pattern_index_key(pattern), &id.to_string())
            })
            .and_then(|_| self.inner.store.set_add(ALL_SUBSCRIPTIONS, &id.to_string()));
        if let Err(e) = result {
            warn!(
                subscription = id,
                "failed to persist subscription, delivery degraded: {e}"
            );
        }

        self.inner
            .handlers
            .write()
            .await
            .insert(handler_id.to_string(), handler);

        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some(info) = self.inner.load_subscription_info(id) else {
            return false;
        };

        let result = self
            .inner
            .store
            .set_remove(&pattern_index_key(&info.pattern), &id.to_string())
            .and_then(|_| self.inner.store.set_remove(ALL_SUBSCRIPTIONS, &id.to_string()))
            .and_then(|_| self.inner.store.delete(&subscription_key(id)));
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(subscription = id, "failed to remove subscription: {e}");
                false
            }
        }
    }

    async fn unsubscribe_handler(&self, handler_id: &str) -> usize {
        let mut removed = 0;
        for id in self.inner.subscription_ids() {
            if let Some(info) = self.inner.load_subscription_info(id) {
                if info.handler_id == handler_id && self.unsubscribe(id).await {
                    removed += 1;
                }
            }
        }
        self.inner.handlers.write().await.remove(handler_id);
        removed
    }

    async fn publish(&self, event: Event) -> Result<(), BusError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(BusError::NotRunning);
        }
        self.inner.persist_event(&event);
        Ok(())
    }

    fn publish_sync(&self, event: Event) {
        if !self.inner.running.load(Ordering::SeqCst) {
            warn!(
                event_type = %event.event_type,
                "publish_sync on stopped bus, event discarded"
            );
            return;
        }
        self.inner.persist_event(&event);
    }

    async fn event_history(
        &self,
        limit: Option<usize>,
        event_type_pattern: Option<&str>,
    ) -> Vec<Event> {
        let limit = limit.unwrap_or(self.inner.config.max_history);
        let ids = match self
            .inner
            .store
            .list_range(EVENT_HISTORY, self.inner.config.max_history)
        {
            Ok(ids) => ids,
            Err(e) => {
                warn!("event history unavailable: {e}");
                return Vec::new();
            }
        };

        ids.iter()
            .filter_map(|id| self.inner.load_event(id))
            .filter(|e| {
                event_type_pattern
                    .map(|p| pattern_matches(p, &e.event_type))
                    .unwrap_or(true)
            })
            .take(limit)
            .collect()
    }

    async fn clear_history(&self) {
        if let Err(e) = self.inner.store.delete(EVENT_HISTORY) {
            warn!("failed to clear event history: {e}");
        }
    }

    async fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let mut infos: Vec<SubscriptionInfo> = self
            .inner
            .subscription_ids()
            .into_iter()
            .filter_map(|id| self.inner.load_subscription_info(id))
            .collect();
        infos.sort_by_key(|i| i.id);
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SqliteKv;
    use serde_json::Map;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Collector {
        received: std::sync::Mutex<Vec<Event>>,
    }

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<Event> {
            self.received.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventHandler for Collector {
        async fn handle(&self, event: &Event) -> anyhow::Result<()> {
            self.received.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    /// A store that always fails, for degraded-mode behavior.
    struct DeadStore;

    impl KvStore for DeadStore {
        fn hash_set(&self, _: &str, _: &[(&str, String)]) -> Result<(), crate::error::KvError> {
            Err(crate::error::KvError::Backend("connection refused".into()))
        }
        fn hash_get_all(
            &self,
            _: &str,
        ) -> Result<Option<HashMap<String, String>>, crate::error::KvError> {
            Err(crate::error::KvError::Backend("connection refused".into()))
        }
        fn delete(&self, _: &str) -> Result<(), crate::error::KvError> {
            Err(crate::error::KvError::Backend("connection refused".into()))
        }
        fn expire(&self, _: &str, _: i64) -> Result<(), crate::error::KvError> {
            Err(crate::error::KvError::Backend("connection refused".into()))
        }
        fn list_push_front(&self, _: &str, _: &str) -> Result<(), crate::error::KvError> {
            Err(crate::error::KvError::Backend("connection refused".into()))
        }
        fn list_pop_back(&self, _: &str) -> Result<Option<String>, crate::error::KvError> {
            Err(crate::error::KvError::Backend("connection refused".into()))
        }
        fn list_trim(&self, _: &str, _: usize) -> Result<(), crate::error::KvError> {
            Err(crate::error::KvError::Backend("connection refused".into()))
        }
        fn list_range(&self, _: &str, _: usize) -> Result<Vec<String>, crate::error::KvError> {
            Err(crate::error::KvError::Backend("connection refused".into()))
        }
        fn set_add(&self, _: &str, _: &str) -> Result<(), crate::error::KvError> {
            Err(crate::error::KvError::Backend("connection refused".into()))
        }
        fn set_remove(&self, _: &str, _: &str) -> Result<(), crate::error::KvError> {
            Err(crate::error::KvError::Backend("connection refused".into()))
        }
        fn set_members(&self, _: &str) -> Result<Vec<String>, crate::error::KvError> {
            Err(crate::error::KvError::Backend("connection refused".into()))
        }
        fn incr(&self, _: &str) -> Result<u64, crate::error::KvError> {
            Err(crate::error::KvError::Backend("connection refused".into()))
        }
    }

    fn shared_bus(temp: &TempDir) -> (SharedBus, Arc<SqliteKv>) {
        let kv = Arc::new(SqliteKv::open(&temp.path().join("bus.db")).unwrap());
        let bus = SharedBus::new(
            kv.clone(),
            BusConfig {
                job_poll_interval_ms: 20,
                ..BusConfig::default()
            },
        );
        (bus, kv)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn publishes_through_store_to_matching_handler() {
        let temp = TempDir::new().unwrap();
        let (bus, _kv) = shared_bus(&temp);
        bus.start().await.unwrap();

        let collector = Collector::new();
        bus.subscribe("agent.*", "agent-log", collector.clone(), SubscribeOptions::default())
            .await
            .unwrap();

        let event = Event::builder("agent.message.sent")
            .field("content", "hi")
            .build();
        bus.publish(event).await.unwrap();

        let c = collector.clone();
        wait_until(move || c.events().len() == 1).await;
        assert_eq!(collector.events()[0].event_type, "agent.message.sent");

        bus.stop().await;
    }

    #[tokio::test]
    async fn persists_event_hash_with_layout_fields() {
        let temp = TempDir::new().unwrap();
        let (bus, kv) = shared_bus(&temp);
        bus.start().await.unwrap();

        let event = Event::builder("memory.entry.created")
            .field("entry_id", "42")
            .source("memory")
            .build();
        let event_id = event.event_id.clone();
        bus.publish(event).await.unwrap();

        let fields = kv
            .hash_get_all(&format!("event:{event_id}"))
            .unwrap()
            .expect("event hash persisted");
        assert_eq!(fields["event_type"], "memory.entry.created");
        assert_eq!(fields["priority"], "normal");
        assert_eq!(fields["source"], "memory");
        assert!(fields["data"].contains("entry_id"));

        let history = kv.list_range("event_history", 10).unwrap();
        assert_eq!(history, vec![event_id.clone()]);

        let by_type = kv.set_members("events_by_type:memory.entry.created").unwrap();
        assert_eq!(by_type, vec![event_id]);

        bus.stop().await;
    }

    #[tokio::test]
    async fn dispatch_enqueues_one_invoke_job_per_match() {
        let temp = TempDir::new().unwrap();
        let (bus, _kv) = shared_bus(&temp);
        bus.start().await.unwrap();

        let a = Collector::new();
        let b = Collector::new();
        bus.subscribe("test.*", "worker-a", a.clone(), SubscribeOptions::default())
            .await
            .unwrap();
        bus.subscribe("test.*", "worker-b", b.clone(), SubscribeOptions::default())
            .await
            .unwrap();

        bus.publish(Event::new("test.fanout", Map::new())).await.unwrap();

        let (ca, cb) = (a.clone(), b.clone());
        wait_until(move || ca.events().len() == 1 && cb.events().len() == 1).await;

        bus.stop().await;
    }

    #[tokio::test]
    async fn subscriptions_survive_in_store_across_instances() {
        let temp = TempDir::new().unwrap();

        {
            let (bus, _kv) = shared_bus(&temp);
            let collector = Collector::new();
            bus.subscribe("agent.*", "persistent", collector, SubscribeOptions::default())
                .await
                .unwrap();
        }

        // A second process sees the same registry.
        let (bus, _kv) = shared_bus(&temp);
        let subs = bus.subscriptions().await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].pattern, "agent.*");
        assert_eq!(subs[0].handler_id, "persistent");
    }

    #[tokio::test]
    async fn unsubscribe_removes_store_entries() {
        let temp = TempDir::new().unwrap();
        let (bus, kv) = shared_bus(&temp);

        let collector = Collector::new();
        let id = bus
            .subscribe("a.*", "h", collector, SubscribeOptions::default())
            .await
            .unwrap();

        assert!(bus.unsubscribe(id).await);
        assert!(!bus.unsubscribe(id).await);
        assert!(kv
            .hash_get_all(&format!("subscription:{id}"))
            .unwrap()
            .is_none());
        assert!(kv.set_members("all_subscriptions").unwrap().is_empty());
    }

    #[tokio::test]
    async fn dead_store_degrades_without_panicking() {
        let bus = SharedBus::new(Arc::new(DeadStore), BusConfig::default());
        bus.start().await.unwrap();

        let collector = Collector::new();
        // Subscribe still hands out an id from the fallback counter.
        let id = bus
            .subscribe("*", "h", collector, SubscribeOptions::default())
            .await
            .unwrap();
        assert!(id >= 1_000_000_000);

        // Publish succeeds (degraded, logged) and history reads empty.
        bus.publish(Event::new("test.x", Map::new())).await.unwrap();
        assert!(bus.event_history(None, None).await.is_empty());
        assert!(bus.subscriptions().await.is_empty());

        bus.stop().await;
    }
}
