//! Subscription records and descriptors.

use crate::event::{Event, EventPriority};
use crate::pattern::TypePattern;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique subscription identifier.
pub type SubscriptionId = u64;

/// Optional delivery filters supplied at subscribe time.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Deliver only events at least as urgent as this.
    pub priority_filter: Option<EventPriority>,
    /// Deliver only events from this exact source.
    pub source_filter: Option<String>,
}

impl SubscribeOptions {
    pub fn with_priority(priority: EventPriority) -> Self {
        Self {
            priority_filter: Some(priority),
            ..Self::default()
        }
    }

    pub fn with_source(source: impl Into<String>) -> Self {
        Self {
            source_filter: Some(source.into()),
            ..Self::default()
        }
    }
}

/// A registered subscription's matching state.
///
/// The handler itself lives with the delivery machinery; this struct carries
/// everything needed to decide whether an event should reach it.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub pattern: TypePattern,
    /// Stable handler identifier chosen by the caller at subscribe time.
    pub handler_id: String,
    pub priority_filter: Option<EventPriority>,
    pub source_filter: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Delivery rule: pattern matches the type, the event is at least as
    /// urgent as the priority filter, and the source filter matches exactly.
    pub fn wants(&self, event: &Event) -> bool {
        if !self.pattern.matches(&event.event_type) {
            return false;
        }
        if let Some(filter) = self.priority_filter {
            if event.priority > filter {
                return false;
            }
        }
        if let Some(filter) = &self.source_filter {
            if event.source.as_deref() != Some(filter.as_str()) {
                return false;
            }
        }
        true
    }

    pub fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id,
            pattern: self.pattern.as_str().to_string(),
            handler_id: self.handler_id.clone(),
            priority_filter: self.priority_filter,
            source_filter: self.source_filter.clone(),
            created_at: self.created_at,
        }
    }
}

/// Introspection descriptor returned by `EventBus::subscriptions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub pattern: String,
    pub handler_id: String,
    pub priority_filter: Option<EventPriority>,
    pub source_filter: Option<String>,
    pub created_at: DateTime<Utc>,
}
