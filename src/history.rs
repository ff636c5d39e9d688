//! Bounded in-memory history of recently published events.

use crate::event::Event;
use crate::pattern::pattern_matches;
use std::collections::VecDeque;
use std::sync::Arc;

/// Ring of the most recent events, oldest evicted first.
#[derive(Debug)]
pub struct EventHistory {
    events: VecDeque<Arc<Event>>,
    max_events: usize,
}

impl EventHistory {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_events.min(1024)),
            max_events,
        }
    }

    /// Record an event, evicting the oldest entry when full.
    pub fn record(&mut self, event: Arc<Event>) {
        if self.max_events == 0 {
            return;
        }
        if self.events.len() == self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Query most-recent-first, optionally filtered by the same glob
    /// semantics subscriptions use.
    pub fn query(&self, limit: Option<usize>, event_type_pattern: Option<&str>) -> Vec<Event> {
        let limit = limit.unwrap_or(usize::MAX);
        self.events
            .iter()
            .rev()
            .filter(|e| {
                event_type_pattern
                    .map(|p| pattern_matches(p, &e.event_type))
                    .unwrap_or(true)
            })
            .take(limit)
            .map(|e| (**e).clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
