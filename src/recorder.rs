use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex as StdMutex,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const EVENT_TYPE_NORMAL: &str = "Normal";
pub const EVENT_TYPE_WARNING: &str = "Warning";

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub involved_object_id: String,
    pub involved_object_labels: HashMap<String, String>,
    pub event_type: String,
    pub reason: String,
    pub message: String,
    pub event_time: i64,
}

/// Bounded in-memory event log; the oldest events are evicted first.
pub struct EventRecorder {
    events: StdMutex<VecDeque<Event>>,
    capacity: usize,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self {
            events: StdMutex::new(VecDeque::new()),
            capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn record(
        &self,
        object_id: &str,
        labels: &HashMap<String, String>,
        event_type: &str,
        reason: &str,
        message: impl Into<String>,
    ) {
        let mut events = self.events.lock().expect("events lock poisoned");
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(Event {
            involved_object_id: object_id.to_string(),
            involved_object_labels: labels.clone(),
            event_type: event_type.to_string(),
            reason: reason.to_string(),
            message: message.into(),
            event_time: Utc::now().timestamp(),
        });
    }

    pub fn list(&self) -> Vec<Event> {
        self.events
            .lock()
            .expect("events lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for EventRecorder {
    fn default() -> Self {
        Self::new()
    }
}
