//! Byte stream event policy
//!
//! Maps named trigger points to user callbacks and carries the pacing delay
//! between segment emissions.

use crate::config::PACING_DELAY;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Named points at which the byte stream notifies user callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPoint {
    /// Fetch-ahead started
    Preload,
    /// Segment bytes arrived from the transport
    SegmentLoaded,
    /// Segment handed to the consumer
    SegmentEmitted,
    /// Emission paused
    Pause,
    /// Emission resumed
    Resume,
    /// Last segment emitted
    End,
    /// Segment could not be fetched
    Error,
}

impl std::fmt::Display for TriggerPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerPoint::Preload => write!(f, "preload"),
            TriggerPoint::SegmentLoaded => write!(f, "segment_loaded"),
            TriggerPoint::SegmentEmitted => write!(f, "segment_emitted"),
            TriggerPoint::Pause => write!(f, "pause"),
            TriggerPoint::Resume => write!(f, "resume"),
            TriggerPoint::End => write!(f, "end"),
            TriggerPoint::Error => write!(f, "error"),
        }
    }
}

/// Payload passed to trigger callbacks
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    pub trigger: TriggerPoint,
    /// Segment the event refers to
    pub segment: Option<usize>,
    /// Segment size in bytes
    pub bytes: Option<usize>,
    /// Failure description for `Error`
    pub message: Option<String>,
}

impl StreamEvent {
    pub fn new(trigger: TriggerPoint) -> Self {
        Self {
            trigger,
            segment: None,
            bytes: None,
            message: None,
        }
    }

    pub fn segment(trigger: TriggerPoint, index: usize, bytes: usize) -> Self {
        Self {
            segment: Some(index),
            bytes: Some(bytes),
            ..Self::new(trigger)
        }
    }

    pub fn error(index: usize, message: impl Into<String>) -> Self {
        Self {
            segment: Some(index),
            message: Some(message.into()),
            ..Self::new(TriggerPoint::Error)
        }
    }
}

/// User callback invoked at a trigger point
pub type EventCallback = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

/// Trigger callbacks plus pacing delay
#[derive(Clone)]
pub struct EventPolicy {
    callbacks: HashMap<TriggerPoint, Vec<EventCallback>>,
    /// Pause before each segment emission
    pub delay: Duration,
}

impl EventPolicy {
    pub fn new() -> Self {
        Self {
            callbacks: HashMap::new(),
            delay: PACING_DELAY,
        }
    }

    /// Register a callback for a trigger point
    pub fn on<F>(mut self, trigger: TriggerPoint, callback: F) -> Self
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.register(trigger, callback);
        self
    }

    pub fn register<F>(&mut self, trigger: TriggerPoint, callback: F)
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.callbacks
            .entry(trigger)
            .or_default()
            .push(Arc::new(callback));
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of callbacks registered for `trigger`
    pub fn listeners(&self, trigger: TriggerPoint) -> usize {
        self.callbacks.get(&trigger).map_or(0, Vec::len)
    }

    /// Invoke every callback registered for the event's trigger, in
    /// registration order
    pub fn emit(&self, event: &StreamEvent) {
        if let Some(callbacks) = self.callbacks.get(&event.trigger) {
            for callback in callbacks {
                callback(event);
            }
        }
    }
}

impl Default for EventPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut triggers: Vec<_> = self
            .callbacks
            .iter()
            .map(|(trigger, cbs)| (trigger.to_string(), cbs.len()))
            .collect();
        triggers.sort();
        f.debug_struct("EventPolicy")
            .field("callbacks", &triggers)
            .field("delay", &self.delay)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_default_delay() {
        assert_eq!(EventPolicy::default().delay, Duration::from_millis(17));
    }

    #[test]
    fn test_emit_in_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (a, b) = (order.clone(), order.clone());
        let policy = EventPolicy::new()
            .on(TriggerPoint::SegmentEmitted, move |e| a.lock().unwrap().push(("a", e.segment)))
            .on(TriggerPoint::SegmentEmitted, move |e| b.lock().unwrap().push(("b", e.segment)));

        policy.emit(&StreamEvent::segment(TriggerPoint::SegmentEmitted, 3, 100));
        policy.emit(&StreamEvent::new(TriggerPoint::End));

        assert_eq!(*order.lock().unwrap(), vec![("a", Some(3)), ("b", Some(3))]);
        assert_eq!(policy.listeners(TriggerPoint::SegmentEmitted), 2);
        assert_eq!(policy.listeners(TriggerPoint::End), 0);
    }

    #[test]
    fn test_clone_shares_callbacks() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let policy = EventPolicy::new().on(TriggerPoint::End, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let copy = policy.clone().with_delay(Duration::from_millis(5));

        copy.emit(&StreamEvent::new(TriggerPoint::End));
        policy.emit(&StreamEvent::new(TriggerPoint::End));

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(copy.delay, Duration::from_millis(5));
    }
}
