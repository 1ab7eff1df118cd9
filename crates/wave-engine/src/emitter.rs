//! Event fan-out with per-step throttling.
//!
//! One emitter per run. Subscribers register before the scheduler starts.
//! Lifecycle events pass through immediately; `stream_activity` is limited
//! to one event per step per window. There is no background timer: the
//! decision happens on arrival, so the event forwarded after a quiet gap is
//! always the most recent one (last-write-wins coalescing).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use wave_core::ProgressEvent;

/// Throttle window for `stream_activity` events.
pub const STREAM_ACTIVITY_WINDOW: Duration = Duration::from_secs(1);

/// A subscriber. Implementations must not block: slow sinks are expected to
/// queue internally and may drop `stream_activity` events, never lifecycle
/// events.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

struct Inner {
    sinks: Vec<Arc<dyn EventSink>>,
    /// step_id -> instant of the last forwarded stream_activity event.
    last_forwarded: Mutex<HashMap<String, Instant>>,
    window: Duration,
}

/// Process-wide fan-out of progress events to N sinks.
#[derive(Clone)]
pub struct EventEmitter {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("sinks", &self.inner.sinks.len())
            .field("window", &self.inner.window)
            .finish()
    }
}

impl EventEmitter {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self::with_window(sinks, STREAM_ACTIVITY_WINDOW)
    }

    pub fn with_window(sinks: Vec<Arc<dyn EventSink>>, window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                sinks,
                last_forwarded: Mutex::new(HashMap::new()),
                window,
            }),
        }
    }

    /// Emit an event, applying the stream-activity throttle.
    ///
    /// Returns true if the event was forwarded to sinks.
    pub fn emit(&self, event: &ProgressEvent) -> bool {
        if !event.kind.is_terminal() && !self.should_forward(&event.step_id) {
            return false;
        }

        for sink in &self.inner.sinks {
            sink.on_event(event);
        }
        true
    }

    fn should_forward(&self, step_id: &str) -> bool {
        let now = Instant::now();
        let Ok(mut last) = self.inner.last_forwarded.lock() else {
            return true;
        };
        match last.get(step_id) {
            Some(previous) if now.duration_since(*previous) < self.inner.window => false,
            _ => {
                last.insert(step_id.to_string(), now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wave_core::StepEventKind;

    #[derive(Default)]
    struct CollectingSink {
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl EventSink for CollectingSink {
        fn on_event(&self, event: &ProgressEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn event(step: &str, kind: StepEventKind) -> ProgressEvent {
        ProgressEvent::new("run-1", step, kind, "persona", "cli")
    }

    #[test]
    fn lifecycle_events_always_pass() {
        let sink = Arc::new(CollectingSink::default());
        let emitter = EventEmitter::new(vec![sink.clone()]);

        for _ in 0..5 {
            assert!(emitter.emit(&event("a", StepEventKind::Completed)));
        }
        assert_eq!(sink.events.lock().unwrap().len(), 5);
    }

    #[test]
    fn stream_activity_throttled_within_window() {
        let sink = Arc::new(CollectingSink::default());
        let emitter = EventEmitter::new(vec![sink.clone()]);

        assert!(emitter.emit(&event("a", StepEventKind::StreamActivity)));
        for _ in 0..10 {
            assert!(!emitter.emit(&event("a", StepEventKind::StreamActivity)));
        }

        let forwarded = sink
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == StepEventKind::StreamActivity)
            .count();
        assert_eq!(forwarded, 1);
    }

    #[test]
    fn throttle_is_per_step() {
        let sink = Arc::new(CollectingSink::default());
        let emitter = EventEmitter::new(vec![sink.clone()]);

        assert!(emitter.emit(&event("a", StepEventKind::StreamActivity)));
        assert!(emitter.emit(&event("b", StepEventKind::StreamActivity)));
        assert!(!emitter.emit(&event("a", StepEventKind::StreamActivity)));
        assert!(!emitter.emit(&event("b", StepEventKind::StreamActivity)));

        assert_eq!(sink.events.lock().unwrap().len(), 2);
    }

    #[test]
    fn window_expiry_allows_next_event() {
        let sink = Arc::new(CollectingSink::default());
        let emitter = EventEmitter::with_window(vec![sink.clone()], Duration::from_millis(20));

        assert!(emitter.emit(&event("a", StepEventKind::StreamActivity)));
        assert!(!emitter.emit(&event("a", StepEventKind::StreamActivity)));
        std::thread::sleep(Duration::from_millis(30));
        assert!(emitter.emit(&event("a", StepEventKind::StreamActivity)));

        assert_eq!(sink.events.lock().unwrap().len(), 2);
    }

    #[test]
    fn throttle_does_not_block_terminal_after_activity() {
        let sink = Arc::new(CollectingSink::default());
        let emitter = EventEmitter::new(vec![sink.clone()]);

        assert!(emitter.emit(&event("a", StepEventKind::StreamActivity)));
        assert!(emitter.emit(&event("a", StepEventKind::Completed)));
        assert_eq!(sink.events.lock().unwrap().len(), 2);
    }

    #[test]
    fn fan_out_reaches_all_sinks() {
        let sink1 = Arc::new(CollectingSink::default());
        let sink2 = Arc::new(CollectingSink::default());
        let emitter = EventEmitter::new(vec![sink1.clone(), sink2.clone()]);

        emitter.emit(&event("a", StepEventKind::Running));
        assert_eq!(sink1.events.lock().unwrap().len(), 1);
        assert_eq!(sink2.events.lock().unwrap().len(), 1);
    }
}
