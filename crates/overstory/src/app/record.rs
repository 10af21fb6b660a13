//! Best-effort event recording sink.
//!
//! Monitoring must never crash the monitor: the watchdog and resolver push
//! events through this sink instead of writing to the event store directly.
//! The queue is bounded with a drop-oldest policy on overflow, and every
//! store failure is swallowed with a trace log. Nothing that must succeed
//! shares this path.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::domain::event::StoredEvent;
use crate::infra::db::events::EventStore;

/// Default queue bound before the oldest pending event is dropped.
pub const DEFAULT_SINK_CAPACITY: usize = 256;

/// Fire-and-forget sink over the event store.
#[derive(Clone)]
pub struct RecordSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    queue: Mutex<VecDeque<StoredEvent>>,
    notify: Notify,
    capacity: usize,
    cancel: CancellationToken,
}

impl RecordSink {
    /// Creates a sink and spawns its background writer task.
    pub fn new(events: EventStore, capacity: usize) -> Self {
        let inner = Arc::new(SinkInner {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            cancel: CancellationToken::new(),
        });

        let worker = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = worker.cancel.cancelled() => break,
                    () = worker.notify.notified() => {}
                }

                while let Some(event) = pop_front(&worker) {
                    if let Err(err) = events.insert(&event).await {
                        trace!(agent = %event.agent_name, "event record dropped: {err}");
                    }
                }
            }

            // Final drain so a clean shutdown loses nothing already queued.
            while let Some(event) = pop_front(&worker) {
                if let Err(err) = events.insert(&event).await {
                    trace!(agent = %event.agent_name, "event record dropped: {err}");
                }
            }
        });

        Self { inner }
    }

    /// Enqueues one event, dropping the oldest pending event on overflow.
    ///
    /// Never blocks and never fails.
    pub fn emit(&self, event: StoredEvent) {
        if let Ok(mut queue) = self.inner.queue.lock() {
            if queue.len() >= self.inner.capacity {
                if let Some(dropped) = queue.pop_front() {
                    trace!(agent = %dropped.agent_name, "record sink full, dropped oldest event");
                }
            }
            queue.push_back(event);
        }
        self.inner.notify.notify_one();
    }

    /// Number of events waiting for the writer task.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    /// Stops the writer task after a final drain.
    pub fn shutdown(&self) {
        self.inner.notify.notify_one();
        self.inner.cancel.cancel();
    }
}

fn pop_front(inner: &SinkInner) -> Option<StoredEvent> {
    inner.queue.lock().ok().and_then(|mut queue| queue.pop_front())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::event::EventKind;

    async fn wait_for_drain(sink: &RecordSink) {
        for _ in 0..100 {
            if sink.pending() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_emitted_events_reach_the_store() {
        // Arrange
        let store = EventStore::open_in_memory()
            .await
            .expect("failed to open store");
        let sink = RecordSink::new(store.clone(), 16);

        // Act
        sink.emit(StoredEvent::new("builder-1", EventKind::Custom));
        sink.emit(StoredEvent::new("builder-1", EventKind::Custom));
        wait_for_drain(&sink).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Assert
        let events = store
            .by_agent("builder-1", 10)
            .await
            .expect("failed to load events");
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        // Arrange — stores open but the worker is starved by never yielding
        let store = EventStore::open_in_memory()
            .await
            .expect("failed to open store");
        let sink = RecordSink::new(store, 2);

        // Act — fill synchronously before the worker task can run
        let mut first = StoredEvent::new("a", EventKind::Custom);
        first.payload = Some("first".to_string());
        let mut second = StoredEvent::new("a", EventKind::Custom);
        second.payload = Some("second".to_string());
        let mut third = StoredEvent::new("a", EventKind::Custom);
        third.payload = Some("third".to_string());
        sink.emit(first);
        sink.emit(second);
        sink.emit(third);

        // Assert — capacity 2 keeps only the two newest
        assert!(sink.pending() <= 2);
    }

    #[tokio::test]
    async fn test_emit_never_fails_after_shutdown() {
        // Arrange
        let store = EventStore::open_in_memory()
            .await
            .expect("failed to open store");
        let sink = RecordSink::new(store, 4);

        // Act — emitting after shutdown must not panic or error
        sink.shutdown();
        sink.emit(StoredEvent::new("a", EventKind::Custom));

        // Assert
        assert!(sink.pending() <= 1);
    }
}
