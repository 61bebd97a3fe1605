//! Paused-by-default single-consumer work queue.
//!
//! A [`DeltaQueue`] feeds items one at a time through an async worker on a
//! spawned drain task. Two independent pause flags gate draining: `paused`
//! belongs to the embedding application, `system_paused` to the pipeline
//! itself (connection churn, handler attachment). The queue drains only
//! when both are clear, so a user-initiated pause survives reconnects.
//!
//! Exactly one worker invocation is in flight at any moment. A worker error
//! is terminal: the queue emits [`QueueEvent::Error`] and stops draining,
//! retaining whatever items were queued behind the failure.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::errors::DeltaError;
use crate::events::{EventHub, QueueEvent};

/// Async worker invoked for each dequeued item.
pub type QueueWorker<T> =
    Arc<dyn Fn(T) -> BoxFuture<'static, Result<(), DeltaError>> + Send + Sync>;

/// A FIFO work queue with an async per-item worker and a
/// backpressure-capable pause/resume interface.
pub struct DeltaQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for DeltaQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct QueueInner<T> {
    label: &'static str,
    worker: QueueWorker<T>,
    events: EventHub<QueueEvent>,
    state: Mutex<QueueState<T>>,
}

struct QueueState<T> {
    items: VecDeque<T>,
    paused: bool,
    system_paused: bool,
    draining: bool,
    error: Option<DeltaError>,
}

impl<T: Send + 'static> DeltaQueue<T> {
    /// Create a queue. It starts system-paused; the owner resumes it once a
    /// consumer is in place.
    pub fn new(label: &'static str, worker: QueueWorker<T>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                label,
                worker,
                events: EventHub::default(),
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    paused: false,
                    system_paused: true,
                    draining: false,
                    error: None,
                }),
            }),
        }
    }

    /// Append an item and drain if the queue is unblocked.
    pub fn push(&self, item: T) {
        self.inner.state.lock().items.push_back(item);
        self.ensure_draining();
    }

    /// Discard all queued items. Does not interrupt an in-flight worker
    /// invocation.
    pub fn clear(&self) {
        self.inner.state.lock().items.clear();
    }

    /// Number of queued (not yet dequeued) items.
    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    /// Whether the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().items.is_empty()
    }

    /// Pause draining on behalf of the embedding application.
    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
    }

    /// Pause draining on behalf of the pipeline.
    pub fn system_pause(&self) {
        self.inner.state.lock().system_paused = true;
    }

    /// Clear the application pause flag.
    pub fn resume(&self) {
        self.unblock(|state| state.paused = false);
    }

    /// Clear the pipeline pause flag.
    pub fn system_resume(&self) {
        self.unblock(|state| state.system_paused = false);
    }

    /// Whether either pause flag is set.
    pub fn is_paused(&self) -> bool {
        let state = self.inner.state.lock();
        state.paused || state.system_paused
    }

    /// The error that halted this queue, if any.
    pub fn error(&self) -> Option<DeltaError> {
        self.inner.state.lock().error.clone()
    }

    /// Subscribe to queue lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    fn unblock(&self, clear_flag: impl FnOnce(&mut QueueState<T>)) {
        let resumed = {
            let mut state = self.inner.state.lock();
            let was_blocked = state.paused || state.system_paused;
            clear_flag(&mut state);
            was_blocked && !state.paused && !state.system_paused && state.error.is_none()
        };
        if resumed {
            // observers hear about the transition before the next item runs
            self.inner.events.emit(QueueEvent::Resume);
            self.ensure_draining();
        }
    }

    fn ensure_draining(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.draining
                || state.paused
                || state.system_paused
                || state.error.is_some()
                || state.items.is_empty()
            {
                return;
            }
            state.draining = true;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let item = {
                    let mut state = inner.state.lock();
                    if state.paused || state.system_paused || state.error.is_some() {
                        state.draining = false;
                        return;
                    }
                    match state.items.pop_front() {
                        Some(item) => item,
                        None => {
                            state.draining = false;
                            return;
                        }
                    }
                };

                if let Err(err) = (inner.worker)(item).await {
                    tracing::warn!(queue = inner.label, error = %err, "queue worker failed");
                    {
                        let mut state = inner.state.lock();
                        state.error = Some(err.clone());
                        state.draining = false;
                    }
                    inner.events.emit(QueueEvent::Error(err));
                    return;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn recording_queue() -> (DeltaQueue<u64>, Arc<Mutex<Vec<u64>>>) {
        let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let queue = DeltaQueue::new(
            "test",
            Arc::new(move |item| {
                let sink = sink.clone();
                Box::pin(async move {
                    sink.lock().push(item);
                    Ok(())
                })
            }),
        );
        (queue, seen)
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn starts_paused_and_drains_in_order_after_resume() {
        let (queue, seen) = recording_queue();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        settle().await;
        assert!(seen.lock().is_empty());

        queue.system_resume();
        settle().await;
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn both_flags_must_clear_before_draining() {
        let (queue, seen) = recording_queue();
        queue.pause();
        queue.push(1);

        queue.system_resume();
        settle().await;
        assert!(seen.lock().is_empty());

        queue.resume();
        settle().await;
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[tokio::test]
    async fn resume_event_fires_before_first_item() {
        let (queue, seen) = recording_queue();
        let mut events = queue.subscribe();
        queue.push(1);

        queue.system_resume();
        // the Resume event is emitted synchronously, before the drain task
        // has had a chance to run
        assert!(matches!(events.try_recv(), Ok(QueueEvent::Resume)));
        assert!(seen.lock().is_empty());

        settle().await;
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[tokio::test]
    async fn worker_error_halts_queue_and_emits() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let queue: DeltaQueue<u64> = DeltaQueue::new(
            "test",
            Arc::new(move |item| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if item == 2 {
                        Err(DeltaError::handler("boom"))
                    } else {
                        Ok(())
                    }
                })
            }),
        );
        let mut events = queue.subscribe();

        queue.push(1);
        queue.push(2);
        queue.push(3);
        queue.system_resume();
        settle().await;

        // item 3 was never attempted and remains queued
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(queue.len(), 1);
        assert!(queue.error().is_some());

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, QueueEvent::Error(_)) {
                saw_error = true;
            }
        }
        assert!(saw_error);

        // a halted queue stays halted
        queue.push(4);
        queue.resume();
        settle().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clear_discards_queued_but_not_in_flight() {
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(Mutex::new(Some(release_rx)));
        let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let gate = release_rx.clone();
        let queue = DeltaQueue::new(
            "test",
            Arc::new(move |item: u64| {
                let sink = sink.clone();
                let gate = gate.clone();
                Box::pin(async move {
                    if item == 1 {
                        let rx = gate.lock().take();
                        if let Some(rx) = rx {
                            let _ = rx.await;
                        }
                    }
                    sink.lock().push(item);
                    Ok(())
                })
            }),
        );

        queue.push(1);
        queue.push(2);
        queue.system_resume();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // item 1 is in flight; clearing must only drop item 2
        queue.clear();
        let _ = release_tx.send(());
        settle().await;
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[tokio::test]
    async fn push_after_drain_completes_restarts_draining() {
        let (queue, seen) = recording_queue();
        queue.system_resume();
        queue.push(1);
        settle().await;
        assert_eq!(*seen.lock(), vec![1]);

        queue.push(2);
        settle().await;
        assert_eq!(*seen.lock(), vec![1, 2]);
    }
}
