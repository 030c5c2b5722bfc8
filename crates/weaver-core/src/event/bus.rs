//! Broadcast event bus for distributing `ExecutionEvent` to subscribers.
//!
//! Built on `tokio::sync::broadcast`. Publishing with no active subscribers is
//! a no-op, and slow subscribers lag instead of blocking the engine: events are
//! observational only.

use futures_util::Stream;
use tokio::sync::broadcast;
use uuid::Uuid;
use weaver_types::event::ExecutionEvent;

/// Multi-consumer event bus for execution events.
///
/// Cloning the bus clones the sender, allowing multiple producers and consumers.
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    /// Events of a single execution, ending after its terminal event.
    ///
    /// Lagged events are skipped with a warning.
    pub fn execution_stream(&self, execution_id: Uuid) -> impl Stream<Item = ExecutionEvent> + Send + 'static {
        let mut rx = self.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) if event.execution_id() == execution_id => {
                        let terminal = event.is_terminal();
                        yield event;
                        if terminal {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(%execution_id, skipped, "event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
