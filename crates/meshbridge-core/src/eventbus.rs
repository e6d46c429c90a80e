//! Event bus and event sinks.
//!
//! Sessions report events through the synchronous [`EventSink`] trait so
//! that they never await. The [`EventBus`] implements it on top of a
//! broadcast channel for async subscribers; [`MemorySink`] collects events
//! for tests and offline tools.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::event::{EventMetadata, MeshEvent};

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Destination for engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: MeshEvent);
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn emit(&self, event: MeshEvent) {
        (**self).emit(event)
    }
}

/// Broadcast event bus.
///
/// Events published with no subscribers are dropped. Slow subscribers may
/// miss events once the buffer wraps.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<(MeshEvent, EventMetadata)>,
    name: String,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus buffering `capacity` events for slow subscribers.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            name: "meshbridge".to_string(),
        }
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            tx: broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event with metadata sourced from this bus.
    ///
    /// Returns `true` if there was at least one subscriber.
    pub fn publish(&self, event: MeshEvent) -> bool {
        let metadata = EventMetadata::new(self.name.clone());
        self.publish_with_metadata(event, metadata)
    }

    pub fn publish_with_metadata(&self, event: MeshEvent, metadata: EventMetadata) -> bool {
        self.tx.send((event, metadata)).is_ok()
    }

    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Subscribe to events matching `filter`.
    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredReceiver<F>
    where
        F: Fn(&MeshEvent) -> bool + Send + 'static,
    {
        FilteredReceiver::new(self.tx.subscribe(), filter)
    }

    /// Filtered subscription helpers for common patterns.
    pub fn filter(&self) -> FilterBuilder {
        FilterBuilder {
            tx: self.tx.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: MeshEvent) {
        self.publish(event);
    }
}

/// Receiver for all events.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<(MeshEvent, EventMetadata)>,
}

impl EventBusReceiver {
    /// Receive the next event, or `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<(MeshEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(category = "events", skipped, "Event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<(MeshEvent, EventMetadata)> {
        self.rx.try_recv().ok()
    }
}

/// Receiver for filtered events.
pub struct FilteredReceiver<F>
where
    F: Fn(&MeshEvent) -> bool + Send,
{
    rx: broadcast::Receiver<(MeshEvent, EventMetadata)>,
    filter: F,
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&MeshEvent) -> bool + Send,
{
    fn new(rx: broadcast::Receiver<(MeshEvent, EventMetadata)>, filter: F) -> Self {
        Self { rx, filter }
    }

    /// Receive the next matching event, or `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<(MeshEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok((event, meta)) => {
                    if (self.filter)(&event) {
                        return Some((event, meta));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<(MeshEvent, EventMetadata)> {
        while let Ok((event, meta)) = self.rx.try_recv() {
            if (self.filter)(&event) {
                return Some((event, meta));
            }
        }
        None
    }
}

/// Builder for filtered subscriptions.
pub struct FilterBuilder {
    tx: broadcast::Sender<(MeshEvent, EventMetadata)>,
}

impl FilterBuilder {
    /// Events with the given name.
    pub fn named(
        &self,
        name: &'static str,
    ) -> FilteredReceiver<impl Fn(&MeshEvent) -> bool + Send + 'static> {
        FilteredReceiver::new(self.tx.subscribe(), move |event: &MeshEvent| {
            event.name() == name
        })
    }
}

/// Shared event bus handle.
pub type SharedEventBus = Arc<EventBus>;

/// In-memory sink that keeps every event.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<MeshEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events so far.
    pub fn events(&self) -> Vec<MeshEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Remove and return all events so far.
    pub fn drain(&self) -> Vec<MeshEvent> {
        match self.events.lock() {
            Ok(mut events) => std::mem::take(&mut *events),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    /// Events with the given name.
    pub fn named(&self, name: &str) -> Vec<MeshEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.name() == name)
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: MeshEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: MeshEvent) {}
}
