//! Typed event channels published by the cluster: one channel per event
//! kind, with any number of subscribers.

use std::net::SocketAddr;
use tokio::sync::broadcast;

pub use basalt_cql::frame::response::event::SchemaChangeEvent;

const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Publisher side of the cluster's typed event channels. The driver
/// publishes; external consumers subscribe through the session.
pub(crate) struct ClusterEvents {
    host_up: broadcast::Sender<SocketAddr>,
    host_down: broadcast::Sender<SocketAddr>,
    schema_changed: broadcast::Sender<SchemaChangeEvent>,
}

impl ClusterEvents {
    pub(crate) fn new() -> Self {
        let (host_up, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (host_down, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (schema_changed, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            host_up,
            host_down,
            schema_changed,
        }
    }

    // Send errors only mean there are no subscribers right now.

    pub(crate) fn publish_host_up(&self, address: SocketAddr) {
        let _ = self.host_up.send(address);
    }

    pub(crate) fn publish_host_down(&self, address: SocketAddr) {
        let _ = self.host_down.send(address);
    }

    pub(crate) fn publish_schema_changed(&self, event: SchemaChangeEvent) {
        let _ = self.schema_changed.send(event);
    }

    pub(crate) fn subscribe_host_up(&self) -> broadcast::Receiver<SocketAddr> {
        self.host_up.subscribe()
    }

    pub(crate) fn subscribe_host_down(&self) -> broadcast::Receiver<SocketAddr> {
        self.host_down.subscribe()
    }

    pub(crate) fn subscribe_schema_changed(&self) -> broadcast::Receiver<SchemaChangeEvent> {
        self.schema_changed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn multiple_subscribers_see_the_same_events() {
        let events = ClusterEvents::new();
        let mut first = events.subscribe_host_up();
        let mut second = events.subscribe_host_up();

        let addr: SocketAddr = "10.0.0.1:9042".parse().unwrap();
        events.publish_host_up(addr);

        assert_eq!(first.recv().await.unwrap(), addr);
        assert_eq!(second.recv().await.unwrap(), addr);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_fine() {
        let events = ClusterEvents::new();
        events.publish_host_down("10.0.0.1:9042".parse().unwrap());
    }
}
