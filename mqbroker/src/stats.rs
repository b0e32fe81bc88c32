use serde::Serialize;
use serde_json::json;

use mqbroker_utils::Counter;

use crate::context::ServerContext;

/// Gauges of the broker state, each with its high-water mark.
#[derive(Debug, Default, Serialize)]
pub struct Stats {
    pub connections: Counter,
    pub sessions: Counter,
    pub message_queues: Counter,
    pub out_inflights: Counter,
    pub in_inflights: Counter,
}

/// Counts one open network connection, from accept until it is dropped.
pub struct ConnectionGuard(ServerContext);

impl ConnectionGuard {
    #[inline]
    pub fn new(scx: &ServerContext) -> Self {
        scx.stats.connections.inc();
        Self(scx.clone())
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.stats.connections.dec();
    }
}

impl Stats {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot including the gauges kept by the registry and retained store.
    pub async fn to_json(&self, scx: &ServerContext) -> serde_json::Value {
        json!({
            "connections": self.connections.to_json(),
            "sessions": self.sessions.to_json(),
            "subscriptions": scx.registry.subscriptions(),
            "topics": scx.registry.topics(),
            "message_queues": self.message_queues.to_json(),
            "out_inflights": self.out_inflights.to_json(),
            "in_inflights": self.in_inflights.to_json(),
            "retaineds": {
                "count": scx.retain.count().await,
                "max": scx.retain.max().await,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_guard() {
        let scx = ServerContext::new().build();
        let a = ConnectionGuard::new(&scx);
        let b = ConnectionGuard::new(&scx);
        assert_eq!(scx.stats.connections.count(), 2);
        drop(a);
        drop(b);
        assert_eq!(scx.stats.connections.count(), 0);
        assert_eq!(scx.stats.connections.max(), 2);
    }
}
