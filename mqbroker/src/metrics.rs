//! Broker wide event counters.
//!
//! Counters only ever grow, they are monotonic totals since start. Gauges
//! that go up and down (connections, sessions, queue depths) live in
//! [`crate::stats::Stats`].

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

macro_rules! metrics {
    ($($name:ident => $inc:ident, $incs:ident;)*) => {
        #[derive(Serialize, Debug, Default)]
        pub struct Metrics {
            $($name: AtomicUsize,)*
        }

        impl Metrics {
            $(
                #[inline]
                pub fn $name(&self) -> usize {
                    self.$name.load(Ordering::SeqCst)
                }

                #[inline]
                pub fn $inc(&self) {
                    self.$name.fetch_add(1, Ordering::SeqCst);
                }

                #[inline]
                pub fn $incs(&self, n: usize) {
                    self.$name.fetch_add(n, Ordering::SeqCst);
                }
            )*
        }
    };
}

metrics! {
    client_connect => client_connect_inc, client_connect_incs;
    client_connack => client_connack_inc, client_connack_incs;
    client_connack_error => client_connack_error_inc, client_connack_error_incs;
    client_handshaking_timeout => client_handshaking_timeout_inc, client_handshaking_timeout_incs;
    client_connected => client_connected_inc, client_connected_incs;
    client_disconnected => client_disconnected_inc, client_disconnected_incs;
    client_subscribe => client_subscribe_inc, client_subscribe_incs;
    client_unsubscribe => client_unsubscribe_inc, client_unsubscribe_incs;
    session_created => session_created_inc, session_created_incs;
    session_resumed => session_resumed_inc, session_resumed_incs;
    session_terminated => session_terminated_inc, session_terminated_incs;
    messages_publish => messages_publish_inc, messages_publish_incs;
    messages_publish_lastwill => messages_publish_lastwill_inc, messages_publish_lastwill_incs;
    messages_delivered => messages_delivered_inc, messages_delivered_incs;
    messages_acked => messages_acked_inc, messages_acked_incs;
    messages_dropped => messages_dropped_inc, messages_dropped_incs;
    messages_nonsubscribed => messages_nonsubscribed_inc, messages_nonsubscribed_incs;
    messages_retained => messages_retained_inc, messages_retained_incs;
    delivery_failures => delivery_failures_inc, delivery_failures_incs;
}

impl Metrics {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics() {
        let metrics = Metrics::new();
        metrics.client_connect_inc();
        metrics.messages_dropped_incs(3);
        assert_eq!(metrics.client_connect(), 1);
        assert_eq!(metrics.messages_dropped(), 3);
        assert_eq!(metrics.delivery_failures(), 0);

        let json = metrics.to_json();
        assert_eq!(json["messages_dropped"], 3);
        assert_eq!(json["session_created"], 0);
    }
}
