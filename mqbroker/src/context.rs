use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::retain::{DefaultRetainStorage, RetainStorage};
use crate::stats::Stats;

/// Process wide shared state, cheap to clone into every connection task.
#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<ServerContextInner>,
}

pub struct ServerContextInner {
    pub registry: Registry,
    pub retain: Box<dyn RetainStorage>,
    pub metrics: Metrics,
    pub stats: Stats,
    /// 0 means unlimited
    pub mqtt_max_sessions: usize,
}

impl Deref for ServerContext {
    type Target = ServerContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl ServerContext {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> ServerContextBuilder {
        ServerContextBuilder::default()
    }

    /// Whether a new session may be registered, a takeover never counts
    /// against the limit.
    #[inline]
    pub fn session_allowed(&self, client_id: &str) -> bool {
        self.mqtt_max_sessions == 0
            || self.registry.sessions() < self.mqtt_max_sessions
            || self.registry.exist(client_id)
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ServerContext ...")?;
        Ok(())
    }
}

#[derive(Default)]
pub struct ServerContextBuilder {
    mqtt_max_sessions: usize,
    retain: Option<Box<dyn RetainStorage>>,
}

impl ServerContextBuilder {
    pub fn mqtt_max_sessions(mut self, mqtt_max_sessions: usize) -> Self {
        self.mqtt_max_sessions = mqtt_max_sessions;
        self
    }

    pub fn retain(mut self, retain: Box<dyn RetainStorage>) -> Self {
        self.retain = Some(retain);
        self
    }

    pub fn build(self) -> ServerContext {
        ServerContext {
            inner: Arc::new(ServerContextInner {
                registry: Registry::new(),
                retain: self.retain.unwrap_or_else(|| Box::new(DefaultRetainStorage::new())),
                metrics: Metrics::new(),
                stats: Stats::new(),
                mqtt_max_sessions: self.mqtt_max_sessions,
            }),
        }
    }
}
