use std::str::FromStr;

use async_trait::async_trait;

use mqbroker_utils::Counter;

use crate::topic::Topic;
use crate::types::{DashMap, Retain, TopicFilter, TopicName};
use crate::Result;

/// Last-value cache of retained messages, keyed by exact topic name.
#[async_trait]
pub trait RetainStorage: Sync + Send {
    ///topic - concrete topic, an empty payload clears the entry
    async fn set(&self, topic: &TopicName, retain: Retain) -> Result<()>;

    ///topic_filter - Topic filter
    async fn get(&self, topic_filter: &TopicFilter) -> Result<Vec<(TopicName, Retain)>>;

    async fn count(&self) -> isize;

    async fn max(&self) -> isize;
}

#[derive(Default)]
pub struct DefaultRetainStorage {
    messages: DashMap<TopicName, Retain>,
    retaineds: Counter,
}

impl DefaultRetainStorage {
    #[inline]
    pub fn new() -> DefaultRetainStorage {
        Self::default()
    }
}

#[async_trait]
impl RetainStorage for DefaultRetainStorage {
    async fn set(&self, topic: &TopicName, retain: Retain) -> Result<()> {
        if retain.publish.payload.is_empty() {
            if self.messages.remove(topic).is_some() {
                self.retaineds.dec();
            }
            log::debug!("retained message cleared, topic: {}", topic);
        } else if self.messages.insert(topic.clone(), retain).is_none() {
            self.retaineds.inc();
        }
        Ok(())
    }

    async fn get(&self, topic_filter: &TopicFilter) -> Result<Vec<(TopicName, Retain)>> {
        let filter = Topic::from_str(topic_filter)?;
        let mut retains = Vec::new();
        for entry in self.messages.iter() {
            if filter.matches_str(entry.key()) {
                retains.push((entry.key().clone(), entry.value().clone()));
            }
        }
        Ok(retains)
    }

    #[inline]
    async fn count(&self) -> isize {
        self.retaineds.count()
    }

    #[inline]
    async fn max(&self) -> isize {
        self.retaineds.max()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::types::{From, Id, Publish, QoS};

    fn retain(topic: &str, payload: &'static [u8]) -> Retain {
        let id = Id::new(None, None, "publisher".into(), None);
        let mut publish = Publish::new(topic, QoS::AtLeastOnce, Bytes::from_static(payload));
        publish.retain = true;
        Retain { from: From::from_custom(id), publish }
    }

    #[tokio::test]
    async fn test_set_get_clear() {
        let storage = DefaultRetainStorage::new();
        storage.set(&"a/b".into(), retain("a/b", b"1")).await.unwrap();
        storage.set(&"a/c".into(), retain("a/c", b"2")).await.unwrap();
        storage.set(&"$SYS/x".into(), retain("$SYS/x", b"3")).await.unwrap();
        assert_eq!(storage.count().await, 3);

        let mut got = storage.get(&"a/+".into()).await.unwrap();
        got.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].1.publish.payload, Bytes::from_static(b"1"));

        assert_eq!(storage.get(&"#".into()).await.unwrap().len(), 2);
        assert_eq!(storage.get(&"$SYS/#".into()).await.unwrap().len(), 1);

        // overwrite keeps one entry per topic
        storage.set(&"a/b".into(), retain("a/b", b"9")).await.unwrap();
        assert_eq!(storage.count().await, 3);
        let got = storage.get(&"a/b".into()).await.unwrap();
        assert_eq!(got[0].1.publish.payload, Bytes::from_static(b"9"));

        storage.set(&"a/b".into(), retain("a/b", b"")).await.unwrap();
        assert!(storage.get(&"a/b".into()).await.unwrap().is_empty());
        assert_eq!(storage.count().await, 2);
        assert_eq!(storage.max().await, 3);

        // clearing an unknown topic is a no-op
        storage.set(&"x/y".into(), retain("x/y", b"")).await.unwrap();
        assert_eq!(storage.count().await, 2);

        assert!(storage.get(&"a/#/b".into()).await.is_err());
    }
}
