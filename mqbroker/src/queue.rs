use std::collections::VecDeque;
use std::sync::Arc;

pub enum Policy {
    //Discard current value
    Current,
    //Discard earliest value
    Early,
}

pub trait PolicyFn<P>: 'static + Sync + Send + Fn(&P) -> Policy {}

impl<T, P> PolicyFn<P> for T where T: 'static + Sync + Send + Clone + Fn(&P) -> Policy {}

pub trait OnEventFn: 'static + Sync + Send + Fn() {}
impl<T> OnEventFn for T where T: 'static + Sync + Send + Clone + Fn() {}

/// Bounded FIFO of undelivered messages. When full, the policy picked for
/// the incoming value decides which one is discarded.
pub struct MessageQueue<T> {
    cap: usize,
    inner: VecDeque<T>,
    policy_fn: Arc<dyn PolicyFn<T>>,
    on_push_fn: Option<Arc<dyn OnEventFn>>,
    on_pop_fn: Option<Arc<dyn OnEventFn>>,
}

impl<T> Drop for MessageQueue<T> {
    fn drop(&mut self) {
        if let Some(f) = self.on_pop_fn.as_ref() {
            self.inner.iter().for_each(|_| f());
        }
    }
}

impl<T> MessageQueue<T> {
    /// `cap` of 0 means unbounded
    #[inline]
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            inner: VecDeque::new(),
            policy_fn: Arc::new(|_v: &T| -> Policy { Policy::Current }),
            on_push_fn: None,
            on_pop_fn: None,
        }
    }

    #[inline]
    pub fn policy<F>(mut self, f: F) -> Self
    where
        F: PolicyFn<T>,
    {
        self.policy_fn = Arc::new(f);
        self
    }

    #[inline]
    pub fn on_push<F: OnEventFn>(mut self, f: F) -> Self {
        self.on_push_fn = Some(Arc::new(f));
        self
    }

    #[inline]
    pub fn on_pop<F: OnEventFn>(mut self, f: F) -> Self {
        self.on_pop_fn = Some(Arc::new(f));
        self
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.cap > 0 && self.inner.len() >= self.cap
    }

    ///If the queue is full, the data is discarded according to the policy,
    ///the discarded value is returned as the error.
    #[inline]
    pub fn push(&mut self, v: T) -> Result<(), T> {
        if self.is_full() {
            match (self.policy_fn)(&v) {
                Policy::Current => return Err(v),
                Policy::Early => {
                    let removed = self.inner.pop_front();
                    self.inner.push_back(v);
                    return match removed {
                        Some(removed) => Err(removed),
                        None => Ok(()),
                    };
                }
            }
        }
        self.inner.push_back(v);
        if let Some(f) = self.on_push_fn.as_ref() {
            f();
        }
        Ok(())
    }

    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        let v = self.inner.pop_front()?;
        if let Some(f) = self.on_pop_fn.as_ref() {
            f();
        }
        Some(v)
    }

    #[inline]
    pub fn front(&self) -> Option<&T> {
        self.inner.front()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Takes everything out, oldest first.
    #[inline]
    pub fn drain(&mut self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.inner.len());
        while let Some(v) = self.pop() {
            items.push(v);
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicIsize, Ordering};

    use super::*;

    #[test]
    fn test_policy() {
        // odd values are "QoS 0" and dropped when full, even values evict the oldest
        let mut q = MessageQueue::new(3)
            .policy(|v: &u32| -> Policy { if v % 2 == 1 { Policy::Current } else { Policy::Early } });
        for v in [1, 2, 3] {
            q.push(v).unwrap();
        }
        assert_eq!(q.push(5), Err(5));
        assert_eq!(q.push(4), Err(1));
        assert_eq!(q.push(6), Err(2));
        assert_eq!(q.len(), 3);
        assert_eq!(q.drain(), vec![3, 4, 6]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_unbounded_and_events() {
        let size = Arc::new(AtomicIsize::new(0));
        let (s1, s2) = (size.clone(), size.clone());
        let mut q = MessageQueue::new(0)
            .on_push(move || {
                s1.fetch_add(1, Ordering::SeqCst);
            })
            .on_pop(move || {
                s2.fetch_sub(1, Ordering::SeqCst);
            });
        for v in 0..100 {
            q.push(v).unwrap();
        }
        assert_eq!(size.load(Ordering::SeqCst), 100);
        assert_eq!(q.front(), Some(&0));
        assert_eq!(q.pop(), Some(0));
        assert_eq!(size.load(Ordering::SeqCst), 99);
        drop(q);
        assert_eq!(size.load(Ordering::SeqCst), 0);
    }
}
