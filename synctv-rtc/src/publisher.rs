//! Observable values
//!
//! A [`Published`] holds the current value of some piece of connection or
//! channel state. Writers call [`Published::set`]; readers either poll
//! [`Published::get`], register a synchronous callback with
//! [`Published::subscribe`], or suspend on [`Published::wait_for`].
//!
//! Subscribers are notified of future changes only. The value present at
//! subscription time is not replayed; read it with `get()` first if needed.

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Subscribers<T> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Callback<T>)>>,
}

/// A waiter's predicates and completion, consumed the first time one of the
/// predicates holds.
struct Pending<P, R, T> {
    accept: P,
    reject: R,
    done: oneshot::Sender<Result<T>>,
}

pub struct Published<T> {
    // Written only while `subscribers.entries` is held.
    value: RwLock<T>,
    subscribers: Arc<Subscribers<T>>,
}

impl<T> Published<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(value: T) -> Self {
        Self {
            value: RwLock::new(value),
            subscribers: Arc::new(Subscribers {
                next_id: AtomicU64::new(0),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Overwrite the value and notify every current subscriber, in
    /// subscription order, on the calling thread.
    pub fn set(&self, value: T) {
        // Callbacks run outside the lock so they may subscribe or cancel.
        let callbacks: Vec<Callback<T>> = {
            let entries = self.subscribers.entries.lock();
            *self.value.write() = value.clone();
            entries.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for cb in callbacks {
            cb(&value);
        }
    }

    /// Modify the value in place and notify subscribers.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut value = self.get();
        f(&mut value);
        self.set(value);
    }

    /// Register `callback` for every future change. The subscription is
    /// cancelled when the returned guard is dropped.
    #[must_use = "dropping the subscription cancels it"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut entries = self.subscribers.entries.lock();
        self.register(&mut entries, Arc::new(callback))
    }

    fn register(
        &self,
        entries: &mut Vec<(u64, Callback<T>)>,
        callback: Callback<T>,
    ) -> Subscription {
        let id = self.subscribers.next_id.fetch_add(1, Ordering::Relaxed);
        entries.push((id, callback));

        let weak: Weak<Subscribers<T>> = Arc::downgrade(&self.subscribers);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(subscribers) = weak.upgrade() {
                    subscribers.entries.lock().retain(|(sid, _)| *sid != id);
                }
            })),
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.entries.lock().len()
    }

    /// Wait until the value satisfies `predicate`, or fail with
    /// [`Error::TimedOut`] once `timeout` elapses.
    ///
    /// The value present at call time is checked first, so this resolves
    /// immediately if the predicate already holds. Every later value is seen,
    /// including one overwritten before the waiting task is polled. Dropping
    /// the returned future abandons both the timer and the listener.
    pub async fn wait_for<P>(&self, predicate: P, timeout: Duration) -> Result<T>
    where
        P: FnMut(&T) -> bool + Send + 'static,
    {
        self.wait_for_either(predicate, |_| false, timeout).await
    }

    pub async fn wait_for_value(&self, value: T, timeout: Duration) -> Result<T>
    where
        T: PartialEq,
    {
        self.wait_for(move |current| *current == value, timeout).await
    }

    /// Like [`wait_for`](Self::wait_for), but fails early with
    /// [`Error::WrongValue`] if the value first satisfies `reject`.
    pub async fn wait_for_either<P, R>(
        &self,
        mut accept: P,
        mut reject: R,
        timeout: Duration,
    ) -> Result<T>
    where
        P: FnMut(&T) -> bool + Send + 'static,
        R: FnMut(&T) -> bool + Send + 'static,
    {
        let (done, settled) = oneshot::channel();

        // Checking the current value and registering under the same lock as
        // `set` leaves no gap for a change to slip through.
        let _subscription = {
            let mut entries = self.subscribers.entries.lock();
            {
                let current = self.value.read();
                if accept(&*current) {
                    return Ok((*current).clone());
                }
                if reject(&*current) {
                    return Err(Error::WrongValue);
                }
            }

            let pending = Mutex::new(Some(Pending {
                accept,
                reject,
                done,
            }));
            let callback: Callback<T> = Arc::new(move |value: &T| {
                let mut slot = pending.lock();
                let Some(p) = slot.as_mut() else {
                    return;
                };
                let outcome = if (p.accept)(value) {
                    Ok(value.clone())
                } else if (p.reject)(value) {
                    Err(Error::WrongValue)
                } else {
                    return;
                };
                if let Some(p) = slot.take() {
                    let _ = p.done.send(outcome);
                }
            });
            self.register(&mut entries, callback)
        };

        match tokio::time::timeout(timeout, settled).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::WrongValue),
            Err(_) => Err(Error::TimedOut),
        }
    }
}

impl<T> Default for Published<T>
where
    T: Clone + Default + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for Published<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Published")
            .field("value", &*self.value.read())
            .finish()
    }
}

/// Cancels a [`Published::subscribe`] registration when cancelled or dropped.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Idempotent.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_set_notifies_in_subscription_order() {
        let published = Published::new(0u32);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = {
            let seen = Arc::clone(&seen);
            published.subscribe(move |v| seen.lock().push(("first", *v)))
        };
        let s2 = {
            let seen = Arc::clone(&seen);
            published.subscribe(move |v| seen.lock().push(("second", *v)))
        };

        published.set(7);
        assert_eq!(*seen.lock(), vec![("first", 7), ("second", 7)]);
        assert_eq!(published.get(), 7);
        drop((s1, s2));
    }

    #[test]
    fn test_subscribe_does_not_replay_current_value() {
        let published = Published::new(String::from("initial"));
        let calls = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let calls = Arc::clone(&calls);
            published.subscribe(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        published.set("next".to_string());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let published = Published::new(0u8);
        let calls = Arc::new(AtomicUsize::new(0));
        let mut sub = {
            let calls = Arc::clone(&calls);
            published.subscribe(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(published.subscriber_count(), 1);

        sub.cancel();
        sub.cancel();
        assert!(!sub.is_active());
        assert_eq!(published.subscriber_count(), 0);

        published.set(1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let sub = published.subscribe(|_| {});
        drop(sub);
        assert_eq!(published.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_resolves_immediately_when_already_satisfied() {
        let published = Published::new(5u32);
        let value = published
            .wait_for_value(5, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn test_wait_for_resolves_on_later_change() {
        let published = Arc::new(Published::new(0u32));
        let writer = Arc::clone(&published);
        tokio::spawn(async move {
            for i in 1..=3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                writer.set(i);
            }
        });

        let value = published
            .wait_for(|v| *v >= 3, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let published = Published::new(false);
        let result = published
            .wait_for_value(true, Duration::from_millis(20))
            .await;
        assert_eq!(result, Err(Error::TimedOut));
    }

    #[tokio::test]
    async fn test_wait_for_either_rejects() {
        let published = Arc::new(Published::new(0u32));
        let writer = Arc::clone(&published);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            writer.set(99);
        });

        let result = published
            .wait_for_either(|v| *v == 1, |v| *v == 99, Duration::from_secs(5))
            .await;
        assert_eq!(result, Err(Error::WrongValue));
    }

    #[tokio::test]
    async fn test_wait_for_sees_value_overwritten_before_poll() {
        let published = Arc::new(Published::new(0u32));
        let waiter = {
            let published = Arc::clone(&published);
            tokio::spawn(async move {
                published
                    .wait_for_value(1, Duration::from_millis(300))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        published.set(1);
        published.set(2);
        assert_eq!(waiter.await.unwrap(), Ok(1));
        assert_eq!(published.get(), 2);
        assert_eq!(published.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_settles_once() {
        let published = Arc::new(Published::new(0u32));
        let waiter = {
            let published = Arc::clone(&published);
            tokio::spawn(async move {
                published
                    .wait_for_either(|v| *v == 2, |v| *v == 1, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Rejected by the first value; the later accepted one changes nothing.
        published.set(1);
        published.set(2);
        assert_eq!(waiter.await.unwrap(), Err(Error::WrongValue));
    }

    #[tokio::test]
    async fn test_cancelled_wait_leaves_publisher_usable() {
        let published = Published::new(0u32);
        let waiting = published.wait_for_value(1, Duration::from_secs(60));
        tokio::select! {
            _ = waiting => panic!("value never changes"),
            () = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
        assert_eq!(published.subscriber_count(), 0);
        published.set(1);
        assert_eq!(published.get(), 1);
    }
}
