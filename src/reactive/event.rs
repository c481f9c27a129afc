use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use futures::channel::mpsc;
use futures::{Stream, StreamExt};

use crate::lock::{read_lock, write_lock};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Listeners<T> {
    next_id: u64,
    entries: BTreeMap<u64, Listener<T>>,
}

/// Multicast stream without a stored value.
///
/// Listeners only observe events emitted after they subscribed. Emission
/// snapshots the listener list first, so a listener may subscribe, unsubscribe
/// or emit again from inside its callback.
pub struct EventStream<T> {
    listeners: Arc<RwLock<Listeners<T>>>,
}

impl<T> Clone for EventStream<T> {
    fn clone(&self) -> Self {
        Self {
            listeners: self.listeners.clone(),
        }
    }
}

impl<T: 'static> Default for EventStream<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for EventStream<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("listeners", &read_lock(&self.listeners).entries.len())
            .finish()
    }
}

impl<T: 'static> EventStream<T> {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(RwLock::new(Listeners {
                next_id: 0,
                entries: BTreeMap::new(),
            })),
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut listeners = write_lock(&self.listeners);
            let id = listeners.next_id;
            listeners.next_id += 1;
            listeners.entries.insert(id, Arc::new(listener));
            id
        };
        let weak = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = weak.upgrade() {
                write_lock(&listeners).entries.remove(&id);
            }
        })
    }

    pub fn emit(&self, event: &T) {
        let listeners = read_lock(&self.listeners)
            .entries
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        read_lock(&self.listeners).entries.len()
    }
}

impl<T: Clone + Send + 'static> EventStream<T> {
    /// Async view of future emissions. The returned stream owns its
    /// subscription and releases it when dropped.
    pub fn listen(&self) -> Changes<T> {
        self.listen_from(None)
    }

    pub(crate) fn listen_from(&self, initial: Option<T>) -> Changes<T> {
        let (sender, receiver) = mpsc::unbounded();
        if let Some(initial) = initial {
            let _ = sender.unbounded_send(initial);
        }
        let subscription = self.subscribe(move |event: &T| {
            let _ = sender.unbounded_send(event.clone());
        });
        Changes {
            receiver,
            _subscription: subscription,
        }
    }
}

/// Guard for a registered listener. Dropping it releases the listener.
#[must_use = "dropping a Subscription releases its listener immediately"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

pub struct Changes<T> {
    receiver: mpsc::UnboundedReceiver<T>,
    _subscription: Subscription,
}

impl<T> Stream for Changes<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.receiver.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn listeners_only_see_events_after_subscribing() {
        let stream = EventStream::<u32>::new();
        stream.emit(&1);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let _subscription = {
            let seen = seen.clone();
            stream.subscribe(move |value| seen.lock().expect("seen lock").push(*value))
        };
        stream.emit(&2);
        stream.emit(&3);

        assert_eq!(*seen.lock().expect("seen lock"), vec![2, 3]);
    }

    #[test]
    fn dropping_subscription_releases_listener() {
        let stream = EventStream::<u32>::new();
        let subscription = stream.subscribe(|_| {});
        let other = stream.subscribe(|_| {});
        assert_eq!(stream.listener_count(), 2);

        drop(subscription);
        assert_eq!(stream.listener_count(), 1);
        other.unsubscribe();
        assert_eq!(stream.listener_count(), 0);
    }

    #[test]
    fn subscription_outliving_stream_is_harmless() {
        let stream = EventStream::<u32>::new();
        let subscription = stream.subscribe(|_| {});
        drop(stream);
        assert!(subscription.is_active());
        drop(subscription);
    }

    #[test]
    fn listener_can_unsubscribe_reentrantly() {
        let stream = EventStream::<u32>::new();
        let slot = Arc::new(Mutex::new(None::<Subscription>));
        let count = Arc::new(Mutex::new(0));
        let subscription = {
            let slot = slot.clone();
            let count = count.clone();
            stream.subscribe(move |_| {
                *count.lock().expect("count lock") += 1;
                slot.lock().expect("slot lock").take();
            })
        };
        *slot.lock().expect("slot lock") = Some(subscription);

        stream.emit(&1);
        stream.emit(&2);
        assert_eq!(*count.lock().expect("count lock"), 1);
        assert_eq!(stream.listener_count(), 0);
    }

    #[test]
    fn listen_forwards_emissions_as_async_stream() {
        let stream = EventStream::<&'static str>::new();
        let mut changes = stream.listen();
        assert_eq!(stream.listener_count(), 1);

        stream.emit(&"a");
        stream.emit(&"b");
        let first = futures::executor::block_on(changes.next());
        let second = futures::executor::block_on(changes.next());
        assert_eq!((first, second), (Some("a"), Some("b")));

        drop(changes);
        assert_eq!(stream.listener_count(), 0);
    }
}
