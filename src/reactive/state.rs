use std::fmt::{Debug, Formatter};
use std::sync::{Arc, RwLock};

use super::event::{Changes, EventStream, Subscription};
use crate::lock::{read_lock, write_lock};

/// Multicast stream that always holds a current value.
///
/// New subscribers are called with the current value immediately, then with
/// every later value.
pub struct StateStream<T> {
    value: Arc<RwLock<T>>,
    events: EventStream<T>,
}

impl<T> Clone for StateStream<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            events: self.events.clone(),
        }
    }
}

impl<T: Debug> Debug for StateStream<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStream")
            .field("value", &*read_lock(&self.value))
            .field("listeners", &self.events)
            .finish()
    }
}

impl<T: Clone + Default + 'static> Default for StateStream<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone + 'static> StateStream<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Arc::new(RwLock::new(value)),
            events: EventStream::new(),
        }
    }

    pub fn get(&self) -> T {
        read_lock(&self.value).clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&read_lock(&self.value))
    }

    pub fn set(&self, value: T) {
        *write_lock(&self.value) = value.clone();
        self.events.emit(&value);
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let next = {
            let mut current = write_lock(&self.value);
            f(&mut current);
            current.clone()
        };
        self.events.emit(&next);
    }

    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let current = self.get();
        listener(&current);
        self.events.subscribe(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.events.listener_count()
    }
}

impl<T: Clone + PartialEq + 'static> StateStream<T> {
    /// Publishes `value` only when it differs from the current one.
    pub fn set_if_changed(&self, value: T) -> bool {
        {
            let mut current = write_lock(&self.value);
            if *current == value {
                return false;
            }
            *current = value.clone();
        }
        self.events.emit(&value);
        true
    }
}

impl<T: Clone + Send + 'static> StateStream<T> {
    /// Async view starting with the current value.
    pub fn listen(&self) -> Changes<T> {
        self.events.listen_from(Some(self.get()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::Mutex;

    #[test]
    fn subscribe_replays_current_value_first() {
        let state = StateStream::new(1);
        state.set(2);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let _subscription = {
            let seen = seen.clone();
            state.subscribe(move |value| seen.lock().expect("seen lock").push(*value))
        };
        state.set(3);

        assert_eq!(*seen.lock().expect("seen lock"), vec![2, 3]);
        assert_eq!(state.get(), 3);
    }

    #[test]
    fn set_if_changed_skips_equal_values() {
        let state = StateStream::new("a".to_string());
        let count = Arc::new(Mutex::new(0));
        let _subscription = {
            let count = count.clone();
            state.subscribe(move |_| *count.lock().expect("count lock") += 1)
        };

        assert!(!state.set_if_changed("a".to_string()));
        assert!(state.set_if_changed("b".to_string()));
        assert_eq!(*count.lock().expect("count lock"), 2);
    }

    #[test]
    fn update_publishes_mutated_value() {
        let state = StateStream::new(vec![1]);
        state.update(|values| values.push(2));
        assert_eq!(state.with(|values| values.len()), 2);
    }

    #[test]
    fn listen_starts_with_current_value() {
        let state = StateStream::new(false);
        let mut changes = state.listen();
        state.set(true);

        let first = futures::executor::block_on(changes.next());
        let second = futures::executor::block_on(changes.next());
        assert_eq!((first, second), (Some(false), Some(true)));
    }
}
