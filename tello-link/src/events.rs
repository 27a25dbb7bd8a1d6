use std::sync::Mutex;

/// Handle returned by `subscribe`, used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<T> = Box<dyn Fn(&T) + Send>;

/// Fan-out registry for one event payload type.
///
/// Callbacks are invoked synchronously, in subscription order, from the
/// worker thread that produced the payload. A slow callback therefore slows
/// the producing loop down; consumers needing decoupling should hand the
/// payload off to their own channel.
pub(crate) struct Subscribers<T> {
    inner: Mutex<Registry<T>>,
}

struct Registry<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

impl<T> Subscribers<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            }),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + Send + 'static) -> SubscriptionId {
        let mut registry = self.inner.lock().unwrap();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.push((id, Box::new(callback)));
        SubscriptionId(id)
    }

    /// Remove a subscriber. Returns whether the id was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.inner.lock().unwrap();
        let before = registry.entries.len();
        registry.entries.retain(|(entry_id, _)| *entry_id != id.0);
        registry.entries.len() != before
    }

    pub fn dispatch(&self, payload: &T) {
        let registry = self.inner.lock().unwrap();
        for (_, callback) in registry.entries.iter() {
            callback(payload);
        }
    }
}
