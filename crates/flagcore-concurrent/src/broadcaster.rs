use std::sync::Mutex;
use tokio::sync::mpsc;

/// Default per-subscriber channel capacity. Status and change events are
/// rare relative to the teacher's read-event streams (which use 256-deep
/// buffers in `services/receiver/src/cache.rs`), so a small default
/// suffices; callers needing more size a listener themselves.
const DEFAULT_CAPACITY: usize = 10;

struct Subscriber<V> {
    id: u64,
    tx: mpsc::Sender<V>,
}

impl<V> Clone for Subscriber<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
        }
    }
}

/// One-to-many delivery of values of a single type `V` to independent,
/// bounded subscriber queues.
///
/// `broadcast` delivers to every current subscriber in registration order
/// and awaits each send, so a subscriber that is not draining its channel
/// creates backpressure on the producer rather than silently losing
/// values. This is a deliberate choice: see `spec.md` §4.1.
pub struct Broadcaster<V> {
    subscribers: Mutex<Vec<Subscriber<V>>>,
    next_id: std::sync::atomic::AtomicU64,
    capacity: usize,
}

/// A subscription handle returned by [`Broadcaster::add_listener`]. Dropping
/// it (or passing it to [`Broadcaster::remove_listener`]) closes the
/// receive side; the broadcaster prunes it lazily on the next `broadcast`.
pub struct Listener<V> {
    id: u64,
    rx: mpsc::Receiver<V>,
}

impl<V> Listener<V> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<V> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<V, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

impl<V> Default for Broadcaster<V>
where
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Broadcaster<V>
where
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Registers a new subscriber and returns its receive handle.
    pub fn add_listener(&self) -> Listener<V> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("broadcaster subscriber lock poisoned")
            .push(Subscriber { id, tx });
        Listener { id, rx }
    }

    /// Unregisters a subscriber by id. No-op if already removed.
    pub fn remove_listener(&self, listener: &Listener<V>) {
        self.remove_by_id(listener.id);
    }

    fn remove_by_id(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("broadcaster subscriber lock poisoned")
            .retain(|s| s.id != id);
    }

    pub fn has_listeners(&self) -> bool {
        !self
            .subscribers
            .lock()
            .expect("broadcaster subscriber lock poisoned")
            .is_empty()
    }

    /// Delivers `value` to every current subscriber, in registration order,
    /// awaiting each send. Subscribers whose receiver has been dropped are
    /// pruned afterward rather than treated as an error.
    pub async fn broadcast(&self, value: V) {
        let snapshot: Vec<Subscriber<V>> = {
            let guard = self
                .subscribers
                .lock()
                .expect("broadcaster subscriber lock poisoned");
            guard.clone()
        };
        if snapshot.is_empty() {
            return;
        }
        let mut dead = Vec::new();
        for sub in &snapshot {
            if sub.tx.send(value.clone()).await.is_err() {
                dead.push(sub.id);
            }
        }
        if !dead.is_empty() {
            let mut guard = self
                .subscribers
                .lock()
                .expect("broadcaster subscriber lock poisoned");
            guard.retain(|s| !dead.contains(&s.id));
        }
    }

    /// Unregisters and closes every subscriber. Idempotent.
    pub fn close(&self) {
        self.subscribers
            .lock()
            .expect("broadcaster subscriber lock poisoned")
            .clear();
    }
}
