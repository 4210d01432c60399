//! Serialized, observable, optionally persisted state container.
//!
//! Every mutation goes through [`Store::dispatch`]. Dispatched actions are
//! appended to a FIFO queue which is drained by exactly one pump task at a
//! time, so actions are applied in enqueue order no matter how long each one
//! takes. The action is enqueued when `dispatch` is *called*, not when the
//! returned future is first polled.
//!
//! ```text
//! dispatch(a1) ──┐
//! dispatch(a2) ──┼──► queue ──► pump ──► a1(state) ──► notify ──► save timer
//! get_state_safe ┘                 └───► a2(state) ──► notify ──► save timer
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::error::SluiceError;
use crate::persistor::{deep_merge, PersistenceConfig, PersistenceErrorHandler, Persistor};
use crate::sync::{lock, read, write};

/// Store id used when a store is not persisted.
pub const DEFAULT_STORE_ID: &str = "default";

/// Bounds every store state satisfies. Equality decides whether a dispatch
/// changed anything.
pub trait State: Clone + PartialEq + Send + Sync + 'static {}

impl<T> State for T where T: Clone + PartialEq + Send + Sync + 'static {}

type ActionFn<T> = Box<dyn FnOnce(T) -> BoxFuture<'static, Result<T>> + Send>;

/// A queued state transition.
///
/// An action that returns an error (or panics) leaves the state untouched.
pub struct Action<T> {
    run: ActionFn<T>,
}

impl<T: State> Action<T> {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(T) -> Result<T> + Send + 'static,
    {
        Self {
            run: Box::new(move |state| async move { f(state) }.boxed()),
        }
    }

    /// Infallible transition.
    pub fn map<F>(f: F) -> Self
    where
        F: FnOnce(T) -> T + Send + 'static,
    {
        Self::new(move |state| Ok(f(state)))
    }

    /// Asynchronous transition. The queue waits for it before running the
    /// next action.
    pub fn future<F, Fut>(f: F) -> Self
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            run: Box::new(move |state| async move { f(state).await }.boxed()),
        }
    }

    /// Replace the whole state.
    pub fn replace(state: T) -> Self {
        Self::map(move |_| state)
    }
}

impl<T> fmt::Debug for Action<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action").finish_non_exhaustive()
    }
}

/// Handle returned by [`Store::subscribe`]. Unsubscribing is explicit and
/// idempotent; dropping the handle keeps the subscription alive.
pub struct Unsubscribe {
    cancel: Box<dyn Fn() + Send + Sync>,
}

impl Unsubscribe {
    pub(crate) fn new(cancel: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Box::new(cancel),
        }
    }

    pub fn unsubscribe(&self) {
        (self.cancel)()
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Unsubscribe")
    }
}

enum Job<T> {
    Apply {
        action: Action<T>,
        done: oneshot::Sender<T>,
    },
    Fence(oneshot::Sender<T>),
}

struct Queue<T> {
    pending: VecDeque<Job<T>>,
    pumping: bool,
}

struct Subscriber<T> {
    id: u64,
    callback: Arc<dyn Fn(&T) + Send + Sync>,
}

struct Inner<T> {
    id: String,
    state: RwLock<T>,
    queue: Mutex<Queue<T>>,
    subscribers: Mutex<Vec<Subscriber<T>>>,
    next_subscriber: AtomicU64,
    saves: Option<mpsc::UnboundedSender<T>>,
    initialized: watch::Sender<bool>,
}

/// Serialized state container. Cheap to clone; clones share the same state.
pub struct Store<T: State> {
    inner: Arc<Inner<T>>,
}

impl<T: State> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: State> fmt::Debug for Store<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("id", &self.inner.id).finish()
    }
}

impl<T: State> Store<T> {
    /// In-memory store.
    pub fn new(initial: T) -> Self {
        let (initialized, _) = watch::channel(true);
        Self::from_parts(DEFAULT_STORE_ID.to_string(), initial, None, initialized)
    }

    fn from_parts(
        id: String,
        initial: T,
        saves: Option<mpsc::UnboundedSender<T>>,
        initialized: watch::Sender<bool>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                state: RwLock::new(initial),
                queue: Mutex::new(Queue {
                    pending: VecDeque::new(),
                    pumping: false,
                }),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(0),
                saves,
                initialized,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Enqueue `action`. The returned future resolves with the state right
    /// after the action ran, in queue order. It never fails: a failing action
    /// resolves with the unchanged state.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, action: Action<T>) -> impl Future<Output = T> + Send + 'static {
        let (done, rx) = oneshot::channel();
        self.inner.enqueue(Job::Apply { action, done });
        let inner = Arc::clone(&self.inner);
        async move { rx.await.unwrap_or_else(|_| inner.snapshot()) }
    }

    /// Snapshot of the current state, ignoring anything still queued.
    pub fn get_state(&self) -> T {
        self.inner.snapshot()
    }

    /// State after every action enqueued before this call, and none enqueued
    /// after it.
    pub fn get_state_safe(&self) -> impl Future<Output = T> + Send + 'static {
        let (done, rx) = oneshot::channel();
        self.inner.enqueue(Job::Fence(done));
        let inner = Arc::clone(&self.inner);
        async move { rx.await.unwrap_or_else(|_| inner.snapshot()) }
    }

    /// Register `callback` for state changes. It runs once per dispatch that
    /// produced a different state, before that dispatch resolves.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Unsubscribe {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.subscribers).push(Subscriber {
            id,
            callback: Arc::new(callback),
        });

        let inner = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = inner.upgrade() {
                lock(&inner.subscribers).retain(|subscriber| subscriber.id != id);
            }
        })
    }

    /// Resolves once a persisted store finished restoring its saved state.
    /// In-memory stores are initialized from the start.
    pub async fn wait_initialized(&self) {
        let mut initialized = self.inner.initialized.subscribe();
        // The sender lives in `inner`, which we hold, so this cannot close.
        let _ = initialized.wait_for(|ready| *ready).await;
    }
}

impl<T> Store<T>
where
    T: State + Serialize + DeserializeOwned,
{
    /// Store whose state is restored from and saved to `config.persistor`.
    ///
    /// Saved state is deep-merged over `initial` once loaded. Every state
    /// change re-arms a save timer of `config.save_delay`; a burst of changes
    /// results in a single write of the latest state.
    ///
    /// Must be called from within a tokio runtime.
    pub fn persisted(initial: T, config: PersistenceConfig<T>) -> Self {
        let PersistenceConfig {
            store_id,
            save_delay,
            persistor,
            on_initialized,
            on_error,
        } = config;

        let (saves, pending_saves) = mpsc::unbounded_channel();
        let (initialized, _) = watch::channel(false);
        let store = Self::from_parts(store_id.clone(), initial, Some(saves), initialized);

        let sink = Persistence {
            store_id,
            persistor,
            on_error,
        };
        tokio::spawn(save_worker(sink.clone(), save_delay, pending_saves));
        tokio::spawn(restore(store.clone(), sink, on_initialized));

        store
    }
}

impl<T: State> Inner<T> {
    fn snapshot(&self) -> T {
        read(&self.state).clone()
    }

    fn enqueue(self: &Arc<Self>, job: Job<T>) {
        let mut queue = lock(&self.queue);
        queue.pending.push_back(job);
        if queue.pumping {
            return;
        }
        queue.pumping = true;
        drop(queue);

        tokio::spawn(Arc::clone(self).pump());
    }

    async fn pump(self: Arc<Self>) {
        loop {
            let job = {
                let mut queue = lock(&self.queue);
                match queue.pending.pop_front() {
                    Some(job) => job,
                    None => {
                        queue.pumping = false;
                        return;
                    }
                }
            };

            match job {
                Job::Apply { action, done } => {
                    let state = self.apply(action).await;
                    let _ = done.send(state);
                }
                Job::Fence(done) => {
                    let _ = done.send(self.snapshot());
                }
            }
        }
    }

    async fn apply(&self, action: Action<T>) -> T {
        let current = self.snapshot();

        let next = match AssertUnwindSafe((action.run)(current.clone()))
            .catch_unwind()
            .await
        {
            Ok(Ok(next)) => next,
            Ok(Err(err)) => {
                warn!(store_id = %self.id, error = %err, "store action failed, state unchanged");
                return current;
            }
            Err(_) => {
                warn!(store_id = %self.id, "store action panicked, state unchanged");
                return current;
            }
        };

        if next == current {
            return current;
        }

        *write(&self.state) = next.clone();
        self.notify(&next);
        if let Some(saves) = &self.saves {
            let _ = saves.send(next.clone());
        }
        next
    }

    fn notify(&self, state: &T) {
        let callbacks: Vec<_> = lock(&self.subscribers)
            .iter()
            .map(|subscriber| Arc::clone(&subscriber.callback))
            .collect();

        for callback in callbacks {
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(state))).is_err() {
                warn!(store_id = %self.id, "store subscriber panicked");
            }
        }
    }
}

/// Where a persisted store reads, writes and reports.
#[derive(Clone)]
struct Persistence {
    store_id: String,
    persistor: Arc<dyn Persistor>,
    on_error: Option<PersistenceErrorHandler>,
}

impl Persistence {
    fn report(&self, err: anyhow::Error) {
        if let Some(on_error) = &self.on_error {
            on_error(SluiceError::persistence(self.store_id.clone(), err));
        }
    }

    async fn save<T: Serialize>(&self, state: &T) {
        let value = match serde_json::to_value(state) {
            Ok(value) => value,
            Err(err) => {
                warn!(store_id = %self.store_id, error = %err, "failed to serialize store state");
                self.report(err.into());
                return;
            }
        };

        if let Err(err) = self.persistor.set(&self.store_id, value).await {
            warn!(store_id = %self.store_id, error = %err, "failed to persist store state");
            self.report(err);
        }
    }
}

async fn restore<T>(
    store: Store<T>,
    sink: Persistence,
    on_initialized: Option<Box<dyn FnOnce(&T) + Send>>,
) where
    T: State + Serialize + DeserializeOwned,
{
    let id = sink.store_id.clone();

    let state = match sink.persistor.get(&id).await {
        // Anything saved wins over the initial state: objects merge key by
        // key, arrays and scalars replace it.
        Ok(Some(saved)) => {
            store
                .dispatch(Action::new(move |current: T| {
                    let mut merged = serde_json::to_value(&current)?;
                    deep_merge(&mut merged, saved);
                    Ok(serde_json::from_value(merged)?)
                }))
                .await
        }
        Ok(None) => {
            let state = store.get_state();
            sink.save(&state).await;
            state
        }
        Err(err) => {
            // Keep whatever is stored; an unreadable value is not proof that
            // nothing was saved.
            warn!(store_id = %id, error = %err, "failed to read persisted state");
            sink.report(err);
            store.get_state()
        }
    };

    store.inner.initialized.send_replace(true);
    debug!(store_id = %id, "store initialized");

    if let Some(callback) = on_initialized {
        callback(&state);
    }
}

async fn save_worker<T: Serialize>(
    sink: Persistence,
    save_delay: Duration,
    mut pending: mpsc::UnboundedReceiver<T>,
) {
    while let Some(mut latest) = pending.recv().await {
        loop {
            match tokio::time::timeout(save_delay, pending.recv()).await {
                Ok(Some(next)) => latest = next,
                // Quiet for a full window, or the store is gone: write now.
                Ok(None) | Err(_) => break,
            }
        }
        sink.save(&latest).await;
    }
}
