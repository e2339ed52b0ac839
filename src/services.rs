// 14.0: injected collaborators. clock, ids, task dispatch, per-key execution tokens.

use crate::types::{AccountId, AssetPairId, Timestamp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Deterministic clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: AtomicI64::new(start.as_millis()),
        }
    }

    pub fn set(&self, time: Timestamp) {
        self.millis.store(time.as_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

#[derive(Debug, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn generate(&self) -> String {
        format!("{}{}", self.prefix, self.next.fetch_add(1, Ordering::SeqCst))
    }
}

// 14.1: task dispatch. tick processing hands triggered executions off here
pub type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub trait TaskDispatcher: Send + Sync {
    fn dispatch(&self, name: &'static str, task: BoxedTask);
}

/// Spawns onto a tokio runtime and remembers in-flight tasks so callers can
/// wait for quiescence.
#[derive(Debug)]
pub struct TokioDispatcher {
    handle: Handle,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl TokioDispatcher {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            in_flight: Mutex::new(Vec::new()),
        }
    }

    /// Uses the runtime of the calling context. Panics outside a runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    pub fn in_flight(&self) -> usize {
        let mut tasks = self.in_flight.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.len()
    }

    /// Waits until every dispatched task, including ones dispatched meanwhile, has finished.
    pub async fn wait_idle(&self) {
        loop {
            let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.in_flight.lock());
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    tracing::error!(error = %e, "dispatched task failed");
                }
            }
        }
    }
}

impl TaskDispatcher for TokioDispatcher {
    fn dispatch(&self, name: &'static str, task: BoxedTask) {
        tracing::trace!(task = name, "dispatching");
        let handle = self.handle.spawn(task);
        let mut tasks = self.in_flight.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }
}

// 14.2: keyed exclusive tokens. created on demand, pruned when idle
#[derive(Debug)]
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn token(&self, key: &K) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    pub async fn acquire(&self, key: &K) -> OwnedMutexGuard<()> {
        self.token(key).lock_owned().await
    }

    pub fn try_acquire(&self, key: &K) -> Option<OwnedMutexGuard<()>> {
        self.token(key).try_lock_owned().ok()
    }

    /// Drops tokens nobody holds or waits on.
    pub fn prune(&self) -> usize {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, token| Arc::strong_count(token) > 1);
        before - locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

pub type AccountLocks = KeyedLocks<AccountId>;
pub type InstrumentLocks = KeyedLocks<AssetPairId>;
