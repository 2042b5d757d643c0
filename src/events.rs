//! Wallet event dispatch
//!
//! Everything interesting a wallet does is reported through one tagged
//! event enum, delivered to registered (executor, callback) pairs. The
//! executor decides which thread runs the callback: same-thread for tests
//! and simple apps, a dedicated user thread for GUI-style consumers.
//! Callbacks are never invoked with a wallet lock held, and a panicking
//! listener is logged and dropped rather than poisoning the wallet.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use bitcoin::{Amount, Txid};
use parking_lot::Mutex;
use tracing::error;

/// Something the wallet wants its listeners to know.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalletEvent {
    /// A transaction sending us value arrived.
    CoinsReceived {
        /// The transaction.
        txid: Txid,
        /// Estimated balance before it.
        prev_balance: Amount,
        /// Estimated balance after it.
        new_balance: Amount,
    },
    /// A transaction spending our value arrived.
    CoinsSent {
        /// The transaction.
        txid: Txid,
        /// Estimated balance before it.
        prev_balance: Amount,
        /// Estimated balance after it.
        new_balance: Amount,
    },
    /// The best chain rolled back and replayed; balances may have moved
    /// arbitrarily.
    Reorganized,
    /// Catch-all: something about the wallet's content changed.
    Changed,
    /// The set of watched scripts changed.
    ScriptsChanged,
    /// A transaction's confidence changed.
    ConfidenceChanged(Txid),
    /// Keys were added to the key registry.
    KeysAdded(usize),
    /// The current receive key advanced.
    CurrentKeyChanged,
}

/// Runs listener callbacks on some thread.
pub trait Executor: Send + Sync {
    /// Submits a task.
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Runs callbacks inline on the dispatching thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct SameThreadExecutor;

impl Executor for SameThreadExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) { task() }
}

/// Runs callbacks sequentially on one dedicated background thread.
pub struct UserThreadExecutor {
    sender: mpsc::Sender<Box<dyn FnOnce() + Send>>,
}

impl Default for UserThreadExecutor {
    fn default() -> Self { Self::new() }
}

impl UserThreadExecutor {
    /// Spawns the user thread.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel::<Box<dyn FnOnce() + Send>>();
        thread::Builder::new()
            .name("wallet-user-thread".into())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    task();
                }
            })
            .expect("spawning the wallet user thread should succeed");
        Self { sender }
    }
}

impl Executor for UserThreadExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        // A send failure means the thread is gone at shutdown; dropping
        // the task is the only sane option.
        let _ = self.sender.send(task);
    }
}

/// A wallet event callback.
pub type Listener = Arc<dyn Fn(&WalletEvent) + Send + Sync>;

/// Identifies a registration for later removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    executor: Arc<dyn Executor>,
    listener: Listener,
}

/// The set of registered (executor, listener) pairs.
#[derive(Default)]
pub struct ListenerSet {
    registrations: Mutex<Vec<Registration>>,
    next_id: Mutex<u64>,
}

impl ListenerSet {
    /// Creates an empty set.
    pub fn new() -> Self { Self::default() }

    /// Registers `listener` to run on `executor`.
    pub fn add(&self, executor: Arc<dyn Executor>, listener: Listener) -> ListenerId {
        let mut next = self.next_id.lock();
        let id = ListenerId(*next);
        *next += 1;
        self.registrations.lock().push(Registration { id, executor, listener });
        id
    }

    /// Removes a registration. Returns whether it existed.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut registrations = self.registrations.lock();
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        registrations.len() != before
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize { self.registrations.lock().len() }

    /// Whether no listeners are registered.
    pub fn is_empty(&self) -> bool { self.registrations.lock().is_empty() }

    /// Dispatches one event to every registration.
    ///
    /// Must be called without any wallet lock held: executors may run the
    /// callback inline.
    pub fn dispatch(&self, event: &WalletEvent) {
        let registrations: Vec<(Arc<dyn Executor>, Listener)> = {
            let guard = self.registrations.lock();
            guard.iter().map(|r| (r.executor.clone(), r.listener.clone())).collect()
        };
        for (executor, listener) in registrations {
            let event = event.clone();
            executor.execute(Box::new(move || {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                    error!(?event, ?panic, "wallet event listener panicked");
                }
            }));
        }
    }

    /// Dispatches a batch of events in order.
    pub fn dispatch_all(&self, events: &[WalletEvent]) {
        for event in events {
            self.dispatch(event);
        }
    }
}
