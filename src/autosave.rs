//! Background wallet persistence
//!
//! A single background owner serializes coalesced writes: mutators call
//! [`Autosave::save_later`] and the owner batches everything that happens
//! within the configured delay into one write. [`Autosave::save_now`]
//! preempts the delay with a synchronous write. All writes go through a
//! temp-file-then-rename so a crash never leaves a torn wallet file.
//!
//! The on-disk format itself is the serialization collaborator's concern,
//! reached through [`WalletPersister`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use std::{fs, io, thread};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

/// Produces the bytes of the wallet's on-disk representation.
pub trait WalletPersister: Send + Sync {
    /// Serializes the current wallet state.
    fn encode(&self) -> Vec<u8>;
}

#[derive(Default)]
struct SaveState {
    dirty: bool,
    flush: bool,
    shutdown: bool,
}

struct Shared {
    path: PathBuf,
    delay: Duration,
    persister: Arc<dyn WalletPersister>,
    state: Mutex<SaveState>,
    cv: Condvar,
    completed: AtomicU64,
}

impl Shared {
    fn write_atomically(&self) -> io::Result<()> {
        let bytes = self.persister.encode();
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &self.path)?;
        self.completed.fetch_add(1, Ordering::SeqCst);
        debug!(path = %self.path.display(), bytes = bytes.len(), "wallet saved");
        Ok(())
    }
}

/// The background save owner.
pub struct Autosave {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Autosave {
    /// Starts the save owner writing to `path` with the given coalescing
    /// delay.
    pub fn new(path: impl AsRef<Path>, delay: Duration, persister: Arc<dyn WalletPersister>) -> Self {
        let shared = Arc::new(Shared {
            path: path.as_ref().to_path_buf(),
            delay,
            persister,
            state: Mutex::new(SaveState::default()),
            cv: Condvar::new(),
            completed: AtomicU64::new(0),
        });
        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name("wallet-autosave".into())
            .spawn(move || loop {
                {
                    let mut state = worker.state.lock();
                    while !state.dirty && !state.shutdown {
                        worker.cv.wait(&mut state);
                    }
                    if !state.dirty {
                        break;
                    }
                    // Coalesce: sit out the delay so a burst of mutations
                    // becomes one write, unless a flush preempts it.
                    if !state.flush && !state.shutdown {
                        worker.cv.wait_for(&mut state, worker.delay);
                    }
                    state.dirty = false;
                    state.flush = false;
                }
                if let Err(err) = worker.write_atomically() {
                    error!(?err, "background wallet save failed");
                }
            })
            .expect("spawning the autosave thread should succeed");
        Self { shared, handle: Some(handle) }
    }

    /// Schedules a coalesced write after the configured delay.
    pub fn save_later(&self) {
        let mut state = self.shared.state.lock();
        state.dirty = true;
        self.shared.cv.notify_all();
    }

    /// Writes synchronously, preempting any scheduled delayed write.
    pub fn save_now(&self) -> io::Result<()> {
        {
            let mut state = self.shared.state.lock();
            state.dirty = false;
            state.flush = false;
        }
        self.shared.write_atomically()
    }

    /// Number of completed writes, for tests and monitoring.
    pub fn completed_saves(&self) -> u64 { self.shared.completed.load(Ordering::SeqCst) }

    /// The file being maintained.
    pub fn path(&self) -> &Path { &self.shared.path }
}

impl Drop for Autosave {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.flush = true;
            self.shared.cv.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubPersister(Vec<u8>);

    impl WalletPersister for StubPersister {
        fn encode(&self) -> Vec<u8> { self.0.clone() }
    }

    #[test]
    fn test_save_now_writes_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("test.wallet");
        let autosave =
            Autosave::new(&path, Duration::from_secs(60), Arc::new(StubPersister(vec![1, 2, 3])));

        autosave.save_now().expect("save should succeed");

        assert_eq!(fs::read(&path).expect("file readable"), vec![1, 2, 3]);
        assert_eq!(autosave.completed_saves(), 1);
    }

    #[test]
    fn test_save_later_coalesces() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("test.wallet");
        let autosave =
            Autosave::new(&path, Duration::from_millis(50), Arc::new(StubPersister(vec![7])));

        autosave.save_later();
        autosave.save_later();
        autosave.save_later();

        let mut waited = 0;
        while autosave.completed_saves() == 0 && waited < 100 {
            thread::sleep(Duration::from_millis(10));
            waited += 1;
        }
        assert_eq!(autosave.completed_saves(), 1);
        assert!(path.exists());
    }

    #[test]
    fn test_drop_flushes_pending_write() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("test.wallet");
        {
            let autosave = Autosave::new(
                &path,
                Duration::from_secs(60),
                Arc::new(StubPersister(vec![9])),
            );
            autosave.save_later();
        }
        assert_eq!(fs::read(&path).expect("file readable"), vec![9]);
    }
}
