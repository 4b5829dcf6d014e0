//! Process-wide shared loop
//!
//! The loop is a current-thread tokio runtime driven by a dedicated,
//! named background thread. It is created on first use and then reused
//! for the rest of the process: dropping the last [`LoopHandle`] does not
//! stop it, because calls submitted by other threads may still be in
//! flight. Only [`LoopOwner::shutdown`] tears it down.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;

use kf_core::config::BridgeConfig;
use kf_core::BridgeError;

/// Name of the shared loop thread
pub const LOOP_THREAD_NAME: &str = "kf-shared-loop";

/// How long tasks still queued at shutdown get to unwind
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(1);

static OWNER: Mutex<Option<Arc<LoopShared>>> = Mutex::new(None);
static THREADS_STARTED: AtomicUsize = AtomicUsize::new(0);

struct LoopShared {
    runtime: Handle,
    thread_id: ThreadId,
    borrowers: AtomicUsize,
    running: Arc<AtomicBool>,
    in_flight: AtomicUsize,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Clears the running flag when the loop thread exits, panics included
struct RunningFlag(Arc<AtomicBool>);

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Entry point to the process-wide loop
pub struct LoopOwner;

impl LoopOwner {
    /// Borrow the shared loop, starting it with default settings if needed
    pub fn acquire() -> Result<LoopHandle, BridgeError> {
        Self::acquire_with(&BridgeConfig::default())
    }

    /// Borrow the shared loop, starting it if no live loop exists
    ///
    /// Concurrent callers serialize on the owner lock, so exactly one of
    /// them starts the thread and the rest receive handles to it. The
    /// winner waits at most `config.startup_grace` for the thread to
    /// report ready. A failed start installs nothing and is not counted
    /// in [`scheduler_threads_started`](Self::scheduler_threads_started);
    /// the next call starts over.
    pub fn acquire_with(config: &BridgeConfig) -> Result<LoopHandle, BridgeError> {
        let mut owner = OWNER.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(shared) = owner.as_ref() {
            if shared.running.load(Ordering::SeqCst) {
                return Ok(LoopHandle::borrow(shared));
            }
            tracing::warn!("Shared loop thread has exited, starting a new one");
        }

        let shared = start_loop(config.startup_grace)?;
        *owner = Some(Arc::clone(&shared));
        Ok(LoopHandle::borrow(&shared))
    }

    /// Return a borrowed handle
    ///
    /// The loop itself keeps running.
    pub fn release(handle: LoopHandle) {
        drop(handle);
    }

    /// Stop the shared loop and join its thread
    ///
    /// Intended for process exit. Pending calls fail with
    /// `BridgeError::LoopShutdown`. Returns false if no loop was running.
    pub fn shutdown() -> bool {
        let shared = OWNER.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(shared) = shared else {
            return false;
        };

        tracing::info!("Shutting down shared loop");
        if let Some(tx) = lock(&shared.shutdown_tx).take() {
            let _ = tx.send(());
        }

        if thread::current().id() == shared.thread_id {
            // Cannot join ourselves; the thread exits once this task yields
            return true;
        }

        if let Some(thread) = lock(&shared.thread).take() {
            if thread.join().is_err() {
                tracing::error!("Shared loop thread panicked during shutdown");
            }
        }
        true
    }

    /// Number of loop threads started by this process so far
    pub fn scheduler_threads_started() -> usize {
        THREADS_STARTED.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn start_loop(startup_grace: Duration) -> Result<Arc<LoopShared>, BridgeError> {
    let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<Handle, String>>(1);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let running = Arc::new(AtomicBool::new(false));
    let thread_running = Arc::clone(&running);

    let thread = thread::Builder::new()
        .name(LOOP_THREAD_NAME.to_string())
        .spawn(move || {
            let runtime = match Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready_tx.send(Err(format!("failed to build runtime: {}", e)));
                    return;
                }
            };

            thread_running.store(true, Ordering::SeqCst);
            let _running = RunningFlag(thread_running);
            let _ = ready_tx.send(Ok(runtime.handle().clone()));

            // Resolves on explicit shutdown, or when the owner is dropped.
            // A thread that reported ready too late finds the sender
            // already gone and exits here.
            runtime.block_on(async {
                let _ = shutdown_rx.await;
            });

            tracing::debug!("Shared loop stopped, draining remaining tasks");
            runtime.shutdown_timeout(SHUTDOWN_DRAIN);
        })
        .map_err(|e| BridgeError::Startup {
            waited: Duration::ZERO,
            reason: format!("failed to spawn loop thread: {}", e),
        })?;

    let thread_id = thread.thread().id();

    let runtime = match ready_rx.recv_timeout(startup_grace) {
        Ok(Ok(runtime)) => runtime,
        Ok(Err(reason)) => {
            return Err(BridgeError::Startup {
                waited: startup_grace,
                reason,
            })
        }
        Err(RecvTimeoutError::Timeout) => {
            return Err(BridgeError::Startup {
                waited: startup_grace,
                reason: "loop thread did not report ready".to_string(),
            })
        }
        Err(RecvTimeoutError::Disconnected) => {
            return Err(BridgeError::Startup {
                waited: startup_grace,
                reason: "loop thread exited during startup".to_string(),
            })
        }
    };

    let started = THREADS_STARTED.fetch_add(1, Ordering::SeqCst) + 1;
    tracing::info!(thread = LOOP_THREAD_NAME, started, "Shared loop running");

    Ok(Arc::new(LoopShared {
        runtime,
        thread_id,
        borrowers: AtomicUsize::new(0),
        running,
        in_flight: AtomicUsize::new(0),
        shutdown_tx: Mutex::new(Some(shutdown_tx)),
        thread: Mutex::new(Some(thread)),
    }))
}

/// A borrowed reference to the shared loop
///
/// Cloning counts as another borrower; dropping releases the borrow.
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    fn borrow(shared: &Arc<LoopShared>) -> Self {
        shared.borrowers.fetch_add(1, Ordering::SeqCst);
        Self {
            shared: Arc::clone(shared),
        }
    }

    /// Runtime handle used to spawn onto the loop
    pub fn runtime(&self) -> &Handle {
        &self.shared.runtime
    }

    /// Identity of the loop thread
    pub fn thread_id(&self) -> ThreadId {
        self.shared.thread_id
    }

    /// Whether the calling thread is the loop thread itself
    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    /// Active borrowers of this loop
    pub fn borrowers(&self) -> usize {
        self.shared.borrowers.load(Ordering::SeqCst)
    }

    /// Whether the loop thread is still alive
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Forwarded calls currently alive on the loop
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn track_call(&self) -> InFlightGuard {
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Clone for LoopHandle {
    fn clone(&self) -> Self {
        Self::borrow(&self.shared)
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        self.shared.borrowers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread_id", &self.shared.thread_id)
            .field("borrowers", &self.borrowers())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Counts a forwarded call as in flight until its task is dropped
pub(crate) struct InFlightGuard {
    shared: Arc<LoopShared>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrent_acquire_shares_one_thread() {
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    LoopOwner::acquire().unwrap().thread_id()
                })
            })
            .collect();

        let ids: Vec<ThreadId> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(LoopOwner::scheduler_threads_started(), 1);
    }

    #[test]
    fn test_repeated_acquire_release_does_not_leak_threads() {
        let first = LoopOwner::acquire().unwrap().thread_id();
        for _ in 0..100 {
            let handle = LoopOwner::acquire().unwrap();
            assert_eq!(handle.thread_id(), first);
            LoopOwner::release(handle);
        }
        assert_eq!(LoopOwner::scheduler_threads_started(), 1);
    }

    #[test]
    fn test_loop_survives_last_release() {
        let handle = LoopOwner::acquire().unwrap();
        let id = handle.thread_id();
        LoopOwner::release(handle);

        let again = LoopOwner::acquire().unwrap();
        assert!(again.is_running());
        assert_eq!(again.thread_id(), id);
    }

    #[test]
    fn test_loop_thread_is_named() {
        let handle = LoopOwner::acquire().unwrap();
        let (tx, rx) = std_mpsc::channel();
        handle.runtime().spawn(async move {
            let _ = tx.send(thread::current().name().map(str::to_string));
        });
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some(LOOP_THREAD_NAME));
    }
}
