//! Public face of the background request engine.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context as _, Error};
use mio::{Poll, Token, Waker};
use tracing::{event, instrument, Level};

use crate::driver::Driver;
use crate::pool::RequestPool;
use crate::shared::{RequestHandle, SharedRequest};
use crate::status::RequestStatus;

/// Reactor token reserved for the submission waker.
pub(crate) const WAKER: Token = Token(usize::MAX);

/// State shared between the public handle and the loop thread.
pub(crate) struct LoopShared {
    pub(crate) waker: Waker,
    pub(crate) pending: Mutex<Vec<Arc<SharedRequest>>>,
    /// Transfers the loop has accepted and not yet fully completed.
    pub(crate) active: AtomicUsize,
    pub(crate) running: AtomicBool,
    pub(crate) stopping: AtomicBool,
    /// Set by the loop thread, under the pending lock, once it has decided
    /// to exit; submissions observing it are refused instead of queued.
    pub(crate) terminated: AtomicBool,
}

impl LoopShared {
    pub(crate) fn lock_pending(&self) -> MutexGuard<'_, Vec<Arc<SharedRequest>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drives many HTTP requests concurrently on one background thread.
///
/// The loop owns a reactor, the multiplexed transfer engine, and a
/// [`RequestPool`]. Requests are submitted with [`start_request`] and
/// complete by invoking their callback on the loop thread. Dropping the
/// loop drains all in-flight requests first.
///
/// [`start_request`]: EventLoop::start_request
pub struct EventLoop {
    shared: Arc<LoopShared>,
    pool: RequestPool,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoop {
    /// Spawn the loop thread. Does not return until the thread is running,
    /// so requests can be started immediately afterwards.
    #[instrument("EventLoop::new", skip_all)]
    pub fn new() -> Result<Self, Error> {
        let poll = Poll::new().context("failed to create reactor")?;
        let waker =
            Waker::new(poll.registry(), WAKER).context("failed to create submission waker")?;

        let shared = Arc::new(LoopShared {
            waker,
            pending: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        });
        let pool = RequestPool::new();

        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("gantry-loop".into())
                .spawn(move || {
                    if let Err(error) = Driver::new(poll, shared).and_then(Driver::run) {
                        event!(Level::ERROR, ?error, "event loop thread failed");
                    }
                })
                .context("failed to spawn event loop thread")?
        };

        let value = Self {
            shared,
            pool,
            thread: Some(thread),
        };

        // Wait for the thread to come up before handing the loop out.
        while !value.is_running() {
            if value.thread.as_ref().map_or(true, |t| t.is_finished()) {
                bail!("event loop thread exited during startup");
            }
            thread::sleep(Duration::from_millis(1));
        }

        Ok(value)
    }

    /// True while the loop thread is processing events.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// True while any request is queued for admission or in flight.
    pub fn has_unfinished_requests(&self) -> bool {
        let pending = self.shared.lock_pending();
        !pending.is_empty() || self.shared.active.load(Ordering::Acquire) > 0
    }

    /// The pool this loop produces its requests from.
    pub fn request_pool(&self) -> &RequestPool {
        &self.pool
    }

    /// Submit a request. Returns `false`, without invoking any callback,
    /// when the loop is stopping.
    #[instrument("EventLoop::start_request", skip_all)]
    pub fn start_request(&self, handle: RequestHandle) -> bool {
        if self.shared.stopping.load(Ordering::Acquire) {
            return false;
        }

        let shared = handle.into_shared();
        {
            // Prepare here so the loop thread doesn't pay for it.
            let mut request = shared.lock();
            if let Err(error) = request.prepare_for_perform() {
                event!(Level::WARN, %error, "request could not be prepared");
                request.set_status(RequestStatus::FailedToStart);
            }
        }

        {
            let mut pending = self.shared.lock_pending();
            if self.shared.terminated.load(Ordering::Acquire) {
                return false;
            }
            pending.push(shared);
        }
        if let Err(error) = self.shared.waker.wake() {
            event!(Level::ERROR, ?error, "failed to wake event loop");
        }
        true
    }

    /// Stop accepting new requests. In-flight requests keep running until
    /// they complete on their own.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        if let Err(error) = self.shared.waker.wake() {
            event!(Level::WARN, ?error, "failed to wake event loop for stop");
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::Release);

        // Refuse to tear down while anything is still in flight.
        while self.has_unfinished_requests() {
            thread::sleep(Duration::from_millis(1));
        }

        if let Err(error) = self.shared.waker.wake() {
            event!(Level::WARN, ?error, "failed to wake event loop for shutdown");
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                event!(Level::ERROR, "event loop thread panicked");
            }
        }
    }
}
