//! The loop thread.
//!
//! One thread owns the reactor, the multiplexed transfer engine, the active
//! set, and the response-wait deadline set. Everything here runs on that
//! thread; the only cross-thread touch points are the pending queue and the
//! counters in [`LoopShared`].
//!
//! The engine talks back through two callbacks: a socket callback asking for
//! reactor (de)registrations and a timer callback asking for one short-lived
//! timer. Neither may re-enter the engine, so both only record their request;
//! the driver applies the recorded work after every engine call.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::os::fd::RawFd;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Error};
use curl::multi::{Easy2Handle, Events, Multi, Socket, SocketEvents};
use mio::unix::SourceFd;
use mio::{Interest, Token};
use tracing::{event, instrument, Level};

use crate::collector::Collector;
use crate::event_loop::{LoopShared, WAKER};
use crate::shared::{RequestHandle, SharedRequest};
use crate::status::RequestStatus;

/// A transfer registered with the engine.
struct ActiveTransfer {
    handle: Easy2Handle<Collector>,
    shared: Arc<SharedRequest>,
}

/// Socket work recorded by the engine's socket callback.
struct SocketUpdate {
    socket: Socket,
    events: SocketEvents,
    token: usize,
}

pub(crate) struct Driver {
    // Declared before `multi` so in-flight engine registrations drop first.
    active: HashMap<usize, ActiveTransfer>,
    deadlines: BTreeMap<(Instant, u64), Arc<SharedRequest>>,
    sockets: HashMap<usize, RawFd>,

    multi: Multi,
    poll: mio::Poll,
    shared: Arc<LoopShared>,

    socket_updates: Arc<Mutex<Vec<SocketUpdate>>>,
    timer_update: Arc<Mutex<Option<Option<Duration>>>>,
    engine_timer: Option<Instant>,

    next_socket_token: usize,
    next_transfer_token: usize,
    next_deadline_seq: u64,

    /// Swap target for the pending queue, reused across drains.
    grabbed: Vec<Arc<SharedRequest>>,
}

impl Driver {
    pub(crate) fn new(poll: mio::Poll, shared: Arc<LoopShared>) -> Result<Self, Error> {
        let mut multi = Multi::new();

        let socket_updates: Arc<Mutex<Vec<SocketUpdate>>> = Arc::default();
        let timer_update: Arc<Mutex<Option<Option<Duration>>>> = Arc::default();

        {
            let socket_updates = Arc::clone(&socket_updates);
            multi
                .socket_function(move |socket, events, token| {
                    let mut updates =
                        socket_updates.lock().unwrap_or_else(PoisonError::into_inner);
                    updates.push(SocketUpdate {
                        socket,
                        events,
                        token,
                    });
                })
                .context("failed to install engine socket callback")?;
        }
        {
            let timer_update = Arc::clone(&timer_update);
            multi
                .timer_function(move |timeout| {
                    *timer_update.lock().unwrap_or_else(PoisonError::into_inner) = Some(timeout);
                    true
                })
                .context("failed to install engine timer callback")?;
        }

        Ok(Self {
            active: HashMap::new(),
            deadlines: BTreeMap::new(),
            sockets: HashMap::new(),
            multi,
            poll,
            shared,
            socket_updates,
            timer_update,
            engine_timer: None,
            // Zero is the engine's "unassigned" marker for socket tokens.
            next_socket_token: 1,
            next_transfer_token: 1,
            next_deadline_seq: 0,
            grabbed: Vec::new(),
        })
    }

    #[instrument("event-loop", skip_all)]
    pub(crate) fn run(mut self) -> Result<(), Error> {
        self.shared.running.store(true, Ordering::Release);
        event!(Level::DEBUG, "event loop running");

        let result = self.poll_loop();

        self.shared.running.store(false, Ordering::Release);
        event!(Level::DEBUG, "event loop stopped");
        result
    }

    fn poll_loop(&mut self) -> Result<(), Error> {
        let mut events = mio::Events::with_capacity(256);

        loop {
            if self.should_exit() {
                break;
            }

            let timeout = self.next_timeout();
            if let Err(error) = self.poll.poll(&mut events, timeout) {
                if error.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(error).context("reactor poll failed");
            }

            for ready in events.iter() {
                if ready.token() == WAKER {
                    continue;
                }
                self.on_socket_ready(ready);
            }

            self.drain_pending();
            self.run_engine_timer();
            self.expire_response_waits();
        }

        Ok(())
    }

    fn stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    /// Decide, atomically with respect to submissions, whether the loop can
    /// exit. Once this returns true no submission can slip into the queue.
    fn should_exit(&self) -> bool {
        if !self.stopping() || !self.active.is_empty() {
            return false;
        }
        let pending = self.shared.lock_pending();
        if pending.is_empty() {
            self.shared.terminated.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Sleep until the next timer is due: either the engine's own timeout
    /// scheduling or the earliest response-wait deadline.
    fn next_timeout(&self) -> Option<Duration> {
        let mut deadline = self.engine_timer;
        if let Some((&(wait_deadline, _), _)) = self.deadlines.first_key_value() {
            deadline = Some(match deadline {
                Some(current) => current.min(wait_deadline),
                None => wait_deadline,
            });
        }
        deadline.map(|at| at.saturating_duration_since(Instant::now()))
    }

    // ── Event sources ───────────────────────────────────────────────────

    /// Reactor readiness translates directly into an engine socket action.
    fn on_socket_ready(&mut self, ready: &mio::event::Event) {
        let token = ready.token().0;
        let Some(&fd) = self.sockets.get(&token) else {
            // Deregistration can race a queued readiness event.
            event!(Level::TRACE, token, "readiness for unknown socket");
            return;
        };

        let mut mask = Events::new();
        mask.input(ready.is_readable());
        mask.output(ready.is_writable());
        mask.error(ready.is_error());

        if let Err(error) = self.multi.action(fd, &mask) {
            event!(Level::WARN, %error, fd, "engine socket action failed");
        }
        self.after_engine_call();
    }

    /// Admit submitted requests in submission order. The queue is swapped
    /// out so the mutex is never held across an engine call.
    fn drain_pending(&mut self) {
        {
            let mut pending = self.shared.lock_pending();
            if pending.is_empty() {
                return;
            }
            std::mem::swap(&mut *pending, &mut self.grabbed);
            // Counted as active while the queue lock is still held, so
            // quiescence checks never observe a gap.
            self.shared
                .active
                .fetch_add(self.grabbed.len(), Ordering::AcqRel);
        }

        event!(Level::TRACE, count = self.grabbed.len(), "admitting requests");
        let mut grabbed = std::mem::take(&mut self.grabbed);
        for shared in grabbed.drain(..) {
            self.admit(shared);
        }
        self.grabbed = grabbed;
    }

    /// The engine asked for a timer earlier; when it fires, poke the engine
    /// so it can run its internal timeout handling.
    fn run_engine_timer(&mut self) {
        let Some(deadline) = self.engine_timer else {
            return;
        };
        if deadline > Instant::now() {
            return;
        }
        self.engine_timer = None;

        if let Err(error) = self.multi.timeout() {
            event!(Level::WARN, %error, "engine timeout action failed");
        }
        self.after_engine_call();
    }

    /// Pop every response-wait deadline that is due and complete its request
    /// with [`RequestStatus::ResponseWaitTimeout`]. The transfers stay
    /// registered with the engine; their eventual completion only releases
    /// resources.
    fn expire_response_waits(&mut self) {
        let now = Instant::now();
        while let Some((&(deadline, _), _)) = self.deadlines.first_key_value() {
            if deadline > now {
                break;
            }
            let Some((_, shared)) = self.deadlines.pop_first() else {
                break;
            };
            shared.lock().take_wait_key();
            event!(Level::DEBUG, "response wait expired");
            self.dispatch_on_complete(&shared, RequestStatus::ResponseWaitTimeout, Some(now));
        }
    }

    // ── Admission ───────────────────────────────────────────────────────

    fn admit(&mut self, shared: Arc<SharedRequest>) {
        let now = Instant::now();
        let (easy, wait) = {
            let mut request = shared.lock();
            request.set_start_time(now);
            if request.completion_status() == RequestStatus::FailedToStart {
                // Preparation already failed on the submitting thread.
                drop(request);
                self.complete(&shared, RequestStatus::FailedToStart, None);
                return;
            }
            (request.take_easy(), request.response_wait_time())
        };

        let Some(easy) = easy else {
            event!(Level::ERROR, "request submitted without an engine handle");
            self.complete(&shared, RequestStatus::FailedToStart, None);
            return;
        };

        let mut handle = match self.multi.add2(easy) {
            Ok(handle) => handle,
            Err(error) => {
                event!(Level::WARN, %error, "engine refused transfer");
                self.complete(&shared, RequestStatus::FailedToStart, None);
                return;
            }
        };

        let token = self.next_transfer_token;
        self.next_transfer_token += 1;
        if let Err(error) = handle.set_token(token) {
            event!(Level::ERROR, %error, "failed to tag transfer");
            match self.multi.remove2(handle) {
                Ok(easy) => shared.lock().restore_easy(easy),
                Err(error) => event!(Level::ERROR, %error, "failed to unregister transfer"),
            }
            self.complete(&shared, RequestStatus::FailedToStart, None);
            return;
        }

        if let Some(wait) = wait {
            if let Some(deadline) = now.checked_add(wait) {
                let key = (deadline, self.next_deadline_seq);
                self.next_deadline_seq += 1;
                shared.lock().set_wait_key(key);
                self.deadlines.insert(key, Arc::clone(&shared));
            }
        }

        event!(Level::DEBUG, token, "transfer registered");
        self.active.insert(token, ActiveTransfer { handle, shared });

        // Kick the engine once so the new transfer starts promptly.
        if let Err(error) = self.multi.timeout() {
            event!(Level::WARN, %error, "engine kick failed");
        }
        self.after_engine_call();
    }

    // ── Engine bookkeeping ──────────────────────────────────────────────

    /// Apply whatever the engine's callbacks recorded during the last call
    /// into it, then collect finished transfers.
    fn after_engine_call(&mut self) {
        self.apply_socket_updates();
        self.apply_timer_update();
        self.check_completions();
    }

    fn apply_socket_updates(&mut self) {
        loop {
            let updates = {
                let mut queue = self
                    .socket_updates
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if queue.is_empty() {
                    break;
                }
                std::mem::take(&mut *queue)
            };
            for update in updates {
                self.apply_socket_update(update);
            }
        }
    }

    fn apply_socket_update(&mut self, update: SocketUpdate) {
        let SocketUpdate {
            socket,
            events,
            token,
        } = update;

        if events.remove() {
            if token != 0 {
                self.sockets.remove(&token);
                if let Err(error) = self.poll.registry().deregister(&mut SourceFd(&socket)) {
                    event!(Level::TRACE, ?error, socket, "socket deregister failed");
                }
            }
            return;
        }

        let interest = match (events.input(), events.output()) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (false, true) => Interest::WRITABLE,
            _ => Interest::READABLE,
        };

        if token == 0 {
            // First time the engine mentions this socket.
            let token = self.next_socket_token;
            self.next_socket_token += 1;

            if let Err(error) =
                self.poll
                    .registry()
                    .register(&mut SourceFd(&socket), Token(token), interest)
            {
                event!(Level::ERROR, ?error, socket, "failed to register engine socket");
                return;
            }
            self.sockets.insert(token, socket);
            if let Err(error) = self.multi.assign(socket, token) {
                event!(Level::ERROR, %error, socket, "failed to tag engine socket");
            }
        } else if let Err(error) =
            self.poll
                .registry()
                .reregister(&mut SourceFd(&socket), Token(token), interest)
        {
            event!(Level::WARN, ?error, socket, "failed to update socket interest");
        }
    }

    fn apply_timer_update(&mut self) {
        let update = self
            .timer_update
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match update {
            Some(Some(timeout)) => self.engine_timer = Instant::now().checked_add(timeout),
            Some(None) => self.engine_timer = None,
            None => {}
        }
    }

    /// Drain the engine's completion stream and finish each transfer.
    fn check_completions(&mut self) {
        let mut finished: Vec<(usize, Result<(), curl::Error>)> = Vec::new();
        self.multi.messages(|message| {
            if let Some(result) = message.result() {
                match message.token() {
                    Ok(token) => finished.push((token, result)),
                    Err(error) => {
                        event!(Level::ERROR, %error, "completed transfer without a token")
                    }
                }
            }
        });

        for (token, result) in finished {
            let Some(ActiveTransfer { handle, shared }) = self.active.remove(&token) else {
                event!(Level::WARN, token, "completion for unknown transfer");
                continue;
            };

            let status = match self.multi.remove2(handle) {
                Ok(easy) => {
                    let cap_reached = easy.get_ref().cap_reached();
                    let status = match &result {
                        Ok(()) => RequestStatus::Success,
                        Err(error) => RequestStatus::from_engine(error, cap_reached),
                    };
                    shared.lock().restore_easy(easy);
                    status
                }
                Err(error) => {
                    event!(Level::ERROR, %error, "failed to unregister completed transfer");
                    RequestStatus::Error
                }
            };

            event!(Level::DEBUG, token, %status, "transfer complete");
            self.complete(&shared, status, None);
        }
    }

    // ── Completion ──────────────────────────────────────────────────────

    /// Finish a transfer that is no longer active in the engine.
    fn complete(
        &mut self,
        shared: &Arc<SharedRequest>,
        status: RequestStatus,
        finish_time: Option<Instant>,
    ) {
        self.dispatch_on_complete(shared, status, finish_time);
        self.shared.active.fetch_sub(1, Ordering::AcqRel);
    }

    /// The single completion entry point. Whichever source gets here first
    /// records the outcome and runs the user callback; a second entry only
    /// cleans up the deadline-set entry.
    fn dispatch_on_complete(
        &mut self,
        shared: &Arc<SharedRequest>,
        status: RequestStatus,
        finish_time: Option<Instant>,
    ) {
        let callback = if shared.claim_completion() {
            let mut request = shared.lock();
            request.record_completion(status, finish_time);
            request.take_on_complete()
        } else {
            None
        };

        // No locks are held while user code runs.
        if let Some(callback) = callback {
            callback(RequestHandle::from_shared(Arc::clone(shared)));
        }

        if let Some(key) = shared.lock().take_wait_key() {
            self.deadlines.remove(&key);
        }
    }
}
