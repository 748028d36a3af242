//! Shared ownership of pooled requests.
//!
//! While a request is in flight it can be referenced by the transfer engine,
//! by the event loop's deadline set, and by user code inside the completion
//! callback, all at the same time. [`SharedRequest`] is the reference-counted
//! owner that outlives all of them; its final drop is the single place a
//! request returns to its pool.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::pool::RequestPool;
use crate::request::Request;

pub(crate) struct SharedRequest {
    pool: RequestPool,
    request: Mutex<Option<Request>>,
    /// Set by whichever completion source gets there first; the loser's
    /// dispatch is a no-op.
    on_complete_fired: AtomicBool,
}

impl SharedRequest {
    pub(crate) fn new(pool: RequestPool, request: Request) -> Self {
        Self {
            pool,
            request: Mutex::new(Some(request)),
            on_complete_fired: AtomicBool::new(false),
        }
    }

    pub(crate) fn lock(&self) -> RequestGuard<'_> {
        RequestGuard {
            guard: self.request.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Returns true for exactly one caller per submission.
    pub(crate) fn claim_completion(&self) -> bool {
        !self.on_complete_fired.swap(true, Ordering::AcqRel)
    }
}

impl Drop for SharedRequest {
    fn drop(&mut self) {
        // The reference count is zero here, so nothing can be holding the
        // lock and the request goes back to the pool for reuse.
        let request = self
            .request
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(request) = request {
            self.pool.recycle(request);
        }
    }
}

/// Locked view of a [`Request`], dereferencing to it mutably.
///
/// Held briefly; user code should not keep a guard alive across blocking
/// calls.
pub struct RequestGuard<'a> {
    guard: MutexGuard<'a, Option<Request>>,
}

impl Deref for RequestGuard<'_> {
    type Target = Request;

    fn deref(&self) -> &Request {
        self.guard
            .as_ref()
            .expect("request reclaimed while a handle still exists")
    }
}

impl DerefMut for RequestGuard<'_> {
    fn deref_mut(&mut self) -> &mut Request {
        self.guard
            .as_mut()
            .expect("request reclaimed while a handle still exists")
    }
}

/// Owning token for a pooled request.
///
/// Movable but not clonable: a request has exactly one user-side holder at a
/// time, first the code that built it, then the event loop, then the
/// completion callback. Dropping the last handle returns the request to its
/// pool.
pub struct RequestHandle {
    shared: Arc<SharedRequest>,
}

impl RequestHandle {
    pub(crate) fn new(pool: RequestPool, request: Request) -> Self {
        Self {
            shared: Arc::new(SharedRequest::new(pool, request)),
        }
    }

    pub(crate) fn from_shared(shared: Arc<SharedRequest>) -> Self {
        Self { shared }
    }

    pub(crate) fn into_shared(self) -> Arc<SharedRequest> {
        self.shared
    }

    /// Lock and access the underlying request.
    pub fn request(&self) -> RequestGuard<'_> {
        self.shared.lock()
    }
}
