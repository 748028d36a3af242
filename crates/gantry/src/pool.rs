//! Free-list of idle requests.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{event, Level};

use crate::request::{OnComplete, Request};
use crate::shared::RequestHandle;

/// Thread-safe pool of reusable [`Request`]s.
///
/// Producing from the pool pops an idle request if one is available and
/// builds a new one otherwise; dropping the last handle to a request resets
/// it and parks it back on the free-list. Cloning the pool clones a cheap
/// handle to the same free-list.
#[derive(Clone, Default)]
pub struct RequestPool {
    inner: Arc<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    idle: Mutex<Vec<Request>>,
}

impl RequestPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-allocate `count` idle requests, paying engine-handle construction
    /// up front instead of on first use.
    pub fn reserve(&self, count: usize) {
        let mut requests = Vec::with_capacity(count);
        for _ in 0..count {
            requests.push(Request::new());
        }
        self.idle().extend(requests);
    }

    /// Produce a request for `url` with no timeout. Best suited for blocking
    /// [`perform`](Request::perform) use.
    pub fn produce(&self, url: &str) -> RequestHandle {
        self.produce_inner(url, None, None, None)
    }

    /// Produce a request for `url` with a transport timeout.
    pub fn produce_with_timeout(&self, url: &str, transport_timeout: Duration) -> RequestHandle {
        self.produce_inner(url, None, Some(transport_timeout), None)
    }

    /// Produce a request ready for async submission: completion callback
    /// plus transport timeout.
    pub fn produce_with_callback(
        &self,
        url: &str,
        on_complete: impl FnOnce(RequestHandle) + Send + 'static,
        transport_timeout: Duration,
    ) -> RequestHandle {
        self.produce_inner(url, Some(Box::new(on_complete)), Some(transport_timeout), None)
    }

    /// Produce a request with both timeout disciplines: the transport
    /// timeout bounds the transfer itself, the response wait time bounds how
    /// long the caller waits to be notified.
    pub fn produce_with_response_wait(
        &self,
        url: &str,
        on_complete: impl FnOnce(RequestHandle) + Send + 'static,
        transport_timeout: Duration,
        response_wait_time: Duration,
    ) -> RequestHandle {
        self.produce_inner(
            url,
            Some(Box::new(on_complete)),
            Some(transport_timeout),
            Some(response_wait_time),
        )
    }

    /// Number of requests currently parked on the free-list.
    pub fn idle_count(&self) -> usize {
        self.idle().len()
    }

    fn produce_inner(
        &self,
        url: &str,
        on_complete: Option<OnComplete>,
        transport_timeout: Option<Duration>,
        response_wait_time: Option<Duration>,
    ) -> RequestHandle {
        let popped = self.idle().pop();
        let reused = popped.is_some();
        let mut request = popped.unwrap_or_else(Request::new);
        event!(Level::TRACE, reused, "producing request");

        // A malformed URL is not reported here; the transfer fails when it
        // actually starts.
        if let Err(error) = request.set_url(url) {
            event!(Level::WARN, %error, url, "failed to apply url");
        }
        if let Some(on_complete) = on_complete {
            request.set_on_complete_boxed(on_complete);
        }
        if let Some(timeout) = transport_timeout {
            if let Err(error) = request.set_transport_timeout(timeout) {
                event!(Level::WARN, %error, "failed to apply transport timeout");
            }
        }
        if let Some(wait) = response_wait_time {
            if let Err(error) = request.set_response_wait_time(wait) {
                event!(Level::WARN, %error, "failed to apply response wait time");
            }
        }

        RequestHandle::new(self.clone(), request)
    }

    /// Reset a finished request and park it for reuse. Called from the
    /// shared owner's final drop.
    pub(crate) fn recycle(&self, mut request: Request) {
        request.reset();
        self.idle().push(request);
    }

    fn idle(&self) -> MutexGuard<'_, Vec<Request>> {
        self.inner.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
