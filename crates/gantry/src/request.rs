//! The unit of work: one HTTP request and, after completion, its response.

use std::os::raw::c_long;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use curl::easy::{Easy2, Form, List};
use tracing::{event, Level};

use crate::collector::Collector;
use crate::error::RequestError;
use crate::headers::HeaderStore;
use crate::http::{Method, Version};
use crate::mime::MimeField;
use crate::shared::RequestHandle;
use crate::status::RequestStatus;

/// Callback invoked on the event-loop thread when an async request completes.
pub type OnComplete = Box<dyn FnOnce(RequestHandle) + Send + 'static>;

/// A single HTTP request produced by a [`RequestPool`](crate::RequestPool).
///
/// Setters are valid while the request is in [`RequestStatus::Building`];
/// once submitted to an [`EventLoop`](crate::EventLoop) they fail with
/// [`RequestError::InFlight`]. Response getters return their final values
/// after the completion callback has run.
pub struct Request {
    /// Engine handle. Absent only while the transfer is registered with the
    /// multiplexed engine on the event-loop thread.
    easy: Option<Easy2<Collector>>,

    url: String,
    request_headers: HeaderStore,
    headers_committed: bool,
    request_data: Vec<u8>,
    mime_fields: Vec<MimeField>,

    status: RequestStatus,
    response_headers: HeaderStore,
    response_data: Vec<u8>,
    http_status_code: u32,
    total_time: Option<Duration>,
    num_connects: u64,
    redirect_count: u64,

    start_time: Option<Instant>,
    response_wait_time: Option<Duration>,
    /// Position of this request in the event loop's deadline set, kept so
    /// removal on completion does not need a scan.
    wait_key: Option<(Instant, u64)>,

    on_complete: Option<OnComplete>,
}

impl Request {
    pub(crate) fn new() -> Self {
        let mut easy = Easy2::new(Collector::new());
        init_easy(&mut easy);

        Self {
            easy: Some(easy),
            url: String::new(),
            request_headers: HeaderStore::new(),
            headers_committed: false,
            request_data: Vec::new(),
            mime_fields: Vec::new(),
            status: RequestStatus::Building,
            response_headers: HeaderStore::new(),
            response_data: Vec::new(),
            http_status_code: 0,
            total_time: None,
            num_connects: 0,
            redirect_count: 0,
            start_time: None,
            response_wait_time: None,
            wait_key: None,
            on_complete: None,
        }
    }

    // ── Builder-state setters ───────────────────────────────────────────

    /// Set the URL for this request.
    pub fn set_url(&mut self, url: impl Into<String>) -> Result<(), RequestError> {
        self.ensure_building()?;
        let url = url.into();
        self.easy_mut()?.url(&url)?;
        self.url = url;
        Ok(())
    }

    /// Set the HTTP method. GET is the default.
    pub fn set_method(&mut self, method: Method) -> Result<(), RequestError> {
        self.ensure_building()?;
        method.apply(self.easy_mut()?)?;
        Ok(())
    }

    /// Set the HTTP version preference.
    pub fn set_version(&mut self, version: Version) -> Result<(), RequestError> {
        self.ensure_building()?;
        version.apply(self.easy_mut()?)?;
        Ok(())
    }

    /// Set the transport timeout, the maximum wall time the transfer engine
    /// enforces for the whole transfer. Zero means no timeout.
    ///
    /// When a response wait time is also set, this should be the longer of
    /// the two; it keeps the connection alive after the caller has already
    /// been notified.
    pub fn set_transport_timeout(&mut self, timeout: Duration) -> Result<(), RequestError> {
        self.ensure_building()?;
        if timeout > Duration::ZERO {
            self.easy_mut()?.timeout(timeout)?;
        }
        Ok(())
    }

    /// Set the response wait time. After it elapses the completion callback
    /// runs with [`RequestStatus::ResponseWaitTimeout`] even though the
    /// engine keeps the transfer going until the transport timeout.
    pub fn set_response_wait_time(&mut self, wait: Duration) -> Result<(), RequestError> {
        self.ensure_building()?;
        self.response_wait_time = Some(wait);
        Ok(())
    }

    /// The configured response wait time, if any.
    pub fn response_wait_time(&self) -> Option<Duration> {
        self.response_wait_time
    }

    /// Cap the number of response body bytes written. `-1` (the default)
    /// downloads everything.
    ///
    /// The transfer may receive more than the cap from the wire, but the
    /// response data never exceeds it; reaching the cap aborts the transfer
    /// and still counts as a success.
    pub fn set_max_download_bytes(&mut self, max: i64) -> Result<(), RequestError> {
        self.ensure_building()?;
        self.easy_mut()?.get_mut().set_max_download_bytes(max);
        Ok(())
    }

    /// The configured download cap, `-1` when unbounded.
    pub fn max_download_bytes(&self) -> i64 {
        self.easy
            .as_ref()
            .map(|easy| easy.get_ref().max_download_bytes())
            .unwrap_or(-1)
    }

    /// Configure redirect following. Following is on by default.
    /// `max_redirects` of `None` allows an unlimited chain.
    pub fn set_follow_redirects(
        &mut self,
        follow: bool,
        max_redirects: Option<u32>,
    ) -> Result<(), RequestError> {
        self.ensure_building()?;
        let easy = self.easy_mut()?;
        easy.follow_location(follow)?;
        if let Some(max) = max_redirects {
            easy.max_redirections(max)?;
        }
        Ok(())
    }

    /// Require (or not) verification of the peer's SSL certificate.
    pub fn set_verify_ssl_peer(&mut self, verify: bool) -> Result<(), RequestError> {
        self.ensure_building()?;
        self.easy_mut()?.ssl_verify_peer(verify)?;
        Ok(())
    }

    /// Require (or not) verification of the certificate's host name.
    pub fn set_verify_ssl_host(&mut self, verify: bool) -> Result<(), RequestError> {
        self.ensure_building()?;
        self.easy_mut()?.ssl_verify_host(verify)?;
        Ok(())
    }

    /// Ask the engine to send an `Accept-Encoding` header listing every
    /// encoding it supports. Mutually exclusive with adding your own
    /// `Accept-Encoding` header.
    pub fn set_accept_all_encoding(&mut self) -> Result<(), RequestError> {
        self.ensure_building()?;
        self.easy_mut()?.accept_encoding("")?;
        Ok(())
    }

    /// Append a request header. Duplicates are allowed and user order is
    /// preserved. An empty value serialises as `name:` with no value, which
    /// suppresses a header the engine would otherwise add on its own.
    pub fn add_header(&mut self, name: &str, value: &str) -> Result<(), RequestError> {
        self.ensure_building()?;
        // Another commit pass is needed before the next perform.
        self.headers_committed = false;
        self.request_headers.push_field(name, value);
        Ok(())
    }

    /// The request headers added so far.
    pub fn request_headers(&self) -> &HeaderStore {
        &self.request_headers
    }

    /// Set the raw request body and switch the request to POST.
    ///
    /// Mutually exclusive with multipart fields; the body is owned by the
    /// request for the lifetime of the transfer.
    pub fn set_request_data(&mut self, data: impl Into<Vec<u8>>) -> Result<(), RequestError> {
        self.ensure_building()?;
        if !self.mime_fields.is_empty() {
            return Err(RequestError::DataAfterMime);
        }
        let data = data.into();
        if data.is_empty() {
            return Ok(());
        }
        self.easy_mut()?.post_fields_copy(&data)?;
        self.request_data = data;
        Ok(())
    }

    /// The raw request body, empty if never set.
    pub fn request_data(&self) -> &[u8] {
        &self.request_data
    }

    /// Add an inline multipart form field. Mutually exclusive with raw body
    /// data.
    pub fn add_mime_field(&mut self, name: &str, value: &str) -> Result<(), RequestError> {
        self.ensure_building()?;
        if !self.request_data.is_empty() {
            return Err(RequestError::MimeAfterData);
        }
        self.mime_fields.push(MimeField::Value {
            name: name.to_owned(),
            value: value.to_owned(),
        });
        Ok(())
    }

    /// Add a file-backed multipart form field. The file contents are
    /// streamed when the transfer runs, but the path must exist now.
    pub fn add_mime_file_field(
        &mut self,
        name: &str,
        path: impl Into<PathBuf>,
    ) -> Result<(), RequestError> {
        self.ensure_building()?;
        if !self.request_data.is_empty() {
            return Err(RequestError::MimeAfterData);
        }
        let path = path.into();
        if !path.exists() {
            return Err(RequestError::MimeFileMissing(path));
        }
        self.mime_fields.push(MimeField::File {
            name: name.to_owned(),
            path,
        });
        Ok(())
    }

    /// Replace the completion callback.
    pub fn set_on_complete(
        &mut self,
        on_complete: impl FnOnce(RequestHandle) + Send + 'static,
    ) -> Result<(), RequestError> {
        self.ensure_building()?;
        self.on_complete = Some(Box::new(on_complete));
        Ok(())
    }

    // ── Execution ───────────────────────────────────────────────────────

    /// Perform the request synchronously, blocking the calling thread.
    ///
    /// Transport failures are reported through the returned status, not as
    /// an error.
    pub fn perform(&mut self) -> Result<RequestStatus, RequestError> {
        self.prepare_for_perform()?;
        let result = {
            let easy = self.easy.as_mut().ok_or(RequestError::InFlight)?;
            easy.perform()
        };
        let status = match result {
            Ok(()) => RequestStatus::Success,
            Err(error) => RequestStatus::from_engine(&error, self.cap_reached()),
        };
        self.record_completion(status, None);
        Ok(self.status)
    }

    // ── Response getters ────────────────────────────────────────────────

    /// The currently set URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The completion status. Distinct from the HTTP status code.
    pub fn completion_status(&self) -> RequestStatus {
        self.status
    }

    /// The HTTP response status code, `0` until a response status line has
    /// been received.
    pub fn response_status_code(&self) -> u32 {
        self.http_status_code
    }

    /// The response headers, in the order they were received.
    pub fn response_headers(&self) -> &HeaderStore {
        &self.response_headers
    }

    /// The response body.
    pub fn response_data(&self) -> &[u8] {
        &self.response_data
    }

    /// Total wall time the request took, present once it has finished.
    pub fn total_time(&self) -> Option<Duration> {
        self.total_time
    }

    /// Number of connections the engine opened for this request.
    pub fn num_connects(&self) -> u64 {
        self.num_connects
    }

    /// Number of redirects that were actually followed.
    pub fn redirect_count(&self) -> u64 {
        self.redirect_count
    }

    // ── Reuse ───────────────────────────────────────────────────────────

    /// Clear everything so the request can be reused from scratch.
    pub fn reset(&mut self) {
        self.url.clear();
        self.request_headers.clear();
        self.headers_committed = false;
        // Replace rather than clear, releasing a large body's allocation.
        self.request_data = Vec::new();
        self.mime_fields.clear();

        self.status = RequestStatus::Building;
        self.response_headers.clear();
        self.response_data = Vec::new();
        self.http_status_code = 0;
        self.total_time = None;
        self.num_connects = 0;
        self.redirect_count = 0;

        self.start_time = None;
        self.response_wait_time = None;
        self.wait_key = None;
        self.on_complete = None;

        match self.easy.as_mut() {
            Some(easy) => {
                easy.reset();
                easy.get_mut().reset();
                init_easy(easy);
            }
            None => {
                // The engine kept the handle when registration failed; start
                // over with a fresh one.
                let mut easy = Easy2::new(Collector::new());
                init_easy(&mut easy);
                self.easy = Some(easy);
            }
        }
    }

    // ── Event-loop plumbing ─────────────────────────────────────────────

    /// Commit headers and body into the engine handle and mark the request
    /// as executing. Called once per submission, before the event loop (or a
    /// blocking perform) takes over.
    pub(crate) fn prepare_for_perform(&mut self) -> Result<(), RequestError> {
        self.clear_response_state();

        let easy = self.easy.as_mut().ok_or(RequestError::InFlight)?;
        easy.get_mut().clear();

        if !self.headers_committed && !self.request_headers.is_empty() {
            let mut list = List::new();
            for header in self.request_headers.iter() {
                list.append(header.raw())?;
            }
            easy.http_headers(list)?;
            self.headers_committed = true;
        }

        if !self.mime_fields.is_empty() {
            let mut form = Form::new();
            for field in &self.mime_fields {
                field.append_to(&mut form)?;
            }
            easy.httppost(form)?;
        }

        self.status = RequestStatus::Executing;
        Ok(())
    }

    /// Stamp the final status and capture timing and response data.
    ///
    /// With a `finish_time` the request timed out waiting for its response,
    /// so the elapsed time is measured from submission; otherwise the engine
    /// is asked for the transfer's own timing and the response buffers are
    /// moved out of it.
    pub(crate) fn record_completion(&mut self, status: RequestStatus, finish_time: Option<Instant>) {
        self.status = status;
        match finish_time {
            Some(now) => {
                if let Some(start) = self.start_time {
                    self.total_time = Some(now.saturating_duration_since(start));
                }
            }
            None => self.snapshot_engine_info(),
        }
    }

    fn snapshot_engine_info(&mut self) {
        let Some(easy) = self.easy.as_mut() else {
            return;
        };
        self.total_time = easy.total_time().ok();
        self.http_status_code = easy.response_code().unwrap_or(0);
        self.redirect_count = u64::from(easy.redirect_count().unwrap_or(0));
        self.num_connects = num_connects_raw(easy);
        let (headers, data) = easy.get_mut().take_response();
        self.response_headers = headers;
        self.response_data = data;
    }

    fn clear_response_state(&mut self) {
        self.response_headers.clear();
        self.response_data = Vec::new();
        self.http_status_code = 0;
        self.total_time = None;
        self.num_connects = 0;
        self.redirect_count = 0;
    }

    pub(crate) fn set_status(&mut self, status: RequestStatus) {
        self.status = status;
    }

    pub(crate) fn set_start_time(&mut self, start: Instant) {
        self.start_time = Some(start);
    }

    pub(crate) fn set_wait_key(&mut self, key: (Instant, u64)) {
        self.wait_key = Some(key);
    }

    pub(crate) fn take_wait_key(&mut self) -> Option<(Instant, u64)> {
        self.wait_key.take()
    }

    pub(crate) fn take_easy(&mut self) -> Option<Easy2<Collector>> {
        self.easy.take()
    }

    pub(crate) fn restore_easy(&mut self, easy: Easy2<Collector>) {
        self.easy = Some(easy);
    }

    pub(crate) fn take_on_complete(&mut self) -> Option<OnComplete> {
        self.on_complete.take()
    }

    pub(crate) fn set_on_complete_boxed(&mut self, on_complete: OnComplete) {
        self.on_complete = Some(on_complete);
    }

    fn cap_reached(&self) -> bool {
        self.easy
            .as_ref()
            .map(|easy| easy.get_ref().cap_reached())
            .unwrap_or(false)
    }

    fn ensure_building(&self) -> Result<(), RequestError> {
        if self.status == RequestStatus::Building {
            Ok(())
        } else {
            Err(RequestError::InFlight)
        }
    }

    fn easy_mut(&mut self) -> Result<&mut Easy2<Collector>, RequestError> {
        self.easy.as_mut().ok_or(RequestError::InFlight)
    }
}

/// Options applied to every fresh or reset engine handle.
fn init_easy(easy: &mut Easy2<Collector>) {
    // Handles run on a background thread, so engine-installed signal
    // handlers must stay off.
    if let Err(error) = easy.signal(false) {
        event!(Level::WARN, %error, "failed to disable engine signals");
    }
    // Redirects are followed by default.
    if let Err(error) = easy.follow_location(true) {
        event!(Level::WARN, %error, "failed to enable redirect following");
    }
}

/// The safe engine bindings do not expose the connection count, so read it
/// through the raw info interface.
fn num_connects_raw(easy: &Easy2<Collector>) -> u64 {
    let mut count: c_long = 0;
    let code = unsafe {
        curl_sys::curl_easy_getinfo(
            easy.raw(),
            curl_sys::CURLINFO_NUM_CONNECTS,
            &mut count as *mut c_long,
        )
    };
    if code == curl_sys::CURLE_OK && count >= 0 {
        count as u64
    } else {
        0
    }
}
