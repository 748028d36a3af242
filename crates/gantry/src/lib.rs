#![deny(missing_docs)]

//! Pooled HTTP client with a multiplexed background event loop.
//!
//! gantry layers a reusable-request API over a multiplexed transfer engine.
//! Requests are produced from a [`RequestPool`], configured, and either
//! performed synchronously or handed to an [`EventLoop`], which drives any
//! number of in-flight transfers on a single background thread and invokes a
//! completion callback per request.
//!
//! Two timeout disciplines are layered per request: the *transport timeout*
//! bounds the transfer itself, while the optional *response wait time*
//! bounds how long the caller waits to be notified. When the wait time fires
//! first, the callback runs with [`RequestStatus::ResponseWaitTimeout`] and
//! the transfer keeps its connection until the transport timeout settles it;
//! the callback still runs exactly once.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! fn main() -> Result<(), anyhow::Error> {
//!     let event_loop = gantry::EventLoop::new()?;
//!
//!     let request = event_loop.request_pool().produce_with_callback(
//!         "http://example.org/",
//!         |handle| {
//!             let request = handle.request();
//!             println!("{}: {}", request.completion_status(), request.response_status_code());
//!         },
//!         Duration::from_secs(5),
//!     );
//!     event_loop.start_request(request);
//!
//!     while event_loop.has_unfinished_requests() {
//!         std::thread::sleep(Duration::from_millis(1));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Ownership
//!
//! A produced request is owned by a [`RequestHandle`], movable but not
//! clonable. Submitting moves the handle into the loop; the completion
//! callback receives a fresh handle; dropping the last handle resets the
//! request and parks it back on its pool's free-list, however many internal
//! references (deadline set, transfer engine) were still alive in between.

mod collector;
mod driver;
mod error;
mod event_loop;
mod headers;
mod http;
mod mime;
mod pool;
mod request;
mod shared;
mod status;

pub use self::error::RequestError;
pub use self::event_loop::EventLoop;
pub use self::headers::{Header, HeaderStore};
pub use self::http::{Method, Version};
pub use self::mime::MimeField;
pub use self::pool::RequestPool;
pub use self::request::{OnComplete, Request};
pub use self::shared::{RequestGuard, RequestHandle};
pub use self::status::RequestStatus;
