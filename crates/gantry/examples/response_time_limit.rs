//! Demonstrates the two timeout disciplines: a short response wait time
//! notifies the caller quickly while a longer transport timeout keeps the
//! connection alive in the background.
//!
//! Usage: `response_time_limit <url> <wait_ms> <transport_ms> <count>`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context as _, Error};
use gantry::{EventLoop, RequestStatus};
use tracing::{event, Level};
use tracing_subscriber::FmtSubscriber;

fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter("info")
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber).unwrap();
}

fn main() -> Result<(), Error> {
    init_logging();

    let usage = "usage: response_time_limit <url> <wait_ms> <transport_ms> <count>";
    let mut args = std::env::args().skip(1);
    let url = args.next().context(usage)?;
    let wait_ms: u64 = args.next().context(usage)?.parse()?;
    let transport_ms: u64 = args.next().context(usage)?.parse()?;
    let count: u64 = args.next().context(usage)?.parse()?;

    let responses = Arc::new(AtomicU64::new(0));
    let timeouts = Arc::new(AtomicU64::new(0));

    let event_loop = EventLoop::new()?;
    event!(Level::INFO, %url, wait_ms, transport_ms, count, "starting");

    for _ in 0..count {
        let responses = Arc::clone(&responses);
        let timeouts = Arc::clone(&timeouts);
        let request = event_loop.request_pool().produce_with_response_wait(
            &url,
            move |handle| {
                let request = handle.request();
                match request.completion_status() {
                    RequestStatus::Success => {
                        responses.fetch_add(1, Ordering::Relaxed);
                        event!(
                            Level::INFO,
                            total_ms = request.total_time().unwrap_or_default().as_millis() as u64,
                            code = request.response_status_code(),
                            "response received"
                        );
                    }
                    status => {
                        timeouts.fetch_add(1, Ordering::Relaxed);
                        event!(Level::INFO, %status, "no response in time");
                    }
                }
            },
            Duration::from_millis(transport_ms),
            Duration::from_millis(wait_ms),
        );
        event_loop.start_request(request);
    }

    while event_loop.has_unfinished_requests() {
        thread::sleep(Duration::from_millis(1));
    }

    event!(
        Level::INFO,
        responses = responses.load(Ordering::Relaxed),
        timeouts = timeouts.load(Ordering::Relaxed),
        "done"
    );
    Ok(())
}
