//! Fire a batch of async requests at one URL and tally the outcomes.
//!
//! Usage: `async_bulk <url> <count>`

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

    let mut args = std::env::args().skip(1);
    let url = args.next().context("usage: async_bulk <url> <count>")?;
    let count: u64 = args
        .next()
        .context("usage: async_bulk <url> <count>")?
        .parse()
        .context("count must be a number")?;

    let successes = Arc::new(AtomicU64::new(0));
    let failures = Arc::new(AtomicU64::new(0));

    let event_loop = EventLoop::new()?;
    event!(Level::INFO, %url, count, "starting requests");

    for _ in 0..count {
        let successes = Arc::clone(&successes);
        let failures = Arc::clone(&failures);
        let request = event_loop.request_pool().produce_with_callback(
            &url,
            move |handle| {
                let request = handle.request();
                if request.completion_status() == RequestStatus::Success {
                    successes.fetch_add(1, Ordering::Relaxed);
                } else {
                    event!(
                        Level::WARN,
                        status = %request.completion_status(),
                        "request failed"
                    );
                    failures.fetch_add(1, Ordering::Relaxed);
                }
            },
            Duration::from_secs(10),
        );
        event_loop.start_request(request);
    }

    while event_loop.has_unfinished_requests() {
        thread::sleep(Duration::from_millis(1));
    }

    event!(
        Level::INFO,
        successes = successes.load(Ordering::Relaxed),
        failures = failures.load(Ordering::Relaxed),
        "done"
    );
    Ok(())
}
