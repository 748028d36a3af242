mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Error;
use gantry::{EventLoop, RequestStatus};
use tracing_test::traced_test;

use crate::support::{ResponseSpec, TestServer};

/// Wait until the loop has no queued or in-flight requests, panicking if it
/// takes longer than `limit`.
fn wait_for_quiescence(event_loop: &EventLoop, limit: Duration) {
    let deadline = Instant::now() + limit;
    while event_loop.has_unfinished_requests() {
        assert!(Instant::now() < deadline, "event loop did not quiesce");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
#[traced_test]
fn hundred_async_gets() -> Result<(), Error> {
    const COUNT: usize = 100;

    let server = TestServer::start(ResponseSpec::default())?;
    let event_loop = EventLoop::new()?;
    assert!(event_loop.is_running());

    let callbacks = Arc::new(AtomicUsize::new(0));
    let successes = Arc::new(AtomicUsize::new(0));

    for _ in 0..COUNT {
        let callbacks = Arc::clone(&callbacks);
        let successes = Arc::clone(&successes);
        let handle = event_loop.request_pool().produce_with_callback(
            &server.url(),
            move |handle| {
                callbacks.fetch_add(1, Ordering::SeqCst);
                let request = handle.request();
                if request.completion_status() == RequestStatus::Success
                    && request.response_status_code() == 200
                {
                    successes.fetch_add(1, Ordering::SeqCst);
                }
            },
            Duration::from_secs(1),
        );
        assert!(event_loop.start_request(handle));
    }

    wait_for_quiescence(&event_loop, Duration::from_secs(10));
    assert_eq!(callbacks.load(Ordering::SeqCst), COUNT);
    assert_eq!(successes.load(Ordering::SeqCst), COUNT);
    Ok(())
}

#[test]
#[traced_test]
fn response_wait_timeout_fires_exactly_once() -> Result<(), Error> {
    let server = TestServer::start(ResponseSpec {
        delay: Duration::from_millis(500),
        ..ResponseSpec::default()
    })?;
    let event_loop = EventLoop::new()?;

    let callbacks = Arc::new(AtomicUsize::new(0));
    let outcome: Arc<Mutex<Option<(RequestStatus, Option<Duration>)>>> =
        Arc::new(Mutex::new(None));

    let handle = event_loop.request_pool().produce_with_response_wait(
        &server.url(),
        {
            let callbacks = Arc::clone(&callbacks);
            let outcome = Arc::clone(&outcome);
            move |handle| {
                callbacks.fetch_add(1, Ordering::SeqCst);
                let request = handle.request();
                *outcome.lock().unwrap() =
                    Some((request.completion_status(), request.total_time()));
            }
        },
        Duration::from_millis(2000),
        Duration::from_millis(50),
    );
    assert!(event_loop.start_request(handle));

    // Quiescence waits out the transport side as well; the server answers
    // after 500 ms and that completion must stay silent.
    wait_for_quiescence(&event_loop, Duration::from_secs(10));
    thread::sleep(Duration::from_millis(100));

    assert_eq!(callbacks.load(Ordering::SeqCst), 1);
    let (status, total_time) = outcome.lock().unwrap().expect("callback ran");
    assert_eq!(status, RequestStatus::ResponseWaitTimeout);
    let total_time = total_time.expect("total time recorded");
    assert!(total_time >= Duration::from_millis(50), "{total_time:?}");
    assert!(total_time < Duration::from_millis(450), "{total_time:?}");
    Ok(())
}

#[test]
#[traced_test]
fn many_response_waits_each_fire_once() -> Result<(), Error> {
    const COUNT: usize = 5;

    let server = TestServer::start(ResponseSpec {
        delay: Duration::from_millis(500),
        ..ResponseSpec::default()
    })?;
    let event_loop = EventLoop::new()?;

    let callbacks = Arc::new(AtomicUsize::new(0));
    let wait_timeouts = Arc::new(AtomicUsize::new(0));

    for _ in 0..COUNT {
        let callbacks = Arc::clone(&callbacks);
        let wait_timeouts = Arc::clone(&wait_timeouts);
        let handle = event_loop.request_pool().produce_with_response_wait(
            &server.url(),
            move |handle| {
                callbacks.fetch_add(1, Ordering::SeqCst);
                if handle.request().completion_status() == RequestStatus::ResponseWaitTimeout {
                    wait_timeouts.fetch_add(1, Ordering::SeqCst);
                }
            },
            Duration::from_millis(2000),
            Duration::from_millis(50),
        );
        assert!(event_loop.start_request(handle));
    }

    wait_for_quiescence(&event_loop, Duration::from_secs(10));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(callbacks.load(Ordering::SeqCst), COUNT);
    assert_eq!(wait_timeouts.load(Ordering::SeqCst), COUNT);
    Ok(())
}

#[test]
#[traced_test]
fn async_post_sends_body() -> Result<(), Error> {
    let server = TestServer::start(ResponseSpec::default())?;
    let event_loop = EventLoop::new()?;

    let outcome: Arc<Mutex<Option<(RequestStatus, u32)>>> = Arc::new(Mutex::new(None));
    let handle = event_loop.request_pool().produce_with_callback(
        &server.url(),
        {
            let outcome = Arc::clone(&outcome);
            move |handle| {
                let request = handle.request();
                *outcome.lock().unwrap() =
                    Some((request.completion_status(), request.response_status_code()));
            }
        },
        Duration::from_secs(2),
    );
    {
        let mut request = handle.request();
        request.set_method(gantry::Method::Post)?;
        request.set_request_data("name=value")?;
        request.add_header("Content-Type", "application/x-www-form-urlencoded")?;
        assert_eq!(request.request_data(), b"name=value");
    }
    assert!(event_loop.start_request(handle));

    wait_for_quiescence(&event_loop, Duration::from_secs(10));
    let (status, code) = outcome.lock().unwrap().expect("callback ran");
    assert_eq!(status, RequestStatus::Success);
    assert_eq!(code, 200);
    Ok(())
}

#[test]
#[traced_test]
fn download_cap_truncates_and_succeeds() -> Result<(), Error> {
    let server = TestServer::start(ResponseSpec {
        body: vec![b'x'; 10_000],
        ..ResponseSpec::default()
    })?;
    let event_loop = EventLoop::new()?;

    let callbacks = Arc::new(AtomicUsize::new(0));
    let outcome: Arc<Mutex<Option<(RequestStatus, usize)>>> = Arc::new(Mutex::new(None));

    let handle = event_loop.request_pool().produce_with_callback(
        &server.url(),
        {
            let callbacks = Arc::clone(&callbacks);
            let outcome = Arc::clone(&outcome);
            move |handle| {
                callbacks.fetch_add(1, Ordering::SeqCst);
                let request = handle.request();
                *outcome.lock().unwrap() =
                    Some((request.completion_status(), request.response_data().len()));
            }
        },
        Duration::from_secs(2),
    );
    handle.request().set_max_download_bytes(100)?;
    assert!(event_loop.start_request(handle));

    wait_for_quiescence(&event_loop, Duration::from_secs(10));
    assert_eq!(callbacks.load(Ordering::SeqCst), 1);
    let (status, length) = outcome.lock().unwrap().expect("callback ran");
    assert_eq!(status, RequestStatus::Success);
    assert_eq!(length, 100);
    Ok(())
}

#[test]
#[traced_test]
fn empty_response_is_reported() -> Result<(), Error> {
    let server = TestServer::start(ResponseSpec {
        drop_connection: true,
        ..ResponseSpec::default()
    })?;
    let event_loop = EventLoop::new()?;

    let outcome: Arc<Mutex<Option<RequestStatus>>> = Arc::new(Mutex::new(None));
    let handle = event_loop.request_pool().produce_with_callback(
        &server.url(),
        {
            let outcome = Arc::clone(&outcome);
            move |handle| {
                *outcome.lock().unwrap() = Some(handle.request().completion_status());
            }
        },
        Duration::from_secs(2),
    );
    assert!(event_loop.start_request(handle));

    wait_for_quiescence(&event_loop, Duration::from_secs(10));
    assert_eq!(
        outcome.lock().unwrap().take(),
        Some(RequestStatus::ResponseEmpty)
    );
    Ok(())
}

#[test]
#[traced_test]
fn connection_refused_is_reported() -> Result<(), Error> {
    // Grab a port with no listener behind it.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?.port()
    };
    let event_loop = EventLoop::new()?;

    let outcome: Arc<Mutex<Option<RequestStatus>>> = Arc::new(Mutex::new(None));
    let handle = event_loop.request_pool().produce_with_callback(
        &format!("http://127.0.0.1:{port}/"),
        {
            let outcome = Arc::clone(&outcome);
            move |handle| {
                *outcome.lock().unwrap() = Some(handle.request().completion_status());
            }
        },
        Duration::from_secs(2),
    );
    assert!(event_loop.start_request(handle));

    wait_for_quiescence(&event_loop, Duration::from_secs(10));
    assert_eq!(
        outcome.lock().unwrap().take(),
        Some(RequestStatus::ConnectError)
    );
    Ok(())
}

#[test]
#[traced_test]
fn stopped_loop_refuses_new_requests() -> Result<(), Error> {
    let event_loop = EventLoop::new()?;
    event_loop.stop();

    let callbacks = Arc::new(AtomicUsize::new(0));
    let handle = event_loop.request_pool().produce_with_callback(
        "http://localhost/",
        {
            let callbacks = Arc::clone(&callbacks);
            move |_handle| {
                callbacks.fetch_add(1, Ordering::SeqCst);
            }
        },
        Duration::from_secs(1),
    );

    assert!(!event_loop.start_request(handle));
    assert!(!event_loop.has_unfinished_requests());
    thread::sleep(Duration::from_millis(50));
    assert_eq!(callbacks.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
#[traced_test]
fn completed_requests_return_to_the_loop_pool() -> Result<(), Error> {
    let server = TestServer::start(ResponseSpec::default())?;
    let event_loop = EventLoop::new()?;

    let handle = event_loop.request_pool().produce_with_callback(
        &server.url(),
        |_handle| {},
        Duration::from_secs(1),
    );
    assert!(event_loop.start_request(handle));

    wait_for_quiescence(&event_loop, Duration::from_secs(10));
    // The callback handle has been dropped by now, so the request is idle
    // again once the loop releases its references.
    let deadline = Instant::now() + Duration::from_secs(2);
    while event_loop.request_pool().idle_count() == 0 {
        assert!(Instant::now() < deadline, "request never returned to pool");
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(event_loop.request_pool().idle_count(), 1);
    Ok(())
}
