mod support;

use anyhow::Error;
use gantry::{RequestError, RequestPool, RequestStatus};
use tracing_test::traced_test;

use crate::support::{ResponseSpec, TestServer};

#[test]
#[traced_test]
fn raw_data_then_mime_field_is_rejected() -> Result<(), Error> {
    let pool = RequestPool::new();
    let handle = pool.produce("http://localhost/");
    let mut request = handle.request();

    request.set_request_data("x")?;
    let error = request
        .add_mime_field("field", "value")
        .expect_err("mime field after raw data must fail");
    assert!(matches!(error, RequestError::MimeAfterData));

    // The raw data is untouched by the failed call.
    assert_eq!(request.request_data(), b"x");
    Ok(())
}

#[test]
#[traced_test]
fn mime_field_then_raw_data_is_rejected() -> Result<(), Error> {
    let pool = RequestPool::new();
    let handle = pool.produce("http://localhost/");
    let mut request = handle.request();

    request.add_mime_field("field", "value")?;
    let error = request
        .set_request_data("x")
        .expect_err("raw data after mime field must fail");
    assert!(matches!(error, RequestError::DataAfterMime));
    assert!(request.request_data().is_empty());
    Ok(())
}

#[test]
#[traced_test]
fn mime_file_field_requires_existing_path() {
    let pool = RequestPool::new();
    let handle = pool.produce("http://localhost/");
    let mut request = handle.request();

    let error = request
        .add_mime_file_field("upload", "/definitely/not/a/real/path")
        .expect_err("missing file must be rejected");
    assert!(matches!(error, RequestError::MimeFileMissing(_)));
}

#[test]
#[traced_test]
fn headers_keep_order_and_duplicates() -> Result<(), Error> {
    let pool = RequestPool::new();
    let handle = pool.produce("http://localhost/");
    let mut request = handle.request();

    request.add_header("Accept", "text/html")?;
    request.add_header("X-Tag", "1")?;
    request.add_header("X-Tag", "2")?;
    request.add_header("Expect", "")?;

    let lines: Vec<String> = request
        .request_headers()
        .iter()
        .map(|header| header.raw().to_owned())
        .collect();
    assert_eq!(
        lines,
        vec!["Accept: text/html", "X-Tag: 1", "X-Tag: 2", "Expect:"]
    );

    let expect = request.request_headers().iter().last().expect("has headers");
    assert_eq!(expect.name(), "Expect");
    assert_eq!(expect.value(), "");
    Ok(())
}

#[test]
#[traced_test]
fn synchronous_get() -> Result<(), Error> {
    let server = TestServer::start(ResponseSpec::default())?;
    let pool = RequestPool::new();

    let handle = pool.produce(&server.url());
    let status = handle.request().perform()?;

    let request = handle.request();
    assert_eq!(status, RequestStatus::Success);
    assert_eq!(request.completion_status(), RequestStatus::Success);
    assert_eq!(request.response_status_code(), 200);
    assert_eq!(request.response_data(), b"hello");
    assert!(request.total_time().is_some());
    assert!(request.num_connects() >= 1);
    Ok(())
}

#[test]
#[traced_test]
fn synchronous_response_headers_are_captured() -> Result<(), Error> {
    let server = TestServer::start(ResponseSpec::default())?;
    let pool = RequestPool::new();

    let handle = pool.produce(&server.url());
    handle.request().perform()?;

    let request = handle.request();
    let content_length = request
        .response_headers()
        .iter()
        .find(|header| header.name().eq_ignore_ascii_case("content-length"))
        .expect("content-length header present");
    assert_eq!(content_length.value(), "5");
    Ok(())
}
