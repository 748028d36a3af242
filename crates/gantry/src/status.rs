use std::fmt;

/// How a request ended up, as seen by the event loop.
///
/// This is not the HTTP status code returned by the remote server; that is
/// available from [`Request::response_status_code`](crate::Request::response_status_code).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Being configured, not yet submitted.
    Building,
    /// Handed to an event loop or a blocking perform.
    Executing,
    /// The transfer finished and a response was received.
    Success,
    /// The transport timeout elapsed before the transfer finished.
    Timeout,
    /// The response wait time elapsed before the transfer finished.
    ResponseWaitTimeout,
    /// The server returned nothing at all.
    ResponseEmpty,
    /// The connection could not be established.
    ConnectError,
    /// The host name could not be resolved.
    ConnectDnsError,
    /// The SSL/TLS handshake failed.
    ConnectSslError,
    /// The download failed while receiving data.
    DownloadError,
    /// The transfer could not be started.
    FailedToStart,
    /// Any other transfer failure.
    Error,
}

impl RequestStatus {
    /// True for the one fully successful outcome.
    pub fn is_success(self) -> bool {
        self == RequestStatus::Success
    }

    /// Map a transfer engine failure onto a completion status.
    ///
    /// A write error with the download cap reached means the transfer was
    /// aborted on purpose, so it counts as a success.
    pub(crate) fn from_engine(error: &curl::Error, cap_reached: bool) -> Self {
        if error.is_got_nothing() {
            RequestStatus::ResponseEmpty
        } else if error.is_operation_timedout() {
            RequestStatus::Timeout
        } else if error.is_couldnt_connect() {
            RequestStatus::ConnectError
        } else if error.is_couldnt_resolve_host() {
            RequestStatus::ConnectDnsError
        } else if error.is_ssl_connect_error() {
            RequestStatus::ConnectSslError
        } else if error.is_write_error() {
            if cap_reached {
                RequestStatus::Success
            } else {
                RequestStatus::DownloadError
            }
        } else if error.is_send_error() {
            RequestStatus::FailedToStart
        } else {
            RequestStatus::Error
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestStatus::Building => "building",
            RequestStatus::Executing => "executing",
            RequestStatus::Success => "success",
            RequestStatus::Timeout => "timeout",
            RequestStatus::ResponseWaitTimeout => "response wait timeout",
            RequestStatus::ResponseEmpty => "response empty",
            RequestStatus::ConnectError => "connect error",
            RequestStatus::ConnectDnsError => "connect dns error",
            RequestStatus::ConnectSslError => "connect ssl error",
            RequestStatus::DownloadError => "download error",
            RequestStatus::FailedToStart => "failed to start",
            RequestStatus::Error => "error",
        };
        f.write_str(name)
    }
}
