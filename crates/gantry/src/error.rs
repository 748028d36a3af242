use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced while building or submitting a request.
///
/// Transport failures are never reported through this type. They arrive as a
/// [`RequestStatus`](crate::RequestStatus) on the completed request.
#[derive(Error, Debug)]
pub enum RequestError {
    /// Raw body data was set and a multipart field was added afterwards.
    #[error("cannot add a multipart field after setting raw body data")]
    MimeAfterData,

    /// Multipart fields exist and raw body data was set afterwards.
    #[error("cannot set raw body data after adding multipart fields")]
    DataAfterMime,

    /// A multipart file field points at a path that does not exist.
    #[error("multipart file field path does not exist: {}", .0.display())]
    MimeFileMissing(PathBuf),

    /// The request was mutated after being handed to an event loop.
    #[error("request cannot be modified while it is executing")]
    InFlight,

    /// The transfer engine rejected an option.
    #[error("transfer engine rejected option: {0}")]
    Engine(#[from] curl::Error),

    /// The multipart form could not be assembled.
    #[error("multipart form could not be assembled: {0}")]
    Form(#[from] curl::FormError),
}
