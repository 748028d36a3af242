use curl::easy::{Handler, WriteError};

use crate::headers::HeaderStore;

/// Engine-side sink for one transfer's response.
///
/// The collector owns the response buffers for as long as the engine may
/// write to them. They are moved into the [`Request`](crate::Request) only
/// once the transfer has finished, so user code can never observe a buffer
/// that is still being filled.
pub(crate) struct Collector {
    response_headers: HeaderStore,
    response_data: Vec<u8>,
    /// Maximum number of bytes to write, `-1` for unbounded.
    max_download_bytes: i64,
    bytes_written: i64,
}

impl Collector {
    pub(crate) fn new() -> Self {
        Self {
            response_headers: HeaderStore::new(),
            response_data: Vec::new(),
            max_download_bytes: -1,
            bytes_written: 0,
        }
    }

    pub(crate) fn set_max_download_bytes(&mut self, max: i64) {
        self.max_download_bytes = max;
        self.bytes_written = 0;
    }

    pub(crate) fn max_download_bytes(&self) -> i64 {
        self.max_download_bytes
    }

    /// True when a download cap is set and fully used up.
    pub(crate) fn cap_reached(&self) -> bool {
        self.max_download_bytes >= 0 && self.bytes_written >= self.max_download_bytes
    }

    /// Move the accumulated response out, leaving empty buffers behind.
    pub(crate) fn take_response(&mut self) -> (HeaderStore, Vec<u8>) {
        (
            std::mem::take(&mut self.response_headers),
            std::mem::take(&mut self.response_data),
        )
    }

    pub(crate) fn clear(&mut self) {
        self.response_headers.clear();
        self.response_data = Vec::new();
        self.bytes_written = 0;
    }

    pub(crate) fn reset(&mut self) {
        self.clear();
        self.max_download_bytes = -1;
    }

    fn remaining(&self) -> i64 {
        self.max_download_bytes - self.bytes_written
    }
}

impl Handler for Collector {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        let mut length = data.len();
        if self.max_download_bytes > -1 {
            let remaining = self.remaining();
            if remaining < 0 {
                length = 0;
            } else {
                length = length.min(remaining as usize);
            }
        }

        self.response_data.extend_from_slice(&data[..length]);
        self.bytes_written += length as i64;

        // A short write makes the engine abort the transfer, which the
        // completion mapping turns back into a success when the cap was the
        // cause.
        Ok(length)
    }

    fn header(&mut self, data: &[u8]) -> bool {
        let line = String::from_utf8_lossy(data);
        let line = line.trim_end_matches(['\r', '\n']);

        // The engine hands us the status line and the blank separator line
        // as well; only actual header fields are stored.
        if line.is_empty() || line.starts_with("HTTP/") {
            return true;
        }

        self.response_headers.push_line(line);
        true
    }
}
