use curl::easy::{Easy2, Handler, HttpVersion};

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET, the default.
    Get,
    /// HEAD, a GET without a response body.
    Head,
    /// POST.
    Post,
    /// PUT.
    Put,
    /// DELETE.
    Delete,
    /// CONNECT, establishes a tunnel only.
    Connect,
    /// OPTIONS.
    Options,
    /// PATCH.
    Patch,
}

impl Method {
    pub(crate) fn apply<H: Handler>(self, easy: &mut Easy2<H>) -> Result<(), curl::Error> {
        match self {
            Method::Get => easy.get(true),
            Method::Head => easy.nobody(true),
            Method::Post => easy.post(true),
            Method::Put => easy.custom_request("PUT"),
            Method::Delete => easy.custom_request("DELETE"),
            Method::Connect => easy.connect_only(true),
            Method::Options => easy.custom_request("OPTIONS"),
            Method::Patch => easy.custom_request("PATCH"),
        }
    }
}

/// HTTP version preference for a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// Let the engine pick whatever it considers best.
    UseBest,
    /// HTTP/1.0.
    V1_0,
    /// HTTP/1.1.
    V1_1,
    /// Attempt HTTP/2, fall back to HTTP/1.1.
    V2_0,
    /// Attempt HTTP/2 over TLS, fall back to HTTP/1.1.
    V2_0Tls,
    /// HTTP/2 with prior knowledge, no fallback.
    V2_0Only,
}

impl Version {
    pub(crate) fn apply<H: Handler>(self, easy: &mut Easy2<H>) -> Result<(), curl::Error> {
        let version = match self {
            Version::UseBest => HttpVersion::Any,
            Version::V1_0 => HttpVersion::V10,
            Version::V1_1 => HttpVersion::V11,
            Version::V2_0 => HttpVersion::V2,
            Version::V2_0Tls => HttpVersion::V2TLS,
            Version::V2_0Only => HttpVersion::V2PriorKnowledge,
        };
        easy.http_version(version)
    }
}
