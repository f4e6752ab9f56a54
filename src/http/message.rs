//! HTTP message model
//!
//! Request-line and status-line parsing plus the two parsed message
//! types the proxy works with: `ClientRequest` (what the client asked
//! us to procure) and `ServerResponse` (what the origin replied).

use super::{
    chunked::{ChunkCodec, ChunkDecoder, ChunkEncoder},
    Error, Headers, Result,
};
use std::fmt;
use url::Url;

/// Methods the proxy is willing to forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Connect,
    Options,
    Get,
    Post,
    Put,
    Delete,
    Trace,
    Head,
}

impl Method {
    /// Parse a method token; anything outside the allowed set is None.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CONNECT" => Some(Method::Connect),
            "OPTIONS" => Some(Method::Options),
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            "TRACE" => Some(Method::Trace),
            "HEAD" => Some(Method::Head),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Trace => "TRACE",
            Method::Head => "HEAD",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HTTP/1.0" => Some(Version::Http10),
            "HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Canonical reason phrase for a status code.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// Split a request line into (method, uri, version).
fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    let parts: Vec<&str> = line.split_whitespace().collect();

    if parts.len() != 3 {
        return Err(Error::Request {
            code: 400,
            reason: "line:could not parse".to_string(),
        });
    }

    let method = Method::parse(parts[0]).ok_or_else(|| Error::Request {
        code: 405,
        reason: format!("{}:not allowed", parts[0]),
    })?;

    let version = Version::parse(parts[2]).ok_or_else(|| Error::Request {
        code: 400,
        reason: format!("{}:unsupported version", parts[2]),
    })?;

    Ok((method, parts[1].to_string(), version))
}

/// A request parsed off the client socket.
///
/// Beyond the request line, the URI is decomposed into the origin
/// endpoint to connect to: scheme/host/port/path for absolute-form
/// URIs, host/port for CONNECT authority-form.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub method: Method,
    pub uri: String,
    pub version: Version,
    pub headers: Headers,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl ClientRequest {
    /// Parse a request line. Headers start out empty and are filled
    /// in by the caller as it reads them.
    pub fn parse(line: &str) -> Result<Self> {
        let (method, uri, version) = parse_request_line(line)?;

        let (host, port, path) = if method == Method::Connect {
            Self::parse_authority(&uri)?
        } else {
            Self::parse_absolute(&uri)?
        };

        Ok(ClientRequest {
            method,
            uri,
            version,
            headers: Headers::new(),
            host,
            port,
            path,
        })
    }

    fn parse_authority(uri: &str) -> Result<(String, u16, String)> {
        let bad = || Error::Request {
            code: 400,
            reason: "CONNECT:bad address".to_string(),
        };

        let parts: Vec<&str> = uri.split(':').collect();
        if parts.len() != 2 {
            return Err(bad());
        }

        let port = parts[1].parse::<u16>().map_err(|_| bad())?;

        Ok((parts[0].to_lowercase(), port, String::new()))
    }

    fn parse_absolute(uri: &str) -> Result<(String, u16, String)> {
        let url = match Url::parse(uri) {
            Ok(url) => url,
            Err(url::ParseError::EmptyHost) => {
                return Err(Error::Request {
                    code: 400,
                    reason: "missing hostname in request URI".to_string(),
                })
            }
            Err(_) if uri.starts_with('/') => {
                return Err(Error::Request {
                    code: 403,
                    reason: format!("{}:access denied", uri),
                })
            }
            Err(_) => {
                return Err(Error::Request {
                    code: 400,
                    reason: "could not parse request".to_string(),
                })
            }
        };

        if url.scheme() != "http" {
            return Err(Error::Request {
                code: 400,
                reason: format!("{}:unknown scheme", url.scheme()),
            });
        }

        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => {
                return Err(Error::Request {
                    code: 400,
                    reason: "missing hostname in request URI".to_string(),
                })
            }
        };

        let port = url.port().unwrap_or(80);

        let mut path = url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok((host, port, path))
    }

    /// The origin endpoint this request targets.
    pub fn address(&self) -> (&str, u16) {
        (&self.host, self.port)
    }

    pub fn is_tunneling(&self) -> bool {
        self.method == Method::Connect
    }

    /// Whether the client wants the connection kept open afterwards.
    ///
    /// HTTP/1.1 defaults to keep-alive; Proxy-Connection and
    /// Connection headers override in that order, with an empty value
    /// counting as close. A tunnel is never persistent.
    pub fn is_persistent(&self) -> bool {
        if self.is_tunneling() {
            return false;
        }

        let mut keep_alive = self.version == Version::Http11;

        for name in ["Proxy-Connection", "Connection"] {
            if let Some(value) = self.headers.get(name) {
                if value.eq_ignore_ascii_case("keep-alive") {
                    keep_alive = true;
                }
                if value.eq_ignore_ascii_case("close") || value.is_empty() {
                    keep_alive = false;
                }
            }
        }

        keep_alive
    }
}

impl fmt::Display for ClientRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri)
    }
}

/// A response parsed off the origin socket.
#[derive(Debug, Clone)]
pub struct ServerResponse {
    pub version: Version,
    pub code: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ServerResponse {
    /// Parse a status line. The reason phrase may contain spaces.
    pub fn parse(line: &str) -> Result<Self> {
        let bad = || Error::Response {
            code: 502,
            reason: "line:could not parse".to_string(),
        };

        let parts: Vec<&str> = line.splitn(3, ' ').collect();
        if parts.len() != 3 {
            return Err(bad());
        }

        let version = Version::parse(parts[0]).ok_or_else(bad)?;
        let code = parts[1].parse::<u16>().map_err(|_| bad())?;
        // the reason phrase may itself contain spaces
        let reason = parts[2].trim_end().to_string();

        Ok(ServerResponse {
            version,
            code,
            reason,
            headers: Headers::new(),
        })
    }

    /// Whether a message body follows the headers.
    pub fn expect_body(&self) -> bool {
        !(self.code / 100 == 1 || self.code == 204 || self.code == 304)
    }

    /// Whether the origin will keep its side open for another exchange.
    pub fn is_persistent(&self) -> bool {
        match self.headers.get("Connection") {
            Some(value) => value.eq_ignore_ascii_case("keep-alive"),
            None => false,
        }
    }

    /// Whether the origin connection must be discarded after this
    /// exchange (the peer signalled, explicitly or by omission, that
    /// it will close).
    pub fn is_tainted(&self) -> bool {
        !self.is_persistent()
    }

    /// Pick the transfer codec for the body, if any.
    ///
    /// A chunked Transfer-Encoding gets a decoder; any other coding is
    /// refused. Without Transfer-Encoding and Content-Length the body
    /// runs to EOF, so `Transfer-Encoding: chunked` is injected into
    /// the headers and an encoder re-frames the body for the client.
    /// A Content-Length body needs no codec.
    pub fn select_coder(&mut self) -> Result<Option<Box<dyn ChunkCodec>>> {
        if let Some(encoding) = self.headers.get("Transfer-Encoding") {
            if encoding.eq_ignore_ascii_case("chunked") {
                Ok(Some(Box::new(ChunkDecoder::new())))
            } else {
                Err(Error::Response {
                    code: 502,
                    reason: format!("{}:unsupported transfer-encoding", encoding),
                })
            }
        } else if !self.headers.contains("Content-Length") {
            self.headers.set("Transfer-Encoding", "chunked");
            Ok(Some(Box::new(ChunkEncoder::new())))
        } else {
            Ok(None)
        }
    }

    /// The status line as sent to the client.
    pub fn status_line(&self) -> String {
        format!("{} {} {}", self.version, self.code, self.reason)
    }
}
