//! Request handler
//!
//! The per-connection state machine: parse the client request,
//! connect or reuse the origin, forward the request, relay the
//! response, and loop while the client keeps the connection alive.
//! Every failure funnels into a single catch point that turns it into
//! a best-effort error response and closes the connection.

use super::connection::{Connection, Directions};
use super::{Error, Result, MAX_LINE_LENGTH};
use crate::http::message::ClientRequest;
use crate::http::{self, Headers, ServerResponse, CRLF, HOP_HEADERS_TO_CLIENT, HOP_HEADERS_TO_ORIGIN};
use crate::{PROGRAM_NAME, VERSION};
use log::info;

/// Drives one client connection from accept to close.
pub struct Handler {
    link: Connection,
}

impl Handler {
    pub fn new(link: Connection) -> Self {
        Handler { link }
    }

    /// Serve the connection to completion.
    ///
    /// Failures are caught exactly once here: protocol errors relay
    /// their own status code, timeouts become 504, other connection
    /// failures 502 and anything unanticipated 500. The connection is
    /// closed no matter what.
    pub fn run(mut self) {
        if let Err(e) = self.serve() {
            match e {
                Error::Http(e) => self.link.error(e.code(), &e.to_string(), true),
                Error::Timeout(m) => self.link.error(504, &m, true),
                Error::Disconnected => self.link.error(502, "peer disconnected", true),
                Error::Socket(m) => self.link.error(502, &m, true),
                Error::Internal(m) => self.link.error(500, &m, true),
            }
        }

        self.link.close();
    }

    fn serve(&mut self) -> Result<()> {
        loop {
            let request = self.parse_client_request()?;

            self.link.server.connect(&request.host, request.port)?;

            if request.is_tunneling() {
                self.establish_tunnel()?;
                return Ok(());
            }

            self.forward_request(&request)?;
            self.relay_response(&request)?;

            if !request.is_persistent() {
                return Ok(());
            }

            // a tainted origin connection cannot serve another
            // request; force a fresh one
            if self.link.server.is_tainted() {
                self.link.server.reset();
            }
        }
    }

    fn parse_client_request(&mut self) -> Result<ClientRequest> {
        let mut line = self.link.client.read_line(MAX_LINE_LENGTH)?;

        // clients may send blank keep-alive lines between requests
        while line.is_empty() {
            line = self.link.client.read_line(MAX_LINE_LENGTH)?;
        }

        let mut request = ClientRequest::parse(&line)?;

        loop {
            let line = self.link.client.read_line(MAX_LINE_LENGTH)?;
            if line.is_empty() {
                break;
            }

            let (name, value) = Headers::parse(&line)?;
            request.headers.set(name, value);
        }

        if request.is_tunneling() {
            info!(
                target: &format!("c#{}", self.link.tag()),
                "s#{}:requested tunnel procuration to {}:{}",
                self.link.client.tag(),
                request.host,
                request.port
            );
        } else {
            info!(
                target: &format!("c#{}", self.link.tag()),
                "s#{}:requested procuration to {}",
                self.link.client.tag(),
                request
            );
        }

        Ok(request)
    }

    fn establish_tunnel(&mut self) -> Result<()> {
        let reply = format!(
            "HTTP/1.1 200 Connection established{}Proxy-Agent: {}/{}{}{}",
            CRLF, PROGRAM_NAME, VERSION, CRLF, CRLF
        );
        self.link.client.send(reply.as_bytes())?;

        self.link.relay(None, Directions::both())
    }

    fn forward_request(&mut self, request: &ClientRequest) -> Result<()> {
        let mut headers = Headers::new();

        for (name, value) in request.headers.iter() {
            if !HOP_HEADERS_TO_ORIGIN
                .iter()
                .any(|h| h.eq_ignore_ascii_case(name))
            {
                headers.set(name, value);
            }
        }

        let host = if request.port == 80 {
            request.host.clone()
        } else {
            format!("{}:{}", request.host, request.port)
        };
        headers.set("Host", host);

        // the origin connection is ours to keep, whatever the client
        // asked for
        headers.set("Connection", "keep-alive");

        let mut wire = format!(
            "{} {} {}{}",
            request.method, request.path, request.version, CRLF
        );
        for (name, value) in headers.iter() {
            wire.push_str(&format!("{}: {}{}", name, value, CRLF));
        }
        wire.push_str(CRLF);

        self.link.server.send(wire.as_bytes())?;

        if let Some(length) = request.headers.get("Content-Length") {
            let length = length
                .parse::<u64>()
                .map_err(|_| Error::Internal(format!("content-length:{}:not a number", length)))?;

            self.link
                .relay(Some(length), Directions::client_to_server())?;
        }

        Ok(())
    }

    fn relay_response(&mut self, request: &ClientRequest) -> Result<()> {
        let line = self.link.server.read_line(MAX_LINE_LENGTH)?;
        let mut response = ServerResponse::parse(&line)?;

        loop {
            let line = self.link.server.read_line(MAX_LINE_LENGTH)?;
            if line.is_empty() {
                break;
            }

            // a garbled origin header is the origin's fault, not the
            // client's
            let (name, value) = Headers::parse(&line).map_err(|e| match e {
                http::Error::Header { reason, .. } => http::Error::Header { code: 502, reason },
                other => other,
            })?;

            response.headers.set(name, value);
        }

        info!(
            target: &format!("c#{}", self.link.tag()),
            "s#{}:p#{}:{}:r#{}:response:{}",
            self.link.server.tag(),
            request.host,
            request.port,
            response.code,
            response.reason.to_lowercase()
        );

        if response.is_tainted() {
            self.link.server.set_tainted(true);

            info!(
                target: &format!("c#{}", self.link.tag()),
                "s#{}:p#{}:{}:r#{}:tainted!",
                self.link.server.tag(),
                request.host,
                request.port,
                response.code
            );
        }

        // the client-facing persistence decision is the client's, not
        // the origin's
        if request.is_persistent() {
            response.headers.set("Connection", "keep-alive");
        } else {
            response.headers.set("Connection", "close");
        }

        // may inject Transfer-Encoding: chunked, so pick before the
        // headers go out
        let coder = response.select_coder()?;

        let mut wire = format!("{}{}", response.status_line(), CRLF);
        for (name, value) in response.headers.iter() {
            if !HOP_HEADERS_TO_CLIENT
                .iter()
                .any(|h| h.eq_ignore_ascii_case(name))
            {
                wire.push_str(&format!("{}: {}{}", name, value, CRLF));
            }
        }
        wire.push_str(CRLF);

        self.link.client.send(wire.as_bytes())?;

        if response.expect_body() {
            match coder {
                Some(mut coder) => self.link.relay_encoded(coder.as_mut())?,
                None => {
                    let length = response
                        .headers
                        .get("Content-Length")
                        .unwrap_or("0")
                        .to_string();
                    let length = length.parse::<u64>().map_err(|_| {
                        Error::Internal(format!("content-length:{}:not a number", length))
                    })?;

                    self.link
                        .relay(Some(length), Directions::server_to_client())?;
                }
            }
        }

        Ok(())
    }
}
