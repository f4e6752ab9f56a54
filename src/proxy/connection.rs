//! Connection relay
//!
//! A `Connection` pairs the client socket with the (lazily connected)
//! origin socket and drives bytes between them: `relay` for raw and
//! length-delimited bodies and tunnels, `relay_encoded` for bodies
//! framed by a transfer codec. It also owns the minimal error
//! response written back when a request cannot be served.

use super::socket::{new_tag, BufferedSocket};
use super::{Error, Result, MAX_LINE_LENGTH, SOCKET_BUFSIZE, SOCKET_TIMEOUT};
use crate::http::chunked::{ChunkCodec, Progress};
use crate::http::message::reason_phrase;
use crate::http::CRLF;
use crate::logging;
use log::{error, trace};
use std::io;
use std::net::TcpStream;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Relay directions; by default bytes flow both ways.
#[derive(Debug, Clone, Copy)]
pub struct Directions {
    pub server_to_client: bool,
    pub client_to_server: bool,
}

impl Directions {
    pub fn both() -> Self {
        Directions {
            server_to_client: true,
            client_to_server: true,
        }
    }

    pub fn server_to_client() -> Self {
        Directions {
            server_to_client: true,
            client_to_server: false,
        }
    }

    pub fn client_to_server() -> Self {
        Directions {
            server_to_client: false,
            client_to_server: true,
        }
    }
}

/// Readable for our purposes also covers a hung-up or errored peer,
/// which a subsequent read reports as EOF.
const READ_READY: i16 = libc::POLLIN | libc::POLLHUP | libc::POLLERR;

/// One proxied client connection and its origin counterpart.
pub struct Connection {
    tag: String,
    pub client: BufferedSocket,
    pub server: BufferedSocket,
    idle_timeout: Duration,
}

impl Connection {
    pub fn new(client_stream: TcpStream) -> Self {
        let tag = new_tag();
        let link_tag = format!("c#{}", tag);

        Connection {
            client: BufferedSocket::attached(&link_tag, client_stream, SOCKET_TIMEOUT),
            server: BufferedSocket::detached(&link_tag, SOCKET_TIMEOUT),
            tag,
            idle_timeout: SOCKET_TIMEOUT,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    fn log_target(&self) -> String {
        format!("c#{}", self.tag)
    }

    /// Change the idle timeout for this connection and both sockets.
    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = timeout;
        self.client.set_timeout(timeout);
        self.server.set_timeout(timeout);
    }

    /// Shuttle bytes between the two sockets.
    ///
    /// Runs until a peer closes, a configured per-direction byte
    /// quota is met, or nothing moves for a full idle-timeout window.
    /// The idle case is a plain return, not a failure: this call also
    /// fronts tunnels, which have no natural end. Residual bytes
    /// beyond a quota stay cached for the caller.
    pub fn relay(&mut self, limit: Option<u64>, dirs: Directions) -> Result<()> {
        let (Some(client_fd), Some(server_fd)) = (self.client.raw_fd(), self.server.raw_fd())
        else {
            return Ok(());
        };

        // a zero quota has nothing to move
        if limit == Some(0) {
            return Ok(());
        }

        let mut to_client: u64 = 0;
        let mut to_server: u64 = 0;

        self.client.set_nonblocking(true)?;
        self.server.set_nonblocking(true)?;

        let result =
            self.relay_loop(client_fd, server_fd, limit, dirs, &mut to_client, &mut to_server);

        let _ = self.client.set_nonblocking(false);
        let _ = self.server.set_nonblocking(false);

        if to_server > 0 {
            trace!(
                target: &self.log_target(),
                "s#{}->s#{}:relay:stat:bytes_sent:{}",
                self.client.tag(),
                self.server.tag(),
                to_server
            );
        }

        if to_client > 0 {
            trace!(
                target: &self.log_target(),
                "s#{}->s#{}:relay:stat:bytes_sent:{}",
                self.server.tag(),
                self.client.tag(),
                to_client
            );
        }

        result
    }

    fn relay_loop(
        &mut self,
        client_fd: RawFd,
        server_fd: RawFd,
        limit: Option<u64>,
        dirs: Directions,
        to_client: &mut u64,
        to_server: &mut u64,
    ) -> Result<()> {
        let mut last_op = Instant::now();

        while last_op.elapsed() < self.idle_timeout {
            let mut client_ev: i16 = 0;
            let mut server_ev: i16 = 0;

            if dirs.server_to_client {
                if self.server.cache_len() < SOCKET_BUFSIZE {
                    server_ev |= libc::POLLIN;
                }
                if self.server.cache_len() > 0 {
                    client_ev |= libc::POLLOUT;
                }
            }

            if dirs.client_to_server {
                if self.client.cache_len() < SOCKET_BUFSIZE {
                    client_ev |= libc::POLLIN;
                }
                if self.client.cache_len() > 0 {
                    server_ev |= libc::POLLOUT;
                }
            }

            let (client_rev, server_rev) =
                poll_pair(client_fd, client_ev, server_fd, server_ev, self.idle_timeout)?;

            if client_rev != 0 || server_rev != 0 {
                last_op = Instant::now();
            }

            if server_ev & libc::POLLIN != 0 && server_rev & READ_READY != 0 {
                let data = self.server.receive(SOCKET_BUFSIZE)?;
                if data.is_empty() {
                    break;
                }
                self.server.cache_extend(&data);
            }

            if client_ev & libc::POLLIN != 0 && client_rev & READ_READY != 0 {
                let data = self.client.receive(SOCKET_BUFSIZE)?;
                if data.is_empty() {
                    break;
                }
                self.client.cache_extend(&data);
            }

            if server_rev & libc::POLLOUT != 0 {
                let quota = limit
                    .map(|l| l.saturating_sub(*to_server) as usize)
                    .unwrap_or(usize::MAX);

                let chunk = self.client.take_cache(quota);
                let sent = self.server.send(&chunk)?;
                if sent < chunk.len() {
                    self.client.requeue(&chunk[sent..]);
                }

                *to_server += sent as u64;

                if limit.is_some_and(|l| *to_server >= l) {
                    break;
                }
            }

            if client_rev & libc::POLLOUT != 0 {
                let quota = limit
                    .map(|l| l.saturating_sub(*to_client) as usize)
                    .unwrap_or(usize::MAX);

                let chunk = self.server.take_cache(quota);
                let sent = self.client.send(&chunk)?;
                if sent < chunk.len() {
                    self.server.requeue(&chunk[sent..]);
                }

                *to_client += sent as u64;

                if limit.is_some_and(|l| *to_client >= l) {
                    break;
                }
            }
        }

        Ok(())
    }

    /// Relay an origin body through a transfer codec, re-framing each
    /// chunk record onto the client wire.
    ///
    /// Unlike `relay`, the time window here is a hard budget for the
    /// whole body and expiring it is a failure. On completion the
    /// terminal CRLF is written, leftover codec bytes are handed back
    /// to the origin socket's cache, and the line that follows the
    /// body is consumed when the origin stays open.
    pub fn relay_encoded(&mut self, coder: &mut dyn ChunkCodec) -> Result<()> {
        self.server.set_nonblocking(true)?;

        let started = Instant::now();

        while !coder.finished() {
            let elapsed = started.elapsed();
            if elapsed >= self.idle_timeout {
                return Err(Error::Timeout("encoded".to_string()));
            }

            // cached read-ahead bytes are consumed without waiting;
            // the socket itself will not signal them
            if self.server.cache_len() == 0
                && !self.server.wait_readable(self.idle_timeout - elapsed)?
            {
                continue;
            }

            let data = self.server.receive(SOCKET_BUFSIZE)?;

            match coder.feed(&data)? {
                Progress::Pending => {
                    if data.is_empty() {
                        // readable but nothing to read: the origin is
                        // gone mid-body
                        return Err(Error::Disconnected);
                    }
                }
                Progress::ChunksReady | Progress::Finished => {
                    for chunk in coder.flush() {
                        trace!(
                            target: &self.log_target(),
                            "s#{}->s#{}:relay_encoded:chunk({:X},{})",
                            self.server.tag(),
                            self.client.tag(),
                            chunk.size,
                            if chunk.data.is_empty() {
                                "--".to_string()
                            } else {
                                logging::dump(&chunk.data)
                            }
                        );

                        self.client
                            .send(format!("{:X}{}", chunk.size, CRLF).as_bytes())?;
                        if chunk.size > 0 {
                            self.client.send(&chunk.data)?;
                            self.client.send(CRLF.as_bytes())?;
                        }
                    }
                }
            }
        }

        self.server.set_nonblocking(false)?;

        self.client.send(CRLF.as_bytes())?;

        // bytes the codec read past the body belong to the next
        // response on this origin connection
        let leftover = coder.take_cache();
        if !leftover.is_empty() {
            self.server.cache_extend(&leftover);
        }

        if !self.server.is_tainted() {
            self.server.read_line(MAX_LINE_LENGTH)?;
        }

        Ok(())
    }

    /// Log a failure and, unless suppressed, write a minimal error
    /// response to the client. Failures while writing are swallowed;
    /// the connection is going away either way.
    pub fn error(&mut self, code: u16, message: &str, send_to_client: bool) {
        let reason = reason_phrase(code);
        let message = if message.is_empty() { reason } else { message };

        error!(
            target: &self.log_target(),
            "e#{:04}:{}",
            code,
            message.to_lowercase()
        );

        if !send_to_client {
            return;
        }

        let body = format!(
            "{}{}{}{}! c#{}:e#{:04}",
            reason,
            CRLF.repeat(2),
            message.to_lowercase(),
            CRLF.repeat(2),
            self.tag,
            code
        );

        let head = format!(
            "HTTP/1.1 {} {}{}Content-Type: text/plain{}Content-Length: {}{}Connection: close{}{}",
            code,
            reason,
            CRLF,
            CRLF,
            body.len(),
            CRLF,
            CRLF,
            CRLF
        );

        let _ = self.client.set_nonblocking(true);
        let _ = self.client.send(head.as_bytes());
        let _ = self.client.send(body.as_bytes());
    }

    /// Close both sockets.
    pub fn close(&mut self) {
        self.server.close();
        self.client.close();
    }
}

/// Poll both sockets at once; returns the ready events per socket.
fn poll_pair(
    client_fd: RawFd,
    client_ev: i16,
    server_fd: RawFd,
    server_ev: i16,
    timeout: Duration,
) -> Result<(i16, i16)> {
    let mut fds: Vec<libc::pollfd> = Vec::with_capacity(2);
    let mut client_idx = None;
    let mut server_idx = None;

    if client_ev != 0 {
        client_idx = Some(fds.len());
        fds.push(libc::pollfd {
            fd: client_fd,
            events: client_ev,
            revents: 0,
        });
    }

    if server_ev != 0 {
        server_idx = Some(fds.len());
        fds.push(libc::pollfd {
            fd: server_fd,
            events: server_ev,
            revents: 0,
        });
    }

    if fds.is_empty() {
        return Ok((0, 0));
    }

    let timeout_ms = timeout.as_millis() as i32;

    let result = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };

    if result < 0 {
        return Err(Error::Socket(io::Error::last_os_error().to_string()));
    }

    Ok((
        client_idx.map(|i| fds[i].revents).unwrap_or(0),
        server_idx.map(|i| fds[i].revents).unwrap_or(0),
    ))
}
