//! Buffered socket
//!
//! Wraps one TCP socket together with a read-ahead cache: bytes read
//! past a logical boundary (a line terminator, a byte budget) stay in
//! the cache and are handed out first by the next read. The cache
//! never holds bytes already delivered to a caller.
//!
//! Readiness waits go through `poll(2)` so a worker blocks only while
//! waiting for its own sockets, bounded by the idle timeout.

use super::{Error, Result, SOCKET_BUFSIZE};
use crate::logging;
use bytes::BytesMut;
use log::{info, trace};
use socket2::SockRef;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

pub(crate) fn new_tag() -> String {
    format!("{:04x}", fastrand::u16(..))
}

/// One direction of a proxied connection: the client socket or the
/// (lazily connected) origin socket.
pub struct BufferedSocket {
    tag: String,
    link_tag: String,
    stream: Option<TcpStream>,
    cache: BytesMut,
    target: Option<(String, u16)>,
    peer: Option<SocketAddr>,
    tainted: bool,
    nonblocking: bool,
    timeout: Duration,
}

impl BufferedSocket {
    /// Wrap an accepted socket (the client side of a connection).
    pub fn attached(link_tag: &str, stream: TcpStream, timeout: Duration) -> Self {
        let mut sock = BufferedSocket {
            tag: new_tag(),
            link_tag: link_tag.to_string(),
            stream: None,
            cache: BytesMut::new(),
            target: None,
            peer: stream.peer_addr().ok(),
            tainted: false,
            nonblocking: false,
            timeout,
        };

        let _ = sock.configure(&stream);
        sock.stream = Some(stream);

        if let Some(peer) = sock.peer {
            info!(target: &sock.log_target(), "p#{}:connection established", peer);
        }

        sock
    }

    /// Create the not-yet-connected origin side of a connection.
    pub fn detached(link_tag: &str, timeout: Duration) -> Self {
        BufferedSocket {
            tag: new_tag(),
            link_tag: link_tag.to_string(),
            stream: None,
            cache: BytesMut::new(),
            target: None,
            peer: None,
            tainted: false,
            nonblocking: false,
            timeout,
        }
    }

    fn configure(&self, stream: &TcpStream) -> Result<()> {
        let sock = SockRef::from(stream);
        sock.set_keepalive(true)
            .and_then(|_| sock.set_reuse_address(true))
            .and_then(|_| stream.set_read_timeout(Some(self.timeout)))
            .and_then(|_| stream.set_write_timeout(Some(self.timeout)))
            .map_err(|e| Error::Socket(e.to_string()))
    }

    fn log_target(&self) -> String {
        format!("{}:s#{}", self.link_tag, self.tag)
    }

    fn peer_tag(&self) -> String {
        match self.peer {
            Some(peer) => format!("p#{}", peer),
            None => "p#?".to_string(),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    pub fn set_tainted(&mut self, tainted: bool) {
        self.tainted = tainted;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Change the idle timeout for subsequent waits and OS reads.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;

        if let Some(stream) = self.stream.as_ref() {
            let _ = stream.set_read_timeout(Some(timeout));
            let _ = stream.set_write_timeout(Some(timeout));
        }
    }

    /// Toggle between multiplexed (non-blocking) and line-oriented
    /// (blocking) I/O.
    pub fn set_nonblocking(&mut self, on: bool) -> Result<()> {
        if let Some(stream) = self.stream.as_ref() {
            stream
                .set_nonblocking(on)
                .map_err(|e| Error::Socket(e.to_string()))?;
        }
        self.nonblocking = on;
        Ok(())
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    pub(crate) fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub(crate) fn cache_extend(&mut self, data: &[u8]) {
        self.cache.extend_from_slice(data);
    }

    /// Remove and return up to `max` bytes from the cache front.
    pub(crate) fn take_cache(&mut self, max: usize) -> BytesMut {
        let n = self.cache.len().min(max);
        self.cache.split_to(n)
    }

    /// Put bytes back at the cache front (an interrupted write).
    pub(crate) fn requeue(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let mut fresh = BytesMut::with_capacity(data.len() + self.cache.len());
        fresh.extend_from_slice(data);
        fresh.extend_from_slice(&self.cache);
        self.cache = fresh;
    }

    /// Wait until the socket is readable, up to `timeout`.
    pub(crate) fn wait_readable(&self, timeout: Duration) -> Result<bool> {
        let Some(stream) = self.stream.as_ref() else {
            return Err(Error::Socket("not connected".to_string()));
        };

        let mut pfd = libc::pollfd {
            fd: stream.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        let timeout_ms = timeout.as_millis() as i32;

        let result = unsafe { libc::poll(&mut pfd as *mut libc::pollfd, 1, timeout_ms) };

        if result < 0 {
            return Err(Error::Socket(io::Error::last_os_error().to_string()));
        }

        Ok(result > 0)
    }

    /// Connect to the given origin endpoint.
    ///
    /// A socket already connected to the same logical endpoint is
    /// reused as-is; anything else is reset first. Connect attempts
    /// are bounded by the idle timeout per resolved address.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        info!(target: &self.log_target(), "p#{}:{}:connecting...", host, port);

        if self.stream.is_some()
            && self
                .target
                .as_ref()
                .is_some_and(|(h, p)| h.as_str() == host && *p == port)
        {
            return Ok(());
        }

        self.reset();

        let endpoint = format!("p#{}:{}", host, port);

        let addrs = (host, port).to_socket_addrs().map_err(|e| {
            Error::Socket(format!("{}:could not connect ({})", endpoint, e))
        })?;

        let mut last_err: Option<io::Error> = None;
        let mut connected = None;

        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }

        let stream = match connected {
            Some(stream) => stream,
            None => {
                let e = last_err.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")
                });

                if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) {
                    return Err(Error::Timeout(format!("{}:could not connect", endpoint)));
                }

                return Err(Error::Socket(format!(
                    "{}:could not connect ({})",
                    endpoint, e
                )));
            }
        };

        self.configure(&stream)?;
        self.peer = stream.peer_addr().ok();
        self.target = Some((host.to_string(), port));
        self.stream = Some(stream);

        info!(
            target: &self.log_target(),
            "{}:connection established",
            self.peer_tag()
        );

        Ok(())
    }

    /// Read up to `max` bytes, cache first, then one best-effort OS
    /// read. A reset or not-ready socket yields whatever was read so
    /// far; an empty result on a readable socket means EOF.
    pub fn receive(&mut self, max: usize) -> Result<Vec<u8>> {
        let target = self.log_target();
        let mut data = Vec::with_capacity(max.min(SOCKET_BUFSIZE));

        if !self.cache.is_empty() {
            let drained = self.take_cache(max);
            data.extend_from_slice(&drained);

            trace!(target: &target, "cr:{}", logging::dump(&data));
        }

        let remaining = max - data.len();

        if remaining > 0 {
            if let Some(stream) = self.stream.as_mut() {
                let mut buf = vec![0u8; remaining];

                match stream.read(&mut buf) {
                    Ok(n) => {
                        if n > 0 {
                            trace!(target: &target, "rx:{}", logging::dump(&buf[..n]));
                        }
                        data.extend_from_slice(&buf[..n]);
                    }
                    Err(e) => match e.kind() {
                        io::ErrorKind::ConnectionReset
                        | io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted => {}
                        _ => return Err(Error::Socket(e.to_string())),
                    },
                }
            }
        }

        Ok(data)
    }

    /// Best-effort write; returns the number of bytes that went out.
    /// A broken pipe or reset peer stops the write without failing; a
    /// write timeout on a blocking socket is a typed failure.
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        let target = self.log_target();
        let peer_tag = self.peer_tag();
        let nonblocking = self.nonblocking;

        let Some(stream) = self.stream.as_mut() else {
            return Ok(0);
        };

        let mut sent = 0;

        while sent < data.len() {
            match stream.write(&data[sent..]) {
                Ok(0) => break,
                Ok(n) => sent += n,
                Err(e) => match e.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => break,
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                        if nonblocking {
                            break;
                        }
                        return Err(Error::Timeout(format!("{}:tx", peer_tag)));
                    }
                    _ => return Err(Error::Socket(e.to_string())),
                },
            }
        }

        if sent > 0 {
            trace!(target: &target, "tx:{}", logging::dump(&data[..sent]));
        }

        Ok(sent)
    }

    /// Read the next line, without its terminator.
    ///
    /// Lines end in LF with an optional preceding CR; bytes past the
    /// terminator go back into the cache for the next read. Blocks,
    /// polling readiness with the idle timeout, until a terminator
    /// arrives or `max_len` bytes pile up.
    pub fn read_line(&mut self, max_len: usize) -> Result<String> {
        let mut buf: Vec<u8> = Vec::new();

        if !self.cache.is_empty() {
            let drained = std::mem::take(&mut self.cache);
            trace!(target: &self.log_target(), "cr:{}", logging::dump(&drained));
            buf.extend_from_slice(&drained);
        }

        while !buf.contains(&b'\n') && buf.len() < max_len {
            if !self.wait_readable(self.timeout)? {
                return Err(Error::Timeout(format!("{}:rx", self.peer_tag())));
            }

            let data = self.receive(SOCKET_BUFSIZE)?;
            if data.is_empty() {
                return Err(Error::Disconnected);
            }

            buf.extend_from_slice(&data);
        }

        let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
            return Err(Error::Socket(format!(
                "{}:rx:maximum length exceeded",
                self.peer_tag()
            )));
        };

        let mut end = pos;
        if end > 0 && buf[end - 1] == b'\r' {
            end -= 1;
        }

        let leftover = &buf[pos + 1..];
        if !leftover.is_empty() {
            self.cache.extend_from_slice(leftover);
            trace!(target: &self.log_target(), "cw:{}", logging::dump(leftover));
        }

        Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
    }

    /// Shut down and drop the socket. Safe to call repeatedly and on
    /// a never-connected socket.
    pub fn close(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };

        // NotConnected and friends are expected during teardown
        let _ = stream.shutdown(Shutdown::Both);

        if let Some(peer) = self.peer {
            info!(target: &self.log_target(), "p#{}:connection closed", peer);
        }
    }

    /// Close and reinitialize for the same pairing: fresh id, empty
    /// cache, untainted.
    pub fn reset(&mut self) {
        self.close();

        self.tag = new_tag();
        self.cache.clear();
        self.tainted = false;
        self.nonblocking = false;
        self.target = None;
        self.peer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    fn pair() -> (BufferedSocket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = TcpStream::connect(addr).unwrap();
        let (stream, _) = listener.accept().unwrap();

        (
            BufferedSocket::attached("c#test", stream, Duration::from_secs(2)),
            peer,
        )
    }

    #[test]
    fn test_read_line_and_leftover() {
        let (mut sock, mut peer) = pair();

        peer.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

        assert_eq!(sock.read_line(1024).unwrap(), "GET / HTTP/1.1");
        assert_eq!(sock.read_line(1024).unwrap(), "Host: x");
        assert_eq!(sock.read_line(1024).unwrap(), "");
    }

    #[test]
    fn test_read_line_bare_lf() {
        let (mut sock, mut peer) = pair();

        peer.write_all(b"hello\nworld\n").unwrap();

        assert_eq!(sock.read_line(1024).unwrap(), "hello");
        assert_eq!(sock.read_line(1024).unwrap(), "world");
    }

    #[test]
    fn test_read_line_too_long() {
        let (mut sock, mut peer) = pair();

        peer.write_all(&[b'a'; 64]).unwrap();

        let result = sock.read_line(16);
        assert!(matches!(result, Err(Error::Socket(_))));
    }

    #[test]
    fn test_read_line_disconnected() {
        let (mut sock, mut peer) = pair();

        peer.write_all(b"no terminator").unwrap();
        drop(peer);

        let result = sock.read_line(1024);
        assert!(matches!(result, Err(Error::Disconnected)));
    }

    #[test]
    fn test_read_line_timeout() {
        let (mut sock, _peer) = pair();
        sock.set_timeout(Duration::from_millis(50));

        let result = sock.read_line(1024);
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[test]
    fn test_receive_cache_first() {
        let (mut sock, mut peer) = pair();

        sock.cache_extend(b"cached");
        peer.write_all(b"socket").unwrap();

        // wait for the socket bytes to arrive
        assert!(sock.wait_readable(Duration::from_secs(1)).unwrap());

        let first = sock.receive(4).unwrap();
        assert_eq!(first, b"cach");

        let rest = sock.receive(32).unwrap();
        assert_eq!(&rest[..2], b"ed");
        assert_eq!(&rest[2..], b"socket");
    }

    #[test]
    fn test_requeue_order() {
        let (mut sock, _peer) = pair();
        sock.set_timeout(Duration::from_millis(50));

        sock.cache_extend(b"tail");
        sock.requeue(b"head-");

        let data = sock.receive(16).unwrap();
        assert_eq!(data, b"head-tail");
    }

    #[test]
    fn test_send_and_receive_roundtrip() {
        let (mut sock, mut peer) = pair();

        let sent = sock.send(b"ping").unwrap();
        assert_eq!(sent, 4);

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_close_idempotent() {
        let (mut sock, _peer) = pair();

        sock.close();
        sock.close();
        assert!(!sock.is_connected());

        let mut never = BufferedSocket::detached("c#test", Duration::from_secs(1));
        never.close();
        assert_eq!(never.send(b"x").unwrap(), 0);
    }

    #[test]
    fn test_reset_clears_state() {
        let (mut sock, _peer) = pair();

        let old_tag = sock.tag().to_string();
        sock.cache_extend(b"stale");
        sock.set_tainted(true);

        sock.reset();

        assert!(!sock.is_connected());
        assert!(!sock.is_tainted());
        assert_eq!(sock.cache_len(), 0);
        assert_ne!(sock.tag(), old_tag);
    }

    #[test]
    fn test_connect_refused() {
        // bind then drop to get a port with (very likely) no listener
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let mut sock = BufferedSocket::detached("c#test", Duration::from_secs(1));
        let result = sock.connect("127.0.0.1", addr.port());

        assert!(matches!(result, Err(Error::Socket(_))));
    }

    #[test]
    fn test_connect_skips_same_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let accepted = thread::spawn(move || {
            let mut count = 0;
            listener.set_nonblocking(true).unwrap();
            let deadline = std::time::Instant::now() + Duration::from_millis(500);
            while std::time::Instant::now() < deadline {
                if listener.accept().is_ok() {
                    count += 1;
                }
                thread::sleep(Duration::from_millis(10));
            }
            count
        });

        let mut sock = BufferedSocket::detached("c#test", Duration::from_secs(1));
        sock.connect("127.0.0.1", addr.port()).unwrap();
        sock.connect("127.0.0.1", addr.port()).unwrap();

        assert_eq!(accepted.join().unwrap(), 1);
    }
}
