//! Accepting daemon
//!
//! Binds the listening socket and hands each accepted client to its
//! own worker thread. Admission is a plain live-worker count: past
//! the ceiling, new clients are shut down on the spot. A TERM signal
//! closes the listener; running workers finish on their own.

use super::connection::Connection;
use super::handler::Handler;
use super::MAX_CONCURRENCY;
use log::{error, info, warn};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

struct WorkerGuard(Arc<AtomicUsize>);

impl WorkerGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        WorkerGuard(counter)
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The listening end of the proxy.
pub struct Daemon {
    listener: TcpListener,
    active: Arc<AtomicUsize>,
}

impl Daemon {
    /// Bind the listening socket.
    pub fn bind(addr: SocketAddr) -> io::Result<Daemon> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;

        Ok(Daemon {
            listener: socket.into(),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until interrupted.
    pub fn run(&self) -> io::Result<()> {
        let term = Arc::new(AtomicBool::new(false));

        for sig in TERM_SIGNALS {
            // a second signal while shutting down exits immediately
            flag::register_conditional_shutdown(*sig, 1, Arc::clone(&term))?;
            flag::register(*sig, Arc::clone(&term))?;
        }

        info!(
            target: "daemon",
            "proxy is now listening on http://{}",
            self.local_addr()?
        );

        loop {
            match self.listener.accept() {
                Ok((stream, _)) => self.dispatch(stream),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    if term.load(Ordering::Relaxed) {
                        eprintln!();
                        return Ok(());
                    }
                }
                Err(e) => warn!(target: "daemon", "accept failed ({})", e),
            }
        }
    }

    fn dispatch(&self, stream: TcpStream) {
        if self.active.load(Ordering::Acquire) >= MAX_CONCURRENCY {
            warn!(target: "daemon", "maximum number of clients exceeded");
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }

        let guard = WorkerGuard::new(Arc::clone(&self.active));

        let spawned = thread::Builder::new()
            .name("handler".to_string())
            .spawn(move || {
                let _guard = guard;
                Handler::new(Connection::new(stream)).run();
            });

        // a failed spawn drops the closure, closing the socket and
        // rolling the counter back
        if let Err(e) = spawned {
            error!(target: "daemon", "could not spawn handler thread ({})", e);
        }
    }
}
