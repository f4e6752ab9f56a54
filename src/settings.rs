//! Settings
//!
//! The daemon's bind address and port, read from a small ini-style
//! configuration file:
//!
//! ```ini
//! [daemon]
//! listen_addr = 0.0.0.0
//! listen_port = 11811
//! ```
//!
//! A missing or unreadable file is not an error: the defaults are
//! written back (best effort) and used. A file that parses but lacks
//! the section or an option is fatal.

use crate::logging;
use config::{Config, File, FileFormat};
use log::{info, warn};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

pub const DEFAULT_LISTEN_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
pub const DEFAULT_LISTEN_PORT: u16 = 11811;

/// Resolved daemon settings; built once at startup, read-only after.
#[derive(Debug, Clone)]
pub struct Settings {
    listen_addr: IpAddr,
    listen_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            listen_addr: DEFAULT_LISTEN_ADDR,
            listen_port: DEFAULT_LISTEN_PORT,
        }
    }
}

impl Settings {
    /// Load settings from `path`, falling back to defaults as
    /// described in the module docs.
    pub fn load(path: &Path) -> Settings {
        let mut settings = Settings::default();

        let parsed = Config::builder()
            .add_source(File::from(path).format(FileFormat::Ini))
            .build();

        let parser = match parsed {
            Ok(parser) => parser,
            Err(_) => {
                info!(
                    target: "config",
                    "{}:writing default configuration file",
                    path.display()
                );
                settings.write_defaults(path);
                return settings;
            }
        };

        let addr = match parser.get_string("daemon.listen_addr") {
            Ok(addr) => addr,
            Err(_) => logging::crit("config", "daemon:listen_addr:missing option"),
        };

        let port = match parser.get_string("daemon.listen_port") {
            Ok(port) => port,
            Err(_) => logging::crit("config", "daemon:listen_port:missing option"),
        };

        settings.set_listen_addr(&addr);
        settings.set_listen_port(&port);

        settings
    }

    fn write_defaults(&self, path: &Path) {
        let contents = format!(
            "[daemon]\nlisten_addr = {}\nlisten_port = {}\n",
            self.listen_addr, self.listen_port
        );

        if fs::write(path, contents).is_err() {
            warn!(
                target: "config",
                "could not write settings into {}",
                path.display()
            );
        }
    }

    fn set_listen_addr(&mut self, value: &str) {
        match value.parse::<IpAddr>() {
            Ok(addr) => self.listen_addr = addr,
            Err(_) => warn!(
                target: "config",
                "daemon:listen_addr:{} is not a valid ip address",
                value
            ),
        }
    }

    fn set_listen_port(&mut self, value: &str) {
        let port = match value.parse::<u32>() {
            Ok(port) => port,
            Err(_) => logging::crit(
                "config",
                &format!("daemon:listen_port:{}:non-numeric value", value),
            ),
        };

        if port > u16::MAX as u32 {
            logging::crit(
                "config",
                &format!("daemon:listen_port:{}:not a valid port number", port),
            );
        }

        if (1..1024).contains(&port) {
            warn!(
                target: "config",
                "daemon:listen_port:{}:administrative privileges required",
                port
            );
        }

        self.listen_port = port as u16;
    }

    pub fn listen_addr(&self) -> IpAddr {
        self.listen_addr
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn listen_address(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.listen_port)
    }
}
