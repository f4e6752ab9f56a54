//! HTTP headers handling
//!
//! This module provides a type for managing HTTP headers with
//! case-insensitive lookups. Original name casing is preserved for
//! output, and iteration follows a fixed priority order so forwarded
//! messages always lead with the headers proxies care about.

use super::{Error, Result, HEADER_PRIORITY};
use std::fmt;

/// HTTP headers collection
///
/// Headers are stored in insertion order and support:
/// - Case-insensitive lookups, replacement and removal
/// - Stable output casing (the first-set spelling of a name wins)
/// - Priority-ordered iteration
#[derive(Debug, Clone, Default)]
pub struct Headers {
    headers: Vec<(String, String)>,
}

impl Headers {
    /// Create a new empty headers collection
    pub fn new() -> Self {
        Headers {
            headers: Vec::new(),
        }
    }

    /// Set a header, replacing any existing value under the same name
    /// compared case-insensitively. The value is stored trimmed. A
    /// replaced header keeps its original spelling and position.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into().trim().to_string();

        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(slot) => slot.1 = value,
            None => self.headers.push((name, value)),
        }
    }

    /// Get the value for a header (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Check if a header exists
    pub fn contains(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Remove a header (case-insensitive); returns true if one was removed
    pub fn remove(&mut self, name: &str) -> bool {
        let initial_len = self.headers.len();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.len() != initial_len
    }

    /// Get the number of headers
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Check if there are no headers
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Iterate over all headers
    ///
    /// Priority names come first, in the order of the priority list;
    /// the remaining headers follow in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        let listed = HEADER_PRIORITY.iter().filter_map(|p| {
            self.headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(p))
        });

        let rest = self.headers.iter().filter(|(n, _)| {
            !HEADER_PRIORITY.iter().any(|p| p.eq_ignore_ascii_case(n))
        });

        listed.chain(rest).map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Parse a `Name: value` line into its parts
    ///
    /// Splits on the first colon; the value is returned untrimmed
    /// (trimming happens in `set`).
    pub fn parse(line: &str) -> Result<(String, String)> {
        match line.find(':') {
            Some(pos) => Ok((line[..pos].to_string(), line[pos + 1..].to_string())),
            None => Err(Error::Header {
                code: 400,
                reason: "missing colon".to_string(),
            }),
        }
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter() {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        Ok(())
    }
}
