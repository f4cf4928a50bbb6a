//! Broker list parsing and endpoint resolution.
//!
//! The broker list is a comma-separated string of entries, loosely based on
//! RFC 3986 authority syntax:
//!
//! ```text
//! hosts := host_entry (',' host_entry)*
//! host_entry := WS* host (':' port)? path? WS*
//! host  := [-a-zA-Z_0-9._~]+
//! port  := [0-9]+
//! path  := '/' [-a-zA-Z_0-9._~]*
//! ```
//!
//! Malformed entries are dropped silently up to the next comma. A non-empty
//! path selects the WebSocket transport with that upgrade target.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::lookup_host;

use crate::error::{ClientError, Result};

/// Per-attempt DNS resolution deadline.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// One broker endpoint: host, port and optional WebSocket path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broker {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl fmt::Display for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.host, self.port, self.path)
    }
}

fn is_unreserved(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~')
}

/// Parse one `host (':' port)? path?` entry. Returns `None` on any syntax
/// violation, which drops the entry.
fn parse_entry(entry: &str, default_port: u16) -> Option<Broker> {
    let entry = entry.trim();
    let mut chars = entry.char_indices().peekable();

    let mut host_end = 0;
    while let Some(&(i, c)) = chars.peek() {
        if is_unreserved(c) {
            host_end = i + c.len_utf8();
            chars.next();
        } else {
            break;
        }
    }
    if host_end == 0 {
        return None;
    }
    let host = &entry[..host_end];
    let mut rest = &entry[host_end..];

    let port = if let Some(stripped) = rest.strip_prefix(':') {
        let digits_end = stripped
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(stripped.len());
        if digits_end == 0 {
            return None;
        }
        let port = stripped[..digits_end].parse::<u16>().ok()?;
        rest = &stripped[digits_end..];
        port
    } else {
        default_port
    };

    let path = if let Some(stripped) = rest.strip_prefix('/') {
        let path_end = stripped
            .find(|c: char| !is_unreserved(c))
            .unwrap_or(stripped.len());
        if path_end != stripped.len() {
            return None;
        }
        rest = "";
        format!("/{}", &stripped[..path_end])
    } else {
        String::new()
    };

    if !rest.is_empty() {
        return None;
    }

    Some(Broker {
        host: host.to_string(),
        port,
        path,
    })
}

/// Parse a comma-separated broker list, dropping malformed entries.
pub fn parse_brokers(hosts: &str, default_port: u16) -> Vec<Broker> {
    hosts
        .split(',')
        .filter_map(|entry| parse_entry(entry, default_port))
        .collect()
}

/// Round-robin cursor over the broker list.
///
/// [`Endpoints::next_endpoint`] hands out each broker once; after a full
/// pass it signals [`ClientError::TryAgain`] so the caller can back off,
/// then wraps to the start.
#[derive(Debug)]
pub struct Endpoints {
    servers: Vec<Broker>,
    current: isize,
}

impl Endpoints {
    pub fn new(hosts: &str, default_port: u16) -> Self {
        Self {
            servers: parse_brokers(hosts, default_port),
            current: -1,
        }
    }

    fn next(&mut self) -> Result<Broker> {
        if self.servers.is_empty() {
            return Err(ClientError::HostNotFound);
        }
        self.current += 1;
        if self.current as usize >= self.servers.len() {
            self.current = -1;
            return Err(ClientError::TryAgain);
        }
        Ok(self.servers[self.current as usize].clone())
    }

    /// Advance to the next broker that resolves.
    ///
    /// DNS resolution races a [`RESOLVE_TIMEOUT`] timer; entries that fail or
    /// time out are skipped within the same pass. Errors:
    /// [`ClientError::HostNotFound`] for an empty list,
    /// [`ClientError::TryAgain`] once a full pass completes.
    pub async fn next_endpoint(&mut self) -> Result<(Vec<SocketAddr>, Broker)> {
        loop {
            let broker = self.next()?;
            let lookup = tokio::time::timeout(
                RESOLVE_TIMEOUT,
                lookup_host((broker.host.clone(), broker.port)),
            )
            .await;
            match lookup {
                Ok(Ok(addrs)) => {
                    let addrs: Vec<SocketAddr> = addrs.collect();
                    if !addrs.is_empty() {
                        return Ok((addrs, broker));
                    }
                }
                Ok(Err(e)) => {
                    log::debug!("resolving {broker} failed: {e}");
                }
                Err(_) => {
                    log::debug!("resolving {broker} timed out");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ports_and_paths() {
        let brokers = parse_brokers("broker.a.example:1883,tls.b.example/ws", 8883);
        assert_eq!(
            brokers,
            vec![
                Broker {
                    host: "broker.a.example".into(),
                    port: 1883,
                    path: String::new(),
                },
                Broker {
                    host: "tls.b.example".into(),
                    port: 8883,
                    path: "/ws".into(),
                },
            ]
        );
    }

    #[test]
    fn tolerates_whitespace() {
        let brokers = parse_brokers("  one.example:1 , two.example  ", 1883);
        assert_eq!(brokers.len(), 2);
        assert_eq!(brokers[0].host, "one.example");
        assert_eq!(brokers[0].port, 1);
        assert_eq!(brokers[1].port, 1883);
    }

    #[test]
    fn drops_malformed_entries() {
        // bad port, bad host char, port overflow, empty entry
        let brokers = parse_brokers(
            "ok.example,bad.example:,spa ced.example,huge.example:70000,,last.example:9/p",
            1883,
        );
        let hosts: Vec<&str> = brokers.iter().map(|b| b.host.as_str()).collect();
        assert_eq!(hosts, vec!["ok.example", "last.example"]);
        assert_eq!(brokers[1].port, 9);
        assert_eq!(brokers[1].path, "/p");
    }

    #[test]
    fn canonical_form_round_trips() {
        let input = "a.example:1883/ws, b.example:8080,c.example:1/";
        let brokers = parse_brokers(input, 1883);
        let canonical = brokers
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(",");
        assert_eq!(parse_brokers(&canonical, 1883), brokers);
    }

    #[test]
    fn empty_path_kept_distinct_from_no_path() {
        let brokers = parse_brokers("a.example/", 1883);
        assert_eq!(brokers[0].path, "/");
    }

    #[tokio::test]
    async fn empty_list_is_host_not_found() {
        let mut eps = Endpoints::new("", 1883);
        assert!(matches!(
            eps.next_endpoint().await,
            Err(ClientError::HostNotFound)
        ));
    }

    #[tokio::test]
    async fn full_pass_signals_try_again_then_wraps() {
        let mut eps = Endpoints::new("127.0.0.1:1883,127.0.0.2:1884", 1883);
        let (_, first) = eps.next_endpoint().await.unwrap();
        assert_eq!(first.host, "127.0.0.1");
        let (_, second) = eps.next_endpoint().await.unwrap();
        assert_eq!(second.host, "127.0.0.2");
        assert!(matches!(
            eps.next_endpoint().await,
            Err(ClientError::TryAgain)
        ));
        // wraps around after the failed pass
        let (_, again) = eps.next_endpoint().await.unwrap();
        assert_eq!(again.host, "127.0.0.1");
    }
}
